pub mod block;
pub mod config;
pub mod crossfade;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hold_back;
pub mod output;
pub mod request;
pub mod resample;
pub mod sink;
pub mod status;
pub mod stretch;
