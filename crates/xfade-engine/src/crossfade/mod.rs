//! Track-to-track transitions: progress calculators, beatgrids, fade maps and the threaded
//! crossfader that mixes two stretched streams.

pub mod beatgrid;
pub mod calculator;
pub mod crossfader;
pub mod fade_map;

pub use beatgrid::{Beatgrid, FadeRole};
pub use calculator::{CrossfadeCalculator, DjCalculator, LinearCalculator};
pub use crossfader::{CrossfadeSession, Crossfader};
pub use fade_map::FadeMap;
