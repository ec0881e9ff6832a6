//! Typed errors for the failures callers branch on.
//!
//! Everything environmental (devices, files, codecs) travels as `anyhow::Error`; these enums cover
//! the sink lifecycle and beatgrid parsing, where the caller decides between aborting and
//! degrading to a simpler playback mode.

use std::path::PathBuf;

use thiserror::Error;

/// Errors starting or stopping the [`AudioSink`](crate::sink::AudioSink).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink is already running")]
    AlreadyRunning,

    #[error("output backend failed: {0:#}")]
    Backend(anyhow::Error),
}

/// Errors reading a `.bpm` companion file.
#[derive(Error, Debug)]
pub enum BeatgridError {
    #[error("read beatgrid {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("beatgrid has no {0} marker")]
    MissingMarker(&'static str),

    #[error("malformed beatgrid marker {0:?}")]
    BadMarker(String),

    #[error("beatgrid has no usable beats")]
    NoEntries,

    #[error("beatgrid lists {0} beats")]
    TooManyBeats(usize),
}

pub type SinkResult<T> = Result<T, SinkError>;
