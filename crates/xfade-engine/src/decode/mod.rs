//! Per-track PCM producers.
//!
//! A [`Decoder`] yields [`AudioBlock`]s already converted to the sink's rate and channel count.
//! Implementations:
//! - [`file::AudioFile`]: Symphonia demux/decode plus Rubato resampling
//! - [`tone::ToneDecoder`]: synthetic sine, for tests and demos
//!
//! The request processor never names a concrete decoder; it asks a [`DecoderFactory`].

pub mod file;
pub mod tone;

use std::path::Path;

use anyhow::Result;

use crate::block::AudioBlock;

pub use file::{AudioFile, FileDecoderFactory};
pub use tone::{ToneDecoder, ToneFactory};

/// Container tags of a track.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: String,
}

impl TrackMetadata {
    /// Use the file stem when the container has no title.
    pub fn fill_title_from(&mut self, path: &Path) {
        if self.title.trim().is_empty() {
            self.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
    }
}

pub trait Decoder: Send {
    fn path(&self) -> &Path;

    /// Read tags and duration without preparing to decode.
    fn load_metadata(&mut self) -> Result<()>;

    /// Prepare decoding from the start of the track. Also loads metadata.
    fn open(&mut self) -> Result<()>;

    /// Next block of audio; empty once the track is exhausted.
    fn next_block(&mut self) -> AudioBlock;

    fn is_done(&self) -> bool;

    /// Move to `time` seconds. Negative times yield `-time` seconds of silence before the track.
    fn seek(&mut self, time: f64) -> bool;

    /// Track time at the end of the most recently returned block, in seconds.
    fn position(&self) -> f64;

    /// Track length in seconds, `0.0` when unknown.
    fn duration(&self) -> f64;

    fn metadata(&self) -> &TrackMetadata;
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, path: &Path) -> Box<dyn Decoder>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_falls_back_to_file_stem() {
        let mut meta = TrackMetadata::default();
        meta.fill_title_from(Path::new("/music/Some Track.flac"));
        assert_eq!(meta.title, "Some Track");

        let mut tagged = TrackMetadata {
            title: "Tagged".into(),
            ..Default::default()
        };
        tagged.fill_title_from(Path::new("/music/x.flac"));
        assert_eq!(tagged.title, "Tagged");
    }
}
