//! Engine tuning parameters.
//!
//! Every struct has a `Default` holding the engine constants; the binary overlays values read from
//! its TOML file and command line.

use crate::crossfade::fade_map::FadeMap;
use crate::filter::{DEFAULT_TIME_INTERVAL, FilterKind};

/// Sink format and buffering.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Sample rate every producer must deliver, in Hz.
    pub sample_rate: u32,
    /// Channel count every producer must deliver.
    pub channels: usize,
    /// Blocks that must be queued before playback (re)starts after an underrun.
    pub min_playback_blocks: usize,
    /// Producers block once this many blocks are queued.
    pub queue_capacity_blocks: usize,
    /// Requested hardware buffer size, in frames.
    pub frames_per_buffer: u32,
    /// `None` disables click removal.
    pub click_removal: Option<ClickRemovalConfig>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            min_playback_blocks: 32,
            queue_capacity_blocks: 64,
            frames_per_buffer: 256,
            click_removal: Some(ClickRemovalConfig::default()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClickRemovalConfig {
    pub kind: FilterKind,
    /// Smoothing window, in seconds.
    pub time_interval: f32,
}

impl Default for ClickRemovalConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::CubicHermite,
            time_interval: DEFAULT_TIME_INTERVAL,
        }
    }
}

/// Crossfade behaviour; snapshotted by each candidate crossfade when it is built.
#[derive(Clone, Copy, Debug)]
pub struct CrossfadeSettings {
    pub normal_enabled: bool,
    pub dj_enabled: bool,
    /// Length of a plain crossfade, in seconds.
    pub duration: f64,
    /// Blend tempos over the shorter beatgrid instead of the whole fade.
    pub optimistic_tempo: bool,
    pub fade_map: FadeMap,
    /// Frames per stretcher chunk.
    pub chunk_frames: usize,
}

impl Default for CrossfadeSettings {
    fn default() -> Self {
        Self {
            normal_enabled: true,
            dj_enabled: false,
            duration: 5.0,
            optimistic_tempo: true,
            fade_map: FadeMap::Linear,
            chunk_frames: 512,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecodeConfig {
    /// Input chunk size of the sample-rate converter, in frames.
    pub resample_chunk_frames: usize,
    /// Largest silence block produced while seeking to a negative time.
    pub seek_silence_frames: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            resample_chunk_frames: 1024,
            seek_silence_frames: 1024,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub sink: SinkConfig,
    pub crossfade: CrossfadeSettings,
    pub decode: DecodeConfig,
}
