//! Configuration loading and merging.
//!
//! Values come from three layers, later ones winning: engine defaults, the optional TOML file,
//! command-line flags.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use xfade_engine::config::{ClickRemovalConfig, EngineConfig};
use xfade_engine::crossfade::FadeMap;

use crate::cli::{Args, FadeMapArg};

/// Top-level file configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Output device substring.
    pub device: Option<String>,
    pub sink: Option<SinkSection>,
    pub crossfade: Option<CrossfadeSection>,
    pub decode: Option<DecodeSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SinkSection {
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
    pub min_playback_blocks: Option<usize>,
    pub queue_capacity_blocks: Option<usize>,
    pub frames_per_buffer: Option<u32>,
    /// `false` disables click removal.
    pub click_removal: Option<bool>,
    /// Click removal window in seconds.
    pub click_interval: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CrossfadeSection {
    pub normal_enabled: Option<bool>,
    pub dj_enabled: Option<bool>,
    pub duration: Option<f64>,
    pub optimistic_tempo: Option<bool>,
    /// e.g. `fade_map = { kind = "knee", knee = 0.25, level = 0.75 }`
    pub fade_map: Option<FadeMap>,
    pub chunk_frames: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecodeSection {
    pub resample_chunk_frames: Option<usize>,
    pub seek_silence_frames: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Everything the front-ends need, fully resolved.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub device: Option<String>,
    pub quiet_position: bool,
}

fn set<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

pub fn resolve(args: &Args, file: FileConfig) -> AppConfig {
    let mut engine = EngineConfig::default();

    let mut click_enabled = true;
    let mut click_interval = None;
    if let Some(sink) = file.sink {
        set(&mut engine.sink.sample_rate, sink.sample_rate);
        set(&mut engine.sink.channels, sink.channels);
        set(&mut engine.sink.min_playback_blocks, sink.min_playback_blocks);
        set(&mut engine.sink.queue_capacity_blocks, sink.queue_capacity_blocks);
        set(&mut engine.sink.frames_per_buffer, sink.frames_per_buffer);
        set(&mut click_enabled, sink.click_removal);
        click_interval = sink.click_interval;
    }
    if let Some(xfade) = file.crossfade {
        let c = &mut engine.crossfade;
        set(&mut c.normal_enabled, xfade.normal_enabled);
        set(&mut c.dj_enabled, xfade.dj_enabled);
        set(&mut c.duration, xfade.duration);
        set(&mut c.optimistic_tempo, xfade.optimistic_tempo);
        set(&mut c.fade_map, xfade.fade_map);
        set(&mut c.chunk_frames, xfade.chunk_frames);
    }
    if let Some(decode) = file.decode {
        set(&mut engine.decode.resample_chunk_frames, decode.resample_chunk_frames);
        set(&mut engine.decode.seek_silence_frames, decode.seek_silence_frames);
    }

    set(&mut engine.sink.sample_rate, args.sample_rate);
    set(&mut engine.crossfade.duration, args.xfade_duration);
    if args.no_xfade {
        engine.crossfade.normal_enabled = false;
        engine.crossfade.dj_enabled = false;
    }
    if args.dj {
        engine.crossfade.dj_enabled = true;
    }
    if args.pessimistic_tempo {
        engine.crossfade.optimistic_tempo = false;
    }
    match args.fade_map {
        Some(FadeMapArg::Linear) => engine.crossfade.fade_map = FadeMap::Linear,
        Some(FadeMapArg::Knee) => engine.crossfade.fade_map = FadeMap::knee(),
        None => {}
    }
    if args.no_click_removal {
        click_enabled = false;
    }
    if args.click_interval.is_some() {
        click_interval = args.click_interval;
    }

    engine.sink.click_removal = click_enabled.then(|| {
        let mut click = ClickRemovalConfig::default();
        set(&mut click.time_interval, click_interval);
        click
    });

    AppConfig {
        engine,
        device: normalize_device_name(args.device.clone().or(file.device)),
        quiet_position: args.quiet_position,
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
