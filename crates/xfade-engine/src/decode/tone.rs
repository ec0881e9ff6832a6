use std::collections::HashMap;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use super::{Decoder, DecoderFactory, TrackMetadata};
use crate::block::AudioBlock;

const BLOCK_FRAMES: usize = 1024;
const AMPLITUDE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneSpec {
    pub frequency: f64,
    /// Seconds.
    pub duration: f64,
}

/// Sine generator that behaves like a decoded track.
pub struct ToneDecoder {
    path: PathBuf,
    spec: Option<ToneSpec>,
    sample_rate: u32,
    channels: usize,
    metadata: TrackMetadata,
    /// Next frame to generate; negative while seeking into leading silence.
    frame: i64,
    total_frames: i64,
    opened: bool,
}

impl ToneDecoder {
    pub fn new(path: &Path, spec: Option<ToneSpec>, sample_rate: u32, channels: usize) -> Self {
        let total_frames = spec
            .map(|s| (s.duration * sample_rate as f64).round() as i64)
            .unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            spec,
            sample_rate,
            channels: channels.max(1),
            metadata: TrackMetadata::default(),
            frame: 0,
            total_frames,
            opened: false,
        }
    }
}

impl Decoder for ToneDecoder {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load_metadata(&mut self) -> Result<()> {
        let spec = self
            .spec
            .ok_or_else(|| anyhow!("no tone registered for {:?}", self.path))?;
        self.metadata = TrackMetadata {
            title: format!("{} Hz", spec.frequency),
            artist: "tone".to_string(),
            ..Default::default()
        };
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        self.load_metadata()?;
        self.frame = 0;
        self.opened = true;
        Ok(())
    }

    fn next_block(&mut self) -> AudioBlock {
        let Some(spec) = self.spec.filter(|_| self.opened) else {
            return AudioBlock::new(self.channels);
        };
        if self.frame < 0 {
            let frames = (-self.frame).min(BLOCK_FRAMES as i64);
            self.frame += frames;
            return AudioBlock::silence(self.channels, frames as usize);
        }
        let frames = (self.total_frames - self.frame).clamp(0, BLOCK_FRAMES as i64) as usize;
        let step = TAU * spec.frequency / self.sample_rate as f64;
        let start = self.frame;
        let wave: Vec<f32> = (0..frames)
            .map(|i| (AMPLITUDE * ((start + i as i64) as f64 * step).sin()) as f32)
            .collect();
        self.frame += frames as i64;
        AudioBlock::from_channels(vec![wave; self.channels])
    }

    fn is_done(&self) -> bool {
        self.frame >= self.total_frames
    }

    fn seek(&mut self, time: f64) -> bool {
        if !self.opened || !time.is_finite() {
            return false;
        }
        self.frame = ((time * self.sample_rate as f64).round() as i64).min(self.total_frames);
        true
    }

    fn position(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    fn duration(&self) -> f64 {
        self.total_frames as f64 / self.sample_rate as f64
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }
}

/// Maps paths to tones; unregistered paths fail to open.
#[derive(Clone, Debug)]
pub struct ToneFactory {
    sample_rate: u32,
    channels: usize,
    tones: HashMap<PathBuf, ToneSpec>,
}

impl ToneFactory {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            tones: HashMap::new(),
        }
    }

    pub fn with_tone(mut self, path: impl Into<PathBuf>, frequency: f64, duration: f64) -> Self {
        self.tones.insert(
            path.into(),
            ToneSpec {
                frequency,
                duration,
            },
        );
        self
    }
}

impl DecoderFactory for ToneFactory {
    fn create(&self, path: &Path) -> Box<dyn Decoder> {
        Box::new(ToneDecoder::new(
            path,
            self.tones.get(path).copied(),
            self.sample_rate,
            self.channels,
        ))
    }
}
