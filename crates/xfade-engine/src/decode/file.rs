//! Symphonia-backed file decoder.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::{Hint, ProbeResult};
use symphonia::core::units::Time;

use super::{Decoder, DecoderFactory, TrackMetadata};
use crate::block::AudioBlock;
use crate::config::DecodeConfig;
use crate::resample::StreamResampler;

/// Creates [`AudioFile`]s delivering the sink's format.
#[derive(Clone, Debug)]
pub struct FileDecoderFactory {
    sample_rate: u32,
    channels: usize,
    config: DecodeConfig,
}

impl FileDecoderFactory {
    pub fn new(sample_rate: u32, channels: usize, config: DecodeConfig) -> Self {
        Self {
            sample_rate,
            channels,
            config,
        }
    }
}

impl DecoderFactory for FileDecoderFactory {
    fn create(&self, path: &Path) -> Box<dyn Decoder> {
        Box::new(AudioFile::new(
            path,
            self.sample_rate,
            self.channels,
            self.config,
        ))
    }
}

struct DecodeState {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    codec_params: CodecParameters,
    track_id: u32,
    resampler: Option<StreamResampler>,
    /// Output frames still to drop after an accurate seek.
    trim_frames: usize,
    eof: bool,
}

/// Decodes one audio file into sink-format blocks.
pub struct AudioFile {
    path: PathBuf,
    sample_rate: u32,
    channels: usize,
    config: DecodeConfig,
    metadata: TrackMetadata,
    duration: f64,
    position: f64,
    silence_frames: usize,
    state: Option<DecodeState>,
    done: bool,
}

impl AudioFile {
    pub fn new(path: &Path, sample_rate: u32, channels: usize, config: DecodeConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            sample_rate,
            channels: channels.max(1),
            config,
            metadata: TrackMetadata::default(),
            duration: 0.0,
            position: 0.0,
            silence_frames: 0,
            state: None,
            done: false,
        }
    }

    fn probe(&self) -> Result<ProbeResult> {
        let file = File::open(&self.path).with_context(|| format!("open {:?}", self.path))?;
        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe {:?}", self.path))
    }

    fn read_metadata(&mut self, probed: &mut ProbeResult) {
        let mut meta = TrackMetadata::default();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            apply_tags(&mut meta, rev);
        }
        if let Some(rev) = probed.format.metadata().current() {
            apply_tags(&mut meta, rev);
        }
        meta.fill_title_from(&self.path);
        self.metadata = meta;

        if let Some(track) = probed.format.default_track() {
            self.duration = duration_secs_from_codec_params(&track.codec_params).unwrap_or(0.0);
        }
    }

    fn make_resampler(&self, params: &CodecParameters) -> Result<Option<StreamResampler>> {
        let src_rate = params.sample_rate.ok_or_else(|| anyhow!("Unknown sample rate"))?;
        if src_rate == self.sample_rate {
            return Ok(None);
        }
        let src_channels = params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        StreamResampler::new(
            src_rate,
            self.sample_rate,
            src_channels,
            self.config.resample_chunk_frames,
        )
        .map(Some)
    }

    /// Reposition the demuxer at `time` (>= 0) and return the time actually reached.
    fn seek_source(&mut self, time: f64) -> Result<f64> {
        let resampler = match &self.state {
            Some(state) => self.make_resampler(&state.codec_params)?,
            None => return Err(anyhow!("track not open")),
        };
        let Some(state) = self.state.as_mut() else {
            return Err(anyhow!("track not open"));
        };

        let secs = time.trunc();
        let target = Time::new(secs as u64, time - secs);
        let seeked = state
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: target,
                    track_id: Some(state.track_id),
                },
            )
            .context("seek")?;
        state.decoder.reset();
        state.resampler = resampler;
        state.eof = false;

        let actual = match (state.codec_params.time_base, state.codec_params.sample_rate) {
            (Some(tb), _) => {
                let t = tb.calc_time(seeked.actual_ts);
                t.seconds as f64 + t.frac
            }
            (None, Some(rate)) if rate > 0 => seeked.actual_ts as f64 / rate as f64,
            _ => time,
        };
        state.trim_frames = ((time - actual).max(0.0) * self.sample_rate as f64).round() as usize;
        Ok(actual.max(time))
    }

    /// Decode until a non-empty sink-format block is available.
    fn decode_block(&mut self) -> Option<AudioBlock> {
        let state = self.state.as_mut()?;
        loop {
            if state.eof {
                return None;
            }
            let samples = match state.format.next_packet() {
                Ok(packet) => {
                    if packet.track_id() != state.track_id {
                        continue;
                    }
                    let decoded = match state.decoder.decode(&packet) {
                        Ok(d) => d,
                        Err(SymphoniaError::DecodeError(err)) => {
                            tracing::debug!(path = ?self.path, "skipping bad packet: {err}");
                            continue;
                        }
                        Err(err) => {
                            tracing::warn!(path = ?self.path, "decode failed: {err}");
                            state.eof = true;
                            continue;
                        }
                    };
                    let mut buf =
                        SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
                    buf.copy_interleaved_ref(decoded);
                    match state.resampler.as_mut() {
                        Some(rs) => rs.process(buf.samples()),
                        None => Ok(buf.samples().to_vec()),
                    }
                }
                Err(_) => {
                    state.eof = true;
                    match state.resampler.as_mut() {
                        Some(rs) => rs.flush(),
                        None => Ok(Vec::new()),
                    }
                }
            };
            let samples = match samples {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(path = ?self.path, "resample failed: {err:#}");
                    state.eof = true;
                    continue;
                }
            };

            let src_channels = state
                .codec_params
                .channels
                .map(|c| c.count())
                .unwrap_or(self.channels);
            let mut block = AudioBlock::from_interleaved(&samples, src_channels);
            block.remap_channels(self.channels);

            if state.trim_frames > 0 {
                let cut = state.trim_frames.min(block.len());
                block = block.split(cut);
                state.trim_frames -= cut;
            }
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
}

impl Decoder for AudioFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load_metadata(&mut self) -> Result<()> {
        let mut probed = self.probe()?;
        self.read_metadata(&mut probed);
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        let mut probed = self.probe()?;
        self.read_metadata(&mut probed);

        let track = probed
            .format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let codec_params = track.codec_params.clone();
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .context("create decoder")?;
        let resampler = self.make_resampler(&codec_params)?;

        tracing::info!(
            path = ?self.path,
            codec = codec_name_from_params(&codec_params).unwrap_or("unknown"),
            rate_hz = codec_params.sample_rate.unwrap_or(0),
            resampling = resampler.is_some(),
            duration_s = self.duration,
            "opened track"
        );

        self.state = Some(DecodeState {
            format: probed.format,
            decoder,
            codec_params,
            track_id,
            resampler,
            trim_frames: 0,
            eof: false,
        });
        self.position = 0.0;
        self.silence_frames = 0;
        self.done = false;
        Ok(())
    }

    fn next_block(&mut self) -> AudioBlock {
        if self.silence_frames > 0 {
            let frames = self
                .silence_frames
                .min(self.config.seek_silence_frames.max(1));
            self.silence_frames -= frames;
            self.position += frames as f64 / self.sample_rate as f64;
            if self.silence_frames == 0 {
                self.position = self.position.max(0.0);
            }
            return AudioBlock::silence(self.channels, frames);
        }

        match self.decode_block() {
            Some(block) => {
                self.position += block.len() as f64 / self.sample_rate as f64;
                block
            }
            None => {
                self.done = true;
                AudioBlock::new(self.channels)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn seek(&mut self, time: f64) -> bool {
        if !time.is_finite() {
            return false;
        }
        let target = time.max(0.0);
        match self.seek_source(target) {
            Ok(actual) => {
                self.done = false;
                if time < 0.0 {
                    self.silence_frames = (-time * self.sample_rate as f64).round() as usize;
                    self.position = time;
                } else {
                    self.silence_frames = 0;
                    self.position = actual;
                }
                true
            }
            Err(err) => {
                tracing::warn!(path = ?self.path, time, "seek failed: {err:#}");
                false
            }
        }
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }
}

fn apply_tags(meta: &mut TrackMetadata, rev: &MetadataRevision) {
    for tag in rev.tags() {
        let slot = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => &mut meta.title,
            Some(StandardTagKey::Artist) => &mut meta.artist,
            Some(StandardTagKey::Album) => &mut meta.album,
            Some(StandardTagKey::Date | StandardTagKey::ReleaseDate) => &mut meta.year,
            _ => continue,
        };
        if slot.is_empty() {
            *slot = tag.value.to_string();
        }
    }
}

/// Track length in seconds from codec metadata.
fn duration_secs_from_codec_params(codec_params: &CodecParameters) -> Option<f64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    fn temp_wav(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xfade-{}-{name}.wav", std::process::id()))
    }

    fn drain(file: &mut AudioFile) -> usize {
        let mut frames = 0;
        while !file.is_done() {
            frames += file.next_block().len();
        }
        frames
    }

    #[test]
    fn duration_secs_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_secs_from_codec_params(&params).is_none());
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC"));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }

    #[test]
    fn decodes_wav_at_native_rate() {
        let path = temp_wav("native");
        write_wav(&path, 8_000, 1, 8_000);
        let mut file = AudioFile::new(&path, 8_000, 2, DecodeConfig::default());
        file.open().unwrap();
        assert!((file.duration() - 1.0).abs() < 1e-9);
        assert_eq!(file.metadata().title, path.file_stem().unwrap().to_string_lossy());

        let first = file.next_block();
        assert_eq!(first.channel_count(), 2);
        assert!((file.position() - first.len() as f64 / 8_000.0).abs() < 1e-9);
        let total = first.len() + drain(&mut file);
        assert_eq!(total, 8_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn negative_seek_prepends_silence() {
        let path = temp_wav("negseek");
        write_wav(&path, 8_000, 2, 4_000);
        let mut file = AudioFile::new(&path, 8_000, 2, DecodeConfig::default());
        file.open().unwrap();
        assert!(file.seek(-0.25));
        assert!((file.position() + 0.25).abs() < 1e-9);

        let mut silent = 0;
        loop {
            let block = file.next_block();
            if block.channel(0).iter().any(|s| *s != 0.0) {
                break;
            }
            silent += block.len();
            assert!(block.len() <= 1024);
        }
        assert!(silent >= 2_000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn positive_seek_skips_audio() {
        let path = temp_wav("seek");
        write_wav(&path, 8_000, 2, 8_000);
        let mut file = AudioFile::new(&path, 8_000, 2, DecodeConfig::default());
        file.open().unwrap();
        assert!(file.seek(0.5));
        assert!(file.position() >= 0.5);
        let rest = drain(&mut file);
        assert!((3_900..=4_000).contains(&rest), "rest {rest}");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let mut file = AudioFile::new(
            Path::new("/nonexistent/track.flac"),
            44_100,
            2,
            DecodeConfig::default(),
        );
        assert!(file.open().is_err());
    }
}
