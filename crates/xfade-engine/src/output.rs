//! Output backends that drain a sink.
//!
//! - [`CpalOutput`]: hardware stream; the callback renders from the sink and converts `f32` to the
//!   device sample format, zero-filling underruns
//! - [`WavOutput`]: offline render to a 32-bit float WAV file, as fast as audio is available
//! - [`MemoryOutput`]: like `WavOutput` but into a shared buffer
//! - [`ManualOutput`]: no consumer at all; the caller drives [`SinkHandle::render`]

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::device;
use crate::sink::{RenderCursor, SinkHandle};

/// Frames rendered per iteration by the offline backends.
const PULL_FRAMES: usize = 1024;

/// Consumer side of an [`AudioSink`](crate::sink::AudioSink).
pub trait OutputBackend {
    /// Begin pulling audio from `sink`.
    fn start(&mut self, sink: SinkHandle) -> Result<()>;
    /// Stop pulling. Called after the sink has been marked stopped.
    fn stop(&mut self);
}

/// Backend without a consumer.
#[derive(Debug, Default)]
pub struct ManualOutput;

impl OutputBackend for ManualOutput {
    fn start(&mut self, _sink: SinkHandle) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Hardware output through CPAL.
pub struct CpalOutput {
    device: Option<String>,
    frames_per_buffer: u32,
    stream: Option<cpal::Stream>,
}

impl CpalOutput {
    /// `device` selects by case-insensitive substring; `None` uses the host default.
    pub fn new(device: Option<String>, frames_per_buffer: u32) -> Self {
        Self {
            device,
            frames_per_buffer,
            stream: None,
        }
    }
}

impl OutputBackend for CpalOutput {
    fn start(&mut self, sink: SinkHandle) -> Result<()> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.device.as_deref())?;
        let supported = device::pick_output_config(&device, sink.sample_rate(), sink.channels())?;
        if supported.sample_rate() != sink.sample_rate() {
            bail!(
                "output device cannot run at {} Hz (closest {} Hz)",
                sink.sample_rate(),
                supported.sample_rate()
            );
        }

        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buf) = device::pick_buffer_size(&supported, self.frames_per_buffer) {
            stream_config.buffer_size = buf;
        }
        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            rate_hz = stream_config.sample_rate,
            channels = stream_config.channels,
            format = ?supported.sample_format(),
            "output stream"
        );

        let stream =
            build_output_stream(&device, &stream_config, supported.sample_format(), sink)?;
        stream.play().context("start output stream")?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!("pause output stream: {err}");
            }
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    sink: SinkHandle,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, sink),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, sink),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, sink),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, sink),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder: renders `f32` from the sink, then converts.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: SinkHandle,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let mut cursor = RenderCursor::default();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            scratch.resize(data.len(), 0.0);
            sink.render(&mut cursor, &mut scratch, channels_out);
            for (dst, src) in data.iter_mut().zip(&scratch) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Destination of an offline pull loop.
trait PullTarget: Send + 'static {
    fn write(&mut self, samples: &[f32]) -> Result<()>;
    fn finish(self) -> Result<()>;
}

struct PullThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl PullThread {
    /// Render everything the sink will give until stopped.
    fn spawn<T: PullTarget>(sink: SinkHandle, mut target: T) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            let channels = sink.channels();
            let mut cursor = RenderCursor::default();
            let mut buf = vec![0.0f32; PULL_FRAMES * channels];
            loop {
                let frames = sink.render_available(&mut cursor, &mut buf, channels);
                if frames > 0 {
                    target.write(&buf[..frames * channels])?;
                    continue;
                }
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                sink.wait_for_audio(Duration::from_millis(20));
            }
            target.finish()
        });
        Self { stop, handle }
    }

    fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("offline output failed: {err:#}"),
            Err(_) => tracing::error!("offline output thread panicked"),
        }
    }
}

struct WavTarget {
    writer: hound::WavWriter<BufWriter<File>>,
}

impl PullTarget for WavTarget {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        for s in samples {
            self.writer.write_sample(*s)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.writer.finalize().context("finalize wav")
    }
}

/// Offline render into a 32-bit float WAV file; underruns never insert silence.
pub struct WavOutput {
    path: PathBuf,
    thread: Option<PullThread>,
}

impl WavOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            thread: None,
        }
    }
}

impl OutputBackend for WavOutput {
    fn start(&mut self, sink: SinkHandle) -> Result<()> {
        let spec = hound::WavSpec {
            channels: sink.channels() as u16,
            sample_rate: sink.sample_rate(),
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&self.path, spec)
            .with_context(|| format!("create {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "rendering to wav");
        self.thread = Some(PullThread::spawn(sink, WavTarget { writer }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join();
        }
    }
}

struct MemoryTarget {
    out: Arc<Mutex<Vec<f32>>>,
}

impl PullTarget for MemoryTarget {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        self.out
            .lock()
            .map_err(|_| anyhow!("capture buffer poisoned"))?
            .extend_from_slice(samples);
        Ok(())
    }

    fn finish(self) -> Result<()> {
        Ok(())
    }
}

/// Offline render into memory (interleaved samples).
#[derive(Default)]
pub struct MemoryOutput {
    captured: Arc<Mutex<Vec<f32>>>,
    thread: Option<PullThread>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of everything rendered so far.
    pub fn captured(&self) -> Arc<Mutex<Vec<f32>>> {
        self.captured.clone()
    }
}

impl OutputBackend for MemoryOutput {
    fn start(&mut self, sink: SinkHandle) -> Result<()> {
        let target = MemoryTarget {
            out: self.captured.clone(),
        };
        self.thread = Some(PullThread::spawn(sink, target));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::AudioBlock;
    use crate::config::SinkConfig;
    use crate::sink::AudioSink;

    fn config() -> SinkConfig {
        SinkConfig {
            sample_rate: 8_000,
            channels: 2,
            min_playback_blocks: 4,
            queue_capacity_blocks: 8,
            frames_per_buffer: 64,
            click_removal: None,
        }
    }

    #[test]
    fn memory_output_captures_released_audio() {
        let output = MemoryOutput::new();
        let captured = output.captured();
        let mut sink = AudioSink::new(&config(), Box::new(output));
        sink.start().unwrap();
        let handle = sink.handle();
        for i in 0..3 {
            handle.submit_audio_block(AudioBlock::silence(2, 100 + i));
        }
        handle.release_held_back();
        assert!(handle.wait_until_drained(Duration::from_secs(2)));
        sink.stop();
        assert_eq!(captured.lock().unwrap().len(), (100 + 101 + 102) * 2);
    }

    #[test]
    fn wav_output_writes_float_file() {
        let path = std::env::temp_dir().join(format!("xfade-wav-{}.wav", std::process::id()));
        let mut sink = AudioSink::new(&config(), Box::new(WavOutput::new(&path)));
        sink.start().unwrap();
        let handle = sink.handle();
        handle.submit_audio_block(AudioBlock::from_channels(vec![vec![0.5; 64], vec![-0.5; 64]]));
        handle.release_held_back();
        assert!(handle.wait_until_drained(Duration::from_secs(2)));
        sink.stop();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 128);
        assert_eq!(&samples[..2], &[0.5, -0.5]);
        let _ = std::fs::remove_file(&path);
    }
}
