//! Front-end runtime: engine construction, the pipe/play/render modes and status printing.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use xfade_engine::decode::FileDecoderFactory;
use xfade_engine::device;
use xfade_engine::engine::Engine;
use xfade_engine::output::{CpalOutput, OutputBackend, WavOutput};
use xfade_engine::request::PlaybackListener;
use xfade_engine::status::TrackStatus;

use crate::config::AppConfig;

/// How often the play/render loops check for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Seconds of track time between two printed positions.
const POSITION_PRINT_INTERVAL: f64 = 1.0;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// `MM:SS.ss`
pub fn format_time(secs: f64) -> String {
    let secs = secs.max(0.0);
    let minutes = (secs / 60.0).floor();
    format!("{:02}:{:05.2}", minutes as u64, secs - minutes * 60.0)
}

/// Prints "Now playing" and position lines on stdout.
pub struct StatusPrinter {
    quiet_position: bool,
    last_printed: Mutex<Option<f64>>,
}

impl StatusPrinter {
    pub fn new(quiet_position: bool) -> Self {
        Self {
            quiet_position,
            last_printed: Mutex::new(None),
        }
    }

    fn print(line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl PlaybackListener for StatusPrinter {
    fn on_metadata_loaded(&self, status: &TrackStatus) {
        *self.last_printed.lock().unwrap() = None;
        let artist = if status.metadata.artist.is_empty() {
            "unknown artist"
        } else {
            &status.metadata.artist
        };
        Self::print(&format!("Now playing: {} by {}", status.metadata.title, artist));
    }

    fn on_position_update(&self, status: &TrackStatus) {
        if self.quiet_position {
            return;
        }
        let mut last = self.last_printed.lock().unwrap();
        if last.is_some_and(|p| (status.position - p).abs() < POSITION_PRINT_INTERVAL) {
            return;
        }
        *last = Some(status.position);
        Self::print(&format!(
            "Position: {}/{}",
            format_time(status.position),
            format_time(status.duration)
        ));
    }
}

fn build_engine(config: &AppConfig, backend: Box<dyn OutputBackend>) -> Engine {
    let sink = &config.engine.sink;
    let factory = FileDecoderFactory::new(sink.sample_rate, sink.channels, config.engine.decode);
    Engine::new(
        &config.engine,
        backend,
        Arc::new(factory),
        Arc::new(StatusPrinter::new(config.quiet_position)),
    )
}

fn hardware_output(config: &AppConfig) -> Box<dyn OutputBackend> {
    Box::new(CpalOutput::new(
        config.device.clone(),
        config.engine.sink.frames_per_buffer,
    ))
}

/// Ctrl-C notifications as a channel.
fn interrupt_channel() -> Receiver<()> {
    let (tx, rx) = bounded(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    }) {
        tracing::warn!("cannot install ctrl-c handler: {err}");
    }
    rx
}

/// Wait until everything queued has been played, or until interrupted.
fn wait_for_completion(engine: &Engine, interrupts: &Receiver<()>) {
    let sink = engine.sink();
    loop {
        select! {
            recv(interrupts) -> _ => {
                tracing::info!("interrupted");
                return;
            }
            default(POLL_INTERVAL) => {
                if engine.queue().is_idle() && sink.wait_until_drained(Duration::ZERO) {
                    return;
                }
            }
        }
    }
}

fn report_stats(engine: &Engine) {
    let stats = engine.sink().stats();
    tracing::info!(
        played = %format_time(stats.elapsed_ms() as f64 / 1000.0),
        underrun_events = stats.underrun_events,
        underrun_frames = stats.underrun_frames,
        "playback finished"
    );
}

fn run_files(config: &AppConfig, backend: Box<dyn OutputBackend>, files: &[PathBuf]) -> Result<()> {
    let interrupts = interrupt_channel();
    let mut engine = build_engine(config, backend);
    engine.start().context("start audio output")?;
    for file in files {
        engine.queue().play(file);
    }
    wait_for_completion(&engine, &interrupts);
    report_stats(&engine);
    engine.shutdown();
    Ok(())
}

/// Play `files` in order on the output device.
pub fn run_play(config: &AppConfig, files: &[PathBuf]) -> Result<()> {
    run_files(config, hardware_output(config), files)
}

/// Render `files` in order into `output`.
pub fn run_render(config: &AppConfig, output: PathBuf, files: &[PathBuf]) -> Result<()> {
    run_files(config, Box::new(WavOutput::new(output)), files)
}

/// Play every path read from stdin until stdin closes (then finish the queue) or ctrl-c.
pub fn run_pipe(config: &AppConfig) -> Result<()> {
    let interrupts = interrupt_channel();
    let mut engine = build_engine(config, hardware_output(config));
    engine.start().context("start audio output")?;

    let (line_tx, lines) = unbounded::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("stdin read failed: {err}");
                    break;
                }
            }
        }
    });

    loop {
        select! {
            recv(lines) -> line => match line {
                Ok(line) => {
                    let path = line.trim();
                    if !path.is_empty() {
                        engine.queue().play(path);
                    }
                }
                Err(_) => {
                    tracing::debug!("stdin closed");
                    wait_for_completion(&engine, &interrupts);
                    break;
                }
            },
            recv(interrupts) -> _ => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    report_stats(&engine);
    engine.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_hundredths() {
        assert_eq!(format_time(0.0), "00:00.00");
        assert_eq!(format_time(65.25), "01:05.25");
        assert_eq!(format_time(3599.5), "59:59.50");
        assert_eq!(format_time(-1.0), "00:00.00");
    }

    #[test]
    fn position_lines_are_throttled() {
        let printer = StatusPrinter::new(false);
        let mut status = TrackStatus {
            duration: 10.0,
            ..Default::default()
        };
        printer.on_position_update(&status);
        assert_eq!(*printer.last_printed.lock().unwrap(), Some(0.0));
        status.position = 0.5;
        printer.on_position_update(&status);
        assert_eq!(*printer.last_printed.lock().unwrap(), Some(0.0));
        status.position = 1.2;
        printer.on_position_update(&status);
        assert_eq!(*printer.last_printed.lock().unwrap(), Some(1.2));
    }
}
