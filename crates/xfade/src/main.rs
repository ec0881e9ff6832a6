//! xfade: plays audio files back to back with crossfades.
//!
//! ## Modes
//! - `pipe`: read file paths from stdin, one per line, and queue each as it arrives.
//! - `play`: queue the given files, play them on the output device and exit.
//! - `render`: like `play`, into a WAV file instead of a device.
//!
//! Tracks are decoded with Symphonia, resampled to the output rate with Rubato and handed to a
//! request processor that crossfades consecutive tracks (beat-synchronized when both have a
//! `.bpm` beatgrid next to them and `--dj` is given).

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xfade::cli::{Args, Command};
use xfade::config::{self, FileConfig};
use xfade::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,xfade=info,xfade_engine=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let file = match args.config.as_deref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = config::resolve(&args, file);

    match &args.cmd {
        Some(Command::Pipe) => runtime::run_pipe(&config),
        Some(Command::Play { files }) => runtime::run_play(&config, files),
        Some(Command::Render { output, files }) => {
            runtime::run_render(&config, output.clone(), files)
        }
        None => bail!("no command given (try --help)"),
    }
}
