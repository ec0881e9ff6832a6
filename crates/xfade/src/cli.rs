use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "xfade", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML file with [sink], [crossfade] and [decode] sections
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output sample rate in Hz (the device must support it)
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Length of a plain crossfade in seconds
    #[arg(long)]
    pub xfade_duration: Option<f64>,

    /// Play tracks back to back
    #[arg(long)]
    pub no_xfade: bool,

    /// Beat-synchronized crossfades when both tracks have a .bpm file
    #[arg(long)]
    pub dj: bool,

    /// Hold each track's tempo until the beatgrids overlap
    #[arg(long)]
    pub pessimistic_tempo: bool,

    /// Volume curve applied during crossfades
    #[arg(long, value_enum)]
    pub fade_map: Option<FadeMapArg>,

    /// Click removal window in seconds
    #[arg(long)]
    pub click_interval: Option<f32>,

    /// Do not smooth block boundaries
    #[arg(long)]
    pub no_click_removal: bool,

    /// Only print track changes, not the running position
    #[arg(long)]
    pub quiet_position: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read one file path per line from stdin and play each
    Pipe,

    /// Play files in order, then exit
    Play {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Render files in order into a 32-bit float WAV file
    Render {
        #[arg(long, short)]
        output: PathBuf,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FadeMapArg {
    Linear,
    Knee,
}
