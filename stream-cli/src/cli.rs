use std::path::PathBuf;

use clap::Parser;

/// Stream an HLS presentation through the streaming engine into local
/// files while a simulated playhead consumes the buffer.
#[derive(Debug, Parser)]
#[command(name = "streamctl", version, about)]
pub struct Args {
    /// Media or master playlist URL
    pub url: String,

    /// Directory receiving the appended media
    #[arg(short, long, default_value = "streamctl-output")]
    pub output_dir: PathBuf,

    /// Base name of the output files
    #[arg(short, long, default_value = "stream")]
    pub name: String,

    /// JSON file with streaming configuration; missing fields keep their defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Initial playhead position in seconds
    #[arg(long, default_value_t = 0.0)]
    pub start: f64,

    /// Simulated playback rate
    #[arg(long, default_value_t = 1.0)]
    pub rate: f64,

    /// Stop after this many seconds of simulated playback
    #[arg(long)]
    pub play_for: Option<f64>,

    /// Bandwidth estimate reported to the engine, in bits per second
    #[arg(long, default_value_t = 5_000_000.0)]
    pub bandwidth: f64,

    /// Append fMP4 segments chunk by chunk
    #[arg(long)]
    pub low_latency: bool,

    /// Override the number of segments prefetched per track
    #[arg(long)]
    pub prefetch: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}
