mod cli;
mod error;
mod output;
mod player;
mod playlist;

use std::collections::HashMap;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streaming_engine::media::ContentType;
use streaming_engine::{
    FailureCallback, MediaSink, NetworkingEngine, PlayerInterface, SchemeRegistry, StreamingConfig, StreamingEngine,
};
use tokio::time::Instant;
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::output::FileSink;
use crate::player::SimulatedPlayer;

/// How often the simulated playhead moves.
const PLAYHEAD_TICK: Duration = Duration::from_millis(250);

/// Why the playback loop ended.
#[derive(Debug)]
enum Stop {
    Ended,
    TimeLimit,
    Interrupted,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<StreamingConfig> {
    let Some(path) = path else {
        return Ok(StreamingConfig::default());
    };
    let text = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&text)?;
    info!(path = %path.display(), "Loaded streaming configuration");
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    if args.rate.is_nan() || args.rate <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "playback rate must be positive, got {}",
            args.rate
        )));
    }
    let url = Url::parse(&args.url).map_err(|e| AppError::InvalidInput(format!("invalid URL: {e}")))?;

    let mut config = load_config(args.config.as_deref())?;
    config.low_latency_mode |= args.low_latency;
    if let Some(limit) = args.prefetch {
        config.segment_prefetch_limit = limit;
    }
    config.failure_callback = Some(FailureCallback::new(|e| {
        error!(error = %e, "Unhandled streaming failure");
    }));

    let net = NetworkingEngine::new(Arc::new(SchemeRegistry::with_http()?));
    let presentation = playlist::load(&net, &url, &config.retry_parameters).await?;

    let sink = Arc::new(FileSink::new(args.output_dir.clone(), args.name.clone()));
    let player = Arc::new(SimulatedPlayer::new(args.start, args.rate, args.bandwidth));
    let engine = StreamingEngine::new(presentation.manifest, player.clone(), sink.clone(), net);
    engine.configure(config);
    engine.switch_variant(presentation.variant, false, 0.0, false, false);
    engine.start(HashMap::new()).await?;

    let stop = play(&player, &sink, presentation.end_time, args.play_for).await;
    info!(reason = ?stop, position = player.presentation_time(), "Stopping");
    engine.destroy().await;

    let metrics = engine.metrics().snapshot();
    info!(
        segments = metrics.segments_appended,
        init_segments = metrics.init_segments_appended,
        bytes = sink.bytes_written(),
        prefetch_hits = metrics.prefetch_hits,
        retries = metrics.network_retries,
        output = %args.output_dir.display(),
        "Streaming finished"
    );
    Ok(())
}

/// Move the playhead until the presentation ends, the time limit passes or
/// the user interrupts.
async fn play(player: &SimulatedPlayer, sink: &FileSink, end_time: f64, play_for: Option<f64>) -> Stop {
    let started_at = player.presentation_time();
    let mut ticker = tokio::time::interval(PLAYHEAD_TICK);
    let mut last_tick = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = now.duration_since(last_tick).as_secs_f64();
                last_tick = now;

                let position = player.presentation_time();
                let ahead = sink.buffered_ahead_of(ContentType::Video, position);
                let position = player.advance(elapsed, ahead);
                if position >= end_time {
                    return Stop::Ended;
                }
                if play_for.is_some_and(|limit| position - started_at >= limit) {
                    return Stop::TimeLimit;
                }
            }
            _ = &mut ctrl_c => {
                return Stop::Interrupted;
            }
        }
    }
}
