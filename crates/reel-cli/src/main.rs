//! Reel CLI
//!
//! Command-line interface for the Reel session replay pipeline.
//! This binary plays a recorded event stream through a replay and
//! delivers the resulting segments (or prints them with `--dry-run`).

use clap::Parser;
use reel_core::events::StdoutEventSink;
use reel_core::{
    Clock, Dsn, HttpTransport, MemorySessionStore, ReplayConfig, ReplayContainer, SessionStore,
    SledSessionStore, StopOptions, Transport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod dry_run;
mod player;

/// Reel - session replay capture and delivery
///
/// Play a JSONL file of recorder events through a replay and send the
/// resulting segments.
#[derive(Parser, Debug)]
#[command(name = "reel")]
#[command(version, about, long_about = None)]
struct Args {
    /// Recorded events, one JSON event per line
    #[arg(short, long)]
    input: PathBuf,

    /// Where segments are sent
    #[arg(long, env = "REEL_DSN")]
    dsn: Option<String>,

    /// Send envelopes to this URL instead of the DSN host
    #[arg(long, env = "REEL_TUNNEL")]
    tunnel: Option<String>,

    /// JSON configuration file (camelCase keys)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Session sample rate, overrides the config file
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Record in buffer mode
    #[arg(long)]
    buffer: bool,

    /// Buffer events without the compression worker
    #[arg(long)]
    no_compression: bool,

    /// Minimum replay duration in ms, overrides the config file
    #[arg(long)]
    min_duration: Option<u64>,

    /// Playback speed; 0 emits events as fast as possible
    #[arg(long, default_value = "0")]
    speed: f64,

    /// Print envelopes instead of sending them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), String> {
    let config = load_config(&args)?;
    let json_output = matches!(args.format, OutputFormat::Json);

    let dsn = args
        .dsn
        .as_deref()
        .map(str::parse::<Dsn>)
        .transpose()
        .map_err(|e| e.to_string())?;

    let transport: Arc<dyn Transport> = match (&dsn, &args.tunnel) {
        _ if args.dry_run => Arc::new(dry_run::DryRunTransport::new(json_output)),
        (_, Some(tunnel)) => Arc::new(HttpTransport::with_url(tunnel.clone())),
        (Some(dsn), None) => Arc::new(HttpTransport::new(dsn)),
        (None, None) => return Err("Either --dsn, --tunnel or --dry-run is required".to_string()),
    };

    let store: Arc<dyn SessionStore> = if config.sticky_session {
        let path = SledSessionStore::default_path()
            .ok_or("Could not determine a data directory for sticky sessions")?;
        Arc::new(SledSessionStore::new(path)?)
    } else {
        Arc::new(MemorySessionStore::new())
    };

    let events = player::load_events(&args.input)?;
    let clock = Clock::system();
    let recorder = Arc::new(player::JsonlRecorder::new(clock));

    let mut builder = ReplayContainer::builder(config, recorder.clone(), transport)
        .store(store)
        .sink(Arc::new(StdoutEventSink::new(json_output)))
        .clock(clock)
        .tunnel(args.tunnel.is_some());
    if let Some(dsn) = dsn {
        builder = builder.dsn(dsn);
    }
    if let Some(href) = events
        .first()
        .and_then(|event| event.data.get("href"))
        .and_then(|href| href.as_str())
    {
        builder = builder.url(href);
    }
    let replay = builder.build();

    if args.buffer {
        replay.start_buffering();
    } else {
        replay.initialize_sampling(None);
    }
    if !replay.is_enabled() {
        tracing::info!("Session was not sampled, nothing to record");
        return Ok(());
    }

    tracing::info!(
        "Playing {} events from {} in {} mode",
        events.len(),
        args.input.display(),
        replay.recording_mode()
    );
    let stats = recorder.play(events, args.speed).await;
    tracing::info!(emitted = stats.emitted, skipped = stats.skipped, "Playback finished");

    replay
        .stop(StopOptions::reason("playback finished").with_force_flush())
        .await;
    Ok(())
}

fn load_config(args: &Args) -> Result<ReplayConfig, String> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            serde_json::from_str::<ReplayConfig>(&raw)
                .map_err(|e| format!("Invalid config {}: {e}", path.display()))?
        }
        None => ReplayConfig::new()
            .with_session_sample_rate(1.0)
            .with_min_replay_duration(0),
    };

    if let Some(rate) = args.sample_rate {
        config.session_sample_rate = rate;
    }
    if args.no_compression {
        config.use_compression = false;
    }
    if let Some(min_duration) = args.min_duration {
        config.min_replay_duration = min_duration;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["reel", "--input", "events.jsonl"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = load_config(&args(&[])).unwrap();
        assert_eq!(config.session_sample_rate, 1.0);
        assert_eq!(config.min_replay_duration, 0);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sessionSampleRate": 0.5, "useCompression": true}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = load_config(&args(&["--config", &path, "--no-compression"])).unwrap();
        assert_eq!(config.session_sample_rate, 0.5);
        assert!(!config.use_compression);

        let config = load_config(&args(&["--config", &path, "--sample-rate", "0.1"])).unwrap();
        assert_eq!(config.session_sample_rate, 0.1);
    }

    #[test]
    fn test_min_duration_from_config_file_is_kept() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"minReplayDuration": 7000}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = load_config(&args(&["--config", &path])).unwrap();
        assert_eq!(config.min_replay_duration, 7000);

        let config = load_config(&args(&["--config", &path, "--min-duration", "0"])).unwrap();
        assert_eq!(config.min_replay_duration, 0);
    }
}
