use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use beat_emitter_core::{
    BeatEmitter, BeatEmitterError, ConfigOverrides, EmitterConfig, EmitterEvent, EmitterMode,
    EventKind, ManualClock, ReplaySource,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> beat_emitter_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let base = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            bpm,
            beats_per_measure,
            intensity,
            beats,
        } => {
            let overrides = ConfigOverrides {
                mode: Some(EmitterMode::Generation),
                tempo: bpm,
                beats_per_measure,
                fixed_intensity: intensity,
                ..Default::default()
            };
            run_generate(base.merged(&overrides), beats)
        }
        Commands::Detect {
            input,
            tick_ms,
            threshold,
        } => {
            let overrides = ConfigOverrides {
                mode: Some(EmitterMode::Detection),
                detection_threshold: threshold,
                ..Default::default()
            };
            run_detect(base.merged(&overrides), &input, tick_ms)
        }
    }
}

fn run_generate(config: EmitterConfig, beats: u64) -> beat_emitter_core::Result<()> {
    tracing::info!(tempo = config.tempo, beats, "starting generation");
    if beats == 0 {
        return Err(BeatEmitterError::invalid("beat count must be greater than 0"));
    }

    let emitter = BeatEmitter::new(config)?;
    print_events(&emitter);

    let handle = emitter.clone();
    let emitted = AtomicU64::new(0);
    emitter.on_beat(move |_| {
        if emitted.fetch_add(1, Ordering::SeqCst) + 1 >= beats {
            handle.stop()?;
        }
        Ok(())
    });

    emitter.start()?;
    emitter.run()
}

fn run_detect(config: EmitterConfig, input: &Path, tick_ms: f64) -> beat_emitter_core::Result<()> {
    tracing::info!(?input, tick_ms, "replaying energy readings");
    if !(tick_ms.is_finite() && tick_ms > 0.0) {
        return Err(BeatEmitterError::invalid("tick interval must be greater than 0"));
    }

    let readings = read_energy_file(input)?;
    let clock = ManualClock::new();
    let emitter = BeatEmitter::with_clock(config, Arc::new(clock.clone()))?;
    emitter.attach_source(ReplaySource::new(readings.iter().copied()))?;
    print_events(&emitter);

    emitter.start()?;
    for tick in 0..readings.len() {
        clock.set(tick as f64 * tick_ms);
        emitter.tick()?;
    }

    let estimate = emitter.tempo_estimate()?;
    tracing::info!(
        beats = emitter.beat_count()?,
        tempo = estimate.tempo,
        confidence = estimate.confidence,
        "replay finished"
    );
    emitter.stop()
}

/// One reading per line; blank lines and `#` comments are skipped.
fn read_energy_file(path: &Path) -> beat_emitter_core::Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .enumerate()
        .map(|(number, line)| (number + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            line.parse::<f64>()
                .ok()
                .filter(|energy| energy.is_finite())
                .ok_or_else(|| {
                    BeatEmitterError::msg(format!("line {number}: invalid energy reading `{line}`"))
                })
        })
        .collect()
}

fn load_config(path: Option<&Path>) -> beat_emitter_core::Result<EmitterConfig> {
    match path {
        Some(path) => {
            tracing::debug!(?path, "loading configuration");
            EmitterConfig::from_json(&std::fs::read_to_string(path)?)
        }
        None => Ok(EmitterConfig::default()),
    }
}

/// Writes every event to stdout as one JSON object per line.
fn print_events(emitter: &BeatEmitter) {
    for kind in [
        EventKind::Beat,
        EventKind::Tempo,
        EventKind::Started,
        EventKind::Stopped,
        EventKind::Error,
    ] {
        emitter.events().on(kind, |event| {
            let line = match event {
                EmitterEvent::Beat(beat) => json!({
                    "event": "beat",
                    "downbeat": beat.is_downbeat(),
                    "data": beat,
                }),
                EmitterEvent::Tempo(tempo) => json!({ "event": "tempo", "data": tempo }),
                EmitterEvent::Started => json!({ "event": "started" }),
                EmitterEvent::Stopped => json!({ "event": "stopped" }),
                EmitterEvent::Error(err) => json!({ "event": "error", "message": err.to_string() }),
            };
            println!("{line}");
            Ok(())
        });
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Emit beat events at a fixed or detected tempo", long_about = None)]
struct Cli {
    /// JSON configuration file; command line flags take precedence.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate beats in real time from a target tempo.
    Generate {
        /// Tempo in beats per minute.
        #[arg(long)]
        bpm: Option<f64>,
        #[arg(long)]
        beats_per_measure: Option<u32>,
        /// Intensity attached to every beat, between 0 and 1.
        #[arg(long)]
        intensity: Option<f64>,
        /// Stop after this many beats.
        #[arg(long, default_value_t = 8)]
        beats: u64,
    },
    /// Detect beats in a file of energy readings, one per line.
    Detect {
        #[arg(short, long)]
        input: PathBuf,
        /// Time between consecutive readings, in milliseconds.
        #[arg(long, default_value_t = 16.0)]
        tick_ms: f64,
        /// Static detection threshold, between 0 and 1.
        #[arg(long)]
        threshold: Option<f64>,
    },
}
