//! Command line entry point.
//!
//! ```text
//! rust_camacq check   --config camacq.toml
//! rust_camacq replay  --config camacq.toml --events events.jsonl --start
//! rust_camacq estimate --config camacq.toml --images /data/plate00
//! ```
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_camacq::bus::EventBus;
use rust_camacq::config::Config;
use rust_camacq::core::{GainCalculator, SampleStore};
use rust_camacq::event::Event;
use rust_camacq::gain::histogram::ImageFileSource;
use rust_camacq::gain::GainService;
use rust_camacq::instrument::DryRunInstrument;
use rust_camacq::sample::{ImageRecord, InMemorySampleStore, WellCoord};
use rust_camacq::workflow::naming::parse_image_name;
use rust_camacq::workflow::{Collaborators, RunState, WorkflowEngine};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rust_camacq")]
#[command(version, about = "Automated multi-well microscope acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML, or YAML by extension)
    #[arg(short, long, value_name = "FILE", global = true, default_value = "config/default.toml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL", global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    Check,

    /// Drive the workflow from recorded events without touching hardware
    Replay {
        /// JSON lines event file; standard input when omitted
        #[arg(short, long, value_name = "FILE")]
        events: Option<PathBuf>,

        /// Publish a start event before the recorded events
        #[arg(long)]
        start: bool,

        /// Event channel capacity
        #[arg(long, value_name = "N", default_value = "256")]
        capacity: usize,
    },

    /// Estimate gains from probe images already on disk
    Estimate {
        /// Directory holding the probe images
        #[arg(short, long, value_name = "DIR")]
        images: PathBuf,

        /// Only estimate the well in this column
        #[arg(long, value_name = "N")]
        well_x: Option<u32>,

        /// Only estimate the well in this row
        #[arg(long, value_name = "N")]
        well_y: Option<u32>,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let config = Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Check => check(&config),
        Commands::Replay {
            events,
            start,
            capacity,
        } => replay(config, events, start, capacity).await,
        Commands::Estimate {
            images,
            well_x,
            well_y,
        } => estimate(&config, &images, well_x, well_y).await,
    }
}

fn check(config: &Config) -> Result<()> {
    let production = &config.production;
    let records = config.sample_records()?;
    println!("Configuration OK");
    println!(
        "  wells:    {} sample records, {}x{} fields per well",
        records.len(),
        production.well_layout.x_fields,
        production.well_layout.y_fields
    );
    println!(
        "  probe:    pattern {} job {} with {} channels",
        production.gain_pattern_name, production.gain_job_id, production.gain_job_channels
    );
    println!(
        "  acquire:  pattern {} jobs {:?}",
        production.exp_pattern_name, production.exp_job_ids
    );
    for (channel, gain) in config.gain_ladder().iter().enumerate() {
        println!("  C{channel:02}:      {} @ {}", gain.0, gain.1);
    }
    Ok(())
}

async fn replay(config: Config, events: Option<PathBuf>, start: bool, capacity: usize) -> Result<()> {
    let bus = Arc::new(EventBus::new());

    let store = Arc::new(InMemorySampleStore::with_bus(Arc::clone(&bus)));
    store.load(&config.sample_records()?);
    let wells: Vec<WellCoord> = store
        .wells()
        .into_iter()
        .filter(|well| store.well(well).map_or(true, |record| !record.img_ok()))
        .collect();
    let _images = store.track_images(&bus);

    let samples: Arc<dyn SampleStore> = store.clone();
    let gains = GainService::new(&config, Arc::new(ImageFileSource)).with_sample_store(Arc::clone(&samples));
    let engine = WorkflowEngine::new(
        config.production.clone(),
        Arc::clone(&bus),
        Collaborators {
            instrument: Arc::new(DryRunInstrument),
            samples,
            gains: Arc::new(gains),
        },
        wells,
    );
    engine.install();
    info!(wells = engine.wells_remaining().await, "Replaying events");

    let (tx, rx) = mpsc::channel(capacity.max(1));
    let delivery = tokio::spawn(Arc::clone(&bus).run_inbound(rx));

    if start {
        tx.send(Event::Start).await.context("Event channel closed")?;
    }
    let reader: Box<dyn BufRead + Send> = match &events {
        Some(path) => Box::new(std::io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read events")?;
        if line.trim().is_empty() {
            continue;
        }
        match Event::from_json(&line) {
            Ok(event) => tx.send(event).await.context("Event channel closed")?,
            Err(err) => warn!(line = idx + 1, error = %err, "Skipping malformed event"),
        }
    }
    drop(tx);
    delivery.await.context("Event delivery failed")?;

    let state = *engine.run_state().borrow();
    engine.shutdown();
    match state {
        RunState::Finished => info!("Replay finished the run"),
        RunState::Running => info!(
            wells = engine.wells_remaining().await,
            "Replay ended with wells left to image"
        ),
    }
    Ok(())
}

async fn estimate(config: &Config, dir: &Path, well_x: Option<u32>, well_y: Option<u32>) -> Result<()> {
    let mut wells: BTreeMap<WellCoord, Vec<ImageRecord>> = BTreeMap::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(parts) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_image_name)
        else {
            continue;
        };
        if parts.job_id != config.production.gain_job_id
            || well_x.is_some_and(|x| x != parts.well_x)
            || well_y.is_some_and(|y| y != parts.well_y)
        {
            continue;
        }
        let image = ImageRecord {
            path,
            plate_name: config.plate_name.clone(),
            well_x: parts.well_x,
            well_y: parts.well_y,
            field_x: parts.field_x,
            field_y: parts.field_y,
            job_id: parts.job_id,
            channel_id: parts.channel_id,
            z_slice: parts.z_slice,
        };
        wells.entry(image.well()).or_default().push(image);
    }
    info!(wells = wells.len(), "Found probe images");

    let service = GainService::new(config, Arc::new(ImageFileSource));
    for (well, images) in &wells {
        service.calc_gain(well, images).await?;
    }

    println!("{}", serde_json::to_string_pretty(&service.saved_gains())?);
    Ok(())
}
