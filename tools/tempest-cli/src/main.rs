// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use tempest_config::{init_tracing, RunConfig};
use tp_core::{MomentsAccumulator, MomentsTable};
use tp_sample::{
    BaselineGenerator, CancelToken, Generative, ProcessGenerator, TimeoutGenerator,
};
use tp_store::{ForecastDataset, VolumeReader};

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Ensemble precipitation downscaling driver for Tempest"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured forecast dates through the generative capability
    Forecast {
        /// Run description (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Use the deterministic dry-run backend instead of the configured model
        #[arg(long)]
        baseline: bool,
    },
    /// Build the per-field moments table from a reference year
    Norm {
        /// Run description (JSON); supplies input root, fields, and mapping
        #[arg(long)]
        config: PathBuf,
        /// Reference year to scan
        #[arg(long)]
        year: u32,
        /// Where to write the table
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the schema and coordinates of a published volume
    Inspect {
        volume: PathBuf,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    match cli.command {
        Commands::Forecast { config, baseline } => forecast(&config, baseline),
        Commands::Norm { config, year, out } => build_norm(&config, year, &out),
        Commands::Inspect { volume } => inspect(&volume),
    }
}

fn forecast(config: &PathBuf, baseline: bool) -> Result<()> {
    let cfg = RunConfig::load(config)?;
    let generator = build_generator(&cfg, baseline)?;
    let summary = tp_sample::run(&cfg, generator.as_ref(), &CancelToken::new())?;

    for path in &summary.published {
        println!("published {}", path.display());
    }
    for failure in &summary.failures {
        eprintln!("date {} failed: {}", failure.date, failure.message);
    }
    if summary.failures.is_empty() {
        Ok(())
    } else {
        Err(format!("{} of {} dates failed", summary.failures.len(), cfg.dates.len()).into())
    }
}

fn build_generator(cfg: &RunConfig, baseline: bool) -> Result<Box<dyn Generative + Sync>> {
    if baseline {
        info!("using deterministic baseline backend");
        return Ok(Box::new(BaselineGenerator::default()));
    }
    let command = cfg.model_command.as_deref().ok_or_else(|| {
        DynError::from("no model_command configured; pass --baseline for a dry run")
    })?;
    let bridge = ProcessGenerator::launch(command, cfg.checkpoint.as_deref())?;
    Ok(Box::new(TimeoutGenerator::new(
        bridge,
        Duration::from_secs(cfg.predict_timeout_secs),
    )))
}

fn build_norm(config: &PathBuf, year: u32, out: &PathBuf) -> Result<()> {
    let cfg = RunConfig::load(config)?;
    let mut table = MomentsTable::default();
    for field in &cfg.fields {
        let variable = &cfg.field_mapping[field];
        let dataset = ForecastDataset::open_for_year(&cfg.input_root, field, year, variable)?;
        let mut acc = MomentsAccumulator::new();
        for t_idx in 0..dataset.header().times.len() {
            let slab = dataset.read_time(t_idx)?;
            acc.extend(slab.iter());
        }
        let moments = acc.finish(field)?;
        info!(field = %field, samples = acc.count(), "field scanned");
        table.insert(field.clone(), moments);
    }
    table.save(out)?;
    println!("wrote {} ({} fields)", out.display(), table.fields.len());
    Ok(())
}

fn inspect(volume: &PathBuf) -> Result<()> {
    let reader = VolumeReader::open(volume)?;
    println!("{}", reader.describe());
    println!("times: {:?}", reader.times());
    println!("valid_hours: {:?}", reader.valid_hours());
    Ok(())
}
