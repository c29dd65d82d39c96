// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The per-date controller.
//!
//! Dates process sequentially; only the member loop inside a date runs
//! under the worker pool. Configuration problems abort before any sampling
//! starts, while a bad date (missing file, dimension mismatch, insufficient
//! members, failed draws) is reported with its date and field context and
//! the run moves on to the next date.

use ndarray::Ix4;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};

use tempest_config::{RunConfig, RunConfigError};
use tp_core::{
    assemble, reduce, ChannelStats, Constants, CoreError, FieldGrid, FieldNorm, ModelInput,
    MomentsTable,
};
use tp_store::{load_constants, ForecastDataset, OutputVolume, StoreError, VolumeDims};

use crate::error::SampleError;
use crate::generator::Generative;
use crate::noise::NoiseSource;
use crate::sampler::{CancelToken, DatePlan, EnsembleSampler};

/// Errors that abort a whole run before or outside any date's sampling.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] RunConfigError),
    #[error("normalization configuration: {0}")]
    Norm(#[from] CoreError),
    #[error("constants: {0}")]
    Constants(#[from] StoreError),
}

/// One date that could not be published, with its reason.
#[derive(Clone, Debug)]
pub struct DateFailure {
    pub date: u32,
    pub message: String,
}

/// Outcome of a multi-date run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub published: Vec<PathBuf>,
    pub failures: Vec<DateFailure>,
}

/// Runs every configured date against the supplied capability.
pub fn run(
    cfg: &RunConfig,
    generator: &(dyn Generative + Sync),
    cancel: &CancelToken,
) -> Result<RunSummary, PipelineError> {
    cfg.validate()?;

    let table = MomentsTable::load(&cfg.norm_table_path)?;
    let norms = tp_core::resolve_all(&cfg.fields, &table)?;
    let (rows, cols) = cfg.grid;
    let constants = load_constants(&cfg.constants_path, rows, cols)?;

    let noise = NoiseSource::new(cfg.seed, cfg.noise_channels);
    let sampler = EnsembleSampler::new(cfg.members, cfg.effective_workers());

    let mut summary = RunSummary::default();
    for &date in &cfg.dates {
        if cancel.is_cancelled() {
            summary.failures.push(DateFailure {
                date,
                message: "run cancelled".to_string(),
            });
            continue;
        }
        info!(date, "processing forecast date");
        match process_date(cfg, &norms, &constants, &noise, &sampler, generator, cancel, date) {
            Ok(path) => {
                info!(date, path = %path.display(), "forecast published");
                summary.published.push(path);
            }
            Err(err) => {
                error!(date, error = %err, "date failed, continuing");
                summary.failures.push(DateFailure {
                    date,
                    message: err.to_string(),
                });
            }
        }
    }
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
fn process_date(
    cfg: &RunConfig,
    norms: &[FieldNorm],
    constants: &Constants,
    noise: &NoiseSource,
    sampler: &EnsembleSampler,
    generator: &(dyn Generative + Sync),
    cancel: &CancelToken,
    date: u32,
) -> Result<PathBuf, SampleError> {
    let (rows, cols) = cfg.grid;
    let year = RunConfig::year_of(date);
    let time_key = date as i64 * 100 + cfg.init_hour as i64;
    let valid_hours = cfg.lead_window.valid_hours();

    // Per valid time, per field: the four normalized channel planes.
    let mut channels: Vec<HashMap<String, ChannelStats>> =
        vec![HashMap::new(); valid_hours.len()];

    for norm in norms {
        let field = norm.field();
        let variable = &cfg.field_mapping[field];
        let dataset = ForecastDataset::open_for_year(&cfg.input_root, field, year, variable)?;
        let pairs = dataset.resolve_steps(&valid_hours, cfg.step_offsets)?;

        for (valid_idx, pair) in pairs.iter().enumerate() {
            let slab = dataset.select(time_key, *pair)?;
            let grid = FieldGrid::new(field, slab)?.resize_to(rows, cols)?;
            let normalized = norm
                .apply(&grid.values().view().into_dyn())
                .into_dimensionality::<Ix4>()
                .map_err(|_| CoreError::EmptyGrid {
                    field: field.to_string(),
                })?;
            let stats = reduce(&FieldGrid::new(field, normalized)?)?;

            channels[valid_idx].insert(
                field.to_string(),
                ChannelStats {
                    mean_t0: stats.mean.index_axis(ndarray::Axis(0), 0).to_owned(),
                    std_t0: stats.std.index_axis(ndarray::Axis(0), 0).to_owned(),
                    mean_t1: stats.mean.index_axis(ndarray::Axis(0), 1).to_owned(),
                    std_t1: stats.std.index_axis(ndarray::Axis(0), 1).to_owned(),
                },
            );
        }
    }

    let inputs: Vec<ModelInput> = channels
        .iter()
        .map(|per_field| assemble(&cfg.fields, per_field, rows, cols))
        .collect::<Result<_, _>>()?;

    let out_path = cfg
        .output_root
        .join(year.to_string())
        .join(format!("{}.tpv", cfg.forecast_id(date)));
    let mut volume = OutputVolume::create(
        &out_path,
        VolumeDims {
            members: cfg.members,
            rows,
            cols,
        },
        valid_hours.clone(),
    )?;
    let time_idx = volume.time_index(time_key);

    let plan = DatePlan {
        time_idx,
        inputs: &inputs,
        constants,
        cap_mm_h: cfg.precip_cap_mm_h,
    };
    sampler.run_date(&plan, noise, generator, &mut volume, cancel)?;

    Ok(volume.close()?)
}
