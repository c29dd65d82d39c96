// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Errors raised while loading or validating a run description.
#[derive(Debug, thiserror::Error)]
pub enum RunConfigError {
    #[error("failed to read run config {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("failed to parse run config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("configured field order is empty")]
    NoFields,
    #[error("field {field} appears in the configured order but not in the input mapping")]
    UnmappedField { field: String },
    #[error("lead window is empty: start {start} end {end} cadence {cadence}")]
    EmptyWindow { start: i64, end: i64, cadence: i64 },
    #[error("ensemble size must be at least 1")]
    NoMembers,
    #[error("noise channel count must be at least 1")]
    NoNoiseChannels,
    #[error("no forecast dates configured")]
    NoDates,
}

/// Lead-time window: forecast hours `start_hour..=end_hour` at a fixed
/// cadence. Initialization time + lead hour = valid time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadWindow {
    pub start_hour: i64,
    pub end_hour: i64,
    pub cadence_hours: i64,
}

impl LeadWindow {
    /// The valid-time lead hours selected by this window, in ascending order.
    pub fn valid_hours(&self) -> Vec<i64> {
        if self.cadence_hours <= 0 || self.end_hour < self.start_hour {
            return Vec::new();
        }
        (self.start_hour..=self.end_hour)
            .step_by(self.cadence_hours as usize)
            .collect()
    }
}

impl Default for LeadWindow {
    fn default() -> Self {
        Self {
            start_hour: 30,
            end_hour: 54,
            cadence_hours: 6,
        }
    }
}

/// Mapping from canonical field names to the variable names carried by the
/// input datasets. Identity-mapped entries are allowed; absent entries are a
/// configuration error once a field is part of the configured order.
pub type FieldMapping = HashMap<String, String>;

fn default_fields() -> Vec<String> {
    ["cape", "pres", "msl", "pwat", "tmp", "ugrd", "vgrd", "apcp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_mapping() -> FieldMapping {
    [
        ("cape", "cape"),
        ("pres", "sp"),
        ("msl", "mslet"),
        ("pwat", "pwat"),
        ("tmp", "t2m"),
        ("ugrd", "u10"),
        ("vgrd", "v10"),
        ("apcp", "tp"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_members() -> usize {
    50
}

fn default_noise_channels() -> usize {
    4
}

fn default_workers() -> usize {
    1
}

fn default_timeout() -> u64 {
    120
}

fn default_cap() -> f32 {
    100.0
}

fn default_offsets() -> (i64, i64) {
    (-5, -4)
}

/// Full description of a forecast run. Ownership of this file lives with the
/// operator; the pipeline only deserialises and validates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command used to launch the external generative backend, if any.
    #[serde(default)]
    pub model_command: Option<String>,
    /// Checkpoint path handed to the backend verbatim.
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    /// Root directory holding per-field per-year forecast datasets.
    pub input_root: PathBuf,
    /// Static constants container (elevation + land-sea mask).
    pub constants_path: PathBuf,
    /// Offline-computed per-field moments table.
    pub norm_table_path: PathBuf,
    /// Root directory forecasts are published under.
    pub output_root: PathBuf,
    /// Forecast initialization dates as `YYYYMMDD` integers.
    pub dates: Vec<u32>,
    /// Initialization hour shared by all dates.
    #[serde(default)]
    pub init_hour: u8,
    /// Canonical field order defining the model input channel layout.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    /// Canonical name → dataset variable name.
    #[serde(default = "default_mapping")]
    pub field_mapping: FieldMapping,
    #[serde(default)]
    pub lead_window: LeadWindow,
    /// Step indices for the (t0, t1) input pair, relative to the resolved
    /// valid-hour index in the dataset step coordinate.
    #[serde(default = "default_offsets")]
    pub step_offsets: (i64, i64),
    /// Ensemble members to generate per date.
    #[serde(default = "default_members")]
    pub members: usize,
    /// Channels in each noise tensor.
    #[serde(default = "default_noise_channels")]
    pub noise_channels: usize,
    /// Bound on concurrent capability invocations.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-invocation timeout before the retry policy kicks in.
    #[serde(default = "default_timeout")]
    pub predict_timeout_secs: u64,
    /// Upper bound applied by the inverse precipitation rule, in mm/h.
    #[serde(default = "default_cap")]
    pub precip_cap_mm_h: f32,
    /// Base seed for all stochastic draws of the run.
    #[serde(default)]
    pub seed: u64,
    /// Model grid height and width.
    pub grid: (usize, usize),
}

impl RunConfig {
    /// Loads and validates a run description from JSON.
    pub fn load(path: &Path) -> Result<Self, RunConfigError> {
        let file = File::open(path).map_err(|err| RunConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let cfg: RunConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| RunConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the invariants the sampler relies on. Violations abort the run
    /// before any sampling starts.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        if self.fields.is_empty() {
            return Err(RunConfigError::NoFields);
        }
        for field in &self.fields {
            if !self.field_mapping.contains_key(field) {
                return Err(RunConfigError::UnmappedField {
                    field: field.clone(),
                });
            }
        }
        if self.lead_window.valid_hours().is_empty() {
            return Err(RunConfigError::EmptyWindow {
                start: self.lead_window.start_hour,
                end: self.lead_window.end_hour,
                cadence: self.lead_window.cadence_hours,
            });
        }
        if self.members == 0 {
            return Err(RunConfigError::NoMembers);
        }
        if self.noise_channels == 0 {
            return Err(RunConfigError::NoNoiseChannels);
        }
        if self.dates.is_empty() {
            return Err(RunConfigError::NoDates);
        }
        Ok(())
    }

    /// Effective worker-pool size: never more threads than members.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, self.members.max(1))
    }

    /// Forecast key for one date, e.g. `20240317_00Z`.
    pub fn forecast_id(&self, date: u32) -> String {
        format!("{date}_{:02}Z", self.init_hour)
    }

    /// Year component of a `YYYYMMDD` date.
    pub fn year_of(date: u32) -> u32 {
        date / 10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RunConfig {
        RunConfig {
            model_command: None,
            checkpoint: None,
            input_root: PathBuf::from("/data/fcst"),
            constants_path: PathBuf::from("/data/constants.tpc"),
            norm_table_path: PathBuf::from("/data/moments.json"),
            output_root: PathBuf::from("/data/out"),
            dates: vec![20240317],
            init_hour: 0,
            fields: default_fields(),
            field_mapping: default_mapping(),
            lead_window: LeadWindow::default(),
            step_offsets: default_offsets(),
            members: 50,
            noise_channels: 4,
            workers: 1,
            predict_timeout_secs: 120,
            precip_cap_mm_h: 100.0,
            seed: 0,
            grid: (384, 352),
        }
    }

    #[test]
    fn default_window_resolves_five_valid_hours() {
        assert_eq!(LeadWindow::default().valid_hours(), vec![30, 36, 42, 48, 54]);
    }

    #[test]
    fn validates_minimal_config() {
        minimal().validate().unwrap();
    }

    #[test]
    fn missing_mapping_entry_is_a_config_error() {
        let mut cfg = minimal();
        cfg.field_mapping.remove("apcp");
        match cfg.validate() {
            Err(RunConfigError::UnmappedField { field }) => assert_eq!(field, "apcp"),
            other => panic!("expected UnmappedField, got {other:?}"),
        }
    }

    #[test]
    fn empty_window_is_rejected() {
        let mut cfg = minimal();
        cfg.lead_window = LeadWindow {
            start_hour: 54,
            end_hour: 30,
            cadence_hours: 6,
        };
        assert!(matches!(
            cfg.validate(),
            Err(RunConfigError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn forecast_id_carries_init_hour() {
        let mut cfg = minimal();
        cfg.init_hour = 6;
        assert_eq!(cfg.forecast_id(20240317), "20240317_06Z");
        assert_eq!(RunConfig::year_of(20240317), 2024);
    }

    #[test]
    fn json_round_trip_preserves_offsets() {
        let cfg = minimal();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: RunConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.step_offsets, (-5, -4));
        assert_eq!(back.grid, (384, 352));
    }

    #[test]
    fn load_validates_what_it_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut cfg = minimal();
        cfg.members = 0;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();
        assert!(matches!(
            RunConfig::load(&path),
            Err(RunConfigError::NoMembers)
        ));
    }
}
