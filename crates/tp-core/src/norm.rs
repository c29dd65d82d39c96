// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-field normalization of physical fields into model-friendly ranges.
//!
//! Each field maps to exactly one rule, parameterised by an offline-computed
//! moments table. Rules are resolved once at configuration time into
//! [`FieldNorm`] values; the per-value application is a pure function and
//! propagates NaN.

use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{io_error, serde_error, CoreError, CoreResult};

/// Offline-computed statistics for one field over a reference year.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMoments {
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
}

/// Streaming accumulator used when building a moments table from a
/// reference year. Non-finite samples are ignored.
#[derive(Clone, Debug, Default)]
pub struct MomentsAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl MomentsAccumulator {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn update(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let v = value as f64;
        self.count += 1;
        self.sum += v;
        self.sum_sq += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    pub fn extend<'a, I: IntoIterator<Item = &'a f32>>(&mut self, values: I) {
        for &v in values {
            self.update(v);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Finishes the scan. A field with no finite samples has no statistics.
    pub fn finish(&self, field: &str) -> CoreResult<FieldMoments> {
        if self.count == 0 {
            return Err(CoreError::MissingStatistic {
                field: field.to_string(),
            });
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let var = (self.sum_sq / n - mean * mean).max(0.0);
        Ok(FieldMoments {
            mean: mean as f32,
            std: var.sqrt() as f32,
            min: self.min as f32,
            max: self.max as f32,
        })
    }
}

/// Immutable field → moments table, persisted as JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MomentsTable {
    pub fields: HashMap<String, FieldMoments>,
}

impl MomentsTable {
    pub fn get(&self, field: &str) -> Option<&FieldMoments> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, moments: FieldMoments) {
        self.fields.insert(field.into(), moments);
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let file = File::open(path).map_err(io_error)?;
        serde_json::from_reader(BufReader::new(file)).map_err(serde_error)
    }

    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let file = File::create(path).map_err(io_error)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(serde_error)?;
        Ok(())
    }
}

/// The four normalization rule shapes. Exactly one applies per field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormRule {
    /// Clip negatives to zero, then `log10(1 + x)`.
    LogAdditive,
    /// `(x - mean) / std`.
    Standardize,
    /// `max(x, 0) / max`.
    MaxScale,
    /// `x / max(-min, max)` — a shared scale keeps signed components of a
    /// vector field comparable.
    Symmetric,
}

impl NormRule {
    /// Rule selection by canonical field name.
    pub fn for_field(field: &str) -> CoreResult<NormRule> {
        match field {
            "apcp" => Ok(NormRule::LogAdditive),
            "tmp" | "pres" | "msl" => Ok(NormRule::Standardize),
            "cape" | "pwat" => Ok(NormRule::MaxScale),
            "ugrd" | "vgrd" => Ok(NormRule::Symmetric),
            _ => Err(CoreError::UnknownField {
                field: field.to_string(),
            }),
        }
    }
}

/// A rule with its scale parameters baked in at resolution time.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ResolvedRule {
    Log,
    Standardize { mean: f32, std: f32 },
    MaxScale { max: f32 },
    Symmetric { scale: f32 },
}

/// A rule resolved against the moments table for one field. Built once at
/// configuration time; application never branches on the field name or
/// touches the table again.
#[derive(Clone, Debug)]
pub struct FieldNorm {
    field: String,
    resolved: ResolvedRule,
}

impl FieldNorm {
    /// Resolves the rule for `field` against `table`, validating that every
    /// statistic the rule needs exists and can actually scale values.
    pub fn resolve(field: &str, table: &MomentsTable) -> CoreResult<FieldNorm> {
        let rule = NormRule::for_field(field)?;
        let resolved = match rule {
            NormRule::LogAdditive => ResolvedRule::Log,
            _ => {
                let m = *table.get(field).ok_or_else(|| CoreError::MissingStatistic {
                    field: field.to_string(),
                })?;
                match rule {
                    NormRule::Standardize => {
                        if m.std <= 0.0 {
                            return Err(CoreError::DegenerateStatistic {
                                field: field.to_string(),
                                stat: "std",
                            });
                        }
                        ResolvedRule::Standardize {
                            mean: m.mean,
                            std: m.std,
                        }
                    }
                    NormRule::MaxScale => {
                        if m.max <= 0.0 {
                            return Err(CoreError::DegenerateStatistic {
                                field: field.to_string(),
                                stat: "max",
                            });
                        }
                        ResolvedRule::MaxScale { max: m.max }
                    }
                    NormRule::Symmetric => {
                        let scale = (-m.min).max(m.max);
                        if scale <= 0.0 {
                            return Err(CoreError::DegenerateStatistic {
                                field: field.to_string(),
                                stat: "min/max",
                            });
                        }
                        ResolvedRule::Symmetric { scale }
                    }
                    NormRule::LogAdditive => ResolvedRule::Log,
                }
            }
        };
        Ok(FieldNorm {
            field: field.to_string(),
            resolved,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn rule(&self) -> NormRule {
        match self.resolved {
            ResolvedRule::Log => NormRule::LogAdditive,
            ResolvedRule::Standardize { .. } => NormRule::Standardize,
            ResolvedRule::MaxScale { .. } => NormRule::MaxScale,
            ResolvedRule::Symmetric { .. } => NormRule::Symmetric,
        }
    }

    /// Normalizes one value. NaN stays NaN under every rule.
    pub fn normalize(&self, x: f32) -> f32 {
        match self.resolved {
            ResolvedRule::Log => {
                // x.max(0.0) would swallow NaN; the comparison keeps it.
                let clipped = if x < 0.0 { 0.0 } else { x };
                (1.0 + clipped).log10()
            }
            ResolvedRule::Standardize { mean, std } => (x - mean) / std,
            ResolvedRule::MaxScale { max } => {
                let clipped = if x < 0.0 { 0.0 } else { x };
                clipped / max
            }
            ResolvedRule::Symmetric { scale } => x / scale,
        }
    }

    /// Exact inverse of [`normalize`](Self::normalize), without any cap.
    pub fn denormalize(&self, y: f32) -> f32 {
        match self.resolved {
            ResolvedRule::Log => 10f32.powf(y) - 1.0,
            ResolvedRule::Standardize { mean, std } => y * std + mean,
            ResolvedRule::MaxScale { max } => y * max,
            ResolvedRule::Symmetric { scale } => y * scale,
        }
    }

    /// Applies the rule elementwise, preserving shape.
    pub fn apply(&self, raw: &ArrayViewD<'_, f32>) -> ArrayD<f32> {
        raw.mapv(|x| self.normalize(x))
    }
}

/// Inverse of the precipitation rule with the out-of-range cap applied:
/// `min(10^y - 1, cap)`. The cap only clamps results the forward rule could
/// never have produced from in-range rain rates.
pub fn denormalize_precip(y: f32, cap_mm_h: f32) -> f32 {
    (10f32.powf(y) - 1.0).min(cap_mm_h)
}

/// Resolves the full configured field order up front so rule coverage and
/// table completeness fail before any data is touched.
pub fn resolve_all(fields: &[String], table: &MomentsTable) -> CoreResult<Vec<FieldNorm>> {
    fields
        .iter()
        .map(|f| FieldNorm::resolve(f, table))
        .collect()
}
