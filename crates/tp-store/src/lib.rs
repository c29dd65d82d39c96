// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! On-disk containers for the Tempest pipeline: per-field forecast
//! datasets, the static constants pair, and the published output volume.

pub mod constants;
pub mod dataset;
pub mod error;
pub mod volume;

pub use constants::{load_constants, write_constants};
pub use dataset::{write_dataset, DatasetHeader, ForecastDataset};
pub use error::{StoreError, StoreResult};
pub use volume::{OutputVolume, VolumeDims, VolumeReader};
