// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shared runtime configuration for the Tempest pipeline: deterministic
//! seeding, tracing initialisation, and the run description consumed by the
//! forecast driver.

pub mod determinism;
pub mod run;
pub mod tracing;

pub use self::determinism::DeterminismConfig;
pub use self::run::{FieldMapping, LeadWindow, RunConfig, RunConfigError};
pub use self::tracing::init_tracing;
