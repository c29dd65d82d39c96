// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Stochastic sampling for the Tempest pipeline: seedable Gaussian noise,
//! the generative-capability seam, the bounded ensemble sampler, and the
//! multi-date controller.

pub mod error;
pub mod generator;
pub mod noise;
pub mod pipeline;
pub mod process;
pub mod sampler;

pub use error::{SampleError, SampleResult};
pub use generator::{
    BaselineGenerator, FnGenerator, Generative, GeneratorError, GeneratorResult, PredictContext,
    SerialGenerator, TimeoutGenerator,
};
pub use noise::NoiseSource;
pub use pipeline::{run, DateFailure, PipelineError, RunSummary};
pub use process::ProcessGenerator;
pub use sampler::{CancelToken, DatePlan, EnsembleSampler, SamplePhase, SampleReport};
