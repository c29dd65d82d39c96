// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The seam between the pipeline and the generative model.
//!
//! The model itself — architecture, weights, training — lives outside this
//! repository. The pipeline only needs an opaque function from
//! (forecast, constants, noise) to one high-resolution realization, so that
//! is the whole trait. Adapters below add the operational concerns the
//! sampler relies on: mutual exclusion for backends that are not
//! thread-safe and a watchdog timeout per invocation.

use ndarray::{Array3, Array4};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use tp_core::{Constants, ModelInput};

/// Errors surfaced by a capability invocation.
#[derive(Debug, Error, Clone)]
pub enum GeneratorError {
    #[error("backend failure: {message}")]
    Backend { message: String },
    #[error("prediction timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("prediction has shape {got:?}, expected ({rows}, {cols}, 1)")]
    Shape {
        rows: usize,
        cols: usize,
        got: Vec<usize>,
    },
}

pub type GeneratorResult = Result<Array3<f32>, GeneratorError>;

/// One stochastic realization from conditioning inputs and noise.
///
/// The prediction stays in the model's normalized space; the sampler owns
/// the inverse transform.
pub trait Generative {
    fn predict(
        &self,
        forecast: &Array4<f32>,
        constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult;
}

/// Validates the `(rows, cols, 1)` contract on behalf of adapters.
pub fn check_prediction(rows: usize, cols: usize, prediction: Array3<f32>) -> GeneratorResult {
    if prediction.dim() != (rows, cols, 1) {
        return Err(GeneratorError::Shape {
            rows,
            cols,
            got: prediction.shape().to_vec(),
        });
    }
    Ok(prediction)
}

/// Serialises calls into a backend that is not safe to share across
/// workers. The pool still parallelises noise generation and writes; only
/// the capability call itself is exclusive.
pub struct SerialGenerator<G> {
    inner: Mutex<G>,
}

impl<G> SerialGenerator<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<G: Generative> Generative for SerialGenerator<G> {
    fn predict(
        &self,
        forecast: &Array4<f32>,
        constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult {
        let guard = self.inner.lock().map_err(|_| GeneratorError::Backend {
            message: "backend mutex poisoned".to_string(),
        })?;
        guard.predict(forecast, constants, noise)
    }
}

/// Bounds the wall-clock of every invocation.
///
/// The call runs on a helper thread; when the deadline passes the caller
/// gets [`GeneratorError::Timeout`] and the abandoned call drains in the
/// background once the backend returns.
pub struct TimeoutGenerator<G> {
    inner: Arc<G>,
    timeout: Duration,
}

impl<G> TimeoutGenerator<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }
}

impl<G: Generative + Send + Sync + 'static> Generative for TimeoutGenerator<G> {
    fn predict(
        &self,
        forecast: &Array4<f32>,
        constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let forecast = forecast.clone();
        let constants = constants.clone();
        let noise = noise.clone();
        thread::spawn(move || {
            let result = inner.predict(&forecast, &constants, &noise);
            let _ = tx.send(result);
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(_) => Err(GeneratorError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

/// Deterministic dry-run backend.
///
/// Emits the first conditioning channel perturbed by the first noise
/// channel scaled with the matching spread channel. Useful for exercising
/// the full pipeline, and for smoke tests, without an accelerator.
#[derive(Clone, Debug)]
pub struct BaselineGenerator {
    pub noise_weight: f32,
}

impl Default for BaselineGenerator {
    fn default() -> Self {
        Self { noise_weight: 1.0 }
    }
}

impl Generative for BaselineGenerator {
    fn predict(
        &self,
        forecast: &Array4<f32>,
        _constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult {
        let rows = forecast.shape()[1];
        let cols = forecast.shape()[2];
        let mut out = Array3::<f32>::zeros((rows, cols, 1));
        for r in 0..rows {
            for c in 0..cols {
                let mean = forecast[(0, r, c, 0)];
                let spread = forecast[(0, r, c, 1)];
                out[(r, c, 0)] = mean + self.noise_weight * spread * noise[(r, c, 0)];
            }
        }
        Ok(out)
    }
}

/// Closure-backed capability for tests and harnesses.
pub struct FnGenerator<F>(pub F);

impl<F> Generative for FnGenerator<F>
where
    F: Fn(&Array4<f32>, &Array3<f32>, &Array3<f32>) -> GeneratorResult,
{
    fn predict(
        &self,
        forecast: &Array4<f32>,
        constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult {
        (self.0)(forecast, constants, noise)
    }
}

/// Convenience bundle for a prepared invocation context.
pub struct PredictContext<'a> {
    pub input: &'a ModelInput,
    pub constants: &'a Constants,
}

impl<'a> PredictContext<'a> {
    pub fn invoke(&self, generator: &dyn Generative, noise: &Array3<f32>) -> GeneratorResult {
        let (rows, cols) = self.input.grid();
        let prediction =
            generator.predict(self.input.tensor(), self.constants.tensor(), noise)?;
        check_prediction(rows, cols, prediction)
    }
}
