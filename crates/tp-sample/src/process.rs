// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Bridge to a generative backend running as a child process.
//!
//! The model's runtime, weights, and accelerator binding all stay on the
//! far side of a pipe: the bridge launches the configured command once,
//! hands it the checkpoint location, and then exchanges length-prefixed
//! bincode frames per invocation. The child is inherently serial, so the
//! bridge is its own mutual-exclusion point.

use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use crate::generator::{Generative, GeneratorError, GeneratorResult};

#[derive(Serialize)]
struct PredictRequest<'a> {
    rows: usize,
    cols: usize,
    channels: usize,
    noise_channels: usize,
    forecast: &'a [f32],
    constants: &'a [f32],
    noise: &'a [f32],
}

#[derive(Deserialize)]
struct PredictResponse {
    ok: bool,
    message: String,
    values: Vec<f32>,
}

struct Bridge {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Generative capability living in an external process.
pub struct ProcessGenerator {
    bridge: Mutex<Bridge>,
}

impl ProcessGenerator {
    /// Launches `command` with the checkpoint path as its single argument.
    pub fn launch(command: &str, checkpoint: Option<&Path>) -> Result<Self, GeneratorError> {
        let mut cmd = Command::new(command);
        if let Some(ckpt) = checkpoint {
            cmd.arg(ckpt);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| GeneratorError::Backend {
                message: format!("failed to launch {command}: {err}"),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| GeneratorError::Backend {
            message: "backend stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GeneratorError::Backend {
            message: "backend stdout unavailable".to_string(),
        })?;
        Ok(Self {
            bridge: Mutex::new(Bridge {
                child,
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
            }),
        })
    }

    fn exchange(&self, request: &PredictRequest<'_>) -> Result<PredictResponse, GeneratorError> {
        let mut bridge = self.bridge.lock().map_err(|_| GeneratorError::Backend {
            message: "bridge mutex poisoned".to_string(),
        })?;

        let frame = bincode::serialize(request).map_err(|err| GeneratorError::Backend {
            message: format!("request encode: {err}"),
        })?;
        let io_err = |err: std::io::Error| GeneratorError::Backend {
            message: format!("bridge io: {err}"),
        };
        bridge
            .stdin
            .write_all(&(frame.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        bridge.stdin.write_all(&frame).map_err(io_err)?;
        bridge.stdin.flush().map_err(io_err)?;

        let mut len_buf = [0u8; 8];
        bridge.stdout.read_exact(&mut len_buf).map_err(io_err)?;
        let mut reply = vec![0u8; u64::from_le_bytes(len_buf) as usize];
        bridge.stdout.read_exact(&mut reply).map_err(io_err)?;
        bincode::deserialize(&reply).map_err(|err| GeneratorError::Backend {
            message: format!("response decode: {err}"),
        })
    }
}

impl Generative for ProcessGenerator {
    fn predict(
        &self,
        forecast: &Array4<f32>,
        constants: &Array3<f32>,
        noise: &Array3<f32>,
    ) -> GeneratorResult {
        let rows = forecast.shape()[1];
        let cols = forecast.shape()[2];
        let forecast_buf: Vec<f32> = forecast.iter().copied().collect();
        let constants_buf: Vec<f32> = constants.iter().copied().collect();
        let noise_buf: Vec<f32> = noise.iter().copied().collect();
        let request = PredictRequest {
            rows,
            cols,
            channels: forecast.shape()[3],
            noise_channels: noise.shape()[2],
            forecast: &forecast_buf,
            constants: &constants_buf,
            noise: &noise_buf,
        };

        let response = self.exchange(&request)?;
        if !response.ok {
            return Err(GeneratorError::Backend {
                message: response.message,
            });
        }
        if response.values.len() != rows * cols {
            return Err(GeneratorError::Shape {
                rows,
                cols,
                got: vec![response.values.len()],
            });
        }
        Array3::from_shape_vec((rows, cols, 1), response.values).map_err(|err| {
            GeneratorError::Backend {
                message: err.to_string(),
            }
        })
    }
}

impl Drop for ProcessGenerator {
    fn drop(&mut self) {
        if let Ok(mut bridge) = self.bridge.lock() {
            let _ = bridge.child.kill();
            let _ = bridge.child.wait();
        }
    }
}
