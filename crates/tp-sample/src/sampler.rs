// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The ensemble sampling loop.
//!
//! Draws run under a bounded worker pool, but every numeric result is a
//! pure function of (run seed, member, valid time, attempt) and of the
//! shared read-only conditioning tensors, so the published volume is
//! identical whatever the completion order. Writes funnel through the
//! single volume handle in member order.

use ndarray::Array2;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use tp_core::{denormalize_precip, Constants, ModelInput};
use tp_store::OutputVolume;

use crate::error::{SampleError, SampleResult};
use crate::generator::{Generative, PredictContext};
use crate::noise::NoiseSource;

/// Lifecycle of one date's sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplePhase {
    Idle,
    Assembling,
    Sampling { member: usize },
    Writing { member: usize },
    Done,
    Failed,
}

/// Cooperative cancellation flag, checked between members. A cancelled
/// date never publishes: the volume handle is dropped unclosed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one date's sampling needs, already assembled and read-only.
pub struct DatePlan<'a> {
    pub time_idx: usize,
    /// One conditioning tensor per valid time, in valid-time order.
    pub inputs: &'a [ModelInput],
    pub constants: &'a Constants,
    /// Cap applied by the inverse precipitation rule, mm/h.
    pub cap_mm_h: f32,
}

/// Outcome of a completed date.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleReport {
    pub members: usize,
    pub valid_times: usize,
    pub retries: usize,
}

/// Drives N independent draws per valid time through the capability.
pub struct EnsembleSampler {
    members: usize,
    pool: ThreadPool,
    phase: Mutex<SamplePhase>,
}

impl EnsembleSampler {
    pub fn new(members: usize, workers: usize) -> Self {
        let workers = workers.clamp(1, members.max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tp-sample-{i}"))
            .build()
            .expect("sampler pool");
        Self {
            members,
            pool,
            phase: Mutex::new(SamplePhase::Idle),
        }
    }

    pub fn phase(&self) -> SamplePhase {
        *self.phase.lock().expect("phase lock")
    }

    fn transition(&self, next: SamplePhase) {
        let mut phase = self.phase.lock().expect("phase lock");
        debug!(?next, "sampler transition");
        *phase = next;
    }

    /// Samples and writes every `(member, valid_time)` slot of one date.
    ///
    /// A failed invocation is retried exactly once with fresh noise; a
    /// second failure aborts the date. Exactly `members` slots per valid
    /// time are written on success, never fewer.
    pub fn run_date(
        &self,
        plan: &DatePlan<'_>,
        noise: &NoiseSource,
        generator: &(dyn Generative + Sync),
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> SampleResult<SampleReport> {
        self.transition(SamplePhase::Assembling);
        let result = self.run_date_inner(plan, noise, generator, volume, cancel);
        match &result {
            Ok(_) => self.transition(SamplePhase::Done),
            Err(_) => self.transition(SamplePhase::Failed),
        }
        result
    }

    fn run_date_inner(
        &self,
        plan: &DatePlan<'_>,
        noise: &NoiseSource,
        generator: &(dyn Generative + Sync),
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> SampleResult<SampleReport> {
        let mut retries = 0usize;
        for (valid_idx, input) in plan.inputs.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SampleError::Cancelled { member: 0 });
            }
            let ctx = PredictContext {
                input,
                constants: plan.constants,
            };

            let drawn: Vec<SampleResult<(usize, Array2<f32>, usize)>> =
                self.pool.install(|| {
                    (0..self.members)
                        .into_par_iter()
                        .map(|member| {
                            if cancel.is_cancelled() {
                                return Err(SampleError::Cancelled { member });
                            }
                            self.transition(SamplePhase::Sampling { member });
                            draw_member(
                                &ctx,
                                noise,
                                generator,
                                member,
                                valid_idx,
                                plan.cap_mm_h,
                            )
                        })
                        .collect()
                });

            let mut planes: Vec<(usize, Array2<f32>)> = Vec::with_capacity(self.members);
            for result in drawn {
                let (member, plane, attempts) = result?;
                retries += attempts;
                planes.push((member, plane));
            }
            planes.sort_by_key(|(member, _)| *member);

            for (member, plane) in planes {
                if cancel.is_cancelled() {
                    return Err(SampleError::Cancelled { member });
                }
                self.transition(SamplePhase::Writing { member });
                volume.write(plan.time_idx, member, valid_idx, plane.view())?;
            }
        }

        let report = SampleReport {
            members: self.members,
            valid_times: plan.inputs.len(),
            retries,
        };
        info!(
            members = report.members,
            valid_times = report.valid_times,
            retries = report.retries,
            "date sampled"
        );
        Ok(report)
    }
}

/// One member's realization: draw, invoke, invert the precipitation rule.
/// Returns how many retries were spent.
fn draw_member(
    ctx: &PredictContext<'_>,
    noise: &NoiseSource,
    generator: &(dyn Generative + Sync),
    member: usize,
    valid_idx: usize,
    cap_mm_h: f32,
) -> SampleResult<(usize, Array2<f32>, usize)> {
    let (rows, cols) = ctx.input.grid();
    let attempt_once = |attempt: u8| {
        let tensor = noise.draw(rows, cols, member, valid_idx, attempt);
        ctx.invoke(generator, &tensor)
    };

    let prediction = match attempt_once(0) {
        Ok(prediction) => (prediction, 0usize),
        Err(err) => {
            warn!(member, valid_idx, error = %err, "draw failed, retrying with fresh noise");
            let retried = attempt_once(1).map_err(|err| SampleError::SampleFailed {
                member,
                message: err.to_string(),
            })?;
            (retried, 1)
        }
    };

    let (prediction, attempts) = prediction;
    let mut plane = Array2::<f32>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            plane[(r, c)] = denormalize_precip(prediction[(r, c, 0)], cap_mm_h);
        }
    }
    Ok((member, plane, attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{BaselineGenerator, FnGenerator, GeneratorError};
    use ndarray::{Array2, Array3, Array4};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tp_core::{assemble, ChannelStats, Constants};
    use tp_store::{OutputVolume, VolumeDims};

    const ROWS: usize = 6;
    const COLS: usize = 5;

    fn plan_fixture() -> (Vec<ModelInput>, Constants) {
        let mut channels = HashMap::new();
        channels.insert(
            "apcp".to_string(),
            ChannelStats {
                mean_t0: Array2::from_elem((ROWS, COLS), 0.4),
                std_t0: Array2::from_elem((ROWS, COLS), 0.2),
                mean_t1: Array2::from_elem((ROWS, COLS), 0.5),
                std_t1: Array2::from_elem((ROWS, COLS), 0.1),
            },
        );
        let order = vec!["apcp".to_string()];
        let inputs = vec![
            assemble(&order, &channels, ROWS, COLS).unwrap(),
            assemble(&order, &channels, ROWS, COLS).unwrap(),
        ];
        let constants = Constants::new(
            Array2::from_elem((ROWS, COLS), 0.3),
            Array2::from_elem((ROWS, COLS), 1.0),
        )
        .unwrap();
        (inputs, constants)
    }

    fn volume(dir: &std::path::Path, members: usize) -> (OutputVolume, usize) {
        let mut vol = OutputVolume::create(
            &dir.join("out.tpv"),
            VolumeDims {
                members,
                rows: ROWS,
                cols: COLS,
            },
            vec![30, 36],
        )
        .unwrap();
        let t = vol.time_index(2024031700);
        (vol, t)
    }

    fn plan<'a>(
        time_idx: usize,
        inputs: &'a [ModelInput],
        constants: &'a Constants,
    ) -> DatePlan<'a> {
        DatePlan {
            time_idx,
            inputs,
            constants,
            cap_mm_h: 100.0,
        }
    }

    #[test]
    fn fills_exactly_n_member_slots() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let (mut vol, t) = volume(dir.path(), 4);
        let sampler = EnsembleSampler::new(4, 2);
        let noise = NoiseSource::new(42, 3);

        let report = sampler
            .run_date(
                &plan(t, &inputs, &constants),
                &noise,
                &BaselineGenerator::default(),
                &mut vol,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(report.members, 4);
        assert_eq!(vol.members_written(t), 4);
        assert_eq!(vol.slots_written(t), 8);
        assert_eq!(sampler.phase(), SamplePhase::Done);
    }

    #[test]
    fn parallel_and_serial_runs_publish_identical_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let noise = NoiseSource::new(7, 2);

        let mut planes = Vec::new();
        for workers in [1usize, 4] {
            let sub = dir.path().join(format!("w{workers}"));
            std::fs::create_dir_all(&sub).unwrap();
            let (mut vol, t) = volume(&sub, 6);
            let sampler = EnsembleSampler::new(6, workers);
            sampler
                .run_date(
                    &plan(t, &inputs, &constants),
                    &noise,
                    &BaselineGenerator::default(),
                    &mut vol,
                    &CancelToken::new(),
                )
                .unwrap();
            let path = vol.close().unwrap();
            let reader = tp_store::VolumeReader::open(&path).unwrap();
            planes.push(
                (0..6)
                    .map(|m| reader.read(0, m, 1).unwrap())
                    .collect::<Vec<_>>(),
            );
        }
        for (a, b) in planes[0].iter().zip(planes[1].iter()) {
            assert!(a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn one_flaky_draw_is_retried_and_the_count_still_lands_on_n() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let (mut vol, t) = volume(dir.path(), 3);
        let sampler = EnsembleSampler::new(3, 1);
        let noise = NoiseSource::new(1, 1);

        let failures = AtomicUsize::new(0);
        let flaky = FnGenerator(
            move |fc: &Array4<f32>, _: &Array3<f32>, nz: &Array3<f32>| {
                // first invocation ever fails; everything after succeeds
                if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(GeneratorError::Backend {
                        message: "transient".to_string(),
                    });
                }
                let rows = fc.shape()[1];
                let cols = fc.shape()[2];
                let mut out = Array3::<f32>::zeros((rows, cols, 1));
                for r in 0..rows {
                    for c in 0..cols {
                        out[(r, c, 0)] = nz[(r, c, 0)];
                    }
                }
                Ok(out)
            },
        );

        let report = sampler
            .run_date(
                &plan(t, &inputs, &constants),
                &noise,
                &flaky,
                &mut vol,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(report.retries, 1);
        assert_eq!(vol.members_written(t), 3);
        assert_eq!(vol.slots_written(t), 6);
    }

    #[test]
    fn two_failures_for_one_member_abort_the_date() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let (mut vol, t) = volume(dir.path(), 2);
        let sampler = EnsembleSampler::new(2, 1);
        let noise = NoiseSource::new(1, 1);

        let broken = FnGenerator(|_: &Array4<f32>, _: &Array3<f32>, _: &Array3<f32>| {
            Err(GeneratorError::Backend {
                message: "accelerator gone".to_string(),
            })
        });
        let err = sampler
            .run_date(
                &plan(t, &inputs, &constants),
                &noise,
                &broken,
                &mut vol,
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SampleError::SampleFailed { member: 0, .. }));
        assert_eq!(sampler.phase(), SamplePhase::Failed);
    }

    #[test]
    fn cancellation_discards_the_date() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let (mut vol, t) = volume(dir.path(), 2);
        let sampler = EnsembleSampler::new(2, 1);
        let noise = NoiseSource::new(1, 1);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = sampler
            .run_date(
                &plan(t, &inputs, &constants),
                &noise,
                &BaselineGenerator::default(),
                &mut vol,
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err, SampleError::Cancelled { .. }));
        drop(vol);
        assert!(!dir.path().join("out.tpv").exists());
    }

    #[test]
    fn predictions_cap_at_the_configured_rate() {
        let dir = tempfile::tempdir().unwrap();
        let (inputs, constants) = plan_fixture();
        let (mut vol, t) = volume(dir.path(), 1);
        let sampler = EnsembleSampler::new(1, 1);
        let noise = NoiseSource::new(1, 1);

        // log-space 3.0 denormalizes to 999, far past the cap
        let hot = FnGenerator(|fc: &Array4<f32>, _: &Array3<f32>, _: &Array3<f32>| {
            Ok(Array3::from_elem((fc.shape()[1], fc.shape()[2], 1), 3.0f32))
        });
        sampler
            .run_date(&plan(t, &inputs, &constants), &noise, &hot, &mut vol, &CancelToken::new())
            .unwrap();
        let path = vol.close().unwrap();
        let reader = tp_store::VolumeReader::open(&path).unwrap();
        assert!(reader
            .read(0, 0, 0)
            .unwrap()
            .iter()
            .all(|&v| v == 100.0));
    }
}
