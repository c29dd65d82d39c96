// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::Array3;

use crate::error::{CoreError, CoreResult};
use crate::grid::FieldGrid;

/// Per-cell mean and population standard deviation across the member axis.
#[derive(Clone, Debug)]
pub struct FieldStatistics {
    pub mean: Array3<f32>,
    pub std: Array3<f32>,
}

/// Reduces the member axis of an already-regridded field to per-cell mean
/// and population standard deviation.
///
/// Non-finite member values are treated as missing and skipped; a cell with
/// zero valid members is an error, never a silent zero. A single valid
/// member yields std == 0 and mean == that member's value exactly.
pub fn reduce(field: &FieldGrid) -> CoreResult<FieldStatistics> {
    let values = field.values();
    let (members, steps) = (field.members(), field.steps());
    let (rows, cols) = field.grid();

    let mut mean = Array3::<f32>::zeros((steps, rows, cols));
    let mut std = Array3::<f32>::zeros((steps, rows, cols));

    for s in 0..steps {
        for r in 0..rows {
            for c in 0..cols {
                let mut sum = 0.0f64;
                let mut sum_sq = 0.0f64;
                let mut count = 0u32;
                for m in 0..members {
                    let v = values[(m, s, r, c)];
                    if v.is_finite() {
                        let v = v as f64;
                        sum += v;
                        sum_sq += v * v;
                        count += 1;
                    }
                }
                if count == 0 {
                    return Err(CoreError::InsufficientMembers {
                        field: field.name().to_string(),
                        step: s,
                        row: r,
                        col: c,
                    });
                }
                let n = count as f64;
                let mu = sum / n;
                let var = (sum_sq / n - mu * mu).max(0.0);
                mean[(s, r, c)] = mu as f32;
                std[(s, r, c)] = var.sqrt() as f32;
            }
        }
    }

    Ok(FieldStatistics { mean, std })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn grid_of(members: usize, steps: usize, rows: usize, cols: usize, fill: f32) -> FieldGrid {
        FieldGrid::new("tmp", Array4::from_elem((members, steps, rows, cols), fill)).unwrap()
    }

    #[test]
    fn ones_field_reduces_to_unit_mean_zero_std() {
        // 155x141 native, five members, two steps, regridded then reduced.
        let field = grid_of(5, 2, 155, 141, 1.0).resize_to(384, 352).unwrap();
        let stats = reduce(&field).unwrap();
        assert_eq!(stats.mean.dim(), (2, 384, 352));
        assert!(stats.mean.iter().all(|&v| v == 1.0));
        assert!(stats.std.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_member_yields_exact_mean_and_zero_std() {
        let mut values = Array4::<f32>::zeros((1, 1, 2, 2));
        values[(0, 0, 0, 0)] = 3.25;
        values[(0, 0, 1, 1)] = -7.5;
        let stats = reduce(&FieldGrid::new("tmp", values).unwrap()).unwrap();
        assert_eq!(stats.mean[(0, 0, 0)], 3.25);
        assert_eq!(stats.mean[(0, 1, 1)], -7.5);
        assert!(stats.std.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn population_std_over_two_members() {
        let mut values = Array4::<f32>::zeros((2, 1, 1, 1));
        values[(0, 0, 0, 0)] = 2.0;
        values[(1, 0, 0, 0)] = 4.0;
        let stats = reduce(&FieldGrid::new("pwat", values).unwrap()).unwrap();
        assert!((stats.mean[(0, 0, 0)] - 3.0).abs() < 1e-6);
        // population std of {2, 4} is 1, not sqrt(2)
        assert!((stats.std[(0, 0, 0)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nan_members_are_skipped() {
        let mut values = Array4::<f32>::zeros((3, 1, 1, 1));
        values[(0, 0, 0, 0)] = 5.0;
        values[(1, 0, 0, 0)] = f32::NAN;
        values[(2, 0, 0, 0)] = 5.0;
        let stats = reduce(&FieldGrid::new("cape", values).unwrap()).unwrap();
        assert_eq!(stats.mean[(0, 0, 0)], 5.0);
        assert_eq!(stats.std[(0, 0, 0)], 0.0);
    }

    #[test]
    fn all_missing_cell_is_an_error() {
        let mut values = Array4::<f32>::ones((2, 1, 2, 2));
        values[(0, 0, 1, 0)] = f32::NAN;
        values[(1, 0, 1, 0)] = f32::NAN;
        match reduce(&FieldGrid::new("apcp", values).unwrap()) {
            Err(CoreError::InsufficientMembers {
                field,
                step,
                row,
                col,
            }) => {
                assert_eq!(field, "apcp");
                assert_eq!((step, row, col), (0, 1, 0));
            }
            other => panic!("expected InsufficientMembers, got {other:?}"),
        }
    }
}
