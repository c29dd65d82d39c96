// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array2, Array3, Array4, Axis};
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};

/// Channels contributed by one field: normalized ensemble mean and spread at
/// the two input steps. Exactly four channels per field, in this order.
#[derive(Clone, Debug)]
pub struct ChannelStats {
    pub mean_t0: Array2<f32>,
    pub std_t0: Array2<f32>,
    pub mean_t1: Array2<f32>,
    pub std_t1: Array2<f32>,
}

impl ChannelStats {
    fn planes(&self) -> [&Array2<f32>; 4] {
        [&self.mean_t0, &self.std_t0, &self.mean_t1, &self.std_t1]
    }
}

/// The conditioning tensor handed to the generative capability, shaped
/// `(1, rows, cols, fields * 4)` with a leading batch axis. Channel order is
/// field-major then stat-minor and must match what the capability was
/// trained against, so it is fixed here and nowhere else.
#[derive(Clone, Debug)]
pub struct ModelInput {
    tensor: Array4<f32>,
}

impl ModelInput {
    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    /// `(rows, cols)` of the model grid.
    pub fn grid(&self) -> (usize, usize) {
        let s = self.tensor.shape();
        (s[1], s[2])
    }

    pub fn channels(&self) -> usize {
        self.tensor.shape()[3]
    }
}

/// Concatenates per-field channel planes in the configured field order.
///
/// Every configured field must be present with grids matching `(rows, cols)`;
/// a missing field means the channel layout would silently shift, which the
/// capability cannot detect, so it is rejected up front.
pub fn assemble(
    field_order: &[String],
    channels: &HashMap<String, ChannelStats>,
    rows: usize,
    cols: usize,
) -> CoreResult<ModelInput> {
    let mut tensor = Array4::<f32>::zeros((1, rows, cols, field_order.len() * 4));
    for (f, field) in field_order.iter().enumerate() {
        let stats = channels
            .get(field)
            .ok_or_else(|| CoreError::ChannelOrderMismatch {
                field: field.clone(),
            })?;
        for (k, plane) in stats.planes().into_iter().enumerate() {
            if plane.dim() != (rows, cols) {
                return Err(CoreError::GridMismatch {
                    field: field.clone(),
                    expected_rows: rows,
                    expected_cols: cols,
                    rows: plane.nrows(),
                    cols: plane.ncols(),
                });
            }
            let mut slot = tensor.index_axis_mut(Axis(0), 0);
            let mut slot = slot.index_axis_mut(Axis(2), f * 4 + k);
            slot.assign(plane);
        }
    }
    Ok(ModelInput { tensor })
}

/// Static conditioning pair: normalized terrain elevation and land-sea mask,
/// stacked as `(rows, cols, 2)`. Built once per run and shared read-only
/// across every draw.
#[derive(Clone, Debug)]
pub struct Constants {
    tensor: Array3<f32>,
}

impl Constants {
    pub fn new(elevation: Array2<f32>, land_sea_mask: Array2<f32>) -> CoreResult<Self> {
        if elevation.dim() != land_sea_mask.dim() {
            return Err(CoreError::GridMismatch {
                field: "land_sea_mask".to_string(),
                expected_rows: elevation.nrows(),
                expected_cols: elevation.ncols(),
                rows: land_sea_mask.nrows(),
                cols: land_sea_mask.ncols(),
            });
        }
        let (rows, cols) = elevation.dim();
        if rows == 0 || cols == 0 {
            return Err(CoreError::EmptyGrid {
                field: "elevation".to_string(),
            });
        }
        let mut tensor = Array3::<f32>::zeros((rows, cols, 2));
        tensor.index_axis_mut(Axis(2), 0).assign(&elevation);
        tensor.index_axis_mut(Axis(2), 1).assign(&land_sea_mask);
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Array3<f32> {
        &self.tensor
    }

    pub fn grid(&self) -> (usize, usize) {
        let s = self.tensor.shape();
        (s[0], s[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_of(fill: f32, rows: usize, cols: usize) -> ChannelStats {
        ChannelStats {
            mean_t0: Array2::from_elem((rows, cols), fill),
            std_t0: Array2::from_elem((rows, cols), fill + 0.25),
            mean_t1: Array2::from_elem((rows, cols), fill + 0.5),
            std_t1: Array2::from_elem((rows, cols), fill + 0.75),
        }
    }

    #[test]
    fn channel_order_is_field_major_stat_minor() {
        let order = vec!["apcp".to_string(), "tmp".to_string()];
        let mut channels = HashMap::new();
        channels.insert("apcp".to_string(), stats_of(0.0, 3, 4));
        channels.insert("tmp".to_string(), stats_of(10.0, 3, 4));
        let input = assemble(&order, &channels, 3, 4).unwrap();

        assert_eq!(input.tensor().shape(), &[1, 3, 4, 8]);
        let t = input.tensor();
        // apcp occupies channels 0..4 as mean_t0, std_t0, mean_t1, std_t1
        assert_eq!(t[(0, 0, 0, 0)], 0.0);
        assert_eq!(t[(0, 0, 0, 1)], 0.25);
        assert_eq!(t[(0, 0, 0, 2)], 0.5);
        assert_eq!(t[(0, 0, 0, 3)], 0.75);
        // tmp occupies channels 4..8
        assert_eq!(t[(0, 2, 3, 4)], 10.0);
        assert_eq!(t[(0, 2, 3, 7)], 10.75);
    }

    #[test]
    fn absent_configured_field_is_rejected() {
        let order = vec!["apcp".to_string(), "tmp".to_string()];
        let mut channels = HashMap::new();
        channels.insert("tmp".to_string(), stats_of(1.0, 2, 2));
        match assemble(&order, &channels, 2, 2) {
            Err(CoreError::ChannelOrderMismatch { field }) => assert_eq!(field, "apcp"),
            other => panic!("expected ChannelOrderMismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_plane_shape_is_rejected() {
        let order = vec!["apcp".to_string()];
        let mut channels = HashMap::new();
        channels.insert("apcp".to_string(), stats_of(0.0, 2, 3));
        assert!(matches!(
            assemble(&order, &channels, 4, 4),
            Err(CoreError::GridMismatch { .. })
        ));
    }

    #[test]
    fn constants_stack_in_fixed_order() {
        let elevation = Array2::from_elem((2, 2), 0.75f32);
        let mask = Array2::from_elem((2, 2), 1.0f32);
        let constants = Constants::new(elevation, mask).unwrap();
        assert_eq!(constants.tensor().shape(), &[2, 2, 2]);
        assert_eq!(constants.tensor()[(0, 0, 0)], 0.75);
        assert_eq!(constants.tensor()[(0, 0, 1)], 1.0);
    }

    #[test]
    fn mismatched_constant_grids_are_rejected() {
        let elevation = Array2::from_elem((2, 2), 0.5f32);
        let mask = Array2::from_elem((3, 2), 1.0f32);
        assert!(matches!(
            Constants::new(elevation, mask),
            Err(CoreError::GridMismatch { .. })
        ));
    }
}
