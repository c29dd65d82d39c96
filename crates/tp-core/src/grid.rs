// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array2, Array4, ArrayView2};

use crate::error::{CoreError, CoreResult};

/// One physical field of a low-resolution ensemble forecast, laid out as
/// `(member, step, rows, cols)` on the native grid. Missing members are
/// carried as NaN and skipped by the statistics pass.
#[derive(Clone, Debug)]
pub struct FieldGrid {
    name: String,
    values: Array4<f32>,
}

impl FieldGrid {
    pub fn new(name: impl Into<String>, values: Array4<f32>) -> CoreResult<Self> {
        let name = name.into();
        if values.shape().iter().any(|&n| n == 0) {
            return Err(CoreError::EmptyGrid { field: name });
        }
        Ok(Self { name, values })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &Array4<f32> {
        &self.values
    }

    pub fn members(&self) -> usize {
        self.values.shape()[0]
    }

    pub fn steps(&self) -> usize {
        self.values.shape()[1]
    }

    /// Native `(rows, cols)` grid.
    pub fn grid(&self) -> (usize, usize) {
        (self.values.shape()[2], self.values.shape()[3])
    }

    /// Resizes every member and step to the model grid. The interpolation is
    /// applied per member *before* any statistics are computed, so the
    /// reduction sees all members on a common grid.
    pub fn resize_to(&self, rows: usize, cols: usize) -> CoreResult<FieldGrid> {
        if rows == 0 || cols == 0 {
            return Err(CoreError::EmptyGrid {
                field: self.name.clone(),
            });
        }
        let (members, steps) = (self.members(), self.steps());
        let mut out = Array4::<f32>::zeros((members, steps, rows, cols));
        for m in 0..members {
            for s in 0..steps {
                let src = self.values.index_axis(ndarray::Axis(0), m);
                let src = src.index_axis(ndarray::Axis(0), s);
                let resized = resize_bilinear(&src, rows, cols);
                out.index_axis_mut(ndarray::Axis(0), m)
                    .index_axis_mut(ndarray::Axis(0), s)
                    .assign(&resized);
            }
        }
        FieldGrid::new(self.name.clone(), out)
    }
}

/// Deterministic bilinear interpolation onto a `rows x cols` grid.
///
/// Corner-aligned: source and target corners coincide, so a constant input
/// maps to the exact same constant and NaN cells poison only the output
/// cells whose stencil touches them.
pub fn resize_bilinear(src: &ArrayView2<'_, f32>, rows: usize, cols: usize) -> Array2<f32> {
    let (h0, w0) = (src.nrows(), src.ncols());
    if h0 == rows && w0 == cols {
        return src.to_owned();
    }
    let row_scale = if rows > 1 {
        (h0 - 1) as f64 / (rows - 1) as f64
    } else {
        0.0
    };
    let col_scale = if cols > 1 {
        (w0 - 1) as f64 / (cols - 1) as f64
    } else {
        0.0
    };

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let sy = r as f64 * row_scale;
        let sx = c as f64 * col_scale;
        let y0 = sy.floor() as usize;
        let x0 = sx.floor() as usize;
        let y1 = (y0 + 1).min(h0 - 1);
        let x1 = (x0 + 1).min(w0 - 1);
        let fy = (sy - y0 as f64) as f32;
        let fx = (sx - x0 as f64) as f32;

        let v00 = src[(y0, x0)];
        let v01 = src[(y0, x1)];
        let v10 = src[(y1, x0)];
        let v11 = src[(y1, x1)];

        let top = v00 + fx * (v01 - v00);
        let bottom = v10 + fx * (v11 - v10);
        top + fy * (bottom - top)
    })
}
