// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Static constants container: terrain elevation and land-sea mask at model
//! resolution, loaded once per run and shared read-only across draws.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tp_core::Constants;

use crate::error::{io_at, serde_error, StoreError, StoreResult};

const MAGIC: &[u8; 4] = b"TPC1";

#[derive(Serialize, Deserialize)]
struct ConstantsFile {
    rows: usize,
    cols: usize,
    elevation: Vec<f32>,
    land_sea_mask: Vec<f32>,
}

/// Loads the constants pair, validating it against the configured model
/// grid. Elevation is normalized by its maximum (a no-op for containers
/// that already store it normalized); the mask must stay within [0, 1].
pub fn load_constants(path: &Path, rows: usize, cols: usize) -> StoreResult<Constants> {
    let file = File::open(path).map_err(|err| io_at(path, err))?;
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|err| io_at(path, err))?;
    if &magic != MAGIC {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            message: "bad magic".to_string(),
        });
    }
    let mut raw = Vec::new();
    GzDecoder::new(reader)
        .read_to_end(&mut raw)
        .map_err(|err| io_at(path, err))?;
    let parsed: ConstantsFile = bincode::deserialize(&raw).map_err(serde_error)?;

    if parsed.rows != rows || parsed.cols != cols {
        return Err(StoreError::DimensionMismatch {
            context: "constants".to_string(),
            axis: "grid",
            expected: rows * cols,
            got: parsed.rows * parsed.cols,
        });
    }
    let cells = rows * cols;
    if parsed.elevation.len() != cells || parsed.land_sea_mask.len() != cells {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            message: "payload length disagrees with stored grid".to_string(),
        });
    }

    let peak = parsed
        .elevation
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if !peak.is_finite() || peak <= 0.0 {
        return Err(StoreError::BadConstants {
            message: format!("elevation has no positive finite peak (max {peak})"),
        });
    }
    if parsed
        .land_sea_mask
        .iter()
        .any(|&v| !(0.0..=1.0).contains(&v))
    {
        return Err(StoreError::BadConstants {
            message: "land-sea mask leaves [0, 1]".to_string(),
        });
    }

    let elevation = Array2::from_shape_vec(
        (rows, cols),
        parsed.elevation.iter().map(|&v| v / peak).collect(),
    )
    .map_err(serde_error)?;
    let mask = Array2::from_shape_vec((rows, cols), parsed.land_sea_mask).map_err(serde_error)?;

    Constants::new(elevation, mask).map_err(|err| StoreError::BadConstants {
        message: err.to_string(),
    })
}

/// Writes a constants container from raw grids.
pub fn write_constants(
    path: &Path,
    elevation: &Array2<f32>,
    land_sea_mask: &Array2<f32>,
) -> StoreResult<()> {
    let (rows, cols) = elevation.dim();
    let payload = ConstantsFile {
        rows,
        cols,
        elevation: elevation.iter().copied().collect(),
        land_sea_mask: land_sea_mask.iter().copied().collect(),
    };
    let file = File::create(path).map_err(|err| io_at(path, err))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC).map_err(|err| io_at(path, err))?;
    let mut encoder = GzEncoder::new(writer, Compression::default());
    let raw = bincode::serialize(&payload).map_err(serde_error)?;
    encoder.write_all(&raw).map_err(|err| io_at(path, err))?;
    encoder
        .finish()
        .map_err(|err| io_at(path, err))?
        .flush()
        .map_err(|err| io_at(path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_round_trip_and_normalize_elevation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constants.tpc");
        let elevation = Array2::from_shape_fn((4, 3), |(r, _)| 500.0 * (r as f32 + 1.0));
        let mask = Array2::from_elem((4, 3), 1.0f32);
        write_constants(&path, &elevation, &mask).unwrap();

        let constants = load_constants(&path, 4, 3).unwrap();
        let t = constants.tensor();
        // peak row normalizes to exactly 1
        assert_eq!(t[(3, 0, 0)], 1.0);
        assert!((t[(0, 0, 0)] - 0.25).abs() < 1e-6);
        assert_eq!(t[(0, 0, 1)], 1.0);
    }

    #[test]
    fn grid_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constants.tpc");
        let elevation = Array2::from_elem((4, 3), 100.0f32);
        let mask = Array2::from_elem((4, 3), 0.0f32);
        write_constants(&path, &elevation, &mask).unwrap();
        assert!(matches!(
            load_constants(&path, 8, 6),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn mask_outside_unit_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constants.tpc");
        let elevation = Array2::from_elem((2, 2), 100.0f32);
        let mask = Array2::from_elem((2, 2), 1.5f32);
        write_constants(&path, &elevation, &mask).unwrap();
        assert!(matches!(
            load_constants(&path, 2, 2),
            Err(StoreError::BadConstants { .. })
        ));
    }

    #[test]
    fn flat_zero_elevation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constants.tpc");
        let elevation = Array2::from_elem((2, 2), 0.0f32);
        let mask = Array2::from_elem((2, 2), 0.5f32);
        write_constants(&path, &elevation, &mask).unwrap();
        assert!(matches!(
            load_constants(&path, 2, 2),
            Err(StoreError::BadConstants { .. })
        ));
    }
}
