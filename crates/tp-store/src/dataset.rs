// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-field, per-year forecast dataset containers.
//!
//! One container holds one primary variable with dimensions
//! `(time, member, step, lat, lon)`. The payload is chunked per
//! initialization time so selecting one forecast date never touches the
//! rest of the year: a small bincode header up front, then one
//! gzip-compressed chunk per time coordinate.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array4, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{io_at, serde_error, StoreError, StoreResult};

const MAGIC: &[u8; 4] = b"TPD1";

/// Container header: coordinates and identity of the single variable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetHeader {
    /// Canonical field name the pipeline knows this dataset by.
    pub field: String,
    /// Variable name as carried by the producing system.
    pub variable: String,
    pub units: String,
    pub long_name: String,
    /// Initialization times as `YYYYMMDDHH` keys, ascending.
    pub times: Vec<i64>,
    pub members: Vec<i32>,
    /// Forecast lead hours, ascending.
    pub step_hours: Vec<i64>,
    pub lats: Vec<f32>,
    pub lons: Vec<f32>,
}

impl DatasetHeader {
    fn cells_per_time(&self) -> usize {
        self.members.len() * self.step_hours.len() * self.lats.len() * self.lons.len()
    }
}

/// Read handle over one container. Chunk offsets are indexed at open time;
/// selection decompresses a single time chunk.
pub struct ForecastDataset {
    path: PathBuf,
    header: DatasetHeader,
    offsets: Vec<u64>,
}

impl ForecastDataset {
    pub fn open(path: &Path) -> StoreResult<Self> {
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
        let header_len = read_u64(&mut reader, path)?;
        let mut header_bytes = vec![0u8; header_len as usize];
        reader
            .read_exact(&mut header_bytes)
            .map_err(|err| io_at(path, err))?;
        let header: DatasetHeader = bincode::deserialize(&header_bytes).map_err(serde_error)?;

        let mut offsets = Vec::with_capacity(header.times.len());
        let mut pos = 4 + 8 + header_len;
        for _ in &header.times {
            offsets.push(pos);
            reader
                .seek(SeekFrom::Start(pos))
                .map_err(|err| io_at(path, err))?;
            let chunk_len = read_u64(&mut reader, path)?;
            pos += 8 + chunk_len;
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            offsets,
        })
    }

    /// Opens `<root>/<field>_<year>.tpd` and verifies it carries the
    /// variable the input mapping expects for that field.
    pub fn open_for_year(
        root: &Path,
        field: &str,
        year: u32,
        expected_variable: &str,
    ) -> StoreResult<Self> {
        let path = root.join(format!("{field}_{year}.tpd"));
        if !path.exists() {
            return Err(StoreError::MissingDataset {
                field: field.to_string(),
                path,
            });
        }
        let ds = Self::open(&path)?;
        if ds.header.variable != expected_variable {
            return Err(StoreError::VariableMismatch {
                field: field.to_string(),
                expected: expected_variable.to_string(),
                got: ds.header.variable.clone(),
            });
        }
        Ok(ds)
    }

    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    /// Native `(lat, lon)` grid of the container.
    pub fn grid(&self) -> (usize, usize) {
        (self.header.lats.len(), self.header.lons.len())
    }

    /// Resolves each valid lead hour to the `(t0, t1)` step-index pair used
    /// as model input, applying the configured offset convention.
    pub fn resolve_steps(
        &self,
        valid_hours: &[i64],
        offsets: (i64, i64),
    ) -> StoreResult<Vec<(usize, usize)>> {
        let steps = &self.header.step_hours;
        let mut pairs = Vec::with_capacity(valid_hours.len());
        for &hour in valid_hours {
            let idx = steps.iter().position(|&s| s == hour).ok_or_else(|| {
                StoreError::StepNotCovered {
                    field: self.header.field.clone(),
                    hour,
                }
            })? as i64;
            let mut pair = [0usize; 2];
            for (slot, off) in pair.iter_mut().zip([offsets.0, offsets.1]) {
                let resolved = idx + off;
                if resolved < 0 || resolved as usize >= steps.len() {
                    return Err(StoreError::StepOutOfRange {
                        field: self.header.field.clone(),
                        index: resolved,
                        len: steps.len(),
                    });
                }
                *slot = resolved as usize;
            }
            pairs.push((pair[0], pair[1]));
        }
        Ok(pairs)
    }

    /// Loads the `(member, 2, lat, lon)` slab for one initialization time
    /// and one `(t0, t1)` step pair.
    pub fn select(&self, time_key: i64, pair: (usize, usize)) -> StoreResult<Array4<f32>> {
        let t_idx = self
            .header
            .times
            .iter()
            .position(|&t| t == time_key)
            .ok_or_else(|| StoreError::MissingDate {
                field: self.header.field.clone(),
                date: time_key,
            })?;

        let full = self.read_time(t_idx)?;
        Ok(full.select(Axis(1), &[pair.0, pair.1]))
    }

    /// Loads the full `(member, step, lat, lon)` slab at one time index.
    pub fn read_time(&self, t_idx: usize) -> StoreResult<Array4<f32>> {
        let path = &self.path;
        let file = File::open(path).map_err(|err| io_at(path, err))?;
        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.offsets[t_idx]))
            .map_err(|err| io_at(path, err))?;
        let chunk_len = read_u64(&mut reader, path)?;
        let mut compressed = vec![0u8; chunk_len as usize];
        reader
            .read_exact(&mut compressed)
            .map_err(|err| io_at(path, err))?;

        let mut raw = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut raw)
            .map_err(|err| io_at(path, err))?;
        let values: Vec<f32> = bincode::deserialize(&raw).map_err(serde_error)?;

        let expected = self.header.cells_per_time();
        if values.len() != expected {
            return Err(StoreError::DimensionMismatch {
                context: format!("{} time chunk {t_idx}", self.header.field),
                axis: "cells",
                expected,
                got: values.len(),
            });
        }
        let shape = (
            self.header.members.len(),
            self.header.step_hours.len(),
            self.header.lats.len(),
            self.header.lons.len(),
        );
        Array4::from_shape_vec(shape, values).map_err(serde_error)
    }
}

/// Writes a container: one `(member, step, lat, lon)` slab per time
/// coordinate, in header order.
pub fn write_dataset(
    path: &Path,
    header: &DatasetHeader,
    slabs: &[Array4<f32>],
) -> StoreResult<()> {
    if slabs.len() != header.times.len() {
        return Err(StoreError::DimensionMismatch {
            context: format!("{} container", header.field),
            axis: "time",
            expected: header.times.len(),
            got: slabs.len(),
        });
    }
    let expected_shape = (
        header.members.len(),
        header.step_hours.len(),
        header.lats.len(),
        header.lons.len(),
    );
    for slab in slabs {
        if slab.dim() != expected_shape {
            return Err(StoreError::DimensionMismatch {
                context: format!("{} container", header.field),
                axis: "cells",
                expected: header.cells_per_time(),
                got: slab.len(),
            });
        }
    }

    let file = File::create(path).map_err(|err| io_at(path, err))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC).map_err(|err| io_at(path, err))?;
    let header_bytes = bincode::serialize(header).map_err(serde_error)?;
    writer
        .write_all(&(header_bytes.len() as u64).to_le_bytes())
        .map_err(|err| io_at(path, err))?;
    writer
        .write_all(&header_bytes)
        .map_err(|err| io_at(path, err))?;

    for slab in slabs {
        let raw = bincode::serialize(&slab.iter().copied().collect::<Vec<f32>>())
            .map_err(serde_error)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).map_err(|err| io_at(path, err))?;
        let compressed = encoder.finish().map_err(|err| io_at(path, err))?;
        writer
            .write_all(&(compressed.len() as u64).to_le_bytes())
            .map_err(|err| io_at(path, err))?;
        writer
            .write_all(&compressed)
            .map_err(|err| io_at(path, err))?;
    }
    writer.flush().map_err(|err| io_at(path, err))?;
    Ok(())
}

fn read_u64(reader: &mut impl Read, path: &Path) -> StoreResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(|err| io_at(path, err))?;
    Ok(u64::from_le_bytes(buf))
}
