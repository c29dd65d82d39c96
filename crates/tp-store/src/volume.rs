// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of Tempest — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The published forecast volume.
//!
//! Dimensions are `(time, member, valid_time, lat, lon)`: time and
//! valid_time are appendable coordinates, member/lat/lon are fixed by the
//! run. The single variable `precipitation` (mm/h) is gzip-compressed per
//! `(1, 1, 1, lat, lon)` chunk. Writers stage everything and publish with
//! one atomic rename on close, so a reader can never observe a truncated
//! volume and an aborted date leaves nothing behind.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{io_at, serde_error, StoreError, StoreResult};

const MAGIC: &[u8; 4] = b"TPV1";
const VARIABLE: &str = "precipitation";
const UNITS: &str = "mm/h";

/// Fixed axes of a volume. Time and valid_time live in the header's
/// coordinate vectors instead, since they append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDims {
    pub members: usize,
    pub rows: usize,
    pub cols: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VolumeHeader {
    variable: String,
    units: String,
    dims: VolumeDims,
    /// Initialization times as `YYYYMMDDHH` keys.
    times: Vec<i64>,
    /// Lead hours of the valid_time axis.
    valid_hours: Vec<i64>,
}

type ChunkKey = (usize, usize, usize);

/// Write handle for one volume file. All chunks are staged in memory and
/// nothing touches the target path until [`close`](Self::close).
pub struct OutputVolume {
    path: PathBuf,
    header: VolumeHeader,
    chunks: BTreeMap<ChunkKey, Vec<u8>>,
}

impl OutputVolume {
    /// Creates a writer for `path`. When the file already exists its
    /// coordinates and chunks are carried over, so re-running a date
    /// overwrites slots instead of duplicating coordinates.
    pub fn create(path: &Path, dims: VolumeDims, valid_hours: Vec<i64>) -> StoreResult<Self> {
        if path.exists() {
            let existing = VolumeReader::open(path)?;
            if existing.header.dims != dims || existing.header.valid_hours != valid_hours {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    message: "existing volume disagrees with the run's schema".to_string(),
                });
            }
            debug!(path = %path.display(), "reopening existing volume for overwrite");
            return Ok(Self {
                path: path.to_path_buf(),
                header: existing.header,
                chunks: existing.chunks,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            header: VolumeHeader {
                variable: VARIABLE.to_string(),
                units: UNITS.to_string(),
                dims,
                times: Vec::new(),
                valid_hours,
            },
            chunks: BTreeMap::new(),
        })
    }

    /// Index of `time_key` on the time axis, appending the coordinate when
    /// it is new. Re-runs of the same date land on the existing index.
    pub fn time_index(&mut self, time_key: i64) -> usize {
        match self.header.times.iter().position(|&t| t == time_key) {
            Some(idx) => idx,
            None => {
                self.header.times.push(time_key);
                self.header.times.len() - 1
            }
        }
    }

    /// Stores one member realization. Each `(time, member, valid_time)`
    /// coordinate holds exactly one chunk; writing it again replaces it.
    pub fn write(
        &mut self,
        time_idx: usize,
        member: usize,
        valid_idx: usize,
        values: ArrayView2<'_, f32>,
    ) -> StoreResult<()> {
        if time_idx >= self.header.times.len() {
            return Err(StoreError::SlotOutOfRange {
                axis: "time",
                index: time_idx,
                len: self.header.times.len(),
            });
        }
        if member >= self.header.dims.members {
            return Err(StoreError::SlotOutOfRange {
                axis: "member",
                index: member,
                len: self.header.dims.members,
            });
        }
        if valid_idx >= self.header.valid_hours.len() {
            return Err(StoreError::SlotOutOfRange {
                axis: "valid_time",
                index: valid_idx,
                len: self.header.valid_hours.len(),
            });
        }
        if values.dim() != (self.header.dims.rows, self.header.dims.cols) {
            return Err(StoreError::DimensionMismatch {
                context: "volume chunk".to_string(),
                axis: "cells",
                expected: self.header.dims.rows * self.header.dims.cols,
                got: values.len(),
            });
        }

        let raw = bincode::serialize(&values.iter().copied().collect::<Vec<f32>>())
            .map_err(serde_error)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .map_err(|err| io_at(&self.path, err))?;
        let compressed = encoder.finish().map_err(|err| io_at(&self.path, err))?;
        self.chunks.insert((time_idx, member, valid_idx), compressed);
        Ok(())
    }

    /// Distinct members with at least one chunk at `time_idx`.
    pub fn members_written(&self, time_idx: usize) -> usize {
        let mut seen = std::collections::BTreeSet::new();
        for (t, m, _) in self.chunks.keys() {
            if *t == time_idx {
                seen.insert(*m);
            }
        }
        seen.len()
    }

    /// Total chunks stored at `time_idx`.
    pub fn slots_written(&self, time_idx: usize) -> usize {
        self.chunks.keys().filter(|(t, _, _)| *t == time_idx).count()
    }

    /// Publishes the volume: stage into a sibling temp file, then rename
    /// over the target.
    pub fn close(self) -> StoreResult<PathBuf> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|err| io_at(parent, err))?;
        let staged =
            tempfile::NamedTempFile::new_in(parent).map_err(|err| io_at(parent, err))?;
        {
            let mut writer = BufWriter::new(staged.as_file());
            writer.write_all(MAGIC).map_err(|err| io_at(&self.path, err))?;
            let header_bytes = bincode::serialize(&self.header).map_err(serde_error)?;
            writer
                .write_all(&(header_bytes.len() as u64).to_le_bytes())
                .map_err(|err| io_at(&self.path, err))?;
            writer
                .write_all(&header_bytes)
                .map_err(|err| io_at(&self.path, err))?;
            writer
                .write_all(&(self.chunks.len() as u64).to_le_bytes())
                .map_err(|err| io_at(&self.path, err))?;
            for ((t, m, v), bytes) in &self.chunks {
                for part in [*t as u64, *m as u64, *v as u64, bytes.len() as u64] {
                    writer
                        .write_all(&part.to_le_bytes())
                        .map_err(|err| io_at(&self.path, err))?;
                }
                writer.write_all(bytes).map_err(|err| io_at(&self.path, err))?;
            }
            writer.flush().map_err(|err| io_at(&self.path, err))?;
        }
        staged
            .persist(&self.path)
            .map_err(|err| io_at(&self.path, err.error))?;
        debug!(path = %self.path.display(), "volume published");
        Ok(self.path)
    }
}

/// Read handle over a published volume.
pub struct VolumeReader {
    header: VolumeHeader,
    chunks: BTreeMap<ChunkKey, Vec<u8>>,
}

impl VolumeReader {
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
        let header: VolumeHeader = bincode::deserialize(&header_bytes).map_err(serde_error)?;

        let count = read_u64(&mut reader, path)?;
        let mut chunks = BTreeMap::new();
        for _ in 0..count {
            let t = read_u64(&mut reader, path)? as usize;
            let m = read_u64(&mut reader, path)? as usize;
            let v = read_u64(&mut reader, path)? as usize;
            let len = read_u64(&mut reader, path)? as usize;
            let mut bytes = vec![0u8; len];
            reader
                .read_exact(&mut bytes)
                .map_err(|err| io_at(path, err))?;
            chunks.insert((t, m, v), bytes);
        }
        Ok(Self { header, chunks })
    }

    pub fn dims(&self) -> VolumeDims {
        self.header.dims
    }

    pub fn times(&self) -> &[i64] {
        &self.header.times
    }

    pub fn valid_hours(&self) -> &[i64] {
        &self.header.valid_hours
    }

    pub fn variable(&self) -> &str {
        &self.header.variable
    }

    pub fn units(&self) -> &str {
        &self.header.units
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Loads one realization plane.
    pub fn read(
        &self,
        time_idx: usize,
        member: usize,
        valid_idx: usize,
    ) -> StoreResult<Array2<f32>> {
        let bytes = self
            .chunks
            .get(&(time_idx, member, valid_idx))
            .ok_or(StoreError::SlotOutOfRange {
                axis: "chunk",
                index: member,
                len: self.header.dims.members,
            })?;
        let mut raw = Vec::new();
        GzDecoder::new(&bytes[..])
            .read_to_end(&mut raw)
            .map_err(serde_error)?;
        let values: Vec<f32> = bincode::deserialize(&raw).map_err(serde_error)?;
        Array2::from_shape_vec((self.header.dims.rows, self.header.dims.cols), values)
            .map_err(serde_error)
    }

    /// One-line schema description for operator tooling.
    pub fn describe(&self) -> String {
        format!(
            "{} [{}] time={} member={} valid_time={} lat={} lon={} chunks={}",
            self.header.variable,
            self.header.units,
            self.header.times.len(),
            self.header.dims.members,
            self.header.valid_hours.len(),
            self.header.dims.rows,
            self.header.dims.cols,
            self.chunks.len()
        )
    }
}

fn read_u64(reader: &mut impl Read, path: &Path) -> StoreResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(|err| io_at(path, err))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> VolumeDims {
        VolumeDims {
            members: 3,
            rows: 4,
            cols: 5,
        }
    }

    fn plane(fill: f32) -> Array2<f32> {
        Array2::from_elem((4, 5), fill)
    }

    #[test]
    fn volume_round_trips_members() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024").join("20240317_00Z.tpv");
        let mut vol = OutputVolume::create(&path, dims(), vec![30, 36]).unwrap();
        let t = vol.time_index(2024031700);
        for m in 0..3 {
            for v in 0..2 {
                vol.write(t, m, v, plane(m as f32 + v as f32 * 0.1).view())
                    .unwrap();
            }
        }
        assert_eq!(vol.members_written(t), 3);
        assert_eq!(vol.slots_written(t), 6);
        let published = vol.close().unwrap();

        let reader = VolumeReader::open(&published).unwrap();
        assert_eq!(reader.variable(), "precipitation");
        assert_eq!(reader.units(), "mm/h");
        assert_eq!(reader.times(), &[2024031700]);
        let back = reader.read(0, 2, 1).unwrap();
        assert!((back[(0, 0)] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn rewriting_a_slot_does_not_duplicate_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        let t = vol.time_index(2024031700);
        vol.write(t, 0, 0, plane(1.0).view()).unwrap();
        vol.write(t, 0, 0, plane(9.0).view()).unwrap();
        assert_eq!(vol.slots_written(t), 1);
        vol.close().unwrap();

        let reader = VolumeReader::open(&path).unwrap();
        assert_eq!(reader.chunk_count(), 1);
        assert_eq!(reader.read(0, 0, 0).unwrap()[(0, 0)], 9.0);
    }

    #[test]
    fn rerunning_a_date_reuses_its_time_coordinate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        let t = vol.time_index(2024031700);
        vol.write(t, 0, 0, plane(1.0).view()).unwrap();
        vol.close().unwrap();

        // second run of the same date
        let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        let t = vol.time_index(2024031700);
        assert_eq!(t, 0);
        vol.write(t, 0, 0, plane(2.0).view()).unwrap();
        vol.close().unwrap();

        let reader = VolumeReader::open(&path).unwrap();
        assert_eq!(reader.times(), &[2024031700]);
        assert_eq!(reader.chunk_count(), 1);
        assert_eq!(reader.read(0, 0, 0).unwrap()[(0, 0)], 2.0);
    }

    #[test]
    fn unclosed_volume_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        {
            let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
            let t = vol.time_index(2024031700);
            vol.write(t, 0, 0, plane(1.0).view()).unwrap();
            // dropped without close: the date was aborted
        }
        assert!(!path.exists());
    }

    #[test]
    fn out_of_range_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        let t = vol.time_index(2024031700);
        assert!(matches!(
            vol.write(t, 3, 0, plane(0.0).view()),
            Err(StoreError::SlotOutOfRange {
                axis: "member",
                ..
            })
        ));
    }

    #[test]
    fn schema_disagreement_on_reopen_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        let vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        vol.close().unwrap();
        let other = VolumeDims {
            members: 7,
            rows: 4,
            cols: 5,
        };
        assert!(matches!(
            OutputVolume::create(&path, other, vec![30]),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn wrong_plane_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.tpv");
        let mut vol = OutputVolume::create(&path, dims(), vec![30]).unwrap();
        let t = vol.time_index(2024031700);
        let bad = Array2::<f32>::zeros((2, 2));
        assert!(matches!(
            vol.write(t, 0, 0, bad.view()),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }
}
