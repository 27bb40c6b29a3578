//! On-disk persistence for MAP snapshots and MCMC traces.
//!
//! A *snapshot* is a directory holding one raw little-endian `f64` file per
//! named variable plus a `manifest.json` recording each variable's shape.
//! The manifest is written last, so a directory without one is an
//! interrupted write, not a readable snapshot.
//!
//! A *trace* is an ordered collection of snapshots under one root, one per
//! draw (`draw-000000`, `draw-000001`, ...). The writer is append-only and
//! flushes every record; the reader is lazy and restartable and tolerates
//! a truncated final draw.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::matrix::Matrix;

const MANIFEST: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("refusing to write over existing output at {0}")]
    WouldClobber(PathBuf),
    #[error("no snapshot found at {0}")]
    NotFound(PathBuf),
    #[error("variable {name}: manifest declares shape {nrows}x{ncols} but the data file holds {actual} values")]
    ShapeMismatch {
        name: String,
        nrows: usize,
        ncols: usize,
        actual: usize,
    },
    #[error("trace at {root} has a complete draw after the incomplete {incomplete}")]
    CorruptTrace { root: PathBuf, incomplete: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Manifest {
    variables: BTreeMap<String, (usize, usize)>,
}

/// Write one snapshot. Fails with [`StorageError::WouldClobber`] if the
/// directory already holds a manifest; silent overwrite is never allowed.
pub fn save_snapshot(dir: &Path, variables: &[(&str, &Matrix)]) -> Result<(), StorageError> {
    if dir.join(MANIFEST).exists() {
        return Err(StorageError::WouldClobber(dir.to_path_buf()));
    }
    fs::create_dir_all(dir)?;

    let mut manifest = Manifest::default();
    for (name, matrix) in variables {
        let mut writer = BufWriter::new(File::create(dir.join(format!("{name}.bin")))?);
        for value in matrix.as_slice() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        manifest
            .variables
            .insert(name.to_string(), matrix.shape());
    }

    // Manifest last: its presence marks the snapshot complete.
    let file = File::create(dir.join(MANIFEST))?;
    serde_json::to_writer_pretty(&file, &manifest)?;
    file.sync_all()?;
    Ok(())
}

/// Load every variable of a snapshot, reconstructing exact shapes.
pub fn load_snapshot(dir: &Path) -> Result<BTreeMap<String, Matrix>, StorageError> {
    let manifest_path = dir.join(MANIFEST);
    if !manifest_path.exists() {
        return Err(StorageError::NotFound(dir.to_path_buf()));
    }
    let manifest: Manifest = serde_json::from_reader(BufReader::new(File::open(manifest_path)?))?;

    let mut result = BTreeMap::new();
    for (name, (nrows, ncols)) in manifest.variables {
        let mut bytes = Vec::new();
        BufReader::new(File::open(dir.join(format!("{name}.bin")))?).read_to_end(&mut bytes)?;
        if bytes.len() != nrows * ncols * 8 {
            return Err(StorageError::ShapeMismatch {
                name,
                nrows,
                ncols,
                actual: bytes.len() / 8,
            });
        }
        let data = bytes
            .chunks_exact(8)
            .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("chunk of 8")))
            .collect();
        result.insert(name, Matrix::from_vec(nrows, ncols, data));
    }
    Ok(result)
}

pub fn snapshot_exists(dir: &Path) -> bool {
    dir.join(MANIFEST).exists()
}

fn draw_dir(index: usize) -> String {
    format!("draw-{index:06}")
}

/// Append-only writer for one chain's trace.
pub struct TraceWriter {
    root: PathBuf,
    next: usize,
}

impl TraceWriter {
    /// Open `root` for writing. Refuses to start if the location already
    /// contains any entry, so a prior run can never be clobbered.
    pub fn create(root: &Path) -> Result<Self, StorageError> {
        if root.exists() && root.read_dir()?.next().is_some() {
            return Err(StorageError::WouldClobber(root.to_path_buf()));
        }
        fs::create_dir_all(root)?;
        Ok(TraceWriter {
            root: root.to_path_buf(),
            next: 0,
        })
    }

    /// Persist one `(U, V)` draw as its own snapshot, flushed immediately.
    pub fn append(&mut self, u: &Matrix, v: &Matrix) -> Result<(), StorageError> {
        let dir = self.root.join(draw_dir(self.next));
        save_snapshot(&dir, &[("U", u), ("V", v)])?;
        self.next += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}

/// Lazy reader over one chain's trace.
///
/// Iterating does not mutate the trace; a reader may be opened repeatedly
/// and from any process. A missing manifest in the *final* draw directory
/// marks an interrupted run and simply shortens the trace; an incomplete
/// draw followed by a complete one is corruption and fails at open.
pub struct TraceReader {
    draws: Vec<PathBuf>,
}

impl TraceReader {
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        if !root.is_dir() {
            return Err(StorageError::NotFound(root.to_path_buf()));
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("draw-"))
            })
            .collect();
        dirs.sort();

        let mut draws = Vec::with_capacity(dirs.len());
        let mut truncated_at = None;
        for dir in dirs {
            if snapshot_exists(&dir) {
                if let Some(incomplete) = truncated_at {
                    return Err(StorageError::CorruptTrace {
                        root: root.to_path_buf(),
                        incomplete,
                    });
                }
                draws.push(dir);
            } else {
                truncated_at = Some(
                    dir.file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("?")
                        .to_string(),
                );
            }
        }
        Ok(TraceReader { draws })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Iterate over the draws in order, loading lazily.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Matrix, Matrix), StorageError>> + '_ {
        self.draws.iter().map(|dir| {
            let mut vars = load_snapshot(dir)?;
            let u = vars
                .remove("U")
                .ok_or_else(|| StorageError::NotFound(dir.join("U.bin")))?;
            let v = vars
                .remove("V")
                .ok_or_else(|| StorageError::NotFound(dir.join("V.bin")))?;
            Ok((u, v))
        })
    }
}

/// Open every `chain-*` trace under `root`, sorted by chain id.
///
/// Chain outputs are meant to be concatenated in this order, never
/// interleaved.
pub fn open_chains(root: &Path) -> Result<Vec<TraceReader>, StorageError> {
    if !root.is_dir() {
        return Err(StorageError::NotFound(root.to_path_buf()));
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("chain-"))
        })
        .collect();
    dirs.sort();
    dirs.iter().map(|dir| TraceReader::open(dir)).collect()
}

pub fn chain_dir(root: &Path, chain: u64) -> PathBuf {
    root.join(format!("chain-{chain:02}"))
}
