//! Directory-backed persistence.
//!
//! ```text
//! <dir>/sequence.bin               manifest: writer count, completed steps
//! <dir>/step-000000/rank-00000.bin one bincode file per writer and step
//! <dir>/step-000000/rank-00001.bin
//! ```
//!
//! Rank files are written under a temporary name and renamed into place, so
//! a reader sees either a whole block file or none. Rank 0 owns the manifest.
//!
//! Every file carries the id of the sequence that wrote it. Creating a store
//! does not clear the directory, so a step only counts once each rank file in
//! it carries the manifest's id.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{assemble, merge_step, record_block, ArrayHandle, Persistence, StepArrays};
use crate::error::{Error, Result};

const MANIFEST: &str = "sequence.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    sequence: u64,
    writers: usize,
    steps: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RankFile {
    sequence: u64,
    writers: usize,
    arrays: StepArrays,
}

fn step_dir(root: &Path, step: usize) -> PathBuf {
    root.join(format!("step-{step:06}"))
}

fn rank_file(root: &Path, step: usize, rank: usize) -> PathBuf {
    step_dir(root, step).join(format!("rank-{rank:05}.bin"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| Error::persistence(format!("writing {}: {e}", path.display())))
}

fn read_bincode<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)
        .map_err(|e| Error::persistence(format!("reading {}: {e}", path.display())))?;
    bincode::deserialize(&bytes)
        .map_err(|e| Error::persistence(format!("decoding {}: {e}", path.display())))
}

enum Mode {
    Write {
        sequence: u64,
        rank: usize,
        writers: usize,
    },
    Read { manifest: Manifest },
}

/// A persisted sequence in a directory, opened for writing by one rank or
/// for reading by any number of ranks.
pub struct FileStore {
    root: PathBuf,
    mode: Mode,
    next: usize,
    writing: Option<StepArrays>,
    reading: Option<StepArrays>,
}

impl FileStore {
    /// Opens `dir` for writing as `rank` of `writers`.
    ///
    /// All writers of one sequence pass the same `sequence` id, and it must
    /// differ from the id of any earlier sequence in `dir`. Rank 0 resets the
    /// manifest, so earlier steps in the directory stop being visible to
    /// readers.
    pub fn create(
        dir: impl AsRef<Path>,
        rank: usize,
        writers: usize,
        sequence: u64,
    ) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        if rank >= writers {
            return Err(Error::InvalidRank(rank));
        }
        fs::create_dir_all(&root)
            .map_err(|e| Error::persistence(format!("creating {}: {e}", root.display())))?;
        if rank == 0 {
            let manifest = Manifest {
                sequence,
                writers,
                steps: 0,
            };
            write_atomic(&root.join(MANIFEST), &bincode::serialize(&manifest)?)?;
            info!("Writing {} ({writers} writers)", root.display());
        }
        Ok(Self {
            root,
            mode: Mode::Write {
                sequence,
                rank,
                writers,
            },
            next: 0,
            writing: None,
            reading: None,
        })
    }

    /// Opens an existing sequence for reading.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let manifest: Manifest = read_bincode(&root.join(MANIFEST))?;
        debug!(
            "Opened {} with {} steps from {} writers",
            root.display(),
            manifest.steps,
            manifest.writers
        );
        Ok(Self {
            root,
            mode: Mode::Read { manifest },
            next: 0,
            writing: None,
            reading: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn load_step(&self, manifest: Manifest, step: usize) -> Result<StepArrays> {
        let mut arrays = StepArrays::new();
        for rank in 0..manifest.writers {
            let path = rank_file(&self.root, step, rank);
            if !path.exists() {
                return Err(Error::StepUnavailable(format!(
                    "step {step} is incomplete: {} missing",
                    path.display()
                )));
            }
            let file: RankFile = read_bincode(&path)?;
            if file.sequence != manifest.sequence {
                return Err(Error::StepUnavailable(format!(
                    "step {step} is incomplete: {} is left over from an earlier sequence",
                    path.display()
                )));
            }
            if file.writers != manifest.writers {
                return Err(Error::persistence(format!(
                    "{} was written by a run of {} ranks, sequence has {}",
                    path.display(),
                    file.writers,
                    manifest.writers
                )));
            }
            merge_step(&mut arrays, file.arrays)?;
        }
        Ok(arrays)
    }
}

impl Persistence for FileStore {
    fn begin_step(&mut self) -> Result<()> {
        match self.mode {
            Mode::Write { .. } => {
                if self.writing.is_some() {
                    return Err(Error::persistence("step already open"));
                }
                self.writing = Some(StepArrays::new());
            }
            Mode::Read { manifest } => {
                if self.next >= manifest.steps {
                    return Err(Error::StepUnavailable(format!(
                        "step {} requested, {} stored in {}",
                        self.next,
                        manifest.steps,
                        self.root.display()
                    )));
                }
                self.reading = Some(self.load_step(manifest, self.next)?);
                self.next += 1;
            }
        }
        Ok(())
    }

    fn end_step(&mut self) -> Result<()> {
        match self.mode {
            Mode::Write {
                sequence,
                rank,
                writers,
            } => {
                let arrays = self
                    .writing
                    .take()
                    .ok_or_else(|| Error::persistence("end_step without begin_step"))?;
                let dir = step_dir(&self.root, self.next);
                fs::create_dir_all(&dir)
                    .map_err(|e| Error::persistence(format!("creating {}: {e}", dir.display())))?;
                let file = RankFile {
                    sequence,
                    writers,
                    arrays,
                };
                write_atomic(
                    &rank_file(&self.root, self.next, rank),
                    &bincode::serialize(&file)?,
                )?;
                self.next += 1;
                if rank == 0 {
                    let manifest = Manifest {
                        sequence,
                        writers,
                        steps: self.next,
                    };
                    write_atomic(&self.root.join(MANIFEST), &bincode::serialize(&manifest)?)?;
                }
                debug!("Rank {} wrote step {} to {}", rank, self.next - 1, self.root.display());
            }
            Mode::Read { .. } => {
                self.reading
                    .take()
                    .ok_or_else(|| Error::persistence("end_step without begin_step"))?;
            }
        }
        Ok(())
    }

    fn write(&mut self, array: &ArrayHandle, data: &[f64]) -> Result<()> {
        match (&self.mode, self.writing.as_mut()) {
            (Mode::Write { .. }, Some(open)) => record_block(open, array, data),
            (Mode::Write { .. }, None) => Err(Error::persistence("write outside a step")),
            (Mode::Read { .. }, _) => Err(Error::persistence(format!(
                "{} is open for reading",
                self.root.display()
            ))),
        }
    }

    fn read(&mut self, array: &ArrayHandle, out: &mut [f64]) -> Result<()> {
        match &self.reading {
            Some(step) => assemble(step, array, out),
            None => Err(Error::persistence("read outside a step")),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.writing.is_some() {
            return Err(Error::persistence("close with a step still open"));
        }
        self.reading = None;
        Ok(())
    }
}
