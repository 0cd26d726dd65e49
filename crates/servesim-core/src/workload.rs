//! Workload materialization.
//!
//! The timing engine consumes one workload file per round. A
//! [`WorkloadMaterializer`] turns a scheduled [`BatchDescriptor`] into such a
//! file and returns the path that goes on the wire.

use crate::scheduler::BatchDescriptor;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Workload I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Workload serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Produces workload files for the timing engine.
pub trait WorkloadMaterializer: Send {
    /// Write the seed workload that makes the engine report first at `at_ns`.
    fn seed(&mut self, at_ns: u64) -> Result<PathBuf, WorkloadError>;

    /// Write the workload for one scheduled batch.
    fn materialize(&mut self, batch: &BatchDescriptor) -> Result<PathBuf, WorkloadError>;
}

/// Seed workload: an empty step on unit 0 that completes at `start_ns`.
#[derive(Debug, Serialize)]
struct SeedWorkload {
    sys: u32,
    id: u64,
    start_ns: u64,
}

/// Writes workloads as pretty JSON files under one directory.
#[derive(Debug, Clone)]
pub struct JsonWorkloadWriter {
    dir: PathBuf,
    written: u64,
}

impl JsonWorkloadWriter {
    /// Create the writer, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, WorkloadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| WorkloadError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir, written: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of files written so far, seed included.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path for the workload of `step_id` on `sys`.
    pub fn step_path(&self, sys: u32, step_id: u64) -> PathBuf {
        self.dir.join(format!("sys{sys}_step{step_id}.json"))
    }

    fn write_json<T: Serialize>(
        &mut self,
        path: PathBuf,
        value: &T,
    ) -> Result<PathBuf, WorkloadError> {
        let io_err = |source| WorkloadError::Io {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;
        self.written += 1;
        Ok(path)
    }
}

impl WorkloadMaterializer for JsonWorkloadWriter {
    fn seed(&mut self, at_ns: u64) -> Result<PathBuf, WorkloadError> {
        let path = self.dir.join("seed.json");
        let seed = SeedWorkload {
            sys: 0,
            id: 0,
            start_ns: at_ns,
        };
        self.write_json(path, &seed)
    }

    fn materialize(&mut self, batch: &BatchDescriptor) -> Result<PathBuf, WorkloadError> {
        let path = self.step_path(batch.sys, batch.step_id);
        self.write_json(path, batch)
    }
}
