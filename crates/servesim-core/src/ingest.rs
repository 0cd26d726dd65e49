//! In-process request ingestion.
//!
//! [`RequestApi`] is a cloneable handle over the shared scheduler. It can be
//! moved to another thread and used to inject requests while the driver loop
//! runs, which is how idle-mode simulations get their work.

use crate::scheduler::{Scheduler, SchedulerError, SchedulerStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Scheduler shared between the driver and ingestion clients.
pub type SharedScheduler = Arc<Mutex<Scheduler>>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to read request file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse request file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Request {index} rejected: {source}")]
    Rejected {
        index: usize,
        #[source]
        source: SchedulerError,
    },
}

/// One admission as accepted by [`RequestApi::add_batch`] and request files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub model: String,
    pub input_length: u32,
    pub output_length: u32,
    /// Nanoseconds; defaults to the current simulated time.
    #[serde(default)]
    pub arrival_time: Option<u64>,
}

/// Status snapshot with memory availability spelled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub pending_requests: usize,
    pub inflight_requests: usize,
    pub completed_requests: usize,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_available: u64,
}

impl From<SchedulerStatus> for IngestStatus {
    fn from(status: SchedulerStatus) -> Self {
        Self {
            pending_requests: status.pending,
            inflight_requests: status.inflight,
            completed_requests: status.completed,
            memory_total: status.memory_total,
            memory_used: status.memory_used,
            memory_available: status.memory_total.saturating_sub(status.memory_used),
        }
    }
}

/// Handle for admitting requests into a running simulation.
#[derive(Debug, Clone)]
pub struct RequestApi {
    scheduler: SharedScheduler,
}

impl RequestApi {
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self { scheduler }
    }

    /// Admit one request. Returns its id.
    ///
    /// Without an explicit arrival time the request arrives at the
    /// scheduler's current simulated time.
    pub fn admit(
        &self,
        model: &str,
        input_length: u32,
        output_length: u32,
        arrival_time: Option<u64>,
    ) -> Result<u64, SchedulerError> {
        let mut scheduler = self.scheduler.lock();
        let arrival = arrival_time.unwrap_or_else(|| scheduler.now_ns());
        let id = scheduler.admit(model, input_length, output_length, arrival)?;
        drop(scheduler);
        info!(id, input_length, output_length, arrival, "request added");
        Ok(id)
    }

    /// Admit requests in order, stopping at the first rejection.
    ///
    /// Requests before the rejected one stay admitted.
    pub fn add_batch(&self, requests: &[AdmitRequest]) -> Result<Vec<u64>, IngestError> {
        requests
            .iter()
            .enumerate()
            .map(|(index, req)| {
                self.admit(
                    &req.model,
                    req.input_length,
                    req.output_length,
                    req.arrival_time,
                )
                .map_err(|source| IngestError::Rejected { index, source })
            })
            .collect()
    }

    /// Load a JSON array of [`AdmitRequest`] and admit every entry.
    pub fn load_requests_from_file(&self, path: &Path) -> Result<Vec<u64>, IngestError> {
        let content = std::fs::read_to_string(path)?;
        let requests: Vec<AdmitRequest> = serde_json::from_str(&content)?;
        let ids = self.add_batch(&requests)?;
        info!(count = ids.len(), path = %path.display(), "requests loaded");
        Ok(ids)
    }

    pub fn status(&self) -> IngestStatus {
        self.scheduler.lock().status().into()
    }
}
