//! ServeSim: co-simulator for LLM serving clusters.
//!
//! This crate models the serving side of an LLM cluster (request queues,
//! continuous batching, paged KV-cache memory) and delegates per-step timing
//! to an external hardware/network simulator that it drives over a line
//! protocol on the child's stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │ Dataset  │────▶│ Scheduler │◀────│  RequestApi  │
//! │ Loader   │     │ + Memory  │     │ (ingestion)  │
//! └──────────┘     └─────┬─────┘     └──────────────┘
//!                        │
//!                  ┌─────┴─────┐     ┌──────────────┐
//!                  │  Driver   │────▶│   Metrics    │
//!                  └─────┬─────┘     └──────────────┘
//!                        │ workload / pass / exit
//!                        ▼
//!                ┌───────────────┐
//!                │ Timing engine │
//!                │ (subprocess)  │
//!                └───────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod driver;
pub mod ingest;
pub mod link;
pub mod memory;
pub mod metrics;
pub mod profile;
pub mod request;
pub mod scheduler;
pub mod trace;
pub mod workload;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use config::SimConfig;
pub use driver::{Driver, DriverConfig, DriverState, RunError};
pub use ingest::{AdmitRequest, RequestApi, SharedScheduler};
pub use link::{CompletionEvent, LinkError, PeerCommand, RoundInput, SimulationLink};
pub use memory::{MemoryModel, MemoryStats};
pub use metrics::{RunReport, ThroughputTracker};
pub use profile::ModelProfile;
pub use request::{CompletedRequest, Phase, Request, RequestState};
pub use scheduler::{BatchDescriptor, Scheduler, SchedulerConfig, SchedulerError};
pub use trace::{load_trace, TraceRequest};
pub use workload::{JsonWorkloadWriter, WorkloadMaterializer};

use std::path::Path;

/// Resolve the requests for a run: the dataset (CLI override first, then
/// the config path) or the built-in smoke-test batch.
pub fn load_requests(
    config: &SimConfig,
    dataset: Option<&Path>,
) -> Result<Vec<TraceRequest>, trace::TraceError> {
    let path = dataset.or(config.trace.path.as_deref());
    let Some(path) = path else {
        return Ok(trace::default_requests(&config.model.name));
    };
    let records = load_trace(path, &config.trace.format)?;
    let options = trace::DatasetOptions {
        model: config.model.name.clone(),
        req_num: config.trace.req_num,
        rate: config.trace.rate,
        seed: config.simulation.seed,
    };
    Ok(trace::build_requests(records, &options))
}

/// Admit every request into the scheduler, returning the assigned ids.
pub fn admit_all(
    scheduler: &mut Scheduler,
    requests: &[TraceRequest],
) -> Result<Vec<u64>, SchedulerError> {
    requests
        .iter()
        .map(|r| scheduler.admit(&r.model, r.input_len, r.output_len, r.arrival_ns))
        .collect()
}

/// Run a complete co-simulation with the given config and requests.
pub fn run_simulation(
    config: &SimConfig,
    requests: &[TraceRequest],
) -> Result<RunReport, RunError> {
    let mut driver = Driver::from_sim_config(config)?;
    admit_all(&mut driver.scheduler().lock(), requests)?;
    driver.run()
}
