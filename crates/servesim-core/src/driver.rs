//! Co-simulation driver loop.
//!
//! The [`Driver`] owns the timing-engine link and alternates strictly between
//! receiving a completion event and answering it:
//!
//! ```text
//! AwaitingEvent -> Updating -> Scheduling -> Dispatching -> AwaitingEvent
//!                     |
//!                     +-- queue empty, batch mode --> Drained (send exit)
//!                     +-- queue empty, idle mode  --> IdleWait (send pass, sleep)
//! ```
//!
//! The scheduler lock is taken only around scheduler calls, never across
//! engine I/O, so a [`RequestApi`] on another thread can keep admitting.

use crate::clock::SimClock;
use crate::config::{ConfigError, SimConfig};
use crate::ingest::{IngestError, RequestApi, SharedScheduler};
use crate::link::{LinkError, PeerCommand, RoundInput, SimulationLink};
use crate::metrics::{RunReport, ThroughputTracker};
use crate::scheduler::{BatchDescriptor, Scheduler, SchedulerError};
use crate::trace::TraceError;
use crate::workload::{JsonWorkloadWriter, WorkloadError, WorkloadMaterializer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    #[error("Request {id} can never fit in any execution unit's KV cache")]
    Unservable { id: u64 },
}

/// Driver loop states, tracked for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Starting,
    AwaitingEvent,
    Updating,
    Scheduling,
    Dispatching,
    IdleWait,
    Drained,
    Failed,
}

/// Run-level settings for the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub name: String,
    pub peer: PeerCommand,
    /// Prefix joined with the seed workload path to form the last argument.
    pub workload_flag: String,
    pub log_interval_ns: u64,
    pub idle_mode: bool,
    pub idle_poll: Duration,
    pub desync_tolerance: u32,
}

impl DriverConfig {
    pub fn from_sim_config(config: &SimConfig) -> Self {
        Self {
            name: config.simulation.name.clone(),
            peer: PeerCommand {
                program: config.peer.binary.clone(),
                args: config.peer.args.clone(),
            },
            workload_flag: config.peer.workload_flag.clone(),
            log_interval_ns: config.log_interval_ns(),
            idle_mode: config.simulation.idle_mode,
            idle_poll: Duration::from_millis(config.simulation.idle_poll_ms),
            desync_tolerance: config.simulation.desync_tolerance,
        }
    }
}

/// What the loop should do after a round's update.
enum Step {
    Dispatch(Option<BatchDescriptor>),
    Idle,
    Drain,
}

/// Drives one co-simulation run against an external timing engine.
pub struct Driver {
    config: DriverConfig,
    scheduler: SharedScheduler,
    materializer: Box<dyn WorkloadMaterializer>,
    clock: SimClock,
    tracker: ThroughputTracker,
    stop: Arc<AtomicBool>,
    state: DriverState,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        scheduler: SharedScheduler,
        materializer: Box<dyn WorkloadMaterializer>,
    ) -> Self {
        let tracker = ThroughputTracker::new(config.log_interval_ns);
        Self {
            config,
            scheduler,
            materializer,
            clock: SimClock::new(),
            tracker,
            stop: Arc::new(AtomicBool::new(false)),
            state: DriverState::Starting,
        }
    }

    /// Build a driver with a fresh scheduler and a JSON workload writer.
    pub fn from_sim_config(config: &SimConfig) -> Result<Self, RunError> {
        let scheduler = Scheduler::new(config.scheduler_config()?);
        let writer = JsonWorkloadWriter::new(&config.peer.workload_dir)?;
        Ok(Self::new(
            DriverConfig::from_sim_config(config),
            Arc::new(Mutex::new(scheduler)),
            Box::new(writer),
        ))
    }

    /// Handle for admitting requests, usable from other threads.
    pub fn request_api(&self) -> RequestApi {
        RequestApi::new(Arc::clone(&self.scheduler))
    }

    pub fn scheduler(&self) -> SharedScheduler {
        Arc::clone(&self.scheduler)
    }

    /// Setting this flag lets an idle-mode run shut down once drained.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Report of the run so far. Also valid after a failed run.
    pub fn report(&self) -> RunReport {
        let scheduler = self.scheduler.lock();
        RunReport::build(
            &self.config.name,
            &scheduler,
            &self.tracker,
            self.clock.now_ns(),
        )
    }

    /// Run until the queues drain (or, in idle mode, until stopped).
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        let seed_at = if self.config.idle_mode {
            1
        } else {
            self.scheduler.lock().first_arrival_time().unwrap_or(1)
        };
        let seed = self.materializer.seed(seed_at)?;
        let command = self.config.peer.clone().arg(format!(
            "{}{}",
            self.config.workload_flag,
            seed.display()
        ));
        let mut link = SimulationLink::spawn(&command, self.config.desync_tolerance)?;
        info!(
            name = %self.config.name,
            seed_at,
            idle_mode = self.config.idle_mode,
            "simulation started"
        );

        if let Err(e) = self.drive(&mut link) {
            self.state = DriverState::Failed;
            self.tracker.finish(self.clock.now_ns());
            error!(error = %e, rounds = link.rounds(), "simulation aborted");
            // Best effort: the engine may already be gone.
            if link.send(&RoundInput::Exit).is_ok() {
                if let Err(shutdown) = link.verify_shutdown() {
                    warn!(error = %shutdown, "timing engine did not shut down cleanly");
                }
            }
            return Err(e);
        }

        link.verify_shutdown()?;
        let report = self.report();
        info!(
            completed = report.completed_requests,
            total_clock_ns = report.total_clock_ns,
            rounds = link.rounds(),
            "simulation finished"
        );
        Ok(report)
    }

    fn drive(&mut self, link: &mut SimulationLink) -> Result<(), RunError> {
        loop {
            self.state = DriverState::AwaitingEvent;
            let Some(event) = link.receive()? else {
                link.send(&RoundInput::Pass)?;
                continue;
            };

            self.state = DriverState::Updating;
            let now = self.clock.observe(event.clock_ns);
            let outcome = self
                .scheduler
                .lock()
                .record_completion(event.sys, event.id, now);
            self.tracker.record(&outcome);
            self.tracker.maybe_flush(now);
            debug!(
                sys = event.sys,
                id = event.id,
                now,
                prompt = outcome.prompt_tokens,
                generated = outcome.generated_tokens,
                finished = outcome.finished,
                "step completed"
            );

            match self.next_step(now, event.sys, event.id)? {
                Step::Drain => {
                    self.state = DriverState::Drained;
                    self.tracker.finish(now);
                    if !self.scheduler.lock().is_leak_free() {
                        warn!("memory not returned to baseline after drain");
                    }
                    info!(now, "queues drained; shutting down timing engine");
                    link.send(&RoundInput::Exit)?;
                    return Ok(());
                }
                Step::Idle => {
                    self.state = DriverState::IdleWait;
                    link.send(&RoundInput::Pass)?;
                    std::thread::sleep(self.config.idle_poll);
                }
                Step::Dispatch(batch) => {
                    self.state = DriverState::Dispatching;
                    let input = match batch {
                        Some(batch) => {
                            RoundInput::Workload(self.materializer.materialize(&batch)?)
                        }
                        None => RoundInput::Pass,
                    };
                    link.send(&input)?;
                }
            }
        }
    }

    /// Decide the round's reply under one lock acquisition.
    fn next_step(&mut self, now: u64, sys: u32, id: u64) -> Result<Step, RunError> {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_queue_empty() {
            let stop = self.stop.load(Ordering::Acquire);
            return Ok(if self.config.idle_mode && !stop {
                Step::Idle
            } else {
                Step::Drain
            });
        }

        self.state = DriverState::Scheduling;
        let batch = scheduler.schedule(now, sys, id);
        if batch.is_none() && !self.config.idle_mode && scheduler.is_idle() {
            if let Some(id) = scheduler.unservable_head() {
                return Err(RunError::Unservable { id });
            }
        }
        Ok(Step::Dispatch(batch))
    }
}
