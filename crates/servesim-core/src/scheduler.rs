//! Continuous-batching scheduler.
//!
//! The [`Scheduler`] owns every request from admission until completion. It
//! keeps a FIFO `waiting` queue ordered by `(arrival, id)`, one running set
//! per execution unit, and an append-only log of finished requests.
//!
//! Each protocol round the driver reports which step finished on which unit.
//! The scheduler advances every member of that step, retires finished ones,
//! preempts survivors whose next footprint no longer fits, and then refills
//! the batch from the head of `waiting` until the batch ceiling or memory
//! stops it.

use crate::memory::{MemoryModel, MemoryStats};
use crate::request::{CompletedRequest, Phase, Request, RequestState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Static scheduler parameters, fixed for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of execution units.
    pub units: u32,
    /// Batch ceiling per unit; `None` is unbounded.
    pub max_batch: Option<usize>,
    /// Per-unit capacity in blocks.
    pub capacity_blocks: u64,
    /// Per-unit weight baseline in blocks.
    pub baseline_blocks: u64,
    /// Tokens per block.
    pub block_size: u32,
    pub model: String,
    pub hardware: String,
    pub npu_num: u32,
    pub npu_group: u32,
    pub fp_bits: u32,
    /// Hold back requests whose arrival time is still in the future.
    pub arrival_gating: bool,
    /// Admit requests directly into the generation phase.
    pub skip_prompt: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            units: 1,
            max_batch: None,
            capacity_blocks: 100,
            baseline_blocks: 10,
            block_size: 8,
            model: "gpt3-6.7b".to_string(),
            hardware: "RTX3090".to_string(),
            npu_num: 1,
            npu_group: 1,
            fp_bits: 16,
            arrival_gating: true,
            skip_prompt: false,
        }
    }
}

/// One request's slot in a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub id: u64,
    pub input_len: u32,
    /// Current sequence length (prompt plus generated tokens).
    pub seq_len: u32,
    pub generated: u32,
    pub phase: Phase,
}

/// What the timing engine should run next on one execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub step_id: u64,
    pub sys: u32,
    pub model: String,
    pub hardware: String,
    pub npu_num: u32,
    pub npu_group: u32,
    pub fp_bits: u32,
    pub requests: Vec<BatchEntry>,
}

impl BatchDescriptor {
    /// Number of requests still in the prompt phase.
    pub fn prompt_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| r.phase == Phase::Prompt)
            .count()
    }

    /// Tokens processed by this step.
    pub fn batch_tokens(&self) -> u64 {
        self.requests
            .iter()
            .map(|r| match r.phase {
                Phase::Prompt => r.input_len as u64,
                Phase::Generation => 1,
            })
            .sum()
    }
}

/// Token and request deltas produced by one finished step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub prompt_tokens: u64,
    pub generated_tokens: u64,
    pub finished: u64,
}

/// Point-in-time scheduler summary for ingestion clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub pending: usize,
    pub inflight: usize,
    pub completed: usize,
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Per-unit batching state.
#[derive(Debug, Clone)]
struct ExecutionUnit {
    memory: MemoryModel,
    running: BTreeSet<u64>,
    /// Step handed to the timing engine and not yet reported back.
    dispatched: Option<u64>,
}

impl ExecutionUnit {
    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.dispatched.is_none()
    }
}

/// Request queues, per-unit batches and memory accounting.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    requests: HashMap<u64, Request>,
    waiting: BTreeSet<(u64, u64)>,
    units: Vec<ExecutionUnit>,
    done: Vec<CompletedRequest>,
    next_id: u64,
    next_step: u64,
    /// Latest simulated time reported to the scheduler.
    now_ns: u64,
    /// Lifetime preemption count.
    pub preemptions: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let units = (0..config.units.max(1))
            .map(|_| ExecutionUnit {
                memory: MemoryModel::new(
                    config.capacity_blocks,
                    config.baseline_blocks,
                    config.block_size,
                ),
                running: BTreeSet::new(),
                dispatched: None,
            })
            .collect();

        Self {
            config,
            requests: HashMap::new(),
            waiting: BTreeSet::new(),
            units,
            done: Vec::new(),
            next_id: 0,
            next_step: 0,
            now_ns: 0,
            preemptions: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn num_units(&self) -> u32 {
        self.units.len() as u32
    }

    /// Queue a new request. Returns its id.
    pub fn admit(
        &mut self,
        model: &str,
        input_len: u32,
        output_len: u32,
        arrival_ns: u64,
    ) -> Result<u64, SchedulerError> {
        if input_len < 1 {
            return Err(SchedulerError::InvalidRequest(
                "input length must be at least 1".to_string(),
            ));
        }
        if output_len < input_len {
            return Err(SchedulerError::InvalidRequest(format!(
                "output length ({output_len}) is shorter than input length ({input_len})"
            )));
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut request = Request::new(id, model, input_len, output_len, arrival_ns);
        request.prompt_done = self.config.skip_prompt;
        self.waiting.insert((arrival_ns, id));
        self.requests.insert(id, request);
        trace!(id, input_len, output_len, arrival_ns, "request admitted");
        Ok(id)
    }

    /// Apply a reported step and return the token and request deltas.
    ///
    /// An event that does not name the step outstanding on `sys` changes
    /// nothing and yields an empty outcome.
    pub fn record_completion(&mut self, sys: u32, step_id: u64, now_ns: u64) -> StepOutcome {
        self.now_ns = self.now_ns.max(now_ns);
        self.complete_step(sys, step_id, now_ns).unwrap_or_default()
    }

    /// Decide the next batch for `sys` after the step `completed_id` finished.
    ///
    /// Returns `None` when the unit has nothing to run or still has a step
    /// outstanding.
    pub fn schedule(
        &mut self,
        now_ns: u64,
        sys: u32,
        completed_id: u64,
    ) -> Option<BatchDescriptor> {
        self.now_ns = self.now_ns.max(now_ns);
        self.complete_step(sys, completed_id, now_ns);

        let max_batch = self.config.max_batch.unwrap_or(usize::MAX);
        let gating = self.config.arrival_gating;
        let Self {
            requests,
            waiting,
            units,
            ..
        } = self;
        let unit = units.get_mut(sys as usize)?;
        if unit.dispatched.is_some() {
            return None;
        }

        while unit.running.len() < max_batch {
            let Some(&(arrival_ns, id)) = waiting.first() else {
                break;
            };
            if gating && arrival_ns > now_ns {
                trace!(id, arrival_ns, now_ns, "queue head has not arrived yet");
                break;
            }
            let Some(request) = requests.get_mut(&id) else {
                waiting.remove(&(arrival_ns, id));
                continue;
            };
            let footprint = request.footprint_tokens();
            if !unit.memory.try_allocate(request, footprint) {
                trace!(
                    id,
                    sys,
                    footprint,
                    free_blocks = unit.memory.free_blocks(),
                    "admission deferred: memory"
                );
                break;
            }

            waiting.remove(&(arrival_ns, id));
            request.state = RequestState::Running;
            request.sys = Some(sys);
            request.first_admitted_ns.get_or_insert(now_ns);
            unit.running.insert(id);
        }

        if unit.running.is_empty() {
            return None;
        }

        let step_id = self.next_step;
        self.next_step += 1;
        let unit = &mut self.units[sys as usize];
        unit.dispatched = Some(step_id);

        let entries: Vec<BatchEntry> = unit
            .running
            .iter()
            .filter_map(|id| self.requests.get(id))
            .map(|r| BatchEntry {
                id: r.id,
                input_len: r.input_len,
                seq_len: r.seq_len(),
                generated: r.generated,
                phase: r.phase(),
            })
            .collect();

        debug!(sys, step_id, batch = entries.len(), "batch scheduled");
        Some(BatchDescriptor {
            step_id,
            sys,
            model: self.config.model.clone(),
            hardware: self.config.hardware.clone(),
            npu_num: self.config.npu_num,
            npu_group: self.config.npu_group,
            fp_bits: self.config.fp_bits,
            requests: entries,
        })
    }

    /// Advance every member of the outstanding step on `sys`.
    ///
    /// Returns `None` if `step_id` is not the step outstanding on `sys`, which
    /// also makes a second call for the same step a no-op.
    fn complete_step(&mut self, sys: u32, step_id: u64, now_ns: u64) -> Option<StepOutcome> {
        let Self {
            requests,
            waiting,
            units,
            done,
            preemptions,
            ..
        } = self;

        let Some(unit) = units.get_mut(sys as usize) else {
            warn!(sys, step_id, "completion event for unknown execution unit ignored");
            return None;
        };
        match unit.dispatched {
            Some(outstanding) if outstanding == step_id => {}
            Some(outstanding) => {
                warn!(sys, step_id, outstanding, "completion event for unknown step ignored");
                return None;
            }
            None => {
                debug!(sys, step_id, "no step outstanding; event carries no work");
                return None;
            }
        }
        unit.dispatched = None;

        let mut outcome = StepOutcome::default();
        let members: Vec<u64> = unit.running.iter().copied().collect();

        // Retire finished members first so their blocks are free for survivors.
        let mut survivors = Vec::with_capacity(members.len());
        for id in members {
            let Some(request) = requests.get_mut(&id) else {
                unit.running.remove(&id);
                continue;
            };
            let (prompt, generated) = request.advance(now_ns);
            outcome.prompt_tokens += prompt;
            outcome.generated_tokens += generated;

            if !request.is_finished() {
                survivors.push(id);
                continue;
            }
            unit.memory.release(request);
            request.state = RequestState::Done;
            unit.running.remove(&id);
            if let Some(request) = requests.remove(&id) {
                done.push(CompletedRequest::from_request(&request, sys, now_ns));
            }
            outcome.finished += 1;
        }

        for id in survivors {
            let Some(request) = requests.get_mut(&id) else {
                continue;
            };
            let footprint = request.footprint_tokens();
            if unit.memory.try_allocate(request, footprint) {
                continue;
            }
            warn!(
                id,
                sys,
                footprint,
                generated = request.generated,
                "request preempted: memory pressure"
            );
            unit.memory.release(request);
            request.state = RequestState::Waiting;
            request.sys = None;
            request.preemptions += 1;
            unit.running.remove(&id);
            waiting.insert((request.arrival_ns, id));
            *preemptions += 1;
        }

        Some(outcome)
    }

    /// Latest simulated time seen through `record_completion` or `schedule`.
    ///
    /// Requests admitted without an arrival time arrive at this instant.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// True when nothing is waiting and no unit has running requests.
    pub fn is_queue_empty(&self) -> bool {
        self.waiting.is_empty() && self.units.iter().all(|u| u.running.is_empty())
    }

    /// True when no unit has running requests or an outstanding step.
    pub fn is_idle(&self) -> bool {
        self.units.iter().all(ExecutionUnit::is_idle)
    }

    /// Earliest arrival among waiting requests.
    pub fn first_arrival_time(&self) -> Option<u64> {
        self.waiting.first().map(|&(arrival_ns, _)| arrival_ns)
    }

    /// Head of `waiting` if its footprint exceeds every unit's KV capacity.
    ///
    /// Under strict FIFO such a request blocks the queue forever.
    pub fn unservable_head(&self) -> Option<u64> {
        let &(_, id) = self.waiting.first()?;
        let footprint = self.requests.get(&id)?.footprint_tokens();
        let fits_somewhere = self
            .units
            .iter()
            .any(|u| u.memory.could_ever_fit(footprint));
        (!fits_somewhere).then_some(id)
    }

    pub fn status(&self) -> SchedulerStatus {
        let (memory_used, memory_total) = self
            .units
            .iter()
            .map(|u| u.memory.utilization())
            .fold((0, 0), |(used, total), (u, c)| (used + u, total + c));
        SchedulerStatus {
            pending: self.waiting.len(),
            inflight: self.units.iter().map(|u| u.running.len()).sum(),
            completed: self.done.len(),
            memory_used,
            memory_total,
        }
    }

    /// True when every unit holds only its weights.
    pub fn is_leak_free(&self) -> bool {
        self.units.iter().all(|u| u.memory.is_leak_free())
    }

    /// Waiting request ids in queue order.
    pub fn waiting_ids(&self) -> Vec<u64> {
        self.waiting.iter().map(|&(_, id)| id).collect()
    }

    /// Running request ids on `sys`, ascending.
    pub fn inflight_ids(&self, sys: u32) -> Vec<u64> {
        self.units
            .get(sys as usize)
            .map(|u| u.running.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Step outstanding on `sys`, if any.
    pub fn outstanding_step(&self, sys: u32) -> Option<u64> {
        self.units.get(sys as usize).and_then(|u| u.dispatched)
    }

    /// A live (not yet finished) request.
    pub fn request(&self, id: u64) -> Option<&Request> {
        self.requests.get(&id)
    }

    /// Finished requests in completion order.
    pub fn done(&self) -> &[CompletedRequest] {
        &self.done
    }

    pub fn memory_stats(&self) -> Vec<MemoryStats> {
        self.units.iter().map(|u| u.memory.stats()).collect()
    }
}
