//! Request model for LLM serving simulation.
//!
//! Each [`Request`] tracks one serving request from admission through its
//! prompt step and generation steps until it reaches its target length.
//! Outputs are token counts only; no text is produced.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Queued, holding no KV-cache memory.
    #[default]
    Waiting,
    /// Part of an execution unit's batch, holding KV-cache memory.
    Running,
    /// Reached its target length. Terminal.
    Done,
}

/// Execution phase of a request within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// The prompt has not been processed yet.
    Prompt,
    /// The prompt ran; each step produces one more token.
    Generation,
}

/// A single serving request owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique, monotonically assigned identifier.
    pub id: u64,
    /// Model the request targets.
    pub model: String,
    /// Prompt tokens.
    pub input_len: u32,
    /// Total sequence length at completion (prompt + generation).
    pub output_len: u32,
    /// Arrival timestamp in nanoseconds.
    pub arrival_ns: u64,
    /// Tokens generated so far.
    pub generated: u32,
    /// Whether the prompt step has already run.
    pub prompt_done: bool,
    /// Execution unit currently running the request.
    pub sys: Option<u32>,
    /// Lifecycle state.
    pub state: RequestState,
    /// KV-cache blocks currently reserved for this request.
    pub allocated_blocks: u64,
    /// Time the request first entered a batch.
    pub first_admitted_ns: Option<u64>,
    /// Time the prompt step finished.
    pub first_token_ns: Option<u64>,
    /// Number of times the request was bumped back to the queue.
    pub preemptions: u32,
}

impl Request {
    /// Create a waiting request. Validation happens at the scheduler boundary.
    pub fn new(
        id: u64,
        model: impl Into<String>,
        input_len: u32,
        output_len: u32,
        arrival_ns: u64,
    ) -> Self {
        Self {
            id,
            model: model.into(),
            input_len,
            output_len,
            arrival_ns,
            generated: 0,
            prompt_done: false,
            sys: None,
            state: RequestState::Waiting,
            allocated_blocks: 0,
            first_admitted_ns: None,
            first_token_ns: None,
            preemptions: 0,
        }
    }

    /// Tokens this request must generate before it is done.
    ///
    /// The prompt step yields the first token, so at least one step always runs.
    pub fn target_tokens(&self) -> u32 {
        self.output_len.saturating_sub(self.input_len).max(1)
    }

    /// Current sequence length (prompt plus generated tokens).
    pub fn seq_len(&self) -> u32 {
        self.input_len + self.generated
    }

    /// Tokens whose KV entries must be resident to run the next step.
    pub fn footprint_tokens(&self) -> u32 {
        self.seq_len()
    }

    pub fn phase(&self) -> Phase {
        if self.prompt_done {
            Phase::Generation
        } else {
            Phase::Prompt
        }
    }

    /// Whether generation is complete.
    pub fn is_finished(&self) -> bool {
        self.generated >= self.target_tokens()
    }

    /// Advance one step. Returns `(prompt_tokens, generated_tokens)` processed.
    pub fn advance(&mut self, now_ns: u64) -> (u64, u64) {
        match self.phase() {
            Phase::Prompt => {
                self.prompt_done = true;
                self.generated += 1;
                self.first_token_ns.get_or_insert(now_ns);
                (self.input_len as u64, 0)
            }
            Phase::Generation => {
                self.generated += 1;
                self.first_token_ns.get_or_insert(now_ns);
                (0, 1)
            }
        }
    }
}

/// Immutable record of a finished request, appended to the scheduler's done log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRequest {
    pub id: u64,
    pub model: String,
    pub sys: u32,
    pub input_len: u32,
    pub output_len: u32,
    pub generated: u32,
    pub arrival_ns: u64,
    pub first_admitted_ns: u64,
    pub first_token_ns: u64,
    pub end_ns: u64,
    pub preemptions: u32,
}

impl CompletedRequest {
    pub fn from_request(request: &Request, sys: u32, end_ns: u64) -> Self {
        Self {
            id: request.id,
            model: request.model.clone(),
            sys,
            input_len: request.input_len,
            output_len: request.output_len,
            generated: request.generated,
            arrival_ns: request.arrival_ns,
            first_admitted_ns: request.first_admitted_ns.unwrap_or(end_ns),
            first_token_ns: request.first_token_ns.unwrap_or(end_ns),
            end_ns,
            preemptions: request.preemptions,
        }
    }

    /// End-to-end latency in nanoseconds.
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.arrival_ns)
    }

    /// Time to first token in nanoseconds.
    pub fn ttft_ns(&self) -> u64 {
        self.first_token_ns.saturating_sub(self.arrival_ns)
    }

    /// Time spent queued before the first admission.
    pub fn queue_wait_ns(&self) -> u64 {
        self.first_admitted_ns.saturating_sub(self.arrival_ns)
    }
}
