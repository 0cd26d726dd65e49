//! Metrics collection and aggregation for co-simulation runs.
//!
//! Tracks a prompt/generation throughput time series sampled on a fixed
//! simulated interval, and summarizes finished requests into latency, TTFT
//! and queue-wait percentiles.

use crate::clock::NANOS_PER_SEC;
use crate::memory::MemoryStats;
use crate::request::CompletedRequest;
use crate::scheduler::{Scheduler, StepOutcome};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Percentile values for a distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Throughput over one logging interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// End of the interval, in simulated seconds.
    pub time_sec: f64,
    pub prompt_tps: f64,
    pub gen_tps: f64,
}

/// Interval accumulators and the resulting time series.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    interval_ns: u64,
    last_log_ns: u64,
    prompt_acc: u64,
    gen_acc: u64,
    /// Lifetime totals.
    pub totals: StepOutcome,
    samples: Vec<ThroughputSample>,
}

impl ThroughputTracker {
    pub fn new(interval_ns: u64) -> Self {
        Self::starting_at(interval_ns, 0)
    }

    /// Start the first interval at `start_ns`.
    pub fn starting_at(interval_ns: u64, start_ns: u64) -> Self {
        Self {
            interval_ns: interval_ns.max(1),
            last_log_ns: start_ns,
            prompt_acc: 0,
            gen_acc: 0,
            totals: StepOutcome::default(),
            samples: Vec::new(),
        }
    }

    /// Add one step's tokens to the current interval.
    pub fn record(&mut self, outcome: &StepOutcome) {
        self.prompt_acc += outcome.prompt_tokens;
        self.gen_acc += outcome.generated_tokens;
        self.totals.prompt_tokens += outcome.prompt_tokens;
        self.totals.generated_tokens += outcome.generated_tokens;
        self.totals.finished += outcome.finished;
    }

    /// Close every full interval that ended before `now_ns`.
    ///
    /// Intervals with no traffic produce zero samples so the series stays
    /// evenly spaced. Returns the number of samples emitted.
    pub fn maybe_flush(&mut self, now_ns: u64) -> usize {
        let mut emitted = 0;
        while now_ns > self.last_log_ns + self.interval_ns {
            self.last_log_ns += self.interval_ns;
            self.push_sample(self.last_log_ns, self.interval_ns);
            emitted += 1;
        }
        emitted
    }

    /// Flush the trailing partial interval, if it holds any tokens.
    pub fn finish(&mut self, now_ns: u64) {
        self.maybe_flush(now_ns);
        let elapsed = now_ns.saturating_sub(self.last_log_ns);
        if elapsed > 0 && (self.prompt_acc > 0 || self.gen_acc > 0) {
            self.last_log_ns = now_ns;
            self.push_sample(now_ns, elapsed);
        }
    }

    fn push_sample(&mut self, end_ns: u64, span_ns: u64) {
        let scale = NANOS_PER_SEC as f64 / span_ns as f64;
        let sample = ThroughputSample {
            time_sec: end_ns as f64 / NANOS_PER_SEC as f64,
            prompt_tps: self.prompt_acc as f64 * scale,
            gen_tps: self.gen_acc as f64 * scale,
        };
        info!(
            time_sec = sample.time_sec,
            prompt_tps = sample.prompt_tps,
            gen_tps = sample.gen_tps,
            "throughput"
        );
        self.samples.push(sample);
        self.prompt_acc = 0;
        self.gen_acc = 0;
    }

    pub fn samples(&self) -> &[ThroughputSample] {
        &self.samples
    }
}

/// Summary of a co-simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    /// Final engine clock.
    pub total_clock_ns: u64,
    /// Final engine clock in seconds.
    pub latency_sec: f64,
    pub completed_requests: u64,
    /// Requests still waiting or running when the run stopped.
    pub unfinished_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_generated_tokens: u64,
    pub avg_prompt_tps: f64,
    pub avg_gen_tps: f64,
    pub requests_per_sec: f64,
    pub preemptions: u64,
    pub end_to_end_latency_ms: Percentiles,
    pub ttft_ms: Percentiles,
    pub queue_wait_ms: Percentiles,
    pub throughput: Vec<ThroughputSample>,
    pub memory: Vec<MemoryStats>,
    /// Every unit returned to its weight baseline.
    pub memory_freed: bool,
    pub requests: Vec<CompletedRequest>,
}

impl RunReport {
    /// Summarize the scheduler and tracker state at `total_clock_ns`.
    pub fn build(
        name: &str,
        scheduler: &Scheduler,
        tracker: &ThroughputTracker,
        total_clock_ns: u64,
    ) -> Self {
        let done = scheduler.done();
        let latency: Vec<f64> = done.iter().map(|r| ns_to_ms(r.latency_ns())).collect();
        let ttft: Vec<f64> = done.iter().map(|r| ns_to_ms(r.ttft_ns())).collect();
        let queue: Vec<f64> = done.iter().map(|r| ns_to_ms(r.queue_wait_ns())).collect();

        let status = scheduler.status();
        let latency_sec = total_clock_ns as f64 / NANOS_PER_SEC as f64;
        let per_sec = |count: u64| {
            if latency_sec > 0.0 {
                count as f64 / latency_sec
            } else {
                0.0
            }
        };

        Self {
            name: name.to_string(),
            total_clock_ns,
            latency_sec,
            completed_requests: done.len() as u64,
            unfinished_requests: (status.pending + status.inflight) as u64,
            total_prompt_tokens: tracker.totals.prompt_tokens,
            total_generated_tokens: tracker.totals.generated_tokens,
            avg_prompt_tps: per_sec(tracker.totals.prompt_tokens),
            avg_gen_tps: per_sec(tracker.totals.generated_tokens),
            requests_per_sec: per_sec(done.len() as u64),
            preemptions: scheduler.preemptions,
            end_to_end_latency_ms: Percentiles::from_values(&latency),
            ttft_ms: Percentiles::from_values(&ttft),
            queue_wait_ms: Percentiles::from_values(&queue),
            throughput: tracker.samples().to_vec(),
            memory: scheduler.memory_stats(),
            memory_freed: scheduler.is_leak_free(),
            requests: done.to_vec(),
        }
    }
}

/// Format a run report as a pretty-printed table string.
pub fn format_table(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n{:=<70}\n", format!("  {} Results  ", report.name)));
    out.push_str(&format!(
        "  Simulated time: {:.3}s | Requests: {} done, {} unfinished | Preemptions: {}\n",
        report.latency_sec,
        report.completed_requests,
        report.unfinished_requests,
        report.preemptions,
    ));
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    out.push_str(&format!(
        "  TTFT (ms)       P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        report.ttft_ms.p50, report.ttft_ms.p90, report.ttft_ms.p99
    ));
    out.push_str(&format!(
        "  E2E (ms)        P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        report.end_to_end_latency_ms.p50,
        report.end_to_end_latency_ms.p90,
        report.end_to_end_latency_ms.p99
    ));
    out.push_str(&format!(
        "  Queue wait (ms) P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        report.queue_wait_ms.p50, report.queue_wait_ms.p90, report.queue_wait_ms.p99
    ));
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.2}  Prompt tok/s: {:.1}  Gen tok/s: {:.1}\n",
        report.requests_per_sec, report.avg_prompt_tps, report.avg_gen_tps,
    ));
    out.push_str(&format!(
        "  Tokens: {} prompt, {} generated over {} samples\n",
        report.total_prompt_tokens,
        report.total_generated_tokens,
        report.throughput.len(),
    ));
    out.push_str(&format!("{:-<70}\n", "  Memory  "));
    for (sys, mem) in report.memory.iter().enumerate() {
        out.push_str(&format!(
            "  sys[{sys}] used {}/{} blocks (weights {}, refusals {})\n",
            mem.used_blocks, mem.capacity_blocks, mem.baseline_blocks, mem.refusals,
        ));
    }
    out.push_str(&format!(
        "  Memory freed: {}\n",
        if report.memory_freed { "yes" } else { "NO" }
    ));
    out.push_str(&format!("{:=<70}\n", ""));
    out
}
