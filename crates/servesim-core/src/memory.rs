//! KV-cache capacity model with block-granular allocation.
//!
//! Models the memory of one execution unit the way a paged KV cache sees it:
//! - A fixed baseline (model weights) that is never freed during a run
//! - Per-request reservations rounded up to whole blocks
//! - Hard refusal when an allocation would exceed capacity
//!
//! Reservations are only re-evaluated when a request's sequence crosses a
//! block boundary, so most generation steps leave `used` untouched.

use crate::request::Request;
use serde::{Deserialize, Serialize};

/// Block-based memory accounting for a single execution unit.
#[derive(Debug, Clone)]
pub struct MemoryModel {
    /// Total blocks available on the unit.
    capacity_blocks: u64,
    /// Blocks taken by model weights.
    baseline_blocks: u64,
    /// Tokens per block.
    block_size: u32,
    /// Blocks currently in use, baseline included.
    used_blocks: u64,
    /// Allocation attempts refused for lack of capacity.
    pub refusals: u64,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub capacity_blocks: u64,
    pub baseline_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub block_size: u32,
    pub utilization: f64,
    pub refusals: u64,
}

impl MemoryModel {
    /// Create a memory model with the weights already resident.
    pub fn new(capacity_blocks: u64, baseline_blocks: u64, block_size: u32) -> Self {
        debug_assert!(block_size > 0, "block_size must be > 0");
        debug_assert!(
            baseline_blocks <= capacity_blocks,
            "baseline ({baseline_blocks}) exceeds capacity ({capacity_blocks})"
        );
        Self {
            capacity_blocks,
            baseline_blocks,
            block_size,
            used_blocks: baseline_blocks,
            refusals: 0,
        }
    }

    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    /// Blocks not reserved by weights or requests.
    pub fn free_blocks(&self) -> u64 {
        self.capacity_blocks - self.used_blocks
    }

    /// Blocks available for KV cache when no request is resident.
    pub fn kv_capacity_blocks(&self) -> u64 {
        self.capacity_blocks - self.baseline_blocks
    }

    /// `(used, capacity)` snapshot.
    pub fn utilization(&self) -> (u64, u64) {
        (self.used_blocks, self.capacity_blocks)
    }

    /// Used fraction of capacity (0.0 - 1.0).
    pub fn utilization_ratio(&self) -> f64 {
        if self.capacity_blocks == 0 {
            return 0.0;
        }
        self.used_blocks as f64 / self.capacity_blocks as f64
    }

    /// Convert a token count to blocks, rounding up.
    pub fn blocks_for(&self, tokens: u32) -> u64 {
        tokens.div_ceil(self.block_size) as u64
    }

    /// Whether a footprint of `tokens` could ever be held by this unit.
    pub fn could_ever_fit(&self, tokens: u32) -> bool {
        self.blocks_for(tokens) <= self.kv_capacity_blocks()
    }

    /// Grow the request's reservation so it covers `tokens`.
    ///
    /// Succeeds without change if the current reservation already covers it.
    /// Never partially allocates.
    pub fn try_allocate(&mut self, request: &mut Request, tokens: u32) -> bool {
        let needed = self.blocks_for(tokens);
        let delta = needed.saturating_sub(request.allocated_blocks);
        if delta == 0 {
            return true;
        }
        if self.used_blocks + delta > self.capacity_blocks {
            self.refusals += 1;
            return false;
        }
        self.used_blocks += delta;
        request.allocated_blocks = needed;
        true
    }

    /// Free every block held by the request. Returns the number freed.
    pub fn release(&mut self, request: &mut Request) -> u64 {
        let freed = request.allocated_blocks;
        debug_assert!(
            self.used_blocks - freed >= self.baseline_blocks,
            "release of request {} would dip below baseline",
            request.id
        );
        self.used_blocks -= freed;
        request.allocated_blocks = 0;
        freed
    }

    /// True when only the weights remain resident.
    pub fn is_leak_free(&self) -> bool {
        self.used_blocks == self.baseline_blocks
    }

    /// Get a statistics snapshot.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            capacity_blocks: self.capacity_blocks,
            baseline_blocks: self.baseline_blocks,
            used_blocks: self.used_blocks,
            free_blocks: self.free_blocks(),
            block_size: self.block_size,
            utilization: self.utilization_ratio(),
            refusals: self.refusals,
        }
    }
}
