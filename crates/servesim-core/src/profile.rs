//! Model shape profiles used to size KV-cache memory.
//!
//! A profile knows how large a model's weights are and how many bytes of KV
//! cache each token costs. Combined with NPU memory and the parallelism
//! layout, that yields per-unit capacity and weight baselines in blocks.

use serde::{Deserialize, Serialize};

const GIB: f64 = (1u64 << 30) as f64;

/// Shape of a served model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelProfile {
    /// GPT-3 6.7B (32 layers, 4096 hidden).
    Gpt3_6_7B,
    /// GPT-3 13B (40 layers, 5120 hidden).
    Gpt3_13B,
    /// GPT-3 30B (48 layers, 7168 hidden).
    Gpt3_30B,
    /// LLaMA 7B (32 layers, 4096 hidden).
    Llama7B,
    /// Llama 3.1 8B (32 layers, grouped-query attention with 8 KV heads).
    Llama3_8B,
    /// Custom model with user-specified shape.
    Custom {
        num_layers: u32,
        hidden_size: u32,
        kv_width: u32,
        params_billions: f64,
    },
}

impl ModelProfile {
    /// Look up a profile by model name. Matching is case-insensitive and
    /// ignores an organisation prefix such as `meta-llama/`.
    pub fn from_name(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name).to_ascii_lowercase();
        match base.as_str() {
            "gpt3-6.7b" | "gpt-3-6.7b" => Some(Self::Gpt3_6_7B),
            "gpt3-13b" | "gpt-3-13b" => Some(Self::Gpt3_13B),
            "gpt3-30b" | "gpt-3-30b" => Some(Self::Gpt3_30B),
            "llama-7b" | "llama7b" => Some(Self::Llama7B),
            "llama-3.1-8b" | "llama-3.1-8b-instruct" => Some(Self::Llama3_8B),
            _ => None,
        }
    }

    pub fn num_layers(&self) -> u32 {
        match self {
            Self::Gpt3_6_7B | Self::Llama7B | Self::Llama3_8B => 32,
            Self::Gpt3_13B => 40,
            Self::Gpt3_30B => 48,
            Self::Custom { num_layers, .. } => *num_layers,
        }
    }

    pub fn hidden_size(&self) -> u32 {
        match self {
            Self::Gpt3_6_7B | Self::Llama7B | Self::Llama3_8B => 4096,
            Self::Gpt3_13B => 5120,
            Self::Gpt3_30B => 7168,
            Self::Custom { hidden_size, .. } => *hidden_size,
        }
    }

    /// Width of the K (and V) projection per layer.
    pub fn kv_width(&self) -> u32 {
        match self {
            Self::Llama3_8B => 1024,
            Self::Custom { kv_width, .. } => *kv_width,
            other => other.hidden_size(),
        }
    }

    pub fn params_billions(&self) -> f64 {
        match self {
            Self::Gpt3_6_7B => 6.7,
            Self::Gpt3_13B => 13.0,
            Self::Gpt3_30B => 30.0,
            Self::Llama7B => 6.74,
            Self::Llama3_8B => 8.03,
            Self::Custom {
                params_billions, ..
            } => *params_billions,
        }
    }

    /// Bytes of weights at the given precision.
    pub fn weight_bytes(&self, fp_bits: u32) -> f64 {
        self.params_billions() * 1e9 * fp_bits as f64 / 8.0
    }

    /// Bytes of K and V cache per token across all layers.
    pub fn kv_bytes_per_token(&self, fp_bits: u32) -> f64 {
        2.0 * self.num_layers() as f64 * self.kv_width() as f64 * fp_bits as f64 / 8.0
    }

    /// Derive per-unit memory in blocks for a parallelism layout.
    ///
    /// Layers (and therefore weights and KV cache) are split evenly across
    /// `units` pipeline stages; each stage owns `npus_per_unit` devices.
    pub fn unit_memory(&self, layout: &MemoryLayout) -> UnitMemory {
        let units = layout.units.max(1) as f64;
        let capacity_bytes = layout.npu_mem_gb * GIB * layout.npus_per_unit as f64;
        let weight_bytes = self.weight_bytes(layout.fp_bits) / units;
        let block_bytes =
            self.kv_bytes_per_token(layout.fp_bits) / units * layout.block_size as f64;

        UnitMemory {
            capacity_blocks: (capacity_bytes / block_bytes).floor() as u64,
            weight_blocks: (weight_bytes / block_bytes).ceil() as u64,
        }
    }
}

/// Inputs for sizing per-unit memory.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    pub npu_mem_gb: f64,
    pub npus_per_unit: u32,
    pub units: u32,
    pub fp_bits: u32,
    pub block_size: u32,
}

/// Per-unit memory expressed in KV blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMemory {
    pub capacity_blocks: u64,
    pub weight_blocks: u64,
}
