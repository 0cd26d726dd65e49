//! TOML configuration parsing for ServeSim.
//!
//! Defines the complete configuration schema for a co-simulation run: the
//! served model, cluster parallelism and memory, the timing-engine peer
//! command, and the request dataset.

use crate::profile::{MemoryLayout, ModelProfile, UnitMemory};
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    pub peer: PeerSection,
    #[serde(default)]
    pub trace: TraceSection,
}

/// General simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Human-readable name for this simulation.
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Random seed for generated arrivals.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Throughput logging interval in simulated seconds.
    #[serde(default = "default_log_interval")]
    pub log_interval_sec: f64,
    /// Keep serving when the queues drain instead of shutting down.
    #[serde(default)]
    pub idle_mode: bool,
    /// Sleep between idle rounds, in wall-clock milliseconds.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Consecutive unparsable rounds tolerated before the run fails.
    #[serde(default = "default_desync_tolerance")]
    pub desync_tolerance: u32,
}

fn default_sim_name() -> String {
    "servesim".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_log_interval() -> f64 {
    0.5
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_desync_tolerance() -> u32 {
    16
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            log_interval_sec: default_log_interval(),
            idle_mode: false,
            idle_poll_ms: default_idle_poll_ms(),
            desync_tolerance: default_desync_tolerance(),
        }
    }
}

/// Served model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Floating point width in bits.
    #[serde(default = "default_fp_bits")]
    pub fp_bits: u32,
    /// Explicit shape for models without a built-in profile.
    #[serde(default)]
    pub custom: Option<CustomModelSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomModelSection {
    pub num_layers: u32,
    pub hidden_size: u32,
    /// Defaults to `hidden_size` (no grouped-query attention).
    pub kv_width: Option<u32>,
    pub params_billions: f64,
}

fn default_model_name() -> String {
    "gpt3-6.7b".to_string()
}

fn default_fp_bits() -> u32 {
    16
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            fp_bits: default_fp_bits(),
            custom: None,
        }
    }
}

/// Cluster layout and memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Hardware label passed through to workload files.
    #[serde(default = "default_hardware")]
    pub hardware: String,
    /// Total NPUs.
    #[serde(default = "default_npu_num")]
    pub npu_num: u32,
    /// Pipeline groups; each group is one execution unit.
    #[serde(default = "default_npu_group")]
    pub npu_group: u32,
    /// Device memory per NPU in GB.
    #[serde(default = "default_npu_mem_gb")]
    pub npu_mem_gb: f64,
    /// Maximum requests per batch; 0 means unbounded.
    #[serde(default)]
    pub max_batch: usize,
    /// Tokens per KV-cache block.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Override the derived per-unit capacity, in blocks.
    #[serde(default)]
    pub capacity_blocks: Option<u64>,
    /// Override the derived per-unit weight baseline, in blocks.
    #[serde(default)]
    pub weight_blocks: Option<u64>,
}

fn default_hardware() -> String {
    "RTX3090".to_string()
}
fn default_npu_num() -> u32 {
    16
}
fn default_npu_group() -> u32 {
    1
}
fn default_npu_mem_gb() -> f64 {
    40.0
}
fn default_block_size() -> u32 {
    8
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            hardware: default_hardware(),
            npu_num: default_npu_num(),
            npu_group: default_npu_group(),
            npu_mem_gb: default_npu_mem_gb(),
            max_batch: 0,
            block_size: default_block_size(),
            capacity_blocks: None,
            weight_blocks: None,
        }
    }
}

/// External timing-engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Executable to spawn.
    pub binary: String,
    /// Extra arguments, passed before the workload argument.
    #[serde(default)]
    pub args: Vec<String>,
    /// Prefix joined with the seed workload path to form the last argument.
    #[serde(default = "default_workload_flag")]
    pub workload_flag: String,
    /// Directory receiving generated workload files.
    #[serde(default = "default_workload_dir")]
    pub workload_dir: PathBuf,
}

fn default_workload_flag() -> String {
    "--workload-configuration=".to_string()
}

fn default_workload_dir() -> PathBuf {
    PathBuf::from("workloads")
}

/// Request dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSection {
    /// Format: "jsonl" or "tsv".
    #[serde(default = "default_trace_format")]
    pub format: String,
    /// Dataset path. Without one, a fixed smoke-test batch is used.
    pub path: Option<PathBuf>,
    /// Maximum number of requests to load.
    pub req_num: Option<usize>,
    /// Poisson arrival rate (req/s) for records without arrival times.
    pub rate: Option<f64>,
    /// Start requests in the generation phase.
    #[serde(default)]
    pub skip_prompt: bool,
}

fn default_trace_format() -> String {
    "jsonl".to_string()
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            format: default_trace_format(),
            path: None,
            req_num: None,
            rate: None,
            skip_prompt: false,
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    fn validate(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        if cluster.npu_num == 0 {
            return Err(ConfigError::Validation("npu_num must be > 0".to_string()));
        }
        if cluster.npu_group == 0 {
            return Err(ConfigError::Validation("npu_group must be > 0".to_string()));
        }
        if cluster.npu_num % cluster.npu_group != 0 {
            return Err(ConfigError::Validation(format!(
                "npu_num ({}) must be a multiple of npu_group ({})",
                cluster.npu_num, cluster.npu_group,
            )));
        }
        if cluster.block_size == 0 {
            return Err(ConfigError::Validation(
                "block_size must be > 0".to_string(),
            ));
        }
        if self.model.fp_bits == 0 {
            return Err(ConfigError::Validation("fp_bits must be > 0".to_string()));
        }
        if self.simulation.log_interval_sec <= 0.0 {
            return Err(ConfigError::Validation(
                "log_interval_sec must be > 0".to_string(),
            ));
        }
        if self.simulation.desync_tolerance == 0 {
            return Err(ConfigError::Validation(
                "desync_tolerance must be > 0".to_string(),
            ));
        }
        if self.peer.binary.trim().is_empty() {
            return Err(ConfigError::Validation(
                "peer.binary must not be empty".to_string(),
            ));
        }
        if let Some(rate) = self.trace.rate {
            if rate <= 0.0 {
                return Err(ConfigError::Validation("trace.rate must be > 0".to_string()));
            }
        }

        let memory = self.unit_memory()?;
        if memory.weight_blocks >= memory.capacity_blocks {
            return Err(ConfigError::Validation(format!(
                "model weights ({} blocks) leave no room for KV cache ({} blocks per unit)",
                memory.weight_blocks, memory.capacity_blocks,
            )));
        }
        Ok(())
    }

    /// Number of execution units (pipeline groups).
    pub fn execution_units(&self) -> u32 {
        self.cluster.npu_group
    }

    /// Resolve the model profile from the name or the custom section.
    pub fn model_profile(&self) -> Option<ModelProfile> {
        if let Some(custom) = &self.model.custom {
            return Some(ModelProfile::Custom {
                num_layers: custom.num_layers,
                hidden_size: custom.hidden_size,
                kv_width: custom.kv_width.unwrap_or(custom.hidden_size),
                params_billions: custom.params_billions,
            });
        }
        ModelProfile::from_name(&self.model.name)
    }

    /// Per-unit memory in blocks, explicit overrides taking precedence.
    pub fn unit_memory(&self) -> Result<UnitMemory, ConfigError> {
        let cluster = &self.cluster;
        if let (Some(capacity_blocks), Some(weight_blocks)) =
            (cluster.capacity_blocks, cluster.weight_blocks)
        {
            return Ok(UnitMemory {
                capacity_blocks,
                weight_blocks,
            });
        }

        let profile = self.model_profile().ok_or_else(|| {
            ConfigError::Validation(format!(
                "unknown model '{}': add [model.custom] or set cluster.capacity_blocks and cluster.weight_blocks",
                self.model.name
            ))
        })?;
        let layout = MemoryLayout {
            npu_mem_gb: cluster.npu_mem_gb,
            npus_per_unit: cluster.npu_num / cluster.npu_group,
            units: cluster.npu_group,
            fp_bits: self.model.fp_bits,
            block_size: cluster.block_size,
        };
        let derived = profile.unit_memory(&layout);
        Ok(UnitMemory {
            capacity_blocks: cluster.capacity_blocks.unwrap_or(derived.capacity_blocks),
            weight_blocks: cluster.weight_blocks.unwrap_or(derived.weight_blocks),
        })
    }

    /// Maximum batch size, `None` when unbounded.
    pub fn max_batch(&self) -> Option<usize> {
        match self.cluster.max_batch {
            0 => None,
            n => Some(n),
        }
    }

    /// Scheduler parameters for this run.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let memory = self.unit_memory()?;
        Ok(SchedulerConfig {
            units: self.execution_units(),
            max_batch: self.max_batch(),
            capacity_blocks: memory.capacity_blocks,
            baseline_blocks: memory.weight_blocks,
            block_size: self.cluster.block_size,
            model: self.model.name.clone(),
            hardware: self.cluster.hardware.clone(),
            npu_num: self.cluster.npu_num,
            npu_group: self.cluster.npu_group,
            fp_bits: self.model.fp_bits,
            arrival_gating: !self.simulation.idle_mode,
            skip_prompt: self.trace.skip_prompt,
        })
    }

    /// Throughput logging interval in nanoseconds.
    pub fn log_interval_ns(&self) -> u64 {
        (self.simulation.log_interval_sec * 1e9).round() as u64
    }
}
