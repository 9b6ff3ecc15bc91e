//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `SPMD_*` environment variables override config file values.
//! Example: `SPMD_GRAD_SYNC__BUCKET_CAP_MB=64` overrides `grad_sync.bucket_cap_mb`.
//! The bare `ALLREDUCE_BUCKET_CAP_MB` variable is honoured too; `SPMD_*`
//! keys win when both are set.

use crate::distributed::bucket::{BucketConfig, BUCKET_CAP_ENV, DEFAULT_BUCKET_CAP_MB};
use crate::distributed::grads::{NormOptions, NormType};
use crate::distributed::groups::{validate_partition, DistributedContext, ParallelismConfig};
use crate::utils::error::{GradSyncError, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const ENV_PREFIX: &str = "SPMD_";

/// Gradient synchronisation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradSyncConfig {
    /// Bucket capacity for the data-parallel all-reduce, in MiB
    #[serde(default = "default_bucket_cap_mb")]
    pub bucket_cap_mb: usize,

    /// Clip threshold; `null` disables clipping
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,

    /// p of the norm, or `"inf"`
    #[serde(default)]
    pub norm_type: NormType,

    /// Count TP-replicated grads on every rank, compensated by TP size
    #[serde(default = "default_true")]
    pub force_spmd: bool,

    /// Sharded ("zero-1") optimizer in use
    #[serde(default)]
    pub sharded_optimizer: bool,

    /// Reduce sequence-parallel grads across TP before the DP reduction
    #[serde(default)]
    pub sequence_parallel: bool,
}

/// Distributed topology configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// World size (total number of processes)
    #[serde(default = "default_one")]
    pub world_size: usize,

    /// Data parallelism degree
    #[serde(default = "default_one")]
    pub dp_size: usize,

    /// Tensor parallelism degree
    #[serde(default = "default_one")]
    pub tp_size: usize,

    /// Pipeline parallelism degree
    #[serde(default = "default_one")]
    pub pp_size: usize,

    /// Explicit sharded-optimizer partition of the world ranks
    #[serde(default)]
    pub sharded_optimizer_groups: Option<Vec<Vec<usize>>>,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpmdConfig {
    #[serde(default)]
    pub distributed: DistributedConfig,

    #[serde(default)]
    pub grad_sync: GradSyncConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

// Default value functions
fn default_bucket_cap_mb() -> usize { DEFAULT_BUCKET_CAP_MB }
fn default_max_grad_norm() -> Option<f64> { Some(1.0) }
fn default_true() -> bool { true }
fn default_one() -> usize { 1 }

impl Default for GradSyncConfig {
    fn default() -> Self {
        Self {
            bucket_cap_mb: default_bucket_cap_mb(),
            max_grad_norm: default_max_grad_norm(),
            norm_type: NormType::default(),
            force_spmd: true,
            sharded_optimizer: false,
            sequence_parallel: false,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: default_one(),
            dp_size: default_one(),
            tp_size: default_one(),
            pp_size: default_one(),
            sharded_optimizer_groups: None,
        }
    }
}

impl GradSyncConfig {
    pub fn bucket_config(&self) -> BucketConfig {
        BucketConfig::from_megabytes(self.bucket_cap_mb)
    }

    /// Norm options for this config, borrowing sharded groups from `ctx`.
    pub fn norm_options<'a>(&self, ctx: &'a DistributedContext) -> NormOptions<'a> {
        NormOptions {
            norm_type: self.norm_type,
            sharded_optimizer: self.sharded_optimizer,
            sharded_optimizer_groups: if self.sharded_optimizer {
                ctx.sharded_optimizer_groups()
            } else {
                None
            },
            force_spmd: self.force_spmd,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_cap_mb == 0 {
            return Err(GradSyncError::Config("bucket_cap_mb must be > 0".to_string()));
        }
        if BucketConfig::try_from_megabytes(self.bucket_cap_mb).is_none() {
            return Err(GradSyncError::Config(format!(
                "bucket_cap_mb {} overflows a byte count",
                self.bucket_cap_mb
            )));
        }
        if let Some(max_norm) = self.max_grad_norm {
            if !(max_norm > 0.0) {
                return Err(GradSyncError::Config(format!(
                    "max_grad_norm must be > 0, got {}",
                    max_norm
                )));
            }
        }
        if let NormType::P(p) = self.norm_type {
            if !(p > 0.0) {
                return Err(GradSyncError::Config(format!("norm_type must be > 0, got {}", p)));
            }
        }
        Ok(())
    }
}

impl DistributedConfig {
    pub fn parallelism(&self) -> Result<ParallelismConfig> {
        ParallelismConfig::new(self.world_size, self.dp_size, self.tp_size, self.pp_size)
    }

    /// One in-process context per rank for this topology.
    pub fn build_local_grid(&self, device: Device) -> Result<Vec<DistributedContext>> {
        let parallelism = self.parallelism()?;
        match &self.sharded_optimizer_groups {
            Some(groups) => {
                DistributedContext::local_grid_with_sharded_groups(parallelism, groups.clone(), device)
            }
            None => DistributedContext::local_grid(parallelism, device),
        }
    }
}

impl SpmdConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| GradSyncError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(env::vars());
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(env::vars());
        config
    }

    /// Apply `KEY=value` overrides.
    ///
    /// Keys are `SPMD_`-prefixed and uppercase. Nested keys use a double
    /// underscore: `SPMD_GRAD_SYNC__MAX_GRAD_NORM`. Values that fail to
    /// parse are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();

        if let Some((_, value)) = vars.iter().find(|(k, _)| k == BUCKET_CAP_ENV) {
            self.apply_grad_sync_override("bucket_cap_mb", value);
        }

        for (key, value) in &vars {
            let Some(stripped) = key.strip_prefix(ENV_PREFIX) else { continue };
            let config_key = stripped.to_lowercase();

            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["grad_sync", field] => self.apply_grad_sync_override(field, value),
                ["distributed", field] => self.apply_distributed_override(field, value),
                [field] => {
                    // Try each section for simple keys
                    self.apply_grad_sync_override(field, value);
                    self.apply_distributed_override(field, value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_grad_sync_override(&mut self, field: &str, value: &str) {
        match field {
            "bucket_cap_mb" => if let Ok(v) = value.trim().parse() { self.grad_sync.bucket_cap_mb = v; }
            "max_grad_norm" => match value.trim().to_lowercase().as_str() {
                "" | "none" | "off" => self.grad_sync.max_grad_norm = None,
                v => if let Ok(v) = v.parse() { self.grad_sync.max_grad_norm = Some(v); }
            },
            "norm_type" => if let Ok(v) = value.parse() { self.grad_sync.norm_type = v; }
            "force_spmd" => self.grad_sync.force_spmd = parse_bool(value),
            "sharded_optimizer" => self.grad_sync.sharded_optimizer = parse_bool(value),
            "sequence_parallel" => self.grad_sync.sequence_parallel = parse_bool(value),
            _ => {}
        }
    }

    fn apply_distributed_override(&mut self, field: &str, value: &str) {
        match field {
            "world_size" => if let Ok(v) = value.parse() { self.distributed.world_size = v; }
            "dp_size" => if let Ok(v) = value.parse() { self.distributed.dp_size = v; }
            "tp_size" => if let Ok(v) = value.parse() { self.distributed.tp_size = v; }
            "pp_size" => if let Ok(v) = value.parse() { self.distributed.pp_size = v; }
            "sharded_optimizer_groups" => {
                if let Ok(v) = serde_json::from_str(value) {
                    self.distributed.sharded_optimizer_groups = Some(v);
                }
            }
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.distributed
            .parallelism()
            .map_err(|e| GradSyncError::Config(e.to_string()))?;
        self.grad_sync.validate()?;

        if let Some(groups) = &self.distributed.sharded_optimizer_groups {
            if !self.grad_sync.sharded_optimizer {
                return Err(GradSyncError::InvalidConfiguration(
                    "sharded_optimizer_groups set while grad_sync.sharded_optimizer is false"
                        .to_string(),
                ));
            }
            validate_partition(groups, self.distributed.world_size)?;
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GradSyncError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true") || value.trim() == "1"
}
