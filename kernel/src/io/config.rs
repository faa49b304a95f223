//! Kernel configuration (TOML), passed explicitly into constructors.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::merge::default_blocked_prefixes;
use crate::core::types::Budget;
use crate::io::process::SandboxLimits;
use crate::selector::embedding::DEFAULT_DIMS;

/// Kernel configuration.
///
/// Every field has a default so a missing or partial file still yields a
/// runnable kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Stamped on every audit record.
    pub profile_id: String,
    pub spec_version: String,
    /// Directory receiving `run_<run_id>.jsonl` files.
    pub log_dir: PathBuf,
    pub budget: BudgetConfig,
    pub policy: PolicyConfig,
    pub external: ExternalConfig,
    pub breaker: BreakerConfig,
    pub merge: MergeConfig,
    pub fences: FenceConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_steps: u32,
    pub max_invalid_picks: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyBackendKind {
    #[default]
    Heuristic,
    External,
    Embedding,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    pub backend: PolicyBackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExternalConfig {
    /// Policy command; the payload file path is appended as the last argument.
    pub argv: Vec<String>,
    /// Case-insensitive executable basenames allowed as `argv[0]`.
    pub allowlist: Vec<String>,
    /// Script arguments (`.py`, `.sh`, `.js`) must resolve under this directory.
    pub script_root: Option<PathBuf>,
    /// Skip the allowlist check.
    pub allow_unsafe: bool,
    pub cwd: Option<PathBuf>,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown_ms: u64,
    /// Optional JSON file the breaker counters are persisted to.
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    pub blocked_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FenceConfig {
    /// Device nodes whose presence makes up the GPU fence value.
    pub gpu_device_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dims: usize,
    pub cache_capacity: usize,
    /// Zero disables expiry.
    pub cache_ttl_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            profile_id: "default".to_string(),
            spec_version: "1".to_string(),
            log_dir: PathBuf::from("runs"),
            budget: BudgetConfig::default(),
            policy: PolicyConfig::default(),
            external: ExternalConfig::default(),
            breaker: BreakerConfig::default(),
            merge: MergeConfig::default(),
            fences: FenceConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_steps: 16,
            max_invalid_picks: 3,
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            allowlist: vec!["python3".to_string(), "python".to_string(), "node".to_string()],
            script_root: None,
            allow_unsafe: false,
            cwd: None,
            timeout_ms: 5_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_ms: 30_000,
            state_path: None,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            blocked_prefixes: default_blocked_prefixes(),
        }
    }
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            gpu_device_paths: vec![
                PathBuf::from("/dev/nvidia0"),
                PathBuf::from("/dev/dri/renderD128"),
            ],
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dims: DEFAULT_DIMS,
            cache_capacity: 256,
            cache_ttl_ms: 10 * 60 * 1000,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.profile_id.trim().is_empty() {
            return Err(anyhow!("profile_id must be non-empty"));
        }
        if self.budget.max_steps == 0 {
            return Err(anyhow!("budget.max_steps must be > 0"));
        }
        if self.breaker.threshold == 0 {
            return Err(anyhow!("breaker.threshold must be > 0"));
        }
        if self.external.timeout_ms == 0 {
            return Err(anyhow!("external.timeout_ms must be > 0"));
        }
        if self.external.max_output_bytes == 0 {
            return Err(anyhow!("external.max_output_bytes must be > 0"));
        }
        if self.policy.backend == PolicyBackendKind::External
            && self.external.argv.first().is_none_or(|a| a.trim().is_empty())
        {
            return Err(anyhow!("external.argv must be a non-empty array"));
        }
        if self.embedding.dims == 0 {
            return Err(anyhow!("embedding.dims must be > 0"));
        }
        if self.embedding.cache_capacity == 0 {
            return Err(anyhow!("embedding.cache_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn run_budget(&self) -> Budget {
        Budget {
            max_steps: self.budget.max_steps,
            max_invalid_picks: self.budget.max_invalid_picks,
        }
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout_ms: self.external.timeout_ms,
            max_output_bytes: self.external.max_output_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
