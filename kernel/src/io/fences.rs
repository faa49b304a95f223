//! Environment fences recorded with each tool run and re-checked on replay.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use crate::core::digest::sha256_hex;
use crate::core::types::Fence;
use crate::io::config::FenceConfig;

/// Value recorded for an input-file fence whose file cannot be read.
pub const FENCE_MISSING: &str = "missing";
pub const GPU_PRESENT: &str = "gpu:present";
pub const GPU_ABSENT: &str = "gpu:absent";

#[derive(Debug, Clone, Default)]
pub struct FenceProbe {
    gpu_device_paths: Vec<PathBuf>,
}

impl FenceProbe {
    pub fn new(config: &FenceConfig) -> Self {
        Self {
            gpu_device_paths: config.gpu_device_paths.clone(),
        }
    }

    /// Current value of each fence keyed by [`Fence::key`].
    pub fn compute(&self, fences: &[Fence], input: &Value) -> BTreeMap<String, String> {
        fences
            .iter()
            .map(|fence| (fence.key(), self.value(fence, input)))
            .collect()
    }

    fn value(&self, fence: &Fence, input: &Value) -> String {
        match fence {
            Fence::InputFile { input_key } => input
                .get(input_key)
                .and_then(Value::as_str)
                .and_then(|path| fs::read(path).ok())
                .map(sha256_hex)
                .unwrap_or_else(|| FENCE_MISSING.to_string()),
            Fence::GpuPresence => {
                if self.gpu_device_paths.iter().any(|p| p.exists()) {
                    GPU_PRESENT.to_string()
                } else {
                    GPU_ABSENT.to_string()
                }
            }
        }
    }
}
