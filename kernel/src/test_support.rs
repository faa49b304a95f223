//! Test-only helpers: scripted sandboxes, configs and requests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::Value;

use crate::core::blend::ControlMode;
use crate::core::types::RunRequest;
use crate::io::config::KernelConfig;
use crate::io::process::{CaptureResult, Sandbox, SandboxLimits};
use crate::selector::{HeuristicSelector, SelectorBackend, Selectors};

/// One recorded sandbox invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCall {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Contents of the file named by the last argument at call time.
    pub payload: String,
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<CaptureResult>,
    calls: Vec<SandboxCall>,
}

/// Sandbox that answers from a queue of canned captures. Clones share the
/// queue and the call log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSandbox {
    script: Rc<RefCell<Script>>,
}

impl ScriptedSandbox {
    pub fn new(replies: Vec<CaptureResult>) -> Self {
        Self {
            script: Rc::new(RefCell::new(Script {
                replies: replies.into(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.script.borrow().calls.clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn run_capture(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        _limits: &SandboxLimits,
    ) -> CaptureResult {
        let payload = argv
            .last()
            .and_then(|path| fs::read_to_string(path).ok())
            .unwrap_or_default();
        let mut script = self.script.borrow_mut();
        script.calls.push(SandboxCall {
            argv: argv.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
            payload,
        });
        script
            .replies
            .pop_front()
            .unwrap_or_else(|| CaptureResult::failed("no scripted reply"))
    }
}

/// Successful capture with `output` on stdout.
pub fn capture_ok(output: &str) -> CaptureResult {
    CaptureResult {
        exit_code: Some(0),
        output: output.to_string(),
        ..CaptureResult::default()
    }
}

/// Default config writing audit logs under `dir`.
pub fn config_in(dir: &Path) -> KernelConfig {
    KernelConfig {
        log_dir: dir.join("runs"),
        ..KernelConfig::default()
    }
}

/// Request for `goal_id` with object `inputs`.
pub fn request(goal_id: &str, tags: &[&str], inputs: Value, mode: ControlMode) -> RunRequest {
    RunRequest {
        goal_id: goal_id.to_string(),
        candidate_tags: tags.iter().map(|t| t.to_string()).collect(),
        inputs: inputs.as_object().cloned().unwrap_or_default(),
        control_mode: mode,
        request_id: None,
    }
}

/// Heuristic fallback paired with a heuristic policy.
pub fn heuristic_selectors() -> Selectors {
    Selectors::new(SelectorBackend::Heuristic(HeuristicSelector))
}
