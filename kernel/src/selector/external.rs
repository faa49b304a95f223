//! External-process policy guarded by an allowlist, a script root and a
//! consecutive-failure circuit breaker.
//!
//! Every failure degrades to the heuristic fallback; the raw text carries a
//! `[policy_failure]<reason>` prefix so the audit log shows what happened.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::blend::ControlMode;
use crate::core::breaker::CircuitBreaker;
use crate::core::canonical::canonical_string;
use crate::core::clock::SharedClock;
use crate::core::digest::sha256_hex;
use crate::core::protocol::{Selection, parse_selection};
use crate::io::breaker_store::{load_breaker_state, write_breaker_state};
use crate::io::config::{ExternalConfig, KernelConfig};
use crate::io::process::{CaptureResult, Sandbox, SandboxLimits};
use crate::selector::heuristic::HeuristicSelector;
use crate::selector::{SelectRequest, Selector, SelectorOutput};

pub const POLICY_FAILURE_PREFIX: &str = "[policy_failure]";

const SCRIPT_EXTENSIONS: [&str; 3] = [".py", ".sh", ".js"];

/// Why a policy call fell back. `Display` is the reason recorded in raw text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyFailure {
    #[error("gate:allowlist")]
    NotAllowlisted,
    #[error("gate:script_root")]
    ScriptOutsideRoot,
    #[error("spawn")]
    Spawn,
    #[error("timeout")]
    Timeout,
    #[error("exit:{0}")]
    Exit(String),
    #[error("empty")]
    Empty,
    #[error("parse")]
    Parse,
    #[error("unresolved_sid")]
    UnresolvedSid,
    #[error("breaker_open")]
    BreakerOpen,
}

impl PolicyFailure {
    /// Configuration rejections; these never reach the process and do not
    /// count toward the breaker.
    pub fn is_gate(&self) -> bool {
        matches!(self, PolicyFailure::NotAllowlisted | PolicyFailure::ScriptOutsideRoot)
    }
}

pub struct ExternalProcessSelector {
    config: ExternalConfig,
    limits: SandboxLimits,
    breaker: CircuitBreaker,
    state_path: Option<PathBuf>,
    sandbox: Box<dyn Sandbox>,
    clock: SharedClock,
}

impl ExternalProcessSelector {
    /// Build from config, restoring persisted breaker counters when a state
    /// path is configured.
    pub fn new(
        config: &KernelConfig,
        sandbox: Box<dyn Sandbox>,
        clock: SharedClock,
    ) -> Result<Self> {
        let state_path = config.breaker.state_path.clone();
        let state = match &state_path {
            Some(path) => load_breaker_state(path)?,
            None => Default::default(),
        };
        Ok(Self {
            config: config.external.clone(),
            limits: config.sandbox_limits(),
            breaker: CircuitBreaker::with_state(
                config.breaker.threshold,
                config.breaker.cooldown_ms,
                state,
            ),
            state_path,
            sandbox,
            clock,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn diagnostics(&self) -> Value {
        let state = self.breaker.state();
        json!({
            "consecutive_failures": state.consecutive_failures,
            "open_until_ms": state.open_until_ms,
            "last_failure": state.last_failure,
        })
    }

    fn invoke(&self, request: &SelectRequest<'_>) -> Result<SelectorOutput, PolicyFailure> {
        self.check_gates()?;

        let payload = canonical_string(&build_payload(request));
        let mut file = tempfile::Builder::new()
            .prefix("dskernel-policy-")
            .suffix(".json")
            .tempfile()
            .map_err(|_| PolicyFailure::Spawn)?;
        file.write_all(payload.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|_| PolicyFailure::Spawn)?;

        let mut argv = self.config.argv.clone();
        argv.push(file.path().to_string_lossy().into_owned());
        let result = self
            .sandbox
            .run_capture(&argv, self.config.cwd.as_deref(), &self.limits);
        classify(&result, request)
    }

    fn check_gates(&self) -> Result<(), PolicyFailure> {
        let Some(program) = self.config.argv.first() else {
            return Err(PolicyFailure::Spawn);
        };
        if !self.config.allow_unsafe && !self.is_allowlisted(program) {
            return Err(PolicyFailure::NotAllowlisted);
        }
        if let Some(script) = self.config.argv.get(1)
            && is_script(script)
            && !self.script_under_root(script)
        {
            return Err(PolicyFailure::ScriptOutsideRoot);
        }
        Ok(())
    }

    fn is_allowlisted(&self, program: &str) -> bool {
        let Some(basename) = Path::new(program).file_name() else {
            return false;
        };
        let basename = basename.to_string_lossy().to_lowercase();
        self.config
            .allowlist
            .iter()
            .any(|allowed| allowed.to_lowercase() == basename)
    }

    fn script_under_root(&self, script: &str) -> bool {
        let Some(root) = &self.config.script_root else {
            return false;
        };
        let script = Path::new(script);
        let script = match &self.config.cwd {
            Some(cwd) if script.is_relative() => cwd.join(script),
            _ => script.to_path_buf(),
        };
        match (fs::canonicalize(root), fs::canonicalize(&script)) {
            (Ok(root), Ok(script)) => script.starts_with(root),
            _ => false,
        }
    }

    fn fallback(&self, request: &SelectRequest<'_>, failure: &PolicyFailure) -> SelectorOutput {
        let fallback_request = SelectRequest {
            control_mode: ControlMode::FallbackOnly,
            ..*request
        };
        let selection =
            HeuristicSelector::decide(fallback_request.menu, fallback_request.goal_context);
        let raw = format!("{POLICY_FAILURE_PREFIX}{failure}{}", selection.to_protocol());
        SelectorOutput { selection, raw }
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(err) = write_breaker_state(path, self.breaker.state()) {
            warn!(err = %format!("{err:#}"), "failed to persist breaker state");
        }
    }
}

impl Selector for ExternalProcessSelector {
    #[instrument(skip_all, fields(menu_len = request.menu.len()))]
    fn select(&mut self, request: &SelectRequest<'_>) -> SelectorOutput {
        let now = self.clock.now_ms();
        if self.breaker.is_open(now) {
            debug!("policy breaker open, using fallback");
            return self.fallback(request, &PolicyFailure::BreakerOpen);
        }
        let before = self.breaker.state().clone();
        let output = match self.invoke(request) {
            Ok(output) => {
                self.breaker.record_success();
                output
            }
            Err(failure) if failure.is_gate() => {
                warn!(reason = %failure, "policy command rejected by gate");
                self.fallback(request, &failure)
            }
            Err(failure) => {
                let reason = failure.to_string();
                if self.breaker.record_failure(&reason, now) {
                    warn!(
                        reason = %reason,
                        failures = self.breaker.state().consecutive_failures,
                        "policy breaker opened"
                    );
                } else {
                    debug!(reason = %reason, "policy call failed");
                }
                self.fallback(request, &failure)
            }
        };
        if *self.breaker.state() != before {
            self.persist();
        }
        output
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

fn is_script(arg: &str) -> bool {
    let lower = arg.to_lowercase();
    SCRIPT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// `{goal_digest, state_digest, control_mode, inputs?, menu}` sent to the policy.
pub fn build_payload(request: &SelectRequest<'_>) -> Value {
    let menu: Vec<Value> = request
        .menu
        .items()
        .iter()
        .map(|item| {
            json!({
                "sid": item.sid,
                "aid": item.aid,
                "name": item.name,
                "tags": item.tags,
            })
        })
        .collect();
    let mut payload = json!({
        "goal_digest": sha256_hex(request.goal_context),
        "state_digest": request.state_digest,
        "control_mode": request.control_mode,
        "menu": menu,
    });
    if let Ok(Value::Object(inputs)) = serde_json::from_str::<Value>(request.inputs_json)
        && !inputs.is_empty()
    {
        payload["inputs"] = Value::Object(inputs);
    }
    payload
}

fn classify(
    result: &CaptureResult,
    request: &SelectRequest<'_>,
) -> Result<SelectorOutput, PolicyFailure> {
    if result.error.is_some() {
        return Err(PolicyFailure::Spawn);
    }
    if result.timed_out {
        return Err(PolicyFailure::Timeout);
    }
    match result.exit_code {
        Some(0) => {}
        Some(code) => return Err(PolicyFailure::Exit(code.to_string())),
        None => return Err(PolicyFailure::Exit("signal".to_string())),
    }
    let text = result.output.trim();
    if text.is_empty() {
        return Err(PolicyFailure::Empty);
    }
    let selection = parse_selection(text);
    match &selection {
        Selection::Invalid => return Err(PolicyFailure::Parse),
        Selection::Pick { sid, .. } if request.menu.resolve(*sid).is_none() => {
            return Err(PolicyFailure::UnresolvedSid);
        }
        _ => {}
    }
    Ok(SelectorOutput {
        selection,
        raw: text.to_string(),
    })
}
