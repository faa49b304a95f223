//! Shared deterministic types for the kernel.
//!
//! These types define stable contracts between core components and the audit
//! log. Serialized field names are part of the log format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::blend::ControlMode;
use crate::core::ids::Aid;
use crate::core::state::DsState;

/// AID of the reserved do-nothing tool. Always offered last when registered.
pub const NOOP_AID: &str = "noop";

/// AID of the fixed clarification tool run on ASK_SUP.
pub const CLARIFY_AID: &str = "ask_sup.clarify";

/// Work submitted for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub goal_id: String,
    #[serde(default)]
    pub candidate_tags: Vec<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub control_mode: ControlMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Characters that delimit goal-context sections and tag lists.
const CONTEXT_DELIMITERS: [char; 2] = ['|', ','];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request goal_id must be non-empty")]
    EmptyGoal,
    #[error("request goal_id {0:?} must not contain '|'")]
    GoalDelimiter(String),
    #[error("candidate tag {0:?} must not contain '|' or ','")]
    TagDelimiter(String),
}

impl RunRequest {
    /// Reject goal ids and tags that would be split when the goal context is
    /// rendered.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.goal_id.trim().is_empty() {
            return Err(RequestError::EmptyGoal);
        }
        if self.goal_id.contains('|') {
            return Err(RequestError::GoalDelimiter(self.goal_id.clone()));
        }
        if let Some(tag) = self
            .candidate_tags
            .iter()
            .find(|tag| tag.contains(CONTEXT_DELIMITERS))
        {
            return Err(RequestError::TagDelimiter(tag.clone()));
        }
        Ok(())
    }
}

/// Identity stamped on every audit record of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: String,
    pub request_id: Option<String>,
    pub profile_id: String,
    pub spec_version: String,
}

/// Hard bounds on the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_steps: u32,
    pub max_invalid_picks: u32,
}

/// Value that must be identical between the live run and a replay before a
/// deterministic tool may be re-executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fence {
    /// SHA-256 of the file named by `inputs[input_key]`.
    InputFile { input_key: String },
    /// Presence signature of configured GPU device nodes.
    GpuPresence,
}

impl Fence {
    /// Stable key used in the `fences` object of `tool_ok` payloads.
    pub fn key(&self) -> String {
        match self {
            Fence::InputFile { input_key } => format!("input_file:{input_key}"),
            Fence::GpuPresence => "gpu_presence".to_string(),
        }
    }
}

/// Static description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDesc {
    pub aid: Aid,
    pub name: String,
    pub tags: Vec<String>,
    /// False for tools whose effect cannot be reproduced (clock reads, network).
    pub deterministic: bool,
    #[serde(default)]
    pub fences: Vec<Fence>,
}

impl ToolDesc {
    pub fn new(aid: &str, name: &str, tags: &[&str]) -> Self {
        Self {
            aid: Aid::new(aid),
            name: name.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            deterministic: true,
            fences: Vec::new(),
        }
    }

    pub fn non_deterministic(mut self) -> Self {
        self.deterministic = false;
        self
    }

    pub fn with_fence(mut self, fence: Fence) -> Self {
        self.fences.push(fence);
        self
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NoopDone,
    AskSupDone,
    GoalDone,
    ToolError { aid: String, error: String },
    BreakerTripped { reason: TripReason },
}

impl RunOutcome {
    /// Runs that end on NOOP, ASK_SUP or goal completion are successful.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RunOutcome::NoopDone | RunOutcome::AskSupDone | RunOutcome::GoalDone
        )
    }
}

/// Why the run breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    LoopGuard,
    MaxInvalidPicks,
    MaxSteps,
    ToolBreaker,
}

impl TripReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TripReason::LoopGuard => "loop_guard",
            TripReason::MaxInvalidPicks => "max_invalid_picks",
            TripReason::MaxSteps => "max_steps",
            TripReason::ToolBreaker => "tool_breaker",
        }
    }
}

/// Completion rule for a goal over slot occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "slots", rename_all = "snake_case")]
pub enum GoalRule {
    All(Vec<u8>),
    Any(Vec<u8>),
}

impl GoalRule {
    pub fn is_met(&self, state: &DsState) -> bool {
        match self {
            GoalRule::All(slots) => slots.iter().all(|slot| state.is_filled(*slot)),
            GoalRule::Any(slots) => slots.iter().any(|slot| state.is_filled(*slot)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_defaults_optional_fields() {
        let request: RunRequest = serde_json::from_str(r#"{"goal_id":"note"}"#).expect("parse");
        assert!(request.candidate_tags.is_empty());
        assert!(request.inputs.is_empty());
        assert_eq!(request.control_mode, ControlMode::FallbackOnly);
        assert_eq!(request.request_id, None);
    }

    #[test]
    fn fence_keys_are_stable() {
        let fence = Fence::InputFile {
            input_key: "path".to_string(),
        };
        assert_eq!(fence.key(), "input_file:path");
        assert_eq!(Fence::GpuPresence.key(), "gpu_presence");
    }

    #[test]
    fn goal_rules_check_slot_occupancy() {
        use crate::core::state::Artifact;

        let mut state = DsState::new();
        state.put(0, Artifact::new("note", "t", "x"));
        assert!(GoalRule::All(vec![0]).is_met(&state));
        assert!(!GoalRule::All(vec![0, 2]).is_met(&state));
        assert!(GoalRule::Any(vec![0, 2]).is_met(&state));
        assert!(!GoalRule::Any(vec![]).is_met(&state));
    }

    #[test]
    fn outcome_success_classification() {
        assert!(RunOutcome::GoalDone.is_success());
        assert!(
            !RunOutcome::BreakerTripped {
                reason: TripReason::MaxSteps
            }
            .is_success()
        );
    }
}
