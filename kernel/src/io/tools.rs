//! Collaborator traits for tool lookup, goal checks and tool execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::Aid;
use crate::core::state::DsState;
use crate::core::types::ToolDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    /// Tool failed; the run ends.
    ToolError,
    /// Tool rejected its input; counted like an invalid selection.
    InvalidPick,
    /// Tool demands the run stop.
    BreakerTrip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRunResult {
    pub status: ToolStatus,
    pub output: Value,
    pub error: Option<String>,
}

impl ToolRunResult {
    pub fn ok(output: Value) -> Self {
        Self {
            status: ToolStatus::Ok,
            output,
            error: None,
        }
    }

    pub fn failed(status: ToolStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            output: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn tool_error(error: impl Into<String>) -> Self {
        Self::failed(ToolStatus::ToolError, error)
    }

    pub fn invalid_pick(error: impl Into<String>) -> Self {
        Self::failed(ToolStatus::InvalidPick, error)
    }
}

pub trait ToolRegistry {
    /// Tools carrying any of `tags`, sorted by AID. A `*` entry matches all.
    fn query_by_tags(&self, tags: &[String]) -> Vec<ToolDesc>;

    fn get_tool(&self, aid: &Aid) -> Option<ToolDesc>;
}

pub trait GoalRegistry {
    fn is_goal_complete(&self, goal_id: &str, state: &DsState) -> bool;
}

pub trait ToolRunner {
    /// Run `aid` against a transaction-scoped state. Writes are discarded
    /// unless the caller commits.
    fn run(&self, aid: &Aid, input: &Value, state: &mut DsState) -> ToolRunResult;
}
