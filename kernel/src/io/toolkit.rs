//! In-process tool registry with the builtin tool set.

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::clock::{Clock, SharedClock};
use crate::core::ids::{AID_WILDCARD, Aid};
use crate::core::state::{Artifact, CLARIFY_SLOT, DsState, INITIAL_SLOT, SUMMARY_SLOT};
use crate::core::types::{CLARIFY_AID, Fence, GoalRule, NOOP_AID, ToolDesc};
use crate::io::tools::{GoalRegistry, ToolRegistry, ToolRunResult, ToolRunner};

/// Slot the clock tool writes to.
pub const CLOCK_SLOT: u8 = 3;

/// Slots the summary tool reads.
const SUMMARY_SOURCES: [u8; 2] = [INITIAL_SLOT, 1];

const PREVIEW_CHARS: usize = 80;

pub type ToolHandler = Box<dyn Fn(&Value, &mut DsState) -> ToolRunResult + Send + Sync>;

struct RegisteredTool {
    desc: ToolDesc,
    handler: ToolHandler,
}

/// Tools and goals keyed by identifier. Iteration is in AID order.
#[derive(Default)]
pub struct Toolkit {
    tools: BTreeMap<Aid, RegisteredTool>,
    goals: BTreeMap<String, GoalRule>,
}

impl Toolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtin tool set plus the `summarize` and `note` goals.
    pub fn builtin(clock: SharedClock) -> Self {
        Self::new()
            .with_tool(ToolDesc::new("fs.write_note", "write note", &["fs"]), write_note)
            .with_tool(
                ToolDesc::new("fs.read_file", "read file", &["fs"]).with_fence(Fence::InputFile {
                    input_key: "path".to_string(),
                }),
                read_file,
            )
            .with_tool(
                ToolDesc::new("report.summarize", "summarize artifacts", &["report"]),
                summarize,
            )
            .with_tool(
                ToolDesc::new("meta.clock", "read clock", &["meta"]).non_deterministic(),
                move |_: &Value, state: &mut DsState| read_clock(clock.as_ref(), state),
            )
            .with_tool(ToolDesc::new(CLARIFY_AID, "ask supervisor", &[]), clarify)
            .with_tool(ToolDesc::new(NOOP_AID, "do nothing", &[]), |_: &Value, _: &mut DsState| {
                ToolRunResult::ok(Value::Null)
            })
            .with_goal("summarize", GoalRule::All(vec![INITIAL_SLOT, SUMMARY_SLOT]))
            .with_goal("note", GoalRule::All(vec![INITIAL_SLOT]))
    }

    pub fn with_tool<F>(mut self, desc: ToolDesc, handler: F) -> Self
    where
        F: Fn(&Value, &mut DsState) -> ToolRunResult + Send + Sync + 'static,
    {
        self.register_tool(desc, handler);
        self
    }

    /// Register or replace a tool.
    pub fn register_tool<F>(&mut self, desc: ToolDesc, handler: F)
    where
        F: Fn(&Value, &mut DsState) -> ToolRunResult + Send + Sync + 'static,
    {
        self.tools.insert(
            desc.aid.clone(),
            RegisteredTool {
                desc,
                handler: Box::new(handler),
            },
        );
    }

    pub fn with_goal(mut self, goal_id: &str, rule: GoalRule) -> Self {
        self.goals.insert(goal_id.to_string(), rule);
        self
    }
}

impl ToolRegistry for Toolkit {
    fn query_by_tags(&self, tags: &[String]) -> Vec<ToolDesc> {
        let all = tags.iter().any(|t| t == AID_WILDCARD);
        self.tools
            .values()
            .filter(|tool| all || tool.desc.tags.iter().any(|t| tags.contains(t)))
            .map(|tool| tool.desc.clone())
            .collect()
    }

    fn get_tool(&self, aid: &Aid) -> Option<ToolDesc> {
        self.tools.get(aid).map(|tool| tool.desc.clone())
    }
}

impl GoalRegistry for Toolkit {
    fn is_goal_complete(&self, goal_id: &str, state: &DsState) -> bool {
        self.goals
            .get(goal_id)
            .is_some_and(|rule| rule.is_met(state))
    }
}

impl ToolRunner for Toolkit {
    fn run(&self, aid: &Aid, input: &Value, state: &mut DsState) -> ToolRunResult {
        match self.tools.get(aid) {
            Some(tool) => {
                debug!(aid = %aid, "running tool");
                (tool.handler)(input, state)
            }
            None => ToolRunResult::tool_error(format!("unknown tool {aid}")),
        }
    }
}

fn write_note(input: &Value, state: &mut DsState) -> ToolRunResult {
    let note = input.get("note").and_then(Value::as_str).unwrap_or("");
    state.put(INITIAL_SLOT, Artifact::new("note", "fs.write_note", note));
    ToolRunResult::ok(json!({"slot": INITIAL_SLOT, "bytes": note.len()}))
}

fn read_file(input: &Value, state: &mut DsState) -> ToolRunResult {
    let Some(path) = input.get("path").and_then(Value::as_str) else {
        return ToolRunResult::invalid_pick("input 'path' must be a string");
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let bytes = content.len();
            state.put(
                INITIAL_SLOT,
                Artifact::new("file", format!("fs.read_file:{path}"), content),
            );
            ToolRunResult::ok(json!({"slot": INITIAL_SLOT, "bytes": bytes}))
        }
        Err(err) => ToolRunResult::tool_error(format!("read {path}: {err}")),
    }
}

fn summarize(_: &Value, state: &mut DsState) -> ToolRunResult {
    let lines: Vec<String> = SUMMARY_SOURCES
        .iter()
        .filter_map(|slot| state.get(*slot).map(|artifact| (slot, artifact)))
        .map(|(slot, artifact)| {
            let first_line = artifact.content.lines().next().unwrap_or("");
            let preview: String = first_line.chars().take(PREVIEW_CHARS).collect();
            format!(
                "DS{slot} {} {} bytes: {preview}",
                artifact.artifact_type, artifact.size
            )
        })
        .collect();
    if lines.is_empty() {
        return ToolRunResult::tool_error("nothing to summarize");
    }
    let sources = lines.len();
    state.put(
        SUMMARY_SLOT,
        Artifact::new("summary", "report.summarize", lines.join("\n")),
    );
    ToolRunResult::ok(json!({"slot": SUMMARY_SLOT, "sources": sources}))
}

fn read_clock(clock: &dyn Clock, state: &mut DsState) -> ToolRunResult {
    let now_ms = clock.now_ms();
    let stamp = i64::try_from(now_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| now_ms.to_string());
    state.put(CLOCK_SLOT, Artifact::new("clock", "meta.clock", stamp));
    ToolRunResult::ok(json!({"slot": CLOCK_SLOT, "now_ms": now_ms}))
}

fn clarify(input: &Value, state: &mut DsState) -> ToolRunResult {
    let keys = input
        .as_object()
        .map(|map| map.keys().cloned().collect::<Vec<_>>().join(","))
        .unwrap_or_default();
    state.put(
        CLARIFY_SLOT,
        Artifact::new(
            "clarification",
            CLARIFY_AID,
            format!("clarification requested; inputs: [{keys}]"),
        ),
    );
    ToolRunResult::ok(json!({"slot": CLARIFY_SLOT}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::io::tools::ToolStatus;

    fn toolkit() -> Toolkit {
        Toolkit::builtin(ManualClock::new(1_700_000_000_000))
    }

    fn aids(tools: &[ToolDesc]) -> Vec<&str> {
        tools.iter().map(|t| t.aid.as_str()).collect()
    }

    #[test]
    fn query_uses_or_semantics_sorted_by_aid() {
        let kit = toolkit();
        let found = kit.query_by_tags(&["meta".to_string(), "fs".to_string()]);
        assert_eq!(aids(&found), vec!["fs.read_file", "fs.write_note", "meta.clock"]);
        assert!(kit.query_by_tags(&["nothing".to_string()]).is_empty());
    }

    #[test]
    fn wildcard_matches_every_tool() {
        let kit = toolkit();
        let found = kit.query_by_tags(&[AID_WILDCARD.to_string()]);
        assert_eq!(found.len(), 6);
        assert!(aids(&found).contains(&NOOP_AID));
    }

    #[test]
    fn read_file_rejects_missing_path_and_reports_io_errors() {
        let kit = toolkit();
        let mut state = DsState::new();
        let aid = Aid::new("fs.read_file");
        let result = kit.run(&aid, &json!({}), &mut state);
        assert_eq!(result.status, ToolStatus::InvalidPick);

        let result = kit.run(&aid, &json!({"path": "/definitely/not/here"}), &mut state);
        assert_eq!(result.status, ToolStatus::ToolError);
        assert!(state.is_empty());
    }

    #[test]
    fn note_then_summary_completes_summarize_goal() {
        let kit = toolkit();
        let mut state = DsState::new();
        assert!(!kit.is_goal_complete("summarize", &state));
        kit.run(&Aid::new("fs.write_note"), &json!({"note": "hello\nworld"}), &mut state);
        assert!(kit.is_goal_complete("note", &state));
        let result = kit.run(&Aid::new("report.summarize"), &Value::Null, &mut state);
        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(
            state.get(SUMMARY_SLOT).map(|a| a.content.as_str()),
            Some("DS0 note 11 bytes: hello")
        );
        assert!(kit.is_goal_complete("summarize", &state));
        assert!(!kit.is_goal_complete("unknown", &state));
    }

    #[test]
    fn summarize_without_sources_is_tool_error() {
        let mut state = DsState::new();
        let result = toolkit().run(&Aid::new("report.summarize"), &Value::Null, &mut state);
        assert_eq!(result.status, ToolStatus::ToolError);
    }

    #[test]
    fn clock_tool_is_non_deterministic_and_stamps_utc() {
        let kit = toolkit();
        let desc = kit.get_tool(&Aid::new("meta.clock")).expect("clock tool");
        assert!(!desc.deterministic);
        let mut state = DsState::new();
        kit.run(&desc.aid, &Value::Null, &mut state);
        assert_eq!(
            state.get(CLOCK_SLOT).map(|a| a.content.as_str()),
            Some("2023-11-14T22:13:20.000Z")
        );
    }

    #[test]
    fn unknown_tool_is_tool_error() {
        let mut state = DsState::new();
        let result = toolkit().run(&Aid::new("nope"), &Value::Null, &mut state);
        assert_eq!(result.status, ToolStatus::ToolError);
    }
}
