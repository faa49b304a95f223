//! Goal context handed to selector backends, and per-step tag derivation.
//!
//! Wire form: `GOAL:<id>|STAGE:<stage>|FLAGS:DS0=1;DS1=0;...|TAGS:a,b`.
//! Backends read only the sections they understand.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::state::{Artifact, DsState, INITIAL_SLOT, STAGE_SLOT, SUMMARY_SLOT, TRACKED_SLOTS};

/// Tag added while the initial slot is filled but no summary exists yet.
pub const REPORT_TAG: &str = "report";

/// Artifact type that marks the bootstrap stage slot.
pub const STAGE_ARTIFACT: &str = "stage";

/// Goals with this prefix follow the write/compile/load/run ladder.
pub const BOOTSTRAP_PREFIX: &str = "bootstrap.";

/// Stage in which exactly one `runtime` tool may run.
pub const STAGE_LOADED: &str = "LOADED";

/// Final bootstrap stage; nothing is picked once it is reached.
pub const STAGE_RAN: &str = "RAN";

pub const RUNTIME_TAG: &str = "runtime";

/// Provenance of stage markers written by the kernel itself.
const KERNEL_PROVENANCE: &str = "kernel";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalContext {
    pub goal_id: String,
    pub stage: String,
    pub flags: BTreeMap<u8, bool>,
    pub tags: Vec<String>,
}

impl GoalContext {
    pub fn from_state(goal_id: &str, state: &DsState, tags: &[String]) -> Self {
        let flags = (0..TRACKED_SLOTS)
            .map(|slot| (slot, state.is_filled(slot)))
            .collect();
        Self {
            goal_id: goal_id.to_string(),
            stage: stage_from_state(state),
            flags,
            tags: tags.to_vec(),
        }
    }

    pub fn render(&self) -> String {
        let flags = self
            .flags
            .iter()
            .map(|(slot, on)| format!("DS{slot}={}", u8::from(*on)))
            .collect::<Vec<_>>()
            .join(";");
        format!(
            "GOAL:{}|STAGE:{}|FLAGS:{}|TAGS:{}",
            self.goal_id,
            self.stage,
            flags,
            self.tags.join(",")
        )
    }

    /// Lenient parse; unknown or malformed sections are skipped.
    pub fn parse(text: &str) -> Self {
        let mut ctx = GoalContext::default();
        for section in text.split('|') {
            let Some((key, value)) = section.split_once(':') else {
                continue;
            };
            match key {
                "GOAL" => ctx.goal_id = value.to_string(),
                "STAGE" => ctx.stage = value.to_string(),
                "FLAGS" => ctx.flags = parse_flags(value),
                "TAGS" => {
                    ctx.tags = value
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }
        ctx
    }

    pub fn flag(&self, slot: u8) -> bool {
        self.flags.get(&slot).copied().unwrap_or(false)
    }
}

fn parse_flags(value: &str) -> BTreeMap<u8, bool> {
    value
        .split(';')
        .filter_map(|entry| {
            let (name, bit) = entry.split_once('=')?;
            let slot = name.strip_prefix("DS")?.parse::<u8>().ok()?;
            match bit {
                "1" => Some((slot, true)),
                "0" => Some((slot, false)),
                _ => None,
            }
        })
        .collect()
}

/// Bootstrap stage recorded in the stage slot, or `""` when unset.
pub fn stage_from_state(state: &DsState) -> String {
    state
        .get(STAGE_SLOT)
        .filter(|a| a.artifact_type == STAGE_ARTIFACT)
        .map(|a| a.content.clone())
        .unwrap_or_default()
}

/// Stage to record once a tool tagged `tool_tags` commits, if any.
///
/// A committed `runtime` tool in stage `LOADED` of a bootstrap goal moves the
/// run to `RAN`, so at most one runtime tool ever runs.
pub fn stage_after_tool(
    goal_id: &str,
    state: &DsState,
    tool_tags: &[String],
) -> Option<&'static str> {
    let runtime = tool_tags.iter().any(|t| t == RUNTIME_TAG);
    let loaded = stage_from_state(state) == STAGE_LOADED;
    (runtime && loaded && goal_id.starts_with(BOOTSTRAP_PREFIX)).then_some(STAGE_RAN)
}

/// Stage marker artifact for `stage`.
pub fn stage_artifact(stage: &str) -> Artifact {
    Artifact::new(STAGE_ARTIFACT, KERNEL_PROVENANCE, stage)
}

/// Candidate tags for this step: request tags plus state-derived tags, sorted
/// and deduplicated.
pub fn derive_tags(candidate_tags: &[String], state: &DsState) -> Vec<String> {
    let mut tags: BTreeSet<String> = candidate_tags.iter().cloned().collect();
    if state.is_filled(INITIAL_SLOT) && !state.is_filled(SUMMARY_SLOT) {
        tags.insert(REPORT_TAG.to_string());
    }
    tags.into_iter().collect()
}
