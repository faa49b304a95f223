//! Deterministic priority-ladder backend. Also the fallback for every other
//! backend, so it must never block and never emit INVALID.

use crate::core::context::{
    BOOTSTRAP_PREFIX, GoalContext, REPORT_TAG, RUNTIME_TAG, STAGE_LOADED, STAGE_RAN,
};
use crate::core::menu::{Menu, MenuItem};
use crate::core::protocol::Selection;
use crate::core::state::{INITIAL_SLOT, SUMMARY_SLOT};
use crate::selector::{SelectRequest, Selector, SelectorOutput};

const TAG_PRIORITY: [&str; 7] = [REPORT_TAG, "error", "gpu", "fs", "shell", "net", "meta"];

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSelector;

impl HeuristicSelector {
    pub fn decide(menu: &Menu, goal_context: &str) -> Selection {
        let ctx = GoalContext::parse(goal_context);
        if ctx.goal_id.starts_with(BOOTSTRAP_PREFIX) {
            if ctx.stage == STAGE_RAN {
                return Selection::Noop;
            }
            let stage_tool = bootstrap_tag(&ctx.stage).and_then(|tag| lowest_with_tag(menu, tag));
            if let Some(item) = stage_tool {
                return Selection::pick(item.sid);
            }
        }
        for tag in TAG_PRIORITY {
            if tag == REPORT_TAG && !(ctx.flag(INITIAL_SLOT) && !ctx.flag(SUMMARY_SLOT)) {
                continue;
            }
            if let Some(item) = lowest_with_tag(menu, tag) {
                return Selection::pick(item.sid);
            }
        }
        Selection::Noop
    }
}

impl Selector for HeuristicSelector {
    fn select(&mut self, request: &SelectRequest<'_>) -> SelectorOutput {
        SelectorOutput::canonical(Self::decide(request.menu, request.goal_context))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

fn bootstrap_tag(stage: &str) -> Option<&'static str> {
    match stage {
        "" => Some("write"),
        "WROTE" => Some("compile"),
        "COMPILED" => Some("load"),
        STAGE_LOADED => Some(RUNTIME_TAG),
        _ => None,
    }
}

fn lowest_with_tag<'m>(menu: &'m Menu, tag: &str) -> Option<&'m MenuItem> {
    menu.items()
        .iter()
        .filter(|item| !item.is_noop() && item.has_tag(tag))
        .min_by_key(|item| item.sid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{STAGE_ARTIFACT, stage_after_tool, stage_artifact};
    use crate::core::ids::Sid;
    use crate::core::state::{Artifact, DsState, STAGE_SLOT};
    use crate::core::types::{NOOP_AID, ToolDesc};

    /// One tag per tool; an empty tag means an untagged tool.
    fn menu(tools: &[(&str, &str)]) -> Menu {
        let descs: Vec<ToolDesc> = tools
            .iter()
            .map(|(aid, tag)| {
                let tags: Vec<&str> = Some(*tag).filter(|t| !t.is_empty()).into_iter().collect();
                ToolDesc::new(aid, aid, &tags)
            })
            .collect();
        Menu::build(&descs)
    }

    fn context(goal: &str, state: &DsState) -> String {
        GoalContext::from_state(goal, state, &[]).render()
    }

    #[test]
    fn empty_menu_yields_noop() {
        let out = HeuristicSelector.select(&SelectRequest {
            menu: &Menu::default(),
            goal_context: &context("g", &DsState::new()),
            state_digest: "",
            control_mode: Default::default(),
            inputs_json: "{}",
        });
        assert_eq!(out.selection, Selection::Noop);
        assert_eq!(out.raw, "<NOOP><END>");
    }

    #[test]
    fn report_only_when_initial_filled_and_summary_missing() {
        let m = menu(&[("a.fs", "fs"), ("b.report", "report")]);
        let mut state = DsState::new();
        assert_eq!(
            HeuristicSelector::decide(&m, &context("g", &state)),
            Selection::pick(Sid::new(1))
        );
        state.put(INITIAL_SLOT, Artifact::new("note", "t", "x"));
        assert_eq!(
            HeuristicSelector::decide(&m, &context("g", &state)),
            Selection::pick(Sid::new(2))
        );
        state.put(SUMMARY_SLOT, Artifact::new("summary", "t", "x"));
        assert_eq!(
            HeuristicSelector::decide(&m, &context("g", &state)),
            Selection::pick(Sid::new(1))
        );
    }

    #[test]
    fn priority_order_beats_menu_order() {
        let m = menu(&[("a.meta", "meta"), ("b.net", "net"), ("c.gpu", "gpu")]);
        assert_eq!(
            HeuristicSelector::decide(&m, &context("g", &DsState::new())),
            Selection::pick(Sid::new(3))
        );
    }

    #[test]
    fn unknown_tags_and_noop_item_fall_through_to_noop() {
        let m = menu(&[("a.misc", "misc"), (NOOP_AID, "")]);
        assert_eq!(
            HeuristicSelector::decide(&m, &context("g", &DsState::new())),
            Selection::Noop
        );
    }

    #[test]
    fn bootstrap_ladder_follows_stage() {
        let m = menu(&[
            ("a.write", "write"),
            ("b.compile", "compile"),
            ("c.load", "load"),
            ("d.run", "runtime"),
        ]);
        let mut state = DsState::new();
        let goal = "bootstrap.demo";
        let expected = [("", 1), ("WROTE", 2), ("COMPILED", 3), ("LOADED", 4)];
        for (stage, sid) in expected {
            if !stage.is_empty() {
                state.put(STAGE_SLOT, Artifact::new(STAGE_ARTIFACT, "t", stage));
            }
            assert_eq!(
                HeuristicSelector::decide(&m, &context(goal, &state)),
                Selection::pick(Sid::new(sid)),
                "stage {stage:?}"
            );
        }
        state.put(STAGE_SLOT, Artifact::new(STAGE_ARTIFACT, "t", STAGE_RAN));
        assert_eq!(
            HeuristicSelector::decide(&m, &context(goal, &state)),
            Selection::Noop
        );
    }

    #[test]
    fn bootstrap_stops_after_one_runtime_tool() {
        let m = menu(&[("a.fs", "fs"), ("d.run", "runtime"), ("e.run", "runtime")]);
        let goal = "bootstrap.demo";
        let mut state = DsState::new();
        state.put(STAGE_SLOT, stage_artifact(STAGE_LOADED));
        assert_eq!(
            HeuristicSelector::decide(&m, &context(goal, &state)),
            Selection::pick(Sid::new(2))
        );

        // What the step loop records when that runtime tool commits.
        let runtime = vec![RUNTIME_TAG.to_string()];
        let next = stage_after_tool(goal, &state, &runtime).expect("stage advances");
        state.put(STAGE_SLOT, stage_artifact(next));
        assert_eq!(
            HeuristicSelector::decide(&m, &context(goal, &state)),
            Selection::Noop
        );
    }

    #[test]
    fn bootstrap_falls_through_when_stage_tool_missing() {
        let m = menu(&[("a.fs", "fs")]);
        assert_eq!(
            HeuristicSelector::decide(&m, &context("bootstrap.demo", &DsState::new())),
            Selection::pick(Sid::new(1))
        );
    }
}
