//! The per-step state machine shared by live runs and strict replay.
//!
//! A [`RunDriver`] decides where events go (the audit log, or a comparison
//! against a recorded log) and how non-reproducible inputs are obtained.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::blend::blend;
use crate::core::canonical::canonical_string;
use crate::core::context::{GoalContext, derive_tags, stage_after_tool, stage_artifact};
use crate::core::ids::{Aid, Sid};
use crate::core::loop_guard::{LOOP_GUARD_LIMIT, LoopGuard};
use crate::core::menu::Menu;
use crate::core::merge::safe_merge;
use crate::core::protocol::Selection;
use crate::core::state::{DsState, STAGE_SLOT};
use crate::core::tx::{Patch, Tx};
use crate::core::types::{
    Budget, CLARIFY_AID, NOOP_AID, RunOutcome, RunRequest, ToolDesc, TripReason,
};
use crate::io::audit::events;
use crate::io::tools::{GoalRegistry, ToolRegistry, ToolRunResult, ToolRunner, ToolStatus};
use crate::run::Kernel;
use crate::selector::{SelectRequest, Selector, SelectorBackend, SelectorOutput, Selectors};

/// Policy output plus the backend diagnostics logged next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub output: SelectorOutput,
    pub diagnostics: Value,
}

/// One tool invocation as seen by a driver.
#[derive(Debug, Clone, Copy)]
pub struct ToolCall<'a> {
    pub desc: &'a ToolDesc,
    pub input: &'a Value,
    /// Fence values computed just before execution.
    pub fences: &'a BTreeMap<String, String>,
    /// Bootstrap stage written in the same transaction when the tool commits.
    pub stage_after: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub result: ToolRunResult,
    /// Present exactly when the transaction committed.
    pub patch: Option<Patch>,
}

pub trait RunDriver {
    fn emit(&mut self, step: u32, event: &str, payload: Value) -> Result<()>;

    fn policy(
        &mut self,
        policy: &mut SelectorBackend,
        request: &SelectRequest<'_>,
    ) -> Result<PolicyDecision> {
        Ok(consult_policy(policy, request))
    }

    fn execute<T: ToolRunner>(
        &mut self,
        tools: &T,
        call: &ToolCall<'_>,
        state: &mut DsState,
    ) -> Result<ToolExecution> {
        Ok(execute_in_tx(tools, call, state))
    }
}

/// Ask the policy backend and capture its diagnostics afterwards.
pub fn consult_policy(policy: &mut SelectorBackend, request: &SelectRequest<'_>) -> PolicyDecision {
    let output = policy.select(request);
    PolicyDecision {
        output,
        diagnostics: policy.diagnostics(),
    }
}

/// Run the called tool in a fresh transaction, committing only on `Ok`.
pub fn execute_in_tx<T: ToolRunner + ?Sized>(
    tools: &T,
    call: &ToolCall<'_>,
    state: &mut DsState,
) -> ToolExecution {
    let aid = &call.desc.aid;
    let mut tx = Tx::begin(state);
    let result = tools.run(aid, call.input, tx.state_mut());
    if result.status != ToolStatus::Ok {
        tx.rollback();
        return ToolExecution {
            result,
            patch: None,
        };
    }
    if let Some(stage) = call.stage_after {
        debug!(aid = %aid, stage, "bootstrap stage advanced");
        tx.state_mut().put(STAGE_SLOT, stage_artifact(stage));
    }
    match tx.commit(state) {
        Ok(patch) => ToolExecution {
            result,
            patch: Some(patch),
        },
        Err(err) => {
            warn!(aid = %aid, err = %err, "tool commit rejected");
            ToolExecution {
                result: ToolRunResult::tool_error(format!("commit: {err}")),
                patch: None,
            }
        }
    }
}

/// Registry tools for `tags`, with the NOOP tool appended when registered.
pub fn build_menu<R: ToolRegistry + ?Sized>(registry: &R, tags: &[String]) -> Menu {
    let mut tools = registry.query_by_tags(tags);
    if !tools.iter().any(|t| t.aid.as_str() == NOOP_AID)
        && let Some(noop) = registry.get_tool(&Aid::new(NOOP_AID))
    {
        tools.push(noop);
    }
    Menu::build(&tools)
}

/// Audit event that ends a run with `outcome`.
pub fn terminal_event(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::NoopDone => events::NOOP,
        RunOutcome::AskSupDone => events::ASK_SUP,
        RunOutcome::GoalDone => events::GOAL_DONE,
        RunOutcome::ToolError { .. } => events::TOOL_ERROR,
        RunOutcome::BreakerTripped { .. } => events::BREAKER_TRIPPED,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Drive {
    pub outcome: RunOutcome,
    pub steps: u32,
    pub state: DsState,
}

/// Drive a whole run: `run_start`, steps until a terminal event or budget
/// exhaustion, then `run_end`.
#[instrument(skip_all, fields(goal_id = %request.goal_id, mode = %request.control_mode))]
pub fn drive<T, D>(
    kernel: &Kernel<'_, T>,
    selectors: &mut Selectors,
    request: &RunRequest,
    driver: &mut D,
) -> Result<Drive>
where
    T: ToolRegistry + GoalRegistry + ToolRunner,
    D: RunDriver,
{
    let budget = kernel.config().run_budget();
    driver.emit(0, events::RUN_START, run_start_payload(request, &budget, selectors))?;

    let mut run = StepLoop {
        kernel,
        request,
        driver,
        budget,
        inputs_json: canonical_string(&Value::Object(request.inputs.clone())),
        state: DsState::new(),
        guard: LoopGuard::new(LOOP_GUARD_LIMIT),
        invalid_picks: 0,
    };

    let mut steps = 0;
    let mut outcome = None;
    for step in 1..=budget.max_steps {
        steps = step;
        if let Some(done) = run.step(step, selectors)? {
            outcome = Some(done);
            break;
        }
    }
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => run.trip(steps, TripReason::MaxSteps, None)?,
    };

    let mut end = serde_json::to_value(&outcome)?;
    end["steps"] = json!(steps);
    end["state_digest"] = json!(run.state.digest());
    run.driver.emit(steps, events::RUN_END, end)?;
    info!(steps, outcome = terminal_event(&outcome), "run finished");

    Ok(Drive {
        outcome,
        steps,
        state: run.state,
    })
}

fn run_start_payload(request: &RunRequest, budget: &Budget, selectors: &Selectors) -> Value {
    json!({
        "goal_id": request.goal_id,
        "candidate_tags": request.candidate_tags,
        "inputs": request.inputs,
        "control_mode": request.control_mode,
        "request_id": request.request_id,
        "budget": budget,
        "fallback_backend": selectors.fallback.name(),
        "policy_backend": selectors.policy.name(),
        "policy_deterministic": selectors.policy.is_deterministic(),
    })
}

enum ToolFlow {
    Committed,
    Rejected(String),
    Ended(RunOutcome),
}

struct StepLoop<'a, 'k, T, D> {
    kernel: &'a Kernel<'k, T>,
    request: &'a RunRequest,
    driver: &'a mut D,
    budget: Budget,
    inputs_json: String,
    state: DsState,
    guard: LoopGuard,
    invalid_picks: u32,
}

impl<T, D> StepLoop<'_, '_, T, D>
where
    T: ToolRegistry + GoalRegistry + ToolRunner,
    D: RunDriver,
{
    #[instrument(skip(self, selectors))]
    fn step(&mut self, step: u32, selectors: &mut Selectors) -> Result<Option<RunOutcome>> {
        let tags = derive_tags(&self.request.candidate_tags, &self.state);
        let menu = build_menu(self.kernel.tools(), &tags);
        let menu_fast = menu.fast_digest();
        let state_digest = self.state.digest();
        let state_fast = self.state.fast_digest();
        self.driver.emit(
            step,
            events::MENU_BUILT,
            json!({
                "tags": tags,
                "items": menu.items(),
                "menu_digest": menu.digest(),
                "menu_fast_digest": menu_fast,
                "state_digest": state_digest,
                "state_fast_digest": state_fast,
            }),
        )?;

        if self.guard.observe(&menu_fast, &state_fast) {
            warn!(step, "loop guard tripped");
            return self.trip(step, TripReason::LoopGuard, None).map(Some);
        }

        let goal_context =
            GoalContext::from_state(&self.request.goal_id, &self.state, &tags).render();
        let mode = self.request.control_mode;
        let inputs_json = self.inputs_json.clone();
        let select = SelectRequest {
            menu: &menu,
            goal_context: &goal_context,
            state_digest: &state_digest,
            control_mode: mode,
            inputs_json: &inputs_json,
        };
        let fallback = selectors.fallback.select(&select);
        let policy = self.driver.policy(&mut selectors.policy, &select)?;
        let (chosen, source) = blend(mode, &fallback.selection, &policy.output.selection);
        let chosen = chosen.clone();
        debug!(chosen = chosen.kind_str(), ?source, "selection blended");
        self.driver.emit(
            step,
            events::SELECTOR_CHOSEN,
            json!({
                "control_mode": mode,
                "fallback": {
                    "backend": selectors.fallback.name(),
                    "selection": fallback.selection,
                    "raw": fallback.raw,
                },
                "policy": {
                    "backend": selectors.policy.name(),
                    "deterministic": selectors.policy.is_deterministic(),
                    "selection": policy.output.selection,
                    "raw": policy.output.raw,
                    "diagnostics": policy.diagnostics,
                },
                "chosen": chosen,
                "source": source,
            }),
        )?;

        match chosen {
            Selection::Invalid => self.invalid(step, "unparseable", None),
            Selection::Noop => {
                self.driver.emit(step, events::NOOP, json!({}))?;
                Ok(Some(RunOutcome::NoopDone))
            }
            Selection::AskSup => self.ask_sup(step),
            Selection::Pick { sid, input_patch } => {
                let Some(item) = menu.resolve(sid) else {
                    return self.invalid(step, "unresolved_sid", Some(sid.to_string()));
                };
                let Some(desc) = self.kernel.tools().get_tool(&item.aid) else {
                    return self.invalid(step, "unregistered_tool", Some(item.aid.to_string()));
                };
                let merge = safe_merge(
                    &self.request.inputs,
                    input_patch.as_deref(),
                    &self.kernel.config().merge.blocked_prefixes,
                );
                if !merge.dropped_keys.is_empty() {
                    debug!(dropped = ?merge.dropped_keys, "blocked input keys dropped");
                }
                let input = Value::Object(merge.merged);
                match self.run_tool(step, Some(sid), &desc, input, merge.dropped_keys)? {
                    ToolFlow::Committed => self.check_goal(step),
                    ToolFlow::Rejected(error) => self.invalid(step, "tool_rejected", Some(error)),
                    ToolFlow::Ended(outcome) => Ok(Some(outcome)),
                }
            }
        }
    }

    fn ask_sup(&mut self, step: u32) -> Result<Option<RunOutcome>> {
        let clarify = Aid::new(CLARIFY_AID);
        let desc = self
            .kernel
            .tools()
            .get_tool(&clarify)
            .unwrap_or_else(|| ToolDesc::new(CLARIFY_AID, CLARIFY_AID, &[]));
        let input = Value::Object(self.request.inputs.clone());
        match self.run_tool(step, None, &desc, input, Vec::new())? {
            ToolFlow::Committed => {
                self.driver.emit(step, events::ASK_SUP, json!({}))?;
                Ok(Some(RunOutcome::AskSupDone))
            }
            ToolFlow::Rejected(error) => self.invalid(step, "tool_rejected", Some(error)),
            ToolFlow::Ended(outcome) => Ok(Some(outcome)),
        }
    }

    fn run_tool(
        &mut self,
        step: u32,
        sid: Option<Sid>,
        desc: &ToolDesc,
        input: Value,
        dropped_keys: Vec<String>,
    ) -> Result<ToolFlow> {
        let fences = self.kernel.fences().compute(&desc.fences, &input);
        let before = self.state.digest();
        let call = ToolCall {
            desc,
            input: &input,
            fences: &fences,
            stage_after: stage_after_tool(&self.request.goal_id, &self.state, &desc.tags),
        };
        let exec = self.driver.execute(self.kernel.tools(), &call, &mut self.state)?;
        match exec.result.status {
            ToolStatus::Ok => {
                self.driver.emit(
                    step,
                    events::TOOL_OK,
                    json!({
                        "aid": desc.aid,
                        "sid": sid,
                        "input": input,
                        "dropped_keys": dropped_keys,
                        "output": exec.result.output,
                        "patch": exec.patch.unwrap_or_default(),
                        "state_digest_before": before,
                        "state_digest_after": self.state.digest(),
                        "deterministic": desc.deterministic,
                        "fences": fences,
                    }),
                )?;
                Ok(ToolFlow::Committed)
            }
            ToolStatus::ToolError => {
                let error = exec.result.error.unwrap_or_default();
                self.driver.emit(
                    step,
                    events::TOOL_ERROR,
                    json!({
                        "aid": desc.aid,
                        "sid": sid,
                        "input": input,
                        "error": error,
                        "output": exec.result.output,
                        "fences": fences,
                    }),
                )?;
                Ok(ToolFlow::Ended(RunOutcome::ToolError {
                    aid: desc.aid.to_string(),
                    error,
                }))
            }
            ToolStatus::InvalidPick => {
                Ok(ToolFlow::Rejected(exec.result.error.unwrap_or_default()))
            }
            ToolStatus::BreakerTrip => self
                .trip(step, TripReason::ToolBreaker, exec.result.error)
                .map(ToolFlow::Ended),
        }
    }

    fn check_goal(&mut self, step: u32) -> Result<Option<RunOutcome>> {
        let goal_id = &self.request.goal_id;
        if !self.kernel.tools().is_goal_complete(goal_id, &self.state) {
            return Ok(None);
        }
        self.driver
            .emit(step, events::GOAL_DONE, json!({ "goal_id": goal_id }))?;
        Ok(Some(RunOutcome::GoalDone))
    }

    fn invalid(
        &mut self,
        step: u32,
        reason: &str,
        detail: Option<String>,
    ) -> Result<Option<RunOutcome>> {
        self.invalid_picks += 1;
        debug!(step, reason, count = self.invalid_picks, "invalid pick");
        self.driver.emit(
            step,
            events::INVALID_PICK,
            json!({
                "reason": reason,
                "detail": detail,
                "count": self.invalid_picks,
            }),
        )?;
        if self.invalid_picks > self.budget.max_invalid_picks {
            return self.trip(step, TripReason::MaxInvalidPicks, None).map(Some);
        }
        Ok(None)
    }

    fn trip(
        &mut self,
        step: u32,
        reason: TripReason,
        detail: Option<String>,
    ) -> Result<RunOutcome> {
        warn!(step, reason = reason.as_str(), "run breaker tripped");
        self.driver.emit(
            step,
            events::BREAKER_TRIPPED,
            json!({
                "reason": reason,
                "detail": detail,
                "invalid_picks": self.invalid_picks,
            }),
        )?;
        Ok(RunOutcome::BreakerTripped { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{STAGE_LOADED, STAGE_RAN, stage_from_state};
    use crate::core::state::Artifact;
    use crate::io::toolkit::Toolkit;

    fn kit() -> Toolkit {
        Toolkit::new()
            .with_tool(ToolDesc::new(NOOP_AID, "do nothing", &[]), |_: &Value, _: &mut DsState| {
                ToolRunResult::ok(Value::Null)
            })
            .with_tool(ToolDesc::new("fs.put", "put", &["fs"]), |_: &Value, state: &mut DsState| {
                state.put(1, Artifact::new("note", "fs.put", "x"));
                ToolRunResult::ok(Value::Null)
            })
            .with_tool(ToolDesc::new("fs.bad", "bad", &["fs"]), |_: &Value, state: &mut DsState| {
                state.put(1, Artifact::new("note", "fs.bad", "x"));
                ToolRunResult::invalid_pick("no")
            })
            .with_tool(ToolDesc::new("fs.wide", "wide", &["fs"]), |_: &Value, state: &mut DsState| {
                state.put(9, Artifact::new("note", "fs.wide", "x"));
                ToolRunResult::ok(Value::Null)
            })
    }

    fn run(
        kit: &Toolkit,
        aid: &str,
        stage_after: Option<&str>,
        state: &mut DsState,
    ) -> ToolExecution {
        let desc = kit.get_tool(&Aid::new(aid)).expect("registered");
        let call = ToolCall {
            desc: &desc,
            input: &Value::Null,
            fences: &BTreeMap::new(),
            stage_after,
        };
        execute_in_tx(kit, &call, state)
    }

    #[test]
    fn menu_appends_registered_noop_last() {
        let menu = build_menu(&kit(), &["fs".to_string()]);
        let aids: Vec<&str> = menu.items().iter().map(|i| i.aid.as_str()).collect();
        assert_eq!(aids, vec!["fs.bad", "fs.put", "fs.wide", NOOP_AID]);

        let empty = build_menu(&Toolkit::new(), &["fs".to_string()]);
        assert!(empty.is_empty());
    }

    #[test]
    fn only_ok_results_commit() {
        let kit = kit();
        let mut state = DsState::new();

        let rejected = run(&kit, "fs.bad", None, &mut state);
        assert_eq!(rejected.patch, None);
        assert!(state.is_empty());

        let ok = run(&kit, "fs.put", None, &mut state);
        assert_eq!(ok.patch.map(|p| p.len()), Some(1));
        assert!(state.is_filled(1));
    }

    #[test]
    fn stage_advance_lands_in_the_same_patch() {
        let kit = kit();
        let mut state = DsState::new();
        state.put(STAGE_SLOT, stage_artifact(STAGE_LOADED));

        let rejected = run(&kit, "fs.bad", Some(STAGE_RAN), &mut state);
        assert_eq!(rejected.patch, None);
        assert_eq!(stage_from_state(&state), STAGE_LOADED);

        let ok = run(&kit, "fs.put", Some(STAGE_RAN), &mut state);
        assert_eq!(ok.patch.map(|p| p.len()), Some(2));
        assert_eq!(stage_from_state(&state), STAGE_RAN);
    }

    #[test]
    fn commit_outside_tracked_slots_becomes_tool_error() {
        let mut state = DsState::new();
        let exec = run(&kit(), "fs.wide", None, &mut state);
        assert_eq!(exec.result.status, ToolStatus::ToolError);
        assert!(exec.result.error.is_some_and(|e| e.starts_with("commit: ")));
        assert!(state.is_empty());
    }
}
