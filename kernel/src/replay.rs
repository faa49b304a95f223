//! Strict replay: re-drive a recorded run against its audit log and stop at
//! the first divergence.
//!
//! Every event the replayed loop produces must equal the next logged record.
//! Deterministic policies and tools are recomputed. Outputs of
//! non-deterministic backends and tools are taken from the log, and logged
//! patches are re-applied through a transaction.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::canonical::canonical_string;
use crate::core::protocol::Selection;
use crate::core::state::DsState;
use crate::core::tx::{Patch, Tx, apply_patch};
use crate::core::types::RunRequest;
use crate::io::audit::{
    LogRecord, events, parse_records, payload_field, read_log_lines, verify_chain,
};
use crate::io::config::KernelConfig;
use crate::io::tools::{GoalRegistry, ToolRegistry, ToolRunResult, ToolRunner, ToolStatus};
use crate::run::Kernel;
use crate::selector::{SelectRequest, Selector, SelectorBackend, SelectorOutput, Selectors};
use crate::step::{
    PolicyDecision, RunDriver, ToolCall, ToolExecution, consult_policy, drive, execute_in_tx,
    terminal_event,
};

const END_OF_LOG: &str = "<end of log>";

/// First point where the replayed run and the log disagree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: expected {expected}, actual {actual}")]
pub struct ReplayDivergence {
    pub step: u32,
    pub field: String,
    /// Logged value.
    pub expected: String,
    /// Recomputed value.
    pub actual: String,
}

fn divergence(step: u32, field: &str, expected: &str, actual: &str) -> anyhow::Error {
    ReplayDivergence {
        step,
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub run_id: String,
    pub steps: u32,
    /// Event that ended the recorded run.
    pub terminal: &'static str,
}

/// Replay the run recorded at `log_path` for `request`.
///
/// Returns a [`ReplayDivergence`] (inside the `anyhow` error) when the log
/// does not match; other errors mean the log could not be read at all.
#[instrument(skip_all, fields(log = %log_path.display()))]
pub fn replay_strict<T>(
    kernel: &Kernel<'_, T>,
    selectors: &mut Selectors,
    request: &RunRequest,
    log_path: &Path,
) -> Result<ReplayReport>
where
    T: ToolRegistry + GoalRegistry + ToolRunner,
{
    let lines = read_log_lines(log_path)?;
    if let Err(err) = verify_chain(&lines) {
        let step = lines
            .get(err.line.saturating_sub(1))
            .and_then(|line| serde_json::from_str::<Value>(line).ok())
            .and_then(|value| value.get("step").and_then(Value::as_u64))
            .and_then(|step| u32::try_from(step).ok())
            .unwrap_or(0);
        return Err(divergence(step, "chain", "intact chain", &err.to_string()));
    }
    let records = parse_records(&lines)?;
    let Some(first) = records.first() else {
        return Err(divergence(0, "event", END_OF_LOG, events::RUN_START));
    };
    let run_id = first.run_id.clone();
    check_headers(kernel.config(), request, &records)?;

    let mut driver = ReplayDriver { records, pos: 0 };
    let done = drive(kernel, selectors, request, &mut driver)?;
    if let Some(extra) = driver.records.get(driver.pos) {
        return Err(divergence(extra.step, "event", &extra.event, END_OF_LOG));
    }

    let report = ReplayReport {
        run_id,
        steps: done.steps,
        terminal: terminal_event(&done.outcome),
    };
    info!(steps = report.steps, terminal = report.terminal, "replay matched");
    Ok(report)
}

fn check_headers(config: &KernelConfig, request: &RunRequest, records: &[LogRecord]) -> Result<()> {
    let run_id = records.first().map(|r| r.run_id.as_str()).unwrap_or_default();
    let request_id = request.request_id.as_deref().unwrap_or("null");
    for record in records {
        if record.run_id != run_id {
            return Err(divergence(record.step, "run_id", run_id, &record.run_id));
        }
        if record.profile_id != config.profile_id {
            return Err(divergence(
                record.step,
                "profile_id",
                &record.profile_id,
                &config.profile_id,
            ));
        }
        if record.spec_version != config.spec_version {
            return Err(divergence(
                record.step,
                "spec_version",
                &record.spec_version,
                &config.spec_version,
            ));
        }
        if record.request_id != request.request_id {
            let logged = record.request_id.as_deref().unwrap_or("null");
            return Err(divergence(record.step, "request_id", logged, request_id));
        }
    }
    Ok(())
}

struct ReplayDriver {
    records: Vec<LogRecord>,
    pos: usize,
}

impl ReplayDriver {
    fn next_record(&self, step: u32, wanted: &str) -> Result<LogRecord> {
        self.records
            .get(self.pos)
            .cloned()
            .ok_or_else(|| divergence(step, "event", END_OF_LOG, wanted))
    }

    fn logged_execution(&self, record: &LogRecord, state: &mut DsState) -> Result<ToolExecution> {
        let payload = &record.payload;
        let logged_error = payload_field(payload, "error").as_str().map(str::to_string);
        let detail = payload_field(payload, "detail").as_str().map(str::to_string);
        let failed = |status, error| ToolExecution {
            result: ToolRunResult {
                status,
                output: payload_field(payload, "output").clone(),
                error,
            },
            patch: None,
        };
        match record.event.as_str() {
            events::TOOL_OK => {
                let patch = reapply(record, state)?;
                Ok(ToolExecution {
                    result: ToolRunResult::ok(payload_field(payload, "output").clone()),
                    patch: Some(patch),
                })
            }
            events::TOOL_ERROR => Ok(failed(ToolStatus::ToolError, logged_error)),
            events::INVALID_PICK => Ok(failed(ToolStatus::InvalidPick, detail)),
            events::BREAKER_TRIPPED => Ok(failed(ToolStatus::BreakerTrip, detail)),
            other => Err(divergence(record.step, "event", other, "tool result")),
        }
    }
}

/// Apply a logged patch to `state` through a transaction and return the
/// patch the transaction reports.
fn reapply(record: &LogRecord, state: &mut DsState) -> Result<Patch> {
    let field = "tool_ok.patch";
    let patch: Patch = serde_json::from_value(payload_field(&record.payload, "patch").clone())
        .map_err(|err| divergence(record.step, field, "readable patch", &err.to_string()))?;
    let mut tx = Tx::begin(state);
    apply_patch(tx.state_mut(), &patch)
        .map_err(|err| divergence(record.step, field, "applicable patch", &err.to_string()))?;
    tx.commit(state)
        .map_err(|err| divergence(record.step, field, "committable patch", &err.to_string()))
}

impl RunDriver for ReplayDriver {
    fn emit(&mut self, step: u32, event: &str, payload: Value) -> Result<()> {
        let record = self.next_record(step, event)?;
        if record.event != event {
            return Err(divergence(record.step, "event", &record.event, event));
        }
        if record.step != step {
            return Err(divergence(
                record.step,
                "step",
                &record.step.to_string(),
                &step.to_string(),
            ));
        }
        if let Some(key) = first_difference(&record.payload, &payload) {
            let (expected, actual) = if key.is_empty() {
                (&record.payload, &payload)
            } else {
                (payload_field(&record.payload, &key), payload_field(&payload, &key))
            };
            let field = if key.is_empty() {
                event.to_string()
            } else {
                format!("{event}.{key}")
            };
            return Err(divergence(
                step,
                &field,
                &canonical_string(expected),
                &canonical_string(actual),
            ));
        }
        debug!(step, event, "event matched");
        self.pos += 1;
        Ok(())
    }

    fn policy(
        &mut self,
        policy: &mut SelectorBackend,
        request: &SelectRequest<'_>,
    ) -> Result<PolicyDecision> {
        if policy.is_deterministic() {
            return Ok(consult_policy(policy, request));
        }
        let record = self.next_record(0, events::SELECTOR_CHOSEN)?;
        if record.event != events::SELECTOR_CHOSEN {
            return Err(divergence(record.step, "event", &record.event, events::SELECTOR_CHOSEN));
        }
        let logged = payload_field(&record.payload, "policy");
        let logged_selection = payload_field(logged, "selection").clone();
        let selection: Selection = serde_json::from_value(logged_selection).map_err(|err| {
            divergence(
                record.step,
                "selector_chosen.policy",
                "logged policy selection",
                &err.to_string(),
            )
        })?;
        let raw = payload_field(logged, "raw").as_str().unwrap_or_default().to_string();
        debug!(step = record.step, backend = policy.name(), "trusting logged policy output");
        Ok(PolicyDecision {
            output: SelectorOutput { selection, raw },
            diagnostics: payload_field(logged, "diagnostics").clone(),
        })
    }

    fn execute<T: ToolRunner>(
        &mut self,
        tools: &T,
        call: &ToolCall<'_>,
        state: &mut DsState,
    ) -> Result<ToolExecution> {
        let record = self.next_record(0, "tool result")?;
        let logged_non_deterministic = record.event == events::TOOL_OK
            && payload_field(&record.payload, "deterministic") == &Value::Bool(false);
        if !call.desc.deterministic || logged_non_deterministic {
            debug!(aid = %call.desc.aid, "applying logged tool result");
            return self.logged_execution(&record, state);
        }

        if matches!(record.event.as_str(), events::TOOL_OK | events::TOOL_ERROR) {
            let logged_fences = payload_field(&record.payload, "fences");
            let fences = serde_json::to_value(call.fences)?;
            if *logged_fences != fences {
                return Err(divergence(
                    record.step,
                    &format!("{}.fences", record.event),
                    &canonical_string(logged_fences),
                    &canonical_string(&fences),
                ));
            }
            let logged_input = payload_field(&record.payload, "input");
            if logged_input != call.input {
                return Err(divergence(
                    record.step,
                    &format!("{}.input", record.event),
                    &canonical_string(logged_input),
                    &canonical_string(call.input),
                ));
            }
        }
        Ok(execute_in_tx(tools, call, state))
    }
}

/// First top-level key whose values differ, or `""` when the payloads are
/// not both objects and differ as a whole.
fn first_difference(expected: &Value, actual: &Value) -> Option<String> {
    match (expected, actual) {
        (Value::Object(left), Value::Object(right)) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            keys.into_iter()
                .find(|key| payload_field(expected, key) != payload_field(actual, key))
                .cloned()
        }
        _ if expected != actual => Some(String::new()),
        _ => None,
    }
}
