//! Hash-chained JSONL audit log.
//!
//! Each line is the canonical record plus `record_hash`, `chain_prev` and
//! `chain_hash`, where `chain_hash = SHA256(chain_prev_hex || record_bytes)`.
//! Editing any historical byte breaks every later `chain_hash`.
//!
//! This is product output. Dev diagnostics go through `tracing`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::canonical::{canonical_bytes, canonical_string};
use crate::core::clock::SharedClock;
use crate::core::digest::sha256_hex;
use crate::core::types::RunHeader;

/// `chain_prev` of the first line.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const CHAIN_FIELDS: [&str; 3] = ["record_hash", "chain_prev", "chain_hash"];

/// Audit event names.
pub mod events {
    pub const RUN_START: &str = "run_start";
    pub const MENU_BUILT: &str = "menu_built";
    pub const SELECTOR_CHOSEN: &str = "selector_chosen";
    pub const INVALID_PICK: &str = "invalid_pick";
    pub const TOOL_OK: &str = "tool_ok";
    pub const TOOL_ERROR: &str = "tool_error";
    pub const NOOP: &str = "noop";
    pub const ASK_SUP: &str = "ask_sup";
    pub const GOAL_DONE: &str = "goal_done";
    pub const BREAKER_TRIPPED: &str = "breaker_tripped";
    pub const RUN_END: &str = "run_end";
}

/// File name of the audit log for `run_id`.
pub fn log_file_name(run_id: &str) -> String {
    format!("run_{run_id}.jsonl")
}

/// Build the unchained record for one event.
pub fn build_record(header: &RunHeader, step: u32, event: &str, payload: Value, ts: &str) -> Value {
    let mut record = json!({
        "event": event,
        "payload": payload,
        "profile_id": header.profile_id,
        "run_id": header.run_id,
        "spec_version": header.spec_version,
        "step": step,
        "ts": ts,
    });
    if let Some(request_id) = &header.request_id {
        record["request_id"] = Value::String(request_id.clone());
    }
    record
}

/// Chain `record` onto `chain_prev`. Returns the persisted line (without the
/// trailing newline) and its `chain_hash`.
pub fn chain_line(record: &Value, chain_prev: &str) -> (String, String) {
    let record_bytes = canonical_bytes(record);
    let record_hash = sha256_hex(&record_bytes);
    let mut chained = Vec::with_capacity(chain_prev.len() + record_bytes.len());
    chained.extend_from_slice(chain_prev.as_bytes());
    chained.extend_from_slice(&record_bytes);
    let chain_hash = sha256_hex(&chained);

    let mut line = record.clone();
    line["record_hash"] = Value::String(record_hash);
    line["chain_prev"] = Value::String(chain_prev.to_string());
    line["chain_hash"] = Value::String(chain_hash.clone());
    (canonical_string(&line), chain_hash)
}

/// Append-only writer for one run. Every event is flushed before `emit`
/// returns.
pub struct AuditLogger {
    file: File,
    path: PathBuf,
    header: RunHeader,
    chain_prev: String,
    clock: SharedClock,
}

impl AuditLogger {
    /// Create `run_<run_id>.jsonl` under `dir`.
    pub fn create(dir: &Path, header: RunHeader, clock: SharedClock) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(log_file_name(&header.run_id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("create audit log {}", path.display()))?;
        debug!(path = %path.display(), "audit log opened");
        Ok(Self {
            file,
            path,
            header,
            chain_prev: GENESIS_HASH.to_string(),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &RunHeader {
        &self.header
    }

    #[instrument(skip(self, payload), fields(run_id = %self.header.run_id))]
    pub fn emit(&mut self, step: u32, event: &str, payload: Value) -> Result<()> {
        let ts = timestamp(self.clock.now_ms());
        let record = build_record(&self.header, step, event, payload, &ts);
        let (mut line, chain_hash) = chain_line(&record, &self.chain_prev);
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("append audit log {}", self.path.display()))?;
        self.chain_prev = chain_hash;
        Ok(())
    }
}

/// RFC 3339 UTC with millisecond precision.
pub fn timestamp(now_ms: u64) -> String {
    i64::try_from(now_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// First line (1-based) where the chain does not verify.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit chain broken at line {line}: {reason}")]
pub struct ChainError {
    pub line: usize,
    pub reason: String,
}

/// Recompute the chain over `lines` from the genesis hash.
pub fn verify_chain<S: AsRef<str>>(lines: &[S]) -> Result<(), ChainError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let fail = |reason: &str| ChainError {
            line: line_no,
            reason: reason.to_string(),
        };
        let raw = raw.as_ref();
        let value: Value = serde_json::from_str(raw).map_err(|_| fail("not json"))?;
        if canonical_string(&value) != raw {
            return Err(fail("not canonical"));
        }
        let Value::Object(mut map) = value else {
            return Err(fail("not an object"));
        };
        let mut hashes = Vec::with_capacity(CHAIN_FIELDS.len());
        for field in CHAIN_FIELDS {
            match map.remove(field) {
                Some(Value::String(hash)) => hashes.push(hash),
                _ => return Err(fail(&format!("missing {field}"))),
            }
        }
        let record = Value::Object(map);
        let (rebuilt, chain_hash) = chain_line(&record, &expected_prev);
        if hashes[1] != expected_prev {
            return Err(fail("chain_prev mismatch"));
        }
        if rebuilt != raw {
            return Err(fail(if hashes[0] != sha256_hex(canonical_bytes(&record)) {
                "record_hash mismatch"
            } else {
                "chain_hash mismatch"
            }));
        }
        expected_prev = chain_hash;
    }
    Ok(())
}

/// One parsed audit line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogRecord {
    pub event: String,
    pub step: u32,
    #[serde(default)]
    pub payload: Value,
    pub run_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub profile_id: String,
    pub spec_version: String,
    pub ts: String,
}

/// Read raw lines, skipping a trailing empty line.
pub fn read_log_lines(path: &Path) -> Result<Vec<String>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    Ok(contents.lines().map(str::to_string).collect())
}

pub fn parse_records(lines: &[String]) -> Result<Vec<LogRecord>> {
    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|err| anyhow!("parse audit line {}: {err}", idx + 1))
        })
        .collect()
}

/// Field of a payload object, or `Null`.
pub fn payload_field<'a>(payload: &'a Value, key: &str) -> &'a Value {
    payload.get(key).unwrap_or(&Value::Null)
}

/// Strip chain fields; used by tests that rewrite history.
pub fn unchained(line: &str) -> Result<Value> {
    let mut map: Map<String, Value> =
        serde_json::from_str(line).context("parse audit line")?;
    for field in CHAIN_FIELDS {
        map.remove(field);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn header() -> RunHeader {
        RunHeader {
            run_id: "run-test".to_string(),
            request_id: Some("req-1".to_string()),
            profile_id: "default".to_string(),
            spec_version: "1".to_string(),
        }
    }

    fn write_log(dir: &Path, events: usize) -> Vec<String> {
        let mut logger = AuditLogger::create(dir, header(), ManualClock::new(0)).expect("logger");
        for step in 0..events {
            logger
                .emit(step as u32, events::MENU_BUILT, json!({"items": ["a", "b"], "n": step}))
                .expect("emit");
        }
        read_log_lines(logger.path()).expect("read")
    }

    #[test]
    fn first_line_chains_from_genesis() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lines = write_log(temp.path(), 1);
        let value: Value = serde_json::from_str(&lines[0]).expect("json");
        assert_eq!(value["chain_prev"], GENESIS_HASH);
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["ts"], "1970-01-01T00:00:00.000Z");
        let record = unchained(&lines[0]).expect("unchained");
        assert_eq!(value["record_hash"], sha256_hex(canonical_bytes(&record)));
    }

    #[test]
    fn intact_log_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lines = write_log(temp.path(), 5);
        assert_eq!(lines.len(), 5);
        verify_chain(&lines).expect("chain");
    }

    #[test]
    fn request_id_is_omitted_when_absent() {
        let mut h = header();
        h.request_id = None;
        let record = build_record(&h, 0, events::RUN_START, json!({}), "t");
        assert!(record.get("request_id").is_none());
    }

    /// Flipping any single byte of a historical record and re-chaining from
    /// that point never reproduces a later logged `chain_hash`.
    #[test]
    fn single_byte_tamper_never_reproduces_later_chain_hashes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lines = write_log(temp.path(), 4);
        let original: Vec<String> = lines
            .iter()
            .map(|l| {
                let v: Value = serde_json::from_str(l).expect("json");
                v["chain_hash"].as_str().expect("hash").to_string()
            })
            .collect();

        for target in 0..lines.len() {
            let record = unchained(&lines[target]).expect("unchained");
            let bytes = canonical_string(&record);
            for pos in 0..bytes.len() {
                let mut tampered = bytes.clone().into_bytes();
                tampered[pos] ^= 0x01;
                let Ok(text) = String::from_utf8(tampered) else {
                    continue;
                };
                let Ok(tampered_record) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let prev = if target == 0 {
                    GENESIS_HASH.to_string()
                } else {
                    original[target - 1].clone()
                };
                let (_, mut hash) = chain_line(&tampered_record, &prev);
                if canonical_string(&tampered_record) == bytes {
                    continue;
                }
                assert_ne!(hash, original[target], "line {target} byte {pos}");
                for later in target + 1..lines.len() {
                    let record = unchained(&lines[later]).expect("unchained");
                    let (_, next) = chain_line(&record, &hash);
                    assert_ne!(next, original[later], "line {later} after byte {pos}");
                    hash = next;
                }
            }
        }
    }

    #[test]
    fn verify_reports_first_tampered_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lines = write_log(temp.path(), 3);
        lines[1] = lines[1].replace("\"n\":1", "\"n\":7");
        let err = verify_chain(&lines).expect_err("tampered");
        assert_eq!(err.line, 2);
        assert_eq!(err.reason, "record_hash mismatch");
    }

    #[test]
    fn verify_rejects_removed_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut lines = write_log(temp.path(), 3);
        lines.remove(1);
        let err = verify_chain(&lines).expect_err("gap");
        assert_eq!(err.line, 2);
        assert_eq!(err.reason, "chain_prev mismatch");
    }

    #[test]
    fn logger_refuses_to_overwrite_existing_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_log(temp.path(), 1);
        assert!(AuditLogger::create(temp.path(), header(), ManualClock::new(0)).is_err());
    }
}
