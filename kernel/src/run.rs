//! Live runs: drive the step loop and append every event to the audit log.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::DateTime;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use tracing::{info, instrument};

use crate::core::clock::SharedClock;
use crate::core::types::{RunHeader, RunOutcome, RunRequest};
use crate::io::audit::AuditLogger;
use crate::io::config::KernelConfig;
use crate::io::fences::FenceProbe;
use crate::io::tools::{GoalRegistry, ToolRegistry, ToolRunner};
use crate::selector::Selectors;
use crate::step::{RunDriver, drive};

const RUN_ID_SUFFIX_LEN: usize = 6;

/// Configuration and collaborators shared by live runs and replay.
pub struct Kernel<'a, T> {
    config: &'a KernelConfig,
    tools: &'a T,
    fences: FenceProbe,
}

impl<'a, T> Kernel<'a, T>
where
    T: ToolRegistry + GoalRegistry + ToolRunner,
{
    pub fn new(config: &'a KernelConfig, tools: &'a T) -> Self {
        Self {
            config,
            tools,
            fences: FenceProbe::new(&config.fences),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        self.config
    }

    pub fn tools(&self) -> &T {
        self.tools
    }

    pub fn fences(&self) -> &FenceProbe {
        &self.fences
    }

    /// Run `request` to completion, writing events to `logger`.
    #[instrument(skip_all, fields(run_id = %logger.header().run_id))]
    pub fn run(
        &self,
        selectors: &mut Selectors,
        request: &RunRequest,
        logger: &mut AuditLogger,
    ) -> Result<RunReport> {
        let done = drive(self, selectors, request, logger)?;
        let report = RunReport {
            run_id: logger.header().run_id.clone(),
            outcome: done.outcome,
            steps: done.steps,
            log_path: logger.path().to_path_buf(),
            state_digest: done.state.digest(),
        };
        info!(log = %report.log_path.display(), "audit log written");
        Ok(report)
    }
}

impl RunDriver for AuditLogger {
    fn emit(&mut self, step: u32, event: &str, payload: Value) -> Result<()> {
        AuditLogger::emit(self, step, event, payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub steps: u32,
    pub log_path: PathBuf,
    pub state_digest: String,
}

/// `run-<utc stamp>-<6 lowercase alphanumerics>`.
pub fn generate_run_id(now_ms: u64) -> String {
    let stamp = i64::try_from(now_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|ts| ts.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_else(|| now_ms.to_string());
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RUN_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("run-{stamp}-{}", suffix.to_ascii_lowercase())
}

/// Open a fresh audit log under `config.log_dir` and run `request`.
pub fn execute_run<T>(
    config: &KernelConfig,
    tools: &T,
    selectors: &mut Selectors,
    request: &RunRequest,
    clock: SharedClock,
) -> Result<RunReport>
where
    T: ToolRegistry + GoalRegistry + ToolRunner,
{
    request.validate()?;
    let header = RunHeader {
        run_id: generate_run_id(clock.now_ms()),
        request_id: request.request_id.clone(),
        profile_id: config.profile_id.clone(),
        spec_version: config.spec_version.clone(),
    };
    let mut logger = AuditLogger::create(&config.log_dir, header, clock)
        .with_context(|| format!("open audit log in {}", config.log_dir.display()))?;
    Kernel::new(config, tools).run(selectors, request, &mut logger)
}
