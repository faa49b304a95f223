//! Subprocess sandbox: argv-only spawn with a timeout and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

/// Outcome of one sandboxed invocation. Never an `Err`: spawn and I/O
/// failures are reported through `error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureResult {
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr, lossily decoded.
    pub output: String,
    pub timed_out: bool,
    pub output_truncated: bool,
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

pub trait Sandbox {
    fn run_capture(&self, argv: &[String], cwd: Option<&Path>, limits: &SandboxLimits)
    -> CaptureResult;
}

/// Runs `argv[0]` directly with `argv[1..]` as arguments. No shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSandbox;

impl Sandbox for ProcessSandbox {
    fn run_capture(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        limits: &SandboxLimits,
    ) -> CaptureResult {
        let Some((program, args)) = argv.split_first() else {
            return CaptureResult::failed("empty argv");
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        match run_command_with_timeout(
            cmd,
            Duration::from_millis(limits.timeout_ms),
            limits.max_output_bytes,
        ) {
            Ok(out) => {
                let mut combined = out.stdout;
                combined.extend_from_slice(&out.stderr);
                let over_cap = combined.len() > limits.max_output_bytes;
                combined.truncate(limits.max_output_bytes);
                CaptureResult {
                    exit_code: out.exit_code,
                    output: String::from_utf8_lossy(&combined).into_owned(),
                    timed_out: out.timed_out,
                    output_truncated: over_cap || out.truncated_bytes > 0,
                    error: None,
                }
            }
            Err(err) => CaptureResult::failed(format!("{err:#}")),
        }
    }
}

#[derive(Debug)]
struct CommandOutput {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated_bytes: usize,
    timed_out: bool,
}

/// Run a command with a timeout, draining stdout and stderr concurrently so a
/// chatty child cannot deadlock on a full pipe.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        truncated_bytes: stdout_truncated + stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
