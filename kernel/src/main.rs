//! Deterministic decision kernel CLI.
//!
//! `run` executes a request and prints the audit log path; `replay_strict`
//! re-drives a recorded run and checks it against its log.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use dskernel::core::clock::system_clock;
use dskernel::exit_codes;
use dskernel::io::config::{KernelConfig, load_config};
use dskernel::io::process::ProcessSandbox;
use dskernel::io::request::load_request;
use dskernel::io::toolkit::Toolkit;
use dskernel::logging;
use dskernel::replay::{ReplayDivergence, replay_strict};
use dskernel::run::{Kernel, execute_run};
use dskernel::selector::{SelectorBackend, Selectors};

#[derive(Parser)]
#[command(
    name = "dskernel",
    version,
    about = "Deterministic decision kernel with replayable audit logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a request to completion and print the audit log path.
    Run {
        /// Run request JSON.
        request: PathBuf,
        /// Kernel config TOML. Defaults apply when missing.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Re-drive a recorded run and fail on the first divergence from its log.
    #[command(name = "replay_strict")]
    ReplayStrict {
        /// Run request JSON the log was produced from.
        request: PathBuf,
        /// Audit log JSONL.
        log: PathBuf,
        /// Kernel config TOML. Defaults apply when missing.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { request, config } => cmd_run(&request, config.as_deref()),
        Command::ReplayStrict {
            request,
            log,
            config,
        } => cmd_replay_strict(&request, &log, config.as_deref()),
    }
}

fn read_config(path: Option<&Path>) -> Result<KernelConfig> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => KernelConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn cmd_run(request_path: &Path, config_path: Option<&Path>) -> Result<i32> {
    let config = read_config(config_path)?;
    let request = load_request(request_path)?;
    let clock = system_clock();
    let tools = Toolkit::builtin(clock.clone());
    let policy = SelectorBackend::from_config(&config, Box::new(ProcessSandbox), clock.clone())?;
    let mut selectors = Selectors::new(policy);

    let report = execute_run(&config, &tools, &mut selectors, &request, clock)?;
    println!("{}", report.log_path.display());
    Ok(if report.outcome.is_success() {
        exit_codes::OK
    } else {
        exit_codes::FAILURE
    })
}

fn cmd_replay_strict(
    request_path: &Path,
    log_path: &Path,
    config_path: Option<&Path>,
) -> Result<i32> {
    let config = read_config(config_path)?;
    let request = load_request(request_path)?;
    let clock = system_clock();
    let tools = Toolkit::builtin(clock.clone());
    let policy = SelectorBackend::from_config(&config, Box::new(ProcessSandbox), clock)?;
    let mut selectors = Selectors::new(policy);

    let kernel = Kernel::new(&config, &tools);
    match replay_strict(&kernel, &mut selectors, &request, log_path) {
        Ok(report) => {
            println!(
                "REPLAY_STRICT OK steps={} terminal={}",
                report.steps, report.terminal
            );
            Ok(exit_codes::OK)
        }
        Err(err) => {
            match err.downcast_ref::<ReplayDivergence>() {
                Some(div) => println!("REPLAY_STRICT FAIL: {div} at step {}", div.step),
                None => println!("REPLAY_STRICT FAIL: {err:#} at step 0"),
            }
            Ok(exit_codes::FAILURE)
        }
    }
}
