#![forbid(unsafe_code)]

use gate_core::{GateRequest, Outcome, ProfileRegistry};
use gate_runner::config::{self, Invocation, RunnerConfig};
use gate_runner::executors::CommandDispatcher;
use gate_runner::{GateEngine, cancel, logging};
use gate_storage::SqliteLedger;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const EXIT_PASSED: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_REJECTED: i32 = 2;

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg = match config::parse_args(&args, config::env_var, &cwd)? {
        Invocation::Help => {
            print!("{}", config::usage());
            return Ok(EXIT_PASSED);
        }
        Invocation::Run(cfg) => cfg,
    };

    let decision = gate(&cfg).await?;

    let mut ledger = SqliteLedger::open(&cfg.ledger_dir)
        .map_err(|e| format!("open ledger {} failed: {e}", cfg.ledger_dir.display()))?;
    let run = ledger
        .record_decision(&decision)
        .map_err(|e| format!("record decision failed: {e}"))?;
    info!(run_id = %run.run_id, outcome = run.outcome.as_str(), "decision recorded");

    let json = serde_json::to_string_pretty(&decision)
        .map_err(|e| format!("serialize decision failed: {e}"))?;
    println!("{json}");

    Ok(match decision.outcome {
        Outcome::Passed => EXIT_PASSED,
        Outcome::Failed | Outcome::Escalated => EXIT_REJECTED,
    })
}

async fn gate(cfg: &RunnerConfig) -> Result<gate_core::Decision, String> {
    let registry = ProfileRegistry::load(&cfg.registry_path)
        .map_err(|e| format!("load registry {} failed: {e}", cfg.registry_path.display()))?;
    let request = GateRequest::new(
        cfg.changeset_id.clone(),
        cfg.work_types.iter().cloned(),
        cfg.authorized_scope()?,
    );
    let dispatcher = CommandDispatcher::new(cfg.worker_bin.clone())
        .with_args(cfg.worker_args.iter().cloned())
        .with_working_dir(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let engine = GateEngine::new(Arc::new(registry), Arc::new(dispatcher), cfg.engine_config());

    let (handle, signal) = cancel::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling gate run");
            handle.cancel();
        }
    });

    engine
        .run_with_cancel(&request, signal)
        .await
        .map_err(|e| format!("gate configuration error: {e}"))
}
