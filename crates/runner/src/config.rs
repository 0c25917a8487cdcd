#![forbid(unsafe_code)]

use crate::engine::EngineConfig;
use crate::locate::{default_ledger_dir, resolve_worker_bin};
use gate_core::retry::DEFAULT_SESSION_TTL_MS;
use gate_core::{AuthorizedScope, ChangesetId, RetryPolicy, WorkType};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    pub registry_path: PathBuf,
    pub changeset_id: ChangesetId,
    pub work_types: Vec<WorkType>,
    pub scope: Vec<String>,
    pub scope_file: Option<PathBuf>,
    pub worker_bin: String,
    pub worker_args: Vec<String>,
    pub ledger_dir: PathBuf,
    /// `None` means attempts may run indefinitely.
    pub attempt_timeout_s: Option<u64>,
    pub session_ttl_s: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Run(RunnerConfig),
}

pub fn usage() -> &'static str {
    "gate_runner: run the validation gate for one changeset\n\n\
USAGE:\n\
  gate_runner --registry FILE --changeset ID --work-type T [--work-type T ...]\n\
              [--scope PATH ...] [--scope-file FILE]\n\
              [--worker-bin PATH] [--worker-arg ARG ...]\n\
              [--ledger-dir DIR] [--attempt-timeout-s S] [--session-ttl-s S]\n\n\
ENV:\n\
  GATE_REGISTRY, GATE_WORKER_BIN, GATE_LEDGER_DIR, GATE_ATTEMPT_TIMEOUT_S,\n\
  GATE_SESSION_TTL_S, GATE_LOG (tracing filter, default `info`)\n\n\
NOTES:\n\
  - The decision is printed as JSON on stdout; logs go to stderr.\n\
  - Exit codes: 0 passed, 2 escalated, 1 usage or configuration error.\n\
  - `--attempt-timeout-s 0` disables the per-attempt timeout;\n\
    `--session-ttl-s 0` never treats worker sessions as stale.\n\
  - Ctrl-C cancels the run; parallel validators finish their current attempt.\n"
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64(flag: &str, raw: &str) -> Result<u64, String> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| format!("{flag} must be an integer (seconds)"))
}

/// Flags win over `GATE_*` environment values; `env` is injected so tests
/// need not touch the process environment.
pub fn parse_args<E>(args: &[String], env: E, cwd: &Path) -> Result<Invocation, String>
where
    E: Fn(&str) -> Option<String>,
{
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Invocation::Help);
    }

    let mut registry_path: Option<PathBuf> = env("GATE_REGISTRY").map(PathBuf::from);
    let mut changeset: Option<String> = None;
    let mut work_types: Vec<String> = Vec::new();
    let mut scope: Vec<String> = Vec::new();
    let mut scope_file: Option<PathBuf> = None;
    let mut worker_bin: Option<String> = env("GATE_WORKER_BIN");
    let mut worker_args: Vec<String> = Vec::new();
    let mut ledger_dir: Option<PathBuf> = env("GATE_LEDGER_DIR").map(PathBuf::from);
    let mut attempt_timeout_s: u64 = match env("GATE_ATTEMPT_TIMEOUT_S") {
        Some(v) => parse_u64("GATE_ATTEMPT_TIMEOUT_S", &v)?,
        None => 0,
    };
    let mut session_ttl_s: u64 = match env("GATE_SESSION_TTL_S") {
        Some(v) => parse_u64("GATE_SESSION_TTL_S", &v)?,
        None => DEFAULT_SESSION_TTL_MS / 1000,
    };

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--registry" => {
                i += 1;
                let v = args.get(i).ok_or("--registry requires FILE")?;
                registry_path = Some(PathBuf::from(v));
            }
            "--changeset" => {
                i += 1;
                let v = args.get(i).ok_or("--changeset requires ID")?;
                changeset = Some(v.to_string());
            }
            "--work-type" => {
                i += 1;
                let v = args.get(i).ok_or("--work-type requires T")?;
                work_types.push(v.to_string());
            }
            "--scope" => {
                i += 1;
                let v = args.get(i).ok_or("--scope requires PATH")?;
                scope.push(v.to_string());
            }
            "--scope-file" => {
                i += 1;
                let v = args.get(i).ok_or("--scope-file requires FILE")?;
                scope_file = Some(PathBuf::from(v));
            }
            "--worker-bin" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-bin requires PATH")?;
                worker_bin = Some(v.to_string());
            }
            "--worker-arg" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-arg requires ARG")?;
                worker_args.push(v.to_string());
            }
            "--ledger-dir" => {
                i += 1;
                let v = args.get(i).ok_or("--ledger-dir requires DIR")?;
                ledger_dir = Some(PathBuf::from(v));
            }
            "--attempt-timeout-s" => {
                i += 1;
                let v = args.get(i).ok_or("--attempt-timeout-s requires S")?;
                attempt_timeout_s = parse_u64("--attempt-timeout-s", v)?;
            }
            "--session-ttl-s" => {
                i += 1;
                let v = args.get(i).ok_or("--session-ttl-s requires S")?;
                session_ttl_s = parse_u64("--session-ttl-s", v)?;
            }
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    let registry_path =
        registry_path.ok_or("--registry is required (or set GATE_REGISTRY)")?;
    let changeset = changeset.ok_or("--changeset is required")?;
    let changeset_id = ChangesetId::try_new(changeset)
        .map_err(|e| format!("invalid --changeset: {}", e.message()))?;
    if work_types.is_empty() {
        return Err("at least one --work-type is required".to_string());
    }
    let work_types = work_types
        .into_iter()
        .map(|raw| {
            WorkType::try_new(raw.clone())
                .map_err(|e| format!("invalid --work-type `{raw}`: {}", e.message()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let worker_bin = resolve_worker_bin(worker_bin, env("PATH").map(OsString::from))?;
    let ledger_dir = ledger_dir.unwrap_or_else(|| default_ledger_dir(cwd));

    Ok(Invocation::Run(RunnerConfig {
        registry_path,
        changeset_id,
        work_types,
        scope,
        scope_file,
        worker_bin,
        worker_args,
        ledger_dir,
        attempt_timeout_s: (attempt_timeout_s > 0).then_some(attempt_timeout_s),
        session_ttl_s,
    }))
}

/// One path per line; blank lines and `#` comments are skipped.
pub(crate) fn parse_scope_file(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

impl RunnerConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            attempt_timeout: self.attempt_timeout_s.map(Duration::from_secs),
            retry: RetryPolicy::new(self.session_ttl_s.saturating_mul(1000)),
        }
    }

    pub fn authorized_scope(&self) -> Result<AuthorizedScope, String> {
        let mut paths = self.scope.clone();
        if let Some(file) = &self.scope_file {
            let text = std::fs::read_to_string(file)
                .map_err(|e| format!("read scope file {} failed: {e}", file.display()))?;
            paths.extend(parse_scope_file(&text));
        }
        Ok(AuthorizedScope::new(paths))
    }
}
