#![forbid(unsafe_code)]

//! Default locations: the repo-rooted ledger directory and the worker binary.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_LEDGER_DIRNAME: &str = ".gate/ledger";
pub(crate) const DEFAULT_WORKER_BIN: &str = "gate-worker";

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Prefer the repo root over the launch directory so runs started from a
/// subdirectory share one ledger.
pub(crate) fn default_ledger_dir(start: &Path) -> PathBuf {
    find_repo_root(start)
        .unwrap_or_else(|| start.to_path_buf())
        .join(DEFAULT_LEDGER_DIRNAME)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn find_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<String> {
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .map(|candidate| candidate.to_string_lossy().to_string())
}

/// An explicit binary wins; otherwise look for [`DEFAULT_WORKER_BIN`] on `path_var`.
pub(crate) fn resolve_worker_bin(
    explicit: Option<String>,
    path_var: Option<OsString>,
) -> Result<String, String> {
    if let Some(bin) = explicit
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        let looks_like_path = bin.contains(std::path::MAIN_SEPARATOR) || bin.contains('/');
        if looks_like_path && !is_executable(Path::new(&bin)) {
            return Err(format!("worker binary is not executable: {bin}"));
        }
        return Ok(bin);
    }
    let dirs = path_var
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();
    find_in_dirs(DEFAULT_WORKER_BIN, &dirs).ok_or_else(|| {
        format!(
            "worker binary not found: pass --worker-bin, set GATE_WORKER_BIN, or put `{DEFAULT_WORKER_BIN}` on PATH"
        )
    })
}
