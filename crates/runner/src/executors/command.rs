#![forbid(unsafe_code)]

use super::{extract_session, unwrap_structured_output};
use crate::context::sanitize_single_line;
use crate::dispatch::{DispatchError, Dispatcher, InputContext, WorkerOutput};
use async_trait::async_trait;
use gate_core::clock::now_ms;
use gate_core::{SessionHandle, ValidatorName};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const STDERR_HEAD_CHARS: usize = 400;
const STDERR_TAIL_CHARS: usize = 400;

/// Runs one worker process per attempt.
///
/// Fresh dispatch: `<bin> [args..] --validator <name>` with the JSON
/// `InputContext` on stdin. Resume: `<bin> [args..] --resume <session_id>`
/// with the supplemental text on stdin. Either way one JSON document is
/// expected on stdout.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    worker_bin: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandDispatcher {
    pub fn new(worker_bin: impl Into<String>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Arguments placed before the gate's own flags.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn dispatch_args(&self, validator: &ValidatorName) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--validator".to_string());
        args.push(validator.as_str().to_string());
        args
    }

    fn resume_args(&self, session: &SessionHandle) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--resume".to_string());
        args.push(session.session_id.clone());
        args
    }

    async fn run_worker(&self, args: Vec<String>, stdin_text: &str) -> Result<Value, DispatchError> {
        let mut cmd = Command::new(&self.worker_bin);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the attempt future (timeout, cancellation) must not leak the worker.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        debug!(bin = %self.worker_bin, ?args, "spawning worker");

        let mut child = cmd.spawn().map_err(|source| DispatchError::Spawn {
            bin: self.worker_bin.clone(),
            source,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(stdin_text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DispatchError::Exit {
                status: format_exit_status(&output.status),
                stderr: stderr_snippet(&output.stderr, STDERR_HEAD_CHARS, STDERR_TAIL_CHARS),
            });
        }
        parse_stdout(&output.stdout)
    }
}

#[async_trait]
impl Dispatcher for CommandDispatcher {
    async fn dispatch(
        &self,
        validator: &ValidatorName,
        context: &InputContext,
    ) -> Result<WorkerOutput, DispatchError> {
        let prompt = serde_json::to_string(context)
            .map_err(|e| DispatchError::Output(format!("serialize input context failed: {e}")))?;
        let value = self.run_worker(self.dispatch_args(validator), &prompt).await?;
        Ok(into_worker_output(value, None))
    }

    async fn resume(
        &self,
        session: &SessionHandle,
        supplemental: &str,
    ) -> Result<WorkerOutput, DispatchError> {
        let value = self.run_worker(self.resume_args(session), supplemental).await?;
        Ok(into_worker_output(value, Some(session)))
    }
}

fn parse_stdout(stdout: &[u8]) -> Result<Value, DispatchError> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DispatchError::Output("worker printed nothing".to_string()));
    }
    serde_json::from_str(trimmed).map_err(|e| DispatchError::Output(format!("parse worker json failed: {e}")))
}

/// A resumed worker that does not report a session keeps the one it resumed.
fn into_worker_output(value: Value, resumed: Option<&SessionHandle>) -> WorkerOutput {
    let session = extract_session(&value, now_ms()).or_else(|| resumed.cloned());
    WorkerOutput {
        raw: unwrap_structured_output(value),
        session,
    }
}

fn format_exit_status(status: &std::process::ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn stderr_snippet(raw: &[u8], head_chars: usize, tail_chars: usize) -> String {
    let sanitized = sanitize_single_line(&String::from_utf8_lossy(raw))
        .trim()
        .to_string();
    if sanitized.is_empty() {
        return "-".to_string();
    }
    let total = sanitized.chars().count();
    if total <= head_chars.saturating_add(tail_chars).saturating_add(3) {
        return sanitized;
    }
    let head = sanitized.chars().take(head_chars).collect::<String>();
    let tail = sanitized
        .chars()
        .skip(total.saturating_sub(tail_chars))
        .collect::<String>();
    format!("{head} … {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::AuthorizedScope;
    use gate_core::ChangesetId;

    fn name(raw: &str) -> ValidatorName {
        ValidatorName::try_new(raw).unwrap()
    }

    fn context() -> InputContext {
        InputContext {
            changeset_id: ChangesetId::try_new("cs-1").unwrap(),
            validator: name("lint"),
            attempt_number: 1,
            authorized_scope: AuthorizedScope::new(["src/"]),
            prior_issues: Vec::new(),
        }
    }

    #[test]
    fn gate_flags_follow_configured_args() {
        let dispatcher = CommandDispatcher::new("worker").with_args(["exec", "--json"]);
        assert_eq!(
            dispatcher.dispatch_args(&name("lint")),
            vec!["exec", "--json", "--validator", "lint"]
        );
        assert_eq!(
            dispatcher.resume_args(&SessionHandle::new("s-9", 0)),
            vec!["exec", "--json", "--resume", "s-9"]
        );
    }

    #[test]
    fn stdout_must_hold_json() {
        assert!(matches!(parse_stdout(b"  \n"), Err(DispatchError::Output(_))));
        assert!(matches!(parse_stdout(b"not json"), Err(DispatchError::Output(_))));
        assert!(parse_stdout(b"{\"ok\":true}\n").is_ok());
    }

    #[test]
    fn resumed_session_is_kept_when_worker_omits_it() {
        let resumed = SessionHandle::new("s-1", 42);
        let out = into_worker_output(serde_json::json!({"all_checks_passed": true}), Some(&resumed));
        assert_eq!(out.session, Some(resumed));
    }

    #[test]
    fn stderr_snippet_keeps_head_and_tail() {
        let long = "x".repeat(50) + &"y".repeat(50);
        let snippet = stderr_snippet(long.as_bytes(), 5, 5);
        assert_eq!(snippet, "xxxxx … yyyyy");
        assert_eq!(stderr_snippet(b"  \n ", 5, 5), "-");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_worker_round_trip() {
        let script = r#"cat >/dev/null; printf '%s' '{"session_id":"sh-1","structured_output":{"all_checks_passed":true,"blocking_issues":[],"pre_work_validation_passed":true,"files_modified":[]}}'"#;
        let dispatcher = CommandDispatcher::new("sh").with_args(["-c", script]);
        let out = dispatcher
            .dispatch(&name("lint"), &context())
            .await
            .expect("worker output");
        assert_eq!(out.session.map(|s| s.session_id), Some("sh-1".to_string()));
        assert_eq!(
            out.raw.as_value().get("all_checks_passed"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_worker_reports_exit_status() {
        let dispatcher =
            CommandDispatcher::new("sh").with_args(["-c", "cat >/dev/null; echo boom >&2; exit 3"]);
        let err = dispatcher
            .dispatch(&name("lint"), &context())
            .await
            .expect_err("non-zero exit");
        match err {
            DispatchError::Exit { status, stderr } => {
                assert_eq!(status, "3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dispatcher = CommandDispatcher::new("/nonexistent/gate-worker-binary");
        let err = dispatcher
            .dispatch(&name("lint"), &context())
            .await
            .expect_err("spawn failure");
        assert!(matches!(err, DispatchError::Spawn { .. }));
    }
}
