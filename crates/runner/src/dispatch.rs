#![forbid(unsafe_code)]

//! The seam between the engine and whatever actually runs a validator.

use async_trait::async_trait;
use gate_core::{AuthorizedScope, ChangesetId, RawWorkerOutput, SessionHandle, ValidatorName};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Everything a fresh dispatch is told about the attempt it serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputContext {
    pub changeset_id: ChangesetId,
    pub validator: ValidatorName,
    pub attempt_number: u32,
    pub authorized_scope: AuthorizedScope,
    /// Blocking issues left by the previous attempt, already bounded.
    pub prior_issues: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerOutput {
    pub raw: RawWorkerOutput,
    pub session: Option<SessionHandle>,
}

impl WorkerOutput {
    pub fn new(raw: RawWorkerOutput) -> Self {
        Self { raw, session: None }
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to spawn worker `{bin}`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker exited with status {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("worker output unreadable: {0}")]
    Output(String),
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("worker unavailable: {0}")]
    Unavailable(String),
}

/// Launches and resumes validator workers.
///
/// Implementations must be shareable across concurrent runs; the engine
/// calls them from several parallel validator loops at once.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        validator: &ValidatorName,
        context: &InputContext,
    ) -> Result<WorkerOutput, DispatchError>;

    async fn resume(
        &self,
        session: &SessionHandle,
        supplemental: &str,
    ) -> Result<WorkerOutput, DispatchError>;
}
