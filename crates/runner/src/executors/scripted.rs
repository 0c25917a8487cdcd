#![forbid(unsafe_code)]

use super::{extract_session, unwrap_structured_output};
use crate::dispatch::{DispatchError, Dispatcher, InputContext, WorkerOutput};
use async_trait::async_trait;
use gate_core::clock::now_ms;
use gate_core::{SessionHandle, ValidatorName};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// One canned worker reply.
#[derive(Clone, Debug)]
pub struct ScriptedStep {
    reply: Result<Value, String>,
    session: Option<SessionHandle>,
    delay: Option<Duration>,
}

impl ScriptedStep {
    pub fn report(value: Value) -> Self {
        Self {
            reply: Ok(value),
            session: None,
            delay: None,
        }
    }

    pub fn pass() -> Self {
        Self::report(passing_report())
    }

    pub fn fail(issues: &[&str]) -> Self {
        Self::report(failing_report(issues))
    }

    /// The worker could not be reached at all.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            reply: Err(detail.into()),
            session: None,
            delay: None,
        }
    }

    pub fn with_session(self, session_id: &str) -> Self {
        self.with_session_at(session_id, now_ms())
    }

    pub fn with_session_at(mut self, session_id: &str, issued_at_ms: i64) -> Self {
        self.session = Some(SessionHandle::new(session_id, issued_at_ms));
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedCall {
    Dispatch {
        validator: ValidatorName,
        attempt_number: u32,
        prior_issues: Vec<String>,
    },
    Resume {
        validator: ValidatorName,
        session_id: String,
        supplemental: String,
    },
}

impl ScriptedCall {
    pub fn validator(&self) -> &ValidatorName {
        match self {
            Self::Dispatch { validator, .. } | Self::Resume { validator, .. } => validator,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    queues: BTreeMap<ValidatorName, VecDeque<ScriptedStep>>,
    sessions: HashMap<String, ValidatorName>,
    calls: Vec<ScriptedCall>,
}

/// In-memory dispatcher replaying per-validator queues of canned replies.
///
/// Dispatch and resume both pop from the validator's queue; resume finds the
/// validator through the session ids this dispatcher handed out earlier.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    state: Mutex<ScriptState>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<I>(self, validator: &str, steps: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = ScriptedStep>,
    {
        let name = ValidatorName::try_new(validator).map_err(|e| e.message())?;
        let mut state = self.state.into_inner();
        state.queues.entry(name).or_default().extend(steps);
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Every call received so far, in arrival order.
    pub async fn calls(&self) -> Vec<ScriptedCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_for(&self, validator: &str) -> Vec<ScriptedCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|call| call.validator().as_str() == validator)
            .collect()
    }

    pub async fn remaining(&self, validator: &str) -> usize {
        let state = self.state.lock().await;
        state
            .queues
            .iter()
            .find(|(name, _)| name.as_str() == validator)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0)
    }

    async fn take(&self, validator: &ValidatorName, call: ScriptedCall) -> Result<ScriptedStep, DispatchError> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        let step = state
            .queues
            .get_mut(validator)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| DispatchError::Unavailable(format!("no scripted reply left for `{validator}`")))?;
        if let Some(session) = &step.session {
            state
                .sessions
                .insert(session.session_id.clone(), validator.clone());
        }
        Ok(step)
    }

    async fn play(step: ScriptedStep, resumed: Option<&SessionHandle>) -> Result<WorkerOutput, DispatchError> {
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        let value = step.reply.map_err(DispatchError::Unavailable)?;
        let session = step
            .session
            .or_else(|| extract_session(&value, now_ms()))
            .or_else(|| resumed.cloned());
        Ok(WorkerOutput {
            raw: unwrap_structured_output(value),
            session,
        })
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        validator: &ValidatorName,
        context: &InputContext,
    ) -> Result<WorkerOutput, DispatchError> {
        let call = ScriptedCall::Dispatch {
            validator: validator.clone(),
            attempt_number: context.attempt_number,
            prior_issues: context.prior_issues.clone(),
        };
        let step = self.take(validator, call).await?;
        Self::play(step, None).await
    }

    async fn resume(
        &self,
        session: &SessionHandle,
        supplemental: &str,
    ) -> Result<WorkerOutput, DispatchError> {
        let validator = self
            .state
            .lock()
            .await
            .sessions
            .get(&session.session_id)
            .cloned()
            .ok_or_else(|| DispatchError::Unavailable(format!("unknown session `{}`", session.session_id)))?;
        let call = ScriptedCall::Resume {
            validator: validator.clone(),
            session_id: session.session_id.clone(),
            supplemental: supplemental.to_string(),
        };
        let step = self.take(&validator, call).await?;
        Self::play(step, Some(session)).await
    }
}

pub fn passing_report() -> Value {
    json!({
        "all_checks_passed": true,
        "blocking_issues": [],
        "pre_work_validation_passed": true,
        "files_modified": [],
        "commands_executed": ["cargo test --workspace"],
        "failure_count": 0,
        "summary": "all checks passed"
    })
}

pub fn failing_report(issues: &[&str]) -> Value {
    json!({
        "all_checks_passed": false,
        "blocking_issues": issues,
        "pre_work_validation_passed": true,
        "files_modified": [],
        "commands_executed": ["cargo test --workspace"],
        "failure_count": issues.len()
    })
}
