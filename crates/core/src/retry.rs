#![forbid(unsafe_code)]

use crate::attempt::{GateAttempt, SessionHandle};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_TTL_MS: u64 = 30 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextAction {
    /// The attempt passed; the validator is done.
    Done,
    /// Continue the failed attempt's live session.
    Retry(SessionHandle),
    /// Relaunch from scratch.
    RedeployFresh,
    /// Budget exhausted while still failing.
    Escalate,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Retry(_) => "retry",
            Self::RedeployFresh => "redeploy_fresh",
            Self::Escalate => "escalate",
        }
    }
}

/// Pure retry decision point, shared across runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Sessions older than this are treated as stale. `0` disables staleness.
    pub session_ttl_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(session_ttl_ms: u64) -> Self {
        Self { session_ttl_ms }
    }

    pub fn is_stale(&self, session: &SessionHandle, now_ms: i64) -> bool {
        if self.session_ttl_ms == 0 {
            return false;
        }
        let age = now_ms.saturating_sub(session.issued_at_ms);
        age < 0 || age as u64 > self.session_ttl_ms
    }

    pub fn next_action(&self, attempt: &GateAttempt, now_ms: i64) -> NextAction {
        if attempt.passed() {
            return NextAction::Done;
        }
        if attempt.is_last_allowed() {
            return NextAction::Escalate;
        }
        match attempt.session.as_ref() {
            Some(session) if !self.is_stale(session, now_ms) => NextAction::Retry(session.clone()),
            _ => NextAction::RedeployFresh,
        }
    }
}
