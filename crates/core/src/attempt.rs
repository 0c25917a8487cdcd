#![forbid(unsafe_code)]

use crate::contract::{ContractVerdict, GateResult, MalformedContract, RedFlag};
use crate::ids::{ChangesetId, ValidatorName};
use crate::profile::ValidatorSpec;
use serde::{Deserialize, Serialize};

/// Resumable worker session returned by a dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub issued_at_ms: i64,
}

impl SessionHandle {
    pub fn new(session_id: impl Into<String>, issued_at_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            issued_at_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Escalated,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Escalated)
    }
}

/// Why an attempt did not pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    ChecksFailed,
    MalformedContract(MalformedContract),
    RedFlagContradiction { flags: Vec<RedFlag> },
    DispatchUnavailable { detail: String },
    CancellationRequested,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ChecksFailed => "checks failed",
            Self::MalformedContract(_) => "malformed contract",
            Self::RedFlagContradiction { .. } => "red flag contradiction",
            Self::DispatchUnavailable { .. } => "dispatch failure",
            Self::CancellationRequested => "cancelled",
        }
    }

    /// Classify a contract verdict; `None` when it passed.
    pub fn from_verdict(verdict: &ContractVerdict) -> Option<Self> {
        match verdict {
            ContractVerdict::Malformed(m) => Some(Self::MalformedContract(m.clone())),
            ContractVerdict::Valid(result) if result.all_checks_passed => None,
            ContractVerdict::Valid(result) if result.is_contradiction() => {
                Some(Self::RedFlagContradiction {
                    flags: result.red_flags.clone(),
                })
            }
            ContractVerdict::Valid(_) => Some(Self::ChecksFailed),
        }
    }
}

/// One dispatch of one validator within a run. Never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateAttempt {
    pub validator: ValidatorSpec,
    pub attempt_number: u32,
    pub resumed: bool,
    pub session: Option<SessionHandle>,
    pub result: Option<GateResult>,
    pub failure: Option<FailureReason>,
    pub status: AttemptStatus,
}

impl GateAttempt {
    pub fn new(validator: ValidatorSpec, attempt_number: u32) -> Self {
        Self {
            validator,
            attempt_number,
            resumed: false,
            session: None,
            result: None,
            failure: None,
            status: AttemptStatus::Pending,
        }
    }

    pub fn name(&self) -> &ValidatorName {
        &self.validator.name
    }

    pub fn passed(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|result| result.all_checks_passed)
    }

    pub fn is_last_allowed(&self) -> bool {
        self.attempt_number >= self.validator.max_attempts
    }

    /// Issues a reviewer needs to act on this attempt.
    pub fn blocking_issues(&self) -> Vec<String> {
        let mut issues = self
            .result
            .as_ref()
            .map(|result| result.blocking_issues.clone())
            .unwrap_or_default();
        match &self.failure {
            Some(FailureReason::MalformedContract(m)) => issues.push(m.issue()),
            Some(FailureReason::CancellationRequested) => issues.push("cancelled".to_string()),
            Some(FailureReason::DispatchUnavailable { detail }) if self.result.is_none() => {
                issues.push(format!("dispatch failure: {detail}"))
            }
            _ => {}
        }
        issues
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// Never produced by the engine; reserved for callers recording a
    /// rejection that did not go through escalation.
    Failed,
    Escalated,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

/// Engine state machine. `AllPassed` and `Escalated` are terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    BlockingRunning { validator: ValidatorName },
    BlockingFailed { validator: ValidatorName, attempt: u32 },
    BlockingPassed,
    ParallelRunning,
    AllPassed,
    Escalated,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllPassed | Self::Escalated)
    }

    pub fn can_transition_to(&self, next: &EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Idle, BlockingRunning { .. }) | (Idle, BlockingPassed) | (Idle, Escalated) => true,
            (BlockingRunning { validator: a }, BlockingFailed { validator: b, .. }) => a == b,
            (BlockingRunning { validator: a }, BlockingRunning { validator: b }) => a != b,
            (BlockingRunning { .. }, BlockingPassed) | (BlockingRunning { .. }, Escalated) => true,
            (BlockingFailed { validator: a, .. }, BlockingRunning { validator: b }) => a == b,
            (BlockingFailed { .. }, Escalated) => true,
            (BlockingPassed, ParallelRunning) | (BlockingPassed, AllPassed) => true,
            (BlockingPassed, Escalated) => true,
            (ParallelRunning, AllPassed) | (ParallelRunning, Escalated) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationCause {
    RetryBudgetExhausted { validators: Vec<ValidatorName> },
    CancellationRequested,
}

/// Terminal output of one run over a changeset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub changeset_id: ChangesetId,
    pub outcome: Outcome,
    pub attempts: Vec<GateAttempt>,
    pub blocking_issues_summary: Vec<String>,
    pub escalation: Option<EscalationCause>,
    pub profile_fingerprint: String,
    pub state_trail: Vec<EngineState>,
}

impl Decision {
    pub fn attempts_for<'a>(
        &'a self,
        name: &'a ValidatorName,
    ) -> impl Iterator<Item = &'a GateAttempt> + 'a {
        self.attempts.iter().filter(move |attempt| attempt.name() == name)
    }

    pub fn final_state(&self) -> Option<&EngineState> {
        self.state_trail.last()
    }
}

/// `"<validator>: <issue>"` lines for every escalated attempt, in attempt order.
pub fn summarize_escalations(attempts: &[GateAttempt]) -> Vec<String> {
    attempts
        .iter()
        .filter(|attempt| attempt.status == AttemptStatus::Escalated)
        .flat_map(|attempt| {
            let name = attempt.name().clone();
            attempt
                .blocking_issues()
                .into_iter()
                .map(move |issue| format!("{name}: {issue}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: &str) -> ValidatorName {
        ValidatorName::try_new(raw).unwrap()
    }

    #[test]
    fn state_machine_rejects_parallel_before_blocking_passes() {
        let running = EngineState::BlockingRunning {
            validator: name("t1"),
        };
        assert!(!running.can_transition_to(&EngineState::ParallelRunning));
        assert!(!EngineState::Idle.can_transition_to(&EngineState::ParallelRunning));
        assert!(EngineState::BlockingPassed.can_transition_to(&EngineState::ParallelRunning));
        assert!(!EngineState::AllPassed.can_transition_to(&EngineState::Escalated));
    }

    #[test]
    fn blocking_retry_loops_stay_on_the_same_validator() {
        let failed = EngineState::BlockingFailed {
            validator: name("t1"),
            attempt: 1,
        };
        assert!(failed.can_transition_to(&EngineState::BlockingRunning {
            validator: name("t1")
        }));
        assert!(!failed.can_transition_to(&EngineState::BlockingRunning {
            validator: name("t2")
        }));
    }

    #[test]
    fn summary_attributes_issues_to_escalated_validators_only() {
        let spec = ValidatorSpec::new(name("lint"), 1);
        let mut escalated = GateAttempt::new(spec.clone(), 1);
        escalated.status = AttemptStatus::Escalated;
        escalated.failure = Some(FailureReason::DispatchUnavailable {
            detail: "worker offline".to_string(),
        });
        let mut passed = GateAttempt::new(ValidatorSpec::new(name("review"), 1), 1);
        passed.status = AttemptStatus::Passed;

        assert_eq!(
            summarize_escalations(&[escalated, passed]),
            vec!["lint: dispatch failure: worker offline"]
        );
    }

    #[test]
    fn statuses_round_trip_through_their_labels() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::Running,
            AttemptStatus::Passed,
            AttemptStatus::Failed,
            AttemptStatus::Escalated,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Outcome::parse("escalated"), Some(Outcome::Escalated));
        assert_eq!(Outcome::parse("nope"), None);
    }
}
