#![forbid(unsafe_code)]

//! Two-stage gate run: blocking validators one after another, then the
//! parallel validators fanned out together.

use crate::cancel::CancelSignal;
use crate::context::{bounded_issues, supplemental_context};
use crate::dispatch::{DispatchError, Dispatcher, InputContext, WorkerOutput};
use futures_util::future::join_all;
use gate_core::clock::now_ms;
use gate_core::{
    AttemptStatus, ContractValidator, ContractVerdict, Decision, EngineState, EscalationCause,
    FailureReason, GateAttempt, GateError, GateRequest, GateResult, NextAction, Outcome,
    ProfileRegistry, ProfileResolver, ResolvedProfile, RetryPolicy, SessionHandle, ValidatorName,
    ValidatorSpec, summarize_escalations,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on a single dispatch or resume. Exceeding it is a dispatch failure.
    pub attempt_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

pub struct GateEngine {
    resolver: ProfileResolver,
    dispatcher: Arc<dyn Dispatcher>,
    contract: ContractValidator,
    config: EngineConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Blocking,
    Parallel,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Parallel => "parallel",
        }
    }
}

enum Launch {
    Fresh,
    Resume(SessionHandle),
}

impl Launch {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "dispatch",
            Self::Resume(_) => "resume",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settled {
    Passed,
    Exhausted,
    Cancelled,
}

struct ValidatorRun {
    name: ValidatorName,
    attempts: Vec<GateAttempt>,
    settled: Settled,
}

struct StateTrail {
    states: Vec<EngineState>,
}

impl StateTrail {
    fn new() -> Self {
        Self {
            states: vec![EngineState::Idle],
        }
    }

    // Never empty: starts at `Idle` and only grows.
    fn current(&self) -> &EngineState {
        &self.states[self.states.len() - 1]
    }

    fn advance(&mut self, next: EngineState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(&next),
            "illegal gate transition {current:?} -> {next:?}"
        );
        debug!(from = ?current, to = ?next, "state transition");
        self.states.push(next);
    }
}

impl GateEngine {
    pub fn new(
        registry: Arc<ProfileRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver: ProfileResolver::new(registry),
            dispatcher,
            contract: ContractValidator::new(),
            config,
        }
    }

    pub fn resolver(&self) -> &ProfileResolver {
        &self.resolver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run(&self, request: &GateRequest) -> Result<Decision, GateError> {
        self.run_with_cancel(request, CancelSignal::never()).await
    }

    /// Validator failures come back inside the `Decision`; `Err` is reserved
    /// for configuration problems no retry can fix.
    pub async fn run_with_cancel(
        &self,
        request: &GateRequest,
        cancel: CancelSignal,
    ) -> Result<Decision, GateError> {
        let profile = self.resolver.resolve(&request.work_types)?;
        let fingerprint = profile.fingerprint();
        let span = info_span!(
            "gate_run",
            changeset = %request.changeset_id,
            profile = %fingerprint
        );
        Ok(self
            .drive(request, &profile, fingerprint, &cancel)
            .instrument(span)
            .await)
    }

    async fn drive(
        &self,
        request: &GateRequest,
        profile: &ResolvedProfile,
        fingerprint: String,
        cancel: &CancelSignal,
    ) -> Decision {
        info!(
            blocking = profile.blocking.len(),
            parallel = profile.parallel.len(),
            "gate run started"
        );
        let mut trail = StateTrail::new();
        let mut runs = Vec::new();

        for spec in &profile.blocking {
            if cancel.is_cancelled() {
                warn!(validator = %spec.name, "cancelled before blocking validator started");
                trail.advance(EngineState::Escalated);
                return self.finish(request, fingerprint, trail, runs);
            }
            trail.advance(EngineState::BlockingRunning {
                validator: spec.name.clone(),
            });
            let run = self
                .drive_validator(request, spec, Stage::Blocking, cancel, Some(&mut trail))
                .await;
            let settled = run.settled;
            runs.push(run);
            if settled != Settled::Passed {
                warn!(validator = %spec.name, ?settled, "blocking validator escalated; parallel stage skipped");
                trail.advance(EngineState::Escalated);
                return self.finish(request, fingerprint, trail, runs);
            }
        }
        trail.advance(EngineState::BlockingPassed);

        if profile.parallel.is_empty() {
            trail.advance(EngineState::AllPassed);
            return self.finish(request, fingerprint, trail, runs);
        }
        if cancel.is_cancelled() {
            warn!("cancelled before parallel stage started");
            trail.advance(EngineState::Escalated);
            return self.finish(request, fingerprint, trail, runs);
        }

        trail.advance(EngineState::ParallelRunning);
        let parallel = join_all(
            profile
                .parallel
                .iter()
                .map(|spec| self.drive_validator(request, spec, Stage::Parallel, cancel, None)),
        )
        .await;
        let all_passed = parallel.iter().all(|run| run.settled == Settled::Passed);
        runs.extend(parallel);
        trail.advance(if all_passed {
            EngineState::AllPassed
        } else {
            EngineState::Escalated
        });
        self.finish(request, fingerprint, trail, runs)
    }

    /// One validator's attempt loop. Blocking runs pass the trail so each
    /// failed attempt is visible as `BlockingFailed`.
    async fn drive_validator(
        &self,
        request: &GateRequest,
        spec: &ValidatorSpec,
        stage: Stage,
        cancel: &CancelSignal,
        mut trail: Option<&mut StateTrail>,
    ) -> ValidatorRun {
        let mut attempts: Vec<GateAttempt> = Vec::new();
        let mut launch = Launch::Fresh;
        let mut attempt_number = 1u32;

        loop {
            let prior_issues = attempts
                .last()
                .map(GateAttempt::blocking_issues)
                .unwrap_or_default();
            let mut attempt = self
                .attempt_once(request, spec, attempt_number, &launch, stage, cancel, prior_issues)
                .await;

            if matches!(attempt.failure, Some(FailureReason::CancellationRequested)) {
                attempt.status = AttemptStatus::Escalated;
                attempts.push(attempt);
                return ValidatorRun {
                    name: spec.name.clone(),
                    attempts,
                    settled: Settled::Cancelled,
                };
            }

            let action = self.config.retry.next_action(&attempt, now_ms());
            let action_label = action.as_str();
            let settled = match action {
                NextAction::Done => {
                    attempt.status = AttemptStatus::Passed;
                    Some(Settled::Passed)
                }
                NextAction::Escalate => {
                    attempt.status = AttemptStatus::Escalated;
                    Some(Settled::Exhausted)
                }
                // Already-finished attempts drain, but no new retry starts.
                _ if cancel.is_cancelled() => {
                    attempt.status = AttemptStatus::Escalated;
                    Some(Settled::Cancelled)
                }
                NextAction::Retry(session) => {
                    attempt.status = AttemptStatus::Failed;
                    launch = Launch::Resume(session);
                    None
                }
                NextAction::RedeployFresh => {
                    attempt.status = AttemptStatus::Failed;
                    launch = Launch::Fresh;
                    None
                }
            };
            info!(
                validator = %spec.name,
                attempt = attempt_number,
                stage = stage.as_str(),
                action = action_label,
                status = attempt.status.as_str(),
                "attempt settled"
            );
            if settled.is_none()
                && let Some(trail) = trail.as_deref_mut()
            {
                trail.advance(EngineState::BlockingFailed {
                    validator: spec.name.clone(),
                    attempt: attempt_number,
                });
                trail.advance(EngineState::BlockingRunning {
                    validator: spec.name.clone(),
                });
            }
            attempts.push(attempt);

            if let Some(settled) = settled {
                if settled != Settled::Passed {
                    warn!(validator = %spec.name, attempts = attempt_number, ?settled, "validator escalated");
                }
                return ValidatorRun {
                    name: spec.name.clone(),
                    attempts,
                    settled,
                };
            }
            attempt_number += 1;
        }
    }

    async fn attempt_once(
        &self,
        request: &GateRequest,
        spec: &ValidatorSpec,
        attempt_number: u32,
        launch: &Launch,
        stage: Stage,
        cancel: &CancelSignal,
        prior_issues: Vec<String>,
    ) -> GateAttempt {
        let mut attempt = GateAttempt::new(spec.clone(), attempt_number);
        attempt.status = AttemptStatus::Running;
        attempt.resumed = matches!(launch, Launch::Resume(_));
        info!(
            validator = %spec.name,
            attempt = attempt_number,
            stage = stage.as_str(),
            action = launch.as_str(),
            "dispatching validator"
        );

        let call = self.call_worker(request, spec, attempt_number, launch, prior_issues);
        let outcome = match stage {
            // Blocking work in flight is abandoned on cancel; dropping the
            // future kills a spawned worker.
            Stage::Blocking => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = call => Some(outcome),
            },
            Stage::Parallel => Some(call.await),
        };

        match outcome {
            None => {
                warn!(validator = %spec.name, attempt = attempt_number, "attempt cancelled in flight");
                attempt.failure = Some(FailureReason::CancellationRequested);
            }
            Some(Err(err)) => {
                let detail = err.to_string();
                warn!(validator = %spec.name, attempt = attempt_number, %detail, "dispatch failed");
                attempt.result = Some(GateResult::dispatch_failure(
                    &detail,
                    &request.authorized_scope,
                ));
                attempt.failure = Some(FailureReason::DispatchUnavailable { detail });
            }
            Some(Ok(WorkerOutput { raw, session })) => {
                attempt.session = session;
                let verdict = self.contract.validate(&raw, &request.authorized_scope, spec);
                attempt.failure = FailureReason::from_verdict(&verdict);
                match &verdict {
                    ContractVerdict::Valid(result) => info!(
                        validator = %spec.name,
                        attempt = attempt_number,
                        passed = result.all_checks_passed,
                        claimed_pass = result.claimed_pass,
                        red_flags = result.red_flags.len(),
                        "verdict"
                    ),
                    ContractVerdict::Malformed(malformed) => warn!(
                        validator = %spec.name,
                        attempt = attempt_number,
                        detail = %malformed,
                        "malformed contract"
                    ),
                }
                attempt.result = match verdict {
                    ContractVerdict::Valid(result) => Some(result),
                    ContractVerdict::Malformed(_) => None,
                };
            }
        }
        attempt
    }

    async fn call_worker(
        &self,
        request: &GateRequest,
        spec: &ValidatorSpec,
        attempt_number: u32,
        launch: &Launch,
        prior_issues: Vec<String>,
    ) -> Result<WorkerOutput, DispatchError> {
        let call = async move {
            match launch {
                Launch::Fresh => {
                    let context = InputContext {
                        changeset_id: request.changeset_id.clone(),
                        validator: spec.name.clone(),
                        attempt_number,
                        authorized_scope: request.authorized_scope.clone(),
                        prior_issues: bounded_issues(&prior_issues),
                    };
                    self.dispatcher.dispatch(&spec.name, &context).await
                }
                Launch::Resume(session) => {
                    let text = supplemental_context(
                        &request.changeset_id,
                        spec,
                        attempt_number,
                        &prior_issues,
                    );
                    self.dispatcher.resume(session, &text).await
                }
            }
        };
        match self.config.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(DispatchError::TimedOut(limit))),
            None => call.await,
        }
    }

    fn finish(
        &self,
        request: &GateRequest,
        profile_fingerprint: String,
        trail: StateTrail,
        runs: Vec<ValidatorRun>,
    ) -> Decision {
        let passed = matches!(trail.current(), EngineState::AllPassed);
        let exhausted = runs
            .iter()
            .filter(|run| run.settled == Settled::Exhausted)
            .map(|run| run.name.clone())
            .collect::<Vec<_>>();
        let attempts = runs
            .into_iter()
            .flat_map(|run| run.attempts)
            .collect::<Vec<_>>();

        let escalation = if passed {
            None
        } else if !exhausted.is_empty() {
            Some(EscalationCause::RetryBudgetExhausted {
                validators: exhausted,
            })
        } else {
            Some(EscalationCause::CancellationRequested)
        };
        let mut blocking_issues_summary = summarize_escalations(&attempts);
        if blocking_issues_summary.is_empty()
            && matches!(escalation, Some(EscalationCause::CancellationRequested))
        {
            blocking_issues_summary.push("run cancelled before every validator passed".to_string());
        }

        let outcome = if passed {
            Outcome::Passed
        } else {
            Outcome::Escalated
        };
        info!(
            outcome = outcome.as_str(),
            attempts = attempts.len(),
            issues = blocking_issues_summary.len(),
            "gate run finished"
        );
        Decision {
            changeset_id: request.changeset_id.clone(),
            outcome,
            attempts,
            blocking_issues_summary,
            escalation,
            profile_fingerprint,
            state_trail: trail.states,
        }
    }
}
