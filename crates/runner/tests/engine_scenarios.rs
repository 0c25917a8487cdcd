#![forbid(unsafe_code)]

use gate_core::{
    AttemptStatus, AuthorizedScope, ChangesetId, Decision, EngineState, EscalationCause,
    FailureReason, GateError, GateRequest, Outcome, ProfileRegistry, RedFlag, RetryPolicy,
    ValidatorName, WorkType,
};
use gate_runner::cancel;
use gate_runner::executors::scripted::passing_report;
use gate_runner::executors::{ScriptedCall, ScriptedDispatcher, ScriptedStep};
use gate_runner::{EngineConfig, GateEngine};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn name(raw: &str) -> ValidatorName {
    ValidatorName::try_new(raw).expect("validator name")
}

fn registry(yaml: &str) -> Arc<ProfileRegistry> {
    Arc::new(ProfileRegistry::from_yaml_str(yaml).expect("registry"))
}

fn request(work_types: &[&str]) -> GateRequest {
    GateRequest::new(
        ChangesetId::try_new("cs-42").expect("changeset"),
        work_types
            .iter()
            .map(|wt| WorkType::try_new(*wt).expect("work type")),
        AuthorizedScope::new(["src/", "Cargo.toml"]),
    )
}

fn engine_with(
    yaml: &str,
    dispatcher: Arc<ScriptedDispatcher>,
    config: EngineConfig,
) -> GateEngine {
    GateEngine::new(registry(yaml), dispatcher, config)
}

fn numbers(decision: &Decision, validator: &str) -> Vec<u32> {
    decision
        .attempts_for(&name(validator))
        .map(|attempt| attempt.attempt_number)
        .collect()
}

const SINGLE_X: &str = r#"
profiles:
  - work_type: x
    blocking: { name: t1, max_attempts: 3 }
    parallel:
      - { name: v1, max_attempts: 1 }
      - { name: v2, max_attempts: 1 }
"#;

#[tokio::test]
async fn blocking_recovers_then_parallel_passes() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "t1",
                [
                    ScriptedStep::fail(&["test_login failed"]),
                    ScriptedStep::fail(&["test_logout failed"]),
                    ScriptedStep::pass(),
                ],
            )
            .and_then(|d| d.script("v1", [ScriptedStep::pass()]))
            .and_then(|d| d.script("v2", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = engine_with(SINGLE_X, dispatcher.clone(), EngineConfig::default());

    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert_eq!(decision.escalation, None);
    assert!(decision.blocking_issues_summary.is_empty());
    assert_eq!(numbers(&decision, "t1"), vec![1, 2, 3]);
    assert_eq!(numbers(&decision, "v1"), vec![1]);
    assert_eq!(numbers(&decision, "v2"), vec![1]);
    let statuses = decision
        .attempts_for(&name("t1"))
        .map(|a| a.status)
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![AttemptStatus::Failed, AttemptStatus::Failed, AttemptStatus::Passed]
    );
    assert_eq!(decision.final_state(), Some(&EngineState::AllPassed));
    assert_eq!(dispatcher.calls().await.len(), 5);
}

#[tokio::test]
async fn shared_parallel_validator_is_dispatched_once() {
    let yaml = r#"
profiles:
  - work_type: x
    parallel:
      - { name: v1, max_attempts: 1 }
  - work_type: y
    parallel:
      - { name: v1, max_attempts: 2 }
      - { name: v2, max_attempts: 1 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("v1", [ScriptedStep::pass(), ScriptedStep::pass()])
            .and_then(|d| d.script("v2", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = engine_with(yaml, dispatcher.clone(), EngineConfig::default());

    let resolved = engine
        .resolver()
        .resolve(&request(&["x", "y"]).work_types)
        .expect("resolve");
    let parallel = resolved
        .parallel_names()
        .into_iter()
        .map(|n| n.as_str().to_string())
        .collect::<Vec<_>>();
    assert_eq!(parallel, vec!["v1", "v2"]);
    assert_eq!(resolved.spec(&name("v1")).map(|s| s.max_attempts), Some(2));

    let decision = engine.run(&request(&["x", "y"])).await.expect("decision");
    assert_eq!(decision.outcome, Outcome::Passed);
    assert_eq!(dispatcher.calls_for("v1").await.len(), 1);
    assert_eq!(dispatcher.remaining("v1").await, 1);
}

#[tokio::test]
async fn exhausted_blocking_validator_never_starts_parallel_stage() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("t1", (0..3).map(|_| ScriptedStep::fail(&["integration suite red"])))
            .and_then(|d| d.script("v1", [ScriptedStep::pass()]))
            .and_then(|d| d.script("v2", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = engine_with(SINGLE_X, dispatcher.clone(), EngineConfig::default());

    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Escalated);
    assert_eq!(numbers(&decision, "t1"), vec![1, 2, 3]);
    assert!(numbers(&decision, "v1").is_empty());
    assert!(numbers(&decision, "v2").is_empty());
    assert!(dispatcher.calls_for("v1").await.is_empty());
    assert!(dispatcher.calls_for("v2").await.is_empty());
    assert_eq!(
        decision.escalation,
        Some(EscalationCause::RetryBudgetExhausted {
            validators: vec![name("t1")]
        })
    );
    assert_eq!(
        decision.blocking_issues_summary,
        vec!["t1: integration suite red"]
    );
    assert!(!decision
        .state_trail
        .iter()
        .any(|s| *s == EngineState::ParallelRunning));
}

#[tokio::test]
async fn out_of_scope_edit_forces_failure_and_consumes_an_attempt() {
    let yaml = r#"
profiles:
  - work_type: x
    parallel:
      - { name: v1, max_attempts: 2 }
"#;
    let mut sneaky = passing_report();
    sneaky["files_modified"] = json!(["src/lib.rs", "config/secrets.env"]);
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("v1", [ScriptedStep::report(sneaky), ScriptedStep::pass()])
            .expect("script"),
    );
    let engine = engine_with(yaml, dispatcher, EngineConfig::default());

    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert_eq!(numbers(&decision, "v1"), vec![1, 2]);
    let first = &decision.attempts[0];
    assert_eq!(first.status, AttemptStatus::Failed);
    let result = first.result.as_ref().expect("result");
    assert!(result.claimed_pass);
    assert!(!result.all_checks_passed);
    assert_eq!(
        first.failure,
        Some(FailureReason::RedFlagContradiction {
            flags: vec![RedFlag::ScopeViolation {
                paths: vec!["config/secrets.env".to_string()]
            }]
        })
    );
    assert!(result
        .blocking_issues
        .iter()
        .any(|issue| issue.starts_with("scope violation")));
}

#[tokio::test]
async fn second_blocking_family_escalating_stops_the_run() {
    let yaml = r#"
profiles:
  - work_type: backend
    blocking: { name: t1, max_attempts: 2 }
    parallel:
      - { name: v1, max_attempts: 1 }
  - work_type: migrations
    blocking: { name: t2, max_attempts: 2 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("t1", [ScriptedStep::pass()])
            .and_then(|d| {
                d.script(
                    "t2",
                    [
                        ScriptedStep::fail(&["migration 0042 irreversible"]),
                        ScriptedStep::fail(&["migration 0042 irreversible"]),
                    ],
                )
            })
            .and_then(|d| d.script("v1", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = engine_with(yaml, dispatcher.clone(), EngineConfig::default());

    let decision = engine
        .run(&request(&["migrations", "backend"]))
        .await
        .expect("decision");

    assert_eq!(decision.outcome, Outcome::Escalated);
    assert_eq!(numbers(&decision, "t1"), vec![1]);
    assert_eq!(numbers(&decision, "t2"), vec![1, 2]);
    assert!(dispatcher.calls_for("v1").await.is_empty());
    let order = dispatcher
        .calls()
        .await
        .iter()
        .map(|c| c.validator().as_str().to_string())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["t1", "t2", "t2"]);
    assert!(decision.state_trail.contains(&EngineState::BlockingRunning {
        validator: name("t2")
    }));
}

#[tokio::test]
async fn parallel_calls_only_follow_blocking_success() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("t1", [ScriptedStep::fail(&["flaky"]), ScriptedStep::pass()])
            .and_then(|d| d.script("v1", [ScriptedStep::pass()]))
            .and_then(|d| d.script("v2", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = engine_with(SINGLE_X, dispatcher.clone(), EngineConfig::default());
    let decision = engine.run(&request(&["x"])).await.expect("decision");
    assert_eq!(decision.outcome, Outcome::Passed);

    let calls = dispatcher.calls().await;
    let last_blocking = calls
        .iter()
        .rposition(|c| c.validator().as_str() == "t1")
        .expect("blocking calls");
    let first_parallel = calls
        .iter()
        .position(|c| c.validator().as_str() != "t1")
        .expect("parallel calls");
    assert!(last_blocking < first_parallel);
}

const RETRYING_T1: &str = r#"
profiles:
  - work_type: x
    blocking: { name: t1, max_attempts: 3 }
"#;

#[tokio::test]
async fn live_session_is_resumed_with_prior_issues() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "t1",
                [
                    ScriptedStep::fail(&["test_parse panicked"]).with_session("sess-live"),
                    ScriptedStep::pass(),
                ],
            )
            .expect("script"),
    );
    let engine = engine_with(RETRYING_T1, dispatcher.clone(), EngineConfig::default());
    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert!(decision.attempts[1].resumed);
    match &dispatcher.calls().await[1] {
        ScriptedCall::Resume {
            session_id,
            supplemental,
            ..
        } => {
            assert_eq!(session_id, "sess-live");
            assert!(supplemental.contains("test_parse panicked"));
            assert!(supplemental.contains("attempt 2 of 3"));
        }
        other => panic!("expected resume, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_or_missing_sessions_redeploy_fresh() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "t1",
                [
                    ScriptedStep::fail(&["boom"]).with_session_at("sess-old", 0),
                    ScriptedStep::fail(&["boom again"]),
                    ScriptedStep::pass(),
                ],
            )
            .expect("script"),
    );
    let config = EngineConfig {
        attempt_timeout: None,
        retry: RetryPolicy::new(1_000),
    };
    let engine = engine_with(RETRYING_T1, dispatcher.clone(), config);
    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert!(decision.attempts.iter().all(|a| !a.resumed));
    let calls = dispatcher.calls().await;
    assert!(calls.iter().all(|c| !c.is_resume()));
    assert_eq!(
        calls[1],
        ScriptedCall::Dispatch {
            validator: name("t1"),
            attempt_number: 2,
            prior_issues: vec!["boom".to_string()],
        }
    );
}

#[tokio::test]
async fn dispatch_and_contract_failures_consume_attempts() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "t1",
                [
                    ScriptedStep::unavailable("worker pool offline"),
                    ScriptedStep::report(json!({"verdict": "looks fine to me"})),
                    ScriptedStep::pass(),
                ],
            )
            .expect("script"),
    );
    let engine = engine_with(RETRYING_T1, dispatcher, EngineConfig::default());
    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert!(matches!(
        decision.attempts[0].failure,
        Some(FailureReason::DispatchUnavailable { .. })
    ));
    assert!(decision.attempts[0]
        .blocking_issues()
        .iter()
        .any(|i| i.contains("worker pool offline")));
    assert!(matches!(
        decision.attempts[1].failure,
        Some(FailureReason::MalformedContract(_))
    ));
    assert!(decision.attempts[1].result.is_none());
    assert_eq!(numbers(&decision, "t1"), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn slow_worker_times_out_as_dispatch_failure() {
    let yaml = r#"
profiles:
  - work_type: x
    parallel:
      - { name: v1, max_attempts: 2 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "v1",
                [
                    ScriptedStep::pass().after(Duration::from_secs(10)),
                    ScriptedStep::pass(),
                ],
            )
            .expect("script"),
    );
    let config = EngineConfig {
        attempt_timeout: Some(Duration::from_secs(1)),
        retry: RetryPolicy::default(),
    };
    let engine = engine_with(yaml, dispatcher, config);
    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Passed);
    assert_eq!(
        decision.attempts[0].failure,
        Some(FailureReason::DispatchUnavailable {
            detail: "timed out after 1000ms".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn cancelling_in_flight_blocking_validator_escalates() {
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("t1", [ScriptedStep::pass().after(Duration::from_secs(60))])
            .and_then(|d| d.script("v1", [ScriptedStep::pass()]))
            .and_then(|d| d.script("v2", [ScriptedStep::pass()]))
            .expect("script"),
    );
    let engine = Arc::new(engine_with(SINGLE_X, dispatcher.clone(), EngineConfig::default()));
    let (handle, signal) = cancel::channel();

    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_with_cancel(&request(&["x"]), signal).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.cancel();
    let decision = run.await.expect("join").expect("decision");

    assert_eq!(decision.outcome, Outcome::Escalated);
    assert_eq!(decision.escalation, Some(EscalationCause::CancellationRequested));
    assert_eq!(decision.attempts.len(), 1);
    assert_eq!(decision.attempts[0].status, AttemptStatus::Escalated);
    assert_eq!(
        decision.attempts[0].failure,
        Some(FailureReason::CancellationRequested)
    );
    assert_eq!(decision.blocking_issues_summary, vec!["t1: cancelled"]);
    assert!(dispatcher.calls_for("v1").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_parallel_stage_drains_in_flight_attempts() {
    let yaml = r#"
profiles:
  - work_type: x
    parallel:
      - { name: v1, max_attempts: 3 }
      - { name: v2, max_attempts: 1 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script(
                "v1",
                [
                    ScriptedStep::fail(&["lint errors"])
                        .with_session("v1-sess")
                        .after(Duration::from_secs(5)),
                    ScriptedStep::pass(),
                ],
            )
            .and_then(|d| d.script("v2", [ScriptedStep::pass().after(Duration::from_secs(20))]))
            .expect("script"),
    );
    let engine = Arc::new(engine_with(yaml, dispatcher.clone(), EngineConfig::default()));
    let (handle, signal) = cancel::channel();

    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_with_cancel(&request(&["x"]), signal).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
    let decision = run.await.expect("join").expect("decision");

    assert_eq!(decision.outcome, Outcome::Escalated);
    assert_eq!(decision.escalation, Some(EscalationCause::CancellationRequested));
    assert_eq!(numbers(&decision, "v1"), vec![1]);
    assert_eq!(numbers(&decision, "v2"), vec![1]);
    let v2_name = name("v2");
    let v2 = decision.attempts_for(&v2_name).next().expect("v2 attempt");
    assert_eq!(v2.status, AttemptStatus::Passed);
    assert_eq!(dispatcher.remaining("v1").await, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_parallel_validator_lets_siblings_finish() {
    let yaml = r#"
profiles:
  - work_type: x
    parallel:
      - { name: v1, max_attempts: 1 }
      - { name: v2, max_attempts: 1 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("v1", [ScriptedStep::fail(&["bad"])])
            .and_then(|d| d.script("v2", [ScriptedStep::pass().after(Duration::from_secs(10))]))
            .expect("script"),
    );
    let engine = engine_with(yaml, dispatcher.clone(), EngineConfig::default());

    let decision = engine.run(&request(&["x"])).await.expect("decision");

    assert_eq!(decision.outcome, Outcome::Escalated);
    assert_eq!(
        decision.escalation,
        Some(EscalationCause::RetryBudgetExhausted {
            validators: vec![name("v1")]
        })
    );
    assert_eq!(decision.blocking_issues_summary, vec!["v1: bad"]);
    let v1_name = name("v1");
    let v1 = decision.attempts_for(&v1_name).next().expect("v1 attempt");
    assert_eq!(v1.status, AttemptStatus::Escalated);
    let v2_name = name("v2");
    let v2 = decision.attempts_for(&v2_name).next().expect("v2 attempt");
    assert_eq!(v2.status, AttemptStatus::Passed);
    assert_eq!(dispatcher.calls_for("v2").await.len(), 1);
    assert_eq!(decision.state_trail.last(), Some(&EngineState::Escalated));
}

#[tokio::test]
async fn configuration_errors_are_returned_not_recorded() {
    let engine = engine_with(SINGLE_X, Arc::new(ScriptedDispatcher::new()), EngineConfig::default());
    assert!(matches!(
        engine.run(&request(&["unknown"])).await,
        Err(GateError::UnknownWorkType(_))
    ));
    assert!(matches!(
        engine.run(&request(&[])).await,
        Err(GateError::EmptyWorkTypes)
    ));
}

#[tokio::test]
async fn unknown_work_type_uses_fallback_profile() {
    let yaml = r#"
fallback: default
profiles:
  - work_type: default
    parallel:
      - { name: review, max_attempts: 1 }
"#;
    let dispatcher = Arc::new(
        ScriptedDispatcher::new()
            .script("review", [ScriptedStep::pass()])
            .expect("script"),
    );
    let engine = engine_with(yaml, dispatcher, EngineConfig::default());
    let decision = engine.run(&request(&["mystery"])).await.expect("decision");
    assert_eq!(decision.outcome, Outcome::Passed);
    assert_eq!(numbers(&decision, "review"), vec![1]);
    assert!(!decision.profile_fingerprint.is_empty());
}
