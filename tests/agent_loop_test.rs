mod common;

use std::time::Duration;

use common::TestHarness;
use tokio_util::sync::CancellationToken;

use maestro::agent::MockAgentRunner;
use maestro::agent_loop::{run_phase, LoopParams};
use maestro::error::AgentError;
use maestro::store::Store;
use maestro::template::TemplateSet;
use maestro::types::{
    CompletionSignal, ControlRequest, PhaseOutcome, PhasePlan, Profile, Task, TaskWeight,
};

fn implement_phase(max_iterations: u32) -> PhasePlan {
    PhasePlan {
        phase_id: "implement".to_string(),
        gate_policy: maestro::types::GatePolicy::Auto,
        max_iterations,
    }
}

async fn claimed_task(h: &TestHarness) -> Task {
    h.planned_task("loop target", TaskWeight::Small, Profile::Auto)
        .await;
    h.claim().await.expect("claim")
}

async fn drive(
    h: &TestHarness,
    task: &Task,
    runner: &MockAgentRunner,
    phase: &PhasePlan,
    session_key: Option<String>,
    start_iteration: u32,
) -> maestro::agent_loop::LoopResult {
    let templates = TemplateSet::new(None, h.config.sentinel.clone());
    let workspace = h.worktree_path(&task.id);
    run_phase(
        h.store.as_ref(),
        runner,
        &templates,
        &h.bus,
        &CancellationToken::new(),
        LoopParams {
            task,
            phase,
            retry_context: None,
            workspace: &workspace,
            session_key,
            start_iteration,
            iteration_timeout: Duration::from_secs(60),
        },
    )
    .await
}

#[tokio::test]
async fn completes_on_completion_marker() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![
        common::response(&common::continue_output(), "sess-1"),
        common::response(&common::complete_output(), "sess-1"),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(5), None, 1).await;

    match result.outcome {
        PhaseOutcome::Completed { usage, cost_usd, .. } => {
            assert_eq!(usage.input, 200); // two turns folded
            assert!((cost_usd - 0.02).abs() < 1e-9);
        }
        other => panic!("expected completed, got {:?}", other),
    }
    assert_eq!(result.iterations_run, 2);
    assert_eq!(result.session_key.as_deref(), Some("sess-1"));

    // Both iterations persisted, indices monotonic.
    let exec = h
        .store
        .load_execution_state(&task.id)
        .await
        .unwrap()
        .unwrap();
    let record = exec.phase_record("implement").unwrap();
    assert_eq!(record.iterations.len(), 2);
    assert_eq!(record.iterations[0].index, 1);
    assert_eq!(record.iterations[1].index, 2);
    assert_eq!(
        record.iterations[1].completion_signal,
        CompletionSignal::Complete
    );
    // Session key persisted for resume.
    assert_eq!(exec.session_key.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn session_key_threads_through_resumed_turns() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![
        common::response(&common::continue_output(), "sess-9"),
        common::response(&common::complete_output(), "sess-9"),
    ]);

    drive(&h, &task, &runner, &implement_phase(5), None, 1).await;

    let calls = runner.recorded_calls();
    assert_eq!(calls[0].session_key, None);
    assert_eq!(calls[1].session_key.as_deref(), Some("sess-9"));
    // Iteration number rendered into each prompt.
    assert!(calls[0].prompt.contains("iteration 1"));
    assert!(calls[1].prompt.contains("iteration 2"));
}

#[tokio::test]
async fn blocked_marker_wins_and_carries_reason() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let output = format!(
        "{}\n{}",
        common::complete_output(),
        common::blocked_output("schema decision needed")
    );
    let runner = MockAgentRunner::new(vec![common::response(&output, "sess-1")]);

    let result = drive(&h, &task, &runner, &implement_phase(5), None, 1).await;
    match result.outcome {
        PhaseOutcome::Blocked { reason } => assert_eq!(reason, "schema decision needed"),
        other => panic!("expected blocked, got {:?}", other),
    }
}

#[tokio::test]
async fn exhausts_budget_without_marker() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![
        common::response(&common::continue_output(), "s"),
        common::response(&common::continue_output(), "s"),
        common::response(&common::continue_output(), "s"),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(3), None, 1).await;
    assert!(matches!(result.outcome, PhaseOutcome::Exhausted));
    assert_eq!(result.iterations_run, 3);
}

#[tokio::test]
async fn stuck_on_third_identical_signature() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let failing = common::failing_output("assertion `left == right` failed");
    let runner = MockAgentRunner::new(vec![
        common::response(&failing, "s"),
        common::response(&failing, "s"),
        common::response(&failing, "s"),
        // Never reached.
        common::response(&common::complete_output(), "s"),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(10), None, 1).await;
    match result.outcome {
        PhaseOutcome::Stuck { signature } => assert!(!signature.is_empty()),
        other => panic!("expected stuck, got {:?}", other),
    }
    assert_eq!(result.iterations_run, 3);
}

#[tokio::test]
async fn successful_iteration_resets_the_stuck_window() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let failing = common::failing_output("same failure");
    let runner = MockAgentRunner::new(vec![
        common::response(&failing, "s"),
        common::response(&failing, "s"),
        common::response(&common::continue_output(), "s"), // no failure: resets
        common::response(&failing, "s"),
        common::response(&failing, "s"),
        common::response(&common::complete_output(), "s"),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(10), None, 1).await;
    assert!(matches!(result.outcome, PhaseOutcome::Completed { .. }));
    assert_eq!(result.iterations_run, 6);
}

#[tokio::test]
async fn protocol_error_is_a_failing_iteration() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![
        Err(AgentError::Protocol("unparsable envelope".to_string())),
        common::response(&common::complete_output(), "s"),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(5), None, 1).await;
    assert!(matches!(result.outcome, PhaseOutcome::Completed { .. }));

    let exec = h
        .store
        .load_execution_state(&task.id)
        .await
        .unwrap()
        .unwrap();
    let record = exec.phase_record("implement").unwrap();
    assert_eq!(
        record.iterations[0].completion_signal,
        CompletionSignal::ParseError
    );
    assert!(record.iterations[0].error_signature.is_some());
}

#[tokio::test]
async fn repeated_timeouts_trip_the_stuck_detector() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![
        Err(AgentError::Timeout(Duration::from_secs(60))),
        Err(AgentError::Timeout(Duration::from_secs(60))),
        Err(AgentError::Timeout(Duration::from_secs(60))),
    ]);

    let result = drive(&h, &task, &runner, &implement_phase(10), None, 1).await;
    assert!(matches!(result.outcome, PhaseOutcome::Stuck { .. }));
}

#[tokio::test]
async fn rate_limit_surfaces_as_phase_failure() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    let runner = MockAgentRunner::new(vec![Err(AgentError::RateLimited(
        "quota exhausted".to_string(),
    ))]);

    let result = drive(&h, &task, &runner, &implement_phase(5), None, 1).await;
    match result.outcome {
        PhaseOutcome::Failed { reason } => assert!(reason.contains("rate limited")),
        other => panic!("expected failed, got {:?}", other),
    }
}

#[tokio::test]
async fn pause_request_honored_between_iterations() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;
    h.store
        .request_control(&task.id, ControlRequest::Pause)
        .await
        .unwrap();

    let runner = MockAgentRunner::new(vec![common::response(&common::complete_output(), "s")]);
    let result = drive(&h, &task, &runner, &implement_phase(5), None, 1).await;

    match result.outcome {
        PhaseOutcome::Paused {
            completed_iterations,
        } => assert_eq!(completed_iterations, 0),
        other => panic!("expected paused, got {:?}", other),
    }
    // The agent was never invoked.
    assert!(runner.recorded_calls().is_empty());
}

#[tokio::test]
async fn resume_continues_at_the_next_iteration() {
    let h = TestHarness::new(common::test_config());
    let task = claimed_task(&h).await;

    // First run: two continue iterations against a budget of two, so
    // the phase run stops with both persisted.
    let runner = MockAgentRunner::new(vec![
        common::response(&common::continue_output(), "sess-r"),
        common::response(&common::continue_output(), "sess-r"),
    ]);
    let result = drive(&h, &task, &runner, &implement_phase(2), None, 1).await;
    assert!(matches!(result.outcome, PhaseOutcome::Exhausted));

    // Second run resumes from iteration 3 with the saved session.
    let runner = MockAgentRunner::new(vec![common::response(&common::complete_output(), "sess-r")]);
    let result = drive(
        &h,
        &task,
        &runner,
        &implement_phase(5),
        Some("sess-r".to_string()),
        3,
    )
    .await;
    assert!(matches!(result.outcome, PhaseOutcome::Completed { .. }));

    let calls = runner.recorded_calls();
    assert_eq!(calls[0].session_key.as_deref(), Some("sess-r"));
    assert!(calls[0].prompt.contains("iteration 3"));

    // No earlier iteration was re-executed.
    let exec = h
        .store
        .load_execution_state(&task.id)
        .await
        .unwrap()
        .unwrap();
    let record = exec.phase_record("implement").unwrap();
    assert_eq!(record.iterations.len(), 3);
    assert_eq!(record.iterations[2].index, 3);
}
