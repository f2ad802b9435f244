mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::TestHarness;
use tokio_util::sync::CancellationToken;

use maestro::agent::MockAgentRunner;
use maestro::bus::Event;
use maestro::scheduler::{run_scheduler, HaltReason};
use maestro::store::Store;
use maestro::types::{Priority, Profile, TaskStatus, TaskWeight};

#[tokio::test]
async fn drains_ready_tasks_under_the_parallelism_cap() {
    let mut config = common::test_config();
    config.execution.parallelism = 2;
    let h = TestHarness::new(config);

    let t1 = h
        .planned_task("first", TaskWeight::Trivial, Profile::Auto)
        .await;
    let t2 = h
        .planned_task("second", TaskWeight::Trivial, Profile::Auto)
        .await;
    let t3 = h
        .planned_task("third", TaskWeight::Trivial, Profile::Auto)
        .await;

    // One completing turn per task.
    let runner = Arc::new(MockAgentRunner::new(vec![
        common::response(&common::complete_output(), "s1"),
        common::response(&common::complete_output(), "s2"),
        common::response(&common::complete_output(), "s3"),
    ]));

    let summary = run_scheduler(h.deps(runner), CancellationToken::new())
        .await
        .expect("scheduler run");

    assert_eq!(summary.halt_reason, HaltReason::AllDoneOrParked);
    // One phase execution per trivial task.
    assert_eq!(summary.phases_executed, 3);
    let mut completed = summary.tasks_completed.clone();
    completed.sort();
    assert_eq!(completed, vec![t1.id.clone(), t2.id.clone(), t3.id.clone()]);

    // Each task was claimed exactly once and ended completed.
    for id in [&t1.id, &t2.id, &t3.id] {
        let task = h.store.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    // Distinct worktree paths per task.
    let creates: BTreeSet<String> = h
        .git
        .recorded()
        .into_iter()
        .filter(|c| c.starts_with("create_worktree"))
        .collect();
    assert_eq!(creates.len(), 3, "each task gets its own worktree: {:?}", creates);
}

#[tokio::test]
async fn per_task_event_order_is_preserved() {
    let mut config = common::test_config();
    config.execution.parallelism = 2;
    let h = TestHarness::new(config);

    h.planned_task("a", TaskWeight::Trivial, Profile::Auto).await;
    h.planned_task("b", TaskWeight::Trivial, Profile::Auto).await;

    let (_, mut rx) = h.bus.subscribe();

    let runner = Arc::new(MockAgentRunner::new(vec![
        common::response(&common::complete_output(), "s1"),
        common::response(&common::complete_output(), "s2"),
    ]));
    run_scheduler(h.deps(runner), CancellationToken::new())
        .await
        .unwrap();

    // Collect everything the bus saw; per-task ordering must hold even
    // though tasks may interleave arbitrarily.
    let mut phase_orders: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    while let Ok(seq_event) = rx.try_recv() {
        if let Event::PhaseStateChanged {
            task_id, old, new, ..
        } = &seq_event.event
        {
            phase_orders
                .entry(task_id.clone())
                .or_default()
                .push(format!("{}->{}", old, new));
        }
    }

    for (task_id, transitions) in &phase_orders {
        assert_eq!(
            transitions,
            &vec![
                "pending->running".to_string(),
                "running->completed".to_string()
            ],
            "ordered transitions for {}",
            task_id
        );
    }
    assert_eq!(phase_orders.len(), 2);
}

#[tokio::test]
async fn dependency_chains_run_in_order() {
    let h = TestHarness::new(common::test_config());

    let blocker = h
        .planned_task("build the base", TaskWeight::Trivial, Profile::Auto)
        .await;
    let dependent = h
        .planned_task_full(
            "build on top",
            TaskWeight::Trivial,
            Profile::Auto,
            Priority::High,
            [blocker.id.clone()].into_iter().collect(),
        )
        .await;

    let runner = Arc::new(MockAgentRunner::new(vec![
        common::response(&common::complete_output(), "s1"),
        common::response(&common::complete_output(), "s2"),
    ]));
    let summary = run_scheduler(h.deps(runner), CancellationToken::new())
        .await
        .unwrap();

    // The blocker finished before the dependent was even admitted.
    assert_eq!(
        summary.tasks_completed,
        vec![blocker.id.clone(), dependent.id.clone()]
    );
}

#[tokio::test]
async fn recovers_orphaned_running_tasks_at_startup() {
    let h = TestHarness::new(common::test_config());
    let task = h
        .planned_task("left behind", TaskWeight::Trivial, Profile::Auto)
        .await;

    // Simulate a crash: claimed by a dead process, still `running`.
    h.claim().await.unwrap();
    assert_eq!(
        h.store.get_task(&task.id).await.unwrap().status,
        TaskStatus::Running
    );

    let runner = Arc::new(MockAgentRunner::new(vec![common::response(
        &common::complete_output(),
        "s",
    )]));
    let summary = run_scheduler(h.deps(runner), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.tasks_completed, vec![task.id.clone()]);
    // Startup hygiene ran once.
    assert!(h.git.recorded().contains(&"prune_worktrees".to_string()));
}

#[tokio::test]
async fn pre_cancelled_run_shuts_down_cleanly() {
    let h = TestHarness::new(common::test_config());
    h.planned_task("never starts", TaskWeight::Trivial, Profile::Auto)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let runner = Arc::new(MockAgentRunner::new(vec![]));
    let summary = run_scheduler(h.deps(runner), cancel).await.unwrap();
    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert!(summary.tasks_completed.is_empty());
}

#[tokio::test]
async fn paused_tasks_do_not_wedge_the_scheduler() {
    let h = TestHarness::new(common::test_config());
    let gated = h
        .planned_task("gated work", TaskWeight::Trivial, Profile::Safe)
        .await;
    let free = h
        .planned_task("free work", TaskWeight::Trivial, Profile::Auto)
        .await;

    let runner = Arc::new(MockAgentRunner::new(vec![
        common::response(&common::complete_output(), "s1"),
        common::response(&common::complete_output(), "s2"),
    ]));
    let summary = run_scheduler(h.deps(runner), CancellationToken::new())
        .await
        .unwrap();

    // The safe-profile task parks at its merge gate; the other one
    // finishes; the scheduler then drains instead of spinning.
    assert_eq!(summary.halt_reason, HaltReason::AllDoneOrParked);
    assert!(summary.tasks_completed.contains(&free.id));
    assert!(summary.tasks_paused.contains(&gated.id));
    assert_eq!(
        h.store.get_task(&gated.id).await.unwrap().status,
        TaskStatus::Paused
    );
}
