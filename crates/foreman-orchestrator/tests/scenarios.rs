#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios against a real ledger directory.
//!
//! Several `Orchestrator` instances opened on the same directory stand in for
//! independent processes.

use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, Role, TaskId};
use foreman_orchestrator::decisions::adr_path;
use foreman_orchestrator::{
    BugStatus, Metadata, ManualClock, NewDecision, NewTask, Orchestrator, Policy, PollOptions,
    ReportStatus, ReportSubmission, ResolutionMethod, TaskStatus, TestSummary,
};
use std::sync::Arc;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-03T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn role(name: &str) -> Role {
    Role::from(name)
}

fn engine(dir: &std::path::Path) -> (Orchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let orch = Orchestrator::open(dir, Policy::default())
        .unwrap()
        .with_clock(clock.clone());
    (orch, clock)
}

fn backend_task(title: &str) -> NewTask {
    NewTask {
        title: title.into(),
        workstream: "backend".into(),
        acceptance_criteria: vec!["tests pass".into()],
        ..NewTask::default()
    }
}

fn report(task_id: &TaskId, sha: &str, passed: u32, failed: u32) -> ReportSubmission {
    ReportSubmission {
        task_id: task_id.clone(),
        agent: role("builder_a"),
        commit_sha: sha.into(),
        status: ReportStatus::Done,
        test_summary: TestSummary {
            command: "cargo test".into(),
            passed,
            failed,
        },
        artifacts: vec!["src/api.rs".into()],
        notes: String::new(),
    }
}

// ---------------------------------------------------------------------------
// Claim races
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_from_two_processes_yield_one_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (first, _) = engine(dir.path());
    let (second, _) = engine(dir.path());
    let manager = role("manager");

    for round in 0..8 {
        let task = first
            .create_task(&manager, backend_task(&format!("race {round}")))
            .await
            .unwrap();
        first
            .set_claim_override(&manager, &task.id, &role("builder_b"))
            .await
            .unwrap();

        let builder_a = role("builder_a");
        let builder_b = role("builder_b");
        let (a, b) = tokio::join!(
            first.claim_task(&builder_a, Some(task.id.clone())),
            second.claim_task(&builder_b, Some(task.id.clone())),
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
        let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(loser, ForemanError::Conflict(_)), "round {round}: {loser}");

        let stored = second.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Claimed);
        assert_eq!(stored.history.len(), 2);
    }
}

// ---------------------------------------------------------------------------
// Report idempotence and the validation loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_report_returns_identical_result() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, clock) = engine(dir.path());
    let task = orch
        .create_task(&role("manager"), backend_task("idempotent"))
        .await
        .unwrap();
    orch.claim_task(&role("builder_a"), None).await.unwrap();

    let first = orch.submit_report(report(&task.id, "c0ffee", 10, 0)).await.unwrap();
    clock.advance(chrono::Duration::seconds(45));
    let second = orch.submit_report(report(&task.id, "c0ffee", 10, 0)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(orch.get_reports(&task.id).await.unwrap().len(), 1);

    orch.validate_task(&role("manager"), &task.id, false, "flaky")
        .await
        .unwrap();
    // A retry of the already-ingested report after the failure is still a no-op.
    let third = orch.submit_report(report(&task.id, "c0ffee", 10, 0)).await.unwrap();
    assert_eq!(third, first);
    assert_eq!(orch.list_bugs(None, None).await.unwrap().len(), 1);
    assert_eq!(
        orch.get_task(&task.id).await.unwrap().status,
        TaskStatus::BugOpen
    );
}

#[tokio::test]
async fn backend_task_fails_validation_then_passes() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    let manager = role("manager");
    let builder = role("builder_a");

    let task = orch.create_task(&manager, backend_task("T1")).await.unwrap();
    assert_eq!(task.assignee, builder);

    orch.claim_task(&builder, None).await.unwrap();
    orch.submit_report(report(&task.id, "a1b2c3", 10, 0)).await.unwrap();

    let failed = orch
        .validate_task(&manager, &task.id, false, "endpoint returns 500")
        .await
        .unwrap();
    let bug_id = failed.bug_id.clone().expect("bug opened");
    let open = orch.list_bugs(Some(BugStatus::Open), None).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, bug_id);
    let mine = orch
        .list_bugs(Some(BugStatus::Open), Some(&builder))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert!(orch
        .list_bugs(None, Some(&role("builder_b")))
        .await
        .unwrap()
        .is_empty());

    orch.submit_report(report(&task.id, "d4e5f6", 10, 0)).await.unwrap();
    let passed = orch
        .validate_task(&manager, &task.id, true, "fixed")
        .await
        .unwrap();
    assert_eq!(passed.resolved_bug_id, Some(bug_id.clone()));

    let done = orch.get_task(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    let bugs = orch.list_bugs(None, None).await.unwrap();
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].status, BugStatus::Resolved);

    // Every recorded step is adjacent to the one before it.
    let statuses: Vec<TaskStatus> = done.history.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Created,
            TaskStatus::Claimed,
            TaskStatus::Reported,
            TaskStatus::BugOpen,
            TaskStatus::Reported,
            TaskStatus::Done,
        ]
    );
    for pair in statuses.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
}

// ---------------------------------------------------------------------------
// Liveness and stale reclamation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_builder_loses_claimed_task() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, clock) = engine(dir.path());
    let builder_b = role("builder_b");

    orch.register_agent(&builder_b, Metadata::new()).await.unwrap();
    clock.advance(chrono::Duration::seconds(30));
    orch.heartbeat(&builder_b).await.unwrap();

    let task = orch
        .create_task(
            &role("manager"),
            NewTask {
                title: "Navbar".into(),
                workstream: "frontend".into(),
                ..NewTask::default()
            },
        )
        .await
        .unwrap();
    orch.claim_task(&builder_b, Some(task.id.clone())).await.unwrap();

    // Still inside the heartbeat window: nothing moves.
    clock.advance(chrono::Duration::seconds(300));
    let sweep = orch.reassign_stale(None).await.unwrap();
    assert!(sweep.stale.is_empty());

    clock.advance(chrono::Duration::seconds(301));
    let sweep = orch.reassign_stale(None).await.unwrap();
    assert_eq!(sweep.requeued, vec![task.id.clone()]);
    assert_eq!(sweep.notified, vec![builder_b.clone()]);

    let requeued = orch.get_task(&task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Created);
    assert!(requeued.owner.is_none());

    let again = orch.reassign_stale(None).await.unwrap();
    assert!(again.requeued.is_empty());
    assert!(again.notified.is_empty());
    assert_eq!(orch.get_task(&task.id).await.unwrap(), requeued);

    // Back online, the builder can pick it up again.
    orch.heartbeat(&builder_b).await.unwrap();
    let reclaimed = orch.claim_task(&builder_b, None).await.unwrap();
    assert_eq!(reclaimed.id, task.id);
}

#[tokio::test]
async fn active_owner_is_never_reassigned() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, clock) = engine(dir.path());
    let builder = role("builder_a");
    let task = orch
        .create_task(&role("manager"), backend_task("busy"))
        .await
        .unwrap();
    orch.claim_task(&builder, None).await.unwrap();

    for _ in 0..5 {
        clock.advance(chrono::Duration::seconds(500));
        orch.heartbeat(&builder).await.unwrap();
        let sweep = orch.reassign_stale(None).await.unwrap();
        assert!(sweep.stale.is_empty());
    }
    assert_eq!(
        orch.get_task(&task.id).await.unwrap().owner,
        Some(builder)
    );
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    let builder = role("builder_a");
    orch.register_agent(&builder, Metadata::new()).await.unwrap();
    for i in 0..6 {
        orch.publish_event(Some(&role("manager")), "note", serde_json::json!({ "i": i }), vec![])
            .await
            .unwrap();
    }

    let mut last = 0;
    for seq in [4, 2, 6, 1, 5, 3] {
        orch.ack_event(&builder, seq).await.unwrap();
        let cursor = orch.get_cursor(&builder).await.unwrap();
        assert!(cursor >= last);
        last = cursor;
    }
    assert_eq!(last, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_wakes_when_event_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    let orch = Arc::new(orch);
    let builder = role("builder_a");
    orch.register_agent(&builder, Metadata::new()).await.unwrap();
    let head = orch.status().await.unwrap().event_head;
    orch.ack_event(&builder, head).await.unwrap();

    let poller = {
        let orch = Arc::clone(&orch);
        let builder = builder.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let batch = orch
                .poll_events(&builder, Duration::from_secs(10), PollOptions::default())
                .await
                .unwrap();
            (batch, started.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    orch.publish_event(
        Some(&role("manager")),
        "manager.ping",
        serde_json::json!({}),
        vec![builder.clone()],
    )
    .await
    .unwrap();

    let (batch, waited) = poller.await.unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].topic, "manager.ping");
    assert!(waited < Duration::from_secs(5), "poll took {waited:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_sees_publish_from_other_process() {
    let dir = tempfile::tempdir().unwrap();
    let (reader, _) = engine(dir.path());
    let (writer, _) = engine(dir.path());
    let builder = role("builder_b");

    let poll = reader.poll_events(&builder, Duration::from_secs(10), PollOptions::default());
    let publish = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer
            .publish_event(None, "broadcast", serde_json::json!({}), vec![])
            .await
            .unwrap();
    };
    let (batch, ()) = tokio::join!(poll, publish);
    let batch = batch.unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].topic, "broadcast");
}

// ---------------------------------------------------------------------------
// Architecture decisions
// ---------------------------------------------------------------------------

fn db_decision(quorum: Option<usize>) -> NewDecision {
    NewDecision {
        topic: "Primary database".into(),
        options: vec!["A".into(), "B".into()],
        voters: Some(vec![role("manager"), role("builder_a"), role("builder_b")]),
        quorum,
    }
}

#[tokio::test]
async fn plurality_vote_resolves_and_writes_adr() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    orch.open_decision(&role("manager"), db_decision(None))
        .await
        .unwrap();

    orch.vote(&role("manager"), "Primary database", "A", "known quantity")
        .await
        .unwrap();
    orch.vote(&role("builder_a"), "Primary database", "B", "")
        .await
        .unwrap();
    let decision = orch
        .vote(&role("builder_b"), "Primary database", "B", "better tooling")
        .await
        .unwrap();

    let resolution = decision.resolution.unwrap();
    assert_eq!(resolution.winner, "B");
    assert_eq!(resolution.method, ResolutionMethod::Plurality);

    let adr = std::fs::read_to_string(dir.path().join(adr_path("Primary database"))).unwrap();
    assert!(adr.contains("**B** (plurality)"));

    let err = orch
        .vote(&role("manager"), "Primary database", "A", "")
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::Conflict(_)));
}

#[tokio::test]
async fn resolution_stands_when_adr_cannot_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    // A plain file where the ADR directory should be.
    let blocker = dir.path().join(foreman_orchestrator::decisions::ADR_DIR);
    std::fs::write(&blocker, "not a directory").unwrap();

    orch.open_decision(&role("manager"), db_decision(Some(2)))
        .await
        .unwrap();
    orch.vote(&role("builder_a"), "Primary database", "B", "")
        .await
        .unwrap();
    let decision = orch
        .vote(&role("builder_b"), "Primary database", "B", "")
        .await
        .unwrap();
    assert_eq!(decision.resolution.unwrap().winner, "B");

    let stored = orch.get_decision("Primary database").await.unwrap();
    assert!(stored.is_resolved());
    assert!(orch.render_adrs().await.is_err());

    std::fs::remove_file(&blocker).unwrap();
    let written = orch.render_adrs().await.unwrap();
    assert_eq!(written, vec![dir.path().join(adr_path("Primary database"))]);
    assert!(std::fs::read_to_string(&written[0]).unwrap().contains("**B** (plurality)"));
}

#[tokio::test]
async fn tie_at_partial_quorum_goes_to_manager_choice() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    orch.open_decision(&role("manager"), db_decision(Some(2)))
        .await
        .unwrap();

    orch.vote(&role("manager"), "Primary database", "A", "")
        .await
        .unwrap();
    let decision = orch
        .vote(&role("builder_a"), "Primary database", "B", "")
        .await
        .unwrap();

    let resolution = decision.resolution.unwrap();
    assert_eq!(resolution.winner, "A");
    assert_eq!(resolution.method, ResolutionMethod::ManagerVote);
    assert!(!decision.votes.contains_key(&role("builder_b")));
}

// ---------------------------------------------------------------------------
// Policy hot reload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reloaded_routing_applies_to_next_create() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = engine(dir.path());
    let mut policy = Policy::default();
    policy.routing.insert("backend".into(), role("builder_c"));
    orch.reload_policy(policy).unwrap();

    let task = orch
        .create_task(&role("manager"), backend_task("after reload"))
        .await
        .unwrap();
    assert_eq!(task.assignee, role("builder_c"));
}

#[tokio::test]
async fn ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let task_id = {
        let (orch, _) = engine(dir.path());
        let task = orch
            .create_task(&role("manager"), backend_task("durable"))
            .await
            .unwrap();
        orch.claim_task(&role("builder_a"), None).await.unwrap();
        task.id
    };

    let (orch, _) = engine(dir.path());
    let task = orch.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(orch.status().await.unwrap().event_head, 2);
}
