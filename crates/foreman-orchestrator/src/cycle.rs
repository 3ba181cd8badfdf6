use crate::policy::Policy;
use crate::registry::classify;
use crate::tasks::{self, StaleSweep, ValidationOutcome};
use crate::types::{LedgerState, Liveness, Report, ReportStatus, TaskStatus};
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult, Role, TaskId};
use foreman_store::{NewEvent, Txn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// Outcome of one manager pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerCycle {
    /// Result of the stale sweep that opened the pass.
    pub sweep: StaleSweep,
    /// Reported tasks judged during the pass.
    pub validated: Vec<ValidationOutcome>,
    /// Open (not done) tasks per responsible role.
    pub open_by_owner: BTreeMap<Role, usize>,
    /// Sequence of the published contract digest, if any tasks are open.
    pub digest_seq: Option<u64>,
}

/// Completion of one workstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkstreamProgress {
    /// Tasks in the workstream.
    pub total: usize,
    /// Tasks in `done`.
    pub done: usize,
    /// `done * 100 / total`, rounded down.
    pub percent: u8,
}

/// Ledger-wide summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// Tasks in the ledger.
    pub total_tasks: usize,
    /// Task counts per status.
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
    /// Progress per workstream.
    pub workstreams: BTreeMap<String, WorkstreamProgress>,
    /// Bugs still open.
    pub open_bugs: usize,
    /// Decisions still collecting votes.
    pub open_decisions: usize,
    /// Roles grouped by derived liveness.
    pub agents: BTreeMap<Liveness, Vec<Role>>,
    /// Sequence of the newest committed event.
    pub event_head: u64,
}

/// Judge a report the way the manager does without a human in the loop.
///
/// Passes iff the worker declared `done` with no failing tests. `strict`
/// also demands the test command that produced the counts.
pub fn verdict(report: &Report, strict: bool) -> (bool, String) {
    let mut problems = Vec::new();
    if report.status != ReportStatus::Done {
        problems.push(format!(
            "declared status {}",
            serde_json::to_value(report.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default()
        ));
    }
    if report.test_summary.failed > 0 {
        problems.push(format!("{} failing tests", report.test_summary.failed));
    }
    if strict && report.test_summary.command.trim().is_empty() {
        problems.push("no test command".to_string());
    }

    if problems.is_empty() {
        (
            true,
            format!(
                "commit {}: {} tests passed",
                report.commit_sha, report.test_summary.passed
            ),
        )
    } else {
        (
            false,
            format!("commit {}: {}", report.commit_sha, problems.join("; ")),
        )
    }
}

/// Reclaim stale work, validate every reported task from its latest
/// report, then publish the open-task digest.
pub fn manager_cycle(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    strict: bool,
) -> ForemanResult<ManagerCycle> {
    if actor != policy.manager_role() {
        return Err(ForemanError::PolicyViolation(format!(
            "only {} may run the manager cycle",
            policy.manager_role()
        )));
    }

    let now = txn.now();
    let sweep = tasks::reassign_stale(txn, policy, now, None)?;

    let reported: Vec<(TaskId, Report)> = {
        let state = txn.state();
        let mut reported: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Reported)
            .filter_map(|t| {
                let latest = state.reports.iter().rev().find(|r| r.task_id == t.id)?;
                Some((t.created_at, t.id.clone(), latest.clone()))
            })
            .collect();
        reported.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        reported.into_iter().map(|(_, id, r)| (id, r)).collect()
    };

    let mut validated = Vec::with_capacity(reported.len());
    for (task_id, report) in reported {
        let (passed, notes) = verdict(&report, strict);
        validated.push(tasks::validate(txn, policy, actor, &task_id, passed, &notes)?);
    }

    let mut open_by_owner: BTreeMap<Role, usize> = BTreeMap::new();
    let mut contracts: BTreeMap<Role, Vec<serde_json::Value>> = BTreeMap::new();
    for task in tasks::list(txn.state(), &tasks::TaskFilter::default()) {
        if task.status == TaskStatus::Done {
            continue;
        }
        let responsible = task.owner.clone().unwrap_or_else(|| task.assignee.clone());
        *open_by_owner.entry(responsible.clone()).or_insert(0) += 1;
        contracts.entry(responsible).or_default().push(json!({
            "task_id": task.id,
            "title": task.title,
            "status": task.status,
            "acceptance_criteria": task.acceptance_criteria,
        }));
    }

    let digest_seq = (!contracts.is_empty()).then(|| {
        txn.publish(
            NewEvent::new("manager.task_contracts", json!({ "contracts": contracts }))
                .from_role(actor),
        )
    });

    info!(
        requeued = sweep.requeued.len(),
        validated = validated.len(),
        open = open_by_owner.values().sum::<usize>(),
        "Manager cycle complete"
    );
    Ok(ManagerCycle {
        sweep,
        validated,
        open_by_owner,
        digest_seq,
    })
}

/// Counts by status, per-workstream completion, open bugs and agent presence.
pub fn summarize(
    state: &LedgerState,
    policy: &Policy,
    now: DateTime<Utc>,
    event_head: u64,
) -> StatusSummary {
    let mut summary = StatusSummary {
        total_tasks: state.tasks.len(),
        event_head,
        ..StatusSummary::default()
    };
    for task in state.tasks.values() {
        *summary.tasks_by_status.entry(task.status).or_insert(0) += 1;
        let progress = summary
            .workstreams
            .entry(task.workstream.clone())
            .or_default();
        progress.total += 1;
        if task.status == TaskStatus::Done {
            progress.done += 1;
        }
    }
    for progress in summary.workstreams.values_mut() {
        progress.percent = u8::try_from(progress.done * 100 / progress.total.max(1)).unwrap_or(100);
    }
    summary.open_bugs = state
        .bugs
        .values()
        .filter(|b| b.status == crate::types::BugStatus::Open)
        .count();
    summary.open_decisions = state.decisions.values().filter(|d| !d.is_resolved()).count();
    for agent in state.agents.values() {
        summary
            .agents
            .entry(classify(agent, state, policy, now))
            .or_default()
            .push(agent.role.clone());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{claim, create, ingest_report, NewTask};
    use crate::test_support::{ledger, t0};
    use crate::types::{ReportSubmission, TestSummary};

    fn report(status: ReportStatus, failed: u32, command: &str) -> Report {
        Report {
            task_id: TaskId::from("TASK-1"),
            agent: Role::from("builder_a"),
            commit_sha: "abc".into(),
            status,
            test_summary: TestSummary {
                command: command.into(),
                passed: 4,
                failed,
            },
            artifacts: vec![],
            notes: String::new(),
            timestamp: t0(),
        }
    }

    #[test]
    fn test_verdict() {
        assert!(verdict(&report(ReportStatus::Done, 0, "make test"), true).0);
        assert!(verdict(&report(ReportStatus::Done, 0, ""), false).0);
        assert!(!verdict(&report(ReportStatus::Done, 0, ""), true).0);
        let (passed, notes) = verdict(&report(ReportStatus::Partial, 2, "make test"), false);
        assert!(!passed);
        assert!(notes.contains("declared status partial"));
        assert!(notes.contains("2 failing tests"));
    }

    #[test]
    fn test_manager_cycle_validates_reported_tasks() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let manager = Role::from("manager");
        let builder = Role::from("builder_a");

        let (good, bad) = ledger
            .transact(t0(), |txn| {
                let good = create(txn, &policy, &manager, NewTask {
                    title: "good".into(),
                    workstream: "backend".into(),
                    ..NewTask::default()
                })?;
                let bad = create(txn, &policy, &manager, NewTask {
                    title: "bad".into(),
                    workstream: "backend".into(),
                    ..NewTask::default()
                })?;
                for (task, failed) in [(&good, 0), (&bad, 3)] {
                    claim(txn, &builder, Some(&task.id))?;
                    ingest_report(txn, &policy, ReportSubmission {
                        task_id: task.id.clone(),
                        agent: builder.clone(),
                        commit_sha: format!("c-{}", task.title),
                        status: ReportStatus::Done,
                        test_summary: TestSummary {
                            command: "cargo test".into(),
                            passed: 5,
                            failed,
                        },
                        artifacts: vec![],
                        notes: String::new(),
                    })?;
                }
                Ok((good.id, bad.id))
            })
            .unwrap();

        let cycle = ledger
            .transact(t0(), |txn| manager_cycle(txn, &policy, &manager, false))
            .unwrap();
        assert_eq!(cycle.validated.len(), 2);
        let state = ledger.snapshot().unwrap().state;
        assert_eq!(state.tasks[&good].status, TaskStatus::Done);
        assert_eq!(state.tasks[&bad].status, TaskStatus::BugOpen);
        assert_eq!(cycle.open_by_owner[&builder], 1);
        assert!(cycle.digest_seq.is_some());

        let summary = summarize(&state, &policy, t0(), 0);
        assert_eq!(summary.workstreams["backend"].percent, 50);
        assert_eq!(summary.open_bugs, 1);
    }

    #[test]
    fn test_manager_cycle_requires_manager() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let err = ledger
            .transact(t0(), |txn| {
                manager_cycle(txn, &policy, &Role::from("builder_a"), false)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));
    }
}
