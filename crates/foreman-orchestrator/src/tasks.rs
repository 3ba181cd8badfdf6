//! Task lifecycle: creation, claiming, transitions, reports, validation and
//! stale-owner reclamation.
//!
//! Every function here runs inside one ledger transaction and re-checks its
//! preconditions against the state that transaction loaded, so concurrent
//! callers are decided by write order alone.

use crate::bugs;
use crate::policy::Policy;
use crate::registry::{self, is_offline, touch};
use crate::types::{
    Bug, LedgerState, Report, ReportSubmission, Task, TaskStatus, SYSTEM_ACTOR,
};
use chrono::{DateTime, Duration, Utc};
use foreman_core::{BugId, ForemanError, ForemanResult, Role, TaskId};
use foreman_store::{NewEvent, Txn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

/// Input for [`create`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    /// Short summary.
    pub title: String,
    /// Routing key.
    pub workstream: String,
    /// Longer free-form text.
    #[serde(default)]
    pub description: String,
    /// What a passing report must demonstrate.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Route to this role instead of the policy's choice.
    #[serde(default)]
    pub owner: Option<Role>,
}

/// Filter for [`list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFilter {
    /// Current owner.
    #[serde(default)]
    pub owner: Option<Role>,
    /// Role the task is routed to.
    #[serde(default)]
    pub assignee: Option<Role>,
    /// Status to match.
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Workstream to match.
    #[serde(default)]
    pub workstream: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        self.owner.as_ref().is_none_or(|o| task.owner.as_ref() == Some(o))
            && self.assignee.as_ref().is_none_or(|a| &task.assignee == a)
            && self.status.is_none_or(|s| task.status == s)
            && self.workstream.as_ref().is_none_or(|w| &task.workstream == w)
    }
}

/// Result of [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Task concerned.
    pub task_id: TaskId,
    /// Whether the task was accepted.
    pub passed: bool,
    /// Status after validation.
    pub status: TaskStatus,
    /// Bug opened or appended to by a failure.
    pub bug_id: Option<BugId>,
    /// Bug resolved by a pass.
    pub resolved_bug_id: Option<BugId>,
}

/// A claimed or in-progress task whose owner is offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleTask {
    /// Task concerned.
    pub task_id: TaskId,
    /// Offline owner.
    pub owner: Role,
    /// Status at sweep time.
    pub status: TaskStatus,
    /// `None` when the owner never registered.
    pub heartbeat_age_secs: Option<i64>,
}

/// Result of [`reassign_stale`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaleSweep {
    /// Held tasks whose owner is offline.
    pub stale: Vec<StaleTask>,
    /// Tasks returned to `created`. Empty when requeueing is disabled.
    pub requeued: Vec<TaskId>,
    /// Agents sent a reconnect notice by this sweep.
    #[serde(default)]
    pub notified: Vec<Role>,
}

/// A recorded claim directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimOverride {
    /// Task concerned.
    pub task_id: TaskId,
    /// Role allowed to claim next.
    pub agent: Role,
}

fn system_actor() -> Role {
    Role::from(SYSTEM_ACTOR)
}

/// Create a task in `created`, routed by policy unless an owner is given.
pub fn create(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    request: NewTask,
) -> ForemanResult<Task> {
    let title = request.title.trim();
    let workstream = request.workstream.trim();
    if title.is_empty() {
        return Err(ForemanError::Validation("task title must not be empty".into()));
    }
    if workstream.is_empty() {
        return Err(ForemanError::Validation("workstream must not be empty".into()));
    }
    if request.acceptance_criteria.iter().any(|c| c.trim().is_empty()) {
        return Err(ForemanError::Validation(
            "acceptance criteria must not be empty".into(),
        ));
    }

    let assignee = match request.owner.filter(|o| !o.is_blank()) {
        Some(owner) => owner,
        None => policy.route(workstream).cloned().ok_or_else(|| {
            ForemanError::PolicyViolation(format!(
                "workstream '{workstream}' has no route and no owner was given"
            ))
        })?,
    };

    let now = txn.now();
    let mut task = Task {
        id: TaskId::generate(),
        title: title.to_string(),
        description: request.description,
        workstream: workstream.to_string(),
        assignee,
        owner: None,
        status: TaskStatus::Created,
        acceptance_criteria: request.acceptance_criteria,
        created_at: now,
        updated_at: now,
        version: 0,
        history: Vec::new(),
    };
    task.transition(TaskStatus::Created, actor, now, "");
    txn.state_mut().tasks.insert(task.id.clone(), task.clone());

    txn.publish(
        NewEvent::new(
            "task.created",
            json!({
                "task_id": task.id,
                "title": task.title,
                "workstream": task.workstream,
                "assignee": task.assignee,
            }),
        )
        .from_role(actor),
    );
    info!(task_id = %task.id, assignee = %task.assignee, workstream = %task.workstream, "Task created");
    Ok(task)
}

/// Claim `task_id`, or the next claimable task routed to `agent`.
pub fn claim(
    txn: &mut Txn<LedgerState>,
    agent: &Role,
    task_id: Option<&TaskId>,
) -> ForemanResult<Task> {
    if agent.is_blank() {
        return Err(ForemanError::Validation("agent role must not be empty".into()));
    }

    let id = match task_id {
        Some(id) => {
            check_claimable(txn.state(), agent, id)?;
            id.clone()
        }
        None => next_claimable(txn.state(), agent).ok_or_else(|| {
            ForemanError::NotFound(format!("no claimable task for {agent}"))
        })?,
    };

    let now = txn.now();
    let state = txn.state_mut();
    let consumed = state.claim_overrides.get(&id) == Some(agent);
    if consumed {
        state.claim_overrides.remove(&id);
    }
    touch(state, agent, now, true);
    let task = state.task_mut(&id)?;
    task.owner = Some(agent.clone());
    task.transition(TaskStatus::Claimed, agent, now, "");
    let task = task.clone();

    txn.publish(
        NewEvent::new(
            "task.claimed",
            json!({ "task_id": task.id, "owner": agent, "via_override": consumed }),
        )
        .from_role(agent),
    );
    info!(task_id = %task.id, agent = %agent, via_override = consumed, "Task claimed");
    Ok(task)
}

fn check_claimable(state: &LedgerState, agent: &Role, id: &TaskId) -> ForemanResult<()> {
    let task = state.task(id)?;
    if let Some(owner) = &task.owner {
        return Err(ForemanError::Conflict(format!(
            "task {id} is already claimed by {owner}"
        )));
    }
    if task.status != TaskStatus::Created {
        return Err(ForemanError::Conflict(format!(
            "task {id} is {} and cannot be claimed",
            task.status
        )));
    }
    let overridden = state.claim_overrides.get(id) == Some(agent);
    if &task.assignee != agent && !overridden {
        return Err(ForemanError::PolicyViolation(format!(
            "task {id} is routed to {}, not {agent}",
            task.assignee
        )));
    }
    Ok(())
}

/// Override targets first, then tasks routed to `agent`; each group FIFO
/// by creation time with ties broken by id.
fn next_claimable(state: &LedgerState, agent: &Role) -> Option<TaskId> {
    let open = |task: &&Task| task.status == TaskStatus::Created && task.owner.is_none();
    let oldest = |mut ids: Vec<&Task>| {
        ids.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ids.first().map(|t| t.id.clone())
    };

    let directed: Vec<&Task> = state
        .claim_overrides
        .iter()
        .filter(|(_, target)| *target == agent)
        .filter_map(|(id, _)| state.tasks.get(id))
        .filter(open)
        .collect();
    oldest(directed).or_else(|| {
        oldest(
            state
                .tasks
                .values()
                .filter(open)
                .filter(|t| &t.assignee == agent)
                .collect(),
        )
    })
}

/// Move a task the caller owns to `in_progress`, or release it back to
/// `created`.
///
/// `reported`, `done` and `bug_open` are reached only through reports and
/// validation.
pub fn update_status(
    txn: &mut Txn<LedgerState>,
    agent: &Role,
    task_id: &TaskId,
    next: TaskStatus,
    note: &str,
    expected_version: Option<u64>,
) -> ForemanResult<Task> {
    let state = txn.state();
    let task = state.task(task_id)?;

    if !task.status.can_transition_to(next) {
        return Err(ForemanError::Conflict(format!(
            "task {task_id} cannot move from {} to {next}",
            task.status
        )));
    }
    let is_owner = task.owner.as_ref() == Some(agent);
    let overridden = state.claim_overrides.get(task_id) == Some(agent);
    if !is_owner && !overridden {
        return Err(ForemanError::PolicyViolation(format!(
            "{agent} does not own task {task_id}"
        )));
    }
    if !next.is_manual_target() {
        return Err(ForemanError::PolicyViolation(format!(
            "status '{next}' is set by reports and validation, not update_status"
        )));
    }
    if let Some(expected) = expected_version {
        if task.version != expected {
            return Err(ForemanError::StaleState(format!(
                "task {task_id} is at version {}, expected {expected}",
                task.version
            )));
        }
    }

    let now = txn.now();
    let state = txn.state_mut();
    touch(state, agent, now, true);
    let task = state.task_mut(task_id)?;
    let previous = task.status;
    if next == TaskStatus::Created {
        task.owner = None;
    }
    task.transition(next, agent, now, note);
    let task = task.clone();

    txn.publish(
        NewEvent::new(
            "task.status_changed",
            json!({ "task_id": task_id, "from": previous, "to": next, "note": note }),
        )
        .from_role(agent),
    );
    info!(task_id = %task_id, agent = %agent, from = %previous, to = %next, "Task status changed");
    Ok(task)
}

/// Store a worker report and move the task to `reported`.
///
/// Idempotent on `(task_id, commit_sha)`: a resubmission returns the stored
/// report and changes nothing.
pub fn ingest_report(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    submission: ReportSubmission,
) -> ForemanResult<Report> {
    submission.validate()?;

    if let Some(stored) = txn
        .state()
        .reports
        .iter()
        .find(|r| r.task_id == submission.task_id && r.commit_sha == submission.commit_sha)
    {
        return Ok(stored.clone());
    }

    let task = txn.state().task(&submission.task_id)?;
    if task.owner.as_ref() != Some(&submission.agent) {
        return Err(ForemanError::PolicyViolation(format!(
            "{} does not own task {}",
            submission.agent, submission.task_id
        )));
    }
    if !matches!(
        task.status,
        TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::BugOpen
    ) {
        return Err(ForemanError::Conflict(format!(
            "task {} is {} and cannot take a report",
            submission.task_id, task.status
        )));
    }

    let now = txn.now();
    let report = Report::from_submission(submission, now);
    let state = txn.state_mut();
    touch(state, &report.agent, now, true);
    state
        .task_mut(&report.task_id)?
        .transition(TaskStatus::Reported, &report.agent, now, report.commit_sha.as_str());
    state.reports.push(report.clone());

    let mut audience = vec![policy.manager_role().clone()];
    if policy.validator_role() != policy.manager_role() {
        audience.push(policy.validator_role().clone());
    }
    txn.publish(
        NewEvent::new(
            "task.reported",
            json!({
                "task_id": report.task_id,
                "commit_sha": report.commit_sha,
                "status": report.status,
                "passed": report.test_summary.passed,
                "failed": report.test_summary.failed,
            }),
        )
        .from_role(&report.agent)
        .to(audience),
    );
    info!(task_id = %report.task_id, agent = %report.agent, commit = %report.commit_sha, "Report ingested");
    Ok(report)
}

/// Accept or reject a reported task.
pub fn validate(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    task_id: &TaskId,
    passed: bool,
    notes: &str,
) -> ForemanResult<ValidationOutcome> {
    if !policy.may_validate(actor) {
        return Err(ForemanError::PolicyViolation(format!(
            "{actor} is not the validator (expected {})",
            policy.validator_role()
        )));
    }
    let task = txn.state().task(task_id)?;
    if task.status != TaskStatus::Reported {
        return Err(ForemanError::Conflict(format!(
            "task {task_id} is {}, only reported tasks can be validated",
            task.status
        )));
    }
    let owner = task.owner.clone();

    let now = txn.now();
    let next = if passed {
        TaskStatus::Done
    } else {
        TaskStatus::BugOpen
    };
    txn.state_mut()
        .task_mut(task_id)?
        .transition(next, actor, now, notes);

    let mut outcome = ValidationOutcome {
        task_id: task_id.clone(),
        passed,
        status: next,
        bug_id: None,
        resolved_bug_id: None,
    };

    let topic = if passed {
        outcome.resolved_bug_id = bugs::resolve(txn, task_id).map(|bug: Bug| bug.id);
        "validation.passed"
    } else {
        if policy.auto_open_bug_on_validation_failure() {
            let description = if notes.trim().is_empty() {
                "validation failed"
            } else {
                notes
            };
            let (bug, _) = bugs::open_or_append(txn, task_id, description);
            outcome.bug_id = Some(bug.id);
        }
        "validation.failed"
    };

    let mut event = NewEvent::new(
        topic,
        json!({ "task_id": task_id, "notes": notes, "bug_id": outcome.bug_id }),
    )
    .from_role(actor);
    if let Some(owner) = owner {
        event = event.to(vec![owner, actor.clone()]);
    }
    txn.publish(event);
    info!(task_id = %task_id, validator = %actor, passed, "Task validated");
    Ok(outcome)
}

/// Find held tasks whose owner is offline and, if the policy allows, put
/// them back in the queue.
///
/// `threshold` overrides the policy's heartbeat timeout. Running it again
/// finds nothing: requeued tasks are no longer held.
pub fn reassign_stale(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    now: DateTime<Utc>,
    threshold: Option<Duration>,
) -> ForemanResult<StaleSweep> {
    let timeout = threshold.unwrap_or_else(|| policy.heartbeat_timeout());
    let state = txn.state();

    let stale: Vec<StaleTask> = state
        .tasks
        .values()
        .filter(|task| task.status.is_held())
        .filter_map(|task| {
            let owner = task.owner.as_ref()?;
            is_offline(state, owner, timeout, now).then(|| StaleTask {
                task_id: task.id.clone(),
                owner: owner.clone(),
                status: task.status,
                heartbeat_age_secs: state
                    .agents
                    .get(owner)
                    .map(|a| now.signed_duration_since(a.last_heartbeat).num_seconds()),
            })
        })
        .collect();

    let notified = registry::notify_stale(txn, policy, now, timeout);
    let mut sweep = StaleSweep {
        stale,
        requeued: Vec::new(),
        notified,
    };
    if !policy.auto_requeue_on_offline() || sweep.stale.is_empty() {
        return Ok(sweep);
    }

    let actor = system_actor();
    let tx_now = txn.now();
    for entry in &sweep.stale {
        let task = txn.state_mut().task_mut(&entry.task_id)?;
        task.owner = None;
        task.transition(
            TaskStatus::Created,
            &actor,
            tx_now,
            format!("owner {} offline", entry.owner),
        );
        txn.publish(
            NewEvent::new(
                "task.requeued",
                json!({
                    "task_id": entry.task_id,
                    "previous_owner": entry.owner,
                    "heartbeat_age_secs": entry.heartbeat_age_secs,
                }),
            )
            .from_role(&actor),
        );
        warn!(task_id = %entry.task_id, owner = %entry.owner, "Requeued task from offline owner");
        sweep.requeued.push(entry.task_id.clone());
    }
    Ok(sweep)
}

/// Let `target` claim `task_id` next regardless of routing.
pub fn set_claim_override(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    task_id: &TaskId,
    target: &Role,
) -> ForemanResult<ClaimOverride> {
    if actor != policy.manager_role() {
        return Err(ForemanError::PolicyViolation(format!(
            "only {} may set claim overrides",
            policy.manager_role()
        )));
    }
    if target.is_blank() {
        return Err(ForemanError::Validation("target agent must not be empty".into()));
    }
    let task = txn.state().task(task_id)?;
    if let Some(owner) = task.owner.as_ref().filter(|o| *o != target) {
        return Err(ForemanError::PolicyViolation(format!(
            "task {task_id} is owned by {owner}, not {target}"
        )));
    }
    if task.status == TaskStatus::Done {
        return Err(ForemanError::Conflict(format!("task {task_id} is done")));
    }

    txn.state_mut()
        .claim_overrides
        .insert(task_id.clone(), target.clone());
    txn.publish(
        NewEvent::new(
            "claim_override.set",
            json!({ "task_id": task_id, "agent": target }),
        )
        .from_role(actor)
        .to(vec![target.clone()]),
    );
    info!(task_id = %task_id, agent = %target, "Claim override set");
    Ok(ClaimOverride {
        task_id: task_id.clone(),
        agent: target.clone(),
    })
}

/// Look up a task by id.
pub fn get(state: &LedgerState, task_id: &TaskId) -> ForemanResult<Task> {
    state.task(task_id).cloned()
}

/// Tasks matching `filter`, oldest first.
pub fn list(state: &LedgerState, filter: &TaskFilter) -> Vec<Task> {
    let mut tasks: Vec<Task> = state
        .tasks
        .values()
        .filter(|t| filter.matches(t))
        .cloned()
        .collect();
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    tasks
}

/// Stored reports for a task in submission order.
pub fn reports_for(state: &LedgerState, task_id: &TaskId) -> ForemanResult<Vec<Report>> {
    state.task(task_id)?;
    Ok(state
        .reports
        .iter()
        .filter(|r| &r.task_id == task_id)
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ledger, t0};
    use crate::types::{ReportStatus, TestSummary};
    use foreman_store::Ledger;

    fn manager() -> Role {
        Role::from("manager")
    }

    fn builder_a() -> Role {
        Role::from("builder_a")
    }

    fn new_task(title: &str, workstream: &str) -> NewTask {
        NewTask {
            title: title.into(),
            workstream: workstream.into(),
            ..NewTask::default()
        }
    }

    fn submission(task_id: &TaskId, agent: &Role, sha: &str) -> ReportSubmission {
        ReportSubmission {
            task_id: task_id.clone(),
            agent: agent.clone(),
            commit_sha: sha.into(),
            status: ReportStatus::Done,
            test_summary: TestSummary {
                command: "cargo test".into(),
                passed: 10,
                failed: 0,
            },
            artifacts: vec!["src/lib.rs".into()],
            notes: String::new(),
        }
    }

    fn seed(ledger: &Ledger<LedgerState>, policy: &Policy, req: NewTask) -> Task {
        ledger
            .transact(t0(), |txn| create(txn, policy, &manager(), req))
            .unwrap()
    }

    #[test]
    fn test_create_routes_by_workstream() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("Login API", "frontend"));
        assert_eq!(task.assignee, Role::from("builder_b"));
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.owner.is_none());
        assert_eq!(task.history.len(), 1);
    }

    #[test]
    fn test_create_without_route_is_policy_violation() {
        let (_dir, ledger) = ledger();
        let mut policy = Policy::default();
        policy.routing.clear();
        let err = ledger
            .transact(t0(), |txn| create(txn, &policy, &manager(), new_task("x", "ops")))
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));

        let mut req = new_task("x", "ops");
        req.owner = Some(Role::from("builder_c"));
        let task = seed(&ledger, &policy, req);
        assert_eq!(task.assignee, Role::from("builder_c"));
    }

    #[test]
    fn test_claim_next_is_fifo() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let first = seed(&ledger, &policy, new_task("first", "backend"));
        let second = ledger
            .transact(t0() + Duration::seconds(1), |txn| {
                create(txn, &policy, &manager(), new_task("second", "backend"))
            })
            .unwrap();

        let claimed = ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), None))
            .unwrap();
        assert_eq!(claimed.id, first.id);
        let claimed = ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), None))
            .unwrap();
        assert_eq!(claimed.id, second.id);

        let err = ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), None))
            .unwrap_err();
        assert!(matches!(err, ForemanError::NotFound(_)));
    }

    #[test]
    fn test_claim_taken_task_conflicts() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();
        let err = ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap_err();
        assert!(matches!(err, ForemanError::Conflict(_)));
    }

    #[test]
    fn test_claim_other_route_needs_override() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        let builder_b = Role::from("builder_b");

        let err = ledger
            .transact(t0(), |txn| claim(txn, &builder_b, Some(&task.id)))
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));

        ledger
            .transact(t0(), |txn| {
                set_claim_override(txn, &policy, &manager(), &task.id, &builder_b)
            })
            .unwrap();
        let claimed = ledger
            .transact(t0(), |txn| claim(txn, &builder_b, None))
            .unwrap();
        assert_eq!(claimed.owner, Some(builder_b));
        assert!(ledger.snapshot().unwrap().state.claim_overrides.is_empty());
    }

    #[test]
    fn test_override_kept_when_assignee_claims() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        let builder_b = Role::from("builder_b");
        ledger
            .transact(t0(), |txn| {
                set_claim_override(txn, &policy, &manager(), &task.id, &builder_b)
            })
            .unwrap();

        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();
        let view = ledger.view().unwrap();
        assert_eq!(view.snapshot.state.claim_overrides.get(&task.id), Some(&builder_b));
        let claimed = view
            .events
            .iter()
            .rfind(|e| e.topic == "task.claimed")
            .unwrap();
        assert_eq!(claimed.payload["via_override"], false);
    }

    #[test]
    fn test_override_must_match_current_owner() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();
        let err = ledger
            .transact(t0(), |txn| {
                set_claim_override(txn, &policy, &manager(), &task.id, &Role::from("builder_b"))
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));

        let err = ledger
            .transact(t0(), |txn| {
                set_claim_override(txn, &policy, &builder_a(), &task.id, &builder_a())
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));
    }

    #[test]
    fn test_update_status_rules() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        let claimed = ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();

        let err = ledger
            .transact(t0(), |txn| {
                update_status(txn, &Role::from("builder_b"), &task.id, TaskStatus::InProgress, "", None)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));

        let err = ledger
            .transact(t0(), |txn| {
                update_status(txn, &builder_a(), &task.id, TaskStatus::Done, "", None)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::Conflict(_)));

        // Not adjacent, even for a non-owner.
        let err = ledger
            .transact(t0(), |txn| {
                update_status(txn, &Role::from("builder_b"), &task.id, TaskStatus::BugOpen, "", None)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::Conflict(_)));

        // Adjacent, but only a report moves a task to reported.
        let err = ledger
            .transact(t0(), |txn| {
                update_status(txn, &builder_a(), &task.id, TaskStatus::Reported, "", None)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));

        let err = ledger
            .transact(t0(), |txn| {
                update_status(
                    txn,
                    &builder_a(),
                    &task.id,
                    TaskStatus::InProgress,
                    "",
                    Some(claimed.version + 7),
                )
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::StaleState(_)));

        let moved = ledger
            .transact(t0(), |txn| {
                update_status(
                    txn,
                    &builder_a(),
                    &task.id,
                    TaskStatus::InProgress,
                    "starting",
                    Some(claimed.version),
                )
            })
            .unwrap();
        assert_eq!(moved.status, TaskStatus::InProgress);

        let err = ledger
            .transact(t0(), |txn| {
                update_status(txn, &builder_a(), &task.id, TaskStatus::InProgress, "", None)
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::Conflict(_)));
    }

    #[test]
    fn test_release_returns_task_to_queue() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();
        let released = ledger
            .transact(t0(), |txn| {
                update_status(txn, &builder_a(), &task.id, TaskStatus::Created, "handing back", None)
            })
            .unwrap();
        assert_eq!(released.status, TaskStatus::Created);
        assert!(released.owner.is_none());
    }

    #[test]
    fn test_report_is_idempotent() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();

        let first = ledger
            .transact(t0(), |txn| {
                ingest_report(txn, &policy, submission(&task.id, &builder_a(), "abc123"))
            })
            .unwrap();
        let revision = ledger.snapshot().unwrap().revision;
        let again = ledger
            .transact(t0() + Duration::seconds(30), |txn| {
                ingest_report(txn, &policy, submission(&task.id, &builder_a(), "abc123"))
            })
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(ledger.snapshot().unwrap().revision, revision);
        assert_eq!(
            reports_for(&ledger.snapshot().unwrap().state, &task.id).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_report_from_non_owner_rejected() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        let err = ledger
            .transact(t0(), |txn| {
                ingest_report(txn, &policy, submission(&task.id, &builder_a(), "abc123"))
            })
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));
    }

    #[test]
    fn test_validate_requires_validator_and_reported() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));

        let err = ledger
            .transact(t0(), |txn| validate(txn, &policy, &manager(), &task.id, true, ""))
            .unwrap_err();
        assert!(matches!(err, ForemanError::Conflict(_)));

        let err = ledger
            .transact(t0(), |txn| validate(txn, &policy, &builder_a(), &task.id, true, ""))
            .unwrap_err();
        assert!(matches!(err, ForemanError::PolicyViolation(_)));
    }

    #[test]
    fn test_fail_without_auto_bug_still_bug_open() {
        let (_dir, ledger) = ledger();
        let mut policy = Policy::default();
        policy.triggers.auto_open_bug_on_validation_failure = false;
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| {
                claim(txn, &builder_a(), Some(&task.id))?;
                ingest_report(txn, &policy, submission(&task.id, &builder_a(), "c1"))
            })
            .unwrap();
        let outcome = ledger
            .transact(t0(), |txn| validate(txn, &policy, &manager(), &task.id, false, "red"))
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::BugOpen);
        assert!(outcome.bug_id.is_none());
        assert!(ledger.snapshot().unwrap().state.bugs.is_empty());
    }

    #[test]
    fn test_reassign_stale_requeues_offline_owner_once() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();

        let fresh = t0() + Duration::seconds(5);
        let sweep = ledger
            .transact(fresh, |txn| reassign_stale(txn, &policy, fresh, None))
            .unwrap();
        assert!(sweep.stale.is_empty());

        let late = t0() + policy.heartbeat_timeout() + Duration::seconds(1);
        let sweep = ledger
            .transact(late, |txn| reassign_stale(txn, &policy, late, None))
            .unwrap();
        assert_eq!(sweep.requeued, vec![task.id.clone()]);
        assert_eq!(sweep.notified, vec![builder_a()]);
        let state = ledger.snapshot().unwrap().state;
        assert_eq!(state.tasks[&task.id].status, TaskStatus::Created);
        assert!(state.tasks[&task.id].owner.is_none());

        let revision = ledger.snapshot().unwrap().revision;
        let sweep = ledger
            .transact(late, |txn| reassign_stale(txn, &policy, late, None))
            .unwrap();
        assert_eq!(sweep, StaleSweep::default());
        assert_eq!(ledger.snapshot().unwrap().revision, revision);
    }

    #[test]
    fn test_reassign_stale_reports_only_when_requeue_disabled() {
        let (_dir, ledger) = ledger();
        let mut policy = Policy::default();
        policy.triggers.auto_requeue_on_offline = false;
        let task = seed(&ledger, &policy, new_task("t", "backend"));
        ledger
            .transact(t0(), |txn| claim(txn, &builder_a(), Some(&task.id)))
            .unwrap();
        let late = t0() + Duration::seconds(30);
        let sweep = ledger
            .transact(late, |txn| {
                reassign_stale(txn, &policy, late, Some(Duration::seconds(10)))
            })
            .unwrap();
        assert_eq!(sweep.stale.len(), 1);
        assert!(sweep.requeued.is_empty());
        assert_eq!(
            ledger.snapshot().unwrap().state.tasks[&task.id].status,
            TaskStatus::Claimed
        );
    }

    #[test]
    fn test_list_filters() {
        let (_dir, ledger) = ledger();
        let policy = Policy::default();
        seed(&ledger, &policy, new_task("a", "backend"));
        seed(&ledger, &policy, new_task("b", "frontend"));
        let state = ledger.snapshot().unwrap().state;
        let filter = TaskFilter {
            workstream: Some("frontend".into()),
            ..TaskFilter::default()
        };
        let tasks = list(&state, &filter);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "b");
        assert_eq!(list(&state, &TaskFilter::default()).len(), 2);
    }
}
