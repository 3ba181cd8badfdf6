use crate::types::{Bug, BugNote, BugStatus, LedgerState};
use foreman_core::{BugId, Role, TaskId};
use foreman_store::{NewEvent, Txn};
use tracing::info;

/// Open a bug for `task_id`, or append to the one already open.
///
/// The bug records the task's current owner. Returns the bug and whether it
/// was newly opened.
pub fn open_or_append(
    txn: &mut Txn<LedgerState>,
    task_id: &TaskId,
    description: &str,
) -> (Bug, bool) {
    let now = txn.now();
    let note = BugNote {
        at: now,
        text: description.to_string(),
    };

    let owner = txn.state().tasks.get(task_id).and_then(|t| t.owner.clone());
    let existing = open_bug_id(txn.state(), task_id);
    let (bug, opened) = match existing.and_then(|id| txn.state_mut().bugs.get_mut(&id)) {
        Some(bug) => {
            bug.history.push(note);
            if owner.is_some() {
                bug.owner = owner;
            }
            bug.version += 1;
            (bug.clone(), false)
        }
        None => {
            let bug = Bug {
                id: BugId::generate(),
                task_id: task_id.clone(),
                owner,
                status: BugStatus::Open,
                description: description.to_string(),
                history: vec![note],
                opened_at: now,
                resolved_at: None,
                version: 1,
            };
            txn.state_mut().bugs.insert(bug.id.clone(), bug.clone());
            (bug, true)
        }
    };

    let topic = if opened { "bug.opened" } else { "bug.updated" };
    txn.publish(NewEvent::new(
        topic,
        serde_json::json!({
            "bug_id": bug.id,
            "task_id": task_id,
            "owner": bug.owner,
            "description": description,
        }),
    ));
    info!(bug_id = %bug.id, task_id = %task_id, opened, "Bug recorded");
    (bug, opened)
}

/// Resolve the open bug of `task_id`. No-op when none is open.
pub fn resolve(txn: &mut Txn<LedgerState>, task_id: &TaskId) -> Option<Bug> {
    let id = open_bug_id(txn.state(), task_id)?;
    let now = txn.now();
    let bug = txn.state_mut().bugs.get_mut(&id)?;
    bug.status = BugStatus::Resolved;
    bug.resolved_at = Some(now);
    bug.version += 1;
    let bug = bug.clone();

    txn.publish(NewEvent::new(
        "bug.resolved",
        serde_json::json!({ "bug_id": bug.id, "task_id": task_id }),
    ));
    info!(bug_id = %bug.id, task_id = %task_id, "Bug resolved");
    Some(bug)
}

/// Bugs, optionally filtered by status and owner, oldest first.
pub fn list(state: &LedgerState, status: Option<BugStatus>, owner: Option<&Role>) -> Vec<Bug> {
    let mut bugs: Vec<Bug> = state
        .bugs
        .values()
        .filter(|bug| status.is_none_or(|s| bug.status == s))
        .filter(|bug| owner.is_none_or(|o| bug.owner.as_ref() == Some(o)))
        .cloned()
        .collect();
    bugs.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
    bugs
}

fn open_bug_id(state: &LedgerState, task_id: &TaskId) -> Option<BugId> {
    state
        .bugs
        .values()
        .find(|bug| &bug.task_id == task_id && bug.status == BugStatus::Open)
        .map(|bug| bug.id.clone())
}
