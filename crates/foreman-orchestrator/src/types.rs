use chrono::{DateTime, Utc};
use foreman_core::{BugId, ForemanError, ForemanResult, Role, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Actor recorded for transitions the engine performs on its own.
pub const SYSTEM_ACTOR: &str = "foreman";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Created,
    /// Owned, work not started.
    Claimed,
    /// Owned and being worked on.
    InProgress,
    /// A report was submitted; awaiting validation.
    Reported,
    /// Validation failed; the owner must resubmit.
    BugOpen,
    /// Validated. Terminal.
    Done,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Created,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::Reported,
        TaskStatus::BugOpen,
        TaskStatus::Done,
    ];

    /// Legal successors of this status.
    pub fn successors(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Created => &[Claimed],
            Claimed => &[InProgress, Reported, Created],
            InProgress => &[Reported, Created],
            Reported => &[Done, BugOpen],
            BugOpen => &[InProgress, Reported],
            Done => &[],
        }
    }

    /// Whether `next` is adjacent to this status.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Claimed or in progress: an owner is actively responsible.
    pub fn is_held(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }

    /// Statuses an owner may set directly. `reported`, `done` and
    /// `bug_open` are reached only through reports and validation.
    pub fn is_manual_target(self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Created)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Reported => "reported",
            TaskStatus::BugOpen => "bug_open",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ForemanError::Validation(format!("unknown task status '{s}'")))
    }
}

/// One entry of a task's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Status entered.
    pub status: TaskStatus,
    /// Role that caused the move.
    pub actor: Role,
    /// When the move happened.
    pub at: DateTime<Utc>,
    /// Free-form reason, empty when none was given.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// A unit of work in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, `TASK-` prefixed.
    pub id: TaskId,
    /// Short summary.
    pub title: String,
    /// Longer free-form text.
    #[serde(default)]
    pub description: String,
    /// Workstream used for routing.
    pub workstream: String,
    /// Role the task is routed to.
    pub assignee: Role,
    /// Role currently holding the claim.
    pub owner: Option<Role>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// What a passing report must demonstrate.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Incremented on every write to this task.
    pub version: u64,
    /// Every status the task has entered, oldest first.
    pub history: Vec<Transition>,
}

impl Task {
    /// Move to `next`, recording the actor. Adjacency is the caller's concern.
    pub(crate) fn transition(
        &mut self,
        next: TaskStatus,
        actor: &Role,
        now: DateTime<Utc>,
        note: impl Into<String>,
    ) {
        self.status = next;
        self.updated_at = now;
        self.version += 1;
        self.history.push(Transition {
            status: next,
            actor: actor.clone(),
            at: now,
            note: note.into(),
        });
    }
}

/// Outcome the worker declares in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The worker believes the task is complete.
    Done,
    /// Some of the work is done.
    Partial,
    /// The worker cannot proceed.
    Blocked,
}

/// Test run attached to a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Command that produced the counts.
    pub command: String,
    /// Passing tests.
    pub passed: u32,
    /// Failing tests.
    pub failed: u32,
}

/// A worker report as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportSubmission {
    /// Task the report is for.
    pub task_id: TaskId,
    /// Reporting role; must own the task.
    pub agent: Role,
    /// Commit the report describes. Part of the idempotency key.
    pub commit_sha: String,
    /// Outcome the worker declares.
    pub status: ReportStatus,
    /// Test run behind the report.
    pub test_summary: TestSummary,
    /// Paths of files produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
}

impl ReportSubmission {
    /// Reject structurally valid but meaningless payloads.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.task_id.as_str().trim().is_empty() {
            return Err(ForemanError::Validation("task_id must not be empty".into()));
        }
        if self.agent.is_blank() {
            return Err(ForemanError::Validation("agent must not be empty".into()));
        }
        let sha = self.commit_sha.trim();
        if sha.is_empty() || sha.chars().any(char::is_whitespace) {
            return Err(ForemanError::Validation(format!(
                "commit_sha '{}' is not a commit identifier",
                self.commit_sha
            )));
        }
        if self.artifacts.iter().any(|a| a.trim().is_empty()) {
            return Err(ForemanError::Validation(
                "artifact paths must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A stored report. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Task the report is for.
    pub task_id: TaskId,
    /// Reporting role.
    pub agent: Role,
    /// Commit the report describes.
    pub commit_sha: String,
    /// Outcome the worker declares.
    pub status: ReportStatus,
    /// Test run behind the report.
    pub test_summary: TestSummary,
    /// Paths of files produced.
    pub artifacts: Vec<String>,
    /// Free-form notes.
    pub notes: String,
    /// When the report was stored.
    pub timestamp: DateTime<Utc>,
}

impl Report {
    pub(crate) fn from_submission(submission: ReportSubmission, now: DateTime<Utc>) -> Self {
        Self {
            task_id: submission.task_id,
            agent: submission.agent,
            commit_sha: submission.commit_sha,
            status: submission.status,
            test_summary: submission.test_summary,
            artifacts: submission.artifacts,
            notes: submission.notes,
            timestamp: now,
        }
    }
}

/// Lifecycle of a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BugStatus {
    /// Awaiting a passing validation.
    Open,
    /// Closed by a passing validation.
    Resolved,
}

/// A note appended to a bug by a validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugNote {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Note text.
    pub text: String,
}

/// A defect raised against a task's current validation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    /// Identifier, `BUG-` prefixed.
    pub id: BugId,
    /// Task the bug was raised against.
    pub task_id: TaskId,
    /// Owner of the task when the bug was last recorded.
    #[serde(default)]
    pub owner: Option<Role>,
    /// Open or resolved.
    pub status: BugStatus,
    /// Text of the first failure.
    pub description: String,
    /// Every recorded failure, oldest first.
    pub history: Vec<BugNote>,
    /// When the bug was opened.
    pub opened_at: DateTime<Utc>,
    /// Set once a passing validation closes the bug.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Incremented on every write.
    pub version: u64,
}

/// Registered participant. Liveness is derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent role; the registry key.
    pub role: Role,
    /// Free-form data supplied at registration.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// First contact.
    pub registered_at: DateTime<Utc>,
    /// Last proof of life: register, heartbeat, claim, report, poll or ack.
    pub last_heartbeat: DateTime<Utc>,
    /// Last task-affecting call.
    pub last_activity: Option<DateTime<Utc>>,
    /// Highest acknowledged event sequence.
    pub cursor: u64,
    /// Incremented on every write.
    pub version: u64,
}

/// Derived presence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heartbeating and recently busy, or holding work.
    Active,
    /// Heartbeating without recent task activity.
    Idle,
    /// Past the heartbeat timeout.
    Offline,
}

/// How a decision's winner was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// A single option had the most votes.
    Plurality,
    /// Tie broken by the manager's vote.
    ManagerVote,
    /// Tie broken by the earliest configured voter among the tied options.
    FirstVoter,
    /// The manager forced the outcome.
    ManagerOverride,
}

/// Outcome of a resolved decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Winning option.
    pub winner: String,
    /// How the winner was chosen.
    pub method: ResolutionMethod,
    /// When the decision was resolved.
    pub resolved_at: DateTime<Utc>,
    /// Role that cast the resolving vote or forced the result.
    pub resolved_by: Role,
}

/// An architecture decision collecting votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique name; also the ADR title.
    pub topic: String,
    /// Options in the order they were offered.
    pub options: Vec<String>,
    /// Voter roles in configured order.
    pub voters: Vec<Role>,
    /// Number of votes that triggers automatic resolution.
    pub quorum: usize,
    /// Latest vote per role.
    pub votes: BTreeMap<Role, String>,
    /// Rationale per role, when one was given.
    pub rationale: BTreeMap<Role, String>,
    /// Role that opened the decision.
    pub opened_by: Role,
    /// When the bug was opened.
    pub opened_at: DateTime<Utc>,
    /// Set once; further votes are rejected.
    pub resolution: Option<Resolution>,
    /// Incremented on every write.
    pub version: u64,
}

impl Decision {
    /// Whether a winner has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Whether enough votes are in for automatic resolution.
    pub fn quorum_reached(&self) -> bool {
        self.votes.len() >= self.quorum
    }
}

/// Everything the ledger persists besides the event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    /// Every task, keyed by id.
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, Task>,
    /// Known agents, keyed by role.
    #[serde(default)]
    pub agents: BTreeMap<Role, AgentRecord>,
    /// Every bug, keyed by id.
    #[serde(default)]
    pub bugs: BTreeMap<BugId, Bug>,
    /// Stored reports in submission order.
    #[serde(default)]
    pub reports: Vec<Report>,
    /// Decisions keyed by topic.
    #[serde(default)]
    pub decisions: BTreeMap<String, Decision>,
    /// One-shot claim directives: task -> role allowed to claim it next.
    #[serde(default)]
    pub claim_overrides: BTreeMap<TaskId, Role>,
    /// When each offline agent was last told to reconnect. Cleared on the
    /// agent's next sign of life.
    #[serde(default)]
    pub stale_notices: BTreeMap<Role, DateTime<Utc>>,
}

impl LedgerState {
    pub(crate) fn task(&self, id: &TaskId) -> ForemanResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| ForemanError::NotFound(format!("task {id}")))
    }

    pub(crate) fn task_mut(&mut self, id: &TaskId) -> ForemanResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ForemanError::NotFound(format!("task {id}")))
    }

    pub(crate) fn agent(&self, role: &Role) -> ForemanResult<&AgentRecord> {
        self.agents
            .get(role)
            .ok_or_else(|| ForemanError::NotFound(format!("agent {role}")))
    }

    pub(crate) fn decision_mut(&mut self, topic: &str) -> ForemanResult<&mut Decision> {
        self.decisions
            .get_mut(topic)
            .ok_or_else(|| ForemanError::NotFound(format!("decision '{topic}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacency_table() {
        use TaskStatus::*;
        assert!(Created.can_transition_to(Claimed));
        assert!(!Created.can_transition_to(InProgress));
        assert!(!Created.can_transition_to(Done));
        assert!(Reported.can_transition_to(BugOpen));
        assert!(BugOpen.can_transition_to(Reported));
        assert!(!BugOpen.can_transition_to(Done));
        assert!(Done.successors().is_empty());
    }

    #[test]
    fn test_status_parse_matches_wire_name() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
        assert!("validated".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_report_submission_requires_commit() {
        let submission = ReportSubmission {
            task_id: TaskId::from("TASK-1"),
            agent: Role::from("builder_a"),
            commit_sha: "  ".into(),
            status: ReportStatus::Done,
            test_summary: TestSummary {
                command: "cargo test".into(),
                passed: 1,
                failed: 0,
            },
            artifacts: vec![],
            notes: String::new(),
        };
        assert!(matches!(
            submission.validate(),
            Err(ForemanError::Validation(_))
        ));
    }

    #[test]
    fn test_report_submission_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "task_id": "TASK-1",
            "agent": "builder_a",
            "commit_sha": "abc123",
            "status": "done",
            "test_summary": {"command": "make test", "passed": 3, "failed": 0},
            "surprise": true
        });
        assert!(serde_json::from_value::<ReportSubmission>(raw).is_err());
    }

    #[test]
    fn test_report_submission_rejects_negative_counts() {
        let raw = serde_json::json!({
            "task_id": "TASK-1",
            "agent": "builder_a",
            "commit_sha": "abc123",
            "status": "done",
            "test_summary": {"command": "make test", "passed": -1, "failed": 0}
        });
        assert!(serde_json::from_value::<ReportSubmission>(raw).is_err());
    }
}
