//! Coordination engine for one manager and several builder processes that
//! share nothing but a ledger directory.
//!
//! Tasks move through a closed state machine, reports are validated into
//! pass/bug outcomes, offline owners lose their claims, an event bus with
//! per-agent cursors carries notifications, and architecture decisions are
//! settled by vote. All of it is driven by a swappable [`Policy`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Async facade: one ledger transaction per operation.
//! - [`Policy`]: Routing, validator, liveness and voting rules.
//! - [`Task`] / [`TaskStatus`]: Work items and their adjacency table.
//! - [`PollBatch`]: Result of a bounded wait on the event bus.
//! - [`dispatch`]: Named-operation entry point used by the CLI server.

/// Bug lifecycle tied to a task's validation cycle.
pub mod bugs;
/// Event publishing, selection and cursors.
pub mod bus;
/// Manager sweep and status summary.
pub mod cycle;
/// Architecture decision voting and ADR rendering.
pub mod decisions;
/// Named-operation dispatch over [`foreman_core::ToolCall`].
pub mod dispatch;
/// The async orchestrator facade.
pub mod engine;
/// Policy document schema and evaluation.
pub mod policy;
/// Agent registry and liveness classification.
pub mod registry;
/// Task lifecycle operations.
pub mod tasks;
/// Persisted entity types.
pub mod types;

pub use bus::{PollBatch, PollOptions};
pub use cycle::{ManagerCycle, StatusSummary, WorkstreamProgress};
pub use decisions::NewDecision;
pub use dispatch::{dispatch, OperationDescriptor, OPERATIONS};
pub use engine::{Clock, ManualClock, Orchestrator, SystemClock};
pub use policy::{Policy, TieBreak};
pub use registry::{AgentSummary, Metadata};
pub use tasks::{ClaimOverride, NewTask, StaleSweep, StaleTask, TaskFilter, ValidationOutcome};
pub use types::{
    AgentRecord, Bug, BugStatus, Decision, LedgerState, Liveness, Report, ReportStatus,
    ReportSubmission, Resolution, ResolutionMethod, Task, TaskStatus, TestSummary, Transition,
};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::LedgerState;
    use chrono::{DateTime, Utc};
    use foreman_store::Ledger;

    pub(crate) fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-03T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub(crate) fn ledger() -> (tempfile::TempDir, Ledger<LedgerState>) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        (dir, ledger)
    }
}
