use crate::bus::{self, PollBatch, PollOptions};
use crate::cycle::{self, ManagerCycle, StatusSummary};
use crate::decisions::{self, NewDecision};
use crate::policy::Policy;
use crate::registry::{self, touch, AgentSummary, Metadata};
use crate::tasks::{self, ClaimOverride, NewTask, StaleSweep, TaskFilter, ValidationOutcome};
use crate::types::{
    AgentRecord, Bug, BugStatus, Decision, LedgerState, Report, ReportSubmission, Task, TaskStatus,
};
use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult, Role, TaskId};
use foreman_store::{EventRecord, Ledger, Snapshot, Txn, View};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// A clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Upper bound on a single poll wait.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// The coordination engine.
///
/// Every operation is one ledger transaction run on the blocking pool; the
/// ledger on disk is the only state. The active [`Policy`] can be swapped at
/// runtime with [`Orchestrator::reload_policy`].
pub struct Orchestrator {
    ledger: Arc<Ledger<LedgerState>>,
    policy: RwLock<Arc<Policy>>,
    clock: Arc<dyn Clock>,
    /// Signalled after every commit from this process.
    committed: Arc<Notify>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.ledger.root())
            .field("policy", &self.policy.read().name)
            .finish()
    }
}

impl Orchestrator {
    /// Open the ledger at `root` under `policy`.
    pub fn open(root: impl Into<PathBuf>, policy: Policy) -> ForemanResult<Self> {
        policy.validate()?;
        let ledger = Ledger::open(root)?;
        info!(root = %ledger.root().display(), policy = %policy.name, "Orchestrator ready");
        Ok(Self {
            ledger: Arc::new(ledger),
            policy: RwLock::new(Arc::new(policy)),
            clock: Arc::new(SystemClock),
            committed: Arc::new(Notify::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Ledger directory.
    pub fn root(&self) -> &Path {
        self.ledger.root()
    }

    /// The policy in effect right now.
    pub fn policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read())
    }

    /// Swap the active policy. Invalid documents are rejected and the
    /// current policy stays in force.
    pub fn reload_policy(&self, policy: Policy) -> ForemanResult<()> {
        policy.validate()?;
        let name = policy.name.clone();
        *self.policy.write() = Arc::new(policy);
        info!(policy = %name, "Policy reloaded");
        Ok(())
    }

    /// Current time from the configured clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn write<T, F>(&self, f: F) -> ForemanResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Txn<LedgerState>, &Policy) -> ForemanResult<T> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        let policy = self.policy();
        let now = self.clock.now();
        let out = tokio::task::spawn_blocking(move || ledger.transact(now, |txn| f(txn, &policy)))
            .await
            .map_err(join_error)??;
        self.committed.notify_waiters();
        Ok(out)
    }

    async fn snapshot(&self) -> ForemanResult<Snapshot<LedgerState>> {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || ledger.snapshot())
            .await
            .map_err(join_error)?
    }

    async fn view(&self) -> ForemanResult<View<LedgerState>> {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || ledger.view())
            .await
            .map_err(join_error)?
    }

    async fn read<T, F>(&self, f: F) -> ForemanResult<T>
    where
        F: FnOnce(&LedgerState, &Policy, DateTime<Utc>) -> ForemanResult<T>,
    {
        let snapshot = self.snapshot().await?;
        f(&snapshot.state, &self.policy(), self.clock.now())
    }

    // -- Tasks ------------------------------------------------------------

    /// Create a task routed by policy.
    pub async fn create_task(&self, actor: &Role, request: NewTask) -> ForemanResult<Task> {
        let actor = actor.clone();
        self.write(move |txn, policy| tasks::create(txn, policy, &actor, request))
            .await
    }

    /// Claim a specific task, or the next one routed to `agent`.
    pub async fn claim_task(&self, agent: &Role, task_id: Option<TaskId>) -> ForemanResult<Task> {
        let agent = agent.clone();
        self.write(move |txn, _| tasks::claim(txn, &agent, task_id.as_ref()))
            .await
    }

    /// Owner-driven status change; see [`tasks::update_status`].
    pub async fn update_status(
        &self,
        agent: &Role,
        task_id: &TaskId,
        status: TaskStatus,
        note: &str,
        expected_version: Option<u64>,
    ) -> ForemanResult<Task> {
        let (agent, task_id, note) = (agent.clone(), task_id.clone(), note.to_string());
        self.write(move |txn, _| {
            tasks::update_status(txn, &agent, &task_id, status, &note, expected_version)
        })
        .await
    }

    /// Store a report; idempotent on `(task_id, commit_sha)`.
    pub async fn submit_report(&self, submission: ReportSubmission) -> ForemanResult<Report> {
        self.write(move |txn, policy| tasks::ingest_report(txn, policy, submission))
            .await
    }

    /// Pass or fail a reported task.
    pub async fn validate_task(
        &self,
        actor: &Role,
        task_id: &TaskId,
        passed: bool,
        notes: &str,
    ) -> ForemanResult<ValidationOutcome> {
        let (actor, task_id, notes) = (actor.clone(), task_id.clone(), notes.to_string());
        self.write(move |txn, policy| {
            tasks::validate(txn, policy, &actor, &task_id, passed, &notes)
        })
        .await
    }

    /// Requeue tasks held by offline owners. `threshold` overrides the
    /// policy's heartbeat timeout.
    pub async fn reassign_stale(
        &self,
        threshold: Option<chrono::Duration>,
    ) -> ForemanResult<StaleSweep> {
        let sweep = self
            .write(move |txn, policy| {
                let now = txn.now();
                tasks::reassign_stale(txn, policy, now, threshold)
            })
            .await?;
        if !sweep.stale.is_empty() {
            info!(stale = sweep.stale.len(), requeued = sweep.requeued.len(), "Stale sweep");
        }
        Ok(sweep)
    }

    /// Let `target` claim `task_id` regardless of routing.
    pub async fn set_claim_override(
        &self,
        actor: &Role,
        task_id: &TaskId,
        target: &Role,
    ) -> ForemanResult<ClaimOverride> {
        let (actor, task_id, target) = (actor.clone(), task_id.clone(), target.clone());
        self.write(move |txn, policy| {
            tasks::set_claim_override(txn, policy, &actor, &task_id, &target)
        })
        .await
    }

    /// Look up a task by id.
    pub async fn get_task(&self, task_id: &TaskId) -> ForemanResult<Task> {
        self.read(|state, _, _| tasks::get(state, task_id)).await
    }

    /// Tasks matching `filter`, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> ForemanResult<Vec<Task>> {
        self.read(|state, _, _| Ok(tasks::list(state, filter))).await
    }

    /// Reports stored for a task, in submission order.
    pub async fn get_reports(&self, task_id: &TaskId) -> ForemanResult<Vec<Report>> {
        self.read(|state, _, _| tasks::reports_for(state, task_id))
            .await
    }

    // -- Agents -----------------------------------------------------------

    /// Create or refresh an agent record.
    pub async fn register_agent(&self, role: &Role, metadata: Metadata) -> ForemanResult<AgentRecord> {
        let role = role.clone();
        self.write(move |txn, _| registry::register(txn, &role, metadata))
            .await
    }

    /// Refresh a registered agent's heartbeat.
    pub async fn heartbeat(&self, role: &Role) -> ForemanResult<AgentRecord> {
        let role = role.clone();
        self.write(move |txn, _| registry::heartbeat(txn, &role)).await
    }

    /// Every agent with its derived liveness.
    pub async fn list_agents(&self) -> ForemanResult<Vec<AgentSummary>> {
        self.read(|state, policy, now| Ok(registry::list(state, policy, now)))
            .await
    }

    // -- Events -----------------------------------------------------------

    /// Append an event with the next sequence number.
    pub async fn publish_event(
        &self,
        source: Option<&Role>,
        topic: &str,
        payload: serde_json::Value,
        audience: Vec<Role>,
    ) -> ForemanResult<EventRecord> {
        let (source, topic) = (source.cloned(), topic.to_string());
        self.write(move |txn, _| bus::publish(txn, source.as_ref(), &topic, payload, audience))
            .await
    }

    /// Wait up to `timeout` for events visible to `agent`.
    ///
    /// Wakes on commits made through this engine and re-reads the log every
    /// `bus.poll_recheck_ms` to catch other processes. Returns an empty
    /// batch on timeout.
    pub async fn poll_events(
        &self,
        agent: &Role,
        timeout: Duration,
        options: PollOptions,
    ) -> ForemanResult<PollBatch> {
        if agent.is_blank() {
            return Err(ForemanError::Validation("agent role must not be empty".into()));
        }
        let fresh = self
            .read(|state, policy, now| {
                let due = registry::presence_due(state, agent, policy, now);
                Ok(state.agents.get(agent).filter(|_| !due).map(|a| a.cursor))
            })
            .await?;
        let stored = match fresh {
            Some(cursor) => cursor,
            None => {
                let role = agent.clone();
                self.write(move |txn, _| {
                    let now = txn.now();
                    touch(txn.state_mut(), &role, now, false);
                    bus::cursor(txn.state(), &role)
                })
                .await?
            }
        };

        let start = options.cursor.unwrap_or(stored);
        let limit = options
            .limit
            .unwrap_or(self.policy().bus.default_poll_limit)
            .max(1);
        let deadline = Instant::now() + timeout.min(MAX_POLL_TIMEOUT);

        let batch = loop {
            let notified = self.committed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let view = self.view().await?;
            let (events, next_cursor) = bus::select(&view.events, agent, start, limit);
            let now = Instant::now();
            if !events.is_empty() || now >= deadline {
                break PollBatch {
                    agent: agent.clone(),
                    cursor: start,
                    next_cursor,
                    head: view.snapshot.event_head,
                    events,
                };
            }
            let wait = (deadline - now).min(self.policy().poll_recheck());
            let _ = tokio::time::timeout(wait, notified).await;
        };

        debug!(agent = %agent, cursor = start, returned = batch.events.len(), "Poll");
        if options.auto_ack && batch.next_cursor > stored {
            self.ack_event(agent, batch.next_cursor).await?;
        }
        Ok(batch)
    }

    /// Advance `agent`'s cursor; backwards or out-of-range values clamp.
    pub async fn ack_event(&self, agent: &Role, seq: u64) -> ForemanResult<u64> {
        let agent = agent.clone();
        self.write(move |txn, _| bus::ack(txn, &agent, seq)).await
    }

    /// Stored cursor of `agent`.
    pub async fn get_cursor(&self, agent: &Role) -> ForemanResult<u64> {
        self.read(|state, _, _| bus::cursor(state, agent)).await
    }

    // -- Bugs -------------------------------------------------------------

    /// Bugs by status and by the owner of their task.
    pub async fn list_bugs(
        &self,
        status: Option<BugStatus>,
        owner: Option<&Role>,
    ) -> ForemanResult<Vec<Bug>> {
        self.read(|state, _, _| Ok(crate::bugs::list(state, status, owner)))
            .await
    }

    // -- Decisions --------------------------------------------------------

    /// Open a decision for voting.
    pub async fn open_decision(&self, actor: &Role, request: NewDecision) -> ForemanResult<Decision> {
        let actor = actor.clone();
        self.write(move |txn, policy| decisions::open(txn, policy, &actor, request))
            .await
    }

    /// Cast a vote. Writes the ADR when the vote resolves the decision.
    pub async fn vote(
        &self,
        role: &Role,
        topic: &str,
        option: &str,
        rationale: &str,
    ) -> ForemanResult<Decision> {
        let (role, topic, option, rationale) = (
            role.clone(),
            topic.to_string(),
            option.to_string(),
            rationale.to_string(),
        );
        let decision = self
            .write(move |txn, policy| {
                decisions::vote(txn, policy, &role, &topic, &option, &rationale)
            })
            .await?;
        if decision.is_resolved() {
            self.record_adr(&decision).await;
        }
        Ok(decision)
    }

    /// Resolve explicitly, optionally forcing an option (manager only).
    pub async fn resolve_decision(
        &self,
        actor: &Role,
        topic: &str,
        force: Option<&str>,
    ) -> ForemanResult<Decision> {
        let (actor, topic, force) = (actor.clone(), topic.to_string(), force.map(str::to_string));
        let decision = self
            .write(move |txn, policy| {
                decisions::resolve(txn, policy, &actor, &topic, force.as_deref())
            })
            .await?;
        self.record_adr(&decision).await;
        Ok(decision)
    }

    /// Look up a decision by topic.
    pub async fn get_decision(&self, topic: &str) -> ForemanResult<Decision> {
        self.read(|state, _, _| decisions::get(state, topic)).await
    }

    /// Every decision, by topic.
    pub async fn list_decisions(&self) -> ForemanResult<Vec<Decision>> {
        self.read(|state, _, _| Ok(decisions::list(state))).await
    }

    /// Render every resolved decision to its ADR file again.
    pub async fn render_adrs(&self) -> ForemanResult<Vec<PathBuf>> {
        let resolved: Vec<Decision> = self
            .list_decisions()
            .await?
            .into_iter()
            .filter(Decision::is_resolved)
            .collect();
        let mut paths = Vec::with_capacity(resolved.len());
        for decision in &resolved {
            paths.push(self.write_adr(decision).await?);
        }
        Ok(paths)
    }

    /// The resolution is already committed, so a failed ADR write is only
    /// logged. `render_adrs` writes it again.
    async fn record_adr(&self, decision: &Decision) {
        if let Err(error) = self.write_adr(decision).await {
            warn!(topic = %decision.topic, error = %error, "Decision resolved but ADR not written");
        }
    }

    async fn write_adr(&self, decision: &Decision) -> ForemanResult<PathBuf> {
        let ledger = Arc::clone(&self.ledger);
        let relative = decisions::adr_path(&decision.topic);
        let body = decisions::render_adr(decision);
        let path = tokio::task::spawn_blocking(move || {
            ledger.write_artifact(&relative, body.as_bytes())
        })
        .await
        .map_err(join_error)??;
        info!(topic = %decision.topic, path = %path.display(), "ADR written");
        Ok(path)
    }

    // -- Manager ----------------------------------------------------------

    /// Stale sweep, automatic validation of reported tasks, contract digest.
    pub async fn manager_cycle(&self, actor: &Role, strict: bool) -> ForemanResult<ManagerCycle> {
        let actor = actor.clone();
        self.write(move |txn, policy| cycle::manager_cycle(txn, policy, &actor, strict))
            .await
    }

    /// Ledger-wide summary at the current time.
    pub async fn status(&self) -> ForemanResult<StatusSummary> {
        let snapshot = self.snapshot().await?;
        Ok(cycle::summarize(
            &snapshot.state,
            &self.policy(),
            self.clock.now(),
            snapshot.event_head,
        ))
    }
}

fn join_error(e: tokio::task::JoinError) -> ForemanError {
    ForemanError::Io(std::io::Error::other(format!("ledger task failed: {e}")))
}
