use crate::policy::Policy;
use crate::types::{AgentRecord, LedgerState, Liveness, TaskStatus, SYSTEM_ACTOR};
use chrono::{DateTime, Duration, Utc};
use foreman_core::{ForemanError, ForemanResult, Role};
use foreman_store::{NewEvent, Txn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Topic of the notice sent to an agent that missed its heartbeat window.
pub const STALE_NOTICE_TOPIC: &str = "agent.stale_reconnect_required";

/// Free-form agent metadata supplied at registration.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// An agent with its derived liveness and workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Agent role.
    pub role: Role,
    /// Classification at the time of the listing.
    pub liveness: Liveness,
    /// Seconds since the last heartbeat.
    pub heartbeat_age_secs: i64,
    /// Time of the last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Last task-affecting call.
    pub last_activity: Option<DateTime<Utc>>,
    /// Event bus cursor.
    pub cursor: u64,
    /// Registration metadata.
    pub metadata: Metadata,
    /// Tasks this agent owns, by status.
    pub owned: BTreeMap<TaskStatus, usize>,
    /// Unclaimed tasks routed to this agent.
    pub queued: usize,
}

/// Whether an agent has missed its heartbeat window.
pub fn is_expired(agent: &AgentRecord, timeout: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(agent.last_heartbeat) > timeout
}

/// Offline check for a task owner. A role with no record counts as offline.
pub fn is_offline(state: &LedgerState, role: &Role, timeout: Duration, now: DateTime<Utc>) -> bool {
    state
        .agents
        .get(role)
        .is_none_or(|agent| is_expired(agent, timeout, now))
}

/// Classify an agent at `now` under the given policy.
pub fn classify(
    agent: &AgentRecord,
    state: &LedgerState,
    policy: &Policy,
    now: DateTime<Utc>,
) -> Liveness {
    if is_expired(agent, policy.heartbeat_timeout(), now) {
        return Liveness::Offline;
    }
    let recently_active = agent
        .last_activity
        .is_some_and(|at| now.signed_duration_since(at) <= policy.idle_after());
    let holds_work = state
        .tasks
        .values()
        .any(|t| t.status.is_held() && t.owner.as_ref() == Some(&agent.role));
    if recently_active || holds_work {
        Liveness::Active
    } else {
        Liveness::Idle
    }
}

/// Create or refresh an agent record and reset its heartbeat.
pub fn register(
    txn: &mut Txn<LedgerState>,
    role: &Role,
    metadata: Metadata,
) -> ForemanResult<AgentRecord> {
    if role.is_blank() {
        return Err(ForemanError::Validation("agent role must not be empty".into()));
    }
    let now = txn.now();
    let first = !txn.state().agents.contains_key(role);
    txn.state_mut().stale_notices.remove(role);
    let record = txn
        .state_mut()
        .agents
        .entry(role.clone())
        .and_modify(|agent| {
            agent.last_heartbeat = now;
            agent.metadata.extend(metadata.clone());
            agent.version += 1;
        })
        .or_insert_with(|| AgentRecord {
            role: role.clone(),
            metadata,
            registered_at: now,
            last_heartbeat: now,
            last_activity: None,
            cursor: 0,
            version: 1,
        })
        .clone();

    txn.publish(
        NewEvent::new(
            "agent.registered",
            serde_json::json!({ "agent": role, "first_registration": first }),
        )
        .from_role(role),
    );
    info!(agent = %role, first, "Agent registered");
    Ok(record)
}

/// Refresh the heartbeat of a registered agent.
pub fn heartbeat(txn: &mut Txn<LedgerState>, role: &Role) -> ForemanResult<AgentRecord> {
    let now = txn.now();
    let state = txn.state_mut();
    state.stale_notices.remove(role);
    let agent = state
        .agents
        .get_mut(role)
        .ok_or_else(|| ForemanError::NotFound(format!("agent {role}")))?;
    agent.last_heartbeat = now;
    agent.version += 1;
    debug!(agent = %role, "Heartbeat");
    Ok(agent.clone())
}

/// Whether a read-only call from `role` should refresh its presence: the
/// role is unknown, has used half its heartbeat window, or was told to
/// reconnect.
pub(crate) fn presence_due(
    state: &LedgerState,
    role: &Role,
    policy: &Policy,
    now: DateTime<Utc>,
) -> bool {
    state.stale_notices.contains_key(role)
        || state.agents.get(role).is_none_or(|agent| {
            now.signed_duration_since(agent.last_heartbeat) * 2 >= policy.heartbeat_timeout()
        })
}

/// Record proof of life for `role`, creating the record on first contact.
/// `activity` marks a task-affecting call.
pub(crate) fn touch(state: &mut LedgerState, role: &Role, now: DateTime<Utc>, activity: bool) {
    state.stale_notices.remove(role);
    let agent = state
        .agents
        .entry(role.clone())
        .or_insert_with(|| AgentRecord {
            role: role.clone(),
            metadata: Metadata::new(),
            registered_at: now,
            last_heartbeat: now,
            last_activity: None,
            cursor: 0,
            version: 0,
        });
    agent.last_heartbeat = now;
    if activity {
        agent.last_activity = Some(now);
    }
    agent.version += 1;
}

/// Tell every registered agent past `timeout` to reconnect.
///
/// The notice goes to the agent and the manager; a silent manager's notice
/// goes to everyone. Each agent is notified at most once per cooldown (the
/// larger of one minute and `timeout`) until it shows a sign of life.
pub fn notify_stale(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<Role> {
    let cooldown = timeout.max(Duration::seconds(60));
    let manager = policy.manager_role().clone();
    let state = txn.state();
    let due: Vec<(Role, i64)> = state
        .agents
        .values()
        .filter(|agent| is_expired(agent, timeout, now))
        .filter(|agent| {
            state
                .stale_notices
                .get(&agent.role)
                .is_none_or(|at| now.signed_duration_since(*at) >= cooldown)
        })
        .map(|agent| {
            let age = now.signed_duration_since(agent.last_heartbeat).num_seconds();
            (agent.role.clone(), age)
        })
        .collect();
    let everyone: Vec<Role> = state.agents.keys().cloned().collect();

    let system = Role::from(SYSTEM_ACTOR);
    for (role, age) in &due {
        let audience = if *role == manager {
            everyone.clone()
        } else {
            vec![role.clone(), manager.clone()]
        };
        txn.publish(
            NewEvent::new(
                STALE_NOTICE_TOPIC,
                serde_json::json!({
                    "agent": role,
                    "heartbeat_age_secs": age,
                    "timeout_secs": timeout.num_seconds(),
                    "action": "register again, then resume polling",
                }),
            )
            .from_role(&system)
            .to(audience),
        );
        txn.state_mut().stale_notices.insert(role.clone(), now);
        warn!(agent = %role, heartbeat_age_secs = age, "Agent missed its heartbeat window");
    }
    due.into_iter().map(|(role, _)| role).collect()
}

/// Every agent with derived liveness, sorted by role.
pub fn list(state: &LedgerState, policy: &Policy, now: DateTime<Utc>) -> Vec<AgentSummary> {
    state
        .agents
        .values()
        .map(|agent| {
            let mut owned = BTreeMap::new();
            let mut queued = 0;
            for task in state.tasks.values() {
                if task.owner.as_ref() == Some(&agent.role) {
                    *owned.entry(task.status).or_insert(0) += 1;
                } else if task.owner.is_none()
                    && task.status == TaskStatus::Created
                    && task.assignee == agent.role
                {
                    queued += 1;
                }
            }
            AgentSummary {
                role: agent.role.clone(),
                liveness: classify(agent, state, policy, now),
                heartbeat_age_secs: now.signed_duration_since(agent.last_heartbeat).num_seconds(),
                last_heartbeat: agent.last_heartbeat,
                last_activity: agent.last_activity,
                cursor: agent.cursor,
                metadata: agent.metadata.clone(),
                owned,
                queued,
            }
        })
        .collect()
}
