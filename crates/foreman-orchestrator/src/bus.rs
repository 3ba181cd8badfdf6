use crate::registry::touch;
use crate::types::LedgerState;
use foreman_core::{ForemanError, ForemanResult, Role};
use foreman_store::{EventRecord, NewEvent, Txn};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a poll selects events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollOptions {
    /// Start after this sequence instead of the stored cursor. The stored
    /// cursor is left alone unless `auto_ack` is set.
    #[serde(default)]
    pub cursor: Option<u64>,
    /// Maximum events returned. Defaults to the policy's poll limit.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Advance the stored cursor past everything returned or skipped.
    #[serde(default)]
    pub auto_ack: bool,
}

/// Result of a poll. `events` is empty on timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollBatch {
    /// Polling role.
    pub agent: Role,
    /// Sequence the scan started after.
    pub cursor: u64,
    /// Sequence to resume after: the last event returned or skipped.
    pub next_cursor: u64,
    /// Highest committed sequence at scan time.
    pub head: u64,
    /// Matching events, oldest first.
    pub events: Vec<EventRecord>,
}

/// Append an event with the next sequence number.
pub fn publish(
    txn: &mut Txn<LedgerState>,
    source: Option<&Role>,
    topic: &str,
    payload: serde_json::Value,
    audience: Vec<Role>,
) -> ForemanResult<EventRecord> {
    if topic.trim().is_empty() {
        return Err(ForemanError::Validation("event topic must not be empty".into()));
    }
    if audience.iter().any(Role::is_blank) {
        return Err(ForemanError::Validation("audience contains an empty role".into()));
    }

    let mut event = NewEvent::new(topic, payload.clone()).to(audience.clone());
    if let Some(role) = source {
        event = event.from_role(role);
    }
    let seq = txn.publish(event);
    debug!(seq, topic, "Event published");

    Ok(EventRecord {
        seq,
        topic: topic.to_string(),
        source: source.cloned(),
        audience,
        payload,
        timestamp: txn.now(),
    })
}

/// Pick up to `limit` events after `after` that `role` may see.
///
/// Returns the selection and the cursor to resume after. Invisible events
/// are skipped past, so a reader never rescans them.
pub fn select(
    events: &[EventRecord],
    role: &Role,
    after: u64,
    limit: usize,
) -> (Vec<EventRecord>, u64) {
    let mut selected = Vec::new();
    let mut next = after;
    for event in events.iter().filter(|e| e.seq > after) {
        let visible = event.is_visible_to(role);
        if visible && selected.len() >= limit {
            break;
        }
        next = event.seq;
        if visible {
            selected.push(event.clone());
        }
    }
    (selected, next)
}

/// Advance `role`'s cursor to `seq`.
///
/// Never moves backwards and never past the last committed event; both are
/// clamped silently. Returns the resulting cursor.
pub fn ack(txn: &mut Txn<LedgerState>, role: &Role, seq: u64) -> ForemanResult<u64> {
    if role.is_blank() {
        return Err(ForemanError::Validation("agent role must not be empty".into()));
    }
    let head = txn.head();
    let now = txn.now();
    let state = txn.state_mut();
    touch(state, role, now, false);
    let agent = state
        .agents
        .get_mut(role)
        .ok_or_else(|| ForemanError::NotFound(format!("agent {role}")))?;
    agent.cursor = agent.cursor.max(seq.min(head));
    debug!(agent = %role, requested = seq, cursor = agent.cursor, "Cursor acknowledged");
    Ok(agent.cursor)
}

/// Stored cursor of a known agent.
pub fn cursor(state: &LedgerState, role: &Role) -> ForemanResult<u64> {
    Ok(state.agent(role)?.cursor)
}
