use chrono::{DateTime, Utc};
use foreman_core::Role;
use serde::{Deserialize, Serialize};

/// Audience entry that matches every role.
pub const BROADCAST: &str = "*";

/// A committed entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Strictly increasing, globally unique sequence number (first is 1).
    pub seq: u64,
    /// Dotted topic name, e.g. `task.claimed`.
    pub topic: String,
    /// Role that caused the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Role>,
    /// Target roles. Empty means broadcast.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<Role>,
    /// Free-form payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Commit time of the publishing transaction.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Whether `role` should receive this event.
    pub fn is_visible_to(&self, role: &Role) -> bool {
        self.audience.is_empty()
            || self
                .audience
                .iter()
                .any(|target| target == role || target.as_str() == BROADCAST)
    }
}

/// An event to be appended by a transaction.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub(crate) topic: String,
    pub(crate) source: Option<Role>,
    pub(crate) audience: Vec<Role>,
    pub(crate) payload: serde_json::Value,
}

impl NewEvent {
    /// A broadcast event with the given topic and payload.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            source: None,
            audience: Vec::new(),
            payload,
        }
    }

    /// Set the originating role.
    pub fn from_role(mut self, role: &Role) -> Self {
        self.source = Some(role.clone());
        self
    }

    /// Restrict delivery to the given roles.
    pub fn to(mut self, audience: Vec<Role>) -> Self {
        self.audience = audience;
        self
    }
}
