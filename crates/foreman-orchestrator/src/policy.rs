use foreman_core::{ForemanError, ForemanResult, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema version this build understands.
pub const POLICY_VERSION: u32 = 1;

/// Routing key used when a workstream has no explicit route.
pub const DEFAULT_ROUTE: &str = "default";

/// The coordination policy: who does what, and how long silence is tolerated.
///
/// Evaluation is pure. Swapping the document (see
/// [`Orchestrator::reload_policy`](crate::Orchestrator::reload_policy))
/// changes behavior for every later operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Document format version.
    pub version: u32,
    /// Label shown in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Manager and validator roles.
    pub roles: RolesConfig,
    /// Workstream -> role.
    #[serde(default)]
    pub routing: BTreeMap<String, Role>,
    /// Heartbeat thresholds.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Automatic reactions.
    #[serde(default)]
    pub triggers: TriggersConfig,
    /// Voting rules.
    #[serde(default)]
    pub decisions: DecisionsConfig,
    /// Event bus tuning.
    #[serde(default)]
    pub bus: BusConfig,
}

/// Who manages and who validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RolesConfig {
    /// Role that creates tasks, validates and breaks ties.
    pub manager: Role,
    /// Defaults to the manager.
    #[serde(default)]
    pub validator: Option<Role>,
}

/// Heartbeat thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    /// Seconds without a heartbeat before an agent counts as offline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Defaults to the heartbeat timeout.
    #[serde(default)]
    pub idle_after_secs: Option<u64>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            idle_after_secs: None,
        }
    }
}

/// Automatic reactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggersConfig {
    /// Open a bug when validation fails.
    #[serde(default = "default_true")]
    pub auto_open_bug_on_validation_failure: bool,
    /// Requeue tasks held by offline owners during a sweep.
    #[serde(default = "default_true")]
    pub auto_requeue_on_offline: bool,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            auto_open_bug_on_validation_failure: true,
            auto_requeue_on_offline: true,
        }
    }
}

/// Rule for a plurality tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The manager's vote decides; without it the decision stays open.
    #[default]
    ManagerVote,
    /// The earliest configured voter whose vote is among the tied options decides.
    FirstVoter,
}

/// Voting rules.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionsConfig {
    /// Default voter roles for new decisions.
    #[serde(default)]
    pub voters: Vec<Role>,
    /// Votes needed before automatic resolution. Defaults to every voter.
    #[serde(default)]
    pub quorum: Option<usize>,
    /// Rule applied to a plurality tie.
    #[serde(default)]
    pub tie_break: TieBreak,
}

/// Event bus tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Upper bound on how long a poll waits before re-reading the log.
    #[serde(default = "default_recheck_ms")]
    pub poll_recheck_ms: u64,
    /// Events returned by a poll without an explicit limit.
    #[serde(default = "default_poll_limit")]
    pub default_poll_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_recheck_ms: default_recheck_ms(),
            default_poll_limit: default_poll_limit(),
        }
    }
}

fn default_name() -> String {
    "default".into()
}

fn default_heartbeat_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_recheck_ms() -> u64 {
    250
}

fn default_poll_limit() -> usize {
    50
}

impl Policy {
    /// Load and validate a policy file. `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn load(path: &Path) -> ForemanResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ForemanError::Config(format!("{}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let policy = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
        .map_err(|e| match e {
            ForemanError::Config(msg) => ForemanError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        Ok(policy)
    }

    /// Parse and validate a TOML policy document.
    pub fn from_toml_str(raw: &str) -> ForemanResult<Self> {
        let policy: Policy =
            toml::from_str(raw).map_err(|e| ForemanError::Config(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse and validate a JSON policy document.
    pub fn from_json_str(raw: &str) -> ForemanResult<Self> {
        let policy: Policy =
            serde_json::from_str(raw).map_err(|e| ForemanError::Config(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.version != POLICY_VERSION {
            return Err(ForemanError::Config(format!(
                "unsupported policy version {} (expected {POLICY_VERSION})",
                self.version
            )));
        }
        if self.roles.manager.is_blank() {
            return Err(ForemanError::Config("roles.manager is empty".into()));
        }
        if self.roles.validator.as_ref().is_some_and(Role::is_blank) {
            return Err(ForemanError::Config("roles.validator is empty".into()));
        }
        if let Some((workstream, _)) = self.routing.iter().find(|(_, role)| role.is_blank()) {
            return Err(ForemanError::Config(format!(
                "routing.{workstream} names an empty role"
            )));
        }
        if self.liveness.heartbeat_timeout_secs == 0 {
            return Err(ForemanError::Config(
                "liveness.heartbeat_timeout_secs must be positive".into(),
            ));
        }
        if self.liveness.idle_after_secs == Some(0) {
            return Err(ForemanError::Config(
                "liveness.idle_after_secs must be positive".into(),
            ));
        }
        if self.decisions.voters.iter().any(Role::is_blank) {
            return Err(ForemanError::Config("decisions.voters has an empty role".into()));
        }
        if let Some(quorum) = self.decisions.quorum {
            if quorum == 0 {
                return Err(ForemanError::Config("decisions.quorum must be positive".into()));
            }
            if !self.decisions.voters.is_empty() && quorum > self.decisions.voters.len() {
                return Err(ForemanError::Config(format!(
                    "decisions.quorum {quorum} exceeds {} voters",
                    self.decisions.voters.len()
                )));
            }
        }
        if self.bus.poll_recheck_ms == 0 || self.bus.default_poll_limit == 0 {
            return Err(ForemanError::Config(
                "bus.poll_recheck_ms and bus.default_poll_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Role a workstream routes to, falling back to the `default` route.
    pub fn route(&self, workstream: &str) -> Option<&Role> {
        self.routing
            .get(workstream)
            .or_else(|| self.routing.get(DEFAULT_ROUTE))
    }

    /// The manager role.
    pub fn manager_role(&self) -> &Role {
        &self.roles.manager
    }

    /// Role allowed to validate; the manager when unset.
    pub fn validator_role(&self) -> &Role {
        self.roles.validator.as_ref().unwrap_or(&self.roles.manager)
    }

    /// Whether `role` may validate reports.
    pub fn may_validate(&self, role: &Role) -> bool {
        role == self.validator_role() || role == self.manager_role()
    }

    /// Offline threshold.
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        secs(self.liveness.heartbeat_timeout_secs)
    }

    /// Time without task activity before an agent counts as idle.
    pub fn idle_after(&self) -> chrono::Duration {
        secs(
            self.liveness
                .idle_after_secs
                .unwrap_or(self.liveness.heartbeat_timeout_secs),
        )
    }

    /// Whether a failed validation opens a bug.
    pub fn auto_open_bug_on_validation_failure(&self) -> bool {
        self.triggers.auto_open_bug_on_validation_failure
    }

    /// Whether a sweep requeues tasks of offline owners.
    pub fn auto_requeue_on_offline(&self) -> bool {
        self.triggers.auto_requeue_on_offline
    }

    /// Quorum for a decision with `voters` participants.
    pub fn quorum_for(&self, voters: usize) -> usize {
        self.decisions.quorum.unwrap_or(voters).clamp(1, voters.max(1))
    }

    /// Upper bound on one poll wait before re-reading the log.
    pub fn poll_recheck(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.bus.poll_recheck_ms)
    }
}

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

impl Default for Policy {
    /// A single manager, two builders, everything else at defaults.
    fn default() -> Self {
        let routing = [
            ("backend", "builder_a"),
            ("frontend", "builder_b"),
            (DEFAULT_ROUTE, "builder_a"),
        ]
        .into_iter()
        .map(|(ws, role)| (ws.to_string(), Role::from(role)))
        .collect();

        Self {
            version: POLICY_VERSION,
            name: default_name(),
            roles: RolesConfig {
                manager: Role::from("manager"),
                validator: None,
            },
            routing,
            liveness: LivenessConfig::default(),
            triggers: TriggersConfig::default(),
            decisions: DecisionsConfig {
                voters: vec![
                    Role::from("manager"),
                    Role::from("builder_a"),
                    Role::from("builder_b"),
                ],
                quorum: None,
                tie_break: TieBreak::ManagerVote,
            },
            bus: BusConfig::default(),
        }
    }
}
