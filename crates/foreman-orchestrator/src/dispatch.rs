use crate::bus::PollOptions;
use crate::decisions::NewDecision;
use crate::engine::Orchestrator;
use crate::registry::Metadata;
use crate::tasks::{NewTask, TaskFilter};
use crate::types::{BugStatus, ReportSubmission, TaskStatus};
use foreman_core::{ForemanError, ForemanResult, Role, TaskId, ToolCall, ToolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// A named engine operation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OperationDescriptor {
    /// Name used in `ToolCall::name`.
    pub name: &'static str,
    /// One-line summary.
    pub description: &'static str,
}

const fn op(name: &'static str, description: &'static str) -> OperationDescriptor {
    OperationDescriptor { name, description }
}

/// Every operation [`dispatch`] understands.
pub const OPERATIONS: &[OperationDescriptor] = &[
    op("create_task", "Create a task routed by workstream"),
    op("claim_task", "Claim a task, or the next one routed to the caller"),
    op("update_status", "Move an owned task to in_progress or release it"),
    op("submit_report", "Submit a worker report (idempotent per commit)"),
    op("validate_task", "Pass or fail a reported task"),
    op("reassign_stale", "Requeue tasks held by offline agents"),
    op("set_claim_override", "Let an agent claim a task regardless of routing"),
    op("register_agent", "Register or refresh an agent"),
    op("heartbeat", "Refresh a registered agent's heartbeat"),
    op("list_agents", "Agents with derived liveness"),
    op("publish_event", "Append an event to the bus"),
    op("poll_events", "Wait for events after the caller's cursor"),
    op("ack_event", "Advance the caller's cursor"),
    op("get_cursor", "Read an agent's cursor"),
    op("list_bugs", "Bugs, optionally by status and owner"),
    op("open_decision", "Open an architecture decision"),
    op("vote", "Vote on an open decision"),
    op("resolve_decision", "Resolve a decision, optionally forcing an option"),
    op("get_decision", "Read one decision"),
    op("list_decisions", "Every decision"),
    op("list_tasks", "Tasks matching a filter"),
    op("get_task", "Read one task"),
    op("get_reports", "Reports stored for a task"),
    op("status", "Ledger-wide summary"),
    op("manager_cycle", "Sweep stale work and validate reported tasks"),
];

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateTaskArgs {
    #[serde(default)]
    actor: Option<Role>,
    title: String,
    workstream: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    owner: Option<Role>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClaimArgs {
    agent: Role,
    #[serde(default)]
    task_id: Option<TaskId>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateStatusArgs {
    agent: Role,
    task_id: TaskId,
    status: TaskStatus,
    #[serde(default)]
    note: String,
    #[serde(default)]
    expected_version: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateArgs {
    actor: Role,
    task_id: TaskId,
    passed: bool,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReassignArgs {
    #[serde(default)]
    threshold_secs: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideArgs {
    actor: Role,
    task_id: TaskId,
    agent: Role,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterArgs {
    agent: Role,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentArgs {
    agent: Role,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PublishArgs {
    #[serde(default)]
    source: Option<Role>,
    topic: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    audience: Vec<Role>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PollArgs {
    agent: Role,
    #[serde(default)]
    timeout_ms: u64,
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    auto_ack: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AckArgs {
    agent: Role,
    seq: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BugsArgs {
    #[serde(default)]
    status: Option<BugStatus>,
    #[serde(default)]
    owner: Option<Role>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenDecisionArgs {
    actor: Role,
    topic: String,
    options: Vec<String>,
    #[serde(default)]
    voters: Option<Vec<Role>>,
    #[serde(default)]
    quorum: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VoteArgs {
    agent: Role,
    topic: String,
    option: String,
    #[serde(default)]
    rationale: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResolveArgs {
    actor: Role,
    topic: String,
    #[serde(default)]
    force: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TopicArgs {
    topic: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskArgs {
    task_id: TaskId,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CycleArgs {
    #[serde(default)]
    actor: Option<Role>,
    #[serde(default)]
    strict: bool,
}

/// Run one named operation. Never fails: errors come back inside the
/// [`ToolResult`] as a structured payload.
pub async fn dispatch(orch: &Orchestrator, call: ToolCall) -> ToolResult {
    match execute(orch, &call).await {
        Ok(content) => {
            debug!(op = %call.name, call_id = %call.id, "Operation succeeded");
            ToolResult::success(call.id, content)
        }
        Err(e) => {
            let kind = e.kind();
            if kind.is_retryable() {
                debug!(op = %call.name, call_id = %call.id, ?kind, error = %e, "Operation contended");
            } else {
                warn!(op = %call.name, call_id = %call.id, ?kind, error = %e, "Operation failed");
            }
            ToolResult::failure(call.id, &e)
        }
    }
}

fn args<T: DeserializeOwned>(call: &ToolCall) -> ForemanResult<T> {
    let raw = if call.arguments.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        call.arguments.clone()
    };
    serde_json::from_value(raw)
        .map_err(|e| ForemanError::Validation(format!("{}: {e}", call.name)))
}

fn json<T: Serialize>(value: T) -> ForemanResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

async fn execute(orch: &Orchestrator, call: &ToolCall) -> ForemanResult<serde_json::Value> {
    match call.name.as_str() {
        "create_task" => {
            let a: CreateTaskArgs = args(call)?;
            let actor = a
                .actor
                .unwrap_or_else(|| orch.policy().manager_role().clone());
            let request = NewTask {
                title: a.title,
                workstream: a.workstream,
                description: a.description,
                acceptance_criteria: a.acceptance_criteria,
                owner: a.owner,
            };
            json(orch.create_task(&actor, request).await?)
        }
        "claim_task" => {
            let a: ClaimArgs = args(call)?;
            json(orch.claim_task(&a.agent, a.task_id).await?)
        }
        "update_status" => {
            let a: UpdateStatusArgs = args(call)?;
            json(
                orch.update_status(&a.agent, &a.task_id, a.status, &a.note, a.expected_version)
                    .await?,
            )
        }
        "submit_report" => {
            let report: ReportSubmission = args(call)?;
            json(orch.submit_report(report).await?)
        }
        "validate_task" => {
            let a: ValidateArgs = args(call)?;
            json(
                orch.validate_task(&a.actor, &a.task_id, a.passed, &a.notes)
                    .await?,
            )
        }
        "reassign_stale" => {
            let a: ReassignArgs = args(call)?;
            let threshold = a
                .threshold_secs
                .map(|s| chrono::Duration::seconds(i64::from(s)));
            json(orch.reassign_stale(threshold).await?)
        }
        "set_claim_override" => {
            let a: OverrideArgs = args(call)?;
            json(
                orch.set_claim_override(&a.actor, &a.task_id, &a.agent)
                    .await?,
            )
        }
        "register_agent" => {
            let a: RegisterArgs = args(call)?;
            json(orch.register_agent(&a.agent, a.metadata).await?)
        }
        "heartbeat" => {
            let a: AgentArgs = args(call)?;
            json(orch.heartbeat(&a.agent).await?)
        }
        "list_agents" => {
            let _: NoArgs = args(call)?;
            json(orch.list_agents().await?)
        }
        "publish_event" => {
            let a: PublishArgs = args(call)?;
            json(
                orch.publish_event(a.source.as_ref(), &a.topic, a.payload, a.audience)
                    .await?,
            )
        }
        "poll_events" => {
            let a: PollArgs = args(call)?;
            let options = PollOptions {
                cursor: a.cursor,
                limit: a.limit,
                auto_ack: a.auto_ack,
            };
            json(
                orch.poll_events(&a.agent, Duration::from_millis(a.timeout_ms), options)
                    .await?,
            )
        }
        "ack_event" => {
            let a: AckArgs = args(call)?;
            let cursor = orch.ack_event(&a.agent, a.seq).await?;
            json(serde_json::json!({ "agent": a.agent, "cursor": cursor }))
        }
        "get_cursor" => {
            let a: AgentArgs = args(call)?;
            let cursor = orch.get_cursor(&a.agent).await?;
            json(serde_json::json!({ "agent": a.agent, "cursor": cursor }))
        }
        "list_bugs" => {
            let a: BugsArgs = args(call)?;
            json(orch.list_bugs(a.status, a.owner.as_ref()).await?)
        }
        "open_decision" => {
            let a: OpenDecisionArgs = args(call)?;
            let request = NewDecision {
                topic: a.topic,
                options: a.options,
                voters: a.voters,
                quorum: a.quorum,
            };
            json(orch.open_decision(&a.actor, request).await?)
        }
        "vote" => {
            let a: VoteArgs = args(call)?;
            json(
                orch.vote(&a.agent, &a.topic, &a.option, &a.rationale)
                    .await?,
            )
        }
        "resolve_decision" => {
            let a: ResolveArgs = args(call)?;
            json(
                orch.resolve_decision(&a.actor, &a.topic, a.force.as_deref())
                    .await?,
            )
        }
        "get_decision" => {
            let a: TopicArgs = args(call)?;
            json(orch.get_decision(&a.topic).await?)
        }
        "list_decisions" => {
            let _: NoArgs = args(call)?;
            json(orch.list_decisions().await?)
        }
        "list_tasks" => {
            let filter: TaskFilter = args(call)?;
            json(orch.list_tasks(&filter).await?)
        }
        "get_task" => {
            let a: TaskArgs = args(call)?;
            json(orch.get_task(&a.task_id).await?)
        }
        "get_reports" => {
            let a: TaskArgs = args(call)?;
            json(orch.get_reports(&a.task_id).await?)
        }
        "status" => {
            let _: NoArgs = args(call)?;
            json(orch.status().await?)
        }
        "manager_cycle" => {
            let a: CycleArgs = args(call)?;
            let actor = a
                .actor
                .unwrap_or_else(|| orch.policy().manager_role().clone());
            json(orch.manager_cycle(&actor, a.strict).await?)
        }
        other => Err(ForemanError::NotFound(format!("operation '{other}'"))),
    }
}
