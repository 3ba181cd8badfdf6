//! `foreman`: command-line front end for the coordination ledger.
//!
//! Every one-shot subcommand is translated into a named operation and run
//! through the same dispatcher that `foreman serve` exposes on stdio, so the
//! two surfaces cannot drift apart.

mod config_watcher;

use clap::{Parser, Subcommand};
use config_watcher::PolicyWatcher;
use foreman_core::{ForemanError, ToolCall, ToolResult};
use foreman_orchestrator::{dispatch, Orchestrator, Policy, OPERATIONS};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SAMPLE_POLICY: &str = include_str!("../policy/foreman.toml");

/// Exit status for errors a caller should retry (`conflict`, `stale_state_error`).
const EXIT_RETRYABLE: u8 = 75;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Coordinate a manager and builder agents through a shared ledger")]
struct Cli {
    /// Policy document (TOML or JSON)
    #[arg(short, long, default_value = "foreman.toml", global = true)]
    policy: PathBuf,

    /// Ledger directory shared by every participant
    #[arg(short, long, default_value = ".foreman", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter policy document
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List every named operation
    Ops,
    /// Serve named operations as JSON lines on stdin/stdout
    Serve {
        /// Do not reload the policy when the file changes
        #[arg(long)]
        no_watch: bool,
    },
    /// Run one named operation with a JSON argument object
    Call {
        name: String,
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Create a task routed by workstream
    CreateTask {
        #[arg(long)]
        title: String,
        #[arg(long)]
        workstream: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Repeat for each criterion
        #[arg(long = "criterion")]
        acceptance_criteria: Vec<String>,
        /// Route to this role instead of the policy's choice
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Claim a task, or the next one routed to the agent
    Claim {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task: Option<String>,
    },
    /// Move an owned task to another status
    UpdateStatus {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        task: String,
        /// created, in_progress, ...
        #[arg(long)]
        status: String,
        #[arg(long, default_value = "")]
        note: String,
        #[arg(long)]
        expected_version: Option<u64>,
    },
    /// Submit a worker report read from a JSON file ("-" for stdin)
    Report { file: PathBuf },
    /// Pass or fail a reported task
    Validate {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        task: String,
        #[arg(long, conflicts_with = "fail")]
        pass: bool,
        #[arg(long)]
        fail: bool,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Grant an agent a claim outside routing (manager only)
    Override {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        agent: String,
    },
    /// List tasks, optionally filtered
    Tasks {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        workstream: Option<String>,
    },
    /// Show one task with its history and reports
    Task { id: String },
    /// Register (or refresh) an agent
    Register {
        #[arg(long)]
        agent: String,
        /// Free-form metadata as a JSON object
        #[arg(long, default_value = "{}")]
        metadata: String,
    },
    /// Refresh a registered agent's heartbeat
    Heartbeat {
        #[arg(long)]
        agent: String,
    },
    /// Agents with derived liveness
    Agents,
    /// Requeue tasks held by offline agents
    ReassignStale {
        /// Override the policy's heartbeat timeout
        #[arg(long)]
        threshold_secs: Option<u32>,
    },
    /// Append an event to the bus
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        source: Option<String>,
        /// Repeat per recipient; none means broadcast
        #[arg(long = "to")]
        audience: Vec<String>,
    },
    /// Wait for events after the agent's cursor
    Poll {
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
        #[arg(long)]
        cursor: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        auto_ack: bool,
    },
    /// Advance the agent's cursor
    Ack {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        seq: u64,
    },
    /// List bugs, optionally by status and owner
    Bugs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Architecture decisions
    Decide {
        #[command(subcommand)]
        action: DecideAction,
    },
    /// Ledger-wide summary
    Status,
    /// Sweep stale work, validate reported tasks and publish the digest
    ManagerCycle {
        #[arg(long)]
        actor: Option<String>,
        /// Also require the test command behind the counts
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum DecideAction {
    /// Open a decision
    Open {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        topic: String,
        /// Repeat per option
        #[arg(long = "option", required = true)]
        options: Vec<String>,
        /// Repeat per voter; defaults to the policy's voters
        #[arg(long = "voter")]
        voters: Vec<String>,
        #[arg(long)]
        quorum: Option<usize>,
    },
    /// Vote on an open decision
    Vote {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        option: String,
        #[arg(long, default_value = "")]
        rationale: String,
    },
    /// Resolve, optionally forcing an option (manager only)
    Resolve {
        #[arg(long)]
        actor: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        force: Option<String>,
    },
    /// Show one decision
    Show { topic: String },
    /// List every decision
    List,
    /// Re-render the ADR of every resolved decision
    RenderAdrs,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries operation results only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_policy(&cli.policy, force)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Ops => {
            for op in OPERATIONS {
                println!("{:<20} {}", op.name, op.description);
            }
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let policy = load_policy(&cli.policy)?;
    let orch = Orchestrator::open(&cli.root, policy)?;

    let call = match cli.command {
        Commands::Serve { no_watch } => {
            let orch = Arc::new(orch);
            let _watcher = if no_watch || !cli.policy.exists() {
                None
            } else {
                Some(watch_policy(&orch, &cli.policy)?)
            };
            serve(orch).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Decide {
            action: DecideAction::RenderAdrs,
        } => {
            for path in orch.render_adrs().await? {
                println!("{}", path.display());
            }
            return Ok(ExitCode::SUCCESS);
        }
        command => to_call(command)?,
    };

    let result = dispatch(&orch, call).await;
    Ok(print_result(&result)?)
}

/// Translate a one-shot subcommand into a named operation.
fn to_call(command: Commands) -> anyhow::Result<ToolCall> {
    let (name, arguments) = match command {
        Commands::Call { name, arguments } => {
            let arguments: Value = serde_json::from_str(&arguments)
                .map_err(|e| anyhow::anyhow!("arguments are not valid JSON: {e}"))?;
            return Ok(ToolCall {
                id: "cli".into(),
                name,
                arguments,
            });
        }
        Commands::CreateTask {
            title,
            workstream,
            description,
            acceptance_criteria,
            owner,
            actor,
        } => (
            "create_task",
            json!({
                "title": title,
                "workstream": workstream,
                "description": description,
                "acceptance_criteria": acceptance_criteria,
                "owner": owner,
                "actor": actor,
            }),
        ),
        Commands::Claim { agent, task } => {
            ("claim_task", json!({ "agent": agent, "task_id": task }))
        }
        Commands::UpdateStatus {
            agent,
            task,
            status,
            note,
            expected_version,
        } => (
            "update_status",
            json!({
                "agent": agent,
                "task_id": task,
                "status": status,
                "note": note,
                "expected_version": expected_version,
            }),
        ),
        Commands::Report { file } => ("submit_report", read_json_file(&file)?),
        Commands::Validate {
            actor,
            task,
            pass,
            fail,
            notes,
        } => {
            if pass == fail {
                anyhow::bail!("pass exactly one of --pass or --fail");
            }
            (
                "validate_task",
                json!({ "actor": actor, "task_id": task, "passed": pass, "notes": notes }),
            )
        }
        Commands::Override { actor, task, agent } => (
            "set_claim_override",
            json!({ "actor": actor, "task_id": task, "agent": agent }),
        ),
        Commands::Tasks {
            owner,
            assignee,
            status,
            workstream,
        } => (
            "list_tasks",
            json!({
                "owner": owner,
                "assignee": assignee,
                "status": status,
                "workstream": workstream,
            }),
        ),
        Commands::Task { id } => ("get_task", json!({ "task_id": id })),
        Commands::Register { agent, metadata } => {
            let metadata: Value = serde_json::from_str(&metadata)
                .map_err(|e| anyhow::anyhow!("metadata is not valid JSON: {e}"))?;
            ("register_agent", json!({ "agent": agent, "metadata": metadata }))
        }
        Commands::Heartbeat { agent } => ("heartbeat", json!({ "agent": agent })),
        Commands::Agents => ("list_agents", json!({})),
        Commands::ReassignStale { threshold_secs } => {
            ("reassign_stale", json!({ "threshold_secs": threshold_secs }))
        }
        Commands::Publish {
            topic,
            payload,
            source,
            audience,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?;
            (
                "publish_event",
                json!({
                    "topic": topic,
                    "payload": payload,
                    "source": source,
                    "audience": audience,
                }),
            )
        }
        Commands::Poll {
            agent,
            timeout_ms,
            cursor,
            limit,
            auto_ack,
        } => (
            "poll_events",
            json!({
                "agent": agent,
                "timeout_ms": timeout_ms,
                "cursor": cursor,
                "limit": limit,
                "auto_ack": auto_ack,
            }),
        ),
        Commands::Ack { agent, seq } => ("ack_event", json!({ "agent": agent, "seq": seq })),
        Commands::Bugs { status, owner } => {
            ("list_bugs", json!({ "status": status, "owner": owner }))
        }
        Commands::Decide { action } => match action {
            DecideAction::Open {
                actor,
                topic,
                options,
                voters,
                quorum,
            } => (
                "open_decision",
                json!({
                    "actor": actor,
                    "topic": topic,
                    "options": options,
                    "voters": (!voters.is_empty()).then_some(voters),
                    "quorum": quorum,
                }),
            ),
            DecideAction::Vote {
                agent,
                topic,
                option,
                rationale,
            } => (
                "vote",
                json!({
                    "agent": agent,
                    "topic": topic,
                    "option": option,
                    "rationale": rationale,
                }),
            ),
            DecideAction::Resolve {
                actor,
                topic,
                force,
            } => (
                "resolve_decision",
                json!({ "actor": actor, "topic": topic, "force": force }),
            ),
            DecideAction::Show { topic } => ("get_decision", json!({ "topic": topic })),
            DecideAction::List => ("list_decisions", json!({})),
            DecideAction::RenderAdrs => anyhow::bail!("render-adrs is not a named operation"),
        },
        Commands::Status => ("status", json!({})),
        Commands::ManagerCycle { actor, strict } => {
            ("manager_cycle", json!({ "actor": actor, "strict": strict }))
        }
        Commands::Init { .. } | Commands::Ops | Commands::Serve { .. } => {
            anyhow::bail!("not a named operation")
        }
    };
    Ok(ToolCall {
        id: "cli".into(),
        name: name.to_string(),
        arguments: drop_nulls(arguments),
    })
}

/// Unset optional flags are omitted rather than sent as `null`.
fn drop_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read '{}': {e}", path.display()))?
    };
    serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("'{}' is not valid JSON: {e}", path.display()))
}

/// Print the outcome and pick the exit status.
fn print_result(result: &ToolResult) -> anyhow::Result<ExitCode> {
    match &result.error {
        None => {
            println!("{}", serde_json::to_string_pretty(&result.content)?);
            Ok(ExitCode::SUCCESS)
        }
        Some(error) => {
            eprintln!("{}", serde_json::to_string_pretty(error)?);
            Ok(if error.kind.is_retryable() {
                ExitCode::from(EXIT_RETRYABLE)
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn init_policy(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, SAMPLE_POLICY)
        .map_err(|e| anyhow::anyhow!("Failed to write '{}': {e}", path.display()))?;
    info!(path = %path.display(), "Policy written");
    Ok(())
}

/// The policy at `path`, or the built-in default when the file is absent.
fn load_policy(path: &Path) -> anyhow::Result<Policy> {
    if path.exists() {
        Ok(Policy::load(path)?)
    } else {
        warn!(path = %path.display(), "Policy file not found, using built-in default");
        Ok(Policy::default())
    }
}

fn watch_policy(orch: &Arc<Orchestrator>, path: &Path) -> anyhow::Result<PolicyWatcher> {
    let target = Arc::clone(orch);
    let watcher = PolicyWatcher::start(path.to_path_buf(), Duration::from_millis(500), move |policy| {
        let name = policy.name.clone();
        match target.reload_policy(policy) {
            Ok(()) => info!(policy = %name, "Policy reloaded"),
            Err(e) => warn!(error = %e, "Rejected policy reload"),
        }
    })?;
    Ok(watcher)
}

/// Read one [`ToolCall`] per line from stdin and write one [`ToolResult`]
/// per line to stdout. Calls run concurrently, so a long poll does not hold
/// up other requests; results are correlated by `call_id`.
async fn serve(orch: Arc<Orchestrator>) -> anyhow::Result<()> {
    info!(root = %orch.root().display(), "Serving operations on stdio");
    let (tx, mut rx) = mpsc::unbounded_channel::<ToolResult>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(result) = rx.recv().await {
            let mut line = match serde_json::to_vec(&result) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, call_id = %result.call_id, "Failed to encode result");
                    continue;
                }
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = tokio::task::JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        while in_flight.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }
        let call: ToolCall = match serde_json::from_str(&line) {
            Ok(call) => call,
            Err(e) => {
                let err = ForemanError::Validation(format!("malformed request: {e}"));
                let _ = tx.send(ToolResult::failure("", &err));
                continue;
            }
        };
        let orch = Arc::clone(&orch);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let _ = tx.send(dispatch(&orch, call).await);
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    info!("stdin closed, shutting down");
    Ok(())
}
