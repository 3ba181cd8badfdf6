use crate::policy::{Policy, TieBreak};
use crate::types::{Decision, LedgerState, Resolution, ResolutionMethod};
use foreman_core::{ForemanError, ForemanResult, Role};
use foreman_store::{NewEvent, Txn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

/// Directory (under the ledger root) holding rendered ADRs.
pub const ADR_DIR: &str = "decisions";

/// Input for [`open`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewDecision {
    /// Unique decision name.
    pub topic: String,
    /// At least two distinct options.
    pub options: Vec<String>,
    /// Defaults to the policy's voter list.
    #[serde(default)]
    pub voters: Option<Vec<Role>>,
    /// Defaults to the policy's quorum.
    #[serde(default)]
    pub quorum: Option<usize>,
}

/// Open a decision awaiting votes.
pub fn open(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    request: NewDecision,
) -> ForemanResult<Decision> {
    let topic = request.topic.trim().to_string();
    if topic.is_empty() {
        return Err(ForemanError::Validation("decision topic must not be empty".into()));
    }
    let mut options: Vec<String> = Vec::new();
    for option in request.options.iter().map(|o| o.trim()) {
        if option.is_empty() {
            return Err(ForemanError::Validation("decision options must not be empty".into()));
        }
        if !options.iter().any(|o| o == option) {
            options.push(option.to_string());
        }
    }
    if options.len() < 2 {
        return Err(ForemanError::Validation(
            "a decision needs at least two distinct options".into(),
        ));
    }

    let mut voters: Vec<Role> = Vec::new();
    for voter in request.voters.unwrap_or_else(|| policy.decisions.voters.clone()) {
        if voter.is_blank() {
            return Err(ForemanError::Validation("voter roles must not be empty".into()));
        }
        if !voters.contains(&voter) {
            voters.push(voter);
        }
    }
    if voters.is_empty() {
        return Err(ForemanError::Validation("a decision needs voters".into()));
    }
    let quorum = match request.quorum {
        Some(q) if q == 0 || q > voters.len() => {
            return Err(ForemanError::Validation(format!(
                "quorum {q} must be between 1 and {}",
                voters.len()
            )));
        }
        Some(q) => q,
        None => policy.quorum_for(voters.len()),
    };

    if txn.state().decisions.contains_key(&topic) {
        return Err(ForemanError::Conflict(format!("decision '{topic}' already exists")));
    }

    let decision = Decision {
        topic: topic.clone(),
        options,
        voters,
        quorum,
        votes: BTreeMap::new(),
        rationale: BTreeMap::new(),
        opened_by: actor.clone(),
        opened_at: txn.now(),
        resolution: None,
        version: 1,
    };
    txn.state_mut().decisions.insert(topic.clone(), decision.clone());
    txn.publish(
        NewEvent::new(
            "decision.opened",
            json!({
                "topic": topic,
                "options": decision.options,
                "voters": decision.voters,
                "quorum": quorum,
            }),
        )
        .from_role(actor)
        .to(decision.voters.clone()),
    );
    info!(topic = %topic, quorum, "Decision opened");
    Ok(decision)
}

/// Record `role`'s vote, replacing any earlier one, and resolve
/// automatically once quorum is reached and a winner exists.
pub fn vote(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    role: &Role,
    topic: &str,
    option: &str,
    rationale: &str,
) -> ForemanResult<Decision> {
    let now = txn.now();
    let decision = txn.state_mut().decision_mut(topic)?;
    if decision.is_resolved() {
        return Err(ForemanError::Conflict(format!("decision '{topic}' is already resolved")));
    }
    if !decision.voters.contains(role) {
        return Err(ForemanError::PolicyViolation(format!(
            "{role} is not a voter on '{topic}'"
        )));
    }
    if !decision.options.iter().any(|o| o == option) {
        return Err(ForemanError::PolicyViolation(format!(
            "'{option}' is not an option of '{topic}'"
        )));
    }

    decision.votes.insert(role.clone(), option.to_string());
    if rationale.trim().is_empty() {
        decision.rationale.remove(role);
    } else {
        decision.rationale.insert(role.clone(), rationale.to_string());
    }
    decision.version += 1;

    if decision.quorum_reached() {
        if let Ok((winner, method)) = tally(decision, policy.manager_role(), policy.decisions.tie_break) {
            decision.resolution = Some(Resolution {
                winner,
                method,
                resolved_at: now,
                resolved_by: role.clone(),
            });
        }
    }
    let decision = decision.clone();

    txn.publish(
        NewEvent::new(
            "decision.voted",
            json!({ "topic": topic, "voter": role, "option": option }),
        )
        .from_role(role),
    );
    if decision.is_resolved() {
        publish_resolved(txn, &decision);
    }
    info!(topic = %topic, voter = %role, option, resolved = decision.is_resolved(), "Vote recorded");
    Ok(decision)
}

/// Resolve a decision on request.
///
/// The manager may resolve at any time and may force an option. Other voters
/// may only ask once quorum is reached. An unbroken tie is a `Conflict`.
pub fn resolve(
    txn: &mut Txn<LedgerState>,
    policy: &Policy,
    actor: &Role,
    topic: &str,
    force: Option<&str>,
) -> ForemanResult<Decision> {
    let now = txn.now();
    let manager = policy.manager_role();
    let is_manager = actor == manager;
    let decision = txn.state_mut().decision_mut(topic)?;
    if decision.is_resolved() {
        return Err(ForemanError::Conflict(format!("decision '{topic}' is already resolved")));
    }

    let (winner, method) = match force {
        Some(option) => {
            if !is_manager {
                return Err(ForemanError::PolicyViolation(format!(
                    "only {manager} may force a decision"
                )));
            }
            if !decision.options.iter().any(|o| o == option) {
                return Err(ForemanError::PolicyViolation(format!(
                    "'{option}' is not an option of '{topic}'"
                )));
            }
            (option.to_string(), ResolutionMethod::ManagerOverride)
        }
        None => {
            if !is_manager && !decision.voters.contains(actor) {
                return Err(ForemanError::PolicyViolation(format!(
                    "{actor} is not a voter on '{topic}'"
                )));
            }
            if decision.votes.is_empty() {
                return Err(ForemanError::Conflict(format!("decision '{topic}' has no votes")));
            }
            if !is_manager && !decision.quorum_reached() {
                return Err(ForemanError::Conflict(format!(
                    "decision '{topic}' has {} of {} required votes",
                    decision.votes.len(),
                    decision.quorum
                )));
            }
            tally(decision, manager, policy.decisions.tie_break).map_err(|tied| {
                ForemanError::Conflict(format!(
                    "decision '{topic}' is tied between {}",
                    tied.join(", ")
                ))
            })?
        }
    };

    decision.resolution = Some(Resolution {
        winner,
        method,
        resolved_at: now,
        resolved_by: actor.clone(),
    });
    decision.version += 1;
    let decision = decision.clone();
    publish_resolved(txn, &decision);
    Ok(decision)
}

/// Count votes and pick a winner.
///
/// `Err` carries the tied options when the tie rule cannot break the tie.
pub fn tally(
    decision: &Decision,
    manager: &Role,
    tie_break: TieBreak,
) -> Result<(String, ResolutionMethod), Vec<String>> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for option in decision.votes.values() {
        *counts.entry(option.as_str()).or_insert(0) += 1;
    }
    let top = counts.values().copied().max().unwrap_or(0);
    // Option order, not map order, so reports list ties as declared.
    let leaders: Vec<String> = decision
        .options
        .iter()
        .filter(|o| counts.get(o.as_str()) == Some(&top))
        .cloned()
        .collect();

    if let [winner] = leaders.as_slice() {
        return Ok((winner.clone(), ResolutionMethod::Plurality));
    }

    let breaker = match tie_break {
        TieBreak::ManagerVote => decision
            .votes
            .get(manager)
            .filter(|choice| leaders.contains(choice))
            .map(|choice| (choice.clone(), ResolutionMethod::ManagerVote)),
        TieBreak::FirstVoter => decision
            .voters
            .iter()
            .filter_map(|voter| decision.votes.get(voter))
            .find(|choice| leaders.contains(choice))
            .map(|choice| (choice.clone(), ResolutionMethod::FirstVoter)),
    };
    breaker.ok_or(leaders)
}

/// Look up a decision by topic.
pub fn get(state: &LedgerState, topic: &str) -> ForemanResult<Decision> {
    state
        .decisions
        .get(topic)
        .cloned()
        .ok_or_else(|| ForemanError::NotFound(format!("decision '{topic}'")))
}

/// Every decision, oldest first.
pub fn list(state: &LedgerState) -> Vec<Decision> {
    let mut decisions: Vec<Decision> = state.decisions.values().cloned().collect();
    decisions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.topic.cmp(&b.topic)));
    decisions
}

fn publish_resolved(txn: &mut Txn<LedgerState>, decision: &Decision) {
    let Some(resolution) = &decision.resolution else {
        return;
    };
    txn.publish(
        NewEvent::new(
            "decision.resolved",
            json!({
                "topic": decision.topic,
                "winner": resolution.winner,
                "method": resolution.method,
                "adr": adr_path(&decision.topic),
            }),
        )
        .from_role(&resolution.resolved_by),
    );
    info!(topic = %decision.topic, winner = %resolution.winner, method = ?resolution.method, "Decision resolved");
}

/// Relative path of the ADR for `topic`: a readable slug plus a short
/// digest of the exact topic, so topics that slug alike keep separate files.
pub fn adr_path(topic: &str) -> PathBuf {
    let digest = Sha256::digest(topic.as_bytes());
    PathBuf::from(ADR_DIR).join(format!("{}-{}.md", slug(topic), hex::encode(&digest[..4])))
}

fn slug(topic: &str) -> String {
    let mut out = String::new();
    for c in topic.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "decision".to_string()
    } else {
        trimmed.to_string()
    }
}

fn method_label(method: ResolutionMethod) -> &'static str {
    match method {
        ResolutionMethod::Plurality => "plurality",
        ResolutionMethod::ManagerVote => "tie broken by manager vote",
        ResolutionMethod::FirstVoter => "tie broken by first voter",
        ResolutionMethod::ManagerOverride => "manager override",
    }
}

/// Render a decision as a Markdown ADR.
pub fn render_adr(decision: &Decision) -> String {
    let mut lines = vec![format!("# ADR: {}", decision.topic), String::new()];
    match &decision.resolution {
        Some(r) => lines.extend([
            "- Status: accepted".to_string(),
            format!("- Decision: **{}** ({})", r.winner, method_label(r.method)),
            format!("- Resolved by: {}", r.resolved_by),
            format!("- Resolved at: {}", r.resolved_at.to_rfc3339()),
        ]),
        None => lines.push("- Status: open".to_string()),
    }
    lines.push(format!(
        "- Opened by: {} at {}",
        decision.opened_by,
        decision.opened_at.to_rfc3339()
    ));
    lines.push(format!("- Quorum: {} of {}", decision.quorum, decision.voters.len()));

    lines.extend(["", "## Options", ""].map(String::from));
    lines.extend(decision.options.iter().map(|option| format!("- {option}")));

    lines.extend(["", "## Votes", "", "| Voter | Choice | Rationale |", "|---|---|---|"].map(String::from));
    for voter in &decision.voters {
        let choice = decision.votes.get(voter).map_or("(did not vote)", String::as_str);
        let rationale = decision
            .rationale
            .get(voter)
            .map_or(String::new(), |r| r.replace('|', "\\|").replace('\n', " "));
        lines.push(format!("| {voter} | {choice} | {rationale} |"));
    }
    lines.push(String::new());
    lines.join("\n")
}
