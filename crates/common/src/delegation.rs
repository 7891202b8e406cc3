//! Delegation protocol types.
//!
//! A delegation is a bounded, blocking request from the coordinator (or from
//! one worker) to another worker. Self-targeting is rejected at construction
//! time, not merely checked at dispatch.

use crate::error::{MuninError, Result};
use crate::outcome::EntityKind;
use crate::transcript::{ActionRecord, Transcript};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The six domain specialists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkerId {
    /// Sales documents: invoices, credit notes, invoice payments
    Sales,
    /// Purchases and expenses
    Purchases,
    /// Counterparties and the product catalog
    Contacts,
    /// Quotations
    Offers,
    /// Bank transactions and reconciliation
    Banking,
    /// General ledger postings
    Journal,
}

impl WorkerId {
    pub const ALL: [WorkerId; 6] = [
        WorkerId::Sales,
        WorkerId::Purchases,
        WorkerId::Contacts,
        WorkerId::Offers,
        WorkerId::Banking,
        WorkerId::Journal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerId::Sales => "sales",
            WorkerId::Purchases => "purchases",
            WorkerId::Contacts => "contacts",
            WorkerId::Offers => "offers",
            WorkerId::Banking => "banking",
            WorkerId::Journal => "journal",
        }
    }

    /// Human-readable domain description, used in triage prompts.
    pub fn domain(&self) -> &'static str {
        match self {
            WorkerId::Sales => "invoices, credit notes and invoice payments",
            WorkerId::Purchases => "purchases, expenses and receipts",
            WorkerId::Contacts => "customers, suppliers and the product catalog",
            WorkerId::Offers => "quotations and offers",
            WorkerId::Banking => "bank transactions and payment matching",
            WorkerId::Journal => "manual journal entries and the chart of accounts",
        }
    }

    /// Every worker may delegate to every other worker, never to itself.
    pub fn delegation_targets(&self) -> Vec<WorkerId> {
        WorkerId::ALL.iter().copied().filter(|w| w != self).collect()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any party that can originate a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantId {
    Coordinator,
    Worker(WorkerId),
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Coordinator => f.write_str("coordinator"),
            ParticipantId::Worker(id) => write!(f, "worker:{id}"),
        }
    }
}

/// A request travelling over the delegation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// Who is asking
    pub origin: ParticipantId,

    /// Which worker should handle it
    pub target: WorkerId,

    /// Task description in plain language. When the task refers to an entity
    /// that already exists, the text names its identifier.
    pub task: String,

    /// Structured context (confirmed proposals, attachment policy,
    /// already-created identifiers)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,

    /// Distilled transcript snapshot for the target
    #[serde(default)]
    pub transcript: Transcript,

    /// Position in the delegation chain; the channel caps this
    pub depth: u32,
}

impl DelegationRequest {
    /// Build a request, rejecting a worker that targets itself.
    pub fn new(origin: ParticipantId, target: WorkerId, task: impl Into<String>) -> Result<Self> {
        if origin == ParticipantId::Worker(target) {
            return Err(MuninError::Delegation(format!(
                "worker {target} cannot delegate to itself"
            )));
        }
        Ok(Self {
            origin,
            target,
            task: task.into(),
            context: serde_json::Value::Null,
            transcript: Transcript::new(),
            depth: 0,
        })
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }
}

/// A side-effecting action a worker wants to perform, awaiting the user's
/// explicit confirmation before it is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub worker: WorkerId,

    /// Action name, e.g. "create_invoice"
    pub action: String,

    /// Human-readable proposed summary shown to the user
    pub summary: String,

    /// Inputs the action will be invoked with once confirmed
    pub inputs: serde_json::Value,

    /// Intent fingerprint, see [`intent_fingerprint`]
    pub fingerprint: String,
}

/// What a worker hands back to its caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReply {
    /// User-facing text (plain language, no raw collaborator detail)
    pub text: String,

    /// Actions invoked while handling the request, in invocation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,

    /// Side-effecting action proposed but not yet confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<ProposedAction>,

    /// True when the reply is a clarifying question the user must answer
    #[serde(default)]
    pub needs_input: bool,
}

impl WorkerReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn question(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            needs_input: true,
            ..Default::default()
        }
    }

    pub fn proposal(proposal: ProposedAction) -> Self {
        Self {
            text: format!("{}\nReply \"yes\" to proceed.", proposal.summary),
            pending: Some(proposal),
            needs_input: true,
            ..Default::default()
        }
    }

    pub fn with_action(mut self, record: ActionRecord) -> Self {
        self.actions.push(record);
        self
    }
}

/// Response travelling back over the delegation channel. Failures are always
/// structured; the channel never lets a worker error escape raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResponse {
    pub success: bool,

    /// Worker that actually handled (or failed to handle) the request
    pub responder: WorkerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<WorkerReply>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DelegationResponse {
    pub fn ok(responder: WorkerId, reply: WorkerReply) -> Self {
        Self {
            success: true,
            responder,
            reply: Some(reply),
            error: None,
        }
    }

    pub fn failed(responder: WorkerId, error: impl Into<String>) -> Self {
        Self {
            success: false,
            responder,
            reply: None,
            error: Some(error.into()),
        }
    }
}

/// Normalized fingerprint of a creation intent.
///
/// Two requests carry the same intent when they would create the same kind of
/// entity for the same counterparty, amount and date with a matching
/// description stem. Matching on the fingerprint is what makes the
/// no-duplicate-creation guarantee mechanically checkable instead of a
/// judgement call.
pub fn intent_fingerprint(
    kind: EntityKind,
    counterparty: &str,
    amount_ore: i64,
    date: &str,
    description: &str,
) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        kind.as_str(),
        normalize_token(counterparty),
        amount_ore,
        date.trim(),
        description_stem(description),
    )
}

fn normalize_token(s: &str) -> String {
    s.trim().to_lowercase()
}

/// First few significant words of a description, lowercased, punctuation
/// stripped. Enough to tell "taxi til flyplassen" from "lunsj med kunde"
/// without being thrown off by rephrasing tails.
fn description_stem(description: &str) -> String {
    description
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join(" ")
}
