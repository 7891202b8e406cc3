//! Conversation transcript types.
//!
//! A transcript is the single source of truth for one bookkeeping task. It is
//! append-only: the coordinator is the only writer, workers receive read-only
//! (distilled) snapshots.

use crate::delegation::WorkerId;
use crate::outcome::ActionOutcome;
use serde::{Deserialize, Serialize};

/// Role of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One part of a conversational turn: narrative text or a reference to a
/// pending attachment (by its 1-based ordinal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPart {
    Text { text: String },
    Attachment { name: String, ordinal: u32 },
}

/// Record of one action a worker invoked against the ledger collaborator.
///
/// Action records live only in the master transcript; they are never delivered
/// verbatim to a worker. The distiller compresses them into synthetic
/// assistant turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action name, e.g. "create_purchase"
    pub action: String,

    /// Worker that invoked the action
    pub worker: WorkerId,

    /// Inputs as passed to the collaborator (sanitized, no credentials)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub inputs: serde_json::Value,

    /// Intent fingerprint for duplicate-creation detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Structured outcome
    pub outcome: ActionOutcome,
}

impl ActionRecord {
    pub fn new(worker: WorkerId, action: impl Into<String>, outcome: ActionOutcome) -> Self {
        Self {
            action: action.into(),
            worker,
            inputs: serde_json::Value::Null,
            fingerprint: None,
            outcome,
        }
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// A single entry in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    /// A user or assistant message, possibly mixing text and attachment
    /// references.
    Message { role: Role, parts: Vec<TurnPart> },

    /// An internal action record. Hidden from workers; distilled instead.
    Action { record: ActionRecord },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::User,
            parts: vec![TurnPart::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Message {
            role: Role::Assistant,
            parts: vec![TurnPart::Text { text: text.into() }],
        }
    }

    pub fn action(record: ActionRecord) -> Self {
        Self::Action { record }
    }

    /// All narrative text in this turn, parts joined by newlines.
    pub fn text(&self) -> String {
        match self {
            Turn::Message { parts, .. } => parts
                .iter()
                .filter_map(|p| match p {
                    TurnPart::Text { text } => Some(text.as_str()),
                    TurnPart::Attachment { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Turn::Action { .. } => String::new(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Turn::Message { role, .. } => Some(*role),
            Turn::Action { .. } => None,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, Turn::Action { .. })
    }
}

/// Append-only ordered sequence of turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Iterate over all action records, oldest first.
    pub fn action_records(&self) -> impl Iterator<Item = &ActionRecord> {
        self.turns.iter().filter_map(|t| match t {
            Turn::Action { record } => Some(record),
            _ => None,
        })
    }

    /// Text of the most recent user turn, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role() == Some(Role::User))
            .map(|t| t.text())
    }
}

impl FromIterator<Turn> for Transcript {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self {
            turns: iter.into_iter().collect(),
        }
    }
}
