//! Structured action outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of ledger entities that actions can create.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Invoice,
    CreditNote,
    Offer,
    Purchase,
    Contact,
    Product,
    Payment,
    JournalEntry,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoice",
            EntityKind::CreditNote => "credit_note",
            EntityKind::Offer => "offer",
            EntityKind::Purchase => "purchase",
            EntityKind::Contact => "contact",
            EntityKind::Product => "product",
            EntityKind::Payment => "payment",
            EntityKind::JournalEntry => "journal_entry",
            EntityKind::Attachment => "attachment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one action invocation.
///
/// Every side-effecting action must either report the identifiers it created
/// in `created` or leave the map empty to signal it created nothing. The
/// distiller relies on this structure; free-text-only success reports are not
/// enough to keep duplicate-creation prevention checkable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,

    /// Short human-readable status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Identifiers of entities this action created, keyed by kind
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub created: BTreeMap<EntityKind, String>,

    /// Set when the action concluded the user's task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,

    /// Raw collaborator payload, for identifier extraction from nested fields
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_created(mut self, kind: EntityKind, id: impl Into<String>) -> Self {
        self.created.insert(kind, id.into());
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Identifier this action created for the given kind, if any.
    pub fn created_id(&self, kind: EntityKind) -> Option<&str> {
        self.created.get(&kind).map(|s| s.as_str())
    }
}
