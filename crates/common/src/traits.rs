//! Core worker traits and capabilities.
//!
//! These traits live in `munin-common` so that both the coordinator and
//! worker crates can reference them without circular dependencies.

use crate::delegation::{DelegationRequest, DelegationResponse, WorkerId};
use crate::{AttachmentSet, Result, WorkerReply};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capabilities that a worker can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCapability {
    /// Can create and amend invoices and credit notes
    SalesDocuments,
    /// Can record purchases and expenses
    PurchaseEntry,
    /// Can look up and register customers and suppliers
    CounterpartyCatalog,
    /// Can draft and send quotations
    Quotations,
    /// Can match bank transactions against open items
    BankReconciliation,
    /// Can post manual journal entries
    LedgerPostings,
    /// Can receive file attachments and link them to entities
    AttachmentHandling,
}

/// The core worker trait that all domain specialists implement.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Get the worker's identity.
    fn id(&self) -> WorkerId;

    /// Get the worker's human-readable name.
    fn name(&self) -> &str;

    /// Get the worker's capabilities.
    fn capabilities(&self) -> &[WorkerCapability];

    /// Check if the worker has a specific capability.
    fn has_capability(&self, cap: WorkerCapability) -> bool {
        self.capabilities().contains(&cap)
    }

    /// Handle a delegated request. The reply is user-facing; collaborator
    /// errors must be translated, never passed through raw.
    async fn handle(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
    ) -> Result<WorkerReply>;

    /// Get the worker's system prompt.
    fn system_prompt(&self) -> &str;

    /// Check if the worker is available (not busy with another delegation).
    fn is_available(&self) -> bool;
}

/// Anything a worker can hand a delegation to mid-task. Implemented by the
/// delegation channel; mocked in worker tests.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Forward a request to another worker. Failures come back structured
    /// inside the response rather than as an `Err`.
    async fn delegate(&self, request: DelegationRequest) -> DelegationResponse;
}

/// Per-delegation context handed to a worker alongside the request.
pub struct WorkerContext<'a> {
    /// Attachments staged for the current turn, addressed by ordinal
    pub attachments: &'a AttachmentSet,

    /// Channel back into the worker pool for cross-domain needs
    pub delegator: &'a dyn Delegator,

    /// Depth of the delegation that produced this context
    pub depth: u32,
}

impl<'a> WorkerContext<'a> {
    pub fn new(attachments: &'a AttachmentSet, delegator: &'a dyn Delegator, depth: u32) -> Self {
        Self {
            attachments,
            delegator,
            depth,
        }
    }
}

/// Configuration for worker creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity
    pub id: WorkerId,

    /// Human-readable name
    pub name: String,

    /// LLM model to use
    pub model: String,

    /// Custom system prompt (optional, uses default if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Temperature for LLM responses
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens for responses
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> usize {
    4096
}

impl WorkerConfig {
    pub fn for_worker(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            model: "llama3.2".into(),
            system_prompt: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Dummy delegator for tests and for workers wired without a channel.
pub struct NullDelegator;

#[async_trait]
impl Delegator for NullDelegator {
    async fn delegate(&self, request: DelegationRequest) -> DelegationResponse {
        DelegationResponse::failed(request.target, "no delegation channel attached")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::ParticipantId;

    struct CapOnly(Vec<WorkerCapability>);

    #[async_trait]
    impl Worker for CapOnly {
        fn id(&self) -> WorkerId {
            WorkerId::Sales
        }

        fn name(&self) -> &str {
            "cap-only"
        }

        fn capabilities(&self) -> &[WorkerCapability] {
            &self.0
        }

        async fn handle(
            &self,
            _request: &DelegationRequest,
            _ctx: &WorkerContext<'_>,
        ) -> Result<WorkerReply> {
            Ok(WorkerReply::text("ok"))
        }

        fn system_prompt(&self) -> &str {
            ""
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_has_capability_default_impl() {
        let worker = CapOnly(vec![
            WorkerCapability::SalesDocuments,
            WorkerCapability::AttachmentHandling,
        ]);
        assert!(worker.has_capability(WorkerCapability::SalesDocuments));
        assert!(!worker.has_capability(WorkerCapability::BankReconciliation));
    }

    #[tokio::test]
    async fn test_null_delegator_fails_structured() {
        let request = DelegationRequest::new(
            ParticipantId::Coordinator,
            WorkerId::Banking,
            "match payment",
        )
        .unwrap();
        let response = NullDelegator.delegate(request).await;
        assert!(!response.success);
        assert_eq!(response.responder, WorkerId::Banking);
    }
}
