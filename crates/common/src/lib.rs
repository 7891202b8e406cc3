//! Common types and traits shared across Munin crates.
//!
//! This crate provides the foundational abstractions that the coordinator
//! and workers use to communicate: the transcript model, the delegation
//! protocol, context distillation and attachment staging.

pub mod attachment;
pub mod dates;
pub mod delegation;
pub mod distill;
pub mod error;
pub mod outcome;
pub mod traits;
pub mod transcript;
pub mod vat;

pub use attachment::{AttachmentSet, PendingAttachment};
pub use dates::normalize_date;
pub use delegation::{
    DelegationRequest, DelegationResponse, ParticipantId, ProposedAction, WorkerId, WorkerReply,
    intent_fingerprint,
};
pub use distill::{distill, extract_identifiers};
pub use error::{MuninError, Result};
pub use outcome::{ActionOutcome, EntityKind};
pub use traits::{Delegator, NullDelegator, Worker, WorkerCapability, WorkerConfig, WorkerContext};
pub use transcript::{ActionRecord, Role, Transcript, Turn, TurnPart};
