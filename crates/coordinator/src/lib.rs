//! Munin coordination layer: turn pipeline, triage and the delegation
//! channel.
//!
//! One conversation turn flows through four stages:
//!
//! 1. Policy: bulk-destructive refusal plus confirmation, rejection and
//!    open-question continuation recovered from the transcript
//! 2. Triage: pick a domain specialist (LLM when configured, keyword
//!    routing otherwise and on every LLM failure)
//! 3. Delegation: the channel distills the transcript for the target,
//!    enforces the depth limit and isolates worker failures
//! 4. Assembly: action records, marker records and the reply are appended
//!    to the transcript and streamed as turn events
//!
//! # Architecture
//!
//! ```text
//! User Turn
//!     │
//!     ▼
//! ┌──────────────┐     ┌────────────────────┐
//! │ Coordinator  │ ──► │ DelegationChannel  │ ◄─┐
//! │ (this crate) │     └─────────┬──────────┘   │ nested hops
//! └──────────────┘               │              │
//!                  ┌───────┬─────┴──┬────────┬──┴─────┬─────────┐
//!                  ▼       ▼        ▼        ▼        ▼         ▼
//!               [Sales][Purchases][Contacts][Offers][Banking][Journal]
//! ```
//!
//! The engine is stateless between requests: the client posts the full
//! transcript each turn, and everything worth remembering rides in it.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod policy;
pub mod triage;

pub use channel::DelegationChannel;
pub use config::{ConversationConfig, MuninConfig};
pub use coordinator::{Coordinator, TurnEvent, TurnReply};
pub use policy::{OpenQuestion, PendingProposal, TaskState};
pub use triage::{Route, RouteDecision, Triage, keyword_route};
