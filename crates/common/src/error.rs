//! Error types for Munin.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuninError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Delegation error: {0}")]
    Delegation(String),

    #[error("Triage error: {0}")]
    Triage(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MuninError>;
