//! Attachment staging for the current turn.
//!
//! Files arrive alongside a user turn and are staged here under 1-based
//! ordinals. Workers reference attachments by ordinal only; raw bytes stay in
//! the set and never travel through transcripts or delegation payloads.

use crate::error::{MuninError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// A file received with the current user turn, not yet relayed anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAttachment {
    pub name: String,
    pub media_type: String,
    /// Base64-encoded payload
    pub data: String,
    /// 1-based position within the turn, assigned by the staging set
    pub ordinal: u32,
}

impl PendingAttachment {
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| MuninError::Worker(format!("attachment {} is not valid base64: {e}", self.ordinal)))
    }
}

/// Attachments staged for one turn, in arrival order.
///
/// Ordinals count up from 1 and are never reassigned: "the second file" means
/// the same attachment for the whole life of the set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentSet {
    items: Vec<PendingAttachment>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a file and return its ordinal.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        media_type: impl Into<String>,
        data: impl Into<String>,
    ) -> u32 {
        let ordinal = self.items.len() as u32 + 1;
        self.items.push(PendingAttachment {
            name: name.into(),
            media_type: media_type.into(),
            data: data.into(),
            ordinal,
        });
        ordinal
    }

    pub fn get(&self, ordinal: u32) -> Option<&PendingAttachment> {
        if ordinal == 0 {
            return None;
        }
        self.items.get(ordinal as usize - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAttachment> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
