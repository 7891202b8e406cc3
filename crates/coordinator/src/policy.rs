//! Conversation-level safety policy and task state recovery.
//!
//! The engine holds no session state between requests: the client posts the
//! full transcript every turn. Anything the coordinator needs to remember
//! across turns, it writes into the transcript as action records and reads
//! back here. Two marker records exist:
//!
//! - `propose_<action>`: a worker proposed a side-effecting action and is
//!   waiting for the user to confirm it
//! - `request_input`: a worker asked a clarifying question and needs the
//!   answer merged into its original task
//!
//! A marker is live only while the user's very next message is the one being
//! processed now. Older markers are ignored, so a stale "ja" can never
//! trigger an action the user stopped talking about.

use munin_common::{ActionRecord, EntityKind, Role, Transcript, Turn, WorkerId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Action-name prefix for confirmation marker records.
pub(crate) const PROPOSE_PREFIX: &str = "propose_";

/// Action name for clarifying-question marker records.
pub(crate) const REQUEST_INPUT_ACTION: &str = "request_input";

/// Bulk destructive phrasings the coordinator refuses to fan out.
const BULK_DESTRUCTIVE: &[&str] = &[
    "slett alle",
    "slett alt",
    "delete all",
    "delete everything",
    "fjern alle",
    "fjern alt",
    "kanseller alle",
    "cancel all",
    "remove everything",
];

/// Exact acknowledgement forms that confirm a pending proposal.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "ja",
    "ja takk",
    "jepp",
    "japp",
    "yes",
    "yes please",
    "ok",
    "okay",
    "gjør det",
    "kjør",
    "go ahead",
    "bekreft",
    "confirm",
];

/// Exact rejection forms that drop a pending proposal.
const REJECTIONS: &[&str] = &[
    "nei",
    "nei takk",
    "no",
    "no thanks",
    "avbryt",
    "cancel",
    "stopp",
    "stop",
    "ikke gjør det",
    "dropp det",
];

/// A proposed action recovered from the transcript, awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingProposal {
    /// Worker that proposed the action
    pub worker: WorkerId,

    /// Action name with the marker prefix stripped
    pub action: String,

    /// Human-readable summary shown when the action was proposed
    pub summary: String,

    /// The user task that led to the proposal
    pub task: String,

    /// Structured inputs the worker will execute with
    pub inputs: Value,

    /// Intent fingerprint guarding against double execution
    pub fingerprint: Option<String>,
}

/// A clarifying question recovered from the transcript, awaiting an answer.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenQuestion {
    /// Worker that asked
    pub worker: WorkerId,

    /// The user task the answer must be merged back into
    pub task: String,
}

/// Everything the coordinator knows about the task so far, rebuilt from the
/// transcript on every turn.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    /// Fingerprint of each executed action mapped to the identifier it
    /// created (or the action name when nothing was created)
    pub fingerprints: BTreeMap<String, String>,

    /// Most recently created identifier per entity kind
    pub entities: BTreeMap<EntityKind, String>,

    /// Attachment ordinals already consumed by executed actions. Staged
    /// files are re-offered every turn, so without this a follow-up could
    /// re-create entities from files that were already booked.
    pub consumed_ordinals: BTreeSet<u32>,

    /// Live proposal from the previous turn, if any
    pub pending: Option<PendingProposal>,

    /// Live clarifying question from the previous turn, if any
    pub open_question: Option<OpenQuestion>,
}

impl TaskState {
    /// Rebuild task state from a transcript ending in the turn being
    /// processed.
    pub fn scan(transcript: &Transcript) -> Self {
        let turns = transcript.turns();

        let mut state = TaskState::default();
        let mut marker: Option<(usize, &ActionRecord)> = None;

        for (index, turn) in turns.iter().enumerate() {
            let Turn::Action { record } = turn else {
                continue;
            };

            if record.action == REQUEST_INPUT_ACTION || record.action.starts_with(PROPOSE_PREFIX) {
                marker = Some((index, record));
                continue;
            }

            if !record.outcome.success {
                continue;
            }
            for (kind, id) in &record.outcome.created {
                state.entities.insert(*kind, id.clone());
            }
            collect_consumed_ordinals(&record.inputs, &mut state.consumed_ordinals);
            if let Some(fingerprint) = &record.fingerprint {
                let value = record
                    .outcome
                    .created
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| record.action.clone());
                state.fingerprints.insert(fingerprint.clone(), value);
            }
        }

        let Some((index, record)) = marker else {
            return state;
        };

        // Live only when exactly one user turn follows the marker and it is
        // the final turn of the transcript.
        let user_turns_after: Vec<usize> = turns
            .iter()
            .enumerate()
            .skip(index + 1)
            .filter(|(_, turn)| turn.role() == Some(Role::User))
            .map(|(i, _)| i)
            .collect();
        if user_turns_after != [turns.len() - 1] {
            return state;
        }

        if let Some(action) = record.action.strip_prefix(PROPOSE_PREFIX) {
            let executed = record
                .fingerprint
                .as_ref()
                .is_some_and(|fp| state.fingerprints.contains_key(fp));
            if !executed {
                state.pending = Some(PendingProposal {
                    worker: record.worker,
                    action: action.to_string(),
                    summary: details_str(record, "summary"),
                    task: details_str(record, "task"),
                    inputs: record.inputs.clone(),
                    fingerprint: record.fingerprint.clone(),
                });
            }
        } else {
            state.open_question = Some(OpenQuestion {
                worker: record.worker,
                task: details_str(record, "task"),
            });
        }

        state
    }
}

/// Pull attachment ordinals out of executed-action inputs. Covers the
/// single-item form (`ordinal`), the per-item form (`receipts[].ordinal`)
/// and the flat list form (`ordinals`).
fn collect_consumed_ordinals(inputs: &Value, consumed: &mut BTreeSet<u32>) {
    if let Some(ordinal) = inputs.get("ordinal").and_then(|v| v.as_u64()) {
        consumed.insert(ordinal as u32);
    }
    if let Some(items) = inputs.get("receipts").and_then(|v| v.as_array()) {
        for item in items {
            if let Some(ordinal) = item.get("ordinal").and_then(|v| v.as_u64()) {
                consumed.insert(ordinal as u32);
            }
        }
    }
    if let Some(ordinals) = inputs.get("ordinals").and_then(|v| v.as_array()) {
        for ordinal in ordinals.iter().filter_map(|v| v.as_u64()) {
            consumed.insert(ordinal as u32);
        }
    }
}

fn details_str(record: &ActionRecord, key: &str) -> String {
    record
        .outcome
        .details
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['!', '.', '?'])
        .trim()
        .to_lowercase()
}

/// True when the text is a bare confirmation of whatever was proposed.
///
/// Exact match only: "ja, men endre datoen" is a revision, not a
/// confirmation, and must reach the proposing worker.
pub fn is_acknowledgement(text: &str) -> bool {
    ACKNOWLEDGEMENTS.contains(&normalize(text).as_str())
}

/// True when the text is a bare rejection of whatever was proposed.
pub fn is_rejection(text: &str) -> bool {
    REJECTIONS.contains(&normalize(text).as_str())
}

/// Refusal question for bulk destructive requests, which are never fanned
/// out to workers.
pub fn is_destructive_or_bulk(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    BULK_DESTRUCTIVE
        .iter()
        .find(|phrase| lower.contains(*phrase))
        .map(|phrase| {
            format!(
                "I do not run bulk operations like \"{phrase}\" in one step. Name one \
                 document at a time, for example \"slett faktura 1003\", and I will ask \
                 for confirmation before touching it."
            )
        })
}
