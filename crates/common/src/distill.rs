//! Context distillation.
//!
//! Before a transcript snapshot travels with a delegation, it is distilled
//! down to what the target worker can use: conversational text survives,
//! raw action machinery is folded into short summaries, and attachment
//! references are stripped for workers that cannot handle files.
//!
//! `distill` is a pure function of its inputs and is idempotent: distilling
//! an already-distilled transcript changes nothing. That property makes it
//! safe for the channel to re-distill at every hop.

use crate::outcome::ActionOutcome;
use crate::traits::WorkerCapability;
use crate::transcript::{ActionRecord, Role, Transcript, Turn, TurnPart};

/// Distill a transcript for a target with the given capabilities.
///
/// - Message turns pass through; blank ones are dropped.
/// - Each contiguous run of action turns becomes at most one synthetic
///   assistant turn summarizing outcomes and created identifiers.
/// - Attachment parts survive only when the target can handle attachments.
pub fn distill(transcript: &Transcript, capabilities: &[WorkerCapability]) -> Transcript {
    let keep_attachments = capabilities.contains(&WorkerCapability::AttachmentHandling);

    let mut out = Transcript::new();
    let mut action_run: Vec<&ActionRecord> = Vec::new();

    for turn in transcript.turns() {
        match turn {
            Turn::Action { record } => action_run.push(record),
            Turn::Message { role, parts } => {
                flush_action_run(&mut out, &mut action_run);
                let kept: Vec<TurnPart> = parts
                    .iter()
                    .filter(|part| match part {
                        TurnPart::Text { text } => !text.trim().is_empty(),
                        TurnPart::Attachment { .. } => keep_attachments,
                    })
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    out.push(Turn::Message {
                        role: *role,
                        parts: kept,
                    });
                }
            }
        }
    }
    flush_action_run(&mut out, &mut action_run);

    out
}

fn flush_action_run(out: &mut Transcript, run: &mut Vec<&ActionRecord>) {
    if run.is_empty() {
        return;
    }
    let lines: Vec<String> = run.iter().map(|record| summarize_record(record)).collect();
    run.clear();
    out.push(Turn::assistant(lines.join("\n")));
}

/// One summary line per action record. Identifiers always survive; free text
/// survives only when there is no identifier to carry the outcome.
fn summarize_record(record: &ActionRecord) -> String {
    let ids = extract_identifiers(&record.outcome);
    let mut line = if record.outcome.success {
        if ids.is_empty() {
            match &record.outcome.message {
                Some(msg) => format!("{} succeeded: {}", record.action, msg),
                None => format!("{} succeeded.", record.action),
            }
        } else {
            let joined = ids
                .iter()
                .map(|(label, value)| format!("{label} {value}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} succeeded: {}.", record.action, joined)
        }
    } else {
        match &record.outcome.message {
            Some(msg) => format!("{} failed: {}", record.action, msg),
            None => format!("{} failed.", record.action),
        }
    };
    if record.outcome.completed == Some(true) {
        line.push_str(" Task complete.");
    }
    line
}

/// Pull every identifier out of an outcome: the created map first, then
/// identifier-shaped keys in the details, top level and one level down.
pub fn extract_identifiers(outcome: &ActionOutcome) -> Vec<(String, String)> {
    let mut ids: Vec<(String, String)> = outcome
        .created
        .iter()
        .map(|(kind, id)| (kind.as_str().to_string(), id.clone()))
        .collect();

    if let serde_json::Value::Object(details) = &outcome.details {
        for (key, value) in details {
            if let Some(text) = identifier_value(value) {
                if is_identifier_key(key) {
                    ids.push((key.clone(), text));
                }
            } else if let serde_json::Value::Object(nested) = value {
                for (nested_key, nested_value) in nested {
                    if is_identifier_key(nested_key) {
                        if let Some(text) = identifier_value(nested_value) {
                            ids.push((nested_key.clone(), text));
                        }
                    }
                }
            }
        }
    }

    ids
}

fn is_identifier_key(key: &str) -> bool {
    key == "id" || key == "number" || key.ends_with("_id") || key.ends_with("_number")
}

fn identifier_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::WorkerId;
    use crate::outcome::EntityKind;
    use serde_json::json;

    fn record(action: &str, outcome: ActionOutcome) -> ActionRecord {
        ActionRecord::new(WorkerId::Sales, action, outcome)
    }

    #[test]
    fn test_text_turns_pass_through_and_blank_turns_drop() {
        let mut t = Transcript::new();
        t.push(Turn::user("lag en faktura til Kari"));
        t.push(Turn::assistant("   "));
        t.push(Turn::assistant("Skal jeg sende den?"));

        let distilled = distill(&t, &[]);
        assert_eq!(distilled.len(), 2);
        assert_eq!(distilled.turns()[0].text(), "lag en faktura til Kari");
        assert_eq!(distilled.turns()[1].text(), "Skal jeg sende den?");
    }

    #[test]
    fn test_action_run_collapses_to_one_assistant_turn() {
        let mut t = Transcript::new();
        t.push(Turn::user("registrer kvitteringene"));
        t.push(Turn::action(record(
            "create_purchase",
            ActionOutcome::ok().with_created(EntityKind::Purchase, "501"),
        )));
        t.push(Turn::action(record(
            "upload_attachment",
            ActionOutcome::ok().with_created(EntityKind::Attachment, "77"),
        )));

        let distilled = distill(&t, &[]);
        assert_eq!(distilled.len(), 2);

        let summary = &distilled.turns()[1];
        assert_eq!(summary.role(), Some(Role::Assistant));
        assert!(summary.text().contains("purchase 501"));
        assert!(summary.text().contains("attachment 77"));
    }

    #[test]
    fn test_separate_runs_stay_separate() {
        let mut t = Transcript::new();
        t.push(Turn::action(record("create_invoice", ActionOutcome::ok())));
        t.push(Turn::user("og en til"));
        t.push(Turn::action(record("create_invoice", ActionOutcome::ok())));

        let distilled = distill(&t, &[]);
        assert_eq!(distilled.len(), 3);
        assert!(distilled.turns()[0].text().contains("create_invoice"));
        assert!(distilled.turns()[2].text().contains("create_invoice"));
    }

    #[test]
    fn test_failure_message_survives() {
        let mut t = Transcript::new();
        t.push(Turn::action(record(
            "create_invoice",
            ActionOutcome::failed("customer not found"),
        )));

        let distilled = distill(&t, &[]);
        assert_eq!(
            distilled.turns()[0].text(),
            "create_invoice failed: customer not found"
        );
    }

    #[test]
    fn test_completion_marker_survives() {
        let mut t = Transcript::new();
        t.push(Turn::action(record(
            "register_invoice_payment",
            ActionOutcome::ok().with_completed(true),
        )));

        let distilled = distill(&t, &[]);
        assert!(distilled.turns()[0].text().ends_with("Task complete."));
    }

    #[test]
    fn test_attachment_parts_follow_capability() {
        let mut t = Transcript::new();
        t.push(Turn::Message {
            role: Role::User,
            parts: vec![
                TurnPart::Text {
                    text: "her er kvitteringen".into(),
                },
                TurnPart::Attachment {
                    name: "kvittering.pdf".into(),
                    ordinal: 1,
                },
            ],
        });

        let without = distill(&t, &[WorkerCapability::LedgerPostings]);
        assert_eq!(without.turns()[0].text(), "her er kvitteringen");
        match &without.turns()[0] {
            Turn::Message { parts, .. } => assert_eq!(parts.len(), 1),
            _ => panic!("expected message"),
        }

        let with = distill(&t, &[WorkerCapability::AttachmentHandling]);
        match &with.turns()[0] {
            Turn::Message { parts, .. } => assert_eq!(parts.len(), 2),
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn test_attachment_only_turn_drops_without_capability() {
        let mut t = Transcript::new();
        t.push(Turn::Message {
            role: Role::User,
            parts: vec![TurnPart::Attachment {
                name: "bilag.pdf".into(),
                ordinal: 1,
            }],
        });

        assert!(distill(&t, &[]).is_empty());
        assert_eq!(distill(&t, &[WorkerCapability::AttachmentHandling]).len(), 1);
    }

    #[test]
    fn test_distill_is_idempotent() {
        let mut t = Transcript::new();
        t.push(Turn::user("registrer et kjøp"));
        t.push(Turn::action(record(
            "create_purchase",
            ActionOutcome::ok()
                .with_created(EntityKind::Purchase, "88")
                .with_details(json!({"voucher_number": "2026-101"})),
        )));
        t.push(Turn::assistant("Kjøpet er registrert."));

        let once = distill(&t, &[WorkerCapability::PurchaseEntry]);
        let twice = distill(&once, &[WorkerCapability::PurchaseEntry]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_extract_identifiers_created_then_details() {
        let outcome = ActionOutcome::ok()
            .with_created(EntityKind::Invoice, "1042")
            .with_details(json!({
                "invoice_number": 1042,
                "customer": {"contact_id": "C-19", "name": "Kari Nordmann"},
                "note": "sent by email",
            }));

        let ids = extract_identifiers(&outcome);
        assert!(ids.contains(&("invoice".into(), "1042".into())));
        assert!(ids.contains(&("invoice_number".into(), "1042".into())));
        assert!(ids.contains(&("contact_id".into(), "C-19".into())));
        assert!(!ids.iter().any(|(k, _)| k == "name" || k == "note"));
    }

    #[test]
    fn test_identifier_keys() {
        assert!(is_identifier_key("id"));
        assert!(is_identifier_key("number"));
        assert!(is_identifier_key("invoice_id"));
        assert!(is_identifier_key("voucher_number"));
        assert!(!is_identifier_key("amount"));
        assert!(!is_identifier_key("identity"));
    }
}
