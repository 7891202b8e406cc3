//! End-to-end conversation tests across the full engine: coordinator,
//! keyword triage, delegation channel, all six workers and the in-memory
//! ledger. No LLM is configured, so everything here runs offline.

use chrono::NaiveDate;
use munin_common::{AttachmentSet, EntityKind, Role, Transcript, Turn, TurnPart};
use munin_coordinator::{ConversationConfig, Coordinator, DelegationChannel, Triage, TurnReply};
use munin_ledger::{ContactKind, InMemoryLedger};
use munin_workers::standard_workers;
use std::sync::Arc;

fn engine(ledger: Arc<InMemoryLedger>) -> Coordinator {
    let workers = standard_workers(ledger, None);
    let channel = Arc::new(DelegationChannel::new(workers));
    Coordinator::new(channel, Triage::new(None), ConversationConfig::default())
        .with_today(NaiveDate::from_ymd_opt(2026, 8, 25).unwrap())
}

fn first_turn(text: &str) -> Transcript {
    vec![Turn::user(text)].into_iter().collect()
}

/// Continue a conversation: the previous reply's transcript plus the next
/// user message, exactly as a client would post it back.
fn followup(reply: &TurnReply, text: &str) -> Transcript {
    let mut transcript = reply.transcript.clone();
    transcript.push(Turn::user(text));
    transcript
}

/// Four receipts from a trade fair, one amount per line, one file each.
fn fair_receipts_turn() -> Transcript {
    vec![Turn::Message {
        role: Role::User,
        parts: vec![
            TurnPart::Text {
                text: "fire kvitteringer fra messen:\ntaxi 250 kr\nlunsj 480 kr\n\
                       parkering 120 kr\nmiddag 890 kr"
                    .into(),
            },
            TurnPart::Attachment {
                name: "kvittering-1.pdf".into(),
                ordinal: 1,
            },
            TurnPart::Attachment {
                name: "kvittering-2.pdf".into(),
                ordinal: 2,
            },
            TurnPart::Attachment {
                name: "kvittering-3.pdf".into(),
                ordinal: 3,
            },
            TurnPart::Attachment {
                name: "kvittering-4.pdf".into(),
                ordinal: 4,
            },
        ],
    }]
    .into_iter()
    .collect()
}

/// The staged files behind the receipt turn, re-offered on every turn of
/// the task the way the API layer re-stages them.
fn fair_files() -> AttachmentSet {
    let mut set = AttachmentSet::new();
    for i in 1..=4 {
        set.add(format!("kvittering-{i}.pdf"), "application/pdf", "aGVp");
    }
    set
}

// ============================================================================
// Receipt batches (creation + upload pairing)
// ============================================================================

#[tokio::test]
async fn test_four_receipts_create_exactly_four_purchases_with_uploads() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    let proposal = engine
        .process(fair_receipts_turn(), fair_files())
        .await
        .unwrap();
    assert!(proposal.text.contains("4 receipts"));
    assert!(proposal.text.contains("Reply \"yes\""));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 0);

    let done = engine
        .process(followup(&proposal, "ja"), fair_files())
        .await
        .unwrap();
    assert!(done.text.contains("Recorded"));

    // Exactly four creations and four uploads, not three, not five.
    assert_eq!(ledger.created_count(EntityKind::Purchase), 4);
    assert_eq!(ledger.call_count("create_purchase"), 4);
    assert_eq!(ledger.created_count(EntityKind::Attachment), 4);

    // Each upload landed on the purchase created for its receipt.
    let purchases: Vec<String> = ledger
        .creations()
        .into_iter()
        .filter(|(kind, _)| *kind == EntityKind::Purchase)
        .map(|(_, id)| id)
        .collect();
    let links: Vec<String> = ledger
        .attachment_links()
        .into_iter()
        .map(|target| target.id)
        .collect();
    assert_eq!(links, purchases);

    let amounts: Vec<i64> = purchases
        .iter()
        .map(|id| ledger.purchase(id).unwrap().gross_ore)
        .collect();
    assert_eq!(amounts, vec![25_000, 48_000, 12_000, 89_000]);
}

#[tokio::test]
async fn test_late_acknowledgement_never_replays_the_batch() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    let proposal = engine
        .process(fair_receipts_turn(), fair_files())
        .await
        .unwrap();
    let done = engine
        .process(followup(&proposal, "ja"), fair_files())
        .await
        .unwrap();
    assert_eq!(ledger.created_count(EntityKind::Purchase), 4);

    // A second "ja" arrives after the batch already ran.
    let stale = engine
        .process(followup(&done, "ja"), fair_files())
        .await
        .unwrap();
    assert!(stale.text.contains("Nothing is awaiting confirmation"));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 4);
    assert_eq!(ledger.call_count("create_purchase"), 4);
}

#[tokio::test]
async fn test_rejected_proposal_leaves_no_trace_in_the_ledger() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    let proposal = engine
        .process(fair_receipts_turn(), fair_files())
        .await
        .unwrap();
    let rejected = engine
        .process(followup(&proposal, "nei"), fair_files())
        .await
        .unwrap();

    assert!(rejected.text.contains("nothing has been recorded"));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 0);
    assert_eq!(ledger.call_count("create_purchase"), 0);
    assert_eq!(ledger.call_count("upload_attachment"), 0);
}

// ============================================================================
// Clarifying questions and continuation
// ============================================================================

#[tokio::test]
async fn test_vat_question_is_asked_once_and_answer_flows_back() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    // No files and no VAT treatment stated: the worker has to ask.
    let question = engine
        .process(
            first_turn("registrer en utgift på 500 kr"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    assert!(question.text.contains("including or excluding VAT"));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 0);

    // The bare answer reaches the purchases worker merged into the original
    // task; no second VAT question, just the proposal.
    let proposal = engine
        .process(followup(&question, "inkl. mva"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(!proposal.text.contains("including or excluding VAT"));
    assert!(proposal.text.contains("500,00 kr"));
    assert!(proposal.text.contains("Reply \"yes\""));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 0);

    let done = engine
        .process(followup(&proposal, "ja"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(done.text.contains("Recorded"));
    assert_eq!(ledger.created_count(EntityKind::Purchase), 1);

    let (_, id) = ledger
        .creations()
        .into_iter()
        .find(|(kind, _)| *kind == EntityKind::Purchase)
        .unwrap();
    assert_eq!(ledger.purchase(&id).unwrap().gross_ore, 50_000);
}

// ============================================================================
// Payment matching
// ============================================================================

#[tokio::test]
async fn test_payment_match_with_no_candidates_asks_and_keeps_invoice_open() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
    let invoice = ledger.seed_open_invoice(&contact.id, "2026-08-15", 125_000);
    let engine = engine(ledger.clone());

    let question = engine
        .process(
            first_turn("har kunden betalt faktura 1000?"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    assert!(question.text.contains("paid outside the bank account"));
    assert!(question.text.contains("still unpaid"));

    let answer = engine
        .process(
            followup(&question, "nei, den er fortsatt ubetalt"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    assert!(answer.text.contains("stays open"));
    assert!(!ledger.invoice(&invoice.id).unwrap().paid);
    assert_eq!(ledger.call_count("register_invoice_payment"), 0);
}

#[tokio::test]
async fn test_single_candidate_match_is_confirmed_then_registered() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
    let invoice = ledger.seed_open_invoice(&contact.id, "2026-08-15", 125_000);
    // Inflow within the ±2 kr tolerance.
    ledger.seed_transaction("2026-08-20", 124_900, "VIPPS KARI NORDMANN");
    let engine = engine(ledger.clone());

    let proposal = engine
        .process(
            first_turn("har kunden betalt faktura 1000?"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    // The one candidate is named with date, amount and description.
    assert!(proposal.text.contains("2026-08-20"));
    assert!(proposal.text.contains("1 249,00 kr"));
    assert!(proposal.text.contains("VIPPS KARI NORDMANN"));
    assert!(proposal.text.contains("Reply \"yes\""));
    assert!(!ledger.invoice(&invoice.id).unwrap().paid);

    let done = engine
        .process(followup(&proposal, "ja"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(ledger.invoice(&invoice.id).unwrap().paid);
    assert_eq!(ledger.call_count("register_invoice_payment"), 1);
    assert!(!done.text.is_empty());
}

#[tokio::test]
async fn test_paid_outside_answer_is_proposed_before_registration() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
    let invoice = ledger.seed_open_invoice(&contact.id, "2026-08-15", 125_000);
    let engine = engine(ledger.clone());

    let question = engine
        .process(
            first_turn("har kunden betalt faktura 1000?"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    let proposal = engine
        .process(
            followup(&question, "nei, den er betalt utenfor banken"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    // Registering an outside payment is still a side effect: confirm first.
    assert!(proposal.text.contains("Reply \"yes\""));
    assert!(!ledger.invoice(&invoice.id).unwrap().paid);

    engine
        .process(followup(&proposal, "ja"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(ledger.invoice(&invoice.id).unwrap().paid);
}

// ============================================================================
// Cross-worker delegation
// ============================================================================

#[tokio::test]
async fn test_accepted_offer_is_invoiced_via_nested_delegation() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
    let engine = engine(ledger.clone());

    let offer_proposal = engine
        .process(
            first_turn("send et tilbud til Kari Nordmann AS på 12 500 kr eks. mva"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    assert!(offer_proposal.text.contains("Reply \"yes\""));

    let offer_done = engine
        .process(followup(&offer_proposal, "ja"), AttachmentSet::new())
        .await
        .unwrap();
    assert_eq!(ledger.created_count(EntityKind::Offer), 1);
    assert_eq!(ledger.created_count(EntityKind::Invoice), 0);

    // Conversion runs through offers, which hands the creation to sales.
    let convert_proposal = engine
        .process(
            followup(&offer_done, "kunden aksepterte tilbud 100, lag faktura"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();
    assert!(convert_proposal.text.contains("Reply \"yes\""));
    assert_eq!(ledger.created_count(EntityKind::Invoice), 0);

    let converted = engine
        .process(followup(&convert_proposal, "ja"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(converted.text.contains("Offer accepted"));
    assert_eq!(ledger.created_count(EntityKind::Invoice), 1);
    assert_eq!(ledger.call_count("create_invoice"), 1);
}

// ============================================================================
// Routing and policy
// ============================================================================

#[tokio::test]
async fn test_unpaid_listing_routes_to_sales_not_banking() {
    let ledger = Arc::new(InMemoryLedger::new());
    let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
    ledger.seed_open_invoice(&contact.id, "2026-08-15", 125_000);
    let engine = engine(ledger.clone());

    // "ubetalte" contains "betalt"; the listing must still reach sales.
    let reply = engine
        .process(first_turn("vis ubetalte fakturaer"), AttachmentSet::new())
        .await
        .unwrap();
    assert!(reply.text.contains("Invoice 1000"));
    assert_eq!(ledger.call_count("list_open_invoices"), 1);
    assert_eq!(ledger.call_count("list_transactions"), 0);
}

#[tokio::test]
async fn test_bulk_destructive_request_reaches_no_worker() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    let reply = engine
        .process(
            first_turn("slett alle fakturaene fra i fjor"),
            AttachmentSet::new(),
        )
        .await
        .unwrap();

    assert!(reply.text.contains("one"));
    assert!(ledger.creations().is_empty());
}

#[tokio::test]
async fn test_transcript_round_trip_preserves_action_records() {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = engine(ledger.clone());

    let proposal = engine
        .process(fair_receipts_turn(), fair_files())
        .await
        .unwrap();
    let done = engine
        .process(followup(&proposal, "ja"), fair_files())
        .await
        .unwrap();

    // 4 creations + 4 uploads as records, plus the proposal marker.
    assert_eq!(done.transcript.action_records().count(), 9);

    // The transcript a client stores and posts back is plain JSON.
    let serialized = serde_json::to_string(&done.transcript).unwrap();
    let restored: Transcript = serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored.len(), done.transcript.len());
    assert_eq!(restored.action_records().count(), 9);
}
