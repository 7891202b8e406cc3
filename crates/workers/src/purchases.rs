//! The purchases worker: expenses, receipt batches and purchase payments.
//!
//! Receipts are the attachment-heavy path. Each staged file pairs with one
//! amount from the message, and a confirmed batch creates every purchase
//! first and uploads its file right after, so an interrupted run never
//! leaves an attachment pointing at a purchase that does not exist.

use async_trait::async_trait;
use chrono::NaiveDate;
use munin_common::vat::{self, VatRate, VatTreatment};
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ProposedAction, Result, Worker,
    WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply, intent_fingerprint,
};
use munin_ledger::{AttachmentTarget, Ledger, LedgerResult, NewPurchase, Purchase};
use munin_llm::LlmClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    AttachmentDirective, AttachmentPolicy, ConfirmedAction, WorkerCore, attachment_directive,
    confirmed_action, corrected_date, duplicate_of, find_date, find_entity_ref, first_amount,
    iso, known_entity, leftover_description, scan_amounts, today_from, translate_error,
};

const PURCHASES_SYSTEM_PROMPT: &str = r#"You are the purchases specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. Record expenses and receipts with the correct VAT band
2. Attach receipt files to the purchases they document
3. Register payments on recorded purchases
4. Ask one precise question when an amount or the VAT treatment is missing

Keep replies short and concrete. Never invent amounts, dates or identifiers. Propose every ledger change and wait for confirmation."#;

/// Lead-in words that carry no meaning for the ledger entry itself.
const EXPENSE_FILLER: &[&str] = &[
    "registrer", "før", "legg", "inn", "opp", "en", "et", "ei", "ny", "nytt", "utgift",
    "utgiften", "utgifter", "kjøp", "kjøpet", "kvittering", "kvitteringen", "kvitteringer",
    "kvitteringene", "expense", "receipt", "receipts", "record", "add", "please", "på", "for",
    "gjelder", "disse", "these", "denne", "her", "følgende", "following", "alle", "alt", "to",
    "tre", "fire", "fem",
];

/// One expense parsed out of a request, carried through the confirmation
/// round trip as proposal inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceiptDraft {
    description: String,
    gross_ore: i64,
    vat_percent: u32,
    date: String,
    /// Staged file to attach once the purchase exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ordinal: Option<u32>,
    /// Already settled; receipts are, invoiced purchases usually are not
    #[serde(default)]
    paid: bool,
    fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurchaseTask {
    /// Record one or more expenses, pairing staged files where present
    RecordExpenses,
    /// Mark an existing purchase as paid
    RegisterPayment,
}

fn determine_task(task: &str) -> PurchaseTask {
    let lowered = task.to_lowercase();
    const PAYMENT: [&str; 6] = [
        "er betalt",
        "som betalt",
        "registrer betaling",
        "betalingen",
        "mark as paid",
        "register payment",
    ];
    if PAYMENT.iter().any(|k| lowered.contains(k)) {
        PurchaseTask::RegisterPayment
    } else {
        PurchaseTask::RecordExpenses
    }
}

/// Split a request into one segment per expense. Commas, conjunctions and
/// line breaks separate receipts; a conjunction only splits when both sides
/// carry their own amount, so "mat og drikke 300 kr" stays one expense.
fn split_segments(task: &str) -> Vec<String> {
    let mut segments: Vec<String> = task
        .split(['\n', ';'])
        .flat_map(|part| part.split(", "))
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect();
    for conjunction in [" og ", " and "] {
        segments = segments
            .into_iter()
            .flat_map(|segment| {
                if let Some((left, right)) = segment.split_once(conjunction)
                    && first_amount(left).is_some()
                    && first_amount(right).is_some()
                {
                    vec![left.trim().to_string(), right.trim().to_string()]
                } else {
                    vec![segment]
                }
            })
            .collect();
    }
    segments
}

fn filename_stem(name: &str) -> String {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    stem.replace(['-', '_'], " ").trim().to_string()
}

/// Domain specialist for purchases, expenses and receipts.
pub struct PurchasesWorker {
    core: WorkerCore,
}

impl PurchasesWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Purchases, "Purchases Worker"),
            ledger,
        )
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.core.set_llm(client);
        self
    }

    async fn execute(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        if let Some(confirmed) = confirmed_action(request) {
            return self.run_confirmed(confirmed, request, ctx, today).await;
        }
        let directive = attachment_directive(request, ctx.attachments);
        if directive.policy == AttachmentPolicy::UploadOnly {
            return Ok(self.propose_upload(request, ctx, &directive));
        }
        match determine_task(&request.task) {
            PurchaseTask::RegisterPayment => self.propose_payment(request, today).await,
            PurchaseTask::RecordExpenses => {
                Ok(self.propose_expenses(request, ctx, &directive, today))
            }
        }
    }

    /// Parse the request into receipt drafts and propose recording them.
    fn propose_expenses(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        directive: &AttachmentDirective,
        today: NaiveDate,
    ) -> WorkerReply {
        let has_files = !directive.ordinals.is_empty();
        let treatment = match vat::detect_treatment(&request.task) {
            Some(treatment) => treatment,
            // A receipt states the final amount, so staged files imply gross
            // figures. A purely verbal amount needs the user to say which.
            None if has_files => VatTreatment::Inclusive,
            None => {
                let Some(amount) = first_amount(&request.task) else {
                    return WorkerReply::question(
                        "How much was the expense? Please include the amount, for example \"250 kr\".",
                    );
                };
                return WorkerReply::question(format!(
                    "Is {} including or excluding VAT? Reply \"inkl. mva\" or \"eks. mva\".",
                    vat::format_nok(amount)
                ));
            }
        };

        let already_paid = request.task.to_lowercase().contains("betalt");
        let mut drafts = Vec::new();
        for segment in split_segments(&request.task) {
            let scan = scan_amounts(&segment);
            let segment_treatment = vat::detect_treatment(&segment).unwrap_or(treatment);
            let date = find_date(&segment, today)
                .or_else(|| find_date(&request.task, today))
                .unwrap_or_else(|| iso(today));
            for &stated in &scan.amounts {
                let description = leftover_description(&scan, EXPENSE_FILLER);
                let rate = VatRate::infer(&description);
                let gross_ore = match segment_treatment {
                    VatTreatment::Inclusive => stated,
                    VatTreatment::Exclusive => vat::gross_from_net(stated, rate),
                };
                drafts.push(ReceiptDraft {
                    description,
                    gross_ore,
                    vat_percent: rate.percent(),
                    date: date.clone(),
                    ordinal: None,
                    paid: already_paid,
                    fingerprint: String::new(),
                });
            }
        }

        if has_files {
            if drafts.len() != directive.ordinals.len() {
                return WorkerReply::question(format!(
                    "You attached {} file(s) but I found {} amount(s) in the message. \
                     Please state one amount per receipt so I can pair them up.",
                    directive.ordinals.len(),
                    drafts.len()
                ));
            }
            for (draft, &ordinal) in drafts.iter_mut().zip(&directive.ordinals) {
                draft.ordinal = Some(ordinal);
                draft.paid = true;
                if draft.description.is_empty() {
                    draft.description = ctx
                        .attachments
                        .get(ordinal)
                        .map(|file| filename_stem(&file.name))
                        .unwrap_or_else(|| format!("Kvittering {ordinal}"));
                }
            }
        }
        if drafts.is_empty() {
            return WorkerReply::question(
                "How much was the expense? Please include the amount, for example \"250 kr\".",
            );
        }
        for draft in &mut drafts {
            if draft.description.is_empty() {
                draft.description = "Diverse utgift".into();
            }
            draft.fingerprint = intent_fingerprint(
                EntityKind::Purchase,
                "",
                draft.gross_ore,
                &draft.date,
                &draft.description,
            );
        }

        let mut skipped = Vec::new();
        drafts.retain(|draft| match duplicate_of(request, &draft.fingerprint) {
            Some(existing) => {
                skipped.push(format!(
                    "{} is already recorded as {existing}",
                    draft.description
                ));
                false
            }
            None => true,
        });
        if drafts.is_empty() {
            return WorkerReply::text(format!(
                "{}; I have not recorded anything again.",
                skipped.join(", ")
            ));
        }

        let mut summary = if drafts.len() == 1 {
            let draft = &drafts[0];
            format!(
                "New expense: {}, {} including {}% VAT, dated {}{}.",
                draft.description,
                vat::format_nok(draft.gross_ore),
                draft.vat_percent,
                draft.date,
                attachment_note(draft, ctx),
            )
        } else {
            let mut lines = vec![format!("I will record {} receipts:", drafts.len())];
            for (i, draft) in drafts.iter().enumerate() {
                lines.push(format!(
                    "{}. {}, {} including {}% VAT, dated {}{}",
                    i + 1,
                    draft.description,
                    vat::format_nok(draft.gross_ore),
                    draft.vat_percent,
                    draft.date,
                    attachment_note(draft, ctx),
                ));
            }
            lines.join("\n")
        };
        if !skipped.is_empty() {
            summary.push_str(&format!("\nSkipping: {}.", skipped.join(", ")));
        }

        let fingerprint = drafts
            .iter()
            .map(|draft| draft.fingerprint.as_str())
            .collect::<Vec<_>>()
            .join("+");
        WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "record_receipts".into(),
            summary,
            inputs: serde_json::json!({ "receipts": drafts }),
            fingerprint,
        })
    }

    async fn run_confirmed(
        &self,
        confirmed: ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        match confirmed.action.as_str() {
            "record_receipts" => {
                self.run_record_receipts(&confirmed, request, ctx, today).await
            }
            "register_purchase_payment" => self.run_register_payment(&confirmed, today).await,
            "upload_attachments" => Ok(self.run_upload(&confirmed, ctx).await),
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
    }

    /// Execute a confirmed receipt batch: create each purchase, then upload
    /// its file. One rejection never aborts the rest of the batch.
    async fn run_record_receipts(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let drafts: Vec<ReceiptDraft> =
            serde_json::from_value(confirmed.inputs["receipts"].clone())?;

        let mut lines = Vec::new();
        let mut records = Vec::new();
        let mut all_ok = true;

        for draft in &drafts {
            if let Some(existing) = duplicate_of(request, &draft.fingerprint) {
                lines.push(format!(
                    "{} was already recorded as {existing}; skipped.",
                    draft.description
                ));
                continue;
            }
            let new = NewPurchase {
                contact_id: None,
                date: draft.date.clone(),
                description: draft.description.clone(),
                gross_ore: draft.gross_ore,
                vat_rate: VatRate::from_percent(draft.vat_percent).unwrap_or(VatRate::Standard),
                paid: draft.paid,
            };

            let purchase = match self.create_with_date_retry(new, &draft.date, today).await {
                Ok(purchase) => purchase,
                Err(err) => {
                    all_ok = false;
                    records.push(
                        ActionRecord::new(
                            self.id(),
                            "create_purchase",
                            ActionOutcome::failed(err.to_string()),
                        )
                        .with_fingerprint(draft.fingerprint.clone()),
                    );
                    lines.push(translate_error(&err));
                    continue;
                }
            };

            lines.push(format!(
                "Recorded {}: {} ({})",
                draft.description,
                vat::format_nok(draft.gross_ore),
                purchase.id
            ));
            records.push(
                ActionRecord::new(
                    self.id(),
                    "create_purchase",
                    ActionOutcome::ok()
                        .with_message(format!("purchase {} recorded", purchase.id))
                        .with_created(EntityKind::Purchase, purchase.id.clone()),
                )
                .with_inputs(serde_json::to_value(draft)?)
                .with_fingerprint(draft.fingerprint.clone()),
            );

            let Some(ordinal) = draft.ordinal else {
                continue;
            };
            let Some(file) = ctx.attachments.get(ordinal) else {
                lines.push(format!(
                    "No staged file {ordinal} left to attach to {}.",
                    purchase.id
                ));
                continue;
            };
            let target = AttachmentTarget::new(EntityKind::Purchase, purchase.id.clone());
            let (record, failure) = self.core.upload_file(target, file, ordinal).await;
            if let Some(line) = failure {
                all_ok = false;
                lines.push(line);
            }
            records.push(record);
        }

        if all_ok && let Some(last) = records.last_mut() {
            last.outcome.completed = Some(true);
        }

        let template = lines.join("\n");
        let text = self
            .core
            .enhance_with_llm(&template, &request.task, self.system_prompt())
            .await;
        let mut reply = WorkerReply::text(text);
        reply.actions = records;
        Ok(reply)
    }

    /// Create a purchase, retrying once with a normalized date when the
    /// ledger rejects the date field.
    async fn create_with_date_retry(
        &self,
        new: NewPurchase,
        stated_date: &str,
        today: NaiveDate,
    ) -> LedgerResult<Purchase> {
        match self.core.ledger.create_purchase(new.clone()).await {
            Ok(purchase) => Ok(purchase),
            Err(err) => {
                let Some(fixed) = corrected_date(&err, stated_date, today) else {
                    return Err(err);
                };
                info!(
                    worker = %self.id(),
                    rejected = %stated_date,
                    corrected = %fixed,
                    "Retrying purchase with normalized date"
                );
                let retried = NewPurchase { date: fixed, ..new };
                self.core.ledger.create_purchase(retried).await
            }
        }
    }

    async fn propose_payment(
        &self,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let target = find_entity_ref(&request.task, "p")
            .or_else(|| known_entity(request, EntityKind::Purchase));
        let Some(purchase_id) = target else {
            return Ok(WorkerReply::question(
                "Which purchase was paid? Give its identifier, for example p-3.",
            ));
        };

        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));
        let amount_ore = match first_amount(&request.task) {
            Some(amount) => amount,
            None => {
                let purchases = match self.core.ledger.list_purchases().await {
                    Ok(purchases) => purchases,
                    Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
                };
                match purchases.iter().find(|p| p.id == purchase_id) {
                    Some(purchase) => purchase.gross_ore,
                    None => {
                        return Ok(WorkerReply::question(format!(
                            "I could not find purchase {purchase_id} in the ledger. \
                             Please check the identifier."
                        )));
                    }
                }
            }
        };

        let fingerprint = intent_fingerprint(
            EntityKind::Payment,
            &purchase_id,
            amount_ore,
            &date,
            "purchase payment",
        );
        if duplicate_of(request, &fingerprint).is_some() {
            return Ok(WorkerReply::text(format!(
                "That payment on {purchase_id} is already registered; nothing to do."
            )));
        }

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "register_purchase_payment".into(),
            summary: format!(
                "Register a payment of {} on purchase {purchase_id}, dated {date}.",
                vat::format_nok(amount_ore)
            ),
            inputs: serde_json::json!({
                "purchase_id": purchase_id,
                "date": date,
                "amount_ore": amount_ore,
            }),
            fingerprint,
        }))
    }

    async fn run_register_payment(
        &self,
        confirmed: &ConfirmedAction,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let purchase_id = confirmed.inputs["purchase_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let mut date = confirmed.inputs["date"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let amount_ore = confirmed.inputs["amount_ore"].as_i64().unwrap_or_default();

        let mut result = self
            .core
            .ledger
            .register_purchase_payment(&purchase_id, &date, amount_ore)
            .await;
        if let Err(err) = &result
            && let Some(fixed) = corrected_date(err, &date, today)
        {
            info!(worker = %self.id(), corrected = %fixed, "Retrying payment with normalized date");
            result = self
                .core
                .ledger
                .register_purchase_payment(&purchase_id, &fixed, amount_ore)
                .await;
            date = fixed;
        }

        match result {
            Ok(()) => {
                let record = ActionRecord::new(
                    self.id(),
                    "register_purchase_payment",
                    ActionOutcome::ok()
                        .with_message(format!("payment registered on {purchase_id}"))
                        .with_completed(true),
                )
                .with_inputs(confirmed.inputs.clone())
                .with_fingerprint(confirmed.fingerprint.clone());
                Ok(WorkerReply::text(format!(
                    "Marked purchase {purchase_id} as paid on {date}."
                ))
                .with_action(record))
            }
            Err(err) => Ok(WorkerReply::text(translate_error(&err)).with_action(
                ActionRecord::new(
                    self.id(),
                    "register_purchase_payment",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }

    /// Attach staged files to an existing purchase without creating anything.
    fn propose_upload(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        directive: &AttachmentDirective,
    ) -> WorkerReply {
        let target = find_entity_ref(&request.task, "p")
            .or_else(|| known_entity(request, EntityKind::Purchase));
        let Some(purchase_id) = target else {
            return WorkerReply::question(
                "Which purchase should the file be attached to? Give its identifier, for example p-3.",
            );
        };
        if directive.ordinals.is_empty() {
            return WorkerReply::text("There is no staged file to attach.");
        }
        let names: Vec<String> = directive
            .ordinals
            .iter()
            .filter_map(|&ordinal| ctx.attachments.get(ordinal))
            .map(|file| file.name.clone())
            .collect();
        let fingerprint = intent_fingerprint(
            EntityKind::Attachment,
            &purchase_id,
            directive.ordinals.len() as i64,
            "",
            &names.join(" "),
        );
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return WorkerReply::text(format!(
                "Those files are already attached to {purchase_id} (attachment {existing})."
            ));
        }
        WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "upload_attachments".into(),
            summary: format!("Attach {} to purchase {purchase_id}.", names.join(", ")),
            inputs: serde_json::json!({
                "target_id": purchase_id,
                "ordinals": directive.ordinals,
            }),
            fingerprint,
        })
    }

    async fn run_upload(
        &self,
        confirmed: &ConfirmedAction,
        ctx: &WorkerContext<'_>,
    ) -> WorkerReply {
        let target_id = confirmed.inputs["target_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let ordinals: Vec<u32> = confirmed.inputs["ordinals"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_u64())
                    .map(|v| v as u32)
                    .collect()
            })
            .unwrap_or_default();

        let mut lines = Vec::new();
        let mut records = Vec::new();
        for ordinal in ordinals {
            let Some(file) = ctx.attachments.get(ordinal) else {
                lines.push(format!("There is no staged file {ordinal} any more."));
                continue;
            };
            let target = AttachmentTarget::new(EntityKind::Purchase, target_id.clone());
            let (record, failure) = self.core.upload_file(target, file, ordinal).await;
            match failure {
                Some(line) => lines.push(line),
                None => lines.push(format!("Attached {} to {target_id}.", file.name)),
            }
            records.push(record);
        }
        if records.iter().all(|r| r.outcome.success)
            && let Some(last) = records.last_mut()
        {
            last.outcome.completed = Some(true);
        }
        let mut reply = WorkerReply::text(lines.join("\n"));
        reply.actions = records;
        reply
    }
}

#[async_trait]
impl Worker for PurchasesWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[
            WorkerCapability::PurchaseEntry,
            WorkerCapability::AttachmentHandling,
        ]
    }

    async fn handle(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
    ) -> Result<WorkerReply> {
        info!(
            worker = %self.id(),
            origin = %request.origin,
            depth = request.depth,
            "Handling purchases delegation"
        );
        self.core.claim()?;
        let result = self.execute(request, ctx, today_from(request)).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(PURCHASES_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}

fn attachment_note(draft: &ReceiptDraft, ctx: &WorkerContext<'_>) -> String {
    match draft.ordinal.and_then(|ordinal| ctx.attachments.get(ordinal)) {
        Some(file) => format!(", attaching {}", file.name),
        None => String::new(),
    }
}
