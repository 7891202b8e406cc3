//! The sales worker: invoices, credit notes and invoice payments.
//!
//! Two rules shape this module. Issued invoices are never deleted; a request
//! to delete or cancel one becomes a credit note that reverses it in full.
//! And customers are resolved through the contacts worker over the
//! delegation channel, so the catalog logic lives in exactly one place.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use munin_common::vat::{self, VatRate, VatTreatment};
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ProposedAction, Result, Worker,
    WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply, intent_fingerprint,
};
use munin_ledger::{
    AttachmentTarget, DocumentLine, Ledger, LedgerError, NewCreditNote, NewInvoice,
};
use munin_llm::LlmClient;
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    AttachmentDirective, AttachmentPolicy, ConfirmedAction, ContactResolution, WorkerCore,
    attachment_directive, confirmed_action, corrected_date, duplicate_of, extract_counterparty,
    find_date, iso, leftover_description, resolve_contact, resolve_invoice_ref, scan_amounts,
    today_from, translate_error,
};

const SALES_SYSTEM_PROMPT: &str = r#"You are the sales specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. Create invoices to verified customers with the correct VAT band
2. Reverse issued invoices with credit notes, never by deleting them
3. Register incoming payments on invoices
4. Answer questions about open invoices

Keep replies short and concrete. Never invent amounts, dates or identifiers. Propose every ledger change and wait for confirmation."#;

/// Where invoice numbering starts when the sequence was never initialized.
const FIRST_INVOICE_NUMBER: i64 = 1000;

const INVOICE_FILLER: &[&str] = &[
    "fakturer", "faktura", "fakturaen", "lag", "opprett", "send", "ny", "en", "et", "invoice",
    "create", "bill", "please", "for", "på", "gjelder", "om",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SalesTask {
    CreateInvoice,
    /// Deletion and cancellation requests land here too
    ReverseInvoice,
    RegisterPayment,
    ListOpen,
}

fn determine_task(task: &str) -> SalesTask {
    let lowered = task.to_lowercase();
    const REVERSE: [&str; 7] = [
        "kreditnota",
        "credit note",
        "slett",
        "delete",
        "kanseller",
        "cancel",
        "reverser",
    ];
    const PAYMENT: [&str; 5] = ["betalt", "betaling", "innbetaling", "paid", "payment"];
    const LIST: [&str; 5] = [
        "ubetalte",
        "åpne faktura",
        "open invoices",
        "utestående",
        "vis faktura",
    ];
    // "ubetalte" contains "betalt", so the list check runs first
    if REVERSE.iter().any(|k| lowered.contains(k)) {
        SalesTask::ReverseInvoice
    } else if LIST.iter().any(|k| lowered.contains(k)) {
        SalesTask::ListOpen
    } else if PAYMENT.iter().any(|k| lowered.contains(k)) {
        SalesTask::RegisterPayment
    } else {
        SalesTask::CreateInvoice
    }
}

/// Domain specialist for sales documents.
pub struct SalesWorker {
    core: WorkerCore,
}

impl SalesWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Sales, "Sales Worker"),
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
            return self.propose_upload(request, ctx, &directive).await;
        }
        match determine_task(&request.task) {
            SalesTask::CreateInvoice => self.propose_invoice(request, ctx, today).await,
            SalesTask::ReverseInvoice => self.propose_reversal(request, today).await,
            SalesTask::RegisterPayment => self.propose_payment(request, today).await,
            SalesTask::ListOpen => self.list_open().await,
        }
    }

    async fn propose_invoice(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut scan = scan_amounts(&request.task);
        let Some(stated) = scan.amounts.first().copied() else {
            return Ok(WorkerReply::question(
                "What amount should the invoice be for? Please include it, for example \"5 000 kr\".",
            ));
        };
        let Some(treatment) = vat::detect_treatment(&request.task) else {
            return Ok(WorkerReply::question(format!(
                "Is {} including or excluding VAT? Reply \"inkl. mva\" or \"eks. mva\".",
                vat::format_nok(stated)
            )));
        };
        let Some((stated_name, range)) = extract_counterparty(&scan) else {
            return Ok(WorkerReply::question(
                "Who should the invoice go to? Give the customer's name.",
            ));
        };
        for idx in range {
            scan.consumed[idx] = true;
        }

        let resolution =
            resolve_contact(ctx.delegator, self.id(), ctx.depth, &stated_name).await?;
        let (contact_id, contact_name) = match resolution {
            ContactResolution::Found { id, name } => (id, name),
            ContactResolution::Missing { question } => {
                return Ok(WorkerReply::question(question));
            }
            ContactResolution::Unavailable => {
                return Ok(WorkerReply::text(
                    "The contact register is not responding right now, so I could not verify \
                     the customer. Nothing was created; please try again in a moment.",
                ));
            }
        };

        let mut description = leftover_description(&scan, INVOICE_FILLER);
        if description.is_empty() {
            description = "Varer og tjenester".into();
        }
        let rate = VatRate::infer(&description);
        let (unit_price_ore, gross_ore) = match treatment {
            VatTreatment::Exclusive => (stated, vat::gross_from_net(stated, rate)),
            VatTreatment::Inclusive => (vat::net_from_gross(stated, rate), stated),
        };
        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));
        let due_date = iso(today + Days::new(14));

        let fingerprint =
            intent_fingerprint(EntityKind::Invoice, &contact_id, gross_ore, &date, &description);
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That invoice already exists as {existing}; I have not created it again."
            )));
        }

        let new = NewInvoice {
            contact_id,
            date: date.clone(),
            due_date: Some(due_date.clone()),
            lines: vec![DocumentLine {
                description: description.clone(),
                quantity: 1,
                unit_price_ore,
                vat_rate: rate,
            }],
        };

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_invoice".into(),
            summary: format!(
                "Invoice to {contact_name}: {description}, {} including {}% VAT, dated {date}, due {due_date}.",
                vat::format_nok(gross_ore),
                rate.percent(),
            ),
            inputs: serde_json::json!({
                "invoice": new,
                "contact_name": contact_name,
            }),
            fingerprint,
        }))
    }

    async fn run_confirmed(
        &self,
        confirmed: ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        match confirmed.action.as_str() {
            "create_invoice" => self.run_create_invoice(&confirmed, request, ctx, today).await,
            "create_credit_note" => self.run_create_credit_note(&confirmed, today).await,
            "register_invoice_payment" => self.run_register_payment(&confirmed, today).await,
            "upload_attachments" => Ok(self.run_upload(&confirmed, ctx).await),
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
    }

    /// Execute a confirmed invoice. One correction is attempted before the
    /// single retry: an uninitialized number sequence gets initialized, a
    /// stale contact is re-resolved, a rejected date is normalized.
    async fn run_create_invoice(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut new: NewInvoice = serde_json::from_value(confirmed.inputs["invoice"].clone())?;
        let contact_name = confirmed.inputs["contact_name"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if let Some(existing) = duplicate_of(request, &confirmed.fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That invoice already exists as {existing}; I have not created it again."
            )));
        }

        let mut records = Vec::new();
        let mut result = self.core.ledger.create_invoice(new.clone()).await;

        if let Err(err) = &result {
            match err {
                LedgerError::MissingPrecondition(_) => {
                    info!(worker = %self.id(), "Initializing invoice counter and retrying once");
                    match self
                        .core
                        .ledger
                        .init_invoice_counter(FIRST_INVOICE_NUMBER)
                        .await
                    {
                        Ok(()) => {
                            records.push(ActionRecord::new(
                                self.id(),
                                "init_invoice_counter",
                                ActionOutcome::ok().with_message(format!(
                                    "invoice numbering starts at {FIRST_INVOICE_NUMBER}"
                                )),
                            ));
                            result = self.core.ledger.create_invoice(new.clone()).await;
                        }
                        Err(init_err) => {
                            records.push(ActionRecord::new(
                                self.id(),
                                "init_invoice_counter",
                                ActionOutcome::failed(init_err.to_string()),
                            ));
                        }
                    }
                }
                LedgerError::NotFound(_) | LedgerError::StaleReference(_) => {
                    if let ContactResolution::Found { id, .. } =
                        resolve_contact(ctx.delegator, self.id(), ctx.depth, &contact_name).await?
                    {
                        info!(
                            worker = %self.id(),
                            contact = %id,
                            "Re-resolved contact and retrying once"
                        );
                        new.contact_id = id;
                        result = self.core.ledger.create_invoice(new.clone()).await;
                    }
                }
                _ => {
                    if let Some(fixed) = corrected_date(err, &new.date, today) {
                        info!(
                            worker = %self.id(),
                            corrected = %fixed,
                            "Retrying invoice with normalized date"
                        );
                        new.date = fixed;
                        result = self.core.ledger.create_invoice(new.clone()).await;
                    }
                }
            }
        }

        match result {
            Ok(invoice) => {
                records.push(
                    ActionRecord::new(
                        self.id(),
                        "create_invoice",
                        ActionOutcome::ok()
                            .with_message(format!("invoice {} created", invoice.invoice_number))
                            .with_created(EntityKind::Invoice, invoice.id.clone())
                            .with_details(serde_json::json!({
                                "invoice_number": invoice.invoice_number,
                            }))
                            .with_completed(true),
                    )
                    .with_inputs(serde_json::to_value(&new)?)
                    .with_fingerprint(confirmed.fingerprint.clone()),
                );

                let mut lines = vec![format!(
                    "Invoice {} to {} for {} was created, due {}.",
                    invoice.invoice_number,
                    contact_name,
                    vat::format_nok(invoice.total_ore),
                    invoice.due_date.as_deref().unwrap_or(&invoice.date),
                )];

                let directive = attachment_directive(request, ctx.attachments);
                for ordinal in directive.ordinals {
                    let Some(file) = ctx.attachments.get(ordinal) else {
                        continue;
                    };
                    let target = AttachmentTarget::new(EntityKind::Invoice, invoice.id.clone());
                    let (record, failure) = self.core.upload_file(target, file, ordinal).await;
                    match failure {
                        Some(line) => lines.push(line),
                        None => lines.push(format!("Attached {}.", file.name)),
                    }
                    records.push(record);
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
            Err(err) => {
                records.push(
                    ActionRecord::new(
                        self.id(),
                        "create_invoice",
                        ActionOutcome::failed(err.to_string()),
                    )
                    .with_fingerprint(confirmed.fingerprint.clone()),
                );
                let mut reply = WorkerReply::text(translate_error(&err));
                reply.actions = records;
                Ok(reply)
            }
        }
    }

    /// A delete or cancel request: issued invoices are immutable, so propose
    /// the reversing credit note instead.
    async fn propose_reversal(
        &self,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let invoice_id = match resolve_invoice_ref(self.core.ledger.as_ref(), request).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Ok(WorkerReply::question(
                    "Which invoice should be reversed? Give its number, for example \"faktura 1003\".",
                ));
            }
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };

        let date = iso(today);
        let fingerprint =
            intent_fingerprint(EntityKind::CreditNote, &invoice_id, 0, &date, "full reversal");
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "Invoice {invoice_id} was already reversed by credit note {existing}."
            )));
        }

        let new = NewCreditNote {
            invoice_id: invoice_id.clone(),
            date,
            reason: request.task.trim().to_string(),
        };
        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_credit_note".into(),
            summary: format!(
                "Issued invoices cannot be deleted. I will instead create a credit note that \
                 reverses invoice {invoice_id} in full; the original stays in the ledger for \
                 the audit trail."
            ),
            inputs: serde_json::json!({ "credit_note": new }),
            fingerprint,
        }))
    }

    async fn run_create_credit_note(
        &self,
        confirmed: &ConfirmedAction,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut new: NewCreditNote =
            serde_json::from_value(confirmed.inputs["credit_note"].clone())?;

        let mut result = self.core.ledger.create_credit_note(new.clone()).await;
        if let Err(err) = &result
            && let Some(fixed) = corrected_date(err, &new.date, today)
        {
            info!(worker = %self.id(), corrected = %fixed, "Retrying credit note with normalized date");
            new.date = fixed;
            result = self.core.ledger.create_credit_note(new.clone()).await;
        }

        match result {
            Ok(note) => {
                let record = ActionRecord::new(
                    self.id(),
                    "create_credit_note",
                    ActionOutcome::ok()
                        .with_message(format!("credit note {} created", note.credit_note_number))
                        .with_created(EntityKind::CreditNote, note.id.clone())
                        .with_details(serde_json::json!({
                            "credit_note_number": note.credit_note_number,
                            "invoice_id": note.invoice_id,
                        }))
                        .with_completed(true),
                )
                .with_inputs(serde_json::to_value(&new)?)
                .with_fingerprint(confirmed.fingerprint.clone());
                Ok(WorkerReply::text(format!(
                    "Credit note {} reverses invoice {} in full ({}). The original invoice \
                     remains in the ledger for the audit trail.",
                    note.credit_note_number,
                    note.invoice_id,
                    vat::format_nok(note.total_ore),
                ))
                .with_action(record))
            }
            Err(err) => Ok(WorkerReply::text(translate_error(&err)).with_action(
                ActionRecord::new(
                    self.id(),
                    "create_credit_note",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }

    async fn propose_payment(
        &self,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let invoice_id = match resolve_invoice_ref(self.core.ledger.as_ref(), request).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Ok(WorkerReply::question(
                    "Which invoice was paid? Give its number, for example \"faktura 1003\".",
                ));
            }
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };

        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));
        let amount_ore = match crate::protocol::first_amount(&request.task) {
            Some(amount) => amount,
            None => {
                let invoices = match self.core.ledger.list_open_invoices().await {
                    Ok(invoices) => invoices,
                    Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
                };
                match invoices.iter().find(|i| i.id == invoice_id) {
                    Some(invoice) => invoice.total_ore,
                    None => {
                        return Ok(WorkerReply::question(format!(
                            "Invoice {invoice_id} does not seem to be open. \
                             Which invoice did you mean?"
                        )));
                    }
                }
            }
        };

        let fingerprint = intent_fingerprint(
            EntityKind::Payment,
            &invoice_id,
            amount_ore,
            &date,
            "invoice payment",
        );
        if duplicate_of(request, &fingerprint).is_some() {
            return Ok(WorkerReply::text(format!(
                "That payment on invoice {invoice_id} is already registered; nothing to do."
            )));
        }

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "register_invoice_payment".into(),
            summary: format!(
                "Register a payment of {} on invoice {invoice_id}, dated {date}.",
                vat::format_nok(amount_ore)
            ),
            inputs: serde_json::json!({
                "invoice_id": invoice_id,
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
        let invoice_id = confirmed.inputs["invoice_id"]
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
            .register_invoice_payment(&invoice_id, &date, amount_ore)
            .await;
        if let Err(err) = &result
            && let Some(fixed) = corrected_date(err, &date, today)
        {
            info!(worker = %self.id(), corrected = %fixed, "Retrying payment with normalized date");
            result = self
                .core
                .ledger
                .register_invoice_payment(&invoice_id, &fixed, amount_ore)
                .await;
            date = fixed;
        }

        match result {
            Ok(()) => {
                let record = ActionRecord::new(
                    self.id(),
                    "register_invoice_payment",
                    ActionOutcome::ok()
                        .with_message(format!("payment registered on {invoice_id}"))
                        .with_completed(true),
                )
                .with_inputs(confirmed.inputs.clone())
                .with_fingerprint(confirmed.fingerprint.clone());
                Ok(WorkerReply::text(format!(
                    "Registered {} on invoice {invoice_id}, dated {date}.",
                    vat::format_nok(amount_ore)
                ))
                .with_action(record))
            }
            Err(err) => Ok(WorkerReply::text(translate_error(&err)).with_action(
                ActionRecord::new(
                    self.id(),
                    "register_invoice_payment",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }

    /// Open invoices are a pure read; no confirmation involved.
    async fn list_open(&self) -> Result<WorkerReply> {
        let invoices = match self.core.ledger.list_open_invoices().await {
            Ok(invoices) => invoices,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let record = ActionRecord::new(
            self.id(),
            "list_open_invoices",
            ActionOutcome::ok()
                .with_message(format!("{} open invoice(s)", invoices.len()))
                .with_details(serde_json::json!({ "count": invoices.len() })),
        );
        if invoices.is_empty() {
            return Ok(WorkerReply::text("There are no open invoices right now.").with_action(record));
        }
        let mut lines = vec![format!("There are {} open invoice(s):", invoices.len())];
        for invoice in &invoices {
            lines.push(format!(
                "- Invoice {}: {}, dated {}",
                invoice.invoice_number,
                vat::format_nok(invoice.total_ore),
                invoice.date,
            ));
        }
        Ok(WorkerReply::text(lines.join("\n")).with_action(record))
    }

    /// Attach staged files to an existing invoice without creating anything.
    async fn propose_upload(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        directive: &AttachmentDirective,
    ) -> Result<WorkerReply> {
        let invoice_id = match resolve_invoice_ref(self.core.ledger.as_ref(), request).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Ok(WorkerReply::question(
                    "Which invoice should the file be attached to? Give its number, \
                     for example \"faktura 1003\".",
                ));
            }
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        if directive.ordinals.is_empty() {
            return Ok(WorkerReply::text("There is no staged file to attach."));
        }
        let names: Vec<String> = directive
            .ordinals
            .iter()
            .filter_map(|&ordinal| ctx.attachments.get(ordinal))
            .map(|file| file.name.clone())
            .collect();
        let fingerprint = intent_fingerprint(
            EntityKind::Attachment,
            &invoice_id,
            directive.ordinals.len() as i64,
            "",
            &names.join(" "),
        );
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "Those files are already attached to invoice {invoice_id} (attachment {existing})."
            )));
        }
        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "upload_attachments".into(),
            summary: format!("Attach {} to invoice {invoice_id}.", names.join(", ")),
            inputs: serde_json::json!({
                "target_id": invoice_id,
                "ordinals": directive.ordinals,
            }),
            fingerprint,
        }))
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
            let target = AttachmentTarget::new(EntityKind::Invoice, target_id.clone());
            let (record, failure) = self.core.upload_file(target, file, ordinal).await;
            match failure {
                Some(line) => lines.push(line),
                None => lines.push(format!("Attached {} to invoice {target_id}.", file.name)),
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
impl Worker for SalesWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[
            WorkerCapability::SalesDocuments,
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
            "Handling sales delegation"
        );
        self.core.claim()?;
        let result = self.execute(request, ctx, today_from(request)).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(SALES_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{StubDelegator, contact_found, contact_missing};
    use munin_common::{AttachmentSet, NullDelegator, ParticipantId};
    use munin_ledger::{ContactKind, InMemoryLedger};

    const TODAY: &str = "2026-08-25";

    fn request(task: &str) -> DelegationRequest {
        DelegationRequest::new(ParticipantId::Coordinator, WorkerId::Sales, task)
            .unwrap()
            .with_context(serde_json::json!({ "today": TODAY }))
    }

    fn confirm(pending: &ProposedAction) -> DelegationRequest {
        DelegationRequest::new(ParticipantId::Coordinator, WorkerId::Sales, "yes")
            .unwrap()
            .with_context(serde_json::json!({
                "today": TODAY,
                "confirmed": {
                    "action": pending.action,
                    "inputs": pending.inputs,
                    "fingerprint": pending.fingerprint,
                },
            }))
    }

    #[test]
    fn test_determine_task_orders_reversal_before_payment() {
        assert_eq!(
            determine_task("slett fakturaen som kunden har betalt"),
            SalesTask::ReverseInvoice
        );
        assert_eq!(
            determine_task("registrer betaling på faktura 1003"),
            SalesTask::RegisterPayment
        );
        assert_eq!(
            determine_task("vis ubetalte fakturaer"),
            SalesTask::ListOpen
        );
        assert_eq!(
            determine_task("fakturer 5 000 kr til Kari"),
            SalesTask::CreateInvoice
        );
    }

    #[test]
    fn test_extract_counterparty_stops_at_filler_and_amounts() {
        let scan = scan_amounts("fakturer 5 000 kr til Kari Nordmann for konsulenttimer");
        let (name, _) = extract_counterparty(&scan).unwrap();
        assert_eq!(name, "Kari Nordmann");

        let scan = scan_amounts("fakturer til Nordmann Bygg AS 12 000 kr");
        let (name, _) = extract_counterparty(&scan).unwrap();
        assert_eq!(name, "Nordmann Bygg AS");
    }

    #[tokio::test]
    async fn test_invoice_without_treatment_asks_one_question() {
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let ctx = WorkerContext::new(&attachments, &NullDelegator, 0);

        let reply = worker
            .handle(
                &request("fakturer 5 000 kr til Kari Nordmann for konsulenttimer"),
                &ctx,
            )
            .await
            .unwrap();

        assert!(reply.needs_input);
        assert!(reply.pending.is_none());
        assert!(reply.text.contains("inkl. mva"));
        assert_eq!(ledger.created_count(EntityKind::Invoice), 0);
    }

    #[tokio::test]
    async fn test_invoice_proposed_after_contact_resolution() {
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let delegator = StubDelegator::new(vec![contact_found("c-1", "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let reply = worker
            .handle(
                &request("fakturer 5 000 kr eks. mva til Kari for konsulenttimer"),
                &ctx,
            )
            .await
            .unwrap();

        let pending = reply.pending.expect("should propose the invoice");
        assert_eq!(pending.action, "create_invoice");
        assert_eq!(pending.inputs["invoice"]["contact_id"], "c-1");
        assert_eq!(pending.inputs["invoice"]["lines"][0]["unit_price_ore"], 500_000);
        assert_eq!(pending.inputs["invoice"]["due_date"], "2026-09-08");
        assert!(pending.summary.contains("Kari Nordmann AS"));

        let delegated = delegator.requests.lock().unwrap();
        assert_eq!(delegated.len(), 1);
        assert_eq!(
            delegated[0].origin,
            ParticipantId::Worker(WorkerId::Sales)
        );
        assert_eq!(delegated[0].target, WorkerId::Contacts);
        assert_eq!(delegated[0].depth, 1);
    }

    #[tokio::test]
    async fn test_unknown_customer_question_is_passed_on() {
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let delegator = StubDelegator::new(vec![contact_missing("Ukjent Kunde")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let reply = worker
            .handle(
                &request("fakturer 5 000 kr inkl. mva til Ukjent Kunde for varer"),
                &ctx,
            )
            .await
            .unwrap();

        assert!(reply.needs_input);
        assert!(reply.pending.is_none());
        assert!(reply.text.contains("register them as a new contact"));
        assert_eq!(ledger.created_count(EntityKind::Invoice), 0);
    }

    #[tokio::test]
    async fn test_uninitialized_counter_initialized_and_retried_once() {
        let ledger = Arc::new(InMemoryLedger::with_uninitialized_counter());
        ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let delegator = StubDelegator::new(vec![contact_found("c-1", "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let reply = worker
            .handle(
                &request("fakturer 5 000 kr eks. mva til Kari for konsulenttimer"),
                &ctx,
            )
            .await
            .unwrap();
        let pending = reply.pending.unwrap();

        let confirm_ctx = WorkerContext::new(&attachments, &NullDelegator, 0);
        let reply = worker.handle(&confirm(&pending), &confirm_ctx).await.unwrap();

        assert_eq!(ledger.call_count("create_invoice"), 2);
        assert_eq!(ledger.call_count("init_invoice_counter"), 1);
        assert_eq!(ledger.created_count(EntityKind::Invoice), 1);
        assert!(reply.text.contains("Invoice 1000"));
        assert!(reply.actions.iter().any(|r| r.action == "init_invoice_counter"));
    }

    #[tokio::test]
    async fn test_stale_contact_reresolved_on_confirm() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let delegator =
            StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let pending = worker
            .handle(
                &request("fakturer 5 000 kr eks. mva til Kari for konsulenttimer"),
                &ctx,
            )
            .await
            .unwrap()
            .pending
            .unwrap();

        ledger.queue_failure(LedgerError::StaleReference("contact c-1 is gone".into()));
        let retry_delegator =
            StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let confirm_ctx = WorkerContext::new(&attachments, &retry_delegator, 0);
        worker.handle(&confirm(&pending), &confirm_ctx).await.unwrap();

        assert_eq!(ledger.call_count("create_invoice"), 2);
        assert_eq!(ledger.created_count(EntityKind::Invoice), 1);
    }

    #[tokio::test]
    async fn test_delete_request_becomes_credit_note() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let invoice = ledger.seed_open_invoice(&contact.id, "2026-08-20", 250_000);
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let ctx = WorkerContext::new(&attachments, &NullDelegator, 0);

        let reply = worker
            .handle(&request("slett faktura 1000"), &ctx)
            .await
            .unwrap();
        let pending = reply.pending.expect("reversal should need confirmation");
        assert_eq!(pending.action, "create_credit_note");
        assert!(reply.text.contains("cannot be deleted"));

        let reply = worker.handle(&confirm(&pending), &ctx).await.unwrap();
        assert_eq!(ledger.created_count(EntityKind::CreditNote), 1);
        assert!(ledger.invoice(&invoice.id).is_some());
        assert!(reply.text.contains("audit trail"));
    }

    #[tokio::test]
    async fn test_payment_registered_on_confirm() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let invoice = ledger.seed_open_invoice(&contact.id, "2026-08-20", 250_000);
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let ctx = WorkerContext::new(&attachments, &NullDelegator, 0);

        let reply = worker
            .handle(&request("registrer betaling på faktura 1000"), &ctx)
            .await
            .unwrap();
        let pending = reply.pending.unwrap();
        assert_eq!(pending.inputs["amount_ore"], 250_000);
        assert!(!ledger.invoice(&invoice.id).unwrap().paid);

        worker.handle(&confirm(&pending), &ctx).await.unwrap();
        assert!(ledger.invoice(&invoice.id).unwrap().paid);
    }

    #[tokio::test]
    async fn test_list_open_invoices_is_read_only() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        ledger.seed_open_invoice(&contact.id, "2026-08-10", 100_000);
        ledger.seed_open_invoice(&contact.id, "2026-08-20", 250_000);
        let worker = SalesWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let ctx = WorkerContext::new(&attachments, &NullDelegator, 0);

        let reply = worker
            .handle(&request("vis ubetalte fakturaer"), &ctx)
            .await
            .unwrap();

        assert!(reply.pending.is_none());
        assert!(reply.text.contains("Invoice 1000"));
        assert!(reply.text.contains("Invoice 1001"));
        assert_eq!(ledger.created_count(EntityKind::Invoice), 0);
        assert_eq!(ledger.call_count("list_open_invoices"), 1);
    }
}
