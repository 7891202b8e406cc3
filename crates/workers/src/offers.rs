//! The offers worker: quotations, and their conversion into invoices.
//!
//! An accepted offer is not invoiced here. The worker rebuilds the invoice
//! from the offer's lines, gets the user's confirmation, then hands the
//! confirmed creation to the sales worker over the delegation channel so
//! invoice numbering and its corrective retries stay in one place.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use munin_common::vat::{self, VatRate, VatTreatment};
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ParticipantId, ProposedAction,
    Result, Worker, WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply,
    intent_fingerprint,
};
use munin_ledger::{DocumentLine, Ledger, LedgerError, LedgerResult, NewInvoice, NewOffer, Offer};
use munin_llm::LlmClient;
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    ConfirmedAction, ContactResolution, WorkerCore, confirmed_action, corrected_date,
    duplicate_of, extract_counterparty, find_date, find_entity_ref, find_numbered_reference, iso,
    known_entity, leftover_description, resolve_contact, scan_amounts, today_from,
    translate_error,
};

const OFFERS_SYSTEM_PROMPT: &str = r#"You are the quotation specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. Draft offers to verified customers with the correct VAT band
2. Turn accepted offers into invoices by handing them to the sales specialist
3. Answer questions about offers you have drafted

Keep replies short and concrete. Never invent amounts, dates or identifiers. Propose every ledger change and wait for confirmation."#;

const OFFER_FILLER: &[&str] = &[
    "tilbud", "tilbudet", "lag", "opprett", "send", "gi", "ny", "nytt", "et", "en", "offer",
    "quote", "quotation", "create", "draft", "please", "for", "på", "gjelder", "om",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferTask {
    CreateOffer,
    ConvertToInvoice,
}

fn determine_task(task: &str) -> OfferTask {
    let lowered = task.to_lowercase();
    const CONVERT: [&str; 6] = [
        "til faktura",
        "lag faktura",
        "aksepter",
        "accept",
        "konverter",
        "convert",
    ];
    if CONVERT.iter().any(|k| lowered.contains(k)) {
        OfferTask::ConvertToInvoice
    } else {
        OfferTask::CreateOffer
    }
}

/// Domain specialist for quotations.
pub struct OffersWorker {
    core: WorkerCore,
}

impl OffersWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Offers, "Offers Worker"),
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
        match determine_task(&request.task) {
            OfferTask::ConvertToInvoice => self.propose_convert(request, ctx, today).await,
            OfferTask::CreateOffer => self.propose_offer(request, ctx, today).await,
        }
    }

    /// The offer named in the task, by id, by offer number, or as the most
    /// recently discussed one.
    async fn resolve_offer_ref(&self, request: &DelegationRequest) -> LedgerResult<Option<Offer>> {
        let offers = self.core.ledger.list_offers().await?;
        if let Some(id) = find_entity_ref(&request.task, "o") {
            return Ok(offers.into_iter().find(|o| o.id == id));
        }
        if let Some(number) =
            find_numbered_reference(&request.task, &["tilbud", "tilbudet", "offer"])
        {
            return Ok(offers.into_iter().find(|o| o.offer_number == number));
        }
        if let Some(id) = known_entity(request, EntityKind::Offer) {
            return Ok(offers.into_iter().find(|o| o.id == id));
        }
        Ok(None)
    }

    async fn propose_offer(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut scan = scan_amounts(&request.task);
        let Some(stated) = scan.amounts.first().copied() else {
            return Ok(WorkerReply::question(
                "What amount should the offer be for? Please include it, for example \"12 500 kr\".",
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
                "Who should the offer go to? Give the customer's name.",
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

        let mut description = leftover_description(&scan, OFFER_FILLER);
        if description.is_empty() {
            description = "Varer og tjenester".into();
        }
        let rate = VatRate::infer(&description);
        let (unit_price_ore, gross_ore) = match treatment {
            VatTreatment::Exclusive => (stated, vat::gross_from_net(stated, rate)),
            VatTreatment::Inclusive => (vat::net_from_gross(stated, rate), stated),
        };
        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));

        let fingerprint =
            intent_fingerprint(EntityKind::Offer, &contact_id, gross_ore, &date, &description);
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That offer already exists as {existing}; I have not created it again."
            )));
        }

        let new = NewOffer {
            contact_id,
            date: date.clone(),
            lines: vec![DocumentLine {
                description: description.clone(),
                quantity: 1,
                unit_price_ore,
                vat_rate: rate,
            }],
        };

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_offer".into(),
            summary: format!(
                "Offer to {contact_name}: {description}, {} including {}% VAT, dated {date}.",
                vat::format_nok(gross_ore),
                rate.percent(),
            ),
            inputs: serde_json::json!({
                "offer": new,
                "contact_name": contact_name,
            }),
            fingerprint,
        }))
    }

    async fn propose_convert(
        &self,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let offer = match self.resolve_offer_ref(request).await {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                return Ok(WorkerReply::question(
                    "Which offer should become an invoice? Give its number, \
                     for example \"tilbud 102\".",
                ));
            }
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        if offer.lines.is_empty() {
            return Ok(WorkerReply::text(format!(
                "Offer {} does not carry its line details, so I cannot turn it into an \
                 invoice automatically. Please state the invoice amount and customer instead.",
                offer.offer_number
            )));
        }

        let date = iso(today);
        let due_date = iso(today + Days::new(14));
        let fingerprint = intent_fingerprint(
            EntityKind::Invoice,
            &offer.contact_id,
            offer.total_ore,
            &date,
            &format!("offer {}", offer.offer_number),
        );
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "Offer {} was already invoiced as {existing}; I have not created it again.",
                offer.offer_number
            )));
        }

        let contact_name =
            match resolve_contact(ctx.delegator, self.id(), ctx.depth, &offer.contact_id).await? {
                ContactResolution::Found { name, .. } => name,
                _ => String::new(),
            };
        let customer = if contact_name.is_empty() {
            "the offer's customer".to_string()
        } else {
            contact_name.clone()
        };

        let new = NewInvoice {
            contact_id: offer.contact_id.clone(),
            date: date.clone(),
            due_date: Some(due_date.clone()),
            lines: offer.lines.clone(),
        };

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "convert_offer".into(),
            summary: format!(
                "Create an invoice from offer {}: {} to {customer}, dated {date}, due {due_date}.",
                offer.offer_number,
                vat::format_nok(offer.total_ore),
            ),
            inputs: serde_json::json!({
                "invoice": new,
                "contact_name": contact_name,
                "offer_id": offer.id,
                "offer_number": offer.offer_number,
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
            "create_offer" => self.run_create_offer(&confirmed, request, ctx, today).await,
            "convert_offer" => self.run_convert(&confirmed, request, ctx).await,
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
    }

    async fn run_create_offer(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut new: NewOffer = serde_json::from_value(confirmed.inputs["offer"].clone())?;
        let contact_name = confirmed.inputs["contact_name"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if let Some(existing) = duplicate_of(request, &confirmed.fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That offer already exists as {existing}; I have not created it again."
            )));
        }

        let mut result = self.core.ledger.create_offer(new.clone()).await;
        if let Err(err) = &result {
            match err {
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
                        result = self.core.ledger.create_offer(new.clone()).await;
                    }
                }
                _ => {
                    if let Some(fixed) = corrected_date(err, &new.date, today) {
                        info!(
                            worker = %self.id(),
                            corrected = %fixed,
                            "Retrying offer with normalized date"
                        );
                        new.date = fixed;
                        result = self.core.ledger.create_offer(new.clone()).await;
                    }
                }
            }
        }

        match result {
            Ok(offer) => {
                let record = ActionRecord::new(
                    self.id(),
                    "create_offer",
                    ActionOutcome::ok()
                        .with_message(format!("offer {} created", offer.offer_number))
                        .with_created(EntityKind::Offer, offer.id.clone())
                        .with_details(serde_json::json!({ "offer_number": offer.offer_number }))
                        .with_completed(true),
                )
                .with_inputs(serde_json::to_value(&new)?)
                .with_fingerprint(confirmed.fingerprint.clone());
                let template = format!(
                    "Offer {} to {} for {} was created.",
                    offer.offer_number,
                    contact_name,
                    vat::format_nok(offer.total_ore),
                );
                let text = self
                    .core
                    .enhance_with_llm(&template, &request.task, self.system_prompt())
                    .await;
                Ok(WorkerReply::text(text).with_action(record))
            }
            Err(err) => Ok(WorkerReply::text(translate_error(&err)).with_action(
                ActionRecord::new(
                    self.id(),
                    "create_offer",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }

    /// The confirmed conversion is executed by the sales worker; the
    /// confirmation gathered here travels along in the delegation context.
    async fn run_convert(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
        ctx: &WorkerContext<'_>,
    ) -> Result<WorkerReply> {
        if let Some(existing) = duplicate_of(request, &confirmed.fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That offer was already invoiced as {existing}; I have not created it again."
            )));
        }
        let offer_id = confirmed.inputs["offer_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let handoff = DelegationRequest::new(
            ParticipantId::Worker(self.id()),
            WorkerId::Sales,
            format!("create the invoice for offer {offer_id}"),
        )?
        .with_depth(ctx.depth + 1)
        .with_context(serde_json::json!({
            "today": request.context["today"],
            "confirmed": {
                "action": "create_invoice",
                "inputs": {
                    "invoice": confirmed.inputs["invoice"],
                    "contact_name": confirmed.inputs["contact_name"],
                },
                "fingerprint": confirmed.fingerprint,
            },
        }));
        info!(worker = %self.id(), offer = %offer_id, "Handing accepted offer to sales");

        let response = ctx.delegator.delegate(handoff).await;
        if !response.success {
            return Ok(WorkerReply::text(
                "The sales specialist is not reachable right now, so the invoice was not \
                 created. Please try again in a moment.",
            ));
        }
        let Some(mut reply) = response.reply else {
            return Ok(WorkerReply::text(
                "The sales specialist is not reachable right now, so the invoice was not \
                 created. Please try again in a moment.",
            ));
        };
        reply.text = format!("Offer accepted. {}", reply.text);
        Ok(reply)
    }
}

#[async_trait]
impl Worker for OffersWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[WorkerCapability::Quotations]
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
            "Handling offers delegation"
        );
        self.core.claim()?;
        let result = self.execute(request, ctx, today_from(request)).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(OFFERS_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{StubDelegator, contact_found, contact_missing};
    use crate::sales::SalesWorker;
    use munin_common::{AttachmentSet, DelegationResponse, Delegator, NullDelegator};
    use munin_ledger::{ContactKind, InMemoryLedger};

    const TODAY: &str = "2026-08-25";

    fn request(task: &str) -> DelegationRequest {
        DelegationRequest::new(ParticipantId::Coordinator, WorkerId::Offers, task)
            .unwrap()
            .with_context(serde_json::json!({ "today": TODAY }))
    }

    fn confirm(pending: &ProposedAction) -> DelegationRequest {
        DelegationRequest::new(ParticipantId::Coordinator, WorkerId::Offers, "yes")
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

    /// Routes every delegation straight into a real sales worker, so the
    /// conversion handoff can be exercised end to end.
    struct DirectToSales {
        sales: SalesWorker,
        attachments: AttachmentSet,
    }

    #[async_trait]
    impl Delegator for DirectToSales {
        async fn delegate(&self, request: DelegationRequest) -> DelegationResponse {
            let ctx = WorkerContext::new(&self.attachments, &NullDelegator, request.depth);
            match self.sales.handle(&request, &ctx).await {
                Ok(reply) => DelegationResponse::ok(request.target, reply),
                Err(err) => DelegationResponse::failed(request.target, err.to_string()),
            }
        }
    }

    #[test]
    fn test_determine_task_variants() {
        assert_eq!(
            determine_task("lag et tilbud til Kari på 12 500 kr"),
            OfferTask::CreateOffer
        );
        assert_eq!(determine_task("aksepter tilbud 100"), OfferTask::ConvertToInvoice);
        assert_eq!(
            determine_task("gjør om tilbudet til faktura"),
            OfferTask::ConvertToInvoice
        );
    }

    #[tokio::test]
    async fn test_offer_without_amount_asks() {
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = OffersWorker::with_default_config(ledger);
        let attachments = AttachmentSet::new();
        let ctx = WorkerContext::new(&attachments, &NullDelegator, 0);

        let reply = worker
            .handle(&request("lag et tilbud til Kari Nordmann"), &ctx)
            .await
            .unwrap();

        assert!(reply.needs_input);
        assert!(reply.pending.is_none());
        assert!(reply.text.contains("amount"));
    }

    #[tokio::test]
    async fn test_offer_proposed_and_created() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let worker = OffersWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();
        let delegator = StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let reply = worker
            .handle(
                &request("lag et tilbud til Kari på 12 500 kr eks. mva for konsulentbistand"),
                &ctx,
            )
            .await
            .unwrap();
        let pending = reply.pending.expect("offer should need confirmation");
        assert_eq!(pending.action, "create_offer");
        assert_eq!(pending.inputs["offer"]["lines"][0]["unit_price_ore"], 1_250_000);
        assert!(pending.summary.contains("Kari Nordmann AS"));
        assert_eq!(ledger.created_count(EntityKind::Offer), 0);

        let confirm_ctx = WorkerContext::new(&attachments, &NullDelegator, 0);
        let reply = worker.handle(&confirm(&pending), &confirm_ctx).await.unwrap();
        assert_eq!(ledger.created_count(EntityKind::Offer), 1);
        assert!(reply.text.contains("Offer 100"));
        assert_eq!(reply.actions[0].outcome.details["offer_number"], 100);
    }

    #[tokio::test]
    async fn test_unknown_customer_question_is_passed_on() {
        let ledger = Arc::new(InMemoryLedger::new());
        let worker = OffersWorker::with_default_config(ledger);
        let attachments = AttachmentSet::new();
        let delegator = StubDelegator::new(vec![contact_missing("Ukjent Kunde")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);

        let reply = worker
            .handle(
                &request("lag et tilbud til Ukjent Kunde på 8 000 kr inkl. mva"),
                &ctx,
            )
            .await
            .unwrap();

        assert!(reply.needs_input);
        assert!(reply.pending.is_none());
        assert!(reply.text.contains("register them as a new contact"));
    }

    #[tokio::test]
    async fn test_accepted_offer_is_invoiced_through_sales() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let worker = OffersWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();

        // Draft and confirm the offer first.
        let delegator = StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);
        let pending = worker
            .handle(
                &request("lag et tilbud til Kari på 12 500 kr eks. mva for konsulentbistand"),
                &ctx,
            )
            .await
            .unwrap()
            .pending
            .unwrap();
        worker.handle(&confirm(&pending), &ctx).await.unwrap();
        assert_eq!(ledger.created_count(EntityKind::Offer), 1);

        // Accepting it proposes the invoice conversion.
        let delegator = StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);
        let reply = worker
            .handle(&request("aksepter tilbud 100 og lag faktura"), &ctx)
            .await
            .unwrap();
        let pending = reply.pending.expect("conversion should need confirmation");
        assert_eq!(pending.action, "convert_offer");
        assert_eq!(pending.inputs["invoice"]["lines"][0]["unit_price_ore"], 1_250_000);
        assert!(pending.summary.contains("offer 100"));
        assert_eq!(ledger.created_count(EntityKind::Invoice), 0);

        // Confirming hands the creation to a real sales worker.
        let direct = DirectToSales {
            sales: SalesWorker::with_default_config(ledger.clone()),
            attachments: AttachmentSet::new(),
        };
        let confirm_ctx = WorkerContext::new(&attachments, &direct, 0);
        let reply = worker.handle(&confirm(&pending), &confirm_ctx).await.unwrap();

        assert_eq!(ledger.created_count(EntityKind::Invoice), 1);
        assert!(reply.text.starts_with("Offer accepted."));
        assert!(reply.text.contains("Invoice 1000"));
        assert!(
            reply
                .actions
                .iter()
                .any(|r| r.action == "create_invoice" && r.outcome.success)
        );
    }

    #[tokio::test]
    async fn test_converted_offer_is_not_invoiced_twice() {
        let ledger = Arc::new(InMemoryLedger::new());
        let contact = ledger.seed_contact("Kari Nordmann AS", ContactKind::Customer);
        let worker = OffersWorker::with_default_config(ledger.clone());
        let attachments = AttachmentSet::new();

        let delegator = StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);
        let pending = worker
            .handle(
                &request("lag et tilbud til Kari på 12 500 kr eks. mva for konsulentbistand"),
                &ctx,
            )
            .await
            .unwrap()
            .pending
            .unwrap();
        worker.handle(&confirm(&pending), &ctx).await.unwrap();

        let delegator = StubDelegator::new(vec![contact_found(&contact.id, "Kari Nordmann AS")]);
        let ctx = WorkerContext::new(&attachments, &delegator, 0);
        let pending = worker
            .handle(&request("aksepter tilbud 100"), &ctx)
            .await
            .unwrap()
            .pending
            .unwrap();

        let fingerprint = pending.fingerprint.clone();
        let repeat = request("aksepter tilbud 100").with_context(serde_json::json!({
            "today": TODAY,
            "fingerprints": { fingerprint: "inv-9" },
        }));
        let quiet = StubDelegator::new(vec![]);
        let ctx = WorkerContext::new(&attachments, &quiet, 0);
        let reply = worker.handle(&repeat, &ctx).await.unwrap();

        assert!(reply.pending.is_none());
        assert!(reply.text.contains("inv-9"));
        assert_eq!(ledger.created_count(EntityKind::Invoice), 0);
    }
}
