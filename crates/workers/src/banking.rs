//! The banking worker: bank transaction listings and payment matching.
//!
//! Matching is deliberately conservative. A transaction is a candidate only
//! when it is an inflow within ±2.00 kr of the expected amount; one candidate
//! becomes a confirmation question, several become a selection question, and
//! none becomes the paid-outside-or-still-unpaid question.

use async_trait::async_trait;
use chrono::NaiveDate;
use munin_common::vat;
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ProposedAction, Result, Worker,
    WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply, intent_fingerprint,
};
use munin_ledger::{BankTransaction, Invoice, Ledger, LedgerResult};
use munin_llm::LlmClient;
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    ConfirmedAction, WorkerCore, confirmed_action, corrected_date, duplicate_of, find_date,
    find_entity_ref, find_numbered_reference, first_amount, iso, known_entity, today_from,
    translate_error,
};

const BANKING_SYSTEM_PROMPT: &str = r#"You are the banking specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. List bank transactions on request
2. Match incoming transactions against open invoices within a strict tolerance
3. Register matched payments only after the user confirms the match

Keep replies short and concrete. Never guess which transaction belongs to which invoice; when in doubt, ask."#;

/// Matching tolerance, in øre (±2.00 kr).
const TOLERANCE_ORE: i64 = 200;

/// At most this many candidates are listed in a selection question.
const MAX_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BankingTask {
    MatchPayment,
    ListTransactions,
    /// User answered the zero-candidate question: still unpaid
    StillUnpaid,
    /// User answered the zero-candidate question: settled outside the bank
    PaidOutside,
}

fn determine_task(task: &str) -> BankingTask {
    let lowered = task.to_lowercase();
    const UNPAID: [&str; 4] = ["ubetalt", "ikke betalt", "unpaid", "fortsatt åpen"];
    const OUTSIDE: [&str; 5] = [
        "betalt utenfor",
        "utenom bank",
        "kontant",
        "paid outside",
        "cash",
    ];
    const LIST: [&str; 5] = [
        "transaksjon",
        "bevegelser",
        "kontoutskrift",
        "bank transactions",
        "vis bank",
    ];
    if UNPAID.iter().any(|k| lowered.contains(k)) {
        BankingTask::StillUnpaid
    } else if OUTSIDE.iter().any(|k| lowered.contains(k)) {
        BankingTask::PaidOutside
    } else if LIST.iter().any(|k| lowered.contains(k)) {
        BankingTask::ListTransactions
    } else {
        BankingTask::MatchPayment
    }
}

/// Domain specialist for bank reconciliation.
pub struct BankingWorker {
    core: WorkerCore,
}

impl BankingWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Banking, "Banking Worker"),
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
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        if let Some(confirmed) = confirmed_action(request) {
            return self.run_confirmed(confirmed, today).await;
        }
        match determine_task(&request.task) {
            BankingTask::StillUnpaid => Ok(WorkerReply::text(
                "Understood. The invoice stays open and no payment was registered.",
            )),
            BankingTask::PaidOutside => self.propose_outside_payment(request, today).await,
            BankingTask::ListTransactions => self.list_transactions().await,
            BankingTask::MatchPayment => self.match_payment(request).await,
        }
    }

    /// The open invoice named in the task, by id, by invoice number, or as
    /// the most recently discussed one.
    async fn resolve_open_invoice(
        &self,
        request: &DelegationRequest,
    ) -> LedgerResult<Option<Invoice>> {
        let invoices = self.core.ledger.list_open_invoices().await?;
        if let Some(id) = find_entity_ref(&request.task, "inv") {
            return Ok(invoices.into_iter().find(|i| i.id == id));
        }
        if let Some(number) =
            find_numbered_reference(&request.task, &["faktura", "fakturanr", "invoice"])
        {
            return Ok(invoices.into_iter().find(|i| i.invoice_number == number));
        }
        if let Some(id) = known_entity(request, EntityKind::Invoice) {
            return Ok(invoices.into_iter().find(|i| i.id == id));
        }
        Ok(None)
    }

    async fn match_payment(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        let invoice = match self.resolve_open_invoice(request).await {
            Ok(invoice) => invoice,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let expected = match &invoice {
            Some(invoice) => invoice.total_ore,
            None => match first_amount(&request.task) {
                Some(amount) => amount,
                None => {
                    return Ok(WorkerReply::question(
                        "Which invoice or amount should I look for? Give an invoice number \
                         or an amount, for example \"faktura 1003\" or \"12 500 kr\".",
                    ));
                }
            },
        };

        let transactions = match self.core.ledger.list_transactions().await {
            Ok(transactions) => transactions,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let candidates: Vec<&BankTransaction> = transactions
            .iter()
            .filter(|tx| {
                tx.amount_ore > 0 && (tx.amount_ore - expected).abs() <= TOLERANCE_ORE
            })
            .collect();

        let record = ActionRecord::new(
            self.id(),
            "match_bank_transactions",
            ActionOutcome::ok()
                .with_message(format!(
                    "{} candidate(s) near {}",
                    candidates.len(),
                    vat::format_nok(expected),
                ))
                .with_details(serde_json::json!({
                    "candidates": candidates.len(),
                    "expected_ore": expected,
                })),
        );

        match (&invoice, candidates.as_slice()) {
            (Some(invoice), []) => Ok(WorkerReply::question(format!(
                "I found no bank transaction near {}. Has invoice {} been paid outside \
                 the bank account, or is it still unpaid?",
                vat::format_nok(expected),
                invoice.invoice_number,
            ))
            .with_action(record)),
            (Some(invoice), [tx]) => {
                let fingerprint = intent_fingerprint(
                    EntityKind::Payment,
                    &invoice.id,
                    tx.amount_ore,
                    &tx.date,
                    &tx.description,
                );
                if duplicate_of(request, &fingerprint).is_some() {
                    return Ok(WorkerReply::text(format!(
                        "That payment on invoice {} is already registered; nothing to do.",
                        invoice.invoice_number
                    ))
                    .with_action(record));
                }
                Ok(WorkerReply::proposal(ProposedAction {
                    worker: self.id(),
                    action: "register_invoice_payment".into(),
                    summary: format!(
                        "The bank transaction on {} of {} (\"{}\") matches invoice {}. \
                         I will register it as the payment.",
                        tx.date,
                        vat::format_nok(tx.amount_ore),
                        tx.description,
                        invoice.invoice_number,
                    ),
                    inputs: serde_json::json!({
                        "invoice_id": invoice.id,
                        "date": tx.date,
                        "amount_ore": tx.amount_ore,
                        "transaction_id": tx.id,
                    }),
                    fingerprint,
                })
                .with_action(record))
            }
            (Some(invoice), many) => {
                let mut lines = vec![format!(
                    "Several bank transactions are close to {} for invoice {}:",
                    vat::format_nok(expected),
                    invoice.invoice_number,
                )];
                for tx in many.iter().take(MAX_CANDIDATES) {
                    lines.push(format!(
                        "- {}: {} ({})",
                        tx.date,
                        vat::format_nok(tx.amount_ore),
                        tx.description,
                    ));
                }
                lines.push("Which of these is the payment?".into());
                Ok(WorkerReply::question(lines.join("\n")).with_action(record))
            }
            (None, []) => Ok(WorkerReply::text(format!(
                "I found no bank transaction near {}.",
                vat::format_nok(expected)
            ))
            .with_action(record)),
            (None, found) => {
                let mut lines = vec![format!(
                    "{} bank transaction(s) near {}:",
                    found.len(),
                    vat::format_nok(expected),
                )];
                for tx in found.iter().take(MAX_CANDIDATES) {
                    lines.push(format!(
                        "- {}: {} ({})",
                        tx.date,
                        vat::format_nok(tx.amount_ore),
                        tx.description,
                    ));
                }
                Ok(WorkerReply::text(lines.join("\n")).with_action(record))
            }
        }
    }

    /// The user told us the invoice was settled outside the bank account.
    async fn propose_outside_payment(
        &self,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let invoice = match self.resolve_open_invoice(request).await {
            Ok(Some(invoice)) => invoice,
            Ok(None) => {
                return Ok(WorkerReply::question(
                    "Which invoice was paid outside the bank? Give its number, \
                     for example \"faktura 1003\".",
                ));
            }
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));
        let fingerprint = intent_fingerprint(
            EntityKind::Payment,
            &invoice.id,
            invoice.total_ore,
            &date,
            "paid outside bank",
        );
        if duplicate_of(request, &fingerprint).is_some() {
            return Ok(WorkerReply::text(format!(
                "Invoice {} is already registered as paid; nothing to do.",
                invoice.invoice_number
            )));
        }
        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "register_invoice_payment".into(),
            summary: format!(
                "Register invoice {} as paid outside the bank account: {}, dated {date}.",
                invoice.invoice_number,
                vat::format_nok(invoice.total_ore),
            ),
            inputs: serde_json::json!({
                "invoice_id": invoice.id,
                "date": date,
                "amount_ore": invoice.total_ore,
            }),
            fingerprint,
        }))
    }

    async fn list_transactions(&self) -> Result<WorkerReply> {
        let transactions = match self.core.ledger.list_transactions().await {
            Ok(transactions) => transactions,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let record = ActionRecord::new(
            self.id(),
            "list_transactions",
            ActionOutcome::ok()
                .with_message(format!("{} transaction(s)", transactions.len()))
                .with_details(serde_json::json!({ "count": transactions.len() })),
        );
        if transactions.is_empty() {
            return Ok(
                WorkerReply::text("There are no bank transactions to show.").with_action(record)
            );
        }
        let mut lines = vec![format!(
            "There are {} bank transaction(s):",
            transactions.len()
        )];
        for tx in &transactions {
            lines.push(format!(
                "- {}: {} {}",
                tx.date,
                vat::format_nok(tx.amount_ore),
                tx.description,
            ));
        }
        Ok(WorkerReply::text(lines.join("\n")).with_action(record))
    }

    async fn run_confirmed(
        &self,
        confirmed: ConfirmedAction,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        match confirmed.action.as_str() {
            "register_invoice_payment" => self.run_register_payment(&confirmed, today).await,
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
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
                let mut outcome = ActionOutcome::ok()
                    .with_message(format!("payment registered on {invoice_id}"))
                    .with_completed(true);
                if let Some(tx_id) = confirmed.inputs["transaction_id"].as_str() {
                    outcome = outcome
                        .with_details(serde_json::json!({ "transaction_id": tx_id }));
                }
                let record = ActionRecord::new(self.id(), "register_invoice_payment", outcome)
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
}

#[async_trait]
impl Worker for BankingWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[WorkerCapability::BankReconciliation]
    }

    async fn handle(
        &self,
        request: &DelegationRequest,
        _ctx: &WorkerContext<'_>,
    ) -> Result<WorkerReply> {
        info!(
            worker = %self.id(),
            origin = %request.origin,
            depth = request.depth,
            "Handling banking delegation"
        );
        self.core.claim()?;
        let result = self.execute(request, today_from(request)).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(BANKING_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}
