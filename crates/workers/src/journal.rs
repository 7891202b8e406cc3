//! The journal worker: manual postings between ledger accounts.
//!
//! Transfers are expressed as balanced two-line entries, credit on the
//! source account and debit on the target. Both accounts are checked
//! against the chart of accounts before anything is proposed.

use async_trait::async_trait;
use chrono::NaiveDate;
use munin_common::vat;
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ProposedAction, Result, Worker,
    WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply, intent_fingerprint,
};
use munin_ledger::{JournalLine, Ledger, LedgerError, NewJournalEntry};
use munin_llm::LlmClient;
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    AmountScan, ConfirmedAction, WorkerCore, confirmed_action, corrected_date, duplicate_of,
    find_date, iso, leftover_description, scan_amounts, today_from, translate_error,
};

const JOURNAL_SYSTEM_PROMPT: &str = r#"You are the general-ledger specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. Post manual journal entries that move amounts between accounts
2. Keep every entry balanced: total debit equals total credit
3. Show the chart of accounts on request

Always state both account numbers back to the user before posting. Never post to an account that is not in the chart."#;

/// Lead-in words dropped when reconstructing the entry description.
const TRANSFER_FILLER: [&str; 17] = [
    "overfør",
    "flytt",
    "omfør",
    "bokfør",
    "poster",
    "transfer",
    "move",
    "post",
    "konto",
    "kontoen",
    "account",
    "for",
    "om",
    "gjelder",
    "please",
    "en",
    "et",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JournalTask {
    Transfer,
    ListAccounts,
}

fn determine_task(task: &str) -> JournalTask {
    let lowered = task.to_lowercase();
    const LIST: [&str; 4] = ["kontoplan", "chart of accounts", "konti", "list accounts"];
    if LIST.iter().any(|k| lowered.contains(k)) {
        JournalTask::ListAccounts
    } else {
        JournalTask::Transfer
    }
}

/// The first four-digit account number after any of `keys`, together with
/// the word indices it occupied. An intervening "konto"/"account" is
/// skipped, anything else ends the search at that keyword.
fn account_after(scan: &AmountScan, keys: &[&str]) -> Option<(String, Vec<usize>)> {
    for (i, word) in scan.words.iter().enumerate() {
        let keyword = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if !keys.contains(&keyword.as_str()) {
            continue;
        }
        let mut used = vec![i];
        for j in i + 1..scan.words.len().min(i + 3) {
            let candidate = scan.words[j].trim_matches(|c: char| !c.is_alphanumeric());
            if candidate.len() == 4 && candidate.chars().all(|c| c.is_ascii_digit()) {
                used.push(j);
                return Some((candidate.to_string(), used));
            }
            let lowered = candidate.to_lowercase();
            if matches!(lowered.as_str(), "konto" | "kontoen" | "account") {
                used.push(j);
                continue;
            }
            break;
        }
    }
    None
}

/// Domain specialist for manual ledger postings.
pub struct JournalWorker {
    core: WorkerCore,
}

impl JournalWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Journal, "Journal Worker"),
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
            return self.run_confirmed(confirmed, request, today).await;
        }
        match determine_task(&request.task) {
            JournalTask::ListAccounts => self.list_accounts().await,
            JournalTask::Transfer => self.propose_transfer(request, today).await,
        }
    }

    async fn propose_transfer(
        &self,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut scan = scan_amounts(&request.task);
        let Some(amount) = scan.amounts.first().copied() else {
            return Ok(WorkerReply::question(
                "How much should be moved? Include the amount, for example \"5 000 kr\".",
            ));
        };

        let from = account_after(&scan, &["fra", "from"]);
        let to = account_after(&scan, &["til", "to"]);
        let (Some((from, from_used)), Some((to, to_used))) = (from, to) else {
            return Ok(WorkerReply::question(
                "Which accounts should the amount move between? Give both, \
                 for example \"fra 1920 til 7140\".",
            ));
        };

        let accounts = match self.core.ledger.list_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        for number in [&from, &to] {
            if !accounts.iter().any(|a| &a.number == number) {
                return Ok(WorkerReply::question(format!(
                    "Account {number} is not in the chart of accounts. Which account \
                     number should I use? Say \"vis kontoplanen\" to see the chart.",
                )));
            }
        }
        let name_of = |number: &str| {
            accounts
                .iter()
                .find(|a| a.number == number)
                .map(|a| a.name.clone())
                .unwrap_or_default()
        };

        for index in from_used.into_iter().chain(to_used) {
            scan.consumed[index] = true;
        }
        let mut description = leftover_description(&scan, &TRANSFER_FILLER);
        if description.is_empty() {
            description = format!("Omføring fra {from} til {to}");
        }
        let date = find_date(&request.task, today).unwrap_or_else(|| iso(today));

        let fingerprint = intent_fingerprint(
            EntityKind::JournalEntry,
            &format!("{from}/{to}"),
            amount,
            &date,
            &description,
        );
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "That posting was already made in this conversation ({existing}); \
                 I have not posted it again."
            )));
        }

        let entry = NewJournalEntry {
            date: date.clone(),
            description: description.clone(),
            lines: vec![
                JournalLine {
                    account: from.clone(),
                    debit_ore: 0,
                    credit_ore: amount,
                },
                JournalLine {
                    account: to.clone(),
                    debit_ore: amount,
                    credit_ore: 0,
                },
            ],
        };
        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_journal_entry".into(),
            summary: format!(
                "Post {} from {from} ({}) to {to} ({}), dated {date}: {description}.",
                vat::format_nok(amount),
                name_of(&from),
                name_of(&to),
            ),
            inputs: serde_json::json!({ "entry": entry }),
            fingerprint,
        }))
    }

    async fn list_accounts(&self) -> Result<WorkerReply> {
        let accounts = match self.core.ledger.list_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let record = ActionRecord::new(
            self.id(),
            "list_accounts",
            ActionOutcome::ok()
                .with_message(format!("{} account(s)", accounts.len()))
                .with_details(serde_json::json!({ "count": accounts.len() })),
        );
        let mut lines = vec!["The chart of accounts:".to_string()];
        for account in &accounts {
            lines.push(format!("- {} {}", account.number, account.name));
        }
        Ok(WorkerReply::text(lines.join("\n")).with_action(record))
    }

    async fn run_confirmed(
        &self,
        confirmed: ConfirmedAction,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        match confirmed.action.as_str() {
            "create_journal_entry" => self.run_post_entry(&confirmed, request, today).await,
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
    }

    async fn run_post_entry(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
        today: NaiveDate,
    ) -> Result<WorkerReply> {
        let mut new: NewJournalEntry = serde_json::from_value(confirmed.inputs["entry"].clone())?;

        let mut result = self.core.ledger.create_journal_entry(new.clone()).await;
        if let Err(err) = &result
            && let Some(fixed) = corrected_date(err, &new.date, today)
        {
            info!(worker = %self.id(), corrected = %fixed, "Retrying posting with normalized date");
            new.date = fixed;
            result = self.core.ledger.create_journal_entry(new.clone()).await;
        }

        match result {
            Ok(entry) => {
                let from = entry
                    .lines
                    .iter()
                    .find(|l| l.credit_ore > 0)
                    .map(|l| l.account.clone())
                    .unwrap_or_default();
                let to = entry
                    .lines
                    .iter()
                    .find(|l| l.debit_ore > 0)
                    .map(|l| l.account.clone())
                    .unwrap_or_default();
                let amount: i64 = entry.lines.iter().map(|l| l.debit_ore).sum();
                let record = ActionRecord::new(
                    self.id(),
                    "create_journal_entry",
                    ActionOutcome::ok()
                        .with_message(format!("journal entry {} posted", entry.voucher_number))
                        .with_created(EntityKind::JournalEntry, &entry.id)
                        .with_details(
                            serde_json::json!({ "voucher_number": entry.voucher_number }),
                        )
                        .with_completed(true),
                )
                .with_inputs(confirmed.inputs.clone())
                .with_fingerprint(confirmed.fingerprint.clone());
                let template = format!(
                    "Journal entry {} posted: {} from account {from} to account {to}, dated {}.",
                    entry.voucher_number,
                    vat::format_nok(amount),
                    entry.date,
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
                    "create_journal_entry",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }
}

#[async_trait]
impl Worker for JournalWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[WorkerCapability::LedgerPostings]
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
            "Handling journal delegation"
        );
        self.core.claim()?;
        let result = self.execute(request, today_from(request)).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(JOURNAL_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}
