//! Shared scaffolding for the uniform worker protocol.
//!
//! Every specialist follows the same shape: claim the busy flag, read the
//! structured context the coordinator supplies, then either answer a read
//! directly, ask one clarifying question, or propose a side effect and wait
//! for explicit confirmation. The helpers here keep those steps identical
//! across the six domains.

use chrono::NaiveDate;
use munin_common::{
    ActionOutcome, ActionRecord, AttachmentSet, DelegationRequest, Delegator, EntityKind,
    MuninError, ParticipantId, PendingAttachment, Result, WorkerConfig, WorkerId, normalize_date,
    vat,
};
use munin_ledger::{AttachmentTarget, Ledger, LedgerError, LedgerResult};
use munin_llm::{ChatMessage, LlmClient, LlmRequest};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// State every worker carries: its configuration, the busy flag, the ledger
/// collaborator, and an optional LLM for polishing replies.
pub(crate) struct WorkerCore {
    config: WorkerConfig,
    busy: AtomicBool,
    pub(crate) ledger: Arc<dyn Ledger>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl WorkerCore {
    pub(crate) fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            config,
            busy: AtomicBool::new(false),
            ledger,
            llm: None,
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.config.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn prompt_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.config.system_prompt.as_deref().unwrap_or(default)
    }

    pub(crate) fn set_llm(&mut self, client: Arc<dyn LlmClient>) {
        self.llm = Some(client);
    }

    /// Claim the worker for one delegation. Workers handle one delegation at
    /// a time; a second caller gets an error the channel turns into a
    /// structured failure.
    pub(crate) fn claim(&self) -> Result<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MuninError::Worker(format!(
                "worker {} is busy with another delegation",
                self.id()
            )));
        }
        Ok(())
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_available(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    /// Polish a deterministic reply with the LLM, with graceful degradation.
    /// Identifiers and amounts come from the template; the model is told to
    /// keep them verbatim.
    pub(crate) async fn enhance_with_llm(
        &self,
        template: &str,
        task: &str,
        system_prompt: &str,
    ) -> String {
        if let Some(ref llm) = self.llm {
            let request = LlmRequest {
                system_prompt: Some(system_prompt.to_string()),
                messages: vec![ChatMessage::user(format!(
                    "Task: {task}\n\nRewrite this reply so it reads naturally. \
                     Keep every number, date and identifier exactly as written:\n{template}"
                ))],
                temperature: Some(self.config.temperature),
                max_tokens: Some(self.config.max_tokens as u32),
            };

            match llm.complete(request).await {
                Ok(response) if !response.content.is_empty() => return response.content,
                Ok(_) => warn!(worker = %self.id(), "LLM returned empty response, using template"),
                Err(e) => {
                    warn!(worker = %self.id(), error = %e, "LLM failed, falling back to template")
                }
            }
        }
        template.to_string()
    }

    /// Upload one staged file, reporting the result as an action record and
    /// an optional user-facing failure line.
    pub(crate) async fn upload_file(
        &self,
        target: AttachmentTarget,
        file: &PendingAttachment,
        ordinal: u32,
    ) -> (ActionRecord, Option<String>) {
        let bytes = match file.payload_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                return (
                    ActionRecord::new(
                        self.id(),
                        "upload_attachment",
                        ActionOutcome::failed(err.to_string()),
                    ),
                    Some(format!(
                        "The file {} could not be read, so it was not attached.",
                        file.name
                    )),
                );
            }
        };
        match self
            .ledger
            .upload_attachment(target.clone(), &file.name, &file.media_type, bytes)
            .await
        {
            Ok(attachment_id) => (
                ActionRecord::new(
                    self.id(),
                    "upload_attachment",
                    ActionOutcome::ok()
                        .with_message(format!("{} attached to {}", file.name, target.id))
                        .with_created(EntityKind::Attachment, attachment_id)
                        .with_details(serde_json::json!({
                            "target_id": target.id,
                            "ordinal": ordinal,
                        })),
                ),
                None,
            ),
            Err(err) => (
                ActionRecord::new(
                    self.id(),
                    "upload_attachment",
                    ActionOutcome::failed(err.to_string()),
                ),
                Some(translate_error(&err)),
            ),
        }
    }
}

/// Find which invoice a task refers to: a direct `inv-` identifier, a
/// "faktura NNNN" number looked up among open invoices, or the invoice most
/// recently created in this conversation.
pub(crate) async fn resolve_invoice_ref(
    ledger: &dyn Ledger,
    request: &DelegationRequest,
) -> LedgerResult<Option<String>> {
    if let Some(id) = find_entity_ref(&request.task, "inv") {
        return Ok(Some(id));
    }
    if let Some(number) =
        find_numbered_reference(&request.task, &["faktura", "fakturanr", "invoice"])
    {
        let invoices = ledger.list_open_invoices().await?;
        return Ok(invoices
            .into_iter()
            .find(|i| i.invoice_number == number)
            .map(|i| i.id));
    }
    Ok(known_entity(request, EntityKind::Invoice))
}

/// Outcome of asking the contacts worker about a counterparty.
pub(crate) enum ContactResolution {
    Found { id: String, name: String },
    /// Nobody matched; the contacts worker's follow-up question is passed on
    Missing { question: String },
    Unavailable,
}

/// Look a counterparty up through the contacts worker. The match list rides
/// in the `search_contacts` action record, not in the reply text.
pub(crate) async fn resolve_contact(
    delegator: &dyn Delegator,
    origin: WorkerId,
    depth: u32,
    name: &str,
) -> Result<ContactResolution> {
    let request = DelegationRequest::new(
        ParticipantId::Worker(origin),
        WorkerId::Contacts,
        format!("find customer {name}"),
    )?
    .with_depth(depth + 1);
    let response = delegator.delegate(request).await;
    if !response.success {
        return Ok(ContactResolution::Unavailable);
    }
    let Some(reply) = response.reply else {
        return Ok(ContactResolution::Unavailable);
    };
    for record in &reply.actions {
        if record.action != "search_contacts" {
            continue;
        }
        let first = record.outcome.details["matches"]
            .as_array()
            .and_then(|matches| matches.first());
        if let Some(first) = first
            && let Some(id) = first["id"].as_str()
            && !id.is_empty()
        {
            return Ok(ContactResolution::Found {
                id: id.to_string(),
                name: first["name"].as_str().unwrap_or(name).to_string(),
            });
        }
        return Ok(ContactResolution::Missing {
            question: reply.text.clone(),
        });
    }
    Ok(ContactResolution::Missing {
        question: format!(
            "I could not look up \"{name}\" in the contact register. Is that an existing customer?"
        ),
    })
}

/// The counterparty named after "til"/"to", with the word range it occupies
/// so the caller can exclude it from the line description.
pub(crate) fn extract_counterparty(scan: &AmountScan) -> Option<(String, std::ops::Range<usize>)> {
    const STOP: [&str; 8] = ["på", "for", "om", "with", "kr", "kroner", "nok", "og"];
    for (i, word) in scan.words.iter().enumerate() {
        let lower = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if lower != "til" && lower != "to" {
            continue;
        }
        let mut name_words = Vec::new();
        let mut end = i + 1;
        while end < scan.words.len() && name_words.len() < 4 {
            if scan.consumed[end] {
                break;
            }
            let candidate =
                scan.words[end].trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':'));
            let lower = candidate.to_lowercase();
            if STOP.contains(&lower.as_str()) || number_word(candidate).is_some() {
                break;
            }
            name_words.push(candidate.to_string());
            end += 1;
        }
        if !name_words.is_empty() {
            return Some((name_words.join(" "), i..end));
        }
    }
    None
}

/// A side effect the user already confirmed, carried in the delegation
/// context. The worker executes these inputs as-is instead of re-parsing
/// the task text.
pub(crate) struct ConfirmedAction {
    pub(crate) action: String,
    pub(crate) inputs: Value,
    pub(crate) fingerprint: String,
}

pub(crate) fn confirmed_action(request: &DelegationRequest) -> Option<ConfirmedAction> {
    let confirmed = request.context.get("confirmed")?;
    Some(ConfirmedAction {
        action: confirmed.get("action")?.as_str()?.to_string(),
        inputs: confirmed.get("inputs").cloned().unwrap_or(Value::Null),
        fingerprint: confirmed
            .get("fingerprint")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

/// Identifier of an entity already created for this intent, if the
/// coordinator's fingerprint map has one. A hit means the creation must not
/// run again.
pub(crate) fn duplicate_of(request: &DelegationRequest, fingerprint: &str) -> Option<String> {
    if fingerprint.is_empty() {
        return None;
    }
    request
        .context
        .get("fingerprints")?
        .get(fingerprint)?
        .as_str()
        .map(str::to_string)
}

/// Most recently created identifier of this kind, as remembered by the
/// coordinator.
pub(crate) fn known_entity(request: &DelegationRequest, kind: EntityKind) -> Option<String> {
    request
        .context
        .get("entities")?
        .get(kind.as_str())?
        .as_str()
        .map(str::to_string)
}

pub(crate) fn today_from(request: &DelegationRequest) -> NaiveDate {
    request
        .context
        .get("today")
        .and_then(|v| v.as_str())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or_else(|| chrono::Local::now().date_naive())
}

pub(crate) fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachmentPolicy {
    /// Create the entity and attach the files in the same delegation
    CreateAndAttach,
    /// The entity already exists; only upload, never create
    UploadOnly,
}

pub(crate) struct AttachmentDirective {
    pub(crate) policy: AttachmentPolicy,
    pub(crate) ordinals: Vec<u32>,
}

/// The coordinator's instruction for staged attachments. Without an explicit
/// directive, all staged files are in scope and creation is allowed.
pub(crate) fn attachment_directive(
    request: &DelegationRequest,
    attachments: &AttachmentSet,
) -> AttachmentDirective {
    let node = request.context.get("attachments");
    let policy = match node.and_then(|n| n.get("policy")).and_then(|p| p.as_str()) {
        Some("upload_only") => AttachmentPolicy::UploadOnly,
        _ => AttachmentPolicy::CreateAndAttach,
    };
    let ordinals = node
        .and_then(|n| n.get("ordinals"))
        .and_then(|o| o.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64())
                .map(|v| v as u32)
                .collect()
        })
        .unwrap_or_else(|| attachments.iter().map(|a| a.ordinal).collect());
    AttachmentDirective { policy, ordinals }
}

/// Tokenization of free text with amount words tagged, so callers can read
/// the amounts and still reconstruct a description from what is left.
pub(crate) struct AmountScan {
    pub(crate) words: Vec<String>,
    /// True for words consumed by an amount or its currency marker
    pub(crate) consumed: Vec<bool>,
    /// Detected amounts in øre, in text order
    pub(crate) amounts: Vec<i64>,
}

/// Find every monetary amount in `text`.
///
/// A number counts as an amount only when the user marked it as money: a
/// "kr"/"NOK" word next to it, or the Norwegian ",-" suffix. Space-grouped
/// thousands ("2 500 kr") are joined before parsing. Bare numbers, dates and
/// account numbers are left alone.
pub(crate) fn scan_amounts(text: &str) -> AmountScan {
    let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    let mut consumed = vec![false; words.len()];
    let mut amounts = Vec::new();

    let mut i = 0;
    while i < words.len() {
        let Some(mut number) = number_word(&words[i]) else {
            i += 1;
            continue;
        };

        let mut end = i + 1;
        loop {
            if !number.chars().all(|c| c.is_ascii_digit()) || end >= words.len() {
                break;
            }
            match group_word(&words[end]) {
                Some(group) => {
                    number.push_str(&group);
                    end += 1;
                }
                None => break,
            }
        }

        let self_marked = number.ends_with(",-");
        let marked_after = end < words.len() && is_currency_marker(&words[end]);
        let marked_before = i > 0 && !consumed[i - 1] && is_currency_marker(&words[i - 1]);

        if !(self_marked || marked_after || marked_before) {
            i = end;
            continue;
        }
        let Some(value) = vat::parse_amount_ore(&number) else {
            i = end;
            continue;
        };

        for slot in consumed.iter_mut().take(end).skip(i) {
            *slot = true;
        }
        if marked_after {
            consumed[end] = true;
        }
        if marked_before {
            consumed[i - 1] = true;
        }
        amounts.push(value);
        i = end + usize::from(marked_after);
    }

    AmountScan {
        words,
        consumed,
        amounts,
    }
}

pub(crate) fn extract_amounts(text: &str) -> Vec<i64> {
    scan_amounts(text).amounts
}

pub(crate) fn first_amount(text: &str) -> Option<i64> {
    scan_amounts(text).amounts.first().copied()
}

/// Words of a scanned text that are not part of an amount or a VAT phrase,
/// with generic lead-in words ("registrer en utgift ...") dropped from the
/// front. What remains is the user's own description of the thing.
pub(crate) fn leftover_description(scan: &AmountScan, leading_filler: &[&str]) -> String {
    let mut kept: Vec<String> = Vec::new();
    for (i, word) in scan.words.iter().enumerate() {
        if scan.consumed[i] {
            continue;
        }
        let cleaned = word.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '(' | ')'));
        if cleaned.is_empty() {
            continue;
        }
        let lower = cleaned.to_lowercase();
        if matches!(
            lower.as_str(),
            "mva" | "moms" | "inkl" | "inklusiv" | "eks" | "ekskl"
        ) {
            continue;
        }
        if matches!(lower.as_str(), "med" | "uten") && next_word_is_mva(scan, i) {
            continue;
        }
        if kept.is_empty() && leading_filler.contains(&lower.as_str()) {
            continue;
        }
        kept.push(cleaned.to_string());
    }
    kept.join(" ")
}

fn next_word_is_mva(scan: &AmountScan, i: usize) -> bool {
    scan.words.get(i + 1).is_some_and(|w| {
        let lower = w
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        lower == "mva" || lower == "moms"
    })
}

/// First date-like token in the text, normalized to ISO. Relative two-word
/// forms ("i går") are checked before single words.
pub(crate) fn find_date(text: &str, today: NaiveDate) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for pair in words.windows(2) {
        let joined = format!("{} {}", pair[0], pair[1]);
        if let Some(date) = normalize_date(&joined, today) {
            return Some(date);
        }
    }
    for word in &words {
        let cleaned = word.trim_end_matches([',', ';', ':', '!', '?']);
        if cleaned.contains(['.', '-']) {
            if let Some(date) = normalize_date(cleaned, today) {
                return Some(date);
            }
        } else if let Some(date) = normalize_date(cleaned, today) {
            // Relative single words like "idag"; bare numbers never normalize.
            return Some(date);
        }
    }
    None
}

/// Find a ledger identifier like `inv-3` or `p-12` in free text.
pub(crate) fn find_entity_ref(text: &str, prefix: &str) -> Option<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
        .find(|w| {
            w.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()))
        })
        .map(str::to_string)
}

/// Find a document number stated right after one of the given keywords, as
/// in "faktura 1003".
pub(crate) fn find_numbered_reference(text: &str, keywords: &[&str]) -> Option<i64> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let cleaned = word
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_lowercase();
        if !keywords.contains(&cleaned.as_str()) {
            continue;
        }
        if let Some(next) = words.get(i + 1) {
            let next = strip_terminal_punct(next);
            let digits: String = next.chars().filter(|c| c.is_ascii_digit()).collect();
            let shape_ok = next.chars().all(|c| c.is_ascii_digit() || c == '#');
            if !digits.is_empty() && shape_ok
                && let Ok(number) = digits.parse()
            {
                return Some(number);
            }
        }
    }
    None
}

/// Plain-language version of a collaborator failure. Raw status codes and
/// backend phrasing stay out of user replies; each message states the
/// obstacle and a next step.
pub(crate) fn translate_error(error: &LedgerError) -> String {
    match error {
        LedgerError::RateLimited { .. } | LedgerError::Transport(_) => {
            "The accounting system is not responding right now. Nothing was changed; \
             please try again in a moment."
                .into()
        }
        LedgerError::Invalid { field, .. } if field == "date" => {
            "I could not use that date. Please give it as day.month.year, \
             for example 15.03.2026."
                .into()
        }
        LedgerError::Invalid { field, .. } => {
            format!("The {field} was not accepted. Please check it and state it again.")
        }
        LedgerError::MissingPrecondition(_) => {
            "The ledger needs a one-time setup step that did not complete. \
             Please try the request once more."
                .into()
        }
        LedgerError::StaleReference(_) | LedgerError::NotFound(_) => {
            "Something this request refers to no longer matches the ledger. \
             Please check the reference and try again."
                .into()
        }
        LedgerError::Unsupported(_) => {
            "The ledger cannot do this directly. For issued documents I can record \
             a reversing credit note instead."
                .into()
        }
    }
}

/// The one deterministic correction for a rejected date: re-normalize the
/// original wording. `None` when the failure is not about dates, or the
/// wording cannot be normalized either.
pub(crate) fn corrected_date(
    error: &LedgerError,
    original: &str,
    today: NaiveDate,
) -> Option<String> {
    match error {
        LedgerError::Invalid { field, .. } if field == "date" => normalize_date(original, today),
        _ => None,
    }
}

fn strip_terminal_punct(word: &str) -> &str {
    word.trim_end_matches([',', '.', ';', ':', '!', '?', ')'])
}

/// A word that could start a monetary amount: digits with optional dot or
/// comma separators, or the ",-" whole-kroner suffix. Dashes rule a word
/// out, which keeps ISO dates and negative spans from matching.
pub(crate) fn number_word(word: &str) -> Option<String> {
    let cleaned = strip_terminal_punct(word.trim_start_matches('('));
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let body = cleaned.strip_suffix(",-").unwrap_or(cleaned);
    if body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | ','))
    {
        Some(cleaned.to_string())
    } else {
        None
    }
}

/// A continuation group in a space-grouped number: exactly three digits,
/// optionally with a decimal tail ("500" or "234,50").
fn group_word(word: &str) -> Option<String> {
    let cleaned = strip_terminal_punct(word);
    let (digits, decimals) = match cleaned.split_once(',') {
        Some((d, f)) => (d, Some(f)),
        None => (cleaned, None),
    };
    if digits.len() != 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if let Some(f) = decimals {
        if !(matches!(f.len(), 1 | 2) && f.chars().all(|c| c.is_ascii_digit())) {
            return None;
        }
    }
    Some(cleaned.to_string())
}

fn is_currency_marker(word: &str) -> bool {
    matches!(
        strip_terminal_punct(word).to_lowercase().as_str(),
        "kr" | "kroner" | "nok"
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use munin_common::{DelegationRequest, DelegationResponse, Delegator, WorkerId};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Canned delegation responses for worker tests, popped in order. Also
    /// records the requests it saw so tests can assert on them.
    pub(crate) struct StubDelegator {
        responses: Mutex<VecDeque<DelegationResponse>>,
        pub(crate) requests: Mutex<Vec<DelegationRequest>>,
    }

    impl StubDelegator {
        pub(crate) fn new(responses: Vec<DelegationResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Delegator for StubDelegator {
        async fn delegate(&self, request: DelegationRequest) -> DelegationResponse {
            let target = request.target;
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    DelegationResponse::failed(target, "no canned response left")
                })
        }
    }

    /// The reply shape the contacts worker produces for a successful lookup.
    pub(crate) fn contact_found(id: &str, name: &str) -> DelegationResponse {
        use munin_common::{ActionOutcome, ActionRecord, WorkerReply};

        let outcome = ActionOutcome::ok()
            .with_message(format!("1 match for {name}"))
            .with_details(serde_json::json!({
                "matches": [{"id": id, "name": name}]
            }));
        let reply = WorkerReply::text(format!("Found {name} ({id})."))
            .with_action(ActionRecord::new(WorkerId::Contacts, "search_contacts", outcome));
        DelegationResponse::ok(WorkerId::Contacts, reply)
    }

    /// The reply shape the contacts worker produces when nobody matches.
    pub(crate) fn contact_missing(name: &str) -> DelegationResponse {
        use munin_common::{ActionOutcome, ActionRecord, WorkerReply};

        let outcome = ActionOutcome::ok()
            .with_message(format!("no match for {name}"))
            .with_details(serde_json::json!({ "matches": [] }));
        let reply = WorkerReply::question(format!(
            "I found no customer or supplier named \"{name}\". \
             Should I register them as a new contact?"
        ))
        .with_action(ActionRecord::new(WorkerId::Contacts, "search_contacts", outcome));
        DelegationResponse::ok(WorkerId::Contacts, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use munin_common::ParticipantId;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 25).unwrap()
    }

    fn request_with_context(context: serde_json::Value) -> DelegationRequest {
        DelegationRequest::new(ParticipantId::Coordinator, WorkerId::Purchases, "task")
            .unwrap()
            .with_context(context)
    }

    #[test]
    fn test_scan_single_amount_with_marker() {
        assert_eq!(extract_amounts("taxi 250 kr"), vec![25_000]);
        assert_eq!(extract_amounts("kr 500 for rekvisita"), vec![50_000]);
        assert_eq!(extract_amounts("lunsj 450,50 kr"), vec![45_050]);
    }

    #[test]
    fn test_scan_space_grouped_thousands() {
        assert_eq!(extract_amounts("faktura på 2 500 kr"), vec![250_000]);
        assert_eq!(extract_amounts("1 234,50 kr totalt"), vec![123_450]);
    }

    #[test]
    fn test_scan_multiple_amounts() {
        assert_eq!(
            extract_amounts("250 kr taxi, 450 kr lunsj, 1 200 kr rekvisita"),
            vec![25_000, 45_000, 120_000]
        );
    }

    #[test]
    fn test_scan_requires_currency_marker() {
        assert!(extract_amounts("betal 500").is_empty());
        assert!(extract_amounts("konto 1920").is_empty());
        assert_eq!(extract_amounts("500,-"), vec![50_000]);
    }

    #[test]
    fn test_scan_leaves_dates_alone() {
        let scan = scan_amounts("kjøpt 20.08.2026 for 250 kr");
        assert_eq!(scan.amounts, vec![25_000]);
        // The date word is not consumed, so it stays findable.
        assert!(!scan.consumed[1]);
    }

    #[test]
    fn test_leftover_description_drops_amounts_and_vat_phrases() {
        let scan = scan_amounts("registrer en utgift på 500 kr for taxi til flyplassen inkl. mva");
        let description = leftover_description(
            &scan,
            &["registrer", "en", "utgift", "på", "for"],
        );
        assert_eq!(description, "taxi til flyplassen");
    }

    #[test]
    fn test_leftover_description_keeps_inner_med() {
        let scan = scan_amounts("450 kr lunsj med kunde, med mva");
        let description = leftover_description(&scan, &[]);
        assert_eq!(description, "lunsj med kunde");
    }

    #[test]
    fn test_find_date_variants() {
        assert_eq!(
            find_date("kvittering fra 20.08.2026", today()),
            Some("2026-08-20".into())
        );
        assert_eq!(
            find_date("betalt 2026-08-01 via kort", today()),
            Some("2026-08-01".into())
        );
        assert_eq!(find_date("det var i går", today()), Some("2026-08-24".into()));
        assert_eq!(find_date("ingen dato her", today()), None);
    }

    #[test]
    fn test_find_entity_ref() {
        assert_eq!(
            find_entity_ref("last opp til inv-3, takk", "inv"),
            Some("inv-3".into())
        );
        assert_eq!(find_entity_ref("kjøpet (p-12)", "p"), Some("p-12".into()));
        assert_eq!(find_entity_ref("faktura 1003", "inv"), None);
    }

    #[test]
    fn test_find_numbered_reference() {
        assert_eq!(
            find_numbered_reference("har kunden betalt faktura 1003?", &["faktura", "invoice"]),
            Some(1003)
        );
        assert_eq!(
            find_numbered_reference("invoice #1010 please", &["faktura", "invoice"]),
            Some(1010)
        );
        assert_eq!(
            find_numbered_reference("betal fakturaen", &["faktura", "invoice"]),
            None
        );
    }

    #[test]
    fn test_confirmed_action_parsed_from_context() {
        let request = request_with_context(serde_json::json!({
            "confirmed": {
                "action": "record_receipts",
                "inputs": {"receipts": []},
                "fingerprint": "purchase|x|25000|2026-08-20|taxi"
            }
        }));
        let confirmed = confirmed_action(&request).unwrap();
        assert_eq!(confirmed.action, "record_receipts");
        assert_eq!(confirmed.fingerprint, "purchase|x|25000|2026-08-20|taxi");
        assert!(confirmed.inputs["receipts"].as_array().unwrap().is_empty());

        assert!(confirmed_action(&request_with_context(serde_json::json!({}))).is_none());
    }

    #[test]
    fn test_duplicate_lookup() {
        let request = request_with_context(serde_json::json!({
            "fingerprints": {"purchase|x|25000|2026-08-20|taxi": "p-7"}
        }));
        assert_eq!(
            duplicate_of(&request, "purchase|x|25000|2026-08-20|taxi"),
            Some("p-7".into())
        );
        assert_eq!(duplicate_of(&request, "purchase|y|1|2026-01-01|annet"), None);
        assert_eq!(duplicate_of(&request, ""), None);
    }

    #[test]
    fn test_known_entity_lookup() {
        let request = request_with_context(serde_json::json!({
            "entities": {"invoice": "inv-3"}
        }));
        assert_eq!(
            known_entity(&request, EntityKind::Invoice),
            Some("inv-3".into())
        );
        assert_eq!(known_entity(&request, EntityKind::Purchase), None);
    }

    #[test]
    fn test_attachment_directive_defaults() {
        let mut attachments = AttachmentSet::new();
        attachments.add("a.pdf", "application/pdf", "aGVp");
        attachments.add("b.pdf", "application/pdf", "aGVp");

        let directive =
            attachment_directive(&request_with_context(serde_json::json!({})), &attachments);
        assert_eq!(directive.policy, AttachmentPolicy::CreateAndAttach);
        assert_eq!(directive.ordinals, vec![1, 2]);

        let directive = attachment_directive(
            &request_with_context(serde_json::json!({
                "attachments": {"policy": "upload_only", "ordinals": [2]}
            })),
            &attachments,
        );
        assert_eq!(directive.policy, AttachmentPolicy::UploadOnly);
        assert_eq!(directive.ordinals, vec![2]);
    }

    #[test]
    fn test_today_from_context() {
        let request = request_with_context(serde_json::json!({"today": "2026-08-25"}));
        assert_eq!(today_from(&request), today());
    }

    #[test]
    fn test_translate_error_hides_backend_detail() {
        let translated = translate_error(&LedgerError::Transport(
            "HTTP 502 from upstream at 10.0.3.7".into(),
        ));
        assert!(!translated.contains("502"));
        assert!(!translated.contains("10.0.3.7"));

        let translated = translate_error(&LedgerError::invalid("date", "bad format"));
        assert!(translated.contains("15.03.2026"));
    }

    #[test]
    fn test_corrected_date_only_for_date_errors() {
        let date_err = LedgerError::invalid("date", "expected ISO 8601");
        assert_eq!(
            corrected_date(&date_err, "20.08.2026", today()),
            Some("2026-08-20".into())
        );
        assert_eq!(corrected_date(&date_err, "soonish", today()), None);

        let other = LedgerError::invalid("lines", "must balance");
        assert_eq!(corrected_date(&other, "20.08.2026", today()), None);
    }

    #[test]
    fn test_claim_is_exclusive_until_release() {
        let core = WorkerCore::new(
            WorkerConfig::for_worker(WorkerId::Sales, "Sales Worker"),
            Arc::new(munin_ledger::InMemoryLedger::new()),
        );

        assert!(core.claim().is_ok());
        assert!(!core.is_available());
        assert!(core.claim().is_err());

        core.release();
        assert!(core.is_available());
        assert!(core.claim().is_ok());
    }
}
