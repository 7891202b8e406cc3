//! The contacts worker: the customer, supplier and product catalog.
//!
//! Other workers resolve counterparties by delegating here, so the match
//! list in the `search_contacts` action record is a small wire format of
//! its own; `{id, name}` pairs under `details.matches`.

use async_trait::async_trait;
use munin_common::vat::{self, VatRate, VatTreatment};
use munin_common::{
    ActionOutcome, ActionRecord, DelegationRequest, EntityKind, ProposedAction, Result, Worker,
    WorkerCapability, WorkerConfig, WorkerContext, WorkerId, WorkerReply, intent_fingerprint,
};
use munin_ledger::{ContactKind, Ledger, NewContact, NewProduct};
use munin_llm::LlmClient;
use std::sync::Arc;
use tracing::info;

use crate::protocol::{
    ConfirmedAction, WorkerCore, confirmed_action, duplicate_of, find_entity_ref,
    leftover_description, scan_amounts, translate_error,
};

const CONTACTS_SYSTEM_PROMPT: &str = r#"You are the contact register specialist of a bookkeeping assistant for Norwegian small businesses.

Your responsibilities:
1. Look up customers and suppliers by name and report every match with its identifier
2. Register new contacts once their details are confirmed
3. Look up and register products with the correct VAT band

Keep replies short and concrete. Never invent identifiers, organisation numbers or prices. Propose every ledger change and wait for confirmation."#;

/// At most this many matches are carried in a search record.
const MAX_MATCHES: usize = 5;

const FIND_CONTACT_FILLER: &[&str] = &[
    "finn", "find", "søk", "etter", "lookup", "slå", "opp", "er", "is", "har", "vi", "we", "have",
    "hos", "oss", "vår", "our", "i", "in", "registeret", "register", "kunde", "kunden", "customer",
    "supplier", "leverandør", "leverandøren", "kontakt", "kontakten", "contact", "named", "som",
    "heter", "a", "an", "en", "et",
];

const CREATE_CONTACT_FILLER: &[&str] = &[
    "registrer", "opprett", "legg", "til", "ny", "nytt", "new", "add", "please", "kunde", "kunden",
    "customer", "supplier", "leverandør", "leverandøren", "kontakt", "kontakten", "contact",
    "named", "som", "heter", "med", "with", "og", "and", "epost", "e-post", "email", "org",
    "org.nr", "orgnr", "organisasjonsnummer",
];

const FIND_PRODUCT_FILLER: &[&str] = &[
    "finn", "find", "søk", "etter", "har", "vi", "we", "have", "produkt", "produktet", "product",
    "vare", "varen", "i", "in", "katalogen", "catalog",
];

const CREATE_PRODUCT_FILLER: &[&str] = &[
    "nytt", "ny", "new", "produkt", "produktet", "product", "vare", "varen", "opprett",
    "registrer", "legg", "til", "add", "med", "pris", "price", "på", "for",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatalogTask {
    FindContact,
    CreateContact,
    FindProduct,
    CreateProduct,
}

fn determine_task(task: &str) -> CatalogTask {
    let lowered = task.to_lowercase();
    const PRODUCT: [&str; 3] = ["produkt", "product", "vare"];
    const CREATE: [&str; 6] = ["registrer", "opprett", "legg til", "ny ", "nytt ", "add "];
    let product = PRODUCT.iter().any(|k| lowered.contains(k));
    let create = CREATE.iter().any(|k| lowered.contains(k));
    match (product, create) {
        (true, true) => CatalogTask::CreateProduct,
        (true, false) => CatalogTask::FindProduct,
        (false, true) => CatalogTask::CreateContact,
        (false, false) => CatalogTask::FindContact,
    }
}

/// Strip filler words wherever they appear and keep the rest as the name.
fn name_from(task: &str, filler: &[&str]) -> String {
    task.split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '?' | '!' | '"')))
        .filter(|word| {
            !word.is_empty()
                && !filler.contains(&word.to_lowercase().as_str())
                && !is_org_number(word)
                && !word.contains('@')
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_org_number(word: &str) -> bool {
    word.len() == 9 && word.chars().all(|c| c.is_ascii_digit())
}

fn find_org_number(task: &str) -> Option<String> {
    task.split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':')))
        .find(|word| is_org_number(word))
        .map(str::to_string)
}

fn find_email(task: &str) -> Option<String> {
    task.split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '(' | ')')))
        .find(|word| word.contains('@'))
        .map(str::to_string)
}

fn kind_of(task: &str) -> ContactKind {
    let lowered = task.to_lowercase();
    if lowered.contains("leverandør") || lowered.contains("supplier") {
        ContactKind::Supplier
    } else {
        ContactKind::Customer
    }
}

fn kind_label(kind: ContactKind) -> &'static str {
    match kind {
        ContactKind::Customer => "customer",
        ContactKind::Supplier => "supplier",
    }
}

/// Domain specialist for the counterparty and product catalog.
pub struct ContactsWorker {
    core: WorkerCore,
}

impl ContactsWorker {
    pub fn new(config: WorkerConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            core: WorkerCore::new(config, ledger),
        }
    }

    pub fn with_default_config(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(
            WorkerConfig::for_worker(WorkerId::Contacts, "Contacts Worker"),
            ledger,
        )
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.core.set_llm(client);
        self
    }

    async fn execute(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        if let Some(confirmed) = confirmed_action(request) {
            return self.run_confirmed(confirmed, request).await;
        }
        match determine_task(&request.task) {
            CatalogTask::FindContact => self.find_contact(request).await,
            CatalogTask::CreateContact => self.propose_contact(request),
            CatalogTask::FindProduct => self.find_product(request).await,
            CatalogTask::CreateProduct => self.propose_product(request),
        }
    }

    async fn find_contact(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        if let Some(id) = find_entity_ref(&request.task, "c") {
            return self.find_contact_by_id(&id).await;
        }
        let name = name_from(&request.task, FIND_CONTACT_FILLER);
        if name.is_empty() {
            return Ok(WorkerReply::question(
                "Who should I look up? Give the customer or supplier name.",
            ));
        }
        let matches = match self.core.ledger.search_contacts(&name).await {
            Ok(matches) => matches,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let listed: Vec<serde_json::Value> = matches
            .iter()
            .take(MAX_MATCHES)
            .map(|c| serde_json::json!({ "id": c.id, "name": c.name }))
            .collect();
        let record = ActionRecord::new(
            self.id(),
            "search_contacts",
            ActionOutcome::ok()
                .with_message(format!("{} match(es) for {name}", matches.len()))
                .with_details(serde_json::json!({ "matches": listed })),
        );
        if matches.is_empty() {
            return Ok(WorkerReply::question(format!(
                "I found no customer or supplier named \"{name}\". \
                 Should I register them as a new contact?"
            ))
            .with_action(record));
        }
        let text = if matches.len() == 1 {
            format!("Found {} ({}).", matches[0].name, matches[0].id)
        } else {
            let mut lines = vec![format!("Found {} matches for \"{name}\":", matches.len())];
            for contact in matches.iter().take(MAX_MATCHES) {
                lines.push(format!("- {} ({})", contact.name, contact.id));
            }
            lines.join("\n")
        };
        Ok(WorkerReply::text(text).with_action(record))
    }

    /// Id lookups come from other workers that hold a contact id and need
    /// the display name.
    async fn find_contact_by_id(&self, id: &str) -> Result<WorkerReply> {
        let contacts = match self.core.ledger.search_contacts("").await {
            Ok(contacts) => contacts,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let found = contacts.into_iter().find(|c| c.id == id);
        let listed: Vec<serde_json::Value> = found
            .iter()
            .map(|c| serde_json::json!({ "id": c.id, "name": c.name }))
            .collect();
        let record = ActionRecord::new(
            self.id(),
            "search_contacts",
            ActionOutcome::ok()
                .with_message(format!("{} match(es) for {id}", listed.len()))
                .with_details(serde_json::json!({ "matches": listed })),
        );
        match found {
            Some(contact) => Ok(WorkerReply::text(format!(
                "Found {} ({}).",
                contact.name, contact.id
            ))
            .with_action(record)),
            None => Ok(WorkerReply::question(format!(
                "I found no contact with identifier {id}. Should I look the name up instead?"
            ))
            .with_action(record)),
        }
    }

    fn propose_contact(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        let name = name_from(&request.task, CREATE_CONTACT_FILLER);
        if name.is_empty() {
            return Ok(WorkerReply::question(
                "What is the contact's name? Give it together with any org number or email.",
            ));
        }
        let kind = kind_of(&request.task);
        let org_number = find_org_number(&request.task);
        let email = find_email(&request.task);

        let fingerprint = intent_fingerprint(EntityKind::Contact, &name, 0, "", kind_label(kind));
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "{name} is already registered as {existing}; I have not created a duplicate."
            )));
        }

        let mut new = NewContact::new(name.clone(), kind);
        new.org_number = org_number.clone();
        new.email = email.clone();

        let mut summary = format!("New {}: {name}", kind_label(kind));
        if let Some(org) = &org_number {
            summary.push_str(&format!(", org.nr {org}"));
        }
        if let Some(email) = &email {
            summary.push_str(&format!(", email {email}"));
        }
        summary.push('.');

        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_contact".into(),
            summary,
            inputs: serde_json::json!({ "contact": new }),
            fingerprint,
        }))
    }

    async fn find_product(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        let name = name_from(&request.task, FIND_PRODUCT_FILLER);
        if name.is_empty() {
            return Ok(WorkerReply::question("Which product should I look up?"));
        }
        let matches = match self.core.ledger.search_products(&name).await {
            Ok(matches) => matches,
            Err(err) => return Ok(WorkerReply::text(translate_error(&err))),
        };
        let listed: Vec<serde_json::Value> = matches
            .iter()
            .take(MAX_MATCHES)
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "name": p.name,
                    "unit_price_ore": p.unit_price_ore,
                })
            })
            .collect();
        let record = ActionRecord::new(
            self.id(),
            "search_products",
            ActionOutcome::ok()
                .with_message(format!("{} match(es) for {name}", matches.len()))
                .with_details(serde_json::json!({ "matches": listed })),
        );
        if matches.is_empty() {
            return Ok(WorkerReply::question(format!(
                "I found no product named \"{name}\". Should I register it as a new product?"
            ))
            .with_action(record));
        }
        let mut lines = Vec::new();
        for product in matches.iter().take(MAX_MATCHES) {
            lines.push(format!(
                "- {} ({}): {} excluding VAT",
                product.name,
                product.id,
                vat::format_nok(product.unit_price_ore),
            ));
        }
        Ok(WorkerReply::text(lines.join("\n")).with_action(record))
    }

    fn propose_product(&self, request: &DelegationRequest) -> Result<WorkerReply> {
        let scan = scan_amounts(&request.task);
        let Some(stated) = scan.amounts.first().copied() else {
            return Ok(WorkerReply::question(
                "What does the product cost? Please include the price, for example \"1 200 kr\".",
            ));
        };
        let Some(treatment) = vat::detect_treatment(&request.task) else {
            return Ok(WorkerReply::question(format!(
                "Is {} including or excluding VAT? Reply \"inkl. mva\" or \"eks. mva\".",
                vat::format_nok(stated)
            )));
        };
        let name = leftover_description(&scan, CREATE_PRODUCT_FILLER);
        if name.is_empty() {
            return Ok(WorkerReply::question("What should the product be called?"));
        }
        let rate = VatRate::infer(&name);
        let unit_price_ore = match treatment {
            VatTreatment::Exclusive => stated,
            VatTreatment::Inclusive => vat::net_from_gross(stated, rate),
        };

        let fingerprint =
            intent_fingerprint(EntityKind::Product, &name, unit_price_ore, "", "product");
        if let Some(existing) = duplicate_of(request, &fingerprint) {
            return Ok(WorkerReply::text(format!(
                "The product {name} is already registered as {existing}."
            )));
        }

        let new = NewProduct {
            name: name.clone(),
            unit_price_ore,
            vat_rate: rate,
        };
        Ok(WorkerReply::proposal(ProposedAction {
            worker: self.id(),
            action: "create_product".into(),
            summary: format!(
                "New product: {name}, {} excluding VAT in the {}% band.",
                vat::format_nok(unit_price_ore),
                rate.percent(),
            ),
            inputs: serde_json::json!({ "product": new }),
            fingerprint,
        }))
    }

    async fn run_confirmed(
        &self,
        confirmed: ConfirmedAction,
        request: &DelegationRequest,
    ) -> Result<WorkerReply> {
        match confirmed.action.as_str() {
            "create_contact" => self.run_create_contact(&confirmed, request).await,
            "create_product" => self.run_create_product(&confirmed).await,
            other => Ok(WorkerReply::text(format!(
                "I had nothing pending called \"{other}\"; nothing was changed."
            ))),
        }
    }

    async fn run_create_contact(
        &self,
        confirmed: &ConfirmedAction,
        request: &DelegationRequest,
    ) -> Result<WorkerReply> {
        let new: NewContact = serde_json::from_value(confirmed.inputs["contact"].clone())?;
        if let Some(existing) = duplicate_of(request, &confirmed.fingerprint) {
            return Ok(WorkerReply::text(format!(
                "{} is already registered as {existing}; I have not created a duplicate.",
                new.name
            )));
        }
        match self.core.ledger.create_contact(new.clone()).await {
            Ok(contact) => {
                let record = ActionRecord::new(
                    self.id(),
                    "create_contact",
                    ActionOutcome::ok()
                        .with_message(format!("contact {} created", contact.id))
                        .with_created(EntityKind::Contact, contact.id.clone())
                        .with_completed(true),
                )
                .with_inputs(serde_json::to_value(&new)?)
                .with_fingerprint(confirmed.fingerprint.clone());
                let template = format!(
                    "Registered {} as a {} ({}).",
                    contact.name,
                    kind_label(contact.kind),
                    contact.id,
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
                    "create_contact",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }

    async fn run_create_product(&self, confirmed: &ConfirmedAction) -> Result<WorkerReply> {
        let new: NewProduct = serde_json::from_value(confirmed.inputs["product"].clone())?;
        match self.core.ledger.create_product(new.clone()).await {
            Ok(product) => {
                let record = ActionRecord::new(
                    self.id(),
                    "create_product",
                    ActionOutcome::ok()
                        .with_message(format!("product {} created", product.id))
                        .with_created(EntityKind::Product, product.id.clone())
                        .with_completed(true),
                )
                .with_inputs(serde_json::to_value(&new)?)
                .with_fingerprint(confirmed.fingerprint.clone());
                Ok(WorkerReply::text(format!(
                    "Registered product {} at {} excluding VAT ({}).",
                    product.name,
                    vat::format_nok(product.unit_price_ore),
                    product.id,
                ))
                .with_action(record))
            }
            Err(err) => Ok(WorkerReply::text(translate_error(&err)).with_action(
                ActionRecord::new(
                    self.id(),
                    "create_product",
                    ActionOutcome::failed(err.to_string()),
                ),
            )),
        }
    }
}

#[async_trait]
impl Worker for ContactsWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn capabilities(&self) -> &[WorkerCapability] {
        &[WorkerCapability::CounterpartyCatalog]
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
            "Handling catalog delegation"
        );
        self.core.claim()?;
        let result = self.execute(request).await;
        self.core.release();
        result
    }

    fn system_prompt(&self) -> &str {
        self.core.prompt_or(CONTACTS_SYSTEM_PROMPT)
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }
}
