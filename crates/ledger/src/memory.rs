//! In-memory [`Ledger`] used by tests and local development.
//!
//! Behaves like the real collaborator where it matters: the invoice counter
//! must be initialized before the first invoice, dates are validated, issued
//! documents cannot be deleted, and failures can be injected per call to
//! exercise correction paths.

use parking_lot::Mutex;
use std::collections::VecDeque;

use async_trait::async_trait;

use crate::client::{
    Account, AttachmentTarget, BankTransaction, Contact, CreditNote, Invoice, JournalEntry,
    Ledger, LedgerError, LedgerResult, NewContact, NewCreditNote, NewInvoice, NewJournalEntry,
    NewOffer, NewProduct, NewPurchase, Offer, Product, Purchase,
};
use munin_common::EntityKind;

#[derive(Default)]
struct Inner {
    contacts: Vec<Contact>,
    products: Vec<Product>,
    invoices: Vec<Invoice>,
    credit_notes: Vec<CreditNote>,
    offers: Vec<Offer>,
    purchases: Vec<Purchase>,
    transactions: Vec<BankTransaction>,
    journal: Vec<JournalEntry>,
    accounts: Vec<Account>,
    attachments: Vec<(String, AttachmentTarget)>,
    invoice_payments: Vec<(String, String, i64)>,
    purchase_payments: Vec<(String, String, i64)>,
    invoice_counter: Option<i64>,
    voucher_counter: i64,
    credit_note_counter: i64,
    offer_counter: i64,
    next_id: u64,
    failures: VecDeque<LedgerError>,
    created: Vec<(EntityKind, String)>,
    calls: Vec<&'static str>,
}

pub struct InMemoryLedger {
    inner: Mutex<Inner>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// A ledger ready for use: counter initialized at 1000 and a small
    /// standard chart of accounts seeded.
    pub fn new() -> Self {
        let ledger = Self::with_uninitialized_counter();
        {
            let mut inner = ledger.inner.lock();
            inner.invoice_counter = Some(1000);
        }
        ledger
    }

    /// A ledger where no invoice has ever been created, so the invoice
    /// counter still needs its one-time initialization.
    pub fn with_uninitialized_counter() -> Self {
        let inner = Inner {
            voucher_counter: 1,
            credit_note_counter: 1,
            offer_counter: 100,
            next_id: 1,
            accounts: standard_accounts(),
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Push an error returned by the next ledger call, whichever it is.
    /// Queued errors pop in order, one per call.
    pub fn queue_failure(&self, error: LedgerError) {
        self.inner.lock().failures.push_back(error);
    }

    pub fn seed_contact(&self, name: &str, kind: crate::client::ContactKind) -> Contact {
        let mut inner = self.inner.lock();
        let contact = Contact {
            id: alloc_id(&mut inner, "c"),
            name: name.to_string(),
            kind,
            org_number: None,
            email: None,
        };
        inner.contacts.push(contact.clone());
        contact
    }

    pub fn seed_open_invoice(&self, contact_id: &str, date: &str, total_ore: i64) -> Invoice {
        let mut inner = self.inner.lock();
        let number = inner.invoice_counter.unwrap_or(1000);
        inner.invoice_counter = Some(number + 1);
        let invoice = Invoice {
            id: alloc_id(&mut inner, "inv"),
            invoice_number: number,
            contact_id: contact_id.to_string(),
            date: date.to_string(),
            due_date: None,
            total_ore,
            paid: false,
        };
        inner.invoices.push(invoice.clone());
        invoice
    }

    pub fn seed_unpaid_purchase(&self, description: &str, date: &str, gross_ore: i64) -> Purchase {
        let mut inner = self.inner.lock();
        let purchase = Purchase {
            id: alloc_id(&mut inner, "p"),
            contact_id: None,
            date: date.to_string(),
            description: description.to_string(),
            gross_ore,
            vat_rate: munin_common::vat::VatRate::Standard,
            paid: false,
        };
        inner.purchases.push(purchase.clone());
        purchase
    }

    pub fn seed_transaction(&self, date: &str, amount_ore: i64, description: &str) {
        let mut inner = self.inner.lock();
        let tx = BankTransaction {
            id: alloc_id(&mut inner, "t"),
            date: date.to_string(),
            amount_ore,
            description: description.to_string(),
        };
        inner.transactions.push(tx);
    }

    /// How many entities of this kind have been created through the trait.
    pub fn created_count(&self, kind: EntityKind) -> usize {
        self.inner
            .lock()
            .created
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Every creation through the trait, in order.
    pub fn creations(&self) -> Vec<(EntityKind, String)> {
        self.inner.lock().created.clone()
    }

    /// Targets of every uploaded attachment, in upload order.
    pub fn attachment_links(&self) -> Vec<AttachmentTarget> {
        self.inner
            .lock()
            .attachments
            .iter()
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn invoice(&self, id: &str) -> Option<Invoice> {
        self.inner
            .lock()
            .invoices
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn purchase(&self, id: &str) -> Option<Purchase> {
        self.inner
            .lock()
            .purchases
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    fn begin(&self, op: &'static str) -> LedgerResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(op);
        match inner.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn alloc_id(inner: &mut Inner, prefix: &str) -> String {
    let id = format!("{prefix}-{}", inner.next_id);
    inner.next_id += 1;
    id
}

fn standard_accounts() -> Vec<Account> {
    [
        ("1500", "Kundefordringer"),
        ("1920", "Bankinnskudd"),
        ("2400", "Leverandørgjeld"),
        ("2700", "Utgående merverdiavgift"),
        ("2710", "Inngående merverdiavgift"),
        ("3000", "Salgsinntekt, avgiftspliktig"),
        ("4000", "Varekjøp"),
        ("6800", "Kontorrekvisita"),
        ("7140", "Reisekostnad"),
    ]
    .into_iter()
    .map(|(number, name)| Account {
        number: number.to_string(),
        name: name.to_string(),
    })
    .collect()
}

fn validate_date(date: &str) -> LedgerResult<()> {
    let bytes = date.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && date
            .chars()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit());
    if well_formed {
        let month: u32 = date[5..7].parse().unwrap_or(0);
        let day: u32 = date[8..10].parse().unwrap_or(0);
        if (1..=12).contains(&month) && (1..=31).contains(&day) {
            return Ok(());
        }
    }
    Err(LedgerError::invalid(
        "date",
        format!("expected ISO 8601 (YYYY-MM-DD), got {date}"),
    ))
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn search_contacts(&self, query: &str) -> LedgerResult<Vec<Contact>> {
        self.begin("search_contacts")?;
        let query = query.to_lowercase();
        Ok(self
            .inner
            .lock()
            .contacts
            .iter()
            .filter(|c| c.name.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }

    async fn create_contact(&self, new: NewContact) -> LedgerResult<Contact> {
        self.begin("create_contact")?;
        if new.name.trim().is_empty() {
            return Err(LedgerError::invalid("name", "contact name is required"));
        }
        let mut inner = self.inner.lock();
        let contact = Contact {
            id: alloc_id(&mut inner, "c"),
            name: new.name,
            kind: new.kind,
            org_number: new.org_number,
            email: new.email,
        };
        inner.contacts.push(contact.clone());
        inner
            .created
            .push((EntityKind::Contact, contact.id.clone()));
        Ok(contact)
    }

    async fn search_products(&self, query: &str) -> LedgerResult<Vec<Product>> {
        self.begin("search_products")?;
        let query = query.to_lowercase();
        Ok(self
            .inner
            .lock()
            .products
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }

    async fn create_product(&self, new: NewProduct) -> LedgerResult<Product> {
        self.begin("create_product")?;
        let mut inner = self.inner.lock();
        let product = Product {
            id: alloc_id(&mut inner, "prod"),
            name: new.name,
            unit_price_ore: new.unit_price_ore,
            vat_rate: new.vat_rate,
        };
        inner.products.push(product.clone());
        inner
            .created
            .push((EntityKind::Product, product.id.clone()));
        Ok(product)
    }

    async fn next_invoice_number(&self) -> LedgerResult<i64> {
        self.begin("next_invoice_number")?;
        self.inner
            .lock()
            .invoice_counter
            .ok_or_else(|| LedgerError::MissingPrecondition("invoice counter not initialized".into()))
    }

    async fn init_invoice_counter(&self, first_number: i64) -> LedgerResult<()> {
        self.begin("init_invoice_counter")?;
        let mut inner = self.inner.lock();
        if inner.invoice_counter.is_some() {
            return Err(LedgerError::invalid(
                "first_number",
                "invoice counter is already initialized",
            ));
        }
        inner.invoice_counter = Some(first_number);
        Ok(())
    }

    async fn create_invoice(&self, new: NewInvoice) -> LedgerResult<Invoice> {
        self.begin("create_invoice")?;
        validate_date(&new.date)?;
        if let Some(due) = &new.due_date {
            validate_date(due)?;
        }
        if new.lines.is_empty() {
            return Err(LedgerError::invalid("lines", "invoice needs at least one line"));
        }
        let mut inner = self.inner.lock();
        if !inner.contacts.iter().any(|c| c.id == new.contact_id) {
            return Err(LedgerError::NotFound(format!(
                "contact {} does not exist",
                new.contact_id
            )));
        }
        let number = inner.invoice_counter.ok_or_else(|| {
            LedgerError::MissingPrecondition("invoice counter not initialized".into())
        })?;
        inner.invoice_counter = Some(number + 1);

        let total_ore = new.lines.iter().map(|l| l.gross_ore()).sum();
        let invoice = Invoice {
            id: alloc_id(&mut inner, "inv"),
            invoice_number: number,
            contact_id: new.contact_id,
            date: new.date,
            due_date: new.due_date,
            total_ore,
            paid: false,
        };
        inner.invoices.push(invoice.clone());
        inner
            .created
            .push((EntityKind::Invoice, invoice.id.clone()));
        Ok(invoice)
    }

    async fn list_open_invoices(&self) -> LedgerResult<Vec<Invoice>> {
        self.begin("list_open_invoices")?;
        Ok(self
            .inner
            .lock()
            .invoices
            .iter()
            .filter(|i| !i.paid)
            .cloned()
            .collect())
    }

    async fn register_invoice_payment(
        &self,
        invoice_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.begin("register_invoice_payment")?;
        validate_date(date)?;
        let mut inner = self.inner.lock();
        inner
            .invoice_payments
            .push((invoice_id.to_string(), date.to_string(), amount_ore));
        let paid_total: i64 = inner
            .invoice_payments
            .iter()
            .filter(|(id, _, _)| id == invoice_id)
            .map(|(_, _, amount)| amount)
            .sum();
        let invoice = inner
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id)
            .ok_or_else(|| LedgerError::NotFound(format!("invoice {invoice_id} does not exist")))?;
        if paid_total >= invoice.total_ore {
            invoice.paid = true;
        }
        Ok(())
    }

    async fn create_credit_note(&self, new: NewCreditNote) -> LedgerResult<CreditNote> {
        self.begin("create_credit_note")?;
        validate_date(&new.date)?;
        let mut inner = self.inner.lock();
        let total_ore = inner
            .invoices
            .iter()
            .find(|i| i.id == new.invoice_id)
            .map(|i| i.total_ore)
            .ok_or_else(|| {
                LedgerError::NotFound(format!("invoice {} does not exist", new.invoice_id))
            })?;
        let number = inner.credit_note_counter;
        inner.credit_note_counter += 1;
        let note = CreditNote {
            id: alloc_id(&mut inner, "cn"),
            credit_note_number: number,
            invoice_id: new.invoice_id,
            total_ore,
        };
        inner.credit_notes.push(note.clone());
        inner
            .created
            .push((EntityKind::CreditNote, note.id.clone()));
        Ok(note)
    }

    async fn create_offer(&self, new: NewOffer) -> LedgerResult<Offer> {
        self.begin("create_offer")?;
        validate_date(&new.date)?;
        if new.lines.is_empty() {
            return Err(LedgerError::invalid("lines", "offer needs at least one line"));
        }
        let mut inner = self.inner.lock();
        if !inner.contacts.iter().any(|c| c.id == new.contact_id) {
            return Err(LedgerError::NotFound(format!(
                "contact {} does not exist",
                new.contact_id
            )));
        }
        let number = inner.offer_counter;
        inner.offer_counter += 1;
        let total_ore = new.lines.iter().map(|l| l.gross_ore()).sum();
        let offer = Offer {
            id: alloc_id(&mut inner, "o"),
            offer_number: number,
            contact_id: new.contact_id,
            date: new.date,
            total_ore,
            lines: new.lines,
        };
        inner.offers.push(offer.clone());
        inner.created.push((EntityKind::Offer, offer.id.clone()));
        Ok(offer)
    }

    async fn list_offers(&self) -> LedgerResult<Vec<Offer>> {
        self.begin("list_offers")?;
        Ok(self.inner.lock().offers.clone())
    }

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase> {
        self.begin("create_purchase")?;
        validate_date(&new.date)?;
        if new.gross_ore <= 0 {
            return Err(LedgerError::invalid(
                "gross_ore",
                "amount must be positive",
            ));
        }
        let mut inner = self.inner.lock();
        if let Some(contact_id) = &new.contact_id {
            if !inner.contacts.iter().any(|c| &c.id == contact_id) {
                return Err(LedgerError::StaleReference(format!(
                    "contact {contact_id} does not exist"
                )));
            }
        }
        let purchase = Purchase {
            id: alloc_id(&mut inner, "p"),
            contact_id: new.contact_id,
            date: new.date,
            description: new.description,
            gross_ore: new.gross_ore,
            vat_rate: new.vat_rate,
            paid: new.paid,
        };
        inner.purchases.push(purchase.clone());
        inner
            .created
            .push((EntityKind::Purchase, purchase.id.clone()));
        Ok(purchase)
    }

    async fn list_purchases(&self) -> LedgerResult<Vec<Purchase>> {
        self.begin("list_purchases")?;
        Ok(self.inner.lock().purchases.clone())
    }

    async fn register_purchase_payment(
        &self,
        purchase_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.begin("register_purchase_payment")?;
        validate_date(date)?;
        let mut inner = self.inner.lock();
        inner
            .purchase_payments
            .push((purchase_id.to_string(), date.to_string(), amount_ore));
        let purchase = inner
            .purchases
            .iter_mut()
            .find(|p| p.id == purchase_id)
            .ok_or_else(|| {
                LedgerError::NotFound(format!("purchase {purchase_id} does not exist"))
            })?;
        purchase.paid = true;
        Ok(())
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<BankTransaction>> {
        self.begin("list_transactions")?;
        Ok(self.inner.lock().transactions.clone())
    }

    async fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        self.begin("list_accounts")?;
        Ok(self.inner.lock().accounts.clone())
    }

    async fn create_journal_entry(&self, new: NewJournalEntry) -> LedgerResult<JournalEntry> {
        self.begin("create_journal_entry")?;
        validate_date(&new.date)?;
        if !new.is_balanced() {
            return Err(LedgerError::invalid(
                "lines",
                "debit and credit totals must match",
            ));
        }
        let mut inner = self.inner.lock();
        for line in &new.lines {
            if !inner.accounts.iter().any(|a| a.number == line.account) {
                return Err(LedgerError::invalid(
                    "account",
                    format!("unknown account {}", line.account),
                ));
            }
        }
        let number = inner.voucher_counter;
        inner.voucher_counter += 1;
        let entry = JournalEntry {
            id: alloc_id(&mut inner, "j"),
            voucher_number: number,
            date: new.date,
            description: new.description,
            lines: new.lines,
        };
        inner.journal.push(entry.clone());
        inner
            .created
            .push((EntityKind::JournalEntry, entry.id.clone()));
        Ok(entry)
    }

    async fn upload_attachment(
        &self,
        target: AttachmentTarget,
        _filename: &str,
        _media_type: &str,
        _bytes: Vec<u8>,
    ) -> LedgerResult<String> {
        self.begin("upload_attachment")?;
        let mut inner = self.inner.lock();
        let exists = match target.kind {
            EntityKind::Invoice => inner.invoices.iter().any(|i| i.id == target.id),
            EntityKind::CreditNote => inner.credit_notes.iter().any(|n| n.id == target.id),
            EntityKind::Offer => inner.offers.iter().any(|o| o.id == target.id),
            EntityKind::Purchase => inner.purchases.iter().any(|p| p.id == target.id),
            EntityKind::Contact => inner.contacts.iter().any(|c| c.id == target.id),
            EntityKind::JournalEntry => inner.journal.iter().any(|j| j.id == target.id),
            _ => false,
        };
        if !exists {
            return Err(LedgerError::StaleReference(format!(
                "{} {} does not exist",
                target.kind, target.id
            )));
        }
        let id = alloc_id(&mut inner, "a");
        inner.attachments.push((id.clone(), target));
        inner.created.push((EntityKind::Attachment, id.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ContactKind, DocumentLine};
    use munin_common::vat::VatRate;

    fn invoice_for(contact_id: &str) -> NewInvoice {
        NewInvoice {
            contact_id: contact_id.to_string(),
            date: "2026-08-20".into(),
            due_date: None,
            lines: vec![DocumentLine {
                description: "Konsulenttimer".into(),
                quantity: 1,
                unit_price_ore: 100_000,
                vat_rate: VatRate::Standard,
            }],
        }
    }

    #[tokio::test]
    async fn test_invoice_requires_initialized_counter() {
        let ledger = InMemoryLedger::with_uninitialized_counter();
        let contact = ledger.seed_contact("Kari Nordmann", ContactKind::Customer);

        let err = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap_err();
        assert!(matches!(err, LedgerError::MissingPrecondition(_)));

        ledger.init_invoice_counter(1000).await.unwrap();
        let invoice = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap();
        assert_eq!(invoice.invoice_number, 1000);
    }

    #[tokio::test]
    async fn test_invoice_numbers_are_sequential() {
        let ledger = InMemoryLedger::new();
        let contact = ledger.seed_contact("Kari Nordmann", ContactKind::Customer);

        let first = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap();
        let second = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap();
        assert_eq!(second.invoice_number, first.invoice_number + 1);
    }

    #[tokio::test]
    async fn test_non_iso_date_is_rejected_with_field() {
        let ledger = InMemoryLedger::new();
        let contact = ledger.seed_contact("Kari Nordmann", ContactKind::Customer);

        let mut new = invoice_for(&contact.id);
        new.date = "20.08.2026".into();
        let err = ledger.create_invoice(new).await.unwrap_err();
        assert!(matches!(err, LedgerError::Invalid { ref field, .. } if field == "date"));
    }

    #[tokio::test]
    async fn test_full_payment_closes_invoice() {
        let ledger = InMemoryLedger::new();
        let contact = ledger.seed_contact("Kari Nordmann", ContactKind::Customer);
        let invoice = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap();

        ledger
            .register_invoice_payment(&invoice.id, "2026-08-25", invoice.total_ore)
            .await
            .unwrap();

        assert!(ledger.invoice(&invoice.id).unwrap().paid);
        assert!(ledger.list_open_invoices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_failure_pops_once() {
        let ledger = InMemoryLedger::new();
        ledger.queue_failure(LedgerError::Transport("socket closed".into()));

        assert!(ledger.list_accounts().await.is_err());
        assert!(ledger.list_accounts().await.is_ok());
    }

    #[tokio::test]
    async fn test_unbalanced_journal_entry_rejected() {
        let ledger = InMemoryLedger::new();
        let entry = NewJournalEntry {
            date: "2026-08-20".into(),
            description: "Omføring".into(),
            lines: vec![crate::client::JournalLine {
                account: "1920".into(),
                debit_ore: 5000,
                credit_ore: 0,
            }],
        };
        let err = ledger.create_journal_entry(entry).await.unwrap_err();
        assert!(matches!(err, LedgerError::Invalid { ref field, .. } if field == "lines"));
    }

    #[tokio::test]
    async fn test_unknown_account_rejected() {
        let ledger = InMemoryLedger::new();
        let entry = NewJournalEntry {
            date: "2026-08-20".into(),
            description: "Omføring".into(),
            lines: vec![
                crate::client::JournalLine {
                    account: "9999".into(),
                    debit_ore: 5000,
                    credit_ore: 0,
                },
                crate::client::JournalLine {
                    account: "1920".into(),
                    debit_ore: 0,
                    credit_ore: 5000,
                },
            ],
        };
        let err = ledger.create_journal_entry(entry).await.unwrap_err();
        assert!(matches!(err, LedgerError::Invalid { ref field, .. } if field == "account"));
    }

    #[tokio::test]
    async fn test_attachment_to_missing_target_is_stale() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .upload_attachment(
                AttachmentTarget::new(EntityKind::Purchase, "p-404"),
                "kvittering.pdf",
                "application/pdf",
                vec![1, 2, 3],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StaleReference(_)));
    }

    #[tokio::test]
    async fn test_attachment_link_recorded() {
        let ledger = InMemoryLedger::new();
        let purchase = ledger.seed_unpaid_purchase("Taxi", "2026-08-20", 25_000);

        let id = ledger
            .upload_attachment(
                AttachmentTarget::new(EntityKind::Purchase, purchase.id.clone()),
                "kvittering.pdf",
                "application/pdf",
                vec![1, 2, 3],
            )
            .await
            .unwrap();

        assert!(id.starts_with("a-"));
        assert_eq!(
            ledger.attachment_links(),
            vec![AttachmentTarget::new(EntityKind::Purchase, purchase.id)]
        );
        assert_eq!(ledger.created_count(EntityKind::Attachment), 1);
    }

    #[tokio::test]
    async fn test_purchase_payment_marks_paid() {
        let ledger = InMemoryLedger::new();
        let purchase = ledger.seed_unpaid_purchase("Taxi", "2026-08-20", 25_000);

        ledger
            .register_purchase_payment(&purchase.id, "2026-08-21", 25_000)
            .await
            .unwrap();
        assert!(ledger.purchase(&purchase.id).unwrap().paid);
    }

    #[tokio::test]
    async fn test_credit_note_reverses_full_invoice_amount() {
        let ledger = InMemoryLedger::new();
        let contact = ledger.seed_contact("Kari Nordmann", ContactKind::Customer);
        let invoice = ledger.create_invoice(invoice_for(&contact.id)).await.unwrap();

        let note = ledger
            .create_credit_note(NewCreditNote {
                invoice_id: invoice.id.clone(),
                date: "2026-08-21".into(),
                reason: "feil beløp".into(),
            })
            .await
            .unwrap();

        assert_eq!(note.total_ore, invoice.total_ore);
        assert_eq!(ledger.created_count(EntityKind::CreditNote), 1);
    }
}
