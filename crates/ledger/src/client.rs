//! The ledger collaborator interface.
//!
//! Every side effect a worker performs goes through the [`Ledger`] trait.
//! Errors carry enough structure for callers to pick a correction strategy
//! instead of pattern-matching on message strings.

use async_trait::async_trait;
use munin_common::EntityKind;
use munin_common::vat::VatRate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes of the ledger collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("missing precondition: {0}")]
    MissingPrecondition(String),

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        LedgerError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Transient failures worth retrying without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::RateLimited { .. } | LedgerError::Transport(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Customer,
    Supplier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub kind: ContactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub kind: ContactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl NewContact {
    pub fn new(name: impl Into<String>, kind: ContactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            org_number: None,
            email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub unit_price_ore: i64,
    pub vat_rate: VatRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub unit_price_ore: i64,
    pub vat_rate: VatRate,
}

/// One invoice or offer line. Unit prices are net of VAT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentLine {
    pub description: String,
    pub quantity: u32,
    pub unit_price_ore: i64,
    pub vat_rate: VatRate,
}

impl DocumentLine {
    pub fn gross_ore(&self) -> i64 {
        munin_common::vat::gross_from_net(self.unit_price_ore * self.quantity as i64, self.vat_rate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub contact_id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub invoice_number: i64,
    pub contact_id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub total_ore: i64,
    #[serde(default)]
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCreditNote {
    pub invoice_id: String,
    pub date: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditNote {
    pub id: String,
    pub credit_note_number: i64,
    pub invoice_id: String,
    pub total_ore: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOffer {
    pub contact_id: String,
    pub date: String,
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub offer_number: i64,
    pub contact_id: String,
    pub date: String,
    pub total_ore: i64,
    /// Carried so an accepted offer can be turned into an invoice
    #[serde(default)]
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPurchase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub date: String,
    pub description: String,
    /// VAT-inclusive amount
    pub gross_ore: i64,
    pub vat_rate: VatRate,
    /// True when already settled from the bank account
    #[serde(default)]
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub date: String,
    pub description: String,
    pub gross_ore: i64,
    pub vat_rate: VatRate,
    #[serde(default)]
    pub paid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: String,
    pub date: String,
    /// Positive for money in, negative for money out
    pub amount_ore: i64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub number: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub account: String,
    pub debit_ore: i64,
    pub credit_ore: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJournalEntry {
    pub date: String,
    pub description: String,
    pub lines: Vec<JournalLine>,
}

impl NewJournalEntry {
    pub fn is_balanced(&self) -> bool {
        let debit: i64 = self.lines.iter().map(|l| l.debit_ore).sum();
        let credit: i64 = self.lines.iter().map(|l| l.credit_ore).sum();
        debit == credit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub voucher_number: i64,
    pub date: String,
    pub description: String,
    pub lines: Vec<JournalLine>,
}

/// Which entity an attachment should be linked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTarget {
    pub kind: EntityKind,
    pub id: String,
}

impl AttachmentTarget {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// The full ledger surface workers act through.
///
/// There is deliberately no delete operation anywhere on this trait; issued
/// documents are immutable and get reversed with a credit note instead.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn search_contacts(&self, query: &str) -> LedgerResult<Vec<Contact>>;
    async fn create_contact(&self, new: NewContact) -> LedgerResult<Contact>;

    async fn search_products(&self, query: &str) -> LedgerResult<Vec<Product>>;
    async fn create_product(&self, new: NewProduct) -> LedgerResult<Product>;

    /// Peek at the number the next invoice will get.
    async fn next_invoice_number(&self) -> LedgerResult<i64>;

    /// One-time setup of the invoice number sequence. Required before the
    /// first invoice can be created.
    async fn init_invoice_counter(&self, first_number: i64) -> LedgerResult<()>;

    async fn create_invoice(&self, new: NewInvoice) -> LedgerResult<Invoice>;
    async fn list_open_invoices(&self) -> LedgerResult<Vec<Invoice>>;
    async fn register_invoice_payment(
        &self,
        invoice_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()>;

    async fn create_credit_note(&self, new: NewCreditNote) -> LedgerResult<CreditNote>;

    async fn create_offer(&self, new: NewOffer) -> LedgerResult<Offer>;
    async fn list_offers(&self) -> LedgerResult<Vec<Offer>>;

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase>;
    async fn list_purchases(&self) -> LedgerResult<Vec<Purchase>>;
    async fn register_purchase_payment(
        &self,
        purchase_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()>;

    async fn list_transactions(&self) -> LedgerResult<Vec<BankTransaction>>;

    async fn list_accounts(&self) -> LedgerResult<Vec<Account>>;
    async fn create_journal_entry(&self, new: NewJournalEntry) -> LedgerResult<JournalEntry>;

    /// Upload a file and link it to an existing entity. Returns the
    /// attachment id.
    async fn upload_attachment(
        &self,
        target: AttachmentTarget,
        filename: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> LedgerResult<String>;
}
