pub mod client;
pub mod config;
pub mod http;
pub mod memory;
pub mod retry;

pub use client::{
    Account, AttachmentTarget, BankTransaction, Contact, ContactKind, CreditNote, DocumentLine,
    Invoice, JournalEntry, JournalLine, Ledger, LedgerError, LedgerResult, NewContact,
    NewCreditNote, NewInvoice, NewJournalEntry, NewOffer, NewProduct, NewPurchase, Offer, Product,
    Purchase,
};
pub use config::{LedgerConfig, build_ledger};
pub use http::HttpLedgerClient;
pub use memory::InMemoryLedger;
pub use retry::{RetryConfig, RetryingLedger};
