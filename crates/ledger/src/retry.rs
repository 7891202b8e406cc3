//! Retry decorator for transient ledger failures.
//!
//! Only rate limits and transport errors are retried; structured failures
//! like `Invalid` or `StaleReference` need a corrected request, which is the
//! worker's job, not this layer's.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

use async_trait::async_trait;

use crate::client::{
    Account, AttachmentTarget, BankTransaction, Contact, CreditNote, Invoice, JournalEntry,
    Ledger, LedgerError, LedgerResult, NewContact, NewCreditNote, NewInvoice, NewJournalEntry,
    NewOffer, NewProduct, NewPurchase, Offer, Product, Purchase,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        // The whole ladder (400, 800, 1600 ms plus jitter) has to fit
        // inside one delegation timeout.
        Self {
            max_retries: 3,
            initial_delay_ms: 400,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

pub struct RetryingLedger<T: Ledger> {
    inner: T,
    config: RetryConfig,
}

impl<T: Ledger> RetryingLedger<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * rand_jitter(attempt)) as u64;
        let delay = (base as u64).saturating_add(jitter);
        delay.min(self.config.max_delay_ms)
    }

    async fn run<F, Fut, R>(&self, op: &'static str, call: F) -> LedgerResult<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = LedgerResult<R>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt == self.config.max_retries || !e.is_transient() {
                        return Err(e);
                    }

                    let delay = match &e {
                        LedgerError::RateLimited { retry_after_ms } => *retry_after_ms,
                        _ => self.compute_delay(attempt),
                    };

                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay,
                        error = %e,
                        "Retrying ledger call"
                    );

                    tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap())
    }
}

/// Deterministic jitter derived from the attempt number.
fn rand_jitter(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

#[async_trait]
impl<T: Ledger> Ledger for RetryingLedger<T> {
    async fn search_contacts(&self, query: &str) -> LedgerResult<Vec<Contact>> {
        self.run("search_contacts", || self.inner.search_contacts(query))
            .await
    }

    async fn create_contact(&self, new: NewContact) -> LedgerResult<Contact> {
        self.run("create_contact", || self.inner.create_contact(new.clone()))
            .await
    }

    async fn search_products(&self, query: &str) -> LedgerResult<Vec<Product>> {
        self.run("search_products", || self.inner.search_products(query))
            .await
    }

    async fn create_product(&self, new: NewProduct) -> LedgerResult<Product> {
        self.run("create_product", || self.inner.create_product(new.clone()))
            .await
    }

    async fn next_invoice_number(&self) -> LedgerResult<i64> {
        self.run("next_invoice_number", || self.inner.next_invoice_number())
            .await
    }

    async fn init_invoice_counter(&self, first_number: i64) -> LedgerResult<()> {
        self.run("init_invoice_counter", || {
            self.inner.init_invoice_counter(first_number)
        })
        .await
    }

    async fn create_invoice(&self, new: NewInvoice) -> LedgerResult<Invoice> {
        self.run("create_invoice", || self.inner.create_invoice(new.clone()))
            .await
    }

    async fn list_open_invoices(&self) -> LedgerResult<Vec<Invoice>> {
        self.run("list_open_invoices", || self.inner.list_open_invoices())
            .await
    }

    async fn register_invoice_payment(
        &self,
        invoice_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.run("register_invoice_payment", || {
            self.inner
                .register_invoice_payment(invoice_id, date, amount_ore)
        })
        .await
    }

    async fn create_credit_note(&self, new: NewCreditNote) -> LedgerResult<CreditNote> {
        self.run("create_credit_note", || {
            self.inner.create_credit_note(new.clone())
        })
        .await
    }

    async fn create_offer(&self, new: NewOffer) -> LedgerResult<Offer> {
        self.run("create_offer", || self.inner.create_offer(new.clone()))
            .await
    }

    async fn list_offers(&self) -> LedgerResult<Vec<Offer>> {
        self.run("list_offers", || self.inner.list_offers()).await
    }

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase> {
        self.run("create_purchase", || {
            self.inner.create_purchase(new.clone())
        })
        .await
    }

    async fn list_purchases(&self) -> LedgerResult<Vec<Purchase>> {
        self.run("list_purchases", || self.inner.list_purchases())
            .await
    }

    async fn register_purchase_payment(
        &self,
        purchase_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.run("register_purchase_payment", || {
            self.inner
                .register_purchase_payment(purchase_id, date, amount_ore)
        })
        .await
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<BankTransaction>> {
        self.run("list_transactions", || self.inner.list_transactions())
            .await
    }

    async fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        self.run("list_accounts", || self.inner.list_accounts()).await
    }

    async fn create_journal_entry(&self, new: NewJournalEntry) -> LedgerResult<JournalEntry> {
        self.run("create_journal_entry", || {
            self.inner.create_journal_entry(new.clone())
        })
        .await
    }

    async fn upload_attachment(
        &self,
        target: AttachmentTarget,
        filename: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> LedgerResult<String> {
        self.run("upload_attachment", || {
            self.inner
                .upload_attachment(target.clone(), filename, media_type, bytes.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLedger;

    #[test]
    fn test_default_retry_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 400);
        assert_eq!(config.max_delay_ms, 5_000);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_compute_delay_respects_max() {
        let ledger = RetryingLedger {
            inner: InMemoryLedger::new(),
            config: RetryConfig {
                max_retries: 4,
                initial_delay_ms: 300,
                max_delay_ms: 1500,
                backoff_multiplier: 8.0,
            },
        };
        assert!(ledger.compute_delay(4) <= 1500);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_once_then_succeeds() {
        let inner = InMemoryLedger::new();
        inner.queue_failure(LedgerError::RateLimited { retry_after_ms: 5 });

        let ledger = RetryingLedger::new(inner, RetryConfig::default());
        let accounts = ledger.list_accounts().await.unwrap();
        assert!(!accounts.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_is_not_retried() {
        let inner = InMemoryLedger::new();
        inner.queue_failure(LedgerError::invalid("date", "expected ISO 8601"));

        let ledger = RetryingLedger::new(inner, RetryConfig::default());
        let err = ledger.list_accounts().await.unwrap_err();
        assert_eq!(err, LedgerError::invalid("date", "expected ISO 8601"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let inner = InMemoryLedger::new();
        for _ in 0..4 {
            inner.queue_failure(LedgerError::Transport("connection reset".into()));
        }

        let ledger = RetryingLedger::new(
            inner,
            RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
        );
        let err = ledger.list_accounts().await.unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)));
    }
}
