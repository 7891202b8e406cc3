//! Domain specialist workers for the Munin bookkeeping assistant.
//!
//! This crate provides one worker per accounting domain:
//!
//! - **Sales Worker**: invoices, credit notes and invoice payments
//! - **Purchases Worker**: expenses, receipts and purchase payments
//! - **Contacts Worker**: the customer/supplier register and the product catalog
//! - **Offers Worker**: quotations and their conversion into invoices
//! - **Banking Worker**: bank transactions and payment matching
//! - **Journal Worker**: manual postings between ledger accounts
//!
//! # Architecture
//!
//! Each worker holds the same building blocks: a ledger handle for the
//! operations of its domain, an optional LLM client for phrasing, and a
//! busy flag so a worker handles one delegation at a time. Side effects
//! are never taken directly from free text; a worker first proposes the
//! action and performs it only when the delegation carries the user's
//! confirmation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DELEGATION CHANNEL                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────┐ ┌─────────┐ ┌────────┐ ┌──────┐ ┌──────┐ ┌─────┐ │
//! │  │ Sales │ │Purchases│ │Contacts│ │Offers│ │ Bank │ │Jrnl │ │
//! │  └───┬───┘ └────┬────┘ └───┬────┘ └──┬───┘ └──┬───┘ └──┬──┘ │
//! │      │          │          │         │        │        │    │
//! │      ▼          ▼          ▼         ▼        ▼        ▼    │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                  Ledger (accounting API)               │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod banking;
pub mod contacts;
pub mod journal;
pub mod offers;
pub mod purchases;
pub mod sales;

mod protocol;

pub use banking::BankingWorker;
pub use contacts::ContactsWorker;
pub use journal::JournalWorker;
pub use offers::OffersWorker;
pub use purchases::PurchasesWorker;
pub use sales::SalesWorker;

use munin_common::Worker;
use munin_ledger::Ledger;
use munin_llm::LlmClient;
use std::sync::Arc;

/// All six workers with their default configurations, sharing one ledger
/// and, when given, one LLM client.
pub fn standard_workers(
    ledger: Arc<dyn Ledger>,
    llm: Option<Arc<dyn LlmClient>>,
) -> Vec<Arc<dyn Worker>> {
    let sales = SalesWorker::with_default_config(ledger.clone());
    let purchases = PurchasesWorker::with_default_config(ledger.clone());
    let contacts = ContactsWorker::with_default_config(ledger.clone());
    let offers = OffersWorker::with_default_config(ledger.clone());
    let banking = BankingWorker::with_default_config(ledger.clone());
    let journal = JournalWorker::with_default_config(ledger);

    match llm {
        Some(client) => vec![
            Arc::new(sales.with_llm(client.clone())),
            Arc::new(purchases.with_llm(client.clone())),
            Arc::new(contacts.with_llm(client.clone())),
            Arc::new(offers.with_llm(client.clone())),
            Arc::new(banking.with_llm(client.clone())),
            Arc::new(journal.with_llm(client)),
        ],
        None => vec![
            Arc::new(sales),
            Arc::new(purchases),
            Arc::new(contacts),
            Arc::new(offers),
            Arc::new(banking),
            Arc::new(journal),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use munin_common::WorkerId;
    use munin_ledger::InMemoryLedger;

    #[test]
    fn test_standard_workers_covers_every_domain() {
        let ledger = Arc::new(InMemoryLedger::new());
        let workers = standard_workers(ledger, None);

        let ids: Vec<WorkerId> = workers.iter().map(|w| w.id()).collect();
        assert_eq!(
            ids,
            vec![
                WorkerId::Sales,
                WorkerId::Purchases,
                WorkerId::Contacts,
                WorkerId::Offers,
                WorkerId::Banking,
                WorkerId::Journal,
            ]
        );
        assert!(workers.iter().all(|w| w.is_available()));
    }
}
