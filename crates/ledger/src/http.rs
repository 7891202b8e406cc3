//! HTTP implementation of the [`Ledger`] trait.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{
    Account, AttachmentTarget, BankTransaction, Contact, CreditNote, Invoice, JournalEntry,
    Ledger, LedgerError, LedgerResult, NewContact, NewCreditNote, NewInvoice, NewJournalEntry,
    NewOffer, NewProduct, NewPurchase, Offer, Product, Purchase,
};

pub struct HttpLedgerClient {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct ApiError {
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct AttachmentUpload<'a> {
    target_kind: &'a str,
    target_id: &'a str,
    filename: &'a str,
    media_type: &'a str,
    data: String,
}

#[derive(serde::Deserialize)]
struct AttachmentCreated {
    id: String,
}

#[derive(serde::Deserialize)]
struct CounterState {
    next_number: i64,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> LedgerResult<reqwest::Response> {
        let response = builder
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("ledger request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            429 => LedgerError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(1000),
            },
            400 | 422 => {
                let parsed: Option<ApiError> = serde_json::from_str(&body).ok();
                let (field, message) = match parsed {
                    Some(e) => (
                        e.field.unwrap_or_else(|| "request".to_string()),
                        e.message.unwrap_or(body),
                    ),
                    None => ("request".to_string(), body),
                };
                LedgerError::Invalid { field, message }
            }
            404 => LedgerError::NotFound(body),
            409 => LedgerError::StaleReference(body),
            412 => LedgerError::MissingPrecondition(body),
            405 | 501 => LedgerError::Unsupported(body),
            _ => LedgerError::Transport(format!("ledger API error {status}: {body}")),
        })
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> LedgerResult<R> {
        let response = self.send(self.http_client.get(self.url(path))).await?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Transport(format!("failed to parse ledger response: {e}")))
    }

    async fn get_query<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> LedgerResult<R> {
        let response = self
            .send(self.http_client.get(self.url(path)).query(query))
            .await?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Transport(format!("failed to parse ledger response: {e}")))
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> LedgerResult<R> {
        let response = self
            .send(self.http_client.post(self.url(path)).json(body))
            .await?;
        response
            .json()
            .await
            .map_err(|e| LedgerError::Transport(format!("failed to parse ledger response: {e}")))
    }

    async fn post_no_content<B: Serialize + Sync>(&self, path: &str, body: &B) -> LedgerResult<()> {
        self.send(self.http_client.post(self.url(path)).json(body))
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PaymentBody<'a> {
    date: &'a str,
    amount_ore: i64,
}

#[derive(Serialize)]
struct CounterInit {
    first_number: i64,
}

#[async_trait]
impl Ledger for HttpLedgerClient {
    async fn search_contacts(&self, query: &str) -> LedgerResult<Vec<Contact>> {
        self.get_query("contacts", &[("query", query)]).await
    }

    async fn create_contact(&self, new: NewContact) -> LedgerResult<Contact> {
        self.post("contacts", &new).await
    }

    async fn search_products(&self, query: &str) -> LedgerResult<Vec<Product>> {
        self.get_query("products", &[("query", query)]).await
    }

    async fn create_product(&self, new: NewProduct) -> LedgerResult<Product> {
        self.post("products", &new).await
    }

    async fn next_invoice_number(&self) -> LedgerResult<i64> {
        let state: CounterState = self.get("invoices/counter").await?;
        Ok(state.next_number)
    }

    async fn init_invoice_counter(&self, first_number: i64) -> LedgerResult<()> {
        self.post_no_content("invoices/counter", &CounterInit { first_number })
            .await
    }

    async fn create_invoice(&self, new: NewInvoice) -> LedgerResult<Invoice> {
        self.post("invoices", &new).await
    }

    async fn list_open_invoices(&self) -> LedgerResult<Vec<Invoice>> {
        self.get_query("invoices", &[("state", "open")]).await
    }

    async fn register_invoice_payment(
        &self,
        invoice_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.post_no_content(
            &format!("invoices/{invoice_id}/payments"),
            &PaymentBody { date, amount_ore },
        )
        .await
    }

    async fn create_credit_note(&self, new: NewCreditNote) -> LedgerResult<CreditNote> {
        self.post("credit_notes", &new).await
    }

    async fn create_offer(&self, new: NewOffer) -> LedgerResult<Offer> {
        self.post("offers", &new).await
    }

    async fn list_offers(&self) -> LedgerResult<Vec<Offer>> {
        self.get("offers").await
    }

    async fn create_purchase(&self, new: NewPurchase) -> LedgerResult<Purchase> {
        self.post("purchases", &new).await
    }

    async fn list_purchases(&self) -> LedgerResult<Vec<Purchase>> {
        self.get("purchases").await
    }

    async fn register_purchase_payment(
        &self,
        purchase_id: &str,
        date: &str,
        amount_ore: i64,
    ) -> LedgerResult<()> {
        self.post_no_content(
            &format!("purchases/{purchase_id}/payments"),
            &PaymentBody { date, amount_ore },
        )
        .await
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<BankTransaction>> {
        self.get("bank/transactions").await
    }

    async fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        self.get("accounts").await
    }

    async fn create_journal_entry(&self, new: NewJournalEntry) -> LedgerResult<JournalEntry> {
        self.post("journal_entries", &new).await
    }

    async fn upload_attachment(
        &self,
        target: AttachmentTarget,
        filename: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> LedgerResult<String> {
        let body = AttachmentUpload {
            target_kind: target.kind.as_str(),
            target_id: &target.id,
            filename,
            media_type,
            data: STANDARD.encode(bytes),
        };
        let created: AttachmentCreated = self.post("attachments", &body).await?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = HttpLedgerClient::new("https://ledger.example.no/api/", "key");
        assert_eq!(
            client.url("invoices/counter"),
            "https://ledger.example.no/api/invoices/counter"
        );
    }

    #[test]
    fn test_attachment_upload_body_shape() {
        let body = AttachmentUpload {
            target_kind: "purchase",
            target_id: "p-12",
            filename: "kvittering.pdf",
            media_type: "application/pdf",
            data: STANDARD.encode(b"bytes"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["target_kind"], "purchase");
        assert_eq!(json["target_id"], "p-12");
        assert_eq!(json["data"], STANDARD.encode(b"bytes"));
    }
}
