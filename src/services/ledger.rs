//! Ledger collaborator: submits dataset transactions and reports whether
//! they were confirmed or reverted.

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger refused the transaction (revert, insufficient funds,
    /// denied signature).
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("no confirmation within {0:?}")]
    Timeout(Duration),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Proof of a confirmed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub tx_hash: String,
}

/// On-chain registration of a paid dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasetTx {
    pub dataset_id: i64,
    pub title: String,
    pub description: String,
    /// Wei, serialised as a decimal string: it does not fit a JSON number.
    #[serde(with = "wei_string")]
    pub price_wei: u128,
    pub file_size: u64,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit_create_transaction(&self, tx: &CreateDatasetTx) -> LedgerResult<LedgerReceipt>;

    /// Forced removal of a dataset's ledger entry.
    async fn submit_removal_transaction(&self, dataset_id: i64) -> LedgerResult<LedgerReceipt>;
}

/// Run a ledger call with an upper bound on how long confirmation may take.
pub async fn with_deadline<F>(deadline: Duration, call: F) -> LedgerResult<LedgerReceipt>
where
    F: Future<Output = LedgerResult<LedgerReceipt>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .unwrap_or(Err(LedgerError::Timeout(deadline)))
}

/// Ledger gateway spoken to over HTTP/JSON.
///
/// `2xx {"txHash": ..}` is a confirmation; any other status is a revert
/// whose reason is the body's `error` field.
#[derive(Clone)]
pub struct HttpLedger {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct GatewayError {
    error: String,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("invalid ledger URL `{}`: {}", base_url, e))?;
        // Url::join drops the last segment without a trailing slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> LedgerResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| LedgerError::Unavailable(format!("bad ledger path `{}`: {}", path, e)))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> LedgerResult<LedgerReceipt> {
        let response = req
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let reason = serde_json::from_str::<GatewayError>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("{} {}", status, body.trim()));
            return Err(LedgerError::Reverted(reason));
        }
        serde_json::from_str(&body)
            .map_err(|e| LedgerError::Unavailable(format!("malformed ledger receipt: {}", e)))
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn submit_create_transaction(&self, tx: &CreateDatasetTx) -> LedgerResult<LedgerReceipt> {
        let url = self.url("datasets")?;
        debug!(dataset_id = tx.dataset_id, "submitting ledger create");
        self.send(self.http.post(url).json(tx)).await
    }

    async fn submit_removal_transaction(&self, dataset_id: i64) -> LedgerResult<LedgerReceipt> {
        let url = self.url(&format!("datasets/{}/forced-removal", dataset_id))?;
        debug!(dataset_id, "submitting ledger forced removal");
        self.send(self.http.post(url)).await
    }
}

mod wei_string {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }
}
