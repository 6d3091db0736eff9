//! HTTP Ledger Client
//!
//! Talks to a JSON ledger gateway that fronts the blockchain:
//!
//! - `POST {base}/roots` `{root, idempotency_key}` -> `{tx_ref}`
//! - `GET {base}/roots/{root}` -> `{tx_ref}` or 404
//! - `GET {base}/transactions/{tx_ref}` -> `{status, block_height?, reason?}`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::anchor::client::{LedgerClient, LedgerStatus};
use crate::audit::hash::Digest;
use crate::error::AnchorError;

#[derive(Debug, Serialize)]
struct SubmitRootRequest<'a> {
    root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitRootResponse {
    tx_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum GatewayStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    status: GatewayStatus,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    reason: Option<String>,
}

/// Ledger gateway client over HTTP
pub struct HttpLedgerClient {
    base_url: String,
    http_client: Client,
    idempotency_keys: bool,
}

impl HttpLedgerClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        idempotency_keys: bool,
    ) -> Result<Self, AnchorError> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AnchorError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            idempotency_keys,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn error_from_response(response: Response) -> AnchorError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{} {}", status, body.trim());

        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            AnchorError::SubmissionTimeout(detail)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            AnchorError::LedgerUnavailable(detail)
        } else {
            AnchorError::SubmissionRejected(detail)
        }
    }
}

fn transport_error(err: reqwest::Error) -> AnchorError {
    if err.is_timeout() {
        AnchorError::SubmissionTimeout(err.to_string())
    } else {
        AnchorError::LedgerUnavailable(err.to_string())
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit_root(
        &self,
        root: &Digest,
        idempotency_key: Option<&str>,
    ) -> Result<String, AnchorError> {
        info!("Submitting root {} to ledger gateway", root);

        let request = SubmitRootRequest {
            root: root.to_string(),
            idempotency_key: idempotency_key.filter(|_| self.idempotency_keys),
        };

        let response = self
            .http_client
            .post(format!("{}/roots", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: SubmitRootResponse = response
            .json()
            .await
            .map_err(|e| AnchorError::LedgerUnavailable(format!("Malformed submit response: {}", e)))?;

        debug!("Ledger accepted root {} as {}", root, body.tx_ref);
        Ok(body.tx_ref)
    }

    async fn get_status(&self, tx_ref: &str) -> Result<LedgerStatus, AnchorError> {
        let response = self
            .http_client
            .get(format!("{}/transactions/{}", self.base_url, tx_ref))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!("Ledger does not know transaction {}", tx_ref);
            return Ok(LedgerStatus::Rejected {
                reason: format!("transaction {} not found on ledger", tx_ref),
            });
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: TransactionResponse = response
            .json()
            .await
            .map_err(|e| AnchorError::LedgerUnavailable(format!("Malformed status response: {}", e)))?;

        Ok(match body.status {
            GatewayStatus::Pending => LedgerStatus::Pending,
            GatewayStatus::Confirmed => LedgerStatus::Confirmed {
                block_height: body.block_height,
            },
            GatewayStatus::Rejected => LedgerStatus::Rejected {
                reason: body.reason.unwrap_or_else(|| "rejected by ledger".to_string()),
            },
        })
    }

    async fn find_submission(&self, root: &Digest) -> Result<Option<String>, AnchorError> {
        let response = self
            .http_client
            .get(format!("{}/roots/{}", self.base_url, root))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: SubmitRootResponse = response
            .json()
            .await
            .map_err(|e| AnchorError::LedgerUnavailable(format!("Malformed lookup response: {}", e)))?;
        Ok(Some(body.tx_ref))
    }

    fn supports_idempotency_keys(&self) -> bool {
        self.idempotency_keys
    }

    fn name(&self) -> &str {
        "http"
    }
}
