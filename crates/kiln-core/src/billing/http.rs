//! HTTP billing client.
//!
//! Talks to the billing peer over JSON with a per-attempt timeout and
//! exponential backoff. Transport failures and 5xx answers are retried;
//! 4xx answers are mapped straight to typed errors.

use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use uuid::Uuid;

use super::{Balance, BillingClient, BillingError, CreditRequest, CreditTransaction};

/// Configuration for [`HttpBillingClient`].
#[derive(Debug, Clone)]
pub struct HttpBillingConfig {
    /// Base URL of the billing service, e.g. `http://billing:8000`.
    pub base_url: String,
    /// Per-attempt request timeout.
    pub timeout_seconds: f64,
    /// Total attempts per logical call.
    pub max_retries: u32,
}

impl HttpBillingConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_seconds: 5.0,
            max_retries: 3,
        }
    }
}

/// Billing client over HTTP.
pub struct HttpBillingClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpBillingClient {
    pub fn new(config: HttpBillingConfig) -> Result<Self, BillingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_seconds))
            .build()
            .map_err(|e| BillingError::Unavailable(format!("failed to build client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client,
            max_retries: config.max_retries.max(1),
        })
    }

    /// Issue a request, retrying transport failures and 5xx answers with
    /// 1 s / 2 s / 4 s backoff. Exhaustion maps to `Unavailable`.
    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&CreditRequest>,
    ) -> Result<Response, BillingError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let mut req = self.client.request(method.clone(), url);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("billing service returned {}", response.status());
                    tracing::warn!(
                        url,
                        status = %response.status(),
                        attempt = attempt + 1,
                        "billing request got server error"
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        url,
                        error = %e,
                        attempt = attempt + 1,
                        "billing request failed"
                    );
                }
            }

            if attempt + 1 < self.max_retries {
                let delay = Duration::from_secs(1 << attempt);
                tokio::time::sleep(delay).await;
            }
        }

        Err(BillingError::Unavailable(format!(
            "after {} attempts: {last_error}",
            self.max_retries
        )))
    }

    /// Read the error message out of a `{"error": {"message": ...}}` body.
    async fn error_message(response: Response, fallback: &str) -> String {
        match response.json::<serde_json::Value>().await {
            Ok(body) => body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or(fallback)
                .to_owned(),
            Err(_) => fallback.to_owned(),
        }
    }

    async fn handle_transaction_response(
        response: Response,
    ) -> Result<CreditTransaction, BillingError> {
        let status = response.status();

        if status == StatusCode::PAYMENT_REQUIRED {
            let message = Self::error_message(response, "Insufficient credits").await;
            return Err(BillingError::InsufficientCredits(message));
        }

        if status.is_client_error() {
            let message = Self::error_message(response, "Client error").await;
            return Err(BillingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<CreditTransaction>()
            .await
            .map_err(|e| BillingError::Unavailable(format!("malformed billing response: {e}")))
    }
}

#[async_trait::async_trait]
impl BillingClient for HttpBillingClient {
    async fn consume_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError> {
        let url = format!("{}/billing/credits/consume", self.base_url);
        let response = self
            .request_with_retry(Method::POST, &url, Some(request))
            .await?;
        Self::handle_transaction_response(response).await
    }

    async fn refund_credits(
        &self,
        request: &CreditRequest,
    ) -> Result<CreditTransaction, BillingError> {
        let url = format!("{}/billing/credits/refund", self.base_url);
        let response = self
            .request_with_retry(Method::POST, &url, Some(request))
            .await?;
        Self::handle_transaction_response(response).await
    }

    async fn get_balance(&self, tenant_id: Uuid) -> Result<Balance, BillingError> {
        let url = format!("{}/billing/credits/balance/{tenant_id}", self.base_url);
        let response = self.request_with_retry(Method::GET, &url, None).await?;
        let status = response.status();

        if status.is_client_error() {
            let message = Self::error_message(response, "Ledger not found").await;
            return Err(BillingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Balance>()
            .await
            .map_err(|e| BillingError::Unavailable(format!("malformed balance response: {e}")))
    }
}
