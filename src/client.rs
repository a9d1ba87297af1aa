use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::config::BasicAuth;
use crate::errors::{Result, SenderError};
use crate::types::OutboundAlert;

/// Bounded exponential backoff between push attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per push, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Serialize a batch once so it can be pushed to several endpoints
pub fn encode_batch<'a>(alerts: impl IntoIterator<Item = &'a OutboundAlert>) -> Result<Vec<u8>> {
    let alerts: Vec<&OutboundAlert> = alerts.into_iter().collect();
    serde_json::to_vec(&alerts).map_err(SenderError::Serialize)
}

/// Client for pushing alert batches to one receiver's endpoints
#[derive(Clone)]
pub struct ReceiverClient {
    client: ClientWithMiddleware,
    basic_auth: Option<BasicAuth>,
}

impl ReceiverClient {
    /// Create a new receiver client
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout of a single push attempt
    /// * `basic_auth` - Credentials sent with every push
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, basic_auth: Option<BasicAuth>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SenderError::BuildHttpClient)?;

        let client = ClientBuilder::new(client).build();

        Ok(Self { client, basic_auth })
    }

    /// Create a new client with a custom reqwest middleware client
    ///
    /// This allows you to add custom middleware (logging, tracing, etc.)
    pub fn with_client(client: ClientWithMiddleware, basic_auth: Option<BasicAuth>) -> Self {
        Self { client, basic_auth }
    }

    /// Push an encoded batch to a single endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails
    /// - The receiver returns a non-success status code
    #[instrument(
        name = "ReceiverClient::push",
        skip_all,
        fields(url = %url, body_len = body.len())
    )]
    pub async fn push(&self, url: &Url, body: Bytes) -> Result<()> {
        debug!("Pushing alerts to receiver");

        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }

        let response = request.send().await.map_err(SenderError::Request)?;

        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SenderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Alerts pushed successfully");
        Ok(())
    }

    /// Push a batch, retrying transient failures according to `policy`
    ///
    /// Errors that are not retryable are returned after the first attempt.
    /// Every attempt shares the same `body` buffer.
    pub async fn push_with_retry(
        &self,
        url: &Url,
        body: &Bytes,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.push(url, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    debug!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Push failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
