//! Market Client (C7): fetches live probability/price/volume data for a
//! prediction market from an external provider. Grounded on
//! `payments/boltz.rs`'s async service-struct-over-HTTP shape, with the
//! retry/backoff policy generalized from `chain_watcher.rs`'s reconnect loop.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

use crate::domain::Sample;
use crate::error::CoreError;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Abstracts over whichever prediction-market data provider is configured.
/// The only implementation shipped here is HTTP-backed; tests use
/// `MockMarketClient` instead of standing up a server.
#[async_trait]
pub trait MarketClient: Send + Sync {
    async fn fetch_sample(&self, market_id: &str) -> Result<Sample, CoreError>;
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    status: String,
    probability: f64,
    last_price: f64,
    volume: f64,
    open_interest: f64,
    #[serde(default)]
    close_time: Option<chrono::DateTime<Utc>>,
}

/// HTTP-backed client. One instance is shared across every market poll.
pub struct HttpMarketClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMarketClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn fetch_once(&self, market_id: &str) -> Result<Sample, CoreError> {
        let url = format!("{}/markets/{market_id}", self.base_url);
        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::UpstreamTransient(e.to_string()))?;

        match response.status().as_u16() {
            401 | 403 => {
                return Err(CoreError::AuthFailed(format!(
                    "market provider rejected credentials: {}",
                    response.status()
                )));
            }
            404 => return Err(CoreError::MarketNotFound(market_id.to_string())),
            status if status >= 500 => {
                return Err(CoreError::UpstreamTransient(format!(
                    "provider returned {status}"
                )));
            }
            status if status >= 400 => {
                return Err(CoreError::UpstreamProtocol(format!(
                    "provider returned {status}"
                )));
            }
            _ => {}
        }

        let body: MarketResponse = response
            .json()
            .await
            .map_err(|e| CoreError::UpstreamProtocol(format!("malformed response body: {e}")))?;

        let now = Utc::now();
        let closed = body.status != "active" && body.status != "open";
        let past_close = body.close_time.is_some_and(|t| t <= now);
        if closed || past_close {
            return Err(CoreError::MarketInactive(market_id.to_string()));
        }

        if body.volume == 0.0 || body.open_interest == 0.0 {
            log::warn!("market_client: {market_id} reports zero volume/open interest");
        }

        Ok(Sample {
            market_id: market_id.to_string(),
            probability: body.probability,
            last_price: body.last_price,
            volume: body.volume,
            open_interest: body.open_interest,
            observed_at: now,
        })
    }
}

#[async_trait]
impl MarketClient for HttpMarketClient {
    /// Retries transient upstream failures up to `MAX_ATTEMPTS` times with
    /// exponential backoff capped at `MAX_BACKOFF`. Anything the provider
    /// reports as a definite rejection (auth, not-found, protocol, inactive)
    /// is never retried — it means another attempt won't help.
    async fn fetch_sample(&self, market_id: &str) -> Result<Sample, CoreError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch_once(market_id).await {
                Ok(sample) => return Ok(sample),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    log::warn!(
                        "market_client: transient error on {market_id} (attempt {attempt}/{MAX_ATTEMPTS}): {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(CoreError::UpstreamTransient("exhausted retries".into())))
    }
}

/// Deterministic in-memory client for tests: each market id maps to a
/// pre-seeded result.
#[cfg(any(test, feature = "testing"))]
pub struct MockMarketClient {
    responses: std::sync::Mutex<std::collections::HashMap<String, Result<Sample, CoreError>>>,
}

#[cfg(any(test, feature = "testing"))]
impl MockMarketClient {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn seed(&self, market_id: &str, sample: Sample) {
        self.responses
            .lock()
            .unwrap()
            .insert(market_id.to_string(), Ok(sample));
    }

    pub fn seed_err(&self, market_id: &str, err: CoreError) {
        self.responses
            .lock()
            .unwrap()
            .insert(market_id.to_string(), Err(err));
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockMarketClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl MarketClient for MockMarketClient {
    async fn fetch_sample(&self, market_id: &str) -> Result<Sample, CoreError> {
        self.responses
            .lock()
            .unwrap()
            .get(market_id)
            .cloned()
            .unwrap_or_else(|| Err(CoreError::MarketNotFound(market_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(market_id: &str, probability: f64) -> Sample {
        Sample {
            market_id: market_id.to_string(),
            probability,
            last_price: probability,
            volume: 100.0,
            open_interest: 100.0,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mock_returns_seeded_sample() {
        let client = MockMarketClient::new();
        client.seed("m1", sample("m1", 0.42));
        let result = client.fetch_sample("m1").await.unwrap();
        assert_eq!(result.probability, 0.42);
    }

    #[tokio::test]
    async fn mock_returns_not_found_for_unseeded_market() {
        let client = MockMarketClient::new();
        let err = client.fetch_sample("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::MarketNotFound(_)));
    }

    #[tokio::test]
    async fn mock_returns_seeded_error() {
        let client = MockMarketClient::new();
        client.seed_err("m1", CoreError::MarketInactive("m1".into()));
        let err = client.fetch_sample("m1").await.unwrap_err();
        assert!(matches!(err, CoreError::MarketInactive(_)));
    }
}
