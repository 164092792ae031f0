//! Chain Reader: the coordinator's funding check (an automation wallet's
//! on-chain balance before sizing a swap). Grounded on the same HTTP
//! service-struct shape as `market_client.rs`/`swap_executor.rs`; a read,
//! not a write, so it carries no retry policy of its own — a single 5s
//! timeout per §5, surfaced as `UpstreamTransient` on failure.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::CoreError;

const CHAIN_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Base-unit balance of the mint the wallet is about to swap out of.
    async fn balance(&self, address: &str) -> Result<u64, CoreError>;
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance_base_units: u64,
}

/// HTTP-backed reader talking to the ledger's RPC/indexer surface.
pub struct HttpChainReader {
    http: reqwest::Client,
    base_url: String,
}

impl HttpChainReader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ChainReader for HttpChainReader {
    async fn balance(&self, address: &str) -> Result<u64, CoreError> {
        let url = format!("{}/balance/{address}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(CHAIN_READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| CoreError::UpstreamTransient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::UpstreamTransient(format!(
                "chain read returned {}",
                response.status()
            )));
        }

        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| CoreError::UpstreamProtocol(format!("malformed balance response: {e}")))?;

        Ok(body.balance_base_units)
    }
}

/// Deterministic in-memory reader for tests.
#[cfg(any(test, feature = "testing"))]
pub struct MockChainReader {
    balances: std::sync::Mutex<std::collections::HashMap<String, u64>>,
}

#[cfg(any(test, feature = "testing"))]
impl MockChainReader {
    pub fn new() -> Self {
        Self {
            balances: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn seed(&self, address: &str, balance: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), balance);
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockChainReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl ChainReader for MockChainReader {
    async fn balance(&self, address: &str) -> Result<u64, CoreError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_zero_for_unseeded_address() {
        let reader = MockChainReader::new();
        assert_eq!(reader.balance("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mock_returns_seeded_balance() {
        let reader = MockChainReader::new();
        reader.seed("addr1", 1_000_000);
        assert_eq!(reader.balance("addr1").await.unwrap(), 1_000_000);
    }
}
