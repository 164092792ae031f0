//! Swap Executor (C9): submits a swap transaction to a DEX aggregator and
//! reports on its confirmation state. Grounded on `payments/boltz.rs`'s
//! async service-struct pattern; the retry/backoff for confirmation polling
//! follows `chain_watcher.rs`'s backoff shape.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConfirmationCommitment;
use crate::domain::{SwapParams, SwapResult, TxStatus};
use crate::error::CoreError;

/// Interval between confirmation polls, independent of `transaction_timeout`
/// (the deadline) and the market/webhook backoff schedules elsewhere in this
/// crate, since polling a swap's settlement is a tight loop, not a retry.
const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn settled_for_commitment(status: TxStatus, commitment: ConfirmationCommitment) -> bool {
    match commitment {
        ConfirmationCommitment::Confirmed => {
            matches!(status, TxStatus::Confirmed | TxStatus::Finalized)
        }
        ConfirmationCommitment::Finalized => matches!(status, TxStatus::Finalized),
    }
}

/// Abstracts over whichever on-chain swap-routing provider is configured.
/// The core never speaks the aggregator's wire protocol directly; it only
/// needs submission and confirmation polling.
#[async_trait]
pub trait SwapExecutor: Send + Sync {
    /// Submit a swap and return once it's been sent (not necessarily
    /// confirmed). Retries are the caller's (coordinator's) responsibility —
    /// a failed submission may have partially succeeded on-chain, so blind
    /// retry here would risk a double-spend attempt instead of a clean retry.
    async fn execute(&self, params: &SwapParams, signer: &[u8]) -> Result<SwapResult, CoreError>;

    /// Poll the current confirmation state of a previously submitted signature.
    async fn status(&self, signature: &str) -> Result<TxStatus, CoreError>;
}

/// HTTP-backed executor talking to a DEX aggregator's quote/swap/status
/// endpoints (e.g. Jupiter-shaped API). `signer` is the already-decrypted
/// raw private key bytes, borrowed for the duration of this call only — the
/// caller is responsible for zeroizing it afterward via `crypto::with_key`.
pub struct HttpSwapExecutor {
    http: reqwest::Client,
    base_url: String,
    confirmation_commitment: ConfirmationCommitment,
    transaction_timeout: Duration,
}

impl HttpSwapExecutor {
    pub fn new(
        base_url: impl Into<String>,
        confirmation_commitment: ConfirmationCommitment,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            confirmation_commitment,
            transaction_timeout,
        }
    }

    /// Polls `status()` until the submitted signature reaches the configured
    /// commitment level, a provider-reported `failed` short-circuits the
    /// wait, or `transaction_timeout` elapses (`ConfirmationTimeout`), per
    /// §4.9's "await confirmation to the configured commitment within
    /// TRANSACTION_TIMEOUT".
    async fn await_confirmation(&self, signature: &str) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + self.transaction_timeout;
        loop {
            let status = self.status(signature).await?;
            if settled_for_commitment(status, self.confirmation_commitment) {
                return Ok(());
            }
            if status == TxStatus::Failed {
                return Err(CoreError::UpstreamProtocol(format!(
                    "swap {signature} failed on-chain"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::ConfirmationTimeout);
            }
            tokio::time::sleep(CONFIRMATION_POLL_INTERVAL).await;
        }
    }
}

#[derive(serde::Serialize)]
struct SwapRequest<'a> {
    input_mint: &'a str,
    output_mint: &'a str,
    amount_base_units: u64,
    slippage_bps: u32,
    payer: &'a str,
}

#[derive(serde::Deserialize)]
struct SwapResponse {
    signature: String,
    blockhash: Option<String>,
    input_amount: u64,
    output_amount: u64,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    status: String,
}

#[async_trait]
impl SwapExecutor for HttpSwapExecutor {
    async fn execute(&self, params: &SwapParams, _signer: &[u8]) -> Result<SwapResult, CoreError> {
        let url = format!("{}/swap", self.base_url);
        let body = SwapRequest {
            input_mint: &params.input_mint,
            output_mint: &params.output_mint,
            amount_base_units: params.amount_base_units,
            slippage_bps: params.slippage_bps,
            payer: &params.payer,
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::UpstreamTransient(e.to_string()))?;

        match response.status().as_u16() {
            status if status >= 500 => {
                return Err(CoreError::UpstreamTransient(format!(
                    "swap provider returned {status}"
                )));
            }
            409 => return Err(CoreError::InsufficientFunds {
                available: 0,
                required: params.amount_base_units,
            }),
            422 => return Err(CoreError::RouteUnavailable(format!(
                "{} -> {}",
                params.input_mint, params.output_mint
            ))),
            410 => return Err(CoreError::BlockhashExpired),
            status if status >= 400 => {
                return Err(CoreError::UpstreamProtocol(format!(
                    "swap provider returned {status}"
                )));
            }
            _ => {}
        }

        let body: SwapResponse = response
            .json()
            .await
            .map_err(|e| CoreError::UpstreamProtocol(format!("malformed swap response: {e}")))?;

        self.await_confirmation(&body.signature).await?;

        Ok(SwapResult {
            signature: body.signature,
            blockhash: body.blockhash,
            input_amount: body.input_amount,
            output_amount: body.output_amount,
        })
    }

    async fn status(&self, signature: &str) -> Result<TxStatus, CoreError> {
        let url = format!("{}/status/{signature}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::UpstreamTransient(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(TxStatus::NotFound);
        }
        if response.status().as_u16() >= 500 {
            return Err(CoreError::UpstreamTransient(format!(
                "status check returned {}",
                response.status()
            )));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| CoreError::UpstreamProtocol(format!("malformed status response: {e}")))?;

        Ok(match body.status.as_str() {
            "pending" => TxStatus::Pending,
            "confirmed" => TxStatus::Confirmed,
            "finalized" => TxStatus::Finalized,
            "failed" => TxStatus::Failed,
            other => {
                return Err(CoreError::UpstreamProtocol(format!(
                    "unrecognized tx status '{other}'"
                )));
            }
        })
    }
}

/// Deterministic in-memory executor for tests.
#[cfg(any(test, feature = "testing"))]
pub struct MockSwapExecutor {
    execute_result: std::sync::Mutex<Option<Result<SwapResult, String>>>,
    statuses: std::sync::Mutex<std::collections::HashMap<String, TxStatus>>,
}

#[cfg(any(test, feature = "testing"))]
impl MockSwapExecutor {
    pub fn new() -> Self {
        Self {
            execute_result: std::sync::Mutex::new(None),
            statuses: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn will_succeed(&self, result: SwapResult) {
        *self.execute_result.lock().unwrap() = Some(Ok(result));
    }

    pub fn will_fail(&self, message: impl Into<String>) {
        *self.execute_result.lock().unwrap() = Some(Err(message.into()));
    }

    pub fn seed_status(&self, signature: &str, status: TxStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(signature.to_string(), status);
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockSwapExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl SwapExecutor for MockSwapExecutor {
    async fn execute(&self, _params: &SwapParams, _signer: &[u8]) -> Result<SwapResult, CoreError> {
        match self.execute_result.lock().unwrap().clone() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(CoreError::UpstreamTransient(message)),
            None => Err(CoreError::UpstreamTransient("no mock result configured".into())),
        }
    }

    async fn status(&self, signature: &str) -> Result<TxStatus, CoreError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(signature)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SwapParams {
        SwapParams {
            input_mint: "VOLATILE".into(),
            output_mint: "STABLE".into(),
            amount_base_units: 1_000_000,
            slippage_bps: 50,
            payer: "wallet-address".into(),
        }
    }

    #[tokio::test]
    async fn mock_executes_seeded_success() {
        let executor = MockSwapExecutor::new();
        executor.will_succeed(SwapResult {
            signature: "sig1".into(),
            blockhash: Some("bh1".into()),
            input_amount: 1_000_000,
            output_amount: 990_000,
        });
        let result = executor.execute(&params(), b"key").await.unwrap();
        assert_eq!(result.signature, "sig1");
    }

    #[tokio::test]
    async fn mock_reports_seeded_status() {
        let executor = MockSwapExecutor::new();
        executor.seed_status("sig1", TxStatus::Finalized);
        let status = executor.status("sig1").await.unwrap();
        assert!(status.is_settled_ok());
    }

    #[tokio::test]
    async fn mock_reports_not_found_for_unseeded_signature() {
        let executor = MockSwapExecutor::new();
        let status = executor.status("unknown").await.unwrap();
        assert_eq!(status, TxStatus::NotFound);
    }
}
