use thiserror::Error;

/// Crate-wide error taxonomy. Component-local errors convert into this via
/// `#[from]` the same way `deadcat_sdk::Error` centralizes domain failures
/// while narrower store-side errors stay separate and bridge in.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("market not found: {0}")]
    MarketNotFound(String),

    #[error("market inactive: {0}")]
    MarketInactive(String),

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("crypto integrity check failed: {0}")]
    CryptoIntegrity(String),

    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("no route available: {0}")]
    RouteUnavailable(String),

    #[error("blockhash expired")]
    BlockhashExpired,

    #[error("confirmation timed out")]
    ConfirmationTimeout,

    #[error("lock held by {0}")]
    LockHeld(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("stale data: {0}")]
    StaleData(String),

    #[error("store failure: {0}")]
    StoreFailure(String),
}

impl CoreError {
    /// `true` for failures an upstream-owning client should retry on its own
    /// backoff schedule; `false` for everything else (including protocol
    /// errors, which are never retried).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::UpstreamTransient(_))
    }
}
