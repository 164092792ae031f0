use std::env;
use std::time::Duration;

use crate::error::CoreError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 900_000;
const DEFAULT_STALENESS_MAX_MS: u64 = 1_800_000;
const DEFAULT_WORKER_POOL_SIZE: usize = 8;
const DEFAULT_SLIPPAGE_TOLERANCE_BPS: u32 = 200;
const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationCommitment {
    Confirmed,
    Finalized,
}

impl ConfirmationCommitment {
    fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw {
            "confirmed" => Ok(Self::Confirmed),
            "finalized" => Ok(Self::Finalized),
            other => Err(CoreError::ConfigInvalid(format!(
                "TRANSACTION_CONFIRMATION_COMMITMENT must be 'confirmed' or 'finalized', got '{other}'"
            ))),
        }
    }
}

/// Process-wide configuration, loaded once at startup from the environment.
/// A missing or malformed required variable is fatal (`ConfigInvalid`); a
/// malformed optional variable is also fatal, it never silently falls back
/// to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub master_encryption_key_hex: String,
    pub execution_enabled: bool,
    pub poll_interval: Duration,
    pub staleness_max: Duration,
    pub worker_pool_size: usize,
    pub confirmation_commitment: ConfirmationCommitment,
    pub slippage_tolerance_bps: u32,
    pub transaction_timeout: Duration,
    pub database_url: String,
    pub max_user_aggregate_exposure_usd: Option<f64>,
}

impl Config {
    pub fn from_env() -> Result<Self, CoreError> {
        let master_encryption_key_hex = required_env("MASTER_ENCRYPTION_KEY")?;
        if hex::decode(&master_encryption_key_hex)
            .map(|b| b.len())
            .unwrap_or(0)
            != 32
        {
            return Err(CoreError::ConfigInvalid(
                "MASTER_ENCRYPTION_KEY must be 32 bytes of hex (64 hex chars)".into(),
            ));
        }

        let database_url = required_env("DATABASE_URL")?;

        let execution_enabled = parse_bool_env("EXECUTION_ENABLED", true)?;
        let poll_interval_ms = parse_u64_env("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let staleness_max_ms = parse_u64_env("STALENESS_MAX_MS", DEFAULT_STALENESS_MAX_MS)?;
        let worker_pool_size = parse_usize_env("WORKER_POOL_SIZE", DEFAULT_WORKER_POOL_SIZE)?;
        let slippage_tolerance_bps =
            parse_u32_env("SLIPPAGE_TOLERANCE_BPS", DEFAULT_SLIPPAGE_TOLERANCE_BPS)?;
        let transaction_timeout_secs =
            parse_u64_env("TRANSACTION_TIMEOUT_SECS", DEFAULT_TRANSACTION_TIMEOUT_SECS)?;

        let confirmation_commitment = match env::var("TRANSACTION_CONFIRMATION_COMMITMENT") {
            Ok(raw) => ConfirmationCommitment::parse(&raw)?,
            Err(_) => ConfirmationCommitment::Finalized,
        };

        let max_user_aggregate_exposure_usd = match env::var("MAX_USER_AGGREGATE_EXPOSURE_USD") {
            Ok(raw) => Some(raw.parse::<f64>().map_err(|_| {
                CoreError::ConfigInvalid(format!(
                    "MAX_USER_AGGREGATE_EXPOSURE_USD must be numeric, got '{raw}'"
                ))
            })?),
            Err(_) => None,
        };

        if worker_pool_size == 0 {
            return Err(CoreError::ConfigInvalid(
                "WORKER_POOL_SIZE must be at least 1".into(),
            ));
        }

        Ok(Self {
            master_encryption_key_hex,
            execution_enabled,
            poll_interval: Duration::from_millis(poll_interval_ms),
            staleness_max: Duration::from_millis(staleness_max_ms),
            worker_pool_size,
            confirmation_commitment,
            slippage_tolerance_bps,
            transaction_timeout: Duration::from_secs(transaction_timeout_secs),
            database_url,
            max_user_aggregate_exposure_usd,
        })
    }
}

fn required_env(key: &str) -> Result<String, CoreError> {
    env::var(key).map_err(|_| CoreError::ConfigInvalid(format!("{key} is required")))
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<bool>()
            .map_err(|_| CoreError::ConfigInvalid(format!("{key} must be 'true' or 'false'"))),
        Err(_) => Ok(default),
    }
}

fn parse_u64_env(key: &str, default: u64) -> Result<u64, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| CoreError::ConfigInvalid(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

fn parse_u32_env(key: &str, default: u32) -> Result<u32, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u32>()
            .map_err(|_| CoreError::ConfigInvalid(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

fn parse_usize_env(key: &str, default: usize) -> Result<usize, CoreError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<usize>()
            .map_err(|_| CoreError::ConfigInvalid(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}
