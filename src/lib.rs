//! Process wiring for the rule-swap automation core: reads configuration,
//! opens the store, constructs every component named in §4 of the spec, and
//! hands back a `Runtime` whose `poller` can be started and drained on
//! shutdown. Grounded on §9's "replace singletons with explicit
//! construction" design note — there is no app-wide `Mutex<AppState>` here;
//! each component is a plain struct holding `Arc<dyn Trait>` handles to its
//! dependencies, wired once at startup.

use std::sync::Arc;

use core_sdk::chain_reader::{ChainReader, HttpChainReader};
use core_sdk::config::Config;
use core_sdk::coordinator::ExecutionCoordinator;
use core_sdk::crypto::SecretStore;
use core_sdk::market_client::{HttpMarketClient, MarketClient};
use core_sdk::poller::MarketPoller;
use core_sdk::swap_executor::{HttpSwapExecutor, SwapExecutor};
use core_sdk::webhook::WebhookDispatcher;
use core_sdk::CoreError;
use core_store::SqliteStore;

/// External provider endpoints the core talks to; opaque to the core beyond
/// a base URL and optional credential, per §1's "abstracted as pluggable
/// clients".
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub market_base_url: String,
    pub market_api_key: Option<String>,
    pub chain_base_url: String,
    pub swap_base_url: String,
}

/// Everything the binary needs to start the poller and shut it down
/// cleanly. `store` is kept alongside `poller` so shutdown can call
/// `release_all_owned()` directly (§5 Cancellation & shutdown) without
/// downcasting a trait object.
pub struct Runtime {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub poller: Arc<MarketPoller>,
}

/// Builds every component named in §4, in dependency order (leaves first,
/// per §2's component table): secrets, store, then the components that read
/// from it, then the coordinator, then the poller.
pub fn bootstrap(config: Config, providers: ProviderEndpoints) -> Result<Runtime, CoreError> {
    // C1: validate the master key once, fatal on failure per §7.
    let secrets = Arc::new(SecretStore::validate(&config.master_encryption_key_hex)?);

    // Implements every store trait (C3-C6, plus wallet CRUD) behind one
    // Diesel/SQLite connection pool; `Arc<SqliteStore>` is handed out as
    // each trait object the coordinator/poller need.
    let store = Arc::new(
        SqliteStore::open(&config.database_url, process_owner_id())
            .map_err(|e| CoreError::StoreFailure(e.to_string()))?,
    );

    let market_client: Arc<dyn MarketClient> = Arc::new(HttpMarketClient::new(
        providers.market_base_url,
        providers.market_api_key,
    ));
    let chain_reader: Arc<dyn ChainReader> = Arc::new(HttpChainReader::new(providers.chain_base_url));
    let swap_executor: Arc<dyn SwapExecutor> = Arc::new(HttpSwapExecutor::new(
        providers.swap_base_url,
        config.confirmation_commitment,
        config.transaction_timeout,
    ));
    let webhooks = Arc::new(WebhookDispatcher::new(store.clone()));

    let coordinator = Arc::new(ExecutionCoordinator {
        rules: store.clone(),
        executions: store.clone(),
        locks: store.clone(),
        dlq: store.clone(),
        wallets: store.clone(),
        chain: chain_reader,
        swaps: swap_executor,
        secrets,
        webhooks,
        execution_enabled: config.execution_enabled,
        slippage_tolerance_bps: config.slippage_tolerance_bps,
        transaction_timeout: config.transaction_timeout,
    });

    let poller = Arc::new(MarketPoller::new(
        store.clone(),
        market_client,
        coordinator,
        config.poll_interval,
        config.worker_pool_size,
        config.execution_enabled,
    ));

    Ok(Runtime {
        config,
        store,
        poller,
    })
}

/// `owner_id` for the lock manager: distinguishes this process's held locks
/// from a sibling's so `release_all_owned()` on shutdown only releases its
/// own, per §4.3.
fn process_owner_id() -> String {
    format!("{}-{}", hostname_or_unknown(), std::process::id())
}

fn hostname_or_unknown() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "host".to_string())
}
