//! Binary entry point. Loads configuration from the environment, wires the
//! components (see `rule_swap_core::bootstrap`), starts the poller, and
//! drains on SIGTERM/SIGINT per §5's cancellation & shutdown model: refuse
//! new ticks, give in-flight coordinator tasks a drain window, then release
//! every lock this process holds so a sibling can resume.

use std::time::Duration;

use core_sdk::config::Config;
use core_sdk::store_traits::LockManager as _;
use rule_swap_core::{bootstrap, ProviderEndpoints};

/// In-flight coordinator tasks are given this long to finish a confirmation
/// wait before the process exits regardless (§5: "drain window, default
/// ~2s for trivial work; implementations may extend to cover ongoing
/// confirmations").
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("rule-swap-core: fatal configuration error: {e}");
            std::process::exit(1);
        }
    };

    let providers = ProviderEndpoints {
        market_base_url: env_or("MARKET_PROVIDER_URL", "http://localhost:8081"),
        market_api_key: std::env::var("MARKET_PROVIDER_API_KEY").ok(),
        chain_base_url: env_or("CHAIN_RPC_URL", "http://localhost:8082"),
        swap_base_url: env_or("SWAP_PROVIDER_URL", "http://localhost:8083"),
    };

    let runtime = match bootstrap(config, providers) {
        Ok(r) => r,
        Err(e) => {
            log::error!("rule-swap-core: fatal startup error: {e}");
            std::process::exit(1);
        }
    };

    log::info!(
        "rule-swap-core: starting, poll_interval={:?} worker_pool_size={}",
        runtime.config.poll_interval,
        runtime.config.worker_pool_size,
    );

    let handle = runtime.poller.start();

    wait_for_shutdown_signal().await;

    log::info!("rule-swap-core: shutdown signal received, draining");
    runtime.poller.stop();

    if let Some(handle) = handle {
        match tokio::time::timeout(SHUTDOWN_DRAIN, handle).await {
            Ok(Ok(())) => log::info!("rule-swap-core: poller loop exited cleanly"),
            Ok(Err(e)) => log::warn!("rule-swap-core: poller task join error: {e}"),
            Err(_) => log::warn!("rule-swap-core: drain window elapsed, poller may still be ticking"),
        }
    }

    if let Err(e) = runtime.store.release_all_owned().await {
        log::error!("rule-swap-core: failed to release owned locks on shutdown: {e}");
    }

    log::info!("rule-swap-core: shutdown complete");
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Races SIGINT against SIGTERM on unix; plain `ctrl_c()` elsewhere.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("rule-swap-core: failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("rule-swap-core: failed to install signal handler: {e}");
    }
}
