//! Market Poller (C11): a long-lived tick loop that pulls due rules,
//! batch-fetches market data, evaluates, and dispatches triggered rules to
//! the coordinator under a bounded worker pool. Grounded on
//! `chain_watcher.rs`'s drain/reconnect/poll/sleep tick shape — adapted from
//! a dedicated OS thread (Electrum's client is `!Send`) to a plain async
//! `tokio::time::interval` loop, since the market client here is ordinary
//! `Send` HTTP — and on `discovery/service.rs`'s `start()`-returns-a-`JoinHandle`
//! lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::coordinator::ExecutionCoordinator;
use crate::evaluator::batch_evaluate;
use crate::market_client::MarketClient;
use crate::store_traits::RuleStore;

/// Per-tick counters, logged at the end of every tick and returned to
/// `trigger_manual` callers.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub evaluated: usize,
    pub triggered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub market_errors: usize,
    pub duration: Duration,
}

/// Owns the due-rule → sample → evaluate → dispatch cycle. One instance per
/// process; `start()` spawns the tick loop and returns its `JoinHandle`.
pub struct MarketPoller {
    rules: Arc<dyn RuleStore>,
    market_client: Arc<dyn MarketClient>,
    coordinator: Arc<ExecutionCoordinator>,
    poll_interval: Duration,
    worker_pool_size: usize,
    execution_enabled: bool,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl MarketPoller {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        market_client: Arc<dyn MarketClient>,
        coordinator: Arc<ExecutionCoordinator>,
        poll_interval: Duration,
        worker_pool_size: usize,
        execution_enabled: bool,
    ) -> Self {
        Self {
            rules,
            market_client,
            coordinator,
            poll_interval,
            worker_pool_size,
            execution_enabled,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the tick loop on `tokio::spawn`. Starting with the kill-switch
    /// off is a no-op with a warning — the coordinator would refuse every
    /// dispatch anyway, so there is nothing a running loop would accomplish.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.execution_enabled {
            log::warn!("poller: EXECUTION_ENABLED is false, start() is a no-op");
            return None;
        }
        self.running.store(true, Ordering::SeqCst);
        let poller = self.clone();
        Some(tokio::spawn(async move {
            poller.run_loop().await;
        }))
    }

    /// Refuses new ticks. Dispatches already spawned for the tick in
    /// progress are left to drain; this does not cancel them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Suspends dispatch of new ticks without tearing down the loop; an
    /// in-progress tick still drains to completion.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Runs one immediate tick outside the scheduled interval.
    pub async fn trigger_manual(&self) -> TickSummary {
        self.tick().await
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.paused.load(Ordering::SeqCst) {
                log::debug!("poller: tick skipped, paused");
                continue;
            }

            let summary = self.tick().await;
            log::info!(
                "poller: tick evaluated={} triggered={} succeeded={} failed={} market_errors={} took={:?}",
                summary.evaluated,
                summary.triggered,
                summary.succeeded,
                summary.failed,
                summary.market_errors,
                summary.duration,
            );
        }
    }

    async fn tick(&self) -> TickSummary {
        let start = Instant::now();
        let now = Utc::now();

        // 1. Due-rules snapshot.
        let due = match self.rules.due_rules(now).await {
            Ok(rules) => rules,
            Err(e) => {
                log::error!("poller: failed to load due rules: {e}");
                return TickSummary {
                    market_errors: 1,
                    duration: start.elapsed(),
                    ..Default::default()
                };
            }
        };
        if due.is_empty() {
            return TickSummary {
                duration: start.elapsed(),
                ..Default::default()
            };
        }

        // 2. Batch-fetch the unique markets. Per-market failures exclude
        // only the rules bound to that market this tick.
        let market_ids: HashSet<&str> = due.iter().map(|r| r.market_id.as_str()).collect();
        let mut samples = HashMap::new();
        let mut market_errors = 0usize;
        for market_id in market_ids {
            match self.market_client.fetch_sample(market_id).await {
                Ok(sample) => {
                    samples.insert(market_id.to_string(), sample);
                }
                Err(e) => {
                    market_errors += 1;
                    log::warn!("poller: market fetch failed for {market_id}: {e}");
                }
            }
        }

        // 3. Batch-evaluate.
        let decisions = batch_evaluate(&due, &samples, now);
        let evaluated = decisions.len();

        // 4. Dispatch triggered rules concurrently, bounded by the worker pool.
        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size.max(1)));
        let mut handles = Vec::new();
        let mut triggered = 0usize;
        for (rule, decision) in decisions {
            if !decision.trigger {
                continue;
            }
            let Some(sample) = samples.get(&rule.market_id).cloned() else {
                continue;
            };
            triggered += 1;

            let semaphore = semaphore.clone();
            let coordinator = self.coordinator.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("poller semaphore is never closed");
                coordinator.execute_rule(&rule, &sample).await
            }));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for handle in handles {
            match handle.await {
                Ok(outcome) if outcome.success => succeeded += 1,
                Ok(_) => failed += 1,
                Err(e) => {
                    log::error!("poller: dispatch task panicked: {e}");
                    failed += 1;
                }
            }
        }

        TickSummary {
            evaluated,
            triggered,
            succeeded,
            failed,
            market_errors,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, SecretStore};
    use crate::domain::{
        AutomationWallet, Rule, RuleAction, RuleCondition, RuleStatus, Sample, SwapResult,
    };
    use crate::market_client::MockMarketClient;
    use crate::store_traits::mocks::{
        MockDeadLetterQueue, MockExecutionStore, MockLockManager, MockRuleStore, MockWalletStore,
        MockWebhookStore,
    };
    use crate::swap_executor::MockSwapExecutor;
    use crate::webhook::WebhookDispatcher;
    use crate::chain_reader::MockChainReader;

    fn rule(id: &str, market_id: &str) -> Rule {
        Rule {
            id: id.into(),
            user_id: "u1".into(),
            wallet_id: "w1".into(),
            name: "Exit on 70%".into(),
            market_id: market_id.into(),
            condition: RuleCondition::Above,
            threshold: 0.65,
            action: RuleAction::ToStable,
            swap_fraction_pct: 80,
            cooldown_hours: 24,
            status: RuleStatus::Active,
            last_triggered_at: None,
        }
    }

    fn sample(market_id: &str, probability: f64) -> Sample {
        Sample {
            market_id: market_id.into(),
            probability,
            last_price: probability,
            volume: 1_000.0,
            open_interest: 1_000.0,
            observed_at: Utc::now(),
        }
    }

    fn poller(execution_enabled: bool) -> (Arc<MarketPoller>, Arc<MockRuleStore>, Arc<MockMarketClient>) {
        let rules = Arc::new(MockRuleStore::new());
        let market_client = Arc::new(MockMarketClient::new());

        let master = [9u8; 32];
        let envelope = crypto::seal(b"fake-signing-key", &master).unwrap();
        let wallets = Arc::new(MockWalletStore::new());
        wallets.insert(AutomationWallet {
            id: "w1".into(),
            user_id: "u1".into(),
            public_address: "addr1".into(),
            ciphertext: envelope.ciphertext.clone(),
            iv: envelope.iv.clone(),
            auth_tag: envelope.auth_tag.clone(),
            key_version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let chain = Arc::new(MockChainReader::new());
        chain.seed("addr1", 1_000_000);
        let swaps = Arc::new(MockSwapExecutor::new());
        swaps.will_succeed(SwapResult {
            signature: "sig1".into(),
            blockhash: Some("bh1".into()),
            input_amount: 800_000,
            output_amount: 790_000,
        });
        let webhook_store = Arc::new(MockWebhookStore::new());
        let webhooks = Arc::new(WebhookDispatcher::new(webhook_store));
        let secrets = Arc::new(SecretStore::validate(&hex::encode(master)).unwrap());

        let coordinator = Arc::new(ExecutionCoordinator {
            rules: rules.clone(),
            executions: Arc::new(MockExecutionStore::new()),
            locks: Arc::new(MockLockManager::new("proc-1")),
            dlq: Arc::new(MockDeadLetterQueue::new()),
            wallets,
            chain,
            swaps,
            secrets,
            webhooks,
            execution_enabled,
            slippage_tolerance_bps: 200,
        });

        let poller = Arc::new(MarketPoller::new(
            rules.clone(),
            market_client.clone(),
            coordinator,
            Duration::from_secs(900),
            8,
            execution_enabled,
        ));

        (poller, rules, market_client)
    }

    #[tokio::test]
    async fn tick_with_no_due_rules_is_a_quiet_no_op() {
        let (poller, _rules, _market) = poller(true);
        let summary = poller.trigger_manual().await;
        assert_eq!(summary.evaluated, 0);
        assert_eq!(summary.triggered, 0);
    }

    #[tokio::test]
    async fn tick_dispatches_triggered_rules_and_counts_successes() {
        let (poller, rules, market) = poller(true);
        rules.insert(rule("r1", "m1"));
        market.seed("m1", sample("m1", 0.9));

        let summary = poller.trigger_manual().await;
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.market_errors, 0);
    }

    #[tokio::test]
    async fn one_markets_failure_does_not_exclude_rules_on_other_markets() {
        let (poller, rules, market) = poller(true);
        rules.insert(rule("r1", "m1"));
        rules.insert(rule("r2", "m2"));
        market.seed("m2", sample("m2", 0.9));
        // m1 left unseeded: MockMarketClient returns MarketNotFound for it.

        let summary = poller.trigger_manual().await;
        assert_eq!(summary.market_errors, 1);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn start_with_kill_switch_off_is_a_no_op() {
        let (poller, _rules, _market) = poller(false);
        assert!(poller.start().is_none());
    }

    #[tokio::test]
    async fn paused_tick_loop_does_not_dispatch() {
        let (poller, rules, market) = poller(true);
        rules.insert(rule("r1", "m1"));
        market.seed("m1", sample("m1", 0.9));
        poller.pause();

        let handle = poller.start().expect("execution enabled");
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop();
        handle.abort();

        // The interval hasn't elapsed yet (default test interval is 900s),
        // so nothing should have been dispatched either way; this exercises
        // that pause()/stop()/start() don't panic when combined.
    }
}
