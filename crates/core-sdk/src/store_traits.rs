//! Trait seams between the pure/orchestration logic in this crate and the
//! persistence layer in `core-store`. Grounded on the two pluggable-client
//! traits already in this crate (`MarketClient`, `SwapExecutor`): the
//! coordinator and poller depend on these traits, never on `core-store`
//! directly, so tests can inject hand-rolled fakes the way the teacher's
//! `NoopStore` stands in for `DiscoveryStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AutomationWallet, DlqEntry, DlqOutcome, DlqStatus, Execution, EventKind, LockOutcome, NewRule,
    Rule, RuleStatus, Webhook,
};
use crate::error::CoreError;

/// CRUD plus the due/transition operations the poller and coordinator need.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create(&self, rule: NewRule) -> Result<Rule, CoreError>;
    async fn get(&self, rule_id: &str) -> Result<Rule, CoreError>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Rule>, CoreError>;

    /// ACTIVE rules whose cooldown has elapsed (or never triggered).
    async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, CoreError>;

    /// The only mutator of `status`/`last_triggered_at`. Fails
    /// `InvalidTransition` if `(from, to)` is not in the allowed set.
    async fn transition(
        &self,
        rule_id: &str,
        from: RuleStatus,
        to: RuleStatus,
        set_last_triggered: Option<DateTime<Utc>>,
    ) -> Result<Rule, CoreError>;
}

/// Idempotent execution bookkeeping keyed by `(rule_id, triggered_at)`.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Returns `(execution_id, is_new, existing_tx_signature)`. `is_new` is
    /// `false` iff a row already existed for this idempotency key, in which
    /// case the caller must reconcile via `SwapExecutor::status`.
    async fn create_or_get(
        &self,
        rule_id: &str,
        triggered_at: DateTime<Utc>,
        snapshot: serde_json::Value,
    ) -> Result<(String, bool, Option<String>), CoreError>;

    async fn get(&self, execution_id: &str) -> Result<Execution, CoreError>;

    /// Transitions the row to `EXECUTING` with a submitted signature.
    async fn attach_tx(
        &self,
        execution_id: &str,
        signature: &str,
        blockhash: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn mark_executed(&self, execution_id: &str, signature: &str) -> Result<(), CoreError>;

    /// Records `error_message` and transitions the row to `FAILED`. Does not
    /// touch `retry_count` — that counter belongs to the DLQ's view of the
    /// row (see `bump_retry_count`), since retries are a DLQ concept applied
    /// to an execution, not something the execution store tracks on its own.
    async fn mark_failed(&self, execution_id: &str, error: &str) -> Result<(), CoreError>;

    /// Increments and returns the row's `retry_count`. Called once per
    /// failure, before `DeadLetterQueue::handle_failure` decides whether the
    /// new count has reached `MAX_RETRIES`.
    async fn bump_retry_count(&self, execution_id: &str) -> Result<u32, CoreError>;

    /// `true` iff a blockhash is set and younger than `BLOCKHASH_FRESHNESS_SECS`.
    async fn is_blockhash_fresh(&self, execution_id: &str) -> Result<bool, CoreError>;
}

/// Per-rule distributed mutex with TTL and crash recovery.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, rule_id: &str) -> Result<LockOutcome, CoreError>;
    async fn release(&self, rule_id: &str) -> Result<(), CoreError>;
    /// Called during shutdown so a sibling process can resume.
    async fn release_all_owned(&self) -> Result<(), CoreError>;
    /// Opportunistically reclaims expired rows; returns the count reclaimed.
    async fn cleanup_expired(&self) -> Result<usize, CoreError>;
}

/// Terminal-failure storage and admin operations.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// `retry_count` is the execution's count *after* this failure (i.e. the
    /// caller has already called `ExecutionStore::bump_retry_count`). Moves
    /// the execution into a PENDING DLQ row iff `retry_count >= MAX_RETRIES`
    /// and no non-terminal entry already exists for it.
    async fn handle_failure(
        &self,
        execution_id: &str,
        error: &str,
        retry_count: u32,
    ) -> Result<DlqOutcome, CoreError>;
    async fn list(&self, status: Option<DlqStatus>) -> Result<Vec<DlqEntry>, CoreError>;
    /// Transitions to `RETRYING` and resets the underlying execution to
    /// `TRIGGERED` for the next poller tick to pick up.
    async fn retry(&self, dlq_id: &str) -> Result<(), CoreError>;
    async fn abandon(&self, dlq_id: &str, reason: &str) -> Result<(), CoreError>;
    async fn resolve(&self, dlq_id: &str, notes: &str) -> Result<(), CoreError>;
    /// Deletes resolved/abandoned rows moved before `older_than`.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, CoreError>;
}

/// Webhook registration lookup and delivery bookkeeping.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn matching(&self, user_id: &str, event: EventKind) -> Result<Vec<Webhook>, CoreError>;
    /// `success = true` resets `failure_count` to zero; `false` increments it.
    async fn record_delivery(&self, webhook_id: &str, success: bool) -> Result<(), CoreError>;
}

/// Read access to automation wallets. Creation/rotation go through
/// `SecretStore`/`crypto::rotate_all`; this trait is the coordinator's
/// read path for the envelope and public address it needs to sign and fund
/// a swap.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get(&self, wallet_id: &str) -> Result<AutomationWallet, CoreError>;
}

/// Hand-rolled in-memory fakes for the coordinator/poller test suites, in the
/// same spirit as the teacher's `NoopStore`: no mocking framework, just a
/// `Mutex`-guarded `HashMap` per trait.
#[cfg(any(test, feature = "testing"))]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRuleStore {
        rules: Mutex<HashMap<String, Rule>>,
    }

    impl MockRuleStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, rule: Rule) {
            self.rules.lock().unwrap().insert(rule.id.clone(), rule);
        }

        pub fn snapshot(&self, rule_id: &str) -> Rule {
            self.rules.lock().unwrap().get(rule_id).unwrap().clone()
        }
    }

    #[async_trait]
    impl RuleStore for MockRuleStore {
        async fn create(&self, _rule: NewRule) -> Result<Rule, CoreError> {
            unimplemented!("not exercised by coordinator/poller tests")
        }

        async fn get(&self, rule_id: &str) -> Result<Rule, CoreError> {
            self.rules
                .lock()
                .unwrap()
                .get(rule_id)
                .cloned()
                .ok_or_else(|| CoreError::StoreFailure(format!("no such rule {rule_id}")))
        }

        async fn list_for_user(&self, user_id: &str) -> Result<Vec<Rule>, CoreError> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, CoreError> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.is_due(now))
                .cloned()
                .collect())
        }

        async fn transition(
            &self,
            rule_id: &str,
            from: RuleStatus,
            to: RuleStatus,
            set_last_triggered: Option<DateTime<Utc>>,
        ) -> Result<Rule, CoreError> {
            if !RuleStatus::allowed_transition(from, to) {
                return Err(CoreError::InvalidTransition {
                    from: format!("{from:?}"),
                    to: format!("{to:?}"),
                });
            }
            let mut rules = self.rules.lock().unwrap();
            let rule = rules
                .get_mut(rule_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such rule {rule_id}")))?;
            if rule.status != from {
                return Err(CoreError::InvalidTransition {
                    from: format!("{:?}", rule.status),
                    to: format!("{to:?}"),
                });
            }
            rule.status = to;
            if let Some(triggered_at) = set_last_triggered {
                rule.last_triggered_at = Some(triggered_at);
            }
            Ok(rule.clone())
        }
    }

    struct ExecutionRow {
        execution: Execution,
    }

    #[derive(Default)]
    pub struct MockExecutionStore {
        by_id: Mutex<HashMap<String, ExecutionRow>>,
        by_key: Mutex<HashMap<String, String>>,
        next_id: Mutex<u64>,
    }

    impl MockExecutionStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn get_sync(&self, execution_id: &str) -> Execution {
            self.by_id
                .lock()
                .unwrap()
                .get(execution_id)
                .unwrap()
                .execution
                .clone()
        }

        pub fn count(&self) -> usize {
            self.by_id.lock().unwrap().len()
        }

        /// Test-only: rewrites `tx_sent_at` directly so a reconciliation
        /// staleness check can be exercised without waiting out a real
        /// `transaction_timeout`.
        pub fn backdate_tx_sent_at(&self, execution_id: &str, sent_at: DateTime<Utc>) {
            self.by_id
                .lock()
                .unwrap()
                .get_mut(execution_id)
                .unwrap()
                .execution
                .tx_sent_at = Some(sent_at);
        }
    }

    #[async_trait]
    impl ExecutionStore for MockExecutionStore {
        async fn create_or_get(
            &self,
            rule_id: &str,
            triggered_at: DateTime<Utc>,
            snapshot: serde_json::Value,
        ) -> Result<(String, bool, Option<String>), CoreError> {
            let idempotency_key =
                crate::domain_support::idempotency_key(rule_id, triggered_at);

            let mut by_key = self.by_key.lock().unwrap();
            if let Some(existing_id) = by_key.get(&idempotency_key).cloned() {
                let by_id = self.by_id.lock().unwrap();
                let row = &by_id.get(&existing_id).unwrap().execution;
                return Ok((existing_id, false, row.tx_signature.clone()));
            }

            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let id = format!("exec-{next_id}");

            let execution = Execution {
                id: id.clone(),
                rule_id: rule_id.to_string(),
                triggered_at,
                market_condition_snapshot: snapshot,
                idempotency_key: idempotency_key.clone(),
                status: crate::domain::ExecutionStatus::Triggered,
                tx_signature: None,
                tx_blockhash: None,
                tx_sent_at: None,
                retry_count: 0,
                error_message: None,
            };
            self.by_id
                .lock()
                .unwrap()
                .insert(id.clone(), ExecutionRow { execution });
            by_key.insert(idempotency_key, id.clone());
            Ok((id, true, None))
        }

        async fn get(&self, execution_id: &str) -> Result<Execution, CoreError> {
            self.by_id
                .lock()
                .unwrap()
                .get(execution_id)
                .map(|row| row.execution.clone())
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))
        }

        async fn attach_tx(
            &self,
            execution_id: &str,
            signature: &str,
            blockhash: Option<&str>,
        ) -> Result<(), CoreError> {
            let mut by_id = self.by_id.lock().unwrap();
            let row = by_id
                .get_mut(execution_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))?;
            row.execution.status = crate::domain::ExecutionStatus::Executing;
            row.execution.tx_signature = Some(signature.to_string());
            row.execution.tx_blockhash = blockhash.map(str::to_string);
            row.execution.tx_sent_at = Some(Utc::now());
            Ok(())
        }

        async fn mark_executed(&self, execution_id: &str, signature: &str) -> Result<(), CoreError> {
            let mut by_id = self.by_id.lock().unwrap();
            let row = by_id
                .get_mut(execution_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))?;
            row.execution.status = crate::domain::ExecutionStatus::Executed;
            row.execution.tx_signature = Some(signature.to_string());
            Ok(())
        }

        async fn mark_failed(&self, execution_id: &str, error: &str) -> Result<(), CoreError> {
            let mut by_id = self.by_id.lock().unwrap();
            let row = by_id
                .get_mut(execution_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))?;
            row.execution.status = crate::domain::ExecutionStatus::Failed;
            row.execution.error_message = Some(error.to_string());
            Ok(())
        }

        async fn bump_retry_count(&self, execution_id: &str) -> Result<u32, CoreError> {
            let mut by_id = self.by_id.lock().unwrap();
            let row = by_id
                .get_mut(execution_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))?;
            row.execution.retry_count += 1;
            Ok(row.execution.retry_count)
        }

        async fn is_blockhash_fresh(&self, execution_id: &str) -> Result<bool, CoreError> {
            let by_id = self.by_id.lock().unwrap();
            let row = by_id
                .get(execution_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such execution {execution_id}")))?;
            Ok(match (&row.execution.tx_blockhash, row.execution.tx_sent_at) {
                (Some(_), Some(sent_at)) => {
                    (Utc::now() - sent_at).num_seconds() < crate::domain::BLOCKHASH_FRESHNESS_SECS
                }
                _ => false,
            })
        }
    }

    #[derive(Default)]
    pub struct MockLockManager {
        held: Mutex<HashMap<String, String>>,
        owner: String,
    }

    impl MockLockManager {
        pub fn new(owner: impl Into<String>) -> Self {
            Self {
                held: Mutex::new(HashMap::new()),
                owner: owner.into(),
            }
        }

        pub fn is_locked(&self, rule_id: &str) -> bool {
            self.held.lock().unwrap().contains_key(rule_id)
        }
    }

    #[async_trait]
    impl LockManager for MockLockManager {
        async fn acquire(&self, rule_id: &str) -> Result<LockOutcome, CoreError> {
            let mut held = self.held.lock().unwrap();
            if let Some(owner) = held.get(rule_id) {
                return Ok(LockOutcome::HeldBy(owner.clone()));
            }
            held.insert(rule_id.to_string(), self.owner.clone());
            Ok(LockOutcome::Acquired)
        }

        async fn release(&self, rule_id: &str) -> Result<(), CoreError> {
            let mut held = self.held.lock().unwrap();
            if held.get(rule_id) == Some(&self.owner) {
                held.remove(rule_id);
            }
            Ok(())
        }

        async fn release_all_owned(&self) -> Result<(), CoreError> {
            let mut held = self.held.lock().unwrap();
            held.retain(|_, owner| owner != &self.owner);
            Ok(())
        }

        async fn cleanup_expired(&self) -> Result<usize, CoreError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    pub struct MockDeadLetterQueue {
        entries: Mutex<HashMap<String, DlqEntry>>,
        next_id: Mutex<u64>,
    }

    impl MockDeadLetterQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count(&self) -> usize {
            self.entries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeadLetterQueue for MockDeadLetterQueue {
        async fn handle_failure(
            &self,
            execution_id: &str,
            error: &str,
            retry_count: u32,
        ) -> Result<DlqOutcome, CoreError> {
            let mut entries = self.entries.lock().unwrap();
            if let Some(existing) = entries.values().find(|e| {
                e.execution_id == execution_id
                    && matches!(e.status, DlqStatus::Pending | DlqStatus::Retrying)
            }) {
                return Ok(DlqOutcome {
                    moved: true,
                    retry_count: existing.retry_count,
                    dlq_id: Some(existing.id.clone()),
                });
            }

            if retry_count < crate::domain::MAX_RETRIES {
                return Ok(DlqOutcome {
                    moved: false,
                    retry_count,
                    dlq_id: None,
                });
            }

            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let id = format!("dlq-{next_id}");
            entries.insert(
                id.clone(),
                DlqEntry {
                    id: id.clone(),
                    execution_id: execution_id.to_string(),
                    failure_reason: error.to_string(),
                    retry_count,
                    moved_at: Utc::now(),
                    status: DlqStatus::Pending,
                    resolution_notes: None,
                },
            );
            Ok(DlqOutcome {
                moved: true,
                retry_count,
                dlq_id: Some(id),
            })
        }

        async fn list(&self, status: Option<DlqStatus>) -> Result<Vec<DlqEntry>, CoreError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .values()
                .filter(|e| status.is_none_or(|s| e.status == s))
                .cloned()
                .collect())
        }

        async fn retry(&self, dlq_id: &str) -> Result<(), CoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(dlq_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such dlq entry {dlq_id}")))?;
            entry.status = DlqStatus::Retrying;
            Ok(())
        }

        async fn abandon(&self, dlq_id: &str, reason: &str) -> Result<(), CoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(dlq_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such dlq entry {dlq_id}")))?;
            entry.status = DlqStatus::Abandoned;
            entry.resolution_notes = Some(reason.to_string());
            Ok(())
        }

        async fn resolve(&self, dlq_id: &str, notes: &str) -> Result<(), CoreError> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(dlq_id)
                .ok_or_else(|| CoreError::StoreFailure(format!("no such dlq entry {dlq_id}")))?;
            entry.status = DlqStatus::Resolved;
            entry.resolution_notes = Some(notes.to_string());
            Ok(())
        }

        async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, CoreError> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, e| {
                !matches!(e.status, DlqStatus::Resolved | DlqStatus::Abandoned) || e.moved_at >= older_than
            });
            Ok(before - entries.len())
        }
    }

    #[derive(Default)]
    pub struct MockWebhookStore {
        webhooks: Mutex<Vec<Webhook>>,
        deliveries: Mutex<Vec<(String, bool)>>,
    }

    impl MockWebhookStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, webhook: Webhook) {
            self.webhooks.lock().unwrap().push(webhook);
        }

        pub fn deliveries(&self) -> Vec<(String, bool)> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookStore for MockWebhookStore {
        async fn matching(&self, user_id: &str, event: EventKind) -> Result<Vec<Webhook>, CoreError> {
            Ok(self
                .webhooks
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w.user_id == user_id && w.matches(event))
                .cloned()
                .collect())
        }

        async fn record_delivery(&self, webhook_id: &str, success: bool) -> Result<(), CoreError> {
            self.deliveries
                .lock()
                .unwrap()
                .push((webhook_id.to_string(), success));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockWalletStore {
        wallets: Mutex<HashMap<String, AutomationWallet>>,
    }

    impl MockWalletStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, wallet: AutomationWallet) {
            self.wallets.lock().unwrap().insert(wallet.id.clone(), wallet);
        }
    }

    #[async_trait]
    impl WalletStore for MockWalletStore {
        async fn get(&self, wallet_id: &str) -> Result<AutomationWallet, CoreError> {
            self.wallets
                .lock()
                .unwrap()
                .get(wallet_id)
                .cloned()
                .ok_or_else(|| CoreError::StoreFailure(format!("no such wallet {wallet_id}")))
        }
    }
}
