//! Execution Coordinator (C10) — the heart of the automation pipeline.
//! Orchestrates lock acquisition, idempotent execution bookkeeping, the
//! signed swap, and DLQ/retry routing for a single triggered rule.
//!
//! No single teacher module matches this shape; it is composed from
//! `chain_watcher.rs`'s emit-on-state-change style and
//! `discovery/service.rs`'s persist-then-broadcast pattern, built new as an
//! explicit struct holding every dependency (§9: "replace singletons with
//! explicit construction").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::crypto::{self, Envelope, SecretStore};
use crate::domain::{
    CoordinatorOutcome, EventKind, LockOutcome, Rule, RuleAction, RuleStatus, Sample, SwapParams,
    TxStatus, WebhookEvent, WebhookEventData,
};
use crate::error::CoreError;
use crate::store_traits::{DeadLetterQueue, ExecutionStore, LockManager, RuleStore, WalletStore};
use crate::swap_executor::SwapExecutor;
use crate::webhook::WebhookDispatcher;

/// Placeholder asset symbols a real deployment resolves from the market's
/// configured pair. The coordinator only needs a consistent (input, output)
/// ordering to hand the executor; see `RuleAction::route`.
const VOLATILE_MINT: &str = "VOLATILE";
const STABLE_MINT: &str = "STABLE";

/// Read access to a wallet's signing envelope, kept separate from
/// `WalletStore` (a read-only lookup) so a fake executor test can supply the
/// plaintext key without a real `SecretStore`.
pub trait ChainReader: crate::chain_reader::ChainReader {}
impl<T: crate::chain_reader::ChainReader + ?Sized> ChainReader for T {}

pub struct ExecutionCoordinator {
    pub rules: Arc<dyn RuleStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub locks: Arc<dyn LockManager>,
    pub dlq: Arc<dyn DeadLetterQueue>,
    pub wallets: Arc<dyn WalletStore>,
    pub chain: Arc<dyn crate::chain_reader::ChainReader>,
    pub swaps: Arc<dyn SwapExecutor>,
    pub secrets: Arc<SecretStore>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub execution_enabled: bool,
    pub slippage_tolerance_bps: u32,
    /// Mirrors `Config::transaction_timeout` (§4.9/§6's `TRANSACTION_TIMEOUT`):
    /// how long a `pending` signature is allowed to sit before `reconcile_existing`
    /// gives up on it and routes it to the DLQ instead of reporting "in progress"
    /// forever.
    pub transaction_timeout: Duration,
}

impl ExecutionCoordinator {
    fn envelope_of(wallet: &crate::domain::AutomationWallet) -> Envelope {
        Envelope {
            ciphertext: wallet.ciphertext.clone(),
            iv: wallet.iv.clone(),
            auth_tag: wallet.auth_tag.clone(),
        }
    }

    fn notify(&self, rule: &Rule, event: EventKind, data: WebhookEventData) {
        self.webhooks.notify(WebhookEvent {
            event,
            user_id: rule.user_id.clone(),
            timestamp: Utc::now(),
            data,
        });
    }

    /// §4.10's eleven-step contract. Every exit path releases the lock before
    /// returning — including the early kill-switch return, which never takes
    /// one in the first place.
    pub async fn execute_rule(&self, rule: &Rule, sample: &Sample) -> CoordinatorOutcome {
        // 1. Kill-switch.
        if !self.execution_enabled {
            return CoordinatorOutcome::disabled();
        }

        // 2. Lock.
        match self.locks.acquire(&rule.id).await {
            Ok(LockOutcome::Acquired) => {}
            Ok(LockOutcome::HeldBy(owner)) => return CoordinatorOutcome::locked_by(&owner),
            Err(e) => {
                log::warn!("coordinator: lock store error for rule {}: {e}", rule.id);
                return CoordinatorOutcome::locked_by("unknown (store error)");
            }
        }

        let outcome = self.execute_locked(rule, sample).await;

        // 11. Finally: release the lock on every exit path.
        if let Err(e) = self.locks.release(&rule.id).await {
            log::warn!("coordinator: failed to release lock for rule {}: {e}", rule.id);
        }

        outcome
    }

    async fn execute_locked(&self, rule: &Rule, sample: &Sample) -> CoordinatorOutcome {
        let now = Utc::now();
        let snapshot = match serde_json::to_value(sample) {
            Ok(v) => v,
            Err(e) => {
                return CoordinatorOutcome::failed(String::new(), format!("snapshot encode failed: {e}"))
            }
        };

        // 3. Idempotent execution row.
        let (execution_id, is_new, existing_tx) =
            match self.executions.create_or_get(&rule.id, now, snapshot).await {
                Ok(row) => row,
                Err(e) => return CoordinatorOutcome::failed(String::new(), e.to_string()),
            };

        if !is_new {
            return self.reconcile_existing(rule, &execution_id, existing_tx).await;
        }

        // 4. Status & fan-out (non-blocking; failures do not abort execution).
        if let Err(e) = self
            .rules
            .transition(&rule.id, RuleStatus::Active, RuleStatus::Triggered, None)
            .await
        {
            log::error!("coordinator: rule {} failed to enter TRIGGERED: {e}", rule.id);
            return CoordinatorOutcome::failed(execution_id, e.to_string());
        }
        self.notify(
            rule,
            EventKind::RuleTriggered,
            WebhookEventData {
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                market_id: Some(rule.market_id.clone()),
                probability: Some(sample.probability),
                threshold: Some(rule.threshold),
                ..Default::default()
            },
        );
        self.notify(
            rule,
            EventKind::ExecutionStarted,
            WebhookEventData {
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                execution_id: Some(execution_id.clone()),
                ..Default::default()
            },
        );

        self.run_with_retries(rule, sample, &execution_id).await
    }

    /// Reconciles an execution row that already existed for this idempotency
    /// key. A signature reported confirmed/finalized means the work is done.
    /// A signature reported failed outright, or a `pending` one whose
    /// `tx_sent_at` is older than `transaction_timeout`, can never settle on
    /// its own: per the stale-pending decision recorded in `DESIGN.md`, both
    /// are routed through the same retry/DLQ path a submission failure takes
    /// rather than being reported "in progress" forever. A `pending`
    /// signature still inside the window is left untouched.
    async fn reconcile_existing(
        &self,
        rule: &Rule,
        execution_id: &str,
        existing_tx: Option<String>,
    ) -> CoordinatorOutcome {
        let Some(signature) = existing_tx else {
            return CoordinatorOutcome::already_in_progress(execution_id.to_string());
        };

        let status = match self.swaps.status(&signature).await {
            Ok(status) => status,
            Err(e) => {
                log::warn!(
                    "coordinator: failed to reconcile signature {signature} for rule {}: {e}",
                    rule.id
                );
                return CoordinatorOutcome::already_in_progress(execution_id.to_string());
            }
        };

        if status.is_settled_ok() {
            return CoordinatorOutcome::executed(execution_id.to_string());
        }

        if status != TxStatus::Failed && !self.is_past_confirmation_deadline(execution_id).await {
            return CoordinatorOutcome::already_in_progress(execution_id.to_string());
        }

        let message = if status == TxStatus::Failed {
            "swap provider reports transaction failed".to_string()
        } else {
            CoreError::ConfirmationTimeout.to_string()
        };

        let (retry_count, outcome) = self.record_failure(rule, execution_id, message.clone()).await;
        if retry_count >= crate::domain::MAX_RETRIES {
            return self
                .finalize_failure(rule, execution_id, message, retry_count)
                .await;
        }

        if let Err(e) = self
            .rules
            .transition(&rule.id, RuleStatus::Failed, RuleStatus::Active, None)
            .await
        {
            log::warn!("coordinator: rule {} failed to return to ACTIVE: {e}", rule.id);
        }

        outcome
    }

    /// `true` once `execution_id`'s `tx_sent_at` is older than
    /// `transaction_timeout`; a row with no `tx_sent_at` at all (shouldn't
    /// happen for one carrying a signature) is treated as stale rather than
    /// left open-ended.
    async fn is_past_confirmation_deadline(&self, execution_id: &str) -> bool {
        match self.executions.get(execution_id).await {
            Ok(execution) => execution
                .tx_sent_at
                .map(|sent_at| {
                    (Utc::now() - sent_at).num_seconds() >= self.transaction_timeout.as_secs() as i64
                })
                .unwrap_or(true),
            Err(e) => {
                log::warn!(
                    "coordinator: failed to load execution {execution_id} while reconciling: {e}"
                );
                false
            }
        }
    }

    /// Marks `execution_id` failed, bumps its retry counter, and fires
    /// `EXECUTION_FAILED`. Returns the post-bump retry count alongside the
    /// outcome the caller returns if retries remain; callers that reach
    /// `MAX_RETRIES` discard the outcome and call `finalize_failure` instead.
    async fn record_failure(
        &self,
        rule: &Rule,
        execution_id: &str,
        message: String,
    ) -> (u32, CoordinatorOutcome) {
        if let Err(e) = self.executions.mark_failed(execution_id, &message).await {
            log::error!("coordinator: failed to mark execution {execution_id} failed: {e}");
        }
        if let Err(e) = self
            .rules
            .transition(&rule.id, RuleStatus::Executing, RuleStatus::Failed, None)
            .await
        {
            log::error!("coordinator: rule {} failed to enter FAILED: {e}", rule.id);
        }
        let retry_count = match self.executions.bump_retry_count(execution_id).await {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "coordinator: failed to bump retry count for {execution_id}: {e}"
                );
                crate::domain::MAX_RETRIES
            }
        };

        self.notify(
            rule,
            EventKind::ExecutionFailed,
            WebhookEventData {
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                execution_id: Some(execution_id.to_string()),
                error: Some(message.clone()),
                ..Default::default()
            },
        );

        (
            retry_count,
            CoordinatorOutcome::failed(execution_id.to_string(), message),
        )
    }

    /// One swap attempt: funding check through confirmation. Moves the rule
    /// ACTIVE/FAILED→TRIGGERED→EXECUTING before submitting, so a failure here
    /// always has `EXECUTING` as its `from` status per the rule machine.
    async fn attempt_swap(
        &self,
        rule: &Rule,
        sample: &Sample,
        execution_id: &str,
        first_attempt: bool,
    ) -> Result<CoordinatorOutcome, CoreError> {
        if !first_attempt {
            self.rules
                .transition(&rule.id, RuleStatus::Failed, RuleStatus::Active, None)
                .await?;
            self.rules
                .transition(&rule.id, RuleStatus::Active, RuleStatus::Triggered, None)
                .await?;
        }
        self.rules
            .transition(&rule.id, RuleStatus::Triggered, RuleStatus::Executing, None)
            .await?;

        // 5. Funding check.
        let wallet = self.wallets.get(&rule.wallet_id).await?;
        let balance = self.chain.balance(&wallet.public_address).await?;
        if balance == 0 {
            return Err(CoreError::InsufficientFunds {
                available: 0,
                required: 1,
            });
        }

        // 6. Route selection.
        let route = rule.action.route(VOLATILE_MINT, STABLE_MINT);
        let amount = balance * rule.swap_fraction_pct as u64 / 100;
        if amount == 0 {
            return Err(CoreError::InsufficientFunds {
                available: balance,
                required: 1,
            });
        }

        let params = SwapParams {
            input_mint: route.input_mint.to_string(),
            output_mint: route.output_mint.to_string(),
            amount_base_units: amount,
            slippage_bps: self.slippage_tolerance_bps,
            payer: wallet.public_address.clone(),
        };

        // 7. Signed swap, scoped to a zeroed-on-exit key buffer.
        let envelope = Self::envelope_of(&wallet);
        let master_key = self.secrets.master_key("automation_wallet", &wallet.id);
        let swap_result = crypto::with_key_async(&envelope, master_key, |signer| {
            let swaps = self.swaps.clone();
            let params = params.clone();
            let signer = signer.to_vec();
            async move { swaps.execute(&params, &signer).await }
        })
        .await??;

        // 8. Persist tx.
        self.executions
            .attach_tx(
                execution_id,
                &swap_result.signature,
                swap_result.blockhash.as_deref(),
            )
            .await?;

        // 9. On success.
        self.executions
            .mark_executed(execution_id, &swap_result.signature)
            .await?;
        self.rules
            .transition(&rule.id, RuleStatus::Executing, RuleStatus::Executed, None)
            .await?;
        self.rules
            .transition(
                &rule.id,
                RuleStatus::Executed,
                RuleStatus::Active,
                Some(Utc::now()),
            )
            .await?;

        self.notify(
            rule,
            EventKind::ExecutionSucceeded,
            WebhookEventData {
                rule_id: Some(rule.id.clone()),
                rule_name: Some(rule.name.clone()),
                execution_id: Some(execution_id.to_string()),
                market_id: Some(rule.market_id.clone()),
                probability: Some(sample.probability),
                tx_signature: Some(swap_result.signature.clone()),
                ..Default::default()
            },
        );

        Ok(CoordinatorOutcome::executed(execution_id.to_string()))
    }

    /// Runs `attempt_swap` up to `MAX_RETRIES` times against the same
    /// execution row (rebuilding the transaction with a fresh blockhash each
    /// time, per §4.4). This is the concrete reading chosen for §8's
    /// invariant "entering DLQ ⇔ retry_count = MAX_RETRIES": the counter
    /// lives on one execution row, so the retries that grow it happen within
    /// the coordinator call that owns that row rather than across separate
    /// poller ticks, each of which would mint a fresh idempotency key and a
    /// fresh row. Recorded in `DESIGN.md`.
    async fn run_with_retries(
        &self,
        rule: &Rule,
        sample: &Sample,
        execution_id: &str,
    ) -> CoordinatorOutcome {
        let mut first_attempt = true;
        loop {
            match self.attempt_swap(rule, sample, execution_id, first_attempt).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    let message = e.to_string();
                    let (retry_count, _) = self.record_failure(rule, execution_id, message.clone()).await;

                    if retry_count < crate::domain::MAX_RETRIES {
                        first_attempt = false;
                        continue;
                    }

                    return self
                        .finalize_failure(rule, execution_id, message, retry_count)
                        .await;
                }
            }
        }
    }

    /// Retries exhausted: route through the DLQ. If it accepted a PENDING
    /// entry the rule stays FAILED (paused for manual attention); otherwise
    /// it returns to ACTIVE for a future tick.
    async fn finalize_failure(
        &self,
        rule: &Rule,
        execution_id: &str,
        message: String,
        retry_count: u32,
    ) -> CoordinatorOutcome {
        let dlq_outcome = match self.dlq.handle_failure(execution_id, &message, retry_count).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("coordinator: DLQ handle_failure errored for {execution_id}: {e}");
                return CoordinatorOutcome::failed(execution_id.to_string(), message);
            }
        };

        if dlq_outcome.moved {
            self.notify(
                rule,
                EventKind::RulePaused,
                WebhookEventData {
                    rule_id: Some(rule.id.clone()),
                    rule_name: Some(rule.name.clone()),
                    execution_id: Some(execution_id.to_string()),
                    error: Some(message.clone()),
                    ..Default::default()
                },
            );
        } else if let Err(e) = self
            .rules
            .transition(&rule.id, RuleStatus::Failed, RuleStatus::Active, None)
            .await
        {
            log::error!("coordinator: rule {} failed to return to ACTIVE: {e}", rule.id);
        }

        CoordinatorOutcome::failed(execution_id.to_string(), message)
    }
}
