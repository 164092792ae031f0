//! Tagged domain records shared across the pipeline. Untyped JSON never
//! crosses a component boundary inside the core; everything here is a typed
//! record with enumerated status fields, validated once at the store or API
//! boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RuleId = String;
pub type ExecutionId = String;
pub type UserId = String;
pub type WalletId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleCondition {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    ToStable,
    ToVolatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleStatus {
    Created,
    Active,
    Paused,
    Triggered,
    Executing,
    Executed,
    Failed,
    Cancelled,
}

impl RuleStatus {
    /// Table from the data model: the only transitions a `transition` call
    /// may apply. `Cancelled` is reachable from any non-terminal status but
    /// is listed explicitly per `from` rather than as a wildcard, so the
    /// allowed-set check in the rule store stays a simple lookup.
    pub fn allowed_transition(from: RuleStatus, to: RuleStatus) -> bool {
        use RuleStatus::*;
        match (from, to) {
            (Created, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Triggered) => true,
            (Triggered, Executing) => true,
            (Executing, Executed) => true,
            (Executed, Active) => true,
            (Executing, Failed) => true,
            (Failed, Active) => true,
            (Failed, Cancelled) => true,
            (Created, Cancelled)
            | (Active, Cancelled)
            | (Paused, Cancelled)
            | (Triggered, Cancelled)
            | (Executing, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub name: String,
    pub market_id: String,
    pub condition: RuleCondition,
    pub threshold: f64,
    pub action: RuleAction,
    pub swap_fraction_pct: u8,
    pub cooldown_hours: u32,
    pub status: RuleStatus,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

pub const RULE_NAME_MAX_LEN: usize = 100;

/// Fields a caller supplies when creating a rule; the store assigns `id`,
/// defaults `status` to `CREATED`, and validates before insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub user_id: UserId,
    pub wallet_id: WalletId,
    pub name: String,
    pub market_id: String,
    pub condition: RuleCondition,
    pub threshold: f64,
    pub action: RuleAction,
    pub swap_fraction_pct: u8,
    pub cooldown_hours: u32,
}

impl NewRule {
    /// Field-level validation from the rule store's CRUD contract: name
    /// length, threshold range, swap fraction range. Wallet ownership is
    /// checked separately by the store, which has the wallet row.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.chars().count() > RULE_NAME_MAX_LEN {
            return Err(format!(
                "rule name must be 1-{RULE_NAME_MAX_LEN} characters"
            ));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err("threshold must be in [0, 1]".into());
        }
        if !(1..=100).contains(&self.swap_fraction_pct) {
            return Err("swap_fraction_pct must be in [1, 100]".into());
        }
        Ok(())
    }
}

impl Rule {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cooldown_hours as i64)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
        match self.last_triggered_at {
            None => true,
            Some(last) => now - last >= self.cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Triggered,
    Executing,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub rule_id: RuleId,
    pub triggered_at: DateTime<Utc>,
    pub market_condition_snapshot: serde_json::Value,
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    pub tx_signature: Option<String>,
    pub tx_blockhash: Option<String>,
    pub tx_sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

/// A freshly observed probability reading for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub market_id: String,
    pub probability: f64,
    pub last_price: f64,
    pub volume: f64,
    pub open_interest: f64,
    pub observed_at: DateTime<Utc>,
}

/// Result of evaluating one rule against one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub trigger: bool,
    pub reason: &'static str,
}

impl Decision {
    pub fn skip(reason: &'static str) -> Self {
        Self {
            trigger: false,
            reason,
        }
    }

    pub fn trigger(reason: &'static str) -> Self {
        Self {
            trigger: true,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RuleTriggered,
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    RulePaused,
    WalletLowBalance,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub rule_id: Option<RuleId>,
    pub rule_name: Option<String>,
    pub execution_id: Option<ExecutionId>,
    pub market_id: Option<String>,
    pub probability: Option<f64>,
    pub threshold: Option<f64>,
    pub tx_signature: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: EventKind,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookKind {
    Http,
    Slack,
    Discord,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: UserId,
    pub kind: WebhookKind,
    pub destination: String,
    pub event_mask: Vec<EventKind>,
    pub enabled: bool,
    pub failure_count: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn matches(&self, event: EventKind) -> bool {
        self.enabled && self.event_mask.contains(&event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub execution_id: ExecutionId,
    pub failure_reason: String,
    pub retry_count: u32,
    pub moved_at: DateTime<Utc>,
    pub status: DlqStatus,
    pub resolution_notes: Option<String>,
}

pub const MAX_RETRIES: u32 = 3;
pub const STALENESS_MAX_SECS: i64 = 30 * 60;
pub const BLOCKHASH_FRESHNESS_SECS: i64 = 80;
pub const LOCK_TTL_SECS: i64 = 5 * 60;
pub const MAX_WEBHOOK_ATTEMPTS: u32 = 4;

/// A dedicated, system-owned signing wallet. The plaintext private key never
/// appears here — only the AEAD envelope (`ciphertext`/`iv`/`auth_tag`) and
/// the `key_version` that identifies which master key encrypted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationWallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub public_address: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// On-chain confirmation state of a submitted transaction, as reported by
/// `SwapExecutor::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Finalized,
    Failed,
    NotFound,
}

impl TxStatus {
    /// Work is done and need not be retried.
    pub fn is_settled_ok(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Finalized)
    }
}

/// Input/output mint pair for a rule's configured action.
#[derive(Debug, Clone, Copy)]
pub struct RouteMints {
    pub input_mint: &'static str,
    pub output_mint: &'static str,
}

impl RuleAction {
    /// `TO_STABLE` sells the volatile asset into the stable asset; `TO_VOLATILE`
    /// does the reverse. Mint symbols are placeholders a real deployment
    /// resolves from the market's configured asset pair; the core only
    /// needs a consistent (input, output) ordering to hand to the executor.
    pub fn route(self, volatile_mint: &'static str, stable_mint: &'static str) -> RouteMints {
        match self {
            RuleAction::ToStable => RouteMints {
                input_mint: volatile_mint,
                output_mint: stable_mint,
            },
            RuleAction::ToVolatile => RouteMints {
                input_mint: stable_mint,
                output_mint: volatile_mint,
            },
        }
    }
}

/// Parameters for a single swap submission.
#[derive(Debug, Clone)]
pub struct SwapParams {
    pub input_mint: String,
    pub output_mint: String,
    pub amount_base_units: u64,
    pub slippage_bps: u32,
    pub payer: String,
}

/// Successful swap result returned by the executor.
#[derive(Debug, Clone)]
pub struct SwapResult {
    pub signature: String,
    pub blockhash: Option<String>,
    pub input_amount: u64,
    pub output_amount: u64,
}

/// Outcome of a `LockManager::acquire` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    HeldBy(String),
}

/// Outcome of a `DeadLetterQueue::handle_failure` call.
#[derive(Debug, Clone)]
pub struct DlqOutcome {
    pub moved: bool,
    pub retry_count: u32,
    pub dlq_id: Option<String>,
}

/// Result of `ExecutionCoordinator::execute_rule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorOutcome {
    pub success: bool,
    pub execution_id: Option<ExecutionId>,
    pub message: String,
}

impl CoordinatorOutcome {
    pub fn disabled() -> Self {
        Self {
            success: false,
            execution_id: None,
            message: "disabled".into(),
        }
    }

    pub fn locked_by(owner: &str) -> Self {
        Self {
            success: false,
            execution_id: None,
            message: format!("locked by {owner}"),
        }
    }

    pub fn already_in_progress(execution_id: ExecutionId) -> Self {
        Self {
            success: true,
            execution_id: Some(execution_id),
            message: "already in progress".into(),
        }
    }

    pub fn executed(execution_id: ExecutionId) -> Self {
        Self {
            success: true,
            execution_id: Some(execution_id),
            message: "executed".into(),
        }
    }

    pub fn failed(execution_id: ExecutionId, message: String) -> Self {
        Self {
            success: false,
            execution_id: Some(execution_id),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_is_due_respects_cooldown() {
        let now = Utc::now();
        let mut rule = sample_rule();
        rule.last_triggered_at = Some(now - chrono::Duration::hours(2));
        rule.cooldown_hours = 24;
        assert!(!rule.is_due(now));

        rule.last_triggered_at = Some(now - chrono::Duration::hours(25));
        assert!(rule.is_due(now));
    }

    #[test]
    fn rule_is_due_false_when_not_active() {
        let now = Utc::now();
        let mut rule = sample_rule();
        rule.status = RuleStatus::Paused;
        assert!(!rule.is_due(now));
    }

    #[test]
    fn transition_table_matches_status_machine() {
        use RuleStatus::*;
        assert!(RuleStatus::allowed_transition(Active, Triggered));
        assert!(RuleStatus::allowed_transition(Executed, Active));
        assert!(!RuleStatus::allowed_transition(Active, Executed));
        assert!(RuleStatus::allowed_transition(Failed, Cancelled));
    }

    #[test]
    fn route_mints_follow_action() {
        let to_stable = RuleAction::ToStable.route("VOLATILE", "STABLE");
        assert_eq!(to_stable.input_mint, "VOLATILE");
        assert_eq!(to_stable.output_mint, "STABLE");

        let to_volatile = RuleAction::ToVolatile.route("VOLATILE", "STABLE");
        assert_eq!(to_volatile.input_mint, "STABLE");
        assert_eq!(to_volatile.output_mint, "VOLATILE");
    }

    #[test]
    fn tx_status_settled_ok() {
        assert!(TxStatus::Confirmed.is_settled_ok());
        assert!(TxStatus::Finalized.is_settled_ok());
        assert!(!TxStatus::Pending.is_settled_ok());
        assert!(!TxStatus::Failed.is_settled_ok());
    }

    fn sample_rule() -> Rule {
        Rule {
            id: "r1".into(),
            user_id: "u1".into(),
            wallet_id: "w1".into(),
            name: "Exit on 70%".into(),
            market_id: "m1".into(),
            condition: RuleCondition::Above,
            threshold: 0.65,
            action: RuleAction::ToStable,
            swap_fraction_pct: 80,
            cooldown_hours: 24,
            status: RuleStatus::Active,
            last_triggered_at: None,
        }
    }
}
