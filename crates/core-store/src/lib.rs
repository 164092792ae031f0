//! Diesel/SQLite persistence for the rule-swap automation core. Grounded on
//! `deadcat-store/src/store.rs`'s connection-and-migrations shape
//! (`DeadcatStore::open`/`open_in_memory`, `embed_migrations!`), generalized
//! from a single `&mut self` connection to an `r2d2` pool: the teacher
//! declared the `r2d2` Diesel feature but never wired a pool (its Tauri
//! command handlers run one at a time behind a `Mutex<AppStateManager>`);
//! this core's worker pool (`core_sdk::poller`) dispatches several rules
//! concurrently, so a real pool is the generalization the spec's
//! concurrency model (§5) actually needs. Each trait method borrows a
//! connection for the duration of one `spawn_blocking` closure, following
//! the same blocking-work-off-the-async-runtime idiom the teacher uses in
//! `commands.rs`/`payment_commands.rs`.

pub mod conversions;
pub mod error;
pub mod models;
pub mod schema;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use async_trait::async_trait;
use core_sdk::crypto::{self, Envelope, RotationOutcome, SecretStore};
use core_sdk::domain::{
    AutomationWallet, DlqEntry, DlqOutcome, DlqStatus, Execution, EventKind, ExecutionStatus,
    LockOutcome, NewRule, Rule, RuleStatus, Webhook, BLOCKHASH_FRESHNESS_SECS, LOCK_TTL_SECS,
    MAX_RETRIES,
};
use core_sdk::domain_support::idempotency_key;
use core_sdk::error::CoreError;
use core_sdk::store_traits::{
    DeadLetterQueue, ExecutionStore, LockManager, RuleStore, WalletStore, WebhookStore,
};

use conversions::*;
use error::StoreError;
use models::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Diesel/SQLite-backed implementation of every `core_sdk::store_traits`
/// trait plus the direct wallet CRUD and master-key rotation the HTTP
/// surface (out of scope here) would call into. One instance is shared
/// across the whole process; `Arc<SqliteStore>` is cast to each trait
/// object the coordinator/poller need.
pub struct SqliteStore {
    pool: SqlitePool,
    owner_id: String,
    held_locks: StdMutex<HashMap<String, OwnedMutexGuard<()>>>,
    lock_mutexes: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `database_url` (a plain file
    /// path, as `DeadcatStore::open` takes) and runs pending migrations.
    pub fn open(database_url: &str, owner_id: impl Into<String>) -> Result<Self, StoreError> {
        Self::build(database_url, owner_id)
    }

    /// In-memory database for tests. A pool (rather than one connection) is
    /// still used so concurrent-access tests exercise real pool contention;
    /// `max_size(1)` keeps all connections pointed at the same in-memory
    /// database, since SQLite's `:memory:` is otherwise per-connection.
    pub fn open_in_memory(owner_id: impl Into<String>) -> Result<Self, StoreError> {
        Self::build(":memory:", owner_id)
    }

    fn build(database_url: &str, owner_id: impl Into<String>) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(if database_url == ":memory:" { 1 } else { 8 })
            .build(manager)
            .map_err(|e| StoreError::Connection(diesel::ConnectionError::BadConnection(e.to_string())))?;

        {
            let mut conn = pool.get().map_err(|e| {
                StoreError::Connection(diesel::ConnectionError::BadConnection(e.to_string()))
            })?;
            diesel::sql_query("PRAGMA foreign_keys = ON").execute(&mut conn)?;
            diesel::sql_query("PRAGMA busy_timeout = 5000").execute(&mut conn)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }

        Ok(Self {
            pool,
            owner_id: owner_id.into(),
            held_locks: StdMutex::new(HashMap::new()),
            lock_mutexes: StdMutex::new(HashMap::new()),
        })
    }

    /// Runs a blocking Diesel closure on the blocking thread pool, matching
    /// `commands.rs`'s "blocking electrum calls would starve the Tokio
    /// thread-pool" rationale for `spawn_blocking`.
    async fn with_conn<F, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Connection(diesel::ConnectionError::BadConnection(e.to_string())))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::StoreFailure(format!("blocking task panicked: {e}")))?
        .map_err(Into::into)
    }

    fn audit(conn: &mut SqliteConnection, event: &str, detail: impl std::fmt::Display) {
        use schema::audit_log::dsl;
        let _ = diesel::insert_into(dsl::audit_log)
            .values((dsl::event.eq(event), dsl::detail.eq(detail.to_string())))
            .execute(conn);
    }

    fn secrets_audit(conn: &mut SqliteConnection, resource_type: &str, resource_id: &str) {
        use schema::secrets_audit::dsl;
        let _ = diesel::insert_into(dsl::secrets_audit)
            .values((
                dsl::resource_type.eq(resource_type),
                dsl::resource_id.eq(resource_id),
            ))
            .execute(conn);
    }

    // ---- Automation wallet CRUD (C1 support; outside the six core traits
    // because only the out-of-scope HTTP surface creates wallets, but the
    // core still needs somewhere to seal a freshly generated key). ----

    pub async fn create_wallet(
        &self,
        user_id: &str,
        public_address: &str,
        plaintext_key: &[u8],
        secrets: &SecretStore,
    ) -> Result<AutomationWallet, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let master_key = secrets.master_key("automation_wallet", &id);
        let envelope = crypto::seal(plaintext_key, master_key)?;

        let user_id = user_id.to_string();
        let public_address = public_address.to_string();
        let id2 = id.clone();
        self.with_conn(move |conn| {
            use schema::automation_wallets::dsl;
            let row = NewWalletRow {
                id: id2.clone(),
                user_id,
                public_address,
                ciphertext: envelope.ciphertext,
                iv: envelope.iv,
                auth_tag: envelope.auth_tag,
                key_version: 1,
            };
            diesel::insert_into(dsl::automation_wallets)
                .values(&row)
                .execute(conn)?;
            Self::secrets_audit(conn, "automation_wallet", &id2);
            wallet_row_to_domain(dsl::automation_wallets.find(id2.clone()).first(conn)?)
        })
        .await
    }

    /// Re-encrypts every wallet under `new_key`, per §4.1/§9: failures are
    /// collected rather than aborting the batch, and the cached key is only
    /// swapped (by the caller, via `SecretStore::replace`) once every wallet
    /// has an outcome.
    pub async fn rotate_all_wallets(
        &self,
        secrets: &SecretStore,
        new_key: &[u8; 32],
    ) -> Result<Vec<RotationOutcome>, CoreError> {
        let rows: Vec<WalletRow> = self
            .with_conn(|conn| {
                use schema::automation_wallets::dsl;
                Ok(dsl::automation_wallets.load::<WalletRow>(conn)?)
            })
            .await?;

        let wallets: Vec<(String, Envelope)> = rows
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    Envelope {
                        ciphertext: r.ciphertext.clone(),
                        iv: r.iv.clone(),
                        auth_tag: r.auth_tag.clone(),
                    },
                )
            })
            .collect();
        let borrowed: Vec<(&str, &Envelope)> =
            wallets.iter().map(|(id, e)| (id.as_str(), e)).collect();
        let outcomes = crypto::rotate_all(secrets, new_key, borrowed);

        for outcome in &outcomes {
            let wallet_id = outcome.wallet_id.clone();
            if let Ok(envelope) = &outcome.result {
                let envelope = envelope.clone();
                self.with_conn(move |conn| {
                    use schema::automation_wallets::dsl;
                    diesel::update(dsl::automation_wallets.filter(dsl::id.eq(&wallet_id)))
                        .set((
                            dsl::ciphertext.eq(envelope.ciphertext),
                            dsl::iv.eq(envelope.iv),
                            dsl::auth_tag.eq(envelope.auth_tag),
                            dsl::key_version.eq(dsl::key_version + 1),
                            dsl::updated_at.eq(diesel::dsl::sql::<diesel::sql_types::Text>(
                                "datetime('now')",
                            )),
                        ))
                        .execute(conn)?;
                    Self::secrets_audit(conn, "automation_wallet", &wallet_id);
                    Self::audit(conn, "wallet_key_rotated", &wallet_id);
                    Ok(())
                })
                .await?;
            } else {
                log::error!(
                    "core-store: rotation failed for wallet {}: {:?}",
                    wallet_id,
                    outcome.result.as_ref().err()
                );
            }
        }

        Ok(outcomes)
    }
}

fn wallet_row_to_domain(row: WalletRow) -> Result<AutomationWallet, StoreError> {
    Ok(AutomationWallet {
        id: row.id,
        user_id: row.user_id,
        public_address: row.public_address,
        ciphertext: row.ciphertext,
        iv: row.iv,
        auth_tag: row.auth_tag,
        key_version: row.key_version as u32,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    // SQLite's `datetime('now')` has no timezone suffix; Diesel's Text
    // column gives us the raw string back, so parse both the naive
    // `datetime('now')` shape and full RFC 3339 (set explicitly by Rust code).
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}

fn rule_row_to_domain(row: RuleRow) -> Result<Rule, StoreError> {
    Ok(Rule {
        id: row.id,
        user_id: row.user_id,
        wallet_id: row.wallet_id,
        name: row.name,
        market_id: row.market_id,
        condition: condition_from_i32(row.condition)?,
        threshold: row.threshold,
        action: action_from_i32(row.action)?,
        swap_fraction_pct: row.swap_fraction_pct as u8,
        cooldown_hours: row.cooldown_hours as u32,
        status: rule_status_from_i32(row.status)?,
        last_triggered_at: row.last_triggered_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn execution_row_to_domain(row: ExecutionRow) -> Result<Execution, StoreError> {
    Ok(Execution {
        id: row.id,
        rule_id: row.rule_id,
        triggered_at: parse_ts(&row.triggered_at)?,
        market_condition_snapshot: serde_json::from_str(&row.market_condition_snapshot)
            .map_err(|e| StoreError::InvalidData(format!("bad snapshot json: {e}")))?,
        idempotency_key: row.idempotency_key,
        status: execution_status_from_i32(row.status)?,
        tx_signature: row.tx_signature,
        tx_blockhash: row.tx_blockhash,
        tx_sent_at: row.tx_sent_at.as_deref().map(parse_ts).transpose()?,
        retry_count: row.retry_count as u32,
        error_message: row.error_message,
    })
}

fn dlq_row_to_domain(row: DlqRow) -> Result<DlqEntry, StoreError> {
    Ok(DlqEntry {
        id: row.id,
        execution_id: row.execution_id,
        failure_reason: row.failure_reason,
        retry_count: row.retry_count as u32,
        moved_at: parse_ts(&row.moved_at)?,
        status: dlq_status_from_i32(row.status)?,
        resolution_notes: row.resolution_notes,
    })
}

fn webhook_row_to_domain(row: WebhookRow) -> Result<Webhook, StoreError> {
    Ok(Webhook {
        id: row.id,
        user_id: row.user_id,
        kind: webhook_kind_from_i32(row.kind)?,
        destination: row.destination,
        event_mask: event_mask_from_string(&row.event_mask)?,
        enabled: row.enabled,
        failure_count: row.failure_count as u32,
        last_triggered_at: row.last_triggered_at.as_deref().map(parse_ts).transpose()?,
    })
}

// ==================== RuleStore ====================

#[async_trait]
impl RuleStore for SqliteStore {
    async fn create(&self, new_rule: NewRule) -> Result<Rule, CoreError> {
        new_rule
            .validate()
            .map_err(CoreError::ConfigInvalid)?;

        let id = uuid::Uuid::new_v4().to_string();
        self.with_conn(move |conn| {
            use schema::automation_wallets::dsl as wallets;
            use schema::rules::dsl as rules;

            // Wallet ownership: the rule's wallet must belong to the same user.
            let wallet_owner: Option<String> = wallets::automation_wallets
                .filter(wallets::id.eq(&new_rule.wallet_id))
                .select(wallets::user_id)
                .first(conn)
                .optional()?;
            match wallet_owner {
                None => {
                    return Err(StoreError::InvalidData(format!(
                        "no such wallet {}",
                        new_rule.wallet_id
                    )))
                }
                Some(owner) if owner != new_rule.user_id => {
                    return Err(StoreError::InvalidData(
                        "wallet is not owned by this user".into(),
                    ))
                }
                _ => {}
            }

            let row = NewRuleRow {
                id: id.clone(),
                user_id: new_rule.user_id,
                wallet_id: new_rule.wallet_id,
                name: new_rule.name,
                market_id: new_rule.market_id,
                condition: condition_as_i32(new_rule.condition),
                threshold: new_rule.threshold,
                action: action_as_i32(new_rule.action),
                swap_fraction_pct: new_rule.swap_fraction_pct as i32,
                cooldown_hours: new_rule.cooldown_hours as i32,
                status: rule_status_as_i32(RuleStatus::Created),
            };
            diesel::insert_into(rules::rules).values(&row).execute(conn)?;
            Self::audit(conn, "rule_created", &id);
            rule_row_to_domain(rules::rules.find(id.clone()).first(conn)?)
        })
        .await
    }

    async fn get(&self, rule_id: &str) -> Result<Rule, CoreError> {
        let rule_id = rule_id.to_string();
        self.with_conn(move |conn| {
            use schema::rules::dsl;
            let row: RuleRow = dsl::rules
                .find(&rule_id)
                .first(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("rule {rule_id}")))?;
            rule_row_to_domain(row)
        })
        .await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Rule>, CoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            use schema::rules::dsl;
            dsl::rules
                .filter(dsl::user_id.eq(&user_id))
                .load::<RuleRow>(conn)?
                .into_iter()
                .map(rule_row_to_domain)
                .collect()
        })
        .await
    }

    async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, CoreError> {
        self.with_conn(move |conn| {
            use schema::rules::dsl;
            let active: Vec<RuleRow> = dsl::rules
                .filter(dsl::status.eq(rule_status_as_i32(RuleStatus::Active)))
                .load(conn)?;
            active
                .into_iter()
                .map(rule_row_to_domain)
                .collect::<Result<Vec<_>, _>>()
                .map(|rules| rules.into_iter().filter(|r| r.is_due(now)).collect())
        })
        .await
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

        let rule_id = rule_id.to_string();
        self.with_conn(move |conn| {
            use schema::rules::dsl;
            conn.transaction(|conn| {
                let current: RuleRow = dsl::rules
                    .find(&rule_id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("rule {rule_id}")))?;
                if current.status != rule_status_as_i32(from) {
                    return Err(StoreError::InvalidData(format!(
                        "rule {rule_id} is not in status {from:?}"
                    )));
                }

                if let Some(triggered_at) = set_last_triggered {
                    diesel::update(dsl::rules.filter(dsl::id.eq(&rule_id)))
                        .set((
                            dsl::status.eq(rule_status_as_i32(to)),
                            dsl::last_triggered_at.eq(triggered_at.to_rfc3339()),
                        ))
                        .execute(conn)?;
                } else {
                    diesel::update(dsl::rules.filter(dsl::id.eq(&rule_id)))
                        .set(dsl::status.eq(rule_status_as_i32(to)))
                        .execute(conn)?;
                }

                Self::audit(conn, "rule_transition", format!("{rule_id}: {from:?}->{to:?}"));
                rule_row_to_domain(dsl::rules.find(&rule_id).first(conn)?)
            })
        })
        .await
        .map_err(|e| match e {
            CoreError::StoreFailure(msg) if msg.contains("is not in status") => {
                CoreError::InvalidTransition {
                    from: format!("{from:?}"),
                    to: format!("{to:?}"),
                }
            }
            other => other,
        })
    }
}

// ==================== ExecutionStore ====================

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_or_get(
        &self,
        rule_id: &str,
        triggered_at: DateTime<Utc>,
        snapshot: serde_json::Value,
    ) -> Result<(String, bool, Option<String>), CoreError> {
        let key = idempotency_key(rule_id, triggered_at);
        let rule_id = rule_id.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            conn.transaction(|conn| {
                if let Some(existing) = dsl::executions
                    .filter(dsl::idempotency_key.eq(&key))
                    .first::<ExecutionRow>(conn)
                    .optional()?
                {
                    return Ok((existing.id, false, existing.tx_signature));
                }

                let id = uuid::Uuid::new_v4().to_string();
                let row = NewExecutionRow {
                    id: id.clone(),
                    rule_id,
                    triggered_at: triggered_at.to_rfc3339(),
                    market_condition_snapshot: snapshot.to_string(),
                    idempotency_key: key,
                    status: execution_status_as_i32(ExecutionStatus::Triggered),
                };
                diesel::insert_into(dsl::executions).values(&row).execute(conn)?;
                Ok((id, true, None))
            })
        })
        .await
    }

    async fn get(&self, execution_id: &str) -> Result<Execution, CoreError> {
        let execution_id = execution_id.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            let row: ExecutionRow = dsl::executions
                .find(&execution_id)
                .first(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
            execution_row_to_domain(row)
        })
        .await
    }

    async fn attach_tx(
        &self,
        execution_id: &str,
        signature: &str,
        blockhash: Option<&str>,
    ) -> Result<(), CoreError> {
        let execution_id = execution_id.to_string();
        let signature = signature.to_string();
        let blockhash = blockhash.map(str::to_string);
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            diesel::update(dsl::executions.filter(dsl::id.eq(&execution_id)))
                .set((
                    dsl::status.eq(execution_status_as_i32(ExecutionStatus::Executing)),
                    dsl::tx_signature.eq(&signature),
                    dsl::tx_blockhash.eq(&blockhash),
                    dsl::tx_sent_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_executed(&self, execution_id: &str, signature: &str) -> Result<(), CoreError> {
        let execution_id = execution_id.to_string();
        let signature = signature.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            diesel::update(dsl::executions.filter(dsl::id.eq(&execution_id)))
                .set((
                    dsl::status.eq(execution_status_as_i32(ExecutionStatus::Executed)),
                    dsl::tx_signature.eq(&signature),
                ))
                .execute(conn)?;
            Self::audit(conn, "execution_executed", &execution_id);
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, execution_id: &str, error: &str) -> Result<(), CoreError> {
        let execution_id = execution_id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            diesel::update(dsl::executions.filter(dsl::id.eq(&execution_id)))
                .set((
                    dsl::status.eq(execution_status_as_i32(ExecutionStatus::Failed)),
                    dsl::error_message.eq(&error),
                ))
                .execute(conn)?;
            Self::audit(conn, "execution_failed", format!("{execution_id}: {error}"));
            Ok(())
        })
        .await
    }

    async fn bump_retry_count(&self, execution_id: &str) -> Result<u32, CoreError> {
        let execution_id = execution_id.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            conn.transaction(|conn| {
                diesel::update(dsl::executions.filter(dsl::id.eq(&execution_id)))
                    .set(dsl::retry_count.eq(dsl::retry_count + 1))
                    .execute(conn)?;
                let count: i32 = dsl::executions
                    .find(&execution_id)
                    .select(dsl::retry_count)
                    .first(conn)?;
                Ok(count as u32)
            })
        })
        .await
    }

    async fn is_blockhash_fresh(&self, execution_id: &str) -> Result<bool, CoreError> {
        let execution_id = execution_id.to_string();
        self.with_conn(move |conn| {
            use schema::executions::dsl;
            let row: (Option<String>, Option<String>) = dsl::executions
                .find(&execution_id)
                .select((dsl::tx_blockhash, dsl::tx_sent_at))
                .first(conn)?;
            match row {
                (Some(_), Some(sent_at)) => {
                    let sent_at = parse_ts(&sent_at)?;
                    Ok((Utc::now() - sent_at).num_seconds() < BLOCKHASH_FRESHNESS_SECS)
                }
                _ => Ok(false),
            }
        })
        .await
    }
}

// ==================== LockManager ====================

#[async_trait]
impl LockManager for SqliteStore {
    async fn acquire(&self, rule_id: &str) -> Result<LockOutcome, CoreError> {
        let mutex = {
            let mut mutexes = self.lock_mutexes.lock().unwrap();
            mutexes
                .entry(rule_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = match mutex.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return Ok(LockOutcome::HeldBy(self.owner_id.clone())),
        };

        let rule_id_owned = rule_id.to_string();
        let owner_id = self.owner_id.clone();
        let outcome = self
            .with_conn(move |conn| {
                use schema::execution_locks::dsl;
                conn.transaction(|conn| {
                    let now = Utc::now();
                    let existing: Option<LockRow> = dsl::execution_locks
                        .find(&rule_id_owned)
                        .first(conn)
                        .optional()?;

                    if let Some(row) = existing {
                        let expires_at = parse_ts(&row.expires_at)?;
                        if expires_at > now {
                            return Ok(LockOutcome::HeldBy(row.owner_id));
                        }
                    }

                    let expires_at = now + chrono::Duration::seconds(LOCK_TTL_SECS);
                    diesel::replace_into(dsl::execution_locks)
                        .values(LockRow {
                            rule_id: rule_id_owned.clone(),
                            owner_id: owner_id.clone(),
                            acquired_at: now.to_rfc3339(),
                            expires_at: expires_at.to_rfc3339(),
                        })
                        .execute(conn)?;
                    Self::audit(conn, "lock_acquired", &rule_id_owned);
                    Ok(LockOutcome::Acquired)
                })
            })
            .await?;

        if matches!(outcome, LockOutcome::Acquired) {
            self.held_locks
                .lock()
                .unwrap()
                .insert(rule_id.to_string(), guard);
        }
        Ok(outcome)
    }

    async fn release(&self, rule_id: &str) -> Result<(), CoreError> {
        let rule_id_owned = rule_id.to_string();
        let owner_id = self.owner_id.clone();
        let result = self
            .with_conn(move |conn| {
                use schema::execution_locks::dsl;
                diesel::delete(
                    dsl::execution_locks
                        .filter(dsl::rule_id.eq(&rule_id_owned))
                        .filter(dsl::owner_id.eq(&owner_id)),
                )
                .execute(conn)?;
                Self::audit(conn, "lock_released", &rule_id_owned);
                Ok(())
            })
            .await;

        self.held_locks.lock().unwrap().remove(rule_id);
        result
    }

    async fn release_all_owned(&self) -> Result<(), CoreError> {
        let owner_id = self.owner_id.clone();
        self.with_conn(move |conn| {
            use schema::execution_locks::dsl;
            diesel::delete(dsl::execution_locks.filter(dsl::owner_id.eq(&owner_id)))
                .execute(conn)?;
            Self::audit(conn, "lock_release_all_owned", &owner_id);
            Ok(())
        })
        .await?;

        self.held_locks.lock().unwrap().clear();
        Ok(())
    }

    async fn cleanup_expired(&self) -> Result<usize, CoreError> {
        self.with_conn(move |conn| {
            use schema::execution_locks::dsl;
            let now = Utc::now().to_rfc3339();
            let reclaimed = diesel::delete(dsl::execution_locks.filter(dsl::expires_at.lt(&now)))
                .execute(conn)?;
            Ok(reclaimed)
        })
        .await
    }
}

// ==================== DeadLetterQueue ====================

#[async_trait]
impl DeadLetterQueue for SqliteStore {
    async fn handle_failure(
        &self,
        execution_id: &str,
        error: &str,
        retry_count: u32,
    ) -> Result<DlqOutcome, CoreError> {
        let execution_id = execution_id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl;
            conn.transaction(|conn| {
                let live: Option<DlqRow> = dsl::dead_letter_queue
                    .filter(dsl::execution_id.eq(&execution_id))
                    .filter(
                        dsl::status
                            .eq(dlq_status_as_i32(DlqStatus::Pending))
                            .or(dsl::status.eq(dlq_status_as_i32(DlqStatus::Retrying))),
                    )
                    .first(conn)
                    .optional()?;

                if let Some(row) = live {
                    return Ok(DlqOutcome {
                        moved: true,
                        retry_count: row.retry_count as u32,
                        dlq_id: Some(row.id),
                    });
                }

                if retry_count < MAX_RETRIES {
                    return Ok(DlqOutcome {
                        moved: false,
                        retry_count,
                        dlq_id: None,
                    });
                }

                let id = uuid::Uuid::new_v4().to_string();
                let row = NewDlqRow {
                    id: id.clone(),
                    execution_id: execution_id.clone(),
                    failure_reason: error.clone(),
                    retry_count: retry_count as i32,
                    moved_at: Utc::now().to_rfc3339(),
                    status: dlq_status_as_i32(DlqStatus::Pending),
                };
                diesel::insert_into(dsl::dead_letter_queue)
                    .values(&row)
                    .execute(conn)?;
                Self::audit(conn, "dlq_moved", &execution_id);
                Ok(DlqOutcome {
                    moved: true,
                    retry_count,
                    dlq_id: Some(id),
                })
            })
        })
        .await
    }

    async fn list(&self, status: Option<DlqStatus>) -> Result<Vec<DlqEntry>, CoreError> {
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl;
            let rows: Vec<DlqRow> = match status {
                Some(s) => dsl::dead_letter_queue
                    .filter(dsl::status.eq(dlq_status_as_i32(s)))
                    .load(conn)?,
                None => dsl::dead_letter_queue.load(conn)?,
            };
            rows.into_iter().map(dlq_row_to_domain).collect()
        })
        .await
    }

    async fn retry(&self, dlq_id: &str) -> Result<(), CoreError> {
        let dlq_id = dlq_id.to_string();
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl as dlq_dsl;
            use schema::executions::dsl as exec_dsl;
            conn.transaction(|conn| {
                let entry: DlqRow = dlq_dsl::dead_letter_queue
                    .find(&dlq_id)
                    .first(conn)
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(format!("dlq entry {dlq_id}")))?;

                diesel::update(dlq_dsl::dead_letter_queue.filter(dlq_dsl::id.eq(&dlq_id)))
                    .set(dlq_dsl::status.eq(dlq_status_as_i32(DlqStatus::Retrying)))
                    .execute(conn)?;

                diesel::update(exec_dsl::executions.filter(exec_dsl::id.eq(&entry.execution_id)))
                    .set(exec_dsl::status.eq(execution_status_as_i32(ExecutionStatus::Triggered)))
                    .execute(conn)?;

                Self::audit(conn, "dlq_retry", &dlq_id);
                Ok(())
            })
        })
        .await
    }

    async fn abandon(&self, dlq_id: &str, reason: &str) -> Result<(), CoreError> {
        let dlq_id = dlq_id.to_string();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl;
            diesel::update(dsl::dead_letter_queue.filter(dsl::id.eq(&dlq_id)))
                .set((
                    dsl::status.eq(dlq_status_as_i32(DlqStatus::Abandoned)),
                    dsl::resolution_notes.eq(&reason),
                ))
                .execute(conn)?;
            Self::audit(conn, "dlq_abandoned", &dlq_id);
            Ok(())
        })
        .await
    }

    async fn resolve(&self, dlq_id: &str, notes: &str) -> Result<(), CoreError> {
        let dlq_id = dlq_id.to_string();
        let notes = notes.to_string();
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl;
            diesel::update(dsl::dead_letter_queue.filter(dsl::id.eq(&dlq_id)))
                .set((
                    dsl::status.eq(dlq_status_as_i32(DlqStatus::Resolved)),
                    dsl::resolution_notes.eq(&notes),
                ))
                .execute(conn)?;
            Self::audit(conn, "dlq_resolved", &dlq_id);
            Ok(())
        })
        .await
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, CoreError> {
        let cutoff = older_than.to_rfc3339();
        self.with_conn(move |conn| {
            use schema::dead_letter_queue::dsl;
            let deleted = diesel::delete(
                dsl::dead_letter_queue
                    .filter(
                        dsl::status
                            .eq(dlq_status_as_i32(DlqStatus::Resolved))
                            .or(dsl::status.eq(dlq_status_as_i32(DlqStatus::Abandoned))),
                    )
                    .filter(dsl::moved_at.lt(&cutoff)),
            )
            .execute(conn)?;
            Ok(deleted)
        })
        .await
    }
}

// ==================== WebhookStore ====================

#[async_trait]
impl WebhookStore for SqliteStore {
    async fn matching(&self, user_id: &str, event: EventKind) -> Result<Vec<Webhook>, CoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            use schema::webhooks::dsl;
            let rows: Vec<WebhookRow> = dsl::webhooks
                .filter(dsl::user_id.eq(&user_id))
                .filter(dsl::enabled.eq(true))
                .load(conn)?;
            rows.into_iter()
                .map(webhook_row_to_domain)
                .collect::<Result<Vec<_>, _>>()
                .map(|webhooks| webhooks.into_iter().filter(|w| w.matches(event)).collect())
        })
        .await
    }

    async fn record_delivery(&self, webhook_id: &str, success: bool) -> Result<(), CoreError> {
        let webhook_id = webhook_id.to_string();
        self.with_conn(move |conn| {
            use schema::webhooks::dsl;
            if success {
                diesel::update(dsl::webhooks.filter(dsl::id.eq(&webhook_id)))
                    .set((
                        dsl::failure_count.eq(0),
                        dsl::last_triggered_at.eq(Utc::now().to_rfc3339()),
                    ))
                    .execute(conn)?;
            } else {
                diesel::update(dsl::webhooks.filter(dsl::id.eq(&webhook_id)))
                    .set(dsl::failure_count.eq(dsl::failure_count + 1))
                    .execute(conn)?;
            }
            Ok(())
        })
        .await
    }
}

// ==================== WalletStore ====================

#[async_trait]
impl WalletStore for SqliteStore {
    async fn get(&self, wallet_id: &str) -> Result<AutomationWallet, CoreError> {
        let wallet_id = wallet_id.to_string();
        self.with_conn(move |conn| {
            use schema::automation_wallets::dsl;
            let row: WalletRow = dsl::automation_wallets
                .find(&wallet_id)
                .first(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("wallet {wallet_id}")))?;
            wallet_row_to_domain(row)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_sdk::domain::{RuleAction, RuleCondition};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory("test-owner").unwrap()
    }

    fn sample_new_rule(wallet_id: &str, user_id: &str) -> NewRule {
        NewRule {
            user_id: user_id.to_string(),
            wallet_id: wallet_id.to_string(),
            name: "Exit on spike".to_string(),
            market_id: "market-1".to_string(),
            condition: RuleCondition::Above,
            threshold: 0.7,
            action: RuleAction::ToStable,
            swap_fraction_pct: 50,
            cooldown_hours: 6,
        }
    }

    async fn seeded_wallet(store: &SqliteStore) -> AutomationWallet {
        let secrets = SecretStore::validate(&"ab".repeat(32)).unwrap();
        store
            .create_wallet("user-1", "addr-1", b"plaintext-priv-key", &secrets)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_rule_round_trips() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Created);

        let fetched = store.get(&rule.id).await.unwrap();
        assert_eq!(fetched.name, "Exit on spike");
        assert_eq!(fetched.threshold, 0.7);
    }

    #[tokio::test]
    async fn create_rejects_foreign_wallet() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let err = store
            .create(sample_new_rule(&wallet.id, "someone-else"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StoreFailure(_)));
    }

    #[tokio::test]
    async fn transition_enforces_allowed_set() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();

        let err = store
            .transition(&rule.id, RuleStatus::Created, RuleStatus::Executed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let active = store
            .transition(&rule.id, RuleStatus::Created, RuleStatus::Active, None)
            .await
            .unwrap();
        assert_eq!(active.status, RuleStatus::Active);
    }

    #[tokio::test]
    async fn due_rules_respects_cooldown_and_status() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        store
            .transition(&rule.id, RuleStatus::Created, RuleStatus::Active, None)
            .await
            .unwrap();

        let due = store.due_rules(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        store
            .transition(
                &rule.id,
                RuleStatus::Active,
                RuleStatus::Triggered,
                Some(Utc::now()),
            )
            .await
            .unwrap();
        store
            .transition(&rule.id, RuleStatus::Triggered, RuleStatus::Executing, None)
            .await
            .unwrap();
        store
            .transition(&rule.id, RuleStatus::Executing, RuleStatus::Executed, None)
            .await
            .unwrap();
        store
            .transition(&rule.id, RuleStatus::Executed, RuleStatus::Active, None)
            .await
            .unwrap();

        let due = store.due_rules(Utc::now()).await.unwrap();
        assert!(due.is_empty(), "cooldown should suppress this rule");
    }

    #[tokio::test]
    async fn execution_create_or_get_is_idempotent() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        let triggered_at = Utc::now();

        let (id1, is_new1, _) = store
            .create_or_get(&rule.id, triggered_at, serde_json::json!({"p": 0.71}))
            .await
            .unwrap();
        assert!(is_new1);

        let (id2, is_new2, _) = store
            .create_or_get(&rule.id, triggered_at, serde_json::json!({"p": 0.71}))
            .await
            .unwrap();
        assert!(!is_new2);
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn execution_lifecycle_updates_status() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
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
    }

    #[tokio::test]
    async fn bump_retry_count_increments() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        let (execution_id, _, _) = store
            .create_or_get(&rule.id, Utc::now(), serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(store.bump_retry_count(&execution_id).await.unwrap(), 1);
        assert_eq!(store.bump_retry_count(&execution_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lock_acquire_blocks_second_owner_until_released() {
        let store = store();
        let outcome1 = store.acquire("rule-x").await.unwrap();
        assert_eq!(outcome1, LockOutcome::Acquired);

        let outcome2 = store.acquire("rule-x").await.unwrap();
        assert!(matches!(outcome2, LockOutcome::HeldBy(_)));

        store.release("rule-x").await.unwrap();
        let outcome3 = store.acquire("rule-x").await.unwrap();
        assert_eq!(outcome3, LockOutcome::Acquired);
    }

    #[tokio::test]
    async fn release_all_owned_drops_every_lock() {
        let store = store();
        store.acquire("rule-a").await.unwrap();
        store.acquire("rule-b").await.unwrap();
        store.release_all_owned().await.unwrap();

        assert_eq!(store.acquire("rule-a").await.unwrap(), LockOutcome::Acquired);
        assert_eq!(store.acquire("rule-b").await.unwrap(), LockOutcome::Acquired);
    }

    #[tokio::test]
    async fn dlq_moves_only_after_max_retries() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        let (execution_id, _, _) = store
            .create_or_get(&rule.id, Utc::now(), serde_json::json!({}))
            .await
            .unwrap();

        let below = store
            .handle_failure(&execution_id, "rpc timeout", MAX_RETRIES - 1)
            .await
            .unwrap();
        assert!(!below.moved);

        let moved = store
            .handle_failure(&execution_id, "rpc timeout", MAX_RETRIES)
            .await
            .unwrap();
        assert!(moved.moved);
        assert!(moved.dlq_id.is_some());

        let again = store
            .handle_failure(&execution_id, "rpc timeout", MAX_RETRIES + 1)
            .await
            .unwrap();
        assert_eq!(again.dlq_id, moved.dlq_id, "second failure reuses the live entry");
    }

    #[tokio::test]
    async fn dlq_retry_resets_execution_to_triggered() {
        let store = store();
        let wallet = seeded_wallet(&store).await;
        let rule = store
            .create(sample_new_rule(&wallet.id, "user-1"))
            .await
            .unwrap();
        let (execution_id, _, _) = store
            .create_or_get(&rule.id, Utc::now(), serde_json::json!({}))
            .await
            .unwrap();
        store.mark_failed(&execution_id, "boom").await.unwrap();
        let outcome = store
            .handle_failure(&execution_id, "boom", MAX_RETRIES)
            .await
            .unwrap();

        store.retry(outcome.dlq_id.as_ref().unwrap()).await.unwrap();

        let execution = store.get(&execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Triggered);

        let entries = store.list(Some(DlqStatus::Retrying)).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn webhook_matching_filters_by_mask_and_enabled() {
        let store = store();
        store
            .with_conn(|conn| {
                use schema::webhooks::dsl;
                diesel::insert_into(dsl::webhooks)
                    .values(NewWebhookRow {
                        id: "wh-1".into(),
                        user_id: "user-1".into(),
                        kind: webhook_kind_as_i32(core_sdk::domain::WebhookKind::Slack),
                        destination: "https://hooks.slack.test/abc".into(),
                        event_mask: event_mask_to_string(&[EventKind::ExecutionFailed]),
                        enabled: true,
                    })
                    .execute(conn)?;
                Ok(())
            })
            .await
            .unwrap();

        let matches = store
            .matching("user-1", EventKind::ExecutionFailed)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);

        let none = store.matching("user-1", EventKind::RulePaused).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn wallet_rotation_reencrypts_under_new_key() {
        let store = store();
        let secrets = SecretStore::validate(&"11".repeat(32)).unwrap();
        let wallet = store
            .create_wallet("user-1", "addr-1", b"super secret signing key", &secrets)
            .await
            .unwrap();

        let new_key: [u8; 32] = [0x42; 32];
        let outcomes = store.rotate_all_wallets(&secrets, &new_key).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());

        let refreshed = store.get(&wallet.id).await.unwrap();
        assert_eq!(refreshed.key_version, 2);
        assert_ne!(refreshed.ciphertext, wallet.ciphertext);
    }
}
