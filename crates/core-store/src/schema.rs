// Hand-authored to match migrations/2025-01-01-000000_create_core_tables;
// kept in the `@generated`-file shape `diesel print-schema` would produce.

diesel::table! {
    automation_wallets (id) {
        id -> Text,
        user_id -> Text,
        public_address -> Text,
        ciphertext -> Binary,
        iv -> Binary,
        auth_tag -> Binary,
        key_version -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    rules (id) {
        id -> Text,
        user_id -> Text,
        wallet_id -> Text,
        name -> Text,
        market_id -> Text,
        condition -> Integer,
        threshold -> Double,
        action -> Integer,
        swap_fraction_pct -> Integer,
        cooldown_hours -> Integer,
        status -> Integer,
        last_triggered_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    executions (id) {
        id -> Text,
        rule_id -> Text,
        triggered_at -> Text,
        market_condition_snapshot -> Text,
        idempotency_key -> Text,
        status -> Integer,
        tx_signature -> Nullable<Text>,
        tx_blockhash -> Nullable<Text>,
        tx_sent_at -> Nullable<Text>,
        retry_count -> Integer,
        error_message -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    execution_locks (rule_id) {
        rule_id -> Text,
        owner_id -> Text,
        acquired_at -> Text,
        expires_at -> Text,
    }
}

diesel::table! {
    dead_letter_queue (id) {
        id -> Text,
        execution_id -> Text,
        failure_reason -> Text,
        retry_count -> Integer,
        moved_at -> Text,
        status -> Integer,
        resolution_notes -> Nullable<Text>,
    }
}

diesel::table! {
    webhooks (id) {
        id -> Text,
        user_id -> Text,
        kind -> Integer,
        destination -> Text,
        event_mask -> Text,
        enabled -> Bool,
        failure_count -> Integer,
        last_triggered_at -> Nullable<Text>,
    }
}

diesel::table! {
    audit_log (id) {
        id -> Integer,
        created_at -> Text,
        event -> Text,
        detail -> Text,
    }
}

diesel::table! {
    secrets_audit (id) {
        id -> Integer,
        created_at -> Text,
        resource_type -> Text,
        resource_id -> Text,
    }
}

diesel::joinable!(rules -> automation_wallets (wallet_id));
diesel::joinable!(executions -> rules (rule_id));
diesel::joinable!(execution_locks -> rules (rule_id));
diesel::joinable!(dead_letter_queue -> executions (execution_id));

diesel::allow_tables_to_appear_in_same_query!(
    automation_wallets,
    rules,
    executions,
    execution_locks,
    dead_letter_queue,
    webhooks,
    audit_log,
    secrets_audit,
);
