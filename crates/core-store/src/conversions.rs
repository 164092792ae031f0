//! Enum-as-integer conversions between `core-sdk`'s domain enums and the
//! `i32` columns `schema.rs` declares for them, in the same
//! `from_i32`/`as_i32` shape as the teacher's `OrderStatus`/`PoolStatus`.

use core_sdk::domain::{
    DlqStatus, EventKind, RuleAction, RuleCondition, RuleStatus, WebhookKind,
};

use crate::error::StoreError;

pub fn condition_as_i32(c: RuleCondition) -> i32 {
    match c {
        RuleCondition::Above => 0,
        RuleCondition::Below => 1,
    }
}

pub fn condition_from_i32(v: i32) -> Result<RuleCondition, StoreError> {
    match v {
        0 => Ok(RuleCondition::Above),
        1 => Ok(RuleCondition::Below),
        other => Err(StoreError::InvalidData(format!("invalid rule condition: {other}"))),
    }
}

pub fn action_as_i32(a: RuleAction) -> i32 {
    match a {
        RuleAction::ToStable => 0,
        RuleAction::ToVolatile => 1,
    }
}

pub fn action_from_i32(v: i32) -> Result<RuleAction, StoreError> {
    match v {
        0 => Ok(RuleAction::ToStable),
        1 => Ok(RuleAction::ToVolatile),
        other => Err(StoreError::InvalidData(format!("invalid rule action: {other}"))),
    }
}

pub fn rule_status_as_i32(s: RuleStatus) -> i32 {
    match s {
        RuleStatus::Created => 0,
        RuleStatus::Active => 1,
        RuleStatus::Paused => 2,
        RuleStatus::Triggered => 3,
        RuleStatus::Executing => 4,
        RuleStatus::Executed => 5,
        RuleStatus::Failed => 6,
        RuleStatus::Cancelled => 7,
    }
}

pub fn rule_status_from_i32(v: i32) -> Result<RuleStatus, StoreError> {
    match v {
        0 => Ok(RuleStatus::Created),
        1 => Ok(RuleStatus::Active),
        2 => Ok(RuleStatus::Paused),
        3 => Ok(RuleStatus::Triggered),
        4 => Ok(RuleStatus::Executing),
        5 => Ok(RuleStatus::Executed),
        6 => Ok(RuleStatus::Failed),
        7 => Ok(RuleStatus::Cancelled),
        other => Err(StoreError::InvalidData(format!("invalid rule status: {other}"))),
    }
}

pub fn execution_status_as_i32(s: core_sdk::domain::ExecutionStatus) -> i32 {
    use core_sdk::domain::ExecutionStatus::*;
    match s {
        Triggered => 0,
        Executing => 1,
        Executed => 2,
        Failed => 3,
    }
}

pub fn execution_status_from_i32(v: i32) -> Result<core_sdk::domain::ExecutionStatus, StoreError> {
    use core_sdk::domain::ExecutionStatus::*;
    match v {
        0 => Ok(Triggered),
        1 => Ok(Executing),
        2 => Ok(Executed),
        3 => Ok(Failed),
        other => Err(StoreError::InvalidData(format!("invalid execution status: {other}"))),
    }
}

pub fn dlq_status_as_i32(s: DlqStatus) -> i32 {
    match s {
        DlqStatus::Pending => 0,
        DlqStatus::Retrying => 1,
        DlqStatus::Resolved => 2,
        DlqStatus::Abandoned => 3,
    }
}

pub fn dlq_status_from_i32(v: i32) -> Result<DlqStatus, StoreError> {
    match v {
        0 => Ok(DlqStatus::Pending),
        1 => Ok(DlqStatus::Retrying),
        2 => Ok(DlqStatus::Resolved),
        3 => Ok(DlqStatus::Abandoned),
        other => Err(StoreError::InvalidData(format!("invalid dlq status: {other}"))),
    }
}

pub fn webhook_kind_as_i32(k: WebhookKind) -> i32 {
    match k {
        WebhookKind::Http => 0,
        WebhookKind::Slack => 1,
        WebhookKind::Discord => 2,
        WebhookKind::Email => 3,
    }
}

pub fn webhook_kind_from_i32(v: i32) -> Result<WebhookKind, StoreError> {
    match v {
        0 => Ok(WebhookKind::Http),
        1 => Ok(WebhookKind::Slack),
        2 => Ok(WebhookKind::Discord),
        3 => Ok(WebhookKind::Email),
        other => Err(StoreError::InvalidData(format!("invalid webhook kind: {other}"))),
    }
}

fn event_kind_as_str(e: EventKind) -> &'static str {
    match e {
        EventKind::RuleTriggered => "RULE_TRIGGERED",
        EventKind::ExecutionStarted => "EXECUTION_STARTED",
        EventKind::ExecutionSucceeded => "EXECUTION_SUCCEEDED",
        EventKind::ExecutionFailed => "EXECUTION_FAILED",
        EventKind::RulePaused => "RULE_PAUSED",
        EventKind::WalletLowBalance => "WALLET_LOW_BALANCE",
    }
}

fn event_kind_from_str(s: &str) -> Result<EventKind, StoreError> {
    match s {
        "RULE_TRIGGERED" => Ok(EventKind::RuleTriggered),
        "EXECUTION_STARTED" => Ok(EventKind::ExecutionStarted),
        "EXECUTION_SUCCEEDED" => Ok(EventKind::ExecutionSucceeded),
        "EXECUTION_FAILED" => Ok(EventKind::ExecutionFailed),
        "RULE_PAUSED" => Ok(EventKind::RulePaused),
        "WALLET_LOW_BALANCE" => Ok(EventKind::WalletLowBalance),
        other => Err(StoreError::InvalidData(format!("invalid event kind: {other}"))),
    }
}

/// `event_mask` is persisted as a comma-separated tag list (`webhooks.event_mask`
/// is a plain `TEXT` column — a join table would be overkill for a handful of
/// tags that are never queried individually).
pub fn event_mask_to_string(mask: &[EventKind]) -> String {
    mask.iter().map(|e| event_kind_as_str(*e)).collect::<Vec<_>>().join(",")
}

pub fn event_mask_from_string(raw: &str) -> Result<Vec<EventKind>, StoreError> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(event_kind_from_str)
        .collect()
}
