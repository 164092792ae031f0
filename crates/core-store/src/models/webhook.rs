use diesel::prelude::*;

use crate::schema::webhooks;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = webhooks)]
pub struct WebhookRow {
    pub id: String,
    pub user_id: String,
    pub kind: i32,
    pub destination: String,
    /// Comma-separated `EventKind` tags (`RULE_TRIGGERED,EXECUTION_SUCCEEDED,...`);
    /// kept as a flat string rather than a join table since the mask is small
    /// and never queried by individual bit.
    pub event_mask: String,
    pub enabled: bool,
    pub failure_count: i32,
    pub last_triggered_at: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = webhooks)]
pub struct NewWebhookRow {
    pub id: String,
    pub user_id: String,
    pub kind: i32,
    pub destination: String,
    pub event_mask: String,
    pub enabled: bool,
}
