use diesel::prelude::*;

use crate::schema::executions;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = executions)]
pub struct ExecutionRow {
    pub id: String,
    pub rule_id: String,
    pub triggered_at: String,
    pub market_condition_snapshot: String,
    pub idempotency_key: String,
    pub status: i32,
    pub tx_signature: Option<String>,
    pub tx_blockhash: Option<String>,
    pub tx_sent_at: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = executions)]
pub struct NewExecutionRow {
    pub id: String,
    pub rule_id: String,
    pub triggered_at: String,
    pub market_condition_snapshot: String,
    pub idempotency_key: String,
    pub status: i32,
}
