use diesel::prelude::*;

use crate::schema::dead_letter_queue;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dead_letter_queue)]
pub struct DlqRow {
    pub id: String,
    pub execution_id: String,
    pub failure_reason: String,
    pub retry_count: i32,
    pub moved_at: String,
    pub status: i32,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dead_letter_queue)]
pub struct NewDlqRow {
    pub id: String,
    pub execution_id: String,
    pub failure_reason: String,
    pub retry_count: i32,
    pub moved_at: String,
    pub status: i32,
}
