use diesel::prelude::*;

use crate::schema::execution_locks;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = execution_locks)]
pub struct LockRow {
    pub rule_id: String,
    pub owner_id: String,
    pub acquired_at: String,
    pub expires_at: String,
}
