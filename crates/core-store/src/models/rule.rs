use diesel::prelude::*;

use crate::schema::rules;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = rules)]
pub struct RuleRow {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub name: String,
    pub market_id: String,
    pub condition: i32,
    pub threshold: f64,
    pub action: i32,
    pub swap_fraction_pct: i32,
    pub cooldown_hours: i32,
    pub status: i32,
    pub last_triggered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = rules)]
pub struct NewRuleRow {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub name: String,
    pub market_id: String,
    pub condition: i32,
    pub threshold: f64,
    pub action: i32,
    pub swap_fraction_pct: i32,
    pub cooldown_hours: i32,
    pub status: i32,
}
