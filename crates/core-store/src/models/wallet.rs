use diesel::prelude::*;

use crate::schema::automation_wallets;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = automation_wallets)]
pub struct WalletRow {
    pub id: String,
    pub user_id: String,
    pub public_address: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_version: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = automation_wallets)]
pub struct NewWalletRow {
    pub id: String,
    pub user_id: String,
    pub public_address: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_version: i32,
}
