pub mod dlq;
pub mod execution;
pub mod lock;
pub mod rule;
pub mod wallet;
pub mod webhook;

pub use dlq::{DlqRow, NewDlqRow};
pub use execution::{ExecutionRow, NewExecutionRow};
pub use lock::LockRow;
pub use rule::{NewRuleRow, RuleRow};
pub use wallet::{NewWalletRow, WalletRow};
pub use webhook::{NewWebhookRow, WebhookRow};
