pub mod chain_reader;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod domain;
pub mod domain_support;
pub mod error;
pub mod evaluator;
pub mod market_client;
pub mod poller;
pub mod store_traits;
pub mod swap_executor;
pub mod webhook;

pub use error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
