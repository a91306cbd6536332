//! Core database service modules
//!
//! Modular components for database operations with clear separation of concerns

pub mod config;
pub mod connection;
pub mod dialect;
pub mod executor;
pub mod migration;
pub mod statement;
pub mod transaction;
pub mod types;

pub use config::DbServiceConfig;
pub use connection::ConnectionManager;
pub use dialect::Dialect;
pub use executor::DbExecutor;
pub use migration::{MigrationEngine, MigrationReport};
pub use statement::Statement;
pub use transaction::{TransactionManager, Tx, TxParticipant, TxState};
pub use types::*;
