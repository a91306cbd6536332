pub mod attribute;
pub mod cache;
pub mod config;
pub mod db;

// Re-export all from each module namespace
pub use attribute::*;
pub use cache::*;
pub use config::*;
pub use db::*;
