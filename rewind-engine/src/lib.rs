//! Rewind Engine Library
//!
//! Dependency-aware backup and restore of relational records on a
//! multi-tenant CRM data platform.

pub mod audit;
pub mod backup;
pub mod config;
pub mod engine;
pub mod events;
pub mod remote;
pub mod resolver;
pub mod restore;
pub mod schema;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{JobHandle, MigrationEngine};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
