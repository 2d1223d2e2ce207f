//! Utility modules for the migration engine.

pub mod errors;
pub mod fs;
pub mod logger;

pub use errors::{Aborted, EngineError, RemoteError, Result};
