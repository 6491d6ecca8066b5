//! Shared error and result types
//!
//! One enum spans both crates so engine code can bubble database,
//! I/O, and validation failures through a single `Result` alias and
//! leave it to the API layer to decide what each becomes on the wire.

use thiserror::Error;

/// Result alias used throughout the diagnosis engine
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unusable configuration: unreadable file, bad env override, or
    /// a malformed provider entry
    #[error("Configuration error: {0}")]
    Config(String),

    /// A named resource (execution, config file) that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request payload rejected by validation before any work starts
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Broken invariant with no better classification, such as a
    /// corrupt ledger row
    #[error("Internal error: {0}")]
    Internal(String),
}
