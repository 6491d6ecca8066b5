//! # BPD Common Library
//!
//! Shared code for the brand-perception diagnostics services including:
//! - Error types
//! - Diagnosis domain types (stages, cell results, error taxonomy)
//! - Event types (DxEvent enum) and the broadcast event bus
//! - SSE stream helpers
//! - Configuration loading
//! - Backoff/jitter policies

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod sse;
pub mod types;

pub use error::{Error, Result};
