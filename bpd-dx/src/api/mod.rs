//! HTTP API for the diagnosis engine

pub mod diagnosis;
pub mod health;
pub mod sse;

pub use diagnosis::diagnosis_routes;
pub use health::health_routes;
pub use sse::event_stream;
