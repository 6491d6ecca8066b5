pub mod circuit_breaker;
pub mod classify;
pub mod dispatcher;
pub mod executor;
pub mod gateway;
pub mod recovery;
