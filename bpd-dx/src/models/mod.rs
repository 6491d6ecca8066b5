//! Domain models for bpd-dx

pub mod cell;
pub mod diagnosis;
pub mod execution;

pub use cell::Cell;
pub use diagnosis::{DiagnosisEvent, DiagnosisMachine, StageTransition, TransitionRejected};
pub use execution::{summarize_error_kinds, ErrorKindCount, ExecutionRecord, ExecutionResult};
