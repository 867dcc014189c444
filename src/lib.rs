//! swe-farm: continuous PR-to-task farming and batch validation.
//!
//! This library streams a repository's merged pull requests through a task
//! converter with a resumable cursor, and validates the generated tasks
//! concurrently against reference agents.

pub mod cli;
pub mod error;
pub mod farm;
pub mod maintenance;
pub mod shutdown;
pub mod validate;

// Re-export commonly used types
pub use error::{ConvertError, FarmError, SourceError, StateError, ValidateError};
pub use farm::{FarmConfig, FarmOrchestrator, FarmSummary, StreamState};
pub use shutdown::ShutdownSignal;
pub use validate::{BatchConfig, BatchReport, BatchValidationEngine, ValidationResult};
