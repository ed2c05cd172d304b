//! Error types for the simulation engine

use thiserror::Error;

use crate::resource::ResourceId;

/// Result type for simulation operations
pub type SimResult<T> = Result<T, SimError>;

/// Error kinds raised by the engine and delivered into model code
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Malformed model input: bad capacity, negative delay, overlapping
    /// downtime intervals and the like. Fatal at the call site.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Arithmetic between dimensioned and dimensionless simulated time
    #[error("time unit mismatch: {0}")]
    UnitMismatch(String),

    /// An acquire (or synchronous send) timed out before fulfillment.
    /// Raised into the waiting coroutine; model code may catch it.
    #[error("request timed out")]
    TimedOut,

    /// The resource was hard taken down while the process held units of it.
    /// Raised into every holding coroutine; model code may catch it.
    #[error("resource {resource} went down while held")]
    ResourceDown {
        /// The resource that was taken down
        resource: ResourceId,
    },

    /// A model-code error escaped a process body; the run halts
    #[error("model error: {0}")]
    Model(String),

    /// Engine or custom-agent bug: scheduling into the past, capacity
    /// accounting gone negative. Fatal, halts the run.
    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariant(String),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for SimError {
    fn from(err: config::ConfigError) -> Self {
        SimError::Config(err.to_string())
    }
}

impl From<globset::Error> for SimError {
    fn from(err: globset::Error) -> Self {
        SimError::Config(format!("bad glob pattern: {}", err))
    }
}
