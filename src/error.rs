//! Error taxonomy for the linkage engine.
//!
//! Every failure the engine can report falls into one of four fatal classes.
//! Records that are merely too sparse to compare are not errors: they surface
//! as result rows flagged unmatchable (see `engine`).

use thiserror::Error;

/// Fatal error classes. None of these is recovered locally: configuration
/// and input problems terminate the run so that silent data-quality drift
/// is impossible.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Missing or contradictory options, malformed calibration tables.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed record, bad date, unknown gender symbol, duplicate local_id.
    #[error("input error: {0}")]
    Input(String),

    /// Invariant breach inside the kernel, e.g. a non-positive frequency.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cooperative cancellation was requested; partial output already
    /// written is a valid prefix of the full result.
    #[error("run cancelled")]
    Cancelled,
}

impl LinkError {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            LinkError::Config(_) => 2,
            LinkError::Input(_) => 3,
            LinkError::Internal(_) => 1,
            LinkError::Cancelled => 4,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        LinkError::Input(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LinkError::Internal(msg.into())
    }
}

impl From<csv::Error> for LinkError {
    fn from(e: csv::Error) -> Self {
        LinkError::Input(e.to_string())
    }
}
