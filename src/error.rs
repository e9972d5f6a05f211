//! Crate-wide error type.
//!
//! Library modules return [`Result`] (aliasing [`SwitchboardError`]) rather than
//! `anyhow::Result`; only the thin CLI binary flattens to `anyhow` at the top.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwitchboardError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("server exited before becoming ready (exit code {exit_code:?}): {output}")]
    StartFailed {
        output: String,
        exit_code: Option<i32>,
    },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("protocol error: {reason}")]
    ProtocolError { reason: String },

    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("parse error: {reason}")]
    Parse { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;

impl SwitchboardError {
    /// True for the error kinds the detection engine treats as "this probe was
    /// infeasible" rather than a hard failure worth propagating.
    pub fn is_probe_failure(&self) -> bool {
        matches!(
            self,
            SwitchboardError::StartFailed { .. }
                | SwitchboardError::Timeout { .. }
                | SwitchboardError::ProtocolError { .. }
        )
    }
}
