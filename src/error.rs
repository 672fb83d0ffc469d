use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("advisory request failed: {0}")]
    AdvisorTransport(String),
    #[error("advisory service returned {status}: {body}")]
    AdvisorStatus { status: u16, body: String },
    #[error("advisory response could not be parsed: {0}")]
    MalformedResponse(String),
    #[error("advisory call timed out after {0:?}")]
    Timeout(Duration),
    #[error("calibration cancelled")]
    Cancelled,
    #[error("settings store error: {0}")]
    Store(String),
    /// A review batch stopped part way; already-written changes were rolled back.
    #[error("applied {written} of {total} changes before failing: {reason}")]
    PartialApply {
        written: usize,
        total: usize,
        reason: String,
    },
    #[error("review is {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
}

impl From<reqwest::Error> for RiskError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RiskError::AdvisorTransport(format!("timeout: {err}"))
        } else {
            RiskError::AdvisorTransport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RiskError {
    fn from(err: serde_json::Error) -> Self {
        RiskError::MalformedResponse(err.to_string())
    }
}

impl From<sqlx::Error> for RiskError {
    fn from(err: sqlx::Error) -> Self {
        RiskError::Store(err.to_string())
    }
}
