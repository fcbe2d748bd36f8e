use std::time::Duration;

use market::{ReconcileError, SeriesError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker connector not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The broker refused the command; carries the raw broker message.
    #[error("rejected by broker: {0}")]
    Rejected(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("local clock differs from server by {skew_ms} ms (limit {limit_ms} ms)")]
    ClockSkew { skew_ms: i64, limit_ms: i64 },
    #[error("api key is missing required permissions: {}", .0.join(", "))]
    PermissionDenied(Vec<String>),
    #[error("fatal initialization failure: {0}")]
    Fatal(String),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<roxmltree::Error> for BrokerError {
    fn from(err: roxmltree::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}
