use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Device configuration could not be used. Fatal to the boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {path:?} could not be read: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("configuration is malformed: {0}")]
    Malformed(String),

    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The link did not come up within the attempt budget.
#[derive(Debug, Clone, Error)]
#[error("could not join network `{ssid}` after {attempts} attempts")]
pub struct ConnectionFailed {
    pub ssid: String,
    pub attempts: u32,
}

/// A telemetry post or ping was not delivered. The sample is dropped.
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("not connected to the network")]
    NotConnected,

    #[error("transmission suppressed while a firmware update is pending")]
    UpdatePending,

    #[error("reading {value} for `{label}` rejected by its validator")]
    Rejected { label: String, value: f64 },

    #[error("controller did not answer within {0:?}")]
    Timeout(Duration),

    #[error("controller answered with status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Http(#[source] reqwest::Error),
}

impl TransmitError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            TransmitError::Timeout(timeout)
        } else if let Some(status) = err.status() {
            TransmitError::Status(status.as_u16())
        } else {
            TransmitError::Http(err)
        }
    }
}

/// A pending firmware update could not be applied. The flag is already cleared.
#[derive(Debug, Error)]
pub enum UpdateApplyError {
    #[error(transparent)]
    Offline(#[from] ConnectionFailed),

    #[error("firmware fetch failed: {0}")]
    Fetch(#[from] TransmitError),

    #[error("firmware image could not be installed: {0}")]
    Install(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored value could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
}
