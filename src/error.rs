//! Error taxonomy for the collection boundary and configuration layer.
//!
//! "No data" conditions (short series, zero variance) are deliberately not
//! errors; detectors return `Option`/empty results for those so callers can
//! tell a real failure from "nothing to report".

use thiserror::Error;

/// Errors surfaced by a [`crate::collector::TimeSeriesCollector`].
///
/// The variant decides the propagation policy: access failures abort the
/// whole run, transient failures are retried at the collection boundary and
/// otherwise soft-fail the affected slice, malformed payloads are dropped
/// record-by-record with a logged warning.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Permission denied by the provider. Never retried, aborts the run.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Request was throttled by the provider.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Connectivity failure (timeout, refused, DNS).
    #[error("connection failure: {0}")]
    Connection(String),

    /// The collector returned a payload that does not parse into the
    /// expected record shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl CollectorError {
    /// Whether the retry policy may re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Throttled(_) | CollectorError::Connection(_)
        )
    }

    /// Whether this error must abort the entire run instead of soft-failing
    /// the slice that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollectorError::AccessDenied(_))
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown grouping dimension: {0} (allowed: account, service, region)")]
    UnknownDimension(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
