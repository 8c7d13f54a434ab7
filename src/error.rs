//! Error taxonomy for the tracker.
//!
//! Per-cycle errors (`FetchError`, `DecodeError`, wrapped in `CycleError`) stay inside
//! the poller. `PersistenceError` is logged by the reconciler and never reaches readers.
//! `ConfigError` is fatal at start-up.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("upstream endpoint must use http or https, got {0:?}")]
    UnsupportedScheme(String),

    #[error("upstream host {0:?} is not in the allow-list")]
    HostNotAllowed(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("upstream body is empty")]
    EmptyBody,

    #[error("obfuscation key is empty")]
    EmptyKey,

    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("upstream body is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("decoded payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no record list ({0})")]
    UnexpectedShape(&'static str),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl FetchError {
    /// True for both the poller's own deadline and a client-side reqwest timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout(_) => true,
            FetchError::Network(err) => err.is_timeout(),
            _ => false,
        }
    }
}

/// Why a poll cycle failed.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CycleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CycleError::Fetch(e) if e.is_timeout())
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("durable store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("durable store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cannot use CA bundle {path}: {reason}")]
    Certificate { path: String, reason: String },

    #[error("durable store response is malformed: {0}")]
    Malformed(String),

    #[error("bulk write reported {failed} failed item(s) out of {total}")]
    PartialBulk { failed: usize, total: usize },
}
