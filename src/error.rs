use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::domain::{GenesetIdentity, SourceTag};

#[derive(Debug, Error, Diagnostic)]
pub enum RefineryError {
    #[error("missing config file refinery.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unrecognized output mode: {0} (expected \"Tribe\" or \"JSON file\")")]
    UnknownOutputMode(String),

    #[error("Tribe authentication failed: {0}")]
    Auth(String),

    #[error("failed to fetch remote gene sets for {organism}: {message}")]
    SnapshotFetch { organism: String, message: String },

    #[error("{source_tag} processing failed for {organism}: {message}")]
    SourceProcessing {
        organism: String,
        source_tag: SourceTag,
        message: String,
    },

    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },

    #[error("download returned status {status}: {url}")]
    DownloadStatus { url: String, status: u16 },

    #[error("Tribe request failed: {0}")]
    TribeHttp(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RefineryError {
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RefineryError::MissingConfig
                | RefineryError::ConfigRead(_)
                | RefineryError::ConfigParse(_)
                | RefineryError::Config(_)
                | RefineryError::UnknownOutputMode(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RefineryError::Auth(_))
    }
}

/// Failure of a single create or update call against Tribe.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UploadError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("token rejected")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote gene set {0} no longer exists")]
    NotFound(String),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),
}

impl UploadError {
    /// Transient failures are retried, everything else is recorded immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadError::Timeout
                | UploadError::Transport(_)
                | UploadError::Server { .. }
                | UploadError::RateLimited(_)
        )
    }

    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => UploadError::Unauthorized,
            404 => UploadError::NotFound(message),
            409 | 412 => UploadError::Conflict(message),
            429 => UploadError::RateLimited(message),
            500..=599 => UploadError::Server { status, message },
            _ => UploadError::Rejected { status, message },
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout
        } else {
            UploadError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFailure {
    pub identity: GenesetIdentity,
    pub attempts: u32,
    pub error: UploadError,
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.identity, self.attempts, self.error
        )
    }
}
