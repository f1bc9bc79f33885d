use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RelayError {
    #[error("invalid accession number: {0}")]
    InvalidAccession(String),

    #[error("invalid archive server: {0}")]
    InvalidServer(String),

    #[error("missing config file study-relay.json in the current or user config directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("fix the configuration file before starting the relay"))]
    InvalidConfig(String),

    #[error("session rejected by {server}")]
    AuthExpired { server: String },

    #[error("session provider failed: {0}")]
    Session(String),

    #[error("archive {server} unavailable: {message}")]
    ServerUnavailable { server: String, message: String },

    #[error("archive {server} returned status {status}: {message}")]
    ArchiveStatus {
        server: String,
        status: u16,
        message: String,
    },

    #[error("study {accession} not found: {message}")]
    StudyNotFound { accession: String, message: String },

    #[error("study {accession} incomplete: {retrieved}/{expected} instances")]
    IncompleteStudy {
        accession: String,
        retrieved: usize,
        expected: usize,
    },

    #[error("invalid instance at {path}: {reason}")]
    InvalidInstance { path: String, reason: String },

    #[error("study {0} is already retained")]
    AlreadyRetained(String),

    #[error("metadata missing: {0}")]
    MetadataMissing(String),

    #[error("pipeline dispatch failed: {0}")]
    Dispatch(String),

    #[error("pipeline API unreachable: {0}")]
    DispatchUnreachable(String),

    #[error("pipeline API returned status {status}: {message}")]
    DispatchStatus { status: u16, message: String },

    #[error("report submission failed: {0}")]
    Report(String),

    #[error("report endpoint returned status {status}: {message}")]
    ReportStatus { status: u16, message: String },

    #[error("retention cycle failed: {0}")]
    Retention(String),

    #[error("worklist request failed: {0}")]
    Locator(String),

    #[error("viewer handoff failed: {0}")]
    Viewer(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("relay is stopping")]
    Stopped,
}

impl RelayError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RelayError::AuthExpired { .. })
    }

    /// Network failures and server-side statuses; a client error or a local read will not fix itself.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::ServerUnavailable { .. } | RelayError::DispatchUnreachable(_) => true,
            RelayError::ArchiveStatus { status, .. } => is_retryable_status(*status),
            RelayError::DispatchStatus { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, RelayError::AlreadyRetained(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RelayError::MissingConfig
                | RelayError::ConfigRead(_)
                | RelayError::ConfigParse(_)
                | RelayError::InvalidConfig(_)
        )
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
