pub mod alerts;
pub mod anomaly;
pub mod config;
pub mod detector;
pub mod kubernetes;
pub mod logs;
pub mod metrics;
pub mod retry;
pub mod run;
pub mod sentinel;
pub mod server;
pub mod store;
pub mod structure;
pub mod template;

use thiserror::Error;

use crate::run::RunState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient I/O error: {0}")]
    TransientIo(String),
    #[error("Illegal state transition for run {run_id}: {from} -> {to}")]
    StateViolation {
        run_id: String,
        from: RunState,
        to: RunState,
    },
    #[error("Version conflict for run {run_id}: expected version {expected}, found {actual}")]
    Conflict {
        run_id: String,
        expected: i64,
        actual: i64,
    },
    #[error("Alert channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is an I/O hiccup that a retry with backoff may clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientIo(_) | Error::ChannelUnavailable(_) | Error::Io(_) => true,
            Error::Http(e) => !e.is_builder() && !e.is_decode(),
            Error::Kubernetes(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::Kubernetes(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
