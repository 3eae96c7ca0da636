//! Typed error taxonomy shared across every component.
//!
//! Every public operation in the orchestrator returns `Result<T>` using the
//! closed set of kinds below. Recoverable kinds (`Timeout`, `Network`,
//! `Conflict` on a concurrent lifecycle transition) are retried with bounded
//! backoff at the orchestrator boundary only; everything else surfaces to
//! the caller unaltered.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-readable error kind. `code()` returns the string form
/// used in CLI output and any serialized error payload.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User input failed schema/domain validation.
    #[error("invalid {path}: {message}")]
    Invalid {
        path: String,
        code: String,
        message: String,
    },

    /// Sandbox/repo/session/branch/terminal absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// State machine refusal or unique-constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Container daemon or filesystem error.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// External fetch failure (e.g. OAuth discovery/token endpoints).
    #[error("network error: {0}")]
    Network(String),

    /// Caller must (re-)authorize before this call can proceed.
    #[error("authorization required")]
    AuthRequired,

    /// OAuth/auth-specific failure distinct from a generic network error.
    #[error("auth error: {0}")]
    Auth(String),

    /// Deadline exceeded.
    #[error("timeout")]
    Timeout,

    /// A per-resource cap was hit (e.g. 5 terminals per sandbox).
    #[error("limit reached: {0}")]
    LimitReached(String),

    /// A bug. Logged with context and a request id; never expected in
    /// normal operation.
    #[error("internal error ({request_id}): {message}")]
    Internal { request_id: String, message: String },
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Invalid { .. } => "invalid",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Runtime(_) => "runtime",
            Error::Network(_) => "network",
            Error::AuthRequired => "auth_required",
            Error::Auth(_) => "auth",
            Error::Timeout => "timeout",
            Error::LimitReached(_) => "limit_reached",
            Error::Internal { .. } => "internal",
        }
    }

    pub fn invalid(path: impl Into<String>, code: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Invalid {
            path: path.into(),
            code: code.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn conflict(what: impl fmt::Display) -> Self {
        Error::Conflict(what.to_string())
    }

    pub fn runtime(what: impl fmt::Display) -> Self {
        Error::Runtime(what.to_string())
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        Error::Internal {
            request_id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
        }
    }

    /// Whether this kind is safe to retry with backoff at the orchestrator
    /// boundary, assuming the caller confirms the prior attempt did not
    /// persist (idempotent Create-ish calls only).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Network(_) | Error::Conflict(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Runtime(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Runtime(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(err.to_string())
        }
    }
}
