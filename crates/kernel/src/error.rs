//! Kernel-wide error kinds.
//!
//! Every subsystem has its own error enum (`StoreError`, `EngineError`,
//! `ProxyError`, `CryptoError`); they all convert into [`Error`], and the
//! HTTP layer maps [`Error::kind`] to a status code in exactly one place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("mutating operations are locked down: {0}")]
    LockedDown(String),

    #[error("plan quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("container engine error: {0}")]
    EngineError(String),

    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("port conflict: {0}")]
    PortConflict(String),

    #[error("proxy configuration rejected: {0}")]
    ProxyInvalid(String),

    #[error("service is crash-looping; unlock it before starting")]
    CrashLooping,

    #[error("too many pending lifecycle operations for this service")]
    Busy,

    #[error("operation superseded by a newer command")]
    Superseded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind code used in API error bodies and audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Validation(_) => "validation",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::LockedDown(_) => "locked_down",
            Error::QuotaExceeded(_) => "quota_exceeded",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::EngineError(_) => "engine_error",
            Error::ImagePullFailed(_) => "image_pull_failed",
            Error::PortConflict(_) => "port_conflict",
            Error::ProxyInvalid(_) => "proxy_invalid",
            Error::CrashLooping => "crash_looping",
            Error::Busy => "busy",
            Error::Superseded => "superseded",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a retry at the caller's boundary may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::EngineUnavailable(_) | Error::Busy)
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::NotFound(what) => Error::NotFound(what),
            StoreError::UniqueConflict(what) => Error::Conflict(what),
            StoreError::ConstraintViolation(what) => Error::Conflict(what),
            StoreError::Transient(msg) => Error::Internal(format!("transient store error: {msg}")),
            StoreError::Fatal(msg) => Error::Internal(format!("store error: {msg}")),
        }
    }
}

impl From<crate::engine::EngineError> for Error {
    fn from(err: crate::engine::EngineError) -> Self {
        use crate::engine::EngineError;
        match err {
            EngineError::Unreachable(msg) => Error::EngineUnavailable(msg),
            EngineError::ImagePullFailed(msg) => Error::ImagePullFailed(msg),
            EngineError::NotFound(id) => Error::NotFound(format!("container {id}")),
            EngineError::PortConflict(msg) => Error::PortConflict(msg),
            EngineError::Cancelled => Error::Cancelled,
            EngineError::Engine(msg) => Error::EngineError(msg),
        }
    }
}

impl From<crate::certs::CryptoError> for Error {
    fn from(err: crate::certs::CryptoError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crate::proxy::ProxyError> for Error {
    fn from(err: crate::proxy::ProxyError) -> Self {
        use crate::proxy::ProxyError;
        match err {
            ProxyError::Invalid(msg) => Error::ProxyInvalid(msg),
            other => Error::Internal(other.to_string()),
        }
    }
}
