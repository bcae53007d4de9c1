//! Control-plane error taxonomy.
//!
//! Every fallible operation in the store, FSM, and auth subsystem returns
//! [`Error`]. Each variant is an abstract kind that the RPC layer maps onto
//! a gRPC status code; `Internal` additionally wraps the underlying cause
//! for logs. Raft leadership errors never appear here — the store façade
//! converts them into a forward attempt or `Internal`/`Unavailable`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract error kind, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Control-plane error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Wrap any error as `Internal`, preserving it as the cause.
    pub fn internal<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Error::Internal(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Flatten into the wire form carried in Raft apply responses.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            Error::NotFound(m)
            | Error::Conflict(m)
            | Error::InvalidArgument(m)
            | Error::Unauthenticated(m)
            | Error::PermissionDenied(m)
            | Error::Unavailable(m) => m.clone(),
            Error::Internal(e) => format!("{e:#}"),
        };
        WireError {
            kind: self.kind().as_str().to_string(),
            message,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.into())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => tonic::Status::not_found(msg),
            ErrorKind::Conflict => tonic::Status::already_exists(msg),
            ErrorKind::InvalidArgument => tonic::Status::invalid_argument(msg),
            ErrorKind::Unauthenticated => tonic::Status::unauthenticated(msg),
            ErrorKind::PermissionDenied => tonic::Status::permission_denied(msg),
            ErrorKind::Unavailable => tonic::Status::unavailable(msg),
            ErrorKind::Internal => tonic::Status::internal(msg),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Error::NotFound(msg),
            tonic::Code::AlreadyExists => Error::Conflict(msg),
            tonic::Code::InvalidArgument => Error::InvalidArgument(msg),
            tonic::Code::Unauthenticated => Error::Unauthenticated(msg),
            tonic::Code::PermissionDenied => Error::PermissionDenied(msg),
            tonic::Code::Unavailable => Error::Unavailable(msg),
            _ => Error::Internal(anyhow::anyhow!(msg)),
        }
    }
}

/// Serialisable error carried inside a Raft apply response. The FSM returns
/// command failures through the commit future rather than panicking, so the
/// kind has to survive a serde round-trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w.kind.as_str() {
            "not_found" => Error::NotFound(w.message),
            "conflict" => Error::Conflict(w.message),
            "invalid_argument" => Error::InvalidArgument(w.message),
            "unauthenticated" => Error::Unauthenticated(w.message),
            "permission_denied" => Error::PermissionDenied(w.message),
            "unavailable" => Error::Unavailable(w.message),
            _ => Error::Internal(anyhow::anyhow!(w.message)),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
