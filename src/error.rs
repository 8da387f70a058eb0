//! Error taxonomy shared by every component, plus the wire-level
//! representation ([`SerializableError`]) carried in non-2xx/213 responses.

use crate::codec::{Decode, Encode};
use std::io;

/// Typed error kind, independent of how it crossed the wire or which OS
/// produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("closed")]
    Closed,
    #[error("timeout")]
    Timeout,
    #[error("{op} {path}: {inner}")]
    PathError {
        op: String,
        path: String,
        inner: String,
    },
    #[error("server unreachable")]
    ServerUnreachable,
    #[error("circuit open")]
    CircuitOpen,
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("bulk length mismatch")]
    BulkLengthMismatch,
    #[error("empty response")]
    EmptyResponse,
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The wire-level `kind` string used by [`SerializableError`]. Limited
    /// to the closed set `{os.ErrNotExist, os.ErrPermission, os.ErrTimeout,
    /// os.ErrClosed, os.PathError, unknown}`; anything without a direct
    /// counterpart there collapses to `"unknown"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound => "os.ErrNotExist",
            Error::PermissionDenied => "os.ErrPermission",
            Error::Timeout => "os.ErrTimeout",
            Error::Closed => "os.ErrClosed",
            Error::PathError { .. } => "os.PathError",
            Error::MethodNotFound(_) => "os.ErrNotExist",
            Error::Invalid(_)
            | Error::ServerUnreachable
            | Error::CircuitOpen
            | Error::Truncated
            | Error::TooLarge
            | Error::BulkLengthMismatch
            | Error::EmptyResponse
            | Error::Io(_)
            | Error::Unknown(_) => "unknown",
        }
    }

    /// Map a platform `io::Error` encountered while servicing `op` on
    /// `path` into our taxonomy, preserving the original message.
    pub fn from_os_error(op: &str, path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::PathError {
                op: op.to_string(),
                path: path.to_string(),
                inner: err.to_string(),
            },
        }
    }

    pub fn status_code(&self) -> u32 {
        match self {
            Error::NotFound | Error::MethodNotFound(_) => 404,
            Error::PermissionDenied => 403,
            _ => 500,
        }
    }
}

/// Wire-level error payload, placed in `Response.data` for non-OK/213
/// status codes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializableError {
    pub kind: String,
    pub message: String,
    pub op: String,
    pub path: String,
}

impl From<&Error> for SerializableError {
    fn from(e: &Error) -> Self {
        let (op, path) = match e {
            Error::PathError { op, path, .. } => (op.clone(), path.clone()),
            _ => (String::new(), String::new()),
        };
        SerializableError {
            kind: e.kind().to_string(),
            message: e.to_string(),
            op,
            path,
        }
    }
}

impl SerializableError {
    /// Reconstruct a best-effort [`Error`] from the wire representation.
    pub fn into_error(self) -> Error {
        match self.kind.as_str() {
            "os.ErrNotExist" => Error::NotFound,
            "os.ErrPermission" => Error::PermissionDenied,
            "os.ErrTimeout" => Error::Timeout,
            "os.ErrClosed" => Error::Closed,
            "os.PathError" => Error::PathError {
                op: self.op,
                path: self.path,
                inner: self.message,
            },
            _ => Error::Unknown(self.message),
        }
    }
}

impl Encode for SerializableError {
    fn encode(&self, buf: &mut crate::codec::Encoder) {
        buf.write_string(&self.kind);
        buf.write_string(&self.message);
        buf.write_string(&self.op);
        buf.write_string(&self.path);
    }
}

impl Decode for SerializableError {
    fn decode(buf: &mut crate::codec::Decoder) -> Result<Self> {
        Ok(SerializableError {
            kind: buf.read_string()?,
            message: buf.read_string()?,
            op: buf.read_string()?,
            path: buf.read_string()?,
        })
    }
}
