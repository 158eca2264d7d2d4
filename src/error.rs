//! Error taxonomy shared by every layer of the adapter.
//!
//! Each variant maps onto the errno value the block-device host reports to its
//! client, see [`AdapterError::errno`].

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = AdapterError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no {name} was specified through the '{name}=' parameter")]
    MissingParameter { name: &'static str },

    #[error("invalid value for '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("remote request failed with HTTP status {status}: {context}")]
    HttpStatus { status: u16, context: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("short read at offset {offset}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("out of bounds access: offset {offset} count {count} size {size}")]
    OutOfRange { offset: u64, count: u64, size: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown handle {0}")]
    UnknownHandle(u64),

    #[error("gave up waiting for {what} after {waited:?}")]
    PollTimeout { what: String, waited: Duration },

    #[error("unexpected remote response: {0}")]
    Protocol(String),

    #[error("plugin is not configured")]
    NotConfigured,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// The errno the host should report for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            AdapterError::MissingParameter { name } => match *name {
                "endpoint_url" => libc::EHOSTUNREACH,
                "username" | "password" => libc::EPERM,
                "target_id" => libc::ENXIO,
                _ => libc::EINVAL,
            },
            AdapterError::InvalidParameter { .. } => libc::EINVAL,
            AdapterError::Auth(_) => libc::EACCES,
            AdapterError::NotFound(_) => libc::ENOENT,
            AdapterError::HttpStatus { status, .. } => match *status {
                401 | 403 => libc::EACCES,
                404 => libc::ENOENT,
                _ => libc::EIO,
            },
            AdapterError::Transport(_) | AdapterError::ShortRead { .. } => libc::EIO,
            AdapterError::Protocol(_) => libc::EPROTO,
            AdapterError::OutOfRange { .. }
            | AdapterError::InvalidRequest(_)
            | AdapterError::UnknownHandle(_) => libc::EINVAL,
            AdapterError::PollTimeout { .. } => libc::ETIMEDOUT,
            AdapterError::NotConfigured => libc::ENXIO,
            AdapterError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Errors caused by the caller's arguments rather than the remote side.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            AdapterError::OutOfRange { .. }
                | AdapterError::InvalidRequest(_)
                | AdapterError::UnknownHandle(_)
        )
    }

    /// Short symbolic name of [`errno`](Self::errno), for diagnostics.
    pub fn errno_name(&self) -> &'static str {
        match self.errno() {
            libc::EHOSTUNREACH => "EHOSTUNREACH",
            libc::EPERM => "EPERM",
            libc::EACCES => "EACCES",
            libc::ENXIO => "ENXIO",
            libc::ENOENT => "ENOENT",
            libc::EINVAL => "EINVAL",
            libc::EPROTO => "EPROTO",
            libc::ETIMEDOUT => "ETIMEDOUT",
            _ => "EIO",
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return AdapterError::HttpStatus {
                status: status.as_u16(),
                context: e.to_string(),
            };
        }
        if e.is_decode() {
            return AdapterError::Protocol(e.to_string());
        }
        AdapterError::Transport(e.to_string())
    }
}

impl From<url::ParseError> for AdapterError {
    fn from(e: url::ParseError) -> Self {
        AdapterError::Protocol(format!("bad URL: {e}"))
    }
}
