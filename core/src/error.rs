//! Error taxonomy for every netkit operation.
//!
//! # Design
//! A single closed `NetworkingError` covers the five failure kinds callers
//! need to tell apart: build-time problems (`Internal`), protocol failures
//! (`Http`), transport failures (`Transport`), invalid lifecycle transitions
//! (`State`) and cancellation. Decode failures live under
//! `InternalError::CouldNotParse` so "reached the server, bad payload" never
//! looks like "never reached the server".
//!
//! Every type here is `Clone + Eq` so errors can be replayed into event
//! streams and compared in tests. Opaque transport errors are captured as
//! `domain + code` and compare on exactly those two fields.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::status::StatusCategory;

pub type Result<T, E = NetworkingError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkingError {
    #[error(transparent)]
    Internal(#[from] InternalError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("operation was cancelled")]
    Cancelled,
}

impl NetworkingError {
    /// True for explicit cancellation and for transport errors that report one.
    pub fn is_cancellation(&self) -> bool {
        match self {
            NetworkingError::Cancelled => true,
            NetworkingError::Transport(err) => err.is_cancellation(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetworkingError::Http(err) => Some(err.status),
            _ => None,
        }
    }

    /// Resume data attached to a failed download, if the transport produced any.
    pub fn resume_data(&self) -> Option<&Bytes> {
        match self {
            NetworkingError::Transport(err) => err.resume_data.as_ref(),
            _ => None,
        }
    }
}

impl From<TransportError> for NetworkingError {
    fn from(err: TransportError) -> Self {
        if err.is_cancellation() {
            NetworkingError::Cancelled
        } else {
            NetworkingError::Transport(err)
        }
    }
}

/// Failures raised by netkit itself rather than by the server or transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("no request could be built")]
    NoRequest,

    #[error("transport returned no HTTP response")]
    NoResponse,

    #[error("could not parse response body: {0}")]
    CouldNotParse(String),

    #[error("owner was released before the operation finished")]
    LostReferenceOfSelf,

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("unknown error")]
    Unknown,
}

/// A response whose status code is treated as failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    pub category: StatusCategory,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

impl HttpError {
    pub fn new(status: u16, headers: BTreeMap<String, String>) -> Self {
        Self {
            category: StatusCategory::from_code(status),
            status,
            headers,
        }
    }

    pub fn description(&self) -> &'static str {
        crate::status::description(self.status)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {} ({}): {}", self.status, self.category, self.description())
    }
}

impl std::error::Error for HttpError {}

/// Opaque transport failure, reduced to a comparable `domain + code`.
#[derive(Debug, Clone, Error)]
#[error("{domain} error {code}: {message}")]
pub struct TransportError {
    pub domain: String,
    pub code: i64,
    pub message: String,
    /// Present when a failed download can continue from where it stopped.
    pub resume_data: Option<Bytes>,
}

impl TransportError {
    /// Domain used for errors produced by netkit-aware transports.
    pub const URL_DOMAIN: &'static str = "URLError";
    /// Code reported for a task that was cancelled.
    pub const CANCELLED: i64 = -999;
    pub const TIMED_OUT: i64 = -1001;
    pub const CANNOT_CONNECT: i64 = -1004;
    pub const NOT_CONNECTED: i64 = -1009;

    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
            resume_data: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Self::URL_DOMAIN, Self::CANCELLED, "cancelled")
    }

    pub fn with_resume_data(mut self, data: Bytes) -> Self {
        self.resume_data = Some(data);
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.domain == Self::URL_DOMAIN && self.code == Self::CANCELLED
    }
}

impl PartialEq for TransportError {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && self.code == other.code
    }
}

impl Eq for TransportError {}

/// An operation was invoked in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} while {state}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: String,
}

impl StateError {
    pub fn new(operation: &'static str, state: impl fmt::Display) -> Self {
        Self {
            operation,
            state: state.to_string(),
        }
    }
}
