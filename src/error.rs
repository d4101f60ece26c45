//! Error types.

use std::{error::Error as StdError, fmt, io, sync::Arc};

use derive_more::Display;
use http::StatusCode;

use crate::retry::RequestHistory;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// A URL could not be parsed or normalized.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LocationParseError {
    /// Input is not a valid URL.
    #[display("Failed to parse: {}", _0)]
    Invalid(String),

    /// A host label could not be IDNA encoded.
    #[display("Name '{}' is not a valid IDNA label", _0)]
    InvalidIdnaLabel(String),

    /// URL has no host to connect to.
    #[display("No host specified: {}", _0)]
    MissingHost(String),
}

impl StdError for LocationParseError {}

/// The server sent something that is not a valid HTTP/1.1 response, or went away mid-exchange.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Response head could not be parsed.
    #[display("Invalid response head: {}", _0)]
    Head(httparse::Error),

    /// Status code outside of 100..=999.
    #[display("Invalid response status")]
    Status,

    /// Header name or value is not representable.
    #[display("Invalid response header")]
    Header,

    /// Content-Length is malformed or contradictory.
    #[display("Invalid Content-Length header")]
    ContentLength,

    /// Chunked transfer coding is malformed or truncated.
    #[display("Invalid chunked transfer encoding")]
    Chunked,

    /// Body ended before Content-Length bytes arrived.
    #[display("Response ended prematurely: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: u64, received: u64 },

    /// Peer closed the connection without sending a complete response head.
    #[display("Remote end closed connection without response")]
    ConnectionClosed,

    /// Transport failed while sending or receiving.
    #[display("Connection aborted: {}", _0)]
    Io(io::Error),
}

impl StdError for ProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ProtocolError::Head(err) => Some(err),
            ProtocolError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Why a retry budget ran out.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RetryReason {
    /// The last attempt failed with this error.
    Error(Arc<Error>),

    /// Redirect budget exhausted.
    TooManyRedirects,

    /// Status budget exhausted; carries the last status when known.
    TooManyErrorResponses(Option<StatusCode>),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Error(err) => write!(f, "{}", err),
            RetryReason::TooManyRedirects => f.write_str("too many redirects"),
            RetryReason::TooManyErrorResponses(Some(status)) => {
                write!(f, "too many {} error responses", status.as_u16())
            }
            RetryReason::TooManyErrorResponses(None) => f.write_str("too many error responses"),
        }
    }
}

/// A retry budget was exhausted.
#[derive(Debug)]
pub struct MaxRetryError {
    pub(crate) url: String,
    pub(crate) reason: RetryReason,
    pub(crate) history: Vec<RequestHistory>,
}

impl MaxRetryError {
    /// URL of the attempt that exhausted the budget.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reason(&self) -> &RetryReason {
        &self.reason
    }

    /// Every attempt made, oldest first, including the final one.
    pub fn history(&self) -> &[RequestHistory] {
        &self.history
    }
}

impl fmt::Display for MaxRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Max retries exceeded with url: {} (Caused by {})",
            self.url, self.reason
        )
    }
}

impl StdError for MaxRetryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.reason {
            RetryReason::Error(err) => Some(&**err),
            _ => None,
        }
    }
}

/// A set of errors that can occur while sending a request and reading its response.
#[derive(Debug, Display)]
#[non_exhaustive]
pub enum Error {
    /// Malformed URL.
    #[display("{}", _0)]
    LocationParse(LocationParseError),

    /// Connecting took too long.
    #[display("Connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    /// Waiting for data from the server took too long.
    #[display("Read timed out")]
    ReadTimeout,

    /// Transport connection could not be established.
    #[display("Failed to establish a new connection: {}", _0)]
    NewConnection(io::Error),

    /// TLS handshake or configuration failure.
    #[display("TLS error: {}", _0)]
    Ssl(BoxError),

    /// Blocking pool had no free connection before the wait expired.
    #[display("Pool reached maximum size and no connection was released in time")]
    EmptyPoolTimeout,

    /// Non-blocking pool is at its maximum size.
    #[display("Pool reached maximum size and no more connections are allowed")]
    FullPool,

    /// Pool has been closed.
    #[display("Pool is closed")]
    ClosedPool,

    /// Pool was asked to serve a URL on another host.
    #[display("Tried to open a foreign host with url: {url}")]
    HostChanged { url: String },

    /// Streamed request body could not be repositioned for a resend.
    #[display("{}", _0)]
    UnrewindableBody(&'static str),

    /// Reading the request body failed.
    #[display("Error reading request body: {}", _0)]
    Body(io::Error),

    /// Retry budget exhausted.
    #[display("{}", _0)]
    MaxRetry(MaxRetryError),

    /// Malformed header, e.g. `Retry-After`.
    #[display("{}", _0)]
    InvalidHeader(String),

    /// Request could not be built.
    #[display("Invalid request: {}", _0)]
    InvalidRequest(String),

    /// Malformed response or connection dropped mid-exchange.
    #[display("{}", _0)]
    Protocol(ProtocolError),

    /// Unknown backend name, or backend used in the wrong mode.
    #[display("{}", _0)]
    InvalidBackend(String),

    /// Option or feature the backend cannot honor.
    #[display("{}", _0)]
    NotSupported(String),
}

impl Error {
    /// Failed before a connection was established.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Error::ConnectTimeout { .. } | Error::NewConnection(_))
    }

    /// Failed after the request may have reached the server.
    pub fn is_read_error(&self) -> bool {
        matches!(self, Error::ReadTimeout | Error::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout { .. } | Error::ReadTimeout)
    }

    /// Transport-level failure that a retry policy may absorb.
    pub(crate) fn is_retryable(&self) -> bool {
        self.is_connect_error() || self.is_read_error() || matches!(self, Error::Ssl(_))
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::LocationParse(err) => Some(err),
            Error::NewConnection(err) => Some(err),
            Error::Ssl(err) => Some(&**err),
            Error::Body(err) => Some(err),
            Error::MaxRetry(err) => Some(err),
            Error::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LocationParseError> for Error {
    fn from(err: LocationParseError) -> Self {
        Error::LocationParse(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<MaxRetryError> for Error {
    fn from(err: MaxRetryError) -> Self {
        Error::MaxRetry(err)
    }
}
