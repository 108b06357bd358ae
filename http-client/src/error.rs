//! Error types for the HTTP engine

use thiserror::Error;

/// Errors raised while reading, writing or exchanging HTTP messages
#[derive(Debug, Error)]
pub enum HttpError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Only http and https are spoken
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// No connection could be established to the peer
    #[error("connection failed: {0}")]
    Connect(String),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// A read or the whole exchange ran out of time
    #[error("operation timed out")]
    Timeout,

    /// The caller's stop token was raised
    #[error("operation cancelled")]
    Cancelled,

    /// The peer closed the connection before the message was complete
    #[error("connection closed before the message was complete")]
    ConnectionClosed,

    /// Start line, header or chunk framing is not valid HTTP
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The header section exceeded its budget
    #[error("header section exceeds the size limit")]
    HeaderTooLarge,

    /// The body exceeded its budget
    #[error("body exceeds the size limit")]
    BodyTooLarge,

    /// The body is not valid in the requested charset
    #[error("body decoding failed: {0}")]
    Decode(String),

    /// More than five redirects or interim responses in one exchange
    #[error("too many redirects")]
    TooManyRedirects,

    /// A redirect response without a Location header
    #[error("redirect response without a Location header")]
    MissingLocation,
}

/// Result alias for the HTTP engine
pub type Result<T> = std::result::Result<T, HttpError>;
