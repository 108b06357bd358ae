use thiserror::Error;

/// Errors of the callback server
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to bind callback server on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid notification request: {0}")]
    Http(#[from] http_client::HttpError),

    #[error("rejected notification: {0}")]
    Rejected(String),

    #[error("invalid property set: {0}")]
    PropertySet(String),
}

pub type Result<T> = std::result::Result<T, CallbackError>;
