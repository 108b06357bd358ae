//! Minimal HTTP/1.x engine used by every dlna-sdk component.
//!
//! The crate speaks just enough HTTP for UPnP control points:
//!
//! - [`HttpMessage`] parses requests and responses from UDP datagrams (SSDP)
//!   and from TCP/TLS streams (descriptions, SOAP, GENA), including chunked
//!   bodies, `Expect: 100-continue` and size/time budgets.
//! - [`HttpRequest`] is a client that reuses a caller-owned
//!   [`PersistentConnection`], follows redirects and can be cancelled through
//!   a [`StopToken`].
//!
//! Failures never panic: parsing and requests return [`HttpError`] and the
//! connection involved is closed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use http_client::HttpRequest;
//!
//! let response = HttpRequest::new("http://192.168.1.20:8080/description.xml")
//!     .timeout(Duration::from_secs(5))
//!     .send()?;
//! assert_eq!(response.code(), Some(200));
//! # Ok::<(), http_client::HttpError>(())
//! ```

mod cancel;
mod client;
mod connection;
mod error;
mod headers;
mod message;

pub use cancel::StopToken;
pub use client::{HttpRequest, DEFAULT_TIMEOUT, MAX_REDIRECTS};
pub use connection::{Connection, MessageStream, PersistentConnection};
pub use error::{HttpError, Result};
pub use headers::{normalize_name, Headers};
pub use message::{
    Charset, HttpMessage, ReadOptions, StartLine, DEFAULT_MAX_LENGTH, POLL_SLICE,
};
