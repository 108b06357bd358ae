//! Generic UPnP callback server for receiving event notifications.
//!
//! This crate provides a lightweight HTTP server for handling GENA `NOTIFY`
//! requests. It has no knowledge of device-specific protocols.
//!
//! # Overview
//!
//! - [`CallbackServer`]: listens on a local address and accepts each incoming
//!   connection on its own thread.
//! - [`EventRouter`]: hands out callback numbers and maps the number found in
//!   a request path (`/<n>`) to the registered [`NotificationSink`].
//! - [`parse_property_set`]: turns a `<e:propertyset>` body into ordered
//!   `(name, value)` pairs.
//!
//! A notification is acknowledged with `200` only when its callback number is
//! registered, its `SID` matches the sink's subscription, its `SEQ` is numeric
//! and its body parses; anything else is answered with `400`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use callback_server::{CallbackServer, EventNotification, EventRouter, NotificationSink, ServerConfig};
//!
//! struct Printer;
//!
//! impl NotificationSink for Printer {
//!     fn sid(&self) -> Option<String> {
//!         Some("uuid:subscription-123".to_string())
//!     }
//!     fn observe_seq(&self, _seq: u32) {}
//!     fn deliver(&self, notification: EventNotification) {
//!         println!("{:?}", notification.properties);
//!     }
//! }
//!
//! let router = Arc::new(EventRouter::new());
//! let number = router.register(Arc::new(Printer)).expect("shared router accepts sinks");
//! let server = CallbackServer::start(ServerConfig::default(), router)?;
//! println!("callback URL: http://{}/{}", server.local_addr(), number);
//! # Ok::<(), callback_server::CallbackError>(())
//! ```

mod error;
mod propertyset;
mod router;
mod server;

pub use error::{CallbackError, Result};
pub use propertyset::parse_property_set;
pub use router::{EventNotification, EventRouter, NotificationSink};
pub use server::{CallbackServer, ServerConfig, BAD_REQUEST_RESPONSE, OK_RESPONSE};
