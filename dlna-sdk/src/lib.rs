//! DLNA/UPnP control point library
//!
//! This crate finds media renderers and servers on the local network, keeps
//! track of their liveness, sends them SOAP commands and receives their GENA
//! events. It is synchronous: background work runs on plain threads and every
//! blocking call takes a timeout.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use dlna_sdk::{Controller, HandlerConfig, MediaItem};
//!
//! let controller = Controller::new(HandlerConfig::default())?;
//! controller.discover(None);
//!
//! for renderer in controller.renderers().iter().filter(|r| r.is_alive()) {
//!     println!("{} ({})", renderer.friendly_name, renderer.ip);
//! }
//!
//! if let Some(tv) = controller.search(None, Some("Living Room TV"), true) {
//!     let item = MediaItem::new("http://192.168.1.10:8000/movie.mkv", "Movie");
//!     controller.send_uri(&tv, &item, None)?;
//!     controller.play(&tv)?;
//!
//!     // Wait for the renderer to report the end of playback
//!     let subscription = controller.new_event_subscription(&tv, "AVTransport", 0u16, false)?;
//!     let stopped = controller.add_event_warning(&subscription, "TransportState", &["STOPPED"], None);
//!     controller.send_event_subscription(&subscription, 300)?;
//!     controller.wait_for_warning(&stopped, Some(Duration::from_secs(3600)), false);
//!     controller.send_event_unsubscription(&subscription)?;
//! }
//! # Ok::<(), dlna_sdk::DlnaError>(())
//! ```
//!
//! # Keeping the registry current
//!
//! [`Handler::start_discovery_polling`] repeats the search periodically and
//! [`Handler::start_advertisement_listening`] follows the `ssdp:alive` and
//! `ssdp:byebye` announcements of devices. Both hand out a [`Signal`] raised
//! on every registry change.

mod advertisement;
pub mod config;
mod controller;
mod description;
pub mod device;
pub mod didl;
pub mod error;
pub mod events;
mod handler;
pub mod logging;
mod network;
mod signal;
pub mod ssdp;
mod xml;

pub use advertisement::AdvertisementListener;
pub use config::HandlerConfig;
pub use controller::{Controller, StoppedReason, TransportInfo};
pub use device::{Action, Argument, Device, DeviceKind, DeviceStatus, Direction, Service};
pub use didl::{MediaItem, MediaKind};
pub use error::{DlnaError, Result};
pub use events::{
    parse_last_change, DlnaEvent, EventListener, EventWarning, NotificationListener,
    NotificationTarget,
};
pub use handler::{Handler, SoapMessage};
pub use signal::Signal;

pub use http_client::StopToken;
