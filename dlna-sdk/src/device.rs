//! Device, service and action schema.
//!
//! A [`Device`] is the registry record built from a UPnP device description.
//! Its [`Service`]s carry the action schema read from each service
//! description, which SOAP commands are checked against before being sent.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Prefix of standard UPnP service ids
pub const SERVICE_ID_PREFIX: &str = "urn:upnp-org:serviceId:";

/// Kind of device a handler looks after
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Any root device
    Device,
    /// `urn:schemas-upnp-org:device:MediaRenderer:1`
    Renderer,
    /// `urn:schemas-upnp-org:device:MediaServer:1`
    Server,
}

/// Per-kind protocol settings
#[derive(Debug)]
struct KindProfile {
    label: &'static str,
    search_target: &'static str,
    type_marker: Option<&'static str>,
    expands_last_change: bool,
}

const DEVICE_PROFILE: KindProfile = KindProfile {
    label: "Device",
    search_target: "upnp:rootdevice",
    type_marker: None,
    expands_last_change: false,
};

const RENDERER_PROFILE: KindProfile = KindProfile {
    label: "Renderer",
    search_target: "urn:schemas-upnp-org:device:MediaRenderer:1",
    type_marker: Some("MediaRenderer"),
    expands_last_change: true,
};

const SERVER_PROFILE: KindProfile = KindProfile {
    label: "Server",
    search_target: "urn:schemas-upnp-org:device:MediaServer:1",
    type_marker: Some("MediaServer"),
    expands_last_change: false,
};

impl DeviceKind {
    fn profile(self) -> &'static KindProfile {
        match self {
            DeviceKind::Device => &DEVICE_PROFILE,
            DeviceKind::Renderer => &RENDERER_PROFILE,
            DeviceKind::Server => &SERVER_PROFILE,
        }
    }

    pub fn label(self) -> &'static str {
        self.profile().label
    }

    /// `ST` of the M-SEARCH sent when no specific device is searched
    pub fn search_target(self) -> &'static str {
        self.profile().search_target
    }

    /// Marker the `deviceType`, the search target of a response and the
    /// `NT` of an advertisement must contain; `None` accepts any device
    pub fn type_marker(self) -> Option<&'static str> {
        self.profile().type_marker
    }

    /// Whether `text` mentions this kind's marker, case-insensitively
    pub fn matches_type(self, text: &str) -> bool {
        match self.type_marker() {
            Some(marker) => text.to_ascii_lowercase().contains(&marker.to_ascii_lowercase()),
            None => true,
        }
    }

    pub fn is_media(self) -> bool {
        self.type_marker().is_some()
    }

    /// Whether `LastChange` notifications are expanded into the state
    /// variables they carry
    pub fn expands_last_change(self) -> bool {
        self.profile().expands_last_change
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Liveness of a registry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub alive: bool,
    /// Last event that affected the status
    pub time: DateTime<Utc>,
    /// Last time the device was confirmed alive
    pub alive_last_time: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn alive_at(time: DateTime<Utc>) -> Self {
        Self {
            alive: true,
            time,
            alive_last_time: time,
        }
    }
}

/// A device known to a handler
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub kind: DeviceKind,
    pub udn: String,
    /// URL of the device description
    pub desc_url: String,
    /// Base for relative URLs; set once the description is fully parsed
    pub base_url: Option<String>,
    /// Host part of the description URL
    pub ip: String,
    pub friendly_name: String,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub model_description: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub icon_url: Option<String>,
    pub services: Vec<Arc<Service>>,
    pub status: DeviceStatus,
}

impl Device {
    /// Registry identity
    pub fn matches(&self, desc_url: &str, udn: &str) -> bool {
        self.desc_url == desc_url && self.udn == udn
    }

    pub fn is_alive(&self) -> bool {
        self.status.alive
    }

    /// Look a service up by its short id (`AVTransport`) or full id
    pub fn service(&self, id: &str) -> Option<&Arc<Service>> {
        self.services
            .iter()
            .find(|service| service.id == id || service.short_id() == id)
    }
}

/// A service of a device, with its action schema
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub service_type: String,
    pub id: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub desc_url: String,
    pub actions: Vec<Action>,
    /// State changes are evented through one `LastChange` variable
    pub event_through_last_change: bool,
}

impl Service {
    /// Id without the standard `urn:upnp-org:serviceId:` prefix
    pub fn short_id(&self) -> &str {
        self.id.strip_prefix(SERVICE_ID_PREFIX).unwrap_or(&self.id)
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|action| action.name == name)
    }

    /// Whether the state variable behind `argument` is evented on its own.
    ///
    /// Unknown when the service aggregates its events through `LastChange`.
    pub fn is_evented(&self, argument: &Argument) -> Option<bool> {
        if self.event_through_last_change {
            None
        } else {
            argument.event
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub arguments: Vec<Argument>,
}

impl Action {
    pub fn in_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|argument| argument.direction == Direction::In)
    }

    pub fn out_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|argument| argument.direction == Direction::Out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            v if v.eq_ignore_ascii_case("in") => Some(Direction::In),
            v if v.eq_ignore_ascii_case("out") => Some(Direction::Out),
            _ => None,
        }
    }
}

/// An action argument resolved against its related state variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub direction: Direction,
    /// `sendEvents` of the state variable, when declared
    pub event: Option<bool>,
    pub data_type: String,
    pub allowed_values: Option<Vec<String>>,
    /// (minimum, maximum)
    pub allowed_range: Option<(String, String)>,
    pub default_value: Option<String>,
}
