//! Media renderer control.
//!
//! [`Controller`] is a [`Handler`] for media renderers with the AVTransport
//! and RenderingControl commands used to drive playback. Subscriptions made
//! through it expand the `LastChange` events of renderers into the state
//! variables they carry.

use std::collections::HashMap;
use std::ops::Deref;
use std::time::Duration;

use http_client::StopToken;

use crate::config::HandlerConfig;
use crate::device::{Device, DeviceKind};
use crate::didl::MediaItem;
use crate::error::{DlnaError, Result};
use crate::handler::Handler;

const AV_TRANSPORT: &str = "AVTransport";
const RENDERING_CONTROL: &str = "RenderingControl";

/// Budget of `SetAVTransportURI`, which renderers may answer only once
/// they opened the media
const URI_TIMEOUT: Duration = Duration::from_secs(20);

/// Budget of the position and duration queries
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Current,
    Next,
}

/// Transport state as reported by `GetTransportInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    /// e.g. `PLAYING`, `STOPPED`, `PAUSED_PLAYBACK`, `TRANSITIONING`
    pub state: String,
    /// `OK` or `ERROR_OCCURRED`
    pub status: String,
}

/// Vendor reason of the last stop, from `X_GetStoppedReason`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedReason {
    pub reason: String,
    pub data: String,
}

/// Control point for media renderers.
///
/// ```no_run
/// use dlna_sdk::{Controller, HandlerConfig, MediaItem};
///
/// let controller = Controller::new(HandlerConfig::default())?;
/// controller.discover(None);
/// if let Some(tv) = controller.search(None, Some("Living Room TV"), true) {
///     controller.send_uri(&tv, &MediaItem::new("http://192.168.1.10:8000/movie.mkv", "Movie"), None)?;
///     controller.play(&tv)?;
/// }
/// # Ok::<(), dlna_sdk::DlnaError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Controller {
    handler: Handler,
}

impl Deref for Controller {
    type Target = Handler;

    fn deref(&self) -> &Handler {
        &self.handler
    }
}

impl Controller {
    pub fn new(config: HandlerConfig) -> Result<Self> {
        Ok(Self {
            handler: Handler::new(DeviceKind::Renderer, config)?,
        })
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Registered renderers, not-alive ones included
    pub fn renderers(&self) -> Vec<Device> {
        self.handler.devices()
    }

    fn set_uri(
        &self,
        renderer: &Device,
        slot: Slot,
        item: &MediaItem,
        local: bool,
        stop: Option<StopToken>,
    ) -> Result<()> {
        let (action, uri_argument, metadata_argument) = match slot {
            Slot::Current => ("SetAVTransportURI", "CurrentURI", "CurrentURIMetaData"),
            Slot::Next => ("SetNextAVTransportURI", "NextURI", "NextURIMetaData"),
        };
        let metadata = item.to_didl(local);
        self.handler.send_soap_msg_with(
            renderer,
            AV_TRANSPORT,
            action,
            &[
                ("InstanceID", "0"),
                (uri_argument, item.uri.as_str()),
                (metadata_argument, metadata.as_str()),
            ],
            URI_TIMEOUT,
            stop,
        )?;
        Ok(())
    }

    /// Load a public URI.
    pub fn send_uri(&self, renderer: &Device, item: &MediaItem, stop: Option<StopToken>) -> Result<()> {
        self.set_uri(renderer, Slot::Current, item, false, stop)
    }

    /// Load a URI served by the local delivery server.
    pub fn send_local_uri(&self, renderer: &Device, item: &MediaItem, stop: Option<StopToken>) -> Result<()> {
        self.set_uri(renderer, Slot::Current, item, true, stop)
    }

    /// Queue a public URI after the current one.
    pub fn send_uri_next(&self, renderer: &Device, item: &MediaItem, stop: Option<StopToken>) -> Result<()> {
        self.set_uri(renderer, Slot::Next, item, false, stop)
    }

    /// Queue a URI of the local delivery server after the current one.
    pub fn send_local_uri_next(&self, renderer: &Device, item: &MediaItem, stop: Option<StopToken>) -> Result<()> {
        self.set_uri(renderer, Slot::Next, item, true, stop)
    }

    pub fn play(&self, renderer: &Device) -> Result<()> {
        self.handler
            .send_soap_msg(renderer, AV_TRANSPORT, "Play", &[("InstanceID", "0"), ("Speed", "1")])?;
        Ok(())
    }

    pub fn stop(&self, renderer: &Device) -> Result<()> {
        self.handler
            .send_soap_msg(renderer, AV_TRANSPORT, "Stop", &[("InstanceID", "0")])?;
        Ok(())
    }

    pub fn pause(&self, renderer: &Device) -> Result<()> {
        self.handler
            .send_soap_msg(renderer, AV_TRANSPORT, "Pause", &[("InstanceID", "0")])?;
        Ok(())
    }

    /// Seek to a `H:MM:SS` position of the current track.
    pub fn seek(&self, renderer: &Device, target: &str) -> Result<()> {
        self.handler.send_soap_msg(
            renderer,
            AV_TRANSPORT,
            "Seek",
            &[("InstanceID", "0"), ("Unit", "REL_TIME"), ("Target", target)],
        )?;
        Ok(())
    }

    fn query(&self, renderer: &Device, action: &str, timeout: Duration) -> Result<HashMap<String, String>> {
        self.handler
            .send_soap_msg_with(renderer, AV_TRANSPORT, action, &[("InstanceID", "0")], timeout, None)
    }

    /// Playback position (`RelTime`)
    pub fn get_position(&self, renderer: &Device) -> Result<String> {
        output(self.query(renderer, "GetPositionInfo", QUERY_TIMEOUT)?, "RelTime")
    }

    /// Duration of the loaded media (`MediaDuration`)
    pub fn get_duration(&self, renderer: &Device) -> Result<String> {
        output(self.query(renderer, "GetMediaInfo", QUERY_TIMEOUT)?, "MediaDuration")
    }

    /// Duration of the current track (`TrackDuration`), for renderers that
    /// leave `MediaDuration` empty
    pub fn get_duration_fallback(&self, renderer: &Device) -> Result<String> {
        output(self.query(renderer, "GetPositionInfo", QUERY_TIMEOUT)?, "TrackDuration")
    }

    pub fn get_transport_info(&self, renderer: &Device) -> Result<TransportInfo> {
        let mut outputs = self.query(renderer, "GetTransportInfo", self.handler.config().soap_timeout)?;
        Ok(TransportInfo {
            state: take(&mut outputs, "CurrentTransportState")?,
            status: take(&mut outputs, "CurrentTransportStatus")?,
        })
    }

    pub fn get_stopped_reason(&self, renderer: &Device) -> Result<StoppedReason> {
        let mut outputs = self.query(renderer, "X_GetStoppedReason", self.handler.config().soap_timeout)?;
        Ok(StoppedReason {
            reason: take(&mut outputs, "StoppedReason")?,
            data: take(&mut outputs, "StoppedReasonData")?,
        })
    }

    pub fn get_mute(&self, renderer: &Device) -> Result<bool> {
        let outputs = self.handler.send_soap_msg(
            renderer,
            RENDERING_CONTROL,
            "GetMute",
            &[("InstanceID", "0"), ("Channel", "Master")],
        )?;
        let mute = output(outputs, "CurrentMute")?;
        match mute.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other if other.eq_ignore_ascii_case("true") => Ok(true),
            other if other.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(DlnaError::InvalidResponse(format!("CurrentMute {}", other))),
        }
    }

    pub fn set_mute(&self, renderer: &Device, mute: bool) -> Result<()> {
        self.handler.send_soap_msg(
            renderer,
            RENDERING_CONTROL,
            "SetMute",
            &[
                ("InstanceID", "0"),
                ("Channel", "Master"),
                ("DesiredMute", if mute { "1" } else { "0" }),
            ],
        )?;
        Ok(())
    }

    pub fn get_volume(&self, renderer: &Device) -> Result<u16> {
        let outputs = self.handler.send_soap_msg(
            renderer,
            RENDERING_CONTROL,
            "GetVolume",
            &[("InstanceID", "0"), ("Channel", "Master")],
        )?;
        let volume = output(outputs, "CurrentVolume")?;
        volume
            .trim()
            .parse()
            .map_err(|_| DlnaError::InvalidResponse(format!("CurrentVolume {}", volume)))
    }

    pub fn set_volume(&self, renderer: &Device, volume: u16) -> Result<()> {
        let volume = volume.to_string();
        self.handler.send_soap_msg(
            renderer,
            RENDERING_CONTROL,
            "SetVolume",
            &[("InstanceID", "0"), ("Channel", "Master"), ("DesiredVolume", volume.as_str())],
        )?;
        Ok(())
    }
}

fn take(outputs: &mut HashMap<String, String>, name: &str) -> Result<String> {
    outputs
        .remove(name)
        .ok_or_else(|| DlnaError::InvalidResponse(format!("missing {}", name)))
}

fn output(mut outputs: HashMap<String, String>, name: &str) -> Result<String> {
    take(&mut outputs, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn controller() -> Controller {
        Controller::new(HandlerConfig::default().with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap()
    }

    #[test]
    fn test_controller_handles_renderers() {
        let controller = controller();
        assert_eq!(controller.kind(), DeviceKind::Renderer);
        assert!(controller.renderers().is_empty());
    }

    #[test]
    fn test_missing_output_is_invalid() {
        let mut outputs = HashMap::from([("RelTime".to_string(), "0:00:10".to_string())]);
        assert_eq!(take(&mut outputs, "RelTime").unwrap(), "0:00:10");
        assert!(matches!(take(&mut outputs, "RelTime"), Err(DlnaError::InvalidResponse(_))));
    }

    #[test]
    fn test_unregistered_renderer_is_refused() {
        let controller = controller();
        let renderer = crate::handler::tests::device("uuid:r", "R", true, chrono::Utc::now());
        assert!(matches!(controller.play(&renderer), Err(DlnaError::UnknownDevice(_))));
    }
}
