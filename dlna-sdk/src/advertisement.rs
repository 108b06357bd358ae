//! Passive discovery through SSDP advertisements.
//!
//! An [`AdvertisementListener`] joins the SSDP multicast group on every
//! interface of the handlers it serves and feeds them the `NOTIFY`
//! announcements it hears: `ssdp:alive` registers or refreshes a device,
//! `ssdp:byebye` marks it not alive. One listener can serve several handlers,
//! so a renderer controller and a server browser share the same sockets.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use http_client::{HttpMessage, ReadOptions, POLL_SLICE};
use parking_lot::Mutex;

use crate::description::host_of;
use crate::error::{DlnaError, Result};
use crate::handler::{Handler, HandlerShared};
use crate::ssdp::{self, Datagram, DatagramSelector};

/// Largest announcement read
const ADVERTISEMENT_BUFFER: usize = 8192;

#[derive(Default)]
struct ServeState {
    stop: Option<Arc<AtomicBool>>,
    thread: Option<JoinHandle<()>>,
}

struct ListenerInner {
    handlers: Vec<Weak<HandlerShared>>,
    running: AtomicBool,
    state: Mutex<ServeState>,
}

/// Multicast listener shared by one or more handlers.
///
/// Creating the listener attaches it to every handler given; each handler
/// then reports through its own status signal and
/// [`wait_for_advertisement`](Handler::wait_for_advertisement).
#[derive(Clone)]
pub struct AdvertisementListener {
    inner: Arc<ListenerInner>,
}

impl AdvertisementListener {
    pub fn new(handlers: &[&Handler]) -> Self {
        let listener = Self {
            inner: Arc::new(ListenerInner {
                handlers: handlers
                    .iter()
                    .map(|handler| Arc::downgrade(&handler.shared))
                    .collect(),
                running: AtomicBool::new(false),
                state: Mutex::new(ServeState::default()),
            }),
        };
        for handler in handlers {
            handler.shared.advertisement.lock().listener = Some(listener.clone());
        }
        listener
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start listening on a background thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!("advertisement listener already activated");
            return Err(DlnaError::AlreadyActive("advertisement listener".to_string()));
        }
        if let Some(previous) = state.thread.take() {
            let _ = previous.join();
        }
        for handler in self.handlers() {
            handler.shared.advertisement_running.store(true, Ordering::SeqCst);
            handler
                .shared
                .advertisement
                .lock()
                .status
                .get_or_insert_with(Default::default);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let inner = self.inner.clone();
        let serve_stop = stop.clone();
        let spawned = thread::Builder::new()
            .name("ssdp-advertisement".to_string())
            .spawn(move || serve(&inner, &serve_stop));
        match spawned {
            Ok(thread) => {
                tracing::info!("advertisement listener started");
                state.stop = Some(stop);
                state.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                mark_stopped(&self.inner);
                Err(e.into())
            }
        }
    }

    /// Stop listening and wait for the sockets to be closed.
    pub fn stop(&self) {
        let thread = {
            let mut state = self.inner.state.lock();
            if let Some(stop) = state.stop.take() {
                stop.store(true, Ordering::SeqCst);
            }
            state.thread.take()
        };
        if self.is_running() {
            tracing::info!("advertisement listener stopped");
        }
        mark_stopped(&self.inner);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Wait for a registry change of `handler` reported by this listener.
    pub fn wait(&self, handler: &Handler, timeout: Option<Duration>) -> Option<bool> {
        let status = handler.advertisement_status()?;
        let changed = status.wait(timeout);
        if changed {
            status.clear();
        }
        Some(changed)
    }

    fn handlers(&self) -> Vec<Handler> {
        live_handlers(&self.inner.handlers)
    }
}

impl std::fmt::Debug for AdvertisementListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertisementListener")
            .field("handlers", &self.inner.handlers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn live_handlers(handlers: &[Weak<HandlerShared>]) -> Vec<Handler> {
    handlers
        .iter()
        .filter_map(Weak::upgrade)
        .map(Handler::from_shared)
        .collect()
}

fn mark_stopped(inner: &ListenerInner) {
    inner.running.store(false, Ordering::SeqCst);
    for handler in live_handlers(&inner.handlers) {
        handler.shared.advertisement_running.store(false, Ordering::SeqCst);
    }
}

fn serve(inner: &Arc<ListenerInner>, stop: &AtomicBool) {
    let mut ips: Vec<Ipv4Addr> = live_handlers(&inner.handlers)
        .iter()
        .flat_map(|handler| handler.ips().to_vec())
        .collect();
    ips.sort();
    ips.dedup();

    let mut sockets = Vec::with_capacity(ips.len());
    for (interface, ip) in ips.iter().enumerate() {
        match ssdp::advertisement_socket(*ip) {
            Ok(socket) => {
                tracing::debug!(%ip, "listening for advertisements");
                sockets.push((interface, socket));
            }
            Err(e) => tracing::info!(%ip, error = %e, "could not listen for advertisements"),
        }
    }
    if sockets.is_empty() {
        tracing::warn!("no interface to listen for advertisements on");
        mark_stopped(inner);
        return;
    }

    let mut selector = match DatagramSelector::new(sockets, ADVERTISEMENT_BUFFER) {
        Ok(selector) => selector,
        Err(e) => {
            tracing::warn!(error = %e, "could not listen for advertisements");
            mark_stopped(inner);
            return;
        }
    };
    while !stop.load(Ordering::SeqCst) {
        let Some(datagram) = selector.select(POLL_SLICE) else {
            continue;
        };
        let handlers = inner.handlers.clone();
        let ip = ips[datagram.interface];
        let spawned = thread::Builder::new()
            .name("ssdp-notify".to_string())
            .spawn(move || handle_datagram(&handlers, ip, &datagram));
        if let Err(e) = spawned {
            tracing::debug!(error = %e, "could not spawn advertisement handler");
        }
    }
    selector.shutdown();
}

/// Dispatch one announcement received on interface `ip`.
fn handle_datagram(handlers: &[Weak<HandlerShared>], ip: Ipv4Addr, datagram: &Datagram) {
    let options = ReadOptions {
        body: false,
        ..ReadOptions::default()
    };
    let Ok(message) = HttpMessage::from_datagram(&datagram.data, &options) else {
        return;
    };
    if message.method() != Some("NOTIFY") {
        return;
    }
    let handlers = live_handlers(handlers);
    let nt = message.header("NT").unwrap_or_default();
    let only_media = handlers.iter().all(|handler| handler.kind().is_media());
    if only_media && !nt.to_ascii_lowercase().contains("media") {
        return;
    }

    let time = Utc::now();
    let nts = message.header("NTS").unwrap_or_default().to_ascii_lowercase();
    let usn = message.header("USN").unwrap_or_default();
    let udn = ssdp::udn_from_usn(usn);
    let desc_url = message.header("Location").unwrap_or_default().trim();
    let sender = datagram.from.ip();
    tracing::debug!(%ip, %usn, from = %datagram.from, %nts, "advertisement received");
    let location_trusted = host_of(desc_url) == Some(sender.to_string());

    for handler in &handlers {
        if !handler.ips().contains(&ip) || !handler.kind().matches_type(nt) {
            continue;
        }
        if nts.contains("alive") {
            handler.handle_alive(desc_url, &udn, time, ip, location_trusted);
        } else if nts.contains("byebye") {
            handler.handle_byebye(desc_url, &udn, time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerConfig;
    use crate::device::DeviceKind;
    use crate::handler::tests::device;
    use chrono::TimeZone;
    use std::net::{IpAddr, SocketAddr};

    fn renderer() -> Handler {
        let config = HandlerConfig::default().with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Handler::new(DeviceKind::Renderer, config).unwrap()
    }

    fn notify(nt: &str, nts: &str, usn: &str, location: &str) -> Datagram {
        let data = format!(
            "NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nNT: {}\r\nNTS: {}\r\nUSN: {}\r\nLOCATION: {}\r\n\r\n",
            nt, nts, usn, location
        );
        Datagram {
            interface: 0,
            data: data.into_bytes(),
            from: SocketAddr::from((Ipv4Addr::LOCALHOST, 1900)),
        }
    }

    #[test]
    fn test_byebye_reaches_matching_handler() {
        let handler = renderer();
        let _listener = AdvertisementListener::new(&[&handler]);
        let registered = device("uuid:r1", "Renderer", true, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        handler.publish(registered.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let datagram = notify(
            "urn:schemas-upnp-org:device:MediaRenderer:1",
            "ssdp:byebye",
            "uuid:r1::urn:schemas-upnp-org:device:MediaRenderer:1",
            &registered.desc_url,
        );
        handle_datagram(&[Arc::downgrade(&handler.shared)], Ipv4Addr::LOCALHOST, &datagram);
        assert!(!handler.refreshed(&registered).unwrap().is_alive());
    }

    #[test]
    fn test_non_media_announcements_are_discarded() {
        let handler = renderer();
        let registered = device("uuid:r1", "Renderer", true, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        handler.publish(registered.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let datagram = notify("upnp:rootdevice", "ssdp:byebye", "uuid:r1::upnp:rootdevice", &registered.desc_url);
        handle_datagram(&[Arc::downgrade(&handler.shared)], Ipv4Addr::LOCALHOST, &datagram);
        assert!(handler.refreshed(&registered).unwrap().is_alive());
    }

    #[test]
    fn test_other_interface_is_ignored() {
        let handler = renderer();
        let registered = device("uuid:r1", "Renderer", true, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        handler.publish(registered.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let datagram = notify(
            "urn:schemas-upnp-org:device:MediaRenderer:1",
            "ssdp:byebye",
            "uuid:r1::urn:schemas-upnp-org:device:MediaRenderer:1",
            &registered.desc_url,
        );
        handle_datagram(&[Arc::downgrade(&handler.shared)], Ipv4Addr::new(10, 0, 0, 1), &datagram);
        assert!(handler.refreshed(&registered).unwrap().is_alive());
    }

    #[test]
    fn test_new_attaches_to_handlers() {
        let first = renderer();
        let second = Handler::new(
            DeviceKind::Server,
            HandlerConfig::default().with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        )
        .unwrap();
        let listener = AdvertisementListener::new(&[&first, &second]);
        assert!(!listener.is_running());
        assert!(first.shared.advertisement.lock().listener.is_some());
        assert!(second.shared.advertisement.lock().listener.is_some());
        assert_eq!(listener.wait(&first, Some(Duration::from_millis(1))), None);
    }
}
