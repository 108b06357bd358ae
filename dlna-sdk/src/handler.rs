//! Device registry, SSDP discovery and device control.
//!
//! A [`Handler`] looks after the devices of one [`DeviceKind`]. It finds them
//! by active search ([`discover`](Handler::discover), optionally repeated by a
//! polling thread) or passively through an
//! [`AdvertisementListener`](crate::AdvertisementListener), keeps their
//! liveness up to date, sends them SOAP commands and manages GENA
//! subscriptions to their services.
//!
//! Handlers are cheap to clone; clones share the same registry.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use http_client::{HttpMessage, HttpRequest, ReadOptions, StopToken, POLL_SLICE};
use parking_lot::Mutex;
use soap_client::{CallOptions, SoapClient, SoapError};

use crate::advertisement::AdvertisementListener;
use crate::config::HandlerConfig;
use crate::description::{self, host_of};
use crate::device::{Device, DeviceKind, DeviceStatus, SERVICE_ID_PREFIX};
use crate::error::{DlnaError, Result};
use crate::events::{EventListener, EventWarning, NotificationListener, NotificationTarget};
use crate::network;
use crate::signal::Signal;
use crate::ssdp::{self, DatagramSelector, MAX_DATAGRAM, MULTICAST_ADDR, SSDP_PORT};

/// A registered device and the local address it was found from
#[derive(Debug, Clone)]
struct Entry {
    device: Device,
    hip: IpAddr,
}

/// A SOAP command checked against the action schema, ready to be posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapMessage {
    pub control_url: String,
    /// Short service name, e.g. `AVTransport`
    pub service: String,
    pub action: String,
    pub envelope: String,
    /// Output arguments declared by the action
    pub out_arguments: Vec<String>,
}

#[derive(Default)]
struct PollingState {
    status: Option<Signal>,
    shutdown: Option<Signal>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct AdvertisementState {
    pub(crate) status: Option<Signal>,
    pub(crate) listener: Option<AdvertisementListener>,
}

pub(crate) struct HandlerShared {
    kind: DeviceKind,
    config: HandlerConfig,
    ip: Ipv4Addr,
    ips: Vec<Ipv4Addr>,
    soap: SoapClient,
    registry: Mutex<Vec<Entry>>,
    polling_running: AtomicBool,
    polling: Mutex<PollingState>,
    pub(crate) advertisement_running: AtomicBool,
    pub(crate) advertisement: Mutex<AdvertisementState>,
}

/// Registry and control point for one kind of device.
///
/// ```no_run
/// use dlna_sdk::{DeviceKind, Handler, HandlerConfig};
///
/// let handler = Handler::new(DeviceKind::Server, HandlerConfig::default())?;
/// handler.discover(None);
/// for server in handler.devices().iter().filter(|d| d.is_alive()) {
///     println!("{} at {}", server.friendly_name, server.ip);
/// }
/// # Ok::<(), dlna_sdk::DlnaError>(())
/// ```
#[derive(Clone)]
pub struct Handler {
    pub(crate) shared: Arc<HandlerShared>,
}

impl Handler {
    /// Create a handler, resolving the local interface(s) to work on.
    pub fn new(kind: DeviceKind, config: HandlerConfig) -> Result<Self> {
        config.validate()?;
        let explicit = match config.ip {
            None => None,
            Some(IpAddr::V4(ip)) => Some(ip),
            Some(IpAddr::V6(ip)) => {
                return Err(DlnaError::Configuration(format!(
                    "IPv6 address {} is not supported",
                    ip
                )))
            }
        };
        let ip = network::resolve_ip(explicit);
        let ips = network::interface_ips(ip);
        let soap = SoapClient::new()
            .with_connect_timeout(config.soap_connect_timeout)
            .with_max_length(config.soap_max_length)
            .with_gena_timeout(config.gena_timeout);
        tracing::info!(kind = %kind, %ip, interfaces = ?ips, "handler created");

        Ok(Self {
            shared: Arc::new(HandlerShared {
                kind,
                config,
                ip,
                ips,
                soap,
                registry: Mutex::new(Vec::new()),
                polling_running: AtomicBool::new(false),
                polling: Mutex::new(PollingState::default()),
                advertisement_running: AtomicBool::new(false),
                advertisement: Mutex::new(AdvertisementState::default()),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<HandlerShared>) -> Self {
        Self { shared }
    }

    pub fn kind(&self) -> DeviceKind {
        self.shared.kind
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.shared.config
    }

    /// Address the handler is bound to; unspecified when working on every
    /// interface.
    pub fn ip(&self) -> Ipv4Addr {
        self.shared.ip
    }

    /// Interfaces searched and listened on
    pub fn ips(&self) -> &[Ipv4Addr] {
        &self.shared.ips
    }

    /// Snapshot of the registry, not-alive devices included
    pub fn devices(&self) -> Vec<Device> {
        self.shared
            .registry
            .lock()
            .iter()
            .map(|entry| entry.device.clone())
            .collect()
    }

    /// Local address the device was found from
    pub fn hip_of(&self, device: &Device) -> Option<IpAddr> {
        self.shared
            .registry
            .lock()
            .iter()
            .find(|entry| entry.device.matches(&device.desc_url, &device.udn))
            .map(|entry| entry.hip)
    }

    /// Current record of a device, by identity
    pub fn refreshed(&self, device: &Device) -> Option<Device> {
        self.shared
            .registry
            .lock()
            .iter()
            .find(|entry| entry.device.matches(&device.desc_url, &device.udn))
            .map(|entry| entry.device.clone())
    }

    /// First device matching the filters.
    ///
    /// `uuid` is compared with the UDN, `name` with the friendly name (case
    /// insensitive). A matching device that is alive, and fully described when
    /// `complete` is set, is preferred; otherwise the last matching record is
    /// returned, which may be stale. Without filters only such a preferred
    /// device is returned.
    pub fn search(&self, uuid: Option<&str>, name: Option<&str>, complete: bool) -> Option<Device> {
        let udn = uuid.map(|uuid| format!("uuid:{}", uuid));
        let name = name.map(str::to_lowercase);
        let registry = self.shared.registry.lock();
        let mut found = None;
        for entry in registry.iter() {
            let device = &entry.device;
            let preferred = device.is_alive() && (!complete || device.base_url.is_some());
            let filtered = udn.is_some() || name.is_some();
            let matching = udn.as_ref().map_or(true, |udn| &device.udn == udn)
                && name
                    .as_ref()
                    .map_or(true, |name| &device.friendly_name.to_lowercase() == name);
            if !matching || (!filtered && !preferred) {
                continue;
            }
            found = Some(device);
            if preferred {
                break;
            }
        }
        found.cloned()
    }

    /// Fetch a description and register the device it describes.
    ///
    /// Returns true when a record was added or replaced. A device already
    /// known and alive only gets its liveness refreshed, without its
    /// description being parsed again.
    pub fn update_devices(
        &self,
        desc_url: &str,
        time: DateTime<Utc>,
        hip: IpAddr,
        status_change: Option<&Signal>,
    ) -> bool {
        match self.try_update_devices(desc_url, time, hip, status_change) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::trace!(%desc_url, error = %e, "description rejected");
                false
            }
        }
    }

    fn try_update_devices(
        &self,
        desc_url: &str,
        time: DateTime<Utc>,
        hip: IpAddr,
        status_change: Option<&Signal>,
    ) -> Result<bool> {
        let timeout = self.shared.config.description_timeout;
        let response = HttpRequest::new(desc_url)
            .timeout(timeout)
            .source_ip(hip)
            .send()?;
        if response.code() != Some(200) {
            return Err(DlnaError::InvalidResponse(format!(
                "description request answered {}",
                response.code().unwrap_or_default()
            )));
        }
        let root = description::parse_document(response.body())?;
        let udn = description::identify(&root, self.shared.kind)?;
        if self.refresh_known(desc_url, &udn, time) {
            return Ok(false);
        }

        let device = description::describe(
            &root,
            self.shared.kind,
            desc_url,
            udn,
            DeviceStatus::alive_at(time),
            |url| fetch(url, hip, timeout),
        )?;
        if !self.publish(device, hip) {
            return Ok(false);
        }
        if let Some(signal) = status_change {
            signal.set();
        }
        Ok(true)
    }

    /// Refresh the timestamps of a known alive device; false when the device
    /// is unknown or not alive.
    fn refresh_known(&self, desc_url: &str, udn: &str, time: DateTime<Utc>) -> bool {
        let mut registry = self.shared.registry.lock();
        match registry
            .iter_mut()
            .find(|entry| entry.device.matches(desc_url, udn))
        {
            Some(entry) if entry.device.status.alive => {
                let status = &mut entry.device.status;
                if status.time < time {
                    status.time = time;
                    status.alive_last_time = time;
                }
                true
            }
            _ => false,
        }
    }

    /// Add or replace a fully built record. A record made alive concurrently
    /// wins and only gets its timestamps refreshed.
    pub(crate) fn publish(&self, device: Device, hip: IpAddr) -> bool {
        let mut registry = self.shared.registry.lock();
        match registry
            .iter_mut()
            .find(|entry| entry.device.matches(&device.desc_url, &device.udn))
        {
            Some(entry) if entry.device.status.alive => {
                let status = &mut entry.device.status;
                if status.time < device.status.time {
                    status.time = device.status.time;
                    status.alive_last_time = device.status.time;
                }
                false
            }
            Some(entry) => {
                tracing::info!(
                    kind = %self.shared.kind,
                    name = %device.friendly_name,
                    ip = %device.ip,
                    "device back"
                );
                *entry = Entry { device, hip };
                true
            }
            None => {
                tracing::info!(
                    kind = %self.shared.kind,
                    name = %device.friendly_name,
                    ip = %device.ip,
                    services = device.services.len(),
                    "device registered"
                );
                registry.push(Entry { device, hip });
                true
            }
        }
    }

    /// Search the network once for `timeout` and wait for every description
    /// fetched meanwhile. Devices (or the device `uuid`) not confirmed alive
    /// within `alive_persistence` before the search are marked not alive.
    pub fn discover_with(&self, uuid: Option<&str>, timeout: Duration, alive_persistence: Duration) {
        self.discovery_round(uuid, timeout, alive_persistence, false);
    }

    /// [`discover_with`](Self::discover_with) using the configured timeout
    /// and persistence.
    pub fn discover(&self, uuid: Option<&str>) {
        let config = &self.shared.config;
        self.discover_with(uuid, config.discovery_timeout, config.alive_persistence);
    }

    /// One search round; returns whether devices were marked not alive.
    fn discovery_round(
        &self,
        uuid: Option<&str>,
        timeout: Duration,
        alive_persistence: Duration,
        polling: bool,
    ) -> bool {
        let kind = self.shared.kind;
        let msearch = ssdp::msearch(kind, uuid);
        tracing::debug!(kind = %kind, uuid, "sending M-SEARCH");

        let mut sockets = Vec::with_capacity(self.shared.ips.len());
        for (interface, ip) in self.shared.ips.iter().enumerate() {
            match ssdp::search_socket(*ip) {
                Ok(socket) => {
                    let _ = socket.send_to(msearch.as_bytes(), SocketAddrV4::new(*ip, SSDP_PORT));
                    match socket.send_to(msearch.as_bytes(), SocketAddrV4::new(MULTICAST_ADDR, SSDP_PORT)) {
                        Ok(_) => tracing::debug!(%ip, "M-SEARCH sent"),
                        Err(e) => tracing::info!(%ip, error = %e, "could not send M-SEARCH"),
                    }
                    sockets.push((interface, socket));
                }
                Err(e) => tracing::info!(%ip, error = %e, "could not open search socket"),
            }
        }

        let round_start = Utc::now();
        let status_change = if polling {
            self.shared.polling.lock().status.clone()
        } else {
            None
        };
        let mut updates: Vec<JoinHandle<bool>> = Vec::new();
        match DatagramSelector::new(sockets, MAX_DATAGRAM) {
            Ok(mut selector) => {
                let started = Instant::now();
                while started.elapsed() <= timeout && (!polling || self.is_discovery_polling()) {
                    let slice = timeout.saturating_sub(started.elapsed()).min(POLL_SLICE);
                    let Some(datagram) = selector.select(slice) else {
                        continue;
                    };
                    let hip = self.shared.ips[datagram.interface];
                    tracing::debug!(%hip, from = %datagram.from, "search response received");
                    if let Some(location) = self.accept_response(uuid, &datagram.data, datagram.from.ip()) {
                        let handler = self.clone();
                        let signal = status_change.clone();
                        let time = Utc::now();
                        let spawned = thread::Builder::new()
                            .name("dlna-update".to_string())
                            .spawn(move || {
                                handler.update_devices(&location, time, IpAddr::V4(hip), signal.as_ref())
                            });
                        match spawned {
                            Ok(update) => updates.push(update),
                            Err(e) => tracing::warn!(error = %e, "could not spawn description update"),
                        }
                    }
                }
                selector.shutdown();
            }
            Err(e) => tracing::warn!(error = %e, "could not listen for search responses"),
        }

        for update in updates {
            let _ = update.join();
        }

        let trimmed = self.expire(uuid, round_start, alive_persistence);
        if trimmed && polling {
            if let Some(signal) = &status_change {
                signal.set();
            }
        }
        trimmed
    }

    /// Location of a valid search response: status 200, matching search
    /// target, description hosted by the sender.
    fn accept_response(&self, uuid: Option<&str>, data: &[u8], sender: IpAddr) -> Option<String> {
        let options = ReadOptions {
            body: false,
            ..ReadOptions::default()
        };
        let response = HttpMessage::from_datagram(data, &options).ok()?;
        if response.code() != Some(200) {
            return None;
        }
        let st = response.header("ST").unwrap_or_default();
        if !ssdp::search_matches(self.shared.kind, uuid, st) {
            return None;
        }
        let location = response.header("Location")?.trim().to_string();
        if host_of(&location) != Some(sender.to_string()) {
            tracing::trace!(%sender, %location, "search response ignored");
            return None;
        }
        Some(location)
    }

    /// Mark not alive the devices last confirmed more than `persistence`
    /// before `round_start`.
    fn expire(&self, uuid: Option<&str>, round_start: DateTime<Utc>, persistence: Duration) -> bool {
        let udn = uuid.map(|uuid| format!("uuid:{}", uuid));
        let now = Utc::now();
        let mut trimmed = false;
        let mut registry = self.shared.registry.lock();
        for entry in registry.iter_mut() {
            let device = &mut entry.device;
            if !device.status.alive || udn.as_ref().is_some_and(|udn| &device.udn != udn) {
                continue;
            }
            let stale = (round_start - device.status.alive_last_time)
                .to_std()
                .is_ok_and(|age| age > persistence);
            if stale {
                device.status.alive = false;
                device.status.time = now;
                trimmed = true;
                tracing::info!(kind = %self.shared.kind, name = %device.friendly_name, ip = %device.ip, "device lost");
            }
        }
        trimmed
    }

    pub fn is_discovery_polling(&self) -> bool {
        self.shared.polling_running.load(Ordering::SeqCst)
    }

    /// [`start_discovery_polling_with`](Self::start_discovery_polling_with)
    /// using the configured timeout, persistence and period.
    pub fn start_discovery_polling(&self, signal: Option<Signal>) -> Result<Signal> {
        let config = &self.shared.config;
        self.start_discovery_polling_with(
            config.discovery_timeout,
            config.alive_persistence,
            config.polling_period,
            signal,
        )
    }

    /// Search the network every `polling_period` on a background thread.
    ///
    /// The returned signal (`signal` when given) is raised whenever the
    /// registry changes. The first round never expires devices.
    pub fn start_discovery_polling_with(
        &self,
        timeout: Duration,
        alive_persistence: Duration,
        polling_period: Duration,
        signal: Option<Signal>,
    ) -> Result<Signal> {
        let mut polling = self.shared.polling.lock();
        if self.shared.polling_running.swap(true, Ordering::SeqCst) {
            tracing::info!(kind = %self.shared.kind, "discovery polling already activated");
            return Err(DlnaError::AlreadyActive("discovery polling".to_string()));
        }
        tracing::info!(kind = %self.shared.kind, "discovery polling started");
        let status = signal.unwrap_or_default();
        let shutdown = Signal::new();
        polling.status = Some(status.clone());
        polling.shutdown = Some(shutdown.clone());

        let handler = self.clone();
        let first_round = self.shared.config.first_round_persistence;
        let spawned = thread::Builder::new()
            .name(format!("dlna-polling-{}", self.shared.kind.label().to_lowercase()))
            .spawn(move || {
                handler.poll(timeout, first_round, alive_persistence, polling_period, &shutdown)
            });
        match spawned {
            Ok(thread) => {
                polling.thread = Some(thread);
                Ok(status)
            }
            Err(e) => {
                self.shared.polling_running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn poll(
        &self,
        timeout: Duration,
        first_round: Duration,
        alive_persistence: Duration,
        polling_period: Duration,
        shutdown: &Signal,
    ) {
        let mut persistence = first_round;
        while self.is_discovery_polling() && !shutdown.is_set() {
            self.discovery_round(None, timeout, persistence, true);
            if !self.is_discovery_polling() {
                break;
            }
            persistence = alive_persistence;
            shutdown.wait(Some(polling_period));
        }
        self.shared.polling_running.store(false, Ordering::SeqCst);
    }

    /// Stop the polling thread and wait for its current round to end.
    pub fn stop_discovery_polling(&self) {
        let thread = {
            let mut polling = self.shared.polling.lock();
            if let Some(shutdown) = &polling.shutdown {
                shutdown.set();
            }
            if self.shared.polling_running.swap(false, Ordering::SeqCst) {
                tracing::info!(kind = %self.shared.kind, "discovery polling stopped");
                if let Some(status) = &polling.status {
                    status.set();
                }
            }
            polling.thread.take()
        };
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }

    /// Wait for a registry change reported by discovery polling.
    ///
    /// Returns `None` when polling is not running (including when it was
    /// stopped during the wait), otherwise whether a change was reported.
    pub fn wait_for_discovery(&self, timeout: Option<Duration>) -> Option<bool> {
        let status = self.shared.polling.lock().status.clone()?;
        let changed = status.wait(timeout);
        if changed {
            status.clear();
        }
        self.is_discovery_polling().then_some(changed)
    }

    /// Start a listener dedicated to this handler.
    pub fn start_advertisement_listening(&self, signal: Option<Signal>) -> Result<Signal> {
        if self.is_advertisement_listening() {
            tracing::info!(kind = %self.shared.kind, "advertisement listening already activated");
            return Err(DlnaError::AlreadyActive("advertisement listening".to_string()));
        }
        let status = signal.unwrap_or_default();
        self.shared.advertisement.lock().status = Some(status.clone());
        let listener = AdvertisementListener::new(&[self]);
        listener.start()?;
        tracing::info!(kind = %self.shared.kind, "advertisement listening started");
        Ok(status)
    }

    pub fn stop_advertisement_listening(&self) {
        let listener = self.shared.advertisement.lock().listener.clone();
        if let Some(listener) = listener {
            if self.is_advertisement_listening() {
                tracing::info!(kind = %self.shared.kind, "advertisement listening stopped");
            }
            listener.stop();
        }
    }

    pub fn is_advertisement_listening(&self) -> bool {
        self.shared.advertisement_running.load(Ordering::SeqCst)
    }

    /// Wait for a registry change reported by advertisements; `None` when
    /// listening was never started.
    pub fn wait_for_advertisement(&self, timeout: Option<Duration>) -> Option<bool> {
        let listener = self.shared.advertisement.lock().listener.clone()?;
        listener.wait(self, timeout)
    }

    pub(crate) fn advertisement_status(&self) -> Option<Signal> {
        self.shared.advertisement.lock().status.clone()
    }

    /// An `ssdp:alive` for a device of this handler's kind.
    pub(crate) fn handle_alive(
        &self,
        desc_url: &str,
        udn: &str,
        time: DateTime<Utc>,
        hip: Ipv4Addr,
        location_trusted: bool,
    ) {
        let known_alive = {
            let mut registry = self.shared.registry.lock();
            registry
                .iter_mut()
                .find(|entry| entry.device.matches(desc_url, udn))
                .map(|entry| {
                    let status = &mut entry.device.status;
                    if status.alive && status.time < time {
                        status.time = time;
                        status.alive_last_time = time;
                    }
                    status.alive
                })
        };
        match known_alive {
            Some(true) => {}
            Some(false) => {
                self.update_devices(desc_url, time, IpAddr::V4(hip), self.advertisement_status().as_ref());
            }
            None if location_trusted => {
                self.update_devices(desc_url, time, IpAddr::V4(hip), self.advertisement_status().as_ref());
            }
            None => tracing::trace!(%desc_url, %udn, "advertisement ignored"),
        }
    }

    /// An `ssdp:byebye` for a device of this handler's kind.
    pub(crate) fn handle_byebye(&self, desc_url: &str, udn: &str, time: DateTime<Utc>) {
        let mut registry = self.shared.registry.lock();
        if let Some(entry) = registry
            .iter_mut()
            .find(|entry| entry.device.matches(desc_url, udn))
        {
            let device = &mut entry.device;
            if device.status.alive {
                device.status.alive = false;
                tracing::info!(kind = %self.shared.kind, name = %device.friendly_name, ip = %device.ip, "device left");
                if let Some(signal) = self.advertisement_status() {
                    signal.set();
                }
            }
            device.status.time = time;
        }
    }

    /// Check a command against the action schema and build its envelope.
    ///
    /// Every input argument must be given or have a default value, and no
    /// other argument may be given; otherwise the command is abandoned.
    pub fn build_soap_msg(
        &self,
        device: &Device,
        service: &str,
        action: &str,
        arguments: &[(&str, &str)],
    ) -> Result<SoapMessage> {
        let short = service.strip_prefix(SERVICE_ID_PREFIX).unwrap_or(service);
        let schema = device
            .service(short)
            .ok_or_else(|| DlnaError::UnknownService(short.to_string()))?;
        let declared = schema.action(action).ok_or_else(|| DlnaError::UnknownAction {
            service: short.to_string(),
            action: action.to_string(),
        })?;
        let abandon = |reason: String| DlnaError::Abandoned {
            service: short.to_string(),
            action: action.to_string(),
            reason,
        };

        let mut values = Vec::new();
        let mut supplied = 0;
        for argument in declared.in_arguments() {
            let value = match arguments.iter().find(|(name, _)| *name == argument.name) {
                Some((_, value)) => {
                    supplied += 1;
                    value.to_string()
                }
                None => argument
                    .default_value
                    .clone()
                    .filter(|default| !default.is_empty())
                    .ok_or_else(|| abandon(format!("missing argument {}", argument.name)))?,
            };
            values.push((argument.name.as_str(), value));
        }
        if supplied < arguments.len() {
            let unexpected = arguments
                .iter()
                .find(|(name, _)| !declared.in_arguments().any(|argument| argument.name == *name))
                .map_or("duplicate argument", |(name, _)| name);
            return Err(abandon(format!("unexpected argument {}", unexpected)));
        }

        Ok(SoapMessage {
            control_url: schema.control_url.clone(),
            service: short.to_string(),
            action: action.to_string(),
            envelope: soap_client::build_envelope(short, action, &values),
            out_arguments: declared.out_arguments().map(|argument| argument.name.clone()).collect(),
        })
    }

    /// [`send_soap_msg_with`](Self::send_soap_msg_with) using the configured
    /// SOAP timeout and no stop token.
    pub fn send_soap_msg(
        &self,
        device: &Device,
        service: &str,
        action: &str,
        arguments: &[(&str, &str)],
    ) -> Result<HashMap<String, String>> {
        self.send_soap_msg_with(device, service, action, arguments, self.shared.config.soap_timeout, None)
    }

    /// Send a command and return its output arguments; the map is empty for
    /// actions without outputs.
    pub fn send_soap_msg_with(
        &self,
        device: &Device,
        service: &str,
        action: &str,
        arguments: &[(&str, &str)],
        soap_timeout: Duration,
        stop: Option<StopToken>,
    ) -> Result<HashMap<String, String>> {
        let hip = self
            .hip_of(device)
            .ok_or_else(|| DlnaError::UnknownDevice(device.friendly_name.clone()))?;
        let message = self
            .build_soap_msg(device, service, action, arguments)
            .map_err(|e| {
                tracing::info!(name = %device.friendly_name, service, action, error = %e, "command abandoned");
                e
            })?;
        tracing::debug!(name = %device.friendly_name, service = %message.service, action, "sending command");

        let options = CallOptions {
            source_ip: Some(hip),
            max_time: Some(soap_timeout + Duration::from_secs(1)),
            stop,
        };
        let result = self.shared.soap.call(
            &message.control_url,
            &message.service,
            &message.action,
            &message.envelope,
            &message.out_arguments,
            &options,
        );
        match &result {
            Ok(_) => tracing::info!(name = %device.friendly_name, service = %message.service, action, "command succeeded"),
            Err(e) => tracing::info!(name = %device.friendly_name, service = %message.service, action, error = %e, "command failed"),
        }
        result.map_err(DlnaError::from)
    }

    /// A listener several subscriptions can share, bound to the handler
    /// address.
    pub fn new_notification_listener(&self, port: u16) -> NotificationListener {
        NotificationListener::new(IpAddr::V4(self.shared.ip), port)
    }

    /// Prepare a subscription to a service of a registered device.
    ///
    /// A port as `target` creates a private notification listener for this
    /// subscription alone; it is started and stopped with it. With `log`, the
    /// received events are kept in the listener's events log.
    pub fn new_event_subscription(
        &self,
        device: &Device,
        service: &str,
        target: impl Into<NotificationTarget>,
        log: bool,
    ) -> Result<EventListener> {
        let hip = self
            .hip_of(device)
            .ok_or_else(|| DlnaError::UnknownDevice(device.friendly_name.clone()))?;
        let short = service.strip_prefix(SERVICE_ID_PREFIX).unwrap_or(service);
        let schema = device
            .service(short)
            .cloned()
            .ok_or_else(|| DlnaError::UnknownService(short.to_string()))?;
        let notifications = match target.into() {
            NotificationTarget::Port(port) => NotificationListener::private(IpAddr::V4(self.shared.ip), port),
            NotificationTarget::Listener(listener) => listener,
        };
        EventListener::register(device.clone(), schema, hip, notifications, log)
    }

    /// Subscribe; returns the timeout granted by the device, in seconds.
    pub fn send_event_subscription(&self, listener: &EventListener, timeout_seconds: u32) -> Result<u32> {
        let name = listener.device().friendly_name.clone();
        let service = listener.service().short_id().to_string();
        if !listener.activate() {
            tracing::info!(%name, %service, "subscription already activated");
            return Err(DlnaError::AlreadyActive("event subscription".to_string()));
        }
        let notifications = listener.notification_listener();
        let started = if notifications.is_private() {
            notifications.start()
        } else {
            Ok(())
        };
        let outcome = started.and_then(|()| {
            self.shared
                .soap
                .subscribe(
                    &listener.service().event_sub_url,
                    &listener.callback_url(),
                    timeout_seconds,
                    Some(listener.hip()),
                )
                .map_err(DlnaError::from)
        });

        match outcome {
            Ok(response) => {
                tracing::info!(%name, %service, sid = %response.sid, timeout = response.timeout_seconds, "subscribed");
                listener.set_sid(Some(response.sid));
                Ok(response.timeout_seconds)
            }
            Err(e) => {
                listener.unregister();
                listener.deactivate();
                if notifications.is_private() {
                    notifications.stop();
                }
                tracing::info!(%name, %service, error = %e, "subscription failed");
                Err(e)
            }
        }
    }

    /// Renew a subscription; returns the timeout granted by the device.
    pub fn renew_event_subscription(&self, listener: &EventListener, timeout_seconds: u32) -> Result<u32> {
        let name = &listener.device().friendly_name;
        let service = listener.service().short_id();
        let sid = listener.sid().ok_or(SoapError::MissingSid)?;
        match self.shared.soap.renew_subscription(
            &listener.service().event_sub_url,
            &sid,
            timeout_seconds,
            Some(listener.hip()),
        ) {
            Ok(granted) => {
                tracing::info!(%name, %service, %sid, timeout = granted, "subscription renewed");
                Ok(granted)
            }
            Err(e) => {
                tracing::info!(%name, %service, %sid, error = %e, "subscription renewal failed");
                Err(e.into())
            }
        }
    }

    /// Cancel a subscription. Local bookkeeping is released whatever the
    /// device answers.
    pub fn send_event_unsubscription(&self, listener: &EventListener) -> Result<()> {
        let name = &listener.device().friendly_name;
        let service = listener.service().short_id();
        listener.unregister();
        listener.deactivate();
        let result = match listener.sid() {
            Some(sid) => self
                .shared
                .soap
                .unsubscribe(&listener.service().event_sub_url, &sid, Some(listener.hip()))
                .map_err(DlnaError::from),
            None => Err(SoapError::MissingSid.into()),
        };
        let notifications = listener.notification_listener();
        if notifications.is_private() {
            notifications.stop();
        }
        match &result {
            Ok(()) => tracing::info!(%name, %service, "unsubscribed"),
            Err(e) => tracing::info!(%name, %service, error = %e, "unsubscription failed"),
        }
        result
    }

    /// Watch `property` on a subscription, optionally only for some values.
    pub fn add_event_warning(
        &self,
        listener: &EventListener,
        property: &str,
        values: &[&str],
        signal: Option<Signal>,
    ) -> EventWarning {
        listener.add_warning(property, values, signal)
    }

    /// Wait for a warning to trigger and return the triggering value.
    ///
    /// With `clear`, earlier triggers are forgotten first. A value already
    /// fresh is returned at once. Wake-ups without a fresh value are waited
    /// out until the timeout elapses.
    pub fn wait_for_warning(&self, warning: &EventWarning, timeout: Option<Duration>, clear: bool) -> Option<String> {
        let signal = warning.signal();
        if clear {
            warning.clear();
            signal.clear();
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(value) = warning.fresh() {
                signal.clear();
                return Some(value);
            }
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|remaining| remaining.is_zero()) || !signal.wait(remaining) {
                return warning.fresh();
            }
            signal.clear();
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("kind", &self.shared.kind)
            .field("ip", &self.shared.ip)
            .field("ips", &self.shared.ips)
            .field("devices", &self.shared.registry.lock().len())
            .finish()
    }
}

/// GET a service description, `None` on any failure.
fn fetch(url: &str, hip: IpAddr, timeout: Duration) -> Option<Vec<u8>> {
    match HttpRequest::new(url).timeout(timeout).source_ip(hip).send() {
        Ok(response) if response.code() == Some(200) => Some(response.into_body()),
        Ok(response) => {
            tracing::trace!(%url, code = response.code().unwrap_or_default(), "service description unavailable");
            None
        }
        Err(e) => {
            tracing::trace!(%url, error = %e, "service description unavailable");
            None
        }
    }
}
