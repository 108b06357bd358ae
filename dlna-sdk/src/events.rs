//! GENA event reception.
//!
//! A [`NotificationListener`] runs the embedded callback server receiving
//! `NOTIFY` requests. Each subscription is an [`EventListener`] registered on
//! it under a callback number; the number is the path of the callback URL
//! given to the device. Notifications update the listener's sequence number,
//! optionally land in its events log, and are checked against its
//! [`EventWarning`]s.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use callback_server::{CallbackServer, EventNotification, EventRouter, NotificationSink, ServerConfig};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use xmltree::Element;

use crate::device::{Device, Service};
use crate::error::{DlnaError, Result};
use crate::signal::Signal;
use crate::xml;

/// Property changes carried by one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlnaEvent {
    pub receipt_time: DateTime<Utc>,
    /// `(name, value)` pairs in document order, `LastChange` expanded
    pub changes: Vec<(String, String)>,
}

/// Latest event sequence number of a subscription; only ever raised.
#[derive(Debug, Clone, Default)]
pub(crate) struct SeqCounter(Arc<Mutex<Option<u32>>>);

impl SeqCounter {
    pub(crate) fn get(&self) -> Option<u32> {
        *self.0.lock()
    }

    pub(crate) fn raise(&self, seq: u32) {
        let mut current = self.0.lock();
        if current.map_or(true, |current| seq > current) {
            *current = Some(seq);
        }
    }
}

/// Expand a `LastChange` value into the state variables it carries.
///
/// The value is an XML fragment whose root holds one instance element; every
/// element below it with a `val` attribute becomes a change. Returns `None`
/// when the value is not XML.
pub fn parse_last_change(value: &str) -> Option<Vec<(String, String)>> {
    let root = Element::parse(value.as_bytes()).ok()?;
    let Some(instance) = xml::child_elements(&root).next() else {
        return Some(Vec::new());
    };
    let changes = xml::child_elements(instance)
        .filter_map(|variable| {
            variable
                .attributes
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("val"))
                .map(|(_, value)| (variable.name.clone(), value.clone()))
        })
        .collect();
    Some(changes)
}

/// Changes of a notification, `LastChange` expanded when `expand` is set
/// and its value parses.
pub(crate) fn collect_changes(properties: Vec<(String, String)>, expand: bool) -> Vec<(String, String)> {
    let mut changes = Vec::with_capacity(properties.len());
    for (name, value) in properties {
        if name.eq_ignore_ascii_case("LastChange") && expand {
            match parse_last_change(&value) {
                Some(expanded) => changes.extend(expanded),
                None => changes.push((name, value)),
            }
        } else {
            changes.push((name, value));
        }
    }
    changes
}

#[derive(Debug, Default)]
struct WarningState {
    triggered: bool,
    trigger_seq: Option<u32>,
    last_value: Option<String>,
}

struct WarningInner {
    property: String,
    values: Option<Vec<String>>,
    signal: Signal,
    seq: SeqCounter,
    state: Mutex<WarningState>,
}

/// Watch on one property of a subscription.
///
/// A warning triggers when a notification newer than its last trigger
/// carries the property, with one of the accepted values when a set of
/// values was given. Triggering records the value and raises the signal.
#[derive(Clone)]
pub struct EventWarning {
    inner: Arc<WarningInner>,
}

impl EventWarning {
    pub(crate) fn new(seq: SeqCounter, property: &str, values: &[&str], signal: Option<Signal>) -> Self {
        let values = (!values.is_empty()).then(|| values.iter().map(|v| v.to_string()).collect());
        Self {
            inner: Arc::new(WarningInner {
                property: property.to_string(),
                values,
                signal: signal.unwrap_or_default(),
                seq,
                state: Mutex::new(WarningState::default()),
            }),
        }
    }

    pub fn property(&self) -> &str {
        &self.inner.property
    }

    pub fn values(&self) -> Option<&[String]> {
        self.inner.values.as_deref()
    }

    pub fn signal(&self) -> &Signal {
        &self.inner.signal
    }

    /// Forget the last trigger; only notifications newer than the current
    /// sequence number can trigger again.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.last_value = None;
        state.trigger_seq = self.inner.seq.get();
        state.triggered = false;
    }

    /// Offer one change; returns whether the warning triggered.
    pub fn submit(&self, seq: u32, property: &str, value: &str) -> bool {
        if property != self.inner.property {
            return false;
        }
        let mut state = self.inner.state.lock();
        let newer = state.trigger_seq.map_or(true, |trigger_seq| trigger_seq < seq);
        let accepted = self
            .inner
            .values
            .as_ref()
            .map_or(true, |values| values.iter().any(|v| v == value));
        if !(newer && accepted) {
            return false;
        }
        state.last_value = Some(value.to_string());
        state.trigger_seq = Some(seq);
        state.triggered = true;
        drop(state);
        self.inner.signal.set();
        true
    }

    /// The triggering value, once: a second call returns `None` until the
    /// warning triggers again.
    pub fn fresh(&self) -> Option<String> {
        let mut state = self.inner.state.lock();
        if state.triggered {
            state.triggered = false;
            state.last_value.clone()
        } else {
            None
        }
    }

    /// Value of the last trigger, fresh or not
    pub fn last(&self) -> Option<String> {
        self.inner.state.lock().last_value.clone()
    }

    pub fn trigger_seq(&self) -> Option<u32> {
        self.inner.state.lock().trigger_seq
    }
}

impl std::fmt::Debug for EventWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWarning")
            .field("property", &self.inner.property)
            .field("values", &self.inner.values)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

struct NotificationInner {
    ip: IpAddr,
    port: u16,
    router: Arc<EventRouter>,
    server: Mutex<Option<CallbackServer>>,
}

/// Embedded server receiving the notifications of one or more subscriptions.
///
/// A private listener serves exactly one subscription: it accepts a single
/// registration in its lifetime and is started and stopped with that
/// subscription. Port 0 binds an ephemeral port, reported by
/// [`port`](Self::port) once started.
#[derive(Clone)]
pub struct NotificationListener {
    inner: Arc<NotificationInner>,
}

impl NotificationListener {
    /// A listener shared by any number of subscriptions
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self::with_router(ip, port, EventRouter::new())
    }

    /// A listener dedicated to one subscription
    pub fn private(ip: IpAddr, port: u16) -> Self {
        Self::with_router(ip, port, EventRouter::private())
    }

    fn with_router(ip: IpAddr, port: u16, router: EventRouter) -> Self {
        Self {
            inner: Arc::new(NotificationInner {
                ip,
                port,
                router: Arc::new(router),
                server: Mutex::new(None),
            }),
        }
    }

    pub fn is_private(&self) -> bool {
        self.inner.router.is_private()
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.ip
    }

    /// Bound port while running, else the configured one
    pub fn port(&self) -> u16 {
        self.inner
            .server
            .lock()
            .as_ref()
            .map_or(self.inner.port, CallbackServer::port)
    }

    pub fn is_running(&self) -> bool {
        self.inner.server.lock().is_some()
    }

    /// Bind the server; returns once it accepts connections.
    pub fn start(&self) -> Result<()> {
        let mut server = self.inner.server.lock();
        if server.is_some() {
            tracing::info!(ip = %self.inner.ip, port = self.inner.port, "notification listener already activated");
            return Err(DlnaError::AlreadyActive("notification listener".to_string()));
        }
        let config = ServerConfig {
            bind_ip: self.inner.ip,
            port: self.inner.port,
            ..ServerConfig::default()
        };
        let started = CallbackServer::start(config, self.inner.router.clone())?;
        tracing::info!(ip = %self.inner.ip, port = started.port(), "notification listener started");
        *server = Some(started);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(mut server) = self.inner.server.lock().take() {
            server.shutdown();
            tracing::info!(ip = %self.inner.ip, port = server.port(), "notification listener stopped");
        }
    }

    /// Register a subscription; `None` when a private listener is already used.
    pub(crate) fn register(&self, sink: Arc<dyn NotificationSink>) -> Option<u32> {
        self.inner.router.register(sink)
    }

    pub(crate) fn unregister(&self, callback_number: u32) -> bool {
        self.inner.router.unregister(callback_number)
    }

    pub fn subscriptions(&self) -> usize {
        self.inner.router.len()
    }
}

impl std::fmt::Debug for NotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationListener")
            .field("ip", &self.inner.ip)
            .field("port", &self.port())
            .field("private", &self.is_private())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Where a new subscription receives its notifications
#[derive(Debug, Clone)]
pub enum NotificationTarget {
    /// A private listener created on this port
    Port(u16),
    /// An existing listener
    Listener(NotificationListener),
}

impl From<u16> for NotificationTarget {
    fn from(port: u16) -> Self {
        NotificationTarget::Port(port)
    }
}

impl From<NotificationListener> for NotificationTarget {
    fn from(listener: NotificationListener) -> Self {
        NotificationTarget::Listener(listener)
    }
}

impl From<&NotificationListener> for NotificationTarget {
    fn from(listener: &NotificationListener) -> Self {
        NotificationTarget::Listener(listener.clone())
    }
}

pub(crate) struct ListenerShared {
    pub(crate) device: Device,
    pub(crate) service: Arc<Service>,
    pub(crate) hip: IpAddr,
    pub(crate) notifications: NotificationListener,
    callback_number: AtomicU32,
    log: bool,
    sid: Mutex<Option<String>>,
    seq: SeqCounter,
    events_log: Mutex<BTreeMap<u32, DlnaEvent>>,
    warnings: Mutex<Vec<EventWarning>>,
    running: AtomicBool,
}

/// One GENA subscription to a device service.
#[derive(Clone)]
pub struct EventListener {
    shared: Arc<ListenerShared>,
}

impl EventListener {
    /// Create the subscription record and register it on `notifications`.
    pub(crate) fn register(
        device: Device,
        service: Arc<Service>,
        hip: IpAddr,
        notifications: NotificationListener,
        log: bool,
    ) -> Result<Self> {
        let shared = Arc::new(ListenerShared {
            device,
            service,
            hip,
            notifications,
            callback_number: AtomicU32::new(0),
            log,
            sid: Mutex::new(None),
            seq: SeqCounter::default(),
            events_log: Mutex::new(BTreeMap::new()),
            warnings: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        });
        let number = shared
            .notifications
            .register(shared.clone())
            .ok_or(DlnaError::ListenerFull)?;
        shared.callback_number.store(number, Ordering::SeqCst);
        Ok(Self { shared })
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.shared.service
    }

    /// Local address the device reaches us on
    pub fn hip(&self) -> IpAddr {
        self.shared.hip
    }

    pub fn callback_number(&self) -> u32 {
        self.shared.callback_number.load(Ordering::SeqCst)
    }

    pub fn notification_listener(&self) -> &NotificationListener {
        &self.shared.notifications
    }

    /// URL the device sends notifications to
    pub fn callback_url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.shared.hip,
            self.shared.notifications.port(),
            self.callback_number()
        )
    }

    pub fn sid(&self) -> Option<String> {
        self.shared.sid.lock().clone()
    }

    pub(crate) fn set_sid(&self, sid: Option<String>) {
        *self.shared.sid.lock() = sid;
    }

    pub fn current_seq(&self) -> Option<u32> {
        self.shared.seq.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Mark the subscription running; false when it already was.
    pub(crate) fn activate(&self) -> bool {
        !self.shared.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn unregister(&self) -> bool {
        self.shared.notifications.unregister(self.callback_number())
    }

    /// Events received so far, keyed by sequence number; empty unless the
    /// subscription was created with logging.
    pub fn events_log(&self) -> BTreeMap<u32, DlnaEvent> {
        self.shared.events_log.lock().clone()
    }

    pub(crate) fn add_warning(&self, property: &str, values: &[&str], signal: Option<Signal>) -> EventWarning {
        let warning = EventWarning::new(self.shared.seq.clone(), property, values, signal);
        self.shared.warnings.lock().push(warning.clone());
        warning
    }

    pub fn warnings(&self) -> Vec<EventWarning> {
        self.shared.warnings.lock().clone()
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("device", &self.shared.device.friendly_name)
            .field("service", &self.shared.service.id)
            .field("callback_number", &self.callback_number())
            .field("sid", &self.sid())
            .field("current_seq", &self.current_seq())
            .finish()
    }
}

impl NotificationSink for ListenerShared {
    fn sid(&self) -> Option<String> {
        self.sid.lock().clone()
    }

    fn observe_seq(&self, seq: u32) {
        self.seq.raise(seq);
    }

    fn deliver(&self, notification: EventNotification) {
        let receipt_time = Utc::now();
        let seq = notification.seq;
        let device = self.device.friendly_name.as_str();
        let service = self.service.short_id();
        for (name, value) in &notification.properties {
            tracing::debug!(device, service, seq, property = %name, value = %value, "notification");
        }

        let changes = collect_changes(notification.properties, self.device.kind.expands_last_change());
        if self.log {
            self.events_log.lock().insert(
                seq,
                DlnaEvent {
                    receipt_time,
                    changes: changes.clone(),
                },
            );
        }

        let warnings = self.warnings.lock().clone();
        for (name, value) in &changes {
            for warning in &warnings {
                if warning.submit(seq, name, value) {
                    tracing::debug!(device, service, seq, property = %name, value = %value, "alert");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_last_change() {
        let value = r#"<Event xmlns="urn:schemas-upnp-org:metadata-1-0/AVT/"><InstanceID val="0"><TransportState val="PLAYING"/><CurrentTrackDuration VAL="0:03:15"/><NoValue/></InstanceID></Event>"#;
        assert_eq!(
            parse_last_change(value),
            Some(vec![
                ("TransportState".to_string(), "PLAYING".to_string()),
                ("CurrentTrackDuration".to_string(), "0:03:15".to_string()),
            ])
        );
        assert_eq!(parse_last_change("<Event/>"), Some(Vec::new()));
        assert_eq!(parse_last_change("not xml"), None);
    }

    #[test]
    fn test_collect_changes() {
        let properties = vec![
            (
                "LastChange".to_string(),
                r#"<Event><InstanceID val="0"><Volume channel="Master" val="30"/></InstanceID></Event>"#.to_string(),
            ),
            ("lastchange".to_string(), "opaque".to_string()),
            ("Mute".to_string(), "0".to_string()),
        ];
        assert_eq!(
            collect_changes(properties.clone(), true),
            vec![
                ("Volume".to_string(), "30".to_string()),
                ("lastchange".to_string(), "opaque".to_string()),
                ("Mute".to_string(), "0".to_string()),
            ]
        );
        assert_eq!(collect_changes(properties.clone(), false), properties);
    }

    #[test]
    fn test_warning_triggers_once_per_seq() {
        let seq = SeqCounter::default();
        let warning = EventWarning::new(seq.clone(), "TransportState", &[], None);
        assert!(warning.submit(1, "TransportState", "PLAYING"));
        assert!(!warning.submit(1, "TransportState", "STOPPED"));
        assert!(!warning.submit(0, "TransportState", "STOPPED"));
        assert!(!warning.submit(2, "Volume", "10"));
        assert!(warning.signal().is_set());
        assert_eq!(warning.fresh().as_deref(), Some("PLAYING"));
        assert_eq!(warning.fresh(), None);
        assert_eq!(warning.last().as_deref(), Some("PLAYING"));
        assert_eq!(warning.trigger_seq(), Some(1));
    }

    #[test]
    fn test_warning_value_filter() {
        let warning = EventWarning::new(SeqCounter::default(), "TransportState", &["STOPPED"], None);
        assert!(!warning.submit(1, "TransportState", "PLAYING"));
        assert!(warning.submit(2, "TransportState", "STOPPED"));
        assert_eq!(warning.values(), Some(&["STOPPED".to_string()][..]));
    }

    #[test]
    fn test_warning_clear_uses_current_seq() {
        let seq = SeqCounter::default();
        let warning = EventWarning::new(seq.clone(), "Mute", &[], None);
        seq.raise(5);
        warning.clear();
        assert_eq!(warning.trigger_seq(), Some(5));
        assert!(!warning.submit(5, "Mute", "1"));
        assert!(warning.submit(6, "Mute", "1"));
    }

    #[test]
    fn test_notification_listener_ports() {
        let listener = NotificationListener::private(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        assert!(listener.is_private());
        assert_eq!(listener.port(), 0);
        listener.start().unwrap();
        assert!(listener.is_running());
        assert_ne!(listener.port(), 0);
        assert!(matches!(listener.start(), Err(DlnaError::AlreadyActive(_))));
        listener.stop();
        assert!(!listener.is_running());
        assert_eq!(listener.port(), 0);
    }

    #[test]
    fn test_events_log_keeps_only_received_seqs() {
        let device = crate::handler::tests::device("uuid:r1", "Renderer", true, Utc::now());
        let service = device.service("Test").cloned().unwrap();
        let notifications = NotificationListener::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener =
            EventListener::register(device, service, IpAddr::V4(Ipv4Addr::LOCALHOST), notifications, true).unwrap();

        for seq in [3, u32::MAX] {
            listener.shared.observe_seq(seq);
            listener.shared.deliver(EventNotification {
                callback_number: listener.callback_number(),
                sid: "uuid:sub-1".to_string(),
                seq,
                properties: vec![("Mute".to_string(), "1".to_string())],
            });
        }

        let log = listener.events_log();
        assert_eq!(log.keys().copied().collect::<Vec<_>>(), vec![3, u32::MAX]);
        assert_eq!(log[&u32::MAX].changes, vec![("Mute".to_string(), "1".to_string())]);
        assert_eq!(listener.current_seq(), Some(u32::MAX));
    }

    proptest! {
        #[test]
        fn prop_seq_counter_is_the_maximum(seqs in proptest::collection::vec(0u32..1000, 1..50)) {
            let counter = SeqCounter::default();
            for seq in &seqs {
                counter.raise(*seq);
            }
            prop_assert_eq!(counter.get(), seqs.iter().copied().max());
        }
    }
}
