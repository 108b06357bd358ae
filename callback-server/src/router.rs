//! Event routing for HTTP callback notifications.
//!
//! The `EventRouter` hands out callback numbers. A subscription embeds its
//! number in the callback URL path, so a notification reaches its sink
//! without any lookup by subscription id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// A notification accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    /// Number from the request path
    pub callback_number: u32,
    /// The subscription ID from the `SID` header
    pub sid: String,
    /// Event key from the `SEQ` header
    pub seq: u32,
    /// Properties in document order
    pub properties: Vec<(String, String)>,
}

/// Receiver of the notifications addressed to one callback number.
pub trait NotificationSink: Send + Sync {
    /// Subscription id currently accepted; `None` rejects every notification.
    fn sid(&self) -> Option<String>;

    /// Called with the sequence number of a notification whose callback
    /// number and SID matched, before its body is parsed.
    fn observe_seq(&self, seq: u32);

    /// Called once the notification has been acknowledged.
    fn deliver(&self, notification: EventNotification);
}

struct RouterState {
    issued: u32,
    sinks: BTreeMap<u32, Arc<dyn NotificationSink>>,
}

/// Maps callback numbers to notification sinks.
///
/// A private router accepts a single registration during its whole lifetime;
/// it backs a listener dedicated to one subscription.
pub struct EventRouter {
    private: bool,
    state: Mutex<RouterState>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// A router shared by any number of subscriptions.
    pub fn new() -> Self {
        Self::with_privacy(false)
    }

    /// A router accepting exactly one registration.
    pub fn private() -> Self {
        Self::with_privacy(true)
    }

    fn with_privacy(private: bool) -> Self {
        Self {
            private,
            state: Mutex::new(RouterState {
                issued: 0,
                sinks: BTreeMap::new(),
            }),
        }
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Register a sink and return its callback number, starting at 1.
    ///
    /// Returns `None` when a private router already issued its number.
    pub fn register(&self, sink: Arc<dyn NotificationSink>) -> Option<u32> {
        let mut state = self.state.lock();
        if self.private && state.issued > 0 {
            return None;
        }
        state.issued += 1;
        let number = state.issued;
        state.sinks.insert(number, sink);
        Some(number)
    }

    /// Remove a registration. Returns false when the number was not registered.
    pub fn unregister(&self, callback_number: u32) -> bool {
        self.state.lock().sinks.remove(&callback_number).is_some()
    }

    pub fn sink(&self, callback_number: u32) -> Option<Arc<dyn NotificationSink>> {
        self.state.lock().sinks.get(&callback_number).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
