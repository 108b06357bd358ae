//! A resettable, shareable wake-up flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Inner {
    flag: Mutex<bool>,
    cond: Condvar,
}

/// A flag threads can wait on, set from any other thread.
///
/// Clones share the same flag. Handlers hand one out for discovery and
/// advertisement status changes; event warnings set one when they trigger.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        let mut flag = self.inner.flag.lock();
        *flag = true;
        self.inner.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.inner.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.flag.lock()
    }

    /// Block until the flag is raised or the timeout elapses; `None` waits
    /// forever. Returns the flag state; the flag is left raised.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut flag = self.inner.flag.lock();
        while !*flag {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut flag, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.cond.wait(&mut flag),
            }
        }
        *flag
    }

    /// Whether both handles share the same flag.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("set", &self.is_set()).finish()
    }
}
