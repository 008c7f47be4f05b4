//! Packet listener registry
//!
//! Fans every produced packet (encoded or dropped) out to the registered
//! listeners. The listener set is the one structure touched concurrently by
//! independent threads, so it sits behind a single mutex.
//!
//! Notification runs with that mutex held: once `unregister` returns, the
//! listener is guaranteed not to be called again. The flip side is that a
//! listener must not call `register`/`unregister` from inside `on_packet`;
//! doing so panics. Use [`ListenerRegistry::defer_unregister`] instead.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{EncodeError, EncodeResult, EncodedPacket};

/// Consumer of encoder output
pub trait PacketListener: Send + Sync {
    /// Called once per packet, in submission order
    fn on_packet(&self, packet: &EncodedPacket);
}

impl<F> PacketListener for F
where
    F: Fn(&EncodedPacket) + Send + Sync,
{
    fn on_packet(&self, packet: &EncodedPacket) {
        self(packet)
    }
}

thread_local! {
    static NOTIFYING: Cell<bool> = const { Cell::new(false) };
}

struct NotifyGuard;

impl NotifyGuard {
    fn enter() -> Self {
        NOTIFYING.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFYING.with(|flag| flag.set(false));
    }
}

fn assert_not_notifying(operation: &str) {
    if NOTIFYING.with(Cell::get) {
        panic!(
            "listener {} called from inside a packet notification; use defer_unregister",
            operation
        );
    }
}

/// Thread-safe set of packet listeners
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn PacketListener>>>,
    pending_removal: Mutex<Vec<Arc<dyn PacketListener>>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    ///
    /// Registering the same `Arc` twice is rejected.
    pub fn register(&self, listener: Arc<dyn PacketListener>) -> EncodeResult<()> {
        assert_not_notifying("registration");
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            warn!("Rejected duplicate listener registration");
            return Err(EncodeError::ListenerAlreadyRegistered);
        }
        listeners.push(listener);
        debug!("Listener registered ({} total)", listeners.len());
        Ok(())
    }

    /// Remove a listener
    ///
    /// Removing a listener that is not registered is rejected.
    pub fn unregister(&self, listener: &Arc<dyn PacketListener>) -> EncodeResult<()> {
        assert_not_notifying("unregistration");
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if listeners.len() == before {
            warn!("Rejected unregistration of unknown listener");
            return Err(EncodeError::ListenerNotRegistered);
        }
        debug!("Listener unregistered ({} remaining)", listeners.len());
        Ok(())
    }

    /// Remove a listener once the current notification round ends
    ///
    /// Safe to call from inside `on_packet`. Outside a notification the
    /// removal is applied at the start of the next one.
    pub fn defer_unregister(&self, listener: Arc<dyn PacketListener>) {
        self.pending_removal.lock().push(listener);
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// No listeners registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a packet to every listener
    pub fn notify_all(&self, packet: &EncodedPacket) {
        let mut listeners = self.listeners.lock();
        self.apply_deferred(&mut listeners);
        {
            let _guard = NotifyGuard::enter();
            for listener in listeners.iter() {
                listener.on_packet(packet);
            }
        }
        self.apply_deferred(&mut listeners);
    }

    fn apply_deferred(&self, listeners: &mut Vec<Arc<dyn PacketListener>>) {
        let pending = std::mem::take(&mut *self.pending_removal.lock());
        for removed in pending {
            let before = listeners.len();
            listeners.retain(|l| !Arc::ptr_eq(l, &removed));
            if listeners.len() == before {
                debug!("Deferred unregistration of unknown listener ignored");
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::packet::PacketTiming;
    use crate::encoder::Resolution;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn packet() -> EncodedPacket {
        EncodedPacket::dropped(
            PacketTiming {
                timestamp: Duration::ZERO,
                duration: Duration::from_millis(16),
                resolution: Resolution::new(2, 2),
                framerate: 60,
                encode_start: Instant::now(),
            },
            None,
        )
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn PacketListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Arc<dyn PacketListener> = Arc::new(move |_: &EncodedPacket| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn test_notify_all_listeners() {
        let registry = ListenerRegistry::new();
        let (a, la) = counter();
        let (b, lb) = counter();
        registry.register(la).unwrap();
        registry.register(lb).unwrap();

        registry.notify_all(&packet());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ListenerRegistry::new();
        let (_, listener) = counter();
        registry.register(Arc::clone(&listener)).unwrap();
        assert_eq!(
            registry.register(listener),
            Err(EncodeError::ListenerAlreadyRegistered)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_unregistration_rejected() {
        let registry = ListenerRegistry::new();
        let (_, listener) = counter();
        assert_eq!(
            registry.unregister(&listener),
            Err(EncodeError::ListenerNotRegistered)
        );
    }

    #[test]
    fn test_unregistered_listener_not_called() {
        let registry = ListenerRegistry::new();
        let (count, listener) = counter();
        registry.register(Arc::clone(&listener)).unwrap();
        registry.unregister(&listener).unwrap();
        registry.notify_all(&packet());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deferred_unregister_from_callback() {
        let registry = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        struct OneShot {
            registry: Arc<ListenerRegistry>,
            me: Mutex<Option<Arc<dyn PacketListener>>>,
            calls: Arc<AtomicUsize>,
        }
        impl PacketListener for OneShot {
            fn on_packet(&self, _packet: &EncodedPacket) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = self.me.lock().take() {
                    self.registry.defer_unregister(me);
                }
            }
        }

        let one_shot = Arc::new(OneShot {
            registry: Arc::clone(&registry),
            me: Mutex::new(None),
            calls: Arc::clone(&calls),
        });
        let as_listener: Arc<dyn PacketListener> = one_shot.clone();
        *one_shot.me.lock() = Some(Arc::clone(&as_listener));
        registry.register(as_listener).unwrap();

        registry.notify_all(&packet());
        registry.notify_all(&packet());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_from_callback_panics() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = Arc::clone(&registry);
        let listener: Arc<dyn PacketListener> = Arc::new(move |_: &EncodedPacket| {
            let (_, other) = counter();
            let _ = inner.register(other);
        });
        registry.register(listener).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.notify_all(&packet());
        }));
        assert!(result.is_err());
    }
}
