//! Typed, synchronous publish/subscribe bus.
//!
//! A bus is parameterized by an [`EventMap`] marker. Payload types join a
//! catalogue by implementing [`BusEvent`] for that marker, which fixes their
//! event name and lets the compiler reject events from other catalogues.
//!
//! Dispatch is synchronous and in registration order. The registry lock is
//! released before callbacks run, so callbacks may subscribe, unsubscribe,
//! or emit re-entrantly. Nested emits run to completion before the outer
//! dispatch resumes; depth is capped at [`MAX_EMIT_DEPTH`] per thread to
//! break accidental A -> B -> A cycles.
//!
//! A panicking callback is isolated: it is logged and counted in
//! [`Dispatch::failed`], and the remaining callbacks still run.

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::BusError;

/// Maximum nesting of `emit` calls on one thread.
pub const MAX_EMIT_DEPTH: usize = 32;

/// Marker for a catalogue of events a bus accepts.
pub trait EventMap: Send + Sync + 'static {}

/// A payload type belonging to catalogue `M`.
pub trait BusEvent<M: EventMap>: Any + Send + Sync {
    /// Wire name of the event (e.g. `"vote-submitted"`).
    const NAME: &'static str;
}

/// Type-erased callback. Downcasts the payload back to its concrete type.
type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Handler {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Handlers keyed by the `TypeId` of the payload they accept.
#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<TypeId, Vec<Handler>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // Callbacks never run under the lock, so poisoning can only come from a
    // panic inside the bus itself; the map is still structurally sound.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of a single [`EventBus::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatch {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
}

thread_local! {
    static EMIT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter(event: &'static str) -> Result<Self, BusError> {
        let depth = EMIT_DEPTH.with(Cell::get);
        if depth >= MAX_EMIT_DEPTH {
            tracing::error!(event, depth, "emit depth exceeded, dropping event");
            return Err(BusError::EmitDepthExceeded { event, depth });
        }
        EMIT_DEPTH.with(|d| d.set(depth + 1));
        Ok(Self)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EMIT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// In-process publish/subscribe bus for the events of catalogue `M`.
///
/// `Clone` is cheap: clones share one registry.
pub struct EventBus<M: EventMap> {
    registry: Arc<Mutex<Registry>>,
    _catalogue: PhantomData<fn() -> M>,
}

// Manual `Clone` so `M` itself need not be `Clone`.
impl<M: EventMap> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            _catalogue: PhantomData,
        }
    }
}

impl<M: EventMap> Default for EventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: EventMap> fmt::Debug for EventBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.total_subscribers())
            .finish()
    }
}

impl<M: EventMap> EventBus<M> {
    /// Create a fresh bus with no subscribers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            _catalogue: PhantomData,
        }
    }

    /// Register `callback` for events of type `E`.
    ///
    /// The registration lives as long as the returned [`Subscription`].
    /// Dropping it, or calling [`Subscription::unsubscribe`], removes exactly
    /// this registration.
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: BusEvent<M>,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(move |payload: &dyn Any| {
            if let Some(event) = payload.downcast_ref::<E>() {
                callback(event);
            }
        });
        let active = Arc::new(AtomicBool::new(true));
        let key = TypeId::of::<E>();

        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.entry(key).or_default().push(Handler {
                id,
                active: Arc::clone(&active),
                callback,
            });
            id
        };

        tracing::debug!(event = E::NAME, subscription = id, "subscribed");

        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
            id,
            event: E::NAME,
            active,
        }
    }

    /// Deliver `payload` to every callback registered for `E`.
    ///
    /// Callbacks registered at the moment `emit` is called are invoked in
    /// registration order, each receiving the same reference. A callback
    /// unsubscribed by an earlier callback of the same dispatch is skipped.
    /// Events with no subscribers are dropped; nothing is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::EmitDepthExceeded`] if this emit is nested more
    /// than [`MAX_EMIT_DEPTH`] levels deep on the current thread. No
    /// callback runs in that case.
    pub fn emit<E: BusEvent<M>>(&self, payload: &E) -> Result<Dispatch, BusError> {
        let _depth = DepthGuard::enter(E::NAME)?;

        let snapshot: Vec<(u64, Arc<AtomicBool>, Callback)> = {
            let registry = lock(&self.registry);
            registry
                .handlers
                .get(&TypeId::of::<E>())
                .map(|handlers| {
                    handlers
                        .iter()
                        .map(|h| (h.id, Arc::clone(&h.active), Arc::clone(&h.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut dispatch = Dispatch::default();
        for (id, active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            let payload: &dyn Any = payload;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => dispatch.delivered += 1,
                Err(_) => {
                    dispatch.failed += 1;
                    tracing::error!(
                        event = E::NAME,
                        subscription = id,
                        "subscriber panicked during dispatch"
                    );
                }
            }
        }
        Ok(dispatch)
    }

    /// Number of live registrations for `E`.
    pub fn subscriber_count<E: BusEvent<M>>(&self) -> usize {
        lock(&self.registry)
            .handlers
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Number of live registrations across all events.
    pub fn total_subscribers(&self) -> usize {
        lock(&self.registry).handlers.values().map(Vec::len).sum()
    }
}

/// A live registration on an [`EventBus`].
///
/// Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: TypeId,
    id: u64,
    event: &'static str,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Name of the subscribed event.
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Remove this registration now.
    pub fn unsubscribe(self) {
        // Removal happens in `Drop`.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(handlers) = registry.handlers.get_mut(&self.key) {
            handlers.retain(|h| h.id != self.id);
            if handlers.is_empty() {
                registry.handlers.remove(&self.key);
            }
        }
        tracing::debug!(event = self.event, subscription = self.id, "unsubscribed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestEvents;
    impl EventMap for TestEvents {}

    #[derive(Debug)]
    struct Ping(u32);
    impl BusEvent<TestEvents> for Ping {
        const NAME: &'static str = "ping";
    }

    #[derive(Debug)]
    struct Pong(u32);
    impl BusEvent<TestEvents> for Pong {
        const NAME: &'static str = "pong";
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = Arc::clone(&log);
            move |entry: &str| log.lock().unwrap().push(entry.to_string())
        };
        (log, sink)
    }

    #[test]
    fn all_subscribers_run_in_registration_order() {
        let bus = EventBus::<TestEvents>::new();
        let (log, sink) = recorder();
        let s1 = sink.clone();
        let s2 = sink.clone();
        let _a = bus.subscribe(move |p: &Ping| s1(&format!("a{}", p.0)));
        let _b = bus.subscribe(move |p: &Ping| s2(&format!("b{}", p.0)));

        let dispatch = bus.emit(&Ping(7)).unwrap();
        assert_eq!(dispatch.delivered, 2);
        assert_eq!(*log.lock().unwrap(), ["a7", "b7"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_registration() {
        let bus = EventBus::<TestEvents>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        let first = bus.subscribe(move |_: &Ping| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let _second = bus.subscribe(move |_: &Ping| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        assert_eq!(bus.subscriber_count::<Ping>(), 1);
        bus.emit(&Ping(0)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = EventBus::<TestEvents>::new();
        {
            let _sub = bus.subscribe(|_: &Ping| {});
            assert_eq!(bus.total_subscribers(), 1);
        }
        assert_eq!(bus.total_subscribers(), 0);
    }

    #[test]
    fn emit_without_subscribers_is_dropped_and_not_replayed() {
        let bus = EventBus::<TestEvents>::new();
        assert_eq!(bus.emit(&Ping(1)).unwrap(), Dispatch::default());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _late = bus.subscribe(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_are_routed_by_type() {
        let bus = EventBus::<TestEvents>::new();
        let (log, sink) = recorder();
        let _ping = bus.subscribe(move |p: &Ping| sink(&format!("ping{}", p.0)));
        bus.emit(&Pong(3)).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn payload_is_passed_by_reference() {
        let bus = EventBus::<TestEvents>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _sub = bus.subscribe(move |p: &Ping| {
            s.store(p as *const Ping as usize, Ordering::SeqCst);
        });
        let payload = Ping(5);
        bus.emit(&payload).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), &payload as *const Ping as usize);
    }

    #[test]
    fn panicking_subscriber_does_not_block_siblings() {
        let bus = EventBus::<TestEvents>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _bad = bus.subscribe(|_: &Ping| panic!("consumer bug"));
        let _good = bus.subscribe(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let dispatch = bus.emit(&Ping(0)).unwrap();
        assert_eq!(dispatch, Dispatch { delivered: 1, failed: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_emit_completes_before_outer_dispatch_resumes() {
        let bus = EventBus::<TestEvents>::new();
        let (log, sink) = recorder();

        let inner_bus = bus.clone();
        let s1 = sink.clone();
        let _first = bus.subscribe(move |p: &Ping| {
            s1("ping-1");
            inner_bus.emit(&Pong(p.0)).unwrap();
        });
        let s2 = sink.clone();
        let _second = bus.subscribe(move |_: &Ping| s2("ping-2"));
        let s3 = sink.clone();
        let _pong = bus.subscribe(move |_: &Pong| s3("pong"));

        bus.emit(&Ping(1)).unwrap();
        assert_eq!(*log.lock().unwrap(), ["ping-1", "pong", "ping-2"]);
    }

    #[test]
    fn emit_cycle_is_cut_at_max_depth() {
        let bus = EventBus::<TestEvents>::new();
        let depth_errors = Arc::new(AtomicUsize::new(0));

        let ping_bus = bus.clone();
        let errs = Arc::clone(&depth_errors);
        let _ping = bus.subscribe(move |p: &Ping| {
            if ping_bus.emit(&Pong(p.0 + 1)).is_err() {
                errs.fetch_add(1, Ordering::SeqCst);
            }
        });
        let pong_bus = bus.clone();
        let errs = Arc::clone(&depth_errors);
        let _pong = bus.subscribe(move |p: &Pong| {
            if pong_bus.emit(&Ping(p.0 + 1)).is_err() {
                errs.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(&Ping(0)).unwrap();
        assert_eq!(depth_errors.load(Ordering::SeqCst), 1);
        // Depth counter unwinds back to zero afterwards.
        assert!(bus.emit(&Pong(0)).is_ok());
    }

    #[test]
    fn subscriber_removed_mid_dispatch_is_skipped() {
        let bus = EventBus::<TestEvents>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim);
        let _killer = bus.subscribe(move |_: &Ping| {
            slot.lock().unwrap().take();
        });
        let h = Arc::clone(&hits);
        *victim.lock().unwrap() = Some(bus.subscribe(move |_: &Ping| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let dispatch = bus.emit(&Ping(0)).unwrap();
        assert_eq!(dispatch.delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_inside_callback_does_not_deadlock() {
        let bus = EventBus::<TestEvents>::new();
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let inner_bus = bus.clone();
        let store = Arc::clone(&held);
        let _sub = bus.subscribe(move |_: &Ping| {
            let sub = inner_bus.subscribe(|_: &Pong| {});
            store.lock().unwrap().push(sub);
        });
        bus.emit(&Ping(0)).unwrap();
        assert_eq!(bus.subscriber_count::<Pong>(), 1);
    }

    #[test]
    fn subscription_outliving_bus_drops_cleanly() {
        let bus = EventBus::<TestEvents>::new();
        let sub = bus.subscribe(|_: &Ping| {});
        drop(bus);
        assert_eq!(sub.event(), "ping");
        drop(sub);
    }
}
