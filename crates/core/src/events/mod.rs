//! Typed publish/subscribe registry.
//!
//! An [`EventBus`] maps the kind of an event to an ordered list of listeners.
//! Dispatch is synchronous and happens on the emitting thread. Each listener
//! runs in isolation: an `Err` return or a panic is logged and the remaining
//! listeners still see the event.

use std::{
    any::Any,
    error::Error,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::BeatEmitterError;

/// Events that can travel over an [`EventBus`].
pub trait BusEvent: Send + Sync {
    /// Tag used to route the event to its listeners.
    type Kind: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// Return type of listeners. Errors are reported, never propagated.
pub type ListenerResult = std::result::Result<(), Box<dyn Error + Send + Sync>>;

type Listener<E> = Arc<dyn Fn(&E) -> ListenerResult + Send + Sync>;

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registration count per kind above which a leak warning is logged.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

struct Registration<E> {
    id: ListenerId,
    once: bool,
    listener: Listener<E>,
}

struct Registry<E: BusEvent> {
    kinds: Vec<(E::Kind, Vec<Registration<E>>)>,
    next_id: u64,
    max_listeners: usize,
}

impl<E: BusEvent> Registry<E> {
    fn list_mut(&mut self, kind: E::Kind) -> Option<&mut Vec<Registration<E>>> {
        self.kinds
            .iter_mut()
            .find(|(k, _)| *k == kind)
            .map(|(_, list)| list)
    }

    fn list_or_insert(&mut self, kind: E::Kind) -> &mut Vec<Registration<E>> {
        let position = match self.kinds.iter().position(|(k, _)| *k == kind) {
            Some(position) => position,
            None => {
                self.kinds.push((kind, Vec::new()));
                self.kinds.len() - 1
            }
        };
        &mut self.kinds[position].1
    }

    fn prune(&mut self) {
        self.kinds.retain(|(_, list)| !list.is_empty());
    }
}

pub struct EventBus<E: BusEvent> {
    registry: Mutex<Registry<E>>,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                kinds: Vec::new(),
                next_id: 0,
                max_listeners: DEFAULT_MAX_LISTENERS,
            }),
        }
    }

    /// Appends a listener for `kind`.
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), false, false)
    }

    /// Appends a listener that is removed before its first invocation.
    pub fn once<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), true, false)
    }

    /// Inserts a listener ahead of the ones already registered for `kind`.
    pub fn prepend<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), false, true)
    }

    pub fn prepend_once<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(listener), true, true)
    }

    /// Removes one listener. Returns `false` if it was not registered.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let removed = registry
            .list_mut(kind)
            .and_then(|list| {
                let position = list.iter().position(|r| r.id == id)?;
                list.remove(position);
                Some(())
            })
            .is_some();
        registry.prune();
        removed
    }

    /// Dispatches `event` to a snapshot of its listeners, in order, and
    /// returns how many were invoked. Listeners registered or removed during
    /// dispatch take effect from the next emission.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener<E>> = {
            let mut registry = self.lock();
            let Some(list) = registry.list_mut(kind) else {
                return 0;
            };
            let snapshot = list.iter().map(|r| Arc::clone(&r.listener)).collect();
            list.retain(|r| !r.once);
            registry.prune();
            snapshot
        };

        for listener in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => report_failure(kind, err.to_string()),
                Err(payload) => report_failure(kind, panic_message(payload.as_ref())),
            }
        }

        snapshot.len()
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.lock()
            .kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, list)| list.len())
    }

    /// Kinds that currently have at least one listener.
    pub fn event_names(&self) -> Vec<E::Kind> {
        self.lock().kinds.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn remove_all_listeners(&self, kind: E::Kind) {
        self.lock().kinds.retain(|(k, _)| *k != kind);
    }

    pub fn clear(&self) {
        self.lock().kinds.clear();
    }

    /// Sets the per-kind count above which registrations log a warning.
    /// `0` disables the check.
    pub fn set_max_listeners(&self, max: usize) {
        self.lock().max_listeners = max;
    }

    pub fn max_listeners(&self) -> usize {
        self.lock().max_listeners
    }

    fn register(&self, kind: E::Kind, listener: Listener<E>, once: bool, prepend: bool) -> ListenerId {
        let mut registry = self.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        let max = registry.max_listeners;

        let list = registry.list_or_insert(kind);
        let registration = Registration { id, once, listener };
        if prepend {
            list.insert(0, registration);
        } else {
            list.push(registration);
        }

        if max > 0 && list.len() > max {
            tracing::warn!(
                event = %kind,
                count = list.len(),
                max,
                "listener count exceeds limit, possible leak"
            );
        }
        id
    }

    // Listeners never run while the registry is locked, so a poisoned lock
    // still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let counts: Vec<_> = registry
            .kinds
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .field("max_listeners", &registry.max_listeners)
            .finish()
    }
}

fn report_failure(kind: impl fmt::Display, reason: String) {
    let failure = BeatEmitterError::ListenerFailure {
        event: kind.to_string(),
        reason,
    };
    tracing::error!(error = %failure, "event listener failed");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    impl fmt::Display for Kind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    #[derive(Debug)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl BusEvent for TestEvent {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            match self {
                TestEvent::Ping(_) => Kind::Ping,
                TestEvent::Pong => Kind::Pong,
            }
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&TestEvent) -> ListenerResult {
        let log = Arc::clone(log);
        move |event| {
            log.lock().unwrap().push(format!("{tag}:{event:?}"));
            Ok(())
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(Kind::Ping, recorder(&log, "a"));
        bus.on(Kind::Ping, recorder(&log, "b"));
        bus.prepend(Kind::Ping, recorder(&log, "first"));
        bus.on(Kind::Pong, recorder(&log, "pong"));

        assert_eq!(bus.emit(&TestEvent::Ping(7)), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:Ping(7)", "a:Ping(7)", "b:Ping(7)"]
        );
    }

    #[test]
    fn once_listeners_fire_a_single_time() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.once(Kind::Ping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(&TestEvent::Ping(1));
        bus.emit(&TestEvent::Ping(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(Kind::Ping), 0);
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn off_removes_only_the_given_listener() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = bus.on(Kind::Ping, recorder(&log, "a"));
        bus.on(Kind::Ping, recorder(&log, "b"));

        assert!(bus.off(Kind::Ping, a));
        assert!(!bus.off(Kind::Ping, a));
        assert!(!bus.off(Kind::Pong, a));

        bus.emit(&TestEvent::Ping(0));
        assert_eq!(*log.lock().unwrap(), vec!["b:Ping(0)"]);
    }

    #[test]
    fn failing_listeners_do_not_stop_dispatch() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(Kind::Ping, |_| Err("boom".into()));
        bus.on(Kind::Ping, |_| panic!("listener exploded"));
        bus.on(Kind::Ping, recorder(&log, "survivor"));

        assert_eq!(bus.emit(&TestEvent::Ping(3)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["survivor:Ping(3)"]);
    }

    #[test]
    fn listeners_may_reenter_the_bus() {
        let bus: Arc<EventBus<TestEvent>> = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(Kind::Pong, recorder(&log, "pong"));

        let inner = Arc::clone(&bus);
        let late = recorder(&log, "late");
        let late = Arc::new(late);
        bus.on(Kind::Ping, move |_| {
            inner.emit(&TestEvent::Pong);
            let late = Arc::clone(&late);
            inner.on(Kind::Ping, move |event| late(event));
            Ok(())
        });

        bus.emit(&TestEvent::Ping(1));
        assert_eq!(*log.lock().unwrap(), vec!["pong:Pong"]);
        assert_eq!(bus.listener_count(Kind::Ping), 2);
    }

    #[test]
    fn introspection_and_cleanup() {
        let bus: EventBus<TestEvent> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(Kind::Pong, recorder(&log, "x"));
        bus.on(Kind::Ping, recorder(&log, "y"));
        bus.on(Kind::Ping, recorder(&log, "z"));

        assert_eq!(bus.event_names(), vec![Kind::Pong, Kind::Ping]);
        assert_eq!(bus.listener_count(Kind::Ping), 2);

        bus.remove_all_listeners(Kind::Ping);
        assert_eq!(bus.listener_count(Kind::Ping), 0);
        assert_eq!(bus.emit(&TestEvent::Ping(0)), 0);

        bus.clear();
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn max_listeners_is_advisory() {
        let bus: EventBus<TestEvent> = EventBus::new();
        assert_eq!(bus.max_listeners(), DEFAULT_MAX_LISTENERS);
        bus.set_max_listeners(1);

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(Kind::Ping, recorder(&log, "a"));
        bus.on(Kind::Ping, recorder(&log, "b"));
        assert_eq!(bus.listener_count(Kind::Ping), 2);
    }
}
