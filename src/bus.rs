//! Prioritised, cancellable publish/subscribe registry.
//!
//! Each connection owns an [`EventBus`] and the server owns one more.
//! Listeners for an [`EventKind`] run in descending priority; listeners with
//! equal priority run in registration order. Before every invocation the bus
//! checks the event's cancellation flag and stops as soon as it is set.
//!
//! # Concurrency
//!
//! The registry sits behind a mutex owned by the bus. [`EventBus::publish`]
//! copies the listener sequence for the event's kind and releases the lock
//! before invoking anything, so listeners may publish further events or
//! (un)register listeners. Registry changes made while a publish is running
//! take effect from the next publish of that kind.
//!
//! Listeners created with [`Listener::detached`] spawn their work onto the
//! current Tokio runtime and return immediately; the bus never waits for that
//! work, and its effects may be observed after later listeners or later
//! events have run.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use log::warn;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::event::{Event, EventKind};

/// Listener priority. Higher values run earlier.
pub type Priority = i32;

/// Priority used when no explicit value is given.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Boxed error type accepted from listener callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a listener callback.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The callback reported an error of its own.
    #[error(transparent)]
    Failed(BoxError),
    /// A detached listener was invoked outside a Tokio runtime.
    #[error("detached listener invoked outside a Tokio runtime")]
    NoRuntime,
}

impl ListenerError {
    /// Wrap any error reported by a callback.
    pub fn new(error: impl Into<BoxError>) -> Self { Self::Failed(error.into()) }
}

/// Result returned by listener callbacks.
pub type ListenerResult = Result<(), ListenerError>;

/// Error returned by [`EventBus::publish`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A synchronous listener failed; listeners after it were not invoked.
    #[error("{kind} listener with priority {priority} failed: {source}")]
    Listener {
        /// Kind of the event being dispatched.
        kind: EventKind,
        /// Priority of the failing listener.
        priority: Priority,
        /// Error reported by the listener.
        #[source]
        source: ListenerError,
    },
}

type Callback = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;

/// A callback bound to an event kind and priority.
#[derive(Clone)]
pub struct Listener {
    kind: EventKind,
    priority: Priority,
    callback: Callback,
}

impl Listener {
    /// Create a synchronous listener.
    ///
    /// An error returned by `callback` aborts the publish that invoked it.
    pub fn new<F>(kind: EventKind, priority: Priority, callback: F) -> Self
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        Self {
            kind,
            priority,
            callback: Arc::new(callback),
        }
    }

    /// Create a listener whose work runs as a detached Tokio task.
    ///
    /// `callback` is called synchronously with a handle to the event and the
    /// returned future is spawned without being awaited. Errors from the
    /// future are logged; the publishing caller never sees them.
    ///
    /// # Examples
    ///
    /// ```
    /// use arciera::{
    ///     bus::{DEFAULT_PRIORITY, Listener},
    ///     event::EventKind,
    /// };
    ///
    /// let listener = Listener::detached(EventKind::PacketReceived, DEFAULT_PRIORITY, |event| {
    ///     async move {
    ///         tracing::info!(len = event.packet().map_or(0, |p| p.len()), "packet");
    ///         Ok(())
    ///     }
    /// });
    /// assert_eq!(listener.kind(), EventKind::PacketReceived);
    /// ```
    pub fn detached<F, Fut>(kind: EventKind, priority: Priority, callback: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        Self::new(kind, priority, move |event: &Event| {
            let handle = Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
            let work = callback(event.clone());
            handle.spawn(
                async move {
                    if let Err(e) = work.await {
                        crate::metrics::inc_listener_errors();
                        warn!(
                            "detached listener failed: kind={kind}, priority={priority}, error={e}"
                        );
                        tracing::warn!(%kind, priority, error = %e, "detached listener failed");
                    }
                }
                .in_current_span(),
            );
            Ok(())
        })
    }

    /// Kind of event this listener receives.
    #[must_use]
    pub const fn kind(&self) -> EventKind { self.kind }

    /// Position of this listener relative to others of the same kind.
    #[must_use]
    pub const fn priority(&self) -> Priority { self.priority }

    fn invoke(&self, event: &Event) -> Result<(), DispatchError> {
        (self.callback)(event).map_err(|source| DispatchError::Listener {
            kind: self.kind,
            priority: self.priority,
            source,
        })
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Handle identifying a registration, used for explicit removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    listener: Listener,
}

type Registry = HashMap<EventKind, Vec<Arc<Registration>>>;

/// Priority-ordered listener registry with cancellable dispatch.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with no listeners.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // Every mutation leaves the map consistent, so a poisoned lock is safe to reuse.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `listener` after every existing listener of greater or equal priority.
    pub fn register(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let priority = listener.priority;
        let mut registry = self.registry();
        let listeners = registry.entry(listener.kind).or_default();
        let index = listeners.partition_point(|existing| existing.listener.priority >= priority);
        listeners.insert(index, Arc::new(Registration { id, listener }));
        id
    }

    /// Register a synchronous callback for `kind`.
    ///
    /// # Examples
    ///
    /// ```
    /// use arciera::{bus::EventBus, event::EventKind};
    ///
    /// let bus = EventBus::new();
    /// bus.on(EventKind::PacketReceived, 10, |event| {
    ///     tracing::debug!(?event, "packet received");
    ///     Ok(())
    /// });
    /// assert_eq!(bus.listener_count(EventKind::PacketReceived), 1);
    /// ```
    pub fn on<F>(&self, kind: EventKind, priority: Priority, callback: F) -> ListenerId
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(Listener::new(kind, priority, callback))
    }

    /// Remove a single registration. Returns `false` if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        for listeners in registry.values_mut() {
            if let Some(index) = listeners.iter().position(|r| r.id == id) {
                listeners.remove(index);
                return true;
            }
        }
        false
    }

    /// Remove every listener for `kind`, or for all kinds when `kind` is `None`.
    pub fn remove_listeners(&self, kind: Option<EventKind>) {
        let mut registry = self.registry();
        match kind {
            Some(kind) => {
                registry.remove(&kind);
            }
            None => registry.clear(),
        }
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry().get(&kind).map_or(0, Vec::len)
    }

    /// Whether no listeners are registered for any kind.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.registry().values().all(Vec::is_empty) }

    /// Deliver `event` to the listeners registered for its kind.
    ///
    /// Dispatch stops before the next listener once the event is cancelled.
    /// Listeners that already ran are not affected.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Listener`] for the first listener that fails;
    /// the remaining listeners are skipped.
    pub fn publish(&self, event: &Event) -> Result<(), DispatchError> {
        let snapshot = self.snapshot(event.kind());
        for registration in snapshot {
            if event.is_cancelled() {
                break;
            }
            registration.listener.invoke(event)?;
        }
        Ok(())
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<Registration>> {
        self.registry().get(&kind).cloned().unwrap_or_default()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        let mut map = f.debug_map();
        for (kind, listeners) in registry.iter() {
            map.entry(kind, &listeners.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use rstest::{fixture, rstest};
    use tracing_test::traced_test;

    use super::*;
    use crate::{connection::Connection, server::Server};

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    #[fixture]
    fn journal() -> Journal { Arc::new(Mutex::new(Vec::new())) }

    fn recorder(
        journal: &Journal,
        label: &'static str,
    ) -> impl Fn(&Event) -> ListenerResult + use<> {
        let journal = Arc::clone(journal);
        move |_| {
            journal.lock().expect("journal lock").push(label);
            Ok(())
        }
    }

    fn entries(journal: &Journal) -> Vec<&'static str> {
        journal.lock().expect("journal lock").clone()
    }

    fn event() -> Event { Event::server_listening(&Server::new(), None) }

    const KIND: EventKind = EventKind::ServerListening;

    #[rstest]
    fn runs_by_descending_priority_with_fifo_ties(journal: Journal) {
        let bus = EventBus::new();
        bus.on(KIND, 5, recorder(&journal, "5a"));
        bus.on(KIND, 10, recorder(&journal, "10"));
        bus.on(KIND, 1, recorder(&journal, "1"));
        bus.on(KIND, 5, recorder(&journal, "5b"));

        bus.publish(&event()).expect("publish succeeds");
        assert_eq!(entries(&journal), ["10", "5a", "5b", "1"]);
    }

    #[rstest]
    fn registration_order_within_tier_is_stable(journal: Journal) {
        let bus = EventBus::new();
        for label in ["first", "second", "third"] {
            bus.on(KIND, DEFAULT_PRIORITY, recorder(&journal, label));
        }
        bus.publish(&event()).expect("publish succeeds");
        bus.publish(&event()).expect("publish succeeds");
        assert_eq!(
            entries(&journal),
            ["first", "second", "third", "first", "second", "third"]
        );
    }

    #[rstest]
    fn cancellation_skips_lower_tiers_only(journal: Journal) {
        let bus = EventBus::new();
        bus.on(KIND, 10, recorder(&journal, "10"));
        bus.on(KIND, 5, recorder(&journal, "5a"));
        let cancelling = Arc::clone(&journal);
        bus.on(KIND, 5, move |event| {
            cancelling.lock().expect("journal lock").push("5-cancel");
            event.cancel();
            Ok(())
        });
        bus.on(KIND, 5, recorder(&journal, "5c"));
        bus.on(KIND, 1, recorder(&journal, "1"));

        let event = event();
        bus.publish(&event).expect("publish succeeds");
        assert!(event.is_cancelled());
        assert_eq!(entries(&journal), ["10", "5a", "5-cancel"]);
    }

    #[rstest]
    fn already_cancelled_event_reaches_nobody(journal: Journal) {
        let bus = EventBus::new();
        bus.on(KIND, 0, recorder(&journal, "never"));
        let event = event();
        event.cancel();
        bus.publish(&event).expect("publish succeeds");
        assert!(entries(&journal).is_empty());
    }

    #[rstest]
    fn dispatch_matches_exact_kind_only(journal: Journal) {
        let bus = EventBus::new();
        bus.on(EventKind::Connected, 0, recorder(&journal, "connected"));
        bus.publish(&event()).expect("publish succeeds");
        assert!(entries(&journal).is_empty());
    }

    #[rstest]
    fn listener_error_aborts_remaining_listeners(journal: Journal) {
        let bus = EventBus::new();
        bus.on(KIND, 3, recorder(&journal, "before"));
        bus.on(KIND, 2, |_| Err(ListenerError::new(io::Error::other("boom"))));
        bus.on(KIND, 1, recorder(&journal, "after"));

        let err = bus.publish(&event()).expect_err("listener failure propagates");
        let DispatchError::Listener { kind, priority, .. } = &err;
        assert_eq!(*kind, KIND);
        assert_eq!(*priority, 2);
        assert!(err.to_string().contains("boom"));
        assert_eq!(entries(&journal), ["before"]);
    }

    #[rstest]
    fn remove_listeners_by_kind_leaves_other_kinds(journal: Journal) {
        let bus = EventBus::new();
        bus.on(KIND, 0, recorder(&journal, "listening"));
        bus.on(EventKind::ConnectionEnd, 0, recorder(&journal, "end"));

        bus.remove_listeners(Some(KIND));
        bus.publish(&event()).expect("publish succeeds");
        assert!(entries(&journal).is_empty());
        assert_eq!(bus.listener_count(KIND), 0);
        assert_eq!(bus.listener_count(EventKind::ConnectionEnd), 1);

        bus.remove_listeners(None);
        assert!(bus.is_empty());
    }

    #[rstest]
    fn remove_by_id_drops_single_registration(journal: Journal) {
        let bus = EventBus::new();
        let first = bus.on(KIND, 0, recorder(&journal, "first"));
        bus.on(KIND, 0, recorder(&journal, "second"));

        assert!(bus.remove(first));
        assert!(!bus.remove(first));
        bus.publish(&event()).expect("publish succeeds");
        assert_eq!(entries(&journal), ["second"]);
    }

    #[rstest]
    fn registrations_during_publish_apply_next_time(journal: Journal) {
        let bus = Arc::new(EventBus::new());
        let inner_bus = Arc::clone(&bus);
        let late = Arc::clone(&journal);
        bus.on(KIND, 10, move |_| {
            let late = Arc::clone(&late);
            inner_bus.on(KIND, 0, move |_| {
                late.lock().expect("journal lock").push("late");
                Ok(())
            });
            Ok(())
        });

        bus.publish(&event()).expect("publish succeeds");
        assert!(entries(&journal).is_empty());
        bus.publish(&event()).expect("publish succeeds");
        assert_eq!(entries(&journal), ["late"]);
    }

    #[rstest]
    fn nested_publish_completes_before_outer_continues(journal: Journal) {
        let server = Server::new();
        let (connection, _io) = Connection::open(&server, None);
        let bus = Arc::new(EventBus::new());
        let nested_bus = Arc::clone(&bus);
        let outer = Arc::clone(&journal);
        bus.on(KIND, 10, move |_| {
            outer.lock().expect("journal lock").push("outer-start");
            nested_bus
                .publish(&Event::connected(&connection))
                .map_err(ListenerError::new)?;
            outer.lock().expect("journal lock").push("outer-end");
            Ok(())
        });
        bus.on(EventKind::Connected, 0, recorder(&journal, "nested"));

        bus.publish(&Event::server_listening(&server, None))
            .expect("publish succeeds");
        assert_eq!(entries(&journal), ["outer-start", "nested", "outer-end"]);
    }

    #[tokio::test]
    async fn detached_listener_does_not_block_dispatch() {
        let bus = EventBus::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Mutex::new(Some(release_rx));
        let done_tx = Mutex::new(Some(done_tx));
        bus.register(Listener::detached(KIND, 10, move |_| {
            let release = release_rx.lock().expect("lock").take();
            let done = done_tx.lock().expect("lock").take();
            async move {
                if let Some(release) = release {
                    let _ = release.await;
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
                Ok(())
            }
        }));
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        bus.on(KIND, 0, recorder(&journal, "sync"));

        bus.publish(&event()).expect("publish returns before detached work");
        assert_eq!(entries(&journal), ["sync"]);

        release_tx.send(()).expect("detached task still waiting");
        done_rx.await.expect("detached task completes");
    }

    #[traced_test]
    #[tokio::test]
    async fn detached_listener_failure_is_logged_not_returned() {
        let bus = EventBus::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let done_tx = Mutex::new(Some(done_tx));
        bus.register(Listener::detached(KIND, 0, move |_| {
            let done = done_tx.lock().expect("lock").take();
            async move {
                if let Some(done) = done {
                    let _ = done.send(());
                }
                Err(ListenerError::new(io::Error::other("storage offline")))
            }
        }));

        bus.publish(&event()).expect("detached failures never reach publish");
        done_rx.await.expect("detached task ran");
        tokio::task::yield_now().await;

        logs_assert(|lines: &[&str]| {
            lines
                .iter()
                .find(|line| {
                    line.contains("detached listener failed") && line.contains("storage offline")
                })
                .map(|_| ())
                .ok_or_else(|| "detached failure log not found".to_string())
        });
    }

    #[test]
    fn detached_listener_outside_runtime_fails() {
        let bus = EventBus::new();
        bus.register(Listener::detached(KIND, 0, |_| async { Ok(()) }));
        let err = bus.publish(&event()).expect_err("no runtime available");
        assert!(matches!(
            err,
            DispatchError::Listener {
                source: ListenerError::NoRuntime,
                ..
            }
        ));
    }
}
