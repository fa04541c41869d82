//! Fan-out of inbound wire events to application listeners.
//!
//! Listeners register against a [`EventFilter`]: either one concrete
//! [`EventKind`] or the wildcard. Dispatch is synchronous and ordered:
//! kind-specific listeners run first, wildcard listeners second, each
//! group in registration order. A panicking listener is contained and
//! logged; the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::event::{EventKind, WireEvent};

/// What a listener wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Kind(EventKind),
    Wildcard,
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&WireEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventRouter {
    listeners: Vec<(u64, EventFilter, Listener)>,
    next_id: u64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&mut self, filter: EventFilter, listener: F) -> ListenerId
    where
        F: Fn(&WireEvent) + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, filter, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _, _)| *lid != id.0);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver one event to every matching listener.
    pub fn dispatch(&self, event: &WireEvent) {
        for (_, _, listener) in self
            .listeners
            .iter()
            .filter(|(_, f, _)| *f == EventFilter::Kind(event.kind))
            .chain(
                self.listeners
                    .iter()
                    .filter(|(_, f, _)| *f == EventFilter::Wildcard),
            )
        {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("listener panicked handling {}", event.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn event(kind: EventKind) -> WireEvent {
        WireEvent::new(kind, Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({}))
    }

    #[test]
    fn test_kind_filter_matches_only_its_kind() {
        let mut router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        router.add_listener(EventFilter::Kind(EventKind::TableCreated), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&event(EventKind::TableCreated));
        router.dispatch(&event(EventKind::NoteDeleted));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_sees_everything() {
        let mut router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        router.add_listener(EventFilter::Wildcard, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&event(EventKind::TableCreated));
        router.dispatch(&event(EventKind::CursorMoved));
        router.dispatch(&event(EventKind::UserJoined));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_kind_listeners_run_before_wildcard() {
        let mut router = EventRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        router.add_listener(EventFilter::Wildcard, move |_| {
            log.lock().unwrap().push("wildcard");
        });
        let log = order.clone();
        router.add_listener(EventFilter::Kind(EventKind::AreaCreated), move |_| {
            log.lock().unwrap().push("kind");
        });

        router.dispatch(&event(EventKind::AreaCreated));
        assert_eq!(*order.lock().unwrap(), vec!["kind", "wildcard"]);
    }

    #[test]
    fn test_remove_listener() {
        let mut router = EventRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = router.add_listener(EventFilter::Wildcard, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(router.remove_listener(id));
        assert!(!router.remove_listener(id));
        router.dispatch(&event(EventKind::TableCreated));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let mut router = EventRouter::new();
        router.add_listener(EventFilter::Wildcard, |_| {
            panic!("listener bug");
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        router.add_listener(EventFilter::Wildcard, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&event(EventKind::TableCreated));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
