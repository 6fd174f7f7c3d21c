//! Typed publish/subscribe registries, invoked inline on the ingest thread
//! (spec.md §4/§5: "Listener dispatch is inline on the ingest thread, by
//! design, to minimise latency"). A failing listener must never stall or
//! kill the ingest loop, so dispatch is wrapped in `catch_unwind` and
//! logged, never propagated.
//!
//! Grounded on the teacher's `broadcast::Sender<PeerEvent>` fan-out in
//! `tasks/membership.rs`, generalized into a reusable, copy-on-iterate set
//! so each event kind (device updates, beats, master changes, media
//! details, lifecycle, on-air, fader-start, sync, master-handoff) gets its
//! own typed registry without re-deriving the isolation logic each time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::error;

pub trait Listener<T>: Send + Sync {
    fn on_event(&self, event: &T);
}

impl<F, T> Listener<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn on_event(&self, event: &T) {
        self(event)
    }
}

/// A set of subscribers for one event type `T`.
///
/// `notify` takes a snapshot of the current subscriber list (copy-on-iterate,
/// per spec.md §9's design note) before invoking any of them, so a listener
/// that subscribes/unsubscribes during dispatch never observes a
/// half-updated list and dispatch never holds the lock while calling out.
pub struct ListenerSet<T> {
    listeners: Mutex<Vec<Arc<dyn Listener<T>>>>,
    label: &'static str,
}

impl<T> ListenerSet<T> {
    pub fn new(label: &'static str) -> Self {
        ListenerSet {
            listeners: Mutex::new(Vec::new()),
            label,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn Listener<T>>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches `event` to every current subscriber, isolating panics and
    /// letting each listener run even if an earlier one misbehaves.
    pub fn notify(&self, event: &T) {
        let snapshot: Vec<Arc<dyn Listener<T>>> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if let Err(_) = result {
                error!(target: "prolink", "listener panicked during {} dispatch", self.label);
            }
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new("event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn all_listeners_run_even_if_one_panics() {
        let set: ListenerSet<u32> = ListenerSet::new("test");
        let calls = Arc::new(AtomicUsize::new(0));

        set.subscribe(Arc::new(|_: &u32| {
            panic!("boom");
        }));

        let calls_clone = calls.clone();
        set.subscribe(Arc::new(move |_: &u32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        set.notify(&42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_via_clear_stops_future_dispatch() {
        let set: ListenerSet<u32> = ListenerSet::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        set.subscribe(Arc::new(move |_: &u32| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        set.notify(&1);
        set.clear();
        set.notify(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
