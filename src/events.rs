//! Change-notification listeners.
//!
//! Both the entity collection and the table handle accept listeners that
//! are invoked whenever observable state changed. Listeners carry no delta
//! payload: a notification means "something changed, re-read current
//! state".
//!
//! Listeners are stored as asynchronous callbacks. Synchronous handlers
//! are lifted into the asynchronous type with [`sync_listener`], so both
//! kinds register through the same interface.

use std::{future::Future, sync::Arc};

use futures_util::future::BoxFuture;

/// An asynchronous change listener.
///
/// Invoked without arguments; awaited to completion before the next
/// listener runs.
pub type Listener = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to a registered listener, used to remove it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// An ordered set of registered listeners.
///
/// Listeners are notified in registration order, one at a time. There is
/// no concurrent listener invocation from a single notification.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns its removal handle.
    pub fn add(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Removes a previously registered listener.
    ///
    /// Returns whether the listener was still registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones the current listeners, in registration order.
    ///
    /// Notification works on a snapshot so listeners may register or
    /// remove other listeners without affecting the fan-out in progress.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Invokes every registered listener once, awaiting each in turn.
    pub async fn notify(&self) {
        notify_all(&self.snapshot()).await;
    }
}

/// Invokes a snapshot of listeners sequentially.
pub async fn notify_all(listeners: &[Listener]) {
    for listener in listeners {
        listener().await;
    }
}

/// Wraps an asynchronous closure into a [`Listener`].
pub fn async_listener<F, Fut>(f: F) -> Listener
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) })
}

/// Wraps a synchronous closure into a [`Listener`].
///
/// The closure runs when the returned future is awaited, preserving the
/// ordering guarantee of sequential fan-out.
pub fn sync_listener<F>(f: F) -> Listener
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move || -> BoxFuture<'static, ()> {
        let f = Arc::clone(&f);
        Box::pin(async move { f() })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn notifies_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut listeners = Listeners::new();

        for tag in 0..3 {
            let order = Arc::clone(&order);
            listeners.add(sync_listener(move || {
                order.lock().expect("order mutex poisoned").push(tag);
            }));
        }

        listeners.notify().await;
        assert_eq!(*order.lock().expect("order mutex poisoned"), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn removed_listener_is_not_invoked() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = Listeners::new();

        let counter = Arc::clone(&count);
        let id = listeners.add(sync_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));

        listeners.notify().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_and_sync_listeners_unify() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut listeners = Listeners::new();

        let counter = Arc::clone(&count);
        listeners.add(async_listener(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let counter = Arc::clone(&count);
        listeners.add(sync_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.notify().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
