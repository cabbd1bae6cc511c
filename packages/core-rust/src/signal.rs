//! Typed observer lists used for change notification across the server.
//!
//! A [`Signal`] holds a list of subscriber callbacks and invokes all of them
//! when [`Signal::emit`] is called. Connecting a callback returns a
//! [`Disposer`] that disconnects the callback when dropped (or when
//! [`Disposer::dispose`] is called explicitly); long-lived subscriptions call
//! [`Disposer::detach`] to keep the connection for the lifetime of the signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    id: u64,
    callback: Callback<T>,
}

struct Shared<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot<T>>>,
}

/// A typed list of observer callbacks.
///
/// Cloning a signal produces another handle to the same subscriber list, so
/// a component can hand out the signal while retaining the ability to emit.
pub struct Signal<T> {
    shared: Arc<Shared<T>>,
}

impl<T: 'static> Signal<T> {
    /// Creates a signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connects a callback to this signal.
    ///
    /// The callback stays connected as long as the returned [`Disposer`] is
    /// alive (or has been detached).
    #[must_use]
    pub fn connect<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.slots.lock().push(Slot {
            id,
            callback: Arc::new(callback),
        });

        let shared = Arc::downgrade(&self.shared);
        Disposer::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.slots.lock().retain(|slot| slot.id != id);
            }
        })
    }

    /// Invokes every connected callback with the given value.
    ///
    /// Callbacks are invoked outside the internal lock, so a callback may
    /// connect or disconnect subscribers while the signal is being emitted.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .shared
            .slots
            .lock()
            .iter()
            .map(|slot| Arc::clone(&slot.callback))
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Returns the number of connected callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.slots.lock().len()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle that disconnects a signal subscription.
///
/// Dropping the disposer disconnects the callback. Call [`Disposer::detach`]
/// to keep the subscription alive without holding on to the handle.
#[must_use = "dropping a Disposer disconnects the subscription; call detach() to keep it"]
pub struct Disposer {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    /// Wraps a disposal action.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A disposer that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self { action: None }
    }

    /// Disconnects the subscription now.
    pub fn dispose(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    /// Keeps the subscription connected for the lifetime of the signal.
    pub fn detach(mut self) {
        self.action = None;
    }

    /// Merges several disposers into one that disposes all of them.
    #[must_use]
    pub fn all(disposers: Vec<Disposer>) -> Self {
        Self::new(move || {
            for disposer in disposers {
                disposer.dispose();
            }
        })
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

/// Weak-reference helper: connects a callback that is dropped automatically
/// together with the signal. Used in tests and by components whose callbacks
/// hold weak back-references.
pub fn connect_weak<T: 'static, O, F>(signal: &Signal<T>, owner: &Arc<O>, callback: F) -> Disposer
where
    O: Send + Sync + 'static,
    F: Fn(&O, &T) + Send + Sync + 'static,
{
    let weak: Weak<O> = Arc::downgrade(owner);
    signal.connect(move |value| {
        if let Some(owner) = weak.upgrade() {
            callback(&owner, value);
        }
    })
}
