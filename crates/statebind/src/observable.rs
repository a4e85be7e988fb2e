#![forbid(unsafe_code)]

//! Reference state handle.
//!
//! [`Observable<T>`] is a shared, version-tracked value with zero-argument
//! change notification. It is the state-handle collaborator the bridge is
//! tested against, and a convenient store for applications that do not
//! bring their own.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per mutation that changes the value
//!    (by [`StateValue::same_identity`]).
//! 2. Setting a value with the same identity is a no-op: no version bump,
//!    no notification.
//! 3. [`notify`](Observable::notify) fires subscribers without touching the
//!    value, for stores that signal spuriously.
//! 4. Subscribers are notified in registration order, from a snapshot, so
//!    they may read or write the observable re-entrantly.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::state::{StateHandle, StateRef, StateValue};
use crate::subscription::{Listener, ListenerSet, Subscription};

struct ObservableInner<T> {
    value: RefCell<T>,
    version: Cell<u64>,
    listeners: ListenerSet,
}

/// A shared, observable value. Clones share the same state.
pub struct Observable<T> {
    inner: Rc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: StateValue> Observable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(ObservableInner {
                value: RefCell::new(value),
                version: Cell::new(0),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Replace the value and notify, unless it is the same identity.
    pub fn set(&self, value: T) {
        if self.inner.value.borrow().same_identity(&value) {
            return;
        }
        *self.inner.value.borrow_mut() = value;
        self.inner.version.set(self.inner.version.get() + 1);
        self.notify();
    }

    /// Compute the next value from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = self.with(f);
        self.set(next);
    }

    /// Fire every subscriber without changing the value.
    pub fn notify(&self) {
        self.inner.listeners.notify();
    }

    /// Mutation counter.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self, listener: impl Fn() + 'static) -> Subscription {
        self.inner.listeners.subscribe(Rc::new(listener))
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Type-erased handle for reader inputs.
    #[must_use]
    pub fn handle(&self) -> StateRef<T> {
        Rc::new(self.clone())
    }

    /// `(current value, handle)` pair.
    #[must_use]
    pub fn pair(&self) -> (T, StateRef<T>) {
        (self.get(), self.handle())
    }
}

impl<T: StateValue> StateHandle for Observable<T> {
    type Value = T;

    fn get(&self) -> T {
        Observable::get(self)
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }
}

impl<T: StateValue> From<&Observable<T>> for crate::input::StateInput<T> {
    fn from(observable: &Observable<T>) -> Self {
        Self::Single(observable.handle())
    }
}

impl<T: StateValue> From<&Observable<T>> for crate::input::StateItem<T> {
    fn from(observable: &Observable<T>) -> Self {
        Self::Handle(observable.handle())
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .field("subscribers", &self.inner.listeners.len())
            .finish()
    }
}
