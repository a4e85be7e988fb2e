#![forbid(unsafe_code)]

//! RAII unsubscribe tokens and the listener registry shared by every
//! notifier in the crate.
//!
//! [`Subscription`] is the "unsubscribe" half of every `subscribe` call:
//! state handles, loadable completion listeners, freeze scope flips and
//! suspension aggregates all hand one back. Dropping it releases the
//! listener.
//!
//! [`ListenerSet`] stores zero-argument callbacks keyed by a monotonically
//! increasing id. Notification always iterates a snapshot, so listeners may
//! subscribe or unsubscribe while being notified.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Zero-argument change callback.
pub type Listener = Rc<dyn Fn()>;

/// RAII guard that releases a listener on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a release action.
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A token that releases nothing.
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// Whether dropping this token still has an effect.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Release the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Ordered set of listeners.
pub(crate) struct ListenerSet {
    entries: Rc<RefCell<Vec<(u64, Listener)>>>,
    next_id: Cell<u64>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Rc::new(RefCell::new(Vec::new())),
            next_id: Cell::new(0),
        }
    }

    /// Register `listener`; the returned token removes it.
    pub(crate) fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push((id, listener));

        let weak: Weak<RefCell<Vec<(u64, Listener)>>> = Rc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = weak.upgrade() {
                entries.borrow_mut().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Copy of the current listeners, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect()
    }

    /// Remove and return every listener.
    pub(crate) fn drain(&self) -> Vec<Listener> {
        std::mem::take(&mut *self.entries.borrow_mut())
            .into_iter()
            .map(|(_, listener)| listener)
            .collect()
    }

    /// Call every listener once, in registration order.
    pub(crate) fn notify(&self) {
        for listener in self.snapshot() {
            listener();
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_releases_listener() {
        let set = ListenerSet::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let sub = set.subscribe(Rc::new(move || h.set(h.get() + 1)));
        set.notify();
        assert_eq!(hits.get(), 1);

        drop(sub);
        assert_eq!(set.len(), 0);
        set.notify();
        assert_eq!(hits.get(), 1, "released listener must not fire");
    }

    #[test]
    fn explicit_unsubscribe() {
        let set = ListenerSet::new();
        let sub = set.subscribe(Rc::new(|| {}));
        assert!(sub.is_active());
        sub.unsubscribe();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let set = ListenerSet::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut subs = Vec::new();
        for i in 0..4 {
            let o = Rc::clone(&order);
            subs.push(set.subscribe(Rc::new(move || o.borrow_mut().push(i))));
        }
        set.notify();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn listener_may_unsubscribe_during_notify() {
        let set = Rc::new(ListenerSet::new());
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let s = Rc::clone(&slot);
        let sub = set.subscribe(Rc::new(move || {
            s.borrow_mut().take();
        }));
        *slot.borrow_mut() = Some(sub);
        set.notify();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn token_outliving_set_is_inert() {
        let set = ListenerSet::new();
        let sub = set.subscribe(Rc::new(|| {}));
        drop(set);
        drop(sub);
    }

    #[test]
    fn drain_empties_the_set() {
        let set = ListenerSet::new();
        let _a = set.subscribe(Rc::new(|| {}));
        let _b = set.subscribe(Rc::new(|| {}));
        assert_eq!(set.drain().len(), 2);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn empty_token_is_inactive() {
        let sub = Subscription::empty();
        assert!(!sub.is_active());
        assert!(format!("{sub:?}").contains("active: false"));
    }
}
