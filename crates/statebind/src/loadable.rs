#![forbid(unsafe_code)]

//! Tri-state snapshots of pending values.
//!
//! [`Loadable::wrap`] turns a [`Pending<T>`] into a shared [`Loadable<T>`]
//! whose state is `Loading`, `HasValue` or `HasError`. Wrapping is memoized
//! per pending identity in a thread-local registry, so every consumer that
//! observes the same pending value shares one Loadable and one completion
//! handler.
//!
//! # Registry
//!
//! The registry maps [`PendingId`] to the Loadable and holds only a *weak*
//! reference to the pending value. Entries whose pending value has been
//! dropped are swept on the next insertion; nothing is attached to the
//! pending value itself.
//!
//! # Notification
//!
//! - A value that is already settled when first wrapped transitions during
//!   the wrap call and dispatches nothing. The caller reads the settled
//!   snapshot straight away.
//! - A value that settles after the wrap returned transitions immediately;
//!   listeners registered with [`Loadable::on_done`] are dispatched at the
//!   end of the current scheduler turn, each exactly once.
//! - Notification is suppressed for the turn in which wrapping occurred. A
//!   listener registered after a settlement in that same turn is not
//!   called; listeners registered while the value was still loading are.
//!
//! # Invariants
//!
//! 1. `wrap(p)` twice returns the same instance (`ptr_eq`) while `p` is alive.
//! 2. State changes at most once, from `Loading` to a settled state.
//! 3. A listener registered after the settlement is called only if the
//!    value settled in a later turn than it was wrapped and the dispatch has
//!    not run yet. Otherwise it is never called; callers check the snapshot
//!    instead.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Failure;
use crate::pending::{Outcome, Pending, PendingId};
use crate::scheduler;
use crate::subscription::{Listener, ListenerSet, Subscription};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Discriminant of a [`LoadState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    Loading,
    HasValue,
    HasError,
}

/// Tri-state snapshot handed to consumers.
#[derive(Clone, Debug)]
pub enum LoadState<T> {
    Loading,
    HasValue(T),
    HasError(Failure),
}

impl<T> LoadState<T> {
    #[must_use]
    pub fn status(&self) -> LoadStatus {
        match self {
            Self::Loading => LoadStatus::Loading,
            Self::HasValue(_) => LoadStatus::HasValue,
            Self::HasError(_) => LoadStatus::HasError,
        }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// The value, defined only in `HasValue`.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::HasValue(value) => Some(value),
            _ => None,
        }
    }

    /// The failure, defined only in `HasError`.
    #[must_use]
    pub fn error(&self) -> Option<&Failure> {
        match self {
            Self::HasError(failure) => Some(failure),
            _ => None,
        }
    }
}

impl<T: PartialEq> PartialEq for LoadState<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Loading, Self::Loading) => true,
            (Self::HasValue(a), Self::HasValue(b)) => a == b,
            (Self::HasError(a), Self::HasError(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loadable
// ---------------------------------------------------------------------------

struct LoadableCell<T> {
    id: PendingId,
    state: RefCell<LoadState<T>>,
    listeners: ListenerSet,
    /// True only while `wrap` is attaching the completion handler.
    wrapping: Cell<bool>,
    /// Settled, but listeners have not been dispatched yet.
    dispatch_pending: Cell<bool>,
    /// Scheduler turn of the first wrap.
    wrapped_turn: u64,
    /// Scheduler turn of the settlement, if it was not silent.
    settled_turn: Cell<Option<u64>>,
}

impl<T: Clone + 'static> LoadableCell<T> {
    fn settle(this: &Rc<Self>, outcome: &Outcome<T>) {
        if !this.state.borrow().is_loading() {
            return;
        }
        *this.state.borrow_mut() = match outcome {
            Ok(value) => LoadState::HasValue(value.clone()),
            Err(failure) => LoadState::HasError(failure.clone()),
        };

        if this.wrapping.get() {
            tracing::trace!(pending = %this.id, "settled during wrap; no dispatch");
            return;
        }

        tracing::debug!(
            pending = %this.id,
            status = ?this.state.borrow().status(),
            listeners = this.listeners.len(),
            "loadable settled"
        );
        this.settled_turn.set(Some(scheduler::current_turn()));
        this.dispatch_pending.set(true);
        let cell = Rc::clone(this);
        scheduler::defer(move || {
            cell.dispatch_pending.set(false);
            for listener in cell.listeners.drain() {
                listener();
            }
        });
    }
}

/// Shared tri-state wrapper around one pending value.
pub struct Loadable<T> {
    cell: Rc<LoadableCell<T>>,
}

impl<T> Clone for Loadable<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: Clone + 'static> Loadable<T> {
    /// Wrap `pending`, reusing the existing Loadable for its identity.
    pub fn wrap(pending: &Pending<T>) -> Self {
        if let Some(cell) = registry_lookup::<T>(pending.id()) {
            return Self { cell };
        }

        let cell = Rc::new(LoadableCell {
            id: pending.id(),
            state: RefCell::new(LoadState::Loading),
            listeners: ListenerSet::new(),
            wrapping: Cell::new(true),
            dispatch_pending: Cell::new(false),
            wrapped_turn: scheduler::current_turn(),
            settled_turn: Cell::new(None),
        });
        registry_insert(pending, &cell);

        let handler = Rc::clone(&cell);
        pending.on_settle(move |outcome| LoadableCell::settle(&handler, outcome));
        cell.wrapping.set(false);

        tracing::trace!(pending = %cell.id, loading = cell.state.borrow().is_loading(), "wrapped");
        Self { cell }
    }

    /// Current snapshot.
    #[must_use]
    pub fn state(&self) -> LoadState<T> {
        self.cell.state.borrow().clone()
    }

    /// The value, if resolved.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.cell.state.borrow().value().cloned()
    }

    /// The failure, if rejected.
    #[must_use]
    pub fn error(&self) -> Option<Failure> {
        self.cell.state.borrow().error().cloned()
    }
}

impl<T> Loadable<T> {
    /// Identity of the wrapped pending value.
    #[must_use]
    pub fn id(&self) -> PendingId {
        self.cell.id
    }

    #[must_use]
    pub fn status(&self) -> LoadStatus {
        self.cell.state.borrow().status()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.cell.state.borrow().is_loading()
    }

    /// Whether both handles are the same shared instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Run `listener` once when this Loadable leaves `Loading`.
    ///
    /// Returns an inactive token if the transition has already been
    /// dispatched, happened silently during the wrap, or happened in the
    /// turn the value was wrapped.
    pub fn on_done(&self, listener: impl Fn() + 'static) -> Subscription {
        self.on_done_rc(Rc::new(listener))
    }

    fn on_done_rc(&self, listener: Listener) -> Subscription {
        if self.is_loading() || self.accepts_late_listeners() {
            self.cell.listeners.subscribe(listener)
        } else {
            Subscription::empty()
        }
    }

    /// Settled in a later turn than the wrap, and not dispatched yet.
    fn accepts_late_listeners(&self) -> bool {
        self.cell.dispatch_pending.get()
            && self
                .cell
                .settled_turn
                .get()
                .is_some_and(|turn| turn != self.cell.wrapped_turn)
    }

    /// Number of listeners waiting for completion.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.cell.listeners.len()
    }
}

impl<T: fmt::Debug> fmt::Debug for Loadable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loadable")
            .field("id", &self.cell.id)
            .field("state", &*self.cell.state.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Type-erased completion, used by suspension aggregation
// ---------------------------------------------------------------------------

/// Something that finishes once and can announce it.
pub(crate) trait Completion {
    fn pending_id(&self) -> PendingId;
    fn is_done(&self) -> bool;
    fn on_done_boxed(&self, listener: Listener) -> Subscription;
}

impl<T> Completion for Loadable<T> {
    fn pending_id(&self) -> PendingId {
        self.id()
    }

    fn is_done(&self) -> bool {
        !self.is_loading()
    }

    fn on_done_boxed(&self, listener: Listener) -> Subscription {
        self.on_done_rc(listener)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryEntry {
    pending: Weak<dyn Any>,
    loadable: Rc<dyn Any>,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<PendingId, RegistryEntry>> = RefCell::new(HashMap::new());
}

fn registry_lookup<T: 'static>(id: PendingId) -> Option<Rc<LoadableCell<T>>> {
    REGISTRY.with(|registry| {
        let registry = registry.borrow();
        let entry = registry.get(&id)?;
        if entry.pending.strong_count() == 0 {
            return None;
        }
        Rc::clone(&entry.loadable).downcast::<LoadableCell<T>>().ok()
    })
}

fn registry_insert<T: Clone + 'static>(pending: &Pending<T>, cell: &Rc<LoadableCell<T>>) {
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        registry.retain(|_, entry| entry.pending.strong_count() > 0);
        let loadable: Rc<dyn Any> = Rc::clone(cell) as Rc<dyn Any>;
        registry.insert(
            pending.id(),
            RegistryEntry {
                pending: pending.liveness(),
                loadable,
            },
        );
    });
}

/// Number of live entries in this thread's loadable registry.
#[must_use]
pub fn registry_len() -> usize {
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .values()
            .filter(|entry| entry.pending.strong_count() > 0)
            .count()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_is_idempotent() {
        let (pending, _resolver) = Pending::<i32>::new();
        let a = Loadable::wrap(&pending);
        let b = Loadable::wrap(&pending.clone());
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), pending.id());
    }

    #[test]
    fn distinct_pending_values_get_distinct_loadables() {
        let (p1, _r1) = Pending::<i32>::new();
        let (p2, _r2) = Pending::<i32>::new();
        assert!(!Loadable::wrap(&p1).ptr_eq(&Loadable::wrap(&p2)));
    }

    #[test]
    fn resolves_to_value_and_notifies_at_end_of_turn() {
        let (pending, resolver) = Pending::new();
        let loadable = Loadable::wrap(&pending);
        assert_eq!(loadable.state(), LoadState::Loading);

        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let _sub = loadable.on_done(move || h.set(h.get() + 1));

        resolver.resolve(100);
        assert_eq!(loadable.value(), Some(100), "state transitions immediately");
        assert_eq!(hits.get(), 0, "dispatch waits for the turn boundary");

        scheduler::end_turn();
        assert_eq!(hits.get(), 1);

        scheduler::end_turn();
        assert_eq!(hits.get(), 1, "listeners fire at most once");
    }

    #[test]
    fn rejection_becomes_has_error() {
        let (pending, resolver) = Pending::<i32>::new();
        let loadable = Loadable::wrap(&pending);
        let failure = Failure::msg("boom");
        resolver.reject(failure.clone());
        assert_eq!(loadable.status(), LoadStatus::HasError);
        assert!(loadable.error().is_some_and(|f| f.ptr_eq(&failure)));
        assert_eq!(loadable.value(), None);
    }

    #[test]
    fn already_settled_value_transitions_silently() {
        let pending = Pending::ready(5);
        let loadable = Loadable::wrap(&pending);
        assert_eq!(loadable.state(), LoadState::HasValue(5));
        assert!(scheduler::is_idle(), "no dispatch is queued");

        let sub = loadable.on_done(|| panic!("must not fire"));
        assert!(!sub.is_active());
        scheduler::end_turn();
    }

    #[test]
    fn listener_added_after_settling_in_the_wrap_turn_is_not_called() {
        let (pending, resolver) = Pending::new();
        let loadable = Loadable::wrap(&pending);

        let early = Rc::new(Cell::new(0));
        let e = Rc::clone(&early);
        let _early = loadable.on_done(move || e.set(e.get() + 1));

        resolver.resolve(1);
        let late = loadable.on_done(|| panic!("settled in the wrap turn"));
        assert!(!late.is_active());

        scheduler::end_turn();
        assert_eq!(early.get(), 1, "listeners from before the settlement still run");
        assert_eq!(loadable.value(), Some(1));
    }

    #[test]
    fn listener_added_between_later_settle_and_dispatch_still_fires() {
        let (pending, resolver) = Pending::new();
        let loadable = Loadable::wrap(&pending);
        scheduler::end_turn();
        resolver.resolve(1);

        let hit = Rc::new(Cell::new(false));
        let h = Rc::clone(&hit);
        let _sub = loadable.on_done(move || h.set(true));
        scheduler::end_turn();
        assert!(hit.get());

        let late = loadable.on_done(|| panic!("dispatch already happened"));
        assert!(!late.is_active());
    }

    #[test]
    fn dropped_listener_is_not_called() {
        let (pending, resolver) = Pending::new();
        let loadable = Loadable::wrap(&pending);
        let sub = loadable.on_done(|| panic!("unsubscribed"));
        assert_eq!(loadable.listener_count(), 1);
        drop(sub);
        resolver.resolve(2);
        scheduler::end_turn();
    }

    #[test]
    fn registry_entry_is_reclaimed_with_the_pending_value() {
        let before = registry_len();
        let (pending, _resolver) = Pending::<u8>::new();
        let _loadable = Loadable::wrap(&pending);
        assert_eq!(registry_len(), before + 1);
        drop(pending);
        assert_eq!(registry_len(), before);
    }
}
