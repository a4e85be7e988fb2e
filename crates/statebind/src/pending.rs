#![forbid(unsafe_code)]

//! Single-assignment asynchronous values.
//!
//! A [`Pending<T>`] is the promise-like half of an asynchronous computation:
//! it settles exactly once, with a value or a [`Failure`], through its
//! [`Resolver<T>`]. Clones of a `Pending` share one allocation, and that
//! allocation *is* the value's identity. The loadable registry keys on it
//! and staleness checks compare it.
//!
//! # Invariants
//!
//! 1. A pending value settles at most once; later `resolve`/`reject` calls
//!    return `false` and change nothing.
//! 2. Settle callbacks run exactly once, in registration order. A callback
//!    registered after settlement runs immediately.
//! 3. The resolver holds only a weak reference: once every `Pending` clone
//!    is gone, resolving is a silent no-op.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Failure;

/// Result a pending value settles with.
pub type Outcome<T> = Result<T, Failure>;

type SettleCallback<T> = Box<dyn FnOnce(&Outcome<T>)>;

static NEXT_PENDING_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a pending value, stable across clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(u64);

impl PendingId {
    fn next() -> Self {
        Self(NEXT_PENDING_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id, for logging.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending#{}", self.0)
    }
}

struct PendingInner<T> {
    id: PendingId,
    outcome: RefCell<Option<Outcome<T>>>,
    callbacks: RefCell<Vec<SettleCallback<T>>>,
}

impl<T> PendingInner<T> {
    fn settle(&self, outcome: Outcome<T>) -> bool {
        {
            let mut slot = self.outcome.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        let outcome = self.outcome.borrow();
        if let Some(outcome) = outcome.as_ref() {
            for callback in callbacks {
                callback(outcome);
            }
        }
        true
    }
}

/// A value that will be available later.
pub struct Pending<T> {
    inner: Rc<PendingInner<T>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Pending<T> {
    /// Create an unsettled value and the resolver that settles it.
    #[must_use]
    pub fn new() -> (Self, Resolver<T>) {
        let inner = Rc::new(PendingInner {
            id: PendingId::next(),
            outcome: RefCell::new(None),
            callbacks: RefCell::new(Vec::new()),
        });
        let resolver = Resolver {
            inner: Rc::downgrade(&inner),
        };
        (Self { inner }, resolver)
    }

    /// A value that is already resolved.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let (pending, resolver) = Self::new();
        resolver.resolve(value);
        pending
    }

    /// A value that has already failed.
    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        let (pending, resolver) = Self::new();
        resolver.reject(failure);
        pending
    }

    /// Identity shared by all clones.
    #[must_use]
    pub fn id(&self) -> PendingId {
        self.inner.id
    }

    /// Whether the value has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Whether both handles refer to the same pending value.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `callback` once the value settles (immediately if it already has).
    pub fn on_settle(&self, callback: impl FnOnce(&Outcome<T>) + 'static) {
        let settled = self.inner.outcome.borrow();
        match settled.as_ref() {
            Some(outcome) => callback(outcome),
            None => {
                drop(settled);
                self.inner.callbacks.borrow_mut().push(Box::new(callback));
            }
        }
    }

    /// Weak liveness token used by the loadable registry.
    pub(crate) fn liveness(&self) -> Weak<dyn Any> {
        let weak: Weak<PendingInner<T>> = Rc::downgrade(&self.inner);
        weak
    }
}

impl<T: Clone + 'static> Pending<T> {
    /// Copy of the outcome, if settled.
    #[must_use]
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.inner.outcome.borrow().clone()
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.inner.id)
            .field("settled", &self.inner.outcome.borrow().is_some())
            .finish()
    }
}

/// Settles a [`Pending<T>`].
pub struct Resolver<T> {
    inner: Weak<PendingInner<T>>,
}

impl<T> Resolver<T> {
    /// Settle with a value. Returns `false` if already settled or abandoned.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with a failure. Returns `false` if already settled or abandoned.
    pub fn reject(&self, failure: Failure) -> bool {
        self.settle(Err(failure))
    }

    /// Settle with an explicit outcome.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.settle(outcome),
            None => false,
        }
    }

    /// Whether some `Pending` clone is still alive.
    #[must_use]
    pub fn is_observed(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("observed", &self.is_observed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn settles_once() {
        let (pending, resolver) = Pending::new();
        assert!(!pending.is_settled());
        assert!(resolver.resolve(1));
        assert!(!resolver.resolve(2));
        assert!(!resolver.reject(Failure::msg("late")));
        assert_eq!(pending.peek().map(Result::ok), Some(Some(1)));
    }

    #[test]
    fn callbacks_run_on_settle_and_immediately_after() {
        let (pending, resolver) = Pending::new();
        let seen = Rc::new(Cell::new(0));

        let s = Rc::clone(&seen);
        pending.on_settle(move |outcome| s.set(*outcome.as_ref().unwrap_or(&-1)));
        assert_eq!(seen.get(), 0);

        resolver.resolve(7);
        assert_eq!(seen.get(), 7);

        let late = Rc::new(Cell::new(0));
        let l = Rc::clone(&late);
        pending.on_settle(move |outcome| l.set(*outcome.as_ref().unwrap_or(&-1) * 2));
        assert_eq!(late.get(), 14, "late callback runs synchronously");
    }

    #[test]
    fn clones_share_identity() {
        let (a, _resolver) = Pending::<u8>::new();
        let b = a.clone();
        let (c, _other) = Pending::<u8>::new();
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), b.id());
        assert!(!a.ptr_eq(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn abandoned_resolver_is_inert() {
        let (pending, resolver) = Pending::<u8>::new();
        assert!(resolver.is_observed());
        drop(pending);
        assert!(!resolver.is_observed());
        assert!(!resolver.resolve(1));
    }

    #[test]
    fn pre_settled_constructors() {
        assert!(Pending::ready(3).is_settled());
        let failed = Pending::<u8>::failed(Failure::msg("nope"));
        match failed.peek() {
            Some(Err(failure)) => assert_eq!(failure.to_string(), "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
