#![forbid(unsafe_code)]

//! The boundary with external state handles.
//!
//! A state handle is anything with a synchronous [`get`](StateHandle::get)
//! and a no-argument change [`subscribe`](StateHandle::subscribe). Handles
//! are stored type-erased as [`StateRef<V>`] so a consumer can track an
//! ordered list of them.
//!
//! Values flowing out of handles implement [`StateValue`], which answers two
//! questions the bridge needs: "is this the same value I saw last time?"
//! ([`same_identity`](StateValue::same_identity)) and "is it ready or still
//! pending?" ([`classify`](StateValue::classify)).
//!
//! # Identity
//!
//! Identity is never deep equality:
//!
//! - [`Pending<T>`] and `Rc<T>` compare by allocation (`Rc::ptr_eq`).
//! - Scalars, `String` and `&'static str` compare by value, which is the
//!   only identity an owned scalar has.
//! - [`MaybePending<T>`] and `Option<T>` delegate to their payload.

use std::rc::Rc;
use std::sync::Arc;

use crate::pending::Pending;
use crate::subscription::{Listener, Subscription};

/// A value that is either available now or still being computed.
pub enum MaybePending<T> {
    Ready(T),
    Pending(Pending<T>),
}

impl<T> MaybePending<T> {
    /// Whether this wraps a pending computation, settled or not.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

impl<T: Clone> Clone for MaybePending<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(value) => Self::Ready(value.clone()),
            Self::Pending(pending) => Self::Pending(pending.clone()),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MaybePending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Pending(pending) => f.debug_tuple("Pending").field(pending).finish(),
        }
    }
}

impl<T> From<Pending<T>> for MaybePending<T> {
    fn from(pending: Pending<T>) -> Self {
        Self::Pending(pending)
    }
}

/// A value that can be read from a state handle.
pub trait StateValue: Clone + 'static {
    /// What a reader hands back once the value is resolved.
    type Output: Clone + 'static;

    /// Identity comparison used by change detection and staleness checks.
    fn same_identity(&self, other: &Self) -> bool;

    /// Split into a ready output or a pending computation.
    fn classify(&self) -> MaybePending<Self::Output>;
}

impl<T: StateValue> StateValue for MaybePending<T> {
    type Output = T;

    fn same_identity(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ready(a), Self::Ready(b)) => a.same_identity(b),
            (Self::Pending(a), Self::Pending(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    fn classify(&self) -> MaybePending<T> {
        self.clone()
    }
}

impl<T: Clone + 'static> StateValue for Pending<T> {
    type Output = T;

    fn same_identity(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }

    fn classify(&self) -> MaybePending<T> {
        MaybePending::Pending(self.clone())
    }
}

impl<T: ?Sized + 'static> StateValue for Rc<T> {
    type Output = Self;

    fn same_identity(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }

    fn classify(&self) -> MaybePending<Self> {
        MaybePending::Ready(Rc::clone(self))
    }
}

impl<T: ?Sized + 'static> StateValue for Arc<T> {
    type Output = Self;

    fn same_identity(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }

    fn classify(&self) -> MaybePending<Self> {
        MaybePending::Ready(Arc::clone(self))
    }
}

impl<T: StateValue> StateValue for Option<T> {
    type Output = Self;

    fn same_identity(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_identity(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn classify(&self) -> MaybePending<Self> {
        MaybePending::Ready(self.clone())
    }
}

macro_rules! impl_scalar_state_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl StateValue for $ty {
                type Output = Self;

                fn same_identity(&self, other: &Self) -> bool {
                    self == other
                }

                fn classify(&self) -> MaybePending<Self> {
                    MaybePending::Ready(self.clone())
                }
            }
        )*
    };
}

impl_scalar_state_value!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    &'static str,
);

/// An observable external state.
pub trait StateHandle {
    type Value: StateValue;

    /// Current value. Must be synchronous and side-effect free.
    fn get(&self) -> Self::Value;

    /// Call `listener` on every change notification (not necessarily only
    /// when the value actually changed).
    fn subscribe(&self, listener: Listener) -> Subscription;
}

/// Type-erased, shared state handle.
pub type StateRef<V> = Rc<dyn StateHandle<Value = V>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_compare_by_value() {
        assert!(5_i32.same_identity(&5));
        assert!(!5_i32.same_identity(&6));
        assert!(String::from("a").same_identity(&String::from("a")));
    }

    #[test]
    fn rc_compares_by_pointer() {
        let a = Rc::new(vec![1, 2]);
        let b = Rc::new(vec![1, 2]);
        assert!(a.same_identity(&Rc::clone(&a)));
        assert!(!a.same_identity(&b), "equal contents are not the same identity");
    }

    #[test]
    fn maybe_pending_identity() {
        let (p, _r) = Pending::<i32>::new();
        let a = MaybePending::Pending(p.clone());
        let b = MaybePending::Pending(p);
        let (q, _r2) = Pending::<i32>::new();
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&MaybePending::Pending(q)));
        assert!(!a.same_identity(&MaybePending::Ready(1)));
        assert!(MaybePending::Ready(1).same_identity(&MaybePending::Ready(1)));
    }

    #[test]
    fn classify_splits_ready_and_pending() {
        assert!(matches!(3_u8.classify(), MaybePending::Ready(3)));
        let (p, _r) = Pending::<u8>::new();
        assert!(p.classify().is_pending());
        assert!(!Some(1_u8).classify().is_pending());
    }
}
