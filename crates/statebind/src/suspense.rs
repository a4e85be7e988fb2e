#![forbid(unsafe_code)]

//! Aggregate-wait signal raised when a read hits pending values.
//!
//! A [`SuspensionSignal`] is not a failure. It tells the host "this read
//! cannot finish yet; retry once *all* of these values have settled". The
//! host subscribes with [`on_settled`](SuspensionSignal::on_settled) and
//! re-invokes the reader when the callback fires.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::loadable::Completion;
use crate::pending::PendingId;
use crate::scheduler;
use crate::subscription::Subscription;

/// The combined completion of every pending value a read depended on.
#[derive(Clone)]
pub struct SuspensionSignal {
    waits: Rc<[Rc<dyn Completion>]>,
}

impl SuspensionSignal {
    pub(crate) fn new(waits: Vec<Rc<dyn Completion>>) -> Self {
        Self {
            waits: waits.into(),
        }
    }

    /// Number of pending values the read was waiting on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Identities of the awaited values, in read order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<PendingId> {
        self.waits.iter().map(|w| w.pending_id()).collect()
    }

    /// How many awaited values are still loading.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.waits.iter().filter(|w| !w.is_done()).count()
    }

    /// Whether every awaited value has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.remaining() == 0
    }

    /// Run `callback` once every awaited value has settled.
    ///
    /// If that is already the case the callback is deferred to the end of
    /// the current turn rather than run inline. Dropping the returned token
    /// cancels the callback.
    pub fn on_settled(&self, callback: impl FnOnce() + 'static) -> Subscription {
        if self.is_settled() {
            let task = scheduler::defer(callback);
            return Subscription::new(move || {
                task.cancel();
            });
        }

        let remaining = Rc::new(Cell::new(self.remaining()));
        let callback: Rc<RefCell<Option<Box<dyn FnOnce()>>>> =
            Rc::new(RefCell::new(Some(Box::new(callback))));

        let mut tokens = Vec::new();
        for wait in self.waits.iter().filter(|w| !w.is_done()) {
            let remaining = Rc::clone(&remaining);
            let callback = Rc::clone(&callback);
            tokens.push(wait.on_done_boxed(Rc::new(move || {
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() == 0 {
                    let ready = callback.borrow_mut().take();
                    if let Some(ready) = ready {
                        ready();
                    }
                }
            })));
        }
        Subscription::new(move || drop(tokens))
    }
}

impl fmt::Debug for SuspensionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspensionSignal")
            .field("pending", &self.pending_ids())
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl fmt::Display for SuspensionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "suspended on {} pending value(s), {} still loading",
            self.len(),
            self.remaining()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadable::Loadable;
    use crate::pending::Pending;

    fn signal_for(loadables: &[Loadable<i32>]) -> SuspensionSignal {
        SuspensionSignal::new(
            loadables
                .iter()
                .map(|l| Rc::new(l.clone()) as Rc<dyn Completion>)
                .collect(),
        )
    }

    #[test]
    fn waits_for_every_value() {
        let (p1, r1) = Pending::new();
        let (p2, r2) = Pending::new();
        let signal = signal_for(&[Loadable::wrap(&p1), Loadable::wrap(&p2)]);
        assert_eq!(signal.len(), 2);
        assert_eq!(signal.pending_ids(), vec![p1.id(), p2.id()]);

        let fired = Rc::new(Cell::new(0));
        let f = Rc::clone(&fired);
        let _token = signal.on_settled(move || f.set(f.get() + 1));

        r1.resolve(1);
        scheduler::end_turn();
        assert_eq!(fired.get(), 0, "one of two settled is not enough");
        assert_eq!(signal.remaining(), 1);

        r2.reject(crate::error::Failure::msg("x"));
        scheduler::end_turn();
        assert_eq!(fired.get(), 1);
        assert!(signal.is_settled());
    }

    #[test]
    fn already_settled_signal_defers_callback() {
        let (p, r) = Pending::new();
        let signal = signal_for(&[Loadable::wrap(&p)]);
        r.resolve(1);

        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        let _token = signal.on_settled(move || f.set(true));
        assert!(!fired.get());
        scheduler::run_until_idle().expect("idle");
        assert!(fired.get());
    }

    #[test]
    fn dropping_token_cancels_callback() {
        let (p, r) = Pending::new();
        let signal = signal_for(&[Loadable::wrap(&p)]);
        let token = signal.on_settled(|| panic!("cancelled"));
        drop(token);
        r.resolve(3);
        scheduler::run_until_idle().expect("idle");
    }

    #[test]
    fn display_mentions_counts() {
        let (p, _r) = Pending::new();
        let signal = signal_for(&[Loadable::wrap(&p)]);
        assert_eq!(
            signal.to_string(),
            "suspended on 1 pending value(s), 1 still loading"
        );
    }
}
