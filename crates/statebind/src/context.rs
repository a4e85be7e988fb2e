#![forbid(unsafe_code)]

//! Per-consumer subscription context.
//!
//! A [`SubscriptionContext`] lives as long as the consumer it serves and is
//! reused across that consumer's renders. Each render hands it the current
//! [`StateInput`]; the context records what it read, subscribes to the
//! handles once, and turns later change notifications into re-render
//! requests.
//!
//! # Read cycle
//!
//! 1. Normalize the input; an invalid input fails the read.
//! 2. Read every handle. The values become `next_values`; the previous
//!    `next_values` become `prev_values`.
//! 3. Apply the reader's transform to each value in order.
//! 4. On the first render only, subscribe once per handle. The tokens are
//!    kept until [`dispose`](SubscriptionContext::dispose).
//!
//! # Escalation
//!
//! A notification is filtered by the configured [`ChangePolicy`], then
//! escalated. If the enclosing [`FreezeScope`] is frozen, the re-render
//! trigger is parked in the scope; otherwise the host trigger fires
//! straight away.
//!
//! # Invariants
//!
//! 1. `prev_values` of render *n* equals `next_values` of render *n-1*. On
//!    the first render both hold the freshly read values.
//! 2. Values are compared by [`StateValue::same_identity`], index by index.
//! 3. A completion watch for index *i* escalates only if *i* is still bound
//!    to the pending identity the watch was registered for.
//! 4. Once disposed, the context never fires its host trigger again.
//! 5. At most one completion watch is held per index. It is released when it
//!    fires, or by the first read that finds the index bound elsewhere.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | Empty sequence input | `InvalidInputError`, nothing read or subscribed |
//! | Handle count changes between renders | Subscriptions stay on the first render's handles; comparisons use the current list |
//! | Notification after dispose | Ignored |

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{BindingConfig, ChangePolicy};
use crate::error::InvalidInputError;
use crate::freeze::FreezeScope;
use crate::input::{StateInput, normalize};
use crate::loadable::Loadable;
use crate::pending::PendingId;
use crate::state::{MaybePending, StateRef, StateValue};
use crate::subscription::Subscription;
use crate::trigger::RerenderTrigger;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Result of one read, shaped like the input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reading<T> {
    /// The input was a single handle or pair.
    One(T),
    /// The input was a sequence; same length and order.
    Many(Vec<T>),
}

impl<T> Reading<T> {
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All values in order, regardless of shape.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }

    /// The scalar result, or `None` for a sequence.
    #[must_use]
    pub fn into_one(self) -> Option<T> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(_) => None,
        }
    }

    /// All values as a vector.
    #[must_use]
    pub fn into_many(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Reading<U> {
        match self {
            Self::One(value) => Reading::One(f(value)),
            Self::Many(values) => Reading::Many(values.into_iter().map(f).collect()),
        }
    }
}

impl<T> Reading<Option<T>> {
    /// `Some` only if every element is `Some`.
    #[must_use]
    pub fn transpose(self) -> Option<Reading<T>> {
        match self {
            Self::One(value) => value.map(Reading::One),
            Self::Many(values) => values.into_iter().collect::<Option<Vec<_>>>().map(Reading::Many),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

struct ContextInner<V: StateValue> {
    id: u64,
    host: RerenderTrigger,
    /// Fires `host` unless the context has been disposed.
    gated: RerenderTrigger,
    freeze: Option<FreezeScope>,
    policy: ChangePolicy,
    handles: RefCell<Vec<StateRef<V>>>,
    prev_values: RefCell<Vec<V>>,
    next_values: RefCell<Vec<V>>,
    tokens: RefCell<Vec<Subscription>>,
    /// Completion watches keyed by the index and pending identity they serve.
    watches: RefCell<HashMap<(usize, PendingId), Subscription>>,
    subscribed: Cell<bool>,
    disposed: Cell<bool>,
    renders: Cell<u64>,
}

impl<V: StateValue> ContextInner<V> {
    fn on_change(&self) {
        if self.disposed.get() {
            return;
        }
        match self.policy {
            ChangePolicy::Unconditional => self.escalate(),
            ChangePolicy::CompareBeforeEscalate => {
                let handles = self.handles.borrow().clone();
                let fresh: Vec<V> = handles.iter().map(|handle| handle.get()).collect();
                let changed = {
                    let seen = self.next_values.borrow();
                    fresh.len() != seen.len()
                        || fresh.iter().zip(seen.iter()).any(|(a, b)| !a.same_identity(b))
                };
                if changed {
                    self.escalate();
                } else {
                    tracing::trace!(consumer = self.id, "notification without change");
                }
            }
        }
    }

    fn escalate(&self) {
        if self.disposed.get() {
            return;
        }
        match &self.freeze {
            Some(scope) if scope.is_frozen() => {
                tracing::trace!(consumer = self.id, scope = scope.id(), "render deferred by freeze");
                scope.request_rerender(self.gated.clone());
            }
            _ => {
                tracing::trace!(consumer = self.id, "render requested");
                self.gated.fire();
            }
        }
    }

    /// Pending identity currently bound to `index`, if any.
    fn bound_pending(&self, index: usize) -> Option<PendingId> {
        match self.next_values.borrow().get(index)?.classify() {
            MaybePending::Pending(pending) => Some(pending.id()),
            MaybePending::Ready(_) => None,
        }
    }

    /// Drop watches whose index has been re-bound since they were set up.
    fn prune_watches(&self) {
        let mut watches = self.watches.borrow_mut();
        let before = watches.len();
        watches.retain(|&(index, pending), _| self.bound_pending(index) == Some(pending));
        let released = before - watches.len();
        if released > 0 {
            tracing::trace!(consumer = self.id, released, "superseded completion watches released");
        }
    }
}

/// Subscription bookkeeping for one consumer.
pub struct SubscriptionContext<V: StateValue> {
    inner: Rc<ContextInner<V>>,
}

impl<V: StateValue> SubscriptionContext<V> {
    /// Context with the default [`BindingConfig`].
    #[must_use]
    pub fn new(trigger: RerenderTrigger, freeze: Option<&FreezeScope>) -> Self {
        Self::with_config(trigger, freeze, &BindingConfig::default())
    }

    #[must_use]
    pub fn with_config(
        trigger: RerenderTrigger,
        freeze: Option<&FreezeScope>,
        config: &BindingConfig,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ContextInner<V>>| {
            let weak = weak.clone();
            let gated = RerenderTrigger::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if !inner.disposed.get() {
                        inner.host.fire();
                    }
                }
            });
            ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                host: trigger,
                gated,
                freeze: freeze.cloned(),
                policy: config.change_policy,
                handles: RefCell::new(Vec::new()),
                prev_values: RefCell::new(Vec::new()),
                next_values: RefCell::new(Vec::new()),
                tokens: RefCell::new(Vec::new()),
                watches: RefCell::new(HashMap::new()),
                subscribed: Cell::new(false),
                disposed: Cell::new(false),
                renders: Cell::new(0),
            }
        });
        Self { inner }
    }

    /// Run one read cycle, transforming each fresh value with `transform`.
    ///
    /// `transform` receives the value and its index. It may call back into
    /// the context (e.g. [`watch_completion`](Self::watch_completion)).
    pub(crate) fn read<R>(
        &self,
        input: &StateInput<V>,
        mut transform: impl FnMut(&V, usize) -> R,
    ) -> Result<Reading<R>, InvalidInputError> {
        let inner = &self.inner;
        let normalized = normalize(input)?;
        let render = inner.renders.get() + 1;
        inner.renders.set(render);

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!(
            "statebind_read",
            consumer = inner.id,
            render,
            handles = normalized.handles.len()
        )
        .entered();

        let fresh: Vec<V> = normalized.handles.iter().map(|handle| handle.get()).collect();
        *inner.handles.borrow_mut() = normalized.handles;
        let previous = inner.next_values.replace(fresh.clone());
        *inner.prev_values.borrow_mut() = if render == 1 { fresh.clone() } else { previous };
        inner.prune_watches();

        let mut results: Vec<R> = fresh
            .iter()
            .enumerate()
            .map(|(index, value)| transform(value, index))
            .collect();

        self.ensure_subscribed();

        if normalized.is_multiple {
            return Ok(Reading::Many(results));
        }
        // `normalize` hands back exactly one handle for a non-multiple input.
        debug_assert_eq!(results.len(), 1);
        Ok(Reading::One(results.swap_remove(0)))
    }

    fn ensure_subscribed(&self) {
        let inner = &self.inner;
        if inner.disposed.get() || inner.subscribed.replace(true) {
            return;
        }
        let handles = inner.handles.borrow().clone();
        let mut tokens = inner.tokens.borrow_mut();
        for handle in &handles {
            let weak = Rc::downgrade(inner);
            tokens.push(handle.subscribe(Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_change();
                }
            })));
        }
        tracing::trace!(consumer = inner.id, handles = handles.len(), "subscribed");
    }

    /// Re-render when `loadable` completes, unless index `index` has been
    /// re-bound to a different value by then.
    ///
    /// Repeated watches for the same index and pending identity are ignored.
    /// The watch holds only the pending identity, never the value itself.
    pub(crate) fn watch_completion(&self, index: usize, loadable: &Loadable<V::Output>) {
        let inner = &self.inner;
        if inner.disposed.get() || !loadable.is_loading() {
            return;
        }
        let pending = loadable.id();
        if inner.watches.borrow().contains_key(&(index, pending)) {
            return;
        }
        let weak = Rc::downgrade(inner);
        let token = loadable.on_done(move || {
            let Some(inner) = weak.upgrade() else { return };
            let fired = inner.watches.borrow_mut().remove(&(index, pending));
            drop(fired);
            if inner.bound_pending(index) == Some(pending) {
                inner.escalate();
            } else {
                tracing::trace!(consumer = inner.id, index, %pending, "stale completion ignored");
            }
        });
        inner.watches.borrow_mut().insert((index, pending), token);
    }

    /// Release every subscription and parked render. Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.replace(true) {
            return;
        }
        let handles = std::mem::take(&mut *inner.tokens.borrow_mut()).len();
        let watches = std::mem::take(&mut *inner.watches.borrow_mut()).len();
        let released = handles + watches;
        if let Some(scope) = &inner.freeze {
            scope.forget(inner.gated.id());
        }
        tracing::debug!(consumer = inner.id, released, "consumer disposed");
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    #[must_use]
    pub fn policy(&self) -> ChangePolicy {
        self.inner.policy
    }

    /// The enclosing scope this context escalates through.
    #[must_use]
    pub fn freeze_scope(&self) -> Option<&FreezeScope> {
        self.inner.freeze.as_ref()
    }

    /// Number of completed read cycles.
    #[must_use]
    pub fn render_count(&self) -> u64 {
        self.inner.renders.get()
    }

    /// Number of live subscription tokens (handles plus completion watches).
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.tokens.borrow().len() + self.inner.watches.borrow().len()
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    #[must_use]
    pub fn prev_values(&self) -> Vec<V> {
        self.inner.prev_values.borrow().clone()
    }

    #[must_use]
    pub fn next_values(&self) -> Vec<V> {
        self.inner.next_values.borrow().clone()
    }
}

impl<V: StateValue> Drop for SubscriptionContext<V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<V: StateValue> fmt::Debug for SubscriptionContext<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionContext")
            .field("id", &self.inner.id)
            .field("policy", &self.inner.policy)
            .field("renders", &self.inner.renders.get())
            .field("handles", &self.handle_count())
            .field("subscriptions", &self.subscription_count())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::StateItem;
    use crate::loadable;
    use crate::observable::Observable;
    use crate::pending::Pending;
    use crate::scheduler;
    use crate::state::MaybePending;

    fn counting_trigger() -> (RerenderTrigger, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        (RerenderTrigger::new(move || c.set(c.get() + 1)), count)
    }

    fn read_plain(ctx: &SubscriptionContext<i32>, input: &StateInput<i32>) -> Reading<i32> {
        ctx.read(input, |value, _| *value).expect("valid input")
    }

    fn read_watching(
        ctx: &SubscriptionContext<MaybePending<i32>>,
        input: &StateInput<MaybePending<i32>>,
    ) {
        ctx.read(input, |value, index| {
            if let MaybePending::Pending(pending) = value {
                ctx.watch_completion(index, &Loadable::wrap(pending));
            }
        })
        .expect("valid input");
    }

    #[test]
    fn single_input_reads_a_scalar() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let obs = Observable::new(4);
        assert_eq!(read_plain(&ctx, &(&obs).into()), Reading::One(4));
    }

    #[test]
    fn sequence_input_keeps_length_and_order() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let a = Observable::new(1);
        let b = Observable::new(2);
        let input = StateInput::sequence([StateItem::from(&b), StateItem::from(&a)]);
        assert_eq!(read_plain(&ctx, &input), Reading::Many(vec![2, 1]));
    }

    #[test]
    fn invalid_input_reads_and_subscribes_nothing() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::<i32>::new(trigger, None);
        assert!(ctx.read(&StateInput::Sequence(Vec::new()), |v, _| *v).is_err());
        assert_eq!(ctx.render_count(), 0);
        assert_eq!(ctx.subscription_count(), 0);
    }

    #[test]
    fn prev_values_lag_next_values_by_one_render() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let obs = Observable::new(1);
        let input = StateInput::from(&obs);

        read_plain(&ctx, &input);
        assert_eq!(ctx.prev_values(), vec![1]);
        assert_eq!(ctx.next_values(), vec![1]);

        obs.set(2);
        read_plain(&ctx, &input);
        assert_eq!(ctx.prev_values(), vec![1]);
        assert_eq!(ctx.next_values(), vec![2]);
    }

    #[test]
    fn subscribes_once_across_renders() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let obs = Observable::new(1);
        let input = StateInput::from(&obs);
        read_plain(&ctx, &input);
        read_plain(&ctx, &input);
        read_plain(&ctx, &input);
        assert_eq!(obs.subscriber_count(), 1);
        assert_eq!(ctx.render_count(), 3);
    }

    #[test]
    fn compare_policy_ignores_notifications_without_change() {
        let (trigger, count) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let obs = Observable::new(1);
        read_plain(&ctx, &(&obs).into());

        obs.notify();
        assert_eq!(count.get(), 0);
        obs.set(2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn unconditional_policy_escalates_every_notification() {
        let (trigger, count) = counting_trigger();
        let config = BindingConfig::default().with_change_policy(ChangePolicy::Unconditional);
        let ctx = SubscriptionContext::with_config(trigger, None, &config);
        let obs = Observable::new(1);
        read_plain(&ctx, &(&obs).into());

        obs.notify();
        obs.notify();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn frozen_scope_parks_the_render() {
        let scope = FreezeScope::root();
        scope.set_frozen(true);
        let (trigger, count) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, Some(&scope));
        let obs = Observable::new(1);
        read_plain(&ctx, &(&obs).into());

        obs.set(2);
        obs.set(3);
        assert_eq!(count.get(), 0);
        assert_eq!(scope.pending_rerenders(), 1);

        scope.set_frozen(false);
        scheduler::run_until_idle().expect("idle");
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn dispose_releases_subscriptions_and_parked_renders() {
        let scope = FreezeScope::root();
        scope.set_frozen(true);
        let (trigger, count) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, Some(&scope));
        let obs = Observable::new(1);
        read_plain(&ctx, &(&obs).into());
        obs.set(2);
        assert_eq!(scope.pending_rerenders(), 1);

        ctx.dispose();
        assert_eq!(obs.subscriber_count(), 0);
        assert_eq!(scope.pending_rerenders(), 0);
        scope.set_frozen(false);
        scheduler::run_until_idle().expect("idle");
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn drop_disposes() {
        let (trigger, _) = counting_trigger();
        let obs = Observable::new(1);
        {
            let ctx = SubscriptionContext::new(trigger, None);
            read_plain(&ctx, &(&obs).into());
            assert_eq!(obs.subscriber_count(), 1);
        }
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[test]
    fn stale_completion_does_not_escalate() {
        let (trigger, count) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let (first, first_resolver) = Pending::<i32>::new();
        let obs = Observable::new(MaybePending::Pending(first.clone()));
        let input = StateInput::from(&obs);

        read_watching(&ctx, &input);

        // Move index 0 on to a ready value before the first value settles.
        obs.set(MaybePending::Ready(7));
        let escalations_from_set = count.get();
        ctx.read(&input, |_, _| ()).expect("valid input");

        first_resolver.resolve(1);
        scheduler::run_until_idle().expect("idle");
        assert_eq!(count.get(), escalations_from_set);
    }

    #[test]
    fn current_completion_escalates_once() {
        let (trigger, count) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let (pending, resolver) = Pending::<i32>::new();
        let obs = Observable::new(MaybePending::Pending(pending));
        let input = StateInput::from(&obs);

        read_watching(&ctx, &input);
        read_watching(&ctx, &input);
        assert_eq!(ctx.subscription_count(), 2, "one handle + one deduplicated watch");

        resolver.resolve(5);
        assert_eq!(count.get(), 0, "dispatch waits for the turn boundary");
        scheduler::run_until_idle().expect("idle");
        assert_eq!(count.get(), 1);
        assert_eq!(ctx.subscription_count(), 1, "the watch is released once it fires");
    }

    #[test]
    fn rebinding_keeps_one_watch_per_index() {
        let (trigger, _) = counting_trigger();
        let ctx = SubscriptionContext::new(trigger, None);
        let (first, _first_resolver) = Pending::<i32>::new();
        let obs = Observable::new(MaybePending::Pending(first));
        let input = StateInput::from(&obs);
        read_watching(&ctx, &input);
        let registry_before = loadable::registry_len();

        let mut unresolved = Vec::new();
        for round in 0..200 {
            let (pending, resolver) = Pending::<i32>::new();
            obs.set(MaybePending::Pending(pending));
            read_watching(&ctx, &input);
            assert_eq!(ctx.subscription_count(), 2, "one handle + the current watch");

            if round % 2 == 0 {
                resolver.resolve(round);
                scheduler::run_until_idle().expect("idle");
                assert_eq!(ctx.subscription_count(), 1);
            } else {
                unresolved.push(resolver);
            }
        }

        // Only the value bound now is still referenced; superseded ones are freed.
        let (current, superseded) = unresolved.split_last().expect("non-empty");
        assert!(current.is_observed());
        assert!(superseded.iter().all(|resolver| !resolver.is_observed()));
        assert!(loadable::registry_len() <= registry_before + 1);
    }

    #[test]
    fn reading_helpers() {
        let one = Reading::One(Some(1));
        assert_eq!(one.clone().transpose(), Some(Reading::One(1)));
        let many = Reading::Many(vec![Some(1), None]);
        assert_eq!(many.transpose(), None);
        let shaped = Reading::Many(vec![1, 2, 3]).map(|v| v * 2);
        assert_eq!(shaped.as_slice(), &[2, 4, 6]);
        assert!(shaped.is_multiple());
        assert_eq!(Reading::One(5).into_many(), vec![5]);
        assert_eq!(Reading::Many(vec![5]).into_one(), None);
    }
}
