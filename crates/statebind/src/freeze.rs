#![forbid(unsafe_code)]

//! Freeze scopes: subtree-wide suppression and batching of re-renders.
//!
//! A [`FreezeScope`] is a node in a parent-linked tree. While a scope is
//! frozen, consumers beneath it do not re-render; their triggers are parked
//! in the scope's pending set. When the whole ancestor chain is unfrozen
//! again, the scope replays the parked triggers in one flush at the end of
//! the current scheduler turn.
//!
//! # State machine
//!
//! ```text
//!            set_frozen(v) (seed, no dispatch)
//!   Unset ──────────────────────────────────────▶ Some(v)
//!
//!   Some(a) ── set_frozen(a) ──▶ Some(a)   (no-op)
//!   Some(a) ── set_frozen(b) ──▶ Some(b)   (notify subscribers, maybe flush)
//! ```
//!
//! # Invariants
//!
//! 1. `is_frozen() == enabled && (parent is none || parent.is_frozen())`.
//!    An unset scope is not frozen.
//! 2. A scope only flushes when `is_frozen()` is false.
//! 3. Flushes are debounced: any number of requests before the turn ends
//!    produce one flush, which snapshots and clears the pending set and fires
//!    each trigger once. Requests arriving during the flush wait for the
//!    next one.
//! 4. After [`dispose`](FreezeScope::dispose) nothing parked in the scope
//!    ever fires, and the scheduled flush (if any) is cancelled.
//!
//! # Propagation
//!
//! Child scopes subscribe to their parent's flips. When an ancestor flips, a
//! child re-notifies its own subscribers and schedules its own flush if it
//! became effectively unfrozen. The parent link is weak: a scope never keeps
//! its parent alive, and a dropped parent counts as unfrozen.
//!
//! Scopes are passed explicitly as construction parameters; there is no
//! ambient "current scope". The nearest enclosing scope is whatever the
//! caller hands down.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::scheduler::{self, DeferredTask};
use crate::subscription::{ListenerSet, Subscription};
use crate::trigger::RerenderTrigger;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

struct ScopeInner {
    id: u64,
    parent: Option<Weak<ScopeInner>>,
    enabled: Cell<Option<bool>>,
    subscribers: ListenerSet,
    pending: RefCell<Vec<RerenderTrigger>>,
    flush: Cell<Option<DeferredTask>>,
    parent_link: RefCell<Option<Subscription>>,
    disposed: Cell<bool>,
}

impl ScopeInner {
    fn is_frozen(&self) -> bool {
        self.enabled.get().unwrap_or(false)
            && self
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .is_none_or(|parent| parent.is_frozen())
    }

    fn on_parent_flip(this: &Rc<Self>) {
        if this.disposed.get() {
            return;
        }
        tracing::trace!(scope = this.id, frozen = this.is_frozen(), "ancestor flipped");
        this.subscribers.notify();
        Self::schedule_flush(this);
    }

    fn schedule_flush(this: &Rc<Self>) {
        if this.disposed.get() || this.is_frozen() || this.pending.borrow().is_empty() {
            return;
        }
        if this.flush.get().is_some_and(|task| task.is_pending()) {
            return;
        }
        let weak = Rc::downgrade(this);
        let task = scheduler::defer(move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_flush();
            }
        });
        this.flush.set(Some(task));
    }

    fn run_flush(&self) {
        self.flush.set(None);
        if self.disposed.get() || self.is_frozen() {
            return;
        }
        let batch = std::mem::take(&mut *self.pending.borrow_mut());

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!("freeze_flush", scope = self.id, triggers = batch.len())
            .entered();
        tracing::trace!(scope = self.id, triggers = batch.len(), "flushing deferred renders");

        for trigger in batch {
            trigger.fire();
        }
    }
}

/// A node in the freeze tree. Clones share the same node.
#[derive(Clone)]
pub struct FreezeScope {
    inner: Rc<ScopeInner>,
}

impl FreezeScope {
    /// Create a scope under `parent` (or a root scope for `None`).
    ///
    /// The scope starts unset; the first [`set_frozen`](Self::set_frozen)
    /// seeds it.
    #[must_use]
    pub fn new(parent: Option<&FreezeScope>) -> Self {
        let inner = Rc::new(ScopeInner {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: parent.map(|p| Rc::downgrade(&p.inner)),
            enabled: Cell::new(None),
            subscribers: ListenerSet::new(),
            pending: RefCell::new(Vec::new()),
            flush: Cell::new(None),
            parent_link: RefCell::new(None),
            disposed: Cell::new(false),
        });

        if let Some(parent) = parent {
            let weak = Rc::downgrade(&inner);
            let link = parent.subscribe(move || {
                if let Some(inner) = weak.upgrade() {
                    ScopeInner::on_parent_flip(&inner);
                }
            });
            *inner.parent_link.borrow_mut() = Some(link);
        }
        Self { inner }
    }

    #[must_use]
    pub fn root() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn child(&self) -> Self {
        Self::new(Some(self))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Parent scope, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<FreezeScope> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Local flag: `None` until the first `set_frozen`.
    #[must_use]
    pub fn enabled_state(&self) -> Option<bool> {
        self.inner.enabled.get()
    }

    /// Effective frozen-ness across the whole ancestor chain.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.is_frozen()
    }

    /// Set the local flag.
    ///
    /// The first call only seeds the state. Later calls with a different
    /// value notify subscribers synchronously and, when the scope ends up
    /// effectively unfrozen, schedule a flush of parked triggers.
    pub fn set_frozen(&self, frozen: bool) {
        let inner = &self.inner;
        if inner.disposed.get() {
            return;
        }
        match inner.enabled.get() {
            None => {
                inner.enabled.set(Some(frozen));
                tracing::trace!(scope = inner.id, frozen, "freeze scope seeded");
            }
            Some(current) if current == frozen => {}
            Some(_) => {
                inner.enabled.set(Some(frozen));
                tracing::debug!(
                    scope = inner.id,
                    frozen,
                    effective = inner.is_frozen(),
                    subscribers = inner.subscribers.len(),
                    "freeze scope flipped"
                );
                inner.subscribers.notify();
                ScopeInner::schedule_flush(inner);
            }
        }
    }

    /// Listen for flips of this scope or any ancestor.
    pub fn subscribe(&self, listener: impl Fn() + 'static) -> Subscription {
        self.inner.subscribers.subscribe(Rc::new(listener))
    }

    /// Ask for `trigger` to be fired by this scope.
    ///
    /// The trigger is parked (deduplicated by id). If the scope is not
    /// frozen, a flush is scheduled for the end of the turn; otherwise it
    /// waits for the scope and its ancestors to unfreeze.
    pub fn request_rerender(&self, trigger: RerenderTrigger) {
        let inner = &self.inner;
        if inner.disposed.get() {
            return;
        }
        {
            let mut pending = inner.pending.borrow_mut();
            if !pending.iter().any(|t| t.id() == trigger.id()) {
                tracing::trace!(scope = inner.id, trigger = trigger.id(), "render parked");
                pending.push(trigger);
            }
        }
        ScopeInner::schedule_flush(inner);
    }

    /// Drop a parked trigger, e.g. because its consumer went away.
    pub fn forget(&self, trigger_id: u64) {
        self.inner
            .pending
            .borrow_mut()
            .retain(|trigger| trigger.id() != trigger_id);
    }

    /// Number of parked triggers.
    #[must_use]
    pub fn pending_rerenders(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Whether a flush is queued for the end of the turn.
    #[must_use]
    pub fn has_scheduled_flush(&self) -> bool {
        self.inner.flush.get().is_some_and(|task| task.is_pending())
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Release subscribers and parked triggers, cancel any scheduled flush,
    /// and detach from the parent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.replace(true) {
            return;
        }
        if let Some(task) = inner.flush.take() {
            task.cancel();
        }
        let dropped = std::mem::take(&mut *inner.pending.borrow_mut()).len();
        inner.subscribers.clear();
        inner.parent_link.borrow_mut().take();
        tracing::debug!(scope = inner.id, dropped, "freeze scope disposed");
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FreezeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreezeScope")
            .field("id", &self.inner.id)
            .field("enabled", &self.inner.enabled.get())
            .field("frozen", &self.is_frozen())
            .field("pending", &self.pending_rerenders())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Freeze element
// ---------------------------------------------------------------------------

/// The scope-creating element.
///
/// Owns a [`FreezeScope`] created lazily on the first
/// [`render`](Self::render) and disposed when the element is dropped. The
/// parent passed on the first render is the one the scope is linked to.
#[derive(Default)]
pub struct Freeze {
    scope: OnceCell<FreezeScope>,
}

impl Freeze {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render with the given flag, returning the scope to hand to children.
    pub fn render(&self, parent: Option<&FreezeScope>, is_frozen: bool) -> FreezeScope {
        let scope = self.scope.get_or_init(|| FreezeScope::new(parent));
        scope.set_frozen(is_frozen);
        scope.clone()
    }

    /// The scope, if the element has rendered.
    #[must_use]
    pub fn scope(&self) -> Option<&FreezeScope> {
        self.scope.get()
    }
}

impl Drop for Freeze {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.get() {
            scope.dispose();
        }
    }
}

impl fmt::Debug for Freeze {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Freeze").field("scope", &self.scope.get()).finish()
    }
}
