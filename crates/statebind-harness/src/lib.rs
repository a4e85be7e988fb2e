#![forbid(unsafe_code)]

//! Deterministic host runtime for exercising `statebind` end to end.
//!
//! A [`Component`] stands in for a UI component: it owns a
//! [`SubscriptionContext`], a render closure, and a record of what each
//! render produced. The harness plays the host runtime's part:
//!
//! - Re-render triggers are coalesced per turn. Any number of triggers
//!   before [`settle`] (or [`scheduler::end_turn`]) produce one render.
//! - A render that fails with [`ReadError::Suspended`] is retried once the
//!   suspension signal settles, mirroring a suspense boundary.
//! - Value and input errors are recorded, not retried.
//!
//! Nothing here runs on its own; tests drive time explicitly with
//! [`settle`].
//!
//! # Example
//!
//! ```
//! use statebind::{Observable, StateInput};
//! use statebind_harness::{Component, settle};
//!
//! let count = Observable::new(0);
//! let input = StateInput::from(&count);
//! let view = Component::mount(move |ctx| ctx.use_value(&input));
//!
//! count.set(1);
//! count.set(2);
//! settle().unwrap();
//! assert_eq!(view.render_count(), 2);
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use statebind::scheduler;
use statebind::{
    BindingConfig, FreezeScope, ReadError, RerenderTrigger, SchedulerError, StateValue,
    Subscription, SubscriptionContext,
};

type RenderFn<V, R> = Box<dyn FnMut(&SubscriptionContext<V>) -> Result<R, ReadError>>;

/// Outcome of the most recent render.
#[derive(Debug, Clone)]
pub enum RenderOutcome<R> {
    Rendered(R),
    Suspended,
    Failed(ReadError),
}

struct ComponentInner<V: StateValue, R> {
    ctx: SubscriptionContext<V>,
    render: RefCell<RenderFn<V, R>>,
    dirty: Cell<bool>,
    mounted: Cell<bool>,
    renders: Cell<u32>,
    history: RefCell<Vec<R>>,
    last: RefCell<Option<RenderOutcome<R>>>,
    suspension: RefCell<Option<Subscription>>,
}

impl<V: StateValue, R: Clone + 'static> ComponentInner<V, R> {
    fn schedule(weak: &Weak<Self>) {
        let Some(inner) = weak.upgrade() else { return };
        if !inner.mounted.get() || inner.dirty.replace(true) {
            return;
        }
        let weak = weak.clone();
        scheduler::defer(move || {
            if let Some(inner) = weak.upgrade() {
                Self::run(&inner);
            }
        });
    }

    fn run(this: &Rc<Self>) {
        this.dirty.set(false);
        if !this.mounted.get() {
            return;
        }
        this.renders.set(this.renders.get() + 1);
        let result = {
            let mut render = this.render.borrow_mut();
            render(&this.ctx)
        };
        let outcome = match result {
            Ok(output) => {
                this.suspension.borrow_mut().take();
                this.history.borrow_mut().push(output.clone());
                RenderOutcome::Rendered(output)
            }
            Err(ReadError::Suspended(signal)) => {
                tracing::debug!(consumer = this.ctx.id(), %signal, "component suspended");
                let weak = Rc::downgrade(this);
                let token = signal.on_settled(move || Self::schedule(&weak));
                *this.suspension.borrow_mut() = Some(token);
                RenderOutcome::Suspended
            }
            Err(error) => {
                tracing::debug!(consumer = this.ctx.id(), %error, "component render failed");
                this.suspension.borrow_mut().take();
                RenderOutcome::Failed(error)
            }
        };
        *this.last.borrow_mut() = Some(outcome);
    }
}

/// A mounted consumer driven by the harness.
pub struct Component<V: StateValue, R> {
    inner: Rc<ComponentInner<V, R>>,
}

impl<V: StateValue, R: Clone + 'static> Component<V, R> {
    /// Mount outside any freeze scope with the default configuration.
    ///
    /// The first render runs synchronously.
    pub fn mount(render: impl FnMut(&SubscriptionContext<V>) -> Result<R, ReadError> + 'static) -> Self {
        Self::mount_in(None, &BindingConfig::default(), render)
    }

    /// Mount under `scope` with `config`.
    pub fn mount_in(
        scope: Option<&FreezeScope>,
        config: &BindingConfig,
        render: impl FnMut(&SubscriptionContext<V>) -> Result<R, ReadError> + 'static,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ComponentInner<V, R>>| {
            let weak = weak.clone();
            let trigger = RerenderTrigger::new(move || ComponentInner::schedule(&weak));
            ComponentInner {
                ctx: SubscriptionContext::with_config(trigger, scope, config),
                render: RefCell::new(Box::new(render)),
                dirty: Cell::new(false),
                mounted: Cell::new(true),
                renders: Cell::new(0),
                history: RefCell::new(Vec::new()),
                last: RefCell::new(None),
                suspension: RefCell::new(None),
            }
        });
        ComponentInner::run(&inner);
        Self { inner }
    }

    /// Ask for a render at the end of the turn, as a parent re-render would.
    pub fn request_render(&self) {
        ComponentInner::schedule(&Rc::downgrade(&self.inner));
    }

    /// Number of times the render closure ran.
    #[must_use]
    pub fn render_count(&self) -> u32 {
        self.inner.renders.get()
    }

    /// Output of the latest successful render.
    #[must_use]
    pub fn latest(&self) -> Option<R> {
        self.inner.history.borrow().last().cloned()
    }

    /// Outputs of every successful render, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<R> {
        self.inner.history.borrow().clone()
    }

    #[must_use]
    pub fn last_outcome(&self) -> Option<RenderOutcome<R>> {
        self.inner.last.borrow().clone()
    }

    /// The error of the latest render, if it failed.
    #[must_use]
    pub fn last_error(&self) -> Option<ReadError> {
        match &*self.inner.last.borrow() {
            Some(RenderOutcome::Failed(error)) => Some(error.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(&*self.inner.last.borrow(), Some(RenderOutcome::Suspended))
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.get()
    }

    /// The component's subscription context.
    #[must_use]
    pub fn context(&self) -> &SubscriptionContext<V> {
        &self.inner.ctx
    }

    /// Remove the component: dispose its context and drop any pending
    /// suspension retry. Idempotent.
    pub fn unmount(&self) {
        if !self.inner.mounted.replace(false) {
            return;
        }
        self.inner.suspension.borrow_mut().take();
        self.inner.ctx.dispose();
    }
}

impl<V: StateValue, R> Drop for Component<V, R> {
    fn drop(&mut self) {
        self.inner.mounted.set(false);
        self.inner.suspension.borrow_mut().take();
        self.inner.ctx.dispose();
    }
}

impl<V: StateValue, R: fmt::Debug> fmt::Debug for Component<V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("renders", &self.inner.renders.get())
            .field("mounted", &self.inner.mounted.get())
            .field("latest", &self.inner.history.borrow().last())
            .finish()
    }
}

/// Drain the scheduler until nothing is queued.
///
/// # Errors
///
/// [`SchedulerError::Livelock`] if work keeps re-queuing itself past the
/// default turn limit.
pub fn settle() -> Result<usize, SchedulerError> {
    scheduler::run_until_idle()
}

/// [`settle`] bounded by `config.idle_turn_limit`.
///
/// # Errors
///
/// [`SchedulerError::Livelock`] when the limit is reached.
pub fn settle_with(config: &BindingConfig) -> Result<usize, SchedulerError> {
    scheduler::run_until_idle_with_limit(config.idle_turn_limit)
}

/// Install a test-writer `fmt` subscriber filtered by `RUST_LOG`
/// (default `statebind=debug`). Safe to call from every test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("statebind=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
