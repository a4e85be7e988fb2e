#![forbid(unsafe_code)]

//! Subscription-to-render bridge for observable state handles.
//!
//! `statebind` decides *when* a UI consumer must recompute after the state it
//! reads changes. It does not store state and does not render; a host runtime
//! supplies the re-render trigger and the suspension mechanism, and external
//! state handles supply values.
//!
//! - [`use_value`] / [`use_loadable`]: the consumer-facing reads. They accept
//!   a [`StateInput`] (single handle, `(snapshot, handle)` pair, or a
//!   sequence) and return a [`Reading`] of the same shape.
//! - [`SubscriptionContext`]: per-consumer bookkeeping. Tracks what the last
//!   render read, subscribes once, and filters change notifications.
//! - [`Loadable`]: tri-state snapshot of a [`Pending`] value, memoized per
//!   pending identity.
//! - [`SuspensionSignal`]: the aggregate wait raised when a read hits values
//!   that are still loading.
//! - [`FreezeScope`] / [`Freeze`]: subtree-wide suppression of re-renders,
//!   replayed as one coalesced flush once the ancestor chain unfreezes.
//! - [`scheduler`]: the end-of-turn queue that debounces flushes and
//!   completion dispatch.
//! - [`Observable`]: a reference state handle.
//!
//! # Architecture
//!
//! Everything is single-threaded: shared state lives in `Rc<RefCell<..>>`
//! and the scheduler is thread-local. Listeners are held by their sources
//! and released through RAII [`Subscription`] tokens. Back-references
//! (freeze parents, context callbacks) are `Weak`.
//!
//! # Invariants
//!
//! 1. A sequence input yields a sequence of equal length and order; a single
//!    input yields a scalar.
//! 2. Wrapping the same pending identity twice yields the same [`Loadable`],
//!    and it leaves `Loading` at most once.
//! 3. A value that is already settled when first wrapped dispatches no
//!    completion notification.
//! 4. `scope.is_frozen() == enabled && parent.map_or(true, is_frozen)`, and a
//!    scope only flushes while not frozen.
//! 5. Disposed contexts and scopes never fire a trigger again.
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use statebind::{Observable, Reading, RerenderTrigger, StateInput, SubscriptionContext};
//!
//! let renders = Rc::new(Cell::new(0));
//! let r = Rc::clone(&renders);
//! let ctx = SubscriptionContext::new(RerenderTrigger::new(move || r.set(r.get() + 1)), None);
//!
//! let count = Observable::new(0);
//! let input = StateInput::from(&count);
//! assert_eq!(ctx.use_value(&input).unwrap(), Reading::One(0));
//!
//! count.set(1);
//! assert_eq!(renders.get(), 1);
//! assert_eq!(ctx.use_value(&input).unwrap(), Reading::One(1));
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod freeze;
pub mod input;
pub mod loadable;
pub mod observable;
pub mod pending;
pub mod reader;
pub mod scheduler;
pub mod state;
pub mod subscription;
pub mod suspense;
pub mod trigger;

pub use config::{BindingConfig, ChangePolicy, ConfigError};
pub use context::{Reading, SubscriptionContext};
pub use error::{Failure, InvalidInputError, PropagatedValueError, ReadError};
pub use freeze::{Freeze, FreezeScope};
pub use input::{NormalizedInput, StateInput, StateItem, normalize};
pub use loadable::{LoadState, LoadStatus, Loadable};
pub use observable::Observable;
pub use pending::{Outcome, Pending, PendingId, Resolver};
pub use reader::{use_loadable, use_value};
pub use scheduler::{DeferredTask, SchedulerError};
pub use state::{MaybePending, StateHandle, StateRef, StateValue};
pub use subscription::{Listener, Subscription};
pub use suspense::SuspensionSignal;
pub use trigger::RerenderTrigger;
