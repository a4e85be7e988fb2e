#![forbid(unsafe_code)]

//! The consumer-facing read operations.
//!
//! Both readers run one read cycle on the consumer's
//! [`SubscriptionContext`] and return a [`Reading`] shaped like the input.
//!
//! - [`use_value`] unwraps everything. Pending values that are still
//!   loading make the whole read fail with [`ReadError::Suspended`]; values
//!   that settled with a failure fail it with [`ReadError::Value`].
//! - [`use_loadable`] never unwraps and never fails for value errors. It
//!   returns a [`LoadState`] per handle and re-renders the consumer when a
//!   loading value it observed completes.
//!
//! # Precedence
//!
//! `use_value` reads every handle before deciding. A failed value wins over
//! suspension: if any value settled with a failure, the first such failure
//! (by index) is returned even if other values are still loading.

use std::rc::Rc;

use crate::context::{Reading, SubscriptionContext};
use crate::error::{PropagatedValueError, ReadError};
use crate::input::StateInput;
use crate::loadable::{Completion, LoadState, Loadable};
use crate::state::{MaybePending, StateValue};
use crate::suspense::SuspensionSignal;

/// Read resolved values.
///
/// # Errors
///
/// - [`ReadError::InvalidInput`] for a malformed input.
/// - [`ReadError::Value`] when a tracked value settled with a failure.
/// - [`ReadError::Suspended`] when any tracked value is still loading; the
///   signal completes once all of them have settled.
pub fn use_value<V: StateValue>(
    ctx: &SubscriptionContext<V>,
    input: &StateInput<V>,
) -> Result<Reading<V::Output>, ReadError> {
    let mut waits: Vec<Rc<dyn Completion>> = Vec::new();
    let mut failed: Option<PropagatedValueError> = None;

    let reading = ctx.read(input, |value, index| match value.classify() {
        MaybePending::Ready(value) => Some(value),
        MaybePending::Pending(pending) => {
            let loadable = Loadable::wrap(&pending);
            match loadable.state() {
                LoadState::HasValue(value) => Some(value),
                LoadState::HasError(failure) => {
                    failed.get_or_insert_with(|| PropagatedValueError::new(index, failure));
                    None
                }
                LoadState::Loading => {
                    waits.push(Rc::new(loadable));
                    None
                }
            }
        }
    })?;

    if let Some(error) = failed {
        tracing::debug!(consumer = ctx.id(), index = error.index(), "tracked value failed");
        return Err(ReadError::Value(error));
    }
    match reading.transpose() {
        Some(values) => Ok(values),
        None => {
            let signal = SuspensionSignal::new(waits);
            tracing::debug!(consumer = ctx.id(), waiting = signal.len(), "read suspended");
            Err(ReadError::Suspended(signal))
        }
    }
}

/// Read tri-state snapshots.
///
/// # Errors
///
/// Only [`ReadError::InvalidInput`]; value failures come back as
/// [`LoadState::HasError`].
pub fn use_loadable<V: StateValue>(
    ctx: &SubscriptionContext<V>,
    input: &StateInput<V>,
) -> Result<Reading<LoadState<V::Output>>, ReadError> {
    let reading = ctx.read(input, |value, index| match value.classify() {
        MaybePending::Ready(value) => LoadState::HasValue(value),
        MaybePending::Pending(pending) => {
            let loadable = Loadable::wrap(&pending);
            if loadable.is_loading() {
                ctx.watch_completion(index, &loadable);
            }
            loadable.state()
        }
    })?;
    Ok(reading)
}

impl<V: StateValue> SubscriptionContext<V> {
    /// Method form of [`use_value`].
    ///
    /// # Errors
    ///
    /// See [`use_value`].
    pub fn use_value(&self, input: &StateInput<V>) -> Result<Reading<V::Output>, ReadError> {
        use_value(self, input)
    }

    /// Method form of [`use_loadable`].
    ///
    /// # Errors
    ///
    /// See [`use_loadable`].
    pub fn use_loadable(
        &self,
        input: &StateInput<V>,
    ) -> Result<Reading<LoadState<V::Output>>, ReadError> {
        use_loadable(self, input)
    }
}
