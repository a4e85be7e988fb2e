#![forbid(unsafe_code)]

//! Classification of caller-supplied state inputs.
//!
//! Readers accept one of three explicitly tagged shapes:
//!
//! - [`StateInput::Single`]: one handle; the reader returns a scalar.
//! - [`StateInput::Pair`]: a `(snapshot, handle)` pair as returned by
//!   [`Observable::pair`](crate::Observable::pair); the snapshot is ignored
//!   and the handle is read fresh. The reader returns a scalar.
//! - [`StateInput::Sequence`]: an ordered list of handles and/or pairs; the
//!   reader returns a list of the same length and order.
//!
//! [`normalize`] flattens any of these into a [`NormalizedInput`]. It is the
//! only place where input shape is validated.

use crate::error::InvalidInputError;
use crate::state::{StateRef, StateValue};

/// One element of a [`StateInput::Sequence`].
pub enum StateItem<V: StateValue> {
    Handle(StateRef<V>),
    Pair(V, StateRef<V>),
}

impl<V: StateValue> StateItem<V> {
    fn handle(&self) -> &StateRef<V> {
        match self {
            Self::Handle(handle) | Self::Pair(_, handle) => handle,
        }
    }
}

impl<V: StateValue> Clone for StateItem<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Handle(handle) => Self::Handle(handle.clone()),
            Self::Pair(value, handle) => Self::Pair(value.clone(), handle.clone()),
        }
    }
}

impl<V: StateValue> From<StateRef<V>> for StateItem<V> {
    fn from(handle: StateRef<V>) -> Self {
        Self::Handle(handle)
    }
}

impl<V: StateValue> From<(V, StateRef<V>)> for StateItem<V> {
    fn from((value, handle): (V, StateRef<V>)) -> Self {
        Self::Pair(value, handle)
    }
}

/// What a caller hands to `use_value` / `use_loadable`.
pub enum StateInput<V: StateValue> {
    Single(StateRef<V>),
    Pair(V, StateRef<V>),
    Sequence(Vec<StateItem<V>>),
}

impl<V: StateValue> StateInput<V> {
    /// Build a sequence input from anything convertible to items.
    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<StateItem<V>>,
    {
        Self::Sequence(items.into_iter().map(Into::into).collect())
    }
}

impl<V: StateValue> Clone for StateInput<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(handle) => Self::Single(handle.clone()),
            Self::Pair(value, handle) => Self::Pair(value.clone(), handle.clone()),
            Self::Sequence(items) => Self::Sequence(items.clone()),
        }
    }
}

impl<V: StateValue> From<StateRef<V>> for StateInput<V> {
    fn from(handle: StateRef<V>) -> Self {
        Self::Single(handle)
    }
}

impl<V: StateValue> From<(V, StateRef<V>)> for StateInput<V> {
    fn from((value, handle): (V, StateRef<V>)) -> Self {
        Self::Pair(value, handle)
    }
}

impl<V: StateValue> From<Vec<StateItem<V>>> for StateInput<V> {
    fn from(items: Vec<StateItem<V>>) -> Self {
        Self::Sequence(items)
    }
}

impl<V: StateValue> From<Vec<StateRef<V>>> for StateInput<V> {
    fn from(handles: Vec<StateRef<V>>) -> Self {
        Self::sequence(handles)
    }
}

/// Uniform view of a validated input.
pub struct NormalizedInput<V: StateValue> {
    /// `false` means exactly one handle and a scalar result.
    pub is_multiple: bool,
    /// Never empty.
    pub handles: Vec<StateRef<V>>,
}

impl<V: StateValue> std::fmt::Debug for NormalizedInput<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizedInput")
            .field("is_multiple", &self.is_multiple)
            .field("handles", &self.handles.len())
            .finish()
    }
}

/// Classify `input` into an ordered handle list.
///
/// # Errors
///
/// [`InvalidInputError`] for an empty sequence, which has no handle to
/// track and no meaningful scalar/sequence result.
pub fn normalize<V: StateValue>(
    input: &StateInput<V>,
) -> Result<NormalizedInput<V>, InvalidInputError> {
    match input {
        StateInput::Single(handle) | StateInput::Pair(_, handle) => Ok(NormalizedInput {
            is_multiple: false,
            handles: vec![handle.clone()],
        }),
        StateInput::Sequence(items) if items.is_empty() => {
            Err(InvalidInputError::new("empty sequence"))
        }
        StateInput::Sequence(items) => Ok(NormalizedInput {
            is_multiple: true,
            handles: items.iter().map(|item| item.handle().clone()).collect(),
        }),
    }
}
