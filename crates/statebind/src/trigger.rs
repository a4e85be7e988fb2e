#![forbid(unsafe_code)]

//! Host re-render trigger.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRIGGER_ID: AtomicU64 = AtomicU64::new(1);

/// A host-provided "please re-render me" callback with a stable identity.
///
/// Freeze scopes deduplicate deferred triggers by [`id`](Self::id), so the
/// same consumer queued twice still renders once per flush.
#[derive(Clone)]
pub struct RerenderTrigger {
    id: u64,
    fire: Rc<dyn Fn()>,
}

impl RerenderTrigger {
    pub fn new(fire: impl Fn() + 'static) -> Self {
        Self {
            id: NEXT_TRIGGER_ID.fetch_add(1, Ordering::Relaxed),
            fire: Rc::new(fire),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fire(&self) {
        (self.fire)();
    }
}

impl fmt::Debug for RerenderTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RerenderTrigger")
            .field("id", &self.id)
            .finish()
    }
}
