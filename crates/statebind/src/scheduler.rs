#![forbid(unsafe_code)]

//! Cooperative end-of-turn task queue.
//!
//! Everything in this crate runs on a single thread. Work that must happen
//! "after the current render pass" (debounced freeze flushes, loadable
//! completion dispatch, host re-renders in the harness) is queued with
//! [`defer`] and executed when the host closes the turn with [`end_turn`].
//!
//! # Turns
//!
//! A turn is one drain of the queue. [`end_turn`] snapshots the tasks that
//! were queued before it started, bumps the turn counter, and runs them in
//! FIFO order. Tasks deferred while the drain is running land in the next
//! turn, which is what makes a flush atomic relative to triggers it causes.
//!
//! # Invariants
//!
//! 1. Tasks run at most once, in the order they were deferred.
//! 2. A cancelled task never runs.
//! 3. [`current_turn`] is monotonic and increments once per top-level
//!    [`end_turn`] call, even when the queue was empty.
//! 4. Nested [`end_turn`] calls from inside a task are ignored.
//! 5. A task that panics does not wedge the queue: the tasks behind it stay
//!    queued and the next [`end_turn`] runs them.
//!
//! The queue is thread-local; each thread (and therefore each test) has its
//! own independent scheduler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::config::DEFAULT_IDLE_TURN_LIMIT;

type Task = Box<dyn FnOnce()>;

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
}

struct Scheduler {
    turn: Cell<u64>,
    next_id: Cell<u64>,
    queue: RefCell<VecDeque<(u64, Task)>>,
    draining: RefCell<VecDeque<(u64, Task)>>,
    in_drain: Cell<bool>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            turn: Cell::new(0),
            next_id: Cell::new(1),
            queue: RefCell::new(VecDeque::new()),
            draining: RefCell::new(VecDeque::new()),
            in_drain: Cell::new(false),
        }
    }

    fn push(&self, task: Task) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.queue.borrow_mut().push_back((id, task));
        id
    }

    fn cancel(&self, id: u64) -> bool {
        let mut removed = false;
        for list in [&self.queue, &self.draining] {
            let mut list = list.borrow_mut();
            let before = list.len();
            list.retain(|(task_id, _)| *task_id != id);
            removed |= list.len() != before;
        }
        removed
    }

    fn contains(&self, id: u64) -> bool {
        self.queue.borrow().iter().any(|(task_id, _)| *task_id == id)
            || self.draining.borrow().iter().any(|(task_id, _)| *task_id == id)
    }
}

/// Error returned when the queue refuses to go idle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Every drained turn queued more work, up to the configured limit.
    #[error("scheduler still busy after {turns} turns; a task keeps re-deferring itself")]
    Livelock {
        /// Number of turns drained before giving up.
        turns: usize,
    },
}

/// Handle to a task queued with [`defer`].
///
/// Dropping the handle does **not** cancel the task; call
/// [`cancel()`](Self::cancel) explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredTask {
    id: u64,
}

impl DeferredTask {
    /// Remove the task from the queue. Returns `true` if it had not run yet.
    pub fn cancel(&self) -> bool {
        SCHEDULER.with(|s| s.cancel(self.id))
    }

    /// Whether the task is still waiting to run.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        SCHEDULER.with(|s| s.contains(self.id))
    }
}

/// Queue `task` to run when the current turn ends.
pub fn defer(task: impl FnOnce() + 'static) -> DeferredTask {
    let id = SCHEDULER.with(|s| s.push(Box::new(task)));
    DeferredTask { id }
}

/// Number of the turn currently accepting deferred work.
#[must_use]
pub fn current_turn() -> u64 {
    SCHEDULER.with(|s| s.turn.get())
}

/// Number of tasks waiting for the next [`end_turn`].
#[must_use]
pub fn pending_tasks() -> usize {
    SCHEDULER.with(|s| s.queue.borrow().len())
}

/// Whether no task is queued.
#[must_use]
pub fn is_idle() -> bool {
    pending_tasks() == 0
}

/// Close the current turn: run every task queued before this call.
///
/// Returns the number of tasks executed. Tasks deferred while draining are
/// left for the next turn.
pub fn end_turn() -> usize {
    SCHEDULER.with(|s| {
        if s.in_drain.replace(true) {
            return 0;
        }
        {
            let batch = std::mem::take(&mut *s.queue.borrow_mut());
            *s.draining.borrow_mut() = batch;
        }
        s.turn.set(s.turn.get() + 1);

        let _guard = DrainGuard(s);
        let mut ran = 0;
        loop {
            let next = s.draining.borrow_mut().pop_front();
            let Some((_, task)) = next else { break };
            task();
            ran += 1;
        }
        tracing::trace!(turn = s.turn.get(), ran, "turn drained");
        ran
    })
}

/// Leaves the scheduler usable when a task unwinds out of [`end_turn`].
///
/// Tasks that had not run yet go back to the front of the queue, ahead of
/// anything deferred during the interrupted drain.
struct DrainGuard<'a>(&'a Scheduler);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let leftover = std::mem::take(&mut *self.0.draining.borrow_mut());
        if !leftover.is_empty() {
            let mut queue = self.0.queue.borrow_mut();
            let deferred = std::mem::replace(&mut *queue, leftover);
            queue.extend(deferred);
        }
        self.0.in_drain.set(false);
    }
}

/// Drain turns until the queue is empty, using the default turn limit.
///
/// # Errors
///
/// [`SchedulerError::Livelock`] if the queue is still non-empty after
/// [`DEFAULT_IDLE_TURN_LIMIT`] turns.
pub fn run_until_idle() -> Result<usize, SchedulerError> {
    run_until_idle_with_limit(DEFAULT_IDLE_TURN_LIMIT)
}

/// Drain turns until the queue is empty, giving up after `limit` turns.
///
/// Returns the total number of tasks executed.
///
/// # Errors
///
/// [`SchedulerError::Livelock`] when the limit is hit with work remaining.
pub fn run_until_idle_with_limit(limit: usize) -> Result<usize, SchedulerError> {
    let mut total = 0;
    for _ in 0..limit {
        if is_idle() {
            return Ok(total);
        }
        total += end_turn();
    }
    if is_idle() {
        Ok(total)
    } else {
        tracing::warn!(limit, "scheduler livelock");
        Err(SchedulerError::Livelock { turns: limit })
    }
}
