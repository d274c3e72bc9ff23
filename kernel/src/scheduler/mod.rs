//! Scheduler boundary - thread blocking and wakeup
//!
//! The IPC core never schedules anything itself. It only needs to suspend
//! the current thread and later make it runnable again from another CPU.
//! This module is that boundary: every kernel thread is represented by a
//! [`Thread`] (shared, visible to wakers) and a [`ThreadContext`] (owned by
//! the thread itself, used to block).
//!
//! ## Thread States
//!
//! - **Running**: executing, not on any wait queue
//! - **Sleeping**: linked on exactly one wait queue
//! - **Woken**: removed from its wait queue by a wakeup, not yet resumed
//! - **Interrupted**: removed from its wait queue by an interruption
//!
//! The Sleeping -> Woken/Interrupted transition is made only by the party
//! that unlinks the thread, and only while holding that wait queue's lock.
//! Blocking is backed by `crossbeam`'s parker, so a wakeup issued before the
//! thread actually parks is never lost.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::sync::{Parker, Unparker};

use crate::task::TaskId;

/// Kernel-wide thread identifier
pub type ThreadId = u64;

/// Thread scheduling state as seen by wait queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Sleeping = 1,
    Woken = 2,
    Interrupted = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ThreadState::Sleeping,
            2 => ThreadState::Woken,
            3 => ThreadState::Interrupted,
            _ => ThreadState::Running,
        }
    }
}

/// Shared half of a kernel thread
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    task: TaskId,
    state: AtomicU8,
    /// Interruption requested while not linked on a queue
    interrupt_pending: AtomicBool,
    unparker: Unparker,
}

impl Thread {
    /// Thread identifier
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning task
    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Make a sleeping thread runnable with the given outcome
    ///
    /// Caller must hold the lock of the wait queue the thread was linked on
    /// and must already have unlinked it.
    pub(crate) fn resume(&self, outcome: ThreadState) {
        debug_assert!(matches!(outcome, ThreadState::Woken | ThreadState::Interrupted));
        self.set_state(outcome);
        self.unparker.unpark();
    }

    /// Request interruption of this thread's current or next interruptible sleep
    pub fn interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupt_pending.load(Ordering::Acquire)
    }
}

/// Owned half of a kernel thread, required to block
pub struct ThreadContext {
    thread: Arc<Thread>,
    parker: Parker,
}

impl ThreadContext {
    /// Create a new thread belonging to `task`
    pub fn new(id: ThreadId, task: TaskId) -> Self {
        let parker = Parker::new();
        let thread = Arc::new(Thread {
            id,
            task,
            state: AtomicU8::new(ThreadState::Running as u8),
            interrupt_pending: AtomicBool::new(false),
            unparker: parker.unparker().clone(),
        });
        Self { thread, parker }
    }

    /// Shared handle other CPUs use to wake this thread
    #[inline]
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Block until unparked or the deadline passes
    ///
    /// Returns `false` once the deadline has passed. Spurious returns are
    /// possible; callers re-check their own condition.
    pub(crate) fn block(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.parker.park();
                true
            }
            Some(deadline) => {
                self.parker.park_deadline(deadline);
                Instant::now() < deadline
            }
        }
    }
}

impl core::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadContext").field("thread", &self.thread).finish()
    }
}
