//! Wait Queue
//!
//! The blocking primitive everything else in the IPC core sleeps on.
//!
//! A wait queue keeps an ordered list of sleeping threads and a count of
//! *missed* wakeups: a wakeup issued while nobody sleeps is recorded and the
//! next `sleep` consumes it and returns immediately. This closes the window
//! between a receiver finding its mailbox empty and actually going to sleep.
//!
//! ```text
//! WaitQueue
//!   ├─ missed:   2
//!   ├─ ignored:  0
//!   └─ sleepers: [T3] → [T7]     (oldest first)
//! ```
//!
//! Lock order: a mailbox lock may be held while taking a wait queue lock,
//! never the reverse.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::trace;
use spin::{Mutex, MutexGuard};

use crate::scheduler::{Thread, ThreadContext, ThreadState};

bitflags! {
    /// Sleep behaviour modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u32 {
        /// The sleep may be cut short by [`Thread::interrupt`] or a poke
        const INTERRUPTIBLE = 1 << 0;
        /// Never block, only consume a missed wakeup if there is one
        const NON_BLOCKING = 1 << 1;
    }
}

/// How a sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepResult {
    Woken,
    TimedOut,
    Interrupted,
}

/// Wakeup fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupMode {
    /// Wake the oldest sleeper
    One,
    /// Wake every sleeper
    All,
}

#[derive(Debug)]
struct Sleeper {
    thread: Arc<Thread>,
    interruptible: bool,
}

#[derive(Debug, Default)]
struct WaitQueueInner {
    /// Wakeups issued with no sleeper present
    missed: usize,
    /// Timeouts and interruptions that lost the race against a wakeup
    ignored: usize,
    sleepers: VecDeque<Sleeper>,
}

/// Blocking/wakeup primitive with missed-wakeup accounting
#[derive(Debug, Default)]
pub struct WaitQueue {
    inner: Mutex<WaitQueueInner>,
}

/// Locked wait queue, for callers that must wake from inside a larger
/// critical section
pub struct WaitQueueGuard<'a> {
    inner: MutexGuard<'a, WaitQueueInner>,
}

impl WaitQueueGuard<'_> {
    /// Wake sleepers without re-acquiring the queue lock
    pub fn wakeup(&mut self, mode: WakeupMode) {
        wakeup_locked(&mut self.inner, mode);
    }

    /// Withdraw one recorded missed wakeup, if any
    ///
    /// Used when the event a wakeup announced has been taken back before
    /// anyone consumed it.
    pub fn retract(&mut self) {
        self.inner.missed = self.inner.missed.saturating_sub(1);
    }
}

fn wakeup_locked(inner: &mut WaitQueueInner, mode: WakeupMode) {
    match mode {
        WakeupMode::One => match inner.sleepers.pop_front() {
            Some(sleeper) => sleeper.thread.resume(ThreadState::Woken),
            None => inner.missed += 1,
        },
        WakeupMode::All => {
            if inner.sleepers.is_empty() {
                inner.missed += 1;
            }
            while let Some(sleeper) = inner.sleepers.pop_front() {
                sleeper.thread.resume(ThreadState::Woken);
            }
        }
    }
}

impl WaitQueue {
    /// Create an empty wait queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the queue for use from inside another critical section
    pub fn lock(&self) -> WaitQueueGuard<'_> {
        WaitQueueGuard { inner: self.inner.lock() }
    }

    /// Put the calling thread to sleep
    ///
    /// `timeout == Some(Duration::ZERO)` (or [`SleepFlags::NON_BLOCKING`])
    /// is a poll: it returns `Woken` only if a missed wakeup was pending.
    pub fn sleep(&self, ctx: &ThreadContext, timeout: Option<Duration>, flags: SleepFlags) -> SleepResult {
        let thread = ctx.thread();
        let interruptible = flags.contains(SleepFlags::INTERRUPTIBLE);

        {
            let mut inner = self.inner.lock();
            if inner.missed > 0 {
                inner.missed -= 1;
                return SleepResult::Woken;
            }
            if interruptible && thread.take_interrupt() {
                return SleepResult::Interrupted;
            }
            if flags.contains(SleepFlags::NON_BLOCKING) || timeout == Some(Duration::ZERO) {
                return SleepResult::TimedOut;
            }
            thread.set_state(ThreadState::Sleeping);
            inner.sleepers.push_back(Sleeper {
                thread: Arc::clone(thread),
                interruptible,
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let in_time = ctx.block(deadline);

            if let Some(result) = Self::finish(thread) {
                return result;
            }

            let interrupted = interruptible && thread.interrupt_requested();
            if in_time && !interrupted {
                continue;
            }

            let mut inner = self.inner.lock();
            match thread.state() {
                ThreadState::Sleeping => {
                    inner.sleepers.retain(|s| !Arc::ptr_eq(&s.thread, thread));
                    thread.set_state(ThreadState::Running);
                    if interrupted {
                        thread.take_interrupt();
                        return SleepResult::Interrupted;
                    }
                    return SleepResult::TimedOut;
                }
                _ => {
                    // A waker unlinked us between the check above and the lock.
                    inner.ignored += 1;
                    drop(inner);
                    trace!("thread {}: wakeup beat the timeout", thread.id());
                    if let Some(result) = Self::finish(thread) {
                        return result;
                    }
                }
            }
        }
    }

    fn finish(thread: &Thread) -> Option<SleepResult> {
        let result = match thread.state() {
            ThreadState::Woken => SleepResult::Woken,
            ThreadState::Interrupted => SleepResult::Interrupted,
            _ => return None,
        };
        thread.set_state(ThreadState::Running);
        Some(result)
    }

    /// Wake sleepers, or record a missed wakeup if there are none
    pub fn wakeup(&self, mode: WakeupMode) {
        wakeup_locked(&mut self.inner.lock(), mode);
    }

    /// Interrupt the oldest interruptible sleeper
    ///
    /// Returns `false` if no interruptible thread was sleeping.
    pub fn interrupt_first(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.sleepers.iter().position(|s| s.interruptible) {
            Some(pos) => {
                if let Some(sleeper) = inner.sleepers.remove(pos) {
                    sleeper.thread.resume(ThreadState::Interrupted);
                }
                true
            }
            None => false,
        }
    }

    /// Number of recorded missed wakeups
    pub fn missed_wakeups(&self) -> usize {
        self.inner.lock().missed
    }

    /// Number of timeouts or interruptions that lost against a wakeup
    pub fn ignored_wakeups(&self) -> usize {
        self.inner.lock().ignored
    }

    /// Number of threads currently sleeping
    pub fn sleepers(&self) -> usize {
        self.inner.lock().sleepers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn wait_for_sleepers(wq: &WaitQueue, n: usize) {
        while wq.sleepers() < n {
            thread::yield_now();
        }
    }

    #[test]
    fn missed_wakeup_is_consumed_by_next_sleep() {
        let wq = WaitQueue::new();
        let ctx = ThreadContext::new(1, 1);
        wq.wakeup(WakeupMode::One);
        assert_eq!(wq.missed_wakeups(), 1);
        assert_eq!(wq.sleep(&ctx, None, SleepFlags::empty()), SleepResult::Woken);
        assert_eq!(wq.missed_wakeups(), 0);
    }

    #[test]
    fn zero_timeout_polls() {
        let wq = WaitQueue::new();
        let ctx = ThreadContext::new(1, 1);
        assert_eq!(wq.sleep(&ctx, Some(Duration::ZERO), SleepFlags::empty()), SleepResult::TimedOut);
        assert_eq!(wq.sleep(&ctx, None, SleepFlags::NON_BLOCKING), SleepResult::TimedOut);
        assert_eq!(wq.sleepers(), 0);
    }

    #[test]
    fn timeout_unlinks_sleeper() {
        let wq = WaitQueue::new();
        let ctx = ThreadContext::new(1, 1);
        let result = wq.sleep(&ctx, Some(Duration::from_millis(5)), SleepFlags::empty());
        assert_eq!(result, SleepResult::TimedOut);
        assert_eq!(wq.sleepers(), 0);
        // A later wakeup is recorded, not handed to the departed thread.
        wq.wakeup(WakeupMode::One);
        assert_eq!(wq.missed_wakeups(), 1);
    }

    #[test]
    fn retract_withdraws_missed_wakeup() {
        let wq = WaitQueue::new();
        wq.wakeup(WakeupMode::One);
        {
            let mut guard = wq.lock();
            guard.retract();
            guard.retract();
        }
        assert_eq!(wq.missed_wakeups(), 0);
    }

    #[test]
    fn wakeup_one_hands_off_to_sleeper() {
        let wq = Arc::new(WaitQueue::new());
        let sleeper = {
            let wq = Arc::clone(&wq);
            thread::spawn(move || {
                let ctx = ThreadContext::new(1, 1);
                wq.sleep(&ctx, None, SleepFlags::empty())
            })
        };
        wait_for_sleepers(&wq, 1);
        wq.wakeup(WakeupMode::One);
        assert_eq!(sleeper.join().unwrap(), SleepResult::Woken);
        assert_eq!(wq.missed_wakeups(), 0);
    }

    #[test]
    fn wakeup_all_releases_everyone() {
        let wq = Arc::new(WaitQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let wq = Arc::clone(&wq);
                thread::spawn(move || {
                    let ctx = ThreadContext::new(i, 1);
                    wq.sleep(&ctx, None, SleepFlags::empty())
                })
            })
            .collect();
        wait_for_sleepers(&wq, 4);
        wq.wakeup(WakeupMode::All);
        for h in handles {
            assert_eq!(h.join().unwrap(), SleepResult::Woken);
        }
    }

    #[test]
    fn interrupt_first_skips_uninterruptible() {
        let wq = Arc::new(WaitQueue::new());
        let plain = {
            let wq = Arc::clone(&wq);
            thread::spawn(move || {
                let ctx = ThreadContext::new(1, 1);
                wq.sleep(&ctx, None, SleepFlags::empty())
            })
        };
        wait_for_sleepers(&wq, 1);
        let poked = {
            let wq = Arc::clone(&wq);
            thread::spawn(move || {
                let ctx = ThreadContext::new(2, 1);
                wq.sleep(&ctx, None, SleepFlags::INTERRUPTIBLE)
            })
        };
        wait_for_sleepers(&wq, 2);
        assert!(wq.interrupt_first());
        assert_eq!(poked.join().unwrap(), SleepResult::Interrupted);
        assert!(!wq.interrupt_first());
        wq.wakeup(WakeupMode::One);
        assert_eq!(plain.join().unwrap(), SleepResult::Woken);
    }

    #[test]
    fn thread_interrupt_cuts_sleep_short() {
        let wq = Arc::new(WaitQueue::new());
        let ctx = ThreadContext::new(1, 1);
        let target = Arc::clone(ctx.thread());
        let sleeper = {
            let wq = Arc::clone(&wq);
            thread::spawn(move || wq.sleep(&ctx, None, SleepFlags::INTERRUPTIBLE))
        };
        wait_for_sleepers(&wq, 1);
        target.interrupt();
        assert_eq!(sleeper.join().unwrap(), SleepResult::Interrupted);
        assert_eq!(wq.sleepers(), 0);
    }
}
