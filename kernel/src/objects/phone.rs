//! Connection ("phone") objects
//!
//! A phone is a directed, revocable link from a calling task to a target
//! mailbox. The target is held as a generation-checked [`MailboxRef`]: the
//! mailbox may be destroyed first, after which calls through the phone fail
//! with [`IpcError::HungUp`](crate::error::IpcError::HungUp).
//!
//! ## States
//!
//! ```text
//! Free ──reserve──▶ Connecting ──answer ok──▶ Connected ──hangup──▶ HungUp
//!                        │                        │
//!                        └──answer err──▶ (freed) └──callee gone──▶ Slammed
//! ```
//!
//! Lock order: phone lock before the callee's mailbox lock. Code holding a
//! mailbox lock never takes a phone lock.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use super::arena::ObjRef;
use super::mailbox::MailboxRef;
use crate::task::TaskId;

/// Weak reference to a phone
pub type PhoneRef = ObjRef<Phone>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneState {
    /// Not connected to anything
    Free,
    /// Reserved by a pending connect request
    Connecting,
    /// Usable for calls
    Connected,
    /// Hung up by its owner
    HungUp,
    /// Cut off because the callee went away
    Slammed,
}

/// Mutable part of a phone, guarded by the phone lock
#[derive(Debug)]
pub struct PhoneInner {
    pub state: PhoneState,
    pub callee: Option<MailboxRef>,
}

/// Connection object
#[derive(Debug)]
pub struct Phone {
    owner: TaskId,
    inner: Mutex<PhoneInner>,
    /// Calls sent through this phone and not yet answered or forgotten
    active_calls: AtomicUsize,
}

impl Phone {
    /// Create a free phone owned by `owner`
    pub fn new(owner: TaskId) -> Self {
        Self {
            owner,
            inner: Mutex::new(PhoneInner {
                state: PhoneState::Free,
                callee: None,
            }),
            active_calls: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn lock(&self) -> MutexGuard<'_, PhoneInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> PhoneState {
        self.inner.lock().state
    }

    pub fn callee(&self) -> Option<MailboxRef> {
        self.inner.lock().callee
    }

    #[inline]
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }

    pub(crate) fn call_started(&self) {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn call_finished(&self) {
        let _ = self
            .active_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
