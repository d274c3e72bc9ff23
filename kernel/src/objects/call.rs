//! Call objects
//!
//! A call is one in-flight message envelope: the request a caller sends and,
//! later, the answer to it. The same object travels the whole way:
//!
//! ```text
//! Allocated ─▶ RequestQueued ─▶ Delivered ─▶ AnswerQueued ─▶ Consumed
//!     │              │              │
//!     └──────────────┴──────────────┴──▶ Forgotten
//! ```
//!
//! A call is a member of at most one mailbox queue at a time; observing it
//! in two is an internal invariant violation and panics.
//!
//! Request and answer carry independent fixed-size vectors. Slot 0 holds the
//! method on a request and the return value on an answer; slots 1..=5 are
//! the arguments.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use crossbeam::queue::ArrayQueue;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;

use super::capability::CapHandle;
use super::mailbox::MailboxRef;
use super::phone::PhoneRef;
use crate::error::IpcError;
use crate::memory::KernelBuffer;
use crate::task::TaskId;

/// Words in a call vector
pub const CALL_LEN: usize = 6;

/// Argument words following the method / return value slot
pub const CALL_ARGS: usize = CALL_LEN - 1;

const_assert_eq!(CALL_ARGS, 5);

/// Kernel-wide call identifier
pub type CallId = u64;

/// Shared pool of preallocated notification calls
pub type NotificationPool = ArrayQueue<Arc<Call>>;

/// Fixed call vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallData {
    pub args: [usize; CALL_LEN],
}

impl CallData {
    /// Build a request vector; excess arguments are ignored
    pub fn request(method: usize, args: &[usize]) -> Self {
        let mut data = CallData::default();
        data.args[0] = method;
        data.set_payload(args);
        data
    }

    /// Build an answer vector; excess arguments are ignored
    pub fn answer(retval: usize, args: &[usize]) -> Self {
        Self::request(retval, args)
    }

    #[inline]
    pub fn method(&self) -> usize {
        self.args[0]
    }

    #[inline]
    pub fn set_method(&mut self, method: usize) {
        self.args[0] = method;
    }

    #[inline]
    pub fn retval(&self) -> usize {
        self.args[0]
    }

    #[inline]
    pub fn set_retval(&mut self, retval: usize) {
        self.args[0] = retval;
    }

    /// Argument `n`, 1-based
    #[inline]
    pub fn arg(&self, n: usize) -> usize {
        self.args[n]
    }

    #[inline]
    pub fn set_arg(&mut self, n: usize, value: usize) {
        self.args[n] = value;
    }

    /// ARG1..=ARG5
    pub fn payload(&self) -> [usize; CALL_ARGS] {
        let mut out = [0; CALL_ARGS];
        out.copy_from_slice(&self.args[1..]);
        out
    }

    pub fn set_payload(&mut self, args: &[usize]) {
        let n = args.len().min(CALL_ARGS);
        self.args[1..1 + n].copy_from_slice(&args[..n]);
    }
}

bitflags! {
    /// Call flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u32 {
        /// The callee has answered
        const ANSWERED = 1 << 0;
        /// Kernel-generated IRQ notification
        const NOTIF = 1 << 1;
        /// The call went through at least one forward
        const FORWARDED = 1 << 2;
        /// The answer is consumed silently by the caller's wait
        const DISCARD_ANSWER = 1 << 3;
        /// The caller blocks on a private mailbox for the answer
        const SYNC = 1 << 4;
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Allocated,
    RequestQueued,
    Delivered,
    AnswerQueued,
    Consumed,
    Forgotten,
}

/// Method-specific data kept with a call between hooks
#[derive(Debug, Default)]
pub enum CallPrivate {
    #[default]
    None,
    /// A connection reserved for the duration of a connect request
    Reserved {
        owner: TaskId,
        handle: CapHandle,
        phone: PhoneRef,
    },
    /// Per-subscription notification sequence number
    Notification { counter: u64 },
}

/// Mutable part of a call
///
/// Lock order: mailbox lock before call lock; a task's active-call list is
/// a leaf taken under the call lock.
#[derive(Debug)]
pub struct CallInner {
    pub state: CallState,
    pub flags: CallFlags,
    pub request: CallData,
    pub answer: CallData,
    /// Method the request was sent with, selects the method hooks
    pub request_method: usize,
    /// Side buffer owned by the call while in flight
    pub buffer: Option<KernelBuffer>,
    /// Phone the call was originally sent through
    pub caller_phone: Option<PhoneRef>,
    /// Task the receiver sees as the request's origin
    pub origin: Option<TaskId>,
    /// Mailbox the call is currently queued on or delivered to
    pub callee: Option<MailboxRef>,
    /// Linked on the sender's active-call list
    pub active: bool,
    /// Why a forgotten call was abandoned
    pub forget_reason: Option<IpcError>,
    pub private: CallPrivate,
}

impl CallInner {
    fn new(request: CallData, flags: CallFlags) -> Self {
        Self {
            state: CallState::Allocated,
            flags,
            request,
            answer: CallData::default(),
            request_method: request.method(),
            buffer: None,
            caller_phone: None,
            origin: None,
            callee: None,
            active: false,
            forget_reason: None,
            private: CallPrivate::None,
        }
    }
}

/// In-flight message envelope
#[derive(Debug)]
pub struct Call {
    id: CallId,
    sender: Option<TaskId>,
    callerbox: Option<MailboxRef>,
    pool: Option<Weak<NotificationPool>>,
    inner: Mutex<CallInner>,
}

impl Call {
    /// Create a request call whose answer will go to `callerbox`
    pub fn new(id: CallId, sender: TaskId, callerbox: MailboxRef, request: CallData, flags: CallFlags) -> Self {
        Self {
            id,
            sender: Some(sender),
            callerbox: Some(callerbox),
            pool: None,
            inner: Mutex::new(CallInner::new(request, flags)),
        }
    }

    /// Create a notification call that returns to `pool` once consumed
    pub fn notification(id: CallId, pool: Weak<NotificationPool>) -> Self {
        Self {
            id,
            sender: None,
            callerbox: None,
            pool: Some(pool),
            inner: Mutex::new(CallInner::new(CallData::default(), CallFlags::NOTIF)),
        }
    }

    #[inline]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Task that sent the request, `None` for kernel notifications
    #[inline]
    pub fn sender(&self) -> Option<TaskId> {
        self.sender
    }

    /// Mailbox the answer is delivered to
    #[inline]
    pub fn callerbox(&self) -> Option<MailboxRef> {
        self.callerbox
    }

    pub fn lock(&self) -> MutexGuard<'_, CallInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn flags(&self) -> CallFlags {
        self.inner.lock().flags
    }

    pub fn request(&self) -> CallData {
        self.inner.lock().request
    }

    pub fn answer(&self) -> CallData {
        self.inner.lock().answer
    }

    pub fn is_notification(&self) -> bool {
        self.pool.is_some()
    }

    /// Return a consumed notification to its pool
    ///
    /// Does nothing for request calls or when the subscription is gone.
    pub fn recycle(self: &Arc<Self>) {
        let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            *inner = CallInner::new(CallData::default(), CallFlags::NOTIF);
        }
        // The pool never holds more calls than were created for it.
        let _ = pool.push(Arc::clone(self));
    }
}
