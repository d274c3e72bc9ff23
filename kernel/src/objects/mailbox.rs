//! Mailbox ("answerbox") objects
//!
//! A mailbox is the receiving endpoint of IPC. It holds incoming requests,
//! answers to calls its owner made and IRQ notifications, all under one
//! lock, plus the wait queue its receivers sleep on.
//!
//! ## Queue Structure
//!
//! ```text
//! Mailbox
//!   ├─ irq_notifs: [N1] → [N2]       (taken first)
//!   ├─ answers:    [A1]              (taken second)
//!   ├─ calls:      [C4] → [C5]       (taken last, then moved to dispatched)
//!   ├─ dispatched: [C1] [C2]         (delivered, awaiting answer)
//!   └─ connected_phones: [P1] [P7]
//! ```
//!
//! Every queue mutation and every wakeup happens with the mailbox lock held.
//! Lock order: phone lock, then mailbox lock, then call lock, then the wait
//! queue lock.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use super::arena::ObjRef;
use super::call::{Call, CallInner, CallState};
use super::phone::PhoneRef;
use crate::error::{IpcError, Result};
use crate::synch::{WaitQueue, WakeupMode};
use crate::task::TaskId;

/// Weak reference to a mailbox
pub type MailboxRef = ObjRef<Mailbox>;

/// What a mailbox is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    /// A task's main answerbox
    Answerbox,
    /// Private box a synchronous caller waits on
    Sync,
    /// Kernel-serviced debug box
    Kbox,
}

/// Queues of a mailbox, guarded by the mailbox lock
#[derive(Debug, Default)]
pub struct MailboxInner {
    pub connected_phones: Vec<PhoneRef>,
    pub calls: VecDeque<Arc<Call>>,
    pub dispatched: Vec<Arc<Call>>,
    pub answers: VecDeque<Arc<Call>>,
    pub irq_notifs: VecDeque<Arc<Call>>,
    /// Sum of the notification pools posting here
    pub notifs_reserved: usize,
    pub closed: bool,
}

/// Something taken off a mailbox
#[derive(Debug)]
pub enum Taken {
    Notification(Arc<Call>),
    Answer(Arc<Call>),
    Request(Arc<Call>),
}

/// Everything left in a mailbox when it was closed
#[derive(Debug, Default)]
pub struct ClosedMailbox {
    pub connected_phones: Vec<PhoneRef>,
    pub calls: Vec<Arc<Call>>,
    pub dispatched: Vec<Arc<Call>>,
    pub answers: Vec<Arc<Call>>,
    pub irq_notifs: Vec<Arc<Call>>,
}

/// Receiving endpoint
#[derive(Debug)]
pub struct Mailbox {
    self_ref: MailboxRef,
    owner: TaskId,
    kind: MailboxKind,
    wq: WaitQueue,
    inner: Mutex<MailboxInner>,
}

fn enter_state(call: &Call, inner: &mut CallInner, from: &[CallState], to: CallState) {
    if !from.contains(&inner.state) {
        panic!(
            "call #{} cannot become {:?} while {:?}: queued twice",
            call.id(),
            to,
            inner.state
        );
    }
    inner.state = to;
}

impl Mailbox {
    pub fn new(self_ref: MailboxRef, owner: TaskId, kind: MailboxKind) -> Self {
        Self {
            self_ref,
            owner,
            kind,
            wq: WaitQueue::new(),
            inner: Mutex::new(MailboxInner::default()),
        }
    }

    #[inline]
    pub fn self_ref(&self) -> MailboxRef {
        self.self_ref
    }

    #[inline]
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    #[inline]
    pub fn kind(&self) -> MailboxKind {
        self.kind
    }

    #[inline]
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }

    pub fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Queue a request
    ///
    /// Returns `Ok(false)` if the call was forgotten while in transit, in
    /// which case it is not queued. Fails with `HungUp` once the mailbox is
    /// closed.
    pub fn enqueue_request(&self, call: &Arc<Call>) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IpcError::HungUp);
        }
        {
            let mut cinner = call.lock();
            if cinner.state == CallState::Forgotten {
                return Ok(false);
            }
            enter_state(call, &mut cinner, &[CallState::Allocated], CallState::RequestQueued);
            cinner.callee = Some(self.self_ref);
        }
        inner.calls.push_back(Arc::clone(call));
        self.wq.lock().wakeup(WakeupMode::One);
        Ok(true)
    }

    /// Queue an answer; returns `false` if the mailbox is already closed
    pub fn enqueue_answer(&self, call: &Arc<Call>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        {
            let mut cinner = call.lock();
            enter_state(call, &mut cinner, &[CallState::Delivered], CallState::AnswerQueued);
        }
        inner.answers.push_back(Arc::clone(call));
        self.wq.lock().wakeup(WakeupMode::One);
        true
    }

    /// Account for a pool of `n` notifications posting here
    ///
    /// The queue keeps room for everything already queued plus every
    /// notification any attached pool can still post, so posting never
    /// allocates.
    pub fn reserve_notifications(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.notifs_reserved += n;
        let reserved = inner.notifs_reserved;
        inner.irq_notifs.reserve(reserved);
    }

    /// Forget a pool of `n` notifications that no longer posts here
    pub fn release_notifications(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.notifs_reserved = inner.notifs_reserved.saturating_sub(n);
    }

    /// Post a preallocated notification; returns `false` if closed
    pub fn post_notification(&self, call: &Arc<Call>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        call.lock().state = CallState::RequestQueued;
        inner.irq_notifs.push_back(Arc::clone(call));
        self.wq.lock().wakeup(WakeupMode::One);
        true
    }

    /// Take the next item: notifications first, then answers, then requests
    ///
    /// A request is marked delivered and kept on the dispatched list.
    pub fn take(&self) -> Option<Taken> {
        let mut inner = self.inner.lock();
        if let Some(call) = inner.irq_notifs.pop_front() {
            call.lock().state = CallState::Delivered;
            return Some(Taken::Notification(call));
        }
        if let Some(call) = inner.answers.pop_front() {
            {
                let mut cinner = call.lock();
                enter_state(&call, &mut cinner, &[CallState::AnswerQueued], CallState::Consumed);
            }
            return Some(Taken::Answer(call));
        }
        if let Some(call) = inner.calls.pop_front() {
            {
                let mut cinner = call.lock();
                enter_state(&call, &mut cinner, &[CallState::RequestQueued], CallState::Delivered);
            }
            inner.dispatched.push(Arc::clone(&call));
            return Some(Taken::Request(call));
        }
        None
    }

    /// Unlink a delivered call from the dispatched list
    pub fn remove_dispatched(inner: &mut MailboxInner, call: &Arc<Call>) -> bool {
        match inner.dispatched.iter().position(|c| Arc::ptr_eq(c, call)) {
            Some(pos) => {
                inner.dispatched.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Unlink a still-queued request and retract the wakeup it caused
    pub fn withdraw_request(&self, inner: &mut MailboxInner, call: &Arc<Call>) -> bool {
        match inner.calls.iter().position(|c| Arc::ptr_eq(c, call)) {
            Some(pos) => {
                inner.calls.remove(pos);
                self.wq.lock().retract();
                true
            }
            None => false,
        }
    }

    /// Wake the oldest receiver
    pub fn wakeup(&self) {
        self.wq.wakeup(WakeupMode::One);
    }

    /// Close the mailbox and hand back everything still in it
    ///
    /// Every sleeper is woken so it can observe the closed state.
    pub fn close(&self) -> ClosedMailbox {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let closed = ClosedMailbox {
            connected_phones: core::mem::take(&mut inner.connected_phones),
            calls: inner.calls.drain(..).collect(),
            dispatched: core::mem::take(&mut inner.dispatched),
            answers: inner.answers.drain(..).collect(),
            irq_notifs: inner.irq_notifs.drain(..).collect(),
        };
        self.wq.lock().wakeup(WakeupMode::All);
        closed
    }

    /// Number of queued, not yet delivered requests
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Number of delivered, unanswered requests
    pub fn dispatched_count(&self) -> usize {
        self.inner.lock().dispatched.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::arena::Arena;
    use crate::objects::call::{CallData, CallFlags};

    fn setup() -> (Arena<Mailbox>, Arc<Mailbox>, MailboxRef) {
        let boxes = Arena::new();
        let (r, mbox) = boxes.insert_with(|r| Mailbox::new(r, 1, MailboxKind::Answerbox));
        (boxes, mbox, r)
    }

    fn call(id: u64, caller: MailboxRef) -> Arc<Call> {
        Arc::new(Call::new(id, 2, caller, CallData::request(10 + id as usize, &[]), CallFlags::empty()))
    }

    #[test]
    fn requests_are_delivered_in_order() {
        let (_boxes, mbox, r) = setup();
        let a = call(1, r);
        let b = call(2, r);
        assert!(mbox.enqueue_request(&a).unwrap());
        assert!(mbox.enqueue_request(&b).unwrap());
        match mbox.take() {
            Some(Taken::Request(c)) => assert_eq!(c.id(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.state(), CallState::Delivered);
        assert_eq!(mbox.dispatched_count(), 1);
        assert_eq!(mbox.pending_requests(), 1);
    }

    #[test]
    fn answers_take_priority_over_requests() {
        let (_boxes, mbox, r) = setup();
        let req = call(1, r);
        let ans = call(2, r);
        mbox.enqueue_request(&req).unwrap();
        mbox.enqueue_request(&ans).unwrap();
        // Deliver both, then answer the second back into the same box.
        mbox.take();
        mbox.take();
        {
            let mut inner = mbox.lock();
            assert!(Mailbox::remove_dispatched(&mut inner, &ans));
        }
        let other = call(3, r);
        mbox.enqueue_request(&other).unwrap();
        assert!(mbox.enqueue_answer(&ans));
        assert!(matches!(mbox.take(), Some(Taken::Answer(c)) if c.id() == 2));
        assert_eq!(ans.state(), CallState::Consumed);
    }

    #[test]
    #[should_panic(expected = "queued twice")]
    fn double_queue_panics() {
        let (_boxes, mbox, r) = setup();
        let c = call(1, r);
        mbox.enqueue_request(&c).unwrap();
        let _ = mbox.enqueue_request(&c);
    }

    #[test]
    fn forgotten_call_is_not_queued() {
        let (_boxes, mbox, r) = setup();
        let c = call(1, r);
        c.lock().state = CallState::Forgotten;
        assert!(!mbox.enqueue_request(&c).unwrap());
        assert_eq!(mbox.pending_requests(), 0);
    }

    #[test]
    fn withdraw_retracts_wakeup() {
        let (_boxes, mbox, r) = setup();
        let c = call(1, r);
        mbox.enqueue_request(&c).unwrap();
        assert_eq!(mbox.wait_queue().missed_wakeups(), 1);
        let mut inner = mbox.lock();
        assert!(mbox.withdraw_request(&mut inner, &c));
        drop(inner);
        assert_eq!(mbox.wait_queue().missed_wakeups(), 0);
        assert!(mbox.take().is_none());
    }

    #[test]
    fn closed_mailbox_rejects_requests() {
        let (_boxes, mbox, r) = setup();
        let queued = call(1, r);
        mbox.enqueue_request(&queued).unwrap();
        let closed = mbox.close();
        assert_eq!(closed.calls.len(), 1);
        assert_eq!(mbox.enqueue_request(&call(2, r)).unwrap_err(), IpcError::HungUp);
        assert!(mbox.is_closed());
    }
}
