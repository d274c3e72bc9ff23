//! Call lifecycle
//!
//! Object-level IPC operations: sending a call through a phone, answering,
//! forwarding, forgetting, hanging up and waiting. These operate on kernel
//! objects directly; handle translation and argument marshalling live in
//! the syscall layer.
//!
//! ## Call flow
//!
//! ```text
//!  caller                         callee mailbox                caller mailbox
//!    │ call() ──enqueue_request──▶ calls
//!    │                             │ wait_for_call()
//!    │                             ▼
//!    │                           dispatched
//!    │                             │ answer()
//!    │                             └────enqueue_answer────▶ answers
//!    │ wait_for_call() / call_sync() ◀────────────────────────┘
//! ```
//!
//! Lock order: phone, mailbox, call, task active list, wait queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, trace};

use super::methods::{self, PHONE_HUNGUP};
use crate::error::{IpcError, Result};
use crate::kernel::Kernel;
use crate::objects::call::CallInner;
use crate::objects::phone::PhoneInner;
use crate::objects::{
    Call, CallData, CallFlags, CallState, Mailbox, MailboxKind, MailboxRef, Phone, PhoneRef, PhoneState, Taken,
};
use crate::synch::{SleepFlags, SleepResult};
use crate::task::{Current, Task};

bitflags! {
    /// Forwarding behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ForwardFlags: u32 {
        /// The new receiver sees the forwarder as the request's origin
        const ROUTE_FROM_ME = 1 << 0;
        /// Replace method and arguments with the supplied ones
        const REPLACE = 1 << 1;
    }
}

/// Allocate a request call answered into `callerbox`
pub fn call_alloc(kernel: &Kernel, sender: &Task, callerbox: MailboxRef, request: CallData, flags: CallFlags) -> Arc<Call> {
    Arc::new(Call::new(kernel.next_call_id(), sender.id(), callerbox, request, flags))
}

/// Run the method's request preprocess hook
pub fn request_preprocess(kernel: &Kernel, caller: &Task, call: &Call, phone: &Phone) -> Result<()> {
    let method = {
        let mut inner = call.lock();
        inner.request_method = inner.request.method();
        inner.request_method
    };
    kernel.methods().get(method).request_preprocess(kernel, caller, call, phone)
}

/// Send a call through a phone
///
/// Fails fast with `NoEntry` for a phone that was never connected and with
/// `HungUp` for one that was hung up or whose callee is gone.
pub fn call(kernel: &Kernel, phone_ref: PhoneRef, call: &Arc<Call>) -> Result<()> {
    send(kernel, phone_ref, call, false)
}

fn send(kernel: &Kernel, phone_ref: PhoneRef, call: &Arc<Call>, forwarded: bool) -> Result<()> {
    let outcome = match kernel.phones.get(phone_ref) {
        Some(phone) => {
            let mut guard = phone.lock();
            send_locked(kernel, phone_ref, &phone, &mut guard, call, forwarded)
        }
        None => Err(IpcError::HungUp),
    };
    match outcome {
        Ok(Sent::Queued(mbox)) => {
            if mbox.kind() == MailboxKind::Kbox {
                service_kbox(kernel, &mbox);
            }
            Ok(())
        }
        Ok(Sent::Dropped) => Ok(()),
        Ok(Sent::Refused(err)) => {
            answer_detached(kernel, call, if forwarded { IpcError::Forwarded } else { err });
            Ok(())
        }
        Err(err) => {
            if forwarded {
                answer_detached(kernel, call, IpcError::Forwarded);
            }
            Err(err)
        }
    }
}

/// Outcome of handing a call to a phone's callee
enum Sent {
    Queued(Arc<Mailbox>),
    /// Forgotten in transit
    Dropped,
    /// The callee mailbox is closed; the call must be answered with the error
    Refused(IpcError),
}

/// Queue `call` on the phone's callee; `guard` is the phone's lock
fn send_locked(
    kernel: &Kernel,
    phone_ref: PhoneRef,
    phone: &Phone,
    guard: &mut PhoneInner,
    call: &Arc<Call>,
    forwarded: bool,
) -> Result<Sent> {
    match guard.state {
        PhoneState::Connected => {}
        PhoneState::Free | PhoneState::Connecting => return Err(IpcError::NoEntry),
        PhoneState::HungUp | PhoneState::Slammed => return Err(IpcError::HungUp),
    }
    let Some(mbox) = guard.callee.and_then(|r| kernel.mailboxes.get(r)) else {
        guard.state = PhoneState::Slammed;
        return Err(IpcError::HungUp);
    };

    if !forwarded {
        let sender = call.sender().and_then(|id| kernel.task(id)).ok_or(IpcError::HungUp)?;
        let discard = {
            let mut inner = call.lock();
            inner.caller_phone = Some(phone_ref);
            inner.origin = Some(phone.owner());
            inner.active = true;
            inner.flags.contains(CallFlags::DISCARD_ANSWER)
        };
        phone.call_started();
        // Nobody waits for a discarded answer, so it stays off the sender's list.
        if !discard && !sender.add_active(call) {
            call.lock().active = false;
            phone.call_finished();
            return Err(IpcError::HungUp);
        }
    }

    trace!("call #{} -> mailbox {:?} method {:#x}", call.id(), mbox.self_ref(), call.request().method());
    Ok(match mbox.enqueue_request(call) {
        Ok(true) => Sent::Queued(mbox),
        Ok(false) => Sent::Dropped,
        Err(err) => Sent::Refused(err),
    })
}

/// Answer every request waiting on a kernel-serviced mailbox
fn service_kbox(kernel: &Kernel, kbox: &Arc<Mailbox>) {
    while let Some(taken) = kbox.take() {
        if let Taken::Request(call) = taken {
            let method = call.lock().request_method;
            if !kernel.methods().get(method).request_process(kernel, &call, kbox) {
                answer(kernel, kbox, &call, CallData::answer(IpcError::NotSupported.to_retval(), &[]));
            }
        }
    }
}

/// Answer a call delivered to `answerer`
///
/// Answering a forgotten call only releases it.
pub fn answer(kernel: &Kernel, answerer: &Mailbox, call: &Arc<Call>, data: CallData) {
    let forgotten = {
        let mut binner = answerer.lock();
        Mailbox::remove_dispatched(&mut binner, call);
        let mut inner = call.lock();
        if inner.state == CallState::RequestQueued {
            // Left over in a closed mailbox.
            inner.state = CallState::Delivered;
        }
        inner.answer = data;
        mark_answered(&mut inner)
    };
    complete_answer(kernel, call, forgotten);
}

/// Answer a call that is not on any mailbox list
fn answer_detached(kernel: &Kernel, call: &Arc<Call>, err: IpcError) {
    let forgotten = {
        let mut inner = call.lock();
        if matches!(inner.state, CallState::Allocated | CallState::RequestQueued) {
            inner.state = CallState::Delivered;
        }
        inner.answer = CallData::answer(err.to_retval(), &[]);
        mark_answered(&mut inner)
    };
    complete_answer(kernel, call, forgotten);
}

fn mark_answered(inner: &mut CallInner) -> bool {
    if inner.state == CallState::Forgotten {
        return true;
    }
    inner.flags.insert(CallFlags::ANSWERED);
    inner.active = false;
    false
}

fn complete_answer(kernel: &Kernel, call: &Arc<Call>, forgotten: bool) {
    let (method, retval, phone_ref) = {
        let inner = call.lock();
        (inner.request_method, inner.answer.retval(), inner.caller_phone)
    };
    let ops = kernel.methods().get(method);

    if forgotten {
        trace!("answer to forgotten call #{} discarded", call.id());
        ops.answer_cleanup(kernel, call);
        kernel.counters().answer_discarded();
        return;
    }

    if let Some(sender) = call.sender().and_then(|id| kernel.task(id)) {
        sender.remove_active(call);
    }

    if retval == IpcError::HungUp.to_retval() {
        if let Some(phone_ref) = phone_ref {
            slam_phone(kernel, phone_ref);
        }
    }

    let answerer = call
        .lock()
        .callee
        .and_then(|r| kernel.mailboxes.get(r))
        .and_then(|mbox| kernel.task(mbox.owner()));
    if let Some(answerer) = answerer {
        ops.answer_preprocess(kernel, call, &answerer);
    }

    if let Some(phone) = phone_ref.and_then(|r| kernel.phones.get(r)) {
        phone.call_finished();
    }

    let delivered = call
        .callerbox()
        .and_then(|r| kernel.mailboxes.get(r))
        .is_some_and(|mbox| mbox.enqueue_answer(call));
    if !delivered {
        trace!("answer to call #{} dropped: caller mailbox gone", call.id());
        ops.answer_cleanup(kernel, call);
    }
}

/// Caller-side processing of a received answer
pub fn process_answer(kernel: &Kernel, caller: &Task, call: &Call) {
    let method = {
        let mut inner = call.lock();
        if inner.answer.retval() == IpcError::HungUp.to_retval() && inner.flags.contains(CallFlags::FORWARDED) {
            inner.answer.set_retval(IpcError::Forwarded.to_retval());
        }
        inner.request_method
    };
    let ops = kernel.methods().get(method);
    ops.answer_process(kernel, call, caller);
    ops.answer_cleanup(kernel, call);
}

/// Receiver-side processing of a delivered request
///
/// Returns `true` if the kernel consumed the request.
pub fn process_request(kernel: &Kernel, mbox: &Mailbox, call: &Arc<Call>) -> bool {
    let method = call.lock().request_method;
    kernel.methods().get(method).request_process(kernel, call, mbox)
}

/// Abandon a call whose sender no longer waits for it
///
/// A queued request is withdrawn, a delivered one is left for the receiver
/// to answer into the void. The method's forget hook runs exactly once.
/// Returns `false` if the call was already answered or forgotten.
pub fn forget(kernel: &Kernel, call: &Arc<Call>, reason: IpcError) -> bool {
    let (phone_ref, method, flags) = loop {
        let callee = {
            let inner = call.lock();
            if !inner.active || inner.flags.contains(CallFlags::ANSWERED) {
                return false;
            }
            inner.callee
        };
        let mbox = callee.and_then(|r| kernel.mailboxes.get(r));
        let mut binner = mbox.as_ref().map(|m| m.lock());
        let mut inner = call.lock();
        if inner.callee != callee {
            continue;
        }
        if !inner.active || inner.flags.contains(CallFlags::ANSWERED) {
            return false;
        }
        match inner.state {
            CallState::RequestQueued => {
                if let (Some(mbox), Some(binner)) = (mbox.as_ref(), binner.as_mut()) {
                    mbox.withdraw_request(binner, call);
                }
            }
            CallState::Allocated | CallState::Delivered => {}
            _ => return false,
        }
        inner.state = CallState::Forgotten;
        inner.active = false;
        inner.forget_reason = Some(reason);
        break (inner.caller_phone, inner.request_method, inner.flags);
    };

    debug!("call #{} forgotten ({})", call.id(), reason);
    if let Some(sender) = call.sender().and_then(|id| kernel.task(id)) {
        sender.remove_active(call);
    }
    if let Some(phone) = phone_ref.and_then(|r| kernel.phones.get(r)) {
        phone.call_finished();
    }
    kernel.methods().get(method).request_forget(kernel, call);
    kernel.counters().forget_hook_ran();
    kernel.counters().call_forgotten();

    if flags.contains(CallFlags::SYNC) {
        if let Some(sync_box) = call.callerbox().and_then(|r| kernel.mailboxes.get(r)) {
            sync_box.wakeup();
        }
    }
    true
}

/// Cut a phone off because its callee went away
pub fn slam_phone(kernel: &Kernel, phone_ref: PhoneRef) {
    let Some(phone) = kernel.phones.get(phone_ref) else {
        return;
    };
    let mut guard = phone.lock();
    if guard.state != PhoneState::Connected {
        return;
    }
    if let Some(mbox) = guard.callee.and_then(|r| kernel.mailboxes.get(r)) {
        mbox.lock().connected_phones.retain(|p| *p != phone_ref);
    }
    guard.state = PhoneState::Slammed;
    debug!("phone {:?} slammed", phone_ref);
}

/// Connect a phone to a mailbox
///
/// The phone must be `Free` or `Connecting`. Fails with `HungUp` if the
/// mailbox is closed or gone.
pub fn phone_connect(kernel: &Kernel, phone_ref: PhoneRef, target: MailboxRef) -> Result<()> {
    let phone = kernel.phones.get(phone_ref).ok_or(IpcError::NotFound)?;
    let mut guard = phone.lock();
    if !matches!(guard.state, PhoneState::Free | PhoneState::Connecting) {
        return Err(IpcError::Invalid);
    }
    let mbox = kernel.mailboxes.get(target).ok_or(IpcError::HungUp)?;
    let mut binner = mbox.lock();
    if binner.closed {
        return Err(IpcError::HungUp);
    }
    binner.connected_phones.push(phone_ref);
    guard.state = PhoneState::Connected;
    guard.callee = Some(target);
    debug!("phone {:?} (task {}) connected to mailbox {:?}", phone_ref, phone.owner(), target);
    Ok(())
}

/// Hang up a phone
///
/// Idempotent. The callee is told with a `PHONE_HUNGUP` message whose
/// answer is discarded, and every synchronous caller still waiting for an
/// answer through the phone is woken with `HungUp`.
pub fn phone_hangup(kernel: &Kernel, phone_ref: PhoneRef) -> Result<()> {
    let phone = kernel.phones.get(phone_ref).ok_or(IpcError::NotFound)?;
    let mut refused = None;
    {
        let mut guard = phone.lock();
        match guard.state {
            PhoneState::Free | PhoneState::Connecting | PhoneState::HungUp => return Ok(()),
            PhoneState::Slammed => {
                guard.state = PhoneState::HungUp;
                return Ok(());
            }
            PhoneState::Connected => {}
        }

        if let Some(mbox) = guard.callee.and_then(|r| kernel.mailboxes.get(r)) {
            mbox.lock().connected_phones.retain(|p| *p != phone_ref);
        }
        if let Some(owner) = kernel.task(phone.owner()) {
            let hangup = call_alloc(
                kernel,
                &owner,
                owner.answerbox_ref(),
                CallData::request(PHONE_HUNGUP, &[]),
                CallFlags::DISCARD_ANSWER,
            );
            // The phone is still connected for this one message.
            match send_locked(kernel, phone_ref, &phone, &mut guard, &hangup, false) {
                Ok(Sent::Queued(_)) | Ok(Sent::Dropped) => {}
                Ok(Sent::Refused(err)) => refused = Some((hangup, err)),
                Err(err) => trace!("hangup message for phone {:?} not sent: {}", phone_ref, err),
            }
        }
        guard.state = PhoneState::HungUp;
    }
    debug!("phone {:?} hung up", phone_ref);
    if let Some((hangup, err)) = refused {
        answer_detached(kernel, &hangup, err);
    }

    if let Some(owner) = kernel.task(phone.owner()) {
        for call in owner.active_snapshot() {
            let waits = {
                let inner = call.lock();
                inner.flags.contains(CallFlags::SYNC) && inner.caller_phone == Some(phone_ref)
            };
            if waits {
                forget(kernel, &call, IpcError::HungUp);
            }
        }
    }
    Ok(())
}

/// Re-target a delivered call to another phone without answering it
///
/// On failure the original caller is answered with `Forwarded`.
pub fn forward(
    kernel: &Kernel,
    forwarder: &Task,
    mbox: &Mailbox,
    call: &Arc<Call>,
    phone_ref: PhoneRef,
    update: Option<CallData>,
    flags: ForwardFlags,
) -> Result<()> {
    let method = call.request().method();
    if !methods::is_forwardable(method) {
        answer(kernel, mbox, call, CallData::answer(IpcError::Forwarded.to_retval(), &[]));
        return Err(IpcError::Permission);
    }

    {
        let mut binner = mbox.lock();
        Mailbox::remove_dispatched(&mut binner, call);
        let mut inner = call.lock();
        if inner.state == CallState::Forgotten {
            drop(inner);
            drop(binner);
            complete_answer(kernel, call, true);
            return Ok(());
        }
        inner.state = CallState::Allocated;
        inner.callee = None;
        inner.flags.insert(CallFlags::FORWARDED);
        if let Some(update) = update.filter(|_| flags.contains(ForwardFlags::REPLACE)) {
            if !methods::is_system(method) {
                inner.request = update;
            } else if !methods::is_immutable(method) {
                for n in 1..=3 {
                    inner.request.set_arg(n, update.arg(n));
                }
            }
        }
        if flags.contains(ForwardFlags::ROUTE_FROM_ME) {
            inner.origin = Some(forwarder.id());
        }
    }
    let hooks = call.lock().request_method;
    kernel.methods().get(hooks).request_forward(kernel, call, forwarder);

    trace!("call #{} forwarded by task {}", call.id(), forwarder.id());
    send(kernel, phone_ref, call, true)
}

/// Wait for something to arrive on `mbox`
///
/// `timeout == Some(Duration::ZERO)` polls.
pub fn wait_for_call(cur: &Current, mbox: &Mailbox, timeout: Option<Duration>, flags: SleepFlags) -> Result<Taken> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(taken) = mbox.take() {
            return Ok(taken);
        }
        if mbox.is_closed() {
            return Err(IpcError::HungUp);
        }
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match mbox.wait_queue().sleep(cur.context(), remaining, flags) {
            SleepResult::Woken => continue,
            SleepResult::TimedOut => return Err(IpcError::TimedOut),
            SleepResult::Interrupted => return Err(IpcError::Interrupted),
        }
    }
}

/// Send an asynchronous request; the answer arrives on the caller's answerbox
pub fn call_async(kernel: &Kernel, cur: &Current, phone_ref: PhoneRef, request: CallData) -> Result<Arc<Call>> {
    let task = cur.task();
    let phone = kernel.phones.get(phone_ref).ok_or(IpcError::NotFound)?;
    if phone.active_calls() >= kernel.config().max_async_calls {
        return Err(IpcError::Limit);
    }
    let call = call_alloc(kernel, task, task.answerbox_ref(), request, CallFlags::empty());
    request_preprocess(kernel, task, &call, &phone)?;
    self::call(kernel, phone_ref, &call).inspect_err(|_| {
        forget_unsent(kernel, &call);
    })?;
    Ok(call)
}

/// Send a request and block until it is answered
///
/// A timeout or interruption abandons the call; if the answer was already
/// on its way the caller waits for it instead.
pub fn call_sync(
    kernel: &Kernel,
    cur: &Current,
    phone_ref: PhoneRef,
    request: CallData,
    timeout: Option<Duration>,
) -> Result<CallData> {
    let task = cur.task();
    let phone = kernel.phones.get(phone_ref).ok_or(IpcError::NotFound)?;
    let (sync_ref, sync_box) = kernel
        .mailboxes
        .insert_with(|r| Mailbox::new(r, task.id(), MailboxKind::Sync));
    let call = call_alloc(kernel, task, sync_ref, request, CallFlags::SYNC);

    let result = request_preprocess(kernel, task, &call, &phone)
        .and_then(|()| {
            self::call(kernel, phone_ref, &call).inspect_err(|_| {
                forget_unsent(kernel, &call);
            })
        })
        .and_then(|()| wait_answer(kernel, cur, &sync_box, &call, timeout));
    kernel.mailboxes.remove(sync_ref);

    result.map(|()| {
        process_answer(kernel, task, &call);
        call.answer()
    })
}

fn wait_answer(kernel: &Kernel, cur: &Current, sync_box: &Mailbox, call: &Arc<Call>, timeout: Option<Duration>) -> Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut abandonable = true;
    loop {
        if let Some(Taken::Answer(_)) = sync_box.take() {
            return Ok(());
        }
        {
            let inner = call.lock();
            if inner.state == CallState::Forgotten {
                return Err(inner.forget_reason.unwrap_or(IpcError::HungUp));
            }
        }
        let (remaining, flags) = if abandonable {
            (
                deadline.map(|d| d.saturating_duration_since(Instant::now())),
                SleepFlags::INTERRUPTIBLE,
            )
        } else {
            (None, SleepFlags::empty())
        };
        let err = match sync_box.wait_queue().sleep(cur.context(), remaining, flags) {
            SleepResult::Woken => continue,
            SleepResult::TimedOut => IpcError::TimedOut,
            SleepResult::Interrupted => IpcError::Interrupted,
        };
        if forget(kernel, call, err) {
            return Err(err);
        }
        // Answered meanwhile: wait for it without a deadline.
        abandonable = false;
    }
}

/// Release a call that preprocessing accepted but that was never queued
fn forget_unsent(kernel: &Kernel, call: &Arc<Call>) {
    let method = {
        let mut inner = call.lock();
        if inner.state != CallState::Allocated || inner.active {
            return;
        }
        inner.state = CallState::Forgotten;
        inner.request_method
    };
    kernel.methods().get(method).request_forget(kernel, call);
    kernel.counters().forget_hook_ran();
}
