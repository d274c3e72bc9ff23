//! System call interface
//!
//! Typed `sys_ipc_*` entry points translate capability handles into kernel
//! objects and call into [`crate::ipc`]. [`handle_syscall`] decodes a raw
//! trap frame (syscall number plus six argument words) onto them, the way
//! architecture trap code would.

pub mod numbers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::{check_retval, IpcError, Result};
use crate::ipc::irq::{IrqCode, IrqSubscription};
use crate::ipc::lifecycle::{self, ForwardFlags};
use crate::ipc::methods::CONNECT_ME_TO;
use crate::kernel::Kernel;
use crate::memory::VirtAddr;
use crate::objects::{Call, CallData, CallFlags, CallId, CallPrivate, CapHandle, KernelObject, PhoneRef, Taken, CALL_ARGS, CALL_LEN};
use crate::synch::SleepFlags;
use crate::task::{Current, TaskId, TaskPerms};

/// Something received from the answerbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A request; answer or forward it through `handle`
    Request {
        handle: CapHandle,
        method: usize,
        args: [usize; CALL_ARGS],
        sender: TaskId,
        /// Task the request appears to come from (differs after forwarding)
        origin: TaskId,
    },
    /// Answer to an asynchronous call
    Answer {
        id: CallId,
        retval: usize,
        args: [usize; CALL_ARGS],
    },
    /// IRQ notification
    Notification {
        method: usize,
        args: [usize; CALL_ARGS],
        counter: u64,
    },
}

impl Received {
    /// Record kind reported by the raw wait syscall
    pub const KIND_REQUEST: usize = 1;
    pub const KIND_ANSWER: usize = 2;
    pub const KIND_NOTIFICATION: usize = 3;

    /// Words of a record written by the raw wait syscall
    ///
    /// `[kind, handle or call id, method or retval, arg1..arg5, sender or counter, origin]`
    pub const RECORD_WORDS: usize = 10;

    fn to_words(self) -> [usize; Self::RECORD_WORDS] {
        let mut words = [0; Self::RECORD_WORDS];
        let (kind, id, word0, args, extra, origin) = match self {
            Received::Request {
                handle,
                method,
                args,
                sender,
                origin,
            } => (Self::KIND_REQUEST, handle.raw(), method, args, sender as usize, origin as usize),
            Received::Answer { id, retval, args } => (Self::KIND_ANSWER, id as usize, retval, args, 0, 0),
            Received::Notification { method, args, counter } => {
                (Self::KIND_NOTIFICATION, 0, method, args, counter as usize, 0)
            }
        };
        words[0] = kind;
        words[1] = id;
        words[2] = word0;
        words[3..3 + CALL_ARGS].copy_from_slice(&args);
        words[8] = extra;
        words[9] = origin;
        words
    }
}

fn phone_of(cur: &Current, handle: CapHandle) -> Result<PhoneRef> {
    cur.task().caps.get::<PhoneRef>(handle)
}

/// Synchronous call; blocks until answered
pub fn sys_ipc_call_sync(kernel: &Kernel, cur: &Current, phone: CapHandle, method: usize, args: &[usize]) -> Result<CallData> {
    sys_ipc_call_sync_timeout(kernel, cur, phone, method, args, None)
}

/// Synchronous call that gives up after `timeout`
pub fn sys_ipc_call_sync_timeout(
    kernel: &Kernel,
    cur: &Current,
    phone: CapHandle,
    method: usize,
    args: &[usize],
    timeout: Option<Duration>,
) -> Result<CallData> {
    let phone = phone_of(cur, phone)?;
    lifecycle::call_sync(kernel, cur, phone, CallData::request(method, args), timeout)
}

/// Asynchronous call; the answer arrives through [`sys_ipc_wait_for_call`]
pub fn sys_ipc_call_async(kernel: &Kernel, cur: &Current, phone: CapHandle, method: usize, args: &[usize]) -> Result<CallId> {
    let phone = phone_of(cur, phone)?;
    let call = lifecycle::call_async(kernel, cur, phone, CallData::request(method, args))?;
    Ok(call.id())
}

/// Wait for a request, an answer or a notification on the answerbox
///
/// Requests the kernel services itself and discarded answers are consumed
/// here and never returned.
pub fn sys_ipc_wait_for_call(kernel: &Kernel, cur: &Current, timeout: Option<Duration>, flags: SleepFlags) -> Result<Received> {
    let task = cur.task();
    let mbox = task.answerbox();
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match lifecycle::wait_for_call(cur, mbox, remaining, flags)? {
            Taken::Notification(call) => {
                let received = {
                    let inner = call.lock();
                    let counter = match inner.private {
                        CallPrivate::Notification { counter } => counter,
                        _ => 0,
                    };
                    Received::Notification {
                        method: inner.request.method(),
                        args: inner.request.payload(),
                        counter,
                    }
                };
                call.recycle();
                return Ok(received);
            }
            Taken::Answer(call) => {
                lifecycle::process_answer(kernel, task, &call);
                if call.flags().contains(CallFlags::DISCARD_ANSWER) {
                    continue;
                }
                let answer = call.answer();
                return Ok(Received::Answer {
                    id: call.id(),
                    retval: answer.retval(),
                    args: answer.payload(),
                });
            }
            Taken::Request(call) => {
                if lifecycle::process_request(kernel, mbox, &call) {
                    continue;
                }
                let handle = match task.caps.insert(KernelObject::Call(Arc::clone(&call))) {
                    Ok(handle) => handle,
                    Err(err) => {
                        warn!("task {}: no handle for call #{}: {}", task.id(), call.id(), err);
                        lifecycle::answer(kernel, mbox, &call, CallData::answer(IpcError::Party.to_retval(), &[]));
                        continue;
                    }
                };
                let inner = call.lock();
                trace!("task {}: received call #{} as {:?}", task.id(), call.id(), handle);
                return Ok(Received::Request {
                    handle,
                    method: inner.request.method(),
                    args: inner.request.payload(),
                    sender: call.sender().unwrap_or_default(),
                    origin: inner.origin.unwrap_or_default(),
                });
            }
        }
    }
}

/// Answer a received request; the handle is consumed
pub fn sys_ipc_answer(kernel: &Kernel, cur: &Current, call: CapHandle, retval: usize, args: &[usize]) -> Result<()> {
    let task = cur.task();
    let call = task.caps.remove::<Arc<Call>>(call)?;
    lifecycle::answer(kernel, task.answerbox(), &call, CallData::answer(retval, args));
    Ok(())
}

/// Forward a received request through `phone`; the call handle is consumed
///
/// With [`ForwardFlags::REPLACE`], `update` supplies the new method and
/// arguments.
pub fn sys_ipc_forward(
    kernel: &Kernel,
    cur: &Current,
    call: CapHandle,
    phone: CapHandle,
    update: Option<CallData>,
    flags: ForwardFlags,
) -> Result<()> {
    let task = cur.task();
    task.caps.get::<Arc<Call>>(call)?;
    let target = phone_of(cur, phone);
    let call = task.caps.remove::<Arc<Call>>(call)?;
    match target {
        Ok(target) => lifecycle::forward(kernel, task, task.answerbox(), &call, target, update, flags),
        Err(err) => {
            lifecycle::answer(kernel, task.answerbox(), &call, CallData::answer(IpcError::Forwarded.to_retval(), &[]));
            Err(err)
        }
    }
}

/// Hang up a phone; the handle stays valid but every call through it fails
pub fn sys_ipc_hangup(kernel: &Kernel, cur: &Current, phone: CapHandle) -> Result<()> {
    lifecycle::phone_hangup(kernel, phone_of(cur, phone)?)
}

/// Hang up a phone and free its handle
pub fn sys_ipc_phone_release(kernel: &Kernel, cur: &Current, phone: CapHandle) -> Result<()> {
    let phone_ref = phone_of(cur, phone)?;
    lifecycle::phone_hangup(kernel, phone_ref)?;
    cur.task().caps.remove::<PhoneRef>(phone)?;
    kernel.phones.remove(phone_ref);
    Ok(())
}

/// Interrupt one thread waiting on the caller's answerbox
pub fn sys_ipc_poke(cur: &Current) -> bool {
    cur.task().answerbox().wait_queue().interrupt_first()
}

/// Ask for a new connection through `phone`, or the naming service if `None`
pub fn sys_ipc_connect_me_to(kernel: &Kernel, cur: &Current, phone: Option<CapHandle>, args: &[usize]) -> Result<CapHandle> {
    let phone = phone.or_else(|| cur.task().naming_phone()).ok_or(IpcError::NoEntry)?;
    let answer = sys_ipc_call_sync(kernel, cur, phone, CONNECT_ME_TO, args)?;
    check_retval(answer.retval())?;
    Ok(CapHandle::from_raw(answer.arg(5)))
}

/// Connect to `target`'s kernel-serviced debug box
pub fn sys_ipc_connect_kbox(kernel: &Kernel, cur: &Current, target: TaskId) -> Result<CapHandle> {
    kernel.connect_kbox(cur.task().id(), target)
}

/// Subscribe the caller's answerbox to interrupt `line`
pub fn sys_ipc_irq_subscribe(
    kernel: &Kernel,
    cur: &Current,
    line: usize,
    devno: usize,
    method: usize,
    code: Option<IrqCode>,
) -> Result<CapHandle> {
    let task = cur.task();
    if !task.perms().contains(TaskPerms::IRQ_REG) {
        return Err(IpcError::Permission);
    }
    let program = code
        .map(|code| code.check(kernel.config()))
        .transpose()
        .inspect_err(|err| warn!("task {}: IRQ program for line {} rejected: {}", task.id(), line, err))?;

    let handle = task.caps.alloc()?;
    let sub = Arc::new(IrqSubscription::new(
        line,
        devno,
        method,
        task.id(),
        Arc::clone(task.answerbox()),
        program,
        kernel.config().irq_notif_pool,
        || kernel.next_call_id(),
    ));
    if let Err(err) = kernel.irqs().subscribe(Arc::clone(&sub)) {
        task.caps.free(handle);
        return Err(err);
    }
    if let Err(err) = task.caps.publish(handle, KernelObject::Irq(Arc::clone(&sub))) {
        kernel.irqs().unsubscribe(&sub);
        task.caps.free(handle);
        return Err(err);
    }
    // Teardown may already have drained the table and would never see this one.
    if !task.is_alive() {
        kernel.irqs().unsubscribe(&sub);
        let _ = task.caps.remove::<Arc<IrqSubscription>>(handle);
        return Err(IpcError::HungUp);
    }
    Ok(handle)
}

/// Drop an interrupt subscription
pub fn sys_ipc_irq_unsubscribe(kernel: &Kernel, cur: &Current, handle: CapHandle) -> Result<()> {
    let sub = cur.task().caps.remove::<Arc<IrqSubscription>>(handle)?;
    kernel.irqs().unsubscribe(&sub);
    Ok(())
}

/// Raw syscall registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    pub nr: usize,
    pub args: [usize; 6],
    pub ret: usize,
}

/// Syscall dispatcher - called from the trap handler
pub fn handle_syscall(kernel: &Kernel, cur: &Current, frame: &mut SyscallFrame) {
    frame.ret = dispatch(kernel, cur, frame.nr, &frame.args);
}

/// Decode and run one syscall; returns the result word
pub fn dispatch(kernel: &Kernel, cur: &Current, nr: usize, args: &[usize; 6]) -> usize {
    let result = match nr {
        numbers::SYS_IPC_CALL_SYNC => raw_call_sync(kernel, cur, args),
        numbers::SYS_IPC_CALL_ASYNC => {
            sys_ipc_call_async(kernel, cur, CapHandle::from_raw(args[0]), args[1], &args[2..6]).map(|id| id as usize)
        }
        numbers::SYS_IPC_ANSWER => sys_ipc_answer(kernel, cur, CapHandle::from_raw(args[0]), args[1], &args[2..6]).map(|()| 0),
        numbers::SYS_IPC_FORWARD => raw_forward(kernel, cur, args),
        numbers::SYS_IPC_WAIT => raw_wait(kernel, cur, args),
        numbers::SYS_IPC_POKE => Ok(usize::from(sys_ipc_poke(cur))),
        numbers::SYS_IPC_HANGUP => sys_ipc_hangup(kernel, cur, CapHandle::from_raw(args[0])).map(|()| 0),
        numbers::SYS_IPC_PHONE_RELEASE => sys_ipc_phone_release(kernel, cur, CapHandle::from_raw(args[0])).map(|()| 0),
        numbers::SYS_IPC_CONNECT_ME_TO => {
            let phone = Some(CapHandle::from_raw(args[0])).filter(|h| !h.is_nil());
            sys_ipc_connect_me_to(kernel, cur, phone, &args[1..4]).map(CapHandle::raw)
        }
        numbers::SYS_IPC_CONNECT_KBOX => sys_ipc_connect_kbox(kernel, cur, args[0] as TaskId).map(CapHandle::raw),
        numbers::SYS_IPC_IRQ_SUBSCRIBE => raw_irq_subscribe(kernel, cur, args),
        numbers::SYS_IPC_IRQ_UNSUBSCRIBE => sys_ipc_irq_unsubscribe(kernel, cur, CapHandle::from_raw(args[0])).map(|()| 0),
        _ => {
            warn!("task {}: unknown syscall {:#x}", cur.task().id(), nr);
            Err(IpcError::NotSupported)
        }
    };
    result.unwrap_or_else(IpcError::to_retval)
}

fn write_words(cur: &Current, addr: VirtAddr, words: &[usize]) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    cur.task().address_space().write(addr, &bytes)
}

fn raw_call_sync(kernel: &Kernel, cur: &Current, args: &[usize; 6]) -> Result<usize> {
    let answer = sys_ipc_call_sync(kernel, cur, CapHandle::from_raw(args[0]), args[1], &args[2..5])?;
    write_words(cur, args[5], &answer.args[..CALL_LEN])?;
    Ok(0)
}

fn raw_forward(kernel: &Kernel, cur: &Current, args: &[usize; 6]) -> Result<usize> {
    let flags = ForwardFlags::from_bits_truncate(args[5] as u32);
    let update = flags
        .contains(ForwardFlags::REPLACE)
        .then(|| CallData::request(args[2], &args[3..5]));
    sys_ipc_forward(kernel, cur, CapHandle::from_raw(args[0]), CapHandle::from_raw(args[1]), update, flags)?;
    Ok(0)
}

fn raw_wait(kernel: &Kernel, cur: &Current, args: &[usize; 6]) -> Result<usize> {
    let timeout = match args[1] {
        0 => None,
        us => Some(Duration::from_micros(us as u64)),
    };
    let flags = SleepFlags::from_bits_truncate(args[2] as u32);
    let received = sys_ipc_wait_for_call(kernel, cur, timeout, flags)?;
    let words = received.to_words();
    write_words(cur, args[0], &words)?;
    Ok(words[0])
}

fn raw_irq_subscribe(kernel: &Kernel, cur: &Current, args: &[usize; 6]) -> Result<usize> {
    let (line, devno, method, code_ptr, code_len) = (args[0], args[1], args[2], args[3], args[4]);
    let code = match code_len {
        0 => None,
        len => {
            let image = cur.task().address_space().read_vec(code_ptr, len)?;
            Some(IrqCode::decode(&image, kernel.config())?)
        }
    };
    sys_ipc_irq_subscribe(kernel, cur, line, devno, method, code).map(CapHandle::raw)
}
