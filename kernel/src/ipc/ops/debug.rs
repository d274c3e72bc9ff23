//! Kernel-serviced debug requests
//!
//! A debugger connected to a task's kbox sends `DEBUG` with the operation
//! in ARG1. The kernel answers on the spot; the debugged task never sees
//! the request.

use std::sync::Arc;

use log::trace;

use crate::error::IpcError;
use crate::ipc::lifecycle;
use crate::ipc::methods::MethodOps;
use crate::kernel::Kernel;
use crate::objects::{Call, CallData, Mailbox, MailboxKind};

/// Answer: ARG1 task id, ARG2 handles in use, ARG3 outstanding calls,
/// ARG4 requests waiting on the answerbox, ARG5 wakeups of the answerbox
/// that beat a timeout or interruption
pub const DEBUG_TASK_INFO: usize = 1;
/// Request: ARG2 address, ARG3 length (at most one word)
///
/// Answer: ARG1 the bytes, little endian
pub const DEBUG_PEEK_MEM: usize = 2;

const WORD: usize = core::mem::size_of::<usize>();

pub(super) struct DebugOps;

impl DebugOps {
    fn service(kernel: &Kernel, call: &Call, kbox: &Mailbox) -> CallData {
        let Some(task) = kernel.task(kbox.owner()) else {
            return CallData::answer(IpcError::NoEntry.to_retval(), &[]);
        };
        let request = call.request();
        match request.arg(1) {
            DEBUG_TASK_INFO => CallData::answer(
                0,
                &[
                    task.id() as usize,
                    task.caps.in_use(),
                    task.active_call_count(),
                    task.answerbox().pending_requests(),
                    task.answerbox().wait_queue().ignored_wakeups(),
                ],
            ),
            DEBUG_PEEK_MEM => {
                let (addr, len) = (request.arg(2), request.arg(3));
                if len > WORD {
                    return CallData::answer(IpcError::Invalid.to_retval(), &[]);
                }
                let mut word = [0u8; WORD];
                match task.address_space().read(addr, &mut word[..len]) {
                    Ok(()) => CallData::answer(0, &[usize::from_le_bytes(word)]),
                    Err(err) => CallData::answer(err.to_retval(), &[]),
                }
            }
            _ => CallData::answer(IpcError::NotSupported.to_retval(), &[]),
        }
    }
}

impl MethodOps for DebugOps {
    fn request_process(&self, kernel: &Kernel, call: &Arc<Call>, mailbox: &Mailbox) -> bool {
        if mailbox.kind() != MailboxKind::Kbox {
            return false;
        }
        let answer = Self::service(kernel, call, mailbox);
        trace!("kbox of task {}: debug op {} -> {:#x}", mailbox.owner(), call.request().arg(1), answer.retval());
        lifecycle::answer(kernel, mailbox, call, answer);
        true
    }
}
