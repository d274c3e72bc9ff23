//! Bulk data transfer
//!
//! Payloads too large for the call vector travel through a kernel buffer
//! owned by the call.
//!
//! | Method | Request | Answer |
//! |---|---|---|
//! | `DATA_WRITE` | ARG1 source, ARG2 size, ARG3 flags | ARG1 destination, ARG2 accepted size |
//! | `DATA_READ` | ARG1 destination, ARG2 size | ARG1 source, ARG2 size |
//!
//! The buffer is released by whichever of answer, cleanup or forget runs
//! last, so a transfer never outlives its call.

use bitflags::bitflags;
use log::trace;

use super::{fail, is_ok};
use crate::error::{IpcError, Result};
use crate::ipc::methods::MethodOps;
use crate::kernel::Kernel;
use crate::memory::KernelBuffer;
use crate::objects::{Call, Phone};
use crate::task::Task;

bitflags! {
    /// `DATA_WRITE` request flags (ARG3)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataFlags: usize {
        /// Clip an oversized payload to the transfer limit instead of failing
        const TRUNCATE = 1 << 0;
    }
}

/// Raw value of [`DataFlags::TRUNCATE`]
pub const DATA_TRUNCATE: usize = DataFlags::TRUNCATE.bits();

fn drop_buffer(call: &Call) {
    call.lock().buffer = None;
}

pub(super) struct DataWrite;

impl MethodOps for DataWrite {
    fn request_preprocess(&self, kernel: &Kernel, caller: &Task, call: &Call, _phone: &Phone) -> Result<()> {
        let request = call.request();
        let src = request.arg(1);
        let mut size = request.arg(2);
        let flags = DataFlags::from_bits_truncate(request.arg(3));
        let limit = kernel.config().data_xfer_limit;
        if size > limit {
            if !flags.contains(DataFlags::TRUNCATE) {
                return Err(IpcError::Overflow);
            }
            size = limit;
        }
        let data = caller.address_space().read_vec(src, size)?;
        let mut inner = call.lock();
        inner.request.set_arg(2, size);
        inner.buffer = Some(KernelBuffer::new(data, kernel.counters()));
        Ok(())
    }

    fn request_forget(&self, _kernel: &Kernel, call: &Call) {
        drop_buffer(call);
    }

    fn answer_preprocess(&self, _kernel: &Kernel, call: &Call, answerer: &Task) {
        let mut inner = call.lock();
        let Some(buffer) = inner.buffer.take() else {
            return;
        };
        if !is_ok(&inner.answer) {
            return;
        }
        let dst = inner.answer.arg(1);
        let size = inner.answer.arg(2);
        if size > buffer.len() {
            fail(&mut inner.answer, IpcError::Limit);
            return;
        }
        if let Err(err) = answerer.address_space().write(dst, &buffer[..size]) {
            fail(&mut inner.answer, err);
            return;
        }
        trace!("data write: {} bytes into task {} at {:#x}", size, answerer.id(), dst);
    }

    fn answer_cleanup(&self, _kernel: &Kernel, call: &Call) {
        drop_buffer(call);
    }
}

pub(super) struct DataRead;

impl MethodOps for DataRead {
    fn request_preprocess(&self, kernel: &Kernel, _caller: &Task, call: &Call, _phone: &Phone) -> Result<()> {
        if call.request().arg(2) > kernel.config().data_xfer_limit {
            return Err(IpcError::Overflow);
        }
        Ok(())
    }

    fn request_forget(&self, _kernel: &Kernel, call: &Call) {
        drop_buffer(call);
    }

    fn answer_preprocess(&self, kernel: &Kernel, call: &Call, answerer: &Task) {
        let mut inner = call.lock();
        if !is_ok(&inner.answer) {
            return;
        }
        let src = inner.answer.arg(1);
        let size = inner.answer.arg(2);
        if size > inner.request.arg(2) {
            fail(&mut inner.answer, IpcError::Limit);
            return;
        }
        match answerer.address_space().read_vec(src, size) {
            Ok(data) => inner.buffer = Some(KernelBuffer::new(data, kernel.counters())),
            Err(err) => fail(&mut inner.answer, err),
        }
    }

    fn answer_process(&self, _kernel: &Kernel, call: &Call, caller: &Task) {
        let mut inner = call.lock();
        let Some(buffer) = inner.buffer.take() else {
            return;
        };
        if !is_ok(&inner.answer) {
            return;
        }
        let dst = inner.request.arg(1);
        if let Err(err) = caller.address_space().write(dst, &buffer) {
            fail(&mut inner.answer, err);
            return;
        }
        trace!("data read: {} bytes into task {} at {:#x}", buffer.len(), caller.id(), dst);
    }

    fn answer_cleanup(&self, _kernel: &Kernel, call: &Call) {
        drop_buffer(call);
    }
}
