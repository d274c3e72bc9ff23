//! Address-space area sharing
//!
//! `SHARE_OUT`: request ARG1 is the base of one of the caller's areas and
//! ARG2 its size; the receiver answers with ARG1 set to where it wants the
//! area mapped. `SHARE_IN` is the reverse: request ARG1 is the destination
//! in the caller, the answer's ARG1 names the receiver's source area.

use log::debug;

use super::{fail, is_ok};
use crate::error::{IpcError, Result};
use crate::ipc::methods::MethodOps;
use crate::kernel::Kernel;
use crate::objects::{Call, Phone};
use crate::task::Task;

fn check_size(call: &Call) -> Result<()> {
    if call.request().arg(2) == 0 {
        return Err(IpcError::Invalid);
    }
    Ok(())
}

pub(super) struct ShareOut;

impl MethodOps for ShareOut {
    fn request_preprocess(&self, _kernel: &Kernel, _caller: &Task, call: &Call, _phone: &Phone) -> Result<()> {
        check_size(call)
    }

    fn answer_preprocess(&self, kernel: &Kernel, call: &Call, answerer: &Task) {
        let mut inner = call.lock();
        if !is_ok(&inner.answer) {
            return;
        }
        let Some(caller) = call.sender().and_then(|id| kernel.task(id)) else {
            fail(&mut inner.answer, IpcError::HungUp);
            return;
        };
        let (src, size, dst) = (inner.request.arg(1), inner.request.arg(2), inner.answer.arg(1));
        match caller
            .address_space()
            .share_area(src, size, answerer.address_space(), dst)
        {
            Ok(()) => debug!("task {} shared {:#x}+{:#x} to task {} at {:#x}", caller.id(), src, size, answerer.id(), dst),
            Err(err) => fail(&mut inner.answer, err),
        }
    }
}

pub(super) struct ShareIn;

impl MethodOps for ShareIn {
    fn request_preprocess(&self, _kernel: &Kernel, _caller: &Task, call: &Call, _phone: &Phone) -> Result<()> {
        check_size(call)
    }

    fn answer_preprocess(&self, kernel: &Kernel, call: &Call, answerer: &Task) {
        let mut inner = call.lock();
        if !is_ok(&inner.answer) {
            return;
        }
        let Some(caller) = call.sender().and_then(|id| kernel.task(id)) else {
            fail(&mut inner.answer, IpcError::HungUp);
            return;
        };
        let (dst, size, src) = (inner.request.arg(1), inner.request.arg(2), inner.answer.arg(1));
        match answerer
            .address_space()
            .share_area(src, size, caller.address_space(), dst)
        {
            Ok(()) => debug!("task {} shared {:#x}+{:#x} to task {} at {:#x}", answerer.id(), src, size, caller.id(), dst),
            Err(err) => fail(&mut inner.answer, err),
        }
    }
}
