//! Connection establishment
//!
//! Two ways to create a phone over IPC:
//!
//! - **Connect me to**: the caller asks the receiver to accept a new
//!   connection. The caller's handle and phone are reserved up front so the
//!   answer can never fail for lack of a slot; on a positive answer the
//!   phone is connected to whichever mailbox finally answered (forwarding
//!   included) and the handle is published in ARG5 of the answer.
//! - **Connect to me**: the caller offers a callback connection. The
//!   receiver gets a phone to the caller's answerbox the moment it takes the
//!   request, in ARG5 of the request; a negative answer takes it back, and
//!   so does forwarding the request, since each receiver gets its own.

use std::sync::Arc;

use log::debug;

use super::{fail, is_ok};
use crate::error::{IpcError, Result};
use crate::ipc::lifecycle::{self, phone_connect, slam_phone};
use crate::ipc::methods::MethodOps;
use crate::kernel::Kernel;
use crate::objects::{Call, CallData, CallPrivate, KernelObject, Mailbox, Phone, PhoneRef, PhoneState};
use crate::task::Task;

fn take_private(call: &Call) -> CallPrivate {
    core::mem::take(&mut call.lock().private)
}

/// Undo a reservation: cut the phone off, free the handle, drop the phone
fn release(kernel: &Kernel, private: CallPrivate) {
    if let CallPrivate::Reserved { owner, handle, phone } = private {
        slam_phone(kernel, phone);
        if let Some(task) = kernel.task(owner) {
            task.caps.free(handle);
        }
        kernel.phones.remove(phone);
    }
}

pub(super) struct ConnectMeTo;

impl MethodOps for ConnectMeTo {
    fn request_preprocess(&self, kernel: &Kernel, caller: &Task, call: &Call, _phone: &Phone) -> Result<()> {
        let handle = caller.caps.alloc()?;
        let (phone, reserved) = kernel.phones.insert(Phone::new(caller.id()));
        reserved.lock().state = PhoneState::Connecting;
        call.lock().private = CallPrivate::Reserved {
            owner: caller.id(),
            handle,
            phone,
        };
        Ok(())
    }

    fn request_forget(&self, kernel: &Kernel, call: &Call) {
        release(kernel, take_private(call));
    }

    fn answer_preprocess(&self, kernel: &Kernel, call: &Call, _answerer: &Task) {
        let (phone, target) = {
            let inner = call.lock();
            if !is_ok(&inner.answer) {
                return;
            }
            match (&inner.private, inner.callee) {
                (CallPrivate::Reserved { phone, .. }, Some(target)) => (*phone, target),
                _ => return,
            }
        };
        if let Err(err) = phone_connect(kernel, phone, target) {
            fail(&mut call.lock().answer, err);
        }
    }

    fn answer_process(&self, kernel: &Kernel, call: &Call, caller: &Task) {
        let private = take_private(call);
        let CallPrivate::Reserved { handle, phone, .. } = private else {
            return;
        };
        let connected = is_ok(&call.answer())
            && kernel.phones.get(phone).is_some_and(|p| p.state() == PhoneState::Connected);
        if connected {
            match caller.caps.publish(handle, KernelObject::Phone(phone)) {
                Ok(()) => {
                    debug!("task {}: new connection {:?}", caller.id(), handle);
                    call.lock().answer.set_arg(5, handle.raw());
                    return;
                }
                Err(err) => fail(&mut call.lock().answer, err),
            }
        }
        release(kernel, private);
    }

    fn answer_cleanup(&self, kernel: &Kernel, call: &Call) {
        release(kernel, take_private(call));
    }
}

pub(super) struct ConnectToMe;

impl ConnectToMe {
    /// Give the receiver a published phone to the caller's answerbox
    fn offer(kernel: &Kernel, call: &Call, receiver: &Task) -> Result<()> {
        let caller = call.sender().and_then(|id| kernel.task(id)).ok_or(IpcError::HungUp)?;
        let handle = receiver.caps.alloc()?;
        let (phone, _) = kernel.phones.insert(Phone::new(receiver.id()));
        let published = phone_connect(kernel, phone, caller.answerbox_ref())
            .and_then(|()| receiver.caps.publish(handle, KernelObject::Phone(phone)));
        if let Err(err) = published {
            slam_phone(kernel, phone);
            receiver.caps.free(handle);
            kernel.phones.remove(phone);
            return Err(err);
        }
        let mut inner = call.lock();
        inner.request.set_arg(5, handle.raw());
        inner.private = CallPrivate::Reserved {
            owner: receiver.id(),
            handle,
            phone,
        };
        Ok(())
    }
}

impl MethodOps for ConnectToMe {
    fn request_process(&self, kernel: &Kernel, call: &Arc<Call>, mailbox: &Mailbox) -> bool {
        let Some(receiver) = kernel.task(mailbox.owner()) else {
            return false;
        };
        match Self::offer(kernel, call, &receiver) {
            Ok(()) => false,
            Err(err) => {
                lifecycle::answer(kernel, mailbox, call, CallData::answer(err.to_retval(), &[]));
                true
            }
        }
    }

    fn request_forward(&self, kernel: &Kernel, call: &Call, forwarder: &Task) {
        if let CallPrivate::Reserved { handle, phone, .. } = take_private(call) {
            slam_phone(kernel, phone);
            let _ = forwarder.caps.remove::<PhoneRef>(handle);
            kernel.phones.remove(phone);
            call.lock().request.set_arg(5, 0);
        }
    }

    fn request_forget(&self, kernel: &Kernel, call: &Call) {
        // The receiver keeps its handle; the phone just stops working.
        if let CallPrivate::Reserved { phone, .. } = take_private(call) {
            slam_phone(kernel, phone);
        }
    }

    fn answer_preprocess(&self, kernel: &Kernel, call: &Call, answerer: &Task) {
        let private = take_private(call);
        if is_ok(&call.answer()) {
            return;
        }
        if let CallPrivate::Reserved { handle, phone, .. } = private {
            slam_phone(kernel, phone);
            let _ = answerer.caps.remove::<PhoneRef>(handle);
            kernel.phones.remove(phone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::methods::CONNECT_ME_TO;
    use crate::objects::{CallFlags, CapHandle};

    #[test]
    fn forgotten_reservation_is_released() {
        let kernel = Kernel::new(IpcConfig::default()).unwrap();
        let a = kernel.create_task("a").unwrap();
        let b = kernel.create_task("b").unwrap();
        let to_b = kernel.connect_tasks(a.task().id(), b.task().id()).unwrap();
        let phone_ref = a.task().caps.get::<PhoneRef>(to_b).unwrap();
        let phone = kernel.phones.get(phone_ref).unwrap();

        let in_use = a.task().caps.in_use();
        let call = lifecycle::call_alloc(
            &kernel,
            a.task(),
            a.task().answerbox_ref(),
            CallData::request(CONNECT_ME_TO, &[]),
            CallFlags::empty(),
        );
        ConnectMeTo.request_preprocess(&kernel, a.task(), &call, &phone).unwrap();
        assert_eq!(a.task().caps.in_use(), in_use + 1);
        let reserved = match call.lock().private {
            CallPrivate::Reserved { handle, .. } => handle,
            _ => CapHandle::NIL,
        };
        assert!(!reserved.is_nil());

        ConnectMeTo.request_forget(&kernel, &call);
        assert_eq!(a.task().caps.in_use(), in_use);
        assert!(matches!(call.lock().private, CallPrivate::None));
    }
}
