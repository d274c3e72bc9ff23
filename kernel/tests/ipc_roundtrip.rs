//! End-to-end request/answer flows across tasks

mod common;

use std::sync::Arc;

use common::{kernel, next_request, pair, poll};
use kaal_ipc_kernel::error::EOK;
use kaal_ipc_kernel::ipc::methods::{CONNECT_ME_TO, DATA_READ, DATA_WRITE, DEBUG, SHARE_OUT};
use kaal_ipc_kernel::ipc::ops::{DEBUG_PEEK_MEM, DEBUG_TASK_INFO};
use kaal_ipc_kernel::ipc::{ForwardFlags, MethodOps};
use kaal_ipc_kernel::objects::Call;
use kaal_ipc_kernel::syscall::*;
use kaal_ipc_kernel::task::Task;
use kaal_ipc_kernel::{CallData, CapHandle, IpcError, Kernel, TaskPerms};

#[test]
fn sync_call_gets_the_answer() {
    let kernel = &kernel();
    let (client, server, phone) = pair(kernel);

    crossbeam::scope(|s| {
        s.spawn(move |_| {
            let (handle, method, args) = next_request(kernel, &server);
            assert_eq!(method, 7);
            assert_eq!(&args[..2], &[3, 4]);
            sys_ipc_answer(kernel, &server, handle, EOK, &[args[0] + args[1]]).unwrap();
        });

        let answer = sys_ipc_call_sync(kernel, &client, phone, 7, &[3, 4]).unwrap();
        assert_eq!(answer.retval(), EOK);
        assert_eq!(&answer.payload()[..3], &[7, 0, 0]);
    })
    .unwrap();

    assert_eq!(client.task().active_call_count(), 0);
}

#[test]
fn async_answer_arrives_on_the_answerbox() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);

    let id = sys_ipc_call_async(&kernel, &client, phone, 7, &[10, 20]).unwrap();
    assert_eq!(client.task().active_call_count(), 1);

    let Received::Request {
        handle,
        method,
        args,
        sender,
        origin,
    } = poll(&kernel, &server).unwrap()
    else {
        panic!("expected a request");
    };
    assert_eq!(method, 7);
    assert_eq!(&args[..2], &[10, 20]);
    assert_eq!(sender, client.task().id());
    assert_eq!(origin, client.task().id());

    sys_ipc_answer(&kernel, &server, handle, EOK, &[30]).unwrap();
    // The handle was consumed by the answer.
    assert_eq!(
        sys_ipc_answer(&kernel, &server, handle, EOK, &[]).unwrap_err(),
        IpcError::NotFound
    );

    match poll(&kernel, &client).unwrap() {
        Received::Answer { id: got, retval, args } => {
            assert_eq!(got, id);
            assert_eq!(retval, EOK);
            assert_eq!(args[0], 30);
        }
        other => panic!("expected an answer, got {:?}", other),
    }
    assert_eq!(client.task().active_call_count(), 0);
    assert_eq!(poll(&kernel, &client).unwrap_err(), IpcError::TimedOut);
}

#[test]
fn async_calls_are_limited_per_connection() {
    let kernel = kaal_ipc_kernel::Kernel::new(kaal_ipc_kernel::IpcConfig {
        max_async_calls: 2,
        ..Default::default()
    })
    .unwrap();
    let (client, _server, phone) = pair(&kernel);

    sys_ipc_call_async(&kernel, &client, phone, 7, &[]).unwrap();
    sys_ipc_call_async(&kernel, &client, phone, 7, &[]).unwrap();
    assert_eq!(
        sys_ipc_call_async(&kernel, &client, phone, 7, &[]).unwrap_err(),
        IpcError::Limit
    );
}

#[test]
fn forwarded_call_is_answered_by_the_final_receiver() {
    let kernel = kernel();
    let a = kernel.create_task("a").unwrap();
    let b = kernel.create_task("b").unwrap();
    let c = kernel.create_task("c").unwrap();
    let a_to_b = kernel.connect_tasks(a.task().id(), b.task().id()).unwrap();
    let b_to_c = kernel.connect_tasks(b.task().id(), c.task().id()).unwrap();

    let id = sys_ipc_call_async(&kernel, &a, a_to_b, 7, &[1, 2]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &b).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_forward(&kernel, &b, handle, b_to_c, None, ForwardFlags::empty()).unwrap();
    assert_eq!(b.task().caps.in_use(), 1);

    let Received::Request {
        handle,
        method,
        args,
        sender,
        origin,
    } = poll(&kernel, &c).unwrap()
    else {
        panic!("expected a request");
    };
    assert_eq!(method, 7);
    assert_eq!(&args[..2], &[1, 2]);
    assert_eq!(sender, a.task().id());
    assert_eq!(origin, a.task().id());
    sys_ipc_answer(&kernel, &c, handle, EOK, &[99]).unwrap();

    // B never sees the answer.
    assert_eq!(poll(&kernel, &b).unwrap_err(), IpcError::TimedOut);
    match poll(&kernel, &a).unwrap() {
        Received::Answer { id: got, retval, args } => {
            assert_eq!(got, id);
            assert_eq!(retval, EOK);
            assert_eq!(args[0], 99);
        }
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[test]
fn forward_can_replace_the_request_and_route_from_the_forwarder() {
    let kernel = kernel();
    let a = kernel.create_task("a").unwrap();
    let b = kernel.create_task("b").unwrap();
    let c = kernel.create_task("c").unwrap();
    let a_to_b = kernel.connect_tasks(a.task().id(), b.task().id()).unwrap();
    let b_to_c = kernel.connect_tasks(b.task().id(), c.task().id()).unwrap();

    sys_ipc_call_async(&kernel, &a, a_to_b, 7, &[1]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &b).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_forward(
        &kernel,
        &b,
        handle,
        b_to_c,
        Some(CallData::request(8, &[5, 6])),
        ForwardFlags::REPLACE | ForwardFlags::ROUTE_FROM_ME,
    )
    .unwrap();

    match poll(&kernel, &c).unwrap() {
        Received::Request {
            method,
            args,
            sender,
            origin,
            ..
        } => {
            assert_eq!(method, 8);
            assert_eq!(&args[..2], &[5, 6]);
            assert_eq!(sender, a.task().id());
            assert_eq!(origin, b.task().id());
        }
        other => panic!("expected a request, got {:?}", other),
    }
}

#[test]
fn failed_forward_answers_the_caller() {
    let kernel = kernel();
    let a = kernel.create_task("a").unwrap();
    let b = kernel.create_task("b").unwrap();
    let c = kernel.create_task("c").unwrap();
    let a_to_b = kernel.connect_tasks(a.task().id(), b.task().id()).unwrap();
    let b_to_c = kernel.connect_tasks(b.task().id(), c.task().id()).unwrap();
    sys_ipc_hangup(&kernel, &b, b_to_c).unwrap();

    sys_ipc_call_async(&kernel, &a, a_to_b, 7, &[]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &b).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(
        sys_ipc_forward(&kernel, &b, handle, b_to_c, None, ForwardFlags::empty()).unwrap_err(),
        IpcError::HungUp
    );

    match poll(&kernel, &a).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, IpcError::Forwarded.to_retval()),
        other => panic!("expected an answer, got {:?}", other),
    }
    assert_eq!(a.task().active_call_count(), 0);
}

#[test]
fn forward_through_a_bad_handle_still_answers() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);

    sys_ipc_call_async(&kernel, &client, phone, 7, &[]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &server).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(
        sys_ipc_forward(&kernel, &server, handle, CapHandle::from_raw(0x7777), None, ForwardFlags::empty()).unwrap_err(),
        IpcError::NotFound
    );
    match poll(&kernel, &client).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, IpcError::Forwarded.to_retval()),
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[test]
fn connect_me_to_through_the_naming_service() {
    let kernel = &kernel();
    let naming = kernel.create_task("ns").unwrap();
    kernel.set_naming_service(naming.task().id()).unwrap();
    let service = kernel.create_task("service").unwrap();
    let client = kernel.create_task("client").unwrap();
    let ns_to_service = kernel.connect_tasks(naming.task().id(), service.task().id()).unwrap();
    assert!(client.task().naming_phone().is_some());

    let service_id = service.task().id();
    crossbeam::scope(|s| {
        s.spawn(move |_| {
            let (handle, method, args) = next_request(kernel, &naming);
            assert_eq!(method, CONNECT_ME_TO);
            assert_eq!(args[0], service_id as usize);
            sys_ipc_forward(kernel, &naming, handle, ns_to_service, None, ForwardFlags::empty()).unwrap();
        });
        s.spawn(move |_| {
            let (handle, method, _) = next_request(kernel, &service);
            assert_eq!(method, CONNECT_ME_TO);
            sys_ipc_answer(kernel, &service, handle, EOK, &[]).unwrap();

            let (handle, method, args) = next_request(kernel, &service);
            assert_eq!(method, 7);
            sys_ipc_answer(kernel, &service, handle, EOK, &[args[0] * 2]).unwrap();
        });

        let phone = sys_ipc_connect_me_to(kernel, &client, None, &[service_id as usize]).unwrap();
        assert_ne!(Some(phone), client.task().naming_phone());
        let answer = sys_ipc_call_sync(kernel, &client, phone, 7, &[21]).unwrap();
        assert_eq!(answer.arg(1), 42);
    })
    .unwrap();
}

#[test]
fn refused_connection_leaves_no_phone_behind() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    let caps_before = client.task().caps.in_use();

    sys_ipc_call_async(&kernel, &client, phone, CONNECT_ME_TO, &[]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &server).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_answer(&kernel, &server, handle, IpcError::NoEntry.to_retval(), &[]).unwrap();

    match poll(&kernel, &client).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, IpcError::NoEntry.to_retval()),
        other => panic!("expected an answer, got {:?}", other),
    }
    assert_eq!(client.task().caps.in_use(), caps_before);
}

#[test]
fn data_write_copies_into_the_receiver() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    client.task().address_space().create_area(0x1000, 16).unwrap();
    client.task().address_space().write(0x1000, b"hello").unwrap();
    server.task().address_space().create_area(0x8000, 64).unwrap();

    sys_ipc_call_async(&kernel, &client, phone, DATA_WRITE, &[0x1000, 5]).unwrap();
    assert_eq!(kernel.stats().live_buffers, 1);

    let (handle, args) = match poll(&kernel, &server).unwrap() {
        Received::Request {
            handle, method, args, ..
        } => {
            assert_eq!(method, DATA_WRITE);
            (handle, args)
        }
        other => panic!("expected a request, got {:?}", other),
    };
    sys_ipc_answer(&kernel, &server, handle, EOK, &[0x8000, args[1]]).unwrap();

    let mut got = [0u8; 5];
    server.task().address_space().read(0x8000, &mut got).unwrap();
    assert_eq!(&got, b"hello");
    assert_eq!(kernel.stats().live_buffers, 0);

    match poll(&kernel, &client).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, EOK),
        other => panic!("expected an answer, got {:?}", other),
    }
}

#[test]
fn data_write_to_a_bad_destination_fails_the_answer() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    client.task().address_space().create_area(0x1000, 16).unwrap();

    sys_ipc_call_async(&kernel, &client, phone, DATA_WRITE, &[0x1000, 8]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &server).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_answer(&kernel, &server, handle, EOK, &[0xdead_0000, 8]).unwrap();

    match poll(&kernel, &client).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, IpcError::BadMemory.to_retval()),
        other => panic!("expected an answer, got {:?}", other),
    }
    assert_eq!(kernel.stats().live_buffers, 0);
}

#[test]
fn data_read_copies_into_the_caller() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    client.task().address_space().create_area(0x2000, 16).unwrap();
    server.task().address_space().create_area(0x9000, 16).unwrap();
    server.task().address_space().write(0x9000, b"world").unwrap();

    sys_ipc_call_async(&kernel, &client, phone, DATA_READ, &[0x2000, 5]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &server).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_answer(&kernel, &server, handle, EOK, &[0x9000, 5]).unwrap();

    match poll(&kernel, &client).unwrap() {
        Received::Answer { retval, .. } => assert_eq!(retval, EOK),
        other => panic!("expected an answer, got {:?}", other),
    }
    let mut got = [0u8; 5];
    client.task().address_space().read(0x2000, &mut got).unwrap();
    assert_eq!(&got, b"world");
    assert_eq!(kernel.stats().live_buffers, 0);
}

#[test]
fn share_out_maps_the_same_memory() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    client.task().address_space().create_area(0x4000, 32).unwrap();

    sys_ipc_call_async(&kernel, &client, phone, SHARE_OUT, &[0x4000, 32]).unwrap();
    let Received::Request { handle, .. } = poll(&kernel, &server).unwrap() else {
        panic!("expected a request");
    };
    sys_ipc_answer(&kernel, &server, handle, EOK, &[0xa000]).unwrap();

    server.task().address_space().write(0xa008, &[0x5a]).unwrap();
    let mut byte = [0u8];
    client.task().address_space().read(0x4008, &mut byte).unwrap();
    assert_eq!(byte[0], 0x5a);
}

#[test]
fn share_of_zero_bytes_is_rejected_at_send() {
    let kernel = kernel();
    let (client, server, phone) = pair(&kernel);
    assert_eq!(
        sys_ipc_call_async(&kernel, &client, phone, SHARE_OUT, &[0x4000, 0]).unwrap_err(),
        IpcError::Invalid
    );
    assert_eq!(poll(&kernel, &server).unwrap_err(), IpcError::TimedOut);
    assert_eq!(client.task().active_call_count(), 0);
}

#[test]
fn kbox_answers_debug_requests_inline() {
    let kernel = kernel();
    let debugger = kernel.create_task("debugger").unwrap();
    let target = kernel.create_task("target").unwrap();
    kernel.grant(debugger.task().id(), TaskPerms::DEBUG).unwrap();
    let kbox = sys_ipc_connect_kbox(&kernel, &debugger, target.task().id()).unwrap();

    let info = sys_ipc_call_sync(&kernel, &debugger, kbox, DEBUG, &[DEBUG_TASK_INFO]).unwrap();
    assert_eq!(info.retval(), EOK);
    assert_eq!(info.arg(1), target.task().id() as usize);
    assert_eq!(info.arg(4), 0);
    assert_eq!(info.arg(5), 0);

    target.task().address_space().create_area(0x5000, 8).unwrap();
    target.task().address_space().write(0x5000, &[1, 2, 3, 4]).unwrap();
    let peek = sys_ipc_call_sync(&kernel, &debugger, kbox, DEBUG, &[DEBUG_PEEK_MEM, 0x5000, 4]).unwrap();
    assert_eq!(peek.retval(), EOK);
    assert_eq!(peek.arg(1), 0x0403_0201);

    let unknown = sys_ipc_call_sync(&kernel, &debugger, kbox, DEBUG, &[0x99]).unwrap();
    assert_eq!(unknown.retval(), IpcError::NotSupported.to_retval());

    // Nothing reached the target's own answerbox.
    assert_eq!(poll(&kernel, &target).unwrap_err(), IpcError::TimedOut);
}

#[test]
fn raw_sync_call_writes_the_answer_vector() {
    let kernel = &kernel();
    let (client, server, phone) = pair(kernel);
    client.task().address_space().create_area(0x3000, 64).unwrap();

    crossbeam::scope(|s| {
        s.spawn(move |_| {
            let (handle, _, args) = next_request(kernel, &server);
            sys_ipc_answer(kernel, &server, handle, EOK, &[args[0] + 1, args[1] + 1]).unwrap();
        });

        let mut frame = SyscallFrame {
            nr: numbers::SYS_IPC_CALL_SYNC,
            args: [phone.raw(), 7, 40, 50, 0, 0x3000],
            ret: 0,
        };
        handle_syscall(kernel, &client, &mut frame);
        assert_eq!(frame.ret, 0);
    })
    .unwrap();

    const WORD: usize = core::mem::size_of::<usize>();
    let bytes = client.task().address_space().read_vec(0x3000, 6 * WORD).unwrap();
    let words: Vec<usize> = bytes
        .chunks_exact(WORD)
        .map(|w| usize::from_le_bytes(w.try_into().unwrap()))
        .collect();
    assert_eq!(&words[..3], &[EOK, 41, 51]);
}

/// Stamps the request's first argument and the answerer into the answer
struct Stamp;

impl MethodOps for Stamp {
    fn answer_preprocess(&self, _kernel: &Kernel, call: &Call, answerer: &Task) {
        let mut inner = call.lock();
        let first = inner.request.arg(1);
        inner.answer.set_arg(2, first);
        inner.answer.set_arg(3, answerer.id() as usize);
    }
}

#[test]
fn user_method_answer_hook_sees_the_request() {
    const STAMPED: usize = 300;
    let kernel = kernel();
    kernel.methods().register(STAMPED, Arc::new(Stamp)).unwrap();
    let (client, server, phone) = pair(&kernel);

    sys_ipc_call_async(&kernel, &client, phone, STAMPED, &[21]).unwrap();
    let (handle, _, _) = next_request(&kernel, &server);
    sys_ipc_answer(&kernel, &server, handle, EOK, &[1]).unwrap();

    match poll(&kernel, &client).unwrap() {
        Received::Answer { args, .. } => assert_eq!(&args[..3], &[1, 21, server.task().id() as usize]),
        other => panic!("expected an answer, got {:?}", other),
    }
}
