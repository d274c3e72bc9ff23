//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use kaal_ipc_kernel::syscall::{sys_ipc_wait_for_call, Received};
use kaal_ipc_kernel::synch::SleepFlags;
use kaal_ipc_kernel::{CapHandle, Current, IpcConfig, Kernel};

pub fn kernel() -> Kernel {
    Kernel::new(IpcConfig::default()).unwrap()
}

/// Client and server tasks, the client holding a phone to the server
pub fn pair(kernel: &Kernel) -> (Current, Current, CapHandle) {
    let client = kernel.create_task("client").unwrap();
    let server = kernel.create_task("server").unwrap();
    let phone = kernel.connect_tasks(client.task().id(), server.task().id()).unwrap();
    (client, server, phone)
}

/// Block until the next request arrives
pub fn next_request(kernel: &Kernel, cur: &Current) -> (CapHandle, usize, [usize; 5]) {
    match sys_ipc_wait_for_call(kernel, cur, Some(Duration::from_secs(10)), SleepFlags::empty()).unwrap() {
        Received::Request {
            handle, method, args, ..
        } => (handle, method, args),
        other => panic!("expected a request, got {:?}", other),
    }
}

/// Poll the answerbox without blocking
pub fn poll(kernel: &Kernel, cur: &Current) -> kaal_ipc_kernel::Result<Received> {
    sys_ipc_wait_for_call(kernel, cur, None, SleepFlags::NON_BLOCKING)
}
