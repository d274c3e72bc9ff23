//! System call numbers
//!
//! IPC syscalls live in the 0x10+ range. Arguments are passed as six
//! machine words; the single return word is non-negative on success and a
//! negative errno on failure.

/// Synchronous call: (phone, method, arg1, arg2, arg3, answer_ptr)
///
/// The answer vector is written to `answer_ptr` as six little-endian words.
pub const SYS_IPC_CALL_SYNC: usize = 0x10;

/// Asynchronous call: (phone, method, arg1, arg2, arg3, arg4) -> call id
pub const SYS_IPC_CALL_ASYNC: usize = 0x11;

/// Answer a received request: (call, retval, arg1, arg2, arg3, arg4)
pub const SYS_IPC_ANSWER: usize = 0x12;

/// Forward a received request: (call, phone, method, arg1, arg2, flags)
pub const SYS_IPC_FORWARD: usize = 0x13;

/// Wait on the answerbox: (record_ptr, timeout_us, flags) -> record kind
///
/// A timeout of zero waits forever; pass `NON_BLOCKING` to poll.
pub const SYS_IPC_WAIT: usize = 0x14;

/// Interrupt one thread waiting on the caller's answerbox
pub const SYS_IPC_POKE: usize = 0x15;

/// Hang up a phone: (phone)
pub const SYS_IPC_HANGUP: usize = 0x16;

/// Hang up and free a phone handle: (phone)
pub const SYS_IPC_PHONE_RELEASE: usize = 0x17;

/// Ask for a new connection: (phone or 0 for the naming service, arg1, arg2, arg3) -> phone
pub const SYS_IPC_CONNECT_ME_TO: usize = 0x18;

/// Connect to another task's debug box: (task) -> phone
pub const SYS_IPC_CONNECT_KBOX: usize = 0x19;

/// Subscribe to an interrupt: (line, devno, method, code_ptr, code_len) -> handle
///
/// `code_len == 0` subscribes without a program.
pub const SYS_IPC_IRQ_SUBSCRIBE: usize = 0x1a;

/// Drop an interrupt subscription: (handle)
pub const SYS_IPC_IRQ_UNSUBSCRIBE: usize = 0x1b;
