//! Inter-Process Communication (IPC)
//!
//! Asynchronous, mailbox-based message passing. A task talks to another
//! task through a *phone* connected to the other task's *mailbox*; every
//! message is a *call* that eventually receives exactly one answer.
//!
//! ## IPC Model
//!
//! **Buffered calls**:
//! - The caller never rendezvouses with the receiver
//! - Requests queue on the receiver's mailbox until taken
//! - Answers queue on the caller's mailbox until taken
//!
//! **Message Passing**:
//! - Fixed call vector: method or return value plus five argument words
//! - Bulk data and memory sharing ride on system methods (see [`ops`])
//!
//! **Operations** (see [`lifecycle`]):
//! - `call_async()` / `call_sync()`: send a request
//! - `wait_for_call()`: take a request, answer or notification
//! - `answer()`: answer a delivered request
//! - `forward()`: pass a delivered request on unanswered
//! - `phone_hangup()`: close a connection
//!
//! Interrupts reach user space as notifications posted by small checked
//! programs (see [`irq`]).

pub mod irq;
pub mod lifecycle;
pub mod methods;
pub mod ops;

pub use irq::{IrqCmd, IrqCmdType, IrqCode, IrqOwnership, IrqProgram, IrqSubscription, IrqTable, PioBus, PioRange, SimulatedPio};
pub use lifecycle::{call_async, call_sync, forward, phone_hangup, wait_for_call, ForwardFlags};
pub use methods::{MethodOps, MethodTable, NullOps};
