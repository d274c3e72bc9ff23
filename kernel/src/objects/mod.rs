//! IPC Object Model
//!
//! All IPC resources are kernel objects reached through a task's
//! capability table or through generation-checked references.
//!
//! ## Object Types
//!
//! - **Phone**: a connection from a task to a mailbox
//! - **Mailbox**: the receiving endpoint (requests, answers, notifications)
//! - **Call**: one in-flight request and its answer
//! - **Capability table**: per-task handle namespace over the above
//!
//! Mailboxes and phones live in [`Arena`]s so that references between them
//! can outlive either side without dangling.

pub mod arena;
pub mod call;
pub mod capability;
pub mod mailbox;
pub mod phone;
#[cfg(test)]
mod tests_prop;

pub use arena::{Arena, ObjRef};
pub use call::{Call, CallData, CallFlags, CallId, CallPrivate, CallState, CALL_ARGS, CALL_LEN};
pub use capability::{CapHandle, CapKind, CapKinds, CapObject, CapTable, KernelObject};
pub use mailbox::{Mailbox, MailboxKind, MailboxRef, Taken};
pub use phone::{Phone, PhoneRef, PhoneState};
