//! Method Dispatch Table
//!
//! Every message method may attach hooks to the generic call lifecycle.
//! The generic call and mailbox code never looks at method numbers itself;
//! it asks the [`MethodTable`] for the method's [`MethodOps`] and runs the
//! hook for the current lifecycle point.
//!
//! | Hook | Runs when |
//! |---|---|
//! | `request_preprocess` | before the request is queued, may reject it |
//! | `request_forget` | the caller abandoned the call |
//! | `request_process` | the request is taken off the receiver's mailbox |
//! | `request_forward` | the receiver passes the request on unanswered |
//! | `answer_preprocess` | the receiver answers, before the answer is queued |
//! | `answer_process` | the caller receives the answer |
//! | `answer_cleanup` | the answer was consumed or discarded |

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use spin::RwLock;

use crate::error::{IpcError, Result};
use crate::kernel::Kernel;
use crate::objects::{Call, Mailbox, Phone};
use crate::task::Task;

/// Close a connection; sent by the kernel on hangup
pub const PHONE_HUNGUP: usize = 0xf000;
/// Ask the receiver to accept a new connection to its mailbox
pub const CONNECT_ME_TO: usize = 0xf001;
/// Offer the receiver a connection back to the caller's mailbox
pub const CONNECT_TO_ME: usize = 0xf002;
/// Share one of the caller's address-space areas with the receiver
pub const SHARE_OUT: usize = 0xf003;
/// Ask the receiver to share one of its areas with the caller
pub const SHARE_IN: usize = 0xf004;
/// Bulk copy from the caller to the receiver
pub const DATA_WRITE: usize = 0xf005;
/// Bulk copy from the receiver to the caller
pub const DATA_READ: usize = 0xf006;
/// Kernel-serviced debug request (kbox only)
pub const DEBUG: usize = 0xf007;

/// First reserved system method
pub const FIRST_SYSTEM: usize = PHONE_HUNGUP;
/// Last reserved system method
pub const LAST_SYSTEM: usize = 0xf0ff;

/// Reserved for the kernel's own sub-protocols
#[inline]
pub fn is_system(method: usize) -> bool {
    (FIRST_SYSTEM..=LAST_SYSTEM).contains(&method)
}

/// May a call with this method be forwarded
#[inline]
pub fn is_forwardable(method: usize) -> bool {
    method != PHONE_HUNGUP
}

/// Forwarding may not touch any argument of these methods
#[inline]
pub fn is_immutable(method: usize) -> bool {
    matches!(method, SHARE_OUT | SHARE_IN | DATA_WRITE | DATA_READ)
}

/// Per-method lifecycle hooks
///
/// Every hook defaults to doing nothing.
pub trait MethodOps: Send + Sync {
    /// Validate or transform a request before it is queued
    fn request_preprocess(&self, _kernel: &Kernel, _caller: &Task, _call: &Call, _phone: &Phone) -> Result<()> {
        Ok(())
    }

    /// Release whatever preprocessing acquired; the caller is gone
    fn request_forget(&self, _kernel: &Kernel, _call: &Call) {}

    /// Act on a request taken off `mailbox`
    ///
    /// Returns `true` if the kernel consumed the request itself, in which
    /// case no user receiver sees it.
    fn request_process(&self, _kernel: &Kernel, _call: &Arc<Call>, _mailbox: &Mailbox) -> bool {
        false
    }

    /// Take back what `request_process` gave a receiver that now forwards
    /// the request instead of answering it
    fn request_forward(&self, _kernel: &Kernel, _call: &Call, _forwarder: &Task) {}

    /// Release resources still held after the answer was consumed or discarded
    fn answer_cleanup(&self, _kernel: &Kernel, _call: &Call) {}

    /// Runs on the answering side before the answer is queued
    ///
    /// Runs for every answered call, user methods included, unless the
    /// caller already forgot it. The request vector is still intact.
    fn answer_preprocess(&self, _kernel: &Kernel, _call: &Call, _answerer: &Task) {}

    /// Runs on the calling side when the answer is received
    fn answer_process(&self, _kernel: &Kernel, _call: &Call, _caller: &Task) {}
}

/// Method without hooks
#[derive(Debug, Default)]
pub struct NullOps;

impl MethodOps for NullOps {}

/// Map from method number to its hooks
pub struct MethodTable {
    ops: RwLock<BTreeMap<usize, Arc<dyn MethodOps>>>,
    null: Arc<dyn MethodOps>,
}

impl MethodTable {
    /// Table with the kernel's system methods installed
    pub fn new() -> Self {
        let table = Self {
            ops: RwLock::new(BTreeMap::new()),
            null: Arc::new(NullOps),
        };
        super::ops::install(&table);
        table
    }

    pub(crate) fn install(&self, method: usize, ops: Arc<dyn MethodOps>) {
        self.ops.write().insert(method, ops);
    }

    /// Register hooks for a user method
    pub fn register(&self, method: usize, ops: Arc<dyn MethodOps>) -> Result<()> {
        if is_system(method) {
            return Err(IpcError::Permission);
        }
        let mut table = self.ops.write();
        if table.contains_key(&method) {
            return Err(IpcError::Exists);
        }
        debug!("method {:#x}: hooks registered", method);
        table.insert(method, ops);
        Ok(())
    }

    /// Hooks for `method`, the null implementation if none are registered
    pub fn get(&self, method: usize) -> Arc<dyn MethodOps> {
        self.ops
            .read()
            .get(&method)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.null))
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.ops.read().keys()).finish()
    }
}
