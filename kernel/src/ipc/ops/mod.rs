//! System method hooks
//!
//! The kernel's own sub-protocols ride on ordinary calls and are
//! implemented entirely as [`MethodOps`] hooks; the generic call path
//! knows nothing about them.

mod connect;
mod data;
mod debug;
mod share;

use std::sync::Arc;

use super::methods::{MethodOps, MethodTable, CONNECT_ME_TO, CONNECT_TO_ME, DATA_READ, DATA_WRITE, DEBUG, SHARE_IN, SHARE_OUT};
use crate::error::{IpcError, EOK};
use crate::objects::CallData;

pub use data::{DataFlags, DATA_TRUNCATE};
pub use debug::{DEBUG_PEEK_MEM, DEBUG_TASK_INFO};

/// Install the system methods into `table`
pub(crate) fn install(table: &MethodTable) {
    let entries: [(usize, Arc<dyn MethodOps>); 7] = [
        (CONNECT_ME_TO, Arc::new(connect::ConnectMeTo)),
        (CONNECT_TO_ME, Arc::new(connect::ConnectToMe)),
        (SHARE_OUT, Arc::new(share::ShareOut)),
        (SHARE_IN, Arc::new(share::ShareIn)),
        (DATA_WRITE, Arc::new(data::DataWrite)),
        (DATA_READ, Arc::new(data::DataRead)),
        (DEBUG, Arc::new(debug::DebugOps)),
    ];
    for (method, ops) in entries {
        table.install(method, ops);
    }
}

#[inline]
fn is_ok(answer: &CallData) -> bool {
    answer.retval() == EOK
}

#[inline]
fn fail(answer: &mut CallData, err: IpcError) {
    answer.set_retval(err.to_retval());
}
