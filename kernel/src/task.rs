//! Tasks as seen by the IPC core
//!
//! A task bundles everything IPC needs to know about a protection domain:
//! its capability table, its answerbox, its kernel-serviced debug box, its
//! address space and the list of calls it has sent and not yet seen
//! answered.

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::memory::AddressSpace;
use crate::objects::{Call, CapHandle, CapTable, Mailbox, MailboxRef};
use crate::scheduler::{Thread, ThreadContext};

/// Kernel-wide task identifier
pub type TaskId = u64;

bitflags! {
    /// Privileges beyond plain IPC
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskPerms: u32 {
        /// May subscribe to interrupt lines
        const IRQ_REG = 1 << 0;
        /// May connect to other tasks' debug boxes
        const DEBUG = 1 << 1;
    }
}

/// IPC state of a task
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    name: String,
    /// Capability handles owned by the task
    pub caps: CapTable,
    answerbox: Arc<Mailbox>,
    kbox: Arc<Mailbox>,
    aspace: AddressSpace,
    /// Calls this task has sent that are neither answered nor forgotten
    active_calls: Mutex<Vec<Arc<Call>>>,
    /// Connection to the naming service, if one was registered
    naming_phone: Mutex<Option<CapHandle>>,
    perms: Mutex<TaskPerms>,
    alive: Mutex<bool>,
}

impl Task {
    pub(crate) fn new(id: TaskId, name: &str, max_caps: usize, answerbox: Arc<Mailbox>, kbox: Arc<Mailbox>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            caps: CapTable::new(max_caps),
            answerbox,
            kbox,
            aspace: AddressSpace::new(),
            active_calls: Mutex::new(Vec::new()),
            naming_phone: Mutex::new(None),
            perms: Mutex::new(TaskPerms::empty()),
            alive: Mutex::new(true),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn answerbox(&self) -> &Arc<Mailbox> {
        &self.answerbox
    }

    #[inline]
    pub fn answerbox_ref(&self) -> MailboxRef {
        self.answerbox.self_ref()
    }

    #[inline]
    pub fn kbox(&self) -> &Arc<Mailbox> {
        &self.kbox
    }

    #[inline]
    pub fn address_space(&self) -> &AddressSpace {
        &self.aspace
    }

    pub fn naming_phone(&self) -> Option<CapHandle> {
        *self.naming_phone.lock()
    }

    pub(crate) fn set_naming_phone(&self, handle: Option<CapHandle>) {
        *self.naming_phone.lock() = handle;
    }

    pub fn perms(&self) -> TaskPerms {
        *self.perms.lock()
    }

    pub(crate) fn grant(&self, perms: TaskPerms) {
        self.perms.lock().insert(perms);
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.lock()
    }

    /// Returns `true` for the first caller only
    ///
    /// Taken together with the active-call list lock, so no call can be
    /// added once teardown has started collecting them.
    pub(crate) fn mark_dead(&self) -> bool {
        let _active = self.active_calls.lock();
        core::mem::replace(&mut *self.alive.lock(), false)
    }

    /// Link a sent call; fails once the task is being torn down
    pub(crate) fn add_active(&self, call: &Arc<Call>) -> bool {
        let mut active = self.active_calls.lock();
        if !*self.alive.lock() {
            return false;
        }
        active.push(Arc::clone(call));
        true
    }

    pub(crate) fn remove_active(&self, call: &Arc<Call>) -> bool {
        let mut active = self.active_calls.lock();
        match active.iter().position(|c| Arc::ptr_eq(c, call)) {
            Some(pos) => {
                active.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn active_snapshot(&self) -> Vec<Arc<Call>> {
        self.active_calls.lock().clone()
    }

    /// Number of outstanding calls this task has sent
    pub fn active_call_count(&self) -> usize {
        self.active_calls.lock().len()
    }
}

/// Execution context of a kernel operation: the calling thread and its task
#[derive(Debug)]
pub struct Current {
    task: Arc<Task>,
    ctx: ThreadContext,
}

impl Current {
    pub(crate) fn new(task: Arc<Task>, ctx: ThreadContext) -> Self {
        Self { task, ctx }
    }

    #[inline]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    #[inline]
    pub fn thread(&self) -> &Arc<Thread> {
        self.ctx.thread()
    }

    #[inline]
    pub fn context(&self) -> &ThreadContext {
        &self.ctx
    }
}
