//! Kernel context
//!
//! [`Kernel`] owns every global IPC table and is passed explicitly to every
//! operation; there is no ambient global state. A test harness can create
//! as many independent kernels as it likes.
//!
//! ## Tables
//!
//! - tasks, by id
//! - mailbox and phone arenas (generation-checked, see [`Arena`])
//! - method hooks
//! - interrupt lines
//!
//! ## Task teardown
//!
//! [`Kernel::destroy_task`] performs the IPC cleanup of a dying task:
//!
//! 1. hang up every phone the task owns
//! 2. drop its IRQ subscriptions
//! 3. close its mailboxes, slam every phone pointing at them and answer
//!    every request still in them with `HungUp`
//! 4. discard pending answers and notifications
//! 5. forget every call the task sent that is still unanswered
//! 6. retire the mailboxes and the task record

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use spin::RwLock;

use crate::config::{ConfigError, IpcConfig};
use crate::error::{IpcError, Result};
use crate::ipc::irq::{IrqOwnership, IrqTable, PioBus, SimulatedPio};
use crate::ipc::lifecycle;
use crate::ipc::methods::MethodTable;
use crate::objects::{Arena, CallData, CallId, CapHandle, CapKinds, KernelObject, Mailbox, MailboxKind, MailboxRef, Phone};
use crate::scheduler::ThreadContext;
use crate::stats::{KernelStats, StatsSnapshot};
use crate::task::{Current, Task, TaskId, TaskPerms};

/// Global IPC state
pub struct Kernel {
    config: IpcConfig,
    tasks: RwLock<BTreeMap<TaskId, Arc<Task>>>,
    pub(crate) mailboxes: Arena<Mailbox>,
    pub(crate) phones: Arena<Phone>,
    methods: MethodTable,
    irqs: IrqTable,
    bus: Arc<dyn PioBus>,
    /// Answerbox every new task gets a phone to
    naming: RwLock<Option<MailboxRef>>,
    stats: Arc<KernelStats>,
    next_task: AtomicU64,
    next_thread: AtomicU64,
    next_call: AtomicU64,
}

impl Kernel {
    /// Create a kernel backed by a simulated I/O bus
    pub fn new(config: IpcConfig) -> core::result::Result<Self, ConfigError> {
        Self::with_bus(config, Arc::new(SimulatedPio::new()))
    }

    /// Create a kernel whose IRQ programs access `bus`
    pub fn with_bus(config: IpcConfig, bus: Arc<dyn PioBus>) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "IPC kernel: {} caps/task, {} async calls/phone, {} IRQ lines",
            config.max_caps, config.max_async_calls, config.irq_lines
        );
        Ok(Self {
            irqs: IrqTable::new(config.irq_lines),
            config,
            tasks: RwLock::new(BTreeMap::new()),
            mailboxes: Arena::new(),
            phones: Arena::new(),
            methods: MethodTable::new(),
            bus,
            naming: RwLock::new(None),
            stats: Arc::new(KernelStats::new()),
            next_task: AtomicU64::new(1),
            next_thread: AtomicU64::new(1),
            next_call: AtomicU64::new(1),
        })
    }

    #[inline]
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Method hook table; user methods may be registered here
    #[inline]
    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    #[inline]
    pub(crate) fn irqs(&self) -> &IrqTable {
        &self.irqs
    }

    #[inline]
    pub(crate) fn counters(&self) -> &Arc<KernelStats> {
        &self.stats
    }

    /// Current counter values
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn next_call_id(&self) -> CallId {
        self.next_call.fetch_add(1, Ordering::Relaxed)
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Live mailboxes, including private synchronous-call boxes
    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Create a task with its mailboxes and main thread
    ///
    /// If a naming service is registered, the task starts with a phone to
    /// it (see [`Task::naming_phone`]).
    pub fn create_task(&self, name: &str) -> Result<Current> {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let (_, answerbox) = self
            .mailboxes
            .insert_with(|r| Mailbox::new(r, id, MailboxKind::Answerbox));
        let (_, kbox) = self.mailboxes.insert_with(|r| Mailbox::new(r, id, MailboxKind::Kbox));
        let task = Arc::new(Task::new(id, name, self.config.max_caps, answerbox, kbox));
        self.tasks.write().insert(id, Arc::clone(&task));

        let naming = *self.naming.read();
        if let Some(naming) = naming {
            match self.new_phone(&task, naming) {
                Ok(handle) => task.set_naming_phone(Some(handle)),
                Err(err) => warn!("task {} ({}): no naming service phone: {}", id, name, err),
            }
        }
        debug!("task {} ({}) created", id, name);
        Ok(self.spawn_thread(&task))
    }

    /// Add a thread to an existing task
    pub fn spawn_thread(&self, task: &Arc<Task>) -> Current {
        let tid = self.next_thread.fetch_add(1, Ordering::Relaxed);
        Current::new(Arc::clone(task), ThreadContext::new(tid, task.id()))
    }

    /// Make `task`'s answerbox the naming service for tasks created from now on
    pub fn set_naming_service(&self, task: TaskId) -> Result<()> {
        let task = self.task(task).ok_or(IpcError::NotFound)?;
        *self.naming.write() = Some(task.answerbox_ref());
        info!("naming service: task {} ({})", task.id(), task.name());
        Ok(())
    }

    /// Create a phone in `task`'s table connected to `target`
    pub(crate) fn new_phone(&self, task: &Task, target: MailboxRef) -> Result<CapHandle> {
        let handle = task.caps.alloc()?;
        let (phone, _) = self.phones.insert(Phone::new(task.id()));
        let connected = lifecycle::phone_connect(self, phone, target)
            .and_then(|()| task.caps.publish(handle, KernelObject::Phone(phone)));
        if let Err(err) = connected {
            lifecycle::slam_phone(self, phone);
            task.caps.free(handle);
            self.phones.remove(phone);
            return Err(err);
        }
        Ok(handle)
    }

    /// Connect `from` directly to `to`'s answerbox
    ///
    /// Used to wire up the initial tasks before any naming service runs.
    pub fn connect_tasks(&self, from: TaskId, to: TaskId) -> Result<CapHandle> {
        let from = self.task(from).ok_or(IpcError::NotFound)?;
        let to = self.task(to).ok_or(IpcError::NotFound)?;
        self.new_phone(&from, to.answerbox_ref())
    }

    /// Connect `from` to `to`'s kernel-serviced debug box
    pub fn connect_kbox(&self, from: TaskId, to: TaskId) -> Result<CapHandle> {
        let from = self.task(from).ok_or(IpcError::NotFound)?;
        if !from.perms().contains(TaskPerms::DEBUG) {
            return Err(IpcError::Permission);
        }
        let to = self.task(to).ok_or(IpcError::NotFound)?;
        self.new_phone(&from, to.kbox().self_ref())
    }

    /// Grant privileges to a task
    pub fn grant(&self, task: TaskId, perms: TaskPerms) -> Result<()> {
        self.task(task).ok_or(IpcError::NotFound)?.grant(perms);
        Ok(())
    }

    /// Deliver an interrupt on `line` to its subscribers
    pub fn irq_dispatch(&self, line: usize) -> IrqOwnership {
        self.irqs.dispatch(line, &*self.bus, &self.stats)
    }

    /// Tear down a task's IPC state
    pub fn destroy_task(&self, id: TaskId) -> Result<()> {
        let task = self.task(id).ok_or(IpcError::NotFound)?;
        if !task.mark_dead() {
            return Ok(());
        }
        debug!("task {} ({}): IPC cleanup", id, task.name());

        for (_, object) in task.caps.drain(CapKinds::PHONE) {
            if let KernelObject::Phone(phone) = object {
                if let Err(err) = lifecycle::phone_hangup(self, phone) {
                    debug!("task {}: hangup of {:?} failed: {}", id, phone, err);
                }
                self.phones.remove(phone);
            }
        }

        for (_, object) in task.caps.drain(CapKinds::IRQ) {
            if let KernelObject::Irq(sub) = object {
                self.irqs.unsubscribe(&sub);
            }
        }

        for mbox in [task.answerbox(), task.kbox()] {
            self.close_mailbox(mbox);
        }

        // Whatever is left are handles of requests answered above.
        let _ = task.caps.drain(CapKinds::all());

        for call in task.active_snapshot() {
            lifecycle::forget(self, &call, IpcError::HungUp);
        }

        self.mailboxes.remove(task.answerbox_ref());
        self.mailboxes.remove(task.kbox().self_ref());
        {
            let mut naming = self.naming.write();
            if *naming == Some(task.answerbox_ref()) {
                *naming = None;
            }
        }
        self.tasks.write().remove(&id);
        debug!("task {} ({}) destroyed", id, task.name());
        Ok(())
    }

    fn close_mailbox(&self, mbox: &Arc<Mailbox>) {
        let closed = mbox.close();
        for phone in closed.connected_phones {
            lifecycle::slam_phone(self, phone);
        }
        for call in closed.calls.iter().chain(closed.dispatched.iter()) {
            lifecycle::answer(self, mbox, call, CallData::answer(IpcError::HungUp.to_retval(), &[]));
        }
        for call in closed.answers {
            let method = call.lock().request_method;
            self.methods.get(method).answer_cleanup(self, &call);
        }
        for notif in closed.irq_notifs {
            notif.recycle();
        }
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("tasks", &self.task_count())
            .field("mailboxes", &self.mailboxes.len())
            .field("phones", &self.phones.len())
            .field("methods", &self.methods)
            .finish()
    }
}
