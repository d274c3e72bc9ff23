//! Kernel-wide IPC counters

use core::sync::atomic::{AtomicUsize, Ordering};

/// Event counters, updated lock-free from any CPU
#[derive(Debug, Default)]
pub struct KernelStats {
    live_buffers: AtomicUsize,
    forget_hooks: AtomicUsize,
    calls_forgotten: AtomicUsize,
    answers_discarded: AtomicUsize,
    irq_notifs_posted: AtomicUsize,
    irq_notifs_dropped: AtomicUsize,
}

/// Point-in-time copy of [`KernelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Kernel-side transfer buffers currently allocated
    pub live_buffers: usize,
    /// Abandonment hook invocations
    pub forget_hooks: usize,
    /// Calls marked forgotten
    pub calls_forgotten: usize,
    /// Answers silently freed because their caller had forgotten them
    pub answers_discarded: usize,
    /// IRQ notifications delivered to a mailbox
    pub irq_notifs_posted: usize,
    /// IRQ notifications lost to an empty pool or a closed mailbox
    pub irq_notifs_dropped: usize,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[inline]
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl KernelStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(buffer_allocated, live_buffers);
    counter!(forget_hook_ran, forget_hooks);
    counter!(call_forgotten, calls_forgotten);
    counter!(answer_discarded, answers_discarded);
    counter!(irq_notif_posted, irq_notifs_posted);
    counter!(irq_notif_dropped, irq_notifs_dropped);

    #[inline]
    pub(crate) fn buffer_freed(&self) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live_buffers: self.live_buffers.load(Ordering::Relaxed),
            forget_hooks: self.forget_hooks.load(Ordering::Relaxed),
            calls_forgotten: self.calls_forgotten.load(Ordering::Relaxed),
            answers_discarded: self.answers_discarded.load(Ordering::Relaxed),
            irq_notifs_posted: self.irq_notifs_posted.load(Ordering::Relaxed),
            irq_notifs_dropped: self.irq_notifs_dropped.load(Ordering::Relaxed),
        }
    }
}
