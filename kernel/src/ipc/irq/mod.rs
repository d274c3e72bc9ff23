//! IRQ notifications
//!
//! User-space drivers subscribe to an interrupt line with a small program
//! (see [`code`]). When the line fires, the kernel runs each subscriber's
//! program in interrupt context, in subscription order, until one accepts.
//! The accepting subscription posts a notification straight into its
//! mailbox, bypassing the normal call path.
//!
//! ## Interrupt-context constraints
//!
//! The dispatch path may not block or allocate. It therefore only ever sees
//! an [`IrqContext`], which can post one of the subscription's preallocated
//! notification calls and nothing else. The pool is filled at subscribe
//! time; when it runs dry the notification is dropped and counted.
//!
//! Unsubscribing takes the same per-line lock that dispatch holds while
//! running programs, so a program is never torn down mid-run.

pub mod code;
pub mod pio;
#[cfg(test)]
mod tests_prop;

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use crate::error::{IpcError, Result};
use crate::objects::call::NotificationPool;
use crate::objects::{Call, CallId, CallPrivate, Mailbox};
use crate::stats::KernelStats;
use crate::task::TaskId;

pub use code::{IrqCmd, IrqCmdType, IrqCode, IrqOwnership, IrqProgram, PioRange, Scratch, CMD_LAST};
pub use pio::{PioBus, SimulatedPio};

/// One driver's claim on an interrupt line
#[derive(Debug)]
pub struct IrqSubscription {
    line: usize,
    devno: usize,
    method: usize,
    owner: TaskId,
    mailbox: Arc<Mailbox>,
    program: Option<IrqProgram>,
    counter: AtomicU64,
    pool: Arc<NotificationPool>,
    pool_size: usize,
}

impl IrqSubscription {
    /// Create a subscription with `pool_size` preallocated notifications
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        line: usize,
        devno: usize,
        method: usize,
        owner: TaskId,
        mailbox: Arc<Mailbox>,
        program: Option<IrqProgram>,
        pool_size: usize,
        mut next_id: impl FnMut() -> CallId,
    ) -> Self {
        let pool = Arc::new(NotificationPool::new(pool_size));
        for _ in 0..pool_size {
            let call = Arc::new(Call::notification(next_id(), Arc::downgrade(&pool)));
            // Capacity equals the number of calls pushed.
            let _ = pool.push(call);
        }
        mailbox.reserve_notifications(pool_size);
        Self {
            line,
            devno,
            method,
            owner,
            mailbox,
            program,
            counter: AtomicU64::new(0),
            pool,
            pool_size,
        }
    }

    #[inline]
    pub fn line(&self) -> usize {
        self.line
    }

    #[inline]
    pub fn devno(&self) -> usize {
        self.devno
    }

    #[inline]
    pub fn method(&self) -> usize {
        self.method
    }

    #[inline]
    pub fn owner(&self) -> TaskId {
        self.owner
    }

    /// Accepted interrupts so far
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Notifications currently available for posting
    pub fn pool_available(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for IrqSubscription {
    fn drop(&mut self) {
        self.mailbox.release_notifications(self.pool_size);
    }
}

/// Interrupt-context view of a subscription
///
/// The only operation is posting an already-allocated notification.
pub struct IrqContext<'a> {
    sub: &'a IrqSubscription,
    stats: &'a KernelStats,
}

impl IrqContext<'_> {
    /// Post a notification carrying `scratch[1..]` as ARG1..ARG5
    ///
    /// Returns `false` if the notification had to be dropped.
    pub fn notify(&self, scratch: &Scratch) -> bool {
        let counter = self.sub.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(call) = self.sub.pool.pop() else {
            self.stats.irq_notif_dropped();
            return false;
        };
        {
            let mut inner = call.lock();
            inner.request.set_method(self.sub.method);
            for (n, word) in scratch.iter().enumerate().skip(1) {
                inner.request.set_arg(n, *word as usize);
            }
            inner.request_method = self.sub.method;
            inner.private = CallPrivate::Notification { counter };
        }
        if !self.sub.mailbox.post_notification(&call) {
            call.recycle();
            self.stats.irq_notif_dropped();
            return false;
        }
        self.stats.irq_notif_posted();
        true
    }
}

/// Per-line subscription lists
#[derive(Debug)]
pub struct IrqTable {
    lines: Vec<Mutex<Vec<Arc<IrqSubscription>>>>,
}

impl IrqTable {
    pub fn new(lines: usize) -> Self {
        Self {
            lines: (0..lines).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Attach a subscription to its line
    ///
    /// Fails with `Limit` for a line that does not exist and with `Exists`
    /// if the `(line, devno)` pair is already taken.
    pub fn subscribe(&self, sub: Arc<IrqSubscription>) -> Result<()> {
        let line = self.lines.get(sub.line).ok_or(IpcError::Limit)?;
        let mut subs = line.lock();
        if subs.iter().any(|s| s.devno == sub.devno) {
            return Err(IpcError::Exists);
        }
        debug!(
            "irq {}: task {} subscribed devno {} method {:#x}",
            sub.line, sub.owner, sub.devno, sub.method
        );
        subs.push(sub);
        Ok(())
    }

    /// Detach a subscription; waits for a concurrent dispatch on its line
    pub fn unsubscribe(&self, sub: &Arc<IrqSubscription>) -> bool {
        let Some(line) = self.lines.get(sub.line) else {
            return false;
        };
        let mut subs = line.lock();
        let before = subs.len();
        subs.retain(|s| !Arc::ptr_eq(s, sub));
        let removed = subs.len() != before;
        if removed {
            debug!("irq {}: task {} unsubscribed devno {}", sub.line, sub.owner, sub.devno);
        }
        removed
    }

    /// Offer an interrupt to the line's subscribers in order
    pub fn dispatch(&self, line: usize, bus: &dyn PioBus, stats: &KernelStats) -> IrqOwnership {
        let Some(line) = self.lines.get(line) else {
            return IrqOwnership::Decline;
        };
        let subs = line.lock();
        for sub in subs.iter() {
            let Some(program) = &sub.program else {
                continue;
            };
            let mut scratch = Scratch::default();
            if program.run(bus, &mut scratch) == IrqOwnership::Accept {
                let ctx = IrqContext { sub, stats };
                if !ctx.notify(&scratch) {
                    trace!("irq {}: notification for task {} dropped", sub.line, sub.owner);
                }
                return IrqOwnership::Accept;
            }
        }
        IrqOwnership::Decline
    }

    /// Subscribers currently attached to `line`
    pub fn subscribers(&self, line: usize) -> usize {
        self.lines.get(line).map_or(0, |l| l.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::objects::{Arena, MailboxKind, Taken};

    fn subscription(
        boxes: &Arena<Mailbox>,
        line: usize,
        devno: usize,
        program: Option<IrqProgram>,
        pool: usize,
    ) -> (Arc<Mailbox>, Arc<IrqSubscription>) {
        let (_, mbox) = boxes.insert_with(|r| Mailbox::new(r, 1, MailboxKind::Answerbox));
        let mut id = 0;
        let sub = IrqSubscription::new(line, devno, 0x77, 1, Arc::clone(&mbox), program, pool, || {
            id += 1;
            id
        });
        (mbox, Arc::new(sub))
    }

    fn accept_all() -> IrqProgram {
        IrqCode::new(vec![], vec![IrqCmd::load(9, 1), IrqCmd::accept()])
            .check(&IpcConfig::default())
            .unwrap()
    }

    #[test]
    fn duplicate_devno_rejected() {
        let boxes = Arena::new();
        let table = IrqTable::new(4);
        let (_, a) = subscription(&boxes, 2, 1, None, 1);
        let (_, b) = subscription(&boxes, 2, 1, None, 1);
        let (_, c) = subscription(&boxes, 2, 2, None, 1);
        let (_, d) = subscription(&boxes, 9, 1, None, 1);
        table.subscribe(a).unwrap();
        assert_eq!(table.subscribe(b).unwrap_err(), IpcError::Exists);
        table.subscribe(c).unwrap();
        assert_eq!(table.subscribe(d).unwrap_err(), IpcError::Limit);
        assert_eq!(table.subscribers(2), 2);
    }

    #[test]
    fn accepted_interrupt_posts_notification() {
        let boxes = Arena::new();
        let stats = KernelStats::new();
        let table = IrqTable::new(4);
        let (mbox, sub) = subscription(&boxes, 1, 0, Some(accept_all()), 2);
        table.subscribe(Arc::clone(&sub)).unwrap();

        let bus = SimulatedPio::new();
        assert_eq!(table.dispatch(1, &bus, &stats), IrqOwnership::Accept);
        match mbox.take() {
            Some(Taken::Notification(call)) => {
                let data = call.request();
                assert_eq!(data.method(), 0x77);
                assert_eq!(data.arg(1), 9);
                assert!(matches!(call.lock().private, CallPrivate::Notification { counter: 1 }));
                call.recycle();
            }
            other => panic!("expected notification, got {:?}", other),
        }
        assert_eq!(sub.pool_available(), 2);
        assert_eq!(stats.snapshot().irq_notifs_posted, 1);
    }

    #[test]
    fn empty_pool_drops_and_counts() {
        let boxes = Arena::new();
        let stats = KernelStats::new();
        let table = IrqTable::new(1);
        let (_mbox, sub) = subscription(&boxes, 0, 0, Some(accept_all()), 1);
        table.subscribe(Arc::clone(&sub)).unwrap();
        let bus = SimulatedPio::new();
        table.dispatch(0, &bus, &stats);
        table.dispatch(0, &bus, &stats);
        assert_eq!(sub.counter(), 2);
        assert_eq!(stats.snapshot().irq_notifs_dropped, 1);
    }

    #[test]
    fn shared_mailbox_room_covers_every_pool() {
        const POOL: usize = 16;
        let boxes = Arena::new();
        let stats = KernelStats::new();
        let table = IrqTable::new(2);
        let (mbox, first) = subscription(&boxes, 0, 0, Some(accept_all()), POOL);
        let mut id = 100;
        let second = Arc::new(IrqSubscription::new(1, 0, 0x78, 1, Arc::clone(&mbox), Some(accept_all()), POOL, || {
            id += 1;
            id
        }));
        table.subscribe(Arc::clone(&first)).unwrap();
        table.subscribe(Arc::clone(&second)).unwrap();
        assert_eq!(mbox.lock().notifs_reserved, 2 * POOL);

        let before = mbox.lock().irq_notifs.capacity();
        assert!(before >= 2 * POOL);
        let bus = SimulatedPio::new();
        for _ in 0..POOL {
            table.dispatch(0, &bus, &stats);
            table.dispatch(1, &bus, &stats);
        }
        assert_eq!(stats.snapshot().irq_notifs_posted, 2 * POOL);
        assert_eq!(mbox.lock().irq_notifs.capacity(), before);

        table.unsubscribe(&second);
        drop(second);
        assert_eq!(mbox.lock().notifs_reserved, POOL);
    }

    #[test]
    fn missing_program_never_claims_and_unsubscribe_detaches() {
        let boxes = Arena::new();
        let stats = KernelStats::new();
        let table = IrqTable::new(1);
        let (mbox, silent) = subscription(&boxes, 0, 0, None, 1);
        table.subscribe(Arc::clone(&silent)).unwrap();
        let bus = SimulatedPio::new();
        assert_eq!(table.dispatch(0, &bus, &stats), IrqOwnership::Decline);
        assert!(mbox.take().is_none());
        assert!(table.unsubscribe(&silent));
        assert!(!table.unsubscribe(&silent));
        assert_eq!(table.subscribers(0), 0);
    }
}
