//! Capability Table
//!
//! Each task owns one capability table mapping small opaque handles to the
//! kernel objects the task may use: connections, in-flight calls it has
//! received and interrupt subscriptions.
//!
//! ## Handle layout
//!
//! ```text
//!  63  62          32 31                     0
//! ┌───┬──────────────┬────────────────────────┐
//! │ 0 │  generation  │     slot index + 1     │
//! └───┴──────────────┴────────────────────────┘
//! ```
//!
//! The generation is bumped every time a slot is freed, so a handle a task
//! forgot to drop can never silently name an object created later in the
//! same slot. Handle `0` is never valid.
//!
//! ## Slot lifecycle
//!
//! `Free → Reserved → Published → (Reserved →) Free`
//!
//! A slot can be reserved before its object exists (e.g. a connection that
//! is still being negotiated) and only becomes visible to lookups once
//! published.

use core::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;
use static_assertions::const_assert;

use super::call::Call;
use super::phone::PhoneRef;
use crate::error::{IpcError, Result};
use crate::ipc::irq::IrqSubscription;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = 0x7fff_ffff;

// Handles travel in one syscall word.
const_assert!(core::mem::size_of::<usize>() >= core::mem::size_of::<u64>());

/// Opaque per-task capability handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapHandle(u64);

impl CapHandle {
    /// The never-valid handle
    pub const NIL: CapHandle = CapHandle(0);

    fn new(index: u32, generation: u32) -> Self {
        CapHandle((((generation & GENERATION_MASK) as u64) << INDEX_BITS) | (index as u64 + 1))
    }

    /// Rebuild a handle from a syscall word
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        CapHandle(raw as u64)
    }

    /// Encode as a syscall word
    #[inline]
    pub const fn raw(self) -> usize {
        self.0 as usize
    }

    fn index(self) -> Option<usize> {
        match self.0 & INDEX_MASK {
            0 => None,
            n => Some((n - 1) as usize),
        }
    }

    fn generation(self) -> u32 {
        (self.0 >> INDEX_BITS) as u32 & GENERATION_MASK
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.0 & INDEX_MASK == 0
    }
}

impl fmt::Debug for CapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "CapHandle({}@{})", index, self.generation()),
            None => write!(f, "CapHandle(nil)"),
        }
    }
}

/// Kinds of objects a capability can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    Phone,
    Call,
    Irq,
}

bitflags! {
    /// Set of capability kinds, used to select entries in bulk
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapKinds: u8 {
        const PHONE = 1 << 0;
        const CALL = 1 << 1;
        const IRQ = 1 << 2;
    }
}

impl From<CapKind> for CapKinds {
    fn from(kind: CapKind) -> Self {
        match kind {
            CapKind::Phone => CapKinds::PHONE,
            CapKind::Call => CapKinds::CALL,
            CapKind::Irq => CapKinds::IRQ,
        }
    }
}

/// Kernel object named by a capability
#[derive(Clone)]
pub enum KernelObject {
    Phone(PhoneRef),
    Call(Arc<Call>),
    Irq(Arc<IrqSubscription>),
}

impl KernelObject {
    pub fn kind(&self) -> CapKind {
        match self {
            KernelObject::Phone(_) => CapKind::Phone,
            KernelObject::Call(_) => CapKind::Call,
            KernelObject::Irq(_) => CapKind::Irq,
        }
    }
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelObject::Phone(phone) => write!(f, "Phone({:?})", phone),
            KernelObject::Call(call) => write!(f, "Call(#{})", call.id()),
            KernelObject::Irq(sub) => write!(f, "Irq(line {}, devno {})", sub.line(), sub.devno()),
        }
    }
}

/// Typed view of a [`KernelObject`] variant
///
/// Lets table lookups be written against the concrete object type:
/// `caps.get::<PhoneRef>(handle)`.
pub trait CapObject: Sized + Clone {
    const KIND: CapKind;

    fn wrap(self) -> KernelObject;

    fn unwrap(object: KernelObject) -> Option<Self>;
}

impl CapObject for PhoneRef {
    const KIND: CapKind = CapKind::Phone;

    fn wrap(self) -> KernelObject {
        KernelObject::Phone(self)
    }

    fn unwrap(object: KernelObject) -> Option<Self> {
        match object {
            KernelObject::Phone(phone) => Some(phone),
            _ => None,
        }
    }
}

impl CapObject for Arc<Call> {
    const KIND: CapKind = CapKind::Call;

    fn wrap(self) -> KernelObject {
        KernelObject::Call(self)
    }

    fn unwrap(object: KernelObject) -> Option<Self> {
        match object {
            KernelObject::Call(call) => Some(call),
            _ => None,
        }
    }
}

impl CapObject for Arc<IrqSubscription> {
    const KIND: CapKind = CapKind::Irq;

    fn wrap(self) -> KernelObject {
        KernelObject::Irq(self)
    }

    fn unwrap(object: KernelObject) -> Option<Self> {
        match object {
            KernelObject::Irq(sub) => Some(sub),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Free,
    Reserved,
    Published(KernelObject),
}

#[derive(Debug)]
struct CapSlot {
    generation: u32,
    state: SlotState,
}

#[derive(Debug)]
struct CapTableInner {
    slots: Vec<CapSlot>,
    free: Vec<u32>,
    in_use: usize,
}

/// Per-task capability table
#[derive(Debug)]
pub struct CapTable {
    capacity: usize,
    inner: Mutex<CapTableInner>,
}

impl CapTableInner {
    fn slot(&self, handle: CapHandle) -> Result<&CapSlot> {
        let index = handle.index().ok_or(IpcError::NotFound)?;
        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation() => Ok(slot),
            _ => Err(IpcError::NotFound),
        }
    }

    fn slot_mut(&mut self, handle: CapHandle) -> Result<&mut CapSlot> {
        let index = handle.index().ok_or(IpcError::NotFound)?;
        match self.slots.get_mut(index) {
            Some(slot) if slot.generation == handle.generation() => Ok(slot),
            _ => Err(IpcError::NotFound),
        }
    }

    fn release(&mut self, handle: CapHandle) {
        if let Some(index) = handle.index() {
            let slot = &mut self.slots[index];
            slot.state = SlotState::Free;
            slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
            self.free.push(index as u32);
            self.in_use -= 1;
        }
    }
}

impl CapTable {
    /// Create an empty table holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CapTableInner {
                slots: Vec::new(),
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// Reserve a handle without publishing an object under it
    pub fn alloc(&self) -> Result<CapHandle> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None if inner.slots.len() < self.capacity => {
                inner.slots.push(CapSlot {
                    generation: 0,
                    state: SlotState::Free,
                });
                (inner.slots.len() - 1) as u32
            }
            None => return Err(IpcError::Limit),
        };
        let slot = &mut inner.slots[index as usize];
        slot.state = SlotState::Reserved;
        let handle = CapHandle::new(index, slot.generation);
        inner.in_use += 1;
        Ok(handle)
    }

    /// Make an object visible under a reserved handle
    pub fn publish(&self, handle: CapHandle, object: KernelObject) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        match slot.state {
            SlotState::Reserved => {
                slot.state = SlotState::Published(object);
                Ok(())
            }
            SlotState::Published(_) => Err(IpcError::Exists),
            SlotState::Free => Err(IpcError::NotFound),
        }
    }

    /// Reserve and publish in one step
    pub fn insert(&self, object: KernelObject) -> Result<CapHandle> {
        let handle = self.alloc()?;
        // Cannot fail: the slot was reserved above and nobody else knows the handle.
        self.publish(handle, object)?;
        Ok(handle)
    }

    /// Release a reserved (unpublished) handle
    pub fn free(&self, handle: CapHandle) {
        let mut inner = self.inner.lock();
        let reserved = matches!(inner.slot(handle).map(|s| &s.state), Ok(SlotState::Reserved));
        if reserved {
            inner.release(handle);
        }
    }

    /// Look up a published object of the expected kind
    pub fn get<T: CapObject>(&self, handle: CapHandle) -> Result<T> {
        let inner = self.inner.lock();
        match &inner.slot(handle)?.state {
            SlotState::Published(object) if object.kind() == T::KIND => {
                T::unwrap(object.clone()).ok_or(IpcError::WrongKind)
            }
            SlotState::Published(_) => Err(IpcError::WrongKind),
            _ => Err(IpcError::NotFound),
        }
    }

    /// Unpublish and free in one step
    pub fn remove<T: CapObject>(&self, handle: CapHandle) -> Result<T> {
        let mut inner = self.inner.lock();
        let object = match &inner.slot(handle)?.state {
            SlotState::Published(object) if object.kind() == T::KIND => object.clone(),
            SlotState::Published(_) => return Err(IpcError::WrongKind),
            _ => return Err(IpcError::NotFound),
        };
        inner.release(handle);
        T::unwrap(object).ok_or(IpcError::WrongKind)
    }

    /// Remove every published entry of the selected kinds
    pub fn drain(&self, kinds: CapKinds) -> Vec<(CapHandle, KernelObject)> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        for index in 0..inner.slots.len() {
            let slot = &inner.slots[index];
            if let SlotState::Published(object) = &slot.state {
                if kinds.contains(object.kind().into()) {
                    drained.push((CapHandle::new(index as u32, slot.generation), object.clone()));
                }
            }
        }
        for (handle, _) in &drained {
            inner.release(*handle);
        }
        drained
    }

    /// Number of reserved or published entries
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Maximum number of entries
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
