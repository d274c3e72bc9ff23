//! Memory collaborator for the IPC core
//!
//! The IPC core does not implement paging. It needs exactly three things
//! from the virtual memory subsystem:
//! - copy bytes in and out of a task's address space (bulk data transfer),
//! - share an address-space area between two tasks (area sharing methods),
//! - kernel-owned side buffers whose lifetime can be accounted for.
//!
//! `AddressSpace` provides these over a set of byte-backed areas, enough to
//! run every IPC method in a hosted kernel.

use core::ops::Deref;
use std::collections::BTreeMap;
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::error::{IpcError, Result};
use crate::stats::KernelStats;

/// Virtual address inside a task's address space
pub type VirtAddr = usize;

#[derive(Debug, Clone)]
struct Area {
    size: usize,
    backing: Arc<Mutex<Vec<u8>>>,
}

/// A task's address space: a set of non-overlapping areas
#[derive(Debug, Default)]
pub struct AddressSpace {
    areas: RwLock<BTreeMap<VirtAddr, Area>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled area at `base`
    pub fn create_area(&self, base: VirtAddr, size: usize) -> Result<()> {
        let area = Area {
            size,
            backing: Arc::new(Mutex::new(vec![0; size])),
        };
        self.insert_area(base, area)
    }

    fn insert_area(&self, base: VirtAddr, area: Area) -> Result<()> {
        if area.size == 0 {
            return Err(IpcError::Invalid);
        }
        let end = base.checked_add(area.size).ok_or(IpcError::Invalid)?;
        let mut areas = self.areas.write();
        let overlaps_below = areas
            .range(..base)
            .next_back()
            .is_some_and(|(b, a)| b + a.size > base);
        let overlaps_above = areas.range(base..end).next().is_some();
        if overlaps_below || overlaps_above {
            return Err(IpcError::Exists);
        }
        areas.insert(base, area);
        Ok(())
    }

    /// Area fully containing `[addr, addr + len)` and the offset of `addr` in it
    fn resolve(&self, addr: VirtAddr, len: usize) -> Result<(Area, usize)> {
        let end = addr.checked_add(len).ok_or(IpcError::BadMemory)?;
        let areas = self.areas.read();
        let (base, area) = areas.range(..=addr).next_back().ok_or(IpcError::BadMemory)?;
        if end > base + area.size {
            return Err(IpcError::BadMemory);
        }
        Ok((area.clone(), addr - base))
    }

    /// Copy bytes out of the address space
    pub fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let (area, offset) = self.resolve(addr, buf.len())?;
        let backing = area.backing.lock();
        buf.copy_from_slice(&backing[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copy `len` bytes out of the address space into a new vector
    pub fn read_vec(&self, addr: VirtAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Copy bytes into the address space
    pub fn write(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let (area, offset) = self.resolve(addr, data.len())?;
        let mut backing = area.backing.lock();
        backing[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Share the area starting at `src_base` into `dst` at `dst_base`
    ///
    /// Both mappings refer to the same backing store afterwards. `size` may
    /// not exceed the source area.
    pub fn share_area(&self, src_base: VirtAddr, size: usize, dst: &AddressSpace, dst_base: VirtAddr) -> Result<()> {
        let area = self.areas.read().get(&src_base).cloned().ok_or(IpcError::NotFound)?;
        if size == 0 || size > area.size {
            return Err(IpcError::Invalid);
        }
        dst.insert_area(
            dst_base,
            Area {
                size,
                backing: area.backing,
            },
        )
    }

    /// Number of areas
    pub fn area_count(&self) -> usize {
        self.areas.read().len()
    }
}

/// Kernel-owned side buffer attached to an in-flight call
///
/// Every live buffer is counted in [`KernelStats`] until dropped.
pub struct KernelBuffer {
    data: Vec<u8>,
    stats: Arc<KernelStats>,
}

impl KernelBuffer {
    pub fn new(data: Vec<u8>, stats: &Arc<KernelStats>) -> Self {
        stats.buffer_allocated();
        Self {
            data,
            stats: Arc::clone(stats),
        }
    }
}

impl Deref for KernelBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for KernelBuffer {
    fn drop(&mut self) {
        self.stats.buffer_freed();
    }
}

impl core::fmt::Debug for KernelBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelBuffer({} bytes)", self.data.len())
    }
}
