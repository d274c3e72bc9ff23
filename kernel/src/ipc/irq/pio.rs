//! Programmed I/O access
//!
//! IRQ programs touch device registers only through a [`PioBus`]. On real
//! hardware this is port or MMIO access; the hosted kernel uses
//! [`SimulatedPio`], a sparse little-endian byte space.

use std::collections::BTreeMap;

use spin::Mutex;

/// Device register access usable from interrupt context
///
/// Implementations must not block or allocate on the read/write paths.
pub trait PioBus: Send + Sync {
    fn read8(&self, addr: u64) -> u8;
    fn read16(&self, addr: u64) -> u16;
    fn read32(&self, addr: u64) -> u32;
    fn write8(&self, addr: u64, value: u8);
    fn write16(&self, addr: u64, value: u16);
    fn write32(&self, addr: u64, value: u32);
}

/// Sparse simulated I/O space; unwritten locations read as zero
///
/// Registers should be preset with a write before the first interrupt, since
/// first-time writes insert into the map.
#[derive(Debug, Default)]
pub struct SimulatedPio {
    regs: Mutex<BTreeMap<u64, u8>>,
}

impl SimulatedPio {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_le<const N: usize>(&self, addr: u64) -> [u8; N] {
        let regs = self.regs.lock();
        let mut out = [0; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = regs.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        out
    }

    fn write_le(&self, addr: u64, bytes: &[u8]) {
        let mut regs = self.regs.lock();
        for (i, byte) in bytes.iter().enumerate() {
            regs.insert(addr + i as u64, *byte);
        }
    }
}

impl PioBus for SimulatedPio {
    fn read8(&self, addr: u64) -> u8 {
        self.read_le::<1>(addr)[0]
    }

    fn read16(&self, addr: u64) -> u16 {
        u16::from_le_bytes(self.read_le(addr))
    }

    fn read32(&self, addr: u64) -> u32 {
        u32::from_le_bytes(self.read_le(addr))
    }

    fn write8(&self, addr: u64, value: u8) {
        self.write_le(addr, &[value]);
    }

    fn write16(&self, addr: u64, value: u16) {
        self.write_le(addr, &value.to_le_bytes());
    }

    fn write32(&self, addr: u64, value: u32) {
        self.write_le(addr, &value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_registers() {
        let bus = SimulatedPio::new();
        bus.write32(0x10, 0xdead_beef);
        assert_eq!(bus.read8(0x10), 0xef);
        assert_eq!(bus.read16(0x12), 0xdead);
        assert_eq!(bus.read32(0x20), 0);
    }
}
