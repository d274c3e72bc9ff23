//! IRQ pseudocode
//!
//! A driver describes how to recognise and acknowledge its device's
//! interrupt as a short program. The program is checked once when the
//! driver subscribes and then runs in interrupt context without further
//! checks.
//!
//! ## Binary image (little endian)
//!
//! ```text
//! u32 rangecount
//! rangecount × { u64 base, u64 size }
//! u32 cmdcount
//! cmdcount   × { u32 opcode, u64 addr, u32 value, u32 srcarg, u32 dstarg }
//! ```

use core::convert::TryFrom;

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use crate::objects::CALL_LEN;

use super::pio::PioBus;

/// Scratch registers available to a program, one per call vector word
pub type Scratch = [u32; CALL_LEN];

/// Encoded size of one range entry
pub const RANGE_SIZE: usize = 16;
/// Encoded size of one command
pub const CMD_SIZE: usize = 24;

/// Instruction opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IrqCmdType {
    /// `scratch[dst] = read8(addr)`
    PioRead8 = 1,
    PioRead16 = 2,
    PioRead32 = 3,
    /// `write8(addr, value)`
    PioWrite8 = 4,
    PioWrite16 = 5,
    PioWrite32 = 6,
    /// `write8(addr, scratch[src])`
    PioWriteA8 = 7,
    PioWriteA16 = 8,
    PioWriteA32 = 9,
    /// `scratch[dst] = value`
    Load = 10,
    /// `scratch[dst] = scratch[src] & value`
    And = 11,
    /// skip the next `value` commands if `scratch[src] == 0`
    Predicate = 12,
    /// claim the interrupt and notify
    Accept = 13,
    /// do not claim the interrupt
    Decline = 14,
}

/// One past the last valid opcode
pub const CMD_LAST: u32 = 15;

impl TryFrom<u32> for IrqCmdType {
    type Error = IpcError;

    fn try_from(raw: u32) -> Result<Self> {
        use IrqCmdType::*;
        Ok(match raw {
            1 => PioRead8,
            2 => PioRead16,
            3 => PioRead32,
            4 => PioWrite8,
            5 => PioWrite16,
            6 => PioWrite32,
            7 => PioWriteA8,
            8 => PioWriteA16,
            9 => PioWriteA32,
            10 => Load,
            11 => And,
            12 => Predicate,
            13 => Accept,
            14 => Decline,
            _ => return Err(IpcError::Invalid),
        })
    }
}

impl IrqCmdType {
    /// Width in bytes of the I/O access, `None` if the command does no I/O
    pub fn access_width(self) -> Option<u64> {
        use IrqCmdType::*;
        match self {
            PioRead8 | PioWrite8 | PioWriteA8 => Some(1),
            PioRead16 | PioWrite16 | PioWriteA16 => Some(2),
            PioRead32 | PioWrite32 | PioWriteA32 => Some(4),
            _ => None,
        }
    }
}

/// Raw instruction as supplied by user space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqCmd {
    pub opcode: u32,
    pub addr: u64,
    pub value: u32,
    pub srcarg: u32,
    pub dstarg: u32,
}

impl IrqCmd {
    fn op(opcode: IrqCmdType) -> Self {
        Self {
            opcode: opcode as u32,
            ..Self::default()
        }
    }

    pub fn read8(addr: u64, dst: u32) -> Self {
        Self { addr, dstarg: dst, ..Self::op(IrqCmdType::PioRead8) }
    }

    pub fn read16(addr: u64, dst: u32) -> Self {
        Self { addr, dstarg: dst, ..Self::op(IrqCmdType::PioRead16) }
    }

    pub fn read32(addr: u64, dst: u32) -> Self {
        Self { addr, dstarg: dst, ..Self::op(IrqCmdType::PioRead32) }
    }

    pub fn write8(addr: u64, value: u8) -> Self {
        Self { addr, value: value as u32, ..Self::op(IrqCmdType::PioWrite8) }
    }

    pub fn write16(addr: u64, value: u16) -> Self {
        Self { addr, value: value as u32, ..Self::op(IrqCmdType::PioWrite16) }
    }

    pub fn write32(addr: u64, value: u32) -> Self {
        Self { addr, value, ..Self::op(IrqCmdType::PioWrite32) }
    }

    pub fn write_a8(addr: u64, src: u32) -> Self {
        Self { addr, srcarg: src, ..Self::op(IrqCmdType::PioWriteA8) }
    }

    pub fn write_a16(addr: u64, src: u32) -> Self {
        Self { addr, srcarg: src, ..Self::op(IrqCmdType::PioWriteA16) }
    }

    pub fn write_a32(addr: u64, src: u32) -> Self {
        Self { addr, srcarg: src, ..Self::op(IrqCmdType::PioWriteA32) }
    }

    pub fn load(value: u32, dst: u32) -> Self {
        Self { value, dstarg: dst, ..Self::op(IrqCmdType::Load) }
    }

    pub fn and(src: u32, mask: u32, dst: u32) -> Self {
        Self { srcarg: src, value: mask, dstarg: dst, ..Self::op(IrqCmdType::And) }
    }

    pub fn predicate(src: u32, skip: u32) -> Self {
        Self { srcarg: src, value: skip, ..Self::op(IrqCmdType::Predicate) }
    }

    pub fn accept() -> Self {
        Self::op(IrqCmdType::Accept)
    }

    pub fn decline() -> Self {
        Self::op(IrqCmdType::Decline)
    }
}

/// I/O range a program is permitted to touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRange {
    pub base: u64,
    pub size: u64,
}

impl PioRange {
    /// Is `[addr, addr + width)` fully inside this range
    pub fn contains(&self, addr: u64, width: u64) -> bool {
        let Some(end) = addr.checked_add(width) else {
            return false;
        };
        let Some(limit) = self.base.checked_add(self.size) else {
            return false;
        };
        addr >= self.base && end <= limit
    }
}

/// Unvalidated program as supplied by user space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrqCode {
    pub ranges: Vec<PioRange>,
    pub cmds: Vec<IrqCmd>,
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(IpcError::Invalid);
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

impl IrqCode {
    pub fn new(ranges: Vec<PioRange>, cmds: Vec<IrqCmd>) -> Self {
        Self { ranges, cmds }
    }

    /// Decode a binary program image
    ///
    /// Counts are checked against `config` before anything is allocated.
    pub fn decode(bytes: &[u8], config: &IpcConfig) -> Result<Self> {
        let mut r = Reader { bytes };

        let rangecount = r.u32()? as usize;
        if rangecount > config.irq_max_range_count {
            return Err(IpcError::Limit);
        }
        let mut ranges = Vec::with_capacity(rangecount);
        for _ in 0..rangecount {
            ranges.push(PioRange {
                base: r.u64()?,
                size: r.u64()?,
            });
        }

        let cmdcount = r.u32()? as usize;
        if cmdcount > config.irq_max_prog_size {
            return Err(IpcError::Limit);
        }
        let mut cmds = Vec::with_capacity(cmdcount);
        for _ in 0..cmdcount {
            cmds.push(IrqCmd {
                opcode: r.u32()?,
                addr: r.u64()?,
                value: r.u32()?,
                srcarg: r.u32()?,
                dstarg: r.u32()?,
            });
        }

        if !r.bytes.is_empty() {
            return Err(IpcError::Invalid);
        }
        Ok(Self { ranges, cmds })
    }

    /// Encode as a binary program image
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.ranges.len() * RANGE_SIZE + self.cmds.len() * CMD_SIZE);
        out.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for range in &self.ranges {
            out.extend_from_slice(&range.base.to_le_bytes());
            out.extend_from_slice(&range.size.to_le_bytes());
        }
        out.extend_from_slice(&(self.cmds.len() as u32).to_le_bytes());
        for cmd in &self.cmds {
            out.extend_from_slice(&cmd.opcode.to_le_bytes());
            out.extend_from_slice(&cmd.addr.to_le_bytes());
            out.extend_from_slice(&cmd.value.to_le_bytes());
            out.extend_from_slice(&cmd.srcarg.to_le_bytes());
            out.extend_from_slice(&cmd.dstarg.to_le_bytes());
        }
        out
    }

    /// Statically check the program and produce its executable form
    ///
    /// Rejects unknown opcodes, scratch indices out of range, predicates
    /// skipping past the end and any I/O access not fully inside one of the
    /// declared ranges.
    pub fn check(self, config: &IpcConfig) -> Result<IrqProgram> {
        if self.ranges.len() > config.irq_max_range_count || self.cmds.len() > config.irq_max_prog_size {
            return Err(IpcError::Limit);
        }

        let cmdcount = self.cmds.len();
        let mut insns = Vec::with_capacity(cmdcount);
        for (i, cmd) in self.cmds.iter().enumerate() {
            if cmd.opcode >= CMD_LAST {
                return Err(IpcError::Invalid);
            }
            let op = IrqCmdType::try_from(cmd.opcode)?;
            if cmd.srcarg as usize >= CALL_LEN || cmd.dstarg as usize >= CALL_LEN {
                return Err(IpcError::Invalid);
            }
            if op == IrqCmdType::Predicate && i + 1 + cmd.value as usize > cmdcount {
                return Err(IpcError::Invalid);
            }
            if let Some(width) = op.access_width() {
                if !self.ranges.iter().any(|r| r.contains(cmd.addr, width)) {
                    return Err(IpcError::Invalid);
                }
            }
            insns.push(Insn {
                op,
                addr: cmd.addr,
                value: cmd.value,
                src: cmd.srcarg as usize,
                dst: cmd.dstarg as usize,
            });
        }

        Ok(IrqProgram {
            ranges: self.ranges,
            insns,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Insn {
    op: IrqCmdType,
    addr: u64,
    value: u32,
    src: usize,
    dst: usize,
}

/// Outcome of running a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOwnership {
    Accept,
    Decline,
}

/// Validated program, ready to run in interrupt context
#[derive(Debug, Clone)]
pub struct IrqProgram {
    ranges: Vec<PioRange>,
    insns: Vec<Insn>,
}

impl IrqProgram {
    /// Declared I/O ranges
    pub fn ranges(&self) -> &[PioRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Execute against `bus`, leaving results in `scratch`
    ///
    /// Bounded by the program length, never blocks or allocates. Falling off
    /// the end declines.
    pub fn run(&self, bus: &dyn PioBus, scratch: &mut Scratch) -> IrqOwnership {
        use IrqCmdType::*;

        let mut i = 0;
        while i < self.insns.len() {
            let insn = &self.insns[i];
            match insn.op {
                PioRead8 => scratch[insn.dst] = bus.read8(insn.addr) as u32,
                PioRead16 => scratch[insn.dst] = bus.read16(insn.addr) as u32,
                PioRead32 => scratch[insn.dst] = bus.read32(insn.addr),
                PioWrite8 => bus.write8(insn.addr, insn.value as u8),
                PioWrite16 => bus.write16(insn.addr, insn.value as u16),
                PioWrite32 => bus.write32(insn.addr, insn.value),
                PioWriteA8 => bus.write8(insn.addr, scratch[insn.src] as u8),
                PioWriteA16 => bus.write16(insn.addr, scratch[insn.src] as u16),
                PioWriteA32 => bus.write32(insn.addr, scratch[insn.src]),
                Load => scratch[insn.dst] = insn.value,
                And => scratch[insn.dst] = scratch[insn.src] & insn.value,
                Predicate => {
                    if scratch[insn.src] == 0 {
                        i += insn.value as usize;
                    }
                }
                Accept => return IrqOwnership::Accept,
                Decline => return IrqOwnership::Decline,
            }
            i += 1;
        }
        IrqOwnership::Decline
    }
}
