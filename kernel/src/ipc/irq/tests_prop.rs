//! Property tests for IRQ program validation and execution

use std::sync::Mutex;

use proptest::prelude::*;

use super::code::{IrqCmd, IrqCode, IrqCmdType, IrqOwnership, PioRange, Scratch, CMD_LAST};
use super::pio::PioBus;
use crate::config::IpcConfig;
use crate::objects::CALL_LEN;

const BASE: u64 = 0x60;
const SIZE: u64 = 4;

/// Bus that records every access as `(addr, width)`
#[derive(Default)]
struct RecordingBus {
    accesses: Mutex<Vec<(u64, u64)>>,
    value: u32,
}

impl RecordingBus {
    fn record(&self, addr: u64, width: u64) {
        self.accesses.lock().unwrap().push((addr, width));
    }
}

impl PioBus for RecordingBus {
    fn read8(&self, addr: u64) -> u8 {
        self.record(addr, 1);
        self.value as u8
    }

    fn read16(&self, addr: u64) -> u16 {
        self.record(addr, 2);
        self.value as u16
    }

    fn read32(&self, addr: u64) -> u32 {
        self.record(addr, 4);
        self.value
    }

    fn write8(&self, addr: u64, _value: u8) {
        self.record(addr, 1);
    }

    fn write16(&self, addr: u64, _value: u16) {
        self.record(addr, 2);
    }

    fn write32(&self, addr: u64, _value: u32) {
        self.record(addr, 4);
    }
}

fn arb_cmd() -> impl Strategy<Value = IrqCmd> {
    (
        0..CMD_LAST + 2,
        BASE - 2..BASE + SIZE + 2,
        0u32..6,
        0..CALL_LEN as u32 + 1,
        0..CALL_LEN as u32 + 1,
    )
        .prop_map(|(opcode, addr, value, srcarg, dstarg)| IrqCmd {
            opcode,
            addr,
            value,
            srcarg,
            dstarg,
        })
}

fn arb_code() -> impl Strategy<Value = IrqCode> {
    prop::collection::vec(arb_cmd(), 0..12).prop_map(|cmds| IrqCode::new(vec![PioRange { base: BASE, size: SIZE }], cmds))
}

proptest! {
    #[test]
    fn accepted_programs_stay_inside_their_ranges(code in arb_code(), value in any::<u32>()) {
        let config = IpcConfig::default();
        let Ok(program) = code.check(&config) else {
            return Ok(());
        };
        let bus = RecordingBus { value, ..RecordingBus::default() };
        let mut scratch = Scratch::default();
        let outcome = program.run(&bus, &mut scratch);
        prop_assert!(matches!(outcome, IrqOwnership::Accept | IrqOwnership::Decline));
        for (addr, width) in bus.accesses.lock().unwrap().iter() {
            prop_assert!(*addr >= BASE && addr + width <= BASE + SIZE, "access {:#x}+{} escaped", addr, width);
        }
    }

    #[test]
    fn check_rejects_exactly_the_bad_commands(code in arb_code()) {
        let config = IpcConfig::default();
        let count = code.cmds.len();
        let bad = code.cmds.iter().enumerate().any(|(i, cmd)| {
            let Ok(op) = IrqCmdType::try_from(cmd.opcode) else {
                return true;
            };
            let io_escapes = op
                .access_width()
                .is_some_and(|w| cmd.addr < BASE || cmd.addr + w > BASE + SIZE);
            cmd.srcarg as usize >= CALL_LEN
                || cmd.dstarg as usize >= CALL_LEN
                || (op == IrqCmdType::Predicate && i + 1 + cmd.value as usize > count)
                || io_escapes
        });
        prop_assert_eq!(code.check(&config).is_err(), bad);
    }

    #[test]
    fn decoding_arbitrary_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let config = IpcConfig::default();
        if let Ok(code) = IrqCode::decode(&bytes, &config) {
            prop_assert_eq!(code.encode(), bytes);
        }
    }
}
