//! Property tests for capability handle allocation

use proptest::prelude::*;

use super::arena::Arena;
use super::capability::{CapHandle, CapTable, KernelObject};
use super::phone::{Phone, PhoneRef};
use crate::error::IpcError;

const CAPACITY: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Insert,
    Remove(usize),
    Lookup(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Insert),
        any::<usize>().prop_map(Op::Remove),
        any::<usize>().prop_map(Op::Lookup),
    ]
}

proptest! {
    #[test]
    fn removed_handles_never_resolve_again(ops in prop::collection::vec(arb_op(), 1..64)) {
        let arena: Arena<Phone> = Arena::new();
        let (phone, _) = arena.insert(Phone::new(1));
        let caps = CapTable::new(CAPACITY);
        // Every handle ever issued, and whether it should still resolve
        let mut issued: Vec<(CapHandle, bool)> = Vec::new();

        for op in ops {
            let live = issued.iter().filter(|(_, live)| *live).count();
            match op {
                Op::Insert => match caps.insert(KernelObject::Phone(phone)) {
                    Ok(handle) => {
                        prop_assert!(live < CAPACITY);
                        prop_assert!(issued.iter().all(|(h, _)| *h != handle), "handle {:?} reissued", handle);
                        issued.push((handle, true));
                    }
                    Err(err) => {
                        prop_assert_eq!(err, IpcError::Limit);
                        prop_assert_eq!(live, CAPACITY);
                    }
                },
                Op::Remove(n) if !issued.is_empty() => {
                    let i = n % issued.len();
                    let (handle, live) = issued[i];
                    let removed = caps.remove::<PhoneRef>(handle);
                    prop_assert_eq!(removed.is_ok(), live);
                    if !live {
                        prop_assert_eq!(removed.unwrap_err(), IpcError::NotFound);
                    }
                    issued[i].1 = false;
                }
                Op::Lookup(n) if !issued.is_empty() => {
                    let (handle, live) = issued[n % issued.len()];
                    prop_assert_eq!(caps.get::<PhoneRef>(handle).is_ok(), live);
                }
                _ => {}
            }
            prop_assert_eq!(caps.in_use(), issued.iter().filter(|(_, live)| *live).count());
        }
    }
}
