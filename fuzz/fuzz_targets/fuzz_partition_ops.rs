//! Fuzz target for partition insert/invalidate sequences.
//!
//! After every operation the partition must stay ordered and disjoint, and
//! planning any range must reproduce the bytes last written there.

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use dbg_core::memory::{MemoryByte, Partition, Segment};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Insert { start: u16, len: u8, value: u8 },
    InsertWithHoles { start: u16, pattern: Vec<bool> },
    Invalidate { start: u16, len: u16 },
    Plan { start: u16, len: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut partition = Partition::new(1);
    // Reference model: unit -> value for every cached unit.
    let mut model: BTreeMap<u64, u8> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Insert { start, len, value } => {
                let start = u64::from(start);
                partition.insert(start, vec![MemoryByte::valid(value); usize::from(len)]);
                for unit in start..start + u64::from(len) {
                    model.insert(unit, value);
                }
            }
            Op::InsertWithHoles { start, pattern } => {
                let start = u64::from(start);
                let bytes: Vec<MemoryByte> = pattern
                    .iter()
                    .map(|&ok| if ok { MemoryByte::valid(7) } else { MemoryByte::invalid() })
                    .collect();
                partition.insert_valid(start, &bytes);
                for (i, ok) in pattern.iter().enumerate() {
                    if *ok {
                        model.insert(start + i as u64, 7);
                    }
                }
            }
            Op::Invalidate { start, len } => {
                let start = u64::from(start);
                let end = start + u64::from(len);
                let expected = model.range(start..end).count() as u64;
                assert_eq!(partition.invalidate(start, end), expected);
                model.retain(|unit, _| !(start..end).contains(unit));
            }
            Op::Plan { start, len } => {
                let start = u64::from(start);
                let end = start + u64::from(len);
                let mut at = start;
                for segment in partition.plan(start, end) {
                    assert_eq!(segment.start(), at);
                    match segment {
                        Segment::Resident { start, bytes } => {
                            for (i, byte) in bytes.iter().enumerate() {
                                assert_eq!(model.get(&(start + i as u64)), Some(&byte.value));
                            }
                            at += bytes.len() as u64;
                        }
                        Segment::Gap { start, count } => {
                            assert_eq!(model.range(start..start + count).count(), 0);
                            at += count;
                        }
                    }
                }
                assert_eq!(at, end);
            }
        }
        assert!(partition.is_consistent());
        assert_eq!(partition.resident_units(), model.len() as u64);
    }
});
