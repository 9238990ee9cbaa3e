//! Fuzz target for change-scope coalescing.
//!
//! Arbitrary ranges must coalesce into sorted, disjoint, non-adjacent ranges
//! naming exactly the addresses of the input.

#![no_main]

use std::collections::BTreeSet;

use dbg_core::memory::ChangeScope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: Vec<(u16, u8)>| {
    let ranges: Vec<_> = input
        .iter()
        .map(|&(start, len)| u64::from(start)..u64::from(start) + u64::from(len))
        .collect();
    let expected: BTreeSet<u64> = ranges.iter().flat_map(|r| r.clone()).collect();

    let scope = ChangeScope::ranges(ranges);
    let ChangeScope::Ranges(merged) = &scope else {
        panic!("ranges() produced a whole-context scope");
    };
    for pair in merged.windows(2) {
        assert!(pair[0].end < pair[1].start);
    }
    assert!(merged.iter().all(|r| r.start < r.end));

    let named: BTreeSet<u64> = scope.iter_addresses().collect();
    assert_eq!(named, expected);
    assert_eq!(scope.address_count(), Some(expected.len() as u64));
});
