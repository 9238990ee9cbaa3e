//! Cached blocks and the per-partition interval set.
//!
//! A [`Partition`] holds the cached blocks of one `(context, word size)`
//! pair, keyed by start address. Blocks never overlap. Inserting merges a
//! block with every block it overlaps or touches; invalidating splits
//! blocks at the boundaries of the invalidated range.

use std::collections::BTreeMap;
use std::ops::Range;

use super::types::MemoryByte;

/// Contiguous cached units, `word_size` flagged bytes per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    start: u64,
    word_size: u32,
    bytes: Vec<MemoryByte>,
}

impl CachedBlock {
    fn new(start: u64, word_size: u32, bytes: Vec<MemoryByte>) -> Self {
        debug_assert_eq!(bytes.len() % word_size as usize, 0);
        Self { start, word_size, bytes }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn count(&self) -> u64 {
        (self.bytes.len() / self.word_size as usize) as u64
    }

    pub fn end(&self) -> u64 {
        self.start + self.count()
    }

    pub fn bytes(&self) -> &[MemoryByte] {
        &self.bytes
    }

    /// Bytes of units `[from, to)`, which must lie inside the block.
    fn units(&self, from: u64, to: u64) -> &[MemoryByte] {
        let ws = self.word_size as usize;
        let lo = (from - self.start) as usize * ws;
        let hi = (to - self.start) as usize * ws;
        &self.bytes[lo..hi]
    }
}

/// One piece of a read request: either copied from cache or still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Resident { start: u64, bytes: Vec<MemoryByte> },
    Gap { start: u64, count: u64 },
}

impl Segment {
    pub fn start(&self) -> u64 {
        match self {
            Self::Resident { start, .. } | Self::Gap { start, .. } => *start,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }
}

/// Address-ordered, non-overlapping cached blocks of one word size.
#[derive(Debug, Clone)]
pub struct Partition {
    word_size: u32,
    blocks: BTreeMap<u64, CachedBlock>,
}

impl Partition {
    pub fn new(word_size: u32) -> Self {
        assert!(word_size > 0, "word size must be positive");
        Self { word_size, blocks: BTreeMap::new() }
    }

    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &CachedBlock> {
        self.blocks.values()
    }

    /// Unit ranges of the cached blocks, ascending.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        self.blocks.values().map(|b| b.start..b.end()).collect()
    }

    pub fn resident_units(&self) -> u64 {
        self.blocks.values().map(CachedBlock::count).sum()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Split `[start, end)` into resident copies and gaps, ascending.
    pub fn plan(&self, start: u64, end: u64) -> Vec<Segment> {
        let mut segments = Vec::new();
        if start >= end {
            return segments;
        }
        // A block starting before `start` may still cover it.
        let first = self
            .blocks
            .range(..start)
            .next_back()
            .filter(|(_, b)| b.end() > start)
            .map_or(start, |(k, _)| *k);

        let mut cursor = start;
        for block in self.blocks.range(first..end).map(|(_, b)| b) {
            if block.start > cursor {
                segments.push(Segment::Gap { start: cursor, count: block.start - cursor });
                cursor = block.start;
            }
            let until = block.end().min(end);
            segments.push(Segment::Resident {
                start: cursor,
                bytes: block.units(cursor, until).to_vec(),
            });
            cursor = until;
        }
        if cursor < end {
            segments.push(Segment::Gap { start: cursor, count: end - cursor });
        }
        segments
    }

    /// Start of the first block at or after `address`.
    pub fn next_block_start(&self, address: u64) -> Option<u64> {
        self.blocks.range(address..).next().map(|(k, _)| *k)
    }

    /// Insert `bytes` at `start`, merging with every block it overlaps or
    /// touches. New data wins where it overlaps old data.
    pub fn insert(&mut self, start: u64, bytes: Vec<MemoryByte>) {
        let ws = self.word_size as usize;
        let count = (bytes.len() / ws) as u64;
        if count == 0 {
            return;
        }
        let end = start + count;

        // Walk backwards from the last block starting at or before `end`;
        // blocks are disjoint, so ends decrease monotonically.
        let touching: Vec<u64> = self
            .blocks
            .range(..=end)
            .rev()
            .take_while(|(_, b)| b.end() >= start)
            .map(|(k, _)| *k)
            .collect();

        if touching.is_empty() {
            self.blocks.insert(start, CachedBlock::new(start, self.word_size, bytes));
            return;
        }

        let merged_start = touching.iter().copied().min().unwrap_or(start).min(start);
        let merged_end = touching
            .iter()
            .filter_map(|k| self.blocks.get(k))
            .map(CachedBlock::end)
            .max()
            .unwrap_or(end)
            .max(end);

        let mut merged = vec![MemoryByte::default(); (merged_end - merged_start) as usize * ws];
        for key in &touching {
            if let Some(old) = self.blocks.remove(key) {
                let at = (old.start - merged_start) as usize * ws;
                merged[at..at + old.bytes.len()].copy_from_slice(&old.bytes);
            }
        }
        let at = (start - merged_start) as usize * ws;
        merged[at..at + count as usize * ws].copy_from_slice(&bytes[..count as usize * ws]);
        self.blocks.insert(merged_start, CachedBlock::new(merged_start, self.word_size, merged));
    }

    /// Insert only the runs of fully readable units of `bytes`.
    pub fn insert_valid(&mut self, start: u64, bytes: &[MemoryByte]) {
        for (run_start, run) in valid_runs(start, self.word_size, bytes) {
            self.insert(run_start, run.to_vec());
        }
    }

    /// Drop `[start, end)` from the cache, keeping data on either side.
    /// Returns the number of units dropped.
    pub fn invalidate(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let overlapping: Vec<u64> = self
            .blocks
            .range(..end)
            .rev()
            .take_while(|(_, b)| b.end() > start)
            .map(|(k, _)| *k)
            .collect();

        let mut dropped = 0;
        for key in overlapping {
            let Some(block) = self.blocks.remove(&key) else { continue };
            let cut_from = block.start.max(start);
            let cut_to = block.end().min(end);
            dropped += cut_to - cut_from;
            if block.start < start {
                let left = block.units(block.start, start).to_vec();
                self.blocks.insert(block.start, CachedBlock::new(block.start, self.word_size, left));
            }
            if block.end() > end {
                let right = block.units(end, block.end()).to_vec();
                self.blocks.insert(end, CachedBlock::new(end, self.word_size, right));
            }
        }
        dropped
    }

    /// Check the ordering and disjointness invariants.
    pub fn is_consistent(&self) -> bool {
        let mut prev_end: Option<u64> = None;
        for (key, block) in &self.blocks {
            if *key != block.start || block.count() == 0 {
                return false;
            }
            if block.bytes.len() % self.word_size as usize != 0 {
                return false;
            }
            // Adjacent blocks are allowed only as split remnants; overlap never.
            if prev_end.is_some_and(|end| block.start < end) {
                return false;
            }
            prev_end = Some(block.end());
        }
        true
    }
}

/// Maximal runs of units whose bytes are all readable.
pub fn valid_runs(start: u64, word_size: u32, bytes: &[MemoryByte]) -> Vec<(u64, &[MemoryByte])> {
    let ws = word_size as usize;
    let mut runs = Vec::new();
    let mut run_from: Option<usize> = None;
    let units = bytes.len() / ws;

    for unit in 0..units {
        let readable = bytes[unit * ws..(unit + 1) * ws].iter().all(MemoryByte::is_readable);
        match (readable, run_from) {
            (true, None) => run_from = Some(unit),
            (false, Some(from)) => {
                runs.push((start + from as u64, &bytes[from * ws..unit * ws]));
                run_from = None;
            }
            _ => {}
        }
    }
    if let Some(from) = run_from {
        runs.push((start + from as u64, &bytes[from * ws..units * ws]));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(start: u64, count: u64) -> Vec<MemoryByte> {
        (start..start + count).map(|a| MemoryByte::valid(a as u8)).collect()
    }

    fn partition_with(ranges: &[(u64, u64)]) -> Partition {
        let mut p = Partition::new(1);
        for &(start, count) in ranges {
            p.insert(start, data(start, count));
        }
        p
    }

    #[test]
    fn plan_on_empty_partition_is_one_gap() {
        let p = Partition::new(1);
        assert_eq!(p.plan(10, 20), vec![Segment::Gap { start: 10, count: 10 }]);
    }

    #[test]
    fn plan_finds_gap_between_blocks() {
        let p = partition_with(&[(0, 64), (128, 64)]);
        let plan = p.plan(32, 160);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], Segment::Resident { start: 32, bytes: data(32, 32) });
        assert_eq!(plan[1], Segment::Gap { start: 64, count: 64 });
        assert_eq!(plan[2], Segment::Resident { start: 128, bytes: data(128, 32) });
    }

    #[test]
    fn plan_inside_one_block_is_fully_resident() {
        let p = partition_with(&[(0, 64)]);
        assert_eq!(p.plan(10, 20), vec![Segment::Resident { start: 10, bytes: data(10, 10) }]);
    }

    #[test]
    fn plan_with_leading_and_trailing_gaps() {
        let p = partition_with(&[(10, 5)]);
        let plan = p.plan(0, 20);
        assert_eq!(
            plan,
            vec![
                Segment::Gap { start: 0, count: 10 },
                Segment::Resident { start: 10, bytes: data(10, 5) },
                Segment::Gap { start: 15, count: 5 },
            ]
        );
    }

    #[test]
    fn insert_into_interior_gap_does_not_merge_with_distant_neighbours() {
        let mut p = partition_with(&[(0, 64), (128, 64)]);
        p.insert(80, data(80, 32));
        assert_eq!(p.ranges(), vec![0..64, 80..112, 128..192]);
        assert!(p.is_consistent());
    }

    #[test]
    fn insert_merges_adjacent_blocks() {
        let mut p = partition_with(&[(0, 64), (128, 64)]);
        p.insert(64, data(64, 64));
        assert_eq!(p.ranges(), vec![0..192]);
        let plan = p.plan(0, 192);
        assert_eq!(plan, vec![Segment::Resident { start: 0, bytes: data(0, 192) }]);
    }

    #[test]
    fn insert_overlapping_prefers_new_data() {
        let mut p = partition_with(&[(0, 16)]);
        let fresh: Vec<MemoryByte> = (0..8).map(|_| MemoryByte::valid(0xff)).collect();
        p.insert(4, fresh);
        assert_eq!(p.ranges(), vec![0..16]);
        let bytes = p.blocks().next().unwrap().bytes().to_vec();
        assert_eq!(bytes[3].value, 3);
        assert_eq!(bytes[4].value, 0xff);
        assert_eq!(bytes[11].value, 0xff);
        assert_eq!(bytes[12].value, 12);
    }

    #[test]
    fn reinserting_identical_data_is_idempotent() {
        let mut p = partition_with(&[(0, 32)]);
        let before = p.blocks().cloned().collect::<Vec<_>>();
        p.insert(8, data(8, 8));
        assert_eq!(p.blocks().cloned().collect::<Vec<_>>(), before);
    }

    #[test]
    fn invalidate_splits_at_boundaries() {
        let mut p = partition_with(&[(0, 64)]);
        assert_eq!(p.invalidate(16, 32), 16);
        assert_eq!(p.ranges(), vec![0..16, 32..64]);
        assert_eq!(p.plan(32, 33), vec![Segment::Resident { start: 32, bytes: data(32, 1) }]);
        assert!(p.is_consistent());
    }

    #[test]
    fn invalidate_spanning_several_blocks() {
        let mut p = partition_with(&[(0, 10), (20, 10), (40, 10)]);
        assert_eq!(p.invalidate(5, 45), 5 + 10 + 5);
        assert_eq!(p.ranges(), vec![0..5, 45..50]);
    }

    #[test]
    fn invalidate_outside_cached_data_is_noop() {
        let mut p = partition_with(&[(0, 10)]);
        assert_eq!(p.invalidate(10, 20), 0);
        assert_eq!(p.ranges(), vec![0..10]);
    }

    #[test]
    fn word_sized_units() {
        let mut p = Partition::new(4);
        let bytes: Vec<MemoryByte> = (0..16).map(MemoryByte::valid).collect();
        p.insert(100, bytes);
        assert_eq!(p.ranges(), vec![100..104]);
        let plan = p.plan(101, 103);
        assert_eq!(
            plan,
            vec![Segment::Resident { start: 101, bytes: (4..12).map(MemoryByte::valid).collect() }]
        );
    }

    #[test]
    fn valid_runs_skip_unreadable_units() {
        let mut bytes = data(0, 8);
        bytes[2] = MemoryByte::invalid();
        bytes[3] = MemoryByte::invalid();
        bytes[7] = MemoryByte::invalid();
        let runs = valid_runs(100, 1, &bytes);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].0, runs[0].1.len()), (100, 2));
        assert_eq!((runs[1].0, runs[1].1.len()), (104, 3));
    }

    #[test]
    fn valid_runs_consider_whole_units() {
        let mut bytes: Vec<MemoryByte> = (0..8).map(MemoryByte::valid).collect();
        bytes[5] = MemoryByte::invalid();
        let runs = valid_runs(0, 2, &bytes);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].0, runs[0].1.len()), (0, 4));
        assert_eq!((runs[1].0, runs[1].1.len()), (3, 2));
    }

    #[test]
    fn insert_valid_never_caches_invalid_units() {
        let mut p = Partition::new(1);
        let mut bytes = data(0, 4);
        bytes[1] = MemoryByte::invalid();
        p.insert_valid(0, &bytes);
        assert_eq!(p.ranges(), vec![0..1, 2..4]);
    }
}
