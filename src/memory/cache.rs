//! Coherent memory-block cache in front of a [`MemoryTarget`].
//!
//! Reads are split into resident segments and gaps; only gaps go to the
//! target. Writes and change notifications invalidate the affected ranges.
//!
//! The state mutex is only taken by dispatcher tasks and never held across
//! an await, so it is effectively uncontended. Each context carries a
//! generation that changes on every invalidation: a fetch that straddles an
//! invalidation is returned to its caller but not cached.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::block::{Partition, Segment};
use super::target::MemoryTarget;
use super::types::{rescale, ByteRange, ChangeScope, ContextId, MemoryByte};
use crate::error::DebugError;
use crate::telemetry;

/// Tuning for fetch planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Extra units fetched past the end of a trailing gap.
    pub read_ahead: u64,
    /// Largest single fetch; larger gaps are fetched in chunks.
    pub max_fetch_units: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { read_ahead: 0, max_fetch_units: 65536 }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    fetches: AtomicU64,
    fetched_units: AtomicU64,
    hit_units: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub fetches: u64,
    pub fetched_units: u64,
    pub hit_units: u64,
    pub invalidations: u64,
    pub blocks: usize,
    pub resident_units: u64,
}

#[derive(Debug)]
struct ContextState {
    generation: u64,
    partitions: HashMap<u32, Partition>,
}

#[derive(Debug, Default)]
struct CacheState {
    contexts: HashMap<ContextId, ContextState>,
    next_generation: u64,
}

impl CacheState {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// One downstream read.
#[derive(Debug, Clone, Copy)]
struct Fetch {
    start: u64,
    count: u64,
}

/// Memory cache shared by the operations of one session.
#[derive(Clone)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
    target: Arc<dyn MemoryTarget>,
    config: CacheConfig,
    counters: Arc<CacheCounters>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("config", &self.config).finish_non_exhaustive()
    }
}

impl MemoryCache {
    pub fn new(target: Arc<dyn MemoryTarget>, config: CacheConfig) -> Self {
        let config = CacheConfig { max_fetch_units: config.max_fetch_units.max(1), ..config };
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            target,
            config,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Start caching for `context`. Returns false if already attached.
    pub fn attach(&self, context: ContextId) -> bool {
        let mut state = self.state.lock();
        if state.contexts.contains_key(&context) {
            return false;
        }
        let generation = state.bump();
        state.contexts.insert(context, ContextState { generation, partitions: HashMap::new() });
        tracing::debug!(%context, "cache: context attached");
        true
    }

    /// Drop every block of `context` and forget it.
    pub fn detach(&self, context: ContextId) -> bool {
        let removed = self.state.lock().contexts.remove(&context).is_some();
        if removed {
            tracing::debug!(%context, "cache: context detached");
        }
        removed
    }

    pub fn is_attached(&self, context: ContextId) -> bool {
        self.state.lock().contexts.contains_key(&context)
    }

    pub fn ensure_attached(&self, context: ContextId) -> Result<(), DebugError> {
        if self.is_attached(context) {
            Ok(())
        } else {
            Err(DebugError::UnknownContext)
        }
    }

    /// Read `range`, fetching only the units not already cached.
    pub async fn read(&self, range: ByteRange) -> Result<Vec<MemoryByte>, DebugError> {
        let ws = range.word_size;
        let (generation, segments, fetches) = {
            let mut state = self.state.lock();
            let ctx = state.contexts.get_mut(&range.context).ok_or(DebugError::UnknownContext)?;
            let partition = ctx.partitions.entry(ws).or_insert_with(|| Partition::new(ws));
            let segments = partition.plan(range.start, range.end());
            let fetches = self.plan_fetches(partition, &segments, range.end());
            (ctx.generation, segments, fetches)
        };

        let hit_units: u64 = segments
            .iter()
            .map(|s| match s {
                Segment::Resident { bytes, .. } => (bytes.len() / ws as usize) as u64,
                Segment::Gap { .. } => 0,
            })
            .sum();
        let miss_units = range.count - hit_units;
        self.counters.hit_units.fetch_add(hit_units, Ordering::Relaxed);
        telemetry::record_cache_units(hit_units, miss_units);

        if fetches.is_empty() {
            return Ok(assemble(&segments, &[], ws, range.byte_len()));
        }

        tracing::debug!(
            context = %range.context,
            start = range.start,
            count = range.count,
            fetches = fetches.len(),
            "cache: fetching gaps",
        );
        let fetched = try_join_all(fetches.iter().map(|f| self.fetch(range.context, ws, *f))).await?;

        let fetched_units: u64 = fetches.iter().map(|f| f.count).sum();
        self.counters.fetches.fetch_add(fetches.len() as u64, Ordering::Relaxed);
        self.counters.fetched_units.fetch_add(fetched_units, Ordering::Relaxed);
        telemetry::record_fetches(fetches.len() as u64);

        let chunks: Vec<(u64, Vec<MemoryByte>)> =
            fetches.iter().map(|f| f.start).zip(fetched).collect();
        self.insert_fetched(range.context, ws, generation, &chunks);

        Ok(assemble(&segments, &chunks, ws, range.byte_len()))
    }

    /// Write `data` through to the target, then invalidate the range.
    ///
    /// The range is invalidated even if the target fails, since a failed
    /// write may have changed part of it.
    pub async fn write(&self, range: ByteRange, data: &[u8]) -> Result<(), DebugError> {
        self.ensure_attached(range.context)?;
        let data = data.get(..range.byte_len()).ok_or(DebugError::BufferTooShort {
            required: range.byte_len(),
            actual: data.len(),
        })?;
        let result = self.target.write(range.context, range.start, range.word_size, data).await;
        self.invalidate(range.context, range.word_size, &ChangeScope::Ranges(vec![range.units()]));
        if let Err(e) = &result {
            tracing::warn!(context = %range.context, start = range.start, error = %e, "cache: write failed");
        }
        result
    }

    /// Write `pattern`, a whole number of units, repeated across `range`.
    pub async fn fill(&self, range: ByteRange, pattern: &[u8]) -> Result<(), DebugError> {
        if pattern.is_empty() {
            return Err(DebugError::EmptyPattern);
        }
        let data: Vec<u8> = pattern.iter().copied().cycle().take(range.byte_len()).collect();
        self.write(range, &data).await
    }

    /// Drop cached data of `context` within `scope`.
    ///
    /// Ranges count units of `word_size` bytes and are applied to every
    /// partition of the context. Returns the number of units dropped;
    /// unknown contexts are ignored.
    pub fn invalidate(&self, context: ContextId, word_size: u32, scope: &ChangeScope) -> u64 {
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context) {
            return 0;
        }
        let generation = state.bump();
        let Some(ctx) = state.contexts.get_mut(&context) else {
            return 0;
        };
        ctx.generation = generation;
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);

        let dropped = match scope {
            ChangeScope::All => {
                let units = ctx.partitions.values().map(Partition::resident_units).sum();
                ctx.partitions.clear();
                units
            }
            ChangeScope::Ranges(ranges) => {
                let mut units = 0;
                for (ws, partition) in ctx.partitions.iter_mut() {
                    for range in ranges {
                        let scaled = rescale(range, word_size.max(1), *ws);
                        units += partition.invalidate(scaled.start, scaled.end);
                    }
                }
                units
            }
        };
        tracing::debug!(%context, all = scope.is_all(), dropped, "cache: invalidated");
        dropped
    }

    /// Drop everything cached for `context`.
    pub fn flush(&self, context: ContextId) -> u64 {
        self.invalidate(context, 1, &ChangeScope::All)
    }

    /// Cached unit ranges of one partition, ascending.
    pub fn block_ranges(&self, context: ContextId, word_size: u32) -> Vec<Range<u64>> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .and_then(|ctx| ctx.partitions.get(&word_size))
            .map(Partition::ranges)
            .unwrap_or_default()
    }

    /// True if every partition upholds its ordering invariants.
    pub fn is_consistent(&self) -> bool {
        self.state
            .lock()
            .contexts
            .values()
            .flat_map(|ctx| ctx.partitions.values())
            .all(Partition::is_consistent)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let partitions = state.contexts.values().flat_map(|ctx| ctx.partitions.values());
        let (blocks, resident_units) =
            partitions.fold((0, 0), |(b, u), p| (b + p.len(), u + p.resident_units()));
        CacheStats {
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            fetched_units: self.counters.fetched_units.load(Ordering::Relaxed),
            hit_units: self.counters.hit_units.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            blocks,
            resident_units,
        }
    }

    /// Turn gaps into downstream reads: extend the trailing gap by the
    /// read-ahead, then split anything above the fetch limit.
    fn plan_fetches(&self, partition: &Partition, segments: &[Segment], end: u64) -> Vec<Fetch> {
        let mut fetches = Vec::new();
        for segment in segments {
            let Segment::Gap { start, count } = *segment else { continue };
            let mut count = count;
            if start + count == end && self.config.read_ahead > 0 {
                let limit = partition.next_block_start(end).unwrap_or(u64::MAX);
                count += self.config.read_ahead.min(limit - end);
            }
            let mut at = start;
            let stop = start + count;
            while at < stop {
                let n = (stop - at).min(self.config.max_fetch_units);
                fetches.push(Fetch { start: at, count: n });
                at += n;
            }
        }
        fetches
    }

    async fn fetch(&self, context: ContextId, word_size: u32, fetch: Fetch) -> Result<Vec<MemoryByte>, DebugError> {
        let bytes = self.target.read(context, fetch.start, word_size, fetch.count).await?;
        let expected = (fetch.count * u64::from(word_size)) as usize;
        if bytes.len() != expected {
            return Err(DebugError::transport(format!(
                "target returned {} bytes for {} units at {:#x}, expected {}",
                bytes.len(),
                fetch.count,
                fetch.start,
                expected
            )));
        }
        Ok(bytes)
    }

    fn insert_fetched(
        &self,
        context: ContextId,
        word_size: u32,
        generation: u64,
        chunks: &[(u64, Vec<MemoryByte>)],
    ) {
        let mut state = self.state.lock();
        let Some(ctx) = state.contexts.get_mut(&context).filter(|c| c.generation == generation) else {
            tracing::debug!(%context, "cache: discarding fetch that raced an invalidation");
            return;
        };
        let partition = ctx.partitions.entry(word_size).or_insert_with(|| Partition::new(word_size));
        for (start, bytes) in chunks {
            partition.insert_valid(*start, bytes);
        }
    }
}

/// Stitch resident copies and fetched chunks into the requested range.
fn assemble(
    segments: &[Segment],
    chunks: &[(u64, Vec<MemoryByte>)],
    word_size: u32,
    byte_len: usize,
) -> Vec<MemoryByte> {
    let ws = word_size as usize;
    let mut out = Vec::with_capacity(byte_len);
    for segment in segments {
        match segment {
            Segment::Resident { bytes, .. } => out.extend_from_slice(bytes),
            Segment::Gap { start, count } => {
                let end = start + count;
                for (chunk_start, bytes) in chunks.iter().filter(|(s, _)| *s >= *start && *s < end) {
                    let units = ((bytes.len() / ws) as u64).min(end - chunk_start) as usize;
                    out.extend_from_slice(&bytes[..units * ws]);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::sim::SimulatedTarget;

    fn setup(config: CacheConfig) -> (Arc<SimulatedTarget>, MemoryCache, ContextId) {
        let target = Arc::new(SimulatedTarget::new());
        let ctx = ContextId::new();
        target.map_counting(ctx, 0, 1024);
        let cache = MemoryCache::new(target.clone(), config);
        cache.attach(ctx);
        (target, cache, ctx)
    }

    fn range(ctx: ContextId, start: u64, count: u64) -> ByteRange {
        ByteRange::new(ctx, 1, start, count).unwrap()
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        let first = cache.read(range(ctx, 10, 20)).await.unwrap();
        let second = cache.read(range(ctx, 15, 10)).await.unwrap();
        assert_eq!(first[5..15], second[..]);
        assert_eq!(target.read_count(), 1);
        assert_eq!(cache.stats().hit_units, 10);
    }

    #[tokio::test]
    async fn only_gaps_are_fetched() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        cache.read(range(ctx, 0, 64)).await.unwrap();
        cache.read(range(ctx, 128, 64)).await.unwrap();
        target.clear_logs();

        let bytes = cache.read(range(ctx, 32, 128)).await.unwrap();
        assert_eq!(bytes.len(), 128);
        assert!(bytes.iter().enumerate().all(|(i, b)| b.value == (32 + i) as u8));
        let reads = target.reads();
        assert_eq!(reads.len(), 1);
        assert_eq!((reads[0].address, reads[0].count), (64, 64));
        assert_eq!(cache.block_ranges(ctx, 1), vec![0..192]);
    }

    #[tokio::test]
    async fn read_ahead_extends_trailing_gap_only_up_to_next_block() {
        let (target, cache, ctx) = setup(CacheConfig { read_ahead: 16, ..Default::default() });
        cache.read(range(ctx, 40, 8)).await.unwrap();
        target.clear_logs();

        cache.read(range(ctx, 0, 32)).await.unwrap();
        let reads = target.reads();
        assert_eq!((reads[0].address, reads[0].count), (0, 40));
        assert_eq!(cache.block_ranges(ctx, 1), vec![0..48]);
    }

    #[tokio::test]
    async fn large_gaps_are_chunked() {
        let (target, cache, ctx) = setup(CacheConfig { max_fetch_units: 100, ..Default::default() });
        let bytes = cache.read(range(ctx, 0, 250)).await.unwrap();
        assert_eq!(bytes.len(), 250);
        let counts: Vec<u64> = target.reads().iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![100, 100, 50]);
        assert_eq!(cache.block_ranges(ctx, 1), vec![0..250]);
    }

    #[tokio::test]
    async fn word_sizes_use_separate_partitions() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        cache.read(range(ctx, 0, 16)).await.unwrap();
        let wide = cache.read(ByteRange::new(ctx, 4, 0, 4).unwrap()).await.unwrap();
        assert_eq!(wide.len(), 16);
        assert_eq!(target.read_count(), 2);
        assert_eq!(cache.block_ranges(ctx, 4), vec![0..4]);
    }

    #[tokio::test]
    async fn write_invalidates_every_partition() {
        let (_target, cache, ctx) = setup(CacheConfig::default());
        cache.read(range(ctx, 0, 16)).await.unwrap();
        cache.read(ByteRange::new(ctx, 4, 0, 4).unwrap()).await.unwrap();

        cache.write(range(ctx, 5, 2), &[0xaa, 0xbb]).await.unwrap();
        assert_eq!(cache.block_ranges(ctx, 1), vec![0..5, 7..16]);
        assert_eq!(cache.block_ranges(ctx, 4), vec![0..1, 2..4]);
    }

    #[tokio::test]
    async fn failed_write_still_invalidates() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        cache.read(range(ctx, 0, 16)).await.unwrap();
        target.fail_next_write("timeout");
        let err = cache.write(range(ctx, 4, 4), &[0; 4]).await.unwrap_err();
        assert_eq!(err, DebugError::Transport("timeout".into()));
        assert_eq!(cache.block_ranges(ctx, 1), vec![0..4, 8..16]);
    }

    #[tokio::test]
    async fn fill_tiles_pattern() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        cache.fill(range(ctx, 0, 6), &[1, 2]).await.unwrap();
        let values: Vec<u8> = (0..6).filter_map(|a| target.peek(ctx, a)).collect();
        assert_eq!(values, vec![1, 2, 1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn wrong_length_reply_is_transport_error() {
        struct Short;
        #[async_trait::async_trait]
        impl MemoryTarget for Short {
            async fn read(
                &self,
                _context: ContextId,
                _address: u64,
                _word_size: u32,
                _count: u64,
            ) -> Result<Vec<MemoryByte>, DebugError> {
                Ok(vec![MemoryByte::valid(0)])
            }

            async fn write(
                &self,
                _context: ContextId,
                _address: u64,
                _word_size: u32,
                _data: &[u8],
            ) -> Result<(), DebugError> {
                Ok(())
            }
        }
        let cache = MemoryCache::new(Arc::new(Short), CacheConfig::default());
        let ctx = ContextId::new();
        cache.attach(ctx);
        let err = cache.read(range(ctx, 0, 4)).await.unwrap_err();
        assert!(matches!(err, DebugError::Transport(_)));
        assert!(cache.block_ranges(ctx, 1).is_empty());
    }

    #[tokio::test]
    async fn unknown_context_is_rejected_without_io() {
        let (target, cache, _ctx) = setup(CacheConfig::default());
        let other = ContextId::new();
        assert_eq!(cache.read(range(other, 0, 4)).await, Err(DebugError::UnknownContext));
        assert_eq!(cache.write(range(other, 0, 1), &[1]).await, Err(DebugError::UnknownContext));
        assert_eq!(target.read_count() + target.write_count(), 0);
    }

    #[tokio::test]
    async fn detach_drops_blocks() {
        let (_target, cache, ctx) = setup(CacheConfig::default());
        cache.read(range(ctx, 0, 8)).await.unwrap();
        assert!(cache.detach(ctx));
        assert!(!cache.is_attached(ctx));
        assert_eq!(cache.stats().blocks, 0);
        assert!(cache.attach(ctx));
        assert!(cache.block_ranges(ctx, 1).is_empty());
    }

    #[tokio::test]
    async fn fetch_that_straddles_invalidation_is_not_cached() {
        let (target, cache, ctx) = setup(CacheConfig::default());
        target.set_latency(Some(std::time::Duration::from_millis(30)));
        let reader = cache.clone();
        let read = tokio::spawn(async move { reader.read(range(ctx, 0, 16)).await });
        while target.read_count() == 0 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(ctx, 1, &ChangeScope::All);
        assert_eq!(read.await.unwrap().unwrap().len(), 16);
        assert!(cache.block_ranges(ctx, 1).is_empty());
    }

    #[tokio::test]
    async fn invalidating_unknown_context_leaves_generation_alone() {
        let (_target, cache, _ctx) = setup(CacheConfig::default());
        let before = cache.state.lock().next_generation;
        assert_eq!(cache.invalidate(ContextId::new(), 1, &ChangeScope::All), 0);
        assert_eq!(cache.state.lock().next_generation, before);
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[test]
    fn assemble_truncates_read_ahead() {
        let segments = vec![
            Segment::Resident { start: 0, bytes: vec![MemoryByte::valid(0)] },
            Segment::Gap { start: 1, count: 2 },
        ];
        let chunk: Vec<MemoryByte> = (1..6).map(MemoryByte::valid).collect();
        let out = assemble(&segments, &[(1, chunk)], 1, 3);
        assert_eq!(out.iter().map(|b| b.value).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
