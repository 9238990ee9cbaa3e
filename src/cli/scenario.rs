//! `scenario`: exercise a session end to end against a simulated target.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::EnvConfig;
use crate::dispatch::DispatchStatsSnapshot;
use crate::error::DebugError;
use crate::memory::{CacheStats, ContextId, SimulatedTarget};
use crate::session::Session;

const MAPPED_BYTES: usize = 4096;

/// Summary printed by `dbg-core-cli scenario`.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub session: String,
    pub bytes_read: usize,
    pub invalid_bytes: usize,
    pub target_reads: u64,
    pub target_writes: u64,
    pub notifications: u64,
    pub readback_matches: bool,
    pub cache: CacheStats,
    pub dispatch: DispatchStatsSnapshot,
    pub shutdown: String,
}

/// Open a session, run reads, writes and a fill, then close it.
pub async fn run_scenario(config: &EnvConfig) -> Result<ScenarioReport, DebugError> {
    let target = Arc::new(SimulatedTarget::new());
    let ctx = ContextId::new();
    target.map_counting(ctx, 0, MAPPED_BYTES);

    let session = Session::open(target.clone(), config.session_config());
    let memory = session.memory();
    let notifications = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&notifications);
    session.events().subscribe(move |_| {
        seen.fetch_add(1, Ordering::Relaxed);
    });

    memory.attach_context(ctx).await?;

    let mut bytes_read = 0;
    for (address, count) in [(0u64, 256i64), (64, 64), (128, 256), (512, 512)] {
        bytes_read += memory.get(ctx, address, 0, 1, count).await?.len();
    }

    let patch: Vec<u8> = (0..16u8).rev().collect();
    memory.set(ctx, 100, 0, 1, 16, &patch).await?;
    memory.fill(ctx, 1024, 0, 4, 8, &[0xde, 0xad, 0xbe, 0xef]).await?;
    let readback = memory.get(ctx, 100, 0, 1, 16).await?;
    let readback_matches = crate::memory::values(&readback) == patch;

    // Straddles the end of mapped memory.
    let edge = memory.get(ctx, (MAPPED_BYTES - 8) as u64, 0, 1, 16).await?;
    bytes_read += readback.len() + edge.len();
    let invalid_bytes = edge.iter().filter(|b| !b.is_readable()).count();

    memory.flush_cache(ctx).await?;
    let cache = memory.stats();
    let dispatch = session.dispatcher().stats();
    let shutdown = session.close().await?;

    Ok(ScenarioReport {
        session: session.id().to_string(),
        bytes_read,
        invalid_bytes,
        target_reads: target.read_count(),
        target_writes: target.write_count(),
        notifications: notifications.load(Ordering::Relaxed),
        readback_matches,
        cache,
        dispatch,
        shutdown: format!("{shutdown:?}"),
    })
}
