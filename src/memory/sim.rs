//! In-process simulated target.
//!
//! Holds sparse mapped regions per context and logs every access, so tests
//! can tell exactly which ranges the cache fetched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::target::MemoryTarget;
use super::types::{ContextId, MemoryByte};
use crate::error::DebugError;

/// One downstream access, in units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub context: ContextId,
    pub address: u64,
    pub word_size: u32,
    pub count: u64,
}

impl AccessRecord {
    pub fn end(&self) -> u64 {
        self.address + self.count
    }
}

/// Memory of one context: byte-addressed regions keyed by start.
#[derive(Debug, Default)]
struct Space {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl Space {
    fn locate(&self, byte: u64) -> Option<(u64, usize)> {
        let (start, data) = self.regions.range(..=byte).next_back()?;
        let at = usize::try_from(byte - start).ok()?;
        (at < data.len()).then_some((*start, at))
    }

    fn get(&self, byte: u64) -> Option<u8> {
        let (start, at) = self.locate(byte)?;
        self.regions.get(&start).map(|data| data[at])
    }

    fn set(&mut self, byte: u64, value: u8) -> bool {
        match self.locate(byte) {
            Some((start, at)) => match self.regions.get_mut(&start) {
                Some(data) => {
                    data[at] = value;
                    true
                }
                None => false,
            },
            None => false,
        }
    }
}

/// Simulated debugger back end.
///
/// Unit address `a` of word size `ws` maps to byte address `a * ws`.
/// Reads of unmapped bytes return [`MemoryByte::invalid`]; writes touching
/// any unmapped byte fail without modifying memory.
#[derive(Debug, Default)]
pub struct SimulatedTarget {
    spaces: Mutex<HashMap<ContextId, Space>>,
    reads: Mutex<Vec<AccessRecord>>,
    writes: Mutex<Vec<AccessRecord>>,
    read_count: AtomicU64,
    write_count: AtomicU64,
    latency: Mutex<Option<Duration>>,
    fail_next_read: Mutex<Option<String>>,
    fail_next_write: Mutex<Option<String>>,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at byte address `address` of `context`.
    ///
    /// Regions must not overlap existing ones.
    pub fn map_region(&self, context: ContextId, address: u64, data: Vec<u8>) {
        self.spaces.lock().entry(context).or_default().regions.insert(address, data);
    }

    /// Map `len` bytes at `address` where byte `i` holds `i as u8`.
    pub fn map_counting(&self, context: ContextId, address: u64, len: usize) {
        self.map_region(context, address, (0..len).map(|i| i as u8).collect());
    }

    /// Byte at `address`, bypassing the access log.
    pub fn peek(&self, context: ContextId, address: u64) -> Option<u8> {
        self.spaces.lock().get(&context)?.get(address)
    }

    /// Change a byte behind the cache's back, as a running program would.
    pub fn poke(&self, context: ContextId, address: u64, value: u8) -> bool {
        self.spaces.lock().get_mut(&context).is_some_and(|space| space.set(address, value))
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next read with a transport error.
    pub fn fail_next_read(&self, message: impl Into<String>) {
        *self.fail_next_read.lock() = Some(message.into());
    }

    /// Fail the next write with a transport error.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        *self.fail_next_write.lock() = Some(message.into());
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> Vec<AccessRecord> {
        self.reads.lock().clone()
    }

    pub fn writes(&self) -> Vec<AccessRecord> {
        self.writes.lock().clone()
    }

    pub fn clear_logs(&self) {
        self.reads.lock().clear();
        self.writes.lock().clear();
        self.read_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn byte_address(address: u64, word_size: u32) -> Option<u64> {
    address.checked_mul(u64::from(word_size))
}

#[async_trait]
impl MemoryTarget for SimulatedTarget {
    async fn read(
        &self,
        context: ContextId,
        address: u64,
        word_size: u32,
        count: u64,
    ) -> Result<Vec<MemoryByte>, DebugError> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.reads.lock().push(AccessRecord { context, address, word_size, count });
        self.delay().await;

        if let Some(message) = self.fail_next_read.lock().take() {
            return Err(DebugError::transport(message));
        }

        let len = count * u64::from(word_size);
        let spaces = self.spaces.lock();
        let space = spaces.get(&context);
        let first = byte_address(address, word_size);
        let bytes = (0..len)
            .map(|i| {
                first
                    .and_then(|b| b.checked_add(i))
                    .and_then(|b| space.and_then(|s| s.get(b)))
                    .map_or_else(MemoryByte::invalid, MemoryByte::valid)
            })
            .collect();
        Ok(bytes)
    }

    async fn write(
        &self,
        context: ContextId,
        address: u64,
        word_size: u32,
        data: &[u8],
    ) -> Result<(), DebugError> {
        let count = (data.len() / word_size as usize) as u64;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.writes.lock().push(AccessRecord { context, address, word_size, count });
        self.delay().await;

        if let Some(message) = self.fail_next_write.lock().take() {
            return Err(DebugError::transport(message));
        }

        let mut spaces = self.spaces.lock();
        let first = byte_address(address, word_size);
        let Some((space, first)) = spaces.get_mut(&context).zip(first) else {
            return Err(DebugError::transport(format!("Cannot access memory at address {address:#x}")));
        };

        // Reject the whole write if any byte is unmapped.
        for i in 0..data.len() as u64 {
            let mapped = first.checked_add(i).and_then(|b| space.locate(b)).is_some();
            if !mapped {
                return Err(DebugError::transport(format!(
                    "Cannot access memory at address {:#x}",
                    first.saturating_add(i)
                )));
            }
        }
        for (i, value) in data.iter().enumerate() {
            space.set(first + i as u64, *value);
        }
        Ok(())
    }
}
