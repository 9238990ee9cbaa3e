//! Downstream memory access primitives.

use async_trait::async_trait;

use super::types::{ContextId, MemoryByte};
use crate::error::DebugError;

/// Raw memory access to the process being debugged.
///
/// Addresses and counts are in addressable units of `word_size` bytes.
#[async_trait]
pub trait MemoryTarget: Send + Sync {
    /// Read `count` units starting at `address`.
    ///
    /// Must return exactly `count * word_size` bytes. Inaccessible memory is
    /// reported per byte with [`MemoryByte::invalid`], not as an error.
    async fn read(
        &self,
        context: ContextId,
        address: u64,
        word_size: u32,
        count: u64,
    ) -> Result<Vec<MemoryByte>, DebugError>;

    /// Write `data` (a whole number of units) starting at `address`.
    async fn write(
        &self,
        context: ContextId,
        address: u64,
        word_size: u32,
        data: &[u8],
    ) -> Result<(), DebugError>;
}
