//! Memory-space identifiers, flagged bytes, unit ranges and change notices.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::DebugError;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one memory space, e.g. one inferior process.
///
/// Equality is by identity: every call to [`ContextId::new`] yields a
/// distinct id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(u64);

impl ContextId {
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// One byte of target memory plus its status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryByte {
    pub value: u8,
    pub flags: u8,
}

impl MemoryByte {
    pub const READABLE: u8 = 0x01;
    pub const WRITABLE: u8 = 0x02;
    pub const CHANGED: u8 = 0x04;
    pub const HISTORY_KNOWN: u8 = 0x08;
    pub const BIG_ENDIAN: u8 = 0x10;
    pub const ENDIANESS_KNOWN: u8 = 0x20;

    /// Flags carried by a byte the target could read.
    pub const VALID_FLAGS: u8 = Self::READABLE | Self::WRITABLE | Self::ENDIANESS_KNOWN;

    pub fn valid(value: u8) -> Self {
        Self { value, flags: Self::VALID_FLAGS }
    }

    /// Placeholder for a byte of inaccessible memory.
    pub fn invalid() -> Self {
        Self { value: 0, flags: Self::ENDIANESS_KNOWN }
    }

    pub fn is_readable(&self) -> bool {
        self.flags & Self::READABLE != 0
    }
}

/// Raw values of a slice of flagged bytes.
pub fn values(bytes: &[MemoryByte]) -> Vec<u8> {
    bytes.iter().map(|b| b.value).collect()
}

/// Half-open interval `[start, start + count)` of addressable units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub context: ContextId,
    pub word_size: u32,
    pub start: u64,
    pub count: u64,
}

impl ByteRange {
    /// Validated constructor: `word_size` and `count` must be positive and
    /// the range must fit the address space.
    pub fn new(context: ContextId, word_size: u32, start: u64, count: u64) -> Result<Self, DebugError> {
        if word_size < 1 {
            return Err(DebugError::InvalidWordSize);
        }
        if count == 0 {
            return Err(DebugError::InvalidCount);
        }
        start.checked_add(count).ok_or(DebugError::AddressOverflow)?;
        count
            .checked_mul(u64::from(word_size))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(DebugError::AddressOverflow)?;
        Ok(Self { context, word_size, start, count })
    }

    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn units(&self) -> Range<u64> {
        self.start..self.end()
    }

    /// Size of the range in bytes.
    pub fn byte_len(&self) -> usize {
        (self.count * u64::from(self.word_size)) as usize
    }
}

/// Turn raw call parameters into a unit range.
///
/// Returns `Ok(None)` for a zero count, which is a valid no-op request.
pub(crate) fn request_range(
    context: ContextId,
    address: u64,
    offset: i64,
    word_size: u32,
    count: i64,
) -> Result<Option<ByteRange>, DebugError> {
    if word_size < 1 {
        return Err(DebugError::InvalidWordSize);
    }
    if count < 0 {
        return Err(DebugError::InvalidCount);
    }
    let start = address.checked_add_signed(offset).ok_or(DebugError::AddressOverflow)?;
    if count == 0 {
        return Ok(None);
    }
    ByteRange::new(context, word_size, start, count as u64).map(Some)
}

/// Which part of a context may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeScope {
    /// Unknown extent: the whole context (e.g. after the target resumed).
    All,
    /// Sorted, non-overlapping, non-adjacent unit ranges.
    Ranges(Vec<Range<u64>>),
}

impl ChangeScope {
    /// Coalesce arbitrary ranges into a sorted, disjoint set.
    pub fn ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = Range<u64>>,
    {
        let mut ranges: Vec<Range<u64>> = ranges.into_iter().filter(|r| r.start < r.end).collect();
        ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        Self::Ranges(merged)
    }

    /// Coalesce individual addresses.
    pub fn addresses<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        Self::ranges(addresses.into_iter().filter_map(|a| a.checked_add(1).map(|end| a..end)))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn contains(&self, address: u64) -> bool {
        match self {
            Self::All => true,
            Self::Ranges(ranges) => ranges.iter().any(|r| r.contains(&address)),
        }
    }

    /// Every named address, ascending. Empty for [`ChangeScope::All`].
    pub fn iter_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        let ranges: &[Range<u64>] = match self {
            Self::All => &[],
            Self::Ranges(ranges) => ranges,
        };
        ranges.iter().flat_map(|r| r.clone())
    }

    /// Number of named addresses, `None` for [`ChangeScope::All`].
    pub fn address_count(&self) -> Option<u64> {
        match self {
            Self::All => None,
            Self::Ranges(ranges) => Some(ranges.iter().map(|r| r.end - r.start).sum()),
        }
    }
}

/// Where a change notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeOrigin {
    /// Published by the memory service after a successful set or fill.
    Service,
    /// Reported by the debugger process out of band.
    Target,
}

/// Memory content at the named addresses may have changed.
///
/// Scope ranges count units of `word_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub context: ContextId,
    pub word_size: u32,
    pub scope: ChangeScope,
    pub origin: ChangeOrigin,
}

impl ChangeNotification {
    /// Target-side notification covering the whole context.
    pub fn all(context: ContextId) -> Self {
        Self { context, word_size: 1, scope: ChangeScope::All, origin: ChangeOrigin::Target }
    }

    /// Target-side notification for individual byte addresses.
    pub fn addresses<I>(context: ContextId, addresses: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        Self {
            context,
            word_size: 1,
            scope: ChangeScope::addresses(addresses),
            origin: ChangeOrigin::Target,
        }
    }

    pub(crate) fn overwritten(range: &ByteRange) -> Self {
        Self {
            context: range.context,
            word_size: range.word_size,
            scope: ChangeScope::Ranges(vec![range.units()]),
            origin: ChangeOrigin::Service,
        }
    }
}

/// Convert a unit range of `from` bytes per unit into the smallest covering
/// unit range of `to` bytes per unit.
pub(crate) fn rescale(range: &Range<u64>, from: u32, to: u32) -> Range<u64> {
    if from == to {
        return range.clone();
    }
    let clamp = |v: u128| u64::try_from(v).unwrap_or(u64::MAX);
    let lo = u128::from(range.start) * u128::from(from);
    let hi = u128::from(range.end) * u128::from(from);
    let to = u128::from(to);
    clamp(lo / to)..clamp(hi.div_ceil(to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
    }

    #[test]
    fn invalid_byte_is_distinguishable_from_zero() {
        let invalid = MemoryByte::invalid();
        let zero = MemoryByte::valid(0);
        assert_eq!(invalid.value, zero.value);
        assert_ne!(invalid, zero);
        assert_eq!(invalid.flags, 32);
        assert!(!invalid.is_readable());
    }

    #[test]
    fn request_range_validation_order() {
        let ctx = ContextId::new();
        assert_eq!(request_range(ctx, 0, 0, 0, -1), Err(DebugError::InvalidWordSize));
        assert_eq!(request_range(ctx, 0, 0, 1, -1), Err(DebugError::InvalidCount));
        assert_eq!(request_range(ctx, 0, 0, 1, 0), Ok(None));
        assert_eq!(request_range(ctx, u64::MAX, 1, 1, 1), Err(DebugError::AddressOverflow));
        assert_eq!(request_range(ctx, u64::MAX - 1, 0, 1, 2), Err(DebugError::AddressOverflow));
    }

    #[test]
    fn request_range_applies_signed_offset() {
        let ctx = ContextId::new();
        let range = request_range(ctx, 0x100, -16, 4, 8).unwrap().unwrap();
        assert_eq!(range.start, 0xf0);
        assert_eq!(range.end(), 0xf8);
        assert_eq!(range.byte_len(), 32);
    }

    #[test]
    fn scope_coalesces_addresses() {
        let scope = ChangeScope::addresses([5, 3, 4, 10, 4]);
        assert_eq!(scope, ChangeScope::Ranges(vec![3..6, 10..11]));
        assert_eq!(scope.address_count(), Some(4));
        assert_eq!(scope.iter_addresses().collect::<Vec<_>>(), vec![3, 4, 5, 10]);
        assert!(scope.contains(4));
        assert!(!scope.contains(6));
    }

    #[test]
    fn rescale_covers_partial_units() {
        assert_eq!(rescale(&(3..5), 1, 4), 0..2);
        assert_eq!(rescale(&(4..8), 1, 4), 1..2);
        assert_eq!(rescale(&(1..2), 4, 1), 4..8);
        assert_eq!(rescale(&(2..3), 2, 2), 2..3);
    }

    #[test]
    fn scope_all_names_no_addresses() {
        let scope = ChangeScope::All;
        assert!(scope.contains(12345));
        assert_eq!(scope.address_count(), None);
        assert_eq!(scope.iter_addresses().count(), 0);
    }
}
