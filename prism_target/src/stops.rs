//! Stop positions.
//!
//! A *stop* is a code position at which the location of every live object
//! reference is known: a direct call, an indirect call or a safepoint. Each
//! stop is recorded as one packed 32-bit entry:
//!
//! ```text
//!  31  30  29                                   0
//! +---+---+--------------------------------------+
//! | 0 | N |               position               |
//! +---+---+--------------------------------------+
//!       N = native-call flag, bit 31 reserved
//! ```
//!
//! The stop table of a method is partitioned into three contiguous zones in
//! this order: direct calls, indirect calls, safepoints.

use std::fmt;

use crate::error::{TargetError, fatal};

// =============================================================================
// Entry Codec
// =============================================================================

/// Number of bits holding the code position.
pub const POSITION_BITS: u32 = 30;

/// Mask selecting the position of an entry.
pub const POSITION_MASK: u32 = (1 << POSITION_BITS) - 1;

/// Native-call flag.
pub const NATIVE_CALL_FLAG: u32 = 1 << POSITION_BITS;

/// Reserved top bit; always clear in a valid entry.
pub const RESERVED_BIT: u32 = 1 << 31;

/// Encode a stop entry.
///
/// Fails when `position` does not fit in 30 bits.
#[inline]
pub fn encode(position: usize, is_native_call: bool) -> Result<u32, TargetError> {
    if position > POSITION_MASK as usize {
        return Err(TargetError::PositionOutOfRange(position));
    }
    let flag = if is_native_call { NATIVE_CALL_FLAG } else { 0 };
    Ok(position as u32 | flag)
}

/// Code position of an entry.
#[inline(always)]
pub const fn decode(entry: u32) -> u32 {
    entry & POSITION_MASK
}

/// Whether an entry records a call to native code.
#[inline(always)]
pub const fn is_native_call(entry: u32) -> bool {
    entry & NATIVE_CALL_FLAG != 0
}

/// Index of the first entry at `position`, ignoring flags.
pub fn index_of(entries: &[u32], position: u32) -> Option<usize> {
    entries.iter().position(|&entry| decode(entry) == position)
}

// =============================================================================
// Stop Table
// =============================================================================

/// Zone of a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopKind {
    /// Call with a statically known callee.
    DirectCall,
    /// Call through a register or memory operand.
    IndirectCall,
    /// Safepoint poll.
    Safepoint,
}

impl StopKind {
    /// Whether this stop is a call.
    #[inline]
    pub const fn is_call(self) -> bool {
        !matches!(self, StopKind::Safepoint)
    }
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopKind::DirectCall => "direct call",
            StopKind::IndirectCall => "indirect call",
            StopKind::Safepoint => "safepoint",
        })
    }
}

/// Read-only view of a zoned stop table.
#[derive(Debug, Clone, Copy)]
pub struct StopTable<'a> {
    entries: &'a [u32],
    direct_calls: usize,
    indirect_calls: usize,
}

impl<'a> StopTable<'a> {
    /// An empty table.
    pub const EMPTY: StopTable<'static> = StopTable {
        entries: &[],
        direct_calls: 0,
        indirect_calls: 0,
    };

    /// Create a view, checking that the zone counts cover `entries` exactly.
    pub fn new(
        entries: &'a [u32],
        direct_calls: usize,
        indirect_calls: usize,
        safepoints: usize,
    ) -> Result<Self, TargetError> {
        if direct_calls + indirect_calls + safepoints != entries.len() {
            return Err(TargetError::StopZoneMismatch {
                stops: entries.len(),
                direct: direct_calls,
                indirect: indirect_calls,
                safepoints,
            });
        }
        Ok(Self {
            entries,
            direct_calls,
            indirect_calls,
        })
    }

    /// View over entries already checked by [`StopTable::new`].
    #[inline]
    pub(crate) const fn from_parts(
        entries: &'a [u32],
        direct_calls: usize,
        indirect_calls: usize,
    ) -> Self {
        Self {
            entries,
            direct_calls,
            indirect_calls,
        }
    }

    /// Raw packed entries.
    #[inline]
    pub fn entries(&self) -> &'a [u32] {
        self.entries
    }

    /// Total number of stops.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no stops.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of direct calls.
    #[inline]
    pub fn direct_calls(&self) -> usize {
        self.direct_calls
    }

    /// Number of indirect calls.
    #[inline]
    pub fn indirect_calls(&self) -> usize {
        self.indirect_calls
    }

    /// Number of calls of either kind.
    #[inline]
    pub fn calls(&self) -> usize {
        self.direct_calls + self.indirect_calls
    }

    /// Number of safepoints.
    #[inline]
    pub fn safepoints(&self) -> usize {
        self.entries.len() - self.calls()
    }

    /// Zone of stop `index`.
    pub fn kind(&self, index: usize) -> StopKind {
        self.check_index(index);
        if index < self.direct_calls {
            StopKind::DirectCall
        } else if index < self.calls() {
            StopKind::IndirectCall
        } else {
            StopKind::Safepoint
        }
    }

    /// Code position of stop `index`.
    #[inline]
    pub fn position(&self, index: usize) -> u32 {
        self.check_index(index);
        decode(self.entries[index])
    }

    /// Whether stop `index` calls native code.
    #[inline]
    pub fn is_native_call(&self, index: usize) -> bool {
        self.check_index(index);
        is_native_call(self.entries[index])
    }

    /// Stop index of the `n`th entry of zone `kind`.
    ///
    /// Out-of-range `n` is fatal.
    pub fn stop_index(&self, kind: StopKind, n: usize) -> usize {
        let (start, len) = match kind {
            StopKind::DirectCall => (0, self.direct_calls),
            StopKind::IndirectCall => (self.direct_calls, self.indirect_calls),
            StopKind::Safepoint => (self.calls(), self.safepoints()),
        };
        if n >= len {
            fatal!("{kind} index {n} out of bounds (zone holds {len})");
        }
        start + n
    }

    /// Index of the first stop at `position`.
    #[inline]
    pub fn index_of(&self, position: u32) -> Option<usize> {
        index_of(self.entries, position)
    }

    /// Stop index for a code position inside a suspended frame.
    ///
    /// An exact safepoint match wins. Otherwise `position` is taken to be a
    /// return address and the call with the greatest position strictly below
    /// it is chosen; a direct call wins over an indirect call at the same
    /// position.
    pub fn find_stop_index(&self, position: u32) -> Option<usize> {
        let mut safepoints = self.calls()..self.len();
        if let Some(index) = safepoints.find(|&i| decode(self.entries[i]) == position) {
            return Some(index);
        }

        let mut closest: Option<(usize, u32)> = None;
        for index in 0..self.calls() {
            let candidate = decode(self.entries[index]);
            if candidate < position && closest.is_none_or(|(_, best)| candidate > best) {
                closest = Some((index, candidate));
            }
        }
        closest.map(|(index, _)| index)
    }

    /// Position of the first call strictly after `from`.
    ///
    /// With `native_only`, only calls flagged as native are considered.
    pub fn find_next_call(&self, from: u32, native_only: bool) -> Option<u32> {
        self.entries[..self.calls()]
            .iter()
            .filter(|&&entry| !native_only || is_native_call(entry))
            .map(|&entry| decode(entry))
            .filter(|&position| position > from)
            .min()
    }

    /// Iterate `(kind, position, is_native_call)` in table order.
    pub fn iter(&self) -> impl Iterator<Item = (StopKind, u32, bool)> + '_ {
        (0..self.len()).map(move |i| (self.kind(i), self.position(i), self.is_native_call(i)))
    }

    #[inline]
    fn check_index(&self, index: usize) {
        if index >= self.entries.len() {
            fatal!("stop index {index} out of bounds (table holds {})", self.entries.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(positions: &[(u32, bool)]) -> Vec<u32> {
        positions
            .iter()
            .map(|&(p, native)| encode(p as usize, native).unwrap())
            .collect()
    }

    #[test]
    fn test_encode_layout() {
        assert_eq!(encode(0x1234, false).unwrap(), 0x1234);
        assert_eq!(encode(0x1234, true).unwrap(), 0x4000_1234);
        assert_eq!(encode(POSITION_MASK as usize, true).unwrap() & RESERVED_BIT, 0);
    }

    #[test]
    fn test_encode_rejects_wide_position() {
        assert!(matches!(
            encode(1 << 30, false),
            Err(TargetError::PositionOutOfRange(_))
        ));
    }

    #[test]
    fn test_index_of_ignores_flags() {
        let table = entries(&[(4, false), (9, true), (9, false)]);
        assert_eq!(index_of(&table, 9), Some(1));
        assert_eq!(index_of(&table, 5), None);
    }

    #[test]
    fn test_zone_mismatch() {
        let table = entries(&[(4, false), (9, false)]);
        assert!(matches!(
            StopTable::new(&table, 1, 0, 0),
            Err(TargetError::StopZoneMismatch { stops: 2, .. })
        ));
    }

    #[test]
    fn test_zones_and_kinds() {
        let table = entries(&[(3, false), (11, true), (20, false), (30, false), (40, false)]);
        let stops = StopTable::new(&table, 2, 1, 2).unwrap();
        assert_eq!(stops.kind(1), StopKind::DirectCall);
        assert_eq!(stops.kind(2), StopKind::IndirectCall);
        assert_eq!(stops.kind(4), StopKind::Safepoint);
        assert_eq!(stops.stop_index(StopKind::Safepoint, 1), 4);
        assert_eq!(stops.stop_index(StopKind::IndirectCall, 0), 2);
        assert!(stops.is_native_call(1));
    }

    #[test]
    #[should_panic(expected = "safepoint index 2 out of bounds")]
    fn test_stop_index_out_of_zone_is_fatal() {
        let table = entries(&[(30, false), (40, false)]);
        let stops = StopTable::new(&table, 0, 0, 2).unwrap();
        stops.stop_index(StopKind::Safepoint, 2);
    }

    #[test]
    fn test_find_stop_index() {
        // direct calls at 3 and 20, indirect call at 11, safepoint at 25
        let table = entries(&[(3, false), (20, false), (11, false), (25, false)]);
        let stops = StopTable::new(&table, 2, 1, 1).unwrap();
        assert_eq!(stops.find_stop_index(25), Some(3));
        assert_eq!(stops.find_stop_index(8), Some(0));
        assert_eq!(stops.find_stop_index(16), Some(2));
        assert_eq!(stops.find_stop_index(24), Some(1));
        assert_eq!(stops.find_stop_index(3), None);
    }

    #[test]
    fn test_find_stop_index_tie_prefers_direct() {
        let table = entries(&[(7, false), (7, false)]);
        let stops = StopTable::new(&table, 1, 1, 0).unwrap();
        assert_eq!(stops.find_stop_index(12), Some(0));
    }

    #[test]
    fn test_find_next_call() {
        let table = entries(&[(3, false), (20, true), (11, true), (15, false)]);
        let stops = StopTable::new(&table, 2, 1, 1).unwrap();
        assert_eq!(stops.find_next_call(0, false), Some(3));
        assert_eq!(stops.find_next_call(4, false), Some(11));
        assert_eq!(stops.find_next_call(12, true), Some(20));
        // safepoints are never calls
        assert_eq!(stops.find_next_call(21, false), None);
    }

    #[test]
    fn test_find_next_call_skips_call_at_from() {
        let table = entries(&[(3, false), (11, false)]);
        let stops = StopTable::new(&table, 2, 0, 0).unwrap();
        assert_eq!(stops.find_next_call(3, false), Some(11));
        assert_eq!(stops.find_next_call(11, false), None);
        assert_eq!(stops.find_next_call(2, false), Some(3));
    }
}
