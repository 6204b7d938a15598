//! Reference-map addressing.
//!
//! The reference maps of a method are one byte blob:
//!
//! ```text
//! +-----------+-----------+-----+-----------+--------------+-----+--------------+
//! | frame[0]  | frame[1]  | ... | frame[S-1]| register[0]  | ... | register[P-1]|
//! +-----------+-----------+-----+-----------+--------------+-----+--------------+
//!   S = number of stops, P = number of safepoints
//! ```
//!
//! Every stop has a frame map of `frame_map_size` bytes; only safepoints have
//! a register map of `register_map_size` bytes. Each map is a bit-per-slot
//! array, least-significant bit first.

use std::fmt;

use crate::error::fatal;
use crate::stops::StopTable;

// =============================================================================
// Layout
// =============================================================================

/// Size of a reference-map blob for a stop table of the given shape.
///
/// Zero when there are no stops.
#[inline]
pub const fn compute_size(
    direct_calls: usize,
    indirect_calls: usize,
    safepoints: usize,
    frame_map_size: usize,
    register_map_size: usize,
) -> usize {
    let stops = direct_calls + indirect_calls + safepoints;
    if stops == 0 {
        return 0;
    }
    stops * frame_map_size + safepoints * register_map_size
}

/// Byte addressing of one method's reference-map blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferenceMapLayout {
    stops: usize,
    safepoints: usize,
    frame_map_size: usize,
    register_map_size: usize,
}

impl ReferenceMapLayout {
    /// Layout for `stops` with the given per-map sizes.
    pub fn new(stops: &StopTable<'_>, frame_map_size: usize, register_map_size: usize) -> Self {
        Self {
            stops: stops.len(),
            safepoints: stops.safepoints(),
            frame_map_size,
            register_map_size,
        }
    }

    /// Bytes per frame map.
    #[inline]
    pub fn frame_map_size(&self) -> usize {
        self.frame_map_size
    }

    /// Bytes per register map.
    #[inline]
    pub fn register_map_size(&self) -> usize {
        self.register_map_size
    }

    /// Total blob size.
    #[inline]
    pub fn size(&self) -> usize {
        compute_size(
            self.stops - self.safepoints,
            0,
            self.safepoints,
            self.frame_map_size,
            self.register_map_size,
        )
    }

    /// Offset of the frame map of stop `stop_index`.
    #[inline]
    pub fn frame_map_offset(&self, stop_index: usize) -> usize {
        if stop_index >= self.stops {
            fatal!("frame map for stop {stop_index} requested, method has {} stops", self.stops);
        }
        stop_index * self.frame_map_size
    }

    /// Offset of the register map of safepoint `safepoint_index`.
    ///
    /// `safepoint_index` counts safepoints only, not all stops.
    #[inline]
    pub fn register_map_offset(&self, safepoint_index: usize) -> usize {
        if safepoint_index >= self.safepoints {
            fatal!(
                "register map for safepoint {safepoint_index} requested, method has {} safepoints",
                self.safepoints
            );
        }
        self.stops * self.frame_map_size + safepoint_index * self.register_map_size
    }

    /// Frame map of stop `stop_index` inside `blob`.
    pub fn frame_map<'a>(&self, blob: &'a [u8], stop_index: usize) -> BitMap<'a> {
        let start = self.frame_map_offset(stop_index);
        BitMap::new(&blob[start..start + self.frame_map_size])
    }

    /// Register map of safepoint `safepoint_index` inside `blob`.
    pub fn register_map<'a>(&self, blob: &'a [u8], safepoint_index: usize) -> BitMap<'a> {
        let start = self.register_map_offset(safepoint_index);
        BitMap::new(&blob[start..start + self.register_map_size])
    }
}

// =============================================================================
// Bit Map
// =============================================================================

/// Borrowed bit-per-slot map, least-significant bit first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitMap<'a> {
    bytes: &'a [u8],
}

impl<'a> BitMap<'a> {
    /// Wrap map bytes.
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Underlying bytes.
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Number of slots covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Whether the map covers no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether slot `bit` holds a reference.
    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        if bit >= self.len() {
            fatal!("reference map bit {bit} out of bounds ({} slots)", self.len());
        }
        self.bytes[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Number of slots holding references.
    #[inline]
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterate slots holding references in ascending order.
    #[inline]
    pub fn live_slots(&self) -> LiveSlots<'a> {
        LiveSlots {
            bytes: self.bytes,
            index: 0,
            current: self.bytes.first().copied().unwrap_or(0),
        }
    }
}

impl fmt::Debug for BitMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.live_slots()).finish()
    }
}

impl fmt::Display for BitMap<'_> {
    /// Slot 0 first, e.g. `1001` for slots 0 and 3 set.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in 0..self.len() {
            f.write_str(if self.is_set(bit) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Iterator over set bits of a [`BitMap`].
#[derive(Debug, Clone)]
pub struct LiveSlots<'a> {
    bytes: &'a [u8],
    index: usize,
    current: u8,
}

impl Iterator for LiveSlots<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let trailing = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1; // Clear lowest set bit
                return Some(self.index * 8 + trailing);
            }
            self.index += 1;
            self.current = *self.bytes.get(self.index)?;
        }
    }
}
