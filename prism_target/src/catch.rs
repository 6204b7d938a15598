//! Catch-range table for exception dispatch.
//!
//! A method's catch table is two parallel arrays: ascending start positions
//! of catch ranges and the handler position for each range. A range extends
//! up to the start of the next range (or the end of the code). A handler
//! position of zero means the range has no handler and the exception
//! propagates to the caller.

use std::fmt;

use crate::error::TargetError;

/// Handler position meaning "no handler, propagate".
pub const NO_HANDLER: u32 = 0;

/// Read-only view of a validated catch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchRangeTable<'a> {
    positions: &'a [u32],
    targets: &'a [u32],
}

/// One entry of a catch table with its extent resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchRange {
    /// First covered code position.
    pub start: u32,
    /// First position past the range, or `None` for the last range.
    pub end: Option<u32>,
    /// Handler position, `None` when the range propagates.
    pub handler: Option<u32>,
}

impl<'a> CatchRangeTable<'a> {
    /// A method without exception handlers.
    pub const EMPTY: CatchRangeTable<'static> = CatchRangeTable {
        positions: &[],
        targets: &[],
    };

    /// Create a view, checking that the tables pair up and are sorted.
    pub fn new(positions: &'a [u32], targets: &'a [u32]) -> Result<Self, TargetError> {
        if positions.len() != targets.len() {
            return Err(TargetError::CatchTableLengthMismatch {
                ranges: positions.len(),
                targets: targets.len(),
            });
        }
        if let Some(index) = positions.windows(2).position(|w| w[1] < w[0]) {
            return Err(TargetError::UnsortedCatchRanges { index: index + 1 });
        }
        Ok(Self { positions, targets })
    }

    /// View over tables already checked by [`CatchRangeTable::new`].
    #[inline]
    pub(crate) const fn from_parts(positions: &'a [u32], targets: &'a [u32]) -> Self {
        Self { positions, targets }
    }

    /// Start positions.
    #[inline]
    pub fn positions(&self) -> &'a [u32] {
        self.positions
    }

    /// Handler positions.
    #[inline]
    pub fn targets(&self) -> &'a [u32] {
        self.targets
    }

    /// Number of ranges.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the method has no catch ranges.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Handler position covering `throw_position`.
    ///
    /// Scans from the last range backwards; the first range starting at or
    /// before `throw_position` covers it. `None` means propagate.
    pub fn resolve(&self, throw_position: u32) -> Option<u32> {
        let index = self.positions.iter().rposition(|&start| start <= throw_position)?;
        match self.targets[index] {
            NO_HANDLER => None,
            handler => Some(handler),
        }
    }

    /// Iterate ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = CatchRange> + 'a {
        let positions = self.positions;
        let targets = self.targets;
        (0..positions.len()).map(move |i| CatchRange {
            start: positions[i],
            end: positions.get(i + 1).copied(),
            handler: (targets[i] != NO_HANDLER).then_some(targets[i]),
        })
    }
}

impl fmt::Display for CatchRangeTable<'_> {
    /// One line per range with a handler: `[start .. end) -> handler`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for range in self.ranges() {
            let Some(handler) = range.handler else {
                continue;
            };
            match range.end {
                Some(end) => writeln!(f, "[{:#x} .. {:#x}) -> {:#x}", range.start, end, handler)?,
                None => writeln!(f, "[{:#x} .. end) -> {:#x}", range.start, handler)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ranges_with_gaps() {
        let positions = [0, 3, 7];
        let targets = [0, 7, 0];
        let table = CatchRangeTable::new(&positions, &targets).unwrap();
        assert_eq!(table.resolve(2), None);
        assert_eq!(table.resolve(3), Some(7));
        assert_eq!(table.resolve(6), Some(7));
        assert_eq!(table.resolve(7), None);
        assert_eq!(table.resolve(11), None);
    }

    #[test]
    fn test_resolve_before_first_range() {
        let positions = [4];
        let targets = [20];
        let table = CatchRangeTable::new(&positions, &targets).unwrap();
        assert_eq!(table.resolve(3), None);
        assert_eq!(table.resolve(4), Some(20));
    }

    #[test]
    fn test_empty_table_propagates() {
        assert_eq!(CatchRangeTable::EMPTY.resolve(0), None);
        assert!(CatchRangeTable::EMPTY.is_empty());
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            CatchRangeTable::new(&[0, 4], &[8]),
            Err(TargetError::CatchTableLengthMismatch {
                ranges: 2,
                targets: 1
            })
        ));
    }

    #[test]
    fn test_unsorted_ranges() {
        assert!(matches!(
            CatchRangeTable::new(&[0, 8, 4], &[0, 12, 16]),
            Err(TargetError::UnsortedCatchRanges { index: 2 })
        ));
        // equal starts are allowed
        assert!(CatchRangeTable::new(&[4, 4], &[0, 12]).is_ok());
    }

    #[test]
    fn test_ranges_and_display() {
        let positions = [0, 3, 7];
        let targets = [0, 7, 0];
        let table = CatchRangeTable::new(&positions, &targets).unwrap();
        let ranges: Vec<_> = table.ranges().collect();
        assert_eq!(
            ranges[1],
            CatchRange {
                start: 3,
                end: Some(7),
                handler: Some(7)
            }
        );
        assert_eq!(ranges[2].end, None);
        assert_eq!(table.to_string(), "[0x3 .. 0x7) -> 0x7\n");
    }
}
