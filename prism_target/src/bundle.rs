//! Bundle layout.
//!
//! A compiled method's code and metadata arrays live in one contiguous
//! allocation called a *bundle*. Each array field gets a *cell*: a byte range
//! inside the bundle. Cells carry no headers; their lengths are recorded in
//! the [`BundleLayout`] instead.
//!
//! # Memory Layout
//!
//! ```text
//! base -> +-----------------------+
//!         | catch range positions |  u32[]
//!         | catch block positions |  u32[]
//!         | stop positions        |  u32[]
//!         | direct callees        |  u64[]
//!         | reference maps        |  u8[]
//!         | scalar literals       |  u8[] (word aligned)
//!         | reference literals    |  u64[]
//!         +-----------------------+ <- 16-byte aligned
//!         | code                  |  u8[] (at least one word)
//!         +-----------------------+ <- rounded to a word
//! ```
//!
//! The literal pools sit directly below the code so that PC-relative
//! literal loads use small displacements. Because those displacements are
//! baked into the code, the layout is a pure function of the field lengths.

use std::fmt;

use crate::arch::WORD_SIZE;

/// Alignment of the code cell, and therefore of every bundle.
pub const CODE_ALIGNMENT: usize = 16;

// =============================================================================
// Array Fields
// =============================================================================

/// Variable-length array fields of a bundle, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArrayField {
    /// Start positions of catch ranges.
    CatchRangePositions,
    /// Handler positions paired with catch ranges.
    CatchBlockPositions,
    /// Packed stop entries.
    StopPositions,
    /// Callee words of direct calls.
    DirectCallees,
    /// Reference-map blob.
    ReferenceMaps,
    /// Raw scalar constants.
    ScalarLiterals,
    /// Object references embedded in the code.
    ReferenceLiterals,
    /// Machine code.
    Code,
}

impl ArrayField {
    /// Number of fields.
    pub const COUNT: usize = 8;

    /// All fields in layout order.
    pub const ALL: [ArrayField; Self::COUNT] = [
        ArrayField::CatchRangePositions,
        ArrayField::CatchBlockPositions,
        ArrayField::StopPositions,
        ArrayField::DirectCallees,
        ArrayField::ReferenceMaps,
        ArrayField::ScalarLiterals,
        ArrayField::ReferenceLiterals,
        ArrayField::Code,
    ];

    /// Size of one element in bytes.
    #[inline]
    pub const fn element_size(self) -> usize {
        match self {
            ArrayField::CatchRangePositions
            | ArrayField::CatchBlockPositions
            | ArrayField::StopPositions => 4,
            ArrayField::DirectCallees | ArrayField::ReferenceLiterals => WORD_SIZE,
            ArrayField::ReferenceMaps | ArrayField::ScalarLiterals | ArrayField::Code => 1,
        }
    }

    /// Alignment of the field's cell.
    ///
    /// Scalar literals are loaded as words and doubles, so their byte pool is
    /// word aligned.
    #[inline]
    pub const fn alignment(self) -> usize {
        match self {
            ArrayField::ScalarLiterals => WORD_SIZE,
            ArrayField::Code => CODE_ALIGNMENT,
            _ => self.element_size(),
        }
    }

    /// Bytes reserved for the cell when the field is empty.
    #[inline]
    pub const fn reserved_size(self) -> usize {
        match self {
            ArrayField::Code => WORD_SIZE,
            _ => 0,
        }
    }

    /// Short name used in traces.
    pub const fn name(self) -> &'static str {
        match self {
            ArrayField::CatchRangePositions => "catchRangePositions",
            ArrayField::CatchBlockPositions => "catchBlockPositions",
            ArrayField::StopPositions => "stopPositions",
            ArrayField::DirectCallees => "directCallees",
            ArrayField::ReferenceMaps => "referenceMaps",
            ArrayField::ScalarLiterals => "scalarLiterals",
            ArrayField::ReferenceLiterals => "referenceLiterals",
            ArrayField::Code => "code",
        }
    }
}

impl fmt::Display for ArrayField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Cells
// =============================================================================

/// Placement of one field inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cell {
    /// Byte offset from the bundle base; `None` for an empty field.
    pub offset: Option<usize>,
    /// Cell size in bytes.
    pub size: usize,
    /// Logical length in elements.
    pub length: usize,
}

impl Cell {
    /// Byte range of the cell, if it has one.
    #[inline]
    pub fn range(&self) -> Option<std::ops::Range<usize>> {
        self.offset.map(|offset| offset..offset + self.size)
    }
}

// =============================================================================
// Bundle Layout
// =============================================================================

/// Offsets and sizes of every cell of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    cells: [Cell; ArrayField::COUNT],
    size: usize,
}

impl Default for BundleLayout {
    fn default() -> Self {
        Self::layout([])
    }
}

impl BundleLayout {
    /// Lay out a bundle for the given field lengths.
    ///
    /// Fields not mentioned have length zero.
    pub fn layout(lengths: impl IntoIterator<Item = (ArrayField, usize)>) -> Self {
        let mut layout = Self {
            cells: [Cell::default(); ArrayField::COUNT],
            size: 0,
        };
        for (field, length) in lengths {
            layout.cells[field as usize].length = length;
        }
        layout.compute();
        layout
    }

    /// Change one field's length and recompute every cell.
    pub fn update(&mut self, field: ArrayField, length: usize) {
        self.cells[field as usize].length = length;
        self.compute();
    }

    /// Linear bump allocation over the fields in declared order.
    fn compute(&mut self) {
        let mut cursor = 0usize;
        for field in ArrayField::ALL {
            let cell = &mut self.cells[field as usize];
            let size = (cell.length * field.element_size()).max(field.reserved_size());
            if size == 0 {
                cell.offset = None;
                cell.size = 0;
                continue;
            }
            cursor = align_up(cursor, field.alignment());
            cell.offset = Some(cursor);
            cell.size = size;
            cursor += size;
        }
        self.size = align_up(cursor, WORD_SIZE);
    }

    /// Cell of `field`.
    #[inline]
    pub fn cell(&self, field: ArrayField) -> Cell {
        self.cells[field as usize]
    }

    /// Logical length of `field`.
    #[inline]
    pub fn length(&self, field: ArrayField) -> usize {
        self.cells[field as usize].length
    }

    /// Offset of `field`'s cell from the bundle base.
    #[inline]
    pub fn offset(&self, field: ArrayField) -> Option<usize> {
        self.cells[field as usize].offset
    }

    /// Offset of the code cell; always present.
    #[inline]
    pub fn code_offset(&self) -> usize {
        self.cells[ArrayField::Code as usize].offset.unwrap_or(0)
    }

    /// Signed distance from the start of the code to `field`'s cell.
    #[inline]
    pub fn offset_from_code(&self, field: ArrayField) -> Option<isize> {
        self.offset(field)
            .map(|offset| offset as isize - self.code_offset() as isize)
    }

    /// Total bundle size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for BundleLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bundle ({} bytes)", self.size)?;
        for field in ArrayField::ALL {
            let cell = self.cell(field);
            match cell.range() {
                Some(range) => writeln!(
                    f,
                    "  {:<20} [{:#06x} .. {:#06x}) length {}",
                    field.name(),
                    range.start,
                    range.end,
                    cell.length
                )?,
                None => writeln!(f, "  {:<20} <empty>", field.name())?,
            }
        }
        Ok(())
    }
}

#[inline(always)]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_layout_reserves_code() {
        let layout = BundleLayout::default();
        let code = layout.cell(ArrayField::Code);
        assert_eq!(code.offset, Some(0));
        assert_eq!(code.size, WORD_SIZE);
        assert_eq!(code.length, 0);
        assert_eq!(layout.size(), WORD_SIZE);
        for field in &ArrayField::ALL[..7] {
            assert_eq!(layout.offset(*field), None);
            assert_eq!(layout.cell(*field).size, 0);
        }
    }

    #[test]
    fn test_cells_follow_declared_order_and_alignment() {
        let layout = BundleLayout::layout([
            (ArrayField::CatchRangePositions, 3),
            (ArrayField::CatchBlockPositions, 3),
            (ArrayField::StopPositions, 1),
            (ArrayField::DirectCallees, 1),
            (ArrayField::ReferenceMaps, 5),
            (ArrayField::ScalarLiterals, 3),
            (ArrayField::ReferenceLiterals, 2),
            (ArrayField::Code, 37),
        ]);
        assert_eq!(layout.offset(ArrayField::CatchRangePositions), Some(0));
        assert_eq!(layout.offset(ArrayField::CatchBlockPositions), Some(12));
        assert_eq!(layout.offset(ArrayField::StopPositions), Some(24));
        assert_eq!(layout.offset(ArrayField::DirectCallees), Some(32));
        assert_eq!(layout.offset(ArrayField::ReferenceMaps), Some(40));
        assert_eq!(layout.offset(ArrayField::ScalarLiterals), Some(48));
        assert_eq!(layout.offset(ArrayField::ReferenceLiterals), Some(56));
        assert_eq!(layout.offset(ArrayField::Code), Some(80));
        assert_eq!(layout.size(), 120);
        assert_eq!(layout.offset_from_code(ArrayField::ReferenceLiterals), Some(-24));
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut layout =
            BundleLayout::layout([(ArrayField::Code, 10), (ArrayField::StopPositions, 2)]);
        let before = layout.clone();
        layout.update(ArrayField::Code, 10);
        assert_eq!(layout, before);
    }

    #[test]
    fn test_update_moves_later_cells_only() {
        let mut layout = BundleLayout::layout([
            (ArrayField::StopPositions, 2),
            (ArrayField::ReferenceMaps, 4),
            (ArrayField::Code, 10),
        ]);
        let stops = layout.offset(ArrayField::StopPositions);
        let code = layout.code_offset();
        layout.update(ArrayField::ReferenceMaps, 40);
        assert_eq!(layout.offset(ArrayField::StopPositions), stops);
        assert!(layout.code_offset() > code);
        layout.update(ArrayField::ReferenceMaps, 0);
        assert_eq!(layout.offset(ArrayField::ReferenceMaps), None);
        assert_eq!(layout.code_offset(), 16);
    }

    #[test]
    fn test_display_lists_every_field() {
        let text = BundleLayout::layout([(ArrayField::Code, 4)]).to_string();
        assert_eq!(text.lines().count(), 1 + ArrayField::COUNT);
        assert!(text.contains("code"));
    }
}
