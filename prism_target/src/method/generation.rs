//! Installing generated code.
//!
//! A code generator describes its output as a [`GeneratedCode`] value. Calling
//! [`CompiledMethod::set_generated`] validates the tables, lays out and
//! allocates the bundle, copies every array into its cell, resolves
//! PC-relative literal references, and publishes the result in one step.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{Level, debug, enabled, trace};

use super::{CompiledMethod, DirectCallee, Generated, ObjectRef};
use crate::bundle::{ArrayField, BundleLayout};
use crate::catch::{CatchRangeTable, NO_HANDLER};
use crate::error::{TargetError, fatal};
use crate::refmap::{ReferenceMapLayout, compute_size};
use crate::region::CodeRegion;
use crate::stops::{self, POSITION_MASK, RESERVED_BIT, StopTable};

// =============================================================================
// Literal Patches
// =============================================================================

/// A PC-relative reference from the code to a literal pool entry.
///
/// The 32-bit displacement at `position` is filled in once the bundle layout
/// is known, relative to the instruction that ends at `next_instruction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralPatch {
    /// Position of the 32-bit displacement in the code.
    pub position: u32,
    /// Position of the instruction following the reference.
    pub next_instruction: u32,
    /// [`ArrayField::ScalarLiterals`] or [`ArrayField::ReferenceLiterals`].
    pub pool: ArrayField,
    /// Byte offset of the referenced entry within the pool.
    pub offset: u32,
}

// =============================================================================
// Generated Code
// =============================================================================

/// Output of a code generator, ready to be installed.
///
/// Stop entries are zoned: direct calls, then indirect calls, then
/// safepoints. There is one direct callee per direct call.
#[derive(Debug, Clone, Default)]
pub struct GeneratedCode {
    /// Machine code.
    pub code: Vec<u8>,
    /// Raw scalar constants.
    pub scalar_literals: Vec<u8>,
    /// Object references embedded in the code.
    pub reference_literals: Vec<ObjectRef>,
    /// References from the code into the literal pools.
    pub literal_patches: Vec<LiteralPatch>,
    /// Packed stop entries (see [`crate::stops`]).
    pub stop_positions: Vec<u32>,
    /// Callee of each direct call.
    pub direct_callees: Vec<DirectCallee>,
    /// Number of indirect calls.
    pub indirect_calls: usize,
    /// Number of safepoints.
    pub safepoints: usize,
    /// Ascending start positions of catch ranges.
    pub catch_range_positions: Vec<u32>,
    /// Handler of each catch range, zero for none.
    pub catch_block_positions: Vec<u32>,
    /// Frame maps of every stop, then register maps of every safepoint.
    pub reference_maps: Vec<u8>,
    /// Bytes per frame map.
    pub frame_map_size: usize,
    /// Bytes per register map.
    pub register_map_size: usize,
    /// Frame size in bytes.
    pub frame_size: u32,
    /// Start of the epilogue restoring callee-saved registers, if any.
    pub register_restore_epilogue_offset: Option<u32>,
    /// Position of the prologue call into a calling-convention adapter.
    pub adapter_call: Option<u32>,
}

impl GeneratedCode {
    /// Start from machine code with empty tables.
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    /// Add a direct call at `position`.
    pub fn with_direct_call(mut self, position: u32, native: bool, callee: DirectCallee) -> Self {
        let index = self.direct_callees.len();
        self.stop_positions.insert(index, entry(position, native));
        self.direct_callees.push(callee);
        self
    }

    /// Add an indirect call at `position`.
    pub fn with_indirect_call(mut self, position: u32, native: bool) -> Self {
        let index = self.direct_callees.len() + self.indirect_calls;
        self.stop_positions.insert(index, entry(position, native));
        self.indirect_calls += 1;
        self
    }

    /// Add a safepoint at `position`.
    pub fn with_safepoint(mut self, position: u32) -> Self {
        self.stop_positions.push(entry(position, false));
        self.safepoints += 1;
        self
    }

    /// Add a catch range starting at `start`; `None` propagates.
    pub fn with_catch_range(mut self, start: u32, handler: Option<u32>) -> Self {
        self.catch_range_positions.push(start);
        self.catch_block_positions.push(handler.unwrap_or(NO_HANDLER));
        self
    }

    /// Set the reference-map blob and per-map sizes.
    pub fn with_reference_maps(
        mut self,
        frame_map_size: usize,
        register_map_size: usize,
        maps: Vec<u8>,
    ) -> Self {
        self.frame_map_size = frame_map_size;
        self.register_map_size = register_map_size;
        self.reference_maps = maps;
        self
    }

    /// Set the scalar literal pool.
    pub fn with_scalar_literals(mut self, literals: Vec<u8>) -> Self {
        self.scalar_literals = literals;
        self
    }

    /// Set the reference literal pool.
    pub fn with_reference_literals(mut self, literals: Vec<ObjectRef>) -> Self {
        self.reference_literals = literals;
        self
    }

    /// Add a literal reference to resolve at install time.
    pub fn with_literal_patch(mut self, patch: LiteralPatch) -> Self {
        self.literal_patches.push(patch);
        self
    }

    /// Set the frame size.
    pub fn with_frame_size(mut self, frame_size: u32) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Mark the method as saving callee-saved registers.
    pub fn with_register_restore_epilogue(mut self, offset: u32) -> Self {
        self.register_restore_epilogue_offset = Some(offset);
        self
    }

    /// Record the prologue call into an adapter.
    pub fn with_adapter_call(mut self, position: u32) -> Self {
        self.adapter_call = Some(position);
        self
    }

    /// Number of direct calls.
    #[inline]
    pub fn direct_calls(&self) -> usize {
        self.direct_callees.len()
    }

    /// Check that every table is shape-consistent.
    ///
    /// The contents of reference maps are not inspected.
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.code.len() > POSITION_MASK as usize {
            return Err(TargetError::PositionOutOfRange(self.code.len()));
        }

        let stops = StopTable::new(
            &self.stop_positions,
            self.direct_calls(),
            self.indirect_calls,
            self.safepoints,
        )?;
        for (index, &entry) in stops.entries().iter().enumerate() {
            let position = stops::decode(entry);
            if entry & RESERVED_BIT != 0 || position as usize >= self.code.len() {
                return Err(TargetError::StopOutOfRange {
                    index,
                    position,
                    code_len: self.code.len(),
                });
            }
        }

        CatchRangeTable::new(&self.catch_range_positions, &self.catch_block_positions)?;

        let expected = compute_size(
            self.direct_calls(),
            self.indirect_calls,
            self.safepoints,
            self.frame_map_size,
            self.register_map_size,
        );
        if self.reference_maps.len() != expected {
            return Err(TargetError::ReferenceMapSizeMismatch {
                expected,
                actual: self.reference_maps.len(),
            });
        }

        for patch in &self.literal_patches {
            let pool_size = match patch.pool {
                ArrayField::ScalarLiterals => self.scalar_literals.len(),
                ArrayField::ReferenceLiterals => {
                    self.reference_literals.len() * ArrayField::ReferenceLiterals.element_size()
                }
                _ => 0,
            };
            let in_code = patch.position as usize + 4 <= self.code.len()
                && patch.next_instruction as usize <= self.code.len();
            if !in_code || patch.offset as usize >= pool_size {
                return Err(TargetError::LiteralPatchOutOfRange {
                    position: patch.position,
                    field: patch.pool,
                });
            }
        }
        Ok(())
    }

    /// Bundle layout for these arrays.
    pub fn layout(&self) -> BundleLayout {
        BundleLayout::layout([
            (ArrayField::CatchRangePositions, self.catch_range_positions.len()),
            (ArrayField::CatchBlockPositions, self.catch_block_positions.len()),
            (ArrayField::StopPositions, self.stop_positions.len()),
            (ArrayField::DirectCallees, self.direct_callees.len()),
            (ArrayField::ReferenceMaps, self.reference_maps.len()),
            (ArrayField::ScalarLiterals, self.scalar_literals.len()),
            (ArrayField::ReferenceLiterals, self.reference_literals.len()),
            (ArrayField::Code, self.code.len()),
        ])
    }
}

/// Stop entry for a builder position; out-of-range positions become an
/// entry that `validate` rejects.
fn entry(position: u32, native: bool) -> u32 {
    stops::encode(position as usize, native).unwrap_or(u32::MAX)
}

// =============================================================================
// Installation
// =============================================================================

impl CompiledMethod {
    /// Install generated code, allocating its bundle from `region`.
    ///
    /// May be called once per method. Of racing calls only the first to
    /// claim the method allocates a bundle; the others fail with
    /// [`TargetError::AlreadyGenerated`]. Malformed tables are a code
    /// generator bug and halt the VM; running out of code space is reported
    /// as an error and releases the claim.
    pub fn set_generated(
        &self,
        region: &Arc<CodeRegion>,
        generated: GeneratedCode,
    ) -> Result<(), TargetError> {
        if self.installing.swap(true, Ordering::AcqRel) {
            return Err(TargetError::AlreadyGenerated(self.name().to_owned()));
        }
        if let Err(err) = generated.validate() {
            fatal!("malformed tables for {self}: {err}");
        }

        let layout = generated.layout();
        let mut bundle = match region.allocate_bundle(layout) {
            Ok(bundle) => bundle,
            Err(err) => {
                self.installing.store(false, Ordering::Release);
                return Err(err);
            }
        };

        bundle.write_cell(ArrayField::CatchRangePositions, &generated.catch_range_positions);
        bundle.write_cell(ArrayField::CatchBlockPositions, &generated.catch_block_positions);
        bundle.write_cell(ArrayField::StopPositions, &generated.stop_positions);
        let callee_words: Vec<u64> =
            generated.direct_callees.iter().map(DirectCallee::word).collect();
        bundle.write_cell(ArrayField::DirectCallees, &callee_words);
        bundle.write_cell(ArrayField::ReferenceMaps, &generated.reference_maps);
        bundle.write_cell(ArrayField::ScalarLiterals, &generated.scalar_literals);
        let reference_words: Vec<u64> =
            generated.reference_literals.iter().map(|r| r.0).collect();
        bundle.write_cell(ArrayField::ReferenceLiterals, &reference_words);
        bundle.write_cell(ArrayField::Code, &generated.code);

        let layout = bundle.layout().clone();
        let code = bundle.code_mut();
        for patch in &generated.literal_patches {
            let Some(pool) = layout.offset_from_code(patch.pool) else {
                continue;
            };
            let displacement = pool + patch.offset as isize - patch.next_instruction as isize;
            let at = patch.position as usize;
            code[at..at + 4].copy_from_slice(&(displacement as i32).to_le_bytes());
        }

        let stops = StopTable::from_parts(
            &generated.stop_positions,
            generated.direct_calls(),
            generated.indirect_calls,
        );
        let reference_map_layout =
            ReferenceMapLayout::new(&stops, generated.frame_map_size, generated.register_map_size);

        let installed = Generated {
            bundle,
            direct_callees: generated.direct_callees.into_boxed_slice(),
            indirect_calls: generated.indirect_calls,
            reference_map_layout,
            frame_size: generated.frame_size,
            register_restore_epilogue_offset: generated.register_restore_epilogue_offset,
            adapter_call: generated.adapter_call,
        };
        if self.generated.set(installed).is_err() {
            fatal!("{self} was installed without claiming it");
        }

        debug!(
            method = %self,
            code_start = format_args!("{:#x}", self.code_start()),
            code_len = self.code_len(),
            stops = self.stops().len(),
            "installed generated code"
        );
        if enabled!(Level::TRACE) {
            trace!("{}", self.trace_bundle());
        }
        Ok(())
    }
}
