//! Call-site patching.
//!
//! Linking rewrites the target of direct call instructions. Two kinds of
//! rewrite exist:
//!
//! - **Patch**: legal while other threads may be executing the code. Only
//!   call-site shapes whose target is held in one naturally aligned 32-bit
//!   word qualify, since a single aligned store is atomic with respect to
//!   instruction fetch. Patching requires a [`PatchableCallSite`], which can
//!   only be obtained for such sites.
//! - **Fixup**: any call-site shape, but only before the method is published.
//!
//! # Supported Shapes
//!
//! | ISA     | Shape       | Bytes              | Atomic when            |
//! |---------|-------------|--------------------|------------------------|
//! | amd64   | `call rel32`| `E8 d32`           | `d32` is 4-byte aligned|
//! | amd64   | `jmp rel32` | `E9 d32`           | `d32` is 4-byte aligned|
//! | aarch64 | `bl imm26`  | one 32-bit word    | always                 |
//! | aarch64 | `b imm26`   | one 32-bit word    | always                 |

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::{Isa, aarch64, amd64};
use crate::error::TargetError;

// =============================================================================
// Call-Site Shapes
// =============================================================================

/// Recognized call-site instruction forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// amd64 `call rel32`.
    CallRel32,
    /// amd64 `jmp rel32` (tail call).
    JmpRel32,
    /// aarch64 `bl imm26`.
    BranchLink,
    /// aarch64 `b imm26` (tail call).
    Branch,
}

impl CallShape {
    /// Recognize the instruction at `position` in `code`.
    ///
    /// For code that is not yet published. Code that other threads may be
    /// patching is never read through a slice.
    pub fn decode(isa: Isa, code: &[u8], position: usize) -> Option<Self> {
        match isa {
            Isa::Amd64 => {
                if position + amd64::CALL_REL32_SIZE > code.len() {
                    return None;
                }
                Self::from_amd64_opcode(code[position])
            }
            Isa::Aarch64 => {
                let bytes = code.get(position..position + aarch64::INSTRUCTION_SIZE)?;
                let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Self::from_aarch64_word(word)
            }
        }
    }

    /// Recognize the instruction at `position` of code that other threads may
    /// be patching.
    ///
    /// # Safety
    /// `code_start..code_start + code_len` must be live code.
    pub(crate) unsafe fn decode_live(
        isa: Isa,
        code_start: usize,
        code_len: usize,
        position: usize,
    ) -> Option<Self> {
        let address = code_start.checked_add(position)?;
        match isa {
            Isa::Amd64 => {
                if position.checked_add(amd64::CALL_REL32_SIZE)? > code_len {
                    return None;
                }
                // SAFETY: in bounds per the caller. Patching never writes the
                // opcode byte.
                let opcode = unsafe { ptr::read(address as *const u8) };
                Self::from_amd64_opcode(opcode)
            }
            Isa::Aarch64 => {
                if position.checked_add(aarch64::INSTRUCTION_SIZE)? > code_len
                    || address % aarch64::INSTRUCTION_SIZE != 0
                {
                    return None;
                }
                // SAFETY: aligned and in bounds; pairs with `store_atomic`.
                let cell = unsafe { AtomicU32::from_ptr(address as *mut u32) };
                Self::from_aarch64_word(cell.load(Ordering::Acquire))
            }
        }
    }

    #[inline]
    fn from_amd64_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            amd64::CALL_REL32_OPCODE => Some(CallShape::CallRel32),
            amd64::JMP_REL32_OPCODE => Some(CallShape::JmpRel32),
            _ => None,
        }
    }

    #[inline]
    fn from_aarch64_word(word: u32) -> Option<Self> {
        match word & aarch64::BRANCH_OPCODE_MASK {
            aarch64::BL_OPCODE => Some(CallShape::BranchLink),
            aarch64::B_OPCODE => Some(CallShape::Branch),
            _ => None,
        }
    }

    /// Instruction size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            CallShape::CallRel32 | CallShape::JmpRel32 => amd64::CALL_REL32_SIZE,
            CallShape::BranchLink | CallShape::Branch => aarch64::INSTRUCTION_SIZE,
        }
    }

    /// Offset of the rewritable 32-bit word within the instruction.
    #[inline]
    const fn word_offset(self) -> usize {
        match self {
            CallShape::CallRel32 | CallShape::JmpRel32 => 1,
            CallShape::BranchLink | CallShape::Branch => 0,
        }
    }

    /// Whether the instruction at `address` can be retargeted atomically.
    #[inline]
    pub const fn is_atomically_patchable(self, address: usize) -> bool {
        (address + self.word_offset()) % 4 == 0
    }

    /// The 32-bit word that makes the instruction at `site` reach `target`.
    pub fn encode_target(self, site: usize, target: usize) -> Result<u32, TargetError> {
        let out_of_range = || TargetError::DisplacementOutOfRange { site, target };
        match self {
            CallShape::CallRel32 | CallShape::JmpRel32 => {
                let displacement = target as i64 - (site + self.size()) as i64;
                i32::try_from(displacement)
                    .map(|d| d as u32)
                    .map_err(|_| out_of_range())
            }
            CallShape::BranchLink | CallShape::Branch => {
                let displacement = target as i64 - site as i64;
                let word = aarch64::encode_branch(displacement, self == CallShape::BranchLink);
                word.ok_or_else(out_of_range)
            }
        }
    }

    /// Target address encoded by `word` for the instruction at `site`.
    pub fn decode_target(self, site: usize, word: u32) -> usize {
        match self {
            CallShape::CallRel32 | CallShape::JmpRel32 => {
                (site as i64 + self.size() as i64 + word as i32 as i64) as usize
            }
            CallShape::BranchLink | CallShape::Branch => {
                (site as i64 + aarch64::decode_branch(word)) as usize
            }
        }
    }
}

// =============================================================================
// Patchable Call Sites
// =============================================================================

/// Capability to retarget one call site while its code may be executing.
///
/// Only constructed by [`PatchableCallSite::classify`], which admits exactly
/// the shapes whose target word can be stored atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchableCallSite {
    shape: CallShape,
    address: usize,
}

impl PatchableCallSite {
    /// Classify the call site at `position` of code starting at `code_start`.
    ///
    /// # Safety
    /// `code_start..code_start + code_len` must be live code.
    pub(crate) unsafe fn classify(
        isa: Isa,
        code_start: usize,
        code_len: usize,
        position: usize,
    ) -> Option<Self> {
        // SAFETY: forwarded from the caller.
        let shape = unsafe { CallShape::decode_live(isa, code_start, code_len, position) }?;
        let address = code_start + position;
        shape
            .is_atomically_patchable(address)
            .then_some(Self { shape, address })
    }

    /// Shape of the call instruction.
    #[inline]
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    /// Address of the call instruction.
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    fn word_address(&self) -> usize {
        self.address + self.shape.word_offset()
    }
}

// =============================================================================
// Memory Writes
// =============================================================================

/// Atomically store the target word of `site`.
///
/// # Safety
/// `site` must describe a call instruction inside live, writable code.
pub(crate) unsafe fn store_atomic(site: &PatchableCallSite, word: u32) {
    // SAFETY: classify guarantees 4-byte alignment; the caller guarantees the
    // memory is live and writable.
    let cell = unsafe { AtomicU32::from_ptr(site.word_address() as *mut u32) };
    cell.store(word, Ordering::Release);
}

/// Store the target word of a call at `address` without synchronization.
///
/// # Safety
/// `address` must be a call instruction of `shape` inside live, writable code
/// that no other thread can execute yet.
pub(crate) unsafe fn store_unsynchronized(shape: CallShape, address: usize, word: u32) {
    let dst = (address + shape.word_offset()) as *mut u32;
    // SAFETY: guaranteed by the caller; the word may be unaligned.
    unsafe { ptr::write_unaligned(dst, word) };
}

/// Load the target word of a call at `address`.
///
/// # Safety
/// `address` must be a call instruction of `shape` inside live code.
pub(crate) unsafe fn load(shape: CallShape, address: usize) -> u32 {
    let src = (address + shape.word_offset()) as *const u32;
    if shape.is_atomically_patchable(address) {
        // SAFETY: aligned and live per the caller; pairs with `store_atomic`.
        unsafe { AtomicU32::from_ptr(src as *mut u32) }.load(Ordering::Acquire)
    } else {
        // SAFETY: live per the caller; unaligned reads are fine here.
        unsafe { ptr::read_unaligned(src) }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Call-site rewrite counters.
#[derive(Debug, Default)]
pub struct PatchStats {
    /// Atomic patches of published code.
    patches: AtomicU64,
    /// Fix-ups of unpublished code.
    fixups: AtomicU64,
}

/// Snapshot of [`PatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchStatsSnapshot {
    /// Atomic patches of published code.
    pub patches: u64,
    /// Fix-ups of unpublished code.
    pub fixups: u64,
}

impl PatchStats {
    #[inline]
    pub(crate) fn record_patch(&self) {
        self.patches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_fixup(&self) {
        self.fixups.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> PatchStatsSnapshot {
        PatchStatsSnapshot {
            patches: self.patches.load(Ordering::Relaxed),
            fixups: self.fixups.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_shapes() {
        let code = [0x90, 0xE8, 0, 0, 0, 0, 0xE9, 0, 0, 0, 0];
        assert_eq!(CallShape::decode(Isa::Amd64, &code, 1), Some(CallShape::CallRel32));
        assert_eq!(CallShape::decode(Isa::Amd64, &code, 6), Some(CallShape::JmpRel32));
        assert_eq!(CallShape::decode(Isa::Amd64, &code, 0), None);
        // truncated instruction
        assert_eq!(CallShape::decode(Isa::Amd64, &code[..9], 6), None);

        let bl = aarch64::BL_OPCODE.to_le_bytes();
        assert_eq!(CallShape::decode(Isa::Aarch64, &bl, 0), Some(CallShape::BranchLink));
        let nop = aarch64::NOP.to_le_bytes();
        assert_eq!(CallShape::decode(Isa::Aarch64, &nop, 0), None);
    }

    #[test]
    fn test_amd64_patchability_depends_on_displacement_alignment() {
        assert!(CallShape::CallRel32.is_atomically_patchable(0x1003));
        assert!(!CallShape::CallRel32.is_atomically_patchable(0x1000));
        assert!(CallShape::BranchLink.is_atomically_patchable(0x1000));
    }

    #[repr(align(16))]
    struct Code([u8; 16]);

    #[test]
    fn test_classify_grants_capability_only_for_aligned_sites() {
        let mut code = Code([0x90; 16]);
        code.0[3] = amd64::CALL_REL32_OPCODE;
        code.0[8] = amd64::CALL_REL32_OPCODE;
        code.0[13] = amd64::CALL_REL32_OPCODE;
        let start = code.0.as_ptr() as usize;
        let classify =
            |position| unsafe { PatchableCallSite::classify(Isa::Amd64, start, 16, position) };
        assert_eq!(classify(3).map(|site| site.address()), Some(start + 3));
        assert_eq!(classify(8), None);
        assert_eq!(classify(0), None);
        // the instruction must end inside the code
        assert_eq!(classify(13), None);
    }

    #[test]
    fn test_decode_live_reads_aarch64_words() {
        let mut code = Code([0; 16]);
        code.0[..4].copy_from_slice(&aarch64::BL_OPCODE.to_le_bytes());
        code.0[4..8].copy_from_slice(&aarch64::NOP.to_le_bytes());
        let start = code.0.as_ptr() as usize;
        let decode =
            |position| unsafe { CallShape::decode_live(Isa::Aarch64, start, 16, position) };
        assert_eq!(decode(0), Some(CallShape::BranchLink));
        assert_eq!(decode(4), None);
        // misaligned
        assert_eq!(decode(2), None);
        assert_eq!(decode(16), None);
    }

    #[test]
    fn test_target_encoding_round_trip() {
        let site = 0x10_0003;
        for shape in [CallShape::CallRel32, CallShape::BranchLink] {
            let site = if shape == CallShape::BranchLink { site + 1 } else { site };
            for target in [site + 0x40, site - 0x1000, site] {
                let word = shape.encode_target(site, target).unwrap();
                assert_eq!(shape.decode_target(site, word), target);
            }
        }
    }

    #[test]
    fn test_target_out_of_range() {
        let far = 1usize << 33;
        assert!(matches!(
            CallShape::CallRel32.encode_target(0x1000, far),
            Err(TargetError::DisplacementOutOfRange { .. })
        ));
        assert!(CallShape::BranchLink.encode_target(0x1000, 0x1002).is_err());
    }

    #[test]
    fn test_store_and_load() {
        let mut code = Code([0; 16]);
        code.0[3] = amd64::CALL_REL32_OPCODE;
        code.0[8] = amd64::CALL_REL32_OPCODE;
        let start = code.0.as_mut_ptr() as usize;

        let site = unsafe { PatchableCallSite::classify(Isa::Amd64, start, 16, 3) }.unwrap();
        unsafe { store_atomic(&site, 0x1122_3344) };
        assert_eq!(unsafe { load(CallShape::CallRel32, site.address()) }, 0x1122_3344);
        unsafe { store_unsynchronized(CallShape::CallRel32, start + 8, 0x5566_7788) };
        assert_eq!(unsafe { load(CallShape::CallRel32, start + 8) }, 0x5566_7788);
        assert_eq!(code.0[9..13], [0x88, 0x77, 0x66, 0x55]);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = PatchStats::default();
        stats.record_patch();
        stats.record_fixup();
        stats.record_fixup();
        assert_eq!(
            stats.snapshot(),
            PatchStatsSnapshot {
                patches: 1,
                fixups: 2
            }
        );
    }
}
