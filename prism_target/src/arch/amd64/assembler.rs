//! x64 assembler for stub and adapter emission.
//!
//! Covers the handful of instruction forms that generated glue code needs:
//! stack frame setup, argument moves between registers and frame slots,
//! direct and indirect calls, and padding.

use super::registers::{Gpr, Xmm};
use super::{CALL_REL32_OPCODE, JMP_REL32_OPCODE};

/// Recommended multi-byte NOP sequences, indexed by length - 1.
const NOPS: [&[u8]; 8] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// REX.W
const REX_W: u8 = 0x48;

/// Code buffer for emitting x64 instructions.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    /// Create a new assembler.
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Current emission offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Emit raw bytes.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Get the assembled code.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    // =========================================================================
    // Padding
    // =========================================================================

    /// Emit `len` bytes of NOPs using the longest available forms.
    pub fn nop(&mut self, mut len: usize) {
        while len > 0 {
            let chunk = len.min(NOPS.len());
            self.emit(NOPS[chunk - 1]);
            len -= chunk;
        }
    }

    /// Pad with NOPs until the position is `position`.
    pub fn pad_to(&mut self, position: usize) {
        debug_assert!(self.position() <= position);
        self.nop(position - self.position());
    }

    /// Pad with NOPs until `position + offset` is a multiple of `align`.
    ///
    /// Used to place the displacement of a call on a 4-byte boundary so the
    /// call can later be patched atomically.
    pub fn align_with_offset(&mut self, align: usize, offset: usize) {
        let misalignment = (self.position() + offset) % align;
        if misalignment != 0 {
            self.nop(align - misalignment);
        }
    }

    // =========================================================================
    // Control Transfer
    // =========================================================================

    /// `call rel32`; returns the position of the call instruction.
    pub fn call_rel32(&mut self, displacement: i32) -> usize {
        let position = self.position();
        self.emit(&[CALL_REL32_OPCODE]);
        self.emit(&displacement.to_le_bytes());
        position
    }

    /// `jmp rel32`; returns the position of the jump instruction.
    pub fn jmp_rel32(&mut self, displacement: i32) -> usize {
        let position = self.position();
        self.emit(&[JMP_REL32_OPCODE]);
        self.emit(&displacement.to_le_bytes());
        position
    }

    /// `jmp rel8`.
    pub fn jmp_short(&mut self, displacement: i8) {
        self.emit(&[0xEB, displacement as u8]);
    }

    /// `call reg`; returns the position just after the call.
    pub fn call_reg(&mut self, target: Gpr) -> usize {
        self.emit_rex_b(target);
        self.emit(&[0xFF, modrm(0b11, 2, target.low_bits())]);
        self.position()
    }

    /// `jmp reg`.
    pub fn jmp_reg(&mut self, target: Gpr) {
        self.emit_rex_b(target);
        self.emit(&[0xFF, modrm(0b11, 4, target.low_bits())]);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.emit(&[0xC3]);
    }

    /// `ret imm16`, popping `bytes` of arguments.
    pub fn ret_pop(&mut self, bytes: u16) {
        if bytes == 0 {
            self.ret();
        } else {
            self.emit(&[0xC2]);
            self.emit(&bytes.to_le_bytes());
        }
    }

    // =========================================================================
    // Stack
    // =========================================================================

    /// `push reg`.
    pub fn push(&mut self, reg: Gpr) {
        self.emit_rex_b(reg);
        self.emit(&[0x50 + reg.low_bits()]);
    }

    /// `pop reg`.
    pub fn pop(&mut self, reg: Gpr) {
        self.emit_rex_b(reg);
        self.emit(&[0x58 + reg.low_bits()]);
    }

    /// `push qword [base + disp32]`.
    pub fn push_mem(&mut self, base: Gpr, disp: i32) {
        self.emit_rex_b(base);
        self.emit(&[0xFF]);
        self.emit_mem(6, base, disp);
    }

    // =========================================================================
    // Moves and Arithmetic
    // =========================================================================

    /// `mov dst, src` (64-bit).
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(&[rex(true, src.high_bit(), dst.high_bit())]);
        self.emit(&[0x89, modrm(0b11, src.low_bits(), dst.low_bits())]);
    }

    /// `mov dst, [base + disp32]` (64-bit).
    pub fn mov_load(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.emit(&[rex(true, dst.high_bit(), base.high_bit())]);
        self.emit(&[0x8B]);
        self.emit_mem(dst.low_bits(), base, disp);
    }

    /// `mov dst, imm64`.
    pub fn mov_imm64(&mut self, dst: Gpr, imm: u64) {
        self.emit(&[rex(true, false, dst.high_bit()), 0xB8 + dst.low_bits()]);
        self.emit(&imm.to_le_bytes());
    }

    /// `add dst, imm8` (64-bit).
    pub fn add_imm8(&mut self, dst: Gpr, imm: i8) {
        self.emit(&[rex(true, false, dst.high_bit())]);
        self.emit(&[0x83, modrm(0b11, 0, dst.low_bits()), imm as u8]);
    }

    /// `sub dst, imm8` (64-bit).
    pub fn sub_imm8(&mut self, dst: Gpr, imm: i8) {
        self.emit(&[rex(true, false, dst.high_bit())]);
        self.emit(&[0x83, modrm(0b11, 5, dst.low_bits()), imm as u8]);
    }

    /// `movsd dst, [base + disp32]`.
    pub fn movsd_load(&mut self, dst: Xmm, base: Gpr, disp: i32) {
        self.emit(&[0xF2]);
        if dst.high_bit() || base.high_bit() {
            self.emit(&[rex(false, dst.high_bit(), base.high_bit())]);
        }
        self.emit(&[0x0F, 0x10]);
        self.emit_mem(dst.low_bits(), base, disp);
    }

    /// `movsd [base + disp32], src`.
    pub fn movsd_store(&mut self, base: Gpr, disp: i32, src: Xmm) {
        self.emit(&[0xF2]);
        if src.high_bit() || base.high_bit() {
            self.emit(&[rex(false, src.high_bit(), base.high_bit())]);
        }
        self.emit(&[0x0F, 0x11]);
        self.emit_mem(src.low_bits(), base, disp);
    }

    // =========================================================================
    // Encoding Helpers
    // =========================================================================

    fn emit_rex_b(&mut self, reg: Gpr) {
        if reg.high_bit() {
            self.emit(&[0x41]);
        }
    }

    /// ModR/M (mod=10) + optional SIB + disp32.
    fn emit_mem(&mut self, reg: u8, base: Gpr, disp: i32) {
        self.emit(&[modrm(0b10, reg, base.low_bits())]);
        if base.needs_sib_as_base() {
            self.emit(&[0x24]);
        }
        self.emit(&disp.to_le_bytes());
    }
}

#[inline(always)]
const fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

#[inline(always)]
const fn rex(w: bool, r: bool, b: bool) -> u8 {
    let mut byte = 0x40;
    if w {
        byte |= REX_W;
    }
    if r {
        byte |= 0x04;
    }
    if b {
        byte |= 0x01;
    }
    byte
}
