//! AArch64 encoding support.
//!
//! Every instruction is one aligned 32-bit word, so any `bl` or `b` whose
//! word lies inside an aligned code cell can be rewritten with a single
//! atomic store.

/// Size of every instruction.
pub const INSTRUCTION_SIZE: usize = 4;

/// Reach of `bl imm26`: `-BL_REACH` inclusive to `BL_REACH` exclusive.
pub const BL_REACH: u64 = 128 * 1024 * 1024;

/// `bl` opcode bits.
pub const BL_OPCODE: u32 = 0x9400_0000;

/// `b` opcode bits.
pub const B_OPCODE: u32 = 0x1400_0000;

/// Mask selecting the opcode bits of `b`/`bl`.
pub const BRANCH_OPCODE_MASK: u32 = 0xFC00_0000;

const IMM26_MASK: u32 = 0x03FF_FFFF;

/// `nop`
pub const NOP: u32 = 0xD503_201F;

/// Encode `bl` (or `b` when `link` is false) with a byte displacement.
///
/// Returns `None` when the displacement is unaligned or out of reach.
#[inline]
pub fn encode_branch(displacement: i64, link: bool) -> Option<u32> {
    let reach = BL_REACH as i64;
    if displacement % INSTRUCTION_SIZE as i64 != 0 || !(-reach..reach).contains(&displacement) {
        return None;
    }
    let opcode = if link { BL_OPCODE } else { B_OPCODE };
    Some(opcode | (((displacement >> 2) as u32) & IMM26_MASK))
}

/// Decode the byte displacement of a `b`/`bl` word.
#[inline]
pub fn decode_branch(word: u32) -> i64 {
    // Sign-extend imm26 and scale to bytes.
    (((word & IMM26_MASK) << 6) as i32 >> 6) as i64 * INSTRUCTION_SIZE as i64
}

// =============================================================================
// Assembler
// =============================================================================

/// General-purpose register number (x0-x30, 31 = sp/xzr by context).
pub type Reg = u8;

/// Frame pointer.
pub const FP: Reg = 29;
/// Link register.
pub const LR: Reg = 30;
/// Stack pointer (in addressing contexts).
pub const SP: Reg = 31;
/// Intra-procedure scratch register used for indirect calls.
pub const IP0: Reg = 16;
/// Second intra-procedure scratch register.
pub const IP1: Reg = 17;
/// Zero register (in data-processing and store contexts).
pub const XZR: Reg = 31;

/// Integer and reference argument registers of the optimized convention.
pub const INT_ARGUMENT_REGISTERS: [Reg; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
/// Floating-point argument registers (d0-d7) of the optimized convention.
pub const FLOAT_ARGUMENT_REGISTERS: [Reg; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Code buffer for emitting AArch64 instructions.
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

    /// Emit one instruction word.
    pub fn emit(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    /// Get the assembled code.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    /// Pad with `nop` until the position is `position`.
    pub fn pad_to(&mut self, position: usize) {
        while self.position() < position {
            self.emit(NOP);
        }
    }

    /// `bl` with an unlinked displacement; returns the call position.
    pub fn bl(&mut self) -> usize {
        let position = self.position();
        self.emit(BL_OPCODE);
        position
    }

    /// `b` with a byte displacement.
    pub fn b(&mut self, displacement: i32) {
        self.emit(B_OPCODE | (((displacement >> 2) as u32) & IMM26_MASK));
    }

    /// `blr reg`; returns the position just after the call.
    pub fn blr(&mut self, reg: Reg) -> usize {
        self.emit(0xD63F_0000 | ((reg as u32) << 5));
        self.position()
    }

    /// `br reg`.
    pub fn br(&mut self, reg: Reg) {
        self.emit(0xD61F_0000 | ((reg as u32) << 5));
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    /// `stp x29, x30, [sp, #-16]!`
    pub fn push_frame(&mut self) {
        self.emit(0xA9BF_7BFD);
    }

    /// `ldp x29, x30, [sp], #16`
    pub fn pop_frame(&mut self) {
        self.emit(0xA8C1_7BFD);
    }

    /// `mov x29, sp`
    pub fn set_frame_pointer(&mut self) {
        self.emit(0x9100_03FD);
    }

    /// `mov sp, x29`
    pub fn restore_stack_pointer(&mut self) {
        self.emit(0x9100_03BF);
    }

    /// `ldr xt, [xn, #offset]` with an 8-byte scaled unsigned offset.
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xF940_0000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// `ldr dt, [xn, #offset]` with an 8-byte scaled unsigned offset.
    pub fn ldr_d(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xFD40_0000 | ((offset / 8) << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// `str xt, [sp, #-16]!`
    pub fn push(&mut self, rt: Reg) {
        self.emit(0xF81F_0FE0 | rt as u32);
    }

    /// `str dt, [sp, #-16]!`
    pub fn push_d(&mut self, rt: Reg) {
        self.emit(0xFC1F_0FE0 | rt as u32);
    }

    /// `ldr xt, [sp], #16`
    pub fn pop(&mut self, rt: Reg) {
        self.emit(0xF841_07E0 | rt as u32);
    }

    /// `ldr dt, [sp], #16`
    pub fn pop_d(&mut self, rt: Reg) {
        self.emit(0xFC41_07E0 | rt as u32);
    }

    /// `add xd, xn, #imm`
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm: u32) {
        debug_assert!(imm < 4096);
        self.emit(0x9100_0000 | (imm << 10) | ((rn as u32) << 5) | rd as u32);
    }

    /// `mov xd, xn`
    pub fn mov(&mut self, rd: Reg, rn: Reg) {
        self.emit(0xAA00_03E0 | ((rn as u32) << 16) | rd as u32);
    }

    /// Load a 64-bit immediate with `movz`/`movk`.
    pub fn mov_imm64(&mut self, rd: Reg, imm: u64) {
        self.emit(0xD280_0000 | (((imm & 0xFFFF) as u32) << 5) | rd as u32);
        for shift in 1..4u32 {
            let chunk = ((imm >> (16 * shift)) & 0xFFFF) as u32;
            self.emit(0xF280_0000 | (shift << 21) | (chunk << 5) | rd as u32);
        }
    }
}
