//! x86-64 encoding support.

pub mod assembler;
pub mod registers;

pub use assembler::Assembler;
pub use registers::{Gpr, Xmm};

/// Size of `call rel32`.
pub const CALL_REL32_SIZE: usize = 5;

/// Opcode of `call rel32`.
pub const CALL_REL32_OPCODE: u8 = 0xE8;

/// Opcode of `jmp rel32`.
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// Integer and reference argument registers of the optimized convention.
pub const INT_ARGUMENT_REGISTERS: [Gpr; 6] =
    [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Floating-point argument registers of the optimized convention.
pub const FLOAT_ARGUMENT_REGISTERS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// Scratch register free at every call boundary.
pub const SCRATCH: Gpr = Gpr::R11;
