//! x86-64 adapters.
//!
//! Baseline-to-optimized callee prologue (8 bytes):
//!
//! ```text
//! 0: call <adapter>        ; baseline entry
//! 5: nop3
//! 8:                       ; optimized entry, body
//! ```
//!
//! Optimized-to-baseline callee prologue (13 bytes):
//!
//! ```text
//!  0: jmp 13               ; baseline entry
//!  2: nop6
//!  8: call <adapter>       ; optimized entry
//! 13:                      ; body
//! ```

use super::{
    AdapterDirection, AdapterGenerator, AdapterSig, ArgLocation, Prologue, baseline_offsets,
    optimized_locations,
};
use crate::arch::amd64::{
    Assembler, CALL_REL32_SIZE, FLOAT_ARGUMENT_REGISTERS, Gpr, INT_ARGUMENT_REGISTERS, SCRATCH,
};
use crate::arch::{Isa, WORD_SIZE};
use crate::method::{ENTRY_PROLOGUE_SIZE, GeneratedCode};

/// Saved `rbp` plus the return address below the caller's arguments.
const FRAME_SIZE: u32 = 2 * WORD_SIZE as u32;

/// Offset from `rbp` of the first word above the return address.
const ARGUMENTS_OFFSET: i32 = 2 * WORD_SIZE as i32;

/// Position after the optimized-to-baseline prologue.
const O2B_BODY: usize = ENTRY_PROLOGUE_SIZE + CALL_REL32_SIZE;

/// x86-64 adapter generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64AdapterGenerator;

impl AdapterGenerator for Amd64AdapterGenerator {
    fn isa(&self) -> Isa {
        Isa::Amd64
    }

    fn emit_prologue(&self, sig: &AdapterSig, direction: AdapterDirection) -> Prologue {
        let mut asm = Assembler::new();
        if sig.is_empty() {
            asm.nop(ENTRY_PROLOGUE_SIZE);
            return Prologue {
                code: asm.finish(),
                adapter_call: None,
            };
        }
        let call = match direction {
            AdapterDirection::BaselineToOptimized => {
                let call = asm.call_rel32(0);
                asm.pad_to(ENTRY_PROLOGUE_SIZE);
                call
            }
            AdapterDirection::OptimizedToBaseline => {
                asm.jmp_short((O2B_BODY - 2) as i8);
                asm.pad_to(ENTRY_PROLOGUE_SIZE);
                asm.call_rel32(0)
            }
        };
        Prologue {
            code: asm.finish(),
            adapter_call: Some(call as u32),
        }
    }

    fn generate(&self, sig: &AdapterSig, direction: AdapterDirection) -> GeneratedCode {
        let mut asm = Assembler::new();
        let call = match direction {
            AdapterDirection::BaselineToOptimized => baseline_to_optimized(&mut asm, sig),
            AdapterDirection::OptimizedToBaseline => optimized_to_baseline(&mut asm, sig),
        };
        GeneratedCode::new(asm.finish())
            .with_indirect_call(call as u32, false)
            .with_frame_size(FRAME_SIZE)
    }
}

/// Returns the position of the call into the callee's body.
///
/// On entry `[rsp]` is the return address of the prologue call and
/// `[rsp + 8]` the baseline caller's return address, with the baseline
/// arguments above it.
fn baseline_to_optimized(asm: &mut Assembler, sig: &AdapterSig) -> usize {
    let kinds = sig.kinds();
    let locations = optimized_locations(
        kinds,
        INT_ARGUMENT_REGISTERS.len(),
        FLOAT_ARGUMENT_REGISTERS.len(),
    );
    let (offsets, arguments_size) = baseline_offsets(kinds, WORD_SIZE);

    // Return into the optimized entry rather than the prologue padding.
    asm.pop(SCRATCH);
    asm.add_imm8(SCRATCH, (ENTRY_PROLOGUE_SIZE - CALL_REL32_SIZE) as i8);
    asm.push(Gpr::Rbp);
    asm.mov_rr(Gpr::Rbp, Gpr::Rsp);

    let mut stack_arguments = Vec::new();
    for (i, location) in locations.iter().enumerate() {
        let source = ARGUMENTS_OFFSET + offsets[i] as i32;
        match *location {
            ArgLocation::Int(r) => asm.mov_load(INT_ARGUMENT_REGISTERS[r], Gpr::Rbp, source),
            ArgLocation::Float(r) => asm.movsd_load(FLOAT_ARGUMENT_REGISTERS[r], Gpr::Rbp, source),
            ArgLocation::Stack(_) => stack_arguments.push(source),
        }
    }
    // keep rsp 16-byte aligned at the call
    if stack_arguments.len() % 2 == 1 {
        asm.sub_imm8(Gpr::Rsp, WORD_SIZE as i8);
    }
    for &source in stack_arguments.iter().rev() {
        asm.push_mem(Gpr::Rbp, source);
    }

    let call = asm.position();
    asm.call_reg(SCRATCH);
    asm.mov_rr(Gpr::Rsp, Gpr::Rbp);
    asm.pop(Gpr::Rbp);
    asm.ret_pop(arguments_size as u16);
    call
}

/// Returns the position of the call into the callee's body.
///
/// On entry `[rsp]` is the return address of the prologue call and
/// `[rsp + 8]` the optimized caller's return address, with the optimized
/// stack arguments above it.
fn optimized_to_baseline(asm: &mut Assembler, sig: &AdapterSig) -> usize {
    let kinds = sig.kinds();
    let locations = optimized_locations(
        kinds,
        INT_ARGUMENT_REGISTERS.len(),
        FLOAT_ARGUMENT_REGISTERS.len(),
    );

    asm.pop(SCRATCH);
    asm.push(Gpr::Rbp);
    asm.mov_rr(Gpr::Rbp, Gpr::Rsp);

    for (kind, location) in kinds.iter().zip(&locations) {
        match *location {
            ArgLocation::Int(r) => asm.push(INT_ARGUMENT_REGISTERS[r]),
            ArgLocation::Float(r) => {
                asm.sub_imm8(Gpr::Rsp, WORD_SIZE as i8);
                asm.movsd_store(Gpr::Rsp, 0, FLOAT_ARGUMENT_REGISTERS[r]);
            }
            ArgLocation::Stack(slot) => {
                asm.push_mem(Gpr::Rbp, ARGUMENTS_OFFSET + (slot * WORD_SIZE) as i32)
            }
        }
        if kind.is_wide() {
            asm.sub_imm8(Gpr::Rsp, WORD_SIZE as i8);
        }
    }

    // The baseline callee pops its own arguments.
    let call = asm.position();
    asm.call_reg(SCRATCH);
    asm.mov_rr(Gpr::Rsp, Gpr::Rbp);
    asm.pop(Gpr::Rbp);
    asm.ret();
    call
}
