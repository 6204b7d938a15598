//! AArch64 adapters.
//!
//! Baseline stack slots are 16 bytes so that every push keeps `sp` aligned.
//! The prologue saves the caller's link register before calling the adapter,
//! and the adapter restores it before building its own frame.
//!
//! Baseline-to-optimized callee prologue:
//!
//! ```text
//! 0: str x30, [sp, #-16]!  ; baseline entry
//! 4: bl <adapter>
//! 8:                       ; optimized entry, body
//! ```
//!
//! Optimized-to-baseline callee prologue:
//!
//! ```text
//!  0: b 16                 ; baseline entry
//!  4: nop
//!  8: str x30, [sp, #-16]! ; optimized entry
//! 12: bl <adapter>
//! 16:                      ; body
//! ```

use super::{
    AdapterDirection, AdapterGenerator, AdapterSig, ArgLocation, Prologue, baseline_offsets,
    optimized_locations,
};
use crate::arch::{Isa, WORD_SIZE};
use crate::arch::aarch64::{
    Assembler, FLOAT_ARGUMENT_REGISTERS, FP, INSTRUCTION_SIZE, INT_ARGUMENT_REGISTERS, IP0, IP1,
    LR, SP, XZR,
};
use crate::method::{ENTRY_PROLOGUE_SIZE, GeneratedCode};

/// Size of one baseline stack slot.
const SLOT_SIZE: usize = 16;

/// Saved frame pointer and link register.
const FRAME_SIZE: u32 = 16;

/// Offset from `x29` of the first word above the frame record.
const ARGUMENTS_OFFSET: u32 = 16;

/// Position after the optimized-to-baseline prologue.
const O2B_BODY: usize = ENTRY_PROLOGUE_SIZE + 2 * INSTRUCTION_SIZE;

/// AArch64 adapter generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64AdapterGenerator;

impl AdapterGenerator for Aarch64AdapterGenerator {
    fn isa(&self) -> Isa {
        Isa::Aarch64
    }

    fn emit_prologue(&self, sig: &AdapterSig, direction: AdapterDirection) -> Prologue {
        let mut asm = Assembler::new();
        if sig.is_empty() {
            asm.pad_to(ENTRY_PROLOGUE_SIZE);
            return Prologue {
                code: asm.finish(),
                adapter_call: None,
            };
        }
        if direction == AdapterDirection::OptimizedToBaseline {
            asm.b(O2B_BODY as i32);
            asm.pad_to(ENTRY_PROLOGUE_SIZE);
        }
        asm.push(LR);
        let call = asm.bl();
        Prologue {
            code: asm.finish(),
            adapter_call: Some(call as u32),
        }
    }

    fn generate(&self, sig: &AdapterSig, direction: AdapterDirection) -> GeneratedCode {
        let mut asm = Assembler::new();
        // x30 holds the callee's body; the caller's x30 was pushed by the
        // prologue.
        asm.mov(IP0, LR);
        asm.pop(LR);
        asm.push_frame();
        asm.set_frame_pointer();

        let call = match direction {
            AdapterDirection::BaselineToOptimized => baseline_to_optimized(&mut asm, sig),
            AdapterDirection::OptimizedToBaseline => optimized_to_baseline(&mut asm, sig),
        };
        GeneratedCode::new(asm.finish())
            .with_indirect_call(call as u32, false)
            .with_frame_size(FRAME_SIZE)
    }
}

fn baseline_to_optimized(asm: &mut Assembler, sig: &AdapterSig) -> usize {
    let kinds = sig.kinds();
    let locations = optimized_locations(
        kinds,
        INT_ARGUMENT_REGISTERS.len(),
        FLOAT_ARGUMENT_REGISTERS.len(),
    );
    let (offsets, arguments_size) = baseline_offsets(kinds, SLOT_SIZE);

    let mut stack_arguments = Vec::new();
    for (i, location) in locations.iter().enumerate() {
        let source = ARGUMENTS_OFFSET + offsets[i] as u32;
        match *location {
            ArgLocation::Int(r) => asm.ldr(INT_ARGUMENT_REGISTERS[r], FP, source),
            ArgLocation::Float(r) => asm.ldr_d(FLOAT_ARGUMENT_REGISTERS[r], FP, source),
            ArgLocation::Stack(_) => stack_arguments.push(source),
        }
    }
    for &source in stack_arguments.iter().rev() {
        asm.ldr(IP1, FP, source);
        asm.push(IP1);
    }

    let call = asm.position();
    asm.blr(IP0);
    asm.restore_stack_pointer();
    asm.pop_frame();
    asm.add_imm(SP, SP, arguments_size as u32);
    asm.ret();
    call
}

fn optimized_to_baseline(asm: &mut Assembler, sig: &AdapterSig) -> usize {
    let kinds = sig.kinds();
    let locations = optimized_locations(
        kinds,
        INT_ARGUMENT_REGISTERS.len(),
        FLOAT_ARGUMENT_REGISTERS.len(),
    );

    for (kind, location) in kinds.iter().zip(&locations) {
        match *location {
            ArgLocation::Int(r) => asm.push(INT_ARGUMENT_REGISTERS[r]),
            ArgLocation::Float(r) => asm.push_d(FLOAT_ARGUMENT_REGISTERS[r]),
            ArgLocation::Stack(slot) => {
                asm.ldr(IP1, FP, ARGUMENTS_OFFSET + (slot * WORD_SIZE) as u32);
                asm.push(IP1);
            }
        }
        if kind.is_wide() {
            asm.push(XZR);
        }
    }

    let call = asm.position();
    asm.blr(IP0);
    asm.restore_stack_pointer();
    asm.pop_frame();
    asm.ret();
    call
}
