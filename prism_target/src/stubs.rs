//! VM stubs.
//!
//! Glue methods generated once per VM:
//!
//! - **Static trampoline**: target of direct calls whose callee is not
//!   compiled yet. It asks the runtime to compile and link the callee, then
//!   jumps to the returned entry point.
//! - **Virtual and interface trampolines**: the same for dispatch-table
//!   entries.
//! - **Trap stub**: entered from the signal handler with the faulting state
//!   on the stack.
//!
//! Every stub has both entry points. Trampolines save all argument registers
//! around the runtime call, so optimized and baseline callers can share the
//! body.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::arch::amd64::{self, FLOAT_ARGUMENT_REGISTERS, Gpr, INT_ARGUMENT_REGISTERS, SCRATCH};
use crate::arch::{Isa, WORD_SIZE, aarch64};
use crate::error::TargetError;
use crate::method::{CompiledMethod, ENTRY_PROLOGUE_SIZE, GeneratedCode, MethodFlavor};
use crate::region::CodeRegion;

// =============================================================================
// Routines
// =============================================================================

/// Addresses of the runtime routines the stubs call.
///
/// Trampoline routines receive the caller's return address and a pointer to
/// the saved argument registers, and return the entry point to continue at.
/// The trap routine receives a pointer to the saved register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubRoutines {
    /// Resolves and links the callee of a static call.
    pub static_resolve: usize,
    /// Resolves a virtual dispatch.
    pub virtual_resolve: usize,
    /// Resolves an interface dispatch.
    pub interface_resolve: usize,
    /// Handles a hardware trap.
    pub trap: usize,
}

// =============================================================================
// Stubs
// =============================================================================

/// The VM's shared stubs.
pub struct Stubs {
    static_trampoline: Arc<CompiledMethod>,
    virtual_trampoline: Arc<CompiledMethod>,
    interface_trampoline: Arc<CompiledMethod>,
    trap_stub: Arc<CompiledMethod>,
}

impl Stubs {
    /// Generate all stubs into `region`.
    pub fn generate(
        region: &Arc<CodeRegion>,
        routines: &StubRoutines,
    ) -> Result<Self, TargetError> {
        let isa = region.isa();
        let install = |name: &str, flavor: MethodFlavor, generated: GeneratedCode| {
            let stub = CompiledMethod::new(name, flavor);
            stub.set_generated(region, generated)?;
            stub.publish();
            debug!(
                stub = %stub,
                code_start = format_args!("{:#x}", stub.code_start()),
                "generated stub"
            );
            Ok::<_, TargetError>(Arc::new(stub))
        };

        Ok(Self {
            static_trampoline: install(
                "static-trampoline",
                MethodFlavor::StaticTrampoline,
                trampoline(isa, routines.static_resolve),
            )?,
            virtual_trampoline: install(
                "virtual-trampoline",
                MethodFlavor::VirtualTrampoline,
                trampoline(isa, routines.virtual_resolve),
            )?,
            interface_trampoline: install(
                "interface-trampoline",
                MethodFlavor::InterfaceTrampoline,
                trampoline(isa, routines.interface_resolve),
            )?,
            trap_stub: install(
                "trap-stub",
                MethodFlavor::TrapHandler,
                trap_stub(isa, routines.trap),
            )?,
        })
    }

    /// Static trampoline.
    #[inline]
    pub fn static_trampoline(&self) -> &Arc<CompiledMethod> {
        &self.static_trampoline
    }

    /// Virtual dispatch trampoline.
    #[inline]
    pub fn virtual_trampoline(&self) -> &Arc<CompiledMethod> {
        &self.virtual_trampoline
    }

    /// Interface dispatch trampoline.
    #[inline]
    pub fn interface_trampoline(&self) -> &Arc<CompiledMethod> {
        &self.interface_trampoline
    }

    /// Trap stub.
    #[inline]
    pub fn trap_stub(&self) -> &Arc<CompiledMethod> {
        &self.trap_stub
    }

    /// The stub whose code contains `address`.
    pub fn stub_at(&self, address: usize) -> Option<&Arc<CompiledMethod>> {
        [
            &self.static_trampoline,
            &self.virtual_trampoline,
            &self.interface_trampoline,
            &self.trap_stub,
        ]
        .into_iter()
        .find(|stub| stub.contains(address))
    }
}

impl fmt::Debug for Stubs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stubs")
            .field("static_trampoline", &self.static_trampoline.code_start())
            .field("virtual_trampoline", &self.virtual_trampoline.code_start())
            .field("interface_trampoline", &self.interface_trampoline.code_start())
            .field("trap_stub", &self.trap_stub.code_start())
            .finish()
    }
}

// =============================================================================
// Code
// =============================================================================

fn trampoline(isa: Isa, routine: usize) -> GeneratedCode {
    let (code, call) = match isa {
        Isa::Amd64 => amd64_trampoline(routine),
        Isa::Aarch64 => aarch64_trampoline(routine),
    };
    GeneratedCode::new(code).with_indirect_call(call as u32, true)
}

fn trap_stub(isa: Isa, routine: usize) -> GeneratedCode {
    let (code, call, frame_size) = match isa {
        Isa::Amd64 => amd64_trap_stub(routine),
        Isa::Aarch64 => aarch64_trap_stub(routine),
    };
    GeneratedCode::new(code)
        .with_indirect_call(call as u32, true)
        .with_frame_size(frame_size)
}

/// Bytes reserved for the saved floating-point argument registers.
const AMD64_FLOAT_SAVE_AREA: usize = FLOAT_ARGUMENT_REGISTERS.len() * WORD_SIZE;

fn amd64_trampoline(routine: usize) -> (Vec<u8>, usize) {
    let mut asm = amd64::Assembler::new();
    asm.nop(ENTRY_PROLOGUE_SIZE);
    asm.push(Gpr::Rbp);
    asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
    for &reg in &INT_ARGUMENT_REGISTERS {
        asm.push(reg);
    }
    asm.sub_imm8(Gpr::Rsp, AMD64_FLOAT_SAVE_AREA as i8);
    for (i, &reg) in FLOAT_ARGUMENT_REGISTERS.iter().enumerate() {
        asm.movsd_store(Gpr::Rsp, (i * WORD_SIZE) as i32, reg);
    }

    asm.mov_load(Gpr::Rdi, Gpr::Rbp, WORD_SIZE as i32);
    asm.mov_rr(Gpr::Rsi, Gpr::Rsp);
    asm.mov_imm64(SCRATCH, routine as u64);
    let call = asm.position();
    asm.call_reg(SCRATCH);
    asm.mov_rr(SCRATCH, Gpr::Rax);

    for (i, &reg) in FLOAT_ARGUMENT_REGISTERS.iter().enumerate() {
        asm.movsd_load(reg, Gpr::Rsp, (i * WORD_SIZE) as i32);
    }
    asm.add_imm8(Gpr::Rsp, AMD64_FLOAT_SAVE_AREA as i8);
    for &reg in INT_ARGUMENT_REGISTERS.iter().rev() {
        asm.pop(reg);
    }
    asm.pop(Gpr::Rbp);
    asm.jmp_reg(SCRATCH);
    (asm.finish(), call)
}

fn amd64_trap_stub(routine: usize) -> (Vec<u8>, usize, u32) {
    let mut asm = amd64::Assembler::new();
    asm.nop(ENTRY_PROLOGUE_SIZE);
    for &reg in &Gpr::SAVED_BY_TRAP {
        asm.push(reg);
    }
    asm.mov_rr(Gpr::Rdi, Gpr::Rsp);
    asm.mov_imm64(SCRATCH, routine as u64);
    let call = asm.position();
    asm.call_reg(SCRATCH);
    for &reg in Gpr::SAVED_BY_TRAP.iter().rev() {
        asm.pop(reg);
    }
    asm.ret();
    let frame_size = (Gpr::SAVED_BY_TRAP.len() * WORD_SIZE) as u32;
    (asm.finish(), call, frame_size)
}

fn aarch64_trampoline(routine: usize) -> (Vec<u8>, usize) {
    let mut asm = aarch64::Assembler::new();
    asm.pad_to(ENTRY_PROLOGUE_SIZE);
    asm.push_frame();
    asm.set_frame_pointer();
    for &reg in &aarch64::INT_ARGUMENT_REGISTERS {
        asm.push(reg);
    }
    for &reg in &aarch64::FLOAT_ARGUMENT_REGISTERS {
        asm.push_d(reg);
    }

    asm.mov(0, aarch64::LR);
    asm.add_imm(1, aarch64::SP, 0);
    asm.mov_imm64(aarch64::IP0, routine as u64);
    let call = asm.position();
    asm.blr(aarch64::IP0);
    asm.mov(aarch64::IP0, 0);

    for &reg in aarch64::FLOAT_ARGUMENT_REGISTERS.iter().rev() {
        asm.pop_d(reg);
    }
    for &reg in aarch64::INT_ARGUMENT_REGISTERS.iter().rev() {
        asm.pop(reg);
    }
    asm.pop_frame();
    asm.br(aarch64::IP0);
    (asm.finish(), call)
}

/// x0-x28; x29 and x30 are saved by the frame record.
const AARCH64_TRAP_SAVED: u8 = 29;

fn aarch64_trap_stub(routine: usize) -> (Vec<u8>, usize, u32) {
    let mut asm = aarch64::Assembler::new();
    asm.pad_to(ENTRY_PROLOGUE_SIZE);
    asm.push_frame();
    asm.set_frame_pointer();
    for reg in 0..AARCH64_TRAP_SAVED {
        asm.push(reg);
    }
    asm.add_imm(0, aarch64::SP, 0);
    asm.mov_imm64(aarch64::IP0, routine as u64);
    let call = asm.position();
    asm.blr(aarch64::IP0);
    for reg in (0..AARCH64_TRAP_SAVED).rev() {
        asm.pop(reg);
    }
    asm.pop_frame();
    asm.ret();
    let frame_size = 16 * (AARCH64_TRAP_SAVED as u32 + 1);
    (asm.finish(), call, frame_size)
}
