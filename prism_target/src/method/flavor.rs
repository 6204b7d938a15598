//! Method flavors and calling-convention entry points.

use std::fmt;

/// What a compiled method represents.
///
/// Only [`MethodFlavor::Compiled`] is the translation of a VM method; every
/// other flavor is glue owned by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodFlavor {
    /// Ordinary compiled method.
    Compiled,
    /// Bytecode template used by the baseline compiler.
    Template,
    /// Virtual dispatch trampoline.
    VirtualTrampoline,
    /// Interface dispatch trampoline.
    InterfaceTrampoline,
    /// Deferred-binding stub for direct calls.
    StaticTrampoline,
    /// Any other VM stub.
    Stub,
    /// Calling-convention adapter.
    Adapter,
    /// Trap (signal) handler stub.
    TrapHandler,
}

impl MethodFlavor {
    /// Whether this is compiled code of a VM method rather than glue.
    #[inline]
    pub const fn is_real_code(self) -> bool {
        matches!(self, MethodFlavor::Compiled)
    }

    /// Whether this is one of the dispatch trampolines.
    #[inline]
    pub const fn is_trampoline(self) -> bool {
        matches!(
            self,
            MethodFlavor::VirtualTrampoline
                | MethodFlavor::InterfaceTrampoline
                | MethodFlavor::StaticTrampoline
        )
    }

    /// Short name used in traces.
    pub const fn name(self) -> &'static str {
        match self {
            MethodFlavor::Compiled => "compiled",
            MethodFlavor::Template => "template",
            MethodFlavor::VirtualTrampoline => "vtrampoline",
            MethodFlavor::InterfaceTrampoline => "itrampoline",
            MethodFlavor::StaticTrampoline => "strampoline",
            MethodFlavor::Stub => "stub",
            MethodFlavor::Adapter => "adapter",
            MethodFlavor::TrapHandler => "trap",
        }
    }
}

impl fmt::Display for MethodFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size of the entry prologue shared by every compiled method.
///
/// The baseline entry is at offset 0 and the optimized entry directly after
/// the prologue.
pub const ENTRY_PROLOGUE_SIZE: usize = 8;

/// Calling convention a caller uses, selecting the callee entry it jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallEntryPoint {
    /// All arguments on the stack; used by baseline-compiled code.
    Baseline,
    /// Arguments in registers; used by optimized code.
    #[default]
    Optimized,
}

impl CallEntryPoint {
    /// Offset of this entry from the start of a callee's code.
    #[inline]
    pub const fn offset(self) -> usize {
        match self {
            CallEntryPoint::Baseline => 0,
            CallEntryPoint::Optimized => ENTRY_PROLOGUE_SIZE,
        }
    }
}

impl fmt::Display for CallEntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallEntryPoint::Baseline => "baseline",
            CallEntryPoint::Optimized => "optimized",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_code() {
        assert!(MethodFlavor::Compiled.is_real_code());
        assert!(!MethodFlavor::Adapter.is_real_code());
        assert!(!MethodFlavor::Template.is_real_code());
        assert!(MethodFlavor::StaticTrampoline.is_trampoline());
        assert!(!MethodFlavor::Stub.is_trampoline());
    }

    #[test]
    fn test_entry_offsets() {
        assert_eq!(CallEntryPoint::Baseline.offset(), 0);
        assert_eq!(CallEntryPoint::Optimized.offset(), ENTRY_PROLOGUE_SIZE);
    }
}
