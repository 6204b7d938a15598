//! Instruction-set specifics.
//!
//! Everything in the crate that depends on machine-code encoding goes through
//! [`Isa`]: call-site shapes, the caller PC adjustment used during exception
//! dispatch and direct call reach.

use std::fmt;

pub mod aarch64;
pub mod amd64;

/// Word size of every supported target, in bytes.
pub const WORD_SIZE: usize = 8;

/// Supported instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    /// x86-64.
    Amd64,
    /// ARMv8-A, 64-bit state.
    Aarch64,
}

impl Isa {
    /// The instruction set of the running process.
    #[inline]
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Isa::Aarch64
        } else {
            Isa::Amd64
        }
    }

    /// Size of the direct call instruction emitted at call stops.
    #[inline]
    pub const fn call_size(self) -> usize {
        match self {
            Isa::Amd64 => amd64::CALL_REL32_SIZE,
            Isa::Aarch64 => aarch64::INSTRUCTION_SIZE,
        }
    }

    /// Offset added to a return address before looking it up in a caller's
    /// catch-range table.
    ///
    /// A return address points just past the call, which may already be the
    /// start of a different catch range. Stepping back lands inside the call
    /// instruction itself. AMD64 calls are variable length, so one byte is the
    /// only step guaranteed to stay inside the call; AArch64 calls are one
    /// fixed-width instruction.
    #[inline]
    pub const fn caller_pc_adjustment(self) -> i32 {
        match self {
            Isa::Amd64 => -1,
            Isa::Aarch64 => -(aarch64::INSTRUCTION_SIZE as i32),
        }
    }

    /// Largest byte distance a direct call can span.
    #[inline]
    pub const fn call_reach(self) -> u64 {
        match self {
            Isa::Amd64 => i32::MAX as u64,
            Isa::Aarch64 => aarch64::BL_REACH,
        }
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            Isa::Amd64 => "amd64",
            Isa::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_pc_adjustment_stays_inside_call() {
        for isa in [Isa::Amd64, Isa::Aarch64] {
            let adjust = isa.caller_pc_adjustment();
            assert!(adjust < 0);
            assert!((-adjust) as usize <= isa.call_size());
        }
    }

    #[test]
    fn test_call_reach() {
        assert_eq!(Isa::Aarch64.call_reach(), 128 * 1024 * 1024);
        assert!(Isa::Amd64.call_reach() > Isa::Aarch64.call_reach());
    }
}
