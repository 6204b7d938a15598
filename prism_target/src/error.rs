//! Error types for compiled-method generation and compilation.
//!
//! Three tiers of failure exist in this crate:
//!
//! - [`TargetError`]: a method could not be generated or placed (malformed
//!   tables, exhausted code region, unreachable call target).
//! - [`CompileError`]: a compile request failed. Stored in the method's
//!   target state and handed to every waiter, so it is `Clone`.
//! - Fatal errors ([`fatal!`](crate::error::fatal)): misuse that indicates a
//!   broken VM invariant. These log at error level and halt by panicking.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::bundle::ArrayField;
use crate::config::ConfigError;
use crate::method::MethodId;

// =============================================================================
// Target Errors
// =============================================================================

/// Errors raised while installing generated code into a compiled method.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The method already holds generated code.
    #[error("compiled method `{0}` has already been generated")]
    AlreadyGenerated(String),

    /// Catch-range and catch-target tables differ in length.
    #[error("catch table length mismatch: {ranges} ranges, {targets} targets")]
    CatchTableLengthMismatch {
        /// Number of catch-range start positions.
        ranges: usize,
        /// Number of catch-target positions.
        targets: usize,
    },

    /// A catch-range start position is smaller than its predecessor.
    #[error("catch range {index} starts before catch range {}", index - 1)]
    UnsortedCatchRanges {
        /// Index of the first out-of-order entry.
        index: usize,
    },

    /// The stop table length does not match the zone counts.
    #[error(
        "stop table holds {stops} entries but zones describe {direct} direct + {indirect} indirect + {safepoints} safepoints"
    )]
    StopZoneMismatch {
        /// Entries in the stop table.
        stops: usize,
        /// Direct calls (one per direct callee).
        direct: usize,
        /// Indirect calls.
        indirect: usize,
        /// Safepoints.
        safepoints: usize,
    },

    /// A stop entry uses the reserved top bit or points outside the code.
    #[error("stop {index} at position {position:#x} is outside code of length {code_len:#x}")]
    StopOutOfRange {
        /// Stop index.
        index: usize,
        /// Decoded position.
        position: u32,
        /// Code length in bytes.
        code_len: usize,
    },

    /// The reference-map blob has the wrong size for the stop table.
    #[error("reference maps hold {actual} bytes, stop table requires {expected}")]
    ReferenceMapSizeMismatch {
        /// Size computed from the stop table shape.
        expected: usize,
        /// Size supplied by the code generator.
        actual: usize,
    },

    /// A code position does not fit into a stop entry.
    #[error("code position {0:#x} does not fit in 30 bits")]
    PositionOutOfRange(usize),

    /// A literal patch refers past the end of a literal pool or the code.
    #[error("literal patch at {position:#x} refers outside the {field} cell")]
    LiteralPatchOutOfRange {
        /// Position of the 32-bit displacement in the code.
        position: u32,
        /// Pool the patch refers to.
        field: ArrayField,
    },

    /// The code region cannot satisfy an allocation.
    #[error("code region exhausted: requested {requested} bytes, {available} available")]
    RegionExhausted {
        /// Bytes requested (after alignment).
        requested: usize,
        /// Bytes left in the region.
        available: usize,
    },

    /// A call target is out of reach of the call instruction at a site.
    #[error("call target {target:#x} is out of range of call site {site:#x}")]
    DisplacementOutOfRange {
        /// Address of the call instruction.
        site: usize,
        /// Requested target address.
        target: usize,
    },

    /// Mapping the code region failed.
    #[error("failed to map code region: {0}")]
    RegionMapFailed(#[source] io::Error),

    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// =============================================================================
// Compile Errors
// =============================================================================

/// Failure of a single compile request.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The compiler reported a failure.
    #[error("{compiler} failed to compile {method}: {reason}")]
    Failed {
        /// Method being compiled.
        method: MethodId,
        /// Name of the compiler.
        compiler: &'static str,
        /// Compiler-supplied description.
        reason: String,
    },

    /// Installing the generated code failed.
    #[error(transparent)]
    Target(Arc<TargetError>),

    /// The compiler panicked while compiling.
    #[error("{compiler} panicked while compiling {method}")]
    Panicked {
        /// Method being compiled.
        method: MethodId,
        /// Name of the compiler.
        compiler: &'static str,
    },

    /// A bounded wait for another thread's compilation expired.
    #[error("timed out after {waited:?} waiting for {method} to compile")]
    Timeout {
        /// Method being compiled by the other thread.
        method: MethodId,
        /// How long this thread waited.
        waited: Duration,
    },
}

impl From<TargetError> for CompileError {
    fn from(err: TargetError) -> Self {
        CompileError::Target(Arc::new(err))
    }
}

// =============================================================================
// Fatal Errors
// =============================================================================

/// Halt on a broken VM invariant.
///
/// Logs the message at error level and panics. Used for conditions that
/// indicate a bug in the VM or a code generator rather than a recoverable
/// runtime failure.
#[cold]
#[track_caller]
pub fn halt(message: String) -> ! {
    tracing::error!(target: "prism_target::fatal", "{message}");
    panic!("fatal: {message}");
}

/// Format a message and [`halt`].
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::halt(format!($($arg)*))
    };
}

pub(crate) use fatal;
