//! Prism Target
//!
//! Compiled-method metadata for the Prism VM: the representation of a unit of
//! machine code together with everything the runtime needs to walk, patch and
//! link it.
//!
//! # Architecture
//!
//! Leaf to root:
//!
//! - **Stop positions** ([`stops`]): packed 32-bit entries recording the code
//!   positions of direct calls, indirect calls and safepoints.
//! - **Reference maps** ([`refmap`]): byte addressing into the frame/register
//!   bitmap blob consumed by the garbage collector.
//! - **Catch ranges** ([`catch`]): range to handler lookup for exception
//!   delivery.
//! - **Bundles** ([`bundle`], [`region`]): one contiguous allocation per method
//!   holding the code and all of its metadata arrays.
//! - **Compiled methods** ([`method`]): the entity tying all of the above
//!   together, with call-site patching ([`patch`]).
//! - **Adapters** ([`adapter`]) and **stubs** ([`stubs`]): generated glue
//!   between calling conventions and for deferred binding.
//! - **Linking** ([`link`]) and **compilation tracking** ([`compilation`]).
//!
//! # Usage
//!
//! ```ignore
//! use prism_target::{TargetConfig, TargetRuntime};
//!
//! let runtime = TargetRuntime::new(TargetConfig::default(), routines)?;
//! let method = runtime.compile(method_id, &compiler)?;
//! method.link_direct_calls(None, &runtime);
//! method.publish();
//! ```
//!
//! # Safety
//!
//! Code bytes live in raw mapped memory owned by a [`region::CodeRegion`].
//! Every compiled method keeps its region alive, and all writes to published
//! code go through the atomic call-site patch path.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod arch;
pub mod bundle;
pub mod catch;
pub mod compilation;
pub mod config;
pub mod error;
pub mod link;
pub mod method;
pub mod patch;
pub mod refmap;
pub mod region;
pub mod runtime;
pub mod stops;
pub mod stubs;

// Re-exports for convenient access
pub use adapter::{AdapterCache, AdapterDirection, AdapterGenerator, AdapterSig, ParamKind};
pub use arch::Isa;
pub use bundle::{ArrayField, BundleLayout};
pub use catch::CatchRangeTable;
pub use compilation::{Compilation, CompilationBroker, CompileRequest, Compiler, TargetState};
pub use config::TargetConfig;
pub use error::{CompileError, TargetError};
pub use link::CalleeResolver;
pub use method::{
    CallEntryPoint, CompiledMethod, DirectCallee, GeneratedCode, MethodFlavor, MethodId,
    ObjectRef, StopReferenceMaps,
};
pub use patch::PatchableCallSite;
pub use region::CodeRegion;
pub use runtime::TargetRuntime;
pub use stops::{StopKind, StopTable};
pub use stubs::{StubRoutines, Stubs};
