//! Compiled methods.
//!
//! A [`CompiledMethod`] is a unit of machine code plus the tables the runtime
//! needs to treat it as a first-class object:
//!
//! - literal pools for scalar constants and embedded object references
//! - a zoned stop table (direct calls, indirect calls, safepoints)
//! - one callee per direct call
//! - reference maps for the garbage collector
//! - a catch-range table for exception delivery
//!
//! All of it lives in one bundle allocated from a [`CodeRegion`]. A method is
//! created empty, populated once by [`CompiledMethod::set_generated`], and is
//! immutable afterwards except for call-site patching, which rewrites code
//! bytes in place.
//!
//! # Lifecycle
//!
//! ```text
//! new() --set_generated()--> generated --link_direct_calls()--> linked
//!                                          --publish()--> visible to other threads
//! ```
//!
//! Before [`CompiledMethod::publish`] any call site may be fixed up; after it,
//! only atomically patchable sites may be rewritten.

mod flavor;
mod generation;
mod trace;

use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, trace};

pub use flavor::{CallEntryPoint, ENTRY_PROLOGUE_SIZE, MethodFlavor};
pub use generation::{GeneratedCode, LiteralPatch};

use crate::arch::Isa;
use crate::bundle::{ArrayField, BundleLayout};
use crate::catch::CatchRangeTable;
use crate::error::fatal;
use crate::link::{self, CalleeResolver};
use crate::patch::{self, CallShape, PatchableCallSite};
use crate::refmap::{BitMap, ReferenceMapLayout};
use crate::region::{Bundle, CodeRegion};
use crate::stops::{StopKind, StopTable};

// =============================================================================
// Identities
// =============================================================================

/// Identity of a VM method, as assigned by the class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// Object reference embedded in code, as a raw heap word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    /// The null reference.
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Callee of a direct call.
#[derive(Debug, Clone)]
pub enum DirectCallee {
    /// A method that may not be compiled yet.
    Method(MethodId),
    /// A specific compiled method.
    Target(Arc<CompiledMethod>),
}

impl DirectCallee {
    /// Word stored in the bundle: the method id, or the callee's code start.
    #[inline]
    pub fn word(&self) -> u64 {
        match self {
            DirectCallee::Method(id) => id.0 as u64,
            DirectCallee::Target(target) => target.code_start() as u64,
        }
    }
}

impl fmt::Display for DirectCallee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectCallee::Method(id) => write!(f, "{id}"),
            DirectCallee::Target(target) => write!(f, "{target} @ {:#x}", target.code_start()),
        }
    }
}

// =============================================================================
// Compiled Method
// =============================================================================

/// Tables installed by `set_generated`.
struct Generated {
    bundle: Bundle,
    direct_callees: Box<[DirectCallee]>,
    indirect_calls: usize,
    reference_map_layout: ReferenceMapLayout,
    frame_size: u32,
    register_restore_epilogue_offset: Option<u32>,
    adapter_call: Option<u32>,
}

/// Reference maps at a suspended code position.
#[derive(Debug, Clone, Copy)]
pub struct StopReferenceMaps<'a> {
    /// Index of the stop in the stop table.
    pub stop_index: usize,
    /// Zone of the stop.
    pub kind: StopKind,
    /// Frame slots holding references.
    pub frame: BitMap<'a>,
    /// Registers holding references; safepoints only.
    pub registers: Option<BitMap<'a>>,
}

/// A unit of compiled code and its metadata.
pub struct CompiledMethod {
    name: String,
    method: Option<MethodId>,
    flavor: MethodFlavor,
    call_entry_point: CallEntryPoint,
    generated: OnceLock<Generated>,
    /// Set by the one `set_generated` call allowed to allocate a bundle.
    installing: AtomicBool,
    published: AtomicBool,
    fully_linked: AtomicBool,
    invalidated: OnceLock<String>,
}

impl CompiledMethod {
    /// Create an empty method.
    pub fn new(name: impl Into<String>, flavor: MethodFlavor) -> Self {
        Self {
            name: name.into(),
            method: None,
            flavor,
            call_entry_point: CallEntryPoint::default(),
            generated: OnceLock::new(),
            installing: AtomicBool::new(false),
            published: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            invalidated: OnceLock::new(),
        }
    }

    /// Builder: the VM method this code was compiled from.
    pub fn with_method(mut self, method: MethodId) -> Self {
        self.method = Some(method);
        self
    }

    /// Builder: the convention this method's own call sites use.
    pub fn with_call_entry_point(mut self, entry: CallEntryPoint) -> Self {
        self.call_entry_point = entry;
        self
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Name used in traces.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// VM method this code was compiled from.
    #[inline]
    pub fn method(&self) -> Option<MethodId> {
        self.method
    }

    /// Flavor.
    #[inline]
    pub fn flavor(&self) -> MethodFlavor {
        self.flavor
    }

    /// Convention used by this method's outgoing calls.
    #[inline]
    pub fn call_entry_point(&self) -> CallEntryPoint {
        self.call_entry_point
    }

    /// Instruction set of the installed code.
    #[inline]
    pub fn isa(&self) -> Option<Isa> {
        self.generated().map(|g| g.bundle.region().isa())
    }

    #[inline]
    fn generated(&self) -> Option<&Generated> {
        self.generated.get()
    }

    fn expect_generated(&self) -> &Generated {
        match self.generated() {
            Some(generated) => generated,
            None => fatal!("{self} has no generated code"),
        }
    }

    /// Whether generated code has been installed.
    #[inline]
    pub fn is_generated(&self) -> bool {
        self.generated.get().is_some()
    }

    // =========================================================================
    // Code and Literals
    // =========================================================================

    /// Address of the first code byte; zero before generation.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.generated().map_or(0, |g| g.bundle.code_start())
    }

    /// Code length in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.generated()
            .map_or(0, |g| g.bundle.layout().length(ArrayField::Code))
    }

    /// Address one past the last code byte.
    #[inline]
    pub fn code_end(&self) -> usize {
        self.code_start() + self.code_len()
    }

    /// Whether `address` is inside this method's code.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.is_generated() && address >= self.code_start() && address < self.code_end()
    }

    /// Address of an entry point.
    #[inline]
    pub fn entry_point(&self, entry: CallEntryPoint) -> usize {
        self.code_start() + entry.offset()
    }

    /// Machine code.
    ///
    /// Only for code that no thread is patching: before publication, or while
    /// linking is quiescent. Published call targets are read with
    /// [`CompiledMethod::call_target_at`].
    pub fn code(&self) -> &[u8] {
        self.generated()
            .map_or(&[][..], |g| g.bundle.cell::<u8>(ArrayField::Code))
    }

    /// Scalar literal pool.
    pub fn scalar_literals(&self) -> &[u8] {
        self.generated()
            .map_or(&[][..], |g| g.bundle.cell::<u8>(ArrayField::ScalarLiterals))
    }

    /// Reference literal pool.
    pub fn reference_literals(&self) -> &[ObjectRef] {
        let words = self
            .generated()
            .map_or(&[][..], |g| g.bundle.cell::<u64>(ArrayField::ReferenceLiterals));
        // SAFETY: ObjectRef is a transparent u64.
        unsafe { slice::from_raw_parts(words.as_ptr().cast::<ObjectRef>(), words.len()) }
    }

    /// Bundle layout; `None` before generation.
    pub fn bundle_layout(&self) -> Option<&BundleLayout> {
        self.generated().map(|g| g.bundle.layout())
    }

    /// Region holding the code; `None` before generation.
    pub fn region(&self) -> Option<&Arc<CodeRegion>> {
        self.generated().map(|g| g.bundle.region())
    }

    // =========================================================================
    // Stops
    // =========================================================================

    /// Stop table.
    pub fn stops(&self) -> StopTable<'_> {
        match self.generated() {
            Some(g) => StopTable::from_parts(
                g.bundle.cell::<u32>(ArrayField::StopPositions),
                g.direct_callees.len(),
                g.indirect_calls,
            ),
            None => StopTable::EMPTY,
        }
    }

    /// Number of direct calls.
    #[inline]
    pub fn number_of_direct_calls(&self) -> usize {
        self.stops().direct_calls()
    }

    /// Number of indirect calls.
    #[inline]
    pub fn number_of_indirect_calls(&self) -> usize {
        self.stops().indirect_calls()
    }

    /// Number of safepoints.
    #[inline]
    pub fn number_of_safepoints(&self) -> usize {
        self.stops().safepoints()
    }

    /// Number of stops.
    #[inline]
    pub fn number_of_stops(&self) -> usize {
        self.stops().len()
    }

    /// Callee of each direct call.
    pub fn direct_callees(&self) -> &[DirectCallee] {
        self.generated().map_or(&[][..], |g| &g.direct_callees[..])
    }

    /// Stop index for an instruction address in a suspended frame.
    ///
    /// See [`StopTable::find_stop_index`].
    pub fn find_stop_index(&self, ip: usize) -> Option<usize> {
        let position = ip.checked_sub(self.code_start())?;
        if !self.is_generated() || position > self.code_len() {
            return None;
        }
        self.stops().find_stop_index(position as u32)
    }

    /// Position of the first call strictly after position `from`.
    pub fn find_next_call(&self, from: u32, native_only: bool) -> Option<u32> {
        self.stops().find_next_call(from, native_only)
    }

    // =========================================================================
    // Reference Maps
    // =========================================================================

    /// Reference-map blob.
    pub fn reference_maps(&self) -> &[u8] {
        self.generated()
            .map_or(&[][..], |g| g.bundle.cell::<u8>(ArrayField::ReferenceMaps))
    }

    /// Reference-map addressing.
    pub fn reference_map_layout(&self) -> ReferenceMapLayout {
        self.generated()
            .map(|g| g.reference_map_layout)
            .unwrap_or_default()
    }

    /// Frame map of stop `stop_index`. Out-of-range indices are fatal.
    pub fn frame_reference_map(&self, stop_index: usize) -> BitMap<'_> {
        let g = self.expect_generated();
        g.reference_map_layout.frame_map(self.reference_maps(), stop_index)
    }

    /// Register map of safepoint `safepoint_index`. Out-of-range indices are
    /// fatal.
    pub fn register_reference_map(&self, safepoint_index: usize) -> BitMap<'_> {
        let g = self.expect_generated();
        g.reference_map_layout
            .register_map(self.reference_maps(), safepoint_index)
    }

    /// Reference maps at a suspended instruction address.
    pub fn reference_maps_at(&self, ip: usize) -> Option<StopReferenceMaps<'_>> {
        let stop_index = self.find_stop_index(ip)?;
        let stops = self.stops();
        let kind = stops.kind(stop_index);
        let registers = (kind == StopKind::Safepoint)
            .then(|| self.register_reference_map(stop_index - stops.calls()));
        Some(StopReferenceMaps {
            stop_index,
            kind,
            frame: self.frame_reference_map(stop_index),
            registers,
        })
    }

    // =========================================================================
    // Frames and Exceptions
    // =========================================================================

    /// Frame size in bytes.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.generated().map_or(0, |g| g.frame_size)
    }

    /// Start of the epilogue restoring callee-saved registers.
    #[inline]
    pub fn register_restore_epilogue_offset(&self) -> Option<u32> {
        self.generated()
            .and_then(|g| g.register_restore_epilogue_offset)
    }

    /// Whether this method saves callee-saved registers in its frame.
    #[inline]
    pub fn is_callee_saved(&self) -> bool {
        self.register_restore_epilogue_offset().is_some()
    }

    /// Catch-range table.
    pub fn catch_table(&self) -> CatchRangeTable<'_> {
        match self.generated() {
            Some(g) => CatchRangeTable::from_parts(
                g.bundle.cell::<u32>(ArrayField::CatchRangePositions),
                g.bundle.cell::<u32>(ArrayField::CatchBlockPositions),
            ),
            None => CatchRangeTable::EMPTY,
        }
    }

    /// Address of the handler for an exception at `throw_address`.
    ///
    /// For frames below the top, `throw_address` is a return address and is
    /// moved back into the call instruction first (see
    /// [`Isa::caller_pc_adjustment`]). Frames interrupted by a trap count as
    /// top frames. `None` means propagate to the caller.
    pub fn catch_target(&self, throw_address: usize, is_top_frame: bool) -> Option<usize> {
        let isa = self.isa()?;
        let mut position = throw_address.checked_sub(self.code_start())? as i64;
        if !is_top_frame {
            position += isa.caller_pc_adjustment() as i64;
        }
        if position < 0 || position as usize >= self.code_len() {
            return None;
        }
        self.catch_table()
            .resolve(position as u32)
            .map(|handler| self.code_start() + handler as usize)
    }

    // =========================================================================
    // Call Sites
    // =========================================================================

    /// Position of the prologue call into an adapter.
    #[inline]
    pub fn adapter_call_position(&self) -> Option<u32> {
        self.generated().and_then(|g| g.adapter_call)
    }

    /// Entry offset this method's call sites use to enter `callee`.
    ///
    /// Adapters have a single entry at offset zero.
    #[inline]
    pub fn call_entry_offset(&self, callee: &CompiledMethod) -> usize {
        match callee.flavor() {
            MethodFlavor::Adapter => 0,
            _ => self.call_entry_point.offset(),
        }
    }

    /// Current target of the call instruction at `position`.
    pub fn call_target_at(&self, position: u32) -> Option<usize> {
        let shape = self.call_shape_at(position)?;
        let address = self.code_start() + position as usize;
        // SAFETY: a whole call instruction lies inside the code, which stays
        // mapped while `self` is alive.
        let word = unsafe { patch::load(shape, address) };
        Some(shape.decode_target(address, word))
    }

    /// Patch capability for the call at `position`.
    ///
    /// `None` when the site is not a call, cannot be rewritten atomically, or
    /// belongs to an adapter.
    pub fn patchable_call_site(&self, position: u32) -> Option<PatchableCallSite> {
        if self.flavor == MethodFlavor::Adapter {
            return None;
        }
        let isa = self.isa()?;
        // SAFETY: the code stays mapped while `self` is alive.
        unsafe {
            PatchableCallSite::classify(isa, self.code_start(), self.code_len(), position as usize)
        }
    }

    /// Shape of the call instruction at `position`, read without forming a
    /// slice over code that may be patched concurrently.
    fn call_shape_at(&self, position: u32) -> Option<CallShape> {
        let isa = self.isa()?;
        let position = position as usize;
        // SAFETY: the code stays mapped while `self` is alive.
        unsafe { CallShape::decode_live(isa, self.code_start(), self.code_len(), position) }
    }

    /// Whether the call at `position` can be patched while executing.
    #[inline]
    pub fn is_patchable_call_site(&self, position: u32) -> bool {
        self.patchable_call_site(position).is_some()
    }

    /// Atomically retarget a call site that may be executing.
    pub fn patch_call_site(&self, site: PatchableCallSite, target: usize) {
        if self.flavor == MethodFlavor::Adapter {
            fatal!("call sites inside adapter {self} cannot be patched");
        }
        if !self.contains(site.address()) {
            fatal!("call site {:#x} is not inside {self}", site.address());
        }
        let word = site
            .shape()
            .encode_target(site.address(), target)
            .unwrap_or_else(|err| fatal!("patching {self}: {err}"));
        // SAFETY: the site lies inside this method's live, writable code and
        // was classified as atomically patchable.
        unsafe { patch::store_atomic(&site, word) };
        self.expect_generated()
            .bundle
            .region()
            .patch_stats()
            .record_patch();
        trace!(
            method = %self,
            site = format_args!("{:#x}", site.address()),
            target = format_args!("{target:#x}"),
            "patched call site"
        );
    }

    /// Retarget the call at `position` before the method is published.
    pub fn fixup_call_site(&self, position: u32, target: usize) {
        if self.is_published() {
            fatal!("{self} is published; call site {position:#x} must be patched");
        }
        let g = self.expect_generated();
        let Some(shape) = self.call_shape_at(position) else {
            fatal!("no call instruction at {position:#x} in {self}");
        };
        let address = self.code_start() + position as usize;
        let word = shape
            .encode_target(address, target)
            .unwrap_or_else(|err| fatal!("fixing up {self}: {err}"));
        // SAFETY: the call lies inside this method's code, which no other
        // thread executes before publication.
        unsafe { patch::store_unsynchronized(shape, address, word) };
        g.bundle.region().patch_stats().record_fixup();
    }

    /// Direct callee of the call instruction at `call_site`.
    pub fn call_site_to_callee(&self, call_site: usize) -> Option<&DirectCallee> {
        let position = call_site.checked_sub(self.code_start())?;
        let stops = self.stops();
        (0..stops.direct_calls())
            .find(|&i| stops.position(i) as usize == position)
            .map(|i| &self.direct_callees()[i])
    }

    /// Link every direct call; see [`crate::link`].
    ///
    /// Returns whether every callee was resolved.
    pub fn link_direct_calls(
        &self,
        adapter: Option<&CompiledMethod>,
        resolver: &dyn CalleeResolver,
    ) -> bool {
        link::link_direct_calls(self, adapter, resolver)
    }

    /// Whether the last link resolved every direct call.
    #[inline]
    pub fn is_fully_linked(&self) -> bool {
        self.fully_linked.load(Ordering::Acquire)
    }

    pub(crate) fn set_fully_linked(&self, linked: bool) {
        self.fully_linked.store(linked, Ordering::Release);
    }

    // =========================================================================
    // Publication and Invalidation
    // =========================================================================

    /// Make the method reachable by other threads.
    ///
    /// From here on call sites can only be patched atomically.
    pub fn publish(&self) {
        if !self.published.swap(true, Ordering::AcqRel) {
            debug!(method = %self, "published");
        }
    }

    /// Whether [`CompiledMethod::publish`] has been called.
    #[inline]
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Mark the method invalid. Returns `false` if it already was.
    pub fn invalidate(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let first = self.invalidated.set(reason).is_ok();
        if first {
            debug!(method = %self, reason = self.invalidation_reason(), "invalidated");
        }
        first
    }

    /// Why the method was invalidated, if it was.
    #[inline]
    pub fn invalidation_reason(&self) -> Option<&str> {
        self.invalidated.get().map(String::as_str)
    }

    /// Whether the method has been invalidated.
    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.get().is_some()
    }
}

impl fmt::Display for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("code_start", &format_args!("{:#x}", self.code_start()))
            .field("code_len", &self.code_len())
            .field("published", &self.is_published())
            .finish()
    }
}
