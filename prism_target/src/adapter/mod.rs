//! Calling-convention adapters.
//!
//! Baseline code passes every argument on the stack; optimized code passes
//! arguments in registers and only spills the overflow to the stack. When a
//! call crosses the two conventions an adapter shuffles the arguments.
//!
//! An adapter is entered from the *callee's* prologue: the callee starts
//! with a short call into the adapter, the adapter moves the arguments and
//! calls back into the callee's body, then returns straight to the original
//! caller. Adapters depend only on the shape of the parameter list, so one
//! adapter is shared by every callee with the same [`AdapterSig`] and
//! direction.
//!
//! # Example
//!
//! ```ignore
//! let cache = AdapterCache::new(region);
//! let sig = AdapterSig::new([ParamKind::Int, ParamKind::Double]);
//! let adapter = cache.make(&sig, AdapterDirection::BaselineToOptimized, false)?;
//! ```

mod aarch64;
mod amd64;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use tracing::debug;

use crate::arch::Isa;
use crate::error::TargetError;
use crate::method::{CompiledMethod, GeneratedCode, MethodFlavor};
use crate::region::CodeRegion;

pub use aarch64::Aarch64AdapterGenerator;
pub use amd64::Amd64AdapterGenerator;

// =============================================================================
// Signatures
// =============================================================================

/// Kind of a parameter as seen by the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// `boolean`
    Boolean,
    /// `byte`
    Byte,
    /// `short`
    Short,
    /// `char`
    Char,
    /// `int`
    Int,
    /// `long`
    Long,
    /// `float`
    Float,
    /// `double`
    Double,
    /// Object reference.
    Reference,
    /// Machine word.
    Word,
}

impl ParamKind {
    /// Kind after widening sub-word integers, which every convention passes
    /// as `int`.
    #[inline]
    pub const fn canonical(self) -> Self {
        match self {
            ParamKind::Boolean | ParamKind::Byte | ParamKind::Short | ParamKind::Char => {
                ParamKind::Int
            }
            other => other,
        }
    }

    /// Signature character.
    pub const fn code(self) -> char {
        match self {
            ParamKind::Boolean => 'Z',
            ParamKind::Byte => 'B',
            ParamKind::Short => 'S',
            ParamKind::Char => 'C',
            ParamKind::Int => 'I',
            ParamKind::Long => 'J',
            ParamKind::Float => 'F',
            ParamKind::Double => 'D',
            ParamKind::Reference => 'L',
            ParamKind::Word => 'W',
        }
    }

    /// Whether the value travels in a floating-point register.
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, ParamKind::Float | ParamKind::Double)
    }

    /// Whether the value takes two baseline stack slots.
    #[inline]
    pub const fn is_wide(self) -> bool {
        matches!(self, ParamKind::Long | ParamKind::Double)
    }
}

/// Canonical parameter shape of a callee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AdapterSig {
    kinds: SmallVec<[ParamKind; 8]>,
}

impl AdapterSig {
    /// Canonical shape of `params`, excluding any receiver.
    pub fn new(params: impl IntoIterator<Item = ParamKind>) -> Self {
        Self {
            kinds: params.into_iter().map(ParamKind::canonical).collect(),
        }
    }

    /// The same shape with a leading receiver.
    pub fn with_receiver(&self) -> Self {
        let mut kinds = SmallVec::with_capacity(self.kinds.len() + 1);
        kinds.push(ParamKind::Reference);
        kinds.extend_from_slice(&self.kinds);
        Self { kinds }
    }

    /// Parameter kinds in declaration order.
    #[inline]
    pub fn kinds(&self) -> &[ParamKind] {
        &self.kinds
    }

    /// Number of parameters.
    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether there are no parameters.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Short string key, one character per parameter.
    pub fn key(&self) -> String {
        self.kinds.iter().map(|k| k.code()).collect()
    }
}

impl fmt::Display for AdapterSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.key())
    }
}

/// Which conventions an adapter bridges, caller first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterDirection {
    /// Baseline caller, optimized callee.
    BaselineToOptimized,
    /// Optimized caller, baseline callee.
    OptimizedToBaseline,
}

impl fmt::Display for AdapterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterDirection::BaselineToOptimized => "baseline2opt",
            AdapterDirection::OptimizedToBaseline => "opt2baseline",
        })
    }
}

// =============================================================================
// Argument Locations
// =============================================================================

/// Where the optimized convention passes one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgLocation {
    /// Index into the integer argument registers.
    Int(usize),
    /// Index into the floating-point argument registers.
    Float(usize),
    /// Index of the outgoing stack slot.
    Stack(usize),
}

/// Optimized-convention locations of `kinds`.
pub(crate) fn optimized_locations(
    kinds: &[ParamKind],
    int_registers: usize,
    float_registers: usize,
) -> SmallVec<[ArgLocation; 8]> {
    let (mut ints, mut floats, mut slots) = (0, 0, 0);
    kinds
        .iter()
        .map(|kind| {
            if kind.is_float() && floats < float_registers {
                floats += 1;
                ArgLocation::Float(floats - 1)
            } else if !kind.is_float() && ints < int_registers {
                ints += 1;
                ArgLocation::Int(ints - 1)
            } else {
                slots += 1;
                ArgLocation::Stack(slots - 1)
            }
        })
        .collect()
}

/// Offset of each baseline argument from the top of the caller's stack,
/// plus the total size of the baseline arguments.
///
/// The last argument is on top. Wide values take two slots and live in the
/// higher one.
pub(crate) fn baseline_offsets(
    kinds: &[ParamKind],
    slot_size: usize,
) -> (SmallVec<[usize; 8]>, usize) {
    let mut offsets = SmallVec::from_elem(0, kinds.len());
    let mut offset = 0;
    for (i, kind) in kinds.iter().enumerate().rev() {
        if kind.is_wide() {
            offset += slot_size;
        }
        offsets[i] = offset;
        offset += slot_size;
    }
    (offsets, offset)
}

// =============================================================================
// Generator
// =============================================================================

/// Prologue emitted at the start of a callee that may need an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prologue {
    /// Prologue bytes; the callee's body follows directly.
    pub code: Vec<u8>,
    /// Position of the call into the adapter, linked later.
    pub adapter_call: Option<u32>,
}

/// ISA-specific adapter code generation.
pub trait AdapterGenerator: Send + Sync {
    /// Instruction set of the generated code.
    fn isa(&self) -> Isa;

    /// Emit the prologue of a callee with signature `sig` entered through
    /// `direction` adapters.
    ///
    /// Callees without parameters need no adapter; their prologue is
    /// padding only.
    fn emit_prologue(&self, sig: &AdapterSig, direction: AdapterDirection) -> Prologue;

    /// Generate the adapter body.
    fn generate(&self, sig: &AdapterSig, direction: AdapterDirection) -> GeneratedCode;
}

/// Adapter generator for `isa`.
pub fn generator_for(isa: Isa) -> &'static dyn AdapterGenerator {
    match isa {
        Isa::Amd64 => &Amd64AdapterGenerator,
        Isa::Aarch64 => &Aarch64AdapterGenerator,
    }
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AdapterKey {
    sig: String,
    direction: AdapterDirection,
}

/// Process-wide table of generated adapters.
///
/// Lookups are lock-free; generation happens under a single lock so at most
/// one adapter exists per signature and direction.
pub struct AdapterCache {
    region: Arc<CodeRegion>,
    generator: &'static dyn AdapterGenerator,
    adapters: DashMap<AdapterKey, Arc<CompiledMethod>, FxBuildHasher>,
    generation_lock: Mutex<()>,
}

impl AdapterCache {
    /// Create an empty cache generating into `region`.
    pub fn new(region: Arc<CodeRegion>) -> Self {
        let generator = generator_for(region.isa());
        Self {
            region,
            generator,
            adapters: DashMap::with_hasher(FxBuildHasher),
            generation_lock: Mutex::new(()),
        }
    }

    /// Generator used for adapters and callee prologues.
    #[inline]
    pub fn generator(&self) -> &'static dyn AdapterGenerator {
        self.generator
    }

    /// Adapter for a callee with parameters `sig`.
    ///
    /// Instance methods get an implicit leading receiver.
    pub fn make(
        &self,
        sig: &AdapterSig,
        direction: AdapterDirection,
        is_static: bool,
    ) -> Result<Arc<CompiledMethod>, TargetError> {
        let sig = if is_static {
            sig.clone()
        } else {
            sig.with_receiver()
        };
        let key = AdapterKey {
            sig: sig.key(),
            direction,
        };
        if let Some(adapter) = self.lookup(&key) {
            return Ok(adapter);
        }

        let _guard = self.generation_lock.lock();
        if let Some(adapter) = self.lookup(&key) {
            return Ok(adapter);
        }
        let adapter = self.generate(&sig, direction)?;
        self.adapters.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Number of cached adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter has been generated yet.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn lookup(&self, key: &AdapterKey) -> Option<Arc<CompiledMethod>> {
        self.adapters.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn generate(
        &self,
        sig: &AdapterSig,
        direction: AdapterDirection,
    ) -> Result<Arc<CompiledMethod>, TargetError> {
        let generated = self.generator.generate(sig, direction);
        let name = format!("{direction}-adapter{sig}");
        let adapter = CompiledMethod::new(name, MethodFlavor::Adapter);
        adapter.set_generated(&self.region, generated)?;
        adapter.publish();
        debug!(
            adapter = %adapter,
            code_start = format_args!("{:#x}", adapter.code_start()),
            code_len = adapter.code_len(),
            "generated adapter"
        );
        Ok(Arc::new(adapter))
    }
}

impl fmt::Debug for AdapterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterCache")
            .field("isa", &self.generator.isa())
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn cache() -> AdapterCache {
        AdapterCache::new(CodeRegion::new(&TargetConfig::for_testing()).unwrap())
    }

    #[test]
    fn test_sig_key_canonicalizes_sub_word_kinds() {
        let sig = AdapterSig::new([ParamKind::Boolean, ParamKind::Char, ParamKind::Double]);
        assert_eq!(sig.key(), "IID");
        assert_eq!(sig.with_receiver().key(), "LIID");
        assert_eq!(sig.to_string(), "(IID)");
    }

    #[test]
    fn test_optimized_locations_spill_overflow() {
        let kinds = [ParamKind::Int; 4]
            .into_iter()
            .chain([ParamKind::Double, ParamKind::Float])
            .collect::<Vec<_>>();
        let locations = optimized_locations(&kinds, 3, 1);
        assert_eq!(
            locations.as_slice(),
            &[
                ArgLocation::Int(0),
                ArgLocation::Int(1),
                ArgLocation::Int(2),
                ArgLocation::Stack(0),
                ArgLocation::Float(0),
                ArgLocation::Stack(1),
            ]
        );
    }

    #[test]
    fn test_baseline_offsets_wide_values() {
        let (offsets, size) =
            baseline_offsets(&[ParamKind::Int, ParamKind::Long, ParamKind::Reference], 8);
        assert_eq!(offsets.as_slice(), &[24, 16, 0]);
        assert_eq!(size, 32);
    }

    #[test]
    fn test_make_returns_cached_instance() {
        let cache = cache();
        let sig = AdapterSig::new([ParamKind::Int, ParamKind::Reference]);
        let a = cache.make(&sig, AdapterDirection::BaselineToOptimized, true).unwrap();
        let b = cache.make(&sig, AdapterDirection::BaselineToOptimized, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_make_distinguishes_signatures_and_directions() {
        let cache = cache();
        let ints = AdapterSig::new([ParamKind::Int]);
        let longs = AdapterSig::new([ParamKind::Long]);
        let a = cache.make(&ints, AdapterDirection::BaselineToOptimized, true).unwrap();
        let b = cache.make(&longs, AdapterDirection::BaselineToOptimized, true).unwrap();
        let c = cache.make(&ints, AdapterDirection::OptimizedToBaseline, true).unwrap();
        let d = cache.make(&ints, AdapterDirection::BaselineToOptimized, false).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(cache.len(), 4);
        assert_eq!(d.name(), "baseline2opt-adapter(LI)");
    }

    #[test]
    fn test_adapter_tables_are_degenerate() {
        let cache = cache();
        let sig = AdapterSig::new([ParamKind::Double, ParamKind::Reference]);
        let adapter = cache.make(&sig, AdapterDirection::OptimizedToBaseline, true).unwrap();
        assert_eq!(adapter.flavor(), MethodFlavor::Adapter);
        assert!(adapter.is_published());
        assert!(adapter.catch_table().is_empty());
        assert!(adapter.reference_maps().is_empty());
        assert_eq!(adapter.number_of_indirect_calls(), 1);
        assert_eq!(adapter.number_of_direct_calls(), 0);
    }

    #[test]
    fn test_concurrent_make_generates_once() {
        let cache = Arc::new(cache());
        let sig = AdapterSig::new([ParamKind::Float, ParamKind::Int]);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let sig = sig.clone();
                std::thread::spawn(move || {
                    cache
                        .make(&sig, AdapterDirection::BaselineToOptimized, false)
                        .unwrap()
                })
            })
            .collect();
        let adapters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(adapters.iter().all(|a| Arc::ptr_eq(a, &adapters[0])));
        assert_eq!(cache.len(), 1);
    }
}
