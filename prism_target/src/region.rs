//! Code region and bundle allocation.
//!
//! A [`CodeRegion`] maps one contiguous block of memory at startup and
//! bump-allocates bundles from it. Keeping every bundle of a VM inside one
//! region bounded by [`Isa::call_reach`] guarantees that any compiled method
//! can reach any other with a direct call.
//!
//! # Safety
//! The region hands out raw memory. A [`Bundle`] holds an `Arc` of its region,
//! so bundle memory stays mapped for as long as any method refers to it.

use std::fmt;
use std::io;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::arch::Isa;
use crate::bundle::{ArrayField, BundleLayout, CODE_ALIGNMENT};
use crate::config::TargetConfig;
use crate::error::TargetError;
use crate::patch::PatchStats;

// =============================================================================
// Platform-specific mapping
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
        VirtualAlloc, VirtualFree,
    };

    /// Map zeroed memory; null on failure.
    pub unsafe fn map(size: usize, executable: bool) -> *mut u8 {
        let protect = if executable {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_READWRITE
        };
        unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, protect) as *mut u8 }
    }

    /// Release a mapping.
    pub unsafe fn unmap(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Map zeroed memory; null on failure.
    pub unsafe fn map(size: usize, executable: bool) -> *mut u8 {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot |= libc::PROT_EXEC;
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Release a mapping.
    pub unsafe fn unmap(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }
}

/// Mapping granularity.
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Code Region
// =============================================================================

/// Contiguous memory area that bundles are allocated from.
///
/// Mapped read-write, plus execute when [`TargetConfig::executable_code`] is
/// set. Published code is patched in place, so the mapping is never flipped
/// to read-execute.
pub struct CodeRegion {
    /// Start of the mapping.
    base: NonNull<u8>,
    /// Mapping size (page-aligned).
    capacity: usize,
    /// Target instruction set of the code placed here.
    isa: Isa,
    /// Bump pointer, as an offset from `base`.
    cursor: Mutex<usize>,
    /// Call-site patch counters for every method in the region.
    patch_stats: PatchStats,
}

// SAFETY: the mapping is owned by the region and only handed out through
// `allocate`, which serializes on `cursor`. Concurrent access to allocated
// memory is governed by the bundles that own it.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

impl CodeRegion {
    /// Map a region as described by `config`.
    pub fn new(config: &TargetConfig) -> Result<Arc<Self>, TargetError> {
        config.validate()?;
        let capacity = align_up(config.code_region_size, PAGE_SIZE);
        // SAFETY: a fresh anonymous mapping of `capacity` bytes.
        let ptr = unsafe { platform::map(capacity, config.executable_code) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| TargetError::RegionMapFailed(io::Error::last_os_error()))?;
        debug!(
            base = format_args!("{:#x}", base.as_ptr() as usize),
            capacity,
            isa = %config.isa,
            "mapped code region"
        );
        Ok(Arc::new(Self {
            base,
            capacity,
            isa: config.isa,
            cursor: Mutex::new(0),
            patch_stats: PatchStats::default(),
        }))
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, TargetError> {
        let mut cursor = self.cursor.lock();
        let start = align_up(*cursor, align);
        let available = self.capacity.saturating_sub(*cursor);
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or(TargetError::RegionExhausted {
                requested: size + (start - *cursor),
                available,
            })?;
        *cursor = end;
        // SAFETY: start < end <= capacity, so the pointer is inside the mapping.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Allocate a zeroed bundle for `layout`.
    pub fn allocate_bundle(self: &Arc<Self>, layout: BundleLayout) -> Result<Bundle, TargetError> {
        let base = self.allocate(layout.size(), CODE_ALIGNMENT)?;
        trace!(
            base = format_args!("{:#x}", base.as_ptr() as usize),
            size = layout.size(),
            "allocated bundle"
        );
        Ok(Bundle {
            region: Arc::clone(self),
            base,
            layout,
        })
    }

    /// Instruction set of code in this region.
    #[inline]
    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Start address.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes allocated so far.
    pub fn used(&self) -> usize {
        *self.cursor.lock()
    }

    /// Whether `address` lies inside the region.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.base() + self.capacity
    }

    /// Patch counters.
    #[inline]
    pub fn patch_stats(&self) -> &PatchStats {
        &self.patch_stats
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the mapping created in `new`, and
        // every bundle holds an Arc of the region.
        unsafe { platform::unmap(self.base.as_ptr(), self.capacity) };
    }
}

impl fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("isa", &self.isa)
            .finish()
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Element types that may be stored in a bundle cell.
pub trait CellElement: Copy + sealed::Sealed {}

impl CellElement for u8 {}
impl CellElement for u32 {}
impl CellElement for u64 {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// An allocated bundle: a layout plus the memory it describes.
pub struct Bundle {
    region: Arc<CodeRegion>,
    base: NonNull<u8>,
    layout: BundleLayout,
}

// SAFETY: see `CodeRegion`. Cell contents are written through `&mut Bundle`
// before the owning method is shared; afterwards only the code cell is
// mutated, through atomic call-site patching.
unsafe impl Send for Bundle {}
unsafe impl Sync for Bundle {}

impl Bundle {
    /// Bundle start address.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Layout of the bundle.
    #[inline]
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Region the bundle was allocated from.
    #[inline]
    pub fn region(&self) -> &Arc<CodeRegion> {
        &self.region
    }

    /// Address of the first code byte.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.base() + self.layout.code_offset()
    }

    /// Address of `field`'s cell.
    #[inline]
    pub fn cell_address(&self, field: ArrayField) -> Option<usize> {
        self.layout.offset(field).map(|offset| self.base() + offset)
    }

    /// Copy `values` into `field`'s cell.
    ///
    /// The number and width of `values` must match the layout.
    pub fn write_cell<T: CellElement>(&mut self, field: ArrayField, values: &[T]) {
        assert_eq!(mem::size_of::<T>(), field.element_size(), "{field} element width");
        assert_eq!(values.len(), self.layout.length(field), "{field} length");
        let Some(offset) = self.layout.offset(field) else {
            return;
        };
        // SAFETY: the cell lies inside this bundle's allocation, is aligned for
        // T, and `&mut self` excludes readers.
        unsafe {
            let dst = self.base.as_ptr().add(offset) as *mut T;
            dst.copy_from_nonoverlapping(values.as_ptr(), values.len());
        }
    }

    /// Contents of `field`'s cell.
    pub fn cell<T: CellElement>(&self, field: ArrayField) -> &[T] {
        debug_assert_eq!(mem::size_of::<T>(), field.element_size());
        match self.layout.offset(field) {
            // SAFETY: in-bounds, aligned for T, and initialized (zeroed by the
            // mapping, then written by `write_cell`).
            Some(offset) => unsafe {
                slice::from_raw_parts(
                    self.base.as_ptr().add(offset) as *const T,
                    self.layout.length(field),
                )
            },
            None => &[],
        }
    }

    /// Mutable code bytes, for fix-ups before the method is published.
    #[inline]
    pub fn code_mut(&mut self) -> &mut [u8] {
        let len = self.layout.length(ArrayField::Code);
        // SAFETY: the code cell is in-bounds and `&mut self` is exclusive.
        unsafe { slice::from_raw_parts_mut(self.code_start() as *mut u8, len) }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.layout.size())
            .finish()
    }
}

#[inline(always)]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
