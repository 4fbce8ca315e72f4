//! # Physical Memory Access
//!
//! Code can only dereference virtual addresses. [`PhysMapper`] turns a
//! physical address into a pointer in the current address space so that the
//! frame allocator can keep its free-run records *inside* the free frames.
//!
//! - [`HhdmPhysMapper`]: the kernel's higher-half direct map, `HHDM_BASE + pa`.
//! - [`OffsetPhysMapper`]: any fixed offset, e.g. a host buffer standing in for
//!   physical memory.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space.
///
/// # Safety
/// Implementations must return pointers that are valid for reads and writes
/// of any physical frame the owning allocator manages.
pub unsafe trait PhysMapper {
    /// The pointer through which `pa` is reachable. Computing it is safe;
    /// dereferencing it is not.
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T;
}

/// [`PhysMapper`] implementation for kernels with a higher-half direct map (HHDM).
///
/// The HHDM mapping must be present and cover every managed frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

unsafe impl PhysMapper for HhdmPhysMapper {
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        (HHDM_BASE + pa.as_u64()) as usize as *mut T
    }
}

/// [`PhysMapper`] that adds a fixed (wrapping) offset.
#[derive(Copy, Clone, Debug)]
pub struct OffsetPhysMapper {
    offset: u64,
}

impl OffsetPhysMapper {
    /// # Safety
    /// Every physical address the user of this mapper touches, plus `offset`,
    /// must be valid writable memory.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }
}

unsafe impl PhysMapper for OffsetPhysMapper {
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        pa.as_u64().wrapping_add(self.offset) as usize as *mut T
    }
}
