//! Host stand-ins for physical memory and page tables.
//!
//! Shared by the unit tests and, through `tests/common`, by the integration
//! tests, which is why everything is named through `kernel_alloc::`.

#![allow(dead_code)]

use kernel_alloc::{CachePolicy, OffsetPhysMapper, PageMapper, PageMapperError, Protection};
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// `frames` zeroed, page-aligned host pages posing as physical memory at
/// `base`.
pub struct HostRam {
    base: u64,
    ptr: *mut u8,
    layout: Layout,
}

// The buffer is only reached through allocators that lock around access.
unsafe impl Send for HostRam {}
unsafe impl Sync for HostRam {}

impl HostRam {
    pub fn new(base: u64, frames: usize) -> Self {
        let layout =
            Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { base, ptr, layout }
    }

    pub fn mapper(&self) -> OffsetPhysMapper {
        // Safety: the allocators under test only touch frames in this buffer.
        unsafe { OffsetPhysMapper::new((self.ptr as u64).wrapping_sub(self.base)) }
    }

    /// The whole buffer as one usable memory-map entry.
    pub fn usable(&self) -> MemoryMapEntry {
        MemoryMapEntry::usable(self.base, self.layout.size() as u64)
    }

    pub fn page(&self, pa: PhysicalAddress) -> &[u8] {
        let offset = self.offset(pa);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), PAGE_SIZE as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn page_mut(&self, pa: PhysicalAddress) -> &mut [u8] {
        let offset = self.offset(pa);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), PAGE_SIZE as usize) }
    }

    fn offset(&self, pa: PhysicalAddress) -> usize {
        let offset = usize::try_from(pa.align_down().as_u64() - self.base).unwrap();
        assert!(offset < self.layout.size(), "{pa} outside host RAM");
        offset
    }
}

impl Drop for HostRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Page tables as a map, recording every call.
#[derive(Default)]
pub struct RecordingMapper {
    state: Mutex<RecordedTables>,
}

#[derive(Default)]
struct RecordedTables {
    entries: BTreeMap<u64, (PhysicalAddress, Protection, CachePolicy)>,
    map_calls: usize,
    invalidations: usize,
    fail_at: Option<VirtualAddress>,
}

impl RecordingMapper {
    pub fn lookup(&self, va: VirtualAddress) -> Option<(PhysicalAddress, Protection, CachePolicy)> {
        self.state.lock().unwrap().entries.get(&va.as_u64()).copied()
    }

    pub fn installed(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Installed entries pointing at `pa`.
    pub fn mapped_to(&self, pa: PhysicalAddress) -> usize {
        let s = self.state.lock().unwrap();
        s.entries.values().filter(|e| e.0 == pa).count()
    }

    pub fn map_calls(&self) -> usize {
        self.state.lock().unwrap().map_calls
    }

    pub fn invalidations(&self) -> usize {
        self.state.lock().unwrap().invalidations
    }

    /// Make `map_page` at `va` fail with `OutOfMemory`.
    pub fn fail_at(&self, va: Option<VirtualAddress>) {
        self.state.lock().unwrap().fail_at = va;
    }
}

impl PageMapper for RecordingMapper {
    fn map_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError> {
        let mut s = self.state.lock().unwrap();
        s.map_calls += 1;
        if s.fail_at == Some(va) {
            return Err(PageMapperError::OutOfMemory);
        }
        if s.entries.contains_key(&va.as_u64()) {
            return Err(PageMapperError::AlreadyMapped);
        }
        s.entries.insert(va.as_u64(), (pa, protection, cache));
        Ok(())
    }

    fn unmap_page(&self, va: VirtualAddress) -> Result<(), PageMapperError> {
        let mut s = self.state.lock().unwrap();
        s.entries
            .remove(&va.as_u64())
            .map(|_| ())
            .ok_or(PageMapperError::NotMapped)
    }

    fn remap_page(
        &self,
        va: VirtualAddress,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError> {
        let mut s = self.state.lock().unwrap();
        let entry = s
            .entries
            .get_mut(&va.as_u64())
            .ok_or(PageMapperError::NotMapped)?;
        entry.1 = protection;
        entry.2 = cache;
        Ok(())
    }

    fn invalidate_pages(&self, _va: VirtualAddress, _count: u64) {
        self.state.lock().unwrap().invalidations += 1;
    }
}
