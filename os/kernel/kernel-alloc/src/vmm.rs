//! # Demand-Paged Virtual Memory Manager
//!
//! Binds page ranges of one virtual window to [`MemoryObject`]s and resolves
//! page faults by binding frames on first touch.
//!
//! ```text
//!            maps (start → entry)                  memory object
//!  ┌──────────────────────────────────┐     ┌─────────────────────────┐
//!  │ 0xffff_c000_0000_0000 → [.., RW] │ ──► │ page 0: 0x0012_3000 RW  │
//!  │ 0xffff_c000_0000_4000 → [.., R ] │     │ page 1: unbound     RW  │
//!  └──────────────────────────────────┘     └─────────────────────────┘
//! ```
//!
//! Virtual ranges come from a [`RangeAllocator`] over the window. Every
//! mapping occupies exactly the range it claimed there, so map entries never
//! overlap.
//!
//! ## Locking
//! The map table lock is always taken before a memory object's page lock,
//! never the other way round. Faults and remaps hold the map table lock for
//! the whole operation so a concurrent unmap cannot pull the entry away.
//! Frees and unmaps hold it until the entry is gone from the page tables,
//! its range is back in the window and the frames are released.

use crate::fault::FaultCode;
use crate::frame_alloc::FrameAllocError;
use crate::memory_object::{MemoryObject, Page, check_protection};
use crate::page_mapper::{PageMapper, PageMapperError};
use crate::pager::Pager;
use crate::protection::{CachePolicy, Protection};
use crate::range_alloc::{RangeAllocator, RangeError};
use alloc::sync::Arc;
use kernel_collections::{IndexError, OrderedIndex};
use kernel_info::memory::{KERNEL_ALLOC_BASE, KERNEL_ALLOC_END};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::{PoisonError, SpinLock};
use log::{debug, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    /// The heap could not hold a page list or map entry.
    #[error("out of memory")]
    OutOfMemory,
    #[error("memory object has no pages")]
    EmptyObject,
    #[error("{requested:?} exceeds the capability of page {page}")]
    ProtectionViolation { requested: Protection, page: u64 },
    #[error("range at {0} overlaps an existing mapping")]
    Overlap(VirtualAddress),
    #[error("no mapping at {0}")]
    NotMapped(VirtualAddress),
    #[error("{0} is outside the VMM window")]
    OutOfWindow(VirtualAddress),
    #[error("address is not page aligned")]
    Unaligned,
    #[error("memory object is still mapped {mappings} times")]
    ObjectShared { mappings: usize },
    #[error("page {0} is past the end of the memory object")]
    PageOutOfBounds(u64),
    #[error("page mapper failed: {0}")]
    Mapper(#[from] PageMapperError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Poisoned(#[from] PoisonError),
}

/// Window and limits of one VMM instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VmmConfig {
    pub window_start: VirtualAddress,
    pub window_end: VirtualAddress,
    /// Upper bound on simultaneously live mappings.
    pub max_mappings: usize,
}

impl VmmConfig {
    #[must_use]
    pub const fn new(window_start: VirtualAddress, window_end: VirtualAddress) -> Self {
        Self {
            window_start,
            window_end,
            max_mappings: u32::MAX as usize,
        }
    }

    /// The kernel allocation window from the memory layout.
    #[must_use]
    pub const fn kernel_default() -> Self {
        Self::new(
            VirtualAddress::new(KERNEL_ALLOC_BASE),
            VirtualAddress::new(KERNEL_ALLOC_END),
        )
    }

    #[must_use]
    pub const fn with_max_mappings(mut self, max_mappings: usize) -> Self {
        self.max_mappings = max_mappings;
        self
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.window_start <= va && va < self.window_end
    }
}

/// Public view of one map entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappingInfo {
    pub start: VirtualAddress,
    pub pages: u64,
    pub protection: Protection,
    pub cache: CachePolicy,
    pub wired_pages: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VmmStats {
    pub mappings: usize,
    pub mapped_pages: u64,
    pub wired_pages: u64,
}

struct MapEntry {
    end: u64,
    object: Arc<MemoryObject>,
    protection: Protection,
    cache: CachePolicy,
    wired: u64,
}

impl MapEntry {
    fn pages(&self) -> u64 {
        self.object.page_count()
    }
}

pub struct Vmm<P: PageMapper> {
    config: VmmConfig,
    ranges: RangeAllocator,
    maps: SpinLock<OrderedIndex<MapEntry>>,
    mapper: P,
    pager: Arc<dyn Pager>,
}

impl<P: PageMapper> Vmm<P> {
    /// A VMM owning `config`'s window. `pager` backs every object created by
    /// [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Errors
    /// [`VmmError::Range`] for a malformed window.
    pub fn new(config: VmmConfig, mapper: P, pager: Arc<dyn Pager>) -> Result<Self, VmmError> {
        // Each mapping can split off at most two free neighbours.
        let ranges = RangeAllocator::with_node_limit(
            config.max_mappings.saturating_mul(2).saturating_add(1),
        );
        ranges.init(config.window_start, config.window_end)?;
        debug!("vmm: window {}..{}", config.window_start, config.window_end);
        Ok(Self {
            config,
            ranges,
            maps: SpinLock::new(OrderedIndex::with_limit(config.max_mappings)),
            mapper,
            pager,
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &VmmConfig {
        &self.config
    }

    /// The range allocator over the window, e.g. for reserving guard ranges.
    #[inline]
    #[must_use]
    pub const fn ranges(&self) -> &RangeAllocator {
        &self.ranges
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &P {
        &self.mapper
    }

    /// Allocate `count` pages anywhere in the window, backed by a new memory
    /// object whose pages are capped at `protection`.
    ///
    /// With `alloc_phys` every page is bound and wired up front; otherwise
    /// pages are bound by the fault handler on first touch. On failure
    /// nothing remains allocated.
    ///
    /// # Errors
    /// [`VmmError::Range`] when the window is exhausted, [`VmmError::Frames`]
    /// when eager binding runs out of frames.
    pub fn allocate_pages(
        &self,
        count: u64,
        protection: Protection,
        alloc_phys: bool,
    ) -> Result<VirtualAddress, VmmError> {
        let object = MemoryObject::new(count, protection, Arc::clone(&self.pager))?;
        if alloc_phys {
            object.bind_all(true)?;
        }
        let object = Arc::new(object);
        let va = self.ranges.allocate_pages(count)?;
        if let Err(e) = self.install(va, &object, protection, CachePolicy::default()) {
            self.release_range(va, count);
            return Err(e);
        }
        trace!("vmm: allocated {count} pages at {va} ({protection:?})");
        Ok(va)
    }

    /// # Errors
    /// See [`allocate_pages`](Self::allocate_pages).
    #[inline]
    pub fn allocate_page(
        &self,
        protection: Protection,
        alloc_phys: bool,
    ) -> Result<VirtualAddress, VmmError> {
        self.allocate_pages(1, protection, alloc_phys)
    }

    /// Tear down the mapping starting at `va` and release its object's
    /// frames.
    ///
    /// # Errors
    /// - [`VmmError::OutOfWindow`] / [`VmmError::NotMapped`] if `va` is not the
    ///   start of a mapping.
    /// - [`VmmError::ObjectShared`] if the object is mapped elsewhere too; use
    ///   [`unmap_memory`](Self::unmap_memory) for such mappings.
    pub fn free_pages(&self, va: VirtualAddress) -> Result<(), VmmError> {
        if !self.config.contains(va) {
            return Err(VmmError::OutOfWindow(va));
        }
        let (pages, released) = self.maps.with_lock(|maps| {
            let entry = maps.get_by_key(va.as_u64()).ok_or(VmmError::NotMapped(va))?;
            let mappings = entry.object.mappings();
            if mappings > 1 {
                warn!("vmm: free of {va} refused, object mapped {mappings} times");
                return Err(VmmError::ObjectShared { mappings });
            }
            let entry = maps.remove(va.as_u64()).ok_or(VmmError::NotMapped(va))?;
            let released = self.teardown(va, &entry, true)?;
            Ok((entry.pages(), released))
        })??;
        trace!("vmm: freed {pages} pages at {va} ({released} frames)");
        Ok(())
    }

    /// # Errors
    /// See [`free_pages`](Self::free_pages).
    #[inline]
    pub fn free_page(&self, va: VirtualAddress) -> Result<(), VmmError> {
        self.free_pages(va)
    }

    /// Map `object` at the fixed address `va` with `protection`.
    ///
    /// Every page's capability must permit `protection`; only pages that are
    /// already bound get page-table entries now.
    ///
    /// # Errors
    /// - [`VmmError::Overlap`] if the range is not free in the window.
    /// - [`VmmError::ProtectionViolation`] if a page forbids `protection`.
    /// - [`VmmError::Mapper`] if installing an entry failed; nothing stays
    ///   installed.
    pub fn map_memory(
        &self,
        va: VirtualAddress,
        object: Arc<MemoryObject>,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), VmmError> {
        if !va.is_page_aligned() {
            return Err(VmmError::Unaligned);
        }
        if !self.config.contains(va) {
            return Err(VmmError::OutOfWindow(va));
        }
        let pages = object.page_count();
        self.ranges
            .allocate_pages_at(va, pages)
            .map_err(|e| match e {
                RangeError::NotFree(_) => VmmError::Overlap(va),
                RangeError::OutOfRange => VmmError::OutOfWindow(va),
                e => e.into(),
            })?;
        if let Err(e) = self.install(va, &object, protection, cache) {
            self.release_range(va, pages);
            return Err(e);
        }
        debug!("vmm: mapped {pages} pages at {va} ({protection:?}, {cache:?})");
        Ok(())
    }

    /// Map `object` wherever the window has room.
    ///
    /// # Errors
    /// As for [`map_memory`](Self::map_memory), plus [`VmmError::Range`] when
    /// the window is exhausted.
    pub fn map_shared(
        &self,
        object: Arc<MemoryObject>,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<VirtualAddress, VmmError> {
        let pages = object.page_count();
        let va = self.ranges.allocate_pages(pages)?;
        if let Err(e) = self.install(va, &object, protection, cache) {
            self.release_range(va, pages);
            return Err(e);
        }
        debug!("vmm: mapped shared object ({pages} pages) at {va}");
        Ok(va)
    }

    /// Remove the mapping starting at `va` without touching the object's
    /// frames. The object is handed back to the caller.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if no mapping starts at `va`.
    /// - [`VmmError::Poisoned`] if the object's page lock is poisoned; the
    ///   mapping is gone regardless.
    pub fn unmap_memory(&self, va: VirtualAddress) -> Result<Arc<MemoryObject>, VmmError> {
        if !self.config.contains(va) {
            return Err(VmmError::OutOfWindow(va));
        }
        let entry = self.maps.with_lock(|maps| {
            let entry = maps.remove(va.as_u64()).ok_or(VmmError::NotMapped(va))?;
            self.teardown(va, &entry, false)?;
            Ok::<_, VmmError>(entry)
        })??;
        debug!("vmm: unmapped {} pages at {va}", entry.pages());
        Ok(entry.object)
    }

    /// Change protection and cache policy of the mapping starting at `va`.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`], [`VmmError::ProtectionViolation`] (the
    /// mapping is unchanged) or [`VmmError::Mapper`].
    pub fn remap_memory(
        &self,
        va: VirtualAddress,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), VmmError> {
        self.maps.with_lock(|maps| {
            let entry = maps
                .get_by_key_mut(va.as_u64())
                .ok_or(VmmError::NotMapped(va))?;
            entry.object.with_pages(|pages| {
                check_protection(pages, protection)?;
                for (page_va, page) in page_addresses(va, pages) {
                    if page.phys.is_none() {
                        continue;
                    }
                    match self.mapper.remap_page(page_va, protection, cache) {
                        Ok(()) | Err(PageMapperError::NotMapped) => {}
                        Err(e) => return Err(VmmError::Mapper(e)),
                    }
                }
                Ok(())
            })??;
            entry.protection = protection;
            entry.cache = cache;
            self.mapper.invalidate_pages(va, entry.pages());
            debug!("vmm: remapped {va} as {protection:?}, {cache:?}");
            Ok(())
        })?
    }

    /// Resolve a page fault at `va`.
    ///
    /// `true` means the access may be retried. `false` means the fault is
    /// not this VMM's to fix (outside the window, unmapped, or a protection
    /// violation); the caller decides what to do with the faulting context.
    pub fn handle_page_fault(&self, code: FaultCode, va: VirtualAddress) -> bool {
        if !self.config.contains(va) {
            return false;
        }
        match self.resolve_fault(code, va) {
            Ok(()) => true,
            Err(e) => {
                warn!("vmm: unhandled page fault at {va} ({}): {e}", code.explain());
                false
            }
        }
    }

    fn resolve_fault(&self, code: FaultCode, va: VirtualAddress) -> Result<(), VmmError> {
        let page_va = va.align_down();
        let access = code.access();
        self.maps.with_lock(|maps| {
            let id = maps
                .find_or_lower(page_va.as_u64())
                .ok_or(VmmError::NotMapped(va))?;
            let (start, entry) = maps.entry(id).ok_or(VmmError::NotMapped(va))?;
            if page_va.as_u64() >= entry.end {
                return Err(VmmError::NotMapped(va));
            }
            let index = (page_va.as_u64() - start) / PAGE_SIZE;
            if !entry.protection.contains(access) {
                return Err(VmmError::ProtectionViolation {
                    requested: access,
                    page: index,
                });
            }

            entry.object.with_pages(|pages| {
                let page = usize::try_from(index)
                    .ok()
                    .and_then(|i| pages.get_mut(i))
                    .ok_or(VmmError::PageOutOfBounds(index))?;
                if !page.max_protection.permits(access) {
                    return Err(VmmError::ProtectionViolation {
                        requested: access,
                        page: index,
                    });
                }

                let (protection, cache) = (entry.protection, entry.cache);
                if let Some(frame) = page.phys {
                    // Resident through another mapping, or a stale TLB entry.
                    return match self.mapper.map_page(page_va, frame, protection, cache) {
                        Ok(()) | Err(PageMapperError::AlreadyMapped) => {
                            trace!("vmm: fault at {va} resolved with resident frame {frame}");
                            Ok(())
                        }
                        Err(e) => Err(e.into()),
                    };
                }

                let pager = entry.object.pager();
                let frame = pager.allocate_page()?;
                if let Err(e) = self.mapper.map_page(page_va, frame, protection, cache) {
                    if let Err(fe) = pager.free_page(frame) {
                        warn!("vmm: could not return frame {frame} after failed map: {fe}");
                    }
                    return Err(e.into());
                }
                page.phys = Some(frame);
                trace!("vmm: fault at {va} bound frame {frame}");
                Ok(())
            })??;

            self.mapper.invalidate_pages(page_va, 1);
            Ok(())
        })?
    }

    /// Physical address backing `va`, if it lies in a bound page.
    ///
    /// # Errors
    /// [`VmmError::Poisoned`] if a lock is poisoned.
    pub fn translate(&self, va: VirtualAddress) -> Result<Option<PhysicalAddress>, VmmError> {
        self.maps.with_lock(|maps| {
            let Some((start, entry)) = maps
                .find_or_lower(va.as_u64())
                .and_then(|id| maps.entry(id))
            else {
                return Ok(None);
            };
            if va.as_u64() >= entry.end {
                return Ok(None);
            }
            let offset = va.as_u64() - start;
            let index = offset / PAGE_SIZE;
            let page = entry.object.page(index)?;
            Ok(page.phys.map(|pa| pa + offset % PAGE_SIZE))
        })?
    }

    /// # Errors
    /// [`VmmError::Poisoned`] if the map table lock is poisoned.
    pub fn stats(&self) -> Result<VmmStats, VmmError> {
        Ok(self.maps.with_lock(|maps| {
            let mut stats = VmmStats {
                mappings: maps.len(),
                ..VmmStats::default()
            };
            maps.for_each(|_, e| {
                stats.mapped_pages += e.pages();
                stats.wired_pages += e.wired;
            });
            stats
        })?)
    }

    /// Visit every mapping in address order.
    ///
    /// # Errors
    /// [`VmmError::Poisoned`] if the map table lock is poisoned.
    pub fn for_each_mapping(&self, mut f: impl FnMut(MappingInfo)) -> Result<(), VmmError> {
        self.maps.with_lock(|maps| {
            maps.for_each(|start, e| {
                f(MappingInfo {
                    start: VirtualAddress::new(start),
                    pages: e.pages(),
                    protection: e.protection,
                    cache: e.cache,
                    wired_pages: e.wired,
                });
            });
        })?;
        Ok(())
    }

    /// Record a map entry for the already claimed range at `va` and install
    /// the object's bound pages.
    fn install(
        &self,
        va: VirtualAddress,
        object: &Arc<MemoryObject>,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), VmmError> {
        let pages = object.page_count();
        let end = va.checked_add_pages(pages).ok_or(VmmError::OutOfWindow(va))?;
        self.maps.with_lock(|maps| {
            maps.reserve(1)?;
            if let Some(id) = maps.find_or_lower(end.as_u64() - 1)
                && let Some((_, prev)) = maps.entry(id)
                && prev.end > va.as_u64()
            {
                return Err(VmmError::Overlap(va));
            }

            let wired = object.with_pages(|pages| {
                check_protection(pages, protection)?;
                for (i, (page_va, page)) in page_addresses(va, pages).enumerate() {
                    let Some(frame) = page.phys else { continue };
                    if let Err(e) = self.mapper.map_page(page_va, frame, protection, cache) {
                        warn!("vmm: mapping {page_va} failed: {e}");
                        self.unmap_bound(va, &pages[..i]);
                        return Err(VmmError::Mapper(e));
                    }
                }
                object.add_mapping();
                Ok(pages.iter().filter(|p| p.wired).count() as u64)
            })??;

            let entry = MapEntry {
                end: end.as_u64(),
                object: Arc::clone(object),
                protection,
                cache,
                wired,
            };
            if let Err(e) = maps.insert(va.as_u64(), entry) {
                if let Err(de) = self.detach(va, object) {
                    warn!("vmm: undoing install at {va} failed: {de}");
                }
                return Err(e.into());
            }
            self.mapper.invalidate_pages(va, pages);
            Ok(())
        })?
    }

    /// Take down `entry`, already removed from the map table, and give its
    /// range back. With `release`, the object's frames go back to its pager
    /// once no mapping is left. Returns the number of frames released.
    ///
    /// Runs with the map table lock held.
    fn teardown(
        &self,
        va: VirtualAddress,
        entry: &MapEntry,
        release: bool,
    ) -> Result<u64, VmmError> {
        let detached = self.detach(va, &entry.object);
        self.release_range(va, entry.pages());
        if detached? > 0 || !release {
            return Ok(0);
        }
        match entry.object.release_frames() {
            Err(VmmError::ObjectShared { mappings }) => {
                debug!("vmm: frames of {va} stay with {mappings} newer mappings");
                Ok(0)
            }
            released => released,
        }
    }

    /// Remove `object`'s page-table entries at `va` and drop its mapping
    /// count. Returns the mappings left.
    fn detach(&self, va: VirtualAddress, object: &MemoryObject) -> Result<usize, VmmError> {
        let detached = object.detach(|pages| self.unmap_bound(va, pages));
        if detached.is_err() {
            // The page list is out of reach, so clear every slot.
            (0..object.page_count()).for_each(|i| self.unmap_one(va + i * PAGE_SIZE));
        }
        self.mapper.invalidate_pages(va, object.page_count());
        detached
    }

    fn unmap_bound(&self, va: VirtualAddress, pages: &[Page]) {
        for (page_va, page) in page_addresses(va, pages) {
            if page.phys.is_some() {
                self.unmap_one(page_va);
            }
        }
    }

    fn unmap_one(&self, page_va: VirtualAddress) {
        match self.mapper.unmap_page(page_va) {
            // Bound through another mapping and never touched here.
            Ok(()) | Err(PageMapperError::NotMapped) => {}
            Err(e) => warn!("vmm: unmapping {page_va} failed: {e}"),
        }
    }

    fn release_range(&self, va: VirtualAddress, pages: u64) {
        if let Err(e) = self.ranges.free_pages(va, pages) {
            warn!("vmm: releasing {pages} pages at {va} failed: {e}");
        }
    }
}

fn page_addresses<'a, T>(
    va: VirtualAddress,
    pages: &'a [T],
) -> impl Iterator<Item = (VirtualAddress, &'a T)> + 'a {
    pages
        .iter()
        .enumerate()
        .map(move |(i, p)| (va + i as u64 * PAGE_SIZE, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::FrameAllocator;
    use crate::pager::FramePager;
    use crate::phys_mapper::OffsetPhysMapper;
    use crate::test_support::{HostRam, RecordingMapper};
    use kernel_info::boot::MemoryMapEntry;

    const PHYS_BASE: u64 = 0x20_0000;
    const WINDOW: u64 = 0xffff_c000_0000_0000;

    // Field order is drop order: the VMM returns frames into `mem`.
    struct Fixture {
        vmm: Vmm<RecordingMapper>,
        frames: Arc<FrameAllocator<OffsetPhysMapper>>,
        _mem: HostRam,
    }

    impl Fixture {
        fn new(frames: usize, window_pages: u64) -> Self {
            let mem = HostRam::new(PHYS_BASE, frames);
            let alloc = Arc::new(FrameAllocator::new(mem.mapper()));
            let usable = MemoryMapEntry::usable(PHYS_BASE, frames as u64 * PAGE_SIZE);
            unsafe { alloc.init([usable]) }.unwrap();
            let config = VmmConfig::new(
                VirtualAddress::new(WINDOW),
                VirtualAddress::new(WINDOW + window_pages * PAGE_SIZE),
            );
            let pager: Arc<dyn Pager> = Arc::new(FramePager::new(alloc.clone()));
            let vmm = Vmm::new(config, RecordingMapper::default(), pager).unwrap();
            Self {
                vmm,
                frames: alloc,
                _mem: mem,
            }
        }

        fn used_frames(&self) -> u64 {
            self.frames.stats().unwrap().used
        }

        fn object(&self, pages: u64, cap: Protection) -> Arc<MemoryObject> {
            Arc::new(MemoryObject::new(pages, cap, Arc::clone(&self.vmm.pager)).unwrap())
        }
    }

    fn read() -> FaultCode {
        FaultCode::new()
    }

    fn write() -> FaultCode {
        FaultCode::new().with_write(true)
    }

    #[test]
    fn eager_allocation_maps_and_wires_every_page() {
        let f = Fixture::new(8, 16);
        let va = f.vmm.allocate_pages(3, Protection::READ_WRITE, true).unwrap();
        assert_eq!(f.used_frames(), 3);
        assert_eq!(f.vmm.mapper().installed(), 3);
        let stats = f.vmm.stats().unwrap();
        assert_eq!((stats.mappings, stats.mapped_pages, stats.wired_pages), (1, 3, 3));

        let pa = f.vmm.translate(va + PAGE_SIZE + 0x10).unwrap().unwrap();
        assert_eq!(pa.page_offset(), 0x10);
        assert_eq!(
            f.vmm.mapper().lookup(va + PAGE_SIZE).map(|e| e.0),
            Some(pa.align_down())
        );

        f.vmm.free_pages(va).unwrap();
        assert_eq!(f.used_frames(), 0);
        assert_eq!(f.vmm.mapper().installed(), 0);
        assert_eq!(f.vmm.ranges().stats().unwrap().used, 0);
    }

    #[test]
    fn failed_install_unwinds_everything() {
        let f = Fixture::new(8, 16);
        f.vmm
            .mapper()
            .fail_at(Some(VirtualAddress::new(WINDOW + 2 * PAGE_SIZE)));
        assert_eq!(
            f.vmm.allocate_pages(3, Protection::READ_WRITE, true),
            Err(VmmError::Mapper(PageMapperError::OutOfMemory))
        );
        assert_eq!(f.used_frames(), 0);
        assert_eq!(f.vmm.mapper().installed(), 0);
        assert_eq!(f.vmm.stats().unwrap().mappings, 0);
        assert_eq!(f.vmm.ranges().stats().unwrap().free, 16);
    }

    #[test]
    fn physical_exhaustion_is_reported() {
        let f = Fixture::new(2, 16);
        assert!(matches!(
            f.vmm.allocate_pages(3, Protection::READ, true),
            Err(VmmError::Frames(FrameAllocError::OutOfMemory { .. }))
        ));
        assert_eq!(f.used_frames(), 0);
        assert_eq!(f.vmm.ranges().stats().unwrap().used, 0);
    }

    #[test]
    fn window_exhaustion_is_reported() {
        let f = Fixture::new(2, 4);
        f.vmm.allocate_pages(3, Protection::READ, false).unwrap();
        assert!(matches!(
            f.vmm.allocate_pages(2, Protection::READ, false),
            Err(VmmError::Range(RangeError::OutOfSpace { pages: 2 }))
        ));
    }

    #[test]
    fn map_memory_rejects_overlap_and_foreign_addresses() {
        let f = Fixture::new(4, 16);
        let va = f.vmm.allocate_pages(4, Protection::READ_WRITE, false).unwrap();
        let obj = f.object(2, Protection::READ_WRITE);
        let map_at = |at: VirtualAddress| {
            f.vmm
                .map_memory(at, obj.clone(), Protection::READ, CachePolicy::WriteBack)
        };
        assert_eq!(
            map_at(va + 2 * PAGE_SIZE),
            Err(VmmError::Overlap(va + 2 * PAGE_SIZE))
        );
        let foreign = VirtualAddress::new(0x1000);
        assert_eq!(map_at(foreign), Err(VmmError::OutOfWindow(foreign)));
        assert_eq!(map_at(va + 0x800), Err(VmmError::Unaligned));
        assert_eq!(obj.mappings(), 0);
    }

    #[test]
    fn free_pages_requires_the_start_of_a_mapping() {
        let f = Fixture::new(4, 16);
        let va = f.vmm.allocate_pages(2, Protection::READ, false).unwrap();
        assert_eq!(
            f.vmm.free_pages(va + PAGE_SIZE),
            Err(VmmError::NotMapped(va + PAGE_SIZE))
        );
        assert_eq!(
            f.vmm.free_pages(VirtualAddress::new(0x1000)),
            Err(VmmError::OutOfWindow(VirtualAddress::new(0x1000)))
        );
        f.vmm.free_pages(va).unwrap();
        assert_eq!(f.vmm.free_pages(va), Err(VmmError::NotMapped(va)));
    }

    #[test]
    fn remap_checks_every_page_before_changing_anything() {
        let f = Fixture::new(4, 16);
        let va = f.vmm.allocate_pages(2, Protection::READ_WRITE, true).unwrap();

        f.vmm
            .remap_memory(va, Protection::READ, CachePolicy::Uncached)
            .unwrap();
        assert_eq!(
            f.vmm.mapper().lookup(va + PAGE_SIZE).map(|e| (e.1, e.2)),
            Some((Protection::READ, CachePolicy::Uncached))
        );

        assert!(matches!(
            f.vmm.remap_memory(va, Protection::EXECUTE, CachePolicy::WriteBack),
            Err(VmmError::ProtectionViolation { page: 0, .. })
        ));
        let mut seen = Vec::new();
        f.vmm.for_each_mapping(|m| seen.push((m.protection, m.cache))).unwrap();
        assert_eq!(seen, [(Protection::READ, CachePolicy::Uncached)]);
        assert_eq!(
            f.vmm.remap_memory(va + PAGE_SIZE, Protection::READ, CachePolicy::WriteBack),
            Err(VmmError::NotMapped(va + PAGE_SIZE))
        );
    }

    #[test]
    fn fault_respects_both_mapping_and_page_rights() {
        let f = Fixture::new(4, 16);
        let va = f.vmm.allocate_pages(2, Protection::READ_WRITE, false).unwrap();
        assert!(!f.vmm.handle_page_fault(FaultCode::new().with_execute(true), va));

        let obj = f.vmm.unmap_memory(va).unwrap();
        obj.set_max_protection(1, Protection::READ).unwrap();
        let va = f
            .vmm
            .map_shared(obj, Protection::READ, CachePolicy::WriteBack)
            .unwrap();
        // The mapping only grants READ.
        assert!(!f.vmm.handle_page_fault(write(), va));
        assert!(f.vmm.handle_page_fault(read(), va + PAGE_SIZE));
        assert_eq!(f.used_frames(), 1);
    }

    #[test]
    fn shared_object_faults_through_to_the_resident_frame() {
        let f = Fixture::new(4, 16);
        let obj = f.object(1, Protection::READ_WRITE);
        let a = VirtualAddress::new(WINDOW + 4 * PAGE_SIZE);
        f.vmm
            .map_memory(a, obj.clone(), Protection::READ_WRITE, CachePolicy::WriteBack)
            .unwrap();
        let b = f
            .vmm
            .map_shared(obj.clone(), Protection::READ, CachePolicy::WriteBack)
            .unwrap();
        assert_eq!(obj.mappings(), 2);

        assert!(f.vmm.handle_page_fault(write(), a + 8));
        assert!(f.vmm.handle_page_fault(read(), b));
        assert_eq!(f.used_frames(), 1);
        assert_eq!(f.vmm.translate(a).unwrap(), f.vmm.translate(b).unwrap());

        assert_eq!(
            f.vmm.free_pages(a),
            Err(VmmError::ObjectShared { mappings: 2 })
        );
        let back = f.vmm.unmap_memory(b).unwrap();
        assert!(Arc::ptr_eq(&back, &obj));
        assert_eq!(f.vmm.mapper().lookup(b), None);
        assert_eq!(f.used_frames(), 1);

        f.vmm.free_pages(a).unwrap();
        assert_eq!(f.used_frames(), 0);
        assert_eq!(obj.mappings(), 0);
    }

    #[test]
    fn frames_of_a_mapped_object_are_not_released() {
        let f = Fixture::new(4, 16);
        let obj = f.object(1, Protection::READ_WRITE);
        let a = f
            .vmm
            .map_shared(obj.clone(), Protection::READ_WRITE, CachePolicy::WriteBack)
            .unwrap();
        let b = f
            .vmm
            .map_shared(obj.clone(), Protection::READ, CachePolicy::WriteBack)
            .unwrap();
        assert!(f.vmm.handle_page_fault(write(), a));
        let frame = f.vmm.translate(a).unwrap().unwrap();

        f.vmm.unmap_memory(b).unwrap();
        assert_eq!(
            obj.release_frames(),
            Err(VmmError::ObjectShared { mappings: 1 })
        );
        assert_eq!(f.used_frames(), 1);
        assert_eq!(f.vmm.mapper().lookup(a).map(|e| e.0), Some(frame));

        f.vmm.free_pages(a).unwrap();
        assert_eq!(f.used_frames(), 0);
        assert_eq!(f.vmm.mapper().mapped_to(frame), 0);
    }

    fn poison(obj: &MemoryObject) {
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            obj.with_pages(|_| panic!("page list update failed")).ok();
        }));
        assert!(panicked.is_err());
    }

    #[test]
    fn unmap_through_a_poisoned_object_still_releases_the_mapping() {
        let f = Fixture::new(4, 16);
        let obj = f.object(2, Protection::READ_WRITE);
        let va = f
            .vmm
            .map_shared(obj.clone(), Protection::READ_WRITE, CachePolicy::WriteBack)
            .unwrap();
        assert!(f.vmm.handle_page_fault(write(), va + PAGE_SIZE));
        poison(&obj);

        assert_eq!(
            f.vmm.unmap_memory(va).map(|_| ()),
            Err(VmmError::Poisoned(PoisonError))
        );
        assert_eq!(obj.mappings(), 0);
        assert_eq!(f.vmm.mapper().installed(), 0);
        assert_eq!(f.vmm.stats().unwrap().mappings, 0);
        assert_eq!(f.vmm.ranges().stats().unwrap().used, 0);
        f.vmm.ranges().verify().unwrap();
    }

    #[test]
    fn free_through_a_poisoned_object_still_releases_the_range() {
        let f = Fixture::new(4, 16);
        let obj = f.object(1, Protection::READ_WRITE);
        let va = f
            .vmm
            .map_shared(obj.clone(), Protection::READ_WRITE, CachePolicy::WriteBack)
            .unwrap();
        assert!(f.vmm.handle_page_fault(write(), va));
        poison(&obj);

        assert_eq!(f.vmm.free_pages(va), Err(VmmError::Poisoned(PoisonError)));
        assert_eq!(obj.mappings(), 0);
        assert_eq!(f.vmm.mapper().installed(), 0);
        assert_eq!(f.vmm.ranges().stats().unwrap().used, 0);
        assert_eq!(f.vmm.free_pages(va), Err(VmmError::NotMapped(va)));

        // The last reference hands the frame back.
        drop(obj);
        assert_eq!(f.used_frames(), 0);
    }

    #[test]
    fn faults_outside_any_mapping_are_not_handled() {
        let f = Fixture::new(4, 16);
        let va = f.vmm.allocate_pages(1, Protection::READ_WRITE, false).unwrap();
        assert!(!f.vmm.handle_page_fault(read(), va + PAGE_SIZE));
        assert!(!f.vmm.handle_page_fault(read(), VirtualAddress::new(0x1000)));
        assert!(!f
            .vmm
            .handle_page_fault(read(), VirtualAddress::new(WINDOW + 16 * PAGE_SIZE)));
        assert_eq!(f.used_frames(), 0);
    }

    #[test]
    fn max_mappings_bounds_the_map_table() {
        let mem = HostRam::new(PHYS_BASE, 1);
        let alloc = Arc::new(FrameAllocator::new(mem.mapper()));
        let pager: Arc<dyn Pager> = Arc::new(FramePager::new(alloc));
        let config = VmmConfig::new(
            VirtualAddress::new(WINDOW),
            VirtualAddress::new(WINDOW + 16 * PAGE_SIZE),
        )
        .with_max_mappings(1);
        let vmm = Vmm::new(config, RecordingMapper::default(), pager).unwrap();
        vmm.allocate_page(Protection::READ, false).unwrap();
        assert!(vmm.allocate_page(Protection::READ, false).is_err());
        assert_eq!(vmm.ranges().stats().unwrap().used, 1);
    }
}
