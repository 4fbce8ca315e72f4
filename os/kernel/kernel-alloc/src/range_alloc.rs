//! # Virtual Address-Range Allocator
//!
//! Hands out page-granular ranges of a fixed virtual window. Two indexes are
//! kept consistent on every mutation:
//!
//! - **regions**: every maximal run of pages with the same state
//!   ([`RegionState`]), keyed by start address. Together they tile the window
//!   without gaps or overlaps, and no two free regions are adjacent.
//! - **buckets**: free regions grouped by page count. Each bucket is a list of
//!   start addresses; an empty bucket is removed from the index.
//!
//! ```text
//!  regions:  [0x1000 free 1][0x2000 used 1][0x3000 free 2]
//!  buckets:  1 → [0x1000]   2 → [0x3000]
//! ```
//!
//! Allocation without an address picks the smallest bucket that fits and
//! takes its most recently added member, so an allocate/free pair leaves the
//! buckets exactly as they were.
//!
//! All node storage needed by an operation is reserved before the first
//! change, so an operation either completes or leaves the allocator untouched.

use bitfield_struct::bitfield;
use kernel_collections::{IndexError, List, ListNodeId, ListPool, OrderedIndex};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::{PoisonError, SpinLock};
use log::{debug, trace, warn};

/// State of one region of the window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionState {
    Free,
    Used,
    Reserved,
}

/// Packed region record: page count plus the two state bits.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
struct RegionMeta {
    #[bits(62)]
    pages: u64,
    free: bool,
    reserved: bool,
}

impl RegionMeta {
    const fn of(pages: u64, state: RegionState) -> Self {
        Self::new()
            .with_pages(pages)
            .with_free(matches!(state, RegionState::Free))
            .with_reserved(matches!(state, RegionState::Reserved))
    }

    const fn state(self) -> RegionState {
        if self.free() {
            RegionState::Free
        } else if self.reserved() {
            RegionState::Reserved
        } else {
            RegionState::Used
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Region {
    meta: RegionMeta,
    /// Position in the bucket list; set exactly when the region is free.
    bucket_link: Option<ListNodeId>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("no free range of {pages} pages")]
    OutOfSpace { pages: u64 },
    #[error("range lies outside the allocator window")]
    OutOfRange,
    #[error("address is not page aligned")]
    Unaligned,
    #[error("zero-length range")]
    ZeroPages,
    #[error("allocator window already initialized")]
    AlreadyInitialized,
    /// The requested range is not entirely inside one free region.
    #[error("range at {0} is not free")]
    NotFree(VirtualAddress),
    /// No used region starts at this address.
    #[error("no allocation starts at {0}")]
    NotAllocated(VirtualAddress),
    /// No reserved region starts at this address.
    #[error("no reservation starts at {0}")]
    NotReserved(VirtualAddress),
    #[error("range at {0} is already free")]
    AlreadyFree(VirtualAddress),
    #[error("region holds {actual} pages, {requested} requested")]
    SizeMismatch { actual: u64, requested: u64 },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("range allocator corrupted: {0}")]
    Corrupted(&'static str),
    #[error(transparent)]
    Poisoned(#[from] PoisonError),
}

/// Counters reported by [`RangeAllocator::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RangeStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub reserved: u64,
    pub regions: usize,
    pub buckets: usize,
}

struct RangeState {
    window: Option<(u64, u64)>,
    regions: OrderedIndex<Region>,
    buckets: OrderedIndex<List>,
    members: ListPool<u64>,
    free: u64,
    used: u64,
    reserved: u64,
}

/// Page-granular allocator over one virtual window.
pub struct RangeAllocator {
    state: SpinLock<RangeState>,
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_node_limit(u32::MAX as usize)
    }

    /// An allocator whose indexes hold at most `limit` records each.
    #[must_use]
    pub const fn with_node_limit(limit: usize) -> Self {
        Self {
            state: SpinLock::new(RangeState {
                window: None,
                regions: OrderedIndex::with_limit(limit),
                buckets: OrderedIndex::with_limit(limit),
                members: ListPool::with_limit(limit),
                free: 0,
                used: 0,
                reserved: 0,
            }),
        }
    }

    /// Seed the allocator with one free region covering `[start, end)`.
    ///
    /// # Errors
    /// [`RangeError::AlreadyInitialized`] on a second call, alignment and
    /// size errors for a malformed window.
    pub fn init(&self, start: VirtualAddress, end: VirtualAddress) -> Result<(), RangeError> {
        if !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(RangeError::Unaligned);
        }
        let pages = start.pages_until(end).filter(|&p| p > 0).ok_or(RangeError::ZeroPages)?;
        self.state.with_lock(|st| {
            if st.window.is_some() {
                return Err(RangeError::AlreadyInitialized);
            }
            st.reserve_nodes(1)?;
            st.make_free(start.as_u64(), pages)?;
            st.window = Some((start.as_u64(), end.as_u64()));
            st.free = pages;
            debug!("range allocator: window {start}..{end} ({pages} pages)");
            Ok(())
        })?
    }

    /// Allocate `pages` pages anywhere in the window (best-fitting bucket).
    ///
    /// # Errors
    /// [`RangeError::OutOfSpace`] if no free region is large enough.
    pub fn allocate_pages(&self, pages: u64) -> Result<VirtualAddress, RangeError> {
        if pages == 0 {
            return Err(RangeError::ZeroPages);
        }
        self.state.with_lock(|st| {
            st.reserve_nodes(1)?;
            let Some(bucket) = st.buckets.find_or_higher(pages) else {
                warn!("range allocator: no free range of {pages} pages");
                return Err(RangeError::OutOfSpace { pages });
            };
            let size = st
                .buckets
                .key(bucket)
                .ok_or(RangeError::Corrupted("bucket handle"))?;
            let list = st
                .buckets
                .value_mut(bucket)
                .ok_or(RangeError::Corrupted("bucket handle"))?;
            let start = st
                .members
                .pop_back(list)
                .ok_or(RangeError::Corrupted("empty bucket"))?;
            if list.is_empty() {
                st.buckets.remove_node(bucket)?;
            }

            let region = st
                .regions
                .get_by_key_mut(start)
                .ok_or(RangeError::Corrupted("bucket member without region"))?;
            *region = Region {
                meta: RegionMeta::of(pages, RegionState::Used),
                bucket_link: None,
            };
            if size > pages {
                st.make_free(start + pages * PAGE_SIZE, size - pages)?;
                debug!("range allocator: split {size} pages at {start:#x}");
            }
            st.free -= pages;
            st.used += pages;
            trace!("range allocator: allocated {pages} pages at {start:#x}");
            st.after_mutation();
            Ok(VirtualAddress::new(start))
        })?
    }

    /// Allocate exactly `[addr, addr + pages)`.
    ///
    /// # Errors
    /// [`RangeError::NotFree`] unless the range lies inside one free region.
    pub fn allocate_pages_at(&self, addr: VirtualAddress, pages: u64) -> Result<(), RangeError> {
        self.claim(addr, pages, RegionState::Used)
    }

    /// Release an allocation made by [`allocate_pages`](Self::allocate_pages)
    /// or [`allocate_pages_at`](Self::allocate_pages_at). `addr` and `pages`
    /// must match the allocation exactly.
    ///
    /// # Errors
    /// [`RangeError::NotAllocated`], [`RangeError::AlreadyFree`] or
    /// [`RangeError::SizeMismatch`] if they do not.
    pub fn free_pages(&self, addr: VirtualAddress, pages: u64) -> Result<(), RangeError> {
        self.release(addr, pages, RegionState::Used)
    }

    /// Like [`allocate_pages_at`](Self::allocate_pages_at), but marks the
    /// range reserved.
    ///
    /// # Errors
    /// As for [`allocate_pages_at`](Self::allocate_pages_at).
    pub fn reserve_pages(&self, addr: VirtualAddress, pages: u64) -> Result<(), RangeError> {
        self.claim(addr, pages, RegionState::Reserved)
    }

    /// Return a reserved range to the free pool.
    ///
    /// # Errors
    /// As for [`free_pages`](Self::free_pages), with
    /// [`RangeError::NotReserved`] in place of `NotAllocated`.
    pub fn unreserve_pages(&self, addr: VirtualAddress, pages: u64) -> Result<(), RangeError> {
        self.release(addr, pages, RegionState::Reserved)
    }

    /// # Errors
    /// [`RangeError::Poisoned`] if the lock is poisoned.
    pub fn stats(&self) -> Result<RangeStats, RangeError> {
        Ok(self.state.with_lock(|st| RangeStats {
            total: st.free + st.used + st.reserved,
            free: st.free,
            used: st.used,
            reserved: st.reserved,
            regions: st.regions.len(),
            buckets: st.buckets.len(),
        })?)
    }

    /// Visit every region as `(start, pages, state)` in address order.
    ///
    /// # Errors
    /// [`RangeError::Poisoned`] if the lock is poisoned.
    pub fn for_each_region(
        &self,
        mut f: impl FnMut(VirtualAddress, u64, RegionState),
    ) -> Result<(), RangeError> {
        self.state.with_lock(|st| {
            st.regions.for_each(|start, r| {
                f(VirtualAddress::new(start), r.meta.pages(), r.meta.state());
            });
        })?;
        Ok(())
    }

    /// Visit every bucket member as `(bucket_pages, start)`, smallest bucket
    /// first and in list order within a bucket.
    ///
    /// # Errors
    /// [`RangeError::Poisoned`] if the lock is poisoned.
    pub fn for_each_free_bucket(
        &self,
        mut f: impl FnMut(u64, VirtualAddress),
    ) -> Result<(), RangeError> {
        self.state.with_lock(|st| {
            for (pages, list) in st.buckets.iter() {
                for &start in st.members.iter(list) {
                    f(pages, VirtualAddress::new(start));
                }
            }
        })?;
        Ok(())
    }

    /// Snapshot of all regions.
    ///
    /// # Errors
    /// [`RangeError::Poisoned`] if the lock is poisoned.
    pub fn regions(
        &self,
    ) -> Result<alloc::vec::Vec<(VirtualAddress, u64, RegionState)>, RangeError> {
        let mut out = alloc::vec::Vec::new();
        self.for_each_region(|start, pages, state| out.push((start, pages, state)))?;
        Ok(out)
    }

    /// Snapshot of the free-size index as `(pages, starts)`.
    ///
    /// # Errors
    /// [`RangeError::Poisoned`] if the lock is poisoned.
    pub fn free_buckets(
        &self,
    ) -> Result<alloc::vec::Vec<(u64, alloc::vec::Vec<VirtualAddress>)>, RangeError> {
        let mut out: alloc::vec::Vec<(u64, alloc::vec::Vec<VirtualAddress>)> =
            alloc::vec::Vec::new();
        self.for_each_free_bucket(|pages, start| match out.last_mut() {
            Some((p, starts)) if *p == pages => starts.push(start),
            _ => out.push((pages, alloc::vec![start])),
        })?;
        Ok(out)
    }

    /// Cross-check both indexes and the counters.
    ///
    /// # Errors
    /// [`RangeError::Corrupted`] naming the first violated invariant.
    pub fn verify(&self) -> Result<(), RangeError> {
        self.state.with_lock(|st| st.verify())?
    }

    fn claim(
        &self,
        addr: VirtualAddress,
        pages: u64,
        state: RegionState,
    ) -> Result<(), RangeError> {
        let (start, end) = page_range(addr, pages)?;
        self.state.with_lock(|st| {
            st.check_window(start, end)?;
            st.reserve_nodes(2)?;

            let id = st.regions.find_or_lower(start).ok_or(RangeError::NotFree(addr))?;
            let (rstart, region) = st
                .regions
                .entry(id)
                .ok_or(RangeError::Corrupted("region handle"))?;
            let rend = rstart + region.meta.pages() * PAGE_SIZE;
            if !region.meta.free() || end > rend {
                warn!("range allocator: {pages} pages at {addr} are not free");
                return Err(RangeError::NotFree(addr));
            }

            st.detach_free(rstart)?;
            let left = (start - rstart) / PAGE_SIZE;
            let right = (rend - end) / PAGE_SIZE;
            let claimed = Region {
                meta: RegionMeta::of(pages, state),
                bucket_link: None,
            };
            if left > 0 {
                st.make_free(rstart, left)?;
                st.regions.insert(start, claimed)?;
            } else {
                let r = st
                    .regions
                    .value_mut(id)
                    .ok_or(RangeError::Corrupted("region handle"))?;
                *r = claimed;
            }
            if right > 0 {
                st.make_free(end, right)?;
            }
            if left > 0 || right > 0 {
                debug!(
                    "range allocator: split free region at {rstart:#x} \
                     ({left} left, {right} right)"
                );
            }

            st.free -= pages;
            match state {
                RegionState::Reserved => st.reserved += pages,
                _ => st.used += pages,
            }
            trace!("range allocator: claimed {pages} pages at {addr} as {state:?}");
            st.after_mutation();
            Ok(())
        })?
    }

    fn release(
        &self,
        addr: VirtualAddress,
        pages: u64,
        expected: RegionState,
    ) -> Result<(), RangeError> {
        let (start, end) = page_range(addr, pages)?;
        let missing = match expected {
            RegionState::Reserved => RangeError::NotReserved(addr),
            _ => RangeError::NotAllocated(addr),
        };
        self.state.with_lock(|st| {
            // Merging only ever drops region records.
            st.buckets.reserve(1)?;
            st.members.reserve(1)?;
            let Some(id) = st.regions.find(start) else {
                warn!("range allocator: release of {addr}: {missing}");
                return Err(missing);
            };
            let region = *st
                .regions
                .value(id)
                .ok_or(RangeError::Corrupted("region handle"))?;
            match region.meta.state() {
                RegionState::Free => {
                    warn!("range allocator: {addr} is already free");
                    return Err(RangeError::AlreadyFree(addr));
                }
                s if s != expected => {
                    warn!("range allocator: release of {addr}: {missing}");
                    return Err(missing);
                }
                _ => {}
            }
            if region.meta.pages() != pages {
                warn!(
                    "range allocator: release of {pages} pages at {addr}, region holds {}",
                    region.meta.pages()
                );
                return Err(RangeError::SizeMismatch {
                    actual: region.meta.pages(),
                    requested: pages,
                });
            }

            let mut merged_start = start;
            let mut merged_pages = pages;
            if let Some(pred) = st.regions.predecessor(id)
                && let Some((pstart, p)) = st.regions.entry(pred)
                && p.meta.free()
                && pstart + p.meta.pages() * PAGE_SIZE == start
            {
                let ppages = st.detach_free(pstart)?;
                st.regions.remove_node(id)?;
                merged_start = pstart;
                merged_pages += ppages;
                debug!("range allocator: merged {start:#x} into predecessor {pstart:#x}");
            }
            if st.regions.get_by_key(end).is_some_and(|s| s.meta.free()) {
                let spages = st.detach_free(end)?;
                st.regions.remove(end);
                merged_pages += spages;
                debug!("range allocator: merged successor {end:#x} into {merged_start:#x}");
            }
            st.make_free(merged_start, merged_pages)?;

            match expected {
                RegionState::Reserved => st.reserved -= pages,
                _ => st.used -= pages,
            }
            st.free += pages;
            trace!("range allocator: released {pages} pages at {addr}");
            st.after_mutation();
            Ok(())
        })?
    }
}

impl RangeState {
    /// Make sure `k` more records fit in each structure.
    fn reserve_nodes(&mut self, k: usize) -> Result<(), RangeError> {
        self.regions.reserve(k)?;
        self.buckets.reserve(k)?;
        self.members.reserve(k)?;
        Ok(())
    }

    fn check_window(&self, start: u64, end: u64) -> Result<(), RangeError> {
        match self.window {
            Some((ws, we)) if ws <= start && end <= we => Ok(()),
            _ => Err(RangeError::OutOfRange),
        }
    }

    /// Mark the region at `start` free with `pages` pages, creating the
    /// record if needed, and add it to its bucket.
    fn make_free(&mut self, start: u64, pages: u64) -> Result<(), RangeError> {
        let link = match self.buckets.get_by_key_mut(pages) {
            Some(list) => self.members.push_back(list, start)?,
            None => {
                let mut list = List::new();
                let link = self.members.push_back(&mut list, start)?;
                self.buckets.insert(pages, list)?;
                link
            }
        };
        let region = Region {
            meta: RegionMeta::of(pages, RegionState::Free),
            bucket_link: Some(link),
        };
        match self.regions.get_by_key_mut(start) {
            Some(r) => *r = region,
            None => {
                self.regions.insert(start, region)?;
            }
        }
        Ok(())
    }

    /// Take the free region at `start` out of its bucket. The region record
    /// stays; the caller rewrites or removes it. Returns its page count.
    fn detach_free(&mut self, start: u64) -> Result<u64, RangeError> {
        let region = self
            .regions
            .get_by_key_mut(start)
            .ok_or(RangeError::Corrupted("free region missing"))?;
        let pages = region.meta.pages();
        let link = region
            .bucket_link
            .take()
            .ok_or(RangeError::Corrupted("free region not in a bucket"))?;
        let bucket = self
            .buckets
            .find(pages)
            .ok_or(RangeError::Corrupted("free region without bucket"))?;
        let list = self
            .buckets
            .value_mut(bucket)
            .ok_or(RangeError::Corrupted("bucket handle"))?;
        self.members
            .remove(list, link)
            .ok_or(RangeError::Corrupted("stale bucket link"))?;
        if list.is_empty() {
            self.buckets.remove_node(bucket)?;
        }
        Ok(pages)
    }

    fn verify(&self) -> Result<(), RangeError> {
        self.regions.verify()?;
        self.buckets.verify()?;
        let Some((ws, we)) = self.window else {
            return if self.regions.is_empty() {
                Ok(())
            } else {
                Err(RangeError::Corrupted("regions without a window"))
            };
        };

        let (mut free, mut used, mut reserved) = (0u64, 0u64, 0u64);
        let mut free_regions = 0usize;
        let mut cursor = ws;
        let mut prev_free = false;
        for (start, r) in self.regions.iter() {
            if start != cursor {
                return Err(RangeError::Corrupted("regions do not tile the window"));
            }
            let pages = r.meta.pages();
            if pages == 0 {
                return Err(RangeError::Corrupted("empty region"));
            }
            match r.meta.state() {
                RegionState::Free => {
                    if prev_free {
                        return Err(RangeError::Corrupted("adjacent free regions"));
                    }
                    let link = r
                        .bucket_link
                        .ok_or(RangeError::Corrupted("free region not in a bucket"))?;
                    if self.members.get(link) != Some(&start) {
                        return Err(RangeError::Corrupted("bucket link points elsewhere"));
                    }
                    free += pages;
                    free_regions += 1;
                }
                RegionState::Used => used += pages,
                RegionState::Reserved => reserved += pages,
            }
            if r.meta.state() != RegionState::Free && r.bucket_link.is_some() {
                return Err(RangeError::Corrupted("allocated region in a bucket"));
            }
            if r.meta.free() && r.meta.reserved() {
                return Err(RangeError::Corrupted("region both free and reserved"));
            }
            prev_free = r.meta.free();
            cursor = start + pages * PAGE_SIZE;
        }
        if cursor != we {
            return Err(RangeError::Corrupted("regions do not tile the window"));
        }

        let mut members = 0usize;
        for (pages, list) in self.buckets.iter() {
            if list.is_empty() {
                return Err(RangeError::Corrupted("empty bucket"));
            }
            for &start in self.members.iter(list) {
                match self.regions.get_by_key(start) {
                    Some(r) if r.meta.free() && r.meta.pages() == pages => members += 1,
                    _ => {
                        return Err(RangeError::Corrupted(
                            "bucket member is not a matching free region",
                        ));
                    }
                }
            }
        }
        if members != free_regions || members != self.members.live() {
            return Err(RangeError::Corrupted("bucket membership disagrees with regions"));
        }
        if (free, used, reserved) != (self.free, self.used, self.reserved) {
            return Err(RangeError::Corrupted("page counters disagree with regions"));
        }
        if free + used + reserved != (we - ws) / PAGE_SIZE {
            return Err(RangeError::Corrupted("page counters do not cover the window"));
        }
        Ok(())
    }

    fn after_mutation(&self) {
        if cfg!(feature = "self-check")
            && let Err(e) = self.verify()
        {
            log::error!("range allocator self-check failed: {e}");
        }
    }
}

fn page_range(addr: VirtualAddress, pages: u64) -> Result<(u64, u64), RangeError> {
    if pages == 0 {
        return Err(RangeError::ZeroPages);
    }
    if !addr.is_page_aligned() {
        return Err(RangeError::Unaligned);
    }
    let end = addr.checked_add_pages(pages).ok_or(RangeError::OutOfRange)?;
    Ok((addr.as_u64(), end.as_u64()))
}
