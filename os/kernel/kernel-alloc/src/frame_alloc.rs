//! # Physical Frame Allocator
//!
//! Owns every physical frame the boot memory map reports as usable.
//!
//! Free frames are tracked as a singly linked list of **runs**. Each run's
//! header is stored in the first frame of the run itself:
//!
//! ```text
//!   head
//!    │    ┌──────────────┬─────────────┐      ┌──────────────┬──────┐
//!    └──► │ FreeRun{3,●} │  2 frames   │ ───► │ FreeRun{1,∅} │      │
//!         └──────────────┴─────────────┘      └──────────────┴──────┘
//!         0x0010_0000                          0x0020_0000
//! ```
//!
//! ## Invariants
//! - Runs are sorted by address and never adjacent; a free that touches a
//!   neighbour merges with it.
//! - The sum of all run lengths equals the free-page counter.
//! - `free + used == total`.
//! - Frame `0` is never managed, since a physical address of `0` means
//!   "not backed" elsewhere in the memory subsystem.
//! - Only frames inside a range handed over by [`FrameAllocator::init`] or
//!   [`FrameAllocator::add_region`] are ever written to. Frees outside those
//!   ranges are refused before any run header is touched.
//!
//! Allocation is first-fit from the front of a run; the remainder of a split
//! run keeps its place in the list. Freeing walks the list to the insertion
//! point, so its cost is linear in the number of runs, not in pages.

use crate::phys_mapper::PhysMapper;
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::{PoisonError, SpinLock};
use log::{debug, trace, warn};

/// Header written into the first frame of every free run.
#[repr(C)]
#[derive(Copy, Clone)]
struct FreeRun {
    /// Length of the run in frames (including the header frame).
    pages: u64,
    /// Physical address of the next run, `0` for none.
    next: u64,
}

/// Upper bound on disjoint physical ranges the allocator can manage.
/// Touching ranges are coalesced and take up one slot.
pub const MAX_REGIONS: usize = 64;

/// Bookkeeping guarded by the allocator's lock. The runs themselves live in
/// physical memory.
struct FreeList {
    head: Option<PhysicalAddress>,
    total: u64,
    free: u64,
    runs: u64,
    regions: Regions,
}

/// Managed physical ranges as sorted, coalesced `[start, end)` byte spans.
/// Kept off the heap: the frame allocator comes up before anything else.
struct Regions {
    spans: [(u64, u64); MAX_REGIONS],
    len: usize,
}

impl Regions {
    const fn new() -> Self {
        Self {
            spans: [(0, 0); MAX_REGIONS],
            len: 0,
        }
    }

    fn as_slice(&self) -> &[(u64, u64)] {
        &self.spans[..self.len]
    }

    /// Whether `[start, end)` lies inside a single managed span.
    fn contains(&self, start: u64, end: u64) -> bool {
        self.as_slice().iter().any(|&(s, e)| s <= start && end <= e)
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.as_slice().iter().any(|&(s, e)| start < e && s < end)
    }

    fn pages(&self) -> u64 {
        self.as_slice().iter().map(|&(s, e)| (e - s) / PAGE_SIZE).sum()
    }

    /// Record `[start, end)`, which must not overlap a managed span.
    fn insert(&mut self, start: u64, end: u64) -> Result<(), FrameAllocError> {
        let at = self.as_slice().partition_point(|&(s, _)| s < start);
        let joins_prev = at > 0 && self.spans[at - 1].1 == start;
        let joins_next = at < self.len && self.spans[at].0 == end;
        match (joins_prev, joins_next) {
            (true, true) => {
                self.spans[at - 1].1 = self.spans[at].1;
                self.spans.copy_within(at + 1..self.len, at);
                self.len -= 1;
            }
            (true, false) => self.spans[at - 1].1 = end,
            (false, true) => self.spans[at].0 = start,
            (false, false) => {
                if self.len == MAX_REGIONS {
                    return Err(FrameAllocError::TooManyRegions);
                }
                self.spans.copy_within(at..self.len, at + 1);
                self.spans[at] = (start, end);
                self.len += 1;
            }
        }
        Ok(())
    }
}

/// Counters reported by [`FrameAllocator::stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub runs: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory ({requested} frames requested)")]
    OutOfMemory { requested: u64 },
    #[error("physical address is not page aligned")]
    Unaligned,
    #[error("zero-length frame range")]
    ZeroPages,
    #[error("frame 0 cannot be managed")]
    NullFrame,
    /// The range overlaps frames that are already free.
    #[error("frames at {0} are already free")]
    DoubleFree(PhysicalAddress),
    /// The range is not entirely contained in one free run.
    #[error("frames at {0} are not free")]
    NotFree(PhysicalAddress),
    /// The range reaches outside the memory handed to the allocator.
    #[error("frames at {0} are not managed by this allocator")]
    NotManaged(PhysicalAddress),
    /// The range was already handed to the allocator.
    #[error("frames at {0} are already managed")]
    AlreadyManaged(PhysicalAddress),
    #[error("too many disjoint physical regions (at most {MAX_REGIONS})")]
    TooManyRegions,
    #[error("frame allocator corrupted: {0}")]
    Corrupted(&'static str),
    #[error(transparent)]
    Poisoned(#[from] PoisonError),
}

/// Free-list-of-runs physical frame allocator.
pub struct FrameAllocator<M: PhysMapper> {
    mapper: M,
    list: SpinLock<FreeList>,
}

impl<M: PhysMapper> FrameAllocator<M> {
    /// An allocator that owns no frames yet.
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            list: SpinLock::new(FreeList {
                head: None,
                total: 0,
                free: 0,
                runs: 0,
                regions: Regions::new(),
            }),
        }
    }

    /// The mapper used to reach run headers; pagers reuse it to zero frames.
    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Ingest the **usable** entries of a boot memory map.
    ///
    /// Entries are trimmed to whole pages, frame `0` is skipped, and
    /// neighbouring entries merge into single runs. Order does not matter.
    ///
    /// # Safety
    /// Every usable frame must be unused by anything else and reachable
    /// through the mapper.
    ///
    /// # Errors
    /// - [`FrameAllocError::AlreadyManaged`] if two usable entries overlap.
    /// - [`FrameAllocError::TooManyRegions`] for a map with more than
    ///   [`MAX_REGIONS`] disjoint usable ranges.
    pub unsafe fn init(
        &self,
        memory_map: impl IntoIterator<Item = MemoryMapEntry>,
    ) -> Result<FrameStats, FrameAllocError> {
        for entry in memory_map.into_iter().filter(MemoryMapEntry::is_usable) {
            let Some((mut base, mut pages)) = entry.page_span() else {
                continue;
            };
            if base.is_null() {
                base = PhysicalAddress::new(PAGE_SIZE);
                pages -= 1;
                if pages == 0 {
                    continue;
                }
            }
            unsafe { self.add_region(base, pages)? };
        }
        let stats = self.stats()?;
        debug!(
            "frame allocator: {} frames in {} runs ({} MiB)",
            stats.total,
            stats.runs,
            stats.total * PAGE_SIZE / (1024 * 1024)
        );
        Ok(stats)
    }

    /// Hand `pages` frames starting at `base` to the allocator.
    ///
    /// # Safety
    /// Same as [`init`](Self::init), for this range.
    ///
    /// # Errors
    /// - [`FrameAllocError::Unaligned`], [`FrameAllocError::ZeroPages`],
    ///   [`FrameAllocError::NullFrame`] for malformed input.
    /// - [`FrameAllocError::AlreadyManaged`] if any frame in the range is
    ///   managed already.
    /// - [`FrameAllocError::TooManyRegions`] if the range would need another
    ///   slot and all are taken.
    pub unsafe fn add_region(
        &self,
        base: PhysicalAddress,
        pages: u64,
    ) -> Result<(), FrameAllocError> {
        check_range(base, pages)?;
        let end = base
            .checked_add_pages(pages)
            .ok_or(FrameAllocError::Unaligned)?;
        self.list.with_lock(|list| {
            if list.regions.overlaps(base.as_u64(), end.as_u64()) {
                warn!("frame allocator: {pages} frames at {base} are already managed");
                return Err(FrameAllocError::AlreadyManaged(base));
            }
            list.regions.insert(base.as_u64(), end.as_u64())?;
            // Free runs only exist inside managed spans, so this cannot
            // overlap one.
            unsafe { self.insert_locked(list, base, pages) }?;
            list.total += pages;
            trace!("frame allocator: added {pages} frames at {base}");
            self.after_mutation(list);
            Ok(())
        })?
    }

    /// Allocate a single frame.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no frame is free.
    #[inline]
    pub fn allocate_page(&self) -> Result<PhysicalAddress, FrameAllocError> {
        self.allocate_pages(1)
    }

    /// Allocate `count` physically contiguous frames (first fit).
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] if no run holds `count` frames.
    pub fn allocate_pages(&self, count: u64) -> Result<PhysicalAddress, FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::ZeroPages);
        }
        self.list.with_lock(|list| {
            let mut prev: Option<PhysicalAddress> = None;
            let mut cur = list.head;
            while let Some(addr) = cur {
                let run = unsafe { self.read_run(addr) };
                if run.pages >= count {
                    let next = if run.pages == count {
                        list.runs -= 1;
                        next_of(run)
                    } else {
                        let rest = addr
                            .checked_add_pages(count)
                            .ok_or(FrameAllocError::Corrupted("run exceeds address space"))?;
                        unsafe {
                            self.write_run(
                                rest,
                                FreeRun {
                                    pages: run.pages - count,
                                    next: run.next,
                                },
                            );
                        }
                        Some(rest)
                    };
                    unsafe { self.link(list, prev, next) };
                    list.free -= count;
                    trace!("frame allocator: allocated {count} frames at {addr}");
                    self.after_mutation(list);
                    return Ok(addr);
                }
                prev = cur;
                cur = next_of(run);
            }
            warn!(
                "frame allocator: out of memory ({count} frames requested, {} free)",
                list.free
            );
            Err(FrameAllocError::OutOfMemory { requested: count })
        })?
    }

    /// Return a single frame.
    ///
    /// # Errors
    /// See [`free_pages`](Self::free_pages).
    #[inline]
    pub fn free_page(&self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.free_pages(frame, 1)
    }

    /// Return `count` frames starting at `base`, merging with neighbouring runs.
    ///
    /// # Errors
    /// - [`FrameAllocError::Unaligned`], [`FrameAllocError::ZeroPages`],
    ///   [`FrameAllocError::NullFrame`] for malformed input.
    /// - [`FrameAllocError::NotManaged`] if the range reaches outside the
    ///   memory this allocator was given.
    /// - [`FrameAllocError::DoubleFree`] if any frame in the range is already free.
    pub fn free_pages(&self, base: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        check_range(base, count)?;
        let end = base
            .checked_add_pages(count)
            .ok_or(FrameAllocError::NotManaged(base))?;
        self.list.with_lock(|list| {
            if !list.regions.contains(base.as_u64(), end.as_u64()) {
                warn!("frame allocator: refusing to free {count} unmanaged frames at {base}");
                return Err(FrameAllocError::NotManaged(base));
            }
            if list.free.saturating_add(count) > list.total {
                return Err(FrameAllocError::DoubleFree(base));
            }
            // Safety: the range lies in a managed span, so it is reachable
            // through the mapper; overlap is rejected before writing.
            unsafe { self.insert_locked(list, base, count) }?;
            trace!("frame allocator: freed {count} frames at {base}");
            self.after_mutation(list);
            Ok(())
        })?
    }

    /// Take `count` free frames at `base` out of circulation (e.g. the kernel
    /// image). They count as used afterwards.
    ///
    /// # Errors
    /// [`FrameAllocError::NotFree`] unless the whole range lies in one free run.
    pub fn reserve_range(&self, base: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
        check_range(base, count)?;
        let end = base
            .checked_add_pages(count)
            .ok_or(FrameAllocError::NotFree(base))?;
        self.list.with_lock(|list| {
            let mut prev: Option<PhysicalAddress> = None;
            let mut cur = list.head;
            while let Some(addr) = cur {
                let run = unsafe { self.read_run(addr) };
                let run_end = run_end(addr, run)?;
                if addr <= base && end <= run_end {
                    let left = addr.pages_until(base).unwrap_or(0);
                    let right = end.pages_until(run_end).unwrap_or(0);
                    let mut next = next_of(run);
                    if right > 0 {
                        unsafe { self.write_run(end, FreeRun { pages: right, next: raw(next) }) };
                        next = Some(end);
                    }
                    if left > 0 {
                        unsafe { self.write_run(addr, FreeRun { pages: left, next: raw(next) }) };
                    } else {
                        unsafe { self.link(list, prev, next) };
                    }
                    list.runs = list.runs + u64::from(left > 0) + u64::from(right > 0) - 1;
                    list.free -= count;
                    debug!("frame allocator: reserved {count} frames at {base}");
                    self.after_mutation(list);
                    return Ok(());
                }
                if addr >= end {
                    break;
                }
                prev = cur;
                cur = next_of(run);
            }
            Err(FrameAllocError::NotFree(base))
        })?
    }

    /// # Errors
    /// [`FrameAllocError::Poisoned`] if the lock is poisoned.
    pub fn stats(&self) -> Result<FrameStats, FrameAllocError> {
        Ok(self.list.with_lock(|list| FrameStats {
            total: list.total,
            free: list.free,
            used: list.total - list.free,
            runs: list.runs,
        })?)
    }

    /// Visit every free run as `(start, pages)` in address order.
    ///
    /// # Errors
    /// [`FrameAllocError::Poisoned`] if the lock is poisoned.
    pub fn for_each_run(
        &self,
        mut f: impl FnMut(PhysicalAddress, u64),
    ) -> Result<(), FrameAllocError> {
        self.list.with_lock(|list| {
            let mut cur = list.head;
            while let Some(addr) = cur {
                let run = unsafe { self.read_run(addr) };
                f(addr, run.pages);
                cur = next_of(run);
            }
        })?;
        Ok(())
    }

    /// Check the run list against the counters.
    ///
    /// # Errors
    /// [`FrameAllocError::Corrupted`] naming the first violated invariant.
    pub fn verify(&self) -> Result<(), FrameAllocError> {
        self.list.with_lock(|list| self.verify_locked(list))?
    }

    fn verify_locked(&self, list: &FreeList) -> Result<(), FrameAllocError> {
        let mut sum = 0u64;
        let mut runs = 0u64;
        let mut prev_end: Option<PhysicalAddress> = None;
        let mut cur = list.head;
        while let Some(addr) = cur {
            if !addr.is_page_aligned() || addr.is_null() {
                return Err(FrameAllocError::Corrupted("misaligned run"));
            }
            let run = unsafe { self.read_run(addr) };
            if run.pages == 0 {
                return Err(FrameAllocError::Corrupted("empty run"));
            }
            if let Some(pe) = prev_end {
                if pe == addr {
                    return Err(FrameAllocError::Corrupted("adjacent runs not merged"));
                }
                if pe > addr {
                    return Err(FrameAllocError::Corrupted("runs out of order"));
                }
            }
            sum += run.pages;
            runs += 1;
            prev_end = Some(run_end(addr, run)?);
            cur = next_of(run);
        }
        if sum != list.free {
            return Err(FrameAllocError::Corrupted("free counter disagrees with runs"));
        }
        if runs != list.runs {
            return Err(FrameAllocError::Corrupted("run counter disagrees with runs"));
        }
        if list.free > list.total {
            return Err(FrameAllocError::Corrupted("more free than total frames"));
        }
        if list.regions.pages() != list.total {
            return Err(FrameAllocError::Corrupted("total disagrees with managed ranges"));
        }
        Ok(())
    }

    /// Insert `[base, base + count)` into the sorted run list, merging with
    /// the runs on either side when they touch.
    ///
    /// # Safety
    /// The range must be reachable through the mapper.
    unsafe fn insert_locked(
        &self,
        list: &mut FreeList,
        base: PhysicalAddress,
        count: u64,
    ) -> Result<(), FrameAllocError> {
        check_range(base, count)?;
        let end = base
            .checked_add_pages(count)
            .ok_or(FrameAllocError::Unaligned)?;

        let mut prev: Option<(PhysicalAddress, FreeRun)> = None;
        let mut cur = list.head;
        while let Some(addr) = cur {
            if addr >= base {
                break;
            }
            let run = unsafe { self.read_run(addr) };
            prev = Some((addr, run));
            cur = next_of(run);
        }

        if let Some((p, prun)) = prev
            && run_end(p, prun)? > base
        {
            warn!("frame allocator: {count} frames at {base} overlap free run at {p}");
            return Err(FrameAllocError::DoubleFree(base));
        }
        if let Some(c) = cur
            && c < end
        {
            warn!("frame allocator: {count} frames at {base} overlap free run at {c}");
            return Err(FrameAllocError::DoubleFree(base));
        }

        let merge_prev = match prev {
            Some((p, prun)) => run_end(p, prun)? == base,
            None => false,
        };
        let merge_next = cur == Some(end);

        match (prev, merge_prev, merge_next) {
            (Some((p, prun)), true, true) => {
                let next = unsafe { self.read_run(end) };
                unsafe {
                    self.write_run(
                        p,
                        FreeRun {
                            pages: prun.pages + count + next.pages,
                            next: next.next,
                        },
                    );
                }
                list.runs -= 1;
            }
            (Some((p, prun)), true, false) => unsafe {
                self.write_run(
                    p,
                    FreeRun {
                        pages: prun.pages + count,
                        next: prun.next,
                    },
                );
            },
            (_, _, true) => {
                let next = unsafe { self.read_run(end) };
                unsafe {
                    self.write_run(
                        base,
                        FreeRun {
                            pages: count + next.pages,
                            next: next.next,
                        },
                    );
                    self.link(list, prev.map(|(p, _)| p), Some(base));
                }
            }
            (_, _, false) => {
                unsafe {
                    self.write_run(
                        base,
                        FreeRun {
                            pages: count,
                            next: raw(cur),
                        },
                    );
                    self.link(list, prev.map(|(p, _)| p), Some(base));
                }
                list.runs += 1;
            }
        }
        list.free += count;
        Ok(())
    }

    /// Point `prev`'s next link (or the list head) at `next`.
    unsafe fn link(
        &self,
        list: &mut FreeList,
        prev: Option<PhysicalAddress>,
        next: Option<PhysicalAddress>,
    ) {
        match prev {
            None => list.head = next,
            Some(p) => {
                let run = unsafe { self.read_run(p) };
                unsafe {
                    self.write_run(
                        p,
                        FreeRun {
                            pages: run.pages,
                            next: raw(next),
                        },
                    );
                }
            }
        }
    }

    #[inline]
    unsafe fn read_run(&self, addr: PhysicalAddress) -> FreeRun {
        unsafe { self.mapper.phys_to_ptr::<FreeRun>(addr).read() }
    }

    #[inline]
    unsafe fn write_run(&self, addr: PhysicalAddress, run: FreeRun) {
        unsafe { self.mapper.phys_to_ptr::<FreeRun>(addr).write(run) }
    }

    fn after_mutation(&self, list: &FreeList) {
        if cfg!(feature = "self-check")
            && let Err(e) = self.verify_locked(list)
        {
            log::error!("frame allocator self-check failed: {e}");
        }
    }
}

fn check_range(base: PhysicalAddress, count: u64) -> Result<(), FrameAllocError> {
    if count == 0 {
        return Err(FrameAllocError::ZeroPages);
    }
    if !base.is_page_aligned() {
        return Err(FrameAllocError::Unaligned);
    }
    if base.is_null() {
        return Err(FrameAllocError::NullFrame);
    }
    Ok(())
}

#[inline]
fn next_of(run: FreeRun) -> Option<PhysicalAddress> {
    (run.next != 0).then(|| PhysicalAddress::new(run.next))
}

#[inline]
fn raw(next: Option<PhysicalAddress>) -> u64 {
    next.map_or(0, PhysicalAddress::as_u64)
}

#[inline]
fn run_end(addr: PhysicalAddress, run: FreeRun) -> Result<PhysicalAddress, FrameAllocError> {
    addr.checked_add_pages(run.pages)
        .ok_or(FrameAllocError::Corrupted("run exceeds address space"))
}
