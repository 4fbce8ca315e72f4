//! # Memory Objects
//!
//! A memory object describes the backing of one logical allocation,
//! independent of where (or how often) it is mapped. It owns one [`Page`] per
//! page of its size. A page starts **unbound** and becomes bound the first
//! time something needs it (eager allocation or a page fault); it stays bound
//! until the object releases its frames.
//!
//! Frames are obtained from and returned to the object's [`Pager`]. They only
//! go back while no mapping of the object exists; the mapping count changes
//! under the page lock, so a frame is never freed while a page-table entry
//! can still point at it.

use crate::pager::Pager;
use crate::protection::Protection;
use crate::vmm::VmmError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::SpinLock;
use log::{trace, warn};

/// One page of a memory object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Page {
    /// Backing frame, `None` while unbound.
    pub phys: Option<PhysicalAddress>,
    /// Most permissive protection any mapping of this page may request.
    pub max_protection: Protection,
    /// Must stay resident.
    pub wired: bool,
}

pub struct MemoryObject {
    page_count: u64,
    pages: SpinLock<Vec<Page>>,
    pager: Arc<dyn Pager>,
    mappings: AtomicUsize,
}

impl MemoryObject {
    /// An object of `page_count` unbound pages, each capped at `max_protection`.
    ///
    /// # Errors
    /// - [`VmmError::EmptyObject`] for zero pages.
    /// - [`VmmError::OutOfMemory`] if the page list cannot be allocated.
    pub fn new(
        page_count: u64,
        max_protection: Protection,
        pager: Arc<dyn Pager>,
    ) -> Result<Self, VmmError> {
        if page_count == 0 {
            return Err(VmmError::EmptyObject);
        }
        let len = usize::try_from(page_count).map_err(|_| VmmError::OutOfMemory)?;
        let mut pages = Vec::new();
        pages.try_reserve_exact(len).map_err(|_| VmmError::OutOfMemory)?;
        pages.resize(
            len,
            Page {
                phys: None,
                max_protection,
                wired: false,
            },
        );
        Ok(Self {
            page_count,
            pages: SpinLock::new(pages),
            pager,
            mappings: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub fn pager(&self) -> &Arc<dyn Pager> {
        &self.pager
    }

    /// Number of virtual ranges this object is currently mapped at.
    #[inline]
    #[must_use]
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    /// Snapshot of page `index`.
    ///
    /// # Errors
    /// [`VmmError::PageOutOfBounds`] past the end of the object.
    pub fn page(&self, index: u64) -> Result<Page, VmmError> {
        self.with_pages(|pages| page_at(pages, index).copied())?
    }

    /// Narrow (or widen) what mappings of page `index` may request.
    /// Existing mappings are not revisited.
    ///
    /// # Errors
    /// [`VmmError::PageOutOfBounds`] past the end of the object.
    pub fn set_max_protection(&self, index: u64, protection: Protection) -> Result<(), VmmError> {
        self.with_pages(|pages| {
            page_at_mut(pages, index)?.max_protection = protection;
            Ok(())
        })?
    }

    /// # Errors
    /// [`VmmError::PageOutOfBounds`] past the end of the object.
    pub fn set_wired(&self, index: u64, wired: bool) -> Result<(), VmmError> {
        self.with_pages(|pages| {
            page_at_mut(pages, index)?.wired = wired;
            Ok(())
        })?
    }

    /// Bind every unbound page to a fresh frame and mark every page wired if
    /// `wired` is set.
    ///
    /// On failure the pages bound so far stay bound; they are released with
    /// the object.
    ///
    /// # Errors
    /// [`VmmError::Frames`] when the pager runs dry.
    pub fn bind_all(&self, wired: bool) -> Result<(), VmmError> {
        self.with_pages(|pages| {
            for page in pages.iter_mut() {
                if page.phys.is_none() {
                    page.phys = Some(self.pager.allocate_page()?);
                }
                page.wired |= wired;
            }
            Ok(())
        })?
    }

    /// Pages currently backed by a frame.
    ///
    /// # Errors
    /// [`VmmError::Poisoned`] if the page list lock is poisoned.
    pub fn bound_pages(&self) -> Result<u64, VmmError> {
        self.with_pages(|pages| pages.iter().filter(|p| p.phys.is_some()).count() as u64)
    }

    /// Return every bound frame to the pager. Returns how many were released.
    ///
    /// # Errors
    /// - [`VmmError::ObjectShared`] while the object is mapped anywhere;
    ///   nothing is released.
    /// - The first pager error; the remaining frames are still released.
    pub(crate) fn release_frames(&self) -> Result<u64, VmmError> {
        self.with_pages(|pages| {
            let mappings = self.mappings();
            if mappings > 0 {
                return Err(VmmError::ObjectShared { mappings });
            }
            release_all(&*self.pager, pages)
        })?
    }

    pub(crate) fn with_pages<R>(&self, f: impl FnOnce(&mut [Page]) -> R) -> Result<R, VmmError> {
        Ok(self.pages.with_lock(|pages| f(pages.as_mut_slice()))?)
    }

    /// Count one more mapping. Callers hold the page lock, inside
    /// [`with_pages`](Self::with_pages).
    pub(crate) fn add_mapping(&self) -> usize {
        self.mappings.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one mapping after `unmap` has taken its page-table entries down.
    /// Returns the number of mappings left.
    ///
    /// The count drops even if the page lock is poisoned and `unmap` could
    /// not run.
    pub(crate) fn detach(&self, unmap: impl FnOnce(&[Page])) -> Result<usize, VmmError> {
        let detached = self.pages.with_lock(|pages| {
            unmap(pages);
            self.remove_mapping()
        });
        detached.map_err(|e| {
            self.remove_mapping();
            e.into()
        })
    }

    fn remove_mapping(&self) -> usize {
        self.mappings.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        if let Err(e) = release_all(&*self.pager, self.pages.get_mut()) {
            warn!("memory object: releasing frames on drop failed: {e}");
        }
    }
}

/// Check `request` against the capability of every page.
pub(crate) fn check_protection(pages: &[Page], request: Protection) -> Result<(), VmmError> {
    match pages
        .iter()
        .position(|p| !p.max_protection.permits(request))
    {
        None => Ok(()),
        Some(index) => Err(VmmError::ProtectionViolation {
            requested: request,
            page: index as u64,
        }),
    }
}

fn release_all(pager: &dyn Pager, pages: &mut [Page]) -> Result<u64, VmmError> {
    let mut released = 0;
    let mut first_error = None;
    for page in pages.iter_mut() {
        let Some(frame) = page.phys.take() else {
            continue;
        };
        match pager.free_page(frame) {
            Ok(()) => released += 1,
            Err(e) => {
                warn!("memory object: pager refused frame {frame}: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    trace!("memory object: released {released} frames");
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(released),
    }
}

fn page_at(pages: &[Page], index: u64) -> Result<&Page, VmmError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| pages.get(i))
        .ok_or(VmmError::PageOutOfBounds(index))
}

fn page_at_mut(pages: &mut [Page], index: u64) -> Result<&mut Page, VmmError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| pages.get_mut(i))
        .ok_or(VmmError::PageOutOfBounds(index))
}
