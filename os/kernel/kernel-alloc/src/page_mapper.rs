//! Page-table contract consumed by the VMM.
//!
//! The architecture layer implements [`PageMapper`] on top of its page-table
//! walker. The VMM is the only caller and only ever passes page-aligned
//! addresses it has already validated.

use crate::protection::{CachePolicy, Protection};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageMapperError {
    #[error("page is already mapped")]
    AlreadyMapped,
    #[error("page is not mapped")]
    NotMapped,
    /// A page-table frame could not be allocated.
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error("unsupported protection or cache policy")]
    Unsupported,
}

pub trait PageMapper: Send + Sync {
    /// Install `va → pa`.
    ///
    /// # Errors
    /// [`PageMapperError::AlreadyMapped`] if `va` already has a translation.
    fn map_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError>;

    /// Remove the translation of `va`.
    ///
    /// # Errors
    /// [`PageMapperError::NotMapped`] if there is none.
    fn unmap_page(&self, va: VirtualAddress) -> Result<(), PageMapperError>;

    /// Rewrite the protection and cache bits of an existing translation.
    ///
    /// # Errors
    /// [`PageMapperError::NotMapped`] if there is none.
    fn remap_page(
        &self,
        va: VirtualAddress,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError>;

    /// Flush stale translations for `count` pages at `va`.
    fn invalidate_pages(&self, va: VirtualAddress, count: u64);

    /// Map `count` physically contiguous pages. Stops at the first failure;
    /// pages mapped before it stay mapped.
    ///
    /// # Errors
    /// See [`map_page`](Self::map_page).
    fn map_pages(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError> {
        for i in 0..count {
            let offset = i * PAGE_SIZE;
            self.map_page(va + offset, pa + offset, protection, cache)?;
        }
        Ok(())
    }

    /// # Errors
    /// See [`unmap_page`](Self::unmap_page).
    fn unmap_pages(&self, va: VirtualAddress, count: u64) -> Result<(), PageMapperError> {
        for i in 0..count {
            self.unmap_page(va + i * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// # Errors
    /// See [`remap_page`](Self::remap_page).
    fn remap_pages(
        &self,
        va: VirtualAddress,
        count: u64,
        protection: Protection,
        cache: CachePolicy,
    ) -> Result<(), PageMapperError> {
        for i in 0..count {
            self.remap_page(va + i * PAGE_SIZE, protection, cache)?;
        }
        Ok(())
    }
}
