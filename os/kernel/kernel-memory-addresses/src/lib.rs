//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the allocators.
//!
//! ## Overview
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] | Refers to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] | Refers to physical memory (frames handed out by the frame allocator). |
//!
//! Both are `#[repr(transparent)]` around a `u64` and share the same page
//! helpers. The allocators only ever deal in **4 KiB** base pages; callers
//! pass page counts, never byte counts.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.align_down().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert!(!va.is_page_aligned());
//!
//! let pa = PhysicalAddress::new(0x10_0000);
//! assert_eq!(pa.checked_add_pages(2), Some(PhysicalAddress::new(0x10_2000)));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page (and of a physical frame) in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Number of bytes covered by `pages` pages, or `None` on overflow.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(PAGE_SIZE)
}

/// Number of pages needed to hold `bytes` bytes (rounded up).
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Whether `value` sits on a page boundary.
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}
