//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The allocators everything else in the kernel allocates from. None of them
//! relies on a general-purpose heap for its own bookkeeping beyond fallible
//! node arenas.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Virtual Memory Manager ([`vmm`])           │
//! │    • map table: virtual range → memory object       │
//! │    • demand paging through the fault handler        │
//! │    • protection checks at map, remap, fault time    │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │                              │
//! ┌──────────▼───────────────┐  ┌───────────▼───────────┐
//! │ Range Allocator          │  │ Memory Objects        │
//! │ ([`range_alloc`])        │  │ ([`memory_object`])   │
//! │ • regions by address     │  │ • page lists          │
//! │ • free regions by size   │  │ • pluggable pager     │
//! └──────────────────────────┘  └───────────┬───────────┘
//!                                           │
//! ┌─────────────────────────────────────────▼───────────┐
//! │         Physical Frame Allocator ([`frame_alloc`])  │
//! │    • address-ordered free runs, stored in-frame     │
//! │    • reached through a [`PhysMapper`]               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The architecture layer plugs in below the VMM through [`PageMapper`]
//! (page tables) and above it by calling [`Vmm::handle_page_fault`] from the
//! `#PF` handler with a decoded [`FaultCode`].
//!
//! ## Bring-Up
//!
//! [`MemoryBootstrap`] runs the init sequence: physical frames first, then the
//! VMM window. The result is a [`MemoryContext`] that is passed to whoever
//! needs memory; there are no global allocator instances.
//!
//! ```rust,ignore
//! let ctx = unsafe { MemoryBootstrap::physical(HhdmPhysMapper, boot_memory_map) }?
//!     .reserve_frames(kernel_image_base, kernel_image_frames)?
//!     .virtual_memory(VmmConfig::kernel_default(), page_tables)?;
//!
//! let stack = ctx.vmm.allocate_pages(16, Protection::READ_WRITE, false)?;
//! ```
//!
//! ## Locking
//!
//! Every allocator guards its state with a [`kernel_sync::SpinLock`]. A panic
//! while a lock is held poisons it; later calls fail with a `Poisoned` error
//! instead of working on half-updated state.
//!
//! ## Features
//!
//! - `self-check`: re-verify allocator invariants after every mutation and
//!   log violations at `error` level.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;
#[cfg(test)]
extern crate self as kernel_alloc;

pub mod bootstrap;
pub mod fault;
pub mod frame_alloc;
pub mod memory_object;
pub mod page_mapper;
pub mod pager;
pub mod phys_mapper;
pub mod protection;
pub mod range_alloc;
pub mod vmm;

#[cfg(test)]
mod test_support;

pub use bootstrap::{BootstrapError, MemoryBootstrap, MemoryContext, PhysicalStage};
pub use fault::FaultCode;
pub use frame_alloc::{FrameAllocError, FrameAllocator, FrameStats, MAX_REGIONS};
pub use memory_object::{MemoryObject, Page};
pub use page_mapper::{PageMapper, PageMapperError};
pub use pager::{FramePager, Pager};
pub use phys_mapper::{HhdmPhysMapper, OffsetPhysMapper, PhysMapper};
pub use protection::{CachePolicy, Protection};
pub use range_alloc::{RangeAllocator, RangeError, RangeStats, RegionState};
pub use vmm::{MappingInfo, Vmm, VmmConfig, VmmError, VmmStats};
