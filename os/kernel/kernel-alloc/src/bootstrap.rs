//! # Memory Bring-Up
//!
//! Physical memory has to be managed before virtual memory, and both before
//! anything maps pages on demand. The stages are separate types so the order
//! is checked by the compiler:
//!
//! ```text
//! MemoryBootstrap::physical(..)  ──►  PhysicalStage  ──virtual_memory(..)──►  MemoryContext
//!   ingest boot memory map            reserve ranges                          frames + vmm
//! ```
//!
//! The resulting [`MemoryContext`] is handed to whoever needs allocation;
//! nothing here is global.

use crate::frame_alloc::{FrameAllocError, FrameAllocator, FrameStats};
use crate::page_mapper::PageMapper;
use crate::pager::{FramePager, Pager};
use crate::phys_mapper::PhysMapper;
use crate::vmm::{Vmm, VmmConfig, VmmError};
use alloc::sync::Arc;
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::PhysicalAddress;
use log::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootstrapError {
    #[error("boot memory map has no usable memory")]
    NoUsableMemory,
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
}

/// Entry point of the init sequence.
pub struct MemoryBootstrap;

impl MemoryBootstrap {
    /// Bring up the physical frame allocator from the boot memory map.
    ///
    /// # Safety
    /// Every usable entry must be free for the allocator to take, and
    /// reachable through `mapper`.
    ///
    /// # Errors
    /// [`BootstrapError::NoUsableMemory`] if not a single frame is usable.
    pub unsafe fn physical<M: PhysMapper>(
        mapper: M,
        memory_map: impl IntoIterator<Item = MemoryMapEntry>,
    ) -> Result<PhysicalStage<M>, BootstrapError> {
        let frames = FrameAllocator::new(mapper);
        let stats = unsafe { frames.init(memory_map)? };
        if stats.total == 0 {
            return Err(BootstrapError::NoUsableMemory);
        }
        info!(
            "physical memory: {} frames in {} runs",
            stats.total, stats.runs
        );
        Ok(PhysicalStage {
            frames: Arc::new(frames),
        })
    }
}

/// Frames are managed; virtual memory is not up yet.
pub struct PhysicalStage<M: PhysMapper> {
    frames: Arc<FrameAllocator<M>>,
}

impl<M: PhysMapper + Send + Sync + 'static> PhysicalStage<M> {
    #[must_use]
    pub const fn frames(&self) -> &Arc<FrameAllocator<M>> {
        &self.frames
    }

    /// Keep frames that are in use already (kernel image, boot structures)
    /// away from the allocator.
    ///
    /// # Errors
    /// [`FrameAllocError::NotFree`] if the range is not free.
    pub fn reserve_frames(self, base: PhysicalAddress, count: u64) -> Result<Self, BootstrapError> {
        self.frames.reserve_range(base, count)?;
        Ok(self)
    }

    /// # Errors
    /// [`FrameAllocError::Poisoned`] if the allocator lock is poisoned.
    pub fn stats(&self) -> Result<FrameStats, BootstrapError> {
        Ok(self.frames.stats()?)
    }

    /// Bring up the VMM over `config`'s window, backed by the frame
    /// allocator through a [`FramePager`].
    ///
    /// # Errors
    /// [`BootstrapError::Vmm`] for a malformed window.
    pub fn virtual_memory<P: PageMapper>(
        self,
        config: VmmConfig,
        page_mapper: P,
    ) -> Result<MemoryContext<M, P>, BootstrapError> {
        let pager: Arc<dyn Pager> = Arc::new(FramePager::new(Arc::clone(&self.frames)));
        let vmm = Vmm::new(config, page_mapper, pager)?;
        info!(
            "virtual memory: window {}..{}",
            config.window_start, config.window_end
        );
        Ok(MemoryContext {
            frames: self.frames,
            vmm,
        })
    }
}

/// The fully initialized memory subsystem.
pub struct MemoryContext<M: PhysMapper, P: PageMapper> {
    pub frames: Arc<FrameAllocator<M>>,
    pub vmm: Vmm<P>,
}
