//! Backing-store capability for memory objects.

use crate::frame_alloc::{FrameAllocError, FrameAllocator};
use crate::phys_mapper::PhysMapper;
use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Supplies and reclaims physical frames on behalf of a memory object.
pub trait Pager: Send + Sync {
    /// A fresh, zeroed frame.
    ///
    /// # Errors
    /// Whatever the backing store reports; usually out of memory.
    fn allocate_page(&self) -> Result<PhysicalAddress, FrameAllocError>;

    /// Give `frame` back.
    ///
    /// # Errors
    /// If the frame was not handed out by this pager.
    fn free_page(&self, frame: PhysicalAddress) -> Result<(), FrameAllocError>;
}

/// The default pager: forwards to the physical frame allocator.
pub struct FramePager<M: PhysMapper> {
    frames: Arc<FrameAllocator<M>>,
}

impl<M: PhysMapper> FramePager<M> {
    pub const fn new(frames: Arc<FrameAllocator<M>>) -> Self {
        Self { frames }
    }
}

impl<M: PhysMapper + Send + Sync> Pager for FramePager<M> {
    fn allocate_page(&self) -> Result<PhysicalAddress, FrameAllocError> {
        let frame = self.frames.allocate_page()?;
        // The run header of a free frame must not leak into a fresh page.
        unsafe {
            self.frames
                .mapper()
                .phys_to_ptr::<u8>(frame)
                .write_bytes(0, PAGE_SIZE as usize);
        }
        Ok(frame)
    }

    fn free_page(&self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.frames.free_page(frame)
    }
}
