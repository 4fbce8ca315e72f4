//! Shared fixtures: host memory posing as physical RAM and in-memory page tables.

#![allow(dead_code)]

#[path = "../../src/test_support.rs"]
mod test_support;

pub use test_support::{HostRam, RecordingMapper};

use kernel_alloc::{FrameAllocator, FramePager, OffsetPhysMapper, Pager, Vmm, VmmConfig};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use std::sync::Arc;

pub const PHYS_BASE: u64 = 0x10_0000;
pub const WINDOW_BASE: u64 = 0xffff_c000_0000_0000;

/// A VMM over `window_pages` pages backed by `frames` host frames.
/// Fields drop top to bottom, so the RAM outlives everything using it.
pub struct Machine {
    pub vmm: Vmm<RecordingMapper>,
    pub frames: Arc<FrameAllocator<OffsetPhysMapper>>,
    pub ram: HostRam,
}

impl Machine {
    pub fn new(frames: usize, window_pages: u64) -> Self {
        let ram = HostRam::new(PHYS_BASE, frames);
        let alloc = Arc::new(FrameAllocator::new(ram.mapper()));
        unsafe { alloc.init([ram.usable()]) }.unwrap();
        let pager: Arc<dyn Pager> = Arc::new(FramePager::new(Arc::clone(&alloc)));
        let config = VmmConfig::new(
            VirtualAddress::new(WINDOW_BASE),
            VirtualAddress::new(WINDOW_BASE + window_pages * PAGE_SIZE),
        );
        let vmm = Vmm::new(config, RecordingMapper::default(), pager).unwrap();
        Self {
            vmm,
            frames: alloc,
            ram,
        }
    }

    pub fn pager(&self) -> Arc<dyn Pager> {
        Arc::new(FramePager::new(Arc::clone(&self.frames)))
    }

    pub fn used_frames(&self) -> u64 {
        self.frames.stats().unwrap().used
    }
}
