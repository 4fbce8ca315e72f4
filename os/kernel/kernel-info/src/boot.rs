//! # Kernel Boot Information
//!
//! The boot memory map as the memory subsystem consumes it. The loader
//! converts whatever its firmware reports (UEFI descriptors, Limine entries)
//! into this neutral form.

use kernel_memory_addresses::PhysicalAddress;

/// Classification of a boot memory map entry.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 0,
    /// Firmware or hardware reserved; never touched.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Loader data still in use (page tables, boot info).
    BootloaderReclaimable = 5,
    /// The kernel image and its modules.
    KernelAndModules = 6,
    /// Framebuffer memory.
    Framebuffer = 7,
}

/// One `{base, length, type}` record of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical start address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    /// The whole pages fully contained in this entry as `(first, count)`.
    ///
    /// The start is rounded up and the end rounded down, so a partial page at
    /// either edge is never reported. Returns `None` if no whole page fits.
    #[must_use]
    pub fn page_span(&self) -> Option<(PhysicalAddress, u64)> {
        let end = PhysicalAddress::new(self.base.checked_add(self.length)?).align_down();
        let start = PhysicalAddress::new(self.base).align_up()?;
        let pages = start.pages_until(end)?;
        (pages > 0).then_some((start, pages))
    }
}
