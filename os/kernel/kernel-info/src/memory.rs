//! # Memory Layout

pub use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// First address of the window the kernel VMM hands out (inclusive).
pub const KERNEL_ALLOC_BASE: u64 = 0xffff_c000_0000_0000;

/// End of the kernel VMM window (exclusive).
pub const KERNEL_ALLOC_END: u64 = 0xffff_e000_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image sits in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

const _: () = {
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(KERNEL_ALLOC_BASE > HHDM_BASE);
    assert!(KERNEL_ALLOC_END > KERNEL_ALLOC_BASE);
    assert!(KERNEL_BASE > KERNEL_ALLOC_END);
    assert!(KERNEL_ALLOC_BASE % PAGE_SIZE == 0);
    assert!(KERNEL_ALLOC_END % PAGE_SIZE == 0);
};
