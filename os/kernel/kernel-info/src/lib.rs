//! # Kernel Configuration and Boot Interface
//!
//! Shared layout constants and the boot-time memory map contract consumed by
//! the memory subsystem.
//!
//! ## Boot Information ([`boot`])
//! The bootloader hands the kernel an ordered sequence of
//! [`MemoryMapEntry`](boot::MemoryMapEntry) records. Only entries tagged
//! [`MemoryRegionKind::Usable`](boot::MemoryRegionKind::Usable) seed the
//! physical frame allocator; everything else is left alone.
//!
//! ## Memory Layout ([`memory`])
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_ALLOC_BASE     ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Demand-paged kernel allocations│
//! KERNEL_ALLOC_END      ├─────────────────────────────────┤ 0xffff_e000_0000_0000
//!                       │           (unused)              │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All layout constants are `const` and cross-checked by compile-time
//! assertions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
