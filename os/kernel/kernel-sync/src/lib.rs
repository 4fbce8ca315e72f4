//! # Kernel synchronization primitives
//!
//! The memory subsystem runs from thread context and from the page-fault
//! handler alike, so every shared structure sits behind a busy-wait
//! [`SpinLock`]. The lock is not re-entrant and does not track its owner.
//!
//! Unlike a bare spin lock, [`SpinLock`] **poisons** itself when a critical
//! section unwinds. Later acquirers receive a [`PoisonError`] instead of a view
//! into data that may have been left half-updated.

#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{PoisonError, SpinLock, SpinLockGuard};
