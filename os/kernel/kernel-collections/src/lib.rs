//! # Allocator-substrate collections
//!
//! Containers for code that sits *underneath* the general-purpose heap:
//!
//! * [`OrderedIndex`]: an AVL tree keyed by `u64`, with exact,
//!   find-or-higher and find-or-lower lookups plus predecessor/successor
//!   stepping. Used for the range allocator's two indexes and the VMM's map
//!   table.
//! * [`ListPool`] / [`List`]: doubly-linked lists with O(1) push/pop at both
//!   ends and O(1) removal by handle. Used for the free-size buckets.
//!
//! Both store their nodes in an arena and link them by index ([`NodeId`],
//! [`ListNodeId`]) instead of by pointer. Node storage only grows through
//! `Vec::try_reserve`, and an optional node limit turns exhaustion into
//! [`IndexError::OutOfNodes`] instead of an abort.
//!
//! Neither container locks. Owners wrap them in a
//! `kernel_sync::SpinLock` and hold it across find-then-mutate sequences.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
pub mod list;
pub mod ordered_index;

pub use error::IndexError;
pub use list::{List, ListNodeId, ListPool};
pub use ordered_index::{NodeId, OrderedIndex};
