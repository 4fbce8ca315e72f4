//! Generated allocate/free sequences checked against the allocators'
//! invariants after every step.

mod common;

use common::{HostRam, PHYS_BASE};
use kernel_alloc::{FrameAllocError, FrameAllocator, RangeAllocator, RangeError};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use proptest::prelude::*;
use proptest::sample::Index;

const WINDOW: u64 = 0x4000_0000;
const FRAMES: u64 = 64;
const WINDOW_PAGES: u64 = 256;

fn window(pages: u64) -> RangeAllocator {
    let ranges = RangeAllocator::new();
    ranges
        .init(
            VirtualAddress::new(WINDOW),
            VirtualAddress::new(WINDOW + pages * PAGE_SIZE),
        )
        .unwrap();
    ranges
}

#[derive(Clone, Debug)]
enum FrameOp {
    Allocate(u64),
    /// Free one of the live allocations.
    Free(Index),
}

fn frame_ops() -> impl Strategy<Value = Vec<FrameOp>> {
    let op = prop_oneof![
        2 => (1..=4u64).prop_map(FrameOp::Allocate),
        1 => any::<Index>().prop_map(FrameOp::Free),
    ];
    prop::collection::vec(op, 1..300)
}

#[derive(Clone, Debug)]
enum RangeOp {
    Allocate(u64),
    Reserve { page: u64, pages: u64 },
    Free(Index),
    Unreserve(Index),
}

fn range_ops() -> impl Strategy<Value = Vec<RangeOp>> {
    let op = prop_oneof![
        2 => (1..=8u64).prop_map(RangeOp::Allocate),
        1 => (0..WINDOW_PAGES - 4, 1..=4u64)
            .prop_map(|(page, pages)| RangeOp::Reserve { page, pages }),
        2 => any::<Index>().prop_map(RangeOp::Free),
        1 => any::<Index>().prop_map(RangeOp::Unreserve),
    ];
    prop::collection::vec(op, 1..400)
}

proptest! {
    #[test]
    fn frame_conservation_under_random_traffic(ops in frame_ops()) {
        let ram = HostRam::new(PHYS_BASE, FRAMES as usize);
        let frames = FrameAllocator::new(ram.mapper());
        unsafe { frames.init([ram.usable()]) }.unwrap();

        let mut live: Vec<(PhysicalAddress, u64)> = Vec::new();
        for op in ops {
            match op {
                FrameOp::Allocate(count) => match frames.allocate_pages(count) {
                    Ok(pa) => live.push((pa, count)),
                    Err(FrameAllocError::OutOfMemory { requested }) => {
                        prop_assert_eq!(requested, count);
                    }
                    Err(e) => prop_assert!(false, "unexpected {}", e),
                },
                FrameOp::Free(i) if !live.is_empty() => {
                    let (pa, count) = live.swap_remove(i.index(live.len()));
                    prop_assert_eq!(frames.free_pages(pa, count), Ok(()));
                }
                FrameOp::Free(_) => {}
            }
            prop_assert_eq!(frames.verify(), Ok(()));
            let stats = frames.stats().unwrap();
            prop_assert_eq!(stats.free + stats.used, FRAMES);
            prop_assert_eq!(stats.used, live.iter().map(|l| l.1).sum::<u64>());
        }

        for (pa, count) in live.drain(..) {
            prop_assert_eq!(frames.free_pages(pa, count), Ok(()));
        }
        let mut runs = Vec::new();
        frames.for_each_run(|a, p| runs.push((a, p))).unwrap();
        prop_assert_eq!(runs, vec![(PhysicalAddress::new(PHYS_BASE), FRAMES)]);
    }

    #[test]
    fn allocate_then_free_restores_the_buckets(
        fragments in prop::collection::vec(1..=3u64, 4..16),
        stride in 2..4usize,
        pages in 1..=6u64,
    ) {
        let ranges = window(64);
        // Fragment the window first so several buckets exist.
        let keep: Vec<_> = fragments
            .iter()
            .map(|&p| (ranges.allocate_pages(p).unwrap(), p))
            .collect();
        for (addr, p) in keep.iter().step_by(stride) {
            ranges.free_pages(*addr, *p).unwrap();
        }

        let before = ranges.free_buckets().unwrap();
        let addr = ranges.allocate_pages(pages).unwrap();
        ranges.free_pages(addr, pages).unwrap();
        prop_assert_eq!(ranges.free_buckets().unwrap(), before);
    }

    #[test]
    fn range_invariants_under_random_traffic(ops in range_ops()) {
        let ranges = window(WINDOW_PAGES);
        let mut used: Vec<(VirtualAddress, u64)> = Vec::new();
        let mut reserved: Vec<(VirtualAddress, u64)> = Vec::new();

        for op in ops {
            match op {
                RangeOp::Allocate(pages) => match ranges.allocate_pages(pages) {
                    Ok(addr) => used.push((addr, pages)),
                    Err(RangeError::OutOfSpace { .. }) => {}
                    Err(e) => prop_assert!(false, "unexpected {}", e),
                },
                RangeOp::Reserve { page, pages } => {
                    let addr = VirtualAddress::new(WINDOW + page * PAGE_SIZE);
                    match ranges.reserve_pages(addr, pages) {
                        Ok(()) => reserved.push((addr, pages)),
                        Err(RangeError::NotFree(_)) => {}
                        Err(e) => prop_assert!(false, "unexpected {}", e),
                    }
                }
                RangeOp::Free(i) if !used.is_empty() => {
                    let (addr, pages) = used.swap_remove(i.index(used.len()));
                    prop_assert_eq!(ranges.free_pages(addr, pages), Ok(()));
                    prop_assert!(ranges.free_pages(addr, pages).is_err());
                }
                RangeOp::Unreserve(i) if !reserved.is_empty() => {
                    let (addr, pages) = reserved.swap_remove(i.index(reserved.len()));
                    prop_assert_eq!(ranges.unreserve_pages(addr, pages), Ok(()));
                }
                RangeOp::Free(_) | RangeOp::Unreserve(_) => {}
            }

            prop_assert_eq!(ranges.verify(), Ok(()));
            let stats = ranges.stats().unwrap();
            prop_assert_eq!(stats.free + stats.used + stats.reserved, WINDOW_PAGES);
            prop_assert_eq!(stats.used, used.iter().map(|u| u.1).sum::<u64>());
            prop_assert_eq!(stats.reserved, reserved.iter().map(|u| u.1).sum::<u64>());

            // An emptied bucket would still be counted here.
            prop_assert_eq!(stats.buckets, ranges.free_buckets().unwrap().len());
        }
    }
}

#[test]
fn fixed_allocation_fragment_counts() {
    let at = |page: u64| VirtualAddress::new(WINDOW + page * PAGE_SIZE);

    // Strictly inside: left and right fragments.
    let r = window(8);
    r.allocate_pages_at(at(3), 2).unwrap();
    assert_eq!(r.free_buckets().unwrap(), [(3, vec![at(0), at(5)])]);

    // Flush left: only a right fragment.
    let r = window(8);
    r.allocate_pages_at(at(0), 2).unwrap();
    assert_eq!(r.free_buckets().unwrap(), [(6, vec![at(2)])]);

    // Flush right: only a left fragment.
    let r = window(8);
    r.allocate_pages_at(at(6), 2).unwrap();
    assert_eq!(r.free_buckets().unwrap(), [(6, vec![at(0)])]);

    // Exact: nothing left over.
    let r = window(8);
    r.allocate_pages_at(at(0), 8).unwrap();
    assert!(r.free_buckets().unwrap().is_empty());
    assert_eq!(r.stats().unwrap().regions, 1);
}
