//! # Linked Lists over a Node Pool
//!
//! A [`ListPool<T>`] owns the nodes of any number of lists; each [`List`] is a
//! small `Copy` header (head, tail, length) that can be stored inline in some
//! other structure, e.g. as the value of an [`OrderedIndex`](crate::OrderedIndex)
//! bucket. Every operation takes the header and the pool together.
//!
//! ```rust
//! use kernel_collections::{List, ListPool};
//!
//! let mut pool = ListPool::new();
//! let mut list = List::new();
//! pool.push_back(&mut list, 1).unwrap();
//! let two = pool.push_back(&mut list, 2).unwrap();
//! pool.push_front(&mut list, 0).unwrap();
//!
//! assert_eq!(pool.remove(&mut list, two), Some(2));
//! assert_eq!(pool.iter(&list).copied().collect::<Vec<_>>(), [0, 1]);
//! ```

use crate::IndexError;
use alloc::vec::Vec;
use core::ops::ControlFlow;

/// Handle to a live node of a [`ListPool`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListNodeId(u32);

impl ListNodeId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Header of one list whose nodes live in a [`ListPool`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct List {
    head: Option<ListNodeId>,
    tail: Option<ListNodeId>,
    len: usize,
}

impl List {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn front(&self) -> Option<ListNodeId> {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn back(&self) -> Option<ListNodeId> {
        self.tail
    }
}

struct ListNode<T> {
    value: T,
    prev: Option<ListNodeId>,
    next: Option<ListNodeId>,
}

enum Slot<T> {
    Occupied(ListNode<T>),
    Vacant { next_free: Option<ListNodeId> },
}

/// Node storage shared by any number of [`List`]s.
pub struct ListPool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<ListNodeId>,
    live: usize,
    limit: usize,
}

impl<T> Default for ListPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListPool<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(u32::MAX as usize)
    }

    /// A pool holding at most `limit` live nodes across all its lists.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            limit,
        }
    }

    /// Make sure the next `additional` pushes cannot fail for lack of nodes.
    ///
    /// # Errors
    /// [`IndexError::OutOfNodes`] if the limit or the heap would be exceeded.
    pub fn reserve(&mut self, additional: usize) -> Result<(), IndexError> {
        let wanted = self.live.checked_add(additional).ok_or(IndexError::OutOfNodes)?;
        if wanted > self.limit || wanted > u32::MAX as usize {
            return Err(IndexError::OutOfNodes);
        }
        let vacant = self.slots.len() - self.live;
        self.slots
            .try_reserve(additional.saturating_sub(vacant))
            .map_err(|_| IndexError::OutOfNodes)
    }

    /// Live nodes across all lists.
    #[inline]
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: ListNodeId) -> Option<&T> {
        self.node(id).map(|n| &n.value)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ListNodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(n)) => Some(&mut n.value),
            _ => None,
        }
    }

    #[must_use]
    pub fn next(&self, id: ListNodeId) -> Option<ListNodeId> {
        self.node(id).and_then(|n| n.next)
    }

    #[must_use]
    pub fn prev(&self, id: ListNodeId) -> Option<ListNodeId> {
        self.node(id).and_then(|n| n.prev)
    }

    /// # Errors
    /// [`IndexError::OutOfNodes`] if the pool cannot hold another node.
    pub fn push_front(&mut self, list: &mut List, value: T) -> Result<ListNodeId, IndexError> {
        let id = self.alloc(ListNode {
            value,
            prev: None,
            next: list.head,
        })?;
        match list.head {
            Some(h) => self.link_mut(h).prev = Some(id),
            None => list.tail = Some(id),
        }
        list.head = Some(id);
        list.len += 1;
        Ok(id)
    }

    /// # Errors
    /// [`IndexError::OutOfNodes`] if the pool cannot hold another node.
    pub fn push_back(&mut self, list: &mut List, value: T) -> Result<ListNodeId, IndexError> {
        let id = self.alloc(ListNode {
            value,
            prev: list.tail,
            next: None,
        })?;
        match list.tail {
            Some(t) => self.link_mut(t).next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
        Ok(id)
    }

    pub fn pop_front(&mut self, list: &mut List) -> Option<T> {
        let id = list.head?;
        self.remove(list, id)
    }

    pub fn pop_back(&mut self, list: &mut List) -> Option<T> {
        let id = list.tail?;
        self.remove(list, id)
    }

    /// Unlink `id` from `list` and return its value.
    ///
    /// Returns `None` if `id` is stale or its links do not agree with
    /// `list`'s head/tail (i.e. it belongs to another list).
    pub fn remove(&mut self, list: &mut List, id: ListNodeId) -> Option<T> {
        let (prev, next) = {
            let n = self.node(id)?;
            (n.prev, n.next)
        };
        if (prev.is_none() && list.head != Some(id)) || (next.is_none() && list.tail != Some(id))
        {
            return None;
        }

        match prev {
            Some(p) => self.link_mut(p).next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.link_mut(n).prev = prev,
            None => list.tail = prev,
        }
        list.len -= 1;
        Some(self.release(id))
    }

    /// Forward iterator over the values of `list`.
    #[must_use]
    pub fn iter<'a>(&'a self, list: &List) -> Iter<'a, T> {
        Iter {
            pool: self,
            next: list.head,
            forward: true,
        }
    }

    /// Backward iterator over the values of `list`.
    #[must_use]
    pub fn iter_rev<'a>(&'a self, list: &List) -> Iter<'a, T> {
        Iter {
            pool: self,
            next: list.tail,
            forward: false,
        }
    }

    /// Visit `list` front to back until `f` breaks.
    pub fn for_each_until<B>(
        &self,
        list: &List,
        mut f: impl FnMut(ListNodeId, &T) -> ControlFlow<B>,
    ) -> Option<B> {
        let mut cur = list.head;
        while let Some(id) = cur {
            let n = self.node(id)?;
            if let ControlFlow::Break(b) = f(id, &n.value) {
                return Some(b);
            }
            cur = n.next;
        }
        None
    }

    /// Visit `list` back to front until `f` breaks.
    pub fn for_each_rev_until<B>(
        &self,
        list: &List,
        mut f: impl FnMut(ListNodeId, &T) -> ControlFlow<B>,
    ) -> Option<B> {
        let mut cur = list.tail;
        while let Some(id) = cur {
            let n = self.node(id)?;
            if let ControlFlow::Break(b) = f(id, &n.value) {
                return Some(b);
            }
            cur = n.prev;
        }
        None
    }

    #[inline]
    fn node(&self, id: ListNodeId) -> Option<&ListNode<T>> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    #[inline]
    fn link_mut(&mut self, id: ListNodeId) -> &mut ListNode<T> {
        match &mut self.slots[id.index()] {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("vacant slot linked into a list"),
        }
    }

    fn alloc(&mut self, node: ListNode<T>) -> Result<ListNodeId, IndexError> {
        if self.live >= self.limit {
            return Err(IndexError::OutOfNodes);
        }
        let id = if let Some(id) = self.free_head {
            let slot = &mut self.slots[id.index()];
            let Slot::Vacant { next_free } = *slot else {
                unreachable!("occupied slot on the free list");
            };
            self.free_head = next_free;
            *slot = Slot::Occupied(node);
            id
        } else {
            let raw = u32::try_from(self.slots.len()).map_err(|_| IndexError::OutOfNodes)?;
            self.slots
                .try_reserve(1)
                .map_err(|_| IndexError::OutOfNodes)?;
            self.slots.push(Slot::Occupied(node));
            ListNodeId(raw)
        };
        self.live += 1;
        Ok(id)
    }

    fn release(&mut self, id: ListNodeId) -> T {
        let vacant = Slot::Vacant {
            next_free: self.free_head,
        };
        self.free_head = Some(id);
        self.live -= 1;
        match core::mem::replace(&mut self.slots[id.index()], vacant) {
            Slot::Occupied(n) => n.value,
            Slot::Vacant { .. } => unreachable!("released a vacant slot"),
        }
    }
}

/// Iterator returned by [`ListPool::iter`] and [`ListPool::iter_rev`].
pub struct Iter<'a, T> {
    pool: &'a ListPool<T>,
    next: Option<ListNodeId>,
    forward: bool,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.pool.node(self.next?)?;
        self.next = if self.forward { n.next } else { n.prev };
        Some(&n.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(pool: &ListPool<u64>, list: &List) -> Vec<u64> {
        pool.iter(list).copied().collect()
    }

    #[test]
    fn push_pop_both_ends() {
        let mut pool = ListPool::new();
        let mut l = List::new();
        pool.push_back(&mut l, 2).unwrap();
        pool.push_front(&mut l, 1).unwrap();
        pool.push_back(&mut l, 3).unwrap();
        assert_eq!(collect(&pool, &l), [1, 2, 3]);
        assert_eq!(pool.iter_rev(&l).copied().collect::<Vec<_>>(), [3, 2, 1]);

        assert_eq!(pool.pop_front(&mut l), Some(1));
        assert_eq!(pool.pop_back(&mut l), Some(3));
        assert_eq!(pool.pop_back(&mut l), Some(2));
        assert_eq!(pool.pop_back(&mut l), None);
        assert!(l.is_empty());
        assert_eq!(l, List::new());
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn remove_middle_and_ends() {
        let mut pool = ListPool::new();
        let mut l = List::new();
        let ids: Vec<_> = (0..5u64).map(|v| pool.push_back(&mut l, v).unwrap()).collect();
        assert_eq!(pool.remove(&mut l, ids[2]), Some(2));
        assert_eq!(pool.remove(&mut l, ids[0]), Some(0));
        assert_eq!(pool.remove(&mut l, ids[4]), Some(4));
        assert_eq!(collect(&pool, &l), [1, 3]);
        assert_eq!(l.len(), 2);
        // stale handle
        assert_eq!(pool.remove(&mut l, ids[2]), None);
    }

    #[test]
    fn remove_rejects_node_of_another_list() {
        let mut pool = ListPool::new();
        let mut a = List::new();
        let mut b = List::new();
        let in_a = pool.push_back(&mut a, 1).unwrap();
        pool.push_back(&mut b, 2).unwrap();
        assert_eq!(pool.remove(&mut b, in_a), None);
        assert_eq!(collect(&pool, &a), [1]);
        assert_eq!(collect(&pool, &b), [2]);
    }

    #[test]
    fn lists_share_a_pool_and_reuse_slots() {
        let mut pool = ListPool::with_limit(3);
        let mut a = List::new();
        let mut b = List::new();
        pool.push_back(&mut a, 10).unwrap();
        pool.push_back(&mut b, 20).unwrap();
        pool.push_back(&mut a, 11).unwrap();
        assert_eq!(pool.push_back(&mut b, 21), Err(IndexError::OutOfNodes));
        pool.pop_front(&mut a);
        pool.push_back(&mut b, 21).unwrap();
        assert_eq!(collect(&pool, &a), [11]);
        assert_eq!(collect(&pool, &b), [20, 21]);
        assert_eq!(pool.slots.len(), 3);
    }

    #[test]
    fn reserve_guarantees_following_pushes() {
        let mut pool = ListPool::with_limit(2);
        let mut l = List::new();
        pool.reserve(2).unwrap();
        assert_eq!(pool.reserve(3), Err(IndexError::OutOfNodes));
        pool.push_back(&mut l, 1u8).unwrap();
        pool.push_back(&mut l, 2u8).unwrap();
        assert_eq!(pool.reserve(1), Err(IndexError::OutOfNodes));
        pool.pop_back(&mut l);
        pool.reserve(1).unwrap();
    }

    #[test]
    fn enumeration_with_early_exit() {
        let mut pool = ListPool::new();
        let mut l = List::new();
        for v in 1..=5u64 {
            pool.push_back(&mut l, v).unwrap();
        }
        let found = pool.for_each_until(&l, |_, v| {
            if *v % 2 == 0 {
                ControlFlow::Break(*v)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(found, Some(2));
        let found_rev = pool.for_each_rev_until(&l, |_, v| {
            if *v % 2 == 0 {
                ControlFlow::Break(*v)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(found_rev, Some(4));
        assert_eq!(pool.for_each_until(&l, |_, _| ControlFlow::<()>::Continue(())), None);
    }
}
