//! # Ordered Index
//!
//! An AVL tree mapping unique `u64` keys to values of type `V`.
//!
//! Nodes live in a slab (`Vec<Slot<V>>`) and refer to each other through
//! [`NodeId`]s. Every node also links to its parent so that
//! [`predecessor`](OrderedIndex::predecessor) and
//! [`successor`](OrderedIndex::successor) run without an explicit stack.
//!
//! Removing a node with two children relinks its in-order successor into the
//! vacated position rather than moving the successor's payload, so a
//! [`NodeId`] stays valid until *its own* node is removed.
//!
//! ```rust
//! use kernel_collections::OrderedIndex;
//!
//! let mut idx = OrderedIndex::new();
//! idx.insert(0x1000, "a").unwrap();
//! idx.insert(0x3000, "b").unwrap();
//!
//! let hi = idx.find_or_higher(0x2000).unwrap();
//! assert_eq!(idx.key(hi), Some(0x3000));
//! let lo = idx.find_or_lower(0x2000).unwrap();
//! assert_eq!(idx.key(lo), Some(0x1000));
//! ```

use crate::IndexError;
use alloc::vec::Vec;
use core::ops::ControlFlow;

/// Handle to a live node of an [`OrderedIndex`].
///
/// A handle is invalidated when its node is removed; the slot may then be
/// reused by a later insert.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

struct Node<V> {
    key: u64,
    value: V,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    height: u8,
}

enum Slot<V> {
    Occupied(Node<V>),
    Vacant { next_free: Option<NodeId> },
}

/// Balanced ordered map keyed by `u64`.
pub struct OrderedIndex<V> {
    slots: Vec<Slot<V>>,
    root: Option<NodeId>,
    free_head: Option<NodeId>,
    len: usize,
    limit: usize,
}

impl<V> Default for OrderedIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedIndex<V> {
    /// An empty index whose node storage may grow until the heap refuses.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(u32::MAX as usize)
    }

    /// An empty index holding at most `limit` live nodes.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            root: None,
            free_head: None,
            len: 0,
            limit,
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

    /// Make sure the next `additional` inserts cannot fail for lack of nodes.
    ///
    /// # Errors
    /// [`IndexError::OutOfNodes`] if the limit or the heap would be exceeded.
    pub fn reserve(&mut self, additional: usize) -> Result<(), IndexError> {
        let wanted = self.len.checked_add(additional).ok_or(IndexError::OutOfNodes)?;
        if wanted > self.limit || wanted > u32::MAX as usize {
            return Err(IndexError::OutOfNodes);
        }
        let vacant = self.slots.len() - self.len;
        self.slots
            .try_reserve(additional.saturating_sub(vacant))
            .map_err(|_| IndexError::OutOfNodes)
    }

    /// Insert `key` → `value`.
    ///
    /// # Errors
    /// * [`IndexError::DuplicateKey`] if `key` is already present; the index is unchanged.
    /// * [`IndexError::OutOfNodes`] if no node can be allocated.
    pub fn insert(&mut self, key: u64, value: V) -> Result<NodeId, IndexError> {
        let mut parent = None;
        let mut cur = self.root;
        let mut go_left = false;
        while let Some(c) = cur {
            let n = self.node(c);
            if key == n.key {
                return Err(IndexError::DuplicateKey(key));
            }
            parent = Some(c);
            go_left = key < n.key;
            cur = if go_left { n.left } else { n.right };
        }

        let id = self.alloc(Node {
            key,
            value,
            parent,
            left: None,
            right: None,
            height: 1,
        })?;

        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.len += 1;
        self.rebalance_from(parent);
        Ok(id)
    }

    /// Exact lookup.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            if key == n.key {
                return Some(c);
            }
            cur = if key < n.key { n.left } else { n.right };
        }
        None
    }

    /// The node with the smallest key `>= key`.
    #[must_use]
    pub fn find_or_higher(&self, key: u64) -> Option<NodeId> {
        let mut best = None;
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            if key == n.key {
                return Some(c);
            }
            if key < n.key {
                best = Some(c);
                cur = n.left;
            } else {
                cur = n.right;
            }
        }
        best
    }

    /// The node with the largest key `<= key`.
    ///
    /// Composed from [`find_or_higher`](Self::find_or_higher): an exact hit is
    /// returned as is, otherwise the predecessor of the next higher node, or
    /// the maximum if nothing is higher.
    #[must_use]
    pub fn find_or_lower(&self, key: u64) -> Option<NodeId> {
        match self.find_or_higher(key) {
            Some(id) if self.node(id).key == key => Some(id),
            Some(id) => self.predecessor(id),
            None => self.last(),
        }
    }

    /// Node with the smallest key.
    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|r| self.leftmost(r))
    }

    /// Node with the largest key.
    #[must_use]
    pub fn last(&self) -> Option<NodeId> {
        self.root.map(|r| self.rightmost(r))
    }

    /// In-order predecessor of `id`.
    #[must_use]
    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        let n = self.get(id)?;
        if let Some(l) = n.left {
            return Some(self.rightmost(l));
        }
        let mut child = id;
        let mut parent = n.parent;
        while let Some(p) = parent {
            let pn = self.node(p);
            if pn.right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = pn.parent;
        }
        None
    }

    /// In-order successor of `id`.
    #[must_use]
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let n = self.get(id)?;
        if let Some(r) = n.right {
            return Some(self.leftmost(r));
        }
        let mut child = id;
        let mut parent = n.parent;
        while let Some(p) = parent {
            let pn = self.node(p);
            if pn.left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = pn.parent;
        }
        None
    }

    #[inline]
    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<u64> {
        self.get(id).map(|n| n.key)
    }

    #[inline]
    #[must_use]
    pub fn value(&self, id: NodeId) -> Option<&V> {
        self.get(id).map(|n| &n.value)
    }

    #[inline]
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut V> {
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(n)) => Some(&mut n.value),
            _ => None,
        }
    }

    /// Key and value of `id`.
    #[inline]
    #[must_use]
    pub fn entry(&self, id: NodeId) -> Option<(u64, &V)> {
        self.get(id).map(|n| (n.key, &n.value))
    }

    /// Convenience: the value stored under `key`.
    #[must_use]
    pub fn get_by_key(&self, key: u64) -> Option<&V> {
        self.find(key).and_then(|id| self.value(id))
    }

    /// Convenience: the mutable value stored under `key`.
    pub fn get_by_key_mut(&mut self, key: u64) -> Option<&mut V> {
        let id = self.find(key)?;
        self.value_mut(id)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let id = self.find(key)?;
        self.remove_node(id).ok().map(|(_, v)| v)
    }

    /// Remove the node behind `id`, returning its key and value.
    ///
    /// # Errors
    /// [`IndexError::InvalidHandle`] if `id` is not a live node.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(u64, V), IndexError> {
        let (left, right, parent) = {
            let n = self.get(id).ok_or(IndexError::InvalidHandle)?;
            (n.left, n.right, n.parent)
        };

        let rebalance_start = match (left, right) {
            (Some(l), Some(r)) => {
                let succ = self.leftmost(r);
                let start = if succ == r {
                    succ
                } else {
                    // Detach the successor; it has no left child.
                    let sp = self.node(succ).parent;
                    let sr = self.node(succ).right;
                    if let Some(sp) = sp {
                        self.node_mut(sp).left = sr;
                    }
                    if let Some(sr) = sr {
                        self.node_mut(sr).parent = sp;
                    }
                    self.node_mut(succ).right = Some(r);
                    self.node_mut(r).parent = Some(succ);
                    sp.unwrap_or(succ)
                };
                self.node_mut(succ).left = Some(l);
                self.node_mut(l).parent = Some(succ);
                self.node_mut(succ).parent = parent;
                self.replace_child(parent, id, Some(succ));
                Some(start)
            }
            (child, None) | (None, child) => {
                if let Some(c) = child {
                    self.node_mut(c).parent = parent;
                }
                self.replace_child(parent, id, child);
                parent
            }
        };

        let node = self.release(id);
        self.len -= 1;
        self.rebalance_from(rebalance_start);
        Ok((node.key, node.value))
    }

    /// In-order iterator over `(key, &value)`.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            index: self,
            next: self.first(),
        }
    }

    /// Visit every entry in key order.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V)) {
        for (k, v) in self.iter() {
            f(k, v);
        }
    }

    /// Visit entries in key order until `f` breaks; returns the break value.
    pub fn for_each_until<B>(&self, mut f: impl FnMut(u64, &V) -> ControlFlow<B>) -> Option<B> {
        for (k, v) in self.iter() {
            if let ControlFlow::Break(b) = f(k, v) {
                return Some(b);
            }
        }
        None
    }

    /// Check ordering, parent links, heights, the AVL balance bound and the
    /// node count.
    ///
    /// # Errors
    /// [`IndexError::Corrupted`] naming the first violated property.
    pub fn verify(&self) -> Result<(), IndexError> {
        let Some(root) = self.root else {
            return if self.len == 0 {
                Ok(())
            } else {
                Err(IndexError::Corrupted("empty tree with nonzero length"))
            };
        };
        if self.node(root).parent.is_some() {
            return Err(IndexError::Corrupted("root has a parent"));
        }
        let mut count = 0;
        self.verify_subtree(root, None, None, &mut count)?;
        if count != self.len {
            return Err(IndexError::Corrupted("node count mismatch"));
        }
        Ok(())
    }

    fn verify_subtree(
        &self,
        id: NodeId,
        lower: Option<u64>,
        upper: Option<u64>,
        count: &mut usize,
    ) -> Result<u8, IndexError> {
        let n = self.get(id).ok_or(IndexError::Corrupted("link to vacant slot"))?;
        if lower.is_some_and(|lo| n.key <= lo) || upper.is_some_and(|hi| n.key >= hi) {
            return Err(IndexError::Corrupted("keys out of order"));
        }
        *count += 1;
        let mut lh = 0;
        if let Some(l) = n.left {
            if self.get(l).and_then(|c| c.parent) != Some(id) {
                return Err(IndexError::Corrupted("broken parent link"));
            }
            lh = self.verify_subtree(l, lower, Some(n.key), count)?;
        }
        let mut rh = 0;
        if let Some(r) = n.right {
            if self.get(r).and_then(|c| c.parent) != Some(id) {
                return Err(IndexError::Corrupted("broken parent link"));
            }
            rh = self.verify_subtree(r, Some(n.key), upper, count)?;
        }
        if n.height != 1 + lh.max(rh) {
            return Err(IndexError::Corrupted("stale height"));
        }
        if lh.abs_diff(rh) > 1 {
            return Err(IndexError::Corrupted("subtree heights differ by more than one"));
        }
        Ok(n.height)
    }

    #[inline]
    fn get(&self, id: NodeId) -> Option<&Node<V>> {
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node<V> {
        match &self.slots[id.index()] {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("vacant slot linked into the tree"),
        }
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        match &mut self.slots[id.index()] {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("vacant slot linked into the tree"),
        }
    }

    fn alloc(&mut self, node: Node<V>) -> Result<NodeId, IndexError> {
        if self.len >= self.limit {
            return Err(IndexError::OutOfNodes);
        }
        if let Some(id) = self.free_head {
            let slot = &mut self.slots[id.index()];
            let Slot::Vacant { next_free } = *slot else {
                unreachable!("occupied slot on the free list");
            };
            self.free_head = next_free;
            *slot = Slot::Occupied(node);
            return Ok(id);
        }
        let raw = u32::try_from(self.slots.len()).map_err(|_| IndexError::OutOfNodes)?;
        self.slots
            .try_reserve(1)
            .map_err(|_| IndexError::OutOfNodes)?;
        self.slots.push(Slot::Occupied(node));
        Ok(NodeId(raw))
    }

    fn release(&mut self, id: NodeId) -> Node<V> {
        let vacant = Slot::Vacant {
            next_free: self.free_head,
        };
        self.free_head = Some(id);
        match core::mem::replace(&mut self.slots[id.index()], vacant) {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("released a vacant slot"),
        }
    }

    fn leftmost(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.node(id).left {
            id = l;
        }
        id
    }

    fn rightmost(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.node(id).right {
            id = r;
        }
        id
    }

    #[inline]
    fn height(&self, id: Option<NodeId>) -> u8 {
        id.map_or(0, |i| self.node(i).height)
    }

    fn update_height(&mut self, id: NodeId) {
        let n = self.node(id);
        let h = 1 + self.height(n.left).max(self.height(n.right));
        self.node_mut(id).height = h;
    }

    fn balance_factor(&self, id: NodeId) -> i16 {
        let n = self.node(id);
        i16::from(self.height(n.left)) - i16::from(self.height(n.right))
    }

    /// Point `parent`'s link that referenced `old` at `new` (or the root).
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let pn = self.node_mut(p);
                if pn.left == Some(old) {
                    pn.left = new;
                } else {
                    pn.right = new;
                }
            }
        }
    }

    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.node(x).right else {
            unreachable!("left rotation without a right child");
        };
        let t = self.node(y).left;
        let p = self.node(x).parent;

        self.node_mut(x).right = t;
        if let Some(t) = t {
            self.node_mut(t).parent = Some(x);
        }
        self.node_mut(y).parent = p;
        self.replace_child(p, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);

        self.update_height(x);
        self.update_height(y);
        y
    }

    fn rotate_right(&mut self, x: NodeId) -> NodeId {
        let Some(y) = self.node(x).left else {
            unreachable!("right rotation without a left child");
        };
        let t = self.node(y).right;
        let p = self.node(x).parent;

        self.node_mut(x).left = t;
        if let Some(t) = t {
            self.node_mut(t).parent = Some(x);
        }
        self.node_mut(y).parent = p;
        self.replace_child(p, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);

        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Restore heights and the balance bound from `start` up to the root.
    fn rebalance_from(&mut self, start: Option<NodeId>) {
        let mut cur = start;
        while let Some(n) = cur {
            self.update_height(n);
            let bf = self.balance_factor(n);
            let top = if bf > 1 {
                let Some(l) = self.node(n).left else {
                    unreachable!("left-heavy node without a left child");
                };
                if self.balance_factor(l) < 0 {
                    self.rotate_left(l);
                }
                self.rotate_right(n)
            } else if bf < -1 {
                let Some(r) = self.node(n).right else {
                    unreachable!("right-heavy node without a right child");
                };
                if self.balance_factor(r) > 0 {
                    self.rotate_right(r);
                }
                self.rotate_left(n)
            } else {
                n
            };
            cur = self.node(top).parent;
        }
    }
}

/// In-order iterator returned by [`OrderedIndex::iter`].
pub struct Iter<'a, V> {
    index: &'a OrderedIndex<V>,
    next: Option<NodeId>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (u64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.index.successor(id);
        self.index.entry(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys<V>(idx: &OrderedIndex<V>) -> Vec<u64> {
        idx.iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut idx = OrderedIndex::new();
        for k in 0..1000u64 {
            idx.insert(k, k * 2).unwrap();
        }
        idx.verify().unwrap();
        assert_eq!(idx.len(), 1000);
        // AVL height bound for 1000 nodes is < 1.44 * log2(1002) ≈ 14.4
        assert!(idx.height(idx.root) <= 14);
        assert_eq!(keys(&idx), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut idx = OrderedIndex::new();
        idx.insert(7, 'a').unwrap();
        assert_eq!(idx.insert(7, 'b'), Err(IndexError::DuplicateKey(7)));
        assert_eq!(idx.get_by_key(7), Some(&'a'));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn find_or_higher_and_lower() {
        let mut idx = OrderedIndex::new();
        for k in [10u64, 20, 30] {
            idx.insert(k, ()).unwrap();
        }
        let k = |id: Option<NodeId>| id.and_then(|i| idx.key(i));
        assert_eq!(k(idx.find_or_higher(5)), Some(10));
        assert_eq!(k(idx.find_or_higher(20)), Some(20));
        assert_eq!(k(idx.find_or_higher(21)), Some(30));
        assert_eq!(k(idx.find_or_higher(31)), None);

        assert_eq!(k(idx.find_or_lower(5)), None);
        assert_eq!(k(idx.find_or_lower(10)), Some(10));
        assert_eq!(k(idx.find_or_lower(25)), Some(20));
        assert_eq!(k(idx.find_or_lower(1000)), Some(30));
    }

    #[test]
    fn handles_survive_removal_of_other_nodes() {
        let mut idx = OrderedIndex::new();
        let ids: Vec<_> = (0..64u64).map(|k| idx.insert(k, k).unwrap()).collect();
        // Removing an inner node with two children relinks its successor.
        let root_key = idx.key(idx.root.unwrap()).unwrap();
        assert_eq!(idx.remove(root_key), Some(root_key));
        idx.verify().unwrap();
        for (k, id) in ids.iter().enumerate() {
            let k = k as u64;
            if k == root_key {
                assert_eq!(idx.key(*id), None);
            } else {
                assert_eq!(idx.entry(*id), Some((k, &k)));
            }
        }
    }

    #[test]
    fn limit_reports_out_of_nodes_and_slots_are_reused() {
        let mut idx = OrderedIndex::with_limit(2);
        idx.insert(1, ()).unwrap();
        idx.insert(2, ()).unwrap();
        assert_eq!(idx.insert(3, ()), Err(IndexError::OutOfNodes));
        idx.remove(1);
        idx.insert(3, ()).unwrap();
        assert_eq!(idx.slots.len(), 2);
        assert_eq!(keys(&idx), vec![2, 3]);
    }

    #[test]
    fn reserve_respects_limit_and_counts_vacant_slots() {
        let mut idx = OrderedIndex::with_limit(4);
        idx.reserve(4).unwrap();
        assert!(idx.slots.capacity() >= 4);
        assert_eq!(idx.reserve(5), Err(IndexError::OutOfNodes));
        for k in 0..3u64 {
            idx.insert(k, ()).unwrap();
        }
        idx.remove(0);
        idx.reserve(2).unwrap();
        assert_eq!(idx.reserve(3), Err(IndexError::OutOfNodes));
    }

    #[test]
    fn remove_node_with_stale_handle_fails() {
        let mut idx = OrderedIndex::new();
        let id = idx.insert(1, ()).unwrap();
        idx.remove_node(id).unwrap();
        assert_eq!(idx.remove_node(id), Err(IndexError::InvalidHandle));
        assert!(idx.is_empty());
        idx.verify().unwrap();
    }

    #[test]
    fn for_each_until_stops_early() {
        let mut idx = OrderedIndex::new();
        for k in 1..=10u64 {
            idx.insert(k, k).unwrap();
        }
        let mut seen = 0;
        let hit = idx.for_each_until(|k, _| {
            seen += 1;
            if k == 4 {
                ControlFlow::Break(k)
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(hit, Some(4));
        assert_eq!(seen, 4);
    }
}
