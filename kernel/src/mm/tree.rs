//! Region index: an arena-backed AVL tree of VMAs.
//!
//! Nodes live in a `Vec` addressed by `u32` handles; tree links and the
//! address-ordered neighbor list thread through the same nodes, so lookup
//! by address and prev/next walks never chase separate structures.
//!
//! Every node is annotated with the free gap between its region and the
//! previous region in address order, plus the largest such gap anywhere in
//! its subtree. Free-range search prunes whole branches on that aggregate.
//! Mutations are recursive, return the new subtree root, and re-derive
//! height and gap annotations on the unwind path.
//!
//! Regions are only ever inserted or grown downward; the fault engine has
//! no unmap operation, so node removal does not exist here.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::vma::Vma;

const NIL: u32 = u32::MAX;

struct Node {
    vma: Vma,
    left: u32,
    right: u32,
    prev: u32,
    next: u32,
    height: u8,
    /// Free bytes between this region's start and the previous region's
    /// end (or address zero for the lowest region).
    gap: u64,
    /// Largest `gap` within this subtree.
    subtree_gap: u64,
}

pub struct VmaTree {
    nodes: Vec<Node>,
    root: u32,
    head: u32,
    tail: u32,
}

impl VmaTree {
    pub fn new() -> Self {
        VmaTree {
            nodes: Vec::new(),
            root: NIL,
            head: NIL,
            tail: NIL,
        }
    }

    #[inline]
    fn n(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    fn nm(&mut self, idx: u32) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    #[inline]
    fn height(&self, idx: u32) -> u8 {
        if idx == NIL {
            0
        } else {
            self.n(idx).height
        }
    }

    #[inline]
    fn subtree_gap(&self, idx: u32) -> u64 {
        if idx == NIL {
            0
        } else {
            self.n(idx).subtree_gap
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Region holding `idx`.
    pub fn get(&self, idx: u32) -> &Vma {
        &self.n(idx).vma
    }

    /// End of the previous region in address order, 0 when `idx` is lowest.
    pub fn prev_end(&self, idx: u32) -> u64 {
        let prev = self.n(idx).prev;
        if prev == NIL {
            0
        } else {
            self.n(prev).vma.end
        }
    }

    /// First region whose end lies above `addr`. The caller still has to
    /// check `start` if containment matters.
    pub fn find(&self, addr: u64) -> Option<&Vma> {
        self.find_idx(addr).map(|idx| &self.n(idx).vma)
    }

    pub fn find_idx(&self, addr: u64) -> Option<u32> {
        let mut idx = self.root;
        let mut best = NIL;
        while idx != NIL {
            let node = self.n(idx);
            if node.vma.end > addr {
                best = idx;
                idx = node.left;
            } else {
                idx = node.right;
            }
        }
        if best == NIL {
            None
        } else {
            Some(best)
        }
    }

    /// Insert a region, rejecting any overlap with existing ones.
    pub fn insert(&mut self, vma: Vma) -> KernelResult<u32> {
        if vma.start >= vma.end {
            return Err(KernelError::InvalidArgument);
        }

        let pred = self.find_pred(vma.start);
        let succ = if pred == NIL {
            self.head
        } else {
            self.n(pred).next
        };

        if pred != NIL && self.n(pred).vma.end > vma.start {
            return Err(KernelError::AlreadyExists);
        }
        if succ != NIL && self.n(succ).vma.start < vma.end {
            return Err(KernelError::AlreadyExists);
        }

        let gap = vma.start
            - if pred == NIL {
                0
            } else {
                self.n(pred).vma.end
            };
        let start = vma.start;

        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            vma,
            left: NIL,
            right: NIL,
            prev: pred,
            next: succ,
            height: 1,
            gap,
            subtree_gap: gap,
        });

        if pred == NIL {
            self.head = idx;
        } else {
            self.nm(pred).next = idx;
        }
        if succ == NIL {
            self.tail = idx;
        } else {
            self.nm(succ).prev = idx;
        }

        self.root = self.insert_at(self.root, idx, start);

        // The new region shrinks its successor's gap; push the change up
        // the (post-rotation) path.
        if succ != NIL {
            let end = self.n(idx).vma.end;
            let succ_start = self.n(succ).vma.start;
            self.nm(succ).gap = succ_start - end;
            self.refresh_path(self.root, succ_start);
        }

        Ok(idx)
    }

    /// Move a region's start downward, as stack expansion does. The new
    /// start must stay above the previous region's end.
    pub fn set_start(&mut self, idx: u32, new_start: u64) -> KernelResult<()> {
        let node = self.n(idx);
        if new_start >= node.vma.start {
            return Err(KernelError::InvalidArgument);
        }
        let floor = self.prev_end(idx);
        if new_start < floor {
            return Err(KernelError::AlreadyExists);
        }

        // Shrinking start keeps the node between its neighbors, so the
        // tree shape and search path are unaffected.
        let node = self.nm(idx);
        node.vma.start = new_start;
        node.gap = new_start - floor;
        self.refresh_path(self.root, new_start);
        Ok(())
    }

    /// Lowest address where `len` free bytes fit inside `[low, high)`.
    pub fn unmapped_area(&self, len: u64, low: u64, high: u64) -> Option<u64> {
        if len == 0 || low >= high {
            return None;
        }
        if let Some(addr) = self.gap_search(self.root, len, low, high) {
            return Some(addr);
        }
        // Space above the highest region.
        let base = core::cmp::max(self.tail_end(), low);
        if high > base && high - base >= len {
            Some(base)
        } else {
            None
        }
    }

    /// Regions in address order.
    pub fn iter(&self) -> VmaIter<'_> {
        VmaIter {
            tree: self,
            cur: self.head,
        }
    }

    fn tail_end(&self) -> u64 {
        if self.tail == NIL {
            0
        } else {
            self.n(self.tail).vma.end
        }
    }

    /// Last region starting strictly below `start`.
    fn find_pred(&self, start: u64) -> u32 {
        let mut idx = self.root;
        let mut best = NIL;
        while idx != NIL {
            let node = self.n(idx);
            if node.vma.start < start {
                best = idx;
                idx = node.right;
            } else {
                idx = node.left;
            }
        }
        best
    }

    fn update(&mut self, idx: u32) {
        let (left, right) = {
            let node = self.n(idx);
            (node.left, node.right)
        };
        let height = 1 + core::cmp::max(self.height(left), self.height(right));
        let subtree_gap = {
            let own = self.n(idx).gap;
            own.max(self.subtree_gap(left)).max(self.subtree_gap(right))
        };
        let node = self.nm(idx);
        node.height = height;
        node.subtree_gap = subtree_gap;
    }

    fn rotate_right(&mut self, idx: u32) -> u32 {
        let pivot = self.n(idx).left;
        let moved = self.n(pivot).right;
        self.nm(idx).left = moved;
        self.nm(pivot).right = idx;
        self.update(idx);
        self.update(pivot);
        pivot
    }

    fn rotate_left(&mut self, idx: u32) -> u32 {
        let pivot = self.n(idx).right;
        let moved = self.n(pivot).left;
        self.nm(idx).right = moved;
        self.nm(pivot).left = idx;
        self.update(idx);
        self.update(pivot);
        pivot
    }

    fn rebalance(&mut self, idx: u32) -> u32 {
        self.update(idx);
        let (left, right) = {
            let node = self.n(idx);
            (node.left, node.right)
        };
        let bf = self.height(left) as i32 - self.height(right) as i32;
        if bf > 1 {
            if self.height(self.n(left).left) < self.height(self.n(left).right) {
                let rotated = self.rotate_left(left);
                self.nm(idx).left = rotated;
            }
            self.rotate_right(idx)
        } else if bf < -1 {
            if self.height(self.n(right).right) < self.height(self.n(right).left) {
                let rotated = self.rotate_right(right);
                self.nm(idx).right = rotated;
            }
            self.rotate_left(idx)
        } else {
            idx
        }
    }

    fn insert_at(&mut self, root: u32, idx: u32, key: u64) -> u32 {
        if root == NIL {
            return idx;
        }
        if key < self.n(root).vma.start {
            let child = self.insert_at(self.n(root).left, idx, key);
            self.nm(root).left = child;
        } else {
            let child = self.insert_at(self.n(root).right, idx, key);
            self.nm(root).right = child;
        }
        self.rebalance(root)
    }

    /// Recompute annotations bottom-up along the search path to `key`.
    fn refresh_path(&mut self, root: u32, key: u64) {
        if root == NIL {
            return;
        }
        let start = self.n(root).vma.start;
        if key < start {
            self.refresh_path(self.n(root).left, key);
        } else if key > start {
            self.refresh_path(self.n(root).right, key);
        }
        self.update(root);
    }

    fn gap_search(&self, idx: u32, len: u64, low: u64, high: u64) -> Option<u64> {
        if idx == NIL {
            return None;
        }
        let node = self.n(idx);
        if node.subtree_gap < len {
            return None;
        }
        if let Some(addr) = self.gap_search(node.left, len, low, high) {
            return Some(addr);
        }
        let gap_start = core::cmp::max(node.vma.start - node.gap, low);
        let gap_end = core::cmp::min(node.vma.start, high);
        if gap_end > gap_start && gap_end - gap_start >= len {
            return Some(gap_start);
        }
        self.gap_search(node.right, len, low, high)
    }

    #[cfg(test)]
    pub(crate) fn assert_annotations(&self) {
        self.check_node(self.root);

        // The neighbor list must agree with in-order tree traversal.
        let mut in_order = Vec::new();
        self.collect_in_order(self.root, &mut in_order);
        let listed: Vec<u64> = self.iter().map(|v| v.start).collect();
        assert_eq!(in_order, listed);
        for window in listed.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[cfg(test)]
    fn check_node(&self, idx: u32) -> (u8, u64) {
        if idx == NIL {
            return (0, 0);
        }
        let node = self.n(idx);
        let (lh, lg) = self.check_node(node.left);
        let (rh, rg) = self.check_node(node.right);
        assert_eq!(node.height, 1 + lh.max(rh), "height at {:#x}", node.vma.start);
        assert!(
            (lh as i32 - rh as i32).abs() <= 1,
            "imbalance at {:#x}",
            node.vma.start
        );
        assert_eq!(
            node.gap,
            node.vma.start - self.prev_end(idx),
            "gap at {:#x}",
            node.vma.start
        );
        assert_eq!(node.subtree_gap, node.gap.max(lg).max(rg));
        (node.height, node.subtree_gap)
    }

    #[cfg(test)]
    fn collect_in_order(&self, idx: u32, out: &mut Vec<u64>) {
        if idx == NIL {
            return;
        }
        let node = self.n(idx);
        self.collect_in_order(node.left, out);
        out.push(node.vma.start);
        self.collect_in_order(node.right, out);
    }
}

impl Default for VmaTree {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VmaIter<'a> {
    tree: &'a VmaTree,
    cur: u32,
}

impl<'a> Iterator for VmaIter<'a> {
    type Item = &'a Vma;

    fn next(&mut self) -> Option<&'a Vma> {
        if self.cur == NIL {
            return None;
        }
        let node = self.tree.n(self.cur);
        self.cur = node.next;
        Some(&node.vma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vma::{VM_READ, VM_WRITE};

    fn region(start: u64, end: u64) -> Vma {
        Vma::new(start, end, VM_READ | VM_WRITE)
    }

    #[test]
    fn test_insert_and_find() {
        let mut tree = VmaTree::new();
        tree.insert(region(0x1000, 0x2000)).unwrap();
        tree.insert(region(0x4000, 0x6000)).unwrap();

        let vma = tree.find(0x1800).unwrap();
        assert_eq!(vma.start, 0x1000);

        // find returns the first region ending above the address even when
        // the address itself is unmapped.
        let vma = tree.find(0x3000).unwrap();
        assert_eq!(vma.start, 0x4000);
        assert!(!vma.contains(0x3000));

        assert!(tree.find(0x6000).is_none());
        tree.assert_annotations();
    }

    #[test]
    fn test_overlap_rejected() {
        let mut tree = VmaTree::new();
        tree.insert(region(0x1000, 0x3000)).unwrap();

        assert_eq!(
            tree.insert(region(0x2000, 0x4000)),
            Err(KernelError::AlreadyExists)
        );
        assert_eq!(
            tree.insert(region(0x0000, 0x1001)),
            Err(KernelError::AlreadyExists)
        );
        assert_eq!(
            tree.insert(region(0x1000, 0x3000)),
            Err(KernelError::AlreadyExists)
        );
        // Abutting on either side is fine.
        assert!(tree.insert(region(0x0000, 0x1000)).is_ok());
        assert!(tree.insert(region(0x3000, 0x3800)).is_ok());
        assert_eq!(tree.len(), 3);
        tree.assert_annotations();
    }

    #[test]
    fn test_annotations_over_many_inserts() {
        let mut tree = VmaTree::new();
        // Ascending, descending, and middle insertions to force rotations
        // in both directions.
        let spans: &[(u64, u64)] = &[
            (0x10000, 0x11000),
            (0x30000, 0x31000),
            (0x20000, 0x21000),
            (0x50000, 0x52000),
            (0x40000, 0x41000),
            (0x08000, 0x09000),
            (0x60000, 0x61000),
            (0x70000, 0x71000),
            (0x80000, 0x81000),
            (0x04000, 0x05000),
            (0x55000, 0x56000),
        ];
        for &(s, e) in spans {
            tree.insert(region(s, e)).unwrap();
            tree.assert_annotations();
        }

        let starts: Vec<u64> = tree.iter().map(|v| v.start).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn test_gap_values() {
        let mut tree = VmaTree::new();
        let a = tree.insert(region(0x2000, 0x3000)).unwrap();
        let b = tree.insert(region(0x5000, 0x6000)).unwrap();
        let c = tree.insert(region(0x3000, 0x4000)).unwrap();

        // Lowest region gaps down to address zero.
        assert_eq!(tree.prev_end(a), 0);
        assert_eq!(tree.prev_end(c), 0x3000);
        assert_eq!(tree.prev_end(b), 0x4000);
        tree.assert_annotations();
    }

    #[test]
    fn test_unmapped_area() {
        let mut tree = VmaTree::new();
        assert_eq!(tree.unmapped_area(0x1000, 0x1000, 0x10000), Some(0x1000));

        tree.insert(region(0x1000, 0x2000)).unwrap();
        tree.insert(region(0x3000, 0x5000)).unwrap();
        tree.insert(region(0x9000, 0xa000)).unwrap();

        // Lowest fitting hole wins.
        assert_eq!(tree.unmapped_area(0x1000, 0x1000, 0x10000), Some(0x2000));
        // Too big for the 0x2000..0x3000 hole, fits at 0x5000.
        assert_eq!(tree.unmapped_area(0x3000, 0x1000, 0x10000), Some(0x5000));
        // Above every region.
        assert_eq!(tree.unmapped_area(0x4000, 0x1000, 0x10000), Some(0xa000));
        // Window floor applies inside a hole.
        assert_eq!(tree.unmapped_area(0x1000, 0x6000, 0x10000), Some(0x6000));
        // Nothing fits.
        assert_eq!(tree.unmapped_area(0x10000, 0x1000, 0xb000), None);
    }

    #[test]
    fn test_set_start_expands_down() {
        let mut tree = VmaTree::new();
        tree.insert(region(0x1000, 0x2000)).unwrap();
        let stack = tree.insert(region(0x8000, 0x9000)).unwrap();

        tree.set_start(stack, 0x6000).unwrap();
        assert_eq!(tree.get(stack).start, 0x6000);
        assert!(tree.find(0x6000).unwrap().contains(0x6000));
        tree.assert_annotations();

        // Growing upward or into the neighbor is refused.
        assert_eq!(
            tree.set_start(stack, 0x7000),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            tree.set_start(stack, 0x1fff),
            Err(KernelError::AlreadyExists)
        );
        tree.assert_annotations();
    }
}
