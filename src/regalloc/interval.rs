//! Register interval forest.
//!
//! Values that share a merge set occupy overlapping ranges of the global
//! interval space, and the allocator only ever places *top-level* intervals:
//! anything nested inside another live interval is locked to its parent and
//! moves with it. This module implements the forest of nested intervals that
//! makes that work, shared by the allocator, the spiller, and the pressure
//! calculator.
//!
//! Intervals at the same level of the forest never partially overlap: either
//! they are disjoint or one fully contains the other. Merge-set coalescing
//! guarantees this upstream; the forest only asserts it.
//!
//! Clients keep their own bookkeeping (free-unit bitsets, pressure counters)
//! through the [`RegTreeHooks`] callbacks, which fire whenever a top-level
//! interval enters or leaves the forest. The forest itself knows nothing
//! about physical registers.

use crate::ir::Value;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

/// Client callbacks for top-level interval bookkeeping.
pub trait RegTreeHooks {
    /// A top-level interval was added to the forest.
    fn interval_add(&mut self, _value: Value, _start: u32, _end: u32) {}

    /// A top-level interval left the forest.
    fn interval_delete(&mut self, _value: Value, _start: u32, _end: u32) {}

    /// `child` was promoted to top level because its parent was removed.
    /// The client must derive the child's placement from the parent's and
    /// then account for it like an `interval_add`.
    fn interval_readd(
        &mut self,
        _parent: Value,
        _parent_start: u32,
        _child: Value,
        _child_start: u32,
        _child_end: u32,
    ) {
    }
}

/// Hooks that do nothing. Used when only the tree structure matters.
pub struct NullHooks;

impl RegTreeHooks for NullHooks {}

#[derive(Clone, Default)]
struct Node {
    start: u32,
    end: u32,
    half: bool,
    parent: PackedOption<Value>,
    children: SmallVec<[Value; 2]>,
    inserted: bool,
}

/// Forest of nested register intervals, one node per value.
///
/// Top-level intervals and child lists are kept sorted by interval start.
pub struct RegTree {
    nodes: SecondaryMap<Value, Node>,
    top: Vec<Value>,
}

impl RegTree {
    /// Create an empty forest.
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            top: Vec::new(),
        }
    }

    /// Remove every interval without firing hooks.
    pub fn clear(&mut self) {
        let top = core::mem::take(&mut self.top);
        for v in top {
            self.mark_free(v);
        }
    }

    fn mark_free(&mut self, value: Value) {
        self.nodes[value].inserted = false;
        let children = self.nodes[value].children.clone();
        for c in children {
            self.mark_free(c);
        }
    }

    /// (Re)initialize the node for `value` before insertion.
    pub fn init(&mut self, value: Value, start: u32, end: u32, half: bool) {
        debug_assert!(start < end, "empty interval for {}", value);
        self.nodes[value] = Node {
            start,
            end,
            half,
            parent: PackedOption::default(),
            children: SmallVec::new(),
            inserted: false,
        };
    }

    /// Logical start of `value`'s interval.
    pub fn start(&self, value: Value) -> u32 {
        self.nodes[value].start
    }

    /// Logical end of `value`'s interval.
    pub fn end(&self, value: Value) -> u32 {
        self.nodes[value].end
    }

    /// Parent interval, if `value` is nested.
    pub fn parent(&self, value: Value) -> Option<Value> {
        self.nodes[value].parent.expand()
    }

    /// Walk to the top-level ancestor of `value`.
    pub fn root(&self, value: Value) -> Value {
        let mut v = value;
        while let Some(p) = self.nodes[v].parent.expand() {
            v = p;
        }
        v
    }

    /// Is `value` currently in the forest?
    pub fn is_inserted(&self, value: Value) -> bool {
        self.nodes[value].inserted
    }

    /// Direct children of `value`.
    pub fn children(&self, value: Value) -> &[Value] {
        &self.nodes[value].children
    }

    /// Top-level intervals, sorted by logical start.
    pub fn top_level(&self) -> &[Value] {
        &self.top
    }

    /// The top-level interval covering logical `offset`, if any.
    pub fn top_at(&self, offset: u32) -> Option<Value> {
        let i = self
            .top
            .partition_point(|&v| self.nodes[v].end <= offset);
        match self.top.get(i) {
            Some(&v) if self.nodes[v].start <= offset => Some(v),
            _ => None,
        }
    }

    /// Insert `value` as a fresh interval, re-parenting existing intervals
    /// as necessary to keep the nesting invariant.
    pub fn insert<H: RegTreeHooks>(&mut self, hooks: &mut H, value: Value) {
        self.nodes[value].children.clear();
        self.nodes[value].parent = PackedOption::default();
        self.insert_at(hooks, None, value);
    }

    /// Reinsert an interval previously removed with [`RegTree::remove_temp`],
    /// keeping its children.
    pub fn reinsert<H: RegTreeHooks>(&mut self, hooks: &mut H, value: Value) {
        self.nodes[value].parent = PackedOption::default();
        self.insert_at(hooks, None, value);
    }

    fn insert_at<H: RegTreeHooks>(&mut self, hooks: &mut H, parent: Option<Value>, value: Value) {
        let mut parent = parent;
        let (start, end, half) = {
            let n = &self.nodes[value];
            (n.start, n.end, n.half)
        };
        loop {
            // Find the leftmost sibling that ends past our start; if it also
            // begins before our end, the two intervals overlap.
            let idx = self.sib_position(parent, start);
            let len = self.sib_len(parent);
            if idx < len {
                let right = self.sib_get(parent, idx);
                let (r_start, r_end, r_half) = {
                    let n = &self.nodes[right];
                    (n.start, n.end, n.half)
                };
                if r_start < end {
                    // Trees with mixed half-ness would make bitcasts behave
                    // like real copies with doubled pressure; the coalescer
                    // never produces them.
                    assert_eq!(half, r_half, "mixed half-ness in interval tree");
                    if r_start >= start && r_end <= end {
                        debug_assert_ne!(right, value, "interval already inserted");
                        // The overlapping siblings become our children.
                        // Every one of them must be fully contained.
                        let mut j = idx;
                        while j < self.sib_len(parent) {
                            let c = self.sib_get(parent, j);
                            if self.nodes[c].start >= end {
                                break;
                            }
                            assert!(
                                self.nodes[c].end <= end,
                                "partial overlap between {} and {}",
                                value,
                                c
                            );
                            assert_eq!(half, self.nodes[c].half);
                            j += 1;
                        }
                        let adopted = self.sib_remove_range(parent, idx, j);
                        for &c in &adopted {
                            if parent.is_none() {
                                let (cs, ce) = (self.nodes[c].start, self.nodes[c].end);
                                hooks.interval_delete(c, cs, ce);
                            }
                            self.nodes[c].parent = value.into();
                        }
                        // Adopted siblings arrive in order; merge them into
                        // any children kept across a remove_temp/reinsert.
                        for c in adopted {
                            let cs = self.nodes[c].start;
                            let pos = self.nodes[value]
                                .children
                                .partition_point(|&o| self.nodes[o].start < cs);
                            self.nodes[value].children.insert(pos, c);
                        }
                    } else {
                        // `right` must contain us; descend into it.
                        assert!(
                            r_start <= start && r_end >= end,
                            "partial overlap between {} and {}",
                            value,
                            right
                        );
                        self.nodes[value].parent = right.into();
                        parent = Some(right);
                        continue;
                    }
                }
            }
            break;
        }

        if parent.is_none() {
            hooks.interval_add(value, start, end);
        }
        let pos = self.sib_position_start(parent, start);
        self.sib_insert(parent, pos, value);
        self.nodes[value].inserted = true;
    }

    /// Remove `value`, promoting its direct children one level up.
    pub fn remove<H: RegTreeHooks>(&mut self, hooks: &mut H, value: Value) {
        let parent = self.nodes[value].parent.expand();
        let (start, end) = (self.nodes[value].start, self.nodes[value].end);
        match parent {
            Some(p) => self.child_remove(p, value),
            None => {
                hooks.interval_delete(value, start, end);
                self.top_remove(value);
            }
        }

        let children = core::mem::take(&mut self.nodes[value].children);
        for c in children {
            self.nodes[c].parent = parent.into();
            match parent {
                Some(p) => {
                    let cs = self.nodes[c].start;
                    let pos = self.nodes[p]
                        .children
                        .partition_point(|&o| self.nodes[o].start < cs);
                    self.nodes[p].children.insert(pos, c);
                }
                None => {
                    let (cs, ce) = (self.nodes[c].start, self.nodes[c].end);
                    hooks.interval_readd(value, start, c, cs, ce);
                    let pos = self.top.partition_point(|&o| self.nodes[o].start < cs);
                    self.top.insert(pos, c);
                }
            }
        }
        self.nodes[value].inserted = false;
    }

    /// Remove a top-level interval and its whole subtree.
    pub fn remove_all<H: RegTreeHooks>(&mut self, hooks: &mut H, value: Value) {
        assert!(self.nodes[value].parent.is_none());
        let (start, end) = (self.nodes[value].start, self.nodes[value].end);
        hooks.interval_delete(value, start, end);
        self.top_remove(value);
        self.mark_free(value);
    }

    /// Pop a top-level interval so it can be shuffled around, leaving its
    /// children attached for a later [`RegTree::reinsert`].
    pub fn remove_temp<H: RegTreeHooks>(&mut self, hooks: &mut H, value: Value) {
        assert!(self.nodes[value].parent.is_none());
        let (start, end) = (self.nodes[value].start, self.nodes[value].end);
        hooks.interval_delete(value, start, end);
        self.top_remove(value);
    }

    fn top_remove(&mut self, value: Value) {
        let pos = self
            .top
            .iter()
            .position(|&v| v == value)
            .expect("interval not at top level");
        self.top.remove(pos);
    }

    fn child_remove(&mut self, parent: Value, value: Value) {
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&v| v == value)
            .expect("interval not a child of its parent");
        self.nodes[parent].children.remove(pos);
    }

    fn sib_len(&self, parent: Option<Value>) -> usize {
        match parent {
            Some(p) => self.nodes[p].children.len(),
            None => self.top.len(),
        }
    }

    fn sib_get(&self, parent: Option<Value>, i: usize) -> Value {
        match parent {
            Some(p) => self.nodes[p].children[i],
            None => self.top[i],
        }
    }

    // First sibling index whose interval ends past `start`.
    fn sib_position(&self, parent: Option<Value>, start: u32) -> usize {
        match parent {
            Some(p) => self.nodes[p]
                .children
                .partition_point(|&v| self.nodes[v].end <= start),
            None => self.top.partition_point(|&v| self.nodes[v].end <= start),
        }
    }

    // Insertion position keeping the sibling list sorted by start.
    fn sib_position_start(&self, parent: Option<Value>, start: u32) -> usize {
        match parent {
            Some(p) => self.nodes[p]
                .children
                .partition_point(|&v| self.nodes[v].start < start),
            None => self.top.partition_point(|&v| self.nodes[v].start < start),
        }
    }

    fn sib_insert(&mut self, parent: Option<Value>, i: usize, value: Value) {
        match parent {
            Some(p) => self.nodes[p].children.insert(i, value),
            None => self.top.insert(i, value),
        }
    }

    fn sib_remove_range(
        &mut self,
        parent: Option<Value>,
        from: usize,
        to: usize,
    ) -> SmallVec<[Value; 4]> {
        match parent {
            Some(p) => self.nodes[p].children.drain(from..to).collect(),
            None => self.top.drain(from..to).collect(),
        }
    }
}
