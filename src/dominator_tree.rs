//! Dominator tree computation and queries.
//!
//! The allocator passes need two things from dominance: the immediate
//! dominator chain for ordering definitions, and a fast `dominates` query for
//! the merge-set interference walk. We compute immediate dominators with the
//! classic iterative algorithm over a reverse postorder, then number the
//! dominator tree in pre-order so `dominates` is two integer comparisons.

use crate::ir::{Block, Function};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

/// Dominator tree for one function.
pub struct DominatorTree {
    idom: SecondaryMap<Block, PackedOption<Block>>,
    rpo: Vec<Block>,
    rpo_index: SecondaryMap<Block, u32>,
    pre: SecondaryMap<Block, u32>,
    pre_max: SecondaryMap<Block, u32>,
}

impl DominatorTree {
    /// Compute the dominator tree of `func`.
    ///
    /// All blocks in the layout must be reachable from the entry block.
    pub fn compute(func: &Function) -> Self {
        let mut tree = Self {
            idom: SecondaryMap::new(),
            rpo: Vec::with_capacity(func.layout.len()),
            rpo_index: SecondaryMap::new(),
            pre: SecondaryMap::new(),
            pre_max: SecondaryMap::new(),
        };
        tree.compute_rpo(func);
        tree.compute_idom(func);
        tree.compute_preorder(func);
        tree
    }

    /// Blocks in reverse postorder.
    pub fn rpo(&self) -> &[Block] {
        &self.rpo
    }

    /// The immediate dominator of `block`, or `None` for the entry block.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.idom[block].expand()
    }

    /// Does `a` dominate `b`? Reflexive.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        self.pre[a] <= self.pre[b] && self.pre[b] <= self.pre_max[a]
    }

    /// Pre-order number of `block` in the dominator tree.
    pub fn pre_number(&self, block: Block) -> u32 {
        self.pre[block]
    }

    /// Blocks ordered by dominator-tree pre-order. A definition that
    /// dominates another always comes first in this order.
    pub fn preorder_blocks(&self) -> Vec<Block> {
        let mut blocks = self.rpo.clone();
        blocks.sort_by_key(|&b| self.pre[b]);
        blocks
    }

    fn compute_rpo(&mut self, func: &Function) {
        // Iterative DFS producing a postorder, then reverse it.
        let entry = func.entry_block();
        let mut visited = SecondaryMap::with_default(false);
        let mut post = Vec::with_capacity(func.layout.len());
        let mut stack = vec![(entry, 0usize)];
        visited[entry] = true;
        while let Some(&(block, next)) = stack.last() {
            let succs = &func.blocks[block].succs;
            if next < succs.len() {
                stack.last_mut().unwrap().1 += 1;
                let succ = succs[next];
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        debug_assert_eq!(post.len(), func.layout.len(), "unreachable blocks in layout");
        post.reverse();
        self.rpo = post;
        for (i, &block) in self.rpo.iter().enumerate() {
            self.rpo_index[block] = i as u32;
        }
    }

    fn compute_idom(&mut self, func: &Function) {
        // Cooper, Harvey & Kennedy, "A simple, fast dominance algorithm."
        let entry = func.entry_block();
        self.idom[entry] = entry.into();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in &func.blocks[block].preds {
                    if self.idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(other) => self.intersect(pred, other),
                    });
                }
                let new_idom = new_idom.expect("block with no processed predecessor");
                if self.idom[block].expand() != Some(new_idom) {
                    self.idom[block] = new_idom.into();
                    changed = true;
                }
            }
        }
        // The entry block has no immediate dominator.
        self.idom[entry] = PackedOption::default();
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        while a != b {
            while self.rpo_index[a] > self.rpo_index[b] {
                a = self.idom[a].expand().unwrap();
            }
            while self.rpo_index[b] > self.rpo_index[a] {
                b = self.idom[b].expand().unwrap();
            }
        }
        a
    }

    fn compute_preorder(&mut self, func: &Function) {
        let mut children: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
        for &block in &self.rpo {
            if let Some(parent) = self.idom(block) {
                children[parent].push(block);
            }
        }
        let mut counter = 0u32;
        let mut stack = vec![(func.entry_block(), false)];
        while let Some((block, finished)) = stack.pop() {
            if finished {
                self.pre_max[block] = counter - 1;
                continue;
            }
            self.pre[block] = counter;
            counter += 1;
            stack.push((block, true));
            for &child in children[block].iter().rev() {
                stack.push((child, false));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Function;

    fn diamond() -> (Function, [Block; 4]) {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let b3 = func.create_block();
        func.add_edge(b0, b1);
        func.add_edge(b0, b2);
        func.add_edge(b1, b3);
        func.add_edge(b2, b3);
        (func, [b0, b1, b2, b3])
    }

    #[test]
    fn diamond_idoms() {
        let (func, [b0, b1, b2, b3]) = diamond();
        let tree = DominatorTree::compute(&func);
        assert_eq!(tree.idom(b0), None);
        assert_eq!(tree.idom(b1), Some(b0));
        assert_eq!(tree.idom(b2), Some(b0));
        assert_eq!(tree.idom(b3), Some(b0));
        assert!(tree.dominates(b0, b3));
        assert!(tree.dominates(b1, b1));
        assert!(!tree.dominates(b1, b3));
        assert!(!tree.dominates(b3, b0));
    }

    #[test]
    fn loop_idoms() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block(); // header
        let b2 = func.create_block(); // body, branches back
        let b3 = func.create_block(); // exit
        func.add_edge(b0, b1);
        func.add_edge(b1, b2);
        func.add_edge(b2, b1);
        func.add_edge(b1, b3);
        let tree = DominatorTree::compute(&func);
        assert_eq!(tree.idom(b1), Some(b0));
        assert_eq!(tree.idom(b2), Some(b1));
        assert_eq!(tree.idom(b3), Some(b1));
        assert!(tree.dominates(b1, b2));
        assert!(!tree.dominates(b2, b3));
    }
}
