//! Merge-set coalescing: out-of-SSA translation extended for partial
//! overlaps.
//!
//! The allocator wants phi-related values, and the parts of a vector
//! connected by `split`/`collect`, to land in the same physical storage so
//! that the meta-instructions become free. We express that with *merge
//! sets*: equivalence classes of values allowed to occupy overlapping
//! register ranges, each member tagged with its offset inside the set.
//!
//! The overall structure follows the classic coalescing approach of
//!
//! ```text
//! Budimlic, Z., Cooper, K. D., Harvey, T. J., et al. (2002). Fast copy
//! coalescing and live-range identification.
//! ```
//!
//! with interference detection over a linear dominator stack (Boissinot,
//! Darte & Rastello, 2009), extended in two ways: member offsets may differ
//! (a split's destination sits at a sub-offset of its source), and the
//! interference test tolerates overlap between values that are *views of
//! the same data*. Naively, a split destination always overlaps its source
//! positionally, yet must coalesce; we recognize this by chasing each value
//! through its split/collect/parallel-copy defining chain to an ultimate
//! source register and offset. Two nested ranges that resolve to the same
//! ultimate bits are copies, not interference.
//!
//! Sub-ranges that partially overlap without nesting always interfere,
//! which is what keeps the interval forest's nesting invariant sound.

use crate::dominator_tree::DominatorTree;
use crate::ir::{DefSpec, Function, Inst, MergeSet, MergeSetData, Opcode, Src, Value};
use crate::regalloc::liveness::Liveness;
use crate::trace;
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Insert a parallel copy ahead of every phi use, making the program
/// copy-friendly (conventional SSA) before merge-set analysis.
///
/// Every phi argument is routed through a fresh value defined by a parallel
/// copy at the end of the corresponding predecessor. Coalescing will fold
/// almost all of these copies away again; the ones that remain are exactly
/// the places where phi operands genuinely interfere.
///
/// Idempotent: arguments that already read a copy made in the right
/// predecessor are left alone, so the pass can re-run after spilling has
/// introduced new phis.
pub fn create_parallel_copies(func: &mut Function) {
    let mut pcopies: FxHashMap<crate::ir::Block, Inst> = FxHashMap::default();
    for block_idx in 0..func.layout.len() {
        let block = func.layout[block_idx];
        let phis: Vec<Inst> = func.blocks[block]
            .insts
            .iter()
            .copied()
            .take_while(|&i| func.insts[i].op == Opcode::Phi)
            .collect();
        for phi in phis {
            let preds = func.blocks[block].preds.clone();
            for i in 0..func.insts[phi].srcs.len() {
                let arg = match func.insts[phi].srcs[i].value.expand() {
                    Some(v) => v,
                    None => continue,
                };
                let pred = preds[i];
                let arg_inst = func.def_inst(arg);
                if func.insts[arg_inst].op == Opcode::ParallelCopy
                    && func.insts[arg_inst].block.expand() == Some(pred)
                {
                    continue;
                }
                let pcopy = *pcopies.entry(pred).or_insert_with(|| {
                    func.append_inst(pred, Opcode::ParallelCopy, &[], &[])
                });
                let copy = func.append_copy_pair(pcopy, DefSpec::like(func, arg), Src::read(arg));
                func.insts[phi].srcs[i].value = copy.into();
            }
        }
    }
}

/// Run merge-set coalescing and assign every value's global interval range.
pub fn merge_regs(func: &mut Function, liveness: &Liveness, domtree: &DominatorTree) {
    let mut ctx = Context {
        func,
        liveness,
        domtree,
        seq: SecondaryMap::new(),
    };
    ctx.number_defs();
    ctx.coalesce_phis();
    ctx.coalesce_aggressively();
    ctx.assign_intervals();
}

struct Context<'a> {
    func: &'a mut Function,
    liveness: &'a Liveness,
    domtree: &'a DominatorTree,
    // Definition sequence numbers in dominator-tree pre-order. Within one
    // block this is program order, so "a dominates b" for two defs in the
    // same block is a plain comparison.
    seq: SecondaryMap<Value, u32>,
}

impl<'a> Context<'a> {
    fn number_defs(&mut self) {
        let mut n = 0u32;
        for block in self.domtree.preorder_blocks() {
            for &inst in &self.func.blocks[block].insts {
                for &dst in &self.func.insts[inst].dsts {
                    self.seq[dst] = n;
                    n += 1;
                }
            }
        }
    }

    fn coalesce_phis(&mut self) {
        for block in self.domtree.preorder_blocks() {
            for inst_idx in 0..self.func.blocks[block].insts.len() {
                let inst = self.func.blocks[block].insts[inst_idx];
                if self.func.insts[inst].op != Opcode::Phi {
                    break;
                }
                let dst = self.func.single_dst(inst);
                for i in 0..self.func.insts[inst].srcs.len() {
                    if let Some(src) = self.func.insts[inst].srcs[i].value.expand() {
                        self.try_merge(dst, src, 0);
                    }
                }
            }
        }
    }

    fn coalesce_aggressively(&mut self) {
        for block in self.domtree.preorder_blocks() {
            for inst_idx in 0..self.func.blocks[block].insts.len() {
                let inst = self.func.blocks[block].insts[inst_idx];
                match self.func.insts[inst].op {
                    Opcode::Split(comp) => {
                        let dst = self.func.single_dst(inst);
                        let src = self.func.insts[inst].srcs[0]
                            .value
                            .expand()
                            .expect("split of undef");
                        let off = u32::from(comp) * self.func.elem_size(dst);
                        self.try_merge(src, dst, off);
                    }
                    Opcode::Collect => {
                        let dst = self.func.single_dst(inst);
                        let elem = self.func.elem_size(dst);
                        let mut off = 0;
                        for i in 0..self.func.insts[inst].srcs.len() {
                            match self.func.insts[inst].srcs[i].value.expand() {
                                Some(src) => {
                                    self.try_merge(dst, src, off);
                                    off += self.func.reg_size(src);
                                }
                                None => off += elem,
                            }
                        }
                    }
                    Opcode::ParallelCopy => {
                        for i in 0..self.func.insts[inst].srcs.len() {
                            let dst = self.func.insts[inst].dsts[i];
                            if let Some(src) = self.func.insts[inst].srcs[i].value.expand() {
                                self.try_merge(dst, src, 0);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // Get the merge set of `value`, creating a singleton set on first touch.
    fn merge_set(&mut self, value: Value) -> MergeSet {
        if let Some(set) = self.func.values[value].merge_set.expand() {
            return set;
        }
        let size = self.func.reg_size(value);
        let alignment = self.func.elem_size(value);
        let set = self.func.merge_sets.push(MergeSetData {
            size,
            alignment,
            regs: vec![value],
            preferred_reg: None,
            spill_slot: None,
        });
        self.func.values[value].merge_set = set.into();
        self.func.values[value].merge_set_offset = 0;
        set
    }

    /// Try to place `b` at `b_rel` units past `a` inside one merge set.
    fn try_merge(&mut self, a: Value, b: Value, b_rel: u32) {
        if a == b {
            return;
        }
        let sa = self.merge_set(a);
        let sb = self.merge_set(b);
        if sa == sb {
            return;
        }

        let oa = self.func.values[a].merge_set_offset;
        let ob = self.func.values[b].merge_set_offset;
        let delta = i64::from(oa) + i64::from(b_rel) - i64::from(ob);
        let (a_shift, b_shift) = if delta < 0 {
            ((-delta) as u32, 0)
        } else {
            (0, delta as u32)
        };

        // Candidate member list in dominance order with final offsets.
        let mut members: Vec<(Value, u32)> = Vec::with_capacity(
            self.func.merge_sets[sa].regs.len() + self.func.merge_sets[sb].regs.len(),
        );
        for &m in &self.func.merge_sets[sa].regs {
            members.push((m, self.func.values[m].merge_set_offset + a_shift));
        }
        for &m in &self.func.merge_sets[sb].regs {
            members.push((m, self.func.values[m].merge_set_offset + b_shift));
        }
        members.sort_by_key(|&(m, _)| self.seq[m]);

        if !self.check_interference(&members) {
            trace!("-> not merging {} and {}: interference", a, b);
            return;
        }

        trace!("-> merging {} and {} at relative offset {}", a, b, b_rel);
        let mut size = 0;
        for &(m, off) in &members {
            self.func.values[m].merge_set = sa.into();
            self.func.values[m].merge_set_offset = off;
            size = size.max(off + self.func.reg_size(m));
        }
        let sb_align = self.func.merge_sets[sb].alignment;
        let set = &mut self.func.merge_sets[sa];
        set.size = size;
        set.alignment = set.alignment.max(sb_align);
        set.regs = members.into_iter().map(|(m, _)| m).collect();
        self.func.merge_sets[sb].regs.clear();
    }

    // Walk the candidate members in dominance order, keeping a stack of
    // definitions whose blocks dominate the current one. Returns true when
    // the set is interference-free.
    fn check_interference(&self, members: &[(Value, u32)]) -> bool {
        let mut stack: SmallVec<[(Value, u32); 8]> = SmallVec::new();
        for &(v, off) in members {
            while let Some(&(top, _)) = stack.last() {
                if self.def_dominates(top, v) {
                    break;
                }
                stack.pop();
            }
            for &(other, ooff) in stack.iter().rev() {
                if !self.can_skip_interference(other, ooff, v, off) {
                    return false;
                }
            }
            stack.push((v, off));
        }
        true
    }

    fn def_dominates(&self, a: Value, b: Value) -> bool {
        let ba = self.func.def_block(a);
        let bb = self.func.def_block(b);
        if ba == bb {
            self.seq[a] <= self.seq[b]
        } else {
            self.domtree.dominates(ba, bb)
        }
    }

    // `dom` is defined before `v` and both would live in one set; decide
    // whether their sub-ranges can coexist.
    fn can_skip_interference(&self, dom: Value, dom_off: u32, v: Value, v_off: u32) -> bool {
        let (s1, e1) = (dom_off, dom_off + self.func.reg_size(dom));
        let (s2, e2) = (v_off, v_off + self.func.reg_size(v));
        if e1 <= s2 || e2 <= s1 {
            // Disjoint sub-ranges never interfere.
            return true;
        }
        let nested = (s1 >= s2 && e1 <= e2) || (s2 >= s1 && e2 <= e1);
        if !nested {
            // Partial overlap would break the interval forest invariant.
            return false;
        }
        // Nested overlap: the common case for split/collect views. If both
        // ranges resolve to the same ultimate bits they are copies of each
        // other, not interference.
        let (root_a, chase_a) = chase_value(self.func, dom);
        let (root_b, chase_b) = chase_value(self.func, v);
        if root_a == root_b && chase_a - i64::from(s1) == chase_b - i64::from(s2) {
            return true;
        }
        // Different data: interference iff the dominating value is still
        // live where the new one is defined.
        !self
            .liveness
            .def_live_after(self.func, dom, self.func.def_inst(v))
    }

    // Lay the merge sets out in the global interval space, giving every
    // value its interval_start/interval_end.
    fn assign_intervals(&mut self) {
        let mut set_start: FxHashMap<MergeSet, u32> = FxHashMap::default();
        let mut offset = 0u32;
        for block in self.domtree.preorder_blocks() {
            for inst_idx in 0..self.func.blocks[block].insts.len() {
                let inst = self.func.blocks[block].insts[inst_idx];
                for dst_idx in 0..self.func.insts[inst].dsts.len() {
                    let dst = self.func.insts[inst].dsts[dst_idx];
                    let size = self.func.reg_size(dst);
                    let start = match self.func.values[dst].merge_set.expand() {
                        Some(set) => {
                            let base = *set_start.entry(set).or_insert_with(|| {
                                let base = offset;
                                offset += self.func.merge_sets[set].size;
                                base
                            });
                            base + self.func.values[dst].merge_set_offset
                        }
                        None => {
                            let base = offset;
                            offset += size;
                            base
                        }
                    };
                    self.func.values[dst].interval_start = start;
                    self.func.values[dst].interval_end = start + size;
                }
            }
        }
    }
}

/// Chase `value` through its split/collect/parallel-copy defining chain to
/// the ultimate source it is a view of. Returns that source and the unit
/// offset of `value`'s storage within it.
pub fn chase_value(func: &Function, value: Value) -> (Value, i64) {
    let mut v = value;
    let mut off = 0i64;
    loop {
        let inst = func.def_inst(v);
        match func.insts[inst].op {
            Opcode::Split(comp) => {
                let src = match func.insts[inst].srcs[0].value.expand() {
                    Some(s) => s,
                    None => break,
                };
                off += i64::from(u32::from(comp) * func.elem_size(v));
                v = src;
            }
            Opcode::ParallelCopy => {
                let idx = func.insts[inst]
                    .dsts
                    .iter()
                    .position(|&d| d == v)
                    .expect("value not defined by its instruction");
                match func.insts[inst].srcs[idx].value.expand() {
                    Some(s) => v = s,
                    None => break,
                }
            }
            _ => break,
        }
    }
    (v, off)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{AluOp, DefSpec, Function, Opcode};
    use crate::regalloc::liveness::Liveness;

    fn run_merge(func: &mut Function) -> DominatorTree {
        let domtree = DominatorTree::compute(func);
        create_parallel_copies(func);
        let liveness = Liveness::compute(func);
        merge_regs(func, &liveness, &domtree);
        domtree
    }

    fn same_set(func: &Function, a: crate::ir::Value, b: crate::ir::Value) -> bool {
        func.values[a].merge_set.expand().is_some()
            && func.values[a].merge_set == func.values[b].merge_set
    }

    #[test]
    fn split_collect_chain_coalesces() {
        // vec = ..., a = split vec 0, b = split vec 1, v = collect a, b.
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let ivec = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(2)], &[]);
        let vec = func.single_dst(ivec);
        let isa = func.append_inst(b0, Opcode::Split(0), &[DefSpec::full(1)], &[vec]);
        let a = func.single_dst(isa);
        let isb = func.append_inst(b0, Opcode::Split(1), &[DefSpec::full(1)], &[vec]);
        let b = func.single_dst(isb);
        let icol = func.append_inst(b0, Opcode::Collect, &[DefSpec::full(2)], &[a, b]);
        let col = func.single_dst(icol);
        func.append_inst(b0, Opcode::Store(0), &[], &[col]);

        run_merge(&mut func);
        assert!(same_set(&func, vec, a));
        assert!(same_set(&func, vec, b));
        assert!(same_set(&func, vec, col));
        assert_eq!(func.values[vec].merge_set_offset, 0);
        assert_eq!(func.values[a].merge_set_offset, 0);
        assert_eq!(func.values[b].merge_set_offset, 2);
        assert_eq!(func.values[col].merge_set_offset, 0);
        let set = func.values[vec].merge_set.expand().unwrap();
        assert_eq!(func.merge_sets[set].size, 4);
        // Nested members share the global interval range.
        assert_eq!(func.values[vec].interval_start, func.values[col].interval_start);
        assert_eq!(
            func.values[b].interval_start,
            func.values[vec].interval_start + 2
        );
    }

    #[test]
    fn phi_coalesces_through_parallel_copies() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let b3 = func.create_block();
        func.add_edge(b0, b1);
        func.add_edge(b0, b2);
        func.add_edge(b1, b3);
        func.add_edge(b2, b3);
        let ia = func.append_inst(b1, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let va = func.single_dst(ia);
        let ib = func.append_inst(b2, Opcode::MovImm(2), &[DefSpec::full(1)], &[]);
        let vb = func.single_dst(ib);
        let phi = func.append_phi(b3, DefSpec::full(1), &[Some(va), Some(vb)]);
        let vphi = func.single_dst(phi);
        func.append_inst(b3, Opcode::Store(0), &[], &[vphi]);

        run_merge(&mut func);
        // The phi arguments were rewritten to parallel-copy results.
        let arg0 = func.insts[phi].srcs[0].value.expand().unwrap();
        let arg1 = func.insts[phi].srcs[1].value.expand().unwrap();
        assert_ne!(arg0, va);
        assert_ne!(arg1, vb);
        // Everything coalesces into one set at offset zero.
        assert!(same_set(&func, vphi, arg0));
        assert!(same_set(&func, vphi, arg1));
        assert!(same_set(&func, vphi, va));
        assert!(same_set(&func, vphi, vb));
        assert_eq!(func.values[vphi].merge_set_offset, 0);
        assert_eq!(func.values[va].merge_set_offset, 0);
    }

    #[test]
    fn copies_of_the_same_data_coalesce() {
        // v1 is a copy of v0 and both stay live; they are views of the same
        // bits, so value chasing lets them share storage and the copy
        // becomes free.
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let pcopy = func.append_inst(b0, Opcode::ParallelCopy, &[], &[]);
        let v1 = func.append_copy_pair(pcopy, DefSpec::full(1), crate::ir::Src::read(v0));
        func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v1]);

        let domtree = DominatorTree::compute(&func);
        let liveness = Liveness::compute(&mut func);
        merge_regs(&mut func, &liveness, &domtree);
        assert!(same_set(&func, v0, v1));
    }

    #[test]
    fn lost_copy_interference_stays_separate() {
        // Loop-carried phi whose value is also read after the loop: the
        // new iteration value interferes with the phi, so the back-edge
        // copy must remain a real copy.
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        func.add_edge(b0, b1);
        func.add_edge(b1, b1);
        func.add_edge(b1, b2);
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let phi = func.append_phi(b1, DefSpec::full(1), &[Some(v0), None]);
        let vphi = func.single_dst(phi);
        let isum = func.append_inst(b1, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[vphi, vphi]);
        let vsum = func.single_dst(isum);
        func.insts[phi].srcs[1].value = vsum.into();
        func.append_inst(b2, Opcode::Store(0), &[], &[vphi]);

        run_merge(&mut func);
        let entry_arg = func.insts[phi].srcs[0].value.expand().unwrap();
        let loop_arg = func.insts[phi].srcs[1].value.expand().unwrap();
        assert!(same_set(&func, vphi, entry_arg));
        // The back-edge copy stays isolated: vphi is live past vsum's def.
        assert!(!same_set(&func, vphi, loop_arg) || !same_set(&func, loop_arg, vsum));
    }

    #[test]
    fn chase_resolves_split_of_copy() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let iv = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(4)], &[]);
        let vec = func.single_dst(iv);
        let pcopy = func.append_inst(b0, Opcode::ParallelCopy, &[], &[]);
        let copy = func.append_copy_pair(pcopy, DefSpec::full(4), crate::ir::Src::read(vec));
        let isplit = func.append_inst(b0, Opcode::Split(3), &[DefSpec::full(1)], &[copy]);
        let part = func.single_dst(isplit);
        assert_eq!(chase_value(&func, part), (vec, 6));
        assert_eq!(chase_value(&func, vec), (vec, 0));
    }

    #[test]
    fn coalescing_is_idempotent() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let iv = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(2)], &[]);
        let vec = func.single_dst(iv);
        let is0 = func.append_inst(b0, Opcode::Split(0), &[DefSpec::full(1)], &[vec]);
        let s0 = func.single_dst(is0);
        func.append_inst(b0, Opcode::Store(0), &[], &[s0]);

        let domtree = DominatorTree::compute(&func);
        let liveness = Liveness::compute(&mut func);
        merge_regs(&mut func, &liveness, &domtree);
        let first: Vec<(u32, u32)> = func
            .values
            .iter()
            .map(|(_, d)| (d.interval_start, d.interval_end))
            .collect();
        merge_regs(&mut func, &liveness, &domtree);
        let second: Vec<(u32, u32)> = func
            .values
            .iter()
            .map(|(_, d)| (d.interval_start, d.interval_end))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn half_values_use_unit_offsets() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let ia = func.append_inst(b0, Opcode::MovImm(0), &[DefSpec::half(1)], &[]);
        let a = func.single_dst(ia);
        let ib = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::half(1)], &[]);
        let b = func.single_dst(ib);
        let icol = func.append_inst(b0, Opcode::Collect, &[DefSpec::half(2)], &[a, b]);
        let col = func.single_dst(icol);
        func.append_inst(b0, Opcode::Store(0), &[], &[col]);
        run_merge(&mut func);
        assert_eq!(func.values[b].merge_set_offset, 1);
        let set = func.values[col].merge_set.expand().unwrap();
        assert_eq!(func.merge_sets[set].size, 2);
        assert_eq!(func.merge_sets[set].alignment, 1);
    }
}
