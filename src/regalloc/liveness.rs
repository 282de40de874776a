//! Liveness analysis.
//!
//! Classic backward dataflow over per-block bitsets of value names, iterated
//! to a fixpoint. Termination is guaranteed because the sets only grow.
//!
//! Phi destinations are *not* part of their block's live-in set: they occur
//! logically at the block start and the allocator treats them differently
//! from live-through values, which need a register already occupied at block
//! entry. Phi sources, conversely, are charged to the live-out set of the
//! matching predecessor rather than to the phi's own block.
//!
//! Besides the sets, the analysis tags operands in place: destinations that
//! are never read get `unused`, and the last use of a value in a block gets
//! `kill` (with `first_kill` on the first such operand of the instruction).

use crate::ir::{Block, Function, Inst, Opcode, Value};
use cranelift_entity::{EntityRef, SecondaryMap};

/// A growable bitset over value names.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ValueSet {
    words: Vec<u64>,
}

impl ValueSet {
    /// Add `value`; returns true if it was not already present.
    pub fn insert(&mut self, value: Value) -> bool {
        let (word, bit) = (value.index() / 64, value.index() % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let present = self.words[word] & (1 << bit) != 0;
        self.words[word] |= 1 << bit;
        !present
    }

    /// Remove `value`.
    pub fn remove(&mut self, value: Value) {
        let (word, bit) = (value.index() / 64, value.index() % 64);
        if word < self.words.len() {
            self.words[word] &= !(1 << bit);
        }
    }

    /// Is `value` in the set?
    pub fn contains(&self, value: Value) -> bool {
        let (word, bit) = (value.index() / 64, value.index() % 64);
        word < self.words.len() && self.words[word] & (1 << bit) != 0
    }

    /// Union `other` into `self`; returns true if `self` grew.
    pub fn union_with(&mut self, other: &ValueSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (w, &o) in self.words.iter_mut().zip(&other.words) {
            let new = *w | o;
            changed |= new != *w;
            *w = new;
        }
        changed
    }

    /// Iterate over the members in increasing name order.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            let mut w = w;
            core::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(Value::new(i * 64 + bit))
            })
        })
    }
}

/// Per-block liveness information.
pub struct Liveness {
    /// Values live at each block's entry, excluding phi destinations.
    pub live_in: SecondaryMap<Block, ValueSet>,
    /// Values live at each block's exit, including phi sources of the
    /// successors' phis.
    pub live_out: SecondaryMap<Block, ValueSet>,
}

impl Liveness {
    /// Compute liveness for `func` and tag `kill`/`first_kill`/`unused`
    /// flags on its operands.
    pub fn compute(func: &mut Function) -> Self {
        let mut live_in: SecondaryMap<Block, ValueSet> = SecondaryMap::new();
        let mut live_out: SecondaryMap<Block, ValueSet> = SecondaryMap::new();

        let mut changed = true;
        while changed {
            changed = false;
            for &block in func.layout.iter().rev() {
                let mut live = live_out[block].clone();
                for &inst in func.blocks[block].insts.iter().rev() {
                    let data = &func.insts[inst];
                    for &dst in &data.dsts {
                        live.remove(dst);
                    }
                    if data.op != Opcode::Phi {
                        for src in &data.srcs {
                            if let Some(v) = src.value.expand() {
                                live.insert(v);
                            }
                        }
                    }
                }
                changed |= live_in[block].union_with(&live);

                // Propagate into predecessors: ordinary live-ins into every
                // predecessor, phi sources only into the matching one.
                let preds = func.blocks[block].preds.clone();
                for &pred in &preds {
                    let set = live_in[block].clone();
                    changed |= live_out[pred].union_with(&set);
                }
                for &inst in &func.blocks[block].insts {
                    let data = &func.insts[inst];
                    if data.op != Opcode::Phi {
                        break;
                    }
                    for (i, src) in data.srcs.iter().enumerate() {
                        if let Some(v) = src.value.expand() {
                            changed |= live_out[preds[i]].insert(v);
                        }
                    }
                }

                // Shared values stay live along physical edges through
                // divergence reconvergence.
                let phys_preds = func.blocks[block].physical_preds.clone();
                if !phys_preds.is_empty() {
                    let shared: Vec<Value> = live_in[block]
                        .iter()
                        .filter(|&v| func.values[v].shared)
                        .collect();
                    for &pred in &phys_preds {
                        for &v in &shared {
                            changed |= live_out[pred].insert(v);
                        }
                    }
                }
            }
        }

        let liveness = Self { live_in, live_out };
        liveness.tag_flags(func);
        liveness
    }

    // Tag unused defs and killing uses.
    fn tag_flags(&self, func: &mut Function) {
        for &block in &func.layout {
            let mut live = self.live_out[block].clone();
            for i in (0..func.blocks[block].insts.len()).rev() {
                let inst = func.blocks[block].insts[i];
                let dsts = func.insts[inst].dsts.clone();
                for &dst in &dsts {
                    func.values[dst].unused = !live.contains(dst);
                    live.remove(dst);
                }
                if func.insts[inst].op == Opcode::Phi {
                    continue;
                }
                let data = &mut func.insts[inst];
                let mut seen_kill: Vec<Value> = Vec::new();
                for src in data.srcs.iter_mut() {
                    src.kill = false;
                    src.first_kill = false;
                    if let Some(v) = src.value.expand() {
                        if !live.contains(v) {
                            src.kill = true;
                            src.first_kill = !seen_kill.contains(&v);
                            seen_kill.push(v);
                        }
                    }
                }
                for src in data.srcs.iter() {
                    if let Some(v) = src.value.expand() {
                        live.insert(v);
                    }
                }
            }
        }
    }

    /// Is `def` still live after `inst`?
    ///
    /// True if `def` is live-out of `inst`'s block, or read by an
    /// instruction strictly later in the same block.
    pub fn def_live_after(&self, func: &Function, def: Value, inst: Inst) -> bool {
        let block = func.insts[inst].block.expand().expect("removed instruction");
        if self.live_out[block].contains(def) {
            return true;
        }
        let index = func.inst_index(inst);
        for &later in &func.blocks[block].insts[index + 1..] {
            let data = &func.insts[later];
            if data.op == Opcode::Phi {
                continue;
            }
            if data
                .srcs
                .iter()
                .any(|src| src.value.expand() == Some(def))
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, DefSpec, Function, Opcode};

    #[test]
    fn straight_line_kills() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        let v1 = func.single_dst(i1);
        let i2 = func.append_inst(b0, Opcode::Alu(AluOp::Mul), &[DefSpec::full(1)], &[v1, v0]);

        let live = Liveness::compute(&mut func);
        assert!(!live.live_in[b0].contains(v0));
        // v0 is read again at i2, so i1 does not kill it.
        assert!(!func.insts[i1].srcs[0].kill);
        assert!(func.insts[i2].srcs[0].kill);
        assert!(func.insts[i2].srcs[1].kill);
        // The result of i2 is never read.
        assert!(func.values[func.single_dst(i2)].unused);
        assert!(!func.values[v0].unused);
        assert!(!live.def_live_after(&func, v0, i2));
        assert!(live.def_live_after(&func, v0, i1));
    }

    #[test]
    fn first_kill_marks_first_operand_only() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Mad), &[DefSpec::full(1)], &[v0, v0]);
        Liveness::compute(&mut func);
        assert!(func.insts[i1].srcs[0].kill && func.insts[i1].srcs[0].first_kill);
        assert!(func.insts[i1].srcs[1].kill && !func.insts[i1].srcs[1].first_kill);
    }

    #[test]
    fn phi_dst_not_live_in_and_srcs_charged_to_preds() {
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
        func.append_inst(b3, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[vphi, vphi]);

        let live = Liveness::compute(&mut func);
        assert!(!live.live_in[b3].contains(vphi));
        assert!(!live.live_in[b3].contains(va));
        assert!(live.live_out[b1].contains(va));
        assert!(!live.live_out[b2].contains(va));
        assert!(live.live_out[b2].contains(vb));
    }

    #[test]
    fn loop_live_through() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        func.add_edge(b0, b1);
        func.add_edge(b1, b1);
        func.add_edge(b1, b2);
        let i0 = func.append_inst(b0, Opcode::MovImm(7), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        // v0 used only after the loop: live through the whole loop.
        func.append_inst(b1, Opcode::MovImm(0), &[DefSpec::full(1)], &[]);
        func.append_inst(b2, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        let live = Liveness::compute(&mut func);
        assert!(live.live_in[b1].contains(v0));
        assert!(live.live_out[b1].contains(v0));
        assert!(live.live_in[b2].contains(v0));
    }

    #[test]
    fn shared_values_cross_physical_edges() {
        // Diamond where the then-side consumes both values. The physical
        // edge from the else-side into the then-side models execution-mask
        // reconvergence: shared values must survive it, normal values not.
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        let b3 = func.create_block();
        func.add_edge(b0, b1);
        func.add_edge(b0, b2);
        func.add_edge(b1, b3);
        func.add_edge(b2, b3);
        func.add_physical_edge(b2, b1);
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::shared(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v1 = func.single_dst(i1);
        func.append_inst(b1, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v1]);
        let live = Liveness::compute(&mut func);
        assert!(live.live_in[b1].contains(v0));
        assert!(live.live_in[b1].contains(v1));
        // Only the shared value is charged to the physical predecessor.
        assert!(live.live_out[b2].contains(v0));
        assert!(!live.live_out[b2].contains(v1));
    }
}
