//! Post-allocation validation.
//!
//! An independent check that the allocator produced a program where every
//! read observes the value it should. We re-derive, by forward dataflow,
//! which SSA definition reaches each physical register unit at each program
//! point, mirroring the real semantics of the meta-instructions (a split or
//! parallel copy moves the records around rather than defining anything
//! new). At every genuine instruction, each source is chased through its
//! split/collect/parallel-copy defining chain to the ultimate definition
//! and offset that *should* be sitting in its assigned units, and compared
//! against what the dataflow actually recorded.
//!
//! A mismatch is a compiler bug, never a property of the input program, so
//! it aborts with a full program dump. The pass only runs in debug builds.
//!
//! The lattice per unit is `Unknown ⊑ {Undef, Def} ⊑ Overdef`. `Overdef`
//! means two control-flow paths merged different definitions into one slot;
//! that is legal on its own, but reading such a unit is not.

use crate::ir::{Block, Function, Inst, Opcode, Value};
use crate::regalloc::{value_file, FileKind, FileSizes};
use cranelift_entity::SecondaryMap;

/// What one physical register unit holds at one program point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegState {
    /// Not yet computed (bottom).
    Unknown,
    /// No value written on this path.
    Undef,
    /// Conflicting definitions merged here.
    Overdef,
    /// The unit holds this unit of this definition.
    Def(Value, u32),
}

impl RegState {
    fn join(self, other: RegState) -> RegState {
        match (self, other) {
            (RegState::Unknown, x) | (x, RegState::Unknown) => x,
            (RegState::Undef, x) | (x, RegState::Undef) => x,
            (a, b) if a == b => a,
            _ => RegState::Overdef,
        }
    }
}

#[derive(Clone, PartialEq)]
struct States {
    full: Vec<RegState>,
    half: Vec<RegState>,
    shared: Vec<RegState>,
}

impl States {
    fn new(sizes: FileSizes) -> Self {
        Self {
            full: vec![RegState::Undef; sizes.full as usize],
            half: vec![RegState::Undef; sizes.half as usize],
            shared: vec![RegState::Undef; sizes.shared as usize],
        }
    }

    fn file(&self, kind: FileKind) -> &Vec<RegState> {
        match kind {
            FileKind::Full => &self.full,
            FileKind::Half => &self.half,
            FileKind::Shared => &self.shared,
        }
    }

    fn file_mut(&mut self, kind: FileKind) -> &mut Vec<RegState> {
        match kind {
            FileKind::Full => &mut self.full,
            FileKind::Half => &mut self.half,
            FileKind::Shared => &mut self.shared,
        }
    }

    fn join_with(&mut self, other: &States) {
        for (a, b) in self.full.iter_mut().zip(&other.full) {
            *a = a.join(*b);
        }
        for (a, b) in self.half.iter_mut().zip(&other.half) {
            *a = a.join(*b);
        }
        for (a, b) in self.shared.iter_mut().zip(&other.shared) {
            *a = a.join(*b);
        }
    }
}

/// Verify every physical-register-to-value mapping in an allocated `func`.
///
/// Panics with a program dump on the first mismatch.
pub fn validate(func: &Function, sizes: FileSizes, merged_regs: bool) {
    let v = Validator {
        func,
        sizes,
        merged_regs,
    };
    v.run();
}

struct Validator<'a> {
    func: &'a Function,
    sizes: FileSizes,
    merged_regs: bool,
}

impl<'a> Validator<'a> {
    fn run(&self) {
        // Forward dataflow to a fixpoint over block exit states. The state
        // only climbs the lattice, so this terminates.
        let mut out: SecondaryMap<Block, Option<States>> = SecondaryMap::new();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in &self.func.layout {
                let mut state = self.entry_state(block, &out);
                for &inst in &self.func.blocks[block].insts {
                    self.propagate(inst, &mut state);
                }
                if out[block].as_ref() != Some(&state) {
                    out[block] = Some(state);
                    changed = true;
                }
            }
        }

        // With stable states, run the actual checks.
        for &block in &self.func.layout {
            let mut state = self.entry_state(block, &out);
            for &inst in &self.func.blocks[block].insts {
                self.check(inst, &state);
                self.propagate(inst, &mut state);
            }
        }
    }

    fn entry_state(&self, block: Block, out: &SecondaryMap<Block, Option<States>>) -> States {
        let mut state: Option<States> = None;
        let preds = self.func.blocks[block]
            .preds
            .iter()
            .chain(&self.func.blocks[block].physical_preds);
        for &pred in preds {
            if let Some(pred_out) = &out[pred] {
                match &mut state {
                    None => state = Some(pred_out.clone()),
                    Some(s) => s.join_with(pred_out),
                }
            }
        }
        state.unwrap_or_else(|| States::new(self.sizes))
    }

    fn value_units(&self, state: &States, value: Value, num: u32, size: u32) -> Vec<RegState> {
        let kind = value_file(self.func, value, self.merged_regs);
        let file = state.file(kind);
        (num..num + size)
            .map(|i| file.get(i as usize).copied().unwrap_or(RegState::Undef))
            .collect()
    }

    fn write_units(&self, state: &mut States, value: Value, num: u32, units: &[RegState]) {
        let kind = value_file(self.func, value, self.merged_regs);
        let file = state.file_mut(kind);
        for (i, &u) in units.iter().enumerate() {
            let idx = num as usize + i;
            if idx < file.len() {
                file[idx] = u;
            }
        }
    }

    fn define(&self, state: &mut States, value: Value) {
        let num = u32::from(self.func.values[value].num.expect("unallocated destination"));
        let size = self.func.reg_size(value);
        let units: Vec<RegState> = (0..size).map(|i| RegState::Def(value, i)).collect();
        self.write_units(state, value, num, &units);
    }

    fn propagate(&self, inst: Inst, state: &mut States) {
        let data = &self.func.insts[inst];
        match data.op {
            Opcode::Phi => {
                // A phi joins distinct definitions by construction; treat
                // its destination as a fresh definition at block top.
                self.define(state, data.dsts[0]);
            }
            Opcode::ParallelCopy => {
                // Simultaneous semantics: snapshot all sources, then write.
                let mut snapshots = Vec::with_capacity(data.srcs.len());
                for (i, src) in data.srcs.iter().enumerate() {
                    let dst = data.dsts[i];
                    let size = self.func.reg_size(dst);
                    match (src.value.expand(), src.num) {
                        (Some(v), Some(num)) => {
                            snapshots.push(self.value_units(state, v, num.into(), size));
                        }
                        _ => snapshots.push(vec![RegState::Undef; size as usize]),
                    }
                }
                for (i, units) in snapshots.into_iter().enumerate() {
                    let dst = data.dsts[i];
                    let num = u32::from(self.func.values[dst].num.expect("unallocated copy dst"));
                    self.write_units(state, dst, num, &units);
                }
            }
            Opcode::Split(comp) => {
                let dst = data.dsts[0];
                let size = self.func.reg_size(dst);
                let src = data.srcs[0].value.expand().expect("split of undef");
                let base = u32::from(data.srcs[0].num.expect("unassigned split source"))
                    + u32::from(comp) * self.func.elem_size(dst);
                let units = self.value_units(state, src, base, size);
                let num = u32::from(self.func.values[dst].num.expect("unallocated split dst"));
                self.write_units(state, dst, num, &units);
            }
            Opcode::Collect => {
                let dst = data.dsts[0];
                let elem = self.func.elem_size(dst);
                let mut units = Vec::with_capacity(self.func.reg_size(dst) as usize);
                for src in &data.srcs {
                    match (src.value.expand(), src.num) {
                        (Some(v), Some(num)) => {
                            let size = self.func.reg_size(v);
                            units.extend(self.value_units(state, v, num.into(), size));
                        }
                        _ => units.extend(vec![RegState::Undef; elem as usize]),
                    }
                }
                let num = u32::from(self.func.values[dst].num.expect("unallocated collect dst"));
                self.write_units(state, dst, num, &units);
            }
            Opcode::SpillMacro(_) => {}
            _ => {
                for &dst in &data.dsts {
                    self.define(state, dst);
                }
            }
        }
    }

    fn check(&self, inst: Inst, state: &States) {
        let data = &self.func.insts[inst];
        // Meta instructions only move records around; reloads read memory.
        if data.op.is_meta() || matches!(data.op, Opcode::ReloadMacro(_)) {
            return;
        }
        for src in &data.srcs {
            let value = match src.value.expand() {
                Some(v) => v,
                None => continue,
            };
            let num = u32::from(src.num.expect("unassigned source"));
            let size = self.func.reg_size(value);
            let actual = self.value_units(state, value, num, size);
            for k in 0..size {
                let (root, unit) = chase_unit(self.func, value, k);
                let expected = RegState::Def(root, unit);
                if actual[k as usize] != expected {
                    panic!(
                        "register allocation error: {} unit {} of {} expected {:?}, found {:?}\n{}",
                        self.func.display_inst(inst),
                        k,
                        value,
                        expected,
                        actual[k as usize],
                        self.func
                    );
                }
            }
        }
    }
}

// Follow `unit` of `value` through the meta-instruction chain to the real
// definition whose bits should be there.
fn chase_unit(func: &Function, value: Value, unit: u32) -> (Value, u32) {
    let mut v = value;
    let mut unit = unit;
    loop {
        let inst = func.def_inst(v);
        let data = &func.insts[inst];
        match data.op {
            Opcode::Split(comp) => {
                let src = match data.srcs[0].value.expand() {
                    Some(s) => s,
                    None => return (v, unit),
                };
                unit += u32::from(comp) * func.elem_size(v);
                v = src;
            }
            Opcode::Collect => {
                let elem = func.elem_size(v);
                let mut off = unit;
                let mut next = None;
                for src in &data.srcs {
                    let size = match src.value.expand() {
                        Some(sv) => func.reg_size(sv),
                        None => elem,
                    };
                    if off < size {
                        next = src.value.expand().map(|sv| (sv, off));
                        break;
                    }
                    off -= size;
                }
                match next {
                    Some((sv, o)) => {
                        v = sv;
                        unit = o;
                    }
                    None => return (v, unit),
                }
            }
            Opcode::ParallelCopy => {
                let idx = data
                    .dsts
                    .iter()
                    .position(|&d| d == v)
                    .expect("value not defined by its instruction");
                match data.srcs[idx].value.expand() {
                    Some(s) => v = s,
                    None => return (v, unit),
                }
            }
            _ => return (v, unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{AluOp, DefSpec, Function, Opcode};
    use crate::regalloc::alloc::allocate;
    use crate::regalloc::liveness::Liveness;
    use crate::regalloc::merge::{create_parallel_copies, merge_regs};

    fn alloc_and_sizes(func: &mut Function) -> FileSizes {
        let domtree = DominatorTree::compute(func);
        create_parallel_copies(func);
        let live = Liveness::compute(func);
        merge_regs(func, &live, &domtree);
        let sizes = FileSizes {
            full: 64,
            half: 0,
            shared: 16,
        };
        allocate(func, &live, sizes, true);
        sizes
    }

    #[test]
    fn accepts_straight_line_program() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        let v1 = func.single_dst(i1);
        func.append_inst(b0, Opcode::Store(0), &[], &[v1]);
        let sizes = alloc_and_sizes(&mut func);
        validate(&func, sizes, true);
    }

    #[test]
    fn accepts_split_collect_chain() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let iv = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(2)], &[]);
        let vec = func.single_dst(iv);
        let is0 = func.append_inst(b0, Opcode::Split(0), &[DefSpec::full(1)], &[vec]);
        let s0 = func.single_dst(is0);
        let is1 = func.append_inst(b0, Opcode::Split(1), &[DefSpec::full(1)], &[vec]);
        let s1 = func.single_dst(is1);
        let ic = func.append_inst(b0, Opcode::Collect, &[DefSpec::full(2)], &[s0, s1]);
        let col = func.single_dst(ic);
        func.append_inst(b0, Opcode::Store(0), &[], &[col]);
        let sizes = alloc_and_sizes(&mut func);
        validate(&func, sizes, true);
    }

    #[test]
    fn accepts_diamond_with_phi() {
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
        let sizes = alloc_and_sizes(&mut func);
        validate(&func, sizes, true);
    }

    #[test]
    #[should_panic(expected = "register allocation error")]
    fn rejects_corrupted_assignment() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::MovImm(2), &[DefSpec::full(1)], &[]);
        let v1 = func.single_dst(i1);
        let istore = func.append_inst(b0, Opcode::Store(0), &[], &[v0, v1]);
        let sizes = alloc_and_sizes(&mut func);
        // Pretend the store reads v0 from v1's register.
        let wrong = func.values[v1].num;
        func.insts[istore].srcs[0].num = wrong;
        validate(&func, sizes, true);
    }
}
