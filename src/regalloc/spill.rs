//! Register pressure calculation and the spilling pass.
//!
//! The pressure calculator reuses the interval forest in a counting-only
//! mode: hooks add and subtract top-level interval sizes, and the running
//! peak is the register demand the allocator will face. When the peak
//! exceeds the budget, the spiller rewrites the program with explicit
//! spill/reload (or rematerialize) operations until it fits.
//!
//! Spill candidates are ranked by *next-use distance* in the Belady
//! tradition: at any program point the resident value whose next read is
//! farthest away is the cheapest to move out. Distances are measured in
//! execution-cycle estimates and propagated backward across the block graph
//! to a fixpoint, with loop-exit edges penalized by a large constant so a
//! value used only after a loop loses to values the loop actually touches;
//! without the bias we would spill and reload the same loop-carried value
//! every iteration.
//!
//! Cross-block state follows the structure of the allocator itself: a block
//! with a single predecessor inherits its exact residency, join blocks merge
//! their predecessors' decisions (inserting reloads on the edges that lack a
//! value, and a phi when predecessors disagree on its current name), and
//! loop headers record their expected entry state so the back-edge
//! predecessor can be reconciled when it is finally visited. Phis created
//! for reconciliation collapse away again when every edge agrees.
//!
//! Spilling invalidates coalescing wholesale, so the caller rebuilds merge
//! sets and liveness from scratch afterwards.

use crate::dominator_tree::DominatorTree;
use crate::ir::{Block, DefSpec, Function, Inst, Opcode, Src, Value};
use crate::regalloc::interval::{NullHooks, RegTree, RegTreeHooks};
use crate::regalloc::liveness::Liveness;
use crate::regalloc::Pressure;
use crate::trace;
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashMap;

// Cycle penalty for leaving a loop, per nesting level.
const LOOP_EXIT_BIAS: u32 = 100_000;

// A value with no further use.
const DEAD: u32 = u32::MAX;

/// Execution-cycle estimate for one instruction. Meta instructions only
/// cost the sub-copies that aren't pure renames.
fn inst_cost(func: &Function, inst: Inst) -> u32 {
    let data = &func.insts[inst];
    match data.op {
        Opcode::Phi => 0,
        Opcode::Split(_) | Opcode::Collect | Opcode::ParallelCopy => {
            let mut cost = 0;
            for (i, src) in data.srcs.iter().enumerate() {
                let v = match src.value.expand() {
                    Some(v) => v,
                    None => continue,
                };
                let dst = match data.op {
                    Opcode::ParallelCopy => data.dsts[i],
                    _ => data.dsts[0],
                };
                let same_set = func.values[v].merge_set.is_some()
                    && func.values[v].merge_set == func.values[dst].merge_set;
                if !same_set {
                    cost += 1;
                }
            }
            cost
        }
        _ => 1 + u32::from(data.repeat),
    }
}

// Pressure counters driven by interval forest hooks. Class flags are
// snapshotted up front so the hooks don't need the function.
struct PressureHooks {
    merged: bool,
    half: SecondaryMap<Value, bool>,
    shared: SecondaryMap<Value, bool>,
    cur: Pressure,
    max: Pressure,
}

impl PressureHooks {
    fn new(func: &Function, merged: bool) -> Self {
        let mut half = SecondaryMap::new();
        let mut shared = SecondaryMap::new();
        for (v, data) in func.values.iter() {
            half[v] = data.half;
            shared[v] = data.shared;
        }
        Self {
            merged,
            half,
            shared,
            cur: Pressure::default(),
            max: Pressure::default(),
        }
    }

    fn add(&mut self, value: Value, size: u32) {
        if self.shared[value] {
            self.cur.shared += size;
        } else {
            if self.half[value] {
                self.cur.half += size;
            }
            if !self.half[value] || self.merged {
                self.cur.full += size;
            }
        }
        self.max.full = self.max.full.max(self.cur.full);
        self.max.half = self.max.half.max(self.cur.half);
        self.max.shared = self.max.shared.max(self.cur.shared);
    }

    fn sub(&mut self, value: Value, size: u32) {
        if self.shared[value] {
            self.cur.shared -= size;
        } else {
            if self.half[value] {
                self.cur.half -= size;
            }
            if !self.half[value] || self.merged {
                self.cur.full -= size;
            }
        }
    }
}

impl RegTreeHooks for PressureHooks {
    fn interval_add(&mut self, value: Value, start: u32, end: u32) {
        self.add(value, end - start);
    }

    fn interval_delete(&mut self, value: Value, start: u32, end: u32) {
        self.sub(value, end - start);
    }

    fn interval_readd(
        &mut self,
        _parent: Value,
        _parent_start: u32,
        child: Value,
        child_start: u32,
        child_end: u32,
    ) {
        self.add(child, child_end - child_start);
    }
}

/// Compute the peak register pressure of `func` per register file.
///
/// Read-only: this is the same walk the spiller performs, with the forest
/// hooks only counting.
pub fn calc_pressure(func: &Function, liveness: &Liveness, merged_regs: bool) -> Pressure {
    let mut tree = RegTree::new();
    let mut hooks = PressureHooks::new(func, merged_regs);

    for &block in &func.layout {
        tree.clear();
        hooks.cur = Pressure::default();
        for v in liveness.live_in[block].iter() {
            let d = &func.values[v];
            tree.init(v, d.interval_start, d.interval_end, d.half);
            tree.insert(&mut hooks, v);
        }
        for &inst in &func.blocks[block].insts {
            let data = &func.insts[inst];
            match data.op {
                Opcode::Phi => {
                    let dst = data.dsts[0];
                    let d = &func.values[dst];
                    tree.init(dst, d.interval_start, d.interval_end, d.half);
                    tree.insert(&mut hooks, dst);
                    continue;
                }
                Opcode::ParallelCopy => {
                    // Decomposed into per-source temporaries by the spiller;
                    // never materialized all at once.
                    continue;
                }
                _ => {}
            }
            for src in data.srcs.iter().rev() {
                if let Some(v) = src.value.expand() {
                    if src.first_kill && tree.is_inserted(v) {
                        tree.remove(&mut hooks, v);
                    }
                }
            }
            let dsts = data.dsts.clone();
            for &dst in &dsts {
                let d = &func.values[dst];
                tree.init(dst, d.interval_start, d.interval_end, d.half);
                tree.insert(&mut hooks, dst);
            }
            for &dst in &dsts {
                if func.values[dst].unused && tree.is_inserted(dst) {
                    tree.remove(&mut hooks, dst);
                }
            }
        }
    }
    hooks.max
}

/// Calculate the minimum pressure limit under which spilling can still
/// succeed. Used by the spill-everything debug option to stress the
/// spiller as hard as possible.
pub fn calc_min_limit_pressure(
    func: &Function,
    liveness: &Liveness,
    merged_regs: bool,
) -> Pressure {
    let mut limit = Pressure::default();
    let mut tree = RegTree::new();
    let mut hooks = NullHooks;

    let add = |p: &mut Pressure, func: &Function, v: Value, size: u32| {
        if func.values[v].shared {
            p.shared += size;
        } else {
            if func.values[v].half {
                p.half += size;
            }
            if !func.values[v].half || merged_regs {
                p.full += size;
            }
        }
    };

    // All inputs are live at once at the top of the entry block, and
    // precolored inputs may leave holes below them.
    let entry = func.entry_block();
    let mut cur = Pressure::default();
    for &inst in &func.blocks[entry].insts {
        if func.insts[inst].op != Opcode::Input {
            break;
        }
        let dst = func.single_dst(inst);
        add(&mut cur, func, dst, func.reg_size(dst));
        if let Some(p) = func.values[dst].precolored {
            let end = u32::from(p) + func.reg_size(dst);
            if func.values[dst].half {
                limit.half = limit.half.max(end);
            }
            if !func.values[dst].half || merged_regs {
                limit.full = limit.full.max(end);
            }
        }
    }
    limit.full = limit.full.max(cur.full);
    limit.half = limit.half.max(cur.half);
    limit.shared = limit.shared.max(cur.shared);

    for &block in &func.layout {
        tree.clear();
        for v in liveness.live_in[block].iter() {
            let d = &func.values[v];
            tree.init(v, d.interval_start, d.interval_end, d.half);
            tree.insert(&mut hooks, v);
        }
        for &inst in &func.blocks[block].insts {
            let data = &func.insts[inst];
            match data.op {
                Opcode::Phi => {
                    let dst = data.dsts[0];
                    let d = &func.values[dst];
                    tree.init(dst, d.interval_start, d.interval_end, d.half);
                    tree.insert(&mut hooks, dst);
                    continue;
                }
                // Phis and parallel copies can be deleted via spilling.
                Opcode::ParallelCopy => continue,
                _ => {}
            }

            let mut cur = Pressure::default();
            for &dst in &data.dsts {
                if let Some(t) = func.values[dst].tied {
                    if !data.srcs[t as usize].kill {
                        add(&mut cur, func, dst, func.reg_size(dst));
                    }
                }
            }
            // Sources can't be spilled separately from their enclosing
            // interval, so charge the root of each source's tree.
            for src in data.srcs.iter().rev() {
                if let Some(v) = src.value.expand() {
                    let root = tree.root(v);
                    add(&mut cur, func, root, func.reg_size(root));
                    if src.first_kill && tree.is_inserted(v) {
                        tree.remove(&mut hooks, v);
                    }
                }
            }
            limit.full = limit.full.max(cur.full);
            limit.half = limit.half.max(cur.half);
            limit.shared = limit.shared.max(cur.shared);

            let mut cur = Pressure::default();
            for &dst in &data.dsts {
                let d = &func.values[dst];
                tree.init(dst, d.interval_start, d.interval_end, d.half);
                tree.insert(&mut hooks, dst);
                add(&mut cur, func, dst, func.reg_size(dst));
            }
            limit.full = limit.full.max(cur.full);
            limit.half = limit.half.max(cur.half);
            limit.shared = limit.shared.max(cur.shared);
        }
    }

    // The spill base address register must fit everywhere too.
    limit.full += 2;
    limit
}

// Next-use distances, per block.
struct NextUse {
    // Distance from block start to the first use at or after it.
    at_start: SecondaryMap<Block, FxHashMap<Value, u32>>,
    // Distance from block end (across successors).
    at_end: SecondaryMap<Block, FxHashMap<Value, u32>>,
    // Instruction-position list of uses inside each block.
    uses: SecondaryMap<Block, FxHashMap<Value, Vec<u32>>>,
    block_len: SecondaryMap<Block, u32>,
    loop_depth: SecondaryMap<Block, u32>,
}

impl NextUse {
    fn compute(func: &Function, liveness: &Liveness, domtree: &DominatorTree) -> Self {
        let mut this = Self {
            at_start: SecondaryMap::new(),
            at_end: SecondaryMap::new(),
            uses: SecondaryMap::new(),
            block_len: SecondaryMap::new(),
            loop_depth: SecondaryMap::new(),
        };
        this.compute_loop_depth(func, domtree);

        for &block in &func.layout {
            let mut ip = 0;
            for &inst in &func.blocks[block].insts {
                if func.insts[inst].op != Opcode::Phi {
                    for src in &func.insts[inst].srcs {
                        if let Some(v) = src.value.expand() {
                            this.uses[block].entry(v).or_default().push(ip);
                        }
                    }
                }
                ip += inst_cost(func, inst);
            }
            this.block_len[block] = ip;
        }

        // Backward fixpoint across the graph. Distances only shrink, over a
        // finite set of values, so this terminates.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in func.layout.iter().rev() {
                let mut at_end: FxHashMap<Value, u32> = FxHashMap::default();
                for &succ in &func.blocks[block].succs {
                    let bias = LOOP_EXIT_BIAS
                        * this.loop_depth[block].saturating_sub(this.loop_depth[succ]);
                    for (&v, &d) in &this.at_start[succ] {
                        let d = d.saturating_add(bias);
                        let entry = at_end.entry(v).or_insert(DEAD);
                        *entry = (*entry).min(d);
                    }
                }
                let mut at_start: FxHashMap<Value, u32> = FxHashMap::default();
                for v in liveness.live_in[block].iter() {
                    let d = match this.uses[block].get(&v).and_then(|u| u.first()) {
                        Some(&first) => first,
                        None => this.block_len[block]
                            .saturating_add(*at_end.get(&v).unwrap_or(&DEAD)),
                    };
                    at_start.insert(v, d);
                }
                if at_start != this.at_start[block] {
                    this.at_start[block] = at_start;
                    changed = true;
                }
                this.at_end[block] = at_end;
            }
        }
        this
    }

    fn compute_loop_depth(&mut self, func: &Function, domtree: &DominatorTree) {
        for &block in &func.layout {
            for &succ in &func.blocks[block].succs {
                if !domtree.dominates(succ, block) {
                    continue;
                }
                // Natural loop of the back edge block -> succ.
                let header = succ;
                let mut stack = vec![block];
                let mut in_loop = vec![header, block];
                while let Some(b) = stack.pop() {
                    if b == header {
                        continue;
                    }
                    for &pred in &func.blocks[b].preds {
                        if !in_loop.contains(&pred) {
                            in_loop.push(pred);
                            stack.push(pred);
                        }
                    }
                }
                in_loop.sort();
                in_loop.dedup();
                for b in in_loop {
                    self.loop_depth[b] += 1;
                }
            }
        }
    }

    // Distance from instruction position `ip` in `block` to the next use
    // of `value`.
    fn distance(&self, block: Block, value: Value, ip: u32) -> u32 {
        if let Some(uses) = self.uses[block].get(&value) {
            if let Some(&next) = uses.iter().find(|&&u| u >= ip) {
                return next - ip;
            }
        }
        let tail = self.block_len[block] - ip;
        tail.saturating_add(*self.at_end[block].get(&value).unwrap_or(&DEAD))
    }
}

#[derive(Clone, Default)]
struct SpillBlockState {
    visited: bool,
    // Values resident in registers at block end, mapped to their current
    // SSA name (differs from the key after a reload or a reconciling phi).
    resident: FxHashMap<Value, Value>,
    // For loop headers: the phi created per expected-resident value, so a
    // back edge visited later can disagree about its current name.
    entry_phis: FxHashMap<Value, Inst>,
}

/// The spilling pass. Returns true if anything was spilled or rewritten.
///
/// On return the program's merge sets and liveness are stale; the caller
/// must rebuild both before allocating.
pub fn spill(
    func: &mut Function,
    liveness: &Liveness,
    domtree: &DominatorTree,
    limit: &Pressure,
    merged_regs: bool,
) -> bool {
    let next_use = NextUse::compute(func, liveness, domtree);
    let entry = func.entry_block();
    let mut ctx = SpillCtx {
        hooks: PressureHooks::new(func, merged_regs),
        func,
        liveness,
        next_use,
        limit: *limit,
        tree: RegTree::new(),
        resident: FxHashMap::default(),
        spilled: SecondaryMap::new(),
        slots: FxHashMap::default(),
        slot_cursor: 0,
        blocks: SecondaryMap::new(),
        created_phis: Vec::new(),
        changed: false,
        block: entry,
        ip: 0,
    };
    for i in 0..ctx.func.layout.len() {
        let block = ctx.func.layout[i];
        ctx.handle_block(block);
    }
    ctx.collapse_trivial_phis();
    ctx.changed
}

struct SpillCtx<'a> {
    func: &'a mut Function,
    liveness: &'a Liveness,
    next_use: NextUse,
    limit: Pressure,
    tree: RegTree,
    hooks: PressureHooks,
    // Original value -> current in-register name.
    resident: FxHashMap<Value, Value>,
    // The value has a memory copy (or can be rematerialized on demand).
    spilled: SecondaryMap<Value, bool>,
    // Spill slots for values outside any merge set.
    slots: FxHashMap<Value, u32>,
    slot_cursor: u32,
    blocks: SecondaryMap<Block, SpillBlockState>,
    created_phis: Vec<Inst>,
    changed: bool,
    block: Block,
    ip: u32,
}

impl<'a> SpillCtx<'a> {
    fn over_limit(&self, extra: Pressure) -> bool {
        self.hooks.cur.full + extra.full > self.limit.full
            || self.hooks.cur.half + extra.half > self.limit.half
            || self.hooks.cur.shared + extra.shared > self.limit.shared
    }

    // The per-class footprint of one value.
    fn pressure_of(&self, value: Value) -> Pressure {
        let size = self.func.reg_size(value);
        let d = &self.func.values[value];
        let mut p = Pressure::default();
        if d.shared {
            p.shared = size;
        } else {
            if d.half {
                p.half = size;
            }
            if !d.half || self.hooks.merged {
                p.full = size;
            }
        }
        p
    }

    fn insert_resident(&mut self, value: Value, name: Value) {
        if self.resident.contains_key(&value) {
            return;
        }
        let d = &self.func.values[value];
        self.tree.init(value, d.interval_start, d.interval_end, d.half);
        self.tree.insert(&mut self.hooks, value);
        self.resident.insert(value, name);
    }

    fn remove_resident(&mut self, value: Value) {
        if self.resident.remove(&value).is_some() && self.tree.is_inserted(value) {
            self.tree.remove(&mut self.hooks, value);
        }
    }

    fn current_name(&self, value: Value) -> Value {
        *self.resident.get(&value).unwrap_or(&value)
    }

    fn can_rematerialize(&self, value: Value) -> bool {
        self.func.insts[self.func.def_inst(value)]
            .op
            .is_rematerializable()
    }

    // Spill slot unit address for `value`, allocating on first use. Values
    // in a merge set spill the whole set to one slot so split/collect
    // relationships survive the round trip.
    fn slot_for(&mut self, value: Value) -> u32 {
        if let Some(set) = self.func.values[value].merge_set.expand() {
            let base = match self.func.merge_sets[set].spill_slot {
                Some(b) => b,
                None => {
                    let b = self.slot_cursor;
                    self.slot_cursor += self.func.merge_sets[set].size.max(2);
                    self.func.merge_sets[set].spill_slot = Some(b);
                    b
                }
            };
            base + self.func.values[value].merge_set_offset
        } else {
            match self.slots.get(&value) {
                Some(&b) => b,
                None => {
                    let b = self.slot_cursor;
                    self.slot_cursor += self.func.reg_size(value).max(2);
                    self.slots.insert(value, b);
                    b
                }
            }
        }
    }

    // Emit the store of `value`, read under `name`, at instruction index
    // `index` of `block` (block end when `index` is None). No store is
    // needed for rematerializable values without merge-set dependents.
    fn emit_spill_named(&mut self, value: Value, name: Value, index: Option<usize>, block: Block) {
        if self.spilled[value] {
            return;
        }
        self.spilled[value] = true;
        let standalone = match self.func.values[value].merge_set.expand() {
            Some(set) => self.func.merge_sets[set].regs.len() <= 1,
            None => true,
        };
        if self.can_rematerialize(value) && standalone {
            trace!("{} marked rematerializable, no store", value);
            return;
        }
        let slot = self.slot_for(value);
        let index = index.unwrap_or(self.func.blocks[block].insts.len());
        self.func.insert_inst(
            block,
            index,
            Opcode::SpillMacro(slot),
            &[],
            &[Src::read(name)],
        );
        self.changed = true;
        trace!("spilled {} (as {}) to slot {}", value, name, slot);
    }

    // Approximate pressure at the recorded end of a finished block. Nested
    // members count too, so this only ever overestimates.
    fn block_end_pressure(&self, block: Block) -> Pressure {
        let mut p = Pressure::default();
        for &v in self.blocks[block].resident.keys() {
            let q = self.pressure_of(v);
            p.full += q.full;
            p.half += q.half;
            p.shared += q.shared;
        }
        p
    }

    // Make room for `value` at the end of a finished block before an edge
    // reload, spilling residents not named in `keep`.
    fn make_room_at_end(&mut self, block: Block, value: Value, keep: &[Value]) {
        loop {
            let p = self.block_end_pressure(block);
            let q = self.pressure_of(value);
            if p.full + q.full <= self.limit.full
                && p.half + q.half <= self.limit.half
                && p.shared + q.shared <= self.limit.shared
            {
                return;
            }
            let end = self.next_use.block_len[block];
            let victim = self.blocks[block]
                .resident
                .keys()
                .copied()
                .filter(|v| {
                    *v != value
                        && !keep.contains(v)
                        && !self.func.values[*v].shared
                        && self.func.insts[self.func.def_inst(*v)].op != Opcode::ParallelCopy
                })
                .max_by_key(|&v| self.next_use.distance(block, v, end));
            let victim = match victim {
                Some(v) => v,
                None => return,
            };
            let name = self.blocks[block].resident[&victim];
            self.emit_spill_named(victim, name, None, block);
            self.blocks[block].resident.remove(&victim);
        }
    }

    // Evict resident values until the counters, plus `extra` units about to
    // arrive, fit the budget. `protect` is never evicted. Spills are
    // inserted before instruction `index` in the current block.
    fn enforce_limit_with(&mut self, extra: Pressure, protect: &[Value], index: usize) {
        while self.over_limit(extra) {
            let full_over = self.hooks.cur.full + extra.full > self.limit.full;
            let half_over = self.hooks.cur.half + extra.half > self.limit.half;

            let mut best: Option<(Value, u32, bool)> = None;
            for &cand in self.tree.top_level() {
                if protect.contains(&cand) || !self.tree.children(cand).is_empty() {
                    continue;
                }
                // Phi-argument copies live for exactly one edge; spilling
                // one would tear the phi web apart.
                if self.func.insts[self.func.def_inst(cand)].op == Opcode::ParallelCopy {
                    continue;
                }
                let d = &self.func.values[cand];
                // Shared values can't be spilled; the relevant class must
                // actually shrink.
                let relevant = if d.shared {
                    false
                } else if d.half {
                    half_over || (self.hooks.merged && full_over)
                } else {
                    full_over
                };
                if !relevant {
                    continue;
                }
                let block = self.block;
                let dist = self.next_use.distance(block, cand, self.ip);
                let remat = self.can_rematerialize(cand);
                let better = match best {
                    None => true,
                    Some((_, bd, br)) => dist > bd || (dist == bd && remat && !br),
                };
                if better {
                    best = Some((cand, dist, remat));
                }
            }
            let (victim, dist, _) = match best {
                Some(b) => b,
                // Nothing evictable: either everything is protected or the
                // overage is in the shared file. The post-spill pressure
                // check reports it.
                None => break,
            };
            trace!("evicting {} (next use {})", victim, dist);
            let block = self.block;
            let name = self.current_name(victim);
            self.emit_spill_named(victim, name, Some(index), block);
            self.remove_resident(victim);
        }
    }

    fn enforce_limit(&mut self, protect: &[Value], index: usize) {
        self.enforce_limit_with(Pressure::default(), protect, index);
    }

    // Make `value` resident again before instruction `index`, preferring a
    // derive from a live merge-set parent, then rematerialization, then a
    // real reload.
    fn reload(&mut self, value: Value, index: usize) -> Value {
        let block = self.block;
        // Derive from a resident enclosing member of the same merge set at
        // zero memory cost.
        if self.func.values[value].comps == 1 {
            if let Some(set) = self.func.values[value].merge_set.expand() {
                let off = self.func.values[value].merge_set_offset;
                let size = self.func.reg_size(value);
                let member = self.func.merge_sets[set].regs.iter().copied().find(|&m| {
                    m != value
                        && self.resident.contains_key(&m)
                        && self.func.values[m].merge_set_offset <= off
                        && off + size
                            <= self.func.values[m].merge_set_offset + self.func.reg_size(m)
                });
                if let Some(m) = member {
                    let elem = self.func.elem_size(value);
                    let comp = (off - self.func.values[m].merge_set_offset) / elem;
                    let name = self.current_name(m);
                    let inst = self.func.insert_inst(
                        block,
                        index,
                        Opcode::Split(comp as u16),
                        &[DefSpec::like(self.func, value)],
                        &[Src::read(name)],
                    );
                    let new = self.func.single_dst(inst);
                    trace!("derived {} from resident {} as {}", value, m, new);
                    self.changed = true;
                    return new;
                }
            }
        }
        if self.can_rematerialize(value) {
            let op = self.func.insts[self.func.def_inst(value)].op;
            let inst = self.func.insert_inst(
                block,
                index,
                op,
                &[DefSpec::like(self.func, value)],
                &[],
            );
            let new = self.func.single_dst(inst);
            trace!("rematerialized {} as {}", value, new);
            self.changed = true;
            return new;
        }
        let slot = self.slot_for(value);
        let inst = self.func.insert_inst(
            block,
            index,
            Opcode::ReloadMacro(slot),
            &[DefSpec::like(self.func, value)],
            &[],
        );
        let new = self.func.single_dst(inst);
        trace!("reloaded {} from slot {} as {}", value, slot, new);
        self.changed = true;
        new
    }

    fn handle_block(&mut self, block: Block) {
        self.block = block;
        self.ip = 0;
        self.tree.clear();
        self.hooks.cur = Pressure::default();
        self.resident.clear();

        self.compute_entry_state(block);

        let insts: Vec<Inst> = self.func.blocks[block].insts.clone();
        for inst in insts {
            // Skip anything another block's reconciliation appended.
            if self.func.insts[inst].block.expand() != Some(block) {
                continue;
            }
            let cost = inst_cost(self.func, inst);
            match self.func.insts[inst].op {
                // Reconciling phis we created ourselves are already
                // accounted for by the entry state.
                Opcode::Phi if self.created_phis.contains(&inst) => {}
                Opcode::Phi => {
                    let dst = self.func.single_dst(inst);
                    // The arguments die here; the destination is born.
                    let srcs: Vec<Value> = self.func.insts[inst]
                        .srcs
                        .iter()
                        .filter_map(|s| s.value.expand())
                        .collect();
                    for v in srcs {
                        self.remove_resident(v);
                    }
                    let index = self.func.inst_index(inst);
                    self.insert_resident(dst, dst);
                    self.enforce_limit(&[dst], index);
                }
                Opcode::ParallelCopy => self.handle_pcopy(inst),
                _ => self.handle_normal(inst),
            }
            self.ip += cost;
        }

        self.blocks[block].visited = true;
        self.blocks[block].resident = self.resident.clone();

        self.reconcile_back_edges(block);
    }

    // Establish residency and names at block entry from the predecessors.
    fn compute_entry_state(&mut self, block: Block) {
        let preds = self.func.blocks[block].preds.clone();
        if preds.is_empty() {
            return;
        }
        let visited: Vec<Block> = preds
            .iter()
            .copied()
            .filter(|&p| self.blocks[p].visited)
            .collect();
        let all_visited = visited.len() == preds.len();

        if let [single] = visited[..] {
            if all_visited {
                // No choice exists: inherit exactly. Values that were only
                // live along the predecessor's other edges are dead here.
                let state = self.blocks[single].resident.clone();
                for (v, name) in state {
                    if self.liveness.live_in[block].contains(v) {
                        self.insert_resident(v, name);
                    }
                }
                self.enforce_limit(&[], 0);
                return;
            }
        }

        if all_visited {
            self.join_entry_state(block, &preds);
        } else {
            self.header_entry_state(block, &visited);
        }
    }

    fn join_entry_state(&mut self, block: Block, preds: &[Block]) {
        // Values resident in *every* predecessor are free to keep; decide
        // those before touching predecessor-specific ones so reload
        // decisions stay delayed as long as possible.
        let live_in: Vec<Value> = self.liveness.live_in[block].iter().collect();
        let mut partial: Vec<Value> = Vec::new();
        for v in live_in {
            let holders = preds
                .iter()
                .filter(|&&p| self.blocks[p].resident.contains_key(&v))
                .count();
            if holders == preds.len() {
                let name = self.join_names(block, preds, v);
                self.insert_resident(v, name);
            } else if holders > 0 {
                partial.push(v);
            }
        }
        self.enforce_limit(&[], 0);

        // Predecessor-specific values: reload on the edges that lack them,
        // as long as they still fit; otherwise make sure the copies that do
        // exist are backed by memory.
        for v in partial {
            let d = &self.func.values[v];
            let size = self.func.reg_size(v);
            let fits = if d.shared {
                self.hooks.cur.shared + size <= self.limit.shared
            } else if d.half {
                self.hooks.cur.half + size <= self.limit.half
                    && (!self.hooks.merged || self.hooks.cur.full + size <= self.limit.full)
            } else {
                self.hooks.cur.full + size <= self.limit.full
            };
            if fits && !d.shared {
                let keep: Vec<Value> = self.resident.keys().copied().collect();
                for i in 0..preds.len() {
                    let pred = preds[i];
                    if !self.blocks[pred].resident.contains_key(&v) {
                        self.make_room_at_end(pred, v, &keep);
                        let end = self.func.blocks[pred].insts.len();
                        let saved_block = self.block;
                        self.block = pred;
                        let new = self.reload(v, end);
                        self.block = saved_block;
                        self.blocks[pred].resident.insert(v, new);
                    }
                }
                let name = self.join_names(block, preds, v);
                self.insert_resident(v, name);
            } else {
                for &pred in preds {
                    if self.blocks[pred].resident.contains_key(&v)
                        && !self.spilled[v]
                        && !self.can_rematerialize(v)
                    {
                        let name = self.blocks[pred].resident[&v];
                        self.emit_spill_named(v, name, None, pred);
                        break;
                    }
                }
                // Ensure nothing downstream trusts a register copy.
                self.spilled[v] = true;
            }
        }
    }

    // The current name for `v` entering `block`: predecessors that agree
    // pass the name through, disagreement becomes a phi.
    fn join_names(&mut self, block: Block, preds: &[Block], v: Value) -> Value {
        let names: Vec<Value> = preds
            .iter()
            .map(|&p| *self.blocks[p].resident.get(&v).unwrap_or(&v))
            .collect();
        if names.windows(2).all(|w| w[0] == w[1]) {
            return names[0];
        }
        let srcs: Vec<Option<Value>> = names.iter().map(|&n| Some(n)).collect();
        let phi = self
            .func
            .append_phi(block, DefSpec::like(self.func, v), &srcs);
        self.created_phis.push(phi);
        self.changed = true;
        let dst = self.func.single_dst(phi);
        trace!("created reconciling phi {} for {}", dst, v);
        dst
    }

    // Loop header: pick an entry residency by next-use distance without
    // knowing the back edge, record it, and pre-create a phi per value so
    // the back edge can disagree later.
    fn header_entry_state(&mut self, block: Block, visited: &[Block]) {
        let mut live_in: Vec<Value> = self.liveness.live_in[block].iter().collect();
        live_in.sort_by_key(|&v| self.next_use.distance(block, v, 0));
        let preds = self.func.blocks[block].preds.clone();

        for v in live_in {
            let d = &self.func.values[v];
            let size = self.func.reg_size(v);
            let fits = if d.shared {
                self.hooks.cur.shared + size <= self.limit.shared
            } else if d.half {
                self.hooks.cur.half + size <= self.limit.half
                    && (!self.hooks.merged || self.hooks.cur.full + size <= self.limit.full)
            } else {
                self.hooks.cur.full + size <= self.limit.full
            };
            let resident_somewhere = visited
                .iter()
                .any(|&p| self.blocks[p].resident.contains_key(&v));
            if d.shared {
                // Shared values are never spilled; always resident.
                self.insert_resident(v, v);
                continue;
            }
            if fits && resident_somewhere {
                // Forward edges missing the value reload it at their end
                // first, so every visited edge has a name to contribute.
                let keep: Vec<Value> = self.resident.keys().copied().collect();
                for &p in visited {
                    if !self.blocks[p].resident.contains_key(&v) {
                        self.make_room_at_end(p, v, &keep);
                        let end = self.func.blocks[p].insts.len();
                        let saved = self.block;
                        self.block = p;
                        let new = self.reload(v, end);
                        self.block = saved;
                        self.blocks[p].resident.insert(v, new);
                    }
                }
                // Pre-create the phi; back-edge reconciliation fills the
                // missing arguments, and trivial phis collapse later.
                let srcs: Vec<Option<Value>> = preds
                    .iter()
                    .map(|&p| {
                        if self.blocks[p].visited {
                            Some(*self.blocks[p].resident.get(&v).unwrap_or(&v))
                        } else {
                            None
                        }
                    })
                    .collect();
                let phi = self
                    .func
                    .append_phi(block, DefSpec::like(self.func, v), &srcs);
                self.created_phis.push(phi);
                let name = self.func.single_dst(phi);
                self.insert_resident(v, name);
                self.blocks[block].entry_phis.insert(v, phi);
                self.changed = true;
            } else {
                // Not kept across the loop entry: back it with memory.
                for &p in visited {
                    if self.blocks[p].resident.contains_key(&v)
                        && !self.spilled[v]
                        && !self.can_rematerialize(v)
                    {
                        let name = self.blocks[p].resident[&v];
                        self.emit_spill_named(v, name, None, p);
                        break;
                    }
                }
                self.spilled[v] = true;
            }
        }
    }

    // After finishing `block`, fix up any visited successor that promised
    // itself an entry residency before this back edge existed.
    fn reconcile_back_edges(&mut self, block: Block) {
        let succs = self.func.blocks[block].succs.clone();
        for succ in succs {
            if !self.blocks[succ].visited {
                continue;
            }
            let expected: Vec<(Value, Inst)> = self.blocks[succ]
                .entry_phis
                .iter()
                .map(|(&v, &phi)| (v, phi))
                .collect();
            if expected.is_empty() {
                continue;
            }
            let edge = self.func.blocks[succ]
                .preds
                .iter()
                .position(|&p| p == block)
                .expect("successor without back edge");
            for (v, phi) in expected {
                if self.func.insts[phi].srcs[edge].value.is_some() {
                    continue;
                }
                let name = match self.blocks[block].resident.get(&v) {
                    Some(&n) => n,
                    None => {
                        // The loop body evicted it; bring it back at the
                        // bottom of the latch.
                        let keep: Vec<Value> =
                            self.blocks[succ].entry_phis.keys().copied().collect();
                        self.make_room_at_end(block, v, &keep);
                        let end = self.func.blocks[block].insts.len();
                        let saved = self.block;
                        self.block = block;
                        let new = self.reload(v, end);
                        self.block = saved;
                        self.blocks[block].resident.insert(v, new);
                        new
                    }
                };
                self.func.insts[phi].srcs[edge].value = name.into();
            }
        }
    }

    fn handle_normal(&mut self, inst: Inst) {
        let index = self.func.inst_index(inst);
        let srcs: Vec<(usize, Value, bool)> = self.func.insts[inst]
            .srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.expand().map(|v| (i, v, s.kill)))
            .collect();

        // Reload anything we need that isn't resident, then rewrite the
        // operands to the current names.
        let mut protect: Vec<Value> = srcs.iter().map(|&(_, v, _)| v).collect();
        protect.extend(self.func.insts[inst].dsts.iter().copied());
        for &(i, v, _) in &srcs {
            if !self.resident.contains_key(&v) && self.spilled[v] {
                // Make room for the incoming value first, so the eviction
                // stores land ahead of the reload.
                self.enforce_limit_with(self.pressure_of(v), &protect, index);
                let index = self.func.inst_index(inst);
                let name = self.reload(v, index);
                self.insert_resident(v, name);
            }
            let name = self.current_name(v);
            if name != v {
                self.func.insts[inst].srcs[i].value = name.into();
            }
        }

        for &(_, v, kill) in &srcs {
            if kill {
                self.remove_resident(v);
            }
        }

        let dsts = self.func.insts[inst].dsts.clone();
        for &dst in &dsts {
            self.insert_resident(dst, dst);
        }
        let index = self.func.inst_index(inst);
        self.enforce_limit(&protect, index);
        for &dst in &dsts {
            if self.func.values[dst].unused {
                self.remove_resident(dst);
            }
        }
    }

    // A parallel copy transfers many values at once, but materializing all
    // destinations at once would spike the accounting. Treat each pair as a
    // sequential temporary binding: pairs whose source dies hand their
    // register straight to the destination.
    fn handle_pcopy(&mut self, inst: Inst) {
        let pairs: Vec<(usize, Value, Value, bool)> = self.func.insts[inst]
            .srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.value
                    .expand()
                    .map(|v| (i, v, self.func.insts[inst].dsts[i], s.kill))
            })
            .collect();
        for &(i, src, dst, kill) in &pairs {
            let index = self.func.inst_index(inst);
            if !self.resident.contains_key(&src) && self.spilled[src] {
                self.enforce_limit_with(self.pressure_of(src), &[src, dst], index);
                let index = self.func.inst_index(inst);
                let name = self.reload(src, index);
                self.insert_resident(src, name);
            }
            let name = self.current_name(src);
            if name != src {
                self.func.insts[inst].srcs[i].value = name.into();
            }
            if kill {
                self.remove_resident(src);
            }
            self.insert_resident(dst, dst);
            let index = self.func.inst_index(inst);
            self.enforce_limit(&[src, dst], index);
        }
    }

    // Reconciling phis whose arguments all agree are renames, not merges.
    fn collapse_trivial_phis(&mut self) {
        let phis = core::mem::take(&mut self.created_phis);
        for phi in phis {
            let dst = self.func.single_dst(phi);
            let mut unique: Option<Value> = None;
            let mut trivial = true;
            for src in &self.func.insts[phi].srcs {
                match src.value.expand() {
                    None => {
                        trivial = false;
                        break;
                    }
                    Some(v) if v == dst => {}
                    Some(v) => match unique {
                        None => unique = Some(v),
                        Some(u) if u == v => {}
                        Some(_) => {
                            trivial = false;
                            break;
                        }
                    },
                }
            }
            let replacement = match (trivial, unique) {
                (true, Some(u)) => u,
                _ => continue,
            };
            trace!("collapsing trivial phi {} into {}", dst, replacement);
            for (_, data) in self.func.insts.iter_mut() {
                for src in data.srcs.iter_mut() {
                    if src.value.expand() == Some(dst) {
                        src.value = replacement.into();
                    }
                }
            }
            self.func.remove_inst(phi);
        }
    }
}
