//! The main allocation algorithm.
//!
//! This is an SSA-based allocator that handles vector split/collect
//! "smartly": multiple values may share one register interval, and only the
//! *top-level* intervals of each file's forest are ever placed or moved. The
//! destination of a split, or a source of a collect, is locked to its parent
//! interval and follows it around.
//!
//! There is no backtracking. Merge sets act as affinity: each set gets a
//! preferred register once its first member lands, and we honor the
//! preference whenever the spot is free. When nothing fits, we escalate
//! through progressively more expensive fallbacks: a round-robin gap search,
//! eviction of conflicting intervals (with killed-range swaps), and finally
//! compacting the whole file to squeeze the gaps out.
//!
//! Blocks are visited in layout order (a reverse postorder). Each block's
//! final value placements are recorded as renames; successors pick their
//! live-in placements from the first visited predecessor, and corrective
//! parallel copies are appended to predecessors whose placements disagree.
//! Loop back-edges are reconciled retroactively through each header's
//! recorded entry registers.

use crate::ir::{Block, DefSpec, Function, Inst, Opcode, PhysReg, Src, Value};
use crate::regalloc::interval::{RegTree, RegTreeHooks};
use crate::regalloc::liveness::Liveness;
use crate::regalloc::{FileKind, FileSizes, HALF_FILE_SIZE};
use crate::trace;
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Bitset over the physical units of one register file.
#[derive(Clone)]
struct PhysSet {
    words: Vec<u64>,
    size: u32,
}

impl PhysSet {
    fn new_filled(size: u32) -> Self {
        let mut set = Self {
            words: vec![0; (size as usize + 63) / 64],
            size,
        };
        for i in 0..size {
            set.set(i);
        }
        set
    }

    fn set(&mut self, i: u32) {
        self.words[i as usize / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: u32) {
        self.words[i as usize / 64] &= !(1 << (i % 64));
    }

    fn test(&self, i: u32) -> bool {
        i < self.size && self.words[i as usize / 64] & (1 << (i % 64)) != 0
    }

    fn test_range(&self, start: u32, end: u32) -> bool {
        (start..end).all(|i| self.test(i))
    }

    // Maximal runs of set bits below `limit`.
    fn ranges(&self, limit: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < limit.min(self.size) {
            if self.test(i) {
                let start = i;
                while i < limit.min(self.size) && self.test(i) {
                    i += 1;
                }
                out.push((start, i));
            } else {
                i += 1;
            }
        }
        out
    }
}

/// Physical placement of a top-level interval.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct PhysRange {
    start: PhysReg,
    end: PhysReg,
}

impl PhysRange {
    fn len(self) -> u32 {
        u32::from(self.end - self.start)
    }
}

/// Per-file bookkeeping driven by the interval forest hooks.
struct FileBook {
    available: PhysSet,
    available_to_evict: PhysSet,
    physreg: SecondaryMap<Value, PhysRange>,
    // Top-level occupants sorted by physreg start.
    occupants: Vec<Value>,
    killed: SecondaryMap<Value, bool>,
    frozen: SecondaryMap<Value, bool>,
}

impl FileBook {
    fn new(size: u32) -> Self {
        Self {
            available: PhysSet::new_filled(size),
            available_to_evict: PhysSet::new_filled(size),
            physreg: SecondaryMap::new(),
            occupants: Vec::new(),
            killed: SecondaryMap::new(),
            frozen: SecondaryMap::new(),
        }
    }

    fn reset(&mut self, size: u32) {
        self.available = PhysSet::new_filled(size);
        self.available_to_evict = PhysSet::new_filled(size);
        self.occupants.clear();
    }

    fn occupy(&mut self, value: Value) {
        let pr = self.physreg[value];
        for i in pr.start..pr.end {
            self.available.clear(i.into());
            self.available_to_evict.clear(i.into());
        }
        let pos = self
            .occupants
            .partition_point(|&v| self.physreg[v].start < pr.start);
        self.occupants.insert(pos, value);
    }
}

impl RegTreeHooks for FileBook {
    fn interval_add(&mut self, value: Value, _start: u32, _end: u32) {
        self.occupy(value);
    }

    fn interval_delete(&mut self, value: Value, _start: u32, _end: u32) {
        let pr = self.physreg[value];
        for i in pr.start..pr.end {
            self.available.set(i.into());
            self.available_to_evict.set(i.into());
        }
        let pos = self
            .occupants
            .iter()
            .position(|&v| v == value)
            .expect("occupant missing");
        self.occupants.remove(pos);
    }

    fn interval_readd(
        &mut self,
        parent: Value,
        parent_start: u32,
        child: Value,
        child_start: u32,
        child_end: u32,
    ) {
        // Children move implicitly with their parent; on promotion the
        // child's placement is derived from the parent's former one.
        let base = self.physreg[parent].start + (child_start - parent_start) as PhysReg;
        self.physreg[child] = PhysRange {
            start: base,
            end: base + (child_end - child_start) as PhysReg,
        };
        self.occupy(child);
    }
}

/// One register file: interval forest plus unit bookkeeping.
struct RaFile {
    tree: RegTree,
    book: FileBook,
    size: u32,
    // Round-robin cursor for the gap search.
    start: u32,
}

impl RaFile {
    fn new(size: u32) -> Self {
        Self {
            tree: RegTree::new(),
            book: FileBook::new(size),
            size,
            start: 0,
        }
    }

    fn reset(&mut self) {
        self.tree.clear();
        self.book.reset(self.size);
    }

    fn insert(&mut self, value: Value) {
        let pr = self.book.physreg[value];
        assert!(pr.start < pr.end);
        assert!(u32::from(pr.end) <= self.size);
        self.tree.insert(&mut self.book, value);
    }

    fn remove(&mut self, value: Value) {
        self.tree.remove(&mut self.book, value);
    }

    fn mark_killed(&mut self, value: Value) {
        assert!(self.tree.parent(value).is_none());
        let pr = self.book.physreg[value];
        for i in pr.start..pr.end {
            self.book.available.set(i.into());
        }
        self.book.killed[value] = true;
    }

    fn unmark_killed(&mut self, value: Value) {
        assert!(self.tree.parent(value).is_none());
        let pr = self.book.physreg[value];
        for i in pr.start..pr.end {
            self.book.available.clear(i.into());
        }
        self.book.killed[value] = false;
    }

    // Current placement of `value`, derived through its top-level ancestor.
    fn physreg(&self, value: Value) -> PhysReg {
        let root = self.tree.root(value);
        self.book.physreg[root].start
            + (self.tree.start(value) - self.tree.start(root)) as PhysReg
    }
}

#[derive(Clone, Default)]
struct RaBlockState {
    // Final placement of defs whose register moved after their definition.
    renames: FxHashMap<Value, PhysReg>,
    // Entry placements recorded when not all predecessors were visited yet,
    // consulted later when a back-edge predecessor finishes.
    entry_regs: FxHashMap<Value, PhysReg>,
    visited: bool,
}

struct ParallelCopy {
    value: Value,
    src: PhysReg,
}

struct RemovedInterval {
    value: Value,
    size: u32,
}

/// Allocation context for one function.
pub(crate) struct AllocCtx<'a> {
    func: &'a mut Function,
    live: &'a Liveness,
    full: RaFile,
    half: RaFile,
    shared: RaFile,
    blocks: SecondaryMap<Block, RaBlockState>,
    parallel_copies: Vec<ParallelCopy>,
    merged_regs: bool,
    block: Block,
}

/// Assign a physical register to every value in `func`.
///
/// Register pressure must already fit the given file sizes; running out of
/// space here is a bug in pressure accounting or coalescing, not a
/// recoverable condition.
pub(crate) fn allocate(
    func: &mut Function,
    live: &Liveness,
    sizes: FileSizes,
    merged_regs: bool,
) {
    let entry = func.entry_block();
    let mut ctx = AllocCtx {
        func,
        live,
        full: RaFile::new(sizes.full),
        half: RaFile::new(sizes.half),
        shared: RaFile::new(sizes.shared),
        blocks: SecondaryMap::new(),
        parallel_copies: Vec::new(),
        merged_regs,
        block: entry,
    };
    for i in 0..ctx.func.layout.len() {
        let block = ctx.func.layout[i];
        ctx.handle_block(block);
    }
}

impl<'a> AllocCtx<'a> {
    fn file_kind(&self, value: Value) -> FileKind {
        let data = &self.func.values[value];
        if data.shared {
            FileKind::Shared
        } else if self.merged_regs || !data.half {
            FileKind::Full
        } else {
            FileKind::Half
        }
    }

    fn file(&self, kind: FileKind) -> &RaFile {
        match kind {
            FileKind::Full => &self.full,
            FileKind::Half => &self.half,
            FileKind::Shared => &self.shared,
        }
    }

    fn file_mut(&mut self, kind: FileKind) -> &mut RaFile {
        match kind {
            FileKind::Full => &mut self.full,
            FileKind::Half => &mut self.half,
            FileKind::Shared => &mut self.shared,
        }
    }

    // Half values can only occupy the first half of the merged file.
    fn file_size_for(&self, kind: FileKind, value: Value) -> u32 {
        let size = self.file(kind).size;
        if self.func.values[value].half {
            size.min(HALF_FILE_SIZE)
        } else {
            size
        }
    }

    fn is_early_clobber(&self, value: Value) -> bool {
        self.func.values[value].early_clobber || self.func.values[value].tied.is_some()
    }

    fn physreg(&self, value: Value) -> PhysReg {
        self.file(self.file_kind(value)).physreg(value)
    }

    // Initialize the interval node and placement for `value`.
    fn init_interval(&mut self, value: Value, physreg: PhysReg) {
        let kind = self.file_kind(value);
        let (start, end, half) = {
            let d = &self.func.values[value];
            (d.interval_start, d.interval_end, d.half)
        };
        let size = self.func.reg_size(value) as PhysReg;
        let file = self.file_mut(kind);
        file.tree.init(value, start, end, half);
        file.book.physreg[value] = PhysRange {
            start: physreg,
            end: physreg + size,
        };
        file.book.killed[value] = false;
        file.book.frozen[value] = false;
    }

    // Record a pending top-level move for the final parallel copy, keyed by
    // the interval's original position. Repeated pops keep the first source.
    fn note_parallel_copy(&mut self, value: Value, src: PhysReg) {
        if !self.parallel_copies.iter().any(|pc| pc.value == value) {
            self.parallel_copies.push(ParallelCopy { value, src });
        }
    }

    fn pop_interval(&mut self, kind: FileKind, value: Value) -> RemovedInterval {
        let src = self.file(kind).book.physreg[value].start;
        self.note_parallel_copy(value, src);
        let file = self.file_mut(kind);
        let size = file.book.physreg[value].len();
        file.tree.remove_temp(&mut file.book, value);
        RemovedInterval { value, size }
    }

    fn push_interval(&mut self, kind: FileKind, removed: &RemovedInterval, dst: PhysReg) {
        let file = self.file_mut(kind);
        file.book.physreg[removed.value] = PhysRange {
            start: dst,
            end: dst + removed.size as PhysReg,
        };
        assert!(u32::from(dst) + removed.size <= file.size);
        file.tree.reinsert(&mut file.book, removed.value);
    }

    fn move_interval(&mut self, kind: FileKind, value: Value, dst: PhysReg) {
        let removed = self.pop_interval(kind, value);
        self.push_interval(kind, &removed, dst);
    }

    // Does [start, end) collide with an already-placed destination of the
    // same instruction? Destinations never alias each other, even before
    // their kills take effect.
    fn check_dst_overlap(&self, kind: FileKind, dst: Value, start: u32, end: u32) -> bool {
        let inst = self.func.def_inst(dst);
        for &other in &self.func.insts[inst].dsts {
            if other == dst {
                break;
            }
            if self.file_kind(other) != kind {
                continue;
            }
            let pr = self.file(kind).book.physreg[other];
            if u32::from(pr.end) > start && end > u32::from(pr.start) {
                return true;
            }
        }
        false
    }

    // Is the exact spot `physreg` legal and free for `reg`?
    fn get_reg_specified(
        &self,
        kind: FileKind,
        reg: Value,
        physreg: PhysReg,
        is_source: bool,
    ) -> bool {
        let size = self.func.reg_size(reg);
        let file = self.file(kind);
        let avail = if self.is_early_clobber(reg) || is_source {
            &file.book.available_to_evict
        } else {
            &file.book.available
        };
        if !avail.test_range(physreg.into(), u32::from(physreg) + size) {
            return false;
        }
        if !is_source
            && self.check_dst_overlap(kind, reg, physreg.into(), u32::from(physreg) + size)
        {
            return false;
        }
        true
    }

    /// Try to clear the spot `physreg` for `reg` by moving every
    /// conflicting interval somewhere else, or swapping it with a killed
    /// interval of the same size. Returns the total eviction cost (swaps
    /// count double since they lower to real swap instructions), or `None`
    /// if the spot cannot be cleared.
    fn try_evict_regs(
        &mut self,
        kind: FileKind,
        reg: Value,
        physreg: PhysReg,
        is_source: bool,
        speculative: bool,
    ) -> Option<u32> {
        let size = self.func.reg_size(reg);
        let mut available_to_evict = self.file(kind).book.available_to_evict.clone();
        let mut available = self.file(kind).book.available.clone();
        for i in u32::from(physreg)..u32::from(physreg) + size {
            available_to_evict.clear(i);
            available.clear(i);
        }

        let conflicting: Vec<Value> = self
            .file(kind)
            .book
            .occupants
            .iter()
            .copied()
            .filter(|&v| {
                let pr = self.file(kind).book.physreg[v];
                u32::from(pr.end) > u32::from(physreg)
                    && u32::from(pr.start) < u32::from(physreg) + size
            })
            .collect();

        let mut eviction_count = 0;
        for conflict in conflicting {
            if !self.is_early_clobber(reg) && !is_source && self.file(kind).book.killed[conflict] {
                continue;
            }
            if self.file(kind).book.frozen[conflict] {
                assert!(speculative);
                return None;
            }

            let conflict_file_size = self.file_size_for(kind, conflict);
            let conflict_pr = self.file(kind).book.physreg[conflict];
            let conflict_size = conflict_pr.len();
            let conflict_half = self.func.values[conflict].half;
            let mut evicted = false;
            for (mut avail_start, avail_end) in available_to_evict.ranges(conflict_file_size) {
                let mut gap = avail_end - avail_start;
                // Full registers must stay two-unit aligned.
                if !conflict_half && avail_start % 2 == 1 {
                    avail_start += 1;
                    gap = gap.saturating_sub(1);
                }
                if gap >= conflict_size
                    && !self.check_dst_overlap(kind, reg, avail_start, avail_start + conflict_size)
                {
                    for i in avail_start..avail_start + conflict_size {
                        available_to_evict.clear(i);
                    }
                    eviction_count += conflict_size;
                    if !speculative {
                        self.move_interval(kind, conflict, avail_start as PhysReg);
                    }
                    evicted = true;
                    break;
                }
            }
            if evicted {
                continue;
            }

            // Couldn't relocate it. If the new value may overlap killed
            // ranges, swapping the blocker with a same-sized killed range
            // elsewhere achieves the same thing at the cost of a swap.
            if self.is_early_clobber(reg) || is_source {
                return None;
            }
            let killed_candidates: Vec<Value> = self
                .file(kind)
                .book
                .occupants
                .iter()
                .copied()
                .filter(|&k| self.file(kind).book.killed[k])
                .collect();
            for killed in killed_candidates {
                let killed_pr = self.file(kind).book.physreg[killed];
                if killed_pr.len() != conflict_size {
                    continue;
                }
                if u32::from(killed_pr.end) > conflict_file_size
                    || u32::from(conflict_pr.end) > self.file_size_for(kind, killed)
                {
                    continue;
                }
                // The killed range must not overlap the spot we're clearing,
                // or anything already swapped in speculative mode.
                if !available.test_range(killed_pr.start.into(), killed_pr.end.into()) {
                    continue;
                }
                if self.check_dst_overlap(kind, reg, killed_pr.start.into(), killed_pr.end.into())
                {
                    continue;
                }
                let killed_half = self.func.values[killed].half;
                if (!killed_half || !conflict_half)
                    && (killed_pr.start % 2 != 0 || conflict_pr.start % 2 != 0)
                {
                    continue;
                }
                for i in killed_pr.start..killed_pr.end {
                    available.clear(i.into());
                }
                eviction_count += conflict_size * 2;
                if !speculative {
                    let killed_start = killed_pr.start;
                    let conflict_start = conflict_pr.start;
                    let killed_removed = self.pop_interval(kind, killed);
                    let conflict_removed = self.pop_interval(kind, conflict);
                    self.push_interval(kind, &killed_removed, conflict_start);
                    self.push_interval(kind, &conflict_removed, killed_start);
                }
                evicted = true;
                break;
            }

            if !evicted {
                return None;
            }
        }

        Some(eviction_count)
    }

    /// Compact the file's live intervals so there is room for `reg`.
    ///
    /// Pops every interval past a workable boundary, then pushes everything
    /// back contiguously in an order that keeps half registers below the
    /// half boundary and killed sources adjacent to the destinations that
    /// may overlap them. Used only when the file is nearly full and badly
    /// fragmented.
    fn compress_regs_left(&mut self, kind: FileKind, reg: Value) -> PhysReg {
        let reg_align = self.func.elem_size(reg);
        let inst = self.func.def_inst(reg);
        let inst_dsts = self.func.insts[inst].dsts.clone();

        let mut intervals: Vec<RemovedInterval> = Vec::new();
        let mut dsts: Vec<Value> = vec![reg];
        let mut dst_inserted = vec![false; inst_dsts.len()];

        let mut dst_size = if self.func.values[reg].tied.is_some() {
            0
        } else {
            self.func.reg_size(reg)
        };
        let mut ec_dst_size = if self.is_early_clobber(reg) {
            self.func.reg_size(reg)
        } else {
            0
        };
        let mut half_dst_size = 0;
        let mut ec_half_dst_size = 0;
        if reg_align == 1 {
            half_dst_size = dst_size;
            ec_half_dst_size = ec_dst_size;
        }

        let mut removed_size = 0;
        let mut removed_half_size = 0;
        let mut removed_killed_size = 0;
        let mut removed_killed_half_size = 0;
        let file_size = self.file(kind).size;
        let half_file_size = if reg_align == 1 {
            file_size.min(HALF_FILE_SIZE)
        } else {
            file_size
        };
        let mut start_reg: PhysReg = 0;

        loop {
            let last = match self.file(kind).book.occupants.last().copied() {
                Some(v) => v,
                None => {
                    start_reg = 0;
                    break;
                }
            };
            let mut candidate_start = u32::from(self.file(kind).book.physreg[last].end);

            // Pick up any destinations of this instruction sitting past the
            // candidate boundary.
            for (n, &other_dst) in inst_dsts.iter().enumerate() {
                if other_dst == reg {
                    break;
                }
                if self.file_kind(other_dst) != kind || dst_inserted[n] {
                    continue;
                }
                let other_pr = self.file(kind).book.physreg[other_dst];
                if u32::from(other_pr.start) < candidate_start {
                    candidate_start = candidate_start.max(other_pr.end.into());
                    continue;
                }
                dst_inserted[n] = true;

                // Destinations reusing a killed tied source stay attached to
                // that source; they're fixed up at the end instead.
                if let Some(tied) = self.func.values[other_dst].tied {
                    let tied_src = self.func.insts[inst].srcs[tied as usize]
                        .value
                        .expand()
                        .expect("tied to undef");
                    if self.file(kind).book.killed[tied_src] {
                        continue;
                    }
                }

                trace!("popping destination {}", other_dst);
                dsts.push(other_dst);
                let interval_size = self.func.reg_size(other_dst);
                if self.is_early_clobber(other_dst) {
                    ec_dst_size += interval_size;
                    if self.func.values[other_dst].half {
                        ec_half_dst_size += interval_size;
                    }
                } else {
                    dst_size += interval_size;
                    if self.func.values[other_dst].half {
                        half_dst_size += interval_size;
                    }
                }
            }

            // Can everything past the boundary, plus our destinations, be
            // packed into the space that's left? Killed sources may overlap
            // non-early-clobber destinations, hence the max().
            if candidate_start + removed_size + ec_dst_size + removed_killed_size.max(dst_size)
                <= file_size
                && (reg_align != 1
                    || candidate_start
                        + removed_half_size
                        + ec_half_dst_size
                        + removed_killed_half_size.max(half_dst_size)
                        <= half_file_size)
            {
                start_reg = candidate_start as PhysReg;
                break;
            }

            assert!(
                !self.file(kind).book.frozen[last],
                "compress ran into a frozen interval"
            );

            let interval_size = self.file(kind).book.physreg[last].len();
            if self.file(kind).book.killed[last] {
                removed_killed_size += interval_size;
                if self.func.values[last].half {
                    removed_killed_half_size += interval_size;
                }
            } else {
                removed_size += interval_size;
                if self.func.values[last].half {
                    removed_half_size += interval_size;
                }
            }
            trace!("popping interval {}", last);
            intervals.push(self.pop_interval(kind, last));
        }

        // Sort both lists into the placement order:
        //
        //   half live-through | half ec dst | half killed |
        //   full killed | full ec dst | full live-through
        //
        // with non-early-clobber destinations overlapping the killed middle.
        intervals.sort_by(|a, b| {
            let (aa, ba) = (self.func.elem_size(a.value), self.func.elem_size(b.value));
            aa.cmp(&ba).then_with(|| {
                let ak = self.file(kind).book.killed[a.value];
                let bk = self.file(kind).book.killed[b.value];
                if aa == 1 {
                    ak.cmp(&bk)
                } else {
                    bk.cmp(&ak)
                }
            })
        });
        // Destinations sort as-if tied ones were live-through sources and
        // plain ones killed sources.
        dsts.sort_by(|&a, &b| {
            let (aa, ba) = (self.func.elem_size(a), self.func.elem_size(b));
            aa.cmp(&ba).then_with(|| {
                let aec = self.is_early_clobber(a);
                let bec = self.is_early_clobber(b);
                if aa == 1 {
                    bec.cmp(&aec)
                } else {
                    aec.cmp(&bec)
                }
            })
        });

        let mut live_reg = u32::from(start_reg);
        let mut dst_reg: Option<u32> = None;
        let mut ret_reg: Option<PhysReg> = None;
        let mut dst_index = 0;
        let mut live_index = 0;

        while live_index < intervals.len() || dst_index < dsts.len() {
            let process_dst = if live_index == intervals.len() {
                true
            } else if dst_index == dsts.len() {
                false
            } else {
                let dst = dsts[dst_index];
                let live = intervals[live_index].value;
                let live_half = self.func.values[live].half;
                let live_killed = self.file(kind).book.killed[live];
                let dst_half = self.func.values[dst].half;
                let dst_ec = self.is_early_clobber(dst);
                if live_half && !live_killed {
                    false
                } else if dst_half && dst_ec {
                    true
                } else if !dst_ec {
                    true
                } else if live_killed {
                    false
                } else if !dst_half {
                    true
                } else {
                    debug_assert!(!live_killed && !live_half);
                    false
                }
            };

            let cur = if process_dst {
                dsts[dst_index]
            } else {
                intervals[live_index].value
            };
            let cur_ec = self.is_early_clobber(cur);

            let mut physreg = if process_dst && !cur_ec {
                *dst_reg.get_or_insert(live_reg)
            } else {
                let mut p = live_reg;
                if !process_dst {
                    let live_killed = self.file(kind).book.killed[intervals[live_index].value];
                    if !live_killed {
                        if let Some(d) = dst_reg {
                            p = p.max(d);
                        }
                    }
                }
                p
            };
            if !self.func.values[cur].half {
                physreg = (physreg + 1) & !1;
            }

            let interval_size = self.func.reg_size(cur);
            assert!(
                physreg + interval_size <= self.file_size_for(kind, cur),
                "pressure accounting was wrong: no room for {} while compressing",
                cur
            );

            if process_dst {
                if cur == reg {
                    ret_reg = Some(physreg as PhysReg);
                } else {
                    self.file_mut(kind).book.physreg[cur] = PhysRange {
                        start: physreg as PhysReg,
                        end: (physreg + interval_size) as PhysReg,
                    };
                }
                dst_index += 1;
            } else {
                let removed = RemovedInterval {
                    value: intervals[live_index].value,
                    size: intervals[live_index].size,
                };
                self.push_interval(kind, &removed, physreg as PhysReg);
                live_index += 1;
            }

            let next = physreg + interval_size;
            if process_dst && !cur_ec {
                dst_reg = Some(next);
            } else {
                live_reg = next;
            }
        }

        // Destinations attached to a killed tied source follow it.
        for &dst in &inst_dsts {
            if dst == reg {
                break;
            }
            let tied = match self.func.values[dst].tied {
                Some(t) => t,
                None => continue,
            };
            let tied_src = self.func.insts[inst].srcs[tied as usize]
                .value
                .expand()
                .expect("tied to undef");
            if !self.file(kind).book.killed[tied_src] {
                continue;
            }
            let base = self.file(kind).physreg(tied_src);
            let size = self.func.reg_size(dst) as PhysReg;
            self.file_mut(kind).book.physreg[dst] = PhysRange {
                start: base,
                end: base + size,
            };
        }

        ret_reg.expect("compress_regs_left found no spot")
    }

    // Record the merge set's preferred register once a member lands.
    fn update_affinity(&mut self, kind: FileKind, reg: Value, physreg: PhysReg) {
        let set = match self.func.values[reg].merge_set.expand() {
            Some(s) => s,
            None => return,
        };
        if self.func.merge_sets[set].preferred_reg.is_some() {
            return;
        }
        let offset = self.func.values[reg].merge_set_offset;
        if u32::from(physreg) < offset {
            return;
        }
        if u32::from(physreg) - offset + self.func.merge_sets[set].size > self.file(kind).size {
            return;
        }
        self.func.merge_sets[set].preferred_reg = Some(physreg - offset as PhysReg);
    }

    /// Try to find free space for `dst` without disturbing anything,
    /// starting at the file's rotating cursor to spread allocations and
    /// reduce false dependencies.
    fn find_best_gap(
        &mut self,
        kind: FileKind,
        dst: Value,
        file_size: u32,
        size: u32,
        alignment: u32,
    ) -> Option<PhysReg> {
        // A very large merge set may simply not fit; bail out.
        if size > file_size {
            return None;
        }
        let ec = self.is_early_clobber(dst);
        let start = {
            let cursor = self.file(kind).start;
            (cursor + alignment - 1) / alignment * alignment % (file_size - size + alignment)
        };
        let mut candidate = start;
        loop {
            let avail = if ec {
                &self.file(kind).book.available_to_evict
            } else {
                &self.file(kind).book.available
            };
            let mut ok = avail.test_range(candidate, candidate + size);
            if ok {
                ok = !self.check_dst_overlap(kind, dst, candidate, candidate + size);
            }
            if ok {
                self.file_mut(kind).start = (candidate + size) % file_size;
                return Some(candidate as PhysReg);
            }
            candidate += alignment;
            if candidate + size > file_size {
                candidate = 0;
            }
            if candidate == start {
                return None;
            }
        }
    }

    /// The main entry point for picking a register for `reg`, shuffling
    /// other intervals around if necessary.
    fn get_reg(&mut self, kind: FileKind, reg: Value) -> PhysReg {
        let file_size = self.file_size_for(kind, reg);
        let size = self.func.reg_size(reg);
        let elem = self.func.elem_size(reg);

        // Honor the merge set's preferred register when the exact spot is
        // free.
        if let Some(set) = self.func.values[reg].merge_set.expand() {
            if let Some(pref) = self.func.merge_sets[set].preferred_reg {
                let preferred = pref + self.func.values[reg].merge_set_offset as PhysReg;
                if u32::from(preferred) + size <= file_size
                    && u32::from(preferred) % elem == 0
                    && self.get_reg_specified(kind, reg, preferred, false)
                {
                    return preferred;
                }
            }
        }

        // If this is a strict subset of a not-yet-placed merge set, try to
        // grab a gap large enough for the entire set so later members land
        // contiguously with no extra copies.
        if let Some(set) = self.func.values[reg].merge_set.expand() {
            let set_size = self.func.merge_sets[set].size;
            let set_align = self.func.merge_sets[set].alignment;
            if self.func.merge_sets[set].preferred_reg.is_none() && size < set_size {
                if let Some(best) = self.find_best_gap(kind, reg, file_size, set_size, set_align) {
                    return best + self.func.values[reg].merge_set_offset as PhysReg;
                }
            }
        }

        // For ALU and SFU instructions, reuse a source's register if it is
        // free: this tends to turn moves into no-ops and avoids write-after-
        // read stalls on the special function unit.
        let inst = self.func.def_inst(reg);
        if self.func.insts[inst].op.is_alu_like() {
            let srcs: SmallVec<[Value; 4]> = self.func.insts[inst]
                .srcs
                .iter()
                .filter_map(|s| s.value.expand())
                .collect();
            for src in srcs {
                if self.file_kind(src) != kind || self.func.reg_size(src) < size {
                    continue;
                }
                let src_physreg = self.physreg(src);
                if u32::from(src_physreg) % elem == 0
                    && u32::from(src_physreg) + size <= file_size
                    && self.get_reg_specified(kind, reg, src_physreg, false)
                {
                    return src_physreg;
                }
            }
        }

        if let Some(best) = self.find_best_gap(kind, reg, file_size, size, elem) {
            return best;
        }

        // Nothing fits without moving something. Speculatively cost out an
        // eviction at every candidate position and take the cheapest.
        let mut best_eviction: Option<(PhysReg, u32)> = None;
        let mut i = 0;
        while i + size <= file_size {
            if let Some(cost) = self.try_evict_regs(kind, reg, i as PhysReg, false, true) {
                if best_eviction.map_or(true, |(_, best)| cost < best) {
                    best_eviction = Some((i as PhysReg, cost));
                }
            }
            i += elem;
        }
        if let Some((best_reg, _)) = best_eviction {
            let result = self.try_evict_regs(kind, reg, best_reg, false, false);
            assert!(result.is_some(), "eviction disappeared when materialized");
            return best_reg;
        }

        // The dumb fallback, only if eviction fails.
        self.compress_regs_left(kind, reg)
    }

    fn mark_src_killed(&mut self, value: Value, first_kill: bool) {
        let kind = self.file_kind(value);
        let file = self.file(kind);
        if !first_kill
            || file.book.killed[value]
            || file.tree.parent(value).is_some()
            || !file.tree.children(value).is_empty()
        {
            return;
        }
        self.file_mut(kind).mark_killed(value);
    }

    // When a tied destination's source lives through the instruction, the
    // destination gets its own register and a copy of the source's *current*
    // position, captured before any same-instruction shuffling.
    fn insert_tied_dst_copy(&mut self, dst: Value) {
        let tied = match self.func.values[dst].tied {
            Some(t) => t,
            None => return,
        };
        let inst = self.func.def_inst(dst);
        let tied_src = self.func.insts[inst].srcs[tied as usize]
            .value
            .expand()
            .expect("tied to undef");
        let kind = self.file_kind(tied_src);
        if self.file(kind).book.killed[tied_src] {
            return;
        }
        let tied_physreg = self.file(kind).physreg(tied_src);
        self.parallel_copies.push(ParallelCopy {
            value: dst,
            src: tied_physreg,
        });
    }

    fn allocate_dst_fixed(&mut self, dst: Value, physreg: PhysReg) {
        let kind = self.file_kind(dst);
        self.update_affinity(kind, dst, physreg);
        self.init_interval(dst, physreg);
    }

    fn allocate_dst(&mut self, dst: Value) {
        if let Some(tied) = self.func.values[dst].tied {
            let inst = self.func.def_inst(dst);
            let tied_src = self.func.insts[inst].srcs[tied as usize]
                .value
                .expand()
                .expect("tied to undef");
            let kind = self.file_kind(tied_src);
            if self.file(kind).book.killed[tied_src] {
                // The easy case: reuse the killed source's register.
                let physreg = self.file(kind).physreg(tied_src);
                self.allocate_dst_fixed(dst, physreg);
                return;
            }
        }
        let kind = self.file_kind(dst);
        let physreg = self.get_reg(kind, dst);
        self.allocate_dst_fixed(dst, physreg);
    }

    fn assign_src(&mut self, inst: Inst, src_idx: usize) {
        let (value, first_kill) = match self.func.insts[inst].srcs[src_idx].value.expand() {
            Some(v) => (v, self.func.insts[inst].srcs[src_idx].first_kill),
            None => return,
        };
        let kind = self.file_kind(value);

        // A source consumed by a tied destination is read at the
        // destination's register; the pre-inserted copy puts it there.
        let tied_dst = self.func.insts[inst]
            .dsts
            .iter()
            .copied()
            .find(|&d| self.func.values[d].tied == Some(src_idx as u16));
        let physreg = match tied_dst {
            Some(d) => self.file(self.file_kind(d)).book.physreg[d].start,
            None => self.file(kind).physreg(value),
        };
        self.func.insts[inst].srcs[src_idx].num = Some(physreg);

        if first_kill {
            self.file_mut(kind).remove(value);
        }
    }

    fn insert_dst(&mut self, dst: Value) {
        let kind = self.file_kind(dst);
        if !self.func.values[dst].unused {
            self.file_mut(kind).insert(dst);
        }
        let num = if self.func.values[dst].unused {
            self.file(kind).book.physreg[dst].start
        } else {
            self.file(kind).physreg(dst)
        };
        trace!("insert dst {} physreg {}", dst, num);
        self.func.values[dst].num = Some(num);
    }

    // Emit the accumulated pending parallel copies as one meta-instruction
    // immediately before `before`.
    fn insert_parallel_copy_instr(&mut self, before: Inst) {
        if self.parallel_copies.is_empty() {
            return;
        }
        let entries = core::mem::take(&mut self.parallel_copies);
        let block = self.block;
        let index = self.func.inst_index(before);
        let pcopy = self
            .func
            .insert_inst(block, index, Opcode::ParallelCopy, &[], &[]);
        for entry in entries {
            let dst_num = {
                let kind = self.file_kind(entry.value);
                // Destinations of pending tied copies haven't been inserted
                // yet; their placement is in the book either way.
                let file = self.file(kind);
                if file.tree.is_inserted(entry.value) {
                    file.physreg(entry.value)
                } else {
                    file.book.physreg[entry.value].start
                }
            };
            let spec = DefSpec::like(self.func, entry.value);
            let src = Src {
                value: entry.value.into(),
                kill: false,
                first_kill: false,
                num: Some(entry.src),
            };
            let copy = self.func.append_copy_pair(pcopy, spec, src);
            self.func.values[copy].num = Some(dst_num);
        }
        trace!("emitted shuffle {}", self.func.display_inst(pcopy));
    }

    fn handle_normal_instr(&mut self, inst: Inst) {
        // Mark killed sources first so destinations may allocate over them.
        for i in 0..self.func.insts[inst].srcs.len() {
            if let Some(v) = self.func.insts[inst].srcs[i].value.expand() {
                let fk = self.func.insts[inst].srcs[i].first_kill;
                self.mark_src_killed(v, fk);
            }
        }
        for i in 0..self.func.insts[inst].dsts.len() {
            let dst = self.func.insts[inst].dsts[i];
            self.insert_tied_dst_copy(dst);
        }
        for i in 0..self.func.insts[inst].dsts.len() {
            let dst = self.func.insts[inst].dsts[i];
            self.allocate_dst(dst);
        }
        // Sources go backward so a value read twice is only removed from
        // the file by its last processed operand.
        for i in (0..self.func.insts[inst].srcs.len()).rev() {
            self.assign_src(inst, i);
        }
        for i in 0..self.func.insts[inst].dsts.len() {
            let dst = self.func.insts[inst].dsts[i];
            self.insert_dst(dst);
        }
        self.insert_parallel_copy_instr(inst);
    }

    // A split whose source shares its merge set is pure address arithmetic.
    fn handle_split(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        let src = match self.func.insts[inst].srcs[0].value.expand() {
            Some(s) => s,
            None => return,
        };
        let dst_set = self.func.values[dst].merge_set.expand();
        if dst_set.is_none() || self.func.values[src].merge_set.expand() != dst_set {
            self.handle_normal_instr(inst);
            return;
        }
        let kind = self.file_kind(src);
        let physreg = self.file(kind).physreg(src);
        self.assign_src(inst, 0);
        let fixed = physreg - self.func.values[src].merge_set_offset as PhysReg
            + self.func.values[dst].merge_set_offset as PhysReg;
        self.allocate_dst_fixed(dst, fixed);
        self.insert_dst(dst);
    }

    fn handle_collect(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        let dst_set = match self.func.values[dst].merge_set.expand() {
            Some(s) => s,
            None => return self.handle_normal_instr(inst),
        };
        if self.func.merge_sets[dst_set].regs.len() == 1 {
            return self.handle_normal_instr(inst);
        }
        let dst_offset = self.func.values[dst].merge_set_offset;
        let (dst_start, dst_end) = {
            let d = &self.func.values[dst];
            (d.interval_start, d.interval_end)
        };

        // If some source lives in a root interval at least as large as the
        // vector, the vector must land inside that interval; otherwise mark
        // overlapping sources killed so the destination may be placed over
        // them, and shuffle them into position afterwards.
        let mut dst_fixed: Option<PhysReg> = None;
        let srcs: SmallVec<[(usize, Value); 8]> = self.func.insts[inst]
            .srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.expand().map(|v| (i, v)))
            .collect();
        for &(i, v) in &srcs {
            if self.func.insts[inst].srcs[i].first_kill {
                self.mark_src_killed(v, true);
            }
            let kind = self.file_kind(v);
            let (v_start, v_end) = {
                let d = &self.func.values[v];
                (d.interval_start, d.interval_end)
            };
            if v_start >= dst_end
                || dst_start >= v_end
                || self.file(kind).book.killed[self.file(kind).tree.root(v)]
            {
                continue;
            }
            let root = self.file(kind).tree.root(v);
            if self.func.reg_size(root) >= self.func.reg_size(dst) {
                dst_fixed = Some(
                    self.file(kind).book.physreg[root].start
                        - self.func.values[root].merge_set_offset as PhysReg
                        + dst_offset as PhysReg,
                );
            } else if self.file(kind).tree.is_inserted(root) {
                self.file_mut(kind).mark_killed(root);
            }
        }

        match dst_fixed {
            Some(physreg) => self.allocate_dst_fixed(dst, physreg),
            None => self.allocate_dst(dst),
        }

        // Undo the temporary kills, keeping the ones that are real.
        for &(i, v) in &srcs {
            let kind = self.file_kind(v);
            let root = self.file(kind).tree.root(v);
            if !self.file(kind).book.killed[root] {
                continue;
            }
            let really_killed = root == v && self.func.insts[inst].srcs[i].kill;
            if !really_killed {
                self.file_mut(kind).unmark_killed(root);
            }
        }

        for i in (0..self.func.insts[inst].srcs.len()).rev() {
            self.assign_src(inst, i);
        }

        // The shuffle must be emitted before insert_dst so children that
        // were moved to make room get a copy destination matching what
        // assign_src just recorded.
        self.insert_parallel_copy_instr(inst);
        self.insert_dst(dst);
    }

    // Pre-existing parallel copies at block ends only need their sources
    // assigned; the destinations are filled in when the successor's phis
    // are.
    fn handle_pcopy(&mut self, inst: Inst) {
        for i in (0..self.func.insts[inst].srcs.len()).rev() {
            self.assign_src(inst, i);
        }
    }

    fn handle_phi(&mut self, dst: Value) {
        let kind = self.file_kind(dst);
        // Phis are scalar, but may be coalesced under a live-in vector; if
        // an interval already covers our logical position, nest inside it.
        let start = self.func.values[dst].interval_start;
        let physreg = match self.file(kind).tree.top_at(start) {
            Some(parent) => {
                self.file(kind).book.physreg[parent].start
                    + (start - self.file(kind).tree.start(parent)) as PhysReg
            }
            None => self.get_reg(kind, dst),
        };
        self.allocate_dst_fixed(dst, physreg);
        self.file_mut(kind).insert(dst);
    }

    fn assign_phi(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        let kind = self.file_kind(dst);
        assert!(self.file(kind).tree.parent(dst).is_none());
        let num = self.file(kind).physreg(dst);
        self.func.values[dst].num = Some(num);
        // The phi's parallel-copy arguments live wherever the phi does.
        for i in 0..self.func.insts[inst].srcs.len() {
            if let Some(arg) = self.func.insts[inst].srcs[i].value.expand() {
                self.func.insts[inst].srcs[i].num = Some(num);
                self.func.values[arg].num = Some(num);
            }
        }
        if self.func.values[dst].unused {
            self.file_mut(kind).remove(dst);
        }
    }

    fn handle_precolored_input(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        let physreg = match self.func.values[dst].precolored {
            Some(p) => p,
            None => return,
        };
        let kind = self.file_kind(dst);
        self.allocate_dst_fixed(dst, physreg);
        trace!("insert precolored dst {} physreg {}", dst, physreg);
        self.file_mut(kind).insert(dst);
        self.file_mut(kind).book.frozen[dst] = true;
    }

    fn handle_input(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        if self.func.values[dst].precolored.is_some() {
            return;
        }
        self.allocate_dst(dst);
        let kind = self.file_kind(dst);
        self.file_mut(kind).insert(dst);
    }

    fn assign_input(&mut self, inst: Inst) {
        let dst = self.func.single_dst(inst);
        let kind = self.file_kind(dst);
        match self.func.values[dst].precolored {
            Some(p) => {
                self.file_mut(kind).book.frozen[dst] = false;
                self.func.values[dst].num = Some(p);
            }
            None => {
                let num = self.file(kind).physreg(dst);
                self.func.values[dst].num = Some(num);
            }
        }
        if self.func.values[dst].unused {
            self.file_mut(kind).remove(dst);
        }
    }

    // Force a precolored source into its fixed slot. There is no fallback:
    // by the time the end-of-stage output executes there are few enough live
    // values that a legal placement always exists.
    fn handle_precolored_source(&mut self, value: Value, target: PhysReg) {
        let kind = self.file_kind(value);
        if self.file(kind).physreg(value) == target {
            return;
        }
        if !self.get_reg_specified(kind, value, target, true) {
            let evicted = self.try_evict_regs(kind, value, target, true, false);
            assert!(
                evicted.is_some(),
                "failed to evict for precolored source {}",
                value
            );
        }
        self.move_interval(kind, value, target);
    }

    fn handle_output(&mut self, inst: Inst) {
        // Sources are deliberately not marked killed: the precolored
        // placement logic treats them like destinations, and killed ranges
        // would confuse the free-spot check.
        for i in 0..self.func.insts[inst].srcs.len() {
            let (v, target) = {
                let s = &self.func.insts[inst].srcs[i];
                (
                    s.value.expand().expect("undef output source"),
                    s.num.expect("output source not precolored"),
                )
            };
            self.handle_precolored_source(v, target);
        }
        for i in 0..self.func.insts[inst].srcs.len() {
            let s = self.func.insts[inst].srcs[i].clone();
            if let Some(v) = s.value.expand() {
                if s.first_kill {
                    let kind = self.file_kind(v);
                    self.file_mut(kind).remove(v);
                }
            }
        }
        self.insert_parallel_copy_instr(inst);
    }

    // The placement a predecessor left `def` in at its end.
    fn read_register(&self, pred: Block, def: Value) -> PhysReg {
        if let Some(&r) = self.blocks[pred].renames.get(&def) {
            return r;
        }
        self.func.values[def].num.expect("live-in without a def placement")
    }

    fn handle_live_in(&mut self, def: Value) {
        let mut physreg = None;
        let preds = self.func.blocks[self.block].preds.clone();
        for &pred in &preds {
            if self.blocks[pred].visited {
                physreg = Some(self.read_register(pred, def));
                break;
            }
        }
        let physreg = physreg.expect("live-in with no visited predecessor");
        self.init_interval(def, physreg);
        let kind = self.file_kind(def);
        self.file_mut(kind).insert(def);
    }

    fn handle_live_out(&mut self, def: Value) {
        // Parallel-copy results are only consumed by phis and get their
        // placement when the phi does.
        if self.func.insts[self.func.def_inst(def)].op == Opcode::ParallelCopy {
            return;
        }
        let kind = self.file_kind(def);
        let physreg = self.file(kind).physreg(def);
        if Some(physreg) != self.func.values[def].num {
            self.blocks[self.block].renames.insert(def, physreg);
        }
    }

    /// Append a corrective copy at the end of `block`, merging into any
    /// trailing parallel copy already there. Only one parallel copy per
    /// block end is legal: it must resolve as one simultaneous swap set.
    fn insert_liveout_copy(&mut self, block: Block, dst: PhysReg, src: PhysReg, reg: Value) {
        let pcopy = match self.func.blocks[block].insts.last().copied() {
            Some(last) if self.func.insts[last].op == Opcode::ParallelCopy => last,
            _ => {
                let index = self.func.blocks[block].insts.len();
                self.func
                    .insert_inst(block, index, Opcode::ParallelCopy, &[], &[])
            }
        };
        let spec = DefSpec::like(self.func, reg);
        let copy = self.func.append_copy_pair(
            pcopy,
            spec,
            Src {
                value: reg.into(),
                kill: false,
                first_kill: false,
                num: Some(src),
            },
        );
        self.func.values[copy].num = Some(dst);
        trace!(
            "fixup copy in {}: r{} <- r{} for {}",
            block,
            dst,
            src,
            reg
        );
    }

    fn insert_live_in_move(&mut self, value: Value) {
        let kind = self.file_kind(value);
        let physreg = self.file(kind).physreg(value);
        let shared = self.func.values[value].shared;
        let preds = if shared {
            self.func.blocks[self.block].physical_preds.clone()
        } else {
            self.func.blocks[self.block].preds.clone()
        };
        for pred in preds {
            if !self.blocks[pred].visited {
                continue;
            }
            let pred_reg = self.read_register(pred, value);
            if pred_reg != physreg {
                self.insert_liveout_copy(pred, physreg, pred_reg, value);
                // The copy changes where this value lives at the end of the
                // predecessor; record it for the predecessor's other
                // successors.
                self.blocks[pred].renames.insert(value, physreg);
            }
        }
    }

    fn insert_live_in_moves(&mut self) {
        for kind in [FileKind::Full, FileKind::Half, FileKind::Shared] {
            let occupants = self.file(kind).book.occupants.clone();
            for value in occupants {
                // Phi destinations are reconciled through their own
                // arguments, not live-in moves.
                if self.live.live_in[self.block].contains(value) {
                    self.insert_live_in_move(value);
                }
            }
        }

        let preds = self.func.blocks[self.block].preds.clone();
        let all_visited = preds.iter().all(|&p| self.blocks[p].visited);
        if !all_visited {
            // A back-edge predecessor will need to know what we expect at
            // entry.
            for kind in [FileKind::Full, FileKind::Half, FileKind::Shared] {
                let occupants = self.file(kind).book.occupants.clone();
                for value in occupants {
                    let start = self.file(kind).book.physreg[value].start;
                    self.blocks[self.block].entry_regs.insert(value, start);
                }
            }
        }
    }

    fn insert_live_out_moves(&mut self) {
        for kind in [FileKind::Full, FileKind::Half, FileKind::Shared] {
            let occupants = self.file(kind).book.occupants.clone();
            for value in occupants {
                let physreg = self.file(kind).book.physreg[value].start;
                let succs = self.func.blocks[self.block].succs.clone();
                for succ in succs {
                    if !self.blocks[succ].visited {
                        continue;
                    }
                    let new_reg = match self.blocks[succ].entry_regs.get(&value) {
                        Some(&r) => r,
                        None => continue,
                    };
                    if new_reg != physreg {
                        let block = self.block;
                        self.insert_liveout_copy(block, new_reg, physreg, value);
                    }
                }
            }
        }
    }

    fn handle_block(&mut self, block: Block) {
        self.block = block;
        trace!("allocating {}", block);
        self.full.reset();
        self.half.reset();
        self.shared.reset();

        // Live-ins, phis, and inputs all appear live at the block start and
        // interfere with each other, so allocate all of them before
        // assigning any. Precolored inputs come first so nothing lands on
        // top of them.
        let insts: Vec<Inst> = self.func.blocks[block].insts.clone();
        for &inst in &insts {
            if self.func.insts[inst].op == Opcode::Input {
                self.handle_precolored_input(inst);
            } else {
                break;
            }
        }
        let live_in: Vec<Value> = self.live.live_in[block].iter().collect();
        for def in live_in {
            self.handle_live_in(def);
        }
        for &inst in &insts {
            match self.func.insts[inst].op {
                Opcode::Phi => {
                    let dst = self.func.single_dst(inst);
                    self.handle_phi(dst);
                }
                Opcode::Input => self.handle_input(inst),
                _ => break,
            }
        }

        // Shuffling live-ins into place above may have queued copies; those
        // are reconciled through predecessor fixups instead.
        self.parallel_copies.clear();
        self.insert_live_in_moves();

        for &inst in &insts {
            trace!("processing {}", self.func.display_inst(inst));
            match self.func.insts[inst].op {
                Opcode::Phi => self.assign_phi(inst),
                Opcode::Input => self.assign_input(inst),
                Opcode::Split(_) => self.handle_split(inst),
                Opcode::Collect => self.handle_collect(inst),
                Opcode::ParallelCopy => self.handle_pcopy(inst),
                Opcode::Output => self.handle_output(inst),
                _ => self.handle_normal_instr(inst),
            }
        }

        self.insert_live_out_moves();
        let live_out: Vec<Value> = self.live.live_out[block].iter().collect();
        for def in live_out {
            self.handle_live_out(def);
        }
        self.blocks[block].visited = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{AluOp, DefSpec, Function, Opcode};
    use crate::regalloc::merge::{create_parallel_copies, merge_regs};

    fn prepare(func: &mut Function) -> Liveness {
        let domtree = DominatorTree::compute(func);
        create_parallel_copies(func);
        let live = Liveness::compute(func);
        merge_regs(func, &live, &domtree);
        live
    }

    fn sizes() -> FileSizes {
        FileSizes {
            full: 64,
            half: 0,
            shared: 16,
        }
    }

    #[test]
    fn straight_line_no_overlap() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::MovImm(2), &[DefSpec::full(2)], &[]);
        let v1 = func.single_dst(i1);
        let i2 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        let v2 = func.single_dst(i2);
        func.append_inst(b0, Opcode::Store(0), &[], &[v1, v2]);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);

        let r0 = func.values[v0].num.unwrap();
        let r1 = func.values[v1].num.unwrap();
        let r2 = func.values[v2].num.unwrap();
        // v1 is live across both v0 and v2; it must not overlap either
        // while they're live together.
        assert!(u32::from(r1) + 4 <= r0.into() || u32::from(r0) + 2 <= r1.into());
        assert!(u32::from(r1) + 4 <= r2.into() || u32::from(r2) + 2 <= r1.into());
        // Full registers are two-unit aligned.
        assert_eq!(r0 % 2, 0);
        assert_eq!(r1 % 2, 0);
    }

    #[test]
    fn killed_source_reused_by_alu_dst() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        let v1 = func.single_dst(i1);
        func.append_inst(b0, Opcode::Store(0), &[], &[v1]);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);
        // The ALU source-reuse heuristic lands the result on the killed
        // source.
        assert_eq!(func.values[v1].num, func.values[v0].num);
    }

    #[test]
    fn early_clobber_avoids_killed_source() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(
            b0,
            Opcode::Alu(AluOp::Add),
            &[DefSpec::full(1).early_clobber()],
            &[v0, v0],
        );
        let v1 = func.single_dst(i1);
        func.append_inst(b0, Opcode::Store(0), &[], &[v1]);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);
        assert_ne!(func.values[v1].num, func.values[v0].num);
    }

    #[test]
    fn tied_dst_with_killed_source_shares_register() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::MovImm(2), &[DefSpec::full(1)], &[]);
        let v1 = func.single_dst(i1);
        let i2 = func.append_inst(
            b0,
            Opcode::Alu(AluOp::Mad),
            &[DefSpec::full(1).tied(0)],
            &[v0, v1],
        );
        let v2 = func.single_dst(i2);
        func.append_inst(b0, Opcode::Store(0), &[], &[v2]);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);
        assert_eq!(func.values[v2].num, func.values[v0].num);
    }

    #[test]
    fn tied_dst_with_live_source_gets_copy() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(
            b0,
            Opcode::Alu(AluOp::Mad),
            &[DefSpec::full(1).tied(0)],
            &[v0, v0],
        );
        let v1 = func.single_dst(i1);
        // v0 stays live past the tied instruction.
        func.append_inst(b0, Opcode::Store(0), &[], &[v0, v1]);

        let live = prepare(&mut func);
        let before = func.blocks[b0].insts.len();
        allocate(&mut func, &live, sizes(), true);
        // The tied destination got a fresh register and a parallel copy was
        // inserted ahead of the instruction.
        assert_ne!(func.values[v1].num, func.values[v0].num);
        assert!(func.blocks[b0].insts.len() > before);
        let i = func.inst_index(i1);
        let prev = func.blocks[b0].insts[i - 1];
        assert_eq!(func.insts[prev].op, Opcode::ParallelCopy);
    }

    #[test]
    fn precolored_input_is_honored() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(
            b0,
            Opcode::Input,
            &[DefSpec::full(2).precolored(4)],
            &[],
        );
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Input, &[DefSpec::full(1)], &[]);
        let v1 = func.single_dst(i1);
        func.append_inst(b0, Opcode::Store(0), &[], &[v0, v1]);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);
        assert_eq!(func.values[v0].num, Some(4));
        let r1 = func.values[v1].num.unwrap();
        assert!(u32::from(r1) + 2 <= 4 || r1 >= 8);
    }

    #[test]
    fn output_forces_precolored_slots() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::MovImm(2), &[DefSpec::full(1)], &[]);
        let v1 = func.single_dst(i1);
        let out = func.append_inst(b0, Opcode::Output, &[], &[v0, v1]);
        func.insts[out].srcs[0].num = Some(0);
        func.insts[out].srcs[1].num = Some(2);

        let live = prepare(&mut func);
        allocate(&mut func, &live, sizes(), true);
        // Whatever registers the defs got, by the output they must sit in
        // the fixed slots; a shuffle was emitted if needed.
        assert_eq!(func.insts[out].srcs[0].num, Some(0));
        assert_eq!(func.insts[out].srcs[1].num, Some(2));
    }

    #[test]
    fn coalesced_collect_is_copy_free() {
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

        let live = prepare(&mut func);
        let before = func.blocks[b0].insts.len();
        allocate(&mut func, &live, sizes(), true);
        // Fully coalesced: no shuffles inserted, and the splits/collect all
        // resolve to offsets of the vector's register.
        assert_eq!(func.blocks[b0].insts.len(), before);
        let base = func.values[vec].num.unwrap();
        assert_eq!(func.values[s0].num, Some(base));
        assert_eq!(func.values[s1].num, Some(base + 2));
        assert_eq!(func.values[col].num, Some(base));
    }
}
