//! Post-allocation lowering of meta-instructions.
//!
//! After allocation the meta-instructions are annotations over physical
//! registers: a parallel copy names a set of simultaneous transfers, and a
//! split or collect that didn't coalesce is a copy in disguise. This module
//! turns all of them into concrete `Mov`/`Swap` sequences, and rewrites the
//! spill/reload macros into hardware load/store form.
//!
//! The parallel-copy expansion is the usual graph resolution: repeatedly
//! emit a copy whose destination no other pending copy still reads, and
//! when none exists the remaining copies form cycles, which are broken with
//! a swap. Entries are decomposed to element granularity first so vector
//! copies and partially-overlapping transfers resolve uniformly.

use crate::ir::{DefSpec, Function, Inst, Opcode, PhysReg, Src, Value};
use crate::trace;

// One element-granular pending transfer.
#[derive(Clone, Copy, Debug)]
struct CopyEntry {
    dst: u32,
    src: u32,
    elem: u32,
    half: bool,
    shared: bool,
    value: Value,
}

fn overlap(a_start: u32, a_len: u32, b_start: u32, b_len: u32) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

/// Expand every remaining parallel-copy/split/collect meta-instruction into
/// moves and swaps, and delete the phis (which are no-ops by construction
/// once every argument shares the phi's register).
pub fn lower_copies(func: &mut Function) {
    for block_idx in 0..func.layout.len() {
        let block = func.layout[block_idx];
        let insts: Vec<Inst> = func.blocks[block].insts.clone();
        for inst in insts {
            match func.insts[inst].op {
                Opcode::Phi => {
                    let dst = func.single_dst(inst);
                    for src in &func.insts[inst].srcs {
                        if src.value.is_some() {
                            debug_assert_eq!(src.num, func.values[dst].num);
                        }
                    }
                    func.remove_inst(inst);
                }
                Opcode::Split(comp) => {
                    let dst = func.single_dst(inst);
                    let src = func.insts[inst].srcs[0].clone();
                    let sv = src.value.expand().expect("split of undef");
                    let elem = func.elem_size(dst);
                    let from =
                        u32::from(src.num.expect("unassigned split")) + u32::from(comp) * elem;
                    let to = u32::from(func.values[dst].num.expect("unallocated split dst"));
                    let mut entries = Vec::new();
                    push_entries(func, &mut entries, dst, to, sv, from, func.reg_size(dst));
                    replace_with_copies(func, inst, entries);
                }
                Opcode::Collect => {
                    let dst = func.single_dst(inst);
                    let base = u32::from(func.values[dst].num.expect("unallocated collect dst"));
                    let elem = func.elem_size(dst);
                    let mut entries = Vec::new();
                    let mut off = 0;
                    let srcs = func.insts[inst].srcs.clone();
                    for src in &srcs {
                        match (src.value.expand(), src.num) {
                            (Some(sv), Some(num)) => {
                                let size = func.reg_size(sv);
                                push_entries(func, &mut entries, dst, base + off, sv, num.into(), size);
                                off += size;
                            }
                            _ => off += elem,
                        }
                    }
                    replace_with_copies(func, inst, entries);
                }
                Opcode::ParallelCopy => {
                    let mut entries = Vec::new();
                    let pairs = func.insts[inst].srcs.len();
                    for i in 0..pairs {
                        let src = func.insts[inst].srcs[i].clone();
                        let dst = func.insts[inst].dsts[i];
                        let (sv, num) = match (src.value.expand(), src.num) {
                            (Some(sv), Some(num)) => (sv, num),
                            _ => continue,
                        };
                        let to = u32::from(func.values[dst].num.expect("unallocated copy dst"));
                        push_entries(func, &mut entries, dst, to, sv, num.into(), func.reg_size(dst));
                    }
                    replace_with_copies(func, inst, entries);
                }
                _ => {}
            }
        }
    }
}

// Decompose one transfer into element-granular entries, dropping the parts
// that are already in place.
fn push_entries(
    func: &Function,
    entries: &mut Vec<CopyEntry>,
    dst: Value,
    to: u32,
    src_value: Value,
    from: u32,
    size: u32,
) {
    let elem = func.elem_size(dst);
    let half = func.values[dst].half;
    let shared = func.values[dst].shared;
    let mut off = 0;
    while off < size {
        if to + off != from + off {
            entries.push(CopyEntry {
                dst: to + off,
                src: from + off,
                elem,
                half,
                shared,
                value: src_value,
            });
        }
        off += elem;
    }
}

// Replace `inst` with the resolved move/swap sequence for `entries`.
fn replace_with_copies(func: &mut Function, inst: Inst, mut entries: Vec<CopyEntry>) {
    let block = func.insts[inst].block.expand().expect("removed instruction");
    let mut index = func.inst_index(inst);
    func.remove_inst(inst);

    while !entries.is_empty() {
        // Emit any entry whose destination no pending copy still reads.
        if let Some(i) = entries.iter().position(|e| {
            !entries
                .iter()
                .any(|o| overlap(o.src, o.elem, e.dst, e.elem))
        }) {
            let e = entries.remove(i);
            let spec = DefSpec {
                half: e.half,
                shared: e.shared,
                comps: 1,
                early_clobber: false,
                tied: None,
                precolored: None,
            };
            let mov = func.insert_inst(
                block,
                index,
                Opcode::Mov,
                &[spec],
                &[Src {
                    value: e.value.into(),
                    kill: false,
                    first_kill: false,
                    num: Some(e.src as PhysReg),
                }],
            );
            let dst = func.single_dst(mov);
            func.values[dst].num = Some(e.dst as PhysReg);
            trace!("lowered copy r{} <- r{}", e.dst, e.src);
            index += 1;
            continue;
        }

        // Every remaining destination is still read: the entries form one
        // or more cycles. Break one with a swap and rewrite the sources
        // that the swap relocated.
        let e = entries.remove(0);
        let spec = DefSpec {
            half: e.half,
            shared: e.shared,
            comps: 1,
            early_clobber: false,
            tied: None,
            precolored: None,
        };
        let swap = func.insert_inst(
            block,
            index,
            Opcode::Swap,
            &[spec, spec],
            &[
                Src {
                    value: e.value.into(),
                    kill: false,
                    first_kill: false,
                    num: Some(e.src as PhysReg),
                },
                Src {
                    value: e.value.into(),
                    kill: false,
                    first_kill: false,
                    num: Some(e.dst as PhysReg),
                },
            ],
        );
        let d0 = func.insts[swap].dsts[0];
        let d1 = func.insts[swap].dsts[1];
        func.values[d0].num = Some(e.dst as PhysReg);
        func.values[d1].num = Some(e.src as PhysReg);
        trace!("lowered swap r{} <-> r{}", e.dst, e.src);
        index += 1;
        for o in entries.iter_mut() {
            if o.src == e.dst && o.elem == e.elem {
                o.src = e.src;
            } else if o.src == e.src && o.elem == e.elem {
                o.src = e.dst;
            } else {
                assert!(
                    !overlap(o.src, o.elem, e.dst, e.elem) && !overlap(o.src, o.elem, e.src, e.elem),
                    "mixed-width copy cycle"
                );
            }
        }
        // The swap may have put some pending sources in their final place.
        entries.retain(|o| o.src != o.dst);
    }
}

// Hardware loads and stores move at most four components at a time, and
// address private memory with a signed 13-bit offset.
const MAX_TRANSFER_COMPS: u16 = 4;
const ADDR_RANGE: u32 = 1 << 12;

/// Rewrite spill/reload macros into load/store form, splitting transfers
/// wider than the hardware allows.
pub fn lower_spill(func: &mut Function) {
    for block_idx in 0..func.layout.len() {
        let block = func.layout[block_idx];
        let insts: Vec<Inst> = func.blocks[block].insts.clone();
        for inst in insts {
            match func.insts[inst].op {
                Opcode::SpillMacro(slot) => {
                    let src = func.insts[inst].srcs[0].clone();
                    let value = src.value.expand().expect("spill of undef");
                    let base = src.num.expect("unassigned spill source");
                    let comps = func.values[value].comps;
                    let elem = func.elem_size(value);
                    assert!(
                        slot + func.reg_size(value) <= ADDR_RANGE,
                        "spill slot {} out of addressing range",
                        slot
                    );
                    if comps <= MAX_TRANSFER_COMPS {
                        func.insts[inst].op = Opcode::Store(slot);
                        continue;
                    }
                    let index = func.inst_index(inst);
                    func.remove_inst(inst);
                    let mut index = index;
                    let mut c = 0;
                    while c < comps {
                        let chunk = (comps - c).min(MAX_TRANSFER_COMPS);
                        let off = u32::from(c) * elem;
                        // A same-place view of the chunk; deleted as a
                        // no-op rename by copy lowering.
                        let view = func.insert_inst(
                            block,
                            index,
                            Opcode::Split(c),
                            &[DefSpec {
                                half: func.values[value].half,
                                shared: func.values[value].shared,
                                comps: chunk,
                                early_clobber: false,
                                tied: None,
                                precolored: None,
                            }],
                            &[Src {
                                value: value.into(),
                                kill: false,
                                first_kill: false,
                                num: Some(base),
                            }],
                        );
                        let part = func.single_dst(view);
                        func.values[part].num = Some(base + off as PhysReg);
                        index += 1;
                        func.insert_inst(
                            block,
                            index,
                            Opcode::Store(slot + off),
                            &[],
                            &[Src {
                                value: part.into(),
                                kill: false,
                                first_kill: false,
                                num: Some(base + off as PhysReg),
                            }],
                        );
                        index += 1;
                        c += chunk;
                    }
                }
                Opcode::ReloadMacro(slot) => {
                    let dst = func.single_dst(inst);
                    let base = func.values[dst].num.expect("unallocated reload dst");
                    let comps = func.values[dst].comps;
                    let elem = func.elem_size(dst);
                    assert!(
                        slot + func.reg_size(dst) <= ADDR_RANGE,
                        "reload slot {} out of addressing range",
                        slot
                    );
                    if comps <= MAX_TRANSFER_COMPS {
                        func.insts[inst].op = Opcode::Load(slot);
                        continue;
                    }
                    let mut index = func.inst_index(inst);
                    func.remove_inst(inst);
                    let mut c = 0;
                    while c < comps {
                        let chunk = (comps - c).min(MAX_TRANSFER_COMPS);
                        let off = u32::from(c) * elem;
                        let load = func.insert_inst(
                            block,
                            index,
                            Opcode::Load(slot + off),
                            &[DefSpec {
                                half: func.values[dst].half,
                                shared: func.values[dst].shared,
                                comps: chunk,
                                early_clobber: false,
                                tied: None,
                                precolored: None,
                            }],
                            &[],
                        );
                        let part = func.single_dst(load);
                        func.values[part].num = Some(base + off as PhysReg);
                        index += 1;
                        c += chunk;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Function;

    // Build a parallel copy with explicit physreg pairs.
    fn pcopy_with(func: &mut Function, block: crate::ir::Block, pairs: &[(u16, u16)]) -> Inst {
        let vals: Vec<Value> = pairs
            .iter()
            .map(|&(_, src)| {
                let inst = func.append_inst(block, Opcode::MovImm(0), &[DefSpec::full(1)], &[]);
                let v = func.single_dst(inst);
                func.values[v].num = Some(src);
                v
            })
            .collect();
        let pcopy = func.append_inst(block, Opcode::ParallelCopy, &[], &[]);
        for (&(dst, src), &v) in pairs.iter().zip(&vals) {
            let copy = func.append_copy_pair(
                pcopy,
                DefSpec::full(1),
                Src {
                    value: v.into(),
                    kill: false,
                    first_kill: false,
                    num: Some(src),
                },
            );
            func.values[copy].num = Some(dst);
        }
        pcopy
    }

    fn ops_in(func: &Function, block: crate::ir::Block) -> Vec<Opcode> {
        func.blocks[block]
            .insts
            .iter()
            .map(|&i| func.insts[i].op)
            .collect()
    }

    #[test]
    fn chain_resolves_in_dependency_order() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        // r4 <- r2, r2 <- r0: must move r4 <- r2 first.
        pcopy_with(&mut func, b0, &[(2, 0), (4, 2)]);
        lower_copies(&mut func);
        let movs: Vec<(u16, u16)> = func.blocks[b0]
            .insts
            .iter()
            .filter(|&&i| func.insts[i].op == Opcode::Mov)
            .map(|&i| {
                (
                    func.values[func.single_dst(i)].num.unwrap(),
                    func.insts[i].srcs[0].num.unwrap(),
                )
            })
            .collect();
        assert_eq!(movs, vec![(4, 2), (2, 0)]);
    }

    #[test]
    fn cycle_breaks_with_swap() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        // r0 <- r2, r2 <- r0: a pure swap.
        pcopy_with(&mut func, b0, &[(0, 2), (2, 0)]);
        lower_copies(&mut func);
        let ops = ops_in(&func, b0);
        assert_eq!(ops.iter().filter(|o| **o == Opcode::Swap).count(), 1);
        assert_eq!(ops.iter().filter(|o| **o == Opcode::Mov).count(), 0);
    }

    #[test]
    fn three_cycle_resolves_with_two_swaps() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        // r0 <- r2 <- r4 <- r0.
        pcopy_with(&mut func, b0, &[(0, 2), (2, 4), (4, 0)]);
        lower_copies(&mut func);
        let ops = ops_in(&func, b0);
        let swaps = ops.iter().filter(|o| **o == Opcode::Swap).count();
        let movs = ops.iter().filter(|o| **o == Opcode::Mov).count();
        // An n-cycle lowers to n - 1 swaps and no moves.
        assert_eq!(swaps, 2);
        assert_eq!(movs, 0);
    }

    #[test]
    fn same_place_copies_vanish() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let before = func.blocks[b0].insts.len();
        pcopy_with(&mut func, b0, &[(6, 6)]);
        lower_copies(&mut func);
        let ops = ops_in(&func, b0);
        // The sources created by the helper remain; the pcopy is gone with
        // no movs added.
        assert_eq!(ops.len(), before + 1);
        assert!(!ops.contains(&Opcode::ParallelCopy));
        assert!(!ops.contains(&Opcode::Mov));
    }

    #[test]
    fn wide_reload_splits_into_hardware_chunks() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let inst = func.append_inst(b0, Opcode::ReloadMacro(16), &[DefSpec::full(6)], &[]);
        let dst = func.single_dst(inst);
        func.values[dst].num = Some(8);
        lower_spill(&mut func);
        let loads: Vec<Opcode> = ops_in(&func, b0);
        assert_eq!(loads, vec![Opcode::Load(16), Opcode::Load(24)]);
        // Chunk placements follow the destination's registers.
        let nums: Vec<u16> = func.blocks[b0]
            .insts
            .iter()
            .map(|&i| func.values[func.single_dst(i)].num.unwrap())
            .collect();
        assert_eq!(nums, vec![8, 16]);
    }

    #[test]
    fn narrow_macros_rewrite_in_place() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let imov = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(2)], &[]);
        let v = func.single_dst(imov);
        func.values[v].num = Some(0);
        let spill = func.append_inst(b0, Opcode::SpillMacro(4), &[], &[v]);
        func.insts[spill].srcs[0].num = Some(0);
        lower_spill(&mut func);
        assert_eq!(func.insts[spill].op, Opcode::Store(4));
    }
}
