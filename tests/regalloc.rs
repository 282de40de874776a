//! End-to-end register allocation tests.
//!
//! Every test runs the full pipeline through `run()`; in debug builds that
//! includes the post-allocation validator, so each passing test is also a
//! statement that the validator found no mismatched register read.

use aludra_codegen::ir::{AluOp, DefSpec, Function, Opcode, Value};
use aludra_codegen::{run, Options};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn no_meta_left(func: &Function) {
    for &block in &func.layout {
        for &inst in &func.blocks[block].insts {
            assert!(
                !func.insts[inst].op.is_meta(),
                "meta instruction survived lowering: {}",
                func.display_inst(inst)
            );
        }
    }
}

fn count_op(func: &Function, pred: impl Fn(Opcode) -> bool) -> usize {
    func.layout
        .iter()
        .flat_map(|&b| func.blocks[b].insts.iter())
        .filter(|&&i| pred(func.insts[i].op))
        .count()
}

#[test]
fn straight_line_program() {
    init_logging();
    let mut func = Function::new("straight");
    let b0 = func.create_block();
    let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
    let v0 = func.single_dst(i0);
    let i1 = func.append_inst(b0, Opcode::Sfu(aludra_codegen::ir::SfuOp::Rcp), &[DefSpec::full(1)], &[v0]);
    let v1 = func.single_dst(i1);
    let i2 = func.append_inst(b0, Opcode::Alu(AluOp::Mul), &[DefSpec::full(1)], &[v0, v1]);
    let v2 = func.single_dst(i2);
    func.append_inst(b0, Opcode::Store(0), &[], &[v2]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);
    assert!(func.values[v2].num.is_some());
}

#[test]
fn diamond_with_phi() {
    init_logging();
    let mut func = Function::new("diamond");
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
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);
}

#[test]
fn loop_with_carried_value() {
    init_logging();
    // b0 -> b1 (header) -> b2 (latch) -> b1, b1 -> b3. No critical edges.
    let mut func = Function::new("loop");
    let b0 = func.create_block();
    let b1 = func.create_block();
    let b2 = func.create_block();
    let b3 = func.create_block();
    func.add_edge(b0, b1);
    func.add_edge(b1, b2);
    func.add_edge(b2, b1);
    func.add_edge(b1, b3);
    let i0 = func.append_inst(b0, Opcode::MovImm(0), &[DefSpec::full(1)], &[]);
    let c0 = func.single_dst(i0);
    let phi = func.append_phi(b1, DefSpec::full(1), &[Some(c0), None]);
    let p = func.single_dst(phi);
    let isum = func.append_inst(b2, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[p, p]);
    let s = func.single_dst(isum);
    func.insts[phi].srcs[1].value = s.into();
    func.append_inst(b3, Opcode::Store(0), &[], &[p]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);
}

#[test]
fn vector_split_collect_roundtrip() {
    init_logging();
    let mut func = Function::new("vectors");
    let b0 = func.create_block();
    let iv = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(4)], &[]);
    let vec = func.single_dst(iv);
    let mut parts = Vec::new();
    for c in 0..4 {
        let isplit = func.append_inst(b0, Opcode::Split(c), &[DefSpec::full(1)], &[vec]);
        parts.push(func.single_dst(isplit));
    }
    let ic = func.append_inst(b0, Opcode::Collect, &[DefSpec::full(4)], &parts);
    let col = func.single_dst(ic);
    func.append_inst(b0, Opcode::Store(0), &[], &[col]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);
}

/// A `collect` of four single-component `split` results of one parent
/// vector, immediately followed by a full-vector use, must allocate with
/// zero register copies: full coalescing through the merge sets.
#[test]
fn coalesced_collect_emits_zero_moves() {
    init_logging();
    let mut func = Function::new("zero-copy");
    let b0 = func.create_block();
    let iv = func.append_inst(b0, Opcode::Load(0), &[DefSpec::full(4)], &[]);
    let vec = func.single_dst(iv);
    let mut parts = Vec::new();
    for c in 0..4 {
        let isplit = func.append_inst(b0, Opcode::Split(c), &[DefSpec::full(1)], &[vec]);
        parts.push(func.single_dst(isplit));
    }
    let ic = func.append_inst(b0, Opcode::Collect, &[DefSpec::full(4)], &parts);
    let col = func.single_dst(ic);
    func.append_inst(b0, Opcode::Store(0), &[], &[col]);
    run(&mut func, &Options::default()).unwrap();
    assert_eq!(count_op(&func, |op| op == Opcode::Mov), 0);
    assert_eq!(count_op(&func, |op| op == Opcode::Swap), 0);
}

#[test]
fn tied_destination_with_live_source() {
    init_logging();
    let mut func = Function::new("tied");
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
    func.append_inst(b0, Opcode::Store(0), &[], &[v0, v1]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);
    assert_ne!(func.values[v1].num, func.values[v0].num);
    // The tied constraint materialized as a copy into the destination.
    assert!(count_op(&func, |op| op == Opcode::Mov) >= 1);
}

/// Fifty live vec4 values exceed the 48-register file and must trigger the
/// spiller; the resulting program contains a spill store and a reload load
/// referencing the same slot, and still allocates (and validates) cleanly.
#[test]
fn fifty_vectors_trigger_spiller() {
    init_logging();
    let mut func = Function::new("pressure");
    let b0 = func.create_block();
    let mut loads = Vec::new();
    for i in 0..50 {
        // High offsets so program loads are distinguishable from reloads.
        let inst = func.append_inst(b0, Opcode::Load(100_000 + i), &[DefSpec::full(4)], &[]);
        loads.push(func.single_dst(inst));
    }
    let mut acc = loads[0];
    for &l in &loads[1..] {
        let inst = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(4)], &[acc, l]);
        acc = func.single_dst(inst);
    }
    func.append_inst(b0, Opcode::Store(100_050), &[], &[acc]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);

    let mut spill_slots = Vec::new();
    let mut reload_slots = Vec::new();
    for &block in &func.layout {
        for &inst in &func.blocks[block].insts {
            match func.insts[inst].op {
                Opcode::Store(s) if s < 100_000 => spill_slots.push(s),
                Opcode::Load(s) if s < 100_000 => reload_slots.push(s),
                _ => {}
            }
        }
    }
    assert!(
        !reload_slots.is_empty(),
        "spiller inserted no reloads under pressure"
    );
    assert!(
        reload_slots.iter().any(|s| spill_slots.contains(s)),
        "no reload refers to a spilled slot"
    );
}

/// Two predecessors that independently place the same live-in value in
/// different registers get exactly one corrective copy each (here: only the
/// disagreeing one), and the join block itself stays copy-free.
#[test]
fn join_reconciles_in_predecessors_only() {
    init_logging();
    let mut func = Function::new("join");
    let b0 = func.create_block();
    let b1 = func.create_block();
    let b2 = func.create_block();
    let b3 = func.create_block();
    func.add_edge(b0, b1);
    func.add_edge(b0, b2);
    func.add_edge(b1, b3);
    func.add_edge(b2, b3);
    let ix = func.append_inst(b0, Opcode::MovImm(7), &[DefSpec::full(1)], &[]);
    let x = func.single_dst(ix);
    let iv = func.append_inst(b0, Opcode::MovImm(9), &[DefSpec::full(1)], &[]);
    let v = func.single_dst(iv);
    // The then-side forces v into a fixed output slot, moving it away from
    // wherever b0 put it.
    let out = func.append_inst(b1, Opcode::Output, &[], &[v]);
    func.insts[out].srcs[0].num = Some(4);
    func.append_inst(b3, Opcode::Store(0), &[], &[x, v]);
    run(&mut func, &Options::default()).unwrap();
    no_meta_left(&func);

    let movs_in = |b| {
        func.blocks[b]
            .insts
            .iter()
            .filter(|&&i| matches!(func.insts[i].op, Opcode::Mov | Opcode::Swap))
            .count()
    };
    // The join block never receives fixup copies.
    assert_eq!(movs_in(b3), 0);
    // The disagreeing predecessor gets exactly one.
    assert_eq!(movs_in(b2), 1);
}

#[test]
fn half_values_stay_below_half_boundary() {
    init_logging();
    let mut func = Function::new("half");
    let b0 = func.create_block();
    let mut vals = Vec::new();
    for i in 0..8 {
        let inst = func.append_inst(b0, Opcode::MovImm(i), &[DefSpec::half(2)], &[]);
        vals.push(func.single_dst(inst));
    }
    let ifull = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(2)], &[]);
    let vfull = func.single_dst(ifull);
    let mut srcs: Vec<Value> = vals.clone();
    srcs.push(vfull);
    func.append_inst(b0, Opcode::Store(0), &[], &srcs);
    run(&mut func, &Options::default()).unwrap();
    for &v in &vals {
        let num = u32::from(func.values[v].num.unwrap());
        assert!(
            num + func.reg_size(v) <= aludra_codegen::regalloc::HALF_FILE_SIZE,
            "half value past the half boundary"
        );
    }
}

#[test]
fn spill_everything_mode_still_allocates() {
    init_logging();
    let mut func = Function::new("spillall");
    let b0 = func.create_block();
    let mut vals = Vec::new();
    for i in 0..4 {
        let inst = func.append_inst(b0, Opcode::Load(100 + i), &[DefSpec::full(1)], &[]);
        vals.push(func.single_dst(inst));
    }
    for &v in &vals {
        func.append_inst(b0, Opcode::Store(0), &[], &[v]);
    }
    let options = Options {
        spill_everything: true,
        ..Options::default()
    };
    run(&mut func, &options).unwrap();
    no_meta_left(&func);
}

#[test]
fn precolored_inputs_flow_through() {
    init_logging();
    let mut func = Function::new("inputs");
    let b0 = func.create_block();
    let i0 = func.append_inst(b0, Opcode::Input, &[DefSpec::full(4).precolored(0)], &[]);
    let v0 = func.single_dst(i0);
    let i1 = func.append_inst(b0, Opcode::Input, &[DefSpec::full(2)], &[]);
    let v1 = func.single_dst(i1);
    let i2 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(4)], &[v0, v0]);
    let v2 = func.single_dst(i2);
    func.append_inst(b0, Opcode::Store(0), &[], &[v1, v2]);
    run(&mut func, &Options::default()).unwrap();
    assert_eq!(func.values[v0].num, Some(0));
    // The second input landed clear of the precolored one.
    let n1 = u32::from(func.values[v1].num.unwrap());
    assert!(n1 >= 8);
}
