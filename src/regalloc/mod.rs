//! SSA register allocation.
//!
//! The passes in this module turn a function whose instructions still name
//! SSA values into one whose operands carry physical register units,
//! spilling to private memory when the hardware's register files are too
//! small for the program's peak demand.
//!
//! The pipeline, run by [`run`]:
//!
//! 1. Parallel copies are inserted ahead of every phi use
//!    ([`create_parallel_copies`]), making the program copy-friendly.
//! 2. Liveness is computed ([`Liveness::compute`]) and merge sets are built
//!    ([`merge_regs`]): groups of values allowed to share overlapping
//!    register storage, which is how split/collect become free.
//! 3. Peak pressure is measured ([`calc_pressure`]); if it exceeds the
//!    budget the spiller rewrites the program ([`spill`]) and liveness and
//!    merge sets are rebuilt from scratch.
//! 4. The allocator assigns physical registers block by block.
//! 5. In debug builds an independent dataflow pass re-derives every
//!    register's contents and cross-checks the assignment
//!    ([`validate::validate`]).
//! 6. Spill macros and the remaining meta-instructions are lowered to real
//!    loads, stores, moves, and swaps ([`lower_spill`], [`lower_copies`]).

pub(crate) mod alloc;
pub mod interval;
pub mod liveness;
pub mod lower;
pub mod merge;
pub mod spill;
pub mod validate;

pub use self::liveness::Liveness;
pub use self::lower::{lower_copies, lower_spill};
pub use self::merge::{create_parallel_copies, merge_regs};
pub use self::spill::{calc_min_limit_pressure, calc_pressure, spill};

use crate::dominator_tree::DominatorTree;
use crate::ir::{Function, Opcode, Value};
use crate::trace;
use thiserror::Error;

/// Size of the full register file in units: r0.x through r47.w, two units
/// per 32-bit lane. With merged registers, half values live in the low half
/// of this file.
pub const FULL_FILE_SIZE: u32 = 4 * 48 * 2;

/// Size of the half register file in units, and the boundary below which
/// half values must stay in the merged file.
pub const HALF_FILE_SIZE: u32 = 4 * 48;

/// Size of the shared scalar file in units.
pub const SHARED_FILE_SIZE: u32 = 2 * 4 * 8;

/// One of the three disjoint register files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// 32-bit lanes; also holds half values when registers are merged.
    Full,
    /// 16-bit lanes, used only without merged registers.
    Half,
    /// The small scalar file shared across a wave.
    Shared,
}

/// Allocatable sizes of the three files, in units.
#[derive(Clone, Copy, Debug)]
pub struct FileSizes {
    /// Full file size.
    pub full: u32,
    /// Half file size (zero when registers are merged).
    pub half: u32,
    /// Shared file size.
    pub shared: u32,
}

/// Register pressure, in units, per file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pressure {
    /// Full-file units (includes half values when registers are merged).
    pub full: u32,
    /// Half units.
    pub half: u32,
    /// Shared units.
    pub shared: u32,
}

/// Configuration for one allocation run. No global state: debug behaviors
/// are explicit fields threaded through the passes.
#[derive(Clone, Debug)]
pub struct Options {
    /// Half and full registers share one file (the usual configuration on
    /// current hardware).
    pub merged_regs: bool,
    /// Lower the pressure limit to the minimum at which spilling can still
    /// succeed, forcing nearly everything through the spiller. Debug aid.
    pub spill_everything: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            merged_regs: true,
            spill_everything: false,
        }
    }
}

/// A register allocation failure.
///
/// Only genuinely unsatisfiable inputs are reported this way; internal
/// inconsistencies (broken coalescing invariants, failed evictions that
/// were speculatively proven possible) are compiler bugs and panic instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    /// Register demand exceeds the file size even after spilling (or
    /// spilling is impossible for this file).
    #[error("register pressure unsatisfiable in the {file} file: {pressure} units > {limit}")]
    PressureUnsatisfiable {
        /// Which file ran out.
        file: &'static str,
        /// Measured peak pressure.
        pressure: u32,
        /// The allocatable budget.
        limit: u32,
    },
}

/// A convenient alias for a `Result` using [`RegAllocError`].
pub type CodegenResult<T> = Result<T, RegAllocError>;

// Which file a value allocates from.
pub(crate) fn value_file(func: &Function, value: Value, merged_regs: bool) -> FileKind {
    let data = &func.values[value];
    if data.shared {
        FileKind::Shared
    } else if merged_regs || !data.half {
        FileKind::Full
    } else {
        FileKind::Half
    }
}

// Size the full file to the measured demand, rounded up to whole vec4
// registers, keeping room for every precolored placement.
fn target_full_size(func: &Function, pressure: u32) -> u32 {
    let mut target = ((pressure + 7) / 8 * 8).max(8);
    for (v, data) in func.values.iter() {
        if let Some(p) = data.precolored {
            if !data.shared {
                target = target.max(u32::from(p) + func.reg_size(v));
            }
        }
    }
    for (_, data) in func.insts.iter() {
        if data.op != Opcode::Output {
            continue;
        }
        for src in &data.srcs {
            if let (Some(v), Some(num)) = (src.value.expand(), src.num) {
                if !func.values[v].shared {
                    target = target.max(u32::from(num) + func.reg_size(v));
                }
            }
        }
    }
    target.min(FULL_FILE_SIZE)
}

/// Run register allocation over `func`.
///
/// On success every instruction operand carries a physical register and all
/// meta-instructions have been lowered away. On failure the function is
/// left partially rewritten and must be discarded.
pub fn run(func: &mut Function, options: &Options) -> CodegenResult<()> {
    let mut domtree = DominatorTree::compute(func);
    create_parallel_copies(func);
    let mut liveness = Liveness::compute(func);
    merge_regs(func, &liveness, &domtree);

    let mut max = calc_pressure(func, &liveness, options.merged_regs);
    trace!(
        "max pressure: full {} half {} shared {}",
        max.full,
        max.half,
        max.shared
    );

    let mut limit = Pressure {
        full: FULL_FILE_SIZE,
        half: HALF_FILE_SIZE,
        shared: SHARED_FILE_SIZE,
    };
    if options.spill_everything {
        limit = calc_min_limit_pressure(func, &liveness, options.merged_regs);
        trace!(
            "min limit pressure: full {} half {} shared {}",
            limit.full,
            limit.half,
            limit.shared
        );
    }

    // There is no shared -> normal register spilling; over-demand on the
    // shared file cannot be fixed here.
    if max.shared > SHARED_FILE_SIZE {
        return Err(RegAllocError::PressureUnsatisfiable {
            file: "shared",
            pressure: max.shared,
            limit: SHARED_FILE_SIZE,
        });
    }

    let mut spilled = false;
    if max.full > limit.full || max.half > limit.half {
        trace!("max pressure exceeded, spilling");
        spill(func, &liveness, &domtree, &limit, options.merged_regs);
        spilled = true;

        // Spilling can break previously valid coalescing decisions, so the
        // merge sets are rebuilt wholesale, along with liveness. Phis the
        // spiller introduced still need their copy routing.
        func.clear_merge_sets();
        create_parallel_copies(func);
        domtree = DominatorTree::compute(func);
        liveness = Liveness::compute(func);
        merge_regs(func, &liveness, &domtree);

        max = calc_pressure(func, &liveness, options.merged_regs);
        if max.full > limit.full {
            return Err(RegAllocError::PressureUnsatisfiable {
                file: "full",
                pressure: max.full,
                limit: limit.full,
            });
        }
        if max.half > limit.half {
            return Err(RegAllocError::PressureUnsatisfiable {
                file: "half",
                pressure: max.half,
                limit: limit.half,
            });
        }
    }

    let sizes = FileSizes {
        full: target_full_size(func, max.full),
        half: if options.merged_regs {
            0
        } else {
            HALF_FILE_SIZE
        },
        shared: SHARED_FILE_SIZE,
    };
    trace!("full file size: {}", sizes.full);

    alloc::allocate(func, &liveness, sizes, options.merged_regs);

    if cfg!(debug_assertions) {
        validate::validate(func, sizes, options.merged_regs);
    }

    if spilled {
        lower_spill(func);
    }
    lower_copies(func);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, DefSpec, Function, Opcode};

    #[test]
    fn end_to_end_straight_line() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(3), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Mul), &[DefSpec::full(1)], &[v0, v0]);
        let v1 = func.single_dst(i1);
        func.append_inst(b0, Opcode::Store(0), &[], &[v1]);
        run(&mut func, &Options::default()).unwrap();
        assert!(func.values[v0].num.is_some());
        assert!(func.values[v1].num.is_some());
        // No meta instructions survive.
        for &block in &func.layout {
            for &inst in &func.blocks[block].insts {
                assert!(!func.insts[inst].op.is_meta());
            }
        }
    }

    #[test]
    fn shared_overpressure_is_reported() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let mut vals = Vec::new();
        for i in 0..33 {
            let inst = func.append_inst(b0, Opcode::MovImm(i), &[DefSpec::shared(1)], &[]);
            vals.push(func.single_dst(inst));
        }
        func.append_inst(b0, Opcode::Store(0), &[], &vals);
        let err = run(&mut func, &Options::default()).unwrap_err();
        assert!(matches!(
            err,
            RegAllocError::PressureUnsatisfiable { file: "shared", .. }
        ));
    }
}
