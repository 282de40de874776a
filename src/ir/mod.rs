//! Instruction-level SSA intermediate representation.
//!
//! This is the representation the register allocator consumes: a function is
//! a graph of basic blocks, each holding an ordered list of instructions.
//! Every instruction destination creates a [`Value`]; sources refer back to
//! values. Vector values are connected to their scalar parts through the
//! `split`/`collect`/`parallel_copy` meta-instructions, which the allocator
//! understands as register-file reshuffling rather than real computation.
//!
//! All IR objects are stored in arenas on [`Function`] and referenced by the
//! entity types in [`entities`]. The representation is deliberately mutable
//! and index-based: the allocator and the spiller rewrite the program in
//! place, and everything is discarded together at the end of a compile.

pub mod entities;

pub use self::entities::{Block, Inst, MergeSet, Value};

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use core::fmt;
use smallvec::SmallVec;

/// A physical register unit index within one of the register files.
///
/// Units are 16 bits wide: a half register occupies one unit, a full register
/// two consecutive units (aligned).
pub type PhysReg = u16;

/// ALU opcodes. Only the shape matters to the allocator; the actual
/// operation is opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Mul,
    Mad,
    Min,
    Max,
}

/// Special function unit opcodes (transcendentals).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SfuOp {
    Rcp,
    Rsq,
    Sin,
    Cos,
    Log2,
    Exp2,
}

/// Instruction opcode.
///
/// The set is closed: the allocator dispatches on it with `match`, and the
/// meta-opcodes (`Phi`, `Split`, `Collect`, `ParallelCopy`) are the only
/// instructions whose operands may share physical storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// An ALU operation.
    Alu(AluOp),
    /// A special-function-unit operation.
    Sfu(SfuOp),
    /// Move of an immediate into a register. Rematerializable.
    MovImm(u64),
    /// Register-to-register move. Only produced by copy lowering.
    Mov,
    /// Register-to-register swap. Only produced by copy lowering.
    Swap,
    /// Memory load from private memory at the given unit offset.
    Load(u32),
    /// Memory store to private memory at the given unit offset.
    Store(u32),
    /// Shader input, defined at the top of the entry block. The destination
    /// may be precolored.
    Input,
    /// End-of-stage output. Sources are precolored to the fixed output slots.
    Output,
    /// SSA phi. Must appear at the top of its block, one source per
    /// predecessor, in predecessor order.
    Phi,
    /// Extract the scalar component at the given index from a vector source.
    Split(u16),
    /// Gather scalar sources into a vector destination.
    Collect,
    /// Simultaneous multi-value transfer. Before allocation these appear
    /// only at block ends to carry phi arguments; the allocator inserts more
    /// of them to express live-range shuffling.
    ParallelCopy,
    /// Spill the source to the given spill-slot unit offset. Lowered to
    /// `Store` after allocation.
    SpillMacro(u32),
    /// Reload the destination from the given spill-slot unit offset.
    /// Lowered to `Load` after allocation.
    ReloadMacro(u32),
}

impl Opcode {
    /// Is this one of the meta-opcodes that only move values around the
    /// register file?
    pub fn is_meta(self) -> bool {
        matches!(
            self,
            Self::Phi | Self::Split(_) | Self::Collect | Self::ParallelCopy
        )
    }

    /// Does this instruction execute on the ALU or SFU pipe? Used by the
    /// allocator's source-reuse heuristic.
    pub fn is_alu_like(self) -> bool {
        matches!(self, Self::Alu(_) | Self::Sfu(_) | Self::Mov)
    }

    /// Can a value defined by this opcode be recomputed instead of reloaded?
    pub fn is_rematerializable(self) -> bool {
        matches!(self, Self::MovImm(_))
    }
}

/// A source operand.
#[derive(Clone, Debug, Default)]
pub struct Src {
    /// The value read, or `None` for an undef phi argument.
    pub value: PackedOption<Value>,
    /// This use kills the value (liveness ends here).
    pub kill: bool,
    /// This is the first operand, in source order, among this instruction's
    /// kills of the value.
    pub first_kill: bool,
    /// Physical register assigned by the allocator.
    pub num: Option<PhysReg>,
}

impl Src {
    /// A source reading `value`.
    pub fn read(value: Value) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// An undef source (only legal on phis).
    pub fn undef() -> Self {
        Self::default()
    }
}

/// Per-value data.
#[derive(Clone, Debug, Default)]
pub struct ValueData {
    /// Defining instruction.
    pub inst: PackedOption<Inst>,
    /// 16-bit lane class. Half values occupy one unit per component.
    pub half: bool,
    /// Lives in the shared scalar file instead of the full/half files.
    pub shared: bool,
    /// Vector width in components.
    pub comps: u16,
    /// The destination must not overlap any source of its instruction, even
    /// a killed one.
    pub early_clobber: bool,
    /// Dead def: no instruction reads this value. Set by liveness.
    pub unused: bool,
    /// Index of the source operand this destination is tied to, if any.
    pub tied: Option<u16>,
    /// Fixed physical register required by the hardware interface.
    pub precolored: Option<PhysReg>,
    /// Merge set membership.
    pub merge_set: PackedOption<MergeSet>,
    /// Unit offset of this value within its merge set.
    pub merge_set_offset: u32,
    /// Start of this value's range in the global interval space. Assigned by
    /// merge-set coalescing; values in one merge set get overlapping ranges.
    pub interval_start: u32,
    /// End of this value's range in the global interval space.
    pub interval_end: u32,
    /// Physical register assigned by the allocator.
    pub num: Option<PhysReg>,
}

/// Per-instruction data.
#[derive(Clone, Debug)]
pub struct InstData {
    /// The opcode.
    pub op: Opcode,
    /// Containing block, cleared when the instruction is removed.
    pub block: PackedOption<Block>,
    /// Destination values, in destination order.
    pub dsts: SmallVec<[Value; 2]>,
    /// Source operands.
    pub srcs: SmallVec<[Src; 2]>,
    /// Hardware repeat count; an instruction executes `1 + repeat` times.
    pub repeat: u8,
}

/// Per-block data.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Instructions in program order.
    pub insts: Vec<Inst>,
    /// Control-flow predecessors. The order matters: phi sources line up
    /// with it.
    pub preds: Vec<Block>,
    /// Control-flow successors.
    pub succs: Vec<Block>,
    /// Physical predecessors, used for divergence-control regions where
    /// shared values stay live along edges the logical CFG doesn't have.
    pub physical_preds: Vec<Block>,
    /// Physical successors.
    pub physical_succs: Vec<Block>,
}

/// A merge set: values proven safe to share overlapping physical storage.
#[derive(Clone, Debug, Default)]
pub struct MergeSetData {
    /// Total extent in units.
    pub size: u32,
    /// Required alignment in units.
    pub alignment: u32,
    /// Member values in dominance order of their definitions.
    pub regs: Vec<Value>,
    /// Preferred physical register for the whole set, once one member has
    /// been placed.
    pub preferred_reg: Option<PhysReg>,
    /// Spill slot unit offset, assigned by the spiller.
    pub spill_slot: Option<u32>,
}

/// Template for creating an instruction destination.
#[derive(Clone, Copy, Debug)]
pub struct DefSpec {
    /// Half class.
    pub half: bool,
    /// Shared file.
    pub shared: bool,
    /// Component count.
    pub comps: u16,
    /// Early-clobber destination.
    pub early_clobber: bool,
    /// Tied source index.
    pub tied: Option<u16>,
    /// Precolored physreg.
    pub precolored: Option<PhysReg>,
}

impl DefSpec {
    /// A full-register destination with `comps` components.
    pub fn full(comps: u16) -> Self {
        Self {
            half: false,
            shared: false,
            comps,
            early_clobber: false,
            tied: None,
            precolored: None,
        }
    }

    /// A half-register destination with `comps` components.
    pub fn half(comps: u16) -> Self {
        Self {
            half: true,
            ..Self::full(comps)
        }
    }

    /// A shared-file destination with `comps` components.
    pub fn shared(comps: u16) -> Self {
        Self {
            shared: true,
            ..Self::full(comps)
        }
    }

    /// Mark the destination early-clobber.
    pub fn early_clobber(self) -> Self {
        Self {
            early_clobber: true,
            ..self
        }
    }

    /// Tie the destination to source operand `idx`.
    pub fn tied(self, idx: u16) -> Self {
        Self {
            tied: Some(idx),
            ..self
        }
    }

    /// Precolor the destination.
    pub fn precolored(self, num: PhysReg) -> Self {
        Self {
            precolored: Some(num),
            ..self
        }
    }

    /// Copy the class and width of an existing value.
    pub fn like(func: &Function, value: Value) -> Self {
        let data = &func.values[value];
        Self {
            half: data.half,
            shared: data.shared,
            comps: data.comps,
            early_clobber: false,
            tied: None,
            precolored: None,
        }
    }
}

/// One function (shader variant) under compilation, together with the arenas
/// holding all of its IR objects.
pub struct Function {
    /// Symbolic name, for diagnostics only.
    pub name: String,
    /// Block arena.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Instruction arena. Removed instructions stay in the arena with their
    /// `block` cleared.
    pub insts: PrimaryMap<Inst, InstData>,
    /// Value arena.
    pub values: PrimaryMap<Value, ValueData>,
    /// Merge set arena. Rebuilt wholesale after spilling.
    pub merge_sets: PrimaryMap<MergeSet, MergeSetData>,
    /// Blocks in program order: entry first, then a reverse postorder.
    /// Critical edges are not allowed.
    pub layout: Vec<Block>,
}

impl Function {
    /// Create an empty function.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            values: PrimaryMap::new(),
            merge_sets: PrimaryMap::new(),
            layout: Vec::new(),
        }
    }

    /// Create a new block and append it to the layout.
    pub fn create_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        self.layout.push(block);
        block
    }

    /// Add a control-flow edge. Phi sources in `to` line up with the order
    /// in which edges are added.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    /// Add a physical edge (divergence reconvergence).
    pub fn add_physical_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].physical_succs.push(to);
        self.blocks[to].physical_preds.push(from);
    }

    fn make_value(&mut self, inst: Inst, spec: DefSpec) -> Value {
        self.values.push(ValueData {
            inst: inst.into(),
            half: spec.half,
            shared: spec.shared,
            comps: spec.comps,
            early_clobber: spec.early_clobber,
            tied: spec.tied,
            precolored: spec.precolored,
            ..ValueData::default()
        })
    }

    /// Create an instruction and insert it at `index` within `block`.
    pub fn insert_inst(
        &mut self,
        block: Block,
        index: usize,
        op: Opcode,
        defs: &[DefSpec],
        srcs: &[Src],
    ) -> Inst {
        let inst = self.insts.push(InstData {
            op,
            block: block.into(),
            dsts: SmallVec::new(),
            srcs: srcs.iter().cloned().collect(),
            repeat: 0,
        });
        for &spec in defs {
            let value = self.make_value(inst, spec);
            self.insts[inst].dsts.push(value);
        }
        self.blocks[block].insts.insert(index, inst);
        inst
    }

    /// Create an instruction at the end of `block`.
    pub fn append_inst(
        &mut self,
        block: Block,
        op: Opcode,
        defs: &[DefSpec],
        srcs: &[Value],
    ) -> Inst {
        let srcs: SmallVec<[Src; 4]> = srcs.iter().map(|&v| Src::read(v)).collect();
        let index = self.blocks[block].insts.len();
        self.insert_inst(block, index, op, defs, &srcs)
    }

    /// Create a phi at the top of `block`, after any existing phis. One
    /// source per predecessor, `None` meaning undef.
    pub fn append_phi(&mut self, block: Block, def: DefSpec, srcs: &[Option<Value>]) -> Inst {
        debug_assert_eq!(srcs.len(), self.blocks[block].preds.len());
        let srcs: SmallVec<[Src; 4]> = srcs
            .iter()
            .map(|v| match v {
                Some(v) => Src::read(*v),
                None => Src::undef(),
            })
            .collect();
        let index = self.blocks[block]
            .insts
            .iter()
            .position(|&i| self.insts[i].op != Opcode::Phi)
            .unwrap_or(self.blocks[block].insts.len());
        self.insert_inst(block, index, Opcode::Phi, &[def], &srcs)
    }

    /// Append a destination/source pair to an existing instruction. Only
    /// meaningful for parallel copies, which grow as phis and live-range
    /// shuffles are attached to them.
    pub fn append_copy_pair(&mut self, inst: Inst, def: DefSpec, src: Src) -> Value {
        debug_assert_eq!(self.insts[inst].op, Opcode::ParallelCopy);
        let value = self.make_value(inst, def);
        self.insts[inst].dsts.push(value);
        self.insts[inst].srcs.push(src);
        value
    }

    /// Remove `inst` from its block. The arena entry stays behind so stale
    /// references keep working, but the instruction no longer executes.
    pub fn remove_inst(&mut self, inst: Inst) {
        if let Some(block) = self.insts[inst].block.expand() {
            self.blocks[block].insts.retain(|&i| i != inst);
            self.insts[inst].block = PackedOption::default();
        }
    }

    /// The entry block.
    pub fn entry_block(&self) -> Block {
        self.layout[0]
    }

    /// Position of `inst` within its block.
    pub fn inst_index(&self, inst: Inst) -> usize {
        let block = self.insts[inst].block.expand().expect("removed instruction");
        self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not in its block")
    }

    /// The single destination of `inst`.
    pub fn single_dst(&self, inst: Inst) -> Value {
        debug_assert_eq!(self.insts[inst].dsts.len(), 1);
        self.insts[inst].dsts[0]
    }

    /// Element size of `value` in units: 1 for half values, 2 otherwise.
    pub fn elem_size(&self, value: Value) -> u32 {
        if self.values[value].half {
            1
        } else {
            2
        }
    }

    /// Total size of `value` in units.
    pub fn reg_size(&self, value: Value) -> u32 {
        self.elem_size(value) * u32::from(self.values[value].comps)
    }

    /// The instruction defining `value`.
    pub fn def_inst(&self, value: Value) -> Inst {
        self.values[value].inst.expand().expect("value has no def")
    }

    /// The block containing the definition of `value`.
    pub fn def_block(&self, value: Value) -> Block {
        self.insts[self.def_inst(value)]
            .block
            .expand()
            .expect("def instruction was removed")
    }

    /// Drop all merge sets and every value's membership. Used after spilling
    /// invalidates the coalescing decisions.
    pub fn clear_merge_sets(&mut self) {
        self.merge_sets = PrimaryMap::new();
        for (_, data) in self.values.iter_mut() {
            data.merge_set = PackedOption::default();
            data.merge_set_offset = 0;
            data.interval_start = 0;
            data.interval_end = 0;
        }
    }

    /// Displayable form of one instruction.
    pub fn display_inst(&self, inst: Inst) -> DisplayInst<'_> {
        DisplayInst { func: self, inst }
    }
}

/// Helper for printing one instruction.
pub struct DisplayInst<'a> {
    func: &'a Function,
    inst: Inst,
}

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let func = self.func;
        let data = &func.insts[self.inst];
        write!(f, "{}: ", self.inst)?;
        for (i, &dst) in data.dsts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let v = &func.values[dst];
            write!(f, "{}", dst)?;
            if v.half {
                write!(f, ":h{}", v.comps)?;
            } else if v.shared {
                write!(f, ":s{}", v.comps)?;
            } else {
                write!(f, ":f{}", v.comps)?;
            }
            if let Some(num) = v.num {
                write!(f, "@r{}", num)?;
            }
        }
        if !data.dsts.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{:?}", data.op)?;
        for (i, src) in data.srcs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match src.value.expand() {
                Some(v) => {
                    write!(f, " {}", v)?;
                    if src.kill {
                        write!(f, "(kill)")?;
                    }
                    if let Some(num) = src.num {
                        write!(f, "@r{}", num)?;
                    }
                }
                None => write!(f, " undef")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "function {}:", self.name)?;
        for &block in &self.layout {
            let data = &self.blocks[block];
            write!(f, "{}", block)?;
            if !data.preds.is_empty() {
                write!(f, " <- ")?;
                for (i, pred) in data.preds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", pred)?;
                }
            }
            writeln!(f, ":")?;
            for &inst in &data.insts {
                writeln!(f, "    {}", self.display_inst(inst))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_display() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let i0 = func.append_inst(b0, Opcode::MovImm(1), &[DefSpec::full(1)], &[]);
        let v0 = func.single_dst(i0);
        let i1 = func.append_inst(b0, Opcode::Alu(AluOp::Add), &[DefSpec::full(1)], &[v0, v0]);
        assert_eq!(func.inst_index(i1), 1);
        assert_eq!(func.reg_size(v0), 2);
        assert_eq!(func.def_inst(v0), i0);
        let listing = format!("{}", func);
        assert!(listing.contains("MovImm"));

        func.remove_inst(i1);
        assert_eq!(func.blocks[b0].insts.len(), 1);
    }

    #[test]
    fn phi_ordering() {
        let mut func = Function::new("t");
        let b0 = func.create_block();
        let b1 = func.create_block();
        let b2 = func.create_block();
        func.add_edge(b0, b2);
        func.add_edge(b1, b2);
        let i0 = func.append_inst(b0, Opcode::MovImm(0), &[DefSpec::half(1)], &[]);
        let v0 = func.single_dst(i0);
        let phi = func.append_phi(b2, DefSpec::half(1), &[Some(v0), None]);
        assert_eq!(func.insts[phi].srcs.len(), 2);
        assert!(func.insts[phi].srcs[1].value.is_none());
        // A later phi lands after the first one, still ahead of normal code.
        func.append_inst(b2, Opcode::Alu(AluOp::Add), &[DefSpec::half(1)], &[v0, v0]);
        let phi2 = func.append_phi(b2, DefSpec::half(1), &[None, None]);
        assert_eq!(func.inst_index(phi2), 1);
    }
}
