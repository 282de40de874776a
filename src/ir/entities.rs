//! IR entity references.
//!
//! Objects in the IR reference each other through dense `u32` indices rather
//! than Rust references: every value, instruction, block, and merge set lives
//! in a `PrimaryMap` on the [`Function`](super::Function), and everything dies
//! together when the compile of one shader variant finishes. There is a
//! separate index type for each entity so we don't lose type safety.

use cranelift_entity::entity_impl;

/// An opaque reference to an SSA value.
///
/// A value is created by the destination of exactly one instruction. Its
/// dense index ("name") is also the bit position used by liveness bitsets.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a merge set: an equivalence class of values that
/// may share overlapping physical register storage.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeSet(u32);
entity_impl!(MergeSet, "mset");
