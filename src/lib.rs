//! Aludra shader code generation library: SSA register allocation.
//!
//! This crate implements the register allocator for the Aludra GPU shader
//! compiler's instruction-level SSA IR. The front end lowers shaders into the
//! IR defined in [`ir`], with vector values connected to their scalar parts
//! through explicit `split`/`collect`/`parallel_copy` meta-instructions. The
//! allocator assigns a physical register range to every SSA value while
//! honoring the hardware's register file geometry (a merged full/half file
//! plus a small shared scalar file), spilling to private memory when register
//! pressure exceeds the budget.
//!
//! The main entry point is [`regalloc::run`].
#![deny(missing_docs)]

pub use crate::regalloc::{run, Options, Pressure, RegAllocError};

pub mod dominator_tree;
pub mod ir;
pub mod regalloc;

/// Even when trace logging is disabled, the trace macro has a significant performance cost so we
/// disable it by default.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}
