//! SSA intermediate representation.
//!
//! - [`ir`]: instructions, terminators, basic blocks
//! - [`cfg`]: the control flow graph and its invariants
//! - [`build`]: HIR to CFG translation
//! - [`dominator`]: Lengauer–Tarjan dominators and frontiers
//! - [`construct`]: phi placement and renaming

pub mod build;
pub mod cfg;
pub mod construct;
pub mod dominator;
pub mod ir;

pub use cfg::Cfg;
pub use ir::{
    BasicBlock, BinaryOp, BlockId, CallHandle, Constness, Definitions, IrNode, Likeliness, Phi,
    Slot, SpillOp, Switch, Target, Terminator, UnaryOp, Usages,
};
