//! x86-64 target.
//!
//! - [`regs`]: hardware register names and the allocatable palette
//! - [`abi`]: System V argument assignment and frame layout
//! - [`ops`]: machine instructions, operands and memory addressing
//! - [`lowering`], [`write_barrier`], [`abi_lowering`]: HIR semantics to machine nodes
//! - [`fusion`]: address and load fusion, instruction compaction
//! - [`zero_reg`]: zero register substitution after SSA exit
//! - [`emu`]: an emulator for the final instruction stream

pub mod abi;
pub mod abi_lowering;
pub mod emu;
pub mod fusion;
pub mod lowering;
pub mod ops;
pub mod regs;
pub mod write_barrier;
pub mod zero_reg;

pub use abi::{AbiDescriptor, FrameLayout, FunctionFrame};
pub use emu::Emulator;
pub use ops::{Amd64Node, Mem, Operand};
