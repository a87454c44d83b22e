// This module serves as the central hub for hirc's shared infrastructure. It exports the
// register model used by every pass (virtual and physical register values and physical
// register sets), the compile error taxonomy, compile options, the arena-backed compilation
// session with its statistics, and the process-wide shape cache. Nothing in here knows about
// the pass pipeline itself; the SSA, pass, target and allocator modules build on top of it.

//! Core hirc infrastructure.
//!
//! # Key Components
//!
//! ## Registers (`reg`, `register_file`)
//! - Tagged virtual registers with an SSA version
//! - Hardware registers and bit sets for palettes and clobbers
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Compilation statistics
//!
//! ## Shape cache (`cache`)
//! - Lazily populated, read-mostly map of compiled functions

pub mod cache;
pub mod error;
pub mod options;
pub mod reg;
pub mod register_file;
pub mod session;

#[cfg(test)]
pub mod test_utils;

pub use cache::ShapeCache;
pub use error::{CompileError, CompileResult};
pub use options::{CompileOptions, StaticMemory};
pub use reg::{Reg, RegClass, RegKind, PN, RZ};
pub use register_file::{AsmReg, RegBitSet, NUM_GP_REGS};
pub use session::{CompilationSession, SessionStats};
