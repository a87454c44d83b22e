//! hirc - an SSA-based JIT backend for a register-based serializer IR.
//!
//! A [`hir::Program`] is a flat list of instructions over eight integer and
//! eight pointer registers with labeled branches. [`compile`] turns it into a
//! flat x86-64 instruction stream over hardware registers, together with the
//! frame layout and the pointer spill slots live at every instruction.
//!
//! # Primary Usage
//!
//! ```ignore
//! use hirc::{compile, AbiDescriptor, CompileOptions};
//! use hirc::core::RegClass;
//!
//! let abi = AbiDescriptor::sysv(&[RegClass::Int], &[RegClass::Int])?;
//! let compiled = compile(&program, &abi, &CompileOptions::new())?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Registers, errors, options, session and shape cache
//! - [`hir`] - The input IR, its builder and reference interpreter
//! - [`ssa`] - CFG construction, dominators and SSA construction
//! - [`passes`] - Pass framework and machine-independent optimizations
//! - [`x64`] - x86-64 lowering, ABI and the flat stream emulator
//! - [`regalloc`] - Graph-coloring register allocation
//! - [`linearize`] - SSA exit and block layout

pub mod compiler;
pub mod core;
pub mod hir;
pub mod linearize;
pub mod passes;
pub mod regalloc;
pub mod ssa;
pub mod x64;

pub use compiler::{compile, compile_cached, pipeline, CompiledFunction};
pub use core::{CompilationSession, CompileError, CompileOptions, CompileResult, ShapeCache};
pub use hir::Program;
pub use linearize::Flat;
pub use x64::{AbiDescriptor, Emulator};
