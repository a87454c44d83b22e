// This module is the entry point of the backend. compile() takes one HIR program and the ABI
// descriptor of the function it implements, builds the CFG, puts it into SSA form and runs
// the fixed pass pipeline once: machine-independent optimization, x86-64 lowering, SSA exit,
// register allocation and stack liveness. The allocated CFG is then flattened into the final
// instruction stream. Every compilation owns a fresh bumpalo arena and CompilationSession, so
// compilations share nothing; the only shared structure is the optional ShapeCache, which
// compile_cached() consults before compiling and populates afterwards.

//! The compilation driver.

use crate::core::{
    CompilationSession, CompileError, CompileOptions, CompileResult, SessionStats, ShapeCache,
};
use crate::hir::Program;
use crate::linearize::{linearize, Flat, PhiElimination};
use crate::passes::block_merge::BlockMerging;
use crate::passes::branch_elim::BranchElimination;
use crate::passes::constprop::ConstantPropagation;
use crate::passes::dce::DeadCodeElimination;
use crate::passes::reduce::Reduction;
use crate::passes::reorder::ValueReordering;
use crate::passes::return_spread::ReturnSpreading;
use crate::passes::{PassContext, PassManager};
use crate::regalloc::{RegisterAllocation, StackLiveness};
use crate::ssa::ir::{BlockId, Slot};
use crate::ssa::{build, construct};
use crate::x64::abi::{AbiDescriptor, FrameLayout};
use crate::x64::abi_lowering::AbiLowering;
use crate::x64::fusion::{InstructionCompaction, InstructionFusion};
use crate::x64::lowering::MachineLowering;
use crate::x64::write_barrier::WriteBarrierInsertion;
use crate::x64::zero_reg::ZeroRegisterSubstitution;
use bumpalo::Bump;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;
use std::sync::Arc;

/// A function ready for the assembler.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub code: Vec<Flat>,
    /// Position in `code` of the first element of every block.
    pub block_offsets: BTreeMap<BlockId, usize>,
    /// Pointer slots live before an instruction, keyed by block and index
    /// within the block.
    pub pointer_liveness: BTreeMap<(BlockId, usize), BTreeSet<Slot>>,
    pub frame: FrameLayout,
    pub stats: SessionStats,
}

impl CompiledFunction {
    /// Pointer slots live before position `pc` of `code`.
    pub fn slots_live_at(&self, pc: usize) -> BTreeSet<Slot> {
        self.pointer_liveness
            .iter()
            .find(|((block, idx), _)| self.block_offsets.get(block).is_some_and(|&o| o + idx == pc))
            .map(|(_, slots)| slots.clone())
            .unwrap_or_default()
    }
}

/// The pass pipeline, in execution order.
pub fn pipeline() -> PassManager {
    PassManager::new(vec![
        Box::new(ConstantPropagation::early()),
        Box::new(Reduction::early()),
        Box::new(BranchElimination),
        Box::new(BlockMerging::new()),
        Box::new(ReturnSpreading),
        Box::new(ValueReordering),
        Box::new(ConstantPropagation::late()),
        Box::new(Reduction::late()),
        Box::new(MachineLowering),
        Box::new(WriteBarrierInsertion),
        Box::new(AbiLowering),
        Box::new(InstructionFusion),
        Box::new(InstructionCompaction),
        Box::new(DeadCodeElimination),
        Box::new(PhiElimination),
        Box::new(ZeroRegisterSubstitution),
        Box::new(RegisterAllocation),
        Box::new(BlockMerging::post_allocation()),
        Box::new(StackLiveness),
    ])
}

/// Compile `program`, which implements a function with signature `abi`.
pub fn compile(
    program: &Program,
    abi: &AbiDescriptor,
    options: &CompileOptions,
) -> CompileResult<CompiledFunction> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena, options.clone());

    let mut cfg = build::build_cfg(program)?;
    construct::construct_ssa(&mut cfg, &session)?;
    if options.verify {
        cfg.verify("SSA Construction", true)?;
    }

    let ctx = PassContext::new(&session, abi);
    pipeline().run(&mut cfg, &ctx)?;

    let linear = linearize(&mut cfg)?;
    let artifacts = ctx.artifacts.into_inner();
    let frame = artifacts
        .frame
        .ok_or_else(|| CompileError::internal("register allocation produced no frame"))?;
    let stats = session.stats();
    log::info!(
        "compiled {} HIR instructions into {} elements: {} blocks, frame {} bytes, {} spills, {} reloads",
        program.len(),
        linear.code.len(),
        linear.block_offsets.len(),
        frame.frame_size,
        stats.spill_stores,
        stats.reloads
    );
    Ok(CompiledFunction {
        code: linear.code,
        block_offsets: linear.block_offsets,
        pointer_liveness: artifacts.pointer_liveness,
        frame,
        stats,
    })
}

/// [`compile`] through `cache`, keyed by the caller's notion of shape.
pub fn compile_cached<K: Eq + Hash + Clone>(
    cache: &ShapeCache<K, CompiledFunction>,
    key: &K,
    program: &Program,
    abi: &AbiDescriptor,
    options: &CompileOptions,
) -> CompileResult<Arc<CompiledFunction>> {
    cache.get_or_try_insert(key, || compile(program, abi, options))
}
