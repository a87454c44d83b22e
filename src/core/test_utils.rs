//! Test utilities for arena-based testing.
//!
//! Shared fixtures for unit tests: an arena-owning [`TestContext`], small
//! hand-built CFG shapes and helpers that take a HIR program into SSA form.

use super::options::CompileOptions;
use super::reg::{Reg, RegClass};
use super::session::CompilationSession;
use crate::hir::Program;
use crate::ssa::ir::{BlockId, CallHandle, Switch, Target, Terminator};
use crate::ssa::{build, construct, Cfg};
use crate::x64::abi::AbiDescriptor;
use bumpalo::Bump;
use std::collections::BTreeMap;

/// Test context that manages arena lifetime for tests.
pub struct TestContext {
    arena: Bump,
}

impl TestContext {
    pub fn new() -> Self {
        Self { arena: Bump::new() }
    }

    /// Create a compilation session using this context's arena.
    ///
    /// The returned session borrows from the TestContext, so the
    /// TestContext must outlive the session.
    pub fn create_session(&self) -> CompilationSession<'_> {
        CompilationSession::new(&self.arena, CompileOptions::default().with_verify(true))
    }

    pub fn session_with(&self, options: CompileOptions) -> CompilationSession<'_> {
        CompilationSession::new(&self.arena, options)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Handle of an external function taking and returning integers.
pub fn extern_handle(id: usize, args: usize, rets: usize) -> CallHandle {
    let abi = AbiDescriptor::sysv(&vec![RegClass::Int; args], &vec![RegClass::Int; rets])
        .expect("signature fits the ABI");
    CallHandle::new(id, format!("extern{}", id), abi)
}

fn two_way(cond: Reg, taken: BlockId, fallthrough: BlockId) -> Terminator {
    let mut br = BTreeMap::new();
    br.insert(1, Target::new(taken));
    Terminator::Switch(Switch { v: cond, ln: Target::new(fallthrough), br })
}

/// `0 -> {1, 2} -> 3`, with dominators computed.
pub fn diamond() -> Cfg {
    let mut cfg = Cfg::new();
    let b1 = cfg.create_block(Terminator::jump(BlockId(3)));
    let b2 = cfg.create_block(Terminator::jump(BlockId(3)));
    let b3 = cfg.create_block(Terminator::Return { r: Vec::new() });
    cfg.block_mut(cfg.root).unwrap().term = two_way(Reg::norm_int(0), b1, b2);
    cfg.recompute_predecessors();
    assert_eq!(b3, BlockId(3));
    cfg.rebuild().unwrap();
    cfg
}

/// `0 -> 1 -> 2 -> {1, 3}`, with dominators computed.
pub fn looped() -> Cfg {
    let mut cfg = Cfg::new();
    let b1 = cfg.create_block(Terminator::jump(BlockId(2)));
    let b3 = BlockId(3);
    let b2 = cfg.create_block(two_way(Reg::norm_int(0), b1, b3));
    cfg.create_block(Terminator::Return { r: Vec::new() });
    cfg.block_mut(cfg.root).unwrap().term = Terminator::jump(b1);
    assert_eq!(b2, BlockId(2));
    cfg.recompute_predecessors();
    cfg.rebuild().unwrap();
    cfg
}

/// Build the CFG of `program` and put it into SSA form.
pub fn ssa_from(program: &Program) -> Cfg {
    let ctx = TestContext::new();
    let session = ctx.create_session();
    let mut cfg = build::build_cfg(program).expect("program builds");
    construct::construct_ssa(&mut cfg, &session).expect("ssa construction succeeds");
    cfg
}
