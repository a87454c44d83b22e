// This module expands garbage collector write barriers. A WriteBarrier placeholder stores a
// pointer through memory, but only a plain store while the collector's barrier flag (one byte
// at a fixed address) is clear; otherwise the runtime function must see the store. Each
// placeholder splits its block in four: the head keeps the preceding instructions and tests
// the flag, the fast block performs the store directly (predicted likely), the slow block
// calls the runtime with the value and the target address (predicted unlikely), and a new
// continuation block receives the remaining instructions and the original terminator. The
// continuation may hold further placeholders, so blocks are re-scanned until none are left.

//! Write barrier insertion.

use super::ops::{Amd64Node, Mem};
use crate::core::{CompileError, CompileResult, RegClass};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{BlockId, Constness, IrNode, Likeliness, Switch, Target, Terminator};
use crate::ssa::Cfg;
use std::collections::BTreeMap;

pub struct WriteBarrierInsertion;

impl Pass for WriteBarrierInsertion {
    fn name(&self) -> &'static str {
        "Write Barrier Insertion"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let expanded = insert_write_barriers(cfg)?;
        if expanded > 0 {
            log::debug!("expanded {} write barriers", expanded);
        }
        Ok(())
    }
}

/// Expand every placeholder; returns how many were expanded.
pub fn insert_write_barriers(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut work: Vec<BlockId> = cfg.block_ids();
    let mut expanded = 0;
    while let Some(id) = work.pop() {
        let Some(at) = cfg
            .block(id)?
            .ins
            .iter()
            .position(|i| matches!(i, IrNode::WriteBarrier { .. }))
        else {
            continue;
        };
        let cont = split(cfg, id, at)?;
        expanded += 1;
        work.push(cont);
    }
    if expanded > 0 {
        cfg.rebuild()?;
    }
    Ok(expanded)
}

/// Split `id` at the placeholder at `at`; returns the continuation block.
fn split(cfg: &mut Cfg, id: BlockId, at: usize) -> CompileResult<BlockId> {
    let flag_addr = cfg.create_register(RegClass::Ptr);
    let flag = cfg.create_register(RegClass::Int);

    let block = cfg.block_mut(id)?;
    let mut tail = block.ins.split_off(at);
    let placeholder = tail.remove(0);
    let old_term = std::mem::replace(&mut block.term, Terminator::Return { r: Vec::new() });
    let IrNode::WriteBarrier { r, mem, var, func } = placeholder else {
        return Err(CompileError::internal("write barrier position moved"));
    };

    let cont = cfg.create_block(old_term);
    for succ in cfg.block(cont)?.successors() {
        cfg.block_mut(succ)?.replace_pred(id, cont);
    }
    cfg.block_mut(cont)?.ins = tail;

    let fast = cfg.create_block(Terminator::jump(cont));
    cfg.block_mut(fast)?.ins.push(IrNode::Machine(Amd64Node::Store { r, m: Mem::base(mem), n: 8 }));
    let slow = cfg.create_block(Terminator::jump(cont));
    cfg.block_mut(slow)?.ins.push(IrNode::Call { func, input: vec![r, mem], output: Vec::new() });
    cfg.block_mut(cont)?.pred = vec![fast, slow];
    cfg.block_mut(fast)?.pred.push(id);
    cfg.block_mut(slow)?.pred.push(id);

    let head = cfg.block_mut(id)?;
    head.ins.push(IrNode::ConstPtr { r: flag_addr, p: var, m: Constness::Volatile });
    head.ins.push(IrNode::Machine(Amd64Node::Load { r: flag, m: Mem::base(flag_addr), n: 1 }));
    let mut br = BTreeMap::new();
    br.insert(0, Target::with_likeliness(fast, Likeliness::Likely));
    head.term = Terminator::Switch(Switch {
        v: flag,
        ln: Target::with_likeliness(slow, Likeliness::Unlikely),
        br,
    });
    log::trace!("{}: write barrier split into {}, {}, {}", id, fast, slow, cont);
    Ok(cont)
}
