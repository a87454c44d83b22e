//! Return spreading.
//!
//! A small return block reached from several predecessors is cloned once per
//! extra predecessor. Each clone resolves the block's phis to the value
//! flowing in from its predecessor and defines fresh registers, so the graph
//! stays in SSA form and values no longer have to survive the join.

use super::{Pass, PassContext};
use crate::core::{CompileResult, Reg};
use crate::ssa::ir::{BasicBlock, BlockId, Definitions, Usages};
use crate::ssa::Cfg;
use std::collections::HashMap;

/// Return blocks above this size are left shared.
const MAX_SPREAD_INSTRUCTIONS: usize = 16;

pub struct ReturnSpreading;

impl Pass for ReturnSpreading {
    fn name(&self) -> &'static str {
        "Return Spreading"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        spread_returns(cfg)?;
        Ok(())
    }
}

/// Clone of `block` private to predecessor `pred`.
fn specialize(cfg: &mut Cfg, block: &BasicBlock, pred: BlockId) -> CompileResult<BlockId> {
    let mut rename: HashMap<Reg, Reg> = HashMap::new();
    for phi in &block.phi {
        if let Some(&v) = phi.v.get(&pred) {
            rename.insert(phi.r, v);
        }
    }
    let mut ins = block.ins.clone();
    for node in &mut ins {
        for u in node.usages() {
            if let Some(&to) = rename.get(u) {
                *u = to;
            }
        }
        for d in node.definitions() {
            if d.is_virtual() {
                let fresh = cfg.create_register(d.class());
                rename.insert(*d, fresh);
                *d = fresh;
            }
        }
    }
    let mut term = block.term.clone();
    for u in term.usages() {
        if let Some(&to) = rename.get(u) {
            *u = to;
        }
    }

    let id = cfg.create_block(term);
    let clone = cfg.block_mut(id)?;
    clone.ins = ins;
    clone.pred.push(pred);
    Ok(id)
}

/// Returns the number of clones created.
pub fn spread_returns(cfg: &mut Cfg) -> CompileResult<usize> {
    let candidates: Vec<BlockId> = cfg
        .blocks
        .values()
        .filter(|b| b.term.is_return() && b.pred.len() > 1 && b.ins.len() <= MAX_SPREAD_INSTRUCTIONS)
        .map(|b| b.id)
        .collect();
    let mut clones = 0;
    for id in candidates {
        let block = cfg.block(id)?.clone();
        for &pred in &block.pred[1..] {
            let copy = specialize(cfg, &block, pred)?;
            cfg.block_mut(pred)?.term.replace_successor(id, copy);
            cfg.block_mut(id)?.remove_pred(pred);
            clones += 1;
        }
        log::trace!("spread {} over {} predecessors", id, block.pred.len());
    }
    if clones > 0 {
        cfg.rebuild()?;
    }
    Ok(clones)
}
