//! Block merging.
//!
//! A block ending in an unconditional jump absorbs its target when the
//! target has no other predecessor and no phi nodes. The absorbed block's
//! successors are re-pointed at the surviving block. Runs to a fixpoint and
//! is valid both in SSA form and after register allocation.

use super::{Pass, PassContext};
use crate::core::{CompileError, CompileResult};
use crate::ssa::ir::BlockId;
use crate::ssa::Cfg;

pub struct BlockMerging {
    name: &'static str,
}

impl BlockMerging {
    pub fn new() -> Self {
        Self { name: "Block Merging" }
    }

    /// The instance that runs after register allocation.
    pub fn post_allocation() -> Self {
        Self { name: "Post-Allocation Block Merging" }
    }
}

impl Default for BlockMerging {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for BlockMerging {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let merged = merge_blocks(cfg)?;
        ctx.session.record_blocks_removed(merged);
        Ok(())
    }
}

fn mergeable(cfg: &Cfg, id: BlockId) -> Option<BlockId> {
    let block = cfg.blocks.get(&id)?;
    let next = block.term.jump_target()?;
    let target = cfg.blocks.get(&next)?;
    let sole = target.pred.len() == 1 && target.pred[0] == id;
    (next != id && next != cfg.root && sole && target.phi.is_empty()).then_some(next)
}

/// Fuse jump chains; returns the number of blocks absorbed.
pub fn merge_blocks(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut merged = 0;
    loop {
        let mut changed = false;
        for id in cfg.rpo() {
            // A block absorbed earlier in this round is gone.
            if !cfg.blocks.contains_key(&id) {
                continue;
            }
            while let Some(next) = mergeable(cfg, id) {
                let absorbed = cfg
                    .blocks
                    .remove(&next)
                    .ok_or_else(|| CompileError::internal(format!("{} vanished", next)))?;
                for succ in absorbed.successors() {
                    cfg.block_mut(succ)?.replace_pred(next, id);
                }
                let block = cfg.block_mut(id)?;
                block.ins.extend(absorbed.ins);
                block.term = absorbed.term;
                log::trace!("merged {} into {}", next, id);
                merged += 1;
                changed = true;
            }
        }
        if !changed {
            return Ok(merged);
        }
        cfg.rebuild()?;
    }
}
