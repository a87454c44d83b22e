// This module implements value reordering, which shortens live ranges in two steps. Global
// sinking moves every movable definition from its block to the nearest common dominator of
// its uses (a phi operand counts as a use at the end of the corresponding predecessor), then
// walks back up the dominator tree until the loop depth is no deeper than the original block,
// so work is never moved into a loop. Blocks are visited in dominator pre-order and their
// instructions bottom-up, which lets a chain of dependent values sink together and keeps each
// moved definition ahead of its users. Local scheduling then rebuilds every block's order:
// instructions with side effects keep their relative order, and each movable instruction is
// emitted on demand right before the first instruction that consumes it; values only needed
// by later blocks go last, just before the terminator.

//! Value reordering: global sinking and local scheduling.

use super::{Pass, PassContext};
use crate::core::{CompileResult, Reg};
use crate::ssa::ir::{BlockId, IrNode};
use crate::ssa::Cfg;
use std::collections::{BTreeMap, HashMap, HashSet};

pub struct ValueReordering;

impl Pass for ValueReordering {
    fn name(&self) -> &'static str {
        "Value Reordering"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let sunk = sink_values(cfg)?;
        log::trace!("sank {} definitions", sunk);
        schedule_blocks(cfg);
        Ok(())
    }
}

/// Blocks where each register is read.
fn use_blocks(cfg: &Cfg) -> HashMap<Reg, Vec<BlockId>> {
    let mut out: HashMap<Reg, Vec<BlockId>> = HashMap::new();
    for b in cfg.blocks.values() {
        for phi in &b.phi {
            for (&pred, &v) in &phi.v {
                out.entry(v).or_default().push(pred);
            }
        }
        for ins in &b.ins {
            for u in ins.uses() {
                out.entry(u).or_default().push(b.id);
            }
        }
        for u in b.term.uses() {
            out.entry(u).or_default().push(b.id);
        }
    }
    out
}

fn sinkable(ins: &IrNode) -> bool {
    let defs = ins.defs();
    ins.is_movable() && !defs.is_empty() && defs.iter().all(|d| d.is_virtual())
}

/// Move movable definitions towards their uses. Returns how many moved.
pub fn sink_values(cfg: &mut Cfg) -> CompileResult<usize> {
    let loops = cfg.loop_depth();
    let depth = |b: &BlockId| loops.get(b).copied().unwrap_or(0);
    let mut uses = use_blocks(cfg);
    let mut moved = 0;

    for id in cfg.dom_preorder() {
        let ins = std::mem::take(&mut cfg.block_mut(id)?.ins);
        let mut kept: Vec<IrNode> = Vec::with_capacity(ins.len());
        let mut sunk: BTreeMap<BlockId, Vec<IrNode>> = BTreeMap::new();

        for node in ins.into_iter().rev() {
            if !sinkable(&node) {
                kept.push(node);
                continue;
            }
            let defs = node.defs();
            let sites: Vec<BlockId> = defs
                .iter()
                .flat_map(|d| uses.get(d).cloned().unwrap_or_default())
                .collect();
            let Some((&first, rest)) = sites.split_first() else {
                kept.push(node);
                continue;
            };
            let mut target = rest.iter().fold(first, |acc, &b| cfg.common_dominator(acc, b));
            while target != id && depth(&target) > depth(&id) {
                match cfg.dominated_by.get(&target) {
                    Some(&up) => target = up,
                    None => break,
                }
            }
            if target == id || !cfg.dominates(id, target) {
                kept.push(node);
                continue;
            }
            for u in node.uses() {
                if let Some(blocks) = uses.get_mut(&u) {
                    if let Some(slot) = blocks.iter_mut().find(|b| **b == id) {
                        *slot = target;
                    }
                }
            }
            sunk.entry(target).or_default().push(node);
            moved += 1;
        }

        kept.reverse();
        cfg.block_mut(id)?.ins = kept;
        for (target, mut nodes) in sunk {
            // Collected bottom-up; restore program order ahead of the target's code.
            nodes.reverse();
            let block = cfg.block_mut(target)?;
            nodes.append(&mut block.ins);
            block.ins = nodes;
        }
    }
    Ok(moved)
}

struct Scheduler<'a> {
    ins: &'a [IrNode],
    /// Index of the movable instruction defining each register locally.
    local: HashMap<Reg, usize>,
    emitted: HashSet<usize>,
    order: Vec<usize>,
}

impl Scheduler<'_> {
    fn demand(&mut self, r: Reg) {
        if let Some(&i) = self.local.get(&r) {
            self.emit(i);
        }
    }

    fn emit(&mut self, i: usize) {
        if !self.emitted.insert(i) {
            return;
        }
        for u in self.ins[i].uses() {
            self.demand(u);
        }
        self.order.push(i);
    }
}

/// Reorder each block so movable values are computed right before use.
pub fn schedule_blocks(cfg: &mut Cfg) {
    for block in cfg.blocks.values_mut() {
        let ins = std::mem::take(&mut block.ins);
        let mut local = HashMap::new();
        for (i, node) in ins.iter().enumerate() {
            if node.is_movable() {
                for d in node.defs() {
                    local.insert(d, i);
                }
            }
        }
        let mut s = Scheduler { ins: &ins, local, emitted: HashSet::new(), order: Vec::new() };
        for (i, node) in ins.iter().enumerate() {
            if !node.is_movable() {
                s.emit(i);
            }
        }
        for u in block.term.uses() {
            s.demand(u);
        }
        for i in 0..ins.len() {
            s.emit(i);
        }
        let order = s.order;
        let mut slots: Vec<Option<IrNode>> = ins.into_iter().map(Some).collect();
        block.ins = order.into_iter().filter_map(|i| slots[i].take()).collect();
    }
}
