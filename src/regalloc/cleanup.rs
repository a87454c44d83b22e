//! Post-allocation cleanup.
//!
//! Runs once every register is physical. Removes copies that became self
//! copies, reloads of a slot into the register that already holds it,
//! stores of a value the slot already contains, reloads nobody reads and
//! stores to slots that are never reloaded.

use super::coalesce::remove_self_copies;
use super::liveness::{written, Liveness};
use crate::core::Reg;
use crate::ssa::ir::{IrNode, Slot, SpillOp};
use crate::ssa::Cfg;
use hashbrown::{HashMap, HashSet};

/// Drop spill traffic that moves a value where it already is.
fn remove_redundant_spills(cfg: &mut Cfg) -> usize {
    let mut removed = 0;
    for block in cfg.blocks.values_mut() {
        // Register known to hold the current contents of each slot.
        let mut holder: HashMap<Slot, Reg> = HashMap::new();
        let before = block.ins.len();
        block.ins.retain(|ins| match *ins {
            IrNode::Spill { r, slot, .. } if holder.get(&slot) == Some(&r) => false,
            IrNode::Spill { op: SpillOp::Reload, r, slot } => {
                holder.retain(|_, h| *h != r);
                holder.insert(slot, r);
                true
            }
            IrNode::Spill { op: SpillOp::Store, r, slot } => {
                holder.insert(slot, r);
                true
            }
            ref other => {
                for w in written(other) {
                    holder.retain(|_, h| *h != w);
                }
                true
            }
        });
        removed += before - block.ins.len();
    }
    removed
}

/// Drop reloads whose register is dead afterwards.
fn remove_dead_reloads(cfg: &mut Cfg) -> usize {
    let live = Liveness::compute(cfg);
    let mut removed = 0;
    for block in cfg.blocks.values_mut() {
        let after = live.live_after(block);
        let mut i = 0;
        let before = block.ins.len();
        block.ins.retain(|ins| {
            let keep = match ins {
                IrNode::Spill { op: SpillOp::Reload, r, .. } => after[i].contains(r),
                _ => true,
            };
            i += 1;
            keep
        });
        removed += before - block.ins.len();
    }
    removed
}

/// Drop stores to slots that no reload reads.
fn remove_unused_stores(cfg: &mut Cfg) -> usize {
    let reloaded: HashSet<Slot> = cfg
        .blocks
        .values()
        .flat_map(|b| b.ins.iter())
        .filter_map(|ins| match ins {
            IrNode::Spill { op: SpillOp::Reload, slot, .. } => Some(*slot),
            _ => None,
        })
        .collect();
    let mut removed = 0;
    for block in cfg.blocks.values_mut() {
        let before = block.ins.len();
        block.ins.retain(|ins| {
            !matches!(ins, IrNode::Spill { op: SpillOp::Store, slot, .. } if !reloaded.contains(slot))
        });
        removed += before - block.ins.len();
    }
    removed
}

/// Run every cleanup; returns the number of instructions removed.
pub fn cleanup(cfg: &mut Cfg) -> usize {
    let removed = remove_self_copies(cfg)
        + remove_redundant_spills(cfg)
        + remove_dead_reloads(cfg)
        + remove_unused_stores(cfg);
    log::trace!("allocation cleanup removed {} instructions", removed);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::ir::{BinaryOp, BlockId, Terminator};
    use crate::x64::regs::{RAX, RCX};

    fn slot(id: u32) -> Slot {
        Slot { id, ptr: false }
    }

    #[test]
    fn test_redundant_spill_traffic_is_removed() {
        let (a, c) = (RAX.reg(), RCX.reg());
        let mut cfg = Cfg::new();
        let block = cfg.block_mut(BlockId(0)).unwrap();
        block.ins = vec![
            IrNode::ConstInt { r: a, v: 1 },
            IrNode::Spill { op: SpillOp::Store, r: a, slot: slot(0) },
            // Slot 0 is already in RAX.
            IrNode::Spill { op: SpillOp::Reload, r: a, slot: slot(0) },
            IrNode::Copy { r: c, v: c },
            IrNode::Binary { r: c, x: a, y: a, op: BinaryOp::Add },
            IrNode::Spill { op: SpillOp::Reload, r: a, slot: slot(0) },
            // Dead: RCX is overwritten before any read.
            IrNode::Spill { op: SpillOp::Reload, r: c, slot: slot(0) },
            IrNode::ConstInt { r: c, v: 2 },
            IrNode::Spill { op: SpillOp::Store, r: c, slot: slot(1) },
            IrNode::ConstInt { r: a, v: 3 },
            IrNode::Spill { op: SpillOp::Reload, r: a, slot: slot(0) },
        ];
        block.term = Terminator::Return { r: vec![c, a] };
        let removed = cleanup(&mut cfg);
        let ins = &cfg.block(BlockId(0)).unwrap().ins;
        assert_eq!(removed, 5);
        assert_eq!(
            ins,
            &vec![
                IrNode::ConstInt { r: a, v: 1 },
                IrNode::Spill { op: SpillOp::Store, r: a, slot: slot(0) },
                IrNode::Binary { r: c, x: a, y: a, op: BinaryOp::Add },
                IrNode::ConstInt { r: c, v: 2 },
                IrNode::ConstInt { r: a, v: 3 },
                IrNode::Spill { op: SpillOp::Reload, r: a, slot: slot(0) },
            ]
        );
    }
}
