//! Liveness of pointer spill slots.
//!
//! A pointer slot is live from a store to the last reload that can read it.
//! The collector needs that set at every call, so the pass records it before
//! every instruction where it is not empty.

use super::liveness::ProgramPoint;
use crate::core::CompileResult;
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{IrNode, Slot, SpillOp};
use crate::ssa::{BlockId, Cfg};
use std::collections::{BTreeMap, BTreeSet};

pub struct StackLiveness;

impl Pass for StackLiveness {
    fn name(&self) -> &'static str {
        "Stack Liveness Analysis"
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let live = pointer_slot_liveness(cfg);
        log::debug!("{} program points with live pointer slots", live.len());
        ctx.artifacts.borrow_mut().pointer_liveness = live;
        Ok(())
    }
}

fn transfer(ins: &IrNode, live: &mut BTreeSet<Slot>) {
    match ins {
        IrNode::Spill { op: SpillOp::Store, slot, .. } if slot.ptr => {
            live.remove(slot);
        }
        IrNode::Spill { op: SpillOp::Reload, slot, .. } if slot.ptr => {
            live.insert(*slot);
        }
        _ => {}
    }
}

/// Pointer slots live before each instruction, non-empty sets only.
pub fn pointer_slot_liveness(cfg: &Cfg) -> BTreeMap<ProgramPoint, BTreeSet<Slot>> {
    let mut live_in: BTreeMap<BlockId, BTreeSet<Slot>> = BTreeMap::new();
    let post_order: Vec<BlockId> = cfg.rpo().into_iter().rev().collect();
    let live_out = |id: BlockId, live_in: &BTreeMap<BlockId, BTreeSet<Slot>>| -> BTreeSet<Slot> {
        cfg.blocks
            .get(&id)
            .map(|b| {
                b.successors()
                    .iter()
                    .filter_map(|s| live_in.get(s))
                    .flatten()
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &id in &post_order {
            let Some(block) = cfg.blocks.get(&id) else {
                continue;
            };
            let mut live = live_out(id, &live_in);
            for ins in block.ins.iter().rev() {
                transfer(ins, &mut live);
            }
            if live_in.get(&id) != Some(&live) {
                live_in.insert(id, live);
                changed = true;
            }
        }
    }

    let mut out = BTreeMap::new();
    for &id in &post_order {
        let Some(block) = cfg.blocks.get(&id) else {
            continue;
        };
        let mut live = live_out(id, &live_in);
        for (i, ins) in block.ins.iter().enumerate().rev() {
            transfer(ins, &mut live);
            if !live.is_empty() {
                out.insert((id, i), live.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::diamond;
    use crate::x64::regs::{RAX, RCX};

    fn ptr_slot(id: u32) -> Slot {
        Slot { id, ptr: true }
    }

    #[test]
    fn test_slot_is_live_between_store_and_reload() {
        // diamond(): 0 -> {1, 2} -> 3
        let mut cfg = diamond();
        let s = ptr_slot(0);
        cfg.block_mut(BlockId(0)).unwrap().ins = vec![
            IrNode::Spill { op: SpillOp::Store, r: RAX.reg(), slot: s },
            IrNode::Breakpoint,
        ];
        cfg.block_mut(BlockId(1)).unwrap().ins = vec![IrNode::Breakpoint];
        cfg.block_mut(BlockId(3)).unwrap().ins = vec![
            IrNode::Breakpoint,
            IrNode::Spill { op: SpillOp::Reload, r: RCX.reg(), slot: s },
            IrNode::Breakpoint,
        ];
        let live = pointer_slot_liveness(&cfg);
        assert!(!live.contains_key(&(BlockId(0), 0)));
        assert_eq!(live[&(BlockId(0), 1)], [s].into_iter().collect());
        assert!(live.contains_key(&(BlockId(1), 0)));
        assert!(live.contains_key(&(BlockId(3), 1)));
        assert!(!live.contains_key(&(BlockId(3), 2)));
    }

    #[test]
    fn test_integer_slots_are_ignored() {
        let mut cfg = diamond();
        let s = Slot { id: 0, ptr: false };
        cfg.block_mut(BlockId(3)).unwrap().ins =
            vec![IrNode::Spill { op: SpillOp::Reload, r: RAX.reg(), slot: s }];
        assert!(pointer_slot_liveness(&cfg).is_empty());
    }
}
