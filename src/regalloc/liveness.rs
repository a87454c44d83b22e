//! Backward liveness over registers.
//!
//! Works on the CFG once it has left SSA form. Physical registers take part
//! like any other register, and the registers an instruction clobbers count
//! as written by it. Each block is summarized once (registers read before
//! being written, registers written) and the fixpoint runs over those
//! summaries in post-order.

use crate::core::Reg;
use crate::ssa::ir::{clobbered_regs, BasicBlock, BlockId, IrNode};
use crate::ssa::Cfg;
use std::collections::{BTreeMap, BTreeSet};

/// A position in the CFG: the instruction at `.1` of block `.0`.
pub type ProgramPoint = (BlockId, usize);

/// Registers written by `ins`, clobbers included.
pub fn written(ins: &IrNode) -> Vec<Reg> {
    let mut out = ins.defs();
    if let IrNode::Machine(m) = ins {
        for r in clobbered_regs(&m.clobbers()) {
            if !out.contains(&r) {
                out.push(r);
            }
        }
    }
    out
}

/// Registers read by `ins`, zero registers excluded.
pub fn read(ins: &IrNode) -> Vec<Reg> {
    let mut out: Vec<Reg> = ins.uses().into_iter().filter(|r| !r.is_zero()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[derive(Debug, Default)]
struct Summary {
    upward: BTreeSet<Reg>,
    written: BTreeSet<Reg>,
}

impl Summary {
    fn read(&mut self, r: Reg) {
        if !self.written.contains(&r) {
            self.upward.insert(r);
        }
    }
}

fn summarize(block: &BasicBlock) -> Summary {
    let mut s = Summary::default();
    for ins in &block.ins {
        for r in read(ins) {
            s.read(r);
        }
        s.written.extend(written(ins));
    }
    for r in block.term.uses() {
        if !r.is_zero() {
            s.read(r);
        }
    }
    s
}

/// Live-in and live-out sets of every block.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub live_in: BTreeMap<BlockId, BTreeSet<Reg>>,
    pub live_out: BTreeMap<BlockId, BTreeSet<Reg>>,
}

impl Liveness {
    pub fn compute(cfg: &Cfg) -> Self {
        let summaries: BTreeMap<BlockId, Summary> =
            cfg.blocks.values().map(|b| (b.id, summarize(b))).collect();
        let mut live = Liveness::default();
        for &id in summaries.keys() {
            live.live_in.insert(id, BTreeSet::new());
            live.live_out.insert(id, BTreeSet::new());
        }
        let post_order: Vec<BlockId> = cfg.rpo().into_iter().rev().collect();

        let mut changed = true;
        while changed {
            changed = false;
            for &id in &post_order {
                let Some(block) = cfg.blocks.get(&id) else {
                    continue;
                };
                let mut out = BTreeSet::new();
                for succ in block.successors() {
                    if let Some(s) = live.live_in.get(&succ) {
                        out.extend(s.iter().copied());
                    }
                }
                let summary = &summaries[&id];
                let mut inn: BTreeSet<Reg> = out.difference(&summary.written).copied().collect();
                inn.extend(summary.upward.iter().copied());
                if live.live_in.get(&id) != Some(&inn) || live.live_out.get(&id) != Some(&out) {
                    changed = true;
                    live.live_in.insert(id, inn);
                    live.live_out.insert(id, out);
                }
            }
        }
        live
    }

    /// Registers live after each instruction of `block`; the terminator's
    /// operands count as live after the last instruction.
    pub fn live_after(&self, block: &BasicBlock) -> Vec<BTreeSet<Reg>> {
        let mut live = self.live_out.get(&block.id).cloned().unwrap_or_default();
        live.extend(block.term.uses().into_iter().filter(|r| !r.is_zero()));
        let mut out = vec![BTreeSet::new(); block.ins.len()];
        for (i, ins) in block.ins.iter().enumerate().rev() {
            out[i] = live.clone();
            for r in written(ins) {
                live.remove(&r);
            }
            live.extend(read(ins));
        }
        out
    }

    /// Live range of every register: the points before which it is live.
    pub fn ranges(&self, cfg: &Cfg) -> BTreeMap<Reg, Vec<ProgramPoint>> {
        let mut out: BTreeMap<Reg, Vec<ProgramPoint>> = BTreeMap::new();
        for block in cfg.blocks.values() {
            let after = self.live_after(block);
            for (i, ins) in block.ins.iter().enumerate() {
                let mut before = after[i].clone();
                for r in written(ins) {
                    before.remove(&r);
                }
                before.extend(read(ins));
                for r in before {
                    out.entry(r).or_default().push((block.id, i));
                }
            }
        }
        out
    }

    /// Virtual registers read somewhere without any reaching definition.
    pub fn undefined(&self, cfg: &Cfg) -> Vec<Reg> {
        self.live_in
            .get(&cfg.root)
            .map(|s| s.iter().copied().filter(|r| r.is_virtual()).collect())
            .unwrap_or_default()
    }
}
