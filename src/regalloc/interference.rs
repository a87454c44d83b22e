// This module builds the interference graph the coalescer and the colorer work on. Every
// physical register is a node from the start, so fixed registers (arguments, return values,
// call clobbers) constrain virtual registers through ordinary edges. Each register written by
// an instruction, clobbers included, interferes with everything live after it; the source of
// a copy is the one exception, which is what lets the coalescer merge the two sides. The
// registers written by one instruction interfere with each other as well. Copies involving
// at least one virtual register are collected as coalescing hints weighted by the estimated
// frequency of their block (8 to the power of its loop depth).

//! Interference graph and copy hints.

use super::liveness::{read, written, Liveness};
use crate::core::{AsmReg, Reg, RegBitSet, NUM_GP_REGS};
use crate::ssa::ir::IrNode;
use crate::ssa::Cfg;
use std::collections::{BTreeMap, BTreeSet};

/// Undirected interference graph over registers.
#[derive(Debug, Clone)]
pub struct InterferenceGraph {
    adj: BTreeMap<Reg, BTreeSet<Reg>>,
}

impl Default for InterferenceGraph {
    fn default() -> Self {
        let mut adj = BTreeMap::new();
        for id in 0..NUM_GP_REGS as u8 {
            adj.insert(Reg::arch(id), BTreeSet::new());
        }
        Self { adj }
    }
}

impl InterferenceGraph {
    /// A graph holding only the physical registers.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(cfg: &Cfg, live: &Liveness) -> Self {
        let mut graph = Self::new();
        for block in cfg.blocks.values() {
            let after = live.live_after(block);
            for (ins, live_after) in block.ins.iter().zip(&after) {
                for r in read(ins) {
                    graph.add_node(r);
                }
                let defs = written(ins);
                let copy_src = match ins {
                    IrNode::Copy { v, .. } => Some(*v),
                    _ => None,
                };
                for (i, &d) in defs.iter().enumerate() {
                    graph.add_node(d);
                    for &l in live_after {
                        if Some(l) != copy_src {
                            graph.add_edge(d, l);
                        }
                    }
                    for &other in &defs[i + 1..] {
                        graph.add_edge(d, other);
                    }
                }
            }
            for r in block.term.uses() {
                if !r.is_zero() {
                    graph.add_node(r);
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, r: Reg) {
        self.adj.entry(r).or_default();
    }

    pub fn add_edge(&mut self, a: Reg, b: Reg) {
        if a == b || a.is_zero() || b.is_zero() {
            return;
        }
        self.adj.entry(a).or_default().insert(b);
        self.adj.entry(b).or_default().insert(a);
    }

    pub fn interferes(&self, a: Reg, b: Reg) -> bool {
        self.adj.get(&a).is_some_and(|n| n.contains(&b))
    }

    pub fn neighbors(&self, r: Reg) -> impl Iterator<Item = Reg> + '_ {
        self.adj.get(&r).into_iter().flat_map(|n| n.iter().copied())
    }

    pub fn contains(&self, r: Reg) -> bool {
        self.adj.contains_key(&r)
    }

    /// Virtual registers in the graph.
    pub fn virtual_nodes(&self) -> impl Iterator<Item = Reg> + '_ {
        self.adj.keys().copied().filter(|r| r.is_virtual())
    }

    /// Neighbors competing for `palette`: virtual registers and the
    /// physical registers inside it.
    pub fn pressure(&self, r: Reg, palette: &RegBitSet) -> usize {
        self.neighbors(r).filter(|&n| competes(n, palette)).count()
    }

    /// Fold `gone` into `keep`.
    pub fn merge(&mut self, keep: Reg, gone: Reg) {
        let Some(neighbors) = self.adj.remove(&gone) else {
            return;
        };
        for n in neighbors {
            if let Some(set) = self.adj.get_mut(&n) {
                set.remove(&gone);
            }
            self.add_edge(keep, n);
        }
    }
}

/// Whether `r` takes a color out of `palette`.
pub fn competes(r: Reg, palette: &RegBitSet) -> bool {
    match AsmReg::from_reg(r) {
        Some(a) => palette.contains(a),
        None => r.is_virtual(),
    }
}

/// A copy the allocator would like to see disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyHint {
    pub dst: Reg,
    pub src: Reg,
    pub weight: u64,
}

/// Every register copy with at least one virtual side, heaviest first.
pub fn copy_hints(cfg: &Cfg) -> Vec<CopyHint> {
    let depth = cfg.loop_depth();
    let mut hints = Vec::new();
    for block in cfg.blocks.values() {
        let d = depth.get(&block.id).copied().unwrap_or(0).min(10);
        let weight = 8u64.pow(d);
        for ins in &block.ins {
            if let IrNode::Copy { r, v } = *ins {
                if r != v && (r.is_virtual() || v.is_virtual()) && !r.is_zero() && !v.is_zero() {
                    hints.push(CopyHint { dst: r, src: v, weight });
                }
            }
        }
    }
    hints.sort_by(|a, b| b.weight.cmp(&a.weight).then((a.dst, a.src).cmp(&(b.dst, b.src))));
    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::looped;
    use crate::core::RegClass;
    use crate::ssa::ir::{BinaryOp, BlockId, Terminator};
    use crate::x64::regs::{default_palette, RAX, RSP};

    fn v(i: u32) -> Reg {
        Reg::tmp(RegClass::Int, i)
    }

    fn straight_line(ins: Vec<IrNode>, ret: Vec<Reg>) -> Cfg {
        let mut cfg = Cfg::new();
        cfg.block_mut(BlockId(0)).unwrap().ins = ins;
        cfg.block_mut(BlockId(0)).unwrap().term = Terminator::Return { r: ret };
        cfg
    }

    #[test]
    fn test_simultaneously_live_values_interfere() {
        let cfg = straight_line(
            vec![
                IrNode::ConstInt { r: v(0), v: 1 },
                IrNode::ConstInt { r: v(1), v: 2 },
                IrNode::Binary { r: v(2), x: v(0), y: v(1), op: BinaryOp::Add },
                IrNode::Copy { r: v(3), v: v(2) },
            ],
            vec![v(3)],
        );
        let graph = InterferenceGraph::build(&cfg, &Liveness::compute(&cfg));
        assert!(graph.interferes(v(0), v(1)));
        assert!(!graph.interferes(v(2), v(0)));
        // A copy does not make its two sides interfere.
        assert!(!graph.interferes(v(2), v(3)));
        assert!(graph.contains(RSP.reg()));
        assert_eq!(graph.virtual_nodes().count(), 4);
    }

    #[test]
    fn test_merge_unions_neighbors() {
        let mut graph = InterferenceGraph::new();
        graph.add_edge(v(0), v(1));
        graph.add_edge(v(2), RAX.reg());
        graph.merge(v(0), v(2));
        assert!(graph.interferes(v(0), RAX.reg()));
        assert!(graph.interferes(v(0), v(1)));
        assert!(!graph.contains(v(2)));
        assert_eq!(graph.pressure(v(0), &default_palette()), 2);
        assert_eq!(graph.pressure(v(0), &RegBitSet::from_ids(&[3])), 1);
    }

    #[test]
    fn test_copies_in_loops_weigh_more() {
        let mut cfg = looped();
        cfg.block_mut(BlockId(0)).unwrap().ins.push(IrNode::Copy { r: v(0), v: v(1) });
        cfg.block_mut(BlockId(2)).unwrap().ins.push(IrNode::Copy { r: v(2), v: v(3) });
        let hints = copy_hints(&cfg);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].dst, v(2));
        assert!(hints[0].weight > hints[1].weight);
    }
}
