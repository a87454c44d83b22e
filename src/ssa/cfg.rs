// This module implements the control flow graph that every pass mutates in place. A Cfg owns
// its basic blocks in a BTreeMap keyed by BlockId (so iteration order is deterministic), the
// monotonic block and register counters, and the dominator information derived from the
// current edge set. Successor edges are implied by terminators while predecessor lists are
// stored explicitly; any pass that edits edges keeps the two in sync and then calls
// rebuild(), which prunes unreachable blocks, re-checks the mirror invariant and recomputes
// dominators, depths and frontiers from scratch. verify() is the well-formedness check the
// pass manager runs after every pass when verification is enabled. The module also provides
// the traversal orders (reverse post-order, dominator-tree pre-order) and the natural loop
// depth estimate used for block frequencies.

//! The control flow graph.

use super::dominator;
use super::ir::{BasicBlock, BlockId, IrNode, Terminator};
use crate::core::{CompileError, CompileResult, Reg, RegClass, RegKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// A function's control flow graph.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub root: BlockId,
    pub blocks: BTreeMap<BlockId, BasicBlock>,
    next_block: u32,
    next_reg: u32,
    /// Immediate dominator of every block but the root.
    pub dominated_by: BTreeMap<BlockId, BlockId>,
    /// Blocks immediately dominated by each block, sorted by id.
    pub dominator_of: BTreeMap<BlockId, Vec<BlockId>>,
    /// Depth in the dominator tree; the root has depth 0.
    pub depth: BTreeMap<BlockId, u32>,
    /// Dominance frontier of every block.
    pub frontier: BTreeMap<BlockId, BTreeSet<BlockId>>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Cfg {
    /// A graph holding a single root block that returns nothing.
    pub fn new() -> Self {
        let root = BlockId(0);
        let mut blocks = BTreeMap::new();
        blocks.insert(root, BasicBlock::new(root, Terminator::Return { r: Vec::new() }));
        Self {
            root,
            blocks,
            next_block: 1,
            next_reg: 0,
            dominated_by: BTreeMap::new(),
            dominator_of: BTreeMap::new(),
            depth: BTreeMap::new(),
            frontier: BTreeMap::new(),
        }
    }

    /// Add an empty block with the given terminator. Predecessors of its
    /// successors are not touched.
    pub fn create_block(&mut self, term: Terminator) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(id, BasicBlock::new(id, term));
        id
    }

    /// Mint a fresh pass-generated register.
    pub fn create_register(&mut self, class: RegClass) -> Reg {
        let r = Reg::new(RegKind::Gen, class, self.next_reg);
        self.next_reg += 1;
        r
    }

    pub fn block(&self, id: BlockId) -> CompileResult<&BasicBlock> {
        self.blocks
            .get(&id)
            .ok_or_else(|| CompileError::internal(format!("{} does not exist", id)))
    }

    pub fn block_mut(&mut self, id: BlockId) -> CompileResult<&mut BasicBlock> {
        self.blocks
            .get_mut(&id)
            .ok_or_else(|| CompileError::internal(format!("{} does not exist", id)))
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of instructions, phis excluded.
    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.ins.len()).sum()
    }

    /// Recompute every predecessor list from the terminators.
    pub fn recompute_predecessors(&mut self) {
        let edges: Vec<(BlockId, Vec<BlockId>)> =
            self.blocks.values().map(|b| (b.id, b.successors())).collect();
        for b in self.blocks.values_mut() {
            b.pred.clear();
        }
        for (from, succs) in edges {
            for s in succs {
                if let Some(b) = self.blocks.get_mut(&s) {
                    b.add_pred(from);
                }
            }
        }
    }

    /// Insert an empty block on the edge `from -> to` and return it.
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> CompileResult<BlockId> {
        let mid = self.create_block(Terminator::jump(to));
        self.block_mut(from)?.term.replace_successor(to, mid);
        self.block_mut(mid)?.pred.push(from);
        self.block_mut(to)?.replace_pred(from, mid);
        Ok(mid)
    }

    /// Blocks in reverse post-order from the root.
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut visited = HashSet::new();
        let mut stack = vec![(self.root, false)];
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            if let Some(b) = self.blocks.get(&block) {
                for succ in b.successors().into_iter().rev() {
                    if !visited.contains(&succ) {
                        stack.push((succ, false));
                    }
                }
            }
        }
        post.reverse();
        post
    }

    /// Blocks of the dominator tree in pre-order, children by id.
    pub fn dom_preorder(&self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![self.root];
        while let Some(b) = stack.pop() {
            out.push(b);
            if let Some(children) = self.dominator_of.get(&b) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// Whether `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.dominated_by.get(&cur) {
                Some(&idom) => cur = idom,
                None => return false,
            }
        }
    }

    /// Nearest common dominator of two blocks.
    pub fn common_dominator(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        let depth = |x: &BlockId| self.depth.get(x).copied().unwrap_or(0);
        while a != b {
            if depth(&a) >= depth(&b) {
                match self.dominated_by.get(&a) {
                    Some(&p) => a = p,
                    None => return self.root,
                }
            } else {
                match self.dominated_by.get(&b) {
                    Some(&p) => b = p,
                    None => return self.root,
                }
            }
        }
        a
    }

    /// Natural loop nesting depth of every block.
    ///
    /// Requires current dominators.
    pub fn loop_depth(&self) -> BTreeMap<BlockId, u32> {
        let mut depth: BTreeMap<BlockId, u32> = self.blocks.keys().map(|&b| (b, 0)).collect();
        for b in self.blocks.values() {
            for succ in b.successors() {
                // Back edge: the target dominates the source.
                if !self.dominates(succ, b.id) {
                    continue;
                }
                let mut body = BTreeSet::from([succ]);
                let mut work = vec![b.id];
                while let Some(n) = work.pop() {
                    if body.insert(n) {
                        if let Some(nb) = self.blocks.get(&n) {
                            work.extend(nb.pred.iter().copied());
                        }
                    }
                }
                for n in body {
                    if let Some(d) = depth.get_mut(&n) {
                        *d += 1;
                    }
                }
            }
        }
        depth
    }

    /// Remove unreachable blocks, check edge consistency and recompute
    /// dominators, depths and frontiers.
    pub fn rebuild(&mut self) -> CompileResult<usize> {
        let reachable: BTreeSet<BlockId> = self.rpo().into_iter().collect();
        let dead: Vec<BlockId> =
            self.blocks.keys().filter(|b| !reachable.contains(b)).copied().collect();
        for &id in &dead {
            if let Some(block) = self.blocks.remove(&id) {
                for succ in block.successors() {
                    if let Some(s) = self.blocks.get_mut(&succ) {
                        s.remove_pred(id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            log::trace!("rebuild pruned {} unreachable blocks", dead.len());
        }
        self.check_edges("rebuild")?;
        let tree = dominator::compute(self)?;
        self.dominated_by = tree.dominated_by;
        self.dominator_of = tree.dominator_of;
        self.depth = tree.depth;
        self.frontier = tree.frontier;
        Ok(dead.len())
    }

    fn check_edges(&self, pass: &'static str) -> CompileResult<()> {
        let broken = |reason: String| CompileError::BrokenInvariant { pass, reason };
        for b in self.blocks.values() {
            for succ in b.successors() {
                let s = self
                    .blocks
                    .get(&succ)
                    .ok_or_else(|| broken(format!("{} jumps to missing {}", b.id, succ)))?;
                if !s.pred.contains(&b.id) {
                    return Err(broken(format!("{} missing predecessor {}", succ, b.id)));
                }
            }
            let mut seen = BTreeSet::new();
            for &p in &b.pred {
                if !seen.insert(p) {
                    return Err(broken(format!("{} lists predecessor {} twice", b.id, p)));
                }
                let pb = self
                    .blocks
                    .get(&p)
                    .ok_or_else(|| broken(format!("{} has missing predecessor {}", b.id, p)))?;
                if !pb.successors().contains(&b.id) {
                    return Err(broken(format!("{} is not a successor of {}", b.id, p)));
                }
            }
        }
        if self.blocks.get(&self.root).map_or(true, |r| !r.pred.is_empty()) {
            return Err(broken(format!("{} must exist and have no predecessors", self.root)));
        }
        Ok(())
    }

    /// Check structural well-formedness: mirrored edges, phi arity and the
    /// absence of phis once `ssa` is false.
    pub fn verify(&self, pass: &'static str, ssa: bool) -> CompileResult<()> {
        self.check_edges(pass)?;
        for b in self.blocks.values() {
            if !ssa && !b.phi.is_empty() {
                return Err(CompileError::BrokenInvariant {
                    pass,
                    reason: format!("{} still has phi nodes", b.id),
                });
            }
            for phi in &b.phi {
                let keys: BTreeSet<BlockId> = phi.v.keys().copied().collect();
                let preds: BTreeSet<BlockId> = b.pred.iter().copied().collect();
                if keys != preds {
                    return Err(CompileError::BrokenInvariant {
                        pass,
                        reason: format!("phi {} in {} does not cover {:?}", phi.r, b.id, b.pred),
                    });
                }
            }
            if ssa {
                continue;
            }
            if b.ins.iter().any(|i| matches!(i, IrNode::Entry { .. })) && b.id != self.root {
                return Err(CompileError::BrokenInvariant {
                    pass,
                    reason: format!("entry instruction outside the root in {}", b.id),
                });
            }
        }
        Ok(())
    }

    /// Every register with its defining block, phis included.
    pub fn definition_sites(&self) -> BTreeMap<Reg, Vec<BlockId>> {
        let mut out: BTreeMap<Reg, Vec<BlockId>> = BTreeMap::new();
        for b in self.blocks.values() {
            for phi in &b.phi {
                out.entry(phi.r).or_default().push(b.id);
            }
            for ins in &b.ins {
                for r in ins.defs() {
                    out.entry(r).or_default().push(b.id);
                }
            }
        }
        out
    }

    /// Number of reads of every register, phis and terminators included.
    pub fn use_counts(&self) -> BTreeMap<Reg, usize> {
        let mut out: BTreeMap<Reg, usize> = BTreeMap::new();
        for b in self.blocks.values() {
            for phi in &b.phi {
                for &v in phi.v.values() {
                    *out.entry(v).or_default() += 1;
                }
            }
            for ins in &b.ins {
                for r in ins.uses() {
                    *out.entry(r).or_default() += 1;
                }
            }
            for r in b.term.uses() {
                *out.entry(r).or_default() += 1;
            }
        }
        out
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.blocks.values() {
            write!(f, "{}", b)?;
        }
        Ok(())
    }
}
