// This module computes dominator information with the Lengauer–Tarjan algorithm. Blocks are
// numbered in depth-first order from the root; semidominators are computed in reverse
// numbering through an ancestor/label forest with path compression, immediate dominators are
// resolved from the buckets (implicitly when the semidominator path has a smaller candidate,
// explicitly in a final forward pass otherwise). From the immediate dominators it derives the
// sorted child lists, the depth of every block (breadth-first from the root) and the dominance
// frontiers using the local + up formulation, each frontier computed once after those of its
// dominator-tree children. There is no incremental update: Cfg::rebuild recomputes all of it.

//! Dominator tree and dominance frontiers.

use super::cfg::Cfg;
use super::ir::BlockId;
use crate::core::{CompileError, CompileResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dominator information of a CFG.
#[derive(Debug, Clone, Default)]
pub struct DominatorTree {
    pub dominated_by: BTreeMap<BlockId, BlockId>,
    pub dominator_of: BTreeMap<BlockId, Vec<BlockId>>,
    pub depth: BTreeMap<BlockId, u32>,
    pub frontier: BTreeMap<BlockId, BTreeSet<BlockId>>,
}

/// Lengauer–Tarjan state over DFS numbers; 0 means "none".
struct LengauerTarjan {
    vertex: Vec<BlockId>,
    parent: Vec<usize>,
    semi: Vec<usize>,
    ancestor: Vec<usize>,
    label: Vec<usize>,
    idom: Vec<usize>,
    bucket: Vec<Vec<usize>>,
}

impl LengauerTarjan {
    fn new(n: usize) -> Self {
        Self {
            vertex: Vec::with_capacity(n + 1),
            parent: vec![0; n + 1],
            semi: vec![0; n + 1],
            ancestor: vec![0; n + 1],
            label: (0..=n).collect(),
            idom: vec![0; n + 1],
            bucket: vec![Vec::new(); n + 1],
        }
    }

    fn compress(&mut self, v: usize) {
        let mut path = Vec::new();
        let mut x = v;
        while self.ancestor[self.ancestor[x]] != 0 {
            path.push(x);
            x = self.ancestor[x];
        }
        while let Some(y) = path.pop() {
            let a = self.ancestor[y];
            if self.semi[self.label[a]] < self.semi[self.label[y]] {
                self.label[y] = self.label[a];
            }
            self.ancestor[y] = self.ancestor[a];
        }
    }

    fn eval(&mut self, v: usize) -> usize {
        if self.ancestor[v] == 0 {
            return v;
        }
        self.compress(v);
        self.label[v]
    }

    fn link(&mut self, v: usize, w: usize) {
        self.ancestor[w] = v;
    }
}

/// Compute the dominator tree of `cfg`. Unreachable blocks are ignored.
pub fn compute(cfg: &Cfg) -> CompileResult<DominatorTree> {
    if !cfg.blocks.contains_key(&cfg.root) {
        return Err(CompileError::internal("the CFG has no root block"));
    }
    let n = cfg.blocks.len();
    let mut lt = LengauerTarjan::new(n);
    let mut number: BTreeMap<BlockId, usize> = BTreeMap::new();

    // Depth-first numbering.
    lt.vertex.push(cfg.root); // index 0 is a placeholder
    let mut stack = vec![(cfg.root, 0usize)];
    while let Some((b, parent)) = stack.pop() {
        if number.contains_key(&b) {
            continue;
        }
        let num = lt.vertex.len();
        number.insert(b, num);
        lt.vertex.push(b);
        lt.semi[num] = num;
        lt.parent[num] = parent;
        for succ in cfg.block(b)?.successors().into_iter().rev() {
            if !number.contains_key(&succ) {
                stack.push((succ, num));
            }
        }
    }
    let count = lt.vertex.len() - 1;

    for i in (2..=count).rev() {
        let w = i;
        let preds: Vec<usize> = cfg
            .block(lt.vertex[w])?
            .pred
            .iter()
            .filter_map(|p| number.get(p).copied())
            .collect();
        for v in preds {
            let u = lt.eval(v);
            if lt.semi[u] < lt.semi[w] {
                lt.semi[w] = lt.semi[u];
            }
        }
        let s = lt.semi[w];
        lt.bucket[s].push(w);
        let p = lt.parent[w];
        lt.link(p, w);
        for v in std::mem::take(&mut lt.bucket[p]) {
            let u = lt.eval(v);
            lt.idom[v] = if lt.semi[u] < lt.semi[v] { u } else { p };
        }
    }
    for w in 2..=count {
        if lt.idom[w] != lt.semi[w] {
            lt.idom[w] = lt.idom[lt.idom[w]];
        }
    }

    let mut tree = DominatorTree::default();
    for w in 2..=count {
        let b = lt.vertex[w];
        let d = lt.vertex[lt.idom[w]];
        tree.dominated_by.insert(b, d);
        tree.dominator_of.entry(d).or_default().push(b);
    }
    for children in tree.dominator_of.values_mut() {
        children.sort();
    }

    // Depth by breadth-first walk of the tree.
    let mut queue = VecDeque::from([(cfg.root, 0u32)]);
    while let Some((b, d)) = queue.pop_front() {
        tree.depth.insert(b, d);
        if let Some(children) = tree.dominator_of.get(&b) {
            queue.extend(children.iter().map(|&c| (c, d + 1)));
        }
    }

    // Frontiers bottom-up: children are finished before their parent.
    let mut order = Vec::with_capacity(count);
    let mut stack = vec![cfg.root];
    while let Some(b) = stack.pop() {
        order.push(b);
        if let Some(children) = tree.dominator_of.get(&b) {
            stack.extend(children.iter().copied());
        }
    }
    for &x in order.iter().rev() {
        let mut df = BTreeSet::new();
        for y in cfg.block(x)?.successors() {
            if tree.dominated_by.get(&y) != Some(&x) {
                df.insert(y);
            }
        }
        if let Some(children) = tree.dominator_of.get(&x) {
            for z in children {
                for &y in tree.frontier.get(z).into_iter().flatten() {
                    if tree.dominated_by.get(&y) != Some(&x) {
                        df.insert(y);
                    }
                }
            }
        }
        tree.frontier.insert(x, df);
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::{diamond, looped};

    #[test]
    fn test_diamond() {
        let cfg = diamond();
        let tree = compute(&cfg).unwrap();
        for b in 1..=3 {
            assert_eq!(tree.dominated_by[&BlockId(b)], BlockId(0));
        }
        assert_eq!(tree.dominator_of[&BlockId(0)], vec![BlockId(1), BlockId(2), BlockId(3)]);
        assert_eq!(tree.frontier[&BlockId(1)], BTreeSet::from([BlockId(3)]));
        assert_eq!(tree.frontier[&BlockId(2)], BTreeSet::from([BlockId(3)]));
        assert!(tree.frontier[&BlockId(0)].is_empty());
        assert_eq!(tree.depth[&BlockId(3)], 1);
    }

    #[test]
    fn test_loop_header_is_in_its_own_frontier() {
        // 0 -> 1 -> 2 -> {1, 3}
        let cfg = looped();
        let tree = compute(&cfg).unwrap();
        assert_eq!(tree.dominated_by[&BlockId(2)], BlockId(1));
        assert_eq!(tree.dominated_by[&BlockId(3)], BlockId(2));
        assert!(tree.frontier[&BlockId(2)].contains(&BlockId(1)));
        assert!(tree.frontier[&BlockId(1)].contains(&BlockId(1)));
        assert_eq!(tree.depth[&BlockId(3)], 3);
        assert_eq!(cfg.loop_depth()[&BlockId(2)], 1);
        assert_eq!(cfg.loop_depth()[&BlockId(3)], 0);
    }
}
