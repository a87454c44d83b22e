// This module implements branch elimination. Walking the dominator tree, every block inherits
// the facts of its immediate dominator and, when it is entered through a single switch edge,
// additionally assumes the switch value lies in the set of keys that edge carries (one key,
// or the complement of all keys for the default edge). For each switch, every case and the
// default are then tested against those facts; a case whose assumption is contradictory can
// never be taken and its edge is deleted. A dead default either degenerates the switch into a
// jump (exactly one live case) or hands its role to the first live case. Deleting edges
// cascades through blocks that lose their last predecessor, and the graph is rebuilt and
// re-analyzed until a round removes nothing.

//! Branch elimination by interval proofs.

use super::interval::{Facts, IntervalSet, Prover};
use super::{Pass, PassContext};
use crate::core::CompileResult;
use crate::ssa::ir::{BlockId, Switch, Terminator};
use crate::ssa::Cfg;
use std::collections::BTreeMap;

pub struct BranchElimination;

impl Pass for BranchElimination {
    fn name(&self) -> &'static str {
        "Branch Elimination"
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let (edges, blocks) = eliminate_branches(cfg)?;
        ctx.session.record_edges_removed(edges);
        ctx.session.record_blocks_removed(blocks);
        Ok(())
    }
}

/// Values of the switch value that take the edge into `to`.
fn edge_set(sw: &Switch, to: BlockId) -> IntervalSet {
    let keys = sw
        .br
        .iter()
        .filter(|(_, t)| t.to == to)
        .fold(IntervalSet::empty(), |acc, (&k, _)| acc.union(&IntervalSet::point(k)));
    if sw.ln.to == to {
        keys.union(&default_set(sw))
    } else {
        keys
    }
}

/// Values of the switch value that take the default edge.
fn default_set(sw: &Switch) -> IntervalSet {
    sw.br
        .keys()
        .fold(IntervalSet::full(), |acc, &k| acc.without(&IntervalSet::point(k)))
}

/// Facts holding on entry to every reachable block.
fn block_facts(cfg: &Cfg, prover: &Prover) -> BTreeMap<BlockId, Facts> {
    let mut out: BTreeMap<BlockId, Facts> = BTreeMap::new();
    for id in cfg.dom_preorder() {
        let inherited = cfg
            .dominated_by
            .get(&id)
            .and_then(|idom| out.get(idom))
            .cloned()
            .unwrap_or_default();
        let Some(block) = cfg.blocks.get(&id) else {
            continue;
        };
        let facts = match block.pred.as_slice() {
            [p] if *p != id => match cfg.blocks.get(p).map(|pb| &pb.term) {
                Some(Terminator::Switch(sw)) if !sw.br.is_empty() => prover
                    .assume_in(&inherited, sw.v, &edge_set(sw, id))
                    .unwrap_or(inherited),
                _ => inherited,
            },
            _ => inherited,
        };
        out.insert(id, facts);
    }
    out
}

/// The rewritten switch of a block, if any of its edges is provably dead.
fn prune_switch(sw: &Switch, facts: &Facts, prover: &Prover) -> Option<Terminator> {
    let live: BTreeMap<i64, _> = sw
        .br
        .iter()
        .filter(|(&k, _)| prover.assume_in(facts, sw.v, &IntervalSet::point(k)).is_some())
        .map(|(&k, &t)| (k, t))
        .collect();
    let default_live = prover.assume_in(facts, sw.v, &default_set(sw)).is_some();

    if live.len() == sw.br.len() && default_live {
        return None;
    }
    if default_live {
        return Some(Terminator::Switch(Switch { v: sw.v, ln: sw.ln, br: live }));
    }
    let mut cases = live.into_iter();
    let (_, first) = cases.next()?;
    let br: BTreeMap<i64, _> = cases.collect();
    if br.is_empty() {
        return Some(Terminator::jump(first.to));
    }
    Some(Terminator::Switch(Switch { v: sw.v, ln: first, br }))
}

/// Collapse switches whose every edge leads to the same block.
fn canonicalize(term: Terminator) -> Terminator {
    match term {
        Terminator::Switch(sw) if !sw.br.is_empty() && sw.br.values().all(|t| t.to == sw.ln.to) => {
            Terminator::jump(sw.ln.to)
        }
        other => other,
    }
}

/// Delete provably dead switch edges to a fixpoint.
/// Returns the number of edges and blocks removed.
pub fn eliminate_branches(cfg: &mut Cfg) -> CompileResult<(usize, usize)> {
    let mut edges_removed = 0;
    let mut blocks_removed = 0;
    loop {
        let prover = Prover::new(cfg);
        let facts = block_facts(cfg, &prover);
        let mut rewrites: Vec<(BlockId, Terminator)> = Vec::new();
        for (id, block) in &cfg.blocks {
            let (Terminator::Switch(sw), Some(f)) = (&block.term, facts.get(id)) else {
                continue;
            };
            if sw.br.is_empty() {
                continue;
            }
            let pruned = prune_switch(sw, f, &prover).unwrap_or_else(|| block.term.clone());
            let pruned = canonicalize(pruned);
            if pruned != block.term {
                rewrites.push((*id, pruned));
            }
        }
        if rewrites.is_empty() {
            return Ok((edges_removed, blocks_removed));
        }

        let mut orphans = Vec::new();
        for (id, term) in rewrites {
            let block = cfg.block_mut(id)?;
            let before = block.term.targets().len();
            let old = block.successors();
            block.term = term;
            let new = block.successors();
            edges_removed += before - block.term.targets().len();
            log::trace!("{}: pruned switch to {}", id, block.term);
            for gone in old.into_iter().filter(|s| !new.contains(s)) {
                let target = cfg.block_mut(gone)?;
                target.remove_pred(id);
                if target.pred.is_empty() {
                    orphans.push(gone);
                }
            }
        }
        // Blocks that lost every predecessor take their outgoing edges with them.
        while let Some(orphan) = orphans.pop() {
            if orphan == cfg.root {
                continue;
            }
            for succ in cfg.block(orphan)?.successors() {
                let target = cfg.block_mut(succ)?;
                if !target.pred.contains(&orphan) {
                    continue;
                }
                target.remove_pred(orphan);
                if target.pred.is_empty() {
                    orphans.push(succ);
                }
            }
            if let Some(block) = cfg.blocks.get_mut(&orphan) {
                block.term = Terminator::Return { r: Vec::new() };
            }
        }
        blocks_removed += cfg.rebuild()?;
    }
}
