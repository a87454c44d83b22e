//! Conservative copy coalescing.
//!
//! Copies are visited heaviest first. Two virtual registers merge when the
//! Briggs test holds for the combined node; a virtual register merges into
//! a physical register of the palette when the George test holds. Every
//! round rewrites the CFG, drops the copies that became self copies and
//! rebuilds liveness and the graph, until a round merges nothing.

use super::interference::{competes, copy_hints, InterferenceGraph};
use super::liveness::Liveness;
use super::rename_registers;
use crate::core::{AsmReg, CompileError, CompileResult, Reg, RegBitSet};
use crate::ssa::ir::IrNode;
use crate::ssa::Cfg;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeSet;

/// Coalescing rounds before giving up on reaching a fixpoint.
pub const MAX_COALESCE_ROUNDS: usize = 64;

/// Briggs: the merged node has fewer than `k` significant neighbors.
fn briggs(graph: &InterferenceGraph, a: Reg, b: Reg, palette: &RegBitSet) -> bool {
    let k = palette.count();
    let neighbors: BTreeSet<Reg> = graph
        .neighbors(a)
        .chain(graph.neighbors(b))
        .filter(|&n| n != a && n != b && competes(n, palette))
        .collect();
    let significant = neighbors
        .iter()
        .filter(|&&n| n.is_arch() || graph.pressure(n, palette) >= k)
        .count();
    significant < k
}

/// George: every neighbor of `virt` already interferes with `phys`, is
/// physical itself, or has insignificant degree.
fn george(graph: &InterferenceGraph, phys: Reg, virt: Reg, palette: &RegBitSet) -> bool {
    let k = palette.count();
    graph
        .neighbors(virt)
        .all(|t| t.is_arch() || graph.interferes(t, phys) || graph.pressure(t, palette) < k)
}

fn find(alias: &HashMap<Reg, Reg>, mut r: Reg) -> Reg {
    while let Some(&next) = alias.get(&r) {
        r = next;
    }
    r
}

/// One pass over the copy hints; returns the merges performed.
fn coalesce_round(
    cfg: &Cfg,
    palette: &RegBitSet,
    pinned: &HashSet<Reg>,
) -> HashMap<Reg, Reg> {
    let live = Liveness::compute(cfg);
    let mut graph = InterferenceGraph::build(cfg, &live);
    let mut alias: HashMap<Reg, Reg> = HashMap::new();
    for hint in copy_hints(cfg) {
        let (a, b) = (find(&alias, hint.dst), find(&alias, hint.src));
        if a == b || pinned.contains(&a) || pinned.contains(&b) {
            continue;
        }
        let (keep, gone) = match (a.is_arch(), b.is_arch()) {
            (true, true) => continue,
            (true, false) => (a, b),
            (false, true) => (b, a),
            (false, false) => (a, b),
        };
        if graph.interferes(keep, gone) {
            continue;
        }
        let ok = if keep.is_arch() {
            AsmReg::from_reg(keep).is_some_and(|r| palette.contains(r))
                && george(&graph, keep, gone, palette)
        } else {
            keep.class() == gone.class() && briggs(&graph, keep, gone, palette)
        };
        if ok {
            log::trace!("coalescing {} into {}", gone, keep);
            graph.merge(keep, gone);
            alias.insert(gone, keep);
        }
    }
    alias
}

/// Merge copy-related registers to a fixpoint; returns the number of merges.
pub fn coalesce(cfg: &mut Cfg, palette: &RegBitSet, pinned: &HashSet<Reg>) -> CompileResult<usize> {
    let mut total = 0;
    for _ in 0..MAX_COALESCE_ROUNDS {
        let alias = coalesce_round(cfg, palette, pinned);
        if alias.is_empty() {
            return Ok(total);
        }
        total += alias.len();
        rename_registers(cfg, |r| Some(find(&alias, r)).filter(|&to| to != r));
        remove_self_copies(cfg);
    }
    Err(CompileError::internal(format!(
        "copy coalescing did not settle within {} rounds",
        MAX_COALESCE_ROUNDS
    )))
}

/// Drop `r = r` copies; returns how many were removed.
pub fn remove_self_copies(cfg: &mut Cfg) -> usize {
    let mut removed = 0;
    for block in cfg.blocks.values_mut() {
        let before = block.ins.len();
        block.ins.retain(|i| !matches!(i, IrNode::Copy { r, v } if r == v));
        removed += before - block.ins.len();
    }
    removed
}
