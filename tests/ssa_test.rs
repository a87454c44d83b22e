//! Dominator and SSA properties of built CFGs.

mod common;

use common::ssa_of;
use hirc::core::Reg;
use hirc::hir::{Builder, Cond, Program, R0, R1, R2, R3};
use hirc::ssa::{BlockId, Cfg};
use std::collections::BTreeSet;

/// Two nested loops with a conditional update in the inner one.
fn nested_loops() -> Program {
    let mut b = Builder::new();
    let (outer, inner, skip, latch) = (b.label(), b.label(), b.label(), b.label());
    b.load_arg(0, R0);
    b.iconst(0, R1);
    b.iconst(0, R3);
    b.bind(outer);
    b.mov(R0, R2);
    b.bind(inner);
    b.br(Cond::Lt, R2, 3, skip);
    b.add(R1, R2, R1);
    b.bind(skip);
    b.sub(R2, 1, R2);
    b.br(Cond::Ne, R2, 0, inner);
    b.bind(latch);
    b.add(R3, 1, R3);
    b.br(Cond::Lt, R3, 4, outer);
    b.ret(&[R1]);
    b.finish().unwrap()
}

fn reachable(cfg: &Cfg) -> BTreeSet<BlockId> {
    cfg.rpo().into_iter().collect()
}

fn tracked(r: Reg) -> bool {
    r.is_virtual()
}

#[test]
fn test_immediate_dominators() {
    let cfg = ssa_of(&nested_loops());
    let live = reachable(&cfg);
    for &b in &live {
        if b == cfg.root {
            assert!(!cfg.dominated_by.contains_key(&b));
            continue;
        }
        let idom = cfg.dominated_by[&b];
        assert_ne!(idom, b);
        assert!(cfg.dominates(idom, b));
        assert!(cfg.dominates(cfg.root, b));
        // The immediate dominator dominates every reachable predecessor.
        for p in &cfg.blocks[&b].pred {
            if live.contains(p) {
                assert!(cfg.dominates(idom, *p), "{} does not dominate {} -> {}", idom, p, b);
            }
        }
        assert_eq!(cfg.depth[&b], cfg.depth[&idom] + 1);
        assert!(cfg.dominator_of[&idom].contains(&b));
    }
}

#[test]
fn test_dominance_frontiers() {
    let cfg = ssa_of(&nested_loops());
    for (&x, frontier) in &cfg.frontier {
        for &y in frontier {
            let preds = &cfg.blocks[&y].pred;
            assert!(preds.iter().any(|&p| cfg.dominates(x, p)), "{} in DF({})", y, x);
            assert!(x == y || !cfg.dominates(x, y), "{} strictly dominates {}", x, y);
        }
    }
    // Loop headers are in the frontier of their own bodies.
    assert!(cfg.frontier.values().any(|f| !f.is_empty()));
}

#[test]
fn test_single_definition_dominates_uses() {
    let cfg = ssa_of(&nested_loops());
    cfg.verify("test", true).unwrap();
    let sites = cfg.definition_sites();
    for (r, blocks) in &sites {
        if tracked(*r) {
            assert_eq!(blocks.len(), 1, "{} defined in {:?}", r, blocks);
        }
    }
    let def_block = |r: Reg| sites.get(&r).and_then(|b| b.first().copied());

    for block in cfg.blocks.values() {
        for phi in &block.phi {
            for (&from, &v) in &phi.v {
                if let Some(d) = def_block(v).filter(|_| tracked(v)) {
                    assert!(cfg.dominates(d, from), "{} reaches {} from {}", v, block.id, from);
                }
            }
        }
        let uses = block.ins.iter().flat_map(|i| i.uses()).chain(block.term.uses());
        for r in uses.filter(|&r| tracked(r)) {
            let d = def_block(r).unwrap_or_else(|| panic!("{} is never defined", r));
            assert!(cfg.dominates(d, block.id), "{} used in {} defined in {}", r, block.id, d);
        }
    }
}

#[test]
fn test_loops_get_phis() {
    let cfg = ssa_of(&nested_loops());
    let phis: usize = cfg.blocks.values().map(|b| b.phi.len()).sum();
    // R1, R2 and R3 are carried around loops.
    assert!(phis >= 3, "only {} phis", phis);
}
