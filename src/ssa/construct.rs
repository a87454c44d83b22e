// This module puts a freshly built CFG into SSA form following Cytron et al. Phi nodes are
// placed for every register written in more than one block, at the iterated dominance
// frontier of its definition sites (a block that receives a phi becomes a definition site in
// turn). Renaming walks the dominator tree with an explicit stack of enter/exit events and
// keeps, per register, a stack of the SSA versions currently in scope: definitions push,
// leaving a block pops what it pushed, and every successor phi records the version reaching
// it from this predecessor. A final normalization pass renumbers all definitions compactly in
// block order so that the resulting names do not depend on the traversal order.

//! SSA construction.

use super::cfg::Cfg;
use super::ir::{BlockId, Definitions, Phi, Usages};
use crate::core::{CompilationSession, CompileError, CompileResult, Reg};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Insert phi nodes and rename every virtual register to single-assignment form.
pub fn construct_ssa(cfg: &mut Cfg, session: &CompilationSession<'_>) -> CompileResult<()> {
    let inserted = insert_phis(cfg)?;
    session.record_phis_inserted(inserted);
    rename(cfg)?;
    normalize(cfg);
    log::debug!("ssa construction inserted {} phi nodes", inserted);
    Ok(())
}

fn insert_phis(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut sites: BTreeMap<Reg, BTreeSet<BlockId>> = BTreeMap::new();
    for b in cfg.blocks.values() {
        for ins in &b.ins {
            for r in ins.defs() {
                if r.is_virtual() {
                    sites.entry(r.base()).or_default().insert(b.id);
                }
            }
        }
    }

    let mut inserted = 0;
    for (reg, defs) in sites {
        if defs.len() < 2 {
            continue;
        }
        let mut has_phi = BTreeSet::new();
        let mut seen = defs.clone();
        let mut work: Vec<BlockId> = defs.into_iter().collect();
        while let Some(x) = work.pop() {
            let frontier: Vec<BlockId> = cfg.frontier.get(&x).into_iter().flatten().copied().collect();
            for y in frontier {
                if !has_phi.insert(y) {
                    continue;
                }
                cfg.block_mut(y)?.phi.push(Phi { r: reg, v: BTreeMap::new() });
                inserted += 1;
                if seen.insert(y) {
                    work.push(y);
                }
            }
        }
    }
    Ok(inserted)
}

struct Renamer {
    stacks: HashMap<Reg, Vec<u32>>,
    counters: HashMap<Reg, u32>,
}

impl Renamer {
    fn push(&mut self, r: &mut Reg, pushed: &mut Vec<Reg>) {
        if !r.is_virtual() {
            return;
        }
        let base = r.base();
        let n = self.counters.entry(base).or_insert(0);
        *n += 1;
        self.stacks.entry(base).or_default().push(*n);
        pushed.push(base);
        *r = base.derive(*n);
    }

    fn top(&self, r: Reg, block: BlockId) -> CompileResult<Reg> {
        if !r.is_virtual() {
            return Ok(r);
        }
        let base = r.base();
        self.stacks
            .get(&base)
            .and_then(|s| s.last())
            .map(|&n| base.derive(n))
            .ok_or_else(|| CompileError::UndefinedRegister {
                reg: base.to_string(),
                block: block.to_string(),
            })
    }
}

enum Visit {
    Enter(BlockId),
    Exit(Vec<Reg>),
}

fn rename(cfg: &mut Cfg) -> CompileResult<()> {
    let mut renamer = Renamer { stacks: HashMap::new(), counters: HashMap::new() };
    let mut work = vec![Visit::Enter(cfg.root)];
    while let Some(visit) = work.pop() {
        let id = match visit {
            Visit::Enter(id) => id,
            Visit::Exit(pushed) => {
                for base in pushed {
                    if let Some(stack) = renamer.stacks.get_mut(&base) {
                        stack.pop();
                    }
                }
                continue;
            }
        };

        let mut pushed = Vec::new();
        let block = cfg.block_mut(id)?;
        for phi in &mut block.phi {
            for r in phi.definitions() {
                renamer.push(r, &mut pushed);
            }
        }
        for ins in &mut block.ins {
            for r in ins.usages() {
                *r = renamer.top(*r, id)?;
            }
            for r in ins.definitions() {
                renamer.push(r, &mut pushed);
            }
        }
        for r in block.term.usages() {
            *r = renamer.top(*r, id)?;
        }

        for succ in block.successors() {
            let target = cfg.block_mut(succ)?;
            for phi in &mut target.phi {
                let v = renamer.top(phi.r, id)?;
                phi.v.insert(id, v);
            }
        }

        work.push(Visit::Exit(pushed));
        if let Some(children) = cfg.dominator_of.get(&id) {
            work.extend(children.iter().rev().map(|&c| Visit::Enter(c)));
        }
    }
    Ok(())
}

/// Renumber definitions per register in block order.
fn normalize(cfg: &mut Cfg) {
    let mut next: HashMap<Reg, u32> = HashMap::new();
    let mut map: HashMap<Reg, Reg> = HashMap::new();
    let mut assign = |r: Reg, map: &mut HashMap<Reg, Reg>| {
        let n = next.entry(r.base()).or_insert(0);
        *n += 1;
        map.insert(r, r.base().derive(*n));
    };
    for b in cfg.blocks.values() {
        for phi in &b.phi {
            assign(phi.r, &mut map);
        }
        for ins in &b.ins {
            for r in ins.defs() {
                if r.is_virtual() {
                    assign(r, &mut map);
                }
            }
        }
    }
    let rewrite = |r: &mut Reg| {
        if let Some(&n) = map.get(r) {
            *r = n;
        }
    };
    for b in cfg.blocks.values_mut() {
        for phi in &mut b.phi {
            rewrite(&mut phi.r);
            phi.usages().into_iter().for_each(rewrite);
        }
        for ins in &mut b.ins {
            ins.definitions().into_iter().for_each(rewrite);
            ins.usages().into_iter().for_each(rewrite);
        }
        b.term.usages().into_iter().for_each(rewrite);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::ssa_from;
    use crate::hir::{Builder, Cond, R0, R1};
    use crate::ssa::ir::IrNode;

    fn countdown() -> crate::hir::Program {
        let mut b = Builder::new();
        let top = b.label();
        b.iconst(10, R0);
        b.iconst(0, R1);
        b.bind(top);
        b.add(R1, R0, R1);
        b.sub(R0, 1, R0);
        b.br(Cond::Ne, R0, 0, top);
        b.ret(&[R1]);
        b.finish().unwrap()
    }

    #[test]
    fn test_single_assignment() {
        let cfg = ssa_from(&countdown());
        let sites = cfg.definition_sites();
        for (r, blocks) in &sites {
            assert_eq!(blocks.len(), 1, "{} defined more than once", r);
        }
    }

    #[test]
    fn test_loop_header_gets_phis() {
        let cfg = ssa_from(&countdown());
        let header = cfg.block(BlockId(2)).unwrap();
        let bases: Vec<Reg> = header.phi.iter().map(|p| p.r.base()).collect();
        assert!(bases.contains(&R0));
        assert!(bases.contains(&R1));
        for phi in &header.phi {
            assert_eq!(phi.v.len(), header.pred.len());
        }
    }

    #[test]
    fn test_uses_see_reaching_definition() {
        let cfg = ssa_from(&countdown());
        let header = cfg.block(BlockId(2)).unwrap();
        let r0_phi = header.phi.iter().find(|p| p.r.base() == R0).unwrap().r;
        // `R1 = R1 + R0` reads the phi value of R0.
        let add = header
            .ins
            .iter()
            .find(|i| matches!(i, IrNode::Binary { r, .. } if r.base() == R1))
            .unwrap();
        assert!(add.uses().contains(&r0_phi));
    }
}
