//! Copy elimination.
//!
//! Registers that merely rename another value are aliased away: plain
//! copies, algebraic identities (`x + 0`, `x * 1`, `x & -1`, ...) and phi
//! nodes whose incoming values all agree. In SSA form the source of an alias
//! dominates every use of its destination, so uses are rewritten in place and
//! the defining instruction is dropped.

use super::{Pass, PassContext};
use crate::core::{CompileResult, Reg};
use crate::ssa::ir::{BinaryOp, IrNode, Usages};
use crate::ssa::Cfg;
use std::collections::HashMap;

pub struct CopyElimination;

impl Pass for CopyElimination {
    fn name(&self) -> &'static str {
        "Copy Elimination"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        eliminate_copies(cfg);
        Ok(())
    }
}

/// Integer literals defined anywhere in the graph.
pub fn literals(cfg: &Cfg) -> HashMap<Reg, i64> {
    let mut out = HashMap::new();
    for b in cfg.blocks.values() {
        for ins in &b.ins {
            if let IrNode::ConstInt { r, v } = ins {
                out.insert(*r, *v);
            }
        }
    }
    out
}

fn literal_of(lits: &HashMap<Reg, i64>, r: Reg) -> Option<i64> {
    if r.is_zero() {
        Some(0)
    } else {
        lits.get(&r).copied()
    }
}

/// The register `ins` merely forwards, if any.
fn identity(ins: &IrNode, lits: &HashMap<Reg, i64>) -> Option<(Reg, Reg)> {
    let (r, source) = match ins {
        IrNode::Copy { r, v } => (*r, *v),
        IrNode::Lea { r, mem, off } if literal_of(lits, *off) == Some(0) => (*r, *mem),
        IrNode::Binary { r, x, y, op } => {
            let (lx, ly) = (literal_of(lits, *x), literal_of(lits, *y));
            let source = match op {
                BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor if ly == Some(0) => *x,
                BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor if lx == Some(0) => *y,
                BinaryOp::Sub | BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Sar if ly == Some(0) => *x,
                BinaryOp::Mul if ly == Some(1) => *x,
                BinaryOp::Mul if lx == Some(1) => *y,
                BinaryOp::And if ly == Some(-1) => *x,
                BinaryOp::And if lx == Some(-1) => *y,
                BinaryOp::And | BinaryOp::Or if x == y => *x,
                _ => return None,
            };
            (*r, source)
        }
        _ => return None,
    };
    let aliasable = r.is_virtual()
        && !source.is_arch()
        && r.class() == source.class()
        && r != source;
    aliasable.then_some((r, source))
}

/// Follow alias chains to their root.
fn resolve(aliases: &HashMap<Reg, Reg>, mut r: Reg) -> Reg {
    while let Some(&next) = aliases.get(&r) {
        r = next;
    }
    r
}

/// Rewrite every use of a key of `aliases` to its resolved source.
pub fn substitute(cfg: &mut Cfg, aliases: &HashMap<Reg, Reg>) {
    if aliases.is_empty() {
        return;
    }
    let rewrite = |r: &mut Reg| {
        if aliases.contains_key(r) {
            *r = resolve(aliases, *r);
        }
    };
    for b in cfg.blocks.values_mut() {
        for phi in &mut b.phi {
            phi.usages().into_iter().for_each(rewrite);
        }
        for ins in &mut b.ins {
            ins.usages().into_iter().for_each(rewrite);
        }
        b.term.usages().into_iter().for_each(rewrite);
    }
}

/// Alias away copies, identities and trivial phis to a fixpoint.
/// Returns whether anything changed.
pub fn eliminate_copies(cfg: &mut Cfg) -> bool {
    let mut changed = false;
    loop {
        let lits = literals(cfg);
        let mut aliases: HashMap<Reg, Reg> = HashMap::new();
        for b in cfg.blocks.values() {
            for phi in &b.phi {
                let mut sources = phi.v.values().copied().filter(|&v| v != phi.r);
                if let Some(first) = sources.next() {
                    if sources.all(|v| v == first) && first.class() == phi.r.class() {
                        aliases.insert(phi.r, first);
                    }
                }
            }
            for ins in &b.ins {
                if let Some((r, source)) = identity(ins, &lits) {
                    aliases.insert(r, source);
                }
            }
        }
        // A chain that loops back onto itself only happens in unreachable
        // phi cycles; break it by dropping the cycle's entry.
        let cyclic: Vec<Reg> = aliases
            .keys()
            .copied()
            .filter(|&r| {
                let mut cur = r;
                for _ in 0..=aliases.len() {
                    match aliases.get(&cur) {
                        Some(&next) if next == r => return true,
                        Some(&next) => cur = next,
                        None => return false,
                    }
                }
                true
            })
            .collect();
        for r in cyclic {
            aliases.remove(&r);
        }
        if aliases.is_empty() {
            return changed;
        }
        changed = true;
        for b in cfg.blocks.values_mut() {
            b.phi.retain(|phi| !aliases.contains_key(&phi.r));
            b.ins.retain(|ins| ins.single_def().map_or(true, |d| !aliases.contains_key(&d)));
        }
        substitute(cfg, &aliases);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::ssa_from;
    use crate::hir::{Builder, R0, R1, R2};

    fn program() -> crate::hir::Program {
        let mut b = Builder::new();
        b.load_arg(0, R0);
        b.mov(R0, R1);
        b.add(R1, 0, R2);
        b.alu(BinaryOp::Mul, R2, 1, R2);
        b.ret(&[R2]);
        b.finish().unwrap()
    }

    #[test]
    fn test_identities_collapse_to_the_argument() {
        let mut cfg = ssa_from(&program());
        assert!(eliminate_copies(&mut cfg));
        let ret = cfg.blocks.values().find(|b| b.term.is_return()).unwrap();
        let returned = ret.term.uses()[0];
        assert_eq!(returned.base(), R0);
        let body: Vec<&IrNode> = cfg.blocks.values().flat_map(|b| &b.ins).collect();
        assert!(!body.iter().any(|i| matches!(i, IrNode::Binary { .. })));
    }

    #[test]
    fn test_idempotent() {
        let mut cfg = ssa_from(&program());
        eliminate_copies(&mut cfg);
        let once = cfg.to_string();
        assert!(!eliminate_copies(&mut cfg));
        assert_eq!(cfg.to_string(), once);
    }
}
