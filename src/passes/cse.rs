//! Dominator-scoped common subexpression elimination.
//!
//! Pure movable instructions are fingerprinted by operator and operands
//! (commutative operands sorted). Walking the dominator tree, a fingerprint
//! already defined in a dominating block turns the later definition into a
//! copy of the earlier register; copy elimination then removes it.

use super::{dom_walk, DomWalk, Pass, PassContext, ScopedMap};
use crate::core::{CompileResult, Reg};
use crate::ssa::ir::{BinaryOp, Constness, IrNode, UnaryOp};
use crate::ssa::Cfg;

/// Structural fingerprint of a pure instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Int(i64),
    Ptr(u64, bool),
    LoadArg(usize),
    Lea(Reg, Reg),
    Unary(UnaryOp, Reg),
    Binary(BinaryOp, Reg, Reg),
}

fn fingerprint(ins: &IrNode) -> Option<(Key, Reg)> {
    let (key, r) = match ins {
        IrNode::ConstInt { r, v } => (Key::Int(*v), *r),
        IrNode::ConstPtr { r, p, m } => (Key::Ptr(*p, *m == Constness::Const), *r),
        IrNode::LoadArg { r, id } => (Key::LoadArg(*id), *r),
        IrNode::Lea { r, mem, off } => (Key::Lea(*mem, *off), *r),
        IrNode::Unary { r, v, op } => (Key::Unary(*op, *v), *r),
        IrNode::Binary { r, x, y, op } => {
            let (a, b) = if op.is_commutative() && y < x { (*y, *x) } else { (*x, *y) };
            (Key::Binary(*op, a, b), *r)
        }
        _ => return None,
    };
    r.is_virtual().then_some((key, r))
}

pub struct CommonSubexpressionElimination;

impl Pass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "Common Subexpression Elimination"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        eliminate_common_subexpressions(cfg)?;
        Ok(())
    }
}

/// Returns whether any definition was replaced.
pub fn eliminate_common_subexpressions(cfg: &mut Cfg) -> CompileResult<bool> {
    let mut table: ScopedMap<Key, Reg> = ScopedMap::new();
    let mut changed = false;
    for event in dom_walk(cfg) {
        let id = match event {
            DomWalk::Enter(id) => id,
            DomWalk::Exit => {
                table.pop_scope();
                continue;
            }
        };
        table.push_scope();
        for ins in &mut cfg.block_mut(id)?.ins {
            let Some((key, r)) = fingerprint(ins) else {
                continue;
            };
            match table.get(&key) {
                Some(&earlier) if earlier.class() == r.class() => {
                    *ins = IrNode::Copy { r, v: earlier };
                    changed = true;
                }
                _ => table.insert(key, r),
            }
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::ssa_from;
    use crate::hir::{Builder, Cond, R0, R1, R2, R3};

    #[test]
    fn test_dominated_duplicate_becomes_copy() {
        let mut b = Builder::new();
        let skip = b.label();
        b.load_arg(0, R0);
        b.load_arg(1, R1);
        b.add(R0, R1, R2);
        b.br(Cond::Eq, R0, 0, skip);
        b.add(R1, R0, R3);
        b.bind(skip);
        b.ret(&[R2, R3]);
        let mut cfg = ssa_from(&b.finish().unwrap());
        assert!(eliminate_common_subexpressions(&mut cfg).unwrap());

        let copies: Vec<&IrNode> = cfg
            .blocks
            .values()
            .flat_map(|b| &b.ins)
            .filter(|i| matches!(i, IrNode::Copy { r, v } if r.base() == R3 && v.base() == R2))
            .collect();
        assert_eq!(copies.len(), 1);
    }

    #[test]
    fn test_siblings_do_not_share_values() {
        let mut b = Builder::new();
        let other = b.label();
        let done = b.label();
        b.load_arg(0, R0);
        b.br(Cond::Eq, R0, 0, other);
        b.add(R0, R0, R1);
        b.jmp(done);
        b.bind(other);
        b.add(R0, R0, R2);
        b.bind(done);
        b.ret(&[R1, R2]);
        let mut cfg = ssa_from(&b.finish().unwrap());
        eliminate_common_subexpressions(&mut cfg).unwrap();
        let adds = cfg
            .blocks
            .values()
            .flat_map(|b| &b.ins)
            .filter(|i| matches!(i, IrNode::Binary { op: BinaryOp::Add, .. }))
            .count();
        assert_eq!(adds, 2);
    }
}
