// This module provides algebraic strength reduction and the reduction bundle the pipeline runs
// twice (early, before branch elimination, and late, after reordering). Algebraic reduction
// replaces operations with a known result regardless of their operands (x * 0, x & 0, x - x,
// x ^ x, comparisons of a register with itself) by literals and multiplications by a power of
// two with shifts. The Reduction pass interleaves copy elimination, algebraic reduction,
// common subexpression elimination and dead code elimination until none of them changes the
// graph; every step only removes or simplifies instructions, so the loop terminates, and a
// generous iteration cap turns a non-terminating bug into an internal error.

//! Algebraic reduction and the reduction bundle.

use super::copy_elim::{eliminate_copies, literals};
use super::cse::eliminate_common_subexpressions;
use super::dce::eliminate_dead_code;
use super::{Pass, PassContext};
use crate::core::{CompileError, CompileResult, RegClass};
use crate::ssa::ir::{BinaryOp, IrNode};
use crate::ssa::Cfg;

/// Upper bound on bundle iterations.
const MAX_REDUCTION_ROUNDS: usize = 64;

pub struct AlgebraicReduction;

impl Pass for AlgebraicReduction {
    fn name(&self) -> &'static str {
        "Algebraic Reduction"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        reduce_algebra(cfg)?;
        Ok(())
    }
}

/// Returns whether anything was rewritten.
pub fn reduce_algebra(cfg: &mut Cfg) -> CompileResult<bool> {
    let lits = literals(cfg);
    let lit = |r: crate::core::Reg| if r.is_zero() { Some(0) } else { lits.get(&r).copied() };
    let mut changed = false;
    for id in cfg.block_ids() {
        let old = std::mem::take(&mut cfg.block_mut(id)?.ins);
        let mut ins = Vec::with_capacity(old.len());
        for node in old {
            let (r, x, y, op) = match node {
                IrNode::Binary { r, x, y, op } if r.is_virtual() && !r.is_ptr() => (r, x, y, op),
                other => {
                    ins.push(other);
                    continue;
                }
            };
            let (lx, ly) = (lit(x), lit(y));
            let zero = match op {
                BinaryOp::Mul | BinaryOp::And => lx == Some(0) || ly == Some(0),
                BinaryOp::Sub | BinaryOp::Xor | BinaryOp::CmpNe | BinaryOp::CmpLt | BinaryOp::CmpLtu => {
                    x == y
                }
                _ => false,
            };
            let one = matches!(op, BinaryOp::CmpEq | BinaryOp::CmpGeu) && x == y;
            if zero || one {
                ins.push(IrNode::ConstInt { r, v: one as i64 });
                changed = true;
                continue;
            }
            if op == BinaryOp::Mul {
                let (factor, other) = match (lx, ly) {
                    (_, Some(k)) => (k, x),
                    (Some(k), _) => (k, y),
                    _ => (0, x),
                };
                if factor > 1 && factor.count_ones() == 1 {
                    let shift = cfg.create_register(RegClass::Int);
                    ins.push(IrNode::ConstInt { r: shift, v: factor.trailing_zeros() as i64 });
                    ins.push(IrNode::Binary { r, x: other, y: shift, op: BinaryOp::Shl });
                    changed = true;
                    continue;
                }
            }
            ins.push(IrNode::Binary { r, x, y, op });
        }
        cfg.block_mut(id)?.ins = ins;
    }
    Ok(changed)
}

/// Copy elimination, algebraic reduction, CSE and DCE to a joint fixpoint.
pub struct Reduction {
    name: &'static str,
}

impl Reduction {
    pub fn early() -> Self {
        Self { name: "Early Reduction" }
    }

    pub fn late() -> Self {
        Self { name: "Late Reduction" }
    }
}

impl Pass for Reduction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        for round in 0..MAX_REDUCTION_ROUNDS {
            let mut changed = eliminate_copies(cfg);
            changed |= reduce_algebra(cfg)?;
            changed |= eliminate_common_subexpressions(cfg)?;
            changed |= eliminate_dead_code(cfg);
            if !changed {
                log::trace!("{} reached a fixpoint after {} rounds", self.name, round + 1);
                return Ok(());
            }
        }
        Err(CompileError::internal(format!(
            "{} did not converge in {} rounds",
            self.name, MAX_REDUCTION_ROUNDS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::{ssa_from, TestContext};
    use crate::hir::{Builder, R0, R1, R2, R3};
    use crate::x64::abi::AbiDescriptor;

    #[test]
    fn test_self_cancelling_operations() {
        let mut b = Builder::new();
        b.load_arg(0, R0);
        b.sub(R0, R0, R1);
        b.alu(BinaryOp::Mul, R0, 8, R2);
        b.alu(BinaryOp::CmpEq, R0, R0, R3);
        b.ret(&[R1, R2, R3]);
        let mut cfg = ssa_from(&b.finish().unwrap());
        assert!(reduce_algebra(&mut cfg).unwrap());

        let body: Vec<&IrNode> = cfg.blocks.values().flat_map(|b| &b.ins).collect();
        assert!(body.iter().any(|i| matches!(i, IrNode::ConstInt { r, v: 0 } if r.base() == R1)));
        assert!(body.iter().any(|i| matches!(i, IrNode::ConstInt { r, v: 1 } if r.base() == R3)));
        assert!(body
            .iter()
            .any(|i| matches!(i, IrNode::Binary { r, op: BinaryOp::Shl, .. } if r.base() == R2)));
    }

    #[test]
    fn test_bundle_reaches_fixpoint() {
        let mut b = Builder::new();
        b.load_arg(0, R0);
        b.add(R0, 0, R1);
        b.add(R1, R0, R2);
        b.add(R0, R1, R3);
        b.ret(&[R2, R3]);
        let mut cfg = ssa_from(&b.finish().unwrap());
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let abi = AbiDescriptor::default();
        let pctx = PassContext::new(&session, &abi);
        Reduction::early().apply(&mut cfg, &pctx).unwrap();

        let adds = cfg
            .blocks
            .values()
            .flat_map(|b| &b.ins)
            .filter(|i| matches!(i, IrNode::Binary { .. }))
            .count();
        assert_eq!(adds, 1);
        let ret = cfg.blocks.values().find(|b| b.term.is_return()).unwrap();
        let rets = ret.term.uses();
        assert_eq!(rets[0], rets[1]);
    }
}
