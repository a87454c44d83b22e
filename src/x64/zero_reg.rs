//! Zero register substitution.
//!
//! x86-64 has no register that always reads as zero. Reads of the zero and
//! nil registers become immediates where an operand form allows one and a
//! freshly materialized literal everywhere else; a zero register written as
//! a secondary result gets a scratch register instead.

use super::ops::{Amd64Node, Mem, Operand};
use crate::core::{CompileResult, Reg};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{Constness, IrNode, Terminator};
use crate::ssa::Cfg;

pub struct ZeroRegisterSubstitution;

impl Pass for ZeroRegisterSubstitution {
    fn name(&self) -> &'static str {
        "Zero Register Substitution"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let replaced = substitute_zero_registers(cfg)?;
        log::trace!("replaced {} zero register operands", replaced);
        Ok(())
    }
}

/// A literal zero of `zero`'s class in `r`.
fn zero_literal(r: Reg, zero: Reg) -> IrNode {
    if zero.is_ptr() && r.is_ptr() {
        IrNode::ConstPtr { r, p: 0, m: Constness::Const }
    } else {
        IrNode::ConstInt { r, v: 0 }
    }
}

fn immediate_forms(node: &mut IrNode) -> usize {
    let zero_operand = |op: &mut Operand| match op {
        Operand::Reg(r) if r.is_zero() => {
            *op = Operand::Imm(0);
            1
        }
        _ => 0,
    };
    let drop_index = |m: &mut Mem| match m.index {
        Some(i) if i.is_zero() => {
            m.index = None;
            1
        }
        _ => 0,
    };
    match node {
        IrNode::Copy { r, v } if v.is_zero() => {
            *node = zero_literal(*r, *v);
            1
        }
        IrNode::Machine(Amd64Node::Alu { y, .. }) => zero_operand(y),
        IrNode::Machine(Amd64Node::Cmp { x, y, .. }) => zero_operand(x) + zero_operand(y),
        IrNode::Machine(Amd64Node::Store { r, m, n }) if r.is_zero() => {
            let (mut m, n) = (*m, *n);
            let dropped = drop_index(&mut m);
            *node = IrNode::Machine(Amd64Node::StoreImm { v: 0, m, n });
            1 + dropped
        }
        IrNode::Machine(
            Amd64Node::Lea { m, .. }
            | Amd64Node::Load { m, .. }
            | Amd64Node::Store { m, .. }
            | Amd64Node::StoreImm { m, .. },
        ) => drop_index(m),
        _ => 0,
    }
}

/// Remove every zero register operand; returns the number replaced.
pub fn substitute_zero_registers(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut count = 0;
    for id in cfg.block_ids() {
        let old = std::mem::take(&mut cfg.block_mut(id)?.ins);
        let mut ins = Vec::with_capacity(old.len());
        for mut node in old {
            count += immediate_forms(&mut node);
            let mut zeros: Vec<Reg> = node.uses().into_iter().filter(|r| r.is_zero()).collect();
            zeros.dedup();
            for z in zeros {
                let t = cfg.create_register(z.class());
                ins.push(zero_literal(t, z));
                node.replace_use(z, t);
                count += 1;
            }
            if let IrNode::BitTestSet { t, s, .. } = &mut node {
                for d in [t, s] {
                    if d.is_zero() {
                        *d = cfg.create_register(d.class());
                        count += 1;
                    }
                }
            }
            ins.push(node);
        }
        let block = cfg.block_mut(id)?;
        block.ins = ins;
        if let Terminator::Switch(sw) = &block.term {
            if !sw.br.is_empty() && sw.v.is_zero() {
                let z = sw.v;
                let t = cfg.create_register(z.class());
                let block = cfg.block_mut(id)?;
                block.ins.push(zero_literal(t, z));
                if let Terminator::Switch(sw) = &mut block.term {
                    sw.v = t;
                }
                count += 1;
            }
        }
    }
    Ok(count)
}
