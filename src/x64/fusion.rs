// This module holds the two peephole passes that exploit x86-64 operand forms. Fusion walks
// the dominator tree with a scoped map from registers to the address their Lea computes and
// folds those addresses into dependent loads, stores and further Leas, so an address defined
// in a dominating block still fuses into a memory operand. It also folds a load into the one
// compare of the same block that consumes it, provided no side effect lies between the two.
// Compaction then turns registers holding small literals into immediates: ALU and compare
// operands, stored values and the index register of memory operands.

//! Instruction fusion and compaction.

use super::ops::{Amd64Node, Mem, Operand};
use crate::core::{CompileResult, Reg};
use crate::passes::copy_elim::literals;
use crate::passes::{dom_walk, DomWalk, Pass, PassContext, ScopedMap};
use crate::ssa::ir::IrNode;
use crate::ssa::Cfg;
use std::collections::HashMap;

pub struct InstructionFusion;

impl Pass for InstructionFusion {
    fn name(&self) -> &'static str {
        "Instruction Fusion"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let addresses = fuse_addresses(cfg)?;
        let loads = fuse_compare_loads(cfg);
        log::trace!("fused {} addresses and {} loads", addresses, loads);
        Ok(())
    }
}

fn fold_address(leas: &ScopedMap<Reg, Mem>, m: &mut Mem) -> bool {
    if m.index.is_some() {
        return false;
    }
    let Some(def) = leas.get(&m.base) else {
        return false;
    };
    match def.disp.checked_add(m.disp) {
        Some(disp) => {
            *m = Mem { disp, ..*def };
            true
        }
        None => false,
    }
}

/// Fold Lea results into memory operands; returns the number of folds.
pub fn fuse_addresses(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut leas: ScopedMap<Reg, Mem> = ScopedMap::new();
    let mut folded = 0;
    for event in dom_walk(cfg) {
        let id = match event {
            DomWalk::Enter(id) => id,
            DomWalk::Exit => {
                leas.pop_scope();
                continue;
            }
        };
        leas.push_scope();
        for ins in &mut cfg.block_mut(id)?.ins {
            let IrNode::Machine(node) = ins else {
                continue;
            };
            match node {
                Amd64Node::Lea { r, m } => {
                    if fold_address(&leas, m) {
                        folded += 1;
                    }
                    leas.insert(*r, *m);
                }
                Amd64Node::Load { m, .. } | Amd64Node::Store { m, .. } | Amd64Node::StoreImm { m, .. } => {
                    if fold_address(&leas, m) {
                        folded += 1;
                    }
                }
                _ => {}
            }
        }
    }
    Ok(folded)
}

/// Fold single-use loads into the compare consuming them.
pub fn fuse_compare_loads(cfg: &mut Cfg) -> usize {
    let uses = cfg.use_counts();
    let mut fused = 0;
    for block in cfg.blocks.values_mut() {
        let mut loads: HashMap<Reg, (usize, Mem, u8)> = HashMap::new();
        let mut dead = Vec::new();
        for j in 0..block.ins.len() {
            if block.ins[j].is_impure() {
                loads.clear();
                continue;
            }
            match &mut block.ins[j] {
                IrNode::Machine(Amd64Node::Load { r, m, n }) if uses.get(&*r) == Some(&1) => {
                    loads.insert(*r, (j, *m, *n));
                }
                IrNode::Machine(Amd64Node::Cmp { x, y, .. }) => {
                    if matches!(x, Operand::Mem(..)) || matches!(y, Operand::Mem(..)) {
                        continue;
                    }
                    for operand in [x, y] {
                        let Operand::Reg(r) = *operand else {
                            continue;
                        };
                        if let Some((i, m, n)) = loads.remove(&r) {
                            *operand = Operand::Mem(m, n);
                            dead.push(i);
                            fused += 1;
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        for i in dead {
            block.ins[i] = IrNode::Nop;
        }
        block.ins.retain(|i| !matches!(i, IrNode::Nop));
    }
    fused
}

pub struct InstructionCompaction;

impl Pass for InstructionCompaction {
    fn name(&self) -> &'static str {
        "Instruction Compaction"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let compacted = compact(cfg);
        log::trace!("compacted {} operands", compacted);
        Ok(())
    }
}

fn compact_mem(imm: &dyn Fn(Reg) -> Option<i32>, m: &mut Mem) -> bool {
    let Some(index) = m.index else {
        return false;
    };
    let Some(disp) = imm(index).and_then(|v| v.checked_mul(m.scale as i32)).and_then(|v| v.checked_add(m.disp))
    else {
        return false;
    };
    m.index = None;
    m.scale = 1;
    m.disp = disp;
    true
}

fn compact_operand(imm: &dyn Fn(Reg) -> Option<i32>, op: &mut Operand) -> bool {
    match op {
        Operand::Reg(r) => match imm(*r) {
            Some(v) => {
                *op = Operand::Imm(v);
                true
            }
            None => false,
        },
        Operand::Mem(m, _) => compact_mem(imm, m),
        Operand::Imm(_) => false,
    }
}

/// Replace literal registers by immediates; returns the number of operands rewritten.
pub fn compact(cfg: &mut Cfg) -> usize {
    let lits = literals(cfg);
    let imm = |r: Reg| -> Option<i32> {
        if !r.is_virtual() {
            return None;
        }
        lits.get(&r).and_then(|&v| i32::try_from(v).ok())
    };
    let mut count = 0;
    for block in cfg.blocks.values_mut() {
        for ins in &mut block.ins {
            let IrNode::Machine(node) = ins else {
                continue;
            };
            match node {
                Amd64Node::Lea { m, .. } | Amd64Node::Load { m, .. } | Amd64Node::StoreImm { m, .. } => {
                    count += compact_mem(&imm, m) as usize;
                }
                Amd64Node::Store { r, m, n } => {
                    count += compact_mem(&imm, m) as usize;
                    if let Some(v) = imm(*r) {
                        *node = Amd64Node::StoreImm { v, m: *m, n: *n };
                        count += 1;
                    }
                }
                Amd64Node::Alu { op, x, y, .. } => {
                    if compact_operand(&imm, y) {
                        count += 1;
                    } else if let (true, Some(v), Operand::Reg(other)) = (op.is_commutative(), imm(*x), *y) {
                        *x = other;
                        *y = Operand::Imm(v);
                        count += 1;
                    }
                }
                Amd64Node::Cmp { op, x, y, .. } => {
                    if let Operand::Mem(m, _) = x {
                        count += compact_mem(&imm, m) as usize;
                    }
                    if compact_operand(&imm, y) {
                        count += 1;
                    } else if let (true, Some(v)) = (op.is_commutative(), x.as_reg().and_then(&imm)) {
                        std::mem::swap(x, y);
                        *y = Operand::Imm(v);
                        count += 1;
                    }
                }
                _ => {}
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::ssa_from;
    use crate::hir::{Builder, Cond, P0, R0, R1};
    use crate::passes::dce::eliminate_dead_code;
    use crate::ssa::ir::BinaryOp;
    use crate::x64::lowering::lower;

    fn lowered(b: &mut Builder) -> Cfg {
        let mut cfg = ssa_from(&std::mem::take(b).finish().unwrap());
        for block in cfg.blocks.values_mut() {
            for ins in &mut block.ins {
                if let Some(node) = lower(ins) {
                    *ins = IrNode::Machine(node);
                }
            }
        }
        cfg
    }

    fn machine(cfg: &Cfg) -> Vec<Amd64Node> {
        cfg.blocks
            .values()
            .flat_map(|b| &b.ins)
            .filter_map(|i| match i {
                IrNode::Machine(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_offset_load_becomes_displacement() {
        let mut b = Builder::new();
        b.load_arg(0, P0);
        b.ld(P0, 16, 4, R0);
        b.ret(&[R0]);
        let mut cfg = lowered(&mut b);
        assert_eq!(fuse_addresses(&mut cfg).unwrap(), 1);
        compact(&mut cfg);
        eliminate_dead_code(&mut cfg);
        let nodes = machine(&cfg);
        assert_eq!(nodes.len(), 1);
        let Amd64Node::Load { m, n: 4, .. } = &nodes[0] else {
            panic!("expected a load, got {:?}", nodes);
        };
        assert_eq!(m.disp, 16);
        assert_eq!(m.index, None);
        assert_eq!(m.base.base(), P0);
    }

    #[test]
    fn test_address_fuses_across_blocks() {
        let mut b = Builder::new();
        let skip = b.label();
        b.load_arg(0, P0);
        b.load_arg(1, R1);
        b.lea(P0, 8, P0);
        b.br(Cond::Eq, R1, 0, skip);
        b.st(R1, P0, 0, 8);
        b.bind(skip);
        b.ret(&[]);
        let mut cfg = lowered(&mut b);
        assert_eq!(fuse_addresses(&mut cfg).unwrap(), 1);
        let store = machine(&cfg)
            .into_iter()
            .find(|n| matches!(n, Amd64Node::Store { .. }))
            .unwrap();
        assert!(matches!(store, Amd64Node::Store { m, .. } if m.index.is_some()));
    }

    #[test]
    fn test_single_use_load_fuses_into_compare() {
        let mut b = Builder::new();
        let hit = b.label();
        b.load_arg(0, P0);
        b.ld(P0, 0, 1, R0);
        b.br(Cond::Eq, R0, 7, hit);
        b.ret(&[]);
        b.bind(hit);
        b.ret(&[]);
        let mut cfg = lowered(&mut b);
        assert_eq!(fuse_compare_loads(&mut cfg), 1);
        compact(&mut cfg);
        let cmp = machine(&cfg)
            .into_iter()
            .find(|n| matches!(n, Amd64Node::Cmp { .. }))
            .unwrap();
        assert!(matches!(
            cmp,
            Amd64Node::Cmp { op: BinaryOp::CmpEq, x: Operand::Mem(_, 1), y: Operand::Imm(7), .. }
        ));
        assert!(!machine(&cfg).iter().any(|n| matches!(n, Amd64Node::Load { .. })));
    }

    #[test]
    fn test_store_between_load_and_compare_prevents_fusion() {
        let mut b = Builder::new();
        let hit = b.label();
        b.load_arg(0, P0);
        b.ld(P0, 0, 8, R0);
        b.st(R1, P0, 0, 8);
        b.br(Cond::Eq, R0, 7, hit);
        b.ret(&[]);
        b.bind(hit);
        b.ret(&[]);
        let mut cfg = lowered(&mut b);
        assert_eq!(fuse_compare_loads(&mut cfg), 0);
    }
}
