//! Constant propagation.
//!
//! A pessimistic lattice over SSA registers: a register is either a known
//! integer, a known pointer (tagged with its [`Constness`]) or unknown.
//! Values are evaluated in reverse post-order until nothing changes; every
//! definition that became known is then replaced by a literal load. Phi
//! nodes fold when all incoming values are the same constant.

use super::{Pass, PassContext};
use crate::core::{CompileError, CompileResult, Reg, StaticMemory};
use crate::ssa::ir::{BinaryOp, Constness, IrNode};
use crate::ssa::Cfg;
use std::collections::HashMap;

/// A known value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Ptr(u64, Constness),
}

pub struct ConstantPropagation {
    name: &'static str,
}

impl ConstantPropagation {
    pub fn early() -> Self {
        Self { name: "Early Constant Propagation" }
    }

    pub fn late() -> Self {
        Self { name: "Late Constant Propagation" }
    }
}

impl Pass for ConstantPropagation {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let memory = ctx.session.options().static_memory.clone();
        let values = evaluate(cfg, memory.as_deref())?;
        let folded = fold(cfg, &values);
        ctx.session.record_constants_folded(folded);
        if folded > 0 {
            log::debug!("{}: folded {} definitions", self.name, folded);
        }
        Ok(())
    }
}

fn class_error(op: &str, r: Reg) -> CompileError {
    CompileError::internal(format!("{} applied to {} of the wrong class", op, r))
}

struct Lattice<'m> {
    known: HashMap<Reg, Value>,
    memory: Option<&'m dyn StaticMemory>,
}

impl<'m> Lattice<'m> {
    fn get(&self, r: Reg) -> Option<Value> {
        if r.is_zero() {
            return Some(if r.is_ptr() { Value::Ptr(0, Constness::Const) } else { Value::Int(0) });
        }
        self.known.get(&r).copied()
    }

    fn int(&self, r: Reg, op: &str) -> CompileResult<Option<i64>> {
        match self.get(r) {
            Some(Value::Int(v)) => Ok(Some(v)),
            Some(Value::Ptr(..)) => Err(class_error(op, r)),
            None => Ok(None),
        }
    }

    fn eval(&self, ins: &IrNode) -> CompileResult<Vec<(Reg, Value)>> {
        let out = match ins {
            IrNode::ConstInt { r, v } => vec![(*r, Value::Int(*v))],
            IrNode::ConstPtr { r, p, m } => vec![(*r, Value::Ptr(*p, *m))],
            IrNode::Copy { r, v } if r.is_virtual() && r.class() == v.class() => {
                self.get(*v).map(|val| (*r, val)).into_iter().collect()
            }
            IrNode::Unary { r, v, op } => self
                .int(*v, op.mnemonic())?
                .map(|x| (*r, Value::Int(op.eval(x))))
                .into_iter()
                .collect(),
            IrNode::Binary { r, x, y, op } => {
                let (a, b) = (self.get(*x), self.get(*y));
                let ptr_compare =
                    x.is_ptr() && y.is_ptr() && matches!(op, BinaryOp::CmpEq | BinaryOp::CmpNe);
                match (a, b) {
                    (Some(Value::Ptr(p, _)), Some(Value::Ptr(q, _))) if ptr_compare => {
                        vec![(*r, Value::Int(op.eval(p as i64, q as i64)))]
                    }
                    _ if ptr_compare => Vec::new(),
                    (Some(Value::Ptr(..)), _) => return Err(class_error(op.mnemonic(), *x)),
                    (_, Some(Value::Ptr(..))) => return Err(class_error(op.mnemonic(), *y)),
                    (Some(Value::Int(a)), Some(Value::Int(b))) => {
                        vec![(*r, Value::Int(op.eval(a, b)))]
                    }
                    _ => Vec::new(),
                }
            }
            IrNode::BitTestSet { t, s, x, y } => {
                match (self.int(*x, "bts")?, self.int(*y, "bts")?) {
                    (Some(x), Some(y)) => {
                        let bit = y & 63;
                        vec![
                            (*t, Value::Int((x >> bit) & 1)),
                            (*s, Value::Int(x | (1 << bit))),
                        ]
                    }
                    _ => Vec::new(),
                }
            }
            IrNode::Lea { r, mem, off } => match (self.get(*mem), self.int(*off, "lea")?) {
                (Some(Value::Int(_)), _) => return Err(class_error("lea", *mem)),
                (Some(Value::Ptr(p, m)), Some(o)) => {
                    vec![(*r, Value::Ptr(p.wrapping_add(o as u64), m))]
                }
                _ => Vec::new(),
            },
            IrNode::Load { r, mem, size } => match self.get(*mem) {
                Some(Value::Int(_)) => return Err(class_error("load", *mem)),
                Some(Value::Ptr(p, Constness::Const)) if p != 0 => {
                    match self.memory.and_then(|m| m.read(p, *size)) {
                        Some(v) if r.is_ptr() => vec![(*r, Value::Ptr(v, Constness::Volatile))],
                        Some(v) => vec![(*r, Value::Int(v as i64))],
                        None => Vec::new(),
                    }
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(out.into_iter().filter(|(r, _)| r.is_virtual()).collect())
    }
}

/// Compute every register's value to a fixpoint.
pub fn evaluate(cfg: &Cfg, memory: Option<&dyn StaticMemory>) -> CompileResult<HashMap<Reg, Value>> {
    let mut lattice = Lattice { known: HashMap::new(), memory };
    let order = cfg.rpo();
    loop {
        let mut changed = false;
        for id in &order {
            let block = cfg.block(*id)?;
            for phi in &block.phi {
                let mut incoming = phi.v.values().map(|&v| lattice.get(v));
                let first = incoming.next().flatten();
                if let Some(value) = first {
                    if incoming.all(|v| v == Some(value))
                        && lattice.known.insert(phi.r, value) != Some(value)
                    {
                        changed = true;
                    }
                }
            }
            for ins in &block.ins {
                for (r, value) in lattice.eval(ins)? {
                    if lattice.known.insert(r, value) != Some(value) {
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            return Ok(lattice.known);
        }
    }
}

fn literal(r: Reg, value: Value) -> IrNode {
    match value {
        Value::Int(v) => IrNode::ConstInt { r, v },
        Value::Ptr(p, m) => IrNode::ConstPtr { r, p, m },
    }
}

/// Replace known definitions by literal loads; returns how many changed.
fn fold(cfg: &mut Cfg, values: &HashMap<Reg, Value>) -> usize {
    let mut folded = 0;
    for block in cfg.blocks.values_mut() {
        let mut literals = Vec::new();
        block.phi.retain(|phi| match values.get(&phi.r) {
            Some(&value) => {
                literals.push(literal(phi.r, value));
                false
            }
            None => true,
        });
        folded += literals.len();

        for ins in &mut block.ins {
            if ins.is_impure() || matches!(ins, IrNode::ConstInt { .. } | IrNode::ConstPtr { .. }) {
                continue;
            }
            let defs = ins.defs();
            if defs.len() != 1 {
                continue;
            }
            if let Some(&value) = values.get(&defs[0]) {
                *ins = literal(defs[0], value);
                folded += 1;
            }
        }
        if !literals.is_empty() {
            literals.append(&mut block.ins);
            block.ins = literals;
        }
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::{ssa_from, TestContext};
    use crate::hir::{Builder, Cond, P0, P1, R0, R1, R2};
    use crate::x64::abi::AbiDescriptor;
    use std::sync::Arc;

    struct Table;

    impl StaticMemory for Table {
        fn read(&self, addr: u64, size: u8) -> Option<u64> {
            (addr == 0x1000 && size == 4).then_some(0xabcd)
        }
    }

    fn run(program: &crate::hir::Program, memory: Option<Arc<dyn StaticMemory>>) -> Cfg {
        let mut cfg = ssa_from(program);
        let ctx = TestContext::new();
        let options = match memory {
            Some(m) => crate::core::CompileOptions::default().with_static_memory(m),
            None => crate::core::CompileOptions::default(),
        };
        let session = ctx.session_with(options);
        let abi = AbiDescriptor::default();
        let pctx = PassContext::new(&session, &abi);
        ConstantPropagation::early().apply(&mut cfg, &pctx).unwrap();
        cfg
    }

    fn returned_literal(cfg: &Cfg) -> Vec<IrNode> {
        let ret = cfg.blocks.values().find(|b| b.term.is_return()).unwrap();
        let regs = ret.term.uses();
        cfg.blocks
            .values()
            .flat_map(|b| b.ins.iter())
            .filter(|i| i.defs().iter().any(|d| regs.contains(d)))
            .cloned()
            .collect()
    }

    #[test]
    fn test_arithmetic_folds() {
        let mut b = Builder::new();
        b.iconst(6, R0);
        b.iconst(7, R1);
        b.alu(BinaryOp::Mul, R0, R1, R2);
        b.ret(&[R2]);
        let cfg = run(&b.finish().unwrap(), None);
        let defs = returned_literal(&cfg);
        assert!(matches!(defs[..], [IrNode::ConstInt { v: 42, .. }]));
    }

    #[test]
    fn test_loads_fold_only_from_constant_memory() {
        let mut b = Builder::new();
        b.pconst(0x1000, true, P0);
        b.ld(P0, 0, 4, R0);
        b.ret(&[R0]);
        let prog = b.finish().unwrap();

        let cfg = run(&prog, Some(Arc::new(Table)));
        assert!(matches!(returned_literal(&cfg)[..], [IrNode::ConstInt { v: 0xabcd, .. }]));

        let cfg = run(&prog, None);
        assert!(matches!(returned_literal(&cfg)[..], [IrNode::Load { .. }]));
    }

    #[test]
    fn test_pointer_arithmetic_is_an_internal_error() {
        let mut cfg = Cfg::new();
        let p = cfg.create_register(crate::core::RegClass::Ptr);
        let r = cfg.create_register(crate::core::RegClass::Int);
        let root = cfg.root;
        cfg.block_mut(root).unwrap().ins = vec![
            IrNode::ConstPtr { r: p, p: 8, m: Constness::Volatile },
            IrNode::Binary { r, x: p, y: p, op: BinaryOp::Add },
        ];
        cfg.rebuild().unwrap();
        let err = evaluate(&cfg, None).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn test_unknown_pointer_compared_with_nil_stays_unknown() {
        let mut b = Builder::new();
        let nil = b.label();
        b.load_arg(0, P0);
        b.br(Cond::Eq, P0, 0, nil);
        b.iconst(1, R0);
        b.ret(&[R0]);
        b.bind(nil);
        b.iconst(2, R0);
        b.ret(&[R0]);
        let cfg = run(&b.finish().unwrap(), None);
        let compares = cfg
            .blocks
            .values()
            .flat_map(|b| b.ins.iter())
            .filter(|i| matches!(i, IrNode::Binary { op: BinaryOp::CmpEq, .. }))
            .count();
        assert_eq!(compares, 1);
    }

    #[test]
    fn test_known_pointers_compare() {
        let mut b = Builder::new();
        b.pconst(0x1000, false, P0);
        b.pconst(0x1000, false, P1);
        b.emit(crate::hir::Instr::Alu {
            op: BinaryOp::CmpNe,
            x: P0,
            y: crate::hir::Src::Reg(P1),
            rd: R0,
        });
        b.ret(&[R0]);
        let cfg = run(&b.finish().unwrap(), None);
        assert!(matches!(returned_literal(&cfg)[..], [IrNode::ConstInt { v: 0, .. }]));
    }
}
