// This module implements the CFG builder, the first stage of the pipeline. It scans the HIR
// instruction stream once to mark block boundaries (position 0, every branch target and the
// position after every branching instruction), creates one block per boundary and then
// translates each run of instructions into IR nodes. Two-way branches become a compare into
// a fresh register followed by a switch whose case 1 is the taken target and whose default is
// the fall-through; multi-way branches become sparse switches. Immediates and memory offsets
// are materialized through a small rotating pool of temporaries, and pure instructions whose
// only destination is a zero register are dropped. A synthetic root block defines every HIR
// register and every temporary as zero so no register is ever read uninitialized. Malformed
// streams (bad targets, wrong register classes, falling off the end) are fatal.

//! HIR to CFG translation.

use super::cfg::Cfg;
use super::ir::{BinaryOp, BlockId, Constness, IrNode, Switch, Target, Terminator};
use crate::core::{CompileError, CompileResult, Reg, RegClass, RegKind, PN, RZ};
use crate::hir::{Instr, Program, Src, NUM_REGS};
use std::collections::{BTreeMap, BTreeSet};

/// Size of the temporary pool per register class.
pub const TEMP_POOL: u32 = 8;

/// Translate `program` into a CFG with current dominators.
pub fn build_cfg(program: &Program) -> CompileResult<Cfg> {
    CfgBuilder::new(program).build()
}

struct CfgBuilder<'p> {
    program: &'p Program,
    cfg: Cfg,
    block_of: BTreeMap<usize, BlockId>,
    next_tmp: [u32; 2],
}

fn class_slot(class: RegClass) -> usize {
    match class {
        RegClass::Int => 0,
        RegClass::Ptr => 1,
    }
}

impl<'p> CfgBuilder<'p> {
    fn new(program: &'p Program) -> Self {
        Self {
            program,
            cfg: Cfg::new(),
            block_of: BTreeMap::new(),
            next_tmp: [0; 2],
        }
    }

    fn build(mut self) -> CompileResult<Cfg> {
        let len = self.program.len();
        if len == 0 {
            return Err(CompileError::malformed(0, "empty program"));
        }

        let mut marks = BTreeSet::from([0usize]);
        for (at, ins) in self.program.ins.iter().enumerate() {
            for t in ins.targets() {
                if t >= len {
                    return Err(CompileError::malformed(at, format!("branch target {} out of range", t)));
                }
                marks.insert(t);
            }
            if ins.is_branch() && at + 1 < len {
                marks.insert(at + 1);
            }
        }
        for &m in &marks {
            let id = self.cfg.create_block(Terminator::Return { r: Vec::new() });
            self.block_of.insert(m, id);
        }

        self.init_root()?;

        let starts: Vec<usize> = marks.iter().copied().collect();
        for (k, &start) in starts.iter().enumerate() {
            let end = starts.get(k + 1).copied().unwrap_or(len);
            self.translate_block(start, end)?;
        }

        self.cfg.recompute_predecessors();
        self.cfg.rebuild()?;
        log::debug!(
            "built CFG with {} blocks from {} instructions",
            self.cfg.len(),
            len
        );
        Ok(self.cfg)
    }

    /// Zero every register the program or the temporary pool can name.
    fn init_root(&mut self) -> CompileResult<()> {
        let entry = self.target_block(0, 0)?;
        let root = self.cfg.root;
        let block = self.cfg.block_mut(root)?;
        for n in 0..NUM_REGS {
            block.ins.push(IrNode::Copy { r: Reg::norm_int(n), v: RZ });
            block.ins.push(IrNode::Copy { r: Reg::norm_ptr(n), v: PN });
        }
        for n in 0..TEMP_POOL {
            block.ins.push(IrNode::Copy { r: Reg::tmp(RegClass::Int, n), v: RZ });
            block.ins.push(IrNode::Copy { r: Reg::tmp(RegClass::Ptr, n), v: PN });
        }
        block.term = Terminator::jump(entry);
        Ok(())
    }

    fn target_block(&self, at: usize, pos: usize) -> CompileResult<BlockId> {
        self.block_of
            .get(&pos)
            .copied()
            .ok_or_else(|| CompileError::malformed(at, format!("position {} does not start a block", pos)))
    }

    fn translate_block(&mut self, start: usize, end: usize) -> CompileResult<()> {
        let id = self.target_block(start, start)?;
        let mut ins = Vec::new();
        let mut term = None;
        for at in start..end {
            let instr = &self.program.ins[at];
            if instr.is_branch() {
                term = Some(self.translate_branch(at, instr, &mut ins)?);
                break;
            }
            let mut local = Vec::new();
            self.translate(at, instr, &mut local)?;
            let discard = match local.last() {
                Some(node) => !node.is_impure() && node.defs().is_empty(),
                None => true,
            };
            if !discard {
                ins.extend(local);
            }
        }
        let term = match term {
            Some(t) => t,
            None if end >= self.program.len() => {
                return Err(CompileError::malformed(end - 1, "control runs off the end of the program"));
            }
            None => Terminator::jump(self.target_block(end, end)?),
        };
        let block = self.cfg.block_mut(id)?;
        block.ins = ins;
        block.term = term;
        Ok(())
    }

    fn check(&self, at: usize, r: Reg, class: RegClass) -> CompileResult<Reg> {
        let named = match r.kind() {
            RegKind::Zero => true,
            RegKind::Norm => r.name() < NUM_REGS,
            _ => false,
        };
        if !named {
            return Err(CompileError::malformed(at, format!("{} is not a program register", r)));
        }
        if r.class() != class {
            return Err(CompileError::malformed(at, format!("{} used as {:?}", r, class)));
        }
        Ok(r)
    }

    fn temp(&mut self, class: RegClass) -> Reg {
        let slot = &mut self.next_tmp[class_slot(class)];
        let r = Reg::tmp(class, *slot);
        *slot = (*slot + 1) % TEMP_POOL;
        r
    }

    /// Materialize an integer operand.
    fn int_operand(&mut self, at: usize, src: Src, out: &mut Vec<IrNode>) -> CompileResult<Reg> {
        match src {
            Src::Reg(r) => self.check(at, r, RegClass::Int),
            Src::Imm(0) => Ok(RZ),
            Src::Imm(v) => {
                let t = self.temp(RegClass::Int);
                out.push(IrNode::ConstInt { r: t, v });
                Ok(t)
            }
        }
    }

    /// Pointer to `p + off`.
    fn address(&mut self, at: usize, p: Reg, off: i32, out: &mut Vec<IrNode>) -> CompileResult<Reg> {
        let p = self.check(at, p, RegClass::Ptr)?;
        if off == 0 {
            return Ok(p);
        }
        let t = self.temp(RegClass::Int);
        let tp = self.temp(RegClass::Ptr);
        out.push(IrNode::ConstInt { r: t, v: off as i64 });
        out.push(IrNode::Lea { r: tp, mem: p, off: t });
        Ok(tp)
    }

    fn translate(&mut self, at: usize, instr: &Instr, out: &mut Vec<IrNode>) -> CompileResult<()> {
        use RegClass::{Int, Ptr};
        let node = match instr {
            Instr::LoadArg { id, rd } => IrNode::LoadArg { r: self.check(at, *rd, rd.class())?, id: *id },
            Instr::IConst { v, rd } => IrNode::ConstInt { r: self.check(at, *rd, Int)?, v: *v },
            Instr::PConst { p, constant, pd } => IrNode::ConstPtr {
                r: self.check(at, *pd, Ptr)?,
                p: *p,
                m: if *constant { Constness::Const } else { Constness::Volatile },
            },
            Instr::Mov { rs, rd } => {
                let v = self.check(at, *rs, rd.class())?;
                IrNode::Copy { r: self.check(at, *rd, rs.class())?, v }
            }
            Instr::Alu { op, x, y, rd } => {
                let r = self.check(at, *rd, Int)?;
                let ptr_compare = x.class() == Ptr && matches!(op, BinaryOp::CmpEq | BinaryOp::CmpNe);
                let (x, y) = if ptr_compare {
                    let x = self.check(at, *x, Ptr)?;
                    let y = match y {
                        Src::Reg(r) => self.check(at, *r, Ptr)?,
                        Src::Imm(0) => PN,
                        Src::Imm(v) => {
                            return Err(CompileError::malformed(at, format!("pointer compared with {}", v)))
                        }
                    };
                    (x, y)
                } else {
                    let x = self.check(at, *x, Int)?;
                    (x, self.int_operand(at, *y, out)?)
                };
                IrNode::Binary { r, x, y, op: *op }
            }
            Instr::Unary { op, rs, rd } => IrNode::Unary {
                r: self.check(at, *rd, Int)?,
                v: self.check(at, *rs, Int)?,
                op: *op,
            },
            Instr::Bts { x, y, rt, rs } => IrNode::BitTestSet {
                t: self.check(at, *rt, Int)?,
                s: self.check(at, *rs, Int)?,
                x: self.check(at, *x, Int)?,
                y: self.check(at, *y, Int)?,
            },
            Instr::Lea { p, off, pd } => {
                let mem = self.check(at, *p, Ptr)?;
                let off = self.int_operand(at, *off, out)?;
                IrNode::Lea { r: self.check(at, *pd, Ptr)?, mem, off }
            }
            Instr::Ld { p, off, size, rd } => {
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(CompileError::malformed(at, format!("load of {} bytes", size)));
                }
                let r = self.check(at, *rd, Int)?;
                let mem = self.address(at, *p, *off, out)?;
                IrNode::Load { r, mem, size: *size }
            }
            Instr::Lp { p, off, pd } => {
                let r = self.check(at, *pd, Ptr)?;
                let mem = self.address(at, *p, *off, out)?;
                IrNode::Load { r, mem, size: 8 }
            }
            Instr::St { r, p, off, size } => {
                if !matches!(size, 1 | 2 | 4 | 8) {
                    return Err(CompileError::malformed(at, format!("store of {} bytes", size)));
                }
                let r = self.check(at, *r, Int)?;
                let mem = self.address(at, *p, *off, out)?;
                IrNode::Store { r, mem, size: *size }
            }
            Instr::Sp { v, p, off, var, func } => {
                let r = self.check(at, *v, Ptr)?;
                let mem = self.address(at, *p, *off, out)?;
                IrNode::WriteBarrier { r, mem, var: *var, func: func.clone() }
            }
            Instr::Call { func, args, rets } => {
                if args.len() != func.abi.args.len() || rets.len() != func.abi.rets.len() {
                    return Err(CompileError::malformed(
                        at,
                        format!("call to {} does not match its signature", func.name),
                    ));
                }
                let input = args
                    .iter()
                    .zip(&func.abi.args)
                    .map(|(&r, p)| self.check(at, r, p.class))
                    .collect::<CompileResult<Vec<_>>>()?;
                let output = rets
                    .iter()
                    .zip(&func.abi.rets)
                    .map(|(&r, p)| self.check(at, r, p.class))
                    .collect::<CompileResult<Vec<_>>>()?;
                IrNode::Call { func: func.clone(), input, output }
            }
            Instr::Bzero { p, len } => IrNode::BlockZero { mem: self.check(at, *p, Ptr)?, len: *len },
            Instr::Bcopy { src, dst, len } => IrNode::BlockCopy {
                mem: self.check(at, *dst, Ptr)?,
                src: self.check(at, *src, Ptr)?,
                len: self.check(at, *len, Int)?,
            },
            Instr::Break => IrNode::Breakpoint,
            _ => return Err(CompileError::internal("branch translated as a plain instruction")),
        };
        out.push(node);
        Ok(())
    }

    fn translate_branch(
        &mut self,
        at: usize,
        instr: &Instr,
        out: &mut Vec<IrNode>,
    ) -> CompileResult<Terminator> {
        match instr {
            Instr::Br { cond, x, y, to } => {
                let fallthrough = at + 1;
                if fallthrough >= self.program.len() {
                    return Err(CompileError::malformed(at, "conditional branch falls off the end"));
                }
                let (op, swap) = cond.compare_op();
                let (x, y) = if x.class() == RegClass::Ptr {
                    if !matches!(op, BinaryOp::CmpEq | BinaryOp::CmpNe) {
                        return Err(CompileError::malformed(at, "ordered comparison of pointers"));
                    }
                    let y = match y {
                        Src::Reg(r) => self.check(at, *r, RegClass::Ptr)?,
                        Src::Imm(0) => PN,
                        Src::Imm(_) => return Err(CompileError::malformed(at, "pointer compared with a literal")),
                    };
                    (self.check(at, *x, RegClass::Ptr)?, y)
                } else {
                    let x = self.check(at, *x, RegClass::Int)?;
                    (x, self.int_operand(at, *y, out)?)
                };
                let (x, y) = if swap { (y, x) } else { (x, y) };
                let c = self.cfg.create_register(RegClass::Int);
                out.push(IrNode::Binary { r: c, x, y, op });
                let mut br = BTreeMap::new();
                br.insert(1, Target::new(self.target_block(at, *to)?));
                Ok(Terminator::Switch(Switch {
                    v: c,
                    ln: Target::new(self.target_block(at, fallthrough)?),
                    br,
                }))
            }
            Instr::Bsw { v, table, default } => {
                let v = self.check(at, *v, RegClass::Int)?;
                let mut br = BTreeMap::new();
                for &(key, pos) in table {
                    let t = Target::new(self.target_block(at, pos)?);
                    br.entry(key).or_insert(t);
                }
                Ok(Terminator::Switch(Switch {
                    v,
                    ln: Target::new(self.target_block(at, *default)?),
                    br,
                }))
            }
            Instr::Jmp { to } => Ok(Terminator::jump(self.target_block(at, *to)?)),
            Instr::Ret { r } => {
                let r = r
                    .iter()
                    .map(|&r| self.check(at, r, r.class()))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(Terminator::Return { r })
            }
            _ => Err(CompileError::internal("plain instruction translated as a branch")),
        }
    }
}
