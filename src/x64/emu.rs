// This module executes compiled functions. The emulator runs the flattened stream produced
// by the driver over the sixteen general purpose registers, the spill slots of the frame,
// the incoming and outgoing stack argument areas and the same Memory and CallTable the HIR
// interpreter uses, so the two can be compared on the same inputs. Registers start out
// holding a recognizable garbage pattern and every call scrambles the registers it clobbers,
// which makes a value that was wrongly kept in a caller-saved register across a call show up
// as a wrong result instead of passing by accident. On return the callee-saved registers the
// frame does not save must still hold their initial pattern.

//! Flat stream emulator.

use super::abi::{AbiDescriptor, ParamLoc};
use super::ops::{Amd64Node, Mem, Operand, StackArea};
use super::regs::CALLEE_SAVED;
use crate::compiler::CompiledFunction;
use crate::core::{AsmReg, Reg, NUM_GP_REGS};
use crate::hir::{CallTable, ExecError, Interpreter, Memory, Outcome};
use crate::linearize::Flat;
use crate::ssa::ir::{BlockId, IrNode, Slot, SpillOp};
use hashbrown::HashMap;

/// Initial contents of register `id`.
fn garbage(id: usize) -> u64 {
    0xdead_beef_0000_0000 | id as u64
}

/// Contents of register `id` after a call clobbered it.
fn scrambled(id: usize) -> u64 {
    0xbad0_c0de_0000_0000 | id as u64
}

pub struct Emulator<'f> {
    func: &'f CompiledFunction,
    abi: &'f AbiDescriptor,
    regs: [u64; NUM_GP_REGS],
    slots: HashMap<Slot, u64>,
    incoming: HashMap<i32, u64>,
    outgoing: HashMap<i32, u64>,
    fuel: usize,
}

impl<'f> Emulator<'f> {
    pub fn new(func: &'f CompiledFunction, abi: &'f AbiDescriptor) -> Self {
        let mut regs = [0; NUM_GP_REGS];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = garbage(i);
        }
        Self {
            func,
            abi,
            regs,
            slots: HashMap::new(),
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
            fuel: Interpreter::DEFAULT_FUEL,
        }
    }

    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    fn index(r: Reg) -> Result<Option<usize>, ExecError> {
        if r.is_zero() {
            return Ok(None);
        }
        match AsmReg::from_reg(r) {
            Some(a) => Ok(Some(a.id as usize)),
            None => Err(ExecError::Unsupported { what: format!("virtual register {}", r) }),
        }
    }

    fn get(&self, r: Reg) -> Result<u64, ExecError> {
        Ok(Self::index(r)?.map_or(0, |i| self.regs[i]))
    }

    fn set(&mut self, r: Reg, v: u64) -> Result<(), ExecError> {
        if let Some(i) = Self::index(r)? {
            self.regs[i] = v;
        }
        Ok(())
    }

    fn address(&self, m: &Mem) -> Result<u64, ExecError> {
        let mut addr = self.get(m.base)?.wrapping_add(m.disp as i64 as u64);
        if let Some(index) = m.index {
            addr = addr.wrapping_add(self.get(index)?.wrapping_mul(m.scale as u64));
        }
        Ok(addr)
    }

    fn operand(&self, op: &Operand, mem: &Memory) -> Result<u64, ExecError> {
        match op {
            Operand::Reg(r) => self.get(*r),
            Operand::Imm(v) => Ok(*v as i64 as u64),
            Operand::Mem(m, n) => Ok(mem.read(self.address(m)?, *n)),
        }
    }

    fn area(&mut self, area: StackArea) -> &mut HashMap<i32, u64> {
        match area {
            StackArea::Incoming => &mut self.incoming,
            StackArea::Outgoing => &mut self.outgoing,
        }
    }

    fn call(&mut self, node: &Amd64Node, mem: &mut Memory, calls: &mut CallTable) -> Result<(), ExecError> {
        let Amd64Node::CallFunc { func, output, clobbers, .. } = node else {
            return Ok(());
        };
        let mut args = Vec::with_capacity(func.abi.args.len());
        for (id, param) in func.abi.args.iter().enumerate() {
            let v = match param.loc {
                ParamLoc::Register(a) => self.regs[a.id as usize],
                ParamLoc::Stack(offset) => {
                    *self.outgoing.get(&offset).ok_or(ExecError::MissingArgument { id })?
                }
            };
            args.push(v);
        }
        let rets = calls.invoke(func.id, &args, mem)?;
        for a in clobbers.iter() {
            self.regs[a.id as usize] = scrambled(a.id as usize);
        }
        for (&r, v) in output.iter().zip(rets) {
            self.set(r, v)?;
        }
        Ok(())
    }

    fn step(&mut self, ins: &IrNode, mem: &mut Memory, calls: &mut CallTable) -> Result<(), ExecError> {
        match ins {
            IrNode::Nop | IrNode::Breakpoint | IrNode::Entry { .. } => {}
            IrNode::ConstInt { r, v } => self.set(*r, *v as u64)?,
            IrNode::ConstPtr { r, p, .. } => self.set(*r, *p)?,
            IrNode::Copy { r, v } => self.set(*r, self.get(*v)?)?,
            IrNode::Lea { r, mem: base, off } => {
                self.set(*r, self.get(*base)?.wrapping_add(self.get(*off)?))?
            }
            IrNode::Load { r, mem: base, size } => self.set(*r, mem.read(self.get(*base)?, *size))?,
            IrNode::Store { r, mem: base, size } => mem.write(self.get(*base)?, *size, self.get(*r)?),
            IrNode::Unary { r, v, op } => self.set(*r, op.eval(self.get(*v)? as i64) as u64)?,
            IrNode::Binary { r, x, y, op } => {
                let v = op.eval(self.get(*x)? as i64, self.get(*y)? as i64);
                self.set(*r, v as u64)?
            }
            IrNode::BitTestSet { t, s, x, y } => {
                let (xv, yv) = (self.get(*x)?, self.get(*y)? & 63);
                self.set(*t, (xv >> yv) & 1)?;
                self.set(*s, xv | (1 << yv))?;
            }
            IrNode::BlockZero { mem: base, len } => mem.zero(self.get(*base)?, *len as u64),
            IrNode::BlockCopy { mem: dst, src, len } => {
                mem.copy(self.get(*dst)?, self.get(*src)?, self.get(*len)?)
            }
            IrNode::Spill { op: SpillOp::Store, r, slot } => {
                let v = self.get(*r)?;
                self.slots.insert(*slot, v);
            }
            IrNode::Spill { op: SpillOp::Reload, r, slot } => {
                let v = self.slots.get(slot).copied().unwrap_or(0);
                self.set(*r, v)?;
            }
            IrNode::Machine(m) => self.machine(m, mem, calls)?,
            IrNode::LoadArg { .. } | IrNode::Call { .. } | IrNode::WriteBarrier { .. } => {
                return Err(ExecError::Unsupported { what: ins.to_string() })
            }
        }
        Ok(())
    }

    fn machine(&mut self, node: &Amd64Node, mem: &mut Memory, calls: &mut CallTable) -> Result<(), ExecError> {
        match node {
            Amd64Node::Lea { r, m } => self.set(*r, self.address(m)?)?,
            Amd64Node::Load { r, m, n } => self.set(*r, mem.read(self.address(m)?, *n))?,
            Amd64Node::Store { r, m, n } => mem.write(self.address(m)?, *n, self.get(*r)?),
            Amd64Node::StoreImm { v, m, n } => mem.write(self.address(m)?, *n, *v as i64 as u64),
            Amd64Node::Alu { op, r, x, y } => {
                let v = op.eval(self.get(*x)? as i64, self.operand(y, mem)? as i64);
                self.set(*r, v as u64)?
            }
            Amd64Node::Cmp { op, r, x, y } => {
                let v = op.eval(self.operand(x, mem)? as i64, self.operand(y, mem)? as i64);
                self.set(*r, v as u64)?
            }
            Amd64Node::CallFunc { .. } => self.call(node, mem, calls)?,
            Amd64Node::LoadStack { r, offset, area } => {
                let v = self.area(*area).get(offset).copied().unwrap_or(0);
                self.set(*r, v)?
            }
            Amd64Node::StoreStack { r, offset, area } => {
                let v = self.get(*r)?;
                self.area(*area).insert(*offset, v);
            }
        }
        Ok(())
    }

    fn target(&self, to: BlockId) -> Result<usize, ExecError> {
        self.func
            .block_offsets
            .get(&to)
            .copied()
            .ok_or(ExecError::BadTarget { pos: to.0 as usize })
    }

    /// Run the function with `args` until it returns.
    pub fn run(mut self, args: &[u64], mem: &mut Memory, calls: &mut CallTable) -> Result<Outcome, ExecError> {
        let (func, abi) = (self.func, self.abi);
        for (id, param) in abi.args.iter().enumerate() {
            let v = *args.get(id).ok_or(ExecError::MissingArgument { id })?;
            match param.loc {
                ParamLoc::Register(a) => self.regs[a.id as usize] = v,
                ParamLoc::Stack(offset) => {
                    self.incoming.insert(offset, v);
                }
            }
        }

        let mut pc = 0usize;
        let mut steps = 0usize;
        loop {
            if steps >= self.fuel {
                return Err(ExecError::OutOfFuel { steps });
            }
            steps += 1;
            let item = func.code.get(pc).ok_or(ExecError::BadTarget { pos: pc })?;
            pc += 1;
            match item {
                Flat::Ins(ins) => self.step(ins, mem, calls)?,
                Flat::Jmp(to) => pc = self.target(*to)?,
                Flat::Branch { v, br, ln } => {
                    let key = self.get(*v)? as i64;
                    match (br.get(&key), ln) {
                        (Some(to), _) => pc = self.target(*to)?,
                        (None, Some(to)) => pc = self.target(*to)?,
                        (None, None) => {}
                    }
                }
                Flat::Ret { r } => {
                    self.check_callee_saved()?;
                    let rets = r.iter().map(|&r| self.get(r)).collect::<Result<_, _>>()?;
                    return Ok(Outcome { rets, steps });
                }
            }
        }
    }

    fn check_callee_saved(&self) -> Result<(), ExecError> {
        for a in CALLEE_SAVED.iter() {
            let id = a.id as usize;
            if self.regs[id] != garbage(id) && !self.func.frame.saved_registers.contains(&a) {
                return Err(ExecError::ClobberedRegister { reg: a.to_string() });
            }
        }
        Ok(())
    }
}
