// This module gives HIR programs a concrete meaning. The interpreter executes a Program
// directly over sixteen 64-bit registers and a sparse byte-addressed Memory, dispatching
// external calls through a CallTable of Rust closures. It is the oracle of the end-to-end
// tests: a program compiled through the full pipeline and run on the x86-64 emulator must
// return the same values and leave memory in the same state as this interpreter does on the
// original program. Memory and CallTable are shared with the emulator for that reason.

//! Reference interpreter for HIR programs.

use super::{Instr, Program, Src, NUM_REGS};
use crate::core::{Reg, RegClass};
use hashbrown::HashMap;
use thiserror::Error;

/// Failure while executing a program or a compiled stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Execution did not finish within {steps} steps")]
    OutOfFuel { steps: usize },

    #[error("Call to unknown function #{id}")]
    UnknownFunction { id: usize },

    #[error("Control reached position {pos}, which holds no instruction")]
    BadTarget { pos: usize },

    #[error("Argument #{id} was not supplied")]
    MissingArgument { id: usize },

    #[error("Cannot execute {what}")]
    Unsupported { what: String },

    #[error("Callee-saved register {reg} was modified without being saved")]
    ClobberedRegister { reg: String },
}

/// Sparse little-endian byte memory; unwritten bytes read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    bytes: HashMap<u64, u8>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-extended read of `size` bytes.
    pub fn read(&self, addr: u64, size: u8) -> u64 {
        let mut v = 0u64;
        for i in (0..size as u64).rev() {
            let b = self.bytes.get(&addr.wrapping_add(i)).copied().unwrap_or(0);
            v = (v << 8) | b as u64;
        }
        v
    }

    pub fn write(&mut self, addr: u64, size: u8, value: u64) {
        for i in 0..size as u64 {
            self.bytes.insert(addr.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    }

    pub fn zero(&mut self, addr: u64, len: u64) {
        for i in 0..len {
            self.bytes.insert(addr.wrapping_add(i), 0);
        }
    }

    /// Copy `len` bytes from `src` to `dst`, front to back.
    pub fn copy(&mut self, dst: u64, src: u64, len: u64) {
        for i in 0..len {
            let b = self.bytes.get(&src.wrapping_add(i)).copied().unwrap_or(0);
            self.bytes.insert(dst.wrapping_add(i), b);
        }
    }

    /// Non-zero bytes, for comparing final memory states.
    pub fn snapshot(&self) -> Vec<(u64, u8)> {
        let mut out: Vec<(u64, u8)> =
            self.bytes.iter().filter(|(_, &b)| b != 0).map(|(&a, &b)| (a, b)).collect();
        out.sort_unstable();
        out
    }
}

/// Implementation of an external function.
pub type ExternFn = Box<dyn FnMut(&[u64], &mut Memory) -> Vec<u64>>;

/// External functions by call handle id.
#[derive(Default)]
pub struct CallTable {
    funcs: HashMap<usize, ExternFn>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: usize,
        f: impl FnMut(&[u64], &mut Memory) -> Vec<u64> + 'static,
    ) -> &mut Self {
        self.funcs.insert(id, Box::new(f));
        self
    }

    pub fn invoke(&mut self, id: usize, args: &[u64], mem: &mut Memory) -> Result<Vec<u64>, ExecError> {
        let f = self.funcs.get_mut(&id).ok_or(ExecError::UnknownFunction { id })?;
        Ok(f(args, mem))
    }
}

/// Result of a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub rets: Vec<u64>,
    pub steps: usize,
}

/// Executes HIR programs.
pub struct Interpreter<'p> {
    program: &'p Program,
    regs: [u64; 2 * NUM_REGS as usize],
    fuel: usize,
}

impl<'p> Interpreter<'p> {
    pub const DEFAULT_FUEL: usize = 1_000_000;

    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            regs: [0; 2 * NUM_REGS as usize],
            fuel: Self::DEFAULT_FUEL,
        }
    }

    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    fn slot(r: Reg) -> Option<usize> {
        if r.is_zero() || r.name() >= NUM_REGS {
            return None;
        }
        let base = match r.class() {
            RegClass::Int => 0,
            RegClass::Ptr => NUM_REGS as usize,
        };
        Some(base + r.name() as usize)
    }

    fn get(&self, r: Reg) -> u64 {
        Self::slot(r).map_or(0, |i| self.regs[i])
    }

    fn set(&mut self, r: Reg, v: u64) {
        if let Some(i) = Self::slot(r) {
            self.regs[i] = v;
        }
    }

    fn src(&self, s: Src) -> u64 {
        match s {
            Src::Reg(r) => self.get(r),
            Src::Imm(v) => v as u64,
        }
    }

    /// Run from the first instruction until `Ret`.
    pub fn run(
        mut self,
        args: &[u64],
        mem: &mut Memory,
        calls: &mut CallTable,
    ) -> Result<Outcome, ExecError> {
        let mut pc = 0usize;
        let mut steps = 0usize;
        loop {
            if steps >= self.fuel {
                return Err(ExecError::OutOfFuel { steps });
            }
            steps += 1;
            let ins = self.program.ins.get(pc).ok_or(ExecError::BadTarget { pos: pc })?;
            pc += 1;
            match ins {
                Instr::LoadArg { id, rd } => {
                    let v = *args.get(*id).ok_or(ExecError::MissingArgument { id: *id })?;
                    self.set(*rd, v);
                }
                Instr::IConst { v, rd } => self.set(*rd, *v as u64),
                Instr::PConst { p, pd, .. } => self.set(*pd, *p),
                Instr::Mov { rs, rd } => self.set(*rd, self.get(*rs)),
                Instr::Alu { op, x, y, rd } => {
                    let v = op.eval(self.get(*x) as i64, self.src(*y) as i64);
                    self.set(*rd, v as u64);
                }
                Instr::Unary { op, rs, rd } => self.set(*rd, op.eval(self.get(*rs) as i64) as u64),
                Instr::Bts { x, y, rt, rs } => {
                    let (xv, yv) = (self.get(*x), self.get(*y) & 63);
                    self.set(*rt, (xv >> yv) & 1);
                    self.set(*rs, xv | (1 << yv));
                }
                Instr::Lea { p, off, pd } => {
                    self.set(*pd, self.get(*p).wrapping_add(self.src(*off)));
                }
                Instr::Ld { p, off, size, rd } => {
                    let addr = self.get(*p).wrapping_add(*off as i64 as u64);
                    self.set(*rd, mem.read(addr, *size));
                }
                Instr::Lp { p, off, pd } => {
                    let addr = self.get(*p).wrapping_add(*off as i64 as u64);
                    self.set(*pd, mem.read(addr, 8));
                }
                Instr::St { r, p, off, size } => {
                    let addr = self.get(*p).wrapping_add(*off as i64 as u64);
                    mem.write(addr, *size, self.get(*r));
                }
                Instr::Sp { v, p, off, var, func } => {
                    let addr = self.get(*p).wrapping_add(*off as i64 as u64);
                    if mem.read(*var, 1) == 0 {
                        mem.write(addr, 8, self.get(*v));
                    } else {
                        calls.invoke(func.id, &[self.get(*v), addr], mem)?;
                    }
                }
                Instr::Call { func, args: input, rets } => {
                    let values: Vec<u64> = input.iter().map(|&r| self.get(r)).collect();
                    let out = calls.invoke(func.id, &values, mem)?;
                    for (r, v) in rets.iter().zip(out) {
                        self.set(*r, v);
                    }
                }
                Instr::Bzero { p, len } => mem.zero(self.get(*p), *len as u64),
                Instr::Bcopy { src, dst, len } => {
                    mem.copy(self.get(*dst), self.get(*src), self.get(*len));
                }
                Instr::Break => {}
                Instr::Br { cond, x, y, to } => {
                    if cond.holds(self.get(*x) as i64, self.src(*y) as i64) {
                        pc = *to;
                    }
                }
                Instr::Bsw { v, table, default } => {
                    let key = self.get(*v) as i64;
                    pc = table.iter().find(|(k, _)| *k == key).map_or(*default, |&(_, t)| t);
                }
                Instr::Jmp { to } => pc = *to,
                Instr::Ret { r } => {
                    let rets = r.iter().map(|&r| self.get(r)).collect();
                    return Ok(Outcome { rets, steps });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{Builder, Cond, P0, R0, R1, R2};

    #[test]
    fn test_memory_is_little_endian() {
        let mut mem = Memory::new();
        mem.write(0x100, 4, 0x11223344);
        assert_eq!(mem.read(0x100, 1), 0x44);
        assert_eq!(mem.read(0x102, 2), 0x1122);
        mem.copy(0x200, 0x100, 4);
        assert_eq!(mem.read(0x200, 8), 0x11223344);
        mem.zero(0x200, 2);
        assert_eq!(mem.read(0x200, 4), 0x11220000);
    }

    #[test]
    fn test_countdown_loop() {
        let mut b = Builder::new();
        let top = b.label();
        b.load_arg(0, R0);
        b.iconst(0, R1);
        b.bind(top);
        b.add(R1, R0, R1);
        b.sub(R0, 1, R0);
        b.br(Cond::Ne, R0, 0, top);
        b.ret(&[R1]);
        let prog = b.finish().unwrap();

        let out = Interpreter::new(&prog)
            .run(&[4], &mut Memory::new(), &mut CallTable::new())
            .unwrap();
        assert_eq!(out.rets, vec![10]);
    }

    #[test]
    fn test_loads_stores_and_calls() {
        let mut b = Builder::new();
        b.pconst(0x1000, false, P0);
        b.iconst(0x1234, R0);
        b.st(R0, P0, 8, 2);
        b.ld(P0, 8, 1, R1);
        b.call(crate::core::test_utils::extern_handle(7, 1, 1), &[R1], &[R2]);
        b.ret(&[R1, R2]);
        let prog = b.finish().unwrap();

        let mut calls = CallTable::new();
        calls.register(7, |args, _| vec![args[0] * 2]);
        let out = Interpreter::new(&prog).run(&[], &mut Memory::new(), &mut calls).unwrap();
        assert_eq!(out.rets, vec![0x34, 0x68]);
    }

    #[test]
    fn test_fuel_exhaustion() {
        let mut b = Builder::new();
        let top = b.label();
        b.bind(top);
        b.jmp(top);
        let prog = b.finish().unwrap();
        let err = Interpreter::new(&prog)
            .with_fuel(100)
            .run(&[], &mut Memory::new(), &mut CallTable::new())
            .unwrap_err();
        assert_eq!(err, ExecError::OutOfFuel { steps: 100 });
    }
}
