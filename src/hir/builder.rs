//! Label-resolving construction of HIR programs.
//!
//! Branches are emitted against symbolic [`Label`]s; [`Builder::finish`]
//! patches every reference with the bound instruction position.

use super::{Cond, Instr, Pos, Program, Src};
use crate::core::{CompileError, CompileResult, Reg};
use crate::ssa::ir::{BinaryOp, CallHandle, UnaryOp};

/// A branch target that has not been placed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Incremental program builder.
#[derive(Debug, Default)]
pub struct Builder {
    ins: Vec<Instr>,
    labels: Vec<Option<Pos>>,
    /// Instruction positions whose targets hold label ids.
    fixups: Vec<Pos>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.ins.len());
        self
    }

    /// Position of the next emitted instruction.
    pub fn here(&self) -> Pos {
        self.ins.len()
    }

    pub fn emit(&mut self, ins: Instr) -> &mut Self {
        self.ins.push(ins);
        self
    }

    pub fn load_arg(&mut self, id: usize, rd: Reg) -> &mut Self {
        self.emit(Instr::LoadArg { id, rd })
    }

    pub fn iconst(&mut self, v: i64, rd: Reg) -> &mut Self {
        self.emit(Instr::IConst { v, rd })
    }

    pub fn pconst(&mut self, p: u64, constant: bool, pd: Reg) -> &mut Self {
        self.emit(Instr::PConst { p, constant, pd })
    }

    pub fn mov(&mut self, rs: Reg, rd: Reg) -> &mut Self {
        self.emit(Instr::Mov { rs, rd })
    }

    pub fn alu(&mut self, op: BinaryOp, x: Reg, y: impl Into<Src>, rd: Reg) -> &mut Self {
        self.emit(Instr::Alu { op, x, y: y.into(), rd })
    }

    pub fn add(&mut self, x: Reg, y: impl Into<Src>, rd: Reg) -> &mut Self {
        self.alu(BinaryOp::Add, x, y, rd)
    }

    pub fn sub(&mut self, x: Reg, y: impl Into<Src>, rd: Reg) -> &mut Self {
        self.alu(BinaryOp::Sub, x, y, rd)
    }

    pub fn unary(&mut self, op: UnaryOp, rs: Reg, rd: Reg) -> &mut Self {
        self.emit(Instr::Unary { op, rs, rd })
    }

    pub fn bts(&mut self, x: Reg, y: Reg, rt: Reg, rs: Reg) -> &mut Self {
        self.emit(Instr::Bts { x, y, rt, rs })
    }

    pub fn lea(&mut self, p: Reg, off: impl Into<Src>, pd: Reg) -> &mut Self {
        self.emit(Instr::Lea { p, off: off.into(), pd })
    }

    pub fn ld(&mut self, p: Reg, off: i32, size: u8, rd: Reg) -> &mut Self {
        self.emit(Instr::Ld { p, off, size, rd })
    }

    pub fn lp(&mut self, p: Reg, off: i32, pd: Reg) -> &mut Self {
        self.emit(Instr::Lp { p, off, pd })
    }

    pub fn st(&mut self, r: Reg, p: Reg, off: i32, size: u8) -> &mut Self {
        self.emit(Instr::St { r, p, off, size })
    }

    pub fn sp(&mut self, v: Reg, p: Reg, off: i32, var: u64, func: CallHandle) -> &mut Self {
        self.emit(Instr::Sp { v, p, off, var, func })
    }

    pub fn call(&mut self, func: CallHandle, args: &[Reg], rets: &[Reg]) -> &mut Self {
        self.emit(Instr::Call { func, args: args.to_vec(), rets: rets.to_vec() })
    }

    pub fn bzero(&mut self, p: Reg, len: usize) -> &mut Self {
        self.emit(Instr::Bzero { p, len })
    }

    pub fn bcopy(&mut self, src: Reg, dst: Reg, len: Reg) -> &mut Self {
        self.emit(Instr::Bcopy { src, dst, len })
    }

    pub fn brk(&mut self) -> &mut Self {
        self.emit(Instr::Break)
    }

    pub fn br(&mut self, cond: Cond, x: Reg, y: impl Into<Src>, to: Label) -> &mut Self {
        self.fixups.push(self.ins.len());
        self.emit(Instr::Br { cond, x, y: y.into(), to: to.0 })
    }

    pub fn bsw(&mut self, v: Reg, table: &[(i64, Label)], default: Label) -> &mut Self {
        self.fixups.push(self.ins.len());
        let table = table.iter().map(|&(k, l)| (k, l.0)).collect();
        self.emit(Instr::Bsw { v, table, default: default.0 })
    }

    pub fn jmp(&mut self, to: Label) -> &mut Self {
        self.fixups.push(self.ins.len());
        self.emit(Instr::Jmp { to: to.0 })
    }

    pub fn ret(&mut self, r: &[Reg]) -> &mut Self {
        self.emit(Instr::Ret { r: r.to_vec() })
    }

    /// Resolve labels and return the program.
    pub fn finish(self) -> CompileResult<Program> {
        let Builder { mut ins, labels, fixups } = self;
        let resolve = |at: Pos, label: usize| -> CompileResult<Pos> {
            labels
                .get(label)
                .copied()
                .flatten()
                .ok_or_else(|| CompileError::malformed(at, format!("label {} is never bound", label)))
        };
        for at in fixups {
            match &mut ins[at] {
                Instr::Br { to, .. } | Instr::Jmp { to } => *to = resolve(at, *to)?,
                Instr::Bsw { table, default, .. } => {
                    for (_, t) in table.iter_mut() {
                        *t = resolve(at, *t)?;
                    }
                    *default = resolve(at, *default)?;
                }
                _ => return Err(CompileError::internal("fixup on a non-branch instruction")),
            }
        }
        Ok(Program::new(ins))
    }
}
