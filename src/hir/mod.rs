// This module defines HIR, the architecture-neutral input language of the backend. A program
// is a flat instruction stream over sixteen named registers (eight integer registers R0..R7
// and eight pointer registers P0..P7) plus the two zero registers. Branch instructions refer
// to their targets by position in the stream, so a program is self-contained and the CFG
// builder never resolves names. The Builder assigns those positions from symbolic labels,
// and the reference interpreter in `interp` gives the language its meaning; the end-to-end
// tests compile a program and compare the emulated machine code against it.

//! The high-level input IR.

pub mod builder;
pub mod interp;

pub use builder::{Builder, Label};
pub use interp::{CallTable, ExecError, Interpreter, Memory, Outcome};

use crate::core::{Reg, PN, RZ};
use crate::ssa::ir::{BinaryOp, CallHandle, UnaryOp};

pub const R0: Reg = Reg::norm_int(0);
pub const R1: Reg = Reg::norm_int(1);
pub const R2: Reg = Reg::norm_int(2);
pub const R3: Reg = Reg::norm_int(3);
pub const R4: Reg = Reg::norm_int(4);
pub const R5: Reg = Reg::norm_int(5);
pub const R6: Reg = Reg::norm_int(6);
pub const R7: Reg = Reg::norm_int(7);
pub const P0: Reg = Reg::norm_ptr(0);
pub const P1: Reg = Reg::norm_ptr(1);
pub const P2: Reg = Reg::norm_ptr(2);
pub const P3: Reg = Reg::norm_ptr(3);
pub const P4: Reg = Reg::norm_ptr(4);
pub const P5: Reg = Reg::norm_ptr(5);
pub const P6: Reg = Reg::norm_ptr(6);
pub const P7: Reg = Reg::norm_ptr(7);
pub const Z: Reg = RZ;
pub const NIL: Reg = PN;

/// Number of named registers per class.
pub const NUM_REGS: u32 = 8;

/// Branch condition of a two-way branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Gt,
    Ltu,
    Geu,
}

impl Cond {
    /// Compare operator and whether the operands must be swapped.
    pub fn compare_op(self) -> (BinaryOp, bool) {
        match self {
            Cond::Eq => (BinaryOp::CmpEq, false),
            Cond::Ne => (BinaryOp::CmpNe, false),
            Cond::Lt => (BinaryOp::CmpLt, false),
            Cond::Gt => (BinaryOp::CmpLt, true),
            Cond::Ltu => (BinaryOp::CmpLtu, false),
            Cond::Geu => (BinaryOp::CmpGeu, false),
        }
    }

    pub fn holds(self, x: i64, y: i64) -> bool {
        let (op, swap) = self.compare_op();
        let (a, b) = if swap { (y, x) } else { (x, y) };
        op.eval(a, b) != 0
    }
}

/// A register or an immediate operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Src {
    Reg(Reg),
    Imm(i64),
}

impl From<Reg> for Src {
    fn from(r: Reg) -> Self {
        Src::Reg(r)
    }
}

impl From<i64> for Src {
    fn from(v: i64) -> Self {
        Src::Imm(v)
    }
}

/// Position of an instruction in a program.
pub type Pos = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    LoadArg { id: usize, rd: Reg },
    IConst { v: i64, rd: Reg },
    /// Known pointer; `constant` marks the pointee as immutable.
    PConst { p: u64, constant: bool, pd: Reg },
    Mov { rs: Reg, rd: Reg },
    Alu { op: BinaryOp, x: Reg, y: Src, rd: Reg },
    Unary { op: UnaryOp, rs: Reg, rd: Reg },
    /// `rt = (x >> y) & 1; rs = x | (1 << y)`
    Bts { x: Reg, y: Reg, rt: Reg, rs: Reg },
    /// `pd = p + off`
    Lea { p: Reg, off: Src, pd: Reg },
    Ld { p: Reg, off: i32, size: u8, rd: Reg },
    Lp { p: Reg, off: i32, pd: Reg },
    St { r: Reg, p: Reg, off: i32, size: u8 },
    /// Pointer store through the GC write barrier.
    Sp { v: Reg, p: Reg, off: i32, var: u64, func: CallHandle },
    Call { func: CallHandle, args: Vec<Reg>, rets: Vec<Reg> },
    Bzero { p: Reg, len: usize },
    Bcopy { src: Reg, dst: Reg, len: Reg },
    Break,
    Br { cond: Cond, x: Reg, y: Src, to: Pos },
    /// Jump to the target paired with the value of `v`, or to `default`.
    Bsw { v: Reg, table: Vec<(i64, Pos)>, default: Pos },
    Jmp { to: Pos },
    Ret { r: Vec<Reg> },
}

impl Instr {
    /// Ends a basic block.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Instr::Br { .. } | Instr::Bsw { .. } | Instr::Jmp { .. } | Instr::Ret { .. }
        )
    }

    /// Every explicit branch target.
    pub fn targets(&self) -> Vec<Pos> {
        match self {
            Instr::Br { to, .. } | Instr::Jmp { to } => vec![*to],
            Instr::Bsw { table, default, .. } => {
                table.iter().map(|&(_, t)| t).chain(std::iter::once(*default)).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// An HIR program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub ins: Vec<Instr>,
}

impl Program {
    pub fn new(ins: Vec<Instr>) -> Self {
        Self { ins }
    }

    pub fn len(&self) -> usize {
        self.ins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_semantics() {
        assert!(Cond::Gt.holds(5, 3));
        assert!(!Cond::Gt.holds(3, 3));
        assert!(Cond::Ltu.holds(1, -1));
        assert!(!Cond::Lt.holds(1, -1));
        assert!(Cond::Geu.holds(-1, 1));
    }

    #[test]
    fn test_branch_targets() {
        let sw = Instr::Bsw { v: R0, table: vec![(0, 3), (4, 5)], default: 7 };
        assert_eq!(sw.targets(), vec![3, 5, 7]);
        assert!(sw.is_branch());
        assert!(!Instr::Break.is_branch());
    }
}
