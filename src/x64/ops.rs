// This module defines the machine-specific instruction variants produced by target lowering.
// The generic IR only knows register-register operations; x86-64 additionally provides
// register-immediate and register-memory forms and a rich addressing mode
// (base + index * scale + displacement). Amd64Node captures exactly the forms the later
// stages need: address computation, zero-extending loads, stores of registers or immediates,
// three-address ALU operations whose second operand may be a register, an immediate or a
// memory reference, compares producing a 0/1 value, calls with an explicit clobber set, and
// fixed-offset accesses to the incoming and outgoing argument areas of the frame. The nodes
// implement the same Definitions/Usages capability traits as the generic IR so that liveness,
// renaming and allocation never need to special-case them.

//! Machine instruction forms for x86-64.

use crate::core::{Reg, RegBitSet};
use crate::ssa::ir::{BinaryOp, CallHandle, Definitions, Usages};
use std::fmt;

/// Memory operand `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg) -> Self {
        Self { base, index: None, scale: 1, disp: 0 }
    }

    fn regs_mut(&mut self) -> Vec<&mut Reg> {
        let mut out = vec![&mut self.base];
        if let Some(index) = &mut self.index {
            out.push(index);
        }
        out
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some(index) = self.index {
            write!(f, " + {}*{}", index, self.scale)?;
        }
        if self.disp != 0 {
            write!(f, " + {}", self.disp)?;
        }
        write!(f, "]")
    }
}

/// Source operand of an ALU or compare instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
    /// Zero-extended memory read of the given size.
    Mem(Mem, u8),
}

impl Operand {
    fn regs_mut(&mut self) -> Vec<&mut Reg> {
        match self {
            Operand::Reg(r) => vec![r],
            Operand::Imm(_) => Vec::new(),
            Operand::Mem(m, _) => m.regs_mut(),
        }
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(v) => write!(f, "${}", v),
            Operand::Mem(m, n) => write!(f, "u{} {}", n * 8, m),
        }
    }
}

/// Argument area addressed by stack loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackArea {
    /// Stack-passed arguments of the compiled function.
    Incoming,
    /// Stack-passed arguments of an outgoing call.
    Outgoing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Amd64Node {
    Lea { r: Reg, m: Mem },
    Load { r: Reg, m: Mem, n: u8 },
    Store { r: Reg, m: Mem, n: u8 },
    StoreImm { v: i32, m: Mem, n: u8 },
    /// `r = x op y`
    Alu { op: BinaryOp, r: Reg, x: Reg, y: Operand },
    /// `r = (x op y) ? 1 : 0`
    Cmp { op: BinaryOp, r: Reg, x: Operand, y: Operand },
    CallFunc { func: CallHandle, input: Vec<Reg>, output: Vec<Reg>, clobbers: RegBitSet },
    LoadStack { r: Reg, offset: i32, area: StackArea },
    StoreStack { r: Reg, offset: i32, area: StackArea },
}

impl Definitions for Amd64Node {
    fn definitions(&mut self) -> Vec<&mut Reg> {
        match self {
            Amd64Node::Lea { r, .. }
            | Amd64Node::Load { r, .. }
            | Amd64Node::Alu { r, .. }
            | Amd64Node::Cmp { r, .. }
            | Amd64Node::LoadStack { r, .. } => vec![r],
            Amd64Node::CallFunc { output, .. } => output.iter_mut().collect(),
            Amd64Node::Store { .. } | Amd64Node::StoreImm { .. } | Amd64Node::StoreStack { .. } => {
                Vec::new()
            }
        }
    }
}

impl Usages for Amd64Node {
    fn usages(&mut self) -> Vec<&mut Reg> {
        match self {
            Amd64Node::Lea { m, .. } | Amd64Node::Load { m, .. } | Amd64Node::StoreImm { m, .. } => {
                m.regs_mut()
            }
            Amd64Node::Store { r, m, .. } => {
                let mut out = vec![r];
                out.extend(m.regs_mut());
                out
            }
            Amd64Node::Alu { x, y, .. } => {
                let mut out = vec![x];
                out.extend(y.regs_mut());
                out
            }
            Amd64Node::Cmp { x, y, .. } => {
                let mut out = x.regs_mut();
                out.extend(y.regs_mut());
                out
            }
            Amd64Node::CallFunc { input, .. } => input.iter_mut().collect(),
            Amd64Node::StoreStack { r, .. } => vec![r],
            Amd64Node::LoadStack { .. } => Vec::new(),
        }
    }
}

impl Amd64Node {
    /// Registers destroyed by this instruction beyond its explicit outputs.
    pub fn clobbers(&self) -> RegBitSet {
        match self {
            Amd64Node::CallFunc { clobbers, .. } => *clobbers,
            _ => RegBitSet::new(),
        }
    }

    pub fn is_impure(&self) -> bool {
        matches!(
            self,
            Amd64Node::Store { .. }
                | Amd64Node::StoreImm { .. }
                | Amd64Node::CallFunc { .. }
                | Amd64Node::StoreStack { .. }
        )
    }

    pub fn is_movable(&self) -> bool {
        match self {
            Amd64Node::Lea { .. } => true,
            Amd64Node::Alu { y, .. } => !matches!(y, Operand::Mem(..)),
            Amd64Node::Cmp { x, y, .. } => {
                !matches!(x, Operand::Mem(..)) && !matches!(y, Operand::Mem(..))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Amd64Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amd64Node::Lea { r, m } => write!(f, "{} = lea {}", r, m),
            Amd64Node::Load { r, m, n } => write!(f, "{} = mov.u{} {}", r, n * 8, m),
            Amd64Node::Store { r, m, n } => write!(f, "mov.u{} {} -> {}", n * 8, r, m),
            Amd64Node::StoreImm { v, m, n } => write!(f, "mov.u{} ${} -> {}", n * 8, v, m),
            Amd64Node::Alu { op, r, x, y } => write!(f, "{} = {} {}, {}", r, op.mnemonic(), x, y),
            Amd64Node::Cmp { op, r, x, y } => write!(f, "{} = set.{} {}, {}", r, op.mnemonic(), x, y),
            Amd64Node::CallFunc { func, input, output, .. } => {
                write!(f, "{:?} = callq {}{:?}", output, func.name, input)
            }
            Amd64Node::LoadStack { r, offset, area } => {
                write!(f, "{} = stack.{:?}[{}]", r, area, offset)
            }
            Amd64Node::StoreStack { r, offset, area } => {
                write!(f, "stack.{:?}[{}] = {}", area, offset, r)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegClass;

    #[test]
    fn test_memory_operand_usages() {
        let base = Reg::tmp(RegClass::Ptr, 0);
        let index = Reg::tmp(RegClass::Int, 1);
        let r = Reg::norm_int(0);
        let mut node = Amd64Node::Cmp {
            op: BinaryOp::CmpEq,
            r,
            x: Operand::Mem(Mem { base, index: Some(index), scale: 1, disp: 8 }, 4),
            y: Operand::Imm(3),
        };
        let uses: Vec<Reg> = node.usages().into_iter().map(|r| *r).collect();
        assert_eq!(uses, vec![base, index]);
        assert!(!node.is_movable());
        assert_eq!(node.definitions().len(), 1);
    }

    #[test]
    fn test_store_forms_are_impure() {
        let m = Mem::base(Reg::norm_ptr(0));
        assert!(Amd64Node::StoreImm { v: 1, m, n: 8 }.is_impure());
        assert!(!Amd64Node::Lea { r: Reg::norm_ptr(1), m }.is_impure());
        assert_eq!(m.to_string(), "[%p0]");
    }
}
