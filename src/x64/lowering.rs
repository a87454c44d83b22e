//! Machine dependent lowering.
//!
//! Address computation, loads, stores and binary arithmetic are rewritten
//! into their x86-64 forms. Every operand is still a register here; fusion
//! and compaction later fold memory references and immediates into them.

use super::ops::{Amd64Node, Mem, Operand};
use crate::core::{CompileResult, Reg};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::IrNode;
use crate::ssa::Cfg;

pub struct MachineLowering;

impl Pass for MachineLowering {
    fn name(&self) -> &'static str {
        "Machine Dependent Lowering"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let mut lowered = 0;
        for block in cfg.blocks.values_mut() {
            for ins in &mut block.ins {
                if let Some(node) = lower(ins) {
                    *ins = IrNode::Machine(node);
                    lowered += 1;
                }
            }
        }
        log::trace!("lowered {} instructions", lowered);
        Ok(())
    }
}

/// Address `mem + off`, with a zero offset dropped.
fn address(mem: Reg, off: Reg) -> Mem {
    if off.is_zero() {
        Mem::base(mem)
    } else {
        Mem { base: mem, index: Some(off), scale: 1, disp: 0 }
    }
}

/// The machine form of `ins`, if it has one.
pub fn lower(ins: &IrNode) -> Option<Amd64Node> {
    let node = match *ins {
        IrNode::Lea { r, mem, off } => Amd64Node::Lea { r, m: address(mem, off) },
        IrNode::Load { r, mem, size } => Amd64Node::Load { r, m: Mem::base(mem), n: size },
        IrNode::Store { r, mem, size } => Amd64Node::Store { r, m: Mem::base(mem), n: size },
        IrNode::Binary { r, x, y, op } if op.is_compare() => Amd64Node::Cmp {
            op,
            r,
            x: Operand::Reg(x),
            y: Operand::Reg(y),
        },
        IrNode::Binary { r, x, y, op } => Amd64Node::Alu { op, r, x, y: Operand::Reg(y) },
        _ => return None,
    };
    Some(node)
}
