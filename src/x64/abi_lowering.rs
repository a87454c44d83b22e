// This module materializes the calling convention. The root block gains a single Entry
// pseudo-instruction defining the registers that carry arguments, immediately followed by
// copies of those registers into fresh virtual registers, so the physical registers are free
// again before anything else runs. LoadArg then becomes a copy of such a register, or a load
// from the incoming stack argument area for stack-passed arguments. Calls are expanded into
// stores to the outgoing area and copies into argument registers, a CallFunc that clobbers
// every caller-saved register, and copies out of the return registers. Returns copy their
// values into the return registers of the compiled function's own signature.

//! ABI-specific lowering.

use super::abi::{AbiDescriptor, ParamLoc};
use super::ops::{Amd64Node, StackArea};
use super::regs::CALLER_SAVED;
use crate::core::{CompileError, CompileResult, Reg};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{CallHandle, IrNode, Terminator};
use crate::ssa::Cfg;
use std::collections::HashMap;

pub struct AbiLowering;

impl Pass for AbiLowering {
    fn name(&self) -> &'static str {
        "ABI-Specific Lowering"
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        lower_abi(cfg, ctx.abi)
    }
}

fn abi_error(reason: impl Into<String>) -> CompileError {
    CompileError::Abi { reason: reason.into() }
}

/// Instructions performing `func(input) -> output`.
fn lower_call(func: CallHandle, input: Vec<Reg>, output: Vec<Reg>) -> CompileResult<Vec<IrNode>> {
    let abi = func.abi.clone();
    if abi.args.len() != input.len() || abi.rets.len() != output.len() {
        return Err(abi_error(format!("call to {} does not match its signature", func.name)));
    }
    let mut out = Vec::with_capacity(input.len() + output.len() + 1);
    let mut arg_regs = Vec::new();
    for (&v, param) in input.iter().zip(&abi.args) {
        match param.loc {
            ParamLoc::Stack(offset) => out.push(IrNode::Machine(Amd64Node::StoreStack {
                r: v,
                offset,
                area: StackArea::Outgoing,
            })),
            ParamLoc::Register(a) => {
                out.push(IrNode::Copy { r: a.reg(), v });
                arg_regs.push(a.reg());
            }
        }
    }
    let mut ret_regs = Vec::new();
    for param in &abi.rets {
        match param.loc {
            ParamLoc::Register(a) => ret_regs.push(a.reg()),
            ParamLoc::Stack(_) => {
                return Err(abi_error(format!("{} returns a value on the stack", func.name)))
            }
        }
    }
    out.push(IrNode::Machine(Amd64Node::CallFunc {
        func,
        input: arg_regs,
        output: ret_regs.clone(),
        clobbers: CALLER_SAVED,
    }));
    for (r, a) in output.into_iter().zip(ret_regs) {
        if !r.is_zero() {
            out.push(IrNode::Copy { r, v: a });
        }
    }
    Ok(out)
}

/// Rewrite arguments, calls and returns of `cfg` for `abi`.
pub fn lower_abi(cfg: &mut Cfg, abi: &AbiDescriptor) -> CompileResult<()> {
    let mut entry = Vec::new();
    let mut prologue = Vec::new();
    let mut arg_copies: HashMap<usize, Reg> = HashMap::new();
    for (id, param) in abi.args.iter().enumerate() {
        if let ParamLoc::Register(a) = param.loc {
            let v = cfg.create_register(param.class);
            entry.push(a.reg());
            prologue.push(IrNode::Copy { r: v, v: a.reg() });
            arg_copies.insert(id, v);
        }
    }
    let mut ret_regs = Vec::with_capacity(abi.rets.len());
    for param in &abi.rets {
        match param.loc {
            ParamLoc::Register(a) => ret_regs.push(a.reg()),
            ParamLoc::Stack(_) => return Err(abi_error("stack return values are not supported")),
        }
    }

    for block in cfg.blocks.values_mut() {
        let old = std::mem::take(&mut block.ins);
        let mut ins = Vec::with_capacity(old.len());
        for node in old {
            match node {
                IrNode::LoadArg { r, id } => {
                    let param = abi
                        .args
                        .get(id)
                        .ok_or_else(|| abi_error(format!("argument #{} is not in the signature", id)))?;
                    match param.loc {
                        ParamLoc::Register(_) => {
                            let v = arg_copies
                                .get(&id)
                                .copied()
                                .ok_or_else(|| CompileError::internal("argument register not copied"))?;
                            ins.push(IrNode::Copy { r, v });
                        }
                        ParamLoc::Stack(offset) => ins.push(IrNode::Machine(Amd64Node::LoadStack {
                            r,
                            offset,
                            area: StackArea::Incoming,
                        })),
                    }
                }
                IrNode::Call { func, input, output } => ins.extend(lower_call(func, input, output)?),
                other => ins.push(other),
            }
        }
        if let Terminator::Return { r } = &block.term {
            if r.len() != ret_regs.len() {
                return Err(abi_error(format!(
                    "{} returns {} values, the signature has {}",
                    block.id,
                    r.len(),
                    ret_regs.len()
                )));
            }
            for (&v, &a) in r.iter().zip(&ret_regs) {
                ins.push(IrNode::Copy { r: a, v });
            }
            block.term = Terminator::Return { r: ret_regs.clone() };
        }
        block.ins = ins;
    }

    let root = cfg.block_mut(cfg.root)?;
    let mut head = vec![IrNode::Entry { r: entry }];
    head.extend(prologue);
    head.append(&mut root.ins);
    root.ins = head;
    Ok(())
}
