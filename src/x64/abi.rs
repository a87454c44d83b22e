// This module implements the System V AMD64 calling convention as far as the compiled
// serializer functions need it. Every argument and return value is a single general purpose
// value (an integer or a GC pointer): arguments go to RDI, RSI, RDX, RCX, R8, R9 and then to
// 8-byte stack slots of the incoming argument area, return values use RAX and RDX. The
// CCAssigner trait hands out these locations one value at a time, the SysVAssigner implements
// it, and AbiDescriptor is the resulting per-signature record consumed by ABI lowering (for
// the compiled function) and by call lowering (for every external function it calls).
// FunctionFrame collects the frame layout during register allocation (callee-saved registers
// the allocation touched, spill slot offsets, outgoing argument area) in the session arena,
// and FrameLayout is the owned summary handed to the assembler.

//! System V x86-64 calling convention.

use super::regs::{R8, R9, RAX, RCX, RDI, RDX, RSI};
use crate::core::{AsmReg, CompileError, CompileResult, RegClass};
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Where a parameter lives at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLoc {
    Register(AsmReg),
    /// Byte offset into the argument area.
    Stack(i32),
}

/// One argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Param {
    pub class: RegClass,
    pub loc: ParamLoc,
}

/// Locations of every argument and return value of one signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AbiDescriptor {
    pub args: Vec<Param>,
    pub rets: Vec<Param>,
}

impl AbiDescriptor {
    /// Lay out a signature with the System V rules.
    pub fn sysv(args: &[RegClass], rets: &[RegClass]) -> CompileResult<Self> {
        let mut assigner = SysVAssigner::new();
        let mut desc = AbiDescriptor::default();
        for &class in args {
            let mut a = CCAssignment::new(class);
            assigner.assign_arg(&mut a);
            desc.args.push(a.to_param()?);
        }
        for &class in rets {
            let mut a = CCAssignment::new(class);
            assigner.assign_ret(&mut a);
            if a.reg.is_none() {
                return Err(CompileError::Abi {
                    reason: format!("{} return values do not fit in RAX/RDX", rets.len()),
                });
            }
            desc.rets.push(a.to_param()?);
        }
        Ok(desc)
    }

    /// Size of the stack argument area this signature needs, 16-byte aligned.
    pub fn stack_size(&self) -> u32 {
        let end = self
            .args
            .iter()
            .filter_map(|p| match p.loc {
                ParamLoc::Stack(off) => Some(off as u32 + 8),
                ParamLoc::Register(_) => None,
            })
            .max()
            .unwrap_or(0);
        end.div_ceil(16) * 16
    }

    /// Registers holding arguments on entry.
    pub fn arg_registers(&self) -> Vec<AsmReg> {
        self.args
            .iter()
            .filter_map(|p| match p.loc {
                ParamLoc::Register(r) => Some(r),
                ParamLoc::Stack(_) => None,
            })
            .collect()
    }
}

/// Assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy)]
pub struct CCAssignment {
    pub class: RegClass,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Stack offset (if assigned to stack).
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(class: RegClass) -> Self {
        Self { class, reg: None, stack_off: None }
    }

    fn to_param(self) -> CompileResult<Param> {
        let loc = match (self.reg, self.stack_off) {
            (Some(r), _) => ParamLoc::Register(r),
            (None, Some(off)) => ParamLoc::Stack(off),
            (None, None) => {
                return Err(CompileError::Abi { reason: "value was assigned no location".into() })
            }
        };
        Ok(Param { class: self.class, loc })
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Leaves `arg.reg` empty when the value does not fit in return registers.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Total stack space needed for arguments, 16-byte aligned.
    fn get_stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    stack: u32,
    ret_gp_cnt: usize,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    /// Return value registers.
    pub const RET_GP_REGS: [AsmReg; 2] = [RAX, RDX];

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if self.gp_cnt < Self::GP_ARG_REGS.len() {
            arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
            self.gp_cnt += 1;
        } else {
            // Each stack slot is 8 bytes in System V
            arg.stack_off = Some(self.stack as i32);
            self.stack += 8;
        }
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        if self.ret_gp_cnt < Self::RET_GP_REGS.len() {
            arg.reg = Some(Self::RET_GP_REGS[self.ret_gp_cnt]);
            self.ret_gp_cnt += 1;
        }
    }

    fn get_stack_size(&self) -> u32 {
        self.stack.div_ceil(16) * 16
    }
}

/// Stack frame under construction, allocated in the session arena.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Callee-saved registers that need to be preserved.
    pub saved_registers: BumpVec<'a, AsmReg>,
    /// Frame offset of each spill slot, indexed by slot id.
    pub spill_slots: BumpVec<'a, i32>,
    /// Current spill slot offset.
    pub spill_offset: i32,
    /// Largest outgoing argument area of any call.
    pub outgoing_size: u32,
    /// Total size of the stack frame.
    pub frame_size: u32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            saved_registers: BumpVec::new_in(arena),
            spill_slots: BumpVec::new_in(arena),
            spill_offset: 0,
            outgoing_size: 0,
            frame_size: 0,
        }
    }

    /// Add a callee-saved register that needs preservation.
    pub fn add_saved_register(&mut self, reg: AsmReg) {
        if !self.saved_registers.contains(&reg) {
            self.saved_registers.push(reg);
        }
    }

    /// Allocate the next spill slot and return its offset below the frame pointer.
    pub fn allocate_spill_slot(&mut self) -> i32 {
        self.spill_offset -= 8;
        self.spill_slots.push(self.spill_offset);
        self.spill_offset
    }

    pub fn reserve_outgoing(&mut self, size: u32) {
        self.outgoing_size = self.outgoing_size.max(size);
    }

    /// Calculate the final frame size.
    pub fn calculate_frame_size(&mut self) {
        // Frame layout:
        // rbp + 16: incoming stack arguments
        // rbp + 8:  return address
        // rbp:      saved rbp
        // rbp - 8:  spill slots
        // below:    callee-saved registers, outgoing call arguments
        let saved_reg_size = self.saved_registers.len() as u32 * 8;
        let spill_size = (-self.spill_offset) as u32;
        let total_size = saved_reg_size + spill_size + self.outgoing_size;
        self.frame_size = total_size.div_ceil(16) * 16;
    }

    /// Owned copy of the final layout.
    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            saved_registers: self.saved_registers.iter().copied().collect(),
            spill_slots: self.spill_slots.iter().copied().collect(),
            outgoing_size: self.outgoing_size,
            frame_size: self.frame_size,
        }
    }
}

/// Final frame layout handed to the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameLayout {
    pub saved_registers: Vec<AsmReg>,
    pub spill_slots: Vec<i32>,
    pub outgoing_size: u32,
    pub frame_size: u32,
}
