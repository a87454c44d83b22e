//! x86-64 general purpose registers and the register sets the System V ABI defines.

use crate::core::{AsmReg, RegBitSet};

pub const RAX: AsmReg = AsmReg::new(0);
pub const RCX: AsmReg = AsmReg::new(1);
pub const RDX: AsmReg = AsmReg::new(2);
pub const RBX: AsmReg = AsmReg::new(3);
pub const RSP: AsmReg = AsmReg::new(4);
pub const RBP: AsmReg = AsmReg::new(5);
pub const RSI: AsmReg = AsmReg::new(6);
pub const RDI: AsmReg = AsmReg::new(7);
pub const R8: AsmReg = AsmReg::new(8);
pub const R9: AsmReg = AsmReg::new(9);
pub const R10: AsmReg = AsmReg::new(10);
pub const R11: AsmReg = AsmReg::new(11);
pub const R12: AsmReg = AsmReg::new(12);
pub const R13: AsmReg = AsmReg::new(13);
pub const R14: AsmReg = AsmReg::new(14);
pub const R15: AsmReg = AsmReg::new(15);

/// Stack and frame pointer; never allocatable.
pub const RESERVED: RegBitSet = RegBitSet::from_ids(&[4, 5]);

/// Registers a call may clobber.
pub const CALLER_SAVED: RegBitSet = RegBitSet::from_ids(&[0, 1, 2, 6, 7, 8, 9, 10, 11]);

/// Registers a function must preserve.
pub const CALLEE_SAVED: RegBitSet = RegBitSet::from_ids(&[3, 12, 13, 14, 15]);

/// Every register the allocator may hand out unless the options restrict it.
pub fn default_palette() -> RegBitSet {
    RegBitSet::all().without(&RESERVED)
}
