//! Physical register identifiers and register sets.
//!
//! The allocator colors virtual registers with [`AsmReg`]s drawn from a
//! palette expressed as a [`RegBitSet`]. The same bit set type describes
//! call clobbers and the callee-saved registers a function touches.

use super::reg::Reg;
use std::fmt;

/// Number of general purpose registers on the target.
pub const NUM_GP_REGS: usize = 16;

/// Hardware register encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub id: u8,
}

impl AsmReg {
    pub const fn new(id: u8) -> Self {
        Self { id }
    }

    /// The register value naming this hardware register.
    pub const fn reg(self) -> Reg {
        Reg::arch(self.id)
    }

    /// Recover the hardware register from an arch register value.
    pub fn from_reg(reg: Reg) -> Option<Self> {
        reg.arch_id().map(Self::new)
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reg())
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RegBitSet {
    bits: u32,
}

impl RegBitSet {
    /// Create empty register set.
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Build a set from hardware encodings.
    pub const fn from_ids(ids: &[u8]) -> Self {
        let mut bits = 0u32;
        let mut i = 0;
        while i < ids.len() {
            bits |= 1 << ids[i];
            i += 1;
        }
        Self { bits }
    }

    /// Every general purpose register.
    pub const fn all() -> Self {
        Self { bits: (1 << NUM_GP_REGS) - 1 }
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (reg.id as usize) < NUM_GP_REGS && self.bits & (1 << reg.id) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.id as usize) < NUM_GP_REGS {
            self.bits |= 1 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.id as usize) < NUM_GP_REGS {
            self.bits &= !(1 << reg.id);
        }
    }

    /// Set union with another set.
    pub fn union(&self, other: &RegBitSet) -> RegBitSet {
        RegBitSet { bits: self.bits | other.bits }
    }

    /// Set difference with another set.
    pub fn without(&self, other: &RegBitSet) -> RegBitSet {
        RegBitSet { bits: self.bits & !other.bits }
    }

    pub fn intersect(&self, other: &RegBitSet) -> RegBitSet {
        RegBitSet { bits: self.bits & other.bits }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Registers in ascending encoding order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..NUM_GP_REGS as u8)
            .filter(move |&id| self.bits & (1 << id) != 0)
            .map(AsmReg::new)
    }
}

impl FromIterator<AsmReg> for RegBitSet {
    fn from_iter<I: IntoIterator<Item = AsmReg>>(iter: I) -> Self {
        let mut set = RegBitSet::new();
        for reg in iter {
            set.set(reg);
        }
        set
    }
}
