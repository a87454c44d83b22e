//! Virtual and physical register values.
//!
//! A [`Reg`] is a value, not storage. Before register allocation it names
//! "the i-th definition of an SSA value"; after allocation every surviving
//! register is of kind [`RegKind::Arch`] and names a hardware register.

use std::fmt;

/// Value class of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    /// Generic integer value.
    Int,
    /// Pointer value, visible to the garbage collector.
    Ptr,
}

/// Register namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegKind {
    /// The all-zero integer register or the nil pointer register.
    Zero,
    /// Registers named by the HIR program.
    Norm,
    /// The builder's temporary pool.
    Tmp,
    /// Values minted by passes.
    Gen,
    /// Hardware registers.
    Arch,
}

/// A register reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    kind: RegKind,
    class: RegClass,
    name: u32,
    index: u32,
}

/// The all-zero integer register.
pub const RZ: Reg = Reg::new(RegKind::Zero, RegClass::Int, 0);

/// The nil pointer register.
pub const PN: Reg = Reg::new(RegKind::Zero, RegClass::Ptr, 0);

const ARCH_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl Reg {
    pub const fn new(kind: RegKind, class: RegClass, name: u32) -> Self {
        Self { kind, class, name, index: 0 }
    }

    /// HIR integer register `%rN`.
    pub const fn norm_int(name: u32) -> Self {
        Self::new(RegKind::Norm, RegClass::Int, name)
    }

    /// HIR pointer register `%pN`.
    pub const fn norm_ptr(name: u32) -> Self {
        Self::new(RegKind::Norm, RegClass::Ptr, name)
    }

    /// Temporary pool register.
    pub const fn tmp(class: RegClass, name: u32) -> Self {
        Self::new(RegKind::Tmp, class, name)
    }

    /// Hardware register by encoding number. Physical registers carry no class.
    pub const fn arch(id: u8) -> Self {
        Self::new(RegKind::Arch, RegClass::Int, id as u32)
    }

    pub fn kind(self) -> RegKind {
        self.kind
    }

    pub fn class(self) -> RegClass {
        self.class
    }

    pub fn name(self) -> u32 {
        self.name
    }

    /// SSA version of this register (0 before SSA construction).
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn is_ptr(self) -> bool {
        self.class == RegClass::Ptr
    }

    pub fn is_zero(self) -> bool {
        self.kind == RegKind::Zero
    }

    pub fn is_arch(self) -> bool {
        self.kind == RegKind::Arch
    }

    /// Registers that take part in SSA renaming and allocation.
    pub fn is_virtual(self) -> bool {
        !matches!(self.kind, RegKind::Zero | RegKind::Arch)
    }

    /// Hardware encoding of an arch register.
    pub fn arch_id(self) -> Option<u8> {
        if self.is_arch() {
            Some(self.name as u8)
        } else {
            None
        }
    }

    /// The same register with another SSA version.
    pub fn derive(self, index: u32) -> Self {
        Self { index, ..self }
    }

    /// The pre-SSA identity of this register.
    pub fn base(self) -> Self {
        self.derive(0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = if self.is_ptr() { "p" } else { "" };
        match self.kind {
            RegKind::Zero if self.is_ptr() => return write!(f, "%nil"),
            RegKind::Zero => return write!(f, "%z"),
            RegKind::Arch => {
                return match ARCH_NAMES.get(self.name as usize) {
                    Some(name) => write!(f, "%{}", name),
                    None => write!(f, "%arch{}", self.name),
                }
            }
            RegKind::Norm if self.is_ptr() => write!(f, "%p{}", self.name)?,
            RegKind::Norm => write!(f, "%r{}", self.name)?,
            RegKind::Tmp => write!(f, "%t{}{}", p, self.name)?,
            RegKind::Gen => write!(f, "%v{}{}", p, self.name)?,
        }
        if self.index != 0 {
            write!(f, ".{}", self.index)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_display() {
        assert_eq!(RZ.to_string(), "%z");
        assert_eq!(PN.to_string(), "%nil");
        assert_eq!(Reg::norm_int(3).to_string(), "%r3");
        assert_eq!(Reg::norm_ptr(1).derive(4).to_string(), "%p1.4");
        assert_eq!(Reg::arch(7).to_string(), "%rdi");
        assert_eq!(Reg::tmp(RegClass::Ptr, 2).to_string(), "%tp2");
    }

    #[test]
    fn test_versions_share_base() {
        let r = Reg::norm_int(2);
        assert_ne!(r.derive(1), r.derive(2));
        assert_eq!(r.derive(1).base(), r.derive(2).base());
        assert!(r.is_virtual());
        assert!(!RZ.is_virtual());
        assert!(!Reg::arch(0).is_virtual());
        assert_eq!(Reg::arch(3).arch_id(), Some(3));
    }
}
