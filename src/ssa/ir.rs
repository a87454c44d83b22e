// This module defines the instruction model every pass operates on. IrNode is a closed,
// tagged set of operations: literal loads, copies, argument loads, address computation,
// memory loads and stores, unary and binary arithmetic, bit-test-and-set, external calls,
// write-barrier placeholders, block zero/copy, breakpoints, the ABI entry pseudo-instruction,
// spill traffic and the machine-specific variants produced by lowering. Capability traits
// (Definitions, Usages) expose mutable references to the registers an instruction defines
// and reads, so passes rename values without matching on every variant; is_impure and
// is_movable tell dead code elimination and scheduling what they may delete or move.
// Blocks end in exactly one Terminator (an indexed switch or a return) and carry a manually
// maintained predecessor list plus the phi nodes that exist while the CFG is in SSA form.

//! Instructions, terminators and basic blocks.

use crate::core::{Reg, RegBitSet};
use crate::x64::abi::AbiDescriptor;
use crate::x64::ops::Amd64Node;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Unique basic block identifier within one CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb_{}", self.0)
    }
}

/// How far a known pointer value can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constness {
    /// Points to memory that never changes; loads through it may be folded.
    Const,
    /// The address is known but the pointee may change.
    Volatile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Not,
    Swap16,
    Swap32,
    Swap64,
    Sext32,
}

impl UnaryOp {
    pub fn eval(self, v: i64) -> i64 {
        match self {
            UnaryOp::Negate => v.wrapping_neg(),
            UnaryOp::Not => !v,
            UnaryOp::Swap16 => (v as u16).swap_bytes() as i64,
            UnaryOp::Swap32 => (v as u32).swap_bytes() as i64,
            UnaryOp::Swap64 => v.swap_bytes(),
            UnaryOp::Sext32 => v as i32 as i64,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Negate => "neg",
            UnaryOp::Not => "not",
            UnaryOp::Swap16 => "bswap16",
            UnaryOp::Swap32 => "bswap32",
            UnaryOp::Swap64 => "bswap64",
            UnaryOp::Sext32 => "sx32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLtu,
    CmpGeu,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
                | BinaryOp::CmpEq
                | BinaryOp::CmpNe
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            BinaryOp::CmpEq | BinaryOp::CmpNe | BinaryOp::CmpLt | BinaryOp::CmpLtu | BinaryOp::CmpGeu
        )
    }

    /// Evaluate with x86-64 semantics: wrapping arithmetic, shift counts masked to 6 bits.
    pub fn eval(self, x: i64, y: i64) -> i64 {
        match self {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::And => x & y,
            BinaryOp::Or => x | y,
            BinaryOp::Xor => x ^ y,
            BinaryOp::Shl => x.wrapping_shl((y & 63) as u32),
            BinaryOp::Shr => ((x as u64) >> (y & 63)) as i64,
            BinaryOp::Sar => x >> (y & 63),
            BinaryOp::CmpEq => (x == y) as i64,
            BinaryOp::CmpNe => (x != y) as i64,
            BinaryOp::CmpLt => (x < y) as i64,
            BinaryOp::CmpLtu => ((x as u64) < (y as u64)) as i64,
            BinaryOp::CmpGeu => ((x as u64) >= (y as u64)) as i64,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::Sar => "sar",
            BinaryOp::CmpEq => "cmp.eq",
            BinaryOp::CmpNe => "cmp.ne",
            BinaryOp::CmpLt => "cmp.lt",
            BinaryOp::CmpLtu => "cmp.ltu",
            BinaryOp::CmpGeu => "cmp.geu",
        }
    }
}

/// Handle of an external function the compiled code calls.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub id: usize,
    pub name: String,
    pub abi: Arc<AbiDescriptor>,
}

impl CallHandle {
    pub fn new(id: usize, name: impl Into<String>, abi: AbiDescriptor) -> Self {
        Self { id, name: name.into(), abi: Arc::new(abi) }
    }
}

impl PartialEq for CallHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CallHandle {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpillOp {
    Store,
    Reload,
}

/// A numbered stack slot holding a spilled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub id: u32,
    /// Whether the slot holds pointer values (reported to the GC stack map).
    pub ptr: bool,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}{}", self.id, if self.ptr { "(ptr)" } else { "" })
    }
}

/// A single instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum IrNode {
    Nop,
    ConstInt { r: Reg, v: i64 },
    ConstPtr { r: Reg, p: u64, m: Constness },
    Copy { r: Reg, v: Reg },
    LoadArg { r: Reg, id: usize },
    /// `r = mem + off`
    Lea { r: Reg, mem: Reg, off: Reg },
    /// Zero-extending load of `size` bytes.
    Load { r: Reg, mem: Reg, size: u8 },
    Store { r: Reg, mem: Reg, size: u8 },
    Unary { r: Reg, v: Reg, op: UnaryOp },
    Binary { r: Reg, x: Reg, y: Reg, op: BinaryOp },
    /// `t = (x >> y) & 1; s = x | (1 << y)`
    BitTestSet { t: Reg, s: Reg, x: Reg, y: Reg },
    Call { func: CallHandle, input: Vec<Reg>, output: Vec<Reg> },
    /// Store of pointer `r` to `*mem` that must go through the GC write barrier.
    WriteBarrier { r: Reg, mem: Reg, var: u64, func: CallHandle },
    BlockZero { mem: Reg, len: usize },
    BlockCopy { mem: Reg, src: Reg, len: Reg },
    Breakpoint,
    /// Function entry; defines the physical registers that are live-in.
    Entry { r: Vec<Reg> },
    Spill { op: SpillOp, r: Reg, slot: Slot },
    Machine(Amd64Node),
}

/// Registers written by an instruction.
pub trait Definitions {
    fn definitions(&mut self) -> Vec<&mut Reg>;
}

/// Registers read by an instruction.
pub trait Usages {
    fn usages(&mut self) -> Vec<&mut Reg>;
}

impl Definitions for IrNode {
    fn definitions(&mut self) -> Vec<&mut Reg> {
        let defs: Vec<&mut Reg> = match self {
            IrNode::ConstInt { r, .. }
            | IrNode::ConstPtr { r, .. }
            | IrNode::Copy { r, .. }
            | IrNode::LoadArg { r, .. }
            | IrNode::Lea { r, .. }
            | IrNode::Load { r, .. }
            | IrNode::Unary { r, .. }
            | IrNode::Binary { r, .. } => vec![r],
            IrNode::Spill { op: SpillOp::Reload, r, .. } => vec![r],
            IrNode::BitTestSet { t, s, .. } => vec![t, s],
            IrNode::Call { output, .. } => output.iter_mut().collect(),
            IrNode::Entry { r } => r.iter_mut().collect(),
            IrNode::Machine(m) => m.definitions(),
            IrNode::Nop
            | IrNode::Store { .. }
            | IrNode::WriteBarrier { .. }
            | IrNode::BlockZero { .. }
            | IrNode::BlockCopy { .. }
            | IrNode::Breakpoint
            | IrNode::Spill { .. } => Vec::new(),
        };
        defs.into_iter().filter(|r| !r.is_zero()).collect()
    }
}

impl Usages for IrNode {
    fn usages(&mut self) -> Vec<&mut Reg> {
        match self {
            IrNode::Copy { v, .. } | IrNode::Unary { v, .. } => vec![v],
            IrNode::Lea { mem, off, .. } => vec![mem, off],
            IrNode::Load { mem, .. } => vec![mem],
            IrNode::Store { r, mem, .. } => vec![r, mem],
            IrNode::Binary { x, y, .. } | IrNode::BitTestSet { x, y, .. } => vec![x, y],
            IrNode::Call { input, .. } => input.iter_mut().collect(),
            IrNode::WriteBarrier { r, mem, .. } => vec![r, mem],
            IrNode::BlockZero { mem, .. } => vec![mem],
            IrNode::BlockCopy { mem, src, len } => vec![mem, src, len],
            IrNode::Spill { op: SpillOp::Store, r, .. } => vec![r],
            IrNode::Machine(m) => m.usages(),
            IrNode::Nop
            | IrNode::ConstInt { .. }
            | IrNode::ConstPtr { .. }
            | IrNode::LoadArg { .. }
            | IrNode::Breakpoint
            | IrNode::Entry { .. }
            | IrNode::Spill { .. } => Vec::new(),
        }
    }
}

impl IrNode {
    /// Non-zero registers defined by this instruction.
    pub fn defs(&self) -> Vec<Reg> {
        let mut node = self.clone();
        node.definitions().into_iter().map(|r| *r).collect()
    }

    /// Registers read by this instruction, including zero registers.
    pub fn uses(&self) -> Vec<Reg> {
        let mut node = self.clone();
        node.usages().into_iter().map(|r| *r).collect()
    }

    /// Replace every use of `from` with `to`.
    pub fn replace_use(&mut self, from: Reg, to: Reg) -> bool {
        let mut changed = false;
        for r in self.usages() {
            if *r == from {
                *r = to;
                changed = true;
            }
        }
        changed
    }

    /// Must survive dead code elimination.
    pub fn is_impure(&self) -> bool {
        match self {
            IrNode::Store { .. }
            | IrNode::Call { .. }
            | IrNode::WriteBarrier { .. }
            | IrNode::BlockZero { .. }
            | IrNode::BlockCopy { .. }
            | IrNode::Breakpoint
            | IrNode::Entry { .. }
            | IrNode::Spill { op: SpillOp::Store, .. } => true,
            IrNode::Machine(m) => m.is_impure(),
            _ => false,
        }
    }

    /// May be reordered relative to other instructions.
    pub fn is_movable(&self) -> bool {
        match self {
            IrNode::ConstInt { .. }
            | IrNode::ConstPtr { .. }
            | IrNode::Copy { .. }
            | IrNode::Lea { .. }
            | IrNode::Unary { .. }
            | IrNode::Binary { .. }
            | IrNode::BitTestSet { .. } => true,
            IrNode::Machine(m) => m.is_movable(),
            _ => false,
        }
    }

    /// The single register this instruction defines, if it defines exactly one.
    pub fn single_def(&self) -> Option<Reg> {
        let defs = self.defs();
        match defs.as_slice() {
            [r] => Some(*r),
            _ => None,
        }
    }
}

/// SSA phi node.
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub r: Reg,
    /// Incoming value per predecessor block.
    pub v: BTreeMap<BlockId, Reg>,
}

impl Definitions for Phi {
    fn definitions(&mut self) -> Vec<&mut Reg> {
        vec![&mut self.r]
    }
}

impl Usages for Phi {
    fn usages(&mut self) -> Vec<&mut Reg> {
        self.v.values_mut().collect()
    }
}

/// Static branch prediction hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Likeliness {
    Likely,
    Unknown,
    Unlikely,
}

/// A switch edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub to: BlockId,
    pub likeliness: Likeliness,
}

impl Target {
    pub fn new(to: BlockId) -> Self {
        Self { to, likeliness: Likeliness::Unknown }
    }

    pub fn with_likeliness(to: BlockId, likeliness: Likeliness) -> Self {
        Self { to, likeliness }
    }
}

/// Indexed switch: jumps to `br[v]` if present, otherwise to `ln`.
#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    pub v: Reg,
    pub ln: Target,
    pub br: BTreeMap<i64, Target>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Switch(Switch),
    Return { r: Vec<Reg> },
}

impl Terminator {
    /// Unconditional jump.
    pub fn jump(to: BlockId) -> Self {
        Terminator::Switch(Switch {
            v: crate::core::RZ,
            ln: Target::new(to),
            br: BTreeMap::new(),
        })
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Terminator::Return { .. })
    }

    /// The target of an unconditional jump.
    pub fn jump_target(&self) -> Option<BlockId> {
        match self {
            Terminator::Switch(sw) if sw.br.is_empty() => Some(sw.ln.to),
            _ => None,
        }
    }

    /// Distinct successors: the default target first, then branches by key.
    pub fn successors(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        if let Terminator::Switch(sw) = self {
            out.push(sw.ln.to);
            for t in sw.br.values() {
                if !out.contains(&t.to) {
                    out.push(t.to);
                }
            }
        }
        out
    }

    /// All switch edges, default first.
    pub fn targets(&self) -> Vec<Target> {
        match self {
            Terminator::Switch(sw) => std::iter::once(sw.ln).chain(sw.br.values().copied()).collect(),
            Terminator::Return { .. } => Vec::new(),
        }
    }

    /// Redirect every edge to `old` towards `new`.
    pub fn replace_successor(&mut self, old: BlockId, new: BlockId) {
        if let Terminator::Switch(sw) = self {
            if sw.ln.to == old {
                sw.ln.to = new;
            }
            for t in sw.br.values_mut() {
                if t.to == old {
                    t.to = new;
                }
            }
        }
    }
}

impl Usages for Terminator {
    fn usages(&mut self) -> Vec<&mut Reg> {
        match self {
            Terminator::Switch(sw) if sw.br.is_empty() => Vec::new(),
            Terminator::Switch(sw) => vec![&mut sw.v],
            Terminator::Return { r } => r.iter_mut().collect(),
        }
    }
}

impl Terminator {
    pub fn uses(&self) -> Vec<Reg> {
        let mut term = self.clone();
        term.usages().into_iter().map(|r| *r).collect()
    }
}

/// A basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub phi: Vec<Phi>,
    pub ins: Vec<IrNode>,
    pub term: Terminator,
    /// Exact mirror of the blocks whose terminator targets this block.
    pub pred: Vec<BlockId>,
}

impl BasicBlock {
    pub fn new(id: BlockId, term: Terminator) -> Self {
        Self {
            id,
            phi: Vec::new(),
            ins: Vec::new(),
            term,
            pred: Vec::new(),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.term.successors()
    }

    pub fn add_pred(&mut self, p: BlockId) {
        if !self.pred.contains(&p) {
            self.pred.push(p);
        }
    }

    /// Forget predecessor `p` and its phi operands.
    pub fn remove_pred(&mut self, p: BlockId) {
        self.pred.retain(|&b| b != p);
        for phi in &mut self.phi {
            phi.v.remove(&p);
        }
    }

    /// Rename predecessor `old` to `new` in the predecessor list and in phis.
    pub fn replace_pred(&mut self, old: BlockId, new: BlockId) {
        if self.pred.contains(&new) {
            self.pred.retain(|&b| b != old);
        } else {
            for p in &mut self.pred {
                if *p == old {
                    *p = new;
                }
            }
        }
        for phi in &mut self.phi {
            if let Some(v) = phi.v.remove(&old) {
                phi.v.insert(new, v);
            }
        }
    }
}

impl fmt::Display for IrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrNode::Nop => write!(f, "nop"),
            IrNode::ConstInt { r, v } => write!(f, "{} = const {}", r, v),
            IrNode::ConstPtr { r, p, m } => write!(f, "{} = const {:#x} ({:?})", r, p, m),
            IrNode::Copy { r, v } => write!(f, "{} = {}", r, v),
            IrNode::LoadArg { r, id } => write!(f, "{} = loadarg #{}", r, id),
            IrNode::Lea { r, mem, off } => write!(f, "{} = &({})[{}]", r, mem, off),
            IrNode::Load { r, mem, size } => write!(f, "{} = load.u{} {}", r, size * 8, mem),
            IrNode::Store { r, mem, size } => write!(f, "store.u{} {} -> *{}", size * 8, r, mem),
            IrNode::Unary { r, v, op } => write!(f, "{} = {} {}", r, op.mnemonic(), v),
            IrNode::Binary { r, x, y, op } => write!(f, "{} = {} {}, {}", r, op.mnemonic(), x, y),
            IrNode::BitTestSet { t, s, x, y } => write!(f, "{}, {} = bts {}, {}", t, s, x, y),
            IrNode::Call { func, input, output } => {
                write!(f, "{:?} = call {}{:?}", output, func.name, input)
            }
            IrNode::WriteBarrier { r, mem, var, func } => {
                write!(f, "write_barrier({}, {:#x}) {} -> *{}", func.name, var, r, mem)
            }
            IrNode::BlockZero { mem, len } => write!(f, "bzero {}, {}", mem, len),
            IrNode::BlockCopy { mem, src, len } => write!(f, "bcopy {}, {}, {}", src, mem, len),
            IrNode::Breakpoint => write!(f, "breakpoint"),
            IrNode::Entry { r } => write!(f, "entry {:?}", r),
            IrNode::Spill { op: SpillOp::Store, r, slot } => write!(f, "spill {} -> {}", r, slot),
            IrNode::Spill { op: SpillOp::Reload, r, slot } => write!(f, "{} = reload {}", r, slot),
            IrNode::Machine(m) => write!(f, "{}", m),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Switch(sw) if sw.br.is_empty() => write!(f, "jmp {}", sw.ln.to),
            Terminator::Switch(sw) => {
                write!(f, "switch {} {{", sw.v)?;
                for (k, t) in &sw.br {
                    write!(f, " {} => {},", k, t.to)?;
                }
                write!(f, " _ => {} }}", sw.ln.to)
            }
            Terminator::Return { r } => write!(f, "ret {:?}", r),
        }
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: ; preds = {:?}", self.id, self.pred)?;
        for phi in &self.phi {
            write!(f, "    {} = phi", phi.r)?;
            for (b, v) in &phi.v {
                write!(f, " [{}, {}]", b, v)?;
            }
            writeln!(f)?;
        }
        for ins in &self.ins {
            writeln!(f, "    {}", ins)?;
        }
        writeln!(f, "    {}", self.term)
    }
}

/// Caller-saved registers clobbered by a call, as arch registers.
pub fn clobbered_regs(set: &RegBitSet) -> Vec<Reg> {
    set.iter().map(|r| r.reg()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RegClass, RZ};

    #[test]
    fn test_defs_skip_zero_registers() {
        let r = Reg::norm_int(1);
        let node = IrNode::Binary { r: RZ, x: r, y: r, op: BinaryOp::Add };
        assert!(node.defs().is_empty());
        assert_eq!(node.uses(), vec![r, r]);
    }

    #[test]
    fn test_replace_use() {
        let a = Reg::norm_int(1);
        let b = Reg::norm_int(2);
        let mut node = IrNode::Store { r: a, mem: Reg::norm_ptr(0), size: 8 };
        assert!(node.replace_use(a, b));
        assert_eq!(node.uses()[0], b);
        assert!(node.is_impure());
        assert!(!node.is_movable());
    }

    #[test]
    fn test_binary_eval() {
        assert_eq!(BinaryOp::Shr.eval(-1, 60), 0xf);
        assert_eq!(BinaryOp::Sar.eval(-16, 2), -4);
        assert_eq!(BinaryOp::Shl.eval(1, 65), 2);
        assert_eq!(BinaryOp::CmpLtu.eval(-1, 1), 0);
        assert_eq!(BinaryOp::CmpLt.eval(-1, 1), 1);
        assert_eq!(UnaryOp::Swap16.eval(0x1234), 0x3412);
    }

    #[test]
    fn test_terminator_successors() {
        let mut br = BTreeMap::new();
        br.insert(1, Target::new(BlockId(2)));
        br.insert(2, Target::new(BlockId(3)));
        br.insert(3, Target::new(BlockId(2)));
        let mut term = Terminator::Switch(Switch {
            v: Reg::tmp(RegClass::Int, 0),
            ln: Target::new(BlockId(1)),
            br,
        });
        assert_eq!(term.successors(), vec![BlockId(1), BlockId(2), BlockId(3)]);
        term.replace_successor(BlockId(2), BlockId(9));
        assert_eq!(term.successors(), vec![BlockId(1), BlockId(9), BlockId(3)]);
        assert!(Terminator::jump(BlockId(4)).uses().is_empty());
    }

    #[test]
    fn test_replace_pred_merges_duplicates() {
        let mut bb = BasicBlock::new(BlockId(3), Terminator::Return { r: vec![] });
        bb.pred = vec![BlockId(1), BlockId(2)];
        bb.phi.push(Phi {
            r: Reg::norm_int(0).derive(3),
            v: [(BlockId(1), Reg::norm_int(0).derive(1)), (BlockId(2), Reg::norm_int(0).derive(2))]
                .into_iter()
                .collect(),
        });
        bb.replace_pred(BlockId(1), BlockId(7));
        assert_eq!(bb.pred, vec![BlockId(7), BlockId(2)]);
        assert!(bb.phi[0].v.contains_key(&BlockId(7)));
        bb.remove_pred(BlockId(2));
        assert_eq!(bb.phi[0].v.len(), 1);
    }
}
