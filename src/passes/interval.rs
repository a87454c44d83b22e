// This module implements the fact domain of the branch elimination prover. An IntervalSet is
// a sorted union of disjoint closed intervals over the signed 64-bit values, stored with i128
// endpoints so that computing min - 1 or max + 1 never overflows. Unsigned constraints are
// translated into the signed domain by splitting at 2^63, which gives every set both a signed
// and an unsigned view. Facts pair per-register interval sets with a set of relations between
// registers (equal, not equal, less than and their unsigned and negated forms). The Prover
// knows the base range of every register from its definition (literals, comparison results,
// narrow loads, masks, shifts) and which registers hold comparison results, so assuming a
// switch value also assumes the comparison it came from. Assumptions either narrow the facts
// or report a contradiction, which is exactly the proof that an edge can never be taken.

//! Interval sets and the facts of the branch prover.

use crate::core::Reg;
use crate::ssa::ir::{BinaryOp, IrNode, UnaryOp};
use crate::ssa::Cfg;
use std::collections::{BTreeMap, BTreeSet, HashMap};

const MIN: i128 = i64::MIN as i128;
const MAX: i128 = i64::MAX as i128;
const TWO_64: i128 = 1 << 64;

/// Union of disjoint closed intervals of signed 64-bit values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: Vec<(i128, i128)>,
}

impl IntervalSet {
    pub fn full() -> Self {
        Self { ranges: vec![(MIN, MAX)] }
    }

    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn point(v: i64) -> Self {
        Self { ranges: vec![(v as i128, v as i128)] }
    }

    /// Signed range `[lo, hi]`, clamped to the domain.
    pub fn range(lo: i128, hi: i128) -> Self {
        let (lo, hi) = (lo.max(MIN), hi.min(MAX));
        if lo > hi {
            Self::empty()
        } else {
            Self { ranges: vec![(lo, hi)] }
        }
    }

    /// Values whose unsigned view lies in `[lo, hi]`.
    pub fn unsigned_range(lo: i128, hi: i128) -> Self {
        let (lo, hi) = (lo.max(0), hi.min(TWO_64 - 1));
        if lo > hi {
            return Self::empty();
        }
        let low = Self::range(lo, hi.min(MAX));
        let high = Self::range(lo.max(MAX + 1) - TWO_64, hi - TWO_64);
        low.union(&high)
    }

    fn normalize(mut ranges: Vec<(i128, i128)>) -> Self {
        ranges.retain(|(lo, hi)| lo <= hi);
        ranges.sort_unstable();
        let mut out: Vec<(i128, i128)> = Vec::with_capacity(ranges.len());
        for (lo, hi) in ranges {
            match out.last_mut() {
                Some(last) if lo <= last.1 + 1 => last.1 = last.1.max(hi),
                _ => out.push((lo, hi)),
            }
        }
        Self { ranges: out }
    }

    pub fn union(&self, other: &Self) -> Self {
        Self::normalize(self.ranges.iter().chain(&other.ranges).copied().collect())
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            for &(c, d) in &other.ranges {
                let (lo, hi) = (a.max(c), b.min(d));
                if lo <= hi {
                    out.push((lo, hi));
                }
            }
        }
        Self::normalize(out)
    }

    pub fn complement(&self) -> Self {
        let mut out = Vec::new();
        let mut next = MIN;
        for &(lo, hi) in &self.ranges {
            if lo > next {
                out.push((next, lo - 1));
            }
            next = hi + 1;
        }
        if next <= MAX {
            out.push((next, MAX));
        }
        Self { ranges: out }
    }

    pub fn without(&self, other: &Self) -> Self {
        self.intersect(&other.complement())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, v: i64) -> bool {
        let v = v as i128;
        self.ranges.iter().any(|&(lo, hi)| lo <= v && v <= hi)
    }

    /// The single value of a one-element set.
    pub fn as_point(&self) -> Option<i64> {
        match self.ranges.as_slice() {
            [(lo, hi)] if lo == hi => Some(*lo as i64),
            _ => None,
        }
    }

    /// Smallest signed value.
    pub fn min(&self) -> Option<i128> {
        self.ranges.first().map(|r| r.0)
    }

    /// Largest signed value.
    pub fn max(&self) -> Option<i128> {
        self.ranges.last().map(|r| r.1)
    }

    /// Smallest unsigned value.
    pub fn umin(&self) -> Option<i128> {
        self.ranges
            .iter()
            .find(|r| r.1 >= 0)
            .map(|r| r.0.max(0))
            .or_else(|| self.min().map(|m| m + TWO_64))
    }

    /// Largest unsigned value.
    pub fn umax(&self) -> Option<i128> {
        match self.ranges.last() {
            Some(&(_, hi)) if self.min().is_some_and(|m| m < 0) => {
                let neg_max = self.ranges.iter().filter(|r| r.0 < 0).map(|r| r.1.min(-1)).max();
                neg_max.map(|m| m + TWO_64).or(Some(hi))
            }
            Some(&(_, hi)) => Some(hi),
            None => None,
        }
    }
}

/// Relation between two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rel {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl Rel {
    pub fn negate(self) -> Self {
        match self {
            Rel::Eq => Rel::Ne,
            Rel::Ne => Rel::Eq,
            Rel::Lt => Rel::Ge,
            Rel::Ge => Rel::Lt,
            Rel::Ltu => Rel::Geu,
            Rel::Geu => Rel::Ltu,
        }
    }

    /// The relation a comparison result of 1 asserts.
    pub fn of(op: BinaryOp) -> Option<Self> {
        match op {
            BinaryOp::CmpEq => Some(Rel::Eq),
            BinaryOp::CmpNe => Some(Rel::Ne),
            BinaryOp::CmpLt => Some(Rel::Lt),
            BinaryOp::CmpLtu => Some(Rel::Ltu),
            BinaryOp::CmpGeu => Some(Rel::Geu),
            _ => None,
        }
    }

    /// Relations whose presence between `(x, y)` and `(y, x)` contradicts `self`.
    fn conflicts(self) -> (&'static [Rel], &'static [Rel]) {
        match self {
            Rel::Eq => (&[Rel::Ne, Rel::Lt, Rel::Ltu], &[Rel::Ne, Rel::Lt, Rel::Ltu]),
            Rel::Ne => (&[Rel::Eq], &[Rel::Eq]),
            Rel::Lt => (&[Rel::Ge, Rel::Eq], &[Rel::Lt, Rel::Eq]),
            Rel::Ge => (&[Rel::Lt], &[]),
            Rel::Ltu => (&[Rel::Geu, Rel::Eq], &[Rel::Ltu, Rel::Eq]),
            Rel::Geu => (&[Rel::Ltu], &[]),
        }
    }
}

/// What is known to hold at a program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts {
    ranges: BTreeMap<Reg, IntervalSet>,
    relations: BTreeSet<(Reg, Rel, Reg)>,
}

/// Derives and combines facts about SSA registers.
pub struct Prover {
    base: HashMap<Reg, IntervalSet>,
    conds: HashMap<Reg, (Rel, Reg, Reg)>,
}

impl Prover {
    /// Collect base ranges and comparison definitions of `cfg`.
    pub fn new(cfg: &Cfg) -> Self {
        let mut lits: HashMap<Reg, i64> = HashMap::new();
        let mut defs: Vec<&IrNode> = Vec::new();
        for b in cfg.blocks.values() {
            for ins in &b.ins {
                if let IrNode::ConstInt { r, v } = ins {
                    lits.insert(*r, *v);
                }
                defs.push(ins);
            }
        }
        let lit = |r: Reg| if r.is_zero() { Some(0) } else { lits.get(&r).copied() };

        let mut base = HashMap::new();
        let mut conds = HashMap::new();
        for ins in defs {
            match ins {
                IrNode::ConstInt { r, v } => {
                    base.insert(*r, IntervalSet::point(*v));
                }
                IrNode::Binary { r, x, y, op } if op.is_compare() => {
                    base.insert(*r, IntervalSet::range(0, 1));
                    if let Some(rel) = Rel::of(*op) {
                        conds.insert(*r, (rel, *x, *y));
                    }
                }
                IrNode::Binary { r, x, y, op: BinaryOp::And } => {
                    let mask = match (lit(*x), lit(*y)) {
                        (Some(m), _) | (_, Some(m)) if m >= 0 => Some(m),
                        _ => None,
                    };
                    if let Some(m) = mask {
                        base.insert(*r, IntervalSet::range(0, m as i128));
                    }
                }
                IrNode::Binary { r, y, op: BinaryOp::Shr, .. } => {
                    if let Some(k) = lit(*y).map(|k| k & 63).filter(|&k| k > 0) {
                        base.insert(*r, IntervalSet::range(0, (1i128 << (64 - k)) - 1));
                    }
                }
                IrNode::Load { r, size, .. } if *size < 8 => {
                    base.insert(*r, IntervalSet::range(0, (1i128 << (8 * *size as u32)) - 1));
                }
                IrNode::BitTestSet { t, .. } => {
                    base.insert(*t, IntervalSet::range(0, 1));
                }
                IrNode::Unary { r, op, .. } => {
                    let range = match op {
                        UnaryOp::Sext32 => IntervalSet::range(i32::MIN as i128, i32::MAX as i128),
                        UnaryOp::Swap16 => IntervalSet::range(0, 0xffff),
                        UnaryOp::Swap32 => IntervalSet::range(0, 0xffff_ffff),
                        _ => continue,
                    };
                    base.insert(*r, range);
                }
                _ => {}
            }
        }
        Self { base, conds }
    }

    /// Current range of `r` under `facts`.
    pub fn range(&self, facts: &Facts, r: Reg) -> IntervalSet {
        if r.is_zero() {
            return IntervalSet::point(0);
        }
        facts
            .ranges
            .get(&r)
            .or_else(|| self.base.get(&r))
            .cloned()
            .unwrap_or_else(IntervalSet::full)
    }

    fn narrow(&self, facts: &mut Facts, r: Reg, set: &IntervalSet) -> bool {
        let narrowed = self.range(facts, r).intersect(set);
        if narrowed.is_empty() {
            return false;
        }
        if !r.is_zero() {
            facts.ranges.insert(r, narrowed);
        }
        true
    }

    /// Facts after additionally assuming `v ∈ set`, or `None` on contradiction.
    pub fn assume_in(&self, facts: &Facts, v: Reg, set: &IntervalSet) -> Option<Facts> {
        let mut out = facts.clone();
        if !self.narrow(&mut out, v, set) {
            return None;
        }
        let value = self.range(&out, v).as_point();
        match (value, self.conds.get(&v)) {
            (Some(1), Some(&(rel, x, y))) => self.assume_rel(&out, x, rel, y),
            (Some(0), Some(&(rel, x, y))) => self.assume_rel(&out, x, rel.negate(), y),
            _ => Some(out),
        }
    }

    /// Facts after additionally assuming `x rel y`, or `None` on contradiction.
    pub fn assume_rel(&self, facts: &Facts, x: Reg, rel: Rel, y: Reg) -> Option<Facts> {
        if x == y {
            return match rel {
                Rel::Ne | Rel::Lt | Rel::Ltu => None,
                Rel::Eq | Rel::Ge | Rel::Geu => Some(facts.clone()),
            };
        }
        let (forward, backward) = rel.conflicts();
        if forward.iter().any(|&r| facts.relations.contains(&(x, r, y)))
            || backward.iter().any(|&r| facts.relations.contains(&(y, r, x)))
        {
            return None;
        }

        let mut out = facts.clone();
        let rx = self.range(&out, x);
        let ry = self.range(&out, y);
        let (nx, ny) = match rel {
            Rel::Eq => {
                let both = rx.intersect(&ry);
                (both.clone(), both)
            }
            Rel::Ne => {
                let nx = match ry.as_point() {
                    Some(c) => rx.without(&IntervalSet::point(c)),
                    None => rx.clone(),
                };
                let ny = match rx.as_point() {
                    Some(c) => ry.without(&IntervalSet::point(c)),
                    None => ry.clone(),
                };
                (nx, ny)
            }
            Rel::Lt => (
                IntervalSet::range(MIN, ry.max()? - 1),
                IntervalSet::range(rx.min()? + 1, MAX),
            ),
            Rel::Ge => (IntervalSet::range(ry.min()?, MAX), IntervalSet::range(MIN, rx.max()?)),
            Rel::Ltu => (
                IntervalSet::unsigned_range(0, ry.umax()? - 1),
                IntervalSet::unsigned_range(rx.umin()? + 1, TWO_64 - 1),
            ),
            Rel::Geu => (
                IntervalSet::unsigned_range(ry.umin()?, TWO_64 - 1),
                IntervalSet::unsigned_range(0, rx.umax()?),
            ),
        };
        if !self.narrow(&mut out, x, &nx) || !self.narrow(&mut out, y, &ny) {
            return None;
        }
        out.relations.insert((x, rel, y));
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RegClass;

    #[test]
    fn test_set_algebra() {
        let a = IntervalSet::range(0, 10);
        let b = IntervalSet::range(5, 20);
        assert_eq!(a.intersect(&b), IntervalSet::range(5, 10));
        assert_eq!(a.union(&b), IntervalSet::range(0, 20));
        let holes = a.without(&IntervalSet::point(3));
        assert!(!holes.contains(3));
        assert!(holes.contains(4));
        assert_eq!(IntervalSet::full().complement(), IntervalSet::empty());
        assert_eq!(IntervalSet::point(7).as_point(), Some(7));
    }

    #[test]
    fn test_extreme_endpoints_do_not_overflow() {
        let top = IntervalSet::point(i64::MAX);
        assert!(top.complement().contains(i64::MIN));
        assert!(!top.complement().contains(i64::MAX));
        let bottom = IntervalSet::point(i64::MIN);
        assert_eq!(bottom.complement().min(), Some(i64::MIN as i128 + 1));
    }

    #[test]
    fn test_unsigned_views() {
        // u >= 2^63 is exactly the negative half.
        let high = IntervalSet::unsigned_range(1 << 63, TWO_64 - 1);
        assert_eq!(high, IntervalSet::range(MIN, -1));
        let set = IntervalSet::range(-2, 3);
        assert_eq!(set.umin(), Some(0));
        assert_eq!(set.umax(), Some(TWO_64 - 1));
        assert_eq!(IntervalSet::range(2, 9).umax(), Some(9));
        assert_eq!(IntervalSet::range(-5, -3).umin(), Some(TWO_64 - 5));
    }

    #[test]
    fn test_contradicting_relations() {
        let prover = Prover { base: HashMap::new(), conds: HashMap::new() };
        let x = Reg::tmp(RegClass::Int, 0);
        let y = Reg::tmp(RegClass::Int, 1);
        let facts = prover.assume_rel(&Facts::default(), x, Rel::Lt, y).unwrap();
        assert!(prover.assume_rel(&facts, y, Rel::Lt, x).is_none());
        assert!(prover.assume_rel(&facts, x, Rel::Ge, y).is_none());
        assert!(prover.assume_rel(&facts, x, Rel::Ne, y).is_some());
        assert!(prover.assume_rel(&facts, x, Rel::Lt, x).is_none());
    }

    #[test]
    fn test_ranges_against_constants() {
        let x = Reg::tmp(RegClass::Int, 0);
        let c = Reg::tmp(RegClass::Int, 1);
        let mut base = HashMap::new();
        base.insert(c, IntervalSet::point(10));
        let prover = Prover { base, conds: HashMap::new() };

        let facts = prover.assume_rel(&Facts::default(), x, Rel::Ltu, c).unwrap();
        assert_eq!(prover.range(&facts, x), IntervalSet::range(0, 9));
        assert!(prover.assume_in(&facts, x, &IntervalSet::point(12)).is_none());
        assert!(prover.assume_rel(&facts, x, Rel::Geu, c).is_none());
        let facts = prover.assume_in(&facts, x, &IntervalSet::range(5, 100)).unwrap();
        assert!(prover.assume_rel(&facts, x, Rel::Lt, c).is_some());
    }
}
