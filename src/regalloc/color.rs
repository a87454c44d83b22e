//! Welsh–Powell coloring.
//!
//! Virtual registers are colored in decreasing order of competing
//! neighbors. A register that finds no free palette register receives an
//! overflow color instead; overflow colors are numbered per register class
//! and become spill slots.

use super::interference::{CopyHint, InterferenceGraph};
use super::liveness::ProgramPoint;
use crate::core::{AsmReg, Reg, RegBitSet, RegClass};
use crate::x64::regs::{CALLEE_SAVED, CALLER_SAVED};
use hashbrown::HashSet;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Color {
    Reg(AsmReg),
    /// Did not fit the palette.
    Overflow(u32),
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Reg(r) => write!(f, "{}", r),
            Color::Overflow(i) => write!(f, "overflow{}", i),
        }
    }
}

/// Color of every virtual register.
#[derive(Debug, Clone, Default)]
pub struct Coloring {
    pub colors: BTreeMap<Reg, Color>,
}

impl Coloring {
    pub fn get(&self, r: Reg) -> Option<Color> {
        self.colors.get(&r).copied()
    }

    /// Registers that received an overflow color, with their index.
    pub fn overflowed(&self) -> impl Iterator<Item = (Reg, u32)> + '_ {
        self.colors.iter().filter_map(|(&r, &c)| match c {
            Color::Overflow(i) => Some((r, i)),
            Color::Reg(_) => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.overflowed().next().is_none()
    }
}

/// Palette registers in preference order: caller-saved ones first, so
/// callee-saved registers are only used (and saved) under pressure.
fn preference(palette: &RegBitSet) -> Vec<AsmReg> {
    let caller = palette.intersect(&CALLER_SAVED);
    let callee = palette.intersect(&CALLEE_SAVED);
    let rest = palette.without(&caller).without(&callee);
    caller.iter().chain(callee.iter()).chain(rest.iter()).collect()
}

/// Color the virtual registers of `graph`.
///
/// `pinned` registers (spill temporaries) go first, since spilling them
/// again cannot make progress.
pub fn color(
    graph: &InterferenceGraph,
    ranges: &BTreeMap<Reg, Vec<ProgramPoint>>,
    hints: &[CopyHint],
    palette: &RegBitSet,
    pinned: &HashSet<Reg>,
) -> Coloring {
    let mut order: Vec<Reg> = graph.virtual_nodes().collect();
    order.sort_by_key(|&r| {
        let len = ranges.get(&r).map_or(0, Vec::len);
        (!pinned.contains(&r), std::cmp::Reverse(graph.pressure(r, palette)), len, r)
    });

    let mut partners: BTreeMap<Reg, Vec<Reg>> = BTreeMap::new();
    for h in hints {
        partners.entry(h.dst).or_default().push(h.src);
        partners.entry(h.src).or_default().push(h.dst);
    }

    let prefs = preference(palette);
    let mut coloring = Coloring::default();
    for r in order {
        let mut taken = RegBitSet::new();
        let mut taken_overflow = BTreeSet::new();
        for n in graph.neighbors(r) {
            if let Some(a) = AsmReg::from_reg(n) {
                taken.set(a);
                continue;
            }
            match coloring.get(n) {
                Some(Color::Reg(a)) => taken.set(a),
                Some(Color::Overflow(i)) if n.class() == r.class() => {
                    taken_overflow.insert(i);
                }
                _ => {}
            }
        }
        let free = |a: &AsmReg| palette.contains(*a) && !taken.contains(*a);

        let hinted = partners.get(&r).into_iter().flatten().find_map(|&p| {
            let a = match AsmReg::from_reg(p) {
                Some(a) => a,
                None => match coloring.get(p)? {
                    Color::Reg(a) => a,
                    Color::Overflow(_) => return None,
                },
            };
            free(&a).then_some(a)
        });
        let c = match hinted.or_else(|| prefs.iter().copied().find(free)) {
            Some(a) => Color::Reg(a),
            None => Color::Overflow((0..).find(|i| !taken_overflow.contains(i)).unwrap_or(0)),
        };
        log::trace!("{} -> {}", r, c);
        coloring.colors.insert(r, c);
    }
    coloring
}

/// Overflow colors per class, as `(class, index)` pairs.
pub fn overflow_classes(coloring: &Coloring) -> BTreeSet<(RegClass, u32)> {
    coloring.overflowed().map(|(r, i)| (r.class(), i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::regs::{default_palette, RAX, RBX, RCX};

    fn v(i: u32) -> Reg {
        Reg::tmp(RegClass::Int, i)
    }

    fn p(i: u32) -> Reg {
        Reg::tmp(RegClass::Ptr, i)
    }

    fn clique(regs: &[Reg]) -> InterferenceGraph {
        let mut g = InterferenceGraph::new();
        for (i, &a) in regs.iter().enumerate() {
            g.add_node(a);
            for &b in &regs[i + 1..] {
                g.add_edge(a, b);
            }
        }
        g
    }

    #[test]
    fn test_neighbors_get_distinct_registers() {
        let g = clique(&[v(0), v(1), v(2)]);
        let c = color(&g, &BTreeMap::new(), &[], &default_palette(), &HashSet::new());
        assert!(c.is_complete());
        let used: BTreeSet<Color> = c.colors.values().copied().collect();
        assert_eq!(used.len(), 3);
        // Caller-saved registers are handed out before RBX.
        assert!(!used.contains(&Color::Reg(RBX)));
    }

    #[test]
    fn test_small_palette_overflows_by_class() {
        let g = clique(&[v(0), v(1), v(2), p(3)]);
        let palette = RegBitSet::from_ids(&[0, 1]);
        let c = color(&g, &BTreeMap::new(), &[], &palette, &HashSet::new());
        let overflow: Vec<(Reg, u32)> = c.overflowed().collect();
        assert_eq!(overflow.len(), 2);
        // Overflow numbering restarts for the pointer class.
        let classes = overflow_classes(&c);
        assert!(classes.iter().all(|&(_, i)| i == 0));
    }

    #[test]
    fn test_physical_neighbors_and_hints() {
        let mut g = InterferenceGraph::new();
        g.add_node(v(0));
        g.add_node(v(1));
        g.add_edge(v(0), RAX.reg());
        let hints = [CopyHint { dst: v(1), src: RCX.reg(), weight: 1 }];
        let c = color(&g, &BTreeMap::new(), &hints, &default_palette(), &HashSet::new());
        assert_ne!(c.get(v(0)), Some(Color::Reg(RAX)));
        assert_eq!(c.get(v(1)), Some(Color::Reg(RCX)));
    }
}
