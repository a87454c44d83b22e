//! Dead code elimination.
//!
//! Mark and sweep over registers: everything read by an impure instruction
//! or a terminator is live, and liveness flows backwards through the
//! instructions and phis defining live registers. Pure instructions and
//! phis that define only dead registers are removed. Physical registers are
//! tracked by name, so the pass stays conservative once arch registers
//! appear with several definitions.

use super::{Pass, PassContext};
use crate::core::{CompileResult, Reg};
use crate::ssa::ir::IrNode;
use crate::ssa::Cfg;
use std::collections::{HashMap, HashSet};

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "Dead Code Elimination"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        eliminate_dead_code(cfg);
        Ok(())
    }
}

/// Returns whether anything was removed.
pub fn eliminate_dead_code(cfg: &mut Cfg) -> bool {
    // Registers each definition depends on.
    let mut deps: HashMap<Reg, Vec<Reg>> = HashMap::new();
    let mut live: HashSet<Reg> = HashSet::new();
    let mut work: Vec<Reg> = Vec::new();

    for b in cfg.blocks.values() {
        for phi in &b.phi {
            deps.entry(phi.r).or_default().extend(phi.v.values().copied());
        }
        for ins in &b.ins {
            let uses = ins.uses();
            if ins.is_impure() {
                work.extend(uses.iter().copied());
            }
            for d in ins.defs() {
                deps.entry(d).or_default().extend(uses.iter().copied());
            }
        }
        work.extend(b.term.uses());
    }

    while let Some(r) = work.pop() {
        if r.is_zero() || !live.insert(r) {
            continue;
        }
        if let Some(ds) = deps.get(&r) {
            work.extend(ds.iter().copied());
        }
    }

    let mut removed = false;
    for b in cfg.blocks.values_mut() {
        let before = b.phi.len() + b.ins.len();
        b.phi.retain(|phi| live.contains(&phi.r));
        b.ins.retain(|ins| {
            if ins.is_impure() {
                return true;
            }
            if matches!(ins, IrNode::Nop) {
                return false;
            }
            ins.defs().iter().any(|d| live.contains(d))
        });
        removed |= b.phi.len() + b.ins.len() != before;
    }
    removed
}
