//! Spill code insertion.
//!
//! Every read of a spilled register is preceded by a reload into a fresh
//! temporary and every write goes to a fresh temporary followed by a store,
//! so the original register disappears from the CFG. The temporaries have
//! tiny live ranges and are colored first in the next round.
//!
//! A reload temporary spilled to the slot it was loaded from loses its
//! reload; each of its reads then reloads the slot again.

use crate::core::{CompileResult, Reg};
use crate::ssa::ir::{Definitions, IrNode, Slot, SpillOp, Terminator, Usages};
use crate::ssa::Cfg;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;

fn reload(r: Reg, slot: Slot) -> IrNode {
    IrNode::Spill { op: SpillOp::Reload, r, slot }
}

fn store(r: Reg, slot: Slot) -> IrNode {
    IrNode::Spill { op: SpillOp::Store, r, slot }
}

/// Rewrite accesses to the registers in `spilled` into slot traffic.
///
/// With `cache_reloads`, a reloaded value is reused by later reads in the
/// same block until an instruction with clobbers intervenes. New
/// temporaries are added to `temps`. Returns `(stores, reloads)`.
pub fn insert_spill_code(
    cfg: &mut Cfg,
    spilled: &BTreeMap<Reg, Slot>,
    cache_reloads: bool,
    temps: &mut HashSet<Reg>,
) -> CompileResult<(usize, usize)> {
    let (mut stores, mut reloads) = (0, 0);
    for id in cfg.block_ids() {
        let old = std::mem::take(&mut cfg.block_mut(id)?.ins);
        let mut ins = Vec::with_capacity(old.len() * 2);
        let mut cache: HashMap<Slot, Reg> = HashMap::new();

        for mut node in old {
            if let IrNode::Spill { op: SpillOp::Reload, r, slot } = &node {
                if spilled.get(r) == Some(slot) {
                    continue;
                }
            }
            let mut read: Vec<Reg> = node.uses().into_iter().filter(|r| spilled.contains_key(r)).collect();
            read.sort_unstable();
            read.dedup();
            for r in read {
                let slot = spilled[&r];
                let t = match cache.get(&slot) {
                    Some(&t) if cache_reloads => t,
                    _ => {
                        let t = cfg.create_register(r.class());
                        temps.insert(t);
                        ins.push(reload(t, slot));
                        reloads += 1;
                        cache.insert(slot, t);
                        t
                    }
                };
                node.replace_use(r, t);
            }

            if let IrNode::Machine(m) = &node {
                if !m.clobbers().is_empty() {
                    cache.clear();
                }
            }

            let mut after = Vec::new();
            let mut renamed: Vec<(Reg, Reg)> = Vec::new();
            for d in node.definitions() {
                let Some(&slot) = spilled.get(&*d) else {
                    continue;
                };
                let t = match renamed.iter().find(|(from, _)| *from == *d) {
                    Some(&(_, t)) => t,
                    None => {
                        let t = cfg.create_register(d.class());
                        renamed.push((*d, t));
                        after.push(store(t, slot));
                        cache.remove(&slot);
                        t
                    }
                };
                *d = t;
            }
            temps.extend(renamed.iter().map(|&(_, t)| t));
            stores += after.len();
            ins.push(node);
            ins.extend(after);
        }

        let mut read: Vec<Reg> = cfg
            .block(id)?
            .term
            .uses()
            .into_iter()
            .filter(|r| spilled.contains_key(r))
            .collect();
        read.sort_unstable();
        read.dedup();
        let mut replace = Vec::new();
        for r in read {
            let slot = spilled[&r];
            let t = match cache.get(&slot) {
                Some(&t) if cache_reloads => t,
                _ => {
                    let t = cfg.create_register(r.class());
                    temps.insert(t);
                    ins.push(reload(t, slot));
                    reloads += 1;
                    t
                }
            };
            replace.push((r, t));
        }

        let block = cfg.block_mut(id)?;
        block.ins = ins;
        for (r, t) in replace {
            rename_term_use(&mut block.term, r, t);
        }
    }
    log::debug!("spill code: {} stores, {} reloads", stores, reloads);
    Ok((stores, reloads))
}

fn rename_term_use(term: &mut Terminator, from: Reg, to: Reg) {
    for r in term.usages() {
        if *r == from {
            *r = to;
        }
    }
}
