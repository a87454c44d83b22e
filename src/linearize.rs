// This module takes the CFG out of SSA form and flattens it into the final instruction
// stream. Phi elimination first splits every critical edge entering a block with phis, so
// each incoming value can be placed at the end of a predecessor that has no other successor.
// A block with a single phi receives plain copies; with several phis the copies go through
// fresh temporaries first, which gives them parallel semantics when one phi reads another.
// The register allocator later weights those copies by loop depth, so the hottest copies are
// the first to be coalesced away. Flattening collapses blocks that only jump elsewhere, lays
// the remaining blocks out depth-first from the root with likely successors placed first,
// and turns terminators into jumps and branches that are omitted when they would fall through.

//! SSA exit and flattening.

use crate::core::{CompileError, CompileResult, Reg};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{BlockId, IrNode, Terminator};
use crate::ssa::Cfg;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub struct PhiElimination;

impl Pass for PhiElimination {
    fn name(&self) -> &'static str {
        "Phi Elimination"
    }

    fn apply(&self, cfg: &mut Cfg, _ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let split = split_critical_edges(cfg)?;
        let copies = eliminate_phis(cfg)?;
        log::debug!("phi elimination: {} edges split, {} copies", split, copies);
        Ok(())
    }

    fn leaves_ssa(&self) -> bool {
        true
    }
}

/// Split edges from multi-successor blocks into blocks with phis.
pub fn split_critical_edges(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut split = 0;
    for id in cfg.block_ids() {
        let block = cfg.block(id)?;
        if block.phi.is_empty() {
            continue;
        }
        for p in block.pred.clone() {
            if cfg.block(p)?.successors().len() > 1 {
                cfg.split_edge(p, id)?;
                split += 1;
            }
        }
    }
    if split > 0 {
        cfg.rebuild()?;
    }
    Ok(split)
}

/// Replace phis by copies at the end of predecessors; returns the number of copies.
pub fn eliminate_phis(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut copies = 0;
    for id in cfg.block_ids() {
        let block = cfg.block_mut(id)?;
        let phis = std::mem::take(&mut block.phi);
        if phis.is_empty() {
            continue;
        }
        for p in block.pred.clone() {
            let mut moves = Vec::with_capacity(phis.len());
            for phi in &phis {
                let v = phi.v.get(&p).copied().ok_or_else(|| {
                    CompileError::internal(format!("phi {} in {} has no value from {}", phi.r, id, p))
                })?;
                moves.push((phi.r, v));
            }
            let seq = if let &[(r, v)] = moves.as_slice() {
                vec![IrNode::Copy { r, v }]
            } else {
                let temps: Vec<Reg> = moves.iter().map(|(r, _)| cfg.create_register(r.class())).collect();
                let into_temps = temps.iter().zip(&moves).map(|(&t, &(_, v))| IrNode::Copy { r: t, v });
                let out_of_temps = temps.iter().zip(&moves).map(|(&t, &(r, _))| IrNode::Copy { r, v: t });
                into_temps.chain(out_of_temps).collect()
            };
            let pred = cfg.block_mut(p)?;
            if pred.successors().len() > 1 {
                return Err(CompileError::internal(format!("critical edge {} -> {} survived", p, id)));
            }
            copies += seq.len();
            pred.ins.extend(seq);
        }
    }
    Ok(copies)
}

/// One element of the flattened stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Flat {
    Ins(IrNode),
    Jmp(BlockId),
    /// Jump to `br[v]`, else to `ln`, else fall through.
    Branch { v: Reg, br: BTreeMap<i64, BlockId>, ln: Option<BlockId> },
    Ret { r: Vec<Reg> },
}

impl fmt::Display for Flat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flat::Ins(ins) => write!(f, "{}", ins),
            Flat::Jmp(to) => write!(f, "jmp {}", to),
            Flat::Branch { v, br, ln } => {
                write!(f, "switch {} {{", v)?;
                for (k, to) in br {
                    write!(f, " {} => {},", k, to)?;
                }
                match ln {
                    Some(to) => write!(f, " _ => {} }}", to),
                    None => write!(f, " }}"),
                }
            }
            Flat::Ret { r } => write!(f, "ret {:?}", r),
        }
    }
}

/// A flattened function body.
#[derive(Debug, Clone, Default)]
pub struct Linear {
    pub code: Vec<Flat>,
    /// Position of the first element of each emitted block.
    pub block_offsets: BTreeMap<BlockId, usize>,
}

/// Remove blocks holding nothing but a jump; returns how many were removed.
pub fn collapse_jump_blocks(cfg: &mut Cfg) -> CompileResult<usize> {
    let mut removed = 0;
    loop {
        let candidate = cfg.blocks.values().find_map(|b| {
            let to = b.term.jump_target()?;
            let empty = b.ins.is_empty() && b.phi.is_empty();
            let plain_target = cfg.blocks.get(&to).is_some_and(|t| t.phi.is_empty());
            (empty && plain_target && b.id != cfg.root && to != b.id).then_some((b.id, to))
        });
        let Some((id, to)) = candidate else {
            break;
        };
        for p in cfg.block(id)?.pred.clone() {
            cfg.block_mut(p)?.term.replace_successor(id, to);
        }
        cfg.blocks.remove(&id);
        cfg.recompute_predecessors();
        removed += 1;
    }
    if removed > 0 {
        cfg.rebuild()?;
    }
    Ok(removed)
}

/// Depth-first block order from the root, likely successors first.
pub fn layout(cfg: &Cfg) -> Vec<BlockId> {
    let mut order = Vec::with_capacity(cfg.len());
    let mut visited = HashSet::new();
    let mut stack = vec![cfg.root];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        let Some(block) = cfg.blocks.get(&id) else {
            continue;
        };
        let mut targets = block.term.targets();
        targets.sort_by_key(|t| t.likeliness);
        for t in targets.iter().rev() {
            if !visited.contains(&t.to) {
                stack.push(t.to);
            }
        }
    }
    order
}

/// Flatten `cfg` into a single instruction stream.
pub fn linearize(cfg: &mut Cfg) -> CompileResult<Linear> {
    if cfg.blocks.values().any(|b| !b.phi.is_empty()) {
        return Err(CompileError::internal("cannot linearize a graph in SSA form"));
    }
    let collapsed = collapse_jump_blocks(cfg)?;
    let order = layout(cfg);
    let mut out = Linear::default();
    for (i, &id) in order.iter().enumerate() {
        let next = order.get(i + 1).copied();
        let block = cfg.block(id)?;
        out.block_offsets.insert(id, out.code.len());
        out.code.extend(block.ins.iter().cloned().map(Flat::Ins));
        match &block.term {
            Terminator::Return { r } => out.code.push(Flat::Ret { r: r.clone() }),
            Terminator::Switch(sw) if sw.br.is_empty() => {
                if next != Some(sw.ln.to) {
                    out.code.push(Flat::Jmp(sw.ln.to));
                }
            }
            Terminator::Switch(sw) => out.code.push(Flat::Branch {
                v: sw.v,
                br: sw.br.iter().map(|(&k, t)| (k, t.to)).collect(),
                ln: (next != Some(sw.ln.to)).then_some(sw.ln.to),
            }),
        }
    }
    log::trace!(
        "linearized {} blocks into {} elements ({} jump blocks collapsed)",
        order.len(),
        out.code.len(),
        collapsed
    );
    Ok(out)
}
