// This module drives register allocation on the CFG after SSA exit. Allocation is an
// iterated graph coloring: each round coalesces copies, recomputes liveness and the
// interference graph and colors the virtual registers against the palette. When every
// register found a palette color, the colors are substituted, the spill traffic is cleaned
// up and the frame (callee-saved registers written, spill slots, outgoing argument area) is
// laid out. Otherwise each overflow color class becomes a numbered stack slot, spill code is
// inserted for the registers holding it and the next round starts. Only the first round
// caches reloads within a block; later rounds keep every reload next to its use so the
// temporaries stay short. A reload temporary that overflows goes back to its own slot and
// is reloaded at each read. The round before the last spills every virtual register that is
// not already a spill temporary, sharing slots between registers of one color, so the last
// round only sees temporaries that live for a single instruction. The round budget is
// MAX_ALLOC_ROUNDS.

//! Graph-coloring register allocation.

pub mod cleanup;
pub mod coalesce;
pub mod color;
pub mod interference;
pub mod liveness;
pub mod spill;
pub mod stack_liveness;

pub use stack_liveness::StackLiveness;

use crate::core::{AsmReg, CompileError, CompileResult, Reg, RegBitSet, RegClass};
use crate::passes::{Pass, PassContext};
use crate::ssa::ir::{Definitions, IrNode, Slot, SpillOp, Usages};
use crate::ssa::Cfg;
use crate::x64::abi::FunctionFrame;
use crate::x64::ops::Amd64Node;
use crate::x64::regs::{default_palette, CALLEE_SAVED, RESERVED};
use color::{Color, Coloring};
use hashbrown::{HashMap, HashSet};
use interference::{copy_hints, InterferenceGraph};
use liveness::Liveness;
use std::collections::BTreeMap;

/// Coloring attempts before allocation gives up.
pub const MAX_ALLOC_ROUNDS: usize = 6;

/// Rename every register `f` maps, in instructions and terminators.
pub fn rename_registers(cfg: &mut Cfg, mut f: impl FnMut(Reg) -> Option<Reg>) {
    for block in cfg.blocks.values_mut() {
        for ins in &mut block.ins {
            for r in ins.definitions() {
                if let Some(to) = f(*r) {
                    *r = to;
                }
            }
            for r in ins.usages() {
                if let Some(to) = f(*r) {
                    *r = to;
                }
            }
        }
        for r in block.term.usages() {
            if let Some(to) = f(*r) {
                *r = to;
            }
        }
    }
}

pub struct RegisterAllocation;

impl Pass for RegisterAllocation {
    fn name(&self) -> &'static str {
        "Register Allocation"
    }

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let session = ctx.session;
        let palette = session
            .options()
            .palette
            .unwrap_or_else(default_palette)
            .without(&RESERVED);
        let mut allocator = Allocator::new(palette);
        let result = allocator.run(cfg);
        session.record_copies_coalesced(allocator.coalesced);
        session.record_spills(allocator.stores, allocator.reloads);
        session.record_allocation_rounds(allocator.rounds);
        result?;

        let mut frame = FunctionFrame::new(session.arena());
        for id in written_registers(cfg).iter() {
            if CALLEE_SAVED.contains(id) {
                frame.add_saved_register(id);
            }
        }
        for _ in 0..allocator.slots {
            frame.allocate_spill_slot();
        }
        frame.reserve_outgoing(outgoing_area(cfg));
        frame.calculate_frame_size();
        let frame = session.alloc(frame);
        log::debug!(
            "allocated in {} rounds: {} spill slots, frame size {}",
            allocator.rounds,
            allocator.slots,
            frame.frame_size
        );
        ctx.artifacts.borrow_mut().frame = Some(frame.layout());
        Ok(())
    }
}

/// Physical registers written anywhere in `cfg`, clobbers excluded.
fn written_registers(cfg: &Cfg) -> RegBitSet {
    cfg.blocks
        .values()
        .flat_map(|b| b.ins.iter())
        .flat_map(|ins| ins.defs())
        .filter_map(AsmReg::from_reg)
        .collect()
}

/// Largest stack argument area of any call.
fn outgoing_area(cfg: &Cfg) -> u32 {
    cfg.blocks
        .values()
        .flat_map(|b| b.ins.iter())
        .filter_map(|ins| match ins {
            IrNode::Machine(Amd64Node::CallFunc { func, .. }) => Some(func.abi.stack_size()),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// State of one allocation across its rounds.
struct Allocator {
    palette: RegBitSet,
    temps: HashSet<Reg>,
    next_slot: u32,
    rounds: usize,
    slots: u32,
    coalesced: usize,
    stores: usize,
    reloads: usize,
}

impl Allocator {
    fn new(palette: RegBitSet) -> Self {
        Self {
            palette,
            temps: HashSet::new(),
            next_slot: 0,
            rounds: 0,
            slots: 0,
            coalesced: 0,
            stores: 0,
            reloads: 0,
        }
    }

    fn run(&mut self, cfg: &mut Cfg) -> CompileResult<()> {
        if self.palette.is_empty() {
            return Err(CompileError::NotColorable { rounds: 0 });
        }
        while self.rounds < MAX_ALLOC_ROUNDS {
            self.rounds += 1;
            self.coalesced += coalesce::coalesce(cfg, &self.palette, &self.temps)?;

            let live = Liveness::compute(cfg);
            if let Some(&r) = live.undefined(cfg).first() {
                return Err(CompileError::UndefinedRegister {
                    reg: r.to_string(),
                    block: cfg.root.to_string(),
                });
            }
            let graph = InterferenceGraph::build(cfg, &live);
            let hints = copy_hints(cfg);
            let ranges = live.ranges(cfg);
            let coloring = color::color(&graph, &ranges, &hints, &self.palette, &self.temps);

            if coloring.is_complete() {
                substitute(cfg, &coloring)?;
                let removed = cleanup::cleanup(cfg);
                log::trace!("round {}: colored, {} instructions cleaned up", self.rounds, removed);
                return Ok(());
            }

            let reloaded = reload_slots(cfg, &self.temps);
            let spilled = if self.rounds + 1 == MAX_ALLOC_ROUNDS {
                self.spill_everything(&coloring, &reloaded)
            } else {
                self.assign_slots(&coloring, &reloaded)
            };
            log::debug!("round {}: spilling {} registers", self.rounds, spilled.len());
            let (stores, reloads) =
                spill::insert_spill_code(cfg, &spilled, self.rounds == 1, &mut self.temps)?;
            self.stores += stores;
            self.reloads += reloads;
        }
        Err(CompileError::NotColorable { rounds: self.rounds })
    }

    fn fresh_slot(&mut self, ptr: bool) -> Slot {
        let slot = Slot { id: self.next_slot, ptr };
        self.next_slot += 1;
        self.slots = self.next_slot;
        slot
    }

    /// One fresh slot per overflow color class. Overflowing reload
    /// temporaries keep the slot they were loaded from.
    fn assign_slots(&mut self, coloring: &Coloring, reloaded: &HashMap<Reg, Slot>) -> BTreeMap<Reg, Slot> {
        let mut classes: BTreeMap<(RegClass, u32), Slot> = BTreeMap::new();
        let mut spilled = BTreeMap::new();
        for (r, i) in coloring.overflowed() {
            let slot = match reloaded.get(&r) {
                Some(&slot) => slot,
                None => match classes.get(&(r.class(), i)) {
                    Some(&slot) => slot,
                    None => {
                        let slot = self.fresh_slot(r.is_ptr());
                        classes.insert((r.class(), i), slot);
                        slot
                    }
                },
            };
            spilled.insert(r, slot);
        }
        spilled
    }

    /// Spill every register that is not a store temporary. Registers of
    /// one color never interfere, so they share a slot.
    fn spill_everything(&mut self, coloring: &Coloring, reloaded: &HashMap<Reg, Slot>) -> BTreeMap<Reg, Slot> {
        let mut classes: BTreeMap<(RegClass, Color), Slot> = BTreeMap::new();
        let mut spilled = BTreeMap::new();
        for (&r, &c) in &coloring.colors {
            let slot = match reloaded.get(&r) {
                Some(&slot) => slot,
                None if self.temps.contains(&r) => continue,
                None => match classes.get(&(r.class(), c)) {
                    Some(&slot) => slot,
                    None => {
                        let slot = self.fresh_slot(r.is_ptr());
                        classes.insert((r.class(), c), slot);
                        slot
                    }
                },
            };
            spilled.insert(r, slot);
        }
        spilled
    }
}

/// Spill temporaries defined by a reload, with the slot they read.
fn reload_slots(cfg: &Cfg, temps: &HashSet<Reg>) -> HashMap<Reg, Slot> {
    cfg.blocks
        .values()
        .flat_map(|b| b.ins.iter())
        .filter_map(|ins| match ins {
            IrNode::Spill { op: SpillOp::Reload, r, slot } if temps.contains(r) => Some((*r, *slot)),
            _ => None,
        })
        .collect()
}

/// Replace every virtual register by its color.
fn substitute(cfg: &mut Cfg, coloring: &Coloring) -> CompileResult<()> {
    let mut missing = None;
    rename_registers(cfg, |r| {
        if !r.is_virtual() {
            return None;
        }
        match coloring.get(r) {
            Some(Color::Reg(a)) => Some(a.reg()),
            _ => {
                missing.get_or_insert(r);
                None
            }
        }
    });
    match missing {
        Some(r) => Err(CompileError::internal(format!("{} has no register after coloring", r))),
        None => Ok(()),
    }
}
