// This module holds the pass framework and the machine-independent optimization passes. A
// pass is a named in-place CFG mutation; the PassManager applies a fixed list of them exactly
// once each, logging block and instruction counts, recording the pass in the session
// statistics and, when verification is enabled, re-checking CFG well-formedness after each
// one. Passes that iterate internally (constant propagation, the reduction bundle) reach
// their own fixpoint before returning. PassContext carries what a pass may need besides the
// CFG: the compilation session, the ABI descriptor of the function being compiled and the
// artifacts that late passes hand to the driver (frame layout, pointer slot liveness).

//! Pass framework and optimization passes.

pub mod block_merge;
pub mod branch_elim;
pub mod constprop;
pub mod copy_elim;
pub mod cse;
pub mod dce;
pub mod interval;
pub mod reduce;
pub mod reorder;
pub mod return_spread;

use crate::core::{CompilationSession, CompileResult};
use crate::ssa::ir::{BlockId, Slot};
use crate::ssa::Cfg;
use crate::x64::abi::{AbiDescriptor, FrameLayout};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

/// Results of late passes consumed by the driver.
#[derive(Debug, Default)]
pub struct Artifacts {
    pub frame: Option<FrameLayout>,
    /// Pointer spill slots live before each instruction.
    pub pointer_liveness: BTreeMap<(BlockId, usize), BTreeSet<Slot>>,
}

/// Everything a pass may consult besides the CFG.
pub struct PassContext<'s, 'arena> {
    pub session: &'s CompilationSession<'arena>,
    pub abi: &'s AbiDescriptor,
    pub artifacts: RefCell<Artifacts>,
}

impl<'s, 'arena> PassContext<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, abi: &'s AbiDescriptor) -> Self {
        Self { session, abi, artifacts: RefCell::new(Artifacts::default()) }
    }
}

/// An in-place CFG transformation.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn apply(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()>;

    /// Whether the CFG is out of SSA form after this pass.
    fn leaves_ssa(&self) -> bool {
        false
    }
}

/// Applies an ordered list of passes.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&self, cfg: &mut Cfg, ctx: &PassContext<'_, '_>) -> CompileResult<()> {
        let options = ctx.session.options();
        let mut ssa = true;
        for pass in &self.passes {
            let name = pass.name();
            pass.apply(cfg, ctx)?;
            ctx.session.record_pass(name);
            ssa &= !pass.leaves_ssa();
            if options.verify {
                cfg.verify(name, ssa)?;
            }
            log::debug!(
                "{}: {} blocks, {} instructions",
                name,
                cfg.len(),
                cfg.instruction_count()
            );
            if options.trace_passes {
                log::trace!("after {}:\n{}", name, cfg);
            }
        }
        Ok(())
    }
}

/// Hash map with nested scopes, for walks over the dominator tree.
///
/// Entries inserted after [`ScopedMap::push_scope`] are dropped (and
/// shadowed entries restored) by the matching [`ScopedMap::pop_scope`].
pub struct ScopedMap<K, V> {
    map: HashMap<K, V>,
    undo: Vec<Vec<(K, Option<V>)>>,
}

impl<K: Eq + Hash + Clone, V> Default for ScopedMap<K, V> {
    fn default() -> Self {
        Self { map: HashMap::new(), undo: Vec::new() }
    }
}

impl<K: Eq + Hash + Clone, V> ScopedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scope(&mut self) {
        self.undo.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        for (k, old) in self.undo.pop().unwrap_or_default().into_iter().rev() {
            match old {
                Some(v) => self.map.insert(k, v),
                None => self.map.remove(&k),
            };
        }
    }

    pub fn insert(&mut self, k: K, v: V) {
        let old = self.map.insert(k.clone(), v);
        if let Some(scope) = self.undo.last_mut() {
            scope.push((k, old));
        }
    }

    pub fn get(&self, k: &K) -> Option<&V> {
        self.map.get(k)
    }
}

/// Pre-order walk of the dominator tree with scope events.
pub enum DomWalk {
    Enter(BlockId),
    Exit,
}

/// Enter/exit events of a dominator tree traversal, children by id.
pub fn dom_walk(cfg: &Cfg) -> Vec<DomWalk> {
    let mut out = Vec::with_capacity(cfg.len() * 2);
    let mut stack = vec![Some(cfg.root)];
    while let Some(item) = stack.pop() {
        match item {
            Some(b) => {
                out.push(DomWalk::Enter(b));
                stack.push(None);
                if let Some(children) = cfg.dominator_of.get(&b) {
                    stack.extend(children.iter().rev().map(|&c| Some(c)));
                }
            }
            None => out.push(DomWalk::Exit),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::diamond;

    #[test]
    fn test_scoped_map_restores_shadowed_entries() {
        let mut map = ScopedMap::new();
        map.push_scope();
        map.insert("a", 1);
        map.push_scope();
        map.insert("a", 2);
        map.insert("b", 3);
        assert_eq!(map.get(&"a"), Some(&2));
        map.pop_scope();
        assert_eq!(map.get(&"a"), Some(&1));
        assert_eq!(map.get(&"b"), None);
        map.pop_scope();
        assert_eq!(map.get(&"a"), None);
    }

    #[test]
    fn test_dom_walk_is_balanced() {
        let cfg = diamond();
        let events = dom_walk(&cfg);
        let enters = events.iter().filter(|e| matches!(e, DomWalk::Enter(_))).count();
        assert_eq!(enters, 4);
        assert_eq!(events.len(), 8);
        assert!(matches!(events[0], DomWalk::Enter(BlockId(0))));
    }
}
