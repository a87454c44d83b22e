// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession is created once per compiled function and owns a reference to the arena
// that holds per-compilation scratch data (live ranges, frame layout), the compile options
// and a RefCell of SessionStats. Passes record what they did (blocks removed, phi nodes
// inserted, constants folded, spill stores and reloads) through the session, and the driver
// logs the resulting statistics once the function is linearized. Everything allocated in
// the arena shares the session lifetime, so the allocator scratch never needs explicit frees.

//! Arena-based compilation session management.
//!
//! All scratch objects of one compilation are tied to the session
//! lifetime, eliminating complex lifetime propagation.

use super::options::CompileOptions;
use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation scratch objects.
    arena: &'arena Bump,

    /// Options this compilation runs with.
    options: CompileOptions,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump, options: CompileOptions) -> Self {
        Self {
            arena,
            options,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Record that a pass ran.
    pub fn record_pass(&self, name: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        stats.last_pass = name;
    }

    pub fn record_blocks_removed(&self, count: usize) {
        self.stats.borrow_mut().blocks_removed += count;
    }

    pub fn record_phis_inserted(&self, count: usize) {
        self.stats.borrow_mut().phis_inserted += count;
    }

    pub fn record_constants_folded(&self, count: usize) {
        self.stats.borrow_mut().constants_folded += count;
    }

    pub fn record_edges_removed(&self, count: usize) {
        self.stats.borrow_mut().edges_removed += count;
    }

    pub fn record_copies_coalesced(&self, count: usize) {
        self.stats.borrow_mut().copies_coalesced += count;
    }

    pub fn record_spills(&self, stores: usize, reloads: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.spill_stores += stores;
        stats.reloads += reloads;
    }

    pub fn record_allocation_rounds(&self, rounds: usize) {
        self.stats.borrow_mut().allocation_rounds = rounds;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of passes applied.
    pub passes_run: usize,

    /// Name of the last pass applied.
    pub last_pass: &'static str,

    /// Blocks pruned as unreachable or merged away.
    pub blocks_removed: usize,

    /// Phi nodes inserted by SSA construction.
    pub phis_inserted: usize,

    /// Definitions replaced by literal loads.
    pub constants_folded: usize,

    /// Switch edges proven dead.
    pub edges_removed: usize,

    /// Copies removed by coalescing.
    pub copies_coalesced: usize,

    /// Spill stores inserted.
    pub spill_stores: usize,

    /// Reloads inserted.
    pub reloads: usize,

    /// Allocation attempts of the last register allocation.
    pub allocation_rounds: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Passes run: {}", self.passes_run)?;
        writeln!(f, "  Blocks removed: {}", self.blocks_removed)?;
        writeln!(f, "  Phi nodes inserted: {}", self.phis_inserted)?;
        writeln!(f, "  Constants folded: {}", self.constants_folded)?;
        writeln!(f, "  Edges removed: {}", self.edges_removed)?;
        writeln!(f, "  Copies coalesced: {}", self.copies_coalesced)?;
        writeln!(f, "  Spill stores: {}", self.spill_stores)?;
        writeln!(f, "  Reloads: {}", self.reloads)?;
        writeln!(f, "  Allocation rounds: {}", self.allocation_rounds)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena, CompileOptions::default());

        let stats = session.stats();
        assert_eq!(stats.passes_run, 0);
        assert_eq!(stats.spill_stores, 0);
    }

    #[test]
    fn test_arena_allocation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena, CompileOptions::default());

        let value = session.alloc(42);
        assert_eq!(*value, 42);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena, CompileOptions::default());

        session.record_pass("Branch Elimination");
        session.record_pass("Block Merging");
        session.record_blocks_removed(2);
        session.record_spills(1, 3);

        let stats = session.stats();
        assert_eq!(stats.passes_run, 2);
        assert_eq!(stats.last_pass, "Block Merging");
        assert_eq!(stats.blocks_removed, 2);
        assert_eq!(stats.reloads, 3);

        let output = format!("{}", stats);
        assert!(output.contains("Passes run: 2"));
        assert!(output.contains("Reloads: 3"));
    }
}
