//! Compilation options.
//!
//! Options are plain data; [`CompileOptions::from_env`] layers the
//! `HIRC_VERIFY` and `HIRC_TRACE_PASSES` environment switches on top of the
//! defaults.

use super::register_file::RegBitSet;
use std::fmt;
use std::sync::Arc;

/// Read-only view of memory whose contents are fixed at compile time.
///
/// Constant propagation folds loads through pointers tagged
/// [`Constness::Const`](crate::ssa::Constness) by asking this provider.
pub trait StaticMemory: Send + Sync {
    /// Read `size` bytes (1, 2, 4 or 8) at `addr`, zero-extended.
    fn read(&self, addr: u64, size: u8) -> Option<u64>;
}

/// Knobs for a single compilation.
#[derive(Clone)]
pub struct CompileOptions {
    /// Allocatable registers. `None` selects every register the ABI does not reserve.
    pub palette: Option<RegBitSet>,
    /// Check CFG well-formedness after every pass.
    pub verify: bool,
    /// Dump the CFG at trace level after every pass.
    pub trace_passes: bool,
    /// Provider for constant memory loads.
    pub static_memory: Option<Arc<dyn StaticMemory>>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            palette: None,
            verify: cfg!(debug_assertions),
            trace_passes: false,
            static_memory: None,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HIRC_VERIFY` and `HIRC_TRACE_PASSES`.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = env_flag("HIRC_VERIFY") {
            opts.verify = v;
        }
        if let Some(v) = env_flag("HIRC_TRACE_PASSES") {
            opts.trace_passes = v;
        }
        opts
    }

    pub fn with_palette(mut self, palette: RegBitSet) -> Self {
        self.palette = Some(palette);
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_static_memory(mut self, mem: Arc<dyn StaticMemory>) -> Self {
        self.static_memory = Some(mem);
        self
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("palette", &self.palette)
            .field("verify", &self.verify)
            .field("trace_passes", &self.trace_passes)
            .field("static_memory", &self.static_memory.is_some())
            .finish()
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("ignoring {}={:?}: expected a boolean", name, other);
            None
        }
    }
}
