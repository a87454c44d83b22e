// This module defines the error taxonomy of the hirc backend using the thiserror crate.
// Nearly every failure inside the pipeline is an internal invariant violation: malformed
// input IR coming from the HIR producer, a pass leaving the CFG inconsistent, a register
// read without a reaching definition, an allocation problem that stays uncolorable after
// the spill budget, or an ABI descriptor that does not match the compiled function. None of
// these are retryable, so each variant carries enough context (block, register, pass) to
// identify the violated invariant and the compilation is aborted with `?` at the first one.
// CompileResult<T> is the convenience alias used by every pass.

//! Error types for the hirc compiler.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Main error type for a compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Malformed input at instruction {at}: {reason}")]
    MalformedInput {
        at: usize,
        reason: String,
    },

    #[error("Register {reg} used in {block} without a reaching definition")]
    UndefinedRegister {
        reg: String,
        block: String,
    },

    #[error("Broken CFG invariant after {pass}: {reason}")]
    BrokenInvariant {
        pass: &'static str,
        reason: String,
    },

    #[error("Internal consistency error: {reason}")]
    Internal {
        reason: String,
    },

    #[error("Register allocation failed after {rounds} rounds: graph is not colorable")]
    NotColorable {
        rounds: usize,
    },

    #[error("ABI mismatch: {reason}")]
    Abi {
        reason: String,
    },
}

impl CompileError {
    /// Shorthand for an [`CompileError::Internal`] error.
    pub fn internal(reason: impl Into<String>) -> Self {
        CompileError::Internal { reason: reason.into() }
    }

    /// Shorthand for a [`CompileError::MalformedInput`] error.
    pub fn malformed(at: usize, reason: impl Into<String>) -> Self {
        CompileError::MalformedInput { at, reason: reason.into() }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
