//! Engine Error Types

use std::io;
use thiserror::Error;

/// Errors raised by the materialisation engine and its collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The EDB layer failed to resolve an extensional atom
    #[error("EDB fetch failed for predicate {predicate}: {message}")]
    EdbFetch { predicate: usize, message: String },

    /// A term id has no dictionary entry. Callers that print terms fall
    /// back to the numeric id instead of aborting.
    #[error("no dictionary entry for term {0}")]
    DictMiss(u64),

    /// Writing derived tables to disk failed
    #[error("failed to persist derivations: {0}")]
    PersistWrite(#[from] io::Error),

    /// Internal invariant broken (programmer bug, fatal)
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A worker thread panicked during parallel saturation
    #[error("worker thread panicked during parallel saturation")]
    WorkerPanicked,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
