//! # Fixlog
//!
//! A bottom-up Datalog materialisation engine built around the semi-naive
//! fixpoint algorithm, with an optional thread-parallel driver and a query
//! dispatcher that picks between full materialisation and demand-driven
//! evaluation.
//!
//! ## Evaluation Pipeline
//!
//! ```text
//! Program + EDB layer
//!     ↓
//! [Rule partition]        → EDB bootstrap rules / round-robin ruleset
//!     ↓
//! [Execution plans]       → delta windows, join coordinates, position maps
//!     ↓
//! [Semi-naive driver]     → cardinality skip, plan reorder, first-atom
//!     ↓                     fast path, pipelined joins, recursive saturation
//! [Fact tables]           → per-predicate block logs with set semantics
//!     ↓
//! Queries / persistence
//! ```
//!
//! The parallel driver layers conflict-free rule batches with per-predicate
//! read/write locks on top of the same rule execution; the
//! [`Reasoner`](reasoner::Reasoner) dispatches queries to a magic-set
//! rewrite (small estimates) or on-demand evaluation (large ones).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fixlog::{parse_program, EngineOptions, SemiNaiveEngine};
//!
//! let parsed = parse_program("
//!     edge(a, b). edge(b, c). edge(c, d).
//!     tc(X, Y) :- edge(X, Y).
//!     tc(X, Z) :- tc(X, Y), edge(Y, Z).
//! ")?;
//!
//! let tc = parsed.program.predicate_by_name("tc").unwrap();
//! let engine = SemiNaiveEngine::new(
//!     Arc::new(parsed.program),
//!     Arc::new(parsed.edb),
//!     EngineOptions::default(),
//! )?;
//! engine.run()?;
//! assert_eq!(engine.count_all_idb(), 6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Data model and collaborators
pub mod edb;
pub mod model;

// Storage: per-predicate fact tables and tuple blocks
pub mod table;

// Rule execution: plans, join processors, join executor
pub mod exec;

// Drivers: semi-naive core and the parallel variant
pub mod engine;

// Query dispatch: magic rewrite, on-demand evaluation, reasoner
pub mod magic;
pub mod reasoner;
pub mod topdown;

// Persistence of derived tables
pub mod persist;

// Configuration system
pub mod config;

// Errors and statistics
pub mod error;
pub mod stats;

// Datalog text frontend (binary and examples only)
pub mod text;

// Re-export the main surface
pub use config::Config;
pub use edb::{Dictionary, EdbLayer, InMemoryEdb, SeededEdb};
pub use engine::{EngineOptions, SemiNaiveEngine};
pub use error::{EngineError, EngineResult};
pub use model::{
    Literal, PredId, PredKind, Predicate, Program, Rule, Term, TermOrVar, Var, MAX_PREDICATES,
};
pub use reasoner::{Answers, Reasoner, ReasoningMode};
pub use table::{FactBlock, FactIterator, FactTable, TableStore};
pub use text::{parse_goal, parse_program, ParsedProgram};
