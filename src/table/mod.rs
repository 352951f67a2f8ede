//! # Fact Tables
//!
//! One [`FactTable`] per predicate: an append-only log of derivation
//! blocks, each tagged with the iteration that produced it. Blocks are
//! immutable; `add` deduplicates a candidate block against everything
//! derived earlier, which is what gives every table set semantics.
//!
//! Reads are two-level lazy sequences: a [`FactIterator`] yields blocks,
//! and each block's [`InternalTable`] yields rows. Filtered reads (rows
//! matching a literal's constants and repeated variables) are cached per
//! literal shape and extended incrementally as new blocks arrive.
//!
//! The [`TableStore`] owns all tables behind per-predicate read/write
//! locks; tables are created lazily on first write.

pub mod internal;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::model::{Literal, PredId, Term, TermOrVar, MAX_PREDICATES};
use internal::InternalTable;

/// One immutable derivation block: who produced it, when, and the rows.
#[derive(Debug, Clone)]
pub struct FactBlock {
    /// Derivation step that produced the block.
    pub iteration: usize,
    /// Rule that produced it, `None` for EDB wrapper blocks.
    pub rule_id: Option<usize>,
    /// Which execution plan of the rule produced it.
    pub plan_index: u8,
    /// The rows.
    pub table: Arc<InternalTable>,
    /// The literal this block was derived for (most general for EDB).
    pub literal: Literal,
}

impl FactBlock {
    /// Same rows, new iteration tag. The backing table is shared.
    pub fn clone_with_iteration(&self, iteration: usize, rule_id: Option<usize>, plan_index: u8) -> FactBlock {
        FactBlock {
            iteration,
            rule_id,
            plan_index,
            table: Arc::clone(&self.table),
            literal: self.literal.clone(),
        }
    }
}

/// Finite, restartable-per-block iterator over derivation blocks.
#[derive(Debug, Default)]
pub struct FactIterator {
    blocks: Vec<FactBlock>,
    pos: usize,
}

impl FactIterator {
    pub fn new(blocks: Vec<FactBlock>) -> Self {
        FactIterator { blocks, pos: 0 }
    }

    pub fn empty() -> Self {
        FactIterator::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.blocks.len()
    }

    /// Blocks not yet consumed.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len() - self.pos
    }

    pub fn current_block(&self) -> Option<&FactBlock> {
        self.blocks.get(self.pos)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Total rows across the remaining blocks.
    pub fn n_rows(&self) -> usize {
        self.blocks[self.pos..].iter().map(|b| b.table.n_rows()).sum()
    }
}

impl Iterator for FactIterator {
    type Item = FactBlock;

    fn next(&mut self) -> Option<FactBlock> {
        let block = self.blocks.get(self.pos).cloned();
        self.pos += 1;
        block
    }
}

/// Canonical shape of a literal for the view cache: constants by value,
/// variables by first-occurrence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SlotKey {
    Const(Term),
    Var(usize),
}

fn filter_key(literal: &Literal) -> Vec<SlotKey> {
    let mut first_at: HashMap<u8, usize> = HashMap::new();
    literal
        .tuple
        .iter()
        .map(|slot| match slot {
            TermOrVar::Const(c) => SlotKey::Const(*c),
            TermOrVar::Var(v) => {
                let next = first_at.len();
                SlotKey::Var(*first_at.entry(*v).or_insert(next))
            }
        })
        .collect()
}

/// Cached filtered view: blocks already filtered plus how many source
/// blocks were consumed so the view can be extended incrementally.
#[derive(Debug, Default)]
struct CachedView {
    filtered: Vec<FactBlock>,
    n_seen: usize,
}

/// Per-predicate append-only block log with set semantics.
#[derive(Debug)]
pub struct FactTable {
    arity: usize,
    blocks: Vec<FactBlock>,
    n_rows: usize,
    filter_cache: Mutex<HashMap<Vec<SlotKey>, CachedView>>,
}

impl FactTable {
    pub fn new(arity: usize) -> Self {
        FactTable {
            arity,
            blocks: Vec::new(),
            n_rows: 0,
            filter_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn n_all_rows(&self) -> usize {
        self.n_rows
    }

    pub fn min_iteration(&self) -> Option<usize> {
        self.blocks.first().map(|b| b.iteration)
    }

    pub fn max_iteration(&self) -> Option<usize> {
        self.blocks.last().map(|b| b.iteration)
    }

    pub fn last_block(&self) -> Option<&FactBlock> {
        self.blocks.last()
    }

    pub fn blocks(&self) -> &[FactBlock] {
        &self.blocks
    }

    /// True when some block was produced at exactly `iteration`.
    pub fn has_rows_at(&self, iteration: usize) -> bool {
        self.blocks.iter().rev().any(|b| b.iteration == iteration)
    }

    /// Blocks whose iteration falls in `[min, max]`.
    pub fn read(&self, min: usize, max: usize) -> FactIterator {
        let blocks = self
            .blocks
            .iter()
            .filter(|b| b.iteration >= min && b.iteration <= max)
            .cloned()
            .collect();
        FactIterator::new(blocks)
    }

    /// Filtered read: only rows matching the literal's constant positions
    /// and repeated-variable constraints. Views are cached per literal
    /// shape and extended as blocks arrive; row masks only, columns are
    /// never reshuffled.
    pub fn filter(&self, literal: &Literal, min: usize, max: usize) -> FactIterator {
        if literal.is_most_general() {
            return self.read(min, max);
        }
        let key = filter_key(literal);
        let constants = literal.constant_positions();
        let pairs = literal.repeated_var_pairs();

        let mut cache = self.filter_cache.lock();
        let view = cache.entry(key).or_default();
        while view.n_seen < self.blocks.len() {
            let block = &self.blocks[view.n_seen];
            view.n_seen += 1;
            let selected = block.table.select(&constants, &pairs);
            if !selected.is_empty() {
                view.filtered.push(FactBlock {
                    iteration: block.iteration,
                    rule_id: block.rule_id,
                    plan_index: block.plan_index,
                    table: Arc::new(selected),
                    literal: block.literal.clone(),
                });
            }
        }
        let blocks = view
            .filtered
            .iter()
            .filter(|b| b.iteration >= min && b.iteration <= max)
            .cloned()
            .collect();
        FactIterator::new(blocks)
    }

    /// Append a candidate block, subtracting every earlier block first
    /// (anti-join on all columns). Returns whether any rows survived.
    ///
    /// Block iterations must be non-decreasing; violating that is a
    /// programmer bug, not a recoverable condition.
    pub fn add(
        &mut self,
        table: Arc<InternalTable>,
        literal: Literal,
        rule_id: Option<usize>,
        plan_index: u8,
        iteration: usize,
    ) -> EngineResult<bool> {
        if table.arity() != self.arity {
            return Err(EngineError::Invariant(format!(
                "block arity {} does not match table arity {}",
                table.arity(),
                self.arity
            )));
        }
        if let Some(last) = self.max_iteration() {
            if iteration < last {
                return Err(EngineError::Invariant(format!(
                    "block iteration {iteration} precedes last iteration {last}"
                )));
            }
        }
        if table.is_empty() {
            return Ok(false);
        }

        let mut residue = table;
        for earlier in &self.blocks {
            if residue.is_empty() {
                break;
            }
            let subtracted = residue.subtract(&earlier.table);
            if subtracted.n_rows() != residue.n_rows() {
                residue = Arc::new(subtracted);
            }
        }
        if residue.is_empty() {
            return Ok(false);
        }

        self.n_rows += residue.n_rows();
        self.blocks.push(FactBlock {
            iteration,
            rule_id,
            plan_index,
            table: residue,
            literal,
        });
        Ok(true)
    }

    /// Upper-bound cardinality of rows matching `literal` in the range.
    /// Exact for filtered shapes since views materialise the matching rows.
    pub fn estimate_cardinality(&self, literal: &Literal, min: usize, max: usize) -> usize {
        if literal.is_most_general() {
            return self
                .blocks
                .iter()
                .filter(|b| b.iteration >= min && b.iteration <= max)
                .map(|b| b.table.n_rows())
                .sum();
        }
        self.filter(literal, min, max).n_rows()
    }
}

/// All fact tables, indexed densely by predicate id. Each slot carries its
/// own read/write lock; tables are created lazily on first write.
pub struct TableStore {
    slots: Vec<RwLock<Option<FactTable>>>,
}

impl Default for TableStore {
    fn default() -> Self {
        TableStore::new()
    }
}

impl TableStore {
    pub fn new() -> Self {
        TableStore {
            slots: (0..MAX_PREDICATES).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn exists(&self, pred: PredId) -> bool {
        self.slots[pred].read().is_some()
    }

    pub fn is_empty(&self, pred: PredId) -> bool {
        self.slots[pred].read().as_ref().map_or(true, FactTable::is_empty)
    }

    pub fn n_rows(&self, pred: PredId) -> usize {
        self.slots[pred].read().as_ref().map_or(0, FactTable::n_all_rows)
    }

    pub fn has_rows_at(&self, pred: PredId, iteration: usize) -> bool {
        self.slots[pred]
            .read()
            .as_ref()
            .is_some_and(|t| t.has_rows_at(iteration))
    }

    pub fn min_iteration(&self, pred: PredId) -> Option<usize> {
        self.slots[pred].read().as_ref().and_then(FactTable::min_iteration)
    }

    pub fn max_iteration(&self, pred: PredId) -> Option<usize> {
        self.slots[pred].read().as_ref().and_then(FactTable::max_iteration)
    }

    pub fn last_block(&self, pred: PredId) -> Option<FactBlock> {
        self.slots[pred].read().as_ref().and_then(|t| t.last_block().cloned())
    }

    pub fn read(&self, pred: PredId, min: usize, max: usize) -> FactIterator {
        self.slots[pred]
            .read()
            .as_ref()
            .map_or_else(FactIterator::empty, |t| t.read(min, max))
    }

    pub fn filtered_read(&self, literal: &Literal, min: usize, max: usize) -> FactIterator {
        self.slots[literal.predicate.id]
            .read()
            .as_ref()
            .map_or_else(FactIterator::empty, |t| t.filter(literal, min, max))
    }

    /// Estimate through the table; `None` when no table exists yet.
    pub fn estimate(&self, literal: &Literal, min: usize, max: usize) -> Option<usize> {
        self.slots[literal.predicate.id]
            .read()
            .as_ref()
            .map(|t| t.estimate_cardinality(literal, min, max))
    }

    /// Install freshly fetched EDB blocks under one write lock, so no
    /// reader can observe the table created but not yet filled. A second
    /// loader of the same predicate finds the table present and backs off.
    pub fn install_edb(
        &self,
        pred: PredId,
        arity: usize,
        blocks: Vec<Arc<InternalTable>>,
        literal: &Literal,
    ) -> EngineResult<()> {
        let mut slot = self.slots[pred].write();
        if slot.is_some() {
            return Ok(());
        }
        let table = slot.insert(FactTable::new(arity));
        for block in blocks {
            table.add(block, literal.clone(), None, 0, 0)?;
        }
        Ok(())
    }

    /// Add a block to a predicate's table, creating the table lazily.
    pub fn add(
        &self,
        pred: PredId,
        arity: usize,
        table: Arc<InternalTable>,
        literal: Literal,
        rule_id: Option<usize>,
        plan_index: u8,
        iteration: usize,
    ) -> EngineResult<bool> {
        let mut slot = self.slots[pred].write();
        let fact_table = slot.get_or_insert_with(|| FactTable::new(arity));
        fact_table.add(table, literal, rule_id, plan_index, iteration)
    }

    /// Run a closure under the read lock of one predicate's table.
    pub fn with_table<R>(&self, pred: PredId, f: impl FnOnce(Option<&FactTable>) -> R) -> R {
        f(self.slots[pred].read().as_ref())
    }
}
