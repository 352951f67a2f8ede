//! # Join Processors
//!
//! Sinks for join output. [`InterTableJoinProcessor`] collects intermediate
//! rows between two adjacent body atoms; [`FinalTableJoinProcessor`]
//! collects head rows and hands them to the head predicate's fact table as
//! one new block. Both deduplicate at `consolidate`, skipping the work when
//! every insert was flagged provably unique.
//!
//! [`RowChunk`] is the buffering decorator used by chunked parallel
//! first-atom scans: each chunk projects into its own buffer, and the
//! chunks are flushed into the parent processor in chunk order.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::model::{Literal, Term};
use crate::table::internal::InternalTable;
use crate::table::{FactBlock, TableStore};

/// Capability set shared by the two join sinks.
pub trait JoinProcessor {
    /// Emit one output row assembled from an intermediate row and an atom
    /// row through the plan's position maps.
    fn process_results(&mut self, left: &[Term], right: &[Term], unique: bool);

    /// Append a whole block through the atom-side position map.
    /// `same_order` marks a projection that preserves the column order;
    /// `single_block` that the source iterator held exactly one block.
    fn add_block(&mut self, block: &FactBlock, unique: bool, same_order: bool, single_block: bool);

    /// In-place dedup of the buffered rows.
    fn consolidate(&mut self);

    /// Buffered row count (after the last consolidate, an exact count).
    fn n_rows(&self) -> usize;

    /// Snapshot of the atom-side projection, for chunked parallel scans.
    fn chunk_buffer(&self) -> RowChunk;

    /// Absorb a chunk buffer, preserving its row order.
    fn absorb(&mut self, chunk: RowChunk, unique: bool);
}

fn project_row(
    template: &[Term],
    pos_from_first: &[(usize, usize)],
    pos_from_second: &[(usize, usize)],
    left: &[Term],
    right: &[Term],
    out: &mut Vec<Term>,
) {
    let start = out.len();
    out.extend_from_slice(template);
    for &(o, c) in pos_from_first {
        out[start + o] = left[c];
    }
    for &(o, c) in pos_from_second {
        out[start + o] = right[c];
    }
}

fn sort_flat_rows(rows: &mut Vec<Term>, width: usize, dedup: bool) {
    if width == 0 || rows.is_empty() {
        return;
    }
    let mut split: Vec<&[Term]> = rows.chunks(width).collect();
    split.sort_unstable();
    if dedup {
        split.dedup();
    }
    let mut fresh = Vec::with_capacity(split.len() * width);
    for row in split {
        fresh.extend_from_slice(row);
    }
    *rows = fresh;
}

/// Sink for non-final join steps: a growable typed row buffer that becomes
/// the next intermediate table.
pub struct InterTableJoinProcessor {
    width: usize,
    pos_from_first: Vec<(usize, usize)>,
    pos_from_second: Vec<(usize, usize)>,
    template: Vec<Term>,
    rows: Vec<Term>,
    all_unique: bool,
}

impl InterTableJoinProcessor {
    pub fn new(
        width: usize,
        pos_from_first: Vec<(usize, usize)>,
        pos_from_second: Vec<(usize, usize)>,
    ) -> Self {
        InterTableJoinProcessor {
            template: vec![0; width],
            width,
            pos_from_first,
            pos_from_second,
            rows: Vec::new(),
            all_unique: true,
        }
    }

    /// The consolidated intermediate table.
    pub fn into_table(mut self) -> InternalTable {
        self.consolidate();
        let rows: Vec<Vec<Term>> = self.rows.chunks(self.width).map(<[Term]>::to_vec).collect();
        InternalTable::from_sorted_rows(self.width, rows)
    }
}

impl JoinProcessor for InterTableJoinProcessor {
    fn process_results(&mut self, left: &[Term], right: &[Term], unique: bool) {
        self.all_unique &= unique;
        project_row(
            &self.template,
            &self.pos_from_first,
            &self.pos_from_second,
            left,
            right,
            &mut self.rows,
        );
    }

    fn add_block(&mut self, block: &FactBlock, unique: bool, _same_order: bool, _single_block: bool) {
        self.all_unique &= unique;
        let cols = block.table.columns();
        for i in 0..block.table.n_rows() {
            let start = self.rows.len();
            self.rows.extend_from_slice(&self.template);
            for &(o, c) in &self.pos_from_second {
                self.rows[start + o] = cols[c][i];
            }
        }
    }

    fn consolidate(&mut self) {
        sort_flat_rows(&mut self.rows, self.width, !self.all_unique);
        self.all_unique = true;
    }

    fn n_rows(&self) -> usize {
        if self.width == 0 {
            return usize::from(!self.rows.is_empty());
        }
        self.rows.len() / self.width
    }

    fn chunk_buffer(&self) -> RowChunk {
        RowChunk::new(self.template.clone(), self.pos_from_second.clone())
    }

    fn absorb(&mut self, chunk: RowChunk, unique: bool) {
        self.all_unique &= unique;
        self.rows.extend(chunk.rows);
    }
}

/// Sink for the last join step: buffers head rows, then hands them to the
/// head predicate's fact table as one new block.
pub struct FinalTableJoinProcessor {
    width: usize,
    pos_from_first: Vec<(usize, usize)>,
    pos_from_second: Vec<(usize, usize)>,
    template: Vec<Term>,
    rows: Vec<Term>,
    all_unique: bool,
    head: Literal,
    rule_id: usize,
    plan_index: u8,
    iteration: usize,
    should_add: bool,
}

impl FinalTableJoinProcessor {
    pub fn new(
        head: Literal,
        head_constants: &[(usize, Term)],
        pos_from_first: Vec<(usize, usize)>,
        pos_from_second: Vec<(usize, usize)>,
        rule_id: usize,
        plan_index: u8,
        iteration: usize,
        should_add: bool,
    ) -> Self {
        let width = head.arity();
        let mut template = vec![0; width];
        for &(pos, value) in head_constants {
            template[pos] = value;
        }
        FinalTableJoinProcessor {
            width,
            pos_from_first,
            pos_from_second,
            template,
            rows: Vec::new(),
            all_unique: true,
            head,
            rule_id,
            plan_index,
            iteration,
            should_add,
        }
    }

    pub fn should_add_to_end_table(&self) -> bool {
        self.should_add
    }

    /// Consolidate and write the buffered rows into the head table.
    /// Returns whether a block survived the table's anti-join.
    pub fn flush(mut self, store: &TableStore) -> EngineResult<bool> {
        self.consolidate();
        if self.rows.is_empty() || !self.should_add {
            return Ok(false);
        }
        let rows: Vec<Vec<Term>> = self.rows.chunks(self.width).map(<[Term]>::to_vec).collect();
        let table = Arc::new(InternalTable::from_sorted_rows(self.width, rows));
        store.add(
            self.head.predicate.id,
            self.width,
            table,
            self.head.clone(),
            Some(self.rule_id),
            self.plan_index,
            self.iteration,
        )
    }

    /// The buffered rows, for callers that collect answers instead of
    /// writing them to the head table.
    pub fn rows(&self) -> Vec<Vec<Term>> {
        self.rows.chunks(self.width).map(<[Term]>::to_vec).collect()
    }
}

impl JoinProcessor for FinalTableJoinProcessor {
    fn process_results(&mut self, left: &[Term], right: &[Term], unique: bool) {
        self.all_unique &= unique;
        project_row(
            &self.template,
            &self.pos_from_first,
            &self.pos_from_second,
            left,
            right,
            &mut self.rows,
        );
    }

    fn add_block(&mut self, block: &FactBlock, unique: bool, _same_order: bool, _single_block: bool) {
        self.all_unique &= unique;
        let cols = block.table.columns();
        for i in 0..block.table.n_rows() {
            let start = self.rows.len();
            self.rows.extend_from_slice(&self.template);
            for &(o, c) in &self.pos_from_second {
                self.rows[start + o] = cols[c][i];
            }
        }
    }

    fn consolidate(&mut self) {
        sort_flat_rows(&mut self.rows, self.width, !self.all_unique);
        self.all_unique = true;
    }

    fn n_rows(&self) -> usize {
        if self.width == 0 {
            return usize::from(!self.rows.is_empty());
        }
        self.rows.len() / self.width
    }

    fn chunk_buffer(&self) -> RowChunk {
        RowChunk::new(self.template.clone(), self.pos_from_second.clone())
    }

    fn absorb(&mut self, chunk: RowChunk, unique: bool) {
        self.all_unique &= unique;
        self.rows.extend(chunk.rows);
    }
}

/// Per-chunk output buffer for parallel first-atom scans. Each worker
/// projects into its own chunk; the parent absorbs the chunks in chunk
/// order so that the overall row order matches the sequential scan.
#[derive(Debug, Clone)]
pub struct RowChunk {
    template: Vec<Term>,
    pos_from_second: Vec<(usize, usize)>,
    rows: Vec<Term>,
}

impl RowChunk {
    fn new(template: Vec<Term>, pos_from_second: Vec<(usize, usize)>) -> Self {
        RowChunk {
            template,
            pos_from_second,
            rows: Vec::new(),
        }
    }

    /// Project row `i` of the column vectors into the buffer.
    pub fn process_row(&mut self, columns: &[Vec<Term>], i: usize) {
        let start = self.rows.len();
        self.rows.extend_from_slice(&self.template);
        for &(o, c) in &self.pos_from_second {
            self.rows[start + o] = columns[c][i];
        }
    }
}
