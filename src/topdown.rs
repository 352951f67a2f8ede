//! # On-Demand Evaluation
//!
//! The top-down strategy of the dispatcher: instead of materialising the
//! whole program, evaluate only the rules (transitively) reachable from
//! the query predicate and stream the matching rows. No bindings are
//! pushed into the rules; that is what the magic rewrite is for.

use std::sync::Arc;

use crate::edb::EdbLayer;
use crate::engine::{EngineOptions, SemiNaiveEngine};
use crate::error::EngineResult;
use crate::model::{Literal, Program, Term};

/// Single-shot iterator over query answers.
#[derive(Debug)]
pub struct TopDownIterator {
    rows: std::vec::IntoIter<Vec<Term>>,
}

impl TopDownIterator {
    pub(crate) fn new(rows: Vec<Vec<Term>>) -> Self {
        TopDownIterator {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for TopDownIterator {
    type Item = Vec<Term>;

    fn next(&mut self) -> Option<Vec<Term>> {
        self.rows.next()
    }
}

/// Evaluate a query on demand: saturate the query-relevant slice of the
/// program and return the rows matching the query literal.
pub fn evaluate(
    query: &Literal,
    program: &Program,
    edb: Arc<dyn EdbLayer>,
    opts: &EngineOptions,
) -> EngineResult<TopDownIterator> {
    if query.predicate.is_edb() {
        let blocks = edb.fetch(query, 0, usize::MAX)?;
        let rows = blocks.iter().flat_map(|t| t.rows().collect::<Vec<_>>()).collect();
        return Ok(TopDownIterator::new(rows));
    }

    let restricted = program.restrict_to(query.predicate.id);
    let engine = SemiNaiveEngine::new(Arc::new(restricted), edb, opts.clone())?;
    engine.run()?;

    let mut rows = Vec::new();
    for block in engine.filtered_table(query) {
        rows.extend(block.table.rows());
    }
    Ok(TopDownIterator::new(rows))
}
