//! # Reasoner / Dispatcher
//!
//! Given a query literal, the reasoner picks one evaluation strategy and
//! sticks with it: when the estimated size of materialising the query
//! predicate stays below the threshold, it runs the magic-set rewrite and
//! materialises the guarded program (MAGIC); otherwise it evaluates on
//! demand over the query-relevant rule slice (TOPDOWN). The two are never
//! blended.
//!
//! The size estimate is a depth-bounded walk over the rule graph: EDB
//! atoms delegate to the EDB layer, IDB atoms sum a product-of-body bound
//! over their defining rules. Exact estimation is a non-goal; this only
//! has to separate "small enough to materialise" from "not".

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::edb::{EdbLayer, SeededEdb};
use crate::engine::{EngineOptions, SemiNaiveEngine};
use crate::error::EngineResult;
use crate::magic;
use crate::model::{Literal, PredId, Program, Term};
use crate::topdown::{self, TopDownIterator};

/// Evaluation strategy chosen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningMode {
    TopDown,
    Magic,
}

/// Recursion depth of the cardinality estimate.
const ESTIMATE_DEPTH: usize = 3;

/// Query dispatcher.
pub struct Reasoner {
    threshold: u64,
}

impl Reasoner {
    pub fn new(threshold: u64) -> Self {
        Reasoner { threshold }
    }

    /// Pick the strategy for a query: MAGIC below the threshold, TOPDOWN
    /// at or above it.
    pub fn choose_mode(
        &self,
        query: &Literal,
        program: &Program,
        edb: &dyn EdbLayer,
    ) -> ReasoningMode {
        let estimate = self.estimate(query, program, edb);
        let mode = if estimate < self.threshold {
            ReasoningMode::Magic
        } else {
            ReasoningMode::TopDown
        };
        debug!(estimate, threshold = self.threshold, ?mode, "chose reasoning mode");
        mode
    }

    /// Depth-bounded upper-ish estimate of the query predicate's
    /// materialised size.
    pub fn estimate(&self, query: &Literal, program: &Program, edb: &dyn EdbLayer) -> u64 {
        let mut memo = HashMap::new();
        estimate_literal(query, program, edb, ESTIMATE_DEPTH, &mut memo)
    }

    /// Answer a query with the chosen strategy, returning the matching
    /// rows (full tuples of the query predicate).
    pub fn answer(
        &self,
        query: &Literal,
        program: &Program,
        edb: Arc<dyn EdbLayer>,
        opts: &EngineOptions,
    ) -> EngineResult<Answers> {
        let mode = self.choose_mode(query, program, edb.as_ref());
        let rows = match mode {
            ReasoningMode::TopDown => topdown::evaluate(query, program, edb, opts)?,
            ReasoningMode::Magic => {
                let rewrite = magic::rewrite(query, program)
                    .map_err(crate::error::EngineError::Invariant)?;
                let layered: Arc<dyn EdbLayer> = if rewrite.seeds.is_empty() {
                    edb
                } else {
                    Arc::new(SeededEdb::new(edb, rewrite.seeds.clone()))
                };
                let restricted = rewrite.program.restrict_to(rewrite.query.predicate.id);
                let engine = SemiNaiveEngine::new(Arc::new(restricted), layered, opts.clone())?;
                engine.run()?;
                let mut rows = Vec::new();
                for block in engine.filtered_table(&rewrite.query) {
                    rows.extend(block.table.rows());
                }
                TopDownIterator::new(rows)
            }
        };
        Ok(Answers { mode, rows })
    }
}

/// Answers of one query, tagged with the strategy that produced them.
#[derive(Debug)]
pub struct Answers {
    pub mode: ReasoningMode,
    rows: TopDownIterator,
}

impl Iterator for Answers {
    type Item = Vec<Term>;

    fn next(&mut self) -> Option<Vec<Term>> {
        self.rows.next()
    }
}

fn estimate_literal(
    literal: &Literal,
    program: &Program,
    edb: &dyn EdbLayer,
    depth: usize,
    memo: &mut HashMap<(PredId, usize), u64>,
) -> u64 {
    if literal.predicate.is_edb() {
        return edb.estimate(literal, 0, usize::MAX) as u64;
    }
    if depth == 0 {
        return 1;
    }
    let key = (literal.predicate.id, depth);
    if let Some(&cached) = memo.get(&key) {
        return cached;
    }
    let mut total: u64 = 0;
    for rule in program.rules_for(literal.predicate.id) {
        let mut product: u64 = 1;
        for body in &rule.body {
            product = product.saturating_mul(estimate_literal(body, program, edb, depth - 1, memo));
        }
        total = total.saturating_add(product);
    }
    memo.insert(key, total);
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edb::InMemoryEdb;
    use crate::model::builders::{atom, rule, var};
    use crate::model::PredKind;

    fn copy_program(n_facts: u64) -> (Program, Arc<InMemoryEdb>, Literal) {
        let mut program = Program::new();
        let base = program.register_predicate("base", 1, PredKind::Edb).unwrap();
        let view = program.register_predicate("view", 1, PredKind::Idb).unwrap();
        let base_p = program.predicate(base);
        let view_p = program.predicate(view);
        program
            .add_rule(rule(
                atom(view_p, vec![var(0)]),
                vec![atom(base_p, vec![var(0)])],
            ))
            .unwrap();
        let mut edb = InMemoryEdb::new();
        for i in 0..n_facts {
            edb.add_fact(base, vec![i]);
        }
        let query = atom(view_p, vec![var(0)]);
        (program, Arc::new(edb), query)
    }

    #[test]
    fn test_threshold_dispatch() {
        let reasoner = Reasoner::new(100);

        let (program, edb, query) = copy_program(50);
        assert_eq!(reasoner.estimate(&query, &program, edb.as_ref()), 50);
        assert_eq!(
            reasoner.choose_mode(&query, &program, edb.as_ref()),
            ReasoningMode::Magic
        );

        let (program, edb, query) = copy_program(10_000);
        assert_eq!(
            reasoner.choose_mode(&query, &program, edb.as_ref()),
            ReasoningMode::TopDown
        );
    }

    #[test]
    fn test_recursive_estimate_terminates() {
        let mut program = Program::new();
        let edge = program.register_predicate("edge", 2, PredKind::Edb).unwrap();
        let tc = program.register_predicate("tc", 2, PredKind::Idb).unwrap();
        let edge_p = program.predicate(edge);
        let tc_p = program.predicate(tc);
        program
            .add_rule(rule(
                atom(tc_p, vec![var(0), var(1)]),
                vec![atom(edge_p, vec![var(0), var(1)])],
            ))
            .unwrap();
        program
            .add_rule(rule(
                atom(tc_p, vec![var(0), var(2)]),
                vec![
                    atom(tc_p, vec![var(0), var(1)]),
                    atom(edge_p, vec![var(1), var(2)]),
                ],
            ))
            .unwrap();
        let mut edb = InMemoryEdb::new();
        edb.add_facts(edge, vec![vec![1, 2], vec![2, 3]]);

        let reasoner = Reasoner::new(10);
        let query = atom(tc_p, vec![var(0), var(1)]);
        let estimate = reasoner.estimate(&query, &program, &edb);
        assert!(estimate > 0);
    }
}
