//! # EDB Facade
//!
//! The engine never owns ground facts; it pulls them through [`EdbLayer`],
//! which resolves an extensional atom to tuple blocks, reports cardinality
//! estimates, and maps term ids back to text. [`InMemoryEdb`] is the
//! reference implementation used by the binary and the test suites; the
//! engine only sees the trait.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::model::{Literal, PredId, Term};
use crate::table::internal::InternalTable;

/// Extensional database facade consumed by the engine.
///
/// `fetch` may perform I/O; it is always called outside predicate locks.
pub trait EdbLayer: Send + Sync {
    /// Resolve an extensional atom to its tuple blocks. EDB facts belong to
    /// iteration 0, so any range with `min > 0` is empty.
    fn fetch(&self, literal: &Literal, min: usize, max: usize) -> EngineResult<Vec<InternalTable>>;

    /// Upper-bound estimate of the number of matching tuples.
    fn estimate(&self, literal: &Literal, min: usize, max: usize) -> usize;

    /// Dictionary lookup for a term id.
    fn dict_lookup(&self, term: Term) -> Option<String>;
}

/// Bidirectional string/term-id dictionary.
///
/// Ids are dense and handed out in encoding order; id 0 is valid.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    texts: Vec<String>,
    ids: HashMap<String, Term>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Intern `text`, returning its id.
    pub fn encode(&mut self, text: &str) -> Term {
        if let Some(&id) = self.ids.get(text) {
            return id;
        }
        let id = self.texts.len() as Term;
        self.texts.push(text.to_string());
        self.ids.insert(text.to_string(), id);
        id
    }

    pub fn decode(&self, term: Term) -> Option<&str> {
        self.texts.get(term as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// In-memory EDB: one row set per predicate plus the dictionary.
#[derive(Debug, Default)]
pub struct InMemoryEdb {
    relations: HashMap<PredId, Vec<Vec<Term>>>,
    dict: Dictionary,
}

impl InMemoryEdb {
    pub fn new() -> Self {
        InMemoryEdb::default()
    }

    /// Add one ground fact.
    pub fn add_fact(&mut self, pred: PredId, row: Vec<Term>) {
        self.relations.entry(pred).or_default().push(row);
    }

    pub fn add_facts(&mut self, pred: PredId, rows: Vec<Vec<Term>>) {
        self.relations.entry(pred).or_default().extend(rows);
    }

    /// Intern a text term.
    pub fn encode(&mut self, text: &str) -> Term {
        self.dict.encode(text)
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    fn matching_rows(&self, literal: &Literal) -> Vec<Vec<Term>> {
        let constants = literal.constant_positions();
        let pairs = literal.repeated_var_pairs();
        self.relations
            .get(&literal.predicate.id)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        constants.iter().all(|&(i, v)| row[i] == v)
                            && pairs.iter().all(|&(a, b)| row[a] == row[b])
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl EdbLayer for InMemoryEdb {
    fn fetch(&self, literal: &Literal, min: usize, _max: usize) -> EngineResult<Vec<InternalTable>> {
        if min > 0 {
            return Ok(Vec::new());
        }
        let rows = self.matching_rows(literal);
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![InternalTable::from_rows(literal.arity(), rows)])
    }

    fn estimate(&self, literal: &Literal, min: usize, _max: usize) -> usize {
        if min > 0 {
            return 0;
        }
        self.matching_rows(literal).len()
    }

    fn dict_lookup(&self, term: Term) -> Option<String> {
        self.dict.decode(term).map(str::to_string)
    }
}

/// An EDB overlay that adds seed relations (magic seeds) on top of a base
/// layer without mutating it.
pub struct SeededEdb {
    base: Arc<dyn EdbLayer>,
    seeds: HashMap<PredId, Vec<Vec<Term>>>,
}

impl SeededEdb {
    pub fn new(base: Arc<dyn EdbLayer>, seeds: HashMap<PredId, Vec<Vec<Term>>>) -> Self {
        SeededEdb { base, seeds }
    }
}

impl EdbLayer for SeededEdb {
    fn fetch(&self, literal: &Literal, min: usize, max: usize) -> EngineResult<Vec<InternalTable>> {
        match self.seeds.get(&literal.predicate.id) {
            Some(rows) => {
                if min > 0 || rows.is_empty() {
                    return Ok(Vec::new());
                }
                let constants = literal.constant_positions();
                let pairs = literal.repeated_var_pairs();
                let rows: Vec<Vec<Term>> = rows
                    .iter()
                    .filter(|row| {
                        constants.iter().all(|&(i, v)| row[i] == v)
                            && pairs.iter().all(|&(a, b)| row[a] == row[b])
                    })
                    .cloned()
                    .collect();
                if rows.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![InternalTable::from_rows(literal.arity(), rows)])
            }
            None => self.base.fetch(literal, min, max),
        }
    }

    fn estimate(&self, literal: &Literal, min: usize, max: usize) -> usize {
        match self.seeds.get(&literal.predicate.id) {
            Some(rows) => {
                if min > 0 {
                    0
                } else {
                    rows.len()
                }
            }
            None => self.base.estimate(literal, min, max),
        }
    }

    fn dict_lookup(&self, term: Term) -> Option<String> {
        self.base.dict_lookup(term)
    }
}

/// Map a term to its dictionary text, surfacing a miss as an error so that
/// callers can decide whether to fall back to the numeric id.
pub fn term_text(edb: &dyn EdbLayer, term: Term) -> EngineResult<String> {
    edb.dict_lookup(term).ok_or(EngineError::DictMiss(term))
}
