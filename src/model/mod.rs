//! # Data Model
//!
//! Terms, predicates, literals, rules and programs.
//!
//! Everything the engine joins over is a dictionary-encoded 64-bit [`Term`];
//! no strings flow through the evaluation pipeline. Predicates live in a
//! dense id space bounded by [`MAX_PREDICATES`], which lets per-predicate
//! state (fact tables, locks) be plain indexed arrays.

use std::collections::HashMap;

pub mod builders;

/// A dictionary-encoded ground term.
pub type Term = u64;

/// A rule variable. Variables are small integers local to one rule.
pub type Var = u8;

/// Dense predicate identifier.
pub type PredId = usize;

/// Upper bound of the predicate id space.
///
/// Per-predicate structures (fact tables, read/write locks) are allocated as
/// dense arrays of this size.
pub const MAX_PREDICATES: usize = 2048;

/// Whether a predicate is extensional (stored facts) or intensional
/// (defined by rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredKind {
    Edb,
    Idb,
}

/// A predicate: identity, arity, EDB/IDB classification and a flag for
/// magic predicates introduced by the demand rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub id: PredId,
    pub arity: usize,
    pub kind: PredKind,
    pub magic: bool,
}

impl Predicate {
    pub fn is_edb(&self) -> bool {
        self.kind == PredKind::Edb
    }

    pub fn is_idb(&self) -> bool {
        self.kind == PredKind::Idb
    }
}

/// One slot of a literal tuple: a rule variable or a constant term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermOrVar {
    Var(Var),
    Const(Term),
}

impl TermOrVar {
    pub fn is_var(&self) -> bool {
        matches!(self, TermOrVar::Var(_))
    }
}

/// An atom: a predicate applied to a tuple of variables and constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    pub predicate: Predicate,
    pub tuple: Vec<TermOrVar>,
}

impl Literal {
    pub fn new(predicate: Predicate, tuple: Vec<TermOrVar>) -> Self {
        debug_assert_eq!(predicate.arity, tuple.len());
        Literal { predicate, tuple }
    }

    /// The most general literal over a predicate: distinct variables in
    /// every position. Used to wrap freshly loaded EDB tables.
    pub fn most_general(predicate: Predicate) -> Self {
        let tuple = (0..predicate.arity).map(|i| TermOrVar::Var(i as Var)).collect();
        Literal { predicate, tuple }
    }

    pub fn arity(&self) -> usize {
        self.tuple.len()
    }

    /// Number of variable slots (counting repetitions).
    pub fn n_vars(&self) -> usize {
        self.tuple.iter().filter(|t| t.is_var()).count()
    }

    /// Number of distinct variables.
    pub fn n_unique_vars(&self) -> usize {
        self.all_vars().len()
    }

    /// Distinct variables in first-occurrence order.
    pub fn all_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        for t in &self.tuple {
            if let TermOrVar::Var(v) = t {
                if !vars.contains(v) {
                    vars.push(*v);
                }
            }
        }
        vars
    }

    /// Variables this literal shares with `other_vars`.
    pub fn shared_vars(&self, other_vars: &[Var]) -> Vec<Var> {
        self.all_vars()
            .into_iter()
            .filter(|v| other_vars.contains(v))
            .collect()
    }

    /// Positions holding constants, with their values.
    pub fn constant_positions(&self) -> Vec<(usize, Term)> {
        self.tuple
            .iter()
            .enumerate()
            .filter_map(|(i, t)| match t {
                TermOrVar::Const(c) => Some((i, *c)),
                TermOrVar::Var(_) => None,
            })
            .collect()
    }

    /// Column pairs `(first_occurrence, later_occurrence)` for every
    /// variable appearing more than once.
    pub fn repeated_var_pairs(&self) -> Vec<(usize, usize)> {
        let mut first_at: HashMap<Var, usize> = HashMap::new();
        let mut pairs = Vec::new();
        for (i, t) in self.tuple.iter().enumerate() {
            if let TermOrVar::Var(v) = t {
                match first_at.get(v) {
                    Some(&f) => pairs.push((f, i)),
                    None => {
                        first_at.insert(*v, i);
                    }
                }
            }
        }
        pairs
    }

    /// True when both literals bind the same variable at every position,
    /// with no constants. A head with the same variable sequence as its
    /// only body atom is a pure projection and its table can be cloned
    /// wholesale.
    pub fn same_var_sequence_as(&self, other: &Literal) -> bool {
        self.tuple.len() == other.tuple.len()
            && self
                .tuple
                .iter()
                .zip(other.tuple.iter())
                .all(|(a, b)| match (a, b) {
                    (TermOrVar::Var(x), TermOrVar::Var(y)) => x == y,
                    _ => false,
                })
    }

    /// True when every slot is a distinct variable.
    pub fn is_most_general(&self) -> bool {
        self.n_unique_vars() == self.tuple.len()
    }
}

/// A Horn clause: one head literal and a non-empty body of positive atoms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub head: Literal,
    pub body: Vec<Literal>,
}

impl Rule {
    pub fn new(head: Literal, body: Vec<Literal>) -> Self {
        debug_assert!(!body.is_empty());
        Rule { head, body }
    }

    /// A rule is recursive when its head predicate occurs in its body.
    pub fn is_recursive(&self) -> bool {
        self.body.iter().any(|l| l.predicate.id == self.head.predicate.id)
    }

    /// Number of intensional body atoms.
    pub fn n_idb_body(&self) -> usize {
        self.body.iter().filter(|l| l.predicate.is_idb()).count()
    }

    /// True when every body atom is extensional. Such rules run once,
    /// during the bootstrap phase.
    pub fn is_edb_only(&self) -> bool {
        self.n_idb_body() == 0
    }

    /// Safety: every head variable must be bound by some body atom.
    pub fn is_safe(&self) -> bool {
        let body_vars: Vec<Var> = self.body.iter().flat_map(|l| l.all_vars()).collect();
        self.head.all_vars().iter().all(|v| body_vars.contains(v))
    }
}

/// A Datalog program: the predicate registry plus the rule set.
///
/// Predicate ids are handed out densely in registration order; names are
/// kept only for diagnostics and persistence. The rule set is read-only
/// once the engine is constructed.
#[derive(Debug, Clone, Default)]
pub struct Program {
    predicates: Vec<PredicateInfo>,
    by_name: HashMap<String, PredId>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct PredicateInfo {
    name: String,
    arity: usize,
    kind: PredKind,
    magic: bool,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Register a predicate, returning its id. Re-registering an existing
    /// name returns the existing id; a conflicting arity is an error.
    pub fn register_predicate(
        &mut self,
        name: &str,
        arity: usize,
        kind: PredKind,
    ) -> Result<PredId, String> {
        self.register_predicate_full(name, arity, kind, false)
    }

    pub fn register_predicate_full(
        &mut self,
        name: &str,
        arity: usize,
        kind: PredKind,
        magic: bool,
    ) -> Result<PredId, String> {
        if arity == 0 {
            return Err(format!("predicate '{name}' must have arity >= 1"));
        }
        if let Some(&id) = self.by_name.get(name) {
            let info = &self.predicates[id];
            if info.arity != arity {
                return Err(format!(
                    "predicate '{}' already registered with arity {}",
                    name, info.arity
                ));
            }
            return Ok(id);
        }
        let id = self.predicates.len();
        if id >= MAX_PREDICATES {
            return Err(format!("predicate space exhausted ({MAX_PREDICATES})"));
        }
        self.predicates.push(PredicateInfo {
            name: name.to_string(),
            arity,
            kind,
            magic,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn predicate(&self, id: PredId) -> Predicate {
        let info = &self.predicates[id];
        Predicate {
            id,
            arity: info.arity,
            kind: info.kind,
            magic: info.magic,
        }
    }

    pub fn predicate_by_name(&self, name: &str) -> Option<Predicate> {
        self.by_name.get(name).map(|&id| self.predicate(id))
    }

    pub fn predicate_name(&self, id: PredId) -> &str {
        &self.predicates[id].name
    }

    pub fn is_idb(&self, id: PredId) -> bool {
        self.predicates[id].kind == PredKind::Idb
    }

    pub fn n_predicates(&self) -> usize {
        self.predicates.len()
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<(), String> {
        if !rule.is_safe() {
            return Err(format!(
                "unsafe rule: head variables of '{}' not bound by the body",
                self.predicate_name(rule.head.predicate.id)
            ));
        }
        if rule.head.predicate.kind != PredKind::Idb {
            return Err(format!(
                "rule head '{}' must be an IDB predicate",
                self.predicate_name(rule.head.predicate.id)
            ));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules whose head is the given predicate.
    pub fn rules_for(&self, pred: PredId) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.head.predicate.id == pred)
            .collect()
    }

    /// Same predicate registry, different rule set. Used by program
    /// rewrites that rename rule heads and bodies in place.
    pub fn with_rules(&self, rules: Vec<Rule>) -> Result<Program, String> {
        let mut program = Program {
            predicates: self.predicates.clone(),
            by_name: self.by_name.clone(),
            rules: Vec::new(),
        };
        for rule in rules {
            program.add_rule(rule)?;
        }
        Ok(program)
    }

    /// Restrict the program to the rules (transitively) reachable from a
    /// root predicate. Predicate ids are preserved.
    pub fn restrict_to(&self, root: PredId) -> Program {
        let mut relevant = vec![false; self.predicates.len()];
        let mut stack = vec![root];
        while let Some(p) = stack.pop() {
            if relevant[p] {
                continue;
            }
            relevant[p] = true;
            for rule in self.rules_for(p) {
                for body in &rule.body {
                    if !relevant[body.predicate.id] {
                        stack.push(body.predicate.id);
                    }
                }
            }
        }
        Program {
            predicates: self.predicates.clone(),
            by_name: self.by_name.clone(),
            rules: self
                .rules
                .iter()
                .filter(|r| relevant[r.head.predicate.id])
                .cloned()
                .collect(),
        }
    }
}
