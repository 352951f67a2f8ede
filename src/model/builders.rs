//! Construction helpers for literals and rules.
//!
//! Rule bodies are verbose to spell out by hand; these shorthands keep
//! tests and the text frontend readable.

use super::{Literal, Predicate, Rule, Term, TermOrVar, Var};

/// A variable slot.
pub fn var(v: Var) -> TermOrVar {
    TermOrVar::Var(v)
}

/// A constant slot.
pub fn cst(t: Term) -> TermOrVar {
    TermOrVar::Const(t)
}

/// An atom over `predicate`.
pub fn atom(predicate: Predicate, tuple: Vec<TermOrVar>) -> Literal {
    Literal::new(predicate, tuple)
}

/// A rule `head :- body`.
pub fn rule(head: Literal, body: Vec<Literal>) -> Rule {
    Rule::new(head, body)
}
