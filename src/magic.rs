//! # Magic-Set Rewrite
//!
//! Demand-driven rewriting for queries with bound arguments. A query like
//! `tc(1, Y)` against recursive rules would normally materialise the full
//! closure and filter afterwards; the rewrite guards every rule defining
//! the queried predicate with a magic atom seeded from the query's
//! constants, so the fixpoint only derives tuples the query demands.
//!
//! A position is only treated as bound when it is **invariant** across
//! recursion: the same variable sits at that position in the head and in
//! every recursive body atom. A changing position (like the second
//! argument of transitive closure) cannot be restricted by a static guard
//! and is left free. With that restriction a single seed tuple suffices
//! and no magic propagation rules are needed.

use std::collections::HashMap;

use crate::model::{Literal, PredId, PredKind, Program, Rule, Term, TermOrVar};

/// Result of the rewrite: the guarded program, the query re-targeted at
/// the adorned predicate, and the magic seed facts to inject as EDB input.
#[derive(Debug, Clone)]
pub struct MagicRewrite {
    pub program: Program,
    pub query: Literal,
    pub seeds: HashMap<PredId, Vec<Vec<Term>>>,
}

/// Bound/free naming suffix for an adorned predicate, like "bf" or "bbf":
/// one letter per argument position.
fn binding_suffix(arity: usize, bound_positions: &[usize]) -> String {
    (0..arity)
        .map(|i| if bound_positions.contains(&i) { 'b' } else { 'f' })
        .collect()
}

/// Argument positions of `pred` where the head variable reappears at the
/// same position in every recursive body atom. For a non-recursive
/// predicate every position qualifies.
fn invariant_positions(program: &Program, pred: PredId) -> Vec<bool> {
    let arity = program.predicate(pred).arity;
    let mut invariant = vec![true; arity];
    for rule in program.rules_for(pred) {
        for body in &rule.body {
            if body.predicate.id != pred {
                continue;
            }
            for i in 0..arity {
                let same = matches!(
                    (&rule.head.tuple[i], &body.tuple[i]),
                    (TermOrVar::Var(h), TermOrVar::Var(b)) if h == b
                );
                if !same {
                    invariant[i] = false;
                }
            }
        }
    }
    invariant
}

/// Query positions the rewrite can push into the rules: constants sitting
/// at recursion-invariant positions.
fn usable_bound_positions(query: &Literal, invariant: &[bool]) -> Vec<usize> {
    query
        .tuple
        .iter()
        .enumerate()
        .filter(|&(i, slot)| invariant[i] && matches!(slot, TermOrVar::Const(_)))
        .map(|(i, _)| i)
        .collect()
}

/// Rewrite a program for a query literal. Queries without usable bindings
/// (EDB predicate, no constants, no rules, or constants only at variant
/// positions) come back unchanged with no seeds.
pub fn rewrite(query: &Literal, program: &Program) -> Result<MagicRewrite, String> {
    let pred = query.predicate;
    let unchanged = || MagicRewrite {
        program: program.clone(),
        query: query.clone(),
        seeds: HashMap::new(),
    };

    if pred.kind != PredKind::Idb || program.rules_for(pred.id).is_empty() {
        return Ok(unchanged());
    }

    let invariant = invariant_positions(program, pred.id);
    let bound = usable_bound_positions(query, &invariant);
    if bound.is_empty() {
        return Ok(unchanged());
    }

    let mut rewritten = program.clone();
    let base_name = program.predicate_name(pred.id).to_string();
    let suffix = binding_suffix(pred.arity, &bound);
    let adorned_id = rewritten.register_predicate(
        &format!("{base_name}_{suffix}"),
        pred.arity,
        PredKind::Idb,
    )?;
    let magic_id = rewritten.register_predicate_full(
        &format!("magic_{base_name}_{suffix}"),
        bound.len(),
        PredKind::Edb,
        true,
    )?;
    let adorned_pred = rewritten.predicate(adorned_id);
    let magic_pred = rewritten.predicate(magic_id);

    let rename = |lit: &Literal| -> Literal {
        if lit.predicate.id == pred.id {
            Literal::new(adorned_pred, lit.tuple.clone())
        } else {
            lit.clone()
        }
    };

    let mut rules = Vec::new();
    for rule in program.rules() {
        if rule.head.predicate.id == pred.id {
            // Guard the rule with the magic atom over the bound head slots.
            let guard_tuple: Vec<TermOrVar> =
                bound.iter().map(|&i| rule.head.tuple[i]).collect();
            let mut body = vec![Literal::new(magic_pred, guard_tuple)];
            body.extend(rule.body.iter().map(&rename));
            rules.push(Rule::new(rename(&rule.head), body));
        } else {
            rules.push(Rule::new(
                rule.head.clone(),
                rule.body.iter().map(&rename).collect(),
            ));
        }
    }
    let program = rewritten.with_rules(rules)?;

    let seed: Vec<Term> = bound
        .iter()
        .map(|&i| match query.tuple[i] {
            TermOrVar::Const(c) => c,
            TermOrVar::Var(_) => unreachable!("bound positions hold constants"),
        })
        .collect();
    let mut seeds = HashMap::new();
    seeds.insert(magic_id, vec![seed]);

    Ok(MagicRewrite {
        program,
        query: Literal::new(adorned_pred, query.tuple.clone()),
        seeds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builders::{atom, cst, rule, var};

    fn tc_program() -> (Program, PredId, PredId) {
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
        (program, edge, tc)
    }

    #[test]
    fn test_binding_suffix() {
        assert_eq!(binding_suffix(2, &[0]), "bf");
        assert_eq!(binding_suffix(2, &[1]), "fb");
        assert_eq!(binding_suffix(3, &[0, 2]), "bfb");
        assert_eq!(binding_suffix(2, &[]), "ff");
    }

    #[test]
    fn test_invariant_positions_of_transitive_closure() {
        let (program, _, tc) = tc_program();
        // tc(X, Z) :- tc(X, Y), edge(Y, Z): X invariant, second arg not.
        assert_eq!(invariant_positions(&program, tc), vec![true, false]);
    }

    #[test]
    fn test_usable_bound_positions_respect_invariance() {
        let (program, _, tc) = tc_program();
        let tc_p = program.predicate(tc);
        let invariant = invariant_positions(&program, tc);
        // Constant at the invariant position is usable.
        let fwd = atom(tc_p, vec![cst(1), var(0)]);
        assert_eq!(usable_bound_positions(&fwd, &invariant), vec![0]);
        // Constant at the variant position is not.
        let back = atom(tc_p, vec![var(0), cst(1)]);
        assert!(usable_bound_positions(&back, &invariant).is_empty());
    }

    #[test]
    fn test_rewrite_guards_and_seeds() {
        let (program, _, tc) = tc_program();
        let tc_p = program.predicate(tc);
        let query = atom(tc_p, vec![cst(1), var(0)]);

        let rewrite = rewrite(&query, &program).unwrap();
        let adorned = rewrite.query.predicate;
        assert_ne!(adorned.id, tc);
        assert_eq!(rewrite.program.predicate_name(adorned.id), "tc_bf");

        // Both tc rules now carry a magic guard and target the adorned head.
        let guarded: Vec<_> = rewrite.program.rules_for(adorned.id);
        assert_eq!(guarded.len(), 2);
        for r in &guarded {
            assert!(r.body[0].predicate.magic);
        }
        // Recursive body atom renamed too.
        assert!(guarded[1].body.iter().any(|l| l.predicate.id == adorned.id));

        // One seed tuple holding the query constant.
        let (magic_id, seeds) = rewrite.seeds.iter().next().unwrap();
        assert!(rewrite.program.predicate(*magic_id).magic);
        assert_eq!(seeds, &vec![vec![1]]);
    }

    #[test]
    fn test_unbound_query_left_alone() {
        let (program, _, tc) = tc_program();
        let tc_p = program.predicate(tc);
        let query = atom(tc_p, vec![var(0), var(1)]);
        let rewrite = rewrite(&query, &program).unwrap();
        assert!(rewrite.seeds.is_empty());
        assert_eq!(rewrite.query, query);
        assert_eq!(rewrite.program.rules().len(), program.rules().len());
    }

    #[test]
    fn test_variant_position_not_bound() {
        let (program, _, tc) = tc_program();
        let tc_p = program.predicate(tc);
        // Second argument changes across recursion, so tc(X, 3) gains no guard.
        let query = atom(tc_p, vec![var(0), cst(3)]);
        let rewrite = rewrite(&query, &program).unwrap();
        assert!(rewrite.seeds.is_empty());
    }
}
