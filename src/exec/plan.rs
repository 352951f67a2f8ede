//! # Rule Execution Plans
//!
//! A rule with `k` intensional body atoms gets `k` execution plans, one per
//! atom taking the delta role. The delta atom reads `[last_execution, ∞)`,
//! intensional atoms before it read `[0, last_execution-1]`, everything
//! else reads `[0, ∞)`; summed over the plans this enumerates exactly the
//! derivations that touch at least one new fact, without rederiving old
//! combinations.
//!
//! Each plan precomputes, per body atom, the join coordinates against the
//! growing intermediate table, the output position maps, and the local
//! repeated-variable filters, so the executor never inspects literals at
//! run time.

use std::collections::{HashMap, HashSet};

use crate::model::{Literal, Rule, Term, TermOrVar, Var};

/// Symbolic endpoint of an iteration window, resolved against a rule's
/// `last_execution` when the plan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    Zero,
    LastExecution,
    BeforeLastExecution,
    Infinite,
}

/// Iteration window of one body atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationRange {
    pub min: RangeBound,
    pub max: RangeBound,
}

impl IterationRange {
    pub const FULL: IterationRange = IterationRange {
        min: RangeBound::Zero,
        max: RangeBound::Infinite,
    };
    pub const DELTA: IterationRange = IterationRange {
        min: RangeBound::LastExecution,
        max: RangeBound::Infinite,
    };
    pub const BEFORE_DELTA: IterationRange = IterationRange {
        min: RangeBound::Zero,
        max: RangeBound::BeforeLastExecution,
    };

    /// Concrete `[min, max]` window. Plans with `BeforeLastExecution`
    /// bounds only run once `last_execution > 0`.
    pub fn resolve(&self, last_execution: usize) -> (usize, usize) {
        let min = match self.min {
            RangeBound::Zero => 0,
            RangeBound::LastExecution => last_execution,
            RangeBound::BeforeLastExecution => last_execution.saturating_sub(1),
            RangeBound::Infinite => usize::MAX,
        };
        let max = match self.max {
            RangeBound::Zero => 0,
            RangeBound::LastExecution => last_execution,
            RangeBound::BeforeLastExecution => last_execution.saturating_sub(1),
            RangeBound::Infinite => usize::MAX,
        };
        (min, max)
    }

    pub fn is_full(&self) -> bool {
        self.min == RangeBound::Zero && self.max == RangeBound::Infinite
    }
}

/// One body-literal ordering of a rule, with everything the executor needs
/// precomputed per atom.
#[derive(Debug, Clone)]
pub struct RuleExecutionPlan {
    /// Body literals in execution order.
    pub literals: Vec<Literal>,
    /// Iteration window per atom, aligned with `literals`.
    pub ranges: Vec<IterationRange>,
    /// Per atom: equi-join column pairs `(intermediate column, atom column)`.
    pub join_coordinates: Vec<Vec<(usize, usize)>>,
    /// Per atom: output columns taken from the intermediate,
    /// `(output position, intermediate column)`.
    pub pos_from_first: Vec<Vec<(usize, usize)>>,
    /// Per atom: output columns taken from the atom,
    /// `(output position, atom column)`.
    pub pos_from_second: Vec<Vec<(usize, usize)>>,
    /// Width of the output relation after each atom.
    pub output_width: Vec<usize>,
    /// Per atom: column pairs bound to the same variable, not yet
    /// constrained by the intermediate. Rows where they differ are dropped.
    pub matches: Vec<Vec<(usize, usize)>>,
    /// Head positions holding constants, pre-filled in final output rows.
    pub head_constants: Vec<(usize, Term)>,
    cartesian: bool,
}

impl RuleExecutionPlan {
    /// Build a plan for `head :- literals` with the given iteration windows.
    pub fn build(head: &Literal, literals: Vec<Literal>, ranges: Vec<IterationRange>) -> Self {
        debug_assert_eq!(literals.len(), ranges.len());
        let n = literals.len();
        let head_vars = head.all_vars();

        let mut join_coordinates = Vec::with_capacity(n);
        let mut pos_from_first = Vec::with_capacity(n);
        let mut pos_from_second = Vec::with_capacity(n);
        let mut output_width = Vec::with_capacity(n);
        let mut matches = Vec::with_capacity(n);
        let mut head_constants = Vec::new();

        // Variables carried by the intermediate result; index = column.
        let mut inter_vars: Vec<Var> = Vec::new();

        for (i, lit) in literals.iter().enumerate() {
            let last = i == n - 1;

            let coords: Vec<(usize, usize)> = lit
                .tuple
                .iter()
                .enumerate()
                .filter_map(|(p, slot)| match slot {
                    TermOrVar::Var(v) => inter_vars.iter().position(|iv| iv == v).map(|c| (c, p)),
                    TermOrVar::Const(_) => None,
                })
                .collect();
            join_coordinates.push(coords);

            let mut first_at: HashMap<Var, usize> = HashMap::new();
            let mut local_matches = Vec::new();
            for (p, slot) in lit.tuple.iter().enumerate() {
                if let TermOrVar::Var(v) = slot {
                    if inter_vars.contains(v) {
                        continue;
                    }
                    match first_at.get(v) {
                        Some(&f) => local_matches.push((f, p)),
                        None => {
                            first_at.insert(*v, p);
                        }
                    }
                }
            }
            matches.push(local_matches);

            if last {
                let mut pf = Vec::new();
                let mut ps = Vec::new();
                for (h, slot) in head.tuple.iter().enumerate() {
                    match slot {
                        TermOrVar::Const(c) => head_constants.push((h, *c)),
                        TermOrVar::Var(v) => {
                            if let Some(c) = inter_vars.iter().position(|iv| iv == v) {
                                pf.push((h, c));
                            } else if let Some(p) = lit.tuple.iter().position(|s| s == &TermOrVar::Var(*v)) {
                                ps.push((h, p));
                            }
                        }
                    }
                }
                pos_from_first.push(pf);
                pos_from_second.push(ps);
                output_width.push(head.arity());
            } else {
                let mut needed: HashSet<Var> = head_vars.iter().copied().collect();
                for later in &literals[i + 1..] {
                    needed.extend(later.all_vars());
                }
                let mut new_inter: Vec<Var> = Vec::new();
                let mut pf = Vec::new();
                let mut ps = Vec::new();
                for (c, v) in inter_vars.iter().enumerate() {
                    if needed.contains(v) {
                        pf.push((new_inter.len(), c));
                        new_inter.push(*v);
                    }
                }
                for (p, slot) in lit.tuple.iter().enumerate() {
                    if let TermOrVar::Var(v) = slot {
                        if inter_vars.contains(v) || new_inter.contains(v) || !needed.contains(v) {
                            continue;
                        }
                        ps.push((new_inter.len(), p));
                        new_inter.push(*v);
                    }
                }
                // A live intermediate must carry at least one column, even
                // when nothing downstream names a variable; otherwise an
                // existence result would read as an empty table.
                if new_inter.is_empty() {
                    if let Some((c, v)) = inter_vars.first().map(|v| (0usize, *v)) {
                        pf.push((0, c));
                        new_inter.push(v);
                    } else if let Some((p, v)) = lit.tuple.iter().enumerate().find_map(|(p, s)| {
                        match s {
                            TermOrVar::Var(v) => Some((p, *v)),
                            TermOrVar::Const(_) => None,
                        }
                    }) {
                        ps.push((0, p));
                        new_inter.push(v);
                    }
                }
                pos_from_first.push(pf);
                pos_from_second.push(ps);
                output_width.push(new_inter.len());
                inter_vars = new_inter;
            }
        }

        let cartesian = (1..n).any(|i| join_coordinates[i].is_empty());

        RuleExecutionPlan {
            literals,
            ranges,
            join_coordinates,
            pos_from_first,
            pos_from_second,
            output_width,
            matches,
            head_constants,
            cartesian,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.literals.len()
    }

    /// True when some non-first atom shares no variable with the
    /// intermediate built so far.
    pub fn has_cartesian(&self) -> bool {
        self.cartesian
    }

    /// Rebuild the plan with body atoms permuted by `order` (indices into
    /// the current literal list). Iteration windows follow their literal.
    pub fn reorder(&self, order: &[usize], head: &Literal) -> RuleExecutionPlan {
        debug_assert_eq!(order.len(), self.literals.len());
        let literals = order.iter().map(|&i| self.literals[i].clone()).collect();
        let ranges = order.iter().map(|&i| self.ranges[i]).collect();
        RuleExecutionPlan::build(head, literals, ranges)
    }
}

/// Reorder a plan's atoms by observed cardinality: cheapest atom first,
/// then greedily the atom sharing the most variables with the atoms already
/// placed (ties go to the earlier atom in the cardinality order). Keeping
/// variables connected avoids accidental Cartesian products; if the rule's
/// variable graph is disconnected the original order is kept.
pub fn reorder_by_cardinality(
    plan: &RuleExecutionPlan,
    cards: &[usize],
    head: &Literal,
) -> RuleExecutionPlan {
    debug_assert_eq!(cards.len(), plan.literals.len());
    if plan.literals.len() < 2 {
        return plan.clone();
    }

    let mut position_cards: Vec<(usize, usize)> = cards.iter().copied().enumerate().collect();
    position_cards.sort_by_key(|&(_, card)| card);

    let mut ordered: Vec<usize> = vec![position_cards[0].0];
    let mut vars: Vec<Var> = plan.literals[position_cards[0].0].all_vars();
    let mut remaining: Vec<(usize, usize)> = position_cards[1..].to_vec();

    while !remaining.is_empty() {
        let mut saved: Option<usize> = None;
        let mut saved_shared = 0usize;
        for (i, &(atom, _)) in remaining.iter().enumerate() {
            let shared = plan.literals[atom].shared_vars(&vars).len();
            if shared > saved_shared {
                saved_shared = shared;
                saved = Some(i);
            }
        }
        let Some(i) = saved else {
            // Disconnected variable graph; leave the plan alone.
            return plan.clone();
        };
        let (atom, _) = remaining.remove(i);
        vars.extend(plan.literals[atom].all_vars());
        ordered.push(atom);
    }

    if ordered.iter().enumerate().all(|(i, &a)| i == a) {
        return plan.clone();
    }
    tracing::debug!(order = ?ordered, "reordered plan by cardinality");
    plan.reorder(&ordered, head)
}

/// A rule with its precomputed execution plans.
#[derive(Debug, Clone)]
pub struct RuleExecutionDetails {
    pub rule: Rule,
    pub rule_id: usize,
    pub n_idb: usize,
    pub plans: Vec<RuleExecutionPlan>,
}

impl RuleExecutionDetails {
    pub fn new(rule: Rule, rule_id: usize) -> Self {
        let idb_positions: Vec<usize> = rule
            .body
            .iter()
            .enumerate()
            .filter(|(_, l)| l.predicate.is_idb())
            .map(|(i, _)| i)
            .collect();
        let n_idb = idb_positions.len();

        let plans = if idb_positions.is_empty() {
            vec![RuleExecutionPlan::build(
                &rule.head,
                rule.body.clone(),
                vec![IterationRange::FULL; rule.body.len()],
            )]
        } else {
            idb_positions
                .iter()
                .map(|&delta| {
                    let ranges = rule
                        .body
                        .iter()
                        .enumerate()
                        .map(|(j, l)| {
                            if !l.predicate.is_idb() {
                                IterationRange::FULL
                            } else if j < delta {
                                IterationRange::BEFORE_DELTA
                            } else if j == delta {
                                IterationRange::DELTA
                            } else {
                                IterationRange::FULL
                            }
                        })
                        .collect();
                    RuleExecutionPlan::build(&rule.head, rule.body.clone(), ranges)
                })
                .collect()
        };

        RuleExecutionDetails {
            rule,
            rule_id,
            n_idb,
            plans,
        }
    }
}

/// Mutable per-rule scheduling state, separate from the immutable plans so
/// the parallel driver can guard it with a plain mutex.
#[derive(Debug, Default, Clone)]
pub struct RuleRuntime {
    /// Iteration of the rule's previous execution; delta windows start here.
    pub last_execution: usize,
    /// Previous execution found an atom empty on its full range.
    pub failed_empty: bool,
    /// The atom that was empty.
    pub atom_failure: Option<Literal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builders::{atom, cst, rule, var};
    use crate::model::{PredKind, Predicate};

    fn pred(id: usize, arity: usize, kind: PredKind) -> Predicate {
        Predicate {
            id,
            arity,
            kind,
            magic: false,
        }
    }

    fn tc_step() -> Rule {
        // tc(X, Z) :- tc(X, Y), edge(Y, Z).
        let tc = pred(0, 2, PredKind::Idb);
        let edge = pred(1, 2, PredKind::Edb);
        rule(
            atom(tc, vec![var(0), var(2)]),
            vec![
                atom(tc, vec![var(0), var(1)]),
                atom(edge, vec![var(1), var(2)]),
            ],
        )
    }

    #[test]
    fn test_range_resolution() {
        assert_eq!(IterationRange::FULL.resolve(5), (0, usize::MAX));
        assert_eq!(IterationRange::DELTA.resolve(5), (5, usize::MAX));
        assert_eq!(IterationRange::BEFORE_DELTA.resolve(5), (0, 4));
        assert!(IterationRange::FULL.is_full());
        assert!(!IterationRange::DELTA.is_full());
    }

    #[test]
    fn test_one_plan_per_idb_atom() {
        let details = RuleExecutionDetails::new(tc_step(), 0);
        assert_eq!(details.n_idb, 1);
        assert_eq!(details.plans.len(), 1);
        let plan = &details.plans[0];
        assert_eq!(plan.ranges[0], IterationRange::DELTA);
        assert_eq!(plan.ranges[1], IterationRange::FULL);

        // Two IDB atoms: two plans, delta rotating, earlier IDB capped.
        let p = pred(0, 2, PredKind::Idb);
        let q = pred(2, 2, PredKind::Idb);
        let r = rule(
            atom(p, vec![var(0), var(2)]),
            vec![
                atom(p, vec![var(0), var(1)]),
                atom(q, vec![var(1), var(2)]),
            ],
        );
        let details = RuleExecutionDetails::new(r, 1);
        assert_eq!(details.plans.len(), 2);
        assert_eq!(details.plans[0].ranges[0], IterationRange::DELTA);
        assert_eq!(details.plans[0].ranges[1], IterationRange::FULL);
        assert_eq!(details.plans[1].ranges[0], IterationRange::BEFORE_DELTA);
        assert_eq!(details.plans[1].ranges[1], IterationRange::DELTA);
    }

    #[test]
    fn test_join_coordinates_and_position_maps() {
        let details = RuleExecutionDetails::new(tc_step(), 0);
        let plan = &details.plans[0];

        // First atom tc(X, Y): no intermediate yet.
        assert!(plan.join_coordinates[0].is_empty());
        assert!(plan.pos_from_first[0].is_empty());
        // Both X and Y flow into the intermediate.
        assert_eq!(plan.pos_from_second[0], vec![(0, 0), (1, 1)]);
        assert_eq!(plan.output_width[0], 2);

        // Second atom edge(Y, Z): joins on Y = intermediate column 1.
        assert_eq!(plan.join_coordinates[1], vec![(1, 0)]);
        // Head tc(X, Z): X from intermediate col 0, Z from atom col 1.
        assert_eq!(plan.pos_from_first[1], vec![(0, 0)]);
        assert_eq!(plan.pos_from_second[1], vec![(1, 1)]);
        assert_eq!(plan.output_width[1], 2);
        assert!(!plan.has_cartesian());
    }

    #[test]
    fn test_unused_variable_is_projected_away() {
        // h(X) :- p(X, Y), q(X).  Y is dead after the first atom.
        let h = pred(0, 1, PredKind::Idb);
        let p = pred(1, 2, PredKind::Edb);
        let q = pred(2, 1, PredKind::Edb);
        let r = rule(
            atom(h, vec![var(0)]),
            vec![
                atom(p, vec![var(0), var(1)]),
                atom(q, vec![var(0)]),
            ],
        );
        let plan = &RuleExecutionDetails::new(r, 0).plans[0];
        assert_eq!(plan.output_width[0], 1);
        assert_eq!(plan.pos_from_second[0], vec![(0, 0)]);
    }

    #[test]
    fn test_head_constants_and_matches() {
        // h(X, 9) :- p(X, X).
        let h = pred(0, 2, PredKind::Idb);
        let p = pred(1, 2, PredKind::Edb);
        let r = rule(
            atom(h, vec![var(0), cst(9)]),
            vec![atom(p, vec![var(0), var(0)])],
        );
        let plan = &RuleExecutionDetails::new(r, 0).plans[0];
        assert_eq!(plan.head_constants, vec![(1, 9)]);
        assert_eq!(plan.matches[0], vec![(0, 1)]);
        assert_eq!(plan.pos_from_second[0], vec![(0, 0)]);
    }

    #[test]
    fn test_existence_only_intermediate_keeps_a_column() {
        // h(9) :- p(X), q(Y). Nothing downstream needs X, but the
        // intermediate must still carry rows.
        let h = pred(0, 1, PredKind::Idb);
        let p = pred(1, 1, PredKind::Edb);
        let q = pred(2, 1, PredKind::Edb);
        let r = rule(
            atom(h, vec![cst(9)]),
            vec![atom(p, vec![var(0)]), atom(q, vec![var(1)])],
        );
        let plan = &RuleExecutionDetails::new(r, 0).plans[0];
        assert_eq!(plan.output_width[0], 1);
        assert_eq!(plan.pos_from_second[0], vec![(0, 0)]);
        assert_eq!(plan.head_constants, vec![(0, 9)]);
    }

    #[test]
    fn test_cartesian_flag() {
        let h = pred(0, 2, PredKind::Idb);
        let p = pred(1, 1, PredKind::Edb);
        let q = pred(2, 1, PredKind::Edb);
        let r = rule(
            atom(h, vec![var(0), var(1)]),
            vec![atom(p, vec![var(0)]), atom(q, vec![var(1)])],
        );
        let plan = &RuleExecutionDetails::new(r, 0).plans[0];
        assert!(plan.has_cartesian());
    }

    #[test]
    fn test_reorder_by_cardinality_prefers_small_connected() {
        // h(X, Z) :- a(X, Y), b(Y, Z), c(Z).
        let h = pred(0, 2, PredKind::Idb);
        let a = pred(1, 2, PredKind::Edb);
        let b = pred(2, 2, PredKind::Edb);
        let c = pred(3, 1, PredKind::Edb);
        let r = rule(
            atom(h, vec![var(0), var(2)]),
            vec![
                atom(a, vec![var(0), var(1)]),
                atom(b, vec![var(1), var(2)]),
                atom(c, vec![var(2)]),
            ],
        );
        let plan = &RuleExecutionDetails::new(r.clone(), 0).plans[0];

        // c is by far the smallest: start there, then b (shares Z), then a.
        let reordered = reorder_by_cardinality(plan, &[1000, 100, 1], &r.head);
        assert_eq!(reordered.literals[0].predicate.id, c.id);
        assert_eq!(reordered.literals[1].predicate.id, b.id);
        assert_eq!(reordered.literals[2].predicate.id, a.id);
        assert!(!reordered.has_cartesian());

        // Identity order is left alone (same allocation not required,
        // but same literal order).
        let kept = reorder_by_cardinality(plan, &[1, 100, 1000], &r.head);
        assert_eq!(kept.literals[0].predicate.id, a.id);
        assert_eq!(kept.literals[2].predicate.id, c.id);
    }

    #[test]
    fn test_reorder_keeps_disconnected_plans() {
        let h = pred(0, 2, PredKind::Idb);
        let p = pred(1, 1, PredKind::Edb);
        let q = pred(2, 1, PredKind::Edb);
        let r = rule(
            atom(h, vec![var(0), var(1)]),
            vec![atom(p, vec![var(0)]), atom(q, vec![var(1)])],
        );
        let plan = &RuleExecutionDetails::new(r.clone(), 0).plans[0];
        let kept = reorder_by_cardinality(plan, &[50, 1], &r.head);
        assert_eq!(kept.literals[0].predicate.id, p.id);
    }
}
