//! Semi-Naive Saturation Tests
//!
//! End-to-end materialisation scenarios for the sequential driver:
//! - Transitive closure and recursive saturation
//! - Pure projection fast path (block cloning)
//! - Empty-atom short circuit
//! - Set semantics, monotonicity, fixpoint, determinism

use std::collections::HashSet;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use fixlog::table::internal::InternalTable;
use fixlog::{
    EdbLayer, EngineError, EngineOptions, EngineResult, InMemoryEdb, Literal, PredId, PredKind,
    Program, SemiNaiveEngine, Term,
};
use fixlog::model::builders::{atom, cst, rule, var};

// ============================================================================
// Test Helpers
// ============================================================================

/// Transitive-closure program over an edge list.
fn tc_setup(edges: &[(Term, Term)]) -> (Arc<Program>, Arc<InMemoryEdb>, PredId, PredId) {
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
    for &(a, b) in edges {
        edb.add_fact(edge, vec![a, b]);
    }
    (Arc::new(program), Arc::new(edb), edge, tc)
}

fn run_engine(
    program: &Arc<Program>,
    edb: &Arc<InMemoryEdb>,
    opts: EngineOptions,
) -> SemiNaiveEngine {
    let edb: Arc<dyn fixlog::EdbLayer> = Arc::clone(edb) as Arc<dyn fixlog::EdbLayer>;
    let engine = SemiNaiveEngine::new(Arc::clone(program), edb, opts).unwrap();
    engine.run().unwrap();
    engine
}

/// All rows of one predicate, in block order.
fn all_rows(engine: &SemiNaiveEngine, pred: PredId) -> Vec<Vec<Term>> {
    engine
        .table(pred)
        .flat_map(|b| b.table.rows().collect::<Vec<_>>())
        .collect()
}

fn row_set(engine: &SemiNaiveEngine, pred: PredId) -> HashSet<Vec<Term>> {
    all_rows(engine, pred).into_iter().collect()
}

// ============================================================================
// Transitive Closure
// ============================================================================

#[test]
fn test_transitive_closure_chain() {
    let (program, edb, _, tc) = tc_setup(&[(1, 2), (2, 3), (3, 4)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());

    let expected: HashSet<Vec<Term>> = [
        vec![1, 2],
        vec![2, 3],
        vec![3, 4],
        vec![1, 3],
        vec![2, 4],
        vec![1, 4],
    ]
    .into_iter()
    .collect();
    assert_eq!(row_set(&engine, tc), expected);
    assert_eq!(engine.count_all_idb(), 6);
}

#[test]
fn test_recursive_rule_saturates() {
    // Chain of 10 edges over 11 nodes: closure has 10+9+...+1 = 55 pairs.
    let edges: Vec<(Term, Term)> = (0..10).map(|i| (i, i + 1)).collect();
    let (program, edb, _, tc) = tc_setup(&edges);
    let engine = run_engine(&program, &edb, EngineOptions::default());
    assert_eq!(engine.count_all_idb(), 55);

    // The recursive rule (id 1) ran repeatedly until it stopped deriving.
    let stats = engine.rule_stats();
    let recursive_runs: Vec<_> = stats.iter().filter(|s| s.rule_id == 1).collect();
    assert!(recursive_runs.len() >= 9, "saturation needs repeated runs");
    assert!(!recursive_runs.last().unwrap().derived);
    assert_eq!(row_set(&engine, tc).len(), 55);
}

#[test]
fn test_cyclic_graph_terminates() {
    let (program, edb, _, tc) = tc_setup(&[(1, 2), (2, 3), (3, 1)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());
    // Every ordered pair over the cycle, self-loops included.
    assert_eq!(row_set(&engine, tc).len(), 9);
}

// ============================================================================
// First-Atom Fast Path
// ============================================================================

#[test]
fn test_pure_projection_clones_block() {
    // q(X, Y) :- p(X, Y). with empty q and non-empty p: a single block is
    // appended whose backing table is shared with p's, no row copies.
    let mut program = Program::new();
    let p = program.register_predicate("p", 2, PredKind::Edb).unwrap();
    let q = program.register_predicate("q", 2, PredKind::Idb).unwrap();
    let p_pred = program.predicate(p);
    let q_pred = program.predicate(q);
    program
        .add_rule(rule(
            atom(q_pred, vec![var(0), var(1)]),
            vec![atom(p_pred, vec![var(0), var(1)])],
        ))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(p, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());

    let q_blocks: Vec<_> = engine.table(q).collect();
    assert_eq!(q_blocks.len(), 1);
    assert_eq!(q_blocks[0].table.n_rows(), 3);
    assert_eq!(q_blocks[0].rule_id, Some(0));

    // Zero-copy: the block shares p's backing table.
    let p_blocks: Vec<_> = engine.table(p).collect();
    assert!(Arc::ptr_eq(&q_blocks[0].table, &p_blocks[0].table));
}

#[test]
fn test_projection_with_swapped_columns_materialises() {
    // q(Y, X) :- p(X, Y). is not a pure projection; rows are rebuilt.
    let mut program = Program::new();
    let p = program.register_predicate("p", 2, PredKind::Edb).unwrap();
    let q = program.register_predicate("q", 2, PredKind::Idb).unwrap();
    let p_pred = program.predicate(p);
    let q_pred = program.predicate(q);
    program
        .add_rule(rule(
            atom(q_pred, vec![var(1), var(0)]),
            vec![atom(p_pred, vec![var(0), var(1)])],
        ))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(p, vec![vec![1, 2], vec![3, 4]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    let expected: HashSet<Vec<Term>> = [vec![2, 1], vec![4, 3]].into_iter().collect();
    assert_eq!(row_set(&engine, q), expected);
}

// ============================================================================
// Empty Atoms and Ground Heads
// ============================================================================

#[test]
fn test_empty_edb_atom_derives_nothing() {
    // r(X) :- p(X), empty(X). with empty never populated.
    let mut program = Program::new();
    let p = program.register_predicate("p", 1, PredKind::Edb).unwrap();
    let e = program.register_predicate("empty", 1, PredKind::Edb).unwrap();
    let _ = e;
    let r = program.register_predicate("r", 1, PredKind::Idb).unwrap();
    let p_pred = program.predicate(p);
    let e_pred = program.predicate(e);
    let r_pred = program.predicate(r);
    program
        .add_rule(rule(
            atom(r_pred, vec![var(0)]),
            vec![atom(p_pred, vec![var(0)]), atom(e_pred, vec![var(0)])],
        ))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(p, vec![vec![1], vec![2]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    assert_eq!(engine.count_all_idb(), 0);
    assert!(engine.table(r).is_empty());
}

#[test]
fn test_ground_head_derived_once() {
    // flag(7) :- p(X). fires once and is then skipped.
    let mut program = Program::new();
    let p = program.register_predicate("p", 1, PredKind::Edb).unwrap();
    let f = program.register_predicate("flag", 1, PredKind::Idb).unwrap();
    let p_pred = program.predicate(p);
    let f_pred = program.predicate(f);
    program
        .add_rule(rule(atom(f_pred, vec![cst(7)]), vec![atom(p_pred, vec![var(0)])]))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(p, vec![vec![1], vec![2], vec![3]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    assert_eq!(all_rows(&engine, f), vec![vec![7]]);
}

#[test]
fn test_existence_join_with_constant_head() {
    // both(9) :- p(X), q(Y). derives iff both relations are non-empty.
    let mut program = Program::new();
    let p = program.register_predicate("p", 1, PredKind::Edb).unwrap();
    let q = program.register_predicate("q", 1, PredKind::Edb).unwrap();
    let both = program.register_predicate("both", 1, PredKind::Idb).unwrap();
    let p_pred = program.predicate(p);
    let q_pred = program.predicate(q);
    let both_pred = program.predicate(both);
    program
        .add_rule(rule(
            atom(both_pred, vec![cst(9)]),
            vec![atom(p_pred, vec![var(0)]), atom(q_pred, vec![var(1)])],
        ))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(p, vec![vec![1], vec![2]]);
    edb.add_facts(q, vec![vec![5]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    assert_eq!(all_rows(&engine, both), vec![vec![9]]);
}

#[test]
fn test_repeated_variable_atom() {
    // diag(X) :- edge(X, X).
    let mut program = Program::new();
    let edge = program.register_predicate("edge", 2, PredKind::Edb).unwrap();
    let d = program.register_predicate("diag", 1, PredKind::Idb).unwrap();
    let edge_p = program.predicate(edge);
    let d_p = program.predicate(d);
    program
        .add_rule(rule(
            atom(d_p, vec![var(0)]),
            vec![atom(edge_p, vec![var(0), var(0)])],
        ))
        .unwrap();
    let mut edb = InMemoryEdb::new();
    edb.add_facts(edge, vec![vec![1, 1], vec![1, 2], vec![3, 3]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    let expected: HashSet<Vec<Term>> = [vec![1], vec![3]].into_iter().collect();
    assert_eq!(row_set(&engine, d), expected);
}

// ============================================================================
// Universal Invariants
// ============================================================================

#[test]
fn test_set_semantics_across_rules() {
    // Diamond: (1,4) is derivable through 2 and through 3, but appears once.
    let (program, edb, _, tc) = tc_setup(&[(1, 2), (1, 3), (2, 4), (3, 4)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());

    let rows = all_rows(&engine, tc);
    let unique: HashSet<_> = rows.iter().cloned().collect();
    assert_eq!(rows.len(), unique.len(), "duplicate rows across blocks");
    assert_eq!(unique.len(), 5);
    assert!(unique.contains(&vec![1, 4]));
}

#[test]
fn test_block_iterations_monotone() {
    let (program, edb, _, tc) = tc_setup(&[(1, 2), (2, 3), (3, 4), (4, 5)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());

    let blocks: Vec<_> = engine.table(tc).collect();
    assert!(!blocks.is_empty());
    for pair in blocks.windows(2) {
        assert!(pair[0].iteration <= pair[1].iteration);
    }
    for block in &blocks {
        assert!(block.table.n_rows() > 0, "empty blocks are never appended");
    }
}

#[test]
fn test_fixpoint_is_stable() {
    let (program, edb, _, _) = tc_setup(&[(1, 2), (2, 3), (3, 4)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());
    let before = engine.count_all_idb();

    // One further full pass over all rules derives nothing new.
    engine.run_from(0, engine.current_iteration()).unwrap();
    assert_eq!(engine.count_all_idb(), before);
}

#[test]
fn test_sequential_runs_are_deterministic() {
    let edges: Vec<(Term, Term)> = vec![(1, 2), (2, 3), (3, 4), (2, 5), (5, 6), (1, 6)];
    let (program, edb, _, tc) = tc_setup(&edges);

    let first = run_engine(&program, &edb, EngineOptions::default());
    let second = run_engine(&program, &edb, EngineOptions::default());

    let a: Vec<_> = first.table(tc).collect();
    let b: Vec<_> = second.table(tc).collect();
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.iteration, y.iteration);
        assert_eq!(x.rule_id, y.rule_id);
        assert_eq!(x.plan_index, y.plan_index);
        assert_eq!(
            x.table.rows().collect::<Vec<_>>(),
            y.table.rows().collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_estimates_are_upper_bounds() {
    let (program, edb, _, tc) = tc_setup(&[(1, 2), (2, 3), (3, 4)]);
    let engine = run_engine(&program, &edb, EngineOptions::default());

    let tc_pred = program.predicate(tc);
    let all = fixlog::Literal::most_general(tc_pred);
    let actual = row_set(&engine, tc).len();
    assert!(engine.estimate_cardinality(&all, 0, usize::MAX) >= actual);

    // Filtered estimate bounds the filtered rows.
    let bound = atom(tc_pred, vec![cst(1), var(0)]);
    let matching = row_set(&engine, tc).iter().filter(|r| r[0] == 1).count();
    assert!(engine.estimate_cardinality(&bound, 0, usize::MAX) >= matching);
}

// ============================================================================
// Run-State Observers
// ============================================================================

/// EDB layer that parks the first fetch until the test releases it, so the
/// test can observe the engine mid-run.
struct GatedEdb {
    inner: InMemoryEdb,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl EdbLayer for GatedEdb {
    fn fetch(&self, literal: &Literal, min: usize, max: usize) -> EngineResult<Vec<InternalTable>> {
        let _ = self.entered.send(());
        let _ = self.release.lock().unwrap().recv();
        self.inner.fetch(literal, min, max)
    }

    fn estimate(&self, literal: &Literal, min: usize, max: usize) -> usize {
        self.inner.estimate(literal, min, max)
    }

    fn dict_lookup(&self, term: Term) -> Option<String> {
        self.inner.dict_lookup(term)
    }
}

#[test]
fn test_is_running_during_and_after_run() {
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

    let mut inner = InMemoryEdb::new();
    inner.add_facts(edge, vec![vec![1, 2], vec![2, 3]]);
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let edb = GatedEdb {
        inner,
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };

    let engine = Arc::new(
        SemiNaiveEngine::new(Arc::new(program), Arc::new(edb), EngineOptions::default()).unwrap(),
    );
    assert!(!engine.is_running());

    let worker = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.run())
    };

    // The run is parked inside the EDB fetch.
    entered_rx.recv().unwrap();
    assert!(engine.is_running());
    release_tx.send(()).unwrap();

    worker.join().unwrap().unwrap();
    assert!(!engine.is_running());
    assert_eq!(engine.count_all_idb(), 2);
}

#[test]
fn test_running_flag_cleared_after_failed_run() {
    struct FailingEdb;

    impl EdbLayer for FailingEdb {
        fn fetch(&self, literal: &Literal, _min: usize, _max: usize) -> EngineResult<Vec<InternalTable>> {
            Err(EngineError::EdbFetch {
                predicate: literal.predicate.id,
                message: "backend offline".to_string(),
            })
        }

        fn estimate(&self, _literal: &Literal, _min: usize, _max: usize) -> usize {
            1
        }

        fn dict_lookup(&self, _term: Term) -> Option<String> {
            None
        }
    }

    let mut program = Program::new();
    let src = program.register_predicate("src", 1, PredKind::Edb).unwrap();
    let out = program.register_predicate("out", 1, PredKind::Idb).unwrap();
    let src_p = program.predicate(src);
    let out_p = program.predicate(out);
    program
        .add_rule(rule(atom(out_p, vec![var(0)]), vec![atom(src_p, vec![var(0)])]))
        .unwrap();

    let engine =
        SemiNaiveEngine::new(Arc::new(program), Arc::new(FailingEdb), EngineOptions::default())
            .unwrap();
    assert!(matches!(engine.run(), Err(EngineError::EdbFetch { .. })));
    assert!(!engine.is_running());
    assert_eq!(engine.count_all_idb(), 0);
}

// ============================================================================
// Multi-Predicate Programs
// ============================================================================

#[test]
fn test_stratified_chain_of_views() {
    // b(X, Y) :- edge(X, Y). tc over b, then t(X) :- tc(X, 4).
    let mut program = Program::new();
    let edge = program.register_predicate("edge", 2, PredKind::Edb).unwrap();
    let b = program.register_predicate("b", 2, PredKind::Idb).unwrap();
    let tc = program.register_predicate("tc", 2, PredKind::Idb).unwrap();
    let t = program.register_predicate("t", 1, PredKind::Idb).unwrap();
    let edge_p = program.predicate(edge);
    let b_p = program.predicate(b);
    let tc_p = program.predicate(tc);
    let t_p = program.predicate(t);
    program
        .add_rule(rule(
            atom(b_p, vec![var(0), var(1)]),
            vec![atom(edge_p, vec![var(0), var(1)])],
        ))
        .unwrap();
    program
        .add_rule(rule(
            atom(tc_p, vec![var(0), var(1)]),
            vec![atom(b_p, vec![var(0), var(1)])],
        ))
        .unwrap();
    program
        .add_rule(rule(
            atom(tc_p, vec![var(0), var(2)]),
            vec![
                atom(tc_p, vec![var(0), var(1)]),
                atom(b_p, vec![var(1), var(2)]),
            ],
        ))
        .unwrap();
    program
        .add_rule(rule(
            atom(t_p, vec![var(0)]),
            vec![atom(tc_p, vec![var(0), cst(4)])],
        ))
        .unwrap();

    let mut edb = InMemoryEdb::new();
    edb.add_facts(edge, vec![vec![1, 2], vec![2, 3], vec![3, 4]]);

    let engine = run_engine(&Arc::new(program), &Arc::new(edb), EngineOptions::default());
    let expected: HashSet<Vec<Term>> = [vec![1], vec![2], vec![3]].into_iter().collect();
    assert_eq!(row_set(&engine, t), expected);
    assert_eq!(row_set(&engine, tc).len(), 6);
}

#[test]
fn test_filtering_toggles_agree() {
    let edges: Vec<(Term, Term)> = vec![(1, 2), (2, 3), (3, 4), (4, 5), (1, 5)];
    let (program, edb, _, tc) = tc_setup(&edges);

    let with = run_engine(&program, &edb, EngineOptions::default());
    let without = run_engine(
        &program,
        &edb,
        EngineOptions {
            opt_filtering: false,
            opt_intersect: false,
            ..EngineOptions::default()
        },
    );
    assert_eq!(row_set(&with, tc), row_set(&without, tc));
}
