//! # Semi-Naive Driver
//!
//! Bottom-up materialisation by semi-naive fixpoint. The driver partitions
//! the rule set into EDB-only bootstrap rules and the round-robin ruleset,
//! executes every rule against the delta windows of its execution plans,
//! and saturates recursive rules in an inner loop until a full pass over
//! the rules derives nothing new.
//!
//! ## One rule execution
//!
//! 1. Skip immediately when the head is ground and already derived.
//! 2. Per execution plan: estimate every atom's cardinality in its window
//!    and skip the plan when one is empty; reorder atoms by cardinality and
//!    variable connectivity; stream the first atom (cloning whole blocks
//!    for pure projections), pipe later atoms through the join executor,
//!    and let the final processor write one new block into the head table.
//! 3. Record `last_execution` so the next invocation only sees new facts.
//!
//! The parallel variant in [`parallel`] reuses the same rule execution and
//! adds conflict-free rule batches with per-predicate locks.

pub mod parallel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use crate::edb::EdbLayer;
use crate::error::{EngineError, EngineResult};
use crate::exec::join::execute_join;
use crate::exec::plan::{
    reorder_by_cardinality, RuleExecutionDetails, RuleExecutionPlan, RuleRuntime,
};
use crate::exec::processors::{
    FinalTableJoinProcessor, InterTableJoinProcessor, JoinProcessor,
};
use crate::model::{Literal, PredId, Program, MAX_PREDICATES};
use crate::stats::{log_top_costs, StatIteration};
use crate::table::internal::InternalTable;
use crate::table::{FactBlock, FactIterator, TableStore};

/// Rows per block before a first-atom scan is chunked across threads.
const PARALLEL_SCAN_LIMIT: usize = 1024;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Let the block-level pre-filter intersect iteration ranges instead of
    /// only considering the latest head block.
    pub opt_intersect: bool,
    /// Enable the block-level pre-filter that skips candidate blocks whose
    /// content the head table already absorbed in an earlier step.
    pub opt_filtering: bool,
    /// Threads for intra-rule work (chunked scans, hash-probe).
    pub nthreads: usize,
    /// Threads for inter-rule batches; 1 selects the sequential driver.
    pub inter_rule_threads: usize,
    /// Randomise the rule order instead of the conflict-aware reorder.
    pub shuffle_rules: bool,
    /// Seed for the shuffle, so runs stay reproducible.
    pub shuffle_seed: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            opt_intersect: true,
            opt_filtering: true,
            nthreads: 1,
            inter_rule_threads: 1,
            shuffle_rules: false,
            shuffle_seed: 0,
        }
    }
}

/// How one execution plan ended.
enum PlanOutcome {
    Completed,
    /// A non-final join produced no rows.
    EmptyIntermediate { atom: Literal, full_range: bool },
}

/// The semi-naive materialisation engine.
pub struct SemiNaiveEngine {
    program: Arc<Program>,
    edb: Arc<dyn EdbLayer>,
    store: TableStore,
    rules: Vec<RuleExecutionDetails>,
    edb_rules: Vec<RuleExecutionDetails>,
    runtime: Vec<Mutex<RuleRuntime>>,
    edb_runtime: Vec<Mutex<RuleRuntime>>,
    /// Advisory per-predicate locks for the parallel driver.
    locks: Vec<RwLock<()>>,
    opts: EngineOptions,
    iteration: Mutex<usize>,
    derivations: Mutex<Vec<FactBlock>>,
    stats: Mutex<Vec<StatIteration>>,
    running: AtomicBool,
}

impl SemiNaiveEngine {
    /// Build an engine over a program and an EDB layer. Rules are
    /// partitioned into the EDB bootstrap set and the round-robin set, and
    /// execution plans are precomputed.
    pub fn new(
        program: Arc<Program>,
        edb: Arc<dyn EdbLayer>,
        opts: EngineOptions,
    ) -> EngineResult<Self> {
        let mut rules = Vec::new();
        let mut edb_rules = Vec::new();
        for (id, rule) in program.rules().iter().enumerate() {
            let details = RuleExecutionDetails::new(rule.clone(), id);
            if details.n_idb == 0 {
                edb_rules.push(details);
            } else {
                rules.push(details);
            }
        }

        if opts.shuffle_rules {
            let mut rng = StdRng::seed_from_u64(opts.shuffle_seed);
            rules.shuffle(&mut rng);
        } else if opts.inter_rule_threads > 1 {
            rules = parallel::reorder_for_parallel(rules);
        }

        debug!(
            n_rules = rules.len(),
            n_edb_rules = edb_rules.len(),
            opt_intersect = opts.opt_intersect,
            opt_filtering = opts.opt_filtering,
            "engine constructed"
        );

        let runtime = rules.iter().map(|_| Mutex::new(RuleRuntime::default())).collect();
        let edb_runtime = edb_rules.iter().map(|_| Mutex::new(RuleRuntime::default())).collect();

        Ok(SemiNaiveEngine {
            program,
            edb,
            store: TableStore::new(),
            rules,
            edb_rules,
            runtime,
            edb_runtime,
            locks: (0..MAX_PREDICATES).map(|_| RwLock::new(())).collect(),
            opts,
            iteration: Mutex::new(0),
            derivations: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Saturate the program: bootstrap the EDB rules once, then run the
    /// round-robin until a full pass derives nothing.
    pub fn run(&self) -> EngineResult<()> {
        self.run_from(0, 0)
    }

    /// Saturate starting from explicit counters; used when resuming on top
    /// of tables materialised by an earlier run.
    pub fn run_from(&self, last_execution: usize, iteration: usize) -> EngineResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner(last_execution, iteration);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self, last_execution: usize, iteration: usize) -> EngineResult<()> {
        *self.iteration.lock() = iteration;
        self.derivations.lock().clear();
        self.stats.lock().clear();
        for rt in self.runtime.iter().chain(self.edb_runtime.iter()) {
            let mut rt = rt.lock();
            rt.last_execution = last_execution;
            rt.failed_empty = false;
            rt.atom_failure = None;
        }

        for (i, details) in self.edb_rules.iter().enumerate() {
            let it = self.atomic_iteration();
            let mut derived = Vec::new();
            self.execute_rule(details, &self.edb_runtime[i], it, &mut derived)?;
            self.derivations.lock().extend(derived);
        }

        if !self.rules.is_empty() {
            if self.opts.inter_rule_threads > 1 {
                parallel::execute_until_saturation(self)?;
            } else {
                self.execute_until_saturation()?;
            }
        }

        info!(
            iterations = self.current_iteration(),
            derivations = self.count_all_idb(),
            "saturation finished"
        );
        log_top_costs(&self.stats.lock(), 20);
        Ok(())
    }

    /// Round-robin over the ruleset; recursive rules saturate in place.
    /// Terminates when every rule in a full pass returned no-derivation.
    fn execute_until_saturation(&self) -> EngineResult<()> {
        let n = self.rules.len();
        let mut current = 0usize;
        let mut without_derivation = 0usize;
        loop {
            let derived = self.execute_rule_tracked(current)?;
            if derived {
                if self.rules[current].rule.is_recursive() {
                    let mut rounds = 1usize;
                    while self.execute_rule_tracked(current)? {
                        rounds += 1;
                    }
                    debug!(
                        rule = self.rules[current].rule_id,
                        rounds, "recursive rule saturated"
                    );
                }
                without_derivation = 0;
            } else {
                without_derivation += 1;
            }
            current = (current + 1) % n;
            if without_derivation == n {
                break;
            }
        }
        Ok(())
    }

    /// Execute one rule at a fresh iteration, updating `last_execution`,
    /// the derivation list, and the cost statistics.
    fn execute_rule_tracked(&self, idx: usize) -> EngineResult<bool> {
        let iteration = self.atomic_iteration();
        let start = Instant::now();
        let mut derived_blocks = Vec::new();
        let derived = self.execute_rule(&self.rules[idx], &self.runtime[idx], iteration, &mut derived_blocks)?;
        self.runtime[idx].lock().last_execution = iteration;
        self.derivations.lock().extend(derived_blocks);
        self.stats.lock().push(StatIteration {
            iteration,
            rule_id: self.rules[idx].rule_id,
            time_ms: start.elapsed().as_secs_f64() * 1000.0,
            derived,
        });
        Ok(derived)
    }

    /// Execute one rule: all its plans against the current delta windows.
    /// Returns whether the head table grew at `iteration`; new blocks are
    /// appended to `derived`.
    pub(crate) fn execute_rule(
        &self,
        details: &RuleExecutionDetails,
        runtime: &Mutex<RuleRuntime>,
        iteration: usize,
        derived: &mut Vec<FactBlock>,
    ) -> EngineResult<bool> {
        let head = &details.rule.head;
        let head_pred = head.predicate;
        debug!(iteration, rule = details.rule_id, "executing rule");

        if head.n_vars() == 0 && !self.store.is_empty(head_pred.id) {
            trace!("ground head already derived");
            return Ok(false);
        }

        let (last_execution, prev_failed, prev_atom) = {
            let mut rt = runtime.lock();
            let state = (rt.last_execution, rt.failed_empty, rt.atom_failure.take());
            rt.failed_empty = false;
            state
        };

        // Sticky empty-atom short circuit: the previous execution failed on
        // an atom with a full range, and nothing has appeared since.
        if prev_failed {
            if let Some(atom) = &prev_atom {
                if self.estimate_card_table(atom, 0, usize::MAX)? == 0 {
                    let mut rt = runtime.lock();
                    rt.failed_empty = true;
                    rt.atom_failure = Some(atom.clone());
                    trace!(rule = details.rule_id, "empty atom still empty, skipping");
                    return Ok(false);
                }
            }
        }

        'plans: for (plan_idx, base_plan) in details.plans.iter().enumerate() {
            // Only plan 0 exists before the rule ran once; the other delta
            // decompositions are indistinguishable from it at that point.
            if plan_idx > 0 && last_execution == 0 {
                break;
            }

            let mut cards = Vec::with_capacity(base_plan.n_atoms());
            let mut empty_atom: Option<(Literal, bool)> = None;
            for (i, lit) in base_plan.literals.iter().enumerate() {
                let (min, max) = base_plan.ranges[i].resolve(last_execution);
                let card = self.estimate_card_table(lit, min, max)?;
                trace!(atom = i, card, min, max, "atom cardinality");
                if card == 0 {
                    empty_atom = Some((lit.clone(), base_plan.ranges[i].is_full()));
                    break;
                }
                cards.push(card);
            }
            if let Some((atom, full_range)) = empty_atom {
                if full_range {
                    let mut rt = runtime.lock();
                    rt.failed_empty = true;
                    rt.atom_failure = Some(atom);
                }
                continue;
            }

            let plan = reorder_by_cardinality(base_plan, &cards, head);

            match self.execute_plan(details, &plan, plan_idx as u8, iteration, last_execution)? {
                PlanOutcome::Completed => {}
                PlanOutcome::EmptyIntermediate { atom, full_range } => {
                    if full_range {
                        let mut rt = runtime.lock();
                        rt.failed_empty = true;
                        let repeat = prev_failed && prev_atom.as_ref() == Some(&atom);
                        rt.atom_failure = Some(atom);
                        if repeat {
                            break 'plans;
                        }
                    }
                }
            }
        }

        let produced = self.store.has_rows_at(head_pred.id, iteration);
        if produced {
            let blocks: Vec<FactBlock> = self.store.with_table(head_pred.id, |t| {
                t.map(|t| {
                    t.blocks()
                        .iter()
                        .filter(|b| b.iteration == iteration)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
            });
            derived.extend(blocks);
        }
        Ok(produced)
    }

    /// Execute one (possibly reordered) plan: first-atom scan, pipelined
    /// joins, final write.
    fn execute_plan(
        &self,
        details: &RuleExecutionDetails,
        plan: &RuleExecutionPlan,
        plan_index: u8,
        iteration: usize,
        last_execution: usize,
    ) -> EngineResult<PlanOutcome> {
        let n = plan.n_atoms();
        let head = &details.rule.head;
        let mut current: Option<InternalTable> = None;
        let mut first = true;

        for idx in 0..n {
            let lit = &plan.literals[idx];
            let last = idx == n - 1;
            let (min, max) = plan.ranges[idx].resolve(last_execution);

            // A ground non-final atom is a pure existence check, and the
            // cardinality pass has already confirmed it is non-empty.
            if first && !last && lit.n_vars() == 0 {
                continue;
            }

            if last {
                let mut sink = FinalTableJoinProcessor::new(
                    head.clone(),
                    &plan.head_constants,
                    plan.pos_from_first[idx].clone(),
                    plan.pos_from_second[idx].clone(),
                    details.rule_id,
                    plan_index,
                    iteration,
                    true,
                );
                if first {
                    self.process_first_atom(
                        plan, idx, n, details, plan_index, iteration, min, max, true, &mut sink,
                    )?;
                } else {
                    let right = self.get_table(lit, min, max)?;
                    execute_join(
                        current.as_ref().ok_or_else(|| {
                            EngineError::Invariant("join executed without an intermediate".into())
                        })?,
                        right,
                        &plan.join_coordinates[idx],
                        &plan.matches[idx],
                        &mut sink,
                        self.opts.nthreads,
                    );
                }
                sink.flush(&self.store)?;
            } else {
                let mut sink = InterTableJoinProcessor::new(
                    plan.output_width[idx],
                    plan.pos_from_first[idx].clone(),
                    plan.pos_from_second[idx].clone(),
                );
                if first {
                    self.process_first_atom(
                        plan, idx, n, details, plan_index, iteration, min, max, false, &mut sink,
                    )?;
                } else {
                    let right = self.get_table(lit, min, max)?;
                    execute_join(
                        current.as_ref().ok_or_else(|| {
                            EngineError::Invariant("join executed without an intermediate".into())
                        })?,
                        right,
                        &plan.join_coordinates[idx],
                        &plan.matches[idx],
                        &mut sink,
                        self.opts.nthreads,
                    );
                }
                let table = sink.into_table();
                if table.is_empty() {
                    trace!(atom = idx, "empty intermediate, aborting plan");
                    return Ok(PlanOutcome::EmptyIntermediate {
                        atom: lit.clone(),
                        full_range: min == 0 && max == usize::MAX,
                    });
                }
                current = Some(table);
            }
            first = false;
        }
        Ok(PlanOutcome::Completed)
    }

    /// Stream the first body atom. Pure projections clone whole blocks
    /// into the head table; everything else is projected row-wise into the
    /// sink, chunked across threads for large blocks.
    fn process_first_atom(
        &self,
        plan: &RuleExecutionPlan,
        atom_idx: usize,
        n_body: usize,
        details: &RuleExecutionDetails,
        plan_index: u8,
        iteration: usize,
        min: usize,
        max: usize,
        last: bool,
        sink: &mut dyn JoinProcessor,
    ) -> EngineResult<()> {
        let head = &details.rule.head;
        let lit = &plan.literals[atom_idx];
        let literal_itr = self.get_table(lit, min, max)?;
        let n_tables = literal_itr.n_blocks();
        let head_table_empty = self.store.is_empty(head.predicate.id);
        let matches = &plan.matches[atom_idx];

        if last
            && head_table_empty
            && n_tables == 1
            && head.arity() == lit.arity()
            && head.same_var_sequence_as(lit)
        {
            // Pure projection: the block is the derivation, no per-row work.
            for block in literal_itr {
                if self.produced_in_previous_steps(details.rule_id, head.predicate.id, &block) {
                    continue;
                }
                self.store.add(
                    head.predicate.id,
                    head.arity(),
                    Arc::clone(&block.table),
                    head.clone(),
                    Some(details.rule_id),
                    plan_index,
                    iteration,
                )?;
            }
            return Ok(());
        }

        if n_body == 1 {
            let unique = head.n_unique_vars() == lit.n_unique_vars() && n_tables == 1;
            for block in literal_itr {
                if last
                    && self.produced_in_previous_steps(details.rule_id, head.predicate.id, &block)
                {
                    continue;
                }
                sink.add_block(
                    &block,
                    unique && head_table_empty,
                    unique && head.same_var_sequence_as(lit),
                    n_tables == 1,
                );
            }
            return Ok(());
        }

        // Rows stay distinct only if the projection keeps every distinct
        // variable of the atom.
        let unique = !last
            && head.n_unique_vars() == lit.n_unique_vars()
            && plan.pos_from_second[atom_idx].len() == lit.n_unique_vars();
        for block in literal_itr {
            let table = block.table.as_ref();
            let columns = table.columns();
            let n_rows = table.n_rows();
            if self.opts.nthreads > 1 && n_rows >= PARALLEL_SCAN_LIMIT {
                let proto = sink.chunk_buffer();
                let chunk_size = n_rows.div_ceil(self.opts.nthreads).max(1);
                let indices: Vec<usize> = (0..n_rows).collect();
                let chunks: Vec<_> = indices
                    .par_chunks(chunk_size)
                    .map(|rows| {
                        let mut chunk = proto.clone();
                        for &i in rows {
                            if matches.iter().all(|&(a, b)| columns[a][i] == columns[b][i]) {
                                chunk.process_row(columns, i);
                            }
                        }
                        chunk
                    })
                    .collect();
                for chunk in chunks {
                    sink.absorb(chunk, unique);
                }
            } else {
                let mut buf = Vec::with_capacity(table.arity());
                for i in 0..n_rows {
                    if !matches.iter().all(|&(a, b)| columns[a][i] == columns[b][i]) {
                        continue;
                    }
                    table.read_row(i, &mut buf);
                    sink.process_results(&[], &buf, unique);
                }
            }
        }
        Ok(())
    }

    /// Block-level pre-filter: a source block is skipped when some later
    /// execution of the same rule already ran after the block appeared, so
    /// its rows are guaranteed to be in the head table. Sound because every
    /// execution's window starts at the previous execution.
    fn produced_in_previous_steps(&self, rule_id: usize, head_pred: PredId, block: &FactBlock) -> bool {
        if !self.opts.opt_filtering {
            return false;
        }
        self.store.with_table(head_pred, |t| {
            let Some(t) = t else { return false };
            if self.opts.opt_intersect {
                t.blocks()
                    .iter()
                    .any(|hb| hb.rule_id == Some(rule_id) && hb.iteration > block.iteration)
            } else {
                t.last_block()
                    .is_some_and(|hb| hb.rule_id == Some(rule_id) && hb.iteration > block.iteration)
            }
        })
    }

    /// Blocks of a body literal in an iteration window. EDB predicates are
    /// wrapped into the store on first touch (a most-general block at
    /// iteration 0), after which they follow the IDB read path.
    pub(crate) fn get_table(&self, literal: &Literal, min: usize, max: usize) -> EngineResult<FactIterator> {
        if literal.predicate.is_edb() {
            self.ensure_edb_loaded(literal)?;
            Ok(self.store.filtered_read(literal, 0, usize::MAX))
        } else {
            Ok(self.store.filtered_read(literal, min, max))
        }
    }

    fn ensure_edb_loaded(&self, literal: &Literal) -> EngineResult<()> {
        let pred = literal.predicate;
        if self.store.exists(pred.id) {
            return Ok(());
        }
        let most_general = Literal::most_general(pred);
        let blocks = self
            .edb
            .fetch(&most_general, 0, usize::MAX)
            .map_err(|e| match e {
                EngineError::EdbFetch { .. } => e,
                other => EngineError::EdbFetch {
                    predicate: pred.id,
                    message: other.to_string(),
                },
            })?;
        let blocks: Vec<Arc<InternalTable>> = blocks.into_iter().map(Arc::new).collect();
        self.store.install_edb(pred.id, pred.arity, blocks, &most_general)
    }

    /// Cardinality of an atom in a window, loading the EDB relation on
    /// first touch. Zero means provably empty; estimates never undercount.
    pub(crate) fn estimate_card_table(
        &self,
        literal: &Literal,
        min: usize,
        max: usize,
    ) -> EngineResult<usize> {
        let pred = literal.predicate;
        if !self.store.exists(pred.id) {
            if !pred.is_edb() {
                return Ok(0);
            }
            self.ensure_edb_loaded(literal)?;
        }
        Ok(self.store.with_table(pred.id, |t| {
            let Some(t) = t else { return 0 };
            if t.is_empty() {
                return 0;
            }
            if t.max_iteration().is_some_and(|m| m < min)
                || t.min_iteration().is_some_and(|m| m > max)
            {
                return 0;
            }
            t.estimate_cardinality(literal, min, max)
        }))
    }

    fn atomic_iteration(&self) -> usize {
        let mut guard = self.iteration.lock();
        let value = *guard;
        *guard += 1;
        value
    }

    // ---- public observers -------------------------------------------------

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_iteration(&self) -> usize {
        *self.iteration.lock()
    }

    /// All blocks of one predicate, in derivation order.
    pub fn table(&self, pred: PredId) -> FactIterator {
        self.store.read(pred, 0, usize::MAX)
    }

    /// Rows of one predicate matching a literal shape.
    pub fn filtered_table(&self, literal: &Literal) -> FactIterator {
        self.store.filtered_read(literal, 0, usize::MAX)
    }

    /// Cardinality estimate through the materialised tables only; zero for
    /// predicates without a table.
    pub fn estimate_cardinality(&self, literal: &Literal, min: usize, max: usize) -> usize {
        self.store.estimate(literal, min, max).unwrap_or(0)
    }

    /// Total rows across all IDB predicates, with a per-predicate summary
    /// at debug level.
    pub fn count_all_idb(&self) -> usize {
        let mut total = 0usize;
        let mut empty = 0usize;
        for id in 0..self.program.n_predicates() {
            if !self.program.is_idb(id) {
                continue;
            }
            let rows = self.store.n_rows(id);
            if rows > 0 {
                debug!(predicate = self.program.predicate_name(id), rows, "idb cardinality");
                total += rows;
            } else {
                empty += 1;
            }
        }
        debug!(empty, "idb predicates without derivation");
        total
    }

    /// Global derivation list, in ascending iteration order.
    pub fn derivations(&self) -> Vec<FactBlock> {
        self.derivations.lock().clone()
    }

    /// Per-execution cost statistics of the last run.
    pub fn rule_stats(&self) -> Vec<StatIteration> {
        self.stats.lock().clone()
    }

    pub(crate) fn edb_layer(&self) -> &dyn EdbLayer {
        self.edb.as_ref()
    }

    pub(crate) fn store(&self) -> &TableStore {
        &self.store
    }

    /// Write every non-empty IDB predicate to one text file under `path`:
    /// lines of `iteration<TAB>col0<TAB>col1…`. With `decompress` terms go
    /// through the dictionary, falling back to the numeric id on a miss.
    /// Per-predicate write failures are reported and skipped.
    pub fn store_on_files(&self, path: &std::path::Path, decompress: bool, min_iteration: usize) -> EngineResult<()> {
        crate::persist::store_on_files(self, path, decompress, min_iteration)
    }
}
