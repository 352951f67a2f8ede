//! # Parallel Driver
//!
//! Inter-rule parallelism on top of the semi-naive core. Two rules
//! conflict when they share a head predicate or one's head appears in the
//! other's body; the scheduler repeatedly forms groups of at most
//! [`MAX_GROUP_SIZE`] mutually non-conflicting rules, runs each group on
//! scoped worker threads, and consolidates at a global barrier before the
//! next group: thread-local derivation lists merge into the global list in
//! ascending iteration order.
//!
//! Workers acquire one read/write lock per predicate in ascending id order
//! (write on the head, read on intensional body predicates), first with
//! `try_lock` and backoff; a rule that cannot get its locks is deferred to
//! the end of its group and executed with blocking locks. Iteration
//! numbers come from the engine's mutex-guarded counter, so each executed
//! rule owns exactly one value.
//!
//! Recursive rules saturate across passes: the driver keeps sweeping the
//! rule set until a full pass derives nothing anywhere.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::error::{EngineError, EngineResult};
use crate::exec::plan::RuleExecutionDetails;
use crate::model::{PredId, Rule};
use crate::stats::StatIteration;
use crate::table::FactBlock;

use super::SemiNaiveEngine;

/// Cap on rule-group size; keeps groups fine-grained for load balance.
pub const MAX_GROUP_SIZE: usize = 4;

const TRY_LOCK_ATTEMPTS: usize = 3;
const TRY_LOCK_BACKOFF: Duration = Duration::from_millis(1);

/// True when the two rules must not run concurrently.
pub fn rules_conflict(a: &Rule, b: &Rule) -> bool {
    a.head.predicate.id == b.head.predicate.id
        || b.body.iter().any(|l| l.predicate.id == a.head.predicate.id)
        || a.body.iter().any(|l| l.predicate.id == b.head.predicate.id)
}

/// Pairwise conflict relation, precomputed once.
fn conflict_sets(rules: &[RuleExecutionDetails]) -> Vec<HashSet<usize>> {
    let n = rules.len();
    let mut sets = vec![HashSet::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if rules_conflict(&rules[i].rule, &rules[j].rule) {
                sets[i].insert(j);
                sets[j].insert(i);
            }
        }
    }
    sets
}

/// Partition rule indices into groups of at most `max_group` mutually
/// non-conflicting rules, preserving the given order within each sweep.
pub fn conflict_groups(rules: &[Rule], max_group: usize) -> Vec<Vec<usize>> {
    let n = rules.len();
    let mut conflicts = vec![HashSet::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if rules_conflict(&rules[i], &rules[j]) {
                conflicts[i].insert(j);
                conflicts[j].insert(i);
            }
        }
    }
    let mut groups = Vec::new();
    let mut remaining: Vec<usize> = (0..rules.len()).collect();
    while !remaining.is_empty() {
        let mut group: Vec<usize> = Vec::new();
        let mut rest = Vec::new();
        for idx in remaining {
            if group.len() < max_group && group.iter().all(|&g| !conflicts[g].contains(&idx)) {
                group.push(idx);
            } else {
                rest.push(idx);
            }
        }
        remaining = rest;
        groups.push(group);
    }
    groups
}

/// Reorder the ruleset for the parallel driver: predicates computed by
/// many rules come first (starvation avoidance), then rules are laid out
/// in conflict-free batches of at most [`MAX_GROUP_SIZE`].
pub(crate) fn reorder_for_parallel(rules: Vec<RuleExecutionDetails>) -> Vec<RuleExecutionDetails> {
    let n = rules.len();
    if n <= 1 {
        return rules;
    }
    let mut defined_by = vec![0usize; crate::model::MAX_PREDICATES];
    for details in &rules {
        defined_by[details.rule.head.predicate.id] += 1;
    }
    let conflicts = conflict_sets(&rules);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        defined_by[rules[b].rule.head.predicate.id]
            .cmp(&defined_by[rules[a].rule.head.predicate.id])
    });

    let mut scheduled: Vec<usize> = Vec::with_capacity(n);
    let mut done = vec![false; n];
    while scheduled.len() < n {
        let mut blocked: HashSet<usize> = HashSet::new();
        let mut taken = 0usize;
        for &idx in &order {
            if done[idx] || blocked.contains(&idx) {
                continue;
            }
            scheduled.push(idx);
            done[idx] = true;
            blocked.extend(conflicts[idx].iter().copied());
            taken += 1;
            if taken >= MAX_GROUP_SIZE {
                break;
            }
        }
    }
    debug!(order = ?scheduled, "parallel rule order");

    let mut slots: Vec<Option<RuleExecutionDetails>> = rules.into_iter().map(Some).collect();
    scheduled
        .into_iter()
        .map(|i| slots[i].take().unwrap_or_else(|| unreachable!()))
        .collect()
}

enum PredGuard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Lock set of one rule: write on the head predicate, read on intensional
/// body predicates, ascending predicate id. EDB predicates are not locked;
/// their loads may do I/O and must stay outside any predicate lock.
fn lock_plan(details: &RuleExecutionDetails) -> Vec<(PredId, bool)> {
    let head = details.rule.head.predicate.id;
    let mut plan: Vec<(PredId, bool)> = vec![(head, true)];
    for lit in &details.rule.body {
        let id = lit.predicate.id;
        if lit.predicate.is_idb() && id != head && !plan.iter().any(|&(p, _)| p == id) {
            plan.push((id, false));
        }
    }
    plan.sort_by_key(|&(p, _)| p);
    plan
}

fn try_lock<'a>(engine: &'a SemiNaiveEngine, plan: &[(PredId, bool)]) -> Option<Vec<PredGuard<'a>>> {
    let mut guards = Vec::with_capacity(plan.len());
    for &(pred, write) in plan {
        let guard = if write {
            engine.locks[pred].try_write().map(PredGuard::Write)
        } else {
            engine.locks[pred].try_read().map(PredGuard::Read)
        };
        match guard {
            Some(g) => guards.push(g),
            None => return None,
        }
    }
    Some(guards)
}

fn lock_blocking<'a>(engine: &'a SemiNaiveEngine, plan: &[(PredId, bool)]) -> Vec<PredGuard<'a>> {
    plan.iter()
        .map(|&(pred, write)| {
            if write {
                PredGuard::Write(engine.locks[pred].write())
            } else {
                PredGuard::Read(engine.locks[pred].read())
            }
        })
        .collect()
}

struct WorkerOutput {
    derived: bool,
    blocks: Vec<FactBlock>,
    stat: StatIteration,
}

enum WorkerOutcome {
    Done(Box<WorkerOutput>),
    Deferred,
}

fn run_rule(
    engine: &SemiNaiveEngine,
    idx: usize,
    allow_defer: bool,
) -> EngineResult<WorkerOutcome> {
    let details = &engine.rules[idx];
    let plan = lock_plan(details);

    let _guards = if allow_defer {
        let mut acquired = None;
        for _ in 0..TRY_LOCK_ATTEMPTS {
            if let Some(g) = try_lock(engine, &plan) {
                acquired = Some(g);
                break;
            }
            std::thread::sleep(TRY_LOCK_BACKOFF);
        }
        match acquired {
            Some(g) => g,
            None => {
                trace!(rule = details.rule_id, "locks busy, deferring rule");
                return Ok(WorkerOutcome::Deferred);
            }
        }
    } else {
        lock_blocking(engine, &plan)
    };

    let iteration = engine.atomic_iteration();
    let start = Instant::now();
    let mut blocks = Vec::new();
    let derived = engine.execute_rule(details, &engine.runtime[idx], iteration, &mut blocks)?;
    engine.runtime[idx].lock().last_execution = iteration;
    let stat = StatIteration {
        iteration,
        rule_id: details.rule_id,
        time_ms: start.elapsed().as_secs_f64() * 1000.0,
        derived,
    };
    Ok(WorkerOutcome::Done(Box::new(WorkerOutput {
        derived,
        blocks,
        stat,
    })))
}

/// Run one conflict-free group on scoped worker threads, then consolidate:
/// merge thread-local derivations (ascending iteration) and statistics
/// into the engine, and execute deferred rules with blocking locks.
fn run_group(engine: &SemiNaiveEngine, group: &[usize]) -> EngineResult<bool> {
    let mut outputs: Vec<WorkerOutput> = Vec::with_capacity(group.len());
    let mut deferred: Vec<usize> = Vec::new();

    if group.len() == 1 {
        match run_rule(engine, group[0], false)? {
            WorkerOutcome::Done(out) => outputs.push(*out),
            WorkerOutcome::Deferred => {}
        }
    } else {
        let results: Vec<(usize, std::thread::Result<EngineResult<WorkerOutcome>>)> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = group
                    .iter()
                    .map(|&idx| (idx, scope.spawn(move || run_rule(engine, idx, true))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(idx, handle)| (idx, handle.join()))
                    .collect()
            });
        for (idx, joined) in results {
            match joined {
                Err(_) => return Err(EngineError::WorkerPanicked),
                Ok(result) => match result? {
                    WorkerOutcome::Done(out) => outputs.push(*out),
                    WorkerOutcome::Deferred => deferred.push(idx),
                },
            }
        }
        for idx in deferred {
            match run_rule(engine, idx, false)? {
                WorkerOutcome::Done(out) => outputs.push(*out),
                WorkerOutcome::Deferred => {}
            }
        }
    }

    let mut any_derived = false;
    let mut all_blocks: Vec<FactBlock> = Vec::new();
    {
        let mut stats = engine.stats.lock();
        for out in outputs {
            any_derived |= out.derived;
            all_blocks.extend(out.blocks);
            stats.push(out.stat);
        }
    }
    all_blocks.sort_by_key(|b| b.iteration);
    engine.derivations.lock().extend(all_blocks);
    Ok(any_derived)
}

/// Parallel saturation: sweep the rule set in conflict-free groups with a
/// consolidation barrier after each, until a full sweep derives nothing.
pub(crate) fn execute_until_saturation(engine: &SemiNaiveEngine) -> EngineResult<()> {
    let n = engine.rules.len();
    let conflicts = conflict_sets(&engine.rules);
    loop {
        let mut any_derived = false;
        let mut remaining: Vec<usize> = (0..n).collect();
        while !remaining.is_empty() {
            let mut group: Vec<usize> = Vec::new();
            let mut rest = Vec::new();
            for idx in remaining {
                if group.len() < MAX_GROUP_SIZE
                    && group.iter().all(|&g| !conflicts[g].contains(&idx))
                {
                    group.push(idx);
                } else {
                    rest.push(idx);
                }
            }
            remaining = rest;
            trace!(group = ?group, "running rule group");
            any_derived |= run_group(engine, &group)?;
        }
        if !any_derived {
            break;
        }
    }
    Ok(())
}
