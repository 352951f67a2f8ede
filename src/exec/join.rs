//! # Join Executor
//!
//! Pipelined left-deep join of the current intermediate table against the
//! next body atom. The right side arrives as derivation blocks in an
//! iteration range; per block pair the strategy is picked by shape and
//! cardinality: nested-loop for Cartesian products and tiny sides, merge
//! scan when both sides are sorted on prefix-aligned join coordinates,
//! hash join otherwise (build on the smaller side, probe in left-major
//! order so output order stays deterministic).

use std::collections::HashMap;

use rayon::prelude::*;

use crate::model::Term;
use crate::table::internal::InternalTable;
use crate::table::FactIterator;

use super::processors::JoinProcessor;

/// Below this row product a nested loop beats building a hash table.
const NESTED_LOOP_LIMIT: usize = 256;

/// Minimum left rows before the hash probe is worth parallelising.
const PARALLEL_PROBE_LIMIT: usize = 4096;

/// Join `left` with every block of `right`, emitting combined rows into
/// `sink` through the plan's position maps (held by the sink).
///
/// `coords` are `(left column, right column)` pairs that must be equal;
/// empty coords mean a Cartesian product. `matches` are right-local column
/// pairs that must be equal (repeated variables not bound on the left).
pub fn execute_join(
    left: &InternalTable,
    right: FactIterator,
    coords: &[(usize, usize)],
    matches: &[(usize, usize)],
    sink: &mut dyn JoinProcessor,
    nthreads: usize,
) {
    if left.is_empty() {
        return;
    }
    for block in right {
        let rtable = block.table.as_ref();
        if rtable.is_empty() {
            continue;
        }
        if coords.is_empty() || left.n_rows() * rtable.n_rows() <= NESTED_LOOP_LIMIT {
            nested_loop(left, rtable, coords, matches, sink);
        } else if merge_applicable(left, rtable, coords) {
            merge_join(left, rtable, coords, matches, sink);
        } else {
            hash_join(left, rtable, coords, matches, sink, nthreads);
        }
    }
}

fn right_row_passes(rtable: &InternalTable, i: usize, matches: &[(usize, usize)]) -> bool {
    matches
        .iter()
        .all(|&(a, b)| rtable.columns()[a][i] == rtable.columns()[b][i])
}

fn rows_join(
    left: &InternalTable,
    li: usize,
    right: &InternalTable,
    ri: usize,
    coords: &[(usize, usize)],
) -> bool {
    coords
        .iter()
        .all(|&(lc, rc)| left.columns()[lc][li] == right.columns()[rc][ri])
}

fn nested_loop(
    left: &InternalTable,
    right: &InternalTable,
    coords: &[(usize, usize)],
    matches: &[(usize, usize)],
    sink: &mut dyn JoinProcessor,
) {
    let mut lbuf = Vec::with_capacity(left.arity());
    let mut rbuf = Vec::with_capacity(right.arity());
    for li in 0..left.n_rows() {
        left.read_row(li, &mut lbuf);
        for ri in 0..right.n_rows() {
            if !right_row_passes(right, ri, matches) {
                continue;
            }
            if rows_join(left, li, right, ri, coords) {
                right.read_row(ri, &mut rbuf);
                sink.process_results(&lbuf, &rbuf, false);
            }
        }
    }
}

/// Merge scan requires the join coordinates to be the leading columns of
/// both sides, in order; canonical tables are sorted lexicographically, so
/// equal-key groups are then contiguous on both sides.
fn merge_applicable(left: &InternalTable, right: &InternalTable, coords: &[(usize, usize)]) -> bool {
    left.is_sorted()
        && right.is_sorted()
        && coords.iter().enumerate().all(|(k, &(lc, rc))| lc == k && rc == k)
}

fn merge_join(
    left: &InternalTable,
    right: &InternalTable,
    coords: &[(usize, usize)],
    matches: &[(usize, usize)],
    sink: &mut dyn JoinProcessor,
) {
    let k = coords.len();
    let key_cmp = |li: usize, ri: usize| -> std::cmp::Ordering {
        for c in 0..k {
            match left.columns()[c][li].cmp(&right.columns()[c][ri]) {
                std::cmp::Ordering::Equal => {}
                other => return other,
            }
        }
        std::cmp::Ordering::Equal
    };
    let mut lbuf = Vec::with_capacity(left.arity());
    let mut rbuf = Vec::with_capacity(right.arity());
    let (mut li, mut ri) = (0usize, 0usize);
    while li < left.n_rows() && ri < right.n_rows() {
        match key_cmp(li, ri) {
            std::cmp::Ordering::Less => li += 1,
            std::cmp::Ordering::Greater => ri += 1,
            std::cmp::Ordering::Equal => {
                // Bounds of the equal-key group on each side.
                let lend = (li..left.n_rows())
                    .find(|&i| key_cmp(i, ri) != std::cmp::Ordering::Equal)
                    .unwrap_or(left.n_rows());
                let rend = (ri..right.n_rows())
                    .find(|&j| key_cmp(li, j) != std::cmp::Ordering::Equal)
                    .unwrap_or(right.n_rows());
                for i in li..lend {
                    left.read_row(i, &mut lbuf);
                    for j in ri..rend {
                        if !right_row_passes(right, j, matches) {
                            continue;
                        }
                        right.read_row(j, &mut rbuf);
                        sink.process_results(&lbuf, &rbuf, false);
                    }
                }
                li = lend;
                ri = rend;
            }
        }
    }
}

fn hash_join(
    left: &InternalTable,
    right: &InternalTable,
    coords: &[(usize, usize)],
    matches: &[(usize, usize)],
    sink: &mut dyn JoinProcessor,
    nthreads: usize,
) {
    // Build on the right side, keyed by the join columns; bucket order
    // follows insertion order, so probing left rows in order keeps the
    // output deterministic.
    let mut buckets: HashMap<Vec<Term>, Vec<usize>> = HashMap::new();
    for ri in 0..right.n_rows() {
        if !right_row_passes(right, ri, matches) {
            continue;
        }
        let key: Vec<Term> = coords.iter().map(|&(_, rc)| right.columns()[rc][ri]).collect();
        buckets.entry(key).or_default().push(ri);
    }
    if buckets.is_empty() {
        return;
    }

    let probe_key = |li: usize| -> Vec<Term> {
        coords.iter().map(|&(lc, _)| left.columns()[lc][li]).collect()
    };

    let pairs: Vec<(usize, usize)> = if nthreads > 1 && left.n_rows() >= PARALLEL_PROBE_LIMIT {
        let chunk = left.n_rows().div_ceil(nthreads);
        let indices: Vec<usize> = (0..left.n_rows()).collect();
        indices
            .par_chunks(chunk.max(1))
            .map(|lis| {
                let mut local = Vec::new();
                for &li in lis {
                    if let Some(ris) = buckets.get(&probe_key(li)) {
                        local.extend(ris.iter().map(|&ri| (li, ri)));
                    }
                }
                local
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    } else {
        let mut local = Vec::new();
        for li in 0..left.n_rows() {
            if let Some(ris) = buckets.get(&probe_key(li)) {
                local.extend(ris.iter().map(|&ri| (li, ri)));
            }
        }
        local
    };

    let mut lbuf = Vec::with_capacity(left.arity());
    let mut rbuf = Vec::with_capacity(right.arity());
    for (li, ri) in pairs {
        left.read_row(li, &mut lbuf);
        right.read_row(ri, &mut rbuf);
        sink.process_results(&lbuf, &rbuf, false);
    }
}
