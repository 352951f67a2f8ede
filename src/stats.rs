//! Rule-execution statistics.
//!
//! One record per executed (rule, iteration); the driver keeps the list
//! and logs the most expensive executions after saturation.

/// Cost record of one rule execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StatIteration {
    pub iteration: usize,
    pub rule_id: usize,
    pub time_ms: f64,
    pub derived: bool,
}

/// Log the most expensive rule executions at debug level.
pub fn log_top_costs(stats: &[StatIteration], top: usize) {
    let mut by_cost: Vec<&StatIteration> = stats.iter().collect();
    by_cost.sort_by(|a, b| b.time_ms.total_cmp(&a.time_ms));
    for stat in by_cost.iter().take(top) {
        tracing::debug!(
            iteration = stat.iteration,
            rule = stat.rule_id,
            time_ms = stat.time_ms,
            derived = stat.derived,
            "rule execution cost"
        );
    }
}
