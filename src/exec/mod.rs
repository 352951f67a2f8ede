//! Rule execution machinery: plans, join processors and the join executor.

pub mod join;
pub mod plan;
pub mod processors;
