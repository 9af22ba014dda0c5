//! Structure-aware mutators over call arguments.

pub mod param_mutator;
pub mod value_mutator;
