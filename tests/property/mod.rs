//! Property test modules

pub mod convergence;
