//! Core provisioning logic: declarations, ordering, planning and execution.

pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod types;
