//! Siteform: dependency-ordered provisioning for static website stacks.
//!
//! Declarations in YAML, BLAKE3 change detection, parallel execution of
//! independent branches, provenance events and drift detection.

pub mod cli;
pub mod cloud;
pub mod core;
pub mod tripwire;
