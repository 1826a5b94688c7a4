//! Tripwire: hashing, provenance events and drift detection.

pub mod drift;
pub mod eventlog;
pub mod hasher;
