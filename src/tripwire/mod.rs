//! Tripwire: provenance event log, BLAKE3 hashing and input drift checks.

pub mod drift;
pub mod eventlog;
pub mod hasher;
