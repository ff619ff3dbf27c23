//! Ignis: declarative, resumable deployment orchestration.
//!
//! Modules of futures are built, planned into a deterministic order and run
//! against an environment with an idempotent journal, so an interrupted
//! deployment resumes where it stopped. BLAKE3 fingerprints. Provenance tracing.

pub mod cli;
pub mod core;
pub mod env;
pub mod tripwire;
