//! Core engine: model types, builder, resolution, planning, journal, execution.

pub mod builder;
pub mod error;
pub mod executor;
pub mod journal;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod types;
