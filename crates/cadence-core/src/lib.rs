//! Orchestration engine for Cadence.
//!
//! Turns a declarative or incrementally grown plan of interdependent steps
//! into bounded, fail-soft execution. Depends only on `cadence-types` --
//! never on `cadence-infra`.

pub mod event;
pub mod workflow;
