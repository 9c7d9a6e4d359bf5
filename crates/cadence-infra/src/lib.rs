//! Infrastructure layer for Cadence.
//!
//! Everything that touches the filesystem lives here: data-directory
//! resolution, `config.toml` loading, the plan store, and the JSONL audit
//! writer that persists engine events as a side-channel.

pub mod audit;
pub mod config;
pub mod filesystem;
pub mod plan_store;
