//! Shared domain types for Cadence.
//!
//! Plain data used across the engine: plans and steps, step results,
//! insights, reasoning records, lifecycle events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid and chrono.

pub mod config;
pub mod event;
pub mod insight;
pub mod plan;
pub mod result;
pub mod thought;
