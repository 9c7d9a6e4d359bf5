//! Plan execution engine.
//!
//! Static plans go through `Orchestrator::execute_plan`: validation, level
//! building, then level-by-level dispatch. Adaptive runs go through
//! `AdaptiveRunner`, which grows the plan turn by turn and reuses the same
//! dispatcher and retry machinery.

pub mod adaptive;
pub mod context;
pub mod dag;
pub mod definition;
pub mod dispatcher;
pub mod executor;
pub mod loop_guard;
pub mod registry;
pub mod retry;
pub mod step;
