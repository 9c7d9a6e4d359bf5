//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls retry
//! policy, timeouts, worker-pool width and the adaptive loop's ceilings.

use serde::{Deserialize, Serialize};

use crate::plan::RetryConfig;

/// Top-level configuration for the orchestration engine.
///
/// Loaded from `~/.cadence/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default retry policy for steps without an override.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-attempt step timeout in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Maximum steps running concurrently within one level.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Reuse outputs of structurally identical steps within one query.
    #[serde(default)]
    pub memoize_outputs: bool,

    /// Adaptive planning loop limits.
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_parallel_steps() -> usize {
    8
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            step_timeout_secs: default_step_timeout_secs(),
            max_parallel_steps: default_max_parallel_steps(),
            event_capacity: default_event_capacity(),
            memoize_outputs: false,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Apply safety floors to values that would otherwise stall or spin.
    pub fn normalized(mut self) -> Self {
        self.retry.max_retries = self.retry.max_retries.max(1);
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            self.retry.backoff_factor = 1.0;
        }
        self.step_timeout_secs = self.step_timeout_secs.max(1);
        self.max_parallel_steps = self.max_parallel_steps.max(1);
        self.event_capacity = self.event_capacity.max(16);
        self.adaptive.max_iterations = self.adaptive.max_iterations.max(1);
        self.adaptive.max_parallel_actions = self.adaptive.max_parallel_actions.max(1);
        self.adaptive.max_consecutive_rejections = self.adaptive.max_consecutive_rejections.max(1);
        self.adaptive.max_repeated_actions = self.adaptive.max_repeated_actions.max(1);
        self
    }
}

/// Ceilings for the adaptive planning loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Hard cap on planner consultations per query.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum actions batched into one level from a single turn.
    #[serde(default = "default_max_parallel_actions")]
    pub max_parallel_actions: usize,

    /// Consecutive rejected turns tolerated before the run ends.
    #[serde(default = "default_max_consecutive_rejections")]
    pub max_consecutive_rejections: u32,

    /// How often one action signature may be executed per query.
    #[serde(default = "default_max_repeated_actions")]
    pub max_repeated_actions: usize,
}

fn default_max_iterations() -> u32 {
    12
}

fn default_max_parallel_actions() -> usize {
    4
}

fn default_max_consecutive_rejections() -> u32 {
    2
}

fn default_max_repeated_actions() -> usize {
    3
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_parallel_actions: default_max_parallel_actions(),
            max_consecutive_rejections: default_max_consecutive_rejections(),
            max_repeated_actions: default_max_repeated_actions(),
        }
    }
}
