//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (FIXLOG_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [engine]
//! nthreads = 4
//! inter_rule_threads = 2
//! opt_filtering = true
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! FIXLOG_ENGINE__NTHREADS=8
//! FIXLOG_LOGGING__LEVEL=trace
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Threads for intra-rule work; 0 = use all available CPU cores
    #[serde(default)]
    pub nthreads: usize,

    /// Threads for inter-rule batches; 1 = sequential driver
    #[serde(default = "default_one")]
    pub inter_rule_threads: usize,

    /// Range intersection for the block-level pre-filter
    #[serde(default = "default_true")]
    pub opt_intersect: bool,

    /// Block-level pre-filter against earlier derivations
    #[serde(default = "default_true")]
    pub opt_filtering: bool,

    /// Randomise rule order instead of the conflict-aware reorder
    #[serde(default)]
    pub shuffle_rules: bool,

    /// Seed for the rule shuffle
    #[serde(default)]
    pub shuffle_seed: u64,

    /// Size cutoff for the query dispatcher: estimates below it pick the
    /// magic-set rewrite, the rest evaluate on demand
    #[serde(default = "default_threshold")]
    pub threshold: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_one() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_threshold() -> u64 {
    1_000_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            nthreads: 0,
            inter_rule_threads: 1,
            opt_intersect: true,
            opt_filtering: true,
            shuffle_rules: false,
            shuffle_seed: 0,
            threshold: default_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (FIXLOG_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("FIXLOG_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FIXLOG_").split("__"))
            .extract()
    }

    /// Resolved engine options: thread counts of 0 expand to the number of
    /// available CPU cores.
    pub fn engine_options(&self) -> EngineOptions {
        let cores = num_cpus::get();
        EngineOptions {
            opt_intersect: self.engine.opt_intersect,
            opt_filtering: self.engine.opt_filtering,
            nthreads: if self.engine.nthreads == 0 {
                cores
            } else {
                self.engine.nthreads
            },
            inter_rule_threads: if self.engine.inter_rule_threads == 0 {
                cores
            } else {
                self.engine.inter_rule_threads
            },
            shuffle_rules: self.engine.shuffle_rules,
            shuffle_seed: self.engine.shuffle_seed,
        }
    }
}
