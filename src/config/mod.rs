//! Configuration module for crawl-keeper
//!
//! This module handles loading, parsing, and validating TOML configuration files,
//! plus the handful of environment variables that override them.
//!
//! # Example
//!
//! ```no_run
//! use crawl_keeper::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl-keeper.toml")).unwrap();
//! println!("Session ceiling: {}", config.engine.max_sessions);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BrowserConfig, CheckpointConfig, Config, EngineConfig, FieldEntry, JobDefaults, RenderEngine,
    RetryConfig, RuleEntry, RuleKind, ThrottleConfig,
};

// Re-export parser functions
pub use parser::{
    apply_env_overrides, compute_config_hash, load_config, load_config_with_hash, parse_config,
};
pub use validation::validate;
pub(crate) use validation::validate_threshold;
