//! # Pager Configuration Module
//!
//! This module centralizes the configuration of a mapped region: numeric
//! defaults and their interdependencies live in [`constants`], the per-region
//! option set lives in [`RegionConfig`].
//!
//! ## Sources
//!
//! Options are resolved in three layers, later layers winning:
//!
//! 1. Built-in defaults (system page size, free-memory-derived buffer size,
//!    available parallelism for thread counts)
//! 2. `UPAGER_*` environment variables ([`RegionConfig::from_env`])
//! 3. Explicit builder calls ([`RegionConfig::builder`])
//!
//! An environment variable that is unset, unparsable or zero leaves the
//! previous layer's value in place.
//!
//! ## Module Organization
//!
//! - [`constants`]: numeric defaults with dependency documentation
//! - `options`: `RegionConfig`, `RegionConfigBuilder`, `ConfigError`

pub mod constants;
mod options;

pub use constants::*;
pub use options::{system_page_size, ConfigError, RegionConfig, RegionConfigBuilder};
