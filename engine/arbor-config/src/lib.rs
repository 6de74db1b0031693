//! Centralized configuration loading from config.toml.
//!
//! This crate provides the configuration structs and loading logic shared by
//! every arbor front-end.
//!
//! # Configuration Priority
//!
//! Settings are loaded with the following priority (highest to lowest):
//! 1. Environment variables (`ARBOR_<SECTION>_<KEY>`)
//! 2. config.toml file
//! 3. Built-in defaults
//!
//! # Environment Variable Override Pattern
//!
//! ```text
//! ARBOR_<SECTION>_<KEY>=value
//!
//! Examples:
//!     ARBOR_COMMON_LOG_LEVEL=debug
//!     ARBOR_SEARCH_NUM_THREADS=16
//!     ARBOR_SEARCH_MAX_VISITS=3200
//!     ARBOR_NNEVAL_MAX_BATCH_SIZE=32
//! ```

mod defaults;
mod loader;
mod structs;

pub use defaults::*;
pub use loader::{apply_env_overrides, load_config, load_from_path, CONFIG_SEARCH_PATHS};
pub use structs::{CommonConfig, EngineConfig, NnEvalSection};
