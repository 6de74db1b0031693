//! Configuration loading logic.
//!
//! Handles loading config from files and applying environment variable
//! overrides.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::EngineConfig;

/// Standard locations to search for config.toml
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.toml",    // Current directory
    "../config.toml", // Parent directory (when running from a subdirectory)
];

/// Load the engine configuration.
///
/// Searches for config.toml in the following order:
/// 1. Path specified by the ARBOR_CONFIG environment variable
/// 2. Current directory (config.toml)
/// 3. Parent directory (../config.toml)
///
/// After loading, environment variable overrides are applied.
pub fn load_config() -> EngineConfig {
    if let Ok(path) = std::env::var("ARBOR_CONFIG") {
        let path = PathBuf::from(&path);
        if path.exists() {
            info!("loading config from ARBOR_CONFIG: {}", path.display());
            return load_from_path(&path);
        }
        warn!("ARBOR_CONFIG={} not found, searching defaults", path.display());
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("no config.toml found, using built-in defaults");
    apply_env_overrides(EngineConfig::default())
}

/// Load configuration from a specific path.
pub fn load_from_path(path: &PathBuf) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => apply_env_overrides(config),
            Err(e) => {
                warn!("failed to parse {}: {}, using defaults", path.display(), e);
                apply_env_overrides(EngineConfig::default())
            }
        },
        Err(e) => {
            warn!("failed to read {}: {}, using defaults", path.display(), e);
            apply_env_overrides(EngineConfig::default())
        }
    }
}

/// Macro to reduce env override boilerplate.
macro_rules! env_override {
    // String field
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) = std::env::var($key) {
            $config.$section.$field = v;
        }
    };
    // Parseable field (usize, u64, f64, bool, ...)
    ($config:expr, $section:ident . $field:ident, $key:expr, parse) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

/// Apply `ARBOR_<SECTION>_<KEY>` environment overrides on top of `config`.
pub fn apply_env_overrides(mut config: EngineConfig) -> EngineConfig {
    env_override!(config, common.log_level, "ARBOR_COMMON_LOG_LEVEL");
    env_override!(config, common.seed, "ARBOR_COMMON_SEED", parse);

    env_override!(config, search.num_threads, "ARBOR_SEARCH_NUM_THREADS", parse);
    env_override!(config, search.max_visits, "ARBOR_SEARCH_MAX_VISITS", parse);
    env_override!(config, search.max_playouts, "ARBOR_SEARCH_MAX_PLAYOUTS", parse);
    env_override!(config, search.max_time, "ARBOR_SEARCH_MAX_TIME", parse);
    env_override!(config, search.use_graph_search, "ARBOR_SEARCH_USE_GRAPH_SEARCH", parse);
    env_override!(config, search.root_noise_enabled, "ARBOR_SEARCH_ROOT_NOISE_ENABLED", parse);
    env_override!(config, search.cpuct_exploration, "ARBOR_SEARCH_CPUCT_EXPLORATION", parse);

    env_override!(config, nneval.max_batch_size, "ARBOR_NNEVAL_MAX_BATCH_SIZE", parse);
    env_override!(config, nneval.batch_wait_micros, "ARBOR_NNEVAL_BATCH_WAIT_MICROS", parse);
    env_override!(config, nneval.cache_size, "ARBOR_NNEVAL_CACHE_SIZE", parse);
    env_override!(config, nneval.num_server_threads, "ARBOR_NNEVAL_NUM_SERVER_THREADS", parse);

    config
}
