//! Configuration struct definitions.
//!
//! All config structs with serde deserialization support and default values.

use std::time::Duration;

use arbor_search::{NnEvalConfig, SearchParams};
use serde::Deserialize;

use crate::defaults;

fn d_log_level() -> String {
    defaults::LOG_LEVEL.into()
}
fn d_seed() -> u64 {
    defaults::SEARCH_SEED
}
fn d_max_batch_size() -> usize {
    defaults::NNEVAL_MAX_BATCH_SIZE
}
fn d_batch_wait_micros() -> u64 {
    defaults::NNEVAL_BATCH_WAIT_MICROS
}
fn d_cache_size() -> usize {
    defaults::NNEVAL_CACHE_SIZE
}
fn d_cache_shards() -> u32 {
    defaults::NNEVAL_CACHE_SHARDS_POWER_OF_TWO
}
fn d_num_server_threads() -> usize {
    defaults::NNEVAL_NUM_SERVER_THREADS
}
fn d_policy_temperature() -> f64 {
    defaults::NNEVAL_POLICY_TEMPERATURE
}

/// Settings shared by every front-end.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonConfig {
    /// Log filter level: trace, debug, info, warn, error.
    #[serde(default = "d_log_level")]
    pub log_level: String,

    /// Seed for the search's deterministic randomness. Zero means derive one
    /// from the clock at startup.
    #[serde(default = "d_seed")]
    pub seed: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        CommonConfig {
            log_level: d_log_level(),
            seed: d_seed(),
        }
    }
}

/// NN evaluation service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NnEvalSection {
    #[serde(default = "d_max_batch_size")]
    pub max_batch_size: usize,

    /// How long the server tops off an under-full batch, in microseconds.
    #[serde(default = "d_batch_wait_micros")]
    pub batch_wait_micros: u64,

    #[serde(default = "d_cache_size")]
    pub cache_size: usize,

    #[serde(default = "d_cache_shards")]
    pub cache_shards_power_of_two: u32,

    #[serde(default = "d_num_server_threads")]
    pub num_server_threads: usize,

    #[serde(default = "d_policy_temperature")]
    pub policy_temperature: f64,
}

impl Default for NnEvalSection {
    fn default() -> Self {
        NnEvalSection {
            max_batch_size: d_max_batch_size(),
            batch_wait_micros: d_batch_wait_micros(),
            cache_size: d_cache_size(),
            cache_shards_power_of_two: d_cache_shards(),
            num_server_threads: d_num_server_threads(),
            policy_temperature: d_policy_temperature(),
        }
    }
}

impl NnEvalSection {
    /// Convert to the evaluator's runtime configuration.
    pub fn to_eval_config(&self) -> NnEvalConfig {
        NnEvalConfig {
            max_batch_size: self.max_batch_size,
            batch_wait: Duration::from_micros(self.batch_wait_micros),
            cache_size: self.cache_size,
            cache_shards_power_of_two: self.cache_shards_power_of_two,
            num_server_threads: self.num_server_threads,
            policy_temperature: self.policy_temperature,
        }
    }
}

/// The full engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub common: CommonConfig,

    /// Search parameters; every missing field keeps its default.
    #[serde(default)]
    pub search: SearchParams,

    #[serde(default)]
    pub nneval: NnEvalSection,
}
