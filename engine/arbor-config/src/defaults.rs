//! Default configuration values.
//!
//! Single source of truth for defaults shared across the arbor tools.
//! Search defaults live on `arbor_search::SearchParams::default()`; this
//! module covers the sections around it.

// Common defaults
pub const LOG_LEVEL: &str = "info";
pub const SEARCH_SEED: u64 = 0;

// NN evaluation defaults
pub const NNEVAL_MAX_BATCH_SIZE: usize = 16;
pub const NNEVAL_BATCH_WAIT_MICROS: u64 = 500;
pub const NNEVAL_CACHE_SIZE: usize = 1 << 16;
pub const NNEVAL_CACHE_SHARDS_POWER_OF_TWO: u32 = 6;
pub const NNEVAL_NUM_SERVER_THREADS: usize = 1;
pub const NNEVAL_POLICY_TEMPERATURE: f64 = 1.0;
