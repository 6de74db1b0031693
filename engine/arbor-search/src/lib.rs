//! Neural-net guided Monte-Carlo tree search.
//!
//! This crate is the search core of the arbor engine. It provides:
//!
//! - a shared search tree (optionally a graph with transposition sharing)
//!   built from lock-free nodes in a chunked arena ([`tree`], [`node`])
//! - a batching NN evaluation service with a sharded LRU cache and dihedral
//!   symmetry handling ([`nneval`])
//! - the parallel playout engine: PUCT selection with first-play urgency and
//!   virtual loss, expansion against the rules collaborator, and
//!   dirty-counter backup with weighted-mean aggregation
//!   ([`search`], [`update`])
//! - chosen-move selection with LCB override and temperature ([`movesel`]),
//!   read-only analysis snapshots ([`analysis`])
//! - an asynchronous bot controller driving searches under genmove, ponder
//!   and analyze semantics with time controls ([`bot`], [`timecontrols`])
//!
//! Games plug in through the `arbor_core::Rules` trait; neural nets plug in
//! through [`nneval::NnBackend`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbor_search::{AsyncBot, NnEvalConfig, NnEvaluator, SearchParams, TimeControls};
//!
//! let rules = Arc::new(MyGame::new());
//! let backend = Arc::new(MyBackend::load("model.bin")?);
//! let nn = Arc::new(NnEvaluator::new(rules.clone(), backend, NnEvalConfig::default()));
//! let (board, hist) = MyGame::starting_position();
//! let mut bot = AsyncBot::new(
//!     SearchParams::default().with_num_threads(8).with_max_visits(1600),
//!     rules, nn, board, hist, Player::Black, 42,
//! )?;
//! let mv = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
//! ```

pub mod analysis;
pub mod bot;
pub mod dist;
pub mod error;
pub mod movesel;
pub mod nneval;
pub mod node;
pub mod params;
pub mod search;
pub mod timecontrols;
pub mod tree;
pub mod update;

pub use analysis::{AnalysisData, MoveAnalysis, RootInfo};
pub use bot::AsyncBot;
pub use error::{EvalError, PlayoutOutcome, SearchError};
pub use nneval::{
    BackendError, BackendOutput, NnBackend, NnEvalConfig, NnEvalStats, NnEvaluator, NnInputParams,
    SymmetrySpec, UniformBackend,
};
pub use node::{NnOutput, NodeId, NodeStats};
pub use params::SearchParams;
pub use search::{AnalyzeCallback, Search};
pub use timecontrols::TimeControls;
