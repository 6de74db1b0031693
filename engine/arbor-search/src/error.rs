//! Error taxonomy of the search core.
//!
//! Workers never propagate errors across the worker boundary: every failure
//! inside the playout loop becomes a `PlayoutOutcome` consumed by the worker
//! main loop. Only the bot controller surfaces errors to the caller.

use arbor_core::{Loc, Player};
use thiserror::Error;

/// Errors surfaced by the search and the bot controller.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    /// Invalid configuration: caps non-positive, mutually exclusive options,
    /// unsupported combinations. Fatal for the controller instance.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request the current state cannot satisfy. No state change.
    #[error("illegal request: {0}")]
    IllegalRequest(String),

    /// A move that is not legal at the current root.
    #[error("illegal move {loc} for {pla:?}")]
    IllegalMove { loc: Loc, pla: Player },

    /// No playout produced a usable evaluation, so there is no move to return.
    #[error("search produced no usable evaluations: {0}")]
    NoResult(String),

    /// An internal invariant was violated. The search is aborted.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// The bot has been killed; no further searches will start.
    #[error("bot has been killed")]
    Killed,
}

/// Errors from the NN evaluator.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// The backend failed the batch. Retryable by issuing a new request; the
    /// evaluator itself does not retry.
    #[error("neural net backend error: {0}")]
    Backend(String),

    /// The backend returned out-of-range or non-finite values.
    #[error("neural net output invalid: {0}")]
    InvalidOutput(String),

    /// The evaluator is shutting down and dropped the request.
    #[error("evaluator is shut down")]
    ShutDown,
}

/// Result of one playout, consumed by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutOutcome {
    /// The playout contributed a leaf value and was backed up.
    Succeeded,
    /// The leaf was terminal; its game outcome was backed up.
    Terminal,
    /// The NN evaluation failed; the playout was abandoned and logged.
    NnFailed,
    /// The playout was abandoned without a contribution (stop flag seen
    /// mid-descent, or a transient node-publication race).
    Aborted,
}
