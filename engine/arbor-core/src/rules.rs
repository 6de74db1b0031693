//! The `Rules` trait: the game-side collaborator surface of the search.
//!
//! The search core holds no game knowledge. A game implements `Rules` with
//! its own board and history types; the search replays moves along each
//! playout path on per-thread copies, so nodes never store boards.

use crate::symmetry::{Symmetry, SymmetrySet};
use crate::{Hash128, Loc, Player};
use thiserror::Error;

/// Returned when a move is rejected by the rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal move {loc} for {pla:?}")]
pub struct IllegalMove {
    pub loc: Loc,
    pub pla: Player,
}

/// Outcome of a finished game, from White's perspective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerminalValue {
    /// Win minus loss probability collapsed to the actual outcome: +1 White
    /// win, -1 Black win, 0 otherwise.
    pub win_loss: f64,
    /// 1.0 if the game ended without a result, else 0.0.
    pub no_result: f64,
}

impl TerminalValue {
    pub const NO_RESULT: TerminalValue = TerminalValue {
        win_loss: 0.0,
        no_result: 1.0,
    };

    pub fn win_for(pla: Player) -> TerminalValue {
        TerminalValue {
            win_loss: pla.sign(),
            no_result: 0.0,
        }
    }

    pub const DRAW: TerminalValue = TerminalValue {
        win_loss: 0.0,
        no_result: 0.0,
    };
}

/// Parameters that shape neural-net input encoding for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeParams {
    /// Signed playout doubling advantage for the side to move.
    pub playout_doubling_advantage: f64,
    /// Utility assigned to a no-result game, from White's perspective.
    pub no_result_utility_for_white: f64,
}

impl Default for EncodeParams {
    fn default() -> Self {
        EncodeParams {
            playout_doubling_advantage: 0.0,
            no_result_utility_for_white: 0.0,
        }
    }
}

/// Encoded neural-net input for one position: `spatial_channels` stacked
/// `height` x `width` planes (channel-major) plus a flat global feature
/// vector.
#[derive(Debug, Clone, Default)]
pub struct NetInput {
    pub spatial: Vec<f32>,
    pub global: Vec<f32>,
}

/// The rules collaborator consumed by the search.
///
/// Implementations must be cheap to query: `legal_moves` and `make_move` run
/// on every playout step across all worker threads.
pub trait Rules: Send + Sync + 'static {
    /// Board state at a single position. Cloned per worker thread.
    type Board: Clone + Send + Sync + 'static;

    /// Move history / repetition context. Cloned per worker thread.
    type History: Clone + Send + Sync + 'static;

    /// Board width and height.
    fn board_dims(&self) -> (usize, usize);

    /// Length of the policy vector: board cells in row-major order followed
    /// by any non-spatial moves (pass last, if the game has one).
    fn policy_size(&self) -> usize;

    /// Number of spatial input channels fed to the net.
    fn spatial_channels(&self) -> usize;

    /// Number of global input features fed to the net.
    fn global_channels(&self) -> usize;

    /// All legal moves for `pla`, in policy-index order.
    fn legal_moves(&self, board: &Self::Board, hist: &Self::History, pla: Player) -> Vec<Loc>;

    /// Whether `loc` is legal for `pla`.
    fn is_legal(&self, board: &Self::Board, hist: &Self::History, loc: Loc, pla: Player) -> bool;

    /// Apply a move in place.
    fn make_move(
        &self,
        board: &mut Self::Board,
        hist: &mut Self::History,
        loc: Loc,
        pla: Player,
    ) -> Result<(), IllegalMove>;

    /// Whether the game has ended.
    fn is_game_over(&self, board: &Self::Board, hist: &Self::History) -> bool;

    /// Outcome of a finished game. Only called when `is_game_over` is true.
    fn terminal_value(&self, board: &Self::Board, hist: &Self::History) -> TerminalValue;

    /// Hash of the current situation (board plus player to move).
    fn situation_hash(&self, board: &Self::Board, pla: Player) -> Hash128;

    /// Extra path-dependent context folded into graph-search keys, for games
    /// where history changes the meaning of a position (kos, repetition
    /// rules). Defaults to nothing.
    fn graph_context_hash(&self, _hist: &Self::History) -> Hash128 {
        Hash128::ZERO
    }

    /// How many times the current situation has recently repeated. Used to
    /// cut off endlessly-cycling playout paths.
    fn repetition_count(&self, _board: &Self::Board, _hist: &Self::History) -> u32 {
        0
    }

    /// Number of moves played from the start of the game.
    fn turn_number(&self, hist: &Self::History) -> u32;

    /// Encode net input planes for the position in canonical orientation.
    fn encode_input(
        &self,
        board: &Self::Board,
        hist: &Self::History,
        pla: Player,
        enc: &EncodeParams,
        out: &mut NetInput,
    );

    /// Symmetries under which the current position is invariant. Games
    /// without symmetry support report only the identity.
    fn symmetries(&self, _board: &Self::Board, _hist: &Self::History) -> SymmetrySet {
        SymmetrySet::IDENTITY
    }

    /// Map a move through a board symmetry.
    fn transform_loc(&self, loc: Loc, sym: Symmetry) -> Loc {
        let (w, h) = self.board_dims();
        Loc(crate::symmetry::transform_pos(loc.index(), w, h, sym) as u32)
    }

    /// Whether a move is strictly useless (prolongs the game with no effect
    /// on the outcome) and may be pruned from root move selection.
    fn is_useless_move(
        &self,
        _board: &Self::Board,
        _hist: &Self::History,
        _pla: Player,
        _loc: Loc,
    ) -> bool {
        false
    }
}
