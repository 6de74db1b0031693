//! TicTacToe rules for the arbor engine.
//!
//! A complete reference implementation of the `arbor_core::Rules` trait,
//! small enough to read in one sitting but with the full surface the search
//! exercises: legality, terminal detection, situation hashing, NN input
//! encoding, and the dihedral symmetry group of the 3x3 board.
//!
//! Black plays X and moves first; White plays O. Policy indices are the nine
//! cells in row-major order; there is no pass.

use arbor_core::symmetry::{self, SymmetrySet, NUM_SYMMETRIES};
use arbor_core::{
    EncodeParams, Hash128, IllegalMove, Loc, NetInput, Player, Rules, TerminalValue,
};

const BOARD_SIZE: usize = 9;
const EMPTY: u8 = 0;

/// Board state: cell contents plus the resolved winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Board {
    /// 0 = empty, 1 = X (Black), 2 = O (White).
    cells: [u8; BOARD_SIZE],
    /// 0 = ongoing, 1 = X wins, 2 = O wins, 3 = draw.
    winner: u8,
}

/// Move history; TicTacToe needs nothing beyond the moves for turn numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub moves: Vec<Loc>,
}

/// Winning lines: rows, columns, diagonals.
const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

impl Board {
    pub fn empty() -> Board {
        Board {
            cells: [EMPTY; BOARD_SIZE],
            winner: 0,
        }
    }

    pub fn cell(&self, pos: usize) -> u8 {
        self.cells[pos]
    }

    pub fn is_done(&self) -> bool {
        self.winner != 0
    }

    fn stone_of(pla: Player) -> u8 {
        match pla {
            Player::Black => 1,
            Player::White => 2,
        }
    }

    fn check_winner(cells: &[u8; BOARD_SIZE]) -> u8 {
        for line in LINES {
            let v = cells[line[0]];
            if v != EMPTY && cells[line[1]] == v && cells[line[2]] == v {
                return v;
            }
        }
        if cells.iter().all(|&c| c != EMPTY) {
            3
        } else {
            0
        }
    }
}

/// The rules object. Stateless; clone or share freely.
#[derive(Debug, Clone, Default)]
pub struct TicTacToe;

impl TicTacToe {
    pub fn new() -> TicTacToe {
        TicTacToe
    }

    /// An empty board with Black (X) to move.
    pub fn starting_position() -> (Board, History) {
        (Board::empty(), History::default())
    }

    /// Zobrist-style cell hash, derived deterministically.
    fn cell_hash(pos: usize, stone: u8) -> Hash128 {
        Hash128::ZERO.mix_u64((pos as u64) << 8 | stone as u64).mix_u64(0x7454_6163)
    }
}

impl Rules for TicTacToe {
    type Board = Board;
    type History = History;

    fn board_dims(&self) -> (usize, usize) {
        (3, 3)
    }

    fn policy_size(&self) -> usize {
        BOARD_SIZE
    }

    fn spatial_channels(&self) -> usize {
        3
    }

    fn global_channels(&self) -> usize {
        1
    }

    fn legal_moves(&self, board: &Board, _hist: &History, _pla: Player) -> Vec<Loc> {
        if board.is_done() {
            return Vec::new();
        }
        (0..BOARD_SIZE)
            .filter(|&pos| board.cells[pos] == EMPTY)
            .map(|pos| Loc(pos as u32))
            .collect()
    }

    fn is_legal(&self, board: &Board, _hist: &History, loc: Loc, _pla: Player) -> bool {
        !board.is_done() && loc.index() < BOARD_SIZE && board.cells[loc.index()] == EMPTY
    }

    fn make_move(
        &self,
        board: &mut Board,
        hist: &mut History,
        loc: Loc,
        pla: Player,
    ) -> Result<(), IllegalMove> {
        if !self.is_legal(board, hist, loc, pla) {
            return Err(IllegalMove { loc, pla });
        }
        board.cells[loc.index()] = Board::stone_of(pla);
        board.winner = Board::check_winner(&board.cells);
        hist.moves.push(loc);
        Ok(())
    }

    fn is_game_over(&self, board: &Board, _hist: &History) -> bool {
        board.is_done()
    }

    fn terminal_value(&self, board: &Board, _hist: &History) -> TerminalValue {
        match board.winner {
            1 => TerminalValue::win_for(Player::Black),
            2 => TerminalValue::win_for(Player::White),
            _ => TerminalValue::DRAW,
        }
    }

    fn situation_hash(&self, board: &Board, pla: Player) -> Hash128 {
        let mut h = Hash128::new(0x5449_4354_4143, 0x544f_45);
        for (pos, &stone) in board.cells.iter().enumerate() {
            if stone != EMPTY {
                h = h ^ TicTacToe::cell_hash(pos, stone);
            }
        }
        h.mix_u64(Board::stone_of(pla) as u64)
    }

    fn turn_number(&self, hist: &History) -> u32 {
        hist.moves.len() as u32
    }

    fn encode_input(
        &self,
        board: &Board,
        _hist: &History,
        pla: Player,
        enc: &EncodeParams,
        out: &mut NetInput,
    ) {
        // Channels: own stones, opponent stones, side-to-move plane.
        out.spatial.clear();
        out.spatial.resize(3 * BOARD_SIZE, 0.0);
        let own = Board::stone_of(pla);
        for (pos, &stone) in board.cells.iter().enumerate() {
            if stone == own {
                out.spatial[pos] = 1.0;
            } else if stone != EMPTY {
                out.spatial[BOARD_SIZE + pos] = 1.0;
            }
        }
        let side = if pla == Player::Black { 1.0 } else { 0.0 };
        for pos in 0..BOARD_SIZE {
            out.spatial[2 * BOARD_SIZE + pos] = side;
        }
        out.global.clear();
        out.global.push(enc.playout_doubling_advantage as f32);
    }

    fn symmetries(&self, board: &Board, _hist: &History) -> SymmetrySet {
        let mut set = SymmetrySet::IDENTITY;
        for sym in 1..NUM_SYMMETRIES {
            let mut invariant = true;
            for pos in 0..BOARD_SIZE {
                let t = symmetry::transform_pos(pos, 3, 3, sym);
                if board.cells[pos] != board.cells[t] {
                    invariant = false;
                    break;
                }
            }
            if invariant {
                set.insert(sym);
            }
        }
        set
    }
}
