//! Core traits and types for the arbor search engine
//!
//! This crate provides the collaborator surface the search core is built
//! against:
//! - `Player`, `Loc`, `Hash128`: the small value types shared by every layer
//! - `Rules`: the typed trait a game implements so the search can query legal
//!   moves, apply moves, detect terminal states, hash situations, and encode
//!   neural-network input planes
//! - `symmetry`: the 8-element dihedral group acting on boards, policies and
//!   move locations
//!
//! The search itself never owns game knowledge; everything game-specific goes
//! through `Rules`.

pub mod hash;
pub mod rules;
pub mod symmetry;

pub use hash::Hash128;
pub use rules::{EncodeParams, IllegalMove, NetInput, Rules, TerminalValue};
pub use symmetry::{Symmetry, SymmetrySet, NUM_SYMMETRIES};

use serde::{Deserialize, Serialize};

/// One of the two players. Utilities throughout the search are expressed from
/// White's perspective (positive = good for White).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Player {
    Black,
    White,
}

impl Player {
    /// The opponent of this player.
    #[inline]
    pub fn opponent(self) -> Player {
        match self {
            Player::Black => Player::White,
            Player::White => Player::Black,
        }
    }

    /// +1.0 for White, -1.0 for Black. Used to flip White-positive utilities
    /// into the perspective of this player.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Player::Black => -1.0,
            Player::White => 1.0,
        }
    }
}

/// A move location, expressed as an index into the policy vector of the game
/// (board cells first in row-major order, then any special moves such as
/// pass). `Loc` is meaningful only together with the `Rules` that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loc(pub u32);

impl Loc {
    /// Sentinel for "no move". Never a legal policy index.
    pub const NONE: Loc = Loc(u32::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == Loc::NONE
    }
}

impl std::fmt::Display for Loc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_opponent_and_sign() {
        assert_eq!(Player::Black.opponent(), Player::White);
        assert_eq!(Player::White.opponent(), Player::Black);
        assert_eq!(Player::White.sign(), 1.0);
        assert_eq!(Player::Black.sign(), -1.0);
    }

    #[test]
    fn loc_none_sentinel() {
        assert!(Loc::NONE.is_none());
        assert!(!Loc(0).is_none());
        assert_eq!(Loc(7).index(), 7);
    }
}
