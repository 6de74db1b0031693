//! Time controls and the effective time budget of one search.
//!
//! The budget computation is a set of named hooks shaping the stop check:
//! the base recommendation of the time control, the overallocation and
//! midgame factors, the obvious-move shortcut driven by root policy entropy,
//! and the tree-reuse carryover. The caps in `SearchParams` always bound the
//! result.

use crate::params::SearchParams;

/// The time situation of the player about to search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeControls {
    /// No clock; only `max_time` applies.
    Unlimited,
    /// A single absolute budget for the rest of the game.
    Absolute { main_time_left: f64 },
    /// Fischer increment per move.
    Fischer { main_time_left: f64, increment: f64 },
    /// Fischer with a cap on accumulated main time.
    FischerCapped { main_time_left: f64, increment: f64, main_time_cap: f64 },
    /// Japanese byo-yomi periods after main time.
    ByoYomi { main_time_left: f64, periods_left: u32, period_time: f64 },
    /// Canadian overtime: a block of stones per period.
    Canadian { main_time_left: f64, period_time_left: f64, stones_left: u32 },
}

impl Default for TimeControls {
    fn default() -> Self {
        TimeControls::Unlimited
    }
}

/// Expected number of remaining moves used to split a main-time budget.
const MAIN_TIME_DIVISOR: f64 = 40.0;

impl TimeControls {
    /// Base per-move time recommendation, before any shaping.
    pub fn base_recommended_time(&self) -> f64 {
        match *self {
            TimeControls::Unlimited => f64::INFINITY,
            TimeControls::Absolute { main_time_left } => main_time_left / MAIN_TIME_DIVISOR,
            TimeControls::Fischer { main_time_left, increment } => {
                increment + main_time_left / MAIN_TIME_DIVISOR
            }
            TimeControls::FischerCapped { main_time_left, increment, main_time_cap } => {
                // Spending down to the cap costs nothing next move.
                let surplus = (main_time_left - main_time_cap).max(0.0);
                surplus + increment + (main_time_left - surplus) / MAIN_TIME_DIVISOR
            }
            TimeControls::ByoYomi { main_time_left, periods_left, period_time } => {
                if main_time_left > 0.0 {
                    main_time_left / MAIN_TIME_DIVISOR + period_time * 0.5
                } else if periods_left > 1 {
                    period_time
                } else {
                    period_time * 0.9
                }
            }
            TimeControls::Canadian { main_time_left, period_time_left, stones_left } => {
                if main_time_left > 0.0 {
                    main_time_left / MAIN_TIME_DIVISOR
                } else {
                    period_time_left / (stones_left.max(1) as f64)
                }
            }
        }
    }

    /// Hard ceiling this move must never exceed, before the lag buffer.
    pub fn hard_limit(&self) -> f64 {
        match *self {
            TimeControls::Unlimited => f64::INFINITY,
            TimeControls::Absolute { main_time_left } => main_time_left,
            TimeControls::Fischer { main_time_left, .. } => main_time_left,
            TimeControls::FischerCapped { main_time_left, .. } => main_time_left,
            TimeControls::ByoYomi { main_time_left, periods_left, period_time } => {
                // Burning all but the last period is recoverable.
                main_time_left + period_time * (periods_left.max(1) as f64)
            }
            TimeControls::Canadian { main_time_left, period_time_left, .. } => {
                main_time_left + period_time_left
            }
        }
    }
}

/// Effective wall-clock budget for one search, in seconds.
pub(crate) fn effective_budget(
    params: &SearchParams,
    tc: &TimeControls,
    turn: u32,
    board_area: f64,
    root_policy_entropy: f64,
    carryover: f64,
) -> f64 {
    let base = tc.base_recommended_time();
    if !base.is_finite() {
        return 1e20;
    }
    let mut budget = base * params.overallocate_time_factor;

    // Midgame weight rises to 1.0 at the peak turn and decays exponentially
    // back toward the endgame, with turns scaled by board size.
    let scale = (board_area / 361.0).max(1e-9);
    let peak = (params.midgame_turn_peak_time * scale).max(1e-9);
    let decay = (params.endgame_turn_time_decay * scale).max(1e-9);
    let turn = turn as f64;
    let midgame_weight =
        if turn <= peak { turn / peak } else { (-(turn - peak) / decay).exp() };
    budget *= 1.0 + (params.midgame_time_factor - 1.0) * midgame_weight;

    // A concentrated root policy marks an obvious move.
    let obviousness = (-root_policy_entropy / params.obvious_moves_policy_entropy_tolerance.max(1e-9)).exp();
    budget *= 1.0 + (params.obvious_moves_time_factor - 1.0) * obviousness;

    // Work already present from tree reuse substitutes for clock time, but
    // never below a quarter of the base recommendation.
    if carryover > 0.0 {
        budget = (budget - carryover).max(base * 0.25);
    }

    budget.min(tc.hard_limit() - params.lag_buffer).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_binds() {
        let params = SearchParams::default();
        let b = effective_budget(&params, &TimeControls::Unlimited, 50, 361.0, 1.0, 0.0);
        assert!(b >= 1e19);
    }

    #[test]
    fn absolute_splits_main_time() {
        let params = SearchParams::default();
        let tc = TimeControls::Absolute { main_time_left: 400.0 };
        let b = effective_budget(&params, &tc, 0, 361.0, 3.0, 0.0);
        assert!(b > 0.0 && b < 400.0);
    }

    #[test]
    fn fischer_includes_increment() {
        let short = TimeControls::Fischer { main_time_left: 10.0, increment: 0.0 };
        let inc = TimeControls::Fischer { main_time_left: 10.0, increment: 5.0 };
        assert!(inc.base_recommended_time() > short.base_recommended_time() + 4.0);
    }

    #[test]
    fn byoyomi_uses_period_when_main_exhausted() {
        let tc = TimeControls::ByoYomi { main_time_left: 0.0, periods_left: 3, period_time: 30.0 };
        assert!((tc.base_recommended_time() - 30.0).abs() < 1e-9);
        let last = TimeControls::ByoYomi { main_time_left: 0.0, periods_left: 1, period_time: 30.0 };
        assert!(last.base_recommended_time() < 30.0);
    }

    #[test]
    fn canadian_divides_period_among_stones() {
        let tc = TimeControls::Canadian { main_time_left: 0.0, period_time_left: 60.0, stones_left: 10 };
        assert!((tc.base_recommended_time() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn midgame_factor_peaks_then_decays() {
        let mut params = SearchParams::default();
        params.midgame_time_factor = 2.0;
        let tc = TimeControls::Absolute { main_time_left: 4000.0 };
        let opening = effective_budget(&params, &tc, 0, 361.0, 3.0, 0.0);
        let midgame = effective_budget(&params, &tc, 130, 361.0, 3.0, 0.0);
        let endgame = effective_budget(&params, &tc, 600, 361.0, 3.0, 0.0);
        assert!(midgame > opening);
        assert!(midgame > endgame);
    }

    #[test]
    fn obvious_moves_shorten_thinking() {
        let mut params = SearchParams::default();
        params.obvious_moves_time_factor = 0.5;
        let tc = TimeControls::Absolute { main_time_left: 4000.0 };
        let sharp = effective_budget(&params, &tc, 50, 361.0, 0.01, 0.0);
        let flat = effective_budget(&params, &tc, 50, 361.0, 4.0, 0.0);
        assert!(sharp < flat);
    }

    #[test]
    fn carryover_reduces_budget_with_floor() {
        let params = SearchParams::default();
        let tc = TimeControls::Absolute { main_time_left: 400.0 };
        let without = effective_budget(&params, &tc, 50, 361.0, 3.0, 0.0);
        let with = effective_budget(&params, &tc, 50, 361.0, 3.0, 5.0);
        assert!(with < without);
        let floored = effective_budget(&params, &tc, 50, 361.0, 3.0, 1e9);
        assert!(floored >= tc.base_recommended_time() * 0.25 - 1e-9);
    }

    #[test]
    fn lag_buffer_comes_off_the_hard_limit() {
        let mut params = SearchParams::default();
        params.lag_buffer = 2.0;
        let tc = TimeControls::Absolute { main_time_left: 3.0 };
        let b = effective_budget(&params, &tc, 50, 361.0, 3.0, 0.0);
        assert!(b <= 1.0 + 1e-9);
    }
}
