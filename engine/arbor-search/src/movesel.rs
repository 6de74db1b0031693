//! Choosing the move to play after a search terminates.

use arbor_core::{Loc, Rules};
use rand::Rng;
use tracing::debug;

use crate::error::SearchError;
use crate::search::{interpolate_early, Search};

/// Per-root-child quantities used by move selection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RootChild {
    pub loc: Loc,
    pub edge_visits: i64,
    /// Utility from the root player's perspective.
    pub self_utility: f64,
    /// Lower confidence bound on that utility.
    pub lcb: f64,
}

impl<R: Rules> Search<R> {
    /// Gather the root children with positive visits, already converted to
    /// the root player's perspective.
    pub(crate) fn root_children(&self) -> Vec<RootChild> {
        let Some(root) = self.root_node() else { return Vec::new() };
        let pla_sign = self.root_pla().sign();
        let p = &self.params;
        let mut out = Vec::new();
        for (loc, slot) in root.children(self.tree.policy_size()) {
            let edge_visits = slot.edge_visits();
            if edge_visits <= 0 {
                continue;
            }
            let stats = self.tree.node(slot.child()).stats.snapshot();
            if stats.visits <= 0 || stats.weight_sum <= 0.0 {
                continue;
            }
            let self_utility = pla_sign * stats.utility_avg;
            let ess = stats.effective_sample_size().max(1.0);
            let radius = p.lcb_stdevs * stats.utility_stdev() / ess.sqrt();
            out.push(RootChild {
                loc,
                edge_visits,
                self_utility,
                lcb: self_utility - radius,
            });
        }
        out
    }

    /// The move to play from the finished search.
    ///
    /// The most-visited child is the baseline. With LCB selection enabled, a
    /// sufficiently-visited child whose lower confidence bound beats the top
    /// child's utility is preferred. A nonzero chosen-move temperature then
    /// samples among the children by shifted visit counts.
    pub fn get_chosen_move(&self) -> Result<Loc, SearchError> {
        let p = &self.params;
        let mut children = self.root_children();

        if p.root_prune_useless_moves {
            let kept: Vec<RootChild> = children
                .iter()
                .copied()
                .filter(|c| {
                    !self.rules.is_useless_move(
                        self.root_board(),
                        self.root_hist(),
                        self.root_pla(),
                        c.loc,
                    )
                })
                .collect();
            if !kept.is_empty() {
                children = kept;
            }
        }

        if children.is_empty() {
            // No playout reached any child: fall back to the raw policy.
            return self.best_policy_move();
        }

        let top = children
            .iter()
            .copied()
            .max_by(|a, b| {
                (a.edge_visits, a.self_utility)
                    .partial_cmp(&(b.edge_visits, b.self_utility))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("children is non-empty");

        let mut best = top;
        if p.use_lcb_for_selection && top.edge_visits > 0 {
            let min_visits = (p.min_visit_prop_for_lcb * top.edge_visits as f64).ceil() as i64;
            let mut best_lcb = f64::NEG_INFINITY;
            for c in &children {
                if c.edge_visits >= min_visits && c.lcb > top.self_utility && c.lcb > best_lcb {
                    best_lcb = c.lcb;
                    best = *c;
                }
            }
            if best.loc != top.loc {
                debug!(
                    top = %top.loc,
                    chosen = %best.loc,
                    lcb = best.lcb,
                    top_utility = top.self_utility,
                    "lcb overrode the most-visited move"
                );
            }
        }

        let turn = self.rules.turn_number(self.root_hist()) as f64;
        let (w, h) = self.rules.board_dims();
        let temperature = interpolate_early(
            p.chosen_move_temperature_halflife,
            p.chosen_move_temperature_early,
            p.chosen_move_temperature,
            turn,
            (w * h) as f64,
        );
        if temperature <= 1e-4 {
            return Ok(best.loc);
        }

        // Sample proportionally to shifted visit counts. The LCB winner takes
        // over the top child's count so the override survives sampling.
        let max_visits = children.iter().map(|c| c.edge_visits).max().unwrap_or(0);
        let weights: Vec<f64> = children
            .iter()
            .map(|c| {
                let visits = if c.loc == best.loc { max_visits } else { c.edge_visits };
                if (visits as f64) < p.chosen_move_prune {
                    return 0.0;
                }
                let shifted = (visits as f64 - p.chosen_move_subtract).max(0.0);
                shifted.powf(1.0 / temperature)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Ok(best.loc);
        }
        let mut r = self.move_rng().gen_range(0.0..total);
        for (c, w) in children.iter().zip(weights.iter()) {
            if r < *w {
                return Ok(c.loc);
            }
            r -= w;
        }
        Ok(best.loc)
    }

    /// Argmax of the root policy over legal moves. Used when the search
    /// produced no visited children (e.g. a single-visit search).
    pub(crate) fn best_policy_move(&self) -> Result<Loc, SearchError> {
        let root = self
            .root_node()
            .filter(|n| n.nn_output().is_some())
            .ok_or_else(|| SearchError::NoResult("root was never evaluated".into()))?;
        let out = root.nn_output().expect("checked above");
        let legal = self.rules.legal_moves(self.root_board(), self.root_hist(), self.root_pla());
        legal
            .into_iter()
            .max_by(|a, b| {
                out.policy[a.index()]
                    .partial_cmp(&out.policy[b.index()])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| SearchError::NoResult("no legal moves at root".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use arbor_core::{Loc, Player};
    use games_tictactoe::TicTacToe;

    use crate::nneval::{NnEvalConfig, NnEvaluator, UniformBackend};
    use crate::node::NnOutput;
    use crate::params::SearchParams;
    use crate::search::Search;

    /// A search over an empty board with a hand-built root whose children
    /// carry exactly the statistics each test wants.
    fn search_with_children(
        params: SearchParams,
        children: &[(u32, i64, f64, f64)], // (loc, edge visits, utility, utility_sq)
    ) -> Search<TicTacToe> {
        let rules = Arc::new(TicTacToe::new());
        let nn = Arc::new(NnEvaluator::new(
            rules.clone(),
            Arc::new(UniformBackend::new(9)),
            NnEvalConfig::default(),
        ));
        let (board, hist) = TicTacToe::starting_position();
        // White to move keeps utilities in the White-positive convention.
        let mut search =
            Search::new(params, rules, nn, board, hist, Player::White, 1).unwrap();

        let root_id = search.tree.alloc_node(Player::White).unwrap();
        let root = search.tree.node(root_id);
        root.set_nn_output(Arc::new(NnOutput {
            policy: vec![1.0 / 9.0; 9].into_boxed_slice(),
            win_prob: 0.5,
            loss_prob: 0.5,
            no_result_prob: 0.0,
            shortterm_winloss_error: None,
            time_left: None,
            symmetry: 0,
        }));
        root.stats.visits.store(
            children.iter().map(|c| c.1).sum::<i64>() + 1,
            Ordering::Release,
        );
        root.stats.weight_sum.store(1.0, Ordering::Release);

        for &(loc, edge_visits, utility, utility_sq) in children {
            let (idx, child_id, _) = search
                .tree
                .allocate_child(root_id, Loc(loc), None, Player::Black)
                .unwrap();
            let slot = root.child_slot(idx, 9).unwrap();
            slot.add_edge_visits(edge_visits);
            let child = search.tree.node(child_id);
            child.stats.visits.store(edge_visits, Ordering::Release);
            child.stats.weight_sum.store(edge_visits as f64, Ordering::Release);
            child.stats.weight_sq_sum.store(edge_visits as f64, Ordering::Release);
            child.stats.utility_avg.store(utility, Ordering::Release);
            child.stats.utility_sq_avg.store(utility_sq, Ordering::Release);
            child.stats.win_loss_avg.store(utility, Ordering::Release);
        }
        search.root = Some(root_id);
        search
    }

    #[test]
    fn most_visited_child_wins_by_default() {
        let mut params = SearchParams::for_tests();
        params.use_lcb_for_selection = false;
        let search = search_with_children(
            params,
            &[(0, 100, 0.10, 0.17), (1, 30, 0.20, 0.067)],
        );
        assert_eq!(search.get_chosen_move().unwrap(), Loc(0));
    }

    #[test]
    fn lcb_overrides_the_most_visited_child() {
        // Child 0: 100 visits, mean 0.10, stderr 0.04.
        // Child 1: 30 visits, mean 0.20, stderr 0.03.
        // With 2 stdevs, child 1's bound 0.14 beats child 0's mean 0.10.
        let mut params = SearchParams::for_tests();
        params.use_lcb_for_selection = true;
        params.lcb_stdevs = 2.0;
        params.min_visit_prop_for_lcb = 0.2;
        let search = search_with_children(
            params,
            &[(0, 100, 0.10, 0.17), (1, 30, 0.20, 0.067)],
        );
        assert_eq!(search.get_chosen_move().unwrap(), Loc(1));
    }

    #[test]
    fn lcb_requires_enough_visits() {
        // Same shapes, but the challenger falls under the visit floor.
        let mut params = SearchParams::for_tests();
        params.use_lcb_for_selection = true;
        params.lcb_stdevs = 2.0;
        params.min_visit_prop_for_lcb = 0.5;
        let search = search_with_children(
            params,
            &[(0, 100, 0.10, 0.17), (1, 30, 0.20, 0.067)],
        );
        assert_eq!(search.get_chosen_move().unwrap(), Loc(0));
    }

    #[test]
    fn chosen_move_prune_drops_rarely_visited_children() {
        let mut params = SearchParams::for_tests();
        params.use_lcb_for_selection = false;
        params.chosen_move_temperature = 1.0;
        params.chosen_move_temperature_early = 1.0;
        params.chosen_move_prune = 5.0;
        let search = search_with_children(
            params,
            &[(0, 200, 0.0, 0.0), (1, 2, 0.5, 0.25)],
        );
        // Sampling may only ever pick the surviving child.
        for _ in 0..50 {
            assert_eq!(search.get_chosen_move().unwrap(), Loc(0));
        }
    }

    #[test]
    fn temperature_spreads_the_choice() {
        let mut params = SearchParams::for_tests();
        params.use_lcb_for_selection = false;
        params.chosen_move_temperature = 1.0;
        params.chosen_move_temperature_early = 1.0;
        params.chosen_move_prune = 0.0;
        let search = search_with_children(
            params,
            &[(0, 60, 0.0, 0.0), (1, 40, 0.0, 0.0)],
        );
        let mut counts = [0u32; 2];
        for _ in 0..400 {
            let mv = search.get_chosen_move().unwrap();
            counts[mv.index()] += 1;
        }
        assert!(counts[0] > counts[1], "visits should bias sampling: {:?}", counts);
        assert!(counts[1] > 50, "the smaller child must still be sampled: {:?}", counts);
    }
}
