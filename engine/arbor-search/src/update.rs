//! Stats aggregation after playouts.
//!
//! Leaf contributions enter a node under its stats spin flag as weighted
//! means. Interior nodes are re-aggregated from their children through the
//! dirty-counter mechanism: every backup increments the counter, and exactly
//! one thread (the one that saw the counter leave zero) performs the
//! recomputation, looping until it has absorbed all contributions that
//! arrived meanwhile.

use std::sync::atomic::Ordering;

use arbor_core::{Loc, Rules};
use tracing::warn;

use crate::dist::NormalCdfTable;
use crate::node::{NnOutput, NodeStats, SearchNode};
use crate::params::SearchParams;
use crate::search::{Search, SearchThread};

/// Per-child scratch used during one node recomputation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MoreNodeStats {
    pub stats: NodeStats,
    pub self_utility: f64,
    pub weight_adjusted: f64,
    pub prev_move_loc: Loc,
    pub stdev: f64,
    pub raw_policy: f64,
}

impl Default for MoreNodeStats {
    fn default() -> Self {
        MoreNodeStats {
            stats: NodeStats::default(),
            self_utility: 0.0,
            weight_adjusted: 0.0,
            prev_move_loc: Loc::NONE,
            stdev: 0.0,
            raw_policy: 0.0,
        }
    }
}

/// Utility of a (win-loss, no-result) pair, from White's perspective.
#[inline]
pub(crate) fn result_utility(params: &SearchParams, win_loss: f64, no_result: f64) -> f64 {
    win_loss * params.win_loss_utility_factor + no_result * params.no_result_utility_for_white
}

impl<R: Rules> Search<R> {
    /// Weight of one playout's contribution given the net's short-term error
    /// head. 1.0 when uncertainty weighting is off or unsupported.
    pub(crate) fn compute_weight_from_nn_output(&self, out: &NnOutput) -> f64 {
        let p = &self.params;
        if !p.use_uncertainty {
            return 1.0;
        }
        let Some(shortterm_error) = out.shortterm_winloss_error else {
            return 1.0;
        };
        let utility_uncertainty = p.win_loss_utility_factor * shortterm_error as f64;

        let powered = if p.uncertainty_exponent == 1.0 {
            utility_uncertainty
        } else if p.uncertainty_exponent == 0.5 {
            utility_uncertainty.sqrt()
        } else {
            utility_uncertainty.powf(p.uncertainty_exponent)
        };

        // The baseline caps the weight a perfectly-confident leaf can have.
        let baseline = p.uncertainty_coeff / p.uncertainty_max_weight;
        p.uncertainty_coeff / (powered + baseline)
    }

    /// Add one leaf contribution to `node` as a weighted mean update.
    pub(crate) fn add_leaf_value(
        &self,
        node: &SearchNode,
        win_loss: f64,
        no_result: f64,
        weight: f64,
        assume_no_existing_weight: bool,
    ) {
        let utility = result_utility(&self.params, win_loss, no_result);
        if !utility.is_finite() || !weight.is_finite() || weight <= 0.0 {
            self.record_invariant_failure(format!(
                "non-finite leaf contribution: utility {} weight {}",
                utility, weight
            ));
            return;
        }
        let utility_sq = utility * utility;
        let weight_sq = weight * weight;

        if assume_no_existing_weight {
            let _guard = node.lock_stats();
            node.stats.win_loss_avg.store(win_loss, Ordering::Release);
            node.stats.no_result_avg.store(no_result, Ordering::Release);
            node.stats.utility_avg.store(utility, Ordering::Release);
            node.stats.utility_sq_avg.store(utility_sq, Ordering::Release);
            node.stats.weight_sq_sum.store(weight_sq, Ordering::Release);
            node.stats.weight_sum.store(weight, Ordering::Release);
            let old_visits = node.stats.visits.fetch_add(1, Ordering::Release);
            drop(_guard);
            // Only possible when a transposition lands on a node that
            // gathered visits while we were installing its first value, e.g.
            // after a hash collision. Nothing sensible to do beyond noting it.
            if old_visits != 0 {
                warn!(old_visits, "fresh leaf already had visits");
            }
        } else {
            let _guard = node.lock_stats();
            let old_weight_sum = node.stats.weight_sum.load(Ordering::Relaxed);
            let new_weight_sum = old_weight_sum + weight;
            let mix = |avg: f64, v: f64| (avg * old_weight_sum + v * weight) / new_weight_sum;
            node.stats.win_loss_avg.store(
                mix(node.stats.win_loss_avg.load(Ordering::Relaxed), win_loss),
                Ordering::Release,
            );
            node.stats.no_result_avg.store(
                mix(node.stats.no_result_avg.load(Ordering::Relaxed), no_result),
                Ordering::Release,
            );
            node.stats.utility_avg.store(
                mix(node.stats.utility_avg.load(Ordering::Relaxed), utility),
                Ordering::Release,
            );
            node.stats.utility_sq_avg.store(
                mix(node.stats.utility_sq_avg.load(Ordering::Relaxed), utility_sq),
                Ordering::Release,
            );
            node.stats.weight_sq_sum.store(
                node.stats.weight_sq_sum.load(Ordering::Relaxed) + weight_sq,
                Ordering::Release,
            );
            node.stats.weight_sum.store(new_weight_sum, Ordering::Release);
            node.stats.visits.fetch_add(1, Ordering::Release);
        }
    }

    /// Add the node's own NN evaluation as a leaf contribution.
    pub(crate) fn add_current_nn_output_as_leaf_value(
        &self,
        node: &SearchNode,
        assume_no_existing_weight: bool,
    ) {
        let out = node.nn_output().expect("node must have an nn output").clone();
        let weight = self.compute_weight_from_nn_output(&out);
        self.add_leaf_value(
            node,
            out.win_loss(),
            out.no_result_prob as f64,
            weight,
            assume_no_existing_weight,
        );
    }

    /// Re-aggregate a node after a playout passed through it. The thread that
    /// moves the dirty counter off zero owns the recomputation and loops
    /// until it has absorbed every contribution that raced in.
    pub(crate) fn update_stats_after_playout(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread<R>,
        is_root: bool,
    ) {
        let old_dirty = node.dirty_counter.fetch_add(1, Ordering::AcqRel);
        if old_dirty < 0 {
            self.record_invariant_failure("dirty counter went negative".into());
            return;
        }
        // Someone else is already aggregating; they will see our increment.
        if old_dirty > 0 {
            return;
        }
        let mut num_visits_completed: i32 = 1;
        loop {
            self.recompute_node_stats(node, thread, num_visits_completed as i64, is_root);
            let old = node.dirty_counter.fetch_add(-num_visits_completed, Ordering::AcqRel);
            let new = old - num_visits_completed;
            if new <= 0 {
                if new < 0 {
                    self.record_invariant_failure("dirty counter underflow".into());
                }
                break;
            }
            // More contributions arrived during the recomputation.
            num_visits_completed = new;
        }
    }

    /// Recompute all child-dependent stats of `node`, plus add
    /// `num_visits_to_add` visits. Assumes the node has an NN output.
    pub(crate) fn recompute_node_stats(
        &self,
        node: &SearchNode,
        thread: &mut SearchThread<R>,
        num_visits_to_add: i64,
        is_root: bool,
    ) {
        let policy_size = self.tree.policy_size();
        let pla_sign = node.next_pla.sign();
        let buf = &mut thread.stats_buf;
        let mut num_good = 0usize;
        let mut orig_total_child_weight = 0.0f64;

        let root_policy = if is_root { self.run.root_policy.as_deref() } else { None };
        let nn_out = node.nn_output().expect("recompute requires an evaluated node").clone();

        for (loc, slot) in node.children(policy_size) {
            let child = self.tree.node(slot.child());
            let edge_visits = slot.edge_visits();
            let stats = child.stats.snapshot();
            if stats.visits <= 0 || stats.weight_sum <= 0.0 || edge_visits <= 0 {
                continue;
            }
            let entry = &mut buf[num_good];
            entry.stats = stats;
            entry.self_utility = pla_sign * stats.utility_avg;
            entry.weight_adjusted = stats.child_weight_share(edge_visits);
            entry.prev_move_loc = loc;
            entry.raw_policy = match root_policy {
                Some(p) => (p[loc.index()] as f64).max(1e-30),
                None => (nn_out.policy[loc.index()] as f64).max(1e-30),
            };
            orig_total_child_weight += entry.weight_adjusted;
            num_good += 1;
        }

        let mut current_total_child_weight = orig_total_child_weight;

        if self.params.use_noise_pruning && num_good > 0 {
            current_total_child_weight =
                prune_noise_weight(&self.params, &mut buf[..num_good], current_total_child_weight);
        }

        {
            let mut amount_to_subtract = 0.0;
            let mut amount_to_prune = 0.0;
            if is_root && self.params.root_noise_enabled && !self.params.use_noise_pruning {
                let max_child_weight = buf[..num_good]
                    .iter()
                    .map(|s| s.weight_adjusted)
                    .fold(0.0f64, f64::max);
                amount_to_subtract = self.params.chosen_move_subtract.min(max_child_weight / 64.0);
                amount_to_prune = self.params.chosen_move_prune.min(max_child_weight / 64.0);
            }
            downweight_bad_children_and_normalize_weight(
                &self.params,
                &mut buf[..num_good],
                current_total_child_weight,
                current_total_child_weight,
                amount_to_subtract,
                amount_to_prune,
            );
        }

        let mut win_loss_sum = 0.0f64;
        let mut no_result_sum = 0.0f64;
        let mut utility_sum = 0.0f64;
        let mut utility_sq_sum = 0.0f64;
        let mut weight_sq_sum = 0.0f64;
        let mut weight_sum = current_total_child_weight;
        for entry in &buf[..num_good] {
            let desired_weight = entry.weight_adjusted;
            let weight_scaling = if entry.stats.weight_sum > 0.0 {
                desired_weight / entry.stats.weight_sum
            } else {
                0.0
            };
            win_loss_sum += desired_weight * entry.stats.win_loss_avg;
            no_result_sum += desired_weight * entry.stats.no_result_avg;
            utility_sum += desired_weight * entry.stats.utility_avg;
            utility_sq_sum += desired_weight * entry.stats.utility_sq_avg;
            weight_sq_sum += weight_scaling * weight_scaling * entry.stats.weight_sq_sum;
        }

        // The node's own direct evaluation counts as one more contribution.
        {
            let win = nn_out.win_prob as f64;
            let loss = nn_out.loss_prob as f64;
            let no_result = nn_out.no_result_prob as f64;
            let utility = result_utility(&self.params, win - loss, no_result);
            let weight = self.compute_weight_from_nn_output(&nn_out);
            win_loss_sum += (win - loss) * weight;
            no_result_sum += no_result * weight;
            utility_sum += utility * weight;
            utility_sq_sum += utility * utility * weight;
            weight_sq_sum += weight * weight;
            weight_sum += weight;
        }

        let win_loss_avg = win_loss_sum / weight_sum;
        let no_result_avg = no_result_sum / weight_sum;
        let utility_avg = utility_sum / weight_sum;
        let utility_sq_avg = utility_sq_sum / weight_sum;

        if !win_loss_avg.is_finite() || !utility_avg.is_finite() || weight_sum <= 0.0 {
            self.record_invariant_failure(format!(
                "recomputed stats not finite: winloss {} utility {} weight {}",
                win_loss_avg, utility_avg, weight_sum
            ));
            return;
        }

        let _guard = node.lock_stats();
        node.stats.win_loss_avg.store(win_loss_avg, Ordering::Release);
        node.stats.no_result_avg.store(no_result_avg, Ordering::Release);
        node.stats.utility_avg.store(utility_avg, Ordering::Release);
        node.stats.utility_sq_avg.store(utility_sq_avg, Ordering::Release);
        node.stats.weight_sq_sum.store(weight_sq_sum, Ordering::Release);
        node.stats.weight_sum.store(weight_sum, Ordering::Release);
        node.stats.visits.fetch_add(num_visits_to_add, Ordering::Release);
    }
}

/// Downweight children whose utility is far below their siblings' weighted
/// mean, then renormalize so the buffer sums to `desired_total_weight`.
pub(crate) fn downweight_bad_children_and_normalize_weight(
    params: &SearchParams,
    stats_buf: &mut [MoreNodeStats],
    mut current_total_weight: f64,
    desired_total_weight: f64,
    amount_to_subtract: f64,
    amount_to_prune: f64,
) {
    let num_children = stats_buf.len();
    if num_children == 0 || current_total_weight <= 0.0 {
        return;
    }

    if params.value_weight_exponent == 0.0 {
        for entry in stats_buf.iter_mut() {
            if entry.weight_adjusted < amount_to_prune {
                current_total_weight -= entry.weight_adjusted;
                entry.weight_adjusted = 0.0;
                continue;
            }
            let new_weight = entry.weight_adjusted - amount_to_subtract;
            if new_weight <= 0.0 {
                current_total_weight -= entry.weight_adjusted;
                entry.weight_adjusted = 0.0;
            } else {
                current_total_weight -= amount_to_subtract;
                entry.weight_adjusted = new_weight;
            }
        }
        if current_total_weight != desired_total_weight && current_total_weight > 0.0 {
            let factor = desired_total_weight / current_total_weight;
            for entry in stats_buf.iter_mut() {
                entry.weight_adjusted *= factor;
            }
        }
        return;
    }

    let mut simple_value_sum = 0.0f64;
    for entry in stats_buf.iter_mut() {
        if entry.stats.visits == 0 {
            continue;
        }
        let weight = entry.weight_adjusted;
        let precision = 1.5 * weight.sqrt();
        // Keep a minimum variance regardless of the precision formula.
        const MIN_VARIANCE: f64 = 0.00000001;
        entry.stdev = (MIN_VARIANCE + 1.0 / precision).sqrt();
        simple_value_sum += entry.self_utility * weight;
    }
    let simple_value = simple_value_sum / current_total_weight;

    let cdf = NormalCdfTable::get();
    let mut total_new_unnorm_weight = 0.0f64;
    for entry in stats_buf.iter_mut() {
        if entry.stats.visits == 0 {
            continue;
        }
        if entry.weight_adjusted < amount_to_prune {
            current_total_weight -= entry.weight_adjusted;
            entry.weight_adjusted = 0.0;
            continue;
        }
        let new_weight = entry.weight_adjusted - amount_to_subtract;
        if new_weight <= 0.0 {
            current_total_weight -= entry.weight_adjusted;
            entry.weight_adjusted = 0.0;
        } else {
            current_total_weight -= amount_to_subtract;
            entry.weight_adjusted = new_weight;
        }

        let z = (entry.self_utility - simple_value) / entry.stdev;
        // Tiny floor keeps every child at some nonzero weight.
        let p = cdf.cdf(z) + 0.0001;
        entry.weight_adjusted *= p.powf(params.value_weight_exponent);
        total_new_unnorm_weight += entry.weight_adjusted;
    }

    if total_new_unnorm_weight > 0.0 {
        let factor = desired_total_weight / total_new_unnorm_weight;
        for entry in stats_buf.iter_mut() {
            entry.weight_adjusted *= factor;
        }
    }
}

/// Walk children in policy order tracking the running utility average. A
/// child whose utility lags the running average loses the part of its weight
/// that exceeds twice its raw-policy share, scaled by the utility gap.
/// Returns the new total weight.
pub(crate) fn prune_noise_weight(
    params: &SearchParams,
    stats_buf: &mut [MoreNodeStats],
    total_child_weight: f64,
) -> f64 {
    if stats_buf.len() <= 1 || total_child_weight <= 0.00001 {
        return total_child_weight;
    }

    let mut utility_sum_so_far = 0.0f64;
    let mut weight_sum_so_far = 0.0f64;
    let mut raw_policy_sum_so_far = 0.0f64;
    for entry in stats_buf.iter_mut() {
        let utility = entry.self_utility;
        let old_weight = entry.weight_adjusted;
        let raw_policy = entry.raw_policy;

        let mut new_weight = old_weight;
        if weight_sum_so_far > 0.0 && raw_policy_sum_so_far > 0.0 {
            let avg_utility_so_far = utility_sum_so_far / weight_sum_so_far;
            let utility_gap = avg_utility_so_far - utility;
            if utility_gap > 0.0 {
                let weight_share_from_raw_policy =
                    weight_sum_so_far * raw_policy / raw_policy_sum_so_far;
                // Allow up to double the proper share before pruning.
                let lenient_share = 2.0 * weight_share_from_raw_policy;
                if old_weight > lenient_share {
                    let excess_weight = old_weight - lenient_share;
                    let mut weight_to_subtract = excess_weight
                        * (1.0 - (-utility_gap / params.noise_prune_utility_scale).exp());
                    if weight_to_subtract > params.noise_pruning_cap {
                        weight_to_subtract = params.noise_pruning_cap;
                    }
                    new_weight = old_weight - weight_to_subtract;
                    entry.weight_adjusted = new_weight;
                }
            }
        }
        utility_sum_so_far += utility * new_weight;
        weight_sum_so_far += new_weight;
        raw_policy_sum_so_far += raw_policy;
    }
    weight_sum_so_far
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(self_utility: f64, weight: f64, raw_policy: f64, visits: i64) -> MoreNodeStats {
        MoreNodeStats {
            stats: NodeStats {
                visits,
                weight_sum: weight,
                weight_sq_sum: weight,
                ..Default::default()
            },
            self_utility,
            weight_adjusted: weight,
            prev_move_loc: Loc(0),
            stdev: 0.0,
            raw_policy,
        }
    }

    #[test]
    fn result_utility_combines_factors() {
        let mut params = SearchParams::default();
        params.win_loss_utility_factor = 1.0;
        params.no_result_utility_for_white = 0.5;
        assert_eq!(result_utility(&params, 1.0, 0.0), 1.0);
        assert_eq!(result_utility(&params, 0.0, 1.0), 0.5);
        assert_eq!(result_utility(&params, -1.0, 0.0), -1.0);
    }

    #[test]
    fn noise_pruning_trims_overweighted_bad_child() {
        let mut params = SearchParams::default();
        params.noise_prune_utility_scale = 0.1;
        params.noise_pruning_cap = 1e50;
        // First child: good utility, half the policy. Second child: bad
        // utility but weight far beyond its tiny policy share.
        let mut buf = vec![entry(0.5, 10.0, 0.5, 10), entry(-0.5, 10.0, 0.01, 10)];
        let total = 20.0;
        let new_total = prune_noise_weight(&params, &mut buf, total);
        assert!(buf[1].weight_adjusted < 10.0, "bad child must lose weight");
        assert!(buf[0].weight_adjusted == 10.0, "good child keeps weight");
        assert!(new_total < total);
    }

    #[test]
    fn noise_pruning_spares_policy_justified_weight() {
        let params = SearchParams::default();
        // The second child is bad but its weight matches its policy share.
        let mut buf = vec![entry(0.5, 10.0, 0.5, 10), entry(-0.5, 8.0, 0.45, 8)];
        let new_total = prune_noise_weight(&params, &mut buf, 18.0);
        assert_eq!(buf[1].weight_adjusted, 8.0);
        assert!((new_total - 18.0).abs() < 1e-12);
    }

    #[test]
    fn downweight_preserves_total_weight() {
        let mut params = SearchParams::default();
        params.value_weight_exponent = 0.25;
        let mut buf = vec![entry(0.3, 10.0, 0.5, 10), entry(-0.3, 10.0, 0.5, 10)];
        downweight_bad_children_and_normalize_weight(&params, &mut buf, 20.0, 20.0, 0.0, 0.0);
        let total: f64 = buf.iter().map(|e| e.weight_adjusted).sum();
        assert!((total - 20.0).abs() < 1e-9);
        assert!(buf[0].weight_adjusted > buf[1].weight_adjusted);
    }

    #[test]
    fn downweight_exponent_zero_prunes_and_subtracts() {
        let mut params = SearchParams::default();
        params.value_weight_exponent = 0.0;
        let mut buf = vec![entry(0.0, 10.0, 0.5, 10), entry(0.0, 0.5, 0.5, 1)];
        // Prune anything under 1.0, subtract 1.0 from the rest, renormalize
        // back to the original total.
        downweight_bad_children_and_normalize_weight(&params, &mut buf, 10.5, 10.5, 1.0, 1.0);
        assert_eq!(buf[1].weight_adjusted, 0.0);
        assert!((buf[0].weight_adjusted - 10.5).abs() < 1e-9);
    }
}
