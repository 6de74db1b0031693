//! Search configuration parameters.
//!
//! One immutable value carries every tunable of the search. A `SearchParams`
//! never changes while a search is running; the bot controller stops and
//! restarts the search to swap parameters.

use arbor_core::Player;
use serde::Deserialize;

use crate::error::SearchError;

/// Configuration for one search. Immutable per run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Scaling of the [-1,1] win/loss value into utility.
    pub win_loss_utility_factor: f64,
    /// Utility of a no-result game, from White's perspective.
    pub no_result_utility_for_white: f64,

    /// Constant factor on exploration.
    pub cpuct_exploration: f64,
    /// Factor on log-scaling exploration.
    pub cpuct_exploration_log: f64,
    /// Visit count at which log exploration starts to matter.
    pub cpuct_exploration_base: f64,

    /// Prior estimate of the utility stdev at a node.
    pub cpuct_utility_stdev_prior: f64,
    /// Weight of that prior against the observed stdev.
    pub cpuct_utility_stdev_prior_weight: f64,
    /// Strength of cpuct scaling with the blended utility stdev.
    pub cpuct_utility_stdev_scale: f64,

    /// Max first-play-urgency reduction for unexplored children.
    pub fpu_reduction_max: f64,
    /// Blend FPU this fraction of the way toward assuming a loss.
    pub fpu_loss_prop: f64,
    /// Blend between parent average and parent net value by the proportion
    /// of policy mass already visited.
    pub fpu_parent_weight_by_visited_policy: bool,
    /// Power applied to the visited-policy proportion for that blending.
    pub fpu_parent_weight_by_visited_policy_pow: f64,
    /// Fixed blend: 0 = parent average, 1 = parent net value.
    pub fpu_parent_weight: f64,

    /// Downweight children whose values are much worse than their siblings'.
    pub value_weight_exponent: f64,
    /// Prune child weight that greatly exceeds its policy-prior share.
    pub use_noise_pruning: bool,
    /// Utility-difference scale at which noise pruning takes effect.
    pub noise_prune_utility_scale: f64,
    /// Maximum weight noise pruning may remove from one child.
    pub noise_pruning_cap: f64,

    /// Weight playouts by the net's short-term value uncertainty.
    pub use_uncertainty: bool,
    /// Visits weight corresponding to an uncertainty of 1 utility.
    pub uncertainty_coeff: f64,
    /// Weight scales inversely with this power of the uncertainty.
    pub uncertainty_exponent: f64,
    /// Cap on the weight a single playout can have.
    pub uncertainty_max_weight: f64,

    /// Share nodes between transposed paths via the node table.
    pub use_graph_search: bool,
    /// Chance to deepen a transposed branch despite lagging edge visits.
    pub graph_search_catch_up_leak_prob: f64,

    /// Mix Dirichlet noise into the root policy.
    pub root_noise_enabled: bool,
    /// Alpha times the number of legal moves; split evenly per move.
    pub root_dirichlet_noise_total_concentration: f64,
    /// Root policy is `weight * noise + (1 - weight) * policy`.
    pub root_dirichlet_noise_weight: f64,

    /// Power applied to root policy probabilities.
    pub root_policy_temperature: f64,
    /// Same, early in the game.
    pub root_policy_temperature_early: f64,
    /// FPU reduction at the root.
    pub root_fpu_reduction_max: f64,
    /// FPU loss blending at the root.
    pub root_fpu_loss_prop: f64,
    /// Search only one member of each symmetry orbit of root moves.
    pub root_symmetry_pruning: bool,
    /// Funnel `sqrt(coeff * prior * total_visits)` visits down each visited
    /// root child before ordinary selection may starve it.
    pub root_desired_per_child_visits_coeff: f64,
    /// Blend the root policy toward uniform to widen exploration.
    pub wide_root_noise: f64,
    /// Prune root moves the rules report as strictly useless.
    pub root_prune_useless_moves: bool,

    /// Chosen move is roughly proportional to `visits^(1/T)`.
    pub chosen_move_temperature: f64,
    /// Temperature at the start of the game.
    pub chosen_move_temperature_early: f64,
    /// Halflife, in turns on a 19x19-equivalent board, of the decay from
    /// early temperature to standard temperature.
    pub chosen_move_temperature_halflife: f64,
    /// Subtract this many visits from every move before applying temperature.
    pub chosen_move_subtract: f64,
    /// Outright prune moves with fewer than this many visits.
    pub chosen_move_prune: f64,

    /// Use lower-confidence-bound move selection.
    pub use_lcb_for_selection: bool,
    /// How many stdevs wide the confidence bound is.
    pub lcb_stdevs: f64,
    /// A move needs this proportion of the top move's visits for LCB override.
    pub min_visit_prop_for_lcb: f64,
    /// Historical compatibility switch for a long-fixed LCB defect. Only the
    /// fixed behavior is implemented; `false` is rejected by `validate`.
    pub use_non_buggy_lcb: bool,

    /// Search as if we had this many extra doublings of playouts.
    pub playout_doubling_advantage: f64,
    /// Apply the advantage for this player; the opponent gets the negation.
    /// Empty means the root player.
    pub playout_doubling_advantage_pla: Option<Player>,

    /// Scale net policy probabilities by this temperature everywhere.
    pub nn_policy_temperature: f64,

    /// Repetition count beyond which a playout path is scored no-result.
    pub simple_repetition_bound_gt: u32,

    /// log2 of the number of node-table shards for graph search.
    pub node_table_shards_power_of_two: u32,
    /// Virtual losses one thread adds while descending.
    pub num_virtual_losses_per_thread: f64,

    /// Number of worker threads.
    pub num_threads: usize,
    /// Max root visits, counting visits carried over by tree reuse.
    pub max_visits: i64,
    /// Max playouts this run, not counting tree reuse.
    pub max_playouts: i64,
    /// Max seconds to think.
    pub max_time: f64,

    /// Caps while pondering.
    pub max_visits_pondering: i64,
    pub max_playouts_pondering: i64,
    pub max_time_pondering: f64,

    /// Seconds reserved for lag under a time control.
    pub lag_buffer: f64,

    /// Assume this fraction of tree-reuse time is regained on the next move.
    pub tree_reuse_carry_over_time_factor: f64,
    /// Prefer thinking this factor longer than the base time control says.
    pub overallocate_time_factor: f64,
    /// Think this factor longer in the midgame.
    pub midgame_time_factor: f64,
    /// Turn with midgame weight 1.0, for a 19x19-equivalent board.
    pub midgame_turn_peak_time: f64,
    /// Exponential decay scale of midgame weight back toward 1.0.
    pub endgame_turn_time_decay: f64,
    /// Spend up to this factor less time on obvious moves.
    pub obvious_moves_time_factor: f64,
    /// Max policy entropy for a move to count as (1/e) obvious.
    pub obvious_moves_policy_entropy_tolerance: f64,
    /// Max surprise logits for the search result to count as (1/e) obvious.
    pub obvious_moves_policy_surprise_tolerance: f64,

    /// Stop when no other move can reach this proportion of the top move's
    /// visits within the remaining budget. Zero disables.
    pub futile_visits_threshold: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            win_loss_utility_factor: 1.0,
            no_result_utility_for_white: 0.0,

            cpuct_exploration: 1.0,
            cpuct_exploration_log: 0.45,
            cpuct_exploration_base: 500.0,
            cpuct_utility_stdev_prior: 0.40,
            cpuct_utility_stdev_prior_weight: 2.0,
            cpuct_utility_stdev_scale: 0.85,

            fpu_reduction_max: 0.2,
            fpu_loss_prop: 0.0,
            fpu_parent_weight_by_visited_policy: true,
            fpu_parent_weight_by_visited_policy_pow: 2.0,
            fpu_parent_weight: 0.0,

            value_weight_exponent: 0.25,
            use_noise_pruning: true,
            noise_prune_utility_scale: 0.15,
            noise_pruning_cap: 1e50,

            use_uncertainty: true,
            uncertainty_coeff: 0.25,
            uncertainty_exponent: 1.0,
            uncertainty_max_weight: 8.0,

            use_graph_search: false,
            graph_search_catch_up_leak_prob: 0.0,

            root_noise_enabled: false,
            root_dirichlet_noise_total_concentration: 10.83,
            root_dirichlet_noise_weight: 0.25,

            root_policy_temperature: 1.0,
            root_policy_temperature_early: 1.0,
            root_fpu_reduction_max: 0.1,
            root_fpu_loss_prop: 0.0,
            root_symmetry_pruning: false,
            root_desired_per_child_visits_coeff: 0.0,
            wide_root_noise: 0.0,
            root_prune_useless_moves: false,

            chosen_move_temperature: 0.0,
            chosen_move_temperature_early: 0.0,
            chosen_move_temperature_halflife: 19.0,
            chosen_move_subtract: 0.0,
            chosen_move_prune: 1.0,

            use_lcb_for_selection: true,
            lcb_stdevs: 5.0,
            min_visit_prop_for_lcb: 0.15,
            use_non_buggy_lcb: true,

            playout_doubling_advantage: 0.0,
            playout_doubling_advantage_pla: None,

            nn_policy_temperature: 1.0,

            simple_repetition_bound_gt: 0,

            node_table_shards_power_of_two: 4,
            num_virtual_losses_per_thread: 1.0,

            num_threads: 1,
            max_visits: i64::MAX / 2,
            max_playouts: i64::MAX / 2,
            max_time: 1e20,

            max_visits_pondering: i64::MAX / 2,
            max_playouts_pondering: i64::MAX / 2,
            max_time_pondering: 1e20,

            lag_buffer: 0.0,

            tree_reuse_carry_over_time_factor: 0.0,
            overallocate_time_factor: 1.0,
            midgame_time_factor: 1.0,
            midgame_turn_peak_time: 130.0,
            endgame_turn_time_decay: 100.0,
            obvious_moves_time_factor: 1.0,
            obvious_moves_policy_entropy_tolerance: 0.30,
            obvious_moves_policy_surprise_tolerance: 0.15,

            futile_visits_threshold: 0.0,
        }
    }
}

impl SearchParams {
    /// Params for tests: deterministic, single-threaded, no noise.
    pub fn for_tests() -> SearchParams {
        SearchParams {
            use_uncertainty: false,
            value_weight_exponent: 0.0,
            use_noise_pruning: false,
            use_lcb_for_selection: false,
            cpuct_utility_stdev_scale: 0.0,
            fpu_parent_weight_by_visited_policy: false,
            max_visits: 100,
            ..SearchParams::default()
        }
    }

    /// Params for tests with the full modern feature set enabled.
    pub fn for_tests_v2() -> SearchParams {
        SearchParams {
            use_uncertainty: true,
            use_noise_pruning: true,
            value_weight_exponent: 0.25,
            use_lcb_for_selection: true,
            max_visits: 100,
            ..SearchParams::default()
        }
    }

    pub fn with_num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn with_max_visits(mut self, n: i64) -> Self {
        self.max_visits = n;
        self
    }

    pub fn with_graph_search(mut self, on: bool) -> Self {
        self.use_graph_search = on;
        self
    }

    /// Check the parameter set for internally inconsistent or out-of-range
    /// values. Called by the bot controller at construction and on every
    /// parameter change.
    pub fn validate(&self) -> Result<(), SearchError> {
        fn bad(msg: impl Into<String>) -> Result<(), SearchError> {
            Err(SearchError::InvalidConfig(msg.into()))
        }
        if self.num_threads == 0 {
            return bad("num_threads must be positive");
        }
        if self.max_visits <= 0 || self.max_playouts <= 0 || self.max_time < 0.0 {
            return bad("search caps must be positive");
        }
        if self.max_visits_pondering <= 0 || self.max_playouts_pondering <= 0 {
            return bad("pondering caps must be positive");
        }
        if !(0.0..=1.0).contains(&self.graph_search_catch_up_leak_prob) {
            return bad("graph_search_catch_up_leak_prob must be in [0,1]");
        }
        if self.root_noise_enabled && self.root_dirichlet_noise_total_concentration <= 0.0 {
            return bad("root_dirichlet_noise_total_concentration must be positive");
        }
        if !(0.0..=1.0).contains(&self.root_dirichlet_noise_weight) {
            return bad("root_dirichlet_noise_weight must be in [0,1]");
        }
        if self.use_uncertainty
            && (self.uncertainty_coeff <= 0.0 || self.uncertainty_max_weight <= 0.0)
        {
            return bad("uncertainty_coeff and uncertainty_max_weight must be positive");
        }
        if self.chosen_move_temperature < 0.0 || self.chosen_move_temperature_early < 0.0 {
            return bad("chosen move temperatures must be non-negative");
        }
        if self.node_table_shards_power_of_two > 16 {
            return bad("node_table_shards_power_of_two must be at most 16");
        }
        if self.nn_policy_temperature <= 0.0 {
            return bad("nn_policy_temperature must be positive");
        }
        if self.num_virtual_losses_per_thread < 0.0 {
            return bad("num_virtual_losses_per_thread must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.min_visit_prop_for_lcb) {
            return bad("min_visit_prop_for_lcb must be in [0,1]");
        }
        if !self.use_non_buggy_lcb {
            return bad("use_non_buggy_lcb=false is not supported; only the fixed LCB behavior exists");
        }
        Ok(())
    }

    /// Parameters that cannot change without invalidating the current tree.
    /// `set_params_no_clearing` refuses changes to these.
    pub fn fail_if_differs_on_unchangeable(
        &self,
        other: &SearchParams,
    ) -> Result<(), SearchError> {
        if self.use_graph_search != other.use_graph_search {
            return Err(SearchError::InvalidConfig(
                "use_graph_search cannot change without clearing the search".into(),
            ));
        }
        if self.node_table_shards_power_of_two != other.node_table_shards_power_of_two {
            return Err(SearchError::InvalidConfig(
                "node_table_shards_power_of_two cannot change without clearing the search".into(),
            ));
        }
        Ok(())
    }
}
