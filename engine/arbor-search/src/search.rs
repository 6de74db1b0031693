//! The search engine: shared tree, parallel playout workers, root handling.
//!
//! One `Search` owns the tree for the current position. `run_whole_search`
//! spawns the configured worker threads; each worker repeatedly runs one
//! playout (selection from the root, expansion or terminal evaluation at the
//! leaf, backup along the path) against the shared tree, coordinating purely
//! through atomics on the nodes. The caller-facing mutators (`set_position`,
//! `make_move`, parameter swaps) require exclusive access and are only used
//! while no workers are running; the bot controller enforces that protocol.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use arbor_core::{Loc, Player, Rules};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Gamma};
use tracing::{debug, error, info, warn};

use crate::error::{PlayoutOutcome, SearchError};
use crate::nneval::{NnEvaluator, NnInputParams, SymmetrySpec};
use crate::node::{NodeId, NnOutput, SearchNode};
use crate::params::SearchParams;
use crate::timecontrols::TimeControls;
use crate::tree::{NodeKey, SearchTree};
use crate::update::MoreNodeStats;

/// Periodic analysis callback delivered during a running search. The callback
/// observes a read-only view and must not call back into the controller.
pub struct AnalyzeCallback<'a, R: Rules> {
    pub period: f64,
    pub first_after: f64,
    pub callback: &'a mut dyn FnMut(&Search<R>),
}

/// Per-worker scratch state. Boards and histories are replayed along the
/// playout path on these copies; nodes never store game state.
pub(crate) struct SearchThread<R: Rules> {
    pub thread_idx: usize,
    pub rng: ChaCha20Rng,
    pub board: R::Board,
    pub hist: R::History,
    pub pla: Player,
    pub stats_buf: Vec<MoreNodeStats>,
    /// Nodes entered this playout, root first.
    path_nodes: Vec<NodeId>,
    /// Edges traversed: (parent, logical child slot index).
    path_edges: Vec<(NodeId, usize)>,
    playouts_since_stop_check: u32,
}

impl<R: Rules> SearchThread<R> {
    fn new(search: &Search<R>, thread_idx: usize) -> SearchThread<R> {
        let salt = search
            .run
            .root_visits_at_start
            .wrapping_mul(0x9e3779b97f4a7c15u64 as i64)
            .wrapping_add(thread_idx as i64);
        SearchThread {
            thread_idx,
            rng: ChaCha20Rng::seed_from_u64(search.seed ^ salt as u64),
            board: search.root_board.clone(),
            hist: search.root_hist.clone(),
            pla: search.root_pla,
            stats_buf: Vec::new(),
            path_nodes: Vec::new(),
            path_edges: Vec::new(),
            playouts_since_stop_check: 0,
        }
    }
}

/// Per-run state, rebuilt by `begin_search`.
pub(crate) struct RunState {
    /// Root policy after temperature, wide-root noise and Dirichlet noise.
    pub root_policy: Option<Vec<f32>>,
    /// For each policy position pruned by root symmetry: the canonical move.
    pub root_sym_map: Option<Vec<Option<Loc>>>,
    pub start_time: Instant,
    pub max_visits: i64,
    pub max_playouts: i64,
    pub max_time: f64,
    pub playouts: AtomicI64,
    pub nn_failures: AtomicI64,
    pub root_visits_at_start: i64,
    pub stop: Arc<AtomicBool>,
    invariant_failed: AtomicBool,
    invariant_msg: Mutex<Option<String>>,
}

impl RunState {
    fn idle() -> RunState {
        RunState {
            root_policy: None,
            root_sym_map: None,
            start_time: Instant::now(),
            max_visits: i64::MAX / 2,
            max_playouts: i64::MAX / 2,
            max_time: 1e20,
            playouts: AtomicI64::new(0),
            nn_failures: AtomicI64::new(0),
            root_visits_at_start: 0,
            stop: Arc::new(AtomicBool::new(false)),
            invariant_failed: AtomicBool::new(false),
            invariant_msg: Mutex::new(None),
        }
    }
}

/// Result of child selection at one node.
enum Selection {
    /// Descend an existing edge.
    Existing { slot_idx: usize, child: NodeId, loc: Loc },
    /// Expand a new edge for this move.
    New { loc: Loc },
    /// No selectable move (no legal moves and no children).
    None,
}

/// A Monte-Carlo tree/graph search over one root position.
pub struct Search<R: Rules> {
    pub(crate) params: SearchParams,
    pub(crate) rules: Arc<R>,
    pub(crate) nn: Arc<NnEvaluator<R>>,
    seed: u64,
    root_pla: Player,
    root_board: R::Board,
    root_hist: R::History,
    pub(crate) tree: SearchTree,
    pub(crate) root: Option<NodeId>,
    pub(crate) run: RunState,
    move_rng: Mutex<ChaCha20Rng>,
    /// Wall time and final visit count of the previous run, for the
    /// tree-reuse time carryover hook.
    prev_run_time: f64,
    prev_run_visits: i64,
}

impl<R: Rules> Search<R> {
    pub fn new(
        params: SearchParams,
        rules: Arc<R>,
        nn: Arc<NnEvaluator<R>>,
        board: R::Board,
        hist: R::History,
        pla: Player,
        seed: u64,
    ) -> Result<Search<R>, SearchError> {
        params.validate()?;
        let tree = SearchTree::new(
            rules.policy_size(),
            params.use_graph_search,
            params.node_table_shards_power_of_two,
        );
        Ok(Search {
            move_rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed.wrapping_add(1))),
            params,
            rules,
            nn,
            seed,
            root_pla: pla,
            root_board: board,
            root_hist: hist,
            tree,
            root: None,
            run: RunState::idle(),
            prev_run_time: 0.0,
            prev_run_visits: 0,
        })
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn rules(&self) -> &Arc<R> {
        &self.rules
    }

    pub fn root_pla(&self) -> Player {
        self.root_pla
    }

    pub fn root_board(&self) -> &R::Board {
        &self.root_board
    }

    pub fn root_hist(&self) -> &R::History {
        &self.root_hist
    }

    /// Visits accumulated at the root, including tree reuse.
    pub fn root_visits(&self) -> i64 {
        self.root.map(|id| self.tree.node(id).stats.visits.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// Playouts performed by the current (or last) run.
    pub fn num_playouts(&self) -> i64 {
        self.run.playouts.load(Ordering::Acquire)
    }

    /// NN evaluation failures in the current (or last) run.
    pub fn num_nn_failures(&self) -> i64 {
        self.run.nn_failures.load(Ordering::Acquire)
    }

    pub fn num_nodes(&self) -> usize {
        self.tree.num_nodes()
    }

    pub(crate) fn root_node(&self) -> Option<&SearchNode> {
        self.root.map(|id| self.tree.node(id))
    }

    /// The root policy actually used for selection this run, after root
    /// policy temperature, wide-root noise and Dirichlet noise. `None` before
    /// a search has begun.
    pub fn root_policy_adjusted(&self) -> Option<&[f32]> {
        self.run.root_policy.as_deref()
    }

    /// The root's raw NN policy, if the root has been evaluated.
    pub fn root_policy_raw(&self) -> Option<&[f32]> {
        self.root_node().and_then(|n| n.nn_output()).map(|out| &*out.policy)
    }

    /// Replace the position, dropping the whole tree.
    pub fn set_position(&mut self, pla: Player, board: R::Board, hist: R::History) {
        self.root_pla = pla;
        self.root_board = board;
        self.root_hist = hist;
        self.clear_search();
    }

    /// Replace parameters, dropping the whole tree.
    pub fn set_params(&mut self, params: SearchParams) -> Result<(), SearchError> {
        params.validate()?;
        self.params = params;
        self.clear_search();
        Ok(())
    }

    /// Replace parameters while keeping the tree. Refuses changes to
    /// parameters the existing tree depends on.
    pub fn set_params_no_clearing(&mut self, params: SearchParams) -> Result<(), SearchError> {
        params.validate()?;
        self.params.fail_if_differs_on_unchangeable(&params)?;
        self.params = params;
        Ok(())
    }

    /// Drop all nodes. The next search starts from scratch.
    pub fn clear_search(&mut self) {
        self.tree = SearchTree::new(
            self.rules.policy_size(),
            self.params.use_graph_search,
            self.params.node_table_shards_power_of_two,
        );
        self.root = None;
        self.run = RunState::idle();
        self.prev_run_time = 0.0;
        self.prev_run_visits = 0;
    }

    /// Play a move at the root. The subtree under the chosen edge survives
    /// and becomes the new root; everything else is released.
    pub fn make_move(&mut self, loc: Loc, pla: Player) -> Result<(), SearchError> {
        if pla != self.root_pla {
            return Err(SearchError::IllegalRequest(format!(
                "it is {:?}'s turn, not {:?}'s",
                self.root_pla, pla
            )));
        }
        if !self.rules.is_legal(&self.root_board, &self.root_hist, loc, pla) {
            return Err(SearchError::IllegalMove { loc, pla });
        }
        self.rules
            .make_move(&mut self.root_board, &mut self.root_hist, loc, pla)
            .map_err(|e| SearchError::IllegalMove { loc: e.loc, pla: e.pla })?;
        self.root_pla = pla.opponent();

        let child = self.root.and_then(|root_id| {
            self.tree
                .node(root_id)
                .children(self.tree.policy_size())
                .find(|(l, _)| *l == loc)
                .map(|(_, slot)| slot.child())
                .filter(|c| !c.is_none())
        });
        match child {
            Some(child_id) => {
                let (new_tree, new_root) = self.tree.reroot_from(child_id);
                self.tree = new_tree;
                self.root = Some(new_root);
            }
            None => {
                self.tree = SearchTree::new(
                    self.rules.policy_size(),
                    self.params.use_graph_search,
                    self.params.node_table_shards_power_of_two,
                );
                self.root = None;
            }
        }
        self.run = RunState::idle();
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Whole-search orchestration
    // ----------------------------------------------------------------------

    /// Run the search to completion under the given stop flag, time controls
    /// and search factor, firing analysis callbacks if requested.
    pub fn run_whole_search(
        &mut self,
        stop: Arc<AtomicBool>,
        tc: &TimeControls,
        search_factor: f64,
        pondering: bool,
        mut analyze: Option<AnalyzeCallback<'_, R>>,
    ) -> Result<(), SearchError> {
        if self.rules.is_game_over(&self.root_board, &self.root_hist) {
            return Err(SearchError::IllegalRequest("the game is already over".into()));
        }
        self.begin_search(stop, tc, search_factor, pondering)?;

        let num_threads = self.params.num_threads;
        let done = (Mutex::new(num_threads), Condvar::new());
        let this: &Search<R> = self;
        std::thread::scope(|scope| {
            for ti in 0..num_threads {
                let done = &done;
                scope.spawn(move || {
                    this.worker_loop(ti);
                    let mut active = done.0.lock().expect("worker counter poisoned");
                    *active -= 1;
                    done.1.notify_all();
                });
            }

            let mut active = done.0.lock().expect("worker counter poisoned");
            match analyze.as_mut() {
                None => {
                    while *active > 0 {
                        active = done.1.wait(active).expect("worker counter poisoned");
                    }
                }
                Some(cb) => {
                    let mut next_cb = self.run.start_time
                        + std::time::Duration::from_secs_f64(cb.first_after.max(0.0));
                    loop {
                        if *active == 0 {
                            break;
                        }
                        let now = Instant::now();
                        if now >= next_cb {
                            drop(active);
                            (cb.callback)(this);
                            next_cb = Instant::now()
                                + std::time::Duration::from_secs_f64(cb.period.max(0.001));
                            active = done.0.lock().expect("worker counter poisoned");
                            continue;
                        }
                        let (guard, _) = done
                            .1
                            .wait_timeout(active, next_cb - now)
                            .expect("worker counter poisoned");
                        active = guard;
                    }
                }
            }
        });

        let elapsed = self.run.start_time.elapsed().as_secs_f64();
        let playouts = self.num_playouts();
        self.prev_run_time = elapsed;
        self.prev_run_visits = self.root_visits();
        info!(
            visits = self.root_visits(),
            playouts,
            nodes = self.tree.num_nodes(),
            seconds = format!("{:.3}", elapsed),
            pps = format!("{:.0}", playouts as f64 / elapsed.max(1e-9)),
            pondering,
            "search finished"
        );

        if self.run.invariant_failed.load(Ordering::Acquire) {
            let msg = self
                .run
                .invariant_msg
                .lock()
                .expect("invariant message poisoned")
                .clone()
                .unwrap_or_else(|| "unknown".into());
            return Err(SearchError::InvariantViolation(msg));
        }
        Ok(())
    }

    /// Run a full search and return the chosen move.
    pub fn run_whole_search_and_get_move(
        &mut self,
        stop: Arc<AtomicBool>,
        tc: &TimeControls,
        search_factor: f64,
        analyze: Option<AnalyzeCallback<'_, R>>,
    ) -> Result<Loc, SearchError> {
        self.run_whole_search(stop, tc, search_factor, false, analyze)?;
        self.get_chosen_move()
    }

    /// Prepare the root for a new run: expand and evaluate it if needed,
    /// compute the adjusted root policy and symmetry pruning map, and fix the
    /// effective caps.
    fn begin_search(
        &mut self,
        stop: Arc<AtomicBool>,
        tc: &TimeControls,
        search_factor: f64,
        pondering: bool,
    ) -> Result<(), SearchError> {
        let root_id = match self.root {
            Some(id) => id,
            None => {
                let id = self
                    .tree
                    .alloc_node(self.root_pla)
                    .ok_or_else(|| SearchError::InvariantViolation("node arena exhausted".into()))?;
                if self.tree.graph_search() {
                    // Register the root so transposing paths can rejoin it.
                    let key = NodeKey {
                        situation: self.rules.situation_hash(&self.root_board, self.root_pla),
                        context: self.rules.graph_context_hash(&self.root_hist),
                        pla: self.root_pla,
                    };
                    self.tree.register_node(key, id);
                }
                self.root = Some(id);
                id
            }
        };

        // Evaluate the root synchronously before any worker starts.
        let root_node = self.tree.node(root_id);
        if root_node.nn_output().is_none() {
            let input_params = self.nn_input_params_for(self.root_pla);
            let out = self
                .nn
                .evaluate(&self.root_board, &self.root_hist, self.root_pla, &input_params, false)
                .map_err(|e| SearchError::NoResult(format!("root evaluation failed: {}", e)))?;
            let installed = root_node.set_nn_output(out);
            if root_node.stats.visits.load(Ordering::Acquire) == 0 {
                self.add_current_nn_output_as_leaf_value(root_node, installed);
            }
        }

        let root_visits_at_start = root_node.stats.visits.load(Ordering::Acquire);
        let reuse_fraction = if self.prev_run_visits > 0 {
            (root_visits_at_start as f64 / self.prev_run_visits as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let root_policy = self.compute_root_policy(root_id, root_visits_at_start);
        let policy_entropy = policy_entropy(&root_policy);
        let root_sym_map = self.compute_root_symmetry_map();

        let carryover = self.params.tree_reuse_carry_over_time_factor * self.prev_run_time * reuse_fraction;
        let turn = self.rules.turn_number(&self.root_hist);
        let (w, h) = self.rules.board_dims();
        let budget = crate::timecontrols::effective_budget(
            &self.params,
            tc,
            turn,
            (w * h) as f64,
            policy_entropy,
            carryover,
        );

        let (base_visits, base_playouts, base_time) = if pondering {
            (
                self.params.max_visits_pondering,
                self.params.max_playouts_pondering,
                self.params.max_time_pondering,
            )
        } else {
            (self.params.max_visits, self.params.max_playouts, self.params.max_time)
        };
        let factor = search_factor.max(1e-9);
        let scale = |v: i64| -> i64 {
            if v >= i64::MAX / 4 {
                v
            } else {
                ((v as f64 * factor).ceil() as i64).max(1)
            }
        };

        self.run = RunState {
            root_policy: Some(root_policy),
            root_sym_map,
            start_time: Instant::now(),
            max_visits: scale(base_visits),
            max_playouts: scale(base_playouts),
            max_time: (base_time.min(budget)) * factor,
            playouts: AtomicI64::new(0),
            nn_failures: AtomicI64::new(0),
            root_visits_at_start,
            stop,
            invariant_failed: AtomicBool::new(false),
            invariant_msg: Mutex::new(None),
        };
        debug!(
            visits_at_start = root_visits_at_start,
            max_visits = self.run.max_visits,
            max_playouts = self.run.max_playouts,
            max_time = self.run.max_time,
            pondering,
            "search begun"
        );
        Ok(())
    }

    /// The root policy after root policy temperature, wide-root noise and
    /// Dirichlet noise.
    fn compute_root_policy(&self, root_id: NodeId, root_visits: i64) -> Vec<f32> {
        let node = self.tree.node(root_id);
        let out = node.nn_output().expect("root must be evaluated");
        let mut policy: Vec<f32> = out.policy.to_vec();
        let legal: Vec<Loc> =
            self.rules.legal_moves(&self.root_board, &self.root_hist, self.root_pla);
        if legal.is_empty() {
            return policy;
        }

        let turn = self.rules.turn_number(&self.root_hist) as f64;
        let (w, h) = self.rules.board_dims();
        let temperature = interpolate_early(
            self.params.chosen_move_temperature_halflife,
            self.params.root_policy_temperature_early,
            self.params.root_policy_temperature,
            turn,
            (w * h) as f64,
        );
        if (temperature - 1.0).abs() > 1e-9 && temperature > 0.0 {
            let inv_t = 1.0 / temperature;
            let mut sum = 0.0f64;
            for loc in &legal {
                let p = policy[loc.index()].max(1e-30);
                let v = (p as f64).powf(inv_t);
                policy[loc.index()] = v as f32;
                sum += v;
            }
            if sum > 0.0 {
                for loc in &legal {
                    policy[loc.index()] = (policy[loc.index()] as f64 / sum) as f32;
                }
            }
        }

        if self.params.wide_root_noise > 0.0 {
            let wrn = self.params.wide_root_noise;
            let uniform = 1.0 / legal.len() as f64;
            for loc in &legal {
                let p = policy[loc.index()] as f64;
                policy[loc.index()] = ((p + wrn * uniform) / (1.0 + wrn)) as f32;
            }
        }

        if self.params.root_noise_enabled {
            let alpha = self.params.root_dirichlet_noise_total_concentration / legal.len() as f64;
            let weight = self.params.root_dirichlet_noise_weight;
            let mut rng = ChaCha20Rng::seed_from_u64(
                self.seed ^ (root_visits as u64).wrapping_mul(0x2545f4914f6cdd1d),
            );
            let gamma = Gamma::new(alpha, 1.0).expect("dirichlet alpha must be positive");
            let draws: Vec<f64> = legal.iter().map(|_| gamma.sample(&mut rng)).collect();
            let total: f64 = draws.iter().sum();
            if total > 0.0 {
                for (loc, draw) in legal.iter().zip(draws.iter()) {
                    let noised = (1.0 - weight) * policy[loc.index()] as f64 + weight * draw / total;
                    policy[loc.index()] = noised as f32;
                }
            }
        }

        policy
    }

    /// For each legal root move in a non-trivial symmetry orbit, map it to
    /// the orbit's canonical member. Canonical moves map to `None`.
    fn compute_root_symmetry_map(&self) -> Option<Vec<Option<Loc>>> {
        if !self.params.root_symmetry_pruning {
            return None;
        }
        let syms = self.rules.symmetries(&self.root_board, &self.root_hist);
        if syms == arbor_core::SymmetrySet::IDENTITY {
            return None;
        }
        let (w, h) = self.rules.board_dims();
        let mut map = vec![None; self.rules.policy_size()];
        for loc in self.rules.legal_moves(&self.root_board, &self.root_hist, self.root_pla) {
            let canonical = syms
                .iter()
                .filter(|&s| arbor_core::symmetry::is_valid_for(s, w, h))
                .map(|s| self.rules.transform_loc(loc, s))
                .min()
                .unwrap_or(loc);
            if canonical != loc {
                map[loc.index()] = Some(canonical);
            }
        }
        Some(map)
    }

    // ----------------------------------------------------------------------
    // Worker loop
    // ----------------------------------------------------------------------

    fn worker_loop(&self, thread_idx: usize) {
        let mut thread = SearchThread::<R>::new(self, thread_idx);
        thread.stats_buf =
            (0..self.tree.policy_size()).map(|_| MoreNodeStats::default()).collect();
        loop {
            if self.should_stop_now(&mut thread) {
                break;
            }
            match self.run_single_playout(&mut thread) {
                PlayoutOutcome::Succeeded | PlayoutOutcome::Terminal => {
                    self.run.playouts.fetch_add(1, Ordering::AcqRel);
                }
                PlayoutOutcome::NnFailed => {
                    self.run.nn_failures.fetch_add(1, Ordering::AcqRel);
                }
                PlayoutOutcome::Aborted => {}
            }
        }
    }

    /// Check every cap. The first worker to observe an exceeded cap sets the
    /// shared stop flag so the others wind down promptly.
    fn should_stop_now(&self, thread: &mut SearchThread<R>) -> bool {
        if self.run.stop.load(Ordering::Acquire) || self.run.invariant_failed.load(Ordering::Acquire)
        {
            return true;
        }
        let visits = self.root_visits();
        let playouts = self.run.playouts.load(Ordering::Acquire);
        let mut stop = visits >= self.run.max_visits || playouts >= self.run.max_playouts;
        if !stop {
            // A persistently failing backend must not spin the workers
            // forever; give up once failures dwarf the visit budget.
            let failures = self.run.nn_failures.load(Ordering::Acquire);
            stop = failures > 1000 && failures > self.run.max_visits.saturating_mul(4);
        }
        if !stop && self.run.max_time < 1e19 {
            stop = self.run.start_time.elapsed().as_secs_f64() >= self.run.max_time;
        }
        if !stop && thread.thread_idx == 0 && self.params.futile_visits_threshold > 0.0 {
            thread.playouts_since_stop_check += 1;
            if thread.playouts_since_stop_check >= 64 {
                thread.playouts_since_stop_check = 0;
                stop = self.futile_visits_prune_stop(visits, playouts);
            }
        }
        if stop {
            self.run.stop.store(true, Ordering::Release);
        }
        stop
    }

    /// True when no move other than the current top can reach the futile
    /// visits threshold within the remaining budget.
    fn futile_visits_prune_stop(&self, visits: i64, playouts: i64) -> bool {
        let Some(root) = self.root_node() else { return false };
        let mut top = 0i64;
        let mut second = 0i64;
        for (_, slot) in root.children(self.tree.policy_size()) {
            let ev = slot.edge_visits();
            if ev > top {
                second = top;
                top = ev;
            } else if ev > second {
                second = ev;
            }
        }
        if top == 0 {
            return false;
        }
        let mut remaining = (self.run.max_visits - visits).min(self.run.max_playouts - playouts);
        if self.run.max_time < 1e19 {
            let elapsed = self.run.start_time.elapsed().as_secs_f64();
            if elapsed > 1e-3 && playouts > 0 {
                let rate = playouts as f64 / elapsed;
                let by_time = ((self.run.max_time - elapsed).max(0.0) * rate) as i64;
                remaining = remaining.min(by_time);
            }
        }
        let reachable = second.saturating_add(remaining.max(0));
        (reachable as f64) < self.params.futile_visits_threshold * top as f64
    }

    pub(crate) fn record_invariant_failure(&self, msg: String) {
        error!(msg = %msg, "search invariant violated, aborting search");
        let mut slot = self.run.invariant_msg.lock().expect("invariant message poisoned");
        slot.get_or_insert(msg);
        self.run.invariant_failed.store(true, Ordering::Release);
        self.run.stop.store(true, Ordering::Release);
    }

    // ----------------------------------------------------------------------
    // One playout
    // ----------------------------------------------------------------------

    fn run_single_playout(&self, thread: &mut SearchThread<R>) -> PlayoutOutcome {
        let Some(root_id) = self.root else { return PlayoutOutcome::Aborted };
        thread.board.clone_from(&self.root_board);
        thread.hist.clone_from(&self.root_hist);
        thread.pla = self.root_pla;
        thread.path_nodes.clear();
        thread.path_edges.clear();

        let mut node_id = root_id;
        self.tree.node(node_id).add_virtual_loss();
        thread.path_nodes.push(node_id);

        loop {
            if self.run.stop.load(Ordering::Acquire)
                || self.run.invariant_failed.load(Ordering::Acquire)
            {
                // Finish bookkeeping but contribute nothing.
                self.abandon_playout(thread);
                return PlayoutOutcome::Aborted;
            }
            let node = self.tree.node(node_id);

            // Terminal and repetition leaves are re-scored on every visit.
            if self.rules.is_game_over(&thread.board, &thread.hist) {
                let tv = self.rules.terminal_value(&thread.board, &thread.hist);
                if node.nn_output().is_none() {
                    let _ = node.set_nn_output(Arc::new(NnOutput::terminal(
                        tv,
                        self.tree.policy_size(),
                    )));
                }
                self.add_leaf_value(node, tv.win_loss, tv.no_result, 1.0, false);
                self.backup(thread);
                return PlayoutOutcome::Terminal;
            }
            if self.params.simple_repetition_bound_gt > 0
                && self.rules.repetition_count(&thread.board, &thread.hist)
                    > self.params.simple_repetition_bound_gt
            {
                self.add_leaf_value(node, 0.0, 1.0, 1.0, false);
                self.backup(thread);
                return PlayoutOutcome::Terminal;
            }

            // A node without an NN output is a leaf: evaluate it.
            if node.nn_output().is_none() {
                let input_params = self.nn_input_params_for(thread.pla);
                match self.nn.evaluate(&thread.board, &thread.hist, thread.pla, &input_params, false)
                {
                    Ok(out) => {
                        let installed = node.set_nn_output(out);
                        self.add_current_nn_output_as_leaf_value(node, installed);
                        self.backup(thread);
                        return PlayoutOutcome::Succeeded;
                    }
                    Err(e) => {
                        warn!(error = %e, "playout abandoned after nn evaluation failure");
                        self.abandon_playout(thread);
                        return PlayoutOutcome::NnFailed;
                    }
                }
            }

            let is_root = node_id == root_id;
            match self.select_best_child(node_id, thread, is_root) {
                Selection::None => {
                    // No legal move and the game is not over: rules bug.
                    self.record_invariant_failure(
                        "no legal moves at a non-terminal node".into(),
                    );
                    self.abandon_playout(thread);
                    return PlayoutOutcome::Aborted;
                }
                Selection::Existing { slot_idx, child, loc } => {
                    // Graph search: a transposed child can be ahead of this
                    // edge on visits. Normally donate the edge a catch-up
                    // visit instead of descending; occasionally leak through
                    // and deepen anyway so rejoin paths are not starved.
                    if self.tree.graph_search() {
                        let slot = node
                            .child_slot(slot_idx, self.tree.policy_size())
                            .expect("selected slot must exist");
                        let child_visits =
                            self.tree.node(child).stats.visits.load(Ordering::Acquire);
                        if child_visits > slot.edge_visits()
                            && thread.rng.gen::<f64>()
                                >= self.params.graph_search_catch_up_leak_prob
                        {
                            // The child's aggregate already contains weight
                            // this edge has not claimed; the backup below
                            // bumps the edge and re-aggregates the ancestors.
                            thread.path_edges.push((node_id, slot_idx));
                            self.backup(thread);
                            return PlayoutOutcome::Succeeded;
                        }
                    }
                    if self
                        .rules
                        .make_move(&mut thread.board, &mut thread.hist, loc, thread.pla)
                        .is_err()
                    {
                        self.record_invariant_failure(format!(
                            "selected illegal move {} during descent",
                            loc
                        ));
                        self.abandon_playout(thread);
                        return PlayoutOutcome::Aborted;
                    }
                    thread.pla = thread.pla.opponent();
                    thread.path_edges.push((node_id, slot_idx));
                    self.tree.node(child).add_virtual_loss();
                    thread.path_nodes.push(child);
                    node_id = child;
                }
                Selection::New { loc } => {
                    if self
                        .rules
                        .make_move(&mut thread.board, &mut thread.hist, loc, thread.pla)
                        .is_err()
                    {
                        self.record_invariant_failure(format!(
                            "selected illegal expansion move {}",
                            loc
                        ));
                        self.abandon_playout(thread);
                        return PlayoutOutcome::Aborted;
                    }
                    let child_pla = thread.pla.opponent();
                    let key = self.tree.graph_search().then(|| NodeKey {
                        situation: self.rules.situation_hash(&thread.board, child_pla),
                        context: self.rules.graph_context_hash(&thread.hist),
                        pla: child_pla,
                    });
                    let Some((slot_idx, child, _created)) =
                        self.tree.allocate_child(node_id, loc, key, child_pla)
                    else {
                        self.record_invariant_failure("node arena exhausted".into());
                        self.abandon_playout(thread);
                        return PlayoutOutcome::Aborted;
                    };
                    thread.pla = child_pla;
                    thread.path_edges.push((node_id, slot_idx));
                    self.tree.node(child).add_virtual_loss();
                    thread.path_nodes.push(child);
                    node_id = child;
                    // The next loop iteration scores the new leaf: terminal
                    // check first, then NN evaluation; under graph search the
                    // "new" child may already carry an output, in which case
                    // selection proceeds through it.
                }
            }
        }
    }

    /// Undo virtual losses without contributing anything.
    fn abandon_playout(&self, thread: &mut SearchThread<R>) {
        for &id in thread.path_nodes.iter() {
            self.tree.node(id).remove_virtual_loss();
        }
        thread.path_nodes.clear();
        thread.path_edges.clear();
    }

    /// Back up a completed playout: increment each traversed edge and
    /// re-aggregate each parent, leaf-most first and root last, then release
    /// the path's virtual losses.
    fn backup(&self, thread: &mut SearchThread<R>) {
        let root_id = self.root.expect("backup requires a root");
        for i in (0..thread.path_edges.len()).rev() {
            let (parent_id, slot_idx) = thread.path_edges[i];
            let parent = self.tree.node(parent_id);
            let slot = parent
                .child_slot(slot_idx, self.tree.policy_size())
                .expect("path slot must exist");
            slot.add_edge_visits(1);
            self.update_stats_after_playout(parent, thread, parent_id == root_id);
        }
        for &id in thread.path_nodes.iter() {
            self.tree.node(id).remove_virtual_loss();
        }
        thread.path_nodes.clear();
        thread.path_edges.clear();
    }

    // ----------------------------------------------------------------------
    // Selection
    // ----------------------------------------------------------------------

    /// PUCT selection among the existing children of `node_id` plus the best
    /// unexpanded move. Policy order breaks ties.
    fn select_best_child(
        &self,
        node_id: NodeId,
        thread: &SearchThread<R>,
        is_root: bool,
    ) -> Selection {
        let node = self.tree.node(node_id);
        let out = node.nn_output().expect("selection requires an expanded node");
        let policy_size = self.tree.policy_size();
        let root_policy = if is_root { self.run.root_policy.as_deref() } else { None };
        let prior_of = |loc: Loc| -> f64 {
            match root_policy {
                Some(p) => p[loc.index()] as f64,
                None => out.policy[loc.index()] as f64,
            }
        };

        let parent_stats = node.stats.snapshot();
        let pla_sign = node.next_pla.sign();

        // Gather visible children and the policy mass they cover.
        let mut total_child_visits: i64 = 0;
        let mut visited_policy_mass = 0.0f64;
        let mut children: Vec<(usize, Loc, NodeId, i64)> = Vec::new();
        for (idx, (loc, slot)) in node.children(policy_size).enumerate() {
            let ev = slot.edge_visits();
            total_child_visits += ev;
            if ev > 0 {
                visited_policy_mass += prior_of(loc);
            }
            children.push((idx, loc, slot.child(), ev));
        }

        let cpuct = self.cpuct_for(&parent_stats, total_child_visits);
        let fpu = self.fpu_value(node, &parent_stats, visited_policy_mass, is_root);
        let sqrt_total = ((total_child_visits as f64) + 0.01).sqrt();
        let loss_utility = -pla_sign * self.params.win_loss_utility_factor;

        let mut best_score = f64::NEG_INFINITY;
        let mut best: Selection = Selection::None;
        let mut forced_deficit = f64::NEG_INFINITY;
        let mut forced: Option<(usize, Loc, NodeId)> = None;

        for &(idx, loc, child_id, edge_visits) in &children {
            let child = self.tree.node(child_id);
            let prior = prior_of(loc);
            let vl_count = child.virtual_loss_count() as f64;
            let vl_weight = vl_count * self.params.num_virtual_losses_per_thread;

            let q = if edge_visits > 0 {
                let cs = child.stats.snapshot();
                let child_weight = cs.child_weight_share(edge_visits).max(1e-30);
                let mut q = pla_sign * cs.utility_avg;
                if vl_weight > 0.0 {
                    q = (q * child_weight + loss_utility * vl_weight) / (child_weight + vl_weight);
                }
                q
            } else if vl_weight > 0.0 {
                (fpu + loss_utility * vl_weight) / (1.0 + vl_weight)
            } else {
                fpu
            };

            let u = cpuct * prior * sqrt_total / (1.0 + edge_visits as f64 + vl_weight);
            let score = q + u;

            if is_root && self.params.root_desired_per_child_visits_coeff > 0.0 && edge_visits > 0 {
                let desired = (self.params.root_desired_per_child_visits_coeff
                    * prior
                    * total_child_visits as f64)
                    .sqrt();
                let deficit = desired - edge_visits as f64;
                if deficit > 0.0 && deficit > forced_deficit {
                    forced_deficit = deficit;
                    forced = Some((idx, loc, child_id));
                }
            }

            if score > best_score {
                best_score = score;
                best = Selection::Existing { slot_idx: idx, child: child_id, loc };
            }
        }

        // Best unexpanded move by adjusted prior, in policy order.
        let legal = self.rules.legal_moves(&thread.board, &thread.hist, thread.pla);
        let mut best_new: Option<(Loc, f64)> = None;
        for loc in legal {
            if children.iter().any(|&(_, l, _, _)| l == loc) {
                continue;
            }
            if is_root {
                if let Some(map) = &self.run.root_sym_map {
                    if map[loc.index()].is_some() {
                        continue; // A symmetric twin is searched instead.
                    }
                }
            }
            let prior = prior_of(loc);
            if best_new.map(|(_, p)| prior > p).unwrap_or(true) {
                best_new = Some((loc, prior));
            }
        }
        if let Some((loc, prior)) = best_new {
            let score = fpu + cpuct * prior * sqrt_total;
            if score > best_score {
                best = Selection::New { loc };
            }
        }

        if let Some((idx, loc, child_id)) = forced {
            return Selection::Existing { slot_idx: idx, child: child_id, loc };
        }
        best
    }

    /// Exploration coefficient: base plus log growth, scaled by the blended
    /// utility stdev observed at the parent.
    fn cpuct_for(&self, parent_stats: &crate::node::NodeStats, total_child_visits: i64) -> f64 {
        let p = &self.params;
        let mut cpuct = p.cpuct_exploration
            + p.cpuct_exploration_log
                * ((1.0 + total_child_visits as f64 / p.cpuct_exploration_base).ln());
        if p.cpuct_utility_stdev_scale > 0.0 {
            let observed = parent_stats.utility_stdev();
            let weight = parent_stats.weight_sum.max(0.0);
            let blended = (p.cpuct_utility_stdev_prior * p.cpuct_utility_stdev_prior_weight
                + observed * weight)
                / (p.cpuct_utility_stdev_prior_weight + weight);
            cpuct *= 1.0 + p.cpuct_utility_stdev_scale * (blended / p.cpuct_utility_stdev_prior - 1.0);
        }
        cpuct
    }

    /// First-play urgency: the parent's utility (optionally blended toward
    /// its direct net value), reduced with the policy mass already visited.
    fn fpu_value(
        &self,
        node: &SearchNode,
        parent_stats: &crate::node::NodeStats,
        visited_policy_mass: f64,
        is_root: bool,
    ) -> f64 {
        let p = &self.params;
        let pla_sign = node.next_pla.sign();
        let out = node.nn_output().expect("fpu requires an evaluated node");
        let parent_nn_utility = pla_sign
            * crate::update::result_utility(p, out.win_loss(), out.no_result_prob as f64);
        let parent_avg_utility = if parent_stats.weight_sum > 0.0 {
            pla_sign * parent_stats.utility_avg
        } else {
            parent_nn_utility
        };

        let parent_utility = if p.fpu_parent_weight_by_visited_policy {
            let w = visited_policy_mass
                .clamp(0.0, 1.0)
                .powf(p.fpu_parent_weight_by_visited_policy_pow);
            w * parent_avg_utility + (1.0 - w) * parent_nn_utility
        } else if p.fpu_parent_weight > 0.0 {
            p.fpu_parent_weight * parent_nn_utility
                + (1.0 - p.fpu_parent_weight) * parent_avg_utility
        } else {
            parent_avg_utility
        };

        let (reduction_max, loss_prop) = if is_root {
            (p.root_fpu_reduction_max, p.root_fpu_loss_prop)
        } else {
            (p.fpu_reduction_max, p.fpu_loss_prop)
        };
        let mut fpu = parent_utility - reduction_max * visited_policy_mass.clamp(0.0, 1.0).sqrt();
        if loss_prop > 0.0 {
            let loss_utility = -pla_sign * p.win_loss_utility_factor;
            fpu += loss_prop * (loss_utility - fpu);
        }
        fpu
    }

    /// NN input parameters for evaluating a position where `pla` moves.
    pub(crate) fn nn_input_params_for(&self, pla: Player) -> NnInputParams {
        let pda = if self.params.playout_doubling_advantage != 0.0 {
            let pda_pla = self.params.playout_doubling_advantage_pla.unwrap_or(self.root_pla);
            if pla == pda_pla {
                self.params.playout_doubling_advantage
            } else {
                -self.params.playout_doubling_advantage
            }
        } else {
            0.0
        };
        NnInputParams {
            symmetry: SymmetrySpec::Fixed(0),
            playout_doubling_advantage: pda,
            no_result_utility_for_white: self.params.no_result_utility_for_white,
        }
    }

    pub(crate) fn move_rng(&self) -> std::sync::MutexGuard<'_, ChaCha20Rng> {
        self.move_rng.lock().expect("move rng poisoned")
    }
}

/// Interpolate between an early-game and a late-game value with a halflife in
/// turns, scaled for boards of different sizes.
pub(crate) fn interpolate_early(
    halflife: f64,
    early: f64,
    late: f64,
    turn: f64,
    board_area: f64,
) -> f64 {
    let scaled = (halflife * board_area / 361.0).max(1e-9);
    late + (early - late) * 0.5f64.powf(turn / scaled)
}

/// Shannon entropy of a policy distribution, in nats.
pub(crate) fn policy_entropy(policy: &[f32]) -> f64 {
    let mut e = 0.0f64;
    for &p in policy {
        if p > 1e-30 {
            let p = p as f64;
            e -= p * p.ln();
        }
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolate_early_decays_toward_late() {
        let at0 = interpolate_early(19.0, 0.8, 0.2, 0.0, 361.0);
        let at_halflife = interpolate_early(19.0, 0.8, 0.2, 19.0, 361.0);
        let late = interpolate_early(19.0, 0.8, 0.2, 1000.0, 361.0);
        assert!((at0 - 0.8).abs() < 1e-12);
        assert!((at_halflife - 0.5).abs() < 1e-12);
        assert!((late - 0.2).abs() < 1e-6);
    }

    #[test]
    fn interpolate_scales_with_board_area() {
        // A quarter-size board decays four times as fast.
        let big = interpolate_early(19.0, 1.0, 0.0, 19.0, 361.0);
        let small = interpolate_early(19.0, 1.0, 0.0, 19.0 / 4.0, 361.0 / 4.0);
        assert!((big - small).abs() < 1e-9);
    }

    #[test]
    fn entropy_of_uniform_and_point() {
        let uniform = vec![0.25f32; 4];
        assert!((policy_entropy(&uniform) - (4.0f64).ln()).abs() < 1e-6);
        let point = vec![1.0f32, 0.0, 0.0];
        assert!(policy_entropy(&point).abs() < 1e-9);
    }
}
