#![allow(dead_code)]

//! Shared fixtures for the search integration tests: tiny rule sets that
//! exercise specific tree shapes, and instrumented NN backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{
    EncodeParams, Hash128, IllegalMove, Loc, NetInput, Player, Rules, TerminalValue,
};
use arbor_search::{
    BackendError, BackendOutput, NnBackend, NnEvalConfig, NnEvaluator, Search, SearchParams,
};

/// A one-move game: move 0 wins for the mover, move 1 loses.
#[derive(Debug, Clone, Default)]
pub struct TwoChoice;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TwoChoiceBoard {
    pub outcome: Option<f64>, // white-positive win/loss once decided
}

impl Rules for TwoChoice {
    type Board = TwoChoiceBoard;
    type History = u32;

    fn board_dims(&self) -> (usize, usize) {
        (2, 1)
    }
    fn policy_size(&self) -> usize {
        2
    }
    fn spatial_channels(&self) -> usize {
        1
    }
    fn global_channels(&self) -> usize {
        1
    }

    fn legal_moves(&self, board: &Self::Board, _hist: &u32, _pla: Player) -> Vec<Loc> {
        if board.outcome.is_some() {
            Vec::new()
        } else {
            vec![Loc(0), Loc(1)]
        }
    }

    fn is_legal(&self, board: &Self::Board, _hist: &u32, loc: Loc, _pla: Player) -> bool {
        board.outcome.is_none() && loc.index() < 2
    }

    fn make_move(
        &self,
        board: &mut Self::Board,
        hist: &mut u32,
        loc: Loc,
        pla: Player,
    ) -> Result<(), IllegalMove> {
        if board.outcome.is_some() {
            return Err(IllegalMove { loc, pla });
        }
        let winner = if loc == Loc(0) { pla } else { pla.opponent() };
        board.outcome = Some(winner.sign());
        *hist += 1;
        Ok(())
    }

    fn is_game_over(&self, board: &Self::Board, _hist: &u32) -> bool {
        board.outcome.is_some()
    }

    fn terminal_value(&self, board: &Self::Board, _hist: &u32) -> TerminalValue {
        TerminalValue {
            win_loss: board.outcome.expect("game must be over"),
            no_result: 0.0,
        }
    }

    fn situation_hash(&self, board: &Self::Board, pla: Player) -> Hash128 {
        Hash128::ZERO
            .mix_u64(board.outcome.map(|o| o as i64 as u64 ^ 0x5a).unwrap_or(7))
            .mix_u64(pla.sign() as i64 as u64)
    }

    fn turn_number(&self, hist: &u32) -> u32 {
        *hist
    }

    fn encode_input(
        &self,
        board: &Self::Board,
        _hist: &u32,
        _pla: Player,
        _enc: &EncodeParams,
        out: &mut NetInput,
    ) {
        out.spatial = vec![if board.outcome.is_some() { 1.0 } else { 0.0 }, 0.0];
        out.global = vec![0.0];
    }
}

/// A game where every move leads to the same next state: `width` interchangeable
/// actions per turn, ending in a draw after `length` moves. Any two paths of
/// the same depth transpose.
#[derive(Debug, Clone)]
pub struct CountGame {
    pub width: usize,
    pub length: u32,
}

impl Rules for CountGame {
    type Board = u32; // moves played so far
    type History = u32;

    fn board_dims(&self) -> (usize, usize) {
        (self.width, 1)
    }
    fn policy_size(&self) -> usize {
        self.width
    }
    fn spatial_channels(&self) -> usize {
        1
    }
    fn global_channels(&self) -> usize {
        1
    }

    fn legal_moves(&self, board: &u32, _hist: &u32, _pla: Player) -> Vec<Loc> {
        if *board >= self.length {
            Vec::new()
        } else {
            (0..self.width).map(|i| Loc(i as u32)).collect()
        }
    }

    fn is_legal(&self, board: &u32, _hist: &u32, loc: Loc, _pla: Player) -> bool {
        *board < self.length && loc.index() < self.width
    }

    fn make_move(
        &self,
        board: &mut u32,
        hist: &mut u32,
        loc: Loc,
        pla: Player,
    ) -> Result<(), IllegalMove> {
        if *board >= self.length {
            return Err(IllegalMove { loc, pla });
        }
        *board += 1;
        *hist += 1;
        Ok(())
    }

    fn is_game_over(&self, board: &u32, _hist: &u32) -> bool {
        *board >= self.length
    }

    fn terminal_value(&self, _board: &u32, _hist: &u32) -> TerminalValue {
        TerminalValue::DRAW
    }

    fn situation_hash(&self, board: &u32, pla: Player) -> Hash128 {
        Hash128::ZERO.mix_u64(*board as u64).mix_u64(pla.sign() as i64 as u64)
    }

    fn turn_number(&self, hist: &u32) -> u32 {
        *hist
    }

    fn encode_input(
        &self,
        board: &u32,
        _hist: &u32,
        _pla: Player,
        _enc: &EncodeParams,
        out: &mut NetInput,
    ) {
        out.spatial = vec![*board as f32; self.width];
        out.global = vec![0.0];
    }
}

/// Backend with fixed policy logits and a neutral value, counting every
/// batch call.
#[derive(Debug)]
pub struct FixedPolicyBackend {
    pub logits: Vec<f32>,
    pub calls: AtomicU64,
    pub evals: AtomicU64,
    pub delay: Duration,
}

impl FixedPolicyBackend {
    pub fn uniform(policy_size: usize) -> FixedPolicyBackend {
        FixedPolicyBackend {
            logits: vec![0.0; policy_size],
            calls: AtomicU64::new(0),
            evals: AtomicU64::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_priors(priors: &[f64]) -> FixedPolicyBackend {
        FixedPolicyBackend {
            logits: priors.iter().map(|p| (p.max(1e-9)).ln() as f32).collect(),
            calls: AtomicU64::new(0),
            evals: AtomicU64::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> FixedPolicyBackend {
        self.delay = delay;
        self
    }

    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }

    pub fn num_evals(&self) -> u64 {
        self.evals.load(Ordering::Acquire)
    }
}

impl NnBackend for FixedPolicyBackend {
    fn model_id(&self) -> &str {
        "fixed-policy-test"
    }
    fn max_batch_size(&self) -> usize {
        32
    }
    fn supports_shortterm_error(&self) -> bool {
        false
    }
    fn evaluate_batch(&self, inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        self.evals.fetch_add(inputs.len() as u64, Ordering::AcqRel);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(inputs
            .iter()
            .map(|_| BackendOutput {
                policy_logits: self.logits.clone(),
                win_prob: 0.5,
                loss_prob: 0.5,
                no_result_prob: 0.0,
                shortterm_winloss_error: 0.0,
                time_left: 0.0,
            })
            .collect())
    }
}

/// Backend that always fails.
#[derive(Debug, Default)]
pub struct FailingBackend;

impl NnBackend for FailingBackend {
    fn model_id(&self) -> &str {
        "failing-test"
    }
    fn max_batch_size(&self) -> usize {
        8
    }
    fn supports_shortterm_error(&self) -> bool {
        false
    }
    fn evaluate_batch(&self, _inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError> {
        Err(BackendError("injected failure".into()))
    }
}

/// Backend whose policy depends on the spatial input orientation: the logit
/// of each cell is its input plane value. Used for symmetry tests.
#[derive(Debug, Default)]
pub struct OrientationBackend;

impl NnBackend for OrientationBackend {
    fn model_id(&self) -> &str {
        "orientation-test"
    }
    fn max_batch_size(&self) -> usize {
        16
    }
    fn supports_shortterm_error(&self) -> bool {
        false
    }
    fn evaluate_batch(&self, inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError> {
        Ok(inputs
            .iter()
            .map(|input| {
                // Logit of each cell is the sum of its input planes, so the
                // policy tracks the stones and rotates with the board.
                let cells = 9usize;
                let mut logits = vec![0.0f32; cells];
                for (i, v) in input.spatial.iter().enumerate() {
                    logits[i % cells] += *v * 3.0;
                }
                BackendOutput {
                    policy_logits: logits,
                    win_prob: 0.5,
                    loss_prob: 0.5,
                    no_result_prob: 0.0,
                    shortterm_winloss_error: 0.0,
                    time_left: 0.0,
                }
            })
            .collect())
    }
}

/// Backend that fails every `period`-th batch once `healthy_calls` have gone
/// through, then recovers. Exercises mid-search evaluation failures.
#[derive(Debug)]
pub struct FlakyBackend {
    healthy_calls: u64,
    period: u64,
    calls: AtomicU64,
}

impl FlakyBackend {
    pub fn failing_after(healthy_calls: u64) -> FlakyBackend {
        FlakyBackend {
            healthy_calls,
            period: 3,
            calls: AtomicU64::new(0),
        }
    }
}

impl NnBackend for FlakyBackend {
    fn model_id(&self) -> &str {
        "flaky-test"
    }
    fn max_batch_size(&self) -> usize {
        8
    }
    fn supports_shortterm_error(&self) -> bool {
        false
    }
    fn evaluate_batch(&self, inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::AcqRel);
        if n >= self.healthy_calls && n % self.period == 0 {
            return Err(BackendError("injected intermittent failure".into()));
        }
        Ok(inputs
            .iter()
            .map(|_| BackendOutput {
                policy_logits: vec![0.0; 9],
                win_prob: 0.5,
                loss_prob: 0.5,
                no_result_prob: 0.0,
                shortterm_winloss_error: 0.0,
                time_left: 0.0,
            })
            .collect())
    }
}

/// Build an evaluator over `rules` and `backend` with a small cache.
pub fn evaluator_for<R: Rules>(rules: &Arc<R>, backend: Arc<dyn NnBackend>) -> Arc<NnEvaluator<R>> {
    Arc::new(NnEvaluator::new(rules.clone(), backend, NnEvalConfig::default()))
}

/// Build a single-threaded deterministic search over a game.
pub fn search_for<R: Rules>(
    rules: Arc<R>,
    backend: Arc<dyn NnBackend>,
    params: SearchParams,
    board: R::Board,
    hist: R::History,
    pla: Player,
    seed: u64,
) -> Search<R> {
    let nn = evaluator_for(&rules, backend);
    Search::new(params, rules, nn, board, hist, pla, seed).expect("params must validate")
}

/// A fresh unset stop flag.
pub fn stop_flag() -> Arc<std::sync::atomic::AtomicBool> {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}
