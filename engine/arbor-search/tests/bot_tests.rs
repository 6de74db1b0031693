//! Async bot controller behavior: genmove, ponder, analyze, stop, undo.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_core::{Loc, Player, Rules};
use arbor_search::{AsyncBot, SearchError, SearchParams, TimeControls};
use common::*;
use games_tictactoe::TicTacToe;

fn ttt_bot(
    params: SearchParams,
    backend: Arc<dyn arbor_search::NnBackend>,
    seed: u64,
) -> AsyncBot<TicTacToe> {
    let rules = Arc::new(TicTacToe::new());
    let nn = evaluator_for(&rules, backend);
    let (board, hist) = TicTacToe::starting_position();
    AsyncBot::new(params, rules, nn, board, hist, Player::Black, seed).expect("bot must build")
}

#[test]
fn genmove_returns_a_legal_move() -> anyhow::Result<()> {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(80),
        Arc::new(FixedPolicyBackend::uniform(9)),
        3,
    );
    let mv = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    assert!(mv.index() < 9);
    assert!(!bot.is_running());
    Ok(())
}

#[test]
fn genmove_finds_the_immediate_win() -> anyhow::Result<()> {
    // X to move: X X . / O O . / . . .  -- position 2 wins on the spot.
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(400),
        Arc::new(FixedPolicyBackend::uniform(9)),
        5,
    );
    let rules = TicTacToe::new();
    let (mut board, mut hist) = TicTacToe::starting_position();
    let mut pla = Player::Black;
    for &m in &[0u32, 3, 1, 4] {
        rules.make_move(&mut board, &mut hist, Loc(m), pla)?;
        pla = pla.opponent();
    }
    bot.set_position(Player::Black, board, hist)?;
    let mv = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    assert_eq!(mv, Loc(2), "search must find the winning move");

    let analysis = bot.get_analysis(4).expect("tree has analysis");
    // Black winning means a White-negative root value.
    assert!(analysis.root.win_prob < 0.5);
    assert_eq!(analysis.moves[0].loc, Loc(2));
    Ok(())
}

#[test]
fn analyze_callbacks_fire_periodically() {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(i64::MAX / 4),
        Arc::new(FixedPolicyBackend::uniform(9).with_delay(Duration::from_millis(1))),
        7,
    );
    let count = Arc::new(AtomicUsize::new(0));
    let count_in_cb = count.clone();
    bot.analyze_async(
        Player::Black,
        1.0,
        0.02,
        0.0,
        Box::new(move |search| {
            assert!(search.root_visits() >= 0);
            count_in_cb.fetch_add(1, Ordering::AcqRel);
        }),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    bot.stop_and_wait();
    assert!(
        count.load(Ordering::Acquire) >= 2,
        "expected periodic callbacks, got {}",
        count.load(Ordering::Acquire)
    );
    assert!(!bot.is_running());
}

#[test]
fn stop_terminates_a_long_search_promptly() {
    let rules = Arc::new(CountGame {
        width: 4,
        length: 60,
    });
    let backend: Arc<dyn arbor_search::NnBackend> =
        Arc::new(FixedPolicyBackend::uniform(4).with_delay(Duration::from_millis(2)));
    let nn = evaluator_for(&rules, backend);
    let mut bot = AsyncBot::new(
        SearchParams::for_tests().with_max_visits(1_000_000),
        rules,
        nn,
        0,
        0,
        Player::Black,
        9,
    )
    .unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    bot.gen_move_async(
        Player::Black,
        TimeControls::Unlimited,
        1.0,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let stop_started = Instant::now();
    bot.stop_and_wait();
    let stop_latency = stop_started.elapsed();
    let result = rx.recv_timeout(Duration::from_secs(5)).expect("move must be delivered");
    assert!(result.is_ok(), "stopped search returns the best-so-far move");
    assert!(
        stop_latency < Duration::from_secs(2),
        "stop took {:?}",
        stop_latency
    );
}

#[test]
fn stop_without_wait_is_callback_safe() {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(i64::MAX / 4),
        Arc::new(FixedPolicyBackend::uniform(9).with_delay(Duration::from_millis(1))),
        11,
    );
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    bot.analyze_async(
        Player::Black,
        1.0,
        0.01,
        0.0,
        Box::new(move |_search| {
            fired_cb.fetch_add(1, Ordering::AcqRel);
        }),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    bot.stop_without_wait();
    bot.stop_and_wait();
    assert!(fired.load(Ordering::Acquire) >= 1);
}

#[test]
fn killed_bot_refuses_further_searches() {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(10),
        Arc::new(FixedPolicyBackend::uniform(9)),
        13,
    );
    bot.set_killed();
    let err = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0);
    assert!(matches!(err, Err(SearchError::Killed)));
    assert!(matches!(bot.clear_search(), Err(SearchError::Killed)));
}

#[test]
fn ponder_then_genmove_reuses_the_tree() -> anyhow::Result<()> {
    let backend = Arc::new(FixedPolicyBackend::uniform(9));
    let backend_probe = backend.clone();
    let mut params = SearchParams::for_tests().with_max_visits(200);
    params.max_visits_pondering = 150;
    let mut bot = ttt_bot(params, backend, 15);

    bot.ponder(1.0)?;
    // Give the ponder time to fill its visit cap, then stop it.
    std::thread::sleep(Duration::from_millis(200));
    bot.stop_and_wait();
    let evals_after_ponder = backend_probe.num_evals();
    assert!(evals_after_ponder > 0);

    let mv = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    assert!(mv.index() < 9);
    // The genmove continued from the pondered tree and the warm cache.
    let analysis = bot.get_analysis(2).expect("pondered tree has analysis");
    assert!(analysis.root.visits >= 150);
    Ok(())
}

#[test]
fn undo_restores_the_position_with_a_warm_cache() -> anyhow::Result<()> {
    let backend = Arc::new(FixedPolicyBackend::uniform(9));
    let backend_probe = backend.clone();
    let mut bot = ttt_bot(SearchParams::for_tests().with_max_visits(60), backend, 17);

    let first = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    let evals_after_first = backend_probe.num_evals();

    bot.make_move(first, Player::Black)?;
    bot.undo()?;

    // Re-searching the restored position replays the same deterministic
    // playouts, so every evaluation is served from the cache.
    let second = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    assert_eq!(first, second);
    assert_eq!(
        backend_probe.num_evals(),
        evals_after_first,
        "undo must keep the nn cache warm"
    );
    Ok(())
}

#[test]
fn undo_without_moves_is_an_illegal_request() {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(10),
        Arc::new(FixedPolicyBackend::uniform(9)),
        19,
    );
    assert!(matches!(bot.undo(), Err(SearchError::IllegalRequest(_))));
}

#[test]
fn make_move_then_genmove_alternates_players() -> anyhow::Result<()> {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(60),
        Arc::new(FixedPolicyBackend::uniform(9)),
        21,
    );
    let mv = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0)?;
    bot.make_move(mv, Player::Black)?;
    let reply = bot.gen_move_synchronous(Player::White, TimeControls::Unlimited, 1.0)?;
    assert_ne!(mv, reply, "the reply must be a different square");
    Ok(())
}

#[test]
fn search_factor_scales_the_visit_budget() {
    let backend = Arc::new(FixedPolicyBackend::uniform(9));
    let mut bot = ttt_bot(SearchParams::for_tests().with_max_visits(100), backend, 23);
    let _ = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 0.25).unwrap();
    let analysis = bot.get_analysis(2).unwrap();
    assert!(
        analysis.root.visits <= 30,
        "searchFactor 0.25 should cap visits near 25, got {}",
        analysis.root.visits
    );
}

#[test]
fn set_params_requires_validity_and_clears() {
    let mut bot = ttt_bot(
        SearchParams::for_tests().with_max_visits(50),
        Arc::new(FixedPolicyBackend::uniform(9)),
        25,
    );
    let _ = bot.gen_move_synchronous(Player::Black, TimeControls::Unlimited, 1.0).unwrap();
    assert!(bot.get_analysis(2).unwrap().root.visits > 0);

    // Invalid params are rejected without touching the search.
    let bad = SearchParams::for_tests().with_num_threads(0);
    assert!(matches!(bot.set_params(bad), Err(SearchError::InvalidConfig(_))));

    // Valid params clear the tree.
    bot.set_params(SearchParams::for_tests().with_max_visits(40)).unwrap();
    assert!(bot.get_analysis(2).is_none());

    // No-clearing swaps are refused when tree-affecting params change.
    let graph = SearchParams::for_tests().with_graph_search(true);
    assert!(bot.set_params_no_clearing(graph).is_err());
}
