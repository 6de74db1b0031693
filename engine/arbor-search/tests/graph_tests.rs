//! Graph-search (transposition sharing) behavior.

mod common;

use std::sync::Arc;

use arbor_core::Player;
use arbor_search::{SearchParams, TimeControls};
use common::*;

fn run_count_game(use_graph_search: bool, visits: i64) -> arbor_search::Search<CountGame> {
    let rules = Arc::new(CountGame {
        width: 3,
        length: 4,
    });
    let backend = Arc::new(FixedPolicyBackend::uniform(3));
    let mut params = SearchParams::for_tests()
        .with_max_visits(visits)
        .with_graph_search(use_graph_search);
    params.node_table_shards_power_of_two = 2;
    let mut search = search_for(rules, backend, params, 0, 0, Player::Black, 17);
    search
        .run_whole_search(stop_flag(), &TimeControls::Unlimited, 1.0, false, None)
        .expect("search must succeed");
    search
}

#[test]
fn graph_search_shares_one_node_per_situation() {
    let search = run_count_game(true, 120);
    // Every depth-d position is the same situation, so the whole game needs
    // one node per depth: counts 0 through 4.
    assert_eq!(search.num_nodes(), 5, "transpositions must collapse to one node each");
    assert!(search.root_visits() >= 120);
}

#[test]
fn tree_search_duplicates_transposed_states() {
    let search = run_count_game(false, 120);
    // Without sharing, each move order gets its own subtree.
    assert!(
        search.num_nodes() > 5,
        "tree search must not collapse transpositions, got {} nodes",
        search.num_nodes()
    );
}

#[test]
fn edge_visits_track_node_visits_across_edges() {
    let search = run_count_game(true, 120);
    let analysis = search.get_analysis(3).expect("root evaluated");
    // All three root moves reach the same shared child; each edge counts its
    // own traffic and together they account for every non-root visit.
    assert_eq!(analysis.moves.len(), 3);
    let edge_sum: i64 = analysis.moves.iter().map(|m| m.num_visits).sum();
    assert_eq!(edge_sum + 1, analysis.root.visits);
    // The shared child's stats are identical behind every edge.
    let first = &analysis.moves[0];
    for m in &analysis.moves[1..] {
        assert!((m.utility - first.utility).abs() < 1e-12);
        assert!((m.weight_sum - first.weight_sum).abs() < 1e-12);
    }
}

#[test]
fn catch_up_leak_still_converges() {
    let rules = Arc::new(CountGame {
        width: 3,
        length: 4,
    });
    let backend = Arc::new(FixedPolicyBackend::uniform(3));
    let mut params = SearchParams::for_tests().with_max_visits(200).with_graph_search(true);
    params.graph_search_catch_up_leak_prob = 0.1;
    let mut search = search_for(rules, backend, params, 0, 0, Player::Black, 23);
    search
        .run_whole_search(stop_flag(), &TimeControls::Unlimited, 1.0, false, None)
        .unwrap();
    assert_eq!(search.num_nodes(), 5);
    let analysis = search.get_analysis(2).unwrap();
    let edge_sum: i64 = analysis.moves.iter().map(|m| m.num_visits).sum();
    assert_eq!(edge_sum + 1, analysis.root.visits);
}

#[test]
fn graph_and_tree_agree_on_values_in_a_trivial_game() {
    // Every line of CountGame draws, so both modes must report a draw-ish
    // root value; only the node counts differ.
    let graph = run_count_game(true, 100);
    let tree = run_count_game(false, 100);
    let ga = graph.get_analysis(2).unwrap();
    let ta = tree.get_analysis(2).unwrap();
    assert!(ga.root.win_prob > 0.2 && ga.root.win_prob < 0.8);
    assert!((ga.root.win_prob - ta.root.win_prob).abs() < 0.2);
    assert!(ga.root.no_result_prob.abs() < 1e-9);
    assert!(ta.root.no_result_prob.abs() < 1e-9);
}
