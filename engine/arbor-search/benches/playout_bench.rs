//! Playout throughput over TicTacToe with a uniform backend.

use std::sync::Arc;

use arbor_core::Player;
use arbor_search::{
    NnEvalConfig, NnEvaluator, Search, SearchParams, TimeControls, UniformBackend,
};
use criterion::{criterion_group, criterion_main, Criterion};
use games_tictactoe::TicTacToe;

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    for &visits in &[64i64, 512] {
        group.bench_function(format!("tictactoe_{}_visits", visits), |b| {
            b.iter(|| {
                let rules = Arc::new(TicTacToe::new());
                let nn = Arc::new(NnEvaluator::new(
                    rules.clone(),
                    Arc::new(UniformBackend::new(9)),
                    NnEvalConfig::default(),
                ));
                let (board, hist) = TicTacToe::starting_position();
                let mut search = Search::new(
                    SearchParams::for_tests().with_max_visits(visits),
                    rules,
                    nn,
                    board,
                    hist,
                    Player::Black,
                    42,
                )
                .unwrap();
                let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
                search
                    .run_whole_search(stop, &TimeControls::Unlimited, 1.0, false, None)
                    .unwrap();
                criterion::black_box(search.root_visits())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
