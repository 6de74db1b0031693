//! The asynchronous bot controller.
//!
//! A single-client facade over one `Search`. One background thread runs the
//! searches; the client thread requests work (genmove, ponder, analyze) and
//! state changes (position, parameters, moves). The API itself is not
//! threadsafe: use it from one thread. `stop_without_wait` is the exception
//! and touches only an atomic, so it is safe from inside callbacks; no other
//! controller method may be re-entered from a callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use arbor_core::{Loc, Player, Rules};
use crossbeam_channel::bounded;
use tracing::{debug, info};

use crate::analysis::AnalysisData;
use crate::error::SearchError;
use crate::nneval::NnEvaluator;
use crate::params::SearchParams;
use crate::search::{AnalyzeCallback, Search};
use crate::timecontrols::TimeControls;

type MoveCallback = Box<dyn FnOnce(Result<Loc, SearchError>) + Send + 'static>;
type BegunCallback = Box<dyn FnOnce() + Send + 'static>;
type AnalyzeFn<R> = Box<dyn FnMut(&Search<R>) + Send + 'static>;

struct QueuedSearch<R: Rules> {
    tc: TimeControls,
    search_factor: f64,
    pondering: bool,
    on_move: Option<MoveCallback>,
    on_search_begun: Option<BegunCallback>,
    analyze: Option<(f64, f64, AnalyzeFn<R>)>,
}

struct BotControl<R: Rules> {
    is_running: bool,
    is_pondering: bool,
    queued: Option<QueuedSearch<R>>,
}

struct BotShared<R: Rules> {
    control: Mutex<BotControl<R>>,
    work_arrived: Condvar,
    search_done: Condvar,
    should_stop: Arc<AtomicBool>,
    is_killed: AtomicBool,
    search: Mutex<Search<R>>,
}

/// Asynchronous driver owning one search and one background search thread.
pub struct AsyncBot<R: Rules> {
    shared: Arc<BotShared<R>>,
    thread: Option<JoinHandle<()>>,
    /// Snapshots for `undo`: (player to move, board, history) before each
    /// move made through `make_move`.
    undo_stack: Vec<(Player, R::Board, R::History)>,
}

impl<R: Rules> AsyncBot<R> {
    pub fn new(
        params: SearchParams,
        rules: Arc<R>,
        nn: Arc<NnEvaluator<R>>,
        board: R::Board,
        hist: R::History,
        pla: Player,
        seed: u64,
    ) -> Result<AsyncBot<R>, SearchError> {
        let search = Search::new(params, rules, nn, board, hist, pla, seed)?;
        let shared = Arc::new(BotShared {
            control: Mutex::new(BotControl {
                is_running: false,
                is_pondering: false,
                queued: None,
            }),
            work_arrived: Condvar::new(),
            search_done: Condvar::new(),
            should_stop: Arc::new(AtomicBool::new(false)),
            is_killed: AtomicBool::new(false),
            search: Mutex::new(search),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("arbor-search-bot".into())
            .spawn(move || search_thread_loop(thread_shared))
            .expect("failed to spawn bot search thread");
        Ok(AsyncBot {
            shared,
            thread: Some(thread),
            undo_stack: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_pondering(&self) -> bool {
        self.shared.control.lock().expect("bot control poisoned").is_pondering
    }

    pub fn is_running(&self) -> bool {
        self.shared.control.lock().expect("bot control poisoned").is_running
    }

    /// Stop any search and run `f` against the idle search object.
    pub fn with_stopped_search<T>(&self, f: impl FnOnce(&mut Search<R>) -> T) -> T {
        self.stop_and_wait();
        let mut search = self.shared.search.lock().expect("bot search poisoned");
        f(&mut search)
    }

    /// Stop any search and snapshot the analysis of the current tree.
    pub fn get_analysis(&self, max_pv_len: usize) -> Option<AnalysisData> {
        self.with_stopped_search(|s| s.get_analysis(max_pv_len))
    }

    // ------------------------------------------------------------------
    // State changes: all stop and await any ongoing search first
    // ------------------------------------------------------------------

    /// Replace the position. Idempotent; clears the tree and undo history.
    pub fn set_position(
        &mut self,
        pla: Player,
        board: R::Board,
        hist: R::History,
    ) -> Result<(), SearchError> {
        self.check_alive()?;
        self.undo_stack.clear();
        self.with_stopped_search(|s| s.set_position(pla, board, hist));
        Ok(())
    }

    /// Replace parameters, clearing the tree.
    pub fn set_params(&mut self, params: SearchParams) -> Result<(), SearchError> {
        self.check_alive()?;
        self.with_stopped_search(|s| s.set_params(params))
    }

    /// Replace parameters but keep the tree where legal.
    pub fn set_params_no_clearing(&mut self, params: SearchParams) -> Result<(), SearchError> {
        self.check_alive()?;
        self.with_stopped_search(|s| s.set_params_no_clearing(params))
    }

    /// Drop the whole tree.
    pub fn clear_search(&mut self) -> Result<(), SearchError> {
        self.check_alive()?;
        self.with_stopped_search(|s| s.clear_search());
        Ok(())
    }

    /// Play a move, preserving the relevant subtree.
    pub fn make_move(&mut self, loc: Loc, pla: Player) -> Result<(), SearchError> {
        self.check_alive()?;
        self.stop_and_wait();
        let mut search = self.shared.search.lock().expect("bot search poisoned");
        let snapshot = (search.root_pla(), search.root_board().clone(), search.root_hist().clone());
        search.make_move(loc, pla)?;
        self.undo_stack.push(snapshot);
        debug!(%loc, ?pla, "made move");
        Ok(())
    }

    /// Undo the last `make_move`, restoring the pre-move position. The tree
    /// is rebuilt from scratch; the NN cache still holds the old root.
    pub fn undo(&mut self) -> Result<(), SearchError> {
        self.check_alive()?;
        let (pla, board, hist) = self
            .undo_stack
            .pop()
            .ok_or_else(|| SearchError::IllegalRequest("nothing to undo".into()))?;
        self.with_stopped_search(|s| s.set_position(pla, board, hist));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Searching
    // ------------------------------------------------------------------

    /// Start a search and asynchronously deliver the chosen move.
    pub fn gen_move_async(
        &mut self,
        pla: Player,
        tc: TimeControls,
        search_factor: f64,
        on_move: MoveCallback,
    ) -> Result<(), SearchError> {
        self.gen_move_async_analyze(pla, tc, search_factor, on_move, None, None)
    }

    /// `gen_move_async` with periodic analysis callbacks and an optional
    /// search-begun notification.
    pub fn gen_move_async_analyze(
        &mut self,
        pla: Player,
        tc: TimeControls,
        search_factor: f64,
        on_move: MoveCallback,
        analyze: Option<(f64, f64, AnalyzeFn<R>)>,
        on_search_begun: Option<BegunCallback>,
    ) -> Result<(), SearchError> {
        self.check_alive()?;
        self.stop_and_wait();
        self.ensure_player(pla);
        self.enqueue(QueuedSearch {
            tc,
            search_factor,
            pondering: false,
            on_move: Some(on_move),
            on_search_begun,
            analyze,
        })
    }

    /// Run a search and block until the chosen move is available.
    pub fn gen_move_synchronous(
        &mut self,
        pla: Player,
        tc: TimeControls,
        search_factor: f64,
    ) -> Result<Loc, SearchError> {
        self.gen_move_synchronous_analyze(pla, tc, search_factor, None)
    }

    /// Blocking genmove with periodic analysis callbacks.
    pub fn gen_move_synchronous_analyze(
        &mut self,
        pla: Player,
        tc: TimeControls,
        search_factor: f64,
        analyze: Option<(f64, f64, AnalyzeFn<R>)>,
    ) -> Result<Loc, SearchError> {
        let (tx, rx) = bounded(1);
        self.gen_move_async_analyze(
            pla,
            tc,
            search_factor,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            analyze,
            None,
        )?;
        rx.recv().map_err(|_| SearchError::Killed)?
    }

    /// Begin pondering on the current position. Does nothing if a search is
    /// already in progress.
    pub fn ponder(&mut self, search_factor: f64) -> Result<(), SearchError> {
        self.check_alive()?;
        {
            let ctrl = self.shared.control.lock().expect("bot control poisoned");
            if ctrl.is_running || ctrl.queued.is_some() {
                return Ok(());
            }
        }
        self.enqueue(QueuedSearch {
            tc: TimeControls::Unlimited,
            search_factor,
            pondering: true,
            on_move: None,
            on_search_begun: None,
            analyze: None,
        })
    }

    /// Stop any search, then ponder while periodically delivering analysis
    /// snapshots: first after `first_after` seconds, then every `period`.
    pub fn analyze_async(
        &mut self,
        pla: Player,
        search_factor: f64,
        period: f64,
        first_after: f64,
        callback: AnalyzeFn<R>,
    ) -> Result<(), SearchError> {
        self.check_alive()?;
        self.stop_and_wait();
        self.ensure_player(pla);
        self.enqueue(QueuedSearch {
            tc: TimeControls::Unlimited,
            search_factor,
            pondering: true,
            on_move: None,
            on_search_begun: None,
            analyze: Some((period, first_after, callback)),
        })
    }

    // ------------------------------------------------------------------
    // Stopping
    // ------------------------------------------------------------------

    /// Signal any ongoing search to stop and wait until it has. Safe to call
    /// when nothing is running.
    pub fn stop_and_wait(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        let mut ctrl = self.shared.control.lock().expect("bot control poisoned");
        ctrl.queued = None;
        while ctrl.is_running {
            ctrl = self.shared.search_done.wait(ctrl).expect("bot control poisoned");
        }
    }

    /// Signal a stop without waiting or locking. Safe from inside callbacks.
    pub fn stop_without_wait(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
    }

    /// Permanently prevent any further search.
    pub fn set_killed(&self) {
        self.shared.is_killed.store(true, Ordering::Release);
        self.shared.should_stop.store(true, Ordering::Release);
        let mut ctrl = self.shared.control.lock().expect("bot control poisoned");
        ctrl.queued = None;
        self.shared.work_arrived.notify_all();
        self.shared.search_done.notify_all();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_alive(&self) -> Result<(), SearchError> {
        if self.shared.is_killed.load(Ordering::Acquire) {
            Err(SearchError::Killed)
        } else {
            Ok(())
        }
    }

    /// Align the search's player-to-move with a genmove request. A mismatch
    /// re-seats the position for the requested player, dropping the tree.
    fn ensure_player(&self, pla: Player) {
        let mut search = self.shared.search.lock().expect("bot search poisoned");
        if search.root_pla() != pla {
            let board = search.root_board().clone();
            let hist = search.root_hist().clone();
            search.set_position(pla, board, hist);
        }
    }

    fn enqueue(&self, queued: QueuedSearch<R>) -> Result<(), SearchError> {
        self.check_alive()?;
        self.shared.should_stop.store(false, Ordering::Release);
        let mut ctrl = self.shared.control.lock().expect("bot control poisoned");
        ctrl.queued = Some(queued);
        self.shared.work_arrived.notify_all();
        Ok(())
    }
}

impl<R: Rules> Drop for AsyncBot<R> {
    fn drop(&mut self) {
        self.set_killed();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn search_thread_loop<R: Rules>(shared: Arc<BotShared<R>>) {
    loop {
        let mut queued = {
            let mut ctrl = shared.control.lock().expect("bot control poisoned");
            loop {
                if shared.is_killed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(q) = ctrl.queued.take() {
                    ctrl.is_running = true;
                    ctrl.is_pondering = q.pondering;
                    break q;
                }
                ctrl = shared.work_arrived.wait(ctrl).expect("bot control poisoned");
            }
        };

        let result: Result<Option<Loc>, SearchError> = {
            let mut search = shared.search.lock().expect("bot search poisoned");
            if let Some(begun) = queued.on_search_begun.take() {
                begun();
            }
            let analyze_holder = queued.analyze.as_mut();
            let analyze = analyze_holder.map(|(period, first_after, f)| AnalyzeCallback {
                period: *period,
                first_after: *first_after,
                callback: &mut **f,
            });
            let run = search.run_whole_search(
                shared.should_stop.clone(),
                &queued.tc,
                queued.search_factor,
                queued.pondering,
                analyze,
            );
            match run {
                Ok(()) if queued.pondering => Ok(None),
                Ok(()) => search.get_chosen_move().map(Some),
                Err(e) => {
                    // A partial tree can still produce a best-so-far move.
                    if !queued.pondering && matches!(e, SearchError::InvariantViolation(_)) {
                        Err(e)
                    } else if !queued.pondering {
                        search.get_chosen_move().map(Some).map_err(|_| e)
                    } else {
                        Err(e)
                    }
                }
            }
        };

        if let Some(on_move) = queued.on_move.take() {
            let move_result = result.map(|opt| opt.expect("non-ponder search must yield a move"));
            match &move_result {
                Ok(loc) => info!(%loc, "genmove complete"),
                Err(e) => info!(error = %e, "genmove failed"),
            }
            on_move(move_result);
        }

        let mut ctrl = shared.control.lock().expect("bot control poisoned");
        ctrl.is_running = false;
        ctrl.is_pondering = false;
        shared.search_done.notify_all();
        drop(ctrl);
    }
}
