//! Batched neural-net evaluation service.
//!
//! Worker threads issue one blocking `evaluate` call per leaf. Requests flow
//! over a channel to one or more server threads which aggregate them into
//! batches for the backend, then complete each caller individually. A sharded
//! LRU cache keyed by situation hash and input parameters short-circuits
//! repeat evaluations; concurrent misses on the same key coalesce into a
//! single backend call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arbor_core::symmetry::{self, Symmetry};
use arbor_core::{EncodeParams, Hash128, NetInput, Player, Rules};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::EvalError;
use crate::node::NnOutput;

/// Raised by a backend when a batch fails.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// One position's worth of raw backend output.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    /// Unnormalized policy logits, length = policy size.
    pub policy_logits: Vec<f32>,
    pub win_prob: f32,
    pub loss_prob: f32,
    pub no_result_prob: f32,
    /// Short-term win/loss error head; ignored unless the backend reports
    /// support for it.
    pub shortterm_winloss_error: f32,
    /// Auxiliary estimate of the number of moves left in the game.
    pub time_left: f32,
}

/// The neural-net backend consumed by the evaluator.
///
/// Implementations wrap whatever actually runs the network. Backends using
/// KataGo-convention global pooling should treat the pooling normalizer
/// (the model-training constant, 14.0 for 19x19-era nets) as a named model
/// parameter; nothing in the search consumes it.
pub trait NnBackend: Send + Sync + 'static {
    /// Stable identifier of the loaded model, folded into cache keys.
    fn model_id(&self) -> &str;

    /// Largest batch the backend accepts in one call.
    fn max_batch_size(&self) -> usize;

    /// Whether `shortterm_winloss_error` is meaningful.
    fn supports_shortterm_error(&self) -> bool;

    /// Resolve a desired rules description against what the model was
    /// trained for. Returns the closest supported description and whether it
    /// matched exactly. The default accepts anything verbatim.
    fn supported_rules(&self, desired: &str) -> (String, bool) {
        (desired.to_string(), true)
    }

    /// Evaluate a batch of encoded inputs. On error the whole batch fails.
    fn evaluate_batch(&self, inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError>;
}

/// Symmetry handling for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetrySpec {
    /// Evaluate under one fixed symmetry.
    Fixed(Symmetry),
    /// Evaluate under every applicable symmetry and average.
    All,
}

impl SymmetrySpec {
    fn cache_code(self) -> u8 {
        match self {
            SymmetrySpec::Fixed(s) => s,
            SymmetrySpec::All => symmetry::NUM_SYMMETRIES,
        }
    }
}

/// Per-request input parameters.
#[derive(Debug, Clone, Copy)]
pub struct NnInputParams {
    pub symmetry: SymmetrySpec,
    pub playout_doubling_advantage: f64,
    pub no_result_utility_for_white: f64,
}

impl Default for NnInputParams {
    fn default() -> Self {
        NnInputParams {
            symmetry: SymmetrySpec::Fixed(0),
            playout_doubling_advantage: 0.0,
            no_result_utility_for_white: 0.0,
        }
    }
}

/// Evaluator configuration.
#[derive(Debug, Clone)]
pub struct NnEvalConfig {
    /// Target batch size the server aggregates toward.
    pub max_batch_size: usize,
    /// How long the server tops off an under-full batch before running it.
    pub batch_wait: Duration,
    /// Total cached outputs across all shards.
    pub cache_size: usize,
    /// log2 of the number of cache shards.
    pub cache_shards_power_of_two: u32,
    /// Number of server threads feeding the backend.
    pub num_server_threads: usize,
    /// Policy temperature applied to logits before the softmax.
    pub policy_temperature: f64,
}

impl Default for NnEvalConfig {
    fn default() -> Self {
        NnEvalConfig {
            max_batch_size: 16,
            batch_wait: Duration::from_micros(500),
            cache_size: 1 << 16,
            cache_shards_power_of_two: 6,
            num_server_threads: 1,
            policy_temperature: 1.0,
        }
    }
}

struct EvalRequest {
    inputs: Vec<NetInput>,
    resp: Sender<Result<Vec<BackendOutput>, EvalError>>,
}

enum CacheSlot {
    Ready(Arc<NnOutput>),
    Pending(Vec<Sender<Result<Arc<NnOutput>, EvalError>>>),
}

struct CacheShard {
    map: HashMap<u128, (CacheSlot, u64)>,
    order: VecDeque<(u128, u64)>,
    next_gen: u64,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> CacheShard {
        CacheShard {
            map: HashMap::new(),
            order: VecDeque::new(),
            next_gen: 0,
            capacity: capacity.max(2),
        }
    }

    fn touch(&mut self, key: u128) {
        let gen = self.next_gen;
        self.next_gen += 1;
        if let Some(entry) = self.map.get_mut(&key) {
            entry.1 = gen;
        }
        self.order.push_back((key, gen));
    }

    fn evict_to_capacity(&mut self) {
        while self.map.len() > self.capacity {
            let Some((key, gen)) = self.order.pop_front() else { break };
            match self.map.get(&key) {
                Some((CacheSlot::Ready(_), g)) if *g == gen => {
                    self.map.remove(&key);
                }
                Some((CacheSlot::Pending(_), g)) if *g == gen => {
                    // In-flight entries are never evicted; revisit later.
                    self.order.push_back((key, gen));
                    break;
                }
                _ => {} // Stale order entry; the key was touched again.
            }
        }
    }
}

#[derive(Debug, Default)]
struct EvalCounters {
    cache_hits: AtomicU64,
    cache_waits: AtomicU64,
    backend_evals: AtomicU64,
    backend_batches: AtomicU64,
    backend_failures: AtomicU64,
}

/// The batching evaluation service.
pub struct NnEvaluator<R: Rules> {
    rules: Arc<R>,
    backend: Arc<dyn NnBackend>,
    tx: Option<Sender<EvalRequest>>,
    servers: Vec<JoinHandle<()>>,
    shards: Vec<Mutex<CacheShard>>,
    model_hash: u64,
    config: NnEvalConfig,
    counters: EvalCounters,
}

impl<R: Rules> NnEvaluator<R> {
    pub fn new(rules: Arc<R>, backend: Arc<dyn NnBackend>, config: NnEvalConfig) -> NnEvaluator<R> {
        let (tx, rx) = unbounded::<EvalRequest>();
        let num_shards = 1usize << config.cache_shards_power_of_two;
        let shard_capacity = (config.cache_size / num_shards).max(2);
        let shards = (0..num_shards).map(|_| Mutex::new(CacheShard::new(shard_capacity))).collect();

        let mut servers = Vec::new();
        for i in 0..config.num_server_threads.max(1) {
            let rx = rx.clone();
            let backend = backend.clone();
            let max_batch = config.max_batch_size.max(1).min(backend.max_batch_size().max(1));
            let wait = config.batch_wait;
            servers.push(
                std::thread::Builder::new()
                    .name(format!("nneval-server-{}", i))
                    .spawn(move || server_loop(rx, backend, max_batch, wait))
                    .expect("failed to spawn nn server thread"),
            );
        }

        let model_hash = backend
            .model_id()
            .bytes()
            .fold(Hash128::ZERO, |h, b| h.mix_u64(b as u64))
            .mix_u64(backend.model_id().len() as u64)
            .lo;

        NnEvaluator {
            rules,
            backend,
            tx: Some(tx),
            servers,
            shards,
            model_hash,
            config,
            counters: EvalCounters::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn NnBackend> {
        &self.backend
    }

    pub fn supports_shortterm_error(&self) -> bool {
        self.backend.supports_shortterm_error()
    }

    /// Evaluate one position, blocking until a result is available.
    ///
    /// On a cache hit (and `skip_cache` false) the stored output is returned;
    /// two calls with the same key return the same `Arc`. On a miss the
    /// request is batched to the backend and the result cached. Backend
    /// failures surface as retryable `EvalError::Backend`; the evaluator does
    /// not retry on its own.
    pub fn evaluate(
        &self,
        board: &R::Board,
        hist: &R::History,
        pla: Player,
        input_params: &NnInputParams,
        skip_cache: bool,
    ) -> Result<Arc<NnOutput>, EvalError> {
        let key = self.cache_key(board, hist, pla, input_params);

        if !skip_cache {
            let shard = &self.shards[self.shard_index(key)];
            let mut guard = shard.lock().expect("nn cache shard poisoned");
            match guard.map.get_mut(&key) {
                Some((CacheSlot::Ready(out), _)) => {
                    let out = out.clone();
                    guard.touch(key);
                    drop(guard);
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(out);
                }
                Some((CacheSlot::Pending(waiters), _)) => {
                    let (tx, rx) = bounded(1);
                    waiters.push(tx);
                    drop(guard);
                    self.counters.cache_waits.fetch_add(1, Ordering::Relaxed);
                    return rx.recv().map_err(|_| EvalError::ShutDown)?;
                }
                None => {
                    guard.map.insert(key, (CacheSlot::Pending(Vec::new()), 0));
                    guard.touch(key);
                }
            }
        }

        let result = self.evaluate_uncached(board, hist, pla, input_params);

        if !skip_cache {
            let shard = &self.shards[self.shard_index(key)];
            let mut guard = shard.lock().expect("nn cache shard poisoned");
            let waiters = match guard.map.remove(&key) {
                Some((CacheSlot::Pending(w), _)) => w,
                _ => Vec::new(),
            };
            match &result {
                Ok(out) => {
                    guard.map.insert(key, (CacheSlot::Ready(out.clone()), 0));
                    guard.touch(key);
                    guard.evict_to_capacity();
                    drop(guard);
                    for w in waiters {
                        let _ = w.send(Ok(out.clone()));
                    }
                }
                Err(e) => {
                    drop(guard);
                    for w in waiters {
                        let _ = w.send(Err(e.clone()));
                    }
                }
            }
        }

        result
    }

    /// Snapshot of the evaluator's counters for diagnostics.
    pub fn stats(&self) -> NnEvalStats {
        NnEvalStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_waits: self.counters.cache_waits.load(Ordering::Relaxed),
            backend_evals: self.counters.backend_evals.load(Ordering::Relaxed),
            backend_batches: self.counters.backend_batches.load(Ordering::Relaxed),
            backend_failures: self.counters.backend_failures.load(Ordering::Relaxed),
        }
    }

    fn shard_index(&self, key: u128) -> usize {
        (key as u64 as usize) & (self.shards.len() - 1)
    }

    fn cache_key(
        &self,
        board: &R::Board,
        hist: &R::History,
        pla: Player,
        input_params: &NnInputParams,
    ) -> u128 {
        let sit = self.rules.situation_hash(board, pla);
        let ctx = self.rules.graph_context_hash(hist);
        let pda_bucket = (input_params.playout_doubling_advantage * 64.0).round() as i64;
        let nru_bucket = (input_params.no_result_utility_for_white * 1024.0).round() as i64;
        let h = sit
            .combine(ctx)
            .mix_u64(self.model_hash)
            .mix_u64(pda_bucket as u64)
            .mix_u64(nru_bucket as u64)
            .mix_u64(match pla {
                Player::Black => 1,
                Player::White => 2,
            })
            .mix_u64(input_params.symmetry.cache_code() as u64);
        ((h.hi as u128) << 64) | h.lo as u128
    }

    fn evaluate_uncached(
        &self,
        board: &R::Board,
        hist: &R::History,
        pla: Player,
        input_params: &NnInputParams,
    ) -> Result<Arc<NnOutput>, EvalError> {
        let (w, h) = self.rules.board_dims();
        let channels = self.rules.spatial_channels();
        let enc = EncodeParams {
            playout_doubling_advantage: input_params.playout_doubling_advantage,
            no_result_utility_for_white: input_params.no_result_utility_for_white,
        };
        let mut canonical = NetInput::default();
        self.rules.encode_input(board, hist, pla, &enc, &mut canonical);

        let syms: Vec<Symmetry> = match input_params.symmetry {
            SymmetrySpec::Fixed(s) => vec![s],
            SymmetrySpec::All => {
                (0..symmetry::NUM_SYMMETRIES).filter(|&s| symmetry::is_valid_for(s, w, h)).collect()
            }
        };

        let inputs: Vec<NetInput> = syms
            .iter()
            .map(|&s| {
                if s == 0 {
                    canonical.clone()
                } else {
                    NetInput {
                        spatial: symmetry::transform_spatial(&canonical.spatial, channels, w, h, s),
                        global: canonical.global.clone(),
                    }
                }
            })
            .collect();

        let outputs = self.request(inputs)?;

        let legal = self.rules.legal_moves(board, hist, pla);
        let policy_size = self.rules.policy_size();
        let mut policy = vec![0.0f64; policy_size];
        let mut win = 0.0f64;
        let mut loss = 0.0f64;
        let mut no_result = 0.0f64;
        let mut shortterm = 0.0f64;
        let mut time_left = 0.0f64;
        for (out, &s) in outputs.iter().zip(syms.iter()) {
            if out.policy_logits.len() != policy_size {
                return Err(EvalError::InvalidOutput(format!(
                    "policy length {} != policy size {}",
                    out.policy_logits.len(),
                    policy_size
                )));
            }
            let canonical_logits = if s == 0 {
                out.policy_logits.clone()
            } else {
                symmetry::transform_policy(&out.policy_logits, w, h, symmetry::inverse(s))
            };
            let probs = masked_softmax(
                &canonical_logits,
                &legal,
                policy_size,
                self.config.policy_temperature,
            );
            for (acc, p) in policy.iter_mut().zip(probs.iter()) {
                *acc += *p as f64;
            }
            win += out.win_prob as f64;
            loss += out.loss_prob as f64;
            no_result += out.no_result_prob as f64;
            shortterm += out.shortterm_winloss_error as f64;
            time_left += out.time_left as f64;
        }
        let n = outputs.len() as f64;
        let (win, loss, no_result) = normalize_value_probs(win / n, loss / n, no_result / n)?;
        let policy: Box<[f32]> = policy.iter().map(|p| (*p / n) as f32).collect();
        if policy.iter().any(|p| !p.is_finite()) {
            return Err(EvalError::InvalidOutput("non-finite policy".into()));
        }

        Ok(Arc::new(NnOutput {
            policy,
            win_prob: win as f32,
            loss_prob: loss as f32,
            no_result_prob: no_result as f32,
            shortterm_winloss_error: self
                .backend
                .supports_shortterm_error()
                .then_some((shortterm / n).max(0.0) as f32),
            time_left: Some((time_left / n) as f32),
            symmetry: input_params.symmetry.cache_code(),
        }))
    }

    fn request(&self, inputs: Vec<NetInput>) -> Result<Vec<BackendOutput>, EvalError> {
        let n = inputs.len() as u64;
        let (resp_tx, resp_rx) = bounded(1);
        let req = EvalRequest {
            inputs,
            resp: resp_tx,
        };
        self.tx
            .as_ref()
            .ok_or(EvalError::ShutDown)?
            .send(req)
            .map_err(|_| EvalError::ShutDown)?;
        let result = resp_rx.recv().map_err(|_| EvalError::ShutDown)?;
        match &result {
            Ok(_) => {
                self.counters.backend_evals.fetch_add(n, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.backend_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.backend_batches.fetch_add(1, Ordering::Relaxed);
        result
    }
}

impl<R: Rules> Drop for NnEvaluator<R> {
    fn drop(&mut self) {
        let stats = self.stats();
        debug!(
            cache_hits = stats.cache_hits,
            backend_evals = stats.backend_evals,
            backend_batches = stats.backend_batches,
            backend_failures = stats.backend_failures,
            "shutting down nn evaluator"
        );
        self.tx = None;
        for handle in self.servers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy)]
pub struct NnEvalStats {
    pub cache_hits: u64,
    pub cache_waits: u64,
    pub backend_evals: u64,
    pub backend_batches: u64,
    pub backend_failures: u64,
}

fn server_loop(
    rx: Receiver<EvalRequest>,
    backend: Arc<dyn NnBackend>,
    max_batch: usize,
    wait: Duration,
) {
    loop {
        let first = match rx.recv() {
            Ok(r) => r,
            Err(_) => return,
        };
        let mut reqs = vec![first];
        let mut total: usize = reqs[0].inputs.len();
        let deadline = Instant::now() + wait;
        while total < max_batch {
            match rx.try_recv() {
                Ok(r) => {
                    total += r.inputs.len();
                    reqs.push(r);
                }
                Err(crossbeam_channel::TryRecvError::Empty) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(r) => {
                            total += r.inputs.len();
                            reqs.push(r);
                        }
                        Err(_) => break,
                    }
                }
                Err(crossbeam_channel::TryRecvError::Disconnected) => break,
            }
        }

        let inputs: Vec<NetInput> = reqs.iter().flat_map(|r| r.inputs.iter().cloned()).collect();

        // The backend call itself may be chunked below its own batch limit.
        let mut outputs: Vec<BackendOutput> = Vec::with_capacity(inputs.len());
        let mut failure: Option<BackendError> = None;
        for chunk in inputs.chunks(backend.max_batch_size().max(1)) {
            match backend.evaluate_batch(chunk) {
                Ok(mut outs) => {
                    if outs.len() != chunk.len() {
                        failure = Some(BackendError(format!(
                            "backend returned {} outputs for {} inputs",
                            outs.len(),
                            chunk.len()
                        )));
                        break;
                    }
                    outputs.append(&mut outs);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) => {
                warn!(error = %e, batch = inputs.len(), "nn backend batch failed");
                for req in reqs {
                    let _ = req.resp.send(Err(EvalError::Backend(e.to_string())));
                }
            }
            None => {
                let mut offset = 0;
                for req in reqs {
                    let n = req.inputs.len();
                    let slice = outputs[offset..offset + n].to_vec();
                    offset += n;
                    let _ = req.resp.send(Ok(slice));
                }
            }
        }
    }
}

/// Softmax over legal entries only; illegal entries get probability zero.
fn masked_softmax(logits: &[f32], legal: &[arbor_core::Loc], size: usize, temperature: f64) -> Vec<f32> {
    let mut out = vec![0.0f32; size];
    let mut max_logit = f32::NEG_INFINITY;
    for loc in legal {
        let l = logits[loc.index()];
        if l > max_logit {
            max_logit = l;
        }
    }
    if max_logit == f32::NEG_INFINITY {
        return out;
    }
    let inv_t = (1.0 / temperature) as f32;
    let mut sum = 0.0f32;
    for loc in legal {
        let e = ((logits[loc.index()] - max_logit) * inv_t).exp();
        out[loc.index()] = e;
        sum += e;
    }
    if sum > 0.0 {
        for v in &mut out {
            *v /= sum;
        }
    }
    out
}

fn normalize_value_probs(win: f64, loss: f64, no_result: f64) -> Result<(f64, f64, f64), EvalError> {
    if !win.is_finite() || !loss.is_finite() || !no_result.is_finite() {
        return Err(EvalError::InvalidOutput("non-finite value head".into()));
    }
    let win = win.max(0.0);
    let loss = loss.max(0.0);
    let no_result = no_result.max(0.0);
    let sum = win + loss + no_result;
    if sum <= 0.0 {
        return Err(EvalError::InvalidOutput("value head sums to zero".into()));
    }
    Ok((win / sum, loss / sum, no_result / sum))
}

/// Backend returning a uniform policy and a neutral value. Handy for tests
/// and for exercising the search without a model.
#[derive(Debug, Clone, Default)]
pub struct UniformBackend {
    pub policy_size: usize,
}

impl UniformBackend {
    pub fn new(policy_size: usize) -> UniformBackend {
        UniformBackend { policy_size }
    }
}

impl NnBackend for UniformBackend {
    fn model_id(&self) -> &str {
        "uniform"
    }

    fn max_batch_size(&self) -> usize {
        64
    }

    fn supports_shortterm_error(&self) -> bool {
        false
    }

    fn evaluate_batch(&self, inputs: &[NetInput]) -> Result<Vec<BackendOutput>, BackendError> {
        Ok(inputs
            .iter()
            .map(|_| BackendOutput {
                policy_logits: vec![0.0; self.policy_size],
                win_prob: 0.5,
                loss_prob: 0.5,
                no_result_prob: 0.0,
                shortterm_winloss_error: 0.0,
                time_left: 0.0,
            })
            .collect())
    }
}
