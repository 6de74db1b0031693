//! Search tree nodes.
//!
//! A node represents a game state reached by a (possibly shared) path. All
//! mutable node state is atomic: stats go through a single-owner spin flag,
//! the NN output is published exactly once, and child edges are installed in
//! fixed-capacity tiers whose storage never moves once readers can see it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use arbor_core::{Player, Symmetry, TerminalValue};
use atomic_float::AtomicF64;

/// Index into the node arena. Newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Capacities of the three children tiers. A node's logical child list is the
/// concatenation of its allocated tiers; tier storage is allocated lazily and
/// never reallocated, so a reader holding a slot reference is never
/// invalidated by growth.
pub const CHILDREN_TIER_CAPS: [usize; 2] = [8, 56];
pub const NUM_CHILDREN_TIERS: usize = 3;

/// Neural-net output attached to an expanded node. Written once.
#[derive(Debug, Clone)]
pub struct NnOutput {
    /// Probability over all policy positions, including pass.
    pub policy: Box<[f32]>,
    pub win_prob: f32,
    pub loss_prob: f32,
    pub no_result_prob: f32,
    /// Short-term win/loss error head, if the backend supplies one.
    pub shortterm_winloss_error: Option<f32>,
    /// Auxiliary estimate of the remaining game length, if the backend
    /// supplies one.
    pub time_left: Option<f32>,
    /// Which symmetry the input was evaluated under; `u8::MAX` means the
    /// output is an average over all symmetries.
    pub symmetry: Symmetry,
}

impl NnOutput {
    /// Fabricated output for a terminal leaf: the exact game outcome with an
    /// all-zero policy. Terminal leaves are never selected through.
    pub fn terminal(value: TerminalValue, policy_size: usize) -> NnOutput {
        let win = ((1.0 + value.win_loss - value.no_result) / 2.0).clamp(0.0, 1.0) as f32;
        let loss = ((1.0 - value.win_loss - value.no_result) / 2.0).clamp(0.0, 1.0) as f32;
        NnOutput {
            policy: vec![0.0; policy_size].into_boxed_slice(),
            win_prob: win,
            loss_prob: loss,
            no_result_prob: value.no_result as f32,
            shortterm_winloss_error: Some(0.0),
            time_left: None,
            symmetry: 0,
        }
    }

    #[inline]
    pub fn win_loss(&self) -> f64 {
        self.win_prob as f64 - self.loss_prob as f64
    }
}

/// Plain snapshot of a node's aggregate statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
    pub visits: i64,
    pub weight_sum: f64,
    pub weight_sq_sum: f64,
    pub win_loss_avg: f64,
    pub no_result_avg: f64,
    pub utility_avg: f64,
    pub utility_sq_avg: f64,
}

impl NodeStats {
    /// The share of this node's weight that one parent edge owns under graph
    /// search, where the node may be reached through several edges.
    #[inline]
    pub fn child_weight_share(&self, edge_visits: i64) -> f64 {
        if self.visits <= 0 || edge_visits <= 0 {
            0.0
        } else if edge_visits >= self.visits {
            self.weight_sum
        } else {
            self.weight_sum * edge_visits as f64 / self.visits as f64
        }
    }

    /// Effective sample size given uneven playout weights.
    #[inline]
    pub fn effective_sample_size(&self) -> f64 {
        if self.weight_sq_sum <= 0.0 {
            0.0
        } else {
            self.weight_sum * self.weight_sum / self.weight_sq_sum
        }
    }

    /// Sample stdev of utility, floored for numeric stability.
    #[inline]
    pub fn utility_stdev(&self) -> f64 {
        (self.utility_sq_avg - self.utility_avg * self.utility_avg).max(0.0).sqrt()
    }
}

/// Atomic mirror of `NodeStats`. Writers hold the node's stats spin flag;
/// readers may take a snapshot at any time and tolerate a slightly stale mix
/// of fields, but never torn scalars.
#[derive(Debug, Default)]
pub struct NodeStatsAtomics {
    pub visits: AtomicI64,
    pub weight_sum: AtomicF64,
    pub weight_sq_sum: AtomicF64,
    pub win_loss_avg: AtomicF64,
    pub no_result_avg: AtomicF64,
    pub utility_avg: AtomicF64,
    pub utility_sq_avg: AtomicF64,
}

impl NodeStatsAtomics {
    pub fn snapshot(&self) -> NodeStats {
        NodeStats {
            visits: self.visits.load(Ordering::Acquire),
            weight_sum: self.weight_sum.load(Ordering::Acquire),
            weight_sq_sum: self.weight_sq_sum.load(Ordering::Acquire),
            win_loss_avg: self.win_loss_avg.load(Ordering::Acquire),
            no_result_avg: self.no_result_avg.load(Ordering::Acquire),
            utility_avg: self.utility_avg.load(Ordering::Acquire),
            utility_sq_avg: self.utility_sq_avg.load(Ordering::Acquire),
        }
    }
}

/// One slot in a node's children array.
///
/// Publication protocol: the writer stores the child id with release, then
/// the move with release. Readers load the move with acquire and treat a NULL
/// move as the end of the list, so any visible slot has a visible child.
#[derive(Debug)]
pub struct SearchChildPointer {
    move_loc: AtomicU32,
    child: AtomicU32,
    edge_visits: AtomicI64,
}

const NULL_MOVE: u32 = u32::MAX;

impl SearchChildPointer {
    pub fn new() -> SearchChildPointer {
        SearchChildPointer {
            move_loc: AtomicU32::new(NULL_MOVE),
            child: AtomicU32::new(NodeId::NONE.0),
            edge_visits: AtomicI64::new(0),
        }
    }

    /// The move on this edge, or `None` if the slot is unallocated.
    #[inline]
    pub fn move_loc(&self) -> Option<arbor_core::Loc> {
        let raw = self.move_loc.load(Ordering::Acquire);
        if raw == NULL_MOVE {
            None
        } else {
            Some(arbor_core::Loc(raw))
        }
    }

    #[inline]
    pub fn child(&self) -> NodeId {
        NodeId(self.child.load(Ordering::Acquire))
    }

    #[inline]
    pub fn edge_visits(&self) -> i64 {
        self.edge_visits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn add_edge_visits(&self, n: i64) {
        self.edge_visits.fetch_add(n, Ordering::AcqRel);
    }

    /// Publish this slot. Must only be called once, under the parent's
    /// insertion lock, on a slot whose move is still NULL.
    pub fn publish(&self, loc: arbor_core::Loc, child: NodeId) {
        debug_assert_eq!(self.move_loc.load(Ordering::Relaxed), NULL_MOVE);
        self.child.store(child.0, Ordering::Release);
        self.move_loc.store(loc.0, Ordering::Release);
    }
}

impl Default for SearchChildPointer {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of the shared search tree (or graph, under graph search).
#[derive(Debug)]
pub struct SearchNode {
    /// Player to move at this node.
    pub next_pla: Player,
    nn_output: OnceLock<Arc<NnOutput>>,
    children: [OnceLock<Box<[SearchChildPointer]>>; NUM_CHILDREN_TIERS],
    pub stats: NodeStatsAtomics,
    stats_lock: AtomicBool,
    /// Pending backup contributions awaiting aggregation.
    pub dirty_counter: AtomicI32,
    /// Threads currently descending through this node.
    pub virtual_losses: AtomicI32,
}

impl SearchNode {
    pub fn new(next_pla: Player) -> SearchNode {
        SearchNode {
            next_pla,
            nn_output: OnceLock::new(),
            children: [OnceLock::new(), OnceLock::new(), OnceLock::new()],
            stats: NodeStatsAtomics::default(),
            stats_lock: AtomicBool::new(false),
            dirty_counter: AtomicI32::new(0),
            virtual_losses: AtomicI32::new(0),
        }
    }

    /// The node's NN output, if it has been evaluated. A `Some` implies the
    /// node is expanded and safe to select through.
    #[inline]
    pub fn nn_output(&self) -> Option<&Arc<NnOutput>> {
        self.nn_output.get()
    }

    /// Install the NN output. Returns false if another thread won the race,
    /// in which case the existing output stands.
    pub fn set_nn_output(&self, out: Arc<NnOutput>) -> bool {
        self.nn_output.set(out).is_ok()
    }

    /// Capacity of children tier `t` given the game's policy size.
    pub fn tier_capacity(t: usize, policy_size: usize) -> usize {
        match t {
            0 => CHILDREN_TIER_CAPS[0],
            1 => CHILDREN_TIER_CAPS[1],
            _ => policy_size.saturating_sub(CHILDREN_TIER_CAPS[0] + CHILDREN_TIER_CAPS[1]).max(1),
        }
    }

    /// The slot for logical child index `i`, if its tier is allocated.
    pub fn child_slot(&self, i: usize, policy_size: usize) -> Option<&SearchChildPointer> {
        let mut idx = i;
        for (t, tier) in self.children.iter().enumerate() {
            let cap = Self::tier_capacity(t, policy_size);
            if idx < cap {
                return tier.get().map(|arr| &arr[idx]);
            }
            idx -= cap;
        }
        None
    }

    /// Ensure the tier containing logical index `i` is allocated and return
    /// its slot. Only called under the parent's insertion lock.
    pub fn child_slot_or_grow(&self, i: usize, policy_size: usize) -> &SearchChildPointer {
        let mut idx = i;
        for (t, tier) in self.children.iter().enumerate() {
            let cap = Self::tier_capacity(t, policy_size);
            if idx < cap {
                let arr = tier.get_or_init(|| {
                    (0..cap).map(|_| SearchChildPointer::new()).collect::<Vec<_>>().into_boxed_slice()
                });
                return &arr[idx];
            }
            idx -= cap;
        }
        unreachable!("child index {} beyond policy size {}", i, policy_size)
    }

    /// Iterate the allocated children in installation order, stopping at the
    /// first unallocated slot. Lock-free.
    pub fn children(&self, policy_size: usize) -> ChildIter<'_> {
        ChildIter {
            node: self,
            policy_size,
            next: 0,
        }
    }

    /// Number of currently visible children.
    pub fn num_children(&self, policy_size: usize) -> usize {
        self.children(policy_size).count()
    }

    /// Acquire the single-owner stats critical section.
    pub fn lock_stats(&self) -> StatsGuard<'_> {
        while self
            .stats_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        StatsGuard { node: self }
    }

    #[inline]
    pub fn add_virtual_loss(&self) {
        self.virtual_losses.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn remove_virtual_loss(&self) {
        let prev = self.virtual_losses.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub fn virtual_loss_count(&self) -> i32 {
        self.virtual_losses.load(Ordering::Acquire)
    }
}

/// RAII guard for the stats spin flag.
pub struct StatsGuard<'a> {
    node: &'a SearchNode,
}

impl Drop for StatsGuard<'_> {
    fn drop(&mut self) {
        self.node.stats_lock.store(false, Ordering::Release);
    }
}

/// Lock-free iterator over a node's visible children.
pub struct ChildIter<'a> {
    node: &'a SearchNode,
    policy_size: usize,
    next: usize,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = (arbor_core::Loc, &'a SearchChildPointer);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.node.child_slot(self.next, self.policy_size)?;
        let loc = slot.move_loc()?;
        self.next += 1;
        Some((loc, slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::Loc;

    #[test]
    fn node_starts_unexpanded() {
        let node = SearchNode::new(Player::Black);
        assert!(node.nn_output().is_none());
        assert_eq!(node.num_children(82), 0);
        assert_eq!(node.stats.snapshot().visits, 0);
    }

    #[test]
    fn nn_output_installs_once() {
        let node = SearchNode::new(Player::White);
        let out = Arc::new(NnOutput::terminal(TerminalValue::DRAW, 10));
        assert!(node.set_nn_output(out.clone()));
        let other = Arc::new(NnOutput::terminal(TerminalValue::NO_RESULT, 10));
        assert!(!node.set_nn_output(other));
        assert_eq!(node.nn_output().unwrap().no_result_prob, 0.0);
    }

    #[test]
    fn children_publish_and_iterate() {
        let node = SearchNode::new(Player::Black);
        let policy_size = 100;
        for i in 0..20 {
            let slot = node.child_slot_or_grow(i, policy_size);
            slot.publish(Loc(i as u32), NodeId(i as u32 + 1));
        }
        let seen: Vec<_> = node.children(policy_size).map(|(l, s)| (l, s.child())).collect();
        assert_eq!(seen.len(), 20);
        for (i, (loc, child)) in seen.iter().enumerate() {
            assert_eq!(loc.index(), i);
            assert_eq!(child.0, i as u32 + 1);
        }
        // Iteration stops at the first unallocated slot even though tier 1 is
        // partially filled.
        assert_eq!(node.num_children(policy_size), 20);
    }

    #[test]
    fn tier_capacities_cover_policy() {
        let policy_size = 362;
        let total: usize = (0..NUM_CHILDREN_TIERS)
            .map(|t| SearchNode::tier_capacity(t, policy_size))
            .sum();
        assert!(total >= policy_size);
    }

    #[test]
    fn terminal_output_probabilities() {
        let out = NnOutput::terminal(TerminalValue::win_for(Player::White), 5);
        assert_eq!(out.win_prob, 1.0);
        assert_eq!(out.loss_prob, 0.0);
        assert_eq!(out.win_loss(), 1.0);
        let out = NnOutput::terminal(TerminalValue::win_for(Player::Black), 5);
        assert_eq!(out.win_loss(), -1.0);
        let out = NnOutput::terminal(TerminalValue::NO_RESULT, 5);
        assert_eq!(out.no_result_prob, 1.0);
    }

    #[test]
    fn child_weight_share_caps_at_full_weight() {
        let stats = NodeStats {
            visits: 10,
            weight_sum: 8.0,
            ..Default::default()
        };
        assert_eq!(stats.child_weight_share(5), 4.0);
        assert_eq!(stats.child_weight_share(10), 8.0);
        assert_eq!(stats.child_weight_share(15), 8.0);
        assert_eq!(stats.child_weight_share(0), 0.0);
    }

    #[test]
    fn effective_sample_size() {
        let stats = NodeStats {
            visits: 4,
            weight_sum: 4.0,
            weight_sq_sum: 4.0,
            ..Default::default()
        };
        assert_eq!(stats.effective_sample_size(), 4.0);
    }
}
