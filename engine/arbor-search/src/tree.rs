//! Node storage: chunked arena, transposition table, and tree operations.
//!
//! Nodes live in a chunked slab and are addressed by `NodeId` indices, never
//! by pointers. Chunks are allocated lazily and never move, so `get` is
//! lock-free. Under graph search a sharded hash table maps situation keys to
//! canonical node ids so transposed paths share one node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};

use arbor_core::{Hash128, Loc, Player};
use tracing::debug;

use crate::node::{NodeId, SearchNode};

const CHUNK_SHIFT: usize = 12;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
const CHUNK_MASK: u32 = (CHUNK_SIZE - 1) as u32;
const MAX_CHUNKS: usize = 1 << 15;

const NUM_INSERT_STRIPES: usize = 256;

type Chunk = Box<[OnceLock<SearchNode>]>;

/// Chunked append-only node slab. Allocation is a fetch-add plus a one-time
/// chunk initialization; reads are lock-free.
pub struct NodeArena {
    chunks: Box<[OnceLock<Chunk>]>,
    next: AtomicU32,
}

impl NodeArena {
    pub fn new() -> NodeArena {
        let chunks = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect::<Vec<_>>();
        NodeArena {
            chunks: chunks.into_boxed_slice(),
            next: AtomicU32::new(0),
        }
    }

    /// Allocate a slot for `node`. Returns `None` if the arena is full.
    pub fn alloc(&self, node: SearchNode) -> Option<NodeId> {
        let idx = self.next.fetch_add(1, Ordering::AcqRel);
        let chunk_idx = (idx >> CHUNK_SHIFT) as usize;
        if chunk_idx >= MAX_CHUNKS {
            return None;
        }
        let chunk = self.chunks[chunk_idx].get_or_init(|| {
            (0..CHUNK_SIZE).map(|_| OnceLock::new()).collect::<Vec<_>>().into_boxed_slice()
        });
        let cell = &chunk[(idx & CHUNK_MASK) as usize];
        if cell.set(node).is_err() {
            // Indices are unique, so a slot is only ever written once.
            unreachable!("arena slot {} written twice", idx);
        }
        Some(NodeId(idx))
    }

    /// Number of allocated nodes.
    pub fn len(&self) -> usize {
        (self.next.load(Ordering::Acquire) as usize).min(MAX_CHUNKS * CHUNK_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &SearchNode {
        debug_assert!(!id.is_none());
        let chunk = self.chunks[(id.0 >> CHUNK_SHIFT) as usize]
            .get()
            .expect("node chunk not allocated");
        chunk[(id.0 & CHUNK_MASK) as usize].get().expect("node slot not initialized")
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Key identifying a position for transposition sharing: situation hash,
/// player to move, and any path-dependent context the rules fold in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub situation: Hash128,
    pub context: Hash128,
    pub pla: Player,
}

impl NodeKey {
    #[inline]
    fn shard_of(&self, num_shards: usize) -> usize {
        (self.situation.lo ^ self.context.lo.rotate_left(17)) as usize & (num_shards - 1)
    }
}

/// Sharded transposition table. Lookups take a shard read lock; inserts take
/// the write lock. Insertion races resolve to a single canonical id.
pub struct NodeTable {
    shards: Vec<RwLock<HashMap<NodeKey, NodeId>>>,
}

impl NodeTable {
    pub fn new(shards_power_of_two: u32) -> NodeTable {
        let num_shards = 1usize << shards_power_of_two;
        NodeTable {
            shards: (0..num_shards).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        let shard = &self.shards[key.shard_of(self.shards.len())];
        shard.read().expect("node table shard poisoned").get(key).copied()
    }

    /// Look up `key`, inserting via `alloc` on a miss. Returns the canonical
    /// id and whether this call created it.
    pub fn find_or_insert_with(
        &self,
        key: NodeKey,
        alloc: impl FnOnce() -> Option<NodeId>,
    ) -> Option<(NodeId, bool)> {
        if let Some(id) = self.find(&key) {
            return Some((id, false));
        }
        let shard = &self.shards[key.shard_of(self.shards.len())];
        let mut map = shard.write().expect("node table shard poisoned");
        if let Some(&id) = map.get(&key) {
            return Some((id, false));
        }
        let id = alloc()?;
        map.insert(key, id);
        Some((id, true))
    }

    pub fn insert(&self, key: NodeKey, id: NodeId) {
        let shard = &self.shards[key.shard_of(self.shards.len())];
        shard.write().expect("node table shard poisoned").insert(key, id);
    }

    /// Visit every entry. Only used while no workers are active.
    pub fn for_each(&self, mut f: impl FnMut(&NodeKey, NodeId)) {
        for shard in &self.shards {
            for (k, v) in shard.read().expect("node table shard poisoned").iter() {
                f(k, *v);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().expect("node table shard poisoned").len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The node storage owned by one `Search`: arena, optional transposition
/// table, and the striped locks serializing child insertion per node.
pub struct SearchTree {
    arena: NodeArena,
    table: Option<NodeTable>,
    insert_stripes: Box<[Mutex<()>]>,
    policy_size: usize,
}

impl SearchTree {
    pub fn new(policy_size: usize, use_graph_search: bool, shards_power_of_two: u32) -> SearchTree {
        let insert_stripes =
            (0..NUM_INSERT_STRIPES).map(|_| Mutex::new(())).collect::<Vec<_>>().into_boxed_slice();
        SearchTree {
            arena: NodeArena::new(),
            table: use_graph_search.then(|| NodeTable::new(shards_power_of_two)),
            insert_stripes,
            policy_size,
        }
    }

    #[inline]
    pub fn policy_size(&self) -> usize {
        self.policy_size
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &SearchNode {
        self.arena.get(id)
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.arena.len()
    }

    pub fn graph_search(&self) -> bool {
        self.table.is_some()
    }

    /// Lock serializing child-slot insertion for `id`.
    pub fn insert_lock(&self, id: NodeId) -> MutexGuard<'_, ()> {
        let stripe = (id.0 as usize).wrapping_mul(0x9e3779b9) % NUM_INSERT_STRIPES;
        self.insert_stripes[stripe].lock().expect("insert stripe poisoned")
    }

    /// Allocate a fresh unexpanded node.
    pub fn alloc_node(&self, next_pla: Player) -> Option<NodeId> {
        self.arena.alloc(SearchNode::new(next_pla))
    }

    /// Register an already-allocated node under a transposition key. No-op
    /// without graph search.
    pub fn register_node(&self, key: NodeKey, id: NodeId) {
        if let Some(table) = &self.table {
            table.insert(key, id);
        }
    }

    /// Allocate or find the node for `key` (graph search), or always allocate
    /// (tree search). Returns the id and whether it was created.
    pub fn find_or_alloc(&self, key: Option<NodeKey>, next_pla: Player) -> Option<(NodeId, bool)> {
        match (&self.table, key) {
            (Some(table), Some(key)) => {
                table.find_or_insert_with(key, || self.arena.alloc(SearchNode::new(next_pla)))
            }
            _ => self.alloc_node(next_pla).map(|id| (id, true)),
        }
    }

    /// Install a new child edge on `parent` for `loc`, pointing at a node for
    /// `key`/`next_pla`. If another thread installed `loc` first, returns its
    /// edge instead. Returns (logical child index, child id, created).
    pub fn allocate_child(
        &self,
        parent: NodeId,
        loc: Loc,
        key: Option<NodeKey>,
        next_pla: Player,
    ) -> Option<(usize, NodeId, bool)> {
        let node = self.node(parent);
        let _guard = self.insert_lock(parent);
        // Re-scan under the lock: a racing thread may have added this move.
        let mut idx = 0;
        while let Some(slot) = node.child_slot(idx, self.policy_size) {
            match slot.move_loc() {
                Some(l) if l == loc => return Some((idx, slot.child(), false)),
                Some(_) => idx += 1,
                None => break,
            }
        }
        let (child_id, created) = self.find_or_alloc(key, next_pla)?;
        let slot = node.child_slot_or_grow(idx, self.policy_size);
        slot.publish(loc, child_id);
        Some((idx, child_id, created))
    }

    /// Copy the subtree (or sub-DAG) under `old_root` into a fresh tree.
    /// Siblings of the new root and everything else unreachable are dropped
    /// with the old storage. Must only run while no workers are active.
    pub fn reroot_from(&self, old_root: NodeId) -> (SearchTree, NodeId) {
        let new_tree = SearchTree::new(
            self.policy_size,
            self.table.is_some(),
            self.table.as_ref().map(|t| t.shards.len().trailing_zeros()).unwrap_or(0),
        );
        let mut memo: HashMap<u32, u32> = HashMap::new();
        let mut stack = vec![old_root];

        // Pass 1: copy every reachable node without children.
        while let Some(old_id) = stack.pop() {
            if memo.contains_key(&old_id.0) {
                continue;
            }
            let old = self.node(old_id);
            let copy = SearchNode::new(old.next_pla);
            if let Some(out) = old.nn_output() {
                let _ = copy.set_nn_output(out.clone());
            }
            let stats = old.stats.snapshot();
            {
                let _g = copy.lock_stats();
                copy.stats.visits.store(stats.visits, Ordering::Release);
                copy.stats.weight_sum.store(stats.weight_sum, Ordering::Release);
                copy.stats.weight_sq_sum.store(stats.weight_sq_sum, Ordering::Release);
                copy.stats.win_loss_avg.store(stats.win_loss_avg, Ordering::Release);
                copy.stats.no_result_avg.store(stats.no_result_avg, Ordering::Release);
                copy.stats.utility_avg.store(stats.utility_avg, Ordering::Release);
                copy.stats.utility_sq_avg.store(stats.utility_sq_avg, Ordering::Release);
            }
            let new_id = new_tree.arena.alloc(copy).expect("fresh arena cannot be full");
            memo.insert(old_id.0, new_id.0);
            for (_, slot) in old.children(self.policy_size) {
                let child = slot.child();
                if !child.is_none() {
                    stack.push(child);
                }
            }
        }

        // Pass 2: re-link children in their original slot order.
        for (&old_raw, &new_raw) in memo.iter() {
            let old = self.node(NodeId(old_raw));
            let new = new_tree.node(NodeId(new_raw));
            for (i, (loc, slot)) in old.children(self.policy_size).enumerate() {
                let old_child = slot.child();
                let new_child = NodeId(memo[&old_child.0]);
                let new_slot = new.child_slot_or_grow(i, self.policy_size);
                new_slot.publish(loc, new_child);
                new_slot.add_edge_visits(slot.edge_visits());
            }
        }

        // Pass 3: carry surviving transposition entries over.
        if let (Some(old_table), Some(new_table)) = (&self.table, &new_tree.table) {
            old_table.for_each(|key, old_id| {
                if let Some(&new_raw) = memo.get(&old_id.0) {
                    new_table.insert(*key, NodeId(new_raw));
                }
            });
        }

        let new_root = NodeId(memo[&old_root.0]);
        debug!(
            kept_nodes = memo.len(),
            dropped_nodes = self.num_nodes() - memo.len(),
            "rerooted search tree"
        );
        (new_tree, new_root)
    }
}
