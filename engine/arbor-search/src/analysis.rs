//! Read-only analysis snapshots of a (possibly running) search.
//!
//! All values are from White's perspective. Snapshots read the tree's atomics
//! directly and tolerate being slightly stale relative to in-flight playouts.

use arbor_core::{Loc, Rules};

use crate::search::Search;

/// Summary of the root position.
#[derive(Debug, Clone)]
pub struct RootInfo {
    pub win_prob: f64,
    pub loss_prob: f64,
    pub no_result_prob: f64,
    pub utility: f64,
    pub weight_sum: f64,
    pub visits: i64,
}

/// Per-root-child analysis record.
#[derive(Debug, Clone)]
pub struct MoveAnalysis {
    pub loc: Loc,
    /// Visits on the root edge for this move.
    pub num_visits: i64,
    pub win_loss_value: f64,
    pub no_result_value: f64,
    /// Raw policy prior of the move.
    pub policy_prior: f64,
    pub utility: f64,
    pub utility_lcb: f64,
    pub weight_sum: f64,
    /// Rank by visits, 0 = most visited.
    pub order: usize,
    /// Principal variation: moves with their edge visit counts.
    pub pv: Vec<(Loc, i64)>,
    /// Set when this move was symmetry-pruned in favor of another.
    pub is_symmetry_of: Option<Loc>,
}

/// A full analysis snapshot.
#[derive(Debug, Clone)]
pub struct AnalysisData {
    pub root: RootInfo,
    /// Children sorted by visits, most visited first.
    pub moves: Vec<MoveAnalysis>,
    /// Principal variation from the root.
    pub pv: Vec<(Loc, i64)>,
}

impl<R: Rules> Search<R> {
    /// Snapshot the current search state. Returns `None` before the root has
    /// been evaluated.
    pub fn get_analysis(&self, max_pv_len: usize) -> Option<AnalysisData> {
        let root_id = self.root?;
        let root = self.root_node()?;
        let out = root.nn_output()?;
        let stats = root.stats.snapshot();
        let p = self.params();

        let root_info = RootInfo {
            win_prob: (1.0 + stats.win_loss_avg - stats.no_result_avg) / 2.0,
            loss_prob: (1.0 - stats.win_loss_avg - stats.no_result_avg) / 2.0,
            no_result_prob: stats.no_result_avg,
            utility: stats.utility_avg,
            weight_sum: stats.weight_sum,
            visits: stats.visits,
        };

        let policy_size = self.tree.policy_size();
        let mut moves: Vec<MoveAnalysis> = Vec::new();
        for (loc, slot) in root.children(policy_size) {
            let edge_visits = slot.edge_visits();
            let child_id = slot.child();
            if child_id.is_none() {
                continue;
            }
            let cs = self.tree.node(child_id).stats.snapshot();
            if edge_visits <= 0 || cs.visits <= 0 {
                continue;
            }
            let ess = cs.effective_sample_size().max(1.0);
            let radius = p.lcb_stdevs * cs.utility_stdev() / ess.sqrt();
            let mut pv = vec![(loc, edge_visits)];
            self.extend_pv(child_id, max_pv_len.saturating_sub(1), &mut pv);
            moves.push(MoveAnalysis {
                loc,
                num_visits: edge_visits,
                win_loss_value: cs.win_loss_avg,
                no_result_value: cs.no_result_avg,
                policy_prior: out.policy[loc.index()] as f64,
                utility: cs.utility_avg,
                utility_lcb: cs.utility_avg - self.root_pla().sign() * radius,
                weight_sum: cs.weight_sum,
                order: 0,
                pv,
                is_symmetry_of: None,
            });
        }
        moves.sort_by(|a, b| {
            (b.num_visits, b.utility)
                .partial_cmp(&(a.num_visits, a.utility))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (i, m) in moves.iter_mut().enumerate() {
            m.order = i;
        }

        // Symmetry-pruned siblings report their canonical twin's statistics.
        if let Some(map) = &self.run.root_sym_map {
            let mut extra: Vec<MoveAnalysis> = Vec::new();
            for (pos, canonical) in map.iter().enumerate() {
                let Some(canonical) = canonical else { continue };
                if let Some(canon_entry) = moves.iter().find(|m| m.loc == *canonical) {
                    let mut twin = canon_entry.clone();
                    twin.loc = Loc(pos as u32);
                    twin.is_symmetry_of = Some(*canonical);
                    twin.pv = vec![(Loc(pos as u32), canon_entry.num_visits)];
                    extra.push(twin);
                }
            }
            moves.extend(extra);
        }

        let mut pv = Vec::new();
        self.extend_pv(root_id, max_pv_len, &mut pv);
        Some(AnalysisData {
            root: root_info,
            moves,
            pv,
        })
    }

    /// Follow most-visited edges from `from`, appending to `pv`.
    fn extend_pv(&self, from: crate::node::NodeId, remaining: usize, pv: &mut Vec<(Loc, i64)>) {
        let policy_size = self.tree.policy_size();
        let mut current = from;
        for _ in 0..remaining {
            let node = self.tree.node(current);
            let best = node
                .children(policy_size)
                .filter(|(_, slot)| slot.edge_visits() > 0)
                .max_by_key(|(_, slot)| slot.edge_visits());
            match best {
                Some((loc, slot)) => {
                    pv.push((loc, slot.edge_visits()));
                    let child = slot.child();
                    if child.is_none() {
                        break;
                    }
                    current = child;
                }
                None => break,
            }
        }
    }
}
