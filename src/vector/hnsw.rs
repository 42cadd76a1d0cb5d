// Hierarchical Navigable Small World graph index.
//
// Nodes live in an arena keyed by slot; neighbor lists hold slots, never
// references, so deletion is a sweep over plain integers. Levels are sampled
// with factor ml = 1/ln(M); links are bidirectional with heuristic neighbor
// selection and pruning at M per upper layer, 2M at layer 0.

use crate::common::RowId;
use crate::vector::{
    check_dimension, distance_fn, DistanceFn, VectorIndex, VectorIndexConfig, VectorIndexStats,
    VectorSearchResult,
};
use crate::Result;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

const DEFAULT_M: usize = 16;
const DEFAULT_EF_CONSTRUCTION: usize = 200;
const DEFAULT_EF_SEARCH: usize = 64;
const MAX_LEVEL: usize = 32;

/// f32 distance with a total order, for the search heaps.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Dist(f32);

impl Eq for Dist {}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct HnswNode {
    id: RowId,
    vector: Vec<f32>,
    level: usize,
    /// Neighbor slots per layer, layers 0..=level.
    neighbors: Vec<Vec<u32>>,
}

#[derive(Default)]
struct HnswState {
    nodes: Vec<Option<HnswNode>>,
    slot_of: HashMap<RowId, u32>,
    free_slots: Vec<u32>,
    entry_point: Option<u32>,
}

impl HnswState {
    fn node(&self, slot: u32) -> Option<&HnswNode> {
        self.nodes.get(slot as usize).and_then(Option::as_ref)
    }
}

pub struct HnswIndex {
    config: VectorIndexConfig,
    dist: DistanceFn,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    /// Level sampling factor, 1/ln(M).
    ml: f64,
    state: RwLock<HnswState>,
    rng: parking_lot::Mutex<StdRng>,
}

impl HnswIndex {
    pub fn new(config: VectorIndexConfig) -> Result<Self> {
        let dist = distance_fn(&config.metric)?;
        let m = (config.param("m", DEFAULT_M as f64) as usize).max(2);
        let ef_construction =
            (config.param("ef_construction", DEFAULT_EF_CONSTRUCTION as f64) as usize).max(m);
        let ef_search = (config.param("ef_search", DEFAULT_EF_SEARCH as f64) as usize).max(1);
        Ok(Self {
            dist,
            m,
            m0: m * 2,
            ef_construction,
            ef_search,
            ml: 1.0 / (m as f64).ln(),
            state: RwLock::new(HnswState::default()),
            rng: parking_lot::Mutex::new(StdRng::from_entropy()),
            config,
        })
    }

    fn sample_level(&self) -> usize {
        let mut rng = self.rng.lock();
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        ((-u.ln() * self.ml) as usize).min(MAX_LEVEL)
    }

    fn cap_for_layer(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Beam search over one layer. Returns up to `ef` nearest slots,
    /// ascending by distance.
    fn search_layer(
        &self,
        state: &HnswState,
        query: &[f32],
        entry_points: &[(f32, u32)],
        ef: usize,
        layer: usize,
    ) -> Vec<(f32, u32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<(Dist, u32)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(Dist, u32)> = BinaryHeap::new();

        for &(d, slot) in entry_points {
            if visited.insert(slot) {
                candidates.push(Reverse((Dist(d), slot)));
                results.push((Dist(d), slot));
            }
        }

        while let Some(Reverse((Dist(d), slot))) = candidates.pop() {
            if results.len() >= ef {
                if let Some(&(Dist(worst), _)) = results.peek() {
                    if d > worst {
                        break;
                    }
                }
            }
            let Some(node) = state.node(slot) else { continue };
            let Some(neighbors) = node.neighbors.get(layer) else {
                continue;
            };
            for &nb in neighbors {
                if !visited.insert(nb) {
                    continue;
                }
                let Some(nb_node) = state.node(nb) else { continue };
                let d_nb = (self.dist)(query, &nb_node.vector);
                let worst = results.peek().map(|&(Dist(w), _)| w);
                if results.len() < ef || worst.map(|w| d_nb < w).unwrap_or(true) {
                    candidates.push(Reverse((Dist(d_nb), nb)));
                    results.push((Dist(d_nb), nb));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(f32, u32)> = results
            .into_iter()
            .map(|(Dist(d), slot)| (d, slot))
            .collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    /// Heuristic selection: walk candidates by ascending distance to the
    /// query point; keep one only if it is closer to the query than to every
    /// neighbor already kept. Remaining capacity is backfilled with the
    /// nearest rejected candidates so clustered data stays connected.
    fn select_neighbors(
        &self,
        state: &HnswState,
        candidates: &[(f32, u32)],
        m: usize,
    ) -> Vec<u32> {
        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
        let mut rejected: Vec<(f32, u32)> = Vec::new();

        for &(d_c, c) in candidates {
            if selected.len() >= m {
                break;
            }
            let Some(c_node) = state.node(c) else { continue };
            let closer_to_query = selected.iter().all(|&(_, s)| {
                state
                    .node(s)
                    .map(|s_node| (self.dist)(&c_node.vector, &s_node.vector) > d_c)
                    .unwrap_or(true)
            });
            if closer_to_query {
                selected.push((d_c, c));
            } else {
                rejected.push((d_c, c));
            }
        }

        for &entry in &rejected {
            if selected.len() >= m {
                break;
            }
            selected.push(entry);
        }

        selected.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Re-select a node's neighbor list after it grew past the layer cap.
    fn prune_neighbors(&self, state: &mut HnswState, slot: u32, layer: usize) {
        let cap = self.cap_for_layer(layer);
        let (vector, list) = {
            let Some(node) = state.node(slot) else { return };
            let Some(list) = node.neighbors.get(layer) else {
                return;
            };
            if list.len() <= cap {
                return;
            }
            (node.vector.clone(), list.clone())
        };

        let mut scored: Vec<(f32, u32)> = list
            .iter()
            .filter_map(|&nb| {
                state
                    .node(nb)
                    .map(|n| ((self.dist)(&vector, &n.vector), nb))
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        let kept = self.select_neighbors(state, &scored, cap);

        if let Some(node) = state.nodes[slot as usize].as_mut() {
            node.neighbors[layer] = kept;
        }
    }

    fn remove_slot(&self, state: &mut HnswState, slot: u32) {
        let Some(node) = state.nodes[slot as usize].take() else {
            return;
        };
        state.slot_of.remove(&node.id);

        // Pruning makes edges asymmetric, so sweep every neighbor list
        // rather than only the removed node's own lists.
        for other in state.nodes.iter_mut().flatten() {
            for list in &mut other.neighbors {
                list.retain(|&s| s != slot);
            }
        }
        state.free_slots.push(slot);

        if state.entry_point == Some(slot) {
            state.entry_point = state
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (n.level, i as u32)))
                .max()
                .map(|(_, i)| i);
        }
    }

    /// Greedy single-path descent used above the insertion/search level.
    fn descend(
        &self,
        state: &HnswState,
        query: &[f32],
        mut ep: (f32, u32),
        from_layer: usize,
        to_layer: usize,
    ) -> (f32, u32) {
        let mut layer = from_layer;
        while layer > to_layer {
            let found = self.search_layer(state, query, &[ep], 1, layer);
            if let Some(&closest) = found.first() {
                ep = closest;
            }
            layer -= 1;
        }
        ep
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&self, id: RowId, vector: &[f32]) -> Result<()> {
        check_dimension(self.config.dimension, vector)?;
        let level = self.sample_level();
        let mut state = self.state.write();

        let existing = state.slot_of.get(&id).copied();
        if let Some(slot) = existing {
            self.remove_slot(&mut state, slot);
        }

        let node = HnswNode {
            id,
            vector: vector.to_vec(),
            level,
            neighbors: vec![Vec::new(); level + 1],
        };
        let slot = match state.free_slots.pop() {
            Some(slot) => {
                state.nodes[slot as usize] = Some(node);
                slot
            }
            None => {
                state.nodes.push(Some(node));
                (state.nodes.len() - 1) as u32
            }
        };
        state.slot_of.insert(id, slot);

        let Some(entry) = state.entry_point else {
            state.entry_point = Some(slot);
            return Ok(());
        };
        let entry_info = state
            .node(entry)
            .map(|n| (n.level, (self.dist)(vector, &n.vector)));
        let Some((top, entry_dist)) = entry_info else {
            state.entry_point = Some(slot);
            return Ok(());
        };
        let mut ep = (entry_dist, entry);

        if top > level {
            // Greedy descent through layers above the node's level.
            ep = self.descend(&state, vector, ep, top, level);
        }

        let mut entry_points = vec![ep];
        for layer in (0..=level.min(top)).rev() {
            let candidates =
                self.search_layer(&state, vector, &entry_points, self.ef_construction, layer);
            let selected = self.select_neighbors(&state, &candidates, self.cap_for_layer(layer));

            if let Some(node) = state.nodes[slot as usize].as_mut() {
                node.neighbors[layer] = selected.clone();
            }
            for &nb in &selected {
                if let Some(nb_node) = state.nodes[nb as usize].as_mut() {
                    if layer < nb_node.neighbors.len() {
                        nb_node.neighbors[layer].push(slot);
                    }
                }
                self.prune_neighbors(&mut state, nb, layer);
            }
            entry_points = candidates;
        }

        if level > top {
            state.entry_point = Some(slot);
        }
        Ok(())
    }

    fn delete(&self, id: RowId) -> Result<()> {
        let mut state = self.state.write();
        let existing = state.slot_of.get(&id).copied();
        if let Some(slot) = existing {
            self.remove_slot(&mut state, slot);
        }
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<RowId>>,
    ) -> Result<VectorSearchResult> {
        check_dimension(self.config.dimension, query)?;
        let state = self.state.read();

        let Some(entry) = state.entry_point else {
            return Ok(VectorSearchResult::default());
        };
        let Some(entry_node) = state.node(entry) else {
            return Ok(VectorSearchResult::default());
        };

        let ep = ((self.dist)(query, &entry_node.vector), entry);
        let ep = self.descend(&state, query, ep, entry_node.level, 0);

        let ef = self.ef_search.max(k);
        let found = self.search_layer(&state, query, &[ep], ef, 0);

        let mut result = VectorSearchResult::default();
        for (d, slot) in found {
            if result.ids.len() >= k {
                break;
            }
            let Some(node) = state.node(slot) else { continue };
            // The filter narrows results, not traversal: the graph stays
            // navigable through filtered-out nodes.
            if filter.map(|f| f.contains(&node.id)).unwrap_or(true) {
                result.ids.push(node.id);
                result.distances.push(d);
            }
        }
        Ok(result)
    }

    fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    fn stats(&self) -> VectorIndexStats {
        let state = self.state.read();
        VectorIndexStats {
            vector_count: state.slot_of.len(),
            dimension: self.config.dimension,
            metric: self.config.metric.clone(),
            max_level: state
                .entry_point
                .and_then(|slot| state.node(slot))
                .map(|n| n.level)
                .unwrap_or(0),
        }
    }

    fn reset(&self) -> Result<()> {
        *self.state.write() = HnswState::default();
        Ok(())
    }
}
