/**
 * HNSW Index - Hierarchical Navigable Small World Graph
 *
 * DESIGN DECISION: Arena of nodes with per-layer adjacency lists of string keys
 * WHY: Sub-linear top-k similarity search over the embedding collection; the
 *      graph holds ids, never back-references implying ownership
 *
 * REASONING CHAIN:
 * 1. Level assignment: floor(-ln(U) / ln(M)) with a seeded RNG so tests are
 *    deterministic (reproducibility across versions is not promised)
 * 2. Insert descends greedily to the node's level, then wires M neighbors per
 *    layer with efConstruction beam searches; back-links respect the 2M cap
 *    with neighbor-side farthest replacement (strictly-closer only)
 * 3. Search: greedy descent to layer 1, beam search at layer 0 with efSearch,
 *    distance converted to similarity via 1 - d
 * 4. Remove erases the id from every adjacency list and re-elects the entry
 *    point from surviving top layers; orphan links are tolerated and healed
 *    opportunistically during capacity replacement
 * 5. Serialization is the bit-exact LBH1 little-endian layout: nodes sorted
 *    by id, layers ascending, so equal graphs serialize identically
 *
 * Type-filtered searches skip excluded nodes before scoring them. That makes
 * filtered traversal strictly cheaper than unfiltered on the same query, at
 * some recall cost when excluded nodes are the only bridges between regions.
 */

use crate::error::{Error, Result};
use crate::types::SimilarityHit;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// On-disk magic for serialized graphs.
const HNSW_MAGIC: &[u8; 4] = b"LBH1";
/// Serialization format version.
const HNSW_VERSION: u32 = 1;
/// Default RNG seed for level assignment.
const DEFAULT_LEVEL_SEED: u64 = 0x4c42_4831;

/// Tuning parameters for graph construction and search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswConfig {
    /// Max connections added per layer on insert; back-link cap is 2M.
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Beam width during search.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct HnswNode {
    id: String,
    vector: Vec<f32>,
    entity_type: String,
    /// layer -> ordered neighbor ids; holds an entry for every layer up to the
    /// node's level so the level survives serialization.
    connections: BTreeMap<i32, Vec<String>>,
}

impl HnswNode {
    fn top_layer(&self) -> i32 {
        self.connections.keys().max().copied().unwrap_or(0)
    }
}

/// Heap entry ordered by distance, id as tiebreaker for determinism.
#[derive(Debug, Clone, PartialEq)]
struct DistEntry {
    dist: f32,
    id: String,
}

impl Eq for DistEntry {}

impl Ord for DistEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for DistEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Hierarchical navigable small-world graph over string-keyed vectors.
#[derive(Debug)]
pub struct HnswIndex {
    config: HnswConfig,
    nodes: HashMap<String, HnswNode>,
    entry_point: Option<String>,
    max_layer: i32,
    dims: HashSet<usize>,
    rng: StdRng,
    distance_count: Cell<u64>,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        Self::with_seed(config, DEFAULT_LEVEL_SEED)
    }

    pub fn with_seed(config: HnswConfig, seed: u64) -> Self {
        Self {
            config,
            nodes: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            dims: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
            distance_count: Cell::new(0),
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Vector dimensions currently present in the graph.
    pub fn dimensions(&self) -> &HashSet<usize> {
        &self.dims
    }

    /// Distance computations performed since the last reset. Search-cost
    /// accounting for degradation reporting and tests.
    pub fn distance_computations(&self) -> u64 {
        self.distance_count.get()
    }

    pub fn reset_distance_counter(&self) {
        self.distance_count.set(0);
    }

    /// Cosine distance (1 - similarity). Zero-norm vectors score as maximally
    /// distant rather than poisoning results with NaN.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.distance_count.set(self.distance_count.get() + 1);
        1.0 - cosine_similarity(a, b)
    }

    /// Top layer for a fresh node: floor(-ln(U) / ln(M)).
    fn random_level(&mut self) -> i32 {
        let u: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let m = (self.config.m.max(2)) as f64;
        ((-u.ln()) / m.ln()).floor() as i32
    }

    /// Insert a vector. An existing id is removed first so its neighborhood is
    /// rebuilt against the new vector.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>, entity_type: &str) {
        if self.nodes.contains_key(id) {
            self.remove(id);
        }

        let level = self.random_level();
        self.dims.insert(vector.len());

        let mut connections: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for layer in 0..=level {
            connections.insert(layer, Vec::new());
        }

        let entry = match self.entry_point.clone() {
            None => {
                self.nodes.insert(
                    id.to_string(),
                    HnswNode {
                        id: id.to_string(),
                        vector,
                        entity_type: entity_type.to_string(),
                        connections,
                    },
                );
                self.entry_point = Some(id.to_string());
                self.max_layer = level;
                return;
            }
            Some(e) => e,
        };

        // Greedy descent to one layer above the node's level.
        let mut ep = entry;
        let mut layer = self.max_layer;
        while layer > level {
            if let Some((closest, _)) = self.search_layer(&vector, &ep, 1, layer, None).first() {
                ep = closest.clone();
            }
            layer -= 1;
        }

        // Wire neighbors from min(level, maxLayer) down to 0.
        let top = level.min(self.max_layer);
        for layer in (0..=top).rev() {
            let candidates =
                self.search_layer(&vector, &ep, self.config.ef_construction, layer, None);
            let neighbors: Vec<String> = candidates
                .iter()
                .take(self.config.m)
                .map(|(nid, _)| nid.clone())
                .collect();

            for neighbor in &neighbors {
                self.link_back(neighbor, id, &vector, layer);
            }
            connections.insert(layer, neighbors);

            if let Some((closest, _)) = candidates.first() {
                ep = closest.clone();
            }
        }

        self.nodes.insert(
            id.to_string(),
            HnswNode {
                id: id.to_string(),
                vector,
                entity_type: entity_type.to_string(),
                connections,
            },
        );

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id.to_string());
        }
    }

    /// Add the back-link new_id into neighbor's list at `layer`, honoring the
    /// 2M cap: a full list replaces its farthest link iff the new one is
    /// strictly closer.
    fn link_back(&mut self, neighbor_id: &str, new_id: &str, new_vector: &[f32], layer: i32) {
        let cap = self.config.m * 2;
        let neighbor_vec = match self.nodes.get(neighbor_id) {
            Some(n) => n.vector.clone(),
            None => return,
        };
        let snapshot: Vec<String> = self
            .nodes
            .get(neighbor_id)
            .and_then(|n| n.connections.get(&layer).cloned())
            .unwrap_or_default();

        if snapshot.len() < cap {
            if let Some(node) = self.nodes.get_mut(neighbor_id) {
                node.connections
                    .entry(layer)
                    .or_default()
                    .push(new_id.to_string());
            }
            return;
        }

        // Farthest existing link; orphaned ids (already removed) lose first.
        let new_dist = self.distance(&neighbor_vec, new_vector);
        let mut farthest_idx = 0usize;
        let mut farthest_dist = f32::NEG_INFINITY;
        for (i, other) in snapshot.iter().enumerate() {
            match self.nodes.get(other) {
                Some(node) => {
                    let d = self.distance(&neighbor_vec, &node.vector);
                    if d > farthest_dist {
                        farthest_dist = d;
                        farthest_idx = i;
                    }
                }
                None => {
                    farthest_dist = f32::INFINITY;
                    farthest_idx = i;
                    break;
                }
            }
        }

        if new_dist < farthest_dist {
            if let Some(node) = self.nodes.get_mut(neighbor_id) {
                if let Some(list) = node.connections.get_mut(&layer) {
                    if farthest_idx < list.len() {
                        list[farthest_idx] = new_id.to_string();
                    }
                }
            }
        }
    }

    /// Beam search within one layer. Returns (id, distance) ascending.
    ///
    /// With an allow-set, excluded nodes are skipped before scoring; the entry
    /// seed is always scored so navigation has a starting distance.
    fn search_layer(
        &self,
        query: &[f32],
        entry_id: &str,
        ef: usize,
        layer: i32,
        allowed: Option<&HashSet<String>>,
    ) -> Vec<(String, f32)> {
        let entry_node = match self.nodes.get(entry_id) {
            Some(n) => n,
            None => return Vec::new(),
        };
        let ef = ef.max(1);
        let entry_dist = self.distance(query, &entry_node.vector);

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(entry_id.to_string());

        let mut candidates: BinaryHeap<Reverse<DistEntry>> = BinaryHeap::new();
        candidates.push(Reverse(DistEntry {
            dist: entry_dist,
            id: entry_id.to_string(),
        }));

        let mut results: BinaryHeap<DistEntry> = BinaryHeap::new();
        let entry_allowed = allowed
            .map(|set| set.contains(&entry_node.entity_type))
            .unwrap_or(true);
        if entry_allowed {
            results.push(DistEntry {
                dist: entry_dist,
                id: entry_id.to_string(),
            });
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.dist > worst.dist {
                        break;
                    }
                }
            }

            let node = match self.nodes.get(&current.id) {
                Some(n) => n,
                None => continue,
            };
            let conns = match node.connections.get(&layer) {
                Some(c) => c,
                None => continue,
            };

            for neighbor_id in conns {
                if !visited.insert(neighbor_id.clone()) {
                    continue;
                }
                let neighbor = match self.nodes.get(neighbor_id) {
                    Some(n) => n,
                    None => continue,
                };
                if let Some(set) = allowed {
                    if !set.contains(&neighbor.entity_type) {
                        continue;
                    }
                }
                let d = self.distance(query, &neighbor.vector);
                let admissible = results.len() < ef
                    || results.peek().map(|w| d < w.dist).unwrap_or(true);
                if admissible {
                    candidates.push(Reverse(DistEntry {
                        dist: d,
                        id: neighbor_id.clone(),
                    }));
                    results.push(DistEntry {
                        dist: d,
                        id: neighbor_id.clone(),
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(String, f32)> = results
            .into_iter()
            .map(|e| (e.id, e.dist))
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Top-k similarity search.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        allowed_types: Option<&HashSet<String>>,
        min_similarity: f32,
    ) -> Vec<SimilarityHit> {
        let mut ep = match self.entry_point.clone() {
            Some(e) => e,
            None => return Vec::new(),
        };

        // Greedy descent to layer 1.
        for layer in (1..=self.max_layer).rev() {
            if let Some((closest, _)) = self.search_layer(query, &ep, 1, layer, None).first() {
                ep = closest.clone();
            }
        }

        let beam = ef.unwrap_or(self.config.ef_search).max(k);
        let found = self.search_layer(query, &ep, beam, 0, allowed_types);

        let mut hits: Vec<SimilarityHit> = found
            .into_iter()
            .filter_map(|(id, dist)| {
                let node = self.nodes.get(&id)?;
                let similarity = 1.0 - dist;
                if similarity < min_similarity {
                    return None;
                }
                Some(SimilarityHit {
                    entity_id: node.id.clone(),
                    entity_type: node.entity_type.clone(),
                    similarity,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        hits.truncate(k);
        hits
    }

    /// Remove a node and every link to it. Entry point re-election picks the
    /// surviving node with the highest connection-bearing layer.
    pub fn remove(&mut self, id: &str) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        for node in self.nodes.values_mut() {
            for list in node.connections.values_mut() {
                list.retain(|linked| linked != id);
            }
        }

        if self.entry_point.as_deref() == Some(id) {
            let mut best: Option<(String, i32)> = None;
            for (node_id, node) in &self.nodes {
                let top = node.top_layer();
                let better = match &best {
                    None => true,
                    Some((_, best_top)) => top > *best_top,
                };
                if better {
                    best = Some((node_id.clone(), top));
                }
            }
            match best {
                Some((node_id, top)) => {
                    self.entry_point = Some(node_id);
                    self.max_layer = top;
                }
                None => {
                    self.entry_point = None;
                    self.max_layer = 0;
                }
            }
        }

        self.dims = self.nodes.values().map(|n| n.vector.len()).collect();
        true
    }

    /**
     * LBH1 binary serialization.
     *
     * Layout (little-endian):
     *   "LBH1" | u32 version | u32 M | u32 efC | u32 efS | i32 maxLayer
     *   | u32 entryLen | entry bytes | u32 nodeCount
     *   then per node (sorted by id): id, entityType, u32 dim + f32[dim],
     *   u32 layerCount, per layer ascending: i32 layer, u32 connCount, conns.
     */
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(HNSW_MAGIC);
        push_u32(&mut buf, HNSW_VERSION);
        push_u32(&mut buf, self.config.m as u32);
        push_u32(&mut buf, self.config.ef_construction as u32);
        push_u32(&mut buf, self.config.ef_search as u32);
        buf.extend_from_slice(&self.max_layer.to_le_bytes());

        push_str(&mut buf, self.entry_point.as_deref().unwrap_or(""));

        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();
        push_u32(&mut buf, ids.len() as u32);

        for id in ids {
            let node = &self.nodes[id];
            push_str(&mut buf, &node.id);
            push_str(&mut buf, &node.entity_type);
            push_u32(&mut buf, node.vector.len() as u32);
            for value in &node.vector {
                buf.extend_from_slice(&value.to_le_bytes());
            }
            push_u32(&mut buf, node.connections.len() as u32);
            for (layer, conns) in &node.connections {
                buf.extend_from_slice(&layer.to_le_bytes());
                push_u32(&mut buf, conns.len() as u32);
                for conn in conns {
                    push_str(&mut buf, conn);
                }
            }
        }
        buf
    }

    /// Rebuild an index from an LBH1 payload. Magic/version mismatch and
    /// truncation fail with `invalid_hnsw_payload`; callers fall back to a
    /// rebuild from the embedding store.
    pub fn deserialize(payload: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(payload);

        let magic = reader.take(4)?;
        if magic != HNSW_MAGIC {
            return Err(Error::InvalidHnswPayload {
                message: "magic mismatch".to_string(),
            });
        }
        let version = reader.read_u32()?;
        if version != HNSW_VERSION {
            return Err(Error::InvalidHnswPayload {
                message: format!("unsupported version {}", version),
            });
        }

        let config = HnswConfig {
            m: reader.read_u32()? as usize,
            ef_construction: reader.read_u32()? as usize,
            ef_search: reader.read_u32()? as usize,
        };
        let max_layer = reader.read_i32()?;
        let entry = reader.read_string()?;
        let node_count = reader.read_u32()? as usize;

        let mut nodes: HashMap<String, HnswNode> = HashMap::with_capacity(node_count);
        let mut dims: HashSet<usize> = HashSet::new();

        for _ in 0..node_count {
            let id = reader.read_string()?;
            let entity_type = reader.read_string()?;
            let dim = reader.read_u32()? as usize;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(reader.read_f32()?);
            }
            dims.insert(dim);

            let layer_count = reader.read_u32()? as usize;
            let mut connections = BTreeMap::new();
            for _ in 0..layer_count {
                let layer = reader.read_i32()?;
                let conn_count = reader.read_u32()? as usize;
                let mut conns = Vec::with_capacity(conn_count);
                for _ in 0..conn_count {
                    conns.push(reader.read_string()?);
                }
                connections.insert(layer, conns);
            }

            nodes.insert(
                id.clone(),
                HnswNode {
                    id,
                    entity_type,
                    vector,
                    connections,
                },
            );
        }

        let entry_point = if entry.is_empty() {
            None
        } else if nodes.contains_key(&entry) {
            Some(entry)
        } else {
            return Err(Error::InvalidHnswPayload {
                message: "out_of_bounds".to_string(),
            });
        };

        Ok(Self {
            config,
            nodes,
            entry_point,
            max_layer,
            dims,
            rng: StdRng::seed_from_u64(DEFAULT_LEVEL_SEED),
            distance_count: Cell::new(0),
        })
    }
}

/// Cosine similarity; zero-norm operands score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_str(buf: &mut Vec<u8>, value: &str) {
    push_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// Bounds-checked little-endian reader over a serialized payload.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidHnswPayload {
                message: "out_of_bounds".to_string(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidHnswPayload {
            message: "out_of_bounds".to_string(),
        })
    }
}
