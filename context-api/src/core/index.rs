//! Exact cosine-similarity vector index.
//!
//! Vectors are L2-normalized on insert, so similarity is a dot product.
//! Entries live in one of two tiers:
//! - **Hot**: ACTIVE and STALE items, scanned by every query
//! - **Cold**: ARCHIVED items, scanned only on explicit request
//!
//! Below the size ceiling a query walks both tiers and lets the caller's
//! predicate reject ineligible entries. Above it, the fast path skips the cold
//! tier entirely unless archived items were requested.
//!
//! The index is a derived projection of the context table and can always be
//! rebuilt from it; snapshots carry a SHA-256 checksum so a damaged file is
//! detected and rebuilt rather than trusted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use tracing::debug;

use super::error::IndexError;
use crate::models::context::{ContextId, ContextState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexTier {
    Hot,
    Cold,
}

impl IndexTier {
    /// Tier an item in `state` belongs to; PURGED items are not indexed.
    pub fn for_state(state: ContextState) -> Option<IndexTier> {
        match state {
            ContextState::Active | ContextState::Stale => Some(IndexTier::Hot),
            ContextState::Archived => Some(IndexTier::Cold),
            ContextState::Purged => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub id: ContextId,
    pub similarity: f32,
}

/// Heap entry; "greater" means better ranked.
#[derive(Debug, Clone, Copy)]
struct Ranked(IndexHit);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .similarity
            .total_cmp(&other.0.similarity)
            // lower id wins ties
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

pub struct VectorIndex {
    dimension: usize,
    ceiling: usize,
    hot: BTreeMap<ContextId, Vec<f32>>,
    cold: BTreeMap<ContextId, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimension: usize, ceiling: usize) -> Self {
        Self {
            dimension,
            ceiling,
            hot: BTreeMap::new(),
            cold: BTreeMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn cold_len(&self) -> usize {
        self.cold.len()
    }

    pub fn is_over_ceiling(&self) -> bool {
        self.len() > self.ceiling
    }

    pub fn tier_of(&self, id: ContextId) -> Option<IndexTier> {
        if self.hot.contains_key(&id) {
            Some(IndexTier::Hot)
        } else if self.cold.contains_key(&id) {
            Some(IndexTier::Cold)
        } else {
            None
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (ContextId, IndexTier)> + '_ {
        self.hot
            .keys()
            .map(|id| (*id, IndexTier::Hot))
            .chain(self.cold.keys().map(|id| (*id, IndexTier::Cold)))
    }

    fn normalized(&self, vector: &[f32]) -> Result<Vec<f32>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteVector);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Ok(vector.to_vec());
        }
        Ok(vector.iter().map(|v| v / norm).collect())
    }

    /// Whether `vector` would be accepted by [`VectorIndex::insert`].
    pub fn check(&self, vector: &[f32]) -> Result<(), IndexError> {
        self.normalized(vector).map(|_| ())
    }

    /// Insert or replace the vector for `id` in `tier`.
    pub fn insert(&mut self, id: ContextId, vector: &[f32], tier: IndexTier) -> Result<(), IndexError> {
        let normalized = self.normalized(vector)?;
        self.hot.remove(&id);
        self.cold.remove(&id);
        match tier {
            IndexTier::Hot => self.hot.insert(id, normalized),
            IndexTier::Cold => self.cold.insert(id, normalized),
        };
        Ok(())
    }

    pub fn remove(&mut self, id: ContextId) -> bool {
        self.hot.remove(&id).is_some() || self.cold.remove(&id).is_some()
    }

    /// Move an existing entry between tiers. Returns false when `id` is absent.
    pub fn set_tier(&mut self, id: ContextId, tier: IndexTier) -> bool {
        let (from, to) = match tier {
            IndexTier::Hot => (&mut self.cold, &mut self.hot),
            IndexTier::Cold => (&mut self.hot, &mut self.cold),
        };
        if let Some(vector) = from.remove(&id) {
            to.insert(id, vector);
            return true;
        }
        to.contains_key(&id)
    }

    /// Top-`k` entries by cosine similarity to `query`, best first, ties
    /// broken by lower id. `accept` is consulted with the id and tier of every
    /// scanned entry.
    pub fn search<F>(
        &self,
        query: &[f32],
        k: usize,
        include_cold: bool,
        mut accept: F,
    ) -> Result<Vec<IndexHit>, IndexError>
    where
        F: FnMut(ContextId, IndexTier) -> bool,
    {
        let query = self.normalized(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let fast_path = self.is_over_ceiling() && !include_cold;
        if fast_path {
            debug!(
                index_size = self.len(),
                ceiling = self.ceiling,
                "Index over ceiling, scanning hot tier only"
            );
        }

        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        let cold = if fast_path {
            None
        } else {
            Some((&self.cold, IndexTier::Cold))
        };
        let tiers = std::iter::once((&self.hot, IndexTier::Hot)).chain(cold);

        for (entries, tier) in tiers {
            for (id, vector) in entries {
                if !accept(*id, tier) {
                    continue;
                }
                let similarity = dot(&query, vector);
                heap.push(Reverse(Ranked(IndexHit {
                    id: *id,
                    similarity,
                })));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(Ranked(hit))| hit)
            .collect())
    }

    pub fn to_snapshot(&self) -> IndexSnapshot {
        let entries: Vec<SnapshotEntry> = self
            .hot
            .iter()
            .map(|(id, v)| (id, v, IndexTier::Hot))
            .chain(self.cold.iter().map(|(id, v)| (id, v, IndexTier::Cold)))
            .map(|(id, vector, tier)| SnapshotEntry {
                id: *id,
                tier,
                vector: vector.clone(),
            })
            .collect();
        let checksum = snapshot_checksum(self.dimension, &entries);

        IndexSnapshot {
            dimension: self.dimension,
            entries,
            checksum,
        }
    }

    /// Restore from a snapshot, rejecting it when the checksum or any vector
    /// does not verify.
    pub fn from_snapshot(snapshot: &IndexSnapshot, ceiling: usize) -> Result<Self, IndexError> {
        let expected = snapshot_checksum(snapshot.dimension, &snapshot.entries);
        if expected != snapshot.checksum {
            return Err(IndexError::Corrupt("checksum mismatch".to_string()));
        }

        let mut index = VectorIndex::new(snapshot.dimension, ceiling);
        for entry in &snapshot.entries {
            index
                .insert(entry.id, &entry.vector, entry.tier)
                .map_err(|e| IndexError::Corrupt(format!("entry {}: {e}", entry.id)))?;
        }
        Ok(index)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of two raw vectors; 0.0 when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// On-disk representation of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub dimension: usize,
    pub entries: Vec<SnapshotEntry>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: ContextId,
    pub tier: IndexTier,
    pub vector: Vec<f32>,
}

fn snapshot_checksum(dimension: usize, entries: &[SnapshotEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((dimension as u64).to_le_bytes());
    for entry in entries {
        hasher.update(entry.id.0.to_le_bytes());
        hasher.update([match entry.tier {
            IndexTier::Hot => 0u8,
            IndexTier::Cold => 1u8,
        }]);
        for v in &entry.vector {
            hasher.update(v.to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
