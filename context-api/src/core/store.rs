//! Context Store: the canonical table of context items.
//!
//! The store exclusively owns the records and keeps the [`VectorIndex`] as a
//! derived projection of them. Table and index sit behind one lock so a put
//! or a transition is a single logical transaction, and a reader never sees
//! an item whose state and index membership disagree.
//!
//! The access fields (`last_retrieved_at`, `retrieval_count`,
//! `usefulness_score`) live in a separate concurrent map. Retrieval updates
//! them without touching the table lock, and every read path overlays them
//! onto the returned copy.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{RwLock, RwLockWriteGuard};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::config::CorpusConfig;
use super::embedding::{EmbeddingProvider, embed_with_timeout};
use super::error::{EmbeddingError, IndexError, StoreError, StoreResult};
use super::index::{IndexSnapshot, IndexTier, VectorIndex};
use super::lifecycle;
use super::persistence::{CorpusFiles, TableSnapshot};
use crate::models::context::{
    ContextId, ContextItem, ContextState, ContextType, CorpusStats, ListFilter, NewContextItem,
    RetrievalFilters, SCHEMA_VERSION,
};

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/\-]{0,63}$").expect("tag pattern is a valid regex")
});

const MAX_SOURCE_LENGTH: usize = 64;
const USEFULNESS_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
struct AccessStats {
    last_retrieved_at: Option<DateTime<Utc>>,
    retrieval_count: u64,
    usefulness_score: f64,
}

impl AccessStats {
    fn of(item: &ContextItem) -> Self {
        Self {
            last_retrieved_at: item.last_retrieved_at,
            retrieval_count: item.retrieval_count,
            usefulness_score: item.usefulness_score,
        }
    }

    fn apply(&self, item: &mut ContextItem) {
        item.last_retrieved_at = self.last_retrieved_at;
        item.retrieval_count = self.retrieval_count;
        item.usefulness_score = self.usefulness_score;
    }
}

/// A record surfaced by [`ContextStore::search`] with its raw similarity.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item: ContextItem,
    pub similarity: f64,
}

struct SearchPass {
    candidates: Vec<Candidate>,
    divergent: BTreeSet<ContextId>,
    needs_rebuild: bool,
}

/// A validated, embedded item awaiting [`ContextStore::commit`].
#[derive(Debug, Clone)]
pub struct PreparedItem {
    new: NewContextItem,
    embedding: Vec<f32>,
}

pub(crate) struct StoreInner {
    items: BTreeMap<ContextId, ContextItem>,
    index: VectorIndex,
    /// Records that belong in the index (everything not PURGED)
    live: usize,
}

impl StoreInner {
    fn index_consistent(&self) -> bool {
        self.index.len() == self.live
            && self
                .items
                .values()
                .all(|item| self.index.tier_of(item.id) == IndexTier::for_state(item.state))
    }

    fn rebuild_index(&mut self) -> usize {
        let mut index = VectorIndex::new(self.index.dimension(), self.index.ceiling());
        for item in self.items.values() {
            let Some(tier) = IndexTier::for_state(item.state) else {
                continue;
            };
            if let Err(e) = index.insert(item.id, &item.embedding, tier) {
                warn!(item_id = %item.id, error = %e, "Skipping unindexable item during rebuild");
            }
        }
        self.index = index;
        self.index.len()
    }
}

pub struct ContextStore {
    config: CorpusConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
    inner: RwLock<StoreInner>,
    access: DashMap<ContextId, AccessStats>,
    next_id: AtomicU64,
    current_iteration: AtomicU64,
    files: Option<CorpusFiles>,
}

impl ContextStore {
    /// In-memory store with an empty corpus.
    pub fn new(
        config: CorpusConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index = VectorIndex::new(config.embedding_dimension, config.index_size_ceiling);
        Self {
            config,
            embedder,
            clock,
            inner: RwLock::new(StoreInner {
                items: BTreeMap::new(),
                index,
                live: 0,
            }),
            access: DashMap::new(),
            next_id: AtomicU64::new(1),
            current_iteration: AtomicU64::new(0),
            files: None,
        }
    }

    /// Store backed by `dir`, loading any corpus already persisted there.
    pub fn open(
        config: CorpusConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
        dir: impl Into<PathBuf>,
    ) -> StoreResult<Self> {
        let files = CorpusFiles::new(dir);
        let mut store = Self::new(config, embedder, clock);
        if let Some(table) = files.load_table()? {
            store.restore(table, files.load_index())?;
        } else {
            info!(dir = %files.dir().display(), "Starting new context corpus");
        }
        store.files = Some(files);
        Ok(store)
    }

    fn restore(&mut self, table: TableSnapshot, index: Option<IndexSnapshot>) -> StoreResult<()> {
        if table.schema_version != SCHEMA_VERSION {
            return Err(StoreError::Persistence(format!(
                "unsupported corpus schema version {}",
                table.schema_version
            )));
        }
        let dimension = self.config.embedding_dimension;
        if table.embedding_dimension != dimension {
            return Err(StoreError::validation(format!(
                "corpus was created with embedding dimension {}, configured dimension is {dimension}",
                table.embedding_dimension
            )));
        }

        let inner = self.inner.get_mut();
        let mut max_id = 0;
        for item in table.items {
            if item.embedding.len() != dimension {
                return Err(StoreError::Persistence(format!(
                    "item {} has embedding dimension {}",
                    item.id,
                    item.embedding.len()
                )));
            }
            max_id = max_id.max(item.id.0);
            if item.state != ContextState::Purged {
                inner.live += 1;
            }
            self.access.insert(item.id, AccessStats::of(&item));
            inner.items.insert(item.id, item);
        }
        self.next_id
            .store(table.next_id.max(max_id + 1), Ordering::SeqCst);
        self.current_iteration
            .store(table.current_iteration, Ordering::SeqCst);

        let ceiling = self.config.index_size_ceiling;
        let restored = index.and_then(|snapshot| {
            if snapshot.dimension != dimension {
                warn!(
                    snapshot_dimension = snapshot.dimension,
                    "Index snapshot dimension differs from corpus, rebuilding"
                );
                return None;
            }
            match VectorIndex::from_snapshot(&snapshot, ceiling) {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!(error = %e, "Index snapshot rejected, rebuilding");
                    None
                },
            }
        });

        match restored {
            Some(index) => {
                inner.index = index;
                if !inner.index_consistent() {
                    warn!("Index snapshot diverges from the context table, rebuilding");
                    inner.rebuild_index();
                }
            },
            None => {
                inner.rebuild_index();
            },
        }

        info!(
            items = inner.items.len(),
            index_size = inner.index.len(),
            next_id = self.next_id.load(Ordering::SeqCst),
            "Opened context corpus"
        );
        Ok(())
    }

    pub fn config(&self) -> &CorpusConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Highest iteration number stored so far.
    pub fn current_iteration(&self) -> u64 {
        self.current_iteration.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_len(&self) -> usize {
        self.inner.read().index.len()
    }

    pub fn is_persistent(&self) -> bool {
        self.files.is_some()
    }

    fn materialize(&self, item: &ContextItem) -> ContextItem {
        let mut item = item.clone();
        if let Some(stats) = self.access.get(&item.id) {
            stats.apply(&mut item);
        }
        item
    }

    /// Reject malformed input before anything is embedded or written.
    pub fn validate_new(&self, new: &NewContextItem) -> StoreResult<()> {
        if new.content.trim().is_empty() {
            return Err(StoreError::validation("content must not be empty"));
        }
        let length = new.content.chars().count();
        if length > self.config.max_content_length {
            return Err(StoreError::validation(format!(
                "content length {length} exceeds maximum of {}",
                self.config.max_content_length
            )));
        }
        if new.tags.len() > self.config.max_tags {
            return Err(StoreError::validation(format!(
                "{} tags exceed maximum of {}",
                new.tags.len(),
                self.config.max_tags
            )));
        }
        if let Some(tag) = new.tags.iter().find(|t| !TAG_PATTERN.is_match(t)) {
            return Err(StoreError::validation(format!("invalid tag: {tag:?}")));
        }
        if new.source.trim().is_empty() || new.source.len() > MAX_SOURCE_LENGTH {
            return Err(StoreError::validation(format!(
                "source must be 1-{MAX_SOURCE_LENGTH} characters"
            )));
        }
        if !(new.metadata.is_null() || new.metadata.is_object()) {
            return Err(StoreError::validation("metadata must be a JSON object"));
        }
        Ok(())
    }

    /// Embed `text` with the corpus provider under the configured timeout.
    pub async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
        let vector =
            embed_with_timeout(self.embedder.as_ref(), text, self.config.embedding_timeout())
                .await?;
        if vector.len() != self.config.embedding_dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.embedding_dimension,
                actual: vector.len(),
            }
            .into());
        }
        Ok(vector)
    }

    /// Validate and embed `new` without writing anything.
    pub async fn prepare(&self, new: NewContextItem) -> StoreResult<PreparedItem> {
        self.validate_new(&new)?;
        let embedding = self.embed(&new.content).await?;
        Ok(PreparedItem { new, embedding })
    }

    /// Validate, embed and insert a new item. Returns its id.
    pub async fn put(&self, new: NewContextItem) -> StoreResult<ContextId> {
        let prepared = self.prepare(new).await?;
        self.commit(vec![prepared])?
            .pop()
            .ok_or_else(|| StoreError::Internal("commit returned no id".to_string()))
    }

    /// Insert a batch of prepared items in one transaction: all of them or
    /// none. Capacity for the whole batch is reclaimed only once it is known
    /// to be sufficient, so a rejected batch evicts nothing.
    pub fn commit(&self, batch: Vec<PreparedItem>) -> StoreResult<Vec<ContextId>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let cap = self.config.hard_size_cap;
        let mut txn = self.write_txn();

        for prepared in &batch {
            if let Err(source) = txn.check_vector(&prepared.embedding) {
                let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst));
                warn!(item_id = %id, error = %source, "Rejected unindexable item");
                return Err(StoreError::IndexSyncFailed { id, source });
            }
        }

        let rejected = || {
            warn!(size = txn.len(), cap, needed = batch.len(), "Corpus at hard cap, rejecting insert");
            StoreError::CorpusCapacityExceeded {
                size: txn.len(),
                cap,
            }
        };
        let Some(target_len) = cap.checked_sub(batch.len()) else {
            return Err(rejected());
        };
        if txn.len() > target_len {
            let evictable = lifecycle::eviction_order(&txn.items()).len();
            if txn.len().saturating_sub(evictable) > target_len {
                return Err(rejected());
            }
            let reclaimed = lifecycle::reclaim_capacity(&mut txn, target_len);
            info!(reclaimed = reclaimed.len(), "Reclaimed corpus capacity");
        }

        let now = self.clock.now();
        let mut ids = Vec::with_capacity(batch.len());
        let mut high_water = 0;
        for PreparedItem { new, embedding } in batch {
            let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let metadata = if new.metadata.is_null() {
                serde_json::json!({})
            } else {
                new.metadata
            };
            let item = ContextItem {
                id,
                content: new.content,
                embedding,
                context_type: new.context_type,
                iteration: new.iteration,
                state: ContextState::Active,
                created_at: now,
                last_retrieved_at: None,
                retrieval_count: 0,
                tags: new.tags,
                source: new.source,
                metadata,
                usefulness_score: 0.5,
            };
            let context_type = item.context_type;
            let iteration = item.iteration;

            if let Err(e) = txn.insert(item) {
                for id in &ids {
                    txn.delete(*id);
                }
                return Err(e);
            }
            high_water = high_water.max(iteration);
            debug!(item_id = %id, %context_type, iteration, "Stored context item");
            ids.push(id);
        }
        self.current_iteration.fetch_max(high_water, Ordering::SeqCst);
        Ok(ids)
    }

    pub fn get(&self, id: ContextId) -> StoreResult<ContextItem> {
        let inner = self.inner.read();
        inner
            .items
            .get(&id)
            .map(|item| self.materialize(item))
            .ok_or(StoreError::NotFound(id))
    }

    /// Move an item forward in its lifecycle.
    pub fn update_state(&self, id: ContextId, state: ContextState) -> StoreResult<ContextItem> {
        let item = self.write_txn().transition(id, state)?;
        info!(item_id = %id, %state, "Context item transitioned");
        Ok(item)
    }

    /// Items matching `filter`, in id order.
    pub fn list(&self, filter: &ListFilter) -> Vec<ContextItem> {
        let inner = self.inner.read();
        inner
            .items
            .values()
            .filter(|item| filter.matches(item))
            .map(|item| self.materialize(item))
            .collect()
    }

    /// Delete an item from the table and the index. The only true deletion.
    pub fn purge(&self, id: ContextId) -> StoreResult<ContextItem> {
        let item = self.write_txn().delete(id).ok_or(StoreError::NotFound(id))?;
        info!(item_id = %id, "Context item deleted");
        Ok(item)
    }

    /// Top-`k` retrievable records by raw similarity to `query`.
    ///
    /// When the index disagrees with the table, divergent entries are
    /// repaired (or the whole index rebuilt on a count mismatch) and the
    /// query is answered again from the repaired index. A record the table
    /// does not allow is never surfaced.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &RetrievalFilters,
    ) -> StoreResult<Vec<Candidate>> {
        let pass = self.search_pass(query, k, filters)?;
        if pass.needs_rebuild {
            warn!("Index size diverges from the context table, rebuilding");
            self.rebuild_index();
        } else if !pass.divergent.is_empty() {
            self.repair_entries(&pass.divergent);
        } else {
            return Ok(pass.candidates);
        }
        Ok(self.search_pass(query, k, filters)?.candidates)
    }

    fn search_pass(
        &self,
        query: &[f32],
        k: usize,
        filters: &RetrievalFilters,
    ) -> StoreResult<SearchPass> {
        let mut divergent = BTreeSet::new();
        let inner = self.inner.read();
        let hits = inner
            .index
            .search(query, k, filters.include_archived, |id, tier| {
                let Some(item) = inner.items.get(&id) else {
                    divergent.insert(id);
                    return false;
                };
                if IndexTier::for_state(item.state) != Some(tier) {
                    divergent.insert(id);
                }
                item.state.is_retrievable(filters.include_archived) && filters.matches(item)
            })
            .map_err(|e| {
                StoreError::Embedding(EmbeddingError::InvalidInput(format!(
                    "query vector rejected: {e}"
                )))
            })?;

        let candidates = hits
            .into_iter()
            .filter_map(|hit| {
                inner.items.get(&hit.id).map(|item| Candidate {
                    item: self.materialize(item),
                    similarity: f64::from(hit.similarity),
                })
            })
            .collect();
        Ok(SearchPass {
            candidates,
            divergent,
            needs_rebuild: inner.index.len() != inner.live,
        })
    }

    fn repair_entries(&self, ids: &BTreeSet<ContextId>) {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let mut repaired = 0;
        for id in ids {
            let tier = inner
                .items
                .get(id)
                .and_then(|item| IndexTier::for_state(item.state).map(|t| (item, t)));
            match tier {
                Some((item, tier)) => match inner.index.insert(*id, &item.embedding, tier) {
                    Ok(()) => repaired += 1,
                    Err(e) => warn!(item_id = %id, error = %e, "Failed to repair index entry"),
                },
                None => {
                    inner.index.remove(*id);
                    repaired += 1;
                },
            }
        }
        warn!(repaired, divergent = ids.len(), "Repaired divergent index entries");
    }

    /// Rebuild the vector index from the table. Returns the entry count.
    pub fn rebuild_index(&self) -> usize {
        let entries = self.inner.write().rebuild_index();
        info!(entries, "Rebuilt vector index");
        entries
    }

    /// Whether every non-purged record is indexed in the tier its state maps to.
    pub fn index_consistent(&self) -> bool {
        self.inner.read().index_consistent()
    }

    /// Record a retrieval hit on each of `ids`. Best effort; unknown ids are skipped.
    pub fn touch(&self, ids: &[ContextId]) {
        let now = self.clock.now();
        for id in ids {
            if let Some(mut stats) = self.access.get_mut(id) {
                stats.retrieval_count += 1;
                stats.last_retrieved_at = Some(now);
            }
        }
    }

    /// Nudge the usefulness score of `id` up or down. Returns the new score.
    pub fn record_feedback(&self, id: ContextId, helpful: bool) -> StoreResult<f64> {
        let mut stats = self.access.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let delta = if helpful {
            USEFULNESS_STEP
        } else {
            -USEFULNESS_STEP
        };
        stats.usefulness_score = (stats.usefulness_score + delta).clamp(0.0, 1.0);
        Ok(stats.usefulness_score)
    }

    pub fn stats(&self) -> CorpusStats {
        let inner = self.inner.read();
        let mut stats = CorpusStats {
            total_items: inner.items.len(),
            corpus_size: inner.items.len(),
            index_size: inner.index.len(),
            hot_index_size: inner.index.hot_len(),
            cold_index_size: inner.index.cold_len(),
            current_iteration: self.current_iteration(),
            ..CorpusStats::default()
        };
        for state in ContextState::ALL {
            stats.items_by_state.insert(state.as_str().to_string(), 0);
        }
        for context_type in ContextType::ALL {
            stats.items_by_type.insert(context_type.as_str().to_string(), 0);
        }

        let mut usefulness_total = 0.0;
        let mut oldest: Option<u64> = None;
        let mut newest: Option<u64> = None;
        for item in inner.items.values() {
            let item = self.materialize(item);
            *stats
                .items_by_state
                .entry(item.state.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .items_by_type
                .entry(item.context_type.as_str().to_string())
                .or_insert(0) += 1;
            stats.content_bytes += item.content.len();
            usefulness_total += item.usefulness_score;
            oldest = Some(oldest.map_or(item.iteration, |o| o.min(item.iteration)));
            newest = Some(newest.map_or(item.iteration, |n| n.max(item.iteration)));
        }

        if !inner.items.is_empty() {
            stats.avg_usefulness_score = usefulness_total / inner.items.len() as f64;
        }
        stats.oldest_item_iteration = oldest.unwrap_or(0);
        stats.newest_item_iteration = newest.unwrap_or(0);
        stats
    }

    /// Write the table and index to the data directory, if one is configured.
    pub fn save(&self) -> StoreResult<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };

        let (table, index) = {
            let inner = self.inner.read();
            let table = TableSnapshot {
                schema_version: SCHEMA_VERSION,
                embedding_dimension: self.config.embedding_dimension,
                next_id: self.next_id.load(Ordering::SeqCst),
                current_iteration: self.current_iteration(),
                items: inner
                    .items
                    .values()
                    .map(|item| self.materialize(item))
                    .collect(),
            };
            (table, inner.index.to_snapshot())
        };

        files.save(&table, &index)?;
        debug!(items = table.items.len(), "Saved context corpus");
        Ok(())
    }

    /// Exclusive access to table and index for multi-item operations.
    pub(crate) fn write_txn(&self) -> StoreTxn<'_> {
        StoreTxn {
            store: self,
            inner: self.inner.write(),
        }
    }
}

/// Write transaction over the whole corpus. Readers are blocked until it is
/// dropped, so a batch of transitions becomes visible at once.
pub(crate) struct StoreTxn<'a> {
    store: &'a ContextStore,
    inner: RwLockWriteGuard<'a, StoreInner>,
}

impl StoreTxn<'_> {
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.store.clock.now()
    }

    pub fn current_iteration(&self) -> u64 {
        self.store.current_iteration()
    }

    /// Current view of every record, access fields included.
    pub fn items(&self) -> Vec<ContextItem> {
        self.inner
            .items
            .values()
            .map(|item| self.store.materialize(item))
            .collect()
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        self.inner.index.check(vector)
    }

    fn insert(&mut self, item: ContextItem) -> StoreResult<()> {
        let id = item.id;
        let inner = &mut *self.inner;
        let stats = AccessStats::of(&item);
        let embedding = item.embedding.clone();
        inner.items.insert(id, item);

        if let Err(source) = inner.index.insert(id, &embedding, IndexTier::Hot) {
            inner.items.remove(&id);
            warn!(item_id = %id, error = %source, "Index insert failed, rolled back");
            return Err(StoreError::IndexSyncFailed { id, source });
        }

        inner.live += 1;
        self.store.access.insert(id, stats);
        Ok(())
    }

    /// Apply one monotone state transition, keeping the index in step.
    pub fn transition(&mut self, id: ContextId, to: ContextState) -> StoreResult<ContextItem> {
        let inner = &mut *self.inner;
        let item = inner.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let from = item.state;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }

        match IndexTier::for_state(to) {
            Some(tier) => {
                if !inner.index.set_tier(id, tier) {
                    inner
                        .index
                        .insert(id, &item.embedding, tier)
                        .map_err(|source| StoreError::IndexSyncFailed { id, source })?;
                }
            },
            None => {
                inner.index.remove(id);
                inner.live = inner.live.saturating_sub(1);
            },
        }

        item.state = to;
        let item = item.clone();
        Ok(self.store.materialize(&item))
    }

    /// Physically remove a record and its index entry.
    pub fn delete(&mut self, id: ContextId) -> Option<ContextItem> {
        let inner = &mut *self.inner;
        let mut item = inner.items.remove(&id)?;
        inner.index.remove(id);
        if item.state != ContextState::Purged {
            inner.live = inner.live.saturating_sub(1);
        }
        if let Some((_, stats)) = self.store.access.remove(&id) {
            stats.apply(&mut item);
        }
        Some(item)
    }
}
