//! Server API operations.
//!
//! `ContextService` validates external input, delegates to the store, the
//! retrieval planner and the lifecycle manager, and owns the write-driven
//! triggers: a lifecycle sweep every `sweep_every_n_writes` writes and a
//! snapshot every `snapshot_every_n_writes` writes when persistence is on.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::{Settings, StorageConfig};
use super::embedding::{EmbeddingProvider, HashingEmbedder};
use super::error::{StoreError, StoreResult};
use super::lifecycle::{LifecycleManager, SweepReport};
use super::retrieval::RetrievalPlanner;
use super::store::{ContextStore, PreparedItem};
use crate::models::context::{
    ContextId, ContextItemView, ContextState, ContextType, CorpusStats, IterationResult,
    ListFilter, NewContextItem, RetrievalFilters, RetrievalResult, SCHEMA_VERSION,
};

/// Upper bound for `iteration_history`.
pub const MAX_HISTORY: usize = 20;

/// Reject payloads written against another wire schema.
pub fn ensure_schema_version(version: u32) -> StoreResult<()> {
    if version != SCHEMA_VERSION {
        return Err(StoreError::validation(format!(
            "unsupported schema_version {version}, expected {SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub corpus_size: usize,
    pub index_size: usize,
    pub index_consistent: bool,
    pub persistent: bool,
    pub last_save_error: Option<String>,
}

pub struct ContextService {
    store: Arc<ContextStore>,
    planner: RetrievalPlanner,
    lifecycle: Arc<LifecycleManager>,
    storage: StorageConfig,
    writes_since_save: AtomicU64,
    last_save_error: Mutex<Option<String>>,
}

impl ContextService {
    /// Service with the built-in hashing embedder and wall-clock time.
    pub fn from_settings(settings: &Settings) -> StoreResult<Self> {
        let embedder = Arc::new(HashingEmbedder::new(settings.corpus.embedding_dimension));
        Self::with_provider(settings, embedder, Arc::new(SystemClock))
    }

    pub fn with_provider(
        settings: &Settings,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let store = match &settings.storage.data_dir {
            Some(dir) => ContextStore::open(settings.corpus.clone(), embedder, clock, dir)?,
            None => ContextStore::new(settings.corpus.clone(), embedder, clock),
        };
        Ok(Self::new(Arc::new(store), settings))
    }

    pub fn new(store: Arc<ContextStore>, settings: &Settings) -> Self {
        Self {
            planner: RetrievalPlanner::new(store.clone(), settings.retrieval.clone()),
            lifecycle: Arc::new(LifecycleManager::new(
                store.clone(),
                settings.lifecycle.clone(),
            )),
            store,
            storage: settings.storage.clone(),
            writes_since_save: AtomicU64::new(0),
            last_save_error: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub async fn store_context(&self, new: NewContextItem) -> StoreResult<ContextId> {
        let prepared = self.store.prepare(new).await?;
        let id = self
            .commit(vec![prepared])
            .await?
            .pop()
            .ok_or_else(|| StoreError::Internal("commit returned no id".to_string()))?;
        self.after_writes(1).await;
        Ok(id)
    }

    pub async fn retrieve_context(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        budget: Option<usize>,
    ) -> StoreResult<RetrievalResult> {
        let config = self.planner.config();
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::validation("query must not be empty"));
        }
        let query: String = query.chars().take(config.max_query_length).collect();

        let budget = budget.unwrap_or(config.default_budget);
        if budget == 0 {
            return Err(StoreError::validation("budget must be at least 1"));
        }
        let budget = budget.min(config.max_budget);

        if let (Some(min), Some(max)) = (filters.min_iteration, filters.max_iteration)
            && min > max
        {
            return Err(StoreError::validation(format!(
                "min_iteration {min} exceeds max_iteration {max}"
            )));
        }
        if filters.types.as_ref().is_some_and(|types| types.is_empty()) {
            return Err(StoreError::validation("types filter must not be empty"));
        }

        self.planner.retrieve(&query, filters, budget).await
    }

    /// Store one iteration as several typed context items. Either every item
    /// is stored or none is.
    pub async fn summarize_iteration(&self, result: &IterationResult) -> StoreResult<Vec<ContextId>> {
        if result.summary.trim().is_empty() {
            return Err(StoreError::validation("summary must not be empty"));
        }
        let items = decompose_iteration(result);
        for item in &items {
            self.store.validate_new(item)?;
        }

        let mut batch = Vec::with_capacity(items.len());
        for item in items {
            batch.push(self.store.prepare(item).await?);
        }
        let ids = self.commit(batch).await.inspect_err(|e| {
            warn!(iteration = result.iteration, error = %e, "Iteration summary rejected");
        })?;

        info!(
            iteration = result.iteration,
            success = result.success,
            items = ids.len(),
            "Stored iteration summary"
        );
        self.after_writes(ids.len() as u64).await;
        Ok(ids)
    }

    /// Commit a batch; at the hard cap, sweep once so expired items become
    /// reclaimable, then try again.
    async fn commit(&self, batch: Vec<PreparedItem>) -> StoreResult<Vec<ContextId>> {
        match self.store.commit(batch.clone()) {
            Err(StoreError::CorpusCapacityExceeded { size, cap }) => {
                info!(size, cap, "Corpus at hard cap, sweeping before retry");
                self.sweep().await?;
                self.store.commit(batch)
            },
            other => other,
        }
    }

    async fn sweep(&self) -> StoreResult<SweepReport> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.sweep())
            .await
            .map_err(|e| StoreError::Internal(format!("sweep task failed: {e}")))
    }

    pub fn get_stats(&self) -> CorpusStats {
        self.store.stats()
    }

    pub fn get_item(&self, id: ContextId) -> StoreResult<ContextItemView> {
        Ok(self.store.get(id)?.view())
    }

    pub fn list_items(&self, filter: &ListFilter) -> Vec<ContextItemView> {
        self.store.list(filter).iter().map(|item| item.view()).collect()
    }

    pub async fn update_state(
        &self,
        id: ContextId,
        state: ContextState,
    ) -> StoreResult<ContextItemView> {
        let item = self.store.update_state(id, state)?;
        self.after_writes(1).await;
        Ok(item.view())
    }

    pub async fn purge_item(&self, id: ContextId) -> StoreResult<ContextItemView> {
        let item = self.store.purge(id)?;
        self.after_writes(1).await;
        Ok(item.view())
    }

    pub fn mark_useful(&self, id: ContextId, helpful: bool) -> StoreResult<f64> {
        let score = self.store.record_feedback(id, helpful)?;
        info!(item_id = %id, helpful, usefulness_score = score, "Recorded usefulness feedback");
        Ok(score)
    }

    /// Most recent iteration summaries, newest first.
    pub fn iteration_history(&self, last_n: usize) -> Vec<ContextItemView> {
        let last_n = last_n.clamp(1, MAX_HISTORY);
        let mut items = self.store.list(&ListFilter {
            types: Some(vec![ContextType::Iteration]),
            states: Some(vec![
                ContextState::Active,
                ContextState::Stale,
                ContextState::Archived,
            ]),
            ..ListFilter::default()
        });
        items.sort_by(|a, b| b.iteration.cmp(&a.iteration).then_with(|| b.id.cmp(&a.id)));
        items.iter().take(last_n).map(|item| item.view()).collect()
    }

    /// Learnings at or above `min_usefulness`, most useful first.
    pub fn learnings(&self, tags: &[String], min_usefulness: f64) -> Vec<ContextItemView> {
        let mut items: Vec<_> = self
            .store
            .list(&ListFilter {
                types: Some(vec![ContextType::Learning]),
                states: Some(vec![
                    ContextState::Active,
                    ContextState::Stale,
                    ContextState::Archived,
                ]),
                tags: tags.to_vec(),
                ..ListFilter::default()
            })
            .into_iter()
            .filter(|item| item.usefulness_score >= min_usefulness)
            .collect();
        items.sort_by(|a, b| {
            b.usefulness_score
                .partial_cmp(&a.usefulness_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        items.iter().map(|item| item.view()).collect()
    }

    /// Explicit maintenance: sweep, then snapshot.
    pub fn run_maintenance(&self) -> StoreResult<SweepReport> {
        let report = self.lifecycle.sweep();
        self.save()?;
        Ok(report)
    }

    pub fn rebuild_index(&self) -> StoreResult<usize> {
        let entries = self.store.rebuild_index();
        self.save()?;
        Ok(entries)
    }

    pub fn health(&self) -> HealthReport {
        let index_consistent = self.store.index_consistent();
        let last_save_error = self.last_save_error.lock().clone();
        let status = if index_consistent && last_save_error.is_none() {
            "healthy"
        } else {
            "degraded"
        };
        HealthReport {
            status: status.to_string(),
            corpus_size: self.store.len(),
            index_size: self.store.index_len(),
            index_consistent,
            persistent: self.store.is_persistent(),
            last_save_error,
        }
    }

    /// Persist the corpus now. A no-op for in-memory stores.
    pub fn save(&self) -> StoreResult<()> {
        let result = self.store.save();
        self.record_save(&result);
        result
    }

    fn record_save(&self, result: &StoreResult<()>) {
        let mut last = self.last_save_error.lock();
        match result {
            Ok(()) => {
                *last = None;
                self.writes_since_save.store(0, Ordering::SeqCst);
            },
            Err(e) => *last = Some(e.to_string()),
        }
    }

    /// Write-driven triggers. Sweep and snapshot hold the corpus lock or
    /// touch the disk, so both run on the blocking pool.
    async fn after_writes(&self, writes: u64) {
        let mut sweep_due = false;
        for _ in 0..writes {
            sweep_due |= self.lifecycle.record_write();
        }
        if sweep_due && let Err(e) = self.sweep().await {
            error!(error = %e, "Write-triggered sweep failed");
        }

        let every = self.storage.snapshot_every_n_writes;
        if every == 0 || !self.store.is_persistent() {
            return;
        }
        let pending = self.writes_since_save.fetch_add(writes, Ordering::SeqCst) + writes;
        if pending < every {
            return;
        }
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.save())
            .await
            .map_err(|e| StoreError::Internal(format!("snapshot task failed: {e}")))
            .and_then(|saved| saved);
        self.record_save(&result);
        // The write itself succeeded; a failed snapshot is reported through health.
        if let Err(e) = result {
            error!(error = %e, "Failed to snapshot context corpus");
        }
    }
}

/// Split one iteration into typed context items sharing its number and figures.
pub fn decompose_iteration(result: &IterationResult) -> Vec<NewContextItem> {
    let n = result.iteration;
    let metadata = json!({
        "iteration": n,
        "success": result.success,
        "task": result.task,
        "duration_ms": result.duration_ms,
        "tokens_used": result.tokens_used,
        "cost": result.cost,
        "tool_call_count": result.tool_call_count(),
    });
    let item = |content: String, context_type: ContextType| {
        NewContextItem::new(content, context_type, n)
            .with_source("iteration")
            .with_metadata(metadata.clone())
    };

    let outcome = if result.success { "Success" } else { "Failed" };
    let mut summary = format!("Iteration {n}: {outcome}. {}", result.summary.trim());
    if let Some(error) = &result.error {
        summary.push_str(&format!(" Error: {error}"));
    }
    let outcome_tag = if result.success { "success" } else { "failure" };
    let mut items = vec![item(summary, ContextType::Iteration).with_tags(vec![outcome_tag.to_string()])];

    if let Some(error) = &result.error {
        items.push(item(format!("Iteration {n} error: {error}"), ContextType::Error));
    }
    if !result.artifacts.is_empty() {
        items.push(item(
            format!("Iteration {n} changed files: {}", result.artifacts.join(", ")),
            ContextType::FileChange,
        ));
    }
    if !result.tool_calls.is_empty() {
        items.push(item(
            format!("Iteration {n} tool calls: {}", result.tool_calls.join(", ")),
            ContextType::ToolResult,
        ));
    }
    for decision in result.decisions.iter().filter(|d| !d.trim().is_empty()) {
        items.push(item(decision.clone(), ContextType::Decision));
    }
    for learning in result.learnings.iter().filter(|l| !l.trim().is_empty()) {
        items.push(item(learning.clone(), ContextType::Learning));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::testing::StubEmbedder;
    use chrono::Duration;
    use tempfile::TempDir;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.corpus.embedding_dimension = 4;
        settings.lifecycle.stale_after_secs = 3600;
        settings.lifecycle.archive_after_secs = 2 * 3600;
        settings.lifecycle.purge_after_secs = 3 * 3600;
        settings.lifecycle.sweep_every_n_writes = 0;
        settings
    }

    fn service_with(settings: &Settings, stub: StubEmbedder) -> (ContextService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let service = ContextService::with_provider(settings, Arc::new(stub), clock.clone()).unwrap();
        (service, clock)
    }

    fn iteration(n: u64) -> IterationResult {
        IterationResult {
            iteration: n,
            task: Some("ship login".to_string()),
            success: false,
            summary: "form renders, submit fails".to_string(),
            duration_ms: 4_200,
            tokens_used: 1_500,
            cost: 0.02,
            tool_calls: vec!["read_file".to_string(), "run_tests".to_string()],
            artifacts: vec!["src/login.rs".to_string()],
            error: Some("assertion failed: status == 200".to_string()),
            decisions: vec!["use server-side sessions".to_string()],
            learnings: vec!["run the db fixture before auth tests".to_string()],
        }
    }

    #[tokio::test]
    async fn test_scenario_closest_task_first() {
        let stub = StubEmbedder::new(4)
            .with("task one", vec![1.0, 0.0, 0.0, 0.0])
            .with("error one", vec![0.0, 1.0, 0.0, 0.0])
            .with("task two", vec![0.0, 0.0, 1.0, 0.0])
            .with("find task two", vec![0.0, 0.05, 1.0, 0.05]);
        let (service, _) = service_with(&settings(), stub);

        service.store_context(NewContextItem::new("task one", ContextType::Task, 1)).await.unwrap();
        service.store_context(NewContextItem::new("error one", ContextType::Error, 1)).await.unwrap();
        let second_task = service
            .store_context(NewContextItem::new("task two", ContextType::Task, 2))
            .await
            .unwrap();

        let result = service
            .retrieve_context("find task two", &RetrievalFilters::default(), Some(2))
            .await
            .unwrap();
        assert_eq!(result.hits[0].item.id, second_task);
        assert!(result.len() <= 2);
    }

    #[tokio::test]
    async fn test_scenario_purged_item_stays_readable_but_hidden() {
        let (service, clock) = service_with(&settings(), StubEmbedder::new(4));
        let id = service
            .store_context(NewContextItem::new("flaky network mock", ContextType::Learning, 1))
            .await
            .unwrap();

        clock.advance(Duration::hours(4));
        let report = service.run_maintenance().unwrap();
        assert_eq!(report.to_purged, 1);

        assert_eq!(service.get_item(id).unwrap().state, ContextState::Purged);
        for include_archived in [false, true] {
            let filters = RetrievalFilters {
                include_archived,
                ..RetrievalFilters::default()
            };
            let result = service
                .retrieve_context("flaky network mock", &filters, None)
                .await
                .unwrap();
            assert!(result.is_empty());
        }
    }

    #[tokio::test]
    async fn test_scenario_empty_corpus() {
        let (service, _) = service_with(&settings(), StubEmbedder::new(4));
        let result = service
            .retrieve_context("anything at all", &RetrievalFilters::default(), Some(5))
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_scenario_duplicates_stored_but_collapsed() {
        let stub = StubEmbedder::new(4)
            .with("db lock timeout", vec![1.0, 0.0, 0.0, 0.0]);
        let (service, _) = service_with(&settings(), stub);
        let first = service
            .store_context(NewContextItem::new("db lock timeout", ContextType::Error, 3))
            .await
            .unwrap();
        let second = service
            .store_context(NewContextItem::new("db lock timeout", ContextType::Error, 3))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(service.get_stats().corpus_size, 2);

        let result = service
            .retrieve_context("db lock timeout", &RetrievalFilters::default(), Some(5))
            .await
            .unwrap();
        assert_eq!(result.ids(), vec![first]);
    }

    #[tokio::test]
    async fn test_rebuild_preserves_rankings() {
        let (service, _) = service_with(&settings(), StubEmbedder::new(4));
        for (i, text) in ["parse config", "config loader panics", "render chart", "parse args"]
            .iter()
            .enumerate()
        {
            service
                .store_context(NewContextItem::new(*text, ContextType::Task, i as u64))
                .await
                .unwrap();
        }
        let query = service.store().embed("parse config file").await.unwrap();
        let filters = RetrievalFilters::default();
        let before = service.store().search(&query, 4, &filters).unwrap();

        assert_eq!(service.rebuild_index().unwrap(), 4);
        let after = service.store().search(&query, 4, &filters).unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.item.id, a.item.id);
            assert!((b.similarity - a.similarity).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_retrieve_validates_input() {
        let (service, _) = service_with(&settings(), StubEmbedder::new(4));
        let filters = RetrievalFilters::default();

        assert!(matches!(
            service.retrieve_context("  ", &filters, None).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            service.retrieve_context("q", &filters, Some(0)).await,
            Err(StoreError::Validation(_))
        ));
        let inverted = RetrievalFilters {
            min_iteration: Some(5),
            max_iteration: Some(2),
            ..RetrievalFilters::default()
        };
        assert!(matches!(
            service.retrieve_context("q", &inverted, None).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_decompose_iteration() {
        let items = decompose_iteration(&iteration(7));
        let types: Vec<_> = items.iter().map(|i| i.context_type).collect();
        assert_eq!(
            types,
            vec![
                ContextType::Iteration,
                ContextType::Error,
                ContextType::FileChange,
                ContextType::ToolResult,
                ContextType::Decision,
                ContextType::Learning,
            ]
        );
        assert!(items.iter().all(|i| i.iteration == 7));
        assert_eq!(
            items[0].content,
            "Iteration 7: Failed. form renders, submit fails Error: assertion failed: status == 200"
        );
        assert_eq!(items[0].tags, vec!["failure".to_string()]);
        assert_eq!(items[0].metadata["tool_call_count"], 2);
        assert_eq!(items[2].content, "Iteration 7 changed files: src/login.rs");

        let minimal = IterationResult {
            success: true,
            tool_calls: Vec::new(),
            artifacts: Vec::new(),
            error: None,
            decisions: Vec::new(),
            learnings: Vec::new(),
            ..iteration(8)
        };
        let items = decompose_iteration(&minimal);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "Iteration 8: Success. form renders, submit fails");
    }

    #[tokio::test]
    async fn test_summarize_iteration_is_all_or_nothing() {
        let mut settings = settings();
        settings.corpus.max_content_length = 40;
        let (service, _) = service_with(&settings, StubEmbedder::new(4));

        let err = service.summarize_iteration(&iteration(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(service.get_stats().corpus_size, 0);

        let short = IterationResult {
            summary: "ok".to_string(),
            error: None,
            decisions: vec!["keep it".to_string()],
            learnings: Vec::new(),
            tool_calls: Vec::new(),
            artifacts: Vec::new(),
            ..iteration(2)
        };
        let ids = service.summarize_iteration(&short).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(service.get_stats().current_iteration, 2);
    }

    #[tokio::test]
    async fn test_put_at_cap_sweeps_expired_items_first() {
        let mut settings = settings();
        settings.corpus.hard_size_cap = 2;
        let (service, clock) = service_with(&settings, StubEmbedder::new(4));
        let first = service
            .store_context(NewContextItem::new("one", ContextType::Task, 1))
            .await
            .unwrap();
        service.store_context(NewContextItem::new("two", ContextType::Task, 1)).await.unwrap();

        clock.advance(Duration::hours(10));
        let third = service
            .store_context(NewContextItem::new("three", ContextType::Task, 2))
            .await
            .unwrap();

        assert!(service.get_item(third).is_ok());
        assert_eq!(service.get_stats().corpus_size, 2);
        assert!(matches!(service.get_item(first), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejected_iteration_keeps_unrelated_items() {
        let mut settings = settings();
        settings.corpus.hard_size_cap = 3;
        let (service, _) = service_with(&settings, StubEmbedder::new(4));
        let archived = service
            .store_context(NewContextItem::new("old plan", ContextType::Decision, 1))
            .await
            .unwrap();
        service
            .store_context(NewContextItem::new("open task", ContextType::Task, 1))
            .await
            .unwrap();
        service.update_state(archived, ContextState::Archived).await.unwrap();

        let three_items = IterationResult {
            error: None,
            artifacts: Vec::new(),
            tool_calls: Vec::new(),
            ..iteration(2)
        };
        assert_eq!(decompose_iteration(&three_items).len(), 3);

        let err = service.summarize_iteration(&three_items).await.unwrap_err();
        assert!(matches!(err, StoreError::CorpusCapacityExceeded { .. }));
        assert_eq!(service.get_item(archived).unwrap().state, ContextState::Archived);
        assert_eq!(service.get_stats().corpus_size, 2);
        assert_eq!(service.get_stats().current_iteration, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_alongside_retrieval_stays_consistent() {
        let (service, clock) = service_with(&settings(), StubEmbedder::new(4));
        let service = Arc::new(service);
        for i in 0..60u64 {
            service
                .store_context(NewContextItem::new(format!("cache note {i}"), ContextType::Task, 1))
                .await
                .unwrap();
        }
        clock.advance(Duration::minutes(150));

        let sweeper = {
            let service = service.clone();
            tokio::task::spawn_blocking(move || service.run_maintenance())
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let service = service.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let result = service
                        .retrieve_context("cache note", &RetrievalFilters::default(), Some(10))
                        .await
                        .unwrap();
                    for hit in &result.hits {
                        assert!(
                            matches!(hit.item.state, ContextState::Active | ContextState::Stale),
                            "item {} surfaced in state {}",
                            hit.item.id,
                            hit.item.state
                        );
                    }
                }
            }));
        }

        let report = sweeper.await.unwrap().unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(report.examined, 60);
        assert!(service.health().index_consistent);
    }

    #[tokio::test]
    async fn test_history_and_learnings() {
        let (service, _) = service_with(&settings(), StubEmbedder::new(4));
        for n in 1..=3 {
            service.summarize_iteration(&iteration(n)).await.unwrap();
        }

        let history = service.iteration_history(2);
        assert_eq!(history.iter().map(|i| i.iteration).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(service.iteration_history(0).len(), 1);

        let learnings = service.learnings(&[], 0.5);
        assert_eq!(learnings.len(), 3);
        let favourite = learnings[2].id;
        service.mark_useful(favourite, true).unwrap();
        let other = learnings[0].id;
        service.mark_useful(other, false).unwrap();

        let ranked = service.learnings(&[], 0.5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, favourite);
    }

    #[tokio::test]
    async fn test_write_triggered_sweep() {
        let mut settings = settings();
        settings.lifecycle.sweep_every_n_writes = 2;
        let (service, clock) = service_with(&settings, StubEmbedder::new(4));

        let old = service
            .store_context(NewContextItem::new("old note", ContextType::Task, 1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(90));
        service
            .store_context(NewContextItem::new("new note", ContextType::Task, 1))
            .await
            .unwrap();

        assert_eq!(service.get_item(old).unwrap().state, ContextState::Stale);
    }

    #[tokio::test]
    async fn test_persistence_and_health() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings();
        settings.storage.data_dir = Some(dir.path().to_path_buf());
        settings.storage.snapshot_every_n_writes = 1;

        let (service, _) = service_with(&settings, StubEmbedder::new(4));
        let id = service
            .store_context(NewContextItem::new("persist me", ContextType::Decision, 1))
            .await
            .unwrap();
        let health = service.health();
        assert_eq!(health.status, "healthy");
        assert!(health.persistent);
        drop(service);

        let (reopened, _) = service_with(&settings, StubEmbedder::new(4));
        assert_eq!(reopened.get_item(id).unwrap().content, "persist me");
        assert_eq!(reopened.health().index_size, 1);
    }

    #[test]
    fn test_schema_version_check() {
        assert!(ensure_schema_version(SCHEMA_VERSION).is_ok());
        assert!(matches!(
            ensure_schema_version(SCHEMA_VERSION + 1),
            Err(StoreError::Validation(_))
        ));
    }
}
