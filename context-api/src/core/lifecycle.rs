//! Lifecycle Manager: ages context items through
//! ACTIVE → STALE → ARCHIVED → PURGED and enforces the corpus hard cap.
//!
//! A sweep runs under a single store write transaction, so concurrent
//! queries observe the corpus either entirely before or entirely after it.
//! Sweeps are triggered every N writes or by an explicit maintenance call;
//! nothing in here runs on a timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::config::LifecycleConfig;
use super::store::{ContextStore, StoreTxn};
use crate::models::context::{ContextId, ContextItem, ContextState};

/// Pure age and distance rules deciding where an item belongs.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    config: LifecycleConfig,
}

impl LifecyclePolicy {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// State `item` should be in at `now`. Age counts from the last
    /// retrieval, or from creation when never retrieved.
    ///
    /// An item `stale_iteration_distance` or more iterations behind goes
    /// stale only while it has been retrieved fewer than
    /// `stale_min_retrievals` times. Items still in use stay active until
    /// the age threshold catches them, so a plain distance check is not
    /// enough to predict the state.
    pub fn target_state(
        &self,
        item: &ContextItem,
        now: DateTime<Utc>,
        current_iteration: u64,
    ) -> ContextState {
        let age = now - item.last_touched();
        if age >= self.config.purge_after() {
            return ContextState::Purged;
        }
        if age >= self.config.archive_after() {
            return ContextState::Archived;
        }

        let distance = current_iteration.saturating_sub(item.iteration);
        let rarely_used = item.retrieval_count < self.config.stale_min_retrievals;
        if age >= self.config.stale_after()
            || (distance >= self.config.stale_iteration_distance && rarely_used)
        {
            return ContextState::Stale;
        }
        ContextState::Active
    }
}

/// Hard-cap eviction order: PURGED tombstones first, then ARCHIVED items,
/// least recently touched first within each group. Nothing else is evictable.
pub fn eviction_order(items: &[ContextItem]) -> Vec<ContextId> {
    let mut evictable: Vec<&ContextItem> = items
        .iter()
        .filter(|item| matches!(item.state, ContextState::Purged | ContextState::Archived))
        .collect();
    evictable.sort_by(|a, b| {
        let group = |item: &ContextItem| u8::from(item.state != ContextState::Purged);
        group(a)
            .cmp(&group(b))
            .then_with(|| a.last_touched().cmp(&b.last_touched()))
            .then_with(|| a.id.cmp(&b.id))
    });
    evictable.into_iter().map(|item| item.id).collect()
}

/// Delete evictable records until at most `target_len` remain. Returns the
/// deleted ids; fewer than needed when the corpus holds too few evictable
/// records.
pub(crate) fn reclaim_capacity(txn: &mut StoreTxn<'_>, target_len: usize) -> Vec<ContextId> {
    let mut deleted = Vec::new();
    if txn.len() <= target_len {
        return deleted;
    }
    for id in eviction_order(&txn.items()) {
        if txn.len() <= target_len {
            break;
        }
        if txn.delete(id).is_some() {
            deleted.push(id);
        }
    }
    deleted
}

/// Outcome of one lifecycle sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub to_stale: usize,
    pub to_archived: usize,
    pub to_purged: usize,
    /// Records physically deleted to get back under the hard cap
    pub deleted: usize,
    pub corpus_size: usize,
    pub errors: Vec<String>,
    pub duration_ms: f64,
}

impl SweepReport {
    pub fn transitions(&self) -> usize {
        self.to_stale + self.to_archived + self.to_purged
    }

    fn record(&mut self, state: ContextState) {
        match state {
            ContextState::Stale => self.to_stale += 1,
            ContextState::Archived => self.to_archived += 1,
            ContextState::Purged => self.to_purged += 1,
            ContextState::Active => {},
        }
    }
}

pub struct LifecycleManager {
    store: Arc<ContextStore>,
    policy: LifecyclePolicy,
    writes_since_sweep: AtomicU64,
}

impl LifecycleManager {
    pub fn new(store: Arc<ContextStore>, config: LifecycleConfig) -> Self {
        Self {
            store,
            policy: LifecyclePolicy::new(config),
            writes_since_sweep: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Count one write. Returns true when enough writes have accumulated
    /// that the caller should run a sweep.
    pub fn record_write(&self) -> bool {
        let every = self.policy.config.sweep_every_n_writes;
        if every == 0 {
            return false;
        }
        let writes = self.writes_since_sweep.fetch_add(1, Ordering::SeqCst) + 1;
        if writes >= every {
            self.writes_since_sweep.store(0, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Advance every item to the state its age calls for, then enforce the
    /// hard cap.
    pub fn sweep(&self) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();

        let mut txn = self.store.write_txn();
        let now = txn.now();
        let current_iteration = txn.current_iteration();

        for item in txn.items() {
            report.examined += 1;
            let target = self.policy.target_state(&item, now, current_iteration);
            if !item.state.can_transition_to(target) {
                continue;
            }
            match txn.transition(item.id, target) {
                Ok(_) => {
                    debug!(item_id = %item.id, from = %item.state, to = %target, "Lifecycle transition");
                    report.record(target);
                },
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "Lifecycle transition failed");
                    report.errors.push(e.to_string());
                },
            }
        }

        let cap = self.store.config().hard_size_cap;
        if txn.len() > cap {
            report.deleted = reclaim_capacity(&mut txn, cap).len();
            if txn.len() > cap {
                warn!(
                    size = txn.len(),
                    cap, "Corpus still over hard cap after sweep, nothing left to evict"
                );
            }
        }
        report.corpus_size = txn.len();
        drop(txn);

        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            examined = report.examined,
            to_stale = report.to_stale,
            to_archived = report.to_archived,
            to_purged = report.to_purged,
            deleted = report.deleted,
            duration_ms = report.duration_ms,
            "Lifecycle sweep complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::config::CorpusConfig;
    use crate::core::testing::StubEmbedder;
    use crate::models::context::{ContextType, NewContextItem, RetrievalFilters};
    use chrono::Duration;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            stale_after_secs: 3600,
            archive_after_secs: 2 * 3600,
            purge_after_secs: 3 * 3600,
            stale_iteration_distance: 5,
            stale_min_retrievals: 1,
            sweep_every_n_writes: 3,
        }
    }

    fn item(state: ContextState, iteration: u64, created_at: DateTime<Utc>) -> ContextItem {
        ContextItem {
            id: ContextId(iteration),
            content: "x".to_string(),
            embedding: vec![1.0, 0.0],
            context_type: ContextType::Task,
            iteration,
            state,
            created_at,
            last_retrieved_at: None,
            retrieval_count: 0,
            tags: Vec::new(),
            source: "orchestrator".to_string(),
            metadata: serde_json::json!({}),
            usefulness_score: 0.5,
        }
    }

    fn setup(cap: usize) -> (Arc<ContextStore>, Arc<ManualClock>, LifecycleManager) {
        let clock = Arc::new(ManualClock::default());
        let corpus = CorpusConfig {
            embedding_dimension: 4,
            hard_size_cap: cap,
            ..CorpusConfig::default()
        };
        let store = Arc::new(ContextStore::new(
            corpus,
            Arc::new(StubEmbedder::new(4)),
            clock.clone(),
        ));
        let manager = LifecycleManager::new(store.clone(), config());
        (store, clock, manager)
    }

    #[test]
    fn test_target_state_by_age() {
        let policy = LifecyclePolicy::new(config());
        let now = Utc::now();
        let at = |hours: i64| item(ContextState::Active, 10, now - Duration::hours(hours));

        assert_eq!(policy.target_state(&at(0), now, 10), ContextState::Active);
        assert_eq!(policy.target_state(&at(1), now, 10), ContextState::Stale);
        assert_eq!(policy.target_state(&at(2), now, 10), ContextState::Archived);
        assert_eq!(policy.target_state(&at(5), now, 10), ContextState::Purged);
    }

    #[test]
    fn test_target_state_by_iteration_distance() {
        let policy = LifecyclePolicy::new(config());
        let now = Utc::now();
        let mut old = item(ContextState::Active, 2, now);

        assert_eq!(policy.target_state(&old, now, 6), ContextState::Active);
        assert_eq!(policy.target_state(&old, now, 7), ContextState::Stale);

        // retrieved often enough to stay active
        old.retrieval_count = 1;
        assert_eq!(policy.target_state(&old, now, 7), ContextState::Active);
    }

    #[test]
    fn test_retrieval_resets_the_lifecycle_clock() {
        let policy = LifecyclePolicy::new(config());
        let now = Utc::now();
        let mut it = item(ContextState::Active, 1, now - Duration::hours(4));
        it.last_retrieved_at = Some(now - Duration::minutes(10));
        it.retrieval_count = 2;

        assert_eq!(policy.target_state(&it, now, 1), ContextState::Active);
    }

    #[test]
    fn test_eviction_order() {
        let now = Utc::now();
        let mut items = vec![
            item(ContextState::Archived, 1, now - Duration::hours(5)),
            item(ContextState::Active, 2, now - Duration::hours(9)),
            item(ContextState::Purged, 3, now - Duration::hours(1)),
            item(ContextState::Archived, 4, now - Duration::hours(8)),
            item(ContextState::Purged, 5, now - Duration::hours(2)),
        ];
        items[0].last_retrieved_at = Some(now - Duration::hours(3));

        let order: Vec<u64> = eviction_order(&items).into_iter().map(|id| id.0).collect();
        assert_eq!(order, vec![5, 3, 4, 1]);
    }

    #[test]
    fn test_record_write_triggers_every_n() {
        let (_, _, manager) = setup(100);
        assert!(!manager.record_write());
        assert!(!manager.record_write());
        assert!(manager.record_write());
        assert!(!manager.record_write());
    }

    #[tokio::test]
    async fn test_sweep_moves_items_forward() {
        let (store, clock, manager) = setup(100);
        let old = store
            .put(NewContextItem::new("old task", ContextType::Task, 1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(150));
        let fresh = store
            .put(NewContextItem::new("fresh task", ContextType::Task, 1))
            .await
            .unwrap();

        let report = manager.sweep();
        assert_eq!(report.examined, 2);
        assert_eq!(report.to_archived, 1);
        assert_eq!(report.transitions(), 1);
        assert_eq!(store.get(old).unwrap().state, ContextState::Archived);
        assert_eq!(store.get(fresh).unwrap().state, ContextState::Active);

        // already archived items do not move backwards or repeat
        let again = manager.sweep();
        assert_eq!(again.transitions(), 0);
        assert!(store.index_consistent());
    }

    #[tokio::test]
    async fn test_purged_item_keeps_tombstone_and_leaves_index() {
        let (store, clock, manager) = setup(100);
        let id = store
            .put(NewContextItem::new("ancient error", ContextType::Error, 1))
            .await
            .unwrap();
        clock.advance(Duration::hours(4));

        let report = manager.sweep();
        assert_eq!(report.to_purged, 1);
        assert_eq!(store.get(id).unwrap().state, ContextState::Purged);
        assert_eq!(store.index_len(), 0);

        let query = store.embed("ancient error").await.unwrap();
        let filters = RetrievalFilters {
            include_archived: true,
            ..RetrievalFilters::default()
        };
        assert!(store.search(&query, 5, &filters).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_enforces_hard_cap() {
        let (store, clock, manager) = setup(2);
        let first = store
            .put(NewContextItem::new("first", ContextType::Task, 1))
            .await
            .unwrap();
        store
            .put(NewContextItem::new("second", ContextType::Task, 1))
            .await
            .unwrap();
        clock.advance(Duration::hours(4));

        // third put reclaims nothing: both records are still ACTIVE
        let err = store
            .put(NewContextItem::new("third", ContextType::Task, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::StoreError::CorpusCapacityExceeded { size: 2, cap: 2 }
        ));

        manager.sweep();
        let third = store
            .put(NewContextItem::new("third", ContextType::Task, 1))
            .await
            .unwrap();

        assert!(store.get(first).is_err());
        assert_eq!(store.get(third).unwrap().state, ContextState::Active);
        assert_eq!(store.len(), 2);
    }
}
