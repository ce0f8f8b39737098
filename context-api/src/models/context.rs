//! Context item data model shared by the store, the planner and the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Wire schema version carried by every request and response.
pub const SCHEMA_VERSION: u32 = 1;

pub fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Identifier of a context item.
///
/// Assigned from a monotonically increasing counter and never reused, so the
/// natural ordering doubles as a deterministic tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of context fragment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Task description and goals
    Task,
    /// Per-iteration summary
    Iteration,
    /// Architectural or strategic decision
    Decision,
    /// Errors and stack traces
    Error,
    /// Tool call outputs
    ToolResult,
    /// Files created or modified
    FileChange,
    /// Learned strategies worth reusing
    Learning,
}

impl ContextType {
    pub const ALL: [ContextType; 7] = [
        ContextType::Task,
        ContextType::Iteration,
        ContextType::Decision,
        ContextType::Error,
        ContextType::ToolResult,
        ContextType::FileChange,
        ContextType::Learning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Task => "task",
            ContextType::Iteration => "iteration",
            ContextType::Decision => "decision",
            ContextType::Error => "error",
            ContextType::ToolResult => "tool_result",
            ContextType::FileChange => "file_change",
            ContextType::Learning => "learning",
        }
    }

    /// Default priority weight used by the ranking stage (0.0 - 1.0)
    pub fn default_priority(&self) -> f64 {
        match self {
            ContextType::Error => 1.0,
            ContextType::Decision => 0.9,
            ContextType::Task => 0.8,
            ContextType::Learning => 0.7,
            ContextType::Iteration => 0.6,
            ContextType::FileChange => 0.5,
            ContextType::ToolResult => 0.4,
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ContextType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown context type: {s}"))
    }
}

/// Lifecycle state of a context item.
///
/// Declaration order is the only permitted direction of travel:
/// ACTIVE → STALE → ARCHIVED → PURGED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Stale,
    Archived,
    Purged,
}

impl ContextState {
    pub const ALL: [ContextState; 4] = [
        ContextState::Active,
        ContextState::Stale,
        ContextState::Archived,
        ContextState::Purged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Active => "active",
            ContextState::Stale => "stale",
            ContextState::Archived => "archived",
            ContextState::Purged => "purged",
        }
    }

    /// Whether moving to `next` respects the monotone order. Stages may be
    /// skipped, never revisited.
    pub fn can_transition_to(&self, next: ContextState) -> bool {
        next > *self
    }

    /// Whether items in this state are reachable by default retrieval.
    pub fn is_retrievable(&self, include_archived: bool) -> bool {
        match self {
            ContextState::Active | ContextState::Stale => true,
            ContextState::Archived => include_archived,
            ContextState::Purged => false,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ContextState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown context state: {s}"))
    }
}

fn default_source() -> String {
    "orchestrator".to_string()
}

fn default_usefulness() -> f64 {
    0.5
}

/// One stored fragment of agent history.
///
/// Content, type, iteration, tags, source and metadata never change after
/// insertion. `state` is written only by lifecycle transitions; the access
/// fields (`last_retrieved_at`, `retrieval_count`, `usefulness_score`) are
/// advisory and updated best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ContextId,
    pub content: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(rename = "type")]
    pub context_type: ContextType,
    pub iteration: u64,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_retrieved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retrieval_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "default_usefulness")]
    pub usefulness_score: f64,
}

impl ContextItem {
    /// Timestamp the lifecycle clock counts from.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_retrieved_at
            .map_or(self.created_at, |t| t.max(self.created_at))
    }

    /// Projection without the embedding vector, as returned over the wire.
    pub fn view(&self) -> ContextItemView {
        ContextItemView {
            id: self.id,
            content: self.content.clone(),
            context_type: self.context_type,
            iteration: self.iteration,
            state: self.state,
            created_at: self.created_at,
            last_retrieved_at: self.last_retrieved_at,
            retrieval_count: self.retrieval_count,
            tags: self.tags.clone(),
            source: self.source.clone(),
            metadata: self.metadata.clone(),
            usefulness_score: self.usefulness_score,
            embedding_dimension: self.embedding.len(),
        }
    }
}

/// Context item as exposed by the HTTP API: identical to [`ContextItem`]
/// except that the vector is summarized by its dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItemView {
    pub id: ContextId,
    pub content: String,
    #[serde(rename = "type")]
    pub context_type: ContextType,
    pub iteration: u64,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub retrieval_count: u64,
    pub tags: Vec<String>,
    pub source: String,
    pub metadata: serde_json::Value,
    pub usefulness_score: f64,
    pub embedding_dimension: usize,
}

/// Caller-supplied fields of a new context item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContextItem {
    pub content: String,
    #[serde(rename = "type")]
    pub context_type: ContextType,
    pub iteration: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewContextItem {
    pub fn new(content: impl Into<String>, context_type: ContextType, iteration: u64) -> Self {
        Self {
            content: content.into(),
            context_type,
            iteration,
            tags: Vec::new(),
            source: default_source(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-iteration summary written once by the orchestration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u64,
    #[serde(default)]
    pub task: Option<String>,
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
}

impl IterationResult {
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }
}

/// Metadata filters applied to retrieval candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    /// Restrict to these types (None = all)
    #[serde(default)]
    pub types: Option<Vec<ContextType>>,
    #[serde(default)]
    pub min_iteration: Option<u64>,
    #[serde(default)]
    pub max_iteration: Option<u64>,
    /// Match items carrying any of these tags (empty = no tag filter)
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub include_archived: bool,
}

impl RetrievalFilters {
    /// Metadata-only predicate; state eligibility is checked separately.
    pub fn matches(&self, item: &ContextItem) -> bool {
        metadata_matches(
            self.types.as_deref(),
            self.min_iteration,
            self.max_iteration,
            &self.tags,
            item,
        )
    }
}

fn metadata_matches(
    types: Option<&[ContextType]>,
    min_iteration: Option<u64>,
    max_iteration: Option<u64>,
    tags: &[String],
    item: &ContextItem,
) -> bool {
    if let Some(types) = types
        && !types.contains(&item.context_type)
    {
        return false;
    }
    if min_iteration.is_some_and(|min| item.iteration < min) {
        return false;
    }
    if max_iteration.is_some_and(|max| item.iteration > max) {
        return false;
    }
    tags.is_empty() || item.tags.iter().any(|t| tags.contains(t))
}

/// Selection applied by `list`; unlike retrieval it sees every state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub types: Option<Vec<ContextType>>,
    #[serde(default)]
    pub states: Option<Vec<ContextState>>,
    #[serde(default)]
    pub min_iteration: Option<u64>,
    #[serde(default)]
    pub max_iteration: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ListFilter {
    pub fn of_type(context_type: ContextType) -> Self {
        Self {
            types: Some(vec![context_type]),
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &ContextItem) -> bool {
        if let Some(states) = &self.states
            && !states.contains(&item.state)
        {
            return false;
        }
        metadata_matches(
            self.types.as_deref(),
            self.min_iteration,
            self.max_iteration,
            &self.tags,
            item,
        )
    }
}

/// Which ranking signal contributed most to a hit's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    Semantic,
    Recency,
    TypePriority,
}

/// Individual ranking signals of a hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub similarity: f64,
    pub recency: f64,
    pub type_priority: f64,
}

/// One ranked entry of a retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub item: ContextItemView,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub reason: MatchReason,
}

/// Ranked, deduplicated and budget-bounded answer to one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievalHit>,
    pub embedding_time_ms: f64,
    pub search_time_ms: f64,
    pub total_candidates: usize,
    pub deduplicated: usize,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn ids(&self) -> Vec<ContextId> {
        self.hits.iter().map(|h| h.item.id).collect()
    }
}

/// Corpus statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_items: usize,
    pub items_by_state: BTreeMap<String, usize>,
    pub items_by_type: BTreeMap<String, usize>,
    pub corpus_size: usize,
    pub index_size: usize,
    pub hot_index_size: usize,
    pub cold_index_size: usize,
    pub content_bytes: usize,
    pub avg_usefulness_score: f64,
    pub oldest_item_iteration: u64,
    pub newest_item_iteration: u64,
    pub current_iteration: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(context_type: ContextType, iteration: u64, tags: &[&str]) -> ContextItem {
        ContextItem {
            id: ContextId(1),
            content: "x".to_string(),
            embedding: vec![1.0, 0.0],
            context_type,
            iteration,
            state: ContextState::Active,
            created_at: Utc::now(),
            last_retrieved_at: None,
            retrieval_count: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source: "orchestrator".to_string(),
            metadata: serde_json::Value::Null,
            usefulness_score: 0.5,
        }
    }

    #[test]
    fn test_state_order_is_monotone() {
        assert!(ContextState::Active.can_transition_to(ContextState::Stale));
        assert!(ContextState::Active.can_transition_to(ContextState::Purged));
        assert!(ContextState::Stale.can_transition_to(ContextState::Archived));
        assert!(!ContextState::Archived.can_transition_to(ContextState::Active));
        assert!(!ContextState::Stale.can_transition_to(ContextState::Stale));
        assert!(!ContextState::Purged.can_transition_to(ContextState::Archived));
    }

    #[test]
    fn test_retrievable_states() {
        assert!(ContextState::Active.is_retrievable(false));
        assert!(ContextState::Stale.is_retrievable(false));
        assert!(!ContextState::Archived.is_retrievable(false));
        assert!(ContextState::Archived.is_retrievable(true));
        assert!(!ContextState::Purged.is_retrievable(true));
    }

    #[test]
    fn test_context_type_parse() {
        assert_eq!("ERROR".parse::<ContextType>().unwrap(), ContextType::Error);
        assert_eq!(
            "tool_result".parse::<ContextType>().unwrap(),
            ContextType::ToolResult
        );
        assert!("skill".parse::<ContextType>().is_err());
    }

    #[test]
    fn test_item_serializes_type_field() {
        let json = serde_json::to_value(item(ContextType::FileChange, 3, &[])).unwrap();
        assert_eq!(json["type"], "file_change");
        assert_eq!(json["state"], "active");
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn test_view_hides_embedding() {
        let json = serde_json::to_value(item(ContextType::Task, 1, &[]).view()).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["embedding_dimension"], 2);
    }

    #[test]
    fn test_filters() {
        let filters = RetrievalFilters {
            types: Some(vec![ContextType::Error]),
            min_iteration: Some(2),
            max_iteration: Some(5),
            tags: vec!["auth".to_string()],
            include_archived: false,
        };

        assert!(filters.matches(&item(ContextType::Error, 3, &["auth", "db"])));
        assert!(!filters.matches(&item(ContextType::Task, 3, &["auth"])));
        assert!(!filters.matches(&item(ContextType::Error, 1, &["auth"])));
        assert!(!filters.matches(&item(ContextType::Error, 6, &["auth"])));
        assert!(!filters.matches(&item(ContextType::Error, 3, &["db"])));
        assert!(RetrievalFilters::default().matches(&item(ContextType::Task, 0, &[])));
    }

    #[test]
    fn test_last_touched_prefers_retrieval() {
        let mut it = item(ContextType::Task, 1, &[]);
        assert_eq!(it.last_touched(), it.created_at);
        let later = it.created_at + chrono::Duration::hours(2);
        it.last_retrieved_at = Some(later);
        assert_eq!(it.last_touched(), later);
    }
}
