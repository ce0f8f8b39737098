//! Request and response envelopes of the HTTP API.
//!
//! Every body is wrapped in [`Versioned`], which adds the `schema_version`
//! field next to the payload's own fields.

use serde::{Deserialize, Serialize};

use crate::core::error::StoreResult;
use crate::core::service::ensure_schema_version;
use crate::models::context::{
    ContextId, ContextItemView, ContextState, ListFilter, RetrievalFilters, SCHEMA_VERSION,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub schema_version: u32,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Versioned<T> {
    pub fn new(body: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            body,
        }
    }

    /// Unwrap the payload after checking it was written for this schema.
    pub fn into_checked(self) -> StoreResult<T> {
        ensure_schema_version(self.schema_version)?;
        Ok(self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveContextBody {
    pub query: String,
    #[serde(default)]
    pub filters: RetrievalFilters,
    /// Falls back to the configured default budget
    #[serde(default)]
    pub budget: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStateBody {
    pub state: ContextState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkUsefulBody {
    pub helpful: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredId {
    pub id: ContextId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIds {
    pub ids: Vec<ContextId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemBody {
    pub item: ContextItemView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemList {
    pub items: Vec<ContextItemView>,
    pub total: usize,
}

impl ItemList {
    pub fn new(items: Vec<ContextItemView>) -> Self {
        Self {
            total: items.len(),
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsefulnessBody {
    pub id: ContextId,
    pub usefulness_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildBody {
    pub entries: usize,
}

/// Query string of `GET /v1/context`. List values are comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub states: Option<String>,
    #[serde(default)]
    pub min_iteration: Option<u64>,
    #[serde(default)]
    pub max_iteration: Option<u64>,
    #[serde(default)]
    pub tags: Option<String>,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<ListFilter, String> {
        Ok(ListFilter {
            types: parse_list(self.types.as_deref())?,
            states: parse_list(self.states.as_deref())?,
            min_iteration: self.min_iteration,
            max_iteration: self.max_iteration,
            tags: split_list(self.tags.as_deref()),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub last_n: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LearningsQuery {
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub min_usefulness: Option<f64>,
}

impl LearningsQuery {
    pub fn tag_list(&self) -> Vec<String> {
        split_list(self.tags.as_deref())
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_list<T: std::str::FromStr<Err = String>>(raw: Option<&str>) -> Result<Option<Vec<T>>, String> {
    if raw.is_none() {
        return Ok(None);
    }
    split_list(raw)
        .iter()
        .map(|value| value.parse())
        .collect::<Result<Vec<T>, String>>()
        .map(Some)
}
