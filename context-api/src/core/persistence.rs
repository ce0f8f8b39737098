//! On-disk layout of a corpus directory.
//!
//! `items.json` holds the context table and is the source of truth.
//! `index.json` holds the vector index snapshot and is only a cache; any
//! problem reading it results in a rebuild from the table.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::StoreResult;
use super::index::IndexSnapshot;
use crate::models::context::ContextItem;

pub const ITEMS_FILE: &str = "items.json";
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub schema_version: u32,
    pub embedding_dimension: usize,
    /// Next identifier to hand out; ids are never reused across restarts
    pub next_id: u64,
    pub current_iteration: u64,
    pub items: Vec<ContextItem>,
}

#[derive(Debug, Clone)]
pub struct CorpusFiles {
    dir: PathBuf,
}

impl CorpusFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn items_path(&self) -> PathBuf {
        self.dir.join(ITEMS_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn load_table(&self) -> StoreResult<Option<TableSnapshot>> {
        read_json(&self.items_path())
    }

    /// Missing and unreadable index files both yield `None`.
    pub fn load_index(&self) -> Option<IndexSnapshot> {
        match read_json(&self.index_path()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Index snapshot unreadable");
                None
            },
        }
    }

    pub fn save(&self, table: &TableSnapshot, index: &IndexSnapshot) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        // Table first: a crash between the two writes leaves a stale index,
        // which is detected and rebuilt on open.
        write_json_atomic(&self.items_path(), table)?;
        write_json_atomic(&self.index_path(), index)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
