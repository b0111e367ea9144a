// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! One shard's storage: stored documents plus the inverted index over text
//! fields. Writers mutate the live data under the shard write lock; searches
//! run against an immutable reader snapshot republished on refresh, so a
//! search never observes a partially-indexed document.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use config::{
    get_config,
    meta::{
        cluster::ShardState,
        index::{FieldType, IndexSettings, Mappings},
    },
    utils::{json, time},
};
use hashbrown::HashMap;
use infra::errors::{Error, Result};

use super::analysis::AnalyzerRegistry;

const SEGMENT_FILE: &str = "segment.json";

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredDocument {
    pub source: json::Value,
    pub index_time: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Posting {
    pub doc_id: String,
    pub positions: Vec<u32>,
}

/// field -> term -> postings
pub type Inverted = HashMap<String, HashMap<String, Vec<Posting>>>;

#[derive(Clone, Default)]
pub struct ShardData {
    pub documents: HashMap<String, Arc<StoredDocument>>,
    pub inverted: Inverted,
    pub byte_size: u64,
}

impl ShardData {
    pub fn doc_count(&self) -> u64 {
        self.documents.len() as u64
    }

    pub fn postings(&self, field: &str, term: &str) -> Option<&Vec<Posting>> {
        self.inverted.get(field).and_then(|terms| terms.get(term))
    }

    /// Document frequency of a term in a field.
    pub fn doc_freq(&self, field: &str, term: &str) -> usize {
        self.postings(field, term).map_or(0, |p| p.len())
    }
}

pub struct Shard {
    pub index_name: String,
    pub shard_id: u32,
    pub is_primary: bool,
    pub settings: IndexSettings,
    pub mappings: Mappings,
    state: parking_lot::RwLock<ShardState>,
    /// Write lock: index/delete/refresh run under the write half; commit
    /// takes the read half so it serializes against writers only.
    live: tokio::sync::RwLock<ShardData>,
    /// Immutable searcher view, atomically republished by refresh. Readers
    /// holding a snapshot are never blocked by writers.
    reader: ArcSwap<ShardData>,
    dirty: AtomicBool,
    last_commit_micros: AtomicI64,
    last_refresh_micros: AtomicI64,
    pub search_count: AtomicU64,
    pub index_count: AtomicU64,
    dir: PathBuf,
    analyzers: AnalyzerRegistry,
}

impl Shard {
    /// Open (or create) the shard under `dir`. A persisted segment is loaded
    /// and its postings rebuilt; open failure leaves nothing behind.
    pub fn open(
        dir: &Path,
        index_name: &str,
        shard_id: u32,
        is_primary: bool,
        settings: IndexSettings,
        mappings: Mappings,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let shard = Shard {
            index_name: index_name.to_string(),
            shard_id,
            is_primary,
            settings,
            mappings,
            state: parking_lot::RwLock::new(ShardState::Initializing),
            live: tokio::sync::RwLock::new(ShardData::default()),
            reader: ArcSwap::from(Arc::new(ShardData::default())),
            dirty: AtomicBool::new(false),
            last_commit_micros: AtomicI64::new(0),
            last_refresh_micros: AtomicI64::new(0),
            search_count: AtomicU64::new(0),
            index_count: AtomicU64::new(0),
            dir: dir.to_path_buf(),
            analyzers: AnalyzerRegistry::new(),
        };
        shard.load_segment()?;
        *shard.state.write() = ShardState::Started;
        Ok(shard)
    }

    fn load_segment(&self) -> Result<()> {
        let path = self.dir.join(SEGMENT_FILE);
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        let docs: BTreeMap<String, StoredDocument> = json::from_slice(&bytes)?;
        let mut data = self
            .live
            .try_write()
            .map_err(|_| Error::Internal("shard busy during open".to_string()))?;
        for (doc_id, doc) in docs {
            let doc = Arc::new(doc);
            index_into(&mut data, &self.mappings, &self.analyzers, &doc_id, doc)?;
        }
        let snapshot = data.clone();
        drop(data);
        self.reader.store(Arc::new(snapshot));
        log::info!(
            "[SHARD] loaded {}/{} with {} docs",
            self.index_name,
            self.shard_id,
            self.reader.load().doc_count()
        );
        Ok(())
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ShardState) {
        *self.state.write() = state;
    }

    fn check_started(&self) -> Result<()> {
        let state = self.state();
        if state != ShardState::Started {
            return Err(Error::FailedPrecondition(format!(
                "shard {}/{} is {}, not STARTED",
                self.index_name, self.shard_id, state
            )));
        }
        Ok(())
    }

    /// Index one document. Not visible to searches until commit + refresh.
    pub async fn index_document(&self, doc_id: &str, source: json::Value) -> Result<()> {
        self.check_started()?;
        if doc_id.is_empty() {
            return Err(Error::InvalidArgument("doc id must not be empty".to_string()));
        }
        if !source.is_object() {
            return Err(Error::InvalidArgument(
                "document body must be a JSON object".to_string(),
            ));
        }
        let doc = Arc::new(StoredDocument {
            source,
            index_time: time::now_micros(),
        });
        let mut data = self.live.write().await;
        if data.documents.contains_key(doc_id) {
            remove_from(&mut data, &self.mappings, &self.analyzers, doc_id);
        }
        index_into(&mut data, &self.mappings, &self.analyzers, doc_id, doc)?;
        drop(data);
        self.dirty.store(true, Ordering::Release);
        self.index_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete is idempotent: deleting an absent document is a no-op.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        self.check_started()?;
        let mut data = self.live.write().await;
        if !data.documents.contains_key(doc_id) {
            return Ok(false);
        }
        remove_from(&mut data, &self.mappings, &self.analyzers, doc_id);
        drop(data);
        self.dirty.store(true, Ordering::Release);
        Ok(true)
    }

    /// Stored body, from the published reader view.
    pub fn get_document(&self, doc_id: &str) -> Option<json::Value> {
        self.reader
            .load()
            .documents
            .get(doc_id)
            .map(|doc| doc.source.clone())
    }

    /// The immutable snapshot searches run against.
    pub fn snapshot(&self) -> Arc<ShardData> {
        self.reader.load_full()
    }

    /// Persist the live data durably. Atomic: written to a temp file and
    /// renamed over the old segment.
    pub async fn commit(&self) -> Result<()> {
        self.check_started()?;
        let data = self.live.read().await;
        let docs: BTreeMap<&String, &StoredDocument> = data
            .documents
            .iter()
            .map(|(id, doc)| (id, doc.as_ref()))
            .collect();
        let bytes = json::to_vec(&docs)?;
        drop(data);
        let tmp = self.dir.join(format!("{SEGMENT_FILE}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.dir.join(SEGMENT_FILE))?;
        self.dirty.store(false, Ordering::Release);
        self.last_commit_micros
            .store(time::now_micros(), Ordering::Release);
        Ok(())
    }

    /// Make buffered writes visible to new searchers.
    pub async fn refresh(&self) -> Result<()> {
        self.check_started()?;
        let data = self.live.write().await;
        let snapshot = data.clone();
        drop(data);
        self.reader.store(Arc::new(snapshot));
        self.last_refresh_micros
            .store(time::now_micros(), Ordering::Release);
        Ok(())
    }

    /// True once the configured refresh interval has elapsed since the last
    /// refresh; drives the background refresh ticker.
    pub fn refresh_due(&self) -> bool {
        let interval_micros = (self.settings.refresh_interval_ms * 1000) as i64;
        time::now_micros() - self.last_refresh_micros.load(Ordering::Acquire) >= interval_micros
    }

    pub async fn flush(&self) -> Result<()> {
        self.commit().await
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn last_commit_micros(&self) -> i64 {
        self.last_commit_micros.load(Ordering::Acquire)
    }

    pub fn analyzers(&self) -> &AnalyzerRegistry {
        &self.analyzers
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.load().doc_count()
    }

    pub fn byte_size(&self) -> u64 {
        self.reader.load().byte_size
    }

    /// Remove this shard's on-disk data.
    pub fn destroy(&self) -> Result<()> {
        self.set_state(ShardState::Unassigned);
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// True when this field feeds the inverted index.
fn is_indexed(mappings: &Mappings, field: &str, value: &json::Value) -> bool {
    match mappings.field_type(field) {
        Some(FieldType::Text) | Some(FieldType::Keyword) => true,
        Some(_) => false,
        // dynamic mapping: strings are treated as text
        None => value.is_string(),
    }
}

fn analyzer_name<'a>(mappings: &'a Mappings, field: &str, default: &'a str) -> &'a str {
    match mappings.field_type(field) {
        Some(FieldType::Keyword) => "keyword",
        _ => mappings.analyzer(field, default),
    }
}

fn index_into(
    data: &mut ShardData,
    mappings: &Mappings,
    analyzers: &AnalyzerRegistry,
    doc_id: &str,
    doc: Arc<StoredDocument>,
) -> Result<()> {
    let cfg = get_config();
    let default_analyzer = cfg.shard.default_analyzer.as_str();
    for (field, value) in flatten_fields(&doc.source) {
        if !is_indexed(mappings, &field, &value) {
            continue;
        }
        let analyzer = analyzers.get(analyzer_name(mappings, &field, default_analyzer))?;
        let text = json::get_string_value(&value);
        let mut per_term: HashMap<String, Vec<u32>> = HashMap::new();
        for token in analyzer.analyze(&text) {
            per_term.entry(token.term).or_default().push(token.position);
        }
        let terms = data.inverted.entry(field).or_default();
        for (term, positions) in per_term {
            terms.entry(term).or_default().push(Posting {
                doc_id: doc_id.to_string(),
                positions,
            });
        }
    }
    data.byte_size += doc.source.to_string().len() as u64;
    data.documents.insert(doc_id.to_string(), doc);
    Ok(())
}

/// Remove a document and every posting that references it. The doc's own
/// text fields are re-analyzed to find the lists to touch.
fn remove_from(
    data: &mut ShardData,
    mappings: &Mappings,
    analyzers: &AnalyzerRegistry,
    doc_id: &str,
) {
    let Some(doc) = data.documents.remove(doc_id) else {
        return;
    };
    let cfg = get_config();
    let default_analyzer = cfg.shard.default_analyzer.as_str();
    for (field, value) in flatten_fields(&doc.source) {
        if !is_indexed(mappings, &field, &value) {
            continue;
        }
        let Ok(analyzer) = analyzers.get(analyzer_name(mappings, &field, default_analyzer)) else {
            continue;
        };
        let text = json::get_string_value(&value);
        let Some(terms) = data.inverted.get_mut(&field) else {
            continue;
        };
        for token in analyzer.analyze(&text) {
            if let Some(postings) = terms.get_mut(&token.term) {
                postings.retain(|p| p.doc_id != doc_id);
                if postings.is_empty() {
                    terms.remove(&token.term);
                }
            }
        }
    }
    data.byte_size = data
        .byte_size
        .saturating_sub(doc.source.to_string().len() as u64);
}

/// Flatten nested objects into dotted field paths; array elements share the
/// parent path.
pub fn flatten_fields(source: &json::Value) -> Vec<(String, json::Value)> {
    let mut out = Vec::new();
    if let Some(map) = source.as_object() {
        for (key, value) in map {
            flatten_into(key, value, &mut out);
        }
    }
    out
}

fn flatten_into(path: &str, value: &json::Value, out: &mut Vec<(String, json::Value)>) {
    match value {
        json::Value::Object(map) => {
            for (key, value) in map {
                flatten_into(&format!("{path}.{key}"), value, out);
            }
        }
        json::Value::Array(items) => {
            for item in items {
                flatten_into(path, item, out);
            }
        }
        _ => out.push((path.to_string(), value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::utils::json::json;

    fn temp_shard() -> (tempfile::TempDir, Shard) {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::open(
            dir.path(),
            "products",
            0,
            true,
            IndexSettings::default(),
            Mappings::default(),
        )
        .unwrap();
        (dir, shard)
    }

    #[tokio::test]
    async fn test_postings_reference_existing_docs() {
        let (_dir, shard) = temp_shard();
        shard
            .index_document("d1", json!({"title": "Quick Brown Fox"}))
            .await
            .unwrap();
        shard.refresh().await.unwrap();
        let data = shard.snapshot();
        for terms in data.inverted.values() {
            for postings in terms.values() {
                for posting in postings {
                    assert!(data.documents.contains_key(&posting.doc_id));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_visibility_after_commit_refresh() {
        let (_dir, shard) = temp_shard();
        shard
            .index_document("d1", json!({"title": "Quick Brown Fox"}))
            .await
            .unwrap();
        // not visible yet
        assert_eq!(shard.snapshot().doc_freq("title", "quick"), 0);
        shard.commit().await.unwrap();
        shard.refresh().await.unwrap();
        assert_eq!(shard.snapshot().doc_freq("title", "quick"), 1);
        assert!(shard.get_document("d1").is_some());
    }

    #[tokio::test]
    async fn test_delete_idempotent_and_removes_postings() {
        let (_dir, shard) = temp_shard();
        shard
            .index_document("d1", json!({"title": "lazy dog"}))
            .await
            .unwrap();
        shard.refresh().await.unwrap();
        assert!(shard.delete_document("d1").await.unwrap());
        assert!(!shard.delete_document("d1").await.unwrap());
        shard.refresh().await.unwrap();
        let data = shard.snapshot();
        assert_eq!(data.doc_count(), 0);
        assert_eq!(data.doc_freq("title", "lazy"), 0);
    }

    #[tokio::test]
    async fn test_update_replaces_postings() {
        let (_dir, shard) = temp_shard();
        shard
            .index_document("d1", json!({"title": "old words"}))
            .await
            .unwrap();
        shard
            .index_document("d1", json!({"title": "new words"}))
            .await
            .unwrap();
        shard.refresh().await.unwrap();
        let data = shard.snapshot();
        assert_eq!(data.doc_count(), 1);
        assert_eq!(data.doc_freq("title", "old"), 0);
        assert_eq!(data.doc_freq("title", "new"), 1);
        // "words" must appear once, not twice
        assert_eq!(data.doc_freq("title", "word"), 1);
    }

    #[tokio::test]
    async fn test_reopen_restores_segment() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = Shard::open(
                dir.path(),
                "products",
                0,
                true,
                IndexSettings::default(),
                Mappings::default(),
            )
            .unwrap();
            shard
                .index_document("d1", json!({"title": "persisted fox"}))
                .await
                .unwrap();
            shard.commit().await.unwrap();
        }
        let reopened = Shard::open(
            dir.path(),
            "products",
            0,
            true,
            IndexSettings::default(),
            Mappings::default(),
        )
        .unwrap();
        assert_eq!(reopened.doc_count(), 1);
        assert_eq!(reopened.snapshot().doc_freq("title", "persisted"), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_doc_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = Shard::open(
                dir.path(),
                "products",
                0,
                true,
                IndexSettings::default(),
                Mappings::default(),
            )
            .unwrap();
            shard
                .index_document("d1", json!({"title": "volatile"}))
                .await
                .unwrap();
            // no commit
        }
        let reopened = Shard::open(
            dir.path(),
            "products",
            0,
            true,
            IndexSettings::default(),
            Mappings::default(),
        )
        .unwrap();
        assert_eq!(reopened.doc_count(), 0);
    }

    #[test]
    fn test_flatten_fields() {
        let doc = json!({
            "title": "fox",
            "price": 10.0,
            "attrs": {"color": "red", "dims": {"w": 3}},
            "tags": ["a", "b"],
        });
        let fields = flatten_fields(&doc);
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"title"));
        assert!(names.contains(&"attrs.color"));
        assert!(names.contains(&"attrs.dims.w"));
        assert_eq!(names.iter().filter(|n| **n == "tags").count(), 2);
    }

    #[tokio::test]
    async fn test_operations_rejected_unless_started() {
        let (_dir, shard) = temp_shard();
        shard.set_state(ShardState::Relocating);
        let err = shard
            .index_document("d1", json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }
}
