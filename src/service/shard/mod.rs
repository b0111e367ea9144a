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

//! The set of shards hosted by this data node, keyed by `(index, shard_id)`.

pub mod analysis;
pub mod index;
pub mod search;

use std::{path::PathBuf, sync::Arc};

use config::{
    get_config,
    meta::{
        cluster::NodeStats,
        index::{IndexSettings, Mappings},
    },
    metrics, RwHashMap,
};
use infra::errors::{Error, Result};
use once_cell::sync::Lazy;

pub use index::Shard;

pub static SHARD_MANAGER: Lazy<ShardManager> = Lazy::new(ShardManager::new);

pub struct ShardManager {
    shards: RwHashMap<String, Arc<Shard>>,
    data_dir: PathBuf,
}

fn shard_key(index: &str, shard_id: u32) -> String {
    format!("{index}/{shard_id}")
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardManager {
    pub fn new() -> Self {
        let cfg = get_config();
        ShardManager {
            shards: Default::default(),
            data_dir: PathBuf::from(&cfg.common.data_dir).join("shards"),
        }
    }

    /// Create a shard on master directive. Idempotent: an existing shard for
    /// the same key is kept as is.
    pub fn create_shard(
        &self,
        index: &str,
        shard_id: u32,
        is_primary: bool,
        settings: IndexSettings,
        mappings: Mappings,
    ) -> Result<()> {
        let key = shard_key(index, shard_id);
        if self.shards.contains_key(&key) {
            return Ok(());
        }
        let dir = self.data_dir.join(index).join(shard_id.to_string());
        match Shard::open(&dir, index, shard_id, is_primary, settings, mappings) {
            Ok(shard) => {
                log::info!("[SHARD] created {key} (primary: {is_primary})");
                self.shards.insert(key, Arc::new(shard));
                Ok(())
            }
            Err(e) => {
                log::error!("[SHARD] open {key} failed: {e}");
                Err(e)
            }
        }
    }

    pub fn delete_shard(&self, index: &str, shard_id: u32) -> Result<()> {
        let key = shard_key(index, shard_id);
        match self.shards.remove(&key) {
            Some((_, shard)) => {
                shard.destroy()?;
                log::info!("[SHARD] deleted {key}");
                Ok(())
            }
            None => Err(Error::NotFound(format!("shard {key}"))),
        }
    }

    pub fn get_shard(&self, index: &str, shard_id: u32) -> Result<Arc<Shard>> {
        self.shards
            .get(&shard_key(index, shard_id))
            .map(|s| s.clone())
            .ok_or_else(|| Error::NotFound(format!("shard {}", shard_key(index, shard_id))))
    }

    pub fn delete_index_shards(&self, index: &str) -> Result<()> {
        let doomed: Vec<String> = self
            .shards
            .iter()
            .filter(|e| e.key().starts_with(&format!("{index}/")))
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            if let Some((_, shard)) = self.shards.remove(&key) {
                shard.destroy()?;
            }
        }
        Ok(())
    }

    pub fn all_shards(&self) -> Vec<Arc<Shard>> {
        self.shards.iter().map(|e| e.value().clone()).collect()
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn node_stats(&self) -> NodeStats {
        let mut doc_count = 0;
        for entry in self.shards.iter() {
            doc_count += entry.value().doc_count();
        }
        NodeStats {
            shard_count: self.shard_count(),
            doc_count,
            disk_usage_percent: 0.0,
            cpu_usage_percent: 0.0,
        }
    }

    /// Refresh every dirty shard whose refresh interval has elapsed; driven
    /// by the data node's refresh ticker.
    pub async fn refresh_dirty(&self) {
        for shard in self.all_shards() {
            if !shard.is_dirty() || !shard.refresh_due() {
                continue;
            }
            if let Err(e) = shard.refresh().await {
                log::warn!(
                    "[SHARD] refresh {}/{} failed: {e}",
                    shard.index_name,
                    shard.shard_id
                );
                continue;
            }
            metrics::SHARD_DOC_COUNT
                .with_label_values(&[shard.index_name.as_str(), &shard.shard_id.to_string()])
                .set(shard.doc_count() as i64);
            metrics::SHARD_BYTE_SIZE
                .with_label_values(&[shard.index_name.as_str(), &shard.shard_id.to_string()])
                .set(shard.byte_size() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::utils::json::json;

    fn manager(dir: &tempfile::TempDir) -> ShardManager {
        ShardManager {
            shards: Default::default(),
            data_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_shard("logs", 0, true, IndexSettings::default(), Mappings::default())
            .unwrap();
        mgr.create_shard("logs", 0, true, IndexSettings::default(), Mappings::default())
            .unwrap();
        assert_eq!(mgr.shard_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        assert!(matches!(
            mgr.delete_shard("logs", 0),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_node_stats_counts_docs() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.create_shard("logs", 0, true, IndexSettings::default(), Mappings::default())
            .unwrap();
        let shard = mgr.get_shard("logs", 0).unwrap();
        shard
            .index_document("d1", json!({"msg": "hello"}))
            .await
            .unwrap();
        shard.refresh().await.unwrap();
        let stats = mgr.node_stats();
        assert_eq!(stats.shard_count, 1);
        assert_eq!(stats.doc_count, 1);
    }

    #[tokio::test]
    async fn test_delete_index_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        for shard_id in 0..3 {
            mgr.create_shard("logs", shard_id, true, IndexSettings::default(), Mappings::default())
                .unwrap();
        }
        mgr.create_shard("other", 0, true, IndexSettings::default(), Mappings::default())
            .unwrap();
        mgr.delete_index_shards("logs").unwrap();
        assert_eq!(mgr.shard_count(), 1);
    }
}
