//! Per-database document storage.
//!
//! Every write is stamped with the next etag of the database and recorded in its change vector.
//! Deletes leave tombstones behind, which are purged only once every registered participant
//! (such as the periodic backup runner) has processed them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Tree;

use crate::change_vector;
use crate::database::Database;
use crate::error::{ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::utils;

pub(crate) const PREFIX_ITEM: &[u8; 1] = b"e";
const PREFIX_ID: &str = "i/";
const KEY_LAST_ETAG: &[u8] = b"m/last_etag";
const KEY_CHANGE_VECTOR: &[u8] = b"m/change_vector";
const KEY_DATABASE_ID: &[u8] = b"m/database_id";
const KEY_DOCUMENT_COUNT: &[u8] = b"m/document_count";
const KEY_LAST_TOMBSTONE_ETAG: &[u8] = b"m/last_tombstone_etag";

/// The pseudo collection name covering every document collection.
pub const ALL_DOCUMENTS_COLLECTION: &str = "@all_docs";
/// The pseudo collection name covering every time series.
pub const ALL_TIME_SERIES: &str = "@all_timeseries";
/// The pseudo collection name covering every counter.
pub const ALL_COUNTERS: &str = "@all_counters";

/// The kinds of tombstone a participant may report progress for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TombstoneType {
    Documents,
    TimeSeries,
    Counters,
}

/// A component which must process tombstones before they may be purged.
pub trait TombstoneCleanerParticipant: Send + Sync {
    /// A name used in logs.
    fn identifier(&self) -> &str;

    /// The last processed tombstone etag per collection.
    ///
    /// `None` means this participant places no constraint on the purge.
    fn last_processed_tombstones_per_collection(&self, tombstone_type: TombstoneType) -> Result<Option<HashMap<String, i64>>>;
}

/// A document, or the tombstone of a deleted document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: String,
    pub collection: String,
    pub etag: i64,
    pub change_vector: String,
    pub last_modified: DateTime<Utc>,
    /// `None` for tombstones.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl StoredItem {
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// The document store of a single database.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<DocumentStoreInner>,
}

struct DocumentStoreInner {
    node_tag: String,
    database_id: String,
    tree: Tree,
    /// Serializes etag allocation.
    write_lock: parking_lot::Mutex<()>,
}

impl DocumentStore {
    /// Open the store of the given database, allocating its id on first use.
    pub async fn open(db: &Database, database: &str, node_tag: &str) -> Result<Self> {
        let tree = db.get_documents_tree(database).await?;
        let ivtree = tree.clone();
        let database_id = Database::spawn_blocking(move || -> Result<String> {
            if let Some(id) = ivtree.get(KEY_DATABASE_ID).context(ERR_ITER_FAILURE)? {
                return Ok(String::from_utf8_lossy(&id).to_string());
            }
            let id = base64::encode(uuid::Uuid::new_v4().as_bytes()).trim_end_matches('=').to_string();
            ivtree.insert(KEY_DATABASE_ID, id.as_bytes()).context("error persisting database id")?;
            ivtree.flush().context(ERR_DB_FLUSH)?;
            Ok(id)
        })
        .await??;
        Ok(Self {
            inner: Arc::new(DocumentStoreInner {
                node_tag: node_tag.to_string(),
                database_id,
                tree,
                write_lock: parking_lot::Mutex::new(()),
            }),
        })
    }

    /// The id of this database instance, as it appears in change vectors.
    pub fn database_id(&self) -> &str {
        &self.inner.database_id
    }

    /// Write a document, returning the stored item.
    pub async fn put(&self, id: &str, collection: &str, data: serde_json::Value) -> Result<StoredItem> {
        let (store, id, collection) = (self.clone(), id.to_string(), collection.to_string());
        Database::spawn_blocking(move || store.write(id, collection, Some(data))).await?
    }

    /// Delete a document, leaving a tombstone. Returns `None` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<Option<StoredItem>> {
        let store = self.clone();
        let id = id.to_string();
        Database::spawn_blocking(move || -> Result<Option<StoredItem>> {
            let existing = match store.get(&id)? {
                Some(item) if !item.is_tombstone() => item,
                _ => return Ok(None),
            };
            store.write(id, existing.collection, None).map(Some)
        })
        .await?
    }

    fn write(&self, id: String, collection: String, data: Option<serde_json::Value>) -> Result<StoredItem> {
        let _guard = self.inner.write_lock.lock();
        let tree = &self.inner.tree;
        let existing = self.get(&id)?;
        let etag = self.read_last_etag()? + 1;

        let entry = format!("{}:{}-{}", self.inner.node_tag, etag, self.inner.database_id);
        let item_cv = change_vector::merge(existing.as_ref().map(|item| item.change_vector.as_str()), Some(&entry));
        let (_, db_cv) = self.read_last_etag_and_change_vector()?;
        let db_cv = change_vector::merge(db_cv.as_deref(), Some(&entry));

        let mut count = self.count_documents()?;
        let was_live = existing.as_ref().map(|item| !item.is_tombstone()).unwrap_or(false);
        match (was_live, data.is_some()) {
            (false, true) => count += 1,
            (true, false) => count -= 1,
            _ => (),
        }

        let item = StoredItem {
            id: id.clone(),
            collection,
            etag,
            change_vector: item_cv,
            last_modified: Utc::now(),
            data,
        };
        let mut batch = sled::Batch::default();
        if let Some(existing) = existing.as_ref() {
            batch.remove(&utils::encode_byte_prefix(PREFIX_ITEM, existing.etag as u64));
        }
        batch.insert(&utils::encode_byte_prefix(PREFIX_ITEM, etag as u64), utils::encode_model(&item)?);
        batch.insert(format!("{}{}", PREFIX_ID, id).as_bytes(), &utils::encode_u64(etag as u64));
        batch.insert(KEY_LAST_ETAG, &utils::encode_u64(etag as u64));
        batch.insert(KEY_CHANGE_VECTOR, db_cv.as_bytes());
        batch.insert(KEY_DOCUMENT_COUNT, &utils::encode_u64(count as u64));
        if item.is_tombstone() {
            batch.insert(KEY_LAST_TOMBSTONE_ETAG, &utils::encode_u64(etag as u64));
        }
        tree.apply_batch(batch).context("error applying document write batch")?;
        tree.flush().context(ERR_DB_FLUSH)?;
        Ok(item)
    }

    /// Read a document or tombstone by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredItem>> {
        let tree = &self.inner.tree;
        let etag = match tree.get(format!("{}{}", PREFIX_ID, id)).context(ERR_ITER_FAILURE)? {
            Some(etag) => utils::decode_u64(&etag)?,
            None => return Ok(None),
        };
        match tree.get(utils::encode_byte_prefix(PREFIX_ITEM, etag)).context(ERR_ITER_FAILURE)? {
            Some(item) => Ok(Some(utils::decode_model(&item)?)),
            None => Ok(None),
        }
    }

    fn read_u64(&self, key: &[u8]) -> Result<u64> {
        match self.inner.tree.get(key).context(ERR_ITER_FAILURE)? {
            Some(val) => utils::decode_u64(&val),
            None => Ok(0),
        }
    }

    /// The etag of the last write to this database.
    pub fn read_last_etag(&self) -> Result<i64> {
        Ok(self.read_u64(KEY_LAST_ETAG)? as i64)
    }

    /// The last etag along with the database change vector.
    pub fn read_last_etag_and_change_vector(&self) -> Result<(i64, Option<String>)> {
        let cv = self
            .inner
            .tree
            .get(KEY_CHANGE_VECTOR)
            .context(ERR_ITER_FAILURE)?
            .map(|cv| String::from_utf8_lossy(&cv).to_string());
        Ok((self.read_last_etag()?, cv))
    }

    /// The number of live documents.
    pub fn count_documents(&self) -> Result<i64> {
        Ok(self.read_u64(KEY_DOCUMENT_COUNT)? as i64)
    }

    /// The etag of the last tombstone written.
    pub fn last_tombstone_etag(&self) -> Result<i64> {
        Ok(self.read_u64(KEY_LAST_TOMBSTONE_ETAG)? as i64)
    }

    /// Iterate over every document and tombstone with an etag greater than `etag`, in etag order.
    pub fn items_after(&self, etag: i64) -> impl Iterator<Item = Result<StoredItem>> {
        let start = utils::encode_byte_prefix(PREFIX_ITEM, etag.max(0) as u64 + 1);
        let end = utils::encode_byte_prefix(PREFIX_ITEM, u64::MAX);
        self.inner.tree.range(start..=end).map(|kv| {
            let (_, val) = kv.context(ERR_ITER_FAILURE)?;
            utils::decode_model::<StoredItem>(&val)
        })
    }

    /// Purge tombstones which every participant has processed, returning the number purged.
    #[tracing::instrument(level = "debug", skip(self, participants))]
    pub async fn cleanup_tombstones(&self, participants: Vec<Arc<dyn TombstoneCleanerParticipant>>) -> Result<usize> {
        let store = self.clone();
        Database::spawn_blocking(move || -> Result<usize> {
            let mut max_etag = store.last_tombstone_etag()?;
            for participant in participants.iter() {
                let processed = participant
                    .last_processed_tombstones_per_collection(TombstoneType::Documents)
                    .with_context(|| format!("error reading tombstone progress of {}", participant.identifier()))?;
                if let Some(etag) = processed.and_then(|map| map.get(ALL_DOCUMENTS_COLLECTION).copied()) {
                    max_etag = max_etag.min(etag);
                }
            }
            if max_etag <= 0 {
                return Ok(0);
            }

            let _guard = store.inner.write_lock.lock();
            let mut batch = sled::Batch::default();
            let mut purged = 0;
            let end = utils::encode_byte_prefix(PREFIX_ITEM, max_etag as u64);
            for kv in store.inner.tree.range(utils::encode_byte_prefix(PREFIX_ITEM, 0)..=end) {
                let (key, val) = kv.context(ERR_ITER_FAILURE)?;
                let item: StoredItem = utils::decode_model(&val)?;
                if !item.is_tombstone() {
                    continue;
                }
                batch.remove(key);
                batch.remove(format!("{}{}", PREFIX_ID, item.id).as_bytes());
                purged += 1;
            }
            store.inner.tree.apply_batch(batch).context("error purging tombstones")?;
            store.inner.tree.flush().context(ERR_DB_FLUSH)?;
            Ok(purged)
        })
        .await?
    }
}
