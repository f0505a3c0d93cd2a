//! Durable key-value store backing the queue, agent registry, and cost
//! ledger. One `redb` table per logical collection, one `Store` per
//! table file. Crash safety comes from `redb`'s own write-transaction
//! commit; `Insert` does not return until the transaction has committed.

pub mod backup;

use crate::constants::DEFAULT_BACKUP_RETENTION_COUNT;
use crate::{AgentComError, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const TABLE_NAME: &str = "records";

/// Running counts used to approximate on-disk fragmentation, since
/// `redb` does not expose live-vs-total byte accounting directly. See
/// DESIGN.md Open Question 1.
#[derive(Debug, Default)]
pub struct Health {
    pub inserts: AtomicU64,
    pub deletes: AtomicU64,
    last_mutation_millis: AtomicI64,
}

impl Health {
    pub fn fragmentation_ratio(&self) -> f64 {
        let inserts = self.inserts.load(Ordering::Relaxed);
        let deletes = self.deletes.load(Ordering::Relaxed);
        let total = inserts + deletes;
        if total == 0 {
            0.0
        } else {
            deletes as f64 / total as f64
        }
    }

    fn record_mutation(&self) {
        self.last_mutation_millis
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_mutation_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let millis = self.last_mutation_millis.load(Ordering::Relaxed);
        if millis == 0 {
            None
        } else {
            chrono::DateTime::from_timestamp_millis(millis)
        }
    }

    fn reset(&self) {
        self.inserts.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
    }
}

pub struct HealthMetrics {
    pub record_count: u64,
    pub file_size_bytes: u64,
    pub fragmentation_ratio: f64,
    pub last_mutation_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A single-writer durable table of `String -> T` records.
///
/// Callers are expected to serialize access to a given `Store` the way
/// `TaskQueue`/`GoalBacklog` do: one actor owns the handle, mutations
/// flow through it, and `Fold`/`Lookup` are safe for any reader since
/// `redb` read transactions observe a consistent snapshot.
pub struct Store<T> {
    path: PathBuf,
    db: Mutex<Arc<Database>>,
    health: Health,
    _marker: PhantomData<T>,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self::open_or_quarantine(&path)?;
        Ok(Self {
            path,
            db: Mutex::new(Arc::new(db)),
            health: Health::default(),
            _marker: PhantomData,
        })
    }

    /// On open failure, quarantines the corrupt file and attempts to
    /// restore from the most recent backup under the file's parent
    /// directory (the same directory `BackupMaintainer` archives into)
    /// before giving up. Propagates `Corruption` only if no usable
    /// backup exists or the restored file still fails to open.
    fn open_or_quarantine(path: &Path) -> Result<Database> {
        match Database::create(path) {
            Ok(db) => Ok(db),
            Err(e) => {
                if !path.exists() {
                    return Err(AgentComError::Corruption(e.to_string()));
                }
                warn!(
                    "store at {:?} failed to open ({}), quarantining for recovery",
                    path, e
                );
                let quarantined = path.with_extension(format!(
                    "corrupt-{}",
                    chrono::Utc::now().format("%Y%m%dT%H%M%S")
                ));
                std::fs::rename(path, &quarantined)?;

                let Some(root) = path.parent() else {
                    return Err(AgentComError::Corruption(format!(
                        "store at {:?} quarantined to {:?}: {}",
                        path, quarantined, e
                    )));
                };
                let maintainer = backup::BackupMaintainer::new(root, DEFAULT_BACKUP_RETENTION_COUNT);
                match maintainer.restore(path) {
                    Ok(()) => {
                        info!("restored {:?} from backup after quarantining {:?}", path, quarantined);
                        Database::create(path).map_err(|open_err| {
                            AgentComError::Corruption(format!(
                                "restored {:?} from backup but it still fails to open: {}",
                                path, open_err
                            ))
                        })
                    }
                    Err(restore_err) => Err(AgentComError::Corruption(format!(
                        "store at {:?} quarantined to {:?} ({}); restore from backup also failed: {}",
                        path, quarantined, e, restore_err
                    ))),
                }
            }
        }
    }

    pub async fn insert(&self, key: &str, value: &T) -> Result<()> {
        let db = self.db.lock().await.clone();
        let table_def: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);
        let bytes = serde_json::to_vec(value)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(table_def)?;
                table.insert(key.to_string().as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| AgentComError::Fatal(e.into()))??;
        self.health.inserts.fetch_add(1, Ordering::Relaxed);
        self.health.record_mutation();
        Ok(())
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<T>> {
        let db = self.db.lock().await.clone();
        let table_def: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);
        let key = key.to_string();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = match txn.open_table(table_def) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
        })
        .await
        .map_err(|e| AgentComError::Fatal(e.into()))??;

        match bytes {
            Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await.clone();
        let table_def: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(table_def)?;
                table.remove(key.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| AgentComError::Fatal(e.into()))??;
        self.health.deletes.fetch_add(1, Ordering::Relaxed);
        self.health.record_mutation();
        Ok(())
    }

    /// Folds over every record in the table, applying `f` to each
    /// deserialized value.
    pub async fn fold<A, F>(&self, init: A, mut f: F) -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(A, T) -> A + Send,
    {
        let all = self.all().await?;
        let mut acc = init;
        for v in all {
            acc = f(acc, v);
        }
        Ok(acc)
    }

    pub async fn all(&self) -> Result<Vec<T>> {
        let db = self.db.lock().await.clone();
        let table_def: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);
        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = match txn.open_table(table_def) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::new();
            for entry in table.iter()? {
                let (_, v) = entry?;
                out.push(v.value().to_vec());
            }
            Ok(out)
        })
        .await
        .map_err(|e| AgentComError::Fatal(e.into()))??;

        entries
            .into_iter()
            .map(|b| serde_json::from_slice(&b).map_err(AgentComError::from))
            .collect()
    }

    /// Deletes every record for which `predicate` returns true.
    pub async fn match_delete<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&T) -> bool,
    {
        let db = self.db.lock().await.clone();
        let table_def: TableDefinition<&str, &[u8]> = TableDefinition::new(TABLE_NAME);
        let txn = db.begin_write()?;
        let mut to_remove = Vec::new();
        {
            let table = txn.open_table(table_def)?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let value: T = serde_json::from_slice(v.value())?;
                if predicate(&value) {
                    to_remove.push(k.value().to_string());
                }
            }
        }
        {
            let mut table = txn.open_table(table_def)?;
            for key in &to_remove {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        self.health
            .deletes
            .fetch_add(to_remove.len() as u64, Ordering::Relaxed);
        if !to_remove.is_empty() {
            self.health.record_mutation();
        }
        Ok(to_remove.len())
    }

    pub async fn health_metrics(&self) -> Result<HealthMetrics> {
        let record_count = self.all().await?.len() as u64;
        let file_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(HealthMetrics {
            record_count,
            file_size_bytes,
            fragmentation_ratio: self.health.fragmentation_ratio(),
            last_mutation_at: self.health.last_mutation_at(),
        })
    }

    /// Compacts the underlying file in place. Only safe to call from the
    /// single actor that owns this `Store` handle - `redb::Database::compact`
    /// requires exclusive access.
    pub async fn compact(&self) -> Result<()> {
        let mut guard = self.db.lock().await;
        let db = Arc::get_mut(&mut guard).ok_or_else(|| {
            AgentComError::Store("cannot compact store with live readers".to_string())
        })?;
        db.compact()
            .map_err(|e| AgentComError::Store(e.to_string()))?;
        self.health.reset();
        info!("compacted store at {:?}", self.path);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    struct Dummy {
        n: u32,
    }

    #[tokio::test]
    async fn test_insert_lookup_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Dummy> = Store::open(dir.path().join("test.redb")).unwrap();

        store.insert("a", &Dummy { n: 1 }).await.unwrap();
        assert_eq!(store.lookup("a").await.unwrap(), Some(Dummy { n: 1 }));

        store.delete("a").await.unwrap();
        assert_eq!(store.lookup("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fold_and_match_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Dummy> = Store::open(dir.path().join("test.redb")).unwrap();

        for i in 0..5 {
            store
                .insert(&format!("k{i}"), &Dummy { n: i })
                .await
                .unwrap();
        }

        let sum = store.fold(0u32, |acc, v| acc + v.n).await.unwrap();
        assert_eq!(sum, 0 + 1 + 2 + 3 + 4);

        let removed = store.match_delete(|v| v.n % 2 == 0).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_metrics_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Dummy> = Store::open(dir.path().join("test.redb")).unwrap();
        store.insert("a", &Dummy { n: 1 }).await.unwrap();
        store.delete("a").await.unwrap();

        let metrics = store.health_metrics().await.unwrap();
        assert_eq!(metrics.record_count, 0);
        assert!(metrics.fragmentation_ratio > 0.0);
        assert!(metrics.last_mutation_at.is_some());
    }

    #[tokio::test]
    async fn test_health_metrics_last_mutation_at_none_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let store: Store<Dummy> = Store::open(dir.path().join("test.redb")).unwrap();
        let metrics = store.health_metrics().await.unwrap();
        assert!(metrics.last_mutation_at.is_none());
    }

    #[tokio::test]
    async fn test_open_or_quarantine_restores_from_backup_after_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let store: Store<Dummy> = Store::open(&path).unwrap();
            store.insert("a", &Dummy { n: 1 }).await.unwrap();
        }

        let maintainer = backup::BackupMaintainer::new(dir.path(), 7);
        maintainer.backup(&path).unwrap();

        // Corrupt the file in place so the next open fails.
        std::fs::write(&path, b"not a valid redb file").unwrap();

        let restored: Store<Dummy> = Store::open(&path).unwrap();
        assert_eq!(restored.lookup("a").await.unwrap(), Some(Dummy { n: 1 }));
    }
}
