//! Index-file backend: a flat directory described by `index.json`

use crate::backend::{check_file_name, unknown_id, CacheBackend};
use crate::directory::{remove_if_present, remove_serial_orphans, CacheDirectory};
use crate::error::{CacheError, Result};
use crate::id::EntryId;
use crate::types::{expiry_for, CacheStats, EntryMeta, SweepReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Serialize, Deserialize)]
struct Index {
    next_serial: u64,
    entries: BTreeMap<u64, EntryMeta>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            next_serial: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl Index {
    fn find(&self, file_name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, meta)| meta.file_name == file_name)
            .map(|(serial, _)| *serial)
    }
}

/// A backend that records every entry in a single JSON index.
///
/// The index is rewritten atomically after each change, so serials keep
/// increasing across restarts and entries outlive the process.
pub struct IndexedBackend {
    dir: CacheDirectory,
    default_ttl_secs: u64,
    index: Mutex<Index>,
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    sweep_failures: AtomicU64,
}

impl IndexedBackend {
    /// Open the directory and load its index, failing on a corrupt index
    pub async fn open(cache_dir: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        let dir = CacheDirectory::open(cache_dir).await?;
        let index_path = dir.path().join(INDEX_FILE);

        let mut index = match fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice::<Index>(&bytes).map_err(|e| {
                CacheError::storage(
                    &index_path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Index::default(),
            Err(e) => return Err(CacheError::storage(&index_path, e)),
        };
        if let Some(last) = index.entries.keys().next_back() {
            let after_last = last.checked_add(1).ok_or_else(|| {
                CacheError::storage(
                    &index_path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("entry serial {} leaves no room for new entries", last),
                    ),
                )
            })?;
            index.next_serial = index.next_serial.max(after_last);
        }
        info!(
            index = ?index_path,
            entries = index.entries.len(),
            next_serial = index.next_serial,
            "Cache index loaded"
        );

        Ok(Self {
            dir,
            default_ttl_secs,
            index: Mutex::new(index),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, serial: u64) -> PathBuf {
        self.dir.path().join(format!("{:016x}.dat", serial))
    }

    async fn persist(&self, index: &Index) -> Result<()> {
        let path = self.dir.path().join(INDEX_FILE);
        let tmp = self.dir.path().join(format!("{}.tmp", INDEX_FILE));
        let json = serde_json::to_vec_pretty(index)?;

        fs::write(&tmp, &json)
            .await
            .map_err(|e| CacheError::storage(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::storage(&path, e))
    }

    pub(crate) async fn request_file_at(
        &self,
        file_name: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<EntryId> {
        check_file_name(file_name)?;
        let valid_to = expiry_for(now, duration_secs, self.default_ttl_secs);

        let mut index = self.index.lock().await;

        if let Some(serial) = index.find(file_name) {
            let path = self.blob_path(serial);
            let live = index.entries[&serial].is_live(now)
                && fs::try_exists(&path).await.unwrap_or(false);

            if live {
                let previous = index.entries[&serial].valid_to;
                if valid_to > previous {
                    if let Some(meta) = index.entries.get_mut(&serial) {
                        meta.extend_to(valid_to);
                    }
                    if let Err(e) = self.persist(&index).await {
                        if let Some(meta) = index.entries.get_mut(&serial) {
                            meta.valid_to = previous;
                        }
                        return Err(e);
                    }
                }
                self.reused.fetch_add(1, Ordering::Relaxed);
                debug!(file_name, serial, "Reusing cache entry");
                return Ok(self.dir.create_serial_id(file_name, serial));
            }

            index.entries.remove(&serial);
            if let Err(e) = remove_if_present(&path).await {
                warn!(path = ?path, error = %e, "Failed to remove stale backing file");
            }
            self.expired.fetch_add(1, Ordering::Relaxed);
        }

        let serial = index.next_serial;
        index.next_serial = serial
            .checked_add(1)
            .ok_or_else(|| CacheError::creation(file_name, "serial space exhausted"))?;
        let path = self.blob_path(serial);
        fs::File::create(&path)
            .await
            .map_err(|e| CacheError::creation(file_name, e))?;

        index
            .entries
            .insert(serial, EntryMeta::new(file_name, now, valid_to));
        if let Err(e) = self.persist(&index).await {
            index.entries.remove(&serial);
            let _ = remove_if_present(&path).await;
            return Err(CacheError::creation(file_name, e));
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(file_name, serial, valid_to = %valid_to, "Created cache entry");

        Ok(self.dir.create_serial_id(file_name, serial))
    }

    async fn lookup(&self, id: &EntryId) -> Option<EntryMeta> {
        if !self.dir.issued(id) {
            return None;
        }
        let serial = id.serial()?;
        let index = self.index.lock().await;
        index
            .entries
            .get(&serial)
            .filter(|meta| meta.file_name == id.file_name())
            .cloned()
    }
}

#[async_trait]
impl CacheBackend for IndexedBackend {
    fn directory(&self) -> &Path {
        self.dir.path()
    }

    async fn request_file(&self, file_name: &str, duration_secs: u64) -> Result<EntryId> {
        self.request_file_at(file_name, duration_secs, Utc::now())
            .await
    }

    async fn expire_files_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut index = self.index.lock().await;
        let mut report = SweepReport {
            scanned: index.entries.len(),
            ..SweepReport::default()
        };

        let due: Vec<u64> = index
            .entries
            .iter()
            .filter(|(_, meta)| !meta.is_live(now))
            .map(|(serial, _)| *serial)
            .collect();

        for serial in due {
            let path = self.blob_path(serial);
            if let Err(e) = remove_if_present(&path).await {
                warn!(serial, path = ?path, error = %e, "Failed to remove expired entry");
                report.failed += 1;
                continue;
            }
            if let Some(meta) = index.entries.remove(&serial) {
                debug!(file_name = %meta.file_name, serial, "Expired cache entry");
            }
            report.removed += 1;
        }

        if report.removed > 0 {
            if let Err(e) = self.persist(&index).await {
                warn!(error = %e, "Failed to persist cache index after sweep");
                report.failed += 1;
            }
        }
        remove_serial_orphans(
            self.dir.path(),
            |serial| index.entries.contains_key(&serial),
            &mut report,
        )
        .await;

        self.expired
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        self.sweep_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        info!(
            scanned = report.scanned,
            removed = report.removed,
            failed = report.failed,
            "Expiry sweep finished"
        );
        report
    }

    async fn valid_to(&self, id: &EntryId) -> Option<DateTime<Utc>> {
        self.lookup(id).await.map(|meta| meta.valid_to)
    }

    async fn file_path(&self, id: &EntryId) -> Result<PathBuf> {
        match (self.lookup(id).await, id.serial()) {
            (Some(_), Some(serial)) => Ok(self.blob_path(serial)),
            _ => Err(unknown_id(id)),
        }
    }

    async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
        }
    }
}
