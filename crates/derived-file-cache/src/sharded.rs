//! Directory-hashing backend: entries sharded by the digest of their name
//!
//! An entry for name `n` with key `k = sha256(n)` lives at
//! `<dir>/k[0..2]/k[2..4]/k.dat`, next to a JSON sidecar `k.meta.json`.
//! All state is on disk, so entries survive a restart of the process.

use crate::backend::{check_file_name, unknown_id, CacheBackend};
use crate::directory::{remove_if_present, CacheDirectory};
use crate::error::{CacheError, Result};
use crate::id::EntryId;
use crate::types::{expiry_for, CacheStats, EntryMeta, SweepReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DATA_SUFFIX: &str = ".dat";
const META_SUFFIX: &str = ".meta.json";

/// Shard key for a logical file name
pub fn shard_key(file_name: &str) -> [u8; 32] {
    Sha256::digest(file_name.as_bytes()).into()
}

fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::storage(path, e)),
    }
}

async fn write_meta(path: &Path, meta: &EntryMeta) -> Result<()> {
    let json = serde_json::to_vec(meta)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, &json)
        .await
        .map_err(|e| CacheError::storage(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| CacheError::storage(path, e))
}

async fn subdirs(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut reader = fs::read_dir(path).await?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name();
        if is_shard_name(&name.to_string_lossy()) && entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn file_names(path: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut reader = fs::read_dir(path).await?;
    while let Some(entry) = reader.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

/// A backend that hashes names into a two-level directory tree
pub struct ShardedBackend {
    dir: CacheDirectory,
    default_ttl_secs: u64,
    /// Serializes every walk or mutation of the shard tree
    lock: Mutex<()>,
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    sweep_failures: AtomicU64,
}

impl ShardedBackend {
    pub async fn open(cache_dir: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        let dir = CacheDirectory::open(cache_dir).await?;
        Ok(Self {
            dir,
            default_ttl_secs,
            lock: Mutex::new(()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
        })
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        self.dir.path().join(&key[0..2]).join(&key[2..4])
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{}{}", key, DATA_SUFFIX))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{}{}", key, META_SUFFIX))
    }

    pub(crate) async fn request_file_at(
        &self,
        file_name: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<EntryId> {
        check_file_name(file_name)?;
        let digest = shard_key(file_name);
        let key = hex::encode(digest);
        let valid_to = expiry_for(now, duration_secs, self.default_ttl_secs);
        let data_path = self.data_path(&key);
        let meta_path = self.meta_path(&key);

        let _guard = self.lock.lock().await;

        let existing = match read_meta(&meta_path).await {
            Ok(meta) => meta,
            Err(CacheError::Index(msg)) => {
                warn!(path = ?meta_path, error = %msg, "Discarding unreadable sidecar");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(mut meta) = existing {
            let has_data = fs::try_exists(&data_path).await.unwrap_or(false);
            if meta.is_live(now) && has_data {
                if valid_to > meta.valid_to {
                    meta.extend_to(valid_to);
                    write_meta(&meta_path, &meta).await?;
                }
                self.reused.fetch_add(1, Ordering::Relaxed);
                debug!(file_name, key = %key, "Reusing cache entry");
                return Ok(self.dir.create_digest_id(file_name, digest));
            }

            if let Err(e) = remove_if_present(&data_path).await {
                warn!(path = ?data_path, error = %e, "Failed to remove stale backing file");
            }
            self.expired.fetch_add(1, Ordering::Relaxed);
        }

        fs::create_dir_all(self.shard_dir(&key))
            .await
            .map_err(|e| CacheError::creation(file_name, e))?;
        fs::File::create(&data_path)
            .await
            .map_err(|e| CacheError::creation(file_name, e))?;
        write_meta(&meta_path, &EntryMeta::new(file_name, now, valid_to))
            .await
            .map_err(|e| CacheError::creation(file_name, e))?;

        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(file_name, key = %key, valid_to = %valid_to, "Created cache entry");

        Ok(self.dir.create_digest_id(file_name, digest))
    }

    /// Key of the entry named by `id`, if it was issued here and still exists
    async fn lookup(&self, id: &EntryId) -> Option<(String, EntryMeta)> {
        if !self.dir.issued(id) {
            return None;
        }
        let key = hex::encode(id.digest()?);
        match read_meta(&self.meta_path(&key)).await {
            Ok(Some(meta)) if meta.file_name == id.file_name() => Some((key, meta)),
            Ok(Some(meta)) => {
                debug!(id = %id, stored = %meta.file_name, "Sidecar names another file");
                None
            }
            Ok(None) => None,
            Err(e) => {
                debug!(id = %id, error = %e, "Failed to read sidecar");
                None
            }
        }
    }

    /// Every second-level shard directory, counting listing failures
    async fn leaf_dirs(&self, failed: &mut usize) -> Vec<PathBuf> {
        let firsts = match subdirs(self.dir.path()).await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(cache_dir = ?self.dir.path(), error = %e, "Failed to list cache directory");
                *failed += 1;
                return Vec::new();
            }
        };

        let mut leaves = Vec::new();
        for first in firsts {
            match subdirs(&first).await {
                Ok(dirs) => leaves.extend(dirs),
                Err(e) => {
                    warn!(path = ?first, error = %e, "Failed to list shard directory");
                    *failed += 1;
                }
            }
        }
        leaves
    }

    async fn sweep_leaf(&self, leaf: &Path, now: DateTime<Utc>, report: &mut SweepReport) {
        let names = match file_names(leaf).await {
            Ok(names) => names,
            Err(e) => {
                warn!(path = ?leaf, error = %e, "Failed to list shard directory");
                report.failed += 1;
                return;
            }
        };

        let keys: HashSet<&str> = names
            .iter()
            .filter_map(|n| n.strip_suffix(META_SUFFIX))
            .collect();

        for key in &keys {
            report.scanned += 1;
            let meta_path = leaf.join(format!("{}{}", key, META_SUFFIX));
            let data_path = leaf.join(format!("{}{}", key, DATA_SUFFIX));

            match read_meta(&meta_path).await {
                Ok(Some(meta)) if meta.is_live(now) => continue,
                Ok(None) => continue,
                Ok(Some(meta)) => {
                    debug!(file_name = %meta.file_name, key = %key, "Expiring cache entry");
                }
                Err(CacheError::Index(msg)) => {
                    warn!(path = ?meta_path, error = %msg, "Removing entry with unreadable sidecar");
                }
                Err(e) => {
                    warn!(path = ?meta_path, error = %e, "Failed to read sidecar");
                    report.failed += 1;
                    continue;
                }
            }

            // Data first: a surviving sidecar lets the next sweep retry
            let removed = match remove_if_present(&data_path).await {
                Ok(()) => remove_if_present(&meta_path).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove expired entry");
                    report.failed += 1;
                }
            }
        }

        // Backing files without a sidecar and interrupted sidecar writes
        for name in &names {
            let orphan = match name.strip_suffix(DATA_SUFFIX) {
                Some(key) => !keys.contains(key),
                None => !name.ends_with(META_SUFFIX),
            };
            if orphan {
                let path = leaf.join(name);
                match remove_if_present(&path).await {
                    Ok(()) => debug!(path = ?path, "Removed orphaned file"),
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Failed to remove orphaned file");
                        report.failed += 1;
                    }
                }
            }
        }

        // Only succeeds once the directory is empty
        if fs::remove_dir(leaf).await.is_ok() {
            if let Some(parent) = leaf.parent() {
                let _ = fs::remove_dir(parent).await;
            }
        }
    }
}

#[async_trait]
impl CacheBackend for ShardedBackend {
    fn directory(&self) -> &Path {
        self.dir.path()
    }

    async fn request_file(&self, file_name: &str, duration_secs: u64) -> Result<EntryId> {
        self.request_file_at(file_name, duration_secs, Utc::now())
            .await
    }

    async fn expire_files_at(&self, now: DateTime<Utc>) -> SweepReport {
        let _guard = self.lock.lock().await;
        let mut report = SweepReport::default();

        for leaf in self.leaf_dirs(&mut report.failed).await {
            self.sweep_leaf(&leaf, now, &mut report).await;
        }

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
        self.lookup(id).await.map(|(_, meta)| meta.valid_to)
    }

    async fn file_path(&self, id: &EntryId) -> Result<PathBuf> {
        match self.lookup(id).await {
            Some((key, _)) => Ok(self.data_path(&key)),
            None => Err(unknown_id(id)),
        }
    }

    async fn stats(&self) -> CacheStats {
        let _guard = self.lock.lock().await;
        let mut failed = 0;
        let mut entries = 0;
        for leaf in self.leaf_dirs(&mut failed).await {
            if let Ok(names) = file_names(&leaf).await {
                entries += names.iter().filter(|n| n.ends_with(META_SUFFIX)).count();
            }
        }

        CacheStats {
            entries,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
        }
    }
}
