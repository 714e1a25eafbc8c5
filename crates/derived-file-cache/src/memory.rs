//! In-memory bookkeeping over a flat directory of backing files

use crate::backend::{check_file_name, unknown_id, CacheBackend};
use crate::directory::{remove_if_present, remove_serial_orphans, CacheDirectory};
use crate::error::{CacheError, Result};
use crate::id::EntryId;
use crate::types::{expiry_for, CacheStats, EntryMeta, SweepReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct Slot {
    serial: u64,
    meta: EntryMeta,
}

/// A backend whose entry metadata lives only in memory.
///
/// Backing files are `<dir>/<serial>.dat`. Serials are never reused, so
/// an entry recreated after expiry gets a new id. Backing files this
/// instance does not know about, such as those left by an earlier
/// process, are never handed out and are removed by the next sweep.
pub struct MemoryBackend {
    dir: CacheDirectory,
    default_ttl_secs: u64,
    /// Live entries keyed by logical file name
    entries: RwLock<HashMap<String, Slot>>,
    next_serial: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    sweep_failures: AtomicU64,
}

impl MemoryBackend {
    pub async fn open(cache_dir: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        let dir = CacheDirectory::open(cache_dir).await?;
        Ok(Self {
            dir,
            default_ttl_secs,
            entries: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, serial: u64) -> PathBuf {
        self.dir.path().join(format!("{:016x}.dat", serial))
    }

    pub(crate) async fn request_file_at(
        &self,
        file_name: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<EntryId> {
        check_file_name(file_name)?;
        let valid_to = expiry_for(now, duration_secs, self.default_ttl_secs);

        let mut entries = self.entries.write().await;

        if let Some(slot) = entries.get_mut(file_name) {
            if slot.meta.is_live(now) {
                slot.meta.extend_to(valid_to);
                self.reused.fetch_add(1, Ordering::Relaxed);
                debug!(file_name, serial = slot.serial, "Reusing cache entry");
                return Ok(self.dir.create_serial_id(file_name, slot.serial));
            }
        }

        // Past expiry but not yet swept: drop it as a sweep would. A file
        // that cannot be removed now is unknown from here on, so the next
        // sweep reclaims it as an orphan.
        if let Some(stale) = entries.remove(file_name) {
            let path = self.blob_path(stale.serial);
            if let Err(e) = remove_if_present(&path).await {
                warn!(path = ?path, error = %e, "Failed to remove stale backing file");
            }
            self.expired.fetch_add(1, Ordering::Relaxed);
        }

        // Files left by an earlier instance keep their serials
        let serial = loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let path = self.blob_path(serial);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => break serial,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(serial, "Skipping serial with an existing backing file");
                }
                Err(e) => return Err(CacheError::creation(file_name, e)),
            }
        };

        entries.insert(
            file_name.to_string(),
            Slot {
                serial,
                meta: EntryMeta::new(file_name, now, valid_to),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(file_name, serial, valid_to = %valid_to, "Created cache entry");

        Ok(self.dir.create_serial_id(file_name, serial))
    }

    async fn lookup(&self, id: &EntryId) -> Option<(u64, EntryMeta)> {
        if !self.dir.issued(id) {
            return None;
        }
        let serial = id.serial()?;
        let entries = self.entries.read().await;
        entries
            .get(id.file_name())
            .filter(|slot| slot.serial == serial)
            .map(|slot| (slot.serial, slot.meta.clone()))
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn directory(&self) -> &Path {
        self.dir.path()
    }

    async fn request_file(&self, file_name: &str, duration_secs: u64) -> Result<EntryId> {
        self.request_file_at(file_name, duration_secs, Utc::now())
            .await
    }

    async fn expire_files_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut entries = self.entries.write().await;
        let mut report = SweepReport {
            scanned: entries.len(),
            ..SweepReport::default()
        };

        let due: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, slot)| !slot.meta.is_live(now))
            .map(|(name, slot)| (name.clone(), slot.serial))
            .collect();

        for (name, serial) in due {
            let path = self.blob_path(serial);
            if let Err(e) = remove_if_present(&path).await {
                // Keep the entry so the next sweep retries it
                warn!(file_name = %name, path = ?path, error = %e, "Failed to remove expired entry");
                report.failed += 1;
                continue;
            }
            entries.remove(&name);
            report.removed += 1;
            debug!(file_name = %name, serial, "Expired cache entry");
        }

        remove_serial_orphans(
            self.dir.path(),
            |serial| entries.values().any(|slot| slot.serial == serial),
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
        let found = self.lookup(id).await;
        if found.is_none() {
            debug!(id = %id, "valid_to for unknown id");
        }
        found.map(|(_, meta)| meta.valid_to)
    }

    async fn file_path(&self, id: &EntryId) -> Result<PathBuf> {
        match self.lookup(id).await {
            Some((serial, _)) => Ok(self.blob_path(serial)),
            None => Err(unknown_id(id)),
        }
    }

    async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TTL_SECS;
    use chrono::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_serials_increase_per_new_entry() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let a = cache.request_file("a", 60).await.unwrap();
        let b = cache.request_file("b", 60).await.unwrap();
        assert_eq!(a.serial(), Some(1));
        assert_eq!(b.serial(), Some(2));
        assert!(a.digest().is_none());
    }

    #[tokio::test]
    async fn test_flat_layout() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let id = cache.request_file("plot_1.dat", 60).await.unwrap();
        let path = cache.file_path(&id).await.unwrap();
        assert_eq!(path, dir.path().join("0000000000000001.dat"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unswept_expired_entry_is_recreated() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let now = Utc::now();
        let old = cache.request_file_at("plot_1.dat", 60, now).await.unwrap();
        let old_path = cache.file_path(&old).await.unwrap();
        std::fs::write(&old_path, b"stale samples").unwrap();

        let later = now + Duration::minutes(2);
        let fresh = cache
            .request_file_at("plot_1.dat", 60, later)
            .await
            .unwrap();

        assert_ne!(fresh, old);
        assert_eq!(fresh.serial(), Some(2));
        assert!(!old_path.exists());
        assert!(cache.valid_to(&old).await.is_none());
        assert_eq!(
            cache.valid_to(&fresh).await,
            Some(later + Duration::seconds(60))
        );

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_valid_to_reports_past_expiry_until_swept() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let then = Utc::now() - Duration::hours(2);
        let id = cache.request_file_at("old.dat", 60, then).await.unwrap();
        assert_eq!(
            cache.valid_to(&id).await,
            Some(then + Duration::seconds(60))
        );

        cache.expire_files().await;
        assert!(cache.valid_to(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failures() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let stuck = cache.request_file("stuck", 60).await.unwrap();
        let gone = cache.request_file("gone", 60).await.unwrap();

        // A non-empty directory in place of the backing file cannot be unlinked
        let stuck_path = cache.file_path(&stuck).await.unwrap();
        std::fs::remove_file(&stuck_path).unwrap();
        std::fs::create_dir(&stuck_path).unwrap();
        std::fs::write(stuck_path.join("child"), b"x").unwrap();

        let report = cache
            .expire_files_at(Utc::now() + Duration::minutes(5))
            .await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 1);

        assert!(cache.valid_to(&gone).await.is_none());
        assert!(cache.valid_to(&stuck).await.is_some());

        let stats = cache.stats().await;
        assert_eq!(stats.sweep_failures, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_sweep_tolerates_missing_backing_file() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();

        let id = cache.request_file("a", 60).await.unwrap();
        std::fs::remove_file(cache.file_path(&id).await.unwrap()).unwrap();

        let report = cache
            .expire_files_at(Utc::now() + Duration::minutes(5))
            .await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_reopen_never_hands_out_leftover_files() {
        let dir = tempdir().unwrap();
        let first = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        let a = first.request_file("a", 60).await.unwrap();
        let a_path = first.file_path(&a).await.unwrap();
        std::fs::write(&a_path, b"waveforms").unwrap();
        first.request_file("c", 60).await.unwrap();
        drop(first);

        let second = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        let b = second.request_file("b", 60).await.unwrap();
        let b_path = second.file_path(&b).await.unwrap();

        assert_ne!(b_path, a_path);
        assert_eq!(b.serial(), Some(3));
        assert_eq!(std::fs::read(&a_path).unwrap(), b"waveforms");
        assert_eq!(std::fs::metadata(&b_path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_files_from_earlier_instance() {
        let dir = tempdir().unwrap();
        let first = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        first.request_file("a", 60).await.unwrap();
        first.request_file("c", 60).await.unwrap();
        drop(first);

        let second = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        let report = second
            .expire_files_at(Utc::now() + Duration::days(365))
            .await;
        assert_eq!(report.failed, 0);

        let leftover: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftover.is_empty(), "{:?}", leftover);

        let b = second.request_file("b", 60).await.unwrap();
        assert!(second.file_path(&b).await.unwrap().exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_files_of_live_entries() {
        let dir = tempdir().unwrap();
        let cache = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        let id = cache.request_file("a", 3600).await.unwrap();

        cache.expire_files().await;
        assert!(cache.file_path(&id).await.unwrap().exists());
    }

    #[tokio::test]
    async fn test_nothing_survives_reopen() {
        let dir = tempdir().unwrap();
        let first = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        first.request_file("a", 60).await.unwrap();

        let second = MemoryBackend::open(dir.path().to_path_buf(), DEFAULT_TTL_SECS)
            .await
            .unwrap();
        assert_eq!(second.stats().await.entries, 0);
    }
}
