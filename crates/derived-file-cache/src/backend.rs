//! The backend capability shared by all storage strategies

use crate::error::{CacheError, Result};
use crate::id::EntryId;
use crate::indexed::IndexedBackend;
use crate::memory::MemoryBackend;
use crate::sharded::ShardedBackend;
use crate::types::{BackendKind, CacheConfig, CacheStats, SweepReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

/// A cache of derived files kept beneath a directory the backend owns.
///
/// Entries move from absent to created through [`request_file`] and are
/// only removed by an explicit sweep. Passing an expiry instant is not
/// enough to drop an entry.
///
/// Calls on one instance may come from several tasks; each variant
/// serializes its own directory mutations.
///
/// [`request_file`]: CacheBackend::request_file
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Root directory managed by this instance
    fn directory(&self) -> &Path;

    /// Get a handle to the entry for `file_name`, creating it if needed.
    ///
    /// The entry stays valid for at least `duration_secs` from now, or the
    /// backend default when `duration_secs` is zero.
    async fn request_file(&self, file_name: &str, duration_secs: u64) -> Result<EntryId>;

    /// Remove every entry whose expiry is at or before `now`
    async fn expire_files_at(&self, now: DateTime<Utc>) -> SweepReport;

    async fn expire_files(&self) -> SweepReport {
        self.expire_files_at(Utc::now()).await
    }

    /// Expiry of the entry named by `id`, or `None` if this instance does
    /// not know it
    async fn valid_to(&self, id: &EntryId) -> Option<DateTime<Utc>>;

    /// Physical file backing the entry named by `id`
    async fn file_path(&self, id: &EntryId) -> Result<PathBuf>;

    async fn stats(&self) -> CacheStats;
}

pub(crate) fn check_file_name(file_name: &str) -> Result<()> {
    if file_name.trim().is_empty() {
        return Err(CacheError::InvalidFileName(file_name.to_string()));
    }
    Ok(())
}

pub(crate) fn unknown_id(id: &EntryId) -> CacheError {
    CacheError::InvalidIdUsage(format!("{} was not issued by this backend", id))
}

/// Open the backend variant named in `config`
pub async fn open_backend(config: &CacheConfig) -> Result<Box<dyn CacheBackend>> {
    let backend: Box<dyn CacheBackend> = match config.backend {
        BackendKind::Memory => Box::new(
            MemoryBackend::open(config.cache_dir.clone(), config.default_ttl_secs).await?,
        ),
        BackendKind::Sharded => Box::new(
            ShardedBackend::open(config.cache_dir.clone(), config.default_ttl_secs).await?,
        ),
        BackendKind::Indexed => Box::new(
            IndexedBackend::open(config.cache_dir.clone(), config.default_ttl_secs).await?,
        ),
    };
    info!(
        backend = %config.backend,
        default_ttl_secs = config.default_ttl_secs,
        "Cache backend ready"
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TTL_SECS;
    use chrono::Duration;
    use tempfile::{tempdir, TempDir};

    const KINDS: [BackendKind; 3] = [
        BackendKind::Memory,
        BackendKind::Sharded,
        BackendKind::Indexed,
    ];

    async fn open(kind: BackendKind) -> (TempDir, Box<dyn CacheBackend>) {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: dir.path().join("cache"),
            backend: kind,
            default_ttl_secs: DEFAULT_TTL_SECS,
        };
        let backend = open_backend(&config).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_directory_is_configured_root() {
        for kind in KINDS {
            let (dir, backend) = open(kind).await;
            assert_eq!(backend.directory(), dir.path().join("cache").as_path());
        }
    }

    #[tokio::test]
    async fn test_valid_to_covers_requested_duration() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let before = Utc::now();
            let id = backend.request_file("plot_1.dat", 3600).await.unwrap();

            assert!(id.is_valid(), "{kind}");
            assert_eq!(id.file_name(), "plot_1.dat");
            let valid_to = backend.valid_to(&id).await.unwrap();
            assert!(valid_to >= before + Duration::hours(1), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_zero_duration_uses_default_ttl() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let before = Utc::now();
            let id = backend.request_file("plot_1.dat", 0).await.unwrap();

            let valid_to = backend.valid_to(&id).await.unwrap();
            assert!(valid_to >= before + Duration::seconds(DEFAULT_TTL_SECS as i64));
        }
    }

    #[tokio::test]
    async fn test_empty_file_name_rejected() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let err = backend.request_file("  ", 60).await.unwrap_err();
            assert!(matches!(err, CacheError::InvalidFileName(_)), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_invalid_and_foreign_ids_degrade_to_none() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let (_other_dir, other) = open(kind).await;
            let foreign = other.request_file("plot_1.dat", 60).await.unwrap();

            assert!(backend.valid_to(&EntryId::default()).await.is_none());
            assert!(backend.valid_to(&foreign).await.is_none(), "{kind}");
            assert!(matches!(
                backend.file_path(&EntryId::default()).await,
                Err(CacheError::InvalidIdUsage(_))
            ));
            assert!(matches!(
                backend.file_path(&foreign).await,
                Err(CacheError::InvalidIdUsage(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_file_path_exists_under_directory() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let id = backend.request_file("plot_1.dat", 60).await.unwrap();

            let path = backend.file_path(&id).await.unwrap();
            assert!(path.starts_with(backend.directory()), "{kind}");
            assert!(path.is_file(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_reuse_extends_but_never_shortens() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let first = backend.request_file("plot_1.dat", 7200).await.unwrap();
            let long = backend.valid_to(&first).await.unwrap();

            let second = backend.request_file("plot_1.dat", 60).await.unwrap();
            assert_eq!(second, first, "{kind}");
            assert_eq!(backend.valid_to(&second).await.unwrap(), long);

            let before = Utc::now();
            let third = backend.request_file("plot_1.dat", 86_400).await.unwrap();
            assert!(backend.valid_to(&third).await.unwrap() >= before + Duration::days(1));

            let stats = backend.stats().await;
            assert_eq!(stats.created, 1, "{kind}");
            assert_eq!(stats.reused, 2, "{kind}");
            assert_eq!(stats.entries, 1, "{kind}");
        }
    }

    #[tokio::test]
    async fn test_repeated_sweep_is_idempotent() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let short = backend.request_file("short.dat", 60).await.unwrap();
            let long = backend.request_file("long.dat", 7200).await.unwrap();

            let later = Utc::now() + Duration::minutes(5);
            let first = backend.expire_files_at(later).await;
            assert_eq!(first.removed, 1, "{kind}");
            let after_first = backend.stats().await;

            let second = backend.expire_files_at(later).await;
            assert_eq!(second.removed, 0, "{kind}");
            assert_eq!(backend.stats().await.entries, after_first.entries);

            assert!(backend.valid_to(&short).await.is_none(), "{kind}");
            assert!(backend.valid_to(&long).await.is_some(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_sweep_removing_one_name_keeps_other() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let a = backend.request_file("a", 60).await.unwrap();
            let b = backend.request_file("b", 7200).await.unwrap();
            assert_ne!(a.file_name(), b.file_name());

            let a_path = backend.file_path(&a).await.unwrap();
            let b_path = backend.file_path(&b).await.unwrap();

            backend
                .expire_files_at(Utc::now() + Duration::minutes(30))
                .await;

            assert!(!a_path.exists(), "{kind}");
            assert!(b_path.exists(), "{kind}");
            assert!(backend.valid_to(&b).await.is_some(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_expiry_is_lazy_until_swept() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let id = backend.request_file("plot_1.dat", 3600).await.unwrap();

            // An immediate sweep keeps the entry.
            let report = backend.expire_files().await;
            assert_eq!(report.removed, 0, "{kind}");
            let valid_to = backend.valid_to(&id).await.unwrap();
            assert!(valid_to > Utc::now());

            let report = backend
                .expire_files_at(Utc::now() + Duration::hours(2))
                .await;
            assert_eq!(report.removed, 1, "{kind}");
            assert!(backend.valid_to(&id).await.is_none(), "{kind}");

            let again = backend.request_file("plot_1.dat", 3600).await.unwrap();
            assert!(again.is_valid());
            let stats = backend.stats().await;
            assert_eq!(stats.created, 2, "{kind}");
            assert_eq!(stats.reused, 0, "{kind}");
            assert_eq!(stats.expired, 1, "{kind}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_and_sweep_on_one_instance() {
        for kind in KINDS {
            let (_dir, backend) = open(kind).await;
            let backend = backend.as_ref();

            let (a, b, a_again, c, report) = tokio::join!(
                backend.request_file("a", 3600),
                backend.request_file("b", 3600),
                backend.request_file("a", 7200),
                backend.request_file("c", 60),
                backend.expire_files(),
            );
            assert_eq!(report.failed, 0, "{kind}");
            assert_eq!(report.removed, 0, "{kind}");

            let ids = [a.unwrap(), b.unwrap(), a_again.unwrap(), c.unwrap()];
            for id in &ids {
                assert!(backend.valid_to(id).await.is_some(), "{kind} {id}");
                assert!(backend.file_path(id).await.unwrap().exists(), "{kind} {id}");
            }
            assert_eq!(ids[0].file_name(), ids[2].file_name());

            let stats = backend.stats().await;
            assert_eq!(stats.entries, 3, "{kind}");
            assert_eq!(stats.created, 3, "{kind}");
            assert_eq!(stats.reused, 1, "{kind}");
        }
    }

    #[tokio::test]
    async fn test_plot_scenario() {
        let (_dir, backend) = open(BackendKind::Sharded).await;
        let id = backend.request_file("plot_1.dat", 3600).await.unwrap();

        assert!(id.is_valid());
        assert_eq!(id.file_name(), "plot_1.dat");
        let hour_from_now = Utc::now() + Duration::hours(1) - Duration::seconds(5);
        assert!(backend.valid_to(&id).await.unwrap() >= hour_from_now);

        backend.expire_files().await;
        assert!(backend.valid_to(&id).await.is_some());

        backend
            .expire_files_at(Utc::now() + Duration::hours(1) + Duration::minutes(1))
            .await;
        assert!(backend.valid_to(&id).await.is_none());
        assert_eq!(backend.stats().await.entries, 0);
    }
}
