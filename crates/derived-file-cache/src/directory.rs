//! The directory a backend instance owns

use crate::error::{CacheError, Result};
use crate::id::{Discriminator, EntryId};
use crate::types::SweepReport;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};

const WRITE_CHECK: &str = ".write-check";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Root directory managed exclusively by one backend instance.
///
/// Opening a directory checks that it is writable, so storage problems
/// surface at construction rather than on first use. The handle also
/// carries the instance identity stamped into every id it mints.
#[derive(Debug)]
pub struct CacheDirectory {
    path: PathBuf,
    instance: u64,
}

impl CacheDirectory {
    /// Create the directory if needed and verify it can be written
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)
            .await
            .map_err(|e| CacheError::storage(&path, e))?;

        let marker = path.join(WRITE_CHECK);
        fs::write(&marker, b"")
            .await
            .map_err(|e| CacheError::storage(&marker, e))?;
        fs::remove_file(&marker)
            .await
            .map_err(|e| CacheError::storage(&marker, e))?;

        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        info!(cache_dir = ?path, instance, "Cache directory opened");

        Ok(Self { path, instance })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mint an id carrying a backend-assigned sequence number
    pub fn create_serial_id(&self, file_name: &str, serial: u64) -> EntryId {
        EntryId::new(self.instance, file_name, Discriminator::Serial(serial))
    }

    /// Mint an id carrying a content address
    pub fn create_digest_id(&self, file_name: &str, digest: [u8; 32]) -> EntryId {
        EntryId::new(self.instance, file_name, Discriminator::Digest(digest))
    }

    /// Whether `id` is valid and was minted by this directory handle
    pub fn issued(&self, id: &EntryId) -> bool {
        id.issuer() == Some(self.instance)
    }
}

/// Remove a file, treating an already missing file as removed
pub(crate) async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Serial encoded in a flat `<serial:016x>.dat` backing file name
pub(crate) fn serial_from_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".dat")?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Remove flat `<serial>.dat` files in `dir` whose serial is not `known`
pub(crate) async fn remove_serial_orphans<F>(dir: &Path, known: F, report: &mut SweepReport)
where
    F: Fn(u64) -> bool,
{
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!(cache_dir = ?dir, error = %e, "Failed to list cache directory");
            report.failed += 1;
            return;
        }
    };

    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read cache directory entry");
                report.failed += 1;
                break;
            }
        };

        let serial = entry.file_name().to_str().and_then(serial_from_name);
        let Some(serial) = serial else { continue };
        if known(serial) {
            continue;
        }

        let path = entry.path();
        match remove_if_present(&path).await {
            Ok(()) => debug!(path = ?path, "Removed orphaned file"),
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove orphaned file");
                report.failed += 1;
            }
        }
    }
}
