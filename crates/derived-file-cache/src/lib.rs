//! Pluggable on-disk cache for derived data files
//!
//! A backend owns a directory and hands out opaque [`EntryId`]s for
//! logical file names, each valid for a requested duration. Expired
//! entries are only removed by an explicit sweep. Three storage
//! strategies are provided behind the [`CacheBackend`] trait:
//! in-memory bookkeeping, a hash-sharded directory tree, and a flat
//! directory described by a JSON index.

mod backend;
mod directory;
mod error;
mod id;
mod indexed;
mod memory;
mod sharded;
mod types;

pub use backend::{open_backend, CacheBackend};
pub use directory::CacheDirectory;
pub use error::{CacheError, Result};
pub use id::{Discriminator, EntryId};
pub use indexed::IndexedBackend;
pub use memory::MemoryBackend;
pub use sharded::{shard_key, ShardedBackend};
pub use types::{
    expiry_for, BackendKind, CacheConfig, CacheStats, EntryMeta, SweepReport, DEFAULT_TTL_SECS,
};
