//! Opaque handles to cache entries

use std::fmt;

/// Backend-specific value identifying an entry.
///
/// Callers must treat it as opaque. Only the backend that issued an id
/// knows which variant it uses and what the value means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Discriminator {
    /// Sequence number assigned by the issuing backend
    Serial(u64),
    /// Content address derived from the logical file name
    Digest([u8; 32]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Token {
    issuer: u64,
    discriminator: Discriminator,
}

/// Handle to one cached file, returned by [`CacheBackend::request_file`].
///
/// The default value is the invalid id. Ids are minted only through
/// [`CacheDirectory`], so a valid id always names the backend instance
/// that issued it.
///
/// [`CacheBackend::request_file`]: crate::CacheBackend::request_file
/// [`CacheDirectory`]: crate::CacheDirectory
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EntryId {
    token: Option<Token>,
    file_name: String,
}

impl EntryId {
    pub(crate) fn new(issuer: u64, file_name: &str, discriminator: Discriminator) -> Self {
        Self {
            token: Some(Token {
                issuer,
                discriminator,
            }),
            file_name: file_name.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.token.is_some()
    }

    /// Logical name the entry was requested under (empty for the invalid id)
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn discriminator(&self) -> Option<Discriminator> {
        self.token.map(|t| t.discriminator)
    }

    pub fn serial(&self) -> Option<u64> {
        match self.discriminator()? {
            Discriminator::Serial(n) => Some(n),
            Discriminator::Digest(_) => None,
        }
    }

    pub fn digest(&self) -> Option<[u8; 32]> {
        match self.discriminator()? {
            Discriminator::Digest(d) => Some(d),
            Discriminator::Serial(_) => None,
        }
    }

    pub(crate) fn issuer(&self) -> Option<u64> {
        self.token.map(|t| t.issuer)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.discriminator() {
            None => write!(f, "<invalid>"),
            Some(Discriminator::Serial(n)) => write!(f, "{}#serial:{}", self.file_name, n),
            Some(Discriminator::Digest(d)) => {
                write!(f, "{}#digest:{}", self.file_name, hex::encode(&d[..4]))
            }
        }
    }
}
