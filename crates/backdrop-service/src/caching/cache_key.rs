use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The identity of a cached result.
///
/// A key is the SHA-256 hash of human readable, but most importantly **stable**, metadata that
/// describes everything contributing to the result. Keys compare and hash by digest only.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<&str> for CacheKey {
    fn from(metadata: &str) -> Self {
        let mut builder = Self::builder();
        builder.metadata.push_str(metadata);
        builder.build()
    }
}

impl CacheKey {
    /// Create a [`CacheKeyBuilder`] that can be used to build a cache key consisting of all its
    /// contributing inputs.
    pub fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder {
            metadata: String::new(),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait. Everything written to it is
/// hashed to form the [`CacheKey`], and is kept alongside it to help debugging.
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes a `name: value` line into the [`CacheKey`].
    pub fn field(mut self, name: &str, value: impl fmt::Display) -> Self {
        let _ = writeln!(self.metadata, "{name}: {value}");
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
