//! Cache keys and the resource ids derived from them

use crate::error::{CacheError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Logical identity of a cached artifact.
///
/// A simple key has one candidate identifier. A composite key carries an
/// ordered list of candidates: inserts go to the first one, lookups try each
/// in order and accept the first that exists on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Simple(String),
    Composite(Box<[String]>),
}

impl CacheKey {
    pub fn new(id: impl Into<String>) -> Self {
        CacheKey::Simple(id.into())
    }

    /// Build a composite key. Fails when no candidate is given.
    pub fn composite<I, S>(candidates: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let candidates: Vec<String> = candidates.into_iter().map(Into::into).collect();
        if candidates.is_empty() {
            return Err(CacheError::InvalidKey(
                "composite key needs at least one candidate".to_string(),
            ));
        }
        Ok(CacheKey::Composite(candidates.into_boxed_slice()))
    }

    /// Candidate identifiers in lookup order. Never empty.
    pub fn candidates(&self) -> &[String] {
        match self {
            CacheKey::Simple(id) => std::slice::from_ref(id),
            CacheKey::Composite(ids) => ids,
        }
    }

    /// The identifier inserts are written under.
    pub fn primary(&self) -> &str {
        &self.candidates()[0]
    }
}

impl From<&str> for CacheKey {
    fn from(id: &str) -> Self {
        CacheKey::new(id)
    }
}

impl From<String> for CacheKey {
    fn from(id: String) -> Self {
        CacheKey::Simple(id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Simple(id) => write!(f, "{}", id),
            CacheKey::Composite(ids) => write!(f, "[{}]", ids.join(", ")),
        }
    }
}

/// Physical address of an entry inside one schema version's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Derive the id for a candidate identifier under a schema version.
    ///
    /// The version is part of the hashed input, so the same candidate maps to
    /// unrelated ids under different versions.
    pub fn derive(candidate: &str, version: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", version, candidate).as_bytes());
        ResourceId(hex::encode(hasher.finalize()))
    }

    /// Accept an already-derived id, e.g. one parsed back from a file name.
    /// Returns `None` unless `raw` is 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| ResourceId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory name.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
