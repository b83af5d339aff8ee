//! Error types for the disk blob cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Io(Box<std::io::Error>),
    /// The caller-supplied writer failed; the insert was rolled back.
    Writer(Box<std::io::Error>),
    Disabled,
    InvalidKey(String),
    Config(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Writer(err) => write!(f, "Writer callback failed: {}", err),
            CacheError::Disabled => write!(f, "Cache storage is disabled"),
            CacheError::InvalidKey(msg) => write!(f, "Invalid cache key: {}", msg),
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) | CacheError::Writer(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
