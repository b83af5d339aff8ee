//! Error types for the disk cache admin tool

use std::fmt;

#[derive(Debug)]
pub enum AdminError {
    Cache(disk_blob_cache::CacheError),
    Config(String),
    Serialization(serde_json::Error),
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminError::Cache(err) => write!(f, "Cache error: {}", err),
            AdminError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AdminError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdminError::Cache(err) => Some(err),
            AdminError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<disk_blob_cache::CacheError> for AdminError {
    fn from(err: disk_blob_cache::CacheError) -> Self {
        AdminError::Cache(err)
    }
}

impl From<serde_json::Error> for AdminError {
    fn from(err: serde_json::Error) -> Self {
        AdminError::Serialization(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for AdminError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        AdminError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AdminError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_cache_error_display() {
        let err = AdminError::from(disk_blob_cache::CacheError::Disabled);
        assert_eq!(format!("{}", err), "Cache error: Cache storage is disabled");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_serialization_error_display() {
        let err = AdminError::from(serde_json::from_str::<u64>("nope").unwrap_err());
        assert!(format!("{}", err).starts_with("Serialization error: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_config_error_display() {
        let err = AdminError::Config("bad filter".to_string());
        assert_eq!(format!("{}", err), "Configuration error: bad filter");
    }

    #[test]
    fn test_error_is_debug() {
        let err = AdminError::Config("test".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
    }
}
