use ocapd_common::refs::RefParseError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock was poisoned")]
    LockPoisoned,
    #[error("failed to decode record at {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("failed to encode record for {key}: {reason}")]
    Encode { key: String, reason: String },
    #[error("malformed key {0:?}")]
    MalformedKey(String),
    #[error("reference parse error: {0}")]
    RefParse(#[from] RefParseError),
    #[cfg(feature = "sql")]
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("sql row has an unexpected column type")]
    SqlInvalidType,
    #[error("{0}")]
    Custom(String),
}
