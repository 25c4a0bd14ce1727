use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection could not be opened or the schema could not be bootstrapped.
    /// The store is unusable.
    #[error("failed to initialize index store: {0}")]
    Init(String),
    /// A flush failed. Flushes that completed earlier in the same call stay committed.
    #[error("failed to write: {0}")]
    Write(String),
    #[error("invalid index record: {0}")]
    InvalidRecord(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("index store is closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
