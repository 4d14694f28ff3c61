//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum; `DataPlaneError` composes
//! them for callers that cross subsystem boundaries (the `Manager`'s public
//! surface). Mirrors the shape of a single flat provider error, split per
//! module because the data plane has more moving parts than one provider.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port {0} is out of range 1..=65535")]
    InvalidPort(u32),
    #[error("env must be one of development, test, production, got {0:?}")]
    InvalidEnv(String),
    #[error("api-keys must not be empty")]
    EmptyApiKeys,
    #[error("duplicate api-key: {0}")]
    DuplicateApiKey(String),
    #[error("rate-limit must be >= 1, got {0}")]
    InvalidRateLimit(i64),
    #[error("file:// URLs are not allowed: {0}")]
    FileUrlNotAllowed(String),
    #[error("path traversal ('..' segment) is not allowed: {0}")]
    PathTraversal(String),
    #[error("auth header is partially specified (name or value empty)")]
    PartialAuthHeader,
    #[error("test environment requires an in-memory data path, got a file path")]
    TestRequiresMemory,
    #[error("merger AGENCY rename mode is not implemented; use CONTEXT")]
    AgencyRenameModeUnimplemented,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("sqlite migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid store configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("network error: {0}")]
    NetworkMessage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed GTFS feed: {0}")]
    Malformed(String),
    #[error("missing required file: {0}")]
    MissingRequiredFile(&'static str),
    #[error("gtfstidy exited with non-zero status: {0}")]
    GtfstidyFailed(i32),
    #[error("ingest was cancelled")]
    Cancelled,
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("network error: {0}")]
    NetworkMessage(String),
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("timed out waiting for feed")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid merge configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("reference cycle detected while resolving {entity_type} id {id}")]
    ReferenceCycle { entity_type: &'static str, id: String },
}

#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("not found")]
    NotFound,
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = DataPlaneError> = std::result::Result<T, E>;
