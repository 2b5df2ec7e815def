use thiserror::Error;

/// Errors raised while enumerating or watching OS state
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("enumeration failed: {0}")]
    Enumeration(String),

    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the local event store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("payload encryption failed")]
    Crypto,

    #[error("payload too short")]
    Truncated,

    #[error("unknown event table: {0}")]
    UnknownTable(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the bus publisher
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bus rejected message: {status} {body}")]
    Status { status: u16, body: String },

    #[error("envelope encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("publisher closed")]
    Closed,
}

/// Errors surfaced to callers of the orchestrator
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("telemetry pipeline is already running")]
    AlreadyRunning,

    #[error("telemetry pipeline is not running")]
    NotRunning,

    #[error("telemetry pipeline was stopped; its store and publisher are closed")]
    Closed,

    #[error("unknown data type: {0}")]
    UnknownTarget(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
