use strata_protocol::signature::SignatureError;

pub type SpResult<T> = Result<T, SpError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpError {
    #[error("resource limit exceeded in scope {scope}: {resource} current={current} attempted={attempted} limit={limit}")]
    ResourceLimitExceeded {
        scope: String,
        resource: &'static str,
        current: i64,
        attempted: i64,
        limit: i64,
    },
    #[error("resource scope {0} is closed")]
    ResourceScopeClosed(String),
    #[error("queue {0} exceeds its capacity")]
    QueueExceeded(String),
    #[error("task {0} is repeated")]
    TaskRepeated(String),
    #[error("unsupported task priority {0}")]
    UnsupportedTaskPriority(u8),
    #[error("task pointer dangling")]
    DanglingTaskPointer,
    #[error("secondary storage providers exhausted")]
    ExhaustedSecondarySp,
    #[error("integrity hash mismatch for redundancy index {0}")]
    MismatchIntegrityHash(u32),
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("internal db error: {0}")]
    InternalDb(String),
    #[error("chain timeout: {0}")]
    ChainTimeout(String),
    #[error("cache miss: {0}")]
    CacheMiss(String),
    #[error("payload stream: {0}")]
    Stream(String),
    #[error("erasure coding: {0}")]
    Erasure(String),
    #[error("network: {0}")]
    Network(String),
}

impl From<sled::Error> for SpError {
    fn from(e: sled::Error) -> Self {
        SpError::InternalDb(e.to_string())
    }
}

impl From<bincode::Error> for SpError {
    fn from(e: bincode::Error) -> Self {
        SpError::InternalDb(e.to_string())
    }
}
