use bincode::Error as BincodeError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuarryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] BincodeError),

    /// A criterion or aggregate that cannot be compiled as written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Index item {id}: expected {expected} compound field components, got {got}")]
    CompoundKey {
        id: String,
        expected: usize,
        got: usize,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("filter error: {0}")]
    FilterRender(Box<QuarryError>),

    #[error("request encode error: {0}")]
    RequestEncode(String),

    #[error("response decode error: {0}")]
    ResponseDecode(String),

    #[error("Got HTTP {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Unknown backend type {0:?}")]
    UnknownBackend(String),

    #[error("Unknown indexer type {0:?}")]
    UnknownIndexer(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A matched record that could not be loaded, surfaced by typed readers.
    #[error("record {id}: {cause}")]
    Record { id: String, cause: Arc<QuarryError> },
}

impl QuarryError {
    /// Wrap a generator failure so callers can tell it never reached the backend.
    pub fn render(err: QuarryError) -> Self {
        QuarryError::FilterRender(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QuarryError::NotFound(_) | QuarryError::CollectionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;
