use thiserror::Error;

/// Every failure surface of the core maps to one of these kinds (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    #[error("database is not connected")]
    NotConnected,

    #[error("constraint violation on index {index}: key already present")]
    ConstraintViolation { index: String },

    #[error("transaction conflicted: a sibling already committed on this state")]
    Conflict,

    #[error("operation attempted on a transaction that is not OPEN/NESTED")]
    Closed,

    #[error("state stack exceeded MAX_STACK_SIZE ({0})")]
    StackOverflow(usize),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("storage backend failure: {0}")]
    StorageFailure(String),

    #[error("native map exhausted and autoResize is disabled")]
    SizeExceeded,

    #[error("no such object store: {0}")]
    NoSuchObjectStore(String),

    #[error("no such index: {0}")]
    NoSuchIndex(String),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;
