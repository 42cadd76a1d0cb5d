use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("not connected")]
    NotConnected,

    #[error("engine is read-only")]
    NotWritable,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("invalid generated column: {0}")]
    InvalidGeneratedColumn(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index already exists: {0}")]
    DuplicateIndex(String),

    #[error("unsupported index kind: {0}")]
    UnsupportedIndexKind(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("snapshot not found for transaction {0}")]
    SnapshotNotFound(u64),

    #[error("Duplicate entry '{value}' for key '{key}'")]
    DuplicateEntry { value: String, key: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("page decode error: {0}")]
    PageDecode(String),

    #[error("spill IO error: {0}")]
    SpillIo(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Whether this error is a unique-constraint violation.
    pub fn is_duplicate_entry(&self) -> bool {
        matches!(self, DbError::DuplicateEntry { .. })
    }
}
