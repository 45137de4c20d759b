use thiserror::Error;

/// Opaque fatal error from the storage collaborator (the journal table or
/// the blob-lease backend). The storage SDK itself is an external
/// collaborator to this crate, so its errors are carried boxed rather
/// than matched on.
#[derive(Debug)]
pub struct StorageError(pub Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        StorageError(Box::new(err))
    }
}

/// Error taxonomy surfaced to callers of this crate (§7).
///
/// The acquisition path never returns an error to report "did not
/// acquire" — see [`crate::acquire`]. Only programming errors,
/// cancellation, and unexpected backend failures are represented here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Storage(StorageError::new(err))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }
}
