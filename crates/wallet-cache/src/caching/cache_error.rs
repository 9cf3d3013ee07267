use thiserror::Error;

/// An error raised by a [`Cache`](super::Cache) implementation.
///
/// Cache errors are never expected during normal operation. The resolver annotates them with the
/// failing operation and hands them to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backing store could not be reached or refused the operation.
    ///
    /// The attached string contains the store's reason.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}
