//! Error taxonomy for the mapper.
//!
//! Errors fall into four families with distinct retry guidance:
//!
//! - [`OdmError::Config`]: the schema or mapper configuration is wrong.
//!   Fatal; fix the item definition.
//! - [`OdmError::Misuse`]: the calling code violated an API contract
//!   (double persist, removing an unmanaged object). Fatal; fix the caller.
//! - [`OdmError::DataConsistency`]: an optimistic-concurrency check lost the
//!   race, or fetched remote data collided with local pending changes.
//!   Retryable after re-reading the affected items.
//! - [`OdmError::Store`]: the underlying store call failed. Retry per the
//!   store's own guidance.

use std::error;

/// Convenience alias used by every fallible operation in the crate.
pub type OdmResult<T> = Result<T, OdmError>;

/// The error type returned by all mapper operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OdmError {
    /// The item schema or mapper configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The calling code violated an API contract.
    #[error("invalid operation: {0}")]
    Misuse(String),

    /// An optimistic-concurrency check failed, or remote data conflicted
    /// with local pending changes.
    #[error("data consistency violation for {item_type}: {reason}")]
    DataConsistency {
        /// Name of the item type whose write or merge failed.
        item_type: &'static str,
        /// What went wrong, in terms of the conflicting state.
        reason: String,
    },

    /// A call to the underlying store failed.
    #[error("store operation {operation} failed: {source}")]
    Store {
        /// The store primitive that failed, e.g. `PutItem`.
        operation: &'static str,
        /// The wrapped store error.
        #[source]
        source: Box<dyn error::Error + Send + Sync>,
    },

    /// A field value could not be converted to or from its stored
    /// attribute representation.
    #[error(transparent)]
    Serde(#[from] serde_dynamo::Error),
}

impl OdmError {
    /// Wraps a store-level failure with the name of the failing primitive.
    pub fn store<E>(operation: &'static str, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self::Store {
            operation,
            source: Box::new(source),
        }
    }
}
