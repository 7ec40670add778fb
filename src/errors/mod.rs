//! Error types for the ledger
//!
//! - **LedgerError**: service level failures (lookups, state transitions, timeouts)
//! - **StorageError**: object storage backends
//! - **TransformError**: local and remote transforms
//!
//! Storage and transform errors raised while a derivation is running are
//! recorded on the derivation row; see [`LedgerError::failure_kind`].

pub mod ledger;
pub mod storage;
pub mod transform;

pub use ledger::LedgerError;
pub use storage::StorageError;
pub use transform::TransformError;

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for transform operations
pub type TransformResult<T> = Result<T, TransformError>;
