//! Exit taxonomy shared by every layer of the serving core.

use thiserror::Error;

/// Errors surfaced by the serving core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferError {
    /// Reading or writing data failed
    #[error("read/write failed: {0}")]
    ReadWrite(String),

    /// Allocation or copy failed
    #[error("memory error: {0}")]
    Memory(String),

    /// A required parameter is missing or malformed
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A dynamic value slot held a type its consumer cannot use
    #[error("wrong data type: {0}")]
    WrongType(String),

    /// The device or a stage processor failed
    #[error("backend error: {0}")]
    Backend(String),

    /// The requested operation is not implemented
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A bounded wait expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// The target resource is stopped or was torn down
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Completion status of an operation, a data item, or a whole request.
///
/// `Ok(())` is success; the error variant carries the exit kind. The
/// fan-in logic in [`crate::serve::RequestControl`] keeps the first
/// non-success status it sees.
pub type Status = Result<(), InferError>;
