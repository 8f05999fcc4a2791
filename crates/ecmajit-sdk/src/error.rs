//! Error types for the ABI boundary.

/// Result type for host-side ABI calls.
pub type AbiResult<T> = Result<T, SdkError>;

/// Errors a host can raise while servicing a runtime helper call or inspecting a compiled
/// function's result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdkError {
    /// A `Value`'s `kind` tag did not match what the caller expected.
    #[error("value kind mismatch: expected {expected}, got {got:?}")]
    KindMismatch {
        /// Expected kind, as a human-readable label.
        expected: &'static str,
        /// Actual kind found.
        got: crate::value::ValueKind,
    },

    /// A locator or symbol reference had no corresponding slot.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A host-provided runtime helper failed.
    #[error("runtime helper failed: {0}")]
    HelperFailed(String),
}
