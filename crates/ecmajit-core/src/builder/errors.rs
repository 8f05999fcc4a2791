//! Errors for the handful of builder failures that are reported rather than aborted on.
//!
//! Most builder-precondition violations (wrong stack shape, unbalanced scope pop) are fatal bugs
//! in the opcode stream's producer and are handled by `debug_assert!`/`panic!` at the call site,
//! matching the teacher's convention of aborting with a diagnostic rather than threading a
//! `Result` through every internal invariant check. `BuilderError` exists for the few cases a
//! malformed-but-not-fatal opcode stream can surface to a caller driving the builder directly
//! (e.g. a fuzzer or test harness), and for conversions from [`crate::builder::operand::StackError`].

use crate::builder::operand::StackError;

/// Errors the [`crate::builder::function_builder::FunctionBuilder`] can report without aborting.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("operand stack error: {0}")]
    Stack(#[from] StackError),

    #[error("reference to unresolved locator")]
    UnresolvedLocator,

    #[error("end_function called with a non-empty operand stack ({0} items remaining)")]
    UnbalancedStack(usize),

    #[error("end_function called with an unbalanced control-flow stack")]
    UnbalancedFlow,

    #[error("break/continue with no matching enclosing target (label {0:?})")]
    NoMatchingTarget(Option<u32>),
}
