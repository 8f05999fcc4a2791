//! Errors surfaced while verifying, optimising, lowering, or linking a module.

use thiserror::Error;

/// Failures the orchestrator can report. Builder-precondition violations (malformed IR fed by a
/// misbehaving front end) are not represented here — those are `panic!`s at the point they're
/// detected, matching the convention used throughout `builder::function_builder`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The Cranelift IR verifier rejected a lowered function. Carries its formatted diagnostic.
    #[error("verification failed for function `{function}`: {detail}")]
    Verification { function: String, detail: String },

    /// Cranelift's own codegen pipeline (lowering, regalloc, emission) failed.
    #[error("codegen failed for function `{function}`: {detail}")]
    Codegen { function: String, detail: String },

    /// A module or function could not be declared/defined against the JIT module.
    #[error("module registration failed: {0}")]
    ModuleRegistration(String),

    /// A symbol (a runtime helper or a compiled function) was looked up by name/id and not found.
    #[error("unresolved symbol: {0}")]
    SymbolResolution(String),

    /// The target ISA could not be constructed for the host machine.
    #[error("failed to initialise target ISA: {0}")]
    TargetIsa(String),
}
