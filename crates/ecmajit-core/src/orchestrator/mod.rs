//! The JIT Orchestrator: verification, backend-agnostic optimisation, and Cranelift-backed
//! compilation from [`crate::builder::ir::IrModule`] to callable native entry points.
//!
//! [`pipeline::JitOptimizer`] runs first, rewriting each function's IR in place. [`cranelift_backend`]
//! then lowers the optimised IR to a Cranelift [`cranelift_codegen::ir::Function`], which [`verify`]
//! checks before [`engine::JitOrchestrator`] hands it to Cranelift's own codegen and links it into
//! the running process.

pub mod cranelift_backend;
pub mod engine;
pub mod errors;
pub mod pipeline;
pub mod verify;

pub use engine::{HostFunction, JitOrchestrator};
pub use errors::OrchestratorError;
pub use pipeline::JitOptimizer;
