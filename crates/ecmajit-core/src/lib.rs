//! JIT code-generation core for an embeddable JavaScript runtime.
//!
//! This crate consumes a stream of semantic opcodes — produced by an external front end that has
//! already parsed, scoped, and resolved identifiers — and builds one SSA [`builder::ir::IrFunction`]
//! per source function via [`builder::function_builder::FunctionBuilder`]. Structured control flow
//! (conditionals, loops, switch/case, try/catch/finally) is tracked by [`flow::stack::ControlFlowStack`].
//! Finished modules are handed to [`orchestrator::engine::JitOrchestrator`], which verifies,
//! optimises, and compiles them to native code via Cranelift, then exposes callable entry points.
//!
//! The four components live in their own modules:
//! - [`abi`] — value/variable/capture/closure/coroutine layouts and the runtime helper ABI.
//! - [`builder`] — the per-function IR builder and its opcode method surface.
//! - [`flow`] — the control-flow stack.
//! - [`orchestrator`] — verification, optimisation, and Cranelift-backed JIT compilation.

pub mod abi;
pub mod builder;
pub mod flow;
pub mod orchestrator;

pub use abi::status::Status;
pub use builder::function_builder::FunctionBuilder;
pub use builder::ir::{IrFunction, IrModule};
pub use orchestrator::engine::JitOrchestrator;
