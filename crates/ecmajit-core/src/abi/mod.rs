//! The Type/ABI layer: concrete layouts and signatures shared between emitted code and the host.
//!
//! Nothing here is stateful — these are factories and constants that both the IR builder and the
//! Cranelift backend consult so that a single schema change propagates everywhere field offsets
//! matter. Code outside this module must never compute a field offset by hand.

pub mod capture;
pub mod closure;
pub mod coroutine;
pub mod flow_selector;
pub mod locator;
pub mod signatures;
pub mod status;

pub use ecmajit_sdk::value::{Value, ValueKind, Variable};
pub use capture::Capture;
pub use closure::Closure;
pub use coroutine::CoroutineFrame;
pub use flow_selector::{FlowKind as SelectorKind, FlowSelector};
pub use locator::{Locator, LocatorKind};
pub use status::Status;
