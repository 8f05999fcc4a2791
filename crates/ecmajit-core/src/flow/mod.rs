//! The Control-Flow Stack: structured control-flow frames, break/continue targeting, and
//! cleanup/exception block resolution.

pub mod frame;
pub mod stack;

pub use frame::FlowFrame;
pub use stack::ControlFlowStack;
