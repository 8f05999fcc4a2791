//! Shared ABI types for the ecmajit JIT core and its host.
//!
//! This crate provides the minimal, `#[repr(C)]` types that cross the boundary between
//! JIT-compiled code and the host runtime, without depending on `ecmajit-core` itself. A host
//! embedding the JIT links against this crate to interpret values written to `retv` slots and to
//! implement the runtime helper table (see [`error`] and [`value`]).

#![warn(missing_docs)]

pub mod error;
pub mod value;

pub use error::{AbiResult, SdkError};
pub use value::{Value, ValueKind, Variable, VARIABLE_MUTABLE, VARIABLE_DELETABLE, VARIABLE_INITIALIZED, VARIABLE_STRICT};
