//! Cranelift `Signature` factories for the lambda ABI and every host runtime helper.
//!
//! Centralising signature construction here means a single schema change (e.g. widening `argc`)
//! propagates to both the IR builder's call-emission code and the orchestrator's symbol
//! registration, instead of being duplicated at each call site.

use cranelift_codegen::ir::{types, AbiParam, Signature};
use cranelift_codegen::isa::CallConv;

/// Canonical names every runtime helper is registered under. The orchestrator looks functions up
/// by these names; the IR builder emits calls to them by the same names.
pub mod helper_names {
    pub const TO_BOOLEAN: &str = "runtime_to_boolean";
    pub const TO_NUMERIC: &str = "runtime_to_numeric";
    pub const TO_INT32: &str = "runtime_to_int32";
    pub const TO_UINT32: &str = "runtime_to_uint32";
    pub const IS_LOOSELY_EQUAL: &str = "runtime_is_loosely_equal";
    pub const IS_STRICTLY_EQUAL: &str = "runtime_is_strictly_equal";
    pub const CREATE_CAPTURE: &str = "runtime_create_capture";
    pub const CREATE_CLOSURE: &str = "runtime_create_closure";
    pub const CREATE_COROUTINE: &str = "runtime_create_coroutine";
    pub const REGISTER_PROMISE: &str = "runtime_register_promise";
    pub const AWAIT_PROMISE: &str = "runtime_await_promise";
    pub const RESUME_PROMISE: &str = "runtime_resume_promise";
    pub const EMIT_PROMISE_RESOLVED: &str = "runtime_emit_promise_resolved";
    pub const CREATE_OBJECT: &str = "runtime_create_object";
    pub const GET_VALUE: &str = "runtime_get_value";
    pub const SET_VALUE: &str = "runtime_set_value";
    pub const CREATE_DATA_PROPERTY: &str = "runtime_create_data_property";
    pub const COPY_DATA_PROPERTIES: &str = "runtime_copy_data_properties";
    pub const ASSERT: &str = "runtime_assert";
    pub const PRINT_VALUE: &str = "runtime_print_value";

    /// Every helper name, for iterating when registering a full table.
    pub const ALL: &[&str] = &[
        TO_BOOLEAN,
        TO_NUMERIC,
        TO_INT32,
        TO_UINT32,
        IS_LOOSELY_EQUAL,
        IS_STRICTLY_EQUAL,
        CREATE_CAPTURE,
        CREATE_CLOSURE,
        CREATE_COROUTINE,
        REGISTER_PROMISE,
        AWAIT_PROMISE,
        RESUME_PROMISE,
        EMIT_PROMISE_RESOLVED,
        CREATE_OBJECT,
        GET_VALUE,
        SET_VALUE,
        CREATE_DATA_PROPERTY,
        COPY_DATA_PROPERTIES,
        ASSERT,
        PRINT_VALUE,
    ];
}

/// The signature shared by every emitted lambda: `fn(rt, ctx, argc, argv, retv) -> status`.
pub fn lambda_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // rt
    sig.params.push(AbiParam::new(types::I64)); // ctx
    sig.params.push(AbiParam::new(types::I64)); // argc
    sig.params.push(AbiParam::new(types::I64)); // argv
    sig.params.push(AbiParam::new(types::I64)); // retv
    sig.returns.push(AbiParam::new(types::I32)); // status
    sig
}

/// Builds the Cranelift signature for a named runtime helper. Panics if `name` is not one of
/// [`helper_names::ALL`] — an unrecognised helper name is a builder-precondition bug, not a
/// recoverable error.
pub fn helper_signature(name: &str, call_conv: CallConv) -> Signature {
    use helper_names::*;
    let mut sig = Signature::new(call_conv);
    let ptr = AbiParam::new(types::I64);
    match name {
        TO_BOOLEAN => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value
            sig.returns.push(AbiParam::new(types::I8)); // bool
        }
        TO_NUMERIC => {
            sig.params.push(ptr);
            sig.params.push(ptr);
            sig.returns.push(AbiParam::new(types::F64));
        }
        TO_INT32 => {
            sig.params.push(ptr);
            sig.params.push(AbiParam::new(types::F64));
            sig.returns.push(AbiParam::new(types::I32));
        }
        TO_UINT32 => {
            sig.params.push(ptr);
            sig.params.push(AbiParam::new(types::F64));
            sig.returns.push(AbiParam::new(types::I32));
        }
        IS_LOOSELY_EQUAL | IS_STRICTLY_EQUAL => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value lhs
            sig.params.push(ptr); // *Value rhs
            sig.returns.push(AbiParam::new(types::I8));
        }
        CREATE_CAPTURE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Variable
            sig.returns.push(ptr); // *Capture
        }
        CREATE_CLOSURE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // lambda
            sig.params.push(AbiParam::new(types::I16)); // num_captures
            sig.returns.push(ptr); // *Closure
        }
        CREATE_COROUTINE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Closure
            sig.params.push(AbiParam::new(types::I16)); // num_locals
            sig.params.push(AbiParam::new(types::I16)); // scratch_len
            sig.returns.push(ptr); // *CoroutineFrame
        }
        REGISTER_PROMISE | CREATE_OBJECT => {
            sig.params.push(ptr); // rt
            sig.returns.push(ptr);
        }
        AWAIT_PROMISE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value promise
            sig.params.push(ptr); // *CoroutineFrame
            sig.returns.push(AbiParam::new(types::I32)); // status
        }
        RESUME_PROMISE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *CoroutineFrame
            sig.returns.push(AbiParam::new(types::I32));
        }
        EMIT_PROMISE_RESOLVED => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value promise
            sig.params.push(ptr); // *Value resolution
        }
        GET_VALUE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value object
            sig.params.push(ptr); // *Value key
            sig.returns.push(ptr); // *Value out
        }
        SET_VALUE | CREATE_DATA_PROPERTY => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value object
            sig.params.push(ptr); // *Value key
            sig.params.push(ptr); // *Value value
        }
        COPY_DATA_PROPERTIES => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value target
            sig.params.push(ptr); // *Value source
        }
        ASSERT => {
            sig.params.push(ptr); // rt
            sig.params.push(AbiParam::new(types::I8)); // condition
            sig.params.push(ptr); // message pointer
        }
        PRINT_VALUE => {
            sig.params.push(ptr); // rt
            sig.params.push(ptr); // *Value
        }
        other => panic!("unknown runtime helper: {other}"),
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_helper_has_a_signature() {
        for name in helper_names::ALL {
            let _ = helper_signature(name, CallConv::SystemV);
        }
    }

    #[test]
    fn lambda_signature_has_five_params_and_one_return() {
        let sig = lambda_signature(CallConv::SystemV);
        assert_eq!(sig.params.len(), 5);
        assert_eq!(sig.returns.len(), 1);
    }

    #[test]
    #[should_panic(expected = "unknown runtime helper")]
    fn unknown_helper_panics() {
        helper_signature("not_a_real_helper", CallConv::SystemV);
    }
}
