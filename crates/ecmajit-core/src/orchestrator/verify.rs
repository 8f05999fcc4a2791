//! Runs the Cranelift IR verifier over a lowered function before it is handed to codegen.
//!
//! A function that fails here is either a bug in `cranelift_backend`'s lowering or a bug in one of
//! the optimisation passes — never a front-end mistake, since by this point the function has
//! already been built and `finish()`ed by `FunctionBuilder`. Failure is therefore reported, not
//! silently swallowed, so that it surfaces during development rather than miscompiling silently.

use cranelift_codegen::ir::Function;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::verify_function;

use crate::orchestrator::errors::OrchestratorError;

/// Verifies `func` against `isa`'s calling convention and encoding constraints.
pub fn verify(func: &Function, isa: &dyn TargetIsa) -> Result<(), OrchestratorError> {
    verify_function(func, isa.flags()).map_err(|errors| OrchestratorError::Verification {
        function: func.name.to_string(),
        detail: errors.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{types, AbiParam, InstBuilder, Signature, UserFuncName};
    use cranelift_codegen::isa::CallConv;
    use cranelift_codegen::settings::{self, Configurable};
    use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

    fn host_isa() -> std::sync::Arc<dyn TargetIsa> {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed").unwrap();
        let flags = settings::Flags::new(flag_builder);
        cranelift_native::builder().unwrap().finish(flags).unwrap()
    }

    #[test]
    fn well_formed_function_verifies() {
        let isa = host_isa();
        let mut sig = Signature::new(CallConv::SystemV);
        sig.returns.push(AbiParam::new(types::I32));
        let mut func = Function::with_name_signature(UserFuncName::user(0, 0), sig);
        let mut fn_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut func, &mut fn_ctx);
            let block = builder.create_block();
            builder.switch_to_block(block);
            builder.seal_block(block);
            let forty_two = builder.ins().iconst(types::I32, 42);
            builder.ins().return_(&[forty_two]);
            builder.finalize();
        }
        assert!(verify(&func, &*isa).is_ok());
    }

    #[test]
    fn function_missing_terminator_fails_verification() {
        let isa = host_isa();
        let sig = Signature::new(CallConv::SystemV);
        let mut func = Function::with_name_signature(UserFuncName::user(0, 0), sig);
        let mut fn_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut func, &mut fn_ctx);
            let block = builder.create_block();
            builder.switch_to_block(block);
            builder.seal_block(block);
            // No terminator is emitted before `finalize`.
            builder.ensure_inserted_block();
        }
        assert!(verify(&func, &*isa).is_err());
    }
}
