//! Ties verification, optimisation, and Cranelift lowering together into one JIT pipeline: declare
//! runtime helpers against a host-supplied symbol table, register a module's functions, compile
//! them, and hand back callable entry points.

use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use target_lexicon::Triple;

use crate::abi::closure::Lambda;
use crate::abi::signatures::{helper_names, helper_signature, lambda_signature};
use crate::builder::ir::IrModule;
use crate::orchestrator::cranelift_backend::{self, FuncTable, HelperTable};
use crate::orchestrator::errors::OrchestratorError;
use crate::orchestrator::pipeline::JitOptimizer;
use crate::orchestrator::verify;

/// A named, host-provided function pointer to register as a runtime helper's implementation. The
/// pointer must remain valid for the lifetime of the orchestrator — the caller owns it.
pub struct HostFunction {
    pub name: &'static str,
    pub address: *const u8,
}

/// Compiles [`IrModule`]s to native code and resolves their functions to callable [`Lambda`]s.
///
/// One orchestrator owns one [`JITModule`]; every module registered against it shares the same
/// function/helper symbol namespace, so functions in different `register_module` calls can call
/// each other as long as the callee was declared first.
pub struct JitOrchestrator {
    module: JITModule,
    funcs: FuncTable,
    helpers: HelperTable,
    optimizer: JitOptimizer,
}

impl JitOrchestrator {
    /// Builds a fresh orchestrator targeting the host machine, registering `host_functions` as the
    /// concrete implementations backing every name in [`helper_names::ALL`]. Panics are reserved
    /// for IR-level preconditions; this constructor reports failures that originate outside this
    /// crate's control (ISA construction, symbol declaration) as [`OrchestratorError`].
    pub fn new(host_functions: &[HostFunction]) -> Result<Self, OrchestratorError> {
        let isa = Self::build_isa()?;
        let call_conv = isa.default_call_conv();

        let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for host_fn in host_functions {
            jit_builder.symbol(host_fn.name, host_fn.address);
        }
        let mut module = JITModule::new(jit_builder);

        let mut helpers = HelperTable::default();
        for name in helper_names::ALL {
            let sig = helper_signature(name, call_conv);
            let id = module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(|e| OrchestratorError::ModuleRegistration(e.to_string()))?;
            helpers.insert(*name, id);
        }

        Ok(JitOrchestrator { module, funcs: FuncTable::default(), helpers, optimizer: JitOptimizer::new() })
    }

    /// Constructs an orchestrator with a custom optimisation pipeline (e.g. [`JitOptimizer::empty`]
    /// for debugging unoptimised output).
    pub fn with_optimizer(host_functions: &[HostFunction], optimizer: JitOptimizer) -> Result<Self, OrchestratorError> {
        let mut orchestrator = Self::new(host_functions)?;
        orchestrator.optimizer = optimizer;
        Ok(orchestrator)
    }

    fn build_isa() -> Result<Arc<dyn TargetIsa>, OrchestratorError> {
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed").map_err(|e| OrchestratorError::TargetIsa(e.to_string()))?;
        flag_builder.set("is_pic", "false").map_err(|e| OrchestratorError::TargetIsa(e.to_string()))?;
        let flags = settings::Flags::new(flag_builder);
        cranelift_native::builder()
            .map_err(|e| OrchestratorError::TargetIsa(e.to_string()))?
            .finish(flags)
            .map_err(|e| OrchestratorError::TargetIsa(e.to_string()))
    }

    /// Declares every function in `ir_module` before lowering any of them, so that a function may
    /// call another function declared later in the same module (forward references, mutual
    /// recursion) or a closure constructed from its `ConstFunctionRef`.
    pub fn register_module(&mut self, ir_module: &IrModule) -> Result<(), OrchestratorError> {
        log::debug!("registering module with {} function(s)", ir_module.functions.len());
        let call_conv = self.module.isa().default_call_conv();
        for func in &ir_module.functions {
            let sig = lambda_signature(call_conv);
            let id = self
                .module
                .declare_function(&func.name, Linkage::Local, &sig)
                .map_err(|e| OrchestratorError::ModuleRegistration(e.to_string()))?;
            self.funcs.insert(func.func_id, id);
        }

        for func in &ir_module.functions {
            let mut optimized = func.clone();
            self.optimizer.optimize(&mut optimized);

            let clif_func = cranelift_backend::lower(&optimized, &mut self.module, &self.funcs, &self.helpers);
            verify::verify(&clif_func, self.module.isa())?;

            let mut ctx = Context::new();
            ctx.func = clif_func;
            let func_id = self.funcs[&func.func_id];
            self.module.define_function(func_id, &mut ctx).map_err(|e| {
                log::warn!("codegen failed for function '{}': {e}", func.name);
                OrchestratorError::Codegen { function: func.name.clone(), detail: e.to_string() }
            })?;
            log::trace!("defined function '{}' (id {})", func.name, func.func_id);
        }
        Ok(())
    }

    /// Finalises all definitions registered so far, making their addresses valid to read. Must be
    /// called once after every `register_module` call and before any `lookup`.
    pub fn finalize(&mut self) {
        self.module.finalize_definitions().expect("finalizing a JIT module's definitions cannot fail after successful defines");
        log::debug!("finalized {} function(s)", self.funcs.len());
    }

    /// Resolves a module-level function id to its compiled entry point. Returns `None` if no
    /// function with that id was registered.
    pub fn lookup(&self, func_id: u32) -> Option<Lambda> {
        let id = *self.funcs.get(&func_id).or_else(|| {
            log::trace!("lookup miss for function id {func_id}");
            None
        })?;
        let code_ptr = self.module.get_finalized_function(id);
        // SAFETY: `code_ptr` was produced by this module's own `define_function`/
        // `finalize_definitions` for a function lowered from `lambda_signature`, so its calling
        // convention and argument layout match `Lambda` exactly.
        Some(unsafe { std::mem::transmute::<*const u8, Lambda>(code_ptr) })
    }

    /// Resolves a function id to its raw code pointer, for hosts that want to build their own
    /// calling shim instead of calling through [`Lambda`] directly.
    pub fn lookup_raw(&self, func_id: u32) -> Option<*const u8> {
        let id = *self.funcs.get(&func_id)?;
        Some(self.module.get_finalized_function(id))
    }

    /// The helper `FuncId` table, exposed so embedding hosts can sanity-check registration.
    pub fn helper_ids(&self) -> &HelperTable {
        &self.helpers
    }

    /// The target triple this orchestrator compiles for.
    pub fn target_triple(&self) -> &Triple {
        self.module.isa().triple()
    }
}
