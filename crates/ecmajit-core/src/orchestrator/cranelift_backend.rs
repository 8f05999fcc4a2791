//! Lowers one optimised [`IrFunction`] into a Cranelift [`ir::Function`].
//!
//! Every virtual register becomes a Cranelift [`Variable`]; Cranelift's own SSA construction
//! (triggered by `declare_var`/`use_var`/`def_var` over sealed blocks) handles merges at join
//! points, so this lowering never has to build phi nodes by hand. `IrInstr::Phi` is consequently
//! never produced by `FunctionBuilder` and is treated as unreachable here.
//!
//! "Any" values are represented uniformly as a pointer to a 16-byte `Value`-shaped region: a local
//! slot's address, an argument slot inside the caller's `argv` buffer, a per-call-site `retv` stack
//! temporary, or a freshly boxed temporary. Since [`ecmajit_sdk::value::Variable`] and
//! [`ecmajit_sdk::value::Value`] share the same `kind`/`holder` byte offsets, a local slot's raw
//! address can serve as an `Any` value with no copy; writing *into* a slot or capture target still
//! needs an explicit partial copy so the `flags`/`symbol` bytes of the underlying `Variable` are
//! left untouched.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{self, types, InstBuilder, MemFlags, StackSlotData, StackSlotKind};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch, Variable};
use cranelift_module::{FuncId, Module};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::abi::signatures::{helper_names, lambda_signature};
use crate::abi::{Capture, Closure, CoroutineFrame};
use crate::builder::ir::{BlockId, FCmpOp, IrFunction, IrInstr, IrTerminator, IrType, LocalSlot, Reg};

/// Maps this module's function ids (as carried by `ConstFunctionRef`/`CreateClosure`) to the
/// `FuncId`s already declared against the `Module` doing the lowering.
pub type FuncTable = FxHashMap<u32, FuncId>;

/// Maps runtime helper names (see [`helper_names`]) to their declared `FuncId`s.
pub type HelperTable = FxHashMap<&'static str, FuncId>;

const KIND_OFFSET: i32 = 0;
const HOLDER_OFFSET: i32 = 8;
const VALUE_SIZE: u32 = 16;
const STACK_SLOT_ALIGN_SHIFT: u8 = 3;

const KIND_UNDEFINED: i64 = 1;
const KIND_NULL: i64 = 2;
const KIND_BOOLEAN: i64 = 3;
const KIND_NUMBER: i64 = 4;
const KIND_CLOSURE: i64 = 6;

fn clif_type(ty: IrType, ptr_type: ir::Type) -> ir::Type {
    match ty {
        IrType::I32 | IrType::U32 => types::I32,
        IrType::F64 => types::F64,
        IrType::Bool => types::I8,
        IrType::Ptr | IrType::Any => ptr_type,
    }
}

/// Lowers `func` against `module`'s target configuration, producing a freestanding Cranelift
/// function ready for `Module::define_function`. `funcs` and `helpers` must already contain every
/// id/name this function's body references — a missing entry is a bug in module registration, not
/// a recoverable error, and panics.
pub fn lower(func: &IrFunction, module: &mut dyn Module, funcs: &FuncTable, helpers: &HelperTable) -> ir::Function {
    let config = module.target_config();
    let mut clif_func =
        ir::Function::with_name_signature(ir::UserFuncName::user(0, func.func_id), lambda_signature(config.default_call_conv));
    let mut fn_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut clif_func, &mut fn_ctx);
        LoweringContext::lower(func, module, funcs, helpers, config.pointer_type(), &mut builder);
    }
    clif_func
}

struct EntryParams {
    rt: ir::Value,
    ctx: ir::Value,
    argv: ir::Value,
    retv: ir::Value,
}

fn predecessors(func: &IrFunction) -> FxHashMap<u32, Vec<u32>> {
    let mut preds: FxHashMap<u32, Vec<u32>> = FxHashMap::default();
    for (idx, block) in func.blocks.iter().enumerate() {
        let mut add = |target: u32| preds.entry(target).or_default().push(idx as u32);
        match &block.terminator {
            Some(IrTerminator::Jump { target }) => add(target.0),
            Some(IrTerminator::Branch { then_block, else_block, .. }) => {
                add(then_block.0);
                add(else_block.0);
            }
            Some(IrTerminator::Switch { cases, default, .. }) => {
                for (_, target) in cases {
                    add(target.0);
                }
                add(default.0);
            }
            _ => {}
        }
    }
    preds
}

fn loop_headers(func: &IrFunction, preds: &FxHashMap<u32, Vec<u32>>) -> FxHashSet<u32> {
    let mut headers = FxHashSet::default();
    for idx in 0..func.blocks.len() as u32 {
        if let Some(ps) = preds.get(&idx) {
            if ps.iter().any(|&p| p >= idx) {
                headers.insert(idx);
            }
        }
    }
    headers
}

/// Per-function lowering state: the register-to-`Variable` map, the Cranelift block table, and
/// the lazily-created stack slots backing local variable storage.
struct LoweringContext<'a> {
    func: &'a IrFunction,
    module: &'a mut dyn Module,
    funcs: &'a FuncTable,
    helpers: &'a HelperTable,
    ptr_type: ir::Type,
    reg_vars: FxHashMap<Reg, Variable>,
    block_map: FxHashMap<u32, ir::Block>,
    local_slots: FxHashMap<LocalSlot, ir::StackSlot>,
    status_var: Variable,
    flow_selector_var: Variable,
    entry: EntryParams,
}

impl<'a> LoweringContext<'a> {
    fn lower(
        func: &'a IrFunction,
        module: &'a mut dyn Module,
        funcs: &'a FuncTable,
        helpers: &'a HelperTable,
        ptr_type: ir::Type,
        builder: &mut FunctionBuilder<'_>,
    ) {
        let mut block_map = FxHashMap::default();
        for idx in 0..func.blocks.len() as u32 {
            block_map.insert(idx, builder.create_block());
        }

        let preds = predecessors(func);
        let headers = loop_headers(func, &preds);

        let entry_block = block_map[&func.entry.0];
        builder.append_block_params_for_function_params(entry_block);
        let params = builder.block_params(entry_block).to_vec();
        let entry = EntryParams { rt: params[0], ctx: params[1], argv: params[3], retv: params[4] };

        let status_var = builder.declare_var(types::I32);
        let flow_selector_var = builder.declare_var(types::I32);

        let mut ctx = LoweringContext {
            func,
            module,
            funcs,
            helpers,
            ptr_type,
            reg_vars: FxHashMap::default(),
            block_map,
            local_slots: FxHashMap::default(),
            status_var,
            flow_selector_var,
            entry,
        };
        ctx.declare_all_regs(builder);

        for idx in 0..func.blocks.len() as u32 {
            let cl_block = ctx.block_map[&idx];
            builder.switch_to_block(cl_block);
            if !headers.contains(&idx) {
                builder.seal_block(cl_block);
            }
            ctx.lower_block(BlockId(idx), builder);
        }

        for header in &headers {
            builder.seal_block(ctx.block_map[header]);
        }

        builder.finalize();
    }

    fn declare_all_regs(&mut self, builder: &mut FunctionBuilder<'_>) {
        for (reg, ty) in self.func.reg_types.iter() {
            let var = builder.declare_var(clif_type(*ty, self.ptr_type));
            self.reg_vars.insert(*reg, var);
        }
    }

    fn use_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> ir::Value {
        builder.use_var(self.reg_vars[&reg])
    }

    fn def_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg, val: ir::Value) {
        builder.def_var(self.reg_vars[&reg], val);
    }

    fn reg_type(&self, reg: Reg) -> IrType {
        self.func.reg_types[&reg]
    }

    fn local_slot_addr(&mut self, builder: &mut FunctionBuilder<'_>, slot: LocalSlot) -> ir::Value {
        if self.func.is_coroutine {
            let flags = MemFlags::trusted();
            let locals_ptr = builder.ins().load(self.ptr_type, flags, self.entry.ctx, CoroutineFrame::LOCALS_OFFSET);
            return builder.ins().iadd_imm(locals_ptr, (slot.0 as i64) * VALUE_SIZE as i64);
        }
        let ptr_type = self.ptr_type;
        let ss = *self
            .local_slots
            .entry(slot)
            .or_insert_with(|| builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, VALUE_SIZE, STACK_SLOT_ALIGN_SHIFT)));
        builder.ins().stack_addr(ptr_type, ss, 0)
    }

    fn fresh_value_slot(&mut self, builder: &mut FunctionBuilder<'_>) -> ir::Value {
        let ss = builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, VALUE_SIZE, STACK_SLOT_ALIGN_SHIFT));
        builder.ins().stack_addr(self.ptr_type, ss, 0)
    }

    /// Copies the `kind` byte and `holder` qword from `src` (an `Any` pointer) into `dst` (a
    /// `Value`- or `Variable`-shaped location), leaving any trailing `Variable`-only bytes alone.
    fn copy_value_fields(&self, builder: &mut FunctionBuilder<'_>, src: ir::Value, dst: ir::Value) {
        let flags = MemFlags::trusted();
        let kind = builder.ins().load(types::I8, flags, src, KIND_OFFSET);
        builder.ins().store(flags, kind, dst, KIND_OFFSET);
        let holder = builder.ins().load(types::I64, flags, src, HOLDER_OFFSET);
        builder.ins().store(flags, holder, dst, HOLDER_OFFSET);
    }

    fn write_value_tag(&self, builder: &mut FunctionBuilder<'_>, addr: ir::Value, kind: i64, holder: ir::Value) {
        let flags = MemFlags::trusted();
        let kind_val = builder.ins().iconst(types::I8, kind);
        builder.ins().store(flags, kind_val, addr, KIND_OFFSET);
        builder.ins().store(flags, holder, addr, HOLDER_OFFSET);
    }

    fn helper_func_ref(&mut self, builder: &mut FunctionBuilder<'_>, name: &'static str) -> ir::FuncRef {
        let func_id = *self.helpers.get(name).unwrap_or_else(|| panic!("runtime helper `{name}` was never registered"));
        self.module.declare_func_in_func(func_id, builder.func)
    }

    fn call_helper(&mut self, builder: &mut FunctionBuilder<'_>, name: &'static str, args: &[ir::Value]) -> Option<ir::Value> {
        let func_ref = self.helper_func_ref(builder, name);
        let call = builder.ins().call(func_ref, args);
        builder.inst_results(call).first().copied()
    }

    fn emit_create_closure(&mut self, builder: &mut FunctionBuilder<'_>, func_id: u32, captures: &[Reg]) -> ir::Value {
        let target_func_id = *self.funcs.get(&func_id).unwrap_or_else(|| panic!("function id {func_id} was never declared"));
        let func_ref = self.module.declare_func_in_func(target_func_id, builder.func);
        let lambda_ptr = builder.ins().func_addr(self.ptr_type, func_ref);
        let num_captures = builder.ins().iconst(types::I16, captures.len() as i64);
        let rt = self.entry.rt;
        let closure_ptr = self
            .call_helper(builder, helper_names::CREATE_CLOSURE, &[rt, lambda_ptr, num_captures])
            .expect("runtime_create_closure must return a pointer");

        if !captures.is_empty() {
            let flags = MemFlags::trusted();
            let table_ptr = builder.ins().load(self.ptr_type, flags, closure_ptr, Closure::CAPTURES_OFFSET);
            for (i, &capture_reg) in captures.iter().enumerate() {
                let capture_val = self.use_reg(builder, capture_reg);
                builder.ins().store(flags, capture_val, table_ptr, (i as i32) * 8);
            }
        }
        closure_ptr
    }

    fn lower_block(&mut self, block_id: BlockId, builder: &mut FunctionBuilder<'_>) {
        let instrs = self.func.block(block_id).instrs.clone();
        let terminator = self.func.block(block_id).terminator.clone();
        for instr in &instrs {
            self.lower_instr(builder, instr);
        }
        self.lower_terminator(builder, terminator.as_ref());
    }

    fn lower_instr(&mut self, builder: &mut FunctionBuilder<'_>, instr: &IrInstr) {
        let flags = MemFlags::trusted();
        match instr {
            IrInstr::ConstUndefined { dest } => {
                let slot = self.fresh_value_slot(builder);
                let zero = builder.ins().iconst(types::I64, 0);
                self.write_value_tag(builder, slot, KIND_UNDEFINED, zero);
                self.def_reg(builder, *dest, slot);
            }
            IrInstr::ConstNull { dest } => {
                let slot = self.fresh_value_slot(builder);
                let zero = builder.ins().iconst(types::I64, 0);
                self.write_value_tag(builder, slot, KIND_NULL, zero);
                self.def_reg(builder, *dest, slot);
            }
            IrInstr::ConstBool { dest, value } => {
                let val = builder.ins().iconst(types::I8, *value as i64);
                self.def_reg(builder, *dest, val);
            }
            IrInstr::ConstF64 { dest, value } => {
                let val = builder.ins().f64const(*value);
                self.def_reg(builder, *dest, val);
            }
            IrInstr::ConstI32 { dest, value } => {
                let val = builder.ins().iconst(types::I32, *value as i64);
                self.def_reg(builder, *dest, val);
            }
            IrInstr::ConstFunctionRef { dest, func_id } => {
                let closure_ptr = self.emit_create_closure(builder, *func_id, &[]);
                self.def_reg(builder, *dest, closure_ptr);
            }

            IrInstr::StoreRetv { value } => {
                let src = self.use_reg(builder, *value);
                let retv = self.entry.retv;
                self.copy_value_fields(builder, src, retv);
            }
            IrInstr::LoadRetv { dest } => {
                self.def_reg(builder, *dest, self.entry.retv);
            }

            IrInstr::AllocLocal { slot } => {
                self.local_slot_addr(builder, *slot);
            }
            IrInstr::LoadLocal { dest, slot } => {
                let addr = self.local_slot_addr(builder, *slot);
                self.def_reg(builder, *dest, addr);
            }
            IrInstr::StoreLocal { slot, value } => {
                let addr = self.local_slot_addr(builder, *slot);
                let src = self.use_reg(builder, *value);
                self.copy_value_fields(builder, src, addr);
            }

            IrInstr::LoadArgument { dest, index } => {
                let addr = builder.ins().iadd_imm(self.entry.argv, (*index as i64) * VALUE_SIZE as i64);
                self.def_reg(builder, *dest, addr);
            }
            IrInstr::LoadCapture { dest, index } => {
                let entry_ptr = builder.ins().load(self.ptr_type, flags, self.entry.ctx, (*index as i32) * 8);
                let target_ptr = builder.ins().load(self.ptr_type, flags, entry_ptr, Capture::TARGET_OFFSET);
                self.def_reg(builder, *dest, target_ptr);
            }
            IrInstr::StoreCapture { index, value } => {
                let entry_ptr = builder.ins().load(self.ptr_type, flags, self.entry.ctx, (*index as i32) * 8);
                let target_ptr = builder.ins().load(self.ptr_type, flags, entry_ptr, Capture::TARGET_OFFSET);
                let src = self.use_reg(builder, *value);
                self.copy_value_fields(builder, src, target_ptr);
            }

            IrInstr::ToNumeric { dest, src } => {
                let result = match self.reg_type(*src) {
                    IrType::Any => {
                        let ptr = self.use_reg(builder, *src);
                        let rt = self.entry.rt;
                        self.call_helper(builder, helper_names::TO_NUMERIC, &[rt, ptr]).expect("runtime_to_numeric returns f64")
                    }
                    IrType::I32 => {
                        let v = self.use_reg(builder, *src);
                        builder.ins().fcvt_from_sint(types::F64, v)
                    }
                    IrType::U32 => {
                        let v = self.use_reg(builder, *src);
                        builder.ins().fcvt_from_uint(types::F64, v)
                    }
                    IrType::Bool => {
                        let v = self.use_reg(builder, *src);
                        let widened = builder.ins().uextend(types::I32, v);
                        builder.ins().fcvt_from_uint(types::F64, widened)
                    }
                    IrType::F64 => self.use_reg(builder, *src),
                    IrType::Ptr => panic!("ToNumeric on a raw pointer register"),
                };
                self.def_reg(builder, *dest, result);
            }
            IrInstr::ToInt32 { dest, src } => {
                let v = self.use_reg(builder, *src);
                let rt = self.entry.rt;
                let result = self.call_helper(builder, helper_names::TO_INT32, &[rt, v]).expect("runtime_to_int32 returns i32");
                self.def_reg(builder, *dest, result);
            }
            IrInstr::ToUint32 { dest, src } => {
                let v = self.use_reg(builder, *src);
                let rt = self.entry.rt;
                let result = self.call_helper(builder, helper_names::TO_UINT32, &[rt, v]).expect("runtime_to_uint32 returns i32");
                self.def_reg(builder, *dest, result);
            }
            IrInstr::ToBoolean { dest, src } => {
                let ptr = self.use_reg(builder, *src);
                let rt = self.entry.rt;
                let result = self.call_helper(builder, helper_names::TO_BOOLEAN, &[rt, ptr]).expect("runtime_to_boolean returns bool");
                self.def_reg(builder, *dest, result);
            }

            IrInstr::Box { dest, src, src_ty } => {
                let slot = self.fresh_value_slot(builder);
                let src_val = self.use_reg(builder, *src);
                match src_ty {
                    IrType::Bool => self.write_value_tag(builder, slot, KIND_BOOLEAN, src_val),
                    IrType::F64 => self.write_value_tag(builder, slot, KIND_NUMBER, src_val),
                    IrType::I32 => {
                        let as_f64 = builder.ins().fcvt_from_sint(types::F64, src_val);
                        self.write_value_tag(builder, slot, KIND_NUMBER, as_f64);
                    }
                    IrType::U32 => {
                        let as_f64 = builder.ins().fcvt_from_uint(types::F64, src_val);
                        self.write_value_tag(builder, slot, KIND_NUMBER, as_f64);
                    }
                    IrType::Ptr => self.write_value_tag(builder, slot, KIND_CLOSURE, src_val),
                    IrType::Any => {
                        self.copy_value_fields(builder, src_val, slot);
                    }
                }
                self.def_reg(builder, *dest, slot);
            }
            IrInstr::Unbox { dest, src, dest_ty } => {
                let ptr = self.use_reg(builder, *src);
                let result = match dest_ty {
                    IrType::F64 => builder.ins().load(types::F64, flags, ptr, HOLDER_OFFSET),
                    IrType::I32 | IrType::U32 => builder.ins().load(types::I32, flags, ptr, HOLDER_OFFSET),
                    IrType::Bool => builder.ins().load(types::I8, flags, ptr, HOLDER_OFFSET),
                    IrType::Ptr => builder.ins().load(self.ptr_type, flags, ptr, HOLDER_OFFSET),
                    IrType::Any => ptr,
                };
                self.def_reg(builder, *dest, result);
            }

            IrInstr::FAdd { dest, lhs, rhs } => self.binop_f64(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().fadd(l, r)),
            IrInstr::FSub { dest, lhs, rhs } => self.binop_f64(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().fsub(l, r)),
            IrInstr::FMul { dest, lhs, rhs } => self.binop_f64(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().fmul(l, r)),
            IrInstr::FDiv { dest, lhs, rhs } => self.binop_f64(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().fdiv(l, r)),
            IrInstr::FRem { dest, lhs, rhs } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let q = builder.ins().fdiv(l, r);
                let t = builder.ins().trunc(q);
                let p = builder.ins().fmul(t, r);
                let result = builder.ins().fsub(l, p);
                self.def_reg(builder, *dest, result);
            }
            IrInstr::FCmp { dest, op, lhs, rhs } => {
                let cc = match op {
                    FCmpOp::Lt => FloatCC::LessThan,
                    FCmpOp::Gt => FloatCC::GreaterThan,
                    FCmpOp::Le => FloatCC::LessThanOrEqual,
                    FCmpOp::Ge => FloatCC::GreaterThanOrEqual,
                };
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let result = builder.ins().fcmp(cc, l, r);
                self.def_reg(builder, *dest, result);
            }

            IrInstr::IShl { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().ishl(l, r)),
            IrInstr::ISar { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().sshr(l, r)),
            IrInstr::IShr { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().ushr(l, r)),
            IrInstr::FNeg { dest, src } => {
                let v = self.use_reg(builder, *src);
                let result = builder.ins().fneg(v);
                self.def_reg(builder, *dest, result);
            }
            IrInstr::BoolNot { dest, src } => {
                let v = self.use_reg(builder, *src);
                let one = builder.ins().iconst(types::I8, 1);
                let result = builder.ins().bxor(v, one);
                self.def_reg(builder, *dest, result);
            }

            IrInstr::IAnd { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().band(l, r)),
            IrInstr::IOr { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().bor(l, r)),
            IrInstr::IXor { dest, lhs, rhs } => self.binop_i32(builder, *dest, *lhs, *rhs, |b, l, r| b.ins().bxor(l, r)),
            IrInstr::INot { dest, src } => {
                let v = self.use_reg(builder, *src);
                let result = builder.ins().bnot(v);
                self.def_reg(builder, *dest, result);
            }

            IrInstr::RuntimeEquals { dest, lhs, rhs, strict, helper } => {
                let _ = strict;
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let rt = self.entry.rt;
                let result = self.call_helper(builder, *helper, &[rt, l, r]).expect("equality helper returns bool");
                self.def_reg(builder, *dest, result);
            }
            IrInstr::BoolEq { dest, lhs, rhs, negate } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let mut result = builder.ins().icmp(IntCC::Equal, l, r);
                if *negate {
                    let one = builder.ins().iconst(types::I8, 1);
                    result = builder.ins().bxor(result, one);
                }
                self.def_reg(builder, *dest, result);
            }
            IrInstr::NumEq { dest, lhs, rhs, negate } => {
                let l = self.use_reg(builder, *lhs);
                let r = self.use_reg(builder, *rhs);
                let mut result = builder.ins().fcmp(FloatCC::Equal, l, r);
                if *negate {
                    let one = builder.ins().iconst(types::I8, 1);
                    result = builder.ins().bxor(result, one);
                }
                self.def_reg(builder, *dest, result);
            }

            IrInstr::CallHelper { dest, name, args } => {
                let mut arg_vals: Vec<ir::Value> = vec![self.entry.rt];
                arg_vals.extend(args.iter().map(|r| self.use_reg(builder, *r)));
                let result = self.call_helper(builder, *name, &arg_vals);
                if let (Some(dest), Some(result)) = (*dest, result) {
                    self.def_reg(builder, dest, result);
                }
            }

            IrInstr::AllocArgv { dest, argc } => {
                let ss = builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    (*argc as u32) * VALUE_SIZE,
                    STACK_SLOT_ALIGN_SHIFT,
                ));
                let addr = builder.ins().stack_addr(self.ptr_type, ss, 0);
                self.def_reg(builder, *dest, addr);
            }
            IrInstr::StoreArgv { argv, index, value } => {
                let base = self.use_reg(builder, *argv);
                let slot_addr = builder.ins().iadd_imm(base, (*index as i64) * VALUE_SIZE as i64);
                let src = self.use_reg(builder, *value);
                self.copy_value_fields(builder, src, slot_addr);
            }
            IrInstr::CallClosure { dest, status, closure, argv, argc } => {
                let closure_ptr = self.use_reg(builder, *closure);
                let lambda_ptr = builder.ins().load(self.ptr_type, flags, closure_ptr, Closure::LAMBDA_OFFSET);
                let captures_ptr = builder.ins().load(self.ptr_type, flags, closure_ptr, Closure::CAPTURES_OFFSET);
                let argv_ptr = self.use_reg(builder, *argv);
                let argc_val = builder.ins().iconst(types::I64, *argc as i64);
                let retv_addr = self.fresh_value_slot(builder);
                let rt = self.entry.rt;

                let config = self.module.target_config();
                let sig_ref = builder.import_signature(lambda_signature(config.default_call_conv));
                let call = builder.ins().call_indirect(sig_ref, lambda_ptr, &[rt, captures_ptr, argc_val, argv_ptr, retv_addr]);
                let status_val = builder.inst_results(call)[0];

                self.def_reg(builder, *status, status_val);
                self.def_reg(builder, *dest, retv_addr);
            }

            IrInstr::CreateCapture { dest, slot } => {
                let target = self.local_slot_addr(builder, *slot);
                let rt = self.entry.rt;
                let result = self
                    .call_helper(builder, helper_names::CREATE_CAPTURE, &[rt, target])
                    .expect("runtime_create_capture returns a pointer");
                self.def_reg(builder, *dest, result);
            }
            IrInstr::EscapeCapture { capture, slot } => {
                let cap_ptr = self.use_reg(builder, *capture);
                let slot_addr = self.local_slot_addr(builder, *slot);
                let escaped_addr = builder.ins().iadd_imm(cap_ptr, Capture::ESCAPED_OFFSET as i64);
                let lo = builder.ins().load(types::I64, flags, slot_addr, 0);
                builder.ins().store(flags, lo, escaped_addr, 0);
                let hi = builder.ins().load(types::I64, flags, slot_addr, HOLDER_OFFSET);
                builder.ins().store(flags, hi, escaped_addr, HOLDER_OFFSET);
                builder.ins().store(flags, escaped_addr, cap_ptr, Capture::TARGET_OFFSET);
            }
            IrInstr::CreateClosure { dest, func_id, captures } => {
                let closure_ptr = self.emit_create_closure(builder, *func_id, captures);
                self.def_reg(builder, *dest, closure_ptr);
            }

            IrInstr::CreateCoroutine { dest, closure, num_locals, scratch_len } => {
                let closure_ptr = self.use_reg(builder, *closure);
                let num_locals_val = builder.ins().iconst(types::I16, *num_locals as i64);
                let scratch_len_val = builder.ins().iconst(types::I16, *scratch_len as i64);
                let rt = self.entry.rt;
                let frame_ptr = self
                    .call_helper(builder, helper_names::CREATE_COROUTINE, &[rt, closure_ptr, num_locals_val, scratch_len_val])
                    .expect("runtime_create_coroutine must return a pointer");
                self.def_reg(builder, *dest, frame_ptr);
            }
            IrInstr::LoadCoroutineState { dest } => {
                let state = builder.ins().load(types::I32, flags, self.entry.ctx, CoroutineFrame::STATE_OFFSET);
                self.def_reg(builder, *dest, state);
            }
            IrInstr::StoreCoroutineState { state } => {
                let val = builder.ins().iconst(types::I32, *state as i64);
                builder.ins().store(flags, val, self.entry.ctx, CoroutineFrame::STATE_OFFSET);
            }
            IrInstr::AwaitPromise { dest, promise } => {
                let promise_val = self.use_reg(builder, *promise);
                let rt = self.entry.rt;
                let frame_val = self.entry.ctx;
                let result = self
                    .call_helper(builder, helper_names::AWAIT_PROMISE, &[rt, promise_val, frame_val])
                    .expect("runtime_await_promise returns a status");
                self.def_reg(builder, *dest, result);
            }

            IrInstr::LoadStatus { dest } => {
                let v = builder.use_var(self.status_var);
                self.def_reg(builder, *dest, v);
            }
            IrInstr::StoreStatus { value } => {
                let v = self.use_reg(builder, *value);
                builder.def_var(self.status_var, v);
            }
            IrInstr::StoreFlowSelector { value } => {
                let v = builder.ins().iconst(types::I32, *value as i64);
                builder.def_var(self.flow_selector_var, v);
            }

            IrInstr::Move { dest, src } => {
                let v = self.use_reg(builder, *src);
                self.def_reg(builder, *dest, v);
            }
            IrInstr::Phi { .. } => {
                panic!("IrInstr::Phi reached the Cranelift backend: FunctionBuilder never emits it, every merge is resolved by register-per-Variable SSA construction");
            }
        }
    }

    fn binop_f64(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        f: impl FnOnce(&mut FunctionBuilder<'_>, ir::Value, ir::Value) -> ir::Value,
    ) {
        let l = self.use_reg(builder, lhs);
        let r = self.use_reg(builder, rhs);
        let result = f(builder, l, r);
        self.def_reg(builder, dest, result);
    }

    fn binop_i32(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        dest: Reg,
        lhs: Reg,
        rhs: Reg,
        f: impl FnOnce(&mut FunctionBuilder<'_>, ir::Value, ir::Value) -> ir::Value,
    ) {
        let l = self.use_reg(builder, lhs);
        let r = self.use_reg(builder, rhs);
        let result = f(builder, l, r);
        self.def_reg(builder, dest, result);
    }

    fn lower_terminator(&mut self, builder: &mut FunctionBuilder<'_>, term: Option<&IrTerminator>) {
        match term {
            Some(IrTerminator::Jump { target }) => {
                let cl_target = self.block_map[&target.0];
                builder.ins().jump(cl_target, &[]);
            }
            Some(IrTerminator::Branch { cond, then_block, else_block }) => {
                let cond_val = self.use_reg(builder, *cond);
                let then_cl = self.block_map[&then_block.0];
                let else_cl = self.block_map[&else_block.0];
                builder.ins().brif(cond_val, then_cl, &[], else_cl, &[]);
            }
            Some(IrTerminator::Switch { value, cases, default }) => {
                let val = self.use_reg(builder, *value);
                let mut switch = Switch::new();
                for (case_value, target) in cases {
                    switch.set_entry(*case_value as u128, self.block_map[&target.0]);
                }
                switch.emit(builder, val, self.block_map[&default.0]);
            }
            Some(IrTerminator::Return { status }) => {
                let status_val = self.use_reg(builder, *status);
                builder.ins().return_(&[status_val]);
            }
            Some(IrTerminator::Unreachable) | None => {
                builder.ins().trap(ir::TrapCode::user(1).unwrap());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::settings::{self, Configurable};
    use cranelift_codegen::verify_function;
    use cranelift_jit::{JITBuilder, JITModule};
    use cranelift_module::Linkage;

    unsafe extern "C" fn stub_helper() {
        panic!("stub helper invoked");
    }

    fn test_module() -> JITModule {
        let mut flag_builder = settings::builder();
        flag_builder.set("is_pic", "false").unwrap();
        let flags = settings::Flags::new(flag_builder);
        let isa = cranelift_native::builder().unwrap().finish(flags).unwrap();
        let mut jit_builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for name in helper_names::ALL {
            jit_builder.symbol(*name, stub_helper as *const u8);
        }
        JITModule::new(jit_builder)
    }

    #[test]
    fn lowers_trivial_return_and_verifies() {
        let mut func = IrFunction::new(0, "trivial", 0);
        let entry = func.entry;
        let status = func.alloc_reg(IrType::I32);
        func.push(entry, IrInstr::ConstI32 { dest: status, value: 0 });
        func.set_terminator(entry, IrTerminator::Return { status });

        let mut module = test_module();
        let funcs = FuncTable::default();
        let helpers = HelperTable::default();
        let clif_func = lower(&func, &mut module, &funcs, &helpers);
        assert!(verify_function(&clif_func, module.isa().flags()).is_ok());
    }

    #[test]
    fn lowers_boxed_arithmetic_and_verifies() {
        let mut func = IrFunction::new(0, "add_and_box", 0);
        let entry = func.entry;
        let a = func.alloc_reg(IrType::F64);
        let b = func.alloc_reg(IrType::F64);
        let sum = func.alloc_reg(IrType::F64);
        let boxed = func.alloc_reg(IrType::Any);
        let status = func.alloc_reg(IrType::I32);

        func.push(entry, IrInstr::ConstF64 { dest: a, value: 1.5 });
        func.push(entry, IrInstr::ConstF64 { dest: b, value: 2.5 });
        func.push(entry, IrInstr::FAdd { dest: sum, lhs: a, rhs: b });
        func.push(entry, IrInstr::Box { dest: boxed, src: sum, src_ty: IrType::F64 });
        func.push(entry, IrInstr::StoreRetv { value: boxed });
        func.push(entry, IrInstr::ConstI32 { dest: status, value: 0 });
        func.set_terminator(entry, IrTerminator::Return { status });

        let mut module = test_module();
        let funcs = FuncTable::default();
        let helpers = HelperTable::default();

        let clif_func = lower(&func, &mut module, &funcs, &helpers);
        assert!(verify_function(&clif_func, module.isa().flags()).is_ok());
    }

    #[test]
    fn lowers_helper_call_and_verifies() {
        let mut func = IrFunction::new(0, "to_boolean", 0);
        let entry = func.entry;
        let any = func.alloc_reg(IrType::Any);
        let dest = func.alloc_reg(IrType::Bool);
        let boxed = func.alloc_reg(IrType::Any);
        let status = func.alloc_reg(IrType::I32);

        func.push(entry, IrInstr::ConstUndefined { dest: any });
        func.push(entry, IrInstr::ToBoolean { dest, src: any });
        func.push(entry, IrInstr::Box { dest: boxed, src: dest, src_ty: IrType::Bool });
        func.push(entry, IrInstr::StoreRetv { value: boxed });
        func.push(entry, IrInstr::ConstI32 { dest: status, value: 0 });
        func.set_terminator(entry, IrTerminator::Return { status });

        let mut module = test_module();
        let call_conv = module.isa().default_call_conv();
        let mut helpers = HelperTable::default();
        for name in helper_names::ALL {
            let sig = crate::abi::signatures::helper_signature(name, call_conv);
            let id = module.declare_function(name, Linkage::Import, &sig).unwrap();
            helpers.insert(*name, id);
        }
        let funcs = FuncTable::default();

        let clif_func = lower(&func, &mut module, &funcs, &helpers);
        assert!(verify_function(&clif_func, module.isa().flags()).is_ok());
    }

    #[test]
    fn lowers_switch_terminator_and_verifies() {
        let mut func = IrFunction::new(0, "switch_fn", 0);
        let entry = func.entry;
        let case_a = func.add_block();
        let case_b = func.add_block();
        let default = func.add_block();
        let selector = func.alloc_reg(IrType::I32);
        let status = func.alloc_reg(IrType::I32);

        func.push(entry, IrInstr::ConstI32 { dest: selector, value: 1 });
        func.set_terminator(
            entry,
            IrTerminator::Switch { value: selector, cases: vec![(0, case_a), (1, case_b)], default },
        );
        for block in [case_a, case_b, default] {
            func.push(block, IrInstr::ConstI32 { dest: status, value: 0 });
            func.set_terminator(block, IrTerminator::Return { status });
        }

        let mut module = test_module();
        let funcs = FuncTable::default();
        let helpers = HelperTable::default();
        let clif_func = lower(&func, &mut module, &funcs, &helpers);
        assert!(verify_function(&clif_func, module.isa().flags()).is_ok());
    }
}
