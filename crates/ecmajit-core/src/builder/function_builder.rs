//! [`FunctionBuilder`]: stack-machine-driven construction of one [`IrFunction`].
//!
//! The opcode methods here mirror the shape of the incoming semantic opcode stream: each one pops
//! its operands off the typed [`OperandStack`], emits IR into the current block, and pushes its
//! result. Structured control flow (scopes, branches, loops, switch, try/catch/finally) is tracked
//! on the [`ControlFlowStack`] so that `break`/`continue`/`return`/`throw` can always resolve their
//! target without the caller threading block handles through every opcode call.

use rustc_hash::FxHashMap;

use crate::abi::locator::{Locator, LocatorKind};
use crate::abi::signatures::helper_names;
use crate::abi::status::Status;
use crate::builder::errors::BuilderError;
use crate::builder::ir::{BlockId, IrFunction, IrInstr, IrTerminator, IrType, Reg};
use crate::builder::opcodes::{self, BinaryOp};
use crate::builder::operand::{OperandStack, OperandStackItem};
use crate::flow::frame::{
    BranchFrame, FunctionFrame, LoopBodyFrame, LoopInitFrame, LoopTestFrame, SelectFrame, TernaryFrame, TernaryKind,
};
use crate::flow::{ControlFlowStack, FlowFrame};

/// Builds one function's SSA IR from a stream of opcode calls.
pub struct FunctionBuilder {
    func: IrFunction,
    stack: OperandStack,
    flow: ControlFlowStack,
    current: BlockId,
    local_slots: FxHashMap<u16, crate::builder::ir::LocalSlot>,
    local_mutable: FxHashMap<u16, bool>,
    capture_regs: FxHashMap<u16, Reg>,
    scope_captures: Vec<Vec<u16>>,
    label_ends: Vec<BlockId>,
    pending_loop_label: Option<u32>,
    /// Resume-state dispatch cases accumulated by `suspend`/`await_value`, wired into the args
    /// block's terminator at `finish()` (coroutine functions only).
    resume_cases: Vec<(i64, BlockId)>,
    next_resume_state: u32,
    coroutine_state_reg: Option<Reg>,
}

impl FunctionBuilder {
    /// Starts building `func_id`, wiring the four blocks every function's `Function` frame owns:
    /// locals, args, body, and the single return join point.
    pub fn new(func_id: u32, name: impl Into<String>, num_params: u16) -> Self {
        Self::new_with_prologue(func_id, name, num_params, false)
    }

    /// Like [`Self::new`], but marks the function as a coroutine: its args block dispatches on a
    /// resume state persisted in the `CoroutineFrame` addressed by `ctx`, instead of always
    /// falling through to the body, and its locals are addressed through that frame rather than
    /// ordinary stack slots (see [`crate::orchestrator::cranelift_backend`]).
    pub fn new_coroutine(func_id: u32, name: impl Into<String>, num_params: u16) -> Self {
        Self::new_with_prologue(func_id, name, num_params, true)
    }

    fn new_with_prologue(func_id: u32, name: impl Into<String>, num_params: u16, is_coroutine: bool) -> Self {
        let mut func = IrFunction::new(func_id, name, num_params);
        func.is_coroutine = is_coroutine;
        let locals_block = func.entry;
        let args_block = func.add_block();
        let body_block = func.add_block();
        let return_block = func.add_block();

        let status_reg = func.alloc_reg(IrType::I32);
        func.push(locals_block, IrInstr::ConstI32 { dest: status_reg, value: Status::Normal.to_raw() as i32 });
        func.push(locals_block, IrInstr::StoreStatus { value: status_reg });
        let undef_reg = func.alloc_reg(IrType::Any);
        func.push(locals_block, IrInstr::ConstUndefined { dest: undef_reg });
        func.push(locals_block, IrInstr::StoreRetv { value: undef_reg });

        let coroutine_state_reg = if is_coroutine {
            let state_reg = func.alloc_reg(IrType::I32);
            func.push(args_block, IrInstr::LoadCoroutineState { dest: state_reg });
            Some(state_reg)
        } else {
            None
        };

        let mut flow = ControlFlowStack::new();
        flow.push_function(FunctionFrame { locals_block, args_block, body_block, return_block });

        FunctionBuilder {
            func,
            stack: OperandStack::new(),
            flow,
            current: body_block,
            local_slots: FxHashMap::default(),
            local_mutable: FxHashMap::default(),
            capture_regs: FxHashMap::default(),
            scope_captures: Vec::new(),
            label_ends: Vec::new(),
            pending_loop_label: None,
            resume_cases: Vec::new(),
            next_resume_state: 1,
            coroutine_state_reg,
        }
    }

    fn unterminated(&self, block: BlockId) -> bool {
        self.func.block(block).terminator.is_none()
    }

    fn jump_if_unterminated(&mut self, target: BlockId) {
        if self.unterminated(self.current) {
            self.func.set_terminator(self.current, IrTerminator::Jump { target });
        }
    }

    /// Routes any further opcodes emitted for the same lexical position (the front end keeps
    /// sending them up to the next structural boundary) into a fresh unreachable block, so a
    /// `return`/`throw`/`break`/`continue` never corrupts the block it just terminated.
    fn seal_dead_code(&mut self) {
        let dead = self.func.add_block();
        self.func.set_terminator(dead, IrTerminator::Unreachable);
        self.current = dead;
    }

    fn local_slot(&mut self, index: u16) -> crate::builder::ir::LocalSlot {
        let func = &mut self.func;
        let entry = func.entry;
        *self.local_slots.entry(index).or_insert_with(|| {
            let slot = func.alloc_slot();
            func.push(entry, IrInstr::AllocLocal { slot });
            slot
        })
    }

    // --- Constants ---------------------------------------------------------------------------

    pub fn const_undefined(&mut self) {
        self.stack.push(OperandStackItem::Undefined);
    }

    pub fn const_null(&mut self) {
        self.stack.push(OperandStackItem::Null);
    }

    pub fn const_boolean(&mut self, value: bool) {
        let dest = self.func.alloc_reg(IrType::Bool);
        self.func.push(self.current, IrInstr::ConstBool { dest, value });
        self.stack.push(OperandStackItem::Boolean(dest));
    }

    pub fn const_number(&mut self, value: f64) {
        let dest = self.func.alloc_reg(IrType::F64);
        self.func.push(self.current, IrInstr::ConstF64 { dest, value });
        self.stack.push(OperandStackItem::Number(dest));
    }

    pub fn const_function_ref(&mut self, func_id: u32) {
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(self.current, IrInstr::ConstFunctionRef { dest, func_id });
        self.stack.push(OperandStackItem::Function(dest));
    }

    // --- References ----------------------------------------------------------------------------

    pub fn reference(&mut self, symbol: u32, locator: Locator) {
        self.stack.push(OperandStackItem::Reference { symbol, locator });
    }

    pub fn dereference(&mut self) -> Result<(), BuilderError> {
        let (_symbol, locator) = self.stack.pop_reference()?;
        let item = match locator.kind {
            LocatorKind::Argument => {
                let dest = self.func.alloc_reg(IrType::Any);
                self.func.push(self.current, IrInstr::LoadArgument { dest, index: locator.index });
                OperandStackItem::Any(dest)
            }
            LocatorKind::Local => {
                let slot = self.local_slot(locator.index);
                let dest = self.func.alloc_reg(IrType::Any);
                self.func.push(self.current, IrInstr::LoadLocal { dest, slot });
                OperandStackItem::Any(dest)
            }
            LocatorKind::Capture => {
                let dest = self.func.alloc_reg(IrType::Any);
                self.func.push(self.current, IrInstr::LoadCapture { dest, index: locator.index });
                OperandStackItem::Any(dest)
            }
            LocatorKind::None => return Err(BuilderError::UnresolvedLocator),
        };
        self.stack.push(item);
        Ok(())
    }

    pub fn assign(&mut self) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let (_symbol, locator) = self.stack.pop_reference()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        match locator.kind {
            LocatorKind::Local => {
                let slot = self.local_slot(locator.index);
                self.func.push(self.current, IrInstr::StoreLocal { slot, value });
            }
            LocatorKind::Capture => {
                self.func.push(self.current, IrInstr::StoreCapture { index: locator.index, value });
            }
            LocatorKind::Argument => {
                panic!("assignment to an argument locator: the front end must alias reassigned parameters to a Local slot")
            }
            LocatorKind::None => return Err(BuilderError::UnresolvedLocator),
        }
        self.stack.push(OperandStackItem::Any(value));
        Ok(())
    }

    // --- Declarations ----------------------------------------------------------------------------

    pub fn declare_variable(&mut self, locator: Locator, mutable: bool) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        let slot = self.local_slot(locator.index);
        self.local_mutable.insert(locator.index, mutable);
        self.func.push(self.current, IrInstr::StoreLocal { slot, value });
        Ok(())
    }

    pub fn declare_function(&mut self, locator: Locator, func_id: u32) -> Result<(), BuilderError> {
        let hoisted_block = self.flow.scope_frame().hoisted_block;
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(hoisted_block, IrInstr::ConstFunctionRef { dest, func_id });
        let slot = self.local_slot(locator.index);
        self.func.push(hoisted_block, IrInstr::StoreLocal { slot, value: dest });
        Ok(())
    }

    pub fn declare_closure(&mut self, locator: Locator) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        let slot = self.local_slot(locator.index);
        self.func.push(self.current, IrInstr::StoreLocal { slot, value });
        Ok(())
    }

    // --- Arithmetic / comparison / equality ------------------------------------------------------

    pub fn binary_op(&mut self, op: BinaryOp) -> Result<(), BuilderError> {
        let rhs = self.stack.pop()?;
        let lhs = self.stack.pop()?;
        let result = match op {
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::StrictEq | BinaryOp::StrictNe => {
                self.emit_equality(op, lhs, rhs)
            }
            _ => {
                let lhs_reg = opcodes::ensure_numeric(&mut self.func, self.current, lhs);
                let rhs_reg = opcodes::ensure_numeric(&mut self.func, self.current, rhs);
                opcodes::emit_numeric_binary(&mut self.func, self.current, op, lhs_reg, rhs_reg)
            }
        };
        self.stack.push(result);
        Ok(())
    }

    fn emit_equality(&mut self, op: BinaryOp, lhs: OperandStackItem, rhs: OperandStackItem) -> OperandStackItem {
        let negate = matches!(op, BinaryOp::Ne | BinaryOp::StrictNe);
        let strict = matches!(op, BinaryOp::StrictEq | BinaryOp::StrictNe);

        if let (OperandStackItem::Number(l), OperandStackItem::Number(r)) = (lhs, rhs) {
            let dest = self.func.alloc_reg(IrType::Bool);
            self.func.push(self.current, IrInstr::NumEq { dest, lhs: l, rhs: r, negate });
            return OperandStackItem::Boolean(dest);
        }
        if let (OperandStackItem::Boolean(l), OperandStackItem::Boolean(r)) = (lhs, rhs) {
            let dest = self.func.alloc_reg(IrType::Bool);
            self.func.push(self.current, IrInstr::BoolEq { dest, lhs: l, rhs: r, negate });
            return OperandStackItem::Boolean(dest);
        }
        if matches!((lhs, rhs), (OperandStackItem::Undefined, OperandStackItem::Undefined) | (OperandStackItem::Null, OperandStackItem::Null)) {
            return self.fold_bool(!negate);
        }
        if !strict
            && matches!(
                (lhs, rhs),
                (OperandStackItem::Undefined, OperandStackItem::Null) | (OperandStackItem::Null, OperandStackItem::Undefined)
            )
        {
            return self.fold_bool(!negate);
        }
        if strict {
            if let (Some(a), Some(b)) = (static_family(&lhs), static_family(&rhs)) {
                if a != b {
                    return self.fold_bool(negate);
                }
            }
        }

        let helper = if strict { "runtime_is_strictly_equal" } else { "runtime_is_loosely_equal" };
        let l = opcodes::ensure_any(&mut self.func, self.current, lhs);
        let r = opcodes::ensure_any(&mut self.func, self.current, rhs);
        let eq = self.func.alloc_reg(IrType::Bool);
        self.func.push(self.current, IrInstr::RuntimeEquals { dest: eq, lhs: l, rhs: r, strict, helper });
        if negate {
            let dest = self.func.alloc_reg(IrType::Bool);
            self.func.push(self.current, IrInstr::BoolNot { dest, src: eq });
            OperandStackItem::Boolean(dest)
        } else {
            OperandStackItem::Boolean(eq)
        }
    }

    fn fold_bool(&mut self, value: bool) -> OperandStackItem {
        let dest = self.func.alloc_reg(IrType::Bool);
        self.func.push(self.current, IrInstr::ConstBool { dest, value });
        OperandStackItem::Boolean(dest)
    }

    pub fn negate(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let src = opcodes::ensure_numeric(&mut self.func, self.current, item);
        let dest = self.func.alloc_reg(IrType::F64);
        self.func.push(self.current, IrInstr::FNeg { dest, src });
        self.stack.push(OperandStackItem::Number(dest));
        Ok(())
    }

    pub fn bitwise_not(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let src = opcodes::ensure_numeric(&mut self.func, self.current, item);
        let int_src = self.func.alloc_reg(IrType::I32);
        self.func.push(self.current, IrInstr::ToInt32 { dest: int_src, src });
        let inverted = self.func.alloc_reg(IrType::I32);
        self.func.push(self.current, IrInstr::INot { dest: inverted, src: int_src });
        let result = self.func.alloc_reg(IrType::F64);
        self.func.push(self.current, IrInstr::ToNumeric { dest: result, src: inverted });
        self.stack.push(OperandStackItem::Number(result));
        Ok(())
    }

    pub fn logical_not(&mut self) -> Result<(), BuilderError> {
        self.to_boolean()?;
        let item = self.stack.pop()?;
        let src = match item {
            OperandStackItem::Boolean(r) => r,
            other => panic!("logical_not expected a Boolean after to_boolean, found {other:?}"),
        };
        let dest = self.func.alloc_reg(IrType::Bool);
        self.func.push(self.current, IrInstr::BoolNot { dest, src });
        self.stack.push(OperandStackItem::Boolean(dest));
        Ok(())
    }

    pub fn to_boolean(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let result = match item {
            OperandStackItem::Boolean(r) => OperandStackItem::Boolean(r),
            OperandStackItem::Undefined | OperandStackItem::Null => self.fold_bool(false),
            OperandStackItem::Number(r) => {
                let zero = self.func.alloc_reg(IrType::F64);
                self.func.push(self.current, IrInstr::ConstF64 { dest: zero, value: 0.0 });
                let dest = self.func.alloc_reg(IrType::Bool);
                self.func.push(self.current, IrInstr::NumEq { dest, lhs: r, rhs: zero, negate: true });
                OperandStackItem::Boolean(dest)
            }
            OperandStackItem::Function(_)
            | OperandStackItem::Closure(_)
            | OperandStackItem::Promise(_)
            | OperandStackItem::Object(_)
            | OperandStackItem::String(_) => self.fold_bool(true),
            OperandStackItem::Any(r) => {
                let dest = self.func.alloc_reg(IrType::Bool);
                self.func.push(self.current, IrInstr::ToBoolean { dest, src: r });
                OperandStackItem::Boolean(dest)
            }
            other => panic!("to_boolean on a non-value operand stack item: {other:?}"),
        };
        self.stack.push(result);
        Ok(())
    }

    pub fn pop_discard(&mut self) -> Result<(), BuilderError> {
        self.stack.pop()?;
        Ok(())
    }

    // --- Calls -------------------------------------------------------------------------------------

    pub fn begin_arguments(&mut self, argc: u16) {
        let dest = self.func.alloc_reg(IrType::Ptr);
        self.func.push(self.current, IrInstr::AllocArgv { dest, argc });
        self.stack.push(OperandStackItem::Argv(dest));
    }

    pub fn store_argument(&mut self, index: u16) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        let argv = match self.stack.peek()? {
            OperandStackItem::Argv(r) => *r,
            other => panic!("store_argument without an argv buffer beneath it, found {other:?}"),
        };
        self.func.push(self.current, IrInstr::StoreArgv { argv, index, value });
        Ok(())
    }

    pub fn call(&mut self, argc: u16) -> Result<(), BuilderError> {
        let argv = match self.stack.pop()? {
            OperandStackItem::Argv(r) => r,
            other => panic!("call without an argv buffer on top of the stack, found {other:?}"),
        };
        let closure = match self.stack.pop()? {
            OperandStackItem::Closure(r) | OperandStackItem::Function(r) | OperandStackItem::Any(r) => r,
            other => panic!("call target must be callable, found {other:?}"),
        };
        let dest = self.func.alloc_reg(IrType::Any);
        let status = self.func.alloc_reg(IrType::I32);
        self.func.push(self.current, IrInstr::CallClosure { dest, status, closure, argv, argc });

        let continue_block = self.func.add_block();
        let exception_target = self.flow.exception_block();
        self.func.set_terminator(
            self.current,
            IrTerminator::Switch {
                value: status,
                cases: vec![(Status::Exception.to_raw() as i64, exception_target)],
                default: continue_block,
            },
        );
        self.current = continue_block;
        self.stack.push(OperandStackItem::Any(dest));
        Ok(())
    }

    // --- Closures / captures -------------------------------------------------------------------

    pub fn create_capture(&mut self) -> Result<(), BuilderError> {
        let (_symbol, locator) = self.stack.pop_reference()?;
        assert_eq!(locator.kind, LocatorKind::Local, "create_capture expects a Local locator");
        let slot = self.local_slot(locator.index);
        let dest = self.func.alloc_reg(IrType::Ptr);
        self.func.push(self.current, IrInstr::CreateCapture { dest, slot });
        self.capture_regs.insert(locator.index, dest);
        if let Some(scope) = self.scope_captures.last_mut() {
            scope.push(locator.index);
        }
        self.stack.push(OperandStackItem::Capture(dest));
        Ok(())
    }

    pub fn create_closure(&mut self, func_id: u32, num_captures: u16) -> Result<(), BuilderError> {
        let mut captures = Vec::with_capacity(num_captures as usize);
        for _ in 0..num_captures {
            match self.stack.pop()? {
                OperandStackItem::Capture(r) => captures.push(r),
                other => panic!("create_closure expected a Capture operand, found {other:?}"),
            }
        }
        captures.reverse();
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(self.current, IrInstr::CreateClosure { dest, func_id, captures });
        self.stack.push(OperandStackItem::Closure(dest));
        Ok(())
    }

    // --- Scopes --------------------------------------------------------------------------------

    pub fn begin_scope(&mut self) {
        let init = self.func.add_block();
        let hoisted = self.func.add_block();
        let block = self.func.add_block();
        let cleanup = self.func.add_block();
        self.jump_if_unterminated(init);
        self.func.set_terminator(init, IrTerminator::Jump { target: hoisted });
        self.func.set_terminator(hoisted, IrTerminator::Jump { target: block });
        self.flow.push_scope(init, hoisted, block, cleanup);
        self.scope_captures.push(Vec::new());
        self.current = block;
    }

    pub fn end_scope(&mut self) {
        let captures = self.scope_captures.pop().unwrap_or_default();
        let cleanup_block = self.flow.scope_frame().cleanup_block;
        self.jump_if_unterminated(cleanup_block);
        for idx in captures {
            if let Some(&capture_reg) = self.capture_regs.get(&idx) {
                let slot = self.local_slot(idx);
                self.func.push(cleanup_block, IrInstr::EscapeCapture { capture: capture_reg, slot });
            }
        }
        self.flow.pop_scope();

        let status_reg = self.func.alloc_reg(IrType::I32);
        self.func.push(cleanup_block, IrInstr::LoadStatus { dest: status_reg });
        let after = self.func.add_block();
        let exception_target = self.flow.exception_block();
        self.func.set_terminator(
            cleanup_block,
            IrTerminator::Switch {
                value: status_reg,
                cases: vec![(Status::Exception.to_raw() as i64, exception_target)],
                default: after,
            },
        );
        self.current = after;
    }

    // --- Branches ------------------------------------------------------------------------------

    pub fn begin_if(&mut self) -> Result<(), BuilderError> {
        let cond = match self.stack.pop()? {
            OperandStackItem::Boolean(r) => r,
            other => panic!("if condition must be Boolean, found {other:?}"),
        };
        let then_block = self.func.add_block();
        let else_block = self.func.add_block();
        let after_block = self.func.add_block();
        self.func.set_terminator(self.current, IrTerminator::Branch { cond, then_block, else_block });
        self.flow.push(FlowFrame::Branch(BranchFrame { before_block: else_block, after_block }));
        self.current = then_block;
        Ok(())
    }

    pub fn begin_else(&mut self) {
        let frame = match self.flow.pop() {
            FlowFrame::Branch(f) => f,
            other => panic!("begin_else outside an if, found a {} frame", other.kind_name()),
        };
        self.jump_if_unterminated(frame.after_block);
        self.current = frame.before_block;
        self.flow.push(FlowFrame::Branch(frame));
    }

    pub fn end_if(&mut self) {
        let frame = match self.flow.pop() {
            FlowFrame::Branch(f) => f,
            other => panic!("end_if outside an if, found a {} frame", other.kind_name()),
        };
        self.jump_if_unterminated(frame.after_block);
        if self.unterminated(frame.before_block) {
            self.func.set_terminator(frame.before_block, IrTerminator::Jump { target: frame.after_block });
        }
        self.current = frame.after_block;
    }

    // --- Ternary ---------------------------------------------------------------------------------
    //
    // Unlike `if`/`else`, a ternary's two arms must merge a *value*. Both arms write into the same
    // pre-allocated `merge_reg` before jumping to the shared join block; Cranelift's SSA construction
    // does the actual merging, so no `Phi` instruction is needed.

    fn begin_ternary(&mut self, kind: TernaryKind) -> Result<(), BuilderError> {
        let cond = match self.stack.pop()? {
            OperandStackItem::Boolean(r) => r,
            other => panic!("ternary condition must be Boolean, found {other:?}"),
        };
        let ty = match kind {
            TernaryKind::Boolean => IrType::Bool,
            TernaryKind::Number => IrType::F64,
            TernaryKind::Any => IrType::Any,
        };
        let merge_reg = self.func.alloc_reg(ty);
        let then_block = self.func.add_block();
        let else_block = self.func.add_block();
        let after_block = self.func.add_block();
        self.func.set_terminator(self.current, IrTerminator::Branch { cond, then_block, else_block });
        self.flow.push(FlowFrame::Ternary(TernaryFrame { before_block: else_block, after_block, merge_reg, kind }));
        self.current = then_block;
        Ok(())
    }

    pub fn begin_boolean_ternary(&mut self) -> Result<(), BuilderError> {
        self.begin_ternary(TernaryKind::Boolean)
    }

    pub fn begin_number_ternary(&mut self) -> Result<(), BuilderError> {
        self.begin_ternary(TernaryKind::Number)
    }

    pub fn begin_any_ternary(&mut self) -> Result<(), BuilderError> {
        self.begin_ternary(TernaryKind::Any)
    }

    fn merge_ternary_arm(&mut self, frame: &TernaryFrame) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let value = match frame.kind {
            TernaryKind::Boolean => match item {
                OperandStackItem::Boolean(r) => r,
                other => panic!("boolean ternary arm must be Boolean, found {other:?}"),
            },
            TernaryKind::Number => opcodes::ensure_numeric(&mut self.func, self.current, item),
            TernaryKind::Any => opcodes::ensure_any(&mut self.func, self.current, item),
        };
        self.func.push(self.current, IrInstr::Move { dest: frame.merge_reg, src: value });
        self.func.set_terminator(self.current, IrTerminator::Jump { target: frame.after_block });
        Ok(())
    }

    pub fn ternary_else(&mut self) -> Result<(), BuilderError> {
        let frame = match self.flow.pop() {
            FlowFrame::Ternary(f) => f,
            other => panic!("ternary_else outside a ternary, found a {} frame", other.kind_name()),
        };
        self.merge_ternary_arm(&frame)?;
        self.current = frame.before_block;
        self.flow.push(FlowFrame::Ternary(frame));
        Ok(())
    }

    pub fn end_ternary(&mut self) -> Result<(), BuilderError> {
        let frame = match self.flow.pop() {
            FlowFrame::Ternary(f) => f,
            other => panic!("end_ternary outside a ternary, found a {} frame", other.kind_name()),
        };
        self.merge_ternary_arm(&frame)?;
        self.current = frame.after_block;
        let item = match frame.kind {
            TernaryKind::Boolean => OperandStackItem::Boolean(frame.merge_reg),
            TernaryKind::Number => OperandStackItem::Number(frame.merge_reg),
            TernaryKind::Any => OperandStackItem::Any(frame.merge_reg),
        };
        self.stack.push(item);
        Ok(())
    }

    // --- Loops ---------------------------------------------------------------------------------

    pub fn loop_init(&mut self, label: Option<u32>) {
        let init_block = self.func.add_block();
        let test_block = self.func.add_block();
        self.jump_if_unterminated(init_block);
        self.flow.push(FlowFrame::LoopInit(LoopInitFrame { init_block, test_block }));
        self.pending_loop_label = label;
        self.current = init_block;
    }

    pub fn loop_test_begin(&mut self) {
        let frame = match self.flow.pop() {
            FlowFrame::LoopInit(f) => f,
            other => panic!("loop_test_begin outside a loop init, found a {} frame", other.kind_name()),
        };
        self.jump_if_unterminated(frame.test_block);
        self.current = frame.test_block;
    }

    pub fn loop_test_end(&mut self) -> Result<(), BuilderError> {
        let cond = match self.stack.pop()? {
            OperandStackItem::Boolean(r) => r,
            other => panic!("loop condition must be Boolean, found {other:?}"),
        };
        let test_block = self.current;
        let body_block = self.func.add_block();
        let next_block = self.func.add_block();
        let end_block = self.func.add_block();
        self.func.set_terminator(test_block, IrTerminator::Branch { cond, then_block: body_block, else_block: end_block });

        let label = self.pending_loop_label.take();
        self.flow.push_break_target(end_block, label);
        self.flow.push_continue_target(next_block, label);
        self.flow.push(FlowFrame::LoopTest(LoopTestFrame { test_block, body_block, end_block }));
        self.flow.push(FlowFrame::LoopBody(LoopBodyFrame { body_block, continue_target: next_block }));
        self.current = body_block;
        Ok(())
    }

    pub fn loop_next_begin(&mut self) {
        let frame = match self.flow.pop() {
            FlowFrame::LoopBody(f) => f,
            other => panic!("loop_next_begin outside a loop body, found a {} frame", other.kind_name()),
        };
        self.jump_if_unterminated(frame.continue_target);
        self.current = frame.continue_target;
    }

    pub fn loop_end(&mut self) {
        let frame = match self.flow.pop() {
            FlowFrame::LoopTest(f) => f,
            other => panic!("loop_end outside a loop test, found a {} frame", other.kind_name()),
        };
        self.jump_if_unterminated(frame.test_block);
        self.flow.pop_break_target();
        self.flow.pop_continue_target();
        self.current = frame.end_block;
    }

    // --- Labelled statements ---------------------------------------------------------------------

    pub fn label_start(&mut self, label: u32) {
        let end_block = self.func.add_block();
        self.flow.push_break_target(end_block, Some(label));
        self.label_ends.push(end_block);
    }

    pub fn label_end(&mut self) {
        let end_block = self.label_ends.pop().expect("label_end without a matching label_start");
        self.jump_if_unterminated(end_block);
        self.flow.pop_break_target();
        self.current = end_block;
    }

    // --- Switch ----------------------------------------------------------------------------------

    pub fn begin_switch(&mut self, label: Option<u32>) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let scrutinee = opcodes::ensure_any(&mut self.func, self.current, item);
        let first_cmp = self.func.add_block();
        self.jump_if_unterminated(first_cmp);
        let end_block = self.func.add_block();
        self.flow.push_break_target(end_block, label);
        self.flow.push(FlowFrame::Select(SelectFrame {
            end_block,
            scrutinee,
            pending_cmp_block: first_cmp,
            pending_case_body: None,
            default_body: None,
        }));
        self.current = first_cmp;
        Ok(())
    }

    pub fn case_clause(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let case_value = opcodes::ensure_any(&mut self.func, self.current, item);
        let mut sel = self.pop_select();

        let new_body = self.func.add_block();
        let next_cmp = self.func.add_block();
        let cmp_dest = self.func.alloc_reg(IrType::Bool);
        self.func.push(
            sel.pending_cmp_block,
            IrInstr::RuntimeEquals { dest: cmp_dest, lhs: sel.scrutinee, rhs: case_value, strict: true, helper: "runtime_is_strictly_equal" },
        );
        self.func.set_terminator(sel.pending_cmp_block, IrTerminator::Branch { cond: cmp_dest, then_block: new_body, else_block: next_cmp });

        if sel.pending_case_body.is_some() {
            self.jump_if_unterminated(new_body);
        }
        sel.pending_cmp_block = next_cmp;
        sel.pending_case_body = Some(new_body);
        self.current = new_body;
        self.flow.push(FlowFrame::Select(sel));
        Ok(())
    }

    pub fn default_clause(&mut self) {
        let mut sel = self.pop_select();
        let default_body = self.func.add_block();
        if sel.pending_case_body.is_some() {
            self.jump_if_unterminated(default_body);
        }
        sel.pending_case_body = Some(default_body);
        sel.default_body = Some(default_body);
        self.current = default_body;
        self.flow.push(FlowFrame::Select(sel));
    }

    pub fn end_switch(&mut self) {
        let sel = self.pop_select();
        self.jump_if_unterminated(sel.end_block);
        if self.unterminated(sel.pending_cmp_block) {
            let target = sel.default_body.unwrap_or(sel.end_block);
            self.func.set_terminator(sel.pending_cmp_block, IrTerminator::Jump { target });
        }
        self.flow.pop_break_target();
        self.current = sel.end_block;
    }

    fn pop_select(&mut self) -> SelectFrame {
        match self.flow.pop() {
            FlowFrame::Select(s) => s,
            other => panic!("expected a switch frame, found a {} frame", other.kind_name()),
        }
    }

    // --- Try / catch / finally -------------------------------------------------------------------

    pub fn begin_try(&mut self) {
        let try_block = self.func.add_block();
        let catch_block = self.func.add_block();
        let finally_block = self.func.add_block();
        let end_block = self.func.add_block();
        self.jump_if_unterminated(try_block);
        self.flow.push_exception(try_block, catch_block, finally_block, end_block);
        self.current = try_block;
    }

    pub fn begin_catch(&mut self) {
        let finally_block = self.flow.exception_frame().finally_block;
        let catch_block = self.flow.exception_frame().catch_block;
        self.jump_if_unterminated(finally_block);
        self.flow.set_caught(true);
        self.current = catch_block;
    }

    /// Pushes the value a `throw` landed in `retv` with. Only meaningful right after
    /// `begin_catch`, before any other statement overwrites `retv`.
    pub fn caught_value(&mut self) {
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(self.current, IrInstr::LoadRetv { dest });
        self.stack.push(OperandStackItem::Any(dest));
    }

    pub fn enter_finally(&mut self) {
        let finally_block = self.flow.exception_frame().finally_block;
        self.jump_if_unterminated(finally_block);
        self.current = finally_block;
    }

    pub fn end_try(&mut self) {
        self.flow.set_ended();
        let ex = self.flow.pop_exception();
        if self.unterminated(self.current) {
            let status_reg = self.func.alloc_reg(IrType::I32);
            self.func.push(self.current, IrInstr::LoadStatus { dest: status_reg });
            let outer_exception_target = self.flow.exception_block();
            self.func.set_terminator(
                self.current,
                IrTerminator::Switch {
                    value: status_reg,
                    cases: vec![(Status::Exception.to_raw() as i64, outer_exception_target)],
                    default: ex.end_block,
                },
            );
        }
        self.current = ex.end_block;
    }

    // --- Statements ------------------------------------------------------------------------------

    pub fn return_stmt(&mut self, has_value: bool) -> Result<(), BuilderError> {
        let value = if has_value {
            let item = self.stack.pop()?;
            opcodes::ensure_any(&mut self.func, self.current, item)
        } else {
            let dest = self.func.alloc_reg(IrType::Any);
            self.func.push(self.current, IrInstr::ConstUndefined { dest });
            dest
        };
        self.func.push(self.current, IrInstr::StoreRetv { value });
        self.store_status(Status::Normal);
        self.flow.set_returned();
        let target = self.flow.cleanup_block();
        self.func.set_terminator(self.current, IrTerminator::Jump { target });
        self.seal_dead_code();
        Ok(())
    }

    pub fn throw_stmt(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, item);
        self.func.push(self.current, IrInstr::StoreRetv { value });
        self.store_status(Status::Exception);
        self.flow.set_thrown();
        let target = self.flow.exception_block();
        self.func.set_terminator(self.current, IrTerminator::Jump { target });
        self.seal_dead_code();
        Ok(())
    }

    pub fn break_stmt(&mut self, label: Option<u32>) -> Result<(), BuilderError> {
        let target = self.flow.break_target(label).ok_or(BuilderError::NoMatchingTarget(label))?;
        self.func.set_terminator(self.current, IrTerminator::Jump { target });
        self.seal_dead_code();
        Ok(())
    }

    pub fn continue_stmt(&mut self, label: Option<u32>) -> Result<(), BuilderError> {
        let target = self.flow.continue_target(label).ok_or(BuilderError::NoMatchingTarget(label))?;
        self.func.set_terminator(self.current, IrTerminator::Jump { target });
        self.seal_dead_code();
        Ok(())
    }

    fn store_status(&mut self, status: Status) {
        let reg = self.func.alloc_reg(IrType::I32);
        self.func.push(self.current, IrInstr::ConstI32 { dest: reg, value: status.to_raw() as i32 });
        self.func.push(self.current, IrInstr::StoreStatus { value: reg });
    }

    // --- Coroutines ------------------------------------------------------------------------------

    /// Allocates a `CoroutineFrame` for `closure`, sized for `num_locals` persisted locals and
    /// `scratch_len` bytes of untagged scratch space.
    pub fn create_coroutine(&mut self, num_locals: u16, scratch_len: u16) -> Result<(), BuilderError> {
        let closure = match self.stack.pop()? {
            OperandStackItem::Closure(r) | OperandStackItem::Function(r) | OperandStackItem::Any(r) => r,
            other => panic!("create_coroutine expects a closure, found {other:?}"),
        };
        let dest = self.func.alloc_reg(IrType::Ptr);
        self.func.push(self.current, IrInstr::CreateCoroutine { dest, closure, num_locals, scratch_len });
        self.stack.push(OperandStackItem::CoroutineFrame(dest));
        Ok(())
    }

    /// `await`: suspends the current coroutine until `promise` settles. On first execution this
    /// records a fresh resume state, emits the suspend/resume split, and returns `Status::Suspend`
    /// from the current call; the resumed value (delivered through the shared `retv` slot, since
    /// the await helper itself reports only a status) is read back once control re-enters through
    /// the dispatch `switch` at the resume point.
    pub fn await_value(&mut self) -> Result<(), BuilderError> {
        let item = self.stack.pop()?;
        let promise = opcodes::ensure_any(&mut self.func, self.current, item);

        let resume_state = self.next_resume_state;
        self.next_resume_state += 1;
        self.func.push(self.current, IrInstr::StoreCoroutineState { state: resume_state });

        let status = self.func.alloc_reg(IrType::I32);
        self.func.push(self.current, IrInstr::AwaitPromise { dest: status, promise });

        let suspend_block = self.func.add_block();
        let resume_block = self.func.add_block();
        self.func.set_terminator(
            self.current,
            IrTerminator::Switch {
                value: status,
                cases: vec![(Status::Suspend.to_raw() as i64, suspend_block)],
                default: resume_block,
            },
        );
        self.func.set_terminator(suspend_block, IrTerminator::Return { status });

        self.resume_cases.push((resume_state as i64, resume_block));
        self.current = resume_block;

        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(self.current, IrInstr::LoadRetv { dest });
        self.stack.push(OperandStackItem::Any(dest));
        Ok(())
    }

    // --- Objects ---------------------------------------------------------------------------------

    pub fn create_object(&mut self) {
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(self.current, IrInstr::CallHelper { dest: Some(dest), name: helper_names::CREATE_OBJECT, args: vec![] });
        self.stack.push(OperandStackItem::Object(dest));
    }

    pub fn get_property(&mut self) -> Result<(), BuilderError> {
        let key_item = self.stack.pop()?;
        let key = opcodes::ensure_any(&mut self.func, self.current, key_item);
        let object_item = self.stack.pop()?;
        let object = match object_item {
            OperandStackItem::Object(r) | OperandStackItem::Any(r) => r,
            other => panic!("get_property target must be an object, found {other:?}"),
        };
        let dest = self.func.alloc_reg(IrType::Any);
        self.func.push(
            self.current,
            IrInstr::CallHelper { dest: Some(dest), name: helper_names::GET_VALUE, args: vec![object, key] },
        );
        self.stack.push(OperandStackItem::Any(dest));
        Ok(())
    }

    pub fn set_property(&mut self) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        let key_item = self.stack.pop()?;
        let key = opcodes::ensure_any(&mut self.func, self.current, key_item);
        let object_item = self.stack.pop()?;
        let object = match object_item {
            OperandStackItem::Object(r) | OperandStackItem::Any(r) => r,
            other => panic!("set_property target must be an object, found {other:?}"),
        };
        self.func.push(
            self.current,
            IrInstr::CallHelper { dest: None, name: helper_names::SET_VALUE, args: vec![object, key, value] },
        );
        self.stack.push(OperandStackItem::Any(value));
        Ok(())
    }

    /// Defines an own data property on the object beneath the key/value on the stack, leaving the
    /// object on top (used by object-literal construction, which defines several properties in a
    /// row before the literal's value is consumed).
    pub fn create_data_property(&mut self) -> Result<(), BuilderError> {
        let value_item = self.stack.pop()?;
        let value = opcodes::ensure_any(&mut self.func, self.current, value_item);
        let key_item = self.stack.pop()?;
        let key = opcodes::ensure_any(&mut self.func, self.current, key_item);
        let object = match self.stack.peek()? {
            OperandStackItem::Object(r) => *r,
            other => panic!("create_data_property without an object beneath it, found {other:?}"),
        };
        self.func.push(
            self.current,
            IrInstr::CallHelper { dest: None, name: helper_names::CREATE_DATA_PROPERTY, args: vec![object, key, value] },
        );
        Ok(())
    }

    /// Spreads a source object's own enumerable properties onto the target beneath it (object
    /// spread, `{ ...source }`), leaving the target on top.
    pub fn copy_data_properties(&mut self) -> Result<(), BuilderError> {
        let source_item = self.stack.pop()?;
        let source = opcodes::ensure_any(&mut self.func, self.current, source_item);
        let target = match self.stack.peek()? {
            OperandStackItem::Object(r) => *r,
            other => panic!("copy_data_properties without a target object beneath it, found {other:?}"),
        };
        self.func.push(
            self.current,
            IrInstr::CallHelper { dest: None, name: helper_names::COPY_DATA_PROPERTIES, args: vec![target, source] },
        );
        Ok(())
    }

    // --- Finish ----------------------------------------------------------------------------------

    /// Closes the function: wires the locals/args/body prologue chain, makes an implicit
    /// `return undefined` explicit for a body that falls off its end, and finalizes the return
    /// block. Consumes the builder.
    pub fn finish(mut self) -> Result<IrFunction, BuilderError> {
        if !self.stack.is_empty() {
            return Err(BuilderError::UnbalancedStack(self.stack.len()));
        }
        if self.flow.depth() != 1 {
            return Err(BuilderError::UnbalancedFlow);
        }
        let frame = self.flow.pop_function();

        self.func.set_terminator(frame.locals_block, IrTerminator::Jump { target: frame.args_block });
        if self.func.is_coroutine {
            let state_reg = self.coroutine_state_reg.expect("coroutine function must have a state register");
            self.func.set_terminator(frame.args_block, IrTerminator::Switch {
                value: state_reg,
                cases: self.resume_cases.clone(),
                default: frame.body_block,
            });
        } else {
            self.func.set_terminator(frame.args_block, IrTerminator::Jump { target: frame.body_block });
        }

        if self.unterminated(self.current) {
            self.func.set_terminator(self.current, IrTerminator::Jump { target: frame.return_block });
        }

        let status_reg = self.func.alloc_reg(IrType::I32);
        self.func.push(frame.return_block, IrInstr::LoadStatus { dest: status_reg });
        self.func.set_terminator(frame.return_block, IrTerminator::Return { status: status_reg });

        Ok(self.func)
    }
}

fn static_family(item: &OperandStackItem) -> Option<&'static str> {
    match item {
        OperandStackItem::Undefined => Some("undefined"),
        OperandStackItem::Null => Some("null"),
        OperandStackItem::Boolean(_) => Some("boolean"),
        OperandStackItem::Number(_) => Some("number"),
        OperandStackItem::String(_) => Some("string"),
        OperandStackItem::Function(_) => Some("function"),
        OperandStackItem::Closure(_) => Some("closure"),
        OperandStackItem::Promise(_) => Some("promise"),
        OperandStackItem::Object(_) => Some("object"),
        OperandStackItem::Any(_) | OperandStackItem::Reference { .. } | OperandStackItem::Argv(_)
        | OperandStackItem::Capture(_) | OperandStackItem::Block(_) | OperandStackItem::CoroutineFrame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(index: u16) -> Locator {
        Locator::local(index)
    }

    #[test]
    fn straight_line_function_returns_a_constant() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.const_number(42.0);
        b.return_stmt(true).unwrap();
        let f = b.finish().unwrap();
        assert!(f.blocks.len() >= 4);
    }

    #[test]
    fn declare_and_reload_local() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.const_number(1.0);
        b.declare_variable(locator(0), true).unwrap();
        b.reference(0, locator(0));
        b.dereference().unwrap();
        b.return_stmt(true).unwrap();
        let f = b.finish().unwrap();
        assert!(f.blocks.iter().any(|blk| blk.instrs.iter().any(|i| matches!(i, IrInstr::LoadLocal { .. }))));
    }

    #[test]
    fn if_else_wires_three_blocks() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.const_boolean(true);
        b.begin_if().unwrap();
        b.const_number(1.0);
        b.pop_discard().unwrap();
        b.begin_else();
        b.const_number(2.0);
        b.pop_discard().unwrap();
        b.end_if();
        b.return_stmt(false).unwrap();
        let f = b.finish().unwrap();
        assert!(f.blocks.len() > 6);
    }

    #[test]
    fn loop_break_resolves_to_end_block() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.loop_init(None);
        b.loop_test_begin();
        b.const_boolean(true);
        b.loop_test_end().unwrap();
        b.break_stmt(None).unwrap();
        b.loop_next_begin();
        b.loop_end();
        b.return_stmt(false).unwrap();
        let f = b.finish().unwrap();
        assert!(!f.blocks.is_empty());
    }

    #[test]
    fn unbalanced_stack_is_reported() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.const_number(1.0);
        assert!(matches!(b.finish(), Err(BuilderError::UnbalancedStack(1))));
    }

    #[test]
    fn strict_equality_short_circuits_on_type_mismatch() {
        let mut b = FunctionBuilder::new(0, "f", 0);
        b.const_number(1.0);
        b.const_boolean(true);
        b.binary_op(BinaryOp::StrictEq).unwrap();
        b.pop_discard().unwrap();
        b.return_stmt(false).unwrap();
        let f = b.finish().unwrap();
        assert!(f.blocks.iter().any(|blk| blk.instrs.iter().any(|i| matches!(i, IrInstr::ConstBool { value: false, .. }))));
    }
}
