//! The SSA IR: virtual registers, typed instructions, basic blocks, and functions.

use rustc_hash::FxHashMap;

/// The static type of an IR value. `Any` means the runtime kind is known only by the tag stored
/// alongside the boxed `Value` the pointer addresses; everything else is an unboxed fast-path
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    /// 32-bit signed integer (used for ToInt32/bitwise results before reboxing).
    I32,
    /// 32-bit unsigned integer (used for ToUint32 results).
    U32,
    /// IEEE-754 double; the native representation of ECMAScript Number.
    F64,
    /// Boolean.
    Bool,
    /// Raw pointer (captures, closures, coroutine frames, argv/retv slots).
    Ptr,
    /// Pointer to a boxed `Value` whose kind is not statically known.
    Any,
}

/// A virtual register: an SSA value produced by exactly one instruction (or a block parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

/// A basic block identifier, stable across the lifetime of an [`IrFunction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// A local variable slot index within a function's locals block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalSlot(pub u32);

/// Non-terminator SSA instructions.
#[derive(Debug, Clone)]
pub enum IrInstr {
    /// Materializes `undefined`.
    ConstUndefined { dest: Reg },
    /// Materializes `null`.
    ConstNull { dest: Reg },
    /// Materializes a boolean constant.
    ConstBool { dest: Reg, value: bool },
    /// Materializes a number constant.
    ConstF64 { dest: Reg, value: f64 },
    /// Materializes a reference to a declared function by its module-level id.
    ConstFunctionRef { dest: Reg, func_id: u32 },
    /// Materializes a raw 32-bit integer constant (switch dispatch values, status codes).
    ConstI32 { dest: Reg, value: i32 },

    /// Writes the function-wide `retv` out-parameter.
    StoreRetv { value: Reg },
    /// Reads the function-wide `retv` out-parameter back (used by a host-visible debug path).
    LoadRetv { dest: Reg },

    /// Allocates a `Variable`-shaped stack slot in the locals block.
    AllocLocal { slot: LocalSlot },
    /// Loads a value from a local slot as `Any` (address of the slot's `Value` view).
    LoadLocal { dest: Reg, slot: LocalSlot },
    /// Stores a value into a local slot, setting its initialized flag.
    StoreLocal { slot: LocalSlot, value: Reg },

    /// Loads argument `index` from the current call's argv buffer.
    LoadArgument { dest: Reg, index: u16 },
    /// Loads capture table entry `index` through its target pointer.
    LoadCapture { dest: Reg, index: u16 },
    /// Stores into capture table entry `index` through its target pointer.
    StoreCapture { index: u16, value: Reg },

    /// Unboxes an `Any` into an `F64`, coercing with ToNumeric if the static type isn't already
    /// numeric.
    ToNumeric { dest: Reg, src: Reg },
    /// Converts an `F64` into an `I32` (ECMAScript ToInt32 semantics).
    ToInt32 { dest: Reg, src: Reg },
    /// Converts an `F64` into a `U32` (ECMAScript ToUint32 semantics).
    ToUint32 { dest: Reg, src: Reg },
    /// Converts any typed operand into a `Bool` (ECMAScript ToBoolean).
    ToBoolean { dest: Reg, src: Reg },

    /// Boxes a typed value into an `Any` (allocates/writes a `Value`-shaped stack temporary).
    Box { dest: Reg, src: Reg, src_ty: IrType },
    /// Unboxes an `Any` into its statically-expected typed representation.
    Unbox { dest: Reg, src: Reg, dest_ty: IrType },

    /// `lhs + rhs`, both `F64`.
    FAdd { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs - rhs`, both `F64`.
    FSub { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs * rhs`, both `F64`.
    FMul { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs / rhs`, both `F64`.
    FDiv { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs % rhs`, both `F64` (ECMAScript remainder semantics, not IEEE fmod truncation rules).
    FRem { dest: Reg, lhs: Reg, rhs: Reg },
    /// IEEE-754 comparison producing a `Bool`.
    FCmp { dest: Reg, op: FCmpOp, lhs: Reg, rhs: Reg },

    /// `lhs << rhs`, both `I32`.
    IShl { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs >> rhs` (arithmetic), both `I32`.
    ISar { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs >>> rhs` (logical), `lhs` as `U32`.
    IShr { dest: Reg, lhs: Reg, rhs: Reg },
    /// Unary `-x`, `F64`.
    FNeg { dest: Reg, src: Reg },
    /// Unary boolean negation.
    BoolNot { dest: Reg, src: Reg },
    /// Unary `+x` is ToNumeric; no separate instruction is needed (lowered to `ToNumeric`).

    /// `lhs & rhs`, both `I32`.
    IAnd { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs | rhs`, both `I32`.
    IOr { dest: Reg, lhs: Reg, rhs: Reg },
    /// `lhs ^ rhs`, both `I32`.
    IXor { dest: Reg, lhs: Reg, rhs: Reg },
    /// Unary `~x`, `I32`.
    INot { dest: Reg, src: Reg },

    /// Strict or loose equality between two `Any` operands, delegated to a runtime helper.
    RuntimeEquals { dest: Reg, lhs: Reg, rhs: Reg, strict: bool, helper: &'static str },
    /// Boolean equality producible without a helper call (both operands statically typed alike).
    BoolEq { dest: Reg, lhs: Reg, rhs: Reg, negate: bool },
    /// Numeric equality producible without a helper call.
    NumEq { dest: Reg, lhs: Reg, rhs: Reg, negate: bool },

    /// Calls a named runtime helper with the given `Any`/`Ptr` arguments, producing `dest`.
    CallHelper { dest: Option<Reg>, name: &'static str, args: Vec<Reg> },

    /// Allocates an argv buffer of `argc` `Value` slots in the locals block.
    AllocArgv { dest: Reg, argc: u16 },
    /// Stores an `Any` operand into `argv[index]`.
    StoreArgv { argv: Reg, index: u16, value: Reg },
    /// Calls a closure's lambda, passing its capture table as `ctx`.
    CallClosure { dest: Reg, status: Reg, closure: Reg, argv: Reg, argc: u16 },

    /// Calls `runtime_create_capture` for a local slot, recording the resulting `*Capture`.
    CreateCapture { dest: Reg, slot: LocalSlot },
    /// Copies a local's current value into its capture's `escaped` field and rewrites `target`.
    EscapeCapture { capture: Reg, slot: LocalSlot },
    /// Calls `runtime_create_closure` then fills in `num_captures` table entries.
    CreateClosure { dest: Reg, func_id: u32, captures: Vec<Reg> },

    /// Reads the current `status` register.
    LoadStatus { dest: Reg },
    /// Writes the `status` register.
    StoreStatus { value: Reg },
    /// Writes the `flow_selector` register.
    StoreFlowSelector { value: u32 },

    /// Calls `runtime_create_coroutine`, allocating a `CoroutineFrame` for `closure` sized for
    /// `num_locals` local slots and `scratch_len` scratch bytes.
    CreateCoroutine { dest: Reg, closure: Reg, num_locals: u16, scratch_len: u16 },
    /// Reads the resumption state out of the current call's `CoroutineFrame` (addressed by `ctx`).
    LoadCoroutineState { dest: Reg },
    /// Writes the resumption state into the current call's `CoroutineFrame`, recording where the
    /// next `resume` should dispatch to.
    StoreCoroutineState { state: u32 },
    /// Calls `runtime_await_promise` against the current call's `CoroutineFrame` (addressed by
    /// `ctx`), suspending on `promise` and returning the status the caller should see
    /// (`Status::Suspend` if not yet settled).
    AwaitPromise { dest: Reg, promise: Reg },

    /// Copies a register (used by optimisation passes; also a convenient normal-form for PHI
    /// elimination after `simplifycfg`).
    Move { dest: Reg, src: Reg },

    /// SSA phi: picks a value depending on which predecessor block was taken.
    Phi { dest: Reg, ty: IrType, incoming: Vec<(BlockId, Reg)> },
}

/// Floating-point comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmpOp {
    Lt,
    Gt,
    Le,
    Ge,
}

impl IrInstr {
    /// The register this instruction defines, if any.
    pub fn dest(&self) -> Option<Reg> {
        use IrInstr::*;
        match self {
            ConstUndefined { dest }
            | ConstNull { dest }
            | ConstBool { dest, .. }
            | ConstF64 { dest, .. }
            | ConstFunctionRef { dest, .. }
            | ConstI32 { dest, .. }
            | LoadRetv { dest }
            | LoadLocal { dest, .. }
            | LoadArgument { dest, .. }
            | LoadCapture { dest, .. }
            | ToNumeric { dest, .. }
            | ToInt32 { dest, .. }
            | ToUint32 { dest, .. }
            | ToBoolean { dest, .. }
            | Box { dest, .. }
            | Unbox { dest, .. }
            | FAdd { dest, .. }
            | FSub { dest, .. }
            | FMul { dest, .. }
            | FDiv { dest, .. }
            | FRem { dest, .. }
            | FCmp { dest, .. }
            | IShl { dest, .. }
            | ISar { dest, .. }
            | IShr { dest, .. }
            | FNeg { dest, .. }
            | BoolNot { dest, .. }
            | IAnd { dest, .. }
            | IOr { dest, .. }
            | IXor { dest, .. }
            | INot { dest, .. }
            | RuntimeEquals { dest, .. }
            | BoolEq { dest, .. }
            | NumEq { dest, .. }
            | AllocArgv { dest, .. }
            | CallClosure { dest, .. }
            | CreateCapture { dest, .. }
            | CreateClosure { dest, .. }
            | CreateCoroutine { dest, .. }
            | LoadCoroutineState { dest }
            | AwaitPromise { dest, .. }
            | LoadStatus { dest }
            | Move { dest, .. }
            | Phi { dest, .. } => Some(*dest),
            CallHelper { dest, .. } => *dest,
            AllocLocal { .. }
            | StoreLocal { .. }
            | StoreCapture { .. }
            | StoreArgv { .. }
            | EscapeCapture { .. }
            | StoreStatus { .. }
            | StoreRetv { .. }
            | StoreFlowSelector { .. }
            | StoreCoroutineState { .. } => None,
        }
    }

    /// Whether this instruction must be kept even if its result is unused — calls into the
    /// runtime, captures, and stores are all observable side effects.
    pub fn has_side_effects(&self) -> bool {
        use IrInstr::*;
        matches!(
            self,
            StoreLocal { .. }
                | StoreCapture { .. }
                | StoreArgv { .. }
                | CreateCapture { .. }
                | EscapeCapture { .. }
                | CreateClosure { .. }
                | CallClosure { .. }
                | CallHelper { .. }
                | AllocLocal { .. }
                | AllocArgv { .. }
                | StoreStatus { .. }
                | StoreRetv { .. }
                | StoreFlowSelector { .. }
                | CreateCoroutine { .. }
                | StoreCoroutineState { .. }
                | AwaitPromise { .. }
        )
    }
}

/// A terminator ends a basic block and transfers control.
#[derive(Debug, Clone)]
pub enum IrTerminator {
    /// Unconditional jump.
    Jump { target: BlockId },
    /// Conditional jump on a `Bool` register.
    Branch { cond: Reg, then_block: BlockId, else_block: BlockId },
    /// Multi-way jump on an `I32`/`U32` register (switch/case dispatch, coroutine resumption).
    Switch { value: Reg, cases: Vec<(i64, BlockId)>, default: BlockId },
    /// Returns from the function with the given status code and (optionally) no payload register
    /// (the payload always lives in the shared `retv` slot, written before this terminator).
    Return { status: Reg },
    /// Marks a block as unreachable (the "dead-code" block inserted after every terminator-path
    /// opcode, pruned by `simplifycfg`).
    Unreachable,
}

/// A basic block: a straight-line instruction sequence ending in exactly one terminator.
#[derive(Debug, Clone, Default)]
pub struct IrBlock {
    pub instrs: Vec<IrInstr>,
    pub terminator: Option<IrTerminator>,
}

/// One compiled function: its blocks, its register/slot allocation counters, and ABI metadata.
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub func_id: u32,
    pub name: String,
    pub num_params: u16,
    pub blocks: Vec<IrBlock>,
    pub entry: BlockId,
    next_reg: u32,
    next_slot: u32,
    pub reg_types: FxHashMap<Reg, IrType>,
    /// Whether this function's `ctx` parameter addresses a `CoroutineFrame` rather than an
    /// ordinary closure's capture table, and its locals therefore live in `frame.locals` instead
    /// of Cranelift stack slots.
    pub is_coroutine: bool,
}

impl IrFunction {
    pub fn new(func_id: u32, name: impl Into<String>, num_params: u16) -> Self {
        let mut f = IrFunction {
            func_id,
            name: name.into(),
            num_params,
            blocks: Vec::new(),
            entry: BlockId(0),
            next_reg: 0,
            next_slot: 0,
            reg_types: FxHashMap::default(),
            is_coroutine: false,
        };
        let entry = f.add_block();
        f.entry = entry;
        f
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock::default());
        id
    }

    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn alloc_reg(&mut self, ty: IrType) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    pub fn alloc_slot(&mut self) -> LocalSlot {
        let slot = LocalSlot(self.next_slot);
        self.next_slot += 1;
        slot
    }

    pub fn push(&mut self, block: BlockId, instr: IrInstr) {
        self.blocks[block.0 as usize].instrs.push(instr);
    }

    pub fn set_terminator(&mut self, block: BlockId, term: IrTerminator) {
        self.blocks[block.0 as usize].terminator = Some(term);
    }
}

/// A compiled module: a collection of functions sharing a symbol namespace.
#[derive(Debug, Clone, Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn new() -> Self {
        IrModule::default()
    }

    pub fn add_function(&mut self, func: IrFunction) {
        self.functions.push(func);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_function_has_one_block() {
        let f = IrFunction::new(0, "f", 0);
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.entry, BlockId(0));
    }

    #[test]
    fn reg_allocation_is_monotonic() {
        let mut f = IrFunction::new(0, "f", 0);
        let r0 = f.alloc_reg(IrType::F64);
        let r1 = f.alloc_reg(IrType::Bool);
        assert_ne!(r0, r1);
        assert_eq!(f.reg_types[&r0], IrType::F64);
        assert_eq!(f.reg_types[&r1], IrType::Bool);
    }

    #[test]
    fn side_effect_classification() {
        let store = IrInstr::StoreLocal { slot: LocalSlot(0), value: Reg(0) };
        assert!(store.has_side_effects());
        let add = IrInstr::FAdd { dest: Reg(1), lhs: Reg(0), rhs: Reg(0) };
        assert!(!add.has_side_effects());
    }
}
