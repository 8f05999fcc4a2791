//! Shared lowering helpers used by several opcode families in [`crate::builder::function_builder`].
//!
//! These are pure functions over an [`crate::builder::ir::IrFunction`] plus a target block; they
//! don't touch the operand stack or control-flow stack themselves, so the opcode methods that call
//! them stay readable as "pop operands, normalize, emit, push result".

use crate::builder::ir::{BlockId, FCmpOp, IrFunction, IrInstr, IrType, Reg};
use crate::builder::operand::OperandStackItem;

/// ECMAScript comparison/equality operators the builder must lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    Lte,
    Gte,
    LeftShift,
    SignedRightShift,
    UnsignedRightShift,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

/// Ensures `item` is available as an `Any` register, boxing it if it was a statically-typed
/// unboxed value. Used when an operand must cross a runtime-helper boundary (e.g. loose equality).
pub fn ensure_any(func: &mut IrFunction, block: BlockId, item: OperandStackItem) -> Reg {
    match item {
        OperandStackItem::Any(r) | OperandStackItem::String(r) | OperandStackItem::Closure(r)
        | OperandStackItem::Promise(r) | OperandStackItem::Object(r) | OperandStackItem::Function(r) => r,
        OperandStackItem::Undefined | OperandStackItem::Null => {
            let dest = func.alloc_reg(IrType::Any);
            func.push(block, if matches!(item, OperandStackItem::Undefined) {
                IrInstr::ConstUndefined { dest }
            } else {
                IrInstr::ConstNull { dest }
            });
            dest
        }
        OperandStackItem::Boolean(r) => {
            let dest = func.alloc_reg(IrType::Any);
            func.push(block, IrInstr::Box { dest, src: r, src_ty: IrType::Bool });
            dest
        }
        OperandStackItem::Number(r) => {
            let dest = func.alloc_reg(IrType::Any);
            func.push(block, IrInstr::Box { dest, src: r, src_ty: IrType::F64 });
            dest
        }
        OperandStackItem::Reference { .. } | OperandStackItem::Argv(_) | OperandStackItem::Capture(_)
        | OperandStackItem::Block(_) | OperandStackItem::CoroutineFrame(_) => {
            panic!("ensure_any called on a non-value operand stack item")
        }
    }
}

/// Coerces an operand to `F64` via ECMAScript ToNumeric, unless it is already statically `Number`.
pub fn ensure_numeric(func: &mut IrFunction, block: BlockId, item: OperandStackItem) -> Reg {
    match item {
        OperandStackItem::Number(r) => r,
        other => {
            let any = ensure_any(func, block, other);
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::ToNumeric { dest, src: any });
            dest
        }
    }
}

/// Emits the typed arithmetic/comparison instruction for a numeric binary op and returns the
/// resulting operand stack item.
pub fn emit_numeric_binary(
    func: &mut IrFunction,
    block: BlockId,
    op: BinaryOp,
    lhs: Reg,
    rhs: Reg,
) -> OperandStackItem {
    match op {
        BinaryOp::Add => {
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::FAdd { dest, lhs, rhs });
            OperandStackItem::Number(dest)
        }
        BinaryOp::Sub => {
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::FSub { dest, lhs, rhs });
            OperandStackItem::Number(dest)
        }
        BinaryOp::Mul => {
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::FMul { dest, lhs, rhs });
            OperandStackItem::Number(dest)
        }
        BinaryOp::Div => {
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::FDiv { dest, lhs, rhs });
            OperandStackItem::Number(dest)
        }
        BinaryOp::Rem => {
            let dest = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::FRem { dest, lhs, rhs });
            OperandStackItem::Number(dest)
        }
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Lte | BinaryOp::Gte => {
            let cmp = match op {
                BinaryOp::Lt => FCmpOp::Lt,
                BinaryOp::Gt => FCmpOp::Gt,
                BinaryOp::Lte => FCmpOp::Le,
                BinaryOp::Gte => FCmpOp::Ge,
                _ => unreachable!(),
            };
            let dest = func.alloc_reg(IrType::Bool);
            func.push(block, IrInstr::FCmp { dest, op: cmp, lhs, rhs });
            OperandStackItem::Boolean(dest)
        }
        BinaryOp::LeftShift | BinaryOp::SignedRightShift | BinaryOp::UnsignedRightShift => {
            let left_i32 = func.alloc_reg(IrType::I32);
            func.push(block, IrInstr::ToInt32 { dest: left_i32, src: lhs });
            let right_u32 = func.alloc_reg(IrType::U32);
            func.push(block, IrInstr::ToUint32 { dest: right_u32, src: rhs });
            let shifted = func.alloc_reg(IrType::I32);
            let instr = match op {
                BinaryOp::LeftShift => IrInstr::IShl { dest: shifted, lhs: left_i32, rhs: right_u32 },
                BinaryOp::SignedRightShift => IrInstr::ISar { dest: shifted, lhs: left_i32, rhs: right_u32 },
                BinaryOp::UnsignedRightShift => IrInstr::IShr { dest: shifted, lhs: left_i32, rhs: right_u32 },
                _ => unreachable!(),
            };
            func.push(block, instr);
            let result = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::ToNumeric { dest: result, src: shifted });
            OperandStackItem::Number(result)
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
            let left_i32 = func.alloc_reg(IrType::I32);
            func.push(block, IrInstr::ToInt32 { dest: left_i32, src: lhs });
            let right_i32 = func.alloc_reg(IrType::I32);
            func.push(block, IrInstr::ToInt32 { dest: right_i32, src: rhs });
            let combined = func.alloc_reg(IrType::I32);
            let instr = match op {
                BinaryOp::BitAnd => IrInstr::IAnd { dest: combined, lhs: left_i32, rhs: right_i32 },
                BinaryOp::BitOr => IrInstr::IOr { dest: combined, lhs: left_i32, rhs: right_i32 },
                BinaryOp::BitXor => IrInstr::IXor { dest: combined, lhs: left_i32, rhs: right_i32 },
                _ => unreachable!(),
            };
            func.push(block, instr);
            let result = func.alloc_reg(IrType::F64);
            func.push(block, IrInstr::ToNumeric { dest: result, src: combined });
            OperandStackItem::Number(result)
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::StrictEq | BinaryOp::StrictNe => {
            unreachable!("equality is dispatched in FunctionBuilder, not emit_numeric_binary")
        }
    }
}
