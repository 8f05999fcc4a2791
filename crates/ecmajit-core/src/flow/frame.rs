//! Flow frames: one element per structured construct currently being built.

use crate::builder::ir::{BlockId, Reg};

/// The basic blocks belonging to a function's outermost frame.
#[derive(Debug, Clone, Copy)]
pub struct FunctionFrame {
    pub locals_block: BlockId,
    pub args_block: BlockId,
    pub body_block: BlockId,
    pub return_block: BlockId,
}

/// The basic blocks and exit flags belonging to a lexical scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopeFrame {
    pub init_block: BlockId,
    pub hoisted_block: BlockId,
    pub block: BlockId,
    pub cleanup_block: BlockId,
    pub outer_index: usize,
    pub returned: bool,
    pub thrown: bool,
}

/// One side of a conditional under construction.
#[derive(Debug, Clone, Copy)]
pub struct BranchFrame {
    pub before_block: BlockId,
    pub after_block: BlockId,
}

/// The init-clause block of a `for`/`while` loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopInitFrame {
    pub init_block: BlockId,
    pub test_block: BlockId,
}

/// The test-clause block of a loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopTestFrame {
    pub test_block: BlockId,
    pub body_block: BlockId,
    pub end_block: BlockId,
}

/// The update-clause block of a `for` loop (`i++` in `for(;;i++)`).
#[derive(Debug, Clone, Copy)]
pub struct LoopNextFrame {
    pub next_block: BlockId,
    pub test_block: BlockId,
}

/// The body block of a loop, which `continue` targets.
#[derive(Debug, Clone, Copy)]
pub struct LoopBodyFrame {
    pub body_block: BlockId,
    pub continue_target: BlockId,
}

/// A `switch` statement under construction; `break` targets `end_block`.
#[derive(Debug, Clone, Copy)]
pub struct SelectFrame {
    pub end_block: BlockId,
    /// The boxed discriminant value, compared against each `case` expression.
    pub scrutinee: Reg,
    /// The comparison block awaiting either the next `case`'s branch or, at `end_switch`, a
    /// fallback jump to `default_body` or `end_block`.
    pub pending_cmp_block: BlockId,
    /// The most recently opened case/default body, whose fall-through edge isn't wired yet.
    pub pending_case_body: Option<BlockId>,
    pub default_body: Option<BlockId>,
}

/// One `case`/`default` clause, for fall-through into the next clause.
#[derive(Debug, Clone, Copy)]
pub struct CaseEndFrame {
    pub case_block: BlockId,
    pub next_block: BlockId,
}

/// The static type a ternary expression merges its two arms into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TernaryKind {
    Boolean,
    Number,
    Any,
}

/// A ternary (`cond ? then : else`) expression under construction; unlike `BranchFrame`, both arms
/// must merge a value into `merge_reg` before jumping to `after_block`.
#[derive(Debug, Clone, Copy)]
pub struct TernaryFrame {
    pub before_block: BlockId,
    pub after_block: BlockId,
    pub merge_reg: Reg,
    pub kind: TernaryKind,
}

/// The basic blocks and flags belonging to a `try`/`catch`/`finally` construct.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionFrame {
    pub try_block: BlockId,
    pub catch_block: BlockId,
    pub finally_block: BlockId,
    pub end_block: BlockId,
    pub outer_index: usize,
    pub thrown: bool,
    pub caught: bool,
    pub ended: bool,
}

/// One element of the control-flow stack.
#[derive(Debug, Clone, Copy)]
pub enum FlowFrame {
    Function(FunctionFrame),
    Scope(ScopeFrame),
    Branch(BranchFrame),
    LoopInit(LoopInitFrame),
    LoopTest(LoopTestFrame),
    LoopNext(LoopNextFrame),
    LoopBody(LoopBodyFrame),
    Select(SelectFrame),
    CaseEnd(CaseEndFrame),
    Exception(ExceptionFrame),
    Ternary(TernaryFrame),
}

impl FlowFrame {
    /// Short discriminant name, used in diagnostics (mirrors the teacher's `FlowKind` dump).
    pub fn kind_name(&self) -> &'static str {
        match self {
            FlowFrame::Function(_) => "function",
            FlowFrame::Scope(_) => "scope",
            FlowFrame::Branch(_) => "branch",
            FlowFrame::LoopInit(_) => "loop-init",
            FlowFrame::LoopTest(_) => "loop-test",
            FlowFrame::LoopNext(_) => "loop-next",
            FlowFrame::LoopBody(_) => "loop-body",
            FlowFrame::Select(_) => "select",
            FlowFrame::CaseEnd(_) => "case-end",
            FlowFrame::Exception(_) => "exception",
            FlowFrame::Ternary(_) => "ternary",
        }
    }
}
