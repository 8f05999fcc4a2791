//! `ControlFlowStack`: mirrors the source's structured control flow as a stack of [`FlowFrame`]s.

use crate::builder::ir::BlockId;
use crate::flow::frame::*;

/// One entry in the break or continue target stacks.
#[derive(Debug, Clone, Copy)]
pub struct FlowTarget {
    pub block: BlockId,
    /// `None` for an unlabelled target (matched by unlabelled `break`/`continue`); `Some(symbol)`
    /// for a labelled target (matched only by `break`/`continue` naming that label).
    pub label: Option<u32>,
}

/// The control-flow stack. Mirrors `FlowStack` from the reference bridge: a vector of frames plus
/// two indices tracking the nearest enclosing `Scope` and `Exception` frame, so flag propagation
/// and cleanup/exception-block resolution don't need to linear-scan the stack.
#[derive(Debug, Default)]
pub struct ControlFlowStack {
    stack: Vec<FlowFrame>,
    scope_index: usize,
    exception_index: usize,
    break_targets: Vec<FlowTarget>,
    continue_targets: Vec<FlowTarget>,
}

impl ControlFlowStack {
    pub fn new() -> Self {
        ControlFlowStack::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Number of open frames. A well-formed function ends `finish()` with exactly 1 (the
    /// outermost `Function` frame, not yet popped).
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn top(&self) -> &FlowFrame {
        self.stack.last().expect("control-flow stack underflow")
    }

    fn top_mut(&mut self) -> &mut FlowFrame {
        self.stack.last_mut().expect("control-flow stack underflow")
    }

    // --- Function frame -----------------------------------------------------------------------

    pub fn push_function(&mut self, frame: FunctionFrame) {
        assert!(self.stack.is_empty(), "function frame must be the outermost frame");
        self.stack.push(FlowFrame::Function(frame));
    }

    pub fn pop_function(&mut self) -> FunctionFrame {
        let frame = match self.stack.pop() {
            Some(FlowFrame::Function(f)) => f,
            other => panic!("expected function frame on top, found {other:?}"),
        };
        assert!(self.stack.is_empty(), "function frame popped with frames still open");
        assert_eq!(self.scope_index, 0);
        assert_eq!(self.exception_index, 0);
        frame
    }

    // --- Scope frame ---------------------------------------------------------------------------

    pub fn push_scope(&mut self, init: BlockId, hoisted: BlockId, block: BlockId, cleanup: BlockId) {
        let index = self.stack.len();
        self.stack.push(FlowFrame::Scope(ScopeFrame {
            init_block: init,
            hoisted_block: hoisted,
            block,
            cleanup_block: cleanup,
            outer_index: self.scope_index,
            returned: false,
            thrown: false,
        }));
        self.scope_index = index;
    }

    /// Pops the innermost scope, propagating its `returned`/`thrown` flags to whichever frame now
    /// sits on top (another `Scope`, an `Exception`, or the `Function` frame).
    pub fn pop_scope(&mut self) -> ScopeFrame {
        let frame = match self.stack.last() {
            Some(FlowFrame::Scope(f)) => *f,
            other => panic!("expected scope frame on top, found {other:?}"),
        };
        self.stack.pop();
        self.scope_index = frame.outer_index;

        match self.stack.last_mut() {
            Some(FlowFrame::Function(_)) | None => {}
            Some(FlowFrame::Scope(outer)) => {
                if frame.returned {
                    outer.returned = true;
                }
                if frame.thrown {
                    outer.thrown = true;
                }
            }
            Some(FlowFrame::Exception(outer)) => {
                if frame.thrown {
                    outer.thrown = true;
                }
            }
            Some(other) => panic!("scope frame enclosed by unexpected frame kind: {}", other.kind_name()),
        }
        frame
    }

    pub fn scope_frame(&self) -> &ScopeFrame {
        match &self.stack[self.scope_index] {
            FlowFrame::Scope(f) => f,
            _ => unreachable!("scope_index must always point at a Scope frame"),
        }
    }

    fn scope_frame_mut(&mut self) -> &mut ScopeFrame {
        match &mut self.stack[self.scope_index] {
            FlowFrame::Scope(f) => f,
            _ => unreachable!("scope_index must always point at a Scope frame"),
        }
    }

    // --- Exception frame -------------------------------------------------------------------------

    pub fn push_exception(&mut self, try_block: BlockId, catch_block: BlockId, finally_block: BlockId, end_block: BlockId) {
        let index = self.stack.len();
        self.stack.push(FlowFrame::Exception(ExceptionFrame {
            try_block,
            catch_block,
            finally_block,
            end_block,
            outer_index: self.exception_index,
            thrown: false,
            caught: false,
            ended: false,
        }));
        self.exception_index = index;
    }

    pub fn pop_exception(&mut self) -> ExceptionFrame {
        let frame = match self.stack.last() {
            Some(FlowFrame::Exception(f)) => *f,
            other => panic!("expected exception frame on top, found {other:?}"),
        };
        self.stack.pop();
        self.exception_index = frame.outer_index;

        match self.stack.last_mut() {
            Some(FlowFrame::Scope(outer)) => {
                if frame.thrown {
                    outer.thrown = true;
                }
            }
            other => panic!("exception frame must be enclosed by a scope frame, found {other:?}"),
        }
        frame
    }

    pub fn exception_frame(&self) -> &ExceptionFrame {
        match &self.stack[self.exception_index] {
            FlowFrame::Exception(f) => f,
            _ => unreachable!("exception_index must always point at an Exception frame"),
        }
    }

    fn exception_frame_mut(&mut self) -> &mut ExceptionFrame {
        match &mut self.stack[self.exception_index] {
            FlowFrame::Exception(f) => f,
            _ => unreachable!("exception_index must always point at an Exception frame"),
        }
    }

    // --- Generic push/pop for the remaining frame kinds -----------------------------------------

    pub fn push(&mut self, frame: FlowFrame) {
        self.stack.push(frame);
    }

    pub fn pop(&mut self) -> FlowFrame {
        self.stack.pop().expect("control-flow stack underflow")
    }

    // --- Flags -----------------------------------------------------------------------------------

    /// Marks the current scope (or, harmlessly, does nothing at function scope) as containing a
    /// `return`.
    pub fn set_returned(&mut self) {
        match self.top_mut() {
            FlowFrame::Function(_) => {}
            FlowFrame::Scope(s) => s.returned = true,
            other => panic!("set_returned called with {} on top", other.kind_name()),
        }
    }

    /// Marks the innermost scope as containing an uncaught throw.
    pub fn set_thrown(&mut self) {
        self.scope_frame_mut().thrown = true;
    }

    /// Marks the innermost exception frame as having entered its `catch` (or, if `nominal` is
    /// false, as having its pending exception cleared by a handled catch).
    pub fn set_caught(&mut self, nominal: bool) {
        let frame = self.exception_frame_mut();
        frame.caught = true;
        if !nominal {
            frame.thrown = false;
        }
    }

    /// Marks the innermost exception frame as having reached its `end_block`.
    pub fn set_ended(&mut self) {
        self.exception_frame_mut().ended = true;
    }

    // --- Cleanup / exception block resolution --------------------------------------------------

    /// Where control should go on a normal (non-exceptional) exit from the current frame.
    pub fn cleanup_block(&self) -> BlockId {
        match self.top() {
            FlowFrame::Function(f) => f.return_block,
            FlowFrame::Scope(s) => s.cleanup_block,
            FlowFrame::Exception(_) => self.scope_frame().cleanup_block,
            other => panic!("cleanup_block undefined for {} frame", other.kind_name()),
        }
    }

    /// Where control should go when an exception is propagating through the current frame.
    pub fn exception_block(&self) -> BlockId {
        match self.top() {
            FlowFrame::Function(f) => f.return_block,
            FlowFrame::Scope(s) => s.cleanup_block,
            FlowFrame::Exception(e) => {
                if e.ended {
                    e.end_block
                } else if e.caught {
                    e.finally_block
                } else {
                    e.catch_block
                }
            }
            other => panic!("exception_block undefined for {} frame", other.kind_name()),
        }
    }

    // --- Break / continue targeting --------------------------------------------------------------

    pub fn push_break_target(&mut self, block: BlockId, label: Option<u32>) {
        self.break_targets.push(FlowTarget { block, label });
    }

    pub fn pop_break_target(&mut self) {
        self.break_targets.pop();
    }

    pub fn push_continue_target(&mut self, block: BlockId, label: Option<u32>) {
        self.continue_targets.push(FlowTarget { block, label });
    }

    pub fn pop_continue_target(&mut self) {
        self.continue_targets.pop();
    }

    /// Resolves an unlabelled or labelled `break`'s target block.
    pub fn break_target(&self, label: Option<u32>) -> Option<BlockId> {
        resolve_target(&self.break_targets, label)
    }

    /// Resolves an unlabelled or labelled `continue`'s target block.
    pub fn continue_target(&self, label: Option<u32>) -> Option<BlockId> {
        resolve_target(&self.continue_targets, label)
    }
}

fn resolve_target(targets: &[FlowTarget], label: Option<u32>) -> Option<BlockId> {
    match label {
        None => targets.last().map(|t| t.block),
        Some(sym) => targets.iter().rev().find(|t| t.label == Some(sym)).map(|t| t.block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(n: u32) -> BlockId {
        BlockId(n)
    }

    #[test]
    fn function_frame_push_pop() {
        let mut s = ControlFlowStack::new();
        s.push_function(FunctionFrame {
            locals_block: bb(0),
            args_block: bb(1),
            body_block: bb(2),
            return_block: bb(3),
        });
        assert!(!s.is_empty());
        let f = s.pop_function();
        assert_eq!(f.return_block, bb(3));
        assert!(s.is_empty());
    }

    #[test]
    fn scope_return_propagates_to_outer_scope() {
        let mut s = ControlFlowStack::new();
        s.push_function(FunctionFrame { locals_block: bb(0), args_block: bb(1), body_block: bb(2), return_block: bb(9) });
        s.push_scope(bb(3), bb(4), bb(5), bb(6));
        s.push_scope(bb(10), bb(11), bb(12), bb(13));
        s.set_returned();
        let inner = s.pop_scope();
        assert!(inner.returned);
        assert!(s.scope_frame().returned);
        s.pop_scope();
        s.pop_function();
    }

    #[test]
    fn exception_thrown_propagates_to_enclosing_scope() {
        let mut s = ControlFlowStack::new();
        s.push_function(FunctionFrame { locals_block: bb(0), args_block: bb(1), body_block: bb(2), return_block: bb(9) });
        s.push_scope(bb(3), bb(4), bb(5), bb(6));
        s.push_exception(bb(20), bb(21), bb(22), bb(23));
        s.set_thrown();
        let exc = s.pop_exception();
        assert!(exc.thrown);
        assert!(s.scope_frame().thrown);
        s.pop_scope();
        s.pop_function();
    }

    #[test]
    fn cleanup_and_exception_block_resolution() {
        let mut s = ControlFlowStack::new();
        s.push_function(FunctionFrame { locals_block: bb(0), args_block: bb(1), body_block: bb(2), return_block: bb(9) });
        s.push_scope(bb(3), bb(4), bb(5), bb(6));
        assert_eq!(s.cleanup_block(), bb(6));
        s.push_exception(bb(20), bb(21), bb(22), bb(23));
        assert_eq!(s.exception_block(), bb(21)); // not caught yet -> catch_block
        s.set_caught(true);
        assert_eq!(s.exception_block(), bb(22)); // caught -> finally_block
        s.set_ended();
        assert_eq!(s.exception_block(), bb(23)); // ended -> end_block
        s.pop_exception();
        s.pop_scope();
        s.pop_function();
    }

    #[test]
    fn labelled_break_skips_unlabelled_targets() {
        let mut s = ControlFlowStack::new();
        s.push_break_target(bb(1), None);
        s.push_break_target(bb(2), Some(42));
        assert_eq!(s.break_target(None), Some(bb(2)));
        assert_eq!(s.break_target(Some(42)), Some(bb(2)));
        assert_eq!(s.break_target(Some(7)), None);
    }
}
