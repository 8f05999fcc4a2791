//! `Capture`: the heap indirection cell that lets a local outlive its stack frame.

use ecmajit_sdk::value::Variable;

/// Layout of a capture cell: while the enclosing scope is live, `target` points at the
/// stack-resident [`Variable`]; at scope exit the value is copied into `escaped` and `target` is
/// rewritten to point there. Readers always dereference through `target`, so this rewrite is
/// invisible to them.
///
/// This struct describes the layout for the Cranelift lowering's offset arithmetic; the actual
/// heap allocation is performed by the host's `runtime_create_capture` helper (see
/// [`crate::abi::signatures`]), not by this crate.
#[repr(C)]
pub struct Capture {
    /// Pointer to the current value — either the live stack `Variable` or `&escaped`.
    pub target: *mut Variable,
    /// Storage used once the enclosing scope has exited.
    pub escaped: Variable,
}

impl Capture {
    /// Byte offset of the `target` field (always 0; kept as a named constant so callers never
    /// hardcode the number).
    pub const TARGET_OFFSET: i32 = 0;

    /// Byte offset of the `escaped` field.
    pub const ESCAPED_OFFSET: i32 = std::mem::size_of::<*mut Variable>() as i32;

    /// Total size of a `Capture` record, as the host's allocator must reserve.
    pub const SIZE: usize = std::mem::size_of::<Capture>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_at_offset_zero() {
        assert_eq!(Capture::TARGET_OFFSET, 0);
    }

    #[test]
    fn escaped_follows_target_pointer() {
        assert_eq!(Capture::ESCAPED_OFFSET as usize, std::mem::size_of::<usize>());
    }
}
