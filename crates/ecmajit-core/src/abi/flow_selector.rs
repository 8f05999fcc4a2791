//! The `FlowSelector` register: tells cleanup code what to do after a scope's cleanup block runs.

/// What kind of non-local exit is in progress.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Propagating a `return`.
    Return = 0,
    /// Propagating a `throw`.
    Throw = 1,
    /// Propagating a `break`, possibly labelled.
    Break = 2,
    /// Propagating a `continue`, possibly labelled.
    Continue = 3,
    /// No non-local exit is in progress; fall through normally.
    Normal = 0xFF,
}

/// Packs a [`FlowKind`] with a target depth into one `u32` register.
///
/// `depth` identifies which enclosing labelled construct a `break`/`continue` targets: 0 means
/// "the nearest enclosing applicable construct", and each additional level walks one further
/// labelled construct outward. Cleanup chains read this register to decide whether to keep
/// propagating outward or to branch directly to the target block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSelector {
    kind: FlowKind,
    depth: u16,
}

impl FlowSelector {
    /// The "nothing special happening" selector.
    pub const NORMAL: FlowSelector = FlowSelector {
        kind: FlowKind::Normal,
        depth: 0,
    };

    /// Constructs a selector for a `return`.
    pub fn returning() -> Self {
        FlowSelector {
            kind: FlowKind::Return,
            depth: 0,
        }
    }

    /// Constructs a selector for a `throw`.
    pub fn throwing() -> Self {
        FlowSelector {
            kind: FlowKind::Throw,
            depth: 0,
        }
    }

    /// Constructs a selector for a `break` targeting the construct `depth` levels out.
    pub fn breaking(depth: u16) -> Self {
        FlowSelector {
            kind: FlowKind::Break,
            depth,
        }
    }

    /// Constructs a selector for a `continue` targeting the construct `depth` levels out.
    pub fn continuing(depth: u16) -> Self {
        FlowSelector {
            kind: FlowKind::Continue,
            depth,
        }
    }

    /// The selector's kind.
    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    /// The selector's target depth (meaningful only for `Break`/`Continue`).
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Packs this selector into its `u32` register encoding: kind in the low byte, depth in the
    /// upper 16 bits.
    pub fn to_raw(self) -> u32 {
        (self.kind as u32) | ((self.depth as u32) << 16)
    }

    /// Unpacks a selector from its `u32` register encoding.
    pub fn from_raw(raw: u32) -> Self {
        let kind = match raw & 0xFF {
            0 => FlowKind::Return,
            1 => FlowKind::Throw,
            2 => FlowKind::Break,
            3 => FlowKind::Continue,
            _ => FlowKind::Normal,
        };
        FlowSelector {
            kind,
            depth: (raw >> 16) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw() {
        for sel in [
            FlowSelector::NORMAL,
            FlowSelector::returning(),
            FlowSelector::throwing(),
            FlowSelector::breaking(2),
            FlowSelector::continuing(3),
        ] {
            assert_eq!(FlowSelector::from_raw(sel.to_raw()), sel);
        }
    }

    #[test]
    fn depth_is_preserved_for_break() {
        let sel = FlowSelector::breaking(7);
        assert_eq!(sel.depth(), 7);
        assert_eq!(sel.kind(), FlowKind::Break);
    }
}
