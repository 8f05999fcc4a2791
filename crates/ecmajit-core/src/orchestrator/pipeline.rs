//! Backend-agnostic optimisation passes over [`IrFunction`], run before Cranelift lowering.
//!
//! Each pass implements [`OptPass`] and rewrites a function in place. None of these passes perform
//! full dominance analysis — like the reference pipeline they're modelled on, they trade soundness
//! in rare cross-branch cases for a single linear scan over `func.blocks`. `JitOptimizer` runs them
//! in a fixed order; later passes benefit from the canonical forms earlier ones establish (GVN
//! finds more duplicates after `reassociate` has canonicalised commutative operand order, and
//! `simplifycfg` gets more to prune after `mem2reg`/`instcombine` have turned live code into dead
//! `Move`s).

use rustc_hash::FxHashMap;

use crate::builder::ir::{BlockId, IrFunction, IrInstr, IrTerminator, LocalSlot, Reg};

/// An optimisation pass over one function's IR.
pub trait OptPass: Send + Sync {
    /// Name of this pass, used in diagnostics.
    fn name(&self) -> &str;
    /// Runs the pass, mutating `func` in place.
    fn run(&self, func: &mut IrFunction);
}

/// Runs a fixed sequence of passes.
pub struct JitOptimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl JitOptimizer {
    /// The default pipeline: mem2reg, instcombine, reassociate, GVN, simplifycfg.
    pub fn new() -> Self {
        JitOptimizer {
            passes: vec![
                Box::new(Mem2Reg),
                Box::new(InstCombine),
                Box::new(Reassociate),
                Box::new(Gvn),
                Box::new(SimplifyCfg),
            ],
        }
    }

    /// An optimizer with no passes, for tests that want to isolate one pass's effect.
    pub fn empty() -> Self {
        JitOptimizer { passes: Vec::new() }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, func: &mut IrFunction) {
        for pass in &self.passes {
            pass.run(func);
        }
    }
}

impl Default for JitOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== mem2reg =====

/// Promotes a local slot's `LoadLocal`s to direct register forwarding when the slot is written
/// by exactly one `StoreLocal` in the whole function — the common case for `const`/single-assign
/// `let` bindings, which is the bulk of what `FunctionBuilder` emits through `local_slot`. Slots
/// written from more than one site (loop-carried `let`, reassigned parameters aliased to a local)
/// are left as explicit memory traffic; promoting those soundly needs real dominance analysis,
/// which this pipeline does not do.
pub struct Mem2Reg;

impl OptPass for Mem2Reg {
    fn name(&self) -> &str {
        "mem2reg"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut store_count: FxHashMap<LocalSlot, u32> = FxHashMap::default();
        let mut store_value: FxHashMap<LocalSlot, Reg> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                if let IrInstr::StoreLocal { slot, value } = instr {
                    *store_count.entry(*slot).or_insert(0) += 1;
                    store_value.insert(*slot, *value);
                }
            }
        }

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                if let IrInstr::LoadLocal { dest, slot } = instr {
                    if store_count.get(slot) == Some(&1) {
                        let src = store_value[slot];
                        *instr = IrInstr::Move { dest: *dest, src };
                    }
                }
            }
        }
    }
}

// ===== instcombine =====

/// Folds cheap algebraic identities: `x + 0.0`, `x * 1.0`, `x * 0.0`, `x - 0.0`, and double boolean
/// negation (`BoolNot(BoolNot(x))`).
pub struct InstCombine;

impl OptPass for InstCombine {
    fn name(&self) -> &str {
        "instcombine"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut f64_consts: FxHashMap<Reg, f64> = FxHashMap::default();
        let mut bool_not_src: FxHashMap<Reg, Reg> = FxHashMap::default();
        for block in &func.blocks {
            for instr in &block.instrs {
                match instr {
                    IrInstr::ConstF64 { dest, value } => {
                        f64_consts.insert(*dest, *value);
                    }
                    IrInstr::BoolNot { dest, src } => {
                        bool_not_src.insert(*dest, *src);
                    }
                    _ => {}
                }
            }
        }

        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                let replacement = match instr {
                    IrInstr::FAdd { dest, lhs, rhs } => {
                        if f64_consts.get(rhs) == Some(&0.0) {
                            Some(IrInstr::Move { dest: *dest, src: *lhs })
                        } else if f64_consts.get(lhs) == Some(&0.0) {
                            Some(IrInstr::Move { dest: *dest, src: *rhs })
                        } else {
                            None
                        }
                    }
                    IrInstr::FSub { dest, lhs, rhs } => {
                        if f64_consts.get(rhs) == Some(&0.0) {
                            Some(IrInstr::Move { dest: *dest, src: *lhs })
                        } else {
                            None
                        }
                    }
                    IrInstr::FMul { dest, lhs, rhs } => {
                        if f64_consts.get(rhs) == Some(&1.0) || f64_consts.get(lhs) == Some(&1.0) {
                            let src = if f64_consts.get(rhs) == Some(&1.0) { *lhs } else { *rhs };
                            Some(IrInstr::Move { dest: *dest, src })
                        } else if f64_consts.get(rhs) == Some(&0.0) || f64_consts.get(lhs) == Some(&0.0) {
                            Some(IrInstr::ConstF64 { dest: *dest, value: 0.0 })
                        } else {
                            None
                        }
                    }
                    IrInstr::BoolNot { dest, src } => {
                        bool_not_src.get(src).map(|&inner| IrInstr::Move { dest: *dest, src: inner })
                    }
                    _ => None,
                };
                if let Some(new_instr) = replacement {
                    *instr = new_instr;
                }
            }
        }
    }
}

// ===== reassociate =====

/// Canonicalises commutative binary operands into ascending register order, so that two
/// occurrences of the same expression built from operands in opposite order (`a+b` and `b+a`)
/// present the same shape to the GVN pass that follows.
pub struct Reassociate;

impl OptPass for Reassociate {
    fn name(&self) -> &str {
        "reassociate"
    }

    fn run(&self, func: &mut IrFunction) {
        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                match instr {
                    IrInstr::FAdd { lhs, rhs, .. } | IrInstr::FMul { lhs, rhs, .. } => {
                        if lhs.0 > rhs.0 {
                            std::mem::swap(lhs, rhs);
                        }
                    }
                    IrInstr::NumEq { lhs, rhs, .. } | IrInstr::BoolEq { lhs, rhs, .. } => {
                        if lhs.0 > rhs.0 {
                            std::mem::swap(lhs, rhs);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

// ===== GVN =====

/// Deduplicates pure instructions that recompute an already-available value, across the whole
/// function (no dominance check — see the module doc comment). Side-effecting instructions
/// (`has_side_effects()`) are never candidates.
pub struct Gvn;

impl OptPass for Gvn {
    fn name(&self) -> &str {
        "gvn"
    }

    fn run(&self, func: &mut IrFunction) {
        let mut seen: FxHashMap<String, Reg> = FxHashMap::default();
        for block in &mut func.blocks {
            for instr in &mut block.instrs {
                if instr.has_side_effects() {
                    continue;
                }
                let Some(dest) = instr.dest() else { continue };
                let Some(key) = gvn_key(instr) else { continue };
                if let Some(&earlier) = seen.get(&key) {
                    *instr = IrInstr::Move { dest, src: earlier };
                } else {
                    seen.insert(key, dest);
                }
            }
        }
    }
}

fn gvn_key(instr: &IrInstr) -> Option<String> {
    use IrInstr::*;
    match instr {
        ConstBool { value, .. } => Some(format!("ConstBool:{value}")),
        ConstF64 { value, .. } => Some(format!("ConstF64:{}", value.to_bits())),
        ConstI32 { value, .. } => Some(format!("ConstI32:{value}")),
        ConstFunctionRef { func_id, .. } => Some(format!("ConstFunctionRef:{func_id}")),
        FAdd { lhs, rhs, .. } => Some(format!("FAdd:{}:{}", lhs.0, rhs.0)),
        FSub { lhs, rhs, .. } => Some(format!("FSub:{}:{}", lhs.0, rhs.0)),
        FMul { lhs, rhs, .. } => Some(format!("FMul:{}:{}", lhs.0, rhs.0)),
        FDiv { lhs, rhs, .. } => Some(format!("FDiv:{}:{}", lhs.0, rhs.0)),
        FCmp { op, lhs, rhs, .. } => Some(format!("FCmp:{op:?}:{}:{}", lhs.0, rhs.0)),
        NumEq { lhs, rhs, negate, .. } => Some(format!("NumEq:{}:{}:{negate}", lhs.0, rhs.0)),
        BoolEq { lhs, rhs, negate, .. } => Some(format!("BoolEq:{}:{}:{negate}", lhs.0, rhs.0)),
        ToBoolean { src, .. } => Some(format!("ToBoolean:{}", src.0)),
        ToNumeric { src, .. } => Some(format!("ToNumeric:{}", src.0)),
        _ => None,
    }
}

// ===== simplifycfg =====

/// Threads jump-only blocks (including the `Unreachable`-terminated blocks `seal_dead_code`
/// inserts after every `return`/`throw`/`break`/`continue`) and prunes whatever becomes
/// unreachable from the entry block, renumbering the surviving blocks to stay contiguous.
pub struct SimplifyCfg;

impl OptPass for SimplifyCfg {
    fn name(&self) -> &str {
        "simplifycfg"
    }

    fn run(&self, func: &mut IrFunction) {
        thread_trivial_jumps(func);
        prune_unreachable(func);
    }
}

fn thread_trivial_jumps(func: &mut IrFunction) {
    let mut forward: FxHashMap<u32, u32> = FxHashMap::default();
    for (idx, block) in func.blocks.iter().enumerate() {
        if block.instrs.is_empty() {
            if let Some(IrTerminator::Jump { target }) = &block.terminator {
                if target.0 != idx as u32 {
                    forward.insert(idx as u32, target.0);
                }
            }
        }
    }
    if forward.is_empty() {
        return;
    }

    let resolve = |mut id: u32| -> u32 {
        let mut steps = 0;
        while let Some(&next) = forward.get(&id) {
            id = next;
            steps += 1;
            if steps > forward.len() + 1 {
                break;
            }
        }
        id
    };

    for block in &mut func.blocks {
        retarget(&mut block.terminator, &resolve);
    }
    func.entry = BlockId(resolve(func.entry.0));
}

fn retarget(term: &mut Option<IrTerminator>, resolve: &impl Fn(u32) -> u32) {
    let Some(term) = term else { return };
    match term {
        IrTerminator::Jump { target } => target.0 = resolve(target.0),
        IrTerminator::Branch { then_block, else_block, .. } => {
            then_block.0 = resolve(then_block.0);
            else_block.0 = resolve(else_block.0);
        }
        IrTerminator::Switch { cases, default, .. } => {
            for (_, target) in cases.iter_mut() {
                target.0 = resolve(target.0);
            }
            default.0 = resolve(default.0);
        }
        IrTerminator::Return { .. } | IrTerminator::Unreachable => {}
    }
}

fn prune_unreachable(func: &mut IrFunction) {
    let mut reachable = vec![false; func.blocks.len()];
    reachable[func.entry.0 as usize] = true;
    let mut stack = vec![func.entry.0];
    while let Some(id) = stack.pop() {
        let mut visit = |target: u32| {
            if !reachable[target as usize] {
                reachable[target as usize] = true;
                stack.push(target);
            }
        };
        match &func.blocks[id as usize].terminator {
            Some(IrTerminator::Jump { target }) => visit(target.0),
            Some(IrTerminator::Branch { then_block, else_block, .. }) => {
                visit(then_block.0);
                visit(else_block.0);
            }
            Some(IrTerminator::Switch { cases, default, .. }) => {
                for (_, target) in cases {
                    visit(target.0);
                }
                visit(default.0);
            }
            _ => {}
        }
    }

    if reachable.iter().all(|&r| r) {
        return;
    }

    let mut remap: FxHashMap<u32, u32> = FxHashMap::default();
    let mut new_blocks = Vec::with_capacity(func.blocks.len());
    for (idx, block) in func.blocks.iter().enumerate() {
        if reachable[idx] {
            remap.insert(idx as u32, new_blocks.len() as u32);
            new_blocks.push(block.clone());
        }
    }
    for block in &mut new_blocks {
        let remapped = |id: u32| remap[&id];
        retarget(&mut block.terminator, &remapped);
    }
    func.entry = BlockId(remap[&func.entry.0]);
    func.blocks = new_blocks;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ir::IrType;

    #[test]
    fn mem2reg_promotes_single_assignment_slot() {
        let mut func = IrFunction::new(0, "f", 0);
        let entry = func.entry;
        let slot = func.alloc_slot();
        let value = func.alloc_reg(IrType::Any);
        let loaded = func.alloc_reg(IrType::Any);
        func.push(entry, IrInstr::AllocLocal { slot });
        func.push(entry, IrInstr::ConstUndefined { dest: value });
        func.push(entry, IrInstr::StoreLocal { slot, value });
        func.push(entry, IrInstr::LoadLocal { dest: loaded, slot });
        func.set_terminator(entry, IrTerminator::Return { status: loaded });

        Mem2Reg.run(&mut func);

        assert!(func.block(entry).instrs.iter().any(|i| matches!(i, IrInstr::Move { dest, src } if *dest == loaded && *src == value)));
    }

    #[test]
    fn instcombine_folds_add_zero() {
        let mut func = IrFunction::new(0, "f", 0);
        let entry = func.entry;
        let x = func.alloc_reg(IrType::F64);
        let zero = func.alloc_reg(IrType::F64);
        let sum = func.alloc_reg(IrType::F64);
        func.push(entry, IrInstr::ConstF64 { dest: zero, value: 0.0 });
        func.push(entry, IrInstr::FAdd { dest: sum, lhs: x, rhs: zero });
        func.set_terminator(entry, IrTerminator::Return { status: sum });

        InstCombine.run(&mut func);

        assert!(func.block(entry).instrs.iter().any(|i| matches!(i, IrInstr::Move { dest, src } if *dest == sum && *src == x)));
    }

    #[test]
    fn reassociate_orders_commutative_operands() {
        let mut func = IrFunction::new(0, "f", 0);
        let entry = func.entry;
        let lower_id = func.alloc_reg(IrType::F64);
        let higher_id = func.alloc_reg(IrType::F64);
        let dest = func.alloc_reg(IrType::F64);
        // lhs carries the higher-numbered register; the pass should swap it behind rhs.
        func.push(entry, IrInstr::FAdd { dest, lhs: higher_id, rhs: lower_id });
        func.set_terminator(entry, IrTerminator::Return { status: dest });

        Reassociate.run(&mut func);

        assert!(matches!(func.block(entry).instrs[0], IrInstr::FAdd { lhs, rhs, .. } if lhs.0 < rhs.0));
    }

    #[test]
    fn gvn_dedupes_identical_constants() {
        let mut func = IrFunction::new(0, "f", 0);
        let entry = func.entry;
        let a = func.alloc_reg(IrType::F64);
        let b = func.alloc_reg(IrType::F64);
        func.push(entry, IrInstr::ConstF64 { dest: a, value: 7.0 });
        func.push(entry, IrInstr::ConstF64 { dest: b, value: 7.0 });
        func.set_terminator(entry, IrTerminator::Return { status: b });

        Gvn.run(&mut func);

        assert!(matches!(func.block(entry).instrs[1], IrInstr::Move { dest, src } if dest == b && src == a));
    }

    #[test]
    fn simplifycfg_threads_and_prunes() {
        let mut func = IrFunction::new(0, "f", 0);
        let entry = func.entry;
        let forwarder = func.add_block();
        let real_target = func.add_block();
        let dead = func.add_block();

        func.set_terminator(entry, IrTerminator::Jump { target: forwarder });
        func.set_terminator(forwarder, IrTerminator::Jump { target: real_target });
        let r = func.alloc_reg(IrType::I32);
        func.push(real_target, IrInstr::ConstI32 { dest: r, value: 1 });
        func.set_terminator(real_target, IrTerminator::Return { status: r });
        func.set_terminator(dead, IrTerminator::Unreachable);

        SimplifyCfg.run(&mut func);

        // entry and the forwarder were both pure jump-throughs, and the dead block had no
        // predecessor at all, so only `real_target` survives, becoming the new entry.
        assert_eq!(func.blocks.len(), 1);
        assert!(matches!(func.block(func.entry).terminator, Some(IrTerminator::Return { .. })));
    }
}
