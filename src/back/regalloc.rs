//! A linear-scan register allocator over the small pool of callee-saved GP
//! registers in [`super::asm::GP_POOL`] (spec.md §4.8 delegates "register
//! allocation and spilling" to the assembler; `dynasmrt` is a pure emitter
//! and does none of this itself, so codegen owns a small pass, per
//! `SPEC_FULL.md` §4.8).
//!
//! Live ranges are computed over a linear instruction stream: the
//! function's blocks, visited in their existing `Vec` order (already
//! control-flow order from lowering — entry first, then each block in the
//! order it was created), are numbered consecutively including their
//! terminator. This is the classic Poletto & Sarkar approximation: treating
//! a reducible CFG's natural block order as if it were straight-line code
//! is conservative (a register assigned across a loop body is correctly
//! reserved for every iteration, since the defining instruction executes
//! once per the *static* order) and never less safe than true liveness,
//! only occasionally pessimistic about when a register frees up.
//!
//! Xmm-class virtual registers (scalar float/double and every vector,
//! spec.md §4.8's register-class mapping) are never assigned a dedicated
//! register: SysV64 has no callee-saved XMM registers, and values must
//! survive internal `call`s, so they are always homed to a stack slot.
//! Only GP-class virtuals (bool/int/qbool scalars) compete for
//! [`super::asm::GP_POOL`].

use std::collections::HashMap;

use crate::common::lang::Type;
use crate::middle::tir::{IRFunction, IRObject, SlotId, VReg};

use super::asm::{is_gp_class, GP_POOL};

/// Where a virtual register lives for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loc {
    /// Index into [`super::asm::GP_POOL`].
    GpReg(usize),
    /// Byte offset from `rbp` (negative; `rbp - offset` is the slot's
    /// address), 16-byte aligned, sized to the vreg/local's type (32 bytes
    /// for width-3/4 `double`).
    Spill(i32),
}

#[derive(Debug)]
pub struct Allocation {
    pub vreg_loc: Vec<Loc>,
    pub local_off: Vec<i32>,
    /// Scratch slot used to materialize wide/vector immediates
    /// byte-by-byte before loading them into an XMM register (spec.md
    /// §4.8's "moves/casts" category has no direct imm-into-xmm x86 form).
    pub imm_scratch_off: i32,
    /// Total bytes to `sub rsp` by in the prologue, 16-byte aligned on its
    /// own (the prologue adds any padding needed for the callee-saved
    /// pushes that precede it).
    pub frame_bytes: i32,
    /// Which [`super::asm::GP_POOL`] entries this function actually uses
    /// and must therefore save/restore in its prologue/epilogue.
    pub used_gp_pool: Vec<usize>,
}

fn slot_size(ty: Type) -> i32 {
    let bytes = ty.size_bytes().max(1);
    (((bytes + 15) / 16) * 16) as i32
}

struct Range {
    start: u32,
    end: u32,
}

/// Number every instruction (and terminator) in `func`'s block order,
/// recording each vreg's `[first def, last use]` span. A vreg that is
/// defined but never used gets a zero-length range at its definition
/// point (still needs a home to be written to, even if dead code removed
/// everything that would have read it before this pass ran).
fn compute_ranges(func: &IRFunction) -> HashMap<VReg, Range> {
    let mut ranges: HashMap<VReg, Range> = HashMap::new();
    let mut pos: u32 = 0;
    let mut touch_def = |ranges: &mut HashMap<VReg, Range>, r: VReg, pos: u32| {
        ranges.entry(r).or_insert(Range { start: pos, end: pos });
    };
    let mut touch_use = |ranges: &mut HashMap<VReg, Range>, obj: &IRObject, pos: u32| {
        if let IRObject::Var(r) = obj {
            let e = ranges.entry(*r).or_insert(Range { start: pos, end: pos });
            e.end = e.end.max(pos);
        }
    };
    for block in &func.blocks {
        for inst in &block.insts {
            for r in inst.results() {
                touch_def(&mut ranges, r, pos);
            }
            inst.for_each_operand(|o| touch_use(&mut ranges, o, pos));
            pos += 1;
        }
        if let Some(term) = &block.term {
            term.for_each_operand(|o| touch_use(&mut ranges, o, pos));
            pos += 1;
        }
    }
    ranges
}

/// Greedy linear scan: process vregs in order of first definition, hand
/// out free pool registers, and when the pool is empty spill whichever
/// active register's range ends furthest in the future (the one least
/// likely to free up soon) — the standard Poletto & Sarkar heuristic.
pub fn allocate(func: &IRFunction) -> Allocation {
    let ranges = compute_ranges(func);
    let mut order: Vec<(VReg, Range)> = ranges.into_iter().collect();
    order.sort_by_key(|(_, r)| r.start);

    struct Active {
        vreg: VReg,
        end: u32,
        pool_idx: usize,
    }
    let mut active: Vec<Active> = Vec::new();
    let mut free_pool: Vec<usize> = (0..GP_POOL.len()).rev().collect();
    let mut used_gp_pool: Vec<usize> = Vec::new();

    let mut vreg_loc: Vec<Loc> = vec![Loc::Spill(0); func.num_vregs() as usize];
    let mut next_spill_off: i32 = 0;
    let mut alloc_spill = |size: i32, next_spill_off: &mut i32| -> i32 {
        *next_spill_off += size;
        *next_spill_off
    };

    for (vreg, range) in &order {
        active.retain(|a| {
            if a.end < range.start {
                free_pool.push(a.pool_idx);
                false
            } else {
                true
            }
        });

        let ty = func.vreg_type(*vreg);
        if !is_gp_class(ty) {
            let off = alloc_spill(slot_size(ty), &mut next_spill_off);
            vreg_loc[vreg.0 as usize] = Loc::Spill(off);
            continue;
        }

        if let Some(pool_idx) = free_pool.pop() {
            vreg_loc[vreg.0 as usize] = Loc::GpReg(pool_idx);
            if !used_gp_pool.contains(&pool_idx) {
                used_gp_pool.push(pool_idx);
            }
            active.push(Active { vreg: *vreg, end: range.end, pool_idx });
        } else {
            // Spill the active register whose range extends furthest;
            // if ours extends further than all active ranges, spill
            // ourselves instead (no benefit to evicting).
            let farthest = active.iter().enumerate().max_by_key(|(_, a)| a.end);
            match farthest {
                Some((idx, a)) if a.end > range.end => {
                    let pool_idx = a.pool_idx;
                    let evicted = a.vreg;
                    active.remove(idx);
                    let evicted_ty = func.vreg_type(evicted);
                    let off = alloc_spill(slot_size(evicted_ty), &mut next_spill_off);
                    vreg_loc[evicted.0 as usize] = Loc::Spill(off);
                    vreg_loc[vreg.0 as usize] = Loc::GpReg(pool_idx);
                    active.push(Active { vreg: *vreg, end: range.end, pool_idx });
                }
                _ => {
                    let off = alloc_spill(slot_size(ty), &mut next_spill_off);
                    vreg_loc[vreg.0 as usize] = Loc::Spill(off);
                }
            }
        }
    }

    let mut local_off: Vec<i32> = Vec::with_capacity(func.num_locals() as usize);
    for slot in 0..func.num_locals() {
        let ty = func.local_type(SlotId(slot));
        let off = alloc_spill(slot_size(ty), &mut next_spill_off);
        local_off.push(off);
    }

    let imm_scratch_off = alloc_spill(32, &mut next_spill_off);

    let frame_bytes = (((next_spill_off + 15) / 16) * 16).max(16);
    Allocation { vreg_loc, local_off, imm_scratch_off, frame_bytes, used_gp_pool }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::lang::{Op, Type};
    use crate::middle::tir::{IRInst, IRTerm};

    #[test]
    fn non_overlapping_gp_vregs_share_a_register() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        let v0 = f.new_vreg(Type::INT);
        let v1 = f.new_vreg(Type::INT);
        // v0's only use is immediately after its def; v1 is defined after
        // v0's last use, so their ranges don't overlap.
        f.block_mut(b).insts.push(IRInst::Move { dst: v0, ty: Type::INT, src: IRObject::Imm(tv(1)) });
        f.block_mut(b).insts.push(IRInst::Move { dst: v1, ty: Type::INT, src: IRObject::Var(v0) });
        let v2 = f.new_vreg(Type::INT);
        f.block_mut(b).insts.push(IRInst::Move { dst: v2, ty: Type::INT, src: IRObject::Var(v1) });
        f.block_mut(b).term = Some(IRTerm::Return);

        let alloc = allocate(&f);
        assert!(matches!(alloc.vreg_loc[v0.0 as usize], Loc::GpReg(_)));
    }

    #[test]
    fn xmm_class_vregs_are_always_spilled() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        let v0 = f.new_vreg(Type::FLOAT);
        f.block_mut(b).insts.push(IRInst::Move { dst: v0, ty: Type::FLOAT, src: IRObject::Imm(tv(1)) });
        f.block_mut(b).term = Some(IRTerm::Return);
        let alloc = allocate(&f);
        assert!(matches!(alloc.vreg_loc[v0.0 as usize], Loc::Spill(_)));
    }

    #[test]
    fn overflowing_the_pool_spills_something() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        let mut vregs = Vec::new();
        for _ in 0..8 {
            let v = f.new_vreg(Type::INT);
            f.block_mut(b).insts.push(IRInst::Move { dst: v, ty: Type::INT, src: IRObject::Imm(tv(1)) });
            vregs.push(v);
        }
        // Keep all 8 alive simultaneously by using them all in one final
        // instruction's operand list (a fake multi-use via repeated Adds).
        for w in vregs.windows(2) {
            let dst = f.new_vreg(Type::INT);
            f.block_mut(b).insts.push(IRInst::BinOp {
                dst,
                op: Op::Add,
                ty: Type::INT,
                lhs: IRObject::Var(w[0]),
                rhs: IRObject::Var(w[1]),
            });
        }
        f.block_mut(b).term = Some(IRTerm::Return);
        let alloc = allocate(&f);
        let spilled = alloc.vreg_loc.iter().filter(|l| matches!(l, Loc::Spill(_))).count();
        assert!(spilled > 0, "8 overlapping GP vregs must exceed the 4-register pool");
    }

    fn tv(i: i32) -> crate::common::lang::TypedValue {
        crate::common::lang::TypedValue { ty: Type::INT, value: crate::common::value::Value::from_i32(i) }
    }
}
