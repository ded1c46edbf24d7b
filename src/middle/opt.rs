//! The IR dead-code elimination pass.
//!
//! Works backward from a use-count table computed fresh each round: an
//! instruction is only removed once *every* register it defines has a use
//! count of zero (spec.md's Open Question on partial-result liveness) and
//! it is [`IRInst::is_pure`]. Removing an instruction can drop the use
//! count of its own operands to zero, so the pass repeats to a fixed point.

use std::collections::HashMap;

use super::tir::{IRFunction, IRObject, VReg};

fn compute_use_counts(func: &IRFunction) -> HashMap<VReg, u32> {
    let mut counts = HashMap::new();
    let mut bump = |obj: &IRObject| {
        if let IRObject::Var(r) = obj {
            *counts.entry(*r).or_insert(0) += 1;
        }
    };
    for block in &func.blocks {
        for inst in &block.insts {
            inst.for_each_operand(&mut bump);
        }
        if let Some(term) = &block.term {
            term.for_each_operand(&mut bump);
        }
    }
    counts
}

/// Run the pass to a fixed point, returning the number of instructions
/// removed (useful for diagnostics/tests).
pub fn eliminate_dead_code(func: &mut IRFunction) -> usize {
    let mut removed = 0;
    loop {
        let counts = compute_use_counts(func);
        let mut changed = false;
        for block in &mut func.blocks {
            let before = block.insts.len();
            block.insts.retain(|inst| {
                if !inst.is_pure() {
                    return true;
                }
                let results = inst.results();
                if results.is_empty() {
                    return true;
                }
                let all_unused = results.iter().all(|r| counts.get(r).copied().unwrap_or(0) == 0);
                !all_unused
            });
            if block.insts.len() != before {
                changed = true;
                removed += before - block.insts.len();
            }
        }
        if !changed {
            break;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::lang::{Op, Type};
    use crate::middle::tir::{CallTarget, IRInst, IRTerm, MemBase, MemRef};

    #[test]
    fn removes_unused_pure_instruction() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        let v0 = f.new_vreg(Type::INT);
        let v1 = f.new_vreg(Type::INT);
        f.block_mut(b).insts.push(IRInst::UnOp {
            dst: v0,
            op: Op::Neg,
            ty: Type::INT,
            operand: IRObject::Imm(crate::common::lang::TypedValue {
                ty: Type::INT,
                value: crate::common::value::Value::from_i32(1),
            }),
        });
        f.block_mut(b).insts.push(IRInst::Move {
            dst: v1,
            ty: Type::INT,
            src: IRObject::Imm(crate::common::lang::TypedValue {
                ty: Type::INT,
                value: crate::common::value::Value::from_i32(2),
            }),
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        // v0 is never read anywhere; v1 likewise. Both should be removed.
        let removed = eliminate_dead_code(&mut f);
        assert_eq!(removed, 2);
        assert!(f.block(b).insts.is_empty());
    }

    #[test]
    fn keeps_store_even_when_unread() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        f.block_mut(b).insts.push(IRInst::Store {
            mem: MemRef { base: MemBase::Ret, offset: 0, ty: Type::INT },
            value: IRObject::Imm(crate::common::lang::TypedValue {
                ty: Type::INT,
                value: crate::common::value::Value::from_i32(7),
            }),
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        eliminate_dead_code(&mut f);
        assert_eq!(f.block(b).insts.len(), 1);
    }

    #[test]
    fn keeps_call_even_when_unread() {
        // `double main() { sqrt(a); return b; }`: the `sqrt` call's result
        // is never read, but a call is never eligible for removal.
        let mut f = IRFunction::default();
        let b = f.new_block();
        let v0 = f.new_vreg(Type::DOUBLE);
        f.block_mut(b).insts.push(IRInst::Call {
            dst: Some(v0),
            ty: Type::DOUBLE,
            target: CallTarget::Intrinsic("sqrt"),
            args: vec![IRObject::Imm(crate::common::lang::TypedValue {
                ty: Type::DOUBLE,
                value: crate::common::value::Value::from_f64(2.0),
            })],
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        let removed = eliminate_dead_code(&mut f);
        assert_eq!(removed, 0);
        assert_eq!(f.block(b).insts.len(), 1);
    }

    #[test]
    fn keeps_instruction_whose_result_is_used() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        let v0 = f.new_vreg(Type::INT);
        f.block_mut(b).insts.push(IRInst::Move {
            dst: v0,
            ty: Type::INT,
            src: IRObject::Imm(crate::common::lang::TypedValue {
                ty: Type::INT,
                value: crate::common::value::Value::from_i32(1),
            }),
        });
        f.block_mut(b).insts.push(IRInst::Store {
            mem: MemRef { base: MemBase::Ret, offset: 0, ty: Type::INT },
            value: IRObject::Var(v0),
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        eliminate_dead_code(&mut f);
        assert_eq!(f.block(b).insts.len(), 2);
    }
}
