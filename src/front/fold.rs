//! The AST constant folder. Runs after semantic analysis (so every node is
//! typed and every implicit conversion has an explicit `Cast`), folding
//! literal-only `Cast`/`Unary`/`Binary` subtrees in place and applying a
//! small set of algebraic identities that are safe for both the integer and
//! IEEE-754 floating-point domains.
//!
//! Integer arithmetic wraps on overflow (32-bit two's complement, matching
//! the runtime's own semantics); float/double arithmetic uses the host's
//! native round-to-nearest-even `f32`/`f64` operators, so folding never
//! changes a program's observable result versus running it unfolded.

use crate::common::error::Error;
use crate::common::lang::{Op, ScalarKind, Type};

use super::ast::{Ast, NodeId, NodeKind};

/// Folding repeats to a fixed point (an identity rewrite can expose a new
/// foldable subtree one level up) but is capped to bound compile time on
/// pathological inputs.
pub const MAX_FOLD_ITERATIONS: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Lit {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
}

pub fn fold(ast: &mut Ast) -> Result<(), Error> {
    let Some(root) = ast.root else { return Ok(()) };
    for _ in 0..MAX_FOLD_ITERATIONS {
        let mut changed = false;
        fold_node(ast, root, &mut changed)?;
        if !changed {
            break;
        }
    }
    Ok(())
}

fn literal_of(ast: &Ast, id: NodeId) -> Option<Lit> {
    match &ast.get(id).kind {
        NodeKind::ImmBool(v) => Some(Lit::Bool(*v)),
        NodeKind::ImmInt(v) => Some(Lit::Int(*v)),
        NodeKind::ImmFloat(v) => Some(Lit::Float(*v)),
        NodeKind::ImmDouble(v) => Some(Lit::Double(*v)),
        _ => None,
    }
}

fn set_literal(ast: &mut Ast, id: NodeId, lit: Lit) {
    let kind = match lit {
        Lit::Bool(v) => NodeKind::ImmBool(v),
        Lit::Int(v) => NodeKind::ImmInt(v),
        Lit::Float(v) => NodeKind::ImmFloat(v),
        Lit::Double(v) => NodeKind::ImmDouble(v),
    };
    ast.get_mut(id).kind = kind;
}

fn as_f64(lit: Lit) -> f64 {
    match lit {
        Lit::Bool(v) => v as i32 as f64,
        Lit::Int(v) => v as f64,
        Lit::Float(v) => v as f64,
        Lit::Double(v) => v,
    }
}

fn cast_literal(lit: Lit, target: ScalarKind) -> Lit {
    match target {
        ScalarKind::Bool => Lit::Bool(as_f64(lit) != 0.0),
        ScalarKind::Int => Lit::Int(match lit {
            Lit::Bool(v) => v as i32,
            Lit::Int(v) => v,
            Lit::Float(v) => v as i32,
            Lit::Double(v) => v as i32,
        }),
        ScalarKind::Float => Lit::Float(match lit {
            Lit::Bool(v) => v as i32 as f32,
            Lit::Int(v) => v as f32,
            Lit::Float(v) => v,
            Lit::Double(v) => v as f32,
        }),
        ScalarKind::Double => Lit::Double(as_f64(lit)),
        _ => lit,
    }
}

fn fold_node(ast: &mut Ast, id: NodeId, changed: &mut bool) -> Result<(), Error> {
    for child in ast.children_of(id) {
        fold_node(ast, child, changed)?;
    }
    let pos = ast.get(id).pos;
    let ty = ast.get(id).ty;
    match &ast.get(id).kind {
        NodeKind::Cast { operand } => {
            let operand = *operand;
            if let Some(lit) = literal_of(ast, operand) {
                set_literal(ast, id, cast_literal(lit, ty.scalar));
                *changed = true;
            }
        }
        NodeKind::Unary { op, operand, .. } => {
            let (op, operand) = (*op, *operand);
            if matches!(op, Op::PreInc | Op::PreDec | Op::PostInc | Op::PostDec) {
                return Ok(());
            }
            if let Some(lit) = literal_of(ast, operand) {
                if let Some(folded) = fold_unary(op, lit) {
                    set_literal(ast, id, folded);
                    *changed = true;
                }
            }
        }
        NodeKind::Binary { op, lhs, rhs } => {
            let (op, lhs, rhs) = (*op, *lhs, *rhs);
            if op == Op::Assign {
                return Ok(());
            }
            let lv = literal_of(ast, lhs);
            let rv = literal_of(ast, rhs);
            if let (Some(l), Some(r)) = (lv, rv) {
                if let Some(folded) = fold_binary(op, l, r, pos)? {
                    set_literal(ast, id, folded);
                    *changed = true;
                    return Ok(());
                }
            }
            if let Some(identity) = algebraic_identity(ast, op, lhs, rhs, lv, rv) {
                let kind = std::mem::replace(&mut ast.get_mut(identity).kind, NodeKind::Break);
                ast.get_mut(id).kind = kind;
                ast.set_type(id, ast.get(identity).ty);
                *changed = true;
            }
        }
        _ => {}
    }
    Ok(())
}

fn fold_unary(op: Op, v: Lit) -> Option<Lit> {
    Some(match (op, v) {
        (Op::Neg, Lit::Int(v)) => Lit::Int(v.wrapping_neg()),
        (Op::Neg, Lit::Float(v)) => Lit::Float(-v),
        (Op::Neg, Lit::Double(v)) => Lit::Double(-v),
        (Op::Pos, v) => v,
        (Op::LogNot, Lit::Bool(v)) => Lit::Bool(!v),
        (Op::BitNot, Lit::Int(v)) => Lit::Int(!v),
        _ => return None,
    })
}

fn fold_binary(op: Op, l: Lit, r: Lit, pos: crate::common::Position) -> Result<Option<Lit>, Error> {
    use Lit::*;
    Ok(Some(match (op, l, r) {
        (Op::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
        (Op::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
        (Op::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
        (Op::Div, Int(_), Int(0)) => {
            return Err(Error::TypeError { pos, message: "division by zero in constant expression".into() })
        }
        (Op::Div, Int(a), Int(b)) => Int(a.wrapping_div(b)),
        (Op::Mod, Int(_), Int(0)) => {
            return Err(Error::TypeError { pos, message: "modulo by zero in constant expression".into() })
        }
        (Op::Mod, Int(a), Int(b)) => Int(a.wrapping_rem(b)),
        (Op::BitAnd, Int(a), Int(b)) => Int(a & b),
        (Op::BitOr, Int(a), Int(b)) => Int(a | b),
        (Op::BitXor, Int(a), Int(b)) => Int(a ^ b),
        (Op::Shl, Int(a), Int(b)) => Int(a.wrapping_shl(b as u32 & 31)),
        (Op::Shr, Int(a), Int(b)) => Int(a.wrapping_shr(b as u32 & 31)),

        (Op::Add, Float(a), Float(b)) => Float(a + b),
        (Op::Sub, Float(a), Float(b)) => Float(a - b),
        (Op::Mul, Float(a), Float(b)) => Float(a * b),
        (Op::Div, Float(a), Float(b)) => Float(a / b),

        (Op::Add, Double(a), Double(b)) => Double(a + b),
        (Op::Sub, Double(a), Double(b)) => Double(a - b),
        (Op::Mul, Double(a), Double(b)) => Double(a * b),
        (Op::Div, Double(a), Double(b)) => Double(a / b),

        (Op::LogAnd, Bool(a), Bool(b)) => Bool(a && b),
        (Op::LogOr, Bool(a), Bool(b)) => Bool(a || b),

        (Op::Lt, a, b) => Bool(as_f64(a) < as_f64(b)),
        (Op::Le, a, b) => Bool(as_f64(a) <= as_f64(b)),
        (Op::Gt, a, b) => Bool(as_f64(a) > as_f64(b)),
        (Op::Ge, a, b) => Bool(as_f64(a) >= as_f64(b)),
        (Op::Eq, a, b) => Bool(as_f64(a) == as_f64(b)),
        (Op::Ne, a, b) => Bool(as_f64(a) != as_f64(b)),
        _ => return Ok(None),
    }))
}

/// Identities safe regardless of which operand is the still-unfolded one.
/// Integer identities include the zero-absorbing `x * 0` case; float/double
/// do not, since `0 * NaN` and `0 * inf` are `NaN`, not `0`.
fn is_int_zero(l: Option<Lit>) -> bool {
    matches!(l, Some(Lit::Int(0)))
}

fn is_num_one(l: Option<Lit>) -> bool {
    match l {
        Some(Lit::Int(1)) => true,
        Some(Lit::Float(f)) => f == 1.0,
        Some(Lit::Double(d)) => d == 1.0,
        _ => false,
    }
}

fn algebraic_identity(
    ast: &Ast,
    op: Op,
    lhs: NodeId,
    rhs: NodeId,
    lv: Option<Lit>,
    rv: Option<Lit>,
) -> Option<NodeId> {
    let _ = ast;
    match op {
        Op::Add if is_int_zero(rv) => Some(lhs),
        Op::Add if is_int_zero(lv) => Some(rhs),
        Op::Sub if is_int_zero(rv) => Some(lhs),
        Op::Mul if is_int_zero(rv) => Some(rhs),
        Op::Mul if is_int_zero(lv) => Some(lhs),
        Op::Mul if is_num_one(rv) => Some(lhs),
        Op::Mul if is_num_one(lv) => Some(rhs),
        Op::Div if is_num_one(rv) => Some(lhs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::lang::Access;
    use crate::layout::Layout;

    fn folded(src: &str, ret_ty: Type) -> Ast {
        let mut ast = super::super::parse(src).unwrap();
        let layout = Layout::new();
        super::super::sema::analyze(&mut ast, &layout, ret_ty).unwrap();
        fold(&mut ast).unwrap();
        ast
    }

    #[test]
    fn folds_integer_arithmetic_with_wraparound() {
        let ast = folded("int main() { return 2147483647 + 1; }", Type::INT);
        let ret = match &ast.get(ast.root.unwrap()).kind {
            NodeKind::Program { functions, .. } => *functions.last().unwrap(),
            _ => unreachable!(),
        };
        let body = match &ast.get(ret).kind {
            NodeKind::Function { body, .. } => *body,
            _ => unreachable!(),
        };
        let stmt = match &ast.get(body).kind {
            NodeKind::Block { stmts } => stmts[0],
            _ => unreachable!(),
        };
        match &ast.get(stmt).kind {
            NodeKind::Return { value } => {
                assert!(matches!(ast.get(value.unwrap()).kind, NodeKind::ImmInt(i32::MIN)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn rejects_literal_division_by_zero() {
        let mut ast = super::super::parse("int main() { return 1 / 0; }").unwrap();
        let layout = Layout::new();
        super::super::sema::analyze(&mut ast, &layout, Type::INT).unwrap();
        assert!(fold(&mut ast).is_err());
    }

    #[test]
    fn does_not_apply_zero_multiply_identity_to_floats() {
        // float main() { return 0.0f * x; } with x read-only float must not
        // fold to a literal 0 (x could be NaN or infinite).
        let mut layout = Layout::new();
        layout.add_member("x", Type::FLOAT.with_access(Access::ReadOnly), 0).unwrap();
        let mut ast = super::super::parse("float main() { return 0.0f * x; }").unwrap();
        super::super::sema::analyze(&mut ast, &layout, Type::FLOAT).unwrap();
        fold(&mut ast).unwrap();
        let root = ast.root.unwrap();
        let f = match &ast.get(root).kind {
            NodeKind::Program { functions, .. } => functions[0],
            _ => unreachable!(),
        };
        let body = match &ast.get(f).kind {
            NodeKind::Function { body, .. } => *body,
            _ => unreachable!(),
        };
        let stmt = match &ast.get(body).kind {
            NodeKind::Block { stmts } => stmts[0],
            _ => unreachable!(),
        };
        let value = match &ast.get(stmt).kind {
            NodeKind::Return { value } => value.unwrap(),
            _ => unreachable!(),
        };
        assert!(matches!(ast.get(value).kind, NodeKind::Binary { op: Op::Mul, .. }));
    }
}
