//! The language descriptor: static, process-wide, read-only-after-init
//! tables describing types, operators, and intrinsics. Shared immutably by
//! every [`crate::Context`]; no locks are needed since nothing here is ever
//! mutated after the first access builds it.

use bitflags::bitflags;

use super::value::Value;

/// The scalar kind of a type, independent of vector width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ScalarKind {
    Void = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    Double = 4,
    /// A per-lane boolean mask produced by vector comparisons.
    QBool = 5,
    Object = 6,
}

impl ScalarKind {
    /// Position in the implicit conversion lattice `bool ⊂ int ⊂ float ⊂
    /// double`; higher ranks are reachable from lower ones.
    pub fn rank(self) -> Option<u8> {
        match self {
            ScalarKind::Bool => Some(0),
            ScalarKind::Int => Some(1),
            ScalarKind::Float => Some(2),
            ScalarKind::Double => Some(3),
            _ => None,
        }
    }

    pub fn size_bytes(self) -> u32 {
        match self {
            ScalarKind::Void => 0,
            ScalarKind::Bool | ScalarKind::Int | ScalarKind::Float | ScalarKind::QBool => 4,
            ScalarKind::Double => 8,
            ScalarKind::Object => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Void => "void",
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::QBool => "qbool",
            ScalarKind::Object => "object",
        }
    }
}

/// Access mode for layout members and `@ret`. Not meaningful for ordinary
/// expression types (`None`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Access {
    #[default]
    None,
    ReadOnly,
    WriteOnly,
}

/// A fully resolved type: scalar kind, vector width (1 for scalars), and
/// access mode (only meaningful on layout members / `@ret`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type {
    pub scalar: ScalarKind,
    pub width: u8,
    pub access: Access,
}

impl Type {
    pub const VOID: Type = Type { scalar: ScalarKind::Void, width: 1, access: Access::None };
    pub const BOOL: Type = Type { scalar: ScalarKind::Bool, width: 1, access: Access::None };
    pub const INT: Type = Type { scalar: ScalarKind::Int, width: 1, access: Access::None };
    pub const FLOAT: Type = Type { scalar: ScalarKind::Float, width: 1, access: Access::None };
    pub const DOUBLE: Type = Type { scalar: ScalarKind::Double, width: 1, access: Access::None };

    pub fn new(scalar: ScalarKind, width: u8) -> Type {
        Type { scalar, width, access: Access::None }
    }

    pub fn with_access(self, access: Access) -> Type {
        Type { access, ..self }
    }

    pub fn is_vector(self) -> bool {
        self.width > 1
    }

    pub fn is_void(self) -> bool {
        self.scalar == ScalarKind::Void
    }

    /// Total size in bytes, rounded up to the vector's natural alignment
    /// (16 bytes for width >= 2, as spec.md §3 requires).
    pub fn size_bytes(self) -> u32 {
        self.scalar.size_bytes() * self.width as u32
    }

    pub fn align_bytes(self) -> u32 {
        if self.width >= 2 {
            16
        } else {
            self.scalar.size_bytes().max(1)
        }
    }

    /// `Vec128` if this type's total size fits in 16 bytes, `Vec256`
    /// otherwise (spec.md §4.6 / §9, "Vector-width class").
    pub fn width_class(self) -> VectorWidthClass {
        if self.size_bytes() <= 16 {
            VectorWidthClass::Vec128
        } else {
            VectorWidthClass::Vec256
        }
    }

    /// A scalar of the same kind, used when broadcasting or folding
    /// per-lane.
    pub fn scalar_of(self) -> Type {
        Type { width: 1, access: Access::None, ..self }
    }

    pub fn same_shape(self, other: Type) -> bool {
        self.scalar == other.scalar && self.width == other.width
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.width == 1 {
            write!(f, "{}", self.scalar.name())
        } else {
            write!(f, "{}{}", self.scalar.name(), self.width)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorWidthClass {
    Vec128,
    Vec256,
}

bitflags! {
    /// The FFI-facing packed representation of a [`Type`], used by
    /// `Layout::add_member` (spec.md §6 "Type flags").
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const SCALAR_MASK = 0x0000_000F;
        const VOID   = 0;
        const BOOL   = 1;
        const INT    = 2;
        const FLOAT  = 3;
        const DOUBLE = 4;
        const QBOOL  = 5;
        const OBJECT = 6;

        const VEC_MASK = 0x0000_0030;
        const VEC_2 = 1 << 4;
        const VEC_3 = 2 << 4;
        const VEC_4 = 3 << 4;

        const RO = 1 << 8;
        const WO = 1 << 9;
    }
}

impl TypeFlags {
    pub fn from_type(ty: Type) -> TypeFlags {
        let mut bits = match ty.scalar {
            ScalarKind::Void => TypeFlags::VOID,
            ScalarKind::Bool => TypeFlags::BOOL,
            ScalarKind::Int => TypeFlags::INT,
            ScalarKind::Float => TypeFlags::FLOAT,
            ScalarKind::Double => TypeFlags::DOUBLE,
            ScalarKind::QBool => TypeFlags::QBOOL,
            ScalarKind::Object => TypeFlags::OBJECT,
        };
        bits |= match ty.width {
            1 => TypeFlags::empty(),
            2 => TypeFlags::VEC_2,
            3 => TypeFlags::VEC_3,
            4 => TypeFlags::VEC_4,
            _ => TypeFlags::empty(),
        };
        bits |= match ty.access {
            Access::None => TypeFlags::empty(),
            Access::ReadOnly => TypeFlags::RO,
            Access::WriteOnly => TypeFlags::WO,
        };
        bits
    }

    pub fn to_type(self) -> Option<Type> {
        let scalar = match (self & TypeFlags::SCALAR_MASK).bits() {
            0 => ScalarKind::Void,
            1 => ScalarKind::Bool,
            2 => ScalarKind::Int,
            3 => ScalarKind::Float,
            4 => ScalarKind::Double,
            5 => ScalarKind::QBool,
            6 => ScalarKind::Object,
            _ => return None,
        };
        let width = match (self & TypeFlags::VEC_MASK).bits() >> 4 {
            0 => 1,
            1 => 2,
            2 => 3,
            3 => 4,
            _ => unreachable!(),
        };
        let access = if self.contains(TypeFlags::RO) {
            Access::ReadOnly
        } else if self.contains(TypeFlags::WO) {
            Access::WriteOnly
        } else {
            Access::None
        };
        Some(Type { scalar, width, access })
    }
}

/// Operator arity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
    Ternary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Neg,
    Pos,
    LogNot,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Assign,
}

#[derive(Clone, Copy, Debug)]
pub struct OperatorInfo {
    pub op: Op,
    pub arity: Arity,
    pub precedence: u8,
    pub assoc: Assoc,
    pub text: &'static str,
}

/// Binary/unary operator precedence table, highest number binds tightest
/// (standard C-like precedence, as spec.md §4.3/§6 describe).
pub const OPERATORS: &[OperatorInfo] = &[
    OperatorInfo { op: Op::Assign, arity: Arity::Binary, precedence: 1, assoc: Assoc::Right, text: "=" },
    OperatorInfo { op: Op::LogOr, arity: Arity::Binary, precedence: 2, assoc: Assoc::Left, text: "||" },
    OperatorInfo { op: Op::LogAnd, arity: Arity::Binary, precedence: 3, assoc: Assoc::Left, text: "&&" },
    OperatorInfo { op: Op::BitOr, arity: Arity::Binary, precedence: 4, assoc: Assoc::Left, text: "|" },
    OperatorInfo { op: Op::BitXor, arity: Arity::Binary, precedence: 5, assoc: Assoc::Left, text: "^" },
    OperatorInfo { op: Op::BitAnd, arity: Arity::Binary, precedence: 6, assoc: Assoc::Left, text: "&" },
    OperatorInfo { op: Op::Eq, arity: Arity::Binary, precedence: 7, assoc: Assoc::Left, text: "==" },
    OperatorInfo { op: Op::Ne, arity: Arity::Binary, precedence: 7, assoc: Assoc::Left, text: "!=" },
    OperatorInfo { op: Op::Lt, arity: Arity::Binary, precedence: 8, assoc: Assoc::Left, text: "<" },
    OperatorInfo { op: Op::Le, arity: Arity::Binary, precedence: 8, assoc: Assoc::Left, text: "<=" },
    OperatorInfo { op: Op::Gt, arity: Arity::Binary, precedence: 8, assoc: Assoc::Left, text: ">" },
    OperatorInfo { op: Op::Ge, arity: Arity::Binary, precedence: 8, assoc: Assoc::Left, text: ">=" },
    OperatorInfo { op: Op::Shl, arity: Arity::Binary, precedence: 9, assoc: Assoc::Left, text: "<<" },
    OperatorInfo { op: Op::Shr, arity: Arity::Binary, precedence: 9, assoc: Assoc::Left, text: ">>" },
    OperatorInfo { op: Op::Add, arity: Arity::Binary, precedence: 10, assoc: Assoc::Left, text: "+" },
    OperatorInfo { op: Op::Sub, arity: Arity::Binary, precedence: 10, assoc: Assoc::Left, text: "-" },
    OperatorInfo { op: Op::Mul, arity: Arity::Binary, precedence: 11, assoc: Assoc::Left, text: "*" },
    OperatorInfo { op: Op::Div, arity: Arity::Binary, precedence: 11, assoc: Assoc::Left, text: "/" },
    OperatorInfo { op: Op::Mod, arity: Arity::Binary, precedence: 11, assoc: Assoc::Left, text: "%" },
];

pub fn operator_info(op: Op) -> OperatorInfo {
    OPERATORS
        .iter()
        .find(|info| info.op == op)
        .copied()
        .unwrap_or(OperatorInfo { op, arity: Arity::Unary, precedence: 12, assoc: Assoc::Right, text: "?" })
}

/// A constant-fold hook for unary math intrinsics: applied per lane on the
/// `f64`-widened operand, result narrowed back to the intrinsic's declared
/// scalar kind.
pub type FoldFn = fn(f64) -> f64;

#[derive(Clone, Copy, Debug)]
pub struct IntrinsicInfo {
    pub name: &'static str,
    pub arity: usize,
    pub fold: Option<FoldFn>,
    /// True for the packed SIMD builtins (`vaddw`, `vmulw`, `vsrlw`, ...),
    /// which operate on raw `int` lanes rather than the float math domain
    /// and are not constant-folded here.
    pub packed: bool,
}

pub const INTRINSICS: &[IntrinsicInfo] = &[
    IntrinsicInfo { name: "sqrt", arity: 1, fold: Some(f64::sqrt), packed: false },
    IntrinsicInfo { name: "abs", arity: 1, fold: Some(f64::abs), packed: false },
    IntrinsicInfo { name: "floor", arity: 1, fold: Some(f64::floor), packed: false },
    IntrinsicInfo { name: "ceil", arity: 1, fold: Some(f64::ceil), packed: false },
    IntrinsicInfo { name: "round", arity: 1, fold: Some(f64::round), packed: false },
    IntrinsicInfo { name: "trunc", arity: 1, fold: Some(f64::trunc), packed: false },
    IntrinsicInfo { name: "exp", arity: 1, fold: Some(f64::exp), packed: false },
    IntrinsicInfo { name: "log", arity: 1, fold: Some(f64::ln), packed: false },
    IntrinsicInfo { name: "sin", arity: 1, fold: Some(f64::sin), packed: false },
    IntrinsicInfo { name: "cos", arity: 1, fold: Some(f64::cos), packed: false },
    IntrinsicInfo { name: "tan", arity: 1, fold: Some(f64::tan), packed: false },
    IntrinsicInfo { name: "min", arity: 2, fold: None, packed: false },
    IntrinsicInfo { name: "max", arity: 2, fold: None, packed: false },
    IntrinsicInfo { name: "pow", arity: 2, fold: None, packed: false },
    IntrinsicInfo { name: "vaddw", arity: 2, fold: None, packed: true },
    IntrinsicInfo { name: "vsubw", arity: 2, fold: None, packed: true },
    IntrinsicInfo { name: "vmulw", arity: 2, fold: None, packed: true },
    IntrinsicInfo { name: "vsrlw", arity: 2, fold: None, packed: true },
    IntrinsicInfo { name: "vsllw", arity: 2, fold: None, packed: true },
];

pub fn intrinsic_info(name: &str) -> Option<&'static IntrinsicInfo> {
    INTRINSICS.iter().find(|i| i.name == name)
}

/// Built-in scalar/vector type names recognized by the parser, e.g. `int`,
/// `int2`, `float4`.
pub fn parse_type_name(name: &str) -> Option<Type> {
    const BASES: &[(&str, ScalarKind)] = &[
        ("bool", ScalarKind::Bool),
        ("int", ScalarKind::Int),
        ("float", ScalarKind::Float),
        ("double", ScalarKind::Double),
    ];
    for &(base, kind) in BASES {
        if name == base {
            return Some(Type::new(kind, 1));
        }
        for w in [2u8, 3, 4] {
            if name == format!("{base}{w}") || name == format!("{base}_{w}") {
                return Some(Type::new(kind, w));
            }
        }
    }
    None
}

/// Reserved name of the write-only return slot.
pub const RET_NAME: &str = "@ret";

/// A literal `Value` paired with the [`Type`] it was folded/parsed as.
#[derive(Clone, Copy, Debug)]
pub struct TypedValue {
    pub ty: Type,
    pub value: Value,
}
