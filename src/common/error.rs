//! Error kinds returned by the compilation pipeline and by generated code.

use super::Position;

/// The 32-bit error code surfaced from a compile call or a `Program::run`
/// invocation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid compiler state")]
    InvalidState,

    #[error("compilation aborted by diagnostic sink")]
    AbortedByLog,

    #[error("recursion limit exceeded")]
    RecursionLimit,

    #[error("syntax error at {pos}: {message}")]
    SyntaxError { pos: Position, message: String },

    #[error("type error at {pos}: {message}")]
    TypeError { pos: Position, message: String },

    #[error("no symbol named `{name}` at {pos}")]
    NoSymbol { pos: Position, name: String },

    #[error("symbol `{name}` already declared at {pos}")]
    SymbolCollision { pos: Position, name: String },

    #[error("invalid type at {pos}: {message}")]
    InvalidType { pos: Position, message: String },

    #[error("invalid swizzle mask `{mask}` at {pos}")]
    InvalidSwizzle { pos: Position, mask: String },

    #[error("function `{name}` does not return a value on every path")]
    ReturnedNoValue { name: String },

    #[error("unreachable code at {pos}")]
    UnreachableCode { pos: Position },

    #[error("write-only field `{name}` read at {pos}")]
    WriteOnlyRead { pos: Position, name: String },

    #[error("read-only field `{name}` written at {pos}")]
    ReadOnlyWrite { pos: Position, name: String },

    #[error("JIT finalization failed: {message}")]
    JitFailed { message: String },
}

impl Error {
    /// Error kind as the stable 32-bit code returned from generated code /
    /// the embedding API. `Ok` is represented as `0` and is not a variant of
    /// this enum (it is `Result::Ok(())` at the Rust boundary).
    pub fn code(&self) -> i32 {
        use Error::*;
        match self {
            OutOfMemory => 1,
            InvalidArgument => 2,
            InvalidState => 3,
            AbortedByLog => 4,
            RecursionLimit => 5,
            SyntaxError { .. } => 6,
            TypeError { .. } => 7,
            NoSymbol { .. } => 8,
            SymbolCollision { .. } => 9,
            InvalidType { .. } => 10,
            InvalidSwizzle { .. } => 11,
            ReturnedNoValue { .. } => 12,
            UnreachableCode { .. } => 13,
            WriteOnlyRead { .. } => 14,
            ReadOnlyWrite { .. } => 15,
            JitFailed { .. } => 16,
        }
    }

    /// Fatal errors are never recovered from partway through a stage; the
    /// caller should treat the whole compile as unusable rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::OutOfMemory | Error::JitFailed { .. } | Error::InvalidState)
    }

    pub fn position(&self) -> Option<Position> {
        use Error::*;
        match self {
            SyntaxError { pos, .. }
            | TypeError { pos, .. }
            | NoSymbol { pos, .. }
            | SymbolCollision { pos, .. }
            | InvalidType { pos, .. }
            | InvalidSwizzle { pos, .. }
            | UnreachableCode { pos }
            | WriteOnlyRead { pos, .. }
            | ReadOnlyWrite { pos, .. } => Some(*pos),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
