//! The back end: virtual-register-to-x86 instruction selection, linear-scan
//! allocation, and `dynasmrt` code emission (spec.md §4.8).

pub mod asm;
pub mod codegen;
pub mod regalloc;

pub use asm::TargetFeatures;
pub use codegen::{compile, CompiledProgram};
