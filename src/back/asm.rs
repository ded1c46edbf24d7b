//! The "opaque assembler" capability spec.md §9's Design Notes describe:
//! typed virtual-register classes, a handful of runtime helper functions
//! the generated code can call out to, and CPU feature detection. The
//! actual instruction *emission* lives in [`super::codegen`]; this module
//! only holds the static facts codegen builds on, the way
//! `back::asm`/`Register` does in the RISC-V lineage this backend
//! generalizes to x86-64.

use crate::common::lang::TypeFlags;

/// CPU features the backend may use, either auto-detected from the host or
/// masked down by [`crate::program::CompileOptions`]'s `DISABLE_*` bits
/// (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetFeatures {
    pub sse4_1: bool,
    pub avx: bool,
    pub avx2: bool,
}

impl TargetFeatures {
    /// What this process's CPU actually supports.
    pub fn detect() -> TargetFeatures {
        TargetFeatures {
            sse4_1: std::is_x86_feature_detected!("sse4.1"),
            avx: std::is_x86_feature_detected!("avx"),
            avx2: std::is_x86_feature_detected!("avx2"),
        }
    }

    /// Apply `CompileOptions`'s disable bits on top of detected features.
    /// Disabling a narrower feature also disables anything built on it
    /// (no AVX2 without AVX).
    pub fn masked(self, disable_sse4_1: bool, disable_avx: bool, disable_avx2: bool) -> TargetFeatures {
        let sse4_1 = self.sse4_1 && !disable_sse4_1;
        let avx = self.avx && !disable_avx;
        let avx2 = self.avx2 && avx && !disable_avx2;
        TargetFeatures { sse4_1, avx, avx2 }
    }
}

/// The four general-purpose registers the linear-scan allocator may
/// dedicate to a virtual register for its entire lifetime. All four are
/// callee-saved in the SysV64 ABI, which is what lets a value live in one
/// of them across an internal `call` without being clobbered — every
/// compiled function (main's entry point included) saves and restores
/// whichever of these it actually uses, in its prologue/epilogue.
///
/// `rax`/`rcx`/`rdx` are reserved as scratch for instruction translation
/// (loading operands, holding shift counts); `rbp`/`rsp` are the frame;
/// `r12` is reserved process-wide as the caller-supplied `@args` base
/// pointer, live for the whole call tree (set once in `main`'s prologue,
/// never written again, so it never needs saving in callees that merely
/// read through it). The rest (`rsi`, `rdi`, `r8`-`r11`) are free for
/// register-class parameter passing between internal functions.
pub const GP_POOL: [dynasmrt::x64::Rq; 4] =
    [dynasmrt::x64::Rq::RBX, dynasmrt::x64::Rq::R13, dynasmrt::x64::Rq::R14, dynasmrt::x64::Rq::R15];

/// Reserved for the caller-supplied argument-block base pointer (spec.md
/// §6's calling convention), live across the whole call tree.
pub const ARGS_BASE: dynasmrt::x64::Rq = dynasmrt::x64::Rq::R12;

/// GP registers used as instruction-local scratch; never homes for a
/// virtual register.
pub const SCRATCH_A: dynasmrt::x64::Rq = dynasmrt::x64::Rq::RAX;
pub const SCRATCH_B: dynasmrt::x64::Rq = dynasmrt::x64::Rq::RCX;
pub const SCRATCH_C: dynasmrt::x64::Rq = dynasmrt::x64::Rq::RDX;

/// Integer-class parameter/argument registers for *internal* calls between
/// user-defined functions (spec.md §4.9's "ordinary native return" note).
/// This is our own convention, not the full SysV aggregate-passing rules;
/// it only has to agree with itself since internal calls never cross the
/// host boundary.
pub const GP_ARGS: [dynasmrt::x64::Rq; 6] = [
    dynasmrt::x64::Rq::RDI,
    dynasmrt::x64::Rq::RSI,
    dynasmrt::x64::Rq::R8,
    dynasmrt::x64::Rq::R9,
    dynasmrt::x64::Rq::R10,
    dynasmrt::x64::Rq::R11,
];

/// XMM scratch registers used to materialize an operand before an
/// instruction and to hold its result before spilling back to the home
/// stack slot. Xmm-class virtual registers are never given a dedicated
/// home register (see [`super::regalloc`]) since SysV64 has no
/// callee-saved XMM registers, so every Xmm-class value is stack-resident
/// between instructions.
pub const XMM_SCRATCH_0: u8 = 0;
pub const XMM_SCRATCH_1: u8 = 1;
pub const XMM_SCRATCH_2: u8 = 2;

/// Float/double/vector argument registers for internal calls, xmm0..xmm7.
pub const XMM_ARGS: [u8; 6] = [3, 4, 5, 6, 7, 8];

/// A runtime helper function the generated code calls out to for
/// transcendental math that has no direct x86 instruction (spec.md §6's
/// `pow`/`exp`/`log`/`sin`/`cos`/`tan`). These are ordinary Rust
/// `extern "C"` functions baked into this binary/library; codegen embeds
/// their address as an immediate and `call`s through a scratch register,
/// the same pattern JIT backends in this lineage use for runtime calls
/// (`_cflat_alloc`-style).
pub fn runtime_helper_addr(name: &str) -> Option<usize> {
    let f: usize = match name {
        "exp" => rt_exp as usize,
        "log" => rt_log as usize,
        "sin" => rt_sin as usize,
        "cos" => rt_cos as usize,
        "tan" => rt_tan as usize,
        "pow" => rt_pow as usize,
        _ => return None,
    };
    Some(f)
}

extern "C" fn rt_exp(x: f64) -> f64 {
    x.exp()
}
extern "C" fn rt_log(x: f64) -> f64 {
    x.ln()
}
extern "C" fn rt_sin(x: f64) -> f64 {
    x.sin()
}
extern "C" fn rt_cos(x: f64) -> f64 {
    x.cos()
}
extern "C" fn rt_tan(x: f64) -> f64 {
    x.tan()
}
extern "C" fn rt_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

/// Type flags round-trip check used by [`super::codegen`] when validating a
/// `Layout` member against the backend's register-class mapping; kept here
/// since it is a fact about the type<->register-class relationship this
/// module owns.
pub fn is_gp_class(ty: crate::common::lang::Type) -> bool {
    use crate::common::lang::ScalarKind;
    ty.width == 1 && matches!(ty.scalar, ScalarKind::Bool | ScalarKind::Int | ScalarKind::QBool)
}

#[allow(dead_code)]
pub fn describe(flags: TypeFlags) -> String {
    format!("{flags:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avx2_implies_avx_after_masking() {
        let f = TargetFeatures { sse4_1: true, avx: true, avx2: true };
        let masked = f.masked(false, true, false);
        assert!(!masked.avx);
        assert!(!masked.avx2);
    }

    #[test]
    fn runtime_helpers_cover_transcendental_intrinsics() {
        for name in ["exp", "log", "sin", "cos", "tan", "pow"] {
            assert!(runtime_helper_addr(name).is_some());
        }
        assert!(runtime_helper_addr("sqrt").is_none());
    }
}
