//! The top-level compile/run facade (spec.md §4.9): orchestrates every
//! pipeline stage in order, emitting the debug dumps [`CompileOptions`]
//! selects, and owns the resulting callable machine code.

use std::sync::Arc;

use bitflags::bitflags;

use crate::back::{self, CompiledProgram};
use crate::common::diag::{Category, Message, OutputLog};
use crate::common::error::{Error, Result};
use crate::common::lang::Type;
use crate::context::Context;
use crate::front::ast::{Ast, NodeKind};
use crate::front::{fold, lower, parse, sema};
use crate::layout::Layout;
use crate::middle::opt;

bitflags! {
    /// Verbosity/debug-dump selection plus CPU feature disable bits
    /// (spec.md §6 "Options bitflags"). Unknown bits are ignored: callers
    /// build this with [`CompileOptions::from_bits_truncate`] rather than
    /// the panicking `from_bits`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CompileOptions: u32 {
        const VERBOSE         = 1 << 0;
        const DEBUG_AST       = 1 << 1;
        const DEBUG_IR        = 1 << 2;
        const DEBUG_ASM       = 1 << 3;
        const DISABLE_SSE4_1  = 1 << 4;
        const DISABLE_AVX     = 1 << 5;
        const DISABLE_AVX2    = 1 << 6;
    }
}

/// A compiled program: a callable function plus the resources that keep it
/// alive (spec.md §3/§4.9). Holds a strong reference to the compiling
/// [`Context`] so the backend's detected feature set and interned-string
/// pool outlive every `Program` built from it. Reference-counted via `Arc`
/// rather than a hand-rolled count, since the code buffer's only owner past
/// construction is `Program` itself (no other stage reaches back into it).
pub struct Program {
    context: Context,
    compiled: Arc<CompiledProgram>,
    ret_ty: Type,
    ret_offset: u32,
    frame_size: u32,
}

fn emit(log: Option<&dyn OutputLog>, msg: Message) {
    if let Some(log) = log {
        log.log(&msg);
    }
}

fn emit_error(log: Option<&dyn OutputLog>, err: &Error) {
    let msg = Message::new(Category::Error, "compile error", err.to_string());
    let msg = match err.position() {
        Some(pos) => msg.at(pos),
        None => msg,
    };
    emit(log, msg);
}

/// `@ret`'s offset within the host args block: immediately past the
/// declared layout, rounded up to the return type's natural alignment.
/// `@ret` is not a [`Layout`] member (see `layout::Layout`'s doc comment),
/// so this placement is a `Program::compile`-time decision, not something
/// recoverable from the `Layout` alone.
fn ret_offset_for(layout: &Layout, ret_ty: Type) -> u32 {
    let align = ret_ty.align_bytes().max(1);
    let base = layout.size_bytes();
    (base + align - 1) / align * align
}

/// Find `main`'s declared return type by scanning the parsed (but not yet
/// analyzed) AST. `sema::analyze` takes the program's declared return type
/// as an input and validates `main` matches it, rather than discovering it
/// itself, so the facade resolves it here first.
fn find_main_return_type(ast: &Ast) -> Result<Type> {
    let root = ast.root.ok_or(Error::InvalidState)?;
    let NodeKind::Program { functions, .. } = &ast.get(root).kind else {
        return Err(Error::InvalidState);
    };
    for &f in functions {
        if let NodeKind::Function { name, ret_ty, .. } = &ast.get(f).kind {
            if name.as_str() == "main" {
                return Ok(*ret_ty);
            }
        }
    }
    Err(Error::NoSymbol { pos: ast.get(root).pos, name: "main".into() })
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 && i % 16 == 0 {
            out.push('\n');
        } else if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

impl Program {
    /// Run the full pipeline — parse, analyze, fold, lower, optimize IR,
    /// JIT — against `source`, `layout`, and `options`, reporting every
    /// error and selected debug dump to `log`. `context`'s detected CPU
    /// features (masked by `options`'s `DISABLE_*` bits) choose the
    /// backend's instruction selection. Not reentrant for a given call:
    /// each call builds its own arena-free scratch state and touches no
    /// shared state beyond `context`'s read-only feature flags.
    pub fn compile(
        context: &Context,
        source: &str,
        options: CompileOptions,
        layout: &Layout,
        log: Option<&dyn OutputLog>,
    ) -> Result<Program> {
        let mut ast = parse(source).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        if options.contains(CompileOptions::DEBUG_AST) {
            emit(log, Message::new(Category::AstInitial, "initial ast", format!("{ast:#?}")));
        }

        let ret_ty = find_main_return_type(&ast).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        sema::analyze(&mut ast, layout, ret_ty).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        fold::fold(&mut ast).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        if options.contains(CompileOptions::DEBUG_AST) {
            emit(log, Message::new(Category::AstFinal, "analyzed and folded ast", format!("{ast:#?}")));
        }

        let ret_offset = ret_offset_for(layout, ret_ty);
        let frame_size = {
            let tail = ret_offset + ret_ty.size_bytes();
            let align = 16u32;
            (layout.size_bytes().max(tail) + align - 1) / align * align
        };

        let mut module = lower(&ast, layout, ret_ty, ret_offset).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        if options.contains(CompileOptions::DEBUG_IR) {
            emit(log, Message::new(Category::IrInitial, "lowered ir", format!("{module:#?}")));
        }

        for func in &mut module.functions {
            let removed = opt::eliminate_dead_code(func);
            if removed > 0 {
                log::trace!("dead-code pass removed {removed} instruction(s)");
            }
        }

        if options.contains(CompileOptions::DEBUG_IR) {
            emit(log, Message::new(Category::IrFinal, "optimized ir", format!("{module:#?}")));
        }

        let features = context.features().masked(
            options.contains(CompileOptions::DISABLE_SSE4_1),
            options.contains(CompileOptions::DISABLE_AVX),
            options.contains(CompileOptions::DISABLE_AVX2),
        );
        log::debug!("jit finalizing with {features:?}");

        let compiled = back::compile(&module, features).map_err(|e| {
            emit_error(log, &e);
            e
        })?;

        if options.contains(CompileOptions::DEBUG_ASM) {
            emit(
                log,
                Message::new(
                    Category::MachineCode,
                    format!("{} bytes of generated machine code", compiled.code_size()),
                    hex_dump(compiled.code_bytes()),
                ),
            );
        }

        Ok(Program { context: context.clone(), compiled: Arc::new(compiled), ret_ty, ret_offset, frame_size })
    }

    /// The program's declared return type (`main`'s signature), i.e. the
    /// type `@ret` was compiled to accept.
    pub fn return_type(&self) -> Type {
        self.ret_ty
    }

    /// `@ret`'s byte offset within the args block passed to [`Program::run`].
    pub fn ret_offset(&self) -> u32 {
        self.ret_offset
    }

    /// Minimum size in bytes the caller's args block must have: the
    /// declared [`Layout`]'s size plus room for `@ret`, rounded to 16-byte
    /// alignment.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Invoke the compiled function against a caller-owned args block.
    /// `args` must be at least [`Program::frame_size`] bytes and 16-byte
    /// aligned (spec.md §6's calling convention); both are checked here
    /// rather than trusted, since a misaligned or undersized buffer would
    /// otherwise corrupt memory outside it. Safe to call concurrently from
    /// any thread as long as each caller supplies its own `args` block (no
    /// shared mutable state lives in generated code beyond it).
    pub fn run(&self, args: &mut [u8]) -> Result<i32> {
        if (args.len() as u64) < self.frame_size as u64 {
            return Err(Error::InvalidArgument);
        }
        if args.as_ptr() as usize % 16 != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(self.compiled.call(args.as_mut_ptr()))
    }

    /// The [`Context`] this program was compiled against, kept alive for as
    /// long as the program is.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

// `Program` hands out no interior mutability of its own and `CompiledProgram`
// is immutable after `compile` returns, so concurrent `run` calls on a
// shared `&Program` (spec.md §4.9/§5) are sound as long as each caller's
// `args` block is its own, which `run`'s `&mut [u8]` signature already
// forces at the type level.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::diag::CollectingLog;
    use crate::common::lang::{Access, ScalarKind};

    fn aligned_buf(size: usize) -> Vec<u8> {
        let layout = std::alloc::Layout::from_size_align(size.max(16), 16).unwrap();
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout);
            Vec::from_raw_parts(ptr, size, size)
        }
    }

    fn make_layout(members: &[(&str, Type)]) -> Layout {
        let mut layout = Layout::new();
        let mut offset = 0u32;
        for (name, ty) in members {
            let align = ty.align_bytes().max(1);
            offset = (offset + align - 1) / align * align;
            layout.add_member(name, *ty, offset).unwrap();
            offset += ty.size_bytes();
        }
        layout
    }

    /// Scenario 1 (spec.md §8): `int main() { return ia * ib + ic; }`.
    #[test]
    fn scenario_int_scalar_arithmetic() {
        let ctx = Context::create();
        let layout = make_layout(&[
            ("ia", Type::INT.with_access(Access::ReadOnly)),
            ("ib", Type::INT.with_access(Access::ReadOnly)),
            ("ic", Type::INT.with_access(Access::ReadOnly)),
        ]);
        let program =
            Program::compile(&ctx, "int main() { return ia * ib + ic; }", CompileOptions::empty(), &layout, None)
                .unwrap();

        let mut args = aligned_buf(program.frame_size() as usize);
        args[layout.find("ia").unwrap().offset as usize..][..4].copy_from_slice(&1i32.to_le_bytes());
        args[layout.find("ib").unwrap().offset as usize..][..4].copy_from_slice(&5i32.to_le_bytes());
        args[layout.find("ic").unwrap().offset as usize..][..4].copy_from_slice(&(-1i32).to_le_bytes());

        let rc = program.run(&mut args).unwrap();
        assert_eq!(rc, 0);
        let ret_off = program.ret_offset() as usize;
        let ret = i32::from_le_bytes(args[ret_off..ret_off + 4].try_into().unwrap());
        assert_eq!(ret, 4);
    }

    /// Scenario 2: `float main() { return fa * fb + fc; }`.
    #[test]
    fn scenario_float_scalar_arithmetic() {
        let ctx = Context::create();
        let layout = make_layout(&[
            ("fa", Type::FLOAT.with_access(Access::ReadOnly)),
            ("fb", Type::FLOAT.with_access(Access::ReadOnly)),
            ("fc", Type::FLOAT.with_access(Access::ReadOnly)),
        ]);
        let program = Program::compile(
            &ctx,
            "float main() { return fa * fb + fc; }",
            CompileOptions::empty(),
            &layout,
            None,
        )
        .unwrap();

        let mut args = aligned_buf(program.frame_size() as usize);
        args[layout.find("fa").unwrap().offset as usize..][..4].copy_from_slice(&1.0f32.to_le_bytes());
        args[layout.find("fb").unwrap().offset as usize..][..4].copy_from_slice(&5.0f32.to_le_bytes());
        args[layout.find("fc").unwrap().offset as usize..][..4].copy_from_slice(&(-1.0f32).to_le_bytes());

        program.run(&mut args).unwrap();
        let ret_off = program.ret_offset() as usize;
        let ret = f32::from_le_bytes(args[ret_off..ret_off + 4].try_into().unwrap());
        assert_eq!(ret, 4.0);
    }

    /// Scenario 3: `double main() { return sqrt(a*b) * c; }` then `++x`.
    #[test]
    fn scenario_double_sqrt_and_preincrement() {
        let ctx = Context::create();
        let layout = make_layout(&[
            ("a", Type::DOUBLE.with_access(Access::ReadOnly)),
            ("b", Type::DOUBLE.with_access(Access::ReadOnly)),
            ("c", Type::DOUBLE.with_access(Access::ReadOnly)),
        ]);
        let program = Program::compile(
            &ctx,
            "double main() { double x = sqrt(a*b) * c; ++x; return x; }",
            CompileOptions::empty(),
            &layout,
            None,
        )
        .unwrap();

        let mut args = aligned_buf(program.frame_size() as usize);
        args[layout.find("a").unwrap().offset as usize..][..8].copy_from_slice(&4.0f64.to_le_bytes());
        args[layout.find("b").unwrap().offset as usize..][..8].copy_from_slice(&16.0f64.to_le_bytes());
        args[layout.find("c").unwrap().offset as usize..][..8].copy_from_slice(&0.5f64.to_le_bytes());

        program.run(&mut args).unwrap();
        let ret_off = program.ret_offset() as usize;
        let ret = f64::from_le_bytes(args[ret_off..ret_off + 8].try_into().unwrap());
        // sqrt(4*16) * 0.5 = 4.0; ++x -> 5.0
        assert_eq!(ret, 5.0);
    }

    /// Scenario 4 (spec.md §8): `int4` alpha-blend via `vmulw`/`vsrlw`.
    #[test]
    fn scenario_int4_alpha_blend() {
        let ctx = Context::create();
        let int4 = Type::new(ScalarKind::Int, 4);
        let layout = make_layout(&[
            ("bg", int4.with_access(Access::ReadOnly)),
            ("fg", int4.with_access(Access::ReadOnly)),
            ("alpha", int4.with_access(Access::ReadOnly)),
        ]);
        let source = "int4 main() {\n\
             const int inv = 0x01000100;\n\
             int4 x = vmulw(bg, inv - alpha);\n\
             int4 y = vmulw(fg, alpha);\n\
             return vsrlw(vaddw(x, y), 8);\n\
        }";
        let program = Program::compile(&ctx, source, CompileOptions::empty(), &layout, None).unwrap();

        let mut args = aligned_buf(program.frame_size() as usize);
        let bg_off = layout.find("bg").unwrap().offset as usize;
        let fg_off = layout.find("fg").unwrap().offset as usize;
        let alpha_off = layout.find("alpha").unwrap().offset as usize;
        for lane in 0..4 {
            args[bg_off + lane * 4..][..4].copy_from_slice(&0x00FF00FFu32.to_le_bytes());
            args[fg_off + lane * 4..][..4].copy_from_slice(&0u32.to_le_bytes());
            args[alpha_off + lane * 4..][..4].copy_from_slice(&0x00800080u32.to_le_bytes());
        }

        program.run(&mut args).unwrap();
        let ret_off = program.ret_offset() as usize;
        for lane in 0..4 {
            let v = u32::from_le_bytes(args[ret_off + lane * 4..][..4].try_into().unwrap());
            assert_eq!(v, 0x007F007F);
        }
    }

    /// Scenario 5 (spec.md §8): writing to an RO field is a compile error.
    #[test]
    fn scenario_read_only_write_is_rejected() {
        let ctx = Context::create();
        let layout = make_layout(&[("ia", Type::INT.with_access(Access::ReadOnly))]);
        let log = CollectingLog::new();
        let err = Program::compile(
            &ctx,
            "int main() { ia = 1; return ia; }",
            CompileOptions::empty(),
            &layout,
            Some(&log),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyWrite { .. }));
        assert!(log.messages().iter().any(|m| m.category == Category::Error));
    }

    /// Scenario 6: a missing return in `main` is a compile error.
    #[test]
    fn scenario_missing_return_is_rejected() {
        let ctx = Context::create();
        let layout = Layout::new();
        let err =
            Program::compile(&ctx, "int main() { int x = 1; }", CompileOptions::empty(), &layout, None).unwrap_err();
        assert!(matches!(err, Error::ReturnedNoValue { .. }));
    }

    #[test]
    fn run_rejects_undersized_args_buffer() {
        let ctx = Context::create();
        let layout = make_layout(&[("ia", Type::INT.with_access(Access::ReadOnly))]);
        let program =
            Program::compile(&ctx, "int main() { return ia; }", CompileOptions::empty(), &layout, None).unwrap();
        let mut tiny = aligned_buf(4);
        assert_eq!(program.run(&mut tiny), Err(Error::InvalidArgument));
    }

    #[test]
    fn debug_dumps_are_only_emitted_when_requested() {
        let ctx = Context::create();
        let layout = Layout::new();
        let log = CollectingLog::new();
        Program::compile(
            &ctx,
            "int main() { return 1; }",
            CompileOptions::DEBUG_AST | CompileOptions::DEBUG_IR | CompileOptions::DEBUG_ASM,
            &layout,
            Some(&log),
        )
        .unwrap();
        let cats: std::collections::BTreeSet<_> = log.messages().iter().map(|m| m.category).collect();
        assert!(cats.contains(&Category::AstInitial));
        assert!(cats.contains(&Category::AstFinal));
        assert!(cats.contains(&Category::IrInitial));
        assert!(cats.contains(&Category::IrFinal));
        assert!(cats.contains(&Category::MachineCode));
    }

    #[test]
    fn unknown_option_bits_are_ignored() {
        let opts = CompileOptions::from_bits_truncate(0xFFFF_FFFF);
        assert!(opts.contains(CompileOptions::DEBUG_ASM));
    }
}
