//! Instruction selection and `dynasmrt` emission: walks one [`IRModule`] and
//! produces a single executable buffer holding every function back to back,
//! each one addressable through a [`dynasmrt::DynamicLabel`] so internal
//! calls can `call` a sibling function before its own body has been emitted.
//!
//! The register/operand conventions this module assumes are spelled out in
//! [`super::asm`] and the virtual-register placement in [`super::regalloc`].
//! Two simplifications run through the whole file, both noted in DESIGN.md:
//! width-3/4 `double` vectors (spec.md's `Vec256` class) are processed as two
//! independent 128-bit halves rather than a true 256-bit register, and
//! `Splat`/`Swizzle`/`Extract`/`Blend` move raw lane bytes through a GP
//! scratch register instead of a hardware shuffle, since neither needs
//! anything wider than a `mov` to be correct.

use dynasmrt::x64::{Assembler, Rq};
use dynasmrt::{dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer};

use crate::common::error::Error;
use crate::common::lang::{Op, ScalarKind, Type, TypedValue};
use crate::middle::tir::{
    CallTarget, FuncId, IRFunction, IRModule, IRObject, IRInst, IRTerm, MemBase, MemRef, SlotId, VReg,
};

use super::asm::{
    is_gp_class, runtime_helper_addr, TargetFeatures, ARGS_BASE, GP_ARGS, GP_POOL, SCRATCH_A, SCRATCH_B,
    SCRATCH_C, XMM_ARGS, XMM_SCRATCH_0, XMM_SCRATCH_1, XMM_SCRATCH_2,
};
use super::regalloc::{self, Allocation, Loc};

/// A finished JIT buffer plus the entry point's native function pointer.
/// `buf` must outlive every call through `entry`; they are kept in the same
/// struct so `Program` cannot have one without the other.
pub struct CompiledProgram {
    buf: ExecutableBuffer,
    entry: extern "sysv64" fn(*mut u8) -> i32,
}

impl CompiledProgram {
    pub fn call(&self, args: *mut u8) -> i32 {
        (self.entry)(args)
    }

    /// Exposed for diagnostics (`CompileOptions::DEBUG_ASM`): total size of
    /// the generated machine code.
    pub fn code_size(&self) -> usize {
        self.buf.len()
    }

    /// Raw generated bytes, for `CompileOptions::DEBUG_ASM`'s hex dump. No
    /// disassembler lives in this crate's dependency stack, so the sink only
    /// gets bytes and an offset, not mnemonics.
    pub fn code_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Compile every function in `module` into one executable buffer. Functions
/// are emitted in `module.functions` order; `module.entry` is the one whose
/// address becomes [`CompiledProgram::call`]'s target.
pub fn compile(module: &IRModule, features: TargetFeatures) -> Result<CompiledProgram, Error> {
    let mut ops = Assembler::new()
        .map_err(|e| Error::JitFailed { message: format!("failed to allocate JIT buffer: {e}") })?;

    let func_labels: Vec<DynamicLabel> = (0..module.functions.len()).map(|_| ops.new_dynamic_label()).collect();
    let mut func_offsets: Vec<AssemblyOffset> = Vec::with_capacity(module.functions.len());

    for (i, func) in module.functions.iter().enumerate() {
        let fid = FuncId(i as u32);
        let is_main = fid == module.entry;
        let alloc = regalloc::allocate(func);
        func_offsets.push(ops.offset());
        let lbl = func_labels[i];
        dynasm!(ops; => lbl);
        let mut fc = FuncCodegen {
            ops: &mut ops,
            func,
            module,
            alloc: &alloc,
            func_labels: &func_labels,
            features,
            is_main,
            block_labels: Vec::new(),
            epilogue_label: func_labels[i], // placeholder, reset in emit()
        };
        fc.emit()?;
    }

    let buf = ops.finalize().map_err(|_| Error::JitFailed { message: "failed to finalize JIT buffer".into() })?;
    let entry_offset = func_offsets[module.entry.0 as usize];
    let entry_ptr = buf.ptr(entry_offset);
    let entry: extern "sysv64" fn(*mut u8) -> i32 = unsafe { std::mem::transmute(entry_ptr) };
    Ok(CompiledProgram { buf, entry })
}

/// Where a value lives relative to a base register: `[base + disp]`. `disp`
/// carries its own sign, so every addressing site uses a plain `+`.
type MemAddr = (Rq, i32);

enum ParamLoc {
    Gp(Rq),
    Xmm(u8),
}

/// Classify the `idx`-th declared parameter's calling-convention slot by
/// counting how many GP-class/Xmm-class parameters precede it (our own
/// internal-call convention, spec.md §6's note on the host boundary aside).
fn classify_param(params: &[Type], idx: usize) -> ParamLoc {
    let mut gp = 0usize;
    let mut xmm = 0usize;
    for p in &params[..idx] {
        if is_gp_class(*p) {
            gp += 1;
        } else {
            xmm += 1;
        }
    }
    if is_gp_class(params[idx]) {
        ParamLoc::Gp(GP_ARGS[gp])
    } else {
        ParamLoc::Xmm(XMM_ARGS[xmm])
    }
}

/// Split a type's storage into independently addressable 128-bit pieces:
/// everything except width-3/4 `double` fits in one; those occupy two,
/// mirroring [`crate::common::value::Wide`]'s own two-`Value` layout.
fn chunks(ty: Type) -> Vec<(i32, u8)> {
    if ty.scalar == ScalarKind::Double && ty.width >= 3 {
        if ty.width == 3 {
            vec![(0, 2), (16, 1)]
        } else {
            vec![(0, 2), (16, 2)]
        }
    } else {
        vec![(0, ty.width.max(1))]
    }
}

fn elem_bytes(ty: Type) -> i32 {
    if ty.scalar == ScalarKind::Double {
        8
    } else {
        4
    }
}

/// Byte offset of a single lane within a value's home slot, accounting for
/// the two-chunk split of width-3/4 `double`.
fn lane_offset(ty: Type, lane: u8) -> i32 {
    if ty.scalar == ScalarKind::Double && ty.width >= 3 {
        if lane < 2 {
            lane as i32 * 8
        } else {
            16 + (lane as i32 - 2) * 8
        }
    } else {
        lane as i32 * elem_bytes(ty)
    }
}

struct FuncCodegen<'a> {
    ops: &'a mut Assembler,
    func: &'a IRFunction,
    module: &'a IRModule,
    alloc: &'a Allocation,
    func_labels: &'a [DynamicLabel],
    features: TargetFeatures,
    is_main: bool,
    block_labels: Vec<DynamicLabel>,
    epilogue_label: DynamicLabel,
}

impl<'a> FuncCodegen<'a> {
    // ---------------------------------------------------------------- addressing

    fn var_addr(&self, r: VReg) -> MemAddr {
        match self.alloc.vreg_loc[r.0 as usize] {
            Loc::GpReg(_) => unreachable!("var_addr called on a register-resident GP vreg"),
            Loc::Spill(off) => (Rq::RBP, -off),
        }
    }

    fn local_addr(&self, s: SlotId) -> MemAddr {
        (Rq::RBP, -self.alloc.local_off[s.0 as usize])
    }

    fn mem_addr(&self, m: &MemRef) -> MemAddr {
        match m.base {
            MemBase::Arg | MemBase::Ret => (ARGS_BASE, m.offset as i32),
            MemBase::Local(s) => self.local_addr(s),
        }
    }

    fn imm_scratch_addr(&self) -> MemAddr {
        (Rq::RBP, -self.alloc.imm_scratch_off)
    }

    fn operand_type(&self, obj: &IRObject) -> Type {
        match obj {
            IRObject::Var(r) => self.func.vreg_type(*r),
            IRObject::Imm(tv) => tv.ty,
            IRObject::Mem(m) => m.ty,
            IRObject::Param(i) => self.func.params[*i as usize],
            IRObject::BlockRef(_) => Type::VOID,
        }
    }

    /// Writes an immediate's raw bytes into the per-function scratch slot
    /// (spec.md §4.8: x86 has no immediate-into-xmm form) and returns its
    /// address. Never called with a width-3/4 `double`: [`TypedValue`]'s
    /// `Value` payload is 16 bytes, so the front end cannot construct one.
    fn materialize_imm(&mut self, tv: TypedValue) -> MemAddr {
        let (base, disp) = self.imm_scratch_addr();
        let lanes = tv.ty.width.max(1);
        if tv.ty.scalar == ScalarKind::Double {
            for lane in 0..lanes {
                let bits = tv.value.f64_lane(lane as usize).to_bits();
                let lo = (bits & 0xFFFF_FFFF) as u32 as i32;
                let hi = (bits >> 32) as u32 as i32;
                let off = disp + lane as i32 * 8;
                dynasm!(self.ops
                    ; mov DWORD [Rq(base.code()) + off], lo
                    ; mov DWORD [Rq(base.code()) + off + 4], hi
                );
            }
        } else {
            for lane in 0..lanes {
                let bits: i32 = match tv.ty.scalar {
                    ScalarKind::Float => tv.value.f32_lane(lane as usize).to_bits() as i32,
                    _ => tv.value.i32_lane(lane as usize),
                };
                let off = disp + lane as i32 * 4;
                dynasm!(self.ops; mov DWORD [Rq(base.code()) + off], bits);
            }
        }
        (base, disp)
    }

    /// The address an Xmm-class operand's bytes live at. Never called for
    /// `Param`: an Xmm-class parameter arrives in an argument register, not
    /// memory, and is only ever consumed by `Store`'s own special case.
    fn xmm_operand_addr(&mut self, obj: &IRObject) -> MemAddr {
        match obj {
            IRObject::Var(r) => self.var_addr(*r),
            IRObject::Mem(m) => self.mem_addr(m),
            IRObject::Imm(tv) => self.materialize_imm(*tv),
            IRObject::Param(_) => unreachable!("xmm-class param read outside of Store"),
            IRObject::BlockRef(_) => unreachable!("block ref is not a value operand"),
        }
    }

    // ------------------------------------------------------------- GP operands

    fn load_gp(&mut self, reg: Rq, obj: &IRObject) {
        match obj {
            IRObject::Var(r) => match self.alloc.vreg_loc[r.0 as usize] {
                Loc::GpReg(idx) => {
                    let src = GP_POOL[idx];
                    if src != reg {
                        dynasm!(self.ops; mov Rd(reg.code()), Rd(src.code()));
                    }
                }
                Loc::Spill(off) => {
                    let disp = -off;
                    dynasm!(self.ops; mov Rd(reg.code()), [Rq(Rq::RBP.code()) + disp]);
                }
            },
            IRObject::Imm(tv) => {
                let bits = tv.value.i32_lane(0);
                dynasm!(self.ops; mov Rd(reg.code()), DWORD bits);
            }
            IRObject::Mem(m) => {
                let (base, disp) = self.mem_addr(m);
                dynasm!(self.ops; mov Rd(reg.code()), [Rq(base.code()) + disp]);
            }
            IRObject::Param(i) => match classify_param(&self.func.params, *i as usize) {
                ParamLoc::Gp(src) => {
                    if src != reg {
                        dynasm!(self.ops; mov Rd(reg.code()), Rd(src.code()));
                    }
                }
                ParamLoc::Xmm(_) => unreachable!("gp load of an xmm-class param"),
            },
            IRObject::BlockRef(_) => unreachable!("block ref is not a value operand"),
        }
    }

    fn store_gp(&mut self, dst: VReg, reg: Rq) {
        match self.alloc.vreg_loc[dst.0 as usize] {
            Loc::GpReg(idx) => {
                let d = GP_POOL[idx];
                if d != reg {
                    dynasm!(self.ops; mov Rd(d.code()), Rd(reg.code()));
                }
            }
            Loc::Spill(off) => {
                let disp = -off;
                dynasm!(self.ops; mov [Rq(Rq::RBP.code()) + disp], Rd(reg.code()));
            }
        }
    }

    // ------------------------------------------------------------ Xmm operands

    fn load_xmm_chunk(&mut self, xmm_idx: u8, obj: &IRObject, _ty: Type, chunk_off: i32) {
        let (base, disp) = self.xmm_operand_addr(obj);
        dynasm!(self.ops; movdqu Rx(xmm_idx), [Rq(base.code()) + disp + chunk_off]);
    }

    fn store_xmm_chunk(&mut self, xmm_idx: u8, dst: MemAddr, chunk_off: i32) {
        dynasm!(self.ops; movdqu [Rq(dst.0.code()) + dst.1 + chunk_off], Rx(xmm_idx));
    }

    // ----------------------------------------------------------------- copies

    fn copy_raw_sized(&mut self, dst: MemAddr, dst_off: i32, src: MemAddr, src_off: i32, size: i32) {
        if size == 8 {
            dynasm!(self.ops
                ; mov Rq(SCRATCH_A.code()), [Rq(src.0.code()) + src.1 + src_off]
                ; mov [Rq(dst.0.code()) + dst.1 + dst_off], Rq(SCRATCH_A.code())
            );
        } else {
            dynasm!(self.ops
                ; mov Rd(SCRATCH_A.code()), [Rq(src.0.code()) + src.1 + src_off]
                ; mov [Rq(dst.0.code()) + dst.1 + dst_off], Rd(SCRATCH_A.code())
            );
        }
    }

    fn copy_raw(&mut self, dst: MemAddr, dst_off: i32, src: MemAddr, src_off: i32, size: i32) {
        let mut off = 0;
        while size - off >= 8 {
            self.copy_raw_sized(dst, dst_off + off, src, src_off + off, 8);
            off += 8;
        }
        if size - off > 0 {
            self.copy_raw_sized(dst, dst_off + off, src, src_off + off, 4);
        }
    }

    // --------------------------------------------------------------- dispatch

    fn emit(&mut self) -> Result<(), Error> {
        self.block_labels = (0..self.func.blocks.len()).map(|_| self.ops.new_dynamic_label()).collect();
        self.epilogue_label = self.ops.new_dynamic_label();

        let used: Vec<usize> = self.alloc.used_gp_pool.clone();
        let k = used.len() as i32;
        let padding: i32 = if k % 2 == 1 { 8 } else { 0 };
        let frame_bytes = self.alloc.frame_bytes;

        dynasm!(self.ops; push rbp; mov rbp, rsp);
        if frame_bytes > 0 {
            dynasm!(self.ops; sub rsp, DWORD frame_bytes);
        }
        for &idx in &used {
            let r = GP_POOL[idx];
            dynasm!(self.ops; push Rq(r.code()));
        }
        if padding > 0 {
            dynasm!(self.ops; sub rsp, DWORD padding);
        }
        if self.is_main {
            dynasm!(self.ops; mov Rq(ARGS_BASE.code()), rdi);
        }

        let func = self.func;
        for b in 0..func.blocks.len() {
            let lbl = self.block_labels[b];
            dynasm!(self.ops; => lbl);
            for inst in &func.blocks[b].insts {
                self.translate_inst(inst)?;
            }
            if let Some(term) = &func.blocks[b].term {
                self.translate_term(term);
            }
        }

        let epi = self.epilogue_label;
        dynasm!(self.ops; => epi);
        if padding > 0 {
            dynasm!(self.ops; add rsp, DWORD padding);
        }
        for &idx in used.iter().rev() {
            let r = GP_POOL[idx];
            dynasm!(self.ops; pop Rq(r.code()));
        }
        dynasm!(self.ops; mov rsp, rbp; pop rbp; ret);
        Ok(())
    }

    fn translate_inst(&mut self, inst: &IRInst) -> Result<(), Error> {
        match inst {
            IRInst::BinOp { dst, op, ty, lhs, rhs } => self.translate_binop(*dst, *op, *ty, lhs, rhs),
            IRInst::UnOp { dst, op, ty, operand } => self.translate_unop(*dst, *op, *ty, operand),
            IRInst::Convert { dst, ty, operand } => self.translate_convert(*dst, *ty, operand),
            IRInst::Splat { dst, ty, operand } => {
                self.translate_splat(*dst, *ty, operand);
                Ok(())
            }
            IRInst::Swizzle { dst, ty, base, lanes } => {
                self.translate_swizzle(*dst, *ty, base, lanes);
                Ok(())
            }
            IRInst::Extract { dst, ty, base, index } => {
                self.translate_extract(*dst, *ty, base, index);
                Ok(())
            }
            IRInst::Blend { dst, ty, base, overlay, lanes } => {
                self.translate_blend(*dst, *ty, base, overlay, lanes);
                Ok(())
            }
            IRInst::Load { dst, mem } => {
                self.translate_load(*dst, mem);
                Ok(())
            }
            IRInst::Store { mem, value } => {
                self.translate_store(mem, value);
                Ok(())
            }
            IRInst::Move { dst, ty, src } => {
                self.translate_move(*dst, *ty, src);
                Ok(())
            }
            IRInst::Call { dst, ty, target, args } => self.translate_call(*dst, *ty, *target, args),
        }
    }

    fn translate_term(&mut self, term: &IRTerm) {
        match term {
            IRTerm::Jump(b) => {
                let lbl = self.block_labels[b.0 as usize];
                dynasm!(self.ops; jmp => lbl);
            }
            IRTerm::Branch { cond, tt, ff } => {
                self.load_gp(SCRATCH_A, cond);
                let t_lbl = self.block_labels[tt.0 as usize];
                let f_lbl = self.block_labels[ff.0 as usize];
                dynasm!(self.ops
                    ; test Rd(SCRATCH_A.code()), Rd(SCRATCH_A.code())
                    ; jnz => t_lbl
                    ; jmp => f_lbl
                );
            }
            IRTerm::Return => {
                let ret_mem = MemRef { base: MemBase::Ret, offset: 0, ty: Type::INT };
                let (base, disp) = self.mem_addr(&ret_mem);
                dynasm!(self.ops; mov Rd(SCRATCH_A.code()), [Rq(base.code()) + disp]);
                let epi = self.epilogue_label;
                dynasm!(self.ops; jmp => epi);
            }
            IRTerm::ReturnValue(obj) => {
                if is_gp_class(self.func.ret_ty) {
                    self.load_gp(SCRATCH_A, obj);
                } else {
                    let (base, disp) = self.xmm_operand_addr(obj);
                    dynasm!(self.ops; movdqu Rx(XMM_SCRATCH_0), [Rq(base.code()) + disp]);
                }
                let epi = self.epilogue_label;
                dynasm!(self.ops; jmp => epi);
            }
            IRTerm::Unreachable => {
                dynasm!(self.ops; ud2);
            }
        }
    }

    // ---------------------------------------------------------------- BinOp

    fn translate_binop(&mut self, dst: VReg, op: Op, ty: Type, lhs: &IRObject, rhs: &IRObject) -> Result<(), Error> {
        let is_cmp = matches!(op, Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne);
        let operand_ty = if is_cmp { self.operand_type(lhs) } else { ty };
        if is_gp_class(operand_ty) {
            self.binop_gp(dst, op, operand_ty, is_cmp, lhs, rhs);
            Ok(())
        } else {
            self.binop_xmm(dst, op, operand_ty, is_cmp, lhs, rhs)
        }
    }

    fn binop_gp(&mut self, dst: VReg, op: Op, _operand_ty: Type, is_cmp: bool, lhs: &IRObject, rhs: &IRObject) {
        self.load_gp(SCRATCH_A, lhs);
        self.load_gp(SCRATCH_B, rhs);
        if is_cmp {
            dynasm!(self.ops; cmp Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code()));
            match op {
                Op::Lt => dynasm!(self.ops; setl Rb(SCRATCH_A.code())),
                Op::Le => dynasm!(self.ops; setle Rb(SCRATCH_A.code())),
                Op::Gt => dynasm!(self.ops; setg Rb(SCRATCH_A.code())),
                Op::Ge => dynasm!(self.ops; setge Rb(SCRATCH_A.code())),
                Op::Eq => dynasm!(self.ops; sete Rb(SCRATCH_A.code())),
                Op::Ne => dynasm!(self.ops; setne Rb(SCRATCH_A.code())),
                _ => unreachable!(),
            }
            dynasm!(self.ops; movzx Rd(SCRATCH_A.code()), Rb(SCRATCH_A.code()));
            self.store_gp(dst, SCRATCH_A);
            return;
        }
        match op {
            Op::Add => dynasm!(self.ops; add Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::Sub => dynasm!(self.ops; sub Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::Mul => dynasm!(self.ops; imul Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::BitAnd => dynasm!(self.ops; and Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::BitOr => dynasm!(self.ops; or Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::BitXor => dynasm!(self.ops; xor Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
            Op::Shl => dynasm!(self.ops; shl Rd(SCRATCH_A.code()), cl),
            Op::Shr => dynasm!(self.ops; sar Rd(SCRATCH_A.code()), cl),
            Op::Div | Op::Mod => self.emit_idiv(op),
            _ => unreachable!("op {op:?} does not reach binop_gp"),
        }
        self.store_gp(dst, SCRATCH_A);
    }

    /// `eax / ecx` (signed), wrapping to 0 instead of trapping on a zero
    /// divisor (spec.md §7's permissive reading of integer division by
    /// zero). Leaves the quotient (`Div`) or remainder (`Mod`) in `eax`.
    fn emit_idiv(&mut self, op: Op) {
        let zero_lbl = self.ops.new_dynamic_label();
        let done_lbl = self.ops.new_dynamic_label();
        dynasm!(self.ops
            ; test Rd(SCRATCH_B.code()), Rd(SCRATCH_B.code())
            ; jz => zero_lbl
            ; cdq
            ; idiv Rd(SCRATCH_B.code())
            ; jmp => done_lbl
            ; => zero_lbl
            ; xor eax, eax
            ; xor edx, edx
            ; => done_lbl
        );
        if op == Op::Mod {
            dynasm!(self.ops; mov eax, edx);
        }
    }

    fn binop_xmm(&mut self, dst: VReg, op: Op, operand_ty: Type, is_cmp: bool, lhs: &IRObject, rhs: &IRObject) -> Result<(), Error> {
        if operand_ty.scalar == ScalarKind::Int
            && operand_ty.width > 1
            && matches!(op, Op::Mul | Op::Div | Op::Mod | Op::Shl | Op::Shr)
        {
            self.vector_int_lane_loop(dst, op, operand_ty, lhs, rhs);
            return Ok(());
        }
        if is_cmp && operand_ty.width == 1 {
            self.scalar_float_compare(dst, op, operand_ty, lhs, rhs);
            return Ok(());
        }
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _lanes) in chunks(operand_ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, lhs, operand_ty, chunk_off);
            self.load_xmm_chunk(XMM_SCRATCH_1, rhs, operand_ty, chunk_off);
            self.emit_xmm_chunk_op(op, operand_ty, is_cmp);
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
        Ok(())
    }

    /// Flips `XMM_SCRATCH_0`'s mask bits in place using an all-ones register
    /// synthesized via a self-compare (no immediate-into-xmm form exists).
    fn invert_mask(&mut self, xmm_idx: u8) {
        dynasm!(self.ops
            ; pcmpeqd Rx(XMM_SCRATCH_2), Rx(XMM_SCRATCH_2)
            ; pxor Rx(xmm_idx), Rx(XMM_SCRATCH_2)
        );
    }

    fn emit_xmm_chunk_op(&mut self, op: Op, ty: Type, is_cmp: bool) {
        if is_cmp {
            let imm: i8 = match op {
                Op::Eq => 0,
                Op::Lt => 1,
                Op::Le => 2,
                Op::Ne => 4,
                Op::Ge => 5,
                Op::Gt => 6,
                _ => unreachable!(),
            };
            match ty.scalar {
                ScalarKind::Float => dynasm!(self.ops; cmpps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1), imm),
                ScalarKind::Double => dynasm!(self.ops; cmppd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1), imm),
                _ => match op {
                    Op::Eq => dynasm!(self.ops; pcmpeqd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                    Op::Ne => {
                        dynasm!(self.ops; pcmpeqd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                        self.invert_mask(XMM_SCRATCH_0);
                    }
                    Op::Gt => dynasm!(self.ops; pcmpgtd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                    Op::Le => {
                        dynasm!(self.ops; pcmpgtd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                        self.invert_mask(XMM_SCRATCH_0);
                    }
                    Op::Lt => {
                        dynasm!(self.ops; pcmpgtd Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_0));
                        dynasm!(self.ops; movdqa Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                    }
                    Op::Ge => {
                        dynasm!(self.ops; pcmpgtd Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_0));
                        self.invert_mask(XMM_SCRATCH_1);
                        dynasm!(self.ops; movdqa Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                    }
                    _ => unreachable!(),
                },
            }
            return;
        }
        match ty.scalar {
            ScalarKind::Float => match op {
                Op::Add => dynasm!(self.ops; addps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Sub => dynasm!(self.ops; subps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Mul => dynasm!(self.ops; mulps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Div => dynasm!(self.ops; divps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                _ => unreachable!(),
            },
            ScalarKind::Double => match op {
                Op::Add => dynasm!(self.ops; addpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Sub => dynasm!(self.ops; subpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Mul => dynasm!(self.ops; mulpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Div => dynasm!(self.ops; divpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                _ => unreachable!(),
            },
            _ => match op {
                Op::Add => dynasm!(self.ops; paddd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::Sub => dynasm!(self.ops; psubd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::BitAnd => dynasm!(self.ops; pand Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::BitOr => dynasm!(self.ops; por Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                Op::BitXor => dynasm!(self.ops; pxor Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                _ => unreachable!(),
            },
        }
    }

    /// A scalar `float`/`double` comparison: result is a GP `bool`, not a
    /// vector mask, even though the operands are Xmm-class.
    fn scalar_float_compare(&mut self, dst: VReg, op: Op, ty: Type, lhs: &IRObject, rhs: &IRObject) {
        self.load_xmm_chunk(XMM_SCRATCH_0, lhs, ty, 0);
        self.load_xmm_chunk(XMM_SCRATCH_1, rhs, ty, 0);
        let imm: i8 = match op {
            Op::Eq => 0,
            Op::Lt => 1,
            Op::Le => 2,
            Op::Ne => 4,
            Op::Ge => 5,
            Op::Gt => 6,
            _ => unreachable!(),
        };
        match ty.scalar {
            ScalarKind::Float => dynasm!(self.ops; cmpps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1), imm),
            ScalarKind::Double => dynasm!(self.ops; cmppd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1), imm),
            _ => unreachable!(),
        }
        dynasm!(self.ops
            ; movd Rd(SCRATCH_A.code()), Rx(XMM_SCRATCH_0)
            ; test Rd(SCRATCH_A.code()), Rd(SCRATCH_A.code())
            ; setne Rb(SCRATCH_A.code())
            ; movzx Rd(SCRATCH_A.code()), Rb(SCRATCH_A.code())
        );
        self.store_gp(dst, SCRATCH_A);
    }

    /// `int` vector `*`, `/`, `%`, `<<`, `>>`: no baseline-SSE2 packed
    /// instruction covers these (32-bit packed multiply is SSE4.1-only and
    /// there is no packed integer divide at all), so they run as an
    /// unrolled GP loop over each lane instead.
    fn vector_int_lane_loop(&mut self, dst: VReg, op: Op, ty: Type, lhs: &IRObject, rhs: &IRObject) {
        let lhs_addr = self.xmm_operand_addr(lhs);
        let rhs_addr = self.xmm_operand_addr(rhs);
        let dst_addr = self.var_addr(dst);
        for lane in 0..ty.width {
            let off = lane as i32 * 4;
            dynasm!(self.ops
                ; mov Rd(SCRATCH_A.code()), [Rq(lhs_addr.0.code()) + lhs_addr.1 + off]
                ; mov Rd(SCRATCH_B.code()), [Rq(rhs_addr.0.code()) + rhs_addr.1 + off]
            );
            match op {
                Op::Mul => dynasm!(self.ops; imul Rd(SCRATCH_A.code()), Rd(SCRATCH_B.code())),
                Op::Div | Op::Mod => self.emit_idiv(op),
                Op::Shl => dynasm!(self.ops; shl Rd(SCRATCH_A.code()), cl),
                Op::Shr => dynasm!(self.ops; sar Rd(SCRATCH_A.code()), cl),
                _ => unreachable!(),
            }
            dynasm!(self.ops; mov [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rd(SCRATCH_A.code()));
        }
    }

    // ----------------------------------------------------------------- UnOp

    fn translate_unop(&mut self, dst: VReg, op: Op, ty: Type, operand: &IRObject) -> Result<(), Error> {
        if is_gp_class(ty) {
            self.load_gp(SCRATCH_A, operand);
            match op {
                Op::Neg => dynasm!(self.ops; neg Rd(SCRATCH_A.code())),
                Op::Pos => {}
                Op::LogNot => dynasm!(self.ops; xor Rd(SCRATCH_A.code()), 1),
                Op::BitNot => dynasm!(self.ops; not Rd(SCRATCH_A.code())),
                _ => unreachable!("op {op:?} does not reach gp UnOp"),
            }
            self.store_gp(dst, SCRATCH_A);
            return Ok(());
        }
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _) in chunks(ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, operand, ty, chunk_off);
            match op {
                Op::Pos => {}
                Op::Neg => {
                    dynasm!(self.ops; pxor Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_1));
                    match ty.scalar {
                        ScalarKind::Float => dynasm!(self.ops; subps Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_0)),
                        ScalarKind::Double => dynasm!(self.ops; subpd Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_0)),
                        _ => dynasm!(self.ops; psubd Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_0)),
                    }
                    dynasm!(self.ops; movdqa Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                }
                Op::BitNot => self.invert_mask(XMM_SCRATCH_0),
                _ => unreachable!("op {op:?} does not reach xmm UnOp"),
            }
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
        Ok(())
    }

    // -------------------------------------------------------------- Convert

    fn translate_convert(&mut self, dst: VReg, ty: Type, operand: &IRObject) -> Result<(), Error> {
        let from_ty = self.operand_type(operand);
        for lane in 0..ty.width.max(1) {
            let from_is_float = matches!(from_ty.scalar, ScalarKind::Float | ScalarKind::Double);
            if from_is_float {
                let off = lane_offset(from_ty, lane);
                let (base, disp) = self.xmm_operand_addr(operand);
                if from_ty.scalar == ScalarKind::Double {
                    dynasm!(self.ops; movsd Rx(XMM_SCRATCH_0), [Rq(base.code()) + disp + off]);
                } else {
                    dynasm!(self.ops; movss Rx(XMM_SCRATCH_0), [Rq(base.code()) + disp + off]);
                }
            } else if ty.width <= 1 {
                self.load_gp(SCRATCH_A, operand);
            } else {
                let off = lane_offset(from_ty, lane);
                let (base, disp) = self.xmm_operand_addr(operand);
                dynasm!(self.ops; mov Rd(SCRATCH_A.code()), [Rq(base.code()) + disp + off]);
            }

            match (from_ty.scalar, ty.scalar) {
                (a, b) if a == b => {}
                (ScalarKind::Bool, ScalarKind::Int)
                | (ScalarKind::Int, ScalarKind::Bool)
                | (ScalarKind::Bool, ScalarKind::QBool)
                | (ScalarKind::QBool, ScalarKind::Bool)
                | (ScalarKind::Int, ScalarKind::QBool)
                | (ScalarKind::QBool, ScalarKind::Int) => {}
                (ScalarKind::Bool, ScalarKind::Float) | (ScalarKind::Int, ScalarKind::Float) => {
                    dynasm!(self.ops; cvtsi2ss Rx(XMM_SCRATCH_0), Rd(SCRATCH_A.code()))
                }
                (ScalarKind::Bool, ScalarKind::Double) | (ScalarKind::Int, ScalarKind::Double) => {
                    dynasm!(self.ops; cvtsi2sd Rx(XMM_SCRATCH_0), Rd(SCRATCH_A.code()))
                }
                (ScalarKind::Float, ScalarKind::Double) => dynasm!(self.ops; cvtss2sd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0)),
                (ScalarKind::Double, ScalarKind::Float) => dynasm!(self.ops; cvtsd2ss Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0)),
                (ScalarKind::Float, ScalarKind::Int) | (ScalarKind::Float, ScalarKind::Bool) => {
                    dynasm!(self.ops; cvttss2si Rd(SCRATCH_A.code()), Rx(XMM_SCRATCH_0))
                }
                (ScalarKind::Double, ScalarKind::Int) | (ScalarKind::Double, ScalarKind::Bool) => {
                    dynasm!(self.ops; cvttsd2si Rd(SCRATCH_A.code()), Rx(XMM_SCRATCH_0))
                }
                _ => return Err(Error::InvalidState),
            }

            let to_is_float = matches!(ty.scalar, ScalarKind::Float | ScalarKind::Double);
            if to_is_float {
                let off = lane_offset(ty, lane);
                let dst_addr = self.var_addr(dst);
                if ty.scalar == ScalarKind::Double {
                    dynasm!(self.ops; movsd [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rx(XMM_SCRATCH_0));
                } else {
                    dynasm!(self.ops; movss [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rx(XMM_SCRATCH_0));
                }
            } else if ty.width <= 1 {
                self.store_gp(dst, SCRATCH_A);
            } else {
                let off = lane_offset(ty, lane);
                let dst_addr = self.var_addr(dst);
                dynasm!(self.ops; mov [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rd(SCRATCH_A.code()));
            }
        }
        Ok(())
    }

    // ----------------------------------------------------- Splat/Swizzle/etc.

    fn translate_splat(&mut self, dst: VReg, ty: Type, operand: &IRObject) {
        let eb = elem_bytes(ty);
        let is_reg_gp = match operand {
            IRObject::Var(r) => is_gp_class(self.func.vreg_type(*r)),
            IRObject::Param(i) => matches!(classify_param(&self.func.params, *i as usize), ParamLoc::Gp(_)),
            _ => false,
        };
        if is_reg_gp {
            self.load_gp(SCRATCH_A, operand);
        } else {
            let (base, disp) = self.xmm_operand_addr(operand);
            if eb == 8 {
                dynasm!(self.ops; mov Rq(SCRATCH_A.code()), [Rq(base.code()) + disp]);
            } else {
                dynasm!(self.ops; mov Rd(SCRATCH_A.code()), [Rq(base.code()) + disp]);
            }
        }
        let dst_addr = self.var_addr(dst);
        for lane in 0..ty.width {
            let off = lane_offset(ty, lane);
            if eb == 8 {
                dynasm!(self.ops; mov [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rq(SCRATCH_A.code()));
            } else {
                dynasm!(self.ops; mov [Rq(dst_addr.0.code()) + dst_addr.1 + off], Rd(SCRATCH_A.code()));
            }
        }
    }

    fn translate_swizzle(&mut self, dst: VReg, ty: Type, base: &IRObject, lanes: &[u8]) {
        let base_ty = self.operand_type(base);
        let base_addr = self.xmm_operand_addr(base);
        let dst_addr = self.var_addr(dst);
        let eb = elem_bytes(base_ty);
        for (k, &src_lane) in lanes.iter().enumerate() {
            let src_off = lane_offset(base_ty, src_lane);
            let dst_off = lane_offset(ty, k as u8);
            self.copy_raw_sized(dst_addr, dst_off, base_addr, src_off, eb);
        }
    }

    fn translate_extract(&mut self, dst: VReg, ty: Type, base: &IRObject, index: &IRObject) {
        let base_ty = self.operand_type(base);
        let base_addr = self.xmm_operand_addr(base);
        let dst_addr = self.var_addr(dst);
        let eb = elem_bytes(base_ty);
        let _ = ty;
        if let IRObject::Imm(tv) = index {
            let lane = tv.value.i32_lane(0).max(0) as u8;
            let off = lane_offset(base_ty, lane);
            self.copy_raw_sized(dst_addr, 0, base_addr, off, eb);
            return;
        }
        self.load_gp(SCRATCH_B, index);
        dynasm!(self.ops
            ; movsxd Rq(SCRATCH_B.code()), Rd(SCRATCH_B.code())
            ; imul Rq(SCRATCH_B.code()), Rq(SCRATCH_B.code()), eb
            ; lea Rq(SCRATCH_C.code()), [Rq(base_addr.0.code()) + base_addr.1]
            ; add Rq(SCRATCH_C.code()), Rq(SCRATCH_B.code())
        );
        if eb == 8 {
            dynasm!(self.ops
                ; mov Rq(SCRATCH_A.code()), [Rq(SCRATCH_C.code())]
                ; mov [Rq(dst_addr.0.code()) + dst_addr.1], Rq(SCRATCH_A.code())
            );
        } else {
            dynasm!(self.ops
                ; mov Rd(SCRATCH_A.code()), [Rq(SCRATCH_C.code())]
                ; mov [Rq(dst_addr.0.code()) + dst_addr.1], Rd(SCRATCH_A.code())
            );
        }
    }

    fn translate_blend(&mut self, dst: VReg, ty: Type, base: &IRObject, overlay: &IRObject, lanes: &[u8]) {
        let base_addr = self.xmm_operand_addr(base);
        let overlay_ty = self.operand_type(overlay);
        let overlay_addr = self.xmm_operand_addr(overlay);
        let dst_addr = self.var_addr(dst);
        let eb = elem_bytes(ty);
        for lane in 0..ty.width {
            let off = lane_offset(ty, lane);
            self.copy_raw_sized(dst_addr, off, base_addr, off, eb);
        }
        for (k, &dst_lane) in lanes.iter().enumerate() {
            let src_off = lane_offset(overlay_ty, k as u8);
            let dst_off = lane_offset(ty, dst_lane);
            self.copy_raw_sized(dst_addr, dst_off, overlay_addr, src_off, eb);
        }
    }

    // --------------------------------------------------------- Load/Store/Move

    fn translate_load(&mut self, dst: VReg, mem: &MemRef) {
        if is_gp_class(mem.ty) {
            self.load_gp(SCRATCH_A, &IRObject::Mem(*mem));
            self.store_gp(dst, SCRATCH_A);
        } else {
            let src = self.mem_addr(mem);
            let dst_addr = self.var_addr(dst);
            self.copy_raw(dst_addr, 0, src, 0, mem.ty.size_bytes() as i32);
        }
    }

    fn translate_store(&mut self, mem: &MemRef, value: &IRObject) {
        let dst = self.mem_addr(mem);
        if let IRObject::Param(i) = value {
            match classify_param(&self.func.params, *i as usize) {
                ParamLoc::Gp(src) => dynasm!(self.ops; mov [Rq(dst.0.code()) + dst.1], Rd(src.code())),
                ParamLoc::Xmm(idx) => dynasm!(self.ops; movdqu [Rq(dst.0.code()) + dst.1], Rx(idx)),
            }
            return;
        }
        if is_gp_class(mem.ty) {
            self.load_gp(SCRATCH_A, value);
            dynasm!(self.ops; mov [Rq(dst.0.code()) + dst.1], Rd(SCRATCH_A.code()));
        } else {
            let src = self.xmm_operand_addr(value);
            self.copy_raw(dst, 0, src, 0, mem.ty.size_bytes() as i32);
        }
    }

    fn translate_move(&mut self, dst: VReg, ty: Type, src: &IRObject) {
        if is_gp_class(ty) {
            self.load_gp(SCRATCH_A, src);
            self.store_gp(dst, SCRATCH_A);
        } else {
            let src_addr = self.xmm_operand_addr(src);
            let dst_addr = self.var_addr(dst);
            self.copy_raw(dst_addr, 0, src_addr, 0, ty.size_bytes() as i32);
        }
    }

    // ------------------------------------------------------------------ Call

    fn translate_call(&mut self, dst: Option<VReg>, ty: Type, target: CallTarget, args: &[IRObject]) -> Result<(), Error> {
        match target {
            CallTarget::Intrinsic(name) => {
                self.translate_intrinsic(dst.expect("an intrinsic call always produces a result"), name, ty, args)
            }
            CallTarget::Function(fid) => self.translate_call_function(dst, ty, fid, args),
        }
    }

    fn translate_call_function(&mut self, dst: Option<VReg>, ty: Type, fid: FuncId, args: &[IRObject]) -> Result<(), Error> {
        let callee_params = self.module.func(fid).params.clone();
        for (i, arg) in args.iter().enumerate() {
            match classify_param(&callee_params, i) {
                ParamLoc::Gp(reg) => self.load_gp(reg, arg),
                ParamLoc::Xmm(idx) => {
                    let (base, disp) = self.xmm_operand_addr(arg);
                    dynasm!(self.ops; movdqu Rx(idx), [Rq(base.code()) + disp]);
                }
            }
        }
        let lbl = self.func_labels[fid.0 as usize];
        dynasm!(self.ops; call => lbl);
        if let Some(d) = dst {
            if is_gp_class(ty) {
                self.store_gp(d, SCRATCH_A);
            } else {
                let dst_addr = self.var_addr(d);
                dynasm!(self.ops; movdqu [Rq(dst_addr.0.code()) + dst_addr.1], Rx(XMM_SCRATCH_0));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ Intrinsics

    fn translate_intrinsic(&mut self, dst: VReg, name: &'static str, ty: Type, args: &[IRObject]) -> Result<(), Error> {
        match name {
            "sqrt" => {
                self.sqrt_intrinsic(dst, ty, &args[0]);
                Ok(())
            }
            "abs" => {
                self.abs_intrinsic(dst, ty, &args[0]);
                Ok(())
            }
            "floor" => self.round_intrinsic(dst, ty, 0x09, &args[0]),
            "ceil" => self.round_intrinsic(dst, ty, 0x0A, &args[0]),
            "round" => self.round_intrinsic(dst, ty, 0x08, &args[0]),
            "trunc" => self.round_intrinsic(dst, ty, 0x0B, &args[0]),
            "min" => {
                self.minmax_intrinsic(dst, ty, true, &args[0], &args[1]);
                Ok(())
            }
            "max" => {
                self.minmax_intrinsic(dst, ty, false, &args[0], &args[1]);
                Ok(())
            }
            "pow" => self.runtime_call2(dst, ty, "pow", &args[0], &args[1]),
            "exp" | "log" | "sin" | "cos" | "tan" => self.runtime_call1(dst, ty, name, &args[0]),
            "vaddw" | "vsubw" | "vmulw" | "vsrlw" | "vsllw" => {
                self.packed_word_op(dst, ty, name, &args[0], &args[1]);
                Ok(())
            }
            _ => Err(Error::InvalidState),
        }
    }

    fn sqrt_intrinsic(&mut self, dst: VReg, ty: Type, arg: &IRObject) {
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _) in chunks(ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, arg, ty, chunk_off);
            if ty.scalar == ScalarKind::Double {
                dynasm!(self.ops; sqrtpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0));
            } else {
                dynasm!(self.ops; sqrtps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0));
            }
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
    }

    fn abs_intrinsic(&mut self, dst: VReg, ty: Type, arg: &IRObject) {
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _) in chunks(ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, arg, ty, chunk_off);
            dynasm!(self.ops; pcmpeqd Rx(XMM_SCRATCH_1), Rx(XMM_SCRATCH_1));
            if ty.scalar == ScalarKind::Double {
                dynasm!(self.ops; psrlq Rx(XMM_SCRATCH_1), 1);
            } else {
                dynasm!(self.ops; psrld Rx(XMM_SCRATCH_1), 1);
            }
            dynasm!(self.ops; pand Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
    }

    fn round_intrinsic(&mut self, dst: VReg, ty: Type, mode: i8, arg: &IRObject) -> Result<(), Error> {
        if !self.features.sse4_1 {
            return Err(Error::InvalidState);
        }
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _) in chunks(ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, arg, ty, chunk_off);
            if ty.scalar == ScalarKind::Double {
                dynasm!(self.ops; roundpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0), mode);
            } else {
                dynasm!(self.ops; roundps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0), mode);
            }
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
        Ok(())
    }

    fn minmax_intrinsic(&mut self, dst: VReg, ty: Type, is_min: bool, a: &IRObject, b: &IRObject) {
        let dst_addr = self.var_addr(dst);
        for (chunk_off, _) in chunks(ty) {
            self.load_xmm_chunk(XMM_SCRATCH_0, a, ty, chunk_off);
            self.load_xmm_chunk(XMM_SCRATCH_1, b, ty, chunk_off);
            match (ty.scalar, is_min) {
                (ScalarKind::Float, true) => dynasm!(self.ops; minps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                (ScalarKind::Float, false) => dynasm!(self.ops; maxps Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                (ScalarKind::Double, true) => dynasm!(self.ops; minpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                (ScalarKind::Double, false) => dynasm!(self.ops; maxpd Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                _ => unreachable!("min/max only apply to float/double per the language's intrinsic table"),
            }
            self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, chunk_off);
        }
    }

    fn load_f64_lane(&mut self, xmm_idx: u8, obj: &IRObject, ty: Type, lane_off: i32) {
        let (base, disp) = self.xmm_operand_addr(obj);
        if ty.scalar == ScalarKind::Double {
            dynasm!(self.ops; movsd Rx(xmm_idx), [Rq(base.code()) + disp + lane_off]);
        } else {
            dynasm!(self.ops
                ; movss Rx(xmm_idx), [Rq(base.code()) + disp + lane_off]
                ; cvtss2sd Rx(xmm_idx), Rx(xmm_idx)
            );
        }
    }

    fn store_f64_lane(&mut self, dst_addr: MemAddr, ty: Type, lane_off: i32) {
        if ty.scalar == ScalarKind::Double {
            dynasm!(self.ops; movsd [Rq(dst_addr.0.code()) + dst_addr.1 + lane_off], Rx(XMM_SCRATCH_0));
        } else {
            dynasm!(self.ops
                ; cvtsd2ss Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_0)
                ; movss [Rq(dst_addr.0.code()) + dst_addr.1 + lane_off], Rx(XMM_SCRATCH_0)
            );
        }
    }

    /// A transcendental intrinsic with no x86 instruction: call out to one
    /// of [`super::asm`]'s `extern "C"` helpers, one lane at a time, always
    /// through the `f64` domain (spec.md §4.11's math intrinsics fold
    /// through `f64` too).
    fn runtime_call1(&mut self, dst: VReg, ty: Type, name: &str, arg: &IRObject) -> Result<(), Error> {
        let addr = runtime_helper_addr(name).ok_or(Error::InvalidState)?;
        let dst_addr = self.var_addr(dst);
        for lane in 0..ty.width.max(1) {
            let off = lane_offset(ty, lane);
            self.load_f64_lane(XMM_SCRATCH_0, arg, ty, off);
            dynasm!(self.ops
                ; mov Rq(SCRATCH_A.code()), QWORD addr as i64
                ; call Rq(SCRATCH_A.code())
            );
            self.store_f64_lane(dst_addr, ty, off);
        }
        Ok(())
    }

    fn runtime_call2(&mut self, dst: VReg, ty: Type, name: &str, a: &IRObject, b: &IRObject) -> Result<(), Error> {
        let addr = runtime_helper_addr(name).ok_or(Error::InvalidState)?;
        let dst_addr = self.var_addr(dst);
        for lane in 0..ty.width.max(1) {
            let off = lane_offset(ty, lane);
            self.load_f64_lane(XMM_SCRATCH_0, a, ty, off);
            self.load_f64_lane(XMM_SCRATCH_1, b, ty, off);
            dynasm!(self.ops
                ; mov Rq(SCRATCH_A.code()), QWORD addr as i64
                ; call Rq(SCRATCH_A.code())
            );
            self.store_f64_lane(dst_addr, ty, off);
        }
        Ok(())
    }

    /// `vaddw`/`vsubw`/`vmulw`/`vsrlw`/`vsllw`: the packed 16-bit-lane SWAR
    /// intrinsics (spec.md §4.12), implemented directly with their SSE2
    /// word-granularity counterparts over the whole 128-bit register
    /// regardless of the type's actual element count.
    fn packed_word_op(&mut self, dst: VReg, ty: Type, name: &str, a: &IRObject, b: &IRObject) {
        let dst_addr = self.var_addr(dst);
        self.load_xmm_chunk(XMM_SCRATCH_0, a, ty, 0);
        match name {
            "vsrlw" | "vsllw" => match b {
                IRObject::Imm(tv) => {
                    let imm = (tv.value.i32_lane(0) & 0xFF) as i8;
                    if name == "vsrlw" {
                        dynasm!(self.ops; psrlw Rx(XMM_SCRATCH_0), imm);
                    } else {
                        dynasm!(self.ops; psllw Rx(XMM_SCRATCH_0), imm);
                    }
                }
                _ => {
                    self.load_gp(SCRATCH_A, b);
                    dynasm!(self.ops; movd Rx(XMM_SCRATCH_1), Rd(SCRATCH_A.code()));
                    if name == "vsrlw" {
                        dynasm!(self.ops; psrlw Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                    } else {
                        dynasm!(self.ops; psllw Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1));
                    }
                }
            },
            _ => {
                self.load_xmm_chunk(XMM_SCRATCH_1, b, ty, 0);
                match name {
                    "vaddw" => dynasm!(self.ops; paddw Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                    "vsubw" => dynasm!(self.ops; psubw Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                    "vmulw" => dynasm!(self.ops; pmullw Rx(XMM_SCRATCH_0), Rx(XMM_SCRATCH_1)),
                    _ => unreachable!(),
                }
            }
        }
        self.store_xmm_chunk(XMM_SCRATCH_0, dst_addr, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::lang::Access;
    use crate::common::value::Value;
    use crate::middle::tir::IRModule;

    fn simple_main_returning(v: i32) -> IRModule {
        let mut f = IRFunction::default();
        let b = f.new_block();
        f.ret_ty = Type::INT;
        let ret_mem = MemRef { base: MemBase::Ret, offset: 0, ty: Type::new(ScalarKind::Int, 1).with_access(Access::None) };
        f.block_mut(b).insts.push(IRInst::Store {
            mem: ret_mem,
            value: IRObject::Imm(TypedValue { ty: Type::INT, value: Value::from_i32(v) }),
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        let mut m = IRModule::default();
        let id = m.push(f);
        m.entry = id;
        m
    }

    #[test]
    fn compiles_and_runs_a_trivial_main() {
        let module = simple_main_returning(42);
        let features = TargetFeatures { sse4_1: true, avx: false, avx2: false };
        let compiled = compile(&module, features).expect("compiles");
        let mut args_block = [0u8; 16];
        let rc = compiled.call(args_block.as_mut_ptr());
        assert_eq!(rc, 42);
    }

    #[test]
    fn rejects_floor_when_sse4_1_is_disabled() {
        let mut f = IRFunction::default();
        let b = f.new_block();
        f.ret_ty = Type::INT;
        let v = f.new_vreg(Type::FLOAT);
        f.block_mut(b).insts.push(IRInst::Call {
            dst: Some(v),
            ty: Type::FLOAT,
            target: CallTarget::Intrinsic("floor"),
            args: vec![IRObject::Imm(TypedValue { ty: Type::FLOAT, value: Value::from_f32(1.5) })],
        });
        f.block_mut(b).term = Some(IRTerm::Return);
        let mut m = IRModule::default();
        let id = m.push(f);
        m.entry = id;
        let features = TargetFeatures { sse4_1: false, avx: false, avx2: false };
        let err = compile(&m, features).unwrap_err();
        assert_eq!(err, Error::InvalidState);
    }
}
