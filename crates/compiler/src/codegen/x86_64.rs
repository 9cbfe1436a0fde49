//! x86-64 instruction encoder
//!
//! Implements [`Emitter`] with raw byte encodings. Memory operands always
//! use a 32-bit displacement; the encoder favors uniform, easily patched
//! shapes over minimal length.
//!
//! Register mapping (System V): Ret=rax, Arg0..5=rdi rsi rdx rcx r8 r9,
//! Scratch0/1=r10/r11, Loop0..2=rbx r12 r13, VarCount=r14, Plat=r15.
//! On Windows the four register arguments swap to rcx rdx r8 r9 and
//! Arg4/Arg5 fall back to rdi/rsi.

use super::emitter::{CodeBuf, Cond, Emitter, FCond, FReg, Fixup, Patch, PatchKind, Reg};
use flap_object::Arch;

pub struct X86_64Emitter {
    buf: CodeBuf,
    windows: bool,
}

impl X86_64Emitter {
    pub fn new(windows: bool) -> Self {
        X86_64Emitter { buf: CodeBuf::new(), windows }
    }

    fn enc(&self, r: Reg) -> u8 {
        match r {
            Reg::Ret => 0, // rax
            Reg::Arg0 => {
                if self.windows { 1 } else { 7 } // rcx / rdi
            }
            Reg::Arg1 => {
                if self.windows { 2 } else { 6 } // rdx / rsi
            }
            Reg::Arg2 => {
                if self.windows { 8 } else { 2 } // r8 / rdx
            }
            Reg::Arg3 => {
                if self.windows { 9 } else { 1 } // r9 / rcx
            }
            Reg::Arg4 => {
                if self.windows { 7 } else { 8 } // rdi / r8
            }
            Reg::Arg5 => {
                if self.windows { 6 } else { 9 } // rsi / r9
            }
            Reg::Scratch0 => 10,
            Reg::Scratch1 => 11,
            Reg::Loop0 => 3, // rbx
            Reg::Loop1 => 12,
            Reg::Loop2 => 13,
            Reg::VarCount => 14,
            Reg::Plat => 15,
            Reg::Sp => 4,
            Reg::Fp => 5,
        }
    }

    fn rex(&mut self, w: bool, reg: u8, base: u8) {
        let b = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | ((base >> 3) & 1);
        self.buf.u8(b);
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.buf.u8((md << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// Register-direct form.
    fn rm_reg(&mut self, reg: u8, rm: u8) {
        self.modrm(0b11, reg, rm);
    }

    /// `[base + disp32]` form, emitting SIB when base is rsp/r12.
    fn rm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        if base & 7 == 4 {
            self.modrm(0b10, reg, 4);
            self.buf.u8(0x24); // SIB: scale 0, no index, base rsp/r12
        } else {
            self.modrm(0b10, reg, base);
        }
        self.buf.i32(disp);
    }

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        let (d, s) = (self.enc(dst), self.enc(src));
        self.rex(true, s, d);
        self.buf.u8(opcode);
        self.rm_reg(s, d);
    }

    fn jcc_op(cond: Cond) -> u8 {
        match cond {
            Cond::Eq => 0x84,
            Cond::Ne => 0x85,
            Cond::Lt => 0x8c,
            Cond::Le => 0x8e,
            Cond::Gt => 0x8f,
            Cond::Ge => 0x8d,
        }
    }

    fn setcc_op(cond: Cond) -> u8 {
        match cond {
            Cond::Eq => 0x94,
            Cond::Ne => 0x95,
            Cond::Lt => 0x9c,
            Cond::Le => 0x9e,
            Cond::Gt => 0x9f,
            Cond::Ge => 0x9d,
        }
    }

    fn setcc(&mut self, cond_op: u8, dst: Reg) {
        let d = self.enc(dst);
        // REX clears any ah/bh aliasing for encodings 4..7 and reaches r8+
        self.rex(false, 0, d);
        self.buf.u8(0x0f);
        self.buf.u8(cond_op);
        self.rm_reg(0, d);
        // movzx dst, dst8
        let d = self.enc(dst);
        self.rex(true, d, d);
        self.buf.u8(0x0f);
        self.buf.u8(0xb6);
        self.rm_reg(d, d);
    }

    fn cmp_rr_raw(&mut self, a: Reg, b: Reg) {
        self.alu_rr(0x39, a, b); // cmp a, b  (a is rm, b is reg)
    }

    /// ucomisd a, b
    fn ucomisd(&mut self, a: FReg, b: FReg) {
        self.buf.u8(0x66);
        self.buf.u8(0x0f);
        self.buf.u8(0x2e);
        self.rm_reg(a.index(), b.index());
    }

    fn sse_rr(&mut self, opcode: u8, dst: FReg, src: FReg) {
        self.buf.u8(0xf2);
        self.buf.u8(0x0f);
        self.buf.u8(opcode);
        self.rm_reg(dst.index(), src.index());
    }

    /// Ordered float compare materializing 0/1; NaN yields 0 even for Ne's
    /// complement path, see fset_cmp.
    fn fcmp_above(&mut self, dst: Reg, a: FReg, b: FReg, or_equal: bool) {
        self.ucomisd(a, b);
        // seta / setae: CF-based, false on unordered
        self.setcc(if or_equal { 0x93 } else { 0x97 }, dst);
    }
}

impl Emitter for X86_64Emitter {
    fn arch(&self) -> Arch {
        Arch::Amd64
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn code(&self) -> &[u8] {
        &self.buf.bytes
    }

    fn take(&mut self) -> (Vec<u8>, Vec<Patch>) {
        (std::mem::take(&mut self.buf.bytes), std::mem::take(&mut self.buf.patches))
    }

    fn align_to(&mut self, align: usize) {
        while !self.buf.len().is_multiple_of(align) {
            self.nop();
        }
    }

    fn mov_ri(&mut self, dst: Reg, imm: i64) {
        let d = self.enc(dst);
        if let Ok(imm32) = i32::try_from(imm) {
            self.rex(true, 0, d);
            self.buf.u8(0xc7);
            self.rm_reg(0, d);
            self.buf.i32(imm32);
        } else {
            self.rex(true, 0, d);
            self.buf.u8(0xb8 + (d & 7));
            self.buf.u64(imm as u64);
        }
    }

    fn mov_rr(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.alu_rr(0x89, dst, src);
        }
    }

    fn load(&mut self, dst: Reg, base: Reg, off: i32) {
        let (d, b) = (self.enc(dst), self.enc(base));
        self.rex(true, d, b);
        self.buf.u8(0x8b);
        self.rm_mem(d, b, off);
    }

    fn store(&mut self, base: Reg, off: i32, src: Reg) {
        let (s, b) = (self.enc(src), self.enc(base));
        self.rex(true, s, b);
        self.buf.u8(0x89);
        self.rm_mem(s, b, off);
    }

    fn load_u8(&mut self, dst: Reg, base: Reg, off: i32) {
        let (d, b) = (self.enc(dst), self.enc(base));
        self.rex(true, d, b);
        self.buf.u8(0x0f);
        self.buf.u8(0xb6); // movzx r64, r/m8
        self.rm_mem(d, b, off);
    }

    fn store_u8(&mut self, base: Reg, off: i32, src: Reg) {
        let (s, b) = (self.enc(src), self.enc(base));
        self.rex(false, s, b); // REX reaches sil/dil/r8b+
        self.buf.u8(0x88);
        self.rm_mem(s, b, off);
    }

    fn fload(&mut self, dst: FReg, base: Reg, off: i32) {
        let b = self.enc(base);
        self.buf.u8(0xf2);
        if b >= 8 {
            self.rex(false, 0, b);
        }
        self.buf.u8(0x0f);
        self.buf.u8(0x10);
        self.rm_mem(dst.index(), b, off);
    }

    fn fstore(&mut self, base: Reg, off: i32, src: FReg) {
        let b = self.enc(base);
        self.buf.u8(0xf2);
        if b >= 8 {
            self.rex(false, 0, b);
        }
        self.buf.u8(0x0f);
        self.buf.u8(0x11);
        self.rm_mem(src.index(), b, off);
    }

    fn fmov(&mut self, dst: FReg, src: FReg) {
        if dst != src {
            self.sse_rr(0x10, dst, src);
        }
    }

    fn fmov_from_gpr(&mut self, dst: FReg, src: Reg) {
        let s = self.enc(src);
        self.buf.u8(0x66);
        self.rex(true, dst.index(), s);
        self.buf.u8(0x0f);
        self.buf.u8(0x6e);
        self.rm_reg(dst.index(), s);
    }

    fn fmov_to_gpr(&mut self, dst: Reg, src: FReg) {
        let d = self.enc(dst);
        self.buf.u8(0x66);
        self.rex(true, src.index(), d);
        self.buf.u8(0x0f);
        self.buf.u8(0x7e);
        self.rm_reg(src.index(), d);
    }

    fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, dst, src);
    }

    fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, dst, src);
    }

    fn mul_rr(&mut self, dst: Reg, src: Reg) {
        let (d, s) = (self.enc(dst), self.enc(src));
        self.rex(true, d, s);
        self.buf.u8(0x0f);
        self.buf.u8(0xaf);
        self.rm_reg(d, s);
    }

    fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, dst, src);
    }

    fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, dst, src);
    }

    fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, dst, src);
    }

    fn not_r(&mut self, r: Reg) {
        let e = self.enc(r);
        self.rex(true, 0, e);
        self.buf.u8(0xf7);
        self.rm_reg(2, e);
    }

    fn neg_r(&mut self, r: Reg) {
        let e = self.enc(r);
        self.rex(true, 0, e);
        self.buf.u8(0xf7);
        self.rm_reg(3, e);
    }

    fn add_ri(&mut self, dst: Reg, imm: i32) {
        let d = self.enc(dst);
        self.rex(true, 0, d);
        self.buf.u8(0x81);
        self.rm_reg(0, d);
        self.buf.i32(imm);
    }

    fn shl_ri(&mut self, dst: Reg, n: u8) {
        let d = self.enc(dst);
        self.rex(true, 0, d);
        self.buf.u8(0xc1);
        self.rm_reg(4, d);
        self.buf.u8(n);
    }

    fn shr_ri(&mut self, dst: Reg, n: u8) {
        let d = self.enc(dst);
        self.rex(true, 0, d);
        self.buf.u8(0xc1);
        self.rm_reg(5, d);
        self.buf.u8(n);
    }

    fn sar_ri(&mut self, dst: Reg, n: u8) {
        let d = self.enc(dst);
        self.rex(true, 0, d);
        self.buf.u8(0xc1);
        self.rm_reg(7, d);
        self.buf.u8(n);
    }

    fn shl_r(&mut self, dst: Reg, amount: Reg) {
        self.shift_by_reg(4, dst, amount);
    }

    fn shr_r(&mut self, dst: Reg, amount: Reg) {
        self.shift_by_reg(5, dst, amount);
    }

    fn rol_r(&mut self, dst: Reg, amount: Reg) {
        self.shift_by_reg(0, dst, amount);
    }

    fn ror_r(&mut self, dst: Reg, amount: Reg) {
        self.shift_by_reg(1, dst, amount);
    }

    fn fadd(&mut self, dst: FReg, src: FReg) {
        self.sse_rr(0x58, dst, src);
    }

    fn fsub(&mut self, dst: FReg, src: FReg) {
        self.sse_rr(0x5c, dst, src);
    }

    fn fmul(&mut self, dst: FReg, src: FReg) {
        self.sse_rr(0x59, dst, src);
    }

    fn fdiv(&mut self, dst: FReg, src: FReg) {
        self.sse_rr(0x5e, dst, src);
    }

    fn cvt_f2i(&mut self, dst: Reg, src: FReg) {
        let d = self.enc(dst);
        self.buf.u8(0xf2);
        self.rex(true, d, src.index());
        self.buf.u8(0x0f);
        self.buf.u8(0x2c);
        self.rm_reg(d, src.index());
    }

    fn cvt_i2f(&mut self, dst: FReg, src: Reg) {
        let s = self.enc(src);
        self.buf.u8(0xf2);
        self.rex(true, dst.index(), s);
        self.buf.u8(0x0f);
        self.buf.u8(0x2a);
        self.rm_reg(dst.index(), s);
    }

    fn set_cmp(&mut self, dst: Reg, cond: Cond, a: Reg, b: Reg) {
        self.cmp_rr_raw(a, b);
        self.setcc(Self::setcc_op(cond), dst);
    }

    fn fset_cmp(&mut self, dst: Reg, cond: FCond, a: FReg, b: FReg) {
        match cond {
            FCond::Gt => self.fcmp_above(dst, a, b, false),
            FCond::Ge => self.fcmp_above(dst, a, b, true),
            FCond::Lt => self.fcmp_above(dst, b, a, false),
            FCond::Le => self.fcmp_above(dst, b, a, true),
            FCond::Eq => {
                // ZF=1 and PF=0: equal and ordered
                self.ucomisd(a, b);
                self.setcc(0x94, dst); // sete
                self.setcc(0x9b, Reg::Scratch1); // setnp
                self.and_rr(dst, Reg::Scratch1);
            }
            FCond::Ne => {
                self.ucomisd(a, b);
                self.setcc(0x95, dst); // setne
                self.setcc(0x9a, Reg::Scratch1); // setp
                self.or_rr(dst, Reg::Scratch1);
            }
        }
    }

    fn br_cmp(&mut self, cond: Cond, a: Reg, b: Reg) -> Fixup {
        self.cmp_rr_raw(a, b);
        self.buf.u8(0x0f);
        self.buf.u8(Self::jcc_op(cond));
        let at = self.buf.len();
        self.buf.i32(0);
        Fixup { at }
    }

    fn br_cmp_imm(&mut self, cond: Cond, a: Reg, imm: i32) -> Fixup {
        let e = self.enc(a);
        self.rex(true, 0, e);
        self.buf.u8(0x81);
        self.rm_reg(7, e);
        self.buf.i32(imm);
        self.buf.u8(0x0f);
        self.buf.u8(Self::jcc_op(cond));
        let at = self.buf.len();
        self.buf.i32(0);
        Fixup { at }
    }

    fn br_fcmp(&mut self, cond: FCond, a: FReg, b: FReg) -> Fixup {
        // Materialize through Ret; clobbers Ret and Scratch1
        self.fset_cmp(Reg::Ret, cond, a, b);
        self.br_cmp_imm(Cond::Ne, Reg::Ret, 0)
    }

    fn jmp(&mut self) -> Fixup {
        self.buf.u8(0xe9);
        let at = self.buf.len();
        self.buf.i32(0);
        Fixup { at }
    }

    fn jmp_back(&mut self, target: usize) {
        self.buf.u8(0xe9);
        let disp = target as i64 - (self.buf.len() as i64 + 4);
        self.buf.i32(disp as i32);
    }

    fn patch_to_here(&mut self, fixup: Fixup) {
        let disp = self.buf.len() as i64 - (fixup.at as i64 + 4);
        self.buf.patch_u32_at(fixup.at, disp as i32 as u32);
    }

    fn call_symbol(&mut self, sym: &str) {
        let at = self.buf.len();
        self.buf.u8(0xe8);
        self.buf.i32(0);
        self.buf.record(sym, PatchKind::Call, at);
    }

    fn call_reg(&mut self, r: Reg) {
        let e = self.enc(r);
        if e >= 8 {
            self.rex(false, 0, e);
        }
        self.buf.u8(0xff);
        self.rm_reg(2, e);
    }

    fn lea_symbol(&mut self, dst: Reg, sym: &str) {
        let at = self.buf.len();
        let d = self.enc(dst);
        self.rex(true, d, 0);
        self.buf.u8(0x8d);
        self.modrm(0b00, d, 0b101); // RIP-relative
        self.buf.i32(0);
        self.buf.record(sym, PatchKind::Addr, at);
    }

    fn ret(&mut self) {
        self.buf.u8(0xc3);
    }

    fn set_fp_vararg_count(&mut self, n: u8) {
        self.buf.u8(0xb0); // mov al, imm8
        self.buf.u8(n);
    }

    fn prologue(&mut self, frame_size: u32, saves: &[Reg]) {
        debug_assert!(frame_size.is_multiple_of(16));
        self.buf.u8(0x55); // push rbp
        self.mov_rr(Reg::Fp, Reg::Sp);
        let total = frame_size + save_area(saves.len());
        if total > 0 {
            let d = self.enc(Reg::Sp);
            self.rex(true, 0, d);
            self.buf.u8(0x81);
            self.rm_reg(5, d); // sub rsp, imm32
            self.buf.i32(total as i32);
        }
        for (i, save) in saves.iter().enumerate() {
            self.store(Reg::Sp, 8 * i as i32, *save);
        }
    }

    fn epilogue(&mut self, frame_size: u32, saves: &[Reg]) {
        let _ = frame_size;
        for (i, save) in saves.iter().enumerate().rev() {
            self.load(*save, Reg::Sp, 8 * i as i32);
        }
        self.mov_rr(Reg::Sp, Reg::Fp);
        self.buf.u8(0x5d); // pop rbp
    }

    fn syscall(&mut self) {
        self.buf.u8(0x0f);
        self.buf.u8(0x05);
    }

    fn trap(&mut self) {
        self.buf.u8(0x0f);
        self.buf.u8(0x0b); // ud2
    }

    fn nop(&mut self) {
        self.buf.u8(0x90);
    }

    fn atomic_fetch_add(&mut self, base: Reg, src: Reg) {
        let (b, s) = (self.enc(base), self.enc(src));
        self.buf.u8(0xf0); // lock
        self.rex(true, s, b);
        self.buf.u8(0x0f);
        self.buf.u8(0xc1); // xadd
        self.rm_mem(s, b, 0);
    }

    fn atomic_xchg(&mut self, base: Reg, val: Reg) {
        let (b, v) = (self.enc(base), self.enc(val));
        // xchg with memory is implicitly locked
        self.rex(true, v, b);
        self.buf.u8(0x87);
        self.rm_mem(v, b, 0);
    }

    fn atomic_cas(&mut self, base: Reg, expected: Reg, new: Reg, out: Reg) {
        self.mov_rr(Reg::Ret, expected); // cmpxchg compares with rax
        let (b, n) = (self.enc(base), self.enc(new));
        self.buf.u8(0xf0);
        self.rex(true, n, b);
        self.buf.u8(0x0f);
        self.buf.u8(0xb1);
        self.rm_mem(n, b, 0);
        self.setcc(0x94, out); // sete
    }

    fn fence(&mut self) {
        self.buf.u8(0x0f);
        self.buf.u8(0xae);
        self.buf.u8(0xf0); // mfence
    }

    fn apply_patch(&self, code: &mut [u8], patch: &Patch, target: u64, place: u64) {
        match patch.kind {
            PatchKind::Call => {
                // e8 rel32: displacement is relative to the next instruction
                let disp = target as i64 - (place as i64 + 5);
                code[patch.at + 1..patch.at + 5]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
            PatchKind::Addr => {
                // REX 8d modrm disp32: 7-byte RIP-relative lea
                let disp = target as i64 - (place as i64 + 7);
                code[patch.at + 3..patch.at + 7]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
        }
    }
}

impl X86_64Emitter {
    /// Shift/rotate `dst` by `amount` using cl, preserving rcx through
    /// Scratch1. `dst` must not be rcx or r11.
    fn shift_by_reg(&mut self, ext: u8, dst: Reg, amount: Reg) {
        let rcx: u8 = 1;
        debug_assert!(self.enc(dst) != rcx && dst != Reg::Scratch1);
        // save rcx
        let s1 = self.enc(Reg::Scratch1);
        self.rex(true, rcx, s1);
        self.buf.u8(0x89);
        self.rm_reg(rcx, s1);
        // mov rcx, amount
        let a = self.enc(amount);
        self.rex(true, a, rcx);
        self.buf.u8(0x89);
        self.rm_reg(a, rcx);
        // d3 /ext dst
        let d = self.enc(dst);
        self.rex(true, 0, d);
        self.buf.u8(0xd3);
        self.rm_reg(ext, d);
        // restore rcx
        self.rex(true, s1, rcx);
        self.buf.u8(0x89);
        self.rm_reg(s1, rcx);
    }
}

/// Callee-save spill area rounded to 16 bytes.
fn save_area(n: usize) -> u32 {
    ((8 * n as u32) + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emitter::Emitter;

    fn em() -> X86_64Emitter {
        X86_64Emitter::new(false)
    }

    #[test]
    fn test_mov_rr_encoding() {
        let mut e = em();
        e.mov_rr(Reg::Ret, Reg::Arg0); // mov rax, rdi
        assert_eq!(e.code(), &[0x48, 0x89, 0xf8]);
    }

    #[test]
    fn test_mov_rr_same_reg_elided() {
        let mut e = em();
        e.mov_rr(Reg::Ret, Reg::Ret);
        assert!(e.code().is_empty());
    }

    #[test]
    fn test_mov_ri_small_and_large() {
        let mut e = em();
        e.mov_ri(Reg::Ret, 42); // mov rax, 42 -> 48 c7 c0 2a 00 00 00
        assert_eq!(e.code(), &[0x48, 0xc7, 0xc0, 0x2a, 0, 0, 0]);

        let mut e = em();
        e.mov_ri(Reg::Ret, 0x1_0000_0000); // movabs
        assert_eq!(&e.code()[..2], &[0x48, 0xb8]);
        assert_eq!(e.code().len(), 10);
    }

    #[test]
    fn test_load_from_frame() {
        let mut e = em();
        e.load(Reg::Ret, Reg::Fp, -16); // mov rax, [rbp-16]
        assert_eq!(e.code(), &[0x48, 0x8b, 0x85, 0xf0, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_store_via_sp_uses_sib() {
        let mut e = em();
        e.store(Reg::Sp, 8, Reg::Loop0); // mov [rsp+8], rbx
        assert_eq!(e.code(), &[0x48, 0x89, 0x9c, 0x24, 0x08, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_movsd_load() {
        let mut e = em();
        e.fload(FReg::F0, Reg::Fp, -16); // movsd xmm0, [rbp-16]
        assert_eq!(e.code(), &[0xf2, 0x0f, 0x10, 0x85, 0xf0, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_cvttsd2si() {
        let mut e = em();
        e.cvt_f2i(Reg::Ret, FReg::F0); // cvttsd2si rax, xmm0
        assert_eq!(e.code(), &[0xf2, 0x48, 0x0f, 0x2c, 0xc0]);
    }

    #[test]
    fn test_fadd() {
        let mut e = em();
        e.fadd(FReg::F0, FReg::F1); // addsd xmm0, xmm1
        assert_eq!(e.code(), &[0xf2, 0x0f, 0x58, 0xc1]);
    }

    #[test]
    fn test_branch_fixup_roundtrip() {
        let mut e = em();
        let fx = e.br_cmp(Cond::Eq, Reg::Ret, Reg::Loop0);
        e.nop();
        e.nop();
        e.patch_to_here(fx);
        // disp32 must equal 2 (the nops)
        let n = e.code().len();
        assert_eq!(&e.code()[n - 6..n - 2], &2i32.to_le_bytes());
    }

    #[test]
    fn test_jmp_back_disp() {
        let mut e = em();
        e.nop(); // target at 0
        let top = 0usize;
        e.jmp_back(top);
        // e9 xx: disp = 0 - (1 + 5) = -6
        assert_eq!(&e.code()[2..6], &(-6i32).to_le_bytes());
    }

    #[test]
    fn test_call_records_patch() {
        let mut e = em();
        e.call_symbol("malloc");
        let (code, patches) = e.take();
        assert_eq!(code[0], 0xe8);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].sym, "malloc");
        assert_eq!(patches[0].at, 0);
    }

    #[test]
    fn test_apply_call_patch() {
        let mut e = em();
        e.call_symbol("f");
        let (mut code, patches) = e.take();
        let em2 = em();
        em2.apply_patch(&mut code, &patches[0], 0x500000, 0x400000);
        let disp = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(disp as i64, 0x500000 - (0x400000 + 5));
    }

    #[test]
    fn test_lea_symbol_patch_applies() {
        let mut e = em();
        e.lea_symbol(Reg::Arg0, "str0");
        let (mut code, patches) = e.take();
        assert_eq!(code.len(), 7);
        let em2 = em();
        em2.apply_patch(&mut code, &patches[0], 0x401000, 0x400100);
        let disp = i32::from_le_bytes(code[3..7].try_into().unwrap());
        assert_eq!(disp as i64, 0x401000 - (0x400100 + 7));
    }

    #[test]
    fn test_prologue_epilogue_shapes() {
        let mut e = em();
        e.prologue(32, &[Reg::Loop0]);
        assert_eq!(e.code()[0], 0x55); // push rbp
        // mov rbp, rsp
        assert_eq!(&e.code()[1..4], &[0x48, 0x89, 0xe5]);
        // sub rsp, 48 (32 frame + 16 save area)
        assert_eq!(&e.code()[4..7], &[0x48, 0x81, 0xec]);
        assert_eq!(&e.code()[7..11], &48u32.to_le_bytes());

        let mut e2 = em();
        e2.epilogue(32, &[Reg::Loop0]);
        let code = e2.code();
        assert_eq!(code[code.len() - 1], 0x5d); // pop rbp
    }

    #[test]
    fn test_stack_alignment_total() {
        // odd number of saves still keeps a 16-byte-aligned reservation
        assert_eq!(save_area(1), 16);
        assert_eq!(save_area(2), 16);
        assert_eq!(save_area(3), 32);
        assert_eq!(save_area(0), 0);
    }

    #[test]
    fn test_windows_arg_mapping() {
        let mut e = X86_64Emitter::new(true);
        e.mov_rr(Reg::Arg0, Reg::Ret); // mov rcx, rax on win64
        assert_eq!(e.code(), &[0x48, 0x89, 0xc1]);
    }

    #[test]
    fn test_lock_xadd() {
        let mut e = em();
        e.atomic_fetch_add(Reg::Arg0, Reg::Ret);
        assert_eq!(e.code()[0], 0xf0); // lock prefix
        assert_eq!(&e.code()[2..4], &[0x0f, 0xc1]);
    }

    #[test]
    fn test_set_cmp_produces_01() {
        let mut e = em();
        e.set_cmp(Reg::Ret, Cond::Lt, Reg::Ret, Reg::Loop0);
        // cmp rax, rbx; setl al; movzx rax, al
        assert_eq!(&e.code()[..3], &[0x48, 0x39, 0xd8]);
        assert!(e.code().contains(&0x9c)); // setl
    }

    #[test]
    fn test_syscall_trap() {
        let mut e = em();
        e.syscall();
        e.trap();
        assert_eq!(e.code(), &[0x0f, 0x05, 0x0f, 0x0b]);
    }
}
