//! Runtime helpers, emitted once per binary
//!
//! The generated program has no linked-in runtime library; everything it
//! needs at run time is machine code this module emits through the
//! [`Emitter`] interface, shared by all call sites:
//!
//! - the meta-arena and bump allocator (`flap_meta_init`, `flap_alloc`,
//!   `flap_arena_alloc`, `flap_arena_push`/`pop`, `flap_arena_teardown`)
//! - string/list plumbing (`flap_string_concat`, `flap_cstr_to_string`,
//!   `flap_string_to_cstr`, `flap_cons`, `flap_tail`, `flap_slice`,
//!   `flap_index`)
//! - printing and number formatting (through libc `snprintf`/`printf`)
//! - error-code extraction for `or!` fallbacks and `.error`
//! - the parallel-loop worker trampoline and `flap_send`
//!
//! Helper ABI: pointer/integer arguments in `Arg0..`, doubles in `F0..`,
//! pointer results in `Ret`, double results in `F0`. Callee-saved registers
//! (`Loop0..2`, `VarCount`) carry values across libc calls; doubles that
//! must survive a call are spilled to the helper's own frame.
//!
//! libc is reached through the platform's dynamic linker (PLT stubs, GOT,
//! or import thunks); on Windows a 32-byte shadow-space adjustment wraps
//! every external call, and on macOS/ARM64 variadic arguments are staged
//! on the stack as the Apple ABI requires.

use super::emitter::{Cond, Emitter, FCond, FReg, Reg};
use super::rodata::RodataPool;
use super::symbols::SymbolTable;
use crate::types::{ERR_INDEX, ERR_NET, ERROR_NAN_HIGH};
use flap_object::Os;

// Meta-arena layout in the data section (symbol `flap_meta`).
pub const META_CURRENT: i32 = 0;
pub const META_DEPTH: i32 = 8;
pub const META_SLOTS: i32 = 16;
pub const META_MAX_ARENAS: i32 = 8;
pub const META_SIZE: usize = (META_SLOTS + 8 * META_MAX_ARENAS) as usize;

// Arena struct layout (heap-allocated).
const ARENA_BASE: i32 = 0;
const ARENA_USED: i32 = 8;
const ARENA_CAP: i32 = 16;
const ARENA_LOCK: i32 = 24;
const ARENA_STRUCT_SIZE: i64 = 32;

// Worker argument block layout (arena-allocated per thread).
pub const WORK_FN: i32 = 0;
pub const WORK_START: i32 = 8;
pub const WORK_END: i32 = 16;
pub const WORK_DONE: i32 = 24;
pub const WORK_ENV: i32 = 32;
pub const WORK_BLOCK_SIZE: i64 = 40;

/// Lowest double bit pattern treated as a heap pointer at runtime.
const PTR_MIN: i64 = 0x10000;
/// Pointers stay below 2^48.
const PTR_MAX: i64 = 1 << 48;

pub fn libc_name(os: Os) -> &'static str {
    match os {
        Os::Linux => "libc.so.6",
        Os::Darwin => "/usr/lib/libSystem.B.dylib",
        Os::Windows => "msvcrt.dll",
    }
}

pub fn pthread_lib(os: Os) -> &'static str {
    match os {
        Os::Linux => "libpthread.so.0",
        Os::Darwin => "/usr/lib/libSystem.B.dylib",
        Os::Windows => "kernel32.dll",
    }
}

pub struct RuntimeBuilder<'a> {
    pub em: &'a mut dyn Emitter,
    pub pool: &'a mut RodataPool,
    pub syms: &'a mut SymbolTable,
    pub os: Os,
    pub arena_capacity: u64,
}

impl<'a> RuntimeBuilder<'a> {
    /// Emit every helper. Call before lowering user code so that helper
    /// symbols exist for internal calls (order inside text is irrelevant;
    /// calls are patched).
    pub fn emit_all(&mut self) {
        self.meta_init();
        self.arena_alloc();
        self.alloc();
        self.arena_push();
        self.arena_pop();
        self.arena_teardown();
        self.cstr_to_string();
        self.string_to_cstr();
        self.string_concat();
        self.cons();
        self.tail();
        self.slice();
        self.index();
        self.map_get();
        self.number_to_cstr();
        self.number_to_string();
        self.value_to_string();
        self.error_cstr();
        self.error_string();
        self.print_cstr();
        self.print_number();
        self.print_string();
        self.print_value();
        self.worker();
        self.send();
    }

    fn begin(&mut self, name: &str, frame: u32, saves: &[Reg]) {
        self.em.align_to(16);
        let at = self.em.len() as u64;
        self.syms.define_text(name, at);
        self.em.prologue(frame, saves);
    }

    fn end(&mut self, frame: u32, saves: &[Reg]) {
        self.em.epilogue(frame, saves);
        self.em.ret();
    }

    /// Call into libc, importing the symbol and honoring the Windows
    /// shadow-space convention.
    fn call_c(&mut self, sym: &str) {
        self.syms.import(sym, libc_name(self.os));
        if self.os == Os::Windows {
            self.em.add_ri(Reg::Sp, -32);
            self.em.call_symbol(sym);
            self.em.add_ri(Reg::Sp, 32);
        } else {
            self.em.call_symbol(sym);
        }
    }

    /// Call another emitted helper.
    fn call(&mut self, sym: &str) {
        self.em.call_symbol(sym);
    }

    // -----------------------------------------------------------------
    // Arena
    // -----------------------------------------------------------------

    /// Create the base arena and register it in the meta-arena. Runs at
    /// program entry before any allocation.
    fn meta_init(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_meta_init", frame, &saves);
        // arena = malloc(sizeof struct)
        self.em.mov_ri(Reg::Arg0, ARENA_STRUCT_SIZE);
        self.call_c("malloc");
        self.em.mov_rr(Reg::Loop0, Reg::Ret);
        // base = malloc(capacity)
        self.em.mov_ri(Reg::Arg0, self.arena_capacity as i64);
        self.call_c("malloc");
        self.em.store(Reg::Loop0, ARENA_BASE, Reg::Ret);
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store(Reg::Loop0, ARENA_USED, Reg::Scratch1);
        self.em.store(Reg::Loop0, ARENA_LOCK, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, self.arena_capacity as i64);
        self.em.store(Reg::Loop0, ARENA_CAP, Reg::Scratch1);
        // meta: current = arena, depth = 1, slots[0] = arena
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.store(Reg::Scratch0, META_CURRENT, Reg::Loop0);
        self.em.store(Reg::Scratch0, META_SLOTS, Reg::Loop0);
        self.em.mov_ri(Reg::Scratch1, 1);
        self.em.store(Reg::Scratch0, META_DEPTH, Reg::Scratch1);
        self.end(frame, &saves);
    }

    /// `flap_arena_alloc(arena, size) -> ptr`. Bump-allocates 8-aligned;
    /// doubles capacity through realloc on overflow. A spin-lock on the
    /// `lock` word serializes parallel regions.
    fn arena_alloc(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1]);
        self.begin("flap_arena_alloc", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        // size aligned to 8
        self.em.add_ri(Reg::Arg1, 7);
        self.em.mov_ri(Reg::Scratch1, !7i64);
        self.em.and_rr(Reg::Arg1, Reg::Scratch1);
        self.em.mov_rr(Reg::Loop1, Reg::Arg1);

        // acquire: exchange 1 into the lock word until the old value is 0
        let spin = self.em.len();
        self.em.mov_rr(Reg::Scratch0, Reg::Loop0);
        self.em.add_ri(Reg::Scratch0, ARENA_LOCK);
        self.em.mov_ri(Reg::Scratch1, 1);
        self.em.atomic_xchg(Reg::Scratch0, Reg::Scratch1);
        let acquired = self.em.br_cmp_imm(Cond::Eq, Reg::Scratch1, 0);
        self.em.jmp_back(spin);
        self.em.patch_to_here(acquired);

        // new_used = used + size
        self.em.load(Reg::Scratch0, Reg::Loop0, ARENA_USED);
        self.em.add_rr(Reg::Scratch0, Reg::Loop1);
        self.em.load(Reg::Scratch1, Reg::Loop0, ARENA_CAP);
        let fits = self.em.br_cmp(Cond::Le, Reg::Scratch0, Reg::Scratch1);

        // grow: double until capacity covers new_used, then realloc
        let grow = self.em.len();
        self.em.shl_ri(Reg::Scratch1, 1);
        let grown = self.em.br_cmp(Cond::Le, Reg::Scratch0, Reg::Scratch1);
        self.em.jmp_back(grow);
        self.em.patch_to_here(grown);
        self.em.store(Reg::Loop0, ARENA_CAP, Reg::Scratch1);
        self.em.load(Reg::Arg0, Reg::Loop0, ARENA_BASE);
        self.em.mov_rr(Reg::Arg1, Reg::Scratch1);
        self.call_c("realloc");
        self.em.store(Reg::Loop0, ARENA_BASE, Reg::Ret);
        // recompute new_used, clobbered by the call
        self.em.load(Reg::Scratch0, Reg::Loop0, ARENA_USED);
        self.em.add_rr(Reg::Scratch0, Reg::Loop1);

        self.em.patch_to_here(fits);
        self.em.load(Reg::Ret, Reg::Loop0, ARENA_BASE);
        self.em.load(Reg::Scratch1, Reg::Loop0, ARENA_USED);
        self.em.add_rr(Reg::Ret, Reg::Scratch1);
        self.em.store(Reg::Loop0, ARENA_USED, Reg::Scratch0);
        // release
        self.em.fence();
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store(Reg::Loop0, ARENA_LOCK, Reg::Scratch1);
        self.end(frame, &saves);
    }

    /// `flap_alloc(size) -> ptr` from the current arena.
    fn alloc(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_alloc", frame, &saves);
        self.em.mov_rr(Reg::Arg1, Reg::Arg0);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.load(Reg::Arg0, Reg::Scratch0, META_CURRENT);
        self.call("flap_arena_alloc");
        self.end(frame, &saves);
    }

    /// Enter a scoped arena: fresh arena becomes current.
    fn arena_push(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_arena_push", frame, &saves);
        self.em.mov_ri(Reg::Arg0, ARENA_STRUCT_SIZE);
        self.call_c("malloc");
        self.em.mov_rr(Reg::Loop0, Reg::Ret);
        self.em.mov_ri(Reg::Arg0, self.arena_capacity as i64);
        self.call_c("malloc");
        self.em.store(Reg::Loop0, ARENA_BASE, Reg::Ret);
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store(Reg::Loop0, ARENA_USED, Reg::Scratch1);
        self.em.store(Reg::Loop0, ARENA_LOCK, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, self.arena_capacity as i64);
        self.em.store(Reg::Loop0, ARENA_CAP, Reg::Scratch1);
        // slots[depth] = arena; depth += 1; current = arena
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.load(Reg::Scratch1, Reg::Scratch0, META_DEPTH);
        self.em.mov_rr(Reg::Ret, Reg::Scratch1);
        self.em.shl_ri(Reg::Ret, 3);
        self.em.add_rr(Reg::Scratch0, Reg::Ret);
        self.em.store(Reg::Scratch0, META_SLOTS, Reg::Loop0);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.add_ri(Reg::Scratch1, 1);
        self.em.store(Reg::Scratch0, META_DEPTH, Reg::Scratch1);
        self.em.store(Reg::Scratch0, META_CURRENT, Reg::Loop0);
        self.end(frame, &saves);
    }

    /// Leave a scoped arena: free it and restore the previous one.
    fn arena_pop(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_arena_pop", frame, &saves);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.load(Reg::Loop0, Reg::Scratch0, META_CURRENT);
        // depth -= 1
        self.em.load(Reg::Scratch1, Reg::Scratch0, META_DEPTH);
        self.em.add_ri(Reg::Scratch1, -1);
        self.em.store(Reg::Scratch0, META_DEPTH, Reg::Scratch1);
        // free(base); free(arena)
        self.em.load(Reg::Arg0, Reg::Loop0, ARENA_BASE);
        self.call_c("free");
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.call_c("free");
        // current = slots[depth - 1]
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.load(Reg::Scratch1, Reg::Scratch0, META_DEPTH);
        self.em.add_ri(Reg::Scratch1, -1);
        self.em.shl_ri(Reg::Scratch1, 3);
        self.em.add_rr(Reg::Scratch0, Reg::Scratch1);
        self.em.load(Reg::Ret, Reg::Scratch0, META_SLOTS);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.store(Reg::Scratch0, META_CURRENT, Reg::Ret);
        self.end(frame, &saves);
    }

    /// Free every live arena; the last action before exit.
    fn arena_teardown(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1]);
        self.begin("flap_arena_teardown", frame, &saves);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.load(Reg::Loop0, Reg::Scratch0, META_DEPTH);
        let top = self.em.len();
        let done = self.em.br_cmp_imm(Cond::Le, Reg::Loop0, 0);
        self.em.add_ri(Reg::Loop0, -1);
        self.em.lea_symbol(Reg::Scratch0, "flap_meta");
        self.em.mov_rr(Reg::Scratch1, Reg::Loop0);
        self.em.shl_ri(Reg::Scratch1, 3);
        self.em.add_rr(Reg::Scratch0, Reg::Scratch1);
        self.em.load(Reg::Loop1, Reg::Scratch0, META_SLOTS);
        self.em.load(Reg::Arg0, Reg::Loop1, ARENA_BASE);
        self.call_c("free");
        self.em.mov_rr(Reg::Arg0, Reg::Loop1);
        self.call_c("free");
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.end(frame, &saves);
    }

    // -----------------------------------------------------------------
    // Strings and lists
    // -----------------------------------------------------------------

    /// `flap_cstr_to_string(cstr) -> ptr`: one entry per byte.
    fn cstr_to_string(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2]);
        self.begin("flap_cstr_to_string", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.call_c("strlen");
        self.em.mov_rr(Reg::Loop1, Reg::Ret);
        // alloc 8 + 16n
        self.em.mov_rr(Reg::Arg0, Reg::Loop1);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop2, Reg::Ret);
        self.em.cvt_i2f(FReg::F0, Reg::Loop1);
        self.em.fstore(Reg::Loop2, 0, FReg::F0);
        // per-byte fill
        self.em.mov_ri(Reg::Scratch0, 0);
        let top = self.em.len();
        let done = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Loop1);
        self.em.mov_rr(Reg::Ret, Reg::Loop0);
        self.em.add_rr(Reg::Ret, Reg::Scratch0);
        self.em.load_u8(Reg::Scratch1, Reg::Ret, 0);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0);
        self.em.shl_ri(Reg::Ret, 4);
        self.em.add_rr(Reg::Ret, Reg::Loop2);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
        self.em.fstore(Reg::Ret, 8, FReg::F0);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch1);
        self.em.fstore(Reg::Ret, 16, FReg::F0);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.end(frame, &saves);
    }

    /// `flap_string_to_cstr(s) -> cstr` in a fresh arena block.
    fn string_to_cstr(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2]);
        self.begin("flap_string_to_cstr", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.em.fload(FReg::F0, Reg::Loop0, 0);
        self.em.cvt_f2i(Reg::Loop1, FReg::F0);
        self.em.mov_rr(Reg::Arg0, Reg::Loop1);
        self.em.add_ri(Reg::Arg0, 1);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop2, Reg::Ret);
        self.em.mov_ri(Reg::Scratch0, 0);
        let top = self.em.len();
        let done = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Loop1);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0);
        self.em.shl_ri(Reg::Ret, 4);
        self.em.add_rr(Reg::Ret, Reg::Loop0);
        self.em.fload(FReg::F0, Reg::Ret, 16);
        self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.em.add_rr(Reg::Ret, Reg::Scratch0);
        self.em.store_u8(Reg::Ret, 0, Reg::Scratch1);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        // trailing null
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.em.add_rr(Reg::Ret, Reg::Loop1);
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store_u8(Reg::Ret, 0, Reg::Scratch1);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.end(frame, &saves);
    }

    /// `flap_string_concat(a, b) -> ptr`: `8 + 16·(lenA+lenB)` bytes, A's
    /// entries verbatim, B's renumbered from lenA. Lists use it too; the
    /// layouts are identical.
    fn string_concat(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2, Reg::VarCount]);
        self.begin("flap_string_concat", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.em.mov_rr(Reg::Loop1, Reg::Arg1);
        self.em.fload(FReg::F0, Reg::Loop0, 0);
        self.em.cvt_f2i(Reg::VarCount, FReg::F0); // lenA
        self.em.fload(FReg::F1, Reg::Loop1, 0);
        self.em.cvt_f2i(Reg::Scratch0, FReg::F1); // lenB
        self.em.mov_rr(Reg::Arg0, Reg::VarCount);
        self.em.add_rr(Reg::Arg0, Reg::Scratch0);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop2, Reg::Ret);
        // count = lenA + lenB
        self.em.fload(FReg::F0, Reg::Loop0, 0);
        self.em.fload(FReg::F1, Reg::Loop1, 0);
        self.em.fadd(FReg::F0, FReg::F1);
        self.em.fstore(Reg::Loop2, 0, FReg::F0);
        // copy A
        self.em.mov_ri(Reg::Scratch0, 0);
        let top_a = self.em.len();
        let done_a = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::VarCount);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0);
        self.em.shl_ri(Reg::Ret, 4);
        self.em.mov_rr(Reg::Scratch1, Reg::Ret);
        self.em.add_rr(Reg::Ret, Reg::Loop0);
        self.em.add_rr(Reg::Scratch1, Reg::Loop2);
        self.em.fload(FReg::F0, Reg::Ret, 16);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch0);
        self.em.fstore(Reg::Scratch1, 8, FReg::F1);
        self.em.fstore(Reg::Scratch1, 16, FReg::F0);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top_a);
        self.em.patch_to_here(done_a);
        // copy B, keys starting at lenA
        self.em.mov_ri(Reg::Scratch0, 0);
        let top_b = self.em.len();
        self.em.fload(FReg::F1, Reg::Loop1, 0);
        self.em.cvt_f2i(Reg::Ret, FReg::F1);
        let done_b = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Ret);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Loop1);
        self.em.fload(FReg::F0, Reg::Scratch1, 16);
        self.em.mov_rr(Reg::Ret, Reg::VarCount);
        self.em.add_rr(Reg::Ret, Reg::Scratch0);
        self.em.mov_rr(Reg::Scratch1, Reg::Ret);
        self.em.cvt_i2f(FReg::F1, Reg::Ret);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Loop2);
        self.em.fstore(Reg::Scratch1, 8, FReg::F1);
        self.em.fstore(Reg::Scratch1, 16, FReg::F0);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top_b);
        self.em.patch_to_here(done_b);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.end(frame, &saves);
    }

    /// `flap_cons(head in F0, list) -> ptr`.
    fn cons(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2]);
        self.begin("flap_cons", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.em.fstore(Reg::Fp, -16, FReg::F0); // head survives the alloc
        self.em.fload(FReg::F1, Reg::Loop0, 0);
        self.em.cvt_f2i(Reg::Loop1, FReg::F1); // n
        self.em.mov_rr(Reg::Arg0, Reg::Loop1);
        self.em.add_ri(Reg::Arg0, 1);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop2, Reg::Ret);
        self.em.mov_rr(Reg::Scratch1, Reg::Loop1);
        self.em.add_ri(Reg::Scratch1, 1);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch1);
        self.em.fstore(Reg::Loop2, 0, FReg::F0);
        // entry 0 = head
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch1);
        self.em.fstore(Reg::Loop2, 8, FReg::F1);
        self.em.fload(FReg::F0, Reg::Fp, -16);
        self.em.fstore(Reg::Loop2, 16, FReg::F0);
        // entries 1..=n copy from the old list, keys shifted by one
        self.em.mov_ri(Reg::Scratch0, 0);
        let top = self.em.len();
        let done = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Loop1);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0);
        self.em.shl_ri(Reg::Ret, 4);
        self.em.add_rr(Reg::Ret, Reg::Loop0);
        self.em.fload(FReg::F0, Reg::Ret, 16);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0);
        self.em.add_ri(Reg::Ret, 1);
        self.em.mov_rr(Reg::Scratch1, Reg::Ret);
        self.em.cvt_i2f(FReg::F1, Reg::Ret);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Loop2);
        self.em.fstore(Reg::Scratch1, 8, FReg::F1);
        self.em.fstore(Reg::Scratch1, 16, FReg::F0);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.end(frame, &saves);
    }

    /// `flap_tail(list) -> ptr`: everything but entry 0, renumbered.
    fn tail(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_tail", frame, &saves);
        // tail == slice(list, 1, n)
        self.em.fload(FReg::F0, Reg::Arg0, 0);
        self.em.cvt_f2i(Reg::Arg2, FReg::F0);
        self.em.mov_ri(Reg::Arg1, 1);
        self.call("flap_slice");
        self.end(frame, &saves);
    }

    /// `flap_slice(list, start, end) -> ptr`, clamped, renumbered from 0.
    fn slice(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2, Reg::VarCount]);
        self.begin("flap_slice", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.em.mov_rr(Reg::Loop1, Reg::Arg1); // start
        self.em.mov_rr(Reg::VarCount, Reg::Arg2); // end
        // clamp: start < 0 -> 0; end > n -> n; end < start -> start
        self.em.fload(FReg::F0, Reg::Loop0, 0);
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0); // n
        let start_ok = self.em.br_cmp_imm(Cond::Ge, Reg::Loop1, 0);
        self.em.mov_ri(Reg::Loop1, 0);
        self.em.patch_to_here(start_ok);
        let end_ok = self.em.br_cmp(Cond::Le, Reg::VarCount, Reg::Scratch0);
        self.em.mov_rr(Reg::VarCount, Reg::Scratch0);
        self.em.patch_to_here(end_ok);
        let order_ok = self.em.br_cmp(Cond::Ge, Reg::VarCount, Reg::Loop1);
        self.em.mov_rr(Reg::VarCount, Reg::Loop1);
        self.em.patch_to_here(order_ok);
        // alloc 8 + 16*(end-start)
        self.em.mov_rr(Reg::Arg0, Reg::VarCount);
        self.em.sub_rr(Reg::Arg0, Reg::Loop1);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop2, Reg::Ret);
        self.em.mov_rr(Reg::Scratch1, Reg::VarCount);
        self.em.sub_rr(Reg::Scratch1, Reg::Loop1);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch1);
        self.em.fstore(Reg::Loop2, 0, FReg::F0);
        // copy
        self.em.mov_ri(Reg::Scratch0, 0); // output index
        let top = self.em.len();
        self.em.mov_rr(Reg::Ret, Reg::Loop1);
        self.em.add_rr(Reg::Ret, Reg::Scratch0); // source index
        let done = self.em.br_cmp(Cond::Ge, Reg::Ret, Reg::VarCount);
        self.em.shl_ri(Reg::Ret, 4);
        self.em.add_rr(Reg::Ret, Reg::Loop0);
        self.em.fload(FReg::F0, Reg::Ret, 16);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch0);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Loop2);
        self.em.fstore(Reg::Scratch1, 8, FReg::F1);
        self.em.fstore(Reg::Scratch1, 16, FReg::F0);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.end(frame, &saves);
    }

    /// `flap_index(list, index in F0) -> F0`: bounds-checked; out of range
    /// yields the `"idx "` error Result.
    fn index(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_index", frame, &saves);
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        self.em.fload(FReg::F1, Reg::Arg0, 0);
        self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
        let neg = self.em.br_cmp_imm(Cond::Lt, Reg::Scratch0, 0);
        let high = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Scratch1);
        self.em.shl_ri(Reg::Scratch0, 4);
        self.em.add_rr(Reg::Scratch0, Reg::Arg0);
        self.em.fload(FReg::F0, Reg::Scratch0, 16);
        let ok = self.em.jmp();
        self.em.patch_to_here(neg);
        self.em.patch_to_here(high);
        self.em.fconst(FReg::F0, f64::from_bits(ERR_INDEX.to_bits()));
        self.em.patch_to_here(ok);
        self.end(frame, &saves);
    }

    /// `flap_map_get(map, key in F0) -> F0`: first entry whose key equals
    /// the probe (insertion order, though nothing depends on it); absent
    /// keys yield the `"key "` error Result.
    fn map_get(&mut self) {
        // br_fcmp may clobber Ret and Scratch1; the loop state lives in
        // Loop0 (index) and Loop1 (count) instead.
        let (frame, saves) = (16u32, [Reg::Loop0, Reg::Loop1]);
        self.begin("flap_map_get", frame, &saves);
        self.em.fload(FReg::F1, Reg::Arg0, 0);
        self.em.cvt_f2i(Reg::Loop1, FReg::F1); // n
        self.em.mov_ri(Reg::Loop0, 0);
        let top = self.em.len();
        let missing = self.em.br_cmp(Cond::Ge, Reg::Loop0, Reg::Loop1);
        self.em.mov_rr(Reg::Scratch0, Reg::Loop0);
        self.em.shl_ri(Reg::Scratch0, 4);
        self.em.add_rr(Reg::Scratch0, Reg::Arg0);
        self.em.fload(FReg::F1, Reg::Scratch0, 8);
        let next = self.em.br_fcmp(FCond::Ne, FReg::F1, FReg::F0);
        // recompute the entry address: the compare may have used Scratch0's
        // neighbors but Scratch0 itself is intact only on some targets
        self.em.mov_rr(Reg::Scratch0, Reg::Loop0);
        self.em.shl_ri(Reg::Scratch0, 4);
        self.em.add_rr(Reg::Scratch0, Reg::Arg0);
        self.em.fload(FReg::F0, Reg::Scratch0, 16);
        let found = self.em.jmp();
        self.em.patch_to_here(next);
        self.em.add_ri(Reg::Loop0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(missing);
        self.em.fconst(FReg::F0, f64::from_bits(crate::types::ERR_KEY.to_bits()));
        self.em.patch_to_here(found);
        self.end(frame, &saves);
    }

    // -----------------------------------------------------------------
    // Number formatting and printing
    // -----------------------------------------------------------------

    fn int_format(&self) -> &'static str {
        if self.os == Os::Windows { "%lld" } else { "%ld" }
    }

    /// Stage one 8-byte variadic GPR argument per the target's varargs
    /// convention around a libc call (Apple ARM64 wants it on the stack;
    /// Win64 wants it in the 4th slot; SysV takes registers as usual).
    fn vararg_slot_gpr(&mut self, value: Reg, sysv_slot: Reg) {
        match self.os {
            Os::Darwin => {
                self.em.add_ri(Reg::Sp, -16);
                self.em.store(Reg::Sp, 0, value);
            }
            _ => self.em.mov_rr(sysv_slot, value),
        }
    }

    fn vararg_unstage(&mut self) {
        if self.os == Os::Darwin {
            self.em.add_ri(Reg::Sp, 16);
        }
    }

    /// `flap_number_to_cstr(F0) -> cstr`: `%ld` when the value is an exact
    /// integer, `%g` otherwise.
    fn number_to_cstr(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_number_to_cstr", frame, &saves);
        self.em.fstore(Reg::Fp, -16, FReg::F0);
        self.em.mov_ri(Reg::Arg0, 40);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop0, Reg::Ret);
        self.em.fload(FReg::F0, Reg::Fp, -16);
        // integral iff (double)(long)v == v
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch0);
        let float_path = self.em.br_fcmp(FCond::Ne, FReg::F0, FReg::F1);
        // snprintf(buf, 40, "%ld", (long)v)
        let fmt_int = self.pool.cstr(self.int_format());
        self.em.fload(FReg::F0, Reg::Fp, -16);
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.em.mov_ri(Reg::Arg1, 40);
        self.em.lea_symbol(Reg::Arg2, &fmt_int);
        self.vararg_slot_gpr(Reg::Scratch0, Reg::Arg3);
        self.em.set_fp_vararg_count(0);
        self.call_c(self.snprintf_name());
        self.vararg_unstage();
        let done = self.em.jmp();
        // snprintf(buf, 40, "%g", v)
        self.em.patch_to_here(float_path);
        let fmt_g = self.pool.cstr("%g");
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.em.mov_ri(Reg::Arg1, 40);
        self.em.lea_symbol(Reg::Arg2, &fmt_g);
        self.em.fload(FReg::F0, Reg::Fp, -16);
        match self.os {
            Os::Darwin => {
                self.em.add_ri(Reg::Sp, -16);
                self.em.fstore(Reg::Sp, 0, FReg::F0);
            }
            Os::Windows => {
                // 4th slot: xmm3, mirrored in the integer register
                self.em.fmov(FReg::F3, FReg::F0);
                self.em.fmov_to_gpr(Reg::Arg3, FReg::F0);
            }
            Os::Linux => {
                self.em.set_fp_vararg_count(1);
            }
        }
        self.call_c(self.snprintf_name());
        self.vararg_unstage();
        self.em.patch_to_here(done);
        self.em.mov_rr(Reg::Ret, Reg::Loop0);
        self.end(frame, &saves);
    }

    fn snprintf_name(&self) -> &'static str {
        if self.os == Os::Windows { "_snprintf" } else { "snprintf" }
    }

    fn number_to_string(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_number_to_string", frame, &saves);
        self.call("flap_number_to_cstr");
        self.em.mov_rr(Reg::Arg0, Reg::Ret);
        self.call("flap_cstr_to_string");
        self.end(frame, &saves);
    }

    /// `flap_value_to_string(F0) -> ptr`: runtime dispatch for values whose
    /// semantic type the compiler could not pin down — error codes become
    /// their 4-character string, heap pointers pass through, numbers
    /// format.
    fn value_to_string(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_value_to_string", frame, &saves);
        self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shr_ri(Reg::Scratch1, 32);
        let not_err = self.em.br_cmp_imm(Cond::Ne, Reg::Scratch1, ERROR_NAN_HIGH as i32);
        self.em.mov_ri(Reg::Scratch1, 0xffff_ffff);
        self.em.and_rr(Reg::Scratch1, Reg::Scratch0);
        let not_err2 = self.em.br_cmp_imm(Cond::Eq, Reg::Scratch1, 0);
        self.call("flap_error_string");
        let out1 = self.em.jmp();
        self.em.patch_to_here(not_err);
        self.em.patch_to_here(not_err2);
        self.em.mov_ri(Reg::Scratch1, PTR_MIN);
        let number1 = self.em.br_cmp(Cond::Lt, Reg::Scratch0, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, PTR_MAX);
        let number2 = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Scratch1);
        self.em.mov_rr(Reg::Ret, Reg::Scratch0); // already a heap string
        let out2 = self.em.jmp();
        self.em.patch_to_here(number1);
        self.em.patch_to_here(number2);
        self.call("flap_number_to_string");
        self.em.patch_to_here(out1);
        self.em.patch_to_here(out2);
        self.end(frame, &saves);
    }

    /// `flap_error_cstr(F0) -> cstr`: the 4-character code, or "" when the
    /// value is not an error.
    fn error_cstr(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_error_cstr", frame, &saves);
        self.em.fstore(Reg::Fp, -16, FReg::F0);
        self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shr_ri(Reg::Scratch1, 32);
        let not_err = self.em.br_cmp_imm(Cond::Ne, Reg::Scratch1, ERROR_NAN_HIGH as i32);
        // low word zero means a canonical NaN, not an error
        self.em.mov_ri(Reg::Scratch1, 0xffff_ffff);
        self.em.and_rr(Reg::Scratch1, Reg::Scratch0);
        let not_err2 = self.em.br_cmp_imm(Cond::Eq, Reg::Scratch1, 0);
        self.em.mov_ri(Reg::Arg0, 8);
        self.call("flap_alloc");
        self.em.mov_rr(Reg::Loop0, Reg::Ret);
        self.em.fload(FReg::F0, Reg::Fp, -16);
        self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
        for k in 0..4 {
            self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
            self.em.shr_ri(Reg::Scratch1, 8 * k);
            self.em.store_u8(Reg::Loop0, k as i32, Reg::Scratch1);
        }
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store_u8(Reg::Loop0, 4, Reg::Scratch1);
        self.em.mov_rr(Reg::Ret, Reg::Loop0);
        let out = self.em.jmp();
        self.em.patch_to_here(not_err);
        self.em.patch_to_here(not_err2);
        let empty = self.pool.cstr("");
        self.em.lea_symbol(Reg::Ret, &empty);
        self.em.patch_to_here(out);
        self.end(frame, &saves);
    }

    fn error_string(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_error_string", frame, &saves);
        self.call("flap_error_cstr");
        self.em.mov_rr(Reg::Arg0, Reg::Ret);
        self.call("flap_cstr_to_string");
        self.end(frame, &saves);
    }

    /// `flap_print_cstr(cstr, newline)`.
    fn print_cstr(&mut self) {
        let (frame, saves) = (16u32, []);
        self.begin("flap_print_cstr", frame, &saves);
        let plain = self.em.br_cmp_imm(Cond::Eq, Reg::Arg1, 0);
        self.call_c("puts");
        let done = self.em.jmp();
        self.em.patch_to_here(plain);
        let fmt = self.pool.cstr("%s");
        self.vararg_slot_gpr(Reg::Arg0, Reg::Arg1);
        self.em.lea_symbol(Reg::Arg0, &fmt);
        self.em.set_fp_vararg_count(0);
        self.call_c("printf");
        self.vararg_unstage();
        self.em.patch_to_here(done);
        self.end(frame, &saves);
    }

    /// `flap_print_number(F0, newline in Arg1)`.
    fn print_number(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_print_number", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg1);
        self.call("flap_number_to_cstr");
        self.em.mov_rr(Reg::Arg0, Reg::Ret);
        self.em.mov_rr(Reg::Arg1, Reg::Loop0);
        self.call("flap_print_cstr");
        self.end(frame, &saves);
    }

    /// `flap_print_string(s, newline in Arg1)`.
    fn print_string(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_print_string", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg1);
        self.call("flap_string_to_cstr");
        self.em.mov_rr(Reg::Arg0, Reg::Ret);
        self.em.mov_rr(Reg::Arg1, Reg::Loop0);
        self.call("flap_print_cstr");
        self.end(frame, &saves);
    }

    /// `flap_print_value(F0, newline in Arg1)`: runtime dispatch for
    /// unknown-typed values — error code, heap string, or number.
    fn print_value(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_print_value", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg1); // newline flag survives calls
        self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
        // error NaN?
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shr_ri(Reg::Scratch1, 32);
        let not_err = self.em.br_cmp_imm(Cond::Ne, Reg::Scratch1, ERROR_NAN_HIGH as i32);
        self.em.mov_ri(Reg::Scratch1, 0xffff_ffff);
        self.em.and_rr(Reg::Scratch1, Reg::Scratch0);
        let not_err2 = self.em.br_cmp_imm(Cond::Eq, Reg::Scratch1, 0);
        self.call("flap_error_string");
        self.em.mov_rr(Reg::Arg0, Reg::Ret);
        self.em.mov_rr(Reg::Arg1, Reg::Loop0);
        self.call("flap_print_string");
        let out1 = self.em.jmp();
        self.em.patch_to_here(not_err);
        self.em.patch_to_here(not_err2);
        // plausible pointer?
        self.em.mov_ri(Reg::Scratch1, PTR_MIN);
        let number1 = self.em.br_cmp(Cond::Lt, Reg::Scratch0, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, PTR_MAX);
        let number2 = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Scratch1);
        self.em.mov_rr(Reg::Arg0, Reg::Scratch0);
        self.em.mov_rr(Reg::Arg1, Reg::Loop0);
        self.call("flap_print_string");
        let out2 = self.em.jmp();
        self.em.patch_to_here(number1);
        self.em.patch_to_here(number2);
        self.em.mov_rr(Reg::Arg1, Reg::Loop0);
        self.call("flap_print_number");
        self.em.patch_to_here(out1);
        self.em.patch_to_here(out2);
        self.end(frame, &saves);
    }

    // -----------------------------------------------------------------
    // Parallel loops and channels
    // -----------------------------------------------------------------

    /// Thread entry: unpack the argument block, run the compiled body,
    /// then decrement the countdown barrier.
    fn worker(&mut self) {
        let (frame, saves) = (16u32, [Reg::Loop0]);
        self.begin("flap_worker", frame, &saves);
        self.em.mov_rr(Reg::Loop0, Reg::Arg0);
        self.em.load(Reg::Scratch1, Reg::Loop0, WORK_FN);
        self.em.load(Reg::Arg1, Reg::Loop0, WORK_START);
        self.em.load(Reg::Arg2, Reg::Loop0, WORK_END);
        self.em.load(Reg::Scratch0, Reg::Loop0, WORK_ENV);
        self.em.call_reg(Reg::Scratch1);
        // barrier: *done -= 1
        self.em.load(Reg::Scratch0, Reg::Loop0, WORK_DONE);
        self.em.mov_ri(Reg::Scratch1, -1);
        self.em.atomic_fetch_add(Reg::Scratch0, Reg::Scratch1);
        self.em.mov_ri(Reg::Ret, 0);
        self.end(frame, &saves);
    }

    /// `flap_send(port, cstr)`: one-shot TCP send to 127.0.0.1:port.
    /// Returns 0.0, or the `"net "` error Result when the socket cannot be
    /// opened. Not wired up on Windows (needs WSAStartup); it returns the
    /// error there unconditionally.
    fn send(&mut self) {
        let (frame, saves) = (32u32, [Reg::Loop0, Reg::Loop1, Reg::Loop2]);
        self.begin("flap_send", frame, &saves);
        if self.os == Os::Windows {
            self.em.fconst(FReg::F0, f64::from_bits(ERR_NET.to_bits()));
            self.end(frame, &saves);
            return;
        }
        self.em.mov_rr(Reg::Loop2, Reg::Arg0); // port
        self.em.mov_rr(Reg::Loop1, Reg::Arg1); // cstr
        // socket(AF_INET, SOCK_STREAM, 0)
        self.em.mov_ri(Reg::Arg0, 2);
        self.em.mov_ri(Reg::Arg1, 1);
        self.em.mov_ri(Reg::Arg2, 0);
        self.call_c("socket");
        self.em.mov_rr(Reg::Loop0, Reg::Ret);
        let sock_ok = self.em.br_cmp_imm(Cond::Ge, Reg::Loop0, 0);
        self.em.fconst(FReg::F0, f64::from_bits(ERR_NET.to_bits()));
        self.end(frame, &saves);

        self.em.patch_to_here(sock_ok);
        // sockaddr_in { AF_INET, htons(port), 127.0.0.1, zero pad }
        self.em.mov_rr(Reg::Ret, Reg::Loop2);
        self.em.shl_ri(Reg::Ret, 8);
        self.em.mov_rr(Reg::Scratch1, Reg::Loop2);
        self.em.shr_ri(Reg::Scratch1, 8);
        self.em.or_rr(Reg::Ret, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, 0xffff);
        self.em.and_rr(Reg::Ret, Reg::Scratch1);
        self.em.shl_ri(Reg::Ret, 16);
        self.em.add_ri(Reg::Ret, 2);
        self.em.mov_ri(Reg::Scratch1, 0x0100_007f);
        self.em.shl_ri(Reg::Scratch1, 32);
        self.em.or_rr(Reg::Ret, Reg::Scratch1);
        self.em.store(Reg::Fp, -16, Reg::Ret);
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.store(Reg::Fp, -8, Reg::Scratch1);
        // connect(fd, &addr, 16)
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.em.mov_rr(Reg::Arg1, Reg::Fp);
        self.em.add_ri(Reg::Arg1, -16);
        self.em.mov_ri(Reg::Arg2, 16);
        self.call_c("connect");
        // write(fd, cstr, strlen(cstr))
        self.em.mov_rr(Reg::Arg0, Reg::Loop1);
        self.call_c("strlen");
        self.em.mov_rr(Reg::Arg2, Reg::Ret);
        self.em.mov_rr(Reg::Arg1, Reg::Loop1);
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.call_c("write");
        self.em.mov_rr(Reg::Arg0, Reg::Loop0);
        self.call_c("close");
        self.em.fconst(FReg::F0, 0.0);
        self.end(frame, &saves);
    }
}
