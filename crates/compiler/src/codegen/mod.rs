//! Direct code generation
//!
//! One walk over the resolved AST produces machine code, rodata, and the
//! patch list; there is no intermediate representation. The walk is split
//! across focused submodules:
//!
//! - `emitter.rs` — the ISA-neutral instruction interface and patch records
//! - `x86_64.rs` / `arm64.rs` / `riscv64.rs` — per-ISA encoders
//! - `rodata.rs` — literal pooling in the universal value layout
//! - `symbols.rs` — symbol table and patch resolution
//! - `runtime.rs` — arena, string, printing, and thread helpers emitted as
//!   machine code
//! - `expr.rs` — expression lowering (result in `F0`)
//! - `stmt.rs` — statements, assignment forms, defer
//! - `control_flow.rs` — match and loop lowering, parallel loops
//! - `lambda.rs` — lambda bodies, closures, variadic prologues
//!
//! Register conventions: `F0` carries the current expression result with
//! `F1`/`F2` scratch; loop counters claim `Loop0..Loop2` and spill beyond
//! three levels; `VarCount` carries argument counts at call boundaries;
//! `Scratch0` carries the closure environment pointer.

pub mod arm64;
pub mod emitter;
pub mod riscv64;
pub mod rodata;
pub mod runtime;
pub mod symbols;
pub mod x86_64;

mod control_flow;
mod expr;
mod lambda;
mod stmt;

use crate::ast::{Expr, LambdaExpr, LoopStmt, Program, Stmt};
use crate::config::CompilerConfig;
use crate::error::{CompileError, Result};
use crate::resolver::{FrameInfo, MAIN_FRAME, ResolvedProgram};
use emitter::{Emitter, FReg, Fixup, Patch, Reg};
use flap_object::{Arch, Os, Target};
use rodata::RodataPool;
use runtime::{META_SIZE, RuntimeBuilder, libc_name};
use std::collections::HashMap;
use symbols::SymbolTable;

/// Callee-saved registers every generated function preserves; the loop
/// counter tiers plus the call-boundary conventions.
pub(crate) const SAVED_REGS: [Reg; 5] =
    [Reg::Loop0, Reg::Loop1, Reg::Loop2, Reg::VarCount, Reg::Plat];

/// Where a loop keeps its counter.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CounterLoc {
    Reg(Reg),
    /// Frame slot, for nesting deeper than three levels.
    Slot(i32),
}

pub(crate) struct LoopCtx {
    pub counter: CounterLoc,
    pub exit_fixups: Vec<Fixup>,
}

/// Output of code generation: sections plus the still-unresolved patch
/// list. The driver asks the writer for a layout, resolves patches, then
/// writes the final image.
#[derive(Debug)]
pub struct Module {
    pub target: Target,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    pub symbols: SymbolTable,
    pub patches: Vec<Patch>,
}

pub struct CodeGen<'a> {
    pub(crate) em: Box<dyn Emitter>,
    pub(crate) pool: RodataPool,
    pub(crate) syms: SymbolTable,
    pub(crate) target: Target,
    pub(crate) config: &'a CompilerConfig,
    pub(crate) frames: HashMap<usize, FrameInfo>,
    pub(crate) cur_frame: usize,
    /// Next free expression temp slot in the current frame.
    pub(crate) temp_idx: u32,
    pub(crate) loops: Vec<LoopCtx>,
    /// Compile-time defer stack of the current function.
    pub(crate) defers: Vec<Expr>,
    /// `ret` sites waiting for the function's single epilogue.
    pub(crate) ret_jumps: Vec<Fixup>,
    /// Lambdas and parallel-loop bodies queued for emission after the
    /// current walk (they are separate functions, never nested inline).
    pub(crate) pending_lambdas: Vec<LambdaExpr>,
    pub(crate) pending_workers: Vec<LoopStmt>,
}

fn emitter_for(target: Target) -> Box<dyn Emitter> {
    match target.arch {
        Arch::Amd64 => Box::new(x86_64::X86_64Emitter::new(target.os == Os::Windows)),
        Arch::Arm64 => Box::new(arm64::Arm64Emitter::new()),
        Arch::Riscv64 => Box::new(riscv64::Riscv64Emitter::new()),
    }
}

/// Generate a module from a resolved program.
pub fn generate(
    program: &Program,
    resolved: &ResolvedProgram,
    config: &CompilerConfig,
) -> Result<Module> {
    let target = config.target;
    let mut cg = CodeGen {
        em: emitter_for(target),
        pool: RodataPool::new(),
        syms: SymbolTable::new(),
        target,
        config,
        frames: resolved.frames.clone(),
        cur_frame: MAIN_FRAME,
        temp_idx: 0,
        loops: Vec::new(),
        defers: Vec::new(),
        ret_jumps: Vec::new(),
        pending_lambdas: Vec::new(),
        pending_workers: Vec::new(),
    };

    // Mutable globals: the meta-arena block.
    cg.syms.define_data("flap_meta", 0);
    let data = vec![0u8; META_SIZE];

    // Shared runtime helpers first; their symbols must exist for calls.
    {
        let mut rb = RuntimeBuilder {
            em: cg.em.as_mut(),
            pool: &mut cg.pool,
            syms: &mut cg.syms,
            os: target.os,
            arena_capacity: config.arena_capacity,
        };
        rb.emit_all();
    }

    cg.emit_entry();
    cg.emit_function("flap_main", MAIN_FRAME, FnBody::Block(&program.stmts))?;

    // Lambda and worker bodies may enqueue more of themselves.
    loop {
        if let Some(lambda) = cg.pending_lambdas.pop() {
            cg.emit_lambda_body(&lambda)?;
            continue;
        }
        if let Some(worker) = cg.pending_workers.pop() {
            cg.emit_worker_body(&worker)?;
            continue;
        }
        break;
    }

    let (text, patches) = cg.em.take();
    let (rodata, rodata_syms) = cg.pool.take();
    cg.syms.set_rodata(rodata_syms);

    Ok(Module {
        target,
        text,
        rodata,
        data,
        symbols: cg.syms,
        patches,
    })
}

/// Resolve every patch in a module against the writer's layout. After
/// this, the text bytes are final; any symbol found nowhere aborts with
/// `UnresolvedSymbol`.
pub fn resolve_module(module: &mut Module, layout: &flap_object::Layout) -> Result<()> {
    let em = emitter_for(module.target);
    symbols::resolve_patches(
        &mut module.text,
        &module.patches,
        em.as_ref(),
        &module.symbols,
        layout,
    )
}

/// What fills a function body during emission.
pub(crate) enum FnBody<'b> {
    Block(&'b [Stmt]),
    Expr(&'b Expr),
}

impl<'a> CodeGen<'a> {
    pub(crate) fn frame(&self) -> &FrameInfo {
        &self.frames[&self.cur_frame]
    }

    /// Reserve one expression spill slot; released in LIFO order.
    pub(crate) fn alloc_temp(&mut self) -> Result<i32> {
        let frame = self.frame();
        if self.temp_idx >= frame.temps {
            return Err(CompileError::internal(format!(
                "expression spill depth {} exceeds reserved temps {}",
                self.temp_idx + 1,
                frame.temps
            )));
        }
        let off = frame.temp_offset(self.temp_idx);
        self.temp_idx += 1;
        Ok(off)
    }

    pub(crate) fn free_temp(&mut self) {
        debug_assert!(self.temp_idx > 0);
        self.temp_idx -= 1;
    }

    /// Spill the expression result to a fresh temp slot.
    pub(crate) fn spill_f0(&mut self) -> Result<i32> {
        let off = self.alloc_temp()?;
        self.em.fstore(Reg::Fp, off, FReg::F0);
        Ok(off)
    }

    /// Program entry: init the meta-arena, run the program, tear the
    /// arenas down, and exit through libc so stdio flushes.
    fn emit_entry(&mut self) {
        self.em.align_to(16);
        let at = self.em.len() as u64;
        self.syms.define_text("flap_start", at);
        // ELF _start is jumped to with rsp 16-aligned, unlike a called
        // function; drop 8 bytes so the normal prologue discipline holds
        // and later C calls land on the boundary the ABI wants.
        if self.target.os == Os::Linux && self.target.arch == Arch::Amd64 {
            self.em.add_ri(Reg::Sp, -8);
        }
        self.em.prologue(16, &[]);
        self.em.call_symbol("flap_meta_init");
        self.em.call_symbol("flap_main");
        self.em.call_symbol("flap_arena_teardown");
        self.em.mov_ri(Reg::Arg0, 0);
        match self.target.os {
            Os::Windows => {
                self.syms.import("ExitProcess", "kernel32.dll");
                self.em.add_ri(Reg::Sp, -32);
                self.em.call_symbol("ExitProcess");
                self.em.add_ri(Reg::Sp, 32);
            }
            _ => {
                self.syms.import("exit", libc_name(self.target.os));
                self.em.call_symbol("exit");
            }
        }
        self.em.trap(); // not reached
    }

    /// Emit one complete function: prologue, parameter/capture setup,
    /// body, single epilogue running deferred expressions in reverse.
    pub(crate) fn emit_function(
        &mut self,
        name: &str,
        frame_id: usize,
        body: FnBody<'_>,
    ) -> Result<()> {
        self.cur_frame = frame_id;
        self.temp_idx = 0;
        self.loops.clear();
        self.defers.clear();
        self.ret_jumps.clear();

        self.em.align_to(16);
        let at = self.em.len() as u64;
        self.syms.define_text(name, at);
        let frame = self.frame().clone();
        self.em.prologue(frame.frame_size, &SAVED_REGS);

        self.emit_frame_setup(&frame)?;

        match body {
            FnBody::Block(stmts) => {
                for stmt in stmts {
                    self.emit_stmt(stmt)?;
                }
                // A trailing expression statement is the block's value;
                // anything else falls off returning 0.
                if !matches!(stmts.last(), Some(Stmt::Expr(_))) {
                    self.em.fconst(FReg::F0, 0.0);
                }
            }
            FnBody::Expr(expr) => {
                self.emit_expr(expr)?;
            }
        }

        self.emit_function_tail(&frame)?;
        Ok(())
    }

    /// Copy incoming parameters and captures into their frame slots.
    fn emit_frame_setup(&mut self, frame: &FrameInfo) -> Result<()> {
        // Captures first: the environment pointer arrives in Scratch0 and
        // is dead once parameters start spilling.
        for (j, cap) in frame.captures.iter().enumerate() {
            self.em.load(Reg::Scratch1, Reg::Scratch0, 16 + 8 * j as i32);
            self.em.store(Reg::Fp, cap.offset, Reg::Scratch1);
        }
        // Fixed parameters arrive in F0..; their slots were allocated
        // first, so the offsets are in declaration order.
        for (i, param) in frame.params.iter().enumerate() {
            let slot = frame.slots.get(param).ok_or_else(|| {
                CompileError::internal(format!("parameter '{}' has no slot", param))
            })?;
            if i < 8 {
                self.em.fstore(Reg::Fp, slot.offset, FReg::from_index(i));
            }
        }
        if frame.variadic.is_some() {
            self.emit_variadic_prologue(frame)?;
        }
        Ok(())
    }

    /// The one epilogue: `ret` statements jump here, deferred expressions
    /// replay in reverse insertion order, then the frame unwinds.
    fn emit_function_tail(&mut self, frame: &FrameInfo) -> Result<()> {
        for fixup in std::mem::take(&mut self.ret_jumps) {
            self.em.patch_to_here(fixup);
        }
        let defers = std::mem::take(&mut self.defers);
        if !defers.is_empty() {
            // The pending result must survive the deferred calls.
            let keep = self.alloc_temp().ok();
            if let Some(off) = keep {
                self.em.fstore(Reg::Fp, off, FReg::F0);
            }
            for expr in defers.iter().rev() {
                self.emit_expr(expr)?;
            }
            if let Some(off) = keep {
                self.em.fload(FReg::F0, Reg::Fp, off);
                self.free_temp();
            }
        }
        self.em.epilogue(frame.frame_size, &SAVED_REGS);
        self.em.ret();
        Ok(())
    }

    /// Variadic prologue: spill every FP argument register, then build the
    /// extras list addressable as the named parameter. The caller left the
    /// total argument count in `VarCount`.
    fn emit_variadic_prologue(&mut self, frame: &FrameInfo) -> Result<()> {
        let n_fixed = frame.params.len();
        let variadic = frame.variadic.as_ref().unwrap();
        let var_slot = frame.slots[variadic].offset;

        // Spill all eight FP argument registers above the stack pointer.
        self.em.add_ri(Reg::Sp, -64);
        for i in 0..8 {
            self.em.fstore(Reg::Sp, 8 * i, FReg::from_index(i as usize));
        }
        // extras = VarCount - n_fixed, clamped at 0..=8-n_fixed
        self.em.mov_rr(Reg::Scratch1, Reg::VarCount);
        self.em.add_ri(Reg::Scratch1, -(n_fixed as i32));
        let nonneg = self.em.br_cmp_imm(emitter::Cond::Ge, Reg::Scratch1, 0);
        self.em.mov_ri(Reg::Scratch1, 0);
        self.em.patch_to_here(nonneg);
        // Keep the count in VarCount (callee-saved) across the allocation.
        self.em.mov_rr(Reg::VarCount, Reg::Scratch1);
        self.em.mov_rr(Reg::Arg0, Reg::Scratch1);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.em.call_symbol("flap_alloc");
        // count word
        self.em.cvt_i2f(FReg::F1, Reg::VarCount);
        self.em.fstore(Reg::Ret, 0, FReg::F1);
        // fill from the spilled registers starting at the first extra
        self.em.mov_ri(Reg::Scratch0, 0);
        let top = self.em.len();
        let done = self.em.br_cmp(emitter::Cond::Ge, Reg::Scratch0, Reg::VarCount);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.add_ri(Reg::Scratch1, n_fixed as i32);
        self.em.shl_ri(Reg::Scratch1, 3);
        self.em.add_rr(Reg::Scratch1, Reg::Sp);
        self.em.fload(FReg::F1, Reg::Scratch1, 0);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Ret);
        self.em.cvt_i2f(FReg::F2, Reg::Scratch0);
        self.em.fstore(Reg::Scratch1, 8, FReg::F2);
        self.em.fstore(Reg::Scratch1, 16, FReg::F1);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.em.add_ri(Reg::Sp, 64);
        self.em.store(Reg::Fp, var_slot, Reg::Ret);
        Ok(())
    }
}
