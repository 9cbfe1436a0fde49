//! Lambda and worker lowering
//!
//! A lambda value is a pointer to an arena-allocated closure object:
//! entry address at +0, capture count at +8, captured values (raw 8-byte
//! copies) from +16. Calls pass the environment address (`object+16`) in
//! `Scratch0`; the callee's prologue copies captures into its own frame,
//! so frames are fully sized before emission and never grow.
//!
//! Lambda bodies are separate functions queued during the main walk and
//! emitted afterwards; a body can queue further lambdas of its own.
//! Parallel-loop bodies follow the same scheme with a worker-specific
//! prologue: start index in `Arg1`, end index in `Arg2`, environment in
//! `Scratch0` ([0] the iterated list, then captures).

use super::emitter::{Cond, FReg, Reg};
use super::{CodeGen, FnBody, SAVED_REGS};
use crate::ast::{Body, Expr, LambdaExpr, LoopStmt};
use crate::error::{CompileError, Result};

impl<'a> CodeGen<'a> {
    /// Materialize a lambda expression as a closure value in `F0` and
    /// queue its body for emission.
    pub(crate) fn emit_closure(&mut self, lambda: &LambdaExpr) -> Result<()> {
        let frame = self
            .frames
            .get(&lambda.id)
            .cloned()
            .ok_or_else(|| CompileError::internal("lambda frame missing"))?;
        self.pending_lambdas.push(lambda.clone());

        let sym = format!("flap_lambda_{}", lambda.id);
        self.em.mov_ri(Reg::Arg0, 16 + 8 * frame.captures.len() as i64);
        self.em.call_symbol("flap_alloc");
        self.em.lea_symbol(Reg::Scratch1, &sym);
        self.em.store(Reg::Ret, 0, Reg::Scratch1);
        self.em.mov_ri(Reg::Scratch1, frame.captures.len() as i64);
        self.em.store(Reg::Ret, 8, Reg::Scratch1);
        // Captures copy by value from the creating frame, at creation time.
        for (j, cap) in frame.captures.iter().enumerate() {
            self.em.load(Reg::Scratch1, Reg::Fp, cap.source_offset);
            self.em.store(Reg::Ret, 16 + 8 * j as i32, Reg::Scratch1);
        }
        self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
        Ok(())
    }

    pub(crate) fn emit_lambda_body(&mut self, lambda: &LambdaExpr) -> Result<()> {
        let name = format!("flap_lambda_{}", lambda.id);
        match &lambda.body {
            Body::Expr(expr) => self.emit_function(&name, lambda.id, FnBody::Expr(expr)),
            Body::Block(stmts) => self.emit_function(&name, lambda.id, FnBody::Block(stmts)),
        }
    }

    /// A parallel-loop body as a standalone function, running the loop
    /// over `[start, end)` with a thread-private counter.
    pub(crate) fn emit_worker_body(&mut self, l: &LoopStmt) -> Result<()> {
        let over_list = !matches!(l.iterable, Expr::Range { .. });
        self.cur_frame = l.id;
        self.temp_idx = 0;
        self.loops.clear();
        self.defers.clear();
        self.ret_jumps.clear();

        let name = format!("flap_worker_body_{}", l.id);
        self.em.align_to(16);
        let at = self.em.len() as u64;
        self.syms.define_text(&name, at);
        let frame = self.frame().clone();
        self.em.prologue(frame.frame_size, &SAVED_REGS);

        let var_off = frame.slots[&l.var].offset;
        let end_off = frame.slots["$end"].offset;

        // Worker incoming state: Arg1 = start, Arg2 = end, Scratch0 = env
        self.em.store(Reg::Fp, end_off, Reg::Arg2);
        if over_list {
            let list_off = frame.slots["$list"].offset;
            self.em.load(Reg::Scratch1, Reg::Scratch0, 0);
            self.em.store(Reg::Fp, list_off, Reg::Scratch1);
        }
        for (j, cap) in frame.captures.iter().enumerate() {
            self.em.load(Reg::Scratch1, Reg::Scratch0, 8 + 8 * j as i32);
            self.em.store(Reg::Fp, cap.offset, Reg::Scratch1);
        }

        // Thread-private counter in the first reserved tier
        let counter = self.push_loop()?;
        self.counter_from(counter, Reg::Arg1);

        let top = self.em.len();
        let creg = self.counter_to_reg(counter);
        self.em.mov_rr(Reg::Ret, creg);
        self.em.load(Reg::Scratch1, Reg::Fp, end_off);
        let exit = self.em.br_cmp(Cond::Ge, Reg::Ret, Reg::Scratch1);

        if over_list {
            let list_off = frame.slots["$list"].offset;
            self.em.load(Reg::Scratch0, Reg::Fp, list_off);
            self.em.mov_rr(Reg::Scratch1, Reg::Ret);
            self.em.shl_ri(Reg::Scratch1, 4);
            self.em.add_rr(Reg::Scratch1, Reg::Scratch0);
            self.em.fload(FReg::F0, Reg::Scratch1, 16);
        } else {
            self.em.cvt_i2f(FReg::F0, Reg::Ret);
        }
        self.em.fstore(Reg::Fp, var_off, FReg::F0);

        for stmt in &l.body {
            self.emit_stmt(stmt)?;
        }

        self.bump_counter(counter);
        self.em.jmp_back(top);
        let ctx = self.pop_loop();
        self.em.patch_to_here(exit);
        for fix in ctx.exit_fixups {
            self.em.patch_to_here(fix);
        }

        self.em.fconst(FReg::F0, 0.0);
        self.emit_worker_tail(&frame)?;
        Ok(())
    }

    fn emit_worker_tail(&mut self, frame: &crate::resolver::FrameInfo) -> Result<()> {
        for fixup in std::mem::take(&mut self.ret_jumps) {
            self.em.patch_to_here(fixup);
        }
        let defers = std::mem::take(&mut self.defers);
        for expr in defers.iter().rev() {
            self.emit_expr(expr)?;
        }
        self.em.epilogue(frame.frame_size, &SAVED_REGS);
        self.em.ret();
        Ok(())
    }
}
