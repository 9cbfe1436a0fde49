//! Match and loop lowering
//!
//! Match: scrutinee into the result register, then per arm an equality or
//! guard test with a conditional jump to the next arm, the arm result, and
//! an unconditional jump to the end label. Every arm emits the same move
//! shape into `F0` — including rodata string pointers — so no path can
//! leave a stale result. No default and no hit traps in expression
//! position.
//!
//! Sequential loops keep the counter in a reserved callee-saved register
//! (three tiers, spilling to frame slots beyond that) so nested calls
//! cannot clobber it; the exit branch leaves the counter holding the first
//! value that failed the condition. `max N` forces exit via a countdown
//! slot.
//!
//! Parallel loops partition the index space statically across four worker
//! threads, spawn through `pthread_create` (CreateThread on Windows), and
//! wait on an atomic countdown barrier; `Plat` holds the coordination
//! block for the duration of the region.

use super::emitter::{Cond, FCond, FReg, Reg};
use super::runtime::{WORK_BLOCK_SIZE, WORK_DONE, WORK_END, WORK_ENV, WORK_FN, WORK_START, pthread_lib};
use super::CodeGen;
use crate::ast::{Body, Expr, LoopStmt, MatchExpr};
use crate::error::Result;
use flap_object::Os;

/// Static worker count for `@@` loops.
const NTHREADS: i64 = 4;

impl<'a> CodeGen<'a> {
    pub(crate) fn emit_body_value(&mut self, body: &Body) -> Result<()> {
        match body {
            Body::Expr(expr) => self.emit_expr(expr),
            Body::Block(stmts) => {
                for stmt in stmts {
                    self.emit_stmt(stmt)?;
                }
                // The trailing expression statement is the block's value
                if !matches!(stmts.last(), Some(crate::ast::Stmt::Expr(_))) {
                    self.em.fconst(FReg::F0, 0.0);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn emit_match(&mut self, m: &MatchExpr, stmt_position: bool) -> Result<()> {
        self.emit_expr(&m.scrutinee)?;
        let t = self.spill_f0()?;
        let mut end_fixups = Vec::new();

        for arm in &m.arms {
            let mut no_match = Vec::new();
            if let Some(pattern) = &arm.pattern {
                self.emit_expr(pattern)?;
                self.em.fload(FReg::F1, Reg::Fp, t);
                no_match.push(self.em.br_fcmp(FCond::Ne, FReg::F1, FReg::F0));
            }
            if let Some(guard) = &arm.guard {
                self.emit_expr(guard)?;
                self.em.fconst(FReg::F1, 0.0);
                no_match.push(self.em.br_fcmp(FCond::Eq, FReg::F0, FReg::F1));
            }
            self.emit_body_value(&arm.result)?;
            end_fixups.push(self.em.jmp());
            for fix in no_match {
                self.em.patch_to_here(fix);
            }
        }

        match &m.default {
            Some(default) => {
                self.emit_body_value(default)?;
            }
            None => {
                if !stmt_position {
                    // non-exhaustive match in value position
                    self.em.trap();
                }
            }
        }
        for fix in end_fixups {
            self.em.patch_to_here(fix);
        }
        self.free_temp();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sequential loops
    // -----------------------------------------------------------------

    pub(crate) fn emit_seq_loop(&mut self, l: &LoopStmt) -> Result<()> {
        let over_list = !matches!(l.iterable, Expr::Range { .. });

        // Iterable setup: counter start value in Scratch1, bound in t_end,
        // list pointer (if any) in t_list.
        let t_list = if over_list {
            self.emit_expr(&l.iterable)?;
            self.em.fmov_to_gpr(Reg::Scratch1, FReg::F0);
            let t = self.alloc_temp()?;
            self.em.store(Reg::Fp, t, Reg::Scratch1);
            Some(t)
        } else {
            None
        };
        // Counter start value ends up in Scratch1, bound in t_end.
        let t_end = self.alloc_temp()?;
        if let Expr::Range { start, end, inclusive, .. } = &l.iterable {
            self.emit_expr(end)?;
            self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
            if *inclusive {
                self.em.add_ri(Reg::Scratch1, 1);
            }
            self.em.store(Reg::Fp, t_end, Reg::Scratch1);
            self.emit_expr(start)?;
            self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
        } else {
            let t = t_list.unwrap();
            self.em.load(Reg::Scratch0, Reg::Fp, t);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
            self.em.store(Reg::Fp, t_end, Reg::Scratch1);
            self.em.mov_ri(Reg::Scratch1, 0);
        }

        let t_max = if let Some(max) = &l.max {
            // counter start must survive the max evaluation
            let t_start = self.alloc_temp()?;
            self.em.store(Reg::Fp, t_start, Reg::Scratch1);
            self.emit_expr(max)?;
            self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
            let t = self.alloc_temp()?;
            self.em.store(Reg::Fp, t, Reg::Scratch0);
            self.em.load(Reg::Scratch1, Reg::Fp, t_start);
            // t_start slot stays reserved until cleanup (LIFO), harmless
            Some((t, t_start))
        } else {
            None
        };

        let counter = self.push_loop()?;
        self.counter_from(counter, Reg::Scratch1);

        let top = self.em.len();
        let creg = self.counter_to_reg(counter);
        self.em.mov_rr(Reg::Ret, creg);
        self.em.load(Reg::Scratch1, Reg::Fp, t_end);
        let exit = self.em.br_cmp(Cond::Ge, Reg::Ret, Reg::Scratch1);
        if let Some((t, _)) = t_max {
            // forced exit after N iterations regardless of the condition
            self.em.load(Reg::Scratch1, Reg::Fp, t);
            self.em.add_ri(Reg::Scratch1, -1);
            self.em.store(Reg::Fp, t, Reg::Scratch1);
            let fix = self.em.br_cmp_imm(Cond::Lt, Reg::Scratch1, 0);
            self.loops.last_mut().unwrap().exit_fixups.push(fix);
        }

        // Iterator variable for this pass
        if let Some(t) = t_list {
            self.em.load(Reg::Scratch0, Reg::Fp, t);
            self.em.mov_rr(Reg::Scratch1, Reg::Ret);
            self.em.shl_ri(Reg::Scratch1, 4);
            self.em.add_rr(Reg::Scratch1, Reg::Scratch0);
            self.em.fload(FReg::F0, Reg::Scratch1, 16);
        } else {
            self.em.cvt_i2f(FReg::F0, Reg::Ret);
        }
        self.em.fstore(Reg::Fp, l.var_offset, FReg::F0);

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
        if t_max.is_some() {
            self.free_temp(); // max countdown
            self.free_temp(); // parked start
        }
        self.free_temp(); // t_end
        if t_list.is_some() {
            self.free_temp();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Parallel loops
    // -----------------------------------------------------------------

    pub(crate) fn emit_parallel_loop(&mut self, l: &LoopStmt) -> Result<()> {
        let over_list = !matches!(l.iterable, Expr::Range { .. });
        self.pending_workers.push(l.clone());
        let worker_sym = format!("flap_worker_body_{}", l.id);

        // Index-space bounds
        let t_list = if over_list {
            self.emit_expr(&l.iterable)?;
            self.em.fmov_to_gpr(Reg::Scratch1, FReg::F0);
            let t = self.alloc_temp()?;
            self.em.store(Reg::Fp, t, Reg::Scratch1);
            Some(t)
        } else {
            None
        };
        let t_start = self.alloc_temp()?;
        let t_end = self.alloc_temp()?;
        if let Expr::Range { start, end, inclusive, .. } = &l.iterable {
            self.emit_expr(start)?;
            self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
            self.em.store(Reg::Fp, t_start, Reg::Scratch1);
            self.emit_expr(end)?;
            self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
            if *inclusive {
                self.em.add_ri(Reg::Scratch1, 1);
            }
            self.em.store(Reg::Fp, t_end, Reg::Scratch1);
        } else {
            let t = t_list.unwrap();
            self.em.mov_ri(Reg::Scratch1, 0);
            self.em.store(Reg::Fp, t_start, Reg::Scratch1);
            self.em.load(Reg::Scratch0, Reg::Fp, t);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
            self.em.store(Reg::Fp, t_end, Reg::Scratch1);
        }

        // Worker environment: [0] list pointer, then captured values
        let frame = self.frames[&l.id].clone();
        let t_env = self.alloc_temp()?;
        self.em.mov_ri(Reg::Arg0, 8 + 8 * frame.captures.len() as i64);
        self.em.call_symbol("flap_alloc");
        self.em.store(Reg::Fp, t_env, Reg::Ret);
        if let Some(t) = t_list {
            self.em.load(Reg::Scratch1, Reg::Fp, t);
            self.em.store(Reg::Ret, 0, Reg::Scratch1);
        }
        for (j, cap) in frame.captures.iter().enumerate() {
            self.em.load(Reg::Ret, Reg::Fp, t_env);
            self.em.load(Reg::Scratch1, Reg::Fp, cap.source_offset);
            self.em.store(Reg::Ret, 8 + 8 * j as i32, Reg::Scratch1);
        }

        // Coordination block: done counter, thread ids, per-thread work
        // blocks. Plat holds it for the whole region.
        let block_size = 8 + 8 * NTHREADS + WORK_BLOCK_SIZE * NTHREADS;
        self.em.mov_ri(Reg::Arg0, block_size);
        self.em.call_symbol("flap_alloc");
        self.em.mov_rr(Reg::Plat, Reg::Ret);
        self.em.mov_ri(Reg::Scratch1, NTHREADS);
        self.em.store(Reg::Plat, 0, Reg::Scratch1);

        for t in 0..NTHREADS {
            let wb_off = (8 + 8 * NTHREADS + WORK_BLOCK_SIZE * t) as i32;
            // function pointer
            self.em.lea_symbol(Reg::Scratch1, &worker_sym);
            self.em.store(Reg::Plat, wb_off + WORK_FN, Reg::Scratch1);
            // start index: start + t*chunk
            self.emit_chunk_scaled(t, t_start, t_end);
            self.em.store(Reg::Plat, wb_off + WORK_START, Reg::Ret);
            // end index: start + (t+1)*chunk, with the remainder going to
            // the last thread
            if t == NTHREADS - 1 {
                self.em.load(Reg::Ret, Reg::Fp, t_end);
            } else {
                self.emit_chunk_scaled(t + 1, t_start, t_end);
            }
            self.em.store(Reg::Plat, wb_off + WORK_END, Reg::Ret);
            // barrier pointer and environment
            self.em.store(Reg::Plat, wb_off + WORK_DONE, Reg::Plat);
            self.em.load(Reg::Scratch1, Reg::Fp, t_env);
            self.em.store(Reg::Plat, wb_off + WORK_ENV, Reg::Scratch1);
        }

        // Spawn the workers
        for t in 0..NTHREADS {
            let wb_off = (8 + 8 * NTHREADS + WORK_BLOCK_SIZE * t) as i32;
            match self.target.os {
                Os::Windows => {
                    // CreateThread(NULL, 0, fn, arg, 0, NULL): two stack
                    // parameters above the shadow space
                    self.syms.import("CreateThread", "kernel32.dll");
                    self.em.mov_ri(Reg::Arg0, 0);
                    self.em.mov_ri(Reg::Arg1, 0);
                    self.em.lea_symbol(Reg::Arg2, "flap_worker");
                    self.em.mov_rr(Reg::Arg3, Reg::Plat);
                    self.em.add_ri(Reg::Arg3, wb_off);
                    self.em.add_ri(Reg::Sp, -48);
                    self.em.mov_ri(Reg::Scratch1, 0);
                    self.em.store(Reg::Sp, 32, Reg::Scratch1);
                    self.em.store(Reg::Sp, 40, Reg::Scratch1);
                    self.em.call_symbol("CreateThread");
                    self.em.add_ri(Reg::Sp, 48);
                }
                os => {
                    // pthread_create(&tid[t], NULL, flap_worker, wb)
                    self.syms.import("pthread_create", pthread_lib(os));
                    self.em.mov_rr(Reg::Arg0, Reg::Plat);
                    self.em.add_ri(Reg::Arg0, (8 + 8 * t) as i32);
                    self.em.mov_ri(Reg::Arg1, 0);
                    self.em.lea_symbol(Reg::Arg2, "flap_worker");
                    self.em.mov_rr(Reg::Arg3, Reg::Plat);
                    self.em.add_ri(Reg::Arg3, wb_off);
                    self.em.call_symbol("pthread_create");
                }
            }
        }

        // Barrier: no thread observes the post-loop state until all have
        // finished their ranges.
        let spin = self.em.len();
        self.em.load(Reg::Scratch1, Reg::Plat, 0);
        let done = self.em.br_cmp_imm(Cond::Le, Reg::Scratch1, 0);
        self.em.jmp_back(spin);
        self.em.patch_to_here(done);
        self.em.fence();

        self.free_temp(); // t_env
        self.free_temp(); // t_end
        self.free_temp(); // t_start
        if t_list.is_some() {
            self.free_temp();
        }
        Ok(())
    }

    /// `Ret = start + t*chunk` where `chunk = (end-start)/NTHREADS`,
    /// using only Ret and Scratch1.
    fn emit_chunk_scaled(&mut self, t: i64, t_start: i32, t_end: i32) {
        self.em.load(Reg::Ret, Reg::Fp, t_end);
        self.em.load(Reg::Scratch1, Reg::Fp, t_start);
        self.em.sub_rr(Reg::Ret, Reg::Scratch1);
        self.em.shr_ri(Reg::Ret, 2); // NTHREADS == 4
        match t {
            0 => self.em.mov_ri(Reg::Ret, 0),
            1 => {}
            2 => self.em.shl_ri(Reg::Ret, 1),
            _ => {
                // 3x: chunk + chunk<<1
                self.em.mov_rr(Reg::Scratch1, Reg::Ret);
                self.em.shl_ri(Reg::Ret, 1);
                self.em.add_rr(Reg::Ret, Reg::Scratch1);
            }
        }
        self.em.load(Reg::Scratch1, Reg::Fp, t_start);
        self.em.add_rr(Reg::Ret, Reg::Scratch1);
    }
}
