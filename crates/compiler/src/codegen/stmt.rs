//! Statement lowering
//!
//! The three assignment forms share slots computed by the resolver; `=` and
//! `:=` differ only in what the resolver allowed, so by the time lowering
//! runs an assignment is a store. Tuple unpacking reads list entries with
//! missing positions defaulting to 0 and extras discarded. `defer` grows
//! the compile-time defer stack replayed by the function epilogue.

use super::emitter::{Cond, FReg, Reg};
use super::CodeGen;
use crate::ast::{AssignTarget, BinOp, Expr, Resolution, Stmt};
use crate::error::{CompileError, Result};

impl<'a> CodeGen<'a> {
    pub(crate) fn emit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Expr(expr) => {
                // Match in statement position keeps no result
                if let Expr::Match(m) = expr {
                    self.emit_match(m, true)
                } else {
                    self.emit_expr(expr)
                }
            }
            Stmt::Assign { targets, op, value, .. } => self.emit_assign(targets, *op, value),
            Stmt::Loop(l) => {
                if l.parallel {
                    self.emit_parallel_loop(l)
                } else {
                    self.emit_seq_loop(l)
                }
            }
            Stmt::Ret { value, loop_depth, .. } => {
                if let Some(depth) = loop_depth {
                    // `ret @N` exits the Nth enclosing loop
                    let fix = self.em.jmp();
                    let idx = self.loops.len() - *depth as usize;
                    self.loops[idx].exit_fixups.push(fix);
                } else {
                    if let Some(expr) = value {
                        self.emit_expr(expr)?;
                    } else {
                        self.em.fconst(FReg::F0, 0.0);
                    }
                    let fix = self.em.jmp();
                    self.ret_jumps.push(fix);
                }
                Ok(())
            }
            Stmt::Defer { expr, .. } => {
                self.defers.push(expr.clone());
                Ok(())
            }
            // `unsafe` relaxes nothing at emission level; the block simply
            // runs. Scoping was the resolver's business.
            Stmt::Unsafe { body, .. } | Stmt::Block { body, .. } => {
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::ArenaBlock { body, .. } => {
                self.em.call_symbol("flap_arena_push");
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                self.em.call_symbol("flap_arena_pop");
                Ok(())
            }
        }
    }

    fn emit_assign(
        &mut self,
        targets: &[AssignTarget],
        op: Option<BinOp>,
        value: &Expr,
    ) -> Result<()> {
        if targets.len() > 1 {
            return self.emit_tuple_unpack(targets, value);
        }
        match &targets[0] {
            AssignTarget::Name(ident) => {
                let offset = match &ident.resolution {
                    Some(Resolution::Local { offset, .. }) => *offset,
                    other => {
                        return Err(CompileError::internal(format!(
                            "assignment target '{}' resolved to {:?}",
                            ident.name, other
                        )));
                    }
                };
                if let Some(op) = op {
                    // x op= e  ==  x <- x op e
                    self.em.fload(FReg::F0, Reg::Fp, offset);
                    let t = self.spill_f0()?;
                    self.emit_expr(value)?;
                    self.em.fload(FReg::F1, Reg::Fp, t);
                    self.free_temp();
                    self.apply_numeric_binop(op)?;
                } else {
                    self.emit_expr(value)?;
                }
                self.em.fstore(Reg::Fp, offset, FReg::F0);
                Ok(())
            }
            AssignTarget::Index { base, index, .. } => {
                self.emit_index_update(base, index, op, value)
            }
        }
    }

    /// `xs[i] <- v` (optionally compound): in-place entry update, skipped
    /// when the index is out of range.
    fn emit_index_update(
        &mut self,
        base: &Expr,
        index: &Expr,
        op: Option<BinOp>,
        value: &Expr,
    ) -> Result<()> {
        self.emit_expr(base)?;
        let t_base = self.spill_f0()?;
        self.emit_expr(index)?;
        let t_idx = self.spill_f0()?;
        self.emit_expr(value)?;

        // entry address = base + 16*i + 8, bounds-checked
        self.em.load(Reg::Ret, Reg::Fp, t_base);
        self.em.fload(FReg::F1, Reg::Fp, t_idx);
        self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
        self.em.fload(FReg::F1, Reg::Ret, 0);
        self.em.cvt_f2i(Reg::Scratch0, FReg::F1);
        let oob_low = self.em.br_cmp_imm(Cond::Lt, Reg::Scratch1, 0);
        let oob_high = self.em.br_cmp(Cond::Ge, Reg::Scratch1, Reg::Scratch0);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Ret);

        if let Some(op) = op {
            // compound: current value is the left operand; the entry
            // address must survive the operator (division clobbers
            // scratches), so it parks in a temp
            let t_addr = self.alloc_temp()?;
            self.em.store(Reg::Fp, t_addr, Reg::Scratch1);
            self.em.fload(FReg::F1, Reg::Scratch1, 16);
            self.apply_numeric_binop(op)?;
            self.em.load(Reg::Scratch1, Reg::Fp, t_addr);
            self.free_temp();
        }
        self.em.fstore(Reg::Scratch1, 16, FReg::F0);
        self.em.patch_to_here(oob_low);
        self.em.patch_to_here(oob_high);
        self.free_temp();
        self.free_temp();
        Ok(())
    }

    /// `a, b, c = e`: e evaluates to a list; entry i lands in target i,
    /// missing entries default to 0, extras are discarded.
    fn emit_tuple_unpack(&mut self, targets: &[AssignTarget], value: &Expr) -> Result<()> {
        self.emit_expr(value)?;
        let t = self.spill_f0()?;
        for (i, target) in targets.iter().enumerate() {
            let offset = match target {
                AssignTarget::Name(ident) => match &ident.resolution {
                    Some(Resolution::Local { offset, .. }) => *offset,
                    other => {
                        return Err(CompileError::internal(format!(
                            "tuple target resolved to {:?}",
                            other
                        )));
                    }
                },
                AssignTarget::Index { span, .. } => {
                    return Err(CompileError::new(
                        crate::error::ErrorKind::TypeMismatch,
                        *span,
                        "tuple targets must be plain names",
                    ));
                }
            };
            self.em.load(Reg::Scratch0, Reg::Fp, t);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
            self.em.mov_ri(Reg::Ret, i as i64);
            let in_range = self.em.br_cmp(Cond::Lt, Reg::Ret, Reg::Scratch1);
            self.em.fconst(FReg::F0, 0.0);
            let done = self.em.jmp();
            self.em.patch_to_here(in_range);
            self.em.fload(FReg::F0, Reg::Scratch0, 16 + 16 * i as i32);
            self.em.patch_to_here(done);
            self.em.fstore(Reg::Fp, offset, FReg::F0);
        }
        self.free_temp();
        Ok(())
    }
}
