//! Expression lowering
//!
//! Every expression leaves its result in `F0`. Scalar arithmetic stays in
//! FP registers; values only reify into the universal map layout when they
//! enter an arena structure or cross an FFI boundary. Pending left operands
//! spill into the frame's temp slots, never onto the machine stack, so the
//! stack pointer stays put (and 16-aligned) between calls.

use super::emitter::{Cond, FCond, FReg, Reg};
use super::runtime::libc_name;
use super::{CodeGen, CounterLoc, LoopCtx};
use crate::ast::{BinOp, Expr, FsPart, Ident, Resolution, UnaryOp};
use crate::builtins::Builtin;
use crate::error::{CompileError, ErrorKind, Result};
use crate::ffi::FfiDecl;
use crate::types::{ERR_DIV0, ERROR_NAN_HIGH, ValueType};
use flap_object::Os;

/// Register class a marshaled C argument travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CArgClass {
    Gpr,
    Fpr,
}

impl<'a> CodeGen<'a> {
    pub(crate) fn emit_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Number { value, .. } => {
                self.em.fconst(FReg::F0, *value);
                Ok(())
            }
            Expr::Str { value, .. } => {
                let sym = self.pool.string(value);
                self.em.lea_symbol(Reg::Scratch1, &sym);
                self.em.fmov_from_gpr(FReg::F0, Reg::Scratch1);
                Ok(())
            }
            Expr::FString { parts, .. } => self.emit_fstring(parts),
            Expr::List { items, .. } => self.emit_list_literal(items),
            Expr::MapLit { entries, .. } => self.emit_map_literal(entries),
            Expr::Ident(ident) => self.emit_ident(ident),
            Expr::Unary { op, operand, .. } => self.emit_unary(*op, operand),
            Expr::Binary { op, lhs, rhs, .. } => self.emit_binary(*op, lhs, rhs),
            Expr::Lambda(lambda) => self.emit_closure(lambda),
            Expr::Match(m) => self.emit_match(m, false),
            Expr::Call { callee, args, span } => {
                if args.len() > 8 {
                    return Err(CompileError::new(
                        ErrorKind::Arity,
                        *span,
                        "calls take at most 8 arguments",
                    ));
                }
                self.emit_call(callee, args)
            }
            Expr::Index { base, index, .. } => self.emit_index(base, index),
            Expr::Property { base, name, .. } => {
                debug_assert_eq!(name, "error");
                self.emit_expr(base)?;
                self.em.call_symbol("flap_error_string");
                self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
                Ok(())
            }
            Expr::Range { start, end, inclusive, .. } => {
                self.emit_range_list(start, end, *inclusive)
            }
            Expr::Cast { value, ty, .. } => self.emit_cast(value, *ty),
            Expr::Head { base, .. } => {
                // head == checked index 0
                self.emit_expr(base)?;
                self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
                self.em.fconst(FReg::F0, 0.0);
                self.em.call_symbol("flap_index");
                Ok(())
            }
            Expr::Tail { base, .. } => {
                self.emit_expr(base)?;
                self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
                self.em.call_symbol("flap_tail");
                self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
                Ok(())
            }
        }
    }

    fn emit_ident(&mut self, ident: &Ident) -> Result<()> {
        match &ident.resolution {
            Some(Resolution::Local { offset, .. }) | Some(Resolution::Capture { offset, .. }) => {
                self.em.fload(FReg::F0, Reg::Fp, *offset);
                Ok(())
            }
            Some(Resolution::Constant(value)) => {
                self.em.fconst(FReg::F0, *value);
                Ok(())
            }
            Some(Resolution::Foreign { symbol }) => {
                // Address of the import stub as a value
                let decl = self.foreign_by_symbol(symbol)?;
                self.syms.import(symbol, &lib_for(&decl, self.target.os));
                self.em.lea_symbol(Reg::Scratch1, symbol);
                self.em.fmov_from_gpr(FReg::F0, Reg::Scratch1);
                Ok(())
            }
            Some(Resolution::Builtin(_)) => Err(CompileError::new(
                ErrorKind::TypeMismatch,
                ident.span,
                format!("builtin '{}' can only be called", ident.name),
            )),
            None => Err(CompileError::internal(format!(
                "identifier '{}' reached emission unresolved",
                ident.name
            ))),
        }
    }

    fn emit_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<()> {
        self.emit_expr(operand)?;
        match op {
            UnaryOp::Neg => {
                // flip the sign bit
                self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
                self.em.mov_ri(Reg::Scratch1, i64::MIN);
                self.em.xor_rr(Reg::Scratch0, Reg::Scratch1);
                self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
            }
            UnaryOp::Not => {
                self.em.fconst(FReg::F1, 0.0);
                self.em.fset_cmp(Reg::Scratch0, FCond::Eq, FReg::F0, FReg::F1);
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            UnaryOp::BitNot => {
                self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
                self.em.not_r(Reg::Scratch0);
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            UnaryOp::Len => {
                self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
                self.em.fload(FReg::F0, Reg::Scratch0, 0);
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<()> {
        match op {
            BinOp::OrElse => return self.emit_or_else(lhs, rhs),
            BinOp::Pipe => return self.emit_call(rhs, std::slice::from_ref(lhs)),
            BinOp::ParMap => return self.emit_map_pipe(lhs, rhs, false),
            BinOp::Reduce => return self.emit_map_pipe(lhs, rhs, true),
            BinOp::Send => return self.emit_send(lhs, rhs),
            BinOp::Add if lhs.ty().is_heap() || rhs.ty().is_heap() => {
                return self.emit_concat(lhs, rhs);
            }
            BinOp::Cons => return self.emit_cons(lhs, rhs),
            _ => {}
        }

        // Left operand spills while the right evaluates; ends with
        // lhs in F1, rhs in F0.
        self.emit_expr(lhs)?;
        let t = self.spill_f0()?;
        self.emit_expr(rhs)?;
        self.em.fload(FReg::F1, Reg::Fp, t);
        self.free_temp();
        self.apply_numeric_binop(op)
    }

    /// The arithmetic/comparison/bitwise tail: operands in F1 (left) and
    /// F0 (right), result in F0. Compound assignments reuse it.
    pub(crate) fn apply_numeric_binop(&mut self, op: BinOp) -> Result<()> {
        match op {
            BinOp::Add => {
                self.em.fadd(FReg::F1, FReg::F0);
                self.em.fmov(FReg::F0, FReg::F1);
            }
            BinOp::Sub => {
                self.em.fsub(FReg::F1, FReg::F0);
                self.em.fmov(FReg::F0, FReg::F1);
            }
            BinOp::Mul => {
                self.em.fmul(FReg::F1, FReg::F0);
                self.em.fmov(FReg::F0, FReg::F1);
            }
            BinOp::Div => {
                // zero divisor produces the "dv0 " Result
                self.em.fconst(FReg::F2, 0.0);
                let nonzero = self.em.br_fcmp(FCond::Ne, FReg::F0, FReg::F2);
                self.em.fconst(FReg::F0, f64::from_bits(ERR_DIV0.to_bits()));
                let done = self.em.jmp();
                self.em.patch_to_here(nonzero);
                self.em.fdiv(FReg::F1, FReg::F0);
                self.em.fmov(FReg::F0, FReg::F1);
                self.em.patch_to_here(done);
            }
            BinOp::Mod => {
                self.em.fconst(FReg::F2, 0.0);
                let nonzero = self.em.br_fcmp(FCond::Ne, FReg::F0, FReg::F2);
                self.em.fconst(FReg::F0, f64::from_bits(ERR_DIV0.to_bits()));
                let done = self.em.jmp();
                self.em.patch_to_here(nonzero);
                // a - trunc(a/b)*b
                self.em.fmov(FReg::F2, FReg::F1);
                self.em.fdiv(FReg::F2, FReg::F0);
                self.em.cvt_f2i(Reg::Scratch0, FReg::F2);
                self.em.cvt_i2f(FReg::F2, Reg::Scratch0);
                self.em.fmul(FReg::F2, FReg::F0);
                self.em.fsub(FReg::F1, FReg::F2);
                self.em.fmov(FReg::F0, FReg::F1);
                self.em.patch_to_here(done);
            }
            BinOp::Pow => {
                // libm pow(F0 = base, F1 = exponent)
                self.em.fmov(FReg::F2, FReg::F0);
                self.em.fmov(FReg::F0, FReg::F1);
                self.em.fmov(FReg::F1, FReg::F2);
                self.syms.import("pow", libm_name(self.target.os));
                if self.target.os == Os::Windows {
                    self.em.add_ri(Reg::Sp, -32);
                    self.em.call_symbol("pow");
                    self.em.add_ri(Reg::Sp, 32);
                } else {
                    self.em.call_symbol("pow");
                }
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let cond = match op {
                    BinOp::Eq => FCond::Eq,
                    BinOp::Ne => FCond::Ne,
                    BinOp::Lt => FCond::Lt,
                    BinOp::Le => FCond::Le,
                    BinOp::Gt => FCond::Gt,
                    _ => FCond::Ge,
                };
                self.em.fset_cmp(Reg::Scratch0, cond, FReg::F1, FReg::F0);
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            BinOp::And | BinOp::Or => {
                self.em.fconst(FReg::F2, 0.0);
                self.em.fset_cmp(Reg::Scratch0, FCond::Ne, FReg::F1, FReg::F2);
                self.em.fset_cmp(Reg::Ret, FCond::Ne, FReg::F0, FReg::F2);
                if op == BinOp::And {
                    self.em.and_rr(Reg::Scratch0, Reg::Ret);
                } else {
                    self.em.or_rr(Reg::Scratch0, Reg::Ret);
                }
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                self.em.cvt_f2i(Reg::Scratch0, FReg::F1);
                self.em.cvt_f2i(Reg::Ret, FReg::F0);
                match op {
                    BinOp::BitAnd => self.em.and_rr(Reg::Scratch0, Reg::Ret),
                    BinOp::BitOr => self.em.or_rr(Reg::Scratch0, Reg::Ret),
                    _ => self.em.xor_rr(Reg::Scratch0, Reg::Ret),
                }
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            BinOp::Shl | BinOp::Shr | BinOp::Rol | BinOp::Ror => {
                self.em.cvt_f2i(Reg::Scratch0, FReg::F1);
                self.em.cvt_f2i(Reg::Ret, FReg::F0);
                match op {
                    BinOp::Shl => self.em.shl_r(Reg::Scratch0, Reg::Ret),
                    BinOp::Shr => self.em.shr_r(Reg::Scratch0, Reg::Ret),
                    BinOp::Rol => self.em.rol_r(Reg::Scratch0, Reg::Ret),
                    _ => self.em.ror_r(Reg::Scratch0, Reg::Ret),
                }
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            other => {
                return Err(CompileError::internal(format!(
                    "binary operator {:?} fell through lowering",
                    other
                )));
            }
        }
        Ok(())
    }

    /// `x or! fallback`: keep x unless its bits are an error NaN.
    fn emit_or_else(&mut self, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.emit_expr(lhs)?;
        self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shr_ri(Reg::Scratch1, 32);
        let ok_high = self.em.br_cmp_imm(Cond::Ne, Reg::Scratch1, ERROR_NAN_HIGH as i32);
        self.em.mov_ri(Reg::Scratch1, 0xffff_ffff);
        self.em.and_rr(Reg::Scratch1, Reg::Scratch0);
        let ok_low = self.em.br_cmp_imm(Cond::Eq, Reg::Scratch1, 0);
        self.emit_expr(rhs)?;
        self.em.patch_to_here(ok_high);
        self.em.patch_to_here(ok_low);
        Ok(())
    }

    /// String/list `+` through the arena.
    fn emit_concat(&mut self, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.emit_expr(lhs)?;
        let t = self.spill_f0()?;
        self.emit_expr(rhs)?;
        self.em.fmov_to_gpr(Reg::Arg1, FReg::F0);
        self.em.load(Reg::Arg0, Reg::Fp, t);
        self.free_temp();
        self.em.call_symbol("flap_string_concat");
        self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
        Ok(())
    }

    fn emit_cons(&mut self, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.emit_expr(lhs)?;
        let t = self.spill_f0()?;
        self.emit_expr(rhs)?;
        self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
        self.em.fload(FReg::F0, Reg::Fp, t);
        self.free_temp();
        self.em.call_symbol("flap_cons");
        self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
        Ok(())
    }

    /// `:port <== value`.
    fn emit_send(&mut self, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.emit_expr(lhs)?;
        let t = self.spill_f0()?;
        self.emit_expr(rhs)?;
        self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
        self.em.call_symbol("flap_string_to_cstr");
        self.em.mov_rr(Reg::Arg1, Reg::Ret);
        self.em.fload(FReg::F1, Reg::Fp, t);
        self.free_temp();
        self.em.cvt_f2i(Reg::Arg0, FReg::F1);
        self.em.call_symbol("flap_send");
        Ok(())
    }

    /// `xs || f` (map) and `xs ||| f` (reduce), lowered as sequential
    /// loops over the list with the callable applied per element.
    fn emit_map_pipe(&mut self, lhs: &Expr, rhs: &Expr, reduce: bool) -> Result<()> {
        self.emit_expr(lhs)?;
        let t_list = self.spill_f0()?;
        self.emit_expr(rhs)?;
        let t_fn = self.spill_f0()?;
        let t_acc = self.alloc_temp()?; // output list, or the accumulator

        if reduce {
            // acc = xs[0] (or 0 for an empty list)
            self.em.load(Reg::Scratch0, Reg::Fp, t_list);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
            self.em.fconst(FReg::F0, 0.0);
            let empty = self.em.br_cmp_imm(Cond::Le, Reg::Scratch1, 0);
            self.em.fload(FReg::F0, Reg::Scratch0, 16);
            self.em.patch_to_here(empty);
            self.em.fstore(Reg::Fp, t_acc, FReg::F0);
        } else {
            // out = alloc(8 + 16n); count = n
            self.em.load(Reg::Scratch0, Reg::Fp, t_list);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.cvt_f2i(Reg::Arg0, FReg::F1);
            self.em.shl_ri(Reg::Arg0, 4);
            self.em.add_ri(Reg::Arg0, 8);
            self.em.call_symbol("flap_alloc");
            self.em.store(Reg::Fp, t_acc, Reg::Ret);
            self.em.load(Reg::Scratch0, Reg::Fp, t_list);
            self.em.fload(FReg::F1, Reg::Scratch0, 0);
            self.em.fstore(Reg::Ret, 0, FReg::F1);
        }

        // index loop in the proper counter tier; the index is copied into
        // Ret each pass so slot-tier counters cannot alias Scratch0
        let counter = self.push_loop()?;
        let start_at = if reduce { 1 } else { 0 };
        self.set_counter(counter, start_at);
        let top = self.em.len();
        let creg = self.counter_to_reg(counter);
        self.em.mov_rr(Reg::Ret, creg);
        self.em.load(Reg::Scratch0, Reg::Fp, t_list);
        self.em.fload(FReg::F1, Reg::Scratch0, 0);
        self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
        let exit = self.em.br_cmp(Cond::Ge, Reg::Ret, Reg::Scratch1);
        // element -> F0 (reduce: second argument)
        self.em.mov_rr(Reg::Scratch1, Reg::Ret);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Scratch0);
        if reduce {
            self.em.fload(FReg::F1, Reg::Scratch1, 16);
            self.em.fload(FReg::F0, Reg::Fp, t_acc);
        } else {
            self.em.fload(FReg::F0, Reg::Scratch1, 16);
        }
        // call the closure value
        self.em.load(Reg::Ret, Reg::Fp, t_fn);
        self.em.mov_rr(Reg::Scratch0, Reg::Ret);
        self.em.add_ri(Reg::Scratch0, 16);
        self.em.load(Reg::Scratch1, Reg::Ret, 0);
        self.em.mov_ri(Reg::VarCount, if reduce { 2 } else { 1 });
        self.em.call_reg(Reg::Scratch1);
        if reduce {
            self.em.fstore(Reg::Fp, t_acc, FReg::F0);
        } else {
            // out[i] = result
            let creg = self.counter_to_reg(counter);
            self.em.mov_rr(Reg::Ret, creg);
            self.em.cvt_i2f(FReg::F1, Reg::Ret);
            self.em.shl_ri(Reg::Ret, 4);
            self.em.load(Reg::Scratch1, Reg::Fp, t_acc);
            self.em.add_rr(Reg::Ret, Reg::Scratch1);
            self.em.fstore(Reg::Ret, 8, FReg::F1);
            self.em.fstore(Reg::Ret, 16, FReg::F0);
        }
        self.bump_counter(counter);
        self.em.jmp_back(top);
        self.em.patch_to_here(exit);
        self.pop_loop();

        if reduce {
            self.em.fload(FReg::F0, Reg::Fp, t_acc);
        } else {
            self.em.load(Reg::Scratch0, Reg::Fp, t_acc);
            self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
        }
        self.free_temp(); // t_acc
        self.free_temp(); // t_fn
        self.free_temp(); // t_list
        Ok(())
    }

    fn emit_fstring(&mut self, parts: &[FsPart]) -> Result<()> {
        let t_acc = self.alloc_temp()?;
        let empty = self.pool.string("");
        self.em.lea_symbol(Reg::Scratch1, &empty);
        self.em.store(Reg::Fp, t_acc, Reg::Scratch1);
        for part in parts {
            match part {
                FsPart::Text(text) => {
                    let sym = self.pool.string(text);
                    self.em.lea_symbol(Reg::Arg1, &sym);
                }
                FsPart::Expr(expr) => {
                    self.emit_expr(expr)?;
                    match expr.ty() {
                        ValueType::String | ValueType::List | ValueType::Map => {
                            self.em.fmov_to_gpr(Reg::Arg1, FReg::F0);
                        }
                        ValueType::Number => {
                            self.em.call_symbol("flap_number_to_string");
                            self.em.mov_rr(Reg::Arg1, Reg::Ret);
                        }
                        _ => {
                            // unknown at compile time: dispatch at runtime
                            self.em.call_symbol("flap_value_to_string");
                            self.em.mov_rr(Reg::Arg1, Reg::Ret);
                        }
                    }
                }
            }
            self.em.load(Reg::Arg0, Reg::Fp, t_acc);
            self.em.call_symbol("flap_string_concat");
            self.em.store(Reg::Fp, t_acc, Reg::Ret);
        }
        self.em.load(Reg::Scratch0, Reg::Fp, t_acc);
        self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
        self.free_temp();
        Ok(())
    }

    fn emit_list_literal(&mut self, items: &[Expr]) -> Result<()> {
        // All-constant lists go straight to rodata
        let consts: Option<Vec<f64>> = items
            .iter()
            .map(|e| match e {
                Expr::Number { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        if let Some(values) = consts {
            let sym = self.pool.list(&values);
            self.em.lea_symbol(Reg::Scratch1, &sym);
            self.em.fmov_from_gpr(FReg::F0, Reg::Scratch1);
            return Ok(());
        }

        let t_ptr = self.alloc_temp()?;
        self.em.mov_ri(Reg::Arg0, 8 + 16 * items.len() as i64);
        self.em.call_symbol("flap_alloc");
        self.em.store(Reg::Fp, t_ptr, Reg::Ret);
        self.em.fconst(FReg::F1, items.len() as f64);
        self.em.fstore(Reg::Ret, 0, FReg::F1);
        for (i, item) in items.iter().enumerate() {
            self.emit_expr(item)?;
            self.em.load(Reg::Scratch0, Reg::Fp, t_ptr);
            self.em.fconst(FReg::F1, i as f64);
            self.em.fstore(Reg::Scratch0, 8 + 16 * i as i32, FReg::F1);
            self.em.fstore(Reg::Scratch0, 16 + 16 * i as i32, FReg::F0);
        }
        self.em.load(Reg::Scratch0, Reg::Fp, t_ptr);
        self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
        self.free_temp();
        Ok(())
    }

    fn emit_map_literal(&mut self, entries: &[(Expr, Expr)]) -> Result<()> {
        let consts: Option<Vec<(f64, f64)>> = entries
            .iter()
            .map(|(k, v)| match (k, v) {
                (Expr::Number { value: kv, .. }, Expr::Number { value: vv, .. }) => {
                    Some((*kv, *vv))
                }
                _ => None,
            })
            .collect();
        if let Some(pairs) = consts {
            let sym = self.pool.map(&pairs);
            self.em.lea_symbol(Reg::Scratch1, &sym);
            self.em.fmov_from_gpr(FReg::F0, Reg::Scratch1);
            return Ok(());
        }

        let t_ptr = self.alloc_temp()?;
        self.em.mov_ri(Reg::Arg0, 8 + 16 * entries.len() as i64);
        self.em.call_symbol("flap_alloc");
        self.em.store(Reg::Fp, t_ptr, Reg::Ret);
        self.em.fconst(FReg::F1, entries.len() as f64);
        self.em.fstore(Reg::Ret, 0, FReg::F1);
        for (i, (key, value)) in entries.iter().enumerate() {
            self.emit_expr(key)?;
            let t_key = self.spill_f0()?;
            self.emit_expr(value)?;
            self.em.fload(FReg::F1, Reg::Fp, t_key);
            self.free_temp();
            self.em.load(Reg::Scratch0, Reg::Fp, t_ptr);
            self.em.fstore(Reg::Scratch0, 8 + 16 * i as i32, FReg::F1);
            self.em.fstore(Reg::Scratch0, 16 + 16 * i as i32, FReg::F0);
        }
        self.em.load(Reg::Scratch0, Reg::Fp, t_ptr);
        self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
        self.free_temp();
        Ok(())
    }

    /// Materialize a range as a list (loops consume ranges without this).
    fn emit_range_list(&mut self, start: &Expr, end: &Expr, inclusive: bool) -> Result<()> {
        self.emit_expr(start)?;
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        let t_start = self.alloc_temp()?;
        self.em.store(Reg::Fp, t_start, Reg::Scratch0);
        self.emit_expr(end)?;
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        if inclusive {
            self.em.add_ri(Reg::Scratch0, 1);
        }
        // n = max(end' - start, 0)
        self.em.load(Reg::Scratch1, Reg::Fp, t_start);
        self.em.sub_rr(Reg::Scratch0, Reg::Scratch1);
        let nonneg = self.em.br_cmp_imm(Cond::Ge, Reg::Scratch0, 0);
        self.em.mov_ri(Reg::Scratch0, 0);
        self.em.patch_to_here(nonneg);
        let t_n = self.alloc_temp()?;
        self.em.store(Reg::Fp, t_n, Reg::Scratch0);
        self.em.mov_rr(Reg::Arg0, Reg::Scratch0);
        self.em.shl_ri(Reg::Arg0, 4);
        self.em.add_ri(Reg::Arg0, 8);
        self.em.call_symbol("flap_alloc");
        let t_ptr = self.alloc_temp()?;
        self.em.store(Reg::Fp, t_ptr, Reg::Ret);
        self.em.load(Reg::Scratch1, Reg::Fp, t_n);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch1);
        self.em.fstore(Reg::Ret, 0, FReg::F1);
        // fill: out[i] = start + i
        self.em.mov_ri(Reg::Scratch0, 0);
        let top = self.em.len();
        self.em.load(Reg::Scratch1, Reg::Fp, t_n);
        let done = self.em.br_cmp(Cond::Ge, Reg::Scratch0, Reg::Scratch1);
        self.em.load(Reg::Ret, Reg::Fp, t_ptr);
        self.em.mov_rr(Reg::Scratch1, Reg::Scratch0);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch1, Reg::Ret);
        self.em.cvt_i2f(FReg::F1, Reg::Scratch0);
        self.em.fstore(Reg::Scratch1, 8, FReg::F1);
        self.em.load(Reg::Ret, Reg::Fp, t_start);
        self.em.add_rr(Reg::Ret, Reg::Scratch0);
        self.em.cvt_i2f(FReg::F1, Reg::Ret);
        self.em.fstore(Reg::Scratch1, 16, FReg::F1);
        self.em.add_ri(Reg::Scratch0, 1);
        self.em.jmp_back(top);
        self.em.patch_to_here(done);
        self.em.load(Reg::Scratch0, Reg::Fp, t_ptr);
        self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
        self.free_temp();
        self.free_temp();
        self.free_temp();
        Ok(())
    }

    pub(crate) fn emit_index(&mut self, base: &Expr, index: &Expr) -> Result<()> {
        // A range index is a slice
        if let Expr::Range { start, end, inclusive, .. } = index {
            self.emit_expr(base)?;
            let t_base = self.spill_f0()?;
            self.emit_expr(start)?;
            self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
            let t_start = self.alloc_temp()?;
            self.em.store(Reg::Fp, t_start, Reg::Scratch0);
            self.emit_expr(end)?;
            self.em.cvt_f2i(Reg::Arg2, FReg::F0);
            if *inclusive {
                self.em.add_ri(Reg::Arg2, 1);
            }
            self.em.load(Reg::Arg1, Reg::Fp, t_start);
            self.em.load(Reg::Arg0, Reg::Fp, t_base);
            self.free_temp();
            self.free_temp();
            self.em.call_symbol("flap_slice");
            self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
            return Ok(());
        }

        self.emit_expr(base)?;
        let t = self.spill_f0()?;
        self.emit_expr(index)?;
        self.em.load(Reg::Arg0, Reg::Fp, t);
        self.free_temp();
        if base.ty() == ValueType::Map {
            self.em.call_symbol("flap_map_get");
        } else {
            self.em.call_symbol("flap_index");
        }
        Ok(())
    }

    fn emit_cast(&mut self, value: &Expr, ty: ValueType) -> Result<()> {
        self.emit_expr(value)?;
        match ty {
            ValueType::CInt8 => self.narrow_signed(56),
            ValueType::CInt16 => self.narrow_signed(48),
            ValueType::CInt32 => self.narrow_signed(32),
            ValueType::CUInt8 => self.narrow_unsigned(0xff),
            ValueType::CUInt16 => self.narrow_unsigned(0xffff),
            ValueType::CUInt32 => self.narrow_unsigned(0xffff_ffff),
            ValueType::CInt64 | ValueType::CUInt64 => {
                self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
                self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
            }
            ValueType::CString => {
                if value.ty() == ValueType::String || value.ty() == ValueType::Unknown {
                    self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
                    self.em.call_symbol("flap_string_to_cstr");
                    self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
                }
            }
            // Doubles and raw pointers pass through unchanged
            _ => {}
        }
        Ok(())
    }

    fn narrow_signed(&mut self, shift: u8) {
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        self.em.shl_ri(Reg::Scratch0, shift);
        self.em.sar_ri(Reg::Scratch0, shift);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
    }

    fn narrow_unsigned(&mut self, mask: i64) {
        self.em.cvt_f2i(Reg::Scratch0, FReg::F0);
        self.em.mov_ri(Reg::Scratch1, mask);
        self.em.and_rr(Reg::Scratch0, Reg::Scratch1);
        self.em.cvt_i2f(FReg::F0, Reg::Scratch0);
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    pub(crate) fn emit_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<()> {
        if let Expr::Ident(ident) = callee {
            match &ident.resolution {
                Some(Resolution::Builtin(b)) => return self.emit_builtin_call(*b, args),
                Some(Resolution::Foreign { symbol }) => {
                    let decl = self.foreign_by_symbol(symbol)?;
                    return self.emit_c_call(&decl, args);
                }
                Some(Resolution::Local { lambda: Some(id), .. }) => {
                    let direct = self
                        .frames
                        .get(id)
                        .map(|f| f.captures.is_empty())
                        .unwrap_or(false);
                    if direct {
                        return self.emit_direct_call(*id, args);
                    }
                }
                _ => {}
            }
        }
        self.emit_indirect_call(callee, args)
    }

    /// Park each argument in a temp, then load them into F0..Fn.
    fn emit_args_to_fregs(&mut self, args: &[Expr]) -> Result<Vec<i32>> {
        let mut temps = Vec::new();
        for arg in args {
            self.emit_expr(arg)?;
            temps.push(self.spill_f0()?);
        }
        Ok(temps)
    }

    fn load_args_and_free(&mut self, temps: &[i32]) {
        for (i, t) in temps.iter().enumerate() {
            self.em.fload(FReg::from_index(i), Reg::Fp, *t);
        }
        for _ in temps {
            self.free_temp();
        }
    }

    fn emit_direct_call(&mut self, lambda_id: usize, args: &[Expr]) -> Result<()> {
        let temps = self.emit_args_to_fregs(args)?;
        self.load_args_and_free(&temps);
        self.em.mov_ri(Reg::VarCount, args.len() as i64);
        self.em.call_symbol(&format!("flap_lambda_{}", lambda_id));
        Ok(())
    }

    fn emit_indirect_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<()> {
        let temps = self.emit_args_to_fregs(args)?;
        self.emit_expr(callee)?;
        self.em.fmov_to_gpr(Reg::Ret, FReg::F0);
        self.em.mov_rr(Reg::Scratch0, Reg::Ret);
        self.em.add_ri(Reg::Scratch0, 16); // environment
        self.em.load(Reg::Scratch1, Reg::Ret, 0); // entry point
        self.load_args_and_free(&temps);
        self.em.mov_ri(Reg::VarCount, args.len() as i64);
        self.em.call_reg(Reg::Scratch1);
        Ok(())
    }

    fn emit_builtin_call(&mut self, builtin: Builtin, args: &[Expr]) -> Result<()> {
        match builtin {
            Builtin::Println | Builtin::Print => {
                let newline = (builtin == Builtin::Println) as i64;
                let arg = &args[0];
                self.emit_expr(arg)?;
                match arg.ty() {
                    ValueType::Number => {
                        self.em.mov_ri(Reg::Arg1, newline);
                        self.em.call_symbol("flap_print_number");
                    }
                    ValueType::String => {
                        self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
                        self.em.mov_ri(Reg::Arg1, newline);
                        self.em.call_symbol("flap_print_string");
                    }
                    _ => {
                        self.em.mov_ri(Reg::Arg1, newline);
                        self.em.call_symbol("flap_print_value");
                    }
                }
                self.em.fconst(FReg::F0, 0.0);
                Ok(())
            }
            Builtin::Sqrt | Builtin::Floor | Builtin::Ceil => {
                self.emit_expr(&args[0])?;
                let sym = builtin.libm_symbol().expect("math builtin");
                self.syms.import(sym, libm_name(self.target.os));
                if self.target.os == Os::Windows {
                    self.em.add_ri(Reg::Sp, -32);
                    self.em.call_symbol(sym);
                    self.em.add_ri(Reg::Sp, 32);
                } else {
                    self.em.call_symbol(sym);
                }
                Ok(())
            }
            Builtin::Abs => {
                // clear the sign bit
                self.emit_expr(&args[0])?;
                self.em.fmov_to_gpr(Reg::Scratch0, FReg::F0);
                self.em.mov_ri(Reg::Scratch1, i64::MAX);
                self.em.and_rr(Reg::Scratch0, Reg::Scratch1);
                self.em.fmov_from_gpr(FReg::F0, Reg::Scratch0);
                Ok(())
            }
            Builtin::Exit => {
                self.emit_expr(&args[0])?;
                self.em.cvt_f2i(Reg::Arg0, FReg::F0);
                match self.target.os {
                    Os::Windows => {
                        self.syms.import("ExitProcess", "kernel32.dll");
                        self.em.add_ri(Reg::Sp, -32);
                        self.em.call_symbol("ExitProcess");
                        self.em.add_ri(Reg::Sp, 32);
                    }
                    os => {
                        self.syms.import("exit", libc_name(os));
                        self.em.call_symbol("exit");
                    }
                }
                Ok(())
            }
            Builtin::AtomicAdd => {
                let addr = self.emit_atomic_addr(&args[0], &args[1], &args[2])?;
                // CAS loop: old + delta, retry until the slot is ours
                let top = self.em.len();
                self.em.load(Reg::Arg3, addr, 0);
                self.em.fmov_from_gpr(FReg::F1, Reg::Arg3);
                self.em.fadd(FReg::F1, FReg::F0);
                self.em.fmov_to_gpr(Reg::Arg4, FReg::F1);
                self.em.atomic_cas(addr, Reg::Arg3, Reg::Arg4, Reg::Arg5);
                let done = self.em.br_cmp_imm(Cond::Ne, Reg::Arg5, 0);
                self.em.jmp_back(top);
                self.em.patch_to_here(done);
                self.em.fmov_from_gpr(FReg::F0, Reg::Arg3);
                Ok(())
            }
            Builtin::AtomicCas => {
                // (list, index, expected, new) -> 1/0
                self.emit_expr(&args[0])?;
                let t_list = self.spill_f0()?;
                self.emit_expr(&args[1])?;
                let t_idx = self.spill_f0()?;
                self.emit_expr(&args[2])?;
                let t_exp = self.spill_f0()?;
                self.emit_expr(&args[3])?;
                self.em.fmov_to_gpr(Reg::Arg4, FReg::F0); // new bits
                self.em.fload(FReg::F1, Reg::Fp, t_exp);
                self.em.fmov_to_gpr(Reg::Arg3, FReg::F1); // expected bits
                self.em.fload(FReg::F1, Reg::Fp, t_idx);
                self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
                self.em.load(Reg::Scratch0, Reg::Fp, t_list);
                self.em.shl_ri(Reg::Scratch1, 4);
                self.em.add_rr(Reg::Scratch0, Reg::Scratch1);
                self.em.add_ri(Reg::Scratch0, 16);
                self.free_temp();
                self.free_temp();
                self.free_temp();
                self.em.atomic_cas(Reg::Scratch0, Reg::Arg3, Reg::Arg4, Reg::Arg5);
                self.em.cvt_i2f(FReg::F0, Reg::Arg5);
                Ok(())
            }
            Builtin::AtomicLoad => {
                self.emit_expr(&args[0])?;
                let t_list = self.spill_f0()?;
                self.emit_expr(&args[1])?;
                self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
                self.em.load(Reg::Scratch0, Reg::Fp, t_list);
                self.free_temp();
                self.em.shl_ri(Reg::Scratch1, 4);
                self.em.add_rr(Reg::Scratch0, Reg::Scratch1);
                self.em.fload(FReg::F0, Reg::Scratch0, 16);
                self.em.fence();
                Ok(())
            }
            Builtin::AtomicStore => {
                let addr = self.emit_atomic_addr(&args[0], &args[1], &args[2])?;
                self.em.fence();
                self.em.fstore(addr, 0, FReg::F0);
                self.em.fence();
                self.em.fconst(FReg::F0, 0.0);
                Ok(())
            }
        }
    }

    /// Shared setup for the three-argument atomics: evaluates list, index,
    /// and value; leaves the slot address in `Scratch0` and the value in
    /// `F0`.
    fn emit_atomic_addr(&mut self, list: &Expr, index: &Expr, value: &Expr) -> Result<Reg> {
        self.emit_expr(list)?;
        let t_list = self.spill_f0()?;
        self.emit_expr(index)?;
        let t_idx = self.spill_f0()?;
        self.emit_expr(value)?;
        self.em.fload(FReg::F1, Reg::Fp, t_idx);
        self.em.cvt_f2i(Reg::Scratch1, FReg::F1);
        self.em.load(Reg::Scratch0, Reg::Fp, t_list);
        self.em.shl_ri(Reg::Scratch1, 4);
        self.em.add_rr(Reg::Scratch0, Reg::Scratch1);
        self.em.add_ri(Reg::Scratch0, 16);
        self.free_temp();
        self.free_temp();
        Ok(Reg::Scratch0)
    }

    fn foreign_by_symbol(&self, symbol: &str) -> Result<FfiDecl> {
        self.config
            .foreign_by_symbol(symbol)
            .cloned()
            .ok_or_else(|| {
                CompileError::internal(format!("FFI symbol '{}' missing from manifests", symbol))
            })
    }

    /// Call a declared C function: marshal each argument per its declared
    /// type, align the stack, call the PLT stub (or IAT thunk), and convert
    /// the return value back to a double.
    fn emit_c_call(&mut self, decl: &FfiDecl, args: &[Expr]) -> Result<()> {
        let windows = self.target.os == Os::Windows;
        // Evaluate and marshal every argument to a temp first.
        let mut marshaled: Vec<(i32, CArgClass)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let declared = decl.args.get(i).copied().unwrap_or(ValueType::CFloat64);
            match declared {
                ValueType::CString => {
                    // String literals compile as C strings directly
                    if let Expr::Str { value, .. } = arg {
                        let sym = self.pool.cstr(value);
                        self.em.lea_symbol(Reg::Scratch1, &sym);
                    } else {
                        self.emit_expr(arg)?;
                        self.em.fmov_to_gpr(Reg::Arg0, FReg::F0);
                        self.em.call_symbol("flap_string_to_cstr");
                        self.em.mov_rr(Reg::Scratch1, Reg::Ret);
                    }
                    let t = self.alloc_temp()?;
                    self.em.store(Reg::Fp, t, Reg::Scratch1);
                    marshaled.push((t, CArgClass::Gpr));
                }
                ValueType::CFloat32 | ValueType::CFloat64 => {
                    self.emit_expr(arg)?;
                    let t = self.spill_f0()?;
                    marshaled.push((t, CArgClass::Fpr));
                }
                ValueType::CPointer => {
                    self.emit_expr(arg)?;
                    self.em.fmov_to_gpr(Reg::Scratch1, FReg::F0);
                    let t = self.alloc_temp()?;
                    self.em.store(Reg::Fp, t, Reg::Scratch1);
                    marshaled.push((t, CArgClass::Gpr));
                }
                _ => {
                    // integer widths via truncation
                    self.emit_expr(arg)?;
                    self.em.cvt_f2i(Reg::Scratch1, FReg::F0);
                    let t = self.alloc_temp()?;
                    self.em.store(Reg::Fp, t, Reg::Scratch1);
                    marshaled.push((t, CArgClass::Gpr));
                }
            }
        }

        // Load into ABI slots. System V classes GPR/FPR independently;
        // Win64 slots are positional.
        let arg_regs = [Reg::Arg0, Reg::Arg1, Reg::Arg2, Reg::Arg3, Reg::Arg4, Reg::Arg5];
        let mut n_gpr = 0usize;
        let mut n_fpr = 0usize;
        for (pos, (t, class)) in marshaled.iter().enumerate() {
            match class {
                CArgClass::Gpr => {
                    let slot = if windows { pos } else { n_gpr };
                    if slot >= arg_regs.len() {
                        return Err(CompileError::internal(format!(
                            "C call to '{}' needs more than {} register arguments",
                            decl.symbol,
                            arg_regs.len()
                        )));
                    }
                    self.em.load(arg_regs[slot], Reg::Fp, *t);
                    n_gpr += 1;
                }
                CArgClass::Fpr => {
                    let slot = if windows { pos } else { n_fpr };
                    self.em.fload(FReg::from_index(slot), Reg::Fp, *t);
                    n_fpr += 1;
                }
            }
        }
        for _ in &marshaled {
            self.free_temp();
        }

        self.syms.import(&decl.symbol, &lib_for(decl, self.target.os));
        if windows {
            self.em.add_ri(Reg::Sp, -32);
            self.em.call_symbol(&decl.symbol);
            self.em.add_ri(Reg::Sp, 32);
        } else {
            self.em.set_fp_vararg_count(n_fpr as u8);
            self.em.call_symbol(&decl.symbol);
        }

        // Return value: 64-bit integers survive exactly in a double's
        // 52-bit-plus mantissa for every value libc hands back in practice.
        match decl.ret {
            ValueType::CFloat32 | ValueType::CFloat64 => {}
            ValueType::CPointer | ValueType::CString => {
                self.em.fmov_from_gpr(FReg::F0, Reg::Ret);
            }
            ValueType::Unknown => {
                self.em.fconst(FReg::F0, 0.0);
            }
            _ => {
                self.em.cvt_i2f(FReg::F0, Reg::Ret);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Loop-counter plumbing shared with control_flow.rs
    // -----------------------------------------------------------------

    /// Claim the next counter tier: `Loop0..Loop2`, then frame slots.
    pub(crate) fn push_loop(&mut self) -> Result<CounterLoc> {
        let counter = match self.loops.len() {
            0 => CounterLoc::Reg(Reg::Loop0),
            1 => CounterLoc::Reg(Reg::Loop1),
            2 => CounterLoc::Reg(Reg::Loop2),
            _ => CounterLoc::Slot(self.alloc_temp()?),
        };
        self.loops.push(LoopCtx { counter, exit_fixups: Vec::new() });
        Ok(counter)
    }

    pub(crate) fn pop_loop(&mut self) -> LoopCtx {
        let ctx = self.loops.pop().expect("pop_loop without push");
        if matches!(ctx.counter, CounterLoc::Slot(_)) {
            self.free_temp();
        }
        ctx
    }

    pub(crate) fn set_counter(&mut self, counter: CounterLoc, value: i64) {
        match counter {
            CounterLoc::Reg(r) => self.em.mov_ri(r, value),
            CounterLoc::Slot(off) => {
                self.em.mov_ri(Reg::Scratch0, value);
                self.em.store(Reg::Fp, off, Reg::Scratch0);
            }
        }
    }

    /// Initialize the counter from a register.
    pub(crate) fn counter_from(&mut self, counter: CounterLoc, src: Reg) {
        match counter {
            CounterLoc::Reg(r) => self.em.mov_rr(r, src),
            CounterLoc::Slot(off) => self.em.store(Reg::Fp, off, src),
        }
    }

    /// The counter as a readable register (slot counters load into
    /// Scratch0).
    pub(crate) fn counter_to_reg(&mut self, counter: CounterLoc) -> Reg {
        match counter {
            CounterLoc::Reg(r) => r,
            CounterLoc::Slot(off) => {
                self.em.load(Reg::Scratch0, Reg::Fp, off);
                Reg::Scratch0
            }
        }
    }

    pub(crate) fn bump_counter(&mut self, counter: CounterLoc) {
        match counter {
            CounterLoc::Reg(r) => self.em.add_ri(r, 1),
            CounterLoc::Slot(off) => {
                self.em.load(Reg::Scratch0, Reg::Fp, off);
                self.em.add_ri(Reg::Scratch0, 1);
                self.em.store(Reg::Fp, off, Reg::Scratch0);
            }
        }
    }
}

fn libm_name(os: Os) -> &'static str {
    match os {
        Os::Linux => "libm.so.6",
        Os::Darwin => "/usr/lib/libSystem.B.dylib",
        Os::Windows => "msvcrt.dll",
    }
}

fn lib_for(decl: &FfiDecl, os: Os) -> String {
    match os {
        Os::Linux => decl.lib.soname.clone(),
        Os::Darwin => decl.lib.dylib.clone(),
        Os::Windows => decl.lib.dll.clone(),
    }
}
