//! Scope and symbol resolver
//!
//! Walks the AST before emission and computes, for the top-level program and
//! every lambda (and every parallel-loop worker, which gets a frame of its
//! own): a map from local name to stack slot, the capture set with source
//! resolutions, and the total frame size. Emission never changes a frame
//! after this pass.
//!
//! Slots are 16 bytes each and unique within their owning function's
//! activation; offsets are negative from the frame pointer. Expression
//! lowering spills intermediate values to dedicated temp slots at the end of
//! the frame, whose count is the maximum spill depth of any expression in
//! the function, computed here.

use crate::ast::{
    AssignKind, AssignTarget, BinOp, Body, Expr, FsPart, Ident, LambdaExpr, LoopStmt, MatchExpr,
    Program, Resolution, Stmt,
};
use crate::builtins::Builtin;
use crate::config::CompilerConfig;
use crate::error::{CompileError, ErrorKind, Result, Span};
use crate::types::ValueType;
use std::collections::HashMap;

/// Bytes per stack slot; every local is 16-byte aligned.
pub const SLOT_SIZE: i32 = 16;

/// Frame id of the top-level program body.
pub const MAIN_FRAME: usize = usize::MAX;

/// A named stack slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Negative offset from the frame pointer.
    pub offset: i32,
    pub mutable: bool,
    pub ty: ValueType,
    /// When this local holds a lambda defined at its initialization, the
    /// lambda id; lets calls check arity and go direct for capture-free
    /// lambdas.
    pub lambda: Option<usize>,
}

/// A captured variable, copied into the lambda's frame after its
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureInfo {
    pub name: String,
    /// Slot offset inside the capturing lambda's frame.
    pub offset: i32,
    /// Slot offset of the source value in the directly enclosing frame;
    /// the closure-creation site copies from here.
    pub source_offset: i32,
    pub ty: ValueType,
}

/// Per-function layout produced by resolution.
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub params: Vec<String>,
    pub variadic: Option<String>,
    /// Named slots by name. Shadowing rebinds overwrite the entry; the
    /// authoritative resolution is the one annotated on each identifier.
    pub slots: HashMap<String, Slot>,
    pub captures: Vec<CaptureInfo>,
    /// Count of allocated named slots (params + captures + locals),
    /// including shadowed ones whose map entry was replaced.
    pub named_slots: u32,
    /// Number of expression spill slots appended after the named slots.
    pub temps: u32,
    /// Total frame reservation in bytes, a multiple of 16.
    pub frame_size: u32,
    /// Arity info for direct calls: set for lambda frames.
    pub arity: usize,
}

impl FrameInfo {
    /// Offset of the n-th expression temp slot.
    pub fn temp_offset(&self, n: u32) -> i32 {
        -SLOT_SIZE * (self.named_slots as i32 + n as i32 + 1)
    }
}

/// Result of resolving a program: frame layouts keyed by lambda/loop id,
/// with [`MAIN_FRAME`] for the top level.
#[derive(Debug, Default)]
pub struct ResolvedProgram {
    pub frames: HashMap<usize, FrameInfo>,
}

/// One lexical scope: bindings defined at this level. Each scope owns its
/// slots so that a shadowing inner binding disappears when its scope ends.
#[derive(Debug, Default)]
struct Scope {
    names: HashMap<String, Slot>,
}

/// Per-function resolution state. Functions nest (lambdas, parallel loop
/// workers); idents falling through to an enclosing function become
/// captures.
struct FuncCtx {
    frame_id: usize,
    frame: FrameInfo,
    scopes: Vec<Scope>,
    next_slot: i32,
    max_temps: u32,
    /// Loop nesting depth, for `ret @N` validation.
    loop_depth: u32,
}

impl FuncCtx {
    fn new(frame_id: usize) -> Self {
        FuncCtx {
            frame_id,
            frame: FrameInfo::default(),
            scopes: vec![Scope::default()],
            next_slot: 0,
            max_temps: 0,
            loop_depth: 0,
        }
    }

    fn alloc_slot(&mut self, name: &str, mutable: bool, ty: ValueType, lambda: Option<usize>) -> i32 {
        self.next_slot += 1;
        let offset = -SLOT_SIZE * self.next_slot;
        let slot = Slot { offset, mutable, ty, lambda };
        self.frame.slots.insert(name.to_string(), slot.clone());
        self.scopes.last_mut().unwrap().names.insert(name.to_string(), slot);
        offset
    }

    /// Innermost slot visible under `name`, searching enclosing scopes.
    fn lookup(&self, name: &str) -> Option<&Slot> {
        self.scopes.iter().rev().find_map(|s| s.names.get(name))
    }

    /// Case-insensitive existence check across the whole scope chain; the
    /// `:=` shadow rule compares names this way.
    fn exists_ci(&self, name: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| s.names.keys().any(|k| k.eq_ignore_ascii_case(name)))
    }
}

pub struct Resolver<'a> {
    config: &'a CompilerConfig,
    /// Function context stack; last is the innermost.
    funcs: Vec<FuncCtx>,
    /// Arity of each resolved lambda, for call checking.
    lambda_arity: HashMap<usize, (usize, bool)>,
    frames: HashMap<usize, FrameInfo>,
}

/// Resolve a program in place, annotating identifier resolutions and
/// inferred types, and producing every frame layout.
pub fn resolve(program: &mut Program, config: &CompilerConfig) -> Result<ResolvedProgram> {
    let mut resolver = Resolver {
        config,
        funcs: vec![FuncCtx::new(MAIN_FRAME)],
        lambda_arity: HashMap::new(),
        frames: HashMap::new(),
    };
    for stmt in &mut program.stmts {
        resolver.resolve_stmt(stmt)?;
    }
    resolver.finish_current();
    Ok(ResolvedProgram { frames: resolver.frames })
}

impl<'a> Resolver<'a> {
    fn cur(&mut self) -> &mut FuncCtx {
        self.funcs.last_mut().unwrap()
    }

    /// Seal the innermost function: compute its frame size and store it.
    fn finish_current(&mut self) {
        let ctx = self.funcs.pop().unwrap();
        let mut frame = ctx.frame;
        frame.temps = ctx.max_temps;
        let named = ctx.next_slot as u32;
        frame.named_slots = named;
        frame.frame_size = SLOT_SIZE as u32 * (named + frame.temps);
        // Keep a nonzero frame so the prologue always has room for
        // alignment padding.
        if frame.frame_size == 0 {
            frame.frame_size = SLOT_SIZE as u32;
        }
        self.frames.insert(ctx.frame_id, frame);
    }

    fn note_temps(&mut self, expr: &Expr) {
        let needed = expr_temps(expr);
        let ctx = self.cur();
        if needed > ctx.max_temps {
            ctx.max_temps = needed;
        }
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn resolve_stmt(&mut self, stmt: &mut Stmt) -> Result<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.resolve_expr(expr)?;
                self.note_temps(expr);
                Ok(())
            }
            Stmt::Assign { targets, kind, shadow, op, value, span } => {
                self.resolve_expr(value)?;
                self.note_temps(value);
                let kind = *kind;
                let shadow = *shadow;
                let has_op = op.is_some();
                if has_op {
                    // compound lowering parks the current value
                    let needed = expr_temps(value) + 1;
                    let ctx = self.cur();
                    if needed > ctx.max_temps {
                        ctx.max_temps = needed;
                    }
                }
                if targets.len() > 1 && !matches!(value.ty(), ValueType::List | ValueType::Unknown)
                {
                    return Err(CompileError::new(
                        ErrorKind::TypeMismatch,
                        *span,
                        "tuple unpacking requires a list value",
                    ));
                }
                for target in targets.iter_mut() {
                    match target {
                        AssignTarget::Name(ident) => {
                            self.resolve_assign_name(ident, kind, shadow, has_op, value)?;
                        }
                        AssignTarget::Index { base, index, span } => {
                            self.resolve_expr(base)?;
                            self.resolve_expr(index)?;
                            // Lowering parks the base and index while the
                            // value evaluates (plus the entry address for
                            // compound forms)
                            let needed = expr_temps(base)
                                .max(expr_temps(index) + 1)
                                .max(expr_temps(value) + 3);
                            let ctx = self.cur();
                            if needed > ctx.max_temps {
                                ctx.max_temps = needed;
                            }
                            if kind != AssignKind::Update {
                                return Err(CompileError::new(
                                    ErrorKind::TypeMismatch,
                                    *span,
                                    "indexed targets can only be updated with '<-'",
                                ));
                            }
                        }
                    }
                }
                Ok(())
            }
            Stmt::Loop(l) => self.resolve_loop(l),
            Stmt::Ret { value, loop_depth, span } => {
                if let Some(expr) = value {
                    self.resolve_expr(expr)?;
                    self.note_temps(expr);
                }
                if let Some(depth) = loop_depth {
                    let ctx = self.funcs.last().unwrap();
                    if *depth > ctx.loop_depth {
                        return Err(CompileError::new(
                            ErrorKind::Parse,
                            *span,
                            format!(
                                "'ret @{}' exits more loops than are enclosing ({})",
                                depth, ctx.loop_depth
                            ),
                        ));
                    }
                }
                Ok(())
            }
            Stmt::Defer { expr, .. } => {
                self.resolve_expr(expr)?;
                self.note_temps(expr);
                Ok(())
            }
            Stmt::Unsafe { body, .. } | Stmt::ArenaBlock { body, .. } | Stmt::Block { body, .. } => {
                self.cur().scopes.push(Scope::default());
                for stmt in body {
                    self.resolve_stmt(stmt)?;
                }
                self.cur().scopes.pop();
                Ok(())
            }
        }
    }

    fn resolve_assign_name(
        &mut self,
        ident: &mut Ident,
        kind: AssignKind,
        shadow: bool,
        has_op: bool,
        value: &Expr,
    ) -> Result<()> {
        let name = ident.name.clone();
        match kind {
            AssignKind::Define { mutable } => {
                if mutable && !shadow && self.cur().exists_ci(&name) {
                    return Err(CompileError::new(
                        ErrorKind::Shadow,
                        ident.span,
                        format!(
                            "':=' would shadow existing '{}'; use 'shadow {} := ...' to shadow it",
                            name, name
                        ),
                    ));
                }
                if shadow && !self.shadows_something(&name) {
                    return Err(CompileError::new(
                        ErrorKind::Shadow,
                        ident.span,
                        format!("'shadow' used but '{}' does not shadow anything", name),
                    ));
                }
                let ty = value.ty();
                let lambda = match value {
                    Expr::Lambda(l) => Some(l.id),
                    _ => None,
                };
                let offset = self.cur().alloc_slot(&name, mutable, ty, lambda);
                ident.resolution = Some(Resolution::Local { offset, mutable, ty, lambda });
                Ok(())
            }
            AssignKind::Update => {
                // `<-` (and the compound forms): the target must already be
                // a mutable in scope.
                let found = self.cur().lookup(&name).cloned();
                match found {
                    Some(slot) if slot.mutable => {
                        ident.resolution = Some(Resolution::Local {
                            offset: slot.offset,
                            mutable: true,
                            ty: slot.ty,
                            lambda: slot.lambda,
                        });
                        Ok(())
                    }
                    Some(_) => Err(CompileError::new(
                        ErrorKind::Immutable,
                        ident.span,
                        format!("cannot update immutable '{}'", name),
                    )),
                    None => {
                        // A capture is a copy; updating it would silently
                        // not propagate, so reject like an undefined name.
                        let op = if has_op { "compound assignment" } else { "'<-'" };
                        Err(CompileError::new(
                            ErrorKind::NotDefined,
                            ident.span,
                            format!("{} target '{}' is not a defined mutable", op, name),
                        ))
                    }
                }
            }
        }
    }

    /// Does defining `name` here shadow an existing binding (any scope of
    /// this function, or an enclosing function)?
    fn shadows_something(&self, name: &str) -> bool {
        self.funcs.iter().any(|f| f.exists_ci(name))
    }

    fn resolve_loop(&mut self, l: &mut LoopStmt) -> Result<()> {
        self.resolve_expr(&mut l.iterable)?;
        if let Some(max) = &mut l.max {
            self.resolve_expr(max)?;
            self.note_temps(max);
        }
        // Loop lowering parks the bound, the list pointer, the max
        // counters, the worker environment, and possibly a spilled loop
        // counter alongside the iterable and max expressions
        let max_needs = l.max.as_ref().map(|m| expr_temps(m) + 3).unwrap_or(0);
        let needed = expr_temps(&l.iterable).max(max_needs) + 6;
        let ctx = self.cur();
        if needed > ctx.max_temps {
            ctx.max_temps = needed;
        }

        if l.parallel {
            // The body becomes a worker function with its own frame; outer
            // names used inside are captured by copy, sharing heap data
            // through pointers.
            self.funcs.push(FuncCtx::new(l.id));
            let over_list = !matches!(l.iterable, Expr::Range { .. });
            let ctx = self.cur();
            ctx.frame.params = vec![l.var.clone()];
            ctx.frame.arity = 1;
            ctx.alloc_slot(&l.var, false, ValueType::Number, None);
            // Hidden slots ($ cannot appear in user identifiers): the
            // worker's end index, and the iterated list's pointer.
            ctx.alloc_slot("$end", false, ValueType::Number, None);
            if over_list {
                ctx.alloc_slot("$list", false, ValueType::List, None);
            }
            ctx.loop_depth = 1;
            for stmt in &mut l.body {
                self.resolve_stmt(stmt)?;
            }
            self.finish_current();
        } else {
            let ctx = self.cur();
            ctx.scopes.push(Scope::default());
            ctx.loop_depth += 1;
            // The iterator variable lives in a normal slot; the counter
            // itself stays in a reserved callee-saved register.
            l.var_offset = self.cur().alloc_slot(&l.var, false, ValueType::Number, None);
            for stmt in &mut l.body {
                self.resolve_stmt(stmt)?;
            }
            let ctx = self.cur();
            ctx.loop_depth -= 1;
            ctx.scopes.pop();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn resolve_expr(&mut self, expr: &mut Expr) -> Result<()> {
        match expr {
            Expr::Number { .. } | Expr::Str { .. } => Ok(()),
            Expr::FString { parts, .. } => {
                for part in parts {
                    if let FsPart::Expr(e) = part {
                        self.resolve_expr(e)?;
                    }
                }
                Ok(())
            }
            Expr::List { items, .. } => {
                for item in items {
                    self.resolve_expr(item)?;
                }
                Ok(())
            }
            Expr::MapLit { entries, .. } => {
                for (k, v) in entries {
                    self.resolve_expr(k)?;
                    self.resolve_expr(v)?;
                }
                Ok(())
            }
            Expr::Ident(ident) => self.resolve_ident(ident),
            Expr::Unary { operand, .. } => self.resolve_expr(operand),
            Expr::Binary { op, lhs, rhs, ty, .. } => {
                self.resolve_expr(lhs)?;
                self.resolve_expr(rhs)?;
                *ty = infer_binary(*op, lhs, rhs);
                Ok(())
            }
            Expr::Lambda(l) => self.resolve_lambda(l),
            Expr::Match(m) => self.resolve_match(m),
            Expr::Call { callee, args, span } => {
                self.resolve_expr(callee)?;
                for arg in args.iter_mut() {
                    self.resolve_expr(arg)?;
                }
                self.check_call_arity(callee, args.len(), *span)
            }
            Expr::Index { base, index, .. } => {
                self.resolve_expr(base)?;
                self.resolve_expr(index)
            }
            Expr::Property { base, name, span } => {
                self.resolve_expr(base)?;
                if name != "error" {
                    return Err(CompileError::new(
                        ErrorKind::TypeMismatch,
                        *span,
                        format!("unknown property '.{}'", name),
                    ));
                }
                Ok(())
            }
            Expr::Range { start, end, .. } => {
                self.resolve_expr(start)?;
                self.resolve_expr(end)
            }
            Expr::Cast { value, .. } => self.resolve_expr(value),
            Expr::Head { base, .. } | Expr::Tail { base, .. } => self.resolve_expr(base),
        }
    }

    fn resolve_ident(&mut self, ident: &mut Ident) -> Result<()> {
        let name = ident.name.clone();

        // Innermost function first
        if let Some(slot) = self.funcs.last().unwrap().lookup(&name) {
            ident.resolution = Some(Resolution::Local {
                offset: slot.offset,
                mutable: slot.mutable,
                ty: slot.ty,
                lambda: slot.lambda,
            });
            return Ok(());
        }

        // Enclosing functions: capture by copy into every intermediate
        // lambda so nested closures keep working.
        let depth = self.funcs.len();
        for outer in (0..depth.saturating_sub(1)).rev() {
            if let Some(slot) = self.funcs[outer].lookup(&name) {
                let ty = slot.ty;
                let mut source = slot.offset;
                let mut offset = 0;
                for level in outer + 1..depth {
                    offset = self.capture_into(level, &name, ty, source);
                    source = offset;
                }
                ident.resolution = Some(Resolution::Capture { offset, ty });
                return Ok(());
            }
        }

        if let Some(builtin) = Builtin::lookup(&name) {
            ident.resolution = Some(Resolution::Builtin(builtin));
            return Ok(());
        }

        if let Some(decl) = self.config.foreign(&name) {
            ident.resolution = Some(Resolution::Foreign { symbol: decl.symbol.clone() });
            return Ok(());
        }

        if let Some(value) = self.config.constant(&name) {
            ident.resolution = Some(Resolution::Constant(value));
            return Ok(());
        }

        Err(CompileError::new(
            ErrorKind::UndefinedName,
            ident.span,
            format!("'{}' is not defined in any scope and is not a builtin", name),
        ))
    }

    /// Ensure `name` is captured by the function at stack level `level`
    /// (copying from `source_offset` in its parent), returning its slot
    /// offset there.
    fn capture_into(&mut self, level: usize, name: &str, ty: ValueType, source_offset: i32) -> i32 {
        if let Some(slot) = self.funcs[level].frame.slots.get(name) {
            return slot.offset;
        }
        let ctx = &mut self.funcs[level];
        ctx.next_slot += 1;
        let offset = -SLOT_SIZE * ctx.next_slot;
        let slot = Slot { offset, mutable: false, ty, lambda: None };
        ctx.frame.slots.insert(name.to_string(), slot.clone());
        // Captures are visible in the function's outermost scope
        ctx.scopes[0].names.insert(name.to_string(), slot);
        ctx.frame.captures.push(CaptureInfo {
            name: name.to_string(),
            offset,
            source_offset,
            ty,
        });
        offset
    }

    fn resolve_lambda(&mut self, l: &mut LambdaExpr) -> Result<()> {
        self.lambda_arity
            .insert(l.id, (l.params.len(), l.variadic.is_some()));
        self.funcs.push(FuncCtx::new(l.id));
        {
            let ctx = self.cur();
            ctx.frame.params = l.params.clone();
            ctx.frame.variadic = l.variadic.clone();
            ctx.frame.arity = l.params.len();
            for param in &l.params {
                ctx.alloc_slot(param, false, ValueType::Unknown, None);
            }
            if let Some(variadic) = &l.variadic {
                ctx.alloc_slot(variadic, false, ValueType::List, None);
            }
        }
        match &mut l.body {
            Body::Expr(expr) => {
                self.resolve_expr(expr)?;
                self.note_temps(expr);
            }
            Body::Block(stmts) => {
                for stmt in stmts {
                    self.resolve_stmt(stmt)?;
                }
            }
        }
        self.finish_current();
        Ok(())
    }

    fn resolve_match(&mut self, m: &mut MatchExpr) -> Result<()> {
        self.resolve_expr(&mut m.scrutinee)?;
        let mut arm_types = Vec::new();
        for arm in &mut m.arms {
            if let Some(pattern) = &mut arm.pattern {
                self.resolve_expr(pattern)?;
            }
            if let Some(guard) = &mut arm.guard {
                self.resolve_expr(guard)?;
            }
            arm_types.push(self.resolve_body(&mut arm.result)?);
        }
        if let Some(default) = &mut m.default {
            arm_types.push(self.resolve_body(default)?);
        }
        // The match type is the arms' type when they agree; rodata string
        // results rely on this so every arm emits the same move shape.
        let mut ty = ValueType::Unknown;
        for at in arm_types {
            if ty == ValueType::Unknown {
                ty = at;
            } else if at != ValueType::Unknown && at != ty {
                ty = ValueType::Unknown;
                break;
            }
        }
        m.ty = ty;
        Ok(())
    }

    fn resolve_body(&mut self, body: &mut Body) -> Result<ValueType> {
        match body {
            Body::Expr(expr) => {
                self.resolve_expr(expr)?;
                self.note_temps(expr);
                Ok(expr.ty())
            }
            Body::Block(stmts) => {
                self.cur().scopes.push(Scope::default());
                for stmt in stmts {
                    self.resolve_stmt(stmt)?;
                }
                self.cur().scopes.pop();
                Ok(ValueType::Unknown)
            }
        }
    }

    fn check_call_arity(&self, callee: &Expr, n_args: usize, span: Span) -> Result<()> {
        let Expr::Ident(ident) = callee else { return Ok(()) };
        match &ident.resolution {
            Some(Resolution::Builtin(b)) => {
                if n_args != b.arity() {
                    return Err(CompileError::new(
                        ErrorKind::Arity,
                        span,
                        format!(
                            "'{}' takes {} argument(s), got {}",
                            ident.name,
                            b.arity(),
                            n_args
                        ),
                    ));
                }
                Ok(())
            }
            Some(Resolution::Local { lambda: Some(id), .. }) => {
                if let Some((arity, variadic)) = self.lambda_arity.get(id) {
                    let ok = if *variadic { n_args >= *arity } else { n_args == *arity };
                    if !ok {
                        return Err(CompileError::new(
                            ErrorKind::Arity,
                            span,
                            format!(
                                "'{}' takes {}{} argument(s), got {}",
                                ident.name,
                                if *variadic { "at least " } else { "" },
                                arity,
                                n_args
                            ),
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Type inference and temp accounting
// ---------------------------------------------------------------------------

fn infer_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> ValueType {
    match op {
        BinOp::Add => match (lhs.ty(), rhs.ty()) {
            (ValueType::String, _) | (_, ValueType::String) => ValueType::String,
            (ValueType::List, _) | (_, ValueType::List) => ValueType::List,
            (ValueType::Number, ValueType::Number) => ValueType::Number,
            _ => ValueType::Unknown,
        },
        BinOp::Sub | BinOp::Mul | BinOp::Mod | BinOp::Pow => ValueType::Number,
        // Division can produce an encoded error (division by zero)
        BinOp::Div => ValueType::Result,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => ValueType::Number,
        BinOp::And | BinOp::Or => ValueType::Number,
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr | BinOp::Rol
        | BinOp::Ror => ValueType::Number,
        BinOp::Cons => ValueType::List,
        BinOp::OrElse => {
            // The error side is stripped; the result is whichever success
            // type the operands agree on.
            let l = match lhs.ty() {
                ValueType::Result => ValueType::Number,
                other => other,
            };
            let r = rhs.ty();
            if l == r { l } else if r == ValueType::Unknown { l } else { ValueType::Unknown }
        }
        BinOp::Pipe => ValueType::Unknown,
        BinOp::ParMap => ValueType::List,
        BinOp::Reduce => ValueType::Unknown,
        BinOp::Send => ValueType::Number,
    }
}

/// Maximum number of spill slots expression lowering needs for `expr`,
/// mirroring the code generator's evaluation order (left operand spilled
/// while the right evaluates; call arguments parked one per slot).
pub fn expr_temps(expr: &Expr) -> u32 {
    match expr {
        Expr::Number { .. } | Expr::Str { .. } | Expr::Ident(_) => 0,
        Expr::FString { parts, .. } => {
            let inner = parts
                .iter()
                .map(|p| match p {
                    FsPart::Expr(e) => expr_temps(e),
                    FsPart::Text(_) => 0,
                })
                .max()
                .unwrap_or(0);
            1 + inner
        }
        Expr::List { items, .. } => {
            1 + items.iter().map(expr_temps).max().unwrap_or(0)
        }
        Expr::MapLit { entries, .. } => {
            1 + entries
                .iter()
                .map(|(k, v)| expr_temps(k).max(expr_temps(v) + 1))
                .max()
                .unwrap_or(0)
        }
        Expr::Unary { operand, .. } => expr_temps(operand),
        Expr::Binary { op, lhs, rhs, .. } => {
            let base = expr_temps(lhs).max(expr_temps(rhs) + 1);
            match op {
                // The sequential map/reduce loops park the list, the
                // output/accumulator, and the callable
                BinOp::ParMap | BinOp::Reduce => base + 3,
                _ => base,
            }
        }
        Expr::Lambda(_) => 0,
        Expr::Match(m) => {
            let arms = m
                .arms
                .iter()
                .flat_map(|a| {
                    a.pattern
                        .iter()
                        .chain(a.guard.iter())
                        .map(expr_temps)
                        .chain(body_temps(&a.result))
                })
                .max()
                .unwrap_or(0);
            let default = m.default.as_ref().and_then(body_temps).unwrap_or(0);
            1 + expr_temps(&m.scrutinee).max(arms).max(default)
        }
        Expr::Call { callee, args, .. } => {
            let spread = args
                .iter()
                .enumerate()
                .map(|(i, a)| i as u32 + expr_temps(a))
                .max()
                .unwrap_or(0);
            (args.len() as u32)
                .max(spread)
                .max(expr_temps(callee))
                + 1
        }
        Expr::Index { base, index, .. } => expr_temps(base).max(expr_temps(index) + 1),
        Expr::Property { base, .. } => expr_temps(base),
        // Materializing a range parks start, count, and the list pointer
        Expr::Range { start, end, .. } => expr_temps(start).max(expr_temps(end) + 1) + 2,
        Expr::Cast { value, .. } => expr_temps(value),
        Expr::Head { base, .. } | Expr::Tail { base, .. } => expr_temps(base),
    }
}

fn body_temps(body: &Body) -> Option<u32> {
    match body {
        Body::Expr(e) => Some(expr_temps(e)),
        // Block statements account their own temps through note_temps
        Body::Block(_) => Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn resolve_src(source: &str) -> Result<(Program, ResolvedProgram)> {
        let mut program = Parser::new(source)?.parse()?;
        let config = CompilerConfig::default();
        let resolved = resolve(&mut program, &config)?;
        Ok((program, resolved))
    }

    #[test]
    fn test_simple_locals() {
        let (_, resolved) = resolve_src("x = 1\ny := 2\ny <- y + x").unwrap();
        let main = &resolved.frames[&MAIN_FRAME];
        assert_eq!(main.slots["x"].mutable, false);
        assert_eq!(main.slots["y"].mutable, true);
        assert_ne!(main.slots["x"].offset, main.slots["y"].offset);
        assert_eq!(main.slots["x"].offset % 16, 0);
    }

    #[test]
    fn test_shadow_error_on_mutable_redefine() {
        let err = resolve_src("x = 1\nfn = () => { x := 2 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Shadow);
    }

    #[test]
    fn test_shadow_error_is_case_insensitive() {
        let err = resolve_src("total = 1\nTotal := 2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Shadow);
    }

    #[test]
    fn test_shadow_prefix_allows_it() {
        assert!(resolve_src("x = 1\nshadow x := 2").is_ok());
    }

    #[test]
    fn test_shadow_with_nothing_to_shadow() {
        let err = resolve_src("shadow fresh = 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Shadow);
    }

    #[test]
    fn test_immutable_update_rejected() {
        let err = resolve_src("x = 1\nx <- 2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Immutable);
    }

    #[test]
    fn test_update_undefined_rejected() {
        let err = resolve_src("ghost <- 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotDefined);
    }

    #[test]
    fn test_undefined_name() {
        let err = resolve_src("y = nonexistent + 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedName);
    }

    #[test]
    fn test_rebinding_immutable_is_allowed() {
        assert!(resolve_src("x = 1\nx = 2").is_ok());
    }

    #[test]
    fn test_frame_size_invariant() {
        let (_, resolved) =
            resolve_src("f = (a, b) => { c = a + b\nd = c * 2\nd }").unwrap();
        let frame = resolved.frames.values().find(|f| f.arity == 2).unwrap();
        let named = frame.slots.len() as u32;
        assert!(frame.frame_size >= 16 * named);
        assert_eq!(frame.frame_size % 16, 0);
    }

    #[test]
    fn test_lambda_captures() {
        let (_, resolved) = resolve_src("base = 10\nadd = x => x + base\ny = add(1)").unwrap();
        let lambda = resolved.frames.values().find(|f| f.arity == 1).unwrap();
        assert_eq!(lambda.captures.len(), 1);
        assert_eq!(lambda.captures[0].name, "base");
        // Capture slot comes after the parameter slot
        assert_eq!(lambda.slots["x"].offset, -16);
        assert_eq!(lambda.captures[0].offset, -32);
    }

    #[test]
    fn test_nested_lambda_captures_chain() {
        let (_, resolved) =
            resolve_src("k = 5\nouter = a => { inner = b => b + k\ninner(a) }").unwrap();
        // Both lambdas capture k
        let capturing: Vec<_> = resolved
            .frames
            .values()
            .filter(|f| f.captures.iter().any(|c| c.name == "k"))
            .collect();
        assert_eq!(capturing.len(), 2);
    }

    #[test]
    fn test_variadic_param_is_list() {
        let (_, resolved) = resolve_src("f = (first, rest...) => first\nz = f(1, 2, 3)").unwrap();
        let frame = resolved.frames.values().find(|f| f.variadic.is_some()).unwrap();
        assert_eq!(frame.slots["rest"].ty, ValueType::List);
    }

    #[test]
    fn test_arity_error() {
        let err = resolve_src("f = (a, b) => a + b\nz = f(1)").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arity);
        let err = resolve_src("z = println(1, 2)").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arity);
    }

    #[test]
    fn test_variadic_arity_is_a_minimum() {
        assert!(resolve_src("f = (a, rest...) => a\nz = f(1)").is_ok());
        assert!(resolve_src("f = (a, rest...) => a\nz = f(1, 2, 3, 4)").is_ok());
        let err = resolve_src("f = (a, rest...) => a\nz = f()").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Arity);
    }

    #[test]
    fn test_parallel_loop_gets_worker_frame() {
        let (program, resolved) =
            resolve_src("out := [0, 0, 0, 0]\n@@ i in 0..<4 { out[i] <- i * i }").unwrap();
        let loop_id = match &program.stmts[1] {
            Stmt::Loop(l) => l.id,
            other => panic!("{:?}", other),
        };
        let worker = &resolved.frames[&loop_id];
        assert!(worker.slots.contains_key("i"));
        assert!(worker.slots.contains_key("$end"));
        assert!(worker.captures.iter().any(|c| c.name == "out"));
    }

    #[test]
    fn test_loop_var_scoped_to_body() {
        let err = resolve_src("@ i in 0..<3 { x = i }\ny = i").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UndefinedName);
    }

    #[test]
    fn test_ret_depth_validated() {
        let err = resolve_src("@ i in 0..<3 { ret @2 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(resolve_src("@ i in 0..<3 { @ j in 0..<3 { ret @2 } }").is_ok());
    }

    #[test]
    fn test_division_is_result_typed() {
        let (program, _) = resolve_src("x := 10 / 0").unwrap();
        match &program.stmts[0] {
            Stmt::Assign { value, .. } => assert_eq!(value.ty(), ValueType::Result),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_string_concat_type() {
        let (program, _) = resolve_src(r#"s = "a" + "b""#).unwrap();
        match &program.stmts[0] {
            Stmt::Assign { value, .. } => assert_eq!(value.ty(), ValueType::String),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_match_type_agreement() {
        let (program, _) =
            resolve_src(r#"x = 1
name = x { 1 -> "one" 2 -> "two" ~> "many" }"#).unwrap();
        match &program.stmts[1] {
            Stmt::Assign { value: Expr::Match(m), .. } => assert_eq!(m.ty, ValueType::String),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_temps_accounting() {
        // ((1+2)+(3+4)) needs a temp per pending left operand
        let (_, resolved) = resolve_src("v = (1 + 2) + (3 + 4)").unwrap();
        let main = &resolved.frames[&MAIN_FRAME];
        assert!(main.temps >= 1);
        assert!(main.frame_size >= 16 * (main.slots.len() as u32 + main.temps));
    }

    #[test]
    fn test_builtin_resolution() {
        let (program, _) = resolve_src("println(1)").unwrap();
        match &program.stmts[0] {
            Stmt::Expr(Expr::Call { callee, .. }) => match callee.as_ref() {
                Expr::Ident(i) => {
                    assert!(matches!(i.resolution, Some(Resolution::Builtin(Builtin::Println))));
                }
                other => panic!("{:?}", other),
            },
            other => panic!("{:?}", other),
        }
    }
}
