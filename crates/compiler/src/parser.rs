//! Recursive-descent parser for Flap
//!
//! Expressions are parsed with precedence climbing; statements are
//! recognized by bounded lookahead over the token stream. The overloaded
//! `{ … }` forms (statement block, match block, map literal) are
//! disambiguated by [`Parser::classify_brace`], which peeks past whitespace
//! and at most one key/colon or arm prefix:
//!
//! - map literal when the first inner token is a key followed by `:`
//! - match block when the first inner construct is a guard (`|`), an arm
//!   (`expr ->`), or the default marker (`~>`)
//! - statement block otherwise
//!
//! Assignment statements cover the three operators with distinct semantics
//! (`=` define-immutable, `:=` define-mutable, `<-` update) plus the
//! compound forms, which lower to `<-` with an attached binary operator.

use crate::ast::{
    AssignKind, AssignTarget, BinOp, Body, Expr, FsPart, Ident, Import, LambdaExpr, LoopStmt,
    MatchArm, MatchExpr, Program, Stmt, UnaryOp,
};
use crate::error::{CompileError, ErrorKind, Result, Span};
use crate::lexer::{self, FStrPart, Token, TokenKind};
use crate::types::ValueType;

/// What a `{` opens, per the block disambiguation contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BraceKind {
    Map,
    Match,
    Block,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Counter for assigning unique ids to lambdas and loops; the resolver
    /// keys frame layouts by these.
    next_id: usize,
    /// When nonzero, a `{` after an expression belongs to an enclosing
    /// construct (loop body, lambda block) and must not parse as a match.
    no_brace: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self> {
        Parser::with_first_id(source, 0)
    }

    /// Parse with the lambda/loop id counter seeded; imported files continue
    /// the importing program's id sequence so frames stay uniquely keyed.
    pub(crate) fn with_first_id(source: &str, first_id: usize) -> Result<Self> {
        let tokens = lexer::tokenize(source).map_err(|e| {
            CompileError::new(ErrorKind::Lex, Span::new(e.line, e.col), e.message)
        })?;
        Ok(Parser { tokens, pos: 0, next_id: first_id, no_brace: 0 })
    }

    /// First id not yet handed out; valid after `parse`.
    pub(crate) fn next_id(&self) -> usize {
        self.next_id
    }

    /// Parse a nested source fragment (f-string expressions) with positions
    /// offset to the fragment's place in the outer file. `first_id` seeds the
    /// lambda/loop id counter so ids stay unique across fragments.
    fn new_fragment(source: &str, line: u32, col: u32, first_id: usize) -> Result<Self> {
        let mut tokens = lexer::tokenize(source).map_err(|e| {
            let (l, c) = offset_pos(e.line, e.col, line, col);
            CompileError::new(ErrorKind::Lex, Span::new(l, c), e.message)
        })?;
        for t in &mut tokens {
            let (l, c) = offset_pos(t.line, t.col, line, col);
            t.line = l;
            t.col = c;
        }
        Ok(Parser { tokens, pos: 0, next_id: first_id, no_brace: 0 })
    }

    pub fn parse(&mut self) -> Result<Program> {
        let mut program = Program::new();
        self.skip_separators();
        while self.check(&TokenKind::Import) {
            program.imports.push(self.parse_import()?);
            self.skip_separators();
        }
        while !self.is_at_end() {
            program.stmts.push(self.parse_stmt()?);
            self.skip_separators();
        }
        Ok(program)
    }

    // -----------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_at(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn span(&self) -> Span {
        self.peek()
            .map(|t| Span::new(t.line, t.col))
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|t| Span::new(t.line, t.col))
                    .unwrap_or_default()
            })
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Span> {
        let span = self.span();
        if self.eat(kind) {
            Ok(span)
        } else {
            Err(self.error(format!(
                "expected {}, found {}",
                what,
                self.describe_current()
            )))
        }
    }

    fn describe_current(&self) -> String {
        match self.peek_kind() {
            Some(TokenKind::Ident(name)) => format!("identifier '{}'", name),
            Some(TokenKind::Number(n)) => format!("number {}", n),
            Some(TokenKind::Newline) => "end of line".to_string(),
            Some(kind) => format!("{:?}", kind),
            None => "end of input".to_string(),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(ErrorKind::Parse, self.span(), message)
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek_kind(), Some(TokenKind::Newline) | Some(TokenKind::Semicolon)) {
            self.pos += 1;
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), Some(TokenKind::Newline)) {
            self.pos += 1;
        }
    }

    fn fresh_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // -----------------------------------------------------------------
    // Imports
    // -----------------------------------------------------------------

    /// `import "path"` or `import name as alias`
    fn parse_import(&mut self) -> Result<Import> {
        let span = self.span();
        self.expect(&TokenKind::Import, "'import'")?;
        match self.advance().map(|t| t.kind) {
            Some(TokenKind::Str(path)) => Ok(Import::Path { path, span }),
            Some(TokenKind::Ident(name)) => {
                let alias = if self.eat(&TokenKind::As) {
                    match self.advance().map(|t| t.kind) {
                        Some(TokenKind::Ident(alias)) => Some(alias),
                        _ => return Err(self.error("expected alias name after 'as'")),
                    }
                } else {
                    None
                };
                Ok(Import::Lib { name, alias, span })
            }
            _ => Err(self.error("expected \"path\" or library name after 'import'")),
        }
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let span = self.span();
        match self.peek_kind() {
            Some(TokenKind::Shadow) => {
                self.advance();
                let mut stmt = self.parse_assign_or_expr()?;
                match &mut stmt {
                    Stmt::Assign { kind: AssignKind::Define { .. }, shadow, .. } => {
                        *shadow = true;
                        Ok(stmt)
                    }
                    _ => Err(CompileError::new(
                        ErrorKind::Parse,
                        span,
                        "'shadow' must prefix a definition ('=' or ':=')",
                    )),
                }
            }
            Some(TokenKind::Defer) => {
                self.advance();
                let expr = self.parse_expr()?;
                Ok(Stmt::Defer { expr, span })
            }
            Some(TokenKind::Unsafe) => {
                self.advance();
                let body = self.parse_block()?;
                Ok(Stmt::Unsafe { body, span })
            }
            Some(TokenKind::Arena) => {
                self.advance();
                let body = self.parse_block()?;
                Ok(Stmt::ArenaBlock { body, span })
            }
            Some(TokenKind::Ret) => {
                self.advance();
                if self.eat(&TokenKind::At) {
                    let depth = match self.peek_kind() {
                        Some(TokenKind::Number(n)) => {
                            let n = *n;
                            self.advance();
                            if n < 1.0 || n.fract() != 0.0 {
                                return Err(CompileError::new(
                                    ErrorKind::Parse,
                                    span,
                                    "loop exit depth must be a positive integer",
                                ));
                            }
                            n as u32
                        }
                        _ => 1,
                    };
                    Ok(Stmt::Ret { value: None, loop_depth: Some(depth), span })
                } else if self.stmt_finished() {
                    Ok(Stmt::Ret { value: None, loop_depth: None, span })
                } else {
                    let value = self.parse_expr()?;
                    Ok(Stmt::Ret { value: Some(value), loop_depth: None, span })
                }
            }
            Some(TokenKind::At) | Some(TokenKind::AtAt) => self.parse_loop(),
            Some(TokenKind::LBrace) if self.classify_brace() == BraceKind::Block => {
                let body = self.parse_block()?;
                Ok(Stmt::Block { body, span })
            }
            _ => self.parse_assign_or_expr(),
        }
    }

    fn stmt_finished(&self) -> bool {
        matches!(
            self.peek_kind(),
            None | Some(TokenKind::Newline) | Some(TokenKind::Semicolon) | Some(TokenKind::RBrace)
        )
    }

    /// `@ i in iterable [max N] { body }` (sequential) or `@@ …` (parallel).
    fn parse_loop(&mut self) -> Result<Stmt> {
        let span = self.span();
        let parallel = match self.advance().map(|t| t.kind) {
            Some(TokenKind::At) => false,
            Some(TokenKind::AtAt) => true,
            _ => return Err(self.error("expected '@' or '@@'")),
        };
        let var = match self.advance().map(|t| t.kind) {
            Some(TokenKind::Ident(name)) => name,
            _ => return Err(self.error("expected iterator name after loop marker")),
        };
        self.expect(&TokenKind::In, "'in'")?;
        self.no_brace += 1;
        let iterable = self.parse_expr();
        let max = if iterable.is_ok() && self.eat(&TokenKind::Max) {
            Some(self.parse_expr())
        } else {
            None
        };
        self.no_brace -= 1;
        let iterable = iterable?;
        let max = max.transpose()?;
        let body = self.parse_block()?;
        Ok(Stmt::Loop(LoopStmt {
            id: self.fresh_id(),
            var,
            var_offset: 0,
            iterable,
            body,
            max,
            parallel,
            span,
        }))
    }

    /// `{ stmt* }` where the brace has already been classified (or is known
    /// from context) to open a statement block.
    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.skip_newlines();
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut body = Vec::new();
        self.skip_separators();
        while !self.check(&TokenKind::RBrace) {
            if self.is_at_end() {
                return Err(self.error("unbalanced '{': block never closed"));
            }
            body.push(self.parse_stmt()?);
            self.skip_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(body)
    }

    /// Assignment statement or expression statement. Assignments are spotted
    /// by parsing a comma-separated expression list and then looking at the
    /// operator that follows.
    fn parse_assign_or_expr(&mut self) -> Result<Stmt> {
        let span = self.span();
        let mut exprs = vec![self.parse_expr()?];
        while self.eat(&TokenKind::Comma) {
            self.skip_newlines();
            exprs.push(self.parse_expr()?);
        }

        let (kind, op) = match self.peek_kind() {
            Some(TokenKind::Assign) => (AssignKind::Define { mutable: false }, None),
            Some(TokenKind::DefineMut) => (AssignKind::Define { mutable: true }, None),
            Some(TokenKind::Update) => (AssignKind::Update, None),
            Some(TokenKind::PlusAssign) => (AssignKind::Update, Some(BinOp::Add)),
            Some(TokenKind::MinusAssign) => (AssignKind::Update, Some(BinOp::Sub)),
            Some(TokenKind::StarAssign) => (AssignKind::Update, Some(BinOp::Mul)),
            Some(TokenKind::SlashAssign) => (AssignKind::Update, Some(BinOp::Div)),
            Some(TokenKind::PercentAssign) => (AssignKind::Update, Some(BinOp::Mod)),
            _ => {
                if exprs.len() > 1 {
                    return Err(self.error("expected assignment after tuple targets"));
                }
                return Ok(Stmt::Expr(exprs.pop().unwrap()));
            }
        };
        self.advance();
        self.skip_newlines();

        let mut targets = Vec::new();
        for expr in exprs {
            targets.push(self.expr_to_target(expr, kind)?);
        }
        if targets.len() > 1 && op.is_some() {
            return Err(CompileError::new(
                ErrorKind::Parse,
                span,
                "compound assignment cannot have tuple targets",
            ));
        }
        let value = self.parse_expr()?;
        Ok(Stmt::Assign { targets, kind, shadow: false, op, value, span })
    }

    fn expr_to_target(&self, expr: Expr, kind: AssignKind) -> Result<AssignTarget> {
        match expr {
            Expr::Ident(ident) => Ok(AssignTarget::Name(ident)),
            Expr::Index { base, index, span } => {
                if kind == AssignKind::Update {
                    Ok(AssignTarget::Index { base, index, span })
                } else {
                    Err(CompileError::new(
                        ErrorKind::TypeMismatch,
                        span,
                        "indexed targets can only be updated with '<-'",
                    ))
                }
            }
            other => Err(CompileError::new(
                ErrorKind::TypeMismatch,
                other.span(),
                "left-hand side is not assignable",
            )),
        }
    }

    // -----------------------------------------------------------------
    // Brace disambiguation
    // -----------------------------------------------------------------

    /// Decide what the `{` at the current position opens. Bounded lookahead
    /// only; never consumes.
    fn classify_brace(&self) -> BraceKind {
        debug_assert!(self.check(&TokenKind::LBrace));
        let mut i = self.pos + 1;
        // Skip leading line breaks
        while matches!(self.tokens.get(i).map(|t| &t.kind), Some(TokenKind::Newline)) {
            i += 1;
        }
        match self.tokens.get(i).map(|t| &t.kind) {
            None | Some(TokenKind::RBrace) => return BraceKind::Block,
            // Guard arm or default marker: match block
            Some(TokenKind::Pipe) | Some(TokenKind::TildeArrow) => return BraceKind::Match,
            // Key followed by ':' (and not '::'): map literal
            Some(TokenKind::Ident(_)) | Some(TokenKind::Number(_)) | Some(TokenKind::Str(_)) => {
                if matches!(self.tokens.get(i + 1).map(|t| &t.kind), Some(TokenKind::Colon)) {
                    return BraceKind::Map;
                }
            }
            _ => {}
        }
        // Scan the first construct for an arm arrow at nesting depth 0.
        let mut depth = 0usize;
        for tok in self.tokens.iter().skip(i).take(64) {
            match &tok.kind {
                TokenKind::LBrace | TokenKind::LParen | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
                TokenKind::RBrace => {
                    if depth == 0 {
                        return BraceKind::Block;
                    }
                    depth -= 1;
                }
                TokenKind::ThinArrow if depth == 0 => return BraceKind::Match,
                TokenKind::Newline | TokenKind::Semicolon if depth == 0 => {
                    return BraceKind::Block;
                }
                _ => {}
            }
        }
        BraceKind::Block
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_send()
    }

    /// `:port <== value` (lowest precedence, left-assoc)
    fn parse_send(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_pipe()?;
        while self.check(&TokenKind::SendArrow) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_pipe()?;
            lhs = binary(BinOp::Send, lhs, rhs, span);
        }
        Ok(lhs)
    }

    /// `x | f`, `xs || f`, `xs ||| f` (left-assoc)
    fn parse_pipe(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_or_else()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Pipe) => BinOp::Pipe,
                Some(TokenKind::PipePipe) => BinOp::ParMap,
                Some(TokenKind::PipePipePipe) => BinOp::Reduce,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_or_else()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    /// `x or! fallback`
    fn parse_or_else(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_logic_or()?;
        while self.check(&TokenKind::OrBang) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_logic_or()?;
            lhs = binary(BinOp::OrElse, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_logic_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_logic_and()?;
        while self.check(&TokenKind::Or) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_logic_and()?;
            lhs = binary(BinOp::Or, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_logic_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.check(&TokenKind::And) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_comparison()?;
            lhs = binary(BinOp::And, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_range()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::NotEq) => BinOp::Ne,
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Ge) => BinOp::Ge,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_range()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    /// `a..b` / `a..=b` (inclusive) and `a..<b` (exclusive); non-associative.
    fn parse_range(&mut self) -> Result<Expr> {
        let lhs = self.parse_cons()?;
        let inclusive = match self.peek_kind() {
            Some(TokenKind::DotDot) | Some(TokenKind::DotDotEq) => true,
            Some(TokenKind::DotDotLt) => false,
            _ => return Ok(lhs),
        };
        let span = self.span();
        self.advance();
        self.skip_newlines();
        let rhs = self.parse_cons()?;
        Ok(Expr::Range { start: Box::new(lhs), end: Box::new(rhs), inclusive, span })
    }

    /// `a :: list` (right-assoc)
    fn parse_cons(&mut self) -> Result<Expr> {
        let lhs = self.parse_bit_or()?;
        if self.check(&TokenKind::ColonColon) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_cons()?;
            return Ok(binary(BinOp::Cons, lhs, rhs, span));
        }
        Ok(lhs)
    }

    fn parse_bit_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_bit_and()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::OrB) => BinOp::BitOr,
                Some(TokenKind::XorB) => BinOp::BitXor,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_bit_and()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_bit_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_shift()?;
        while self.check(&TokenKind::AndB) {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_shift()?;
            lhs = binary(BinOp::BitAnd, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::ShlB) => BinOp::Shl,
                Some(TokenKind::ShrB) => BinOp::Shr,
                Some(TokenKind::RolB) => BinOp::Rol,
                Some(TokenKind::RorB) => BinOp::Ror,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_power()?;
            lhs = binary(op, lhs, rhs, span);
        }
        Ok(lhs)
    }

    /// `a ** b` and its `^` alias (right-assoc). A `^` not followed by an
    /// expression is the list-head postfix, handled in [`Self::parse_postfix`].
    fn parse_power(&mut self) -> Result<Expr> {
        let lhs = self.parse_unary()?;
        let is_power = match self.peek_kind() {
            Some(TokenKind::Power) => true,
            Some(TokenKind::Caret) => self.peek_at(1).is_some_and(starts_expression),
            _ => false,
        };
        if is_power {
            let span = self.span();
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_power()?;
            return Ok(binary(BinOp::Pow, lhs, rhs, span));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let span = self.span();
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => Some(UnaryOp::Neg),
            Some(TokenKind::Not) => Some(UnaryOp::Not),
            Some(TokenKind::NotB) => Some(UnaryOp::BitNot),
            Some(TokenKind::Hash) => Some(UnaryOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op, operand: Box::new(operand), span });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::LParen) => {
                    let span = self.span();
                    self.advance();
                    let mut args = Vec::new();
                    self.skip_newlines();
                    while !self.check(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        self.skip_newlines();
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                    self.expect(&TokenKind::RParen, "')'")?;
                    expr = Expr::Call { callee: Box::new(expr), args, span };
                }
                Some(TokenKind::LBracket) => {
                    let span = self.span();
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::Index { base: Box::new(expr), index: Box::new(index), span };
                }
                Some(TokenKind::Dot) => {
                    let span = self.span();
                    self.advance();
                    let name = match self.advance().map(|t| t.kind) {
                        Some(TokenKind::Ident(name)) => name,
                        _ => return Err(self.error("expected property name after '.'")),
                    };
                    expr = Expr::Property { base: Box::new(expr), name, span };
                }
                // Postfix head: `xs^` (a `^` that begins another operand is
                // the power alias, consumed by parse_power instead)
                Some(TokenKind::Caret) if !self.peek_at(1).is_some_and(starts_expression) => {
                    let span = self.span();
                    self.advance();
                    expr = Expr::Head { base: Box::new(expr), span };
                }
                // Postfix tail: `(xs)_` / `xs _`
                Some(TokenKind::Underscore) => {
                    let span = self.span();
                    self.advance();
                    expr = Expr::Tail { base: Box::new(expr), span };
                }
                Some(TokenKind::As) => {
                    let span = self.span();
                    self.advance();
                    let ty = match self.advance().map(|t| t.kind) {
                        Some(TokenKind::Ident(name)) => {
                            ValueType::from_name(&name).ok_or_else(|| {
                                CompileError::new(
                                    ErrorKind::Parse,
                                    span,
                                    format!("unknown type '{}' in cast", name),
                                )
                            })?
                        }
                        _ => return Err(self.error("expected type name after 'as'")),
                    };
                    expr = Expr::Cast { value: Box::new(expr), ty, span };
                }
                Some(TokenKind::LBrace) if self.no_brace == 0 => {
                    match self.classify_brace() {
                        BraceKind::Match => {
                            expr = self.parse_match(expr)?;
                        }
                        // A statement block or map after an expression ends
                        // the expression; the caller owns the brace.
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.span();
        match self.peek_kind().cloned() {
            Some(TokenKind::Number(value)) => {
                self.advance();
                Ok(Expr::Number { value, span })
            }
            Some(TokenKind::Str(value)) => {
                self.advance();
                Ok(Expr::Str { value, span })
            }
            Some(TokenKind::FString(parts)) => {
                self.advance();
                self.parse_fstring(parts, span)
            }
            // Port literal `:8080` is just its number
            Some(TokenKind::Colon) => {
                if let Some(TokenKind::Number(port)) = self.peek_at(1).cloned() {
                    self.advance();
                    self.advance();
                    Ok(Expr::Number { value: port, span })
                } else {
                    Err(self.error("expected port number after ':'"))
                }
            }
            Some(TokenKind::Ident(name)) => {
                // Single-parameter lambda: `x => body`
                if matches!(self.peek_at(1), Some(TokenKind::FatArrow)) {
                    return self.parse_lambda(vec![name], None, span);
                }
                self.advance();
                Ok(Expr::Ident(Ident::new(name, span)))
            }
            Some(TokenKind::LParen) => {
                if let Some((params, variadic)) = self.try_lambda_params()? {
                    return self.parse_lambda(params, variadic, span);
                }
                self.advance();
                self.skip_newlines();
                let expr = self.parse_expr()?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            Some(TokenKind::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                self.skip_newlines();
                while !self.check(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    self.skip_newlines();
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                Ok(Expr::List { items, span })
            }
            Some(TokenKind::LBrace) => match self.classify_brace() {
                BraceKind::Map | BraceKind::Block => self.parse_map_literal(span),
                BraceKind::Match => Err(self.error(
                    "match block requires a scrutinee expression before '{'",
                )),
            },
            _ => Err(self.error(format!(
                "expected expression, found {}",
                self.describe_current()
            ))),
        }
    }

    /// `{ k: v, ... }`. An empty `{}` in value position is an empty map.
    fn parse_map_literal(&mut self, span: Span) -> Result<Expr> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut entries = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            let key = self.parse_expr()?;
            self.expect(&TokenKind::Colon, "':' after map key")?;
            self.skip_newlines();
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::MapLit { entries, span })
    }

    /// Look ahead from a `(` for a parameter list followed by `=>`. Returns
    /// the parsed parameters (consuming through the `)`) on success, or
    /// `None` (consuming nothing) when this is a parenthesized expression.
    fn try_lambda_params(&mut self) -> Result<Option<(Vec<String>, Option<String>)>> {
        debug_assert!(self.check(&TokenKind::LParen));
        // Validate the shape first without consuming
        let mut i = self.pos + 1;
        loop {
            match self.tokens.get(i).map(|t| &t.kind) {
                Some(TokenKind::RParen) => {
                    i += 1;
                    break;
                }
                Some(TokenKind::Ident(_)) => {
                    i += 1;
                    match self.tokens.get(i).map(|t| &t.kind) {
                        Some(TokenKind::Comma) => i += 1,
                        Some(TokenKind::Ellipsis) => {
                            i += 1;
                            if !matches!(
                                self.tokens.get(i).map(|t| &t.kind),
                                Some(TokenKind::RParen)
                            ) {
                                return Ok(None);
                            }
                        }
                        Some(TokenKind::RParen) => {}
                        _ => return Ok(None),
                    }
                }
                _ => return Ok(None),
            }
        }
        if !matches!(self.tokens.get(i).map(|t| &t.kind), Some(TokenKind::FatArrow)) {
            return Ok(None);
        }

        // Shape confirmed; consume for real.
        self.advance(); // (
        let mut params = Vec::new();
        let mut variadic = None;
        while !self.check(&TokenKind::RParen) {
            match self.advance().map(|t| t.kind) {
                Some(TokenKind::Ident(name)) => {
                    if self.eat(&TokenKind::Ellipsis) {
                        variadic = Some(name);
                    } else {
                        params.push(name);
                    }
                }
                _ => return Err(self.error("expected parameter name")),
            }
            self.eat(&TokenKind::Comma);
        }
        self.advance(); // )
        Ok(Some((params, variadic)))
    }

    /// Parse from the `=>` onward; params were consumed by the caller (for
    /// the single-identifier form the identifier is passed in unconsumed).
    fn parse_lambda(
        &mut self,
        params: Vec<String>,
        variadic: Option<String>,
        span: Span,
    ) -> Result<Expr> {
        if params.len() == 1 && variadic.is_none() && self.check(&TokenKind::Ident(params[0].clone()))
        {
            // Single-identifier form: the name token is still current
            self.advance();
        }
        self.expect(&TokenKind::FatArrow, "'=>'")?;
        self.skip_newlines();
        let id = self.fresh_id();
        let body = if self.check(&TokenKind::LBrace) && self.classify_brace() == BraceKind::Block {
            Body::Block(self.parse_block()?)
        } else {
            let saved = std::mem::take(&mut self.no_brace);
            let expr = self.parse_expr();
            self.no_brace = saved;
            Body::Expr(Box::new(expr?))
        };
        Ok(Expr::Lambda(Box::new(LambdaExpr { id, params, variadic, body, span })))
    }

    /// Parse a match block; `scrutinee` has been parsed and the current
    /// token is the opening `{`.
    fn parse_match(&mut self, scrutinee: Expr) -> Result<Expr> {
        let span = self.span();
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut arms = Vec::new();
        let mut default = None;
        self.skip_separators();
        while !self.check(&TokenKind::RBrace) {
            if self.is_at_end() {
                return Err(self.error("unbalanced '{': match block never closed"));
            }
            if self.eat(&TokenKind::TildeArrow) {
                self.skip_newlines();
                if default.is_some() {
                    return Err(self.error("match block has more than one default"));
                }
                default = Some(self.parse_arm_body()?);
            } else if self.eat(&TokenKind::Pipe) {
                // Guard arm: `| guard -> result`
                self.skip_newlines();
                let guard = self.parse_expr()?;
                self.expect(&TokenKind::ThinArrow, "'->' after guard")?;
                self.skip_newlines();
                let result = self.parse_arm_body()?;
                arms.push(MatchArm { pattern: None, guard: Some(guard), result });
            } else if self.check(&TokenKind::Underscore)
                && matches!(self.peek_at(1), Some(TokenKind::FatArrow))
            {
                // `_ => result` default spelling
                self.advance();
                self.advance();
                self.skip_newlines();
                if default.is_some() {
                    return Err(self.error("match block has more than one default"));
                }
                default = Some(self.parse_arm_body()?);
            } else {
                let pattern = self.parse_expr()?;
                self.expect(&TokenKind::ThinArrow, "'->' after match pattern")?;
                self.skip_newlines();
                let result = self.parse_arm_body()?;
                arms.push(MatchArm { pattern: Some(pattern), guard: None, result });
            }
            self.skip_separators();
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Match(Box::new(MatchExpr {
            scrutinee: Box::new(scrutinee),
            arms,
            default,
            ty: ValueType::Unknown,
            span,
        })))
    }

    fn parse_arm_body(&mut self) -> Result<Body> {
        if self.check(&TokenKind::LBrace) && self.classify_brace() == BraceKind::Block {
            Ok(Body::Block(self.parse_block()?))
        } else {
            Ok(Body::Expr(Box::new(self.parse_expr()?)))
        }
    }

    /// Re-parse f-string expression fragments into real subtrees.
    fn parse_fstring(&mut self, parts: Vec<FStrPart>, span: Span) -> Result<Expr> {
        let mut out = Vec::new();
        for part in parts {
            match part {
                FStrPart::Text(text) => out.push(FsPart::Text(text)),
                FStrPart::Expr { src, line, col } => {
                    let mut sub = Parser::new_fragment(&src, line, col, self.next_id)?;
                    let expr = sub.parse_expr()?;
                    sub.skip_newlines();
                    if !sub.is_at_end() {
                        return Err(CompileError::new(
                            ErrorKind::Parse,
                            Span::new(line, col),
                            "trailing tokens in f-string expression",
                        ));
                    }
                    self.next_id = sub.next_id;
                    out.push(FsPart::Expr(expr));
                }
            }
        }
        Ok(Expr::FString { parts: out, span })
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        ty: ValueType::Unknown,
        span,
    }
}

/// Can this token begin an expression operand? Used to tell the `^` power
/// alias (`a ^ 2`) from the head postfix (`xs^`).
fn starts_expression(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Ident(_)
            | TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::FString(_)
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Minus
            | TokenKind::Not
            | TokenKind::NotB
            | TokenKind::Hash
    )
}

/// Offset a fragment-relative position into file coordinates.
fn offset_pos(line: u32, col: u32, base_line: u32, base_col: u32) -> (u32, u32) {
    if line == 0 {
        (base_line, base_col + col)
    } else {
        (base_line + line, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        Parser::new(source).unwrap().parse().unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        Parser::new(source).unwrap().parse().unwrap_err()
    }

    #[test]
    fn test_hello_world() {
        let program = parse(r#"println("Hello, World!")"#);
        assert_eq!(program.stmts.len(), 1);
        match &program.stmts[0] {
            Stmt::Expr(Expr::Call { callee, args, .. }) => {
                assert!(matches!(callee.as_ref(), Expr::Ident(i) if i.name == "println"));
                assert!(matches!(&args[0], Expr::Str { value, .. } if value == "Hello, World!"));
            }
            other => panic!("expected call statement, got {:?}", other),
        }
    }

    #[test]
    fn test_assignment_kinds() {
        let program = parse("x = 1\ny := 2\ny <- 3");
        match &program.stmts[0] {
            Stmt::Assign { kind, .. } => assert_eq!(*kind, AssignKind::Define { mutable: false }),
            other => panic!("{:?}", other),
        }
        match &program.stmts[1] {
            Stmt::Assign { kind, .. } => assert_eq!(*kind, AssignKind::Define { mutable: true }),
            other => panic!("{:?}", other),
        }
        match &program.stmts[2] {
            Stmt::Assign { kind, op, .. } => {
                assert_eq!(*kind, AssignKind::Update);
                assert!(op.is_none());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment_lowers_to_update() {
        let program = parse("sum += 4");
        match &program.stmts[0] {
            Stmt::Assign { kind, op, .. } => {
                assert_eq!(*kind, AssignKind::Update);
                assert_eq!(*op, Some(BinOp::Add));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_tuple_unpacking() {
        let program = parse("a, b, c = [10, 20, 30]");
        match &program.stmts[0] {
            Stmt::Assign { targets, value, .. } => {
                assert_eq!(targets.len(), 3);
                assert!(matches!(&targets[0], AssignTarget::Name(i) if i.name == "a"));
                assert!(matches!(value, Expr::List { items, .. } if items.len() == 3));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_indexed_update() {
        let program = parse("out[i] <- i * i");
        match &program.stmts[0] {
            Stmt::Assign { targets, kind, .. } => {
                assert_eq!(*kind, AssignKind::Update);
                assert!(matches!(&targets[0], AssignTarget::Index { .. }));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_indexed_define_rejected() {
        let err = parse_err("out[0] = 1");
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_shadow_prefix() {
        let program = parse("shadow x = 2");
        match &program.stmts[0] {
            Stmt::Assign { shadow, .. } => assert!(*shadow),
            other => panic!("{:?}", other),
        }
        // shadow must prefix a definition
        assert!(Parser::new("shadow x <- 2").unwrap().parse().is_err());
    }

    #[test]
    fn test_sequential_loop() {
        let program = parse("@ i in 0..<5 { sum <- sum + i }");
        match &program.stmts[0] {
            Stmt::Loop(l) => {
                assert_eq!(l.var, "i");
                assert!(!l.parallel);
                assert!(matches!(&l.iterable, Expr::Range { inclusive: false, .. }));
                assert_eq!(l.body.len(), 1);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_parallel_loop_with_max() {
        let program = parse("@@ i in xs max 100 { f(i) }");
        match &program.stmts[0] {
            Stmt::Loop(l) => {
                assert!(l.parallel);
                assert!(l.max.is_some());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_loop_exit() {
        let program = parse("@ i in 0..9 { ret @ }\n@ j in 0..9 { ret @2 }");
        let body_of = |s: &Stmt| match s {
            Stmt::Loop(l) => l.body.clone(),
            other => panic!("{:?}", other),
        };
        assert!(matches!(
            body_of(&program.stmts[0])[0],
            Stmt::Ret { loop_depth: Some(1), .. }
        ));
        assert!(matches!(
            body_of(&program.stmts[1])[0],
            Stmt::Ret { loop_depth: Some(2), .. }
        ));
    }

    #[test]
    fn test_lambda_forms() {
        let program = parse("f = x => x + 1\ng = (a, b) => a * b\nh = (first, rest...) => first");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert_eq!(l.params, vec!["x".to_string()]);
                assert!(matches!(&l.body, Body::Expr(_)));
            }
            other => panic!("{:?}", other),
        }
        match &program.stmts[1] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert_eq!(l.params.len(), 2);
            }
            other => panic!("{:?}", other),
        }
        match &program.stmts[2] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert_eq!(l.params, vec!["first".to_string()]);
                assert_eq!(l.variadic.as_deref(), Some("rest"));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_lambda_block_body() {
        let program = parse("f = (x) => { y = x * 2\ny + 1 }");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert!(matches!(&l.body, Body::Block(b) if b.len() == 2));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_paren_expr_is_not_lambda() {
        let program = parse("y = (1 + 2) * 3");
        match &program.stmts[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_map_literal_disambiguation() {
        let program = parse("m = { 1: 10, 2: 20 }");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::MapLit { entries, .. }, .. } => {
                assert_eq!(entries.len(), 2);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_match_block_disambiguation() {
        let program = parse(r#"name = code { 1 -> "one"  2 -> "two"  ~> "many" }"#);
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Match(m), .. } => {
                assert_eq!(m.arms.len(), 2);
                assert!(m.default.is_some());
                assert!(matches!(m.scrutinee.as_ref(), Expr::Ident(i) if i.name == "code"));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_match_guard_arms() {
        let program = parse("v = x { | x > 10 -> 1 | x > 5 -> 2 ~> 0 }");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Match(m), .. } => {
                assert_eq!(m.arms.len(), 2);
                assert!(m.arms[0].pattern.is_none());
                assert!(m.arms[0].guard.is_some());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_match_wildcard_default() {
        let program = parse("v = x { 1 -> 10 _ => 0 }");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Match(m), .. } => {
                assert_eq!(m.arms.len(), 1);
                assert!(m.default.is_some());
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_statement_block_is_not_match_or_map() {
        let program = parse("{ x = 1\n  y = 2 }");
        assert!(matches!(&program.stmts[0], Stmt::Block { body, .. } if body.len() == 2));
    }

    #[test]
    fn test_loop_body_not_parsed_as_match_on_iterable() {
        // `xs { ... }` would be a match in expression position; after a loop
        // header the brace must bind to the loop.
        let program = parse("@ i in xs { f(i) }");
        assert!(matches!(&program.stmts[0], Stmt::Loop(_)));
    }

    #[test]
    fn test_or_bang() {
        let program = parse("safe = x or! 99");
        match &program.stmts[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::Binary { op: BinOp::OrElse, .. }));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_pipes() {
        let program = parse("a = xs | f\nb = xs || f\nc = xs ||| f");
        let ops: Vec<BinOp> = program
            .stmts
            .iter()
            .map(|s| match s {
                Stmt::Assign { value: Expr::Binary { op, .. }, .. } => *op,
                other => panic!("{:?}", other),
            })
            .collect();
        assert_eq!(ops, vec![BinOp::Pipe, BinOp::ParMap, BinOp::Reduce]);
    }

    #[test]
    fn test_cons_is_right_assoc() {
        let program = parse("l = 1 :: 2 :: rest");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Binary { op: BinOp::Cons, rhs, .. }, .. } => {
                assert!(matches!(rhs.as_ref(), Expr::Binary { op: BinOp::Cons, .. }));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_power_alias_vs_head() {
        let program = parse("p = a ^ 2\nh = xs^");
        assert!(matches!(
            &program.stmts[0],
            Stmt::Assign { value: Expr::Binary { op: BinOp::Pow, .. }, .. }
        ));
        assert!(matches!(&program.stmts[1], Stmt::Assign { value: Expr::Head { .. }, .. }));
    }

    #[test]
    fn test_tail_postfix() {
        let program = parse("rest = (xs)_");
        assert!(matches!(&program.stmts[0], Stmt::Assign { value: Expr::Tail { .. }, .. }));
    }

    #[test]
    fn test_cast() {
        let program = parse("n = x as int32");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Cast { ty, .. }, .. } => {
                assert_eq!(*ty, ValueType::CInt32);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_send() {
        let program = parse(r#":8080 <== "ping""#);
        match &program.stmts[0] {
            Stmt::Expr(Expr::Binary { op: BinOp::Send, lhs, .. }) => {
                assert!(matches!(lhs.as_ref(), Expr::Number { value, .. } if *value == 8080.0));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_defer_unsafe_arena() {
        let program = parse("defer cleanup()\nunsafe { poke(1) }\narena { build() }");
        assert!(matches!(&program.stmts[0], Stmt::Defer { .. }));
        assert!(matches!(&program.stmts[1], Stmt::Unsafe { .. }));
        assert!(matches!(&program.stmts[2], Stmt::ArenaBlock { .. }));
    }

    #[test]
    fn test_imports() {
        let program = parse("import \"lib/util.flap\"\nimport curses as ui\nx = 1");
        assert_eq!(program.imports.len(), 2);
        assert!(matches!(&program.imports[0], Import::Path { path, .. } if path == "lib/util.flap"));
        assert!(
            matches!(&program.imports[1], Import::Lib { name, alias: Some(a), .. } if name == "curses" && a == "ui")
        );
    }

    #[test]
    fn test_fstring_expressions_parsed() {
        let program = parse(r#"msg = f"sum is {a + b}""#);
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::FString { parts, .. }, .. } => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[1], FsPart::Expr(Expr::Binary { op: BinOp::Add, .. })));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_logic_keywords() {
        let program = parse("ok = a and not b or c");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Binary { op, .. }, .. } => assert_eq!(*op, BinOp::Or),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let program = parse("v = 1 + 2 * 3");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Binary { op: BinOp::Add, rhs, .. }, .. } => {
                assert!(matches!(rhs.as_ref(), Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_unbalanced_brace_errors() {
        assert!(Parser::new("{ x = 1").unwrap().parse().is_err());
        assert!(Parser::new("f(1").unwrap().parse().is_err());
    }

    #[test]
    fn test_semicolons_separate_statements() {
        let program = parse("println(a); println(b); println(c)");
        assert_eq!(program.stmts.len(), 3);
    }

    #[test]
    fn test_length_and_index() {
        let program = parse("n = #xs\ne = xs[2]");
        assert!(matches!(
            &program.stmts[0],
            Stmt::Assign { value: Expr::Unary { op: UnaryOp::Len, .. }, .. }
        ));
        assert!(matches!(&program.stmts[1], Stmt::Assign { value: Expr::Index { .. }, .. }));
    }

    #[test]
    fn test_property_access() {
        let program = parse("e = result.error");
        match &program.stmts[0] {
            Stmt::Assign { value: Expr::Property { name, .. }, .. } => assert_eq!(name, "error"),
            other => panic!("{:?}", other),
        }
    }
}
