//! Lexer for Flap source
//!
//! Consumes UTF-8 text and produces tokens with 0-indexed line/column
//! positions. Handles the three numeric literal forms (decimal, `0x…`,
//! `0b…`), double-quoted strings with standard escapes, f-strings with
//! embedded `{expr}` segments, and the full multi-character operator table.
//!
//! Newlines are significant (they terminate statements alongside `;`), so a
//! `Newline` token is emitted per line break. `//` starts a line comment.
//!
//! Contextual type keywords (`int32`, `cstring`, …) are deliberately NOT
//! reserved; they lex as plain identifiers and only mean a type where the
//! parser expects one.

/// A single token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// 0-indexed line
    pub line: u32,
    /// 0-indexed column
    pub col: u32,
}

/// One piece of an f-string: literal text or an embedded expression kept as
/// raw source, re-parsed by the parser with its own position offset.
#[derive(Debug, Clone, PartialEq)]
pub enum FStrPart {
    Text(String),
    Expr { src: String, line: u32, col: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Str(String),
    FString(Vec<FStrPart>),

    // Keywords
    Shadow,
    Import,
    Unsafe,
    Arena,
    Defer,
    Ret,
    Max,
    And,
    Or,
    Not,
    As,
    In,

    // Assignment
    Assign,     // =
    DefineMut,  // :=
    Update,     // <-
    PlusAssign, // +=
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power, // **
    Caret, // ^ : power alias, or list-head postfix after an identifier

    // Comparison
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,

    // Bitwise
    AndB, // &b
    OrB,  // |b
    XorB, // ^b
    NotB, // ~b
    ShlB, // <<b
    ShrB, // >>b
    RolB, // <<<b
    RorB, // >>>b

    // Functional
    FatArrow,     // =>
    ThinArrow,    // ->
    TildeArrow,   // ~>
    Pipe,         // |
    PipePipe,     // ||
    PipePipePipe, // |||
    OrBang,       // or!

    // Structural
    ColonColon, // ::
    DotDot,     // ..
    DotDotLt,   // ..<
    DotDotEq,   // ..=
    Hash,       // #
    Underscore, // _
    Ellipsis,   // ...
    SendArrow,  // <==
    At,         // @
    AtAt,       // @@

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Newline,
}

impl TokenKind {
    /// Keyword lookup for a completed identifier.
    fn keyword(ident: &str) -> Option<TokenKind> {
        Some(match ident {
            "shadow" => TokenKind::Shadow,
            "import" => TokenKind::Import,
            "unsafe" => TokenKind::Unsafe,
            "arena" => TokenKind::Arena,
            "defer" => TokenKind::Defer,
            "ret" => TokenKind::Ret,
            "max" => TokenKind::Max,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "as" => TokenKind::As,
            "in" => TokenKind::In,
            _ => return None,
        })
    }
}

/// Lexer failure; converted to a `CompileError` by the parser, which knows
/// the file name.
#[derive(Debug, Clone)]
pub struct LexError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    tokens: Vec<Token>,
}

/// Tokenize a whole source file.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 0,
        col: 0,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, line: u32, col: u32) {
        self.tokens.push(Token { kind, line, col });
    }

    fn error(&self, line: u32, col: u32, message: impl Into<String>) -> LexError {
        LexError { line, col, message: message.into() }
    }

    fn run(&mut self) -> Result<(), LexError> {
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    // Collapse runs: one separator is enough for the parser
                    if !matches!(self.tokens.last().map(|t| &t.kind), Some(TokenKind::Newline)) {
                        self.push(TokenKind::Newline, line, col);
                    }
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '"' => self.lex_string(line, col)?,
                'f' if self.peek_at(1) == Some('"') => self.lex_fstring(line, col)?,
                c if c.is_ascii_digit() => self.lex_number(line, col)?,
                c if c.is_alphabetic() || c == '_' => self.lex_word(line, col),
                _ => self.lex_operator(line, col)?,
            }
        }
        Ok(())
    }

    fn lex_word(&mut self, line: u32, col: u32) {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if word == "_" {
            self.push(TokenKind::Underscore, line, col);
        } else if word == "or" && self.peek() == Some('!') {
            self.bump();
            self.push(TokenKind::OrBang, line, col);
        } else if let Some(kw) = TokenKind::keyword(&word) {
            self.push(kw, line, col);
        } else {
            self.push(TokenKind::Ident(word), line, col);
        }
    }

    fn lex_number(&mut self, line: u32, col: u32) -> Result<(), LexError> {
        if self.peek() == Some('0')
            && matches!(self.peek_at(1), Some('x') | Some('X') | Some('b') | Some('B'))
        {
            let radix_char = self.peek_at(1).unwrap();
            self.bump();
            self.bump();
            let radix = if radix_char.eq_ignore_ascii_case(&'x') { 16 } else { 2 };
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() {
                    digits.push(c);
                    self.bump();
                } else if c == '_' && self.peek_at(1).is_some_and(|d| d.is_ascii_alphanumeric()) {
                    self.bump();
                } else {
                    break;
                }
            }
            let value = u64::from_str_radix(&digits, radix).map_err(|_| {
                let base = if radix == 16 { "hex" } else { "binary" };
                self.error(line, col, format!("invalid {} literal '0{}{}'", base, radix_char, digits))
            })?;
            self.push(TokenKind::Number(value as f64), line, col);
            return Ok(());
        }

        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '_' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
                self.bump();
            } else {
                break;
            }
        }
        // A '.' continues the literal only when followed by a digit; this
        // keeps `0..5` lexing as number, range, number.
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E'))
            && self
                .peek_at(1)
                .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
        {
            text.push('e');
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                text.push(self.bump().unwrap());
            }
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(line, col, format!("invalid numeric literal '{}'", text)))?;
        self.push(TokenKind::Number(value), line, col);
        Ok(())
    }

    fn lex_escape(&mut self, line: u32, col: u32) -> Result<char, LexError> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('0') => Ok('\0'),
            Some('{') => Ok('{'),
            Some('}') => Ok('}'),
            Some(c) => Err(self.error(line, col, format!("unknown escape '\\{}'", c))),
            None => Err(self.error(line, col, "unterminated escape at end of input")),
        }
    }

    fn lex_string(&mut self, line: u32, col: u32) -> Result<(), LexError> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => value.push(self.lex_escape(line, col)?),
                Some('\n') | None => {
                    return Err(self.error(line, col, "unclosed string literal - missing closing quote"));
                }
                Some(c) => value.push(c),
            }
        }
        self.push(TokenKind::Str(value), line, col);
        Ok(())
    }

    fn lex_fstring(&mut self, line: u32, col: u32) -> Result<(), LexError> {
        self.bump(); // 'f'
        self.bump(); // opening quote
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    text.push(self.lex_escape(line, col)?);
                }
                Some('{') if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    text.push('{');
                }
                Some('}') if self.peek_at(1) == Some('}') => {
                    self.bump();
                    self.bump();
                    text.push('}');
                }
                Some('{') => {
                    if !text.is_empty() {
                        parts.push(FStrPart::Text(std::mem::take(&mut text)));
                    }
                    self.bump();
                    let (expr_line, expr_col) = (self.line, self.col);
                    let mut depth = 1usize;
                    let mut src = String::new();
                    loop {
                        match self.peek() {
                            Some('{') => {
                                depth += 1;
                                src.push('{');
                                self.bump();
                            }
                            Some('}') => {
                                depth -= 1;
                                self.bump();
                                if depth == 0 {
                                    break;
                                }
                                src.push('}');
                            }
                            Some('\n') | None => {
                                return Err(self.error(
                                    line,
                                    col,
                                    "unclosed '{' in f-string expression",
                                ));
                            }
                            Some(c) => {
                                src.push(c);
                                self.bump();
                            }
                        }
                    }
                    parts.push(FStrPart::Expr { src, line: expr_line, col: expr_col });
                }
                Some('\n') | None => {
                    return Err(self.error(line, col, "unclosed f-string literal"));
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        if !text.is_empty() {
            parts.push(FStrPart::Text(text));
        }
        self.push(TokenKind::FString(parts), line, col);
        Ok(())
    }

    /// Longest-match operator recognition.
    fn lex_operator(&mut self, line: u32, col: u32) -> Result<(), LexError> {
        use TokenKind::*;
        let c0 = self.peek().unwrap();
        let c1 = self.peek_at(1);
        let c2 = self.peek_at(2);
        let c3 = self.peek_at(3);

        let (kind, len) = match (c0, c1, c2, c3) {
            ('<', Some('<'), Some('<'), Some('b')) => (RolB, 4),
            ('>', Some('>'), Some('>'), Some('b')) => (RorB, 4),
            ('<', Some('='), Some('='), _) => (SendArrow, 3),
            ('<', Some('<'), Some('b'), _) => (ShlB, 3),
            ('>', Some('>'), Some('b'), _) => (ShrB, 3),
            ('.', Some('.'), Some('.'), _) => (Ellipsis, 3),
            ('.', Some('.'), Some('<'), _) => (DotDotLt, 3),
            ('.', Some('.'), Some('='), _) => (DotDotEq, 3),
            ('|', Some('|'), Some('|'), _) => (PipePipePipe, 3),
            ('*', Some('*'), _, _) => (Power, 2),
            ('=', Some('='), _, _) => (EqEq, 2),
            ('=', Some('>'), _, _) => (FatArrow, 2),
            ('!', Some('='), _, _) => (NotEq, 2),
            ('<', Some('='), _, _) => (Le, 2),
            ('>', Some('='), _, _) => (Ge, 2),
            ('<', Some('-'), _, _) => (Update, 2),
            ('-', Some('>'), _, _) => (ThinArrow, 2),
            ('~', Some('>'), _, _) => (TildeArrow, 2),
            ('~', Some('b'), _, _) => (NotB, 2),
            ('&', Some('b'), _, _) => (AndB, 2),
            ('|', Some('b'), _, _) => (OrB, 2),
            ('^', Some('b'), _, _) => (XorB, 2),
            ('|', Some('|'), _, _) => (PipePipe, 2),
            (':', Some('='), _, _) => (DefineMut, 2),
            (':', Some(':'), _, _) => (ColonColon, 2),
            ('.', Some('.'), _, _) => (DotDot, 2),
            ('+', Some('='), _, _) => (PlusAssign, 2),
            ('-', Some('='), _, _) => (MinusAssign, 2),
            ('*', Some('='), _, _) => (StarAssign, 2),
            ('/', Some('='), _, _) => (SlashAssign, 2),
            ('%', Some('='), _, _) => (PercentAssign, 2),
            ('@', Some('@'), _, _) => (AtAt, 2),
            ('=', _, _, _) => (Assign, 1),
            ('+', _, _, _) => (Plus, 1),
            ('-', _, _, _) => (Minus, 1),
            ('*', _, _, _) => (Star, 1),
            ('/', _, _, _) => (Slash, 1),
            ('%', _, _, _) => (Percent, 1),
            ('^', _, _, _) => (Caret, 1),
            ('<', _, _, _) => (Lt, 1),
            ('>', _, _, _) => (Gt, 1),
            ('|', _, _, _) => (Pipe, 1),
            ('#', _, _, _) => (Hash, 1),
            ('@', _, _, _) => (At, 1),
            ('(', _, _, _) => (LParen, 1),
            (')', _, _, _) => (RParen, 1),
            ('{', _, _, _) => (LBrace, 1),
            ('}', _, _, _) => (RBrace, 1),
            ('[', _, _, _) => (LBracket, 1),
            (']', _, _, _) => (RBracket, 1),
            (',', _, _, _) => (Comma, 1),
            ('.', _, _, _) => (Dot, 1),
            (':', _, _, _) => (Colon, 1),
            (';', _, _, _) => (Semicolon, 1),
            _ => return Err(self.error(line, col, format!("unexpected character '{}'", c0))),
        };
        for _ in 0..len {
            self.bump();
        }
        self.push(kind, line, col);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_hello_world() {
        let toks = kinds(r#"println("Hello, World!")"#);
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("println".into()),
                TokenKind::LParen,
                TokenKind::Str("Hello, World!".into()),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(kinds("42"), vec![TokenKind::Number(42.0)]);
        assert_eq!(kinds("3.25"), vec![TokenKind::Number(3.25)]);
        assert_eq!(kinds("0xFF"), vec![TokenKind::Number(255.0)]);
        assert_eq!(kinds("0b1010"), vec![TokenKind::Number(10.0)]);
        assert_eq!(kinds("1_000_000"), vec![TokenKind::Number(1_000_000.0)]);
        assert_eq!(kinds("1e3"), vec![TokenKind::Number(1000.0)]);
    }

    #[test]
    fn test_invalid_hex() {
        assert!(tokenize("0xGG").is_err());
        assert!(tokenize("0b123").is_err());
    }

    #[test]
    fn test_range_does_not_eat_dot() {
        assert_eq!(
            kinds("0..<5"),
            vec![TokenKind::Number(0.0), TokenKind::DotDotLt, TokenKind::Number(5.0)]
        );
        assert_eq!(
            kinds("1..10"),
            vec![TokenKind::Number(1.0), TokenKind::DotDot, TokenKind::Number(10.0)]
        );
        assert_eq!(
            kinds("1..=10"),
            vec![TokenKind::Number(1.0), TokenKind::DotDotEq, TokenKind::Number(10.0)]
        );
    }

    #[test]
    fn test_assignment_operators() {
        assert_eq!(
            kinds("x := 1"),
            vec![TokenKind::Ident("x".into()), TokenKind::DefineMut, TokenKind::Number(1.0)]
        );
        assert_eq!(
            kinds("x <- 2"),
            vec![TokenKind::Ident("x".into()), TokenKind::Update, TokenKind::Number(2.0)]
        );
        assert_eq!(
            kinds("x += 3"),
            vec![TokenKind::Ident("x".into()), TokenKind::PlusAssign, TokenKind::Number(3.0)]
        );
    }

    #[test]
    fn test_bitwise_and_rotates() {
        assert_eq!(
            kinds("a &b b"),
            vec![TokenKind::Ident("a".into()), TokenKind::AndB, TokenKind::Ident("b".into())]
        );
        assert_eq!(
            kinds("a <<<b 3"),
            vec![TokenKind::Ident("a".into()), TokenKind::RolB, TokenKind::Number(3.0)]
        );
        assert_eq!(
            kinds("a >>>b 3"),
            vec![TokenKind::Ident("a".into()), TokenKind::RorB, TokenKind::Number(3.0)]
        );
        assert_eq!(
            kinds("a >>b 3"),
            vec![TokenKind::Ident("a".into()), TokenKind::ShrB, TokenKind::Number(3.0)]
        );
    }

    #[test]
    fn test_pipes_and_arrows() {
        assert_eq!(kinds("|"), vec![TokenKind::Pipe]);
        assert_eq!(kinds("||"), vec![TokenKind::PipePipe]);
        assert_eq!(kinds("|||"), vec![TokenKind::PipePipePipe]);
        assert_eq!(kinds("=> -> ~>"), vec![TokenKind::FatArrow, TokenKind::ThinArrow, TokenKind::TildeArrow]);
    }

    #[test]
    fn test_or_bang() {
        assert_eq!(
            kinds("x or! 99"),
            vec![TokenKind::Ident("x".into()), TokenKind::OrBang, TokenKind::Number(99.0)]
        );
        // Plain `or` stays a keyword
        assert_eq!(
            kinds("a or b"),
            vec![TokenKind::Ident("a".into()), TokenKind::Or, TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn test_send_arrow_vs_comparisons() {
        assert_eq!(
            kinds(":8080 <== msg"),
            vec![
                TokenKind::Colon,
                TokenKind::Number(8080.0),
                TokenKind::SendArrow,
                TokenKind::Ident("msg".into()),
            ]
        );
        assert_eq!(kinds("a <= b"), vec![
            TokenKind::Ident("a".into()),
            TokenKind::Le,
            TokenKind::Ident("b".into()),
        ]);
    }

    #[test]
    fn test_loops_tokens() {
        assert_eq!(
            kinds("@ i in 0..<5"),
            vec![
                TokenKind::At,
                TokenKind::Ident("i".into()),
                TokenKind::In,
                TokenKind::Number(0.0),
                TokenKind::DotDotLt,
                TokenKind::Number(5.0),
            ]
        );
        assert_eq!(kinds("@@"), vec![TokenKind::AtAt]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(kinds(r#""a\nb\"c""#), vec![TokenKind::Str("a\nb\"c".into())]);
        assert!(tokenize("\"unclosed").is_err());
    }

    #[test]
    fn test_fstring_parts() {
        let toks = tokenize(r#"f"sum is {a + b}!""#).unwrap();
        match &toks[0].kind {
            TokenKind::FString(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], FStrPart::Text("sum is ".into()));
                match &parts[1] {
                    FStrPart::Expr { src, .. } => assert_eq!(src, "a + b"),
                    other => panic!("expected expr part, got {:?}", other),
                }
                assert_eq!(parts[2], FStrPart::Text("!".into()));
            }
            other => panic!("expected f-string, got {:?}", other),
        }
    }

    #[test]
    fn test_fstring_escaped_braces() {
        let toks = tokenize(r#"f"{{literal}}""#).unwrap();
        match &toks[0].kind {
            TokenKind::FString(parts) => {
                assert_eq!(parts, &[FStrPart::Text("{literal}".into())]);
            }
            other => panic!("expected f-string, got {:?}", other),
        }
    }

    #[test]
    fn test_comments_and_newlines() {
        let toks = kinds("a // comment\nb");
        assert_eq!(
            toks,
            vec![TokenKind::Ident("a".into()), TokenKind::Newline, TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn test_newline_runs_collapse() {
        let toks = kinds("a\n\n\nb");
        assert_eq!(
            toks,
            vec![TokenKind::Ident("a".into()), TokenKind::Newline, TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn test_underscore_and_ellipsis() {
        assert_eq!(kinds("_"), vec![TokenKind::Underscore]);
        assert_eq!(
            kinds("args..."),
            vec![TokenKind::Ident("args".into()), TokenKind::Ellipsis]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("shadow x = 1"),
            vec![
                TokenKind::Shadow,
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Number(1.0),
            ]
        );
        assert_eq!(kinds("defer unsafe arena max"), vec![
            TokenKind::Defer,
            TokenKind::Unsafe,
            TokenKind::Arena,
            TokenKind::Max,
        ]);
    }

    #[test]
    fn test_positions_are_tracked() {
        let toks = tokenize("a\n  b").unwrap();
        assert_eq!((toks[0].line, toks[0].col), (0, 0));
        let b = toks.last().unwrap();
        assert_eq!((b.line, b.col), (1, 2));
    }
}
