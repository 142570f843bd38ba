//! Expression lexer, AST, parser, and evaluator.
//!
//! Expressions appear in `If`/`ElseIf` conditions, on the right-hand side of
//! `=`/`:=` assignments, and inside parenthesised groups on lines of commands
//! that allow arithmetic.  Variable references have already been substituted
//! by the time an expression is parsed; a bare word that still names a
//! variable resolves to its value, and any other bare word is a string.
//!
//! Operator precedence (lowest → highest):
//!   or  →  and  →  relational  →  additive  →  multiplicative  →  unary  →  primary

use super::value::Value;

// ── EvalContext ───────────────────────────────────────────────────────────────

/// Dependency-injection interface used by the expression evaluator.
///
/// The [`Interpreter`](super::interp::Interpreter) implements this trait to
/// give the evaluator access to variables and the built-in function set.
pub trait EvalContext {
    /// Look up a variable (current call frame first, then globals).
    fn get_var(&self, name: &str) -> Option<Value>;

    /// Invoke a built-in expression function.
    fn call_fn(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String>;
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Comparison
    Eq, // ==
    Ne, // !=
    Lt,
    Le,
    Gt,
    Ge,

    // Logical (also spelled AND / OR / NOT)
    And,
    Or,
    Not,

    Comma,
    LParen,
    RParen,
    /// Unrecognised input character, reported instead of masking as EOF.
    Unknown(char),
    Eof,
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn take_digits(&mut self) {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    /// Read a number starting at `start` (the first byte is already consumed).
    fn read_number(&mut self, start: usize) -> Result<Token, String> {
        let mut is_float = self.src[start] == b'.';
        self.take_digits();
        if !is_float && self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            self.take_digits();
        }
        if matches!(self.peek(), Some(b'e' | b'E'))
            && (matches!(self.peek2(), Some(b'0'..=b'9'))
                || (matches!(self.peek2(), Some(b'+' | b'-'))
                    && matches!(self.src.get(self.pos + 2), Some(b'0'..=b'9'))))
        {
            is_float = true;
            self.pos += 2;
            self.take_digits();
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]);
        if is_float {
            text.parse().map(Token::Float).map_err(|_| format!("bad number '{text}'"))
        } else {
            match text.parse() {
                Ok(n) => Ok(Token::Int(n)),
                Err(_) => text.parse().map(Token::Float).map_err(|_| format!("bad number '{text}'")),
            }
        }
    }

    fn read_string(&mut self) -> Result<Token, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == b'"' {
                let s = String::from_utf8_lossy(&self.src[start..self.pos - 1]).into_owned();
                return Ok(Token::Str(s));
            }
        }
        Err("unterminated string in expression".into())
    }

    fn read_ident(&mut self, start: usize) -> Token {
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        let word = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if word.eq_ignore_ascii_case("AND") {
            Token::And
        } else if word.eq_ignore_ascii_case("OR") {
            Token::Or
        } else if word.eq_ignore_ascii_case("NOT") {
            Token::Not
        } else {
            Token::Ident(word)
        }
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_ws();
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };
        self.pos += 1;

        Ok(match ch {
            b'0'..=b'9' => self.read_number(start)?,
            b'.' if matches!(self.peek(), Some(b'0'..=b'9')) => self.read_number(start)?,
            b'"' => self.read_string()?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.read_ident(start),
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'!' => {
                if self.eat(b'=') {
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            b'&' if self.eat(b'&') => Token::And,
            b'|' if self.eat(b'|') => Token::Or,
            b'<' => {
                if self.eat(b'=') {
                    Token::Le
                } else if self.eat(b'>') {
                    Token::Ne
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            b'=' if self.eat(b'=') => Token::Eq,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            _ => {
                // Re-decode the full UTF-8 character for the diagnostic.
                let c = std::str::from_utf8(&self.src[start..])
                    .ok()
                    .and_then(|s| s.chars().next())
                    .unwrap_or(ch as char);
                Token::Unknown(c)
            }
        })
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = matches!(t, Token::Eof);
            tokens.push(t);
            if done {
                break;
            }
        }
        Ok(tokens)
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// A bare word: a variable's value when one is defined, else the word.
    Word(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_relational()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Token::Minus => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Plus => {
                self.pos += 1;
                self.parse_unary()
            }
            Token::Not => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let tok = self.advance();
        match tok {
            Token::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Token::Float(x) => Ok(Expr::Literal(Value::Float(x))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != &Token::RParen {
                        args.push(self.parse_or()?);
                        while self.eat(&Token::Comma) {
                            args.push(self.parse_or()?);
                        }
                    }
                    if !self.eat(&Token::RParen) {
                        return Err(format!("expected ')' after arguments to {name}"));
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Word(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err("unbalanced parentheses: expected ')'".into());
                }
                Ok(inner)
            }
            Token::Eof => Err("unexpected end of expression".into()),
            Token::Unknown(c) => Err(format!("unexpected character '{c}' in expression")),
            other => Err(format!("unexpected {} in expression", describe(&other))),
        }
    }
}

fn describe(tok: &Token) -> String {
    match tok {
        Token::RParen => "')'".into(),
        Token::Comma => "','".into(),
        Token::And => "AND".into(),
        Token::Or => "OR".into(),
        other => format!("{other:?}"),
    }
}

/// Parse an expression string into an AST.  The whole input must be consumed.
pub fn parse_expr(src: &str) -> Result<Expr, String> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        Token::RParen => Err("unbalanced parentheses: unexpected ')'".into()),
        other => Err(format!("unexpected {} after expression", describe(other))),
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Evaluate an [`Expr`] AST node against the given context.
pub fn eval_expr(expr: &Expr, ctx: &mut dyn EvalContext) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        Expr::Word(name) => Ok(ctx.get_var(name).unwrap_or_else(|| Value::Str(name.clone()))),

        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, ctx)?;
            match op {
                UnaryOp::Neg => v.arith_neg(),
                UnaryOp::Not => Ok(Value::from(!v.as_bool())),
            }
        }

        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit for AND and OR
            match op {
                BinOp::And => {
                    let l = eval_expr(lhs, ctx)?;
                    if !l.as_bool() {
                        return Ok(Value::Int(0));
                    }
                    let r = eval_expr(rhs, ctx)?;
                    return Ok(Value::from(r.as_bool()));
                }
                BinOp::Or => {
                    let l = eval_expr(lhs, ctx)?;
                    if l.as_bool() {
                        return Ok(Value::Int(1));
                    }
                    let r = eval_expr(rhs, ctx)?;
                    return Ok(Value::from(r.as_bool()));
                }
                _ => {}
            }
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            eval_binop(*op, &l, &r)
        }

        Expr::Call(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for ae in arg_exprs {
                args.push(eval_expr(ae, ctx)?);
            }
            ctx.call_fn(name, args)
        }
    }
}

fn eval_binop(op: BinOp, l: &Value, r: &Value) -> Result<Value, String> {
    use std::cmp::Ordering;
    match op {
        BinOp::Add => l.arith_add(r),
        BinOp::Sub => l.arith_sub(r),
        BinOp::Mul => l.arith_mul(r),
        BinOp::Div => l.arith_div(r),
        BinOp::Rem => l.arith_rem(r),

        BinOp::Eq => Ok(Value::from(l.cmp_value(r) == Ordering::Equal)),
        BinOp::Ne => Ok(Value::from(l.cmp_value(r) != Ordering::Equal)),
        BinOp::Lt => Ok(Value::from(l.cmp_value(r) == Ordering::Less)),
        BinOp::Le => Ok(Value::from(l.cmp_value(r) != Ordering::Greater)),
        BinOp::Gt => Ok(Value::from(l.cmp_value(r) == Ordering::Greater)),
        BinOp::Ge => Ok(Value::from(l.cmp_value(r) != Ordering::Less)),

        BinOp::And | BinOp::Or => unreachable!("short-circuited in eval_expr"),
    }
}

/// Convenience: parse and evaluate an expression string.
pub fn eval_str(src: &str, ctx: &mut dyn EvalContext) -> Result<Value, String> {
    let expr = parse_expr(src)?;
    eval_expr(&expr, ctx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // ── Minimal EvalContext for tests ─────────────────────────────────────────

    struct TestCtx {
        vars: HashMap<String, Value>,
        calls: usize,
    }

    impl TestCtx {
        fn new() -> Self {
            TestCtx { vars: HashMap::new(), calls: 0 }
        }
        fn with(mut self, k: &str, v: Value) -> Self {
            self.vars.insert(k.to_ascii_uppercase(), v);
            self
        }
    }

    impl EvalContext for TestCtx {
        fn get_var(&self, name: &str) -> Option<Value> {
            self.vars.get(&name.to_ascii_uppercase()).cloned()
        }
        fn call_fn(&mut self, name: &str, args: Vec<Value>) -> Result<Value, String> {
            self.calls += 1;
            match name {
                "TWICE" => Ok(Value::Float(args[0].as_float() * 2.0)),
                _ => Err(format!("unknown function {name}")),
            }
        }
    }

    fn eval(src: &str) -> Value {
        eval_str(src, &mut TestCtx::new()).expect("eval failed")
    }

    #[test]
    #[allow(clippy::approx_constant)]
    fn literals() {
        assert_eq!(eval("42"), Value::Int(42));
        assert_eq!(eval("3.14"), Value::Float(3.14));
        assert_eq!(eval(".5"), Value::Float(0.5));
        assert_eq!(eval("2e3"), Value::Float(2000.0));
        assert_eq!(eval("\"hello there\""), Value::Str("hello there".into()));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(eval("2 + 3"), Value::Int(5));
        assert_eq!(eval("10 - 4"), Value::Int(6));
        assert_eq!(eval("3 * 4"), Value::Int(12));
        assert_eq!(eval("10 / 4"), Value::Float(2.5));
        assert_eq!(eval("10 % 3"), Value::Int(1));
    }

    #[test]
    fn precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Int(14));
        assert_eq!(eval("(2 + 3) * 4"), Value::Int(20));
        assert_eq!(eval("1 + 1 == 2 AND 3 > 2"), Value::Int(1));
        assert_eq!(eval("-(3 + 2)"), Value::Int(-5));
    }

    #[test]
    fn comparison_and_logic() {
        assert_eq!(eval("3 == 3"), Value::Int(1));
        assert_eq!(eval("3 <> 4"), Value::Int(1));
        assert_eq!(eval("3 >= 3"), Value::Int(1));
        assert_eq!(eval("\"abc\" < \"abd\""), Value::Int(1));
        assert_eq!(eval("0 or 1"), Value::Int(1));
        assert_eq!(eval("1 && 0"), Value::Int(0));
        assert_eq!(eval("NOT 0"), Value::Int(1));
        assert_eq!(eval("!1"), Value::Int(0));
    }

    #[test]
    fn short_circuit_skips_rhs() {
        let mut ctx = TestCtx::new();
        assert_eq!(eval_str("0 AND TWICE(1)", &mut ctx), Ok(Value::Int(0)));
        assert_eq!(eval_str("1 OR TWICE(1)", &mut ctx), Ok(Value::Int(1)));
        assert_eq!(ctx.calls, 0);
        // The right side is not evaluated, so its fault is never raised.
        assert_eq!(eval_str("1 OR 1 / 0", &mut ctx), Ok(Value::Int(1)));
    }

    #[test]
    fn words_resolve_to_variables_or_themselves() {
        let mut ctx = TestCtx::new().with("x", Value::Int(7));
        assert_eq!(eval_str("X + 1", &mut ctx), Ok(Value::Int(8)));
        assert_eq!(eval_str("mode == idle", &mut ctx), Ok(Value::Int(0)));
        assert_eq!(eval_str("idle == idle", &mut ctx), Ok(Value::Int(1)));
    }

    #[test]
    fn function_calls() {
        let mut ctx = TestCtx::new();
        assert_eq!(eval_str("TWICE (4) + 1", &mut ctx), Ok(Value::Float(9.0)));
        assert!(eval_str("NOPE(1)", &mut ctx).is_err());
    }

    #[test]
    fn malformed_expressions_fail() {
        let mut ctx = TestCtx::new();
        assert!(eval_str("(1 + 2", &mut ctx).is_err());
        assert!(eval_str("1 + 2)", &mut ctx).is_err());
        assert!(eval_str("1 2", &mut ctx).is_err());
        assert!(eval_str("3 *", &mut ctx).is_err());
        assert!(eval_str("1 / 0", &mut ctx).is_err());
        assert!(eval_str("2 # 3", &mut ctx).is_err());
        assert!(eval_str("\"open", &mut ctx).is_err());
    }
}
