//! Step-dependent market parameters.
//!
//! A [`Param`] is either a constant or an arithmetic expression over the
//! round counter `steps`, e.g. `"1e-3 / sqrt(steps + 1)"`. Expressions are
//! parsed once, up front, into a small tree; evaluation cannot reach anything
//! but `steps` and the built-in functions.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := atom (('^' | '**') unary)?
//! atom    := number | 'steps' | func '(' expr (',' expr)* ')' | '(' expr ')'
//! func    := sqrt | exp | ln | log | abs | min | max
//! ```
//!
//! `log` is the natural logarithm, the same as `ln`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Malformed parameter expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid expression \"{expr}\" at offset {position}: {message}")]
pub struct ParamError {
    pub expr: String,
    pub position: usize,
    pub message: String,
}

/// A constant or a parsed expression of `steps`.
///
/// # Examples
///
/// ```
/// use power_market_sim::sim::param::Param;
///
/// let p: Param = "0.1 / (steps + 1)".parse().unwrap();
/// assert_eq!(p.value(0), 0.1);
/// assert_eq!(p.value(1), 0.05);
///
/// let c: Param = "2e-3".parse().unwrap();
/// assert_eq!(c, Param::Constant(2e-3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParam", into = "RawParam")]
pub enum Param {
    Constant(f64),
    Expr(Expression),
}

impl Param {
    /// Value at round `steps`. May be non-finite; callers decide what that means.
    pub fn value(&self, steps: usize) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::Expr(e) => e.eval(steps as f64),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Constant(v)
    }
}

impl FromStr for Param {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(v) = trimmed.parse::<f64>() {
            return Ok(Self::Constant(v));
        }
        Expression::parse(trimmed).map(Self::Expr)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(v) => write!(f, "{v}"),
            Self::Expr(e) => f.write_str(&e.text),
        }
    }
}

/// Serialized form of a [`Param`]: a number or an expression string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawParam {
    Number(f64),
    Text(String),
}

impl TryFrom<RawParam> for Param {
    type Error = ParamError;

    fn try_from(raw: RawParam) -> Result<Self, Self::Error> {
        match raw {
            RawParam::Number(v) => Ok(Self::Constant(v)),
            RawParam::Text(s) => s.parse(),
        }
    }
}

impl From<Param> for RawParam {
    fn from(p: Param) -> Self {
        match p {
            Param::Constant(v) => Self::Number(v),
            Param::Expr(e) => Self::Text(e.text),
        }
    }
}

/// A parsed expression, keeping its source text.
#[derive(Debug, Clone)]
pub struct Expression {
    text: String,
    root: Node,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Expression {
    /// Parses `text`.
    ///
    /// # Errors
    ///
    /// Returns a [`ParamError`] naming the offset of the first unexpected token.
    pub fn parse(text: &str) -> Result<Self, ParamError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            text,
            tokens: &tokens,
            pos: 0,
        };
        let root = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(parser.error_at(tok.offset, "unexpected trailing input"));
        }
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.text
    }

    pub fn eval(&self, steps: f64) -> f64 {
        self.root.eval(steps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Sqrt,
    Exp,
    Ln,
    Abs,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }

    /// `(min, max)` argument count.
    fn arity(self) -> (usize, usize) {
        match self {
            Self::Min | Self::Max => (1, usize::MAX),
            _ => (1, 1),
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Self::Sqrt => args[0].sqrt(),
            Self::Exp => args[0].exp(),
            Self::Ln => args[0].ln(),
            Self::Abs => args[0].abs(),
            Self::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone)]
enum Node {
    Num(f64),
    Steps,
    Neg(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

impl Node {
    fn eval(&self, steps: f64) -> f64 {
        match self {
            Self::Num(v) => *v,
            Self::Steps => steps,
            Self::Neg(n) => -n.eval(steps),
            Self::Bin(op, l, r) => {
                let (l, r) = (l.eval(steps), r.eval(steps));
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Pow => l.powf(r),
                }
            }
            Self::Call(func, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(steps)).collect();
                func.apply(&values)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Num(f64),
    Ident(String),
    Op(BinOp),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParamError> {
    let err = |offset: usize, message: String| ParamError {
        expr: text.to_string(),
        position: offset,
        message,
    };
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal = &text[start..i];
                let v = literal
                    .parse::<f64>()
                    .map_err(|_| err(start, format!("bad number \"{literal}\"")))?;
                TokenKind::Num(v)
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                TokenKind::Ident(text[start..i].to_string())
            }
            b'*' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                TokenKind::Op(BinOp::Pow)
            }
            _ => {
                i += 1;
                match c {
                    b'+' => TokenKind::Op(BinOp::Add),
                    b'-' => TokenKind::Op(BinOp::Sub),
                    b'*' => TokenKind::Op(BinOp::Mul),
                    b'/' => TokenKind::Op(BinOp::Div),
                    b'^' => TokenKind::Op(BinOp::Pow),
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b',' => TokenKind::Comma,
                    _ => {
                        let ch = text[start..].chars().next().unwrap_or('?');
                        return Err(err(start, format!("unexpected character '{ch}'")));
                    }
                }
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn error_at(&self, position: usize, message: impl Into<String>) -> ParamError {
        ParamError {
            expr: self.text.to_string(),
            position,
            message: message.into(),
        }
    }

    fn end_error(&self) -> ParamError {
        self.error_at(self.text.len(), "unexpected end of expression")
    }

    fn expr(&mut self) -> Result<Node, ParamError> {
        let mut node = self.term()?;
        while let Some(TokenKind::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek_kind() {
            let op = *op;
            self.pos += 1;
            node = Node::Bin(op, Box::new(node), Box::new(self.term()?));
        }
        Ok(node)
    }

    fn term(&mut self) -> Result<Node, ParamError> {
        let mut node = self.unary()?;
        while let Some(TokenKind::Op(op @ (BinOp::Mul | BinOp::Div))) = self.peek_kind() {
            let op = *op;
            self.pos += 1;
            node = Node::Bin(op, Box::new(node), Box::new(self.unary()?));
        }
        Ok(node)
    }

    fn unary(&mut self) -> Result<Node, ParamError> {
        match self.peek_kind() {
            Some(TokenKind::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(TokenKind::Op(BinOp::Add)) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Node, ParamError> {
        let base = self.atom()?;
        if let Some(TokenKind::Op(BinOp::Pow)) = self.peek_kind() {
            self.pos += 1;
            // right associative: the exponent may itself be a power
            let exponent = self.unary()?;
            return Ok(Node::Bin(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Node, ParamError> {
        let Some(tok) = self.next().cloned() else {
            return Err(self.end_error());
        };
        match tok.kind {
            TokenKind::Num(v) => Ok(Node::Num(v)),
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect_rparen()?;
                Ok(inner)
            }
            TokenKind::Ident(name) if name == "steps" => Ok(Node::Steps),
            TokenKind::Ident(name) => {
                let Some(func) = Func::lookup(&name) else {
                    return Err(self.error_at(tok.offset, format!("unknown name \"{name}\"")));
                };
                self.call(func, &name, tok.offset)
            }
            _ => Err(self.error_at(tok.offset, "expected a number, `steps` or a function")),
        }
    }

    fn call(&mut self, func: Func, name: &str, offset: usize) -> Result<Node, ParamError> {
        match self.next().map(|t| t.kind.clone()) {
            Some(TokenKind::LParen) => {}
            _ => return Err(self.error_at(offset, format!("`{name}` must be called"))),
        }
        let mut args = vec![self.expr()?];
        while let Some(TokenKind::Comma) = self.peek_kind() {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect_rparen()?;
        let (lo, hi) = func.arity();
        if args.len() < lo || args.len() > hi {
            return Err(self.error_at(
                offset,
                format!("`{name}` takes {lo} argument(s), got {}", args.len()),
            ));
        }
        Ok(Node::Call(func, args))
    }

    fn expect_rparen(&mut self) -> Result<(), ParamError> {
        match self.next().map(|t| (t.kind.clone(), t.offset)) {
            Some((TokenKind::RParen, _)) => Ok(()),
            Some((_, offset)) => Err(self.error_at(offset, "expected ')'")),
            None => Err(self.end_error()),
        }
    }
}
