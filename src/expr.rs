//! Calculation expressions.
//!
//! Shared by the calculation filter, derived properties and `calculate`.
//! Identifiers are either `$variables` or property names; the caller resolves
//! them (possibly asynchronously) into a binding map before evaluation.

use std::collections::HashMap;

use crate::error::ExpressionError;
use crate::value::Value;

/// A name referenced by an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// `$name`
    Variable(String),
    /// Bare (possibly dotted) property name.
    Property(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    const fn binding_power(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::Rem => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Abs,
    Floor,
    Ceil,
    Round,
    Sqrt,
    Min,
    Max,
}

impl Func {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "sqrt" => Self::Sqrt,
            "min" => Self::Min,
            "max" => Self::Max,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Text(String),
    Ident(Identifier),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(BinOp),
    LParen,
    RParen,
    Comma,
}

/// A parsed calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses an expression.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(ExpressionError::Parse {
                position: parser.pos,
                reason: "unexpected trailing input".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct identifiers in first-seen order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut out = Vec::new();
        collect_identifiers(&self.root, &mut out);
        out
    }

    /// Evaluates against resolved identifier bindings.
    pub fn evaluate(&self, bindings: &HashMap<Identifier, Value>) -> Result<Value, ExpressionError> {
        self.eval(&self.root, bindings)
    }

    fn eval(&self, expr: &Expr, bindings: &HashMap<Identifier, Value>) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Text(s) => Ok(Value::String(s.clone())),
            Expr::Ident(id) => bindings
                .get(id)
                .cloned()
                .ok_or_else(|| self.fail(format!("unbound identifier {id:?}"))),
            Expr::Neg(inner) => {
                let v = self.eval(inner, bindings)?;
                Ok(Value::Number(-self.number(&v)?))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs, bindings)?;
                let r = self.eval(rhs, bindings)?;
                if *op == BinOp::Add && (l.is_string() || r.is_string()) {
                    return Ok(Value::String(format!("{}{}", l.to_text(), r.to_text())));
                }
                let (a, b) = (self.number(&l)?, self.number(&r)?);
                let out = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div | BinOp::Rem if b == 0.0 => {
                        return Err(self.fail("division by zero".to_string()));
                    }
                    BinOp::Div => a / b,
                    BinOp::Rem => a % b,
                };
                Ok(Value::Number(out))
            }
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, bindings).and_then(|v| self.number(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(*func, &values)
            }
        }
    }

    fn call(&self, func: Func, args: &[f64]) -> Result<Value, ExpressionError> {
        let unary = |f: fn(f64) -> f64| match args {
            [x] => Ok(Value::Number(f(*x))),
            _ => Err(self.fail(format!("{func:?} takes exactly one argument"))),
        };
        match func {
            Func::Abs => unary(f64::abs),
            Func::Floor => unary(f64::floor),
            Func::Ceil => unary(f64::ceil),
            Func::Round => unary(f64::round),
            Func::Sqrt => unary(f64::sqrt),
            Func::Min | Func::Max => {
                let mut iter = args.iter().copied();
                let first = iter
                    .next()
                    .ok_or_else(|| self.fail(format!("{func:?} needs at least one argument")))?;
                let pick = if func == Func::Min { f64::min } else { f64::max };
                Ok(Value::Number(iter.fold(first, pick)))
            }
        }
    }

    fn number(&self, v: &Value) -> Result<f64, ExpressionError> {
        match v {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.fail(format!("{s:?} is not a number"))),
            other => Err(self.fail(format!("{} is not a number", other.kind()))),
        }
    }

    fn fail(&self, reason: String) -> ExpressionError {
        ExpressionError::Eval {
            expression: self.source.clone(),
            reason,
        }
    }
}

fn collect_identifiers(expr: &Expr, out: &mut Vec<Identifier>) {
    match expr {
        Expr::Ident(id) => {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        Expr::Neg(inner) => collect_identifiers(inner, out),
        Expr::Binary(_, l, r) => {
            collect_identifiers(l, out);
            collect_identifiers(r, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_identifiers(a, out)),
        Expr::Number(_) | Expr::Text(_) => {}
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Rem));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExpressionError::Parse {
                                position: start,
                                reason: "unterminated string".to_string(),
                            });
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| ExpressionError::Parse {
                    position: start,
                    reason: format!("invalid number '{text}'"),
                })?;
                tokens.push(Token::Number(n));
            }
            c if c == '$' || c == '_' || c.is_alphabetic() => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExpressionError::Parse {
                    position: i,
                    reason: format!("unexpected character '{other}'"),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn error(&self, reason: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            position: self.pos,
            reason: reason.into(),
        }
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.prefix()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let bp = op.binding_power();
            if bp <= min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::Op(BinOp::Sub)) => Ok(Expr::Neg(Box::new(self.expression(2)?))),
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    let func = Func::parse(&name)
                        .ok_or_else(|| self.error(format!("unknown function '{name}'")))?;
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.expression(0)?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(self.error("expected ',' or ')'")),
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                    return Ok(Expr::Call(func, args));
                }
                match name.strip_prefix('$') {
                    Some(var) if !var.is_empty() => Ok(Expr::Ident(Identifier::Variable(var.to_string()))),
                    Some(_) => Err(self.error("empty variable name")),
                    None => Ok(Expr::Ident(Identifier::Property(name))),
                }
            }
            Some(other) => Err(self.error(format!("unexpected token {other:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
