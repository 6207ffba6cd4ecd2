//! Grammar pass for everything that is not a control-flow token.
//!
//! The dispatcher hands the grammar pass the cursor whenever it sits on a
//! non-control token. One statement is parsed from there up to and including
//! its `;`; the returned [`Statement`] records where the dispatcher resumes.
//! Condition expressions of loop and conditional headers are parsed with
//! [`parse_expression`] over the exact token range of the condition.

use super::value::{BinaryOp, UnaryOp, Value};
use crate::error::{InterpretError, InterpretResult};
use crate::program::{Location, Payload, ProgToken, TokenKind};

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(Value),
    /// Variable read
    Variable(String),
    /// Array literal
    Array(Vec<Expr>),
    /// `target[index]`
    Index {
        /// Indexed expression
        target: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// Function call
    Call {
        /// Function name
        name: String,
        /// Argument expressions
        args: Vec<Expr>,
        /// Location of the function name
        location: Location,
    },
    /// Unary operation
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Visit every function call in the expression tree.
    pub fn for_each_call<F>(&self, f: &mut F) -> InterpretResult<()>
    where
        F: FnMut(&str, usize, &Location) -> InterpretResult<()>,
    {
        match self {
            Expr::Literal(_) | Expr::Variable(_) => Ok(()),
            Expr::Array(items) => items.iter().try_for_each(|item| item.for_each_call(f)),
            Expr::Index { target, index } => {
                target.for_each_call(f)?;
                index.for_each_call(f)
            }
            Expr::Call {
                name,
                args,
                location,
            } => {
                f(name, args.len(), location)?;
                args.iter().try_for_each(|arg| arg.for_each_call(f))
            }
            Expr::Unary(_, operand) => operand.for_each_call(f),
            Expr::Binary(_, lhs, rhs) => {
                lhs.for_each_call(f)?;
                rhs.for_each_call(f)
            }
        }
    }
}

/// Assignment operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
}

impl AssignOp {
    /// Arithmetic operator applied by a compound assignment.
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        }
    }

    fn from_kind(kind: TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Assign => Some(AssignOp::Set),
            TokenKind::AddAssign => Some(AssignOp::Add),
            TokenKind::SubAssign => Some(AssignOp::Sub),
            TokenKind::MulAssign => Some(AssignOp::Mul),
            TokenKind::DivAssign => Some(AssignOp::Div),
            _ => None,
        }
    }
}

/// Parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Assignment to a variable or an array element
    Assign {
        /// Variable name
        name: String,
        /// Element index for `name[index] = ...`
        index: Option<Expr>,
        /// Operator
        op: AssignOp,
        /// Right-hand side
        value: Expr,
    },
    /// Expression evaluated for its side effects
    Expr(Expr),
    /// Lone `;`
    Empty,
}

impl Stmt {
    /// Visit every function call in the statement.
    pub fn for_each_call<F>(&self, f: &mut F) -> InterpretResult<()>
    where
        F: FnMut(&str, usize, &Location) -> InterpretResult<()>,
    {
        match self {
            Stmt::Assign { index, value, .. } => {
                if let Some(index) = index {
                    index.for_each_call(f)?;
                }
                value.for_each_call(f)
            }
            Stmt::Expr(expr) => expr.for_each_call(f),
            Stmt::Empty => Ok(()),
        }
    }
}

/// A statement together with its position in the program buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The parsed statement
    pub stmt: Stmt,
    /// Location of its first token
    pub location: Location,
    /// Index of the token following the terminating `;`
    pub next: usize,
}

/// Parse one statement starting at `start`.
pub fn parse_statement(tokens: &[ProgToken], start: usize) -> InterpretResult<Statement> {
    let mut parser = Parser::new(tokens, start, tokens.len());
    let location = parser.location();

    if parser.eat(TokenKind::Semicolon) {
        return Ok(Statement {
            stmt: Stmt::Empty,
            location,
            next: parser.pos,
        });
    }

    let lhs = parser.expr()?;
    let stmt = match parser.peek_kind().and_then(AssignOp::from_kind) {
        Some(op) => {
            parser.pos += 1;
            let (name, index) = match lhs {
                Expr::Variable(name) => (name, None),
                Expr::Index { target, index } => match *target {
                    Expr::Variable(name) => (name, Some(*index)),
                    _ => return Err(parser.error("only variables and array elements can be assigned")),
                },
                _ => return Err(parser.error("only variables and array elements can be assigned")),
            };
            let value = parser.expr()?;
            Stmt::Assign {
                name,
                index,
                op,
                value,
            }
        }
        None => Stmt::Expr(lhs),
    };

    if !parser.eat(TokenKind::Semicolon) {
        return Err(parser.unexpected("';'"));
    }
    Ok(Statement {
        stmt,
        location,
        next: parser.pos,
    })
}

/// Parse the expression spanning exactly `tokens[start..end]`.
pub fn parse_expression(tokens: &[ProgToken], start: usize, end: usize) -> InterpretResult<Expr> {
    let mut parser = Parser::new(tokens, start, end);
    if parser.peek().is_none() {
        return Err(parser.error("missing expression"));
    }
    let expr = parser.expr()?;
    if parser.peek().is_some() {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(expr)
}

struct Parser<'t> {
    tokens: &'t [ProgToken],
    pos: usize,
    end: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [ProgToken], start: usize, end: usize) -> Self {
        Self {
            tokens,
            pos: start,
            end: end.min(tokens.len()),
        }
    }

    fn peek(&self) -> Option<&'t ProgToken> {
        if self.pos < self.end {
            self.tokens.get(self.pos)
        } else {
            None
        }
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn location(&self) -> Location {
        self.tokens
            .get(self.pos.min(self.end))
            .or_else(|| self.tokens.last())
            .map(|t| t.location.clone())
            .unwrap_or_else(|| Location::new("<program>", 0))
    }

    fn error(&self, message: impl Into<String>) -> InterpretError {
        InterpretError::Syntax {
            message: message.into(),
            location: self.location(),
        }
    }

    fn unexpected(&self, expected: &str) -> InterpretError {
        match self.peek() {
            Some(token) => self.error(format!("expected {expected}, found {}", token.kind)),
            None => self.error(format!("expected {expected} before end of input")),
        }
    }

    fn expr(&mut self) -> InterpretResult<Expr> {
        self.or()
    }

    fn or(&mut self) -> InterpretResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat(TokenKind::Or) {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> InterpretResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.eat(TokenKind::And) {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> InterpretResult<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Eq) => BinaryOp::Eq,
            Some(TokenKind::Ne) => BinaryOp::Ne,
            Some(TokenKind::Lt) => BinaryOp::Lt,
            Some(TokenKind::Le) => BinaryOp::Le,
            Some(TokenKind::Gt) => BinaryOp::Gt,
            Some(TokenKind::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> InterpretResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> InterpretResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> InterpretResult<Expr> {
        if self.eat(TokenKind::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(TokenKind::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(TokenKind::Plus) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> InterpretResult<Expr> {
        let base = self.postfix()?;
        if self.eat(TokenKind::Caret) {
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> InterpretResult<Expr> {
        let mut expr = self.primary()?;
        while self.eat(TokenKind::LBracket) {
            let index = self.expr()?;
            if !self.eat(TokenKind::RBracket) {
                return Err(self.unexpected("']'"));
            }
            expr = Expr::Index {
                target: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> InterpretResult<Expr> {
        let Some(token) = self.peek() else {
            return Err(self.unexpected("an expression"));
        };
        let expr = match (&token.kind, &token.payload) {
            (TokenKind::Int, Payload::Int(v)) => Expr::Literal(Value::Int(*v)),
            (TokenKind::Float, Payload::Float(v)) => Expr::Literal(Value::Float(*v)),
            (TokenKind::Str, Payload::Str(s)) => Expr::Literal(Value::Str(s.clone())),
            (TokenKind::Variable, Payload::Name(name)) => Expr::Variable(name.clone()),
            (TokenKind::Function, Payload::Name(name)) => {
                let location = token.location.clone();
                self.pos += 1;
                let args = self.list(TokenKind::LParen, TokenKind::RParen)?;
                return Ok(Expr::Call {
                    name: name.clone(),
                    args,
                    location,
                });
            }
            (TokenKind::LParen, _) => {
                self.pos += 1;
                let inner = self.expr()?;
                if !self.eat(TokenKind::RParen) {
                    return Err(self.unexpected("')'"));
                }
                return Ok(inner);
            }
            (TokenKind::LBracket, _) => {
                let items = self.list(TokenKind::LBracket, TokenKind::RBracket)?;
                return Ok(Expr::Array(items));
            }
            _ => return Err(self.unexpected("an expression")),
        };
        self.pos += 1;
        Ok(expr)
    }

    /// Comma separated expressions between `open` and `close`.
    fn list(&mut self, open: TokenKind, close: TokenKind) -> InterpretResult<Vec<Expr>> {
        if !self.eat(open) {
            return Err(self.unexpected(open.describe()));
        }
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat(close) {
                return Ok(items);
            }
            if !self.eat(TokenKind::Comma) {
                return Err(self.unexpected(&format!("',' or {close}")));
            }
        }
    }
}
