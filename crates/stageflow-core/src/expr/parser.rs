//! Recursive-descent parser for the expression grammar.
//!
//! Precedence, lowest to highest: ternary `?:`, `||`, `&&`, equality
//! (`==`/`!=`), relational (`<`/`<=`/`>`/`>=`), unary `!`, primary
//! (literals, dotted property paths, function calls, parentheses).

use serde_json::Value;

use super::lexer::{Lexer, Token, TokenKind};
use super::ExpressionError;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String, number, boolean, or null literal.
    Literal(Value),
    /// Dotted property path; the first segment is the namespace.
    Path(Vec<String>),
    /// Unary operator application.
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// Binary operator application.
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `condition ? then : else`.
    Ternary {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// Builtin function call.
    Call { function: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse expression source text into an [`Expr`].
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    parser.expect(TokenKind::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token stream always ends with Eof, so `pos` stays in bounds.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ExpressionError> {
        let token = self.peek().clone();
        if token.kind == kind {
            Ok(self.advance())
        } else {
            Err(ExpressionError::Parse {
                position: token.pos,
                message: format!("expected {kind}, found {}", token.kind),
            })
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let condition = self.logical_or()?;
        if self.eat(TokenKind::Question) {
            let then_branch = self.ternary()?;
            self.expect(TokenKind::Colon)?;
            let else_branch = self.ternary()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(condition)
    }

    fn logical_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.logical_and()?;
        while self.eat(TokenKind::OrOr) {
            let rhs = self.logical_and()?;
            expr = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn logical_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.equality()?;
        while self.eat(TokenKind::AndAnd) {
            let rhs = self.equality()?;
            expr = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.relational()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let rhs = self.relational()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn relational(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(TokenKind::Bang) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::LParen => {
                self.advance();
                let expr = self.ternary()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::StringLiteral => {
                self.advance();
                Ok(Expr::Literal(Value::String(token.text)))
            }
            TokenKind::NumberLiteral => {
                self.advance();
                self.number(&token)
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::Identifier => {
                self.advance();
                if self.peek().kind == TokenKind::LParen {
                    return self.call(token.text);
                }
                let mut segments = vec![token.text];
                while self.eat(TokenKind::Dot) {
                    let segment = self.expect(TokenKind::Identifier)?;
                    segments.push(segment.text);
                }
                Ok(Expr::Path(segments))
            }
            other => Err(ExpressionError::Parse {
                position: token.pos,
                message: format!("expected a value, found {other}"),
            }),
        }
    }

    fn call(&mut self, function: String) -> Result<Expr, ExpressionError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                args.push(self.ternary()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::Call { function, args })
    }

    fn number(&self, token: &Token) -> Result<Expr, ExpressionError> {
        if token.text.contains('.') {
            let parsed: f64 = token.text.parse().map_err(|_| ExpressionError::Parse {
                position: token.pos,
                message: format!("invalid number '{}'", token.text),
            })?;
            serde_json::Number::from_f64(parsed)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| ExpressionError::Parse {
                    position: token.pos,
                    message: format!("number '{}' is not representable", token.text),
                })
        } else {
            let parsed: i64 = token.text.parse().map_err(|_| ExpressionError::Parse {
                position: token.pos,
                message: format!("invalid number '{}'", token.text),
            })?;
            Ok(Expr::Literal(Value::Number(parsed.into())))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
