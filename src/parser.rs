//! Pratt parser for the infix expression language (§4.1).
//!
//! Precedence, tightest to loosest:
//! unary `+ - ~ not` > `**` (right-assoc) > `* / %` > `+ -` > `<< >>` >
//! `< <= > >=` > `== !=` > `&` > `^` > `|` > `and` > `or`.

use crate::ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
use crate::error::{CompileError, SourcePos};
use crate::lexer::{Lexer, Token};

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: (Token, SourcePos),
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Result<Self, CompileError> {
        let mut lexer = Lexer::new(src);
        let lookahead = lexer.next_token_flat()?;
        Ok(Parser { lexer, lookahead })
    }

    fn bump(&mut self) -> Result<(Token, SourcePos), CompileError> {
        let next = self.lexer.next_token_flat()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn peek(&self) -> &Token {
        &self.lookahead.0
    }

    fn pos(&self) -> SourcePos {
        self.lookahead.1
    }

    fn expect(&mut self, tok: &Token, what: &str) -> Result<(), CompileError> {
        if self.peek() == tok {
            self.bump()?;
            Ok(())
        } else {
            Err(CompileError::Parse { pos: self.pos(), message: format!("expected {what}") })
        }
    }

    /// Parse a full expression and require the input to be exhausted.
    pub fn parse_full(&mut self) -> Result<Expr, CompileError> {
        let e = self.parse_or()?;
        if *self.peek() != Token::Eof {
            return Err(CompileError::Parse { pos: self.pos(), message: "trailing input after expression".into() });
        }
        Ok(e)
    }

    pub fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Token::Ident(s) if s == "or") {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_and()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bitor()?;
        while matches!(self.peek(), Token::Ident(s) if s == "and") {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_bitor()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bitxor()?;
        while *self.peek() == Token::Pipe {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_bitxor()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::BitOr, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_bitand()?;
        while *self.peek() == Token::Caret {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_bitand()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::BitXor, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_equality()?;
        while *self.peek() == Token::Amp {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_equality()?;
            lhs = Expr::new(ExprKind::Binary(BinaryOp::BitAnd, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_comparison()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_shift()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Shl => BinaryOp::Shl,
                Token::Shr => BinaryOp::Shr,
                _ => break,
            };
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_additive()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_term()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_power()?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    /// `**` is right-associative and binds tighter than unary prefix on
    /// its left operand's continuation but looser than a leading unary
    /// (so `-x**2` parses as `-(x**2)`, matching Python/NumPy).
    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_unary()?;
        if *self.peek() == Token::StarStar {
            let pos = self.pos();
            self.bump()?;
            let rhs = self.parse_power()?;
            return Ok(Expr::new(ExprKind::Binary(BinaryOp::Pow, Box::new(lhs), Box::new(rhs)), pos));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            Token::Plus => Some(UnaryOp::Plus),
            Token::Minus => Some(UnaryOp::Neg),
            Token::Tilde => Some(UnaryOp::BitNot),
            Token::Ident(s) if s == "not" => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let pos = self.pos();
            self.bump()?;
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), pos));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, CompileError> {
        let pos = self.pos();
        match self.bump()?.0 {
            Token::IntLit(v) => Ok(Expr::new(ExprKind::Literal(Literal::Int(v)), pos)),
            Token::FloatLit(v) => Ok(Expr::new(ExprKind::Literal(Literal::Float(v)), pos)),
            Token::StringLit(s) => Ok(Expr::new(ExprKind::Literal(Literal::Str(s)), pos)),
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    self.bump()?;
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        loop {
                            args.push(self.parse_or()?);
                            if *self.peek() == Token::Comma {
                                self.bump()?;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    Ok(Expr::new(ExprKind::Call(name, args), pos))
                } else {
                    Ok(Expr::new(ExprKind::Ident(name), pos))
                }
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            other => Err(CompileError::Parse { pos, message: format!("unexpected token {other:?}") }),
        }
    }
}

/// Parse a complete infix expression source string.
pub fn parse(src: &str) -> Result<Expr, CompileError> {
    Parser::new(src)?.parse_full()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_add() {
        let e = parse("a + b").unwrap();
        assert!(matches!(e.kind, ExprKind::Binary(BinaryOp::Add, _, _)));
    }

    #[test]
    fn power_is_right_associative() {
        // 2 ** 3 ** 2 == 2 ** (3 ** 2)
        let e = parse("2 ** 3 ** 2").unwrap();
        if let ExprKind::Binary(BinaryOp::Pow, _, rhs) = e.kind {
            assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Pow, _, _)));
        } else {
            panic!("expected Pow");
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let e = parse("1 + 2 * 3").unwrap();
        if let ExprKind::Binary(BinaryOp::Add, _, rhs) = e.kind {
            assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Mul, _, _)));
        } else {
            panic!("expected Add at top");
        }
    }

    #[test]
    fn function_call_parses_args() {
        let e = parse("where(a > b, a, b)").unwrap();
        if let ExprKind::Call(name, args) = e.kind {
            assert_eq!(name, "where");
            assert_eq!(args.len(), 3);
        } else {
            panic!("expected Call");
        }
    }
}
