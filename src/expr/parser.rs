/// Recursive-descent parser producing an immutable `Expr` tree.
///
/// Precedence, lowest first:
///   ||   &&   == !=   < <= > >=   + -   * / %   unary - !   primary
///
/// Function names and arities are checked here, so every tree the parser
/// hands out evaluates without error.
use super::eval::builtin;
use super::lexer::{tokenize, Token, TokenKind};
use super::{BinaryOp, Expr, ParseError, UnaryOp, Value};

pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, cursor: 0, depth: 0 };
    let expr = parser.parse_or()?;
    let tail = parser.peek();
    if tail.kind != TokenKind::Eof {
        return Err(ParseError::new(format!("unexpected {}", describe(&tail.kind)), tail.pos));
    }
    Ok(expr)
}

/// Deepest expression tree the parser will build.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    depth:  usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize() always terminates the stream with Eof
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let tok = self.peek().clone();
        if tok.kind == kind {
            Ok(self.advance())
        } else {
            Err(ParseError::new(
                format!("expected {}, found {}", what, describe(&tok.kind)),
                tok.pos,
            ))
        }
    }

    /// Count one level of tree depth. Evaluation and drop both recurse over
    /// the tree, so its depth is bounded here.
    fn enter(&mut self, pos: usize) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::new("expression nested too deeply", pos));
        }
        Ok(())
    }

    /// One left-associative precedence level.
    fn binary_chain(
        &mut self,
        next:  fn(&mut Self) -> Result<Expr, ParseError>,
        op_of: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> Result<Expr, ParseError> {
        let mut lhs = next(self)?;
        let mut chained = 0;
        while let Some(op) = op_of(&self.peek().kind) {
            let pos = self.advance().pos;
            self.enter(pos)?;
            chained += 1;
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_and, |k| match k {
            TokenKind::OrOr => Some(BinaryOp::Or),
            _ => None,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_equality, |k| match k {
            TokenKind::AndAnd => Some(BinaryOp::And),
            _ => None,
        })
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_comparison, |k| match k {
            TokenKind::EqEq  => Some(BinaryOp::Eq),
            TokenKind::NotEq => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_additive, |k| match k {
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_multiplicative, |k| match k {
            TokenKind::Plus  => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_chain(Self::parse_unary, |k| match k {
            TokenKind::Star    => Some(BinaryOp::Mul),
            TokenKind::Slash   => Some(BinaryOp::Div),
            TokenKind::Percent => Some(BinaryOp::Rem),
            _ => None,
        })
    }

    /// Every parenthesis and call argument passes through here, so this is
    /// where nesting is counted.
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.peek().pos;
        self.enter(pos)?;
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang  => Some(UnaryOp::Not),
            _ => None,
        };
        let expr = match op {
            Some(op) => {
                self.advance();
                let operand = self.parse_unary()?;
                Expr::Unary(op, Box::new(operand))
            }
            None => self.parse_primary()?,
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Str(s)    => Ok(Expr::Literal(Value::Str(s))),
            TokenKind::True      => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False     => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::LParen    => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.advance();
                    self.parse_call(name, tok.pos)
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(ParseError::new(
                format!("expected a value, found {}", describe(&other)),
                tok.pos,
            )),
        }
    }

    fn parse_call(&mut self, name: String, pos: usize) -> Result<Expr, ParseError> {
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(TokenKind::RParen, "',' or ')'")?;
                break;
            }
        }

        let lower = name.to_ascii_lowercase();
        let sig = builtin(&lower)
            .ok_or_else(|| ParseError::new(format!("unknown function '{}'", name), pos))?;
        if !sig.accepts(args.len()) {
            return Err(ParseError::new(
                format!("function '{}' expects {}, got {}", lower, sig.arity_text(), args.len()),
                pos,
            ));
        }
        Ok(Expr::Call(lower, args))
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Str(_)    => "string literal".to_owned(),
        TokenKind::Ident(i)  => format!("identifier '{}'", i),
        TokenKind::Eof       => "end of expression".to_owned(),
        other                => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_associativity() {
        // 10 - 4 - 3 must parse as (10 - 4) - 3
        let e = parse("10 - 4 - 3").unwrap();
        match e {
            Expr::Binary(BinaryOp::Sub, lhs, _) => {
                assert!(matches!(*lhs, Expr::Binary(BinaryOp::Sub, _, _)));
            }
            other => panic!("wrong shape: {:?}", other),
        }

        // 1 + 2 * 3 must parse as 1 + (2 * 3)
        let e = parse("1 + 2 * 3").unwrap();
        match e {
            Expr::Binary(BinaryOp::Add, _, rhs) => {
                assert!(matches!(*rhs, Expr::Binary(BinaryOp::Mul, _, _)));
            }
            other => panic!("wrong shape: {:?}", other),
        }
    }

    #[test]
    fn function_calls_are_validated() {
        assert!(parse("upper(name)").is_ok());
        assert!(parse("MAX(1, 2, 3)").is_ok());

        let err = parse("explode(1)").unwrap_err();
        assert_eq!(err.position, 0);
        assert!(err.message.contains("unknown function"));

        let err = parse("1 + substr('x')").unwrap_err();
        assert_eq!(err.position, 4);
    }

    #[test]
    fn reports_offending_token_position() {
        let err = parse("hp < ").unwrap_err();
        assert_eq!(err.position, 5);

        let err = parse("(1 + 2").unwrap_err();
        assert_eq!(err.position, 6);

        let err = parse("1 2").unwrap_err();
        assert_eq!(err.position, 2);
    }

    #[test]
    fn rejects_runaway_nesting() {
        let deep = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = parse(&deep).unwrap_err();
        assert!(err.message.contains("nested too deeply"));

        assert!(parse(&"!".repeat(10_000)).is_err());
        assert!(parse(&vec!["1"; 10_000].join(" + ")).is_err());
    }

    #[test]
    fn accepts_reasonable_nesting() {
        let nested = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert!(parse(&nested).is_ok());
        assert!(parse(&vec!["x"; 40].join(" + ")).is_ok());
        assert!(parse("max(1, min(2, abs(-(3 * (4 + 5)))))").is_ok());
    }
}
