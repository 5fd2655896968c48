pub mod eval;
pub mod lexer;
pub mod parser;
pub mod template;
pub mod value;

pub use template::Template;
pub use value::Value;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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

/// Immutable expression tree. Holds no state, so one tree can be evaluated
/// from any number of instances at once.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Built-in call; the name is stored lower-case.
    Call(String, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {position})")]
pub struct ParseError {
    pub message:  String,
    /// Byte offset of the offending token in the source text.
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self { message: message.into(), position }
    }
}

/// Only reachable for trees that did not come from the parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' expects {expected}, got {got}")]
    Arity { name: String, expected: String, got: usize },
}

// ---------------------------------------------------------------------------
// Variable lookup seam
// ---------------------------------------------------------------------------

/// Anything expressions can resolve names against.
pub trait Variables {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Variables for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Compiled expression handle
// ---------------------------------------------------------------------------

/// Source text plus its parsed tree. Cloning shares the tree.
#[derive(Debug, Clone)]
pub struct Expression {
    source: Arc<str>,
    ast:    Arc<Expr>,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let ast = parser::parse(source)?;
        Ok(Self { source: Arc::from(source), ast: Arc::new(ast) })
    }

    /// Wrap a tree built outside the parser (e.g. by an external editor).
    pub fn from_ast(source: impl Into<Arc<str>>, ast: Expr) -> Self {
        Self { source: source.into(), ast: Arc::new(ast) }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, vars: &dyn Variables) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, vars)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Parse cache
// ---------------------------------------------------------------------------

/// Deduplicates parsing when many triggers share the same expression text.
/// Lives only for one definitions compile, so it needs no locking.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    parsed: HashMap<String, Expression>,
}

impl ExpressionCache {
    pub fn parse(&mut self, source: &str) -> Result<Expression, ParseError> {
        if let Some(hit) = self.parsed.get(source) {
            return Ok(hit.clone());
        }
        let expr = Expression::parse(source)?;
        self.parsed.insert(source.to_owned(), expr.clone());
        Ok(expr)
    }
}
