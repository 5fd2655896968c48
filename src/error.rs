/// Edit-time errors for trigger definitions.
///
/// None of these are fatal to the running engine: a trigger carrying a
/// compile problem is kept in the registry but never matches until its
/// definition is corrected.
use crate::expr::ParseError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source:  regex::Error,
    },

    #[error("invalid expression in {field} '{text}': {source}")]
    Expression {
        field:  String,
        text:   String,
        #[source]
        source: ParseError,
    },

    #[error("{0}")]
    Definition(String),
}

impl CompileError {
    pub fn expression(field: impl Into<String>, text: &str, source: ParseError) -> Self {
        Self::Expression { field: field.into(), text: text.to_owned(), source }
    }
}
