//! Exact-text rewriting of stored SELECT statements.
//!
//! Statements are tokenized, split into head / select list / FROM / WHERE /
//! tail, edited structurally and printed back. Parameter slots print as `%s`
//! or as numbered `$n` placeholders for the PostgreSQL driver.

mod fragment;
mod statement;

pub use fragment::{Fragment, Piece, PlaceholderStyle};
pub use statement::{
    build_comparison, build_function_call, Condition, Identifier, SelectStatement,
};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    #[error("failed to tokenize SQL: {0}")]
    Tokenize(String),
    #[error("empty SQL statement")]
    Empty,
    #[error("expected exactly one statement, found {0}")]
    MultipleStatements(usize),
    #[error("statement is not a SELECT")]
    NotASelect,
    #[error("empty entry in select list")]
    EmptySelectItem,
    #[error("stored SQL may not contain bind placeholders ({0})")]
    EmbeddedPlaceholder(String),
    #[error("no select-list entry named '{0}'")]
    IdentifierNotFound(String),
    #[error("empty condition")]
    EmptyCondition,
}
