//! Statement validation and execution against the warehouse.
//!
//! Nothing reaches the warehouse unless [`validate`] accepts it first.

use std::fmt;
use std::sync::Arc;

use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::error::Error;
use crate::models::ResultTable;
use crate::warehouse::Warehouse;

/// Words that never appear in an accepted statement, matched case-insensitively
/// as whole words.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "MERGE",
    "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "GRANT", "REVOKE", "EXEC", "EXECUTE",
    "CALL", "COPY",
];

/// Why a statement was refused before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Semicolon,
    ForbiddenKeyword(String),
    Unparseable(String),
    MultipleStatements(usize),
    NotAQuery,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => write!(f, "statement is empty"),
            Rejection::Semicolon => write!(f, "statement contains ';'"),
            Rejection::ForbiddenKeyword(word) => {
                write!(f, "statement contains forbidden keyword {word}")
            }
            Rejection::Unparseable(e) => write!(f, "statement does not parse: {e}"),
            Rejection::MultipleStatements(n) => write!(f, "expected one statement, found {n}"),
            Rejection::NotAQuery => write!(f, "only SELECT queries are allowed"),
        }
    }
}

impl std::error::Error for Rejection {}

/// Accept only a single read-only query.
pub fn validate(sql: &str) -> Result<(), Rejection> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(Rejection::Empty);
    }
    if sql.contains(';') {
        return Err(Rejection::Semicolon);
    }
    if let Some(word) = forbidden_keyword(sql) {
        return Err(Rejection::ForbiddenKeyword(word.to_string()));
    }

    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| Rejection::Unparseable(e.to_string()))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [_] => Err(Rejection::NotAQuery),
        [] => Err(Rejection::Empty),
        many => Err(Rejection::MultipleStatements(many.len())),
    }
}

/// First forbidden keyword appearing as a whole word.
fn forbidden_keyword(sql: &str) -> Option<&'static str> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            FORBIDDEN_KEYWORDS
                .iter()
                .find(|kw| kw.eq_ignore_ascii_case(word))
                .copied()
        })
}

/// Outcome of a statement that did not produce rows.
#[derive(Debug)]
pub enum ExecutionFailure {
    Rejected(Rejection),
    /// Engine error or timeout, with the text to show the user.
    Failed(String),
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::Rejected(r) => write!(f, "rejected: {r}"),
            ExecutionFailure::Failed(e) => write!(f, "execution failed: {e}"),
        }
    }
}

/// Runs validated statements with a row cap.
#[derive(Clone)]
pub struct QueryExecutor {
    warehouse: Arc<dyn Warehouse>,
    max_rows: usize,
}

impl QueryExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>, max_rows: usize) -> Self {
        Self {
            warehouse,
            max_rows: max_rows.max(1),
        }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub async fn execute(&self, sql: &str) -> Result<ResultTable, ExecutionFailure> {
        if let Err(rejection) = validate(sql) {
            tracing::warn!(%rejection, sql, "statement rejected");
            return Err(ExecutionFailure::Rejected(rejection));
        }

        match self.warehouse.query(sql.trim(), self.max_rows).await {
            Ok(table) => {
                tracing::debug!(
                    rows = table.row_count(),
                    truncated = table.truncated,
                    "statement executed"
                );
                Ok(table)
            }
            Err(Error::Database(e)) => {
                let text = e
                    .as_database_error()
                    .map_or_else(|| e.to_string(), |db| db.message().to_string());
                tracing::warn!(error = %text, "statement failed");
                Err(ExecutionFailure::Failed(text))
            }
            Err(e) => {
                tracing::warn!(error = %e, "statement failed");
                Err(ExecutionFailure::Failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
