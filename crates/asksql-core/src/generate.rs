//! SQL generation from a refined question and retrieved context.

use std::fmt;
use std::sync::Arc;

use crate::index::RetrievalContext;
use crate::llm::{CompletionProvider, CompletionRequest};
use crate::refine::strip_label;

pub const SYSTEM_PROMPT: &str = "You are a SQL expert for a business analytics system. \
Write one SQLite query that answers the question.

STRICT RULES:
- Output exactly one SELECT statement (a WITH clause is allowed), no semicolon
- Never use INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, TRUNCATE, PRAGMA or ATTACH
- Use only tables and columns present in the context
- Apply every business rule and metric definition in the context
- Use SQLite date functions such as date('now') and strftime
- Give computed columns clear aliases
- Add LIMIT 10 to list queries unless the question asks for more

OUTPUT FORMAT:
SQL: <the query>";

/// Why no statement came out of generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The completion call itself failed.
    Completion(String),
    /// The completion held no recognisable statement.
    NoStatement,
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Completion(e) => write!(f, "completion failed: {e}"),
            GenerationError::NoStatement => write!(f, "no SQL statement in completion"),
        }
    }
}

impl std::error::Error for GenerationError {}

pub struct SqlGenerator {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
}

impl SqlGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        context: &RetrievalContext,
    ) -> Result<String, GenerationError> {
        let prompt = format!(
            "CONTEXT:\n{}\n\nUSER QUESTION: {}\n\nWrite the SQL:",
            context.render(),
            question
        );
        let request = CompletionRequest::new(SYSTEM_PROMPT, prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.1);

        let raw = self
            .provider
            .complete(&request)
            .await
            .map_err(|e| GenerationError::Completion(e.to_string()))?;
        tracing::debug!(raw = %raw, "generator output");
        extract_sql(&raw).ok_or(GenerationError::NoStatement)
    }
}

/// Pull one statement out of model output.
///
/// Takes the first fenced block when present, drops a `SQL:` label and any
/// prose before the first `SELECT` or `WITH`, stops at the first blank line
/// after the statement starts and removes trailing semicolons.
pub fn extract_sql(raw: &str) -> Option<String> {
    let body = fenced_block(raw).unwrap_or(raw);

    let mut lines = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if strip_label(trimmed, "REFINED:").is_some() {
            continue;
        }
        lines.push(strip_label(trimmed, "SQL:").unwrap_or(line));
    }
    let joined = lines.join("\n");

    let start = find_statement_start(&joined)?;
    let statement = joined[start..]
        .split("\n\n")
        .next()
        .unwrap_or_default()
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    (!statement.is_empty()).then(|| statement.to_string())
}

/// Contents of the first ``` fenced block, language tag removed.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    let body_start = after.find('\n').map_or(after.len(), |i| i + 1);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

/// Byte offset of the first whole-word `SELECT` or `WITH`.
fn find_statement_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    (0..bytes.len()).find(|&i| {
        if i > 0 && is_word(bytes[i - 1]) {
            return false;
        }
        ["SELECT", "WITH"].iter().any(|kw| {
            let end = i + kw.len();
            end <= bytes.len()
                && bytes[i..end].eq_ignore_ascii_case(kw.as_bytes())
                && (end == bytes.len() || !is_word(bytes[end]))
        })
    })
}
