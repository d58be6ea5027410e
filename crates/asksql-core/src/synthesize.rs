//! Natural-language answers from query results.

use std::sync::Arc;

use crate::llm::{CompletionProvider, CompletionRequest};
use crate::models::ResultTable;

pub const SYSTEM_PROMPT: &str = "You are a business analyst assistant. Answer the question \
from the query result in clear, professional language.

Guidelines:
- Use the exact numbers from the result
- Format large numbers with separators and use BDT as the currency unit
- Be concise; point out top performers or trends when the data shows them
- If the result is empty, say that no matching data was found
- Do not show SQL or technical details";

const COLUMN_CAP: usize = 12;
const CELL_CHARS: usize = 80;

/// An answer and whether it came from the fallback template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub answer: String,
    pub degraded: Option<String>,
}

pub struct AnswerSynthesizer {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
    row_cap: usize,
}

impl AnswerSynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32, row_cap: usize) -> Self {
        Self {
            provider,
            max_tokens,
            row_cap: row_cap.max(1),
        }
    }

    pub async fn synthesize(&self, question: &str, table: &ResultTable) -> Synthesis {
        let prompt = format!(
            "QUESTION: {question}\n\nRESULT:\n{}\n\nWrite the answer:",
            render_table(table, self.row_cap)
        );
        let request = CompletionRequest::new(SYSTEM_PROMPT, prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.4);

        match self.provider.complete(&request).await {
            Ok(answer) if !answer.trim().is_empty() => Synthesis {
                answer: answer.trim().to_string(),
                degraded: None,
            },
            Ok(_) => Synthesis {
                answer: fallback_answer(question, table),
                degraded: Some("synthesizer returned no text".to_string()),
            },
            Err(e) => Synthesis {
                answer: fallback_answer(question, table),
                degraded: Some(e.to_string()),
            },
        }
    }
}

/// Pipe-separated rendering of at most `row_cap` rows and a bounded column count.
pub fn render_table(table: &ResultTable, row_cap: usize) -> String {
    if table.rows.is_empty() {
        return "(no rows)".to_string();
    }

    let columns: Vec<&str> = if table.columns.is_empty() {
        table.rows[0].columns().collect()
    } else {
        table.columns.iter().map(String::as_str).collect()
    };
    let shown_columns = &columns[..columns.len().min(COLUMN_CAP)];

    let mut out = shown_columns.join(" | ");
    for row in table.rows.iter().take(row_cap) {
        let cells: Vec<String> = shown_columns
            .iter()
            .map(|col| {
                row.get(col)
                    .map(|v| clip(&v.to_string()))
                    .unwrap_or_default()
            })
            .collect();
        out.push('\n');
        out.push_str(&cells.join(" | "));
    }

    let mut notes = Vec::new();
    if table.rows.len() > row_cap {
        notes.push(format!(
            "showing {row_cap} of {} rows",
            table.rows.len()
        ));
    }
    if columns.len() > shown_columns.len() {
        notes.push(format!(
            "showing {} of {} columns",
            shown_columns.len(),
            columns.len()
        ));
    }
    if table.truncated {
        notes.push("the query returned more rows than the row limit allows".to_string());
    }
    if !notes.is_empty() {
        out.push_str(&format!("\n({})", notes.join("; ")));
    }
    out
}

fn clip(cell: &str) -> String {
    if cell.chars().count() > CELL_CHARS {
        format!("{}...", cell.chars().take(CELL_CHARS).collect::<String>())
    } else {
        cell.to_string()
    }
}

/// Templated answer used when the synthesizer is unavailable.
pub fn fallback_answer(question: &str, table: &ResultTable) -> String {
    if let Some(value) = table.scalar() {
        let column = table
            .rows
            .first()
            .and_then(|row| row.columns().next())
            .unwrap_or("value");
        if value.is_null() {
            return format!("The query for \"{question}\" returned no value for {column}.");
        }
        return format!("The result for \"{question}\" is {column} = {value}.");
    }

    match table.row_count() {
        0 => format!("No matching data was found for \"{question}\"."),
        1 => format!("The query for \"{question}\" returned 1 row; see the table for details."),
        n => {
            let more = if table.truncated { " (limited)" } else { "" };
            format!("The query for \"{question}\" returned {n} rows{more}; see the table for details.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use crate::models::{Row, Value};

    fn table(rows: usize) -> ResultTable {
        ResultTable {
            columns: vec!["region".to_string(), "total_sales".to_string()],
            rows: (0..rows)
                .map(|i| {
                    let mut row = Row::new();
                    row.push("region", Value::Text(format!("R{i}")));
                    row.push("total_sales", Value::Int(i64::try_from(i).unwrap_or(0) * 100));
                    row
                })
                .collect(),
            truncated: false,
        }
    }

    fn scalar(value: Value) -> ResultTable {
        let mut row = Row::new();
        row.push("total_sales", value);
        ResultTable {
            columns: vec!["total_sales".to_string()],
            rows: vec![row],
            truncated: false,
        }
    }

    #[test]
    fn render_caps_rows_and_notes_it() {
        let rendered = render_table(&table(30), 20);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "region | total_sales");
        assert_eq!(lines[1], "R0 | 0");
        assert_eq!(lines.len(), 1 + 20 + 1);
        assert_eq!(lines[21], "(showing 20 of 30 rows)");
    }

    #[test]
    fn render_notes_executor_truncation() {
        let mut t = table(2);
        t.truncated = true;
        assert!(render_table(&t, 20).ends_with("(the query returned more rows than the row limit allows)"));
    }

    #[test]
    fn render_empty_result() {
        assert_eq!(render_table(&ResultTable::default(), 20), "(no rows)");
    }

    #[test]
    fn fallback_states_single_value() {
        let answer = fallback_answer("What were total sales in Q4 2025?", &scalar(Value::Float(1250.5)));
        assert_eq!(
            answer,
            "The result for \"What were total sales in Q4 2025?\" is total_sales = 1250.5."
        );
    }

    #[test]
    fn fallback_describes_row_count() {
        assert!(fallback_answer("q", &table(0)).starts_with("No matching data"));
        assert!(fallback_answer("q", &table(5)).contains("returned 5 rows"));
        assert!(fallback_answer("q", &scalar(Value::Null)).contains("no value"));
    }

    #[tokio::test]
    async fn answer_comes_from_provider() {
        let provider = Arc::new(
            ScriptedProvider::new().on(SYSTEM_PROMPT, "Total sales in Q4 2025 were 1,250.5 BDT."),
        );
        let synthesizer = AnswerSynthesizer::new(provider.clone(), 2000, 20);
        let out = synthesizer
            .synthesize("What were total sales in Q4 2025?", &scalar(Value::Float(1250.5)))
            .await;
        assert_eq!(out.answer, "Total sales in Q4 2025 were 1,250.5 BDT.");
        assert!(out.degraded.is_none());

        let calls = provider.calls();
        assert!(calls[0].prompt.contains("total_sales\n1250.5"));
        assert!((calls[0].temperature - 0.4).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn provider_failure_uses_fallback() {
        let provider = Arc::new(ScriptedProvider::new().fail_on(SYSTEM_PROMPT, 500));
        let synthesizer = AnswerSynthesizer::new(provider, 2000, 20);
        let out = synthesizer.synthesize("q", &table(3)).await;
        assert!(out.answer.contains("returned 3 rows"));
        assert!(out.degraded.is_some());
    }
}
