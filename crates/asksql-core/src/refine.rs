//! Follow-up question rewriting.

use std::sync::Arc;

use crate::llm::{CompletionProvider, CompletionRequest};
use crate::models::{Turn, TurnRole};

pub const SYSTEM_PROMPT: &str = "You rewrite the latest question of a business analytics \
conversation into one self-contained question. Resolve pronouns, relative references and \
omitted subjects using the earlier turns. Keep the user's intent, metric and filters. Do not \
answer the question.

OUTPUT FORMAT (exactly one line):
REFINED: <the self-contained question>";

const TURN_CHARS: usize = 400;

/// A refined question and whether refinement fell back to the raw question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refinement {
    pub question: String,
    pub degraded: Option<String>,
}

impl Refinement {
    fn unchanged(question: &str) -> Self {
        Self {
            question: question.trim().to_string(),
            degraded: None,
        }
    }
}

pub struct QuestionRefiner {
    provider: Arc<dyn CompletionProvider>,
    max_tokens: u32,
}

impl QuestionRefiner {
    pub fn new(provider: Arc<dyn CompletionProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    /// Rewrite `question` using `history`. Never fails: on any problem the
    /// raw question comes back with `degraded` set.
    pub async fn refine(&self, question: &str, history: &[Turn]) -> Refinement {
        if history.is_empty() {
            return Refinement::unchanged(question);
        }

        let prompt = format!(
            "CONVERSATION SO FAR:\n{}\n\nLATEST QUESTION: {}\n\nRewrite the latest question:",
            render_history(history),
            question.trim()
        );
        let request = CompletionRequest::new(SYSTEM_PROMPT, prompt)
            .with_max_tokens(self.max_tokens.min(256))
            .with_temperature(0.1);

        match self.provider.complete(&request).await {
            Ok(raw) => match clean_refinement(&raw) {
                Some(refined) => Refinement {
                    question: refined,
                    degraded: None,
                },
                None => Refinement {
                    degraded: Some("refiner returned no question".to_string()),
                    ..Refinement::unchanged(question)
                },
            },
            Err(e) => Refinement {
                degraded: Some(e.to_string()),
                ..Refinement::unchanged(question)
            },
        }
    }
}

fn render_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            let mut line = format!("{speaker}: {}", clip(&turn.content, TURN_CHARS));
            if let Some(refined) = &turn.refined_question {
                line.push_str(&format!(" (question understood as: {refined})"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

/// First non-empty line without its `REFINED:` label or wrapping quotes.
pub fn clean_refinement(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = strip_label(line, "REFINED:").unwrap_or(line);
    let cleaned = line
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// `text` without a leading case-insensitive `label`, if it has one.
pub(crate) fn strip_label<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let head = text.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| &text[label.len()..])
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::llm::ScriptedProvider;

    fn turn(role: TurnRole, content: &str) -> Turn {
        Turn {
            idx: 0,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            refined_question: None,
            query: None,
        }
    }

    #[test]
    fn clean_refinement_strips_label_and_quotes() {
        assert_eq!(
            clean_refinement("REFINED: \"What were the total sales in Q3 2025?\"\nextra"),
            Some("What were the total sales in Q3 2025?".to_string())
        );
        assert_eq!(
            clean_refinement("\n\n  refined:  Sales by region  "),
            Some("Sales by region".to_string())
        );
        assert_eq!(clean_refinement("REFINED:  "), None);
        assert_eq!(clean_refinement(""), None);
    }

    #[test]
    fn strip_label_is_case_insensitive_and_char_safe() {
        assert_eq!(strip_label("sql: SELECT 1", "SQL:"), Some(" SELECT 1"));
        assert_eq!(strip_label("SEL", "SQL:"), None);
        assert_eq!(strip_label("বিক্রয়", "SQL:"), None);
    }

    #[tokio::test]
    async fn no_history_skips_the_provider() {
        let provider = Arc::new(ScriptedProvider::new());
        let refiner = QuestionRefiner::new(provider.clone(), 2000);
        let out = refiner.refine("  What were total sales in Q4 2025? ", &[]).await;
        assert_eq!(out.question, "What were total sales in Q4 2025?");
        assert!(out.degraded.is_none());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn follow_up_is_rewritten() {
        let provider = Arc::new(
            ScriptedProvider::new().on(SYSTEM_PROMPT, "REFINED: What were the total sales in Q3 2025?"),
        );
        let refiner = QuestionRefiner::new(provider.clone(), 2000);
        let history = vec![
            turn(TurnRole::User, "What were total sales in Q4 2025?"),
            turn(TurnRole::Assistant, "Total sales in Q4 2025 were 1,250,000 BDT."),
        ];
        let out = refiner.refine("and in Q3?", &history).await;
        assert_eq!(out.question, "What were the total sales in Q3 2025?");
        assert!(out.degraded.is_none());

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.contains("User: What were total sales in Q4 2025?"));
        assert!(calls[0].prompt.contains("LATEST QUESTION: and in Q3?"));
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_raw_question() {
        let provider = Arc::new(ScriptedProvider::new().fail_on(SYSTEM_PROMPT, 401));
        let refiner = QuestionRefiner::new(provider, 2000);
        let history = vec![turn(TurnRole::User, "What were total sales in Q4 2025?")];
        let out = refiner.refine("and in Q3?", &history).await;
        assert_eq!(out.question, "and in Q3?");
        assert!(out.degraded.is_some());
    }
}
