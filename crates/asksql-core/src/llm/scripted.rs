//! Deterministic completion provider for offline runs and tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::StatusCode;

use super::{CompletionError, CompletionProvider, CompletionRequest};

/// Canned reply for [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Fail with this HTTP status.
    Status(u16),
}

#[derive(Debug, Clone)]
enum Matcher {
    Anywhere(String),
    Both { system: String, prompt: String },
}

impl Matcher {
    fn matches(&self, request: &CompletionRequest) -> bool {
        match self {
            Matcher::Anywhere(needle) => {
                request.system.contains(needle.as_str()) || request.prompt.contains(needle.as_str())
            }
            Matcher::Both { system, prompt } => {
                request.system.contains(system.as_str()) && request.prompt.contains(prompt.as_str())
            }
        }
    }
}

/// Deterministic provider that answers from a list of rules.
///
/// Rules are tried in insertion order and the first match wins. Used for
/// offline runs and tests.
pub struct ScriptedProvider {
    rules: Vec<(Matcher, ScriptedReply)>,
    fallback: ScriptedReply,
    delay: Duration,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: ScriptedReply::Status(503),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `text` when `needle` appears in the system or user prompt.
    #[must_use]
    pub fn on(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push((
            Matcher::Anywhere(needle.into()),
            ScriptedReply::Text(text.into()),
        ));
        self
    }

    /// Reply with `text` when the system prompt contains `system` and the user
    /// prompt contains `prompt`.
    #[must_use]
    pub fn when(
        mut self,
        system: impl Into<String>,
        prompt: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.rules.push((
            Matcher::Both {
                system: system.into(),
                prompt: prompt.into(),
            },
            ScriptedReply::Text(text.into()),
        ));
        self
    }

    /// Fail with `status` when `needle` appears in the system or user prompt.
    #[must_use]
    pub fn fail_on(mut self, needle: impl Into<String>, status: u16) -> Self {
        self.rules
            .push((Matcher::Anywhere(needle.into()), ScriptedReply::Status(status)));
        self
    }

    /// Reply used when no rule matches.
    #[must_use]
    pub fn otherwise(mut self, reply: ScriptedReply) -> Self {
        self.fallback = reply;
        self
    }

    /// Sleep before every reply.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far, in arrival order.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reply_for(&self, request: &CompletionRequest) -> &ScriptedReply {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(request))
            .map_or(&self.fallback, |(_, reply)| reply)
    }
}

impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, std::result::Result<String, CompletionError>> {
        async move {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.reply_for(request) {
                ScriptedReply::Text(text) => Ok(text.clone()),
                ScriptedReply::Status(status) => Err(CompletionError::Status {
                    status: *status,
                    body: StatusCode::from_u16(*status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("scripted failure")
                        .to_string(),
                }),
            }
        }
        .boxed()
    }
}

