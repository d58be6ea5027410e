//! In-memory context index over schema and business knowledge.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::embedding::{Embedder, cosine};
use crate::error::{Error, Result};
use crate::knowledge::KnowledgeBase;
use crate::warehouse::{TableSchema, Warehouse};

/// Smallest and largest number of fragments a retrieval may return.
pub const MIN_K: usize = 1;
pub const MAX_K: usize = 8;

/// What a fragment describes. Ordering is the rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Table,
    Metric,
    Rule,
    Doc,
    Exemplar,
}

impl FragmentKind {
    pub fn section_title(self) -> &'static str {
        match self {
            FragmentKind::Table => "DATA DICTIONARY (Tables & Columns)",
            FragmentKind::Metric => "METRIC DEFINITIONS",
            FragmentKind::Rule => "BUSINESS RULES",
            FragmentKind::Doc => "DOCUMENTATION",
            FragmentKind::Exemplar => "EXAMPLE QUERIES",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FragmentKind::Table => "table",
            FragmentKind::Metric => "metric",
            FragmentKind::Rule => "rule",
            FragmentKind::Doc => "doc",
            FragmentKind::Exemplar => "exemplar",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub source_id: String,
    pub text: String,
}

impl Fragment {
    pub fn new(kind: FragmentKind, source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredFragment {
    #[serde(flatten)]
    pub fragment: Fragment,
    pub score: f32,
}

/// Fragments retrieved for one question, best match first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalContext {
    pub fragments: Vec<ScoredFragment>,
}

impl RetrievalContext {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Prompt text: fragments grouped under a title per kind.
    pub fn render(&self) -> String {
        if self.fragments.is_empty() {
            return "No relevant context found.".to_string();
        }

        let mut groups: BTreeMap<FragmentKind, Vec<&str>> = BTreeMap::new();
        for scored in &self.fragments {
            groups
                .entry(scored.fragment.kind)
                .or_default()
                .push(scored.fragment.text.as_str());
        }

        groups
            .into_iter()
            .map(|(kind, texts)| format!("=== {} ===\n{}", kind.section_title(), texts.join("\n\n")))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Immutable embedding index. Rebuild it to pick up schema or knowledge changes.
pub struct ContextIndex {
    entries: Vec<(Fragment, Vec<f32>)>,
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl ContextIndex {
    /// Embed `fragments` in one batch.
    pub async fn build(
        fragments: Vec<Fragment>,
        embedder: Arc<dyn Embedder>,
        timeout: Duration,
    ) -> Result<Self> {
        let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
        let vectors = tokio::time::timeout(timeout, embedder.embed(&texts))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        if vectors.len() != fragments.len() {
            return Err(Error::Embedding(format!(
                "embedder returned {} vectors for {} fragments",
                vectors.len(),
                fragments.len()
            )));
        }

        tracing::info!(
            fragments = fragments.len(),
            embedder = embedder.name(),
            "context index built"
        );
        Ok(Self {
            entries: fragments.into_iter().zip(vectors).collect(),
            embedder,
            timeout,
        })
    }

    /// Introspect the warehouse and combine it with curated knowledge.
    pub async fn from_sources(
        warehouse: &dyn Warehouse,
        knowledge: &KnowledgeBase,
        embedder: Arc<dyn Embedder>,
        timeout: Duration,
    ) -> Result<Self> {
        let tables = warehouse.tables().await?;
        Self::build(fragments_from(&tables, knowledge), embedder, timeout).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.entries.iter().map(|(fragment, _)| fragment)
    }

    /// Top `k` fragments by cosine similarity to `query`.
    ///
    /// `k` is clamped to `MIN_K..=MAX_K`. Equal scores keep insertion order.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalContext> {
        if self.entries.is_empty() {
            return Ok(RetrievalContext::default());
        }
        let k = k.clamp(MIN_K, MAX_K);

        let input = [query.to_string()];
        let vectors = tokio::time::timeout(self.timeout, self.embedder.embed(&input))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        let query_vec = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("embedder returned no vector".to_string()))?;

        Ok(self.rank(&query_vec, k))
    }

    fn rank(&self, query_vec: &[f32], k: usize) -> RetrievalContext {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (i, cosine(query_vec, v)))
            .collect();
        // sort_by is stable, so ties stay in insertion order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let fragments = scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredFragment {
                fragment: self.entries[i].0.clone(),
                score,
            })
            .collect();
        RetrievalContext { fragments }
    }
}

/// Fragments for introspected tables plus the knowledge base.
///
/// A curated table entry replaces the bare introspected description of the
/// same table. Curated entries for tables the warehouse lacks are skipped.
pub fn fragments_from(tables: &[TableSchema], knowledge: &KnowledgeBase) -> Vec<Fragment> {
    let mut out = Vec::with_capacity(tables.len() + knowledge.len());

    for table in tables {
        match knowledge.table(&table.name) {
            Some(entry) => out.push(Fragment::new(FragmentKind::Table, &entry.id, &entry.text)),
            None => out.push(Fragment::new(
                FragmentKind::Table,
                format!("schema_{}", table.name),
                table.describe(),
            )),
        }
    }
    for entry in &knowledge.tables {
        if !tables.iter().any(|t| t.name.eq_ignore_ascii_case(&entry.name)) {
            tracing::warn!(table = %entry.name, "knowledge describes a table the warehouse lacks, skipping");
        }
    }

    let curated = [
        (FragmentKind::Metric, &knowledge.metrics),
        (FragmentKind::Rule, &knowledge.rules),
        (FragmentKind::Doc, &knowledge.docs),
    ];
    for (kind, entries) in curated {
        out.extend(
            entries
                .iter()
                .map(|entry| Fragment::new(kind, &entry.id, &entry.text)),
        );
    }
    out.extend(
        knowledge
            .exemplars
            .iter()
            .map(|ex| Fragment::new(FragmentKind::Exemplar, &ex.id, ex.text())),
    );
    out
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
