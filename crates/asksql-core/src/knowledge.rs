//! Curated business knowledge indexed next to the introspected schema.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BUILTIN: &str = include_str!("../knowledge/default.toml");

/// Data dictionary, metric definitions, business rules, documentation and
/// question-to-SQL exemplars.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBase {
    #[serde(default, rename = "table")]
    pub tables: Vec<KnowledgeEntry>,
    #[serde(default, rename = "metric")]
    pub metrics: Vec<KnowledgeEntry>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<KnowledgeEntry>,
    #[serde(default, rename = "doc")]
    pub docs: Vec<KnowledgeEntry>,
    #[serde(default, rename = "exemplar")]
    pub exemplars: Vec<Exemplar>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeEntry {
    pub id: String,
    pub name: String,
    pub text: String,
}

impl KnowledgeEntry {
    /// One-line description: the second line of the text, else its start.
    pub fn description(&self) -> String {
        let mut lines = self.text.lines().filter(|l| !l.trim().is_empty());
        let first = lines.next().unwrap_or_default();
        match lines.next() {
            Some(second) => second
                .trim()
                .trim_start_matches("Description:")
                .trim()
                .to_string(),
            None => first.chars().take(100).collect(),
        }
    }
}

/// A worked question with the SQL that answers it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exemplar {
    pub id: String,
    pub question: String,
    pub sql: String,
}

impl Exemplar {
    pub fn text(&self) -> String {
        format!("Question: {}\nSQL: {}", self.question, self.sql)
    }
}

impl KnowledgeBase {
    /// Knowledge shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN)
    }

    /// Load knowledge from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// The configured knowledge file when set, the built-in set otherwise.
    pub fn from_optional_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let kb: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse knowledge: {e}")))?;
        kb.validate()?;
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
            + self.metrics.len()
            + self.rules.len()
            + self.docs.len()
            + self.exemplars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a data dictionary entry by table name.
    pub fn table(&self, name: &str) -> Option<&KnowledgeEntry> {
        self.tables
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let ids = self
            .tables
            .iter()
            .chain(&self.metrics)
            .chain(&self.rules)
            .chain(&self.docs)
            .map(|e| e.id.as_str())
            .chain(self.exemplars.iter().map(|e| e.id.as_str()));
        for id in ids {
            if id.trim().is_empty() {
                return Err(Error::Config("knowledge entry with empty id".to_string()));
            }
            if !seen.insert(id) {
                return Err(Error::Config(format!("duplicate knowledge id '{id}'")));
            }
        }
        Ok(())
    }
}
