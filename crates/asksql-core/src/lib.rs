//! asksql-core: conversational question answering over a SQL warehouse
//!
//! This crate turns natural-language business questions into read-only SQL,
//! runs it against the warehouse and explains the result. Conversations are
//! persisted so follow-up questions can refer to earlier turns.

pub mod config;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod generate;
pub mod index;
pub mod knowledge;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod refine;
pub mod schema;
pub mod seed;
pub mod sequencer;
pub mod store;
pub mod synthesize;
pub mod warehouse;

pub use config::Config;
pub use error::Error;
pub use error::Result;
pub use index::ContextIndex;
pub use llm::CompletionProvider;
pub use pipeline::{ChatResponse, Pipeline};
pub use store::SessionStore;
pub use warehouse::{SqliteWarehouse, Warehouse};

/// Application name used for config directories and paths.
pub const APP_NAME: &str = "asksql";

/// Returns the environment variable prefix for this application.
pub fn env_prefix() -> String {
    "ASKSQL".to_string()
}
