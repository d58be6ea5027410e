//! asksql CLI - ask business questions of a SQL warehouse

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use asksql_core::embedding::embedder_from_config;
use asksql_core::index::FragmentKind;
use asksql_core::knowledge::KnowledgeBase;
use asksql_core::seed::{SeedOptions, seed_demo_warehouse};
use asksql_core::store::ListConversationsOptions;
use asksql_core::{Config, ContextIndex, Pipeline, SessionStore, SqliteWarehouse};

mod pretty;

#[derive(Debug, Parser)]
#[command(
    name = "asksql",
    author,
    version,
    about = "Ask business questions of a SQL warehouse",
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask a question; without one, start an interactive session
    Ask {
        /// The question
        question: Vec<String>,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Print the retrieved context
        #[arg(long)]
        show_context: bool,

        /// Print the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent conversations
    History {
        /// Only conversations active in the last N days
        #[arg(short, long)]
        days: Option<i64>,

        /// Maximum results
        #[arg(short, long, default_value = "50")]
        limit: i64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a conversation
    Show {
        /// Conversation ID
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a conversation
    Delete {
        /// Conversation ID
        id: String,
    },

    /// Rename a conversation
    Rename {
        /// Conversation ID
        id: String,

        /// New title
        title: Vec<String>,
    },

    /// Inspect the context index
    Index {
        /// Retrieve fragments for this text instead of listing all
        #[arg(short, long)]
        query: Option<String>,

        /// Fragments to retrieve
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Create the demo warehouse described by the built-in knowledge
    Seed {
        /// Where to create it (defaults to the configured warehouse path)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,

        /// First order date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// RNG seed; the same seed gives the same data
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with secrets hidden
    Show,

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stage logs go to stderr so answers stay clean on stdout.
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(Config::default_config_path);
    let config = Config::ensure_at(&config_path)?;

    match cli.command {
        Command::Ask {
            question,
            conversation,
            show_context,
            json,
        } => cmd_ask(&config, &question.join(" "), conversation, show_context, json).await,
        Command::History { days, limit, json } => cmd_history(&config, days, limit, json).await,
        Command::Show { id, json } => cmd_show(&config, &id, json).await,
        Command::Delete { id } => cmd_delete(&config, &id).await,
        Command::Rename { id, title } => cmd_rename(&config, &id, &title.join(" ")).await,
        Command::Index { query, k } => cmd_index(&config, query, k).await,
        Command::Seed {
            path,
            force,
            start,
            seed,
        } => cmd_seed(&config, path, force, start, seed).await,
        Command::Config { command } => cmd_config(&config, &config_path, command),
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("malformed conversation id '{id}'"))
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        bar.set_style(style);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

async fn cmd_ask(
    config: &Config,
    question: &str,
    conversation: Option<String>,
    show_context: bool,
    json: bool,
) -> Result<()> {
    let pipeline = Pipeline::from_config(config).await?;

    if !question.trim().is_empty() {
        ask_once(&pipeline, question, conversation.as_deref(), show_context, json).await?;
        return Ok(());
    }

    println!("Ask a question (empty line to quit).");
    let mut conversation = conversation;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            break;
        }
        match ask_once(&pipeline, &line, conversation.as_deref(), show_context, json).await {
            Ok(id) => conversation = Some(id.to_string()),
            Err(err) => eprintln!("Error: {err}"),
        }
        println!();
    }
    Ok(())
}

async fn ask_once(
    pipeline: &Pipeline,
    question: &str,
    conversation: Option<&str>,
    show_context: bool,
    json: bool,
) -> Result<Uuid> {
    let bar = spinner("Thinking...");
    let answer = pipeline.ask_detailed(question, conversation).await;
    bar.finish_and_clear();
    let answer = answer?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer.response)?);
    } else {
        if show_context {
            pretty::print_fragments(&answer.context.fragments);
            println!();
        }
        pretty::print_answer(question, &answer.response);
    }
    for failure in &answer.failures {
        tracing::debug!("{failure}");
    }
    Ok(answer.response.conversation_id)
}

async fn cmd_history(config: &Config, days: Option<i64>, limit: i64, json: bool) -> Result<()> {
    let store = SessionStore::open(&config.database).await?;
    let since = match days {
        Some(d) if d < 1 => anyhow::bail!("--days must be at least 1"),
        Some(d) => Some(Utc::now() - chrono::Duration::days(d)),
        None => None,
    };
    let sessions = store
        .list_conversations(ListConversationsOptions {
            since,
            limit: Some(limit),
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        pretty::print_sessions(&sessions);
    }
    Ok(())
}

async fn cmd_show(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = SessionStore::open(&config.database).await?;
    let conversation = store.get_conversation_with_turns(parse_id(id)?).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversation)?);
    } else {
        pretty::print_conversation(&conversation);
    }
    Ok(())
}

async fn cmd_delete(config: &Config, id: &str) -> Result<()> {
    let store = SessionStore::open(&config.database).await?;
    let id = parse_id(id)?;
    store.delete_conversation(id).await?;
    println!("Deleted conversation: {id}");
    Ok(())
}

async fn cmd_rename(config: &Config, id: &str, title: &str) -> Result<()> {
    let store = SessionStore::open(&config.database).await?;
    let id = parse_id(id)?;
    store.rename_conversation(id, title).await?;
    println!("Renamed conversation: {id}");
    Ok(())
}

async fn cmd_index(config: &Config, query: Option<String>, k: Option<usize>) -> Result<()> {
    let warehouse = SqliteWarehouse::open(&config.warehouse).await?;
    let knowledge = KnowledgeBase::from_optional_path(config.index.knowledge_file.as_deref())?;
    let index = ContextIndex::from_sources(
        &warehouse,
        &knowledge,
        embedder_from_config(&config.index)?,
        Duration::from_secs(config.index.timeout_secs),
    )
    .await?;

    if let Some(query) = query {
        let context = index
            .retrieve(&query, k.unwrap_or(config.index.top_k))
            .await?;
        pretty::print_fragments(&context.fragments);
        return Ok(());
    }

    println!("Context index: {} fragments", index.len());
    for kind in [
        FragmentKind::Table,
        FragmentKind::Metric,
        FragmentKind::Rule,
        FragmentKind::Doc,
        FragmentKind::Exemplar,
    ] {
        let ids: Vec<&str> = index
            .fragments()
            .filter(|f| f.kind == kind)
            .map(|f| f.source_id.as_str())
            .collect();
        if ids.is_empty() {
            continue;
        }
        println!();
        println!("{} ({})", kind.section_title(), ids.len());
        for id in ids {
            println!("  {id}");
        }
    }
    Ok(())
}

async fn cmd_seed(
    config: &Config,
    path: Option<PathBuf>,
    force: bool,
    start: Option<NaiveDate>,
    seed: u64,
) -> Result<()> {
    let path = path.unwrap_or_else(|| config.warehouse.path.clone());
    if force && path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }

    let mut options = SeedOptions {
        seed,
        ..SeedOptions::default()
    };
    if let Some(start) = start {
        options.start = start;
    }

    let progress = spinner("Seeding demo warehouse...");
    let report = seed_demo_warehouse(&path, &options).await;
    progress.finish_and_clear();
    let report = report?;

    println!("Created {}", path.display());
    println!("  regions:   {}", report.regions);
    println!("  products:  {}", report.products);
    println!("  customers: {}", report.customers);
    println!("  sales:     {}", report.sales);
    println!("  invoices:  {}", report.invoices);
    println!("  expenses:  {}", report.expenses);
    Ok(())
}

fn cmd_config(
    config: &Config,
    config_path: &std::path::Path,
    command: Option<ConfigCommand>,
) -> Result<()> {
    match command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Path => println!("{}", config_path.display()),
        ConfigCommand::Show => {
            let redacted = redact(config.clone());
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&redacted)?);
        }
    }
    Ok(())
}

fn redact(mut config: Config) -> Config {
    let hidden = || Some("********".to_string());
    if config.llm.api_key.is_some() {
        config.llm.api_key = hidden();
    }
    if config.index.embedding_api_key.is_some() {
        config.index.embedding_api_key = hidden();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_secrets_only() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-secret".to_string());
        let redacted = redact(config);
        assert_eq!(redacted.llm.api_key.as_deref(), Some("********"));
        assert!(redacted.index.embedding_api_key.is_none());
        assert_eq!(redacted.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn ask_accepts_multi_word_question() {
        let cli = Cli::parse_from(["asksql", "ask", "total", "sales", "-c", "abc"]);
        match cli.command {
            Command::Ask {
                question,
                conversation,
                ..
            } => {
                assert_eq!(question.join(" "), "total sales");
                assert_eq!(conversation.as_deref(), Some("abc"));
            }
            other => unreachable!("parsed {other:?}"),
        }
    }

    #[test]
    fn seed_takes_path_and_start() {
        let cli = Cli::parse_from([
            "asksql",
            "seed",
            "--path",
            "/tmp/demo.db",
            "--start",
            "2025-01-01",
        ]);
        match cli.command {
            Command::Seed {
                path,
                force,
                start,
                seed,
            } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/demo.db")));
                assert!(!force);
                assert_eq!(start, NaiveDate::from_ymd_opt(2025, 1, 1));
                assert_eq!(seed, 42);
            }
            other => unreachable!("parsed {other:?}"),
        }
    }

    #[test]
    fn malformed_id_is_an_error() {
        assert!(parse_id("nope").is_err());
        assert!(parse_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
