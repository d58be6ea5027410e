//! Request orchestration: refine, retrieve, generate, execute, synthesize, persist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::embedder_from_config;
use crate::error::{Error, Result};
use crate::executor::{ExecutionFailure, QueryExecutor};
use crate::generate::SqlGenerator;
use crate::index::{ContextIndex, RetrievalContext};
use crate::knowledge::KnowledgeBase;
use crate::llm::{self, CompletionProvider};
use crate::models::{NewTurn, QueryRecord, ResultTable, Row};
use crate::refine::QuestionRefiner;
use crate::sequencer::Sequencer;
use crate::store::SessionStore;
use crate::synthesize::AnswerSynthesizer;
use crate::warehouse::{SqliteWarehouse, Warehouse};

/// Response to one chat request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub refined_question: String,
    pub sql: Option<String>,
    pub table: Vec<Row>,
    pub final_answer: String,
    pub conversation_id: Uuid,
}

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Refining,
    Retrieving,
    Generating,
    Executing,
    Synthesizing,
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Refining => "refining",
            Stage::Retrieving => "retrieving",
            Stage::Generating => "generating",
            Stage::Executing => "executing",
            Stage::Synthesizing => "synthesizing",
            Stage::Persisted => "persisted",
        };
        f.write_str(s)
    }
}

/// A stage that did not go to plan.
///
/// Degradations let the request continue with a fallback; the other variants
/// end the SQL path and the answer explains what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    RefinementDegraded(String),
    RetrievalEmpty(Option<String>),
    GenerationFailure(String),
    UnsafeStatementRejected(String),
    ExecutionError(String),
    SynthesisDegraded(String),
}

impl StageFailure {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageFailure::GenerationFailure(_)
                | StageFailure::UnsafeStatementRejected(_)
                | StageFailure::ExecutionError(_)
        )
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::RefinementDegraded(e) => write!(f, "refinement degraded: {e}"),
            StageFailure::RetrievalEmpty(None) => write!(f, "retrieval found no context"),
            StageFailure::RetrievalEmpty(Some(e)) => write!(f, "retrieval failed: {e}"),
            StageFailure::GenerationFailure(e) => write!(f, "generation failed: {e}"),
            StageFailure::UnsafeStatementRejected(e) => write!(f, "statement rejected: {e}"),
            StageFailure::ExecutionError(e) => write!(f, "execution failed: {e}"),
            StageFailure::SynthesisDegraded(e) => write!(f, "synthesis degraded: {e}"),
        }
    }
}

/// A response together with the stage failures met on the way.
#[derive(Debug, Clone)]
pub struct Answer {
    pub response: ChatResponse,
    pub context: RetrievalContext,
    pub failures: Vec<StageFailure>,
}

/// The conversation a request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationRef {
    /// Fresh id, not yet stored.
    New(Uuid),
    Existing(Uuid),
}

impl ConversationRef {
    /// Parse a client-supplied id without touching the store.
    pub fn parse(conversation_id: Option<&str>) -> Result<Self> {
        match conversation_id.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(ConversationRef::New(Uuid::new_v4())),
            Some(raw) => Uuid::parse_str(raw)
                .map(ConversationRef::Existing)
                .map_err(|_| Error::InvalidInput(format!("malformed conversation id '{raw}'"))),
        }
    }

    pub fn id(self) -> Uuid {
        match self {
            ConversationRef::New(id) | ConversationRef::Existing(id) => id,
        }
    }
}

/// Shared collaborators of a pipeline.
pub struct PipelineParts {
    pub store: Arc<SessionStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub index: Arc<ContextIndex>,
    pub knowledge: Arc<KnowledgeBase>,
    pub provider: Arc<dyn CompletionProvider>,
}

pub struct Pipeline {
    store: Arc<SessionStore>,
    index: Arc<ContextIndex>,
    knowledge: Arc<KnowledgeBase>,
    provider: Arc<dyn CompletionProvider>,
    executor: QueryExecutor,
    refiner: QuestionRefiner,
    generator: SqlGenerator,
    synthesizer: AnswerSynthesizer,
    sequencer: Sequencer,
    history_turns: usize,
    top_k: usize,
}

impl Pipeline {
    pub fn new(parts: PipelineParts, config: &Config) -> Self {
        let max_tokens = config.llm.max_tokens;
        Self {
            executor: QueryExecutor::new(parts.warehouse, config.warehouse.max_rows),
            refiner: QuestionRefiner::new(Arc::clone(&parts.provider), max_tokens),
            generator: SqlGenerator::new(Arc::clone(&parts.provider), max_tokens),
            synthesizer: AnswerSynthesizer::new(
                Arc::clone(&parts.provider),
                max_tokens,
                config.pipeline.synthesis_row_cap,
            ),
            store: parts.store,
            index: parts.index,
            knowledge: parts.knowledge,
            provider: parts.provider,
            sequencer: Sequencer::new(),
            history_turns: config.pipeline.history_turns,
            top_k: config.index.top_k,
        }
    }

    /// Open the store and warehouse, select the provider and build the index.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(SessionStore::open(&config.database).await?);
        let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::open(&config.warehouse).await?);
        let provider = llm::provider_from_config(&config.llm)?;
        let knowledge = Arc::new(KnowledgeBase::from_optional_path(
            config.index.knowledge_file.as_deref(),
        )?);
        let index = Arc::new(
            ContextIndex::from_sources(
                warehouse.as_ref(),
                &knowledge,
                embedder_from_config(&config.index)?,
                Duration::from_secs(config.index.timeout_secs),
            )
            .await?,
        );

        Ok(Self::new(
            PipelineParts {
                store,
                warehouse,
                index,
                knowledge,
                provider,
            },
            config,
        ))
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn index(&self) -> &ContextIndex {
        &self.index
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn provider(&self) -> &dyn CompletionProvider {
        self.provider.as_ref()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.executor.warehouse().as_ref()
    }

    /// Resolve the conversation a request belongs to.
    ///
    /// No id (or a blank one) starts a new conversation, which is only stored
    /// together with its first exchange. A malformed id is invalid input and
    /// an unknown one is not found; neither creates anything.
    pub async fn find_or_create(&self, conversation_id: Option<&str>) -> Result<ConversationRef> {
        self.verify(ConversationRef::parse(conversation_id)?).await
    }

    async fn verify(&self, conversation: ConversationRef) -> Result<ConversationRef> {
        if let ConversationRef::Existing(id) = conversation
            && !self.store.conversation_exists(id).await?
        {
            return Err(Error::NotFound(format!("conversation '{id}'")));
        }
        Ok(conversation)
    }

    /// Answer `question` within a conversation.
    pub async fn ask(&self, question: &str, conversation_id: Option<&str>) -> Result<ChatResponse> {
        Ok(self.ask_detailed(question, conversation_id).await?.response)
    }

    /// Like [`Pipeline::ask`], also reporting context and stage failures.
    pub async fn ask_detailed(
        &self,
        question: &str,
        conversation_id: Option<&str>,
    ) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::InvalidInput("question must not be empty".to_string()));
        }

        // The ticket is taken before the first await so it follows call order.
        let conversation = ConversationRef::parse(conversation_id)?;
        let id = conversation.id();
        let ticket = self.sequencer.ticket(id);
        let conversation = self.verify(conversation).await?;
        let mut failures = Vec::new();
        log_stage(id, Stage::Received);

        let history = match conversation {
            ConversationRef::Existing(_) => self.store.recent_turns(id, self.history_turns).await?,
            ConversationRef::New(_) => Vec::new(),
        };

        log_stage(id, Stage::Refining);
        let refinement = self.refiner.refine(question, &history).await;
        if let Some(reason) = refinement.degraded {
            degrade(id, &mut failures, StageFailure::RefinementDegraded(reason));
        }
        let refined = refinement.question;
        tracing::debug!(conversation_id = %id, refined = %refined, "refined question");

        log_stage(id, Stage::Retrieving);
        let context = match self.index.retrieve(&refined, self.top_k).await {
            Ok(ctx) if ctx.is_empty() => {
                degrade(id, &mut failures, StageFailure::RetrievalEmpty(None));
                ctx
            }
            Ok(ctx) => ctx,
            Err(e) => {
                degrade(id, &mut failures, StageFailure::RetrievalEmpty(Some(e.to_string())));
                RetrievalContext::default()
            }
        };

        let (answer, query) = self.answer(id, &refined, &context, &mut failures).await;

        let user = NewTurn::user(question);
        let assistant = NewTurn::assistant(answer.clone(), refined.clone(), query.clone());
        ticket.wait_turn().await;
        match conversation {
            ConversationRef::Existing(_) => {
                self.store.append_exchange(id, &user, &assistant).await?;
            }
            ConversationRef::New(_) => {
                self.store
                    .append_exchange_or_create(id, &user, &assistant)
                    .await?;
            }
        }
        drop(ticket);
        log_stage(id, Stage::Persisted);

        let (sql, table) = match query {
            Some(record) => (Some(record.sql), record.table),
            None => (None, Vec::new()),
        };
        Ok(Answer {
            response: ChatResponse {
                refined_question: refined,
                sql,
                table,
                final_answer: answer,
                conversation_id: id,
            },
            context,
            failures,
        })
    }

    /// Generate, execute and synthesize. Terminal failures become the answer.
    async fn answer(
        &self,
        id: Uuid,
        refined: &str,
        context: &RetrievalContext,
        failures: &mut Vec<StageFailure>,
    ) -> (String, Option<QueryRecord>) {
        log_stage(id, Stage::Generating);
        let sql = match self.generator.generate(refined, context).await {
            Ok(sql) => sql,
            Err(e) => {
                degrade(id, failures, StageFailure::GenerationFailure(e.to_string()));
                return (
                    "I couldn't turn that question into a database query. Please try rephrasing \
                     it, for example by naming the metric and the time period."
                        .to_string(),
                    None,
                );
            }
        };
        tracing::debug!(conversation_id = %id, sql = %sql, "generated sql");

        log_stage(id, Stage::Executing);
        let table = match self.executor.execute(&sql).await {
            Ok(table) => table,
            Err(ExecutionFailure::Rejected(rejection)) => {
                degrade(
                    id,
                    failures,
                    StageFailure::UnsafeStatementRejected(rejection.to_string()),
                );
                return (
                    format!(
                        "The generated query was not a single read-only SELECT statement, so it \
                         was not run ({rejection}). Please try rephrasing your question."
                    ),
                    None,
                );
            }
            Err(ExecutionFailure::Failed(text)) => {
                degrade(id, failures, StageFailure::ExecutionError(text.clone()));
                return (
                    format!(
                        "I encountered an error executing the query: {text}. Please try \
                         rephrasing your question."
                    ),
                    Some(QueryRecord {
                        sql,
                        table: Vec::new(),
                    }),
                );
            }
        };

        log_stage(id, Stage::Synthesizing);
        let synthesis = self.synthesizer.synthesize(refined, &table).await;
        if let Some(reason) = synthesis.degraded {
            degrade(id, failures, StageFailure::SynthesisDegraded(reason));
        }

        let ResultTable { rows, .. } = table;
        (synthesis.answer, Some(QueryRecord { sql, table: rows }))
    }
}

fn log_stage(id: Uuid, stage: Stage) {
    tracing::info!(conversation_id = %id, %stage, "pipeline stage");
}

fn degrade(id: Uuid, failures: &mut Vec<StageFailure>, failure: StageFailure) {
    tracing::warn!(
        conversation_id = %id,
        terminal = failure.is_terminal(),
        "{failure}"
    );
    failures.push(failure);
}
