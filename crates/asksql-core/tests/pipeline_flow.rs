//! End-to-end pipeline tests against a scripted provider and a SQLite warehouse

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use asksql_core::embedding::HashingEmbedder;
use asksql_core::knowledge::KnowledgeBase;
use asksql_core::llm::ScriptedProvider;
use asksql_core::models::{Row, TurnRole, Value};
use asksql_core::pipeline::{ConversationRef, PipelineParts, StageFailure};
use asksql_core::store::ListConversationsOptions;
use asksql_core::{Config, ContextIndex, Error, Pipeline, SessionStore, SqliteWarehouse, Warehouse};
use asksql_core::{generate, refine, synthesize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use uuid::Uuid;

const Q4: &str = "What were total sales in Q4 2025?";
const Q3: &str = "What were total sales in Q3 2025?";
const Q4_SQL: &str = "SELECT SUM(amount) AS total_sales FROM sales WHERE status = 'COMPLETED' AND order_date BETWEEN '2025-10-01' AND '2025-12-31'";
const Q3_SQL: &str = "SELECT SUM(amount) AS total_sales FROM sales WHERE status = 'COMPLETED' AND order_date BETWEEN '2025-07-01' AND '2025-09-30'";

fn temp_path(kind: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("asksql-{kind}-test-{}.db", Uuid::new_v4()));
    path
}

async fn seed_warehouse(path: &Path) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("create warehouse");
    sqlx::raw_sql(
        r#"
        CREATE TABLE regions (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
        CREATE TABLE sales (
            id INTEGER PRIMARY KEY,
            region_id INTEGER NOT NULL REFERENCES regions(id),
            amount INTEGER NOT NULL,
            status TEXT NOT NULL,
            order_date TEXT NOT NULL
        );
        INSERT INTO regions VALUES (1, 'Dhaka'), (2, 'Chittagong');
        INSERT INTO sales VALUES
            (1, 1, 1000, 'COMPLETED', '2025-10-15'),
            (2, 2,  500, 'COMPLETED', '2025-12-02'),
            (3, 1,  999, 'CANCELLED', '2025-11-20'),
            (4, 1,  700, 'COMPLETED', '2025-08-09'),
            (5, 2,  300, 'COMPLETED', '2025-07-01');
        "#,
    )
    .execute(&pool)
    .await
    .expect("seed warehouse");
    pool.close().await;
}

async fn pipeline_with(provider: ScriptedProvider) -> (Pipeline, Arc<ScriptedProvider>) {
    let warehouse_path = temp_path("warehouse");
    seed_warehouse(&warehouse_path).await;

    let config = Config::default();
    let warehouse: Arc<dyn Warehouse> = Arc::new(
        SqliteWarehouse::open_path(&warehouse_path, Duration::from_secs(5))
            .await
            .expect("open warehouse"),
    );
    let knowledge = Arc::new(KnowledgeBase::builtin().expect("knowledge"));
    let index = ContextIndex::from_sources(
        warehouse.as_ref(),
        &knowledge,
        Arc::new(HashingEmbedder::new(256).expect("embedder")),
        Duration::from_secs(5),
    )
    .await
    .expect("index");
    let store = SessionStore::open(&temp_path("sessions"))
        .await
        .expect("open store");

    let provider = Arc::new(provider);
    let pipeline = Pipeline::new(
        PipelineParts {
            store: Arc::new(store),
            warehouse,
            index: Arc::new(index),
            knowledge,
            provider: provider.clone(),
        },
        &config,
    );
    (pipeline, provider)
}

fn total(value: i64) -> Vec<Row> {
    let mut row = Row::new();
    row.push("total_sales", Value::Int(value));
    vec![row]
}

fn sales_script() -> ScriptedProvider {
    ScriptedProvider::new()
        .when(refine::SYSTEM_PROMPT, "LATEST QUESTION: and in Q3?", format!("REFINED: {Q3}"))
        .when(generate::SYSTEM_PROMPT, format!("USER QUESTION: {Q4}"), format!("SQL: {Q4_SQL}"))
        .when(
            generate::SYSTEM_PROMPT,
            format!("USER QUESTION: {Q3}"),
            format!("```sql\n{Q3_SQL};\n```"),
        )
        .when(
            synthesize::SYSTEM_PROMPT,
            format!("QUESTION: {Q4}"),
            "Total sales in Q4 2025 were 1,500 BDT.",
        )
        .when(
            synthesize::SYSTEM_PROMPT,
            format!("QUESTION: {Q3}"),
            "Total sales in Q3 2025 were 1,000 BDT.",
        )
}

#[tokio::test]
async fn question_then_follow_up() {
    let (pipeline, provider) = pipeline_with(sales_script()).await;

    let first = pipeline.ask(Q4, None).await.expect("first answer");
    assert_eq!(first.refined_question, Q4);
    assert_eq!(first.sql.as_deref(), Some(Q4_SQL));
    assert_eq!(first.table, total(1500));
    assert_eq!(first.final_answer, "Total sales in Q4 2025 were 1,500 BDT.");

    let id = first.conversation_id.to_string();
    let second = pipeline
        .ask("and in Q3?", Some(&id))
        .await
        .expect("follow-up answer");
    assert_eq!(second.conversation_id, first.conversation_id);
    assert_eq!(second.refined_question, Q3);
    assert_eq!(second.sql.as_deref(), Some(Q3_SQL));
    assert_eq!(second.table, total(1000));
    assert_eq!(second.final_answer, "Total sales in Q3 2025 were 1,000 BDT.");

    // The refiner saw the first exchange.
    let refine_calls: Vec<_> = provider
        .calls()
        .into_iter()
        .filter(|c| c.system == refine::SYSTEM_PROMPT)
        .collect();
    assert_eq!(refine_calls.len(), 1);
    assert!(refine_calls[0].prompt.contains(&format!("User: {Q4}")));
    assert!(
        refine_calls[0]
            .prompt
            .contains("Assistant: Total sales in Q4 2025 were 1,500 BDT.")
    );

    let full = pipeline
        .store()
        .get_conversation_with_turns(first.conversation_id)
        .await
        .expect("conversation");
    assert_eq!(full.conversation.title, Q4);
    assert_eq!(full.conversation.turn_count, 4);
    let roles: Vec<TurnRole> = full.turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![TurnRole::User, TurnRole::Assistant, TurnRole::User, TurnRole::Assistant]
    );
    assert_eq!(full.turns[2].content, "and in Q3?");
    assert_eq!(full.turns[3].refined_question.as_deref(), Some(Q3));
    assert_eq!(
        full.turns[3].query.as_ref().map(|q| q.table.clone()),
        Some(total(1000))
    );
}

#[tokio::test]
async fn generator_receives_retrieved_context() {
    let (pipeline, provider) = pipeline_with(sales_script()).await;
    let answer = pipeline.ask_detailed(Q4, None).await.expect("answer");
    assert!(!answer.context.is_empty());
    assert!(answer.failures.is_empty(), "{:?}", answer.failures);

    let generate_call = provider
        .calls()
        .into_iter()
        .find(|c| c.system == generate::SYSTEM_PROMPT)
        .expect("generator called");
    assert!(generate_call.prompt.starts_with("CONTEXT:\n=== "));
    assert!((generate_call.temperature - 0.1).abs() < f32::EPSILON);
}

#[tokio::test]
async fn generation_failure_still_records_the_exchange() {
    let provider = ScriptedProvider::new().when(generate::SYSTEM_PROMPT, "USER QUESTION", "I am not sure.");
    let (pipeline, _) = pipeline_with(provider).await;

    let answer = pipeline.ask_detailed(Q4, None).await.expect("answer");
    assert!(answer.response.sql.is_none());
    assert!(answer.response.table.is_empty());
    assert!(answer.response.final_answer.contains("rephras"));
    assert!(
        answer
            .failures
            .iter()
            .any(|f| matches!(f, StageFailure::GenerationFailure(_)))
    );

    let turns = pipeline
        .store()
        .get_turns(answer.response.conversation_id)
        .await
        .expect("turns");
    assert_eq!(turns.len(), 2);
    assert!(turns[1].query.is_none());
    assert_eq!(turns[1].content, answer.response.final_answer);
}

#[tokio::test]
async fn unsafe_statement_is_rejected_and_not_run() {
    let provider = ScriptedProvider::new().when(
        generate::SYSTEM_PROMPT,
        "USER QUESTION",
        "SQL: SELECT * FROM sales; DROP TABLE sales",
    );
    let (pipeline, _) = pipeline_with(provider).await;

    let answer = pipeline.ask_detailed("Show all sales", None).await.expect("answer");
    assert!(answer.response.sql.is_none());
    assert!(answer.response.table.is_empty());
    assert!(
        answer
            .failures
            .iter()
            .any(|f| matches!(f, StageFailure::UnsafeStatementRejected(_)))
    );

    let still_there = pipeline
        .executor()
        .execute("SELECT COUNT(*) AS n FROM sales")
        .await
        .expect("sales table intact");
    assert_eq!(still_there.rows[0].get("n"), Some(&Value::Int(5)));
}

#[tokio::test]
async fn execution_error_keeps_the_statement() {
    let provider = ScriptedProvider::new().when(
        generate::SYSTEM_PROMPT,
        "USER QUESTION",
        "SQL: SELECT missing_column FROM sales",
    );
    let (pipeline, _) = pipeline_with(provider).await;

    let answer = pipeline.ask_detailed(Q4, None).await.expect("answer");
    assert_eq!(
        answer.response.sql.as_deref(),
        Some("SELECT missing_column FROM sales")
    );
    assert!(answer.response.table.is_empty());
    assert!(answer.response.final_answer.contains("no such column"));
    assert!(
        answer
            .failures
            .iter()
            .any(|f| matches!(f, StageFailure::ExecutionError(_)))
    );

    let turns = pipeline
        .store()
        .get_turns(answer.response.conversation_id)
        .await
        .expect("turns");
    let query = turns[1].query.as_ref().expect("sql recorded");
    assert_eq!(query.sql, "SELECT missing_column FROM sales");
    assert!(query.table.is_empty());
}

#[tokio::test]
async fn synthesis_failure_falls_back_to_template() {
    let provider = ScriptedProvider::new()
        .when(generate::SYSTEM_PROMPT, "USER QUESTION", format!("SQL: {Q4_SQL}"))
        .fail_on(synthesize::SYSTEM_PROMPT, 503);
    let (pipeline, _) = pipeline_with(provider).await;

    let answer = pipeline.ask_detailed(Q4, None).await.expect("answer");
    assert_eq!(answer.response.table, total(1500));
    assert_eq!(
        answer.response.final_answer,
        format!("The result for \"{Q4}\" is total_sales = 1500.")
    );
    assert!(
        answer
            .failures
            .iter()
            .any(|f| matches!(f, StageFailure::SynthesisDegraded(_)))
    );
}

#[tokio::test]
async fn refinement_failure_uses_raw_question() {
    let provider = sales_script();
    let (pipeline, _) = pipeline_with(provider).await;
    let first = pipeline.ask(Q4, None).await.expect("first");

    // No refiner rule matches this follow-up, so the scripted provider fails.
    let id = first.conversation_id.to_string();
    let answer = pipeline
        .ask_detailed("what about last year?", Some(&id))
        .await
        .expect("answer");
    assert_eq!(answer.response.refined_question, "what about last year?");
    assert!(
        answer
            .failures
            .iter()
            .any(|f| matches!(f, StageFailure::RefinementDegraded(_)))
    );
}

#[tokio::test]
async fn bad_requests_are_refused_without_side_effects() {
    let (pipeline, provider) = pipeline_with(sales_script()).await;

    let empty = pipeline.ask("   ", None).await;
    assert!(matches!(empty, Err(Error::InvalidInput(_))));

    let malformed = pipeline.ask(Q4, Some("not-a-uuid")).await;
    assert!(matches!(malformed, Err(Error::InvalidInput(_))));

    let unknown = Uuid::new_v4().to_string();
    let missing = pipeline.ask(Q4, Some(&unknown)).await;
    assert!(missing.expect_err("unknown id").is_not_found());

    assert_eq!(pipeline.store().count_conversations().await.expect("count"), 0);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn deleted_conversation_cannot_be_continued() {
    let (pipeline, _) = pipeline_with(sales_script()).await;
    let first = pipeline.ask(Q4, None).await.expect("first");

    pipeline
        .store()
        .delete_conversation(first.conversation_id)
        .await
        .expect("delete");

    let id = first.conversation_id.to_string();
    let err = pipeline.ask("and in Q3?", Some(&id)).await.expect_err("deleted");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn concurrent_requests_keep_exchanges_paired() {
    let provider = ScriptedProvider::new()
        .on(refine::SYSTEM_PROMPT, "REFINED: How many orders were there?")
        .on(generate::SYSTEM_PROMPT, "SQL: SELECT COUNT(*) AS orders FROM sales")
        .on(synthesize::SYSTEM_PROMPT, "There were 5 orders.")
        .with_delay(Duration::from_millis(5));
    let (pipeline, _) = pipeline_with(provider).await;

    let first = pipeline.ask("How many orders?", None).await.expect("first");
    let id = first.conversation_id.to_string();

    let asks = (0..4).map(|i| {
        let pipeline = &pipeline;
        let id = id.clone();
        async move {
            pipeline
                .ask(&format!("and again {i}?"), Some(&id))
                .await
        }
    });
    for result in futures::future::join_all(asks).await {
        let response = result.expect("answer");
        assert_eq!(response.final_answer, "There were 5 orders.");
    }

    let turns = pipeline
        .store()
        .get_turns(first.conversation_id)
        .await
        .expect("turns");
    assert_eq!(turns.len(), 10);
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role, TurnRole::User);
        assert_eq!(pair[1].role, TurnRole::Assistant);
    }
    // Exchanges land in the order the requests arrived.
    for i in 0..4 {
        assert_eq!(turns[2 + 2 * i].content, format!("and again {i}?"));
    }
}

#[tokio::test]
async fn abandoned_first_request_leaves_no_conversation() {
    let provider = ScriptedProvider::new()
        .on(generate::SYSTEM_PROMPT, "SQL: SELECT COUNT(*) AS orders FROM sales")
        .on(synthesize::SYSTEM_PROMPT, "There were 5 orders.")
        .with_delay(Duration::from_millis(200));
    let (pipeline, _) = pipeline_with(provider).await;

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), pipeline.ask("How many orders?", None))
            .await;
    assert!(cancelled.is_err(), "request should still be running");

    let sessions = pipeline
        .store()
        .list_conversations(ListConversationsOptions::default())
        .await
        .expect("list");
    assert!(sessions.is_empty(), "{sessions:?}");
}

#[tokio::test]
async fn conversation_appears_only_with_its_first_exchange() {
    let (pipeline, _) = pipeline_with(sales_script()).await;

    let fresh = pipeline.find_or_create(None).await.expect("fresh");
    assert!(matches!(fresh, ConversationRef::New(_)));
    assert_eq!(pipeline.store().count_conversations().await.expect("count"), 0);

    let first = pipeline.ask(Q4, None).await.expect("first");
    let id = first.conversation_id.to_string();
    let found = pipeline.find_or_create(Some(&id)).await.expect("found");
    assert_eq!(found, ConversationRef::Existing(first.conversation_id));

    let sessions = pipeline
        .store()
        .list_conversations(ListConversationsOptions::default())
        .await
        .expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].turn_count, 2);
    assert_eq!(sessions[0].title, Q4);
}
