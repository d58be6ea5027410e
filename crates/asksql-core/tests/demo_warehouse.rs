//! Demo warehouse tests - seeded data lines up with the built-in knowledge

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use asksql_core::embedding::HashingEmbedder;
use asksql_core::index::FragmentKind;
use asksql_core::knowledge::KnowledgeBase;
use asksql_core::models::Value;
use asksql_core::seed::{SeedOptions, SeedReport, seed_demo_warehouse};
use asksql_core::{ContextIndex, Error, SqliteWarehouse, Warehouse};
use chrono::NaiveDate;
use uuid::Uuid;

fn temp_warehouse_path() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("asksql-demo-{}", Uuid::new_v4()));
    path.push("warehouse.db");
    path
}

fn short_range(seed: u64) -> SeedOptions {
    SeedOptions {
        start: NaiveDate::from_ymd_opt(2025, 9, 1).expect("date"),
        end: NaiveDate::from_ymd_opt(2025, 12, 31).expect("date"),
        seed,
    }
}

async fn seeded(seed: u64) -> (PathBuf, SeedReport, SqliteWarehouse) {
    let path = temp_warehouse_path();
    let report = seed_demo_warehouse(&path, &short_range(seed))
        .await
        .expect("seed");
    let warehouse = SqliteWarehouse::open_path(&path, Duration::from_secs(5))
        .await
        .expect("open");
    (path, report, warehouse)
}

async fn scalar(warehouse: &SqliteWarehouse, sql: &str) -> Value {
    let table = warehouse.query(sql, 1).await.expect("query");
    table.rows[0]
        .get(&table.columns[0])
        .cloned()
        .expect("first column")
}

#[tokio::test]
async fn seeded_warehouse_backs_every_curated_table() {
    let (_, report, warehouse) = seeded(7).await;
    assert_eq!(report.regions, 5);
    assert_eq!(report.products, 10);
    assert_eq!(report.customers, 12);
    assert!(report.sales > 0);
    assert!(report.invoices > 0);
    assert!(report.expenses > 0);

    let knowledge = KnowledgeBase::builtin().expect("knowledge");
    let embedder = Arc::new(HashingEmbedder::new(256).expect("embedder"));
    let index = ContextIndex::from_sources(&warehouse, &knowledge, embedder, Duration::from_secs(5))
        .await
        .expect("index");

    let table_ids: Vec<&str> = index
        .fragments()
        .filter(|f| f.kind == FragmentKind::Table)
        .map(|f| f.source_id.as_str())
        .collect();
    for entry in &knowledge.tables {
        assert!(
            table_ids.contains(&entry.id.as_str()),
            "no fragment for curated table {}",
            entry.id
        );
    }
    // Every seeded table is described by curated knowledge.
    assert!(table_ids.iter().all(|id| !id.starts_with("schema_")));

    let context = index
        .retrieve("total sales last quarter", 4)
        .await
        .expect("retrieve");
    assert!(!context.fragments.is_empty());
}

#[tokio::test]
async fn seeded_rows_are_consistent() {
    let (_, report, warehouse) = seeded(7).await;

    let sales = scalar(&warehouse, "SELECT COUNT(*) FROM sales").await;
    assert_eq!(sales, Value::Int(i64::try_from(report.sales).expect("count")));

    let mismatched = scalar(
        &warehouse,
        "SELECT COUNT(*) FROM sales WHERE abs(amount - (quantity * unit_price - discount)) > 0.001",
    )
    .await;
    assert_eq!(mismatched, Value::Int(0));

    let out_of_range = scalar(
        &warehouse,
        "SELECT COUNT(*) FROM sales WHERE order_date < '2025-09-01' OR order_date > '2025-12-31'",
    )
    .await;
    assert_eq!(out_of_range, Value::Int(0));

    let orphan_invoices = scalar(
        &warehouse,
        r#"
        SELECT COUNT(*) FROM invoices i
        LEFT JOIN sales s ON s.id = i.sale_id
        WHERE s.id IS NULL OR s.status != 'COMPLETED'
        "#,
    )
    .await;
    assert_eq!(orphan_invoices, Value::Int(0));

    let overpaid = scalar(
        &warehouse,
        "SELECT COUNT(*) FROM invoices WHERE paid_amount > total_amount",
    )
    .await;
    assert_eq!(overpaid, Value::Int(0));
}

#[tokio::test]
async fn same_seed_produces_same_data() {
    let (_, first_report, first) = seeded(11).await;
    let (_, second_report, second) = seeded(11).await;
    assert_eq!(first_report, second_report);

    let total = "SELECT SUM(amount) FROM sales";
    assert_eq!(scalar(&first, total).await, scalar(&second, total).await);
}

#[tokio::test]
async fn existing_warehouse_is_left_alone() {
    let (path, report, warehouse) = seeded(3).await;
    warehouse.close().await;

    let err = seed_demo_warehouse(&path, &short_range(3))
        .await
        .expect_err("second seed");
    assert!(matches!(err, Error::InvalidInput(_)));

    let reopened = SqliteWarehouse::open_path(&path, Duration::from_secs(5))
        .await
        .expect("reopen");
    let sales = scalar(&reopened, "SELECT COUNT(*) FROM sales").await;
    assert_eq!(sales, Value::Int(i64::try_from(report.sales).expect("count")));
}

#[tokio::test]
async fn inverted_range_is_rejected_before_creating_a_file() {
    let path = temp_warehouse_path();
    let options = SeedOptions {
        start: NaiveDate::from_ymd_opt(2025, 12, 31).expect("date"),
        end: NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"),
        seed: 1,
    };
    let err = seed_demo_warehouse(&path, &options)
        .await
        .expect_err("inverted range");
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(!path.exists());
}
