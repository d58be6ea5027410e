//! Read-only access to the analytics warehouse.

use std::path::Path;
use std::time::Duration;

use futures::TryStreamExt;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow, SqliteValueRef};
use sqlx::{Column as _, Decode, Row as _, Sqlite, SqlitePool, TypeInfo as _, ValueRef as _};

use crate::config::WarehouseConfig;
use crate::error::{Error, Result};
use crate::models::{ResultTable, Row, Value};

/// Column metadata from introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Table metadata from introspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    /// Plain-text rendering used as a retrieval fragment.
    pub fn describe(&self) -> String {
        let mut out = format!("Table: {}\nColumns:", self.name);
        for col in &self.columns {
            out.push_str(&format!("\n- {} ({})", col.name, col.data_type));
            if col.primary_key {
                out.push_str(" primary key");
            } else if !col.nullable {
                out.push_str(" not null");
            }
        }
        out
    }
}

/// One page of a table's rows.
#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub data: Vec<Row>,
    pub total: i64,
    pub limit: u32,
    pub offset: u32,
}

/// Capability: run one read-only statement and return its rows.
pub trait Warehouse: Send + Sync {
    /// Tables and their columns.
    fn tables(&self) -> BoxFuture<'_, Result<Vec<TableSchema>>>;

    /// Execute `sql`, returning at most `max_rows` rows.
    ///
    /// Fails with [`Error::Database`] for engine errors and [`Error::Timeout`]
    /// when the statement outlives the configured timeout.
    fn query<'a>(&'a self, sql: &'a str, max_rows: usize) -> BoxFuture<'a, Result<ResultTable>>;

    /// A page of rows from an introspected table.
    fn table_page<'a>(
        &'a self,
        table: &'a str,
        limit: u32,
        offset: u32,
    ) -> BoxFuture<'a, Result<TablePage>>;
}

/// SQLite file opened read-only.
pub struct SqliteWarehouse {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqliteWarehouse {
    pub async fn open(config: &WarehouseConfig) -> Result<Self> {
        Self::open_path(&config.path, Duration::from_secs(config.timeout_secs)).await
    }

    pub async fn open_path(path: &Path, timeout: Duration) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "warehouse database '{}'",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!(path = %path.display(), "opened warehouse read-only");
        Ok(Self {
            pool,
            timeout,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn introspect(&self) -> Result<Vec<TableSchema>> {
        let names: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM sqlite_master
            WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            let rows = sqlx::query(
                r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?) ORDER BY cid"#,
            )
            .bind(&name)
            .fetch_all(&self.pool)
            .await?;

            let columns = rows
                .iter()
                .map(|row| ColumnInfo {
                    name: row.get("name"),
                    data_type: row.get("type"),
                    nullable: row.get::<i64, _>("notnull") == 0,
                    primary_key: row.get::<i64, _>("pk") > 0,
                })
                .collect();
            tables.push(TableSchema { name, columns });
        }
        Ok(tables)
    }

    async fn run(&self, sql: &str, max_rows: usize) -> Result<ResultTable> {
        let collect = async {
            let mut stream = sqlx::query(sql).fetch(&self.pool);
            let mut table = ResultTable::default();
            while let Some(row) = stream.try_next().await? {
                if table.rows.len() == max_rows {
                    table.truncated = true;
                    break;
                }
                if table.columns.is_empty() {
                    table.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                table.rows.push(decode_row(&row)?);
            }
            Ok::<_, Error>(table)
        };

        tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn page(&self, table: &str, limit: u32, offset: u32) -> Result<TablePage> {
        let schema = self
            .introspect()
            .await?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(table))
            .ok_or_else(|| Error::InvalidInput(format!("unknown table '{table}'")))?;
        let quoted = quote_ident(&schema.name);

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {quoted}"))
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!("SELECT * FROM {quoted} LIMIT ? OFFSET ?"))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;
        let data = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;

        Ok(TablePage {
            table: schema.name,
            columns: schema.columns,
            data,
            total,
            limit,
            offset,
        })
    }
}

impl Warehouse for SqliteWarehouse {
    fn tables(&self) -> BoxFuture<'_, Result<Vec<TableSchema>>> {
        self.introspect().boxed()
    }

    fn query<'a>(&'a self, sql: &'a str, max_rows: usize) -> BoxFuture<'a, Result<ResultTable>> {
        self.run(sql, max_rows).boxed()
    }

    fn table_page<'a>(
        &'a self,
        table: &'a str,
        limit: u32,
        offset: u32,
    ) -> BoxFuture<'a, Result<TablePage>> {
        self.page(table, limit, offset).boxed()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        out.push(column.name(), decode_value(raw)?);
    }
    Ok(out)
}

/// Decode by the value's storage class, not the declared column type.
fn decode_value(raw: SqliteValueRef<'_>) -> Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(decode::<bool>(raw)?),
        "INTEGER" | "INT" | "BIGINT" | "INT8" => Value::Int(decode::<i64>(raw)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Float(decode::<f64>(raw)?),
        "BLOB" => Value::Text(format!("<{} bytes>", decode::<Vec<u8>>(raw)?.len())),
        _ => Value::Text(decode::<String>(raw)?),
    };
    Ok(value)
}

fn decode<'r, T: Decode<'r, Sqlite>>(raw: SqliteValueRef<'r>) -> Result<T> {
    T::decode(raw).map_err(|e| Error::Other(format!("failed to decode value: {e}")))
}
