//! Postgres storage backend
//!
//! Table metadata (column order, column types, primary keys) is read once
//! from `information_schema` on first use and memoized for the life of the
//! handle. Upserts are generated as `INSERT ... ON CONFLICT ... DO UPDATE`
//! statements with every value bound as text and cast server-side to the
//! column's declared type, so records never need client-side type mapping.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Mutex;

use freighter_common::Record;

use super::{spawn_tx, Storage, StorageError, StorageKind, StorageSession, Tx, TxSession};

/// Rows per generated INSERT statement
const UPSERT_BATCH_SIZE: usize = 1_000;

/// One column of a user table, in declared order
#[derive(Debug, Clone)]
struct Column {
    name: String,
    /// Postgres `udt_name`, used as a server-side cast target
    data_type: String,
}

/// Memoized shape of one user table
#[derive(Debug, Clone)]
struct TableMetadata {
    columns: Vec<Column>,
    primary_keys: Vec<String>,
}

/// Postgres-backed [`Storage`]
pub struct PostgresStorage {
    pool: PgPool,
    catalog: Arc<Mutex<Option<HashMap<String, TableMetadata>>>>,
}

impl PostgresStorage {
    /// Connect to a Postgres database.
    pub async fn connect(conn: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(conn)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            catalog: Arc::new(Mutex::new(None)),
        }
    }

    /// Table metadata, loading the whole public-schema catalog on first
    /// use.
    async fn metadata(&self, table: &str) -> Result<TableMetadata, StorageError> {
        let mut catalog = self.catalog.lock().await;

        if catalog.is_none() {
            *catalog = Some(load_catalog(&self.pool).await?);
        }

        catalog
            .as_ref()
            .and_then(|tables| tables.get(table))
            .cloned()
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Postgres
    }

    #[tracing::instrument(skip(self))]
    async fn truncate(&self, tables: &[String]) -> Result<(), StorageError> {
        for table in tables {
            // Validate against the catalog so table names never reach the
            // SQL text unchecked.
            let _ = self.metadata(table).await?;

            let sql = format!("TRUNCATE TABLE {}", quote_ident(table));
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn start_tx(&self) -> Result<Tx, StorageError> {
        let tx = self.pool.begin().await?;

        Ok(spawn_tx(PgSession {
            storage: PostgresStorage {
                pool: self.pool.clone(),
                catalog: Arc::clone(&self.catalog),
            },
            tx,
        }))
    }
}

/// One open Postgres transaction owned by an executor task
struct PgSession {
    storage: PostgresStorage,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageSession for PgSession {
    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    async fn upsert(&mut self, table: &str, records: &[Record]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let meta = self.storage.metadata(table).await?;

        for statement in plan_upserts(table, &meta, records) {
            let mut query = sqlx::query(&statement.sql);
            for arg in statement.args {
                query = query.bind(arg);
            }

            query.execute(&mut *self.tx).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl TxSession for PgSession {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Load column order, types, and primary keys for every public-schema
/// table.
async fn load_catalog(pool: &PgPool) -> Result<HashMap<String, TableMetadata>, StorageError> {
    const CATALOG_SQL: &str = r"
        SELECT c.table_name,
               c.column_name,
               c.udt_name,
               kcu.column_name IS NOT NULL AS is_primary_key
        FROM information_schema.columns c
        LEFT JOIN information_schema.table_constraints tc
               ON tc.table_schema = c.table_schema
              AND tc.table_name = c.table_name
              AND tc.constraint_type = 'PRIMARY KEY'
        LEFT JOIN information_schema.key_column_usage kcu
               ON kcu.constraint_name = tc.constraint_name
              AND kcu.table_schema = c.table_schema
              AND kcu.table_name = c.table_name
              AND kcu.column_name = c.column_name
        WHERE c.table_schema = 'public'
        ORDER BY c.table_name, c.ordinal_position
    ";

    let rows = sqlx::query(CATALOG_SQL).fetch_all(pool).await?;
    let mut catalog: HashMap<String, TableMetadata> = HashMap::new();

    for row in rows {
        let table: String = row.try_get("table_name")?;
        let column: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("udt_name")?;
        let is_pk: bool = row.try_get("is_primary_key")?;

        let meta = catalog.entry(table).or_insert_with(|| TableMetadata {
            columns: Vec::new(),
            primary_keys: Vec::new(),
        });

        meta.columns.push(Column {
            name: column.clone(),
            data_type,
        });

        if is_pk {
            meta.primary_keys.push(column);
        }
    }

    tracing::debug!(tables = catalog.len(), "loaded table catalog");
    Ok(catalog)
}

/// One ready-to-execute upsert statement with its bind arguments in
/// metadata column order
struct UpsertStatement {
    sql: String,
    args: Vec<Option<String>>,
}

/// Partition records into batches and produce one statement per batch.
fn plan_upserts(table: &str, meta: &TableMetadata, records: &[Record]) -> Vec<UpsertStatement> {
    records
        .chunks(UPSERT_BATCH_SIZE)
        .map(|batch| {
            let mut args = Vec::with_capacity(batch.len() * meta.columns.len());
            for record in batch {
                for column in &meta.columns {
                    args.push(value_as_text(record.get(&column.name)));
                }
            }

            UpsertStatement {
                sql: build_upsert_sql(table, meta, batch.len()),
                args,
            }
        })
        .collect()
}

/// Quote an identifier for inclusion in SQL text.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Generate the batched upsert statement for `rows` records.
///
/// Placeholders number row-major: row `i`, column `j` binds `$({i*N}+{j}+1)`
/// for an `N`-column table. With primary keys the statement carries an
/// `ON CONFLICT (pks) DO UPDATE SET col = EXCLUDED.col` clause over the
/// non-key columns; with every column in the key it degrades to
/// `DO NOTHING`; with no primary key it is a plain insert.
fn build_upsert_sql(table: &str, meta: &TableMetadata, rows: usize) -> String {
    let columns = &meta.columns;
    let width = columns.len();

    let column_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut values = Vec::with_capacity(rows);
    for i in 0..rows {
        let row = columns
            .iter()
            .enumerate()
            .map(|(j, c)| format!("${}::{}", i * width + j + 1, c.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        values.push(format!("({row})"));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        column_list,
        values.join(", ")
    );

    if meta.primary_keys.is_empty() {
        return sql;
    }

    let conflict_targets = meta
        .primary_keys
        .iter()
        .map(|pk| quote_ident(pk))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| !meta.primary_keys.contains(&c.name))
        .map(|c| {
            let ident = quote_ident(&c.name);
            format!("{ident} = EXCLUDED.{ident}")
        })
        .collect::<Vec<_>>();

    if updates.is_empty() {
        sql.push_str(&format!(" ON CONFLICT ({conflict_targets}) DO NOTHING"));
    } else {
        sql.push_str(&format!(
            " ON CONFLICT ({conflict_targets}) DO UPDATE SET {}",
            updates.join(", ")
        ));
    }

    sql
}

/// Render a record value as its text form for a server-side cast.
///
/// Absent fields and JSON nulls bind NULL; strings bind bare; everything
/// else binds its JSON rendering, which Postgres text input accepts for
/// numerics, booleans, timestamps, and json columns alike.
fn value_as_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn meta(pks: &[&str]) -> TableMetadata {
        TableMetadata {
            columns: vec![
                Column {
                    name: "ts".to_string(),
                    data_type: "timestamptz".to_string(),
                },
                Column {
                    name: "price".to_string(),
                    data_type: "numeric".to_string(),
                },
                Column {
                    name: "volume".to_string(),
                    data_type: "numeric".to_string(),
                },
            ],
            primary_keys: pks.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_upsert_sql_single_row() {
        let sql = build_upsert_sql("candles", &meta(&["ts"]), 1);
        assert_eq!(
            sql,
            "INSERT INTO \"candles\" (\"ts\", \"price\", \"volume\") \
             VALUES ($1::timestamptz, $2::numeric, $3::numeric) \
             ON CONFLICT (\"ts\") DO UPDATE SET \
             \"price\" = EXCLUDED.\"price\", \"volume\" = EXCLUDED.\"volume\""
        );
    }

    #[test]
    fn test_upsert_sql_placeholders_are_row_major() {
        let sql = build_upsert_sql("candles", &meta(&["ts"]), 2);
        assert!(sql.contains("($1::timestamptz, $2::numeric, $3::numeric)"));
        assert!(sql.contains("($4::timestamptz, $5::numeric, $6::numeric)"));
    }

    #[test]
    fn test_no_primary_key_is_plain_insert() {
        let sql = build_upsert_sql("events", &meta(&[]), 1);
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_all_columns_keyed_degrades_to_do_nothing() {
        let sql = build_upsert_sql("edges", &meta(&["ts", "price", "volume"]), 1);
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn test_quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn test_value_as_text() {
        assert_eq!(value_as_text(None), None);
        assert_eq!(value_as_text(Some(&Value::Null)), None);
        assert_eq!(
            value_as_text(Some(&Value::String("a".to_string()))),
            Some("a".to_string())
        );
        assert_eq!(
            value_as_text(Some(&serde_json::json!(4.25))),
            Some("4.25".to_string())
        );
        assert_eq!(
            value_as_text(Some(&serde_json::json!({"nested": true}))),
            Some("{\"nested\":true}".to_string())
        );
    }

    #[test]
    fn test_large_upsert_plans_eleven_statements() {
        // 10,004 records split into ten full 1,000-row statements plus a
        // 4-row tail.
        let meta = meta(&["ts"]);
        let records: Vec<Record> = (0..10_004)
            .map(|i| {
                [("ts".to_string(), serde_json::json!(i))]
                    .into_iter()
                    .collect()
            })
            .collect();

        let plan = plan_upserts("candles", &meta, &records);
        assert_eq!(plan.len(), 11);

        for statement in &plan[..10] {
            assert_eq!(statement.args.len(), 1_000 * 3);
        }
        assert_eq!(plan[10].args.len(), 4 * 3);
        assert!(plan[10].sql.contains("$12::"));
        assert!(!plan[10].sql.contains("$13"));
    }

    #[test]
    fn test_plan_binds_args_in_metadata_column_order() {
        let meta = meta(&["ts"]);
        let record: Record = [
            // Record field order differs from the table's column order.
            ("volume".to_string(), serde_json::json!("3")),
            ("ts".to_string(), serde_json::json!("2022-05-10T00:00:00Z")),
        ]
        .into_iter()
        .collect();

        let plan = plan_upserts("candles", &meta, &[record]);
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan[0].args,
            vec![
                Some("2022-05-10T00:00:00Z".to_string()),
                None,
                Some("3".to_string()),
            ]
        );
    }

    // Live-database coverage lives in the ignored tests below; they need a
    // reachable Postgres at DATABASE_URL.
    #[tokio::test]
    #[ignore]
    async fn test_live_upsert_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let storage = PostgresStorage::connect(&url).await.unwrap();

        let tx = storage.start_tx().await.unwrap();
        let writer = tx.writer();

        let record: Record = [
            ("ts".to_string(), serde_json::json!("2022-05-10T00:00:00Z")),
            ("price".to_string(), serde_json::json!("100.5")),
            ("volume".to_string(), serde_json::json!("3")),
        ]
        .into_iter()
        .collect();

        writer
            .send(Box::new(move |session| {
                Box::pin(async move { session.upsert("candles", &[record]).await })
            }))
            .unwrap();

        tx.commit().await.unwrap();
    }
}
