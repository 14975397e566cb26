use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fois_core::{ColumnType, Dataset, TDATE_COLUMN};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, info_span, Instrument};

use crate::{aligned_text_rows, unknown_columns, RetryDisposition, Sink, SinkError};

/// Synthetic identity key added to every created table.
pub const IDENTITY_COLUMN: &str = "sync_row_id";

// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

/// Row-store sink: one table per dataset, typed columns inferred from the first batch.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

#[derive(Debug, Clone)]
struct ExistingColumn {
    name: String,
    data_type: String,
}

impl PostgresSink {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(15))
            .connect(database_url)
            .await
            .map_err(|err| sqlx_error("connecting to postgres", err))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn existing_columns(
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<ExistingColumn>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT column_name::text, data_type::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .filter(|(name, _)| name != IDENTITY_COLUMN)
        .map(|(name, data_type)| ExistingColumn { name, data_type })
        .collect())
}

#[async_trait]
impl Sink for PostgresSink {
    fn describe(&self) -> &str {
        "postgres"
    }

    async fn exists(&self, dataset: &str, date: NaiveDate) -> Result<bool, SinkError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| sqlx_error("acquiring connection", err))?;

        let columns = existing_columns(&mut conn, dataset)
            .await
            .map_err(|err| sqlx_error("reading table columns", err))?;
        if !columns.iter().any(|c| c.name == TDATE_COLUMN) {
            debug!(dataset, "table or TDATE column absent");
            return Ok(false);
        }

        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = $1)",
            quote_ident(dataset),
            quote_ident(TDATE_COLUMN)
        );
        match sqlx::query_scalar::<_, bool>(&sql)
            .bind(date)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(found) => Ok(found),
            Err(err) if is_undefined_table(&err) => Ok(false),
            Err(err) => Err(sqlx_error("checking stored date", err)),
        }
    }

    async fn store(&self, dataset: &str, data: &Dataset) -> Result<usize, SinkError> {
        let span = info_span!("postgres_store", table = dataset, rows = data.len());
        async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| sqlx_error("starting transaction", err))?;

            let mut columns = existing_columns(&mut tx, dataset)
                .await
                .map_err(|err| sqlx_error("reading table columns", err))?;

            if columns.is_empty() {
                let ddl = create_table_sql(dataset, &data.column_types());
                info!(%ddl, "creating table");
                sqlx::query(&ddl)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| sqlx_error("creating table", err))?;
                columns = existing_columns(&mut tx, dataset)
                    .await
                    .map_err(|err| sqlx_error("reading created table", err))?;
            }

            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let unknown = unknown_columns(&names, data);
            if !unknown.is_empty() {
                return Err(SinkError::SchemaMismatch {
                    table: dataset.to_string(),
                    columns: unknown.into_iter().map(str::to_string).collect(),
                });
            }

            let rows = aligned_text_rows(&names, data);
            let chunk_rows = (MAX_BIND_PARAMS / names.len().max(1)).max(1);
            for chunk in rows.chunks(chunk_rows) {
                let mut builder = insert_builder(dataset, &columns, chunk);
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| sqlx_error("inserting rows", err))?;
            }

            tx.commit()
                .await
                .map_err(|err| sqlx_error("committing rows", err))?;
            info!(written = rows.len(), "rows inserted");
            Ok(rows.len())
        }
        .instrument(span)
        .await
    }
}

fn insert_builder<'a>(
    table: &str,
    columns: &[ExistingColumn],
    rows: &'a [Vec<Option<String>>],
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    ));

    builder.push_values(rows, |mut values, row| {
        for (cell, column) in row.iter().zip(columns) {
            values.push_bind(cell.clone());
            if let Some(cast) = cast_for(&column.data_type) {
                values.push_unseparated(cast);
            }
        }
    });
    builder
}

/// Text parameters are cast to the existing column type so every batch binds the same way.
fn cast_for(data_type: &str) -> Option<&'static str> {
    match data_type {
        "bigint" => Some("::BIGINT"),
        "integer" => Some("::INTEGER"),
        "smallint" => Some("::SMALLINT"),
        "double precision" => Some("::DOUBLE PRECISION"),
        "real" => Some("::REAL"),
        "numeric" => Some("::NUMERIC"),
        "boolean" => Some("::BOOLEAN"),
        "date" => Some("::DATE"),
        "timestamp without time zone" => Some("::TIMESTAMP"),
        "timestamp with time zone" => Some("::TIMESTAMPTZ"),
        _ => None,
    }
}

pub(crate) fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::Text => "TEXT",
    }
}

fn create_table_sql(table: &str, columns: &[(String, ColumnType)]) -> String {
    let mut defs = vec![format!(
        "{} BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
        quote_ident(IDENTITY_COLUMN)
    )];
    defs.extend(
        columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), sql_type(*ty))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        defs.join(", ")
    )
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01"))
}

pub(crate) fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if is_transient_sqlstate(code) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

/// Connection exceptions, serialization failures, deadlocks, resource exhaustion
/// and operator intervention.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57P")
        || code == "40001"
        || code == "40P01"
}

fn sqlx_error(context: &str, err: sqlx::Error) -> SinkError {
    SinkError::from_disposition(classify_sqlx_error(&err), format!("{context}: {err}"))
}
