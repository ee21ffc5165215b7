//! HTTP fetch utilities and the relational gateway for cbase.

use std::time::Duration;

use anyhow::Context;
use cbase_core::{CellValue, ColumnKind, DataTable, RunStatus, TableSpec};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cbase-storage";

/// Bind-parameter ceiling per statement inherited from the narrowest
/// engine the extracts have to land on.
pub const PARAM_LIMIT: usize = 2090;
/// Upper row cap per batch regardless of column count.
pub const ROW_CAP: usize = 1000;
/// Bounded length applied to the business-key column on PK enforcement.
pub const KEY_LENGTH: usize = 64;
/// Activity log messages are truncated to this many characters.
pub const MESSAGE_LIMIT: usize = 512;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("token header missing from partner auth response")]
    MissingTokenHeader,
}

/// Downloads partner report payloads. Retries here are bounded transport
/// retries on 5xx/429 and connect/timeout failures; the pipeline itself is
/// never re-run in-process.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedPayload, FetchError> {
        let span = info_span!("payload_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedPayload {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Client-credentials client against the partner API. The bearer token is
/// delivered in the `access_token` response header, not the body.
#[derive(Debug)]
pub struct PartnerClient {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl PartnerClient {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building partner client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub async fn acquire_token(&self) -> Result<String, FetchError> {
        let url = format!(
            "{}/iaas-auth/api/v1/authorization/oauth2/accesstoken",
            self.base_url
        );
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        resp.headers()
            .get("access_token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(FetchError::MissingTokenHeader)
    }

    /// Ask the partner to generate a report; the result arrives later via
    /// the webhook.
    pub async fn request_report(&self, report_path: &str) -> Result<(), FetchError> {
        let token = self.acquire_token().await?;
        let url = format!("{}{}", self.base_url, report_path);
        let resp = self.client.post(&url).bearer_auth(token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Replace,
}

/// Result of one bulk write. The warning carries a recovered partial-step
/// failure (PK enforcement) without failing the write.
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    pub rows_written: u64,
    pub warning: Option<String>,
}

/// Rows per statement so that `rows * columns` stays under the
/// bind-parameter ceiling. Always at least one row.
pub fn batch_rows(column_count: usize) -> usize {
    if column_count == 0 {
        return ROW_CAP;
    }
    (PARAM_LIMIT / column_count).clamp(1, ROW_CAP)
}

fn sql_type_for(table: &DataTable, column_index: usize) -> &'static str {
    for row in &table.rows {
        match row.get(column_index) {
            Some(CellValue::Text(_)) => return "text",
            Some(CellValue::Number(_)) => return "double precision",
            Some(CellValue::Flag(_)) => return "smallint",
            Some(CellValue::Date(_)) => return "date",
            Some(CellValue::Timestamp(_)) => return "timestamptz",
            Some(CellValue::Null) | None => continue,
        }
    }
    "text"
}

fn insert_sql(destination: &str, columns: &[String], row_count: usize) -> String {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        destination,
        columns.join(", ")
    );
    let mut placeholder = 1;
    for row in 0..row_count {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..columns.len() {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&placeholder.to_string());
            placeholder += 1;
        }
        sql.push(')');
    }
    sql
}

pub fn truncate_message(message: &str, limit: usize) -> String {
    message.chars().take(limit).collect()
}

/// Relational gateway over the destination tables. Every batch is its own
/// transaction; there is no enclosing transaction across steps.
#[derive(Debug, Clone)]
pub struct TableGateway {
    pool: PgPool,
}

impl TableGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Bulk-write `table` into `destination`. Empty input is a no-op and
    /// never issues a statement. Replace drops and recreates the table
    /// from the dataset's inferred column types before inserting; a given
    /// `primary_key` is enforced afterwards and its failure downgrades to
    /// a warning because the data is already committed.
    pub async fn write(
        &self,
        table: &DataTable,
        destination: &str,
        mode: WriteMode,
        primary_key: Option<&str>,
    ) -> Result<WriteSummary, StoreError> {
        if table.is_empty() {
            return Ok(WriteSummary::default());
        }

        let column_types: Vec<&'static str> = (0..table.columns.len())
            .map(|idx| sql_type_for(table, idx))
            .collect();

        if mode == WriteMode::Replace {
            sqlx::query(&format!("DROP TABLE IF EXISTS {destination}"))
                .execute(&self.pool)
                .await?;
            let column_defs = table
                .columns
                .iter()
                .zip(&column_types)
                .map(|(name, ty)| format!("{name} {ty}"))
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!("CREATE TABLE {destination} ({column_defs})"))
                .execute(&self.pool)
                .await?;
        }

        let rows_written = self
            .insert_batches(table, destination, &column_types)
            .await?;

        let mut warning = None;
        if mode == WriteMode::Replace {
            if let Some(key) = primary_key {
                if let Err(err) = self.enforce_primary_key(destination, key).await {
                    let text = format!("primary key enforcement on {destination}.{key} failed: {err}");
                    warn!("{text}");
                    warning = Some(text);
                }
            }
        }

        Ok(WriteSummary {
            rows_written,
            warning,
        })
    }

    async fn insert_batches(
        &self,
        table: &DataTable,
        destination: &str,
        column_types: &[&'static str],
    ) -> Result<u64, StoreError> {
        let batch = batch_rows(table.columns.len());
        let mut written = 0u64;

        for chunk in table.rows.chunks(batch) {
            let sql = insert_sql(destination, &table.columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for (cell, ty) in row.iter().zip(column_types) {
                    query = match cell {
                        CellValue::Text(s) => query.bind(s.clone()),
                        CellValue::Number(n) => query.bind(*n),
                        CellValue::Flag(b) => query.bind(i16::from(*b)),
                        CellValue::Date(d) => query.bind(*d),
                        CellValue::Timestamp(t) => query.bind(*t),
                        CellValue::Null => match *ty {
                            "double precision" => query.bind(None::<f64>),
                            "smallint" => query.bind(None::<i16>),
                            "date" => query.bind(None::<NaiveDate>),
                            "timestamptz" => query.bind(None::<DateTime<Utc>>),
                            _ => query.bind(None::<String>),
                        },
                    };
                }
            }

            let mut tx = self.pool.begin().await?;
            query.execute(&mut *tx).await?;
            tx.commit().await?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }

    async fn enforce_primary_key(&self, destination: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "ALTER TABLE {destination} ALTER COLUMN {key} TYPE varchar({KEY_LENGTH}), \
             ALTER COLUMN {key} SET NOT NULL"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "ALTER TABLE {destination} ADD PRIMARY KEY ({key})"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a full table back through the lens of a [`TableSpec`].
    pub async fn read_table(
        &self,
        spec: &TableSpec,
        destination: &str,
    ) -> Result<DataTable, StoreError> {
        let columns = spec.column_names();
        let sql = format!("SELECT {} FROM {}", columns.join(", "), destination);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut table = DataTable::new(columns.clone());
        for row in rows {
            table.rows.push(decode_row(&row, spec, &columns)?);
        }
        Ok(table)
    }

    /// Best-effort audit write. Failures are surfaced to the operator log
    /// only and never propagated to the pipeline being recorded.
    pub async fn log_activity(&self, activity: &str, status: RunStatus, rows: u64, message: &str) {
        let message = truncate_message(message, MESSAGE_LIMIT);
        let result = sqlx::query(
            "INSERT INTO activity_log (activity, status, row_count, message) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(activity)
        .bind(status.as_str())
        .bind(rows as i64)
        .bind(&message)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(activity, error = %err, "activity log write failed");
        }
    }
}

fn decode_row(row: &PgRow, spec: &TableSpec, columns: &[String]) -> Result<Vec<CellValue>, StoreError> {
    let mut cells = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let kind = spec.kind_of(name).unwrap_or(ColumnKind::Text);
        let cell = match kind {
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)?
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null),
            ColumnKind::Decimal => row
                .try_get::<Option<f64>, _>(idx)?
                .map(CellValue::Number)
                .unwrap_or(CellValue::Null),
            ColumnKind::Flag => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| CellValue::Flag(v != 0))
                .unwrap_or(CellValue::Null),
        };
        cells.push(cell);
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_rows_respects_param_limit_and_row_cap() {
        assert_eq!(batch_rows(50), 41);
        assert_eq!(batch_rows(1), ROW_CAP);
        assert_eq!(batch_rows(PARAM_LIMIT * 2), 1);
    }

    #[test]
    fn insert_sql_numbers_placeholders_row_major() {
        let sql = insert_sql("t", &["a".into(), "b".into()], 2);
        assert_eq!(sql, "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)");
    }

    #[test]
    fn sql_types_follow_first_non_null_cell() {
        let table = DataTable {
            columns: vec!["a".into(), "b".into(), "c".into()],
            rows: vec![
                vec![CellValue::Null, CellValue::Flag(true), CellValue::Null],
                vec![
                    CellValue::Number(1.0),
                    CellValue::Flag(false),
                    CellValue::Null,
                ],
            ],
        };
        assert_eq!(sql_type_for(&table, 0), "double precision");
        assert_eq!(sql_type_for(&table, 1), "smallint");
        assert_eq!(sql_type_for(&table, 2), "text");
    }

    #[test]
    fn message_truncation_is_char_bounded() {
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("aé", 2), "aé");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_server_side() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
