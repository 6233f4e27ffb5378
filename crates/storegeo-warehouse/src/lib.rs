//! Warehouse upsert: stage a geocoded batch, merge it latest-wins, clean up.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use storegeo_core::{column_names, Chain, ColumnKind, OutputRow, KEY_COLUMNS, WAREHOUSE_COLUMNS};
use storegeo_storage::{read_ndjson_file, write_ndjson_atomic};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "storegeo-warehouse";

pub const DEFAULT_DATASET: &str = "raw";
pub const DEFAULT_TABLE: &str = "stores_geocoded";
pub const DEFAULT_SCHEMA_PATH: &str = "schemas/raw/stores_geocoded.json";
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {label}: {value}")]
    InvalidIdentifier { label: &'static str, value: String },
    #[error("invalid project: {0}")]
    InvalidProject(String),
    #[error("{0}")]
    Invalid(String),
}

/// Accept only `[A-Za-z0-9_]+`; anything else could escape the SQL quoting.
pub fn sanitize_id<'a>(value: &'a str, label: &'static str) -> Result<&'a str, ConfigError> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(value)
    } else {
        Err(ConfigError::InvalidIdentifier {
            label,
            value: value.to_string(),
        })
    }
}

pub fn validate_project(project: &str) -> Result<&str, ConfigError> {
    let ok = !project.is_empty()
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if ok {
        Ok(project)
    } else {
        Err(ConfigError::InvalidProject(project.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: &str, table: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            dataset: sanitize_id(dataset, "dataset")?.to_string(),
            table: sanitize_id(table, "table")?.to_string(),
        })
    }

    /// Staging table living next to `self`, e.g. `raw._tmp_stores_geocoded_<suffix>`.
    pub fn staging(&self, suffix: &str) -> Self {
        let normalized: String = suffix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        Self {
            dataset: self.dataset.clone(),
            table: format!("_tmp_{}_{}", self.table, normalized),
        }
    }

    fn pg_quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

pub fn default_staging_suffix(now: DateTime<Utc>) -> String {
    now.timestamp_millis().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    BigQuery,
    Postgres,
}

fn merge_source_subquery(dialect: SqlDialect, source: &str) -> String {
    match dialect {
        SqlDialect::BigQuery => format!(
            "  SELECT *\n  FROM {source}\n  QUALIFY ROW_NUMBER() OVER (\n    PARTITION BY chain, store_id\n    ORDER BY geocoded_at DESC, address_raw DESC\n  ) = 1"
        ),
        SqlDialect::Postgres => format!(
            "  SELECT DISTINCT ON (chain, store_id) *\n  FROM {source}\n  ORDER BY chain, store_id, geocoded_at DESC NULLS LAST, address_raw DESC NULLS LAST"
        ),
    }
}

/// Latest-wins MERGE of `source` into `target` keyed on `(chain, store_id)`.
///
/// Duplicate keys in the source collapse to the greatest `geocoded_at`, ties
/// to the greatest `address_raw`. Matched rows update only when the target is
/// undated or not newer than the source.
pub fn build_merge_sql(dialect: SqlDialect, target: &str, source: &str) -> String {
    let columns = column_names();
    let set_clause = columns
        .iter()
        .filter(|col| !KEY_COLUMNS.contains(*col))
        .map(|col| format!("  {col} = S.{col}"))
        .collect::<Vec<_>>()
        .join(",\n");
    let insert_columns = columns.join(", ");
    let insert_values = columns
        .iter()
        .map(|col| format!("S.{col}"))
        .collect::<Vec<_>>()
        .join(", ");
    let head = match dialect {
        SqlDialect::BigQuery => format!("MERGE {target} AS T"),
        SqlDialect::Postgres => format!("MERGE INTO {target} AS T"),
    };

    format!(
        "{head}\nUSING (\n{}\n) AS S\nON T.chain = S.chain AND T.store_id = S.store_id\nWHEN MATCHED AND (T.geocoded_at IS NULL OR S.geocoded_at >= T.geocoded_at)\n  THEN UPDATE SET\n{set_clause}\nWHEN NOT MATCHED THEN\n  INSERT ({insert_columns})\n  VALUES ({insert_values})",
        merge_source_subquery(dialect, source)
    )
}

/// BigQuery JSON schema for the durable table.
pub fn bigquery_schema() -> JsonValue {
    JsonValue::Array(
        WAREHOUSE_COLUMNS
            .iter()
            .map(|col| {
                let kind = match col.kind {
                    ColumnKind::String => "STRING",
                    ColumnKind::Float => "FLOAT",
                    ColumnKind::Integer => "INTEGER",
                    ColumnKind::Timestamp => "TIMESTAMP",
                };
                json!({
                    "name": col.name,
                    "type": kind,
                    "mode": if col.required { "REQUIRED" } else { "NULLABLE" },
                })
            })
            .collect(),
    )
}

pub fn postgres_table_ddl(target: &TableRef) -> String {
    let columns = WAREHOUSE_COLUMNS
        .iter()
        .map(|col| {
            let kind = match col.kind {
                ColumnKind::String => "TEXT",
                ColumnKind::Float => "DOUBLE PRECISION",
                ColumnKind::Integer => "BIGINT",
                ColumnKind::Timestamp => "TIMESTAMPTZ",
            };
            let null = if col.required { " NOT NULL" } else { "" };
            format!("  {} {kind}{null}", col.name)
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{columns},\n  PRIMARY KEY ({})\n)",
        target.pg_quoted(),
        KEY_COLUMNS.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertStep {
    Load {
        target: TableRef,
        staging: TableRef,
        source: String,
    },
    Merge {
        target: TableRef,
        staging: TableRef,
    },
    Drop {
        staging: TableRef,
    },
}

impl UpsertStep {
    pub fn name(&self) -> &'static str {
        match self {
            UpsertStep::Load { .. } => "load",
            UpsertStep::Merge { .. } => "merge",
            UpsertStep::Drop { .. } => "drop",
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{step} step timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("unsupported load source for this backend: {0}")]
    UnsupportedSource(String),
    #[error("{0:#}")]
    Io(anyhow::Error),
}

/// The three operations an upsert needs from a warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// The exact command or statement `step` would run.
    fn render(&self, step: &UpsertStep) -> String;

    async fn load_replace(
        &self,
        target: &TableRef,
        staging: &TableRef,
        source: &str,
    ) -> Result<(), WarehouseError>;

    async fn merge(&self, target: &TableRef, staging: &TableRef) -> Result<(), WarehouseError>;

    async fn drop_table(&self, staging: &TableRef) -> Result<(), WarehouseError>;
}

fn quote_arg(arg: &str) -> String {
    if arg.chars().any(char::is_whitespace) {
        serde_json::to_string(arg).unwrap_or_else(|_| arg.to_string())
    } else {
        arg.to_string()
    }
}

/// BigQuery through the `bq` command-line tool.
#[derive(Debug, Clone)]
pub struct BqCliWarehouse {
    program: String,
    project: String,
    location: Option<String>,
    schema: String,
}

impl BqCliWarehouse {
    pub fn new(
        program: impl Into<String>,
        project: &str,
        location: Option<String>,
        schema: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            program: program.into(),
            project: validate_project(project)?.to_string(),
            location,
            schema: schema.into(),
        })
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--project_id".to_string(), self.project.clone()];
        if let Some(location) = &self.location {
            args.push("--location".to_string());
            args.push(location.clone());
        }
        args
    }

    fn table_arg(&self, table: &TableRef) -> String {
        format!("{}:{}", self.project, table)
    }

    fn sql_ref(&self, table: &TableRef) -> String {
        format!("`{}.{}`", self.project, table)
    }

    pub fn args_for(&self, step: &UpsertStep) -> Vec<String> {
        let mut args = self.base_args();
        match step {
            UpsertStep::Load {
                staging, source, ..
            } => args.extend([
                "load".to_string(),
                "--replace".to_string(),
                "--source_format=NEWLINE_DELIMITED_JSON".to_string(),
                self.table_arg(staging),
                source.clone(),
                self.schema.clone(),
            ]),
            UpsertStep::Merge { target, staging } => args.extend([
                "query".to_string(),
                "--use_legacy_sql=false".to_string(),
                build_merge_sql(
                    SqlDialect::BigQuery,
                    &self.sql_ref(target),
                    &self.sql_ref(staging),
                ),
            ]),
            UpsertStep::Drop { staging } => args.extend([
                "rm".to_string(),
                "-f".to_string(),
                "-t".to_string(),
                self.table_arg(staging),
            ]),
        }
        args
    }

    async fn run(&self, step: &UpsertStep) -> Result<(), WarehouseError> {
        let args = self.args_for(step);
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| WarehouseError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(step = step.name(), stdout = %stdout.trim(), "bq output");
        }
        if output.status.success() {
            return Ok(());
        }
        Err(WarehouseError::CommandFailed {
            command: format!("{} {}", self.program, step.name()),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl Warehouse for BqCliWarehouse {
    fn render(&self, step: &UpsertStep) -> String {
        let args = self
            .args_for(step)
            .iter()
            .map(|arg| quote_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {args}", self.program)
    }

    async fn load_replace(
        &self,
        target: &TableRef,
        staging: &TableRef,
        source: &str,
    ) -> Result<(), WarehouseError> {
        self.run(&UpsertStep::Load {
            target: target.clone(),
            staging: staging.clone(),
            source: source.to_string(),
        })
        .await
    }

    async fn merge(&self, target: &TableRef, staging: &TableRef) -> Result<(), WarehouseError> {
        self.run(&UpsertStep::Merge {
            target: target.clone(),
            staging: staging.clone(),
        })
        .await
    }

    async fn drop_table(&self, staging: &TableRef) -> Result<(), WarehouseError> {
        self.run(&UpsertStep::Drop {
            staging: staging.clone(),
        })
        .await
    }
}

fn local_source(source: &str) -> Result<PathBuf, WarehouseError> {
    if source.contains("://") {
        return Err(WarehouseError::UnsupportedSource(source.to_string()));
    }
    Ok(PathBuf::from(source))
}

/// PostgreSQL 15+ through `sqlx`; the dataset maps to a schema.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Builds the pool without connecting, so dry runs stay offline.
    pub fn connect_lazy(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn prepare_statements(target: &TableRef, staging: &TableRef) -> Vec<String> {
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", target.dataset),
            postgres_table_ddl(target),
            format!("DROP TABLE IF EXISTS {}", staging.pg_quoted()),
            format!(
                "CREATE TABLE {} (LIKE {})",
                staging.pg_quoted(),
                target.pg_quoted()
            ),
        ]
    }

    pub fn insert_statement(staging: &TableRef) -> String {
        format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb)",
            table = staging.pg_quoted()
        )
    }

    pub fn merge_statement(target: &TableRef, staging: &TableRef) -> String {
        build_merge_sql(SqlDialect::Postgres, &target.pg_quoted(), &staging.pg_quoted())
    }

    pub fn drop_statement(staging: &TableRef) -> String {
        format!("DROP TABLE IF EXISTS {}", staging.pg_quoted())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn render(&self, step: &UpsertStep) -> String {
        match step {
            UpsertStep::Load {
                target,
                staging,
                source,
            } => {
                let mut statements = Self::prepare_statements(target, staging);
                statements.push(format!(
                    "{} -- $1 = rows of {source}",
                    Self::insert_statement(staging)
                ));
                statements.join(";\n")
            }
            UpsertStep::Merge { target, staging } => Self::merge_statement(target, staging),
            UpsertStep::Drop { staging } => Self::drop_statement(staging),
        }
    }

    async fn load_replace(
        &self,
        target: &TableRef,
        staging: &TableRef,
        source: &str,
    ) -> Result<(), WarehouseError> {
        let path = local_source(source)?;
        let rows: Vec<JsonValue> = read_ndjson_file(&path).map_err(WarehouseError::Io)?;

        let mut tx = self.pool.begin().await?;
        for statement in Self::prepare_statements(target, staging) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        let loaded = sqlx::query(&Self::insert_statement(staging))
            .bind(JsonValue::Array(rows))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!(staging = %staging, loaded, "loaded staging table");
        Ok(())
    }

    async fn merge(&self, target: &TableRef, staging: &TableRef) -> Result<(), WarehouseError> {
        let affected = sqlx::query(&Self::merge_statement(target, staging))
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(target = %target, affected, "merged staging table");
        Ok(())
    }

    async fn drop_table(&self, staging: &TableRef) -> Result<(), WarehouseError> {
        sqlx::query(&Self::drop_statement(staging))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub kept_newer: usize,
}

/// Collapse duplicate keys, keeping the greatest `(geocoded_at, address_raw)`.
pub fn collapse_duplicates(rows: Vec<OutputRow>) -> Vec<OutputRow> {
    let mut order: Vec<OutputRow> = Vec::new();
    let mut by_key: HashMap<(Chain, String), usize> = HashMap::new();
    for row in rows {
        let key = (row.chain, row.store_id.clone());
        match by_key.get(&key) {
            Some(&idx) => {
                let current = &order[idx];
                if (row.geocoded_at, &row.address_raw) >= (current.geocoded_at, &current.address_raw) {
                    order[idx] = row;
                }
            }
            None => {
                by_key.insert(key, order.len());
                order.push(row);
            }
        }
    }
    order
}

/// Row-level equivalent of the MERGE statement, used by the local backend.
pub fn merge_rows(target: &mut Vec<OutputRow>, staged: Vec<OutputRow>) -> MergeCounts {
    let mut counts = MergeCounts::default();
    let mut index: HashMap<(Chain, String), usize> = target
        .iter()
        .enumerate()
        .map(|(i, row)| ((row.chain, row.store_id.clone()), i))
        .collect();

    for row in collapse_duplicates(staged) {
        let key = (row.chain, row.store_id.clone());
        match index.get(&key) {
            Some(&i) => {
                if row.geocoded_at >= target[i].geocoded_at {
                    target[i] = row;
                    counts.updated += 1;
                } else {
                    counts.kept_newer += 1;
                }
            }
            None => {
                index.insert(key, target.len());
                target.push(row);
                counts.inserted += 1;
            }
        }
    }
    counts
}

/// File-backed warehouse: each table is `<root>/<dataset>/<table>.ndjson`.
///
/// Rows are `OutputRow`s, so every stored row carries a `geocoded_at`; a file
/// holding an undated row fails to read rather than merging as "always stale".
#[derive(Debug, Clone)]
pub struct LocalWarehouse {
    root: PathBuf,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn table_path(&self, table: &TableRef) -> PathBuf {
        self.root
            .join(&table.dataset)
            .join(format!("{}.ndjson", table.table))
    }

    pub fn read_table(&self, table: &TableRef) -> Result<Vec<OutputRow>, WarehouseError> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_ndjson_file(&path).map_err(WarehouseError::Io)
    }

    async fn replace_table(
        &self,
        table: &TableRef,
        rows: &[OutputRow],
    ) -> Result<(), WarehouseError> {
        let path = self.table_path(table);
        if rows.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(WarehouseError::Io(
                        anyhow::Error::new(err).context(format!("removing {}", path.display())),
                    ))
                }
            }
            return Ok(());
        }
        write_ndjson_atomic(&path, rows)
            .await
            .map_err(WarehouseError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    fn render(&self, step: &UpsertStep) -> String {
        match step {
            UpsertStep::Load {
                staging, source, ..
            } => format!(
                "load --replace {} <- {source}",
                self.table_path(staging).display()
            ),
            UpsertStep::Merge { target, staging } => format!(
                "merge {} -> {} on ({}) when newer",
                self.table_path(staging).display(),
                self.table_path(target).display(),
                KEY_COLUMNS.join(", ")
            ),
            UpsertStep::Drop { staging } => {
                format!("rm -f {}", self.table_path(staging).display())
            }
        }
    }

    async fn load_replace(
        &self,
        _target: &TableRef,
        staging: &TableRef,
        source: &str,
    ) -> Result<(), WarehouseError> {
        let path = local_source(source)?;
        let rows: Vec<OutputRow> = read_ndjson_file(&path).map_err(WarehouseError::Io)?;
        self.replace_table(staging, &rows).await
    }

    async fn merge(&self, target: &TableRef, staging: &TableRef) -> Result<(), WarehouseError> {
        let staged = self.read_table(staging)?;
        let mut rows = self.read_table(target)?;
        let counts = merge_rows(&mut rows, staged);
        debug!(target = %target, ?counts, "merged staging table");
        self.replace_table(target, &rows).await
    }

    async fn drop_table(&self, staging: &TableRef) -> Result<(), WarehouseError> {
        self.replace_table(staging, &[]).await
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOptions {
    pub dataset: String,
    pub table: String,
    pub source: String,
    pub temp_suffix: Option<String>,
    pub keep_temp: bool,
    pub dry_run: bool,
    pub step_timeout: Duration,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            dataset: DEFAULT_DATASET.to_string(),
            table: DEFAULT_TABLE.to_string(),
            source: String::new(),
            temp_suffix: None,
            keep_temp: false,
            dry_run: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertPlan {
    pub target: TableRef,
    pub staging: TableRef,
    pub steps: Vec<UpsertStep>,
}

/// Validate options and lay out the ordered steps. Performs no I/O.
pub fn plan_upsert(options: &UpsertOptions, now: DateTime<Utc>) -> Result<UpsertPlan, ConfigError> {
    let target = TableRef::new(&options.dataset, &options.table)?;
    let source = options.source.trim();
    if source.is_empty() {
        return Err(ConfigError::Invalid("--source is required".to_string()));
    }
    let suffix = options
        .temp_suffix
        .clone()
        .unwrap_or_else(|| default_staging_suffix(now));
    let staging = target.staging(&suffix);

    let mut steps = vec![
        UpsertStep::Load {
            target: target.clone(),
            staging: staging.clone(),
            source: source.to_string(),
        },
        UpsertStep::Merge {
            target: target.clone(),
            staging: staging.clone(),
        },
    ];
    if !options.keep_temp {
        steps.push(UpsertStep::Drop {
            staging: staging.clone(),
        });
    }
    Ok(UpsertPlan {
        target,
        staging,
        steps,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertReport {
    pub target: String,
    pub staging_table: String,
    pub commands: Vec<String>,
    pub executed: bool,
}

/// Run load, merge and (unless kept) drop in order, stopping at the first failure.
pub async fn run_upsert(
    warehouse: &dyn Warehouse,
    options: &UpsertOptions,
) -> anyhow::Result<UpsertReport> {
    let plan = plan_upsert(options, Utc::now())?;
    let mut commands = Vec::with_capacity(plan.steps.len());

    for step in &plan.steps {
        let rendered = warehouse.render(step);
        info!(step = step.name(), "[exec] {rendered}");
        commands.push(rendered);
        if options.dry_run {
            continue;
        }

        let span = info_span!("warehouse_step", step = step.name(), staging = %plan.staging);
        let fut = async {
            match step {
                UpsertStep::Load {
                    target,
                    staging,
                    source,
                } => warehouse.load_replace(target, staging, source).await,
                UpsertStep::Merge { target, staging } => warehouse.merge(target, staging).await,
                UpsertStep::Drop { staging } => warehouse.drop_table(staging).await,
            }
        };
        let result = match tokio::time::timeout(options.step_timeout, fut.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(WarehouseError::Timeout {
                step: step.name(),
                secs: options.step_timeout.as_secs(),
            }),
        };
        result.with_context(|| {
            format!(
                "warehouse {} step failed (staging table {})",
                step.name(),
                plan.staging
            )
        })?;
    }

    Ok(UpsertReport {
        target: plan.target.to_string(),
        staging_table: plan.staging.to_string(),
        commands,
        executed: !options.dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn staging_names_are_normalized() {
        let target = TableRef::new("raw", "stores_geocoded").unwrap();
        let staging = target.staging("2026-02-11T23:59:59.000Z");
        assert_eq!(
            staging.to_string(),
            "raw._tmp_stores_geocoded_2026_02_11T23_59_59_000Z"
        );
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        assert_eq!(
            sanitize_id("raw-prod", "dataset").unwrap_err().to_string(),
            "invalid dataset: raw-prod"
        );
        assert!(sanitize_id("", "table").is_err());
        assert!(TableRef::new("raw", "stores`; DROP").is_err());
        assert!(validate_project("my-project").is_ok());
        assert!(validate_project("my project").is_err());
        assert!(validate_project("a`b").is_err());
    }

    #[test]
    fn default_suffix_is_epoch_millis() {
        let now = Utc.with_ymd_and_hms(2026, 2, 11, 0, 0, 0).unwrap();
        assert_eq!(default_staging_suffix(now), now.timestamp_millis().to_string());
    }

    #[test]
    fn bigquery_merge_keeps_freshness_guard_and_key() {
        let sql = build_merge_sql(
            SqlDialect::BigQuery,
            "`p.raw.stores_geocoded`",
            "`p.raw._tmp_stores_geocoded_1`",
        );
        assert!(sql.starts_with("MERGE `p.raw.stores_geocoded` AS T"));
        assert!(sql.contains("PARTITION BY chain, store_id"));
        assert!(sql.contains("ORDER BY geocoded_at DESC, address_raw DESC"));
        assert!(sql.contains("ON T.chain = S.chain AND T.store_id = S.store_id"));
        assert!(sql.contains("S.geocoded_at >= T.geocoded_at"));
        assert!(sql.contains("WHEN NOT MATCHED THEN"));
        assert!(!sql.contains("  chain = S.chain"));
        assert!(!sql.contains("  store_id = S.store_id"));
        assert!(sql.contains("  geocoded_at = S.geocoded_at"));
    }

    #[test]
    fn postgres_merge_uses_distinct_on() {
        let target = TableRef::new("raw", "stores_geocoded").unwrap();
        let staging = target.staging("1");
        let sql = PgWarehouse::merge_statement(&target, &staging);
        assert!(sql.starts_with("MERGE INTO \"raw\".\"stores_geocoded\" AS T"));
        assert!(sql.contains("SELECT DISTINCT ON (chain, store_id) *"));
        assert!(sql.contains("geocoded_at DESC NULLS LAST, address_raw DESC NULLS LAST"));
    }

    #[test]
    fn postgres_ddl_declares_key_and_types() {
        let ddl = postgres_table_ddl(&TableRef::new("raw", "stores_geocoded").unwrap());
        assert!(ddl.contains("chain TEXT NOT NULL"));
        assert!(ddl.contains("point_lat DOUBLE PRECISION"));
        assert!(ddl.contains("level BIGINT"));
        assert!(ddl.contains("geocoded_at TIMESTAMPTZ"));
        assert!(ddl.contains("PRIMARY KEY (chain, store_id)"));
    }

    #[test]
    fn shell_rendering_quotes_whitespace_args() {
        assert_eq!(quote_arg("load"), "load");
        assert_eq!(quote_arg("a b"), "\"a b\"");
        assert_eq!(quote_arg("x\ny"), "\"x\\ny\"");
    }

    #[test]
    fn plan_drops_staging_unless_kept() {
        let now = Utc.with_ymd_and_hms(2026, 2, 11, 0, 0, 0).unwrap();
        let mut options = UpsertOptions {
            source: "out.ndjson".into(),
            temp_suffix: Some("run1".into()),
            ..UpsertOptions::default()
        };
        let plan = plan_upsert(&options, now).unwrap();
        let names: Vec<_> = plan.steps.iter().map(UpsertStep::name).collect();
        assert_eq!(names, vec!["load", "merge", "drop"]);

        options.keep_temp = true;
        let plan = plan_upsert(&options, now).unwrap();
        assert_eq!(plan.steps.len(), 2);

        options.source = " ".into();
        assert!(plan_upsert(&options, now).is_err());
    }

    #[test]
    fn checked_in_schema_matches_column_list() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join(DEFAULT_SCHEMA_PATH);
        let text = std::fs::read_to_string(path).expect("schema file");
        let on_disk: JsonValue = serde_json::from_str(&text).expect("schema json");
        assert_eq!(on_disk, bigquery_schema());
    }
}
