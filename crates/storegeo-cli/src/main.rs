use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use storegeo_adapters::{
    AddressNormalizer, FixtureNormalizer, HttpAddressNormalizer, HttpNormalizerConfig,
};
use storegeo_core::{Chain, DEFAULT_GEOCODE_ENGINE};
use storegeo_storage::HttpClientConfig;
use storegeo_sync::{run_geocode, GeocodeRunConfig, DEFAULT_PROGRESS_EVERY};
use storegeo_warehouse::{
    bigquery_schema, run_upsert, BqCliWarehouse, ConfigError, LocalWarehouse, PgWarehouse,
    UpsertOptions, Warehouse, DEFAULT_DATASET, DEFAULT_SCHEMA_PATH, DEFAULT_TABLE,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "storegeo")]
#[command(about = "Convenience store geocoding pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reduce harvester snapshots and geocode the latest address per store.
    Geocode(GeocodeArgs),
    /// Load a geocoded batch into the warehouse and merge it latest-wins.
    Upsert(UpsertArgs),
    /// Print the warehouse table schema (BigQuery JSON format).
    Schema,
}

#[derive(Debug, Args)]
struct GeocodeArgs {
    #[arg(long)]
    chain: Chain,
    /// Comma-separated NDJSON files or directories.
    #[arg(long)]
    input: String,
    #[arg(long)]
    output: PathBuf,
    /// Previously geocoded rows used to seed the address cache.
    #[arg(long)]
    existing: Option<String>,
    #[arg(long)]
    engine_version: Option<String>,
    #[arg(long, default_value = DEFAULT_GEOCODE_ENGINE)]
    geocode_engine: String,
    #[arg(
        long,
        env = "STOREGEO_GEOCODER_URL",
        default_value = "http://127.0.0.1:3000/normalize"
    )]
    geocoder_url: String,
    #[arg(long, env = "STOREGEO_JAPANESE_ADDRESSES_API")]
    japanese_addresses_api: Option<String>,
    #[arg(long, default_value_t = 20)]
    http_timeout_secs: u64,
    /// Answer from a JSON object keyed by raw address instead of the HTTP service.
    #[arg(long)]
    geocoder_fixture: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_PROGRESS_EVERY)]
    progress_every: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Bigquery,
    Postgres,
    Local,
}

#[derive(Debug, Args)]
struct UpsertArgs {
    #[arg(long)]
    project: Option<String>,
    /// Local NDJSON file, or a gs:// URI for the bigquery backend.
    #[arg(long)]
    source: String,
    #[arg(long, default_value = DEFAULT_DATASET)]
    dataset: String,
    #[arg(long, default_value = DEFAULT_TABLE)]
    table: String,
    #[arg(long, default_value = DEFAULT_SCHEMA_PATH)]
    schema: String,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    temp_suffix: Option<String>,
    #[arg(long)]
    keep_temp: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long, value_enum, default_value_t = Backend::Bigquery)]
    backend: Backend,
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long)]
    warehouse_dir: Option<PathBuf>,
    #[arg(long, env = "BQ_BIN", default_value = "bq")]
    bq_bin: String,
    #[arg(long, default_value_t = 600)]
    command_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("storegeo=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Geocode(args) => geocode(args).await?,
        Commands::Upsert(args) => upsert(args).await?,
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&bigquery_schema())?);
        }
    }

    Ok(())
}

fn build_normalizer(args: &GeocodeArgs) -> Result<Box<dyn AddressNormalizer>> {
    if let Some(path) = &args.geocoder_fixture {
        let fixture = FixtureNormalizer::from_path(path)?;
        info!(path = %path.display(), entries = fixture.len(), "using fixture normalizer");
        return Ok(Box::new(fixture));
    }
    let normalizer = HttpAddressNormalizer::new(HttpNormalizerConfig {
        endpoint: args.geocoder_url.clone(),
        japanese_addresses_api: args.japanese_addresses_api.clone(),
        http: HttpClientConfig {
            timeout: Duration::from_secs(args.http_timeout_secs),
            ..HttpClientConfig::default()
        },
    })?;
    info!(endpoint = normalizer.endpoint(), "using http normalizer");
    Ok(Box::new(normalizer))
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current record");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

async fn geocode(args: GeocodeArgs) -> Result<()> {
    let normalizer = build_normalizer(&args)?;
    let config = GeocodeRunConfig {
        chain: args.chain,
        input: args.input,
        output: args.output,
        existing: args.existing,
        geocode_engine: args.geocode_engine,
        engine_version: args.engine_version,
        progress_every: args.progress_every,
    };

    let summary = run_geocode(&config, &*normalizer, Some(cancel_on_ctrl_c())).await?;
    info!(
        run_id = %summary.run_id,
        chain = %summary.chain,
        rows_written = summary.rows_written,
        cache_hits = summary.stats.cache_hits,
        geocoded_new = summary.stats.geocoded_new,
        geocode_errors = summary.stats.geocode_errors,
        "geocode complete"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.interrupted {
        bail!(
            "geocode run interrupted after {} of {} records",
            summary.stats.processed,
            summary.stats.total
        );
    }
    Ok(())
}

fn build_warehouse(args: &UpsertArgs) -> Result<Box<dyn Warehouse>> {
    let remote_source = args.source.contains("://");
    match args.backend {
        Backend::Bigquery => {
            let Some(project) = args.project.as_deref() else {
                return Err(ConfigError::Invalid("--project is required".to_string()).into());
            };
            let warehouse = BqCliWarehouse::new(
                args.bq_bin.clone(),
                project,
                args.location.clone(),
                args.schema.clone(),
            )?;
            Ok(Box::new(warehouse))
        }
        Backend::Postgres => {
            if remote_source {
                return Err(ConfigError::Invalid(format!(
                    "postgres backend loads local files only: {}",
                    args.source
                ))
                .into());
            }
            let Some(url) = args.database_url.as_deref() else {
                return Err(ConfigError::Invalid(
                    "--database-url (or DATABASE_URL) is required for postgres".to_string(),
                )
                .into());
            };
            let warehouse = PgWarehouse::connect_lazy(url).context("configuring postgres pool")?;
            Ok(Box::new(warehouse))
        }
        Backend::Local => {
            if remote_source {
                return Err(ConfigError::Invalid(format!(
                    "local backend loads local files only: {}",
                    args.source
                ))
                .into());
            }
            let Some(root) = &args.warehouse_dir else {
                return Err(
                    ConfigError::Invalid("--warehouse-dir is required for local".to_string())
                        .into(),
                );
            };
            Ok(Box::new(LocalWarehouse::new(root.clone())))
        }
    }
}

async fn upsert(args: UpsertArgs) -> Result<()> {
    let warehouse = build_warehouse(&args)?;
    let options = UpsertOptions {
        dataset: args.dataset,
        table: args.table,
        source: args.source,
        temp_suffix: args.temp_suffix,
        keep_temp: args.keep_temp,
        dry_run: args.dry_run,
        step_timeout: Duration::from_secs(args.command_timeout_secs),
    };

    let report = run_upsert(&*warehouse, &options).await?;
    if report.executed {
        info!(table = %report.target, staging = %report.staging_table, "upsert complete");
    } else {
        info!(table = %report.target, "dry run; no steps executed");
    }
    Ok(())
}
