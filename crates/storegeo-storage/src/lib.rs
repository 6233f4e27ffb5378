//! Line-delimited JSON file handling + HTTP fetch utilities for storegeo.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use storegeo_core::Chain;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "storegeo-storage";

const NDJSON_EXTENSION: &str = ".ndjson";
const ANY_STORE_PREFIX: &str = "stores_";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Split a comma-separated input spec, dropping blank parts.
pub fn split_input_specs(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand an input spec into concrete files.
///
/// Plain files are taken as-is. Directories contribute their `*.ndjson` files
/// whose name contains the chain prefix (or `stores_` when no chain is given),
/// sorted by name.
pub fn resolve_input_files(input: &str, chain: Option<Chain>) -> anyhow::Result<Vec<PathBuf>> {
    let prefix = chain
        .map(|c| c.file_prefix())
        .unwrap_or_else(|| ANY_STORE_PREFIX.to_string());
    let mut files = Vec::new();

    for spec in split_input_specs(input) {
        let path = PathBuf::from(&spec);
        let meta = std::fs::metadata(&path).with_context(|| format!("input not found: {spec}"))?;
        if meta.is_file() {
            files.push(path);
            continue;
        }
        if !meta.is_dir() {
            bail!("unsupported input type: {spec}");
        }

        let mut names = std::fs::read_dir(&path)
            .with_context(|| format!("reading directory {}", path.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(NDJSON_EXTENSION) && name.contains(&prefix))
            .collect::<Vec<_>>();
        names.sort();
        files.extend(names.into_iter().map(|name| path.join(name)));
    }

    Ok(files)
}

/// Parse every non-blank line of a line-delimited JSON file.
pub fn read_ndjson_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<Vec<T>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(line)
            .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct NdjsonBatch<T> {
    pub files: Vec<PathBuf>,
    pub rows: Vec<T>,
}

pub fn read_ndjson_from_spec<T: DeserializeOwned>(
    input: &str,
    chain: Option<Chain>,
) -> anyhow::Result<NdjsonBatch<T>> {
    let files = resolve_input_files(input, chain)?;
    let mut rows = Vec::new();
    for file in &files {
        rows.extend(read_ndjson_file::<T>(file)?);
    }
    Ok(NdjsonBatch { files, rows })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBatch {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: usize,
    pub sha256: String,
}

pub fn encode_ndjson<T: Serialize>(rows: &[T]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row).context("serializing ndjson row")?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Write rows as line-delimited JSON via temp-file rename.
///
/// An empty batch writes nothing and returns `None`.
pub async fn write_ndjson_atomic<T: Serialize>(
    path: impl AsRef<Path>,
    rows: &[T],
) -> anyhow::Result<Option<WrittenBatch>> {
    let path = path.as_ref();
    if rows.is_empty() {
        debug!(path = %path.display(), "no rows; skipping output file");
        return Ok(None);
    }

    let bytes = encode_ndjson(rows)?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp output {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(Some(WrittenBatch {
        path: path.to_path_buf(),
        rows: rows.len(),
        bytes: bytes.len(),
        sha256: sha256_hex(&bytes),
    }))
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
            max_retries: 3,
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
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("storegeo/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Bounded, retrying JSON client for network-backed collaborators.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
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
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_json_inner(url, query).instrument(span).await
    }

    async fn get_json_inner(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut attempt = 0usize;
        loop {
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
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
                        debug!(error = %err, attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
