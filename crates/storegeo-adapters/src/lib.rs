//! Geocoding capability contracts + concrete normalizer adapters.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use storegeo_storage::{FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "storegeo-adapters";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// The pluggable address normalization engine.
///
/// A successful result is the engine's raw JSON; interpreting it is left to
/// the extraction rules in `storegeo-core`.
#[async_trait]
pub trait AddressNormalizer: Send + Sync {
    async fn normalize(&self, address_raw: &str) -> Result<JsonValue, NormalizeError>;
}

#[derive(Debug, Clone)]
pub struct HttpNormalizerConfig {
    pub endpoint: String,
    /// Forwarded to the service so it resolves against alternate backing data.
    pub japanese_addresses_api: Option<String>,
    pub http: HttpClientConfig,
}

/// Normalizer backed by an HTTP service answering
/// `GET <endpoint>?address=...[&japanese_addresses_api=...]` with a JSON object.
#[derive(Debug)]
pub struct HttpAddressNormalizer {
    endpoint: String,
    japanese_addresses_api: Option<String>,
    http: HttpFetcher,
}

impl HttpAddressNormalizer {
    pub fn new(config: HttpNormalizerConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim().to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("geocoder endpoint must be an http(s) URL: {endpoint}");
        }
        Ok(Self {
            endpoint,
            japanese_addresses_api: config.japanese_addresses_api,
            http: HttpFetcher::new(config.http)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AddressNormalizer for HttpAddressNormalizer {
    async fn normalize(&self, address_raw: &str) -> Result<JsonValue, NormalizeError> {
        let mut query = vec![("address", address_raw)];
        if let Some(api) = &self.japanese_addresses_api {
            query.push(("japanese_addresses_api", api.as_str()));
        }
        let body = self.http.get_json(&self.endpoint, &query).await?;
        interpret_service_body(body)
    }
}

fn interpret_service_body(body: JsonValue) -> Result<JsonValue, NormalizeError> {
    match body {
        JsonValue::Null => Ok(JsonValue::Object(Default::default())),
        JsonValue::Object(map) => {
            if let Some(message) = map.get("error").and_then(JsonValue::as_str) {
                return Err(NormalizeError::Message(message.to_string()));
            }
            match map.get("result") {
                Some(JsonValue::Object(inner)) => Ok(JsonValue::Object(inner.clone())),
                _ => Ok(JsonValue::Object(map)),
            }
        }
        other => Err(NormalizeError::Message(format!(
            "unexpected normalizer response: {other}"
        ))),
    }
}

/// Offline normalizer answering from a JSON object keyed by raw address.
#[derive(Debug, Clone, Default)]
pub struct FixtureNormalizer {
    results: HashMap<String, JsonValue>,
}

impl FixtureNormalizer {
    pub fn new(results: HashMap<String, JsonValue>) -> Self {
        Self { results }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let results: HashMap<String, JsonValue> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), entries = results.len(), "loaded normalizer fixture");
        Ok(Self::new(results))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl AddressNormalizer for FixtureNormalizer {
    async fn normalize(&self, address_raw: &str) -> Result<JsonValue, NormalizeError> {
        self.results
            .get(address_raw)
            .cloned()
            .ok_or_else(|| NormalizeError::Message(format!("no fixture for address: {address_raw}")))
    }
}
