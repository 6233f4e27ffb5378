//! Reconciliation pipeline: snapshot reduction, address cache and geocoding.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use storegeo_adapters::AddressNormalizer;
use storegeo_core::{
    Chain, GeocodeFields, OutputRow, RawSnapshot, RowStamp, MISSING_ADDRESS_ERROR,
};
use storegeo_storage::{read_ndjson_from_spec, write_ndjson_atomic};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "storegeo-sync";

pub const DEFAULT_PROGRESS_EVERY: usize = 100;

/// Collapse snapshots to one per store id, keeping the latest capture.
///
/// Ties (including two unparsable timestamps) go to the later input row.
/// Snapshots without an id pass through after the keyed ones, in input order.
pub fn reduce_latest(snapshots: impl IntoIterator<Item = RawSnapshot>) -> Vec<RawSnapshot> {
    let mut slots: Vec<(Option<DateTime<Utc>>, RawSnapshot)> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut anonymous = Vec::new();

    for snapshot in snapshots {
        let Some(id) = snapshot.entity_id().map(str::to_string) else {
            anonymous.push(snapshot);
            continue;
        };
        let captured_at = snapshot.captured_at();
        match by_id.get(&id) {
            Some(&slot) => {
                if captured_at >= slots[slot].0 {
                    slots[slot] = (captured_at, snapshot);
                }
            }
            None => {
                by_id.insert(id, slots.len());
                slots.push((captured_at, snapshot));
            }
        }
    }

    slots
        .into_iter()
        .map(|(_, snapshot)| snapshot)
        .chain(anonymous)
        .collect()
}

/// Geocode results keyed by exact (whitespace-trimmed) raw address text.
#[derive(Debug, Clone, Default)]
pub struct AddressCache {
    entries: HashMap<String, GeocodeFields>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously written rows.
    ///
    /// Rows holding no geocoded value at all (capability failures, missing
    /// addresses) are not seeded so the next run retries them.
    pub fn seeded_from_rows<'a>(rows: impl IntoIterator<Item = &'a JsonValue>) -> Self {
        let mut cache = Self::new();
        let mut skipped = 0usize;
        for row in rows {
            if !cache.seed(row) {
                skipped += 1;
            }
        }
        debug!(entries = cache.len(), skipped, "seeded address cache");
        cache
    }

    /// Returns whether the row was accepted as a seed.
    pub fn seed(&mut self, row: &JsonValue) -> bool {
        let Some(key) = row
            .get("address_raw")
            .and_then(JsonValue::as_str)
            .and_then(Self::key)
        else {
            return false;
        };
        let fields = GeocodeFields::from_row_value(row);
        if !fields.carries_geocode() {
            return false;
        }
        self.entries.insert(key.to_string(), fields);
        true
    }

    pub fn key(address_raw: &str) -> Option<&str> {
        let trimmed = address_raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn get(&self, address_raw: &str) -> Option<&GeocodeFields> {
        Self::key(address_raw).and_then(|key| self.entries.get(key))
    }

    pub fn insert(&mut self, address_raw: &str, fields: GeocodeFields) {
        if let Some(key) = Self::key(address_raw) {
            self.entries.insert(key.to_string(), fields);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub processed: usize,
    pub total: usize,
    pub skipped_store_id: usize,
    pub cache_hits: usize,
    pub geocoded_new: usize,
    /// Output rows carrying an error, whether fresh or served from the cache.
    pub geocode_errors: usize,
    pub missing_address: usize,
}

pub trait ProgressObserver: Send {
    fn on_progress(&mut self, stats: &GeocodeStats);
}

#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&mut self, _stats: &GeocodeStats) {}
}

/// Logs a progress line on the first record, the last record, and every
/// `every` records in between.
#[derive(Debug)]
pub struct ProgressReporter {
    chain: Chain,
    every: usize,
    last_reported: usize,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(chain: Chain, every: usize) -> Self {
        Self {
            chain,
            every: every.max(1),
            last_reported: 0,
            started: Instant::now(),
        }
    }

    pub fn should_report(&mut self, stats: &GeocodeStats) -> bool {
        let due = stats.processed == stats.total
            || stats.processed == 1
            || stats.processed.saturating_sub(self.last_reported) >= self.every;
        if due {
            self.last_reported = stats.processed;
        }
        due
    }
}

impl ProgressObserver for ProgressReporter {
    fn on_progress(&mut self, stats: &GeocodeStats) {
        if !self.should_report(stats) {
            return;
        }
        let pct = if stats.total > 0 {
            format!("{:.1}", stats.processed as f64 * 100.0 / stats.total as f64)
        } else {
            "100.0".to_string()
        };
        info!(
            chain = %self.chain,
            processed = stats.processed,
            total = stats.total,
            pct = %pct,
            elapsed_secs = self.started.elapsed().as_secs(),
            cache_hits = stats.cache_hits,
            geocoded_new = stats.geocoded_new,
            geocode_errors = stats.geocode_errors,
            "progress"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeocodeOutcome {
    pub rows: Vec<OutputRow>,
    pub stats: GeocodeStats,
    pub interrupted: bool,
}

/// Turns canonical snapshots into output rows, one per identified store.
pub struct GeocodeStage<'a> {
    normalizer: &'a dyn AddressNormalizer,
    stamp: RowStamp,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> GeocodeStage<'a> {
    pub fn new(normalizer: &'a dyn AddressNormalizer, stamp: RowStamp) -> Self {
        Self {
            normalizer,
            stamp,
            cancel: None,
        }
    }

    /// Stop between records once `flag` is set; completed rows are kept.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub async fn run(
        &self,
        records: Vec<RawSnapshot>,
        cache: &mut AddressCache,
        progress: &mut dyn ProgressObserver,
    ) -> GeocodeOutcome {
        let mut outcome = GeocodeOutcome {
            rows: Vec::with_capacity(records.len()),
            stats: GeocodeStats {
                total: records.len(),
                ..GeocodeStats::default()
            },
            interrupted: false,
        };

        for record in &records {
            if self.cancelled() {
                outcome.interrupted = true;
                warn!(
                    processed = outcome.stats.processed,
                    total = outcome.stats.total,
                    "geocoding interrupted; keeping completed rows"
                );
                break;
            }
            if let Some(row) = self.process(record, cache, &mut outcome.stats).await {
                outcome.rows.push(row);
            }
            progress.on_progress(&outcome.stats);
        }

        outcome
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    async fn process(
        &self,
        record: &RawSnapshot,
        cache: &mut AddressCache,
        stats: &mut GeocodeStats,
    ) -> Option<OutputRow> {
        stats.processed += 1;

        let Some(store_id) = record.entity_id() else {
            stats.skipped_store_id += 1;
            return None;
        };

        let Some(address) = record.address() else {
            stats.missing_address += 1;
            stats.geocode_errors += 1;
            return Some(OutputRow::new(
                &self.stamp,
                store_id,
                None,
                GeocodeFields::failed(MISSING_ADDRESS_ERROR),
            ));
        };

        if let Some(cached) = cache.get(address) {
            stats.cache_hits += 1;
            if cached.geocode_error.is_some() {
                stats.geocode_errors += 1;
            }
            return Some(OutputRow::new(
                &self.stamp,
                store_id,
                Some(address.to_string()),
                cached.clone(),
            ));
        }

        let fields = match self.normalizer.normalize(address).await {
            Ok(result) => {
                stats.geocoded_new += 1;
                let fields = GeocodeFields::from_capability_result(&result);
                if fields.geocode_error.is_some() {
                    stats.geocode_errors += 1;
                }
                fields
            }
            Err(err) => {
                stats.geocode_errors += 1;
                debug!(store_id, address, error = %err, "normalizer failed");
                GeocodeFields::failed(err.to_string())
            }
        };
        cache.insert(address, fields.clone());

        Some(OutputRow::new(
            &self.stamp,
            store_id,
            Some(address.to_string()),
            fields,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct GeocodeRunConfig {
    pub chain: Chain,
    pub input: String,
    pub output: PathBuf,
    pub existing: Option<String>,
    pub geocode_engine: String,
    pub engine_version: Option<String>,
    pub progress_every: usize,
}

impl GeocodeRunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            bail!("input is required");
        }
        if self.output.as_os_str().is_empty() {
            bail!("output is required");
        }
        if self.geocode_engine.trim().is_empty() {
            bail!("geocode engine requires a value");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GeocodeRunSummary {
    pub run_id: Uuid,
    pub chain: Chain,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_files: usize,
    pub raw_rows: usize,
    pub reduced_rows: usize,
    pub seed_entries: usize,
    pub stats: GeocodeStats,
    pub rows_written: usize,
    pub output: Option<String>,
    pub output_sha256: Option<String>,
    pub interrupted: bool,
}

/// Read harvester output, reduce, geocode and write the output batch.
pub async fn run_geocode(
    config: &GeocodeRunConfig,
    normalizer: &dyn AddressNormalizer,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<GeocodeRunSummary> {
    config.validate()?;
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let scraped = read_ndjson_from_spec::<RawSnapshot>(&config.input, Some(config.chain))
        .context("reading harvester input")?;
    let raw_rows = scraped.rows.len();
    info!(%run_id, chain = %config.chain, files = scraped.files.len(), rows = raw_rows, "loaded harvester input");

    let mut cache = match &config.existing {
        Some(existing) => {
            let seeds = read_ndjson_from_spec::<JsonValue>(existing, None)
                .context("reading existing geocoded rows")?;
            AddressCache::seeded_from_rows(&seeds.rows)
        }
        None => AddressCache::new(),
    };
    let seed_entries = cache.len();

    let reduced = reduce_latest(scraped.rows);
    let reduced_rows = reduced.len();

    let stamp = RowStamp {
        chain: config.chain,
        geocode_engine: config.geocode_engine.clone(),
        engine_version: config.engine_version.clone(),
        geocoded_at: started_at,
    };
    let mut stage = GeocodeStage::new(normalizer, stamp);
    if let Some(flag) = cancel {
        stage = stage.with_cancel_flag(flag);
    }
    let mut reporter = ProgressReporter::new(config.chain, config.progress_every);
    let outcome = stage.run(reduced, &mut cache, &mut reporter).await;

    let written = write_ndjson_atomic(&config.output, &outcome.rows)
        .await
        .with_context(|| format!("writing {}", config.output.display()))?;
    if written.is_none() {
        warn!(output = %config.output.display(), "no rows produced; output file not written");
    }

    Ok(GeocodeRunSummary {
        run_id,
        chain: config.chain,
        started_at,
        finished_at: Utc::now(),
        input_files: scraped.files.len(),
        raw_rows,
        reduced_rows,
        seed_entries,
        stats: outcome.stats,
        rows_written: written.as_ref().map(|w| w.rows).unwrap_or(0),
        output: written.as_ref().map(|w| w.path.display().to_string()),
        output_sha256: written.map(|w| w.sha256),
        interrupted: outcome.interrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storegeo_core::MISSING_POINT_ERROR;

    fn snap(id: Option<&str>, at: &str, address: &str) -> RawSnapshot {
        RawSnapshot {
            store_id: id.map(str::to_string),
            address_raw: Some(address.to_string()),
            scraped_at: Some(at.to_string()),
            ..RawSnapshot::default()
        }
    }

    fn addresses(rows: &[RawSnapshot]) -> Vec<&str> {
        rows.iter().map(|r| r.address_raw.as_deref().unwrap()).collect()
    }

    #[test]
    fn latest_capture_wins_regardless_of_order() {
        let older = snap(Some("A"), "2026-02-11T00:00:00.000Z", "old");
        let newer = snap(Some("A"), "2026-02-11T01:00:00.000Z", "new");
        let other = snap(Some("B"), "2026-02-11T00:30:00.000Z", "b");

        let forward = reduce_latest(vec![older.clone(), newer.clone(), other.clone()]);
        let backward = reduce_latest(vec![newer, other, older]);
        assert_eq!(addresses(&forward), vec!["new", "b"]);
        assert_eq!(addresses(&backward), vec!["new", "b"]);
    }

    #[test]
    fn reduction_is_idempotent() {
        let input = vec![
            snap(Some("A"), "2026-02-11T00:00:00Z", "a1"),
            snap(Some("A"), "2026-02-11T00:00:00Z", "a2"),
            snap(None, "2026-02-11T00:00:00Z", "anon"),
        ];
        let once = reduce_latest(input);
        let twice = reduce_latest(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn ties_go_to_the_last_seen_snapshot() {
        let rows = reduce_latest(vec![
            snap(Some("A"), "2026-02-11T00:00:00Z", "first"),
            snap(Some("A"), "2026-02-11T00:00:00Z", "second"),
            snap(Some("B"), "garbage", "b-first"),
            snap(Some("B"), "also garbage", "b-second"),
        ]);
        assert_eq!(addresses(&rows), vec!["second", "b-second"]);
    }

    #[test]
    fn unparsable_timestamps_lose_to_parsable_ones() {
        let rows = reduce_latest(vec![
            snap(Some("A"), "2020-01-01T00:00:00Z", "dated"),
            snap(Some("A"), "not a date", "undated"),
        ]);
        assert_eq!(addresses(&rows), vec!["dated"]);
    }

    #[test]
    fn anonymous_snapshots_pass_through_after_keyed_ones() {
        let rows = reduce_latest(vec![
            snap(None, "2026-02-11T00:00:00Z", "anon-1"),
            snap(Some("A"), "2026-02-11T00:00:00Z", "a"),
            snap(Some("  "), "2026-02-11T00:00:00Z", "anon-2"),
            snap(None, "2026-02-11T00:00:00Z", "anon-1"),
        ]);
        assert_eq!(addresses(&rows), vec!["a", "anon-1", "anon-2", "anon-1"]);
    }

    #[test]
    fn cache_keys_are_trimmed_but_otherwise_exact() {
        let mut cache = AddressCache::new();
        cache.insert(" 東京都千代田区1-1 ", GeocodeFields::failed("x"));
        assert!(cache.get("東京都千代田区1-1").is_some());
        assert!(cache.get("東京都千代田区１－１").is_none());
        assert!(cache.get("   ").is_none());
    }

    #[test]
    fn seeding_recoerces_numbers_and_skips_empty_results() {
        let rows = vec![
            json!({"address_raw": "A", "point_lat": "35.5", "point_lng": 139.0, "level": "8.0"}),
            json!({"address_raw": "B", "point_lat": "oops", "geocode_error": "timeout"}),
            json!({"address_raw": "", "point_lat": 1.0}),
            json!({"address_raw": "C", "address_norm": "C町", "geocode_error": "point is missing"}),
        ];
        let cache = AddressCache::seeded_from_rows(&rows);
        assert_eq!(cache.len(), 2);
        let a = cache.get("A").unwrap();
        assert_eq!(a.point_lat, Some(35.5));
        assert_eq!(a.level, Some(8));
        assert!(cache.get("B").is_none());
        assert_eq!(
            cache.get("C").unwrap().geocode_error.as_deref(),
            Some("point is missing")
        );
    }

    #[test]
    fn seeds_with_unusable_coordinates_carry_the_missing_point_error() {
        let rows = vec![json!({
            "address_raw": "東京都X",
            "point_lat": "oops",
            "point_lng": 139.0,
            "level": 8,
            "geocode_error": null
        })];
        let cache = AddressCache::seeded_from_rows(&rows);
        let cached = cache.get("東京都X").unwrap();
        assert_eq!(cached.point_lat, None);
        assert_eq!(cached.point_lng, Some(139.0));
        assert_eq!(cached.geocode_error.as_deref(), Some(MISSING_POINT_ERROR));
    }

    #[test]
    fn reporter_logs_first_last_and_every_interval() {
        let mut reporter = ProgressReporter::new(Chain::Lawson, 100);
        let mut reported = Vec::new();
        for processed in 1..=250 {
            let stats = GeocodeStats {
                processed,
                total: 250,
                ..GeocodeStats::default()
            };
            if reporter.should_report(&stats) {
                reported.push(processed);
            }
        }
        assert_eq!(reported, vec![1, 101, 201, 250]);
    }
}
