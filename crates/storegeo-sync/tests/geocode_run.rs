use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value as JsonValue};
use storegeo_adapters::{AddressNormalizer, NormalizeError};
use storegeo_core::{Chain, OutputRow, RawSnapshot, RowStamp, DEFAULT_GEOCODE_ENGINE};
use storegeo_storage::read_ndjson_file;
use storegeo_sync::{
    run_geocode, AddressCache, GeocodeRunConfig, GeocodeStage, GeocodeStats, NoProgress,
    ProgressObserver,
};
use tempfile::tempdir;

#[derive(Default)]
struct CountingNormalizer {
    calls: AtomicUsize,
    fail_with: Option<String>,
}

#[async_trait]
impl AddressNormalizer for CountingNormalizer {
    async fn normalize(&self, address_raw: &str) -> Result<JsonValue, NormalizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(NormalizeError::Message(message.clone()));
        }
        Ok(json!({
            "pref": "東京都",
            "city": "千代田区",
            "addr": address_raw,
            "level": 3,
            "point": {"lat": 35.68, "lng": 139.76, "level": 1}
        }))
    }
}

#[derive(Default)]
struct RecordingProgress {
    seen: Vec<GeocodeStats>,
}

impl ProgressObserver for RecordingProgress {
    fn on_progress(&mut self, stats: &GeocodeStats) {
        self.seen.push(*stats);
    }
}

fn stamp() -> RowStamp {
    RowStamp {
        chain: Chain::Lawson,
        geocode_engine: DEFAULT_GEOCODE_ENGINE.to_string(),
        engine_version: Some("test".to_string()),
        geocoded_at: Utc.with_ymd_and_hms(2026, 2, 11, 12, 0, 0).unwrap(),
    }
}

fn snapshot(value: JsonValue) -> RawSnapshot {
    serde_json::from_value(value).expect("snapshot")
}

fn write_lines(path: &Path, rows: &[JsonValue]) {
    let text = rows
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(path, format!("{text}\n")).expect("write fixture");
}

fn config(input: &Path, output: &Path, existing: Option<&Path>) -> GeocodeRunConfig {
    GeocodeRunConfig {
        chain: Chain::Lawson,
        input: input.display().to_string(),
        output: output.to_path_buf(),
        existing: existing.map(|p| p.display().to_string()),
        geocode_engine: DEFAULT_GEOCODE_ENGINE.to_string(),
        engine_version: Some("test".to_string()),
        progress_every: 100,
    }
}

#[tokio::test]
async fn existing_rows_short_circuit_the_normalizer() {
    let dir = tempdir().expect("tempdir");
    let input_dir = dir.path().join("lawson");
    let existing_dir = dir.path().join("geocoded");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::create_dir_all(&existing_dir).unwrap();

    write_lines(
        &input_dir.join("stores_lawson_pref_13.ndjson"),
        &[json!({"store_id": "100", "address_raw": "東京都千代田区1-1", "scraped_at": "2026-02-11T00:00:00.000Z"})],
    );
    write_lines(
        &existing_dir.join("stores_geocoded_lawson.ndjson"),
        &[json!({
            "address_raw": "東京都千代田区1-1",
            "address_norm": "東京都千代田区1-1",
            "point_lat": 35.0,
            "point_lng": 139.0,
            "level": 8,
            "point_level": 8,
            "geocode_error": null,
            "pref": "東京都",
            "city": "千代田区",
            "town": null,
            "addr": "1-1",
            "other": null
        })],
    );

    let output = dir.path().join("out").join("stores_geocoded_lawson.ndjson");
    let normalizer = CountingNormalizer::default();
    let summary = run_geocode(&config(&input_dir, &output, Some(&existing_dir)), &normalizer, None)
        .await
        .expect("run");

    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.stats.cache_hits, 1);
    assert_eq!(summary.rows_written, 1);

    let rows: Vec<OutputRow> = read_ndjson_file(&output).expect("output parses");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].point_lat, Some(35.0));
    assert_eq!(rows[0].point_lng, Some(139.0));
    assert_eq!(rows[0].address_norm.as_deref(), Some("東京都千代田区1-1"));
    assert_eq!(rows[0].engine_version.as_deref(), Some("test"));
}

#[tokio::test]
async fn missing_addresses_never_reach_the_normalizer() {
    let normalizer = CountingNormalizer::default();
    let stage = GeocodeStage::new(&normalizer, stamp());
    let mut cache = AddressCache::new();
    let records = vec![snapshot(json!({"store_id": "100", "address_raw": null}))];

    let outcome = stage.run(records, &mut cache, &mut NoProgress).await;

    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0].geocode_error.as_deref(), Some("address_raw is missing"));
    assert_eq!(outcome.rows[0].point_lat, None);
    assert_eq!(outcome.rows[0].point_lng, None);
    assert_eq!(outcome.stats.missing_address, 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn repeated_addresses_in_one_run_are_geocoded_once() {
    let normalizer = CountingNormalizer::default();
    let stage = GeocodeStage::new(&normalizer, stamp());
    let mut cache = AddressCache::new();
    let records = vec![
        snapshot(json!({"store_id": "1", "address_raw": "大阪府大阪市北区1"})),
        snapshot(json!({"store_id": "2", "address_raw": " 大阪府大阪市北区1 "})),
    ];

    let outcome = stage.run(records, &mut cache, &mut NoProgress).await;

    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.stats.geocoded_new, 1);
    assert_eq!(outcome.stats.cache_hits, 1);
    assert_eq!(outcome.rows[0].fields(), outcome.rows[1].fields());
    assert_eq!(outcome.rows[1].address_raw.as_deref(), Some("大阪府大阪市北区1"));
    assert_eq!(outcome.rows[0].point_level, Some(1));
    assert_eq!(outcome.rows[0].level, Some(3));
}

#[tokio::test]
async fn normalizer_failures_are_folded_into_rows_and_cached_for_the_run() {
    let normalizer = CountingNormalizer {
        fail_with: Some("upstream timeout".to_string()),
        ..CountingNormalizer::default()
    };
    let stage = GeocodeStage::new(&normalizer, stamp());
    let mut cache = AddressCache::new();
    let records = vec![
        snapshot(json!({"store_id": "1", "address_raw": "不明な住所"})),
        snapshot(json!({"store_id": "2", "address_raw": "不明な住所"})),
    ];

    let outcome = stage.run(records, &mut cache, &mut NoProgress).await;

    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.rows.len(), 2);
    for row in &outcome.rows {
        assert_eq!(row.geocode_error.as_deref(), Some("upstream timeout"));
        assert_eq!(row.point_lat, None);
    }
    assert_eq!(outcome.stats.geocode_errors, 2);
    assert_eq!(outcome.stats.cache_hits, 1);
    assert_eq!(outcome.stats.geocoded_new, 0);
}

#[tokio::test]
async fn cache_hits_on_seeds_with_a_broken_point_report_the_missing_point() {
    let normalizer = CountingNormalizer::default();
    let stage = GeocodeStage::new(&normalizer, stamp());
    let seeds = vec![json!({
        "address_raw": "東京都X",
        "point_lat": "oops",
        "point_lng": 139.0,
        "level": 8,
        "geocode_error": null
    })];
    let mut cache = AddressCache::seeded_from_rows(&seeds);
    let records = vec![snapshot(json!({"store_id": "9", "address_raw": "東京都X"}))];

    let outcome = stage.run(records, &mut cache, &mut NoProgress).await;

    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 0);
    let row = &outcome.rows[0];
    assert_eq!(row.point_lat, None);
    assert_eq!(row.point_lng, Some(139.0));
    assert_eq!(row.geocode_error.as_deref(), Some("point is missing"));
    assert_eq!(outcome.stats.cache_hits, 1);
    assert_eq!(outcome.stats.geocode_errors, 1);
}

#[tokio::test]
async fn stores_without_ids_are_skipped_and_counted() {
    let normalizer = CountingNormalizer::default();
    let stage = GeocodeStage::new(&normalizer, stamp());
    let mut cache = AddressCache::new();
    let mut progress = RecordingProgress::default();
    let records = vec![
        snapshot(json!({"address_raw": "東京都港区1"})),
        snapshot(json!({"store_id": "7", "address_raw": "東京都港区2"})),
    ];

    let outcome = stage.run(records, &mut cache, &mut progress).await;

    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0].store_id, "7");
    assert_eq!(outcome.stats.skipped_store_id, 1);
    assert_eq!(progress.seen.len(), 2);
    assert_eq!(progress.seen[0].processed, 1);
    assert_eq!(progress.seen[1].processed, 2);
    assert_eq!(progress.seen[1].total, 2);
}

#[tokio::test]
async fn cancelled_runs_stop_between_records() {
    let normalizer = CountingNormalizer::default();
    let flag = Arc::new(AtomicBool::new(true));
    let stage = GeocodeStage::new(&normalizer, stamp()).with_cancel_flag(flag);
    let mut cache = AddressCache::new();
    let records = vec![snapshot(json!({"store_id": "1", "address_raw": "東京都"}))];

    let outcome = stage.run(records, &mut cache, &mut NoProgress).await;

    assert!(outcome.interrupted);
    assert!(outcome.rows.is_empty());
    assert_eq!(normalizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn latest_snapshot_is_geocoded_and_empty_runs_write_nothing() {
    let dir = tempdir().expect("tempdir");
    let input = dir.path().join("stores_lawson_pref_01.ndjson");
    write_lines(
        &input,
        &[
            json!({"store_id": "A", "scraped_at": "2026-02-11T01:00:00.000Z", "address_raw": "新住所"}),
            json!({"store_id": "A", "scraped_at": "2026-02-11T00:00:00.000Z", "address_raw": "旧住所"}),
        ],
    );
    let output = dir.path().join("geocoded.ndjson");
    let normalizer = CountingNormalizer::default();
    let summary = run_geocode(&config(&input, &output, None), &normalizer, None)
        .await
        .expect("run");

    assert_eq!(summary.raw_rows, 2);
    assert_eq!(summary.reduced_rows, 1);
    assert!(summary.output_sha256.is_some());
    let rows: Vec<OutputRow> = read_ndjson_file(&output).expect("output parses");
    assert_eq!(rows[0].address_raw.as_deref(), Some("新住所"));

    let anonymous_only = dir.path().join("stores_lawson_pref_02.ndjson");
    write_lines(&anonymous_only, &[json!({"address_raw": "どこか"})]);
    let empty_output = dir.path().join("empty.ndjson");
    let summary = run_geocode(&config(&anonymous_only, &empty_output, None), &normalizer, None)
        .await
        .expect("run");
    assert_eq!(summary.rows_written, 0);
    assert!(summary.output.is_none());
    assert!(!empty_output.exists());
}
