//! Core domain model for the store geocoding pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "storegeo-core";

pub const DEFAULT_GEOCODE_ENGINE: &str = "geolonia/normalize-japanese-addresses";

pub const MISSING_ADDRESS_ERROR: &str = "address_raw is missing";
pub const MISSING_POINT_ERROR: &str = "point is missing";
pub const GEOCODE_FAILED_ERROR: &str = "geocode failed";

/// Store chains with a harvester feeding this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Chain {
    #[serde(rename = "7eleven")]
    SevenEleven,
    #[serde(rename = "lawson")]
    Lawson,
    #[serde(rename = "familymart")]
    FamilyMart,
    #[serde(rename = "daily_yamazaki")]
    DailyYamazaki,
    #[serde(rename = "michi_no_eki")]
    MichiNoEki,
    #[serde(rename = "ministop")]
    Ministop,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::SevenEleven,
        Chain::Lawson,
        Chain::FamilyMart,
        Chain::DailyYamazaki,
        Chain::MichiNoEki,
        Chain::Ministop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::SevenEleven => "7eleven",
            Chain::Lawson => "lawson",
            Chain::FamilyMart => "familymart",
            Chain::DailyYamazaki => "daily_yamazaki",
            Chain::MichiNoEki => "michi_no_eki",
            Chain::Ministop => "ministop",
        }
    }

    /// Harvester output files for this chain contain this prefix in their name.
    pub fn file_prefix(&self) -> String {
        format!("stores_{}", self.as_str())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid chain: {0}")]
pub struct UnknownChain(pub String);

impl FromStr for Chain {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Chain::ALL
            .into_iter()
            .find(|chain| chain.as_str() == needle)
            .ok_or_else(|| UnknownChain(s.to_string()))
    }
}

/// One harvester observation of one store.
///
/// Only the three fields the pipeline reasons about are typed; everything else
/// the harvester emitted (names, phone numbers, `payload_json`, ...) rides along
/// untouched in `attributes`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(default, deserialize_with = "de_identifier")]
    pub store_id: Option<String>,
    #[serde(default, deserialize_with = "de_text")]
    pub address_raw: Option<String>,
    #[serde(default, deserialize_with = "de_text")]
    pub scraped_at: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

impl RawSnapshot {
    /// Trimmed store identifier, `None` for anonymous snapshots.
    pub fn entity_id(&self) -> Option<&str> {
        non_blank(self.store_id.as_deref())
    }

    pub fn address(&self) -> Option<&str> {
        non_blank(self.address_raw.as_deref())
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.scraped_at.as_deref().and_then(parse_timestamp)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn de_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(s)) => Some(s),
        _ => None,
    })
}

/// Parse a harvester capture timestamp. Zone-less forms are read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Accept a value as a number only if it is (or spells) a finite number.
pub fn coerce_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

pub fn coerce_int(value: &JsonValue) -> Option<i64> {
    coerce_number(value).map(|n| n.trunc() as i64)
}

/// A JSON pointer-ish path into a capability result, e.g. `["point", "lat"]`.
pub type FieldPath = &'static [&'static str];

pub const LATITUDE_RULES: &[FieldPath] = &[
    &["point", "lat"],
    &["point", "latitude"],
    &["lat"],
    &["latitude"],
];

pub const LONGITUDE_RULES: &[FieldPath] = &[
    &["point", "lng"],
    &["point", "lon"],
    &["point", "longitude"],
    &["lng"],
    &["lon"],
    &["longitude"],
];

// The administrative `level` is deliberately absent here.
pub const POINT_LEVEL_RULES: &[FieldPath] = &[&["point", "level"], &["pointLevel"]];

pub const LEVEL_RULES: &[FieldPath] = &[&["level"]];

const ADDRESS_COMPONENTS: [&str; 5] = ["pref", "city", "town", "addr", "other"];

pub fn lookup<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

/// Try each rule in order; the first one resolving to a finite number wins.
pub fn first_number(value: &JsonValue, rules: &[FieldPath]) -> Option<f64> {
    rules
        .iter()
        .find_map(|path| lookup(value, path).and_then(coerce_number))
}

pub fn first_int(value: &JsonValue, rules: &[FieldPath]) -> Option<i64> {
    rules
        .iter()
        .find_map(|path| lookup(value, path).and_then(coerce_int))
}

fn string_field(value: &JsonValue, key: &str) -> Option<String> {
    value.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

pub fn normalized_address(result: &JsonValue) -> Option<String> {
    let joined = ADDRESS_COMPONENTS
        .iter()
        .filter_map(|key| result.get(key).and_then(JsonValue::as_str))
        .map(str::trim)
        .collect::<String>();
    if !joined.is_empty() {
        return Some(joined);
    }
    result
        .get("address")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolved geography for one raw address, successful or not.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeocodeFields {
    pub address_norm: Option<String>,
    pub point_lat: Option<f64>,
    pub point_lng: Option<f64>,
    pub level: Option<i64>,
    pub point_level: Option<i64>,
    pub geocode_error: Option<String>,
    pub pref: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub addr: Option<String>,
    pub other: Option<String>,
}

impl GeocodeFields {
    /// All geography null, with the given reason.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            GEOCODE_FAILED_ERROR.to_string()
        } else {
            message
        };
        Self {
            geocode_error: Some(message),
            ..Self::default()
        }
    }

    /// Interpret a successful capability result.
    pub fn from_capability_result(result: &JsonValue) -> Self {
        let mut fields = Self {
            address_norm: normalized_address(result),
            point_lat: first_number(result, LATITUDE_RULES),
            point_lng: first_number(result, LONGITUDE_RULES),
            level: first_int(result, LEVEL_RULES),
            point_level: first_int(result, POINT_LEVEL_RULES),
            geocode_error: None,
            pref: string_field(result, "pref"),
            city: string_field(result, "city"),
            town: string_field(result, "town"),
            addr: string_field(result, "addr"),
            other: string_field(result, "other"),
        };
        if !fields.has_point() {
            fields.geocode_error = Some(MISSING_POINT_ERROR.to_string());
        }
        fields
    }

    /// Rebuild fields from a previously written row, re-coercing numerics.
    ///
    /// A row whose coordinates do not survive coercion gets the missing-point
    /// error unless it already carries one.
    pub fn from_row_value(row: &JsonValue) -> Self {
        let number = |key: &str| row.get(key).and_then(coerce_number);
        let int = |key: &str| row.get(key).and_then(coerce_int);
        let mut fields = Self {
            address_norm: string_field(row, "address_norm"),
            point_lat: number("point_lat"),
            point_lng: number("point_lng"),
            level: int("level"),
            point_level: int("point_level"),
            geocode_error: string_field(row, "geocode_error"),
            pref: string_field(row, "pref"),
            city: string_field(row, "city"),
            town: string_field(row, "town"),
            addr: string_field(row, "addr"),
            other: string_field(row, "other"),
        };
        if !fields.has_point() && fields.geocode_error.is_none() {
            fields.geocode_error = Some(MISSING_POINT_ERROR.to_string());
        }
        fields
    }

    pub fn has_point(&self) -> bool {
        self.point_lat.is_some() && self.point_lng.is_some()
    }

    /// True when the geocoder produced anything beyond an error message.
    pub fn carries_geocode(&self) -> bool {
        self.address_norm.is_some()
            || self.point_lat.is_some()
            || self.point_lng.is_some()
            || self.level.is_some()
            || self.point_level.is_some()
    }
}

/// Per-run constants stamped onto every output row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowStamp {
    pub chain: Chain,
    pub geocode_engine: String,
    pub engine_version: Option<String>,
    pub geocoded_at: DateTime<Utc>,
}

/// One canonical store joined with its geocode result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputRow {
    pub chain: Chain,
    pub store_id: String,
    pub address_raw: Option<String>,
    pub address_norm: Option<String>,
    pub point_lat: Option<f64>,
    pub point_lng: Option<f64>,
    pub level: Option<i64>,
    pub point_level: Option<i64>,
    pub geocode_engine: String,
    pub engine_version: Option<String>,
    #[serde(with = "iso_millis")]
    pub geocoded_at: DateTime<Utc>,
    pub geocode_error: Option<String>,
    pub pref: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub addr: Option<String>,
    pub other: Option<String>,
}

impl OutputRow {
    pub fn new(
        stamp: &RowStamp,
        store_id: impl Into<String>,
        address_raw: Option<String>,
        fields: GeocodeFields,
    ) -> Self {
        Self {
            chain: stamp.chain,
            store_id: store_id.into(),
            address_raw,
            address_norm: fields.address_norm,
            point_lat: fields.point_lat,
            point_lng: fields.point_lng,
            level: fields.level,
            point_level: fields.point_level,
            geocode_engine: stamp.geocode_engine.clone(),
            engine_version: stamp.engine_version.clone(),
            geocoded_at: stamp.geocoded_at,
            geocode_error: fields.geocode_error,
            pref: fields.pref,
            city: fields.city,
            town: fields.town,
            addr: fields.addr,
            other: fields.other,
        }
    }

    pub fn fields(&self) -> GeocodeFields {
        GeocodeFields {
            address_norm: self.address_norm.clone(),
            point_lat: self.point_lat,
            point_lng: self.point_lng,
            level: self.level,
            point_level: self.point_level,
            geocode_error: self.geocode_error.clone(),
            pref: self.pref.clone(),
            city: self.city.clone(),
            town: self.town.clone(),
            addr: self.addr.clone(),
            other: self.other.clone(),
        }
    }
}

/// RFC 3339 UTC timestamps with millisecond precision and a `Z` suffix.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    String,
    Float,
    Integer,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

const fn column(name: &'static str, kind: ColumnKind, required: bool) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        required,
    }
}

/// Warehouse row layout, in `OutputRow` serialization order.
pub const WAREHOUSE_COLUMNS: [ColumnSpec; 17] = [
    column("chain", ColumnKind::String, true),
    column("store_id", ColumnKind::String, true),
    column("address_raw", ColumnKind::String, false),
    column("address_norm", ColumnKind::String, false),
    column("point_lat", ColumnKind::Float, false),
    column("point_lng", ColumnKind::Float, false),
    column("level", ColumnKind::Integer, false),
    column("point_level", ColumnKind::Integer, false),
    column("geocode_engine", ColumnKind::String, false),
    column("engine_version", ColumnKind::String, false),
    column("geocoded_at", ColumnKind::Timestamp, false),
    column("geocode_error", ColumnKind::String, false),
    column("pref", ColumnKind::String, false),
    column("city", ColumnKind::String, false),
    column("town", ColumnKind::String, false),
    column("addr", ColumnKind::String, false),
    column("other", ColumnKind::String, false),
];

pub const KEY_COLUMNS: [&str; 2] = ["chain", "store_id"];

pub fn column_names() -> Vec<&'static str> {
    WAREHOUSE_COLUMNS.iter().map(|c| c.name).collect()
}
