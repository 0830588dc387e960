//! Production record types and the static dataset table.
//!
//! Raw payloads from the source are loosely typed JSON objects. The validator
//! maps them into [`ProductionRecord`] through the field aliases registered
//! for the dataset, coercing values leniently the same way for every field.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A record exactly as returned by the external source.
pub type RawRecord = Map<String, Value>;

/// Describes one record shape the pipeline knows how to ingest.
#[derive(Debug)]
pub struct DatasetSpec {
    pub name: &'static str,
    /// Source table or entity set the records come from.
    pub entity_set: &'static str,
    /// Columns forming the composite key, in key order.
    pub primary_key: &'static [&'static str],
    /// `(source_field, record_field)` pairs applied before typing.
    pub field_aliases: &'static [(&'static str, &'static str)],
}

impl DatasetSpec {
    /// Resolve a source field name to the record field it populates.
    pub fn canonical_field<'a>(&self, source_field: &'a str) -> &'a str {
        self.field_aliases
            .iter()
            .find(|(from, _)| *from == source_field)
            .map(|(_, to)| *to)
            .unwrap_or(source_field)
    }
}

pub const WELL_PRODUCTION: DatasetSpec = DatasetSpec {
    name: "well_production",
    entity_set: "WellProduction",
    primary_key: &["well_code", "field_code", "production_period"],
    field_aliases: &[
        ("_field_name", "field_name"),
        ("_well_reference", "well_reference"),
        ("FieldCode", "field_code"),
        ("WellCode", "well_code"),
        ("ProductionPeriod", "production_period"),
        ("DaysOnProduction", "days_on_production"),
    ],
};

/// Every dataset the service can ingest.
pub static DATASETS: &[&DatasetSpec] = &[&WELL_PRODUCTION];

pub fn dataset(name: &str) -> Option<&'static DatasetSpec> {
    DATASETS.iter().copied().find(|spec| spec.name == name)
}

/// `(well_code, field_code, production_period)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct CompositeKey {
    pub well_code: i64,
    pub field_code: i64,
    pub production_period: String,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.well_code, self.field_code, self.production_period
        )
    }
}

/// An accepted, typed production record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct ProductionRecord {
    pub well_code: i64,
    pub field_code: i64,
    pub production_period: String,
    pub field_name: Option<String>,
    pub well_reference: Option<String>,
    pub well_name: Option<String>,
    pub days_on_production: i64,
    pub oil_production_kbd: Option<f64>,
    pub gas_production_mmcfd: Option<f64>,
    pub liquids_production_kbd: Option<f64>,
    pub water_production_kbd: Option<f64>,
    pub data_source: Option<String>,
    pub source_data: Option<String>,
    pub partition_0: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductionRecord {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            well_code: self.well_code,
            field_code: self.field_code,
            production_period: self.production_period.clone(),
        }
    }

    /// Oil, liquids and water in thousand barrels per day; missing volumes
    /// count as zero.
    pub fn total_production_kbd(&self) -> f64 {
        self.oil_production_kbd.unwrap_or(0.0)
            + self.liquids_production_kbd.unwrap_or(0.0)
            + self.water_production_kbd.unwrap_or(0.0)
    }

    pub fn is_producing(&self) -> bool {
        self.days_on_production > 0
    }
}

/// Raw payload after alias mapping and lenient typing, before rule checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedRow {
    pub well_code: Option<i64>,
    pub field_code: Option<i64>,
    pub production_period: Option<String>,
    pub field_name: Option<String>,
    pub well_reference: Option<String>,
    pub well_name: Option<String>,
    pub days_on_production: Option<i64>,
    pub oil_production_kbd: Option<f64>,
    pub gas_production_mmcfd: Option<f64>,
    pub liquids_production_kbd: Option<f64>,
    pub water_production_kbd: Option<f64>,
    pub data_source: Option<String>,
    pub source_data: Option<String>,
    pub partition_0: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TypedRow {
    pub fn from_raw(spec: &DatasetSpec, raw: &RawRecord) -> Self {
        let mut row = TypedRow::default();

        for (source_field, value) in raw {
            match spec.canonical_field(source_field) {
                "well_code" => row.well_code = coerce_i64(value),
                "field_code" => row.field_code = coerce_i64(value),
                "production_period" => row.production_period = coerce_string(value),
                "field_name" => row.field_name = coerce_string(value),
                "well_reference" => row.well_reference = coerce_string(value),
                "well_name" => row.well_name = coerce_string(value),
                "days_on_production" => row.days_on_production = coerce_i64(value),
                "oil_production_kbd" => row.oil_production_kbd = coerce_f64(value),
                "gas_production_mmcfd" => row.gas_production_mmcfd = coerce_f64(value),
                "liquids_production_kbd" => row.liquids_production_kbd = coerce_f64(value),
                "water_production_kbd" => row.water_production_kbd = coerce_f64(value),
                "data_source" => row.data_source = coerce_string(value),
                "source_data" => row.source_data = coerce_string(value),
                "partition_0" => row.partition_0 = coerce_string(value),
                "created_at" => row.created_at = coerce_timestamp(value),
                "updated_at" => row.updated_at = coerce_timestamp(value),
                _ => {}
            }
        }

        row
    }

    /// Key fields as they appeared, for error reporting.
    pub fn key_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("well_code".into(), self.well_code.into());
        fields.insert("field_code".into(), self.field_code.into());
        fields.insert(
            "production_period".into(),
            self.production_period.clone().into(),
        );
        fields
    }

    /// Build the record; `None` if a key component or the day count is missing.
    pub fn into_record(self, now: DateTime<Utc>) -> Option<ProductionRecord> {
        Some(ProductionRecord {
            well_code: self.well_code?,
            field_code: self.field_code?,
            production_period: self.production_period?,
            field_name: self.field_name,
            well_reference: self.well_reference,
            well_name: self.well_name,
            days_on_production: self.days_on_production?,
            oil_production_kbd: self.oil_production_kbd,
            gas_production_mmcfd: self.gas_production_mmcfd,
            liquids_production_kbd: self.liquids_production_kbd,
            water_production_kbd: self.water_production_kbd,
            data_source: self.data_source,
            source_data: self.source_data,
            partition_0: self.partition_0,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
        })
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
