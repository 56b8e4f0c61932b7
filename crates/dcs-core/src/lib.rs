//! Core domain model for the daily catalog snapshot pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dcs-core";

/// Nested rating object as the catalog source ships it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rating {
    pub rate: Option<f64>,
    pub count: Option<i64>,
}

/// One externally-sourced catalog item, exactly as fetched.
///
/// Every field is optional: the source assigns ids but guarantees nothing,
/// and the schema validator (not the deserializer) decides whether a payload
/// has drifted. `fields` keeps the raw object as fetched, nulls included,
/// so the validator can tell an explicitly-null field (present, value
/// unusable) apart from a missing one (structural drift).
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(from = "Map<String, JsonValue>")]
pub struct RawRecord {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub rating: Option<Rating>,
    pub fields: Map<String, JsonValue>,
}

impl From<Map<String, JsonValue>> for RawRecord {
    fn from(fields: Map<String, JsonValue>) -> Self {
        let rating = fields
            .get("rating")
            .and_then(JsonValue::as_object)
            .map(|rating| Rating {
                rate: rating.get("rate").and_then(JsonValue::as_f64),
                count: rating.get("count").and_then(JsonValue::as_i64),
            });
        Self {
            id: fields.get("id").and_then(JsonValue::as_i64),
            title: fields
                .get("title")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            category: fields
                .get("category")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            price: fields.get("price").and_then(JsonValue::as_f64),
            rating,
            fields,
        }
    }
}

/// A record that passed every quality rule, stamped with the fetch date.
///
/// Fields a rule guards are concrete; fields no rule touches stay optional
/// and are persisted as NULL when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub category: String,
    pub price: f64,
    pub rating_rate: f64,
    pub rating_count: Option<i64>,
    pub fetch_date: NaiveDate,
}

/// Per-rule rejection counters for one cleaning pass.
///
/// Rules narrow the batch sequentially (price, category, rating, duplicate),
/// so each rejected record is attributed to exactly one counter: the first
/// rule that rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QualityMetrics {
    pub raw_records: u64,
    pub invalid_price: u64,
    pub invalid_category: u64,
    pub invalid_rating: u64,
    pub duplicates_removed: u64,
    pub clean_records: u64,
}

impl QualityMetrics {
    /// Total records rejected across all rules.
    pub fn rejected(&self) -> u64 {
        self.invalid_price + self.invalid_category + self.invalid_rating + self.duplicates_removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Success,
    Skipped,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of one pipeline invocation, handed read-only to
/// downstream consumers (dashboard, email notifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub status: PipelineStatus,
    pub timestamp: DateTime<Utc>,
    pub records_fetched: u64,
    pub records_stored: u64,
    pub quality_metrics: QualityMetrics,
    pub error_message: Option<String>,
}

impl PipelineResult {
    /// A fresh result in its initial (pessimistic) state.
    pub fn started() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: PipelineStatus::Failed,
            timestamp: Utc::now(),
            records_fetched: 0,
            records_stored: 0,
            quality_metrics: QualityMetrics::default(),
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_tolerates_missing_and_extra_fields() {
        let record: RawRecord = serde_json::from_str(
            r#"{"id": 7, "price": 9.99, "description": "unused", "image": "x.png"}"#,
        )
        .expect("parse");
        assert_eq!(record.id, Some(7));
        assert_eq!(record.price, Some(9.99));
        assert!(record.title.is_none());
        assert!(record.rating.is_none());
        assert!(record.fields.contains_key("description"));
        assert!(record.fields.contains_key("image"));
    }

    #[test]
    fn explicit_null_stays_in_the_field_map() {
        let record: RawRecord =
            serde_json::from_str(r#"{"id": 3, "price": null, "title": "Widget"}"#).expect("parse");
        assert_eq!(record.id, Some(3));
        assert!(record.price.is_none());
        // Null and missing must stay distinguishable for the drift probe.
        assert!(record.fields.contains_key("price"));
        assert!(!record.fields.contains_key("category"));
    }

    #[test]
    fn raw_record_parses_nested_rating() {
        let record: RawRecord =
            serde_json::from_str(r#"{"id": 1, "rating": {"rate": 4.5, "count": 120}}"#)
                .expect("parse");
        let rating = record.rating.expect("rating");
        assert_eq!(rating.rate, Some(4.5));
        assert_eq!(rating.count, Some(120));
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&PipelineStatus::Skipped).expect("serialize"),
            "\"SKIPPED\""
        );
        assert_eq!(PipelineStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn started_result_is_failed_until_proven_otherwise() {
        let result = PipelineResult::started();
        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.records_stored, 0);
        assert!(result.error_message.is_none());
    }
}
