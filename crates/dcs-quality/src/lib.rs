//! Schema-drift detection and record-level quality filtering.

use std::collections::HashSet;

use chrono::NaiveDate;
use dcs_core::{CleanRecord, QualityMetrics, RawRecord};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "dcs-quality";

/// Flatten the fields present on one record into dotted names, the shape the
/// required-field list uses (`rating.rate`, `rating.count`). Nested objects
/// flatten recursively; only leaves are reported. An explicit `null` leaf is
/// present: the field arrived, its value is merely unusable, and the quality
/// rules (not the drift probe) reject it.
pub fn flatten_fields(record: &RawRecord) -> HashSet<String> {
    let mut fields = HashSet::new();

    // Typed view, for records assembled in code rather than parsed from a
    // payload (their raw map is empty).
    if record.id.is_some() {
        fields.insert("id".to_string());
    }
    if record.title.is_some() {
        fields.insert("title".to_string());
    }
    if record.category.is_some() {
        fields.insert("category".to_string());
    }
    if record.price.is_some() {
        fields.insert("price".to_string());
    }
    if let Some(rating) = &record.rating {
        if rating.rate.is_some() {
            fields.insert("rating.rate".to_string());
        }
        if rating.count.is_some() {
            fields.insert("rating.count".to_string());
        }
    }
    for (key, value) in &record.fields {
        flatten_value(key, value, &mut fields);
    }

    fields
}

fn flatten_value(prefix: &str, value: &JsonValue, fields: &mut HashSet<String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, nested) in map {
                flatten_value(&format!("{prefix}.{key}"), nested, fields);
            }
        }
        _ => {
            fields.insert(prefix.to_string());
        }
    }
}

/// Structural drift probe: checks that the first record of the batch carries
/// every required field. Cheap by design, it inspects one record and field
/// presence only, not value types or ranges. Returns false (caller aborts)
/// for an empty batch or any missing field.
pub fn validate_schema(records: &[RawRecord], required_fields: &[String]) -> bool {
    let Some(first) = records.first() else {
        error!("schema validation failed: empty catalog response");
        return false;
    };

    let present = flatten_fields(first);
    let missing: Vec<&str> = required_fields
        .iter()
        .map(String::as_str)
        .filter(|field| !present.contains(*field))
        .collect();

    if !missing.is_empty() {
        error!(?missing, "schema validation failed: missing fields");
        return false;
    }

    info!("schema validation passed");
    true
}

/// Apply the quality rules and stamp survivors with `fetch_date`.
///
/// The rules narrow the batch sequentially in a fixed order — price,
/// category, rating, duplicate id — so a record eligible for rejection by
/// more than one rule is counted once, at the first rule that rejects it.
/// Rejection is a normal outcome reported through the metrics; this stage
/// never fails.
pub fn clean(records: &[RawRecord], fetch_date: NaiveDate) -> (Vec<CleanRecord>, QualityMetrics) {
    let mut metrics = QualityMetrics {
        raw_records: records.len() as u64,
        ..Default::default()
    };

    let mut batch: Vec<&RawRecord> = records.iter().collect();

    // Rule 1: price must be present and positive.
    batch.retain(|r| match r.price {
        Some(price) if price > 0.0 => true,
        _ => {
            metrics.invalid_price += 1;
            false
        }
    });

    // Rule 2: category must be present and non-blank.
    batch.retain(|r| match &r.category {
        Some(category) if !category.trim().is_empty() => true,
        _ => {
            metrics.invalid_category += 1;
            false
        }
    });

    // Rule 3: rating rate must be present and within [0, 5].
    batch.retain(|r| match r.rating.as_ref().and_then(|rating| rating.rate) {
        Some(rate) if (0.0..=5.0).contains(&rate) => true,
        _ => {
            metrics.invalid_rating += 1;
            false
        }
    });

    // Rule 4: first-seen-wins within the batch; records without an id
    // compare equal to each other, like the source system.
    let mut seen = HashSet::new();
    batch.retain(|r| {
        if seen.insert(r.id) {
            true
        } else {
            metrics.duplicates_removed += 1;
            false
        }
    });

    let clean: Vec<CleanRecord> = batch
        .into_iter()
        .filter_map(|r| {
            let (category, price, rating_rate) = match (
                &r.category,
                r.price,
                r.rating.as_ref().and_then(|rating| rating.rate),
            ) {
                (Some(category), Some(price), Some(rate)) => (category.clone(), price, rate),
                // Unreachable: the rules above guarantee presence.
                _ => return None,
            };
            Some(CleanRecord {
                id: r.id,
                title: r.title.clone(),
                category,
                price,
                rating_rate,
                rating_count: r.rating.as_ref().and_then(|rating| rating.count),
                fetch_date,
            })
        })
        .collect();

    metrics.clean_records = clean.len() as u64;

    info!(
        clean = metrics.clean_records,
        raw = metrics.raw_records,
        "data cleaning complete"
    );
    if metrics.rejected() > 0 {
        warn!(
            invalid_price = metrics.invalid_price,
            invalid_category = metrics.invalid_category,
            invalid_rating = metrics.invalid_rating,
            duplicates_removed = metrics.duplicates_removed,
            "filtered invalid records"
        );
    }

    (clean, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::Rating;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 23).expect("date")
    }

    fn record(id: i64, price: f64, category: &str, rate: f64) -> RawRecord {
        RawRecord {
            id: Some(id),
            title: Some(format!("item {id}")),
            category: Some(category.to_string()),
            price: Some(price),
            rating: Some(Rating {
                rate: Some(rate),
                count: Some(10),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn required_fields_pass_validation() {
        let required: Vec<String> = ["id", "title", "category", "price", "rating.rate", "rating.count"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let records = vec![record(1, 10.0, "tools", 4.0)];
        assert!(validate_schema(&records, &required));
    }

    #[test]
    fn missing_field_on_first_record_fails_even_if_later_records_have_it() {
        let required = vec!["price".to_string()];
        let mut first = record(1, 10.0, "tools", 4.0);
        first.price = None;
        let records = vec![first, record(2, 5.0, "tools", 3.0)];
        assert!(!validate_schema(&records, &required));
    }

    #[test]
    fn empty_batch_fails_validation() {
        assert!(!validate_schema(&[], &["id".to_string()]));
    }

    #[test]
    fn nested_extra_fields_flatten_with_dots() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"id": 1, "meta": {"source": "feed-a", "batch": {"seq": 9}}, "image": "x.png"}"#,
        )
        .expect("parse");
        let fields = flatten_fields(&raw);
        assert!(fields.contains("id"));
        assert!(fields.contains("image"));
        assert!(fields.contains("meta.source"));
        assert!(fields.contains("meta.batch.seq"));
        assert!(!fields.contains("meta"));
    }

    #[test]
    fn null_required_field_passes_validation_and_is_rejected_downstream() {
        // `"price": null` is a present field with an unusable value, not
        // structural drift: the run proceeds and the price rule drops the
        // record while the rest of the batch survives.
        let required = vec!["id".to_string(), "price".to_string()];
        let records: Vec<RawRecord> = serde_json::from_str(
            r#"[
                {"id": 1, "title": "a", "category": "tools", "price": null,
                 "rating": {"rate": 4.0, "count": 5}},
                {"id": 2, "title": "b", "category": "tools", "price": 9.5,
                 "rating": {"rate": 3.0, "count": 7}}
            ]"#,
        )
        .expect("parse");
        assert!(validate_schema(&records, &required));

        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].id, Some(2));
        assert_eq!(metrics.invalid_price, 1);
    }

    #[test]
    fn nonpositive_and_missing_prices_are_excluded_and_counted() {
        let mut missing_price = record(4, 1.0, "tools", 4.0);
        missing_price.price = None;
        let records = vec![
            record(1, 10.0, "tools", 4.0),
            record(2, 0.0, "tools", 4.0),
            record(3, -2.5, "tools", 4.0),
            missing_price,
        ];
        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 1);
        assert_eq!(metrics.invalid_price, 3);
        assert_eq!(metrics.clean_records, 1);
    }

    #[test]
    fn blank_categories_are_excluded() {
        let records = vec![
            record(1, 10.0, "tools", 4.0),
            record(2, 10.0, "", 4.0),
            record(3, 10.0, "   ", 4.0),
        ];
        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 1);
        assert_eq!(metrics.invalid_category, 2);
    }

    #[test]
    fn rating_bounds_are_a_closed_interval() {
        let mut no_rating = record(5, 10.0, "tools", 4.0);
        no_rating.rating = None;
        let records = vec![
            record(1, 10.0, "tools", 0.0),
            record(2, 10.0, "tools", 5.0),
            record(3, 10.0, "tools", 5.1),
            record(4, 10.0, "tools", -0.1),
            no_rating,
        ];
        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 2);
        assert_eq!(metrics.invalid_rating, 3);
    }

    #[test]
    fn repeated_ids_keep_first_occurrence_only() {
        let records = vec![
            record(1, 10.0, "tools", 4.0),
            record(2, 20.0, "tools", 4.0),
            record(1, 99.0, "other", 1.0),
            record(2, 20.0, "tools", 4.0),
            record(1, 10.0, "tools", 4.0),
        ];
        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 2);
        assert_eq!(metrics.duplicates_removed, 3);
        // First occurrence wins in batch order.
        assert_eq!(clean[0].price, 10.0);
        assert_eq!(clean[0].category, "tools");
    }

    #[test]
    fn records_without_ids_deduplicate_together() {
        let mut a = record(0, 10.0, "tools", 4.0);
        a.id = None;
        let mut b = record(0, 20.0, "other", 3.0);
        b.id = None;
        let (clean, metrics) = clean(&[a, b], day());
        assert_eq!(clean.len(), 1);
        assert_eq!(metrics.duplicates_removed, 1);
    }

    #[test]
    fn rejection_is_attributed_to_the_first_matching_rule() {
        // Invalid price AND blank category AND out-of-range rating: only the
        // price counter moves.
        let bad = record(1, -1.0, "  ", 9.0);
        let (clean, metrics) = clean(&[bad], day());
        assert!(clean.is_empty());
        assert_eq!(metrics.invalid_price, 1);
        assert_eq!(metrics.invalid_category, 0);
        assert_eq!(metrics.invalid_rating, 0);
    }

    #[test]
    fn survivors_are_stamped_with_the_fetch_date() {
        let (clean, _) = clean(&[record(1, 10.0, "tools", 4.0)], day());
        assert_eq!(clean[0].fetch_date, day());
        assert_eq!(clean[0].rating_count, Some(10));
    }

    #[test]
    fn cleaning_matches_reference_batch() {
        let records = vec![
            record(1, 10.0, "a", 4.5),
            record(1, 10.0, "a", 4.5),
            record(2, -5.0, "b", 2.0),
        ];
        let (clean, metrics) = clean(&records, day());
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].id, Some(1));
        assert_eq!(
            metrics,
            QualityMetrics {
                raw_records: 3,
                invalid_price: 1,
                invalid_category: 0,
                invalid_rating: 0,
                duplicates_removed: 1,
                clean_records: 1,
            }
        );
    }
}
