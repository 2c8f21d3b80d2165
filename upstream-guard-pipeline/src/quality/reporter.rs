//! Completeness and integrity scoring of upstream payloads.
//!
//! A payload is either a single JSON object (one record) or an array of
//! objects (one record per element). Fields that are absent or `null` count
//! as missing. The completeness score is the weighted share of expected
//! fields present across all records, rounded down.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use upstream_guard_core::{
    FieldTier, IntegrityIssue, IntegrityIssueType, IssueSeverity, QualityReport, SchemaHints,
    SourceReliability,
};

const PRICE_FIELDS: [&str; 5] = ["open", "high", "low", "close", "price"];

/// Stateless scorer; safe to share across threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataQualityReporter;

impl DataQualityReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, payload: &Value, hints: &SchemaHints) -> QualityReport {
        let records = records(payload);
        let mut warnings = Vec::new();

        let missing = missing_fields(&records, hints);
        let score = completeness_score(&records, hints);

        let mut issues = Vec::new();
        for (field, tier) in hints.fields() {
            if tier != FieldTier::Critical {
                continue;
            }
            let absent = records.iter().filter(|r| !is_present(r, field)).count();
            if absent > 0 {
                issues.push(IntegrityIssue::new(
                    IntegrityIssueType::MissingCriticalField,
                    format!(
                        "critical field '{}' missing in {} of {} record(s)",
                        field,
                        absent,
                        records.len()
                    ),
                    IssueSeverity::High,
                ));
            }
        }

        let indexed = matches!(payload, Value::Array(_));
        for (index, record) in records.iter().enumerate() {
            let prefix = if indexed {
                format!("record {}: ", index)
            } else {
                String::new()
            };
            check_record(record, &prefix, &mut issues);
        }

        if records.is_empty() && !hints.is_empty() {
            warnings.push("payload contains no records".to_string());
        }
        if !missing.is_empty() {
            warnings.push(format!("missing fields: {}", missing.join(", ")));
        }

        let reliability = classify(score, missing.len(), &issues);
        QualityReport::new(score, issues, reliability, missing, warnings)
    }

    /// Insert `null` for every expected field a record lacks. Returns the
    /// distinct field names that were filled.
    pub fn fill_missing(&self, payload: &mut Value, hints: &SchemaHints) -> Vec<String> {
        let mut filled = BTreeSet::new();
        let mut fill = |record: &mut Map<String, Value>| {
            for (field, _) in hints.fields() {
                if !record.contains_key(field) {
                    record.insert(field.to_string(), Value::Null);
                    filled.insert(field.to_string());
                }
            }
        };

        match payload {
            Value::Object(record) => fill(record),
            Value::Array(items) => items
                .iter_mut()
                .filter_map(Value::as_object_mut)
                .for_each(fill),
            _ => {}
        }

        filled.into_iter().collect()
    }
}

fn records(payload: &Value) -> Vec<&Map<String, Value>> {
    match payload {
        Value::Object(record) => vec![record],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn is_present(record: &Map<String, Value>, field: &str) -> bool {
    record.get(field).is_some_and(|v| !v.is_null())
}

fn number(record: &Map<String, Value>, field: &str) -> Option<f64> {
    match record.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Weighted share of expected fields present, 0-100, rounded down.
fn completeness_score(records: &[&Map<String, Value>], hints: &SchemaHints) -> u8 {
    let total = hints.total_weight();
    if total <= 0.0 {
        return 100;
    }
    if records.is_empty() {
        return 0;
    }

    let present: f64 = records
        .iter()
        .map(|record| {
            hints
                .fields()
                .filter(|(field, _)| is_present(record, field))
                .map(|(_, tier)| tier.weight())
                .sum::<f64>()
        })
        .sum();

    let ratio = present / (total * records.len() as f64);
    // Nudge before flooring so exact ratios like 0.29 * 100 don't land a point low.
    ((ratio * 100.0) + 1e-9).floor().clamp(0.0, 100.0) as u8
}

fn missing_fields(records: &[&Map<String, Value>], hints: &SchemaHints) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut missing = Vec::new();
    for (field, _) in hints.fields() {
        let absent = records.is_empty() || records.iter().any(|r| !is_present(r, field));
        if absent && seen.insert(field) {
            missing.push(field.to_string());
        }
    }
    missing
}

fn check_record(record: &Map<String, Value>, prefix: &str, issues: &mut Vec<IntegrityIssue>) {
    let high = number(record, "high");
    let low = number(record, "low");
    let close = number(record, "close");

    if let (Some(high), Some(low)) = (high, low) {
        if high < low {
            issues.push(IntegrityIssue::new(
                IntegrityIssueType::HighLessThanLow,
                format!("{}high {} is below low {}", prefix, high, low),
                IssueSeverity::High,
            ));
        } else if let Some(close) = close {
            if close < low || close > high {
                issues.push(IntegrityIssue::new(
                    IntegrityIssueType::CloseOutsideHighLowRange,
                    format!("{}close {} outside range [{}, {}]", prefix, close, low, high),
                    IssueSeverity::Medium,
                ));
            }
        }
    }

    let negative: Vec<&str> = PRICE_FIELDS
        .iter()
        .copied()
        .filter(|field| number(record, field).is_some_and(|v| v < 0.0))
        .collect();
    if !negative.is_empty() {
        issues.push(IntegrityIssue::new(
            IntegrityIssueType::NegativePrice,
            format!("{}negative price in {}", prefix, negative.join(", ")),
            IssueSeverity::High,
        ));
    }

    let volume = number(record, "volume").unwrap_or(0.0);
    let quoted = close.or_else(|| number(record, "price"));
    if volume > 0.0 && quoted == Some(0.0) {
        issues.push(IntegrityIssue::new(
            IntegrityIssueType::ZeroPriceWithPositiveVolume,
            format!("{}zero price with volume {}", prefix, volume),
            IssueSeverity::Medium,
        ));
    }
}

fn classify(score: u8, missing: usize, issues: &[IntegrityIssue]) -> SourceReliability {
    let high_severity = issues.iter().any(|i| i.severity == IssueSeverity::High);
    if score >= 90 && !high_severity {
        SourceReliability::High
    } else if score >= 70 && missing <= 2 && !high_severity {
        SourceReliability::Medium
    } else {
        SourceReliability::Low
    }
}
