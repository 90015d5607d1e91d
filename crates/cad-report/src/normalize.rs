//! Turn free-form summarizer JSON into findings and severity counts.

use std::collections::BTreeMap;

use cad_core::{Finding, FindingKey, Severity, SeverityCounts};
use serde_json::{Map, Value as JsonValue};

const PRODUCT_FIELDS: &[&str] = &["product", "cloud_product", "cloudProduct", "产品", "云产品"];
const CHECK_FIELDS: &[&str] = &["check", "check_name", "checkName", "name", "检查项", "风险项"];
const RESOURCE_FIELDS: &[&str] = &[
    "resource",
    "resource_id",
    "resourceId",
    "instance_id",
    "instanceId",
    "资源",
    "实例ID",
];
const SEVERITY_FIELDS: &[&str] = &["severity", "level", "risk_level", "riskLevel", "风险等级"];
const LIST_FIELDS: &[&str] = &["findings", "risks", "items", "rows"];

/// Findings and counts recovered from one attachment summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedSummary {
    pub findings: Vec<Finding>,
    /// Explicit aggregate counts, when the summary carried them.
    pub severity_counts: Option<SeverityCounts>,
}

pub fn normalize_summary(value: &JsonValue) -> NormalizedSummary {
    match value {
        JsonValue::Array(rows) => NormalizedSummary {
            findings: findings_from_rows(rows),
            severity_counts: None,
        },
        JsonValue::Object(map) => {
            let findings = LIST_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(JsonValue::as_array))
                .map(|rows| findings_from_rows(rows))
                .unwrap_or_default();
            let severity_counts = map
                .get("severity_counts")
                .and_then(JsonValue::as_object)
                .map(counts_from_object);
            NormalizedSummary {
                findings,
                severity_counts,
            }
        }
        _ => NormalizedSummary::default(),
    }
}

fn findings_from_rows(rows: &[JsonValue]) -> Vec<Finding> {
    rows.iter()
        .filter_map(JsonValue::as_object)
        .filter_map(finding_from_object)
        .collect()
}

fn finding_from_object(row: &Map<String, JsonValue>) -> Option<Finding> {
    let product = first_text(row, PRODUCT_FIELDS)?;
    let check = first_text(row, CHECK_FIELDS)?;
    let resource = first_text(row, RESOURCE_FIELDS).unwrap_or_default();
    let severity = first_text(row, SEVERITY_FIELDS)
        .map(|raw| Severity::parse_lenient(&raw))
        .unwrap_or(Severity::Info);
    Some(Finding {
        key: FindingKey::new(product, check, resource),
        severity,
    })
}

fn first_text(row: &Map<String, JsonValue>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match row.get(*field)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn counts_from_object(map: &Map<String, JsonValue>) -> SeverityCounts {
    let mut counts = BTreeMap::new();
    for (label, value) in map {
        let Some(count) = value.as_u64() else {
            continue;
        };
        *counts.entry(Severity::parse_lenient(label)).or_insert(0) += count;
    }
    counts
}

/// Count findings per severity.
pub fn count_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> SeverityCounts {
    let mut counts = BTreeMap::new();
    for finding in findings {
        *counts.entry(finding.severity).or_insert(0) += 1;
    }
    counts
}
