//! Core domain model for Cloud Advisor Digest.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod extract;

pub use extract::{extract, Extraction, ReportTypeRule, ReportTypeRules, RulesError};

pub const CRATE_NAME: &str = "cad-core";

/// Sentinel account id used when no APPID label is present in the body.
pub const UNKNOWN_ACCOUNT: &str = "unknown";

/// Group label used when the subject carries no trailing `-<token>` suffix.
pub const DEFAULT_GROUP: &str = "default";

/// Closed set of advisory report kinds, derived from the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Risk,
    Inspection,
    Capacity,
    Alert,
    #[serde(other)]
    Other,
}

impl ReportType {
    pub const ALL: [ReportType; 5] = [
        ReportType::Risk,
        ReportType::Inspection,
        ReportType::Capacity,
        ReportType::Alert,
        ReportType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::Risk => "risk",
            ReportType::Inspection => "inspection",
            ReportType::Capacity => "capacity",
            ReportType::Alert => "alert",
            ReportType::Other => "other",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown report type `{0}` (expected risk, inspection, capacity, alert or other)")]
pub struct ParseReportTypeError(pub String);

impl FromStr for ReportType {
    type Err = ParseReportTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseReportTypeError(s.to_string()))
    }
}

/// Identifies one report instance independent of where it is stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalKey {
    pub account_id: String,
    pub report_type: ReportType,
    pub group_label: String,
    pub date: NaiveDate,
}

impl LogicalKey {
    pub fn series(&self) -> SeriesKey {
        SeriesKey {
            account_id: self.account_id.clone(),
            report_type: self.report_type,
            group_label: self.group_label.clone(),
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.account_id, self.report_type, self.group_label, self.date
        )
    }
}

/// A logical key without its date: one report series over time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub account_id: String,
    pub report_type: ReportType,
    pub group_label: String,
}

impl SeriesKey {
    pub fn new(
        account_id: impl Into<String>,
        report_type: ReportType,
        group_label: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            report_type,
            group_label: group_label.into(),
        }
    }

    pub fn on(&self, date: NaiveDate) -> LogicalKey {
        LogicalKey {
            account_id: self.account_id.clone(),
            report_type: self.report_type,
            group_label: self.group_label.clone(),
            date,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.report_type, self.group_label)
    }
}

/// Message header as listed by the mail collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub subject: String,
    pub date: DateTime<FixedOffset>,
    #[serde(default)]
    pub has_attachment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One fully retrieved source message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub item_id: String,
    pub subject: String,
    pub received_at: DateTime<FixedOffset>,
    pub has_attachment: bool,
    pub raw_body: String,
    pub attachments: Vec<Attachment>,
}

/// Fields that fell back to a sentinel or could not be retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedField {
    AccountId,
    Body,
    Attachments,
    Storage,
    #[serde(other)]
    Unknown,
}

impl DegradedField {
    pub fn as_str(self) -> &'static str {
        match self {
            DegradedField::AccountId => "account_id",
            DegradedField::Body => "body",
            DegradedField::Attachments => "attachments",
            DegradedField::Storage => "storage",
            DegradedField::Unknown => "unknown",
        }
    }
}

/// Location of one cached item inside the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageHandle {
    pub account_id: String,
    pub date: NaiveDate,
    pub group_label: String,
    pub item_dir: String,
}

impl StorageHandle {
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.account_id)
            .join(self.date.format("%Y-%m-%d").to_string())
            .join(&self.group_label)
            .join(&self.item_dir)
    }
}

/// One row of the metadata index, keyed by provider item id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub item_id: String,
    pub key: LogicalKey,
    pub subject: String,
    pub received_at: DateTime<FixedOffset>,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub storage: Option<StorageHandle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedField>,
    /// Item ids of earlier fetches of the same report that this entry superseded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl IndexEntry {
    pub fn is_degraded(&self) -> bool {
        self.storage.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Lenient parse for the labels advisory summaries use, English or Chinese.
    pub fn parse_lenient(raw: &str) -> Severity {
        let lowered = raw.trim().to_lowercase();
        if lowered.contains("critical") || lowered.contains("严重") || lowered.contains("紧急") {
            Severity::Critical
        } else if lowered.contains("high") || lowered.starts_with('高') {
            Severity::High
        } else if lowered.contains("medium") || lowered.contains("moderate") || lowered.starts_with('中')
        {
            Severity::Medium
        } else if lowered.contains("low") || lowered.starts_with('低') {
            Severity::Low
        } else {
            Severity::Info
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SeverityCounts = BTreeMap<Severity, u64>;

/// Stable identity of a finding across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FindingKey {
    pub product: String,
    pub check: String,
    pub resource: String,
}

impl FindingKey {
    pub fn new(
        product: impl Into<String>,
        check: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            product: product.into(),
            check: check.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for FindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.product, self.check, self.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(flatten)]
    pub key: FindingKey,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistingFinding {
    #[serde(flatten)]
    pub finding: Finding,
    pub first_observed: NaiveDate,
    pub age_in_days: i64,
}

/// Period-over-period diff of one report series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub series: SeriesKey,
    pub current_date: NaiveDate,
    pub previous_date: NaiveDate,
    pub current_counts: SeverityCounts,
    pub previous_counts: SeverityCounts,
    pub count_deltas: BTreeMap<Severity, i64>,
    pub added: Vec<Finding>,
    pub resolved: Vec<Finding>,
    pub persisting: Vec<PersistingFinding>,
}

impl ComparisonResult {
    pub fn total_current(&self) -> u64 {
        self.current_counts.values().sum()
    }

    pub fn total_previous(&self) -> u64 {
        self.previous_counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_type_round_trips_through_str_and_tolerates_unknown_json() {
        assert_eq!("Risk".parse::<ReportType>().unwrap(), ReportType::Risk);
        assert!("weekly".parse::<ReportType>().is_err());

        let parsed: ReportType = serde_json::from_str("\"cost\"").unwrap();
        assert_eq!(parsed, ReportType::Other);
    }

    #[test]
    fn storage_handle_path_is_account_date_group_item() {
        let handle = StorageHandle {
            account_id: "1250000000".into(),
            date: NaiveDate::from_ymd_opt(2026, 2, 25).unwrap(),
            group_label: "arch-nff1ftst".into(),
            item_dir: "4711".into(),
        };
        assert_eq!(
            handle.relative_path(),
            PathBuf::from("1250000000/2026-02-25/arch-nff1ftst/4711")
        );
    }

    #[test]
    fn severity_parse_accepts_chinese_levels() {
        assert_eq!(Severity::parse_lenient("高风险"), Severity::High);
        assert_eq!(Severity::parse_lenient("中风险"), Severity::Medium);
        assert_eq!(Severity::parse_lenient("LOW"), Severity::Low);
        assert_eq!(Severity::parse_lenient("严重"), Severity::Critical);
        assert_eq!(Severity::parse_lenient("n/a"), Severity::Info);
    }

    #[test]
    fn index_entry_ignores_unknown_fields() {
        let json = r#"{
            "item_id": "42",
            "key": {"account_id": "1", "report_type": "risk", "group_label": "default", "date": "2026-02-25"},
            "subject": "s",
            "received_at": "2026-02-25T09:00:00+08:00",
            "cached_at": "2026-02-25T01:05:00Z",
            "storage": null,
            "degraded": ["body", "future_field"],
            "added_in_v9": true
        }"#;
        let entry: IndexEntry = serde_json::from_str(json).unwrap();
        assert!(entry.is_degraded());
        assert_eq!(entry.degraded, vec![DegradedField::Body, DegradedField::Unknown]);
        assert!(entry.aliases.is_empty());
    }
}
