//! Identity extraction: subject/body scraping into a [`LogicalKey`].
//!
//! Everything here is total. Missing fields degrade to sentinels and are
//! reported in [`Extraction::degraded`], never as errors.

use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DegradedField, LogicalKey, ReportType, DEFAULT_GROUP, UNKNOWN_ACCOUNT};

static GROUP_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-([A-Za-z0-9_-]+)$").expect("static group regex"));

static APP_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)APP\s*ID\s*[:：]?\s*(\d+)").expect("static appid regex")
});

static ACCOUNT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:账号名称|账户名称|account\s*name)\s*[:：]?[ \t]*([^\n<]+)")
        .expect("static account name regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTypeRule {
    pub pattern: String,
    pub report_type: ReportType,
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<ReportTypeRule>,
}

/// Ordered subject-pattern table; the first matching pattern decides the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTypeRules {
    rules: Vec<ReportTypeRule>,
}

impl Default for ReportTypeRules {
    fn default() -> Self {
        let table: &[(&str, ReportType)] = &[
            ("风险治理", ReportType::Risk),
            ("架构风险", ReportType::Risk),
            ("risk", ReportType::Risk),
            ("巡检", ReportType::Inspection),
            ("inspection", ReportType::Inspection),
            ("容量", ReportType::Capacity),
            ("负载", ReportType::Capacity),
            ("capacity", ReportType::Capacity),
            ("告警", ReportType::Alert),
            ("警告", ReportType::Alert),
            ("alert", ReportType::Alert),
        ];
        Self::new(
            table
                .iter()
                .map(|(pattern, report_type)| ReportTypeRule {
                    pattern: (*pattern).to_string(),
                    report_type: *report_type,
                })
                .collect(),
        )
    }
}

impl ReportTypeRules {
    pub fn new(rules: Vec<ReportTypeRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|r| !r.pattern.trim().is_empty())
            .map(|r| ReportTypeRule {
                pattern: r.pattern.to_lowercase(),
                report_type: r.report_type,
            })
            .collect();
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RulesError> {
        let file: RulesFile = serde_yaml::from_str(text)?;
        Ok(Self::new(file.rules))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn rules(&self) -> &[ReportTypeRule] {
        &self.rules
    }

    pub fn classify(&self, subject: &str) -> ReportType {
        let subject = subject.to_lowercase();
        self.rules
            .iter()
            .find(|rule| subject.contains(&rule.pattern))
            .map(|rule| rule.report_type)
            .unwrap_or(ReportType::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub key: LogicalKey,
    pub display_name: Option<String>,
    pub degraded: Vec<DegradedField>,
}

/// Derive the logical key and name candidates for one message.
pub fn extract(
    rules: &ReportTypeRules,
    subject: &str,
    body: &str,
    received_at: DateTime<FixedOffset>,
) -> Extraction {
    let mut degraded = Vec::new();
    let account_id = match account_id(body) {
        Some(id) => id,
        None => {
            degraded.push(DegradedField::AccountId);
            UNKNOWN_ACCOUNT.to_string()
        }
    };

    Extraction {
        key: LogicalKey {
            account_id,
            report_type: rules.classify(subject),
            group_label: group_label(subject),
            date: received_at.date_naive(),
        },
        display_name: display_name(body),
        degraded,
    }
}

pub fn group_label(subject: &str) -> String {
    GROUP_SUFFIX
        .captures(subject.trim_end())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_GROUP.to_string())
}

pub fn account_id(body: &str) -> Option<String> {
    APP_ID
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn display_name(body: &str) -> Option<String> {
    ACCOUNT_NAME
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, offset_hours: i32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_hours * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn risk_subject_with_arch_suffix() {
        let rules = ReportTypeRules::default();
        let subject = "【腾讯云智能顾问】云巡检-架构风险治理报告-arch-nff1ftst";
        let body = "尊敬的用户：\nAPPID: 1250000000\n账号名称：生产环境主账号  \n";
        let ext = extract(&rules, subject, body, at(2026, 2, 25, 9, 8));

        assert_eq!(ext.key.report_type, ReportType::Risk);
        assert_eq!(ext.key.group_label, "arch-nff1ftst");
        assert_eq!(ext.key.account_id, "1250000000");
        assert_eq!(ext.key.date, NaiveDate::from_ymd_opt(2026, 2, 25).unwrap());
        assert_eq!(ext.display_name.as_deref(), Some("生产环境主账号"));
        assert!(ext.degraded.is_empty());
    }

    #[test]
    fn no_suffix_falls_back_to_default_group() {
        assert_eq!(group_label("腾讯云智能顾问 容量监测报告"), DEFAULT_GROUP);
        assert_eq!(group_label("容量报告-集群A"), DEFAULT_GROUP);
        assert_eq!(group_label("Capacity report-prod_cluster-2  "), "prod_cluster-2");
    }

    #[test]
    fn classification_is_first_match_and_defaults_to_other() {
        let rules = ReportTypeRules::default();
        assert_eq!(rules.classify("智能巡检日报"), ReportType::Inspection);
        assert_eq!(rules.classify("CAPACITY weekly"), ReportType::Capacity);
        assert_eq!(rules.classify("告警通知"), ReportType::Alert);
        assert_eq!(rules.classify("架构风险巡检"), ReportType::Risk);
        assert_eq!(rules.classify("账单通知"), ReportType::Other);
    }

    #[test]
    fn missing_fields_degrade_to_sentinels() {
        let rules = ReportTypeRules::default();
        let ext = extract(&rules, "hello", "", at(2026, 2, 20, 23, 0));
        assert_eq!(ext.key.account_id, UNKNOWN_ACCOUNT);
        assert_eq!(ext.key.report_type, ReportType::Other);
        assert_eq!(ext.key.group_label, DEFAULT_GROUP);
        assert_eq!(ext.display_name, None);
        assert_eq!(ext.degraded, vec![DegradedField::AccountId]);
    }

    #[test]
    fn date_uses_sender_local_calendar() {
        let rules = ReportTypeRules::default();
        // 2026-02-24T17:00Z is already the 25th in UTC+8.
        let received = at(2026, 2, 25, 1, 8);
        let ext = extract(&rules, "x", "APPID 7", received);
        assert_eq!(ext.key.date, NaiveDate::from_ymd_opt(2026, 2, 25).unwrap());
    }

    #[test]
    fn display_name_stops_at_tag() {
        let body = "<td>Account Name: Shop Prod</td><td>APPID:99</td>";
        assert_eq!(display_name(body).as_deref(), Some("Shop Prod"));
        assert_eq!(account_id(body).as_deref(), Some("99"));
        assert_eq!(display_name("账号名称：   \n"), None);
    }

    #[test]
    fn rules_load_from_yaml_in_order() {
        let yaml = r#"
version: 1
rules:
  - pattern: "Cost"
    report_type: other
  - pattern: "health"
    report_type: inspection
"#;
        let rules = ReportTypeRules::from_yaml_str(yaml).unwrap();
        assert_eq!(rules.rules().len(), 2);
        assert_eq!(rules.classify("Weekly Health Check"), ReportType::Inspection);
        assert_eq!(rules.classify("risk"), ReportType::Other);
    }
}
