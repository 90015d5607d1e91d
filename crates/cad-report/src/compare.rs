//! Period-over-period comparison of one report series.
//!
//! A snapshot is everything cached for a series on one date: the latest stored
//! copy of each distinct subject, with the findings of every summarized
//! attachment unioned together. A date whose items carry no summarized
//! attachment has no snapshot. The engine only reads the artifact store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use cad_core::{
    ComparisonResult, Finding, FindingKey, PersistingFinding, SeriesKey, Severity, SeverityCounts,
};
use cad_storage::{ArtifactStore, StorageError, SummaryStatus};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::debug;

use crate::normalize::{count_findings, normalize_summary};

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("no snapshot of {series} before {current}")]
    NoPriorData { series: SeriesKey, current: NaiveDate },
    #[error("no snapshot of {series} on {date}")]
    NoData { series: SeriesKey, date: NaiveDate },
    #[error("previous date {previous} is not before {current}")]
    InvalidPrevious { previous: NaiveDate, current: NaiveDate },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<anyhow::Error> for CompareError {
    fn from(err: anyhow::Error) -> Self {
        CompareError::Storage(StorageError::Other(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousDate {
    /// Most recent snapshot strictly before the current date.
    Auto,
    On(NaiveDate),
}

impl fmt::Display for PreviousDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviousDate::Auto => f.write_str("auto"),
            PreviousDate::On(date) => write!(f, "{date}"),
        }
    }
}

impl FromStr for PreviousDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PreviousDate::Auto);
        }
        Ok(PreviousDate::On(NaiveDate::parse_from_str(s, "%Y-%m-%d")?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub findings: BTreeMap<FindingKey, Finding>,
    pub counts: SeverityCounts,
    /// Subjects of the stored items the snapshot was built from.
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComparisonEngine {
    store: ArtifactStore,
}

impl ComparisonEngine {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Dates, ascending, on which the series has a snapshot.
    pub async fn snapshot_dates(&self, series: &SeriesKey) -> Result<Vec<NaiveDate>, CompareError> {
        let mut dates = Vec::new();
        for date in self
            .store
            .list_dates(&series.account_id, &series.group_label)
            .await?
        {
            if self.load_snapshot(series, date).await?.is_some() {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    pub async fn load_snapshot(
        &self,
        series: &SeriesKey,
        date: NaiveDate,
    ) -> Result<Option<Snapshot>, CompareError> {
        let items = self
            .store
            .list_items(&series.account_id, date, &series.group_label)
            .await?;

        // Items come back in stored_at order, so later copies of a subject win.
        let mut latest = BTreeMap::new();
        for (handle, meta) in items {
            if meta.key.report_type == series.report_type {
                latest.insert(meta.subject.clone(), handle);
            }
        }
        if latest.is_empty() {
            return Ok(None);
        }

        let mut findings: BTreeMap<FindingKey, Finding> = BTreeMap::new();
        // Attachments that report their own counts are summed as reported;
        // the rest are counted from their findings.
        let mut explicit_counts = SeverityCounts::new();
        let mut uncounted: BTreeMap<FindingKey, Finding> = BTreeMap::new();
        let mut summarized = false;
        for handle in latest.values() {
            let summaries = match self.store.summaries(handle).await {
                Ok(summaries) => summaries,
                Err(StorageError::NotFound(what)) => {
                    debug!(%what, "item vanished while loading snapshot");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for summary in summaries {
                let Some(value) = summary.summary.filter(|_| summary.status == SummaryStatus::Summarized)
                else {
                    continue;
                };
                summarized = true;
                let normalized = normalize_summary(&value);
                let counted = normalized.severity_counts.is_some();
                for finding in normalized.findings {
                    if !counted {
                        merge_finding(&mut uncounted, finding.clone());
                    }
                    merge_finding(&mut findings, finding);
                }
                for (severity, count) in normalized.severity_counts.unwrap_or_default() {
                    *explicit_counts.entry(severity).or_insert(0) += count;
                }
            }
        }
        if !summarized {
            debug!(%series, %date, "no summarized attachment, not a snapshot");
            return Ok(None);
        }

        let mut counts = explicit_counts;
        for (severity, count) in count_findings(uncounted.values()) {
            *counts.entry(severity).or_insert(0) += count;
        }
        Ok(Some(Snapshot {
            date,
            findings,
            counts,
            subjects: latest.into_keys().collect(),
        }))
    }

    pub async fn resolve_previous(
        &self,
        series: &SeriesKey,
        current: NaiveDate,
        previous: PreviousDate,
    ) -> Result<NaiveDate, CompareError> {
        match previous {
            PreviousDate::On(date) if date >= current => Err(CompareError::InvalidPrevious {
                previous: date,
                current,
            }),
            PreviousDate::On(date) => Ok(date),
            PreviousDate::Auto => self
                .snapshot_dates(series)
                .await?
                .into_iter()
                .filter(|date| *date < current)
                .max()
                .ok_or_else(|| CompareError::NoPriorData {
                    series: series.clone(),
                    current,
                }),
        }
    }

    pub async fn compare(
        &self,
        series: &SeriesKey,
        current_date: NaiveDate,
        previous: PreviousDate,
    ) -> Result<ComparisonResult, CompareError> {
        let current = self
            .load_snapshot(series, current_date)
            .await?
            .ok_or_else(|| CompareError::NoData {
                series: series.clone(),
                date: current_date,
            })?;
        let previous_date = self.resolve_previous(series, current_date, previous).await?;
        let prior = match self.load_snapshot(series, previous_date).await? {
            Some(snapshot) => snapshot,
            None if previous == PreviousDate::Auto => {
                return Err(CompareError::NoPriorData {
                    series: series.clone(),
                    current: current_date,
                })
            }
            None => {
                return Err(CompareError::NoData {
                    series: series.clone(),
                    date: previous_date,
                })
            }
        };

        let mut added: Vec<Finding> = current
            .findings
            .iter()
            .filter(|(key, _)| !prior.findings.contains_key(*key))
            .map(|(_, finding)| finding.clone())
            .collect();
        let mut resolved: Vec<Finding> = prior
            .findings
            .iter()
            .filter(|(key, _)| !current.findings.contains_key(*key))
            .map(|(_, finding)| finding.clone())
            .collect();
        sort_findings(&mut added);
        sort_findings(&mut resolved);

        let continuing: BTreeSet<FindingKey> = current
            .findings
            .keys()
            .filter(|key| prior.findings.contains_key(*key))
            .cloned()
            .collect();
        let first_observed = self
            .first_observed(series, previous_date, &continuing)
            .await?;

        let mut persisting: Vec<PersistingFinding> = continuing
            .iter()
            .filter_map(|key| {
                let finding = current.findings.get(key)?.clone();
                let since = first_observed.get(key).copied().unwrap_or(previous_date);
                Some(PersistingFinding {
                    finding,
                    first_observed: since,
                    age_in_days: (current_date - since).num_days(),
                })
            })
            .collect();
        persisting.sort_by(|a, b| {
            b.age_in_days
                .cmp(&a.age_in_days)
                .then_with(|| a.finding.severity.cmp(&b.finding.severity))
                .then_with(|| a.finding.key.cmp(&b.finding.key))
        });

        Ok(ComparisonResult {
            series: series.clone(),
            current_date,
            previous_date,
            count_deltas: count_deltas(&current.counts, &prior.counts),
            current_counts: current.counts,
            previous_counts: prior.counts,
            added,
            resolved,
            persisting,
        })
    }

    /// Walk backwards from `previous_date` through older snapshots, keeping
    /// each key's earliest date in its unbroken run of appearances. Dates with
    /// no snapshot are not gaps.
    async fn first_observed(
        &self,
        series: &SeriesKey,
        previous_date: NaiveDate,
        keys: &BTreeSet<FindingKey>,
    ) -> Result<BTreeMap<FindingKey, NaiveDate>, CompareError> {
        let mut first: BTreeMap<FindingKey, NaiveDate> =
            keys.iter().map(|key| (key.clone(), previous_date)).collect();
        let mut alive: BTreeSet<FindingKey> = keys.clone();
        if alive.is_empty() {
            return Ok(first);
        }

        let mut older: Vec<NaiveDate> = self
            .snapshot_dates(series)
            .await?
            .into_iter()
            .filter(|date| *date < previous_date)
            .collect();
        older.sort_unstable_by(|a, b| b.cmp(a));

        for date in older {
            let Some(snapshot) = self.load_snapshot(series, date).await? else {
                continue;
            };
            alive.retain(|key| {
                if snapshot.findings.contains_key(key) {
                    first.insert(key.clone(), date);
                    true
                } else {
                    false
                }
            });
            if alive.is_empty() {
                break;
            }
        }
        Ok(first)
    }
}

/// Keeps the most severe copy of a finding seen under more than one attachment.
fn merge_finding(findings: &mut BTreeMap<FindingKey, Finding>, finding: Finding) {
    findings
        .entry(finding.key.clone())
        .and_modify(|existing| existing.severity = existing.severity.min(finding.severity))
        .or_insert(finding);
}

fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.key.cmp(&b.key)));
}

pub fn count_deltas(current: &SeverityCounts, previous: &SeverityCounts) -> BTreeMap<Severity, i64> {
    current
        .keys()
        .chain(previous.keys())
        .copied()
        .collect::<BTreeSet<Severity>>()
        .into_iter()
        .map(|severity| {
            let now = current.get(&severity).copied().unwrap_or(0) as i64;
            let before = previous.get(&severity).copied().unwrap_or(0) as i64;
            (severity, now - before)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_date_parses_auto_and_dates() {
        assert_eq!("auto".parse::<PreviousDate>().unwrap(), PreviousDate::Auto);
        assert_eq!(
            "2026-02-23".parse::<PreviousDate>().unwrap(),
            PreviousDate::On(NaiveDate::from_ymd_opt(2026, 2, 23).unwrap())
        );
        assert!("yesterday".parse::<PreviousDate>().is_err());
    }

    #[test]
    fn deltas_cover_both_sides() {
        let current = BTreeMap::from([(Severity::High, 3), (Severity::Low, 1)]);
        let previous = BTreeMap::from([(Severity::High, 1), (Severity::Medium, 2)]);
        let deltas = count_deltas(&current, &previous);
        assert_eq!(deltas.get(&Severity::High), Some(&2));
        assert_eq!(deltas.get(&Severity::Medium), Some(&-2));
        assert_eq!(deltas.get(&Severity::Low), Some(&1));
    }
}
