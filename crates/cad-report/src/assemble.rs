//! Markdown digest per account and group, built from cached data only.

use std::collections::BTreeMap;
use std::sync::Arc;

use cad_core::{ComparisonResult, IndexEntry, ReportType, SeriesKey, SeverityCounts};
use cad_storage::{
    ArtifactStore, DocumentBackend, MetadataIndex, NameRegistry, StorageError, SummaryStatus,
};
use chrono::NaiveDate;

use crate::compare::{CompareError, ComparisonEngine, PreviousDate};
use crate::trend::{SeriesTrend, DEFAULT_TREND_WINDOW};

pub const NO_DATA: &str = "_no data for this period_";

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub date: NaiveDate,
    pub account: Option<String>,
    pub group: Option<String>,
    pub compare: bool,
}

pub struct ReportAssembler {
    store: ArtifactStore,
    documents: Arc<dyn DocumentBackend>,
    engine: ComparisonEngine,
}

impl ReportAssembler {
    pub fn new(store: ArtifactStore, documents: Arc<dyn DocumentBackend>) -> Self {
        let engine = ComparisonEngine::new(store.clone());
        Self {
            store,
            documents,
            engine,
        }
    }

    pub async fn assemble(&self, request: &ReportRequest) -> anyhow::Result<String> {
        let index = MetadataIndex::load(Arc::clone(&self.documents)).await?;
        let registry = NameRegistry::load(Arc::clone(&self.documents)).await?;

        let mut lines = vec![
            format!("# Cloud Advisor Digest {}", request.date),
            String::new(),
        ];

        let mut sections: BTreeMap<&str, BTreeMap<(&str, ReportType), Vec<&IndexEntry>>> =
            BTreeMap::new();
        for entry in index.query_by_date(request.date, request.account.as_deref()) {
            if request
                .group
                .as_deref()
                .is_some_and(|group| group != entry.key.group_label)
            {
                continue;
            }
            sections
                .entry(entry.key.account_id.as_str())
                .or_default()
                .entry((entry.key.group_label.as_str(), entry.key.report_type))
                .or_default()
                .push(entry);
        }

        if sections.is_empty() {
            lines.push(NO_DATA.to_string());
            lines.push(String::new());
            return Ok(lines.join("\n"));
        }

        for (account_id, groups) in sections {
            lines.push(format!("## {}", registry.label(account_id)));
            lines.push(String::new());
            for ((group_label, report_type), entries) in groups {
                let series = SeriesKey::new(account_id, report_type, group_label);
                lines.push(format!("### {report_type} / {group_label}"));
                lines.push(String::new());
                for entry in entries {
                    self.push_item(&mut lines, entry).await?;
                }

                match self.engine.load_snapshot(&series, request.date).await {
                    Ok(Some(snapshot)) if !snapshot.counts.is_empty() => {
                        lines.push(format!("- severity: {}", format_counts(&snapshot.counts)));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(err.into()),
                }
                lines.push(String::new());

                if request.compare {
                    lines.push("#### Trend".to_string());
                    lines.push(String::new());
                    match self
                        .engine
                        .compare(&series, request.date, PreviousDate::Auto)
                        .await
                    {
                        Ok(result) => {
                            lines.extend(trend_lines(&result));
                            let trend = self
                                .engine
                                .series_trend(&series, request.date, DEFAULT_TREND_WINDOW)
                                .await?;
                            lines.extend(series_trend_lines(&trend));
                        }
                        Err(CompareError::NoPriorData { .. } | CompareError::NoData { .. }) => {
                            lines.push(NO_DATA.to_string());
                        }
                        Err(err) => return Err(err.into()),
                    }
                    lines.push(String::new());
                }
            }
        }

        Ok(lines.join("\n"))
    }

    async fn push_item(&self, lines: &mut Vec<String>, entry: &IndexEntry) -> anyhow::Result<()> {
        lines.push(format!(
            "- **{}** (received {})",
            entry.subject,
            entry.received_at.format("%Y-%m-%d %H:%M %:z")
        ));
        let Some(handle) = &entry.storage else {
            let fields: Vec<String> = entry
                .degraded
                .iter()
                .map(|f| f.as_str().to_string())
                .collect();
            lines.push(format!("  - not cached ({}): {NO_DATA}", fields.join(", ")));
            return Ok(());
        };

        let item = match self.store.get(handle).await {
            Ok(item) => item,
            Err(StorageError::NotFound(_)) => {
                lines.push(format!("  - {NO_DATA}"));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if item.meta.attachments.is_empty() {
            lines.push("  - no attachments".to_string());
        }
        for attachment in &item.meta.attachments {
            let status = item
                .summaries
                .iter()
                .find(|s| s.filename == attachment.filename)
                .map(|s| s.status)
                .unwrap_or(SummaryStatus::NotSummarized)
                .as_str();
            lines.push(format!(
                "  - attachment `{}` ({} bytes, {status})",
                attachment.filename, attachment.size
            ));
        }
        Ok(())
    }
}

pub fn format_counts(counts: &SeverityCounts) -> String {
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(severity, count)| format!("{severity} {count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn trend_lines(result: &ComparisonResult) -> Vec<String> {
    let mut lines = vec![format!(
        "- compared with {} ({} -> {} findings)",
        result.previous_date,
        result.total_previous(),
        result.total_current()
    )];
    if !result.count_deltas.is_empty() {
        let deltas: Vec<String> = result
            .count_deltas
            .iter()
            .map(|(severity, delta)| format!("{severity} {delta:+}"))
            .collect();
        lines.push(format!("- change: {}", deltas.join(", ")));
    }
    for finding in &result.added {
        lines.push(format!("- new: {} ({})", finding.key, finding.severity));
    }
    for finding in &result.resolved {
        lines.push(format!("- resolved: {} ({})", finding.key, finding.severity));
    }
    for persisting in &result.persisting {
        lines.push(format!(
            "- ongoing: {} ({}, {} days since {})",
            persisting.finding.key,
            persisting.finding.severity,
            persisting.age_in_days,
            persisting.first_observed
        ));
    }
    lines
}

/// Empty when fewer than three snapshots exist; two are already covered by
/// the comparison lines.
fn series_trend_lines(trend: &SeriesTrend) -> Vec<String> {
    if trend.points.len() < 3 {
        return Vec::new();
    }
    let totals: Vec<String> = trend.points.iter().map(|p| p.total.to_string()).collect();
    vec![
        format!(
            "- trend over {} snapshots since {}: {} findings, {:+.1}% ({})",
            trend.points.len(),
            trend.points[0].date,
            totals.join(" -> "),
            trend.change_rate,
            trend.direction
        ),
        format!("- critical/high share: {}", trend.severe_share),
    ]
}

/// Standalone Markdown for one comparison, as printed by `cad compare`.
pub fn render_comparison(result: &ComparisonResult, account_label: &str) -> String {
    let mut lines = vec![
        format!(
            "# {} / {} / {}",
            account_label, result.series.report_type, result.series.group_label
        ),
        String::new(),
        format!("- current: {} ({})", result.current_date, format_counts(&result.current_counts)),
        format!(
            "- previous: {} ({})",
            result.previous_date,
            format_counts(&result.previous_counts)
        ),
    ];
    lines.extend(trend_lines(result).into_iter().skip(1));
    lines.push(String::new());
    lines.join("\n")
}
